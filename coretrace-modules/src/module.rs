//! One loaded module and its backing files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use coretrace_cfi::{CfiSection, CfiTable};
use coretrace_common::{Backend, ByteView, SelfCell};
use coretrace_dwarf::{DwarfInfo, DwarfOpts, Endian};

use crate::error::{ModuleError, ModuleErrorKind};
use crate::filecache::FileCache;
use crate::lookup::{BuildId, FileLookup};
use crate::object::ElfObject;
use crate::symbols::SymbolTable;

type ObjectCell = SelfCell<Arc<ByteView<'static>>, ElfObject<'static>>;
type DwarfCell = SelfCell<Arc<ByteView<'static>>, DwarfInfo<'static>>;
type CfiCell = SelfCell<ByteView<'static>, CfiTable<'static>>;

/// One opened object file: its bytes and the structures parsed from them.
///
/// All derived structures (the parsed ELF, the DWARF session, the CFI
/// tables) live next to the mapping they borrow from; the file cache may
/// share one mapping between many module files.
pub struct ModuleFile {
    path: PathBuf,
    object: ObjectCell,
    dwarf: OnceCell<Result<DwarfCell, ModuleErrorKind>>,
    eh_frame: OnceCell<Option<CfiCell>>,
    debug_frame: OnceCell<Option<CfiCell>>,
}

impl ModuleFile {
    /// Opens a file through the shared cache and parses it.
    pub fn open(cache: &FileCache, path: &Path) -> Result<Arc<ModuleFile>, ModuleError> {
        let view = cache.open(path)?;
        Self::from_view(path.to_path_buf(), view)
    }

    /// Wraps an already-mapped view.
    pub fn from_view(
        path: PathBuf,
        view: Arc<ByteView<'static>>,
    ) -> Result<Arc<ModuleFile>, ModuleError> {
        let object = SelfCell::try_new(view, |data| {
            ElfObject::parse(unsafe { (*data).as_slice() })
        })?;
        Ok(Arc::new(ModuleFile {
            path,
            object,
            dwarf: OnceCell::new(),
            eh_frame: OnceCell::new(),
            debug_frame: OnceCell::new(),
        }))
    }

    /// The path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed object.
    pub fn object(&self) -> &ElfObject<'_> {
        self.object.get()
    }

    /// The DWARF session of this file, created lazily.
    ///
    /// The outcome is memoized either way; a file without (or with
    /// corrupt) debug sections fails once and stays failed.
    pub fn dwarf(
        &self,
        backend: Option<&'static Backend>,
        opts: DwarfOpts,
    ) -> Result<&DwarfInfo<'_>, ModuleError> {
        let cell = self.dwarf.get_or_init(|| {
            if !self.object().has_debug_info() {
                return Err(ModuleErrorKind::NoDebugInfo);
            }
            SelfCell::try_new(Arc::clone(self.object.owner()), |data| {
                let object = ElfObject::parse(unsafe { (*data).as_slice() })
                    .map_err(|err| err.kind())?;
                Ok(DwarfInfo::parse(&object, backend, opts))
            })
        });
        match cell {
            Ok(cell) => Ok(cell.get()),
            Err(kind) => Err((*kind).into()),
        }
    }

    /// The `.eh_frame` unwind table of this file, if the section exists.
    pub fn eh_frame_table(&self, backend: Option<&'static Backend>) -> Option<&CfiTable<'_>> {
        let cell = self.eh_frame.get_or_init(|| {
            let section = self.object().section("eh_frame")?;
            let address = section.address;
            let endian = self.object().endian();
            let address_size = self.object().address_size();
            let data = ByteView::from_vec(section.data.into_owned());
            Some(SelfCell::new(data, |bytes| {
                CfiTable::new(
                    CfiSection::eh_frame(unsafe { &*bytes }, endian, address_size, address),
                    backend,
                )
            }))
        });
        cell.as_ref().map(|cell| cell.get())
    }

    /// The `.debug_frame` unwind table of this file, if the section
    /// exists.
    pub fn debug_frame_table(&self, backend: Option<&'static Backend>) -> Option<&CfiTable<'_>> {
        let cell = self.debug_frame.get_or_init(|| {
            let section = self.object().section("debug_frame")?;
            let endian = self.object().endian();
            let address_size = self.object().address_size();
            let data = ByteView::from_vec(section.data.into_owned());
            Some(SelfCell::new(data, |bytes| {
                CfiTable::new(
                    CfiSection::debug_frame(unsafe { &*bytes }, endian, address_size),
                    backend,
                )
            }))
        });
        cell.as_ref().map(|cell| cell.get())
    }
}

impl fmt::Debug for ModuleFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFile")
            .field("path", &self.path)
            .field("object", self.object())
            .finish()
    }
}

/// One loaded object in the target address space.
///
/// Modules are created during the registry's reporting phase and stay
/// immutable afterwards, except for the lazy caches: the debug-file
/// pairing, the symbol table and the build id, each of which records its
/// failure as well as its success so nothing is retried.
pub struct Module {
    name: String,
    low: u64,
    high: u64,
    bias: u64,
    backend: Option<&'static Backend>,
    opts: DwarfOpts,
    main_file: Option<Arc<ModuleFile>>,
    build_id: OnceCell<Option<BuildId>>,
    debug_file: OnceCell<Result<Arc<ModuleFile>, ModuleErrorKind>>,
    symtab: OnceCell<Result<SymbolTable, ModuleErrorKind>>,
}

impl Module {
    /// Creates a module record.
    pub fn new(
        name: impl Into<String>,
        low: u64,
        high: u64,
        bias: u64,
        backend: Option<&'static Backend>,
        opts: DwarfOpts,
        main_file: Option<Arc<ModuleFile>>,
    ) -> Self {
        Module {
            name: name.into(),
            low,
            high,
            bias,
            backend,
            opts,
            main_file,
            build_id: OnceCell::new(),
            debug_file: OnceCell::new(),
            symtab: OnceCell::new(),
        }
    }

    /// The module's name (usually the path it was mapped from).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runtime address range `[low, high)`.
    pub fn range(&self) -> (u64, u64) {
        (self.low, self.high)
    }

    /// The additive offset from file addresses to runtime addresses.
    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// Whether the runtime address falls into this module.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.low && addr < self.high
    }

    /// The main backing file, when one was found.
    pub fn main_file(&self) -> Option<&Arc<ModuleFile>> {
        self.main_file.as_ref()
    }

    /// Installs a build id observed externally (from a core dump note).
    ///
    /// Once a build id is recorded it is never overwritten; a second
    /// report is ignored.
    pub fn set_build_id(&self, build_id: BuildId) {
        let _ = self.build_id.set(Some(build_id));
    }

    /// The module's build id, from an external report or the main file.
    pub fn build_id(&self) -> Option<&BuildId> {
        self.build_id
            .get_or_init(|| {
                let file = self.main_file.as_ref()?;
                file.object().build_id().map(BuildId::new)
            })
            .as_ref()
    }

    /// The file carrying this module's DWARF data.
    ///
    /// Tried in order: DWARF in the main file, a build-id located debug
    /// file, a `.gnu_debuglink` located one. The first failure is cached
    /// and not retried.
    pub fn debug_file(
        &self,
        lookup: &dyn FileLookup,
        cache: &FileCache,
    ) -> Result<&Arc<ModuleFile>, ModuleError> {
        let result = self.debug_file.get_or_init(|| {
            if let Some(main) = &self.main_file {
                if main.object().has_debug_info() {
                    return Ok(Arc::clone(main));
                }
            }

            let main_path = self.main_file.as_ref().map(|file| file.path());
            let debug_link = self
                .main_file
                .as_ref()
                .and_then(|file| file.object().debug_link());

            let found = lookup.find_debuginfo(
                main_path,
                self.build_id(),
                debug_link.map(|link| (link.filename, link.crc)),
            );

            let Some(path) = found else {
                debug!(module = %self.name, "no debug info found");
                return Err(ModuleErrorKind::NoDebugInfo);
            };

            let file = ModuleFile::open(cache, &path).map_err(|err| err.kind())?;
            if !file.object().has_debug_info() {
                return Err(ModuleErrorKind::NoDebugInfo);
            }
            debug!(module = %self.name, debug = %path.display(), "paired debug file");
            Ok(file)
        });

        match result {
            Ok(file) => Ok(file),
            Err(kind) => Err((*kind).into()),
        }
    }

    /// The DWARF session for this module.
    pub fn dwarf(
        &self,
        lookup: &dyn FileLookup,
        cache: &FileCache,
    ) -> Result<&DwarfInfo<'_>, ModuleError> {
        let file = self.debug_file(lookup, cache)?;
        file.dwarf(self.backend, self.opts)
    }

    /// The unwind tables of this module: `.eh_frame` and `.debug_frame`.
    ///
    /// `.eh_frame` only ever lives in the main file; `.debug_frame` may
    /// live in the main file or in separate debug info, which is only
    /// consulted when the pairing already happened (this accessor never
    /// triggers I/O).
    pub fn cfi(&self) -> (Option<&CfiTable<'_>>, Option<&CfiTable<'_>>) {
        let main = self.main_file.as_ref();
        let eh_frame = main.and_then(|file| file.eh_frame_table(self.backend));
        let debug_frame = main
            .and_then(|file| file.debug_frame_table(self.backend))
            .or_else(|| {
                let paired = self.debug_file.get()?.as_ref().ok()?;
                paired.debug_frame_table(self.backend)
            });
        (eh_frame, debug_frame)
    }

    /// The symbol table of this module.
    ///
    /// Prefers the main file's `.symtab`; a stripped main file falls back
    /// to its dynamic symbols and, failing that, to the debug file if one
    /// was already paired.
    pub fn symbols(&self) -> Result<&SymbolTable, ModuleError> {
        let result = self.symtab.get_or_init(|| {
            let from_main = self
                .main_file
                .as_ref()
                .ok_or(ModuleErrorKind::NoSymbols)
                .and_then(|file| {
                    SymbolTable::from_object(file.object(), self.backend)
                        .map_err(|err| err.kind())
                });
            match from_main {
                Ok(table) => Ok(table),
                Err(kind) => {
                    if let Some(Ok(debug)) = self.debug_file.get() {
                        if let Ok(table) = SymbolTable::from_object(debug.object(), self.backend)
                        {
                            return Ok(table);
                        }
                    }
                    warn!(module = %self.name, "no usable symbol table");
                    Err(kind)
                }
            }
        });

        match result {
            Ok(table) => Ok(table),
            Err(kind) => Err((*kind).into()),
        }
    }

    /// Translates a runtime address into this module's file addresses.
    pub fn file_address(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.bias)
    }

    /// The architecture backend of this module.
    pub fn backend(&self) -> Option<&'static Backend> {
        self.backend
    }

    /// The byte order of the module's main file, defaulting to little
    /// endian when no file is available.
    pub fn endian(&self) -> Endian {
        self.main_file
            .as_ref()
            .map(|file| file.object().endian())
            .unwrap_or(Endian::Little)
    }

    /// Finds the source file and line for a file address.
    ///
    /// Walks the unit headers until one's line table covers the address;
    /// returns the composed path and the line/column of the matching row.
    pub fn source_location(
        &self,
        lookup: &dyn FileLookup,
        cache: &FileCache,
        file_addr: u64,
    ) -> Result<Option<(String, u64, u64)>, ModuleError> {
        let info = self.dwarf(lookup, cache)?;

        for (unit, root) in info.units()? {
            let offset = match root.attr_value(coretrace_dwarf::constants::DW_AT_stmt_list)? {
                Some(coretrace_dwarf::AttributeValue::SecOffset { offset, .. }) => offset,
                _ => continue,
            };
            let table = match info.line_table(unit, offset) {
                Ok(table) => table,
                Err(err) => {
                    warn!(unit = unit.offset, error = %err, "skipping bad line table");
                    continue;
                }
            };
            let Ok(row) = table.lookup(None, file_addr) else {
                continue;
            };

            let path = match table.file(row) {
                Some((dir, entry)) => {
                    let name = String::from_utf8_lossy(&entry.name);
                    if dir.is_empty() || name.starts_with('/') {
                        name.into_owned()
                    } else {
                        format!("{}/{}", String::from_utf8_lossy(dir), name)
                    }
                }
                None => continue,
            };
            return Ok(Some((path, row.line, row.column)));
        }

        Ok(None)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("range", &format_args!("{:#x}..{:#x}", self.low, self.high))
            .field("bias", &format_args!("{:#x}", self.bias))
            .field("has_main", &self.main_file.is_some())
            .finish()
    }
}
