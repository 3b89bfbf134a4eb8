//! The process-wide module registry.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use coretrace_common::{Arch, Backend, ByteView};
use coretrace_dwarf::DwarfOpts;
use coretrace_unwind::{
    backtrace, Backtrace, FrameState, Memory, ModuleCfi, ThreadState, UnwindSpace,
};

use crate::corefile::CoreImage;
use crate::error::{ModuleError, ModuleErrorKind};
use crate::filecache::FileCache;
use crate::lookup::{DefaultLookup, FileLookup};
use crate::module::{Module, ModuleFile};
use crate::procmaps::{merge_maps, MapEntry};
use crate::symbols::SymbolInfo;

/// Options for constructing a [`Registry`].
pub struct RegistryOpts {
    /// DWARF session options applied to every module.
    pub dwarf: DwarfOpts,
    /// The file lookup callbacks.
    pub lookup: Arc<dyn FileLookup>,
}

impl Default for RegistryOpts {
    fn default() -> Self {
        RegistryOpts {
            dwarf: DwarfOpts::default(),
            lookup: Arc::new(DefaultLookup::new(crate::lookup::DebuginfoPath::from_env())),
        }
    }
}

impl fmt::Debug for RegistryOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryOpts")
            .field("dwarf", &self.dwarf)
            .finish()
    }
}

/// The catalog of a target's loaded modules.
///
/// Built once during a reporting phase (from `/proc/<pid>/maps` or from a
/// core dump), then queried read-only: module ranges never overlap, and a
/// module lives until the registry is dropped. Lazy per-module loads
/// (debug pairing, symbol tables, DWARF sessions) happen behind the
/// modules' own caches.
pub struct Registry {
    arch: Arch,
    backend: Option<&'static Backend>,
    opts: DwarfOpts,
    lookup: Arc<dyn FileLookup>,
    cache: FileCache,
    // Sorted by low address.
    modules: Vec<Module>,
    entry_point: Option<u64>,
    core: Option<CoreImage>,
}

impl Registry {
    /// Creates an empty registry for manual reporting.
    pub fn new(arch: Arch, opts: RegistryOpts) -> Self {
        Registry {
            arch,
            backend: Backend::for_arch(arch),
            opts: opts.dwarf,
            lookup: opts.lookup,
            cache: FileCache::new(),
            modules: Vec::new(),
            entry_point: None,
            core: None,
        }
    }

    /// Builds the registry of a live process from its `/proc` maps.
    ///
    /// The process should be stopped (see the attach support in the
    /// unwinding layer) or the maps may be stale by the time they are
    /// used.
    pub fn from_pid(pid: i32, opts: RegistryOpts) -> Result<Registry, ModuleError> {
        let maps = fs::read_to_string(format!("/proc/{pid}/maps"))?;
        Self::from_maps_text(&maps, opts)
    }

    /// Builds a registry from the text of a maps file.
    pub fn from_maps_text(maps: &str, opts: RegistryOpts) -> Result<Registry, ModuleError> {
        let entries = MapEntry::parse_all(maps)?;
        let merged = merge_maps(&entries);

        let mut registry = Registry::new(Arch::Unknown, opts);

        for map in &merged {
            let file = match ModuleFile::open(&registry.cache, Path::new(&map.path)) {
                Ok(file) => Some(file),
                Err(err) => {
                    // A module without a readable backing file still gets
                    // reported; symbol and DWARF lookups degrade.
                    warn!(path = %map.path, error = %err, "cannot open mapped file");
                    None
                }
            };

            if registry.arch == Arch::Unknown {
                if let Some(file) = &file {
                    registry.set_arch(file.object().arch());
                }
            }

            let bias = match &file {
                Some(file) => map.base.wrapping_sub(file.object().load_address()),
                None => map.base,
            };

            // The first executable mapping belongs to the main program;
            // its entry point seeds the bottom-of-stack heuristic.
            if registry.entry_point.is_none() {
                if let Some(file) = &file {
                    let entry = file.object().entry();
                    if entry != 0 {
                        registry.entry_point = Some(entry.wrapping_add(bias));
                    }
                }
            }

            let module = Module::new(
                map.path.clone(),
                map.low,
                map.high,
                bias,
                registry.backend,
                registry.opts,
                file,
            );
            registry.report(module);
        }

        debug!(modules = registry.modules.len(), "registry from maps ready");
        Ok(registry)
    }

    /// Builds a registry from a core dump on disk.
    pub fn from_core_path(path: &Path, opts: RegistryOpts) -> Result<Registry, ModuleError> {
        let core = CoreImage::open(path)?;
        Self::from_core(core, opts)
    }

    /// Builds a registry from a parsed core image.
    pub fn from_core(core: CoreImage, opts: RegistryOpts) -> Result<Registry, ModuleError> {
        let mut registry = Registry::new(core.arch(), opts);
        registry.entry_point = core.entry_point();

        for recovered in core.reconstruct() {
            // Prefer the image contained in the core itself; otherwise
            // look for the real file on disk, verifying its identity.
            let mut file = recovered
                .image
                .as_ref()
                .and_then(|image| {
                    ModuleFile::from_view(
                        PathBuf::from(&recovered.name),
                        Arc::new(ByteView::from_vec(image.clone())),
                    )
                    .ok()
                });

            if file.is_none() && !recovered.name.is_empty() {
                file = registry
                    .lookup
                    .find_elf(&recovered.name, recovered.build_id.as_ref())
                    .and_then(|path| ModuleFile::open(&registry.cache, &path).ok());

                if let (Some(found), Some(wanted)) = (&file, &recovered.build_id) {
                    let matches = found
                        .object()
                        .build_id()
                        .map_or(true, |id| id == wanted.bytes());
                    if !matches {
                        warn!(module = %recovered.name, "on-disk file has different build id");
                        file = None;
                    }
                }
            }

            // Ranges known only from the link map are completed from the
            // on-disk file's load segments.
            let (low, high) = if recovered.low == recovered.high {
                match file.as_ref().and_then(|file| file.object().load_span()) {
                    Some((start, end)) => (
                        start.wrapping_add(recovered.bias),
                        end.wrapping_add(recovered.bias),
                    ),
                    None => {
                        warn!(module = %recovered.name, "dropping module with unknown extent");
                        continue;
                    }
                }
            } else {
                (recovered.low, recovered.high)
            };

            let module = Module::new(
                if recovered.name.is_empty() {
                    "[main]".to_owned()
                } else {
                    recovered.name.clone()
                },
                low,
                high,
                recovered.bias,
                registry.backend,
                registry.opts,
                file,
            );
            if let Some(build_id) = recovered.build_id {
                module.set_build_id(build_id);
            }

            if recovered.is_main && registry.entry_point.is_none() {
                if let Some(file) = module.main_file() {
                    let entry = file.object().entry();
                    if entry != 0 {
                        registry.entry_point = Some(entry.wrapping_add(recovered.bias));
                    }
                }
            }

            registry.report(module);
        }

        debug!(modules = registry.modules.len(), "registry from core ready");
        registry.core = Some(core);
        Ok(registry)
    }

    fn set_arch(&mut self, arch: Arch) {
        self.arch = arch;
        self.backend = Backend::for_arch(arch);
    }

    /// Reports one module into the registry.
    ///
    /// A module overlapping an already-reported range violates the
    /// registry invariant and is dropped with a warning.
    pub fn report(&mut self, module: Module) {
        let (low, high) = module.range();
        let index = self.modules.partition_point(|other| other.range().0 < low);

        let overlaps_prev = index
            .checked_sub(1)
            .and_then(|prev| self.modules.get(prev))
            .map_or(false, |prev| prev.range().1 > low);
        let overlaps_next = self
            .modules
            .get(index)
            .map_or(false, |next| next.range().0 < high);

        if overlaps_prev || overlaps_next {
            warn!(
                module = module.name(),
                low, high, "dropping module overlapping an existing range"
            );
            return;
        }

        self.modules.insert(index, module);
    }

    /// The target's architecture.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The architecture backend, when one exists.
    pub fn backend(&self) -> Option<&'static Backend> {
        self.backend
    }

    /// All modules, ordered by address.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// The core image behind a core-file registry.
    pub fn core(&self) -> Option<&CoreImage> {
        self.core.as_ref()
    }

    /// The thread register snapshots of a core-file registry.
    pub fn threads(&self) -> &[ThreadState] {
        self.core.as_ref().map_or(&[], |core| core.threads())
    }

    /// The runtime entry point of the main program, if known.
    pub fn entry_point(&self) -> Option<u64> {
        self.entry_point
    }

    /// Finds the module covering a runtime address.
    pub fn module_at(&self, addr: u64) -> Option<&Module> {
        let index = self
            .modules
            .partition_point(|module| module.range().0 <= addr);
        let module = self.modules.get(index.checked_sub(1)?)?;
        module.contains(addr).then_some(module)
    }

    /// Resolves a runtime address to its module and symbol.
    pub fn find_symbol(&self, addr: u64) -> Result<SymbolInfo, ModuleError> {
        let module = self.module_at(addr).ok_or(ModuleErrorKind::NoModule)?;
        let file_addr = module.file_address(addr);

        // A missing symbol table degrades to module-relative info.
        let symbol = module
            .symbols()
            .ok()
            .and_then(|table| table.lookup(file_addr));

        Ok(SymbolInfo {
            module: module.name().to_owned(),
            symbol: symbol.map(|symbol| symbol.name.to_string()),
            offset: symbol
                .map(|symbol| file_addr - symbol.value)
                .unwrap_or(file_addr),
            file_address: file_addr,
        })
    }

    /// Resolves a runtime address to a source file, line and column.
    pub fn source_location(
        &self,
        addr: u64,
    ) -> Result<Option<(String, u64, u64)>, ModuleError> {
        let module = self.module_at(addr).ok_or(ModuleErrorKind::NoModule)?;
        module.source_location(&*self.lookup, &self.cache, module.file_address(addr))
    }

    /// Walks a stack with this registry providing the modules.
    pub fn backtrace<M: Memory + ?Sized>(
        &self,
        memory: &M,
        initial: FrameState,
        max_frames: usize,
    ) -> Backtrace {
        backtrace(self, memory, initial, max_frames)
    }

    /// The lookup callbacks of this registry.
    pub fn lookup(&self) -> &dyn FileLookup {
        &*self.lookup
    }

    /// The shared file cache of this registry.
    pub fn file_cache(&self) -> &FileCache {
        &self.cache
    }
}

impl UnwindSpace for Registry {
    fn cfi_for_pc(&self, pc: u64) -> Option<ModuleCfi<'_>> {
        let module = self.module_at(pc)?;
        // Make the paired debug file's .debug_frame reachable before the
        // tables are collected.
        let _ = module.debug_file(&*self.lookup, &self.cache);
        let (eh_frame, debug_frame) = module.cfi();
        if eh_frame.is_none() && debug_frame.is_none() {
            return None;
        }
        Some(ModuleCfi {
            eh_frame,
            debug_frame,
            bias: module.bias(),
        })
    }

    fn is_entry_pc(&self, pc: u64) -> bool {
        let Some(entry) = self.entry_point else {
            return false;
        };
        if pc < entry {
            return false;
        }
        let Some(module) = self.module_at(pc) else {
            return false;
        };

        // The entry function is size-less; the address belongs to it when
        // the covering symbol is the one at e_entry.
        let file_addr = module.file_address(pc);
        let entry_file = module.file_address(entry);
        match module.symbols().ok().and_then(|table| table.lookup(file_addr)) {
            Some(symbol) => {
                symbol.value == entry_file
                    && (symbol.size == 0 || file_addr < symbol.value + symbol.size)
            }
            // Without symbols, proximity to the entry point decides.
            None => pc.wrapping_sub(entry) < 0x100,
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("arch", &self.arch)
            .field("modules", &self.modules)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}
