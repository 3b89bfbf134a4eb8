//! Module reconstruction from core dumps.
//!
//! A core file records the crashed process's memory in `PT_LOAD` segments
//! and its register state in notes. No list of loaded objects survives
//! directly; it is rebuilt from two directions:
//!
//!  1. Every load segment that starts with an ELF header is a module
//!     candidate. Its program headers, build-ID note and dynamic section
//!     are parsed *out of the core's snapshot of the mapped memory*.
//!  2. The dynamic linker's `r_debug` structure, found through the main
//!     executable's `DT_DEBUG` entry, provides the authoritative name and
//!     load base per shared object via its `r_map` linked list.
//!
//! Both sources are merged; names come from the link map, ranges and
//! build ids from the headers.

use std::path::Path;
use std::sync::Arc;

use goblin::container::{Container, Ctx};
use goblin::elf;
use goblin::elf::program_header::{PT_DYNAMIC, PT_LOAD, PT_NOTE};
use tracing::{debug, trace, warn};

use coretrace_common::{Arch, Backend, ByteView};
use coretrace_dwarf::Endian;
use coretrace_unwind::{state_from_prstatus, Memory, ThreadState, NT_PRSTATUS};

use crate::error::{ModuleError, ModuleErrorKind};
use crate::lookup::BuildId;
use crate::object::ElfObject;

/// `d_tag` values the reconstruction needs.
const DT_NULL: u64 = 0;
const DT_STRTAB: u64 = 5;
const DT_SONAME: u64 = 14;
const DT_DEBUG: u64 = 21;
const DT_STRSZ: u64 = 10;

/// `a_type` of the program entry point in the auxiliary vector.
const AT_ENTRY: u64 = 9;
/// The auxv note type.
const NT_AUXV: u32 = 6;

// A sanity cap on the r_map walk for corrupt or cyclic lists.
const MAX_LINK_MAP: usize = 4096;

#[derive(Clone, Copy, Debug)]
struct LoadSegment {
    vaddr: u64,
    memsz: u64,
    offset: u64,
    filesz: u64,
}

/// One module candidate recovered from a core file.
#[derive(Debug)]
pub(crate) struct CoreModule {
    /// The best known name, possibly empty for the main executable.
    pub name: String,
    /// Runtime address range.
    pub low: u64,
    /// One past the highest mapped address.
    pub high: u64,
    /// Additive offset from file to runtime addresses.
    pub bias: u64,
    /// The build id found in mapped memory, if any.
    pub build_id: Option<BuildId>,
    /// The full file image copied out of the core, when it is contained.
    pub image: Option<Vec<u8>>,
    /// Whether this candidate is the main executable.
    pub is_main: bool,
}

/// A parsed core dump.
pub struct CoreImage {
    view: Arc<ByteView<'static>>,
    segments: Vec<LoadSegment>,
    arch: Arch,
    endian: Endian,
    address_size: u8,
    threads: Vec<ThreadState>,
    entry: Option<u64>,
}

impl CoreImage {
    /// Opens and parses a core file.
    pub fn open(path: &Path) -> Result<CoreImage, ModuleError> {
        let view = Arc::new(ByteView::open(path)?);
        Self::from_view(view)
    }

    /// Parses an already-mapped core file.
    pub fn from_view(view: Arc<ByteView<'static>>) -> Result<CoreImage, ModuleError> {
        let object = ElfObject::parse(&view)?;
        if !object.is_core() {
            return Err(ModuleErrorKind::BadCore.into());
        }

        let arch = object.arch();
        let endian = object.endian();
        let address_size = object.address_size();
        let backend = Backend::for_arch(arch);

        let segments = object
            .program_headers()
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| LoadSegment {
                vaddr: phdr.p_vaddr,
                memsz: phdr.p_memsz,
                offset: phdr.p_offset,
                filesz: phdr.p_filesz,
            })
            .collect();

        let mut threads = Vec::new();
        let mut entry = None;
        if let Some(notes) = object.elf().iter_note_headers(object.data()) {
            for note in notes.flatten() {
                if note.n_type == NT_PRSTATUS {
                    if let Some(backend) = backend {
                        match state_from_prstatus(note.desc, endian, backend) {
                            Some(thread) => threads.push(thread),
                            None => warn!("undecodable NT_PRSTATUS note"),
                        }
                    }
                } else if note.n_type == NT_AUXV {
                    entry = entry.or_else(|| parse_auxv_entry(note.desc, endian, address_size));
                }
            }
        }

        debug!(
            segments = object.program_headers().len(),
            threads = threads.len(),
            "core file parsed"
        );

        Ok(CoreImage {
            view,
            segments,
            arch,
            endian,
            address_size,
            threads,
            entry,
        })
    }

    /// The architecture recorded in the core header.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The byte order of the core.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The register snapshots of all threads, from `NT_PRSTATUS` notes.
    pub fn threads(&self) -> &[ThreadState] {
        &self.threads
    }

    /// The program entry point from the auxiliary vector, if present.
    pub fn entry_point(&self) -> Option<u64> {
        self.entry
    }

    /// Reads `len` bytes of target memory from the core's snapshot.
    ///
    /// Reads crossing the file-backed part of a segment fail; the core
    /// only dumped what the kernel chose to keep.
    pub fn read_bytes(&self, addr: u64, len: u64) -> Option<&[u8]> {
        let segment = self.segments.iter().find(|segment| {
            addr >= segment.vaddr && addr + len <= segment.vaddr + segment.memsz
        })?;
        let into_segment = addr - segment.vaddr;
        if into_segment + len > segment.filesz {
            return None;
        }
        let start = (segment.offset + into_segment) as usize;
        self.view.get(start..start + len as usize)
    }

    fn read_ptr(&self, addr: u64) -> Option<u64> {
        let bytes = self.read_bytes(addr, u64::from(self.address_size))?;
        Some(read_word(bytes, self.endian))
    }

    /// Reads a NUL-terminated string out of target memory.
    fn read_cstr(&self, addr: u64, max: u64) -> Option<String> {
        let segment = self
            .segments
            .iter()
            .find(|segment| addr >= segment.vaddr && addr < segment.vaddr + segment.filesz)?;
        let start = (segment.offset + (addr - segment.vaddr)) as usize;
        let end = (segment.offset + segment.filesz) as usize;
        let window = self.view.get(start..end.min(start + max as usize))?;
        let nul = window.iter().position(|&byte| byte == 0)?;
        Some(String::from_utf8_lossy(&window[..nul]).into_owned())
    }

    /// Recovers module candidates from the core's segments and link map.
    pub(crate) fn reconstruct(&self) -> Vec<CoreModule> {
        let mut modules: Vec<CoreModule> = Vec::new();
        let mut r_debug_addr = None;

        for segment in &self.segments {
            if segment.filesz < 16 {
                continue;
            }
            let Some(ident) = self.read_bytes(segment.vaddr, 16) else {
                continue;
            };
            if !ElfObject::test(ident) {
                continue;
            }

            match self.reconstruct_at(segment.vaddr) {
                Some((module, r_debug)) => {
                    trace!(base = segment.vaddr, name = %module.name, "module candidate");
                    r_debug_addr = r_debug_addr.or(r_debug);
                    modules.push(module);
                }
                None => warn!(base = segment.vaddr, "unparsable in-core ELF image"),
            }
        }

        // The link map gives names to the anonymous candidates and
        // reveals modules whose headers the core did not keep.
        if let Some(r_debug) = r_debug_addr {
            self.walk_link_map(r_debug, &mut modules);
        }

        modules
    }

    /// Parses the in-memory ELF image at `base` and digests its
    /// structures. Returns the module and, for the main executable, the
    /// runtime address of the linker's `r_debug`.
    fn reconstruct_at(&self, base: u64) -> Option<(CoreModule, Option<u64>)> {
        let header_bytes = self.read_bytes(base, 64.min(self.segment_filesz_at(base)?))?;
        let header = elf::Elf::parse_header(header_bytes).ok()?;

        let ctx = Ctx {
            container: if header.e_ident[4] == 2 {
                Container::Big
            } else {
                Container::Little
            },
            le: if header.e_ident[5] == 1 {
                scroll::Endian::Little
            } else {
                scroll::Endian::Big
            },
        };

        // The program headers live in the mapped first page.
        let phdr_size = header.e_phentsize as u64 * header.e_phnum as u64;
        let phdr_bytes = self.read_bytes(base + header.e_phoff, phdr_size)?;
        let phdrs =
            elf::ProgramHeader::parse(phdr_bytes, 0, header.e_phnum as usize, ctx).ok()?;

        let mut first_load = None;
        let mut span_end = 0u64;
        let mut file_extent = 0u64;
        for phdr in &phdrs {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            first_load.get_or_insert(phdr.p_vaddr);
            span_end = span_end.max(phdr.p_vaddr + phdr.p_memsz);
            file_extent = file_extent.max(phdr.p_offset + phdr.p_filesz);
        }
        let first_load = first_load?;
        let bias = base.wrapping_sub(first_load);

        // Build id from the note segments, read out of mapped memory.
        let mut build_id = None;
        for phdr in &phdrs {
            if phdr.p_type != PT_NOTE || build_id.is_some() {
                continue;
            }
            let Some(notes) = self.read_bytes(phdr.p_vaddr.wrapping_add(bias), phdr.p_memsz)
            else {
                continue;
            };
            build_id = find_build_id_note(notes, self.endian).map(|(bytes, offset)| {
                let mut id = BuildId::new(bytes);
                id.vaddr = Some(phdr.p_vaddr.wrapping_add(bias) + offset);
                id
            });
        }

        // Dynamic section: soname, string table, and the linker's
        // r_debug hook.
        let mut soname_offset = None;
        let mut strtab = None;
        let mut strsz = None;
        let mut r_debug = None;
        let mut is_main = header.e_type == elf::header::ET_EXEC;
        for phdr in &phdrs {
            if phdr.p_type != PT_DYNAMIC {
                continue;
            }
            let Some(dynamic) = self.read_bytes(phdr.p_vaddr.wrapping_add(bias), phdr.p_memsz)
            else {
                continue;
            };
            for (tag, value) in DynIter::new(dynamic, self.endian, self.address_size) {
                match tag {
                    DT_NULL => break,
                    DT_SONAME => soname_offset = Some(value),
                    DT_STRTAB => strtab = Some(value),
                    DT_STRSZ => strsz = Some(value),
                    DT_DEBUG if value != 0 => {
                        r_debug = Some(value);
                        is_main = true;
                    }
                    _ => {}
                }
            }
        }

        let name = match (soname_offset, strtab) {
            (Some(offset), Some(strtab)) => {
                // DT_STRTAB is a virtual address at run time; some
                // linkers leave it unrelocated.
                let strtab = if strtab < first_load {
                    strtab.wrapping_add(bias)
                } else {
                    strtab
                };
                let limit = strsz.unwrap_or(4096).saturating_sub(offset).min(4096);
                self.read_cstr(strtab + offset, limit).unwrap_or_default()
            }
            _ => String::new(),
        };

        // When every byte of the file image made it into the dump, the
        // module can be served straight from the core.
        let image = self
            .read_bytes(base, file_extent)
            .map(|bytes| bytes.to_vec());

        Some((
            CoreModule {
                name,
                low: first_load.wrapping_add(bias),
                high: span_end.wrapping_add(bias),
                bias,
                build_id,
                image,
                is_main,
            },
            r_debug,
        ))
    }

    fn segment_filesz_at(&self, addr: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|segment| segment.vaddr == addr)
            .map(|segment| segment.filesz)
    }

    /// Walks `r_debug.r_map`, attaching names and discovering modules
    /// with no in-core header.
    fn walk_link_map(&self, r_debug: u64, modules: &mut Vec<CoreModule>) {
        let ptr = u64::from(self.address_size);
        // r_debug: r_version, then r_map behind alignment padding.
        let r_map_addr = r_debug + ptr;
        let Some(mut entry) = self.read_ptr(r_map_addr) else {
            return;
        };

        let mut seen = 0;
        while entry != 0 && seen < MAX_LINK_MAP {
            seen += 1;
            // link_map: l_addr, l_name, l_ld, l_next, l_prev.
            let Some(l_addr) = self.read_ptr(entry) else {
                break;
            };
            let l_name = self.read_ptr(entry + ptr).unwrap_or(0);
            let l_next = self.read_ptr(entry + 3 * ptr).unwrap_or(0);

            let name = if l_name != 0 {
                self.read_cstr(l_name, 4096).unwrap_or_default()
            } else {
                String::new()
            };

            if !name.is_empty() {
                match modules
                    .iter_mut()
                    .find(|module| module.bias == l_addr || module.low == l_addr)
                {
                    Some(module) => {
                        if module.name.is_empty() {
                            module.name = name;
                        }
                    }
                    None => {
                        // The header pages of this object were not
                        // dumped; record what the link map knows.
                        trace!(base = l_addr, name = %name, "module known only to link map");
                        modules.push(CoreModule {
                            name,
                            low: l_addr,
                            high: l_addr,
                            bias: l_addr,
                            build_id: None,
                            image: None,
                            is_main: false,
                        });
                    }
                }
            }

            entry = l_next;
        }
    }
}

impl Memory for CoreImage {
    fn read_word(&self, addr: u64) -> Option<u64> {
        self.read_ptr(addr)
    }
}

impl std::fmt::Debug for CoreImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreImage")
            .field("arch", &self.arch)
            .field("segments", &self.segments.len())
            .field("threads", &self.threads.len())
            .finish()
    }
}

fn read_word(bytes: &[u8], endian: Endian) -> u64 {
    match bytes.len() {
        4 => {
            let array: [u8; 4] = bytes.try_into().unwrap();
            match endian {
                Endian::Little => u64::from(u32::from_le_bytes(array)),
                Endian::Big => u64::from(u32::from_be_bytes(array)),
            }
        }
        8 => {
            let array: [u8; 8] = bytes.try_into().unwrap();
            match endian {
                Endian::Little => u64::from_le_bytes(array),
                Endian::Big => u64::from_be_bytes(array),
            }
        }
        _ => 0,
    }
}

/// Iterator over `(d_tag, d_value)` pairs of a raw dynamic segment.
struct DynIter<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
    entry_size: usize,
}

impl<'a> DynIter<'a> {
    fn new(data: &'a [u8], endian: Endian, address_size: u8) -> Self {
        DynIter {
            data,
            pos: 0,
            endian,
            entry_size: address_size as usize,
        }
    }
}

impl Iterator for DynIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        let tag = self.data.get(self.pos..self.pos + self.entry_size)?;
        let value = self
            .data
            .get(self.pos + self.entry_size..self.pos + 2 * self.entry_size)?;
        self.pos += 2 * self.entry_size;
        Some((read_word(tag, self.endian), read_word(value, self.endian)))
    }
}

/// Extracts `AT_ENTRY` from an `NT_AUXV` note, which shares the
/// tag/value pair layout of the dynamic section.
fn parse_auxv_entry(desc: &[u8], endian: Endian, address_size: u8) -> Option<u64> {
    for (a_type, value) in DynIter::new(desc, endian, address_size) {
        if a_type == AT_ENTRY {
            return Some(value);
        }
        if a_type == 0 {
            break;
        }
    }
    None
}

/// Scans a raw note region for `NT_GNU_BUILD_ID`.
///
/// Returns the id bytes and the offset of the description within the
/// region.
fn find_build_id_note(data: &[u8], endian: Endian) -> Option<(Vec<u8>, u64)> {
    let mut pos = 0usize;
    let align = |value: usize| (value + 3) & !3;

    while pos + 12 <= data.len() {
        let namesz = read_word(&data[pos..pos + 4], endian) as usize;
        let descsz = read_word(&data[pos + 4..pos + 8], endian) as usize;
        let n_type = read_word(&data[pos + 8..pos + 12], endian) as u32;
        pos += 12;

        let name = data.get(pos..pos + namesz)?;
        let desc_pos = pos + align(namesz);
        let desc = data.get(desc_pos..desc_pos + descsz)?;

        if n_type == elf::note::NT_GNU_BUILD_ID && name.strip_suffix(&[0]) == Some(b"GNU") {
            return Some((desc.to_vec(), desc_pos as u64));
        }

        pos = desc_pos + align(descsz);
    }
    None
}
