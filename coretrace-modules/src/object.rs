//! Parsed ELF objects and their debug-section access.

use std::borrow::Cow;
use std::convert::TryInto;
use std::fmt;

use flate2::{Decompress, FlushDecompress};
use goblin::container::{Container, Ctx};
use goblin::elf;
use goblin::elf::compression_header::{CompressionHeader, ELFCOMPRESS_ZLIB};
use tracing::warn;

use coretrace_common::{Arch, AsSelf};
use coretrace_dwarf::{
    DwarfSection, DwarfSource, Endian, RawReloc, RelocSymbol, SectionId, SymbolSection,
};

use crate::error::{ModuleError, ModuleErrorKind};

const SHF_COMPRESSED: u64 = elf::section_header::SHF_COMPRESSED as u64;
const SHF_ALLOC: u64 = elf::section_header::SHF_ALLOC as u64;

/// A parsed ELF object file.
///
/// This is the crate's one interface to the container format; everything
/// above works with section views, segments and symbols obtained here.
pub struct ElfObject<'data> {
    elf: elf::Elf<'data>,
    data: &'data [u8],
}

impl<'data> ElfObject<'data> {
    /// Tests whether the buffer could contain an ELF object.
    pub fn test(data: &[u8]) -> bool {
        data.get(0..elf::header::SELFMAG)
            .map_or(false, |magic| magic == elf::header::ELFMAG)
    }

    /// Parses an ELF object from the given slice.
    pub fn parse(data: &'data [u8]) -> Result<Self, ModuleError> {
        let elf = elf::Elf::parse(data)?;
        Ok(ElfObject { elf, data })
    }

    /// The raw data of the ELF file.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// The parsed goblin structure.
    pub(crate) fn elf(&self) -> &elf::Elf<'data> {
        &self.elf
    }

    /// Whether the file was compiled for a big-endian machine.
    pub fn endian(&self) -> Endian {
        if self.elf.little_endian {
            Endian::Little
        } else {
            Endian::Big
        }
    }

    /// The size of addresses in this file, 4 or 8.
    pub fn address_size(&self) -> u8 {
        if self.elf.is_64 {
            8
        } else {
            4
        }
    }

    /// The CPU architecture of this object, as specified in the ELF
    /// header.
    pub fn arch(&self) -> Arch {
        Arch::from_elf(self.elf.header.e_machine, self.elf.header.e_flags)
    }

    /// The `e_type` of this file.
    pub fn e_type(&self) -> u16 {
        self.elf.header.e_type
    }

    /// Whether this is an unlinked, relocatable object.
    pub fn is_relocatable(&self) -> bool {
        self.elf.header.e_type == elf::header::ET_REL
    }

    /// Whether this is a core dump.
    pub fn is_core(&self) -> bool {
        self.elf.header.e_type == elf::header::ET_CORE
    }

    /// The program entry point as stored in the header.
    pub fn entry(&self) -> u64 {
        self.elf.header.e_entry
    }

    /// The soname recorded in the dynamic section, if any.
    pub fn soname(&self) -> Option<&'data str> {
        self.elf.soname
    }

    /// The address at which the image prefers to be loaded.
    ///
    /// For `ET_EXEC` this is the start of the first `PT_LOAD` segment;
    /// position-independent files normally yield zero.
    pub fn load_address(&self) -> u64 {
        for phdr in &self.elf.program_headers {
            if phdr.p_type == elf::program_header::PT_LOAD {
                return phdr.p_vaddr;
            }
        }
        0
    }

    /// The union of all `PT_LOAD` segments as `[start, end)` in file
    /// virtual addresses.
    pub fn load_span(&self) -> Option<(u64, u64)> {
        let mut span: Option<(u64, u64)> = None;
        for phdr in &self.elf.program_headers {
            if phdr.p_type != elf::program_header::PT_LOAD {
                continue;
            }
            let start = phdr.p_vaddr;
            let end = phdr.p_vaddr.saturating_add(phdr.p_memsz);
            span = Some(match span {
                None => (start, end),
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
            });
        }
        span
    }

    /// The program headers of this file.
    pub fn program_headers(&self) -> &[elf::ProgramHeader] {
        &self.elf.program_headers
    }

    /// Searches for a GNU build identifier note.
    ///
    /// Both `PT_NOTE` program headers and the `.note.gnu.build-id`
    /// section are searched, in that order; linkers disagree on which
    /// one they emit.
    pub fn build_id(&self) -> Option<&'data [u8]> {
        if let Some(notes) = self.elf.iter_note_headers(self.data) {
            for note in notes.flatten() {
                if note.n_type == elf::note::NT_GNU_BUILD_ID {
                    return Some(note.desc);
                }
            }
        }

        if let Some(notes) = self
            .elf
            .iter_note_sections(self.data, Some(".note.gnu.build-id"))
        {
            for note in notes.flatten() {
                if note.n_type == elf::note::NT_GNU_BUILD_ID {
                    return Some(note.desc);
                }
            }
        }

        None
    }

    /// The `.gnu_debuglink` reference of this object, if present.
    pub fn debug_link(&self) -> Option<DebugLink<'data>> {
        let (_, section) = self.find_section("gnu_debuglink")?;
        match section.data {
            Cow::Borrowed(data) => match DebugLink::parse(data, self.endian()) {
                Ok(link) => Some(link),
                Err(err) => {
                    warn!(error = %err, "malformed .gnu_debuglink section");
                    None
                }
            },
            // .gnu_debuglink is never compressed.
            Cow::Owned(_) => None,
        }
    }

    /// Whether this object has a `.debug_info` section.
    pub fn has_debug_info(&self) -> bool {
        self.has_section("debug_info")
    }

    /// Whether this object has call frame information of either flavor.
    pub fn has_unwind_info(&self) -> bool {
        self.has_section("eh_frame") || self.has_section("debug_frame")
    }

    /// Determines whether the named section exists.
    pub fn has_section(&self, name: &str) -> bool {
        self.find_section(name).is_some()
    }

    /// Returns the named section, decompressed if necessary.
    ///
    /// The name is given without leading punctuation, `"debug_info"` for
    /// `.debug_info`.
    pub fn section(&self, name: &str) -> Option<DwarfSection<'data>> {
        let (compressed, mut section) = self.find_section(name)?;
        if compressed {
            let decompressed = self.decompress_section(&section.data)?;
            section.data = Cow::Owned(decompressed);
        }
        Some(section)
    }

    /// Locates a section and reports whether its data is compressed.
    fn find_section(&self, name: &str) -> Option<(bool, DwarfSection<'data>)> {
        for header in &self.elf.section_headers {
            // Section types vary (SHT_PROGBITS, SHT_X86_64_UNWIND,
            // SHT_MIPS_DWARF); matching against SHT_NOBITS instead
            // follows what elfutils does.
            if header.sh_type == elf::section_header::SHT_NOBITS {
                continue;
            }

            let Some(section_name) = self.elf.shdr_strtab.get_at(header.sh_name) else {
                continue;
            };
            if section_name.is_empty() || header.sh_offset == 0 {
                continue;
            }

            // Pre-SHF_COMPRESSED compressed sections were prefixed `.z`.
            let (compressed, section_name) = match section_name.strip_prefix(".z") {
                Some(stripped) => (true, stripped),
                None => (header.sh_flags & SHF_COMPRESSED != 0, &section_name[1..]),
            };

            if section_name != name {
                continue;
            }

            let offset = header.sh_offset as usize;
            let size = header.sh_size as usize;
            let data = self.data.get(offset..offset + size)?;

            return Some((
                compressed,
                DwarfSection {
                    data: Cow::Borrowed(data),
                    address: header.sh_addr,
                    offset: header.sh_offset,
                },
            ));
        }

        None
    }

    /// Inflates compressed section data, GNU `ZLIB` header or
    /// `SHF_COMPRESSED` style.
    fn decompress_section(&self, section_data: &[u8]) -> Option<Vec<u8>> {
        let (size, compressed) = if section_data.starts_with(b"ZLIB") {
            // 4 bytes of magic, then a big-endian 8-byte size.
            if section_data.len() < 12 {
                return None;
            }
            let mut size_bytes = [0; 8];
            size_bytes.copy_from_slice(&section_data[4..12]);
            (u64::from_be_bytes(size_bytes), &section_data[12..])
        } else {
            let container = self.elf.header.container().ok()?;
            let endianness = self.elf.header.endianness().ok()?;
            let context = Ctx::new(container, endianness);

            let compression = CompressionHeader::parse(section_data, 0, context).ok()?;
            if compression.ch_type != ELFCOMPRESS_ZLIB {
                return None;
            }
            let compressed = section_data.get(CompressionHeader::size(context)..)?;
            (compression.ch_size, compressed)
        };

        let mut decompressed = Vec::with_capacity(size as usize);
        Decompress::new(true)
            .decompress_vec(compressed, &mut decompressed, FlushDecompress::Finish)
            .ok()?;

        Some(decompressed)
    }

    /// Whether a symbol's defining section occupies memory at run time.
    fn section_allocated(&self, shndx: usize) -> bool {
        self.elf
            .section_headers
            .get(shndx)
            .map_or(true, |header| header.sh_flags & SHF_ALLOC != 0)
    }

    /// Collects the relocation inputs targeting one debug section.
    ///
    /// Only relocatable files carry relocations against their debug
    /// sections; linked files return `None`.
    fn debug_relocations(&self, id: SectionId) -> Option<(Vec<RawReloc>, Vec<RelocSymbol>)> {
        if !self.is_relocatable() {
            return None;
        }

        // Find the target debug section's header index.
        let target_index = self.elf.section_headers.iter().position(|header| {
            self.elf.shdr_strtab.get_at(header.sh_name) == Some(id.elf_name())
        })?;

        let mut raw = Vec::new();
        for (reloc_section_index, relocs) in &self.elf.shdr_relocs {
            let Some(reloc_header) = self.elf.section_headers.get(*reloc_section_index) else {
                continue;
            };
            if reloc_header.sh_info as usize != target_index {
                continue;
            }
            for reloc in relocs.iter() {
                raw.push(RawReloc {
                    offset: reloc.r_offset,
                    r_type: reloc.r_type,
                    symbol: reloc.r_sym as u32,
                    addend: reloc.r_addend,
                });
            }
        }

        if raw.is_empty() {
            return None;
        }

        let symbols = self
            .elf
            .syms
            .iter()
            .map(|sym| RelocSymbol {
                value: sym.st_value,
                binding: sym.st_bind(),
                section: match sym.st_shndx {
                    0 => SymbolSection::Undefined,
                    shndx if shndx >= elf::section_header::SHN_LORESERVE as usize => {
                        SymbolSection::Reserved
                    }
                    shndx => SymbolSection::Section {
                        allocated: self.section_allocated(shndx),
                    },
                },
            })
            .collect();

        Some((raw, symbols))
    }
}

impl fmt::Debug for ElfObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfObject")
            .field("arch", &self.arch())
            .field("e_type", &self.e_type())
            .field("load_address", &format_args!("{:#x}", self.load_address()))
            .field("has_debug_info", &self.has_debug_info())
            .field("has_unwind_info", &self.has_unwind_info())
            .finish()
    }
}

impl<'slf, 'data: 'slf> AsSelf<'slf> for ElfObject<'data> {
    type Ref = ElfObject<'slf>;

    fn as_self(&'slf self) -> &Self::Ref {
        self
    }
}

impl<'data> DwarfSource<'data> for ElfObject<'data> {
    fn endian(&self) -> Endian {
        self.endian()
    }

    fn address_size(&self) -> u8 {
        self.address_size()
    }

    fn section(&self, id: SectionId) -> Option<DwarfSection<'data>> {
        self.section(id.name())
    }

    fn relocations(&self, id: SectionId) -> Option<(Vec<RawReloc>, Vec<RelocSymbol>)> {
        self.debug_relocations(id)
    }
}

/// A parsed `.gnu_debuglink` section.
///
/// The section holds a null-terminated file name, padding to a four-byte
/// boundary, and a CRC-32 checksum of the referenced file.
#[derive(Clone, Copy, Debug)]
pub struct DebugLink<'data> {
    /// The referenced file name, without directory components.
    pub filename: &'data [u8],
    /// The expected CRC-32 (ISO 3309) of the whole referenced file.
    pub crc: u32,
}

impl<'data> DebugLink<'data> {
    /// Parses a debug link from raw section data.
    pub fn parse(data: &'data [u8], endian: Endian) -> Result<Self, ModuleError> {
        let nul = data
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(ModuleErrorKind::BadElf)?;
        let filename = &data[..nul];

        // Tolerate sloppy padding: the checksum occupies the last four
        // bytes of the section.
        let crc = data
            .get(nul + 1..)
            .filter(|rest| rest.len() >= 4)
            .and_then(|rest| rest.get(rest.len() - 4..))
            .ok_or(ModuleErrorKind::BadElf)?;
        let crc: [u8; 4] = crc.try_into().map_err(|_| ModuleErrorKind::BadElf)?;

        let crc = match endian {
            Endian::Little => u32::from_le_bytes(crc),
            Endian::Big => u32::from_be_bytes(crc),
        };

        Ok(DebugLink { filename, crc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_elf_magic() {
        assert!(ElfObject::test(b"\x7fELF\x02\x01\x01\x00"));
        assert!(!ElfObject::test(b"MZ\x90\x00"));
        assert!(!ElfObject::test(b"\x7fEL"));
    }

    #[test]
    fn test_debug_link_parse() {
        let mut data = b"app.debug\0\0\0".to_vec();
        data.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        let link = DebugLink::parse(&data, Endian::Little).unwrap();
        assert_eq!(link.filename, b"app.debug");
        assert_eq!(link.crc, 0xdead_beef);
    }

    #[test]
    fn test_debug_link_missing_crc() {
        let data = b"app.debug\0".to_vec();
        assert!(DebugLink::parse(&data, Endian::Little).is_err());
        assert!(DebugLink::parse(b"no-terminator", Endian::Little).is_err());
    }
}
