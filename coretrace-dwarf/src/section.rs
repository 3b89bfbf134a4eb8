//! Identification of the DWARF sections this reader consumes.

use std::borrow::Cow;
use std::fmt;

/// The debug sections known to this reader.
///
/// The discriminants index into per-section tables inside the session, so
/// they must stay dense.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SectionId {
    /// `.debug_info`, the DIE tree.
    DebugInfo,
    /// `.debug_types`, type units (DWARF 4).
    DebugTypes,
    /// `.debug_abbrev`, abbreviation tables.
    DebugAbbrev,
    /// `.debug_str`, the string table.
    DebugStr,
    /// `.debug_line`, line number programs.
    DebugLine,
    /// `.debug_loc`, location lists.
    DebugLoc,
    /// `.debug_ranges`, range lists.
    DebugRanges,
    /// `.debug_macinfo`, macro information.
    DebugMacinfo,
    /// `.debug_frame`, platform ABI call frame information.
    DebugFrame,
    /// `.eh_frame`, exception handling call frame information.
    EhFrame,
}

impl SectionId {
    /// The number of known sections.
    pub const COUNT: usize = 10;

    /// All known sections, in table order.
    pub const ALL: [SectionId; Self::COUNT] = [
        SectionId::DebugInfo,
        SectionId::DebugTypes,
        SectionId::DebugAbbrev,
        SectionId::DebugStr,
        SectionId::DebugLine,
        SectionId::DebugLoc,
        SectionId::DebugRanges,
        SectionId::DebugMacinfo,
        SectionId::DebugFrame,
        SectionId::EhFrame,
    ];

    /// The canonical ELF section name, including the leading dot.
    pub fn elf_name(self) -> &'static str {
        match self {
            SectionId::DebugInfo => ".debug_info",
            SectionId::DebugTypes => ".debug_types",
            SectionId::DebugAbbrev => ".debug_abbrev",
            SectionId::DebugStr => ".debug_str",
            SectionId::DebugLine => ".debug_line",
            SectionId::DebugLoc => ".debug_loc",
            SectionId::DebugRanges => ".debug_ranges",
            SectionId::DebugMacinfo => ".debug_macinfo",
            SectionId::DebugFrame => ".debug_frame",
            SectionId::EhFrame => ".eh_frame",
        }
    }

    /// The section name without leading punctuation, as used by section
    /// providers.
    pub fn name(self) -> &'static str {
        &self.elf_name()[1..]
    }

    /// Identifies a section from its unpunctuated name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.elf_name())
    }
}

/// Data and placement of one debug section.
///
/// `data` is the section's (possibly decompressed) contents; `address` is
/// the virtual address the section was assigned at link time, which matters
/// for `.eh_frame` pc-relative pointer encodings.
#[derive(Clone)]
pub struct DwarfSection<'data> {
    /// Virtual address of this section in the file's address space.
    pub address: u64,
    /// File offset of this section.
    pub offset: u64,
    /// Section contents.
    pub data: Cow<'data, [u8]>,
}

impl fmt::Debug for DwarfSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DwarfSection")
            .field("address", &format_args!("{:#x}", self.address))
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("len()", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_names() {
        assert_eq!(SectionId::DebugInfo.name(), "debug_info");
        assert_eq!(SectionId::from_name("eh_frame"), Some(SectionId::EhFrame));
        assert_eq!(SectionId::from_name(".debug_info"), None);
    }

    #[test]
    fn test_table_order_is_dense() {
        for (index, id) in SectionId::ALL.into_iter().enumerate() {
            assert_eq!(id as usize, index);
        }
    }
}
