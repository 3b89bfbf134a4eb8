//! Compilation unit headers and their enumeration.

use crate::die::Die;
use crate::error::{DwarfError, DwarfErrorKind};
use crate::reader::{Encoding, Endian, SectionReader};
use crate::section::SectionId;
use crate::session::DwarfInfo;

/// A decoded unit header from `.debug_info` or `.debug_types`.
///
/// Units are decoded lazily on first enumeration and then kept for the
/// lifetime of the session; everything below the header (abbreviations,
/// DIEs, line tables) stays untouched until visited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unit {
    /// Offset of the unit header within its section.
    pub offset: u64,
    /// Whether the unit lives in `.debug_types`.
    pub is_types: bool,
    /// The DWARF version of this unit.
    pub version: u16,
    /// Address size used by this unit.
    pub address_size: u8,
    /// Offset size of this unit (4 for 32-bit DWARF, 8 for 64-bit).
    pub offset_size: u8,
    /// Offset of the unit's abbreviation table in `.debug_abbrev`.
    pub abbrev_offset: u64,
    /// The type signature of a type unit.
    pub type_signature: Option<u64>,
    /// Unit-relative offset of the described type DIE in a type unit.
    pub type_offset: Option<u64>,
    /// Offset of the root DIE within the section.
    pub die_offset: u64,
    /// Offset one past the end of the unit's contribution.
    pub end_offset: u64,
}

impl Unit {
    /// The section this unit lives in.
    pub fn section_id(&self) -> SectionId {
        if self.is_types {
            SectionId::DebugTypes
        } else {
            SectionId::DebugInfo
        }
    }

    /// The reader encoding for values inside this unit.
    pub fn encoding(&self, endian: Endian) -> Encoding {
        Encoding {
            endian,
            address_size: self.address_size,
            offset_size: self.offset_size,
        }
    }

    /// Parses one unit header at `offset`; returns the unit.
    pub(crate) fn parse(
        data: &[u8],
        endian: Endian,
        offset: u64,
        is_types: bool,
    ) -> Result<Unit, DwarfError> {
        let mut reader = SectionReader::at(data, Encoding::new(endian, 0), offset as usize)?;

        let length = reader.read_initial_length()?;
        let offset_size = reader.encoding().offset_size;
        let end_offset = reader.pos() as u64 + length;
        if end_offset > data.len() as u64 {
            return Err(DwarfErrorKind::Truncated.into());
        }

        let version = reader.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(DwarfErrorKind::UnsupportedVersion(version).into());
        }

        let abbrev_offset = reader.read_offset()?;
        let address_size = reader.read_u8()?;
        if address_size != 4 && address_size != 8 {
            return Err(DwarfErrorKind::InvalidDwarf.into());
        }

        let (type_signature, type_offset) = if is_types {
            let signature = reader.read_u64()?;
            let type_offset = reader.read_offset()?;
            (Some(signature), Some(type_offset))
        } else {
            (None, None)
        };

        Ok(Unit {
            offset,
            is_types,
            version,
            address_size,
            offset_size,
            abbrev_offset,
            type_signature,
            type_offset,
            die_offset: reader.pos() as u64,
            end_offset,
        })
    }

    /// Scans a whole section into unit headers.
    pub(crate) fn parse_all(
        data: &[u8],
        endian: Endian,
        is_types: bool,
        out: &mut Vec<Unit>,
    ) -> Result<(), DwarfError> {
        let mut offset = 0u64;
        while offset < data.len() as u64 {
            let unit = Unit::parse(data, endian, offset, is_types)?;
            offset = unit.end_offset;
            out.push(unit);
        }
        Ok(())
    }
}

/// Iterator over the units of a session, `.debug_info` first and
/// `.debug_types` second, each in section order.
#[derive(Clone, Copy, Debug)]
pub struct UnitsIter<'d> {
    info: &'d DwarfInfo<'d>,
    units: &'d [Unit],
    index: usize,
}

impl<'d> UnitsIter<'d> {
    pub(crate) fn new(info: &'d DwarfInfo<'d>, units: &'d [Unit]) -> Self {
        UnitsIter {
            info,
            units,
            index: 0,
        }
    }
}

impl<'d> Iterator for UnitsIter<'d> {
    type Item = (&'d Unit, Die<'d>);

    fn next(&mut self) -> Option<Self::Item> {
        let unit = self.units.get(self.index)?;
        self.index += 1;
        Some((unit, Die::new(self.info, unit, unit.die_offset as usize)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_parse_dwarf32_header() {
        #[rustfmt::skip]
        let data = [
            0x0d, 0x00, 0x00, 0x00, // unit length: 13
            0x04, 0x00,             // version 4
            0x10, 0x00, 0x00, 0x00, // abbrev offset 0x10
            0x08,                   // address size
            0x01, 0x11, 0x00, 0x00, 0x00, 0x00, // root DIE bytes
        ];
        let unit = Unit::parse(&data, Endian::Little, 0, false).unwrap();
        assert_eq!(unit.version, 4);
        assert_eq!(unit.offset_size, 4);
        assert_eq!(unit.address_size, 8);
        assert_eq!(unit.abbrev_offset, 0x10);
        assert_eq!(unit.die_offset, 11);
        assert_eq!(unit.end_offset, 17);
    }

    #[test]
    fn test_parse_bad_version() {
        let data = [0x04, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00];
        let err = Unit::parse(&data, Endian::Little, 0, false).unwrap_err();
        assert_eq!(err.kind(), DwarfErrorKind::UnsupportedVersion(9));
    }

    #[test]
    fn test_parse_truncated_length() {
        let data = [0xff, 0x00, 0x00, 0x00, 0x04, 0x00];
        let err = Unit::parse(&data, Endian::Little, 0, false).unwrap_err();
        assert_eq!(err.kind(), DwarfErrorKind::Truncated);
    }

    #[test]
    fn test_parse_all_empty_section() {
        let mut units = Vec::new();
        Unit::parse_all(&[], Endian::Little, false, &mut units).unwrap();
        assert!(units.is_empty());
    }
}
