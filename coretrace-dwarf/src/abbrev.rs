//! Abbreviation tables from `.debug_abbrev`.

use std::collections::HashMap;

use crate::constants::*;
use crate::error::{DwarfError, DwarfErrorKind};
use crate::reader::SectionReader;

/// One attribute specification inside an abbreviation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbbrevAttr {
    /// The attribute name (`DW_AT_*`).
    pub attr: u32,
    /// The form the value is encoded with (`DW_FORM_*`).
    pub form: u32,
    /// The inline constant of a `DW_FORM_implicit_const` specification.
    pub implicit_const: Option<i64>,
}

/// One decoded abbreviation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Abbrev {
    /// The DIE tag (`DW_TAG_*`).
    pub tag: u32,
    /// Whether DIEs with this abbreviation have children.
    pub has_children: bool,
    /// The attribute specifications, in on-disk order.
    pub attrs: Vec<AbbrevAttr>,
}

/// The abbreviation table of one compilation unit.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AbbrevTable {
    by_code: HashMap<u64, Abbrev>,
}

impl AbbrevTable {
    /// Decodes the table starting at `offset` in `.debug_abbrev`.
    ///
    /// A code of zero ends the table; each abbreviation's attribute list
    /// ends with a `(0, 0)` pair. A zero attribute paired with a nonzero
    /// form (or the other way around) has no defined meaning.
    pub fn parse(mut reader: SectionReader<'_>) -> Result<Self, DwarfError> {
        let mut by_code = HashMap::new();

        loop {
            let code = reader.read_uleb128()?;
            if code == 0 {
                break;
            }

            let tag = reader.read_uleb128()? as u32;
            let has_children = reader.read_u8()? != 0;

            let mut attrs = Vec::new();
            loop {
                let attr = reader.read_uleb128()? as u32;
                let form = reader.read_uleb128()? as u32;
                if attr == 0 && form == 0 {
                    break;
                }
                if attr == 0 || form == 0 {
                    return Err(DwarfErrorKind::BadAbbrev(code).into());
                }

                let implicit_const = if form == DW_FORM_implicit_const {
                    Some(reader.read_sleb128()?)
                } else {
                    None
                };

                attrs.push(AbbrevAttr {
                    attr,
                    form,
                    implicit_const,
                });
            }

            by_code.insert(
                code,
                Abbrev {
                    tag,
                    has_children,
                    attrs,
                },
            );
        }

        Ok(AbbrevTable { by_code })
    }

    /// Looks up the abbreviation for a code.
    pub fn get(&self, code: u64) -> Option<&Abbrev> {
        self.by_code.get(&code)
    }

    /// The number of abbreviations in this table.
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    /// Whether the table has no abbreviations at all.
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{Encoding, Endian};
    use similar_asserts::assert_eq;

    fn reader(data: &[u8]) -> SectionReader<'_> {
        SectionReader::new(data, Encoding::new(Endian::Little, 8))
    }

    #[test]
    fn test_parse_table() {
        #[rustfmt::skip]
        let data = [
            // Code 1: compile_unit, has children, name: strp, low_pc: addr.
            0x01, 0x11, 0x01,
            0x03, 0x0e,
            0x11, 0x01,
            0x00, 0x00,
            // Code 2: subprogram, no children, one implicit_const.
            0x02, 0x2e, 0x00,
            0x3b, 0x21, 0x2a, // DW_AT_decl_line, implicit_const, value 42
            0x00, 0x00,
            // End of table.
            0x00,
        ];

        let table = AbbrevTable::parse(reader(&data)).unwrap();
        assert_eq!(table.len(), 2);

        let cu = table.get(1).unwrap();
        assert_eq!(cu.tag, DW_TAG_compile_unit);
        assert!(cu.has_children);
        assert_eq!(cu.attrs.len(), 2);
        assert_eq!(cu.attrs[0].attr, DW_AT_name);
        assert_eq!(cu.attrs[0].form, DW_FORM_strp);

        let func = table.get(2).unwrap();
        assert_eq!(func.tag, DW_TAG_subprogram);
        assert!(!func.has_children);
        assert_eq!(func.attrs[0].implicit_const, Some(42));

        assert!(table.get(3).is_none());
    }

    #[test]
    fn test_empty_table() {
        let table = AbbrevTable::parse(reader(&[0x00])).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_half_terminator_is_rejected() {
        // Attribute 0 with a nonzero form mid-list.
        let data = [0x01, 0x11, 0x00, 0x00, 0x0e, 0x00, 0x00, 0x00];
        let err = AbbrevTable::parse(reader(&data)).unwrap_err();
        assert_eq!(err.kind(), DwarfErrorKind::BadAbbrev(1));
    }

    #[test]
    fn test_truncated_table() {
        let data = [0x01, 0x11];
        let err = AbbrevTable::parse(reader(&data)).unwrap_err();
        assert_eq!(err.kind(), DwarfErrorKind::Truncated);
    }
}
