//! Typed decoding of attribute values from their forms.

use crate::abbrev::AbbrevAttr;
use crate::constants::*;
use crate::error::{DwarfError, DwarfErrorKind};
use crate::reader::SectionReader;
use crate::reloc::Relocatable;
use crate::section::SectionId;
use crate::session::DwarfInfo;
use crate::unit::Unit;
use crate::version::DwClass;

/// One decoded attribute of a DIE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attribute<'d> {
    /// The attribute name (`DW_AT_*`).
    pub name: u32,
    /// The form the value was encoded with, after `DW_FORM_indirect`
    /// resolution.
    pub form: u32,
    /// The decoded value.
    pub value: AttributeValue<'d>,
}

/// A decoded attribute value.
///
/// Forms whose semantic class depends on the attribute and DWARF version
/// (the `data4`/`data8`/`sec_offset` family) arrive here already
/// classified; a section offset tells which section it points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeValue<'d> {
    /// An address, possibly still carrying a relocation symbol.
    Address(Relocatable),
    /// An unsigned constant.
    Udata(u64),
    /// A signed constant.
    Sdata(i64),
    /// An uninterpreted block of bytes.
    Block(&'d [u8]),
    /// A DWARF expression.
    Exprloc(&'d [u8]),
    /// A string, without its terminating null byte.
    String(&'d [u8]),
    /// A boolean flag.
    Flag(bool),
    /// A reference to a DIE in the same unit, as an absolute section
    /// offset.
    UnitRef(u64),
    /// A reference to a DIE anywhere in `.debug_info`, as an absolute
    /// section offset.
    GlobalRef(u64),
    /// A type-unit signature.
    TypeSignature(u64),
    /// An offset into the section implied by `class`.
    SecOffset {
        /// Which list or table section the offset points into.
        class: DwClass,
        /// The offset value.
        offset: u64,
    },
}

impl<'d> AttributeValue<'d> {
    /// The value as an unsigned constant, if it is one.
    pub fn as_udata(&self) -> Option<u64> {
        match *self {
            AttributeValue::Udata(value) => Some(value),
            AttributeValue::Sdata(value) => Some(value as u64),
            _ => None,
        }
    }

    /// The value as a string, if it is one.
    pub fn as_string(&self) -> Option<&'d [u8]> {
        match *self {
            AttributeValue::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The value as an address, if it is one.
    pub fn as_address(&self) -> Option<Relocatable> {
        match *self {
            AttributeValue::Address(addr) => Some(addr),
            _ => None,
        }
    }

    /// The value as an expression block, if it is one.
    pub fn as_exprloc(&self) -> Option<&'d [u8]> {
        match *self {
            AttributeValue::Exprloc(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Decodes the attribute at the reader's position per its abbreviation
/// specification.
///
/// `DW_FORM_indirect` re-reads the form at the point of use; a doubly
/// indirect form is an error.
pub(crate) fn read_attribute<'d>(
    info: &'d DwarfInfo<'d>,
    unit: &Unit,
    reader: &mut SectionReader<'d>,
    spec: AbbrevAttr,
) -> Result<Attribute<'d>, DwarfError> {
    let mut form = spec.form;
    if form == DW_FORM_indirect {
        form = reader.read_uleb128()? as u32;
        if form == DW_FORM_indirect {
            return Err(DwarfErrorKind::BadForm(form).into());
        }
    }

    let vt = info.version_table(unit)?;
    let strict = info.opts().strict;
    if strict && !vt.form_allowed(spec.attr, form, true) {
        return Err(DwarfErrorKind::InvalidDwarf.into());
    }

    let endian = info.endian();
    let section_id = unit.section_id();

    let value = match form {
        DW_FORM_addr => {
            let pos = reader.pos();
            let relocs = info.reloc_map(section_id)?;
            let addr = relocs.read(reader.data(), pos, unit.address_size, endian)?;
            reader.skip(unit.address_size as usize)?;
            AttributeValue::Address(addr)
        }

        DW_FORM_data1 | DW_FORM_data2 | DW_FORM_data4 | DW_FORM_data8 | DW_FORM_udata
        | DW_FORM_sdata | DW_FORM_implicit_const => {
            let class = vt.form_class(spec.attr, form, strict)?;
            match class {
                DwClass::LoclistPtr | DwClass::RangelistPtr | DwClass::LinePtr
                | DwClass::MacPtr => {
                    let offset = match form {
                        DW_FORM_data4 | DW_FORM_data8 => {
                            let width = if form == DW_FORM_data4 { 4 } else { 8 };
                            let pos = reader.pos();
                            let relocs = info.reloc_map(section_id)?;
                            let value = relocs.read(reader.data(), pos, width, endian)?;
                            reader.skip(width as usize)?;
                            value.value
                        }
                        DW_FORM_udata => reader.read_uleb128()?,
                        DW_FORM_data1 => u64::from(reader.read_u8()?),
                        DW_FORM_data2 => u64::from(reader.read_u16()?),
                        _ => return Err(DwarfErrorKind::BadForm(form).into()),
                    };
                    AttributeValue::SecOffset { class, offset }
                }
                _ => match form {
                    DW_FORM_data1 => AttributeValue::Udata(u64::from(reader.read_u8()?)),
                    DW_FORM_data2 => AttributeValue::Udata(u64::from(reader.read_u16()?)),
                    DW_FORM_data4 => AttributeValue::Udata(u64::from(reader.read_u32()?)),
                    DW_FORM_data8 => AttributeValue::Udata(reader.read_u64()?),
                    DW_FORM_udata => AttributeValue::Udata(reader.read_uleb128()?),
                    DW_FORM_sdata => AttributeValue::Sdata(reader.read_sleb128()?),
                    DW_FORM_implicit_const => {
                        AttributeValue::Sdata(spec.implicit_const.unwrap_or_default())
                    }
                    _ => unreachable!(),
                },
            }
        }

        DW_FORM_sec_offset => {
            let class = vt.form_class(spec.attr, form, strict)?;
            let width = unit.offset_size;
            let pos = reader.pos();
            let relocs = info.reloc_map(section_id)?;
            let value = relocs.read(reader.data(), pos, width, endian)?;
            reader.skip(width as usize)?;
            AttributeValue::SecOffset {
                class,
                offset: value.value,
            }
        }

        DW_FORM_string => AttributeValue::String(reader.read_cstr()?),

        DW_FORM_strp => {
            let width = unit.offset_size;
            let pos = reader.pos();
            let relocs = info.reloc_map(section_id)?;
            let value = relocs.read(reader.data(), pos, width, endian)?;
            reader.skip(width as usize)?;
            AttributeValue::String(info.string(value.value)?)
        }

        DW_FORM_block => {
            let len = reader.read_uleb128()? as usize;
            block_value(vt, spec.attr, form, strict, reader.read_bytes(len)?)?
        }
        DW_FORM_block1 => {
            let len = reader.read_u8()? as usize;
            block_value(vt, spec.attr, form, strict, reader.read_bytes(len)?)?
        }
        DW_FORM_block2 => {
            let len = reader.read_u16()? as usize;
            block_value(vt, spec.attr, form, strict, reader.read_bytes(len)?)?
        }
        DW_FORM_block4 => {
            let len = reader.read_u32()? as usize;
            block_value(vt, spec.attr, form, strict, reader.read_bytes(len)?)?
        }
        DW_FORM_exprloc => {
            let len = reader.read_uleb128()? as usize;
            AttributeValue::Exprloc(reader.read_bytes(len)?)
        }

        DW_FORM_flag => AttributeValue::Flag(reader.read_u8()? != 0),
        DW_FORM_flag_present => AttributeValue::Flag(true),

        DW_FORM_ref1 | DW_FORM_ref2 | DW_FORM_ref4 | DW_FORM_ref8 | DW_FORM_ref_udata => {
            let relative = match form {
                DW_FORM_ref1 => u64::from(reader.read_u8()?),
                DW_FORM_ref2 => u64::from(reader.read_u16()?),
                DW_FORM_ref4 => u64::from(reader.read_u32()?),
                DW_FORM_ref8 => reader.read_u64()?,
                _ => reader.read_uleb128()?,
            };
            let absolute = unit.offset.wrapping_add(relative);
            if absolute < unit.die_offset || absolute >= unit.end_offset {
                return Err(DwarfErrorKind::InvalidDwarf.into());
            }
            AttributeValue::UnitRef(absolute)
        }

        DW_FORM_ref_addr => {
            // Address-sized in DWARF 2, offset-sized from DWARF 3 on.
            let width = if unit.version == 2 {
                unit.address_size
            } else {
                unit.offset_size
            };
            let pos = reader.pos();
            let relocs = info.reloc_map(section_id)?;
            let value = relocs.read(reader.data(), pos, width, endian)?;
            reader.skip(width as usize)?;
            let len = info.section_data(SectionId::DebugInfo).len() as u64;
            if value.value >= len {
                return Err(DwarfErrorKind::InvalidDwarf.into());
            }
            AttributeValue::GlobalRef(value.value)
        }

        DW_FORM_ref_sig8 => AttributeValue::TypeSignature(reader.read_u64()?),

        _ => return Err(DwarfErrorKind::BadForm(form).into()),
    };

    Ok(Attribute {
        name: spec.attr,
        form,
        value,
    })
}

fn block_value<'d>(
    vt: &crate::version::VersionTable,
    attr: u32,
    form: u32,
    strict: bool,
    bytes: &'d [u8],
) -> Result<AttributeValue<'d>, DwarfError> {
    // In DWARF 2 and 3, expressions are encoded as plain blocks; the class
    // table tells whether this attribute holds one.
    match vt.form_class(attr, form, strict) {
        Ok(DwClass::Exprloc) => Ok(AttributeValue::Exprloc(bytes)),
        _ => Ok(AttributeValue::Block(bytes)),
    }
}

/// Advances the reader past one attribute value without decoding it.
pub(crate) fn skip_form(
    reader: &mut SectionReader<'_>,
    unit: &Unit,
    form: u32,
) -> Result<(), DwarfError> {
    match form {
        DW_FORM_addr => reader.skip(unit.address_size as usize),
        DW_FORM_data1 | DW_FORM_ref1 | DW_FORM_flag => reader.skip(1),
        DW_FORM_data2 | DW_FORM_ref2 => reader.skip(2),
        DW_FORM_data4 | DW_FORM_ref4 => reader.skip(4),
        DW_FORM_data8 | DW_FORM_ref8 | DW_FORM_ref_sig8 => reader.skip(8),
        DW_FORM_udata | DW_FORM_ref_udata | DW_FORM_sdata => {
            reader.read_uleb128().map(|_| ())
        }
        DW_FORM_string => reader.read_cstr().map(|_| ()),
        DW_FORM_strp | DW_FORM_sec_offset => reader.skip(unit.offset_size as usize),
        DW_FORM_ref_addr => reader.skip(if unit.version == 2 {
            unit.address_size as usize
        } else {
            unit.offset_size as usize
        }),
        DW_FORM_block | DW_FORM_exprloc => {
            let len = reader.read_uleb128()? as usize;
            reader.skip(len)
        }
        DW_FORM_block1 => {
            let len = reader.read_u8()? as usize;
            reader.skip(len)
        }
        DW_FORM_block2 => {
            let len = reader.read_u16()? as usize;
            reader.skip(len)
        }
        DW_FORM_block4 => {
            let len = reader.read_u32()? as usize;
            reader.skip(len)
        }
        DW_FORM_flag_present | DW_FORM_implicit_const => Ok(()),
        DW_FORM_indirect => {
            let form = reader.read_uleb128()? as u32;
            if form == DW_FORM_indirect {
                return Err(DwarfErrorKind::BadForm(form).into());
            }
            skip_form(reader, unit, form)
        }
        _ => Err(DwarfErrorKind::BadForm(form).into()),
    }
}
