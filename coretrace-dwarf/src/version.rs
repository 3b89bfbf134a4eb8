//! Per-version attribute and form class tables.
//!
//! DWARF encodes one attribute value in one of many forms, and the same
//! form can carry different semantic classes depending on the attribute and
//! the standard version (a `DW_FORM_data4` is a plain constant in DWARF 4
//! but may be a location list pointer in DWARF 2). These tables record, per
//! supported version, which classes an (attribute, form) pair may take, and
//! resolve the ambiguous cases.
//!
//! Version tables compose: the DWARF 3 table is the DWARF 2 table with
//! overrides applied, DWARF 4 builds on DWARF 3, and the GNU/MIPS vendor
//! attributes extend whichever version is active unless strict mode
//! disables them.

use std::collections::HashMap;

use bitflags::bitflags;
use once_cell::sync::Lazy;

use crate::constants::*;
use crate::error::{DwarfError, DwarfErrorKind};

bitflags! {
    /// A set of semantic classes an attribute value may belong to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClassSet: u16 {
        /// The form is `DW_FORM_indirect`; the real form follows the code.
        const INDIRECT = 1 << 0;
        /// A machine address in the program's address space.
        const ADDRESS = 1 << 1;
        /// An uninterpreted block of bytes.
        const BLOCK = 1 << 2;
        /// An integer constant.
        const CONSTANT = 1 << 3;
        /// A DWARF expression.
        const EXPRLOC = 1 << 4;
        /// A boolean flag.
        const FLAG = 1 << 5;
        /// A reference to another DIE.
        const REFERENCE = 1 << 6;
        /// A string.
        const STRING = 1 << 7;
        /// An offset into `.debug_loc`.
        const LOCLISTPTR = 1 << 8;
        /// An offset into `.debug_line`.
        const LINEPTR = 1 << 9;
        /// An offset into `.debug_macinfo`.
        const MACPTR = 1 << 10;
        /// An offset into `.debug_ranges`.
        const RANGELISTPTR = 1 << 11;
    }
}

/// The resolved semantic class of one attribute value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DwClass {
    /// A machine address.
    Address,
    /// An uninterpreted block of bytes.
    Block,
    /// An integer constant.
    Constant,
    /// A DWARF expression.
    Exprloc,
    /// A boolean flag.
    Flag,
    /// A reference to another DIE.
    Reference,
    /// A string.
    String,
    /// An offset into `.debug_loc`.
    LoclistPtr,
    /// An offset into `.debug_line`.
    LinePtr,
    /// An offset into `.debug_macinfo`.
    MacPtr,
    /// An offset into `.debug_ranges`.
    RangelistPtr,
}

impl DwClass {
    fn from_single(set: ClassSet) -> Option<DwClass> {
        let single = [
            (ClassSet::ADDRESS, DwClass::Address),
            (ClassSet::BLOCK, DwClass::Block),
            (ClassSet::CONSTANT, DwClass::Constant),
            (ClassSet::EXPRLOC, DwClass::Exprloc),
            (ClassSet::FLAG, DwClass::Flag),
            (ClassSet::REFERENCE, DwClass::Reference),
            (ClassSet::STRING, DwClass::String),
            (ClassSet::LOCLISTPTR, DwClass::LoclistPtr),
            (ClassSet::LINEPTR, DwClass::LinePtr),
            (ClassSet::MACPTR, DwClass::MacPtr),
            (ClassSet::RANGELISTPTR, DwClass::RangelistPtr),
        ];
        single
            .into_iter()
            .find(|&(flag, _)| set == flag)
            .map(|(_, class)| class)
    }
}

// Attribute class shorthands matching how the standard words them.
const CONST: ClassSet = ClassSet::CONSTANT;
const REF: ClassSet = ClassSet::REFERENCE;
const ADDR: ClassSet = ClassSet::ADDRESS;
const STRING: ClassSet = ClassSet::STRING;
const FLAG: ClassSet = ClassSet::FLAG;
const BLOCK: ClassSet = ClassSet::BLOCK;
const LOCATION: ClassSet = ClassSet::EXPRLOC.union(ClassSet::LOCLISTPTR);
const STATIC_LOCATION: ClassSet = ClassSet::EXPRLOC.union(ClassSet::REFERENCE);
const DYNVAL: ClassSet = ClassSet::CONSTANT
    .union(ClassSet::EXPRLOC)
    .union(ClassSet::REFERENCE);
const CONST_OR_REF: ClassSet = ClassSet::CONSTANT.union(ClassSet::REFERENCE);

/// The class tables of one DWARF version (possibly a vendor extension).
#[derive(Debug, Default)]
pub struct VersionTable {
    attrs: HashMap<u32, ClassSet>,
    forms: HashMap<u32, ClassSet>,
}

impl VersionTable {
    fn with(
        base: Option<&VersionTable>,
        attrs: &[(u32, ClassSet)],
        forms: &[(u32, ClassSet)],
    ) -> VersionTable {
        let mut table = match base {
            Some(base) => VersionTable {
                attrs: base.attrs.clone(),
                forms: base.forms.clone(),
            },
            None => VersionTable::default(),
        };
        // Extension entries override the source.
        table.attrs.extend(attrs.iter().copied());
        table.forms.extend(forms.iter().copied());
        table
    }

    /// Returns the table for a core DWARF version.
    pub fn get(version: u16) -> Option<&'static VersionTable> {
        match version {
            2 => Some(&DWARF_2),
            3 => Some(&DWARF_3),
            4 => Some(&DWARF_4),
            _ => None,
        }
    }

    /// The classes an attribute may take, or `None` for unknown attributes.
    ///
    /// Unless `strict` is set, the GNU and MIPS vendor ranges are consulted
    /// for attributes the core version does not define.
    pub fn attr_classes(&self, attr: u32, strict: bool) -> Option<ClassSet> {
        if let Some(&classes) = self.attrs.get(&attr) {
            return Some(classes);
        }
        if !strict {
            return VENDOR.attrs.get(&attr).copied();
        }
        None
    }

    /// The classes a form may carry, or `None` for unknown forms.
    pub fn form_classes(&self, form: u32) -> Option<ClassSet> {
        self.forms.get(&form).copied()
    }

    /// Whether the attribute may be encoded with the form at all.
    pub fn form_allowed(&self, attr: u32, form: u32, strict: bool) -> bool {
        let Some(form_classes) = self.form_classes(form) else {
            return false;
        };

        if !strict {
            // GCC emits attributes from later versions without
            // -gstrict-dwarf. DW_AT_ranges in version 2 is the awkward one
            // since that version has no rangelistptr class; accept plain
            // 4- or 8-byte data. DW_AT_upper_bound may also appear as a
            // block (DWARF 3 usage in DWARF 2 data).
            if attr == DW_AT_ranges {
                return form_classes.contains(ClassSet::CONSTANT)
                    && (form == DW_FORM_data4 || form == DW_FORM_data8);
            }
            if attr == DW_AT_upper_bound && form_classes.contains(ClassSet::BLOCK) {
                return true;
            }
            if attr == DW_AT_GNU_odr_signature {
                return form_classes.contains(ClassSet::CONSTANT) && form == DW_FORM_data8;
            }
        }

        match self.attr_classes(attr, strict) {
            Some(attr_classes) => !(attr_classes & form_classes).is_empty(),
            // Unknown attributes decode by form alone.
            None => !strict,
        }
    }

    /// Resolves the semantic class of an (attribute, form) pair.
    ///
    /// When the intersection of the two class sets is ambiguous, the one
    /// known ambiguity (a constant-width form on a location-valued
    /// attribute, as in `DW_AT_data_member_location` with `DW_FORM_data4`
    /// in DWARF 3) resolves to the list pointer.
    pub fn form_class(&self, attr: u32, form: u32, strict: bool) -> Result<DwClass, DwarfError> {
        let form_classes = self
            .form_classes(form)
            .ok_or(DwarfErrorKind::BadForm(form))?;

        if !strict && attr == DW_AT_ranges && (form == DW_FORM_data4 || form == DW_FORM_data8) {
            return Ok(DwClass::RangelistPtr);
        }

        let candidates = match self.attr_classes(attr, strict) {
            Some(attr_classes) => {
                let both = attr_classes & form_classes & !ClassSet::INDIRECT;
                if both.is_empty() {
                    // Tolerate the mismatch outside strict mode and fall
                    // back to the form's own classes.
                    if strict {
                        return Err(DwarfErrorKind::InvalidDwarf.into());
                    }
                    form_classes & !ClassSet::INDIRECT
                } else {
                    both
                }
            }
            None if strict => return Err(DwarfErrorKind::InvalidDwarf.into()),
            None => form_classes & !ClassSet::INDIRECT,
        };

        if let Some(class) = DwClass::from_single(candidates) {
            return Ok(class);
        }

        if candidates == ClassSet::CONSTANT.union(ClassSet::LOCLISTPTR) {
            return Ok(DwClass::LoclistPtr);
        }

        // A data form used for an attribute whose class cannot be pinned
        // down further is treated as a plain constant.
        if candidates.contains(ClassSet::CONSTANT) {
            return Ok(DwClass::Constant);
        }
        if candidates.contains(ClassSet::EXPRLOC) {
            return Ok(DwClass::Exprloc);
        }

        Err(DwarfErrorKind::InvalidDwarf.into())
    }
}

static DWARF_2: Lazy<VersionTable> = Lazy::new(|| {
    // In DWARF 2, location expressions can have classes of constant or
    // block. To tell those apart from plain blocks and numbers, the block
    // forms are retrofitted with the exprloc class from DWARF 4 and the
    // data forms with the various pointer classes.
    const DW2_DATA: ClassSet = ClassSet::CONSTANT
        .union(ClassSet::LINEPTR)
        .union(ClassSet::LOCLISTPTR)
        .union(ClassSet::MACPTR);
    const DW2_BLOCK: ClassSet = ClassSet::EXPRLOC.union(ClassSet::BLOCK);

    VersionTable::with(
        None,
        &[
            (DW_AT_sibling, REF),
            (DW_AT_location, LOCATION),
            (DW_AT_name, STRING),
            (DW_AT_ordering, CONST),
            (DW_AT_byte_size, CONST),
            (DW_AT_bit_offset, CONST),
            (DW_AT_bit_size, CONST),
            (DW_AT_stmt_list, ClassSet::LINEPTR),
            (DW_AT_low_pc, ADDR),
            (DW_AT_high_pc, ADDR),
            (DW_AT_language, CONST),
            (DW_AT_discr, REF),
            (DW_AT_discr_value, CONST),
            (DW_AT_visibility, CONST),
            (DW_AT_import, REF),
            (DW_AT_string_length, LOCATION),
            (DW_AT_common_reference, REF),
            (DW_AT_comp_dir, STRING),
            (DW_AT_const_value, STRING.union(CONST).union(BLOCK)),
            (DW_AT_containing_type, REF),
            (DW_AT_default_value, REF),
            (DW_AT_inline, CONST),
            (DW_AT_is_optional, FLAG),
            (DW_AT_lower_bound, CONST_OR_REF),
            (DW_AT_producer, STRING),
            (DW_AT_prototyped, FLAG),
            (DW_AT_return_addr, LOCATION),
            (DW_AT_start_scope, CONST),
            (DW_AT_bit_stride, CONST),
            (DW_AT_upper_bound, CONST_OR_REF),
            (DW_AT_abstract_origin, REF),
            (DW_AT_accessibility, CONST),
            (DW_AT_address_class, CONST),
            (DW_AT_artificial, FLAG),
            (DW_AT_base_types, REF),
            (DW_AT_calling_convention, CONST),
            (DW_AT_count, CONST_OR_REF),
            (DW_AT_data_member_location, STATIC_LOCATION),
            (DW_AT_decl_column, CONST),
            (DW_AT_decl_file, CONST),
            (DW_AT_decl_line, CONST),
            (DW_AT_declaration, FLAG),
            (DW_AT_discr_list, BLOCK),
            (DW_AT_encoding, CONST),
            (DW_AT_external, FLAG),
            (DW_AT_frame_base, LOCATION),
            (DW_AT_friend, REF),
            (DW_AT_identifier_case, CONST),
            (DW_AT_macro_info, ClassSet::MACPTR),
            (DW_AT_namelist_item, BLOCK),
            (DW_AT_priority, REF),
            (DW_AT_segment, LOCATION),
            (DW_AT_specification, REF),
            (DW_AT_static_link, LOCATION),
            (DW_AT_type, REF),
            (DW_AT_use_location, LOCATION),
            (DW_AT_variable_parameter, FLAG),
            (DW_AT_virtuality, CONST),
            (DW_AT_vtable_elem_location, STATIC_LOCATION),
        ],
        &[
            (DW_FORM_block, DW2_BLOCK),
            (DW_FORM_block1, DW2_BLOCK),
            (DW_FORM_block2, DW2_BLOCK),
            (DW_FORM_block4, DW2_BLOCK),
            (DW_FORM_data1, DW2_DATA),
            (DW_FORM_data2, DW2_DATA),
            (DW_FORM_data4, DW2_DATA),
            (DW_FORM_data8, DW2_DATA),
            (DW_FORM_sdata, DW2_DATA),
            (DW_FORM_udata, DW2_DATA),
            (DW_FORM_flag, FLAG),
            (DW_FORM_ref1, REF),
            (DW_FORM_ref2, REF),
            (DW_FORM_ref4, REF),
            (DW_FORM_ref8, REF),
            (DW_FORM_ref_udata, REF),
            (DW_FORM_string, STRING),
            (DW_FORM_strp, STRING),
            (DW_FORM_addr, ADDR),
            (DW_FORM_ref_addr, REF),
            (DW_FORM_indirect, ClassSet::INDIRECT),
            (DW_FORM_implicit_const, CONST),
        ],
    )
});

static DWARF_3: Lazy<VersionTable> = Lazy::new(|| {
    // Only data4 and data8 keep the pointer classes in DWARF 3, and they
    // gain rangelistptr.
    const DW3_DATA: ClassSet = ClassSet::CONSTANT
        .union(ClassSet::LINEPTR)
        .union(ClassSet::LOCLISTPTR)
        .union(ClassSet::MACPTR)
        .union(ClassSet::RANGELISTPTR);

    VersionTable::with(
        Some(&DWARF_2),
        &[
            (DW_AT_location, LOCATION),
            (DW_AT_byte_size, DYNVAL),
            (DW_AT_bit_offset, DYNVAL),
            (DW_AT_bit_size, DYNVAL),
            (DW_AT_string_length, LOCATION),
            (DW_AT_lower_bound, DYNVAL),
            (DW_AT_return_addr, LOCATION),
            (DW_AT_bit_stride, DYNVAL),
            (DW_AT_upper_bound, DYNVAL),
            (DW_AT_count, DYNVAL),
            (
                DW_AT_data_member_location,
                ClassSet::EXPRLOC
                    .union(ClassSet::CONSTANT)
                    .union(ClassSet::LOCLISTPTR),
            ),
            (DW_AT_frame_base, LOCATION),
            (DW_AT_segment, LOCATION),
            (DW_AT_static_link, LOCATION),
            (DW_AT_use_location, LOCATION),
            (DW_AT_vtable_elem_location, LOCATION),
            (DW_AT_allocated, DYNVAL),
            (DW_AT_associated, DYNVAL),
            (DW_AT_data_location, ClassSet::EXPRLOC),
            (DW_AT_byte_stride, DYNVAL),
            (DW_AT_entry_pc, ADDR),
            (DW_AT_use_UTF8, FLAG),
            (DW_AT_extension, REF),
            (DW_AT_ranges, ClassSet::RANGELISTPTR),
            (DW_AT_trampoline, ADDR.union(FLAG).union(REF).union(STRING)),
            (DW_AT_call_column, CONST),
            (DW_AT_call_file, CONST),
            (DW_AT_call_line, CONST),
            (DW_AT_description, STRING),
            (DW_AT_binary_scale, CONST),
            (DW_AT_decimal_scale, CONST),
            (DW_AT_small, REF),
            (DW_AT_decimal_sign, CONST),
            (DW_AT_digit_count, CONST),
            (DW_AT_picture_string, STRING),
            (DW_AT_mutable, FLAG),
            (DW_AT_threads_scaled, FLAG),
            (DW_AT_explicit, FLAG),
            (DW_AT_object_pointer, REF),
            (DW_AT_endianity, CONST),
            (DW_AT_elemental, FLAG),
            (DW_AT_pure, FLAG),
            (DW_AT_recursive, FLAG),
        ],
        &[
            (DW_FORM_ref_addr, REF),
            (DW_FORM_data1, CONST),
            (DW_FORM_data2, CONST),
            (DW_FORM_data4, DW3_DATA),
            (DW_FORM_data8, DW3_DATA),
            (DW_FORM_sdata, CONST),
            (DW_FORM_udata, CONST),
        ],
    )
});

static DWARF_4: Lazy<VersionTable> = Lazy::new(|| {
    const SEC_OFFSET: ClassSet = ClassSet::LINEPTR
        .union(ClassSet::LOCLISTPTR)
        .union(ClassSet::MACPTR)
        .union(ClassSet::RANGELISTPTR);

    VersionTable::with(
        Some(&DWARF_3),
        &[
            (DW_AT_high_pc, ADDR.union(CONST)),
            (DW_AT_namelist_item, REF),
            (DW_AT_signature, REF),
            (DW_AT_main_subprogram, FLAG),
            (DW_AT_data_bit_offset, CONST),
            (DW_AT_const_expr, FLAG),
            (DW_AT_enum_class, FLAG),
            (DW_AT_linkage_name, STRING),
        ],
        &[
            (DW_FORM_data4, CONST),
            (DW_FORM_data8, CONST),
            (DW_FORM_sec_offset, SEC_OFFSET),
            (DW_FORM_exprloc, ClassSet::EXPRLOC),
            (DW_FORM_flag_present, FLAG),
            (DW_FORM_ref_sig8, REF),
            (DW_FORM_block, BLOCK),
            (DW_FORM_block1, BLOCK),
            (DW_FORM_block2, BLOCK),
            (DW_FORM_block4, BLOCK),
        ],
    )
});

// The GNU and MIPS vendor attribute ranges, consulted in non-strict mode.
static VENDOR: Lazy<VersionTable> = Lazy::new(|| {
    VersionTable::with(
        None,
        &[
            (DW_AT_GNU_vector, FLAG),
            (DW_AT_GNU_guarded_by, CONST),
            (DW_AT_GNU_pt_guarded_by, CONST),
            (DW_AT_GNU_guarded, CONST),
            (DW_AT_GNU_pt_guarded, CONST),
            (DW_AT_GNU_locks_excluded, CONST),
            (DW_AT_GNU_exclusive_locks_required, CONST),
            (DW_AT_GNU_shared_locks_required, CONST),
            (DW_AT_GNU_odr_signature, CONST),
            (DW_AT_GNU_template_name, STRING),
            (DW_AT_GNU_call_site_value, ClassSet::EXPRLOC),
            (DW_AT_GNU_call_site_data_value, ClassSet::EXPRLOC),
            (DW_AT_GNU_call_site_target, ClassSet::EXPRLOC),
            (DW_AT_GNU_call_site_target_clobbered, ClassSet::EXPRLOC),
            (DW_AT_GNU_tail_call, FLAG),
            (DW_AT_GNU_all_tail_call_sites, FLAG),
            (DW_AT_GNU_all_call_sites, FLAG),
            (DW_AT_GNU_all_source_call_sites, FLAG),
            (DW_AT_MIPS_fde, CONST),
            (DW_AT_MIPS_linkage_name, STRING),
            (DW_AT_MIPS_stride, REF),
            (DW_AT_MIPS_abstract_name, STRING),
            (DW_AT_MIPS_clone_origin, REF),
            (DW_AT_MIPS_has_inlines, FLAG),
            (DW_AT_MIPS_stride_byte, CONST),
            (DW_AT_MIPS_stride_elem, CONST),
            (DW_AT_MIPS_ptr_dopetype, REF),
            (DW_AT_MIPS_allocatable_dopetype, REF),
            (DW_AT_MIPS_assumed_shape_dopetype, REF),
            (DW_AT_MIPS_assumed_size, FLAG),
        ],
        &[],
    )
});

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_versions_available() {
        assert!(VersionTable::get(2).is_some());
        assert!(VersionTable::get(3).is_some());
        assert!(VersionTable::get(4).is_some());
        assert!(VersionTable::get(5).is_none());
    }

    #[test]
    fn test_dw2_data_form_is_pointer_capable() {
        let dw2 = VersionTable::get(2).unwrap();
        // A 4-byte constant on DW_AT_stmt_list means a line table pointer.
        assert_eq!(
            dw2.form_class(DW_AT_stmt_list, DW_FORM_data4, false).unwrap(),
            DwClass::LinePtr
        );
        // On DW_AT_location it means a location list pointer.
        assert_eq!(
            dw2.form_class(DW_AT_location, DW_FORM_data4, false).unwrap(),
            DwClass::LoclistPtr
        );
    }

    #[test]
    fn test_dw3_data_member_location_ambiguity() {
        let dw3 = VersionTable::get(3).unwrap();
        // Both constant and loclistptr are candidates; the hook picks the
        // pointer.
        assert_eq!(
            dw3.form_class(DW_AT_data_member_location, DW_FORM_data4, false)
                .unwrap(),
            DwClass::LoclistPtr
        );
        // data1 can only be a constant.
        assert_eq!(
            dw3.form_class(DW_AT_data_member_location, DW_FORM_data1, false)
                .unwrap(),
            DwClass::Constant
        );
    }

    #[test]
    fn test_dw4_high_pc_constant() {
        let dw4 = VersionTable::get(4).unwrap();
        assert_eq!(
            dw4.form_class(DW_AT_high_pc, DW_FORM_data8, false).unwrap(),
            DwClass::Constant
        );
        assert_eq!(
            dw4.form_class(DW_AT_high_pc, DW_FORM_addr, false).unwrap(),
            DwClass::Address
        );
    }

    #[test]
    fn test_gnu_ranges_in_dwarf2() {
        let dw2 = VersionTable::get(2).unwrap();
        // GCC emits DW_AT_ranges into version 2 units; tolerated as a
        // range list pointer unless strict.
        assert!(dw2.form_allowed(DW_AT_ranges, DW_FORM_data4, false));
        assert_eq!(
            dw2.form_class(DW_AT_ranges, DW_FORM_data4, false).unwrap(),
            DwClass::RangelistPtr
        );
        assert!(!dw2.form_allowed(DW_AT_ranges, DW_FORM_data4, true));
    }

    #[test]
    fn test_strict_refuses_vendor() {
        let dw4 = VersionTable::get(4).unwrap();
        assert!(dw4.form_allowed(DW_AT_GNU_tail_call, DW_FORM_flag_present, false));
        assert!(!dw4.form_allowed(DW_AT_GNU_tail_call, DW_FORM_flag_present, true));
    }

    #[test]
    fn test_unknown_form() {
        let dw4 = VersionTable::get(4).unwrap();
        assert_eq!(
            dw4.form_class(DW_AT_name, 0x7f, false).unwrap_err().kind(),
            DwarfErrorKind::BadForm(0x7f)
        );
    }
}
