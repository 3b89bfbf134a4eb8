//! DWARF constants for versions 2 through 4, with the GNU and MIPS vendor
//! ranges this reader recognizes.

#![allow(non_upper_case_globals)]
#![allow(missing_docs)]

// Tags.
pub const DW_TAG_array_type: u32 = 0x01;
pub const DW_TAG_class_type: u32 = 0x02;
pub const DW_TAG_enumeration_type: u32 = 0x04;
pub const DW_TAG_formal_parameter: u32 = 0x05;
pub const DW_TAG_imported_declaration: u32 = 0x08;
pub const DW_TAG_label: u32 = 0x0a;
pub const DW_TAG_lexical_block: u32 = 0x0b;
pub const DW_TAG_member: u32 = 0x0d;
pub const DW_TAG_pointer_type: u32 = 0x0f;
pub const DW_TAG_compile_unit: u32 = 0x11;
pub const DW_TAG_structure_type: u32 = 0x13;
pub const DW_TAG_subroutine_type: u32 = 0x15;
pub const DW_TAG_typedef: u32 = 0x16;
pub const DW_TAG_union_type: u32 = 0x17;
pub const DW_TAG_unspecified_parameters: u32 = 0x18;
pub const DW_TAG_variant: u32 = 0x19;
pub const DW_TAG_inheritance: u32 = 0x1c;
pub const DW_TAG_subrange_type: u32 = 0x21;
pub const DW_TAG_base_type: u32 = 0x24;
pub const DW_TAG_const_type: u32 = 0x26;
pub const DW_TAG_enumerator: u32 = 0x28;
pub const DW_TAG_subprogram: u32 = 0x2e;
pub const DW_TAG_variable: u32 = 0x34;
pub const DW_TAG_volatile_type: u32 = 0x35;
pub const DW_TAG_restrict_type: u32 = 0x37;
pub const DW_TAG_namespace: u32 = 0x39;
pub const DW_TAG_imported_module: u32 = 0x3a;
pub const DW_TAG_partial_unit: u32 = 0x3c;
pub const DW_TAG_imported_unit: u32 = 0x3d;
pub const DW_TAG_rvalue_reference_type: u32 = 0x42;
pub const DW_TAG_type_unit: u32 = 0x41;
pub const DW_TAG_GNU_call_site: u32 = 0x4109;
pub const DW_TAG_GNU_call_site_parameter: u32 = 0x410a;

// Attributes.
pub const DW_AT_sibling: u32 = 0x01;
pub const DW_AT_location: u32 = 0x02;
pub const DW_AT_name: u32 = 0x03;
pub const DW_AT_ordering: u32 = 0x09;
pub const DW_AT_byte_size: u32 = 0x0b;
pub const DW_AT_bit_offset: u32 = 0x0c;
pub const DW_AT_bit_size: u32 = 0x0d;
pub const DW_AT_stmt_list: u32 = 0x10;
pub const DW_AT_low_pc: u32 = 0x11;
pub const DW_AT_high_pc: u32 = 0x12;
pub const DW_AT_language: u32 = 0x13;
pub const DW_AT_discr: u32 = 0x15;
pub const DW_AT_discr_value: u32 = 0x16;
pub const DW_AT_visibility: u32 = 0x17;
pub const DW_AT_import: u32 = 0x18;
pub const DW_AT_string_length: u32 = 0x19;
pub const DW_AT_common_reference: u32 = 0x1a;
pub const DW_AT_comp_dir: u32 = 0x1b;
pub const DW_AT_const_value: u32 = 0x1c;
pub const DW_AT_containing_type: u32 = 0x1d;
pub const DW_AT_default_value: u32 = 0x1e;
pub const DW_AT_inline: u32 = 0x20;
pub const DW_AT_is_optional: u32 = 0x21;
pub const DW_AT_lower_bound: u32 = 0x22;
pub const DW_AT_producer: u32 = 0x25;
pub const DW_AT_prototyped: u32 = 0x27;
pub const DW_AT_return_addr: u32 = 0x2a;
pub const DW_AT_start_scope: u32 = 0x2c;
pub const DW_AT_bit_stride: u32 = 0x2e;
pub const DW_AT_upper_bound: u32 = 0x2f;
pub const DW_AT_abstract_origin: u32 = 0x31;
pub const DW_AT_accessibility: u32 = 0x32;
pub const DW_AT_address_class: u32 = 0x33;
pub const DW_AT_artificial: u32 = 0x34;
pub const DW_AT_base_types: u32 = 0x35;
pub const DW_AT_calling_convention: u32 = 0x36;
pub const DW_AT_count: u32 = 0x37;
pub const DW_AT_data_member_location: u32 = 0x38;
pub const DW_AT_decl_column: u32 = 0x39;
pub const DW_AT_decl_file: u32 = 0x3a;
pub const DW_AT_decl_line: u32 = 0x3b;
pub const DW_AT_declaration: u32 = 0x3c;
pub const DW_AT_discr_list: u32 = 0x3d;
pub const DW_AT_encoding: u32 = 0x3e;
pub const DW_AT_external: u32 = 0x3f;
pub const DW_AT_frame_base: u32 = 0x40;
pub const DW_AT_friend: u32 = 0x41;
pub const DW_AT_identifier_case: u32 = 0x42;
pub const DW_AT_macro_info: u32 = 0x43;
pub const DW_AT_namelist_item: u32 = 0x44;
pub const DW_AT_priority: u32 = 0x45;
pub const DW_AT_segment: u32 = 0x46;
pub const DW_AT_specification: u32 = 0x47;
pub const DW_AT_static_link: u32 = 0x48;
pub const DW_AT_type: u32 = 0x49;
pub const DW_AT_use_location: u32 = 0x4a;
pub const DW_AT_variable_parameter: u32 = 0x4b;
pub const DW_AT_virtuality: u32 = 0x4c;
pub const DW_AT_vtable_elem_location: u32 = 0x4d;
pub const DW_AT_allocated: u32 = 0x4e;
pub const DW_AT_associated: u32 = 0x4f;
pub const DW_AT_data_location: u32 = 0x50;
pub const DW_AT_byte_stride: u32 = 0x51;
pub const DW_AT_entry_pc: u32 = 0x52;
pub const DW_AT_use_UTF8: u32 = 0x53;
pub const DW_AT_extension: u32 = 0x54;
pub const DW_AT_ranges: u32 = 0x55;
pub const DW_AT_trampoline: u32 = 0x56;
pub const DW_AT_call_column: u32 = 0x57;
pub const DW_AT_call_file: u32 = 0x58;
pub const DW_AT_call_line: u32 = 0x59;
pub const DW_AT_description: u32 = 0x5a;
pub const DW_AT_binary_scale: u32 = 0x5b;
pub const DW_AT_decimal_scale: u32 = 0x5c;
pub const DW_AT_small: u32 = 0x5d;
pub const DW_AT_decimal_sign: u32 = 0x5e;
pub const DW_AT_digit_count: u32 = 0x5f;
pub const DW_AT_picture_string: u32 = 0x60;
pub const DW_AT_mutable: u32 = 0x61;
pub const DW_AT_threads_scaled: u32 = 0x62;
pub const DW_AT_explicit: u32 = 0x63;
pub const DW_AT_object_pointer: u32 = 0x64;
pub const DW_AT_endianity: u32 = 0x65;
pub const DW_AT_elemental: u32 = 0x66;
pub const DW_AT_pure: u32 = 0x67;
pub const DW_AT_recursive: u32 = 0x68;
pub const DW_AT_signature: u32 = 0x69;
pub const DW_AT_main_subprogram: u32 = 0x6a;
pub const DW_AT_data_bit_offset: u32 = 0x6b;
pub const DW_AT_const_expr: u32 = 0x6c;
pub const DW_AT_enum_class: u32 = 0x6d;
pub const DW_AT_linkage_name: u32 = 0x6e;

// MIPS/SGI vendor attributes.
pub const DW_AT_MIPS_fde: u32 = 0x2001;
pub const DW_AT_MIPS_loop_begin: u32 = 0x2002;
pub const DW_AT_MIPS_tail_loop_begin: u32 = 0x2003;
pub const DW_AT_MIPS_epilog_begin: u32 = 0x2004;
pub const DW_AT_MIPS_loop_unroll_factor: u32 = 0x2005;
pub const DW_AT_MIPS_software_pipeline_depth: u32 = 0x2006;
pub const DW_AT_MIPS_linkage_name: u32 = 0x2007;
pub const DW_AT_MIPS_stride: u32 = 0x2008;
pub const DW_AT_MIPS_abstract_name: u32 = 0x2009;
pub const DW_AT_MIPS_clone_origin: u32 = 0x200a;
pub const DW_AT_MIPS_has_inlines: u32 = 0x200b;
pub const DW_AT_MIPS_stride_byte: u32 = 0x200c;
pub const DW_AT_MIPS_stride_elem: u32 = 0x200d;
pub const DW_AT_MIPS_ptr_dopetype: u32 = 0x200e;
pub const DW_AT_MIPS_allocatable_dopetype: u32 = 0x200f;
pub const DW_AT_MIPS_assumed_shape_dopetype: u32 = 0x2010;
pub const DW_AT_MIPS_assumed_size: u32 = 0x2011;

// GNU vendor attributes.
pub const DW_AT_sf_names: u32 = 0x2101;
pub const DW_AT_src_info: u32 = 0x2102;
pub const DW_AT_mac_info: u32 = 0x2103;
pub const DW_AT_src_coords: u32 = 0x2104;
pub const DW_AT_body_begin: u32 = 0x2105;
pub const DW_AT_body_end: u32 = 0x2106;
pub const DW_AT_GNU_vector: u32 = 0x2107;
pub const DW_AT_GNU_guarded_by: u32 = 0x2108;
pub const DW_AT_GNU_pt_guarded_by: u32 = 0x2109;
pub const DW_AT_GNU_guarded: u32 = 0x210a;
pub const DW_AT_GNU_pt_guarded: u32 = 0x210b;
pub const DW_AT_GNU_locks_excluded: u32 = 0x210c;
pub const DW_AT_GNU_exclusive_locks_required: u32 = 0x210d;
pub const DW_AT_GNU_shared_locks_required: u32 = 0x210e;
pub const DW_AT_GNU_odr_signature: u32 = 0x210f;
pub const DW_AT_GNU_template_name: u32 = 0x2110;
pub const DW_AT_GNU_call_site_value: u32 = 0x2111;
pub const DW_AT_GNU_call_site_data_value: u32 = 0x2112;
pub const DW_AT_GNU_call_site_target: u32 = 0x2113;
pub const DW_AT_GNU_call_site_target_clobbered: u32 = 0x2114;
pub const DW_AT_GNU_tail_call: u32 = 0x2115;
pub const DW_AT_GNU_all_tail_call_sites: u32 = 0x2116;
pub const DW_AT_GNU_all_call_sites: u32 = 0x2117;
pub const DW_AT_GNU_all_source_call_sites: u32 = 0x2118;

// Forms.
pub const DW_FORM_addr: u32 = 0x01;
pub const DW_FORM_block2: u32 = 0x03;
pub const DW_FORM_block4: u32 = 0x04;
pub const DW_FORM_data2: u32 = 0x05;
pub const DW_FORM_data4: u32 = 0x06;
pub const DW_FORM_data8: u32 = 0x07;
pub const DW_FORM_string: u32 = 0x08;
pub const DW_FORM_block: u32 = 0x09;
pub const DW_FORM_block1: u32 = 0x0a;
pub const DW_FORM_data1: u32 = 0x0b;
pub const DW_FORM_flag: u32 = 0x0c;
pub const DW_FORM_sdata: u32 = 0x0d;
pub const DW_FORM_strp: u32 = 0x0e;
pub const DW_FORM_udata: u32 = 0x0f;
pub const DW_FORM_ref_addr: u32 = 0x10;
pub const DW_FORM_ref1: u32 = 0x11;
pub const DW_FORM_ref2: u32 = 0x12;
pub const DW_FORM_ref4: u32 = 0x13;
pub const DW_FORM_ref8: u32 = 0x14;
pub const DW_FORM_ref_udata: u32 = 0x15;
pub const DW_FORM_indirect: u32 = 0x16;
pub const DW_FORM_sec_offset: u32 = 0x17;
pub const DW_FORM_exprloc: u32 = 0x18;
pub const DW_FORM_flag_present: u32 = 0x19;
pub const DW_FORM_ref_sig8: u32 = 0x20;
pub const DW_FORM_implicit_const: u32 = 0x21;

// Line number standard opcodes.
pub const DW_LNS_copy: u8 = 1;
pub const DW_LNS_advance_pc: u8 = 2;
pub const DW_LNS_advance_line: u8 = 3;
pub const DW_LNS_set_file: u8 = 4;
pub const DW_LNS_set_column: u8 = 5;
pub const DW_LNS_negate_stmt: u8 = 6;
pub const DW_LNS_set_basic_block: u8 = 7;
pub const DW_LNS_const_add_pc: u8 = 8;
pub const DW_LNS_fixed_advance_pc: u8 = 9;
pub const DW_LNS_set_prologue_end: u8 = 10;
pub const DW_LNS_set_epilogue_begin: u8 = 11;
pub const DW_LNS_set_isa: u8 = 12;

// Line number extended opcodes.
pub const DW_LNE_end_sequence: u8 = 1;
pub const DW_LNE_set_address: u8 = 2;
pub const DW_LNE_define_file: u8 = 3;
pub const DW_LNE_set_discriminator: u8 = 4;

// Call frame instructions. The high-two-bit opcodes carry an operand in
// the low six bits.
pub const DW_CFA_advance_loc: u8 = 0x40;
pub const DW_CFA_offset: u8 = 0x80;
pub const DW_CFA_restore: u8 = 0xc0;
pub const DW_CFA_nop: u8 = 0x00;
pub const DW_CFA_set_loc: u8 = 0x01;
pub const DW_CFA_advance_loc1: u8 = 0x02;
pub const DW_CFA_advance_loc2: u8 = 0x03;
pub const DW_CFA_advance_loc4: u8 = 0x04;
pub const DW_CFA_offset_extended: u8 = 0x05;
pub const DW_CFA_restore_extended: u8 = 0x06;
pub const DW_CFA_undefined: u8 = 0x07;
pub const DW_CFA_same_value: u8 = 0x08;
pub const DW_CFA_register: u8 = 0x09;
pub const DW_CFA_remember_state: u8 = 0x0a;
pub const DW_CFA_restore_state: u8 = 0x0b;
pub const DW_CFA_def_cfa: u8 = 0x0c;
pub const DW_CFA_def_cfa_register: u8 = 0x0d;
pub const DW_CFA_def_cfa_offset: u8 = 0x0e;
pub const DW_CFA_def_cfa_expression: u8 = 0x0f;
pub const DW_CFA_expression: u8 = 0x10;
pub const DW_CFA_offset_extended_sf: u8 = 0x11;
pub const DW_CFA_def_cfa_sf: u8 = 0x12;
pub const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
pub const DW_CFA_val_offset: u8 = 0x14;
pub const DW_CFA_val_offset_sf: u8 = 0x15;
pub const DW_CFA_val_expression: u8 = 0x16;
pub const DW_CFA_GNU_window_save: u8 = 0x2d;
pub const DW_CFA_GNU_args_size: u8 = 0x2e;
pub const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

// The expression opcodes used by call frame information.
pub const DW_OP_and: u8 = 0x1a;
pub const DW_OP_plus: u8 = 0x22;
pub const DW_OP_plus_uconst: u8 = 0x23;
pub const DW_OP_shl: u8 = 0x24;
pub const DW_OP_ge: u8 = 0x2a;
pub const DW_OP_lit0: u8 = 0x30;
pub const DW_OP_lit31: u8 = 0x4f;
pub const DW_OP_breg0: u8 = 0x70;
pub const DW_OP_breg31: u8 = 0x8f;
pub const DW_OP_bregx: u8 = 0x92;
pub const DW_OP_nop: u8 = 0x96;
pub const DW_OP_call_frame_cfa: u8 = 0x9c;
pub const DW_OP_stack_value: u8 = 0x9f;

// Pointer encodings used by .eh_frame.
pub const DW_EH_PE_absptr: u8 = 0x00;
pub const DW_EH_PE_uleb128: u8 = 0x01;
pub const DW_EH_PE_udata2: u8 = 0x02;
pub const DW_EH_PE_udata4: u8 = 0x03;
pub const DW_EH_PE_udata8: u8 = 0x04;
pub const DW_EH_PE_sleb128: u8 = 0x09;
pub const DW_EH_PE_sdata2: u8 = 0x0a;
pub const DW_EH_PE_sdata4: u8 = 0x0b;
pub const DW_EH_PE_sdata8: u8 = 0x0c;
pub const DW_EH_PE_pcrel: u8 = 0x10;
pub const DW_EH_PE_textrel: u8 = 0x20;
pub const DW_EH_PE_datarel: u8 = 0x30;
pub const DW_EH_PE_funcrel: u8 = 0x40;
pub const DW_EH_PE_aligned: u8 = 0x50;
pub const DW_EH_PE_indirect: u8 = 0x80;
pub const DW_EH_PE_omit: u8 = 0xff;
