//! End-to-end tests over hand-assembled DWARF sections.

use std::borrow::Cow;
use std::collections::HashMap;

use fallible_iterator::FallibleIterator;
use similar_asserts::assert_eq;

use coretrace_common::{Arch, Backend};
use coretrace_dwarf::constants::*;
use coretrace_dwarf::{
    AttributeValue, DwarfErrorKind, DwarfInfo, DwarfOpts, DwarfSection, DwarfSource, Endian,
    LocListIter, RangesIter, RawReloc, RelocSymbol, SectionId, SymbolSection,
};

/// A little-endian byte buffer with DWARF encoding helpers.
#[derive(Default)]
struct SectionBuilder(Vec<u8>);

impl SectionBuilder {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn u8(&mut self, value: u8) -> &mut Self {
        self.0.push(value);
        self
    }

    fn u16(&mut self, value: u16) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u64(&mut self, value: u64) -> &mut Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn uleb(&mut self, mut value: u64) -> &mut Self {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.0.push(byte);
            if value == 0 {
                return self;
            }
        }
    }

    fn cstr(&mut self, value: &str) -> &mut Self {
        self.0.extend_from_slice(value.as_bytes());
        self.0.push(0);
        self
    }

    /// Patches the 4-byte unit length at `at` to cover everything after
    /// it.
    fn patch_length(&mut self, at: usize) {
        let length = (self.0.len() - at - 4) as u32;
        self.0[at..at + 4].copy_from_slice(&length.to_le_bytes());
    }
}

struct TestSource {
    sections: HashMap<SectionId, Vec<u8>>,
    relocs: HashMap<SectionId, (Vec<RawReloc>, Vec<RelocSymbol>)>,
}

impl TestSource {
    fn new() -> Self {
        TestSource {
            sections: HashMap::new(),
            relocs: HashMap::new(),
        }
    }

    fn section(mut self, id: SectionId, builder: SectionBuilder) -> Self {
        self.sections.insert(id, builder.0);
        self
    }

    fn reloc(mut self, id: SectionId, relocs: Vec<RawReloc>, symbols: Vec<RelocSymbol>) -> Self {
        self.relocs.insert(id, (relocs, symbols));
        self
    }
}

impl DwarfSource<'static> for TestSource {
    fn endian(&self) -> Endian {
        Endian::Little
    }

    fn address_size(&self) -> u8 {
        8
    }

    fn section(&self, id: SectionId) -> Option<DwarfSection<'static>> {
        self.sections.get(&id).map(|data| DwarfSection {
            address: 0,
            offset: 0,
            data: Cow::Owned(data.clone()),
        })
    }

    fn relocations(&self, id: SectionId) -> Option<(Vec<RawReloc>, Vec<RelocSymbol>)> {
        self.relocs.get(&id).cloned().map(|(r, s)| (r, s))
    }
}

/// The abbreviation table shared by the fixtures below.
fn abbrevs() -> SectionBuilder {
    let mut b = SectionBuilder::default();
    // 1: compile_unit, children: name, low_pc, stmt_list.
    b.uleb(1).uleb(DW_TAG_compile_unit as u64).u8(1);
    b.uleb(DW_AT_name as u64).uleb(DW_FORM_string as u64);
    b.uleb(DW_AT_low_pc as u64).uleb(DW_FORM_addr as u64);
    b.uleb(DW_AT_stmt_list as u64).uleb(DW_FORM_sec_offset as u64);
    b.uleb(0).uleb(0);
    // 2: subprogram, no children: name, low_pc, high_pc as data4.
    b.uleb(2).uleb(DW_TAG_subprogram as u64).u8(0);
    b.uleb(DW_AT_name as u64).uleb(DW_FORM_string as u64);
    b.uleb(DW_AT_low_pc as u64).uleb(DW_FORM_addr as u64);
    b.uleb(DW_AT_high_pc as u64).uleb(DW_FORM_data4 as u64);
    b.uleb(0).uleb(0);
    // 3: variable, no children: name.
    b.uleb(3).uleb(DW_TAG_variable as u64).u8(0);
    b.uleb(DW_AT_name as u64).uleb(DW_FORM_string as u64);
    b.uleb(0).uleb(0);
    // 4: imported_unit, no children: import as ref_addr.
    b.uleb(4).uleb(DW_TAG_imported_unit as u64).u8(0);
    b.uleb(DW_AT_import as u64).uleb(DW_FORM_ref_addr as u64);
    b.uleb(0).uleb(0);
    // 5: compile_unit, children, no attributes.
    b.uleb(5).uleb(DW_TAG_compile_unit as u64).u8(1);
    b.uleb(0).uleb(0);
    // 6: compile_unit, no children: ranges.
    b.uleb(6).uleb(DW_TAG_compile_unit as u64).u8(0);
    b.uleb(DW_AT_ranges as u64).uleb(DW_FORM_sec_offset as u64);
    b.uleb(0).uleb(0);
    // 7: variable, no children: location as a list pointer.
    b.uleb(7).uleb(DW_TAG_variable as u64).u8(0);
    b.uleb(DW_AT_location as u64).uleb(DW_FORM_sec_offset as u64);
    b.uleb(0).uleb(0);
    // 8: compile_unit, children, low_pc only.
    b.uleb(8).uleb(DW_TAG_compile_unit as u64).u8(1);
    b.uleb(DW_AT_low_pc as u64).uleb(DW_FORM_addr as u64);
    b.uleb(0).uleb(0);
    b.uleb(0);
    b
}

fn cu_header(b: &mut SectionBuilder) -> usize {
    let at = b.len();
    b.u32(0); // patched later
    b.u16(4); // version
    b.u32(0); // abbrev offset
    b.u8(8); // address size
    at
}

/// One CU: root(compile_unit) -> [subprogram "main", variable "counter"].
fn simple_info() -> SectionBuilder {
    let mut b = SectionBuilder::default();
    let header = cu_header(&mut b);
    b.uleb(1).cstr("demo.c").u64(0x1000).u32(0);
    b.uleb(2).cstr("main").u64(0x1000).u32(0x40);
    b.uleb(3).cstr("counter");
    b.uleb(0); // end of root's children
    b.patch_length(header);
    b
}

fn simple_line() -> SectionBuilder {
    let mut b = SectionBuilder::default();
    let header = b.len();
    b.u32(0); // unit length, patched
    b.u16(2); // version
    let header_len_at = b.len();
    b.u32(0); // header length, patched below
    b.u8(1); // minimum instruction length
    b.u8(1); // default_is_stmt
    b.u8((-5i8) as u8); // line_base
    b.u8(14); // line_range
    b.u8(13); // opcode_base
    for len in [0u8, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1] {
        b.u8(len);
    }
    b.u8(0); // no include directories
    b.cstr("demo.c").uleb(0).uleb(0).uleb(0);
    b.u8(0); // end of file table
    let program_start = b.len();
    let header_len = (program_start - header_len_at - 4) as u32;
    b.0[header_len_at..header_len_at + 4].copy_from_slice(&header_len.to_le_bytes());

    // set_address 0x1000
    b.u8(0).uleb(9).u8(DW_LNE_set_address).u64(0x1000);
    // special: address += 0, line += 0 -> row (0x1000, 1)
    b.u8(13 + 5);
    // special: address += 16, line += 1 -> row (0x1010, 2)
    b.u8(13 + 16 * 14 + 6);
    // advance_pc 0x30, end_sequence -> end row at 0x1040
    b.u8(DW_LNS_advance_pc).uleb(0x30);
    b.u8(0).uleb(1).u8(DW_LNE_end_sequence);
    b.patch_length(header);
    b
}

fn simple_session() -> DwarfInfo<'static> {
    let source = TestSource::new()
        .section(SectionId::DebugAbbrev, abbrevs())
        .section(SectionId::DebugInfo, simple_info())
        .section(SectionId::DebugLine, simple_line());
    DwarfInfo::parse(&source, None, DwarfOpts::default())
}

#[test]
fn test_unit_enumeration() {
    let info = simple_session();
    let units = info.unit_headers().unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].version, 4);
    assert_eq!(units[0].address_size, 8);
    assert_eq!(units[0].offset_size, 4);
    assert_eq!(units[0].die_offset, 11);
}

#[test]
fn test_empty_debug_info() {
    let source = TestSource::new().section(SectionId::DebugAbbrev, abbrevs());
    let info = DwarfInfo::parse(&source, None, DwarfOpts::default());
    assert!(info.unit_headers().unwrap().is_empty());
    assert!(info.units().unwrap().next().is_none());
}

#[test]
fn test_root_die_attributes() {
    let info = simple_session();
    let (_, root) = info.units().unwrap().next().unwrap();

    assert_eq!(root.tag().unwrap(), Some(DW_TAG_compile_unit));
    assert_eq!(root.name().unwrap(), Some(&b"demo.c"[..]));

    let low = root
        .attr_value(DW_AT_low_pc)
        .unwrap()
        .and_then(|v| v.as_address())
        .unwrap();
    assert_eq!(low.value, 0x1000);
    assert!(!low.relocated);
}

#[test]
fn test_high_pc_constant_resolves_against_low_pc() {
    let info = simple_session();
    let (_, root) = info.units().unwrap().next().unwrap();
    let main = root.children().unwrap().next().unwrap().unwrap();

    assert_eq!(main.tag().unwrap(), Some(DW_TAG_subprogram));
    // DW_FORM_data4 on DW_AT_high_pc is a size in DWARF 4, not an
    // address: the range end is low_pc + 0x40.
    let (low, high) = main.pc_range().unwrap().unwrap();
    assert_eq!(low.value, 0x1000);
    assert_eq!(high.value, 0x1040);
}

#[test]
fn test_children_iteration() {
    let info = simple_session();
    let (_, root) = info.units().unwrap().next().unwrap();

    let names: Vec<Vec<u8>> = root
        .children()
        .unwrap()
        .map(|die| Ok(die.name()?.unwrap_or_default().to_vec()))
        .collect()
        .unwrap();
    assert_eq!(names, vec![b"main".to_vec(), b"counter".to_vec()]);
}

#[test]
fn test_die_tree_preorder() {
    let info = simple_session();
    let tags: Vec<u32> = info
        .die_tree()
        .unwrap()
        .map(|die| Ok(die.tag()?.unwrap()))
        .collect()
        .unwrap();
    assert_eq!(
        tags,
        vec![DW_TAG_compile_unit, DW_TAG_subprogram, DW_TAG_variable]
    );
}

#[test]
fn test_tree_walk_is_idempotent() {
    let info = simple_session();
    let walk = |info: &DwarfInfo<'static>| -> Vec<u64> {
        info.die_tree()
            .unwrap()
            .map(|die| Ok(die.offset()))
            .collect()
            .unwrap()
    };
    assert_eq!(walk(&info), walk(&info));
}

#[test]
fn test_line_table() {
    let info = simple_session();
    let (unit_header, root) = info.units().unwrap().next().unwrap();
    let unit = *unit_header;

    let offset = match root.attr_value(DW_AT_stmt_list).unwrap().unwrap() {
        AttributeValue::SecOffset { offset, .. } => offset,
        other => panic!("unexpected stmt_list value: {other:?}"),
    };
    let table = info.line_table(&unit, offset).unwrap();

    assert_eq!(table.sequences.len(), 1);
    let sequence = &table.sequences[0];
    assert_eq!(sequence.start, 0x1000);
    assert_eq!(sequence.end, 0x1040);

    // Addresses are strictly non-decreasing within the sequence.
    let addresses: Vec<u64> = sequence.rows.iter().map(|row| row.address).collect();
    let mut sorted = addresses.clone();
    sorted.sort();
    assert_eq!(addresses, sorted);

    let row = table.lookup(None, 0x1005).unwrap();
    assert_eq!(row.line, 1);
    let row = table.lookup(None, 0x1020).unwrap();
    assert_eq!(row.line, 2);

    assert_eq!(
        table.lookup(None, 0x2000).unwrap_err().kind(),
        DwarfErrorKind::NoMatch
    );

    let (dir, file) = table.file(table.lookup(None, 0x1005).unwrap()).unwrap();
    assert_eq!(dir, b"");
    assert_eq!(file.name, b"demo.c".to_vec());
}

#[test]
fn test_logical_tree_descends_into_imports() {
    // CU 1 imports CU 2; the logical walk sees CU 1's root, then CU 2's
    // children in place of the import, and neither the import DIE nor
    // CU 2's root.
    let mut info = SectionBuilder::default();
    let header1 = cu_header(&mut info);
    info.uleb(5); // root, compile_unit with children
    let import_fixup = info.len();
    info.uleb(4).u32(0); // imported_unit, patched to CU 2's root offset
    info.uleb(3).cstr("local");
    info.uleb(0);
    info.patch_length(header1);

    let header2 = cu_header(&mut info);
    let cu2_root = info.len();
    info.uleb(5);
    info.uleb(3).cstr("imported_a");
    info.uleb(3).cstr("imported_b");
    info.uleb(0);
    info.patch_length(header2);

    // Patch the DW_AT_import operand (after the abbrev code byte).
    let target = (cu2_root as u32).to_le_bytes();
    info.0[import_fixup + 1..import_fixup + 5].copy_from_slice(&target);

    let source = TestSource::new()
        .section(SectionId::DebugAbbrev, abbrevs())
        .section(SectionId::DebugInfo, info);
    let session = DwarfInfo::parse(&source, None, DwarfOpts::default());

    let physical: Vec<u32> = session
        .die_tree()
        .unwrap()
        .map(|die| Ok(die.tag()?.unwrap()))
        .collect()
        .unwrap();
    assert_eq!(
        physical,
        vec![
            DW_TAG_compile_unit,
            DW_TAG_imported_unit,
            DW_TAG_variable,
            DW_TAG_compile_unit,
            DW_TAG_variable,
            DW_TAG_variable,
        ]
    );

    let logical: Vec<Vec<u8>> = session
        .logical_die_tree()
        .unwrap()
        .map(|die| Ok(die.name()?.unwrap_or(b"<cu>").to_vec()))
        .collect()
        .unwrap();
    assert_eq!(
        logical,
        vec![
            b"<cu>".to_vec(),
            b"imported_a".to_vec(),
            b"imported_b".to_vec(),
            b"local".to_vec(),
            // The physical walk still reaches CU 2 afterwards.
            b"<cu>".to_vec(),
            b"imported_a".to_vec(),
            b"imported_b".to_vec(),
        ]
    );
}

#[test]
fn test_empty_abbrev_table_makes_null_root() {
    let mut abbrev = SectionBuilder::default();
    abbrev.uleb(0); // empty table

    let mut info = SectionBuilder::default();
    let header = cu_header(&mut info);
    info.uleb(0); // root decodes as a null DIE
    info.patch_length(header);

    let source = TestSource::new()
        .section(SectionId::DebugAbbrev, abbrev)
        .section(SectionId::DebugInfo, info);
    let session = DwarfInfo::parse(&source, None, DwarfOpts::default());

    let (_, root) = session.units().unwrap().next().unwrap();
    assert!(root.is_null().unwrap());
    assert_eq!(root.tag().unwrap(), None);
    assert!(root.children().unwrap().next().unwrap().is_none());
}

fn reloc_symbols() -> Vec<RelocSymbol> {
    vec![
        RelocSymbol {
            value: 0,
            binding: 0,
            section: SymbolSection::Undefined,
        },
        RelocSymbol {
            value: 0,
            binding: 1,
            section: SymbolSection::Section { allocated: true },
        },
    ]
}

#[test]
fn test_relocated_zero_range_is_not_a_terminator() {
    // A range list whose first pair is (relocated 0, relocated 0x100)
    // followed by a raw (0, 0) decodes to exactly one range.
    let mut ranges = SectionBuilder::default();
    ranges.u64(0).u64(0x100).u64(0).u64(0);

    let mut info = SectionBuilder::default();
    let header = cu_header(&mut info);
    info.uleb(6).u32(0); // compile_unit with DW_AT_ranges -> offset 0
    info.patch_length(header);

    let relocs = vec![
        RawReloc {
            offset: 0,
            r_type: 1, // R_X86_64_64
            symbol: 1,
            addend: Some(0),
        },
        RawReloc {
            offset: 8,
            r_type: 1,
            symbol: 1,
            addend: Some(0x100),
        },
    ];

    let source = TestSource::new()
        .section(SectionId::DebugAbbrev, abbrevs())
        .section(SectionId::DebugInfo, info)
        .section(SectionId::DebugRanges, ranges)
        .reloc(SectionId::DebugRanges, relocs, reloc_symbols());
    let session = DwarfInfo::parse(
        &source,
        Backend::for_arch(Arch::Amd64),
        DwarfOpts::default(),
    );

    let (_, root) = session.units().unwrap().next().unwrap();
    let ranges: Vec<_> = RangesIter::new(&root).unwrap().collect().unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].start.symbol, Some(1));
    assert_eq!(ranges[0].start.value, 0);
    assert_eq!(ranges[0].end.value, 0x100);

    // Resolving against the symbol's runtime address gives [0, 0x100)
    // rebased there.
    assert_eq!(ranges[0].start.resolve(|_| Some(0x4000)), Some(0x4000));
    assert_eq!(ranges[0].end.resolve(|_| Some(0x4000)), Some(0x4100));
}

#[test]
fn test_half_relocated_terminator_is_invalid() {
    let mut ranges = SectionBuilder::default();
    ranges.u64(0).u64(0).u64(0).u64(0);

    let mut info = SectionBuilder::default();
    let header = cu_header(&mut info);
    info.uleb(6).u32(0);
    info.patch_length(header);

    // Only the first word of the pair carries a relocation.
    let relocs = vec![RawReloc {
        offset: 0,
        r_type: 1,
        symbol: 1,
        addend: Some(0),
    }];

    let source = TestSource::new()
        .section(SectionId::DebugAbbrev, abbrevs())
        .section(SectionId::DebugInfo, info)
        .section(SectionId::DebugRanges, ranges)
        .reloc(SectionId::DebugRanges, relocs, reloc_symbols());
    let session = DwarfInfo::parse(
        &source,
        Backend::for_arch(Arch::Amd64),
        DwarfOpts::default(),
    );

    let (_, root) = session.units().unwrap().next().unwrap();
    let err = RangesIter::new(&root).unwrap().next().unwrap_err();
    assert_eq!(err.kind(), DwarfErrorKind::InvalidDwarf);
}

#[test]
fn test_location_list() {
    // The variable's location list is relative to the unit's low_pc and
    // carries one expression per covered range.
    let mut loc = SectionBuilder::default();
    loc.u64(0x10).u64(0x20);
    loc.u16(2).u8(0x91).u8(0x7c); // DW_OP_fbreg -4
    loc.u64(0).u64(0);

    let mut info = SectionBuilder::default();
    let header = cu_header(&mut info);
    info.uleb(8).u64(0x4000); // compile_unit, low_pc 0x4000
    info.uleb(7).u32(0); // variable, location list at offset 0
    info.uleb(0);
    info.patch_length(header);

    let source = TestSource::new()
        .section(SectionId::DebugAbbrev, abbrevs())
        .section(SectionId::DebugInfo, info)
        .section(SectionId::DebugLoc, loc);
    let session = DwarfInfo::parse(&source, None, DwarfOpts::default());

    let (_, root) = session.units().unwrap().next().unwrap();
    let variable = root.children().unwrap().next().unwrap().unwrap();

    let entries: Vec<_> = LocListIter::new(&variable, DW_AT_location)
        .unwrap()
        .collect()
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].start.value, 0x4010);
    assert_eq!(entries[0].end.value, 0x4020);
    assert_eq!(entries[0].expr, &[0x91, 0x7c]);
}

#[test]
fn test_exprloc_attribute_yields_single_entry() {
    let mut info = SectionBuilder::default();
    let header = cu_header(&mut info);
    info.uleb(8).u64(0x4000);
    info.uleb(0);
    info.patch_length(header);

    let source = TestSource::new()
        .section(SectionId::DebugAbbrev, abbrevs())
        .section(SectionId::DebugInfo, info);
    let session = DwarfInfo::parse(&source, None, DwarfOpts::default());

    let (_, root) = session.units().unwrap().next().unwrap();
    // No location attribute at all: an empty list.
    let entries: Vec<_> = LocListIter::new(&root, DW_AT_location)
        .unwrap()
        .collect()
        .unwrap();
    assert!(entries.is_empty());
}

#[test]
fn test_base_address_entry() {
    // A base-address selection entry rebases subsequent plain pairs.
    let mut ranges = SectionBuilder::default();
    ranges.u64(u64::MAX).u64(0x4000);
    ranges.u64(0x10).u64(0x20);
    ranges.u64(0).u64(0);

    let mut info = SectionBuilder::default();
    let header = cu_header(&mut info);
    info.uleb(6).u32(0);
    info.patch_length(header);

    let source = TestSource::new()
        .section(SectionId::DebugAbbrev, abbrevs())
        .section(SectionId::DebugInfo, info)
        .section(SectionId::DebugRanges, ranges);
    let session = DwarfInfo::parse(&source, None, DwarfOpts::default());

    let (_, root) = session.units().unwrap().next().unwrap();
    let ranges: Vec<_> = RangesIter::new(&root).unwrap().collect().unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].start.value, 0x4010);
    assert_eq!(ranges[0].end.value, 0x4020);
}
