//! The line number program virtual machine.

use tracing::trace;

use crate::constants::*;
use crate::error::{DwarfError, DwarfErrorKind};
use crate::reader::{Encoding, SectionReader};
use crate::section::SectionId;
use crate::session::DwarfInfo;
use crate::unit::Unit;

/// One entry of the line program's file table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    /// The file name as recorded, possibly relative to a directory entry.
    pub name: Vec<u8>,
    /// Index into the include directory table; 0 is the compilation
    /// directory.
    pub dir_index: u64,
    /// Modification time, when the producer recorded one.
    pub mtime: u64,
    /// File size in bytes, when the producer recorded one.
    pub size: u64,
}

/// One row of the line table matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRow {
    /// The program counter value of this row.
    pub address: u64,
    /// The relocation symbol the address is relative to, for unlinked
    /// files. Rows from linked files carry `None`.
    pub symbol: Option<u32>,
    /// File table index.
    pub file: u64,
    /// Source line, zero meaning "no line".
    pub line: u64,
    /// Source column, zero meaning "no column".
    pub column: u64,
    /// Whether this address is a recommended breakpoint location.
    pub is_stmt: bool,
    /// Whether this row starts a basic block.
    pub basic_block: bool,
    /// Whether this row is a function prologue end.
    pub prologue_end: bool,
    /// Whether this row is a function epilogue begin.
    pub epilogue_begin: bool,
    /// Whether this row ends a sequence; its address is one past the last
    /// instruction.
    pub end_sequence: bool,
}

/// A run of rows with strictly non-decreasing addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineSequence {
    /// First address covered by the sequence.
    pub start: u64,
    /// One past the last address covered.
    pub end: u64,
    /// The relocation symbol shared by the sequence's addresses.
    pub symbol: Option<u32>,
    /// The rows of this sequence, including its end-sequence row.
    pub rows: Vec<LineRow>,
}

/// The decoded line table of one compilation unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineTable {
    /// Include directories; index 0 is reserved for the compilation
    /// directory.
    pub include_dirs: Vec<Vec<u8>>,
    /// The file table; index 0 is reserved for the primary source file.
    pub files: Vec<FileEntry>,
    /// All sequences, sorted by start address.
    pub sequences: Vec<LineSequence>,
}

// The running state of the line program state machine.
struct LineState {
    address: u64,
    symbol: Option<u32>,
    file: u64,
    line: i64,
    column: u64,
    is_stmt: bool,
    basic_block: bool,
    prologue_end: bool,
    epilogue_begin: bool,
}

impl LineState {
    fn reset(default_is_stmt: bool) -> Self {
        LineState {
            address: 0,
            symbol: None,
            file: 1,
            line: 1,
            column: 0,
            is_stmt: default_is_stmt,
            basic_block: false,
            prologue_end: false,
            epilogue_begin: false,
        }
    }

    fn row(&self, end_sequence: bool) -> LineRow {
        LineRow {
            address: self.address,
            symbol: self.symbol,
            file: self.file,
            line: self.line.max(0) as u64,
            column: self.column,
            is_stmt: self.is_stmt,
            basic_block: self.basic_block,
            prologue_end: self.prologue_end,
            epilogue_begin: self.epilogue_begin,
            end_sequence,
        }
    }
}

impl LineTable {
    /// Decodes the line program at `offset` in `.debug_line`.
    pub(crate) fn parse(
        info: &DwarfInfo<'_>,
        unit: &Unit,
        offset: u64,
    ) -> Result<LineTable, DwarfError> {
        let data = info.section_data(SectionId::DebugLine);
        let relocs = info.reloc_map(SectionId::DebugLine)?;
        let encoding = Encoding::new(info.endian(), unit.address_size);
        let mut reader = SectionReader::at(data, encoding, offset as usize)?;

        let length = reader.read_initial_length()?;
        let end = reader.pos() as u64 + length;
        if end > data.len() as u64 {
            return Err(DwarfErrorKind::Truncated.into());
        }

        let version = reader.read_u16()?;
        if !(2..=4).contains(&version) {
            return Err(DwarfErrorKind::UnsupportedVersion(version).into());
        }

        let header_length = reader.read_offset()?;
        let program_start = reader.pos() as u64 + header_length;

        let minimum_instruction_length = reader.read_u8()?;
        if minimum_instruction_length == 0 {
            return Err(DwarfErrorKind::InvalidDwarf.into());
        }
        if version >= 4 {
            // maximum_operations_per_instruction; VLIW bundling is not
            // tracked, a value of 1 is the only one seen in practice.
            let _ = reader.read_u8()?;
        }
        let default_is_stmt = reader.read_u8()? != 0;
        let line_base = reader.read_u8()? as i8;
        let line_range = reader.read_u8()?;
        if line_range == 0 {
            return Err(DwarfErrorKind::InvalidDwarf.into());
        }
        let opcode_base = reader.read_u8()?;
        let mut standard_opcode_lengths = Vec::with_capacity(opcode_base.saturating_sub(1) as usize);
        for _ in 1..opcode_base {
            standard_opcode_lengths.push(reader.read_u8()?);
        }

        let mut include_dirs = vec![Vec::new()];
        loop {
            let dir = reader.read_cstr()?;
            if dir.is_empty() {
                break;
            }
            include_dirs.push(dir.to_vec());
        }

        let mut files = vec![FileEntry {
            name: Vec::new(),
            dir_index: 0,
            mtime: 0,
            size: 0,
        }];
        loop {
            let name = reader.read_cstr()?;
            if name.is_empty() {
                break;
            }
            files.push(FileEntry {
                name: name.to_vec(),
                dir_index: reader.read_uleb128()?,
                mtime: reader.read_uleb128()?,
                size: reader.read_uleb128()?,
            });
        }

        if (reader.pos() as u64) > program_start || program_start > end {
            return Err(DwarfErrorKind::InvalidDwarf.into());
        }
        reader.set_pos(program_start as usize)?;

        let mut sequences = Vec::new();
        let mut rows: Vec<LineRow> = Vec::new();
        let mut state = LineState::reset(default_is_stmt);

        let mut emit = |state: &mut LineState, rows: &mut Vec<LineRow>, end_sequence: bool| {
            let row = state.row(end_sequence);
            // Within a sequence, addresses may only increase; drop rows
            // that violate this rather than corrupting the search order.
            let in_order = rows
                .last()
                .map_or(true, |last| row.address >= last.address);
            if in_order {
                rows.push(row);
            }
            state.basic_block = false;
            state.prologue_end = false;
            state.epilogue_begin = false;
        };

        while (reader.pos() as u64) < end {
            let opcode = reader.read_u8()?;

            if opcode >= opcode_base {
                let adjusted = opcode - opcode_base;
                let advance = (adjusted / line_range) as u64;
                state.address = state
                    .address
                    .wrapping_add(advance * u64::from(minimum_instruction_length));
                state.line += i64::from(line_base) + i64::from(adjusted % line_range);
                emit(&mut state, &mut rows, false);
                continue;
            }

            match opcode {
                0 => {
                    // Extended opcode: length-prefixed.
                    let len = reader.read_uleb128()? as usize;
                    let operand_pos = reader.pos();
                    let mut sub = reader.split(len)?;
                    let extended = sub.read_u8()?;
                    match extended {
                        DW_LNE_end_sequence => {
                            emit(&mut state, &mut rows, true);
                            if let Some(first) = rows.first() {
                                sequences.push(LineSequence {
                                    start: first.address,
                                    end: state.address,
                                    symbol: first.symbol,
                                    rows: std::mem::take(&mut rows),
                                });
                            }
                            state = LineState::reset(default_is_stmt);
                        }
                        DW_LNE_set_address => {
                            // The operand sits in the section itself, so
                            // the relocation tables apply to it.
                            let value = relocs.read(
                                data,
                                operand_pos + 1,
                                unit.address_size,
                                info.endian(),
                            )?;
                            state.address = value.value;
                            state.symbol = value.symbol;
                        }
                        DW_LNE_define_file => {
                            let name = sub.read_cstr()?;
                            files.push(FileEntry {
                                name: name.to_vec(),
                                dir_index: sub.read_uleb128()?,
                                mtime: sub.read_uleb128()?,
                                size: sub.read_uleb128()?,
                            });
                        }
                        DW_LNE_set_discriminator => {
                            let _ = sub.read_uleb128()?;
                        }
                        other => {
                            trace!(opcode = other, "skipping unknown extended line opcode");
                        }
                    }
                }
                DW_LNS_copy => emit(&mut state, &mut rows, false),
                DW_LNS_advance_pc => {
                    let advance = reader.read_uleb128()?;
                    state.address = state
                        .address
                        .wrapping_add(advance * u64::from(minimum_instruction_length));
                }
                DW_LNS_advance_line => {
                    state.line += reader.read_sleb128()?;
                }
                DW_LNS_set_file => state.file = reader.read_uleb128()?,
                DW_LNS_set_column => state.column = reader.read_uleb128()?,
                DW_LNS_negate_stmt => state.is_stmt = !state.is_stmt,
                DW_LNS_set_basic_block => state.basic_block = true,
                DW_LNS_const_add_pc => {
                    let adjusted = 255 - opcode_base;
                    let advance = (adjusted / line_range) as u64;
                    state.address = state
                        .address
                        .wrapping_add(advance * u64::from(minimum_instruction_length));
                }
                DW_LNS_fixed_advance_pc => {
                    state.address = state.address.wrapping_add(u64::from(reader.read_u16()?));
                }
                DW_LNS_set_prologue_end => state.prologue_end = true,
                DW_LNS_set_epilogue_begin => state.epilogue_begin = true,
                DW_LNS_set_isa => {
                    let _ = reader.read_uleb128()?;
                }
                unknown => {
                    // Skip operands per the header's opcode length table.
                    let operands = standard_opcode_lengths
                        .get((unknown - 1) as usize)
                        .copied()
                        .unwrap_or(0);
                    for _ in 0..operands {
                        let _ = reader.read_uleb128()?;
                    }
                }
            }
        }

        // A sequence without an end_sequence row; keep what was decoded.
        if let Some(first) = rows.first() {
            sequences.push(LineSequence {
                start: first.address,
                end: state.address.max(first.address),
                symbol: first.symbol,
                rows,
            });
        }

        dmsort::sort_by_key(&mut sequences, |sequence| sequence.start);

        Ok(LineTable {
            include_dirs,
            files,
            sequences,
        })
    }

    /// Finds the row covering `address` in the sequences attached to
    /// `symbol` (`None` for linked files).
    ///
    /// Returns [`DwarfErrorKind::NoMatch`] when no sequence covers the
    /// address.
    pub fn lookup(&self, symbol: Option<u32>, address: u64) -> Result<&LineRow, DwarfError> {
        for sequence in &self.sequences {
            if sequence.symbol != symbol || address < sequence.start || address >= sequence.end {
                continue;
            }
            let index = match sequence
                .rows
                .binary_search_by_key(&address, |row| row.address)
            {
                Ok(index) => index,
                Err(0) => continue,
                Err(next) => next - 1,
            };
            let row = &sequence.rows[index];
            if row.end_sequence {
                continue;
            }
            return Ok(row);
        }
        Err(DwarfErrorKind::NoMatch.into())
    }

    /// The file entry of a row, with its directory resolved.
    pub fn file(&self, row: &LineRow) -> Option<(&[u8], &FileEntry)> {
        let entry = self.files.get(row.file as usize)?;
        let dir = self
            .include_dirs
            .get(entry.dir_index as usize)
            .map(|dir| dir.as_slice())
            .unwrap_or(&[]);
        Some((dir, entry))
    }
}
