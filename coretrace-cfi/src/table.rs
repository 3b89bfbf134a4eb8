//! Interpretation of CFI instruction streams into unwind rows.

use fallible_iterator::FallibleIterator;
use tracing::trace;

use coretrace_common::{AsSelf, Backend};
use coretrace_dwarf::constants::*;
use coretrace_dwarf::{Encoding, SectionReader};

use crate::entries::{Cie, CfiEntry, CfiSection, Fde};
use crate::error::{CfiError, CfiErrorKind};

// An upper bound on register columns a malformed stream can make us
// track.
const MAX_REGISTER: u16 = 1024;

/// The rule to recover one register of the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterRule<'d> {
    /// The register cannot be recovered.
    Undefined,
    /// The register was not touched by this frame.
    SameValue,
    /// Saved at the address `CFA + offset`.
    Offset(i64),
    /// The caller's value is `CFA + offset` itself, no memory access.
    ValOffset(i64),
    /// The caller's value lives in another register.
    Register(u16),
    /// The caller's value is another register's value plus nothing to
    /// dereference.
    ValRegister(u16),
    /// Saved at the address computed by a DWARF expression.
    Expression(&'d [u8]),
    /// The caller's value is computed by a DWARF expression.
    ValExpression(&'d [u8]),
    /// Recovery is defined by the ABI, outside the CFI vocabulary.
    Architectural,
}

/// The rule to compute the canonical frame address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfaRule<'d> {
    /// Not established yet.
    Unset,
    /// `CFA = register + offset`.
    RegisterOffset {
        /// The base register.
        register: u16,
        /// The signed offset added to it.
        offset: i64,
    },
    /// `CFA` is computed by a DWARF expression.
    Expression(&'d [u8]),
}

/// One row of the unwind table: the rules in effect for a PC range.
#[derive(Clone, Debug)]
pub struct UnwindRow<'d> {
    /// Inclusive start of the covered PC range.
    pub start: u64,
    /// Exclusive end of the covered PC range.
    pub end: u64,
    /// The CFA computation rule.
    pub cfa: CfaRule<'d>,
    /// Per-register recovery rules, indexed by DWARF register number.
    pub registers: Vec<RegisterRule<'d>>,
    /// The column holding the caller's return address.
    pub ra_register: u16,
    /// Whether the frame is a signal delivery frame.
    pub signal_frame: bool,
}

impl<'d> UnwindRow<'d> {
    /// The rule for a register, `Undefined` past the tracked columns.
    pub fn register(&self, register: u16) -> RegisterRule<'d> {
        self.registers
            .get(register as usize)
            .copied()
            .unwrap_or(RegisterRule::Undefined)
    }
}

#[derive(Clone, Debug)]
struct RowState<'d> {
    cfa: CfaRule<'d>,
    registers: Vec<RegisterRule<'d>>,
}

impl<'d> RowState<'d> {
    fn new(nregs: u16) -> Self {
        RowState {
            cfa: CfaRule::Unset,
            registers: vec![RegisterRule::Undefined; nregs as usize],
        }
    }

    fn set(&mut self, register: u16, rule: RegisterRule<'d>) -> Result<(), CfiError> {
        if register >= MAX_REGISTER {
            return Err(CfiErrorKind::InvalidCfi.into());
        }
        let index = register as usize;
        if index >= self.registers.len() {
            self.registers.resize(index + 1, RegisterRule::Undefined);
        }
        self.registers[index] = rule;
        Ok(())
    }

    fn get(&self, register: u16) -> RegisterRule<'d> {
        self.registers
            .get(register as usize)
            .copied()
            .unwrap_or(RegisterRule::Undefined)
    }
}

// The CFI instruction interpreter. One instance runs the ABI program,
// the CIE's initial instructions and the FDE instructions in sequence,
// sharing the remember/restore stack across them.
struct Interpreter<'d> {
    section: CfiSection<'d>,
    code_align: u64,
    data_align: i64,
    fde_encoding: u8,
    state: RowState<'d>,
    initial: Option<RowState<'d>>,
    stack: Vec<RowState<'d>>,
    loc: u64,
}

impl<'d> Interpreter<'d> {
    /// Runs one instruction stream. `on_advance` is called with the row
    /// completed by each location advance and may stop the run.
    fn run(
        &mut self,
        instructions: &'d [u8],
        instructions_offset: u64,
        mut on_advance: impl FnMut(u64, u64, &RowState<'d>) -> bool,
    ) -> Result<(), CfiError> {
        let encoding = Encoding::new(self.section.endian(), self.section.address_size());
        let mut reader = SectionReader::new(instructions, encoding);

        while !reader.is_empty() {
            let op = reader.read_u8()?;

            // The three primary opcodes pack an operand into the low six
            // bits.
            match op & 0xc0 {
                DW_CFA_advance_loc => {
                    let delta = u64::from(op & 0x3f) * self.code_align;
                    if !self.advance(delta, &mut on_advance) {
                        return Ok(());
                    }
                    continue;
                }
                DW_CFA_offset => {
                    let register = u16::from(op & 0x3f);
                    let factored = reader.read_uleb128()?;
                    self.state
                        .set(register, RegisterRule::Offset(factored as i64 * self.data_align))?;
                    continue;
                }
                DW_CFA_restore => {
                    self.restore(u16::from(op & 0x3f))?;
                    continue;
                }
                _ => {}
            }

            match op {
                DW_CFA_nop => {}
                DW_CFA_set_loc => {
                    let value_offset = instructions_offset + reader.pos() as u64;
                    let target =
                        self.section
                            .read_encoded(&mut reader, self.fde_encoding, value_offset)?;
                    if target < self.loc {
                        return Err(CfiErrorKind::InvalidCfi.into());
                    }
                    if !self.advance(target - self.loc, &mut on_advance) {
                        return Ok(());
                    }
                }
                DW_CFA_advance_loc1 => {
                    let delta = u64::from(reader.read_u8()?) * self.code_align;
                    if !self.advance(delta, &mut on_advance) {
                        return Ok(());
                    }
                }
                DW_CFA_advance_loc2 => {
                    let delta = u64::from(reader.read_u16()?) * self.code_align;
                    if !self.advance(delta, &mut on_advance) {
                        return Ok(());
                    }
                }
                DW_CFA_advance_loc4 => {
                    let delta = u64::from(reader.read_u32()?) * self.code_align;
                    if !self.advance(delta, &mut on_advance) {
                        return Ok(());
                    }
                }
                DW_CFA_offset_extended => {
                    let register = self.register(&mut reader)?;
                    let factored = reader.read_uleb128()?;
                    self.state
                        .set(register, RegisterRule::Offset(factored as i64 * self.data_align))?;
                }
                DW_CFA_restore_extended => {
                    let register = self.register(&mut reader)?;
                    self.restore(register)?;
                }
                DW_CFA_undefined => {
                    let register = self.register(&mut reader)?;
                    self.state.set(register, RegisterRule::Undefined)?;
                }
                DW_CFA_same_value => {
                    let register = self.register(&mut reader)?;
                    self.state.set(register, RegisterRule::SameValue)?;
                }
                DW_CFA_register => {
                    let register = self.register(&mut reader)?;
                    let source = self.register(&mut reader)?;
                    self.state.set(register, RegisterRule::Register(source))?;
                }
                DW_CFA_remember_state => self.stack.push(self.state.clone()),
                DW_CFA_restore_state => {
                    self.state = self
                        .stack
                        .pop()
                        .ok_or(CfiErrorKind::InvalidCfi)?;
                }
                DW_CFA_def_cfa => {
                    let register = self.register(&mut reader)?;
                    let offset = reader.read_uleb128()? as i64;
                    self.state.cfa = CfaRule::RegisterOffset { register, offset };
                }
                DW_CFA_def_cfa_sf => {
                    let register = self.register(&mut reader)?;
                    let offset = reader.read_sleb128()? * self.data_align;
                    self.state.cfa = CfaRule::RegisterOffset { register, offset };
                }
                DW_CFA_def_cfa_register => {
                    let register = self.register(&mut reader)?;
                    match self.state.cfa {
                        CfaRule::RegisterOffset { offset, .. } => {
                            self.state.cfa = CfaRule::RegisterOffset { register, offset };
                        }
                        _ => return Err(CfiErrorKind::InvalidCfi.into()),
                    }
                }
                DW_CFA_def_cfa_offset => {
                    let offset = reader.read_uleb128()? as i64;
                    match self.state.cfa {
                        CfaRule::RegisterOffset { register, .. } => {
                            self.state.cfa = CfaRule::RegisterOffset { register, offset };
                        }
                        _ => return Err(CfiErrorKind::InvalidCfi.into()),
                    }
                }
                DW_CFA_def_cfa_offset_sf => {
                    let offset = reader.read_sleb128()? * self.data_align;
                    match self.state.cfa {
                        CfaRule::RegisterOffset { register, .. } => {
                            self.state.cfa = CfaRule::RegisterOffset { register, offset };
                        }
                        _ => return Err(CfiErrorKind::InvalidCfi.into()),
                    }
                }
                DW_CFA_def_cfa_expression => {
                    let len = reader.read_uleb128()? as usize;
                    self.state.cfa = CfaRule::Expression(reader.read_bytes(len)?);
                }
                DW_CFA_expression => {
                    let register = self.register(&mut reader)?;
                    let len = reader.read_uleb128()? as usize;
                    let expr = reader.read_bytes(len)?;
                    self.state.set(register, RegisterRule::Expression(expr))?;
                }
                DW_CFA_val_expression => {
                    let register = self.register(&mut reader)?;
                    let len = reader.read_uleb128()? as usize;
                    let expr = reader.read_bytes(len)?;
                    self.state.set(register, RegisterRule::ValExpression(expr))?;
                }
                DW_CFA_offset_extended_sf => {
                    let register = self.register(&mut reader)?;
                    let factored = reader.read_sleb128()?;
                    self.state
                        .set(register, RegisterRule::Offset(factored * self.data_align))?;
                }
                DW_CFA_val_offset => {
                    let register = self.register(&mut reader)?;
                    let factored = reader.read_uleb128()?;
                    self.state.set(
                        register,
                        RegisterRule::ValOffset(factored as i64 * self.data_align),
                    )?;
                }
                DW_CFA_val_offset_sf => {
                    let register = self.register(&mut reader)?;
                    let factored = reader.read_sleb128()?;
                    self.state
                        .set(register, RegisterRule::ValOffset(factored * self.data_align))?;
                }
                DW_CFA_GNU_args_size => {
                    let _ = reader.read_uleb128()?;
                }
                DW_CFA_GNU_negative_offset_extended => {
                    let register = self.register(&mut reader)?;
                    let factored = reader.read_uleb128()?;
                    self.state.set(
                        register,
                        RegisterRule::Offset(-(factored as i64 * self.data_align)),
                    )?;
                }
                DW_CFA_GNU_window_save => {
                    // SPARC register windows; the saved window is found by
                    // ABI rules, not by CFI.
                    trace!("window save treated as architectural");
                    for register in 16..32 {
                        self.state.set(register, RegisterRule::Architectural)?;
                    }
                }
                other => return Err(CfiErrorKind::UnknownInstruction(other).into()),
            }
        }

        Ok(())
    }

    fn register(&self, reader: &mut SectionReader<'_>) -> Result<u16, CfiError> {
        let register = reader.read_uleb128()?;
        u16::try_from(register).map_err(|_| CfiErrorKind::InvalidCfi.into())
    }

    fn restore(&mut self, register: u16) -> Result<(), CfiError> {
        let initial = self
            .initial
            .as_ref()
            .ok_or(CfiErrorKind::InvalidCfi)?;
        let rule = initial.get(register);
        self.state.set(register, rule)
    }

    fn advance(
        &mut self,
        delta: u64,
        on_advance: &mut impl FnMut(u64, u64, &RowState<'d>) -> bool,
    ) -> bool {
        let new_loc = self.loc.wrapping_add(delta);
        let keep_going = on_advance(self.loc, new_loc, &self.state);
        self.loc = new_loc;
        keep_going
    }
}

/// The per-PC unwind table of one CFI section.
///
/// Frame description entries are searched linearly in section order and
/// their referenced CIEs are re-decoded per query; a CIE header is a few
/// dozen bytes and the FDE scan dominates anyway. Rows come from running
/// the ABI-default program, the CIE's initial instructions and the FDE's
/// instruction stream, in that order.
pub struct CfiTable<'d> {
    section: CfiSection<'d>,
    backend: Option<&'static Backend>,
}

impl<'d> CfiTable<'d> {
    /// Creates a table over a CFI section.
    pub fn new(section: CfiSection<'d>, backend: Option<&'static Backend>) -> Self {
        CfiTable { section, backend }
    }

    /// The underlying section.
    pub fn section(&self) -> &CfiSection<'d> {
        &self.section
    }

    fn cie_at(&self, offset: u64) -> Result<Cie<'d>, CfiError> {
        let entry = self
            .section
            .entry_at(offset)?
            .ok_or(CfiErrorKind::InvalidCfi)?;
        let (CfiEntry::Cie(cie), _) = entry else {
            return Err(CfiErrorKind::InvalidCfi.into());
        };
        Ok(cie)
    }
}

impl<'slf> AsSelf<'slf> for CfiTable<'_> {
    type Ref = CfiTable<'slf>;

    fn as_self(&'slf self) -> &Self::Ref {
        self
    }
}

impl<'d> CfiTable<'d> {
    /// Computes the unwind row in effect at `pc`.
    ///
    /// Returns [`CfiErrorKind::NoMatch`] when no FDE covers the address.
    pub fn unwind_row_at(&self, pc: u64) -> Result<UnwindRow<'d>, CfiError> {
        let mut entries = self.section.entries();
        while let Some(entry) = entries.next()? {
            let CfiEntry::Fde(raw) = entry else {
                continue;
            };
            let cie = self.cie_at(raw.cie_offset)?;
            let fde = self.section.decode_fde(&cie, &raw)?;

            // A zero-length FDE covers nothing, but is not an error.
            if fde.address_range == 0 {
                continue;
            }
            let end = fde.initial_location + fde.address_range;
            if pc < fde.initial_location || pc >= end {
                continue;
            }

            let rows = self.build_rows(&cie, &fde, Some(pc))?;
            let row = rows
                .into_iter()
                .find(|row| pc >= row.start && pc < row.end)
                .ok_or(CfiErrorKind::InvalidCfi)?;
            return Ok(row);
        }
        Err(CfiErrorKind::NoMatch.into())
    }

    /// Computes every row of one FDE.
    ///
    /// The union of the returned PC ranges is exactly the FDE's range,
    /// gap-free and in ascending order.
    pub fn rows_for_fde(&self, fde: &Fde<'d>) -> Result<Vec<UnwindRow<'d>>, CfiError> {
        let cie = self.cie_at(fde.cie_offset)?;
        self.build_rows(&cie, fde, None)
    }

    fn build_rows(
        &self,
        cie: &Cie<'d>,
        fde: &Fde<'d>,
        stop_at: Option<u64>,
    ) -> Result<Vec<UnwindRow<'d>>, CfiError> {
        let nregs = self
            .backend
            .map(|backend| backend.nregs)
            .unwrap_or(cie.return_address_register + 1);

        let mut interp = Interpreter {
            section: self.section,
            code_align: cie.code_alignment_factor,
            data_align: cie.data_alignment_factor,
            fde_encoding: cie.fde_pointer_encoding,
            state: RowState::new(nregs),
            initial: None,
            stack: Vec::new(),
            loc: 0,
        };

        // The ABI-assumed rules come first, with their own factors.
        if let Some(backend) = self.backend {
            interp.code_align = backend.abi_cfi.code_alignment_factor;
            interp.data_align = backend.abi_cfi.data_alignment_factor;
            interp.run(backend.abi_cfi.instructions, 0, |_, _, _| true)?;
            interp.code_align = cie.code_alignment_factor;
            interp.data_align = cie.data_alignment_factor;
        }

        interp.run(
            cie.initial_instructions,
            cie.initial_instructions_offset,
            |_, _, _| true,
        )?;
        interp.initial = Some(interp.state.clone());
        interp.loc = fde.initial_location;

        let fde_end = fde.initial_location + fde.address_range;
        let mut rows: Vec<UnwindRow<'d>> = Vec::new();
        let finish = |start: u64, end: u64, state: &RowState<'d>| UnwindRow {
            start,
            end,
            cfa: state.cfa,
            registers: state.registers.clone(),
            ra_register: cie.return_address_register,
            signal_frame: cie.signal_frame,
        };

        interp.run(fde.instructions, fde.instructions_offset, |start, end, state| {
            if end > start && start < fde_end {
                rows.push(finish(start, end.min(fde_end), state));
            }
            match stop_at {
                Some(pc) => end <= pc,
                None => true,
            }
        })?;

        // The final row extends to the end of the FDE's range.
        let last_covered = rows.last().map(|row| row.end).unwrap_or(fde.initial_location);
        if last_covered < fde_end {
            rows.push(finish(interp.loc.max(last_covered), fde_end, &interp.state));
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coretrace_common::Arch;
    use coretrace_dwarf::Endian;
    use similar_asserts::assert_eq;

    /// Builds a .debug_frame with one CIE (rsp+8, ra at cfa-8) and one
    /// FDE for [0x1000, 0x1040) that moves the CFA offset at 0x1010 and
    /// uses remember/restore around 0x1020..0x1030.
    fn fixture() -> Vec<u8> {
        let mut data = Vec::new();

        let cie_content = {
            let mut c = Vec::new();
            c.extend_from_slice(&u32::MAX.to_le_bytes());
            c.push(1); // version
            c.push(0); // augmentation
            c.push(1); // code alignment
            c.push(0x78); // data alignment -8
            c.push(16); // return address register
            c.extend_from_slice(&[DW_CFA_def_cfa, 7, 8]);
            c.extend_from_slice(&[DW_CFA_offset | 16, 1]);
            c
        };
        data.extend_from_slice(&(cie_content.len() as u32).to_le_bytes());
        data.extend_from_slice(&cie_content);

        let fde_content = {
            let mut c = Vec::new();
            c.extend_from_slice(&0u32.to_le_bytes()); // CIE offset
            c.extend_from_slice(&0x1000u64.to_le_bytes());
            c.extend_from_slice(&0x40u64.to_le_bytes());
            // 0x1000..0x1010: CIE state.
            c.push(DW_CFA_advance_loc | 0x10);
            // 0x1010: push rbp-style prologue, CFA offset grows.
            c.extend_from_slice(&[DW_CFA_def_cfa_offset, 16]);
            c.extend_from_slice(&[DW_CFA_offset | 6, 2]); // rbp at cfa-16
            c.push(DW_CFA_advance_loc | 0x10);
            // 0x1020: remember, switch CFA to rbp.
            c.push(DW_CFA_remember_state);
            c.extend_from_slice(&[DW_CFA_def_cfa_register, 6]);
            c.push(DW_CFA_advance_loc | 0x10);
            // 0x1030: restore.
            c.push(DW_CFA_restore_state);
            c
        };
        data.extend_from_slice(&(fde_content.len() as u32).to_le_bytes());
        data.extend_from_slice(&fde_content);

        data
    }

    fn table(data: &[u8]) -> CfiTable<'_> {
        CfiTable::new(
            CfiSection::debug_frame(data, Endian::Little, 8),
            Backend::for_arch(Arch::Amd64),
        )
    }

    #[test]
    fn test_row_lookup() {
        let data = fixture();
        let table = table(&data);

        let row = table.unwind_row_at(0x1000).unwrap();
        assert_eq!(row.start, 0x1000);
        assert_eq!(row.end, 0x1010);
        assert_eq!(
            row.cfa,
            CfaRule::RegisterOffset {
                register: 7,
                offset: 8
            }
        );
        assert_eq!(row.register(16), RegisterRule::Offset(-8));
        // The ABI program marks callee-saved registers as inherited.
        assert_eq!(row.register(3), RegisterRule::SameValue);
        assert_eq!(row.ra_register, 16);
        assert!(!row.signal_frame);

        let row = table.unwind_row_at(0x1015).unwrap();
        assert_eq!(
            row.cfa,
            CfaRule::RegisterOffset {
                register: 7,
                offset: 16
            }
        );
        assert_eq!(row.register(6), RegisterRule::Offset(-16));

        let row = table.unwind_row_at(0x1025).unwrap();
        assert_eq!(
            row.cfa,
            CfaRule::RegisterOffset {
                register: 6,
                offset: 16
            }
        );

        // After restore_state the CFA is back on rsp.
        let row = table.unwind_row_at(0x1035).unwrap();
        assert_eq!(
            row.cfa,
            CfaRule::RegisterOffset {
                register: 7,
                offset: 16
            }
        );
    }

    #[test]
    fn test_rows_cover_fde_without_gaps() {
        let data = fixture();
        let table = table(&data);

        let mut entries = table.section().entries();
        let mut fde = None;
        while let Some(entry) = entries.next().unwrap() {
            if let CfiEntry::Fde(raw) = entry {
                let cie = table.cie_at(raw.cie_offset).unwrap();
                fde = Some(table.section().decode_fde(&cie, &raw).unwrap());
            }
        }
        let fde = fde.unwrap();

        let rows = table.rows_for_fde(&fde).unwrap();
        assert_eq!(rows.first().unwrap().start, 0x1000);
        assert_eq!(rows.last().unwrap().end, 0x1040);
        for pair in rows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_no_match_outside_fdes() {
        let data = fixture();
        let table = table(&data);
        assert_eq!(
            table.unwind_row_at(0x9000).unwrap_err().kind(),
            CfiErrorKind::NoMatch
        );
    }

    #[test]
    fn test_zero_length_fde_contributes_nothing() {
        let mut data = fixture();
        let fde_content = {
            let mut c = Vec::new();
            c.extend_from_slice(&0u32.to_le_bytes());
            c.extend_from_slice(&0x5000u64.to_le_bytes());
            c.extend_from_slice(&0u64.to_le_bytes()); // empty range
            c
        };
        data.extend_from_slice(&(fde_content.len() as u32).to_le_bytes());
        data.extend_from_slice(&fde_content);

        let table = table(&data);
        assert_eq!(
            table.unwind_row_at(0x5000).unwrap_err().kind(),
            CfiErrorKind::NoMatch
        );
    }
}
