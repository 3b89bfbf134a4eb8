//! The frame stepper and the backtrace driver.

use tracing::{debug, trace};

use coretrace_cfi::{
    evaluate, CfaRule, CfiTable, ExprContext, ExprResult, RegisterRule, UnwindRow,
};

use crate::error::{UnwindError, UnwindErrorKind};
use crate::state::{FrameState, Memory};

/// The call frame information of one module, plus its load bias.
pub struct ModuleCfi<'a> {
    /// The `.eh_frame` table, preferred when present.
    pub eh_frame: Option<&'a CfiTable<'a>>,
    /// The `.debug_frame` table, the fallback.
    pub debug_frame: Option<&'a CfiTable<'a>>,
    /// Additive offset from file addresses to runtime addresses.
    pub bias: u64,
}

/// The address space the unwinder steps through.
///
/// Implemented by the module registry: it knows which module covers a
/// runtime address, where that module's CFI lives, and whether an address
/// belongs to the process entry function (whose missing CFI means "bottom
/// of stack", not corruption).
pub trait UnwindSpace {
    /// Returns the CFI of the module covering `pc`, or `None` when no
    /// module does.
    fn cfi_for_pc(&self, pc: u64) -> Option<ModuleCfi<'_>>;

    /// Whether `pc` lies inside the process entry function (`_start`).
    fn is_entry_pc(&self, pc: u64) -> bool;
}

/// One produced stack frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// The program counter of the frame. For frames other than the
    /// innermost this is a return address (or an exact interrupted
    /// address below a signal frame).
    pub pc: u64,
    /// Whether this frame is a signal delivery frame.
    pub signal_frame: bool,
    /// The full register state of the frame.
    pub state: FrameState,
}

/// The result of walking a stack: the frames produced plus the reason the
/// walk ended, if it was not a clean end of stack.
#[derive(Debug)]
pub struct Backtrace {
    /// The frames, innermost first.
    pub frames: Vec<Frame>,
    /// The error that stopped the walk, `None` for a clean end.
    pub error: Option<UnwindErrorKind>,
}

struct FrameExprContext<'a> {
    state: &'a FrameState,
    cfa: Option<u64>,
}

impl ExprContext for FrameExprContext<'_> {
    fn register(&self, register: u16) -> Option<u64> {
        self.state.register(register)
    }

    fn cfa(&self) -> Option<u64> {
        self.cfa
    }
}

fn find_row<'a>(
    cfi: &ModuleCfi<'a>,
    pc_file: u64,
) -> Result<UnwindRow<'a>, UnwindError> {
    // Prefer .eh_frame; on any failure retry with .debug_frame before
    // giving up.
    let eh_error = match cfi.eh_frame {
        Some(table) => match table.unwind_row_at(pc_file) {
            Ok(row) => return Ok(row),
            Err(err) => Some(err),
        },
        None => None,
    };

    if let Some(table) = cfi.debug_frame {
        return table.unwind_row_at(pc_file).map_err(UnwindError::from);
    }

    match eh_error {
        Some(err) => Err(err.into()),
        None => Err(UnwindErrorKind::NoCfi.into()),
    }
}

fn eval_expr(
    expr: &[u8],
    state: &FrameState,
    cfa: Option<u64>,
) -> Result<ExprResult, UnwindError> {
    let ctx = FrameExprContext { state, cfa };
    // The CFI expression subset consists of single-byte opcodes and
    // LEB128 operands, so the byte order never matters here.
    evaluate(
        expr,
        coretrace_dwarf::Endian::Little,
        state.backend().arch.pointer_size().unwrap_or(8) as u8,
        &ctx,
    )
    .map_err(UnwindError::from)
}

/// Produces the caller's register state from one frame.
///
/// Errors of kind [`UnwindErrorKind::RaUndefined`] mark the legitimate
/// bottom of the stack and are not failures.
pub fn unwind_frame<S, M>(
    space: &S,
    memory: &M,
    state: &FrameState,
) -> Result<FrameState, UnwindError>
where
    S: UnwindSpace + ?Sized,
    M: Memory + ?Sized,
{
    let pc = state.pc().ok_or(UnwindErrorKind::PcUnknown)?;

    // A return address points after its call instruction; map it into the
    // calling function by backing up one byte. A signal frame's PC is the
    // exact interrupted address and stays untouched.
    let lookup_pc = if state.signal_frame {
        pc
    } else {
        pc.wrapping_sub(1)
    };

    let cfi = space
        .cfi_for_pc(lookup_pc)
        .ok_or(UnwindErrorKind::NoModule)?;
    let pc_file = lookup_pc.wrapping_sub(cfi.bias);

    let row = match find_row(&cfi, pc_file) {
        Ok(row) => row,
        Err(err) if err.kind() == UnwindErrorKind::NoMatch && space.is_entry_pc(lookup_pc) => {
            // No FDE inside the entry function: the bottom of the stack.
            debug!(pc, "entry function reached, ending walk");
            return Err(UnwindErrorKind::RaUndefined.into());
        }
        Err(err) => return Err(err),
    };

    trace!(
        pc,
        start = row.start,
        end = row.end,
        signal = row.signal_frame,
        "unwind row found"
    );

    // Compute the canonical frame address first; register rules refer to
    // it.
    let cfa = match row.cfa {
        CfaRule::RegisterOffset { register, offset } => {
            let base = state
                .register(register)
                .ok_or(UnwindErrorKind::RegisterUnavailable(register))?;
            base.wrapping_add(offset as u64)
        }
        CfaRule::Expression(expr) => eval_expr(expr, state, None)?.inner(),
        CfaRule::Unset => return Err(UnwindErrorKind::BadCfi.into()),
    };

    let mut unwound = FrameState::new(state.backend());
    unwound.signal_frame = row.signal_frame;

    for register in 0..state.nregs() {
        match row.register(register) {
            RegisterRule::Undefined => {}
            RegisterRule::SameValue => {
                if let Some(value) = state.register(register) {
                    unwound.set_register(register, value);
                }
            }
            RegisterRule::Offset(offset) => {
                let addr = cfa.wrapping_add(offset as u64);
                let value = memory
                    .read_word(addr)
                    .ok_or(UnwindErrorKind::ProcessMemoryRead(addr))?;
                unwound.set_register(register, value);
            }
            RegisterRule::ValOffset(offset) => {
                unwound.set_register(register, cfa.wrapping_add(offset as u64));
            }
            RegisterRule::Register(source) | RegisterRule::ValRegister(source) => {
                if let Some(value) = state.register(source) {
                    unwound.set_register(register, value);
                }
            }
            RegisterRule::Expression(expr) => {
                let addr = eval_expr(expr, state, Some(cfa))?;
                let value = match addr {
                    ExprResult::Location(addr) => memory
                        .read_word(addr)
                        .ok_or(UnwindErrorKind::ProcessMemoryRead(addr))?,
                    ExprResult::Value(value) => value,
                };
                unwound.set_register(register, value);
            }
            RegisterRule::ValExpression(expr) => {
                let value = eval_expr(expr, state, Some(cfa))?.inner();
                unwound.set_register(register, value);
            }
            // Recovery is up to the ABI; nothing generic to do.
            RegisterRule::Architectural => {}
        }
    }

    // The caller resumes at the unwound return address. An undefined
    // return address column is the clean end of the stack.
    match row.register(row.ra_register) {
        RegisterRule::Undefined => return Err(UnwindErrorKind::RaUndefined.into()),
        _ => match unwound.register(row.ra_register) {
            Some(ra) => unwound.set_pc(ra),
            None => return Err(UnwindErrorKind::RaUndefined.into()),
        },
    }

    // The frame's own stack pointer at the call site is the CFA; make it
    // available even when no rule mentions the stack pointer column.
    if let CfaRule::RegisterOffset { register, .. } = row.cfa {
        if unwound.register(register).is_none() {
            unwound.set_register(register, cfa);
        }
    }

    Ok(unwound)
}

/// Walks the whole stack from an initial register state.
///
/// Frames come out innermost first. The walk ends cleanly on an undefined
/// return address or a refused memory read; any other error ends the walk
/// and is reported alongside the frames produced so far.
pub fn backtrace<S, M>(
    space: &S,
    memory: &M,
    initial: FrameState,
    max_frames: usize,
) -> Backtrace
where
    S: UnwindSpace + ?Sized,
    M: Memory + ?Sized,
{
    let mut frames = Vec::new();
    let mut state = initial;

    loop {
        let Some(pc) = state.pc() else {
            return Backtrace {
                frames,
                error: Some(UnwindErrorKind::PcUnknown),
            };
        };
        frames.push(Frame {
            pc,
            signal_frame: state.signal_frame,
            state: state.clone(),
        });
        if frames.len() >= max_frames {
            return Backtrace {
                frames,
                error: None,
            };
        }

        match unwind_frame(space, memory, &state) {
            Ok(next) => state = next,
            Err(err) => {
                let error = match err.kind() {
                    // Legitimate ends of the stack.
                    UnwindErrorKind::RaUndefined => None,
                    UnwindErrorKind::ProcessMemoryRead(_) if !frames.is_empty() => None,
                    kind => Some(kind),
                };
                return Backtrace { frames, error };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coretrace_cfi::CfiSection;
    use coretrace_common::{Arch, Backend};
    use coretrace_dwarf::constants::*;
    use coretrace_dwarf::Endian;
    use similar_asserts::assert_eq;
    use std::collections::HashMap;

    // A fake address space: one module at bias 0 whose .debug_frame has
    // a CIE (rsp+8, ra at cfa-8) and FDEs for two functions, `callee` at
    // [0x1000, 0x1040) and `caller` at [0x2000, 0x2040). The caller's
    // FDE marks the return address column undefined so walks end there.
    struct TestSpace {
        data: Vec<u8>,
    }

    fn push_entry(data: &mut Vec<u8>, content: &[u8]) {
        data.extend_from_slice(&(content.len() as u32).to_le_bytes());
        data.extend_from_slice(content);
    }

    fn build_frame_section() -> Vec<u8> {
        let mut data = Vec::new();

        let mut cie = Vec::new();
        cie.extend_from_slice(&u32::MAX.to_le_bytes());
        cie.push(1);
        cie.push(0);
        cie.push(1);
        cie.push(0x78); // -8
        cie.push(16);
        cie.extend_from_slice(&[DW_CFA_def_cfa, 7, 8]);
        cie.extend_from_slice(&[DW_CFA_offset | 16, 1]);
        push_entry(&mut data, &cie);

        // callee: default CIE rules over the whole range.
        let mut fde = Vec::new();
        fde.extend_from_slice(&0u32.to_le_bytes());
        fde.extend_from_slice(&0x1000u64.to_le_bytes());
        fde.extend_from_slice(&0x40u64.to_le_bytes());
        push_entry(&mut data, &fde);

        // caller: the return address column is undefined (outermost
        // function).
        let mut fde = Vec::new();
        fde.extend_from_slice(&0u32.to_le_bytes());
        fde.extend_from_slice(&0x2000u64.to_le_bytes());
        fde.extend_from_slice(&0x40u64.to_le_bytes());
        fde.extend_from_slice(&[DW_CFA_undefined, 16]);
        push_entry(&mut data, &fde);

        data
    }

    impl TestSpace {
        fn new() -> Self {
            TestSpace {
                data: build_frame_section(),
            }
        }

        fn table(&self) -> CfiTable<'_> {
            CfiTable::new(
                CfiSection::debug_frame(&self.data, Endian::Little, 8),
                Backend::for_arch(Arch::Amd64),
            )
        }
    }

    struct TestSpaceRef<'a> {
        table: CfiTable<'a>,
        entry_pc: Option<u64>,
    }

    impl UnwindSpace for TestSpaceRef<'_> {
        fn cfi_for_pc(&self, pc: u64) -> Option<ModuleCfi<'_>> {
            (pc >= 0x1000 && pc < 0x3000).then(|| ModuleCfi {
                eh_frame: None,
                debug_frame: Some(&self.table),
                bias: 0,
            })
        }

        fn is_entry_pc(&self, pc: u64) -> bool {
            self.entry_pc
                .map_or(false, |entry| pc >= entry && pc < entry + 0x100)
        }
    }

    struct TestMemory(HashMap<u64, u64>);

    impl Memory for TestMemory {
        fn read_word(&self, addr: u64) -> Option<u64> {
            self.0.get(&addr).copied()
        }
    }

    fn initial_state() -> FrameState {
        let mut state = FrameState::new(Backend::for_arch(Arch::Amd64).unwrap());
        state.set_pc(0x1010);
        state.set_register(7, 0x7fff_ff00); // rsp
        state
    }

    #[test]
    fn test_single_step() {
        let space = TestSpace::new();
        let space = TestSpaceRef {
            table: space.table(),
            entry_pc: None,
        };

        // The return address 0x2010 was pushed at CFA-8 = rsp.
        let memory = TestMemory(HashMap::from([(0x7fff_ff00, 0x2010u64)]));

        let state = initial_state();
        let unwound = unwind_frame(&space, &memory, &state).unwrap();

        assert_eq!(unwound.pc(), Some(0x2010));
        // The caller's rsp is the callee's CFA.
        assert_eq!(unwound.register(7), Some(0x7fff_ff08));
        assert!(!unwound.signal_frame);
    }

    #[test]
    fn test_backtrace_ends_on_undefined_ra() {
        let space = TestSpace::new();
        let space = TestSpaceRef {
            table: space.table(),
            entry_pc: None,
        };
        let memory = TestMemory(HashMap::from([(0x7fff_ff00, 0x2010u64)]));

        let trace = backtrace(&space, &memory, initial_state(), 16);
        assert_eq!(trace.error, None);
        let pcs: Vec<u64> = trace.frames.iter().map(|frame| frame.pc).collect();
        assert_eq!(pcs, vec![0x1010, 0x2010]);
    }

    #[test]
    fn test_memory_refusal_ends_cleanly() {
        let space = TestSpace::new();
        let space = TestSpaceRef {
            table: space.table(),
            entry_pc: None,
        };
        let memory = TestMemory(HashMap::new());

        let trace = backtrace(&space, &memory, initial_state(), 16);
        assert_eq!(trace.error, None);
        assert_eq!(trace.frames.len(), 1);
    }

    #[test]
    fn test_entry_function_stops_walk() {
        let space = TestSpace::new();
        let space = TestSpaceRef {
            table: space.table(),
            // An address covered by the module but by no FDE.
            entry_pc: Some(0x2800),
        };
        let memory = TestMemory(HashMap::new());

        let mut state = FrameState::new(Backend::for_arch(Arch::Amd64).unwrap());
        state.set_pc(0x2810);
        state.set_register(7, 0x7fff_ff00);

        let trace = backtrace(&space, &memory, state, 16);
        assert_eq!(trace.error, None);
        assert_eq!(trace.frames.len(), 1);
    }

    #[test]
    fn test_no_match_outside_entry_is_an_error() {
        let space = TestSpace::new();
        let space = TestSpaceRef {
            table: space.table(),
            entry_pc: None,
        };
        let memory = TestMemory(HashMap::new());

        let mut state = FrameState::new(Backend::for_arch(Arch::Amd64).unwrap());
        state.set_pc(0x2810);
        state.set_register(7, 0x7fff_ff00);

        let trace = backtrace(&space, &memory, state, 16);
        assert_eq!(trace.error, Some(UnwindErrorKind::NoMatch));
    }

    #[test]
    fn test_signal_frame_pc_is_not_adjusted() {
        // With pc == 0x1000 and the -1 adjustment, lookup would miss the
        // FDE; a signal frame must hit it exactly.
        let space = TestSpace::new();
        let space = TestSpaceRef {
            table: space.table(),
            entry_pc: None,
        };
        let memory = TestMemory(HashMap::from([(0x7fff_ff00, 0x2010u64)]));

        let mut state = initial_state();
        state.set_pc(0x1000);
        state.signal_frame = true;

        let unwound = unwind_frame(&space, &memory, &state).unwrap();
        assert_eq!(unwound.pc(), Some(0x2010));
    }
}
