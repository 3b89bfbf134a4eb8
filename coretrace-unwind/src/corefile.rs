//! Register snapshots from core-file notes.

use coretrace_common::Backend;
use coretrace_dwarf::{Encoding, Endian, SectionReader};

use crate::state::FrameState;

/// The note type carrying a per-thread register snapshot.
pub const NT_PRSTATUS: u32 = 1;

/// One thread's identity and registers as recovered from a core file.
#[derive(Clone, Debug)]
pub struct ThreadState {
    /// The kernel thread id recorded in the note.
    pub tid: i32,
    /// The thread's register state.
    pub state: FrameState,
}

/// Decodes an `NT_PRSTATUS` note descriptor into a register state.
///
/// The layout of the `elf_prstatus` record and the register block inside
/// it is ABI-specific and comes from the backend table; architectures
/// without a core-note layout yield `None`.
pub fn state_from_prstatus(
    desc: &[u8],
    endian: Endian,
    backend: &'static Backend,
) -> Option<ThreadState> {
    let layout = backend.core_regs?;

    // pr_pid sits behind the signal fields, whose size depends on the
    // ABI's word width.
    let pid_offset = if layout.reg_size == 8 { 32 } else { 24 };

    let encoding = Encoding::new(endian, layout.reg_size as u8);
    let read_at = |offset: usize, width: u8| -> Option<u64> {
        let mut reader = SectionReader::at(desc, encoding, offset).ok()?;
        reader.read_word(width).ok()
    };

    let tid = read_at(pid_offset, 4)? as i32;

    let mut state = FrameState::new(backend);
    for &(register, offset) in layout.regs {
        let value = read_at(layout.pr_reg_offset + offset, layout.reg_size as u8)?;
        state.set_register(register, value);
    }
    let pc = read_at(layout.pr_reg_offset + layout.pc_offset, layout.reg_size as u8)?;
    state.set_pc(pc);

    Some(ThreadState { tid, state })
}
