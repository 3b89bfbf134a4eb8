//! Thread attachment and memory access for live processes.
//!
//! Attaching follows the ptrace discipline: every thread of interest is
//! `PTRACE_ATTACH`ed and waited for, the set of threads *we* stopped is
//! recorded, and exactly those are detached at drop time, error paths
//! included. A thread that was already stopped by someone else (a
//! debugger parent) is left alone.

use std::fs;
use std::io;
use std::ptr;

use tracing::{debug, warn};

use coretrace_common::Backend;

use crate::error::{UnwindError, UnwindErrorKind};
use crate::state::{FrameState, Memory};

/// A process whose threads this unwinder has stopped.
#[derive(Debug)]
pub struct AttachedProcess {
    pid: i32,
    attached: Vec<i32>,
}

impl AttachedProcess {
    /// Attaches to every thread of `pid` and waits for each to stop.
    ///
    /// Threads that cannot be attached (they exited, or a debugger
    /// already traces them) are skipped with a warning; the remaining
    /// threads are still usable.
    pub fn attach(pid: i32) -> Result<Self, UnwindError> {
        let tasks = fs::read_dir(format!("/proc/{pid}/task"))
            .map_err(|err| UnwindError::new(UnwindErrorKind::Ptrace, err))?;

        let mut attached = Vec::new();
        for entry in tasks {
            let entry = entry.map_err(|err| UnwindError::new(UnwindErrorKind::Ptrace, err))?;
            let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };

            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_ATTACH,
                    tid,
                    ptr::null_mut::<libc::c_void>(),
                    ptr::null_mut::<libc::c_void>(),
                )
            };
            if rc != 0 {
                warn!(tid, error = %io::Error::last_os_error(), "cannot attach thread");
                continue;
            }

            let mut status = 0;
            let waited = unsafe { libc::waitpid(tid, &mut status, libc::__WALL) };
            if waited != tid || !libc::WIFSTOPPED(status) {
                warn!(tid, "thread did not stop after attach");
                unsafe {
                    libc::ptrace(
                        libc::PTRACE_DETACH,
                        tid,
                        ptr::null_mut::<libc::c_void>(),
                        ptr::null_mut::<libc::c_void>(),
                    );
                }
                continue;
            }

            attached.push(tid);
        }

        if attached.is_empty() {
            return Err(UnwindErrorKind::Ptrace.into());
        }

        debug!(pid, threads = attached.len(), "attached to process");
        Ok(AttachedProcess { pid, attached })
    }

    /// The process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The threads this attachment stopped.
    pub fn threads(&self) -> &[i32] {
        &self.attached
    }

    /// Fetches the register state of one stopped thread.
    pub fn registers(
        &self,
        tid: i32,
        backend: &'static Backend,
    ) -> Result<FrameState, UnwindError> {
        let layout = backend
            .core_regs
            .ok_or(UnwindErrorKind::Ptrace)?;

        // PTRACE_GETREGSET with NT_PRSTATUS delivers the same register
        // block a core file's pr_reg holds, so the backend's core layout
        // applies directly.
        let mut buf = [0u8; 512];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                tid,
                libc::NT_PRSTATUS as usize as *mut libc::c_void,
                &mut iov as *mut libc::iovec,
            )
        };
        if rc != 0 {
            return Err(UnwindError::new(
                UnwindErrorKind::Ptrace,
                io::Error::last_os_error(),
            ));
        }

        let word = |offset: usize| -> Option<u64> {
            let end = offset.checked_add(layout.reg_size)?;
            if end > iov.iov_len {
                return None;
            }
            let bytes = &buf[offset..end];
            Some(match layout.reg_size {
                4 => u64::from(u32::from_ne_bytes(bytes.try_into().ok()?)),
                _ => u64::from_ne_bytes(bytes.try_into().ok()?),
            })
        };

        let mut state = FrameState::new(backend);
        for &(register, offset) in layout.regs {
            if let Some(value) = word(offset) {
                state.set_register(register, value);
            }
        }
        if let Some(pc) = word(layout.pc_offset) {
            state.set_pc(pc);
        }

        Ok(state)
    }
}

impl Memory for AttachedProcess {
    fn read_word(&self, addr: u64) -> Option<u64> {
        let tid = *self.attached.first()?;
        // PEEKDATA has no error return value; errno disambiguates a read
        // -1 from a failure.
        unsafe {
            *libc::__errno_location() = 0;
        }
        let value = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKDATA,
                tid,
                addr as *mut libc::c_void,
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if value == -1 && unsafe { *libc::__errno_location() } != 0 {
            return None;
        }
        Some(value as u64)
    }
}

impl Drop for AttachedProcess {
    fn drop(&mut self) {
        for &tid in &self.attached {
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_DETACH,
                    tid,
                    ptr::null_mut::<libc::c_void>(),
                    ptr::null_mut::<libc::c_void>(),
                )
            };
            if rc != 0 {
                warn!(tid, "detach failed");
            }
        }
    }
}
