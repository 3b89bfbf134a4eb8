//! The error type for stack unwinding.

use std::error::Error;
use std::fmt;

use thiserror::Error;

use coretrace_cfi::{CfiError, CfiErrorKind};

/// The error kind for [`UnwindError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindErrorKind {
    /// The program counter of the frame is not known.
    PcUnknown,
    /// No module covers the program counter.
    NoModule,
    /// The covering module has no call frame information at all.
    NoCfi,
    /// No unwind row covers the program counter.
    NoMatch,
    /// The return address register is undefined here; the legitimate end
    /// of the stack.
    RaUndefined,
    /// A register needed by an unwind rule has no known value.
    RegisterUnavailable(u16),
    /// The memory-read callback refused a read.
    ProcessMemoryRead(u64),
    /// A call frame expression failed to evaluate.
    ExprError,
    /// The call frame information itself is unusable.
    BadCfi,
    /// A ptrace operation on the target process failed.
    Ptrace,
}

impl fmt::Display for UnwindErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PcUnknown => write!(f, "program counter unknown"),
            Self::NoModule => write!(f, "no module covers this address"),
            Self::NoCfi => write!(f, "module has no unwind information"),
            Self::NoMatch => write!(f, "no unwind information for this address"),
            Self::RaUndefined => write!(f, "return address undefined"),
            Self::RegisterUnavailable(register) => {
                write!(f, "register {register} has no known value")
            }
            Self::ProcessMemoryRead(addr) => {
                write!(f, "cannot read target memory at {addr:#x}")
            }
            Self::ExprError => write!(f, "unwind expression failed"),
            Self::BadCfi => write!(f, "unusable call frame information"),
            Self::Ptrace => write!(f, "ptrace operation failed"),
        }
    }
}

/// An error produced while unwinding a stack.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct UnwindError {
    kind: UnwindErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl UnwindError {
    /// Creates a new unwind error from a known kind of error as well as
    /// an arbitrary error payload.
    pub(crate) fn new<E>(kind: UnwindErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`UnwindErrorKind`] for this error.
    pub fn kind(&self) -> UnwindErrorKind {
        self.kind
    }
}

impl From<UnwindErrorKind> for UnwindError {
    fn from(kind: UnwindErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<CfiError> for UnwindError {
    fn from(e: CfiError) -> Self {
        let kind = match e.kind() {
            CfiErrorKind::NoMatch => UnwindErrorKind::NoMatch,
            CfiErrorKind::ExprError => UnwindErrorKind::ExprError,
            _ => UnwindErrorKind::BadCfi,
        };
        Self::new(kind, e)
    }
}
