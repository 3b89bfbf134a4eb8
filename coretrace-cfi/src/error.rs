//! The error type for call frame information handling.

use std::error::Error;
use std::fmt;

use thiserror::Error;

use coretrace_dwarf::DwarfError;

/// The error kind for [`CfiError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiErrorKind {
    /// A record ran off the end of the section.
    Truncated,
    /// A structurally invalid CIE or FDE.
    InvalidCfi,
    /// A CIE version this reader does not support.
    UnsupportedVersion(u8),
    /// An augmentation string that cannot be decoded.
    UnknownAugmentation,
    /// A pointer encoding this reader does not support.
    UnsupportedEncoding(u8),
    /// A call frame instruction this reader does not know.
    UnknownInstruction(u8),
    /// No FDE covers the requested program counter.
    NoMatch,
    /// A DWARF expression failed: stack underflow, an unsupported opcode,
    /// or an unsuitable result.
    ExprError,
}

impl fmt::Display for CfiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "unexpected end of call frame data"),
            Self::InvalidCfi => write!(f, "invalid call frame information"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported call frame version {version}")
            }
            Self::UnknownAugmentation => write!(f, "unknown augmentation string"),
            Self::UnsupportedEncoding(encoding) => {
                write!(f, "unsupported pointer encoding {encoding:#x}")
            }
            Self::UnknownInstruction(op) => {
                write!(f, "unknown call frame instruction {op:#x}")
            }
            Self::NoMatch => write!(f, "no call frame information for this address"),
            Self::ExprError => write!(f, "call frame expression failed"),
        }
    }
}

/// An error handling call frame information.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CfiError {
    kind: CfiErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl CfiError {
    /// Creates a new CFI error from a known kind of error as well as an
    /// arbitrary error payload.
    pub(crate) fn new<E>(kind: CfiErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`CfiErrorKind`] for this error.
    pub fn kind(&self) -> CfiErrorKind {
        self.kind
    }
}

impl From<CfiErrorKind> for CfiError {
    fn from(kind: CfiErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<DwarfError> for CfiError {
    fn from(e: DwarfError) -> Self {
        use coretrace_dwarf::DwarfErrorKind;
        let kind = match e.kind() {
            DwarfErrorKind::Truncated | DwarfErrorKind::Overflow => CfiErrorKind::Truncated,
            _ => CfiErrorKind::InvalidCfi,
        };
        Self::new(kind, e)
    }
}
