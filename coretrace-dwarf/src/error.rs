//! The error type shared by all DWARF decoders in this crate.

use std::error::Error;
use std::fmt;

use thiserror::Error;

/// The error kind for [`DwarfError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DwarfErrorKind {
    /// A reader hit the end of a bounded section view mid-value.
    Truncated,
    /// A LEB128 value did not terminate within ten bytes.
    Overflow,
    /// An unknown or impossible DWARF form.
    BadForm(u32),
    /// An abbreviation code not present in the unit's table, or a stray
    /// `(0, 0)` pair inside an abbreviation's attribute list.
    BadAbbrev(u64),
    /// A structural contradiction in the DWARF data, such as a redundant
    /// PC specification or a half-relocated list terminator.
    InvalidDwarf,
    /// The version of a unit or table header is not supported.
    UnsupportedVersion(u16),
    /// The symbol table referenced by a relocation section is unusable.
    RelBadSym,
    /// A relocation of a type the architecture backend does not classify.
    RelBadType(u32),
    /// A relocation slot extends past the end of its target section.
    RelBadOffset,
    /// A relocation addend overflows the narrowing to its 4-byte slot.
    RelBadAddend,
    /// No line record or table row exists for the requested address.
    NoMatch,
}

impl fmt::Display for DwarfErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "unexpected end of section data"),
            Self::Overflow => write!(f, "unterminated variable-length integer"),
            Self::BadForm(form) => write!(f, "unknown DWARF form {form:#x}"),
            Self::BadAbbrev(code) => write!(f, "invalid abbreviation code {code}"),
            Self::InvalidDwarf => write!(f, "invalid DWARF data"),
            Self::UnsupportedVersion(version) => write!(f, "unsupported DWARF version {version}"),
            Self::RelBadSym => write!(f, "corrupt symbol table behind relocation section"),
            Self::RelBadType(ty) => write!(f, "unsupported relocation type {ty}"),
            Self::RelBadOffset => write!(f, "relocation outside its target section"),
            Self::RelBadAddend => write!(f, "relocation addend does not fit its slot"),
            Self::NoMatch => write!(f, "no record covers this address"),
        }
    }
}

/// An error handling DWARF debugging information.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct DwarfError {
    kind: DwarfErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl DwarfError {
    /// Creates a new DWARF error from a known kind of error as well as an
    /// arbitrary error payload.
    pub(crate) fn new<E>(kind: DwarfErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`DwarfErrorKind`] for this error.
    pub fn kind(&self) -> DwarfErrorKind {
        self.kind
    }
}

impl From<DwarfErrorKind> for DwarfError {
    fn from(kind: DwarfErrorKind) -> Self {
        Self { kind, source: None }
    }
}
