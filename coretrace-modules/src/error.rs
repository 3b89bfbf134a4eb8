//! The error type for module handling.

use std::error::Error;
use std::fmt;
use std::io;

use thiserror::Error;

/// The error kind for [`ModuleError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleErrorKind {
    /// A backing file could not be opened or read.
    Io,
    /// A backing file is not a usable ELF object.
    BadElf,
    /// The target's map information could not be parsed.
    BadMaps,
    /// The core file lacks the structures needed for reconstruction.
    BadCore,
    /// No debug information could be located for the module.
    NoDebugInfo,
    /// No symbol table could be located for the module.
    NoSymbols,
    /// A separate debug file candidate did not match the module.
    DebugMismatch,
    /// No module covers the requested address.
    NoModule,
    /// The module's debug information is unusable.
    BadDwarf,
}

impl fmt::Display for ModuleErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => write!(f, "cannot read backing file"),
            Self::BadElf => write!(f, "invalid ELF file"),
            Self::BadMaps => write!(f, "cannot parse process maps"),
            Self::BadCore => write!(f, "cannot reconstruct modules from core file"),
            Self::NoDebugInfo => write!(f, "no debug information found"),
            Self::NoSymbols => write!(f, "no symbol table found"),
            Self::DebugMismatch => write!(f, "debug file does not match module"),
            Self::NoModule => write!(f, "no module covers this address"),
            Self::BadDwarf => write!(f, "unusable debug information"),
        }
    }
}

/// An error produced by the module registry.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ModuleError {
    kind: ModuleErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ModuleError {
    /// Creates a new module error from a known kind of error as well as
    /// an arbitrary error payload.
    pub(crate) fn new<E>(kind: ModuleErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`ModuleErrorKind`] for this error.
    pub fn kind(&self) -> ModuleErrorKind {
        self.kind
    }
}

impl From<ModuleErrorKind> for ModuleError {
    fn from(kind: ModuleErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<io::Error> for ModuleError {
    fn from(e: io::Error) -> Self {
        Self::new(ModuleErrorKind::Io, e)
    }
}

impl From<goblin::error::Error> for ModuleError {
    fn from(e: goblin::error::Error) -> Self {
        Self::new(ModuleErrorKind::BadElf, e)
    }
}

impl From<scroll::Error> for ModuleError {
    fn from(e: scroll::Error) -> Self {
        Self::new(ModuleErrorKind::BadElf, e)
    }
}

impl From<coretrace_dwarf::DwarfError> for ModuleError {
    fn from(e: coretrace_dwarf::DwarfError) -> Self {
        Self::new(ModuleErrorKind::BadDwarf, e)
    }
}
