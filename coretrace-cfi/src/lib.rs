//! Call frame information: decoding and interpretation.
//!
//! CFI describes, for every program counter value, how to recover the
//! caller's registers. It is stored as a sequence of CIE and FDE records in
//! `.debug_frame` (the platform ABI flavor) or `.eh_frame` (the exception
//! handling flavor with encoded pointers and augmentation data).
//!
//! [`CfiSection`] enumerates and decodes the raw records; [`CfiTable`]
//! interprets the instruction streams into [`UnwindRow`]s, one per PC
//! range, each holding a CFA rule and a rule per register. The expression
//! evaluator in [`evaluate`] covers the opcode subset CFI actually uses;
//! the unwinder supplies registers and memory.

#![warn(missing_docs)]

mod entries;
mod error;
mod expr;
mod table;

pub use crate::entries::{Cie, CfiEntriesIter, CfiEntry, CfiSection, Fde, RawFde};
pub use crate::error::{CfiError, CfiErrorKind};
pub use crate::expr::{evaluate, ExprContext, ExprResult};
pub use crate::table::{CfaRule, CfiTable, RegisterRule, UnwindRow};
