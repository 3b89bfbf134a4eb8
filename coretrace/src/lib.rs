//! `coretrace` inspects object files in the ELF container and the DWARF
//! debugging information inside them. It reads local files, live processes
//! and core dumps, producing symbolicated stack traces, source-line
//! information and structural queries against debug data.
//!
//! The workspace consists of largely independent crates, re-exported here
//! as modules:
//!
//! - [`common`]: byte views, self-referential cells and the architecture
//!   backend table.
//! - [`dwarf`]: the lazy, relocation-aware DWARF reader (units, DIEs,
//!   attributes, line programs, location and range lists).
//! - [`cfi`]: call frame information from `.debug_frame` and `.eh_frame`,
//!   interpreted into per-PC unwind rows.
//! - [`unwind`]: the frame-by-frame stack unwinder over register state
//!   from live threads or core-file notes.
//! - [`modules`]: the registry mapping runtime addresses to loaded
//!   modules, their debug files and symbols.
//!
//! # Example
//!
//! Symbolicating an address inside a core dump:
//!
//! ```rust,no_run
//! use coretrace::modules::{Registry, RegistryOpts};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::from_core_path("./core".as_ref(), RegistryOpts::default())?;
//! for thread in registry.threads() {
//!     if let Some(pc) = thread.state.pc() {
//!         println!("thread {}: {:?}", thread.tid, registry.find_symbol(pc)?);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

#[doc(inline)]
#[cfg(feature = "cfi")]
pub use coretrace_cfi as cfi;
#[doc(inline)]
pub use coretrace_common as common;
#[doc(inline)]
pub use coretrace_dwarf as dwarf;
#[doc(inline)]
#[cfg(feature = "modules")]
pub use coretrace_modules as modules;
#[doc(inline)]
#[cfg(feature = "unwind")]
pub use coretrace_unwind as unwind;
