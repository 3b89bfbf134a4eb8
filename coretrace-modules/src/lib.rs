//! The module registry: which object file lives at which address.
//!
//! A [`Registry`] owns one [`Module`] per loaded object of a target, with
//! non-overlapping address ranges. Registries are constructed from a live
//! process (by reading `/proc/<pid>/maps`) or from a core dump (by
//! reconstructing the mappings from the core's own segments and the
//! dynamic linker's `r_debug` list). Modules lazily open their backing
//! files, pair a separate debug file via build-ID or `.gnu_debuglink`,
//! digest symbol tables, and hand out DWARF sessions and CFI tables.
//!
//! Address-to-symbol and address-to-source-line queries sit on top:
//! [`Registry::find_symbol`] and [`Registry::source_location`].

#![warn(missing_docs)]

mod corefile;
mod error;
mod filecache;
mod lookup;
mod module;
mod object;
mod procmaps;
mod registry;
mod symbols;

pub use crate::corefile::CoreImage;
pub use crate::error::{ModuleError, ModuleErrorKind};
pub use crate::filecache::FileCache;
pub use crate::lookup::{BuildId, DebuginfoPath, DefaultLookup, FileLookup};
pub use crate::module::{Module, ModuleFile};
pub use crate::object::{DebugLink, ElfObject};
pub use crate::procmaps::{merge_maps, MapEntry, ModuleMap};
pub use crate::registry::{Registry, RegistryOpts};
pub use crate::symbols::{Symbol, SymbolInfo, SymbolTable};
