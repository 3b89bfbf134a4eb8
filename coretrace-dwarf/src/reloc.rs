//! Digested relocation tables for debug sections.
//!
//! Object files that were never linked (`ET_REL`) carry relocation sections
//! against their debug sections; the bytes in place are not final values.
//! This module digests those relocations into two sorted tables (one per
//! slot width) so that decoders can ask, for any byte offset inside a debug
//! section, whether a relocation applies there and what it contributes.
//!
//! Relocations whose symbol is defined non-weak in another non-allocated
//! section are resolved during digestion by folding the symbol value into
//! the addend; later lookups for those slots carry no symbol reference at
//! all. Everything else keeps its symbol index, to be resolved by a caller
//! that knows runtime symbol values.

use std::sync::atomic::{AtomicUsize, Ordering};

use coretrace_common::Backend;

use crate::error::{DwarfError, DwarfErrorKind};
use crate::reader::{Encoding, Endian, SectionReader};

/// Symbol binding value of `STB_WEAK`.
const STB_WEAK: u8 = 2;

/// An address-sized value read from a debug section, before symbol
/// resolution.
///
/// `value` is the final value when no symbol is attached, or the addend to
/// the symbol's runtime value otherwise. `relocated` records whether any
/// relocation slot covered the read at all, which is load-bearing for list
/// terminators: a pair of zeros that came from relocations is a real range,
/// not an end-of-list marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Relocatable {
    /// In-place value or relocation addend.
    pub value: u64,
    /// Symbol table index still to be resolved, if any.
    pub symbol: Option<u32>,
    /// Whether a relocation slot covered this value.
    pub relocated: bool,
}

impl Relocatable {
    /// A plain value with no relocation attached.
    pub fn raw(value: u64) -> Self {
        Relocatable {
            value,
            symbol: None,
            relocated: false,
        }
    }

    /// Resolves to a final value, looking up symbol values through `resolve`.
    ///
    /// Returns `None` when a needed symbol cannot be resolved.
    pub fn resolve<F>(&self, resolve: F) -> Option<u64>
    where
        F: FnOnce(u32) -> Option<u64>,
    {
        match self.symbol {
            None => Some(self.value),
            Some(symbol) => resolve(symbol).map(|base| base.wrapping_add(self.value)),
        }
    }
}

/// One relocation entry as found in a `REL`/`RELA` section.
///
/// `addend` is `Some` for `RELA` entries; `REL` entries keep their addend
/// in the target slot itself.
#[derive(Clone, Copy, Debug)]
pub struct RawReloc {
    /// Byte offset of the patched slot within the target section.
    pub offset: u64,
    /// Architecture-specific relocation type.
    pub r_type: u32,
    /// Symbol table index, `0` for none.
    pub symbol: u32,
    /// Explicit addend for `RELA`, `None` for `REL`.
    pub addend: Option<i64>,
}

/// Where a relocation symbol is defined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolSection {
    /// `SHN_UNDEF`.
    Undefined,
    /// A reserved index (`SHN_ABS`, `SHN_COMMON`, ...).
    Reserved,
    /// A regular section; `allocated` mirrors `SHF_ALLOC`.
    Section {
        /// Whether the defining section occupies memory at run time.
        allocated: bool,
    },
}

/// The parts of a symbol table entry the digester needs.
#[derive(Clone, Copy, Debug)]
pub struct RelocSymbol {
    /// The symbol value.
    pub value: u64,
    /// The `STB_*` binding.
    pub binding: u8,
    /// The section that defines the symbol.
    pub section: SymbolSection,
}

#[derive(Clone, Copy, Debug)]
struct DigestedReloc {
    offset: u64,
    symbol: u32,
    addend: Option<i64>,
}

#[derive(Debug, Default)]
struct RelocTable {
    entries: Vec<DigestedReloc>,
    // Index of the last search result, hit or miss. List and attribute
    // decoding queries slots in increasing offset order, so the next
    // match is almost always at the hint or right behind it.
    hint: AtomicUsize,
}

impl RelocTable {
    fn find(&self, offset: u64) -> Option<&DigestedReloc> {
        let entries = &self.entries;
        if entries.is_empty() {
            return None;
        }

        let hint = self.hint.load(Ordering::Relaxed);
        for probe in [hint, hint + 1] {
            if let Some(entry) = entries.get(probe) {
                if entry.offset == offset {
                    self.hint.store(probe, Ordering::Relaxed);
                    return Some(entry);
                }
            }
        }

        match entries.binary_search_by_key(&offset, |entry| entry.offset) {
            Ok(index) => {
                self.hint.store(index, Ordering::Relaxed);
                Some(&entries[index])
            }
            Err(insertion) => {
                // Remember where the miss landed; a later, larger offset
                // then probes the right neighborhood.
                self.hint.store(insertion, Ordering::Relaxed);
                None
            }
        }
    }
}

/// The digested relocations applying to one debug section.
pub struct RelocMap {
    rel4: RelocTable,
    rel8: RelocTable,
}

impl RelocMap {
    /// An empty map: no relocation applies anywhere.
    pub fn empty() -> Self {
        RelocMap {
            rel4: RelocTable::default(),
            rel8: RelocTable::default(),
        }
    }

    /// Digests the relocations of one debug section.
    ///
    /// Every entry is classified as a 4- or 8-byte slot through the
    /// backend's simple-relocation tables; anything else is an error, as
    /// are slots outside the section and addends that do not survive the
    /// narrowing to their slot width.
    pub fn digest(
        backend: &Backend,
        section_len: usize,
        relocs: &[RawReloc],
        symbols: &[RelocSymbol],
    ) -> Result<Self, DwarfError> {
        let mut rel4 = Vec::new();
        let mut rel8 = Vec::new();

        for reloc in relocs {
            let wide = if backend.reloc8_types.contains(&reloc.r_type) {
                true
            } else if backend.reloc4_types.contains(&reloc.r_type) {
                false
            } else {
                return Err(DwarfErrorKind::RelBadType(reloc.r_type).into());
            };

            let width = if wide { 8 } else { 4 };
            if (section_len as u64) < width || reloc.offset > section_len as u64 - width {
                return Err(DwarfErrorKind::RelBadOffset.into());
            }

            if !wide {
                if let Some(addend) = reloc.addend {
                    if i32::try_from(addend).is_err() {
                        return Err(DwarfErrorKind::RelBadAddend.into());
                    }
                }
            }

            let mut symbol = reloc.symbol;
            let mut addend = reloc.addend;

            if symbol != 0 {
                let sym = symbols
                    .get(symbol as usize)
                    .ok_or(DwarfErrorKind::RelBadSym)?;

                // A non-weak symbol in another non-allocated section (that
                // is, another debug section) has its final value already;
                // fold it in so lookups need no symbol dereference. This
                // only works for RELA, where the addend is explicit.
                if let Some(explicit) = addend {
                    if sym.binding < STB_WEAK
                        && matches!(sym.section, SymbolSection::Section { allocated: false })
                    {
                        addend = Some(explicit.wrapping_add(sym.value as i64));
                        symbol = 0;
                    }
                }
            }

            // Fully static zero contributions need no table entry.
            if symbol == 0 && addend == Some(0) {
                continue;
            }

            let entry = DigestedReloc {
                offset: reloc.offset,
                symbol,
                addend,
            };
            if wide {
                rel8.push(entry);
            } else {
                rel4.push(entry);
            }
        }

        dmsort::sort_by_key(&mut rel4, |entry| entry.offset);
        dmsort::sort_by_key(&mut rel8, |entry| entry.offset);

        Ok(RelocMap {
            rel4: RelocTable {
                entries: rel4,
                hint: AtomicUsize::new(0),
            },
            rel8: RelocTable {
                entries: rel8,
                hint: AtomicUsize::new(0),
            },
        })
    }

    /// Looks up the relocation covering a slot, if any.
    ///
    /// `width` must be 4 or 8; the two widths live in separate tables.
    pub fn lookup(&self, offset: u64, width: u8) -> Option<(u32, Option<i64>)> {
        let table = match width {
            4 => &self.rel4,
            8 => &self.rel8,
            _ => return None,
        };
        table
            .find(offset)
            .map(|entry| (entry.symbol, entry.addend))
    }

    /// Reads the address-sized value at `offset` in `data`, applying any
    /// relocation covering the slot.
    pub fn read(
        &self,
        data: &[u8],
        offset: usize,
        width: u8,
        endian: Endian,
    ) -> Result<Relocatable, DwarfError> {
        let mut reader = SectionReader::at(data, Encoding::new(endian, width), offset)?;
        let in_place = reader.read_address()?;

        match self.lookup(offset as u64, width) {
            None => Ok(Relocatable::raw(in_place)),
            Some((symbol, addend)) => {
                let value = match addend {
                    Some(addend) => addend as u64,
                    // REL keeps the addend in the slot itself; narrow
                    // slots hold a signed value.
                    None if width == 4 => in_place as u32 as i32 as i64 as u64,
                    None => in_place,
                };
                Ok(Relocatable {
                    value,
                    symbol: (symbol != 0).then_some(symbol),
                    relocated: true,
                })
            }
        }
    }
}

impl std::fmt::Debug for RelocMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelocMap")
            .field("rel4", &self.rel4.entries.len())
            .field("rel8", &self.rel8.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coretrace_common::Arch;
    use similar_asserts::assert_eq;

    const R_X86_64_64: u32 = 1;
    const R_X86_64_32: u32 = 10;

    fn backend() -> &'static Backend {
        Backend::for_arch(Arch::Amd64).unwrap()
    }

    fn symbols() -> Vec<RelocSymbol> {
        vec![
            // Index 0 is the null symbol.
            RelocSymbol {
                value: 0,
                binding: 0,
                section: SymbolSection::Undefined,
            },
            // A local symbol in another debug section.
            RelocSymbol {
                value: 0x100,
                binding: 0,
                section: SymbolSection::Section { allocated: false },
            },
            // A global symbol in .text.
            RelocSymbol {
                value: 0x4000,
                binding: 1,
                section: SymbolSection::Section { allocated: true },
            },
        ]
    }

    #[test]
    fn test_digest_and_lookup() {
        let relocs = [
            RawReloc {
                offset: 24,
                r_type: R_X86_64_64,
                symbol: 2,
                addend: Some(8),
            },
            RawReloc {
                offset: 8,
                r_type: R_X86_64_64,
                symbol: 2,
                addend: Some(0),
            },
        ];
        let map = RelocMap::digest(backend(), 64, &relocs, &symbols()).unwrap();

        // Sorted by offset despite input order.
        assert_eq!(map.lookup(8, 8), Some((2, Some(0))));
        assert_eq!(map.lookup(24, 8), Some((2, Some(8))));
        assert_eq!(map.lookup(16, 8), None);
        assert_eq!(map.lookup(8, 4), None);
    }

    #[test]
    fn test_local_debug_symbol_is_preresolved() {
        let relocs = [RawReloc {
            offset: 0,
            r_type: R_X86_64_32,
            symbol: 1,
            addend: Some(0x20),
        }];
        let map = RelocMap::digest(backend(), 16, &relocs, &symbols()).unwrap();

        // The symbol value was folded into the addend.
        assert_eq!(map.lookup(0, 4), Some((0, Some(0x120))));
    }

    #[test]
    fn test_read_applies_relocation() {
        let relocs = [RawReloc {
            offset: 8,
            r_type: R_X86_64_64,
            symbol: 2,
            addend: Some(0x10),
        }];
        let map = RelocMap::digest(backend(), 16, &relocs, &symbols()).unwrap();

        let data = [0u8; 16];
        let value = map.read(&data, 8, 8, Endian::Little).unwrap();
        assert_eq!(value.symbol, Some(2));
        assert_eq!(value.value, 0x10);
        assert!(value.relocated);
        assert_eq!(value.resolve(|_| Some(0x4000)), Some(0x4010));

        let plain = map.read(&data, 0, 8, Endian::Little).unwrap();
        assert_eq!(plain, Relocatable::raw(0));
    }

    #[test]
    fn test_digest_errors() {
        let bad_type = [RawReloc {
            offset: 0,
            r_type: 99,
            symbol: 2,
            addend: Some(0),
        }];
        assert_eq!(
            RelocMap::digest(backend(), 16, &bad_type, &symbols())
                .unwrap_err()
                .kind(),
            DwarfErrorKind::RelBadType(99)
        );

        let bad_offset = [RawReloc {
            offset: 12,
            r_type: R_X86_64_64,
            symbol: 2,
            addend: Some(0),
        }];
        assert_eq!(
            RelocMap::digest(backend(), 16, &bad_offset, &symbols())
                .unwrap_err()
                .kind(),
            DwarfErrorKind::RelBadOffset
        );

        let bad_addend = [RawReloc {
            offset: 0,
            r_type: R_X86_64_32,
            symbol: 2,
            addend: Some(i64::MAX),
        }];
        assert_eq!(
            RelocMap::digest(backend(), 16, &bad_addend, &symbols())
                .unwrap_err()
                .kind(),
            DwarfErrorKind::RelBadAddend
        );

        let bad_sym = [RawReloc {
            offset: 0,
            r_type: R_X86_64_64,
            symbol: 17,
            addend: Some(0),
        }];
        assert_eq!(
            RelocMap::digest(backend(), 16, &bad_sym, &symbols())
                .unwrap_err()
                .kind(),
            DwarfErrorKind::RelBadSym
        );
    }

    #[test]
    fn test_sequential_hint() {
        let relocs: Vec<_> = (0..8u64)
            .map(|i| RawReloc {
                offset: i * 8,
                r_type: R_X86_64_64,
                symbol: 2,
                addend: Some(i as i64),
            })
            .collect();
        let map = RelocMap::digest(backend(), 128, &relocs, &symbols()).unwrap();

        // The increasing-offset pattern the hint is tuned for.
        for i in 0..8u64 {
            assert_eq!(map.lookup(i * 8, 8), Some((2, Some(i as i64))));
        }

        // Misses in between must not derail later hits, whatever state
        // they leave the hint in.
        assert_eq!(map.lookup(0, 8), Some((2, Some(0))));
        assert_eq!(map.lookup(4, 8), None);
        assert_eq!(map.lookup(8, 8), Some((2, Some(1))));
        assert_eq!(map.lookup(200, 8), None);
        assert_eq!(map.lookup(16, 8), Some((2, Some(2))));
        // Going backwards still resolves through the full search.
        assert_eq!(map.lookup(0, 8), Some((2, Some(0))));
    }
}
