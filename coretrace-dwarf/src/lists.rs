//! Range list and location list readers.
//!
//! Both `.debug_ranges` and `.debug_loc` hold lists of address pairs with
//! two in-band escapes: a first word of all-ones selects a new base
//! address, and a pair of zeros ends the list. In unlinked files the
//! escapes only apply to *unrelocated* words; a pair of zeros whose bytes
//! carry relocations is a genuine range starting at (relocated) zero.

use fallible_iterator::FallibleIterator;

use crate::constants::*;
use crate::die::Die;
use crate::error::{DwarfError, DwarfErrorKind};
use crate::attr::AttributeValue;
use crate::reader::{Encoding, SectionReader};
use crate::reloc::{RelocMap, Relocatable};
use crate::section::SectionId;
use crate::version::DwClass;

/// One contiguous PC range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    /// Inclusive start address.
    pub start: Relocatable,
    /// Exclusive end address.
    pub end: Relocatable,
}

/// One location list entry: an expression valid over a PC range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocListEntry<'d> {
    /// Inclusive start address.
    pub start: Relocatable,
    /// Exclusive end address.
    pub end: Relocatable,
    /// The location expression bytes.
    pub expr: &'d [u8],
}

// The pair-reading core shared by both list flavors.
struct ListCore<'d> {
    reader: SectionReader<'d>,
    relocs: &'d RelocMap,
    address_size: u8,
    // The current base address; None means "not yet determined", in which
    // case the owning DIE's unit provides it on first use.
    base: Option<Relocatable>,
    cu_base: Option<Relocatable>,
    done: bool,
}

enum PairStep {
    Base(Relocatable),
    End,
    Pair(Relocatable, Relocatable),
}

impl<'d> ListCore<'d> {
    fn new(die: &Die<'d>, section: SectionId, offset: u64) -> Result<Self, DwarfError> {
        let info = die.info();
        let data = info.section_data(section);
        let unit = die.unit();
        let reader = SectionReader::at(
            data,
            Encoding::new(info.endian(), unit.address_size),
            offset as usize,
        )?;

        // The default base address comes from DW_AT_low_pc on the unit
        // DIE. DWARF 3 draft 4 allowed DW_AT_entry_pc to override it;
        // that was removed, but GCC emits entry_pc and no low_pc for
        // units with discontiguous ranges.
        let root = info.root_die(unit);
        let cu_base = match root.attr_value(DW_AT_low_pc)? {
            Some(value) => value.as_address(),
            None => root
                .attr_value(DW_AT_entry_pc)?
                .and_then(|value| value.as_address()),
        };

        Ok(ListCore {
            reader,
            relocs: info.reloc_map(section)?,
            address_size: unit.address_size,
            base: None,
            cu_base,
            done: false,
        })
    }

    fn read_word(&mut self) -> Result<Relocatable, DwarfError> {
        let pos = self.reader.pos();
        let value = self.relocs.read(
            self.reader.data(),
            pos,
            self.address_size,
            self.reader.encoding().endian,
        )?;
        self.reader.skip(self.address_size as usize)?;
        Ok(value)
    }

    fn step(&mut self) -> Result<PairStep, DwarfError> {
        let escape = if self.address_size == 8 {
            u64::MAX
        } else {
            u64::from(u32::MAX)
        };

        let begin = self.read_word()?;
        if begin.value == escape && !begin.relocated {
            // Base address selection entry.
            let base = self.read_word()?;
            return Ok(PairStep::Base(base));
        }

        let end = self.read_word()?;

        if begin.value == 0 && end.value == 0 {
            match (begin.relocated, end.relocated) {
                // Both raw: the end-of-list entry.
                (false, false) => return Ok(PairStep::End),
                // Both relocated: a genuine range that happens to start
                // and end at offset zero of its symbols.
                (true, true) => {}
                // Half a terminator is a contradiction.
                _ => return Err(DwarfErrorKind::InvalidDwarf.into()),
            }
        }

        Ok(PairStep::Pair(begin, end))
    }

    fn rebase(&mut self, word: Relocatable) -> Result<Relocatable, DwarfError> {
        if word.relocated {
            // The address carries its own relocation and is absolute.
            return Ok(word);
        }
        let base = match self.base.or(self.cu_base) {
            Some(base) => base,
            None => return Err(DwarfErrorKind::InvalidDwarf.into()),
        };
        Ok(Relocatable {
            value: base.value.wrapping_add(word.value),
            symbol: base.symbol,
            relocated: base.relocated,
        })
    }

    fn next_pair(&mut self) -> Result<Option<(Relocatable, Relocatable)>, DwarfError> {
        while !self.done {
            match self.step()? {
                PairStep::Base(base) => self.base = Some(base),
                PairStep::End => self.done = true,
                PairStep::Pair(begin, end) => {
                    let start = self.rebase(begin)?;
                    let end = self.rebase(end)?;
                    return Ok(Some((start, end)));
                }
            }
        }
        Ok(None)
    }
}

/// Iterator over the PC ranges of a DIE.
///
/// A DIE with `DW_AT_low_pc`/`DW_AT_high_pc` yields that single range; a
/// DIE with `DW_AT_ranges` walks the referenced list. Carrying both is a
/// redundant specification and an error, as is a DIE mixing a lone
/// `DW_AT_high_pc` with a range list.
pub struct RangesIter<'d> {
    single: Option<Range>,
    list: Option<ListCore<'d>>,
}

impl<'d> RangesIter<'d> {
    /// Creates the iterator for a DIE.
    pub fn new(die: &Die<'d>) -> Result<Self, DwarfError> {
        let ranges_offset = match die.attr_value(DW_AT_ranges)? {
            Some(AttributeValue::SecOffset {
                class: DwClass::RangelistPtr,
                offset,
            }) => Some(offset),
            Some(_) => return Err(DwarfErrorKind::InvalidDwarf.into()),
            None => None,
        };

        if let Some(range) = die.pc_range()? {
            if ranges_offset.is_some() {
                // Both a contiguous pair and a list is a redundant
                // specification.
                return Err(DwarfErrorKind::InvalidDwarf.into());
            }
            return Ok(RangesIter {
                single: Some(Range {
                    start: range.0,
                    end: range.1,
                }),
                list: None,
            });
        }

        match ranges_offset {
            Some(offset) => Ok(RangesIter {
                single: None,
                list: Some(ListCore::new(die, SectionId::DebugRanges, offset)?),
            }),
            // No PC attributes at all: an empty range list.
            None => Ok(RangesIter {
                single: None,
                list: None,
            }),
        }
    }
}

impl FallibleIterator for RangesIter<'_> {
    type Item = Range;
    type Error = DwarfError;

    fn next(&mut self) -> Result<Option<Range>, DwarfError> {
        if let Some(single) = self.single.take() {
            return Ok(Some(single));
        }
        let Some(list) = self.list.as_mut() else {
            return Ok(None);
        };
        Ok(list.next_pair()?.map(|(start, end)| Range { start, end }))
    }
}

/// Iterator over the entries of a location list.
pub struct LocListIter<'d> {
    list: Option<ListCore<'d>>,
    single: Option<&'d [u8]>,
}

impl<'d> LocListIter<'d> {
    /// Creates the iterator for a DIE attribute holding a location.
    ///
    /// An `exprloc`-class attribute yields one entry covering all
    /// addresses; a `loclistptr` walks `.debug_loc`.
    pub fn new(die: &Die<'d>, attr: u32) -> Result<Self, DwarfError> {
        match die.attr_value(attr)? {
            Some(AttributeValue::Exprloc(expr)) => Ok(LocListIter {
                list: None,
                single: Some(expr),
            }),
            Some(AttributeValue::SecOffset {
                class: DwClass::LoclistPtr,
                offset,
            }) => Ok(LocListIter {
                list: Some(ListCore::new(die, SectionId::DebugLoc, offset)?),
                single: None,
            }),
            Some(_) => Err(DwarfErrorKind::InvalidDwarf.into()),
            None => Ok(LocListIter {
                list: None,
                single: None,
            }),
        }
    }
}

impl<'d> FallibleIterator for LocListIter<'d> {
    type Item = LocListEntry<'d>;
    type Error = DwarfError;

    fn next(&mut self) -> Result<Option<LocListEntry<'d>>, DwarfError> {
        if let Some(expr) = self.single.take() {
            return Ok(Some(LocListEntry {
                start: Relocatable::raw(0),
                end: Relocatable::raw(u64::MAX),
                expr,
            }));
        }

        let Some(list) = self.list.as_mut() else {
            return Ok(None);
        };
        let Some((start, end)) = list.next_pair()? else {
            return Ok(None);
        };

        // Each non-terminator entry carries a 2-byte expression length
        // followed by that many bytes.
        let len = list.reader.read_u16()? as usize;
        let expr = list.reader.read_bytes(len)?;
        Ok(Some(LocListEntry { start, end, expr }))
    }
}
