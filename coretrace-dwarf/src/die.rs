//! DIE cursors and the iterators over them.
//!
//! A [`Die`] is nothing but a section offset paired with its unit; no node
//! is ever materialized. Attribute and child enumeration re-derive
//! everything from the cursor, which keeps walking the tree allocation-free
//! apart from the explicit parent stacks the traversal iterators maintain.

use fallible_iterator::FallibleIterator;
use std::sync::Arc;
use tracing::warn;

use crate::abbrev::{Abbrev, AbbrevTable};
use crate::attr::{read_attribute, skip_form, Attribute, AttributeValue};
use crate::constants::*;
use crate::error::{DwarfError, DwarfErrorKind};
use crate::reader::SectionReader;
use crate::reloc::Relocatable;
use crate::session::DwarfInfo;
use crate::unit::Unit;

// Imported-unit chains deeper than this are treated as corrupt rather
// than walked forever.
const MAX_IMPORT_DEPTH: usize = 64;

/// A cursor to one debugging information entry.
#[derive(Clone, Copy)]
pub struct Die<'d> {
    info: &'d DwarfInfo<'d>,
    unit: &'d Unit,
    offset: usize,
}

impl<'d> Die<'d> {
    pub(crate) fn new(info: &'d DwarfInfo<'d>, unit: &'d Unit, offset: usize) -> Self {
        Die { info, unit, offset }
    }

    /// The absolute offset of this DIE within its section.
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    /// The unit this DIE belongs to.
    pub fn unit(&self) -> &'d Unit {
        self.unit
    }

    /// The session this DIE was read from.
    pub fn info(&self) -> &'d DwarfInfo<'d> {
        self.info
    }

    fn reader(&self) -> Result<SectionReader<'d>, DwarfError> {
        SectionReader::at(
            self.info.section_data(self.unit.section_id()),
            self.unit.encoding(self.info.endian()),
            self.offset,
        )
    }

    /// The abbreviation code of this DIE; zero marks a null entry.
    pub fn code(&self) -> Result<u64, DwarfError> {
        self.reader()?.read_uleb128()
    }

    /// Whether this is a null entry (an end-of-children sentinel).
    pub fn is_null(&self) -> Result<bool, DwarfError> {
        Ok(self.code()? == 0)
    }

    fn abbrev(&self) -> Result<Option<(Arc<AbbrevTable>, u64)>, DwarfError> {
        let code = self.code()?;
        if code == 0 {
            return Ok(None);
        }
        let table = self.info.abbrev_table(self.unit)?;
        if table.get(code).is_none() {
            return Err(DwarfErrorKind::BadAbbrev(code).into());
        }
        Ok(Some((table, code)))
    }

    fn with_abbrev<R>(
        &self,
        f: impl FnOnce(&Abbrev) -> Result<R, DwarfError>,
    ) -> Result<Option<R>, DwarfError> {
        match self.abbrev()? {
            None => Ok(None),
            Some((table, code)) => f(table.get(code).unwrap()).map(Some),
        }
    }

    /// The tag of this DIE; `None` for a null entry.
    pub fn tag(&self) -> Result<Option<u32>, DwarfError> {
        self.with_abbrev(|abbrev| Ok(abbrev.tag))
    }

    /// Whether this DIE announces children.
    pub fn has_children(&self) -> Result<bool, DwarfError> {
        Ok(self
            .with_abbrev(|abbrev| Ok(abbrev.has_children))?
            .unwrap_or(false))
    }

    /// Iterates the attributes of this DIE.
    pub fn attrs(&self) -> Result<AttrsIter<'d>, DwarfError> {
        let mut reader = self.reader()?;
        let code = reader.read_uleb128()?;
        let table = if code == 0 {
            None
        } else {
            let table = self.info.abbrev_table(self.unit)?;
            if table.get(code).is_none() {
                return Err(DwarfErrorKind::BadAbbrev(code).into());
            }
            Some(table)
        };
        Ok(AttrsIter {
            info: self.info,
            unit: self.unit,
            table,
            code,
            index: 0,
            reader,
        })
    }

    /// Finds an attribute by name.
    pub fn attr(&self, name: u32) -> Result<Option<Attribute<'d>>, DwarfError> {
        let mut attrs = self.attrs()?;
        while let Some(attr) = attrs.next()? {
            if attr.name == name {
                return Ok(Some(attr));
            }
        }
        Ok(None)
    }

    /// The value of an attribute by name.
    pub fn attr_value(&self, name: u32) -> Result<Option<AttributeValue<'d>>, DwarfError> {
        Ok(self.attr(name)?.map(|attr| attr.value))
    }

    /// The `DW_AT_name` string of this DIE.
    pub fn name(&self) -> Result<Option<&'d [u8]>, DwarfError> {
        Ok(self.attr_value(DW_AT_name)?.and_then(|v| v.as_string()))
    }

    /// The contiguous PC range of this DIE, if it has one.
    ///
    /// `DW_AT_high_pc` may be an address or, in DWARF 4, a constant offset
    /// from `DW_AT_low_pc`; either way the returned end is an address.
    pub fn pc_range(&self) -> Result<Option<(Relocatable, Relocatable)>, DwarfError> {
        let Some(low) = self.attr_value(DW_AT_low_pc)?.and_then(|v| v.as_address()) else {
            return Ok(None);
        };
        let high = match self.attr_value(DW_AT_high_pc)? {
            Some(AttributeValue::Address(addr)) => addr,
            Some(value) => match value.as_udata() {
                Some(size) => Relocatable {
                    value: low.value.wrapping_add(size),
                    symbol: low.symbol,
                    relocated: low.relocated,
                },
                None => return Err(DwarfErrorKind::InvalidDwarf.into()),
            },
            None => return Ok(None),
        };
        Ok(Some((low, high)))
    }

    /// Iterates the children of this DIE.
    pub fn children(&self) -> Result<ChildrenIter<'d>, DwarfError> {
        let next = if self.has_children()? {
            Some(Die::new(self.info, self.unit, self.after_attrs()?))
        } else {
            None
        };
        Ok(ChildrenIter { next })
    }

    /// The offset directly after this DIE's code and attribute bytes.
    fn after_attrs(&self) -> Result<usize, DwarfError> {
        let mut reader = self.reader()?;
        let code = reader.read_uleb128()?;
        if code == 0 {
            return Ok(reader.pos());
        }
        let table = self.info.abbrev_table(self.unit)?;
        let abbrev = table
            .get(code)
            .ok_or(DwarfErrorKind::BadAbbrev(code))?;
        for spec in &abbrev.attrs {
            skip_form(&mut reader, self.unit, spec.form)?;
        }
        Ok(reader.pos())
    }

    /// The offset directly after this DIE's whole subtree.
    ///
    /// Uses a `DW_AT_sibling` shortcut where one is present; otherwise
    /// walks the level structure with an explicit depth counter.
    fn after_subtree(&self) -> Result<usize, DwarfError> {
        let table = self.info.abbrev_table(self.unit)?;
        let mut reader = self.reader()?;
        let mut depth = 0usize;

        loop {
            if reader.pos() as u64 >= self.unit.end_offset {
                return Err(DwarfErrorKind::Truncated.into());
            }

            let die_offset = reader.pos();
            let code = reader.read_uleb128()?;
            if code == 0 {
                if depth == 0 {
                    // A null entry where a DIE was expected; nothing to
                    // skip past.
                    return Ok(reader.pos());
                }
                depth -= 1;
                if depth == 0 {
                    return Ok(reader.pos());
                }
                continue;
            }

            let abbrev = table
                .get(code)
                .ok_or(DwarfErrorKind::BadAbbrev(code))?;

            let mut sibling = None;
            for spec in &abbrev.attrs {
                if spec.attr == DW_AT_sibling && abbrev.has_children {
                    let die = Die::new(self.info, self.unit, die_offset);
                    if let Some(AttributeValue::UnitRef(target)) =
                        die.attr_value(DW_AT_sibling)?
                    {
                        if target as usize > die_offset {
                            sibling = Some(target as usize);
                        }
                    }
                    // Whether or not the shortcut worked, the attribute
                    // walk below still advances the reader.
                }
                skip_form(&mut reader, self.unit, spec.form)?;
            }

            if let Some(target) = sibling {
                reader.set_pos(target)?;
                if depth == 0 {
                    return Ok(target);
                }
                continue;
            }

            if abbrev.has_children {
                depth += 1;
            } else if depth == 0 {
                return Ok(reader.pos());
            }
        }
    }
}

impl std::fmt::Debug for Die<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Die")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("unit", &format_args!("{:#x}", self.unit.offset))
            .field("tag", &self.tag().unwrap_or(None))
            .finish()
    }
}

/// Iterator over the attributes of one DIE.
pub struct AttrsIter<'d> {
    info: &'d DwarfInfo<'d>,
    unit: &'d Unit,
    table: Option<Arc<AbbrevTable>>,
    code: u64,
    index: usize,
    reader: SectionReader<'d>,
}

impl<'d> FallibleIterator for AttrsIter<'d> {
    type Item = Attribute<'d>;
    type Error = DwarfError;

    fn next(&mut self) -> Result<Option<Attribute<'d>>, DwarfError> {
        let Some(table) = self.table.as_ref() else {
            return Ok(None);
        };
        // The code was validated when the iterator was constructed.
        let abbrev = table.get(self.code).unwrap();
        let Some(&spec) = abbrev.attrs.get(self.index) else {
            return Ok(None);
        };
        self.index += 1;
        read_attribute(self.info, self.unit, &mut self.reader, spec).map(Some)
    }
}

/// Iterator over the children of one DIE, ending at the null sentinel.
pub struct ChildrenIter<'d> {
    next: Option<Die<'d>>,
}

impl<'d> FallibleIterator for ChildrenIter<'d> {
    type Item = Die<'d>;
    type Error = DwarfError;

    fn next(&mut self) -> Result<Option<Die<'d>>, DwarfError> {
        let Some(die) = self.next.take() else {
            return Ok(None);
        };
        if die.is_null()? {
            return Ok(None);
        }
        let following = die.after_subtree()?;
        if (following as u64) < die.unit.end_offset {
            self.next = Some(Die::new(die.info, die.unit, following));
        }
        Ok(Some(die))
    }
}

/// Pre-order iterator over every DIE of one or more units.
///
/// The traversal is linear over the flat encoding and keeps an explicit
/// stack of parent offsets, so arbitrarily deep trees never touch the call
/// stack. A unit whose abbreviation table is corrupt is skipped with a
/// warning; the remaining units stay usable.
pub struct DieTreeIter<'d> {
    info: &'d DwarfInfo<'d>,
    units: &'d [Unit],
    unit_index: usize,
    unit_end: usize,
    pos: usize,
    parents: Vec<usize>,
}

impl<'d> DieTreeIter<'d> {
    /// Iterates all units of the session.
    pub fn all(info: &'d DwarfInfo<'d>) -> Result<Self, DwarfError> {
        let units = info.unit_headers()?;
        Ok(Self::over(info, units, 0, units.len()))
    }

    /// Iterates a single unit.
    pub(crate) fn single(info: &'d DwarfInfo<'d>, unit_index: usize) -> Result<Self, DwarfError> {
        let units = info.unit_headers()?;
        Ok(Self::over(info, units, unit_index, unit_index + 1))
    }

    fn over(info: &'d DwarfInfo<'d>, units: &'d [Unit], start: usize, end: usize) -> Self {
        let pos = units
            .get(start)
            .map(|unit| unit.die_offset as usize)
            .unwrap_or(0);
        DieTreeIter {
            info,
            units,
            unit_index: start,
            unit_end: end,
            pos,
            parents: Vec::new(),
        }
    }

    /// The nesting depth of the most recently yielded DIE.
    pub fn depth(&self) -> usize {
        self.parents.len()
    }

    fn enter_next_unit(&mut self) {
        self.unit_index += 1;
        self.parents.clear();
        if let Some(unit) = self.units.get(self.unit_index) {
            self.pos = unit.die_offset as usize;
        }
    }
}

impl<'d> FallibleIterator for DieTreeIter<'d> {
    type Item = Die<'d>;
    type Error = DwarfError;

    fn next(&mut self) -> Result<Option<Die<'d>>, DwarfError> {
        loop {
            if self.unit_index >= self.unit_end {
                return Ok(None);
            }
            let unit = &self.units[self.unit_index];

            if self.pos as u64 >= unit.end_offset {
                self.enter_next_unit();
                continue;
            }

            let die = Die::new(self.info, unit, self.pos);

            let code = match die.code() {
                Ok(code) => code,
                Err(err) => {
                    warn!(unit = unit.offset, error = %err, "skipping unreadable unit");
                    self.enter_next_unit();
                    continue;
                }
            };

            if code == 0 {
                // End-of-children sentinel: resume at the parent's next
                // sibling, which in the flat encoding is simply the next
                // entry.
                self.parents.pop();
                self.pos += 1;
                continue;
            }

            // Position the cursor for the next call before yielding.
            match die.has_children() {
                Ok(has_children) => {
                    let after = match die.after_attrs() {
                        Ok(after) => after,
                        Err(err) => {
                            warn!(unit = unit.offset, error = %err, "skipping corrupt unit");
                            self.enter_next_unit();
                            continue;
                        }
                    };
                    if has_children {
                        self.parents.push(self.pos);
                    }
                    self.pos = after;
                }
                Err(err) => {
                    // Typically a corrupt abbreviation table; skip the
                    // whole unit and keep the rest usable.
                    warn!(unit = unit.offset, error = %err, "skipping corrupt unit");
                    self.enter_next_unit();
                    continue;
                }
            }

            return Ok(Some(die));
        }
    }
}

/// Pre-order iterator that follows `DW_TAG_imported_unit` references.
///
/// When an imported-unit DIE with a resolvable `DW_AT_import` is reached,
/// neither the importing DIE nor the imported unit's root is yielded;
/// instead the root's children are walked in place, after which the
/// traversal resumes behind the import. The descent uses an explicit stack
/// of per-unit iterators.
pub struct LogicalDieTreeIter<'d> {
    info: &'d DwarfInfo<'d>,
    stack: Vec<DieTreeIter<'d>>,
}

impl<'d> LogicalDieTreeIter<'d> {
    pub(crate) fn new(info: &'d DwarfInfo<'d>) -> Result<Self, DwarfError> {
        Ok(LogicalDieTreeIter {
            info,
            stack: vec![DieTreeIter::all(info)?],
        })
    }

    fn descend(&mut self, target: u64) -> Result<bool, DwarfError> {
        let units = self.info.unit_headers()?;
        let Some(unit_index) = units
            .iter()
            .position(|unit| !unit.is_types && unit.offset <= target && target < unit.end_offset)
        else {
            return Ok(false);
        };

        if self.stack.len() >= MAX_IMPORT_DEPTH {
            return Err(DwarfErrorKind::InvalidDwarf.into());
        }

        let mut sub = DieTreeIter::single(self.info, unit_index)?;
        // Consume the imported unit's root; its children are walked in
        // place of the import.
        sub.next()?;
        self.stack.push(sub);
        Ok(true)
    }
}

impl<'d> FallibleIterator for LogicalDieTreeIter<'d> {
    type Item = Die<'d>;
    type Error = DwarfError;

    fn next(&mut self) -> Result<Option<Die<'d>>, DwarfError> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };

            let Some(die) = top.next()? else {
                self.stack.pop();
                continue;
            };

            if die.tag()? == Some(DW_TAG_imported_unit) {
                let target = match die.attr_value(DW_AT_import)? {
                    Some(AttributeValue::GlobalRef(offset))
                    | Some(AttributeValue::UnitRef(offset)) => Some(offset),
                    _ => None,
                };
                if let Some(target) = target {
                    if self.descend(target)? {
                        continue;
                    }
                }
            }

            return Ok(Some(die));
        }
    }
}
