//! The per-file DWARF session tying sections, caches and tables together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, warn};

use coretrace_common::Backend;

use crate::abbrev::AbbrevTable;
use crate::die::{Die, DieTreeIter, LogicalDieTreeIter};
use crate::error::{DwarfError, DwarfErrorKind};
use crate::line::LineTable;
use crate::reader::{Encoding, Endian, SectionReader};
use crate::reloc::{RawReloc, RelocMap, RelocSymbol};
use crate::section::{DwarfSection, SectionId};
use crate::unit::{Unit, UnitsIter};
use crate::version::VersionTable;

static NO_RELOCS: Lazy<RelocMap> = Lazy::new(RelocMap::empty);

/// Provides the raw inputs for a [`DwarfInfo`] session.
///
/// Implemented by the object-file layer; the session itself never touches
/// the ELF container. Sections are requested by [`SectionId`] and should
/// come back decompressed. Relocation inputs are only meaningful for
/// unlinked objects and default to none.
pub trait DwarfSource<'data> {
    /// The byte order of the object file.
    fn endian(&self) -> Endian;

    /// The address size of the object file (4 or 8).
    fn address_size(&self) -> u8;

    /// Returns the named debug section, if present.
    fn section(&self, id: SectionId) -> Option<DwarfSection<'data>>;

    /// Returns the relocations targeting the named debug section along
    /// with the symbol data needed to digest them.
    fn relocations(&self, id: SectionId) -> Option<(Vec<RawReloc>, Vec<RelocSymbol>)> {
        let _ = id;
        None
    }
}

/// Options for a DWARF session.
#[derive(Clone, Copy, Debug, Default)]
pub struct DwarfOpts {
    /// Refuse vendor-extension attributes and forms, and any form usage
    /// outside the unit's own DWARF version.
    pub strict: bool,
}

struct LoadedSection<'data> {
    section: DwarfSection<'data>,
    reloc_input: Option<(Vec<RawReloc>, Vec<RelocSymbol>)>,
    relocs: OnceCell<Result<RelocMap, DwarfErrorKind>>,
}

/// One object file's DWARF data.
///
/// The session owns the section views (decompressed where needed), the
/// digested relocation tables, and the lazy per-unit caches. All query
/// methods take `&self`; the caches are internally synchronized so a
/// session can be shared read-only across threads once constructed.
pub struct DwarfInfo<'data> {
    endian: Endian,
    address_size: u8,
    opts: DwarfOpts,
    backend: Option<&'static Backend>,
    sections: [Option<LoadedSection<'data>>; SectionId::COUNT],
    units: OnceCell<Result<Vec<Unit>, DwarfErrorKind>>,
    abbrevs: Mutex<HashMap<u64, Result<Arc<AbbrevTable>, DwarfErrorKind>>>,
    line_tables: Mutex<HashMap<u64, Result<Arc<LineTable>, DwarfErrorKind>>>,
}

impl<'data> DwarfInfo<'data> {
    /// Creates a session from a source, loading all present debug
    /// sections.
    pub fn parse<S: DwarfSource<'data>>(
        source: &S,
        backend: Option<&'static Backend>,
        opts: DwarfOpts,
    ) -> Self {
        let mut sections: [Option<LoadedSection<'data>>; SectionId::COUNT] =
            std::array::from_fn(|_| None);
        for id in SectionId::ALL {
            if let Some(section) = source.section(id) {
                let reloc_input = source.relocations(id);
                sections[id as usize] = Some(LoadedSection {
                    section,
                    reloc_input,
                    relocs: OnceCell::new(),
                });
            }
        }

        DwarfInfo {
            endian: source.endian(),
            address_size: source.address_size(),
            opts,
            backend,
            sections,
            units: OnceCell::new(),
            abbrevs: Mutex::new(HashMap::new()),
            line_tables: Mutex::new(HashMap::new()),
        }
    }

    /// The byte order of the underlying file.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The address size of the underlying file.
    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    /// The session options.
    pub fn opts(&self) -> DwarfOpts {
        self.opts
    }

    /// The architecture backend, when one exists for the file.
    pub fn backend(&self) -> Option<&'static Backend> {
        self.backend
    }

    /// The version table for a unit, honoring the strict option.
    pub fn version_table(&self, unit: &Unit) -> Result<&'static VersionTable, DwarfError> {
        VersionTable::get(unit.version)
            .ok_or_else(|| DwarfErrorKind::UnsupportedVersion(unit.version).into())
    }

    /// Returns a loaded section.
    pub fn section(&self, id: SectionId) -> Option<&DwarfSection<'data>> {
        self.sections[id as usize]
            .as_ref()
            .map(|loaded| &loaded.section)
    }

    /// Returns the data of a loaded section, or an empty slice if absent.
    pub fn section_data(&self, id: SectionId) -> &[u8] {
        self.section(id).map_or(&[], |section| &section.data)
    }

    /// The digested relocation map of a section.
    ///
    /// Digestion happens on first use and its outcome, success or failure,
    /// is memoized. Sections without relocations share one empty map.
    pub fn reloc_map(&self, id: SectionId) -> Result<&RelocMap, DwarfError> {
        let Some(loaded) = self.sections[id as usize].as_ref() else {
            return Ok(&NO_RELOCS);
        };
        let Some((relocs, symbols)) = loaded.reloc_input.as_ref() else {
            return Ok(&NO_RELOCS);
        };
        let Some(backend) = self.backend else {
            // Relocations exist but no backend can classify them.
            return Err(DwarfErrorKind::RelBadType(0).into());
        };

        let result = loaded.relocs.get_or_init(|| {
            debug!(section = %id, count = relocs.len(), "digesting debug relocations");
            RelocMap::digest(backend, loaded.section.data.len(), relocs, symbols)
                .map_err(|err| err.kind())
        });

        match result {
            Ok(map) => Ok(map),
            Err(kind) => Err((*kind).into()),
        }
    }

    /// The unit headers of this file, `.debug_info` before `.debug_types`.
    ///
    /// Decoded once on first call. A zero-length or absent `.debug_info`
    /// yields an empty list.
    pub fn unit_headers(&self) -> Result<&[Unit], DwarfError> {
        let result = self.units.get_or_init(|| {
            let mut units = Vec::new();
            Unit::parse_all(
                self.section_data(SectionId::DebugInfo),
                self.endian,
                false,
                &mut units,
            )
            .map_err(|err| err.kind())?;
            Unit::parse_all(
                self.section_data(SectionId::DebugTypes),
                self.endian,
                true,
                &mut units,
            )
            .map_err(|err| err.kind())?;
            debug!(units = units.len(), "enumerated compilation units");
            Ok(units)
        });

        match result {
            Ok(units) => Ok(units),
            Err(kind) => Err((*kind).into()),
        }
    }

    /// Iterates over all units, yielding each unit and its root DIE.
    pub fn units(&self) -> Result<UnitsIter<'_>, DwarfError> {
        Ok(UnitsIter::new(self.as_self(), self.unit_headers()?))
    }

    /// Finds the unit containing the absolute section offset.
    pub fn unit_at(&self, offset: u64, types: bool) -> Result<Option<&Unit>, DwarfError> {
        Ok(self
            .unit_headers()?
            .iter()
            .find(|unit| unit.is_types == types && unit.offset <= offset && offset < unit.end_offset))
    }

    /// The abbreviation table of a unit, decoded lazily and memoized by
    /// its `.debug_abbrev` offset, failures included.
    pub fn abbrev_table(&self, unit: &Unit) -> Result<Arc<AbbrevTable>, DwarfError> {
        let mut cache = self.abbrevs.lock().unwrap();
        let entry = cache.entry(unit.abbrev_offset).or_insert_with(|| {
            let data = self.section_data(SectionId::DebugAbbrev);
            SectionReader::at(data, Encoding::new(self.endian, unit.address_size), unit.abbrev_offset as usize)
                .and_then(AbbrevTable::parse)
                .map(Arc::new)
                .map_err(|err| {
                    warn!(
                        offset = unit.abbrev_offset,
                        error = %err,
                        "skipping corrupt abbreviation table"
                    );
                    err.kind()
                })
        });
        match entry {
            Ok(table) => Ok(Arc::clone(table)),
            Err(kind) => Err((*kind).into()),
        }
    }

    /// The decoded line table at the given `.debug_line` offset.
    pub fn line_table(&self, unit: &Unit, offset: u64) -> Result<Arc<LineTable>, DwarfError> {
        let mut cache = self.line_tables.lock().unwrap();
        let entry = cache.entry(offset).or_insert_with(|| {
            LineTable::parse(self, unit, offset)
                .map(Arc::new)
                .map_err(|err| err.kind())
        });
        match entry {
            Ok(table) => Ok(Arc::clone(table)),
            Err(kind) => Err((*kind).into()),
        }
    }

    /// Reads the string at `offset` in `.debug_str`, bounds-checked.
    pub fn string(&self, offset: u64) -> Result<&[u8], DwarfError> {
        let data = self.section_data(SectionId::DebugStr);
        let mut reader =
            SectionReader::at(data, Encoding::new(self.endian, self.address_size), offset as usize)?;
        reader.read_cstr()
    }

    /// Pre-order iterator over every DIE of every unit.
    pub fn die_tree(&self) -> Result<DieTreeIter<'_>, DwarfError> {
        DieTreeIter::all(self.as_self())
    }

    /// Pre-order iterator that descends through `DW_TAG_imported_unit`.
    pub fn logical_die_tree(&self) -> Result<LogicalDieTreeIter<'_>, DwarfError> {
        LogicalDieTreeIter::new(self.as_self())
    }

    /// The root DIE of a unit.
    pub fn root_die<'a>(&'a self, unit: &'a Unit) -> Die<'a> {
        Die::new(self.as_self(), unit, unit.die_offset as usize)
    }

    // Covariance helper: every borrow of the session hands out data with
    // the borrow's own lifetime, never 'data.
    fn as_self<'a>(&'a self) -> &'a DwarfInfo<'a>
    where
        'data: 'a,
    {
        self
    }
}

impl<'slf> coretrace_common::AsSelf<'slf> for DwarfInfo<'_> {
    type Ref = DwarfInfo<'slf>;

    fn as_self(&'slf self) -> &Self::Ref {
        self
    }
}

impl std::fmt::Debug for DwarfInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DwarfInfo")
            .field("endian", &self.endian)
            .field("address_size", &self.address_size)
            .field(
                "sections",
                &SectionId::ALL
                    .iter()
                    .filter(|&&id| self.section(id).is_some())
                    .map(|id| id.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
