//! Symbol tables and address-to-symbol resolution.

use goblin::container::{Container, Ctx};
use goblin::elf;
use goblin::strtab::Strtab;
use scroll::Pread;
use tracing::debug;

use coretrace_common::Backend;

use crate::error::{ModuleError, ModuleErrorKind};
use crate::object::ElfObject;

/// One symbol prepared for address lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    /// The symbol name.
    pub name: Box<str>,
    /// The symbol's address in file virtual addresses.
    pub value: u64,
    /// The symbol's size; zero when the producer did not record one.
    pub size: u64,
    /// Whether this is a function symbol.
    pub is_function: bool,
    /// Whether this symbol was synthesized from a function descriptor.
    pub synthetic: bool,
}

/// The lookup-ready symbol table of one module.
///
/// Built from `.symtab` when present, else from the dynamic symbol table,
/// which can be reconstructed through `PT_DYNAMIC` even when section
/// headers were stripped. On 64-bit PowerPC (ELFv1), function symbols
/// point at descriptors in `.opd`; synthetic symbols for the dereferenced
/// code entry points are added so address lookups hit real code.
#[derive(Debug, Default)]
pub struct SymbolTable {
    // Sorted by value.
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    /// Builds the table for an object.
    pub fn from_object(
        object: &ElfObject<'_>,
        backend: Option<&'static Backend>,
    ) -> Result<SymbolTable, ModuleError> {
        let elf = object.elf();

        let mut symbols = if !elf.syms.is_empty() {
            collect(elf.syms.iter(), &elf.strtab)
        } else if !elf.dynsyms.is_empty() {
            collect(elf.dynsyms.iter(), &elf.dynstrtab)
        } else {
            // Section headers may be stripped entirely; go through
            // PT_DYNAMIC.
            let (syms, strtab) = dynsyms_from_dynamic(object)?;
            collect(syms.iter(), &strtab)
        };

        if symbols.is_empty() {
            return Err(ModuleErrorKind::NoSymbols.into());
        }

        if backend.map_or(false, |backend| backend.function_descriptors) {
            synthesize_descriptor_symbols(object, &mut symbols);
        }

        dmsort::sort_by_key(&mut symbols, |symbol| symbol.value);
        debug!(count = symbols.len(), "symbol table ready");
        Ok(SymbolTable { symbols })
    }

    /// The number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// All symbols, ordered by value.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Finds the symbol covering `addr` (a file virtual address).
    ///
    /// The match is the greatest symbol with `value <= addr` whose size
    /// covers the address; a size-less symbol matches any address up to
    /// the next symbol.
    pub fn lookup(&self, addr: u64) -> Option<&Symbol> {
        let mut index = match self
            .symbols
            .binary_search_by_key(&addr, |symbol| symbol.value)
        {
            Ok(index) => index,
            Err(0) => return None,
            Err(next) => next - 1,
        };
        // The search may land anywhere in a run of equal values; move to
        // the last symbol at or below the address.
        while index + 1 < self.symbols.len() && self.symbols[index + 1].value <= addr {
            index += 1;
        }

        // Several symbols may share a value; prefer one that covers the
        // address by size, scanning left over the run of candidates.
        let mut sizeless: Option<&Symbol> = None;
        for symbol in self.symbols[..=index].iter().rev() {
            if symbol.value + symbol.size <= addr && symbol.size != 0 {
                break;
            }
            if symbol.size != 0 {
                return Some(symbol);
            }
            sizeless.get_or_insert(symbol);
        }
        sizeless
    }
}

fn collect(syms: elf::sym::SymIterator<'_>, strtab: &Strtab<'_>) -> Vec<Symbol> {
    let mut out = Vec::new();
    for sym in syms {
        // Data and function symbols both matter for address lookups;
        // skip sections, files and undefined symbols.
        let st_type = sym.st_type();
        if st_type != elf::sym::STT_FUNC && st_type != elf::sym::STT_OBJECT {
            continue;
        }
        if sym.st_shndx == elf::section_header::SHN_UNDEF as usize {
            continue;
        }
        let Some(name) = strtab.get_at(sym.st_name) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        out.push(Symbol {
            name: name.into(),
            value: sym.st_value,
            size: sym.st_size,
            is_function: st_type == elf::sym::STT_FUNC,
            synthetic: false,
        });
    }
    out
}

// Pulled from goblin's module-level parsing, which is not public: the
// dynamic symbol count has to come from the hash tables when section
// headers are absent.
fn gnu_hash_len(bytes: &[u8], offset: usize, ctx: Ctx) -> Result<usize, ModuleError> {
    let buckets_num = bytes.pread_with::<u32>(offset, ctx.le)? as usize;
    let min_chain = bytes.pread_with::<u32>(offset + 4, ctx.le)? as usize;
    let bloom_size = bytes.pread_with::<u32>(offset + 8, ctx.le)? as usize;
    if buckets_num == 0 || min_chain == 0 || bloom_size == 0 {
        return Err(ModuleErrorKind::NoSymbols.into());
    }

    // Find the highest chain index referenced by any bucket.
    let buckets_offset = offset + 16 + bloom_size * if ctx.container.is_big() { 8 } else { 4 };
    let mut max_chain = 0;
    for bucket in 0..buckets_num {
        let chain = bytes.pread_with::<u32>(buckets_offset + bucket * 4, ctx.le)? as usize;
        if max_chain < chain {
            max_chain = chain;
        }
    }
    if max_chain < min_chain {
        return Ok(0);
    }

    // Walk the last chain to its terminator.
    let mut chain_offset = buckets_offset + buckets_num * 4 + (max_chain - min_chain) * 4;
    loop {
        let hash = bytes.pread_with::<u32>(chain_offset, ctx.le)?;
        max_chain += 1;
        chain_offset += 4;
        if hash & 1 != 0 {
            return Ok(max_chain);
        }
    }
}

fn hash_len(bytes: &[u8], offset: usize, ctx: Ctx) -> Result<usize, ModuleError> {
    let nchain = bytes.pread_with::<u32>(offset.saturating_add(4), ctx.le)? as usize;
    Ok(nchain)
}

fn dynsyms_from_dynamic<'data>(
    object: &ElfObject<'data>,
) -> Result<(elf::Symtab<'data>, Strtab<'data>), ModuleError> {
    let elf = object.elf();
    let data = object.data();

    let Some(dynamic) = elf.dynamic.as_ref() else {
        return Err(ModuleErrorKind::NoSymbols.into());
    };
    let info = &dynamic.info;
    if info.symtab == 0 {
        return Err(ModuleErrorKind::NoSymbols.into());
    }

    let ctx = Ctx {
        container: if elf.is_64 {
            Container::Big
        } else {
            Container::Little
        },
        le: if elf.little_endian {
            scroll::Endian::Little
        } else {
            scroll::Endian::Big
        },
    };

    let count = if let Some(gnu_hash) = info.gnu_hash {
        gnu_hash_len(data, gnu_hash as usize, ctx)?
    } else if let Some(hash) = info.hash {
        hash_len(data, hash as usize, ctx)?
    } else {
        return Err(ModuleErrorKind::NoSymbols.into());
    };

    let syms = elf::Symtab::parse(data, info.symtab, count, ctx)
        .map_err(|err| ModuleError::new(ModuleErrorKind::NoSymbols, err))?;
    let strtab = Strtab::parse(data, info.strtab, info.strsz, 0x0)
        .map_err(|err| ModuleError::new(ModuleErrorKind::NoSymbols, err))?;

    Ok((syms, strtab))
}

/// Materializes code-entry symbols for PowerPC64 function descriptors.
///
/// An ELFv1 function symbol's value is the address of a three-word
/// descriptor in `.opd` whose first word is the real entry point. Address
/// lookups need symbols at the entry points, so a synthetic twin is added
/// for every descriptor symbol; the originals stay enumerable.
fn synthesize_descriptor_symbols(object: &ElfObject<'_>, symbols: &mut Vec<Symbol>) {
    let Some(opd) = object.section("opd") else {
        return;
    };
    let opd_start = opd.address;
    let opd_end = opd_start + opd.data.len() as u64;

    let read_word = |offset: usize| -> Option<u64> {
        let bytes = opd.data.get(offset..offset + 8)?;
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(match object.endian() {
            coretrace_dwarf::Endian::Little => u64::from_le_bytes(bytes),
            coretrace_dwarf::Endian::Big => u64::from_be_bytes(bytes),
        })
    };

    let mut synthetic = Vec::new();
    for symbol in symbols.iter() {
        if !symbol.is_function || symbol.value < opd_start || symbol.value >= opd_end {
            continue;
        }
        let Some(entry) = read_word((symbol.value - opd_start) as usize) else {
            continue;
        };
        synthetic.push(Symbol {
            name: symbol.name.clone(),
            value: entry,
            size: symbol.size,
            is_function: true,
            synthetic: true,
        });
    }

    debug!(count = synthetic.len(), "synthesized descriptor symbols");
    symbols.extend(synthetic);
}

/// The result of resolving an address to a symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    /// The module covering the address.
    pub module: String,
    /// The symbol name, if one covers the address.
    pub symbol: Option<String>,
    /// Offset from the symbol's start (or from the module base when no
    /// symbol matched).
    pub offset: u64,
    /// The file-relative address after bias subtraction.
    pub file_address: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn table(symbols: Vec<Symbol>) -> SymbolTable {
        let mut symbols = symbols;
        dmsort::sort_by_key(&mut symbols, |symbol| symbol.value);
        SymbolTable { symbols }
    }

    fn sym(name: &str, value: u64, size: u64) -> Symbol {
        Symbol {
            name: name.into(),
            value,
            size,
            is_function: true,
            synthetic: false,
        }
    }

    #[test]
    fn test_lookup_by_size() {
        let table = table(vec![sym("f1", 0x1000, 0x20), sym("f2", 0x1040, 0x20)]);

        assert_eq!(table.lookup(0x1000).unwrap().name.as_ref(), "f1");
        assert_eq!(table.lookup(0x101f).unwrap().name.as_ref(), "f1");
        // The gap between f1 and f2 belongs to neither.
        assert!(table.lookup(0x1030).is_none());
        assert_eq!(table.lookup(0x1050).unwrap().name.as_ref(), "f2");
        assert!(table.lookup(0x0fff).is_none());
        assert!(table.lookup(0x1060).is_none());
    }

    #[test]
    fn test_sizeless_symbol_covers_forward() {
        let table = table(vec![sym("_start", 0x1000, 0)]);
        assert_eq!(table.lookup(0x1234).unwrap().name.as_ref(), "_start");
    }

    #[test]
    fn test_duplicate_values_prefer_sized() {
        let table = table(vec![sym("alias", 0x1000, 0), sym("real", 0x1000, 0x10)]);
        assert_eq!(table.lookup(0x1008).unwrap().name.as_ref(), "real");
    }
}
