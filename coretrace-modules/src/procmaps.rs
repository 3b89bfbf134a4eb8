//! Parsing of `/proc/<pid>/maps`.

use nom::bytes::complete::take_while1;
use nom::character::complete::{char, hex_digit1, space1};
use nom::combinator::{map_res, opt, rest};
use nom::sequence::{separated_pair, tuple};
use nom::IResult;

use crate::error::{ModuleError, ModuleErrorKind};

/// One line of a process memory map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    /// Start of the mapping.
    pub start: u64,
    /// One past the end of the mapping.
    pub end: u64,
    /// Whether the mapping is readable.
    pub read: bool,
    /// Whether the mapping is writable.
    pub write: bool,
    /// Whether the mapping is executable.
    pub exec: bool,
    /// Whether the mapping is private (copy-on-write).
    pub private: bool,
    /// Offset into the backing file.
    pub offset: u64,
    /// Device of the backing file.
    pub device: (u32, u32),
    /// Inode of the backing file, zero for anonymous mappings.
    pub inode: u64,
    /// The backing path, if the mapping is file-backed.
    pub path: Option<String>,
}

/// The merged mappings of one file: a module candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleMap {
    /// The backing path.
    pub path: String,
    /// Lowest mapped address.
    pub low: u64,
    /// Highest mapped address (exclusive).
    pub high: u64,
    /// The address the file's offset zero corresponds to.
    pub base: u64,
}

fn hex_u64(input: &str) -> IResult<&str, u64> {
    map_res(hex_digit1, |digits| u64::from_str_radix(digits, 16))(input)
}

fn hex_u32(input: &str) -> IResult<&str, u32> {
    map_res(hex_digit1, |digits| u32::from_str_radix(digits, 16))(input)
}

fn dec_u64(input: &str) -> IResult<&str, u64> {
    map_res(take_while1(|c: char| c.is_ascii_digit()), str::parse)(input)
}

fn perms(input: &str) -> IResult<&str, (bool, bool, bool, bool)> {
    let (input, flags) = take_while1(|c: char| "rwxps-".contains(c))(input)?;
    Ok((
        input,
        (
            flags.contains('r'),
            flags.contains('w'),
            flags.contains('x'),
            flags.contains('p'),
        ),
    ))
}

fn map_line(input: &str) -> IResult<&str, MapEntry> {
    let (input, ((start, end), _, perms, _, offset, _, device, _, inode, path)) =
        tuple((
            separated_pair(hex_u64, char('-'), hex_u64),
            space1,
            perms,
            space1,
            hex_u64,
            space1,
            separated_pair(hex_u32, char(':'), hex_u32),
            space1,
            dec_u64,
            opt(tuple((space1, rest))),
        ))(input)?;

    let path = path
        .map(|(_, name)| name.trim())
        .filter(|name: &&str| !name.is_empty())
        .map(str::to_owned);

    Ok((
        input,
        MapEntry {
            start,
            end,
            read: perms.0,
            write: perms.1,
            exec: perms.2,
            private: perms.3,
            offset,
            device,
            inode,
            path,
        },
    ))
}

impl MapEntry {
    /// Parses one `/proc/<pid>/maps` line.
    pub fn parse(line: &str) -> Result<MapEntry, ModuleError> {
        match map_line(line) {
            Ok((_, entry)) => Ok(entry),
            Err(err) => Err(ModuleError::new(ModuleErrorKind::BadMaps, format!("{err}"))),
        }
    }

    /// Parses a whole maps file.
    pub fn parse_all(contents: &str) -> Result<Vec<MapEntry>, ModuleError> {
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(MapEntry::parse)
            .collect()
    }

    /// Whether this mapping belongs to a real file.
    pub fn is_file_backed(&self) -> bool {
        self.inode != 0
            && self
                .path
                .as_deref()
                .map_or(false, |path| path.starts_with('/'))
    }
}

/// Merges per-file mappings into module candidates.
///
/// Consecutive mappings sharing a pathname are folded into one address
/// span; special mappings (`[heap]`, anonymous, deleted pseudo-entries)
/// are dropped.
pub fn merge_maps(entries: &[MapEntry]) -> Vec<ModuleMap> {
    let mut modules: Vec<ModuleMap> = Vec::new();

    for entry in entries {
        if !entry.is_file_backed() {
            continue;
        }
        let path = entry.path.as_deref().unwrap();

        if let Some(last) = modules.last_mut() {
            if last.path == path && last.high <= entry.start {
                last.high = entry.end;
                if entry.offset == 0 {
                    last.base = last.base.min(entry.start);
                }
                continue;
            }
        }

        modules.push(ModuleMap {
            path: path.to_owned(),
            low: entry.start,
            high: entry.end,
            base: entry.start.wrapping_sub(entry.offset),
        });
    }

    modules
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    const SAMPLE: &str = "\
55d4247a1000-55d4247a3000 r--p 00000000 103:02 1573813    /usr/bin/cat
55d4247a3000-55d4247a8000 r-xp 00002000 103:02 1573813    /usr/bin/cat
55d4247a8000-55d4247ab000 r--p 00007000 103:02 1573813    /usr/bin/cat
55d42579c000-55d4257bd000 rw-p 00000000 00:00 0           [heap]
7f21bd051000-7f21bd079000 r--p 00000000 103:02 1595106    /usr/lib/libc.so.6
7f21bd079000-7f21bd1f0000 r-xp 00028000 103:02 1595106    /usr/lib/libc.so.6
7ffdb2a04000-7ffdb2a25000 rw-p 00000000 00:00 0           [stack]
";

    #[test]
    fn test_parse_line() {
        let entry =
            MapEntry::parse("55d4247a3000-55d4247a8000 r-xp 00002000 103:02 1573813    /usr/bin/cat")
                .unwrap();
        assert_eq!(entry.start, 0x55d4_247a_3000);
        assert_eq!(entry.end, 0x55d4_247a_8000);
        assert!(entry.read);
        assert!(!entry.write);
        assert!(entry.exec);
        assert!(entry.private);
        assert_eq!(entry.offset, 0x2000);
        assert_eq!(entry.device, (0x103, 0x02));
        assert_eq!(entry.inode, 1_573_813);
        assert_eq!(entry.path.as_deref(), Some("/usr/bin/cat"));
    }

    #[test]
    fn test_parse_anonymous_line() {
        let entry = MapEntry::parse("7ffdb2a04000-7ffdb2a25000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(entry.path, None);
        assert!(!entry.is_file_backed());
    }

    #[test]
    fn test_merge() {
        let entries = MapEntry::parse_all(SAMPLE).unwrap();
        let modules = merge_maps(&entries);

        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].path, "/usr/bin/cat");
        assert_eq!(modules[0].low, 0x55d4_247a_1000);
        assert_eq!(modules[0].high, 0x55d4_247a_b000);
        assert_eq!(modules[0].base, 0x55d4_247a_1000);

        assert_eq!(modules[1].path, "/usr/lib/libc.so.6");
        assert_eq!(modules[1].base, 0x7f21_bd05_1000);
    }

    #[test]
    fn test_pseudo_entries_are_skipped() {
        let entries = MapEntry::parse_all(SAMPLE).unwrap();
        assert!(entries.iter().any(|entry| entry.path.as_deref() == Some("[heap]")));
        let modules = merge_maps(&entries);
        assert!(modules.iter().all(|module| module.path.starts_with('/')));
    }
}
