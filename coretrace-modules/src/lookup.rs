//! Locating backing files: build-ID directories, debuglink search, and
//! the caller-pluggable lookup callbacks.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use coretrace_common::ByteView;

use crate::object::ElfObject;

/// The default debuginfo path: next to the main file, then the
/// system-wide debug directory.
pub const DEFAULT_DEBUGINFO_PATH: &str = ":/usr/lib/debug";

/// An opaque build identifier from an `NT_GNU_BUILD_ID` note.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BuildId {
    bytes: Vec<u8>,
    /// The runtime address the note was found at, when it came from
    /// mapped memory rather than a file.
    pub vaddr: Option<u64>,
}

impl BuildId {
    /// Wraps raw note description bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        BuildId {
            bytes: bytes.into(),
            vaddr: None,
        }
    }

    /// The raw bytes (20 for the usual SHA-1 flavor).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Renders the id as lowercase hex.
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

impl fmt::Debug for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuildId({})", self.to_hex())
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One entry of the debuginfo search path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebuginfoDir {
    /// The directory; empty means "the directory of the main file".
    pub dir: PathBuf,
    /// Whether subdirectories are searched too (the `+` prefix).
    pub recurse: bool,
}

/// A parsed, colon-separated debuginfo search path.
///
/// Each element may be prefixed with `+` (descend into subdirectories) or
/// `-` (do not); an empty element stands for the main file's own
/// directory. The default is `":/usr/lib/debug"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebuginfoPath {
    /// The entries, in search order.
    pub dirs: Vec<DebuginfoDir>,
}

impl DebuginfoPath {
    /// Parses a colon-separated path specification.
    pub fn parse(spec: &str) -> Self {
        let dirs = spec
            .split(':')
            .map(|element| {
                let (recurse, rest) = match element.as_bytes().first() {
                    Some(b'+') => (true, &element[1..]),
                    Some(b'-') => (false, &element[1..]),
                    _ => (false, element),
                };
                DebuginfoDir {
                    dir: PathBuf::from(rest),
                    recurse,
                }
            })
            .collect();
        DebuginfoPath { dirs }
    }

    /// The path from the `CORETRACE_DEBUGINFO_PATH` environment variable,
    /// or the built-in default.
    pub fn from_env() -> Self {
        match std::env::var("CORETRACE_DEBUGINFO_PATH") {
            Ok(spec) => Self::parse(&spec),
            Err(_) => Self::default(),
        }
    }
}

impl Default for DebuginfoPath {
    fn default() -> Self {
        Self::parse(DEFAULT_DEBUGINFO_PATH)
    }
}

/// Locates backing files for modules.
///
/// The registry calls through this trait whenever it needs a file it does
/// not already have: the main ELF of a module reconstructed from a core
/// dump, or the separate debug file of a stripped module. The default
/// implementation searches the debuginfo path; callers with other sources
/// (a debuginfo server client, a sysroot) substitute their own.
pub trait FileLookup: Send + Sync {
    /// Finds the main object file for a module observed under `name`.
    fn find_elf(&self, name: &str, build_id: Option<&BuildId>) -> Option<PathBuf>;

    /// Finds separate debug information for a module.
    fn find_debuginfo(
        &self,
        main_path: Option<&Path>,
        build_id: Option<&BuildId>,
        debug_link: Option<(&[u8], u32)>,
    ) -> Option<PathBuf>;
}

/// The built-in lookup over a [`DebuginfoPath`].
#[derive(Clone, Debug, Default)]
pub struct DefaultLookup {
    /// The search path for separate debug files.
    pub path: DebuginfoPath,
}

impl DefaultLookup {
    /// Creates a lookup with the given search path.
    pub fn new(path: DebuginfoPath) -> Self {
        DefaultLookup { path }
    }

    /// Builds the `.build-id/xx/yyyy…` file name for an id.
    fn build_id_filename(build_id: &BuildId, suffix: &str) -> Option<PathBuf> {
        let bytes = build_id.bytes();
        if bytes.len() < 2 {
            return None;
        }
        let mut name = PathBuf::from(".build-id");
        name.push(format!("{:02x}", bytes[0]));
        let rest: String = bytes[1..].iter().map(|byte| format!("{byte:02x}")).collect();
        name.push(format!("{rest}{suffix}"));
        Some(name)
    }

    /// Checks that a candidate file really carries the wanted build id.
    fn verify_build_id(path: &Path, build_id: &BuildId) -> bool {
        let Ok(view) = ByteView::open(path) else {
            return false;
        };
        let Ok(object) = ElfObject::parse(&view) else {
            return false;
        };
        match object.build_id() {
            Some(found) => found == build_id.bytes(),
            None => false,
        }
    }

    /// Checks a debuglink candidate's checksum.
    fn verify_debug_link(path: &Path, crc: u32) -> bool {
        let Ok(view) = ByteView::open(path) else {
            return false;
        };
        crc32fast::hash(&view) == crc
    }

    /// Resolves one path entry to its base directory; an empty element
    /// stands for the main file's own directory.
    fn entry_base(entry: &DebuginfoDir, main_dir: Option<&Path>) -> Option<PathBuf> {
        if entry.dir.as_os_str().is_empty() {
            main_dir.map(Path::to_path_buf)
        } else {
            Some(entry.dir.clone())
        }
    }

    /// Walks a directory tree, yielding the base itself and every
    /// directory below it.
    fn subdirs(base: &Path) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(base)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .map(walkdir::DirEntry::into_path)
    }

    /// Expands the search path into concrete directories.
    ///
    /// A `+`-prefixed entry contributes itself and all of its
    /// subdirectories; a plain or `-` entry contributes only itself.
    fn search_dirs(&self, main_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for entry in &self.path.dirs {
            let Some(base) = Self::entry_base(entry, main_dir) else {
                continue;
            };
            if entry.recurse {
                dirs.extend(Self::subdirs(&base));
            } else {
                dirs.push(base);
            }
        }
        dirs
    }

    fn find_by_build_id(&self, build_id: &BuildId, main_dir: Option<&Path>) -> Option<PathBuf> {
        let dirs = self.search_dirs(main_dir);
        for suffix in ["", ".debug"] {
            let Some(name) = Self::build_id_filename(build_id, suffix) else {
                continue;
            };
            for dir in &dirs {
                let candidate = dir.join(&name);
                trace!(candidate = %candidate.display(), "trying build-id path");
                if !candidate.is_file() {
                    continue;
                }
                if !Self::verify_build_id(&candidate, build_id) {
                    debug!(candidate = %candidate.display(), "build id mismatch");
                    continue;
                }
                return fs::canonicalize(&candidate).ok().or(Some(candidate));
            }
        }
        None
    }

    fn find_by_debug_link(
        &self,
        main_path: Option<&Path>,
        filename: &[u8],
        crc: u32,
    ) -> Option<PathBuf> {
        let name = std::str::from_utf8(filename).ok()?;
        let main_dir = main_path.and_then(Path::parent);

        // The classic gdb order: next to the file, in a .debug
        // subdirectory, then under each debuginfo directory with the main
        // file's directory appended. Recursive entries additionally try
        // the name in every subdirectory of their tree.
        let mut candidates = Vec::new();
        if let Some(dir) = main_dir {
            candidates.push(dir.join(name));
            candidates.push(dir.join(".debug").join(name));
        }
        for entry in &self.path.dirs {
            let Some(base) = Self::entry_base(entry, main_dir) else {
                continue;
            };
            if !entry.dir.as_os_str().is_empty() {
                match main_dir {
                    Some(dir) => {
                        let relative = dir.strip_prefix("/").unwrap_or(dir);
                        candidates.push(entry.dir.join(relative).join(name));
                    }
                    None => candidates.push(entry.dir.join(name)),
                }
            }
            if entry.recurse {
                candidates.extend(Self::subdirs(&base).map(|dir| dir.join(name)));
            }
        }

        for candidate in candidates {
            trace!(candidate = %candidate.display(), "trying debuglink path");
            if candidate.is_file() && Self::verify_debug_link(&candidate, crc) {
                return fs::canonicalize(&candidate).ok().or(Some(candidate));
            }
        }
        None
    }
}

impl FileLookup for DefaultLookup {
    fn find_elf(&self, name: &str, build_id: Option<&BuildId>) -> Option<PathBuf> {
        // A module name that resolves on disk wins; otherwise fall back
        // to the build-id tree.
        let path = Path::new(name);
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        build_id.and_then(|id| self.find_by_build_id(id, None))
    }

    fn find_debuginfo(
        &self,
        main_path: Option<&Path>,
        build_id: Option<&BuildId>,
        debug_link: Option<(&[u8], u32)>,
    ) -> Option<PathBuf> {
        let main_dir = main_path.and_then(Path::parent);

        if let Some(id) = build_id {
            if let Some(found) = self.find_by_build_id(id, main_dir) {
                return Some(found);
            }
        }
        if let Some((filename, crc)) = debug_link {
            return self.find_by_debug_link(main_path, filename, crc);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;
    use std::io::Write;

    #[test]
    fn test_parse_path_spec() {
        let path = DebuginfoPath::parse("+/srv/debug:-/opt/debug:/usr/lib/debug");
        assert_eq!(path.dirs.len(), 3);
        assert!(path.dirs[0].recurse);
        assert_eq!(path.dirs[0].dir, PathBuf::from("/srv/debug"));
        assert!(!path.dirs[1].recurse);
        assert!(!path.dirs[2].recurse);
    }

    #[test]
    fn test_default_path() {
        let path = DebuginfoPath::default();
        assert_eq!(path.dirs.len(), 2);
        assert!(path.dirs[0].dir.as_os_str().is_empty());
        assert_eq!(path.dirs[1].dir, PathBuf::from("/usr/lib/debug"));
    }

    #[test]
    fn test_build_id_filename() {
        let id = BuildId::new(vec![0xaa, 0xbb, 0xcc, 0xdd]);
        let name = DefaultLookup::build_id_filename(&id, ".debug").unwrap();
        assert_eq!(name, PathBuf::from(".build-id/aa/bbccdd.debug"));
        assert_eq!(id.to_hex(), "aabbccdd");
    }

    #[test]
    fn test_debug_link_crc_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.debug");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"debug payload").unwrap();
        drop(file);

        let crc = crc32fast::hash(b"debug payload");
        assert!(DefaultLookup::verify_debug_link(&path, crc));
        assert!(!DefaultLookup::verify_debug_link(&path, crc ^ 1));
    }

    #[test]
    fn test_recursive_entry_descends_into_subdirectories() {
        // A .build-id tree nested below the path entry is only reachable
        // through a `+` prefix.
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("distro").join("debug");
        std::fs::create_dir_all(nested.join(".build-id").join("aa")).unwrap();
        std::fs::write(
            nested.join(".build-id").join("aa").join("bbcc.debug"),
            b"not an elf, verification fails",
        )
        .unwrap();

        let id = BuildId::new(vec![0xaa, 0xbb, 0xcc]);
        let base = dir.path().display().to_string();

        let flat = DefaultLookup::new(DebuginfoPath::parse(&base));
        let recursive = DefaultLookup::new(DebuginfoPath::parse(&format!("+{base}")));

        // Existence checks only: both agree the flat entry sees nothing,
        // and only the recursive one reaches the nested candidate (which
        // then fails build-id verification, being no ELF).
        let candidate = nested.join(".build-id").join("aa").join("bbcc.debug");
        assert!(candidate.is_file());
        assert!(!flat
            .search_dirs(None)
            .iter()
            .any(|dir| dir == &nested));
        assert!(recursive
            .search_dirs(None)
            .iter()
            .any(|dir| dir == &nested));
        assert_eq!(flat.find_by_build_id(&id, None), None);
        assert_eq!(recursive.find_by_build_id(&id, None), None);
    }

    #[test]
    fn test_recursive_entry_finds_nested_debuglink() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("usr").join("lib");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("app.debug"), b"debug payload").unwrap();

        let crc = crc32fast::hash(b"debug payload");
        let base = dir.path().display().to_string();

        let flat = DefaultLookup::new(DebuginfoPath::parse(&base));
        assert_eq!(
            flat.find_debuginfo(None, None, Some((b"app.debug", crc))),
            None
        );

        let recursive = DefaultLookup::new(DebuginfoPath::parse(&format!("+{base}")));
        let found = recursive
            .find_debuginfo(None, None, Some((b"app.debug", crc)))
            .unwrap();
        assert_eq!(
            std::fs::canonicalize(found).unwrap(),
            std::fs::canonicalize(nested.join("app.debug")).unwrap()
        );
    }

    #[test]
    fn test_find_debuginfo_via_debuglink_next_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("app");
        std::fs::write(&main, b"not really an elf").unwrap();
        let debug = dir.path().join("app.debug");
        std::fs::write(&debug, b"debug payload").unwrap();

        let lookup = DefaultLookup::default();
        let crc = crc32fast::hash(b"debug payload");
        let found = lookup
            .find_debuginfo(Some(&main), None, Some((b"app.debug", crc)))
            .unwrap();
        assert_eq!(
            std::fs::canonicalize(found).unwrap(),
            std::fs::canonicalize(debug).unwrap()
        );
    }
}
