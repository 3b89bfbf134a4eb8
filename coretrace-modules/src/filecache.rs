//! A shared cache of memory-mapped files.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use coretrace_common::ByteView;

/// Identity of a physical file, independent of the path it was reached
/// through.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct FileKey {
    device: u64,
    inode: u64,
    ctime: i64,
}

/// A reference-counted mapping cache keyed by `(device, inode, ctime)`.
///
/// The same debug file commonly backs many modules; this cache guarantees
/// at most one mapping per physical file. Entries are dropped when the
/// last [`ByteView`] clone referring to them goes away and the cache
/// itself is pruned.
#[derive(Debug, Default)]
pub struct FileCache {
    views: Mutex<HashMap<FileKey, Arc<ByteView<'static>>>>,
}

impl FileCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        FileCache::default()
    }

    /// Opens and maps a file, reusing an existing mapping when the same
    /// physical file is already cached.
    pub fn open(&self, path: &Path) -> io::Result<Arc<ByteView<'static>>> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        let key = FileKey {
            device: meta.dev(),
            inode: meta.ino(),
            ctime: meta.ctime(),
        };

        let mut views = self.views.lock().unwrap();
        if let Some(view) = views.get(&key) {
            return Ok(Arc::clone(view));
        }

        debug!(path = %path.display(), "mapping file");
        let view = Arc::new(ByteView::map_file(&file)?);
        views.insert(key, Arc::clone(&view));
        Ok(view)
    }

    /// Drops cached mappings that no module refers to anymore.
    pub fn prune(&self) {
        self.views
            .lock()
            .unwrap()
            .retain(|_, view| Arc::strong_count(view) > 1);
    }

    /// The number of live cached mappings.
    pub fn len(&self) -> usize {
        self.views.lock().unwrap().len()
    }

    /// Whether the cache holds no mappings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_same_file_shares_mapping() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"\x7fELF").unwrap();

        let cache = FileCache::new();
        let a = cache.open(tmp.path()).unwrap();
        let b = cache.open(tmp.path()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_prune_drops_unreferenced() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"\x7fELF").unwrap();

        let cache = FileCache::new();
        let view = cache.open(tmp.path()).unwrap();
        cache.prune();
        assert_eq!(cache.len(), 1);

        drop(view);
        cache.prune();
        assert!(cache.is_empty());
    }
}
