//! Per-call virtual filesystem
//!
//! An in-memory tree presented to a guest for the duration of a single
//! `analyze` call. Files are lazy: the content producer runs on the first
//! open, so a guest that never looks at the file costs nothing.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

/// Produces a file's bytes on first read.
pub type ContentProducer = Box<dyn FnOnce() -> io::Result<Vec<u8>> + Send>;

enum LazyFile {
    Pending(Option<ContentProducer>),
    Ready(Arc<Vec<u8>>),
}

/// In-memory filesystem rooted at `/`.
pub struct MemFs {
    dirs: HashSet<String>,
    files: HashMap<String, LazyFile>,
}

impl MemFs {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert("/".to_string());
        Self {
            dirs,
            files: HashMap::new(),
        }
    }

    /// Create `path` and every missing ancestor.
    pub fn mkdir_all(&mut self, path: &str) -> io::Result<()> {
        let mut current = String::from("/");
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if current.len() > 1 {
                current.push('/');
            }
            current.push_str(component);
            if self.files.contains_key(&current) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{current} is a file"),
                ));
            }
            self.dirs.insert(current.clone());
        }
        Ok(())
    }

    /// Register a lazy file under `path`. The parent directory must exist.
    pub fn write_lazy_file(&mut self, path: &str, content: ContentProducer) -> io::Result<()> {
        if self.dirs.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path} is a directory"),
            ));
        }
        if !self.dirs.contains(parent_dir(path)) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such directory: {}", parent_dir(path)),
            ));
        }
        self.files
            .insert(path.to_string(), LazyFile::Pending(Some(content)));
        Ok(())
    }

    /// Open `path`, materializing the content on first access.
    pub fn open(&mut self, path: &str) -> io::Result<Arc<Vec<u8>>> {
        let slot = self
            .files
            .get_mut(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}")))?;
        match slot {
            LazyFile::Ready(bytes) => Ok(bytes.clone()),
            LazyFile::Pending(producer) => {
                let producer = producer.take().ok_or_else(|| {
                    io::Error::other(format!("content producer for {path} already failed"))
                })?;
                let bytes = Arc::new(producer()?);
                *slot = LazyFile::Ready(bytes.clone());
                Ok(bytes)
            }
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory component of an absolute path; `/a.txt` has parent `/`.
pub(crate) fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn mkdir_all_creates_ancestors() {
        let mut fs = MemFs::new();
        fs.mkdir_all("/a/b/c").unwrap();
        assert!(fs.is_dir("/"));
        assert!(fs.is_dir("/a"));
        assert!(fs.is_dir("/a/b"));
        assert!(fs.is_dir("/a/b/c"));
        assert!(!fs.is_dir("/a/b/c/d"));
    }

    #[test]
    fn lazy_file_materializes_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut fs = MemFs::new();
        fs.write_lazy_file(
            "/a.txt",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(b"content".to_vec())
            }),
        )
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let first = fs.open("/a.txt").unwrap();
        let second = fs.open("/a.txt").unwrap();
        assert_eq!(first.as_slice(), b"content");
        assert_eq!(second.as_slice(), b"content");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_parent_is_rejected() {
        let mut fs = MemFs::new();
        let err = fs
            .write_lazy_file("/missing/a.txt", Box::new(|| Ok(Vec::new())))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn open_missing_file() {
        let mut fs = MemFs::new();
        let err = fs.open("/nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn failed_producer_stays_failed() {
        let mut fs = MemFs::new();
        fs.write_lazy_file(
            "/a.txt",
            Box::new(|| Err(io::Error::other("backing store gone"))),
        )
        .unwrap();
        assert!(fs.open("/a.txt").is_err());
        assert!(fs.open("/a.txt").is_err());
    }

    #[test]
    fn parent_dir_of_root_level_file() {
        assert_eq!(parent_dir("/a.txt"), "/");
        assert_eq!(parent_dir("/a/b.txt"), "/a");
        assert_eq!(parent_dir("a.txt"), "/");
    }
}
