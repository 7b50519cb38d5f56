//! Re-openable byte sources.
//!
//! Every attempt reads its input from scratch, so the harness needs something
//! it can open again and again rather than a single reader.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

/// Something that can hand out fresh readers over the same bytes.
pub trait ByteSource: Sync {
    /// Opens a new reader positioned at the first byte.
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>>;

    /// Total length in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Human readable name used in logs and reports.
    fn describe(&self) -> String;
}

/// A file on disk, re-opened for every attempt.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn len(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Bytes held in memory and shared between workers.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl ByteSource for MemorySource {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(&self.data[..]))
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// A memory-mapped file.
///
/// The mapping is created once and every attempt reads from it, which keeps
/// parallel sweeps from opening one file handle per worker.
#[derive(Debug, Clone)]
pub struct MappedSource {
    path: PathBuf,
    mmap: Arc<Mmap>,
}

impl MappedSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // The file must not be modified while a sweep is running.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self {
            path,
            mmap: Arc::new(mmap),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}

impl ByteSource for MappedSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(&self.mmap[..]))
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.mmap.len() as u64)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn read_all(source: &dyn ByteSource) -> Vec<u8> {
        let mut out = Vec::new();
        source.open().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    fn temp_file(name: &str, data: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("bitflip-{}-{}", std::process::id(), name));
        File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn test_memory_source_reopens() {
        let source = MemorySource::new("mem", vec![1u8, 2, 3]);
        assert_eq!(source.len().unwrap(), 3);
        assert_eq!(read_all(&source), vec![1, 2, 3]);
        assert_eq!(read_all(&source), vec![1, 2, 3]);
        assert_eq!(source.describe(), "mem");
    }

    #[test]
    fn test_file_and_mapped_sources_agree() {
        let path = temp_file("agree", b"hello world");
        let file = FileSource::new(&path);
        let mapped = MappedSource::open(&path).unwrap();

        assert_eq!(file.len().unwrap(), 11);
        assert_eq!(mapped.len().unwrap(), 11);
        assert_eq!(read_all(&file), read_all(&mapped));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_file() {
        let source = FileSource::new("/definitely/not/here.bz2");
        assert!(source.open().is_err());
        assert!(source.len().is_err());
        assert!(MappedSource::open("/definitely/not/here.bz2").is_err());
    }
}
