//! Polymorphic, refcounted data carriers.
//!
//! A [`ManagedBuffer`] is the unit of payload passed across the transport: request and
//! response bodies, upload data, and stream chunks are all `ManagedBuffer`s. It comes in
//! two variants, an in-memory region backed by a cheaply-cloneable [`bytes::Bytes`], and
//! a file region that defers reading until the bytes are actually needed. Both variants
//! carry an explicit reference count so a caller can `retain()` a buffer it intends to
//! hold past the point the codec would otherwise release it, and must `release()` exactly
//! once for every `retain()` (including the implicit retain held at construction).

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// A region of a file on disk, read lazily and only as far as needed.
#[derive(Clone)]
struct FileRegion {
    path: Arc<PathBuf>,
    offset: u64,
    length: u64,
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

impl FileRegion {
    fn read_to_bytes(&self) -> io::Result<Bytes> {
        let mut file = File::open(self.path.as_ref())?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = vec![0_u8; self.length as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

#[derive(Debug, Clone)]
enum BufferKind {
    Memory(Bytes),
    File(FileRegion),
}

/// A polymorphic byte carrier with explicit reference counting.
///
/// Cloning a `ManagedBuffer` is cheap (it shares the same refcount and underlying
/// storage); use [`ManagedBuffer::retain`] when a clone needs to be tracked as an
/// independent claim on the buffer's lifetime, and [`ManagedBuffer::release`] to give
/// that claim back. The buffer's resources (a memory region, or in the file-backed
/// case nothing held open ahead of time) are only a concern once the count reaches zero.
#[derive(Clone)]
pub struct ManagedBuffer {
    kind: BufferKind,
    refcount: Arc<AtomicUsize>,
}

impl fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("size", &self.size())
            .field("refs", &self.refcount.load(Ordering::SeqCst))
            .finish()
    }
}

impl ManagedBuffer {
    /// Wraps an in-memory region. The initial reference count is 1.
    pub fn from_memory(data: impl Into<Bytes>) -> Self {
        ManagedBuffer { kind: BufferKind::Memory(data.into()), refcount: Arc::new(AtomicUsize::new(1)) }
    }

    /// Wraps a lazily-read file region. The initial reference count is 1.
    pub fn from_file(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        ManagedBuffer {
            kind: BufferKind::File(FileRegion { path: Arc::new(path.into()), offset, length }),
            refcount: Arc::new(AtomicUsize::new(1)),
        }
    }

    /// Exact byte length, without materializing file-backed regions.
    pub fn size(&self) -> u64 {
        match &self.kind {
            BufferKind::Memory(b) => b.len() as u64,
            BufferKind::File(f) => f.length,
        }
    }

    /// Materializes the buffer to memory if needed and returns a borrowed byte view.
    pub fn as_readable_bytes(&self) -> io::Result<Bytes> {
        match &self.kind {
            BufferKind::Memory(b) => Ok(b.clone()),
            BufferKind::File(f) => f.read_to_bytes(),
        }
    }

    /// Increments the reference count. Must be paired with a later `release()`.
    pub fn retain(&self) -> Self {
        self.refcount.fetch_add(1, Ordering::SeqCst);
        self.clone()
    }

    /// Decrements the reference count. The caller of the release that drops the count
    /// to zero is responsible for any cleanup implied by the buffer going away (for a
    /// file region, simply forgetting it; no descriptor is held open between reads).
    ///
    /// Returns `true` if this was the final release.
    pub fn release(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "ManagedBuffer released more times than retained");
        prev == 1
    }

    /// Current reference count, for tests and diagnostics.
    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trip() {
        let buf = ManagedBuffer::from_memory(Bytes::from_static(b"hello"));
        assert_eq!(buf.size(), 5);
        assert_eq!(&buf.as_readable_bytes().unwrap()[..], b"hello");
    }

    #[test]
    fn retain_release_tracks_count() {
        let buf = ManagedBuffer::from_memory(Bytes::from_static(b"x"));
        assert_eq!(buf.ref_count(), 1);
        let retained = buf.retain();
        assert_eq!(buf.ref_count(), 2);
        assert!(!buf.release());
        assert_eq!(retained.ref_count(), 1);
        assert!(retained.release());
    }

    #[test]
    fn file_region_reads_lazily() {
        let mut path = std::env::temp_dir();
        path.push(format!("wire-transport-test-{}", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();
        let buf = ManagedBuffer::from_file(&path, 2, 4);
        assert_eq!(buf.size(), 4);
        assert_eq!(&buf.as_readable_bytes().unwrap()[..], b"2345");
        std::fs::remove_file(&path).ok();
    }
}
