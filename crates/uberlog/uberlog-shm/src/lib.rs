//! `uberlog-shm`: naming and lifetime of the shared segment carrying the ring.
//!
//! The producer and the writer child never exchange a descriptor; each side
//! independently derives the same well-known POSIX shared-memory object name
//! from the producer's pid and the log filename, then maps the object. The
//! producer creates and finally unlinks the object; the writer only attaches.

use std::fs::File;
use std::hash::Hasher;

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use siphasher::sip::SipHasher24;
use thiserror::Error;
use uberlog_ring::HEAD_SIZE;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to create shared memory object '{name}'")]
    Create {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to open shared memory object '{name}'")]
    Open {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to size shared memory object '{name}' to {size} bytes")]
    Truncate {
        name: String,
        size: usize,
        #[source]
        source: nix::Error,
    },

    #[error("failed to map shared memory object '{name}'")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to unlink shared memory object '{name}'")]
    Unlink {
        name: String,
        #[source]
        source: nix::Error,
    },
}

fn siphash24(key: &[u8; 16], data: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_key(key);
    hasher.write(data);
    hasher.finish()
}

/// Derives the well-known segment name shared by producer and writer.
///
/// The name is `/uberlog-shm-<pid>-<h1 hi><h1 lo><h2 hi><h2 lo>` where the
/// four groups are zero-padded 32-bit hex halves of two keyed SipHash-2-4
/// digests of the filename. The first key has its leading four bytes
/// overwritten with the little-endian pid, so two producers logging to the
/// same file still get distinct segments.
pub fn segment_name(parent_pid: u32, log_filename: &str) -> String {
    let mut key1: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
    let key2: [u8; 16] = [15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0];
    key1[..4].copy_from_slice(&parent_pid.to_le_bytes());
    let h1 = siphash24(&key1, log_filename.as_bytes());
    let h2 = siphash24(&key2, log_filename.as_bytes());
    format!(
        "/uberlog-shm-{parent_pid}-{:08x}{:08x}{:08x}{:08x}",
        (h1 >> 32) as u32,
        h1 as u32,
        (h2 >> 32) as u32,
        h2 as u32
    )
}

/// Segment size for a ring of `ring_capacity` bytes: the ring window plus the
/// cursor head, rounded up to the x86 page size. Going right up to the edge
/// of the mapping also makes off-by-one errors in the ring fault loudly.
pub fn segment_size_for_ring(ring_capacity: usize) -> usize {
    (ring_capacity + HEAD_SIZE + 4095) & !4095usize
}

/// An open, mapped shared-memory object.
///
/// The mapping's base address is stable for the lifetime of the segment, so a
/// ring view built over [`SharedSegment::as_mut_ptr`] stays valid until the
/// segment is dropped. Dropping unmaps and closes; it does not unlink.
pub struct SharedSegment {
    name: String,
    map: MmapMut,
    _file: File,
}

impl SharedSegment {
    /// Creates (or reopens) the object, sizes it, and maps it read-write.
    /// This is the producer side.
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| ShmError::Create {
            name: name.to_string(),
            source,
        })?;
        let file = File::from(fd);
        nix::unistd::ftruncate(&file, size as i64).map_err(|source| ShmError::Truncate {
            name: name.to_string(),
            size,
            source,
        })?;
        Self::map(name.to_string(), file, size)
    }

    /// Attaches to an existing object. This is the writer side; it never
    /// creates or resizes.
    pub fn open(name: &str, size: usize) -> Result<Self, ShmError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|source| ShmError::Open {
            name: name.to_string(),
            source,
        })?;
        Self::map(name.to_string(), File::from(fd), size)
    }

    fn map(name: String, file: File, size: usize) -> Result<Self, ShmError> {
        // SAFETY: both sides map exactly `size` bytes of an object the
        // creator sized with ftruncate; the fd stays open for the mapping's
        // lifetime via `_file`.
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(|source| {
            ShmError::Map {
                name: name.clone(),
                source,
            }
        })?;
        Ok(Self {
            name,
            map,
            _file: file,
        })
    }

    /// Removes the object name from the system. Live mappings survive until
    /// their owners drop them; only the producer calls this.
    pub fn unlink(name: &str) -> Result<(), ShmError> {
        shm_unlink(name).map_err(|source| ShmError::Unlink {
            name: name.to_string(),
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_shape_and_determinism() {
        let name = segment_name(1234, "/var/log/app.log");
        assert!(name.starts_with("/uberlog-shm-1234-"));
        let hex = &name["/uberlog-shm-1234-".len()..];
        assert_eq!(hex.len(), 32);
        assert!(hex.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(name, segment_name(1234, "/var/log/app.log"));
    }

    #[test]
    fn name_depends_on_pid_and_filename() {
        let base = segment_name(1234, "/var/log/app.log");
        assert_ne!(base, segment_name(1235, "/var/log/app.log"));
        assert_ne!(base, segment_name(1234, "/var/log/other.log"));
    }

    #[test]
    fn segment_size_rounds_to_pages() {
        assert_eq!(segment_size_for_ring(1), 4096);
        assert_eq!(segment_size_for_ring(4096 - HEAD_SIZE), 4096);
        assert_eq!(segment_size_for_ring(4096 - HEAD_SIZE + 1), 8192);
        assert_eq!(segment_size_for_ring(1 << 20), (1 << 20) + 4096);
    }

    #[test]
    fn create_open_share_bytes_then_unlink() {
        let name = segment_name(std::process::id(), "uberlog-shm-self-test");
        let size = segment_size_for_ring(4096);

        let mut writer_side = SharedSegment::create(&name, size).expect("create segment");
        let mut reader_side = SharedSegment::open(&name, size).expect("open segment");
        assert_eq!(writer_side.len(), size);
        assert_eq!(reader_side.len(), size);

        // SAFETY: test-local segment, no concurrent access.
        unsafe {
            *writer_side.as_mut_ptr() = 0xAB;
            *writer_side.as_mut_ptr().add(size - 1) = 0xCD;
            assert_eq!(*reader_side.as_mut_ptr(), 0xAB);
            assert_eq!(*reader_side.as_mut_ptr().add(size - 1), 0xCD);
        }

        SharedSegment::unlink(&name).expect("unlink segment");
        assert!(SharedSegment::open(&name, size).is_err(), "name gone after unlink");
    }
}
