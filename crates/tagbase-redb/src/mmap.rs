//! Growable, fixed-stride, mmap-backed array.
//!
//! Grounded on `original_source/src/core/mmap_array.c`: double-or-burst
//! growth policy, page-aligned file size, resize only under the
//! exclusive lock, reads/writes into an already-large-enough mapping
//! under the shared lock. Uses `memmap2` for the mapping and
//! `parking_lot::RwLock` in place of the original's `pthread_rwlock_t`.

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tagbase_core::{MmapArray, StorageError};

/// Burst buffer added past a doubled capacity that still doesn't reach
/// the requested index (`original_source`'s `+ 1024` constant).
const BURST_ITEMS: u64 = 1024;

struct Mapping {
    file: std::fs::File,
    mmap: MmapMut,
    capacity: u64,
}

pub struct MmapArrayFile {
    path: PathBuf,
    item_size: usize,
    inner: RwLock<Mapping>,
}

fn page_align(bytes: u64) -> u64 {
    let page = page_size() as u64;
    (bytes + page - 1) & !(page - 1)
}

fn page_size() -> usize {
    // Matches the original's `sysconf(_SC_PAGESIZE)`; 4 KiB is correct on
    // every platform this crate targets.
    4096
}

impl MmapArrayFile {
    pub fn open(path: impl AsRef<Path>, item_size: usize, initial_cap: u64) -> Result<Self, StorageError> {
        if item_size == 0 {
            return Err(StorageError::MmapGrowth("item_size must be non-zero".into()));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let existing = file.metadata()?.len();
        let initial_bytes = initial_cap * item_size as u64;
        let file_size = if existing < initial_bytes {
            let aligned = page_align(initial_bytes);
            file.set_len(aligned)?;
            aligned
        } else {
            existing
        };

        let mmap = unsafe {
            MmapOptions::new()
                .len(file_size as usize)
                .map_mut(&file)
                .map_err(|e| StorageError::MmapGrowth(e.to_string()))?
        };

        let capacity = file_size / item_size as u64;
        Ok(Self {
            path,
            item_size,
            inner: RwLock::new(Mapping {
                file,
                mmap,
                capacity,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_capacity(&self, index: u64) -> Result<(), StorageError> {
        {
            let guard = self.inner.read();
            if index < guard.capacity {
                return Ok(());
            }
        }
        let mut guard = self.inner.write();
        if index < guard.capacity {
            return Ok(());
        }
        self.resize_locked(&mut guard, index)
    }

    fn resize_locked(&self, guard: &mut Mapping, needed_index: u64) -> Result<(), StorageError> {
        let mut new_cap = guard.capacity.saturating_mul(2);
        if new_cap <= needed_index {
            new_cap = needed_index + BURST_ITEMS;
        }
        let new_bytes = page_align(new_cap * self.item_size as u64);

        guard
            .mmap
            .flush()
            .map_err(|e| StorageError::MmapGrowth(e.to_string()))?;
        guard
            .file
            .set_len(new_bytes)
            .map_err(|e| StorageError::MmapGrowth(e.to_string()))?;

        let new_mmap = unsafe {
            MmapOptions::new()
                .len(new_bytes as usize)
                .map_mut(&guard.file)
                .map_err(|e| StorageError::MmapGrowth(e.to_string()))?
        };

        guard.mmap = new_mmap;
        guard.capacity = new_bytes / self.item_size as u64;
        tracing::debug!(path = %self.path.display(), new_capacity = guard.capacity, "mmap array resized");
        Ok(())
    }
}

impl MmapArray for MmapArrayFile {
    fn item_size(&self) -> usize {
        self.item_size
    }

    fn get(&self, index: u32) -> Result<Option<Vec<u8>>, StorageError> {
        let guard = self.inner.read();
        let index = index as u64;
        if index >= guard.capacity {
            return Ok(None);
        }
        let start = (index * self.item_size as u64) as usize;
        let end = start + self.item_size;
        Ok(Some(guard.mmap[start..end].to_vec()))
    }

    fn set(&self, index: u32, bytes: &[u8]) -> Result<(), StorageError> {
        if bytes.len() != self.item_size {
            return Err(StorageError::Encoding(format!(
                "expected {} bytes, got {}",
                self.item_size,
                bytes.len()
            )));
        }
        self.ensure_capacity(index as u64)?;
        let guard = self.inner.read();
        let start = (index as u64 * self.item_size as u64) as usize;
        let end = start + self.item_size;
        // Safety (w.r.t. the source's invariant): no resize runs while any
        // reader holds the read lock, so this slice is always backed by
        // the current mapping for the lifetime of the copy below.
        let dest = &guard.mmap[start..end];
        let dest_ptr = dest.as_ptr() as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest_ptr, self.item_size);
        }
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.inner.read().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let arr = MmapArrayFile::open(dir.path().join("evt_ent.bin"), 4, 16).unwrap();
        arr.set(0, &42u32.to_le_bytes()).unwrap();
        arr.set(5, &7u32.to_le_bytes()).unwrap();
        assert_eq!(arr.get(0).unwrap().unwrap(), 42u32.to_le_bytes());
        assert_eq!(arr.get(5).unwrap().unwrap(), 7u32.to_le_bytes());
        assert_eq!(arr.get(1).unwrap().unwrap(), 0u32.to_le_bytes());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let dir = tempdir().unwrap();
        let arr = MmapArrayFile::open(dir.path().join("evt_ent.bin"), 4, 4).unwrap();
        assert!(arr.capacity() >= 4);
        arr.set(10_000, &1u32.to_le_bytes()).unwrap();
        assert!(arr.capacity() > 10_000);
        assert_eq!(arr.get(10_000).unwrap().unwrap(), 1u32.to_le_bytes());
    }

    #[test]
    fn get_beyond_capacity_is_none() {
        let dir = tempdir().unwrap();
        let arr = MmapArrayFile::open(dir.path().join("evt_ent.bin"), 4, 4).unwrap();
        assert!(arr.get(1_000_000).unwrap().is_none());
    }
}
