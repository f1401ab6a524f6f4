use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dpm::error::{DmError, Result};
use dpm::retention::{
    CONFIG_REGION, CONFIG_REGION_SIZE, RetentionBlob, TICKET_REGION, USER_REGION,
};

use tracing::{debug, error, warn};

/// Capacity of the region holding the saved session tickets.
pub const TICKET_REGION_SIZE: usize = 4096;

/// A memory region which keeps its content across sleep.
///
/// The region is split into named allocations. Every allocation has a fixed
/// size decided the first time it is requested.
pub trait RetentionRegion: fmt::Debug + Send + Sync {
    /// Reserves a named allocation of `size` bytes, zero-filled.
    ///
    /// Reserving an existing allocation again with the same size is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::InvalidSize`] when the allocation exists with a
    /// different size, and [`DmError::RetentionAllocFail`] when no memory is
    /// left.
    fn allocate(&self, name: &str, size: usize) -> Result<()>;

    /// Returns the size of a named allocation.
    fn size(&self, name: &str) -> Option<usize>;

    /// Returns a copy of a named allocation.
    fn read(&self, name: &str) -> Option<Vec<u8>>;

    /// Overwrites the start of a named allocation, zero-filling the rest.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::RetentionAllocFail`] when the allocation does not
    /// exist and [`DmError::InvalidSize`] when `bytes` does not fit.
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Erases every allocation.
    fn clear(&self);
}

type Allocations = HashMap<String, Vec<u8>>;

fn lock(allocations: &Mutex<Allocations>) -> MutexGuard<'_, Allocations> {
    allocations.lock().unwrap_or_else(PoisonError::into_inner)
}

fn allocate(allocations: &mut Allocations, name: &str, size: usize) -> Result<bool> {
    if let Some(existing) = allocations.get(name) {
        return if existing.len() == size {
            Ok(false)
        } else {
            Err(DmError::InvalidSize {
                expected: existing.len(),
                actual: size,
            })
        };
    }

    let _ = allocations.insert(name.to_owned(), vec![0; size]);
    Ok(true)
}

fn write(allocations: &mut Allocations, name: &str, bytes: &[u8]) -> Result<()> {
    let Some(allocation) = allocations.get_mut(name) else {
        return Err(DmError::RetentionAllocFail(name.to_owned().into()));
    };

    if bytes.len() > allocation.len() {
        return Err(DmError::InvalidSize {
            expected: allocation.len(),
            actual: bytes.len(),
        });
    }

    allocation[..bytes.len()].copy_from_slice(bytes);
    allocation[bytes.len()..].fill(0);
    Ok(())
}

/// A retention region kept in memory.
///
/// Clones share the same allocations, so that a manager built after a
/// simulated power cycle observes what the previous one saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegion {
    allocations: Arc<Mutex<Allocations>>,
    capacity: Option<usize>,
}

impl MemoryRegion {
    /// Creates an empty [`MemoryRegion`] without a capacity limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total size of all allocations.
    #[must_use]
    #[inline]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Overwrites a whole allocation, bypassing size checks.
    ///
    /// Simulates a corruption of the retention memory.
    pub fn corrupt(&self, name: &str, bytes: Vec<u8>) {
        let _ = lock(&self.allocations).insert(name.to_owned(), bytes);
    }
}

impl RetentionRegion for MemoryRegion {
    fn allocate(&self, name: &str, size: usize) -> Result<()> {
        let mut allocations = lock(&self.allocations);
        if let Some(capacity) = self.capacity {
            let used: usize = allocations
                .iter()
                .filter(|(allocated, _)| allocated.as_str() != name)
                .map(|(_, bytes)| bytes.len())
                .sum();
            if !allocations.contains_key(name) && used + size > capacity {
                return Err(DmError::RetentionAllocFail(name.to_owned().into()));
            }
        }
        allocate(&mut allocations, name, size).map(|_| ())
    }

    fn size(&self, name: &str) -> Option<usize> {
        lock(&self.allocations).get(name).map(Vec::len)
    }

    fn read(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.allocations).get(name).cloned()
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        write(&mut lock(&self.allocations), name, bytes)
    }

    fn clear(&self) {
        lock(&self.allocations).clear();
    }
}

/// A retention region persisted into a `JSON` file.
///
/// Every change is flushed to the file, so that a process started later
/// observes the content as it was at sleep entry.
#[derive(Debug)]
pub struct FileRegion {
    path: PathBuf,
    allocations: Mutex<Allocations>,
}

impl FileRegion {
    /// Opens the region stored at `path`.
    ///
    /// A missing or unreadable file yields an empty region, as erased
    /// retention memory would.
    #[must_use]
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let allocations = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Retention file `{}` is malformed, erase it: {e}", path.display());
                Allocations::new()
            }),
            Err(e) => {
                debug!("No retention file `{}`: {e}", path.display());
                Allocations::new()
            }
        };

        Self {
            path,
            allocations: Mutex::new(allocations),
        }
    }

    fn flush(&self, allocations: &Allocations) -> Result<()> {
        let bytes = serde_json::to_vec(allocations)
            .map_err(|e| DmError::RetentionAllocFail(e.to_string().into()))?;

        let temporary = self.path.with_extension("tmp");
        fs::write(&temporary, bytes)
            .and_then(|()| fs::rename(&temporary, &self.path))
            .map_err(|e| {
                error!("Impossible to write `{}`: {e}", self.path.display());
                DmError::RetentionAllocFail(e.to_string().into())
            })
    }
}

impl RetentionRegion for FileRegion {
    fn allocate(&self, name: &str, size: usize) -> Result<()> {
        let mut allocations = lock(&self.allocations);
        if allocate(&mut allocations, name, size)? {
            self.flush(&allocations)?;
        }
        Ok(())
    }

    fn size(&self, name: &str) -> Option<usize> {
        lock(&self.allocations).get(name).map(Vec::len)
    }

    fn read(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.allocations).get(name).cloned()
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut allocations = lock(&self.allocations);
        write(&mut allocations, name, bytes)?;
        self.flush(&allocations)
    }

    fn clear(&self) {
        let mut allocations = lock(&self.allocations);
        allocations.clear();
        if let Err(e) = self.flush(&allocations) {
            error!("Impossible to erase the retention file: {e}");
        }
    }
}

/// The retention store of the manager.
///
/// Holds the retention blob, the application payload and the saved session
/// tickets, each one in its own named allocation.
#[derive(Debug, Clone)]
pub struct RetentionStore {
    region: Arc<dyn RetentionRegion>,
    capacity: usize,
    lock: Arc<Mutex<()>>,
}

impl RetentionStore {
    /// Creates a [`RetentionStore`] over a region.
    #[must_use]
    pub fn new(region: Arc<dyn RetentionRegion>) -> Self {
        Self {
            region,
            capacity: CONFIG_REGION_SIZE,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Sets the capacity of the blob allocation.
    #[must_use]
    #[inline]
    pub const fn blob_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Loads the retention blob.
    ///
    /// Returns [`None`] when the region holds no valid blob.
    #[must_use]
    pub fn load(&self) -> Option<RetentionBlob> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.region
            .read(CONFIG_REGION)
            .and_then(|bytes| RetentionBlob::decode(&bytes))
    }

    /// Saves the retention blob.
    ///
    /// A concurrent [`RetentionStore::load`] observes either the previous or
    /// the new blob, never a mix of them.
    ///
    /// # Errors
    ///
    /// Fails when the blob does not fit its allocation or the allocation
    /// cannot be reserved.
    pub fn save(&self, blob: &RetentionBlob) -> Result<()> {
        let bytes = blob.encode(self.capacity)?;

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.region.allocate(CONFIG_REGION, self.capacity)?;
        self.region.write(CONFIG_REGION, &bytes)
    }

    /// Erases the whole retention memory.
    pub fn erase(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.region.clear();
    }

    /// Reserves the application payload allocation.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::InvalidSize`] when the allocation exists with a
    /// different size.
    pub fn allocate_user(&self, size: usize) -> Result<()> {
        self.region.allocate(USER_REGION, size)
    }

    /// Size of the application payload allocation.
    #[must_use]
    pub fn user_size(&self) -> Option<usize> {
        self.region.size(USER_REGION)
    }

    /// Reads the application payload.
    #[must_use]
    pub fn read_user(&self) -> Option<Vec<u8>> {
        self.region.read(USER_REGION)
    }

    /// Writes the application payload verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`DmError::InvalidSize`] when the payload size differs from
    /// the allocation size.
    pub fn write_user(&self, bytes: &[u8]) -> Result<()> {
        let Some(size) = self.region.size(USER_REGION) else {
            return Err(DmError::RetentionAllocFail(USER_REGION.into()));
        };
        if size != bytes.len() {
            return Err(DmError::InvalidSize {
                expected: size,
                actual: bytes.len(),
            });
        }
        self.region.write(USER_REGION, bytes)
    }

    /// Saves the serialized session tickets.
    ///
    /// # Errors
    ///
    /// Fails when the tickets do not fit their allocation.
    pub fn save_tickets(&self, bytes: &[u8]) -> Result<()> {
        let length = u32::try_from(bytes.len()).map_err(|_| DmError::InvalidSize {
            expected: TICKET_REGION_SIZE,
            actual: bytes.len(),
        })?;

        let mut content = Vec::with_capacity(bytes.len() + 4);
        content.extend_from_slice(&length.to_le_bytes());
        content.extend_from_slice(bytes);

        self.region.allocate(TICKET_REGION, TICKET_REGION_SIZE)?;
        self.region.write(TICKET_REGION, &content)
    }

    /// Loads the serialized session tickets.
    #[must_use]
    pub fn load_tickets(&self) -> Option<Vec<u8>> {
        let content = self.region.read(TICKET_REGION)?;
        let length = u32::from_le_bytes(content.get(0..4)?.try_into().ok()?);
        let end = 4usize.checked_add(usize::try_from(length).ok()?)?;
        if length == 0 {
            return None;
        }
        content.get(4..end).map(<[u8]>::to_vec)
    }
}
