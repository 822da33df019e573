//! An in-memory page device with seeded fault injection.
//!
//! Faults it can inject:
//! - failed page reads and writes
//! - bit flips on read
//! - torn writes that store only a prefix of the page
//! - failed syncs, which may still have made some writes durable
//!
//! The simulated device keeps two images: the volatile one every read sees,
//! and the durable one that only `sync` updates. [`SimulatedDiskHandle::crash`]
//! builds a fresh storage from the durable image, which is what a process
//! would find after losing power.

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::{PAGE_SIZE, Page, PageId, Storage, StorageError};

/// Fault probabilities, each between 0.0 and 1.0.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    pub read_error_rate: f64,
    pub write_error_rate: f64,
    pub sync_error_rate: f64,
    /// A read returns the page with a few bits flipped.
    pub corruption_rate: f64,
    /// Only a prefix of the page is written.
    pub partial_write_rate: f64,
    /// Probability that a failing sync still made some writes durable.
    pub partial_sync_rate: f64,
}

impl FaultConfig {
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Rare I/O errors, no corruption.
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            sync_error_rate: 0.001,
            corruption_rate: 0.0,
            partial_write_rate: 0.0,
            partial_sync_rate: 0.5,
        }
    }

    /// Frequent I/O errors, no corruption.
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            sync_error_rate: 0.05,
            corruption_rate: 0.0,
            partial_write_rate: 0.0,
            partial_sync_rate: 0.5,
        }
    }
}

/// Operation and fault counters.
#[derive(Debug, Default, Clone)]
pub struct SimulatedStorageStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub injected_read_errors: u64,
    pub injected_write_errors: u64,
    pub injected_sync_errors: u64,
    pub corrupted_reads: u64,
    pub partial_writes: u64,
}

/// Shared state of one simulated device.
struct SimulatedDisk {
    /// What reads observe.
    volatile: HashMap<PageId, Page>,
    volatile_total: u64,
    /// What survives a crash.
    durable: HashMap<PageId, Page>,
    durable_total: u64,
    /// Pages written since the last successful sync.
    pending: Vec<PageId>,

    fault_config: FaultConfig,
    rng: StdRng,
    /// Deterministic one-shot failures, consumed before rates apply.
    fail_next_syncs: u32,
    fail_next_writes: u32,
    /// Operations allowed to succeed before the scheduled failures start.
    sync_skip: u32,
    write_skip: u32,

    stats: SimulatedStorageStats,
}

impl SimulatedDisk {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    fn corrupt_page(&mut self, page: &mut Page) {
        let num_flips = self.rng.random_range(1..=8);
        for _ in 0..num_flips {
            let byte_offset = self.rng.random_range(0..PAGE_SIZE);
            let bit = self.rng.random_range(0..8u8);
            page.as_bytes_mut()[byte_offset] ^= 1 << bit;
        }
    }

    /// Simulate a partial write by zeroing out the tail of the page.
    fn make_partial_write(&mut self, page: &mut Page) {
        let cutoff = self.rng.random_range(0..PAGE_SIZE);
        for byte in page.as_bytes_mut().iter_mut().skip(cutoff) {
            *byte = 0;
        }
    }

    fn take_scheduled_write_failure(&mut self) -> bool {
        if self.fail_next_writes == 0 {
            return false;
        }
        if self.write_skip > 0 {
            self.write_skip -= 1;
            return false;
        }
        self.fail_next_writes -= 1;
        true
    }

    fn take_scheduled_sync_failure(&mut self) -> bool {
        if self.fail_next_syncs == 0 {
            return false;
        }
        if self.sync_skip > 0 {
            self.sync_skip -= 1;
            return false;
        }
        self.fail_next_syncs -= 1;
        true
    }

    fn make_durable(&mut self, page_id: PageId) {
        if let Some(page) = self.volatile.get(&page_id) {
            self.durable.insert(page_id, page.clone());
        }
    }
}

/// In-memory [`Storage`] with a volatile and a durable image.
///
/// Cloning the handle returned by [`SimulatedStorage::handle`] lets a test
/// keep control of the device after the storage was moved into a store.
pub struct SimulatedStorage {
    disk: Arc<Mutex<SimulatedDisk>>,
}

impl SimulatedStorage {
    /// A fault-free device. Faults enabled later are drawn from `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self::from_image(HashMap::new(), 0, fault_config, StdRng::seed_from_u64(seed))
    }

    fn from_image(
        pages: HashMap<PageId, Page>,
        total: u64,
        fault_config: FaultConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            disk: Arc::new(Mutex::new(SimulatedDisk {
                volatile: pages.clone(),
                volatile_total: total,
                durable: pages,
                durable_total: total,
                pending: Vec::new(),
                fault_config,
                rng,
                fail_next_syncs: 0,
                fail_next_writes: 0,
                sync_skip: 0,
                write_skip: 0,
                stats: SimulatedStorageStats::default(),
            })),
        }
    }

    /// Get a handle that controls this device.
    #[must_use]
    pub fn handle(&self) -> SimulatedDiskHandle {
        SimulatedDiskHandle {
            disk: Arc::clone(&self.disk),
        }
    }

    fn disk(&self) -> Result<MutexGuard<'_, SimulatedDisk>, StorageError> {
        self.disk.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

/// Control handle for a simulated device.
#[derive(Clone)]
pub struct SimulatedDiskHandle {
    disk: Arc<Mutex<SimulatedDisk>>,
}

impl SimulatedDiskHandle {
    fn with_disk<T>(&self, f: impl FnOnce(&mut SimulatedDisk) -> T) -> T {
        let mut disk = match self.disk.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut disk)
    }

    /// Make the next `count` syncs fail.
    pub fn fail_next_syncs(&self, count: u32) {
        self.fail_syncs_after(0, count);
    }

    /// Let `skip` syncs succeed, then make the following `count` fail.
    pub fn fail_syncs_after(&self, skip: u32, count: u32) {
        self.with_disk(|disk| {
            disk.sync_skip = skip;
            disk.fail_next_syncs = count;
        });
    }

    /// Make the next `count` page writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes_after(0, count);
    }

    /// Let `skip` page writes succeed, then make the following `count` fail.
    pub fn fail_writes_after(&self, skip: u32, count: u32) {
        self.with_disk(|disk| {
            disk.write_skip = skip;
            disk.fail_next_writes = count;
        });
    }

    pub fn set_fault_config(&self, config: FaultConfig) {
        self.with_disk(|disk| disk.fault_config = config);
    }

    #[must_use]
    pub fn stats(&self) -> SimulatedStorageStats {
        self.with_disk(|disk| disk.stats.clone())
    }

    /// Number of pages written but not yet durable.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.with_disk(|disk| disk.pending.len())
    }

    /// Simulate power loss: a new device holding only the durable image.
    ///
    /// Fault injection is off on the recovered device.
    #[must_use]
    pub fn crash(&self) -> SimulatedStorage {
        self.with_disk(|disk| {
            let seed = disk.rng.random::<u64>();
            SimulatedStorage::from_image(
                disk.durable.clone(),
                disk.durable_total,
                FaultConfig::no_faults(),
                StdRng::seed_from_u64(seed),
            )
        })
    }
}

impl Storage for SimulatedStorage {
    fn read_page(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        let mut disk = self.disk()?;
        disk.stats.reads += 1;

        if page_id >= disk.volatile_total {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: disk.volatile_total,
            });
        }

        let rate = disk.fault_config.read_error_rate;
        if disk.should_inject_fault(rate) {
            disk.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let mut page = disk.volatile.get(&page_id).cloned().unwrap_or_default();

        let rate = disk.fault_config.corruption_rate;
        if disk.should_inject_fault(rate) {
            disk.stats.corrupted_reads += 1;
            disk.corrupt_page(&mut page);
        }

        Ok(page)
    }

    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        let mut disk = self.disk()?;
        disk.stats.writes += 1;

        if page_id >= disk.volatile_total {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: disk.volatile_total,
            });
        }

        let rate = disk.fault_config.write_error_rate;
        if disk.take_scheduled_write_failure() {
            disk.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "scheduled write error".to_string(),
            ));
        }
        if disk.should_inject_fault(rate) {
            disk.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let mut page_to_write = page.clone();

        let rate = disk.fault_config.partial_write_rate;
        if disk.should_inject_fault(rate) {
            disk.stats.partial_writes += 1;
            disk.make_partial_write(&mut page_to_write);
        }

        disk.volatile.insert(page_id, page_to_write);
        disk.pending.push(page_id);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        let mut disk = self.disk()?;
        disk.stats.syncs += 1;

        let scheduled = disk.take_scheduled_sync_failure();
        let rate = disk.fault_config.sync_error_rate;
        if scheduled || disk.should_inject_fault(rate) {
            disk.stats.injected_sync_errors += 1;

            let rate = disk.fault_config.partial_sync_rate;
            if disk.should_inject_fault(rate) {
                let pending = std::mem::take(&mut disk.pending);
                let mut kept = Vec::new();
                for page_id in pending {
                    if disk.rng.random::<bool>() {
                        disk.make_durable(page_id);
                    } else {
                        kept.push(page_id);
                    }
                }
                disk.pending = kept;
            }

            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        let pending = std::mem::take(&mut disk.pending);
        for page_id in pending {
            disk.make_durable(page_id);
        }
        disk.durable_total = disk.volatile_total;
        Ok(())
    }

    fn allocate_pages(&mut self, count: u64) -> Result<PageId, StorageError> {
        let mut disk = self.disk()?;
        let first_new_page = disk.volatile_total;
        disk.volatile_total += count;
        Ok(first_new_page)
    }

    fn total_pages(&self) -> u64 {
        self.disk().map_or(0, |disk| disk.volatile_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(value: u64) -> Page {
        let mut page = Page::new();
        page.write_u64(64, value);
        page
    }

    #[test]
    fn test_basic_read_write() {
        let mut storage = SimulatedStorage::new(42);
        let first = storage.allocate_pages(4).expect("allocate");
        assert_eq!(first, 0);

        storage.write_page(2, &page_with(7)).expect("write");
        let page = storage.read_page(2).expect("read");
        assert_eq!(page.read_u64(64), 7);
        assert!(storage.read_page(3).expect("read").is_zeroed());
        assert!(matches!(
            storage.read_page(4),
            Err(StorageError::PageOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_crash_keeps_only_synced_writes() {
        let mut storage = SimulatedStorage::new(1);
        let handle = storage.handle();
        storage.allocate_pages(2).expect("allocate");
        storage.write_page(0, &page_with(1)).expect("write");
        storage.sync().expect("sync");
        storage.write_page(0, &page_with(2)).expect("write");
        storage.allocate_pages(3).expect("allocate");

        let mut recovered = handle.crash();
        assert_eq!(recovered.total_pages(), 2);
        assert_eq!(recovered.read_page(0).expect("read").read_u64(64), 1);
    }

    #[test]
    fn test_scheduled_sync_failure_loses_pending_writes() {
        let mut storage = SimulatedStorage::new(3);
        let handle = storage.handle();
        storage.allocate_pages(1).expect("allocate");
        storage.sync().expect("sync");

        storage.write_page(0, &page_with(9)).expect("write");
        handle.fail_next_syncs(1);
        assert!(matches!(
            storage.sync(),
            Err(StorageError::InjectedFault(_))
        ));
        assert_eq!(handle.pending_writes(), 1);
        assert_eq!(handle.stats().injected_sync_errors, 1);

        let mut recovered = handle.crash();
        assert!(recovered.read_page(0).expect("read").is_zeroed());

        // The next sync succeeds and flushes the write.
        storage.sync().expect("sync");
        let mut recovered = handle.crash();
        assert_eq!(recovered.read_page(0).expect("read").read_u64(64), 9);
    }

    #[test]
    fn test_scheduled_write_failure() {
        let mut storage = SimulatedStorage::new(5);
        let handle = storage.handle();
        storage.allocate_pages(1).expect("allocate");
        handle.fail_next_writes(1);
        assert!(storage.write_page(0, &page_with(1)).is_err());
        assert!(storage.write_page(0, &page_with(1)).is_ok());
    }

    #[test]
    fn test_failure_after_skipped_syncs() {
        let mut storage = SimulatedStorage::new(6);
        let handle = storage.handle();
        storage.allocate_pages(1).expect("allocate");
        handle.fail_syncs_after(1, 1);
        assert!(storage.sync().is_ok());
        assert!(storage.sync().is_err());
        assert!(storage.sync().is_ok());
    }

    #[test]
    fn test_deterministic_faults() {
        let config = FaultConfig {
            write_error_rate: 0.3,
            ..FaultConfig::default()
        };
        let run = |seed| {
            let mut storage = SimulatedStorage::with_config(seed, config.clone());
            storage.allocate_pages(1).expect("allocate");
            (0..50)
                .map(|i| storage.write_page(0, &page_with(i)).is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(11), run(11));
    }
}
