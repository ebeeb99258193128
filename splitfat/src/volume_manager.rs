// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Owns the volume header, the FAT and cluster stores, block
//! virtualization, and the transaction log; bridges the host storage layer
//! to the virtual file system layer above it.

use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::ThreadId;

use zerocopy::{FromBytes, IntoBytes};

use splitfat_err::{Error, FsError, Result, TransactionKind};
use splitfat_io::{ByteFile, ByteFileSystem};

use crate::block_virtualization::BlockVirtualization;
use crate::cluster_store::ClusterDataStore;
use crate::fat::{ClusterIndex, FatCellValue, FatDataManager, FatLayout};
use crate::placement::{BlockOccupancy, DefaultPlacementPolicy, PlacementPolicy};
use crate::transaction::TransactionLog;
use crate::volume_descriptor::{
    VolumeConfig, VolumeControlData, VolumeDescriptor, DIRECTORY_BLOCK_INDEX, FIRST_FILE_DATA_BLOCK_INDEX,
    VOLUME_DESCRIPTOR_RESERVED_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemState {
    Unknown,
    Error,
    StorageSetup,
    /// Physical storage created; no root directory, nothing allocated yet.
    Created,
    Ready,
}

/// A single issue found by [`VolumeManager::check_consistency`]. Read-only:
/// the scan never mutates the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyIssue {
    OrphanChain { start_cluster: ClusterIndex },
    FreeBitMismatch { cluster: ClusterIndex, marked_free: bool, cell_is_free: bool },
    ChainCycle { cluster: ClusterIndex },
}

const CONTROL_DATA_OFFSET: u64 = core::mem::size_of::<VolumeDescriptor>() as u64;

fn fat_region_offset() -> u64 {
    CONTROL_DATA_OFFSET + core::mem::size_of::<VolumeControlData>() as u64
}

pub struct VolumeManager<FS: ByteFileSystem> {
    file_system: FS,
    fat_path: String,
    cluster_path: String,
    state: Mutex<FileSystemState>,
    descriptor: RwLock<VolumeDescriptor>,
    control: RwLock<VolumeControlData>,
    virtualization: RwLock<BlockVirtualization>,
    fat: OnceLock<FatDataManager<FS::File>>,
    cluster_store: OnceLock<ClusterDataStore<FS::File>>,
    fat_file: OnceLock<Arc<FS::File>>,
    transaction_log: TransactionLog<FS>,
    expansion_mutex: Mutex<()>,
    transaction_owner: Mutex<Option<ThreadId>>,
    transaction_depth: Mutex<u32>,
    placement: Mutex<Box<dyn PlacementPolicy>>,
}

impl<FS: ByteFileSystem + Clone> VolumeManager<FS> {
    pub fn new(file_system: FS, base_path: impl Into<String>) -> Self {
        let base_path = base_path.into();
        let fat_path = format!("{base_path}.fat");
        let cluster_path = format!("{base_path}.data");
        let transaction_log = TransactionLog::new(file_system.clone(), fat_path.clone());
        Self {
            file_system,
            fat_path,
            cluster_path,
            state: Mutex::new(FileSystemState::Unknown),
            descriptor: RwLock::new(VolumeDescriptor::new(&VolumeConfig::default())),
            control: RwLock::new(VolumeControlData::zeroed()),
            virtualization: RwLock::new(BlockVirtualization::new_identity(0)),
            fat: OnceLock::new(),
            cluster_store: OnceLock::new(),
            fat_file: OnceLock::new(),
            transaction_log,
            expansion_mutex: Mutex::new(()),
            transaction_owner: Mutex::new(None),
            transaction_depth: Mutex::new(0),
            placement: Mutex::new(Box::new(DefaultPlacementPolicy::new())),
        }
    }

    /// Swaps in a custom placement policy in place of the default
    /// most-free-block strategy.
    pub fn set_placement_policy(&self, policy: Box<dyn PlacementPolicy>) {
        *self.placement.lock().unwrap() = policy;
    }

    pub fn state(&self) -> FileSystemState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: FileSystemState) {
        *self.state.lock().unwrap() = state;
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        self.file_system.exists(path)
    }

    /// Opens an existing volume if both files are present, recovering it
    /// from the transaction log if it is not internally consistent; creates
    /// a brand-new one otherwise. Never destroys a volume that is merely
    /// recoverable.
    pub fn create_if_does_not_exist(&self, config: &VolumeConfig) -> Result<()> {
        let fat_exists = self.file_exists(&self.fat_path)?;
        let cluster_exists = self.file_exists(&self.cluster_path)?;
        if fat_exists && cluster_exists {
            self.open_volume()?;
            self.try_restore_from_transaction_log()?;
            self.set_state(FileSystemState::Ready);
            return Ok(());
        }
        if fat_exists || cluster_exists {
            log::warn!("found exactly one of the two volume files; recreating the volume");
            self.remove_volume()?;
        }
        self.create_volume(config)
    }

    fn open_volume(&self) -> Result<()> {
        let fat_file = Arc::new(self.file_system.open(&self.fat_path)?);
        let mut descriptor_bytes = vec![0u8; core::mem::size_of::<VolumeDescriptor>()];
        fat_file.read_at(0, &mut descriptor_bytes)?;
        let mut descriptor = VolumeDescriptor::read_from_bytes(&descriptor_bytes[..])
            .map_err(|_| Error::Fs(FsError::Corruption(splitfat_err::CorruptionKind::VolumeMagic)))?;
        descriptor.verify_consistency()?;

        let mut control_bytes = vec![0u8; core::mem::size_of::<VolumeControlData>()];
        fat_file.read_at(CONTROL_DATA_OFFSET, &mut control_bytes)?;
        let control = VolumeControlData::read_from_bytes(&control_bytes[..])
            .map_err(|_| Error::invalid_state("volume control data is the wrong size"))?;

        let reserved: [u8; VOLUME_DESCRIPTOR_RESERVED_SIZE] = *descriptor.reserved_region();
        let virtualization = BlockVirtualization::load(&reserved)?;

        let layout = FatLayout {
            fat_region_offset: fat_region_offset(),
            clusters_per_block: descriptor.clusters_per_block(),
        };
        let fat = FatDataManager::new(fat_file.clone(), layout, descriptor.max_blocks.get());
        let cluster_file = Arc::new(self.file_system.open(&self.cluster_path)?);
        let cluster_store = ClusterDataStore::new(cluster_file, descriptor.cluster_size.get(), DIRECTORY_BLOCK_INDEX);

        *self.descriptor.write().unwrap() = descriptor;
        *self.control.write().unwrap() = control;
        *self.virtualization.write().unwrap() = virtualization;
        let _ = self.fat.set(fat);
        let _ = self.cluster_store.set(cluster_store);
        let _ = self.fat_file.set(fat_file);
        Ok(())
    }

    fn create_volume(&self, config: &VolumeConfig) -> Result<()> {
        config.validate()?;
        let descriptor = VolumeDescriptor::new(config);
        let control = VolumeControlData::zeroed();
        let virtualization = BlockVirtualization::new_identity(0);

        let fat_file = Arc::new(self.file_system.create(&self.fat_path)?);
        fat_file.write_at(0, descriptor.as_bytes())?;
        fat_file.write_at(CONTROL_DATA_OFFSET, control.as_bytes())?;
        let mut reserved = [0u8; VOLUME_DESCRIPTOR_RESERVED_SIZE];
        virtualization.store(&mut reserved);
        let reserved_offset = core::mem::size_of::<VolumeDescriptor>() as u64 - VOLUME_DESCRIPTOR_RESERVED_SIZE as u64;
        fat_file.write_at(reserved_offset, &reserved)?;
        fat_file.flush()?;

        let layout = FatLayout {
            fat_region_offset: fat_region_offset(),
            clusters_per_block: descriptor.clusters_per_block(),
        };
        let fat = FatDataManager::new(fat_file.clone(), layout, descriptor.max_blocks.get());

        let cluster_file = Arc::new(self.file_system.create(&self.cluster_path)?);
        cluster_file.flush()?;
        let cluster_store = ClusterDataStore::new(cluster_file, descriptor.cluster_size.get(), DIRECTORY_BLOCK_INDEX);

        *self.descriptor.write().unwrap() = descriptor;
        *self.control.write().unwrap() = control;
        *self.virtualization.write().unwrap() = virtualization;
        let _ = self.fat.set(fat);
        let _ = self.cluster_store.set(cluster_store);
        let _ = self.fat_file.set(fat_file);

        self.allocate_block_by_index(DIRECTORY_BLOCK_INDEX)?;
        self.set_state(FileSystemState::Created);
        self.set_state(FileSystemState::Ready);
        Ok(())
    }

    fn remove_volume(&self) -> Result<()> {
        self.file_system.remove(&self.fat_path)?;
        self.file_system.remove(&self.cluster_path)?;
        Ok(())
    }

    fn fat(&self) -> &FatDataManager<FS::File> {
        self.fat.get().expect("volume manager used before create/open")
    }

    fn cluster_store(&self) -> &ClusterDataStore<FS::File> {
        self.cluster_store.get().expect("volume manager used before create/open")
    }

    pub fn clusters_per_block(&self) -> u32 {
        self.descriptor.read().unwrap().clusters_per_block()
    }

    pub fn cluster_size(&self) -> u32 {
        self.descriptor.read().unwrap().cluster_size.get()
    }

    fn max_blocks(&self) -> u32 {
        self.descriptor.read().unwrap().max_blocks.get()
    }

    /// Allocates the FAT block and data block at `block_index`, if not
    /// already allocated. Only legal to grow one block past the current
    /// count at a time (enforced by [`FatDataManager::allocate_fat_block`]).
    pub fn allocate_block_by_index(&self, block_index: u32) -> Result<()> {
        if block_index < self.fat().current_block_count() {
            return Ok(());
        }
        if block_index >= self.max_blocks() {
            return Err(Error::Fs(FsError::Transaction(TransactionKind::CannotExpand)));
        }
        let _guard = self.expansion_mutex.lock().unwrap();
        if block_index < self.fat().current_block_count() {
            return Ok(());
        }
        for pending in self.fat().current_block_count()..=block_index {
            self.fat().allocate_fat_block(pending)?;
            self.control.write().unwrap().allocated_fat_blocks_count = (pending + 1).into();
            self.control.write().unwrap().allocated_data_blocks_count = (pending + 1).into();
        }
        Ok(())
    }

    fn block_index_of(&self, cluster: ClusterIndex) -> u32 {
        cluster / self.clusters_per_block()
    }

    pub fn get_fat_cell(&self, cluster: ClusterIndex) -> Result<FatCellValue> {
        self.fat().get(cluster)
    }

    pub fn set_fat_cell(&self, cluster: ClusterIndex, value: FatCellValue) -> Result<()> {
        let block_index = self.block_index_of(cluster);
        self.allocate_block_by_index(block_index)?;
        let log = &self.transaction_log;
        self.fat().set_with_pre_image_hook(cluster, value, |block_index, pre_image| {
            if log.is_in_transaction() {
                let _ = log.log_fat_block_change(block_index, pre_image);
            }
        })
    }

    pub fn read_cluster(&self, cluster: ClusterIndex) -> Result<Vec<u8>> {
        let block_index = self.block_index_of(cluster);
        let offset = self.physical_cluster_offset(cluster, block_index, false)?;
        self.cluster_store().read(cluster, block_index, offset, self.fat())
    }

    pub fn write_cluster(&self, cluster: ClusterIndex, data: &[u8]) -> Result<()> {
        let block_index = self.block_index_of(cluster);
        let in_transaction = self.transaction_log.is_in_transaction();
        if block_index == DIRECTORY_BLOCK_INDEX && in_transaction {
            let offset = self.physical_cluster_offset(cluster, block_index, false)?;
            let pre_image = self.cluster_store().read(cluster, block_index, offset, self.fat())?;
            self.transaction_log.log_directory_cluster_change(cluster, &pre_image)?;
        } else if in_transaction {
            self.transaction_log.log_file_cluster_change(cluster)?;
        }
        // Writes to a virtual file-data block always land on the scratch
        // physical block; only directory writes touch their block directly.
        let offset = self.physical_cluster_offset(cluster, block_index, true)?;
        self.cluster_store().write(cluster, block_index, offset, data, self.fat(), in_transaction)
    }

    fn physical_cluster_offset(&self, cluster: ClusterIndex, block_index: u32, for_write: bool) -> Result<u64> {
        let clusters_per_block = self.clusters_per_block();
        let local = cluster % clusters_per_block;
        let physical_block = if block_index == DIRECTORY_BLOCK_INDEX {
            block_index
        } else if for_write {
            self.virtualization.read().unwrap().physical_for_write(block_index)
        } else {
            self.virtualization.read().unwrap().physical_for_read(block_index)?
        };
        let bytes_per_block = clusters_per_block as u64 * self.cluster_size() as u64;
        Ok(physical_block as u64 * bytes_per_block + local as u64 * self.cluster_size() as u64)
    }

    fn is_file_data_block(&self, block_index: u32) -> bool {
        block_index >= FIRST_FILE_DATA_BLOCK_INDEX
    }

    /// The block the placement policy flagged as worth defragmenting, if
    /// any, as of the last `start_transaction`.
    pub fn degraded_block(&self) -> Option<u32> {
        self.placement.lock().unwrap().degraded_block()
    }

    /// Every cluster index that belongs to `block_index`, for a caller
    /// walking a degraded block's contents to relocate them.
    pub fn clusters_in_block(&self, block_index: u32) -> Vec<ClusterIndex> {
        let clusters_per_block = self.clusters_per_block();
        let start = block_index * clusters_per_block;
        (start..start + clusters_per_block).collect()
    }

    pub fn find_free_cluster(&self, use_file_data: bool) -> Result<ClusterIndex> {
        if use_file_data {
            let preferred = self.placement.lock().unwrap().preferred_block();
            if let Some(block_index) = preferred {
                if self.is_file_data_block(block_index) && block_index < self.fat().current_block_count() {
                    if let Some(cluster) = self.fat().try_find_free_cluster_in_block(block_index)? {
                        return Ok(cluster);
                    }
                }
            }
        }
        if let Some(cluster) = self
            .fat()
            .try_find_free_cluster_in_allocated(use_file_data, FIRST_FILE_DATA_BLOCK_INDEX)?
        {
            return Ok(cluster);
        }
        if !use_file_data {
            return Err(Error::Fs(FsError::NoSpace));
        }
        let next_block = self.fat().current_block_count();
        self.allocate_block_by_index(next_block)?;
        self.fat()
            .try_find_free_cluster_in_block(next_block)?
            .ok_or(Error::Fs(FsError::NoSpace))
    }

    pub fn free_cluster_count(&self) -> Result<u32> {
        self.fat().get_count_free_clusters()
    }

    pub fn flush(&self) -> Result<()> {
        self.fat().flush()?;
        self.cluster_store().flush()?;
        self.fat_file.get().map(|f| f.flush()).transpose()?;
        Ok(())
    }

    pub fn is_in_transaction(&self) -> bool {
        self.transaction_log.is_in_transaction()
    }

    /// Re-entrant: a thread that already owns the transaction gets `Ok(false)`
    /// ("already in transaction") instead of an error.
    pub fn start_transaction(&self) -> Result<bool> {
        let this_thread = std::thread::current().id();
        let mut owner = self.transaction_owner.lock().unwrap();
        if *owner == Some(this_thread) {
            *self.transaction_depth.lock().unwrap() += 1;
            return Ok(false);
        }
        if owner.is_some() {
            return Err(Error::Fs(FsError::Transaction(TransactionKind::AlreadyStarted)));
        }
        self.flush()?;
        self.transaction_log.start()?;
        *owner = Some(this_thread);
        *self.transaction_depth.lock().unwrap() = 1;

        let snapshot = self.fat().block_occupancy_snapshot()?;
        let occupancy: Vec<BlockOccupancy<'_>> = snapshot
            .iter()
            .map(|(block_index, free_clusters)| BlockOccupancy {
                block_index: *block_index,
                free_clusters,
            })
            .collect();
        self.placement.lock().unwrap().prepare_for_write_transaction(&occupancy);

        Ok(true)
    }

    pub fn commit_transaction(&self) -> Result<()> {
        let this_thread = std::thread::current().id();
        {
            let owner = self.transaction_owner.lock().unwrap();
            if *owner != Some(this_thread) {
                return Err(Error::Fs(FsError::Transaction(TransactionKind::NotStarted)));
            }
        }
        {
            let mut depth = self.transaction_depth.lock().unwrap();
            *depth -= 1;
            if *depth > 0 {
                return Ok(());
            }
        }

        let virtualization = self.virtualization.read().unwrap();
        let mut reserved = [0u8; VOLUME_DESCRIPTOR_RESERVED_SIZE];
        virtualization.store(&mut reserved);
        drop(virtualization);

        let commit_result = self.transaction_log.commit(0, 0, &reserved);
        match commit_result {
            Ok(()) => {
                self.flush()?;
                self.transaction_log.cleanup()?;
            }
            Err(err) => {
                log::error!("failed to finalize transaction, attempting recovery: {err}");
                self.try_restore_from_transaction_log()?;
            }
        }
        *self.transaction_owner.lock().unwrap() = None;
        Ok(())
    }

    fn try_restore_from_transaction_log(&self) -> Result<()> {
        let fat_block_size = self.clusters_per_block() as usize * core::mem::size_of::<crate::fat::FatCellRecord>();
        let cluster_size = self.cluster_size() as usize;
        let fat = self.fat();
        let cluster_store = self.cluster_store();
        let restored = self.transaction_log.try_restore(
            |block_index, pre_image| fat.restore_block(block_index, pre_image),
            |cluster, pre_image| {
                let block_index = self.block_index_of(cluster);
                let offset = self.physical_cluster_offset(cluster, block_index, false)?;
                cluster_store.write(cluster, block_index, offset, pre_image, fat, false)
            },
            fat_block_size,
            cluster_size,
            VOLUME_DESCRIPTOR_RESERVED_SIZE,
            cluster_store.buffer_pool(),
        )?;
        if restored {
            self.transaction_log.cleanup()?;
        }
        Ok(())
    }

    /// Read-only scan: walks every allocated FAT block comparing the free
    /// bit set it derives against each cell's own `free` flag
    /// ([`FreeBitMismatch`](ConsistencyIssue::FreeBitMismatch)), flags
    /// self-looping cells ([`ChainCycle`](ConsistencyIssue::ChainCycle)),
    /// and flags chain starts whose owning location points outside the
    /// directory block's cluster range
    /// ([`OrphanChain`](ConsistencyIssue::OrphanChain)). Never mutates the
    /// volume; callers decide what to do with issues.
    pub fn check_consistency(&self) -> Result<Vec<ConsistencyIssue>> {
        let mut issues = Vec::new();
        let count = self.fat().current_block_count();
        let clusters_per_block = self.clusters_per_block();
        for block_index in 0..count {
            for local in 0..clusters_per_block {
                let cluster = block_index * clusters_per_block + local;
                let cell = self.fat().get(cluster)?;
                if let Some(next) = cell.next_cluster() {
                    if next == cluster {
                        issues.push(ConsistencyIssue::ChainCycle { cluster });
                    }
                }
                if cell.is_start {
                    if let Some(location) = cell.start_location() {
                        if location.descriptor_cluster_index >= clusters_per_block {
                            issues.push(ConsistencyIssue::OrphanChain { start_cluster: cluster });
                        }
                    }
                }
            }
        }
        for (cluster, marked_free, cell_is_free) in self.fat().verify_free_bit_consistency()? {
            issues.push(ConsistencyIssue::FreeBitMismatch {
                cluster,
                marked_free,
                cell_is_free,
            });
        }
        Ok(issues)
    }
}
