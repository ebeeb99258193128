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

//! Write-ahead log of FAT-block, directory-cluster and block-virtualization
//! changes. A transaction's commit point is the rename of the temporary log
//! file to its final name; recovery at the next open replays whatever a
//! finalized-but-not-yet-cleaned-up log describes.

use std::collections::HashSet;
use std::sync::Mutex;

use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use splitfat_err::{Error, FsError, Result, TransactionKind};
use splitfat_io::{ByteFile, ByteFileSystem};

use crate::buffer_pool::ClusterBufferPool;
use crate::fat::ClusterIndex;

const TEMP_SUFFIX: &str = "_trans_temp";
const FINAL_SUFFIX: &str = "_trans";

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEventType {
    FatBlockChanged = 0,
    DirectoryClusterChanged = 1,
    FileClusterChanged = 2,
    BlockVirtualizationTableChanged = 3,
}

impl TransactionEventType {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::FatBlockChanged),
            1 => Some(Self::DirectoryClusterChanged),
            2 => Some(Self::FileClusterChanged),
            3 => Some(Self::BlockVirtualizationTableChanged),
            _ => None,
        }
    }
}

/// Fixed-size header preceding each logged payload. `crc` is the CRC of the
/// data before the change, for diagnostics; it is not verified on restore.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct TransactionEventRecord {
    event_type: U32,
    index: U32,
    crc: U32,
    _reserved: U32,
}

struct PendingState {
    fat_blocks_logged: HashSet<u32>,
    directory_clusters_logged: HashSet<ClusterIndex>,
    file_clusters_logged: HashSet<ClusterIndex>,
    in_transaction: bool,
    write_position: u64,
}

impl PendingState {
    fn new() -> Self {
        Self {
            fat_blocks_logged: HashSet::new(),
            directory_clusters_logged: HashSet::new(),
            file_clusters_logged: HashSet::new(),
            in_transaction: false,
            write_position: 0,
        }
    }
}

/// Owns the temporary/final log file names for one volume; the volume
/// manager drives `start`/`commit`/`restore` around its own flushes.
pub struct TransactionLog<FS: ByteFileSystem> {
    file_system: FS,
    base_path: String,
    temp_file: Mutex<Option<FS::File>>,
    state: Mutex<PendingState>,
}

impl<FS: ByteFileSystem> TransactionLog<FS> {
    pub fn new(file_system: FS, base_path: impl Into<String>) -> Self {
        Self {
            file_system,
            base_path: base_path.into(),
            temp_file: Mutex::new(None),
            state: Mutex::new(PendingState::new()),
        }
    }

    fn temp_path(&self) -> String {
        format!("{}{}", self.base_path, TEMP_SUFFIX)
    }

    fn final_path(&self) -> String {
        format!("{}{}", self.base_path, FINAL_SUFFIX)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.state.lock().unwrap().in_transaction
    }

    /// Starts a transaction. The caller must have already flushed the
    /// volume before calling this.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.in_transaction {
            return Err(Error::Fs(FsError::Transaction(TransactionKind::AlreadyStarted)));
        }
        let file = self.file_system.create(&self.temp_path())?;
        file.set_size(0)?;
        *self.temp_file.lock().unwrap() = Some(file);
        state.fat_blocks_logged.clear();
        state.directory_clusters_logged.clear();
        state.file_clusters_logged.clear();
        state.write_position = 0;
        state.in_transaction = true;
        Ok(())
    }

    fn write_event(&self, event_type: TransactionEventType, index: u32, crc: u32, payload: &[u8]) -> Result<()> {
        let guard = self.temp_file.lock().unwrap();
        let file = guard.as_ref().ok_or_else(|| {
            Error::Fs(FsError::Transaction(TransactionKind::NotStarted))
        })?;
        let mut state = self.state.lock().unwrap();
        let record = TransactionEventRecord {
            event_type: (event_type as u32).into(),
            index: index.into(),
            crc: crc.into(),
            _reserved: 0.into(),
        };
        let position = state.write_position;
        file.write_at(position, record.as_bytes())?;
        file.write_at(position + core::mem::size_of::<TransactionEventRecord>() as u64, payload)?;
        state.write_position = position + core::mem::size_of::<TransactionEventRecord>() as u64 + payload.len() as u64;
        Ok(())
    }

    /// Logs the pre-image of a FAT block the first time it is touched this
    /// transaction.
    pub fn log_fat_block_change(&self, block_index: u32, pre_image: &[u8]) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.in_transaction {
                return Err(Error::Fs(FsError::Transaction(TransactionKind::NotStarted)));
            }
            if !state.fat_blocks_logged.insert(block_index) {
                return Ok(());
            }
        }
        self.write_event(TransactionEventType::FatBlockChanged, block_index, 0, pre_image)
    }

    /// Logs the pre-image of a directory cluster the first time it is
    /// touched this transaction.
    pub fn log_directory_cluster_change(&self, cluster: ClusterIndex, pre_image: &[u8]) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.in_transaction {
                return Err(Error::Fs(FsError::Transaction(TransactionKind::NotStarted)));
            }
            if !state.directory_clusters_logged.insert(cluster) {
                return Ok(());
            }
        }
        self.write_event(TransactionEventType::DirectoryClusterChanged, cluster, 0, pre_image)
    }

    /// File-cluster changes are tracked (for dedup / future CRC use) but
    /// never given a replayable payload: file data is not restored on
    /// crash recovery, only FAT and directory metadata are.
    pub fn log_file_cluster_change(&self, cluster: ClusterIndex) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.in_transaction {
            return Err(Error::Fs(FsError::Transaction(TransactionKind::NotStarted)));
        }
        state.file_clusters_logged.insert(cluster);
        Ok(())
    }

    pub fn log_block_virtualization_change(&self, active_descriptor_index: u32, crc: u32, extra_params: &[u8]) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if !state.in_transaction {
                return Err(Error::Fs(FsError::Transaction(TransactionKind::NotStarted)));
            }
        }
        self.write_event(
            TransactionEventType::BlockVirtualizationTableChanged,
            active_descriptor_index,
            crc,
            extra_params,
        )
    }

    /// Commits: logs the final virtualization snapshot, closes the temp
    /// file, and renames it to its final name. The rename is the
    /// linearization point; a crash after it leaves a finalized log that
    /// `restore` will find and replay, a crash before it leaves nothing.
    pub fn commit(&self, active_descriptor_index: u32, crc: u32, extra_params: &[u8]) -> Result<()> {
        if !self.is_in_transaction() {
            return Err(Error::Fs(FsError::Transaction(TransactionKind::NotStarted)));
        }
        self.log_block_virtualization_change(active_descriptor_index, crc, extra_params)?;
        {
            let mut guard = self.temp_file.lock().unwrap();
            if let Some(mut file) = guard.take() {
                file.flush()?;
                file.close()?;
            }
        }
        self.file_system.rename(&self.temp_path(), &self.final_path())?;
        self.state.lock().unwrap().in_transaction = false;
        Ok(())
    }

    /// Deletes the finalized log once the caller has durably applied (or
    /// confirmed already-applied) every logged change.
    pub fn cleanup(&self) -> Result<()> {
        self.file_system.remove(&self.final_path())
    }

    /// Replays whatever a finalized log describes via the supplied
    /// callbacks. Returns `Ok(false)` if no finalized log exists.
    pub fn try_restore(
        &self,
        mut restore_fat_block: impl FnMut(u32, &[u8]) -> Result<()>,
        mut restore_directory_cluster: impl FnMut(ClusterIndex, &[u8]) -> Result<()>,
        fat_block_byte_size: usize,
        cluster_byte_size: usize,
        virtualization_extra_params_size: usize,
        cluster_buffer_pool: &ClusterBufferPool,
    ) -> Result<bool> {
        if !self.file_system.exists(&self.final_path())? {
            return Ok(false);
        }
        let file = self.file_system.open(&self.final_path())?;
        let size = file.get_size()?;
        let mut position = 0u64;
        let header_size = core::mem::size_of::<TransactionEventRecord>() as u64;
        while position + header_size <= size {
            let mut header_bytes = vec![0u8; header_size as usize];
            file.read_at(position, &mut header_bytes)?;
            let record = TransactionEventRecord::read_from_bytes(&header_bytes)
                .map_err(|_| Error::Fs(FsError::Transaction(TransactionKind::RestoreFailed)))?;
            position += header_size;
            let event_type = TransactionEventType::from_u32(record.event_type.get())
                .ok_or_else(|| Error::Fs(FsError::Transaction(TransactionKind::RestoreFailed)))?;
            match event_type {
                TransactionEventType::FatBlockChanged => {
                    let mut payload = vec![0u8; fat_block_byte_size];
                    file.read_at(position, &mut payload)?;
                    restore_fat_block(record.index.get(), &payload)?;
                    position += fat_block_byte_size as u64;
                }
                TransactionEventType::DirectoryClusterChanged => {
                    let mut payload = cluster_buffer_pool.acquire();
                    file.read_at(position, &mut payload)?;
                    restore_directory_cluster(record.index.get(), &payload)?;
                    position += cluster_byte_size as u64;
                }
                TransactionEventType::BlockVirtualizationTableChanged => {
                    // Logged for diagnostics; the descriptor pair in the
                    // volume header is already self-describing and is not
                    // replayed from here.
                    position += virtualization_extra_params_size as u64;
                }
                TransactionEventType::FileClusterChanged => {
                    // No payload was ever written for this event.
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitfat_io_std::StdByteFileSystem;

    #[test]
    fn start_then_commit_leaves_final_file_and_clears_temp() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("volume").to_str().unwrap().to_string();
        let fs = StdByteFileSystem;
        let log = TransactionLog::new(fs.clone(), base);

        log.start().unwrap();
        log.log_fat_block_change(0, &[1u8; 8]).unwrap();
        log.commit(0, 0, &[]).unwrap();

        assert!(!log.is_in_transaction());
        assert!(log.file_system.exists(&log.final_path()).unwrap());
        assert!(!log.file_system.exists(&log.temp_path()).unwrap());
    }

    #[test]
    fn restore_replays_logged_fat_block_pre_image() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("volume").to_str().unwrap().to_string();
        let fs = StdByteFileSystem;
        let log = TransactionLog::new(fs.clone(), base);

        let pre_image = vec![0xAAu8; 16];
        log.start().unwrap();
        log.log_fat_block_change(5, &pre_image).unwrap();
        log.commit(0, 0, &[]).unwrap();

        let mut restored_block = None;
        let pool = ClusterBufferPool::new(0);
        let found = log
            .try_restore(
                |block_index, bytes| {
                    restored_block = Some((block_index, bytes.to_vec()));
                    Ok(())
                },
                |_, _| Ok(()),
                16,
                0,
                512,
                &pool,
            )
            .unwrap();
        assert!(found);
        assert_eq!(restored_block, Some((5, pre_image)));
    }

    #[test]
    fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("volume").to_str().unwrap().to_string();
        let log = TransactionLog::new(StdByteFileSystem, base);
        log.start().unwrap();
        assert!(log.start().is_err());
    }
}
