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

//! Cluster-data file access: positioned reads/writes, CRC-16 tagging on
//! write, and a small read-through cache for directory clusters (the only
//! ones re-read often enough to be worth caching).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use splitfat_err::{CorruptionKind, Error, FsError};
use splitfat_io::ByteFile;

use crate::buffer_pool::ClusterBufferPool;
use crate::crc::Crc16;
use crate::fat::{ClusterIndex, FatDataManager};

/// A cached directory cluster's bytes plus whether they still match disk.
struct CachedCluster {
    data: Vec<u8>,
    in_sync_with_disk: bool,
}

pub struct ClusterDataStore<F: ByteFile> {
    file: Arc<F>,
    cluster_size: u32,
    directory_block_index: u32,
    directory_cache: Mutex<HashMap<ClusterIndex, CachedCluster>>,
    buffer_pool: ClusterBufferPool,
    /// Directory-cluster writes made during an active transaction: held
    /// here instead of on disk until the transaction commits, so a crash
    /// before commit leaves the volume exactly as it was before the write
    /// (the durable write-through only happens via `flush`).
    pending_directory_writes: Mutex<HashMap<ClusterIndex, (u64, Vec<u8>)>>,
}

impl<F: ByteFile> ClusterDataStore<F> {
    pub fn new(file: Arc<F>, cluster_size: u32, directory_block_index: u32) -> Self {
        Self {
            file,
            cluster_size,
            directory_block_index,
            directory_cache: Mutex::new(HashMap::new()),
            buffer_pool: ClusterBufferPool::new(cluster_size as usize),
            pending_directory_writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer_pool(&self) -> &ClusterBufferPool {
        &self.buffer_pool
    }

    fn is_directory_cluster(&self, block_index: u32) -> bool {
        block_index == self.directory_block_index
    }

    pub fn read(
        &self,
        cluster: ClusterIndex,
        block_index: u32,
        offset: u64,
        fat: &FatDataManager<F>,
    ) -> splitfat_err::Result<Vec<u8>> {
        if self.is_directory_cluster(block_index) {
            let mut cache = self.directory_cache.lock().unwrap();
            if let Some(entry) = cache.get(&cluster) {
                if entry.in_sync_with_disk {
                    return Ok(entry.data.clone());
                }
            }
            let mut buf = self.buffer_pool.acquire();
            self.file.read_at(offset, &mut buf)?;
            self.verify_crc_on_read(&buf, cluster, fat)?;
            let data = buf.to_vec();
            cache.insert(
                cluster,
                CachedCluster {
                    data: data.clone(),
                    in_sync_with_disk: true,
                },
            );
            Ok(data)
        } else {
            let mut buf = self.buffer_pool.acquire();
            self.file.read_at(offset, &mut buf)?;
            self.verify_crc_on_read(&buf, cluster, fat)?;
            Ok(buf.to_vec())
        }
    }

    /// Writes one cluster. A directory-cluster write made while
    /// `in_transaction` is true only updates the cache and the pending-write
    /// buffer that `flush` drains at commit; it never touches disk directly,
    /// so an interrupted transaction cannot leave a partial write durable.
    pub fn write(
        &self,
        cluster: ClusterIndex,
        block_index: u32,
        offset: u64,
        data: &[u8],
        fat: &FatDataManager<F>,
        in_transaction: bool,
    ) -> splitfat_err::Result<()> {
        if data.len() != self.cluster_size as usize {
            return Err(Error::invalid_argument("cluster write must cover exactly one cluster"));
        }
        self.update_crc_on_write(data, cluster, fat)?;
        if self.is_directory_cluster(block_index) {
            let mut cache = self.directory_cache.lock().unwrap();
            cache.insert(
                cluster,
                CachedCluster {
                    data: data.to_vec(),
                    in_sync_with_disk: true,
                },
            );
            if in_transaction {
                self.pending_directory_writes
                    .lock()
                    .unwrap()
                    .insert(cluster, (offset, data.to_vec()));
                return Ok(());
            }
            self.pending_directory_writes.lock().unwrap().remove(&cluster);
        }
        self.file.write_at(offset, data)
    }

    /// Invalidates a directory cluster's cache entry without touching disk,
    /// used when restoring a logged pre-image during transaction recovery.
    pub fn invalidate_directory_cache(&self, cluster: ClusterIndex) {
        let mut cache = self.directory_cache.lock().unwrap();
        if let Some(entry) = cache.get_mut(&cluster) {
            entry.in_sync_with_disk = false;
        }
    }

    fn verify_crc_on_read(&self, data: &[u8], cluster: ClusterIndex, fat: &FatDataManager<F>) -> splitfat_err::Result<()> {
        let (expected, initialized) = fat.crc_tag(cluster)?;
        if !initialized {
            return Ok(());
        }
        let actual = Crc16::calculate(data, 0);
        if actual != expected {
            log::error!("CRC mismatch for cluster {cluster}: expected {expected:#x}, got {actual:#x}");
            return Err(Error::Fs(FsError::Corruption(CorruptionKind::ClusterCrc { cluster })));
        }
        Ok(())
    }

    fn update_crc_on_write(&self, data: &[u8], cluster: ClusterIndex, fat: &FatDataManager<F>) -> splitfat_err::Result<()> {
        let crc = Crc16::calculate(data, 0);
        fat.set_tag(cluster, crc, true)
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// Writes through any directory-cluster data deferred by an in-progress
    /// transaction, then flushes the host file.
    pub fn flush(&self) -> splitfat_err::Result<()> {
        let pending: Vec<_> = self.pending_directory_writes.lock().unwrap().drain().collect();
        for (_, (offset, data)) in pending {
            self.file.write_at(offset, &data)?;
        }
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::FatLayout;
    use splitfat_io_std::StdByteFileSystem;
    use splitfat_io::ByteFileSystem;

    fn setup() -> (Arc<splitfat_io_std::StdByteFile>, FatDataManager<splitfat_io_std::StdByteFile>) {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdByteFileSystem;
        let path = dir.path().join("fat.bin");
        let file = Arc::new(fs.create(path.to_str().unwrap()).unwrap());
        let layout = FatLayout {
            fat_region_offset: 0,
            clusters_per_block: 16,
        };
        let fat = FatDataManager::new(file.clone(), layout, 4);
        fat.allocate_fat_block(0).unwrap();
        (file, fat)
    }

    #[test]
    fn write_then_read_round_trips_and_tags_crc() {
        let (file, fat) = setup();
        let store = ClusterDataStore::new(file, 64, 0);
        let data = vec![7u8; 64];
        store.write(0, 0, 4096, &data, &fat, false).unwrap();
        let read_back = store.read(0, 0, 4096, &fat).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn corrupted_directory_cluster_fails_crc_check() {
        let (file, fat) = setup();
        let store = ClusterDataStore::new(file.clone(), 64, 0);
        let data = vec![7u8; 64];
        store.write(0, 0, 4096, &data, &fat, false).unwrap();
        // Tamper with the disk contents directly, bypassing the store and its cache.
        let tampered = vec![9u8; 64];
        file.write_at(4096, &tampered).unwrap();
        store.invalidate_directory_cache(0);
        let err = store.read(0, 0, 4096, &fat).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn in_transaction_write_updates_cache_but_not_disk_until_flush() {
        let (file, fat) = setup();
        let store = ClusterDataStore::new(file.clone(), 64, 0);
        let original = vec![1u8; 64];
        store.write(0, 0, 4096, &original, &fat, false).unwrap();

        let updated = vec![2u8; 64];
        store.write(0, 0, 4096, &updated, &fat, true).unwrap();

        // The cache already reflects the pending write...
        assert_eq!(store.read(0, 0, 4096, &fat).unwrap(), updated);
        // ...but disk does not, until flush drains the deferred write.
        let mut on_disk = vec![0u8; 64];
        file.read_at(4096, &mut on_disk).unwrap();
        assert_eq!(on_disk, original);

        store.flush().unwrap();
        let mut on_disk = vec![0u8; 64];
        file.read_at(4096, &mut on_disk).unwrap();
        assert_eq!(on_disk, updated);
    }
}
