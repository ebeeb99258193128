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

//! On-disk volume header: `VolumeDescriptor`, `VolumeControlData` and the
//! per-FAT-block `BlockControlHeader`. These sit at fixed offsets at the
//! front of the FAT file.

use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use splitfat_err::{Error, FsError};

pub const VOLUME_MAGIC: u32 = 0x5FA7_C0DE;
pub const CURRENT_VERSION: u32 = 7;
pub const LEGACY_MAX_VERSION_REQUIRING_WIPE: u32 = 4;
pub const MIN_VERSION_WITH_SCRATCH_BLOCK: u32 = 5;

pub const DEFAULT_CLUSTER_SIZE: u32 = 8 * 1024;
pub const DEFAULT_BYTES_PER_BLOCK: u32 = 256 * 1024 * 1024;
/// 24 file-data blocks plus the directory block.
pub const DEFAULT_MAX_BLOCKS: u32 = 25;
pub const DIRECTORY_BLOCK_INDEX: u32 = 0;
pub const FIRST_FILE_DATA_BLOCK_INDEX: u32 = 1;

pub const VOLUME_DESCRIPTOR_RESERVED_SIZE: usize = 512;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeFlags: u32 {
        const SINGLE_FILE = 0x1;
        const SCRATCH_BLOCK_SUPPORTED = 0x2;
    }
}

/// Fixed header at offset 0 of the FAT file.
///
/// The trailing 512-byte reserved region overlays the two
/// [`crate::block_virtualization::BlockVirtualizationDescriptor`]s; it is
/// declared here as raw bytes and reinterpreted by that module so this
/// struct stays a single source of truth for the on-disk layout.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct VolumeDescriptor {
    pub magic: U32,
    pub version: U32,
    pub cluster_size: U32,
    pub bytes_per_block: U32,
    pub max_blocks: U32,
    pub first_file_data_block_index: U32,
    pub flags: U32,
    reserved: [u8; VOLUME_DESCRIPTOR_RESERVED_SIZE],
}

impl VolumeDescriptor {
    pub fn new(config: &VolumeConfig) -> Self {
        let mut flags = VolumeFlags::empty();
        if config.single_file {
            flags |= VolumeFlags::SINGLE_FILE;
        }
        if config.scratch_block_supported {
            flags |= VolumeFlags::SCRATCH_BLOCK_SUPPORTED;
        }
        Self {
            magic: VOLUME_MAGIC.into(),
            version: CURRENT_VERSION.into(),
            cluster_size: config.cluster_size.into(),
            bytes_per_block: config.bytes_per_block.into(),
            max_blocks: config.max_blocks.into(),
            first_file_data_block_index: FIRST_FILE_DATA_BLOCK_INDEX.into(),
            flags: flags.bits().into(),
            reserved: [0u8; VOLUME_DESCRIPTOR_RESERVED_SIZE],
        }
    }

    /// Only the magic is checked here; deeper checks happen during recovery.
    pub fn verify_consistency(&self) -> splitfat_err::Result<()> {
        if self.magic.get() != VOLUME_MAGIC {
            log::error!("volume descriptor magic mismatch: {:#x}", self.magic.get());
            return Err(Error::Fs(FsError::Corruption(
                splitfat_err::CorruptionKind::VolumeMagic,
            )));
        }
        Ok(())
    }

    pub fn clusters_per_block(&self) -> u32 {
        self.bytes_per_block.get() / self.cluster_size.get()
    }

    pub fn flags(&self) -> VolumeFlags {
        VolumeFlags::from_bits_truncate(self.flags.get())
    }

    pub fn scratch_block_supported(&self) -> bool {
        self.flags().contains(VolumeFlags::SCRATCH_BLOCK_SUPPORTED)
    }

    pub fn reserved_region(&self) -> &[u8; VOLUME_DESCRIPTOR_RESERVED_SIZE] {
        &self.reserved
    }

    pub fn reserved_region_mut(&mut self) -> &mut [u8; VOLUME_DESCRIPTOR_RESERVED_SIZE] {
        &mut self.reserved
    }

    /// Upgrades an on-disk v6 descriptor to the current version, rewriting
    /// `max_blocks` and clamping the allocated counts in `control`.
    pub fn upgrade_from_v6(&mut self, control: &mut VolumeControlData) {
        self.version = CURRENT_VERSION.into();
        self.max_blocks = DEFAULT_MAX_BLOCKS.into();
        self.flags = (self.flags().bits() | VolumeFlags::SCRATCH_BLOCK_SUPPORTED.bits()).into();
        let max_blocks = self.max_blocks.get();
        if control.allocated_fat_blocks_count.get() > max_blocks {
            control.allocated_fat_blocks_count = max_blocks.into();
        }
        if control.allocated_data_blocks_count.get() > max_blocks {
            control.allocated_data_blocks_count = max_blocks.into();
        }
    }
}

/// Ephemeral builder used only when a brand-new volume is created; the
/// durable configuration record is [`VolumeDescriptor`] itself.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub cluster_size: u32,
    pub bytes_per_block: u32,
    pub max_blocks: u32,
    pub single_file: bool,
    pub scratch_block_supported: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            bytes_per_block: DEFAULT_BYTES_PER_BLOCK,
            max_blocks: DEFAULT_MAX_BLOCKS,
            single_file: false,
            scratch_block_supported: true,
        }
    }
}

impl VolumeConfig {
    pub fn validate(&self) -> splitfat_err::Result<()> {
        if self.cluster_size == 0 || !self.cluster_size.is_power_of_two() {
            return Err(Error::invalid_argument("cluster size must be a power of two"));
        }
        if self.bytes_per_block == 0 || self.bytes_per_block % self.cluster_size != 0 {
            return Err(Error::invalid_argument(
                "bytes per block must be a non-zero multiple of cluster size",
            ));
        }
        if self.max_blocks == 0 {
            return Err(Error::invalid_argument("max blocks must be non-zero"));
        }
        if self.max_blocks as usize > crate::block_virtualization::MAX_VIRTUAL_BLOCKS {
            return Err(Error::invalid_argument(
                "max blocks exceeds the block-virtualization descriptor capacity",
            ));
        }
        let records_per_cluster = self.cluster_size / crate::fat::FILE_DESCRIPTOR_RECORD_SIZE;
        if records_per_cluster > crate::fat::MAX_RECORDS_PER_CLUSTER {
            return Err(Error::invalid_argument(
                "cluster size yields more file-descriptor records per cluster than the chain cell's 7-bit location field can address",
            ));
        }
        Ok(())
    }
}

/// Immediately follows [`VolumeDescriptor`] in the FAT file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct VolumeControlData {
    pub allocated_fat_blocks_count: U32,
    pub allocated_data_blocks_count: U32,
    pub total_data_clusters_count: U32,
}

impl VolumeControlData {
    pub fn zeroed() -> Self {
        Self {
            allocated_fat_blocks_count: 0.into(),
            allocated_data_blocks_count: 0.into(),
            total_data_clusters_count: 0.into(),
        }
    }
}

/// Reserved 16-byte per-FAT-block header. Reading/writing it is disabled by
/// the reference configuration; the bytes are reserved and always zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BlockControlHeader {
    reserved: [u8; 16],
}

impl Default for BlockControlHeader {
    fn default() -> Self {
        Self { reserved: [0u8; 16] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn new_descriptor_has_expected_magic_and_defaults() {
        let config = VolumeConfig::default();
        let descriptor = VolumeDescriptor::new(&config);
        assert_eq!(descriptor.magic.get(), VOLUME_MAGIC);
        assert_eq!(descriptor.version.get(), CURRENT_VERSION);
        assert_eq!(descriptor.clusters_per_block(), DEFAULT_BYTES_PER_BLOCK / DEFAULT_CLUSTER_SIZE);
        assert!(descriptor.scratch_block_supported());
        descriptor.verify_consistency().unwrap();
    }

    #[test]
    fn corrupted_magic_fails_verification() {
        let config = VolumeConfig::default();
        let mut descriptor = VolumeDescriptor::new(&config);
        descriptor.magic = 0u32.into();
        assert!(descriptor.verify_consistency().is_err());
    }

    #[test]
    fn round_trips_through_raw_bytes() {
        let config = VolumeConfig::default();
        let descriptor = VolumeDescriptor::new(&config);
        let bytes = descriptor.as_bytes().to_vec();
        let restored = VolumeDescriptor::read_from_bytes(&bytes).unwrap();
        assert_eq!(restored.magic.get(), VOLUME_MAGIC);
        assert_eq!(restored.cluster_size.get(), DEFAULT_CLUSTER_SIZE);
    }

    #[test]
    fn rejects_non_power_of_two_cluster_size() {
        let mut config = VolumeConfig::default();
        config.cluster_size = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_cluster_size_with_too_many_records_per_cluster() {
        let mut config = VolumeConfig::default();
        // 256 B records, 7-bit record index -> 128 records/cluster is the
        // largest a cluster size can hold; one step past that must fail.
        config.cluster_size = 64 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_cluster_size_at_the_records_per_cluster_limit() {
        let mut config = VolumeConfig::default();
        config.cluster_size = 128 * crate::fat::FILE_DESCRIPTOR_RECORD_SIZE;
        config.validate().unwrap();
    }
}
