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

//! The block-oriented File Allocation Table: per-cluster cell encoding,
//! per-block caching, and the block-level allocation contract.

use std::sync::RwLock;

use zerocopy::{little_endian::U32, little_endian::U64, FromBytes, Immutable, IntoBytes, KnownLayout};

use splitfat_err::{CorruptionKind, Error, FsError};
use splitfat_io::ByteFile;

use crate::bitset::BitSet;
use crate::crc::Crc32;
use crate::volume_descriptor::BlockControlHeader;

pub type ClusterIndex = u32;

pub const INVALID_CLUSTER: ClusterIndex = u32::MAX;

/// Half-cell sentinel meaning "no sibling pointer" (free, or this end of
/// the chain carries a descriptor location instead).
const HALF_CELL_MASK: u64 = 0x7FFF_FFFF;
const HALF_CELL_FREE: u64 = HALF_CELL_MASK;

const FLAG_START: u64 = 1 << 63;
const FLAG_END: u64 = 1 << 62;

const LOCATION_RECORD_BITS: u32 = 7;
const LOCATION_RECORD_MASK: u32 = (1 << LOCATION_RECORD_BITS) - 1;

/// Upper bound on `FileDescriptorRecord` slots per directory cluster: a
/// chain cell's `FileDescriptorLocation` packs `record_index` into
/// [`LOCATION_RECORD_BITS`] bits, so any more would alias through
/// [`LOCATION_RECORD_MASK`].
pub const MAX_RECORDS_PER_CLUSTER: u32 = 1 << LOCATION_RECORD_BITS;

/// Fixed size of a `FileDescriptorRecord`, kept here (rather than next to
/// the struct itself in `vfs.rs`) so [`VolumeConfig::validate`](crate::volume_descriptor::VolumeConfig::validate)
/// can bound cluster size against [`MAX_RECORDS_PER_CLUSTER`] without
/// depending on the VFS layer above it.
pub const FILE_DESCRIPTOR_RECORD_SIZE: u32 = 256;

/// Location of the `FileDescriptorRecord` that owns a chain, encoded into
/// a half-cell when that cell carries `START_OF_CHAIN` or `END_OF_CHAIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDescriptorLocation {
    pub descriptor_cluster_index: u32,
    pub record_index: u32,
}

impl FileDescriptorLocation {
    fn encode(self) -> u64 {
        ((self.descriptor_cluster_index as u64) << LOCATION_RECORD_BITS)
            | (self.record_index & LOCATION_RECORD_MASK) as u64
    }

    fn decode(bits: u64) -> Self {
        Self {
            descriptor_cluster_index: (bits >> LOCATION_RECORD_BITS) as u32,
            record_index: (bits as u32) & LOCATION_RECORD_MASK,
        }
    }
}

/// One half of a cell: either a sibling cluster pointer or, on a chain
/// boundary, the owning descriptor's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfCell {
    None,
    Cluster(ClusterIndex),
    Location(FileDescriptorLocation),
}

/// Logical, decoded view of a FAT cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatCellValue {
    pub free: bool,
    pub is_start: bool,
    pub is_end: bool,
    pub prev: HalfCell,
    pub next: HalfCell,
}

impl FatCellValue {
    pub fn free() -> Self {
        Self {
            free: true,
            is_start: false,
            is_end: false,
            prev: HalfCell::None,
            next: HalfCell::None,
        }
    }

    pub fn single_cluster_chain(location: FileDescriptorLocation) -> Self {
        Self {
            free: false,
            is_start: true,
            is_end: true,
            prev: HalfCell::Location(location),
            next: HalfCell::Location(location),
        }
    }

    fn encode(self) -> u64 {
        if self.free {
            return HALF_CELL_FREE << 31 | HALF_CELL_FREE;
        }
        let prev_bits = match self.prev {
            HalfCell::None => HALF_CELL_FREE,
            HalfCell::Cluster(c) => c as u64 & HALF_CELL_MASK,
            HalfCell::Location(loc) => loc.encode() & HALF_CELL_MASK,
        };
        let next_bits = match self.next {
            HalfCell::None => HALF_CELL_FREE,
            HalfCell::Cluster(c) => c as u64 & HALF_CELL_MASK,
            HalfCell::Location(loc) => loc.encode() & HALF_CELL_MASK,
        };
        let mut bits = (prev_bits << 31) | next_bits;
        if self.is_start {
            bits |= FLAG_START;
        }
        if self.is_end {
            bits |= FLAG_END;
        }
        bits
    }

    fn decode(bits: u64) -> Self {
        let prev_raw = (bits >> 31) & HALF_CELL_MASK;
        let next_raw = bits & HALF_CELL_MASK;
        let is_start = bits & FLAG_START != 0;
        let is_end = bits & FLAG_END != 0;
        if prev_raw == HALF_CELL_FREE && next_raw == HALF_CELL_FREE && !is_start && !is_end {
            return Self::free();
        }
        let prev = if is_start {
            HalfCell::Location(FileDescriptorLocation::decode(prev_raw))
        } else if prev_raw == HALF_CELL_FREE {
            HalfCell::None
        } else {
            HalfCell::Cluster(prev_raw as u32)
        };
        let next = if is_end {
            HalfCell::Location(FileDescriptorLocation::decode(next_raw))
        } else if next_raw == HALF_CELL_FREE {
            HalfCell::None
        } else {
            HalfCell::Cluster(next_raw as u32)
        };
        Self {
            free: false,
            is_start,
            is_end,
            prev,
            next,
        }
    }

    pub fn prev_cluster(&self) -> Option<ClusterIndex> {
        match self.prev {
            HalfCell::Cluster(c) => Some(c),
            _ => None,
        }
    }

    pub fn next_cluster(&self) -> Option<ClusterIndex> {
        match self.next {
            HalfCell::Cluster(c) => Some(c),
            _ => None,
        }
    }

    pub fn start_location(&self) -> Option<FileDescriptorLocation> {
        match self.prev {
            HalfCell::Location(loc) if self.is_start => Some(loc),
            _ => None,
        }
    }

    pub fn end_location(&self) -> Option<FileDescriptorLocation> {
        match self.next {
            HalfCell::Location(loc) if self.is_end => Some(loc),
            _ => None,
        }
    }
}

/// On-disk representation: the packed 64-bit link plus a small tag area
/// (CRC-16 of the cluster's current contents and the `cluster_initialized`
/// flag) the cluster store updates on every write.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FatCellRecord {
    link: U64,
    crc16: zerocopy::little_endian::U16,
    initialized: u8,
    _pad: u8,
    _reserved: U32,
}

impl FatCellRecord {
    pub fn free() -> Self {
        Self {
            link: FatCellValue::free().encode().into(),
            crc16: 0.into(),
            initialized: 0,
            _pad: 0,
            _reserved: 0.into(),
        }
    }

    pub fn value(&self) -> FatCellValue {
        FatCellValue::decode(self.link.get())
    }

    pub fn set_value(&mut self, value: FatCellValue) {
        self.link = value.encode().into();
    }

    pub fn crc_tag(&self) -> u16 {
        self.crc16.get()
    }

    pub fn set_crc_tag(&mut self, crc: u16) {
        self.crc16 = crc.into();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized != 0
    }

    pub fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized as u8;
    }
}

impl Default for FatCellRecord {
    fn default() -> Self {
        Self::free()
    }
}

/// In-memory state for one FAT block: its cells, a free-cluster bit set
/// kept in lock-step, and a dirty flag.
pub struct FatBlock {
    block_index: u32,
    cells: Vec<FatCellRecord>,
    free_clusters: BitSet,
    dirty: bool,
    control_header: BlockControlHeader,
}

impl FatBlock {
    pub fn new_empty(block_index: u32, clusters_per_block: u32) -> Self {
        let cells = vec![FatCellRecord::free(); clusters_per_block as usize];
        let mut free_clusters = BitSet::with_size(clusters_per_block as usize);
        free_clusters.set_all(true);
        Self {
            block_index,
            cells,
            free_clusters,
            dirty: true,
            control_header: BlockControlHeader::default(),
        }
    }

    fn from_cells(block_index: u32, cells: Vec<FatCellRecord>) -> Self {
        let mut free_clusters = BitSet::with_size(cells.len());
        for (i, cell) in cells.iter().enumerate() {
            free_clusters.set(i, cell.value().free);
        }
        Self {
            block_index,
            cells,
            free_clusters,
            dirty: false,
            control_header: BlockControlHeader::default(),
        }
    }

    pub fn get(&self, local_index: u32) -> FatCellValue {
        self.cells[local_index as usize].value()
    }

    pub fn cell(&self, local_index: u32) -> &FatCellRecord {
        &self.cells[local_index as usize]
    }

    pub fn set(&mut self, local_index: u32, value: FatCellValue) {
        self.free_clusters.set(local_index as usize, value.free);
        self.cells[local_index as usize].set_value(value);
        self.dirty = true;
    }

    pub fn set_tag(&mut self, local_index: u32, crc16: u16, initialized: bool) {
        let cell = &mut self.cells[local_index as usize];
        cell.set_crc_tag(crc16);
        cell.set_initialized(initialized);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_out_of_sync(&mut self) {
        self.dirty = true;
    }

    pub fn free_clusters_set(&self) -> &BitSet {
        &self.free_clusters
    }

    pub fn count_free_clusters(&self) -> usize {
        self.free_clusters.count_ones()
    }

    pub fn try_find_free_cluster(&self) -> Option<u32> {
        self.free_clusters.find_first(0, true).map(|i| i as u32)
    }

    pub fn cells_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.cells.len() * core::mem::size_of::<FatCellRecord>());
        for cell in &self.cells {
            buf.extend_from_slice(zerocopy::IntoBytes::as_bytes(cell));
        }
        buf
    }

    pub fn restore_from_cells_bytes(&mut self, bytes: &[u8]) -> splitfat_err::Result<()> {
        let cells = decode_cells(bytes, self.cells.len())?;
        *self = Self::from_cells(self.block_index, cells);
        self.dirty = true;
        Ok(())
    }

    pub fn calculate_crc32(&self) -> u32 {
        Crc32::calculate(&self.cells_bytes(), 0)
    }
}

fn decode_cells(bytes: &[u8], count: usize) -> splitfat_err::Result<Vec<FatCellRecord>> {
    let cell_size = core::mem::size_of::<FatCellRecord>();
    if bytes.len() != cell_size * count {
        return Err(Error::Fs(FsError::Corruption(CorruptionKind::ChainInconsistency {
            cluster: 0,
        })));
    }
    let mut cells = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(cell_size) {
        cells.push(
            FatCellRecord::read_from_bytes(chunk)
                .map_err(|_| Error::Fs(FsError::Corruption(CorruptionKind::ChainInconsistency { cluster: 0 })))?,
        );
    }
    Ok(cells)
}

/// Geometry shared by every FAT block.
#[derive(Debug, Clone, Copy)]
pub struct FatLayout {
    pub fat_region_offset: u64,
    pub clusters_per_block: u32,
}

impl FatLayout {
    fn block_ctrl_size(&self) -> u64 {
        core::mem::size_of::<BlockControlHeader>() as u64
    }

    fn fat_block_bytes(&self) -> u64 {
        self.clusters_per_block as u64 * core::mem::size_of::<FatCellRecord>() as u64
    }

    pub fn block_stride(&self) -> u64 {
        self.block_ctrl_size() + self.fat_block_bytes()
    }

    pub fn block_offset(&self, block_index: u32) -> u64 {
        self.fat_region_offset + block_index as u64 * self.block_stride() + self.block_ctrl_size()
    }
}

/// Owns the per-block cache and routes cell reads/writes to it, loading
/// blocks from the host file on first touch.
pub struct FatDataManager<F: ByteFile> {
    layout: FatLayout,
    blocks: RwLock<Vec<Option<FatBlock>>>,
    max_blocks: u32,
    file: std::sync::Arc<F>,
}

impl<F: ByteFile> FatDataManager<F> {
    pub fn new(file: std::sync::Arc<F>, layout: FatLayout, max_blocks: u32) -> Self {
        let mut blocks = Vec::with_capacity(max_blocks as usize);
        blocks.resize_with(max_blocks as usize, || None);
        Self {
            layout,
            blocks: RwLock::new(blocks),
            max_blocks,
            file,
        }
    }

    pub fn current_block_count(&self) -> u32 {
        self.blocks.read().unwrap().iter().take_while(|b| b.is_some()).count() as u32
    }

    pub fn can_expand(&self) -> bool {
        self.current_block_count() < self.max_blocks
    }

    fn ensure_loaded(&self, block_index: u32) -> splitfat_err::Result<()> {
        {
            let blocks = self.blocks.read().unwrap();
            if blocks[block_index as usize].is_some() {
                return Ok(());
            }
        }
        let mut blocks = self.blocks.write().unwrap();
        if blocks[block_index as usize].is_some() {
            return Ok(());
        }
        let mut bytes = vec![0u8; self.layout.clusters_per_block as usize * core::mem::size_of::<FatCellRecord>()];
        self.file.read_at(self.layout.block_offset(block_index), &mut bytes)?;
        let cells = decode_cells(&bytes, self.layout.clusters_per_block as usize)?;
        blocks[block_index as usize] = Some(FatBlock::from_cells(block_index, cells));
        Ok(())
    }

    pub fn get(&self, cluster: ClusterIndex) -> splitfat_err::Result<FatCellValue> {
        let block_index = cluster / self.layout.clusters_per_block;
        let local = cluster % self.layout.clusters_per_block;
        self.ensure_loaded(block_index)?;
        let blocks = self.blocks.read().unwrap();
        Ok(blocks[block_index as usize].as_ref().unwrap().get(local))
    }

    /// Sets a cell's value. `before_first_mutation` is invoked with the
    /// block's pre-image the first time this call observes a clean block,
    /// so the caller (the transaction log) can append it before the cache
    /// mutates.
    pub fn set_with_pre_image_hook(
        &self,
        cluster: ClusterIndex,
        value: FatCellValue,
        before_first_mutation: impl FnOnce(u32, &[u8]),
    ) -> splitfat_err::Result<()> {
        let block_index = cluster / self.layout.clusters_per_block;
        let local = cluster % self.layout.clusters_per_block;
        self.ensure_loaded(block_index)?;
        let mut blocks = self.blocks.write().unwrap();
        let block = blocks[block_index as usize].as_mut().unwrap();
        if !block.is_dirty() {
            before_first_mutation(block_index, &block.cells_bytes());
        }
        block.set(local, value);
        Ok(())
    }

    pub fn set(&self, cluster: ClusterIndex, value: FatCellValue) -> splitfat_err::Result<()> {
        self.set_with_pre_image_hook(cluster, value, |_, _| {})
    }

    pub fn set_tag(&self, cluster: ClusterIndex, crc16: u16, initialized: bool) -> splitfat_err::Result<()> {
        let block_index = cluster / self.layout.clusters_per_block;
        let local = cluster % self.layout.clusters_per_block;
        self.ensure_loaded(block_index)?;
        let mut blocks = self.blocks.write().unwrap();
        blocks[block_index as usize].as_mut().unwrap().set_tag(local, crc16, initialized);
        Ok(())
    }

    pub fn crc_tag(&self, cluster: ClusterIndex) -> splitfat_err::Result<(u16, bool)> {
        let block_index = cluster / self.layout.clusters_per_block;
        let local = cluster % self.layout.clusters_per_block;
        self.ensure_loaded(block_index)?;
        let blocks = self.blocks.read().unwrap();
        let cell = blocks[block_index as usize].as_ref().unwrap().cell(local);
        Ok((cell.crc_tag(), cell.is_initialized()))
    }

    /// Only legal when `block_index == current_count`.
    pub fn allocate_fat_block(&self, block_index: u32) -> splitfat_err::Result<()> {
        if block_index != self.current_block_count() {
            return Err(Error::invalid_state("FAT blocks must be allocated contiguously"));
        }
        if block_index >= self.max_blocks {
            return Err(Error::Fs(FsError::Transaction(
                splitfat_err::TransactionKind::CannotExpand,
            )));
        }
        let block = FatBlock::new_empty(block_index, self.layout.clusters_per_block);
        let bytes = block.cells_bytes();
        self.file.write_at(self.layout.block_offset(block_index), &bytes)?;
        let mut blocks = self.blocks.write().unwrap();
        blocks[block_index as usize] = Some(block);
        Ok(())
    }

    pub fn try_find_free_cluster_in_block(&self, block_index: u32) -> splitfat_err::Result<Option<ClusterIndex>> {
        self.ensure_loaded(block_index)?;
        let blocks = self.blocks.read().unwrap();
        let block = blocks[block_index as usize].as_ref().unwrap();
        Ok(block
            .try_find_free_cluster()
            .map(|local| block_index * self.layout.clusters_per_block + local))
    }

    /// Scans either only the directory block, or only file-data blocks,
    /// first-fit via each block's free bit set.
    pub fn try_find_free_cluster_in_allocated(
        &self,
        use_file_data: bool,
        first_file_data_block_index: u32,
    ) -> splitfat_err::Result<Option<ClusterIndex>> {
        let count = self.current_block_count();
        let range: Box<dyn Iterator<Item = u32>> = if use_file_data {
            Box::new(first_file_data_block_index..count)
        } else {
            Box::new(0..first_file_data_block_index.min(count))
        };
        for block_index in range {
            if let Some(cluster) = self.try_find_free_cluster_in_block(block_index)? {
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    /// Snapshots every allocated block's free-cluster bit set, for a
    /// placement policy deciding where the next write transaction should
    /// prefer to allocate.
    pub fn block_occupancy_snapshot(&self) -> splitfat_err::Result<Vec<(u32, crate::bitset::BitSet)>> {
        let count = self.current_block_count();
        let mut snapshot = Vec::with_capacity(count as usize);
        for block_index in 0..count {
            self.ensure_loaded(block_index)?;
            let blocks = self.blocks.read().unwrap();
            snapshot.push((block_index, blocks[block_index as usize].as_ref().unwrap().free_clusters_set().clone()));
        }
        Ok(snapshot)
    }

    /// Compares each block's free-cluster bit set (updated in lock-step on
    /// every `set`) against the `free` flag decoded straight from that same
    /// cluster's own cell bytes. These are two independently-maintained
    /// views of the same property; a mismatch means the cache and the
    /// on-disk cell drifted apart. Returns `(cluster, bitset_says_free,
    /// cell_says_free)` for every cluster where they disagree.
    pub fn verify_free_bit_consistency(&self) -> splitfat_err::Result<Vec<(ClusterIndex, bool, bool)>> {
        let mut mismatches = Vec::new();
        let count = self.current_block_count();
        for block_index in 0..count {
            self.ensure_loaded(block_index)?;
            let blocks = self.blocks.read().unwrap();
            let block = blocks[block_index as usize].as_ref().unwrap();
            for local in 0..self.layout.clusters_per_block {
                let from_bitset = block.free_clusters_set().get(local as usize);
                let from_cell = block.get(local).free;
                if from_bitset != from_cell {
                    let cluster = block_index * self.layout.clusters_per_block + local;
                    mismatches.push((cluster, from_bitset, from_cell));
                }
            }
        }
        Ok(mismatches)
    }

    pub fn get_count_free_clusters(&self) -> splitfat_err::Result<u32> {
        let count = self.current_block_count();
        let mut total = 0u32;
        for block_index in 0..count {
            self.ensure_loaded(block_index)?;
            let blocks = self.blocks.read().unwrap();
            total += blocks[block_index as usize].as_ref().unwrap().count_free_clusters() as u32;
        }
        Ok(total)
    }

    pub fn flush(&self) -> splitfat_err::Result<()> {
        let mut blocks = self.blocks.write().unwrap();
        for block in blocks.iter_mut().flatten() {
            if block.is_dirty() {
                let bytes = block.cells_bytes();
                self.file.write_at(self.layout.block_offset(block.block_index), &bytes)?;
                block.dirty = false;
            }
        }
        self.file.flush()
    }

    /// Writes a logged pre-image straight back over the cached block and
    /// the on-disk copy, used by transaction recovery.
    pub fn restore_block(&self, block_index: u32, pre_image: &[u8]) -> splitfat_err::Result<()> {
        self.ensure_loaded(block_index)?;
        let mut blocks = self.blocks.write().unwrap();
        let block = blocks[block_index as usize].as_mut().unwrap();
        block.restore_from_cells_bytes(pre_image)?;
        self.file.write_at(self.layout.block_offset(block_index), pre_image)?;
        block.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_cell_round_trips() {
        let cell = FatCellValue::free();
        let bits = cell.encode();
        assert_eq!(FatCellValue::decode(bits), cell);
    }

    #[test]
    fn single_cluster_chain_encodes_both_flags_and_location() {
        let location = FileDescriptorLocation {
            descriptor_cluster_index: 42,
            record_index: 7,
        };
        let cell = FatCellValue::single_cluster_chain(location);
        let decoded = FatCellValue::decode(cell.encode());
        assert!(decoded.is_start);
        assert!(decoded.is_end);
        assert_eq!(decoded.start_location(), Some(location));
        assert_eq!(decoded.end_location(), Some(location));
    }

    #[test]
    fn middle_cluster_links_round_trip() {
        let cell = FatCellValue {
            free: false,
            is_start: false,
            is_end: false,
            prev: HalfCell::Cluster(10),
            next: HalfCell::Cluster(12),
        };
        let decoded = FatCellValue::decode(cell.encode());
        assert_eq!(decoded.prev_cluster(), Some(10));
        assert_eq!(decoded.next_cluster(), Some(12));
        assert!(!decoded.is_start);
        assert!(!decoded.is_end);
    }

    #[test]
    fn fresh_block_is_entirely_free() {
        let block = FatBlock::new_empty(0, 64);
        assert_eq!(block.count_free_clusters(), 64);
        assert_eq!(block.try_find_free_cluster(), Some(0));
    }

    #[test]
    fn setting_a_cell_updates_the_free_bitset() {
        let mut block = FatBlock::new_empty(0, 8);
        let location = FileDescriptorLocation {
            descriptor_cluster_index: 0,
            record_index: 0,
        };
        block.set(3, FatCellValue::single_cluster_chain(location));
        assert_eq!(block.count_free_clusters(), 7);
        assert!(!block.free_clusters_set().get(3));
    }
}
