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

//! Double-buffered virtual→physical block map. All writes to a virtual
//! file-data block land on the scratch physical block; a commit swaps the
//! scratch in by flipping which of the two descriptors is active.

use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use splitfat_err::{CorruptionKind, Error, FsError};

use crate::crc::Crc32;
use crate::volume_descriptor::VOLUME_DESCRIPTOR_RESERVED_SIZE;

pub const VIRTUALIZATION_MAGIC: u16 = 0x5FA7;
/// Upper bound on virtual blocks a descriptor can describe; fixed so the
/// two descriptors fit in the volume descriptor's reserved region.
pub const MAX_VIRTUAL_BLOCKS: usize = 25;

const DESCRIPTOR_COUNT: usize = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BlockVirtualizationDescriptor {
    magic: zerocopy::little_endian::U16,
    id: u8,
    _pad0: u8,
    header_size: zerocopy::little_endian::U16,
    _pad1: u16,
    virtual_blocks_count: U32,
    scratch_physical_index: U32,
    data_crc: U32,
    header_crc: U32,
    block_indices: [U32; MAX_VIRTUAL_BLOCKS],
}

impl BlockVirtualizationDescriptor {
    fn empty() -> Self {
        Self {
            magic: 0.into(),
            id: 0,
            _pad0: 0,
            header_size: (core::mem::size_of::<Self>() as u16).into(),
            _pad1: 0,
            virtual_blocks_count: 0.into(),
            scratch_physical_index: 0.into(),
            data_crc: 0.into(),
            header_crc: 0.into(),
            block_indices: [U32::ZERO; MAX_VIRTUAL_BLOCKS],
        }
    }

    fn identity(virtual_blocks_count: u32, scratch_physical_index: u32, id: u8) -> Self {
        let mut descriptor = Self::empty();
        descriptor.magic = VIRTUALIZATION_MAGIC.into();
        descriptor.id = id;
        descriptor.virtual_blocks_count = virtual_blocks_count.into();
        descriptor.scratch_physical_index = scratch_physical_index.into();
        for i in 0..virtual_blocks_count as usize {
            descriptor.block_indices[i] = (i as u32).into();
        }
        descriptor.recompute_crcs();
        descriptor
    }

    fn data_bytes(&self) -> &[u8] {
        zerocopy::IntoBytes::as_bytes(&self.block_indices[..self.virtual_blocks_count.get() as usize])
    }

    fn recompute_crcs(&mut self) {
        self.data_crc = Crc32::calculate(self.data_bytes(), 0).into();
        self.header_crc = 0.into();
        let header_bytes = zerocopy::IntoBytes::as_bytes(&*self);
        self.header_crc = Crc32::calculate(header_bytes, 0).into();
    }

    fn verify(&self) -> bool {
        if self.magic.get() != VIRTUALIZATION_MAGIC {
            return false;
        }
        if self.virtual_blocks_count.get() as usize > MAX_VIRTUAL_BLOCKS {
            return false;
        }
        let mut copy = *self;
        let stored_header_crc = copy.header_crc.get();
        copy.header_crc = 0.into();
        let header_crc = Crc32::calculate(zerocopy::IntoBytes::as_bytes(&copy), 0);
        if header_crc != stored_header_crc {
            return false;
        }
        let data_crc = Crc32::calculate(self.data_bytes(), 0);
        data_crc == self.data_crc.get()
    }
}

/// Runtime view over the two descriptors packed into the volume
/// descriptor's reserved region.
pub struct BlockVirtualization {
    descriptors: [BlockVirtualizationDescriptor; DESCRIPTOR_COUNT],
    active_index: usize,
}

impl BlockVirtualization {
    /// Initializes a fresh virtualization table: virtual block `i` maps to
    /// physical block `i`; the scratch block is the next physical index
    /// after the last virtual block.
    pub fn new_identity(virtual_blocks_count: u32) -> Self {
        let scratch = virtual_blocks_count;
        let active = BlockVirtualizationDescriptor::identity(virtual_blocks_count, scratch, 1);
        let inactive = BlockVirtualizationDescriptor::identity(virtual_blocks_count, scratch, 0);
        Self {
            descriptors: [active, inactive],
            active_index: 0,
        }
    }

    pub fn load(reserved: &[u8; VOLUME_DESCRIPTOR_RESERVED_SIZE]) -> splitfat_err::Result<Self> {
        let size = core::mem::size_of::<BlockVirtualizationDescriptor>();
        let (first_bytes, rest) = reserved.split_at(size);
        let (second_bytes, _) = rest.split_at(size);
        let first = BlockVirtualizationDescriptor::read_from_bytes(first_bytes)
            .map_err(|_| Error::Fs(FsError::Corruption(CorruptionKind::VirtualizationDescriptor)))?;
        let second = BlockVirtualizationDescriptor::read_from_bytes(second_bytes)
            .map_err(|_| Error::Fs(FsError::Corruption(CorruptionKind::VirtualizationDescriptor)))?;

        let first_ok = first.verify();
        let second_ok = second.verify();
        let active_index = match (first_ok, second_ok) {
            (true, true) => {
                if first.id == second.id.wrapping_add(1) % 8 {
                    0
                } else if second.id == first.id.wrapping_add(1) % 8 {
                    1
                } else {
                    0
                }
            }
            (true, false) => 0,
            (false, true) => 1,
            (false, false) => {
                log::error!("both block-virtualization descriptors failed verification");
                return Err(Error::Fs(FsError::Corruption(
                    CorruptionKind::VirtualizationDescriptor,
                )));
            }
        };

        Ok(Self {
            descriptors: [first, second],
            active_index,
        })
    }

    pub fn store(&self, reserved: &mut [u8; VOLUME_DESCRIPTOR_RESERVED_SIZE]) {
        let size = core::mem::size_of::<BlockVirtualizationDescriptor>();
        reserved[..size].copy_from_slice(zerocopy::IntoBytes::as_bytes(&self.descriptors[0]));
        reserved[size..size * 2].copy_from_slice(zerocopy::IntoBytes::as_bytes(&self.descriptors[1]));
    }

    fn active(&self) -> &BlockVirtualizationDescriptor {
        &self.descriptors[self.active_index]
    }

    pub fn scratch_physical_index(&self) -> u32 {
        self.active().scratch_physical_index.get()
    }

    /// Invariant 8: the scratch block is never a valid read target.
    pub fn physical_for_read(&self, virtual_block: u32) -> splitfat_err::Result<u32> {
        let active = self.active();
        let count = active.virtual_blocks_count.get();
        if virtual_block >= count {
            return Err(Error::invalid_argument("virtual block index out of range"));
        }
        Ok(active.block_indices[virtual_block as usize].get())
    }

    pub fn physical_for_write(&self, _virtual_block: u32) -> u32 {
        self.scratch_physical_index()
    }

    /// Prepares (but does not yet make active) the inactive descriptor as a
    /// copy of the active one with `virtual_block` repointed at the current
    /// scratch block, and the old physical block of `virtual_block` becoming
    /// the new scratch. Returns the serialized pair ready to be logged and
    /// written; the caller flips `active_index` only after both descriptors
    /// are durably written (see `commit_swap`).
    pub fn prepare_swap(&self, virtual_block: u32) -> splitfat_err::Result<Self> {
        let active = self.active();
        if virtual_block >= active.virtual_blocks_count.get() {
            return Err(Error::invalid_argument("virtual block index out of range"));
        }
        let mut new_active = *active;
        new_active.id = active.id.wrapping_add(1) % 8;
        let old_physical = new_active.block_indices[virtual_block as usize].get();
        let scratch = new_active.scratch_physical_index.get();
        new_active.block_indices[virtual_block as usize] = scratch.into();
        new_active.scratch_physical_index = old_physical.into();
        new_active.recompute_crcs();

        let mut descriptors = self.descriptors;
        let new_inactive_index = self.active_index;
        descriptors[new_inactive_index] = self.descriptors[self.active_index];
        descriptors[1 - new_inactive_index] = new_active;

        Ok(Self {
            descriptors,
            active_index: 1 - self.active_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_map_round_trips_through_reserved_bytes() {
        let bv = BlockVirtualization::new_identity(25);
        let mut reserved = [0u8; VOLUME_DESCRIPTOR_RESERVED_SIZE];
        bv.store(&mut reserved);
        let restored = BlockVirtualization::load(&reserved).unwrap();
        assert_eq!(restored.physical_for_read(0).unwrap(), 0);
        assert_eq!(restored.physical_for_read(24).unwrap(), 24);
        assert_eq!(restored.scratch_physical_index(), 25);
    }

    #[test]
    fn scratch_is_never_a_read_target() {
        let bv = BlockVirtualization::new_identity(25);
        for virt in 0..25u32 {
            assert_ne!(bv.physical_for_read(virt).unwrap(), bv.scratch_physical_index());
        }
    }

    #[test]
    fn swap_repoints_virtual_block_and_recycles_old_physical_as_scratch() {
        let bv = BlockVirtualization::new_identity(25);
        let scratch_before = bv.scratch_physical_index();
        let old_physical_for_3 = bv.physical_for_read(3).unwrap();

        let swapped = bv.prepare_swap(3).unwrap();
        assert_eq!(swapped.physical_for_read(3).unwrap(), scratch_before);
        assert_eq!(swapped.scratch_physical_index(), old_physical_for_3);

        // Every other virtual block is unaffected.
        assert_eq!(swapped.physical_for_read(4).unwrap(), bv.physical_for_read(4).unwrap());
    }

    #[test]
    fn corrupted_descriptor_pair_is_rejected() {
        let reserved = [0u8; VOLUME_DESCRIPTOR_RESERVED_SIZE];
        assert!(BlockVirtualization::load(&reserved).is_err());
    }
}
