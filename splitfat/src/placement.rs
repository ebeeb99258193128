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

//! Pluggable cluster-placement strategy. The engine always works without
//! one (falling back to first-fit allocation); a policy only changes where
//! the *next* allocation lands and whether idle time is spent compacting a
//! fragmented block. [`crate::fat::FatDataManager::block_occupancy_snapshot`]
//! is the feed a policy scores.

/// Per-block free-cluster counts and the bit set needed to score
/// fragmentation, as seen by a policy deciding where to allocate next.
pub struct BlockOccupancy<'a> {
    pub block_index: u32,
    pub free_clusters: &'a crate::bitset::BitSet,
}

pub trait PlacementPolicy: Send + Sync {
    /// Called at the start of a write transaction; may pick a block to
    /// prefer for new allocations and/or a block to defragment.
    fn prepare_for_write_transaction(&mut self, blocks: &[BlockOccupancy<'_>]);

    /// The block new allocations should try first, if any.
    fn preferred_block(&self) -> Option<u32>;

    /// The block flagged as worth defragmenting by the last
    /// `prepare_for_write_transaction`, if any. The caller (the VFS layer,
    /// which is the only layer that can walk live chains safely) is
    /// responsible for turning this into actual cluster moves.
    fn degraded_block(&self) -> Option<u32>;
}

/// Reference policy: prefer the block with the most free clusters
/// (quantized to avoid thrashing between near-equally-free blocks), and
/// flag the most fragmented block for defragmentation once its free count
/// drops below half its capacity.
#[derive(Default)]
pub struct DefaultPlacementPolicy {
    preferred_block: Option<u32>,
    degraded_block: Option<u32>,
}

impl DefaultPlacementPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average index of the first free slot after each occupied run: lower
    /// is better-packed, higher means free space is scattered.
    fn degradation_score(occupancy: &BlockOccupancy<'_>) -> f64 {
        let bits = occupancy.free_clusters;
        let len = bits.len();
        if len == 0 {
            return 0.0;
        }
        let mut runs = 0usize;
        let mut total_gap = 0usize;
        let mut in_occupied_run = false;
        for i in 0..len {
            let is_free = bits.get(i);
            if !is_free {
                in_occupied_run = true;
            } else if in_occupied_run {
                in_occupied_run = false;
                runs += 1;
                total_gap += bits.find_first(i, false).unwrap_or(len) - i;
            }
        }
        if runs == 0 {
            0.0
        } else {
            total_gap as f64 / runs as f64
        }
    }
}

impl PlacementPolicy for DefaultPlacementPolicy {
    fn prepare_for_write_transaction(&mut self, blocks: &[BlockOccupancy<'_>]) {
        self.preferred_block = blocks
            .iter()
            .max_by_key(|b| {
                let quantum = (b.free_clusters.len() / 4).max(1);
                (b.free_clusters.count_ones() / quantum) * quantum
            })
            .map(|b| b.block_index);

        self.degraded_block = blocks
            .iter()
            .filter(|b| b.free_clusters.count_ones() * 2 < b.free_clusters.len())
            .max_by(|a, b| {
                Self::degradation_score(a)
                    .partial_cmp(&Self::degradation_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|b| b.block_index);
    }

    fn preferred_block(&self) -> Option<u32> {
        self.preferred_block
    }

    fn degraded_block(&self) -> Option<u32> {
        self.degraded_block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::BitSet;

    #[test]
    fn prefers_block_with_most_free_clusters() {
        let mut a = BitSet::with_size(16);
        a.set_all(true);
        for i in 0..14 {
            a.set(i, false);
        }
        let mut b = BitSet::with_size(16);
        b.set_all(true);

        let mut policy = DefaultPlacementPolicy::new();
        policy.prepare_for_write_transaction(&[
            BlockOccupancy {
                block_index: 0,
                free_clusters: &a,
            },
            BlockOccupancy {
                block_index: 1,
                free_clusters: &b,
            },
        ]);
        assert_eq!(policy.preferred_block(), Some(1));
    }

    #[test]
    fn flags_half_empty_block_as_degraded() {
        let mut half_free = BitSet::with_size(16);
        for i in 0..8 {
            half_free.set(i, true);
        }
        let mut full = BitSet::with_size(16);
        full.set_all(true);

        let mut policy = DefaultPlacementPolicy::new();
        policy.prepare_for_write_transaction(&[
            BlockOccupancy {
                block_index: 0,
                free_clusters: &half_free,
            },
            BlockOccupancy {
                block_index: 1,
                free_clusters: &full,
            },
        ]);
        assert_eq!(policy.degraded_block(), Some(0));
    }
}
