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

//! An embedded, crash-safe, hierarchical file system that lives inside a
//! pair of host-provided files: a FAT file (volume header, allocation
//! table, block-virtualization descriptors, transaction log) and a
//! cluster-data file.
//!
//! The engine is generic over [`splitfat_io::ByteFile`] /
//! [`splitfat_io::ByteFileSystem`] so callers can plug in any host storage
//! layer; [`splitfat_io_std`] supplies the `std::fs::File`-backed one.

pub mod bitset;
pub mod block_virtualization;
pub mod buffer_pool;
pub mod cluster_store;
pub mod crc;
pub mod fat;
pub mod path;
pub mod placement;
pub mod transaction;
pub mod vfs;
pub mod volume_descriptor;
pub mod volume_manager;

pub use splitfat_err::{CorruptionKind, Error, FsError, Result, TransactionKind};
pub use volume_descriptor::VolumeConfig;
pub use volume_manager::VolumeManager;
