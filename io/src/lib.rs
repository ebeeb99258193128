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

//! Host storage port used by the SplitFAT engine.
//!
//! `ByteFile` abstracts a single positioned-I/O handle; `ByteFileSystem`
//! abstracts the directory-level operations (open, create, rename, remove)
//! needed to manage the fork files and the transaction log.

use splitfat_err::Result;

pub trait ByteFile {
    fn is_open(&self) -> bool;

    /// Reads starting at `offset`, filling `buffer` completely.
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes `buffer` starting at `offset`.
    fn write_at(&self, offset: u64, buffer: &[u8]) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn seek(&self, position: u64) -> Result<()>;

    fn get_position(&self) -> Result<u64>;

    fn get_size(&self) -> Result<u64>;

    fn set_size(&self, size: u64) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Path-level operations on the host filesystem backing a volume.
///
/// The transaction log's commit point is a rename of a temp file onto its
/// final name; this port exists so that linearization point can be expressed
/// without `splitfat` depending on `std` directly.
pub trait ByteFileSystem {
    type File: ByteFile;

    fn open(&self, path: &str) -> Result<Self::File>;

    fn create(&self, path: &str) -> Result<Self::File>;

    fn exists(&self, path: &str) -> Result<bool>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn remove(&self, path: &str) -> Result<()>;
}
