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

//! The virtual file system: named files and directories laid out as
//! [`FileDescriptorRecord`] arrays inside directory clusters, backed by
//! cluster chains managed through the FAT engine.

use zerocopy::{little_endian::U32, little_endian::U64, FromBytes, Immutable, IntoBytes, KnownLayout};

use splitfat_err::{Error, FsError, Result};
use splitfat_io::ByteFileSystem;

use crate::fat::{FatCellValue, FileDescriptorLocation, HalfCell, INVALID_CLUSTER};
use crate::path;
use crate::volume_descriptor::DIRECTORY_BLOCK_INDEX;
use crate::volume_manager::VolumeManager;

pub type ClusterIndex = crate::fat::ClusterIndex;

pub const ROOT_CLUSTER: ClusterIndex = 0;
pub const MAX_NESTED_DIRECTORIES: u32 = 32;
pub const MAX_ENTITIES_IN_DIRECTORY: u32 = 65536;
pub const RECORD_NAME_LEN: usize = 128;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        /// Set for files; absent for directories.
        const FILE = 0x1;
        const BINARY = 0x2;
        const DELETED = 0x4;
        const HIDDEN = 0x8;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const APPEND = 0x4;
        const TRUNCATE = 0x8;
        const CREATE_IF_MISSING = 0x10;
        const BINARY = 0x20;
        const TEXT = 0x40;
    }
}

impl AccessMode {
    /// POSIX-subset mode string: `r`/`w`/`a`/`+`/`b`/`t`/`x` per the
    /// documented bitmask mapping. `b` wins if both `b` and `t` are given.
    pub fn parse(mode: &str) -> Result<Self> {
        let mut flags = AccessMode::empty();
        let mut suppress_create = false;
        for ch in mode.chars() {
            match ch {
                'r' => flags |= AccessMode::READ,
                'w' => flags |= AccessMode::WRITE | AccessMode::TRUNCATE | AccessMode::CREATE_IF_MISSING,
                'a' => flags |= AccessMode::WRITE | AccessMode::APPEND | AccessMode::CREATE_IF_MISSING,
                '+' => flags |= AccessMode::READ | AccessMode::WRITE,
                'b' => flags |= AccessMode::BINARY,
                't' => flags |= AccessMode::TEXT,
                'x' => suppress_create = true,
                _ => return Err(Error::invalid_argument("unrecognized access mode character")),
            }
        }
        if flags.contains(AccessMode::BINARY) {
            flags.remove(AccessMode::TEXT);
        }
        if suppress_create {
            flags.remove(AccessMode::CREATE_IF_MISSING);
        }
        if flags.is_empty() {
            return Err(Error::invalid_argument("access mode must specify at least one operation"));
        }
        Ok(flags)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirectoryIterationFlags: u32 {
        const FILE = 0x1;
        const DIRECTORY = 0x2;
        const RECURSIVE = 0x4;
    }
}

pub enum IterationControl {
    Continue,
    Stop,
}

/// Fixed-size on-disk record for a named entity (file or directory) inside
/// its parent's directory cluster chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FileDescriptorRecord {
    name: [u8; RECORD_NAME_LEN],
    attributes: U32,
    unique_id: U32,
    size: U64,
    start_cluster: U32,
    record_crc: U32,
    created_time: U64,
    modified_time: U64,
    last_cluster: U32,
    reserved: [u8; 84],
}

const _: () =
    assert!(core::mem::size_of::<FileDescriptorRecord>() == crate::fat::FILE_DESCRIPTOR_RECORD_SIZE as usize);

impl FileDescriptorRecord {
    fn empty() -> Self {
        Self {
            name: [0u8; RECORD_NAME_LEN],
            attributes: 0.into(),
            unique_id: 0.into(),
            size: 0.into(),
            start_cluster: INVALID_CLUSTER.into(),
            record_crc: 0.into(),
            created_time: 0.into(),
            modified_time: 0.into(),
            last_cluster: INVALID_CLUSTER.into(),
            reserved: [0u8; 84],
        }
    }

    fn is_slot_empty(&self) -> bool {
        self.name[0] == 0 && self.attributes.get() == 0
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(RECORD_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() >= RECORD_NAME_LEN {
            return Err(Error::invalid_argument("entity name too long"));
        }
        self.name = [0u8; RECORD_NAME_LEN];
        self.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn is_directory(&self) -> bool {
        !self.attributes().contains(FileAttributes::FILE)
    }

    pub fn attributes(&self) -> FileAttributes {
        FileAttributes::from_bits_truncate(self.attributes.get())
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }

    pub fn start_cluster(&self) -> ClusterIndex {
        self.start_cluster.get()
    }

    pub fn last_cluster(&self) -> ClusterIndex {
        self.last_cluster.get()
    }
}

/// A directory entry surfaced to `iterate_directory` callbacks.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub attributes: FileAttributes,
    pub size: u64,
    pub is_directory: bool,
}

/// Location of a record within its parent directory's cluster chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordLocation {
    cluster: ClusterIndex,
    record_index: u32,
}

/// In-memory cursor combining a cached record, its directory location, the
/// parsed access mode and the current seek position.
pub struct FileManipulator {
    record: FileDescriptorRecord,
    location: RecordLocation,
    mode: AccessMode,
    position: u64,
}

impl FileManipulator {
    pub fn size(&self) -> u64 {
        self.record.size()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

pub struct VirtualFileSystem<FS: ByteFileSystem + Clone> {
    volume: VolumeManager<FS>,
}

impl<FS: ByteFileSystem + Clone> VirtualFileSystem<FS> {
    /// `volume` must already have gone through `create_if_does_not_exist`.
    /// Bootstraps the root directory's single cluster the first time this
    /// volume is ever opened; a no-op on every later open.
    pub fn new(volume: VolumeManager<FS>) -> Result<Self> {
        let vfs = Self { volume };
        vfs.ensure_root_initialized()?;
        Ok(vfs)
    }

    fn ensure_root_initialized(&self) -> Result<()> {
        if !self.volume.get_fat_cell(ROOT_CLUSTER)?.free {
            return Ok(());
        }
        let self_location = self.location(ROOT_CLUSTER, 0);
        self.volume
            .set_fat_cell(ROOT_CLUSTER, FatCellValue::single_cluster_chain(self_location))?;
        let zeros = vec![0u8; self.volume.cluster_size() as usize];
        self.volume.write_cluster(ROOT_CLUSTER, &zeros)
    }

    pub fn volume(&self) -> &VolumeManager<FS> {
        &self.volume
    }

    fn records_per_cluster(&self) -> u32 {
        self.volume.cluster_size() / core::mem::size_of::<FileDescriptorRecord>() as u32
    }

    fn location(&self, cluster: ClusterIndex, record_index: u32) -> FileDescriptorLocation {
        FileDescriptorLocation {
            descriptor_cluster_index: cluster,
            record_index,
        }
    }

    fn chain_clusters(&self, start: ClusterIndex) -> Result<Vec<ClusterIndex>> {
        if start == INVALID_CLUSTER {
            return Ok(Vec::new());
        }
        let mut clusters = vec![start];
        let mut current = start;
        loop {
            let cell = self.volume.get_fat_cell(current)?;
            if cell.is_end {
                break;
            }
            let next = cell
                .next_cluster()
                .ok_or_else(|| Error::Fs(FsError::Corruption(splitfat_err::CorruptionKind::ChainInconsistency { cluster: current })))?;
            clusters.push(next);
            current = next;
        }
        Ok(clusters)
    }

    fn read_record(&self, cluster: ClusterIndex, record_index: u32) -> Result<FileDescriptorRecord> {
        let bytes = self.volume.read_cluster(cluster)?;
        let record_size = core::mem::size_of::<FileDescriptorRecord>();
        let start = record_index as usize * record_size;
        FileDescriptorRecord::read_from_bytes(&bytes[start..start + record_size])
            .map_err(|_| Error::invalid_state("directory cluster is the wrong size for its record layout"))
    }

    fn write_record(&self, cluster: ClusterIndex, record_index: u32, record: &FileDescriptorRecord) -> Result<()> {
        let mut bytes = self.volume.read_cluster(cluster)?;
        let record_size = core::mem::size_of::<FileDescriptorRecord>();
        let start = record_index as usize * record_size;
        bytes[start..start + record_size].copy_from_slice(record.as_bytes());
        self.volume.write_cluster(cluster, &bytes)
    }

    /// Scans a directory's whole chain for `name`, stopping at the first
    /// never-used slot (directory records are packed with no holes except
    /// tombstoned/deleted entries).
    fn find_in_directory(&self, dir_start: ClusterIndex, name: &str) -> Result<Option<(RecordLocation, FileDescriptorRecord)>> {
        let records_per_cluster = self.records_per_cluster();
        for cluster in self.chain_clusters(dir_start)? {
            for record_index in 0..records_per_cluster {
                let record = self.read_record(cluster, record_index)?;
                if record.is_slot_empty() {
                    return Ok(None);
                }
                if record.attributes().contains(FileAttributes::DELETED) {
                    continue;
                }
                if record.name_str().eq_ignore_ascii_case(name) {
                    return Ok(Some((RecordLocation { cluster, record_index }, record)));
                }
            }
        }
        Ok(None)
    }

    /// Finds the first empty-or-deleted slot in a directory's chain, if
    /// any; `None` means the directory must be extended by one cluster.
    fn find_free_slot(&self, dir_start: ClusterIndex) -> Result<Option<RecordLocation>> {
        let records_per_cluster = self.records_per_cluster();
        for cluster in self.chain_clusters(dir_start)? {
            for record_index in 0..records_per_cluster {
                let record = self.read_record(cluster, record_index)?;
                if record.is_slot_empty() || record.attributes().contains(FileAttributes::DELETED) {
                    return Ok(Some(RecordLocation { cluster, record_index }));
                }
            }
        }
        Ok(None)
    }

    fn resolve_directory(&self, components: &[String]) -> Result<ClusterIndex> {
        if components.len() as u32 > MAX_NESTED_DIRECTORIES {
            return Err(Error::invalid_argument("path exceeds the maximum nesting depth"));
        }
        let mut current = ROOT_CLUSTER;
        for component in components {
            match self.find_in_directory(current, component)? {
                Some((_, record)) if record.is_directory() => current = record.start_cluster(),
                Some(_) => return Err(Error::invalid_argument("path component is a file, not a directory")),
                None => return Err(Error::not_found()),
            }
        }
        Ok(current)
    }

    fn resolve_parent_and_name(&self, path: &str) -> Result<(ClusterIndex, String)> {
        let (parent_components, name) = path::parent_and_name(path).ok_or_else(|| Error::invalid_argument("path has no name component"))?;
        let parent = self.resolve_directory(&parent_components)?;
        Ok((parent, name))
    }

    pub fn file_exists(&self, path: &str) -> Result<bool> {
        match self.resolve_parent_and_name(path) {
            Ok((parent, name)) => Ok(self
                .find_in_directory(parent, &name)?
                .map(|(_, r)| !r.is_directory())
                .unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }

    pub fn directory_exists(&self, path: &str) -> Result<bool> {
        if path::normalize(path).is_empty() {
            return Ok(true);
        }
        match self.resolve_parent_and_name(path) {
            Ok((parent, name)) => Ok(self
                .find_in_directory(parent, &name)?
                .map(|(_, r)| r.is_directory())
                .unwrap_or(false)),
            Err(_) => Ok(false),
        }
    }

    pub fn file_or_directory_exists(&self, path: &str) -> Result<bool> {
        Ok(self.file_exists(path)? || self.directory_exists(path)?)
    }

    /// Allocates `location`'s slot: either reuses the first free/deleted
    /// slot in the directory, or extends the directory chain by one
    /// (zeroed) cluster and uses its first slot.
    fn allocate_slot(&self, dir_start: ClusterIndex) -> Result<RecordLocation> {
        if let Some(location) = self.find_free_slot(dir_start)? {
            return Ok(location);
        }
        let clusters = self.chain_clusters(dir_start)?;
        if clusters.len() as u32 * self.records_per_cluster() >= MAX_ENTITIES_IN_DIRECTORY {
            return Err(Error::invalid_state("directory has reached its maximum entity count"));
        }
        let last = *clusters.last().ok_or_else(|| Error::invalid_state("directory has no clusters"))?;
        let new_cluster = self.append_cluster_to_end_of_chain(
            self.location(dir_start, 0),
            last,
            false,
        )?;
        let zeros = vec![0u8; self.volume.cluster_size() as usize];
        self.volume.write_cluster(new_cluster, &zeros)?;
        Ok(RecordLocation {
            cluster: new_cluster,
            record_index: 0,
        })
    }

    /// Allocates a free cluster, sets it `END_OF_CHAIN` carrying `location`,
    /// and if `end` was a valid existing tail, relinks it to point here and
    /// drops its own `END` flag. If `end` is `INVALID_CLUSTER` the new
    /// cluster also becomes `START_OF_CHAIN`. Directory chains allocate
    /// from the directory block; file chains from the file-data blocks.
    fn append_cluster_to_end_of_chain(&self, location: FileDescriptorLocation, end: ClusterIndex, use_file_data: bool) -> Result<ClusterIndex> {
        let new_cluster = self.volume.find_free_cluster(use_file_data)?;
        let mut new_cell = FatCellValue {
            free: false,
            is_start: end == INVALID_CLUSTER,
            is_end: true,
            prev: if end == INVALID_CLUSTER {
                HalfCell::Location(location)
            } else {
                HalfCell::Cluster(end)
            },
            next: HalfCell::Location(location),
        };
        if end != INVALID_CLUSTER {
            let mut old_end = self.volume.get_fat_cell(end)?;
            old_end.is_end = false;
            old_end.next = HalfCell::Cluster(new_cluster);
            self.volume.set_fat_cell(end, old_end)?;
        } else {
            new_cell.is_start = true;
        }
        self.volume.set_fat_cell(new_cluster, new_cell)?;
        Ok(new_cluster)
    }

    /// Relocates the contents of `src` to a freshly allocated cluster `dst`,
    /// relinking whichever neighbors pointed at `src` (or, for a
    /// single-cluster chain, rewriting both `start_cluster` and
    /// `last_cluster` on the owning record in one update). Used by the
    /// placement policy's defragmentation pass.
    fn move_cluster(&self, src: ClusterIndex) -> Result<ClusterIndex> {
        let src_cell = self.volume.get_fat_cell(src)?;
        let dst = self.volume.find_free_cluster(true)?;
        let data = self.volume.read_cluster(src)?;
        self.volume.write_cluster(dst, &data)?;

        let mut dst_cell = src_cell;
        self.volume.set_fat_cell(dst, dst_cell)?;

        if let Some(prev) = src_cell.prev_cluster() {
            let mut prev_cell = self.volume.get_fat_cell(prev)?;
            prev_cell.next = HalfCell::Cluster(dst);
            self.volume.set_fat_cell(prev, prev_cell)?;
        }
        if let Some(next) = src_cell.next_cluster() {
            let mut next_cell = self.volume.get_fat_cell(next)?;
            next_cell.prev = HalfCell::Cluster(dst);
            self.volume.set_fat_cell(next, next_cell)?;
        }

        if let Some(location) = src_cell.start_location() {
            let mut record = self.read_record(location.descriptor_cluster_index, location.record_index)?;
            record.start_cluster = dst.into();
            // A single-cluster chain has `start_cluster == last_cluster`: one
            // write covers both ends.
            if src_cell.is_end {
                record.last_cluster = dst.into();
            }
            self.write_record(location.descriptor_cluster_index, location.record_index, &record)?;
        } else if let Some(location) = src_cell.end_location() {
            let mut record = self.read_record(location.descriptor_cluster_index, location.record_index)?;
            record.last_cluster = dst.into();
            self.write_record(location.descriptor_cluster_index, location.record_index, &record)?;
        }

        self.volume.set_fat_cell(src, FatCellValue::free())?;
        dst_cell.free = false;
        Ok(dst)
    }

    /// Recovers the owning path-independent location of a chain from one of
    /// its clusters by walking to its start and reading the embedded
    /// descriptor location, without needing a directory lookup.
    pub fn find_file_from_cluster(&self, cluster: ClusterIndex) -> Result<Option<FileDescriptorRecord>> {
        let mut current = cluster;
        loop {
            let cell = self.volume.get_fat_cell(current)?;
            if let Some(location) = cell.start_location() {
                let record = self.read_record(location.descriptor_cluster_index, location.record_index)?;
                return Ok(Some(record));
            }
            match cell.prev_cluster() {
                Some(prev) => current = prev,
                None => return Ok(None),
            }
        }
    }

    fn get_cluster_for_position(&self, start_cluster: ClusterIndex, position: u64) -> Result<ClusterIndex> {
        let steps = position / self.volume.cluster_size() as u64;
        let mut current = start_cluster;
        for _ in 0..steps {
            let cell = self.volume.get_fat_cell(current)?;
            current = cell
                .next_cluster()
                .ok_or_else(|| Error::Fs(FsError::Corruption(splitfat_err::CorruptionKind::ChainInconsistency { cluster: current })))?;
        }
        Ok(current)
    }

    /// Grows `record`'s chain to cover `new_size`; never shrinks. Patches
    /// `start_cluster` on the first allocation and always updates
    /// `last_cluster`/`size`/`modified_time`. On partial failure (volume
    /// full) the record is updated to reflect however many clusters were
    /// actually allocated, and the error is still returned.
    fn expand_file(&self, location: RecordLocation, record: &mut FileDescriptorRecord, new_size: u64) -> Result<()> {
        if new_size <= record.size() {
            return Ok(());
        }
        let cluster_size = self.volume.cluster_size() as u64;
        let current_clusters = if record.size() == 0 { 0 } else { record.size().div_ceil(cluster_size) };
        let needed_clusters = new_size.div_ceil(cluster_size);
        let mut end = record.last_cluster();
        let mut allocated = current_clusters;
        let record_location = self.location(location.cluster, location.record_index);
        let mut alloc_result = Ok(());
        for _ in current_clusters..needed_clusters {
            match self.append_cluster_to_end_of_chain(record_location, end, true) {
                Ok(new_cluster) => {
                    if end == INVALID_CLUSTER {
                        record.start_cluster = new_cluster.into();
                    }
                    end = new_cluster;
                    allocated += 1;
                }
                Err(err) => {
                    alloc_result = Err(err);
                    break;
                }
            }
        }
        record.last_cluster = end.into();
        record.size = if alloc_result.is_ok() {
            new_size.into()
        } else {
            (allocated * cluster_size).into()
        };
        self.write_record(location.cluster, location.record_index, record)?;
        alloc_result
    }

    /// Frees every cluster in `record`'s chain from the one containing
    /// `new_size - 1` onward, or the whole chain when `new_size == 0`.
    fn truncate(&self, location: RecordLocation, record: &mut FileDescriptorRecord, new_size: u64, delete_if_empty: bool) -> Result<()> {
        if new_size >= record.size() {
            return Ok(());
        }
        if new_size == 0 {
            if delete_if_empty && record.is_directory() {
                let records_per_cluster = self.records_per_cluster();
                for cluster in self.chain_clusters(record.start_cluster())? {
                    for record_index in 0..records_per_cluster {
                        if !self.read_record(cluster, record_index)?.is_slot_empty() {
                            return Err(Error::invalid_state("directory is not empty"));
                        }
                    }
                }
            }
            for cluster in self.chain_clusters(record.start_cluster())? {
                self.volume.set_fat_cell(cluster, FatCellValue::free())?;
            }
            record.start_cluster = INVALID_CLUSTER.into();
            record.last_cluster = INVALID_CLUSTER.into();
            record.size = 0.into();
        } else {
            let keep_cluster = self.get_cluster_for_position(record.start_cluster(), new_size - 1)?;
            let record_location = self.location(location.cluster, location.record_index);
            let clusters = self.chain_clusters(record.start_cluster())?;
            let keep_idx = clusters.iter().position(|&c| c == keep_cluster).unwrap_or(0);
            for &cluster in &clusters[keep_idx + 1..] {
                self.volume.set_fat_cell(cluster, FatCellValue::free())?;
            }
            self.volume.set_fat_cell(
                keep_cluster,
                FatCellValue::single_cluster_chain(record_location),
            )?;
            record.last_cluster = keep_cluster.into();
            record.size = new_size.into();
        }
        self.write_record(location.cluster, location.record_index, record)
    }

    pub fn create_file(&self, path: &str, mode: &str, binary: bool) -> Result<FileManipulator> {
        let access = AccessMode::parse(mode)?;
        let (parent, name) = self.resolve_parent_and_name(path)?;
        if self.find_in_directory(parent, &name)?.is_some() {
            return Err(Error::Fs(FsError::Exists));
        }
        let location = self.allocate_slot(parent)?;
        let mut record = FileDescriptorRecord::empty();
        record.set_name(&name)?;
        let mut attrs = FileAttributes::FILE;
        if binary {
            attrs |= FileAttributes::BINARY;
        }
        record.attributes = attrs.bits().into();
        self.write_record(location.cluster, location.record_index, &record)?;
        Ok(FileManipulator {
            record,
            location,
            mode: access,
            position: 0,
        })
    }

    pub fn create_directory(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent_and_name(path)?;
        if self.find_in_directory(parent, &name)?.is_some() {
            return Err(Error::Fs(FsError::Exists));
        }
        let location = self.allocate_slot(parent)?;
        let mut record = FileDescriptorRecord::empty();
        record.set_name(&name)?;
        record.attributes = FileAttributes::empty().bits().into();
        let dir_cluster = self.volume.find_free_cluster(false)?;
        let self_location = self.location(dir_cluster, 0);
        self.volume.set_fat_cell(dir_cluster, FatCellValue::single_cluster_chain(self_location))?;
        let zeros = vec![0u8; self.volume.cluster_size() as usize];
        self.volume.write_cluster(dir_cluster, &zeros)?;
        record.start_cluster = dir_cluster.into();
        record.last_cluster = dir_cluster.into();
        self.write_record(location.cluster, location.record_index, &record)
    }

    pub fn open(&self, path: &str, mode: &str) -> Result<FileManipulator> {
        let access = AccessMode::parse(mode)?;
        let (parent, name) = self.resolve_parent_and_name(path)?;
        match self.find_in_directory(parent, &name)? {
            Some((location, record)) => {
                if record.is_directory() {
                    return Err(Error::invalid_argument("cannot open a directory as a file"));
                }
                let position = if access.contains(AccessMode::APPEND) { record.size() } else { 0 };
                Ok(FileManipulator {
                    record,
                    location,
                    mode: access,
                    position,
                })
            }
            None if access.contains(AccessMode::CREATE_IF_MISSING) => {
                self.create_file(path, mode, access.contains(AccessMode::BINARY))
            }
            None => Err(Error::not_found()),
        }
    }

    pub fn read(&self, fm: &mut FileManipulator, buf: &mut [u8]) -> Result<usize> {
        if !fm.mode.contains(AccessMode::READ) {
            return Err(Error::invalid_state("file handle is not open for reading"));
        }
        let remaining = fm.record.size().saturating_sub(fm.position);
        let to_read = (buf.len() as u64).min(remaining) as usize;
        if to_read == 0 || fm.record.start_cluster() == INVALID_CLUSTER {
            return Ok(0);
        }
        let cluster_size = self.volume.cluster_size() as u64;
        let mut read_so_far = 0usize;
        while read_so_far < to_read {
            let cluster = self.get_cluster_for_position(fm.record.start_cluster(), fm.position)?;
            let data = self.volume.read_cluster(cluster)?;
            let offset_in_cluster = (fm.position % cluster_size) as usize;
            let chunk = (to_read - read_so_far).min(data.len() - offset_in_cluster);
            buf[read_so_far..read_so_far + chunk].copy_from_slice(&data[offset_in_cluster..offset_in_cluster + chunk]);
            read_so_far += chunk;
            fm.position += chunk as u64;
        }
        Ok(read_so_far)
    }

    pub fn write(&self, fm: &mut FileManipulator, buf: &[u8]) -> Result<usize> {
        if !fm.mode.contains(AccessMode::WRITE) {
            return Err(Error::invalid_state("file handle is not open for writing"));
        }
        if fm.mode.contains(AccessMode::APPEND) {
            fm.position = fm.record.size();
        }
        let end_position = fm.position + buf.len() as u64;
        self.expand_file(fm.location, &mut fm.record, end_position)?;

        let cluster_size = self.volume.cluster_size() as usize;
        let mut written = 0usize;
        while written < buf.len() {
            let cluster = self.get_cluster_for_position(fm.record.start_cluster(), fm.position)?;
            let offset_in_cluster = (fm.position as usize) % cluster_size;
            let chunk = (buf.len() - written).min(cluster_size - offset_in_cluster);
            let full_cluster_write = offset_in_cluster == 0 && chunk == cluster_size;
            let mut data = if full_cluster_write {
                vec![0u8; cluster_size]
            } else {
                self.volume.read_cluster(cluster)?
            };
            data[offset_in_cluster..offset_in_cluster + chunk].copy_from_slice(&buf[written..written + chunk]);
            self.volume.write_cluster(cluster, &data)?;
            written += chunk;
            fm.position += chunk as u64;
        }
        self.write_record(fm.location.cluster, fm.location.record_index, &fm.record)?;
        Ok(written)
    }

    pub fn seek(&self, fm: &mut FileManipulator, position: u64) -> Result<u64> {
        fm.position = position;
        Ok(fm.position)
    }

    pub fn truncate_file(&self, fm: &mut FileManipulator, new_size: u64) -> Result<()> {
        self.truncate(fm.location, &mut fm.record, new_size, false)?;
        if fm.position > new_size {
            fm.position = new_size;
        }
        Ok(())
    }

    fn mark_deleted(&self, location: RecordLocation) -> Result<()> {
        let mut record = self.read_record(location.cluster, location.record_index)?;
        let attrs = record.attributes() | FileAttributes::DELETED;
        record.attributes = attrs.bits().into();
        self.write_record(location.cluster, location.record_index, &record)
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent_and_name(path)?;
        let (location, mut record) = self
            .find_in_directory(parent, &name)?
            .ok_or_else(Error::not_found)?;
        if record.is_directory() {
            return Err(Error::invalid_argument("path is a directory, not a file"));
        }
        self.truncate(location, &mut record, 0, false)?;
        self.mark_deleted(location)
    }

    pub fn remove_directory(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent_and_name(path)?;
        let (location, mut record) = self
            .find_in_directory(parent, &name)?
            .ok_or_else(Error::not_found)?;
        if !record.is_directory() {
            return Err(Error::invalid_argument("path is a file, not a directory"));
        }
        self.truncate(location, &mut record, 0, true)?;
        self.mark_deleted(location)
    }

    fn rename_entity(&self, from: &str, to: &str, expect_directory: bool) -> Result<()> {
        let (src_parent, src_name) = self.resolve_parent_and_name(from)?;
        let (dst_parent, dst_name) = self.resolve_parent_and_name(to)?;
        let (location, mut record) = self
            .find_in_directory(src_parent, &src_name)?
            .ok_or_else(Error::not_found)?;
        if record.is_directory() != expect_directory {
            return Err(Error::invalid_argument("entity kind mismatch for rename"));
        }
        if src_parent == dst_parent {
            record.set_name(&dst_name)?;
            self.write_record(location.cluster, location.record_index, &record)
        } else {
            if self.find_in_directory(dst_parent, &dst_name)?.is_some() {
                return Err(Error::Fs(FsError::Exists));
            }
            let new_location = self.allocate_slot(dst_parent)?;
            record.set_name(&dst_name)?;
            self.write_record(new_location.cluster, new_location.record_index, &record)?;
            self.mark_deleted(location)
        }
    }

    pub fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        self.rename_entity(from, to, false)
    }

    pub fn rename_directory(&self, from: &str, to: &str) -> Result<()> {
        self.rename_entity(from, to, true)
    }

    pub fn flush(&self) -> Result<()> {
        self.volume.flush()
    }

    /// Begins a write transaction; re-entrant for the thread that already
    /// owns it. Every write made while a transaction is open is logged with
    /// a pre-image and, for directory clusters, deferred to commit so a
    /// crash before `commit_transaction` leaves the volume exactly as it
    /// was before `start_transaction`.
    pub fn start_transaction(&self) -> Result<bool> {
        self.volume.start_transaction()
    }

    /// Commits the open transaction, then opportunistically relocates the
    /// file-data clusters of whichever block the placement policy flagged
    /// as fragmented, itself wrapped in its own transaction so a crash
    /// mid-move can still recover. Directory-block clusters are never
    /// moved this way: a directory chain's FAT cells point at themselves
    /// rather than at an external owning record (see
    /// [`find_file_from_cluster`](Self::find_file_from_cluster)), so
    /// `move_cluster`'s "patch the owning record" step would corrupt the
    /// directory instead of relocating it. Defragmentation failures are
    /// logged, never propagated: they must not turn a successful commit
    /// into an error.
    pub fn commit_transaction(&self) -> Result<()> {
        self.volume.commit_transaction()?;
        self.run_opportunistic_defragmentation();
        Ok(())
    }

    fn run_opportunistic_defragmentation(&self) {
        let Some(block_index) = self.volume.degraded_block() else {
            return;
        };
        if block_index == DIRECTORY_BLOCK_INDEX {
            return;
        }
        let clusters: Vec<ClusterIndex> = self
            .volume
            .clusters_in_block(block_index)
            .into_iter()
            .filter(|&cluster| matches!(self.volume.get_fat_cell(cluster), Ok(cell) if !cell.free))
            .collect();
        if clusters.is_empty() {
            return;
        }
        if let Err(err) = self.volume.start_transaction() {
            log::warn!("defragmentation could not start its own transaction: {err}");
            return;
        }
        for cluster in clusters {
            if let Err(err) = self.move_cluster(cluster) {
                log::warn!("defragmentation move of cluster {cluster} failed: {err}");
            }
        }
        if let Err(err) = self.volume.commit_transaction() {
            log::warn!("defragmentation transaction failed to commit: {err}");
        }
    }

    pub fn get_free_space(&self) -> Result<u64> {
        let free_clusters = self.volume.free_cluster_count()?;
        Ok(free_clusters as u64 * self.volume.cluster_size() as u64)
    }

    fn iterate_directory_inner(
        &self,
        dir_start: ClusterIndex,
        prefix: &str,
        flags: DirectoryIterationFlags,
        callback: &mut dyn FnMut(&DirectoryEntry) -> IterationControl,
    ) -> Result<bool> {
        let records_per_cluster = self.records_per_cluster();
        for cluster in self.chain_clusters(dir_start)? {
            for record_index in 0..records_per_cluster {
                let record = self.read_record(cluster, record_index)?;
                if record.is_slot_empty() {
                    return Ok(true);
                }
                let attrs = record.attributes();
                if attrs.contains(FileAttributes::DELETED) || attrs.contains(FileAttributes::HIDDEN) {
                    continue;
                }
                let is_directory = record.is_directory();
                let wants_this = (is_directory && flags.contains(DirectoryIterationFlags::DIRECTORY))
                    || (!is_directory && flags.contains(DirectoryIterationFlags::FILE));
                if wants_this {
                    let entry = DirectoryEntry {
                        name: record.name_str().to_string(),
                        attributes: attrs,
                        size: record.size(),
                        is_directory,
                    };
                    if matches!(callback(&entry), IterationControl::Stop) {
                        return Ok(false);
                    }
                }
                if is_directory && flags.contains(DirectoryIterationFlags::RECURSIVE) {
                    let child_prefix = format!("{prefix}{}/", record.name_str());
                    let keep_going = self.iterate_directory_inner(record.start_cluster(), &child_prefix, flags, callback)?;
                    if !keep_going {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    pub fn iterate_directory(
        &self,
        path: &str,
        flags: DirectoryIterationFlags,
        mut callback: impl FnMut(&DirectoryEntry) -> IterationControl,
    ) -> Result<()> {
        let start = self.resolve_directory(&path::normalize(path))?;
        self.iterate_directory_inner(start, "", flags, &mut callback)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitfat_io_std::StdByteFileSystem;

    fn new_vfs(dir: &std::path::Path) -> VirtualFileSystem<StdByteFileSystem> {
        let volume = VolumeManager::new(StdByteFileSystem, dir.join("volume").to_str().unwrap());
        volume.create_if_does_not_exist(&crate::VolumeConfig::default()).unwrap();
        VirtualFileSystem::new(volume).unwrap()
    }

    #[test]
    fn create_and_read_back_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = new_vfs(dir.path());
        let mut fm = vfs.create_file("/hello.txt", "w+", false).unwrap();
        let written = vfs.write(&mut fm, b"hello splitfat").unwrap();
        assert_eq!(written, 14);
        vfs.seek(&mut fm, 0).unwrap();
        let mut buf = [0u8; 14];
        let read = vfs.read(&mut fm, &mut buf).unwrap();
        assert_eq!(read, 14);
        assert_eq!(&buf, b"hello splitfat");
    }

    #[test]
    fn access_mode_parses_posix_subset() {
        let mode = AccessMode::parse("rb").unwrap();
        assert!(mode.contains(AccessMode::READ));
        assert!(mode.contains(AccessMode::BINARY));
        assert!(AccessMode::parse("q").is_err());
    }

    #[test]
    fn creating_directory_then_nested_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = new_vfs(dir.path());
        vfs.create_directory("/docs").unwrap();
        assert!(vfs.directory_exists("/docs").unwrap());
        let mut fm = vfs.create_file("/docs/readme.md", "w+", false).unwrap();
        vfs.write(&mut fm, b"content").unwrap();
        assert!(vfs.file_exists("/docs/readme.md").unwrap());
    }

    #[test]
    fn deleting_a_file_frees_its_chain() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = new_vfs(dir.path());
        let mut fm = vfs.create_file("/a.bin", "w+", true).unwrap();
        let payload = vec![1u8; vfs.volume().cluster_size() as usize * 2];
        vfs.write(&mut fm, &payload).unwrap();
        vfs.delete_file("/a.bin").unwrap();
        assert!(!vfs.file_exists("/a.bin").unwrap());
    }
}
