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

use std::{
    cell::Cell,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    sync::Mutex,
};

use splitfat_err::{Error, IoError};
use splitfat_io::{ByteFile, ByteFileSystem};

/// `ByteFile` over a `std::fs::File`, using positioned reads/writes so a
/// single handle can be shared across threads without a shared cursor.
pub struct StdByteFile {
    file: Mutex<Option<File>>,
    position: Cell<u64>,
}

unsafe impl Sync for StdByteFile {}

impl StdByteFile {
    fn new(file: File) -> Self {
        Self {
            file: Mutex::new(Some(file)),
            position: Cell::new(0),
        }
    }
}

impl ByteFile for StdByteFile {
    fn is_open(&self) -> bool {
        self.file.lock().unwrap().is_some()
    }

    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> splitfat_err::Result<()> {
        let guard = self.file.lock().unwrap();
        let file = guard.as_ref().ok_or(Error::Io(IoError::NotOpen))?;
        file.read_exact_at(buffer, offset)
            .map_err(|_| Error::Io(IoError::Read { offset }))
    }

    fn write_at(&self, offset: u64, buffer: &[u8]) -> splitfat_err::Result<()> {
        let guard = self.file.lock().unwrap();
        let file = guard.as_ref().ok_or(Error::Io(IoError::NotOpen))?;
        file.write_all_at(buffer, offset)
            .map_err(|_| Error::Io(IoError::Write { offset }))
    }

    fn flush(&self) -> splitfat_err::Result<()> {
        let guard = self.file.lock().unwrap();
        let file = guard.as_ref().ok_or(Error::Io(IoError::NotOpen))?;
        file.sync_all().map_err(|_| Error::Io(IoError::Flush))
    }

    fn seek(&self, position: u64) -> splitfat_err::Result<()> {
        self.position.set(position);
        Ok(())
    }

    fn get_position(&self) -> splitfat_err::Result<u64> {
        Ok(self.position.get())
    }

    fn get_size(&self) -> splitfat_err::Result<u64> {
        let guard = self.file.lock().unwrap();
        let file = guard.as_ref().ok_or(Error::Io(IoError::NotOpen))?;
        file.metadata()
            .map(|m| m.len())
            .map_err(|_| Error::Io(IoError::Read { offset: 0 }))
    }

    fn set_size(&self, size: u64) -> splitfat_err::Result<()> {
        let guard = self.file.lock().unwrap();
        let file = guard.as_ref().ok_or(Error::Io(IoError::NotOpen))?;
        file.set_len(size)
            .map_err(|_| Error::Io(IoError::Write { offset: size }))
    }

    fn close(&mut self) -> splitfat_err::Result<()> {
        *self.file.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct StdByteFileSystem;

impl ByteFileSystem for StdByteFileSystem {
    type File = StdByteFile;

    fn open(&self, path: &str) -> splitfat_err::Result<Self::File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(StdByteFile::new)
            .map_err(|e| {
                log::error!("failed to open {path}: {e}");
                Error::Io(IoError::Open)
            })
    }

    fn create(&self, path: &str) -> splitfat_err::Result<Self::File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map(StdByteFile::new)
            .map_err(|e| {
                log::error!("failed to create {path}: {e}");
                Error::Io(IoError::Open)
            })
    }

    fn exists(&self, path: &str) -> splitfat_err::Result<bool> {
        Ok(Path::new(path).exists())
    }

    fn rename(&self, from: &str, to: &str) -> splitfat_err::Result<()> {
        std::fs::rename(from, to).map_err(|e| {
            log::error!("failed to rename {from} to {to}: {e}");
            Error::Io(IoError::Rename)
        })
    }

    fn remove(&self, path: &str) -> splitfat_err::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                log::error!("failed to remove {path}: {e}");
                Err(Error::Io(IoError::Delete))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.dat");
        let fs = StdByteFileSystem;
        let file = fs.create(path.to_str().unwrap()).unwrap();
        file.write_at(0, b"hello splitfat").unwrap();
        file.flush().unwrap();
        let mut buf = [0u8; 14];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello splitfat");
    }

    #[test]
    fn rename_is_the_commit_linearization_point() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("_trans_temp");
        let committed = dir.path().join("_trans");
        let fs = StdByteFileSystem;
        fs.create(temp.to_str().unwrap()).unwrap();
        assert!(fs.exists(temp.to_str().unwrap()).unwrap());
        assert!(!fs.exists(committed.to_str().unwrap()).unwrap());
        fs.rename(temp.to_str().unwrap(), committed.to_str().unwrap())
            .unwrap();
        assert!(!fs.exists(temp.to_str().unwrap()).unwrap());
        assert!(fs.exists(committed.to_str().unwrap()).unwrap());
    }
}
