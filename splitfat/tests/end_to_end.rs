//! End-to-end exercises against the public [`VirtualFileSystem`] surface,
//! backed by real files on disk via [`splitfat_io_std::StdByteFileSystem`].

use splitfat::vfs::{AccessMode, DirectoryIterationFlags, IterationControl, VirtualFileSystem};
use splitfat::{Error, FsError, VolumeConfig, VolumeManager};
use splitfat_io_std::StdByteFileSystem;

fn open_vfs(dir: &std::path::Path) -> VirtualFileSystem<StdByteFileSystem> {
    let volume = VolumeManager::new(StdByteFileSystem, dir.join("volume").to_str().unwrap());
    volume.create_if_does_not_exist(&VolumeConfig::default()).unwrap();
    VirtualFileSystem::new(volume).unwrap()
}

/// Deterministic xorshift32, used instead of a `rand` dependency so the
/// large-payload test is reproducible without pulling in randomness at all.
struct XorShift32(u32);

impl XorShift32 {
    fn new(seed: u32) -> Self {
        Self(seed)
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

#[test]
fn creates_nested_directories_and_files_then_lists_them() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    vfs.create_directory("/docs").unwrap();
    vfs.create_directory("/docs/reports").unwrap();
    let mut fm = vfs.create_file("/docs/reports/q1.txt", "w+", false).unwrap();
    vfs.write(&mut fm, b"quarterly numbers").unwrap();

    assert!(vfs.directory_exists("/docs").unwrap());
    assert!(vfs.directory_exists("/docs/reports").unwrap());
    assert!(vfs.file_exists("/docs/reports/q1.txt").unwrap());
    assert!(!vfs.file_exists("/docs/reports/q2.txt").unwrap());

    let mut seen = Vec::new();
    vfs.iterate_directory("/docs/reports", DirectoryIterationFlags::FILE, |entry| {
        seen.push(entry.name.clone());
        IterationControl::Continue
    })
    .unwrap();
    assert_eq!(seen, vec!["q1.txt"]);
}

#[test]
fn recursive_iteration_visits_nested_entries() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    vfs.create_directory("/a").unwrap();
    vfs.create_directory("/a/b").unwrap();
    vfs.create_file("/a/one.txt", "w", false).unwrap();
    vfs.create_file("/a/b/two.txt", "w", false).unwrap();

    let mut names = Vec::new();
    let flags = DirectoryIterationFlags::FILE | DirectoryIterationFlags::DIRECTORY | DirectoryIterationFlags::RECURSIVE;
    vfs.iterate_directory("/a", flags, |entry| {
        names.push(entry.name.clone());
        IterationControl::Continue
    })
    .unwrap();
    names.sort();
    assert_eq!(names, vec!["b", "one.txt", "two.txt"]);
}

#[test]
fn append_mode_writes_land_after_existing_content() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    let mut fm = vfs.create_file("/log.txt", "w+", false).unwrap();
    vfs.write(&mut fm, b"first ").unwrap();

    let mut fm = vfs.open("/log.txt", "a").unwrap();
    vfs.write(&mut fm, b"second").unwrap();

    let mut fm = vfs.open("/log.txt", "r").unwrap();
    let mut buf = vec![0u8; fm.size() as usize];
    vfs.read(&mut fm, &mut buf).unwrap();
    assert_eq!(&buf, b"first second");
}

#[test]
fn rename_across_directories_moves_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    vfs.create_directory("/src").unwrap();
    vfs.create_directory("/dst").unwrap();
    let mut fm = vfs.create_file("/src/a.txt", "w+", false).unwrap();
    vfs.write(&mut fm, b"payload").unwrap();

    vfs.rename_file("/src/a.txt", "/dst/a.txt").unwrap();
    assert!(!vfs.file_exists("/src/a.txt").unwrap());
    assert!(vfs.file_exists("/dst/a.txt").unwrap());

    let mut fm = vfs.open("/dst/a.txt", "r").unwrap();
    let mut buf = vec![0u8; fm.size() as usize];
    vfs.read(&mut fm, &mut buf).unwrap();
    assert_eq!(&buf, b"payload");
}

#[test]
fn deleting_a_file_then_recreating_it_reuses_the_slot() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    vfs.create_file("/a.txt", "w", false).unwrap();
    vfs.delete_file("/a.txt").unwrap();
    assert!(!vfs.file_exists("/a.txt").unwrap());

    vfs.create_file("/b.txt", "w", false).unwrap();
    assert!(vfs.file_exists("/b.txt").unwrap());
}

#[test]
fn removing_a_non_empty_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    vfs.create_directory("/full").unwrap();
    vfs.create_file("/full/x.txt", "w", false).unwrap();

    let err = vfs.remove_directory("/full").unwrap_err();
    assert!(matches!(err, Error::Fs(FsError::InvalidState(_))));
}

#[test]
fn opening_a_missing_file_without_create_flag_fails() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    let err = vfs.open("/nope.txt", "r").unwrap_err();
    assert!(matches!(err, Error::Fs(FsError::NotFound)));
}

#[test]
fn truncate_file_shrinks_reported_size() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    let mut fm = vfs.create_file("/grow.bin", "w+b", true).unwrap();
    vfs.write(&mut fm, &[1u8; 4096]).unwrap();
    assert_eq!(fm.size(), 4096);

    vfs.truncate_file(&mut fm, 10).unwrap();
    assert_eq!(fm.size(), 10);
}

#[test]
fn reopening_the_volume_preserves_previously_written_files() {
    let dir = tempfile::tempdir().unwrap();
    {
        let vfs = open_vfs(dir.path());
        let mut fm = vfs.create_file("/persist.txt", "w+", false).unwrap();
        vfs.write(&mut fm, b"still here").unwrap();
        vfs.flush().unwrap();
    }
    {
        let vfs = open_vfs(dir.path());
        let mut fm = vfs.open("/persist.txt", "r").unwrap();
        let mut buf = vec![0u8; fm.size() as usize];
        vfs.read(&mut fm, &mut buf).unwrap();
        assert_eq!(&buf, b"still here");
    }
}

#[test]
fn a_committed_transaction_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let vfs = open_vfs(dir.path());
        vfs.start_transaction().unwrap();
        let mut fm = vfs.create_file("/txn.txt", "w+", false).unwrap();
        vfs.write(&mut fm, b"committed").unwrap();
        vfs.commit_transaction().unwrap();
    }
    {
        let vfs = open_vfs(dir.path());
        let mut fm = vfs.open("/txn.txt", "r").unwrap();
        let mut buf = vec![0u8; fm.size() as usize];
        vfs.read(&mut fm, &mut buf).unwrap();
        assert_eq!(&buf, b"committed");
    }
}

#[test]
fn an_uncommitted_transaction_leaves_no_trace_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let vfs = open_vfs(dir.path());
        vfs.start_transaction().unwrap();
        let mut fm = vfs.create_file("/a.bin", "w+", false).unwrap();
        vfs.write(&mut fm, b"uncommitted").unwrap();
        assert!(vfs.file_exists("/a.bin").unwrap());
        // Dropped without calling commit_transaction: simulates a crash
        // mid-transaction. Nothing here should have reached disk.
    }
    {
        let vfs = open_vfs(dir.path());
        assert!(!vfs.file_exists("/a.bin").unwrap());
    }
}

#[test]
fn large_random_payload_round_trips_across_many_clusters() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    let mut rng = XorShift32::new(53);
    let mut payload = vec![0u8; 2 * 1024 * 1024];
    rng.fill(&mut payload);

    let mut fm = vfs.create_file("/random.bin", "w+b", true).unwrap();
    let written = vfs.write(&mut fm, &payload).unwrap();
    assert_eq!(written, payload.len());

    vfs.seek(&mut fm, 0).unwrap();
    let mut read_back = vec![0u8; payload.len()];
    let read = vfs.read(&mut fm, &mut read_back).unwrap();
    assert_eq!(read, payload.len());
    assert_eq!(read_back, payload);
}

#[test]
fn access_mode_rejects_garbage_and_empty_specifiers() {
    assert!(AccessMode::parse("q").is_err());
    assert!(AccessMode::parse("").is_err());
    assert!(AccessMode::parse("rb").is_ok());
}

#[test]
fn free_space_shrinks_after_allocating_a_large_file() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = open_vfs(dir.path());

    let before = vfs.get_free_space().unwrap();
    let mut fm = vfs.create_file("/big.bin", "w+b", true).unwrap();
    vfs.write(&mut fm, &vec![0u8; 512 * 1024]).unwrap();
    let after = vfs.get_free_space().unwrap();

    assert!(after < before);
}
