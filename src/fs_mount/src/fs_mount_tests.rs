use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::runtime::Runtime;

use dfs_lib::{
    AccessorRouter, DfsConnector, DfsError, FakeClock, FaultTolerantAccessor, MemDfs, RetryPolicy,
};
use fs_staging::{StagingStore, DEFAULT_ORPHAN_AGE};

use crate::fs_mount::DfsMount;
use crate::inode_table::ROOT_INO;

/// The accessor layer is pinned to a single attempt so injected failures
/// surface to the copy loop quickly; the mount's own policy drives the
/// upload retries under test.
fn test_mount_with(mem: &MemDfs, remote_root: &str, max_attempts: u32) -> (DfsMount, Arc<FakeClock>, TempDir) {
    let tmp = TempDir::new().expect("create temp dir");
    let runtime = Runtime::new().expect("create runtime");
    let clock = Arc::new(FakeClock::new());
    let pinned = RetryPolicy {
        max_attempts: 1,
        ..Default::default()
    };
    let accessor: Arc<dyn DfsConnector> = Arc::new(FaultTolerantAccessor::new(
        Arc::new(mem.clone()),
        pinned,
        clock.clone(),
    ));
    let router = AccessorRouter::new(vec![accessor]).expect("router");
    let staging = StagingStore::new(tmp.path(), DEFAULT_ORPHAN_AGE).expect("staging store");
    let policy = RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(5),
    };
    let mount = DfsMount::new(
        runtime,
        Arc::new(router),
        remote_root,
        staging,
        clock.clone(),
        policy,
        Duration::from_secs(5),
    );
    (mount, clock, tmp)
}

fn test_mount() -> (DfsMount, MemDfs, Arc<FakeClock>, TempDir) {
    let mem = MemDfs::new();
    let (mount, clock, tmp) = test_mount_with(&mem, "/", 5);
    (mount, mem, clock, tmp)
}

fn write_file(mount: &DfsMount, parent: u64, name: &str, data: &[u8]) {
    let (_attr, fh) = mount
        .create_file(parent, name, 0o644, libc::O_RDWR)
        .expect("create file");
    if !data.is_empty() {
        mount.write_handle(fh, 0, data).expect("write");
    }
    mount.release_handle(fh).expect("release");
}

fn read_all(mount: &DfsMount, parent: u64, name: &str) -> Vec<u8> {
    let (ino, attr) = mount.lookup_entry(parent, name).expect("lookup");
    let fh = mount.open_file(ino, libc::O_RDONLY).expect("open");
    let data = mount
        .read_handle(fh, 0, attr.size as u32 + 64)
        .expect("read");
    mount.release_handle(fh).expect("release");
    data
}

fn stage_file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .expect("read staging dir")
        .flatten()
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext == "stage")
                .unwrap_or(false)
        })
        .count()
}

#[test]
fn test_create_write_release_read() {
    let (mount, mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "hello.txt", b"hello world");
    assert_eq!(mem.contents("/hello.txt"), Some(b"hello world".to_vec()));
    assert_eq!(read_all(&mount, ROOT_INO, "hello.txt"), b"hello world");
}

#[test]
fn test_write_close_cycle_leaves_no_residue() {
    let (mount, mem, _clock, tmp) = test_mount();
    for i in 0..10 {
        let name = format!("f_{}", i);
        write_file(&mount, ROOT_INO, &name, b"test");
        assert_eq!(
            mem.contents(&format!("/{}", name)),
            Some(b"test".to_vec())
        );
        mount.unlink_path(ROOT_INO, &name).expect("unlink");
    }
    assert!(mem.paths().is_empty());
    assert_eq!(stage_file_count(tmp.path()), 0);
}

#[test]
fn test_overwrite_truncates() {
    let (mount, mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "somefile", b"123456790");
    let (_, attr) = mount.lookup_entry(ROOT_INO, "somefile").unwrap();
    assert_eq!(attr.size, 9);

    write_file(&mount, ROOT_INO, "somefile", b"abcde");
    let (_, attr) = mount.lookup_entry(ROOT_INO, "somefile").unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(read_all(&mount, ROOT_INO, "somefile"), b"abcde");
    assert_eq!(mem.contents("/somefile"), Some(b"abcde".to_vec()));
}

#[test]
fn test_truncate_grow_zero_fills() {
    let (mount, _mem, _clock, _tmp) = test_mount();
    let grow_to = 1024 * 1024u64;
    let (attr, fh) = mount
        .create_file(ROOT_INO, "somefile1", 0o644, libc::O_RDWR)
        .unwrap();
    assert_eq!(attr.size, 0);
    mount.truncate_handle(fh, grow_to).unwrap();
    mount.release_handle(fh).unwrap();

    let data = read_all(&mount, ROOT_INO, "somefile1");
    assert_eq!(data.len(), grow_to as usize);
    assert!(data.iter().all(|byte| *byte == 0));
}

#[test]
fn test_create_exclusive_fails_on_existing() {
    let (mount, _mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "f", b"x");
    let err = mount
        .create_file(ROOT_INO, "f", 0o644, libc::O_RDWR | libc::O_EXCL)
        .unwrap_err();
    assert_eq!(err, libc::EEXIST);
}

#[test]
fn test_empty_file_reads_zero_bytes() {
    let (mount, mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "empty", b"");
    let (_, attr) = mount.lookup_entry(ROOT_INO, "empty").unwrap();
    assert_eq!(attr.size, 0);
    assert_eq!(mem.contents("/empty"), Some(Vec::new()));
    assert!(read_all(&mount, ROOT_INO, "empty").is_empty());
}

#[test]
fn test_read_past_eof_is_empty_not_error() {
    let (mount, _mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "short", b"abc");
    let (ino, _) = mount.lookup_entry(ROOT_INO, "short").unwrap();
    let fh = mount.open_file(ino, libc::O_RDONLY).unwrap();
    let data = mount.read_handle(fh, 100, 4096).unwrap();
    assert!(data.is_empty());
    mount.release_handle(fh).unwrap();
}

#[test]
fn test_stat_reflects_staged_writes_before_flush() {
    let (mount, mem, _clock, _tmp) = test_mount();
    let (attr, fh) = mount
        .create_file(ROOT_INO, "staged", 0o644, libc::O_RDWR)
        .unwrap();
    mount.write_handle(fh, 0, b"0123456789").unwrap();

    let live = mount.getattr_entry(attr.ino).unwrap();
    assert_eq!(live.size, 10);
    // Nothing reached the remote yet.
    assert_eq!(mem.contents("/staged"), Some(Vec::new()));
    mount.release_handle(fh).unwrap();
    assert_eq!(mem.contents("/staged"), Some(b"0123456789".to_vec()));
}

#[test]
fn test_rename_while_open_flushes_to_new_path() {
    let (mount, mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "somefile", b"initial data\nadsf\n");

    let (ino, _) = mount.lookup_entry(ROOT_INO, "somefile").unwrap();
    let c1 = mount.open_file(ino, libc::O_RDWR).unwrap();
    let c2 = mount.open_file(ino, libc::O_RDWR).unwrap();
    let c3 = mount.open_file(ino, libc::O_RDWR).unwrap();

    mount.write_handle(c1, 0, b"First client\n").unwrap();
    mount.release_handle(c1).unwrap();

    mount
        .rename_path(ROOT_INO, "somefile", ROOT_INO, "somefile.bak")
        .unwrap();

    mount
        .write_handle(c2, 0, b"Second client\nSecond client\n")
        .unwrap();
    mount.release_handle(c2).unwrap();
    mount
        .write_handle(c3, 0, b"Third client\nThird client\nThird Client\n")
        .unwrap();
    mount.release_handle(c3).unwrap();

    // Writers that closed after the rename landed at the new path.
    assert!(mem.contents("/somefile").is_none());
    let moved = mem.contents("/somefile.bak").expect("renamed file exists");
    assert!(!moved.is_empty());
    assert!(!read_all(&mount, ROOT_INO, "somefile.bak").is_empty());
    assert_eq!(
        mount.lookup_entry(ROOT_INO, "somefile").unwrap_err(),
        libc::ENOENT
    );
}

#[test]
fn test_unlink_while_open_keeps_flush_target() {
    let (mount, mem, _clock, _tmp) = test_mount();
    let (_attr, fh) = mount
        .create_file(ROOT_INO, "ghost", 0o644, libc::O_RDWR)
        .unwrap();
    mount.write_handle(fh, 0, b"still here").unwrap();

    mount.unlink_path(ROOT_INO, "ghost").unwrap();
    assert!(mem.contents("/ghost").is_none());

    // The open handle still flushes to the configured target path.
    mount.flush_handle(fh, "flush").unwrap();
    assert_eq!(mem.contents("/ghost"), Some(b"still here".to_vec()));
    mount.release_handle(fh).unwrap();
}

#[test]
fn test_readdir_and_subdir_remount() {
    let (mount, mem, _clock, _tmp) = test_mount();
    for d in 0..5 {
        let dir_attr = mount
            .mkdir_path(ROOT_INO, &format!("dir{}", d), 0o755)
            .expect("mkdir");
        for f in 0..3 {
            write_file(&mount, dir_attr.ino, &format!("file{}", f), b"initial data");
        }
    }
    let entries = mount.readdir_entries(ROOT_INO, 0).expect("readdir");
    // "." and ".." plus the five directories.
    assert_eq!(entries.len(), 7);

    let (submount, _clock, _tmp2) = test_mount_with(&mem, "/dir1", 5);
    let entries = submount.readdir_entries(ROOT_INO, 0).expect("readdir");
    let names: Vec<&str> = entries
        .iter()
        .skip(2)
        .map(|(_, _, name, _)| name.as_str())
        .collect();
    assert_eq!(names, vec!["file0", "file1", "file2"]);
}

#[test]
fn test_seek_read_parity_with_local_copy() {
    let (mount, mem, _clock, _tmp) = test_mount();
    let mut reference = Vec::new();
    for i in 0..2000u32 {
        reference.extend_from_slice(format!("{},", i).as_bytes());
    }
    mem.insert_file("/seektest", &reference);

    let (ino, _) = mount.lookup_entry(ROOT_INO, "seektest").unwrap();
    let fh = mount.open_file(ino, libc::O_RDONLY).unwrap();

    // Deterministic pseudo-random offsets.
    let mut state = 0x2545F4914F6CDD1Du64;
    for _ in 0..300 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let offset = (state % reference.len() as u64) as usize;
        let want_end = (offset + 4096).min(reference.len());
        let got = mount.read_handle(fh, offset as u64, 4096).unwrap();
        assert_eq!(&got[..], &reference[offset..want_end]);
    }
    // At EOF the read succeeds with zero bytes.
    let got = mount
        .read_handle(fh, reference.len() as u64, 4096)
        .unwrap();
    assert!(got.is_empty());
    mount.release_handle(fh).unwrap();
}

#[test]
fn test_flush_retries_transient_failures() {
    let (mount, mem, clock, _tmp) = test_mount();
    let (_attr, fh) = mount
        .create_file(ROOT_INO, "retry", 0o644, libc::O_RDWR)
        .unwrap();
    mount.write_handle(fh, 0, b"persistent data").unwrap();

    mem.inject_fault(DfsError::Transport("connection reset".to_string()));
    mem.inject_fault(DfsError::RemoteUnavailable("standby".to_string()));
    mount.flush_handle(fh, "flush").unwrap();

    assert_eq!(mem.contents("/retry"), Some(b"persistent data".to_vec()));
    // Two failed attempts, exponential backoff between them.
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(50), Duration::from_millis(100)]
    );
    mount.release_handle(fh).unwrap();
}

#[test]
fn test_flush_exhaustion_keeps_staging_for_later() {
    let mem = MemDfs::new();
    let (mount, _clock, tmp) = test_mount_with(&mem, "/", 1);
    let (_attr, fh) = mount
        .create_file(ROOT_INO, "stubborn", 0o644, libc::O_RDWR)
        .unwrap();
    mount.write_handle(fh, 0, b"do not lose me").unwrap();

    mem.inject_fault(DfsError::Transport("connection reset".to_string()));
    assert_eq!(mount.flush_handle(fh, "flush").unwrap_err(), libc::EIO);

    // The stage survives the failed upload and a later flush delivers it.
    assert_eq!(stage_file_count(tmp.path()), 1);
    assert_eq!(mem.contents("/stubborn"), Some(Vec::new()));
    mount.flush_handle(fh, "flush").unwrap();
    assert_eq!(mem.contents("/stubborn"), Some(b"do not lose me".to_vec()));
    mount.release_handle(fh).unwrap();
}

#[test]
fn test_flush_without_writes_is_noop() {
    let (mount, _mem, clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "clean", b"data");
    let (ino, _) = mount.lookup_entry(ROOT_INO, "clean").unwrap();
    let fh = mount.open_file(ino, libc::O_RDONLY).unwrap();
    mount.flush_handle(fh, "flush").unwrap();
    mount.release_handle(fh).unwrap();
    assert!(clock.sleeps().is_empty());
}

#[test]
fn test_released_handle_rejects_operations() {
    let (mount, _mem, _clock, _tmp) = test_mount();
    let (_attr, fh) = mount
        .create_file(ROOT_INO, "once", 0o644, libc::O_RDWR)
        .unwrap();
    mount.release_handle(fh).unwrap();

    assert_eq!(mount.read_handle(fh, 0, 16).unwrap_err(), libc::EBADF);
    assert_eq!(mount.write_handle(fh, 0, b"x").unwrap_err(), libc::EBADF);
    assert_eq!(mount.flush_handle(fh, "flush").unwrap_err(), libc::EBADF);
    assert_eq!(mount.release_handle(fh).unwrap_err(), libc::EBADF);
}

#[test]
fn test_staging_closes_when_last_handle_releases() {
    let (mount, _mem, _clock, tmp) = test_mount();
    write_file(&mount, ROOT_INO, "shared", b"shared content");

    let (ino, _) = mount.lookup_entry(ROOT_INO, "shared").unwrap();
    let writer = mount.open_file(ino, libc::O_RDWR).unwrap();
    let reader = mount.open_file(ino, libc::O_RDONLY).unwrap();

    mount.write_handle(writer, 0, b"SHARED").unwrap();
    assert_eq!(stage_file_count(tmp.path()), 1);

    // Both handles observe the staged bytes.
    let seen = mount.read_handle(reader, 0, 64).unwrap();
    assert_eq!(seen, b"SHARED content");

    mount.release_handle(writer).unwrap();
    // One handle still open: the stage must survive.
    assert_eq!(stage_file_count(tmp.path()), 1);

    mount.release_handle(reader).unwrap();
    assert_eq!(stage_file_count(tmp.path()), 0);
}

#[test]
fn test_lookup_missing_is_enoent() {
    let (mount, _mem, _clock, _tmp) = test_mount();
    assert_eq!(
        mount.lookup_entry(ROOT_INO, "nope").unwrap_err(),
        libc::ENOENT
    );
}

#[test]
fn test_mkdir_existing_is_eexist() {
    let (mount, _mem, _clock, _tmp) = test_mount();
    mount.mkdir_path(ROOT_INO, "d", 0o755).unwrap();
    assert_eq!(
        mount.mkdir_path(ROOT_INO, "d", 0o755).unwrap_err(),
        libc::EEXIST
    );
}

#[test]
fn test_local_mutations_are_never_stale() {
    let (mount, _mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "fresh", b"version one");
    let (_, attr) = mount.lookup_entry(ROOT_INO, "fresh").unwrap();
    assert_eq!(attr.size, 11);

    // Overwrite through this mount; the next stat must see it immediately.
    write_file(&mount, ROOT_INO, "fresh", b"v2");
    let (_, attr) = mount.lookup_entry(ROOT_INO, "fresh").unwrap();
    assert_eq!(attr.size, 2);
}

#[test]
fn test_cross_process_staleness_bounded_by_ttl() {
    let (mount, mem, clock, _tmp) = test_mount();
    mem.insert_file("/external", b"old");
    let (ino, attr) = mount.lookup_entry(ROOT_INO, "external").unwrap();
    assert_eq!(attr.size, 3);

    // Another client changes the file behind this mount's back.
    mem.insert_file("/external", b"changed!");
    let cached = mount.getattr_entry(ino).unwrap();
    assert_eq!(cached.size, 3);

    clock.advance(Duration::from_secs(6));
    let refreshed = mount.getattr_entry(ino).unwrap();
    assert_eq!(refreshed.size, 8);
}

#[test]
fn test_rename_replaces_existing_destination() {
    let (mount, mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "src", b"source");
    write_file(&mount, ROOT_INO, "dst", b"stale destination");

    mount.rename_path(ROOT_INO, "src", ROOT_INO, "dst").unwrap();
    assert_eq!(mem.contents("/dst"), Some(b"source".to_vec()));
    assert!(mem.contents("/src").is_none());
}

#[test]
fn test_open_truncate_stages_empty_file() {
    let (mount, mem, _clock, _tmp) = test_mount();
    write_file(&mount, ROOT_INO, "trunc", b"previous content");

    let (ino, _) = mount.lookup_entry(ROOT_INO, "trunc").unwrap();
    let fh = mount
        .open_file(ino, libc::O_RDWR | libc::O_TRUNC)
        .unwrap();
    let attr = mount.getattr_entry(ino).unwrap();
    assert_eq!(attr.size, 0);
    mount.write_handle(fh, 0, b"new").unwrap();
    mount.release_handle(fh).unwrap();
    assert_eq!(mem.contents("/trunc"), Some(b"new".to_vec()));
}
