//! Cancellation cleanliness: once a run reports `Canceled`, no worker is
//! left behind and the scratch directory is gone.

mod common;

use arca::{
    Backup, BackupError, BackupRestore, BackupTarget, Compression, Passphrase,
    RestoreError, RestoreLocation, RestoreOptions,
};
use common::*;

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const CHUNK: u64 = 64 * 1024;

fn build_archive(dir: &Path) -> std::path::PathBuf {
    let scratch = dir.join("scratch");
    let archive = dir.join("archive");
    let mut host = TestHost::new(&dir.join("src"));
    host.add_vm("vm-a", 1, (10 * CHUNK) as usize);
    let mut backup = Backup::new(
        &mut host,
        test_config(&scratch, CHUNK),
        BackupTarget::LocalFile(archive.clone()),
        Passphrase::from("pw"),
    );
    backup.encrypted = false;
    backup.compression = Compression::None;
    backup.backup_do().unwrap();
    archive
}

#[test]
fn backup_cancel_mid_stream_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let mut host = TestHost::new(&dir.path().join("src"));
    host.add_vm("vm-a", 1, (10 * CHUNK) as usize);

    let mut backup = Backup::new(
        &mut host,
        test_config(&scratch, CHUNK),
        BackupTarget::LocalFile(dir.path().join("archive")),
        Passphrase::from("pw"),
    );
    backup.encrypted = false;
    backup.compression = Compression::None;

    // cancel from the progress callback once the first data chunk is out
    let token = backup.cancel_token();
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    backup.set_progress_callback(Box::new(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            token.cancel();
        }
    }));

    let result = backup.backup_do();
    assert!(matches!(result, Err(BackupError::Canceled)), "{result:?}");
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert_scratch_empty(&scratch);
}

#[test]
fn backup_cancel_before_start_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let mut host = TestHost::new(&dir.path().join("src"));
    host.add_vm("vm-a", 1, 10_000);

    let mut backup = Backup::new(
        &mut host,
        test_config(&scratch, CHUNK),
        BackupTarget::LocalFile(dir.path().join("archive")),
        Passphrase::from("pw"),
    );
    backup.cancel_token().cancel();
    assert!(matches!(backup.backup_do(), Err(BackupError::Canceled)));
    assert_scratch_empty(&scratch);
}

#[test]
fn restore_cancel_mid_stream_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let archive = build_archive(dir.path());
    let scratch = dir.path().join("scratch");

    let mut host = TestHost::new(&dir.path().join("dst"));
    let mut restore = BackupRestore::new(
        &mut host,
        test_config(&scratch, CHUNK),
        RestoreLocation::LocalFile(archive),
        Passphrase::from("pw"),
        RestoreOptions::default(),
    )
    .unwrap();
    let token = restore.cancel_token();
    restore.set_progress_callback(Box::new(move |_| token.cancel()));

    let info = restore.restore_info();
    let result = restore.restore_do(&info);
    assert!(matches!(result, Err(RestoreError::Canceled)), "{result:?}");
    assert_scratch_empty(&scratch);
    assert!(host.registered.is_empty());
}
