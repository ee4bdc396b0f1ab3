//! End-to-end round trips: archives produced by the backup pipeline come
//! back byte-identical through the restore pipeline, in every combination
//! of encryption and compression.

mod common;

use arca::{
    Backup, BackupRestore, BackupTarget, Compression, Inventory, Passphrase,
    RestoreLocation, RestoreOptions,
};
use common::*;

use std::fs;
use std::path::Path;

const CHUNK: u64 = 1024 * 1024;

fn run_backup(
    host: &mut TestHost,
    scratch: &Path,
    archive: &Path,
    encrypted: bool,
    compression: Compression,
) {
    let config = test_config(scratch, CHUNK);
    let mut backup = Backup::new(
        host,
        config,
        BackupTarget::LocalFile(archive.to_owned()),
        Passphrase::from("pw"),
    );
    backup.encrypted = encrypted;
    backup.compression = compression;
    backup.backup_do().unwrap();
}

fn run_restore(host: &mut TestHost, scratch: &Path, archive: &Path, options: RestoreOptions) {
    let config = test_config(scratch, CHUNK);
    let mut restore = BackupRestore::new(
        host,
        config,
        RestoreLocation::LocalFile(archive.to_owned()),
        Passphrase::from("pw"),
        options,
    )
    .unwrap();
    let info = restore.restore_info();
    let report = restore.restore_do(&info).unwrap();
    assert!(!report.done.is_empty());
}

#[test]
fn plain_round_trip_with_expected_chunking() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let archive = dir.path().join("archive");

    // 2.5 chunks of private image, so the member splits into 3 chunks
    let mut source_host = TestHost::new(&dir.path().join("src"));
    let private = source_host.add_vm("vm-a", 1, (2 * CHUNK + CHUNK / 2) as usize);
    run_backup(
        &mut source_host,
        &scratch,
        &archive,
        false,
        Compression::None,
    );
    assert_scratch_empty(&scratch);

    // Archive layout: header and tag, catalog chunks, then the VM member's
    // chunks, each immediately followed by its companion, in ascending
    // order
    let names = archive_entry_names(&archive);
    assert_eq!(names[0], "backup-header");
    assert_eq!(names[1], "backup-header.hmac");
    assert_eq!(names[2], "catalog.000");
    assert_eq!(names[3], "catalog.000.hmac");
    let data_chunks: Vec<&String> = names
        .iter()
        .filter(|n| n.starts_with("vm-a/private.img.") && !n.ends_with(".hmac"))
        .collect();
    assert_eq!(
        data_chunks,
        [
            "vm-a/private.img.000",
            "vm-a/private.img.001",
            "vm-a/private.img.002"
        ]
    );
    for (i, name) in names.iter().enumerate() {
        if name.starts_with("vm-a/") && !name.ends_with(".hmac") {
            assert_eq!(names[i + 1], format!("{name}.hmac"));
        }
    }
    for (name, size) in archive_entry_sizes(&archive) {
        if !name.ends_with(".hmac") {
            assert!(size <= CHUNK, "{name} is {size} bytes");
        }
    }

    let mut target_host = TestHost::new(&dir.path().join("dst"));
    run_restore(
        &mut target_host,
        &scratch,
        &archive,
        RestoreOptions::default(),
    );
    assert_scratch_empty(&scratch);

    let restored = target_host.vm_dir("vm-a").join("private.img");
    assert_eq!(fs::read(restored).unwrap(), fs::read(private).unwrap());
    assert!(target_host.catalog.contains("vm-a"));
}

#[test]
fn all_four_parameter_combinations_round_trip() {
    for (encrypted, compression) in [
        (false, Compression::None),
        (false, Compression::Default),
        (true, Compression::None),
        (true, Compression::Default),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let archive = dir.path().join("archive");

        let mut source_host = TestHost::new(&dir.path().join("src"));
        let private = source_host.add_vm("vm-a", 1, 300_000);
        run_backup(
            &mut source_host,
            &scratch,
            &archive,
            encrypted,
            compression.clone(),
        );

        let mut target_host = TestHost::new(&dir.path().join("dst"));
        run_restore(
            &mut target_host,
            &scratch,
            &archive,
            RestoreOptions::default(),
        );
        let restored = target_host.vm_dir("vm-a").join("private.img");
        assert_eq!(
            fs::read(restored).unwrap(),
            fs::read(&private).unwrap(),
            "encrypted={encrypted} compression={compression:?}"
        );
        assert!(!dir_diff::is_different(
            &dir.path().join("src/vms/vm-a"),
            &target_host.vm_dir("vm-a")
        )
        .unwrap());
    }
}

#[test]
fn encrypted_compressed_header_names_all_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let archive = dir.path().join("archive");

    let mut source_host = TestHost::new(&dir.path().join("src"));
    source_host.add_vm("vm-a", 1, 100_000);
    run_backup(
        &mut source_host,
        &scratch,
        &archive,
        true,
        Compression::Default,
    );

    // The header is the first entry; read it straight out of the archive
    let file = fs::File::open(&archive).unwrap();
    let mut outer = tar::Archive::new(file);
    let mut entries = outer.entries().unwrap();
    let mut header_text = String::new();
    use std::io::Read as _;
    entries
        .next()
        .unwrap()
        .unwrap()
        .read_to_string(&mut header_text)
        .unwrap();
    assert!(header_text.starts_with("version=4\n"));
    assert!(header_text.contains("encrypted=true"));
    assert!(header_text.contains("compressed=true"));
    assert!(header_text.contains("compression-filter=gzip"));
    assert!(header_text.contains("crypto-algorithm=aes-256-cbc"));
    assert!(header_text.contains("hmac-algorithm=SHA512"));

    // One character off in the passphrase and the header must not verify
    let mut target_host = TestHost::new(&dir.path().join("dst"));
    let result = BackupRestore::new(
        &mut target_host,
        test_config(&scratch, CHUNK),
        RestoreLocation::LocalFile(archive.clone()),
        Passphrase::from("pW"),
        RestoreOptions::default(),
    );
    assert!(result.is_err());
    assert_scratch_empty(&scratch);
}

#[test]
fn admin_home_round_trips_with_move_aside() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let archive = dir.path().join("archive");

    let mut source_host = TestHost::new(&dir.path().join("src"));
    source_host.add_admin();
    source_host.home_file("notes.txt", b"remember the milk");
    run_backup(
        &mut source_host,
        &scratch,
        &archive,
        false,
        Compression::None,
    );

    let mut target_host = TestHost::new(&dir.path().join("dst"));
    // a file already in the way must be moved aside, not clobbered
    target_host.home_file("notes.txt", b"old contents");
    run_restore(
        &mut target_host,
        &scratch,
        &archive,
        RestoreOptions::default(),
    );

    let home = target_host.admin_home_path();
    assert_eq!(
        fs::read(home.join("notes.txt")).unwrap(),
        b"remember the milk"
    );
    let aside: Vec<_> = fs::read_dir(&home)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("home-pre-restore-"))
        .collect();
    assert_eq!(aside.len(), 1);
    assert_eq!(
        fs::read(home.join(&aside[0]).join("notes.txt")).unwrap(),
        b"old contents"
    );
}

#[test]
fn verify_only_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let archive = dir.path().join("archive");

    let mut source_host = TestHost::new(&dir.path().join("src"));
    source_host.add_vm("vm-a", 1, 200_000);
    run_backup(
        &mut source_host,
        &scratch,
        &archive,
        true,
        Compression::Default,
    );

    let mut target_host = TestHost::new(&dir.path().join("dst"));
    let options = RestoreOptions {
        verify_only: true,
        ..RestoreOptions::default()
    };
    run_restore(&mut target_host, &scratch, &archive, options);
    assert!(!target_host.vm_dir("vm-a").exists());
    assert!(target_host.registered.is_empty());
    assert_scratch_empty(&scratch);
}

#[test]
fn restore_renames_conflicting_vm() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let archive = dir.path().join("archive");

    let mut source_host = TestHost::new(&dir.path().join("src"));
    let private = source_host.add_vm("work", 1, 50_000);
    run_backup(
        &mut source_host,
        &scratch,
        &archive,
        false,
        Compression::None,
    );

    let mut target_host = TestHost::new(&dir.path().join("dst"));
    target_host.add_vm("work", 5, 10);
    run_restore(
        &mut target_host,
        &scratch,
        &archive,
        RestoreOptions::default(),
    );
    let restored = target_host.vm_dir("work1").join("private.img");
    assert_eq!(fs::read(restored).unwrap(), fs::read(private).unwrap());
    assert!(target_host.catalog.contains("work1"));
}

#[test]
fn backup_records_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let archive = dir.path().join("archive");

    let mut source_host = TestHost::new(&dir.path().join("src"));
    source_host.add_vm("vm-a", 1, 10_000);
    run_backup(
        &mut source_host,
        &scratch,
        &archive,
        false,
        Compression::None,
    );
    assert!(source_host.timestamps.contains_key("vm-a"));
}
