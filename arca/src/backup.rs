//! The producer pipeline: serialize the selected VMs into an authenticated,
//! optionally encrypted, optionally compressed archive.
//!
//! Every member is archived as a single-member tar stream by a worker
//! thread, pushed through the optional compression filter and cipher, and
//! split into MAC'd chunks staged in the scratch directory. A single sender
//! thread consumes a bounded queue of staged files, appends them to the
//! outer stream in order, and deletes them; the queue bound plus pipe
//! blocking give the run its backpressure. Worker failures travel over a
//! dedicated error channel rather than through queue tricks, and the cancel
//! flag is checked at every suspension point.

use crate::catalog::snapshot_for_backup;
use crate::engine::EngineConfig;
use crate::inventory::Inventory;
use crate::progress::{CancelToken, ProgressFn, ProgressMeter};
use crate::select::{self, FileToBackup, VmToBackup};
use crate::transport::{BackupTarget, Sink, TransportError};
use arca_core::catalog::{CatalogError, CATALOG_FILENAME};
use arca_core::cipher::Cipher;
use arca_core::filter::{Filter, FilterError, DEFAULT_FILTER};
use arca_core::header::{BackupHeader, CURRENT_FORMAT_VERSION, HEADER_FILENAME};
use arca_core::integrity::{render_tag, MacAlgorithm, MacStream};
use arca_core::names::MemberName;
use arca_core::split::Splitter;
use arca_core::Passphrase;
use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info};

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// Depth of the sender queue; bounds how many staged chunks can pile up
const SENDER_QUEUE_DEPTH: usize = 10;

/// Error describing the ways a backup run can fail
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("no passphrase set")]
    NoPassphrase,
    #[error("no such VM: {0}")]
    NoSuchVm(String),
    #[error("VM {0} is running, shut it down before backing it up")]
    VmRunning(String),
    #[error("failed to write the backup, out of disk space?")]
    WriteFailed(#[source] io::Error),
    #[error("failed to read {0} for backup")]
    ReadFailed(String, #[source] io::Error),
    #[error("backup canceled")]
    Canceled,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("archive staging failed")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, BackupError>;

/// Whether and how the inner stream is compressed.
///
/// The old engines accepted a boolean or a bare filter name in the same
/// field; that duck typing is folded into one tagged choice here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    None,
    /// The default filter (gzip)
    #[default]
    Default,
    /// A named filter program
    Named(String),
}

impl Compression {
    pub fn enabled(&self) -> bool {
        !matches!(self, Compression::None)
    }

    pub(crate) fn filter(&self) -> std::result::Result<Option<Filter>, FilterError> {
        match self {
            Compression::None => Ok(None),
            Compression::Default => Ok(Some(Filter::from_name(DEFAULT_FILTER)?)),
            Compression::Named(name) => Ok(Some(Filter::from_name(name)?)),
        }
    }
}

/// One backup run.
///
/// Built with the required pieces, tuned through the public fields, and
/// consumed by [`Backup::backup_do`].
pub struct Backup<'a, I: Inventory> {
    app: &'a mut I,
    config: EngineConfig,
    target: BackupTarget,
    passphrase: Passphrase,
    /// Encrypt the inner stream
    pub encrypted: bool,
    pub compression: Compression,
    pub hmac_algorithm: MacAlgorithm,
    pub crypto_algorithm: Cipher,
    /// Explicit VM set; `None` backs up every VM that opts in
    pub selection: Option<Vec<String>>,
    /// Always applied, whatever the selection
    pub exclude: Vec<String>,
    progress_callback: Option<ProgressFn>,
    cancel: CancelToken,
}

impl<'a, I: Inventory> Backup<'a, I> {
    pub fn new(
        app: &'a mut I,
        config: EngineConfig,
        target: BackupTarget,
        passphrase: Passphrase,
    ) -> Backup<'a, I> {
        let hmac_algorithm = config.default_mac;
        let crypto_algorithm = config.default_cipher;
        Backup {
            app,
            config,
            target,
            passphrase,
            encrypted: true,
            compression: Compression::Default,
            hmac_algorithm,
            crypto_algorithm,
            selection: None,
            exclude: Vec::new(),
            progress_callback: None,
            cancel: CancelToken::new(),
        }
    }

    /// Flag checked at every suspension point; settable from any thread
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Callback invoked with the fraction done on every chunk completion;
    /// must not block
    pub fn set_progress_callback(&mut self, callback: ProgressFn) {
        self.progress_callback = Some(callback);
    }

    /// The VMs and files this run will cover, in archive order
    pub fn files_to_backup(&self) -> Result<Vec<VmToBackup>> {
        select::files_to_backup(
            self.app,
            self.selection.as_deref(),
            &self.exclude,
            self.encrypted,
        )
    }

    /// Total bytes the archive will contain before chunking
    pub fn total_backup_bytes(&self) -> Result<u64> {
        Ok(select::total_size(&self.files_to_backup()?))
    }

    /// The human summary shown before the run
    pub fn summary(&self) -> Result<String> {
        let vms = self.files_to_backup()?;
        let selected: Vec<&str> = vms.iter().map(|vm| vm.vm.entry.name.as_str()).collect();
        let not_selected: Vec<String> = self
            .app
            .backup_vms()
            .into_iter()
            .map(|vm| vm.entry.name)
            .filter(|name| !selected.contains(&name.as_str()))
            .collect();
        Ok(select::backup_summary(&vms, &not_selected))
    }

    /// Runs the backup to completion (or cancellation).
    ///
    /// Whatever happens, all workers are joined and the scratch directory
    /// is gone before this returns.
    pub fn backup_do(mut self) -> Result<()> {
        if self.passphrase.is_empty() {
            return Err(BackupError::NoPassphrase);
        }
        let vms = self.files_to_backup()?;
        for vm in &vms {
            if vm.vm.entry.qid != 0 && vm.vm.running {
                return Err(BackupError::VmRunning(vm.vm.entry.name.clone()));
            }
        }
        let filter = self.compression.filter()?;
        let total = select::total_size(&vms);
        let mut progress = ProgressMeter::new(total, self.progress_callback.take());

        let scratch = tempfile::Builder::new()
            .prefix("backup-")
            .tempdir_in(&self.config.scratch_root)?;
        debug!(scratch = %scratch.path().display(), "staging backup");

        // Catalog snapshot with the feature triple set on included VMs
        let included: Vec<(String, String, u64)> = vms
            .iter()
            .map(|vm| (vm.vm.entry.name.clone(), vm.subdir.clone(), vm.size()))
            .collect();
        let snapshot = snapshot_for_backup(&self.app.live_catalog(), &included);
        let catalog_path = scratch.path().join(CATALOG_FILENAME);
        fs::write(&catalog_path, snapshot.encode()?)?;
        let catalog_size = fs::metadata(&catalog_path)?.len();

        // Header record and its tag, written before any payload
        let header = BackupHeader {
            version: CURRENT_FORMAT_VERSION,
            encrypted: self.encrypted,
            compressed: filter.is_some(),
            compression_filter: filter.as_ref().map(|f| f.name().to_owned()),
            crypto_algorithm: self
                .encrypted
                .then(|| self.crypto_algorithm.name().to_owned()),
            hmac_algorithm: Some(self.hmac_algorithm.name().to_owned()),
        };
        let header_bytes = header.to_bytes();
        fs::write(scratch.path().join(HEADER_FILENAME), &header_bytes)?;
        let tag = self
            .hmac_algorithm
            .mac(self.passphrase.as_bytes(), &header_bytes);
        fs::write(
            scratch.path().join(format!("{HEADER_FILENAME}.hmac")),
            render_tag(&tag),
        )?;

        let sink = Sink::open(&self.config, &self.target)?;
        let (tx, rx) = bounded::<SendItem>(SENDER_QUEUE_DEPTH);
        let (err_tx, err_rx) = bounded::<()>(1);
        let sender_scratch = scratch.path().to_owned();
        let sender = thread::Builder::new()
            .name("sender".to_owned())
            .spawn(move || run_sender(&rx, &sender_scratch, sink, &err_tx))?;

        let stream_result = self.stream_members(
            &vms,
            filter.as_ref(),
            catalog_size,
            scratch.path(),
            &tx,
            &err_rx,
            &mut progress,
        );

        let _ = tx.send(match &stream_result {
            Ok(()) => SendItem::Finished,
            Err(_) => SendItem::Error,
        });
        drop(tx);
        let sender_result = sender
            .join()
            .map_err(|_| io::Error::other("sender thread panicked"))?;

        let cleanup = scratch.close();
        sender_result?;
        stream_result?;
        cleanup?;
        if self.cancel.is_canceled() {
            return Err(BackupError::Canceled);
        }
        info!(bytes = total, vms = vms.len(), "backup complete");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_members(
        &mut self,
        vms: &[VmToBackup],
        filter: Option<&Filter>,
        catalog_size: u64,
        scratch: &Path,
        tx: &Sender<SendItem>,
        err_rx: &Receiver<()>,
        progress: &mut ProgressMeter,
    ) -> Result<()> {
        self.enqueue(tx, err_rx, PathBuf::from(HEADER_FILENAME))?;
        self.enqueue(tx, err_rx, PathBuf::from(format!("{HEADER_FILENAME}.hmac")))?;

        // The catalog is the first member after the header
        let catalog_member = FileToBackup {
            path: scratch.join(CATALOG_FILENAME),
            size: catalog_size,
            member: CATALOG_FILENAME.to_owned(),
            dereference: true,
        };
        self.archive_member(&catalog_member, filter, scratch, tx, err_rx, progress)?;

        for vm in vms {
            debug!(vm = %vm.vm.entry.name, "sending VM files");
            for file in &vm.files {
                self.archive_member(file, filter, scratch, tx, err_rx, progress)?;
            }
            progress.finish_vm(vm.size());
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            self.app.set_backup_timestamp(&vm.vm.entry.name, now);
        }
        Ok(())
    }

    /// Archives one file (or tree) as chunk+tag members: a worker tars it
    /// into a pipe, the pipe is pulled through the filter and cipher, and
    /// the result is split with the MAC computed alongside each chunk
    /// write.
    fn archive_member(
        &mut self,
        file: &FileToBackup,
        filter: Option<&Filter>,
        scratch: &Path,
        tx: &Sender<SendItem>,
        err_rx: &Receiver<()>,
        progress: &mut ProgressMeter,
    ) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(BackupError::Canceled);
        }
        let member_name = file.member.clone();
        debug!(member = %member_name, path = %file.path.display(), "archiving");

        let (reader, writer) = io::pipe()?;
        let src = file.path.clone();
        let name = member_name.clone();
        let dereference = file.dereference;
        let archiver = thread::Builder::new()
            .name("archiver".to_owned())
            .spawn(move || -> io::Result<()> {
                let mut builder = tar::Builder::new(writer);
                builder.follow_symlinks(dereference);
                builder.mode(tar::HeaderMode::Complete);
                if src.is_dir() {
                    builder.append_dir_all(&name, &src)?;
                } else {
                    builder.append_path_with_name(&src, &name)?;
                }
                builder.finish()
            })?;

        let result = self.split_member(
            &member_name,
            reader,
            filter,
            scratch,
            tx,
            err_rx,
            progress,
        );
        match archiver.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // the split side usually failed first; keep its error
                return Err(result
                    .err()
                    .unwrap_or(BackupError::ReadFailed(member_name, e)));
            }
            Err(_) => {
                return Err(result.err().unwrap_or_else(|| {
                    BackupError::Io(io::Error::other("archiver thread panicked"))
                }));
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn split_member(
        &mut self,
        member_name: &str,
        reader: io::PipeReader,
        filter: Option<&Filter>,
        scratch: &Path,
        tx: &Sender<SendItem>,
        err_rx: &Receiver<()>,
        progress: &mut ProgressMeter,
    ) -> Result<()> {
        let mut stream: Box<dyn Read + Send> = Box::new(reader);
        if let Some(filter) = filter {
            stream = filter.compress(stream)?;
        }
        if self.encrypted {
            stream = Box::new(
                self.crypto_algorithm
                    .encrypt_stream(self.passphrase.as_bytes(), stream),
            );
        }
        let mut splitter = Splitter::new(stream, self.config.chunk_size);

        let member_path = scratch.join(member_name);
        if let Some(parent) = member_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut seq: u32 = 0;
        loop {
            if self.cancel.is_canceled() {
                return Err(BackupError::Canceled);
            }
            if err_rx.try_recv().is_ok() {
                return Err(BackupError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "sender failed",
                )));
            }
            let chunk_name = MemberName::chunk(member_name, seq);
            let chunk_abs = scratch.join(&chunk_name);
            let chunk_file = File::create(&chunk_abs)?;
            let mut mac = self.hmac_algorithm.hasher(self.passphrase.as_bytes());
            let mut tee = TeeWriter {
                inner: BufWriter::new(chunk_file),
                mac: &mut mac,
            };
            let written = match splitter.next_chunk(&mut tee) {
                Ok(Some(n)) => n,
                Ok(None) => {
                    drop(tee);
                    fs::remove_file(&chunk_abs)?;
                    break;
                }
                Err(e) => {
                    return Err(BackupError::ReadFailed(member_name.to_owned(), e));
                }
            };
            tee.inner.flush()?;
            drop(tee);
            let mac_name = MemberName::mac_companion(&chunk_name);
            fs::write(scratch.join(&mac_name), render_tag(&mac.finish()))?;

            progress.add_current(written);
            self.enqueue(tx, err_rx, PathBuf::from(&chunk_name))?;
            self.enqueue(tx, err_rx, PathBuf::from(&mac_name))?;
            seq += 1;
        }
        Ok(())
    }

    /// Queue put, which is a suspension point: cancellation and sender
    /// failure are both observed here
    fn enqueue(
        &self,
        tx: &Sender<SendItem>,
        err_rx: &Receiver<()>,
        member: PathBuf,
    ) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(BackupError::Canceled);
        }
        if err_rx.try_recv().is_ok() || tx.send(SendItem::Member(member)).is_err() {
            return Err(BackupError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sender failed",
            )));
        }
        Ok(())
    }
}

enum SendItem {
    /// A staged file, relative to the scratch directory, to append and
    /// delete
    Member(PathBuf),
    Finished,
    Error,
}

/// The sender loop: single consumer of the staging queue, sole writer of
/// the outer stream.
///
/// On a sink failure it signals the error channel and keeps draining the
/// queue (deleting staged files) so producers never block on a dead
/// consumer; the first failure is returned once the queue closes.
fn run_sender(
    rx: &Receiver<SendItem>,
    scratch: &Path,
    sink: Sink,
    err_tx: &Sender<()>,
) -> std::result::Result<(), BackupError> {
    let mut builder = tar::Builder::new(sink);
    builder.mode(tar::HeaderMode::Deterministic);
    let mut failure: Option<io::Error> = None;
    let mut finished = false;
    for item in rx.iter() {
        match item {
            SendItem::Error => break,
            SendItem::Finished => {
                finished = true;
                break;
            }
            SendItem::Member(rel) => {
                let abs = scratch.join(&rel);
                if failure.is_none() {
                    debug!(member = %rel.display(), "sending");
                    if let Err(e) = builder.append_path_with_name(&abs, &rel) {
                        let _ = err_tx.send(());
                        failure = Some(e);
                    }
                }
                let _ = fs::remove_file(&abs);
            }
        }
    }
    if let Some(e) = failure {
        return Err(BackupError::WriteFailed(e));
    }
    if finished {
        let sink = builder
            .into_inner()
            .map_err(BackupError::WriteFailed)?;
        sink.finish()?;
    }
    // on Error the partial archive is abandoned unfinished
    Ok(())
}

/// Writes through to the chunk file while feeding the MAC
struct TeeWriter<'a, W: Write> {
    inner: W,
    mac: &'a mut MacStream,
}

impl<W: Write> Write for TeeWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.mac.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
