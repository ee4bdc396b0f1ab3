//! Per-member extraction workers for the restore pipeline.
//!
//! Each member of the outer archive is itself a single-member tar stream,
//! optionally compressed, optionally encrypted, split into chunks. Once the
//! consumer has verified a chunk's MAC it hands the chunk file to the
//! extractor for the member, a worker thread running the inverse pipeline:
//! chunk concatenation, decryption, decompression, inner untar into the
//! scratch directory. Chunk files are unlinked as soon as they are opened,
//! so nothing survives the run regardless of how it ends.
//!
//! A member walks `INIT -> EXTRACTING -> DONE`, or drops to `FAILED` on a
//! bad MAC or an extractor crash; terminal states are collected for the
//! planner.

use arca_core::cipher::Cipher;
use arca_core::filter::{Filter, FilterError};
use arca_core::split::Join;
use arca_core::Passphrase;
use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error};

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::thread::JoinHandle;

#[derive(Error, Debug)]
pub(crate) enum ExtractError {
    #[error("inner extraction failed")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("chunk {got} of {member} arrived out of order (expected {expected})")]
    OutOfOrder {
        member: String,
        got: u32,
        expected: u32,
    },
    #[error("extractor thread panicked")]
    Panicked,
}

/// Everything an extractor worker needs to undo the producer pipeline
#[derive(Clone)]
pub(crate) struct ExtractParams {
    pub version: u32,
    pub cipher: Option<Cipher>,
    pub filter: Option<Filter>,
    pub passphrase: Passphrase,
    pub verify_only: bool,
    pub scratch: PathBuf,
}

enum FeedItem {
    Chunk(PathBuf),
    Finished,
    Error,
}

/// Iterator face of the chunk queue: yields an open handle per chunk and
/// unlinks the file immediately, keeping the scratch directory empty of
/// consumed chunks
struct FeedIter {
    rx: Receiver<FeedItem>,
}

impl Iterator for FeedIter {
    type Item = io::Result<File>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.recv() {
            Ok(FeedItem::Chunk(path)) => {
                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) => return Some(Err(e)),
                };
                if let Err(e) = std::fs::remove_file(&path) {
                    return Some(Err(e));
                }
                Some(Ok(file))
            }
            Ok(FeedItem::Finished) | Err(_) => None,
            Ok(FeedItem::Error) => Some(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "extraction aborted",
            ))),
        }
    }
}

/// One member's extractor worker
pub(crate) struct MemberExtractor {
    member: String,
    tx: Option<Sender<FeedItem>>,
    handle: Option<JoinHandle<Result<(), ExtractError>>>,
    next_seq: u32,
}

impl MemberExtractor {
    fn spawn(member: &str, params: &ExtractParams) -> MemberExtractor {
        // small queue: the consumer verifies ahead at most a couple of
        // chunks while the worker drains
        let (tx, rx) = bounded(2);
        let params = params.clone();
        let member_name = member.to_owned();
        debug!(member = %member_name, "starting extractor");
        let handle = std::thread::spawn(move || run_extractor(rx, &params));
        MemberExtractor {
            member: member.to_owned(),
            tx: Some(tx),
            handle: Some(handle),
            next_seq: 0,
        }
    }

    fn feed(&mut self, seq: u32, path: PathBuf) -> Result<(), ExtractError> {
        if seq != self.next_seq {
            return Err(ExtractError::OutOfOrder {
                member: self.member.clone(),
                got: seq,
                expected: self.next_seq,
            });
        }
        self.next_seq += 1;
        if let Some(tx) = &self.tx {
            // a receiver that went away means the worker died; surface that
            // at join time, not here
            let _ = tx.send(FeedItem::Chunk(path));
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), ExtractError> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(FeedItem::Finished);
        }
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ExtractError::Panicked)?,
            None => Ok(()),
        }
    }

    fn abort(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(FeedItem::Error);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_extractor(rx: Receiver<FeedItem>, params: &ExtractParams) -> Result<(), ExtractError> {
    let feed = Join::new(FeedIter { rx });
    let mut stream: Box<dyn Read + Send> = Box::new(feed);
    if let Some(cipher) = params.cipher {
        stream = Box::new(cipher.decrypt_stream(params.passphrase.as_bytes(), stream));
    }
    if let Some(filter) = &params.filter {
        stream = filter.decompress(stream)?;
    }
    let mut archive = tar::Archive::new(stream);
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if params.verify_only {
            io::copy(&mut entry, &mut io::sink())?;
        } else if !entry.unpack_in(&params.scratch)? {
            return Err(ExtractError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "inner archive member escapes the scratch directory",
            )));
        }
    }
    Ok(())
}

/// Terminal member states of one restore run
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub done: Vec<String>,
    pub failed: Vec<String>,
}

/// The extractor-controller task: at most one member extracting at a time,
/// chunks strictly in order, outcomes collected for the planner
pub(crate) struct ExtractorController {
    params: ExtractParams,
    current: Option<MemberExtractor>,
    pub report: RestoreReport,
}

impl ExtractorController {
    pub(crate) fn new(params: ExtractParams) -> ExtractorController {
        ExtractorController {
            params,
            current: None,
            report: RestoreReport::default(),
        }
    }

    /// Chunk `.000` of a new member: close out the previous member and
    /// start a fresh worker. The new worker starts even when closing the
    /// previous member failed, so one broken member cannot take its
    /// successors down in skip-broken mode.
    pub(crate) fn begin_member(&mut self, member: &str) -> Result<(), ExtractError> {
        let closed = self.close_current();
        self.current = Some(MemberExtractor::spawn(member, &self.params));
        closed
    }

    /// Hands a verified chunk to the current member's worker
    pub(crate) fn feed_chunk(
        &mut self,
        member: &str,
        seq: u32,
        path: PathBuf,
    ) -> Result<(), ExtractError> {
        match &mut self.current {
            Some(extractor) if extractor.member == member => extractor.feed(seq, path),
            _ => Err(ExtractError::OutOfOrder {
                member: member.to_owned(),
                got: seq,
                expected: 0,
            }),
        }
    }

    pub(crate) fn current_member(&self) -> Option<&str> {
        self.current.as_ref().map(|e| e.member.as_str())
    }

    /// Marks the in-flight member failed and tears its worker down
    pub(crate) fn fail_current(&mut self) {
        if let Some(extractor) = self.current.take() {
            error!(member = %extractor.member, "member failed, discarding");
            self.report.failed.push(extractor.member.clone());
            extractor.abort();
        }
    }

    /// End of the outer stream: close the last member
    pub(crate) fn finish_all(&mut self) -> Result<(), ExtractError> {
        self.close_current()
    }

    /// Cancellation or a fatal error: tear everything down, recording
    /// nothing
    pub(crate) fn abort_all(&mut self) {
        if let Some(extractor) = self.current.take() {
            extractor.abort();
        }
    }

    fn close_current(&mut self) -> Result<(), ExtractError> {
        if let Some(extractor) = self.current.take() {
            let member = extractor.member.clone();
            match extractor.finish() {
                Ok(()) => {
                    debug!(member = %member, "member extracted");
                    self.report.done.push(member);
                    Ok(())
                }
                Err(e) => {
                    self.report.failed.push(member);
                    Err(e)
                }
            }
        } else {
            Ok(())
        }
    }
}
