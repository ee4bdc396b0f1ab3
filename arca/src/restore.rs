//! The consumer pipeline: verify an archive and restore (or just verify)
//! its VMs, trusting nothing until it has passed the MAC.
//!
//! Construction retrieves and verifies the header and the catalog snapshot,
//! which is all the planner needs; `restore_do` then makes a second pass
//! over the archive, verifying every accepted chunk and feeding it to the
//! per-member extractors, and finally commits the extracted trees into the
//! live catalog.

use crate::catalog::parser_for_version;
use crate::engine::EngineConfig;
use crate::extract::{ExtractParams, ExtractorController, RestoreReport};
use crate::fsutil;
use crate::inventory::Inventory;
use crate::plan::{self, HostView, Problem, RestoreInfo, RestoreOptions, VmToRestore};
use crate::progress::{CancelToken, ProgressFn, ProgressMeter};
use crate::transport::{QuotaGuard, RestoreLocation, Source, TransportError};
use arca_core::catalog::{Catalog, CatalogError, ADMIN_HOME_SUBDIR, CATALOG_FILENAME};
use arca_core::cipher::{Cipher, CipherError};
use arca_core::filter::{Filter, FilterError};
use arca_core::header::{BackupHeader, HeaderError, HEADER_FILENAME};
use arca_core::integrity::{parse_tag, IntegrityError, MacAlgorithm};
use arca_core::names::{self, MemberName, NameError};
use arca_core::Passphrase;
use thiserror::Error;
use tracing::{debug, info, warn};

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// File-count quota of the header retrieval phase
const HEADER_PHASE_MAX_FILES: u64 = 4;

/// Byte quota of the header retrieval phase: header plus catalog snapshot
const HEADER_PHASE_MAX_BYTES: u64 = 1024 * 1024;

/// Cap on a companion tag member's size
const MAX_TAG_BYTES: u64 = 4096;

/// Error describing the ways a restore or verify run can fail
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    UnsafeName(#[from] NameError),
    #[error("orphaned chunk: {0}")]
    OrphanChunk(String),
    #[error("invalid MAC on {0}, is the passphrase correct?")]
    BadMac(String),
    #[error("failed to extract {0}")]
    ExtractFailed(String),
    #[error("premature end of archive: {0}")]
    PrematureEof(String),
    #[error("failed to read the archive")]
    ReadFailed(#[source] io::Error),
    #[error("legacy version-1 archive; pass allow_legacy_v1 to accept it")]
    LegacyRefused,
    #[error("unresolved problems for {0:?}; fix them, exclude the VMs, or pass skip_broken")]
    UnresolvedProblems(Vec<String>),
    #[error("restore canceled")]
    Canceled,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("restore staging failed")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, RestoreError>;

/// One restore (or verify) run against a single archive
pub struct BackupRestore<'a, I: Inventory> {
    app: &'a mut I,
    config: EngineConfig,
    location: RestoreLocation,
    passphrase: Passphrase,
    pub options: RestoreOptions,
    cancel: CancelToken,
    progress_callback: Option<ProgressFn>,
    header: BackupHeader,
    /// Fixed by the header record once its MAC validated
    mac: Option<MacAlgorithm>,
    backup_catalog: Catalog,
}

impl<'a, I: Inventory> BackupRestore<'a, I> {
    /// Opens the archive, verifies and parses its header, and extracts the
    /// catalog snapshot. Nothing is trusted before its MAC validates, and
    /// no byte beyond the header and catalog is read.
    pub fn new(
        app: &'a mut I,
        config: EngineConfig,
        location: RestoreLocation,
        passphrase: Passphrase,
        options: RestoreOptions,
    ) -> Result<BackupRestore<'a, I>> {
        let mut run = BackupRestore {
            app,
            config,
            location,
            passphrase,
            options,
            cancel: CancelToken::new(),
            progress_callback: None,
            header: BackupHeader::legacy_v1(),
            mac: None,
            backup_catalog: Catalog::default(),
        };
        if run.detect_legacy_v1()? {
            return Ok(run);
        }
        run.fetch_header_and_catalog()?;
        Ok(run)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn set_progress_callback(&mut self, callback: ProgressFn) {
        self.progress_callback = Some(callback);
    }

    /// The verified archive parameters
    pub fn header(&self) -> &BackupHeader {
        &self.header
    }

    /// The verified catalog snapshot carried by the archive
    pub fn backup_catalog(&self) -> &Catalog {
        &self.backup_catalog
    }

    /// Builds the restore plan against the current host state
    pub fn restore_info(&self) -> RestoreInfo {
        let host = HostView {
            catalog: self.app.live_catalog(),
            default_template: self.app.default_template(),
            default_netvm: self.app.default_netvm(),
            admin_user: self.app.admin_user(),
        };
        plan::restore_info(&self.backup_catalog, &host, &self.options)
    }

    /// The deterministic human summary of a plan
    pub fn summary(info: &RestoreInfo) -> String {
        plan::restore_summary(info)
    }

    /// Extracts, verifies, and commits the planned VMs.
    ///
    /// In verify-only mode nothing is written outside the scratch
    /// directory. Whatever happens, all workers are joined and the scratch
    /// directory is gone before this returns.
    pub fn restore_do(&mut self, info: &RestoreInfo) -> Result<RestoreReport> {
        if self.header.version == 1 {
            return self.restore_v1(info);
        }

        self.check_plan_is_actionable(info)?;
        let prefixes = plan::accepted_prefixes(info);
        let expected_bytes: u64 = info
            .values()
            .filter(|slot| slot.good_to_go())
            .map(|slot| slot.size)
            .sum();
        info!(
            prefixes = prefixes.len(),
            bytes = expected_bytes,
            "extracting archive data"
        );

        let scratch = tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(&self.config.scratch_root)?;
        let mut controller = ExtractorController::new(self.extract_params(scratch.path())?);
        let mut progress = ProgressMeter::new(expected_bytes, self.progress_callback.take());
        let mut quota = QuotaGuard::new(&self.config, prefixes.len() as u64, expected_bytes);

        let mut source = Source::open(&self.config, &self.location, &prefixes)?;
        let walk = self.walk_archive(
            &mut source,
            &prefixes,
            scratch.path(),
            &mut controller,
            &mut quota,
            &mut progress,
        );
        let walk = match walk {
            Ok(()) => match controller.finish_all() {
                Ok(()) => Ok(()),
                Err(e) if self.options.skip_broken => {
                    warn!(error = %e, "member failed, continuing");
                    Ok(())
                }
                Err(e) => Err(RestoreError::ExtractFailed(e.to_string())),
            },
            Err(e) => {
                controller.abort_all();
                Err(e)
            }
        };
        if let Err(e) = walk {
            drop(source);
            let _ = scratch.close();
            return Err(e);
        }
        source.finish()?;

        let report = std::mem::take(&mut controller.report);
        self.check_completeness(info, &report)?;

        if !self.options.verify_only {
            self.commit(info, scratch.path())?;
        }
        scratch.close()?;
        if self.cancel.is_canceled() {
            return Err(RestoreError::Canceled);
        }
        Ok(report)
    }

    /// Legacy archives are directories with a plaintext catalog next to the
    /// payload; they are refused unless explicitly allowed.
    fn detect_legacy_v1(&mut self) -> Result<bool> {
        let path = match &self.location {
            RestoreLocation::LocalFile(path) if path.is_dir() => path.clone(),
            _ => return Ok(false),
        };
        let catalog_path = path.join(CATALOG_FILENAME);
        if !catalog_path.is_file() || path.join(HEADER_FILENAME).exists() {
            return Ok(false);
        }
        if !self.options.allow_legacy_v1 {
            return Err(RestoreError::LegacyRefused);
        }
        warn!("accepting legacy version-1 archive without integrity protection");
        self.header = BackupHeader::legacy_v1();
        let parser = parser_for_version(1)?;
        self.backup_catalog = parser.parse(&fs::read(&catalog_path)?)?;
        Ok(true)
    }

    /// First pass over the archive: header, header tag, catalog chunks
    fn fetch_header_and_catalog(&mut self) -> Result<()> {
        let accepted = vec![
            HEADER_FILENAME.to_owned(),
            format!("{HEADER_FILENAME}.hmac"),
            CATALOG_FILENAME.to_owned(),
        ];
        let mut source = Source::open(&self.config, &self.location, &accepted)?;
        let mut quota = QuotaGuard::fixed(HEADER_PHASE_MAX_FILES, HEADER_PHASE_MAX_BYTES);

        let scratch = tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(&self.config.scratch_root)?;

        {
            let mut archive = tar::Archive::new(source.data());
            archive.set_ignore_zeros(true);
            let mut entries = archive.entries().map_err(RestoreError::ReadFailed)?;

            let (name, header_bytes) = next_member_in_memory(&mut entries, &mut quota)?
                .ok_or_else(|| RestoreError::PrematureEof("no header".to_owned()))?;
            if name != HEADER_FILENAME {
                return Err(RestoreError::Header(HeaderError::Corrupt));
            }
            let (tag_name, tag_bytes) = next_member_in_memory(&mut entries, &mut quota)?
                .ok_or_else(|| RestoreError::PrematureEof("no header tag".to_owned()))?;
            if tag_name != MemberName::mac_companion(HEADER_FILENAME) {
                return Err(RestoreError::OrphanChunk(tag_name));
            }
            let tag = parse_tag(&tag_bytes).map_err(|_| HeaderError::Corrupt)?;

            // Trial verification over the allow-list, default first; success
            // only unlocks the record, which then names the algorithm used
            // for everything else
            let unlocked = self
                .trial_order()
                .into_iter()
                .any(|algo| algo.verify(self.passphrase.as_bytes(), &header_bytes, &tag));
            if !unlocked {
                return Err(RestoreError::Header(HeaderError::Corrupt));
            }
            self.header = BackupHeader::load(&header_bytes)?;
            let mac_name = self
                .header
                .hmac_algorithm
                .as_deref()
                .ok_or(HeaderError::MissingField("hmac-algorithm"))?;
            let mac = MacAlgorithm::from_name(mac_name)?;
            if !self.config.mac_allow_list.contains(&mac) {
                return Err(RestoreError::Integrity(IntegrityError::UnknownAlgorithm(
                    mac_name.to_owned(),
                )));
            }
            self.mac = Some(mac);
            debug!(version = self.header.version, mac = mac.name(), "header verified");

            // The catalog snapshot follows immediately, chunked like any
            // member
            let mut controller = ExtractorController::new(self.extract_params(scratch.path())?);
            let fetched =
                self.fetch_catalog_chunks(&mut entries, &mut quota, &mut controller, mac, scratch.path());
            match fetched {
                Ok(()) => controller
                    .finish_all()
                    .map_err(|e| RestoreError::ExtractFailed(e.to_string()))?,
                Err(e) => {
                    controller.abort_all();
                    return Err(e);
                }
            }
        }
        drop(source);

        let catalog_bytes = fs::read(scratch.path().join(CATALOG_FILENAME))?;
        let parser = parser_for_version(self.header.version)?;
        self.backup_catalog = parser.parse(&catalog_bytes)?;
        scratch.close()?;
        info!(vms = self.backup_catalog.vms.len(), "catalog snapshot loaded");
        Ok(())
    }

    /// Reads, verifies, and feeds the catalog chunk/tag pairs. Entry names
    /// are inspected before the body is read, so the first payload chunk
    /// ends the phase without being pulled in.
    fn fetch_catalog_chunks<R: Read>(
        &self,
        entries: &mut tar::Entries<R>,
        quota: &mut QuotaGuard,
        controller: &mut ExtractorController,
        mac: MacAlgorithm,
        scratch: &Path,
    ) -> Result<()> {
        let mut expect_seq: u32 = 0;
        loop {
            let entry = match entries.next() {
                Some(entry) => entry,
                None => break,
            };
            let mut entry = entry.map_err(RestoreError::ReadFailed)?;
            let chunk_name = String::from_utf8(entry.path_bytes().into_owned())
                .map_err(|_| NameError::Unsafe("<non-utf8>".to_owned()))?;
            let parsed = names::classify(&chunk_name)?;
            if parsed.member != CATALOG_FILENAME {
                break;
            }
            if parsed.is_mac || parsed.seq != Some(expect_seq) {
                return Err(RestoreError::OrphanChunk(chunk_name));
            }
            quota.admit(entry.size())?;
            let mut chunk_bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut chunk_bytes)
                .map_err(RestoreError::ReadFailed)?;
            drop(entry);

            let (tag_name, tag_bytes) = next_member_in_memory(entries, quota)?
                .ok_or_else(|| RestoreError::OrphanChunk(chunk_name.clone()))?;
            if tag_name != MemberName::mac_companion(&chunk_name) {
                return Err(RestoreError::OrphanChunk(tag_name));
            }
            let tag = parse_tag(&tag_bytes)?;
            if !mac.verify(self.passphrase.as_bytes(), &chunk_bytes, &tag) {
                return Err(RestoreError::BadMac(chunk_name));
            }
            let staged = scratch.join(&chunk_name);
            fs::write(&staged, &chunk_bytes)?;
            let feed = if expect_seq == 0 {
                controller
                    .begin_member(CATALOG_FILENAME)
                    .and_then(|()| controller.feed_chunk(CATALOG_FILENAME, 0, staged))
            } else {
                controller.feed_chunk(CATALOG_FILENAME, expect_seq, staged)
            };
            feed.map_err(|e| RestoreError::ExtractFailed(e.to_string()))?;
            expect_seq += 1;
        }
        if expect_seq == 0 {
            return Err(RestoreError::PrematureEof("no catalog snapshot".to_owned()));
        }
        Ok(())
    }

    fn trial_order(&self) -> Vec<MacAlgorithm> {
        let mut order = vec![self.config.default_mac];
        for algo in &self.config.mac_allow_list {
            if !order.contains(algo) {
                order.push(*algo);
            }
        }
        order
    }

    /// Resolves the header's algorithm names into the inverse pipeline's
    /// parameters, failing loudly on anything outside the allow-lists
    fn extract_params(&self, scratch: &Path) -> Result<ExtractParams> {
        let cipher = match (self.header.encrypted, self.header.crypto_algorithm.as_deref()) {
            (false, _) => None,
            (true, Some(name)) => Some(Cipher::from_name(name)?),
            (true, None) => return Err(HeaderError::MissingField("crypto-algorithm").into()),
        };
        let filter = if !self.header.compressed {
            None
        } else if self.header.version == 2 {
            // version 2 carries zlib inside the encryption layer
            Some(Filter::Zlib)
        } else {
            let name = self
                .header
                .compression_filter
                .as_deref()
                .ok_or(HeaderError::MissingField("compression-filter"))?;
            Some(Filter::from_name(name)?)
        };
        Ok(ExtractParams {
            version: self.header.version,
            cipher,
            filter,
            passphrase: self.passphrase.clone(),
            verify_only: self.options.verify_only,
            scratch: scratch.to_owned(),
        })
    }

    /// A plan slot with problems blocks the run unless the user excluded
    /// the VM or opted into skipping broken ones
    fn check_plan_is_actionable(&self, info: &RestoreInfo) -> Result<()> {
        if self.options.skip_broken {
            return Ok(());
        }
        let blocked: Vec<String> = info
            .iter()
            .filter(|(_, slot)| {
                slot.problems
                    .iter()
                    .any(|problem| *problem != Problem::Excluded)
            })
            .map(|(name, _)| name.clone())
            .collect();
        if blocked.is_empty() {
            Ok(())
        } else {
            Err(RestoreError::UnresolvedProblems(blocked))
        }
    }

    /// Second pass: walk the outer stream, verify every accepted chunk, and
    /// feed the extractors
    #[allow(clippy::too_many_arguments)]
    fn walk_archive(
        &mut self,
        source: &mut Source,
        prefixes: &[String],
        scratch: &Path,
        controller: &mut ExtractorController,
        quota: &mut QuotaGuard,
        progress: &mut ProgressMeter,
    ) -> Result<()> {
        let mac = self.mac.ok_or(HeaderError::Corrupt)?;
        let mut archive = tar::Archive::new(source.data());
        archive.set_ignore_zeros(true);
        let mut entries = archive.entries().map_err(RestoreError::ReadFailed)?;

        // data chunk staged and waiting for its companion
        let mut pending: Option<(MemberName, String, PathBuf, u64)> = None;
        // member being discarded after a bad MAC in skip-broken mode
        let mut skipping: Option<String> = None;

        while let Some(entry) = entries.next() {
            if self.cancel.is_canceled() {
                return Err(RestoreError::Canceled);
            }
            let mut entry = entry.map_err(RestoreError::ReadFailed)?;
            let raw_name = String::from_utf8(entry.path_bytes().into_owned())
                .map_err(|_| NameError::Unsafe("<non-utf8>".to_owned()))?;
            let parsed = names::classify(&raw_name)?;
            debug!(member = %raw_name, "announced");

            let accepted = prefixes.iter().any(|p| raw_name.starts_with(p.as_str()));
            if !accepted {
                debug!(member = %raw_name, "not selected for restore, ignoring");
                continue;
            }
            quota.admit(entry.size())?;

            if !parsed.is_mac {
                if let Some((_, name, staged, _)) = pending.take() {
                    let _ = fs::remove_file(staged);
                    return Err(RestoreError::OrphanChunk(name));
                }
                let staged = scratch.join(&raw_name);
                if let Some(parent) = staged.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&staged)?;
                let size = io::copy(&mut entry, &mut out).map_err(RestoreError::ReadFailed)?;
                pending = Some((parsed, raw_name, staged, size));
                continue;
            }

            // companion tag: must match the staged data chunk exactly
            let (data, data_name, staged, size) = match pending.take() {
                Some(pending) => pending,
                None => return Err(RestoreError::OrphanChunk(raw_name)),
            };
            if parsed.member != data.member || parsed.seq != data.seq {
                let _ = fs::remove_file(&staged);
                return Err(RestoreError::OrphanChunk(raw_name));
            }
            if entry.size() > MAX_TAG_BYTES {
                let _ = fs::remove_file(&staged);
                return Err(RestoreError::UnsafeName(NameError::Unsafe(raw_name)));
            }
            let mut tag_bytes = Vec::new();
            entry
                .read_to_end(&mut tag_bytes)
                .map_err(RestoreError::ReadFailed)?;
            let tag = parse_tag(&tag_bytes)?;
            if !file_mac_matches(mac, self.passphrase.as_bytes(), &staged, &tag)? {
                let _ = fs::remove_file(&staged);
                if !self.options.skip_broken {
                    return Err(RestoreError::BadMac(data_name));
                }
                warn!(member = %data_name, "invalid MAC, skipping member");
                if controller.current_member() == Some(data.member.as_str()) {
                    controller.fail_current();
                } else {
                    controller.report.failed.push(data.member.clone());
                }
                skipping = Some(data.member.clone());
                continue;
            }
            progress.add_current(size);

            match data.seq {
                Some(0) => {
                    skipping = None;
                    if let Err(e) = controller.begin_member(&data.member) {
                        if !self.options.skip_broken {
                            return Err(RestoreError::ExtractFailed(e.to_string()));
                        }
                        warn!(error = %e, "previous member failed, continuing");
                    }
                    if let Err(e) = controller.feed_chunk(&data.member, 0, staged) {
                        return Err(RestoreError::ExtractFailed(e.to_string()));
                    }
                }
                Some(seq) => {
                    if skipping.as_deref() == Some(data.member.as_str()) {
                        let _ = fs::remove_file(&staged);
                        continue;
                    }
                    if let Err(e) = controller.feed_chunk(&data.member, seq, staged) {
                        return Err(RestoreError::OrphanChunk(e.to_string()));
                    }
                }
                None => {
                    // verified but not part of the chunk grammar; the old
                    // engines dropped these on the floor too
                    debug!(member = %data_name, "ignoring non-chunk member");
                    let _ = fs::remove_file(&staged);
                }
            }
        }

        if let Some((_, name, staged, _)) = pending.take() {
            let _ = fs::remove_file(staged);
            return Err(RestoreError::OrphanChunk(name));
        }
        Ok(())
    }

    /// Every planned VM must have produced at least one terminal member
    /// state, otherwise the archive ended early
    fn check_completeness(&self, info: &RestoreInfo, report: &RestoreReport) -> Result<()> {
        for (name, slot) in info {
            if !slot.good_to_go() {
                continue;
            }
            let prefix = if slot.username.is_some() {
                format!("{ADMIN_HOME_SUBDIR}/")
            } else {
                slot.subdir.clone()
            };
            let seen = report
                .done
                .iter()
                .chain(report.failed.iter())
                .any(|member| member.starts_with(&prefix));
            if !seen {
                return Err(RestoreError::PrematureEof(name.clone()));
            }
        }
        Ok(())
    }

    /// Moves extracted trees into place and commits them into the live
    /// catalog, templates first
    fn commit(&mut self, info: &RestoreInfo, scratch: &Path) -> Result<()> {
        let mut order: Vec<&VmToRestore> = info
            .values()
            .filter(|slot| slot.good_to_go() && slot.username.is_none())
            .collect();
        order.sort_by_key(|slot| (!slot.vm.is_template(), slot.name.clone()));

        for slot in order {
            if self.cancel.is_canceled() {
                return Err(RestoreError::Canceled);
            }
            let src = scratch.join(slot.subdir.trim_end_matches('/'));
            if !src.exists() {
                if self.options.skip_broken {
                    warn!(vm = %slot.name, "no data extracted, skipping");
                    continue;
                }
                return Err(RestoreError::PrematureEof(slot.name.clone()));
            }
            let mut entry = slot.vm.clone();
            entry.name = slot.name.clone();
            entry.template = slot
                .template
                .as_ref()
                .map(|t| restored_name(info, t))
                .map(|t| t.to_owned());
            entry.netvm = slot
                .netvm
                .as_ref()
                .map(|n| restored_name(info, n))
                .map(|n| n.to_owned());
            entry.clear_backup_features();

            let dest = self.app.vm_dir(&slot.name);
            info!(vm = %slot.name, dest = %dest.display(), "restoring");
            fsutil::move_tree(&src, &dest)?;
            self.app.register_vm(&entry)?;
        }

        if let Some(slot) = info.values().find(|slot| slot.username.is_some()) {
            if slot.good_to_go() {
                self.restore_admin_home(&scratch.join(&slot.subdir))?;
            }
        }
        Ok(())
    }

    /// Restores the management domain's home directory, moving anything in
    /// the way into a `home-pre-restore-<stamp>` directory first
    fn restore_admin_home(&mut self, src: &Path) -> Result<()> {
        if !src.is_dir() {
            return Err(RestoreError::PrematureEof("management home".to_owned()));
        }
        let home = self.app.admin_home();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let aside = home.join(format!("home-pre-restore-{stamp}"));
        info!(user = %self.app.admin_user(), aside = %aside.display(), "restoring home");
        fs::create_dir_all(&aside)?;
        for item in fs::read_dir(src)? {
            let item = item?;
            let target = home.join(item.file_name());
            if target.exists() {
                fs::rename(&target, aside.join(item.file_name()))?;
            }
            fsutil::move_tree(&item.path(), &target)?;
        }
        Ok(())
    }

    /// A legacy archive is a plain directory tree; integrity verification
    /// does not exist for it
    fn restore_v1(&mut self, info: &RestoreInfo) -> Result<RestoreReport> {
        if self.options.verify_only {
            warn!("verification is not supported for legacy version-1 archives");
            return Ok(RestoreReport::default());
        }
        self.check_plan_is_actionable(info)?;
        let root = match &self.location {
            RestoreLocation::LocalFile(path) => path.clone(),
            RestoreLocation::HelperVm { .. } => {
                return Err(RestoreError::LegacyRefused);
            }
        };
        let mut report = RestoreReport::default();
        for slot in info.values() {
            if !slot.good_to_go() || slot.username.is_some() {
                continue;
            }
            let src = root.join(slot.subdir.trim_end_matches('/'));
            if !src.is_dir() {
                return Err(RestoreError::PrematureEof(slot.name.clone()));
            }
            let mut entry = slot.vm.clone();
            entry.name = slot.name.clone();
            entry.clear_backup_features();
            fsutil::copy_tree(&src, &self.app.vm_dir(&slot.name))?;
            self.app.register_vm(&entry)?;
            report.done.push(slot.subdir.clone());
        }
        Ok(report)
    }
}

/// Reads one outer entry fully into memory, for the size-capped header
/// phase
fn next_member_in_memory<R: Read>(
    entries: &mut tar::Entries<R>,
    quota: &mut QuotaGuard,
) -> Result<Option<(String, Vec<u8>)>> {
    let entry = match entries.next() {
        Some(entry) => entry,
        None => return Ok(None),
    };
    let mut entry = entry.map_err(RestoreError::ReadFailed)?;
    let raw_name = String::from_utf8(entry.path_bytes().into_owned())
        .map_err(|_| NameError::Unsafe("<non-utf8>".to_owned()))?;
    names::validate(&raw_name)?;
    quota.admit(entry.size())?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .map_err(RestoreError::ReadFailed)?;
    Ok(Some((raw_name, bytes)))
}

/// Streams a staged chunk through the MAC and compares in constant time
fn file_mac_matches(
    algo: MacAlgorithm,
    passphrase: &[u8],
    path: &Path,
    tag: &[u8],
) -> Result<bool> {
    let mut mac = algo.hasher(passphrase);
    let mut file = File::open(path)?;
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        mac.update(&buf[..n]);
    }
    Ok(mac.verify(tag))
}

/// The on-host name of a dependency, following any rename it got in the
/// same plan
fn restored_name<'a>(info: &'a RestoreInfo, name: &'a str) -> &'a str {
    match info.get(name) {
        Some(slot) if slot.good_to_go() => &slot.name,
        _ => name,
    }
}
