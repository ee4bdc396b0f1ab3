//! Byte transport between the pipelines and the outside world: a local
//! file, or a helper process running in another domain.
//!
//! The helper is spawned through the configured RPC client and receives the
//! destination (or source) path as its first newline-terminated message; on
//! restore it also receives the accepted member-path prefixes. The restore
//! side additionally enforces the ingress quotas before any announced byte
//! touches disk.

use crate::engine::EngineConfig;
use thiserror::Error;
use tracing::{debug, warn};

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

/// Cap on diagnostics collected from a helper's stderr
pub const MAX_STDERR_BYTES: usize = 1024;

/// Environment override of the ingress file-count quota
pub const ENV_MAX_FILES: &str = "UPDATES_MAX_FILES";

/// Environment override of the ingress byte quota
pub const ENV_MAX_BYTES: &str = "UPDATES_MAX_BYTES";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("archive I/O failed")]
    Io(#[from] io::Error),
    #[error("backup directory for {0} does not exist")]
    MissingTargetDir(PathBuf),
    #[error("failed to spawn helper {0:?}")]
    SpawnFailed(String, #[source] io::Error),
    #[error("helper process failed: {0}")]
    HelperFailed(String),
    #[error("archive exceeds the transfer quota: {kind} {seen} over limit {limit}")]
    QuotaExceeded {
        kind: &'static str,
        seen: u64,
        limit: u64,
    },
}

type Result<T> = std::result::Result<T, TransportError>;

/// Where a backup run sends its bytes
#[derive(Clone, Debug)]
pub enum BackupTarget {
    /// A file (or directory, in which case a timestamped file is created
    /// inside it) on the local host
    LocalFile(PathBuf),
    /// A path inside another domain, reached through the backup helper
    HelperVm { vm: String, path: String },
}

/// Where a restore run reads its bytes from
#[derive(Clone, Debug)]
pub enum RestoreLocation {
    LocalFile(PathBuf),
    HelperVm { vm: String, path: String },
}

/// An open byte sink for one backup run
pub struct Sink {
    kind: SinkKind,
}

enum SinkKind {
    File(File),
    Helper(HelperChild),
}

impl Sink {
    pub fn open(config: &EngineConfig, target: &BackupTarget) -> Result<Sink> {
        match target {
            BackupTarget::LocalFile(path) => {
                let path = if path.is_dir() {
                    let stamp = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    path.join(format!("backup-{stamp}"))
                } else {
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            return Err(TransportError::MissingTargetDir(parent.to_owned()));
                        }
                    }
                    path.clone()
                };
                debug!(?path, "opening local backup target");
                Ok(Sink {
                    kind: SinkKind::File(File::create(path)?),
                })
            }
            BackupTarget::HelperVm { vm, path } => {
                let helper = HelperChild::spawn(config, &config.backup_service, vm)?;
                let mut sink = Sink {
                    kind: SinkKind::Helper(helper),
                };
                sink.send_line(path)?;
                Ok(sink)
            }
        }
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        let clean: String = line.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        self.write_all(clean.as_bytes())?;
        self.write_all(b"\n")?;
        Ok(())
    }

    /// Flushes, closes the helper's stdin, and reaps it. Must be called for
    /// the archive to be considered fully delivered.
    pub fn finish(self) -> Result<()> {
        match self.kind {
            SinkKind::File(mut file) => {
                file.flush()?;
                file.sync_all()?;
                Ok(())
            }
            SinkKind::Helper(helper) => helper.finish(),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.kind {
            SinkKind::File(file) => file.write(buf),
            SinkKind::Helper(helper) => helper.stdin().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.kind {
            SinkKind::File(file) => file.flush(),
            SinkKind::Helper(helper) => helper.stdin().flush(),
        }
    }
}

/// An open byte source for one restore run
pub struct Source {
    data: Option<Box<dyn Read + Send>>,
    helper: Option<HelperChild>,
}

impl Source {
    /// Opens the archive stream. For a helper source, the path and the
    /// accepted member-path prefixes are sent before any byte is read back.
    pub fn open(
        config: &EngineConfig,
        location: &RestoreLocation,
        accepted_prefixes: &[String],
    ) -> Result<Source> {
        match location {
            RestoreLocation::LocalFile(path) => {
                debug!(?path, "opening local archive");
                Ok(Source {
                    data: Some(Box::new(File::open(path)?)),
                    helper: None,
                })
            }
            RestoreLocation::HelperVm { vm, path } => {
                let mut helper = HelperChild::spawn(config, &config.restore_service, vm)?;
                let clean: String = path.chars().filter(|c| *c != '\r' && *c != '\n').collect();
                let stdin = helper.stdin();
                writeln!(stdin, "{clean}")?;
                writeln!(stdin, "{}", accepted_prefixes.join(" "))?;
                stdin.flush()?;
                // the helper holds the only live write end from here on
                helper.close_stdin();
                let data = helper
                    .child
                    .stdout
                    .take()
                    .expect("stdout was requested");
                Ok(Source {
                    data: Some(Box::new(data)),
                    helper: Some(helper),
                })
            }
        }
    }

    /// The archive byte stream
    pub fn data(&mut self) -> &mut (dyn Read + Send) {
        self.data.as_mut().expect("source not finished").as_mut()
    }

    /// Drops the stream and reaps the helper, surfacing its diagnostics if
    /// it failed
    pub fn finish(mut self) -> Result<()> {
        self.data.take();
        match self.helper.take() {
            Some(helper) => helper.finish(),
            None => Ok(()),
        }
    }
}

/// A spawned helper process with its plumbing
struct HelperChild {
    child: Child,
    stdin: Option<ChildStdin>,
    describe: String,
}

impl HelperChild {
    fn spawn(config: &EngineConfig, service: &str, vm: &str) -> Result<HelperChild> {
        let describe = format!("{} {} {}", config.rpc_client.display(), vm, service);
        debug!(%describe, "spawning helper");
        let mut child = Command::new(&config.rpc_client)
            .arg(vm)
            .arg(service)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::SpawnFailed(describe.clone(), e))?;
        let stdin = child.stdin.take();
        Ok(HelperChild {
            child,
            stdin,
            describe,
        })
    }

    fn stdin(&mut self) -> &mut ChildStdin {
        self.stdin.as_mut().expect("helper stdin already closed")
    }

    fn close_stdin(&mut self) {
        self.stdin.take();
    }

    fn finish(mut self) -> Result<()> {
        self.stdin.take();
        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }
        let mut diagnostics = String::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            let mut buf = vec![0_u8; MAX_STDERR_BYTES];
            if let Ok(n) = stderr.read(&mut buf) {
                diagnostics = String::from_utf8_lossy(&buf[..n]).into_owned();
            }
        }
        warn!(helper = %self.describe, %status, "helper failed");
        Err(TransportError::HelperFailed(format!(
            "{} exited with {status}: {diagnostics}",
            self.describe
        )))
    }
}

impl Drop for HelperChild {
    fn drop(&mut self) {
        // normally reaped by finish(); a helper abandoned on an error path
        // must not linger
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Ingress quotas applied to announced members before their bytes touch
/// disk.
///
/// Defaults are computed from the restore plan; the environment variables
/// and the engine config can tighten or widen them.
#[derive(Debug)]
pub struct QuotaGuard {
    max_files: u64,
    max_bytes: u64,
    files: u64,
    bytes: u64,
}

impl QuotaGuard {
    /// A guard with explicit limits, for the header phase whose bounds are
    /// fixed by the format rather than the plan
    pub fn fixed(max_files: u64, max_bytes: u64) -> QuotaGuard {
        QuotaGuard {
            max_files,
            max_bytes,
            files: 0,
            bytes: 0,
        }
    }

    pub fn new(config: &EngineConfig, expected_members: u64, expected_bytes: u64) -> QuotaGuard {
        // At least twice the expected member count, with headroom for the
        // companion tags, mirroring the historical sizing
        let default_files = 2 * (10 * expected_members.max(1)
            + expected_bytes / config.chunk_size.max(1));
        let default_bytes = expected_bytes + expected_bytes / 10 + 1024 * 1024;
        let max_files = config
            .max_files_override
            .or_else(|| env_quota(ENV_MAX_FILES))
            .unwrap_or(default_files);
        let max_bytes = config
            .max_bytes_override
            .or_else(|| env_quota(ENV_MAX_BYTES))
            .unwrap_or(default_bytes);
        QuotaGuard {
            max_files,
            max_bytes,
            files: 0,
            bytes: 0,
        }
    }

    /// Admits one announced member of the given size, or fails the run
    pub fn admit(&mut self, size: u64) -> Result<()> {
        self.files += 1;
        if self.files > self.max_files {
            return Err(TransportError::QuotaExceeded {
                kind: "files",
                seen: self.files,
                limit: self.max_files,
            });
        }
        self.bytes = self.bytes.saturating_add(size);
        if self.bytes > self.max_bytes {
            return Err(TransportError::QuotaExceeded {
                kind: "bytes",
                seen: self.bytes,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

fn env_quota(var: &str) -> Option<u64> {
    std::env::var(var).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_size: 100,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn quota_counts_files_and_bytes() {
        let mut guard = QuotaGuard {
            max_files: 2,
            max_bytes: 100,
            files: 0,
            bytes: 0,
        };
        guard.admit(40).unwrap();
        guard.admit(40).unwrap();
        assert!(matches!(
            guard.admit(1),
            Err(TransportError::QuotaExceeded { kind: "files", .. })
        ));

        let mut guard = QuotaGuard {
            max_files: 10,
            max_bytes: 100,
            files: 0,
            bytes: 0,
        };
        guard.admit(90).unwrap();
        assert!(matches!(
            guard.admit(20),
            Err(TransportError::QuotaExceeded { kind: "bytes", .. })
        ));
    }

    #[test]
    fn computed_quota_covers_the_plan() {
        let guard = QuotaGuard::new(&config(), 3, 1000);
        // 2 * (10 * 3 + 1000 / 100) = 80
        assert_eq!(guard.max_files, 80);
        assert!(guard.max_bytes >= 1000);
    }

    #[test]
    fn local_sink_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive");
        let mut sink = Sink::open(
            &EngineConfig::default(),
            &BackupTarget::LocalFile(path.clone()),
        )
        .unwrap();
        sink.write_all(b"archive bytes").unwrap();
        sink.finish().unwrap();

        let mut source = Source::open(
            &EngineConfig::default(),
            &RestoreLocation::LocalFile(path),
            &[],
        )
        .unwrap();
        let mut out = Vec::new();
        source.data().read_to_end(&mut out).unwrap();
        source.finish().unwrap();
        assert_eq!(out, b"archive bytes");
    }

    #[test]
    fn missing_target_dir_is_an_error() {
        let result = Sink::open(
            &EngineConfig::default(),
            &BackupTarget::LocalFile(PathBuf::from("/nonexistent-dir-for-sure/archive")),
        );
        assert!(matches!(result, Err(TransportError::MissingTargetDir(_))));
    }
}
