/*!
Compression filters for the inner archive stream.

A filter is named in the archive header by the program that implements it
(`compression-filter=gzip`). The default filter is handled in process with
`flate2`, staying wire-compatible with the gzip program; any other name is
spawned as a child process filtering stdin to stdout, the way the original
pipelines invoked it. The zlib variant exists for version-2 archives, whose
inner stream carries zlib data inside the encryption layer.
*/

use flate2::read::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use thiserror::Error;
use tracing::debug;

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

/// Filter program named by the archive header when none was chosen
/// explicitly
pub const DEFAULT_FILTER: &str = "gzip";

/// Error describing things that can go wrong setting a filter up
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("filter name {0:?} is not a valid header token")]
    BadName(String),
    #[error("failed to spawn filter program {0}")]
    Spawn(String, #[source] io::Error),
}

/// A compression filter for one direction of the pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// In-process gzip, wire-compatible with the gzip program
    Gzip,
    /// In-process zlib, as found inside version-2 encrypted streams
    Zlib,
    /// An arbitrary filter program, spawned with no arguments to compress
    /// and with `-d` to decompress
    Program(String),
}

impl Filter {
    /// Maps a header token onto a filter. Known names get the in-process
    /// implementation; anything else is treated as a program name, provided
    /// it satisfies the header value grammar.
    pub fn from_name(name: &str) -> Result<Filter, FilterError> {
        match name {
            "gzip" => Ok(Filter::Gzip),
            _ => {
                let valid = !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
                if valid {
                    Ok(Filter::Program(name.to_owned()))
                } else {
                    Err(FilterError::BadName(name.to_owned()))
                }
            }
        }
    }

    /// The token recorded in the archive header
    pub fn name(&self) -> &str {
        match self {
            Filter::Gzip => "gzip",
            Filter::Zlib => "zlib",
            Filter::Program(name) => name,
        }
    }

    /// Wraps `inner` in a compressing reader
    pub fn compress(
        &self,
        inner: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>, FilterError> {
        match self {
            Filter::Gzip => Ok(Box::new(GzEncoder::new(inner, flate2::Compression::default()))),
            Filter::Zlib => Ok(Box::new(ZlibEncoder::new(
                inner,
                flate2::Compression::default(),
            ))),
            Filter::Program(name) => Ok(Box::new(ProgramReader::spawn(name, &[], inner)?)),
        }
    }

    /// Wraps `inner` in a decompressing reader
    pub fn decompress(
        &self,
        inner: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>, FilterError> {
        match self {
            Filter::Gzip => Ok(Box::new(GzDecoder::new(inner))),
            Filter::Zlib => Ok(Box::new(ZlibDecoder::new(inner))),
            Filter::Program(name) => Ok(Box::new(ProgramReader::spawn(name, &["-d"], inner)?)),
        }
    }
}

/// A child filter process exposed as a `Read`.
///
/// A feeder thread copies the inner stream into the child's stdin so reads
/// from its stdout never deadlock; the child is reaped when its output runs
/// dry, and killed if the reader is dropped early.
struct ProgramReader {
    child: Child,
    stdout: Option<ChildStdout>,
    feeder: Option<JoinHandle<io::Result<u64>>>,
    name: String,
}

impl ProgramReader {
    fn spawn(
        name: &str,
        args: &[&str],
        mut inner: Box<dyn Read + Send>,
    ) -> Result<ProgramReader, FilterError> {
        debug!(program = name, ?args, "spawning filter program");
        let mut child = Command::new(name)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FilterError::Spawn(name.to_owned(), e))?;
        let mut stdin = child.stdin.take().expect("stdin was requested");
        let stdout = child.stdout.take().expect("stdout was requested");
        let feeder = std::thread::spawn(move || {
            let copied = io::copy(&mut inner, &mut stdin)?;
            stdin.flush()?;
            // dropping stdin closes the child's input
            Ok(copied)
        });
        Ok(ProgramReader {
            child,
            stdout: Some(stdout),
            feeder: Some(feeder),
            name: name.to_owned(),
        })
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(feeder) = self.feeder.take() {
            match feeder.join() {
                Ok(result) => {
                    result?;
                }
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("feeder thread for filter {} panicked", self.name),
                    ));
                }
            }
        }
        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("filter program {} exited with {status}", self.name),
            ))
        }
    }
}

impl Read for ProgramReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stdout = match self.stdout.as_mut() {
            Some(stdout) => stdout,
            None => return Ok(0),
        };
        let n = stdout.read(buf)?;
        if n == 0 {
            self.stdout = None;
            self.finish()?;
        }
        Ok(n)
    }
}

impl Drop for ProgramReader {
    fn drop(&mut self) {
        if self.stdout.is_some() {
            // abandoned mid-stream
            let _ = self.child.kill();
            let _ = self.child.wait();
            if let Some(feeder) = self.feeder.take() {
                let _ = feeder.join();
            }
        }
    }
}
