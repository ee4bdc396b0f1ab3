/*!
Fixed-limit chunk framing of the inner archive stream.

The splitter obeys three laws: the stream is cut into one or more chunks,
each no larger than the limit; concatenating the chunks in order reproduces
the stream byte for byte; and the same stream with the same limit always
produces the same cuts. `Join` is the inverse, a reader concatenating a
sequence of readers.
*/

use std::io::{self, Read, Write};

/// Size bound of a data chunk. Changing this changes produced archives but
/// not the format; readers accept any chunk sizes.
pub const CHUNK_SIZE: u64 = 100 * 1024 * 1024;

const COPY_BUF: usize = 64 * 1024;

/// Splits a stream into chunks of at most `limit` bytes, writing each chunk
/// to a caller-provided writer.
///
/// One byte of lookahead distinguishes "exactly at the limit" from "stream
/// exhausted", so a stream whose length is a multiple of the limit does not
/// produce a trailing empty chunk.
pub struct Splitter<R> {
    inner: R,
    limit: u64,
    peeked: Option<u8>,
    emitted_any: bool,
    done: bool,
}

impl<R: Read> Splitter<R> {
    pub fn new(inner: R, limit: u64) -> Splitter<R> {
        assert!(limit > 0, "chunk limit must be positive");
        Splitter {
            inner,
            limit,
            peeked: None,
            emitted_any: false,
            done: false,
        }
    }

    /// Writes the next chunk into `out`, returning its size, or `None` once
    /// the stream is exhausted.
    ///
    /// An empty input stream yields exactly one empty chunk, so every member
    /// has at least one chunk on the wire.
    pub fn next_chunk<W: Write>(&mut self, out: &mut W) -> io::Result<Option<u64>> {
        if self.done {
            return Ok(None);
        }
        let mut written: u64 = 0;
        if let Some(byte) = self.peeked.take() {
            out.write_all(&[byte])?;
            written = 1;
        }
        let mut buf = [0_u8; COPY_BUF];
        while written < self.limit {
            let want = (self.limit - written).min(COPY_BUF as u64) as usize;
            let n = self.inner.read(&mut buf[..want])?;
            if n == 0 {
                self.done = true;
                break;
            }
            out.write_all(&buf[..n])?;
            written += n as u64;
        }
        if !self.done {
            // at the limit; peek to learn whether more data follows
            let mut one = [0_u8; 1];
            match self.inner.read(&mut one)? {
                0 => self.done = true,
                _ => self.peeked = Some(one[0]),
            }
        }
        if written == 0 && self.emitted_any {
            return Ok(None);
        }
        self.emitted_any = true;
        Ok(Some(written))
    }
}

/// Concatenates a sequence of readers back into one stream, in order
pub struct Join<I, R> {
    sources: I,
    current: Option<R>,
}

impl<I, R> Join<I, R>
where
    I: Iterator<Item = io::Result<R>>,
    R: Read,
{
    pub fn new(sources: I) -> Join<I, R> {
        Join {
            sources,
            current: None,
        }
    }
}

impl<I, R> Read for Join<I, R>
where
    I: Iterator<Item = io::Result<R>>,
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(current) = self.current.as_mut() {
                let n = current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            match self.sources.next() {
                Some(source) => self.current = Some(source?),
                None => return Ok(0),
            }
        }
    }
}
