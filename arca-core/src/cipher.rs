/*!
Streaming symmetric encryption of the inner archive stream.

The wire format is the one the openssl `enc` command produces from a
passphrase: the ASCII magic `Salted__`, an 8-byte random salt, then the
CBC ciphertext with PKCS#7 padding. Key and IV are derived from the
passphrase and salt with the legacy single-round MD5 `EVP_BytesToKey`
schedule, so an archive encrypted here decrypts with the reference CLI and
vice versa.

Both directions are `Read` adapters: they pull from an inner reader and can
be stacked under the compression filter and over the chunk splitter without
buffering more than one copy window.
*/

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::prelude::*;
use thiserror::Error;

use std::io::{self, Read};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const MAGIC: &[u8; 8] = b"Salted__";
const BLOCK: usize = 16;
const KEY_LEN: usize = 32;
const COPY_BUF: usize = 64 * 1024;

/// Error describing things that can go wrong with the cipher layer
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("unknown cipher algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("ciphertext lacks the salt header")]
    BadMagic,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("bad padding in final ciphertext block")]
    BadPadding,
}

type Result<T> = std::result::Result<T, CipherError>;

/// Tag for the symmetric cipher protecting an archive
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cipher {
    Aes256Cbc,
}

impl Cipher {
    pub const DEFAULT: Cipher = Cipher::Aes256Cbc;

    pub fn supported() -> Vec<Cipher> {
        vec![Cipher::Aes256Cbc]
    }

    /// Looks a name up, case-sensitively. Unknown names fail loudly.
    pub fn from_name(name: &str) -> Result<Cipher> {
        match name {
            "aes-256-cbc" => Ok(Cipher::Aes256Cbc),
            other => Err(CipherError::UnknownAlgorithm(other.to_owned())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes256Cbc => "aes-256-cbc",
        }
    }

    /// Wraps `inner` in an encrypting reader with a freshly drawn salt
    pub fn encrypt_stream<R: Read>(self, passphrase: &[u8], inner: R) -> EncryptReader<R> {
        let Cipher::Aes256Cbc = self;
        let mut salt = [0_u8; 8];
        thread_rng().fill_bytes(&mut salt);
        EncryptReader::with_salt(passphrase, salt, inner)
    }

    /// Wraps `inner` in a decrypting reader; the salt header is consumed on
    /// the first read
    pub fn decrypt_stream<R: Read>(self, passphrase: &[u8], inner: R) -> DecryptReader<R> {
        let Cipher::Aes256Cbc = self;
        DecryptReader {
            inner: Some(inner),
            dec: None,
            passphrase: passphrase.to_vec(),
            out: Vec::new(),
            pos: 0,
            carry: Vec::new(),
            held: None,
        }
    }
}

/// The single-round MD5 key schedule the reference CLI applies to a
/// passphrase:
/// `D_1 = MD5(pass || salt)`, `D_i = MD5(D_{i-1} || pass || salt)`,
/// concatenated until key and IV are filled.
fn evp_bytes_to_key(passphrase: &[u8], salt: &[u8; 8]) -> ([u8; KEY_LEN], [u8; BLOCK]) {
    let mut material = Vec::with_capacity(KEY_LEN + BLOCK);
    let mut previous: Vec<u8> = Vec::new();
    while material.len() < KEY_LEN + BLOCK {
        let mut hasher = Md5::new();
        hasher.update(&previous);
        hasher.update(passphrase);
        hasher.update(salt);
        previous = hasher.finalize().to_vec();
        material.extend_from_slice(&previous);
    }
    let mut key = [0_u8; KEY_LEN];
    let mut iv = [0_u8; BLOCK];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + BLOCK]);
    (key, iv)
}

/// Encrypting `Read` adapter producing `Salted__` + salt + CBC ciphertext
pub struct EncryptReader<R> {
    inner: Option<R>,
    enc: Aes256CbcEnc,
    out: Vec<u8>,
    pos: usize,
    carry: Vec<u8>,
}

impl<R: Read> EncryptReader<R> {
    fn with_salt(passphrase: &[u8], salt: [u8; 8], inner: R) -> EncryptReader<R> {
        let (key, iv) = evp_bytes_to_key(passphrase, &salt);
        let mut out = Vec::with_capacity(MAGIC.len() + salt.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        EncryptReader {
            inner: Some(inner),
            enc: Aes256CbcEnc::new(&key.into(), &iv.into()),
            out,
            pos: 0,
            carry: Vec::new(),
        }
    }

    /// Pulls plaintext and refills `out` with ciphertext. Leaves `out`
    /// empty only once the final padded block has been produced.
    fn refill(&mut self) -> io::Result<()> {
        self.out.clear();
        self.pos = 0;
        let mut buf = [0_u8; COPY_BUF];
        while self.out.is_empty() {
            let inner = match self.inner.as_mut() {
                Some(inner) => inner,
                None => return Ok(()),
            };
            let n = inner.read(&mut buf)?;
            if n == 0 {
                // EOF: emit the padded final block
                let pad = (BLOCK - self.carry.len() % BLOCK) as u8;
                self.carry.resize(self.carry.len() + pad as usize, pad);
                for block in self.carry.chunks_mut(BLOCK) {
                    self.enc
                        .encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                self.out.extend_from_slice(&self.carry);
                self.carry.clear();
                self.inner = None;
                return Ok(());
            }
            self.carry.extend_from_slice(&buf[..n]);
            let whole = self.carry.len() - self.carry.len() % BLOCK;
            if whole > 0 {
                let mut ready: Vec<u8> = self.carry.drain(..whole).collect();
                for block in ready.chunks_mut(BLOCK) {
                    self.enc
                        .encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                self.out = ready;
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for EncryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.out.len() {
            self.refill()?;
            if self.out.is_empty() {
                return Ok(0);
            }
        }
        let n = (self.out.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Decrypting `Read` adapter consuming the `Salted__` wire format.
///
/// The final ciphertext block is withheld until the inner stream ends so the
/// padding can be stripped; misaligned or empty ciphertext and malformed
/// padding surface as `InvalidData` errors.
pub struct DecryptReader<R> {
    inner: Option<R>,
    dec: Option<Aes256CbcDec>,
    passphrase: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    carry: Vec<u8>,
    held: Option<[u8; BLOCK]>,
}

impl<R: Read> DecryptReader<R> {
    fn read_salt_header(&mut self) -> io::Result<()> {
        let inner = self.inner.as_mut().expect("header read before EOF");
        let mut header = [0_u8; 16];
        let mut got = 0;
        while got < header.len() {
            let n = inner.read(&mut header[got..])?;
            if n == 0 {
                return Err(invalid(CipherError::Truncated));
            }
            got += n;
        }
        if &header[..8] != MAGIC {
            return Err(invalid(CipherError::BadMagic));
        }
        let mut salt = [0_u8; 8];
        salt.copy_from_slice(&header[8..]);
        let (key, iv) = evp_bytes_to_key(&self.passphrase, &salt);
        self.dec = Some(Aes256CbcDec::new(&key.into(), &iv.into()));
        self.passphrase.clear();
        Ok(())
    }

    fn decrypt_ready(&mut self, eof: bool) -> io::Result<()> {
        let dec = self.dec.as_mut().expect("cipher initialized");
        let whole = self.carry.len() - self.carry.len() % BLOCK;
        let mut ready: Vec<u8> = self.carry.drain(..whole).collect();
        for block in ready.chunks_mut(BLOCK) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
            let mut plain = [0_u8; BLOCK];
            plain.copy_from_slice(block);
            if let Some(prev) = self.held.replace(plain) {
                self.out.extend_from_slice(&prev);
            }
        }
        if eof {
            if !self.carry.is_empty() {
                return Err(invalid(CipherError::Truncated));
            }
            let last = self.held.take().ok_or_else(|| invalid(CipherError::Truncated))?;
            let pad = last[BLOCK - 1] as usize;
            if pad == 0 || pad > BLOCK || last[BLOCK - pad..].iter().any(|&b| b as usize != pad) {
                return Err(invalid(CipherError::BadPadding));
            }
            self.out.extend_from_slice(&last[..BLOCK - pad]);
            self.inner = None;
        }
        Ok(())
    }

    fn refill(&mut self) -> io::Result<()> {
        self.out.clear();
        self.pos = 0;
        if self.dec.is_none() {
            if self.inner.is_none() {
                return Ok(());
            }
            self.read_salt_header()?;
        }
        let mut buf = [0_u8; COPY_BUF];
        while self.out.is_empty() {
            let inner = match self.inner.as_mut() {
                Some(inner) => inner,
                None => return Ok(()),
            };
            let n = inner.read(&mut buf)?;
            if n == 0 {
                return self.decrypt_ready(true);
            }
            self.carry.extend_from_slice(&buf[..n]);
            self.decrypt_ready(false)?;
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.out.len() {
            self.refill()?;
            if self.out.is_empty() {
                return Ok(0);
            }
        }
        let n = (self.out.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn invalid(err: CipherError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
