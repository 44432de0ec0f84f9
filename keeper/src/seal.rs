//! Sealed artifact containers.
//!
//! A verified raw capture is wrapped into a container that is optionally
//! zstd-compressed and optionally AES-256-GCM encrypted.
//!
//! # File Format
//!
//! ```text
//! [Magic: 4 bytes "KEEP"] [Version: 1 byte] [Flags: 1 byte]
//! [Nonce prefix: 7 bytes, only when encrypted] [Payload]
//! ```
//!
//! Flags: bit 0 = compressed, bit 1 = encrypted. The payload is the raw
//! capture, zstd-compressed if flagged. Encrypted payloads are a sequence of
//! frames, each sealing at most [`FRAME_SIZE`] bytes of plaintext:
//!
//! ```text
//! [Final: 1 byte] [Ciphertext length: 4 bytes BE] [Ciphertext + tag]
//! ```
//!
//! Frame `i` uses the nonce `prefix || i (4 bytes BE) || final` and the six
//! header bytes as associated data, so frames cannot be reordered, dropped,
//! or cut off after a non-final frame without failing authentication.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::artifact::{sha256_file, Artifact};
use crate::error::{Error, Result};

/// Magic bytes for sealed containers
const MAGIC: &[u8; 4] = b"KEEP";

/// Current format version
const VERSION: u8 = 0x01;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_ENCRYPTED: u8 = 0b10;

/// Nonce size (96 bits for AES-GCM)
const NONCE_SIZE: usize = 12;

/// Random per-container part of every frame nonce
const NONCE_PREFIX_SIZE: usize = 7;

/// Plaintext bytes sealed per frame
pub const FRAME_SIZE: usize = 64 * 1024;

/// GCM authentication tag appended to every frame
const TAG_SIZE: usize = 16;

/// Frame header: final flag (1) + ciphertext length (4)
const FRAME_HEADER_SIZE: usize = 5;

/// Key size (256 bits for AES-256)
const KEY_SIZE: usize = 32;

/// Header size without nonce: magic (4) + version (1) + flags (1)
const HEADER_SIZE: usize = 6;

/// A 256-bit key handle. Only its id is ever recorded.
#[derive(Clone)]
pub struct EncryptionKey {
    key: [u8; KEY_SIZE],
    key_id: String,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_id", &self.key_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl EncryptionKey {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::Config(format!(
                "Key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        // Fingerprint, not the key: lets restore detect a wrong key early
        let digest = Sha256::digest(key);
        let key_id = format!("sha256:{}", &hex::encode(digest)[..16]);
        Ok(Self { key, key_id })
    }

    /// Create from a hex-encoded key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| Error::Config(format!("Invalid hex key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Create from a base64-encoded key.
    pub fn from_base64(b64_key: &str) -> Result<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let bytes = STANDARD
            .decode(b64_key.trim())
            .map_err(|e| Error::Config(format!("Invalid base64 key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Read a key from an environment variable, hex (64 chars) or base64.
    pub fn from_env(var: &str) -> Result<Self> {
        let value = std::env::var(var)
            .map_err(|_| Error::Config(format!("Encryption key env var {} is not set", var)))?;
        let value = value.trim();
        if value.len() == KEY_SIZE * 2 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Self::from_hex(value)
        } else {
            Self::from_base64(value)
        }
    }

    /// Override the recorded id (e.g. a KMS alias).
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::SealFailed(format!("Cipher init failed: {}", e)))
    }
}

/// Parsed container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u8,
    pub compressed: bool,
    pub encrypted: bool,
}

impl ContainerHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(MAGIC);
        bytes[4] = self.version;
        bytes[5] = self.flags();
        bytes
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        flags
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<ContainerHeader> {
    let mut header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::VerificationFailed(format!("Container header unreadable: {}", e)))?;

    if &header[..4] != MAGIC {
        return Err(Error::VerificationFailed("Not a sealed container (bad magic)".into()));
    }
    if header[4] != VERSION {
        return Err(Error::VerificationFailed(format!(
            "Unsupported container version {}",
            header[4]
        )));
    }
    let flags = header[5];
    if flags & !(FLAG_COMPRESSED | FLAG_ENCRYPTED) != 0 {
        return Err(Error::VerificationFailed(format!("Unknown container flags {:#04x}", flags)));
    }
    Ok(ContainerHeader {
        version: header[4],
        compressed: flags & FLAG_COMPRESSED != 0,
        encrypted: flags & FLAG_ENCRYPTED != 0,
    })
}

/// Read and validate only the header of a container.
pub fn inspect_header(path: &Path) -> Result<ContainerHeader> {
    read_header(&mut File::open(path)?)
}

/// Compresses and encrypts verified artifacts.
#[derive(Debug, Clone)]
pub struct Sealer {
    level: i32,
    key: Option<EncryptionKey>,
}

impl Sealer {
    pub fn new(level: i32, key: Option<EncryptionKey>) -> Self {
        Self { level, key }
    }

    pub fn key(&self) -> Option<&EncryptionKey> {
        self.key.as_ref()
    }

    /// Seal a verified raw artifact. The raw file is replaced by the
    /// container; the returned artifact is unverified until re-checked.
    pub fn seal(&self, artifact: &Artifact, compress: bool, encrypt: bool) -> Result<Artifact> {
        if !artifact.verified {
            return Err(Error::SealFailed(format!(
                "{} artifact of {} is not verified",
                artifact.class, artifact.snapshot_id
            )));
        }
        if artifact.is_sealed() {
            return Err(Error::SealFailed(format!(
                "{} artifact of {} is already sealed",
                artifact.class, artifact.snapshot_id
            )));
        }
        let key = match (encrypt, &self.key) {
            (true, Some(key)) => Some(key),
            (true, None) => {
                return Err(Error::SealFailed("Encryption requested but no key configured".into()))
            }
            (false, _) => None,
        };

        let mut sealed = artifact.clone();
        sealed.compressed = compress;
        sealed.encrypted = key.is_some();
        sealed.key_id = key.map(|k| k.key_id.clone());
        sealed.content_checksum = Some(artifact.checksum.clone());
        sealed.content_size_bytes = Some(artifact.size_bytes);

        let dir = artifact
            .local_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let dest = dir.join(format!("{}.{}", artifact.snapshot_id, sealed.extension()));
        let tmp = dir.join(format!(".{}.{}.tmp", artifact.snapshot_id, sealed.extension()));

        let header = ContainerHeader {
            version: VERSION,
            compressed: compress,
            encrypted: key.is_some(),
        };
        if let Err(e) = self.write_container(&artifact.local_path, &tmp, header, key) {
            let _ = fs::remove_file(&tmp);
            return Err(match e {
                Error::SealFailed(_) => e,
                other => Error::SealFailed(other.to_string()),
            });
        }
        fs::rename(&tmp, &dest).map_err(|e| Error::SealFailed(e.to_string()))?;
        if artifact.local_path != dest {
            fs::remove_file(&artifact.local_path)?;
        }

        let (checksum, size) = sha256_file(&dest)?;
        sealed.local_path = dest;
        sealed.checksum = checksum;
        sealed.size_bytes = size;
        sealed.verified = false;
        Ok(sealed)
    }

    fn write_container(
        &self,
        src: &Path,
        dest: &Path,
        header: ContainerHeader,
        key: Option<&EncryptionKey>,
    ) -> Result<()> {
        let mut out = BufWriter::new(File::create(dest)?);
        let header_bytes = header.to_bytes();
        out.write_all(&header_bytes)?;

        let mut input = BufReader::new(File::open(src)?);
        let out = match key {
            None => self.write_payload(&mut input, out, header.compressed)?,
            Some(key) => {
                let mut prefix = [0u8; NONCE_PREFIX_SIZE];
                OsRng.fill_bytes(&mut prefix);
                out.write_all(&prefix)?;

                let frames = FrameWriter::new(out, key.cipher()?, prefix, header_bytes);
                self.write_payload(&mut input, frames, header.compressed)?
                    .finish()?
            }
        };

        let file = out.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(())
    }

    /// Copy `input` into `out`, through zstd when compressing, and hand the
    /// writer back for finalization.
    fn write_payload<W: Write>(&self, input: &mut impl Read, mut out: W, compress: bool) -> Result<W> {
        if compress {
            let mut encoder = zstd::stream::Encoder::new(out, self.level)
                .map_err(|e| Error::SealFailed(format!("Zstd encoder creation failed: {}", e)))?;
            io::copy(input, &mut encoder)?;
            encoder
                .finish()
                .map_err(|e| Error::SealFailed(format!("Zstd finalization failed: {}", e)))
        } else {
            io::copy(input, &mut out)?;
            Ok(out)
        }
    }
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u32, last: bool) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..NONCE_SIZE - 1].copy_from_slice(&counter.to_be_bytes());
    nonce[NONCE_SIZE - 1] = u8::from(last);
    nonce
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Seals everything written to it into AEAD frames of [`FRAME_SIZE`]
/// plaintext bytes. [`FrameWriter::finish`] must be called to emit the final
/// frame.
struct FrameWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_SIZE],
    aad: [u8; HEADER_SIZE],
    counter: u32,
    buf: Vec<u8>,
}

impl<W: Write> FrameWriter<W> {
    fn new(inner: W, cipher: Aes256Gcm, prefix: [u8; NONCE_PREFIX_SIZE], aad: [u8; HEADER_SIZE]) -> Self {
        Self {
            inner,
            cipher,
            prefix,
            aad,
            counter: 0,
            buf: Vec::with_capacity(FRAME_SIZE),
        }
    }

    fn emit(&mut self, last: bool) -> io::Result<()> {
        let nonce = frame_nonce(&self.prefix, self.counter, last);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &self.buf,
                    aad: &self.aad,
                },
            )
            .map_err(|e| io::Error::other(format!("Encryption failed: {}", e)))?;

        self.inner.write_all(&[u8::from(last)])?;
        self.inner.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.buf.clear();
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("Container exceeds the frame counter"))?;
        Ok(())
    }

    /// Seal the remaining buffer as the final frame, possibly empty.
    fn finish(mut self) -> Result<W> {
        self.emit(true)
            .map_err(|e| Error::SealFailed(format!("Final frame failed: {}", e)))?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for FrameWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        // A full buffer is only sealed once more data proves it is not last
        if self.buf.len() == FRAME_SIZE {
            self.emit(false)?;
        }
        let n = data.len().min(FRAME_SIZE - self.buf.len());
        self.buf.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Opens the frames written by [`FrameWriter`], failing with `InvalidData`
/// on tampering, reordering, truncation or trailing bytes.
struct FrameReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_SIZE],
    aad: [u8; HEADER_SIZE],
    counter: u32,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> FrameReader<R> {
    fn new(inner: R, cipher: Aes256Gcm, prefix: [u8; NONCE_PREFIX_SIZE], aad: [u8; HEADER_SIZE]) -> Self {
        Self {
            inner,
            cipher,
            prefix,
            aad,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut head = [0u8; FRAME_HEADER_SIZE];
        self.inner
            .read_exact(&mut head)
            .map_err(|_| invalid_data("Encrypted container is truncated"))?;
        let last = match head[0] {
            0 => false,
            1 => true,
            other => return Err(invalid_data(format!("Bad frame flag {:#04x}", other))),
        };
        let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if !(TAG_SIZE..=FRAME_SIZE + TAG_SIZE).contains(&len) {
            return Err(invalid_data(format!("Bad frame length {}", len)));
        }

        let mut ciphertext = vec![0u8; len];
        self.inner
            .read_exact(&mut ciphertext)
            .map_err(|_| invalid_data("Encrypted container is truncated"))?;

        let nonce = frame_nonce(&self.prefix, self.counter, last);
        self.plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &self.aad,
                },
            )
            .map_err(|_| invalid_data("Decryption failed (wrong key or corrupted data)"))?;
        self.pos = 0;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| invalid_data("Container exceeds the frame counter"))?;

        if last {
            self.done = true;
            let mut extra = [0u8; 1];
            if self.inner.read(&mut extra)? != 0 {
                return Err(invalid_data("Trailing bytes after the final frame"));
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for FrameReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.next_frame()?;
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Open a container and return a reader over the raw capture it holds.
///
/// For encrypted containers the first frame is opened eagerly, so a wrong
/// key is reported here rather than on the first read.
pub fn open_container(path: &Path, key: Option<&EncryptionKey>) -> Result<Box<dyn Read + Send>> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(&mut reader)?;

    let payload: Box<dyn Read + Send> = if header.encrypted {
        let key = key.ok_or_else(|| {
            Error::VerificationFailed("Container is encrypted and no key is configured".into())
        })?;
        let mut prefix = [0u8; NONCE_PREFIX_SIZE];
        reader
            .read_exact(&mut prefix)
            .map_err(|e| Error::VerificationFailed(format!("Container nonce unreadable: {}", e)))?;
        let mut frames = FrameReader::new(reader, key.cipher()?, prefix, header.to_bytes());
        frames
            .next_frame()
            .map_err(|e| Error::VerificationFailed(e.to_string()))?;
        Box::new(frames)
    } else {
        Box::new(reader)
    };

    if header.compressed {
        let decoder = zstd::stream::read::Decoder::new(payload)
            .map_err(|e| Error::VerificationFailed(format!("Zstd decoder creation failed: {}", e)))?;
        Ok(Box::new(decoder))
    } else {
        Ok(payload)
    }
}

/// Reader that hashes everything passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Drain any unread input, then return `(hex sha256, byte count)`.
    pub fn finish(mut self) -> io::Result<(String, u64)> {
        io::copy(&mut self, &mut io::sink())?;
        Ok((hex::encode(self.hasher.finalize()), self.bytes))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Extract the raw capture of a sealed artifact into `dest`, checking it
/// against the pre-seal checksum.
pub fn unseal(artifact: &Artifact, dest: &Path, key: Option<&EncryptionKey>) -> Result<()> {
    let expected = artifact.content_checksum.as_deref().ok_or_else(|| {
        Error::RestoreFailed(format!(
            "{} artifact of {} is not sealed",
            artifact.class, artifact.snapshot_id
        ))
    })?;
    if let (Some(recorded), Some(key)) = (&artifact.key_id, key) {
        if recorded != key.key_id() {
            return Err(Error::RestoreFailed(format!(
                "{} artifact was encrypted with key {}, configured key is {}",
                artifact.class,
                recorded,
                key.key_id()
            )));
        }
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut reader = HashingReader::new(open_container(&artifact.local_path, key)?);
    let mut out = BufWriter::new(File::create(dest)?);
    let copied = io::copy(&mut reader, &mut out);
    let flushed = copied.and_then(|_| out.flush());
    if let Err(e) = flushed {
        let _ = fs::remove_file(dest);
        return Err(if e.kind() == io::ErrorKind::InvalidData {
            Error::VerificationFailed(format!("Container rejected: {}", e))
        } else {
            Error::RestoreFailed(format!("Cannot extract container: {}", e))
        });
    }
    let (checksum, size) = reader.finish()?;

    if checksum != expected {
        let _ = fs::remove_file(dest);
        return Err(Error::VerificationFailed(format!(
            "{} content checksum mismatch after unseal: expected {}, got {} ({} bytes)",
            artifact.class, expected, checksum, size
        )));
    }
    Ok(())
}
