//! Chunked XChaCha20-Poly1305 stream encryption
//!
//! Stream format (binary):
//! ```text
//! header (41 bytes):
//!   [4: magic "PXVS"][1: version][4: chunk size, BE][16: stream nonce][16: key check]
//! frame (repeated, in sequence order):
//!   [8: sequence, BE][1: final flag][4: body length, BE][24: nonce][body: ciphertext || 16-byte tag]
//!
//! nonce = stream nonce || sequence (BE)
//! AAD   = header || sequence (BE) || final flag
//! ```
//!
//! Every non-final frame carries exactly one full chunk. The final frame
//! carries the remainder (empty for empty input) and sets the flag, so a
//! stream that ends on a non-final frame is detectably truncated.
//!
//! Chunk size is fixed per format version. A new size means a new version.

use std::io::{self, BufRead, BufReader, Read, Write};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CipherError;
use crate::keys::{hkdf_derive, MediaKey};
use crate::{NONCE_SIZE, TAG_SIZE};

pub const MAGIC: [u8; 4] = *b"PXVS";
pub const STREAM_NONCE_SIZE: usize = 16;
pub const KEY_CHECK_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 4 + 1 + 4 + STREAM_NONCE_SIZE + KEY_CHECK_SIZE;
pub const FRAME_HEADER_SIZE: usize = 8 + 1 + 4 + NONCE_SIZE;

const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;

const KEY_CHECK_INFO: &[u8] = b"pxv key check v1";
const STREAM_KEY_INFO: &[u8] = b"pxv stream v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatVersion {
    /// 1 KiB chunks
    V1,
    /// 64 KiB chunks
    #[default]
    V2,
}

impl FormatVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            FormatVersion::V1 => 1,
            FormatVersion::V2 => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FormatVersion::V1),
            2 => Some(FormatVersion::V2),
            _ => None,
        }
    }

    pub fn chunk_size(self) -> usize {
        match self {
            FormatVersion::V1 => 1024,
            FormatVersion::V2 => 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub chunks: u64,
    pub plaintext_bytes: u64,
}

/// Total encoded size of a stream carrying `plaintext_len` bytes.
pub fn ciphertext_len(plaintext_len: u64, version: FormatVersion) -> u64 {
    let cs = version.chunk_size() as u64;
    let frames = plaintext_len.div_ceil(cs).max(1);
    HEADER_SIZE as u64 + frames * (FRAME_HEADER_SIZE + TAG_SIZE) as u64 + plaintext_len
}

/// Plaintext carried by a well-formed stream of `stream_len` bytes.
///
/// `None` when no stream of that length can exist.
pub fn plaintext_len(stream_len: u64, version: FormatVersion) -> Option<u64> {
    let overhead = (FRAME_HEADER_SIZE + TAG_SIZE) as u64;
    let body = stream_len.checked_sub(HEADER_SIZE as u64)?;
    let frames = body
        .div_ceil(version.chunk_size() as u64 + overhead)
        .max(1);
    body.checked_sub(frames * overhead)
}

fn key_check(key: &MediaKey) -> Result<[u8; KEY_CHECK_SIZE], CipherError> {
    let mut okm = hkdf_derive(key.as_bytes(), None, KEY_CHECK_INFO)?;
    let mut check = [0u8; KEY_CHECK_SIZE];
    check.copy_from_slice(&okm[..KEY_CHECK_SIZE]);
    okm.zeroize();
    Ok(check)
}

fn stream_cipher(
    key: &MediaKey,
    stream_nonce: &[u8; STREAM_NONCE_SIZE],
) -> Result<XChaCha20Poly1305, CipherError> {
    let mut subkey = hkdf_derive(
        key.as_bytes(),
        Some(stream_nonce.as_slice()),
        STREAM_KEY_INFO,
    )?;
    let cipher = XChaCha20Poly1305::new((&subkey).into());
    subkey.zeroize();
    Ok(cipher)
}

fn chunk_nonce(stream_nonce: &[u8; STREAM_NONCE_SIZE], seq: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..STREAM_NONCE_SIZE].copy_from_slice(stream_nonce);
    nonce[STREAM_NONCE_SIZE..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

fn build_aad(header: &[u8; HEADER_SIZE], seq: u64, flag: u8) -> [u8; HEADER_SIZE + 9] {
    let mut aad = [0u8; HEADER_SIZE + 9];
    aad[..HEADER_SIZE].copy_from_slice(header);
    aad[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&seq.to_be_bytes());
    aad[HEADER_SIZE + 8] = flag;
    aad
}

fn encode_header(
    version: FormatVersion,
    stream_nonce: &[u8; STREAM_NONCE_SIZE],
    check: &[u8; KEY_CHECK_SIZE],
) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = version.as_u8();
    header[5..9].copy_from_slice(&(version.chunk_size() as u32).to_be_bytes());
    header[9..9 + STREAM_NONCE_SIZE].copy_from_slice(stream_nonce);
    header[9 + STREAM_NONCE_SIZE..].copy_from_slice(check);
    header
}

/// Seals a cleartext stream chunk by chunk.
pub struct StreamEncryptor {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_SIZE],
    stream_nonce: [u8; STREAM_NONCE_SIZE],
    chunk_size: usize,
    next_seq: u64,
    finished: bool,
}

impl StreamEncryptor {
    /// Start a new stream with a fresh random stream nonce.
    pub fn new(key: &MediaKey, version: FormatVersion) -> Result<Self, CipherError> {
        let mut stream_nonce = [0u8; STREAM_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut stream_nonce);

        let check = key_check(key)?;
        Ok(Self {
            cipher: stream_cipher(key, &stream_nonce)?,
            header: encode_header(version, &stream_nonce, &check),
            stream_nonce,
            chunk_size: version.chunk_size(),
            next_seq: 0,
            finished: false,
        })
    }

    /// Header bytes; must precede the first frame.
    pub fn header(&self) -> &[u8; HEADER_SIZE] {
        &self.header
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Seal the next chunk into a complete frame.
    ///
    /// Non-final chunks must be exactly `chunk_size` long; the final chunk
    /// may be shorter (or empty). Nothing may follow the final chunk.
    pub fn seal_chunk(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>, CipherError> {
        if self.finished {
            return Err(CipherError::InvalidChunk(
                "stream already sealed its final chunk".into(),
            ));
        }
        if plaintext.len() > self.chunk_size {
            return Err(CipherError::InvalidChunk(format!(
                "chunk of {} bytes exceeds chunk size {}",
                plaintext.len(),
                self.chunk_size
            )));
        }
        if !is_final && plaintext.len() != self.chunk_size {
            return Err(CipherError::InvalidChunk(format!(
                "non-final chunk must be {} bytes, got {}",
                self.chunk_size,
                plaintext.len()
            )));
        }

        let seq = self.next_seq;
        let flag = if is_final { FLAG_FINAL } else { FLAG_MORE };
        let nonce = chunk_nonce(&self.stream_nonce, seq);
        let aad = build_aad(&self.header, seq, flag);

        let body = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CipherError::InvalidChunk(format!("chunk encryption failed: {e}")))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.push(flag);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&body);

        self.next_seq += 1;
        self.finished = is_final;
        Ok(frame)
    }
}

/// Parsed fixed-size prefix of a frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub seq: u64,
    pub flag: u8,
    pub body_len: u32,
    pub nonce: [u8; NONCE_SIZE],
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[9..13]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[13..]);
        Self {
            seq: u64::from_be_bytes(seq),
            flag: bytes[8],
            body_len: u32::from_be_bytes(len),
            nonce,
        }
    }
}

/// Verifies and opens a sealed stream chunk by chunk.
pub struct StreamDecryptor {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_SIZE],
    stream_nonce: [u8; STREAM_NONCE_SIZE],
    chunk_size: usize,
    next_seq: u64,
    finished: bool,
}

impl std::fmt::Debug for StreamDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecryptor")
            .field("chunk_size", &self.chunk_size)
            .field("next_seq", &self.next_seq)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl StreamDecryptor {
    /// Validate a stream header and check it was sealed under `key`.
    pub fn new(key: &MediaKey, header: &[u8]) -> Result<Self, CipherError> {
        let header: [u8; HEADER_SIZE] = header.try_into().map_err(|_| {
            CipherError::CorruptStream(format!(
                "header must be {HEADER_SIZE} bytes, got {}",
                header.len()
            ))
        })?;

        if header[..4] != MAGIC {
            return Err(CipherError::CorruptStream("not a pixvault stream".into()));
        }
        let version = FormatVersion::from_u8(header[4]).ok_or_else(|| {
            CipherError::CorruptStream(format!("unsupported format version {}", header[4]))
        })?;
        let mut cs = [0u8; 4];
        cs.copy_from_slice(&header[5..9]);
        let chunk_size = u32::from_be_bytes(cs) as usize;
        if chunk_size != version.chunk_size() {
            return Err(CipherError::CorruptStream(format!(
                "chunk size {chunk_size} does not match format version {}",
                version.as_u8()
            )));
        }

        let mut stream_nonce = [0u8; STREAM_NONCE_SIZE];
        stream_nonce.copy_from_slice(&header[9..9 + STREAM_NONCE_SIZE]);
        if header[9 + STREAM_NONCE_SIZE..] != key_check(key)? {
            return Err(CipherError::KeyMismatch);
        }

        Ok(Self {
            cipher: stream_cipher(key, &stream_nonce)?,
            header,
            stream_nonce,
            chunk_size,
            next_seq: 0,
            finished: false,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Reject frame lengths that no valid stream of this version produces.
    ///
    /// Call before reading the body so a hostile length never drives allocation.
    pub fn check_frame_len(&self, frame: &FrameHeader) -> Result<(), CipherError> {
        let len = frame.body_len as usize;
        if len < TAG_SIZE || len > self.chunk_size + TAG_SIZE {
            return Err(CipherError::CorruptStream(format!(
                "chunk {} has impossible length {len}",
                frame.seq
            )));
        }
        Ok(())
    }

    /// Verify and open one frame.
    ///
    /// `at_end` tells whether the input ends immediately after this frame.
    pub fn open_frame(
        &mut self,
        frame: &FrameHeader,
        body: &[u8],
        at_end: bool,
    ) -> Result<Vec<u8>, CipherError> {
        if self.finished {
            return Err(CipherError::CorruptStream(
                "data follows the final chunk".into(),
            ));
        }
        if frame.seq != self.next_seq {
            return Err(CipherError::CorruptStream(format!(
                "chunk {} out of order (expected {})",
                frame.seq, self.next_seq
            )));
        }
        if frame.flag != FLAG_MORE && frame.flag != FLAG_FINAL {
            return Err(CipherError::CorruptStream(format!(
                "chunk {} has invalid flag {:#04x}",
                frame.seq, frame.flag
            )));
        }
        if frame.flag == FLAG_MORE && at_end {
            return Err(CipherError::TruncatedStream);
        }
        if frame.flag == FLAG_FINAL && !at_end {
            return Err(CipherError::CorruptStream(format!(
                "final marker on non-final chunk {}",
                frame.seq
            )));
        }
        if body.len() != frame.body_len as usize {
            return Err(CipherError::CorruptStream(format!(
                "chunk {} body is {} bytes, header says {}",
                frame.seq,
                body.len(),
                frame.body_len
            )));
        }
        if frame.flag == FLAG_MORE && body.len() != self.chunk_size + TAG_SIZE {
            return Err(CipherError::CorruptStream(format!(
                "non-final chunk {} is not a full chunk",
                frame.seq
            )));
        }
        let nonce = chunk_nonce(&self.stream_nonce, frame.seq);
        if frame.nonce != nonce {
            return Err(CipherError::CorruptStream(format!(
                "chunk {} nonce does not match its sequence number",
                frame.seq
            )));
        }

        let aad = build_aad(&self.header, frame.seq, frame.flag);
        let plaintext = self
            .cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: body,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                CipherError::CorruptStream(format!("authentication failed for chunk {}", frame.seq))
            })?;

        self.next_seq += 1;
        self.finished = frame.flag == FLAG_FINAL;
        Ok(plaintext)
    }
}

/// Fill `buf` from `input`, stopping early only at end of input.
fn fill_chunk<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt `input` into `output`, holding at most two chunks in memory.
///
/// `progress` receives the running count of cleartext bytes consumed.
pub fn encrypt_stream<R: Read, W: Write>(
    mut input: R,
    mut output: W,
    key: &MediaKey,
    version: FormatVersion,
    progress: Option<&dyn Fn(u64)>,
) -> Result<StreamStats, CipherError> {
    let mut enc = StreamEncryptor::new(key, version)?;
    output.write_all(enc.header())?;

    let mut current = vec![0u8; enc.chunk_size()];
    let mut next = vec![0u8; enc.chunk_size()];
    let result = seal_frames(&mut input, &mut output, &mut enc, &mut current, &mut next, progress);
    current.zeroize();
    next.zeroize();
    let stats = result?;

    output.flush()?;
    tracing::trace!(
        chunks = stats.chunks,
        bytes = stats.plaintext_bytes,
        "stream sealed"
    );
    Ok(stats)
}

fn seal_frames<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    enc: &mut StreamEncryptor,
    current: &mut Vec<u8>,
    next: &mut Vec<u8>,
    progress: Option<&dyn Fn(u64)>,
) -> Result<StreamStats, CipherError> {
    let cs = enc.chunk_size();
    let mut stats = StreamStats::default();
    let mut cur_len = fill_chunk(input, current)?;

    loop {
        // Look one chunk ahead: a full chunk is final only if nothing follows it.
        let next_len = if cur_len == cs {
            fill_chunk(input, next)?
        } else {
            0
        };
        let is_final = next_len == 0;

        let frame = enc.seal_chunk(&current[..cur_len], is_final)?;
        output.write_all(&frame)?;

        stats.chunks += 1;
        stats.plaintext_bytes += cur_len as u64;
        if let Some(report) = progress {
            report(stats.plaintext_bytes);
        }

        if is_final {
            return Ok(stats);
        }
        std::mem::swap(current, next);
        cur_len = next_len;
    }
}

/// Read a frame header; `Ok(false)` means input ended cleanly before it.
fn read_frame_header<R: BufRead>(
    input: &mut R,
    buf: &mut [u8; FRAME_HEADER_SIZE],
) -> Result<bool, CipherError> {
    let n = fill_chunk(input, buf)?;
    match n {
        0 => Ok(false),
        FRAME_HEADER_SIZE => Ok(true),
        _ => Err(CipherError::TruncatedStream),
    }
}

/// Decrypt `input` into `output`, verifying every chunk before writing it.
///
/// Cleartext reaches `output` one verified chunk at a time. If this returns
/// an error, whatever was written must be discarded; callers that expose
/// output to users write to a temporary location and publish only on `Ok`.
pub fn decrypt_stream<R: Read, W: Write>(
    input: R,
    mut output: W,
    key: &MediaKey,
    progress: Option<&dyn Fn(u64)>,
) -> Result<StreamStats, CipherError> {
    let mut reader = BufReader::new(input);

    let mut header = [0u8; HEADER_SIZE];
    if fill_chunk(&mut reader, &mut header)? != HEADER_SIZE {
        return Err(CipherError::CorruptStream("stream header is incomplete".into()));
    }
    let mut dec = StreamDecryptor::new(key, &header)?;

    let mut stats = StreamStats::default();
    let mut frame_buf = [0u8; FRAME_HEADER_SIZE];
    let mut body = Vec::with_capacity(dec.chunk_size() + TAG_SIZE);

    loop {
        if !read_frame_header(&mut reader, &mut frame_buf)? {
            return Err(CipherError::TruncatedStream);
        }
        let frame = FrameHeader::parse(&frame_buf);
        dec.check_frame_len(&frame)?;

        body.resize(frame.body_len as usize, 0);
        if fill_chunk(&mut reader, &mut body)? != body.len() {
            return Err(CipherError::TruncatedStream);
        }
        let at_end = reader.fill_buf()?.is_empty();

        let mut plaintext = dec.open_frame(&frame, &body, at_end)?;
        output.write_all(&plaintext)?;
        stats.chunks += 1;
        stats.plaintext_bytes += plaintext.len() as u64;
        plaintext.zeroize();

        if let Some(report) = progress {
            report(stats.plaintext_bytes);
        }
        if dec.is_finished() {
            output.flush()?;
            return Ok(stats);
        }
    }
}

/// Encrypt an in-memory buffer.
pub fn encrypt_to_vec(
    plaintext: &[u8],
    key: &MediaKey,
    version: FormatVersion,
) -> Result<Vec<u8>, CipherError> {
    let mut out = Vec::with_capacity(ciphertext_len(plaintext.len() as u64, version) as usize);
    encrypt_stream(plaintext, &mut out, key, version, None)?;
    Ok(out)
}

/// Decrypt an in-memory buffer. Returns no cleartext at all on failure.
pub fn decrypt_to_vec(ciphertext: &[u8], key: &MediaKey) -> Result<Vec<u8>, CipherError> {
    let mut out = Vec::with_capacity(ciphertext.len());
    match decrypt_stream(ciphertext, &mut out, key, None) {
        Ok(_) => Ok(out),
        Err(e) => {
            out.zeroize();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MediaKey {
        MediaKey::new("test", [0x11; 32])
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Byte offset of frame `n` in a stream whose frames are all full except the last.
    fn frame_offset(version: FormatVersion, n: usize) -> usize {
        HEADER_SIZE + n * (FRAME_HEADER_SIZE + version.chunk_size() + TAG_SIZE)
    }

    #[test]
    fn test_empty_input_is_one_final_frame() {
        let sealed = encrypt_to_vec(b"", &key(), FormatVersion::V1).unwrap();
        assert_eq!(sealed.len(), HEADER_SIZE + FRAME_HEADER_SIZE + TAG_SIZE);
        assert_eq!(sealed[HEADER_SIZE + 8], FLAG_FINAL);
        assert_eq!(decrypt_to_vec(&sealed, &key()).unwrap(), b"");
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_frame() {
        let v = FormatVersion::V1;
        let plain = data(v.chunk_size() * 2);
        let sealed = encrypt_to_vec(&plain, &key(), v).unwrap();
        assert_eq!(sealed.len() as u64, ciphertext_len(plain.len() as u64, v));
        assert_eq!(sealed.len(), frame_offset(v, 2));
        assert_eq!(decrypt_to_vec(&sealed, &key()).unwrap(), plain);
    }

    #[test]
    fn test_ciphertext_len_matches_output() {
        for len in [0usize, 1, 1023, 1024, 1025, 5000] {
            let sealed = encrypt_to_vec(&data(len), &key(), FormatVersion::V1).unwrap();
            assert_eq!(sealed.len() as u64, ciphertext_len(len as u64, FormatVersion::V1));
        }
    }

    #[test]
    fn test_plaintext_len_inverts_ciphertext_len() {
        for v in [FormatVersion::V1, FormatVersion::V2] {
            let cs = v.chunk_size() as u64;
            for len in [0, 1, cs - 1, cs, cs + 1, 3 * cs, 3 * cs + 17] {
                assert_eq!(plaintext_len(ciphertext_len(len, v), v), Some(len));
            }
        }
        assert_eq!(plaintext_len(HEADER_SIZE as u64 - 1, FormatVersion::V1), None);
        assert_eq!(plaintext_len(HEADER_SIZE as u64 + 3, FormatVersion::V1), None);
    }

    #[test]
    fn test_header_layout() {
        let sealed = encrypt_to_vec(b"abc", &key(), FormatVersion::V2).unwrap();
        assert_eq!(&sealed[..4], b"PXVS");
        assert_eq!(sealed[4], 2);
        assert_eq!(&sealed[5..9], &(64u32 * 1024).to_be_bytes());
    }

    #[test]
    fn test_stream_nonce_is_fresh_per_stream() {
        let a = encrypt_to_vec(b"same", &key(), FormatVersion::V2).unwrap();
        let b = encrypt_to_vec(b"same", &key(), FormatVersion::V2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_is_key_mismatch() {
        let sealed = encrypt_to_vec(&data(3000), &key(), FormatVersion::V1).unwrap();
        let other = MediaKey::new("other", [0x22; 32]);
        assert!(matches!(
            decrypt_to_vec(&sealed, &other),
            Err(CipherError::KeyMismatch)
        ));
    }

    #[test]
    fn test_first_chunk_tamper_is_corrupt_not_key_mismatch() {
        let v = FormatVersion::V1;
        let mut sealed = encrypt_to_vec(&data(3000), &key(), v).unwrap();
        sealed[frame_offset(v, 0) + FRAME_HEADER_SIZE + 3] ^= 0x01;
        assert!(matches!(
            decrypt_to_vec(&sealed, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let mut sealed = encrypt_to_vec(b"x", &key(), FormatVersion::V1).unwrap();
        sealed[0] = b'Q';
        assert!(matches!(
            decrypt_to_vec(&sealed, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let mut sealed = encrypt_to_vec(b"x", &key(), FormatVersion::V1).unwrap();
        sealed[4] = 9;
        assert!(matches!(
            decrypt_to_vec(&sealed, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_chunk_size_mismatch_is_corrupt() {
        let mut sealed = encrypt_to_vec(b"x", &key(), FormatVersion::V1).unwrap();
        sealed[5..9].copy_from_slice(&2048u32.to_be_bytes());
        assert!(matches!(
            decrypt_to_vec(&sealed, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_short_header_is_corrupt() {
        let sealed = encrypt_to_vec(b"x", &key(), FormatVersion::V1).unwrap();
        assert!(matches!(
            decrypt_to_vec(&sealed[..10], &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_dropping_final_frame_is_truncated() {
        let v = FormatVersion::V1;
        let sealed = encrypt_to_vec(&data(2500), &key(), v).unwrap();
        let cut = &sealed[..frame_offset(v, 2)];
        assert!(matches!(
            decrypt_to_vec(cut, &key()),
            Err(CipherError::TruncatedStream)
        ));
    }

    #[test]
    fn test_clearing_final_marker_is_truncated() {
        let v = FormatVersion::V1;
        let mut sealed = encrypt_to_vec(&data(2500), &key(), v).unwrap();
        sealed[frame_offset(v, 2) + 8] = FLAG_MORE;
        assert!(matches!(
            decrypt_to_vec(&sealed, &key()),
            Err(CipherError::TruncatedStream)
        ));
    }

    #[test]
    fn test_cut_mid_frame_is_truncated() {
        let v = FormatVersion::V1;
        let sealed = encrypt_to_vec(&data(2500), &key(), v).unwrap();
        let cut = &sealed[..frame_offset(v, 1) + 20];
        assert!(matches!(
            decrypt_to_vec(cut, &key()),
            Err(CipherError::TruncatedStream)
        ));
    }

    #[test]
    fn test_final_marker_on_inner_chunk_is_corrupt() {
        let v = FormatVersion::V1;
        let mut sealed = encrypt_to_vec(&data(2500), &key(), v).unwrap();
        sealed[frame_offset(v, 0) + 8] = FLAG_FINAL;
        assert!(matches!(
            decrypt_to_vec(&sealed, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_swapped_frames_are_rejected() {
        let v = FormatVersion::V1;
        let sealed = encrypt_to_vec(&data(3000), &key(), v).unwrap();
        let f0 = frame_offset(v, 0);
        let f1 = frame_offset(v, 1);
        let f2 = frame_offset(v, 2);

        let mut swapped = sealed[..f0].to_vec();
        swapped.extend_from_slice(&sealed[f1..f2]);
        swapped.extend_from_slice(&sealed[f0..f1]);
        swapped.extend_from_slice(&sealed[f2..]);

        assert!(matches!(
            decrypt_to_vec(&swapped, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_duplicated_frame_is_rejected() {
        let v = FormatVersion::V1;
        let sealed = encrypt_to_vec(&data(3000), &key(), v).unwrap();
        let f1 = frame_offset(v, 1);
        let f2 = frame_offset(v, 2);

        let mut replayed = sealed[..f2].to_vec();
        replayed.extend_from_slice(&sealed[f1..f2]);
        replayed.extend_from_slice(&sealed[f2..]);

        assert!(matches!(
            decrypt_to_vec(&replayed, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_trailing_garbage_is_rejected() {
        let mut sealed = encrypt_to_vec(b"hello", &key(), FormatVersion::V1).unwrap();
        sealed.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decrypt_to_vec(&sealed, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_oversized_length_is_rejected_before_reading_body() {
        let v = FormatVersion::V1;
        let mut sealed = encrypt_to_vec(&data(100), &key(), v).unwrap();
        let len_at = frame_offset(v, 0) + 9;
        sealed[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decrypt_to_vec(&sealed, &key()),
            Err(CipherError::CorruptStream(_))
        ));
    }

    #[test]
    fn test_encryptor_rejects_short_inner_chunk() {
        let mut enc = StreamEncryptor::new(&key(), FormatVersion::V1).unwrap();
        assert!(enc.seal_chunk(&[0u8; 10], false).is_err());
        assert!(enc.seal_chunk(&[0u8; 10], true).is_ok());
        assert!(enc.seal_chunk(&[], true).is_err(), "nothing may follow the final chunk");
    }

    #[test]
    fn test_incremental_api_matches_stream_format() {
        let mut enc = StreamEncryptor::new(&key(), FormatVersion::V1).unwrap();
        let mut sealed = enc.header().to_vec();
        sealed.extend(enc.seal_chunk(&[7u8; 1024], false).unwrap());
        sealed.extend(enc.seal_chunk(&[8u8; 5], true).unwrap());

        let plain = decrypt_to_vec(&sealed, &key()).unwrap();
        assert_eq!(plain.len(), 1029);
        assert_eq!(&plain[1024..], &[8u8; 5]);
    }

    #[test]
    fn test_progress_reports_cumulative_bytes() {
        let plain = data(2500);
        let seen = std::cell::RefCell::new(Vec::new());
        let report = |n: u64| seen.borrow_mut().push(n);
        let mut sealed = Vec::new();
        encrypt_stream(
            &plain[..],
            &mut sealed,
            &key(),
            FormatVersion::V1,
            Some(&report as &dyn Fn(u64)),
        )
        .unwrap();
        assert_eq!(*seen.borrow(), vec![1024, 2048, 2500]);
    }
}
