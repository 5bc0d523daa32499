//! Framed authenticated stream cipher for blobs: chunked read/write with
//! random-access seek, plus the client-facing header format compatible
//! with the mobile client (spec.md §4.2).

use crate::error::{VaultError, VaultResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::io::{Read, Seek, SeekFrom, Write};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const COUNTER_LEN: usize = 8;
/// Bytes of framing overhead added to every chunk beyond its plaintext.
pub const CHUNK_OVERHEAD: usize = COUNTER_LEN + NONCE_LEN + TAG_LEN;
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

fn aad_for(context: &[u8], counter: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(context.len() + COUNTER_LEN);
    aad.extend_from_slice(context);
    aad.extend_from_slice(&counter.to_be_bytes());
    aad
}

/// Reads from `r`, filling up to `max_len` bytes or stopping at EOF.
/// Unlike `read_exact`, a short read here is valid (it signals the final
/// chunk); only a read of zero bytes on the very first call means "no
/// more chunks".
fn fill_upto<R: Read>(r: &mut R, max_len: usize) -> VaultResult<Vec<u8>> {
    let mut buf = vec![0u8; max_len];
    let mut filled = 0;
    while filled < max_len {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

pub struct StreamWriter<W> {
    inner: W,
    aead_key: [u8; 32],
    context: Vec<u8>,
    chunk_size: usize,
    counter: u64,
    buf: Vec<u8>,
    wrote_any: bool,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(inner: W, aead_key: [u8; 32], context: Vec<u8>, chunk_size: usize) -> Self {
        StreamWriter {
            inner,
            aead_key,
            context,
            chunk_size,
            counter: 0,
            buf: Vec::with_capacity(chunk_size),
            wrote_any: false,
        }
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> VaultResult<()> {
        while !data.is_empty() {
            let space = self.chunk_size - self.buf.len();
            let take = space.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.chunk_size {
                self.flush_chunk(false)?;
            }
        }
        Ok(())
    }

    fn flush_chunk(&mut self, last: bool) -> VaultResult<()> {
        if self.buf.is_empty() && !(last && !self.wrote_any) {
            return Ok(());
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.aead_key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = aad_for(&self.context, self.counter);
        let ct = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &self.buf,
                    aad: &aad,
                },
            )
            .map_err(|_| VaultError::EncryptFailed("stream chunk encrypt failed".into()))?;

        self.inner.write_all(&self.counter.to_be_bytes())?;
        self.inner.write_all(&nonce_bytes)?;
        self.inner.write_all(&ct)?;

        self.counter += 1;
        self.wrote_any = true;
        self.buf.clear();
        Ok(())
    }

    /// Flushes the final (possibly short) chunk and zeroes the plaintext
    /// buffer, returning the wrapped writer.
    pub fn finish(mut self) -> VaultResult<W> {
        self.flush_chunk(true)?;
        use zeroize::Zeroize;
        self.buf.zeroize();
        Ok(self.inner)
    }
}

pub struct StreamReader<R> {
    inner: R,
    aead_key: [u8; 32],
    context: Vec<u8>,
    chunk_size: usize,
    counter: u64,
    buf: Vec<u8>,
    buf_pos: usize,
    finished: bool,
    started: bool,
}

impl<R: Read> StreamReader<R> {
    pub fn new(inner: R, aead_key: [u8; 32], context: Vec<u8>, chunk_size: usize) -> Self {
        StreamReader {
            inner,
            aead_key,
            context,
            chunk_size,
            counter: 0,
            buf: Vec::new(),
            buf_pos: 0,
            finished: false,
            started: false,
        }
    }

    fn pull_chunk(&mut self) -> VaultResult<bool> {
        if self.finished {
            return Ok(false);
        }
        let header = fill_upto(&mut self.inner, COUNTER_LEN + NONCE_LEN)?;
        if header.is_empty() && !self.started {
            // A genuinely empty stream: zero chunks total.
            self.finished = true;
            return Ok(false);
        }
        if header.len() != COUNTER_LEN + NONCE_LEN {
            return Err(VaultError::DecryptFailed);
        }
        self.started = true;
        let counter = u64::from_be_bytes(header[0..COUNTER_LEN].try_into().unwrap());
        if counter != self.counter {
            return Err(VaultError::DecryptFailed);
        }
        let nonce_bytes = &header[COUNTER_LEN..];

        let max_ct_len = self.chunk_size + TAG_LEN;
        let ct_and_tag = fill_upto(&mut self.inner, max_ct_len)?;
        if ct_and_tag.len() < TAG_LEN {
            return Err(VaultError::DecryptFailed);
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.aead_key));
        let nonce = Nonce::from_slice(nonce_bytes);
        let aad = aad_for(&self.context, counter);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ct_and_tag,
                    aad: &aad,
                },
            )
            .map_err(|_| VaultError::DecryptFailed)?;

        let is_short = ct_and_tag.len() < max_ct_len;
        self.buf = plaintext;
        self.buf_pos = 0;
        self.counter += 1;
        if is_short {
            self.finished = true;
        }
        Ok(true)
    }

    /// Drops `n` bytes from the front of the decrypted stream; used after
    /// a chunk-aligned seek to reach the exact requested offset.
    pub fn skip(&mut self, n: usize) {
        self.buf_pos = (self.buf_pos + n).min(self.buf.len());
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.buf_pos >= self.buf.len() {
            match self.pull_chunk() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            }
        }
        let avail = &self.buf[self.buf_pos..];
        let n = avail.len().min(out.len());
        out[..n].copy_from_slice(&avail[..n]);
        self.buf_pos += n;
        Ok(n)
    }
}

impl<R: Read + Seek> StreamReader<R> {
    /// Seeks the underlying (ciphertext) stream so that the next `read`
    /// returns plaintext starting at decrypted offset `off`.
    pub fn seek_to(&mut self, data_start: u64, off: u64) -> VaultResult<()> {
        let chunk_index = off / self.chunk_size as u64;
        let chunk_off = (off % self.chunk_size as u64) as usize;
        let stride = (self.chunk_size + CHUNK_OVERHEAD) as u64;
        self.inner
            .seek(SeekFrom::Start(data_start + chunk_index * stride))?;
        self.counter = chunk_index;
        self.finished = false;
        self.started = false;
        self.buf.clear();
        self.buf_pos = 0;
        if self.pull_chunk()? {
            self.skip(chunk_off);
        }
        Ok(())
    }

    /// Computes the total decrypted size from the ciphertext's length on
    /// disk, per spec.md §4.2's SeekEnd formula, without decrypting.
    pub fn decrypted_len(&mut self, data_start: u64) -> VaultResult<u64> {
        let total = self.inner.seek(SeekFrom::End(0))?;
        let data_len = total.saturating_sub(data_start);
        let stride = (self.chunk_size + CHUNK_OVERHEAD) as u64;
        let n_chunks = data_len / stride;
        let remainder = data_len % stride;
        let last_bytes = remainder.saturating_sub(CHUNK_OVERHEAD as u64);
        Ok(n_chunks * self.chunk_size as u64 + last_bytes)
    }
}

/// Per-blob parameter block sealed to the album public key: the
/// client-facing Header carrying the symmetric stream key and framing
/// parameters for the mobile client's own wire format.
pub mod header {
    use super::*;

    /// Bit in `version` marking that this header's on-disk encoding
    /// carries a random-length padding block ahead of `trailing` (spec.md
    /// §9). Master-key rotation always forces this bit on when it
    /// re-encodes a header it can read; a reader must skip whatever
    /// padding it finds rather than treat it as `trailing`.
    pub const PADDING_FLAG: u8 = 0x40;

    pub struct Header {
        pub file_id: [u8; 32],
        pub version: u8,
        pub chunk_size: u32,
        pub data_size: u64,
        pub symmetric_key: [u8; 32],
        pub file_type: u8,
        pub filename: String,
        pub video_duration: u32,
        /// Present only when `version & PADDING_FLAG != 0`; size-obscuring
        /// filler with no semantic content.
        pub padding: Vec<u8>,
        /// Fields from a future protocol version this build doesn't
        /// understand, preserved verbatim so re-encoding round-trips.
        pub trailing: Vec<u8>,
    }

    fn write_lp(out: &mut Vec<u8>, bytes: &[u8]) {
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }

    fn read_lp(data: &[u8], pos: &mut usize) -> VaultResult<Vec<u8>> {
        if data.len() < *pos + 4 {
            return Err(VaultError::DecryptFailed);
        }
        let len = u32::from_be_bytes(data[*pos..*pos + 4].try_into().unwrap()) as usize;
        *pos += 4;
        if data.len() < *pos + len {
            return Err(VaultError::DecryptFailed);
        }
        let bytes = data[*pos..*pos + len].to_vec();
        *pos += len;
        Ok(bytes)
    }

    impl Header {
        pub fn is_padded(&self) -> bool {
            self.version & PADDING_FLAG != 0
        }

        /// Sets the padding flag and attaches `padding` as the filler
        /// block encoded ahead of `trailing`. Used by master-key rotation
        /// (spec.md §4.7 step 4), which always writes headers back with
        /// padding on regardless of whether it found the bit set.
        pub fn force_padding_on(&mut self, padding: Vec<u8>) {
            self.version |= PADDING_FLAG;
            self.padding = padding;
        }

        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::new();
            write_lp(&mut out, &self.file_id);
            write_lp(&mut out, &[self.version]);
            write_lp(&mut out, &self.chunk_size.to_be_bytes());
            write_lp(&mut out, &self.data_size.to_be_bytes());
            write_lp(&mut out, &self.symmetric_key);
            write_lp(&mut out, &[self.file_type]);
            write_lp(&mut out, self.filename.as_bytes());
            write_lp(&mut out, &self.video_duration.to_be_bytes());
            if self.is_padded() {
                write_lp(&mut out, &self.padding);
            }
            out.extend_from_slice(&self.trailing);
            out
        }

        pub fn decode(data: &[u8]) -> VaultResult<Self> {
            let mut pos = 0usize;
            let file_id_v = read_lp(data, &mut pos)?;
            let version_v = read_lp(data, &mut pos)?;
            let chunk_size_v = read_lp(data, &mut pos)?;
            let data_size_v = read_lp(data, &mut pos)?;
            let key_v = read_lp(data, &mut pos)?;
            let file_type_v = read_lp(data, &mut pos)?;
            let filename_v = read_lp(data, &mut pos)?;
            let duration_v = read_lp(data, &mut pos)?;

            if file_id_v.len() != 32 || key_v.len() != 32 {
                return Err(VaultError::Invalid("header field length mismatch".into()));
            }
            let mut file_id = [0u8; 32];
            file_id.copy_from_slice(&file_id_v);
            let mut symmetric_key = [0u8; 32];
            symmetric_key.copy_from_slice(&key_v);
            let version = *version_v.first().ok_or(VaultError::DecryptFailed)?;

            // A padded header carries its filler as its own length-prefixed
            // block so a reader can skip it without needing to know its
            // size in advance; everything after it is `trailing`.
            let padding = if version & PADDING_FLAG != 0 {
                read_lp(data, &mut pos)?
            } else {
                Vec::new()
            };

            Ok(Header {
                file_id,
                version,
                chunk_size: u32::from_be_bytes(
                    chunk_size_v.try_into().map_err(|_| VaultError::DecryptFailed)?,
                ),
                data_size: u64::from_be_bytes(
                    data_size_v.try_into().map_err(|_| VaultError::DecryptFailed)?,
                ),
                symmetric_key,
                file_type: *file_type_v.first().ok_or(VaultError::DecryptFailed)?,
                filename: String::from_utf8(filename_v)
                    .map_err(|_| VaultError::Invalid("filename not utf8".into()))?,
                video_duration: u32::from_be_bytes(
                    duration_v.try_into().map_err(|_| VaultError::DecryptFailed)?,
                ),
                padding,
                trailing: data[pos..].to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(chunk_size: usize, plaintext: &[u8]) {
        let key = [7u8; 32];
        let context = b"logical/path".to_vec();

        let mut writer = StreamWriter::new(Vec::new(), key, context.clone(), chunk_size);
        writer.write_all(plaintext).unwrap();
        let framed = writer.finish().unwrap();

        let mut reader = StreamReader::new(Cursor::new(framed), key, context, chunk_size);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn roundtrip_various_sizes() {
        for chunk_size in [1, 4, 16, 1024] {
            for len in [0, 1, chunk_size - 1, chunk_size, chunk_size + 1, chunk_size * 8] {
                roundtrip(chunk_size, &vec![0xAB; len]);
            }
        }
    }

    #[test]
    fn wrong_context_fails() {
        let key = [3u8; 32];
        let mut writer = StreamWriter::new(Vec::new(), key, b"a".to_vec(), 16);
        writer.write_all(b"some plaintext data").unwrap();
        let framed = writer.finish().unwrap();

        let mut reader = StreamReader::new(Cursor::new(framed), key, b"b".to_vec(), 16);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn truncated_mid_chunk_fails_not_eof() {
        let key = [1u8; 32];
        let mut writer = StreamWriter::new(Vec::new(), key, b"ctx".to_vec(), 16);
        writer.write_all(&vec![9u8; 40]).unwrap();
        let mut framed = writer.finish().unwrap();
        framed.truncate(framed.len() - 5);

        let mut reader = StreamReader::new(Cursor::new(framed), key, b"ctx".to_vec(), 16);
        let mut out = Vec::new();
        let result = reader.read_to_end(&mut out);
        assert!(result.is_err());
    }

    #[test]
    fn seek_matches_full_read() {
        let key = [9u8; 32];
        let context = b"seek-ctx".to_vec();
        let chunk_size = 8;
        let plaintext: Vec<u8> = (0u8..200).collect();

        let mut writer = StreamWriter::new(Vec::new(), key, context.clone(), chunk_size);
        writer.write_all(&plaintext).unwrap();
        let framed = writer.finish().unwrap();

        for off in [0usize, 1, 7, 8, 9, 100, 199] {
            let mut reader =
                StreamReader::new(Cursor::new(framed.clone()), key, context.clone(), chunk_size);
            reader.seek_to(0, off as u64).unwrap();
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            assert_eq!(out, plaintext[off..], "seek offset {off}");
        }
    }

    #[test]
    fn decrypted_len_matches_plaintext_len() {
        let key = [2u8; 32];
        let context = b"len-ctx".to_vec();
        let chunk_size = 10;
        for len in [0usize, 3, 10, 11, 37] {
            let mut writer = StreamWriter::new(Vec::new(), key, context.clone(), chunk_size);
            writer.write_all(&vec![1u8; len]).unwrap();
            let framed = writer.finish().unwrap();

            let mut reader =
                StreamReader::new(Cursor::new(framed), key, context.clone(), chunk_size);
            let decrypted = reader.decrypted_len(0).unwrap();
            assert_eq!(decrypted, len as u64);
        }
    }

    #[test]
    fn header_roundtrip_preserves_unknown_trailing_bytes() {
        let h = header::Header {
            file_id: [1u8; 32],
            version: 2,
            chunk_size: 65536,
            data_size: 12345,
            symmetric_key: [3u8; 32],
            file_type: 1,
            filename: "photo.jpg".to_string(),
            video_duration: 0,
            padding: Vec::new(),
            trailing: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let encoded = h.encode();
        let decoded = header::Header::decode(&encoded).unwrap();
        assert_eq!(decoded.filename, "photo.jpg");
        assert_eq!(decoded.trailing, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(!decoded.is_padded());
        assert!(decoded.padding.is_empty());
    }

    #[test]
    fn header_padding_flag_round_trips_and_skips_cleanly() {
        let mut h = header::Header {
            file_id: [1u8; 32],
            version: 2,
            chunk_size: 65536,
            data_size: 12345,
            symmetric_key: [3u8; 32],
            file_type: 1,
            filename: "photo.jpg".to_string(),
            video_duration: 0,
            padding: Vec::new(),
            trailing: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        h.force_padding_on(vec![0u8; 128]);
        assert!(h.is_padded());
        assert_eq!(h.version & header::PADDING_FLAG, header::PADDING_FLAG);

        let encoded = h.encode();
        let decoded = header::Header::decode(&encoded).unwrap();
        assert!(decoded.is_padded());
        assert_eq!(decoded.padding.len(), 128);
        assert_eq!(decoded.trailing, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
