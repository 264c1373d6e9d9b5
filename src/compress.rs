//! Bounded in-memory compression for directory payloads
//!
//! Incremental, resumable zlib/gzip transforms with compression-bomb
//! detection. Relay payloads carrying compressed directory documents come
//! from untrusted peers, so decompression tracks cumulative input/output
//! and aborts once the expansion ratio turns adversarial. Compression has
//! no bomb check (trusted local input).
//!
//! No zlib status code leaks out of this module; callers see only
//! [`StreamStatus`] and [`CompressError`].

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use thiserror::Error;

/// Default maximum allowed uncompressed:compressed ratio.
pub const MAX_UNCOMPRESSION_FACTOR: u64 = 25;

/// Default output size after which the ratio is enforced. Anything smaller
/// is never treated as a bomb, so small documents always decompress.
pub const BOMB_CHECK_THRESHOLD: u64 = 64 * 1024;

/// Errors from the compression layer. Fatal to the one operation only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    /// Expansion ratio exceeded the configured factor.
    #[error("compression bomb: {output} bytes out of {input} in")]
    Bomb { input: u64, output: u64 },

    /// The input prefix matches neither supported container format.
    #[error("unrecognized compression format")]
    UnknownFormat,

    /// Output buffer growth would overflow the addressable size.
    #[error("output size overflow")]
    SizeOverflow,

    /// The stream is malformed or truncated.
    #[error("corrupt compressed data: {0}")]
    Corrupt(String),
}

/// Supported container formats, auto-detected from the first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Header-checksum-prefixed (RFC 1950).
    Zlib,
    /// Magic-byte-prefixed (RFC 1952).
    Gzip,
}

/// Guess the compression method from a buffer's first bytes.
pub fn detect_method(input: &[u8]) -> Option<CompressionMethod> {
    if input.len() > 2 && input[0] == 0x1f && input[1] == 0x8b {
        return Some(CompressionMethod::Gzip);
    }
    if input.len() > 2
        && (input[0] & 0x0f) == 8
        && u16::from_be_bytes([input[0], input[1]]) % 31 == 0
    {
        return Some(CompressionMethod::Zlib);
    }
    None
}

/// Bomb-detection limits.
#[derive(Debug, Clone, Copy)]
pub struct BombLimits {
    /// Maximum allowed output:input ratio.
    pub max_factor: u64,
    /// Output size below which the ratio is not enforced.
    pub check_threshold: u64,
}

impl Default for BombLimits {
    fn default() -> Self {
        Self {
            max_factor: MAX_UNCOMPRESSION_FACTOR,
            check_threshold: BOMB_CHECK_THRESHOLD,
        }
    }
}

impl BombLimits {
    /// True if producing `output` bytes from `input` bytes looks like a bomb.
    pub fn is_bomb(&self, input: u64, output: u64) -> bool {
        if input == 0 || output < self.check_threshold {
            return false;
        }
        output / input > self.max_factor
    }
}

/// Result of one incremental transform step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// The stream is complete.
    Done,
    /// All given input was absorbed; more is needed to make progress.
    NeedMoreInput,
    /// Output space was exhausted with work remaining.
    NeedMoreOutput,
}

/// Bytes moved by one [`Decompressor::process`] / [`Compressor::process`] call.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    pub consumed: usize,
    pub produced: usize,
    pub status: StreamStatus,
}

// Gzip FLG bits (RFC 1952).
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 255];

/// Where a gzip-framed stream currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Accumulating the variable-length gzip header.
    Header,
    /// Inflating/deflating the body.
    Body,
    /// Accumulating (or emitting) the 8-byte gzip trailer.
    Trailer,
    Finished,
}

/// Incremental, resumable decompression with bomb detection.
pub struct Decompressor {
    method: CompressionMethod,
    inflate: Decompress,
    phase: Phase,
    limits: BombLimits,
    /// Cumulative input consumed across all calls on this state.
    input_so_far: u64,
    /// Cumulative output produced across all calls on this state.
    output_so_far: u64,
    /// Partial gzip header bytes.
    header_buf: Vec<u8>,
    /// Partial gzip trailer bytes.
    trailer_buf: Vec<u8>,
    /// CRC of the produced plaintext (gzip trailer verification).
    crc: flate2::Crc,
}

impl Decompressor {
    pub fn new(method: CompressionMethod, limits: BombLimits) -> Self {
        let (inflate, phase) = match method {
            CompressionMethod::Zlib => (Decompress::new(true), Phase::Body),
            CompressionMethod::Gzip => (Decompress::new(false), Phase::Header),
        };
        Self {
            method,
            inflate,
            phase,
            limits,
            input_so_far: 0,
            output_so_far: 0,
            header_buf: Vec::new(),
            trailer_buf: Vec::new(),
            crc: flate2::Crc::new(),
        }
    }

    /// Construct by sniffing the container format from `prefix`.
    pub fn from_prefix(prefix: &[u8], limits: BombLimits) -> Result<Self, CompressError> {
        let method = detect_method(prefix).ok_or(CompressError::UnknownFormat)?;
        Ok(Self::new(method, limits))
    }

    pub fn total_in(&self) -> u64 {
        self.input_so_far
    }

    pub fn total_out(&self) -> u64 {
        self.output_so_far
    }

    /// Rearm for a following concatenated stream of the same method,
    /// keeping the cumulative bomb counters.
    fn rearm(&mut self) {
        let (inflate, phase) = match self.method {
            CompressionMethod::Zlib => (Decompress::new(true), Phase::Body),
            CompressionMethod::Gzip => (Decompress::new(false), Phase::Header),
        };
        self.inflate = inflate;
        self.phase = phase;
        self.header_buf.clear();
        self.trailer_buf.clear();
        self.crc = flate2::Crc::new();
    }

    /// Run one decompression step.
    ///
    /// Reads from `input`, writes into `output`, and reports how many bytes
    /// moved. `finish` means the caller has no further input after this.
    /// The state stays resumable until [`StreamStatus::Done`].
    pub fn process(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> Result<ProcessOutcome, CompressError> {
        let mut in_off = 0;
        let mut out_off = 0;

        let status = loop {
            match self.phase {
                Phase::Header => {
                    match self.take_header(&input[in_off..])? {
                        Some(used) => {
                            in_off += used;
                            self.phase = Phase::Body;
                        }
                        None => {
                            in_off = input.len();
                            break StreamStatus::NeedMoreInput;
                        }
                    }
                }
                Phase::Body => {
                    let (used, wrote, status) =
                        self.inflate_step(&input[in_off..], &mut output[out_off..], finish)?;
                    in_off += used;
                    out_off += wrote;
                    match status {
                        None => {} // stream end inside this call, fall through to trailer
                        Some(s) => break s,
                    }
                }
                Phase::Trailer => {
                    let need = 8 - self.trailer_buf.len();
                    let have = (input.len() - in_off).min(need);
                    self.trailer_buf.extend_from_slice(&input[in_off..in_off + have]);
                    in_off += have;
                    if self.trailer_buf.len() < 8 {
                        break StreamStatus::NeedMoreInput;
                    }
                    self.check_trailer()?;
                    self.phase = Phase::Finished;
                    break StreamStatus::Done;
                }
                Phase::Finished => break StreamStatus::Done,
            }
        };

        self.input_so_far += in_off as u64;
        self.output_so_far += out_off as u64;
        if self.limits.is_bomb(self.input_so_far, self.output_so_far) {
            log::warn!(
                "possible compression bomb: {} -> {} bytes",
                self.input_so_far,
                self.output_so_far
            );
            return Err(CompressError::Bomb {
                input: self.input_so_far,
                output: self.output_so_far,
            });
        }

        Ok(ProcessOutcome {
            consumed: in_off,
            produced: out_off,
            status,
        })
    }

    /// Inflate body bytes. Returns `(consumed, produced, status)`, where a
    /// `None` status means the deflate stream ended and the phase advanced.
    fn inflate_step(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> Result<(usize, usize, Option<StreamStatus>), CompressError> {
        let before_in = self.inflate.total_in();
        let before_out = self.inflate.total_out();
        let flush = if finish {
            FlushDecompress::Finish
        } else {
            FlushDecompress::None
        };

        let status = self
            .inflate
            .decompress(input, output, flush)
            .map_err(|e| CompressError::Corrupt(e.to_string()))?;

        let consumed = (self.inflate.total_in() - before_in) as usize;
        let produced = (self.inflate.total_out() - before_out) as usize;
        if self.method == CompressionMethod::Gzip {
            self.crc.update(&output[..produced]);
        }

        match status {
            Status::StreamEnd => {
                self.phase = match self.method {
                    CompressionMethod::Zlib => Phase::Finished,
                    CompressionMethod::Gzip => Phase::Trailer,
                };
                let status = if self.phase == Phase::Finished {
                    Some(StreamStatus::Done)
                } else {
                    None
                };
                Ok((consumed, produced, status))
            }
            Status::Ok | Status::BufError => {
                // "Output buffer exhausted with input remaining" is one
                // condition, regardless of which status the library picked.
                if consumed < input.len() || (produced == output.len() && !output.is_empty()) {
                    if consumed == 0 && produced == 0 && !input.is_empty() && !output.is_empty() {
                        return Err(CompressError::Corrupt("no progress possible".into()));
                    }
                    Ok((consumed, produced, Some(StreamStatus::NeedMoreOutput)))
                } else {
                    Ok((consumed, produced, Some(StreamStatus::NeedMoreInput)))
                }
            }
        }
    }

    /// Absorb gzip header bytes. Returns how many bytes of `input` belong
    /// to the header once it is complete, or `None` if more are needed.
    fn take_header(&mut self, input: &[u8]) -> Result<Option<usize>, CompressError> {
        let already = self.header_buf.len();
        let mut buf = std::mem::take(&mut self.header_buf);
        buf.extend_from_slice(input);

        match parse_gzip_header(&buf)? {
            Some(header_len) => {
                self.header_buf.clear();
                Ok(Some(header_len - already))
            }
            None => {
                self.header_buf = buf;
                Ok(None)
            }
        }
    }

    fn check_trailer(&self) -> Result<(), CompressError> {
        let t = &self.trailer_buf;
        let crc = u32::from_le_bytes([t[0], t[1], t[2], t[3]]);
        let isize = u32::from_le_bytes([t[4], t[5], t[6], t[7]]);
        if crc != self.crc.sum() {
            return Err(CompressError::Corrupt("gzip crc mismatch".into()));
        }
        if isize != self.crc.amount() {
            return Err(CompressError::Corrupt("gzip length mismatch".into()));
        }
        Ok(())
    }
}

/// Parse a gzip member header. `Ok(Some(len))` gives the header length,
/// `Ok(None)` means the buffer does not yet hold the whole header.
fn parse_gzip_header(buf: &[u8]) -> Result<Option<usize>, CompressError> {
    if buf.len() < 10 {
        return Ok(None);
    }
    if buf[0] != 0x1f || buf[1] != 0x8b {
        return Err(CompressError::UnknownFormat);
    }
    if buf[2] != 8 {
        return Err(CompressError::Corrupt("gzip method is not deflate".into()));
    }
    let flg = buf[3];
    let mut pos = 10;

    if flg & FEXTRA != 0 {
        if buf.len() < pos + 2 {
            return Ok(None);
        }
        let xlen = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2 + xlen;
        if buf.len() < pos {
            return Ok(None);
        }
    }
    for flag in [FNAME, FCOMMENT] {
        if flg & flag != 0 {
            match buf[pos..].iter().position(|&b| b == 0) {
                Some(nul) => pos += nul + 1,
                None => return Ok(None),
            }
        }
    }
    if flg & FHCRC != 0 {
        pos += 2;
        if buf.len() < pos {
            return Ok(None);
        }
    }
    Ok(Some(pos))
}

/// Incremental compression (mirror of [`Decompressor`], no bomb check).
pub struct Compressor {
    method: CompressionMethod,
    deflate: Compress,
    phase: Phase,
    /// Offset into the gzip header/trailer already emitted.
    frame_off: usize,
    crc: flate2::Crc,
}

impl Compressor {
    pub fn new(method: CompressionMethod) -> Self {
        let (deflate, phase) = match method {
            CompressionMethod::Zlib => (Compress::new(Compression::best(), true), Phase::Body),
            CompressionMethod::Gzip => (Compress::new(Compression::best(), false), Phase::Header),
        };
        Self {
            method,
            deflate,
            phase,
            frame_off: 0,
            crc: flate2::Crc::new(),
        }
    }

    /// Run one compression step; same contract as [`Decompressor::process`].
    pub fn process(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> Result<ProcessOutcome, CompressError> {
        let mut in_off = 0;
        let mut out_off = 0;

        let status = loop {
            match self.phase {
                Phase::Header => {
                    out_off += copy_frame(&GZIP_HEADER, &mut self.frame_off, &mut output[out_off..]);
                    if self.frame_off < GZIP_HEADER.len() {
                        break StreamStatus::NeedMoreOutput;
                    }
                    self.frame_off = 0;
                    self.phase = Phase::Body;
                }
                Phase::Body => {
                    let before_in = self.deflate.total_in();
                    let before_out = self.deflate.total_out();
                    let flush = if finish {
                        FlushCompress::Finish
                    } else {
                        FlushCompress::None
                    };
                    let status = self
                        .deflate
                        .compress(&input[in_off..], &mut output[out_off..], flush)
                        .map_err(|e| CompressError::Corrupt(e.to_string()))?;
                    let consumed = (self.deflate.total_in() - before_in) as usize;
                    let produced = (self.deflate.total_out() - before_out) as usize;
                    self.crc.update(&input[in_off..in_off + consumed]);
                    in_off += consumed;
                    out_off += produced;

                    match status {
                        Status::StreamEnd => match self.method {
                            CompressionMethod::Zlib => {
                                self.phase = Phase::Finished;
                                break StreamStatus::Done;
                            }
                            CompressionMethod::Gzip => self.phase = Phase::Trailer,
                        },
                        Status::Ok | Status::BufError => {
                            if in_off < input.len() || finish {
                                break StreamStatus::NeedMoreOutput;
                            }
                            break StreamStatus::NeedMoreInput;
                        }
                    }
                }
                Phase::Trailer => {
                    let mut trailer = [0u8; 8];
                    trailer[0..4].copy_from_slice(&self.crc.sum().to_le_bytes());
                    trailer[4..8].copy_from_slice(&self.crc.amount().to_le_bytes());
                    out_off += copy_frame(&trailer, &mut self.frame_off, &mut output[out_off..]);
                    if self.frame_off < trailer.len() {
                        break StreamStatus::NeedMoreOutput;
                    }
                    self.phase = Phase::Finished;
                    break StreamStatus::Done;
                }
                Phase::Finished => break StreamStatus::Done,
            }
        };

        Ok(ProcessOutcome {
            consumed: in_off,
            produced: out_off,
            status,
        })
    }
}

/// Copy as much of `frame[*off..]` into `out` as fits, advancing `*off`.
fn copy_frame(frame: &[u8], off: &mut usize, out: &mut [u8]) -> usize {
    let n = (frame.len() - *off).min(out.len());
    out[..n].copy_from_slice(&frame[*off..*off + n]);
    *off += n;
    n
}

/// Growable output buffer that encapsulates capacity doubling.
struct GrowBuf {
    data: Vec<u8>,
    len: usize,
}

impl GrowBuf {
    fn new(initial: usize) -> Self {
        Self {
            data: vec![0; initial.max(1024)],
            len: 0,
        }
    }

    fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    fn advance(&mut self, n: usize) {
        self.len += n;
        debug_assert!(self.len <= self.data.len());
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn grow(&mut self) -> Result<(), CompressError> {
        let new_size = self
            .data
            .len()
            .checked_mul(2)
            .ok_or(CompressError::SizeOverflow)?;
        self.data.resize(new_size, 0);
        Ok(())
    }

    fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.len);
        self.data
    }
}

/// One-shot decompression of a self-contained buffer.
///
/// Auto-detects the container format, drives the incremental form to
/// completion, and doubles the output buffer on `NeedMoreOutput` — growth
/// is checked against the bomb limits first, so a hostile input fails
/// before it costs unbounded memory. Concatenated streams of the same
/// method are decompressed back to back, as the directory protocol allows.
pub fn decompress_all(input: &[u8], limits: &BombLimits) -> Result<Vec<u8>, CompressError> {
    let mut state = Decompressor::from_prefix(input, *limits)?;
    let mut buf = GrowBuf::new(input.len().saturating_mul(2));
    let mut in_off = 0;

    loop {
        let outcome = state.process(&input[in_off..], buf.spare(), true)?;
        in_off += outcome.consumed;
        buf.advance(outcome.produced);

        match outcome.status {
            StreamStatus::Done => {
                if in_off == input.len() {
                    return Ok(buf.into_vec());
                }
                // Another concatenated stream follows.
                state.rearm();
            }
            StreamStatus::NeedMoreOutput => {
                // First try without growth, then grow, then fail.
                let doubled = buf
                    .size()
                    .checked_mul(2)
                    .ok_or(CompressError::SizeOverflow)?;
                if limits.is_bomb(input.len() as u64, doubled as u64) {
                    return Err(CompressError::Bomb {
                        input: input.len() as u64,
                        output: doubled as u64,
                    });
                }
                buf.grow()?;
            }
            StreamStatus::NeedMoreInput => {
                if in_off >= input.len() {
                    return Err(CompressError::Corrupt("truncated stream".into()));
                }
            }
        }
    }
}

/// One-shot compression (mirror operation, no bomb check).
pub fn compress_all(input: &[u8], method: CompressionMethod) -> Result<Vec<u8>, CompressError> {
    let mut state = Compressor::new(method);
    // Guess 50% compression, as the incremental driver's starting size.
    let mut buf = GrowBuf::new((input.len() / 2).max(1024));
    let mut in_off = 0;

    loop {
        let outcome = state.process(&input[in_off..], buf.spare(), true)?;
        in_off += outcome.consumed;
        buf.advance(outcome.produced);

        match outcome.status {
            StreamStatus::Done => return Ok(buf.into_vec()),
            StreamStatus::NeedMoreOutput => buf.grow()?,
            StreamStatus::NeedMoreInput => {
                return Err(CompressError::Corrupt("compressor stalled".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn roundtrip(data: &[u8], method: CompressionMethod) {
        let packed = compress_all(data, method).unwrap();
        assert_eq!(detect_method(&packed), Some(method));
        let unpacked = decompress_all(&packed, &BombLimits::default()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn roundtrip_both_formats() {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(7);
        let mut random = vec![0u8; 100 * 1024];
        rng.fill(&mut random[..]);

        let text = b"directory-document ".repeat(500);

        for method in [CompressionMethod::Zlib, CompressionMethod::Gzip] {
            roundtrip(b"", method);
            roundtrip(b"x", method);
            roundtrip(&text, method);
            roundtrip(&random, method);
            roundtrip(&[0u8; 10 * 1024], method);
        }
    }

    #[test]
    fn detect_unknown_format() {
        assert_eq!(detect_method(b"hello world"), None);
        assert!(matches!(
            decompress_all(b"hello world", &BombLimits::default()),
            Err(CompressError::UnknownFormat)
        ));
        assert_eq!(detect_method(b""), None);
        assert_eq!(detect_method(&[0x1f]), None);
    }

    #[test]
    fn incremental_chunked_matches_oneshot() {
        let data = b"The quick brown fox jumps over the lazy dog. ".repeat(200);
        let packed = compress_all(&data, CompressionMethod::Gzip).unwrap();

        let mut state = Decompressor::new(CompressionMethod::Gzip, BombLimits::default());
        let mut out = Vec::new();
        let mut chunk_out = [0u8; 97];

        for (i, chunk) in packed.chunks(13).enumerate() {
            let last = (i + 1) * 13 >= packed.len();
            let mut off = 0;
            loop {
                let outcome = state.process(&chunk[off..], &mut chunk_out, last).unwrap();
                off += outcome.consumed;
                out.extend_from_slice(&chunk_out[..outcome.produced]);
                match outcome.status {
                    StreamStatus::NeedMoreOutput => continue,
                    StreamStatus::NeedMoreInput => break,
                    StreamStatus::Done => break,
                }
            }
        }
        assert_eq!(out, data);
        assert_eq!(state.total_out(), data.len() as u64);
    }

    #[test]
    fn bomb_detected_on_full_stream() {
        // 4 MiB of zeros packs into a few KiB; expanding it back breaches
        // the 25x factor well past the 64 KiB threshold.
        let packed = compress_all(&vec![0u8; 4 * 1024 * 1024], CompressionMethod::Zlib).unwrap();
        assert!(packed.len() < 64 * 1024);
        assert!(matches!(
            decompress_all(&packed, &BombLimits::default()),
            Err(CompressError::Bomb { .. })
        ));
    }

    #[test]
    fn bomb_detected_on_truncated_stream() {
        let packed = compress_all(&vec![0u8; 1024 * 1024], CompressionMethod::Zlib).unwrap();
        let truncated = &packed[..packed.len() / 2];
        assert!(matches!(
            decompress_all(truncated, &BombLimits::default()),
            Err(CompressError::Bomb { .. })
        ));
    }

    #[test]
    fn small_documents_never_bomb() {
        // Below the threshold the ratio is irrelevant.
        let data = vec![0u8; 20 * 1024];
        roundtrip(&data, CompressionMethod::Zlib);
    }

    #[test]
    fn truncated_incompressible_stream_is_corrupt() {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(9);
        let mut data = vec![0u8; 8 * 1024];
        rng.fill(&mut data[..]);
        let packed = compress_all(&data, CompressionMethod::Zlib).unwrap();
        let truncated = &packed[..packed.len() - 16];
        assert!(matches!(
            decompress_all(truncated, &BombLimits::default()),
            Err(CompressError::Corrupt(_))
        ));
    }

    #[test]
    fn concatenated_streams_decompress() {
        let mut packed = compress_all(b"first document ", CompressionMethod::Zlib).unwrap();
        packed.extend(compress_all(b"second document", CompressionMethod::Zlib).unwrap());
        let out = decompress_all(&packed, &BombLimits::default()).unwrap();
        assert_eq!(out, b"first document second document");
    }

    #[test]
    fn gzip_trailer_crc_is_checked() {
        let mut packed = compress_all(b"payload payload payload", CompressionMethod::Gzip).unwrap();
        let n = packed.len();
        packed[n - 6] ^= 0xff; // corrupt the stored crc
        assert!(matches!(
            decompress_all(&packed, &BombLimits::default()),
            Err(CompressError::Corrupt(_))
        ));
    }
}
