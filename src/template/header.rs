//! Compiled template header and its validation.
//!
//! Layout (native byte order, guarded by the platform fingerprint):
//! - `0`  magic `"CTPP"`
//! - `4`  version `[major, minor, patch, reserved]`
//! - `8`  platform fingerprint `u64`
//! - `16` CRC32 of the whole image with this field zeroed, `u32`
//! - `20` entry point `u32`
//! - `24` IEEE-754 canary `f64`
//! - `32` segment table, five `{ offset: u32, size: u32 }` pairs
//! - `72` segments

use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"CTPP";

/// Version written by [`super::ProgramBuilder`].
pub const VERSION: [u8; 4] = [2, 0, 0, 0];

/// Reads back as this value only when producer and consumer share byte order.
pub const PLATFORM_FINGERPRINT: u64 = 0x4142434445464748;

/// Decodes bit-identically only on an IEEE-754 double implementation.
pub const IEEE754_CANARY: f64 = 15839800103804824402926068484019465486336.0;

pub const HEADER_SIZE: usize = 72;

const CRC_OFFSET: usize = 16;
const SEGMENT_TABLE_OFFSET: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectKind {
    #[error("template image is truncated")]
    Truncated,
    #[error("not a compiled template")]
    NotCompiledTemplate,
    #[error("unsupported template version {0}")]
    UnsupportedVersion(u8),
    #[error("wrong byte-order; template has been compiled on a different platform")]
    PlatformMismatch,
    #[error("CRC checksum invalid: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("IEEE 754 format is broken")]
    BrokenFloatFormat,
    #[error("malformed {segment} segment: {reason}")]
    MalformedSegment {
        segment: &'static str,
        reason: String,
    },
}

impl RejectKind {
    pub fn malformed(segment: Segment, reason: impl Into<String>) -> Self {
        RejectKind::MalformedSegment {
            segment: segment.name(),
            reason: reason.into(),
        }
    }
}

/// The five segments following the header, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Code = 0,
    Strings = 1,
    Syscalls = 2,
    Blocks = 3,
    Debug = 4,
}

impl Segment {
    pub const ALL: [Segment; 5] = [
        Segment::Code,
        Segment::Strings,
        Segment::Syscalls,
        Segment::Blocks,
        Segment::Debug,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Segment::Code => "code",
            Segment::Strings => "strings",
            Segment::Syscalls => "syscalls",
            Segment::Blocks => "blocks",
            Segment::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRange {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub version: [u8; 4],
    pub platform: u64,
    pub crc: u32,
    pub entry_point: u32,
    pub canary: f64,
    pub segments: [SegmentRange; 5],
}

impl Header {
    /// Read the fixed header fields. `bytes` must hold at least
    /// [`HEADER_SIZE`] bytes.
    fn read(bytes: &[u8]) -> Header {
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let mut segments = [SegmentRange::default(); 5];
        for (i, seg) in segments.iter_mut().enumerate() {
            let at = SEGMENT_TABLE_OFFSET + i * 8;
            seg.offset = read_u32(bytes, at);
            seg.size = read_u32(bytes, at + 4);
        }
        Header {
            version,
            platform: read_u64(bytes, 8),
            crc: read_u32(bytes, CRC_OFFSET),
            entry_point: read_u32(bytes, 20),
            canary: f64::from_bits(read_u64(bytes, 24)),
            segments,
        }
    }

    /// Serialize into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(MAGIC);
        out[4..8].copy_from_slice(&self.version);
        out[8..16].copy_from_slice(&self.platform.to_ne_bytes());
        out[16..20].copy_from_slice(&self.crc.to_ne_bytes());
        out[20..24].copy_from_slice(&self.entry_point.to_ne_bytes());
        out[24..32].copy_from_slice(&self.canary.to_bits().to_ne_bytes());
        for (i, seg) in self.segments.iter().enumerate() {
            let at = SEGMENT_TABLE_OFFSET + i * 8;
            out[at..at + 4].copy_from_slice(&seg.offset.to_ne_bytes());
            out[at + 4..at + 8].copy_from_slice(&seg.size.to_ne_bytes());
        }
    }

    pub fn segment(&self, segment: Segment) -> SegmentRange {
        self.segments[segment as usize]
    }
}

/// A validated image. Segment bytes are only reachable through here.
#[derive(Debug, Clone, Copy)]
pub struct ExecutableView<'a> {
    header: Header,
    image: &'a [u8],
    checksum_verified: bool,
}

impl<'a> ExecutableView<'a> {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn image(&self) -> &'a [u8] {
        self.image
    }

    /// Whether the CRC was checked during validation.
    pub fn checksum_verified(&self) -> bool {
        self.checksum_verified
    }

    /// Bytes of one segment, bounds-checked against the image.
    pub fn segment(&self, segment: Segment) -> Result<&'a [u8], RejectKind> {
        let range = self.header.segment(segment);
        let start = range.offset as usize;
        let end = start
            .checked_add(range.size as usize)
            .ok_or_else(|| RejectKind::malformed(segment, "size overflows"))?;
        if start < HEADER_SIZE && range.size > 0 {
            return Err(RejectKind::malformed(segment, "overlaps the header"));
        }
        self.image.get(start..end).ok_or_else(|| {
            RejectKind::malformed(
                segment,
                format!("range {start}..{end} exceeds image of {} bytes", self.image.len()),
            )
        })
    }
}

/// Validate the header of `bytes`.
///
/// Checks run in a fixed order and stop at the first failure: magic,
/// version, platform fingerprint, CRC (only when `enforce_crc`), float
/// canary. The input is never modified.
pub fn validate(bytes: &[u8], enforce_crc: bool) -> Result<ExecutableView<'_>, RejectKind> {
    if bytes.len() < MAGIC.len() {
        return Err(RejectKind::Truncated);
    }
    if &bytes[..4] != MAGIC {
        return Err(RejectKind::NotCompiledTemplate);
    }
    if bytes.len() < HEADER_SIZE {
        return Err(RejectKind::Truncated);
    }

    let header = Header::read(bytes);
    if header.version[0] < 1 {
        return Err(RejectKind::UnsupportedVersion(header.version[0]));
    }
    if header.platform != PLATFORM_FINGERPRINT {
        return Err(RejectKind::PlatformMismatch);
    }
    if enforce_crc {
        let computed = compute_crc(bytes);
        if computed != header.crc {
            return Err(RejectKind::ChecksumMismatch {
                stored: header.crc,
                computed,
            });
        }
    }
    if header.canary.to_bits() != IEEE754_CANARY.to_bits() {
        return Err(RejectKind::BrokenFloatFormat);
    }

    Ok(ExecutableView {
        header,
        image: bytes,
        checksum_verified: enforce_crc,
    })
}

/// CRC32 of `image` with the stored checksum field read as zero.
pub fn compute_crc(image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    if image.len() < CRC_OFFSET + 4 {
        hasher.update(image);
        return hasher.finalize();
    }
    hasher.update(&image[..CRC_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&image[CRC_OFFSET + 4..]);
    hasher.finalize()
}

/// Store the CRC of `image` into its checksum field.
pub fn seal(image: &mut [u8]) {
    let crc = compute_crc(image);
    image[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_ne_bytes());
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(b)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(b)
}
