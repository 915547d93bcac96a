//! Image stream reassembly
//!
//! The robot's image server writes frames back to back onto a TCP stream:
//!
//! ```text
//! offset  size  field
//!      0     8  magic "BBimage\0"
//!      8     1  protocol version (2)
//!      9     1  camera id
//!     10     1  codec id
//!     11     1  padding
//!     12     4  capture tick (u32)
//!     16     8  payload size (u64)
//!     24     8  vision results size (u64)
//!     32     -  vision results, then payload
//! ```
//!
//! All integers are little-endian. TCP gives no message boundaries, so the
//! reassembler finds frames by scanning for the magic and tolerates any
//! chunking of the input.

use serde::Serialize;
use tracing::{trace, warn};

use crate::codec::ByteReader;
use crate::error::DecodeError;

pub const IMAGE_MAGIC: &[u8; 8] = b"BBimage\0";
pub const IMAGE_VERSION: u8 = 2;
pub const IMAGE_HEADER_SIZE: usize = 32;
pub const VISION_RESULT_SIZE: usize = 76;

/// Bytes of trailing context kept while no header has been found
const SCAN_CONTEXT: usize = 2 * IMAGE_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    pub version: u8,
    pub camera: u8,
    pub codec: u8,
    pub tick: u32,
    pub payload_size: u64,
    pub side_channel_size: u64,
}

impl ImageHeader {
    /// Decode a header; `data` must start with the magic
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(data, "image header");
        if r.array::<8>()? != *IMAGE_MAGIC {
            return Err(DecodeError::BadMagic { what: "image header" });
        }
        let version = r.u8()?;
        let camera = r.u8()?;
        let codec = r.u8()?;
        r.skip(1)?;
        Ok(Self {
            version,
            camera,
            codec,
            tick: r.u32()?,
            payload_size: r.u64()?,
            side_channel_size: r.u64()?,
        })
    }

    pub fn encode(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut out = [0u8; IMAGE_HEADER_SIZE];
        out[0..8].copy_from_slice(IMAGE_MAGIC);
        out[8] = self.version;
        out[9] = self.camera;
        out[10] = self.codec;
        out[12..16].copy_from_slice(&self.tick.to_le_bytes());
        out[16..24].copy_from_slice(&self.payload_size.to_le_bytes());
        out[24..32].copy_from_slice(&self.side_channel_size.to_le_bytes());
        out
    }
}

/// A complete camera frame
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub version: u8,
    pub camera: u8,
    pub codec: u8,
    pub tick: u32,
    /// Raw vision results preceding the image bytes
    pub side_channel: Vec<u8>,
    pub payload: Vec<u8>,
}

impl ImageFrame {
    pub fn is_valid(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Decode the side channel as fixed-size vision result records
    pub fn vision_results(&self) -> Result<Vec<VisionResult>, DecodeError> {
        VisionResult::decode_all(&self.side_channel)
    }
}

/// One detection reported by the robot's vision pipeline.
///
/// `ics_*` fields are in image coordinates, `rcs_*` in robot coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VisionResult {
    pub vtype: i32,
    pub timestamp: i32,
    pub ics_x1: i32,
    pub ics_y1: i32,
    pub ics_x2: i32,
    pub ics_y2: i32,
    pub ics_width: i32,
    pub ics_height: i32,
    pub ics_confidence: f32,
    pub rcs_x1: f32,
    pub rcs_y1: f32,
    pub rcs_x2: f32,
    pub rcs_y2: f32,
    pub rcs_alpha: f32,
    pub rcs_distance: f32,
    pub rcs_confidence: f32,
    pub camera: i32,
    pub extra_int: i32,
    pub extra_float: f32,
}

impl VisionResult {
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>, DecodeError> {
        if data.len() % VISION_RESULT_SIZE != 0 {
            return Err(DecodeError::Invalid(format!(
                "vision results: {} bytes is not a multiple of {}",
                data.len(),
                VISION_RESULT_SIZE
            )));
        }
        let mut r = ByteReader::new(data, "vision result");
        let mut results = Vec::with_capacity(data.len() / VISION_RESULT_SIZE);
        while r.remaining() > 0 {
            results.push(Self {
                vtype: r.i32()?,
                timestamp: r.i32()?,
                ics_x1: r.i32()?,
                ics_y1: r.i32()?,
                ics_x2: r.i32()?,
                ics_y2: r.i32()?,
                ics_width: r.i32()?,
                ics_height: r.i32()?,
                ics_confidence: r.f32()?,
                rcs_x1: r.f32()?,
                rcs_y1: r.f32()?,
                rcs_x2: r.f32()?,
                rcs_y2: r.f32()?,
                rcs_alpha: r.f32()?,
                rcs_distance: r.f32()?,
                rcs_confidence: r.f32()?,
                camera: r.i32()?,
                extra_int: r.i32()?,
                extra_float: r.f32()?,
            });
        }
        Ok(results)
    }
}

enum State {
    Scanning,
    SideChannel { header: ImageHeader, side: Vec<u8> },
    Payload { header: ImageHeader, side: Vec<u8>, payload: Vec<u8> },
}

/// Incremental frame decoder for one image stream
pub struct ImageReassembler {
    state: State,
    /// Unconsumed input; while scanning this is the search window
    buffer: Vec<u8>,
    max_frame_bytes: u64,
    skipped_headers: u64,
}

impl ImageReassembler {
    pub fn new(max_frame_bytes: u64) -> Self {
        Self {
            state: State::Scanning,
            buffer: Vec::new(),
            max_frame_bytes,
            skipped_headers: 0,
        }
    }

    /// Headers dropped because of a version mismatch or absurd sizes
    pub fn skipped_headers(&self) -> u64 {
        self.skipped_headers
    }

    /// Feed the bytes of one socket read; returns every frame completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<ImageFrame> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            match std::mem::replace(&mut self.state, State::Scanning) {
                State::Scanning => {
                    match self.scan() {
                        Some(header) => {
                            self.state = State::SideChannel {
                                side: Vec::with_capacity(header.side_channel_size as usize),
                                header,
                            };
                        }
                        None => return frames,
                    }
                }
                State::SideChannel { header, mut side } => {
                    if !fill(&mut side, header.side_channel_size as usize, &mut self.buffer) {
                        self.state = State::SideChannel { header, side };
                        return frames;
                    }
                    self.state = State::Payload {
                        payload: Vec::with_capacity(header.payload_size as usize),
                        header,
                        side,
                    };
                }
                State::Payload { header, side, mut payload } => {
                    if !fill(&mut payload, header.payload_size as usize, &mut self.buffer) {
                        self.state = State::Payload { header, side, payload };
                        return frames;
                    }
                    trace!(
                        "Image frame complete: camera {} tick {} ({} bytes)",
                        header.camera,
                        header.tick,
                        payload.len()
                    );
                    frames.push(ImageFrame {
                        version: header.version,
                        camera: header.camera,
                        codec: header.codec,
                        tick: header.tick,
                        side_channel: side,
                        payload,
                    });
                }
            }
        }
    }

    /// Look for the next acceptable header in the buffer, consuming it.
    ///
    /// Returns `None` when more input is needed; in that case the buffer is
    /// trimmed so that a header split across reads is still found.
    fn scan(&mut self) -> Option<ImageHeader> {
        loop {
            let Some(offset) = find_magic(&self.buffer) else {
                let keep = self.buffer.len().min(SCAN_CONTEXT);
                self.buffer.drain(..self.buffer.len() - keep);
                return None;
            };
            self.buffer.drain(..offset);
            if self.buffer.len() < IMAGE_HEADER_SIZE {
                return None;
            }

            let header = match ImageHeader::decode(&self.buffer[..IMAGE_HEADER_SIZE]) {
                Ok(header) => header,
                Err(e) => {
                    // Unreachable in practice since the magic matched
                    warn!("Dropping image header: {}", e);
                    self.skip_header();
                    continue;
                }
            };

            if header.version != IMAGE_VERSION {
                warn!(
                    "Skipping image frame with protocol version {} (expected {})",
                    header.version, IMAGE_VERSION
                );
                self.skip_header();
                continue;
            }
            let declared = header.payload_size.saturating_add(header.side_channel_size);
            if declared > self.max_frame_bytes {
                warn!(
                    "Skipping image frame declaring {} bytes (limit {})",
                    declared, self.max_frame_bytes
                );
                self.skip_header();
                continue;
            }

            self.buffer.drain(..IMAGE_HEADER_SIZE);
            return Some(header);
        }
    }

    fn skip_header(&mut self) {
        self.skipped_headers += 1;
        self.buffer.drain(..IMAGE_HEADER_SIZE);
    }
}

/// Move bytes from `input` into `target` until it holds `size` bytes
fn fill(target: &mut Vec<u8>, size: usize, input: &mut Vec<u8>) -> bool {
    let wanted = size - target.len();
    let take = wanted.min(input.len());
    target.extend(input.drain(..take));
    target.len() == size
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(IMAGE_MAGIC.len())
        .position(|window| window == IMAGE_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::image_frame_bytes;
    use proptest::prelude::*;

    const LIMIT: u64 = 1 << 20;

    #[test]
    fn test_whole_frame_in_one_read() {
        let bytes = image_frame_bytes(IMAGE_VERSION, 1, b"vision", b"pixels");
        let mut reassembler = ImageReassembler::new(LIMIT);
        let frames = reassembler.push(&bytes);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].camera, 1);
        assert_eq!(frames[0].side_channel, b"vision");
        assert_eq!(frames[0].payload, b"pixels");
    }

    #[test]
    fn test_frame_split_at_every_byte() {
        let bytes = image_frame_bytes(IMAGE_VERSION, 0, b"abc", b"0123456789");
        let mut reassembler = ImageReassembler::new(LIMIT);
        let mut frames = Vec::new();
        for byte in &bytes {
            frames.extend(reassembler.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].side_channel, b"abc");
        assert_eq!(frames[0].payload, b"0123456789");
    }

    #[test]
    fn test_magic_at_offset_in_garbage() {
        let mut bytes = vec![0xAAu8; 517];
        bytes.extend(image_frame_bytes(IMAGE_VERSION, 1, b"", b"image"));
        let frames = ImageReassembler::new(LIMIT).push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"image");
    }

    #[test]
    fn test_wrong_version_is_skipped() {
        let mut bytes = image_frame_bytes(1, 0, b"", b"old");
        bytes.extend(image_frame_bytes(IMAGE_VERSION, 1, b"vr", b"new"));

        let mut reassembler = ImageReassembler::new(LIMIT);
        let frames = reassembler.push(&bytes);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"new");
        assert_eq!(frames[0].side_channel, b"vr");
        assert_eq!(reassembler.skipped_headers(), 1);
    }

    #[test]
    fn test_header_split_across_reads() {
        let mut bytes = vec![0u8; 100];
        bytes.extend(image_frame_bytes(IMAGE_VERSION, 0, b"", b"xy"));
        let mut reassembler = ImageReassembler::new(LIMIT);
        // Cut in the middle of the magic
        assert!(reassembler.push(&bytes[..104]).is_empty());
        // And in the middle of the header
        assert!(reassembler.push(&bytes[104..120]).is_empty());
        let frames = reassembler.push(&bytes[120..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"xy");
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = image_frame_bytes(IMAGE_VERSION, 0, b"", b"first");
        bytes.extend(image_frame_bytes(IMAGE_VERSION, 1, b"", b"second"));
        let frames = ImageReassembler::new(LIMIT).push(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"first");
        assert_eq!(frames[1].payload, b"second");
    }

    #[test]
    fn test_incomplete_payload_is_not_emitted() {
        let bytes = image_frame_bytes(IMAGE_VERSION, 0, b"", b"0123456789");
        let mut reassembler = ImageReassembler::new(LIMIT);
        assert!(reassembler.push(&bytes[..bytes.len() - 1]).is_empty());
    }

    #[test]
    fn test_oversized_declaration_is_skipped() {
        let header = ImageHeader {
            version: IMAGE_VERSION,
            camera: 0,
            codec: 0,
            tick: 0,
            payload_size: LIMIT + 1,
            side_channel_size: 0,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend(image_frame_bytes(IMAGE_VERSION, 0, b"", b"ok"));
        let frames = ImageReassembler::new(LIMIT).push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"ok");
    }

    #[test]
    fn test_vision_results_decode() {
        let mut record = Vec::new();
        for value in 0..8i32 {
            record.extend_from_slice(&value.to_le_bytes());
        }
        for value in 0..8 {
            record.extend_from_slice(&(value as f32 * 0.5).to_le_bytes());
        }
        record.extend_from_slice(&1i32.to_le_bytes());
        record.extend_from_slice(&42i32.to_le_bytes());
        record.extend_from_slice(&2.5f32.to_le_bytes());
        assert_eq!(record.len(), VISION_RESULT_SIZE);

        let results = VisionResult::decode_all(&record).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ics_height, 7);
        assert_eq!(results[0].rcs_confidence, 3.5);
        assert_eq!(results[0].camera, 1);
        assert_eq!(results[0].extra_int, 42);
        assert_eq!(results[0].extra_float, 2.5);

        assert!(VisionResult::decode_all(&record[..70]).is_err());
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_output(
            side in proptest::collection::vec(any::<u8>(), 0..200),
            payload in proptest::collection::vec(any::<u8>(), 1..400),
            cuts in proptest::collection::vec(any::<usize>(), 0..12),
        ) {
            let bytes = image_frame_bytes(IMAGE_VERSION, 1, &side, &payload);
            let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();

            let mut reassembler = ImageReassembler::new(LIMIT);
            let mut frames = Vec::new();
            for pair in points.windows(2) {
                frames.extend(reassembler.push(&bytes[pair[0]..pair[1]]));
            }

            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0].side_channel, &side);
            prop_assert_eq!(&frames[0].payload, &payload);
        }
    }
}
