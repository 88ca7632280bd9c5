//! Wire layout of committed color and depth frames.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const DEPTH_WIDTH: usize = 512;
pub const DEPTH_HEIGHT: usize = 424;
pub const DEPTH_PIXELS: usize = DEPTH_WIDTH * DEPTH_HEIGHT;

/// One 512x424 plane of 11-bit samples.
pub const DEPTH_IMAGE_SIZE: usize = DEPTH_PIXELS * 11 / 8;
pub const DEPTH_FOOTER_SIZE: usize = std::mem::size_of::<DepthFooter>();
pub const DEPTH_SUBFRAME_SIZE: usize = DEPTH_IMAGE_SIZE + DEPTH_FOOTER_SIZE;
/// Nine measurement subframes plus one reserved.
pub const DEPTH_SUBFRAMES: usize = 10;
pub const DEPTH_FRAME_SIZE: usize = DEPTH_SUBFRAME_SIZE * DEPTH_SUBFRAMES;

pub const DEPTH_MAGIC0: u32 = 0;
pub const DEPTH_MAGIC1: u32 = 9;

pub const COLOR_WIDTH: usize = 1920;
pub const COLOR_HEIGHT: usize = 1080;
pub const COLOR_HEADER_SIZE: usize = std::mem::size_of::<ColorHeader>();
pub const COLOR_FOOTER_SIZE: usize = std::mem::size_of::<ColorFooter>();
/// `'BBBB'`
pub const COLOR_MAGIC: u32 = 0x4242_4242;
/// `'9999'`
pub const COLOR_FOOTER_MAGIC: u32 = 0x3939_3939;
/// Largest color frame the bulk stream produces.
pub const COLOR_FRAME_MAX: usize = 2 * 1024 * 1024;

/// Stream a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Color,
    Depth,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Color => "color",
            Channel::Depth => "depth",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trailer of every depth subframe.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DepthFooter {
    pub magic0: u32,
    pub magic1: u32,
    pub timestamp: u32,
    pub sequence: u32,
    pub subsequence: u32,
    pub length: u32,
    pub fields: [u32; 32],
}

impl DepthFooter {
    pub fn new(sequence: u32, subsequence: u32, timestamp: u32) -> Self {
        Self {
            magic0: DEPTH_MAGIC0,
            magic1: DEPTH_MAGIC1,
            timestamp,
            sequence,
            subsequence,
            length: DEPTH_IMAGE_SIZE as u32,
            fields: [0; 32],
        }
    }

    /// Read a footer from the first [`DEPTH_FOOTER_SIZE`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..DEPTH_FOOTER_SIZE)?;
        Some(bytemuck::pod_read_unaligned(raw))
    }

    /// Footer trailing a packet whose tail carries one.
    pub fn from_tail(packet: &[u8]) -> Option<Self> {
        let start = packet.len().checked_sub(DEPTH_FOOTER_SIZE)?;
        Self::parse(&packet[start..])
    }

    /// Footer of the reserved last subframe of a committed frame.
    pub fn of_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() != DEPTH_FRAME_SIZE {
            return None;
        }
        Self::parse(&frame[DEPTH_SUBFRAME_SIZE * (DEPTH_SUBFRAMES - 1) + DEPTH_IMAGE_SIZE..])
    }

    pub fn is_valid(&self) -> bool {
        self.magic0 == DEPTH_MAGIC0
            && self.magic1 == DEPTH_MAGIC1
            && self.length as usize == DEPTH_IMAGE_SIZE
            && (self.subsequence as usize) < DEPTH_SUBFRAMES
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// First bytes of every color frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ColorHeader {
    pub sequence: u32,
    pub magic: u32,
}

impl ColorHeader {
    pub fn new(sequence: u32) -> Self {
        Self {
            sequence,
            magic: COLOR_MAGIC,
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..COLOR_HEADER_SIZE)?;
        Some(bytemuck::pod_read_unaligned(raw))
    }

    pub fn is_valid(&self) -> bool {
        self.magic == COLOR_MAGIC
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Last bytes of every color frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ColorFooter {
    pub magic_header: u32,
    pub sequence: u32,
    pub filler_length: u32,
    pub unknown1: u32,
    pub unknown2: u32,
    pub timestamp: u32,
    pub exposure: f32,
    pub gain: f32,
    pub magic_footer: u32,
    pub packet_size: u32,
    pub unknown3: f32,
    pub unknown4: [u32; 3],
}

impl ColorFooter {
    pub fn from_tail(frame: &[u8]) -> Option<Self> {
        let start = frame.len().checked_sub(COLOR_FOOTER_SIZE)?;
        Some(bytemuck::pod_read_unaligned(&frame[start..]))
    }

    pub fn is_valid(&self) -> bool {
        self.magic_header == COLOR_FOOTER_MAGIC && self.magic_footer == COLOR_MAGIC
    }
}

/// Borrowed view of a committed color frame.
#[derive(Debug, Clone, Copy)]
pub struct ColorFrame<'a> {
    pub header: ColorHeader,
    pub footer: Option<ColorFooter>,
    pub jpeg: &'a [u8],
}

impl<'a> ColorFrame<'a> {
    /// Split a frame into header, JPEG payload and footer. Frames without a
    /// recognizable footer keep everything after the header as payload.
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        let header = ColorHeader::parse(frame)?;
        let body = &frame[COLOR_HEADER_SIZE..];
        let footer = ColorFooter::from_tail(body).filter(ColorFooter::is_valid);
        let jpeg = match footer {
            Some(footer) => {
                let end = body.len() - COLOR_FOOTER_SIZE;
                let filler = (footer.filler_length as usize).min(end);
                &body[..end - filler]
            }
            None => body,
        };
        Some(Self {
            header,
            footer,
            jpeg,
        })
    }
}

/// A committed frame copied out of the acquisition ring.
///
/// The ring slot is reused as soon as the callback returns, so the bytes are
/// copied once; clones after that share the same buffer.
#[derive(Clone)]
pub struct Frame {
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Arrival time on the acquisition thread
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub channel: Channel,
    pub sequence: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Device clock, if the frame carried a readable footer
    pub device_timestamp: Option<u32>,
}

/// Payload encodings produced by the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Jpeg,
    /// Ten subframes of packed 11-bit phase samples.
    DepthPacked11,
}

impl Frame {
    /// Copy a committed ring slot out of the acquisition thread.
    pub fn copy_from(channel: Channel, raw: &[u8]) -> Self {
        let (sequence, device_timestamp) = match channel {
            Channel::Depth => DepthFooter::of_frame(raw)
                .map(|f| (f.sequence, Some(f.timestamp)))
                .unwrap_or((0, None)),
            Channel::Color => ColorFrame::parse(raw)
                .map(|c| {
                    (
                        c.header.sequence,
                        c.footer.map(|footer| footer.timestamp),
                    )
                })
                .unwrap_or((0, None)),
        };
        let (width, height, format) = match channel {
            Channel::Depth => (DEPTH_WIDTH, DEPTH_HEIGHT, PixelFormat::DepthPacked11),
            Channel::Color => (COLOR_WIDTH, COLOR_HEIGHT, PixelFormat::Jpeg),
        };

        Frame {
            data: Bytes::copy_from_slice(raw),
            meta: Arc::new(FrameMetadata {
                channel,
                sequence,
                width: width as u32,
                height: height as u32,
                format,
                device_timestamp,
            }),
            timestamp: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants() {
        assert_eq!(DEPTH_IMAGE_SIZE, 298_496);
        assert_eq!(DEPTH_FOOTER_SIZE, 152);
        assert_eq!(DEPTH_SUBFRAME_SIZE, 298_648);
        assert_eq!(DEPTH_FRAME_SIZE, 2_986_480);
        assert_eq!(COLOR_HEADER_SIZE, 8);
        assert_eq!(COLOR_FOOTER_SIZE, 56);
    }

    #[test]
    fn depth_footer_validity() {
        let mut footer = DepthFooter::new(7, 9, 1234);
        assert!(footer.is_valid());

        let parsed = DepthFooter::parse(footer.as_bytes()).unwrap();
        assert_eq!(parsed, footer);

        footer.subsequence = 10;
        assert!(!footer.is_valid());
        footer.subsequence = 3;
        footer.magic1 = 8;
        assert!(!footer.is_valid());
    }

    #[test]
    fn depth_footer_of_frame_reads_last_subframe() {
        let mut frame = vec![0u8; DEPTH_FRAME_SIZE];
        let offset = DEPTH_SUBFRAME_SIZE * 9 + DEPTH_IMAGE_SIZE;
        frame[offset..offset + DEPTH_FOOTER_SIZE]
            .copy_from_slice(DepthFooter::new(42, 9, 99).as_bytes());

        let footer = DepthFooter::of_frame(&frame).unwrap();
        assert_eq!(footer.sequence, 42);
        assert_eq!(footer.timestamp, 99);
        assert!(DepthFooter::of_frame(&frame[1..]).is_none());
    }

    #[test]
    fn color_frame_strips_header_footer_and_filler() {
        let footer = ColorFooter {
            magic_header: COLOR_FOOTER_MAGIC,
            sequence: 5,
            filler_length: 2,
            unknown1: 0,
            unknown2: 0,
            timestamp: 77,
            exposure: 1.0,
            gain: 1.0,
            magic_footer: COLOR_MAGIC,
            packet_size: 0,
            unknown3: 0.0,
            unknown4: [0; 3],
        };
        let mut raw = ColorHeader::new(5).as_bytes().to_vec();
        raw.extend_from_slice(b"JPEG");
        raw.extend_from_slice(&[0, 0]);
        raw.extend_from_slice(bytemuck::bytes_of(&footer));

        let frame = ColorFrame::parse(&raw).unwrap();
        assert!(frame.header.is_valid());
        assert_eq!(frame.jpeg, b"JPEG");
        assert_eq!(frame.footer.map(|f| f.timestamp), Some(77));

        let copied = Frame::copy_from(Channel::Color, &raw);
        assert_eq!(copied.meta.sequence, 5);
        assert_eq!(copied.meta.device_timestamp, Some(77));
        assert_eq!(copied.data.len(), raw.len());
    }

    #[test]
    fn color_frame_without_footer_keeps_body() {
        let mut raw = ColorHeader::new(1).as_bytes().to_vec();
        raw.extend_from_slice(b"payload");
        let frame = ColorFrame::parse(&raw).unwrap();
        assert!(frame.footer.is_none());
        assert_eq!(frame.jpeg, b"payload");
        assert!(ColorFrame::parse(&raw[..4]).is_none());
    }

    #[test]
    fn copied_frame_outlives_the_slot() {
        let mut slot = ColorHeader::new(4).as_bytes().to_vec();
        slot.extend_from_slice(b"first");
        let frame = Frame::copy_from(Channel::Color, &slot);

        // The ring reuses the slot for the next frame.
        slot.fill(0);
        assert_eq!(&frame.data[8..], b"first");
        assert_eq!(frame.meta.sequence, 4);

        let shared = frame.clone();
        assert_eq!(shared.data.as_ptr(), frame.data.as_ptr());
    }
}
