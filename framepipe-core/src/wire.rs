//! Length-prefixed framing for the output channel.
//!
//! ## Wire format
//!
//! One message per encoded frame, back to back, little-endian:
//!
//! ```text
//! payload_size:   u32  (4)
//! timestamp_us:   u64  (8)
//! flags:          u8   (1)   bit0 = keyframe, bit1 = audio
//! data:           [u8] (payload_size)
//! ```
//!
//! [`FrameCodec`] implements both halves of `tokio_util::codec`, so a
//! consumer can wrap its end of the channel in `FramedRead`.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::PipelineError;
use crate::types::EncodedFrame;

// ── Constants ────────────────────────────────────────────────────

/// Largest payload the codec will encode or accept.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

// ── WireFlags ────────────────────────────────────────────────────

bitflags! {
    /// Per-frame flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WireFlags: u8 {
        const KEYFRAME = 0b0000_0001;
        const AUDIO    = 0b0000_0010;
    }
}

impl WireFlags {
    pub fn for_frame(frame: &EncodedFrame) -> Self {
        let mut flags = WireFlags::empty();
        flags.set(WireFlags::KEYFRAME, frame.is_keyframe);
        flags.set(WireFlags::AUDIO, frame.is_audio);
        flags
    }
}

// ── FrameHeader ──────────────────────────────────────────────────

/// Fixed-size prefix of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_size: u32,
    pub timestamp_us: u64,
    pub flags: WireFlags,
}

impl FrameHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 13;

    pub fn for_frame(frame: &EncodedFrame) -> Result<Self, PipelineError> {
        if frame.data.len() > MAX_PAYLOAD_SIZE {
            return Err(PipelineError::PayloadTooLarge {
                size: frame.data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            payload_size: frame.data.len() as u32,
            timestamp_us: frame.timestamp_us,
            flags: WireFlags::for_frame(frame),
        })
    }

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[12] = self.flags.bits();
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(mut data: &[u8]) -> Result<Self, PipelineError> {
        if data.len() < Self::SIZE {
            return Err(PipelineError::Other(format!(
                "FrameHeader too short: {} < {}",
                data.len(),
                Self::SIZE,
            )));
        }
        let payload_size = data.get_u32_le();
        let timestamp_us = data.get_u64_le();
        let raw_flags = data.get_u8();
        let flags = WireFlags::from_bits(raw_flags)
            .ok_or(PipelineError::ReservedFlags(raw_flags & !WireFlags::all().bits()))?;
        Ok(Self {
            payload_size,
            timestamp_us,
            flags,
        })
    }
}

// ── FrameCodec ───────────────────────────────────────────────────

/// Stateless codec for the channel byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<EncodedFrame> for FrameCodec {
    type Error = PipelineError;

    fn encode(&mut self, item: EncodedFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = FrameHeader::for_frame(&item)?;
        dst.reserve(FrameHeader::SIZE + item.data.len());
        dst.put_slice(&header.encode());
        dst.put_slice(&item.data);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = EncodedFrame;
    type Error = PipelineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let header = FrameHeader::decode(&src[..FrameHeader::SIZE])?;
        let size = header.payload_size as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(PipelineError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total = FrameHeader::SIZE + size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let data = src.split_to(size).freeze();
        Ok(Some(EncodedFrame {
            data,
            timestamp_us: header.timestamp_us,
            is_keyframe: header.flags.contains(WireFlags::KEYFRAME),
            is_audio: header.flags.contains(WireFlags::AUDIO),
        }))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample() -> EncodedFrame {
        EncodedFrame::video(Bytes::from_static(&[0x01, 0x02, 0x03]), 100, true)
    }

    #[test]
    fn encodes_exact_bytes() {
        let mut buf = BytesMut::new();
        FrameCodec.encode(sample(), &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[
                0x03, 0x00, 0x00, 0x00, // payload_size
                0x64, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // timestamp_us
                0x01, // flags
                0x01, 0x02, 0x03,
            ]
        );
    }

    #[test]
    fn decodes_what_it_encodes() {
        let mut buf = BytesMut::new();
        FrameCodec.encode(sample(), &mut buf).unwrap();
        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_waits() {
        let mut full = BytesMut::new();
        FrameCodec.encode(sample(), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..10]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[10..14]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[14..]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn audio_flag_bit() {
        let mut frame = sample();
        frame.is_keyframe = false;
        frame.is_audio = true;
        assert_eq!(FrameHeader::for_frame(&frame).unwrap().encode()[12], 0x02);
    }

    #[test]
    fn reserved_flags_rejected() {
        let mut bytes = FrameHeader::for_frame(&sample()).unwrap().encode();
        bytes[12] = 0x81;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(PipelineError::ReservedFlags(0x80))
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let header = FrameHeader {
            payload_size: (MAX_PAYLOAD_SIZE + 1) as u32,
            timestamp_us: 0,
            flags: WireFlags::empty(),
        };
        let mut buf = BytesMut::from(&header.encode()[..]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(PipelineError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn header_too_short() {
        assert!(FrameHeader::decode(&[0u8; 12]).is_err());
    }
}
