//! Frame types passed between pipeline stages.
//!
//! [`RawFrame`] never leaves the capture thread; it is moved into the
//! encoder on submission. [`EncodedFrame`] is what travels through the
//! [`FrameQueue`](crate::FrameQueue) to the transmit thread.

use bytes::Bytes;

use crate::error::{PipelineError, Result};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI default).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// A captured, uncompressed image.
///
/// `data` holds `height` rows of `stride` bytes each. `stride` may exceed
/// `width * bytes_per_pixel` when the capture API pads rows.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Pixel rows, `stride * height` bytes.
    pub data: Vec<u8>,
    /// Microseconds since pipeline start at which the frame was requested.
    pub timestamp_us: u64,
}

impl RawFrame {
    /// Bytes of visible pixels in one row, without padding.
    pub fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Returns a row slice (including possible padding bytes), empty when
    /// `data` does not hold row `y`.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        self.data
            .get(start..start + self.stride as usize)
            .unwrap_or_default()
    }

    /// Check that `stride` and `data` actually hold `height` rows of
    /// `width` pixels.
    pub fn validate(&self) -> Result<()> {
        let row_len = self.row_len();
        if (self.stride as usize) < row_len {
            return Err(PipelineError::Encode(format!(
                "stride {} shorter than a {}-pixel row ({row_len} bytes)",
                self.stride, self.width
            )));
        }
        let needed = self.stride as usize * self.height as usize;
        if self.data.len() < needed {
            return Err(PipelineError::Encode(format!(
                "frame holds {} bytes, {}x{} with stride {} needs {needed}",
                self.data.len(),
                self.width,
                self.height,
                self.stride
            )));
        }
        Ok(())
    }

    /// Copy the visible pixels into a tightly packed buffer.
    ///
    /// Borrows `data` directly when there is no row padding. Rows the
    /// buffer does not fully cover are left out, so call
    /// [`validate`](Self::validate) first when a short frame is an error.
    pub fn packed(&self) -> std::borrow::Cow<'_, [u8]> {
        let row_len = self.row_len();
        let total = row_len * self.height as usize;
        if self.stride as usize == row_len {
            return std::borrow::Cow::Borrowed(&self.data[..total.min(self.data.len())]);
        }

        let mut out = Vec::with_capacity(total);
        for row in self.data.chunks(self.stride.max(1) as usize).take(self.height as usize) {
            match row.get(..row_len) {
                Some(pixels) => out.extend_from_slice(pixels),
                None => break,
            }
        }
        std::borrow::Cow::Owned(out)
    }
}

// ── AccessUnit ───────────────────────────────────────────────────

/// One compressed unit as an encoder hands it back, before normalisation.
///
/// `timestamp_us` is the timestamp of the submission that produced it,
/// which for a buffering encoder is earlier than the submission that
/// returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Start-code delimited or u32-length-prefixed bytes.
    pub data: Bytes,
    pub timestamp_us: u64,
}

impl AccessUnit {
    pub fn new(data: impl Into<Bytes>, timestamp_us: u64) -> Self {
        Self {
            data: data.into(),
            timestamp_us,
        }
    }
}

// ── EncodedFrame ─────────────────────────────────────────────────

/// One unit of output, ready for the wire.
///
/// Frames placed on the queue always carry a non-empty `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Start-code delimited elementary stream bytes.
    pub data: Bytes,
    /// Microseconds since pipeline start.
    pub timestamp_us: u64,
    /// True if `data` contains an IDR unit.
    pub is_keyframe: bool,
    /// Always false for video output.
    pub is_audio: bool,
}

impl EncodedFrame {
    /// A picture-bearing video frame.
    pub fn video(data: Bytes, timestamp_us: u64, is_keyframe: bool) -> Self {
        Self {
            data,
            timestamp_us,
            is_keyframe,
            is_audio: false,
        }
    }

    /// The out-of-band parameter-set frame sent once per run.
    pub fn parameter_sets(data: Bytes, timestamp_us: u64) -> Self {
        Self::video(data, timestamp_us, false)
    }
}

// ── Tests ────────────────────────────────────────────────────────
