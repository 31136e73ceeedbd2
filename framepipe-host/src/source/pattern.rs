//! Synthetic test-pattern source.
//!
//! Produces BGRA colour bars that scroll one step per frame, so an
//! encoder sees real motion. Available on every platform.

use std::time::Duration;

use framepipe_core::{FrameSource, PixelFormat, RawFrame, Result};

const BARS: [[u8; 4]; 8] = [
    [0xFF, 0xFF, 0xFF, 0xFF], // white
    [0x00, 0xFF, 0xFF, 0xFF], // yellow
    [0xFF, 0xFF, 0x00, 0xFF], // cyan
    [0x00, 0xFF, 0x00, 0xFF], // green
    [0xFF, 0x00, 0xFF, 0xFF], // magenta
    [0x00, 0x00, 0xFF, 0xFF], // red
    [0xFF, 0x00, 0x00, 0xFF], // blue
    [0x00, 0x00, 0x00, 0xFF], // black
];

/// Pixels the pattern shifts per frame.
const STEP: u32 = 4;

pub struct PatternSource {
    width: u32,
    height: u32,
    frame: u64,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame: 0,
        }
    }

    fn render(&self) -> Vec<u8> {
        let bpp = PixelFormat::Bgra8.bytes_per_pixel();
        let bar_width = (self.width / BARS.len() as u32).max(1);
        let shift = (self.frame * u64::from(STEP) % u64::from(self.width)) as u32;

        let mut row = Vec::with_capacity(self.width as usize * bpp);
        for x in 0..self.width {
            let bar = ((x + shift) % self.width / bar_width) as usize % BARS.len();
            row.extend_from_slice(&BARS[bar]);
        }

        let mut data = Vec::with_capacity(row.len() * self.height as usize);
        for _ in 0..self.height {
            data.extend_from_slice(&row);
        }
        data
    }
}

impl FrameSource for PatternSource {
    fn acquire(&mut self, _timeout: Duration) -> Result<Option<RawFrame>> {
        let data = self.render();
        self.frame += 1;
        Ok(Some(RawFrame {
            width: self.width,
            height: self.height,
            stride: self.width * PixelFormat::Bgra8.bytes_per_pixel() as u32,
            format: PixelFormat::Bgra8,
            data,
            timestamp_us: 0,
        }))
    }

    fn name(&self) -> &str {
        "test-pattern"
    }
}
