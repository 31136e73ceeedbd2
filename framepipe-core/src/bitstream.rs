//! Elementary-stream normalisation.
//!
//! Encoders hand back either start-code delimited units (`00 00 00 01`)
//! or container-style units prefixed with their length, and parameter
//! sets either inline or as a decoder-configuration record. Everything
//! leaving this module is start-code delimited.
//!
//! ## Decoder-configuration record
//!
//! ```text
//! header:          [u8; 5]
//! leading_count:   u8        (low 5 bits)
//! leading_sets:    { len: u16 BE, data: [u8; len] } * leading_count
//! trailing_count:  u8
//! trailing_sets:   { len: u16 BE, data: [u8; len] } * trailing_count
//! ```
//!
//! ## Length-prefixed units
//!
//! ```text
//! { len: u32 BE, data: [u8; len] } *
//! ```
//!
//! All functions here are pure and only called from the capture thread.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PipelineError, Result};

// ── Constants ────────────────────────────────────────────────────

/// Canonical 4-byte start code.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit type of a non-IDR slice; types up to IDR are all slices.
pub const NAL_TYPE_SLICE: u8 = 1;

/// NAL unit type of an IDR picture.
pub const NAL_TYPE_IDR: u8 = 5;

/// NAL unit type of an access-unit delimiter.
pub const NAL_TYPE_AUD: u8 = 9;

const NAL_TYPE_MASK: u8 = 0x1F;

/// Fixed bytes before the leading parameter-set count.
const CONFIG_HEADER_LEN: usize = 5;

/// Smallest record that can hold a header, a count and one length.
const MIN_CONFIG_RECORD_LEN: usize = 7;

// ── StartCodes ───────────────────────────────────────────────────

/// A start code found in a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCode {
    /// Offset of the first zero byte.
    pub offset: usize,
    /// 3 or 4.
    pub len: usize,
}

impl StartCode {
    /// Offset of the NAL header byte that follows the start code.
    pub fn payload_offset(&self) -> usize {
        self.offset + self.len
    }
}

/// Iterator over every 3- and 4-byte start code in a buffer.
pub struct StartCodes<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Iterator for StartCodes<'_> {
    type Item = StartCode;

    fn next(&mut self) -> Option<StartCode> {
        let data = self.data;
        while self.pos + 3 <= data.len() {
            let i = self.pos;
            if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 {
                self.pos = i + 3;
                let code = if i > 0 && data[i - 1] == 0x00 {
                    StartCode {
                        offset: i - 1,
                        len: 4,
                    }
                } else {
                    StartCode { offset: i, len: 3 }
                };
                return Some(code);
            }
            self.pos += 1;
        }
        None
    }
}

/// Scan `data` for start codes.
pub fn start_codes(data: &[u8]) -> StartCodes<'_> {
    StartCodes { data, pos: 0 }
}

/// NAL unit type of the unit introduced by `code`, if a header byte follows.
pub fn nal_type_after(data: &[u8], code: &StartCode) -> Option<u8> {
    data.get(code.payload_offset()).map(|b| b & NAL_TYPE_MASK)
}

// ── Conversions ──────────────────────────────────────────────────

/// Convert a decoder-configuration record into start-code delimited
/// parameter sets.
///
/// A declared length running past the end stops the parse; whatever was
/// converted before that point is returned. Producing nothing is an error.
pub fn convert_parameter_set_blob(blob: &[u8]) -> Result<Bytes> {
    if blob.len() < MIN_CONFIG_RECORD_LEN {
        return Err(PipelineError::Normalization(
            "parameter-set record shorter than 7 bytes",
        ));
    }

    let mut cur = &blob[CONFIG_HEADER_LEN..];
    let mut out = BytesMut::with_capacity(blob.len() + 2 * START_CODE.len());

    let leading = (cur.get_u8() & NAL_TYPE_MASK) as usize;
    if copy_sets(&mut cur, leading, &mut out) && cur.has_remaining() {
        let trailing = cur.get_u8() as usize;
        copy_sets(&mut cur, trailing, &mut out);
    }

    if out.is_empty() {
        return Err(PipelineError::Normalization(
            "parameter-set record contained no complete set",
        ));
    }
    Ok(out.freeze())
}

/// Copy `count` u16-length-prefixed sets. Returns false on truncation.
fn copy_sets(cur: &mut &[u8], count: usize, out: &mut BytesMut) -> bool {
    for _ in 0..count {
        if cur.remaining() < 2 {
            return false;
        }
        let len = cur.get_u16() as usize;
        if cur.remaining() < len {
            return false;
        }
        out.put_slice(&START_CODE);
        out.put_slice(&cur[..len]);
        cur.advance(len);
    }
    true
}

/// Convert u32-length-prefixed units into start-code delimited units.
///
/// A trailing fragment shorter than its declared length is dropped.
/// Producing nothing is an error.
pub fn convert_length_prefixed_units(blob: &[u8]) -> Result<Bytes> {
    let mut cur = blob;
    let mut out = BytesMut::with_capacity(blob.len());

    while cur.remaining() >= 4 {
        let len = u32::from_be_bytes([cur[0], cur[1], cur[2], cur[3]]) as usize;
        if len > cur.remaining() - 4 {
            break;
        }
        cur.advance(4);
        out.put_slice(&START_CODE);
        out.put_slice(&cur[..len]);
        cur.advance(len);
    }

    if out.is_empty() {
        return Err(PipelineError::Normalization(
            "no complete length-prefixed unit",
        ));
    }
    Ok(out.freeze())
}

/// True if `data` opens with a 3- or 4-byte start code.
pub fn is_already_start_coded(data: &[u8]) -> bool {
    match data {
        [0x00, 0x00, 0x01, ..] => true,
        [0x00, 0x00, 0x00, 0x01, ..] => true,
        _ => false,
    }
}

/// True if any unit in `data` is an IDR picture.
pub fn detect_keyframe(data: &[u8]) -> bool {
    start_codes(data).any(|code| nal_type_after(data, &code) == Some(NAL_TYPE_IDR))
}

/// Bring one encoder access unit into canonical form.
pub fn normalize_access_unit(unit: Bytes) -> Result<Bytes> {
    if is_already_start_coded(&unit) {
        return Ok(unit);
    }
    convert_length_prefixed_units(&unit)
}

/// Bring an encoder parameter-set blob into canonical form.
pub fn normalize_parameter_sets(blob: Bytes) -> Result<Bytes> {
    if is_already_start_coded(&blob) {
        return Ok(blob);
    }
    convert_parameter_set_blob(&blob)
}

// ── Access-unit splitting ────────────────────────────────────────

/// Split complete access units off the front of a start-coded stream.
///
/// Units are cut at access-unit delimiters. The bytes from the last
/// delimiter onward stay in `buf` until the next delimiter arrives.
/// Anything before the first delimiter comes back as a unit of its own,
/// which [`begins_access_unit`] tells apart from a whole one.
pub fn split_access_units(buf: &mut BytesMut) -> Vec<Bytes> {
    let data: &[u8] = &buf[..];
    let cuts: Vec<usize> = start_codes(data)
        .filter(|code| code.offset > 0 && nal_type_after(data, code) == Some(NAL_TYPE_AUD))
        .map(|code| code.offset)
        .collect();

    let mut units = Vec::with_capacity(cuts.len());
    let mut consumed = 0;
    for cut in cuts {
        units.push(buf.split_to(cut - consumed).freeze());
        consumed = cut;
    }
    units
}

/// True if `data` opens with an access-unit delimiter.
pub fn begins_access_unit(data: &[u8]) -> bool {
    start_codes(data)
        .next()
        .is_some_and(|code| code.offset == 0 && nal_type_after(data, &code) == Some(NAL_TYPE_AUD))
}

/// True if `data` carries at least one coded slice.
pub fn contains_picture(data: &[u8]) -> bool {
    start_codes(data).any(|code| {
        matches!(nal_type_after(data, &code), Some(t) if (NAL_TYPE_SLICE..=NAL_TYPE_IDR).contains(&t))
    })
}

// ── Tests ────────────────────────────────────────────────────────
