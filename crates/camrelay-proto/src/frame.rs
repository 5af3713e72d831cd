use bytes::{BufMut, Bytes, BytesMut};

use crate::ProtoError;

/// Legacy header: `u32 frame_id`, `f32 timestamp`, remainder is the color
/// JPEG.
pub const LEGACY_HEADER_LEN: usize = 8;

/// Long-form header adds `u8 has_color`, `u8 has_depth` flag bytes.
pub const BASE_HEADER_LEN: usize = 10;

pub const DEFAULT_DEPTH_SCALE: f32 = 0.001;

/// A decoded producer uplink frame. Payloads are zero-copy slices of the
/// received message.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFrame {
    pub frame_id: u32,
    pub timestamp: f32,
    pub color: Option<Bytes>,
    pub depth: Option<DepthBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthBlock {
    pub data: Bytes,
    pub scale: f32,
}

/// Decodes a binary frame, accepting both the long form and the legacy
/// 8-byte short form.
///
/// Discrimination: the long form requires both flag bytes at offsets 8-9
/// to be 0 or 1. A legacy body is a JPEG starting `0xFF 0xD8` at offset 8,
/// so the two forms cannot collide.
pub fn decode_binary_frame(payload: &Bytes) -> Result<BinaryFrame, ProtoError> {
    if payload.len() < LEGACY_HEADER_LEN {
        return Err(ProtoError::FrameTooShort(payload.len()));
    }

    let frame_id = read_u32(payload, 0, "frame id")?;
    let timestamp = read_f32(payload, 4, "timestamp")?;

    if !is_long_form(payload) {
        let color = payload.slice(LEGACY_HEADER_LEN..);
        return Ok(BinaryFrame {
            frame_id,
            timestamp,
            color: Some(color),
            depth: None,
        });
    }

    let has_color = payload[8] == 1;
    let has_depth = payload[9] == 1;
    let mut pos = BASE_HEADER_LEN;

    let color = if has_color {
        let length = read_u32(payload, pos, "color length")? as usize;
        pos += 4;
        let data = read_slice(payload, pos, length, "color data")?;
        pos += length;
        Some(data)
    } else {
        None
    };

    let depth = if has_depth {
        let length = read_u32(payload, pos, "depth length")? as usize;
        pos += 4;
        let data = read_slice(payload, pos, length, "depth data")?;
        pos += length;
        let scale = read_f32(payload, pos, "depth scale")?;
        Some(DepthBlock { data, scale })
    } else {
        None
    };

    Ok(BinaryFrame { frame_id, timestamp, color, depth })
}

/// Encodes a frame in the long form, mirroring `decode_binary_frame`.
pub fn encode_binary_frame(frame: &BinaryFrame) -> Bytes {
    let color_len = frame.color.as_ref().map_or(0, Bytes::len);
    let depth_len = frame.depth.as_ref().map_or(0, |block| block.data.len());
    let mut buf =
        BytesMut::with_capacity(BASE_HEADER_LEN + 8 + color_len + depth_len + 4);

    buf.put_u32_le(frame.frame_id);
    buf.put_f32_le(frame.timestamp);
    buf.put_u8(u8::from(frame.color.is_some()));
    buf.put_u8(u8::from(frame.depth.is_some()));

    if let Some(color) = &frame.color {
        buf.put_u32_le(color.len() as u32);
        buf.put_slice(color);
    }

    if let Some(depth) = &frame.depth {
        buf.put_u32_le(depth.data.len() as u32);
        buf.put_slice(&depth.data);
        buf.put_f32_le(depth.scale);
    }

    buf.freeze()
}

fn is_long_form(payload: &Bytes) -> bool {
    payload.len() >= BASE_HEADER_LEN && payload[8] <= 1 && payload[9] <= 1
}

fn read_u32(
    payload: &Bytes,
    pos: usize,
    field: &'static str,
) -> Result<u32, ProtoError> {
    let raw = read_array::<4>(payload, pos, field)?;
    Ok(u32::from_le_bytes(raw))
}

fn read_f32(
    payload: &Bytes,
    pos: usize,
    field: &'static str,
) -> Result<f32, ProtoError> {
    let raw = read_array::<4>(payload, pos, field)?;
    Ok(f32::from_le_bytes(raw))
}

fn read_array<const N: usize>(
    payload: &Bytes,
    pos: usize,
    field: &'static str,
) -> Result<[u8; N], ProtoError> {
    let end = pos
        .checked_add(N)
        .filter(|end| *end <= payload.len())
        .ok_or(ProtoError::FrameTruncated(field))?;

    let mut raw = [0_u8; N];
    raw.copy_from_slice(&payload[pos..end]);
    Ok(raw)
}

fn read_slice(
    payload: &Bytes,
    pos: usize,
    length: usize,
    field: &'static str,
) -> Result<Bytes, ProtoError> {
    let end = pos
        .checked_add(length)
        .filter(|end| *end <= payload.len())
        .ok_or(ProtoError::FrameTruncated(field))?;

    Ok(payload.slice(pos..end))
}
