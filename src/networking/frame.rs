use std::convert::TryInto;

use crate::error::FrameError;
use crate::networking::message::MESSAGE_ID_SIZE;

pub const FRAME_LENGTH_SIZE: usize = 4;
pub const FRAME_CHANNEL_SIZE: usize = 2;
pub const FRAME_HEADER_SIZE: usize = FRAME_LENGTH_SIZE + FRAME_CHANNEL_SIZE;
/// Every payload starts with a message id, so anything shorter is invalid.
pub const MIN_PAYLOAD_LENGTH: usize = MESSAGE_ID_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub channel: u16,
}

/// A complete frame borrowed from a connection's inbound buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub channel: u16,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Number of buffered bytes this frame occupied.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Caller guarantees `payload.len()` fits in a u32; the pool rejects anything
/// over `max_message_length` before it gets here.
pub fn encode_frame(channel: u16, payload: &[u8]) -> Vec<u8> {
    let mut vbytes: Vec<u8> = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    vbytes.extend(&(payload.len() as u32).to_be_bytes());
    vbytes.extend(&channel.to_be_bytes());
    vbytes.extend(payload);
    vbytes
}

pub fn decode_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let length = u32::from_be_bytes(bytes[0..FRAME_LENGTH_SIZE].try_into().ok()?);
    let channel = u16::from_be_bytes(
        bytes[FRAME_LENGTH_SIZE..FRAME_HEADER_SIZE]
            .try_into()
            .ok()?,
    );
    Some(FrameHeader { length, channel })
}

/// Pulls the next frame off the front of `buffer`.
///
/// `Ok(None)` means more bytes are needed, either for the header or for the
/// payload. The declared length is checked as soon as the header is complete
/// so an oversized frame is rejected before we wait for its payload.
pub fn decode_frame(buffer: &[u8], max_message_length: usize) -> Result<Option<Frame<'_>>, FrameError> {
    let header = match decode_header(buffer) {
        Some(header) => header,
        None => return Ok(None),
    };
    let length = header.length as usize;
    if length < MIN_PAYLOAD_LENGTH || length > max_message_length {
        return Err(FrameError::InvalidLength {
            length: header.length,
            min: MIN_PAYLOAD_LENGTH,
            max: max_message_length,
        });
    }
    if buffer.len() < FRAME_HEADER_SIZE + length {
        return Ok(None);
    }
    Ok(Some(Frame {
        channel: header.channel,
        payload: &buffer[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length],
    }))
}
