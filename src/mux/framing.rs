//! Per-message wire framing.
//!
//! Every enqueued message is framed with a transport marker so TCP
//! streams and UDP datagrams share one layout family:
//!
//! ```text
//! TCP: [u8 is_udp=0][i32 length][payload]
//! UDP: [u8 is_udp=1][i32 transmission_id][i32 length][payload]
//! ```
//!
//! The UDP transmission id increments per registration per send; it lets
//! a receiver detect duplicate or out-of-order datagrams. The sender
//! only stamps — discard policy is the receiver's choice.

use bytes::Bytes;

use crate::buffer::ByteFrame;
use crate::error::{constants, PeermuxError, Result};

/// Marker + length prefix.
pub const TCP_HEADER_LEN: usize = 5;

/// Marker + transmission id + length prefix.
pub const UDP_HEADER_LEN: usize = 9;

/// Frame a payload for a TCP stream.
pub fn frame_tcp_message(payload: &[u8]) -> Bytes {
    let mut frame = ByteFrame::with_capacity(TCP_HEADER_LEN + payload.len());
    frame.put_bool(false);
    frame.put_i32(payload.len() as i32);
    frame.put_slice(payload);
    frame.flip();
    Bytes::from(frame.take_remaining())
}

/// Frame a payload for a UDP datagram with its transmission stamp.
pub fn frame_udp_message(transmission_id: i32, payload: &[u8]) -> Bytes {
    let mut frame = ByteFrame::with_capacity(UDP_HEADER_LEN + payload.len());
    frame.put_bool(true);
    frame.put_i32(transmission_id);
    frame.put_i32(payload.len() as i32);
    frame.put_slice(payload);
    frame.flip();
    Bytes::from(frame.take_remaining())
}

/// Extract the next complete TCP frame from a read-positioned inbox.
///
/// Returns `Ok(None)` with the cursor untouched while the frame is
/// incomplete. A UDP marker on a stream, a negative length, or a length
/// above `max_frame_len` is a protocol violation — fatal for the
/// connection, since the stream can never resynchronize.
pub fn extract_tcp_frame(
    inbox: &mut ByteFrame,
    max_frame_len: usize,
) -> Result<Option<ByteFrame>> {
    if inbox.remaining() < TCP_HEADER_LEN {
        return Ok(None);
    }
    let mark = inbox.position();
    let marker = inbox.get_u8()?;
    if marker != 0 {
        return Err(PeermuxError::ProtocolViolation(
            constants::ERR_BAD_TRANSPORT_MARK.into(),
        ));
    }
    let length = inbox.get_i32()?;
    if length < 0 {
        return Err(PeermuxError::ProtocolViolation(
            constants::ERR_NEGATIVE_LENGTH.into(),
        ));
    }
    let length = length as usize;
    if length > max_frame_len {
        return Err(PeermuxError::OversizedFrame(length));
    }
    if inbox.remaining() < length {
        inbox.set_position(mark)?;
        return Ok(None);
    }
    Ok(Some(ByteFrame::from_vec(inbox.get_bytes(length)?)))
}

/// Parse one received datagram. Datagrams are self-contained; anything
/// short or mismatched is a protocol violation.
pub fn parse_udp_datagram(datagram: &[u8]) -> Result<(i32, Bytes)> {
    let mut frame = ByteFrame::from_slice(datagram);
    if frame.remaining() < UDP_HEADER_LEN {
        return Err(PeermuxError::ProtocolViolation(
            "Truncated datagram header".into(),
        ));
    }
    let marker = frame.get_u8()?;
    if marker != 1 {
        return Err(PeermuxError::ProtocolViolation(
            constants::ERR_BAD_TRANSPORT_MARK.into(),
        ));
    }
    let transmission_id = frame.get_i32()?;
    let length = frame.get_i32()?;
    if length < 0 {
        return Err(PeermuxError::ProtocolViolation(
            constants::ERR_NEGATIVE_LENGTH.into(),
        ));
    }
    if frame.remaining() != length as usize {
        return Err(PeermuxError::ProtocolViolation(
            "Datagram length does not match payload".into(),
        ));
    }
    Ok((transmission_id, Bytes::from(frame.take_remaining())))
}
