//! Datagram framing: the one-byte tag, the GENERAL payload, and the STREAM
//! frame body (ack + sequenced items + terminator), per spec §6.
//!
//! ```text
//! byte 0:         tag (u8)    0 = GENERAL, 1 = STREAM
//! bytes 1..N:     payload
//! ```
//!
//! A STREAM payload is:
//!
//! ```text
//! u16 ack
//! repeat:
//!   u16 seq      // 0 terminates; 0xFFFF is the close sentinel
//!   item         // present iff seq not in {0, 0xFFFF}
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{RelayStreamError, Result};
use crate::oracle::{Message, Oracle};

/// `seq = 0` terminates a STREAM frame's item list.
pub const SEQ_TERMINATOR: u16 = 0;
/// `seq = 0xFFFF` is the close sentinel: no further items, sender is closing.
pub const SEQ_CLOSE: u16 = 0xFFFF;

/// One-byte datagram tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramTag {
    General = 0,
    Stream = 1,
}

impl TryFrom<u8> for DatagramTag {
    type Error = RelayStreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DatagramTag::General),
            1 => Ok(DatagramTag::Stream),
            other => Err(RelayStreamError::UnknownTag(other)),
        }
    }
}

/// Split a raw datagram into its tag and payload slice.
pub fn decode_datagram_tag(data: &[u8]) -> Result<(DatagramTag, &[u8])> {
    if data.is_empty() {
        return Err(RelayStreamError::FrameTooShort {
            expected: 1,
            actual: 0,
        });
    }
    let tag = DatagramTag::try_from(data[0])?;
    Ok((tag, &data[1..]))
}

/// Encode a connectionless GENERAL datagram: tag + one Oracle-encoded message.
pub fn encode_general_datagram(oracle: &dyn Oracle, msg: &dyn Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(DatagramTag::General as u8);
    oracle.encode(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// One decoded STREAM frame body.
pub struct DecodedStreamFrame {
    /// Highest contiguous seq the sender claims to have observed from us.
    pub ack: u16,
    /// Items carried in this frame, in wire order.
    pub items: Vec<(u16, Box<dyn Message>)>,
    /// Whether this frame's sender signalled it is closing (`seq == 0xFFFF`).
    pub remote_closing: bool,
}

/// Decode a STREAM frame body (everything after the tag byte).
pub fn decode_stream_frame(oracle: &dyn Oracle, data: &[u8]) -> Result<DecodedStreamFrame> {
    if data.len() < 2 {
        return Err(RelayStreamError::FrameTooShort {
            expected: 2,
            actual: data.len(),
        });
    }
    let ack = (&data[0..2]).get_u16();
    let mut cursor = 2usize;
    let mut items = Vec::new();
    let mut remote_closing = false;

    loop {
        if data.len() < cursor + 2 {
            return Err(RelayStreamError::FrameTooShort {
                expected: cursor + 2,
                actual: data.len(),
            });
        }
        let seq = (&data[cursor..cursor + 2]).get_u16();
        cursor += 2;
        if seq == SEQ_TERMINATOR {
            break;
        }
        if seq == SEQ_CLOSE {
            remote_closing = true;
            break;
        }
        let (msg, consumed) = oracle.decode(&data[cursor..])?;
        cursor += consumed;
        items.push((seq, msg));
    }

    Ok(DecodedStreamFrame {
        ack,
        items,
        remote_closing,
    })
}

/// Result of encoding one outbound STREAM frame.
pub struct EncodedStreamFrame {
    pub bytes: Bytes,
    /// Number of pending items actually written into this frame (from the
    /// front of the caller's pending list).
    pub items_written: usize,
    /// Whether the close sentinel (`0xFFFF`) was written.
    pub wrote_close_sentinel: bool,
}

/// Encode one outbound STREAM frame body: `ack` followed by as many of
/// `items` as fit under `max_len`, followed by the terminator.
///
/// Uses the mark/revert discipline from spec §4.1: before each item the
/// cursor is recorded; if the item would push the frame past `max_len`, the
/// cursor is reverted and encoding stops — the item stays in the caller's
/// pending queue for a later frame. The close sentinel is written only when
/// every item in `items` (i.e. the caller's entire pending queue) fit into
/// this one frame; otherwise the normal terminator is written and the
/// sentinel is deferred to a frame that can fit the rest.
pub fn encode_stream_frame<'a, I>(
    oracle: &dyn Oracle,
    ack: u16,
    items: I,
    total_pending: usize,
    closing: bool,
    max_len: usize,
) -> EncodedStreamFrame
where
    I: IntoIterator<Item = (u16, &'a dyn Message)>,
{
    let mut buf = BytesMut::with_capacity(max_len.min(4096));
    buf.put_u16(ack);

    let mut written = 0usize;
    for (seq, msg) in items {
        let mark = buf.len();
        buf.put_u16(seq);
        if let Err(err) = oracle.encode(msg, &mut buf) {
            debug!(seq, error = %err, "mid-buffer serialization failure, item stays pending");
            buf.truncate(mark);
            break;
        }
        if buf.len() > max_len {
            buf.truncate(mark);
            break;
        }
        written += 1;
    }

    let wrote_close_sentinel = closing && written == total_pending;
    buf.put_u16(if wrote_close_sentinel {
        SEQ_CLOSE
    } else {
        SEQ_TERMINATOR
    });

    EncodedStreamFrame {
        bytes: buf.freeze(),
        items_written: written,
        wrote_close_sentinel,
    }
}

/// Prefix an encoded STREAM frame body with its datagram tag.
pub fn tag_stream_datagram(body: Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(DatagramTag::Stream as u8);
    buf.put_slice(&body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Registry;
    use std::any::Any;

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Text(String);

    const TEXT_TYPE: u32 = 1;

    impl Message for Text {
        fn type_id(&self) -> u32 {
            TEXT_TYPE
        }
        fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
            buf.put_slice(self.0.as_bytes());
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry() -> Registry {
        let reg = Registry::new();
        reg.register(TEXT_TYPE, |data| {
            Ok(Box::new(Text(String::from_utf8_lossy(data).into_owned())))
        });
        reg
    }

    #[test]
    fn tag_round_trip() {
        let (tag, rest) = decode_datagram_tag(&[1, 9, 9]).unwrap();
        assert_eq!(tag, DatagramTag::Stream);
        assert_eq!(rest, &[9, 9]);
    }

    #[test]
    fn empty_frame_has_only_ack_and_terminator() {
        let reg = registry();
        let encoded = encode_stream_frame(&reg, 3, std::iter::empty(), 0, false, 1400);
        let decoded = decode_stream_frame(&reg, &encoded.bytes).unwrap();
        assert_eq!(decoded.ack, 3);
        assert!(decoded.items.is_empty());
        assert!(!decoded.remote_closing);
    }

    #[test]
    fn frame_with_items_decodes_in_order() {
        let reg = registry();
        let a = Text("a".into());
        let b = Text("b".into());
        let items: Vec<(u16, &dyn Message)> = vec![(1, &a), (2, &b)];
        let encoded = encode_stream_frame(&reg, 0, items, 2, false, 1400);
        assert_eq!(encoded.items_written, 2);
        assert!(!encoded.wrote_close_sentinel);

        let decoded = decode_stream_frame(&reg, &encoded.bytes).unwrap();
        assert_eq!(decoded.items.len(), 2);
        assert_eq!(decoded.items[0].0, 1);
        assert_eq!(decoded.items[1].0, 2);
    }

    #[test]
    fn close_sentinel_only_written_when_all_pending_fit() {
        let reg = registry();
        let a = Text("a".into());
        // total_pending=2 but only 1 item handed to the encoder this round.
        let items: Vec<(u16, &dyn Message)> = vec![(1, &a)];
        let encoded = encode_stream_frame(&reg, 0, items, 2, true, 1400);
        assert!(!encoded.wrote_close_sentinel);

        let decoded = decode_stream_frame(&reg, &encoded.bytes).unwrap();
        assert!(!decoded.remote_closing);
    }

    #[test]
    fn close_sentinel_written_when_pending_fully_drained() {
        let reg = registry();
        let a = Text("a".into());
        let items: Vec<(u16, &dyn Message)> = vec![(1, &a)];
        let encoded = encode_stream_frame(&reg, 0, items, 1, true, 1400);
        assert!(encoded.wrote_close_sentinel);

        let decoded = decode_stream_frame(&reg, &encoded.bytes).unwrap();
        assert!(decoded.remote_closing);
    }

    #[test]
    fn buffer_bounded_frame_retains_remainder() {
        let reg = registry();
        // Each item ~ header(2) + type(4) + len(4) + 50 bytes body = 60 bytes.
        let payload = "x".repeat(50);
        let msgs: Vec<Text> = (0..10).map(|_| Text(payload.clone())).collect();
        let items: Vec<(u16, &dyn Message)> = msgs
            .iter()
            .enumerate()
            .map(|(i, m)| ((i + 1) as u16, m as &dyn Message))
            .collect();

        // Budget for ack(2) + ~4 items + terminator(2).
        let max_len = 2 + 60 * 4 + 2;
        let encoded = encode_stream_frame(&reg, 0, items, 10, false, max_len);
        assert!(encoded.items_written < 10);
        assert!(encoded.items_written > 0);
        assert!(!encoded.wrote_close_sentinel);
    }

    #[test]
    fn general_datagram_round_trip() {
        let reg = registry();
        let msg = Text("hello".into());
        let datagram = encode_general_datagram(&reg, &msg).unwrap();
        let (tag, rest) = decode_datagram_tag(&datagram).unwrap();
        assert_eq!(tag, DatagramTag::General);
        let (decoded, _) = reg.decode(rest).unwrap();
        assert_eq!(
            decoded.as_any().downcast_ref::<Text>().unwrap(),
            &Text("hello".into())
        );
    }
}
