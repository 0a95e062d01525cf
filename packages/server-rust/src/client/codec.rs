//! Stream framing for the client protocol.
//!
//! Frames are self-describing: the fixed header carries the total length,
//! so the decoder waits for `length` bytes and hands the command layer a
//! complete message. Oversized or malformed headers poison the connection.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use memberd_core::client::{ClientHeader, CLIENT_HEADER_SIZE};
use memberd_core::MAX_CLUSTER_MESSAGE;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on one frame: the largest cluster payload plus generous
/// headroom for the reply structures.
const MAX_FRAME: usize = MAX_CLUSTER_MESSAGE + 4096;

/// One complete client-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub header: ClientHeader,
    pub body: Bytes,
}

/// Framing codec for the unix-stream endpoints.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = ClientFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientFrame>, io::Error> {
        if src.len() < CLIENT_HEADER_SIZE {
            return Ok(None);
        }

        let header = {
            let mut peek = &src[..CLIENT_HEADER_SIZE];
            ClientHeader::decode(&mut peek)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        };

        let total = header.length as usize;
        if total > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {total} bytes exceeds limit"),
            ));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(CLIENT_HEADER_SIZE);
        Ok(Some(ClientFrame {
            header,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<Bytes> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use memberd_core::client::{cmd, encode_status_reply, status};

    use super::*;

    #[test]
    fn decodes_a_complete_frame() {
        let wire = encode_status_reply(cmd::IS_QUORATE, status::OK);
        let mut buf = BytesMut::from(&wire[..]);

        let frame = ClientCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.command, cmd::IS_QUORATE | 0x4000_0000);
        assert_eq!(frame.body.len(), 4);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frames() {
        let wire = encode_status_reply(cmd::IS_QUORATE, status::OK);
        let mut buf = BytesMut::from(&wire[..CLIENT_HEADER_SIZE + 1]);

        assert!(ClientCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[CLIENT_HEADER_SIZE + 1..]);
        assert!(ClientCodec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn short_header_waits() {
        let mut buf = BytesMut::from(&[0u8; 5][..]);
        assert!(ClientCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut wire = encode_status_reply(cmd::IS_QUORATE, status::OK);
        wire[0] = 0xFF;
        let mut buf = BytesMut::from(&wire[..]);
        assert!(ClientCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut wire = encode_status_reply(cmd::IS_QUORATE, status::OK);
        // Header length field is at offset 8.
        wire[8..12].copy_from_slice(&(10_000_000u32).to_le_bytes());
        let mut buf = BytesMut::from(&wire[..]);
        assert!(ClientCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_status_reply(cmd::IS_QUORATE, status::OK));
        buf.extend_from_slice(&encode_status_reply(cmd::IS_ACTIVE, status::OK));

        let first = ClientCodec.decode(&mut buf).unwrap().unwrap();
        let second = ClientCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.command & 0xFFFF, cmd::IS_QUORATE);
        assert_eq!(second.header.command & 0xFFFF, cmd::IS_ACTIVE);
    }
}
