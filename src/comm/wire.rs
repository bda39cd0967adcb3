// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The p2p wire frame:
//! `session_id_len:u32 ‖ session_id ‖ protocol:u8 ‖ payload_len:u32 ‖
//! payload`, all integers big-endian. Sender identity is implied by the
//! authenticated connection the frame arrives on.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Protocol;

/// Upper bound on the session id length.
const MAX_SESSION_ID: usize = 256;
/// Upper bound on one protocol payload.
const MAX_PAYLOAD: usize = 1 << 20;

/// One framed committee message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// The session the message belongs to.
    pub session_id: String,
    /// The protocol the payload speaks.
    pub protocol: Protocol,
    /// The opaque protocol payload.
    pub payload: Vec<u8>,
}

/// Encoder/decoder of [`WireMessage`] frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

fn invalid(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

impl Encoder<WireMessage> for WireCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        item: WireMessage,
        dst: &mut BytesMut,
    ) -> std::io::Result<()> {
        if item.session_id.len() > MAX_SESSION_ID {
            return Err(invalid("session id too long"));
        }
        if item.payload.len() > MAX_PAYLOAD {
            return Err(invalid("payload too large"));
        }
        dst.reserve(4 + item.session_id.len() + 1 + 4 + item.payload.len());
        dst.put_u32(item.session_id.len() as u32);
        dst.put_slice(item.session_id.as_bytes());
        dst.put_u8(item.protocol as u8);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::io::Result<Option<WireMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let sid_len =
            u32::from_be_bytes(src[0..4].try_into().expect("4 bytes"))
                as usize;
        if sid_len > MAX_SESSION_ID {
            return Err(invalid("session id too long"));
        }
        let header = 4 + sid_len + 1 + 4;
        if src.len() < header {
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes(
            src[4 + sid_len + 1..header].try_into().expect("4 bytes"),
        ) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(invalid("payload too large"));
        }
        let total = header + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total);
        let session_id =
            std::str::from_utf8(&frame[4..4 + sid_len])
                .map_err(|_| invalid("session id is not utf-8"))?
                .to_string();
        let protocol = Protocol::try_from(frame[4 + sid_len])
            .map_err(|_| invalid("unknown protocol"))?;
        let payload = frame[header..].to_vec();
        Ok(Some(WireMessage {
            session_id,
            protocol,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WireMessage {
        WireMessage {
            session_id: "signing-abcdef".to_string(),
            protocol: Protocol::Tss,
            payload: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn round_trips_one_frame() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_frames_split_across_reads() {
        let mut codec = WireCodec;
        let mut encoded = BytesMut::new();
        codec.encode(sample(), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(3) {
            assert!(codec.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(chunk);
        }
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        let a = sample();
        let b = WireMessage {
            session_id: "keygen-00".to_string(),
            protocol: Protocol::SessionStart,
            payload: vec![],
        };
        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_unknown_protocols() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        // corrupt the protocol byte
        let sid_len = "signing-abcdef".len();
        buf[4 + sid_len] = 0xff;
        assert!(codec.decode(&mut buf).is_err());
    }
}
