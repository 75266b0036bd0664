//! RESP framing as a tokio codec.
//!
//! Decoding is incremental: partial frames stay buffered until more
//! bytes arrive. Anything that is not a RESP value is a protocol
//! error, which the session reports once and then hangs up on.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use quarkdb_core::resp::{decode_value, RespValue};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Protocol(#[from] quarkdb_core::resp::RespParseError),
}

#[derive(Debug, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, CodecError> {
        Ok(decode_value(src)?)
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), CodecError> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quarkdb_core::resp::formatter;

    #[test]
    fn decodes_pipelined_frames() {
        let mut codec = RespCodec;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(b"*1\r\n$4\r\nping\r\n*1\r\n$4\r\npi");

        let first = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(
            first,
            RespValue::Array(vec![RespValue::Bulk(Bytes::from_static(b"ping"))])
        );
        // second frame is incomplete
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"ng\r\n");
        assert!(codec.decode(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = RespCodec;
        let mut buffer = BytesMut::new();
        codec
            .encode(formatter::scan("0", vec!["a", "b"]), &mut buffer)
            .unwrap();
        let back = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(back, formatter::scan("0", vec!["a", "b"]));
    }
}
