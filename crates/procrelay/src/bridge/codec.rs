//! Framed codec for worker communication.
//!
//! Frames are UTF-8 JSON text terminated by a single line-feed byte (0x0A).
//! There is no length prefix; the delimiter is the sole framing signal.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The frame delimiter: ASCII line feed.
pub const DELIMITER: u8 = b'\n';

/// Codec that frames messages with a trailing newline and serializes with JSON.
///
/// JSON text never contains a raw line feed outside an escaped string, so the
/// delimiter cannot appear inside a frame body. Each `decode` call extracts at
/// most one complete frame; callers (and `FramedRead`) loop until `Ok(None)`,
/// so several frames coalesced into one read are all recovered.
pub struct LineCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for LineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LineCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for LineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(end) = src.iter().position(|&b| b == DELIMITER) else {
            // No delimiter yet: incomplete frame, leave the buffer accumulating.
            return Ok(None);
        };

        // Split off the frame including its delimiter; parse the body.
        // A complete frame that is not valid JSON is a protocol violation.
        let frame = src.split_to(end + 1);
        let item = serde_json::from_slice(&frame[..end])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<T> for LineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn encode_value(value: Value) -> BytesMut {
        let mut codec = LineCodec::<Value>::new();
        let mut buf = BytesMut::new();
        codec.encode(value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encode_appends_exactly_one_delimiter() {
        let buf = encode_value(json!({"command": "get", "key": "color"}));
        assert_eq!(buf.last(), Some(&DELIMITER));
        // The delimiter appears nowhere else in the frame.
        assert_eq!(buf.iter().filter(|&&b| b == DELIMITER).count(), 1);
    }

    #[test]
    fn embedded_newlines_are_escaped() {
        let buf = encode_value(json!({"value": "line one\nline two"}));
        assert_eq!(buf.iter().filter(|&&b| b == DELIMITER).count(), 1);
        assert_eq!(buf.last(), Some(&DELIMITER));
    }

    #[test]
    fn roundtrip() {
        let value = json!({"ok": true, "items": [1, 2, 3], "name": "discfg"});
        let mut buf = encode_value(value.clone());
        let mut codec = LineCodec::<Value>::new();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, value);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_leaves_buffer_untouched() {
        let mut codec = LineCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"{\"ok\":"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"ok\":");
    }

    #[test]
    fn frame_split_across_arrivals_decodes_once() {
        let mut codec = LineCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"{\"ok\":"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"true}\n");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, json!({"ok": true}));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn coalesced_frames_all_extracted() {
        let mut codec = LineCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"{\"n\":1}\n{\"n\":2}\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({"n": 1}));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!({"n": 2}));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn garbage_frame_is_invalid_data() {
        let mut codec = LineCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn empty_line_is_invalid_data() {
        let mut codec = LineCodec::<Value>::new();
        let mut buf = BytesMut::from(&b"\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unserializable_value_is_invalid_data() {
        use std::collections::BTreeMap;

        // JSON object keys must be strings; a tuple key cannot serialize.
        let mut codec = LineCodec::<BTreeMap<(u8, u8), u8>>::new();
        let mut buf = BytesMut::new();
        let mut map = BTreeMap::new();
        map.insert((1, 2), 3);
        let err = codec.encode(map, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
