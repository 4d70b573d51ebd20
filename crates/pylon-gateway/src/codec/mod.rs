//! Frame codec
//!
//! Decompresses and decodes raw transport frames into gateway envelopes
//! and encodes outbound envelopes.
//!
//! In zlib-stream mode the server shares one compression context across
//! the whole connection: fragments accumulate until the 4-byte flush
//! suffix appears, then the whole buffer runs through the persistent
//! inflater. Without stream compression, each discrete message is sniffed
//! by its first byte to decide whether it needs standalone decompression.
//! Both the buffer and the inflater context are scoped to one physical
//! connection; a reconnect gets a fresh codec.

use crate::protocol::GatewayEnvelope;
use flate2::{Decompress, FlushDecompress};
use std::io::Read;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// Marker terminating every complete zlib-stream payload.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// First byte of an ETF-encoded term; we only speak JSON, so such frames
/// are rejected rather than fed to the inflater.
const ETF_MARKER: u8 = 131;

/// Growth step for the inflate output buffer.
const INFLATE_CHUNK: usize = 16 * 1024;

/// Errors from frame decoding.
///
/// All of these are protocol errors scoped to a single frame; the caller
/// logs and drops the frame, the connection survives.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to inflate frame: {0}")]
    Inflate(#[from] flate2::DecompressError),

    #[error("Failed to read compressed frame: {0}")]
    Io(#[from] std::io::Error),

    #[error("Inflated frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Failed to parse gateway envelope: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Binary frame uses an unsupported encoding")]
    UnsupportedEncoding,
}

/// Decodes inbound transport messages and encodes outbound envelopes.
pub struct FrameCodec {
    stream_compressed: bool,
    buffer: Vec<u8>,
    inflater: Decompress,
}

impl FrameCodec {
    /// Create a codec for one physical connection.
    #[must_use]
    pub fn new(stream_compressed: bool) -> Self {
        Self {
            stream_compressed,
            buffer: Vec::new(),
            // zlib header is present on the stream
            inflater: Decompress::new(true),
        }
    }

    /// Decode a transport message into an envelope.
    ///
    /// Returns `Ok(None)` for fragments that do not complete a payload yet
    /// (zlib-stream mode) and for non-data messages.
    pub fn decode(&mut self, message: &Message) -> Result<Option<GatewayEnvelope>, CodecError> {
        match message {
            Message::Text(text) => Ok(Some(GatewayEnvelope::from_json(text)?)),
            Message::Binary(bytes) => {
                if self.stream_compressed {
                    match self.inflate_stream(bytes)? {
                        Some(plain) => {
                            let text = String::from_utf8(plain)?;
                            Ok(Some(GatewayEnvelope::from_json(&text)?))
                        }
                        None => Ok(None),
                    }
                } else {
                    self.decode_discrete(bytes).map(Some)
                }
            }
            _ => Ok(None),
        }
    }

    /// Encode an outbound envelope as a text frame.
    pub fn encode(envelope: &GatewayEnvelope) -> Result<Message, CodecError> {
        Ok(Message::Text(envelope.to_json()?))
    }

    /// Accumulate a fragment; inflate once the flush suffix arrives.
    fn inflate_stream(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        self.buffer.extend_from_slice(chunk);

        if chunk.len() < ZLIB_SUFFIX.len() || chunk[chunk.len() - ZLIB_SUFFIX.len()..] != ZLIB_SUFFIX
        {
            return Ok(None);
        }

        let mut plain = Vec::with_capacity(self.buffer.len().saturating_mul(3));
        let mut consumed = 0;
        while consumed < self.buffer.len() {
            if plain.len() == plain.capacity() {
                plain.reserve(INFLATE_CHUNK);
            }
            let before = self.inflater.total_in();
            self.inflater
                .decompress_vec(&self.buffer[consumed..], &mut plain, FlushDecompress::Sync)?;
            let read = usize::try_from(self.inflater.total_in() - before).unwrap_or(usize::MAX);
            if read == 0 && plain.len() < plain.capacity() {
                // No forward progress and room to spare: nothing more to do
                break;
            }
            consumed += read;
        }

        self.buffer.clear();
        Ok(Some(plain))
    }

    /// Decode one self-contained message (no stream compression).
    ///
    /// Compressed payloads can still occur here, so the first byte decides:
    /// `{` is plain JSON, the ETF marker is rejected, anything else is
    /// treated as a standalone zlib payload.
    fn decode_discrete(&self, bytes: &[u8]) -> Result<GatewayEnvelope, CodecError> {
        match bytes.first() {
            Some(b'{') => {
                let text = String::from_utf8(bytes.to_vec())?;
                Ok(GatewayEnvelope::from_json(&text)?)
            }
            Some(&ETF_MARKER) => Err(CodecError::UnsupportedEncoding),
            _ => {
                let mut plain = Vec::new();
                flate2::read::ZlibDecoder::new(bytes).read_to_end(&mut plain)?;
                let text = String::from_utf8(plain)?;
                Ok(GatewayEnvelope::from_json(&text)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;
    use flate2::{Compress, Compression, FlushCompress};

    /// Compress `input` the way the gateway's shared stream does: raw
    /// deflate blocks ending in a sync flush, zlib header on the first call.
    fn stream_compress(compressor: &mut Compress, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() + 64);
        compressor
            .compress_vec(input, &mut out, FlushCompress::Sync)
            .unwrap();
        assert!(out.ends_with(&ZLIB_SUFFIX));
        out
    }

    #[test]
    fn test_text_frame_decodes_directly() {
        let mut codec = FrameCodec::new(false);
        let env = codec
            .decode(&Message::Text(r#"{"op":11}"#.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(env.op, OpCode::HeartbeatAck);
    }

    #[test]
    fn test_stream_payload_split_across_fragments() {
        let payload = br#"{"op":0,"t":"MESSAGE_CREATE","s":42,"d":{"content":"hello"}}"#;
        let mut compressor = Compress::new(Compression::default(), true);
        let compressed = stream_compress(&mut compressor, payload);
        let split = compressed.len() / 2;

        let mut codec = FrameCodec::new(true);
        let first = codec
            .decode(&Message::Binary(compressed[..split].to_vec()))
            .unwrap();
        assert!(first.is_none(), "fragment without suffix must not decode");

        let env = codec
            .decode(&Message::Binary(compressed[split..].to_vec()))
            .unwrap()
            .unwrap();
        assert_eq!(env.op, OpCode::Dispatch);
        assert_eq!(env.s, Some(42));
    }

    #[test]
    fn test_stream_fragments_match_whole_payload() {
        let payload = br#"{"op":0,"t":"TYPING_START","s":7,"d":{"channel_id":"1"}}"#;

        let mut whole_compressor = Compress::new(Compression::default(), true);
        let compressed = stream_compress(&mut whole_compressor, payload);

        let mut whole = FrameCodec::new(true);
        let from_whole = whole
            .decode(&Message::Binary(compressed.clone()))
            .unwrap()
            .unwrap();

        let mut fragmented = FrameCodec::new(true);
        let mid = compressed.len() / 3;
        assert!(fragmented
            .decode(&Message::Binary(compressed[..mid].to_vec()))
            .unwrap()
            .is_none());
        let from_fragments = fragmented
            .decode(&Message::Binary(compressed[mid..].to_vec()))
            .unwrap()
            .unwrap();

        assert_eq!(from_whole.to_json().unwrap(), from_fragments.to_json().unwrap());
    }

    #[test]
    fn test_stream_context_persists_across_payloads() {
        // Two payloads through one compression context; the second depends
        // on the first's dictionary state
        let first = br#"{"op":0,"t":"MESSAGE_CREATE","s":1,"d":{"content":"abcdef"}}"#;
        let second = br#"{"op":0,"t":"MESSAGE_CREATE","s":2,"d":{"content":"abcdef"}}"#;
        let mut compressor = Compress::new(Compression::default(), true);

        let mut codec = FrameCodec::new(true);
        let env1 = codec
            .decode(&Message::Binary(stream_compress(&mut compressor, first)))
            .unwrap()
            .unwrap();
        let env2 = codec
            .decode(&Message::Binary(stream_compress(&mut compressor, second)))
            .unwrap()
            .unwrap();

        assert_eq!(env1.s, Some(1));
        assert_eq!(env2.s, Some(2));
    }

    #[test]
    fn test_discrete_json_binary() {
        let mut codec = FrameCodec::new(false);
        let env = codec
            .decode(&Message::Binary(br#"{"op":7}"#.to_vec()))
            .unwrap()
            .unwrap();
        assert_eq!(env.op, OpCode::Reconnect);
    }

    #[test]
    fn test_discrete_zlib_binary() {
        let payload = br#"{"op":9,"d":false}"#;
        // compress_vec only fills existing capacity, it never grows the vec
        let mut out = Vec::with_capacity(payload.len() + 64);
        let mut compressor = Compress::new(Compression::default(), true);
        compressor
            .compress_vec(payload, &mut out, FlushCompress::Finish)
            .unwrap();

        let mut codec = FrameCodec::new(false);
        let env = codec.decode(&Message::Binary(out)).unwrap().unwrap();
        assert_eq!(env.op, OpCode::InvalidSession);
    }

    #[test]
    fn test_etf_frame_rejected() {
        let mut codec = FrameCodec::new(false);
        let err = codec
            .decode(&Message::Binary(vec![131, 1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedEncoding));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let mut codec = FrameCodec::new(false);
        let err = codec
            .decode(&Message::Text("{not json".to_string()))
            .unwrap_err();
        assert!(matches!(err, CodecError::Parse(_)));
    }

    #[test]
    fn test_encode_produces_text_frame() {
        let env = GatewayEnvelope::heartbeat(Some(3));
        let message = FrameCodec::encode(&env).unwrap();
        assert_eq!(message, Message::Text(r#"{"op":1,"d":3}"#.to_string()));
    }

    #[test]
    fn test_ping_frames_are_ignored() {
        let mut codec = FrameCodec::new(true);
        assert!(codec.decode(&Message::Ping(vec![])).unwrap().is_none());
    }
}
