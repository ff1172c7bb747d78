//! Length-prefixed frames and the incremental decoder

use std::mem;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::{decode_payload, encode_payload, PayloadMap, WireError};
use crate::types::Credentials;

/// Size of the big-endian header length prefix
pub const HEADER_LEN_PREFIX: usize = 2;

/// Byte order of array elements inside the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

/// JSON header preceding every payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub byteorder: ByteOrder,

    #[serde(rename = "content-length")]
    pub content_length: usize,

    /// Sender wall clock at send time, seconds since the Unix epoch
    #[serde(rename = "sent-ts", default, skip_serializing_if = "Option::is_none")]
    pub sent_ts: Option<f64>,
}

/// Current wall clock time in seconds since the Unix epoch
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Build one complete frame: header length, JSON header, payload.
pub fn encode_frame(
    credentials: &Credentials,
    payload: &PayloadMap,
    sent_ts: Option<f64>,
) -> Result<Vec<u8>, WireError> {
    let body = encode_payload(credentials, payload)?;
    let header = FrameHeader {
        byteorder: ByteOrder::Little,
        content_length: body.len(),
        sent_ts,
    };
    let header = serde_json::to_vec(&header)?;
    let header_len = u16::try_from(header.len()).map_err(|_| WireError::TooLong {
        what: "frame header",
        len: header.len(),
    })?;

    let mut out = Vec::with_capacity(HEADER_LEN_PREFIX + header.len() + body.len());
    out.put_u16(header_len);
    out.put_slice(&header);
    out.put_slice(&body);
    Ok(out)
}

/// One fully decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    pub credentials: Credentials,
    pub variables: PayloadMap,
}

impl DecodedFrame {
    /// Transit time in seconds, or `None` when the sender sent no timestamp
    pub fn latency_secs(&self, received_at: f64) -> Option<f64> {
        self.header.sent_ts.map(|sent| received_at - sent)
    }
}

// ─────────────────────────────────────────────────────────────────
// Incremental decoder
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum DecodeState {
    AwaitHeaderLen,
    AwaitHeader { len: usize },
    AwaitPayload { header: FrameHeader },
}

/// Per-connection frame decoder.
///
/// Bytes are fed as they arrive; a stage only advances once enough bytes are
/// buffered, so any fragmentation of the stream decodes the same frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    state: DecodeState,
    max_frame_bytes: Option<usize>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            state: DecodeState::AwaitHeaderLen,
            max_frame_bytes: None,
        }
    }

    /// Reject frames whose declared payload exceeds `limit` bytes
    pub fn with_max_frame_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True when no partial frame is pending
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty() && matches!(self.state, DecodeState::AwaitHeaderLen)
    }

    /// Decode the next complete frame, if one is fully buffered.
    ///
    /// After an error the decoder state is undefined; the connection should
    /// be dropped.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>, WireError> {
        loop {
            match mem::replace(&mut self.state, DecodeState::AwaitHeaderLen) {
                DecodeState::AwaitHeaderLen => {
                    if self.buf.len() < HEADER_LEN_PREFIX {
                        return Ok(None);
                    }
                    let len = self.buf.get_u16() as usize;
                    if len == 0 {
                        return Err(WireError::EmptyHeader);
                    }
                    self.state = DecodeState::AwaitHeader { len };
                }
                DecodeState::AwaitHeader { len } => {
                    if self.buf.len() < len {
                        self.state = DecodeState::AwaitHeader { len };
                        return Ok(None);
                    }
                    let raw = self.buf.split_to(len);
                    let header: FrameHeader = serde_json::from_slice(&raw)?;
                    if let Some(limit) = self.max_frame_bytes {
                        if header.content_length > limit {
                            return Err(WireError::FrameTooLarge {
                                declared: header.content_length,
                                limit,
                            });
                        }
                    }
                    self.state = DecodeState::AwaitPayload { header };
                }
                DecodeState::AwaitPayload { header } => {
                    if self.buf.len() < header.content_length {
                        self.state = DecodeState::AwaitPayload { header };
                        return Ok(None);
                    }
                    let body = self.buf.split_to(header.content_length);
                    let (credentials, variables) = decode_payload(&body, header.byteorder)?;
                    return Ok(Some(DecodedFrame {
                        header,
                        credentials,
                        variables,
                    }));
                }
            }
        }
    }

    /// Decode every complete frame currently buffered
    pub fn drain(&mut self) -> Result<Vec<DecodedFrame>, WireError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{NdArray, Value};

    fn creds() -> Credentials {
        Credentials::new("B", "client")
    }

    fn payload() -> PayloadMap {
        let mut p = PayloadMap::new();
        p.insert("var1".into(), Value::Int(42));
        p.insert(
            "grid".into(),
            Value::Array(NdArray::from_f32(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()),
        );
        p
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&creds(), &payload(), Some(1700000000.25)).unwrap();
        let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let header: serde_json::Value =
            serde_json::from_slice(&frame[2..2 + header_len]).unwrap();

        assert_eq!(header["byteorder"], "little");
        assert_eq!(header["sent-ts"], 1700000000.25);
        assert_eq!(
            header["content-length"].as_u64().unwrap() as usize,
            frame.len() - 2 - header_len
        );
    }

    #[test]
    fn test_sent_ts_omitted_when_absent() {
        let frame = encode_frame(&creds(), &payload(), None).unwrap();
        let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let header = std::str::from_utf8(&frame[2..2 + header_len]).unwrap();
        assert!(!header.contains("sent-ts"));

        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.latency_secs(now_secs()), None);
    }

    #[test]
    fn test_single_feed_roundtrip() {
        let frame = encode_frame(&creds(), &payload(), Some(10.0)).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame);

        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.credentials, creds());
        assert_eq!(decoded.variables, payload());
        assert_eq!(decoded.latency_secs(12.5), Some(2.5));
        assert!(decoder.is_idle());
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_byte_at_a_time_matches_single_feed() {
        let mut stream = encode_frame(&creds(), &payload(), Some(1.0)).unwrap();
        stream.extend(encode_frame(&Credentials::new("C", "client"), &PayloadMap::new(), None).unwrap());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &stream {
            decoder.feed(std::slice::from_ref(byte));
            frames.extend(decoder.drain().unwrap());
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].variables, payload());
        assert_eq!(frames[1].credentials, Credentials::new("C", "client"));
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_drain_emits_all_buffered_frames() {
        let mut stream = Vec::new();
        for _ in 0..3 {
            stream.extend(encode_frame(&creds(), &payload(), None).unwrap());
        }
        stream.extend_from_slice(&[0, 5]);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream);
        assert_eq!(decoder.drain().unwrap().len(), 3);
        assert!(!decoder.is_idle());
    }

    #[test]
    fn test_empty_header_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0, 0, 1, 2]);
        assert!(matches!(decoder.next_frame(), Err(WireError::EmptyHeader)));
    }

    #[test]
    fn test_garbage_header_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0, 3]);
        decoder.feed(b"{x}");
        assert!(matches!(decoder.next_frame(), Err(WireError::Header(_))));
    }

    #[test]
    fn test_max_frame_bytes() {
        let frame = encode_frame(&creds(), &payload(), None).unwrap();

        let mut strict = FrameDecoder::new().with_max_frame_bytes(Some(8));
        strict.feed(&frame);
        assert!(matches!(
            strict.next_frame(),
            Err(WireError::FrameTooLarge { limit: 8, .. })
        ));

        let mut roomy = FrameDecoder::new().with_max_frame_bytes(Some(frame.len()));
        roomy.feed(&frame);
        assert!(roomy.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_now_secs_is_recent() {
        // 2020-01-01
        assert!(now_secs() > 1_577_836_800.0);
    }
}
