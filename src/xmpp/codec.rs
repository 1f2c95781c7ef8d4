//! Byte stream to [`Envelope`] conversion and back.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::element::{Element, NsScope, QName};
use super::error::CodecError;
use super::framing::{extract_stanza, parse_stream_header, Frame, MAX_STANZA_BUFFER_SIZE};
use super::packet::{self, ns, Envelope, Packet};

const READ_CHUNK_SIZE: usize = 8192;

/// Incremental decoder for one XML stream.
///
/// The codec keeps the bytes read past the last complete element, and the
/// namespace scope announced by the most recent stream header.
#[derive(Debug)]
pub struct ElementCodec {
    buffer: Vec<u8>,
    scope: NsScope,
}

impl Default for ElementCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementCodec {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
            // Until the server's header arrives, assume the client stream defaults
            scope: NsScope::new(Some(ns::CLIENT)).with_prefix("stream", ns::STREAM),
        }
    }

    /// Decode the next envelope already sitting in the buffer, if any.
    pub fn decode_buffered(&mut self) -> Option<Result<Envelope, CodecError>> {
        match extract_stanza(&self.buffer) {
            Ok(Some((frame, consumed))) => {
                self.buffer.drain(..consumed);
                Some(self.decode_frame(frame))
            }
            Ok(None) if self.buffer.len() > MAX_STANZA_BUFFER_SIZE => {
                self.buffer.clear();
                Some(Err(CodecError::Overflow {
                    limit: MAX_STANZA_BUFFER_SIZE,
                }))
            }
            Ok(None) => None,
            // Nothing after a syntax error can be framed reliably
            Err(e) => {
                self.buffer.clear();
                Some(Err(e))
            }
        }
    }

    /// Read from `reader` until one envelope is complete.
    ///
    /// Decode errors for a single element are returned without touching the
    /// rest of the buffer, so the caller may keep reading after them.
    pub async fn decode_next<R>(&mut self, reader: &mut R) -> Result<Envelope, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(result) = self.decode_buffered() {
                return result;
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(CodecError::Eof);
            }
            debug!(bytes = n, data = %String::from_utf8_lossy(&chunk[..n]), "XMPP in");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Serialize an outbound element as a child of the client stream.
    pub fn encode(element: &Element) -> String {
        element.to_xml_in(ns::CLIENT)
    }

    /// Forget any bytes read but not yet decoded.
    ///
    /// Called when the underlying stream is replaced: plaintext that arrived
    /// after `<proceed/>` must never be interpreted as part of the TLS stream.
    pub fn discard_buffered(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            warn!(bytes = dropped, "Discarding buffered plaintext at stream swap");
        }
        self.buffer.clear();
        dropped
    }

    /// Start over for a restarted stream, keeping nothing from the old one.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn decode_frame(&mut self, frame: Frame) -> Result<Envelope, CodecError> {
        match frame {
            Frame::StreamOpen(text) => {
                let header = parse_stream_header(&text)?;
                self.scope = header.scope();
                Ok(Envelope {
                    name: QName::new(ns::STREAM, "stream"),
                    packet: Packet::StreamOpen(header),
                })
            }
            Frame::StreamClose => Ok(Envelope {
                name: QName::new(ns::STREAM, "stream"),
                packet: Packet::StreamClose,
            }),
            Frame::Element(text) => {
                let element = Element::parse(&text, &self.scope).map_err(|e| {
                    CodecError::InvalidStanza {
                        name: None,
                        detail: e.to_string(),
                    }
                })?;
                let name = element.qname();
                packet::decode(element).map_err(|e| match e {
                    CodecError::Malformed(detail) => CodecError::InvalidStanza {
                        name: Some(name),
                        detail,
                    },
                    other => other,
                })
            }
        }
    }
}
