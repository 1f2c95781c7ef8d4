//! XMPP XML framing: top-level element extraction and stream headers.
//!
//! An XMPP session is one long XML document whose root (`<stream:stream>`)
//! never closes until the session ends. This module cuts that document into
//! frames: the stream header on its own, each complete top-level element, and
//! the closing `</stream:stream>`.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::element::{NsScope, QName};
use super::error::CodecError;
use super::packet::{ns, StreamHeader};

/// Maximum allowed size for the inbound extraction buffer.
///
/// If the buffer exceeds this limit without yielding a complete element, the
/// connection is failed. Typical stanzas are a few KB; the largest legitimate
/// ones (vCard avatars, MAM result pages) rarely exceed 100 KB.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

pub const STREAM_CLOSE: &str = "</stream:stream>";

/// One unit cut from the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The opening `<stream:stream ...>` tag, possibly preceded by an XML declaration.
    StreamOpen(String),
    /// `</stream:stream>`.
    StreamClose,
    /// A complete top-level element.
    Element(String),
}

/// State machine for stanza boundary detection.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Waiting for an element to start (between stanzas, or before stream open).
    Idle,
    /// Inside a top-level element, collecting events.
    InStanza,
}

/// The stream is UTF-8 only; anything else is not well-formed.
fn bytes_to_string(bytes: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| CodecError::NotWellFormed(format!("invalid UTF-8: {}", e)))
}

/// The buffer ends inside a construct that more bytes can complete.
fn is_incomplete(err: &SyntaxError) -> bool {
    matches!(
        err,
        SyntaxError::UnclosedTag
            | SyntaxError::UnclosedComment
            | SyntaxError::UnclosedCData
            | SyntaxError::UnclosedDoctype
            | SyntaxError::UnclosedPIOrXmlDecl
    )
}

/// Extract a single frame from the given buffer slice.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` if a complete frame was found,
/// `Ok(None)` if the buffer doesn't contain one yet, and
/// [`CodecError::NotWellFormed`] when no amount of further input can make
/// the buffered bytes parse. XML declarations,
/// processing instructions, comments and inter-stanza whitespace are consumed
/// along with the frame that follows them. The caller is responsible for
/// advancing past the consumed bytes.
pub fn extract_stanza(buffer: &[u8]) -> Result<Option<(Frame, usize)>, CodecError> {
    // The stream closing tag appears alone without a matching opening tag in the buffer
    let trimmed = buffer
        .iter()
        .position(|&b| b != b' ' && b != b'\t' && b != b'\n' && b != b'\r');
    if let Some(start) = trimmed {
        if buffer[start..].starts_with(STREAM_CLOSE.as_bytes()) {
            return Ok(Some((Frame::StreamClose, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                let local_name = e.name().local_name();

                if state == ParserState::Idle
                    && (local_name.as_ref() == b"stream" || e.name().as_ref() == b"stream:stream")
                {
                    // The header keeps its declaration so the codec can skip it uniformly
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(bytes_to_string(&buffer[0..tag_end])?), tag_end)));
                }

                depth += 1;

                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                let local_name = e.name().local_name();

                if state == ParserState::Idle
                    && (local_name.as_ref() == b"stream" || e.name().as_ref() == b"stream:stream")
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(bytes_to_string(&buffer[0..tag_end])?), tag_end)));
                }

                // Self-closing top-level element (e.g. <r xmlns='urn:xmpp:sm:3'/>)
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::Element(bytes_to_string(&buffer[pos..tag_end])?), tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                let local_name = e.name().local_name();

                if (local_name.as_ref() == b"stream" || e.name().as_ref() == b"stream:stream") && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamClose, tag_end)));
                }

                depth = depth.saturating_sub(1);

                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        Frame::Element(bytes_to_string(&buffer[stanza_start..tag_end])?),
                        tag_end,
                    )));
                }
            }
            Ok(Event::Eof) => {
                return Ok(None);
            }
            Err(quick_xml::Error::Syntax(ref e)) if is_incomplete(e) => {
                return Ok(None);
            }
            Err(e) => {
                return Err(CodecError::NotWellFormed(e.to_string()));
            }
        }
    }
}

/// Build the client's stream opening.
///
/// The XML declaration is only sent on the very first open of a TCP
/// connection; restarts after TLS and SASL omit it.
pub fn stream_open(domain: &str, with_declaration: bool) -> String {
    format!(
        "{}<stream:stream to='{}' version='1.0' xmlns='{}' xmlns:stream='{}'>",
        if with_declaration { "<?xml version='1.0'?>" } else { "" },
        quick_xml::escape::escape(domain),
        ns::CLIENT,
        ns::STREAM
    )
}

/// Parse a stream header from its opening tag alone.
///
/// The header never gets a matching end tag while the session is alive, so it
/// cannot go through the generic element parser.
pub fn parse_stream_header(text: &str) -> Result<StreamHeader, CodecError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::Text(_)) => {
                continue;
            }
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let mut header = StreamHeader::default();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr
                        .unescape_value()
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
                    match key.as_str() {
                        "id" => header.id = Some(value),
                        "from" => header.from = Some(value),
                        "to" => header.to = Some(value),
                        "version" => header.version = Some(value),
                        "xml:lang" => header.lang = Some(value),
                        "xmlns" => header.default_ns = Some(value),
                        _ => {
                            if let Some(prefix) = key.strip_prefix("xmlns:") {
                                header.prefixes.push((prefix.to_string(), value));
                            }
                        }
                    }
                }

                let raw_name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let (prefix, local) = match raw_name.split_once(':') {
                    Some((p, l)) => (Some(p), l),
                    None => (None, raw_name.as_str()),
                };
                let element_ns = match prefix {
                    Some(p) => header
                        .prefixes
                        .iter()
                        .find(|(declared, _)| declared == p)
                        .map(|(_, uri)| uri.clone()),
                    None => header.default_ns.clone(),
                };
                if local != "stream" || element_ns.as_deref() != Some(ns::STREAM) {
                    return Err(CodecError::Unexpected(QName::new(
                        element_ns.unwrap_or_default(),
                        local,
                    )));
                }
                return Ok(header);
            }
            Ok(Event::Eof) => return Err(CodecError::Malformed("empty stream header".into())),
            Ok(other) => {
                return Err(CodecError::Malformed(format!(
                    "unexpected {:?} in stream header",
                    other
                )))
            }
            Err(e) => return Err(CodecError::Malformed(e.to_string())),
        }
    }
}

impl StreamHeader {
    /// Namespace declarations that stanzas inside this stream inherit.
    pub fn scope(&self) -> NsScope {
        self.prefixes.iter().fold(
            NsScope::new(self.default_ns.as_deref()),
            |scope, (prefix, uri)| scope.with_prefix(prefix, uri),
        )
    }
}
