//! Scripted server side of a session, for driving the client in tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::element::{Element, NsScope};
use super::error::Result;
use super::framing::{extract_stanza, Frame};
use super::packet::ns;
use super::transport::{BoxedStream, TlsUpgrader};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const STARTTLS_FEATURES: &str = "<stream:features>\
    <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
    </stream:features>";

pub const SASL_FEATURES: &str = "<stream:features>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
    <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism>\
    </mechanisms></stream:features>";

pub const BIND_FEATURES: &str = "<stream:features>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
    </stream:features>";

pub const SM_FEATURES: &str = "<stream:features>\
    <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
    <sm xmlns='urn:xmpp:sm:2'/><sm xmlns='urn:xmpp:sm:3'/>\
    </stream:features>";

/// Leaves the stream untouched, standing in for a TLS handshake.
pub struct PassthroughUpgrader;

#[async_trait]
impl TlsUpgrader for PassthroughUpgrader {
    async fn upgrade(&self, stream: BoxedStream, _server_name: &str) -> Result<BoxedStream> {
        Ok(stream)
    }
}

pub struct FakeServer {
    stream: DuplexStream,
    buffer: Vec<u8>,
    scope: NsScope,
}

impl FakeServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            scope: NsScope::new(Some(ns::CLIENT)).with_prefix("stream", ns::STREAM),
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn next_frame(&mut self) -> Frame {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((frame, consumed)) = extract_stanza(&self.buffer).unwrap() {
                self.buffer.drain(..consumed);
                return frame;
            }
            let n = tokio::time::timeout(READ_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("client went silent")
                .unwrap();
            assert!(n > 0, "client closed the connection");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn next_element(&mut self) -> Element {
        match self.next_frame().await {
            Frame::Element(xml) => Element::parse(&xml, &self.scope).unwrap(),
            other => panic!("expected an element, got {:?}", other),
        }
    }

    pub async fn expect_element(&mut self, name: &str, namespace: &str) -> Element {
        let el = self.next_element().await;
        assert!(el.is(name, namespace), "expected {{{}}}{}, got {}", namespace, name, el.to_xml());
        el
    }

    /// Read the client's header, answer with ours and `features`.
    pub async fn accept_stream(&mut self, features: &str) {
        match self.next_frame().await {
            Frame::StreamOpen(header) => assert!(header.contains("to='example.com'"), "{}", header),
            other => panic!("expected stream header, got {:?}", other),
        }
        self.send(
            "<?xml version='1.0'?><stream:stream from='example.com' id='s1' version='1.0' \
             xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        )
        .await;
        self.send(features).await;
    }

    /// STARTTLS and SASL PLAIN, ending with `features` on the authenticated stream.
    pub async fn negotiate_until_bind(&mut self, features: &str) {
        self.accept_stream(STARTTLS_FEATURES).await;
        self.expect_element("starttls", ns::STARTTLS).await;
        self.send("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;
        self.accept_stream(SASL_FEATURES).await;
        self.expect_element("auth", ns::SASL).await;
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;
        self.accept_stream(features).await;
    }

    pub async fn answer_bind(&mut self, jid: &str) {
        let iq = self.expect_element("iq", ns::CLIENT).await;
        assert_eq!(iq.attr("type"), Some("set"));
        assert!(iq.has_child("bind", ns::BIND));
        let id = iq.attr("id").unwrap().to_string();
        self.send(&format!(
            "<iq type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>{}</jid></bind></iq>",
            id, jid
        ))
        .await;
    }

    /// Collect elements until the client closes the stream.
    pub async fn drain_until_close(&mut self) -> Vec<Element> {
        let mut seen = Vec::new();
        loop {
            match self.next_frame().await {
                Frame::StreamClose => return seen,
                Frame::Element(xml) => seen.push(Element::parse(&xml, &self.scope).unwrap()),
                Frame::StreamOpen(header) => panic!("unexpected stream header {}", header),
            }
        }
    }

    pub async fn expect_stream_close(&mut self) {
        self.drain_until_close().await;
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never became true");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

