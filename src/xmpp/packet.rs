//! Typed protocol elements.
//!
//! Every decoded top-level element becomes one [`Packet`] variant. The set is
//! closed: anything not listed in [`decode`] is rejected as unexpected.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;

use super::element::{Element, QName};
use super::error::CodecError;
use super::id::next_id;

pub mod ns {
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const CLIENT: &str = "jabber:client";
    pub const STARTTLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const SM_2: &str = "urn:xmpp:sm:2";
    pub const SM_3: &str = "urn:xmpp:sm:3";
    pub const CAPS: &str = "http://jabber.org/protocol/caps";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const ROSTER_VER: &str = "urn:xmpp:features:rosterver";
    pub const CSI: &str = "urn:xmpp:csi:0";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const PING: &str = "urn:xmpp:ping";
}

/// Attributes of a `<stream:stream>` opening tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    pub default_ns: Option<String>,
    /// `xmlns:prefix` declarations, in document order.
    pub prefixes: Vec<(String, String)>,
}

/// A decoded top-level element together with its qualified name.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub name: QName,
    pub packet: Packet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    StreamOpen(StreamHeader),
    StreamClose,
    StreamError(StreamErrorInfo),
    Features(StreamFeatures),
    TlsProceed,
    TlsFailure,
    SaslSuccess,
    SaslFailure(SaslFailure),
    Iq(Iq),
    Message(Element),
    Presence(Element),
    Sm(SmElement),
}

impl Packet {
    pub fn is_stream_management(&self) -> bool {
        matches!(self, Packet::Sm(_))
    }

    /// Short name used in logs and protocol violation reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::StreamOpen(_) => "stream header",
            Packet::StreamClose => "stream close",
            Packet::StreamError(_) => "stream error",
            Packet::Features(_) => "stream features",
            Packet::TlsProceed => "STARTTLS proceed",
            Packet::TlsFailure => "STARTTLS failure",
            Packet::SaslSuccess => "SASL success",
            Packet::SaslFailure(_) => "SASL failure",
            Packet::Iq(_) => "iq",
            Packet::Message(_) => "message",
            Packet::Presence(_) => "presence",
            Packet::Sm(_) => "stream management element",
        }
    }
}

/// Namespace-versioned Stream Management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SmVersion {
    V2,
    V3,
}

impl SmVersion {
    pub fn ns(self) -> &'static str {
        match self {
            SmVersion::V2 => ns::SM_2,
            SmVersion::V3 => ns::SM_3,
        }
    }

    pub fn from_ns(namespace: &str) -> Option<Self> {
        match namespace {
            ns::SM_2 => Some(SmVersion::V2),
            ns::SM_3 => Some(SmVersion::V3),
            _ => None,
        }
    }
}

impl fmt::Display for SmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmVersion::V2 => f.write_str("2"),
            SmVersion::V3 => f.write_str("3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmElement {
    Enabled {
        version: SmVersion,
        id: Option<String>,
        resume: bool,
        max: Option<u32>,
        location: Option<String>,
    },
    Resumed {
        version: SmVersion,
        previd: String,
        h: u32,
    },
    Failed {
        version: SmVersion,
        condition: Option<String>,
        h: Option<u32>,
    },
    Request {
        version: SmVersion,
    },
    Answer {
        version: SmVersion,
        h: u32,
    },
}

/// XEP-0115 entity capabilities advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityCaps {
    pub hash: String,
    pub node: String,
    pub ver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamFeatures {
    /// `Some(required)` when STARTTLS is offered.
    pub starttls: Option<bool>,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    /// `Some(optional)` when legacy session establishment is offered.
    pub session: Option<bool>,
    pub stream_management: Option<SmVersion>,
    pub caps: Option<EntityCaps>,
    pub roster_versioning: bool,
    pub client_state_indication: bool,
}

impl StreamFeatures {
    pub fn from_element(el: &Element) -> Self {
        let mut features = StreamFeatures::default();
        for child in el.children() {
            match (child.ns(), child.name()) {
                (ns::STARTTLS, "starttls") => {
                    features.starttls = Some(child.has_child("required", ns::STARTTLS));
                }
                (ns::SASL, "mechanisms") => {
                    features.mechanisms = child
                        .children()
                        .filter(|m| m.is("mechanism", ns::SASL))
                        .map(|m| m.text().trim().to_string())
                        .collect();
                }
                (ns::BIND, "bind") => features.bind = true,
                (ns::SESSION, "session") => {
                    features.session = Some(child.has_child("optional", ns::SESSION));
                }
                (namespace, "sm") => {
                    if let Some(version) = SmVersion::from_ns(namespace) {
                        // Servers usually list both; keep the highest
                        features.stream_management =
                            Some(features.stream_management.map_or(version, |v| v.max(version)));
                    }
                }
                (ns::CAPS, "c") => {
                    features.caps = Some(EntityCaps {
                        hash: child.attr("hash").unwrap_or_default().to_string(),
                        node: child.attr("node").unwrap_or_default().to_string(),
                        ver: child.attr("ver").unwrap_or_default().to_string(),
                    });
                }
                (ns::ROSTER_VER, "ver") => features.roster_versioning = true,
                (ns::CSI, "csi") => features.client_state_indication = true,
                _ => {}
            }
        }
        features
    }

    pub fn supports_mechanism(&self, mechanism: &str) -> bool {
        self.mechanisms.iter().any(|m| m.eq_ignore_ascii_case(mechanism))
    }
}

/// Defined condition plus optional human-readable text, shared by SASL
/// failures and stream errors.
fn condition_and_text(el: &Element, text_ns: &str) -> (String, Option<String>) {
    let condition = el
        .children()
        .find(|c| c.name() != "text" && c.ns() == text_ns)
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = el
        .get_child("text", text_ns)
        .map(|t| t.text())
        .filter(|t| !t.is_empty());
    (condition, text)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslFailure {
    pub condition: String,
    pub text: Option<String>,
}

impl fmt::Display for SaslFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {}", self.condition, text),
            None => f.write_str(&self.condition),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamErrorInfo {
    pub condition: String,
    pub text: Option<String>,
}

impl fmt::Display for StreamErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {}", self.condition, text),
            None => f.write_str(&self.condition),
        }
    }
}

/// An `<error/>` carried by an iq of type `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    /// `cancel`, `continue`, `modify`, `auth` or `wait`.
    pub kind: String,
    pub condition: String,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(kind: &str, condition: &str) -> Self {
        StanzaError {
            kind: kind.to_string(),
            condition: condition.to_string(),
            text: None,
        }
    }

    pub fn from_element(el: &Element) -> Self {
        let (condition, text) = condition_and_text(el, ns::STANZA_ERRORS);
        StanzaError {
            kind: el.attr("type").unwrap_or("cancel").to_string(),
            condition,
            text,
        }
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("error", ns::CLIENT)
            .with_attr("type", self.kind.clone())
            .with_child(Element::new(self.condition.clone(), ns::STANZA_ERRORS));
        if let Some(text) = &self.text {
            el.append_child(Element::new("text", ns::STANZA_ERRORS).with_text(text.clone()));
        }
        el
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.kind)?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    pub id: String,
    pub kind: IqType,
    pub from: Option<String>,
    pub to: Option<String>,
    pub payload: Option<Element>,
    pub error: Option<StanzaError>,
}

impl Iq {
    fn request(kind: IqType, payload: Element) -> Self {
        Iq {
            id: next_id(),
            kind,
            from: None,
            to: None,
            payload: Some(payload),
            error: None,
        }
    }

    /// A `get` with a freshly minted identifier.
    pub fn get(payload: Element) -> Self {
        Self::request(IqType::Get, payload)
    }

    /// A `set` with a freshly minted identifier.
    pub fn set(payload: Element) -> Self {
        Self::request(IqType::Set, payload)
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// The `result` answering `request`, addressed back to its sender.
    pub fn result_for(request: &Iq, payload: Option<Element>) -> Self {
        Iq {
            id: request.id.clone(),
            kind: IqType::Result,
            from: None,
            to: request.from.clone(),
            payload,
            error: None,
        }
    }

    pub fn error_for(request: &Iq, error: StanzaError) -> Self {
        Iq {
            id: request.id.clone(),
            kind: IqType::Error,
            from: None,
            to: request.from.clone(),
            payload: None,
            error: Some(error),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, IqType::Get | IqType::Set)
    }

    /// The payload when it has the given qualified name.
    pub fn payload_is(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payload.as_ref().filter(|p| p.is(name, namespace))
    }

    pub fn from_element(el: Element) -> Result<Self, CodecError> {
        let id = el
            .attr("id")
            .ok_or_else(|| CodecError::Malformed("iq without id".into()))?
            .to_string();
        let kind = match el.attr("type") {
            Some("get") => IqType::Get,
            Some("set") => IqType::Set,
            Some("result") => IqType::Result,
            Some("error") => IqType::Error,
            other => {
                return Err(CodecError::Malformed(format!(
                    "iq {} has invalid type {:?}",
                    id, other
                )))
            }
        };
        let error = if kind == IqType::Error {
            el.get_child("error", ns::CLIENT).map(StanzaError::from_element)
        } else {
            None
        };
        let payload = el
            .children()
            .find(|c| !c.is("error", ns::CLIENT))
            .cloned();
        Ok(Iq {
            id,
            kind,
            from: el.attr("from").map(str::to_string),
            to: el.attr("to").map(str::to_string),
            payload,
            error,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut el = Element::new("iq", ns::CLIENT)
            .with_attr("id", self.id.clone())
            .with_attr("type", self.kind.as_str());
        if let Some(to) = &self.to {
            el.set_attr("to", to.clone());
        }
        if let Some(from) = &self.from {
            el.set_attr("from", from.clone());
        }
        if let Some(payload) = &self.payload {
            el.append_child(payload.clone());
        }
        if let Some(error) = &self.error {
            el.append_child(error.to_element());
        }
        el
    }
}

/// Turn a parsed top-level element into its typed form.
pub fn decode(el: Element) -> Result<Envelope, CodecError> {
    let name = el.qname();
    let packet = match (name.ns.as_str(), name.local.as_str()) {
        (ns::STREAM, "features") => Packet::Features(StreamFeatures::from_element(&el)),
        (ns::STREAM, "error") => {
            let (condition, text) = condition_and_text(&el, ns::STREAM_ERRORS);
            Packet::StreamError(StreamErrorInfo { condition, text })
        }
        (ns::STARTTLS, "proceed") => Packet::TlsProceed,
        (ns::STARTTLS, "failure") => Packet::TlsFailure,
        (ns::SASL, "success") => Packet::SaslSuccess,
        (ns::SASL, "failure") => {
            let (condition, text) = condition_and_text(&el, ns::SASL);
            Packet::SaslFailure(SaslFailure { condition, text })
        }
        (ns::CLIENT, "iq") => Packet::Iq(Iq::from_element(el)?),
        (ns::CLIENT, "message") => Packet::Message(el),
        (ns::CLIENT, "presence") => Packet::Presence(el),
        (namespace, local) => match SmVersion::from_ns(namespace) {
            Some(version) => Packet::Sm(decode_sm(version, local, &el)?),
            None => return Err(CodecError::Unexpected(el.qname())),
        },
    };
    Ok(Envelope { name, packet })
}

fn parse_counter(el: &Element, attr: &str) -> Result<Option<u32>, CodecError> {
    el.attr(attr)
        .map(|v| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| CodecError::Malformed(format!("invalid {}='{}' on <{}/>", attr, v, el.name())))
        })
        .transpose()
}

fn decode_sm(version: SmVersion, local: &str, el: &Element) -> Result<SmElement, CodecError> {
    let missing_h = || CodecError::Malformed(format!("<{}/> without h", local));
    Ok(match local {
        "enabled" => SmElement::Enabled {
            version,
            id: el.attr("id").map(str::to_string),
            resume: matches!(el.attr("resume"), Some("true") | Some("1")),
            max: parse_counter(el, "max")?,
            location: el.attr("location").map(str::to_string),
        },
        "resumed" => SmElement::Resumed {
            version,
            previd: el.attr("previd").unwrap_or_default().to_string(),
            h: parse_counter(el, "h")?.ok_or_else(missing_h)?,
        },
        "failed" => SmElement::Failed {
            version,
            condition: el
                .children()
                .find(|c| c.ns() == ns::STANZA_ERRORS)
                .map(|c| c.name().to_string()),
            h: parse_counter(el, "h")?,
        },
        "r" => SmElement::Request { version },
        "a" => SmElement::Answer {
            version,
            h: parse_counter(el, "h")?.ok_or_else(missing_h)?,
        },
        _ => return Err(CodecError::Unexpected(el.qname())),
    })
}

pub fn starttls() -> Element {
    Element::new("starttls", ns::STARTTLS)
}

/// SASL PLAIN initial response: `base64("\0" authcid "\0" password)`.
pub fn sasl_plain(authcid: &str, password: &str) -> Element {
    let raw = format!("\0{}\0{}", authcid, password);
    Element::new("auth", ns::SASL)
        .with_attr("mechanism", "PLAIN")
        .with_text(BASE64.encode(raw.as_bytes()))
}

pub fn bind(resource: &str) -> Iq {
    let mut bind = Element::new("bind", ns::BIND);
    if !resource.is_empty() {
        bind.append_child(Element::new("resource", ns::BIND).with_text(resource));
    }
    Iq::set(bind)
}

pub fn session() -> Iq {
    Iq::set(Element::new("session", ns::SESSION))
}

pub fn sm_enable(version: SmVersion, resume: bool) -> Element {
    let el = Element::new("enable", version.ns());
    if resume {
        el.with_attr("resume", "true")
    } else {
        el
    }
}

pub fn sm_resume(version: SmVersion, previd: &str, h: u32) -> Element {
    Element::new("resume", version.ns())
        .with_attr("previd", previd)
        .with_attr("h", h.to_string())
}

pub fn sm_request(version: SmVersion) -> Element {
    Element::new("r", version.ns())
}

pub fn sm_answer(version: SmVersion, h: u32) -> Element {
    Element::new("a", version.ns()).with_attr("h", h.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::element::NsScope;

    fn scope() -> NsScope {
        NsScope::new(Some(ns::CLIENT)).with_prefix("stream", ns::STREAM)
    }

    fn parse(xml: &str) -> Result<Envelope, CodecError> {
        decode(Element::parse(xml, &scope()).unwrap())
    }

    #[test]
    fn test_decode_features() {
        let env = parse(
            "<stream:features>\
               <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
               <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                 <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism>\
               </mechanisms>\
               <c xmlns='http://jabber.org/protocol/caps' hash='sha-1' node='https://www.process-one.net/en/ejabberd/' ver='abc='/>\
             </stream:features>",
        )
        .unwrap();
        assert_eq!(env.name, QName::new(ns::STREAM, "features"));
        let Packet::Features(f) = env.packet else {
            panic!("expected features");
        };
        assert_eq!(f.starttls, Some(true));
        assert!(f.supports_mechanism("plain"));
        assert!(!f.bind);
        assert_eq!(f.caps.as_ref().map(|c| c.ver.as_str()), Some("abc="));
    }

    #[test]
    fn test_decode_post_auth_features() {
        let env = parse(
            "<stream:features>\
               <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
               <session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>\
               <sm xmlns='urn:xmpp:sm:2'/><sm xmlns='urn:xmpp:sm:3'/>\
               <ver xmlns='urn:xmpp:features:rosterver'/>\
               <csi xmlns='urn:xmpp:csi:0'/>\
             </stream:features>",
        )
        .unwrap();
        let Packet::Features(f) = env.packet else {
            panic!("expected features");
        };
        assert!(f.bind);
        assert_eq!(f.session, Some(true));
        assert_eq!(f.stream_management, Some(SmVersion::V3));
        assert!(f.roster_versioning);
        assert!(f.client_state_indication);
        assert_eq!(f.starttls, None);
    }

    #[test]
    fn test_decode_sasl_failure_with_text() {
        let env = parse(
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
               <not-authorized/><text xml:lang='en'>Invalid username or password</text>\
             </failure>",
        )
        .unwrap();
        let Packet::SaslFailure(failure) = env.packet else {
            panic!("expected SASL failure");
        };
        assert_eq!(failure.condition, "not-authorized");
        assert_eq!(
            failure.to_string(),
            "not-authorized: Invalid username or password"
        );
    }

    #[test]
    fn test_decode_stream_error() {
        let env = parse(
            "<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        )
        .unwrap();
        assert_eq!(
            env.packet,
            Packet::StreamError(StreamErrorInfo {
                condition: "conflict".into(),
                text: None
            })
        );
    }

    #[test]
    fn test_decode_sm_elements() {
        assert_eq!(
            parse("<a xmlns='urn:xmpp:sm:3' h='42'/>").unwrap().packet,
            Packet::Sm(SmElement::Answer {
                version: SmVersion::V3,
                h: 42
            })
        );
        assert_eq!(
            parse("<r xmlns='urn:xmpp:sm:2'/>").unwrap().packet,
            Packet::Sm(SmElement::Request {
                version: SmVersion::V2
            })
        );
        let enabled = parse("<enabled xmlns='urn:xmpp:sm:3' id='abc' resume='true' max='300'/>")
            .unwrap()
            .packet;
        assert_eq!(
            enabled,
            Packet::Sm(SmElement::Enabled {
                version: SmVersion::V3,
                id: Some("abc".into()),
                resume: true,
                max: Some(300),
                location: None,
            })
        );
        assert!(parse("<a xmlns='urn:xmpp:sm:3'/>").is_err());
        assert!(parse("<a xmlns='urn:xmpp:sm:3' h='-1'/>").is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_element() {
        let err = parse("<foo xmlns='urn:example:unknown'/>").unwrap_err();
        assert!(
            matches!(err, CodecError::Unexpected(ref q) if q == &QName::new("urn:example:unknown", "foo"))
        );
    }

    #[test]
    fn test_iq_round_trip() {
        let env = parse(
            "<iq type='result' id='7' from='example.com'>\
               <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@example.com/mobile</jid></bind>\
             </iq>",
        )
        .unwrap();
        let Packet::Iq(iq) = env.packet else {
            panic!("expected iq");
        };
        assert_eq!(iq.id, "7");
        assert_eq!(iq.kind, IqType::Result);
        assert_eq!(iq.from.as_deref(), Some("example.com"));
        let bind = iq.payload_is("bind", ns::BIND).unwrap();
        assert_eq!(
            bind.get_child("jid", ns::BIND).unwrap().text(),
            "user@example.com/mobile"
        );

        let reparsed = Iq::from_element(
            Element::parse(&iq.to_element().to_xml(), &NsScope::new(None)).unwrap(),
        )
        .unwrap();
        assert_eq!(reparsed, iq);
    }

    #[test]
    fn test_iq_error_payload() {
        let env = parse(
            "<iq type='error' id='9'><query xmlns='jabber:iq:roster'/>\
               <error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>\
             </iq>",
        )
        .unwrap();
        let Packet::Iq(iq) = env.packet else {
            panic!("expected iq");
        };
        let error = iq.error.unwrap();
        assert_eq!(error.condition, "service-unavailable");
        assert_eq!(error.kind, "cancel");
        assert!(iq.payload.unwrap().is("query", ns::ROSTER));
    }

    #[test]
    fn test_iq_without_id_is_malformed() {
        assert!(matches!(
            parse("<iq type='get'/>"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_sasl_plain_encoding() {
        let auth = sasl_plain("user", "secret");
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        assert_eq!(auth.text(), "AHVzZXIAc2VjcmV0");
    }

    #[test]
    fn test_result_for_addresses_sender() {
        let mut request = Iq::get(Element::new("ping", ns::PING));
        request.from = Some("example.com".into());
        let reply = Iq::result_for(&request, None);
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.to.as_deref(), Some("example.com"));
        assert_eq!(
            reply.to_element().to_xml(),
            format!(
                "<iq xmlns='jabber:client' id='{}' type='result' to='example.com'/>",
                request.id
            )
        );
    }

    #[test]
    fn test_bind_request_carries_resource() {
        let iq = bind("mobile");
        assert_eq!(iq.kind, IqType::Set);
        let payload = iq.payload.unwrap();
        assert_eq!(payload.get_child("resource", ns::BIND).unwrap().text(), "mobile");
    }
}
