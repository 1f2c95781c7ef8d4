//! Minimal namespaced element tree.
//!
//! Top-level stanzas arrive one at a time from [`extract_stanza`](super::framing::extract_stanza),
//! detached from the `<stream:stream>` element that declared their default
//! namespace and the `stream:` prefix. [`Element::parse`] therefore takes an
//! [`NsScope`] seeded from the stream header so names resolve exactly as they
//! would inside the stream.

use std::collections::HashMap;
use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::error::CodecError;

/// Qualified name: namespace URI plus local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub ns: String,
    pub local: String,
}

impl QName {
    pub fn new(ns: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            local: local.into(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.ns, self.local)
    }
}

/// Namespace declarations in effect at some point of the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NsScope {
    default: Option<String>,
    prefixes: HashMap<String, String>,
}

impl NsScope {
    pub fn new(default: Option<&str>) -> Self {
        Self {
            default: default.map(str::to_string),
            prefixes: HashMap::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str, ns: &str) -> Self {
        self.prefixes.insert(prefix.to_string(), ns.to_string());
        self
    }

    pub fn default_ns(&self) -> Option<&str> {
        self.default.as_deref()
    }

    fn resolve(&self, prefix: Option<&str>) -> Option<&str> {
        match prefix {
            None => Some(self.default.as_deref().unwrap_or("")),
            Some("xml") => Some("http://www.w3.org/XML/1998/namespace"),
            Some(p) => self.prefixes.get(p).map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    ns: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, ns: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ns: ns.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn qname(&self) -> QName {
        QName::new(self.ns.as_str(), self.name.as_str())
    }

    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns == ns
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace an attribute. Insertion order is kept for output.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn get_child(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, ns))
    }

    pub fn has_child(&self, name: &str, ns: &str) -> bool {
        self.get_child(name, ns).is_some()
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serialize with an explicit `xmlns` on the root.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, None);
        out
    }

    /// Serialize as a child of a stream whose default namespace is
    /// `default_ns`, omitting a redundant `xmlns` on the root.
    pub fn to_xml_in(&self, default_ns: &str) -> String {
        let mut out = String::new();
        self.write_into(&mut out, Some(default_ns));
        out
    }

    fn write_into(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        let declare = match parent_ns {
            Some(parent) => parent != self.ns,
            None => !self.ns.is_empty(),
        };
        if declare {
            out.push_str(" xmlns='");
            out.push_str(&escape(self.ns.as_str()));
            out.push('\'');
        }
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            out.push_str(&escape(value.as_str()));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(child) => child.write_into(out, Some(&self.ns)),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse one complete element, resolving prefixes against `scope`.
    pub fn parse(xml: &str, scope: &NsScope) -> Result<Element, CodecError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<(Element, NsScope)> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let parent = stack.last().map(|(_, s)| s).unwrap_or(scope);
                    let opened = open_element(&e, parent)?;
                    stack.push(opened);
                }
                Ok(Event::Empty(e)) => {
                    let parent = stack.last().map(|(_, s)| s).unwrap_or(scope);
                    let (element, _) = open_element(&e, parent)?;
                    match stack.last_mut() {
                        Some((parent, _)) => parent.append_child(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::End(_)) => {
                    let (element, _) = stack
                        .pop()
                        .ok_or_else(|| CodecError::Malformed("unbalanced end tag".into()))?;
                    match stack.last_mut() {
                        Some((parent, _)) => parent.append_child(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Text(t)) => {
                    if let Some((parent, _)) = stack.last_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| CodecError::Malformed(e.to_string()))?;
                        parent.children.push(Node::Text(text.into_owned()));
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some((parent, _)) = stack.last_mut() {
                        let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                        parent.children.push(Node::Text(text));
                    }
                }
                Ok(Event::Decl(_))
                | Ok(Event::PI(_))
                | Ok(Event::Comment(_))
                | Ok(Event::DocType(_)) => {}
                Ok(Event::Eof) => {
                    return Err(CodecError::Malformed(if stack.is_empty() {
                        "no element".into()
                    } else {
                        "unclosed element".into()
                    }));
                }
                Err(e) => return Err(CodecError::Malformed(e.to_string())),
            }
        }
    }
}

/// Build an element from a start tag, returning it with the scope its
/// children inherit.
fn open_element(start: &BytesStart<'_>, parent: &NsScope) -> Result<(Element, NsScope), CodecError> {
    let mut scope = parent.clone();
    let mut attrs = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| CodecError::Malformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| CodecError::Malformed(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            scope.default = Some(value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.prefixes.insert(prefix.to_string(), value);
        } else {
            attrs.push((key, value));
        }
    }

    let raw_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let (prefix, local) = match raw_name.split_once(':') {
        Some((p, l)) => (Some(p), l),
        None => (None, raw_name.as_str()),
    };
    let ns = scope
        .resolve(prefix)
        .ok_or_else(|| CodecError::Malformed(format!("unbound prefix in <{}>", raw_name)))?
        .to_string();

    let element = Element {
        name: local.to_string(),
        ns,
        attrs,
        children: Vec::new(),
    };
    Ok((element, scope))
}
