//! Service Discovery info (XEP-0030).

use serde::Serialize;
use tracing::info;

use crate::xmpp::element::Element;
use crate::xmpp::error::{ProtocolViolation, Result};
use crate::xmpp::packet::{ns, Iq, IqType};
use crate::xmpp::Connection;

pub const CLIENT_NAME: &str = "Fluux";

/// Features this client answers for.
pub const CLIENT_FEATURES: &[&str] = &[ns::DISCO_INFO, ns::PING];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub category: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoInfo {
    pub node: Option<String>,
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
}

impl DiscoInfo {
    pub fn from_query(query: &Element) -> Self {
        let identities = query
            .children()
            .filter(|c| c.is("identity", ns::DISCO_INFO))
            .map(|c| Identity {
                category: c.attr("category").unwrap_or_default().to_string(),
                kind: c.attr("type").unwrap_or_default().to_string(),
                name: c.attr("name").map(str::to_string),
            })
            .collect();
        let features = query
            .children()
            .filter(|c| c.is("feature", ns::DISCO_INFO))
            .filter_map(|c| c.attr("var"))
            .map(str::to_string)
            .collect();
        DiscoInfo {
            node: query.attr("node").map(str::to_string),
            identities,
            features,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn to_element(&self) -> Element {
        let mut query = Element::new("query", ns::DISCO_INFO);
        if let Some(node) = &self.node {
            query.set_attr("node", node.clone());
        }
        for identity in &self.identities {
            let mut el = Element::new("identity", ns::DISCO_INFO)
                .with_attr("category", identity.category.clone())
                .with_attr("type", identity.kind.clone());
            if let Some(name) = &identity.name {
                el.set_attr("name", name.clone());
            }
            query.append_child(el);
        }
        for feature in &self.features {
            query.append_child(Element::new("feature", ns::DISCO_INFO).with_attr("var", feature.clone()));
        }
        query
    }
}

/// The query of an inbound disco#info `get`.
pub fn info_query(iq: &Iq) -> Option<&Element> {
    if iq.kind != IqType::Get {
        return None;
    }
    iq.payload_is("query", ns::DISCO_INFO)
}

/// What we answer to a disco#info request about ourselves.
///
/// The requested node (a caps `node#ver`) is echoed back.
pub fn client_info(node: Option<&str>) -> Element {
    DiscoInfo {
        node: node.map(str::to_string),
        identities: vec![Identity {
            category: "client".into(),
            kind: "pc".into(),
            name: Some(CLIENT_NAME.into()),
        }],
        features: CLIENT_FEATURES.iter().map(|f| f.to_string()).collect(),
    }
    .to_element()
}

pub fn request(to: Option<&str>, node: Option<&str>) -> Iq {
    let mut query = Element::new("query", ns::DISCO_INFO);
    if let Some(node) = node {
        query.set_attr("node", node);
    }
    let iq = Iq::get(query);
    match to {
        Some(to) => iq.with_to(to),
        None => iq,
    }
}

impl Connection {
    /// Ask `to` (our server when `None`) for its identities and features.
    pub async fn disco_info(&self, to: Option<&str>, node: Option<&str>) -> Result<DiscoInfo> {
        let reply = self.query(request(to, node)).await?;
        let query = reply
            .payload_is("query", ns::DISCO_INFO)
            .ok_or_else(|| ProtocolViolation::Malformed("disco#info result without query".into()))?;
        let info = DiscoInfo::from_query(query);
        info!(
            entity = to.unwrap_or("server"),
            identities = info.identities.len(),
            features = info.features.len(),
            "Discovery complete"
        );
        Ok(info)
    }
}
