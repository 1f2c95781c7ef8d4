//! Roster retrieval (RFC 6121 section 2).

use serde::Serialize;
use tracing::{info, warn};

use crate::xmpp::element::Element;
use crate::xmpp::error::Result;
use crate::xmpp::jid::Jid;
use crate::xmpp::packet::{ns, Iq};
use crate::xmpp::Connection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterItem {
    pub jid: Jid,
    pub name: Option<String>,
    /// `none`, `to`, `from` or `both`.
    pub subscription: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Roster {
    /// Version to send on the next request, when the server versions rosters.
    pub ver: Option<String>,
    pub items: Vec<RosterItem>,
}

impl Roster {
    /// Parse a roster result. A result without a query means the roster is
    /// unchanged since the version we sent.
    pub fn from_query(query: Option<&Element>) -> Self {
        let Some(query) = query else {
            return Roster::default();
        };
        let items = query
            .children()
            .filter(|c| c.is("item", ns::ROSTER))
            .filter_map(|item| {
                let raw = item.attr("jid")?;
                match raw.parse::<Jid>() {
                    Ok(jid) => Some(RosterItem {
                        jid,
                        name: item.attr("name").map(str::to_string),
                        subscription: item.attr("subscription").unwrap_or("none").to_string(),
                        groups: item
                            .children()
                            .filter(|g| g.is("group", ns::ROSTER))
                            .map(|g| g.text())
                            .collect(),
                    }),
                    Err(e) => {
                        warn!(jid = raw, error = %e, "Skipping roster item with invalid JID");
                        None
                    }
                }
            })
            .collect();
        Roster {
            ver: query.attr("ver").map(str::to_string),
            items,
        }
    }
}

/// A roster get; `ver` is only included when the server supports versioning.
pub fn request(ver: Option<&str>) -> Iq {
    let mut query = Element::new("query", ns::ROSTER);
    if let Some(ver) = ver {
        query.set_attr("ver", ver);
    }
    Iq::get(query)
}

impl Connection {
    /// Fetch the full roster.
    pub async fn get_roster(&self) -> Result<Roster> {
        let ver = self.features().roster_versioning.then_some("");
        let reply = self.query(request(ver)).await?;
        let roster = Roster::from_query(reply.payload_is("query", ns::ROSTER));
        info!(items = roster.items.len(), ver = ?roster.ver, "Roster received");
        Ok(roster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::element::NsScope;

    #[test]
    fn test_parse_roster() {
        let xml = "<query xmlns='jabber:iq:roster' ver='ver7'>\
            <item jid='romeo@example.net' name='Romeo' subscription='both'><group>Friends</group><group>Lovers</group></item>\
            <item jid='nurse@example.com'/>\
            <item jid='@broken'/>\
            </query>";
        let query = Element::parse(xml, &NsScope::new(Some(ns::CLIENT))).unwrap();
        let roster = Roster::from_query(Some(&query));

        assert_eq!(roster.ver.as_deref(), Some("ver7"));
        assert_eq!(roster.items.len(), 2);
        assert_eq!(roster.items[0].jid.to_string(), "romeo@example.net");
        assert_eq!(roster.items[0].name.as_deref(), Some("Romeo"));
        assert_eq!(roster.items[0].groups, vec!["Friends", "Lovers"]);
        assert_eq!(roster.items[1].subscription, "none");
        assert!(roster.items[1].groups.is_empty());
    }

    #[test]
    fn test_unchanged_roster_is_empty() {
        assert_eq!(Roster::from_query(None), Roster::default());
    }

    #[test]
    fn test_request_includes_ver_only_when_given() {
        let plain = request(None).to_element();
        let query = plain.get_child("query", ns::ROSTER).unwrap();
        assert_eq!(query.attr("ver"), None);

        let versioned = request(Some("")).to_element();
        let query = versioned.get_child("query", ns::ROSTER).unwrap();
        assert_eq!(query.attr("ver"), Some(""));
    }
}
