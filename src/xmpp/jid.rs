//! Jabber identifiers (`node@domain/resource`).

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JidError {
    #[error("empty domain in JID")]
    EmptyDomain,
    #[error("empty localpart in JID")]
    EmptyNode,
    #[error("empty resource in JID")]
    EmptyResource,
}

impl Jid {
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The account part without any resource.
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: impl Into<String>) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.into()),
        }
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Resource may itself contain '@' or '/', so split it off first
        let (rest, resource) = match s.split_once('/') {
            Some((rest, res)) => {
                if res.is_empty() {
                    return Err(JidError::EmptyResource);
                }
                (rest, Some(res.to_string()))
            }
            None => (s, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => {
                if node.is_empty() {
                    return Err(JidError::EmptyNode);
                }
                (Some(node.to_string()), domain)
            }
            None => (None, rest),
        };
        if domain.is_empty() {
            return Err(JidError::EmptyDomain);
        }
        Ok(Jid {
            node,
            domain: domain.to_ascii_lowercase(),
            resource,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "user@example.com/mobile".parse().unwrap();
        assert_eq!(jid.node(), Some("user"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("mobile"));
        assert!(jid.is_full());
        assert_eq!(jid.to_string(), "user@example.com/mobile");
    }

    #[test]
    fn test_parse_bare_and_domain_jids() {
        let bare: Jid = "user@example.com".parse().unwrap();
        assert_eq!(bare.resource(), None);
        let domain: Jid = "example.com".parse().unwrap();
        assert_eq!(domain.node(), None);
        assert_eq!(domain.to_string(), "example.com");
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let jid: Jid = "room@conference.example.com/nick@home/x".parse().unwrap();
        assert_eq!(jid.domain(), "conference.example.com");
        assert_eq!(jid.resource(), Some("nick@home/x"));
    }

    #[test]
    fn test_domain_is_lowercased() {
        let jid: Jid = "User@Example.COM".parse().unwrap();
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.node(), Some("User"));
    }

    #[test]
    fn test_invalid_jids() {
        assert_eq!("@example.com".parse::<Jid>(), Err(JidError::EmptyNode));
        assert_eq!("user@".parse::<Jid>(), Err(JidError::EmptyDomain));
        assert_eq!("user@example.com/".parse::<Jid>(), Err(JidError::EmptyResource));
    }

    #[test]
    fn test_with_resource_and_bare() {
        let bare: Jid = "user@example.com".parse().unwrap();
        let full = bare.with_resource("desk");
        assert_eq!(full.to_string(), "user@example.com/desk");
        assert_eq!(full.to_bare(), bare);
    }
}
