//! XMPP client session engine used by Fluux.
//!
//! See [`xmpp::Connection`] for the entry point.

pub mod xmpp;

pub use xmpp::error::{Error, Result};
pub use xmpp::{ClientConfig, Connection, Event, Phase};
