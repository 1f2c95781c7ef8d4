//! XMPP Ping (XEP-0199).

use std::time::{Duration, Instant};

use tracing::debug;

use crate::xmpp::element::Element;
use crate::xmpp::error::Result;
use crate::xmpp::packet::{ns, Iq, IqType};
use crate::xmpp::Connection;

/// Whether `iq` is a ping we must answer with an empty result.
pub fn is_ping(iq: &Iq) -> bool {
    iq.kind == IqType::Get && iq.payload_is("ping", ns::PING).is_some()
}

/// A ping addressed to `to`, or to our own server when `None`.
pub fn request(to: Option<&str>) -> Iq {
    let iq = Iq::get(Element::new("ping", ns::PING));
    match to {
        Some(to) => iq.with_to(to),
        None => iq,
    }
}

impl Connection {
    /// Ping `to` (the server when `None`) and return the round-trip time.
    pub async fn ping(&self, to: Option<&str>) -> Result<Duration> {
        let iq = request(to);
        let id = iq.id.clone();
        let started = Instant::now();
        self.query(iq).await?;
        let rtt = started.elapsed();
        debug!(id = %id, rtt_ms = rtt.as_millis() as u64, "Pong");
        Ok(rtt)
    }
}
