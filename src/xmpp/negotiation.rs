//! Session establishment: stream open, STARTTLS, SASL, restart, bind, legacy
//! session and Stream Management.
//!
//! Everything up to the post-authentication features runs directly on the
//! owned transport, because the TLS swap and each stream restart need the
//! transport and the parser to themselves. From bind onward the dispatcher is
//! running and every step is an identifier-correlated round-trip.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::codec::ElementCodec;
use super::config::ClientConfig;
use super::element::Element;
use super::error::{Error, ProtocolViolation, Result};
use super::framing::{stream_open, STREAM_CLOSE};
use super::jid::Jid;
use super::packet::{self, ns, Envelope, Packet, SmElement, StreamFeatures, StreamHeader};
use super::stream_management::{spawn_loops, ResumptionToken};
use super::transport::{TlsUpgrader, Transport};
use super::{Connection, Outbound, SmSession};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Phase {
    Disconnected,
    StreamOpened,
    TlsNegotiating,
    TlsEstablished,
    /// Stream reopened over TLS.
    SecureStreamOpened,
    Authenticating,
    Authenticated,
    /// Stream reopened after SASL success.
    AuthStreamOpened,
    FeaturesReceived,
    Bound,
    SessionStarted,
    StreamManagementEnabled,
    Resumed,
    Established,
    Closed,
    Failed(String),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed(_))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Every phase a connection went through, newest last.
///
/// Terminal phases are sticky: once `Closed` or `Failed`, later updates are
/// ignored.
#[derive(Debug)]
pub(crate) struct PhaseLog(watch::Sender<Vec<Phase>>);

impl PhaseLog {
    pub fn new() -> Self {
        Self(watch::Sender::new(vec![Phase::Disconnected]))
    }

    pub fn set(&self, phase: Phase) {
        self.0.send_if_modified(|history| {
            if history.last().is_some_and(Phase::is_terminal) {
                return false;
            }
            debug!(%phase, "Phase transition");
            history.push(phase);
            true
        });
    }

    pub fn current(&self) -> Phase {
        self.0.borrow().last().cloned().unwrap_or(Phase::Disconnected)
    }

    pub fn history(&self) -> Vec<Phase> {
        self.0.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Phase>> {
        self.0.subscribe()
    }
}

/// Result of the pre-bind part of negotiation.
pub(crate) struct Negotiated {
    pub transport: Transport,
    pub codec: ElementCodec,
    pub header: StreamHeader,
    pub features: StreamFeatures,
}

/// Drives the negotiation steps that own the transport.
pub(crate) struct Negotiator<'a> {
    transport: Transport,
    codec: ElementCodec,
    config: &'a ClientConfig,
    server_name: String,
    phases: &'a PhaseLog,
}

impl<'a> Negotiator<'a> {
    pub fn new(transport: Transport, config: &'a ClientConfig, phases: &'a PhaseLog) -> Self {
        Self {
            transport,
            codec: ElementCodec::new(),
            config,
            server_name: config.jid.domain().to_string(),
            phases,
        }
    }

    async fn write(&mut self, data: &str) -> Result<()> {
        debug!(data, "XMPP out");
        self.transport.write_all(data.as_bytes()).await?;
        Ok(())
    }

    async fn send(&mut self, element: &Element) -> Result<()> {
        let data = ElementCodec::encode(element);
        self.write(&data).await
    }

    /// Wait for the next envelope of this negotiation step.
    async fn next(&mut self, expected: &'static str) -> Result<Envelope> {
        let timeout = self.config.negotiation_timeout;
        let decoded = tokio::time::timeout(
            timeout,
            self.codec.decode_next(self.transport.reader()),
        )
        .await
        .map_err(|_| Error::timeout(expected, timeout))?;

        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(super::error::CodecError::Unexpected(received)) => {
                return Err(ProtocolViolation::UnexpectedElement { expected, received }.into())
            }
            Err(e) => return Err(e.into()),
        };
        match envelope.packet {
            Packet::StreamError(info) => Err(ProtocolViolation::StreamError(info).into()),
            Packet::StreamClose => Err(ProtocolViolation::StreamClosed.into()),
            _ => Ok(envelope),
        }
    }

    fn unexpected(expected: &'static str, envelope: Envelope) -> Error {
        ProtocolViolation::UnexpectedElement {
            expected,
            received: envelope.name,
        }
        .into()
    }

    /// Send a stream header and read the server's header.
    async fn open_stream(&mut self, with_declaration: bool) -> Result<StreamHeader> {
        let open = stream_open(&self.server_name, with_declaration);
        self.write(&open).await?;
        let envelope = self.next("stream header").await?;
        match envelope.packet {
            Packet::StreamOpen(header) => {
                debug!(stream_id = ?header.id, from = ?header.from, "Stream opened");
                Ok(header)
            }
            _ => Err(Self::unexpected("stream header", envelope)),
        }
    }

    async fn read_features(&mut self) -> Result<StreamFeatures> {
        let envelope = self.next("stream features").await?;
        match envelope.packet {
            Packet::Features(features) => Ok(features),
            _ => Err(Self::unexpected("stream features", envelope)),
        }
    }

    async fn starttls(mut self, upgrader: &dyn TlsUpgrader) -> Result<Self> {
        self.phases.set(Phase::TlsNegotiating);
        self.send(&packet::starttls()).await?;
        let envelope = self.next("STARTTLS proceed").await?;
        match envelope.packet {
            Packet::TlsProceed => {}
            _ => return Err(Self::unexpected("STARTTLS proceed", envelope)),
        }

        // Nothing read from the plaintext stream past <proceed/> may survive the swap
        self.codec.discard_buffered();
        let plain = self.transport;
        self.transport = plain.upgrade(upgrader, &self.server_name).await?;
        self.codec.reset();
        self.phases.set(Phase::TlsEstablished);
        info!(server = %self.server_name, "STARTTLS complete");
        Ok(self)
    }

    async fn authenticate(&mut self, features: &StreamFeatures) -> Result<()> {
        if !features.supports_mechanism("PLAIN") {
            return Err(ProtocolViolation::MissingFeature("SASL PLAIN").into());
        }
        let authcid = self.config.jid.node().unwrap_or_default().to_string();
        self.phases.set(Phase::Authenticating);
        self.send(&packet::sasl_plain(&authcid, &self.config.password))
            .await?;

        let envelope = self.next("SASL outcome").await?;
        match envelope.packet {
            Packet::SaslSuccess => {
                self.phases.set(Phase::Authenticated);
                info!(user = %authcid, "Authenticated");
                Ok(())
            }
            Packet::SaslFailure(failure) => {
                warn!(condition = %failure.condition, text = ?failure.text, "SASL authentication failed");
                self.phases.set(Phase::Failed(failure.to_string()));
                if let Err(e) = self.write(STREAM_CLOSE).await {
                    debug!(error = %e, "Failed to send stream close after SASL failure");
                }
                Err(Error::Authentication(failure))
            }
            _ => Err(Self::unexpected("SASL outcome", envelope)),
        }
    }

    /// Run every step up to the post-authentication features.
    pub async fn run(mut self, upgrader: &dyn TlsUpgrader) -> Result<Negotiated> {
        self.open_stream(true).await?;
        let mut features = self.read_features().await?;
        self.phases.set(Phase::StreamOpened);

        if !self.transport.is_secure() {
            match features.starttls {
                Some(_) => {
                    self = self.starttls(upgrader).await?;
                    self.open_stream(false).await?;
                    features = self.read_features().await?;
                    self.phases.set(Phase::SecureStreamOpened);
                }
                None if self.config.require_tls => {
                    return Err(ProtocolViolation::MissingFeature("STARTTLS").into());
                }
                None => warn!(server = %self.server_name, "Server offers no STARTTLS, continuing in plaintext"),
            }
        }

        self.authenticate(&features).await?;

        self.codec.reset();
        let header = self.open_stream(false).await?;
        self.phases.set(Phase::AuthStreamOpened);
        let features = self.read_features().await?;
        self.phases.set(Phase::FeaturesReceived);
        if !features.bind {
            return Err(ProtocolViolation::MissingFeature("resource binding").into());
        }

        Ok(Negotiated {
            transport: self.transport,
            codec: self.codec,
            header,
            features,
        })
    }
}

/// Steps after the dispatcher took over: resume or bind, then legacy
/// session and Stream Management.
pub(crate) async fn complete_session(conn: &Connection, config: &ClientConfig) -> Result<()> {
    let timeout = config.negotiation_timeout;
    let features = conn.features().clone();

    if let (Some(token), Some(_)) = (&config.resume_from, features.stream_management) {
        if try_resume(conn, config, token).await? {
            conn.phases.set(Phase::Established);
            return Ok(());
        }
    }

    let jid = bind(conn, &config.resource, timeout).await?;
    info!(jid = %jid, "Resource bound");
    conn.set_jid(jid);
    conn.phases.set(Phase::Bound);

    // Legacy session only when the server does not mark it optional
    if features.session == Some(false) {
        conn.setup_query(packet::session(), timeout).await?;
        conn.phases.set(Phase::SessionStarted);
    }

    if let Some(version) = features.stream_management.filter(|_| config.stream_management) {
        enable_stream_management(conn, config, version).await?;
    }

    conn.phases.set(Phase::Established);
    Ok(())
}

async fn bind(conn: &Connection, resource: &str, timeout: Duration) -> Result<Jid> {
    let reply = conn.setup_query(packet::bind(resource), timeout).await?;
    let text = reply
        .payload_is("bind", ns::BIND)
        .and_then(|bind| bind.get_child("jid", ns::BIND))
        .map(|jid| jid.text())
        .ok_or_else(|| ProtocolViolation::Malformed("bind result without jid".into()))?;
    text.trim()
        .parse::<Jid>()
        .map_err(|e| ProtocolViolation::Malformed(format!("bound JID '{}': {}", text, e)).into())
}

async fn enable_stream_management(
    conn: &Connection,
    config: &ClientConfig,
    version: packet::SmVersion,
) -> Result<()> {
    let loops = spawn_loops(
        version,
        config.sm_window,
        0,
        conn.outbound.clone(),
        conn.events.clone(),
    );
    let reply = conn.expect_sm(loops.inputs).await?;
    conn.send_outbound(Outbound::StartCounting {
        element: packet::sm_enable(version, config.sm_resume),
        sinks: loops.sinks,
    })
    .await?;
    conn.track_tasks(loops.tasks).await;

    match conn.await_sm(reply, config.negotiation_timeout).await? {
        SmElement::Enabled {
            id,
            resume,
            max,
            location,
            ..
        } => {
            info!(%version, resumable = resume, "Stream management enabled");
            let resumption = match (resume, id, conn.jid()) {
                (true, Some(id), Some(jid)) => Some(ResumptionToken {
                    id,
                    jid,
                    version,
                    handled: 0,
                    location,
                    max,
                }),
                _ => None,
            };
            conn.set_stream_management(SmSession {
                version,
                window: config.sm_window,
                counters: loops.counters,
                resumption,
            });
            conn.phases.set(Phase::StreamManagementEnabled);
        }
        SmElement::Failed { condition, .. } => {
            warn!(?condition, "Server refused stream management, continuing without it");
            conn.send_outbound(Outbound::StopCounting).await?;
        }
        other => {
            return Err(ProtocolViolation::Malformed(format!("unexpected reply to enable: {:?}", other)).into())
        }
    }
    Ok(())
}

/// Returns `false` when the server refused to resume and a fresh bind is needed.
async fn try_resume(conn: &Connection, config: &ClientConfig, token: &ResumptionToken) -> Result<bool> {
    let loops = spawn_loops(
        token.version,
        config.sm_window,
        token.handled,
        conn.outbound.clone(),
        conn.events.clone(),
    );
    let reply = conn.expect_sm(loops.inputs).await?;
    conn.send_outbound(Outbound::StartCounting {
        element: packet::sm_resume(token.version, &token.id, token.handled),
        sinks: loops.sinks,
    })
    .await?;
    conn.track_tasks(loops.tasks).await;

    match conn.await_sm(reply, config.negotiation_timeout).await? {
        SmElement::Resumed { h, previd, .. } => {
            info!(previd = %previd, h, "Stream resumed");
            conn.send_outbound(Outbound::Rebase(h)).await?;
            conn.set_jid(token.jid.clone());
            conn.set_stream_management(SmSession {
                version: token.version,
                window: config.sm_window,
                counters: loops.counters,
                resumption: Some(token.clone()),
            });
            conn.phases.set(Phase::Resumed);
            Ok(true)
        }
        SmElement::Failed { condition, h, .. } => {
            warn!(?condition, ?h, "Resumption refused, binding a new session");
            conn.send_outbound(Outbound::StopCounting).await?;
            Ok(false)
        }
        other => Err(ProtocolViolation::Malformed(format!("unexpected reply to resume: {:?}", other)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_log_records_history() {
        let log = PhaseLog::new();
        log.set(Phase::StreamOpened);
        log.set(Phase::Authenticating);
        assert_eq!(log.current(), Phase::Authenticating);
        assert_eq!(
            log.history(),
            vec![Phase::Disconnected, Phase::StreamOpened, Phase::Authenticating]
        );
    }

    #[test]
    fn test_terminal_phase_is_sticky() {
        let log = PhaseLog::new();
        log.set(Phase::Failed("not-authorized".into()));
        log.set(Phase::Closed);
        assert_eq!(log.current(), Phase::Failed("not-authorized".into()));
        assert_eq!(log.current().to_string(), "Failed(not-authorized)");
    }

    #[tokio::test]
    async fn test_phase_log_notifies_subscribers() {
        let log = PhaseLog::new();
        let mut rx = log.subscribe();
        log.set(Phase::Closed);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().last(), Some(&Phase::Closed));
    }
}
