//! Single demultiplexing point for inbound envelopes.
//!
//! Each decoded envelope is looked at exactly once, in wire order:
//! Stream Management control elements go to the SM loops, `result`/`error`
//! iqs complete the pending query with the same identifier, and everything
//! else is answered automatically or published as an [`Event`].

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::{CodecError, ProtocolViolation};
use super::extensions::{disco, ping};
use super::negotiation::{Phase, PhaseLog};
use super::packet::{ns, Envelope, Iq, IqType, Packet, SmElement, StanzaError};
use super::stream_management::SmInputs;
use super::{Event, Outbound};

pub(crate) type SmReply = oneshot::Sender<Result<SmElement, ProtocolViolation>>;
pub(crate) type StepReply = oneshot::Sender<Result<Iq, ProtocolViolation>>;

pub(crate) enum Command {
    /// Deliver the iq answering `id` to `reply`.
    Register { id: String, reply: oneshot::Sender<Iq> },
    /// The caller stopped waiting for `id`.
    Cancel { id: String },
    /// Deliver the next `<enabled/>`, `<resumed/>` or `<failed/>`. On success
    /// `inputs` start receiving SM traffic from the element right after it.
    ExpectSm { inputs: SmInputs, reply: SmReply },
    /// A session setup request (bind, session) is the only query in flight:
    /// any `result`/`error` iq that is not for a registered query is a
    /// violation rather than noise.
    ExpectStep { id: String, reply: StepReply },
    /// The writer could not put bytes on the wire.
    TransportFailed(String),
}

/// Whether the dispatcher keeps running after an envelope.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// The stream ended, cleanly or with the server's reason.
    Stop(Option<String>),
    /// The transport or the byte stream broke under us.
    Fail(String),
}

/// Whether a skipped element still counts as a stanza the server sent.
fn counts_as_stanza(error: &CodecError) -> bool {
    match error {
        CodecError::Unexpected(name) | CodecError::InvalidStanza { name: Some(name), .. } => {
            name.ns != ns::SM_2 && name.ns != ns::SM_3
        }
        CodecError::InvalidStanza { name: None, .. } => true,
        _ => false,
    }
}

pub(crate) struct Dispatcher {
    pending: HashMap<String, oneshot::Sender<Iq>>,
    sm_waiter: Option<(SmInputs, SmReply)>,
    step: Option<(String, StepReply)>,
    sm: Option<SmInputs>,
    outbound: mpsc::Sender<Outbound>,
    events: broadcast::Sender<Event>,
}

impl Dispatcher {
    pub fn new(outbound: mpsc::Sender<Outbound>, events: broadcast::Sender<Event>) -> Self {
        Self {
            pending: HashMap::new(),
            sm_waiter: None,
            step: None,
            sm: None,
            outbound,
            events,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Register { id, reply } => {
                // Identifiers are fresh per request; a clash would be a minting bug
                if self.pending.insert(id.clone(), reply).is_some() {
                    warn!(id = %id, "Replaced pending query with duplicate identifier");
                }
            }
            Command::Cancel { id } => {
                if self.pending.remove(&id).is_some() {
                    debug!(id = %id, "Pending query cancelled");
                }
                if matches!(&self.step, Some((expected, _)) if *expected == id) {
                    self.step = None;
                }
            }
            Command::ExpectSm { inputs, reply } => {
                self.sm_waiter = Some((inputs, reply));
            }
            Command::ExpectStep { id, reply } => {
                self.step = Some((id, reply));
            }
            Command::TransportFailed(reason) => {
                warn!(%reason, "Writer failed");
                return Flow::Fail(reason);
            }
        }
        Flow::Continue
    }

    /// Route one envelope. Returns [`Flow::Stop`] when the stream has ended.
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Flow {
        if let Some(sm) = &self.sm {
            if !envelope.packet.is_stream_management() {
                sm.handled();
            }
        }

        match envelope.packet {
            Packet::Sm(element) => self.handle_sm(element),
            Packet::Iq(iq) => self.handle_iq(iq).await,
            Packet::Message(el) => {
                let _ = self.events.send(Event::Message(el));
            }
            Packet::Presence(el) => {
                let _ = self.events.send(Event::Presence(el));
            }
            Packet::StreamClose => {
                info!("Server closed the stream");
                return Flow::Stop(None);
            }
            Packet::StreamError(info) => {
                warn!(condition = %info.condition, text = ?info.text, "Stream error from server");
                return Flow::Stop(Some(info.to_string()));
            }
            other => {
                warn!(element = %envelope.name, kind = other.kind(), "Unexpected element after negotiation");
                self.fail_sm_waiter(ProtocolViolation::UnexpectedElement {
                    expected: "stream management reply",
                    received: envelope.name,
                });
            }
        }
        Flow::Continue
    }

    /// A decode failure. Recoverable ones are logged and skipped, but still
    /// counted when they stand for a stanza.
    pub fn handle_decode_error(&mut self, error: CodecError) -> Flow {
        if let Some(sm) = &self.sm {
            if counts_as_stanza(&error) {
                sm.handled();
            }
        }

        match error {
            CodecError::Unexpected(name) => {
                warn!(element = %name, "Ignoring unsupported element");
                self.fail_sm_waiter(ProtocolViolation::UnknownElement(name));
                Flow::Continue
            }
            CodecError::InvalidStanza { name, detail } => {
                warn!(element = ?name, %detail, "Ignoring invalid stanza");
                if matches!(&name, Some(name) if name.ns == ns::CLIENT && name.local == "iq") {
                    if let Some((_, reply)) = self.step.take() {
                        let _ = reply.send(Err(ProtocolViolation::Malformed(detail)));
                    }
                }
                Flow::Continue
            }
            CodecError::Malformed(detail) => {
                warn!(%detail, "Ignoring malformed element");
                Flow::Continue
            }
            CodecError::Eof => {
                info!("Server closed the connection");
                Flow::Stop(None)
            }
            other => {
                warn!(error = %other, "Inbound stream failed");
                Flow::Fail(other.to_string())
            }
        }
    }

    fn fail_sm_waiter(&mut self, violation: ProtocolViolation) {
        if let Some((_, reply)) = self.sm_waiter.take() {
            let _ = reply.send(Err(violation));
        }
    }

    fn handle_sm(&mut self, element: SmElement) {
        match element {
            SmElement::Request { .. } => match &self.sm {
                Some(sm) => sm.request(),
                None => debug!("Ack request before stream management was enabled"),
            },
            SmElement::Answer { h, .. } => match &self.sm {
                Some(sm) => sm.answer(h),
                None => debug!(h, "Ack answer before stream management was enabled"),
            },
            outcome => match self.sm_waiter.take() {
                Some((inputs, reply)) => {
                    if matches!(outcome, SmElement::Enabled { .. } | SmElement::Resumed { .. }) {
                        self.sm = Some(inputs);
                    }
                    let _ = reply.send(Ok(outcome));
                }
                None => warn!(?outcome, "Unsolicited stream management element"),
            },
        }
    }

    async fn handle_iq(&mut self, iq: Iq) {
        if !iq.is_request() {
            if let Some(waiter) = self.pending.remove(&iq.id) {
                if waiter.send(iq).is_err() {
                    debug!("Query caller went away before its reply");
                }
                return;
            }
            match self.step.take() {
                Some((expected, reply)) if expected == iq.id => {
                    let _ = reply.send(Ok(iq));
                }
                Some((expected, reply)) => {
                    warn!(expected = %expected, received = %iq.id, "Reply does not match setup request");
                    let _ = reply.send(Err(ProtocolViolation::MismatchedId {
                        expected,
                        received: iq.id,
                    }));
                }
                None => debug!(id = %iq.id, "Dropping reply with no pending query"),
            }
            return;
        }

        let reply = if ping::is_ping(&iq) {
            Some(Iq::result_for(&iq, None))
        } else if let Some(query) = disco::info_query(&iq) {
            Some(Iq::result_for(&iq, Some(disco::client_info(query.attr("node")))))
        } else if self.events.receiver_count() > 0 {
            let _ = self.events.send(Event::Iq(iq));
            None
        } else {
            debug!(id = %iq.id, "No handler for request, answering service-unavailable");
            Some(Iq::error_for(&iq, StanzaError::new("cancel", "service-unavailable")))
        };

        if let Some(reply) = reply {
            if self.outbound.send(Outbound::Stanza(reply.to_element())).await.is_err() {
                debug!("Writer gone, reply not sent");
            }
        }
    }

    /// Run until the stream ends, then release every waiter.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Result<Envelope, CodecError>>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        phases: std::sync::Arc<PhaseLog>,
    ) {
        let (reason, failed) = loop {
            let flow = tokio::select! {
                // Registrations always land before the reply they wait for
                biased;
                Some(command) = commands.recv() => self.handle_command(command),
                decoded = inbound.recv() => match decoded {
                    Some(Ok(envelope)) => self.handle_envelope(envelope).await,
                    Some(Err(error)) => self.handle_decode_error(error),
                    None => Flow::Stop(None),
                },
            };
            match flow {
                Flow::Continue => {}
                Flow::Stop(reason) => break (reason, false),
                Flow::Fail(reason) => break (Some(reason), true),
            }
        };

        let abandoned = self.pending.len();
        self.pending.clear();
        self.sm_waiter = None;
        self.step = None;
        self.sm = None;
        info!(abandoned, reason = ?reason, failed, "Dispatcher stopped");
        match (&reason, failed) {
            (Some(reason), true) => phases.set(Phase::Failed(reason.clone())),
            _ => phases.set(Phase::Closed),
        }
        let _ = self.events.send(Event::Disconnected(reason));
    }
}
