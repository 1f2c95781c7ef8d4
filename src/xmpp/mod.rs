//! XMPP client session engine.
//!
//! [`Connection::connect`] resolves the account's server, negotiates the
//! session and then hands the stream to three tasks: a reader turning bytes
//! into envelopes, a writer serializing the outbound queue, and the
//! dispatcher routing every envelope to its consumer.

mod codec;
pub mod config;
mod dispatcher;
pub mod dns;
pub mod element;
pub mod error;
pub mod extensions;
mod framing;
pub mod id;
pub mod jid;
mod negotiation;
pub mod packet;
pub mod stream_management;
pub mod tls;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use codec::ElementCodec;
use dispatcher::{Command, Dispatcher};
use element::Element;
use error::{CodecError, Error, ProtocolViolation, Result};
use framing::STREAM_CLOSE;
use jid::Jid;
use negotiation::{complete_session, Negotiator, PhaseLog};
use packet::{Envelope, Iq, IqType, SmElement, SmVersion, StanzaError, StreamFeatures};
use stream_management::{IntegrityViolation, ResumptionToken, SmCounters, SmInputs, SmStatus, WriterSinks};
use transport::{BoxedStream, TlsUpgrader, Transport};

pub use config::ClientConfig;
pub use negotiation::Phase;

/// Capacity of the outbound queue feeding the writer.
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Capacity of the reader to dispatcher queue.
const INBOUND_QUEUE_SIZE: usize = 256;

const EVENT_QUEUE_SIZE: usize = 256;

/// How long `close` waits for `</stream:stream>` to be flushed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Monotonic connection id for correlating logs across tasks.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Something happening on an established connection that nobody asked for.
#[derive(Debug, Clone)]
pub enum Event {
    Message(Element),
    Presence(Element),
    /// An inbound `get`/`set` this crate does not answer by itself. The
    /// subscriber is expected to reply with [`Connection::send`].
    Iq(Iq),
    StreamIntegrity(IntegrityViolation),
    /// The stream ended; carries the reason when it was not a clean close.
    Disconnected(Option<String>),
}

/// Work for the writer task.
pub(crate) enum Outbound {
    /// A user-level stanza, counted by Stream Management.
    Stanza(Element),
    /// Protocol control traffic (`<r/>`, `<a/>`), never counted.
    Control(Element),
    /// Write `element`, then count every later stanza from zero.
    StartCounting { element: Element, sinks: WriterSinks },
    /// Shift the send sequence by the server's `h` after a resumption.
    Rebase(u32),
    StopCounting,
    /// Write `</stream:stream>`, shut the socket down and stop.
    Close(oneshot::Sender<()>),
}

/// Stream Management as negotiated on this connection.
pub(crate) struct SmSession {
    pub version: SmVersion,
    pub window: u32,
    pub counters: SmCounters,
    pub resumption: Option<ResumptionToken>,
}

/// An established XMPP session.
pub struct Connection {
    conn_id: u64,
    jid: OnceLock<Jid>,
    features: StreamFeatures,
    stream_id: Option<String>,
    query_timeout: Duration,
    pub(crate) outbound: mpsc::Sender<Outbound>,
    commands: mpsc::UnboundedSender<Command>,
    pub(crate) events: broadcast::Sender<Event>,
    pub(crate) phases: Arc<PhaseLog>,
    sm: OnceLock<SmSession>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("jid", &self.jid.get())
            .field("phase", &self.phases.current())
            .finish()
    }
}

impl Connection {
    /// Resolve, connect and negotiate a session for `config`.
    pub async fn connect(config: ClientConfig) -> Result<Connection> {
        config.validate()?;
        let upgrader = tls::RustlsUpgrader::new(config.dangerous_insecure_tls)?;
        let endpoints = dns::candidates(config.server.as_deref(), config.jid.domain()).await?;
        let (endpoint, transport) =
            dns::connect_any(&endpoints, config.connect_timeout, &upgrader).await?;
        info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, "Connected to XMPP server");
        Self::establish(transport, &config, &upgrader).await
    }

    /// Negotiate a session over an already open transport.
    pub async fn establish(
        transport: Transport,
        config: &ClientConfig,
        upgrader: &dyn TlsUpgrader,
    ) -> Result<Connection> {
        config.validate()?;
        let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("xmpp", conn_id);
        let started = Instant::now();

        let phases = Arc::new(PhaseLog::new());
        let negotiated = match Negotiator::new(transport, config, &phases)
            .run(upgrader)
            .instrument(span.clone())
            .await
        {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!(conn_id, error = %e, "Negotiation failed");
                phases.set(Phase::Failed(e.to_string()));
                return Err(e);
            }
        };

        let conn = Self::start(conn_id, negotiated, config, phases, span.clone());
        if let Err(e) = complete_session(&conn, config).instrument(span).await {
            warn!(conn_id, error = %e, "Session setup failed");
            conn.phases.set(Phase::Failed(e.to_string()));
            conn.shutdown().await;
            return Err(e);
        }
        info!(
            conn_id,
            jid = %conn.jid().map(|j| j.to_string()).unwrap_or_default(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Session established"
        );
        Ok(conn)
    }

    /// Hand the negotiated stream to the reader, writer and dispatcher.
    fn start(
        conn_id: u64,
        negotiated: negotiation::Negotiated,
        config: &ClientConfig,
        phases: Arc<PhaseLog>,
        span: tracing::Span,
    ) -> Connection {
        let (read_half, write_half) = negotiated.transport.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_QUEUE_SIZE);

        let dispatcher = Dispatcher::new(outbound_tx.clone(), events.clone());
        let tasks = vec![
            tokio::spawn(reader_loop(read_half, negotiated.codec, inbound_tx).instrument(span.clone())),
            tokio::spawn(writer_loop(write_half, outbound_rx, command_tx.clone()).instrument(span.clone())),
            tokio::spawn(dispatcher.run(inbound_rx, command_rx, phases.clone()).instrument(span)),
        ];

        Connection {
            conn_id,
            jid: OnceLock::new(),
            features: negotiated.features,
            stream_id: negotiated.header.id,
            query_timeout: config.query_timeout,
            outbound: outbound_tx,
            commands: command_tx,
            events,
            phases,
            sm: OnceLock::new(),
            tasks: Mutex::new(tasks),
        }
    }

    /// The bound full JID, once resource binding or resumption completed.
    pub fn jid(&self) -> Option<Jid> {
        self.jid.get().cloned()
    }

    pub(crate) fn set_jid(&self, jid: Jid) {
        if self.jid.set(jid).is_err() {
            warn!(conn_id = self.conn_id, "Bound JID already set");
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Server stream id from the post-authentication header.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Features advertised after authentication.
    pub fn features(&self) -> &StreamFeatures {
        &self.features
    }

    pub fn phase(&self) -> Phase {
        self.phases.current()
    }

    pub fn phase_history(&self) -> Vec<Phase> {
        self.phases.history()
    }

    /// Follow phase transitions as they happen; the value is the full history.
    pub fn phase_updates(&self) -> watch::Receiver<Vec<Phase>> {
        self.phases.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn set_stream_management(&self, session: SmSession) {
        if self.sm.set(session).is_err() {
            warn!(conn_id = self.conn_id, "Stream management already enabled");
        }
    }

    /// Current Stream Management counters, when it was enabled.
    pub fn stream_management(&self) -> Option<SmStatus> {
        self.sm.get().map(|sm| SmStatus {
            version: sm.version,
            window: sm.window,
            handled: *sm.counters.handled.borrow(),
            sent: *sm.counters.sent.borrow(),
            acked: *sm.counters.acked.borrow(),
            resumable: sm.resumption.is_some(),
        })
    }

    /// A token for resuming this session later, if the server allows it.
    pub fn resumption_token(&self) -> Option<ResumptionToken> {
        let sm = self.sm.get()?;
        let mut token = sm.resumption.clone()?;
        token.handled = *sm.counters.handled.borrow();
        Some(token)
    }

    pub(crate) async fn send_outbound(&self, item: Outbound) -> Result<()> {
        self.outbound.send(item).await.map_err(|_| Error::Closed)
    }

    pub(crate) async fn track_tasks(&self, handles: Vec<JoinHandle<()>>) {
        self.tasks.lock().await.extend(handles);
    }

    /// Send a stanza without waiting for any reply.
    pub async fn send(&self, stanza: Element) -> Result<()> {
        self.send_outbound(Outbound::Stanza(stanza)).await
    }

    /// Send an iq request and wait for the reply with the same identifier,
    /// using the configured query timeout.
    pub async fn query(&self, iq: Iq) -> Result<Iq> {
        self.query_with_timeout(iq, self.query_timeout).await
    }

    /// Send an iq request and wait at most `timeout` for its reply.
    ///
    /// A reply of type `error` becomes [`Error::Stanza`]. On timeout the
    /// pending entry is removed and a late reply is dropped.
    pub async fn query_with_timeout(&self, iq: Iq, timeout: Duration) -> Result<Iq> {
        let id = iq.id.clone();
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Register {
                id: id.clone(),
                reply: tx,
            })
            .map_err(|_| Error::Closed)?;
        let guard = PendingGuard {
            id: Some(id.clone()),
            commands: &self.commands,
        };

        self.send(iq.to_element()).await?;
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                debug!(id = %id, timeout_ms = timeout.as_millis() as u64, "Query timed out");
                return Err(Error::timeout(format!("iq {}", id), timeout));
            }
        };
        guard.disarm();
        stanza_result(reply)
    }

    /// Like [`query_with_timeout`](Self::query_with_timeout), for session
    /// setup requests that are the only query in flight. A reply carrying
    /// any other identifier fails with [`ProtocolViolation::MismatchedId`].
    pub(crate) async fn setup_query(&self, iq: Iq, timeout: Duration) -> Result<Iq> {
        let id = iq.id.clone();
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ExpectStep {
                id: id.clone(),
                reply: tx,
            })
            .map_err(|_| Error::Closed)?;
        let guard = PendingGuard {
            id: Some(id.clone()),
            commands: &self.commands,
        };

        self.send(iq.to_element()).await?;
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(reply))) => reply,
            Ok(Ok(Err(violation))) => return Err(violation.into()),
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => return Err(Error::timeout(format!("iq {}", id), timeout)),
        };
        guard.disarm();
        stanza_result(reply)
    }

    /// Register interest in the next SM outcome before sending the request.
    pub(crate) async fn expect_sm(
        &self,
        inputs: SmInputs,
    ) -> Result<oneshot::Receiver<std::result::Result<SmElement, ProtocolViolation>>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ExpectSm { inputs, reply })
            .map_err(|_| Error::Closed)?;
        Ok(rx)
    }

    pub(crate) async fn await_sm(
        &self,
        rx: oneshot::Receiver<std::result::Result<SmElement, ProtocolViolation>>,
        timeout: Duration,
    ) -> Result<SmElement> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(element))) => Ok(element),
            Ok(Ok(Err(violation))) => Err(violation.into()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::timeout("stream management reply", timeout)),
        }
    }

    /// Close the stream and stop every task. Safe to call more than once and
    /// concurrently; waiting queries fail with [`Error::Closed`].
    pub async fn close(&self) {
        if self.phases.current().is_terminal() && self.tasks.lock().await.is_empty() {
            return;
        }
        info!(conn_id = self.conn_id, "Closing connection");
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }
        // The queue and the socket can both be stuck behind a peer that stopped reading
        let flushed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
            let (done_tx, done_rx) = oneshot::channel();
            if self.outbound.send(Outbound::Close(done_tx)).await.is_ok() {
                let _ = done_rx.await;
            }
        })
        .await;
        if flushed.is_err() {
            warn!(conn_id = self.conn_id, "Stream close not flushed in time, aborting");
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        self.phases.set(Phase::Closed);
    }
}

fn stanza_result(reply: Iq) -> Result<Iq> {
    match reply.kind {
        IqType::Error => Err(Error::Stanza(
            reply
                .error
                .unwrap_or_else(|| StanzaError::new("cancel", "undefined-condition")),
        )),
        _ => Ok(reply),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Cancels a pending query unless a reply was received.
struct PendingGuard<'a> {
    id: Option<String>,
    commands: &'a mpsc::UnboundedSender<Command>,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let _ = self.commands.send(Command::Cancel { id });
        }
    }
}

async fn reader_loop(
    mut reader: ReadHalf<BoxedStream>,
    mut codec: ElementCodec,
    inbound: mpsc::Sender<std::result::Result<Envelope, CodecError>>,
) {
    loop {
        let decoded = tokio::select! {
            decoded = codec.decode_next(&mut reader) => decoded,
            // Dispatcher gone
            _ = inbound.closed() => break,
        };
        let fatal = matches!(&decoded, Err(e) if !e.is_recoverable());
        if inbound.send(decoded).await.is_err() || fatal {
            break;
        }
    }
    debug!("Reader stopped");
}

async fn writer_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::Receiver<Outbound>,
    commands: mpsc::UnboundedSender<Command>,
) {
    let mut counting: Option<WriterSinks> = None;
    let mut seq: u32 = 0;

    loop {
        let item = tokio::select! {
            biased;
            item = outbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
            // The dispatcher ended the session
            _ = commands.closed() => break,
        };
        let data = match item {
            Outbound::Stanza(element) => {
                if let Some(sinks) = &counting {
                    seq = seq.wrapping_add(1);
                    sinks.sent(seq);
                }
                ElementCodec::encode(&element)
            }
            Outbound::Control(element) => ElementCodec::encode(&element),
            Outbound::StartCounting { element, sinks } => {
                seq = 0;
                counting = Some(sinks);
                ElementCodec::encode(&element)
            }
            Outbound::Rebase(h) => {
                seq = h.wrapping_add(seq);
                if let Some(sinks) = &counting {
                    sinks.rebase(h, seq);
                }
                continue;
            }
            Outbound::StopCounting => {
                counting = None;
                continue;
            }
            Outbound::Close(done) => {
                debug!(data = STREAM_CLOSE, "XMPP out");
                if let Err(e) = writer.write_all(STREAM_CLOSE.as_bytes()).await {
                    debug!(error = %e, "Failed to send stream close");
                }
                let _ = writer.shutdown().await;
                let _ = done.send(());
                break;
            }
        };

        debug!(data = %data, seq, "XMPP out");
        let written = async {
            writer.write_all(data.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "Write failed, stopping writer");
            let _ = commands.send(Command::TransportFailed(format!("write failed: {}", e)));
            break;
        }
    }
    debug!(seq, "Writer stopped");
}
