//! XEP-0198 Stream Management accounting.
//!
//! Once `<enabled/>` arrives, three loops run for the rest of the connection:
//!
//! - the answer loop owns the inbound `handled` counter and replies `<a h/>`
//!   to every `<r/>` from the server;
//! - the request loop watches the writer's send sequence and emits `<r/>`
//!   every `window` stanzas;
//! - the verify loop checks each `<a h/>` from the server against what was
//!   actually sent and publishes [`IntegrityViolation`]s.
//!
//! The writer owns `seq`. Nothing here is shared memory: every counter lives in
//! exactly one loop and is published through a `watch` channel for readers.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use super::jid::Jid;
use super::packet::{self, SmVersion};
use super::{Event, Outbound};

/// Everything needed to ask a server to resume a previous session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumptionToken {
    pub id: String,
    pub jid: Jid,
    pub version: SmVersion,
    /// Inbound stanzas handled when the token was taken.
    pub handled: u32,
    /// Preferred reconnection address advertised by the server.
    pub location: Option<String>,
    /// Server-side resumption timeout, in seconds.
    pub max: Option<u32>,
}

/// Snapshot of the counters, for status display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmStatus {
    pub version: SmVersion,
    pub window: u32,
    pub handled: u32,
    pub sent: u32,
    pub acked: u32,
    pub resumable: bool,
}

/// The server's acknowledgment disagrees with what this side sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityViolation {
    #[error("server acknowledged {reported} after already acknowledging {acked}")]
    Regression { reported: u32, acked: u32 },
    #[error("server acknowledged {reported} but only {sent} stanzas were sent")]
    AheadOfSent { reported: u32, sent: u32 },
}

/// Inbound `handled` counter, modulo 2^32.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundCounter(u32);

impl InboundCounter {
    pub fn starting_at(h: u32) -> Self {
        Self(h)
    }

    pub fn record(&mut self) -> u32 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Checks server acknowledgments against the local send sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckVerifier {
    sent: u32,
    acked: u32,
}

impl AckVerifier {
    /// Both counters at `h`, as after `<resumed h/>`.
    pub fn starting_at(h: u32) -> Self {
        Self { sent: h, acked: h }
    }

    pub fn record_sent(&mut self, seq: u32) {
        self.sent = seq;
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// Accept `h` if it lies between the last acknowledgment and the send
    /// sequence, in wrapping arithmetic. The last good value is kept otherwise.
    pub fn verify(&mut self, h: u32) -> Result<(), IntegrityViolation> {
        let outstanding = self.sent.wrapping_sub(self.acked);
        let advance = h.wrapping_sub(self.acked);
        if advance <= outstanding {
            self.acked = h;
            return Ok(());
        }
        // Anything within half the ring behind the last ack is a step backwards
        let behind = self.acked.wrapping_sub(h);
        if behind < (1 << 31) {
            Err(IntegrityViolation::Regression {
                reported: h,
                acked: self.acked,
            })
        } else {
            Err(IntegrityViolation::AheadOfSent {
                reported: h,
                sent: self.sent,
            })
        }
    }
}

/// Input to the answer loop, fed by the dispatcher in receive order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnswerInput {
    Handled,
    Request,
}

/// Input to the verify loop. The writer and the dispatcher share this one
/// channel so a stanza's `Sent` always precedes the answer covering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifyInput {
    Sent(u32),
    Answer(u32),
    Rebase { acked: u32, sent: u32 },
}

/// Channels the dispatcher feeds once Stream Management is active.
#[derive(Debug, Clone)]
pub(crate) struct SmInputs {
    pub answer: mpsc::UnboundedSender<AnswerInput>,
    pub verify: mpsc::UnboundedSender<VerifyInput>,
}

impl SmInputs {
    pub fn handled(&self) {
        let _ = self.answer.send(AnswerInput::Handled);
    }

    pub fn request(&self) {
        let _ = self.answer.send(AnswerInput::Request);
    }

    pub fn answer(&self, h: u32) {
        let _ = self.verify.send(VerifyInput::Answer(h));
    }
}

/// Channels the writer feeds while counting.
#[derive(Debug, Clone)]
pub(crate) struct WriterSinks {
    pub request: mpsc::UnboundedSender<u32>,
    pub verify: mpsc::UnboundedSender<VerifyInput>,
}

impl WriterSinks {
    pub fn sent(&self, seq: u32) {
        let _ = self.verify.send(VerifyInput::Sent(seq));
        let _ = self.request.send(seq);
    }

    pub fn rebase(&self, acked: u32, sent: u32) {
        let _ = self.verify.send(VerifyInput::Rebase { acked, sent });
    }
}

/// Read side of the counters.
#[derive(Debug, Clone)]
pub(crate) struct SmCounters {
    pub handled: watch::Receiver<u32>,
    pub sent: watch::Receiver<u32>,
    pub acked: watch::Receiver<u32>,
}

pub(crate) struct SmLoops {
    pub inputs: SmInputs,
    pub sinks: WriterSinks,
    pub counters: SmCounters,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Spawn the answer, request and verify loops.
///
/// They stop on their own once the dispatcher and the writer drop their ends
/// of the input channels; the connection also aborts them on close.
pub(crate) fn spawn_loops(
    version: SmVersion,
    window: u32,
    initial_handled: u32,
    outbound: mpsc::Sender<Outbound>,
    events: broadcast::Sender<Event>,
) -> SmLoops {
    let (answer_tx, answer_rx) = mpsc::unbounded_channel();
    let (verify_tx, verify_rx) = mpsc::unbounded_channel();
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (handled_tx, handled_rx) = watch::channel(initial_handled);
    let (sent_tx, sent_rx) = watch::channel(0);
    let (acked_tx, acked_rx) = watch::channel(0);

    let span = tracing::debug_span!("sm", version = %version);
    let tasks = vec![
        tokio::spawn(
            answer_loop(
                version,
                answer_rx,
                outbound.clone(),
                handled_tx,
                InboundCounter::starting_at(initial_handled),
            )
            .instrument(span.clone()),
        ),
        tokio::spawn(request_loop(version, window, request_rx, outbound).instrument(span.clone())),
        tokio::spawn(
            verify_loop(verify_rx, sent_tx, acked_tx, events, AckVerifier::default()).instrument(span),
        ),
    ];

    SmLoops {
        inputs: SmInputs {
            answer: answer_tx,
            verify: verify_tx.clone(),
        },
        sinks: WriterSinks {
            request: request_tx,
            verify: verify_tx,
        },
        counters: SmCounters {
            handled: handled_rx,
            sent: sent_rx,
            acked: acked_rx,
        },
        tasks,
    }
}

async fn answer_loop(
    version: SmVersion,
    mut inputs: mpsc::UnboundedReceiver<AnswerInput>,
    outbound: mpsc::Sender<Outbound>,
    handled_tx: watch::Sender<u32>,
    mut counter: InboundCounter,
) {
    while let Some(input) = inputs.recv().await {
        match input {
            AnswerInput::Handled => {
                handled_tx.send_replace(counter.record());
            }
            AnswerInput::Request => {
                let h = counter.value();
                debug!(h, "Answering ack request");
                if outbound
                    .send(Outbound::Control(packet::sm_answer(version, h)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    debug!(handled = counter.value(), "Answer loop stopped");
}

async fn request_loop(
    version: SmVersion,
    window: u32,
    mut sent: mpsc::UnboundedReceiver<u32>,
    outbound: mpsc::Sender<Outbound>,
) {
    while let Some(seq) = sent.recv().await {
        if window > 0 && seq % window == 0 {
            debug!(seq, window, "Requesting ack");
            if outbound
                .send(Outbound::Control(packet::sm_request(version)))
                .await
                .is_err()
            {
                break;
            }
        }
    }
    debug!("Request loop stopped");
}

async fn verify_loop(
    mut inputs: mpsc::UnboundedReceiver<VerifyInput>,
    sent_tx: watch::Sender<u32>,
    acked_tx: watch::Sender<u32>,
    events: broadcast::Sender<Event>,
    mut verifier: AckVerifier,
) {
    while let Some(input) = inputs.recv().await {
        match input {
            VerifyInput::Sent(seq) => {
                verifier.record_sent(seq);
                sent_tx.send_replace(seq);
            }
            VerifyInput::Answer(h) => match verifier.verify(h) {
                Ok(()) => {
                    debug!(h, sent = verifier.sent(), "Ack verified");
                    acked_tx.send_replace(h);
                }
                Err(violation) => {
                    warn!(h, sent = verifier.sent(), acked = verifier.acked(), %violation, "Stream integrity violation");
                    let _ = events.send(Event::StreamIntegrity(violation));
                }
            },
            VerifyInput::Rebase { acked, sent } => {
                verifier = AckVerifier::starting_at(acked);
                verifier.record_sent(sent);
                sent_tx.send_replace(sent);
                acked_tx.send_replace(acked);
            }
        }
    }
    debug!("Verify loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn answered_h(out: Outbound) -> u32 {
        match out {
            Outbound::Control(el) => {
                assert!(el.is("a", packet::ns::SM_3));
                el.attr("h").unwrap().parse().unwrap()
            }
            _ => panic!("expected <a/> control element"),
        }
    }

    #[test]
    fn test_inbound_counter_wraps() {
        let mut counter = InboundCounter::starting_at(u32::MAX);
        assert_eq!(counter.record(), 0);
        assert_eq!(counter.record(), 1);
    }

    #[test]
    fn test_verifier_accepts_progress() {
        let mut v = AckVerifier::default();
        v.record_sent(5);
        assert_eq!(v.verify(3), Ok(()));
        assert_eq!(v.verify(3), Ok(()));
        assert_eq!(v.verify(5), Ok(()));
        assert_eq!(v.acked(), 5);
    }

    #[test]
    fn test_verifier_reports_regression_and_keeps_last_ack() {
        let mut v = AckVerifier::default();
        v.record_sent(10);
        v.verify(8).unwrap();
        assert_eq!(
            v.verify(6),
            Err(IntegrityViolation::Regression {
                reported: 6,
                acked: 8
            })
        );
        assert_eq!(v.acked(), 8);
    }

    #[test]
    fn test_verifier_reports_skip_ahead() {
        let mut v = AckVerifier::default();
        v.record_sent(4);
        assert_eq!(
            v.verify(7),
            Err(IntegrityViolation::AheadOfSent { reported: 7, sent: 4 })
        );
        assert_eq!(v.acked(), 0);
    }

    #[test]
    fn test_verifier_across_wraparound() {
        let mut v = AckVerifier::starting_at(u32::MAX - 1);
        v.record_sent(2);
        assert_eq!(v.verify(u32::MAX), Ok(()));
        assert_eq!(v.verify(1), Ok(()));
        assert!(matches!(
            v.verify(u32::MAX),
            Err(IntegrityViolation::Regression { .. })
        ));
    }

    #[tokio::test]
    async fn test_handled_counts_only_non_control_elements() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(16);
        let loops = spawn_loops(SmVersion::V3, 5, 0, out_tx, events);

        // 7 inbound stanzas interleaved with 3 ack requests
        let script = [
            AnswerInput::Request,
            AnswerInput::Handled,
            AnswerInput::Handled,
            AnswerInput::Request,
            AnswerInput::Handled,
            AnswerInput::Handled,
            AnswerInput::Handled,
            AnswerInput::Handled,
            AnswerInput::Handled,
            AnswerInput::Request,
        ];
        for input in script {
            loops.inputs.answer.send(input).unwrap();
        }

        assert_eq!(answered_h(out_rx.recv().await.unwrap()), 0);
        assert_eq!(answered_h(out_rx.recv().await.unwrap()), 2);
        assert_eq!(answered_h(out_rx.recv().await.unwrap()), 7);
        assert_eq!(*loops.counters.handled.borrow(), 7);
    }

    #[tokio::test]
    async fn test_request_every_window() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(16);
        let loops = spawn_loops(SmVersion::V3, 3, 0, out_tx, events);

        for seq in 1..=7 {
            loops.sinks.sent(seq);
        }
        drop(loops.sinks);
        drop(loops.inputs);

        let mut requests = 0;
        while let Ok(Some(out)) = tokio::time::timeout(Duration::from_millis(200), out_rx.recv()).await {
            match out {
                Outbound::Control(el) if el.is("r", packet::ns::SM_3) => requests += 1,
                _ => panic!("unexpected outbound element"),
            }
        }
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn test_verify_loop_publishes_violation() {
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (events, mut event_rx) = broadcast::channel(16);
        let loops = spawn_loops(SmVersion::V3, 5, 0, out_tx, events);

        loops.sinks.sent(1);
        loops.sinks.sent(2);
        loops.inputs.answer(2);
        loops.inputs.answer(1);

        match event_rx.recv().await.unwrap() {
            Event::StreamIntegrity(v) => {
                assert_eq!(v, IntegrityViolation::Regression { reported: 1, acked: 2 })
            }
            other => panic!("unexpected event {:?}", other),
        }
        let mut acked = loops.counters.acked.clone();
        acked.wait_for(|h| *h == 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_rebase_after_resume() {
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (events, mut event_rx) = broadcast::channel(16);
        let loops = spawn_loops(SmVersion::V3, 5, 10, out_tx, events);

        loops.sinks.rebase(40, 40);
        loops.sinks.sent(41);
        loops.inputs.answer(41);
        let mut acked = loops.counters.acked.clone();
        acked.wait_for(|h| *h == 41).await.unwrap();
        assert!(event_rx.try_recv().is_err());
        assert_eq!(*loops.counters.sent.borrow(), 41);
    }
}
