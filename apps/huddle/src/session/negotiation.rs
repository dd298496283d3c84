//! Per-peer offer/answer/ICE negotiation.
//!
//! `Negotiation` is the state machine; `spawn_negotiation` runs one in its own
//! task so that awaiting a slow connection object for one peer never stalls
//! the dispatch loop or any other peer. The task reports back through
//! `NegotiationUpdate`s tagged with the link id the registry assigned, which
//! lets the dispatch loop ignore a task it has already replaced.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};

use crate::protocol::Payload;
use crate::transport::rtc::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceCandidate, PeerConnection, RtcError,
    SessionDescription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationPhase {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Failed,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Rtc(#[from] RtcError),
    #[error("connection failed during ice")]
    ConnectionFailed,
    #[error("negotiation did not complete within {0:?}")]
    Timeout(Duration),
}

/// Lexicographically larger id initiates.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

#[derive(Debug, Clone)]
pub enum NegotiationInput {
    Initiate,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug, Clone)]
pub enum NegotiationUpdate {
    Outbound {
        peer_id: String,
        link: u64,
        payload: Payload,
    },
    Phase {
        peer_id: String,
        link: u64,
        phase: NegotiationPhase,
    },
    Failed {
        peer_id: String,
        link: u64,
        reason: String,
    },
}

pub struct Negotiation {
    local_id: String,
    remote_id: String,
    phase: NegotiationPhase,
    factory: Arc<dyn ConnectionFactory>,
    connection: Option<Box<dyn PeerConnection>>,
    generation: u64,
    remote_description_set: bool,
    pending_ice: Vec<IceCandidate>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Negotiation {
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local_id: local_id.into(),
                remote_id: remote_id.into(),
                phase: NegotiationPhase::Idle,
                factory,
                connection: None,
                generation: 0,
                remote_description_set: false,
                pending_ice: Vec::new(),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_initiator(&self) -> bool {
        should_initiate(&self.local_id, &self.remote_id)
    }

    pub async fn handle_input(
        &mut self,
        input: NegotiationInput,
    ) -> Result<Option<Payload>, NegotiationError> {
        match input {
            NegotiationInput::Initiate => self.initiate().await,
            NegotiationInput::Offer(offer) => self.handle_offer(offer).await,
            NegotiationInput::Answer(answer) => self.handle_answer(answer).await.map(|()| None),
            NegotiationInput::Candidate(candidate) => {
                self.handle_candidate(candidate).await;
                Ok(None)
            }
        }
    }

    /// Sends an offer if this side wins the tie-break and nothing is in flight.
    pub async fn initiate(&mut self) -> Result<Option<Payload>, NegotiationError> {
        if !self.is_initiator() {
            trace!(target = "negotiation", peer_id = %self.remote_id, "waiting for remote offer");
            return Ok(None);
        }
        if self.phase != NegotiationPhase::Idle {
            trace!(
                target = "negotiation",
                peer_id = %self.remote_id,
                phase = ?self.phase,
                "negotiation already in progress"
            );
            return Ok(None);
        }
        self.replace_connection().await?;
        let offer = self.connection()?.create_offer().await?;
        self.phase = NegotiationPhase::OfferSent;
        debug!(target = "negotiation", peer_id = %self.remote_id, generation = self.generation, "offer sent");
        Ok(Some(Payload::Offer(offer)))
    }

    pub async fn handle_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<Option<Payload>, NegotiationError> {
        match self.phase {
            NegotiationPhase::OfferSent if self.is_initiator() => {
                debug!(
                    target = "negotiation",
                    peer_id = %self.remote_id,
                    "glare: keeping local offer, ignoring remote offer"
                );
                return Ok(None);
            }
            NegotiationPhase::OfferSent => {
                debug!(
                    target = "negotiation",
                    peer_id = %self.remote_id,
                    "glare: discarding local offer to answer remote"
                );
            }
            NegotiationPhase::OfferReceived
            | NegotiationPhase::AnswerSent
            | NegotiationPhase::Connected => {
                debug!(
                    target = "negotiation",
                    peer_id = %self.remote_id,
                    phase = ?self.phase,
                    "fresh offer from remote; rebuilding connection"
                );
            }
            NegotiationPhase::Idle | NegotiationPhase::Failed => {}
        }

        self.replace_connection().await?;
        self.phase = NegotiationPhase::OfferReceived;
        self.connection()?.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;
        let answer = self.connection()?.create_answer().await?;
        self.phase = NegotiationPhase::AnswerSent;
        debug!(target = "negotiation", peer_id = %self.remote_id, generation = self.generation, "answer sent");
        Ok(Some(Payload::Answer(answer)))
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.phase != NegotiationPhase::OfferSent || self.remote_description_set {
            debug!(
                target = "negotiation",
                peer_id = %self.remote_id,
                phase = ?self.phase,
                "ignoring unexpected answer"
            );
            return Ok(());
        }
        self.connection()?.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;
        debug!(target = "negotiation", peer_id = %self.remote_id, "answer applied");
        Ok(())
    }

    /// Applies `candidate`, or queues it until a remote description exists.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) {
        let ready = self.remote_description_set && self.connection.is_some();
        if !ready {
            self.pending_ice.push(candidate);
            trace!(
                target = "negotiation",
                peer_id = %self.remote_id,
                queued = self.pending_ice.len(),
                "queued remote candidate"
            );
            return;
        }
        self.apply_candidate(candidate).await;
    }

    pub async fn handle_connection_event(
        &mut self,
        event: ConnectionEvent,
    ) -> Result<Option<Payload>, NegotiationError> {
        match event {
            ConnectionEvent::LocalCandidate {
                generation,
                candidate,
            } => {
                if generation != self.generation {
                    trace!(target = "negotiation", peer_id = %self.remote_id, generation, "dropping candidate from discarded connection");
                    return Ok(None);
                }
                Ok(Some(Payload::IceCandidate(candidate)))
            }
            ConnectionEvent::StateChanged { generation, state } => {
                if generation != self.generation {
                    return Ok(None);
                }
                trace!(target = "negotiation", peer_id = %self.remote_id, state = ?state, "connection state");
                match state {
                    ConnectionState::Connected => {
                        self.phase = NegotiationPhase::Connected;
                        Ok(None)
                    }
                    ConnectionState::Failed => {
                        self.phase = NegotiationPhase::Failed;
                        Err(NegotiationError::ConnectionFailed)
                    }
                    ConnectionState::Disconnected => {
                        debug!(target = "negotiation", peer_id = %self.remote_id, "connection interrupted");
                        Ok(None)
                    }
                    ConnectionState::New | ConnectionState::Connecting | ConnectionState::Closed => {
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Closes the local connection object. Queued remote candidates stay: they
    /// describe the remote end and apply to whichever connection answers it.
    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.close().await {
                debug!(target = "negotiation", peer_id = %self.remote_id, error = %err, "close failed");
            }
        }
        self.remote_description_set = false;
    }

    fn connection(&self) -> Result<&dyn PeerConnection, NegotiationError> {
        self.connection
            .as_deref()
            .ok_or(NegotiationError::Rtc(RtcError::Closed))
    }

    async fn replace_connection(&mut self) -> Result<(), NegotiationError> {
        self.close().await;
        self.generation += 1;
        let connection = self
            .factory
            .create(&self.remote_id, self.generation, self.events_tx.clone())
            .await?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_ice.is_empty() {
            return;
        }
        let queued = std::mem::take(&mut self.pending_ice);
        debug!(
            target = "negotiation",
            peer_id = %self.remote_id,
            count = queued.len(),
            "applying queued candidates"
        );
        for candidate in queued {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        let Some(connection) = self.connection.as_deref() else {
            return;
        };
        if let Err(err) = connection.add_ice_candidate(candidate).await {
            warn!(target = "negotiation", peer_id = %self.remote_id, error = %err, "failed to add remote candidate");
        }
    }
}

/// Runs `negotiation` until its input channel closes or it fails.
///
/// The negotiation timeout covers every stretch spent outside `connected`,
/// starting when the task starts and again whenever a connected link is
/// renegotiated.
pub fn spawn_negotiation(
    mut negotiation: Negotiation,
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut inputs: mpsc::UnboundedReceiver<NegotiationInput>,
    updates: mpsc::UnboundedSender<NegotiationUpdate>,
    link: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let peer_id = negotiation.remote_id.clone();
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let before = negotiation.phase();
            let outcome = tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => negotiation.handle_input(input).await,
                    None => break,
                },
                Some(event) = connection_events.recv() => {
                    negotiation.handle_connection_event(event).await
                }
                _ = &mut deadline, if negotiation.phase() != NegotiationPhase::Connected => {
                    Err(NegotiationError::Timeout(timeout))
                }
            };

            match outcome {
                Ok(Some(payload)) => {
                    let _ = updates.send(NegotiationUpdate::Outbound {
                        peer_id: peer_id.clone(),
                        link,
                        payload,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(target = "negotiation", peer_id = %peer_id, error = %err, "negotiation failed");
                    negotiation.phase = NegotiationPhase::Failed;
                    let _ = updates.send(NegotiationUpdate::Failed {
                        peer_id: peer_id.clone(),
                        link,
                        reason: err.to_string(),
                    });
                    break;
                }
            }

            let after = negotiation.phase();
            if after != before {
                if before == NegotiationPhase::Connected {
                    deadline.as_mut().reset(Instant::now() + timeout);
                }
                let _ = updates.send(NegotiationUpdate::Phase {
                    peer_id: peer_id.clone(),
                    link,
                    phase: after,
                });
            }
        }

        negotiation.close().await;
        trace!(target = "negotiation", peer_id = %peer_id, link, "negotiation task finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnectionFactory;

    fn pair(
        local: &str,
        remote: &str,
        factory: &MockConnectionFactory,
    ) -> (Negotiation, mpsc::UnboundedReceiver<ConnectionEvent>) {
        Negotiation::new(local, remote, Arc::new(factory.clone()))
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    async fn settle(
        negotiation: &mut Negotiation,
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Ok(Some(payload)) = negotiation.handle_connection_event(event).await {
                out.push(payload);
            }
        }
        out
    }

    #[test]
    fn larger_id_initiates() {
        assert!(should_initiate("b", "a"));
        assert!(!should_initiate("a", "b"));
        assert!(!should_initiate("a", "a"));
    }

    #[tokio::test]
    async fn loser_of_tie_break_does_not_offer() {
        let factory = MockConnectionFactory::new("a");
        let (mut a, _events) = pair("a", "b", &factory);
        assert!(a.initiate().await.expect("initiate").is_none());
        assert_eq!(a.phase(), NegotiationPhase::Idle);
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn glare_resolves_to_single_connection_pair() {
        let factory_a = MockConnectionFactory::new("a");
        let factory_b = MockConnectionFactory::new("b");
        let (mut a, mut a_events) = pair("a", "b", &factory_a);
        let (mut b, mut b_events) = pair("b", "a", &factory_b);

        // Force "a" to offer anyway, as a peer that raced the tie-break would.
        a.replace_connection().await.expect("conn");
        let a_offer = a.connection().expect("conn").create_offer().await.expect("offer");
        a.phase = NegotiationPhase::OfferSent;

        let Some(Payload::Offer(b_offer)) = b.initiate().await.expect("initiate") else {
            panic!("b should offer");
        };

        // Both offers cross on the wire.
        assert!(b.handle_offer(a_offer).await.expect("b ignores").is_none());
        assert_eq!(b.phase(), NegotiationPhase::OfferSent);

        let Some(Payload::Answer(answer)) = a.handle_offer(b_offer).await.expect("a answers") else {
            panic!("a should answer");
        };
        assert_eq!(a.phase(), NegotiationPhase::AnswerSent);
        b.handle_answer(answer).await.expect("answer applied");

        settle(&mut a, &mut a_events).await;
        settle(&mut b, &mut b_events).await;
        assert_eq!(a.phase(), NegotiationPhase::Connected);
        assert_eq!(b.phase(), NegotiationPhase::Connected);
        assert_eq!(factory_a.live(), 1);
        assert_eq!(factory_b.live(), 1);
        assert_eq!(factory_a.created(), 2);
    }

    #[tokio::test]
    async fn early_candidates_apply_in_order_after_remote_description() {
        let factory = MockConnectionFactory::new("a");
        let (mut a, _events) = pair("a", "b", &factory);
        for n in 1..=3 {
            a.handle_candidate(candidate(n)).await;
        }
        assert_eq!(a.pending_candidates(), 3);
        assert!(factory.applied_candidates("b").is_empty());

        a.handle_offer(SessionDescription::offer("remote"))
            .await
            .expect("answer");
        assert_eq!(a.pending_candidates(), 0);
        a.handle_candidate(candidate(4)).await;
        assert_eq!(
            factory.applied_candidates("b"),
            (1..=4).map(candidate).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn candidates_queued_during_glare_reach_the_answering_connection() {
        let factory = MockConnectionFactory::new("a");
        let (mut a, _events) = pair("a", "b", &factory);
        a.replace_connection().await.expect("conn");
        a.connection().expect("conn").create_offer().await.expect("offer");
        a.phase = NegotiationPhase::OfferSent;

        // Remote candidates belong to b's offer, which is still on its way.
        a.handle_candidate(candidate(1)).await;
        a.handle_candidate(candidate(2)).await;
        assert_eq!(a.pending_candidates(), 2);

        a.handle_offer(SessionDescription::offer("from b"))
            .await
            .expect("answer");
        assert_eq!(a.pending_candidates(), 0);
        assert_eq!(factory.applied_candidates("b"), vec![candidate(1), candidate(2)]);
        assert_eq!(factory.created(), 2);
        assert_eq!(factory.live(), 1);
    }

    #[tokio::test]
    async fn stale_generation_events_are_ignored() {
        let factory = MockConnectionFactory::new("b");
        let (mut b, mut events) = pair("b", "a", &factory);
        b.initiate().await.expect("offer");
        let first_gen = b.generation();
        // Remote restarted: a fresh offer rebuilds the connection.
        b.phase = NegotiationPhase::Connected;
        b.handle_offer(SessionDescription::offer("restart"))
            .await
            .expect("answer");
        assert!(b.generation() > first_gen);

        let stale = ConnectionEvent::StateChanged {
            generation: first_gen,
            state: ConnectionState::Failed,
        };
        assert!(b.handle_connection_event(stale).await.expect("ignored").is_none());
        let outbound = settle(&mut b, &mut events).await;
        assert!(outbound
            .iter()
            .all(|payload| matches!(payload, Payload::IceCandidate(_))));
        assert_eq!(b.phase(), NegotiationPhase::Connected);
        assert_eq!(factory.live(), 1);
    }

    #[tokio::test]
    async fn ice_failure_is_reported() {
        let factory = MockConnectionFactory::new("a");
        factory.set_fail_ice(true);
        let (mut a, mut events) = pair("a", "b", &factory);
        a.handle_offer(SessionDescription::offer("remote"))
            .await
            .expect("answer");
        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(
                a.handle_connection_event(event).await,
                Err(NegotiationError::ConnectionFailed)
            ) {
                failed = true;
            }
        }
        assert!(failed);
        assert_eq!(a.phase(), NegotiationPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn task_times_out_without_answer() {
        let factory = MockConnectionFactory::new("b");
        let (negotiation, events) = pair("b", "a", &factory);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let handle = spawn_negotiation(
            negotiation,
            events,
            input_rx,
            update_tx,
            7,
            Duration::from_secs(30),
        );
        input_tx.send(NegotiationInput::Initiate).expect("send");

        let mut saw_offer = false;
        loop {
            match update_rx.recv().await.expect("update") {
                NegotiationUpdate::Outbound {
                    payload: Payload::Offer(_),
                    ..
                } => saw_offer = true,
                NegotiationUpdate::Failed { link, reason, .. } => {
                    assert_eq!(link, 7);
                    assert!(reason.contains("did not complete"));
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_offer);
        handle.await.expect("task");
        assert_eq!(factory.live(), 0);
    }
}
