//! Deterministic in-memory connection objects.
//!
//! A mock connection reports `connected` as soon as it holds both a local and
//! a remote description, emits a couple of host candidates whenever a local
//! description is installed, and refuses ICE candidates until the remote
//! description exists. That is enough to drive the negotiation state machine
//! end to end without a network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::rtc::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceCandidate, PeerConnection, RtcError,
    SdpKind, SessionDescription,
};

const CANDIDATES_PER_DESCRIPTION: usize = 2;

#[derive(Debug, Default)]
struct FactoryState {
    created: usize,
    closed: usize,
    fail_ice: bool,
    applied: HashMap<String, Vec<IceCandidate>>,
}

#[derive(Debug, Clone, Default)]
pub struct MockConnectionFactory {
    label: String,
    state: Arc<Mutex<FactoryState>>,
}

impl MockConnectionFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Arc::default(),
        }
    }

    /// Connections created from now on report `failed` instead of `connected`.
    pub fn set_fail_ice(&self, fail: bool) {
        self.state.lock().fail_ice = fail;
    }

    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn live(&self) -> usize {
        let guard = self.state.lock();
        guard.created - guard.closed
    }

    /// Remote candidates applied to connections with `remote_peer_id`, in order.
    pub fn applied_candidates(&self, remote_peer_id: &str) -> Vec<IceCandidate> {
        self.state
            .lock()
            .applied
            .get(remote_peer_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        remote_peer_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Box<dyn PeerConnection>, RtcError> {
        let fail_ice = {
            let mut guard = self.state.lock();
            guard.created += 1;
            guard.fail_ice
        };
        Ok(Box::new(MockConnection {
            label: self.label.clone(),
            remote_peer_id: remote_peer_id.to_string(),
            generation,
            fail_ice,
            events,
            factory: Arc::clone(&self.state),
            inner: Mutex::new(ConnectionInner::default()),
        }))
    }
}

#[derive(Debug, Default)]
struct ConnectionInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    emitted_candidates: usize,
    settled: bool,
    closed: bool,
}

struct MockConnection {
    label: String,
    remote_peer_id: String,
    generation: u64,
    fail_ice: bool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    factory: Arc<Mutex<FactoryState>>,
    inner: Mutex<ConnectionInner>,
}

impl MockConnection {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, state: ConnectionState) {
        self.emit(ConnectionEvent::StateChanged {
            generation: self.generation,
            state,
        });
    }

    fn install_local(&self, description: SessionDescription) {
        let first = {
            let mut inner = self.inner.lock();
            inner.local = Some(description);
            let first = inner.emitted_candidates;
            inner.emitted_candidates += CANDIDATES_PER_DESCRIPTION;
            first
        };
        for idx in first..first + CANDIDATES_PER_DESCRIPTION {
            self.emit(ConnectionEvent::LocalCandidate {
                generation: self.generation,
                candidate: IceCandidate {
                    candidate: format!(
                        "candidate:{}-{}-{idx} 1 udp 2122260223 127.0.0.1 {} typ host",
                        self.label,
                        self.generation,
                        40_000 + idx
                    ),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            });
        }
        self.settle_if_ready();
    }

    fn settle_if_ready(&self) {
        let ready = {
            let mut inner = self.inner.lock();
            let ready = !inner.settled && !inner.closed && inner.local.is_some() && inner.remote.is_some();
            if ready {
                inner.settled = true;
            }
            ready
        };
        if ready {
            self.emit_state(ConnectionState::Connecting);
            if self.fail_ice {
                self.emit_state(ConnectionState::Failed);
            } else {
                self.emit_state(ConnectionState::Connected);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), RtcError> {
        if self.inner.lock().closed {
            return Err(RtcError::Closed);
        }
        Ok(())
    }

    fn mark_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        drop(inner);
        self.factory.lock().closed += 1;
        true
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        let offer = SessionDescription::offer(format!(
            "v=0 mock offer {}->{} gen={}",
            self.label, self.remote_peer_id, self.generation
        ));
        self.install_local(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.inner.lock().remote.as_ref().map(|desc| desc.kind),
            Some(SdpKind::Offer)
        );
        if !has_offer {
            return Err(RtcError::InvalidDescription(
                "cannot answer without a remote offer".into(),
            ));
        }
        let answer = SessionDescription::answer(format!(
            "v=0 mock answer {}->{} gen={}",
            self.label, self.remote_peer_id, self.generation
        ));
        self.install_local(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.ensure_open()?;
        self.inner.lock().remote = Some(description);
        self.settle_if_ready();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.ensure_open()?;
        if self.inner.lock().remote.is_none() {
            return Err(RtcError::Backend(
                "remote description not set before candidate".into(),
            ));
        }
        self.factory
            .lock()
            .applied
            .entry(self.remote_peer_id.clone())
            .or_default()
            .push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), RtcError> {
        if self.mark_closed() {
            self.emit_state(ConnectionState::Closed);
        }
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn offer_answer_pair_reports_connected() {
        let factory = MockConnectionFactory::new("a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = factory.create("b", 1, tx).await.expect("create");

        let offer = conn.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        conn.set_remote_description(SessionDescription::answer("remote"))
            .await
            .expect("remote");

        let events = drain(&mut rx);
        let candidates = events
            .iter()
            .filter(|event| matches!(event, ConnectionEvent::LocalCandidate { .. }))
            .count();
        assert_eq!(candidates, CANDIDATES_PER_DESCRIPTION);
        assert!(matches!(
            events.last(),
            Some(ConnectionEvent::StateChanged {
                generation: 1,
                state: ConnectionState::Connected
            })
        ));
    }

    #[tokio::test]
    async fn candidates_require_remote_description() {
        let factory = MockConnectionFactory::new("a");
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = factory.create("b", 1, tx).await.expect("create");
        let candidate = IceCandidate {
            candidate: "candidate:x".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        assert!(conn.add_ice_candidate(candidate.clone()).await.is_err());
        conn.set_remote_description(SessionDescription::offer("remote"))
            .await
            .expect("remote");
        conn.add_ice_candidate(candidate.clone()).await.expect("add");
        assert_eq!(factory.applied_candidates("b"), vec![candidate]);
    }

    #[tokio::test]
    async fn live_count_tracks_close_and_drop() {
        let factory = MockConnectionFactory::new("a");
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = factory.create("b", 1, tx.clone()).await.expect("create");
        let second = factory.create("c", 1, tx).await.expect("create");
        assert_eq!(factory.live(), 2);
        first.close().await.expect("close");
        first.close().await.expect("close twice");
        assert_eq!(factory.live(), 1);
        drop(second);
        assert_eq!(factory.live(), 0);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn failing_ice_reports_failed() {
        let factory = MockConnectionFactory::new("a");
        factory.set_fail_ice(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = factory.create("b", 3, tx).await.expect("create");
        conn.set_remote_description(SessionDescription::offer("remote"))
            .await
            .expect("remote");
        conn.create_answer().await.expect("answer");
        assert!(drain(&mut rx).iter().any(|event| matches!(
            event,
            ConnectionEvent::StateChanged {
                state: ConnectionState::Failed,
                ..
            }
        )));
    }
}
