//! `Webrtc` — the negotiation and candidate-trickling layer sitting in
//! front of a [`peer::PeerConnectionHandle`]. Owns the peer's lazy,
//! double-checked initialization, buffers remote candidates that arrive
//! before the remote SDP is applied, and serializes offer/answer
//! negotiation with an [`AsyncMutex`].

pub mod peer;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::CloseSignal;
use crate::error::{Error, Result};
use crate::select::Selected;
use crate::sync::{AsyncMutex, StateNotifier};
use peer::{IceCandidate, PeerConnectionHandle, PeerConnectionState, SdpKind};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const PHASE_NEW: u8 = 0;
const PHASE_INITIALIZING: u8 = 1;
const PHASE_INITIALIZED: u8 = 2;
const PHASE_FAILED: u8 = 3;

/// A factory for the peer-connection collaborator, invoked exactly once
/// per `Webrtc` (the first successful call to `access_peer_box`).
pub type PeerFactory = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn PeerConnectionHandle>>> + Send + Sync>;

/// Negotiation and candidate-trickling state in front of one peer
/// connection.
pub struct Webrtc {
    closer: CloseSignal,
    factory: PeerFactory,
    peer: Mutex<Option<Arc<dyn PeerConnectionHandle>>>,
    phase: AtomicU8,
    wake_counter: AtomicU64,
    wake: StateNotifier<u64>,
    remoted: AtomicBool,
    pending_remote_candidates: Mutex<Vec<IceCandidate>>,
    negotiate_lock: AsyncMutex,
    on_local_candidate: Mutex<Option<Box<dyn Fn(IceCandidate) + Send + Sync>>>,
}

impl Webrtc {
    pub fn new(closer: &CloseSignal, factory: PeerFactory) -> Arc<Self> {
        Arc::new(Self {
            closer: closer.create_child(),
            factory,
            peer: Mutex::new(None),
            phase: AtomicU8::new(PHASE_NEW),
            wake_counter: AtomicU64::new(0),
            wake: StateNotifier::new(0),
            remoted: AtomicBool::new(false),
            pending_remote_candidates: Mutex::new(Vec::new()),
            negotiate_lock: AsyncMutex::new(),
            on_local_candidate: Mutex::new(None),
        })
    }

    pub fn closer(&self) -> &CloseSignal {
        &self.closer
    }

    /// Install the callback invoked with every locally-gathered ICE
    /// candidate, for forwarding to the signaling channel.
    pub fn on_local_candidate(&self, cb: Box<dyn Fn(IceCandidate) + Send + Sync>) {
        *self.on_local_candidate.lock() = Some(cb);
    }

    fn bump_wake(&self) {
        let v = self.wake_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.wake.set(v);
    }

    /// Double-checked lazy init: the first caller to observe `New` builds
    /// the peer connection; everyone else parks behind `Initializing`.
    pub async fn access_peer_box(self: &Arc<Self>, closer: &CloseSignal) -> Result<Arc<dyn PeerConnectionHandle>> {
        loop {
            match self.phase.load(Ordering::Acquire) {
                PHASE_INITIALIZED => {
                    return Ok(self
                        .peer
                        .lock()
                        .clone()
                        .expect("invariant violated: PHASE_INITIALIZED without a peer"));
                }
                PHASE_FAILED => return Err(Error::PeerConnection("peer box failed to initialize".into())),
                PHASE_NEW => {
                    if self
                        .phase
                        .compare_exchange(PHASE_NEW, PHASE_INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        match (self.factory)().await {
                            Ok(pc) => {
                                self.wire_callbacks(&pc);
                                *self.peer.lock() = Some(pc.clone());
                                self.phase.store(PHASE_INITIALIZED, Ordering::Release);
                                self.bump_wake();
                                return Ok(pc);
                            }
                            Err(e) => {
                                self.phase.store(PHASE_FAILED, Ordering::Release);
                                self.bump_wake();
                                return Err(e);
                            }
                        }
                    }
                    // Lost the race to initialize; loop and observe the winner's phase.
                }
                _ => {
                    let target = self.wake_counter.load(Ordering::SeqCst);
                    match self.wake.wait_for(|v| *v != target, closer).await {
                        Selected::Completed(_) => continue,
                        Selected::Cancelled => return Err(closer.to_error()),
                    }
                }
            }
        }
    }

    fn wire_callbacks(self: &Arc<Self>, pc: &Arc<dyn PeerConnectionHandle>) {
        let this = self.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(cb) = &*this.on_local_candidate.lock() {
                cb(candidate);
            }
        }));
        let this = self.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            if matches!(state, PeerConnectionState::Failed | PeerConnectionState::Closed) {
                tracing::warn!(?state, "peer connection torn down, resetting peer box to New");
                *this.peer.lock() = None;
                this.remoted.store(false, Ordering::Release);
                this.phase.store(PHASE_NEW, Ordering::Release);
                this.bump_wake();
            }
        }));
    }

    /// Feed in a remote ICE candidate. Buffered until the remote SDP has
    /// been applied (the `remoted` gate), then flushed in arrival order.
    pub fn handle_remote_candidate(self: &Arc<Self>, closer: CloseSignal, candidate: IceCandidate) {
        if self.remoted.load(Ordering::Acquire) {
            let this = self.clone();
            tokio::spawn(async move {
                if let Ok(pc) = this.access_peer_box(&closer).await {
                    let _ = pc.add_ice_candidate(candidate).await;
                }
            });
        } else {
            self.pending_remote_candidates.lock().push(candidate);
        }
    }

    async fn mark_remoted_and_flush(self: &Arc<Self>, closer: &CloseSignal) -> Result<()> {
        self.remoted.store(true, Ordering::Release);
        let pending = std::mem::take(&mut *self.pending_remote_candidates.lock());
        let pc = self.access_peer_box(closer).await?;
        for candidate in pending {
            pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Active (offer-sending) negotiation role: create an offer, set it
    /// locally, hand it to `exchange` to carry to the peer and bring back
    /// their answer, then apply it and flush buffered candidates.
    /// Serialized against any concurrent negotiation on this peer.
    pub async fn negotiate_active<F>(self: &Arc<Self>, closer: &CloseSignal, exchange: F) -> Result<()>
    where
        F: FnOnce(String) -> BoxFuture<'static, Result<String>>,
    {
        if !self.negotiate_lock.acquire(closer).await {
            return Err(closer.to_error());
        }
        let result = async {
            let pc = self.access_peer_box(closer).await?;
            let offer = pc.create_offer().await?;
            pc.set_local_description(SdpKind::Offer, offer.clone()).await?;
            tracing::info!("negotiate: offer sent, awaiting answer");
            let answer = exchange(offer).await?;
            pc.set_remote_description(SdpKind::Answer, answer).await?;
            self.mark_remoted_and_flush(closer).await?;
            tracing::info!("negotiate: answer applied");
            Ok(())
        }
        .await;
        self.negotiate_lock.release();
        result
    }

    /// Passive (answer-sending) negotiation role: apply the inbound offer,
    /// flush buffered candidates, create an answer, set it locally, and
    /// hand it to `respond` to carry back to the peer.
    pub async fn negotiate_passive<F>(self: &Arc<Self>, closer: &CloseSignal, remote_offer_sdp: String, respond: F) -> Result<()>
    where
        F: FnOnce(String) -> BoxFuture<'static, Result<()>>,
    {
        if !self.negotiate_lock.acquire(closer).await {
            return Err(closer.to_error());
        }
        let result = async {
            let pc = self.access_peer_box(closer).await?;
            pc.set_remote_description(SdpKind::Offer, remote_offer_sdp).await?;
            self.mark_remoted_and_flush(closer).await?;
            let answer = pc.create_answer().await?;
            pc.set_local_description(SdpKind::Answer, answer.clone()).await?;
            tracing::info!("negotiate: answer created for inbound offer");
            respond(answer).await?;
            Ok(())
        }
        .await;
        self.negotiate_lock.release();
        result
    }

    pub async fn close(self: &Arc<Self>) {
        if let Some(pc) = self.peer.lock().clone() {
            let _ = pc.close().await;
        }
        self.closer.close("webrtc layer closed");
    }
}
