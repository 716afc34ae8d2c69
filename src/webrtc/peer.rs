//! The peer-connection collaborator boundary. `Webrtc` only ever talks to
//! [`PeerConnectionHandle`] — never to the concrete `webrtc` crate types —
//! so the production adapter and the in-memory test fake are
//! interchangeable.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};

/// The type of an SDP blob exchanged during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Mirrors the standard `RTCPeerConnectionState` values without binding
/// callers to the concrete crate's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A remote track announced by `on_track`.
#[derive(Debug, Clone)]
pub struct RemoteTrackHandle {
    pub id: String,
    pub kind: String,
    pub mid: Option<String>,
}

/// The black-box collaborator: everything `Webrtc` needs from a peer
/// connection, without naming the concrete `webrtc` crate type.
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn create_answer(&self) -> Result<String>;
    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<()>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    fn connection_state(&self) -> PeerConnectionState;
    fn on_track(&self, cb: Box<dyn Fn(RemoteTrackHandle) + Send + Sync>);
    fn on_ice_candidate(&self, cb: Box<dyn Fn(IceCandidate) + Send + Sync>);
    fn on_peer_connection_state_change(&self, cb: Box<dyn Fn(PeerConnectionState) + Send + Sync>);
    async fn close(&self) -> Result<()>;
}

fn map_state(s: RTCPeerConnectionState) -> PeerConnectionState {
    match s {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => PeerConnectionState::New,
    }
}

fn sdp_type_str(kind: SdpKind) -> &'static str {
    match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
        SdpKind::Pranswer => "pranswer",
        SdpKind::Rollback => "rollback",
    }
}

/// Production adapter wrapping `webrtc::peer_connection::RTCPeerConnection`.
pub struct WebrtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

impl WebrtcPeerConnection {
    pub async fn new(ice_servers: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnection(e.to_string()))?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))?;
        Ok(Self { pc: Arc::new(pc) })
    }
}

#[async_trait]
impl PeerConnectionHandle for WebrtcPeerConnection {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        let desc = build_session_description(kind, sdp)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        let desc = build_session_description(kind, sdp)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::PeerConnection(e.to_string()))
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_state(self.pc.connection_state())
    }

    fn on_track(&self, cb: Box<dyn Fn(RemoteTrackHandle) + Send + Sync>) {
        let cb = Arc::new(cb);
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let cb = cb.clone();
            let handle = RemoteTrackHandle {
                id: track.id(),
                kind: track.kind().to_string(),
                mid: Some(track.rid().to_string()).filter(|s| !s.is_empty()),
            };
            Box::pin(async move { (cb)(handle) })
        }));
    }

    fn on_ice_candidate(&self, cb: Box<dyn Fn(IceCandidate) + Send + Sync>) {
        let cb = Arc::new(cb);
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let cb = cb.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if let Ok(init) = candidate.to_json() {
                        (cb)(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        });
                    }
                }
            })
        }));
    }

    fn on_peer_connection_state_change(&self, cb: Box<dyn Fn(PeerConnectionState) + Send + Sync>) {
        let cb = Arc::new(cb);
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let cb = cb.clone();
                Box::pin(async move { (cb)(map_state(s)) })
            }));
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(|e| Error::PeerConnection(e.to_string()))
    }
}

fn build_session_description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription> {
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpKind::Rollback => RTCSessionDescription::answer(sdp), // tungstenite-style: no dedicated rollback ctor upstream
    }
    .map_err(|e| Error::PeerConnection(e.to_string()))
}

/// In-memory fake used by tests: no real networking, callbacks fired by
/// explicit test-driven calls to `simulate_*`.
#[derive(Default)]
pub struct FakePeerConnection {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    connection_state: Option<PeerConnectionState>,
    local_sdp: Option<(SdpKind, String)>,
    remote_sdp: Option<(SdpKind, String)>,
    ice_candidates: Vec<IceCandidate>,
    track_cb: Option<Box<dyn Fn(RemoteTrackHandle) + Send + Sync>>,
    candidate_cb: Option<Box<dyn Fn(IceCandidate) + Send + Sync>>,
    state_cb: Option<Box<dyn Fn(PeerConnectionState) + Send + Sync>>,
}

impl FakePeerConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simulate_remote_track(&self, handle: RemoteTrackHandle) {
        if let Some(cb) = &self.state.lock().track_cb {
            cb(handle);
        }
    }

    pub fn simulate_remote_candidate(&self, candidate: IceCandidate) {
        if let Some(cb) = &self.state.lock().candidate_cb {
            cb(candidate);
        }
    }

    pub fn simulate_state_change(&self, new_state: PeerConnectionState) {
        self.state.lock().connection_state = Some(new_state);
        if let Some(cb) = &self.state.lock().state_cb {
            cb(new_state);
        }
    }

    pub fn local_description(&self) -> Option<(SdpKind, String)> {
        self.state.lock().local_sdp.clone()
    }
}

#[async_trait]
impl PeerConnectionHandle for FakePeerConnection {
    async fn create_offer(&self) -> Result<String> {
        Ok("v=0\r\no=- fake offer\r\n".to_string())
    }

    async fn create_answer(&self) -> Result<String> {
        Ok("v=0\r\no=- fake answer\r\n".to_string())
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        self.state.lock().local_sdp = Some((kind, sdp));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        self.state.lock().remote_sdp = Some((kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.state.lock().ice_candidates.push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection_state.unwrap_or(PeerConnectionState::New)
    }

    fn on_track(&self, cb: Box<dyn Fn(RemoteTrackHandle) + Send + Sync>) {
        self.state.lock().track_cb = Some(cb);
    }

    fn on_ice_candidate(&self, cb: Box<dyn Fn(IceCandidate) + Send + Sync>) {
        self.state.lock().candidate_cb = Some(cb);
    }

    fn on_peer_connection_state_change(&self, cb: Box<dyn Fn(PeerConnectionState) + Send + Sync>) {
        self.state.lock().state_cb = Some(cb);
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().connection_state = Some(PeerConnectionState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_peer_connection_round_trips_descriptions() {
        let pc = FakePeerConnection::new();
        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(SdpKind::Offer, offer).await.unwrap();
        assert!(matches!(pc.local_description(), Some((SdpKind::Offer, _))));
    }

    #[tokio::test]
    async fn fake_peer_connection_delivers_track_callback() {
        let pc = FakePeerConnection::new();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        pc.on_track(Box::new(move |t| *seen2.lock() = Some(t.id)));
        pc.simulate_remote_track(RemoteTrackHandle {
            id: "t1".into(),
            kind: "video".into(),
            mid: Some("0".into()),
        });
        assert_eq!(*seen.lock(), Some("t1".to_string()));
    }
}
