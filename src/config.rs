//! Configuration surface for the client: how to reach the signaling
//! server, how chatty the keep-alive is, and how track buffers are sized.

use std::time::Duration;

use crate::sync::BlockerConfigure;

/// How to connect and authenticate to the signaling server.
#[derive(Debug, Clone)]
pub struct SignalConfigure {
    /// The `ws://` or `wss://` URL of the signaling endpoint.
    pub url: String,
    /// Sent as the `Authorization` handshake header, if set.
    pub auth_token: Option<String>,
    /// Interval between active keep-alive pings while idle.
    pub keep_alive_interval: Duration,
    /// How long to wait for a keep-alive ack before treating the
    /// connection as dead.
    pub keep_alive_timeout: Duration,
    /// Grace period after connecting before keep-alive starts enforcing
    /// its timeout, giving the handshake room to finish.
    pub keep_alive_warmup: Duration,
    /// Timeout applied to every request/ack round trip (join, subscribe,
    /// custom message, ...).
    pub request_timeout: Duration,
}

impl Default for SignalConfigure {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: None,
            keep_alive_interval: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(5),
            keep_alive_warmup: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-track buffering configuration: each of the rtp/rtcp caches is an
/// `AdaptiveRingBuffer` sized by its own `(cap, min, max)` segment triple.
#[derive(Debug, Clone, Copy)]
pub struct TrackConfigure {
    /// Elements per RTP ring-buffer segment.
    pub rtp_cap_segments: usize,
    /// Segments the RTP cache never shrinks below.
    pub rtp_min_segments: usize,
    /// Segments the RTP cache never grows to reach (usable ceiling is one less).
    pub rtp_max_segments: usize,
    /// Elements per RTCP ring-buffer segment.
    pub rtcp_cap_segments: usize,
    /// Segments the RTCP cache never shrinks below.
    pub rtcp_min_segments: usize,
    /// Segments the RTCP cache never grows to reach (usable ceiling is one less).
    pub rtcp_max_segments: usize,
}

impl Default for TrackConfigure {
    fn default() -> Self {
        Self {
            rtp_cap_segments: 64,
            rtp_min_segments: 2,
            rtp_max_segments: 32,
            rtcp_cap_segments: 64,
            rtcp_min_segments: 1,
            rtcp_max_segments: 8,
        }
    }
}

/// Top-level configuration bundling the signaling, track buffering, and
/// blocker-manager settings for a client instance.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub signal: SignalConfigure,
    pub track: TrackConfigure,
    pub blocker: BlockerConfigure,
    /// ICE servers handed to the peer-connection collaborator.
    pub ice_servers: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            signal: SignalConfigure::default(),
            track: TrackConfigure::default(),
            blocker: BlockerConfigure::default(),
            ice_servers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Configuration::default();
        assert!(cfg.signal.keep_alive_timeout < cfg.signal.keep_alive_interval * 2);
        assert!(cfg.track.rtp_max_segments > cfg.track.rtp_min_segments);
        assert_eq!(cfg.blocker.min_batch, 1);
    }
}
