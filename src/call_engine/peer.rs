//! WebRTC Media Transport
//!
//! Vanilla ICE: die Candidates werden nicht einzeln signalisiert, sondern
//! nach dem (begrenzten) Gathering im SDP mitgeschickt. Dadurch reichen
//! zwei Schreibvorgänge im Store (`offer`, `answer`) pro Anruf.
//!
//! Hinweis: Es wird kein Audio encodiert, der lokale Track wird nur für die
//! Aushandlung angehängt.

use super::audio::MicrophoneCapture;
use super::transport::{
    AudioConstraints, AudioSourceInfo, LocalAudio, MediaConnectionState, MediaSession,
    MediaTransport, RemoteTrackHandler, RemoteTrackInfo, StateChangeHandler, TransportError,
};
use crate::config::IceServerConfig;
use crate::signaling::{SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Media Transport auf Basis von webrtc-rs und cpal
#[derive(Debug, Default)]
pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn capture_local_audio(
        &self,
        constraints: AudioConstraints,
    ) -> Result<Box<dyn LocalAudio>, TransportError> {
        let capture = MicrophoneCapture::start(constraints)?;
        Ok(Box::new(capture))
    }

    async fn open_session(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Box<dyn MediaSession>, TransportError> {
        let session = WebRtcSession::open(ice_servers).await?;
        Ok(Box::new(session))
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Eine RTCPeerConnection für genau einen Anruf
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    gather_complete: Mutex<Option<mpsc::Receiver<()>>>,
    local_track: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
}

impl WebRtcSession {
    /// Erstellt eine neue Peer Connection
    pub async fn open(ice_servers: &[IceServerConfig]) -> Result<Self, TransportError> {
        // Media Engine mit Opus konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        if !ice_servers.iter().any(IceServerConfig::is_relay) {
            tracing::warn!(
                "No TURN relay configured: peers behind symmetric NAT on both ends will not connect"
            );
        }

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        Ok(Self {
            pc,
            gather_complete: Mutex::new(None),
            local_track: Mutex::new(None),
        })
    }

    /// Setzt die Local Description und merkt sich das Gathering-Signal
    async fn apply_local(&self, desc: RTCSessionDescription) -> Result<(), TransportError> {
        // Promise vor set_local_description holen, sonst kann das Signal verloren gehen
        let gather = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(webrtc_err)?;
        *self.gather_complete.lock() = Some(gather);
        Ok(())
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn attach_track(&self, source: AudioSourceInfo) -> Result<(), TransportError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: source.sample_rate,
                channels: source.channels,
                ..Default::default()
            },
            "audio".to_string(),
            "fleet-call".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        *self.local_track.lock() = Some(track);
        Ok(())
    }

    async fn negotiate_offer(&self) -> Result<(), TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.apply_local(offer).await
    }

    async fn negotiate_answer(
        &self,
        remote_offer: &SessionDescription,
    ) -> Result<(), TransportError> {
        if remote_offer.kind != SdpKind::Offer {
            return Err(TransportError::InvalidSdp(
                "expected an offer from the caller".to_string(),
            ));
        }

        let offer = RTCSessionDescription::offer(remote_offer.sdp.clone())
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(webrtc_err)?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.apply_local(answer).await
    }

    async fn set_remote_answer(&self, answer: &SessionDescription) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(webrtc_err)
    }

    async fn gather_candidates_blocking(&self, timeout: Duration) -> bool {
        let pending = self.gather_complete.lock().take();
        let Some(mut gather) = pending else {
            return self.pc.ice_gathering_state() == RTCIceGatheringState::Complete;
        };

        match tokio::time::timeout(timeout, gather.recv()).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    "ICE gathering not complete after {:?}, sending partial candidates",
                    timeout
                );
                false
            }
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        let kind = match desc.sdp_type {
            RTCSdpType::Answer | RTCSdpType::Pranswer => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        Some(SessionDescription {
            kind,
            sdp: desc.sdp,
        })
    }

    fn on_state_change(&self, handler: StateChangeHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);

                let state = match s {
                    RTCPeerConnectionState::Connecting => MediaConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => MediaConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => MediaConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => MediaConnectionState::Failed,
                    RTCPeerConnectionState::Closed => MediaConnectionState::Closed,
                    _ => MediaConnectionState::New,
                };
                handler(state);

                Box::pin(async {})
            }));
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        // Abspielen braucht einen Decoder, hier wird der Track nur gemeldet
        self.pc.on_track(Box::new(move |track, _, _| {
            let info = RemoteTrackInfo {
                track_id: track.id(),
                codec: track.codec().capability.mime_type,
            };
            handler(info);
            Box::pin(async {})
        }));
    }

    async fn close(&self) {
        self.local_track.lock().take();
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

impl std::fmt::Debug for WebRtcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcSession")
            .field("connection_state", &self.pc.connection_state())
            .field("has_local_track", &self.local_track.lock().is_some())
            .finish()
    }
}
