//! WebRTC PeerConnection management
//!
//! Handles the creation and lifecycle of RTCPeerConnection instances.
//! Data-channel only: no media engine codecs are registered.

use super::ConnectionError;
use crate::config::WebRtcConfig;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the transfer data channel.
pub const DATA_CHANNEL_LABEL: &str = "drop";

/// Callback for connection state changes
pub type StateChangeCallback = Box<dyn Fn(RTCPeerConnectionState) + Send + Sync>;

/// Builds peer connections from the configured ICE servers.
pub struct PeerConnectionFactory {
    config: WebRtcConfig,
}

impl PeerConnectionFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the configured settings
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, ConnectionError> {
        let mut media_engine = MediaEngine::default();

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| ConnectionError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self.config.ice_servers.iter().map(|server| {
            RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            }
        }).collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api.new_peer_connection(rtc_config).await
            .map_err(|e| ConnectionError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    /// Set up connection state change callback
    pub async fn setup_state_callback(
        peer_connection: &Arc<RTCPeerConnection>,
        callback: impl Fn(RTCPeerConnectionState) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let callback = callback.clone();
            Box::pin(async move {
                callback(state);
            })
        }));
    }

    /// Create an SDP offer and install it as the local description
    pub async fn create_offer(peer_connection: &Arc<RTCPeerConnection>) -> Result<String, ConnectionError> {
        let offer = peer_connection.create_offer(None).await
            .map_err(|e| ConnectionError::SdpError(format!("Failed to create offer: {}", e)))?;

        peer_connection.set_local_description(offer.clone()).await
            .map_err(|e| ConnectionError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(offer.sdp)
    }

    /// Handle an SDP answer
    pub async fn handle_answer(
        peer_connection: &Arc<RTCPeerConnection>,
        sdp: &str,
    ) -> Result<(), ConnectionError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| ConnectionError::SdpError(format!("Invalid SDP answer: {}", e)))?;

        peer_connection.set_remote_description(answer).await
            .map_err(|e| ConnectionError::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    /// Handle an SDP offer (for answering)
    pub async fn handle_offer(
        peer_connection: &Arc<RTCPeerConnection>,
        sdp: &str,
    ) -> Result<String, ConnectionError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| ConnectionError::SdpError(format!("Invalid SDP offer: {}", e)))?;

        peer_connection.set_remote_description(offer).await
            .map_err(|e| ConnectionError::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = peer_connection.create_answer(None).await
            .map_err(|e| ConnectionError::SdpError(format!("Failed to create answer: {}", e)))?;

        peer_connection.set_local_description(answer.clone()).await
            .map_err(|e| ConnectionError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(answer.sdp)
    }

    /// Add an ICE candidate
    pub async fn add_ice_candidate(
        peer_connection: &Arc<RTCPeerConnection>,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), ConnectionError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            username_fragment: None,
        };

        peer_connection.add_ice_candidate(candidate_init).await
            .map_err(|e| ConnectionError::IceError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    /// Create the transfer data channel: reliable, ordered delivery.
    pub async fn create_data_channel(
        peer_connection: &Arc<RTCPeerConnection>,
    ) -> Result<Arc<RTCDataChannel>, ConnectionError> {
        let config = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };

        let channel = peer_connection.create_data_channel(DATA_CHANNEL_LABEL, Some(config)).await
            .map_err(|e| ConnectionError::DataChannelError(format!("Failed to create data channel: {}", e)))?;

        Ok(channel)
    }

    /// Close a peer connection
    pub async fn close(peer_connection: &Arc<RTCPeerConnection>) -> Result<(), ConnectionError> {
        peer_connection.close().await
            .map_err(|e| ConnectionError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;

    #[tokio::test]
    async fn test_create_peer_connection() {
        let factory = PeerConnectionFactory::new(WebRtcConfig::default());
        let pc = factory.create_peer_connection().await.unwrap();
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::New);
    }

    #[tokio::test]
    async fn test_offer_produces_sdp() {
        let factory = PeerConnectionFactory::new(WebRtcConfig::default());
        let pc = factory.create_peer_connection().await.unwrap();
        let _channel = PeerConnectionFactory::create_data_channel(&pc).await.unwrap();
        let sdp = PeerConnectionFactory::create_offer(&pc).await.unwrap();
        assert!(sdp.starts_with("v=0"));
    }
}
