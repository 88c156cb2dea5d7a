/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use palaver_protocol::{decode_b64_json, encode_b64_json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::{Marshal, MarshalSize};

use crate::config::ServerConfig;
use crate::media_relay::{
    spawn_track_relay, InboundTrack, KeyframeFeedback, Negotiated, NegotiationError, OutboundTrack, RelayConnector,
    RelayEndpoint, RelayHandle, RelayIoError,
};
use crate::registry::lock;

static ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

struct PublishedTrack {
    publisher: String,
    endpoint_id: u64,
    track: Arc<TrackLocalStaticRTP>,
}

type Published = Arc<Mutex<Vec<PublishedTrack>>>;

/// Relay endpoints backed by `webrtc` peer connections.
pub struct WebrtcRelay {
    ice_urls: Vec<String>,
    ice_username: Option<String>,
    ice_credential: Option<String>,
    pli_interval: Duration,
    gather_timeout: Duration,
    published: Published,
}

impl WebrtcRelay {
    pub fn new(cfg: &ServerConfig) -> Self {
        Self {
            ice_urls: cfg.ice_urls.clone(),
            ice_username: cfg.ice_username.clone(),
            ice_credential: cfg.ice_credential.clone(),
            pli_interval: cfg.pli_interval,
            gather_timeout: cfg.ice_gather_timeout,
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn build_ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_urls.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_urls.clone(),
            username: self.ice_username.clone().unwrap_or_default(),
            credential: self.ice_credential.clone().unwrap_or_default(),
            ..Default::default()
        }]
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::step("register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::step("register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.build_ice_servers(),
                ..Default::default()
            })
            .await
            .map_err(|e| NegotiationError::step("new peer connection", e))?;
        Ok(Arc::new(pc))
    }

    fn tracks_of(&self, publishers: &[String]) -> Vec<Arc<TrackLocalStaticRTP>> {
        lock(&self.published)
            .iter()
            .filter(|p| publishers.iter().any(|name| name == &p.publisher))
            .map(|p| p.track.clone())
            .collect()
    }

    fn on_track(&self, pc: &Arc<RTCPeerConnection>, publisher: &str, endpoint_id: u64, cancel: &CancellationToken) {
        let pc_weak = Arc::downgrade(pc);
        let published = self.published.clone();
        let publisher = publisher.to_string();
        let pli_interval = self.pli_interval;
        let cancel = cancel.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let pc_weak = pc_weak.clone();
            let published = published.clone();
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                let kind = track.kind();
                let relay_track = Arc::new(TrackLocalStaticRTP::new(
                    track.codec().capability.clone(),
                    format!("{kind}-{publisher}"),
                    format!("palaver-{publisher}"),
                ));
                lock(&published).push(PublishedTrack {
                    publisher: publisher.clone(),
                    endpoint_id,
                    track: relay_track.clone(),
                });
                spawn_track_relay(
                    &publisher,
                    Arc::new(RemoteTrack(track)),
                    Arc::new(RelayTrack(relay_track)),
                    Arc::new(PeerFeedback(pc_weak)),
                    pli_interval,
                    cancel.child_token(),
                );
            })
        }));
    }

    async fn answer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        publisher: &str,
        subscribe_to: &[String],
        offer: RTCSessionDescription,
        endpoint_id: u64,
        cancel: &CancellationToken,
    ) -> Result<String, NegotiationError> {
        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .map_err(|e| NegotiationError::step("add audio transceiver", e))?;
        pc.add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .map_err(|e| NegotiationError::step("add video transceiver", e))?;

        for track in self.tracks_of(subscribe_to) {
            let sender = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| NegotiationError::step("add relay track", e))?;
            // Drain RTCP so interceptors keep running.
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = sender.read(&mut buf) => if res.is_err() { break },
                    }
                }
            });
        }

        self.on_track(pc, publisher, endpoint_id, cancel);

        pc.set_remote_description(offer)
            .await
            .map_err(|e| NegotiationError::step("set_remote_description", e))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::step("create_answer", e))?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| NegotiationError::step("set_local_description", e))?;
        // The browser client does not trickle; hand back a complete description.
        if tokio::time::timeout(self.gather_timeout, gather_complete.recv()).await.is_err() {
            warn!(%publisher, "ice gathering timed out, answering with partial candidates");
        }
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| NegotiationError::step("local_description", "unavailable after gathering"))?;
        Ok(encode_b64_json(&local)?)
    }
}

#[async_trait]
impl RelayConnector for WebrtcRelay {
    async fn negotiate(
        &self,
        publisher: &str,
        subscribe_to: &[String],
        encoded_description: &str,
    ) -> Result<Negotiated, NegotiationError> {
        let offer: RTCSessionDescription = decode_b64_json(encoded_description)?;
        let pc = self.new_peer_connection().await?;
        let endpoint_id = ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let endpoint = PeerEndpoint {
            pc: pc.clone(),
            endpoint_id,
            published: self.published.clone(),
        };

        match self.answer(&pc, publisher, subscribe_to, offer, endpoint_id, &cancel).await {
            Ok(answer) => {
                info!(%publisher, endpoint_id, subscribed = subscribe_to.len(), "relay endpoint negotiated");
                Ok(Negotiated {
                    answer,
                    handle: RelayHandle::new(Box::new(endpoint), cancel),
                })
            }
            Err(e) => {
                cancel.cancel();
                endpoint.close().await;
                Err(e)
            }
        }
    }
}

struct PeerEndpoint {
    pc: Arc<RTCPeerConnection>,
    endpoint_id: u64,
    published: Published,
}

#[async_trait]
impl RelayEndpoint for PeerEndpoint {
    async fn close(&self) {
        lock(&self.published).retain(|p| p.endpoint_id != self.endpoint_id);
        if let Err(e) = self.pc.close().await {
            warn!(endpoint_id = self.endpoint_id, "peer connection close failed: {e}");
        } else {
            debug!(endpoint_id = self.endpoint_id, "relay endpoint closed");
        }
    }
}

struct RemoteTrack(Arc<TrackRemote>);

#[async_trait]
impl InboundTrack for RemoteTrack {
    fn ssrc(&self) -> u32 {
        self.0.ssrc()
    }

    fn payload_type(&self) -> u8 {
        self.0.payload_type()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, RelayIoError> {
        let (packet, _) = self.0.read_rtp().await.map_err(|e| match e {
            webrtc::Error::ErrClosedPipe => RelayIoError::Closed,
            other => RelayIoError::Other(other.to_string()),
        })?;
        let size = packet.marshal_size();
        if size > buf.len() {
            return Err(RelayIoError::Oversized(size));
        }
        packet
            .marshal_to(buf)
            .map_err(|e| RelayIoError::Other(e.to_string()))
    }
}

struct RelayTrack(Arc<TrackLocalStaticRTP>);

#[async_trait]
impl OutboundTrack for RelayTrack {
    async fn write(&self, packet: &[u8]) -> Result<usize, RelayIoError> {
        self.0.write(packet).await.map_err(|e| match e {
            webrtc::Error::ErrClosedPipe => RelayIoError::NoSubscribers,
            other => RelayIoError::Other(other.to_string()),
        })
    }
}

struct PeerFeedback(Weak<RTCPeerConnection>);

#[async_trait]
impl KeyframeFeedback for PeerFeedback {
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), RelayIoError> {
        let Some(pc) = self.0.upgrade() else {
            return Err(RelayIoError::Closed);
        };
        if pc.connection_state() == RTCPeerConnectionState::Closed {
            return Err(RelayIoError::Closed);
        }
        pc.write_rtcp(&[Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })])
        .await
        .map(|_| ())
        .map_err(|e| RelayIoError::Other(e.to_string()))
    }
}
