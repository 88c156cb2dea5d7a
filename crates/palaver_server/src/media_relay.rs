/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Selective forwarding: one relay track per inbound publisher track, fed by a
//! packet forwarder, plus a ticker asking the publisher for keyframes.
//!
//! The loops only see the small traits below; `webrtc_relay` binds them to a
//! real peer connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use palaver_protocol::DecodeError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fits a typical path MTU for RTP.
pub const RTP_BUFFER_SIZE: usize = 1400;
pub const DEFAULT_PLI_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum RelayIoError {
    #[error("no subscribers attached")]
    NoSubscribers,
    #[error("packet of {0} bytes exceeds relay buffer")]
    Oversized(usize),
    #[error("track closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("decode session description: {0}")]
    Decode(#[from] DecodeError),
    #[error("{step} failed: {reason}")]
    Step { step: &'static str, reason: String },
}

impl NegotiationError {
    pub fn step(step: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Step {
            step,
            reason: err.to_string(),
        }
    }
}

#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn ssrc(&self) -> u32;
    fn payload_type(&self) -> u8;
    /// Reads one RTP packet into `buf`, returning its length.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, RelayIoError>;
}

#[async_trait]
pub trait OutboundTrack: Send + Sync {
    async fn write(&self, packet: &[u8]) -> Result<usize, RelayIoError>;
}

#[async_trait]
pub trait KeyframeFeedback: Send + Sync {
    /// Sends a picture-loss indication for `media_ssrc`.
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), RelayIoError>;
}

#[async_trait]
pub trait RelayEndpoint: Send + Sync {
    async fn close(&self);
}

/// Result of negotiating a relay endpoint for one session description.
pub struct Negotiated {
    /// Base64-of-JSON answer to hand back to the publisher.
    pub answer: String,
    pub handle: RelayHandle,
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Builds an endpoint for `publisher` from `encoded_description`, attaching
    /// the relay tracks already published by `subscribe_to`.
    async fn negotiate(
        &self,
        publisher: &str,
        subscribe_to: &[String],
        encoded_description: &str,
    ) -> Result<Negotiated, NegotiationError>;
}

/// Owns an endpoint and every task spawned for it.
pub struct RelayHandle {
    endpoint: Box<dyn RelayEndpoint>,
    cancel: CancellationToken,
}

impl RelayHandle {
    pub fn new(endpoint: Box<dyn RelayEndpoint>, cancel: CancellationToken) -> Self {
        Self { endpoint, cancel }
    }

    pub async fn close(self) {
        self.cancel.cancel();
        self.endpoint.close().await;
    }
}

/// Copies packets from `inbound` to `outbound` until cancelled or a hard error.
/// Returns the number of packets delivered to at least one subscriber; a
/// write of zero bytes means no subscriber was bound.
pub async fn forward_packets(
    inbound: &dyn InboundTrack,
    outbound: &dyn OutboundTrack,
    cancel: &CancellationToken,
) -> Result<u64, RelayIoError> {
    let mut buf = vec![0u8; RTP_BUFFER_SIZE];
    let mut forwarded = 0u64;
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(forwarded),
            read = inbound.read(&mut buf) => match read {
                Ok(n) => n,
                Err(RelayIoError::Oversized(size)) => {
                    debug!(ssrc = inbound.ssrc(), size, "dropping oversized rtp packet");
                    continue;
                }
                Err(e) => return Err(e),
            },
        };
        match outbound.write(&buf[..n]).await {
            Ok(0) => {}
            Ok(_) => forwarded += 1,
            // Nobody attached yet.
            Err(RelayIoError::NoSubscribers) => {}
            Err(e) => return Err(e),
        }
    }
}

/// Sends a keyframe request every `every` until cancelled or the endpoint is gone.
/// Returns how many requests went out.
pub async fn request_keyframes(
    feedback: &dyn KeyframeFeedback,
    media_ssrc: u32,
    every: Duration,
    cancel: &CancellationToken,
) -> u64 {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    tick.tick().await;
    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return sent,
            _ = tick.tick() => {}
        }
        match feedback.request_keyframe(media_ssrc).await {
            Ok(()) => sent += 1,
            Err(RelayIoError::Closed) => return sent,
            Err(e) => warn!(ssrc = media_ssrc, "keyframe request failed: {e}"),
        }
    }
}

pub struct TrackRelayTasks {
    pub keyframes: JoinHandle<u64>,
    pub forwarder: JoinHandle<Result<u64, RelayIoError>>,
}

/// Spawns the keyframe ticker and the forwarder for one inbound track.
pub fn spawn_track_relay(
    publisher: &str,
    inbound: Arc<dyn InboundTrack>,
    outbound: Arc<dyn OutboundTrack>,
    feedback: Arc<dyn KeyframeFeedback>,
    pli_interval: Duration,
    cancel: CancellationToken,
) -> TrackRelayTasks {
    let ssrc = inbound.ssrc();
    info!(%publisher, ssrc, payload_type = inbound.payload_type(), "relaying track");

    let keyframes = {
        let cancel = cancel.clone();
        tokio::spawn(async move { request_keyframes(feedback.as_ref(), ssrc, pli_interval, &cancel).await })
    };

    let publisher = publisher.to_string();
    let forwarder = tokio::spawn(async move {
        let res = forward_packets(inbound.as_ref(), outbound.as_ref(), &cancel).await;
        match &res {
            Ok(n) => info!(%publisher, ssrc, forwarded = n, "relay track stopped"),
            Err(RelayIoError::Closed) => info!(%publisher, ssrc, "publisher track ended"),
            Err(e) => warn!(%publisher, ssrc, "relay forwarding failed: {e}"),
        }
        res
    });

    TrackRelayTasks { keyframes, forwarder }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ChannelTrack {
        ssrc: u32,
        rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    }

    fn inbound(ssrc: u32) -> (mpsc::Sender<Vec<u8>>, Arc<ChannelTrack>) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Arc::new(ChannelTrack { ssrc, rx: tokio::sync::Mutex::new(rx) }))
    }

    #[async_trait]
    impl InboundTrack for ChannelTrack {
        fn ssrc(&self) -> u32 {
            self.ssrc
        }

        fn payload_type(&self) -> u8 {
            96
        }

        async fn read(&self, buf: &mut [u8]) -> Result<usize, RelayIoError> {
            let packet = self.rx.lock().await.recv().await.ok_or(RelayIoError::Closed)?;
            if packet.len() > buf.len() {
                return Err(RelayIoError::Oversized(packet.len()));
            }
            buf[..packet.len()].copy_from_slice(&packet);
            Ok(packet.len())
        }
    }

    #[derive(Default)]
    struct RecordingTrack {
        subscribed: AtomicBool,
        /// Accepts writes but reports zero bytes, as an unbound local track does.
        unbound: AtomicBool,
        broken: AtomicBool,
        attempts: AtomicUsize,
        written: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl OutboundTrack for RecordingTrack {
        async fn write(&self, packet: &[u8]) -> Result<usize, RelayIoError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                return Err(RelayIoError::Other("transport gone".into()));
            }
            if self.unbound.load(Ordering::SeqCst) {
                return Ok(0);
            }
            if !self.subscribed.load(Ordering::SeqCst) {
                return Err(RelayIoError::NoSubscribers);
            }
            self.written.lock().unwrap().push(packet.to_vec());
            Ok(packet.len())
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn forwarder_survives_missing_subscribers() {
        let (tx, track) = inbound(1);
        let out = Arc::new(RecordingTrack::default());
        let cancel = CancellationToken::new();
        let task = {
            let (track, out, cancel) = (track.clone(), out.clone(), cancel.clone());
            tokio::spawn(async move { forward_packets(track.as_ref(), out.as_ref(), &cancel).await })
        };

        tx.send(vec![1, 2, 3]).await.unwrap();
        wait_for(|| out.attempts.load(Ordering::SeqCst) == 1).await;
        assert!(!task.is_finished());

        out.subscribed.store(true, Ordering::SeqCst);
        tx.send(vec![4, 5]).await.unwrap();
        wait_for(|| out.written.lock().unwrap().len() == 1).await;
        assert_eq!(out.written.lock().unwrap()[0], vec![4, 5]);

        drop(tx);
        assert!(matches!(task.await.unwrap(), Err(RelayIoError::Closed)));
    }

    #[tokio::test]
    async fn zero_byte_writes_are_not_counted_as_delivered() {
        let (tx, track) = inbound(1);
        let out = Arc::new(RecordingTrack::default());
        out.unbound.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let task = {
            let (track, out, cancel) = (track.clone(), out.clone(), cancel.clone());
            tokio::spawn(async move { forward_packets(track.as_ref(), out.as_ref(), &cancel).await })
        };

        tx.send(vec![1]).await.unwrap();
        tx.send(vec![2]).await.unwrap();
        wait_for(|| out.attempts.load(Ordering::SeqCst) == 2).await;
        out.unbound.store(false, Ordering::SeqCst);
        out.subscribed.store(true, Ordering::SeqCst);
        tx.send(vec![3]).await.unwrap();
        wait_for(|| out.written.lock().unwrap().len() == 1).await;

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn oversized_packets_are_skipped() {
        let (tx, track) = inbound(1);
        let out = Arc::new(RecordingTrack::default());
        out.subscribed.store(true, Ordering::SeqCst);
        tx.send(vec![0; RTP_BUFFER_SIZE + 1]).await.unwrap();
        tx.send(vec![7; 10]).await.unwrap();
        drop(tx);
        let res = forward_packets(track.as_ref(), out.as_ref(), &CancellationToken::new()).await;
        assert!(matches!(res, Err(RelayIoError::Closed)));
        assert_eq!(out.written.lock().unwrap().clone(), vec![vec![7; 10]]);
    }

    #[tokio::test]
    async fn write_failure_stops_only_that_forwarder() {
        let cancel = CancellationToken::new();
        let (bad_tx, bad_track) = inbound(1);
        let bad_out = Arc::new(RecordingTrack::default());
        bad_out.broken.store(true, Ordering::SeqCst);
        let (good_tx, good_track) = inbound(2);
        let good_out = Arc::new(RecordingTrack::default());
        good_out.subscribed.store(true, Ordering::SeqCst);

        let spawn = |track: Arc<ChannelTrack>, out: Arc<RecordingTrack>| {
            let cancel = cancel.clone();
            tokio::spawn(async move { forward_packets(track.as_ref(), out.as_ref(), &cancel).await })
        };
        let bad = spawn(bad_track, bad_out.clone());
        let good = spawn(good_track, good_out.clone());

        bad_tx.send(vec![1]).await.unwrap();
        good_tx.send(vec![2]).await.unwrap();
        let res = bad.await.unwrap();
        assert!(matches!(res, Err(RelayIoError::Other(_))));

        good_tx.send(vec![3]).await.unwrap();
        wait_for(|| good_out.written.lock().unwrap().len() == 2).await;
        assert!(!good.is_finished());

        cancel.cancel();
        assert_eq!(good.await.unwrap().unwrap(), 2);
    }

    struct CountingFeedback {
        attempts: AtomicUsize,
        fail_first: AtomicBool,
        closed_after: usize,
    }

    #[async_trait]
    impl KeyframeFeedback for CountingFeedback {
        async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), RelayIoError> {
            assert_eq!(media_ssrc, 42);
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.closed_after {
                return Err(RelayIoError::Closed);
            }
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(RelayIoError::Other("socket busy".into()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keyframe_requests_follow_the_interval_and_tolerate_errors() {
        let feedback = Arc::new(CountingFeedback {
            attempts: AtomicUsize::new(0),
            fail_first: AtomicBool::new(true),
            closed_after: usize::MAX,
        });
        let cancel = CancellationToken::new();
        let task = {
            let (feedback, cancel) = (feedback.clone(), cancel.clone());
            tokio::spawn(async move { request_keyframes(feedback.as_ref(), 42, DEFAULT_PLI_INTERVAL, &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        let sent = task.await.unwrap();
        assert_eq!(feedback.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keyframe_requests_stop_when_endpoint_closes() {
        let feedback = CountingFeedback {
            attempts: AtomicUsize::new(0),
            fail_first: AtomicBool::new(false),
            closed_after: 2,
        };
        let sent = request_keyframes(&feedback, 42, DEFAULT_PLI_INTERVAL, &CancellationToken::new()).await;
        assert_eq!(sent, 2);
    }
}
