// Copyright (c) 2024 Botho Foundation

//! Signaling client (C2): maintains one logical control link to a Hub over a
//! WebSocket, framed as JSON per §6. Grounded on the transport layer's
//! `SessionId`/session-lifecycle conventions and on the RPC layer's
//! `tokio_tungstenite` + `tokio::select!` event-loop shape, generalized from
//! a server-side broadcaster into a reconnecting client.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::peer_id::PeerId;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("not authenticated with the hub")]
    NotAuthenticated,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("channel closed")]
    ChannelClosed,
}

/// Wire frames exchanged with a Hub (§6 "Signaling wire format").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingFrame {
    Announce { peer_id: PeerId },
    PeerDiscovered { peer_id: PeerId },
    Offer { from: PeerId, to: PeerId, sdp: String },
    Answer { from: PeerId, to: PeerId, sdp: String },
    Ice { from: PeerId, to: PeerId, candidate: String },
    Ping { ts: u64 },
    Pong { ts: u64 },
    Goodbye { peer_id: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Authenticated,
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Authenticated,
    FrameReceived(SignalingFrame),
    Disconnected(String),
}

/// Handle held by the rest of the node to drive and observe the signaling
/// link. The actual socket lives on a background task; this handle only
/// carries channel endpoints, matching the DHT actor's request/response
/// shape used elsewhere in this crate.
pub struct SignalingHandle {
    outbound: mpsc::Sender<SignalingFrame>,
    pub events: mpsc::Receiver<SignalingEvent>,
}

impl SignalingHandle {
    pub async fn send(&self, frame: SignalingFrame) -> Result<(), SignalingError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SignalingError::ChannelClosed)
    }

    pub async fn send_goodbye(&self, peer_id: PeerId) -> Result<(), SignalingError> {
        self.send(SignalingFrame::Goodbye { peer_id }).await
    }

    /// A cloneable outbound sender, for callers (e.g. per-link ICE candidate
    /// forwarding) that need to queue frames from many tasks at once.
    pub fn outbound_sender(&self) -> mpsc::Sender<SignalingFrame> {
        self.outbound.clone()
    }
}

/// Spawns the reconnecting signaling client task and returns a handle to it.
///
/// State machine: `Disconnected -> Connecting (open) -> Authenticated (after
/// sending `announce` and receiving the first frame) -> Disconnected` on any
/// error or close. While the caller's intent remains "connected", reconnects
/// are scheduled after `min(base * 2^attempt, cap)`, attempt clamped at
/// `max_reconnect_attempts`.
pub fn spawn(
    hub_uri: String,
    self_peer_id: PeerId,
    backoff_base: Duration,
    backoff_cap: Duration,
    max_attempts: u32,
) -> SignalingHandle {
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let (events_tx, events_rx) = mpsc::channel(256);

    tokio::spawn(run_client(
        hub_uri,
        self_peer_id,
        backoff_base,
        backoff_cap,
        max_attempts,
        outbound_rx,
        events_tx,
    ));

    SignalingHandle { outbound: outbound_tx, events: events_rx }
}

async fn run_client(
    hub_uri: String,
    self_peer_id: PeerId,
    backoff_base: Duration,
    backoff_cap: Duration,
    max_attempts: u32,
    mut outbound_rx: mpsc::Receiver<SignalingFrame>,
    events_tx: mpsc::Sender<SignalingEvent>,
) {
    let mut attempt: u32 = 0;

    loop {
        match tokio_tungstenite::connect_async(&hub_uri).await {
            Ok((ws_stream, _response)) => {
                attempt = 0;
                info!(hub = %hub_uri, "signaling connected");
                let reason = run_session(ws_stream, self_peer_id, &mut outbound_rx, &events_tx).await;
                let _ = events_tx.send(SignalingEvent::Disconnected(reason)).await;
            }
            Err(err) => {
                warn!(hub = %hub_uri, error = %err, "signaling connect failed");
                let _ = events_tx
                    .send(SignalingEvent::Disconnected(err.to_string()))
                    .await;
            }
        }

        if attempt >= max_attempts {
            debug!("signaling reconnect attempts exhausted");
            return;
        }
        let delay = backoff_base
            .saturating_mul(1u32.wrapping_shl(attempt.min(31)))
            .min(backoff_cap);
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

/// Drives a single connected session to completion; returns the reason the
/// session ended.
async fn run_session<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    self_peer_id: PeerId,
    outbound_rx: &mut mpsc::Receiver<SignalingFrame>,
    events_tx: &mpsc::Sender<SignalingEvent>,
) -> String
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    if send_frame(&mut write, &SignalingFrame::Announce { peer_id: self_peer_id })
        .await
        .is_err()
    {
        return "failed to send announce".to_string();
    }

    let mut authenticated = false;
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut write, &frame).await.is_err() {
                            return "send failed".to_string();
                        }
                    }
                    None => return "local shutdown".to_string(),
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingFrame>(&text) {
                            Ok(frame) => {
                                if !authenticated {
                                    authenticated = true;
                                    let _ = events_tx.send(SignalingEvent::Authenticated).await;
                                }
                                if let SignalingFrame::Pong { .. } = &frame {
                                    last_pong = Instant::now();
                                }
                                if events_tx.send(SignalingEvent::FrameReceived(frame)).await.is_err() {
                                    return "event receiver dropped".to_string();
                                }
                            }
                            Err(err) => warn!(error = %err, "malformed signaling frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return "hub closed".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return err.to_string(),
                }
            }
            _ = keepalive.tick() => {
                if last_pong.elapsed() > KEEPALIVE_INTERVAL * 2 {
                    return "keepalive timeout".to_string();
                }
                let ts = now_unix();
                if send_frame(&mut write, &SignalingFrame::Ping { ts }).await.is_err() {
                    return "ping send failed".to_string();
                }
            }
        }
    }
}

async fn send_frame<W>(write: &mut W, frame: &SignalingFrame) -> Result<(), ()>
where
    W: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    write.send(Message::Text(text.into())).await.map_err(|_| ())
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let frame = SignalingFrame::Offer {
            from: PeerId::new_random(),
            to: PeerId::new_random(),
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let decoded: SignalingFrame = serde_json::from_str(&json).unwrap();
        match decoded {
            SignalingFrame::Offer { sdp, .. } => assert_eq!(sdp, "v=0"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn announce_frame_uses_kebab_case_tag() {
        let frame = SignalingFrame::PeerDiscovered { peer_id: PeerId::new_random() };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"peer-discovered\""));
    }
}
