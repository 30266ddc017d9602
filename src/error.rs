// Copyright (c) 2024 Botho Foundation

//! Core error kinds shared across all components.
//!
//! Transient failures (`NoRoute`, `Timeout`, `DhtNotFound`) are meant to be
//! recovered by the caller or surfaced as-is. Structural failures
//! (`ProtocolViolation`, link loss) are handled locally by the component that
//! detected them and re-surfaced as a `PeerDisconnected`/`PeerEvicted` event;
//! no exception-like unwind crosses a component boundary.

use crate::peer_id::PeerId;
use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("not connected to a signaling hub")]
    NotConnected,

    #[error("no route to peer {0}")]
    NoRoute(PeerId),

    #[error("operation timed out")]
    Timeout,

    #[error("peer {0} was evicted")]
    PeerEvicted(PeerId),

    #[error("peer {0} disconnected: {1}")]
    PeerDisconnected(PeerId, String),

    #[error("no value found for key")]
    DhtNotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("connection refused: degree ceiling reached")]
    DegreeCeiling,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("record is immutable")]
    Immutable,

    #[error("stream aborted: {0}")]
    StreamAborted(String),
}
