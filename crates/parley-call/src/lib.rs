#![forbid(unsafe_code)]

//! Call lifecycle and media negotiation core.
//!
//! [`CallController`] drives one user's calls against four seams:
//! a [`SignalingChannel`] for peer-to-peer messages, a [`CallRecordStore`]
//! for durable call records, a [`MediaSourceProvider`](parley_media::MediaSourceProvider)
//! for capture, and a [`PeerConnectionFactory`] for the native
//! offer/answer primitive. In-process implementations of the seams
//! ([`LoopbackHub`], [`MemoryCallStore`], [`SimulatedPeerFactory`]) make the
//! whole lifecycle runnable without a network.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod peer;
pub mod signaling;
pub mod sim;
pub mod store;

pub use config::CallConfig;
pub use controller::{CallController, CallView, Collaborators, Direction, EndReason, BUSY_REASON};
pub use engine::{NegotiationEngine, NegotiationSnapshot, NegotiationStats, Role, ScreenAttach};
pub use error::{CallError, PeerError, Result, SignalingError, StoreError};
pub use loopback::LoopbackHub;
pub use peer::{
    IceState, PeerConfig, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEvents, SenderId,
    SignalingState,
};
pub use signaling::{Deduplicator, Reachability, SignalStream, SignalingChannel};
pub use sim::{IceOutcome, SimulatedPeer, SimulatedPeerFactory};
pub use store::{CallFeed, CallRecordStore, FeedRegistry, MemoryCallStore};
