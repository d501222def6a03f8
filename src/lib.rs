//! Distributed monitors over a fixed-size group of message-passing peers.
//!
//! This crate implements the classical monitor abstraction -- a named
//! mutual-exclusion region plus condition variables -- for processes that
//! only talk to each other via point-to-point messages. It provides:
//!
//! - [`clock`]: the scalar Lamport logical clock used to order requests.
//! - [`packet`]: the wire packet and its binary framing.
//! - [`channel`]: the transport contract ([`channel::Channel`]) and an
//!   in-process reference implementation for tests.
//! - [`dispatcher`]: the receiver loop that demultiplexes inbound packets.
//! - [`mutex_engine`]: Ricart-Agrawala mutual exclusion.
//! - [`cv_engine`]: distributed condition variables layered on the mutex.
//! - [`monitor`]: the [`monitor::Monitor`] that couples a mutex with
//!   replicated state via a `SYNC` broadcast.
//! - [`sync_primitives`]: the standalone [`sync_primitives::DistributedMutex`]
//!   and [`sync_primitives::DistributedConditionVariable`] API surface.
//! - [`error`]: the crate's error type ([`error::Error`]).
//!
//! None of this models fault tolerance or dynamic membership: the peer
//! group is fixed at startup, and a crashed peer is not detected or routed
//! around.

pub mod channel;
pub mod clock;
pub mod cv_engine;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod mutex_engine;
pub mod packet;
pub mod sync_primitives;

pub use error::Result;
