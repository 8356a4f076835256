//! Event-driven networking runtime: a single-threaded readiness loop
//! multiplexing stream and datagram binds over pluggable transport
//! protocols, with a zero-copy refcounted buffer subsystem underneath.
//!
//! Applications create a [`Runtime`], open binds with
//! [`listen`](Runtime::listen) / [`connect`](Runtime::connect) /
//! [`bind`](Runtime::bind), exchange data through pooled [`Bvec`]s, and
//! drive everything from [`wait`](Runtime::wait) or [`run`](Runtime::run).
//! Teardown is always deferred: handlers arm a close and the runtime frees
//! the bind at the end of the turn.

pub mod buffer;
pub mod ring;

mod bind;
mod config;
mod deferral;
mod endpoint;
mod error;
mod event;
pub mod framework;
mod poll;
mod protocol;
mod runtime;
mod socket;

pub use bind::{BindId, BindOps, Notify, NotifyFn, Segment, SegmentFn};
pub use buffer::{BufferId, BufferPool, Bvec};
pub use config::Config;
pub use deferral::DeferralId;
pub use endpoint::Endpoint;
pub use error::Error;
pub use event::EventFlags;
pub use framework::{Framework, FrameworkId, cleanup_frameworks, register_framework};
pub use poll::{UserPollFn, UserPollId};
pub use protocol::{Protocol, ProtocolId, protocol_lookup};
pub use ring::IovecRing;
pub use runtime::{Runtime, StopHandle};
