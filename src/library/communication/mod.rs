//! Structures to exchange messages with a topic based broker
//!
//! Components talk to the outside world exclusively through the
//! [`Transport`](transport::Transport) trait. It models the small slice of a
//! message broker that the pipeline relies on: one connection, an input and an
//! output channel, exchange/queue declarations, bindings, consumption with a
//! prefetch window and publication with per-message properties.
//!
//! Two implementations are provided. The [`memory`] module contains a fully
//! functional in-process broker which backs single-process pipelines and the
//! integration tests. The [`mock`] module contains a scripted transport which
//! replays a pre-recorded exchange and fails loudly on any deviation, making
//! protocol level tests deterministic. A network client maps onto the same
//! trait without the rest of the crate noticing.

pub mod matching;
pub mod memory;
pub mod message;
pub mod transport;

#[cfg(any(test, feature = "test"))]
pub mod mock;
