//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. The AMQP transport is hidden behind a feature flag
//! and exposed only through its constructor function; the in-memory
//! transport is always available.
//!
//! Client code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_amqp")]
mod amqp;

pub use memory::create_memory_transport;

#[cfg(feature = "transport_amqp")]
pub use amqp::create_amqp_transport;
