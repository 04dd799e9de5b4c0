//! Broker transport implementations.
//!
//! This module contains concrete implementations of the `BrokerTransport` and
//! `BrokerLink` traits. Production transports live outside this crate; the
//! in-memory broker is the reference implementation used by tests and demos.

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryConfig};
