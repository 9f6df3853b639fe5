//! Connection pool manager
//!
//! Bounded, lazily hydrated connection reuse per agent. The pool knows
//! nothing about tasks or routing policy; it hands out leases keyed by
//! agent id and takes them back.

pub mod connection;
pub mod manager;

pub use connection::{Connection, ConnectionInfo, ConnectionState, PoolStats};
pub use manager::{ConnectionPool, PooledConnection};
