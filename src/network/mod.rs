//! Network protocol handling
//!
//! This module implements the client side of the binary wire protocol:
//! framed messages over TCP, a bounded connection pool, and per-peer reply
//! demultiplexing.
//!
//! ## Request Flow
//!
//! 1. **Reserve**: the caller leases a connection from the pool
//! 2. **Send**: the framed request goes out in one atomic write
//! 3. **Demultiplex**: the connection's reader task decodes reply frames and
//!    routes them by response-to id
//! 4. **Await**: the caller wakes with its reply, or times out
//!
//! Requests carry strictly increasing ids; replies may arrive in any order.

pub mod connection;
pub mod pool;
pub mod protocol;
pub mod server;

pub use connection::Connection;
pub use pool::PooledConnection;
pub use protocol::{Message, MsgHeader, Reply};
pub use server::{Server, ServerOptions};
