//! Client-facing network front-end of a coordination service.
//!
//! One reactor thread owns the listening socket and every client connection:
//! length-prefixed framing, the session handshake, per-connection
//! backpressure against the request pipeline, four-letter diagnostic
//! commands multiplexed on the same port, and watch-notification delivery.
//!
//! The request-execution side plugs in through [`ServerCore`]; it talks back
//! to clients through the [`CnxnHandle`] each request carries.

pub mod config;
pub mod proto;
pub mod runtime;
pub mod server;
pub mod trace;

pub use runtime::{CnxnHandle, Reactor, ReactorHandle};
pub use server::{AuthProvider, AuthRegistry, Request, ServerCore, ServerStats};
