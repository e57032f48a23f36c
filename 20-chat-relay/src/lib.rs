//! A TCP chat relay.
//!
//! Clients connect, log in with a nickname and password, and exchange JSON
//! envelopes: public messages go to everyone else online, private messages to
//! one named recipient. The relay shuts itself down when nobody has been
//! online for a full idle timeout.
//!
//! - [`cli`] parses the command line into a [`config::RelayConfig`].
//! - [`relay`] owns the listener, the accept loop and shutdown.
//! - [`dispatcher`] runs one session per connection.
//! - [`router`] delivers public and private messages.
//! - [`registry`] tracks who is online and how to reach them.
//! - [`auth`] answers login requests.
//! - [`envelope`] and [`codec`] define the newline-delimited JSON protocol.
//!
//! Integration tests under `tests/` drive a real relay over TCP.

pub mod auth;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod relay;
pub mod router;

pub use relay::{Lifecycle, Relay, ShutdownReason};
