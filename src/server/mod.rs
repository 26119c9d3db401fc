//! Queue server façade, its HTTP surface and the matching client.
//!
//! Workers and clients talk to the queue through [`QueueConnection`], which
//! is implemented both by the in-process [`QueueServer`] and by the HTTP
//! [`QueueClient`].

pub mod api;
pub mod client;
pub mod connection;
pub mod queue_server;

pub use client::QueueClient;
pub use connection::QueueConnection;
pub use queue_server::QueueServer;
