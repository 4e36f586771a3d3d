// Client-side modules for connection lifecycle, queueing, requests, and
// caching policy.
#![allow(clippy::module_inception)]
pub mod client;
pub mod connection;
pub mod context;
pub mod inventory;
pub mod oneshot;
pub mod queue;
pub mod request;
