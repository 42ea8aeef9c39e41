//! scatter-node: the file server that ties storage, crypto and transport
//! together.
//!
//! A [`FileServer`] keeps an encrypted local blob store and a registry of
//! connected peers. `store` persists locally and replicates to every peer;
//! `get` falls back to a first-responder network fetch; `remove` deletes
//! everywhere, `remove_local` only here.

pub mod link;
pub mod locks;
pub mod metrics;
pub mod registry;
pub mod server;

pub use link::Link;
pub use locks::KeyLocks;
pub use metrics::NodeMetrics;
pub use registry::PeerRegistry;
pub use server::{FileServer, FileServerOpts, DEFAULT_FETCH_TIMEOUT, DEFAULT_SETTLE_DELAY};
