//! Pluggable replica routing: power-of-two-choices, static-hash sharding, and
//! consistent hashing with bounded loads (CHWBL), with a chat-aware cache-key
//! extractor for co-locating conversation turns.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chwbl;
mod config;
mod hash_ring;
mod policy;
mod pow2;
mod queue_len_cache;
mod replica;
mod router;
mod static_hash;

pub use chwbl::ChwblRouter;
pub use config::RouterConfig;
pub use hash_ring::{HashRing, RingWalk};
pub use policy::{RouterKind, RouterPolicy};
pub use pow2::Pow2Router;
pub use queue_len_cache::QueueLenCache;
pub use replica::{PendingRequest, ReplicaHandle, ReplicaId, RequestMetadata};
pub use router::ReplicaRouter;
pub use static_hash::StaticHashRouter;
