//! Forwards the tracing crate so every crate in this workspace pins the same
//! version and feature set through a single `Cargo.toml` entry.

pub use tracing;
