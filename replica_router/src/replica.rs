use std::fmt::Debug;
use std::sync::Arc;

use fingerprint::Payload;

/// Opaque, stable identity of a serving replica.
///
/// Cheap to clone (wraps an `Arc<str>`) and ordered so it can be used as a
/// `BTreeMap`/`HashMap` key and printed in log lines.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(Arc<str>);

impl ReplicaId {
    /// Wrap an identity string as a [`ReplicaId`].
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A handle the router can route to without depending on what it wraps.
///
/// This is the seam from spec.md's §9 "cyclic graph" design note: the router
/// depends only on this trait, never on `engine_pool`'s `Engine` type, so the
/// router ↔ replica-wrapper ↔ pool-manager cycle the Python source exhibits
/// never exists here. `engine_pool` implements this trait for its own handle
/// type and hands router-facing code a `&dyn ReplicaHandle`/`R: ReplicaHandle`.
pub trait ReplicaHandle: Debug + Clone + Send + Sync + 'static {
    /// This replica's stable identity.
    fn replica_id(&self) -> &ReplicaId;
}

/// Metadata accompanying a [`PendingRequest`].
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    /// The caller-supplied (or generated) request id.
    pub request_id: String,
}

/// A request awaiting a routing decision.
///
/// `args` is the unstructured payload the router's cache-key extractor
/// inspects; everything else about the request is opaque to the router.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// The request payload, as decoded JSON.
    pub args: Payload,
    /// Request-scoped metadata.
    pub metadata: RequestMetadata,
}

impl PendingRequest {
    /// Build a `PendingRequest` from a payload and request id.
    pub fn new(args: Payload, request_id: impl Into<String>) -> Self {
        Self {
            args,
            metadata: RequestMetadata {
                request_id: request_id.into(),
            },
        }
    }
}
