//! The front-end that ties a [`replica_router`] routing policy to
//! [`engine_pool`] serving targets: accepts a payload, asks the router for a
//! priority-ordered candidate list, and dispatches to the first replica that
//! accepts the request.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::explicit_iter_loop, clippy::use_self)]

mod dispatcher;
mod error;
mod request_kind;
mod target;

pub use dispatcher::Dispatcher;
pub use engine_pool::{RerankRequest, RerankResponse, RerankResult};
pub use error::{DispatchError, ErrorKind};
pub use replica_router::{RouterConfig, RouterKind};
pub use request_kind::RequestKind;
pub use target::DispatchTarget;
