//! Strand HTTP transaction engine.
//!
//! The pair of cooperating state machines that drive one logical HTTP
//! exchange: the per-request [`Transaction`] and the connection jobs it
//! delegates to. The engine chooses transports transparently, shares and
//! reuses pooled sessions, negotiates proxy and server authentication, and
//! recovers from transient failures without surfacing them — the caller
//! only ever sees a final response, a final error, or a request for
//! out-of-band input.
//!
//! Byte-level codecs, handshakes and socket allocation live behind the
//! boundary traits in [`stream`], [`connect`] and [`auth`].

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]

pub mod auth;
pub mod body;
pub mod connect;
pub mod pool;
pub mod request;
pub mod response;
pub mod session;
pub mod stream;

pub(crate) mod job;
#[doc(inline)]
pub use job::preconnect;

pub(crate) mod transaction;
#[doc(inline)]
pub use transaction::{LoadState, Transaction};

#[doc(inline)]
pub use request::{HttpRequestInfo, LoadFlags, RequestPriority};
#[doc(inline)]
pub use response::HttpResponseInfo;
#[doc(inline)]
pub use session::{NetworkSession, SessionConfig};
