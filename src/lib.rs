//! Strand is a client-side HTTP transaction engine: the orchestration core
//! that drives a single HTTP request, inside a full network stack, from
//! submission to response delivery.
//!
//! It transparently chooses among transports, reuses and shares wire
//! connections across requests, negotiates proxy and server authentication
//! without blocking unrelated requests, and recovers from transient
//! network and protocol failures invisibly to the caller.
//!
//! The engine is deliberately codec-free: request framing, handshakes,
//! socket allocation and credential schemes live behind the boundary
//! traits in [`http::stream`], [`http::connect`] and [`http::auth`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strand::http::{HttpRequestInfo, NetworkSession, Transaction};
//!
//! # async fn run(connector: Arc<dyn strand::http::connect::Connector>) -> strand::net::NetResult<()> {
//! let session = Arc::new(NetworkSession::new(connector));
//! let request = Arc::new(HttpRequestInfo::get("https://example.com".parse().unwrap()));
//!
//! let mut transaction = Transaction::new(session);
//! transaction.start(request).await?;
//!
//! let mut body = Vec::new();
//! let mut buf = [0u8; 16 * 1024];
//! loop {
//!     let n = transaction.read(&mut buf).await?;
//!     if n == 0 {
//!         break;
//!     }
//!     body.extend_from_slice(&buf[..n]);
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]

#[doc(inline)]
pub use strand_http as http;
#[doc(inline)]
pub use strand_net as net;
