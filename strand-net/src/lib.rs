//! Strand network data model.
//!
//! The shared vocabulary of the transaction engine: the closed error
//! taxonomy, request destinations, proxy chains, per-attempt security
//! configuration, and the cross-request server-properties store.
//!
//! Wire protocols are not implemented here; `strand-http` drives them
//! through opaque boundary traits.

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]

pub mod address;
pub mod properties;
pub mod proxy;
pub mod tls;

pub(crate) mod error;
#[doc(inline)]
pub use error::{BoxError, ErrorClass, NetError, NetResult};

pub(crate) mod proto;
#[doc(inline)]
pub use proto::{AlternativeService, NextProto, parse_alt_svc_header};
