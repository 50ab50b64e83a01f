use http::{HeaderMap, Method, Uri};

use crate::body::UploadBody;
use crate::stream::StreamKind;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Per-request behavioural flags supplied by the caller.
    pub struct LoadFlags: u32 {
        /// Skip the cache entirely and tell intermediaries to do the same.
        const BYPASS_CACHE = 1 << 0;
        /// Force revalidation of any cached entry along the way.
        const VALIDATE_CACHE = 1 << 1;
        /// Never attach credentials for the destination server.
        const DO_NOT_SEND_AUTH_DATA = 1 << 2;
        /// Skip admission control limits.
        const IGNORE_LIMITS = 1 << 3;
        /// Skip certificate revocation checking for this request.
        const DISABLE_CERT_REVOCATION_CHECKING = 1 << 4;
        /// The request loads a top-level document.
        const MAIN_FRAME = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Scheduling priority of a request, lowest first.
pub enum RequestPriority {
    Idle,
    Lowest,
    Low,
    Medium,
    Highest,
}

impl Default for RequestPriority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone)]
/// Everything the caller supplies to describe one HTTP exchange.
///
/// The transaction keeps a shared reference to this only until the final
/// response headers are available, then releases it; body reads do not
/// need it.
pub struct HttpRequestInfo {
    pub uri: Uri,
    pub method: Method,
    /// Caller headers, layered on top of the engine-generated ones.
    pub extra_headers: HeaderMap,
    pub upload: Option<UploadBody>,
    pub load_flags: LoadFlags,
    pub priority: RequestPriority,
    /// What kind of stream the exchange needs; plain request/response
    /// unless the caller is driving an upgrade or duplex exchange.
    pub stream_kind: StreamKind,
}

impl HttpRequestInfo {
    /// A GET for `uri` with default flags and priority.
    #[must_use]
    pub fn get(uri: Uri) -> Self {
        Self {
            uri,
            method: Method::GET,
            extra_headers: HeaderMap::new(),
            upload: None,
            load_flags: LoadFlags::default(),
            priority: RequestPriority::default(),
            stream_kind: StreamKind::Basic,
        }
    }
}

#[derive(Debug, Clone)]
/// The fully built request head handed to the stream for sending.
pub struct RequestHead {
    pub method: Method,
    /// Request target in the form the connection expects: absolute-form
    /// when talking through a proxy without a tunnel, origin-form otherwise.
    pub target: String,
    pub headers: HeaderMap,
}
