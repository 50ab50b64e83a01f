use std::net::SocketAddr;

use futures::future::BoxFuture;

use strand_net::tls::SecurityInfo;
use strand_net::{AlternativeService, NetResult, NextProto};

use crate::body::UploadBody;
use crate::request::{HttpRequestInfo, RequestHead, RequestPriority};
use crate::response::HttpResponseInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What kind of stream a connection attempt must produce.
///
/// The variants replace what would otherwise be separate stream subclasses;
/// the tag travels alongside the [`HttpStream`] trait object.
pub enum StreamKind {
    /// Plain request/response stream.
    Basic,
    /// Bidirectional stream with independent read/write halves.
    Duplex,
    /// Stream destined for a protocol upgrade (e.g. websocket): 1xx heads
    /// surface to the caller instead of being skipped.
    Upgrade,
}

/// An established, protocol-negotiated connection usable for exactly one
/// request/response exchange.
///
/// This is the external boundary of the engine: byte-level framing lives
/// behind it. Async methods return boxed futures so the engine can own
/// streams as trait objects regardless of the transport that produced them.
pub trait HttpStream: Send {
    /// Bind the stream to a request before first use.
    fn initialize<'a>(
        &'a mut self,
        request: &'a HttpRequestInfo,
        priority: RequestPriority,
    ) -> BoxFuture<'a, NetResult<()>>;

    /// Send the built request head (and body, if any); response metadata the
    /// transport learns while sending is recorded on `response`.
    fn send_request<'a>(
        &'a mut self,
        head: &'a RequestHead,
        body: Option<&'a mut UploadBody>,
        response: &'a mut HttpResponseInfo,
    ) -> BoxFuture<'a, NetResult<()>>;

    /// Read the next response head into `response`.
    fn read_response_headers<'a>(
        &'a mut self,
        response: &'a mut HttpResponseInfo,
    ) -> BoxFuture<'a, NetResult<()>>;

    /// Read response body bytes; `Ok(0)` means the body is complete.
    fn read_response_body<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, NetResult<usize>>;

    /// Release the stream. `not_reusable` forces the underlying connection
    /// closed even if it could have gone back to the pool.
    fn close(&mut self, not_reusable: bool);

    /// Exchange this fully-drained stream for a fresh one on the same
    /// connection, for resending a request with credentials attached.
    fn renew_for_auth(self: Box<Self>) -> Box<dyn HttpStream>;

    /// Whether the underlying connection can serve another request.
    fn can_reuse_connection(&self) -> bool;

    /// Whether the connection had served a request before this stream.
    fn is_connection_reused(&self) -> bool;

    /// Whether the response body has been read to completion.
    fn is_response_body_complete(&self) -> bool;

    fn set_priority(&mut self, priority: RequestPriority);

    fn negotiated_protocol(&self) -> NextProto;

    /// The alternative service this stream's connection went through, if any.
    fn alternative_service_used(&self) -> Option<AlternativeService>;

    fn security_info(&self) -> Option<SecurityInfo>;

    fn remote_endpoint(&self) -> Option<SocketAddr>;

    fn total_received_bytes(&self) -> u64;

    fn total_sent_bytes(&self) -> u64;
}
