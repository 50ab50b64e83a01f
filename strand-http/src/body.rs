use bytes::Bytes;

use strand_net::NetResult;

#[derive(Debug, Clone)]
enum Source {
    /// Payload with a known length, sent with a `Content-Length` header.
    Buffer(Bytes),
    /// Payload of unknown total length, sent with chunked encoding.
    Chunked(Vec<Bytes>),
}

#[derive(Debug, Clone)]
/// An upload body attached to a request.
///
/// The engine never reads the payload itself; it only derives the framing
/// headers and hands the body to the stream. Buffered sources rewind for
/// free, which is what makes transparent resends possible.
pub struct UploadBody {
    source: Source,
}

impl UploadBody {
    /// A body with known length.
    #[must_use]
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            source: Source::Buffer(data.into()),
        }
    }

    /// A body that will be sent with chunked transfer encoding.
    #[must_use]
    pub fn chunked(chunks: Vec<Bytes>) -> Self {
        Self {
            source: Source::Chunked(chunks),
        }
    }

    /// Prepare the body for (re)sending.
    ///
    /// This is a suspension point for deferred sources; buffered bodies
    /// complete immediately.
    pub async fn init(&mut self) -> NetResult<()> {
        Ok(())
    }

    /// Rewind after a transparent resend. Buffered sources have nothing to
    /// do; a deferred source would seek back to its start here.
    pub fn reset(&mut self) {}

    /// `Some(len)` for sized bodies, `None` when chunked encoding applies.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        match &self.source {
            Source::Buffer(data) => Some(data.len() as u64),
            Source::Chunked(_) => None,
        }
    }

    #[must_use]
    pub fn is_chunked(&self) -> bool {
        matches!(self.source, Source::Chunked(_))
    }

    /// The full payload, for stream implementations that send it out.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        match &self.source {
            Source::Buffer(data) => data.clone(),
            Source::Chunked(chunks) => {
                let mut all = Vec::new();
                for chunk in chunks {
                    all.extend_from_slice(chunk);
                }
                Bytes::from(all)
            }
        }
    }
}
