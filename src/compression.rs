// Response compression
//
// gzip for buffered response bodies when the app opts in and the client
// advertises support. Streams pass through untouched; their length is
// unknown and chunked transfer already amortizes the transport cost.

use crate::http::Body;
use crate::{Request, Response};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// Bodies below this size are not worth the encoder setup.
const MIN_COMPRESS_BYTES: usize = 1024;

pub(crate) fn accepts_gzip(req: &Request) -> bool {
    req.header("accept-encoding")
        .map(|value| value.split(',').any(|enc| enc.trim().starts_with("gzip")))
        .unwrap_or(false)
}

/// Compress the response body when it is buffered, large enough, not already
/// encoded, and the client accepts gzip. Anything else passes through.
pub(crate) fn maybe_compress(req: &Request, response: Response) -> Response {
    if !accepts_gzip(req) || response.headers.contains_key("content-encoding") {
        return response;
    }
    let Body::Buffered(bytes) = &response.body else {
        return response;
    };
    if bytes.len() < MIN_COMPRESS_BYTES {
        return response;
    }
    match gzip(bytes) {
        Some(compressed) => response
            .with_header("content-encoding", "gzip")
            .with_header("vary", "accept-encoding")
            .with_body(compressed),
        None => response,
    }
}

fn gzip(bytes: &Bytes) -> Option<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes).ok()?;
    encoder.finish().ok().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn big_body() -> String {
        "the quick brown fox jumps over the lazy dog. ".repeat(100)
    }

    #[test]
    fn compresses_large_buffered_bodies() {
        let req = Request::new("GET", "/").with_header("accept-encoding", "gzip, deflate");
        let response = maybe_compress(&req, Response::text(big_body()));
        assert_eq!(response.header("content-encoding"), Some(&"gzip".to_string()));

        let compressed = response.body_bytes();
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, big_body());
    }

    #[test]
    fn skips_clients_without_gzip() {
        let req = Request::new("GET", "/");
        let response = maybe_compress(&req, Response::text(big_body()));
        assert!(response.header("content-encoding").is_none());
    }

    #[test]
    fn skips_small_bodies() {
        let req = Request::new("GET", "/").with_header("accept-encoding", "gzip");
        let response = maybe_compress(&req, Response::text("tiny"));
        assert!(response.header("content-encoding").is_none());
    }

    #[test]
    fn skips_already_encoded_bodies() {
        let req = Request::new("GET", "/").with_header("accept-encoding", "gzip");
        let response = Response::text(big_body()).with_header("content-encoding", "br");
        let response = maybe_compress(&req, response);
        assert_eq!(response.header("content-encoding"), Some(&"br".to_string()));
    }
}
