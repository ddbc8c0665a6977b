use crate::errors::*;
use crate::RequestHead;

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Accumulates the bytes of a single request read off a socket.
///
/// The head is parsed once it is complete. After that, the reader waits
/// until `Content-Length` bytes of body have arrived before handing the
/// head back, and `read_buf[headers_length..]` is the body.
pub struct HttpStreamReader {
    pub read_buf: Vec<u8>,
    pub headers_length: usize,
    content_length: usize,
    head: Option<RequestHead>,
}
impl HttpStreamReader {
    pub fn new() -> Self {
        Self {
            read_buf: Vec::with_capacity(1024),
            headers_length: 0,
            content_length: 0,
            head: None,
        }
    }

    pub fn receive_chunk(&mut self, chunk: &[u8]) -> usize {
        self.read_buf.extend_from_slice(chunk);
        self.read_buf.len()
    }

    /// Returns `Ok(None)` until the head and the full body are buffered.
    /// Bytes past the declared body length are dropped.
    pub fn try_build_request(&mut self) -> Result<Option<RequestHead>> {
        if self.head.is_none() {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut req = httparse::Request::new(&mut headers);
                match req.parse(&self.read_buf)? {
                    httparse::Status::Partial => None,
                    httparse::Status::Complete(head_len) => {
                        Some((build_head(&req)?, head_len, content_length(&req)?))
                    }
                }
            };
            match parsed {
                Some((head, head_len, content_length)) => {
                    self.head = Some(head);
                    self.headers_length = head_len;
                    self.content_length = content_length;
                }
                None if self.read_buf.len() > MAX_HEAD_BYTES => {
                    bail!(ErrorKind::RequestHeadTooLarge(self.read_buf.len()))
                }
                None => return Ok(None),
            }
        }

        let body_end = self.headers_length + self.content_length;
        if self.read_buf.len() < body_end {
            return Ok(None);
        }
        self.read_buf.truncate(body_end);
        Ok(self.head.take())
    }
}

fn build_head(req: &httparse::Request) -> Result<RequestHead> {
    let version = match req.version {
        Some(0) => http::Version::HTTP_10,
        _ => http::Version::HTTP_11,
    };
    let mut builder = http::Request::builder()
        .method(req.method.unwrap_or("GET"))
        .uri(req.path.unwrap_or("/"))
        .version(version);
    for h in req.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    Ok(builder.body(())?)
}

/// A missing header means an empty body.
fn content_length(req: &httparse::Request) -> Result<usize> {
    let header = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"));
    match header {
        None => Ok(0),
        Some(h) => {
            let value = String::from_utf8_lossy(h.value);
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| ErrorKind::InvalidContentLength(value.to_string()).into())
        }
    }
}
