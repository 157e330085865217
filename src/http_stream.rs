use std;
use http;
use httparse;

use {Request, RequestHead};
use errors::*;


/// Cap on the size of a request head (request line + headers + terminator)
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Cap on the size of a request body
const MAX_BODY_BYTES: usize = 1024 * 1024;


/// Incremental reader that accumulates raw bytes off a stream and
/// produces a request once the head and body have fully arrived
pub(crate) struct RequestReader {
    buf: Vec<u8>,
    /// bytes already scanned for the head terminator
    scanned: usize,
    /// length of the head section including the blank line, 0 until found
    head_len: usize,
    head: Option<RequestHead>,
    content_length: usize,
}

impl RequestReader {
    pub fn new() -> RequestReader {
        RequestReader {
            buf: Vec::with_capacity(1024),
            scanned: 0,
            head_len: 0,
            head: None,
            content_length: 0,
        }
    }

    /// Append a chunk received off the wire, returning the total buffered
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        self.buf.extend_from_slice(chunk);
        self.buf.len()
    }

    /// Try assembling a complete request from what has arrived so far.
    /// `Ok(None)` means more bytes are needed.
    pub fn try_request(&mut self) -> Result<Option<Request>> {
        if self.head.is_none() {
            if !self.find_head_end()? {
                return Ok(None);
            }
            self.parse_head()?;
        }
        let body_read = self.buf.len() - self.head_len;
        if body_read > self.content_length {
            bail!(ErrorKind::RequestBodyTooLarge(format!(
                "body exceeds stated content-length of {}", self.content_length)));
        }
        if body_read < self.content_length {
            return Ok(None);
        }
        let (parts, _) = match self.head.take() {
            Some(head) => head.into_parts(),
            None => return Ok(None),
        };
        let body = self.buf[self.head_len..].to_vec();
        Ok(Some(Request::from_parts(parts, body)))
    }

    /// Look for the `\r\n\r\n` terminating the head section, resuming
    /// from wherever the previous scan left off
    fn find_head_end(&mut self) -> Result<bool> {
        let start = self.scanned.saturating_sub(3);
        if let Some(pos) = self.buf[start..].windows(4).position(|w| w == b"\r\n\r\n") {
            self.head_len = start + pos + 4;
            return Ok(true);
        }
        self.scanned = self.buf.len();
        if self.buf.len() > MAX_HEAD_BYTES {
            bail!(ErrorKind::RequestHeadersTooLarge(format!(
                "no end of headers within {} bytes", MAX_HEAD_BYTES)));
        }
        Ok(false)
    }

    fn parse_head(&mut self) -> Result<()> {
        let head = {
            let head_bytes = &self.buf[..self.head_len];
            // one httparse slot per crlf covers the request line and trailer
            let lines = head_bytes.windows(2).filter(|w| *w == b"\r\n").count();
            let mut slots = vec![httparse::EMPTY_HEADER; lines];
            let mut parsed = httparse::Request::new(&mut slots);
            let status = match parsed.parse(head_bytes) {
                Ok(status) => status,
                Err(e) => {
                    bail!(ErrorKind::MalformedHttpRequest(format!(
                        "{:?}: {:?}", e, std::str::from_utf8(head_bytes))));
                }
            };
            if status.is_partial() {
                bail!(ErrorKind::IncompleteHttpRequest(
                    "head terminator found but parse came up partial".into()));
            }
            debug_assert_eq!(status.unwrap(), self.head_len);

            let mut builder = http::Request::builder();
            match (parsed.method, parsed.path) {
                (Some(method), Some(path)) => {
                    builder.method(method);
                    builder.uri(path);
                }
                _ => bail!(ErrorKind::MalformedHttpRequest("missing method or uri".into())),
            }
            for header in parsed.headers.iter() {
                builder.header(header.name, header.value);
            }
            builder.body(())?
        };
        self.content_length = match head.headers().get(http::header::CONTENT_LENGTH) {
            Some(value) => value.to_str().ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| ErrorKind::MalformedHttpRequest("unreadable content-length".into()))?,
            None => 0,
        };
        if self.content_length > MAX_BODY_BYTES {
            bail!(ErrorKind::RequestBodyTooLarge(format!(
                "content-length {} over limit", self.content_length)));
        }
        self.head = Some(head);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_from_single_chunk() {
        let mut reader = RequestReader::new();
        reader.push(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let request = reader.try_request().unwrap().expect("complete request");
        assert_eq!(request.method().as_str(), "GET");
        assert_eq!(request.uri().path(), "/hello");
        assert!(request.body().is_empty());
    }

    #[test]
    fn accumulates_across_chunks() {
        let bytes: &[u8] = b"POST /data HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = RequestReader::new();
        let mut request = None;
        for chunk in bytes.chunks(9) {
            assert!(request.is_none(), "request complete before all bytes arrived");
            reader.push(chunk);
            request = reader.try_request().unwrap();
        }
        let request = request.expect("complete after the final chunk");
        assert_eq!(request.method().as_str(), "POST");
        assert_eq!(&request.body()[..], &b"hello"[..]);
    }

    #[test]
    fn content_length_header_is_case_insensitive() {
        let mut reader = RequestReader::new();
        reader.push(b"POST / HTTP/1.1\r\ncontent-length: 2\r\n\r\nok");
        let request = reader.try_request().unwrap().expect("complete request");
        assert_eq!(&request.body()[..], &b"ok"[..]);
    }

    #[test]
    fn rejects_oversized_head() {
        let mut reader = RequestReader::new();
        reader.push(b"GET / HTTP/1.1\r\n");
        let filler = vec![b'a'; MAX_HEAD_BYTES + 1];
        reader.push(&filler);
        let err = reader.try_request().unwrap_err();
        match *err.kind() {
            ErrorKind::RequestHeadersTooLarge(_) => (),
            ref kind => panic!("unexpected error: {:?}", kind),
        }
    }

    #[test]
    fn rejects_body_longer_than_content_length() {
        let mut reader = RequestReader::new();
        reader.push(b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcd");
        let err = reader.try_request().unwrap_err();
        match *err.kind() {
            ErrorKind::RequestBodyTooLarge(_) => (),
            ref kind => panic!("unexpected error: {:?}", kind),
        }
    }

    #[test]
    fn rejects_malformed_request_line() {
        let mut reader = RequestReader::new();
        reader.push(b"NOT AN HTTP REQUEST\r\n\r\n");
        let err = reader.try_request().unwrap_err();
        match *err.kind() {
            ErrorKind::MalformedHttpRequest(_) => (),
            ref kind => panic!("unexpected error: {:?}", kind),
        }
    }
}
