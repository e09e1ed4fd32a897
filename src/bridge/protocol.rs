//! Framing used on a script's standard streams
//!
//! Request (written to stdin, which is closed afterwards):
//!
//! ```text
//! <headersLen> <queryLen> <bodyLen>\n<headers JSON><query JSON><body>
//! ```
//!
//! Response (somewhere on stdout, after any amount of unrelated output):
//!
//! ```text
//! LZY-:<status> <headersLen> <bodyLen>\n<headers JSON><body>
//! ```

use crate::error::{BridgeError, MalformedResponse, TruncatedFrame};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use warp::http::header::{HeaderName, HeaderValue};
use warp::http::StatusCode;
use warp::hyper::Body;

/// Prefix of the one stdout line that announces the response.
pub const MARKER_PREFIX: &[u8] = b"LZY-:";

/// Longest stdout line inspected; the rest of a longer line is skipped.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Frames larger than this are grown while reading instead of reserved up front.
const FRAME_PREALLOC: usize = 64 * 1024;

pub const PATH_HEADER: &str = "x-path";
pub const METHOD_HEADER: &str = "x-method";

/// An HTTP request as handed to a script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeRequest {
    /// Lowercased header names
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Bytes,
}

impl BridgeRequest {
    pub fn new(
        headers: HashMap<String, String>,
        query: HashMap<String, String>,
        body: Bytes,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        Self {
            headers,
            query,
            body,
        }
    }

    /// Add the sub-path and method headers every script receives.
    pub fn with_route(mut self, sub_path: &str, method: &str) -> Self {
        self.headers
            .insert(PATH_HEADER.to_string(), sub_path.to_string());
        self.headers
            .insert(METHOD_HEADER.to_string(), method.to_string());
        self
    }
}

/// A request serialized for a script's stdin
#[derive(Debug)]
pub struct EncodedRequest<'a> {
    headers: Vec<u8>,
    query: Vec<u8>,
    body: &'a [u8],
}

impl<'a> EncodedRequest<'a> {
    pub fn new(request: &'a BridgeRequest) -> Result<Self, BridgeError> {
        let headers = serde_json::to_vec(&request.headers)
            .map_err(|_| BridgeError::EncodeFailed { what: "headers" })?;
        let query = serde_json::to_vec(&request.query)
            .map_err(|_| BridgeError::EncodeFailed { what: "query" })?;

        Ok(Self {
            headers,
            query,
            body: &request.body,
        })
    }

    /// The `<headersLen> <queryLen> <bodyLen>\n` line.
    pub fn length_line(&self) -> String {
        format!(
            "{} {} {}\n",
            self.headers.len(),
            self.query.len(),
            self.body.len()
        )
    }

    /// Write the full request. Closing the stream is left to the caller.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.length_line().as_bytes()).await?;
        writer.write_all(&self.headers).await?;
        writer.write_all(&self.query).await?;
        writer.write_all(self.body).await?;
        writer.flush().await
    }
}

/// A complete response read from a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl ResponseFrame {
    pub fn into_response(self) -> warp::reply::Response {
        let mut response = warp::reply::Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            // Validated while decoding
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        response
    }
}

/// Values announced on the marker line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub status: StatusCode,
    pub headers_len: usize,
    pub body_len: usize,
}

impl Marker {
    /// Parse the text following [`MARKER_PREFIX`].
    ///
    /// Fields are separated by single spaces; anything after the third is
    /// ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, MalformedResponse> {
        let payload = String::from_utf8_lossy(payload);
        let fields: Vec<&str> = payload.split(' ').collect();
        if fields.len() < 3 {
            return Err(MalformedResponse::MissingFields);
        }

        let status = parse_integer(fields[0], "status code")?;
        let status = u16::try_from(status)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or(MalformedResponse::StatusOutOfRange)?;

        let headers_len = parse_length(fields[1], "headers size")?;
        let body_len = parse_length(fields[2], "body size")?;

        Ok(Self {
            status,
            headers_len,
            body_len,
        })
    }
}

fn parse_integer(text: &str, field: &'static str) -> Result<i64, MalformedResponse> {
    text.parse::<i64>()
        .map_err(|_| MalformedResponse::NotAnInteger(field))
}

fn parse_length(text: &str, field: &'static str) -> Result<usize, MalformedResponse> {
    let value = parse_integer(text, field)?;
    if value < 0 {
        return Err(MalformedResponse::Negative(field));
    }
    usize::try_from(value).map_err(|_| MalformedResponse::NotAnInteger(field))
}

/// Scan `reader` for the marker line and read the frames that follow it.
///
/// Lines before the marker are passed to `on_output` and then forgotten.
/// Returns `Ok(None)` when the stream ends without a marker. Nothing past
/// the response body is read, and nothing past the marker line is read
/// when the marker is malformed.
pub async fn read_response<R, F>(
    reader: &mut R,
    mut on_output: F,
) -> Result<Option<ResponseFrame>, BridgeError>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut line = Vec::new();

    loop {
        match read_line_capped(reader, &mut line).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read script stdout");
                return Ok(None);
            }
        }

        if let Some(payload) = line.strip_prefix(MARKER_PREFIX) {
            let marker = Marker::parse(payload)?;
            return read_frames(reader, marker).await.map(Some);
        }

        on_output(&line);
    }
}

async fn read_frames<R: AsyncRead + Unpin>(
    reader: &mut R,
    marker: Marker,
) -> Result<ResponseFrame, BridgeError> {
    let raw_headers = read_frame(reader, marker.headers_len)
        .await
        .ok_or(TruncatedFrame::Headers)?;

    let headers: HashMap<String, String> =
        serde_json::from_slice(&raw_headers).map_err(|_| MalformedResponse::HeadersNotJson)?;

    let valid = headers.iter().all(|(name, value)| {
        HeaderName::from_bytes(name.as_bytes()).is_ok() && HeaderValue::from_str(value).is_ok()
    });
    if !valid {
        return Err(MalformedResponse::InvalidHeader.into());
    }

    let body = read_frame(reader, marker.body_len)
        .await
        .ok_or(TruncatedFrame::Body)?;

    Ok(ResponseFrame {
        status: marker.status,
        headers,
        body: Bytes::from(body),
    })
}

/// Read exactly `len` bytes, or `None` if the stream ends or fails first.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(FRAME_PREALLOC));
    let read = (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut buf)
        .await;

    match read {
        Ok(n) if n == len => Some(buf),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read response frame");
            None
        }
    }
}

/// Read one `\n`-terminated line into `line`, without the terminator and
/// any trailing `\r`. Bytes past [`MAX_LINE_BYTES`] are consumed but not
/// kept. Returns `false` at end of stream.
pub async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
) -> io::Result<bool> {
    line.clear();
    let mut read_any = false;

    loop {
        let (used, complete) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(read_any);
            }
            read_any = true;

            let (chunk, used, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (&available[..pos], pos + 1, true),
                None => (available, available.len(), false),
            };

            let room = MAX_LINE_BYTES.saturating_sub(line.len());
            line.extend_from_slice(&chunk[..chunk.len().min(room)]);
            (used, complete)
        };
        reader.consume(used);

        if complete {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(true);
        }
    }
}
