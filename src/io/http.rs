use bytes::Bytes;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT_ENCODING, CONTENT_RANGE, ETAG, RANGE};
use reqwest::{Method, StatusCode};
use std::fmt::Write as _;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{
    ByteRange, MultipartSink, ObjectHandle, PartDescriptor, RangeResponse, RangeSource,
    TransportResult,
};
use crate::error::{Error, Result, TransportError};

/// Smallest non-final part accepted by S3-compatible stores (5 MiB)
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Connection settings for an [`HttpStore`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL, e.g. `https://example.com` or `http://localhost:9000`
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Whole-request timeout; `None` lets long bodies stream indefinitely
    pub request_timeout: Option<Duration>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Extra headers sent with every request
    pub headers: Vec<(String, String)>,
}

impl HttpConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: None,
            user: None,
            password: None,
            headers: Vec::new(),
        }
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// HTTP store speaking plain range GETs and the S3 multipart REST dialect
pub struct HttpStore {
    client: Client,
    config: HttpConfig,
    transferred_bytes: Arc<AtomicU64>,
}

impl HttpStore {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            transferred_bytes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Get total body bytes received from the network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn object_url(&self, handle: &ObjectHandle) -> String {
        format!(
            "{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            handle.path().trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        // Ask for the bytes as stored; transparent compression would break offsets.
        let mut req = self
            .client
            .request(method, url)
            .header(ACCEPT_ENCODING, "identity");
        for (name, value) in &self.config.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(user) = &self.config.user {
            req = req.basic_auth(user, self.config.password.as_ref());
        }
        req
    }

    fn send(&self, req: RequestBuilder, key: &str) -> TransportResult<Response> {
        let resp = req.send().map_err(classify_reqwest)?;
        check_status(&resp, key)?;
        Ok(resp)
    }
}

fn classify_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_builder() || e.is_redirect() {
        TransportError::fatal(e.to_string())
    } else {
        // Timeouts, refused/reset connections and broken bodies.
        TransportError::transient(e.to_string())
    }
}

fn check_status(resp: &Response, key: &str) -> TransportResult<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND => Err(TransportError::NotFound { key: key.into() }),
        StatusCode::RANGE_NOT_SATISFIABLE => Err(TransportError::OutOfRange {
            actual_size: header_str(resp, CONTENT_RANGE.as_str())
                .and_then(parse_content_range)
                .and_then(|range| range.total),
        }),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Err(
            TransportError::transient(format!("{key}: status {status}")),
        ),
        s if s.is_server_error() => Err(TransportError::transient(format!("{key}: status {s}"))),
        s => Err(TransportError::fatal(format!("{key}: status {s}"))),
    }
}

fn header_str<'a>(resp: &'a Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Parsed `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First and last byte, inclusive; `None` for `bytes */N`
    pub span: Option<(u64, u64)>,
    /// Total size; `None` for `bytes A-B/*`
    pub total: Option<u64>,
}

/// Parse `bytes A-B/N`, `bytes A-B/*` and `bytes */N`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;

    let total = match total.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    let span = match span.trim() {
        "*" => None,
        s => {
            let (first, last) = s.split_once('-')?;
            Some((first.trim().parse().ok()?, last.trim().parse().ok()?))
        }
    };
    Some(ContentRange { span, total })
}

/// Text between `<tag>` and `</tag>`, first occurrence.
fn xml_tag<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

fn complete_request_body(parts: &[PartDescriptor]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for part in parts {
        let _ = write!(
            xml,
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number, part.etag
        );
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// S3 may answer 200 and still report an error in the body.
fn check_error_body(body: &str, key: &str) -> TransportResult<()> {
    if !body.contains("<Error>") {
        return Ok(());
    }
    let code = xml_tag(body, "Code").unwrap_or("unknown");
    let message = format!("{key}: {code}");
    match code {
        "InternalError" | "SlowDown" | "ServiceUnavailable" => {
            Err(TransportError::transient(message))
        }
        _ => Err(TransportError::fatal(message)),
    }
}

/// Response body that counts the bytes pulled through it.
struct CountingBody {
    inner: Response,
    counter: Arc<AtomicU64>,
}

impl Read for CountingBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl RangeSource for HttpStore {
    fn get_range(&self, handle: &ObjectHandle, range: ByteRange) -> TransportResult<RangeResponse> {
        let url = self.object_url(handle);
        let mut req = self.request(Method::GET, &url);
        if let Some(header) = range.header() {
            req = req.header(RANGE, header);
        }
        debug!("GET {} {}", url, range);

        let resp = self.send(req, &url)?;
        let (start, total_size) = if resp.status() == StatusCode::PARTIAL_CONTENT {
            let content_range = header_str(&resp, CONTENT_RANGE.as_str())
                .and_then(parse_content_range)
                .ok_or_else(|| TransportError::fatal(format!("{url}: missing Content-Range")))?;
            let start = content_range.span.map(|(first, _)| first).unwrap_or(0);
            (start, content_range.total)
        } else {
            // The server ignored the range and sent the whole object.
            (0, resp.content_length())
        };

        Ok(RangeResponse {
            start,
            total_size,
            body: Box::new(CountingBody {
                inner: resp,
                counter: Arc::clone(&self.transferred_bytes),
            }),
        })
    }
}

impl MultipartSink for HttpStore {
    fn min_part_size(&self) -> usize {
        S3_MIN_PART_SIZE
    }

    fn initiate(&self, handle: &ObjectHandle) -> TransportResult<String> {
        let url = self.object_url(handle);
        let resp = self.send(self.request(Method::POST, &format!("{url}?uploads")), &url)?;
        let body = resp.text().map_err(classify_reqwest)?;
        check_error_body(&body, &url)?;
        xml_tag(&body, "UploadId")
            .map(str::to_string)
            .ok_or_else(|| TransportError::fatal(format!("{url}: no UploadId in response")))
    }

    fn upload_part(
        &self,
        handle: &ObjectHandle,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> TransportResult<String> {
        let url = self.object_url(handle);
        let req = self
            .request(Method::PUT, &url)
            .query(&[("partNumber", part_number.to_string().as_str()), ("uploadId", upload_id)])
            .body(data);
        let resp = self.send(req, &url)?;
        header_str(&resp, ETAG.as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::fatal(format!("{url}: part #{part_number} has no ETag")))
    }

    fn complete(
        &self,
        handle: &ObjectHandle,
        upload_id: &str,
        parts: &[PartDescriptor],
    ) -> TransportResult<()> {
        let url = self.object_url(handle);
        let req = self
            .request(Method::POST, &url)
            .query(&[("uploadId", upload_id)])
            .body(complete_request_body(parts));
        let resp = self.send(req, &url)?;
        let body = resp.text().map_err(classify_reqwest)?;
        check_error_body(&body, &url)
    }

    fn abort(&self, handle: &ObjectHandle, upload_id: &str) -> TransportResult<()> {
        let url = self.object_url(handle);
        let req = self
            .request(Method::DELETE, &url)
            .query(&[("uploadId", upload_id)]);
        self.send(req, &url).map(|_| ())
    }

    fn put(&self, handle: &ObjectHandle, data: Bytes) -> TransportResult<()> {
        let url = self.object_url(handle);
        let req = self.request(Method::PUT, &url).body(data);
        self.send(req, &url).map(|_| ())
    }
}
