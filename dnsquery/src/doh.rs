//! One DNS-over-HTTPS exchange (RFC 8484) over HTTP/1.1.
//!
//! The exchange is split in two halves. [`Exchange`] is a synchronous state
//! machine fed with transport events: it parses the response head, frames the
//! body and settles exactly once. The driver performs the socket I/O and turns
//! it into events. Every connect, write and read step gets its own timeout, so
//! the timer is re-armed whenever a chunk arrives: a slow but progressing
//! response is never cut off, a stalled one is.

use std::future::Future;
use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_std::future;
use async_std::io::prelude::{ReadExt, WriteExt};
use async_std::io::{Read, Write};
use async_std::net::TcpStream;
use async_std::prelude::FutureExt;
use async_tls::TlsConnector;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use tracing::{debug, trace};
use url::{Host, Position, Url};

use crate::abort::{wait_aborted, AbortSignal};
use crate::codec::decode_response;
use crate::endpoint::{Endpoint, Method, Transport};
use crate::error::{Error, QueryError, Result};

const CONTENT_TYPE: &str = "application/dns-message";
const USER_AGENT: &str = concat!("dnsquery/", env!("CARGO_PKG_VERSION"));
const MAX_HEADERS: usize = 64;
const READ_BUFFER_SIZE: usize = 4096;
/// Largest DNS message; bodies beyond it are rejected.
const MAX_BODY_SIZE: usize = 65535;
/// Raw chunked bytes kept before the terminating chunk, framing included.
const MAX_CHUNKED_SIZE: usize = 4 * MAX_BODY_SIZE;

/// Head of the HTTP response a DoH resolver sent back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
pub struct DohReply {
    pub message: Message,
    pub response: HttpResponse,
}

trait Connection: Read + Write + Unpin + Send {}

impl<T: Read + Write + Unpin + Send> Connection for T {}

#[derive(Debug)]
pub(crate) enum Event {
    Data(Vec<u8>),
    End,
    Error(Error),
    Timeout,
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked,
    UntilClose,
}

pub(crate) struct Exchange {
    endpoint: Arc<Endpoint>,
    uri: String,
    method: Method,
    timeout: Duration,
    head: Option<(HttpResponse, Framing)>,
    buffer: Vec<u8>,
    settled: bool,
}

impl Exchange {
    pub(crate) fn new(
        endpoint: Arc<Endpoint>,
        uri: String,
        method: Method,
        timeout: Duration,
    ) -> Self {
        Exchange {
            endpoint,
            uri,
            method,
            timeout,
            head: None,
            buffer: Vec::new(),
            settled: false,
        }
    }

    /// Feeds one event. Returns the outcome the first time the exchange
    /// settles and `None` for every other call.
    pub(crate) fn handle(&mut self, event: Event) -> Option<Result<DohReply>> {
        if self.settled {
            trace!(?event, "ignore event for settled exchange");
            return None;
        }
        let outcome = match event {
            Event::Data(chunk) => self.on_data(&chunk)?,
            Event::End => self.on_end(),
            Event::Error(e) => Err(e),
            Event::Timeout => Err(Error::Timeout(self.timeout)),
            Event::Abort => Err(Error::Abort),
        };
        Some(self.settle(outcome))
    }

    fn settle(&mut self, outcome: Result<DohReply, Error>) -> Result<DohReply> {
        self.settled = true;
        self.buffer = Vec::new();
        let response = self.head.take().map(|(response, _)| response);
        outcome.map_err(|e| {
            QueryError::from(e)
                .with_endpoint(&self.endpoint)
                .with_response(response)
        })
    }

    fn on_data(&mut self, chunk: &[u8]) -> Option<Result<DohReply, Error>> {
        self.buffer.extend_from_slice(chunk);
        let framing = match &self.head {
            Some((_, framing)) => *framing,
            None => {
                let (response, framing, len) = match parse_head(&self.buffer) {
                    Ok(Some(head)) => head,
                    Ok(None) => return None,
                    Err(e) => return Some(Err(e)),
                };
                self.buffer.drain(..len);
                let status = response.status;
                self.head = Some((response, framing));
                if status != 200 {
                    return Some(Err(Error::HttpStatus {
                        uri: self.uri.clone(),
                        status,
                        method: self.method,
                    }));
                }
                framing
            }
        };
        match framing {
            Framing::Length(len) if self.buffer.len() >= len => {
                let mut body = mem::take(&mut self.buffer);
                body.truncate(len);
                Some(self.complete(&body))
            }
            Framing::Chunked => match dechunk(&self.buffer) {
                Ok(Some(body)) => Some(self.complete(&body)),
                Ok(None) if self.buffer.len() > MAX_CHUNKED_SIZE => {
                    Some(Err(invalid_data("chunked body too large")))
                }
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            },
            Framing::UntilClose if self.buffer.len() > MAX_BODY_SIZE => {
                Some(Err(invalid_data("response body too large")))
            }
            _ => None,
        }
    }

    fn on_end(&mut self) -> Result<DohReply, Error> {
        match self.head.as_ref().map(|(_, framing)| *framing) {
            None => Err(unexpected_eof("connection closed before response head")),
            Some(Framing::UntilClose) => {
                let body = mem::take(&mut self.buffer);
                self.complete(&body)
            }
            Some(Framing::Length(len)) => Err(unexpected_eof(format!(
                "connection closed after {} of {} body bytes",
                self.buffer.len(),
                len
            ))),
            Some(Framing::Chunked) => Err(unexpected_eof("connection closed inside chunked body")),
        }
    }

    fn complete(&mut self, body: &[u8]) -> Result<DohReply, Error> {
        let message = decode_response(body)?;
        let response = self
            .head
            .as_ref()
            .map(|(response, _)| response.clone())
            .ok_or_else(|| unexpected_eof("body without response head"))?;
        Ok(DohReply { message, response })
    }
}

fn unexpected_eof(message: impl Into<String>) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, message.into()))
}

fn invalid_data(message: impl Into<String>) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, message.into()))
}

fn parse_head(buf: &[u8]) -> Result<Option<(HttpResponse, Framing, usize)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(invalid_data(format!("invalid http response: {e}"))),
    };
    let response = HttpResponse {
        status: parsed.code.unwrap_or_default(),
        reason: parsed.reason.unwrap_or_default().to_string(),
        headers: parsed
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect(),
    };
    let chunked = response
        .header("transfer-encoding")
        .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"));
    let framing = if chunked {
        Framing::Chunked
    } else if let Some(value) = response.header("content-length") {
        let len = value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|len| *len <= MAX_BODY_SIZE)
            .ok_or_else(|| invalid_data(format!("invalid content-length: {value}")))?;
        Framing::Length(len)
    } else {
        Framing::UntilClose
    };
    Ok(Some((response, framing, len)))
}

/// Decodes a chunked body; `None` until the terminating chunk arrived.
fn dechunk(buf: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete((consumed, size))) => {
                pos += consumed;
                if size == 0 {
                    return Ok(Some(body));
                }
                let size = usize::try_from(size)
                    .ok()
                    .filter(|size| *size <= MAX_BODY_SIZE - body.len())
                    .ok_or_else(|| invalid_data("invalid chunk size"))?;
                let end = pos + size;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(invalid_data("missing CRLF after chunk"));
                }
                body.extend_from_slice(&buf[pos..end]);
                pos = end + 2;
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(invalid_data("invalid chunk size")),
        }
    }
}

/// Serializes the request. Returns the request uri and the raw bytes.
fn build_request(url: &Url, method: Method, query: &[u8]) -> (String, Vec<u8>) {
    let mut target = url.clone();
    if method == Method::Get {
        target
            .query_pairs_mut()
            .append_pair("dns", &URL_SAFE_NO_PAD.encode(query));
    }
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    let mut req_buf = vec![
        format!(
            "{method} {} HTTP/1.1",
            &target[Position::BeforePath..Position::AfterQuery]
        ),
        format!("Host: {host}"),
        format!("User-Agent: {USER_AGENT}"),
        format!("Accept: {CONTENT_TYPE}"),
        "Connection: close".to_string(),
    ];
    if method == Method::Post {
        req_buf.push(format!("Content-Type: {CONTENT_TYPE}"));
        req_buf.push(format!("Content-Length: {}", query.len()));
    }
    let mut request = req_buf.join("\r\n").into_bytes();
    request.extend_from_slice(b"\r\n\r\n");
    if method == Method::Post {
        request.extend_from_slice(query);
    }
    (target.to_string(), request)
}

struct Driver<'a> {
    url: &'a Url,
    address: Option<IpAddr>,
    request: &'a [u8],
    timeout: Duration,
    conn: Option<Box<dyn Connection>>,
    buf: Vec<u8>,
}

impl Driver<'_> {
    async fn next_event(&mut self) -> Event {
        if self.conn.is_none() {
            match self.open().await {
                Ok(conn) => self.conn = Some(conn),
                Err(event) => return event,
            }
        }
        let Some(conn) = self.conn.as_mut() else {
            return Event::End;
        };
        match future::timeout(self.timeout, conn.read(&mut self.buf)).await {
            Err(_) => Event::Timeout,
            Ok(Err(e)) => Event::Error(e.into()),
            Ok(Ok(0)) => Event::End,
            Ok(Ok(size)) => {
                trace!(size, "received doh chunk");
                Event::Data(self.buf[..size].to_vec())
            }
        }
    }

    async fn open(&self) -> Result<Box<dyn Connection>, Event> {
        let port = self.url.port_or_known_default().unwrap_or(443);
        let tcp = step(self.timeout, connect_tcp(self.url, self.address, port)).await?;
        let mut conn: Box<dyn Connection> = if self.url.scheme() == "https" {
            let domain = self
                .url
                .host_str()
                .unwrap_or_default()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let connector = TlsConnector::default();
            Box::new(step(self.timeout, connector.connect(domain, tcp)).await?)
        } else {
            Box::new(tcp)
        };
        step(self.timeout, conn.write_all(self.request)).await?;
        step(self.timeout, conn.flush()).await?;
        Ok(conn)
    }
}

async fn step<T>(timeout: Duration, fut: impl Future<Output = io::Result<T>>) -> Result<T, Event> {
    match future::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Event::Error(Error::Io(e))),
        Err(_) => Err(Event::Timeout),
    }
}

async fn connect_tcp(url: &Url, address: Option<IpAddr>, port: u16) -> io::Result<TcpStream> {
    if let Some(ip) = address {
        return TcpStream::connect(SocketAddr::new(ip, port)).await;
    }
    match url.host() {
        Some(Host::Domain(domain)) => TcpStream::connect((domain, port)).await,
        Some(Host::Ipv4(ip)) => TcpStream::connect(SocketAddr::new(ip.into(), port)).await,
        Some(Host::Ipv6(ip)) => TcpStream::connect(SocketAddr::new(ip.into(), port)).await,
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("missing host in {url}"),
        )),
    }
}

/// Sends `query` to a DoH endpoint and decodes the answer.
///
/// Fails with `Timeout` when no progress happens within `timeout`, with
/// `Abort` when `signal` fires, with `HttpStatus` for any status but 200 and
/// with `Response` for an empty or undecodable body.
pub async fn request_doh(
    endpoint: &Arc<Endpoint>,
    query: &[u8],
    timeout: Duration,
    signal: Option<&AbortSignal>,
) -> Result<DohReply> {
    let Transport::Doh {
        url,
        method,
        address,
    } = endpoint.transport()
    else {
        return Err(QueryError::from(Error::invalid_input(format!(
            "{endpoint} is not a DoH endpoint"
        )))
        .with_endpoint(endpoint));
    };
    let (uri, request) = build_request(url, *method, query);
    let mut exchange = Exchange::new(endpoint.clone(), uri, *method, timeout);
    if signal.map_or(false, AbortSignal::is_aborted) {
        return exchange
            .handle(Event::Abort)
            .unwrap_or_else(|| Err(QueryError::from(Error::Abort).with_endpoint(endpoint)));
    }
    debug!(endpoint = %endpoint, size = query.len(), "send doh request");

    let mut driver = Driver {
        url,
        address: *address,
        request: &request,
        timeout,
        conn: None,
        buf: vec![0; READ_BUFFER_SIZE],
    };
    let outcome = async {
        loop {
            let event = driver.next_event().await;
            if let Some(outcome) = exchange.handle(event) {
                return Some(outcome);
            }
        }
    }
    .race(async {
        wait_aborted(signal).await;
        None
    })
    .await;

    match outcome {
        Some(outcome) => outcome,
        None => exchange
            .handle(Event::Abort)
            .unwrap_or_else(|| Err(QueryError::from(Error::Abort).with_endpoint(endpoint))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortController;
    use async_std::net::TcpListener;
    use async_std::task;
    use hickory_proto::op::{MessageType, OpCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::net::Ipv4Addr;

    fn endpoint(url: &str) -> Arc<Endpoint> {
        Arc::new(url.parse().unwrap())
    }

    fn exchange() -> Exchange {
        Exchange::new(
            endpoint("https://dns.example/dns-query"),
            "https://dns.example/dns-query".to_string(),
            Method::Post,
            Duration::from_millis(100),
        )
    }

    fn dns_answer() -> Vec<u8> {
        let name = Name::from_ascii("example.com.").unwrap();
        let mut message = Message::new();
        message
            .set_id(0)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .add_answer(Record::from_rdata(
                name,
                300,
                RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
            ));
        message.to_vec().unwrap()
    }

    fn head(status: &str, length: Option<usize>) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {status}\r\nContent-Type: {CONTENT_TYPE}\r\n");
        if let Some(length) = length {
            head.push_str(&format!("Content-Length: {length}\r\n"));
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    #[test]
    fn test_completion_is_delivered_once() {
        let mut exchange = exchange();
        let first = exchange.handle(Event::Error(Error::Io(io::Error::other("reset"))));
        assert!(matches!(first, Some(Err(_))));
        assert!(exchange.handle(Event::End).is_none());
        assert!(exchange.handle(Event::Timeout).is_none());
        assert!(exchange.handle(Event::Data(dns_answer())).is_none());
    }

    #[test]
    fn test_head_and_body_split_across_chunks() {
        let body = dns_answer();
        let mut raw = head("200 OK", Some(body.len()));
        raw.extend_from_slice(&body);
        let mut exchange = exchange();
        let mut outcome = None;
        for chunk in raw.chunks(7) {
            assert!(outcome.is_none());
            outcome = exchange.handle(Event::Data(chunk.to_vec()));
        }
        let reply = outcome.expect("settled").expect("reply");
        assert_eq!(reply.response.status, 200);
        assert_eq!(reply.response.header("content-type"), Some(CONTENT_TYPE));
        assert_eq!(reply.message.answers().len(), 1);
    }

    #[test]
    fn test_status_error_discards_body() {
        let mut exchange = exchange();
        let mut raw = head("500 Internal Server Error", Some(3));
        raw.extend_from_slice(b"boo");
        let err = exchange
            .handle(Event::Data(raw))
            .expect("settled")
            .unwrap_err();
        match err.error() {
            Error::HttpStatus { uri, status, method } => {
                assert_eq!(uri, "https://dns.example/dns-query");
                assert_eq!(*status, 500);
                assert_eq!(*method, Method::Post);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.response().map(|r| r.status), Some(500));
        assert!(err.endpoint().is_some());
        assert!(exchange.handle(Event::End).is_none());
    }

    #[test]
    fn test_empty_body() {
        let mut exchange = exchange();
        let err = exchange
            .handle(Event::Data(head("200 OK", Some(0))))
            .expect("settled")
            .unwrap_err();
        assert_eq!(err.error().to_string(), "Empty.");
        assert!(matches!(err.error(), Error::Response { source: None, .. }));
    }

    #[test]
    fn test_invalid_body() {
        let mut exchange = exchange();
        let mut raw = head("200 OK", None);
        raw.extend_from_slice(&[1, 2, 3]);
        assert!(exchange.handle(Event::Data(raw)).is_none());
        let err = exchange.handle(Event::End).expect("settled").unwrap_err();
        assert!(matches!(
            err.error(),
            Error::Response {
                source: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_chunked_body() {
        let body = dns_answer();
        let (a, b) = body.split_at(5);
        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend_from_slice(format!("{:x}\r\n", a.len()).as_bytes());
        raw.extend_from_slice(a);
        raw.extend_from_slice(format!("\r\n{:x};ext=1\r\n", b.len()).as_bytes());
        raw.extend_from_slice(b);
        let mut exchange = exchange();
        assert!(exchange.handle(Event::Data(raw)).is_none());
        let reply = exchange
            .handle(Event::Data(b"\r\n0\r\n\r\n".to_vec()))
            .expect("settled")
            .expect("reply");
        assert_eq!(reply.message.answers().len(), 1);
    }

    #[test]
    fn test_oversized_chunk_is_rejected() {
        let mut ex = exchange();
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc";
        let err = ex
            .handle(Event::Data(raw.to_vec()))
            .expect("settled")
            .unwrap_err();
        assert!(matches!(err.error(), Error::Io(e) if e.kind() == io::ErrorKind::InvalidData));

        let mut ex = exchange();
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcXY0\r\n\r\n";
        assert!(ex.handle(Event::Data(raw.to_vec())).expect("settled").is_err());
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let mut ex = exchange();
        let err = ex
            .handle(Event::Data(head("200 OK", Some(MAX_BODY_SIZE + 1))))
            .expect("settled")
            .unwrap_err();
        assert!(matches!(err.error(), Error::Io(e) if e.kind() == io::ErrorKind::InvalidData));

        let mut ex = exchange();
        assert!(ex.handle(Event::Data(head("200 OK", None))).is_none());
        assert!(ex.handle(Event::Data(vec![0; MAX_BODY_SIZE])).is_none());
        let outcome = ex.handle(Event::Data(vec![0; 1])).expect("settled");
        assert!(outcome.is_err());
    }

    #[test]
    fn test_close_before_head() {
        let mut exchange = exchange();
        let err = exchange.handle(Event::End).expect("settled").unwrap_err();
        assert!(matches!(err.error(), Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_build_post_request() {
        let url = Url::parse("https://dns.example:8443/dns-query").unwrap();
        let (uri, request) = build_request(&url, Method::Post, b"abc");
        assert_eq!(uri, "https://dns.example:8443/dns-query");
        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with("POST /dns-query HTTP/1.1\r\n"));
        assert!(request.contains("Host: dns.example:8443\r\n"));
        assert!(request.contains("Content-Type: application/dns-message\r\n"));
        assert!(request.contains("Content-Length: 3\r\n"));
        assert!(request.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn test_build_get_request() {
        let url = Url::parse("https://dns.example/dns-query").unwrap();
        let (uri, request) = build_request(&url, Method::Get, &[0xff, 0x00]);
        assert_eq!(uri, "https://dns.example/dns-query?dns=_wA");
        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with("GET /dns-query?dns=_wA HTTP/1.1\r\n"));
        assert!(!request.contains("Content-Length"));
    }

    async fn read_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let size = stream.read(&mut chunk).await.unwrap();
            if size == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..size]);
            let mut headers = [httparse::EMPTY_HEADER; 16];
            let mut req = httparse::Request::new(&mut headers);
            if let Ok(httparse::Status::Complete(len)) = req.parse(&buf) {
                let length: usize = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .map(|h| std::str::from_utf8(h.value).unwrap().parse().unwrap())
                    .unwrap_or(0);
                if buf.len() >= len + length {
                    return;
                }
            }
        }
    }

    /// Serves one connection: writes `chunks` after their delays, then holds
    /// the connection open for `hold` before closing it.
    async fn serve(chunks: Vec<(Duration, Vec<u8>)>, hold: Duration) -> Arc<Endpoint> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        task::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            for (delay, chunk) in chunks {
                task::sleep(delay).await;
                if stream.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            task::sleep(hold).await;
        });
        endpoint(&format!("http://{addr}/dns-query"))
    }

    #[test]
    fn test_slow_progress_does_not_time_out() {
        task::block_on(async {
            let body = dns_answer();
            let mut chunks = vec![(Duration::ZERO, head("200 OK", Some(body.len())))];
            for part in body.chunks(body.len() / 4 + 1) {
                chunks.push((Duration::from_millis(80), part.to_vec()));
            }
            let endpoint = serve(chunks, Duration::ZERO).await;
            let reply = request_doh(&endpoint, b"query", Duration::from_millis(200), None)
                .await
                .unwrap();
            assert_eq!(reply.message.answers().len(), 1);
        });
    }

    #[test]
    fn test_stalled_response_times_out() {
        task::block_on(async {
            let chunks = vec![(Duration::ZERO, head("200 OK", Some(100)))];
            let endpoint = serve(chunks, Duration::from_secs(2)).await;
            let err = request_doh(&endpoint, b"query", Duration::from_millis(100), None)
                .await
                .unwrap_err();
            assert!(matches!(err.error(), Error::Timeout(d) if *d == Duration::from_millis(100)));
            assert_eq!(err.response().map(|r| r.status), Some(200));
        });
    }

    #[test]
    fn test_abort_in_flight() {
        task::block_on(async {
            let endpoint = serve(vec![], Duration::from_secs(2)).await;
            let controller = AbortController::new();
            let signal = controller.signal();
            task::spawn(async move {
                task::sleep(Duration::from_millis(50)).await;
                controller.abort();
            });
            let err = request_doh(&endpoint, b"query", Duration::from_secs(5), Some(&signal))
                .await
                .unwrap_err();
            assert!(err.is_abort());
            assert_eq!(err.endpoint(), Some(&endpoint));
        });
    }

    #[test]
    fn test_aborted_before_start() {
        task::block_on(async {
            let controller = AbortController::new();
            controller.abort();
            // nothing listens on port 9, an attempt to connect would fail differently
            let endpoint = endpoint("http://127.0.0.1:9/dns-query");
            let err = request_doh(
                &endpoint,
                b"query",
                Duration::from_secs(1),
                Some(&controller.signal()),
            )
            .await
            .unwrap_err();
            assert!(err.is_abort());
        });
    }
}
