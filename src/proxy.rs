//! Gateway server and reverse-proxy handler
//!
//! One task per inbound connection; requests dispatch through the route
//! table to the static, page, health, or upstream handlers. Forwarded
//! requests stream their bodies through without buffering. WebSocket
//! upgrades switch the connection to a raw byte relay once the upstream
//! accepts the handshake.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{json_error_response, text_response, GatewayErrorCode, UpstreamError};
use crate::handlers::{health_response, index_response};
use crate::router::{Route, RouteTable};
use crate::static_files;

type GatewayResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Phases of a single proxied exchange. The relay phase is distinct from
/// the request/response phase: once `Upgraded` is reached the connection is
/// a raw byte pipe and no further HTTP framing happens on it.
#[derive(Debug, Clone, Copy)]
enum ProxyPhase {
    Forwarding,
    Upgraded,
    ResponseStreamed,
    Failed,
}

/// Shared, read-only state for all request handlers.
struct GatewayState {
    config: Arc<Config>,
    routes: RouteTable,
    client: Client<HttpConnector, Incoming>,
}

/// The gateway HTTP server.
pub struct GatewayServer {
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(config: Arc<Config>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let routes = RouteTable::from_config(&config);

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .build(connector);

        Self {
            state: Arc::new(GatewayState {
                config,
                routes,
                client,
            }),
            shutdown_rx,
        }
    }

    /// Accept connections on the given listener until shutdown is signalled.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Dispatch one request through the route table and attach CORS headers to
/// whatever comes back, error responses included.
async fn handle_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
) -> Result<GatewayResponse, hyper::Error> {
    debug!(addr = %client_addr, method = %req.method(), uri = %req.uri(), "Incoming request");

    // CORS preflight is answered locally, before routing
    if req.method() == Method::OPTIONS
        && req.headers().contains_key("access-control-request-method")
    {
        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
            .expect("valid response builder");
        apply_cors(&mut response);
        return Ok(response);
    }

    let path = req.uri().path().to_string();
    let mut response = match state.routes.match_request(req.method(), &path) {
        Some(Route::Asset(rest)) => {
            static_files::serve(Path::new(&state.config.content.static_dir), rest).await
        }
        Some(Route::Index) => index_response(Path::new(&state.config.content.index_page)).await,
        Some(Route::Health) => health_response(),
        Some(Route::Upstream(rest)) => {
            let rest = rest.to_string();
            if is_upgrade_request(&req) {
                handle_upgrade(req, &state.config, &rest).await
            } else {
                forward_request(req, &state, &rest).await
            }
        }
        None => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    apply_cors(&mut response);
    Ok(response)
}

/// Permissive cross-origin headers, attached to every response.
fn apply_cors(response: &mut GatewayResponse) {
    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET,HEAD,PUT,PATCH,POST,DELETE"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("*"),
    );
}

/// The path the upstream sees: prefix stripped, query preserved, never empty.
fn upstream_path_and_query(rest: &str, query: Option<&str>) -> String {
    let path = if rest.is_empty() { "/" } else { rest };
    match query {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

/// Forward a plain HTTP request to the upstream, streaming the response
/// body back without buffering.
async fn forward_request(
    req: Request<Incoming>,
    state: &GatewayState,
    rest: &str,
) -> GatewayResponse {
    let upstream = &state.config.upstream;
    let path_and_query = upstream_path_and_query(rest, req.uri().query());
    let uri = format!("http://{}{}", upstream.authority(), path_and_query);

    debug!(phase = ?ProxyPhase::Forwarding, uri = %uri, method = %req.method(), "Forwarding to upstream");

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);

    // Forward headers unchanged, except Host which takes the upstream's
    // authority (change-origin semantics)
    for (key, value) in parts.headers.iter() {
        if key != hyper::header::HOST {
            builder = builder.header(key, value);
        }
    }
    builder = builder.header(hyper::header::HOST, upstream.authority());

    let outbound = match builder.body(body) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Failed to build upstream request");
            return json_error_response(GatewayErrorCode::InternalError, "Invalid proxied request");
        }
    };

    match state.client.request(outbound).await {
        Ok(response) => {
            debug!(phase = ?ProxyPhase::ResponseStreamed, status = %response.status(), "Upstream responded");
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, body.boxed())
        }
        Err(e) => {
            let err = UpstreamError::Request(e);
            warn!(phase = ?ProxyPhase::Failed, upstream = %upstream.authority(), error = %err, "Upstream request failed");
            json_error_response(
                GatewayErrorCode::UpstreamUnreachable,
                format!("Failed to reach upstream at {}", upstream.authority()),
            )
        }
    }
}

/// Check if a request is asking for a protocol upgrade
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Build the raw HTTP upgrade request sent to the upstream. The Host,
/// Connection, and Upgrade headers are written explicitly; everything else
/// is copied through.
fn build_upgrade_request(req: &Request<Incoming>, authority: &str, path_and_query: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST
            || name == hyper::header::CONNECTION
            || name == hyper::header::UPGRADE
        {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("websocket");

    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("Connection: upgrade\r\n");
    request.push_str(&format!("Upgrade: {}\r\n", upgrade_type));
    request.push_str("\r\n");

    request.into_bytes()
}

/// A parsed upstream response head plus any bytes that arrived after it.
struct UpgradeResponseHead {
    status: StatusCode,
    headers: Vec<(String, String)>,
    /// Bytes read past the header terminator; they belong to the relayed
    /// stream and must reach the client before the byte pipe starts
    remainder: Vec<u8>,
}

/// Parse the upstream's HTTP/1.1 response head from raw bytes.
fn parse_upgrade_response(data: &[u8]) -> Option<UpgradeResponseHead> {
    let header_end = data.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&data[..header_end]).ok()?;
    let mut lines = head.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status_code: u16 = parts.next()?.parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some(UpgradeResponseHead {
        status,
        headers,
        remainder: data[header_end..].to_vec(),
    })
}

/// Read the upstream's upgrade response head, tolerating heads that arrive
/// split across several reads.
async fn read_upgrade_response(stream: &mut TcpStream) -> Result<UpgradeResponseHead, UpstreamError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(UpstreamError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return parse_upgrade_response(&buf).ok_or(UpstreamError::BadUpgradeResponse);
        }
        if buf.len() > 64 * 1024 {
            return Err(UpstreamError::BadUpgradeResponse);
        }
    }
}

/// Finish reading a declined-upgrade response body. `body` starts with the
/// bytes that arrived alongside the head; the rest is read until the
/// declared Content-Length is satisfied, or until EOF when none is given
/// (read-until-close framing).
async fn read_rejection_body(
    stream: &mut TcpStream,
    mut body: Vec<u8>,
    content_length: Option<usize>,
) -> Result<Vec<u8>, UpstreamError> {
    let mut chunk = [0u8; 4096];

    match content_length {
        Some(len) => {
            while body.len() < len {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(UpstreamError::ConnectionClosed);
                }
                body.extend_from_slice(&chunk[..n]);
            }
            body.truncate(len);
        }
        None => loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        },
    }

    Ok(body)
}

/// Relay bytes bidirectionally between the upgraded client connection and
/// the upstream socket until either side closes or errors. `early_bytes`
/// are upstream bytes that arrived in the same read as the 101 head; they
/// reach the client before the pipe starts so ordering is preserved.
async fn relay_bidirectional(client: Upgraded, upstream: TcpStream, early_bytes: Vec<u8>) {
    let mut client_io = TokioIo::new(client);
    let mut upstream_io = upstream;

    if !early_bytes.is_empty() {
        if let Err(e) = client_io.write_all(&early_bytes).await {
            debug!(error = %e, "Failed to flush early relay bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                client_to_upstream,
                upstream_to_client,
                "Relay closed normally"
            );
        }
        Err(e) => {
            debug!(error = %e, "Relay closed with error");
        }
    }
}

/// Handle a protocol upgrade request: hand-shake with the upstream over raw
/// TCP, pass its response through, and on 101 switch both connections into
/// a byte relay.
async fn handle_upgrade(req: Request<Incoming>, config: &Config, rest: &str) -> GatewayResponse {
    let upstream = &config.upstream;
    let authority = upstream.authority();
    let path_and_query = upstream_path_and_query(rest, req.uri().query());

    debug!(phase = ?ProxyPhase::Forwarding, upstream = %authority, path = %path_and_query, "Forwarding upgrade request");

    let raw_request = build_upgrade_request(&req, &authority, &path_and_query);

    let mut upstream_stream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(phase = ?ProxyPhase::Failed, upstream = %authority, error = %e, "Failed to connect to upstream for upgrade");
            return json_error_response(
                GatewayErrorCode::UpstreamUnreachable,
                format!("Failed to reach upstream at {}", authority),
            );
        }
    };

    if let Err(e) = upstream_stream.write_all(&raw_request).await {
        warn!(phase = ?ProxyPhase::Failed, upstream = %authority, error = %e, "Failed to send upgrade request");
        return json_error_response(
            GatewayErrorCode::UpstreamUnreachable,
            format!("Failed to reach upstream at {}", authority),
        );
    }

    let head = match read_upgrade_response(&mut upstream_stream).await {
        Ok(head) => head,
        Err(e) => {
            warn!(phase = ?ProxyPhase::Failed, upstream = %authority, error = %e, "Failed to read upgrade response");
            return json_error_response(
                GatewayErrorCode::UpgradeFailed,
                "Invalid upgrade response from upstream",
            );
        }
    };

    // Upstream declined the upgrade: its actual response goes back to the
    // client unchanged rather than a synthetic error. The body may trail
    // the head by several reads, so drain it per its framing first.
    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(phase = ?ProxyPhase::ResponseStreamed, status = %head.status, "Upstream declined upgrade");

        let content_length = head
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok());

        let body = match read_rejection_body(&mut upstream_stream, head.remainder, content_length)
            .await
        {
            Ok(body) => body,
            Err(e) => {
                warn!(phase = ?ProxyPhase::Failed, upstream = %authority, error = %e, "Failed to read rejection body");
                return json_error_response(
                    GatewayErrorCode::UpgradeFailed,
                    "Invalid upgrade response from upstream",
                );
            }
        };

        let mut builder = Response::builder().status(head.status);
        for (name, value) in &head.headers {
            // Without a Content-Length the body was read to EOF and hyper
            // re-frames it, so the upstream's transfer framing must not
            // leak through
            if content_length.is_none() && name.eq_ignore_ascii_case("transfer-encoding") {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), hv);
            }
        }
        return builder
            .body(
                http_body_util::Full::new(Bytes::from(body))
                    .map_err(|e| match e {})
                    .boxed(),
            )
            .unwrap_or_else(|_| {
                json_error_response(
                    GatewayErrorCode::UpgradeFailed,
                    "Invalid upgrade response from upstream",
                )
            });
    }

    info!(phase = ?ProxyPhase::Upgraded, upstream = %authority, path = %path_and_query, "Upgrade accepted");

    // 101 back to the client, minus framing headers hyper manages itself
    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &head.headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), hv);
        }
    }

    let response = match builder.body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed()) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Failed to build 101 response");
            return json_error_response(
                GatewayErrorCode::UpgradeFailed,
                "Invalid upgrade response from upstream",
            );
        }
    };

    let early_bytes = head.remainder;
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                relay_bidirectional(upgraded, upstream_stream, early_bytes).await;
            }
            Err(e) => {
                debug!(error = %e, "Client upgrade failed");
            }
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_path_and_query() {
        assert_eq!(upstream_path_and_query("", None), "/");
        assert_eq!(upstream_path_and_query("/foo", None), "/foo");
        assert_eq!(upstream_path_and_query("/foo", Some("x=1")), "/foo?x=1");
        assert_eq!(upstream_path_and_query("", Some("a=b")), "/?a=b");
    }

    #[test]
    fn test_parse_upgrade_response_accepts_101() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Accept: abc123\r\n\
                    \r\n";
        let head = parse_upgrade_response(raw).unwrap();
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(head
            .headers
            .iter()
            .any(|(n, v)| n == "Sec-WebSocket-Accept" && v == "abc123"));
        assert!(head.remainder.is_empty());
    }

    #[test]
    fn test_parse_upgrade_response_keeps_remainder() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\r\nearly";
        let head = parse_upgrade_response(raw).unwrap();
        assert_eq!(head.remainder, b"early");
    }

    #[test]
    fn test_parse_upgrade_response_non_101() {
        let raw = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
        let head = parse_upgrade_response(raw).unwrap();
        assert_eq!(head.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_upgrade_response_incomplete_head() {
        assert!(parse_upgrade_response(b"HTTP/1.1 101").is_none());
        assert!(parse_upgrade_response(b"garbage\r\n\r\n").is_none());
    }
}
