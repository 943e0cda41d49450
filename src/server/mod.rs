//! Webhook / HTTP server.
//!
//! One TCP listener carries the whole edge: provider webhook POSTs, media
//! WebSocket upgrades (routed into the bridge), auxiliary hook endpoints
//! behind a rate limiter, and an optional path-prefixed proxy to an
//! upstream gateway. Requests are routed by peeking the request head, so
//! WebSocket upgrades reach tungstenite with the socket intact.
//!
//! Error bodies at this edge are fixed strings; provider-internal detail
//! never leaks through a 5xx.

pub mod proxy;
pub mod rate_limit;

use crate::bridge::MediaBridge;
use crate::config::{Config, ProxyConfig};
use crate::error::{Error, Result};
use crate::manager::CallManager;
use crate::providers::{constant_time_eq, ProviderAdapter, WebhookContext};
use rate_limit::{HookRateLimiter, RateVerdict};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request head size cap; larger heads are refused.
const MAX_HEAD_BYTES: usize = 16 * 1024;
/// Body size cap; larger bodies get a 413.
const MAX_BODY_BYTES: usize = 1024 * 1024;
/// Slow clients get this long to deliver head and body.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

struct ParsedHead {
    method: String,
    path_and_query: String,
    headers: HashMap<String, String>,
    head_len: usize,
}

impl ParsedHead {
    fn path(&self) -> &str {
        self.path_and_query
            .split('?')
            .next()
            .unwrap_or(&self.path_and_query)
    }

    fn is_ws_upgrade(&self) -> bool {
        self.headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    fn content_length(&self) -> usize {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

pub struct WebhookServer {
    config: Config,
    manager: Arc<CallManager>,
    bridge: Arc<MediaBridge>,
    adapter: Arc<dyn ProviderAdapter>,
    limiter: HookRateLimiter,
    http: reqwest::Client,
    public_url: RwLock<String>,
}

impl WebhookServer {
    pub fn new(
        config: Config,
        manager: Arc<CallManager>,
        bridge: Arc<MediaBridge>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            bridge,
            adapter,
            limiter: HookRateLimiter::new(),
            http: reqwest::Client::new(),
            public_url: RwLock::new(String::new()),
        })
    }

    pub fn set_public_url(&self, url: &str) {
        *self.public_url.write().unwrap() = url.trim_end_matches('/').to_string();
    }

    /// Bind and serve until cancelled. Returns the bound address through
    /// the listener it is handed, so tests can bind port 0.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "webhook server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("webhook server shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    debug!(peer = %peer, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let head = peek_head(&stream).await?;

        if head.is_ws_upgrade() {
            if head.path() == self.config.streaming.stream_path {
                // The head was only peeked; tungstenite re-reads it whole.
                return self.bridge.clone().handle_upgrade(stream).await;
            }
            if let Some(proxy_config) = self.proxy_for(head.path()) {
                // Consume the head so it can be replayed upstream.
                let mut consumed = vec![0u8; head.head_len];
                stream.read_exact(&mut consumed).await?;
                return proxy::splice_ws_upgrade(&proxy_config, stream, &consumed).await;
            }
            let mut consumed = vec![0u8; head.head_len];
            stream.read_exact(&mut consumed).await?;
            write_response(&mut stream, 404, &[], b"Not Found").await?;
            return Ok(());
        }

        // Plain HTTP: consume the head, then the body.
        let mut consumed = vec![0u8; head.head_len];
        stream.read_exact(&mut consumed).await?;
        let body = match read_body(&mut stream, head.content_length()).await {
            Ok(body) => body,
            Err(e @ (Error::PayloadTooLarge | Error::RequestTimeout)) => {
                let status = e.http_status();
                write_response(&mut stream, status, &[], reason_phrase(status).as_bytes()).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let path = head.path().to_string();
        if head.method == "POST" && path == self.config.serve.path {
            self.handle_webhook(&mut stream, &head, body).await
        } else if path.starts_with("/hooks/") || path == "/hooks" {
            self.handle_hook(&mut stream, &head, peer).await
        } else if let Some(proxy_config) = self.proxy_for(&path) {
            let resp = proxy::forward_http(
                &proxy_config,
                &self.http,
                &head.method,
                &head.path_and_query,
                &head.headers,
                body,
            )
            .await;
            let headers: Vec<(&str, &str)> = resp
                .headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            write_response(&mut stream, resp.status, &headers, &resp.body).await
        } else {
            write_response(&mut stream, 404, &[], b"Not Found").await
        }
    }

    fn proxy_for(&self, path: &str) -> Option<ProxyConfig> {
        let proxy = self.config.proxy.as_ref()?;
        if path == proxy.base_path || path.starts_with(&format!("{}/", proxy.base_path)) {
            Some(proxy.clone())
        } else {
            None
        }
    }

    async fn handle_webhook(
        &self,
        stream: &mut TcpStream,
        head: &ParsedHead,
        body: Vec<u8>,
    ) -> Result<()> {
        let public = self.public_url.read().unwrap().clone();
        let ctx = WebhookContext {
            method: head.method.clone(),
            url: format!("{}{}", public, head.path_and_query),
            headers: head.headers.clone(),
            raw_body: body,
        };

        let verdict = self.adapter.verify_webhook(&ctx);
        if !verdict.ok {
            // No state mutation on unauthorized webhooks.
            warn!(reason = ?verdict.reason, "webhook rejected");
            return write_response(stream, 401, &[], b"Unauthorized").await;
        }

        let parsed = match self.adapter.parse_webhook_event(&ctx) {
            Ok(parsed) => parsed,
            Err(e) => {
                let status = e.http_status();
                debug!(error = %e, "webhook parse failed");
                return write_response(stream, status, &[], reason_phrase(status).as_bytes())
                    .await;
            }
        };

        // Events are dispatched sequentially, in arrival order.
        for event in &parsed.events {
            self.manager.apply_event(event);
        }

        match parsed.body {
            Some((content_type, payload)) => {
                write_response(
                    stream,
                    parsed.status_code,
                    &[("content-type", content_type.as_str())],
                    payload.as_bytes(),
                )
                .await
            }
            None => write_response(stream, parsed.status_code, &[], b"").await,
        }
    }

    async fn handle_hook(
        &self,
        stream: &mut TcpStream,
        head: &ParsedHead,
        peer: SocketAddr,
    ) -> Result<()> {
        let key = peer.ip().to_string();
        let expected = self.config.serve.hook_token.as_deref().unwrap_or_default();
        let supplied = head
            .headers
            .get("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default();

        // A valid token always works and clears the caller's counter;
        // only failed attempts count toward the throttle.
        if !expected.is_empty() && constant_time_eq(supplied, expected) {
            self.limiter.record_success(&key);
            return write_response(
                stream,
                200,
                &[("content-type", "application/json")],
                b"{\"ok\":true}",
            )
            .await;
        }

        if let RateVerdict::Throttled { retry_after_secs } = self.limiter.check(&key) {
            let retry = retry_after_secs.to_string();
            return write_response(
                stream,
                429,
                &[("retry-after", retry.as_str())],
                b"Too Many Requests",
            )
            .await;
        }
        self.limiter.record_failure(&key);
        write_response(stream, 401, &[], b"Unauthorized").await
    }
}

/// Peek the request head without consuming it. Bounded in size and time.
async fn peek_head(stream: &TcpStream) -> Result<ParsedHead> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
    let mut last_len = 0;
    let head_len = loop {
        let n = tokio::time::timeout_at(deadline, stream.peek(&mut buf))
            .await
            .map_err(|_| Error::RequestTimeout)??;
        if let Some(pos) = find_subslice(&buf[..n], b"\r\n\r\n") {
            break pos + 4;
        }
        if n >= buf.len() {
            return Err(Error::PayloadTooLarge);
        }
        if n == last_len {
            // No new bytes yet; yield briefly instead of spinning.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        last_len = n;
    };

    let text = String::from_utf8_lossy(&buf[..head_len]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path_and_query = parts.next().unwrap_or("/").to_string();
    if method.is_empty() {
        return Err(Error::BadPayload("empty request line".into()));
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    Ok(ParsedHead {
        method,
        path_and_query,
        headers,
        head_len,
    })
}

async fn read_body(stream: &mut TcpStream, content_length: usize) -> Result<Vec<u8>> {
    if content_length == 0 {
        return Ok(Vec::new());
    }
    if content_length > MAX_BODY_BYTES {
        return Err(Error::PayloadTooLarge);
    }
    let mut body = vec![0u8; content_length];
    tokio::time::timeout(READ_TIMEOUT, stream.read_exact(&mut body))
        .await
        .map_err(|_| Error::RequestTimeout)??;
    Ok(body)
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let mut response = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str(&format!("content-length: {}\r\n", body.len()));
    response.push_str("connection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(body).await?;
    let _ = stream.flush().await;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        502 => "Bad Gateway",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subslice_finder() {
        assert_eq!(find_subslice(b"abc\r\n\r\ndef", b"\r\n\r\n"), Some(3));
        assert_eq!(find_subslice(b"abc", b"\r\n\r\n"), None);
    }

    #[test]
    fn reason_phrases_are_fixed() {
        assert_eq!(reason_phrase(502), "Bad Gateway");
        assert_eq!(reason_phrase(500), "Internal Server Error");
    }
}
