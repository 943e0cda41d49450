//! Path-prefixed gateway proxy.
//!
//! Forwards `<base_path>/*` HTTP requests to a configured upstream,
//! preserving method, body, and headers (Host overridden), with a 30 s
//! overall timeout. Failures resolve quietly with a fixed
//! `502 Bad Gateway` text body; upstream error detail never leaks.
//!
//! WebSocket upgrades under the prefix are spliced at the socket level:
//! the client's request head is replayed to the upstream, and on a
//! `101 Switching Protocols` both sockets are copied in each direction.
//! Any non-upgrade upstream response is written to the client before the
//! connection is destroyed.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// A response ready to be written back to the client socket.
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProxiedResponse {
    fn bad_gateway() -> Self {
        Self {
            status: 502,
            headers: vec![("content-type".into(), "text/plain".into())],
            body: b"Bad Gateway".to_vec(),
        }
    }
}

/// Forward a plain HTTP request. Never fails; errors become a 502.
pub async fn forward_http(
    config: &ProxyConfig,
    http: &reqwest::Client,
    method: &str,
    path_and_query: &str,
    headers: &HashMap<String, String>,
    body: Vec<u8>,
) -> ProxiedResponse {
    let url = format!(
        "http://{}:{}{}",
        config.upstream_host, config.upstream_port, path_and_query
    );
    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return ProxiedResponse::bad_gateway(),
    };

    let mut req = http.request(method, &url).timeout(PROXY_TIMEOUT);
    for (name, value) in headers {
        // Host is overridden to the upstream; hop-by-hop headers dropped.
        if matches!(
            name.as_str(),
            "host" | "connection" | "content-length" | "transfer-encoding"
        ) {
            continue;
        }
        req = req.header(name, value);
    }
    req = req.header("host", format!("{}:{}", config.upstream_host, config.upstream_port));
    if !body.is_empty() {
        req = req.body(body);
    }

    match req.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .filter(|(name, _)| {
                    !matches!(name.as_str(), "connection" | "transfer-encoding")
                })
                .filter_map(|(name, value)| {
                    Some((name.to_string(), value.to_str().ok()?.to_string()))
                })
                .collect();
            let body = match resp.bytes().await {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => {
                    warn!(error = %e, "proxy body read failed");
                    return ProxiedResponse::bad_gateway();
                }
            };
            ProxiedResponse {
                status,
                headers,
                body,
            }
        }
        Err(e) => {
            warn!(error = %e, %url, "proxy request failed");
            ProxiedResponse::bad_gateway()
        }
    }
}

/// Splice a WebSocket upgrade through to the upstream.
///
/// `request_head` is the client's raw request head (through the blank
/// line), already consumed from `client`. It is replayed verbatim to the
/// upstream apart from the Host header.
pub async fn splice_ws_upgrade(
    config: &ProxyConfig,
    mut client: TcpStream,
    request_head: &[u8],
) -> Result<()> {
    let upstream_addr = format!("{}:{}", config.upstream_host, config.upstream_port);
    let mut upstream = tokio::time::timeout(PROXY_TIMEOUT, TcpStream::connect(&upstream_addr))
        .await
        .map_err(|_| Error::RequestTimeout)?
        .map_err(Error::from)?;

    let head = rewrite_host(request_head, &upstream_addr);
    upstream.write_all(&head).await?;

    // Read the upstream response head.
    let mut response_head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    let deadline = tokio::time::Instant::now() + PROXY_TIMEOUT;
    while !response_head.ends_with(b"\r\n\r\n") {
        if response_head.len() > 16 * 1024 {
            return Err(Error::other("oversized upstream response head"));
        }
        let read = tokio::time::timeout_at(deadline, upstream.read(&mut byte))
            .await
            .map_err(|_| Error::RequestTimeout)??;
        if read == 0 {
            break;
        }
        response_head.push(byte[0]);
    }

    client.write_all(&response_head).await?;

    let status = parse_status_line(&response_head);
    if status != Some(101) {
        // Not an upgrade: the upstream response has been relayed; done.
        debug!(?status, "upstream refused websocket upgrade");
        return Ok(());
    }

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream)
        .await
        .unwrap_or((0, 0));
    debug!(sent, received, "websocket splice finished");
    Ok(())
}

fn rewrite_host(head: &[u8], upstream_addr: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(head);
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive("\r\n") {
        if line.to_lowercase().starts_with("host:") {
            out.push_str(&format!("Host: {}\r\n", upstream_addr));
        } else {
            out.push_str(line);
        }
    }
    out.into_bytes()
}

fn parse_status_line(head: &[u8]) -> Option<u16> {
    let text = String::from_utf8_lossy(head);
    let line = text.lines().next()?;
    line.split_whitespace().nth(1)?.parse().ok()
}
