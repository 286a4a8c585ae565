//! HTTP/1.1 boundary for the opening handshake
//!
//! Reads one request head off a raw stream, turns it into a
//! [`HandshakeRequest`] and writes the plain-text refusals or the 101
//! response. Bytes read past the head are handed back so the session can
//! decode them as frames.

use crate::protocol::handshake::{response_head_bytes, supported_version_header};
use crate::protocol::{HandshakeError, HandshakeRequest};
use anyhow::{anyhow, Context};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 128;

/// Parsed upgrade request plus any bytes that arrived after its head
#[derive(Debug)]
pub struct RawHandshake {
    pub request: HandshakeRequest,
    pub version: u8,
    pub leftover: Vec<u8>,
}

/// Read and parse one HTTP/1.1 request head
pub async fn read_handshake_request<S>(stream: &mut S) -> anyhow::Result<RawHandshake>
where
    S: AsyncRead + Unpin,
{
    let (raw_head, leftover) = read_message_head(stream).await?;
    let (request, version) = parse_request_head(&raw_head)?;
    Ok(RawHandshake {
        request,
        version,
        leftover,
    })
}

fn parse_request_head(raw_head: &[u8]) -> anyhow::Result<(HandshakeRequest, u8)> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(raw_head)?;
    if status.is_partial() {
        return Err(anyhow!("partial HTTP request"));
    }

    let method_str = req.method.unwrap_or("GET");
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid HTTP method {method_str:?}"))?;
    let path = req.path.unwrap_or("/").to_string();
    let version = req.version.unwrap_or(1);
    let headers = headers_from_httparse(req.headers)?;

    Ok((HandshakeRequest::new(method, path, headers), version))
}

async fn read_message_head<S>(stream: &mut S) -> anyhow::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(2048);
    let mut temp = [0u8; 4096];

    loop {
        let bytes_read = stream.read(&mut temp).await?;
        if bytes_read == 0 {
            break;
        }
        buffer.extend_from_slice(&temp[..bytes_read]);

        if let Some(pos) = find_header_end(&buffer) {
            let remaining = buffer.split_off(pos);
            return Ok((buffer, remaining));
        }

        if buffer.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("HTTP headers exceed allowed size"));
        }
    }

    Err(anyhow!("connection closed before headers completed"))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn headers_from_httparse(headers: &[httparse::Header]) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for h in headers {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .with_context(|| format!("invalid header name {:?}", h.name))?;
        let value = HeaderValue::from_bytes(h.value)
            .with_context(|| format!("invalid value for header {}", h.name))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Plain-text response followed by connection close
pub async fn respond_with_status<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    respond_with_headers(stream, code, message, &[], body).await
}

async fn respond_with_headers<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", code, message);
    for (name, value) in extra_headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    let response = format!(
        "{}Content-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        head,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Refuse an upgrade with 400. A version mismatch also advertises the
/// version this server speaks.
pub async fn reject_handshake<W>(stream: &mut W, err: &HandshakeError) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match err {
        HandshakeError::InvalidVersion(_) => {
            let version = supported_version_header();
            let version = version.to_str().unwrap_or("13");
            respond_with_headers(
                stream,
                400,
                "Bad Request",
                &[("Sec-WebSocket-Version", version)],
                &err.to_string(),
            )
            .await
        }
        _ => respond_with_status(stream, 400, "Bad Request", &err.to_string()).await,
    }
}

/// Write the 101 Switching Protocols head
pub async fn write_switching_protocols<W>(stream: &mut W, response: &Response<()>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&response_head_bytes(response)).await?;
    stream.flush().await?;
    Ok(())
}
