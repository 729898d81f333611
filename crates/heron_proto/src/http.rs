//! Just enough HTTP/1.1 to carry the protocol: request/response heads,
//! fixed-length bodies, and close-delimited streams. Connections are
//! one-request-one-connection; both sides send `Connection: close`.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// A parsed request or response head.
#[derive(Debug, Clone)]
pub struct Head {
    /// Request method, empty for responses.
    pub method: String,
    /// Request path, empty for responses.
    pub path: String,
    /// Response status, 0 for requests.
    pub status: u16,
    headers: Vec<(String, String)>,
}

impl Head {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

async fn read_head_lines<R>(r: &mut R) -> io::Result<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = r.read_line(&mut line).await?;
        if n == 0 {
            // EOF before a complete head: clean close only if nothing arrived.
            if lines.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated head"));
        }
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if line.is_empty() {
            return Ok(Some(lines));
        }
        lines.push(line.to_string());
    }
}

fn parse_headers(lines: &[String]) -> Vec<(String, String)> {
    lines
        .iter()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Read a request head; `None` on a connection closed before any bytes.
pub async fn read_request_head<R>(r: &mut R) -> io::Result<Option<Head>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(lines) = read_head_lines(r).await? else { return Ok(None) };
    let mut parts = lines[0].split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or("/").to_string();
    if method.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request line"));
    }
    Ok(Some(Head { method, path, status: 0, headers: parse_headers(&lines[1..]) }))
}

/// Read a response head.
pub async fn read_response_head<R>(r: &mut R) -> io::Result<Head>
where
    R: AsyncBufRead + Unpin,
{
    let Some(lines) = read_head_lines(r).await? else {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no response"));
    };
    let status = lines[0]
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status line"))?;
    Ok(Head {
        method: String::new(),
        path: String::new(),
        status,
        headers: parse_headers(&lines[1..]),
    })
}

/// Read exactly `len` body bytes.
pub async fn read_body<R>(r: &mut R, len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Format a response head. `body_len` of `None` means a close-delimited
/// stream follows.
pub fn response_head(status: u16, body_len: Option<usize>) -> String {
    let mut head = format!("HTTP/1.1 {} {}\r\nConnection: close\r\n", status, status_reason(status));
    if let Some(len) = body_len {
        head.push_str(&format!("Content-Length: {len}\r\n"));
        head.push_str("Content-Type: application/octet-stream\r\n");
    }
    head.push_str("\r\n");
    head
}

/// Format a request head.
pub fn request_head(
    method: &str,
    path: &str,
    host: &str,
    auth: Option<&str>,
    body_len: usize,
) -> String {
    let mut head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nContent-Length: {body_len}\r\n"
    );
    if let Some(key) = auth {
        head.push_str(&format!("Authorization: {key}\r\n"));
    }
    head.push_str("\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_a_request_head() {
        let raw = b"POST /tx/begin/shiny HTTP/1.1\r\nHost: x\r\nAuthorization: k3y\r\nContent-Length: 5\r\n\r\nhello";
        let mut r = BufReader::new(&raw[..]);
        let head = read_request_head(&mut r).await.unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/tx/begin/shiny");
        assert_eq!(head.header("authorization"), Some("k3y"));
        assert_eq!(head.content_length(), Some(5));
        let body = read_body(&mut r, 5).await.unwrap();
        assert_eq!(&body, b"hello");
    }

    #[tokio::test]
    async fn parses_a_response_head() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let mut r = BufReader::new(&raw[..]);
        let head = read_response_head(&mut r).await.unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.content_length(), Some(0));
    }

    #[tokio::test]
    async fn eof_before_any_bytes_is_none() {
        let raw: &[u8] = b"";
        let mut r = BufReader::new(raw);
        assert!(read_request_head(&mut r).await.unwrap().is_none());
    }

    #[test]
    fn heads_carry_connection_close() {
        assert!(response_head(200, Some(2)).contains("Connection: close"));
        assert!(request_head("GET", "/stats", "h", None, 0).contains("Connection: close"));
    }
}
