//! Minimal HTTP/1.1 JSON listener
//!
//! Serves one request per connection: the request path selects the route,
//! the body is JSON, and the reply is always an [`Envelope`]. Handlers run
//! on the blocking pool.

use crate::error::{FleetError, Result};
use crate::protocol::{Envelope, RouteHandler};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// JSON route server
pub struct HttpServer {
    listener: TcpListener,
    handler: Arc<dyn RouteHandler>,
}

impl HttpServer {
    /// Bind to `addr`, e.g. `0.0.0.0:7878` or `127.0.0.1:0`
    pub async fn bind(addr: &str, handler: Arc<dyn RouteHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            error!("Error handling connection from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }

    /// Run the accept loop on its own task
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}

/// POST a JSON body to `url` and unwrap the envelope of the reply
pub async fn post_json(client: &reqwest::Client, url: &str, body: &Value) -> Result<Value> {
    let response = client.post(url).json(body).send().await?;
    let status = response.status();
    let envelope: Envelope = response.json().await.map_err(|e| {
        FleetError::Transport(format!("unreadable reply from {} ({}): {}", url, status, e))
    })?;
    envelope.into_result()
}

async fn handle_connection(stream: TcpStream, handler: Arc<dyn RouteHandler>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    debug!("Received request: {}", request_line.trim());

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return send_response(&mut write_half, 400, "Bad Request", &Envelope::error("malformed request line")).await;
    }
    let path = parts[1].split('?').next().unwrap_or("/").to_string();

    let mut content_length = 0usize;
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).await? == 0 || header_line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = header_line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if content_length > MAX_BODY_BYTES {
        return send_response(&mut write_half, 413, "Payload Too Large", &Envelope::error("request body too large")).await;
    }

    let mut buf = vec![0u8; content_length];
    reader.read_exact(&mut buf).await?;
    let body = if buf.iter().all(|b| b.is_ascii_whitespace()) {
        Value::Null
    } else {
        match serde_json::from_slice(&buf) {
            Ok(body) => body,
            Err(e) => {
                let reply = Envelope::error(format!("invalid JSON body: {}", e));
                return send_response(&mut write_half, 400, "Bad Request", &reply).await;
            }
        }
    };

    let route = path.clone();
    let result = tokio::task::spawn_blocking(move || handler.handle(&route, body))
        .await
        .map_err(|e| FleetError::Internal(format!("handler for {} panicked: {}", path, e)))
        .and_then(|r| r);
    if let Err(e) = &result {
        debug!("Request to {} failed: {}", path, e);
    }
    send_response(&mut write_half, 200, "OK", &Envelope::from_result(result)).await
}

async fn send_response<W>(stream: &mut W, code: u16, reason: &str, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_string(envelope)?;
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        code,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl RouteHandler for Echo {
        fn handle(&self, route: &str, body: Value) -> Result<Value> {
            match route {
                "/echo" => Ok(json!({ "route": route, "body": body })),
                _ => Err(FleetError::Transport(format!("unknown route {}", route))),
            }
        }
    }

    async fn start() -> SocketAddr {
        let server = HttpServer::bind("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        let addr = server.local_addr().unwrap();
        server.spawn();
        addr
    }

    #[tokio::test]
    async fn test_round_trip_through_reqwest() {
        let addr = start().await;
        let envelope: Envelope = reqwest::Client::new()
            .post(format!("http://{}/echo", addr))
            .json(&json!({"x": 1}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(envelope.code, Envelope::SUCCESS);
        assert_eq!(envelope.data, json!({"route": "/echo", "body": {"x": 1}}));
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let addr = start().await;
        let envelope: Envelope = reqwest::Client::new()
            .post(format!("http://{}/missing", addr))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(envelope.code, Envelope::FAILURE);
        assert!(envelope.message.contains("unknown route /missing"));
    }

    #[tokio::test]
    async fn test_post_json_unwraps_envelope() {
        let addr = start().await;
        let client = reqwest::Client::new();
        let data = post_json(&client, &format!("http://{}/echo", addr), &json!([1, 2]))
            .await
            .unwrap();
        assert_eq!(data["body"], json!([1, 2]));

        let err = post_json(&client, &format!("http://{}/nope", addr), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Transport(_)));
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected() {
        let addr = start().await;
        let response = reqwest::Client::new()
            .post(format!("http://{}/echo", addr))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
    }
}
