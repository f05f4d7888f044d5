use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{error::Category, Deserializer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use super::{screen_response, PeerTransport, RequestHandler};
use crate::error::RpcError;
use crate::message::{Request, Response};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Carries RPCs as newline-free JSON values over short-lived TCP
/// connections: one connect, one request, one response per call, the whole
/// exchange bounded by a timeout.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    rpc_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(rpc_timeout: Duration) -> TcpTransport {
        TcpTransport { rpc_timeout }
    }

    async fn exchange(peer: &str, request: &Request) -> std::io::Result<Response> {
        let stream = TcpStream::connect(peer).await?;
        let mut stream = JsonStream::new(stream);
        stream.write(request).await?;
        stream.read().await
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new()
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn call(&self, peer: &str, request: Request) -> Result<Response, RpcError> {
        let exchange = Self::exchange(peer, &request);
        match timeout(self.rpc_timeout, exchange).await {
            Ok(Ok(response)) => screen_response(peer, response),
            Ok(Err(e)) => {
                warn!(peer, error = %e, "rpc transport error");
                Err(RpcError::Unreachable(peer.to_string()))
            }
            Err(_) => {
                warn!(peer, "rpc timed out");
                Err(RpcError::Unreachable(peer.to_string()))
            }
        }
    }

    fn listen(&self, addr: String, handler: Arc<dyn RequestHandler>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(%addr, error = %e, "failed to bind listener");
                    return;
                }
            };
            info!(%addr, "listening");
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, handler).await;
                        });
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "accept failed");
                    }
                }
            }
        })
    }
}

/// Answer requests on one connection until the peer hangs up.
async fn serve_connection(stream: TcpStream, handler: Arc<dyn RequestHandler>) {
    let mut stream = JsonStream::new(stream);
    loop {
        let request: Request = match stream.read().await {
            Ok(request) => request,
            Err(_) => break,
        };
        let response = handler.handle(request).await;
        if stream.write(&response).await.is_err() {
            break;
        }
    }
}

/// A TCP stream carrying a sequence of JSON values, reassembled from the
/// byte stream with a streaming deserializer: partial values stay buffered
/// until the rest arrives.
struct JsonStream {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl JsonStream {
    fn new(stream: TcpStream) -> JsonStream {
        JsonStream {
            stream,
            buffer: Vec::new(),
        }
    }

    async fn read<M: DeserializeOwned>(&mut self) -> std::io::Result<M> {
        loop {
            // Attempt to deserialize the buffered bytes first.
            let mut deserializer = Deserializer::from_slice(self.buffer.as_slice()).into_iter();
            if let Some(result) = (&mut deserializer).next() {
                match result {
                    Ok(msg) => {
                        self.buffer = self.buffer[deserializer.byte_offset()..].to_vec();
                        return Ok(msg);
                    }
                    Err(ref e) if e.classify() == Category::Eof => {
                        // Incomplete value; more bytes may arrive.
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable frame");
                        return Err(std::io::Error::new(ErrorKind::InvalidData, e));
                    }
                }
            }

            // Need more bytes.
            let mut tmp_buf = vec![0; 1024];
            match self.stream.read(&mut tmp_buf).await {
                Ok(0) => return Err(std::io::Error::from(ErrorKind::UnexpectedEof)),
                Ok(len) => self.buffer.extend_from_slice(&tmp_buf[..len]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn write<M: serde::Serialize>(&mut self, msg: &M) -> std::io::Result<()> {
        let raw = serde_json::to_vec(msg)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        self.stream.write_all(&raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pinger;

    #[async_trait]
    impl RequestHandler for Pinger {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Ping => Response::Pong,
                _ => Response::Rejected {
                    reason: "unsupported".to_string(),
                },
            }
        }
    }

    #[tokio::test]
    async fn ping_over_loopback() {
        // An OS-assigned port keeps parallel test runs from colliding.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        tokio::spawn(async move {
            let handler: Arc<dyn RequestHandler> = Arc::new(Pinger);
            while let Ok((stream, _)) = listener.accept().await {
                serve_connection(stream, handler.clone()).await;
            }
        });

        let transport = TcpTransport::new();
        let response = transport.call(&addr, Request::Ping).await.unwrap();
        assert!(matches!(response, Response::Pong));
    }

    #[tokio::test]
    async fn unreachable_address_fails_fast() {
        let transport = TcpTransport::with_timeout(Duration::from_millis(300));
        let result = transport.call("127.0.0.1:1", Request::Ping).await;
        assert!(matches!(result, Err(RpcError::Unreachable(_))));
    }
}
