use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::RpcError;
use crate::message::{Request, Response};

pub mod local;
pub mod tcp;

pub use local::LocalNet;
pub use tcp::TcpTransport;

/// The server side of a node: handles one request at a time from the
/// transport's point of view and produces a response. Implemented by the
/// node context.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// The collaborator that carries RPCs between nodes.
///
/// Every `call` is bounded: a peer that does not answer in time surfaces as
/// `RpcError::Unreachable`, which callers treat as a departed peer rather
/// than blocking on it. A peer that answers with `Response::Offline` is
/// reported the same way.
#[async_trait]
pub trait PeerTransport: Clone + Send + Sync + 'static {
    async fn call(&self, peer: &str, request: Request) -> Result<Response, RpcError>;

    /// Begin accepting requests for `addr`, dispatching them to `handler`.
    fn listen(&self, addr: String, handler: Arc<dyn RequestHandler>) -> JoinHandle<()>;
}

/// Map an answered response onto the liveness model shared by both
/// transports.
pub(crate) fn screen_response(peer: &str, response: Response) -> Result<Response, RpcError> {
    match response {
        Response::Offline => Err(RpcError::Unreachable(peer.to_string())),
        other => Ok(other),
    }
}
