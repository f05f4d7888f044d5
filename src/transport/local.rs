use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{screen_response, PeerTransport, RequestHandler};
use crate::error::RpcError;
use crate::message::{Request, Response};

/// An in-process transport: a shared registry mapping addresses to request
/// handlers. Lets a whole ring of simulated nodes run inside one test
/// process with no sockets involved.
#[derive(Clone, Default)]
pub struct LocalNet {
    handlers: Arc<Mutex<HashMap<String, Arc<dyn RequestHandler>>>>,
}

impl LocalNet {
    pub fn new() -> LocalNet {
        LocalNet::default()
    }

    /// Drop a node from the registry, as if its process had died.
    pub fn disconnect(&self, addr: &str) {
        self.handlers
            .lock()
            .expect("local net registry poisoned")
            .remove(addr);
    }
}

#[async_trait]
impl PeerTransport for LocalNet {
    async fn call(&self, peer: &str, request: Request) -> Result<Response, RpcError> {
        // Clone the handler out so no lock is held across the await.
        let handler = {
            let handlers = self.handlers.lock().expect("local net registry poisoned");
            handlers.get(peer).cloned()
        };
        let handler = handler.ok_or_else(|| RpcError::Unreachable(peer.to_string()))?;
        screen_response(peer, handler.handle(request).await)
    }

    fn listen(&self, addr: String, handler: Arc<dyn RequestHandler>) -> JoinHandle<()> {
        self.handlers
            .lock()
            .expect("local net registry poisoned")
            .insert(addr, handler);
        // Registration is the whole job; park a task so callers can hold
        // and abort a handle like any other listener.
        tokio::spawn(std::future::pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Ping => Response::Pong,
                _ => Response::Rejected {
                    reason: "echo only answers pings".to_string(),
                },
            }
        }
    }

    struct Departed;

    #[async_trait]
    impl RequestHandler for Departed {
        async fn handle(&self, _request: Request) -> Response {
            Response::Offline
        }
    }

    #[tokio::test]
    async fn calls_reach_registered_handlers() {
        let net = LocalNet::new();
        net.listen("a:1".to_string(), Arc::new(Echo));
        assert!(matches!(net.call("a:1", Request::Ping).await, Ok(Response::Pong)));
    }

    #[tokio::test]
    async fn unknown_peers_are_unreachable() {
        let net = LocalNet::new();
        assert!(matches!(
            net.call("nobody:0", Request::Ping).await,
            Err(RpcError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn offline_answers_surface_as_liveness_failures() {
        let net = LocalNet::new();
        net.listen("gone:1".to_string(), Arc::new(Departed));
        assert!(matches!(
            net.call("gone:1", Request::Ping).await,
            Err(RpcError::Unreachable(_))
        ));
    }
}
