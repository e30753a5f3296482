use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::common::ServerId;
use crate::error::{GfsError, Result};
use crate::msg::{MessageKind, Request, Response};

/// Anything that answers requests: the master or a chunkserver.
pub trait Node: Send + Sync {
    fn id(&self) -> &ServerId;

    fn handle(self: Arc<Self>, req: Request) -> BoxFuture<'static, Response>;
}

/// Request/response delivery between nodes.
pub trait Transport: Send + Sync {
    fn call(&self, to: &ServerId, req: Request) -> BoxFuture<'static, Result<Response>>;
}

/// Issue `req` and give up after `timeout`.
pub async fn call_timeout(
    transport: &dyn Transport,
    to: &ServerId,
    req: Request,
    timeout: Duration,
) -> Result<Response> {
    match tokio::time::timeout(timeout, transport.call(to, req)).await {
        Ok(res) => res,
        Err(_) => Err(GfsError::Timeout { peer: to.clone() }),
    }
}

/// In-process network connecting nodes by id.
///
/// Used by the demo and the test suite. Nodes can be taken down or made to
/// fail one message kind to exercise partial failures.
#[derive(Default)]
pub struct NetworkShim {
    nodes: RwLock<HashMap<ServerId, Arc<dyn Node>>>,
    down: RwLock<HashSet<ServerId>>,
    failing: RwLock<HashSet<(ServerId, MessageKind)>>,
}

impl NetworkShim {
    pub fn new() -> NetworkShim {
        NetworkShim::default()
    }

    pub fn add_node(&self, node: Arc<dyn Node>) {
        let id = node.id().clone();
        self.nodes.write().unwrap_or_else(|e| e.into_inner()).insert(id, node);
    }

    pub fn get_node(&self, id: &ServerId) -> Option<Arc<dyn Node>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    /// Make every call to `id` fail as if the host were unreachable.
    pub fn take_down(&self, id: &ServerId) {
        self.down.write().unwrap_or_else(|e| e.into_inner()).insert(id.clone());
    }

    /// Make calls of one kind to `id` fail.
    pub fn fail_kind(&self, id: &ServerId, kind: MessageKind) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((id.clone(), kind));
    }

    /// Undo `take_down` and `fail_kind` for `id`.
    pub fn heal(&self, id: &ServerId) {
        self.down.write().unwrap_or_else(|e| e.into_inner()).remove(id);
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(server, _)| server != id);
    }

    fn unreachable(&self, id: &ServerId, kind: MessageKind) -> bool {
        self.down.read().unwrap_or_else(|e| e.into_inner()).contains(id)
            || self
                .failing
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&(id.clone(), kind))
    }
}

impl Transport for NetworkShim {
    fn call(&self, to: &ServerId, req: Request) -> BoxFuture<'static, Result<Response>> {
        let peer = to.clone();
        if self.unreachable(to, req.kind()) {
            return futures::future::ready(Err(GfsError::Transport {
                peer,
                reason: "unreachable".to_string(),
            }))
            .boxed();
        }

        let node = self.get_node(to);
        async move {
            match node {
                Some(node) => Ok(node.handle(req).await),
                None => Err(GfsError::Transport { peer, reason: "unknown node".to_string() }),
            }
        }
        .boxed()
    }
}
