//! Length-prefixed JSON framing over TCP.
//!
//! A frame is a 4-byte big-endian length followed by one serde_json document.
//! Each peer gets one persistent connection. Requests are tagged with an id
//! and may be in flight together; a reader task routes every reply to the
//! call waiting for its id and drops replies nobody waits for any more. When
//! the connection breaks, every waiting call fails and the next call dials
//! again.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::common::ServerId;
use crate::error::{GfsError, Result};
use crate::msg::{Request, Response};
use crate::network::{Node, Transport};

/// Frames above this size are rejected as corrupt.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    id: u64,
    body: T,
}

pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(&bytes).await?;
    w.flush().await
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_frame<R, T>(r: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match r.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write every queued frame in order. Frames are written whole even if the
/// call that queued one has given up, so the stream never tears.
async fn write_loop<T: Serialize>(mut w: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<Envelope<T>>) {
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = write_frame(&mut w, &frame).await {
            tracing::debug!(error = %e, "write failed, closing connection");
            return;
        }
    }
}

/// Calls waiting for a reply, by request id. `None` once the connection is
/// closed; dropping the senders fails every waiting call.
type Pending = Arc<StdMutex<Option<HashMap<u64, oneshot::Sender<Response>>>>>;

fn close(pending: &Pending) {
    pending.lock().unwrap_or_else(PoisonError::into_inner).take();
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

/// One multiplexed connection to a peer.
struct Connection {
    outbox: mpsc::UnboundedSender<Envelope<Request>>,
    pending: Pending,
}

impl Connection {
    fn open(stream: TcpStream, peer: ServerId) -> Connection {
        let (r, w) = stream.into_split();
        let (outbox, queued) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(StdMutex::new(Some(HashMap::new())));

        let on_write_error = pending.clone();
        let writer = tokio::spawn(async move {
            write_loop(w, queued).await;
            close(&on_write_error);
        });
        let replies = pending.clone();
        tokio::spawn(async move {
            if let Err(e) = route_replies(r, &replies).await {
                tracing::debug!(%peer, error = %e, "connection lost");
            }
            writer.abort();
            close(&replies);
        });

        Connection { outbox, pending }
    }

    fn is_closed(&self) -> bool {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    async fn request(&self, id: u64, req: Request) -> io::Result<Response> {
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            Some(waiting) => waiting.insert(id, tx),
            None => return Err(closed_error()),
        };
        let _slot = Slot { pending: &self.pending, id };

        self.outbox.send(Envelope { id, body: req }).map_err(|_| closed_error())?;
        rx.await.map_err(|_| closed_error())
    }
}

/// Frees a call's slot once the call finishes or is dropped.
struct Slot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if let Some(waiting) = self.pending.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            waiting.remove(&self.id);
        }
    }
}

async fn route_replies(mut r: OwnedReadHalf, pending: &Pending) -> io::Result<()> {
    while let Some(reply) = read_frame::<_, Envelope<Response>>(&mut r).await? {
        let waiter = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|waiting| waiting.remove(&reply.id));
        match waiter {
            // The caller may have timed out in the meantime.
            Some(tx) => {
                let _ = tx.send(reply.body);
            }
            None => tracing::debug!(id = reply.id, "dropping reply nobody waits for"),
        }
    }
    Ok(())
}

#[derive(Default)]
struct TcpInner {
    conns: Mutex<HashMap<ServerId, Arc<Connection>>>,
    next_id: AtomicU64,
}

/// `Transport` over TCP. Server ids are dialed as `host:port`.
#[derive(Clone, Default)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport::default()
    }
}

impl TcpInner {
    async fn connection(&self, peer: &ServerId) -> io::Result<Arc<Connection>> {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(peer).filter(|c| !c.is_closed()) {
            return Ok(conn.clone());
        }
        let stream = TcpStream::connect(peer.as_str()).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = %peer, "connected");
        let conn = Arc::new(Connection::open(stream, peer.clone()));
        conns.insert(peer.clone(), conn.clone());
        Ok(conn)
    }

    async fn exchange(&self, peer: &ServerId, req: Request) -> io::Result<Response> {
        let conn = self.connection(peer).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match conn.request(id, req).await {
            Ok(res) => Ok(res),
            Err(e) => {
                let mut conns = self.conns.lock().await;
                if conns.get(peer).is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                    conns.remove(peer);
                }
                Err(e)
            }
        }
    }
}

impl Transport for TcpTransport {
    fn call(&self, to: &ServerId, req: Request) -> BoxFuture<'static, Result<Response>> {
        let inner = self.inner.clone();
        let peer = to.clone();
        async move {
            inner
                .exchange(&peer, req)
                .await
                .map_err(|e| GfsError::Transport { peer, reason: e.to_string() })
        }
        .boxed()
    }
}

/// Accept connections on `listener` and answer every request with `node`.
pub async fn serve(listener: TcpListener, node: Arc<dyn Node>) -> io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, node = %node.id(), "listening");
    loop {
        let (stream, remote) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, node).await {
                tracing::debug!(%remote, error = %e, "connection closed");
            }
        });
    }
}

/// Requests on one connection are handled concurrently; replies go out in
/// the order they finish.
async fn serve_connection(stream: TcpStream, node: Arc<dyn Node>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut r, w) = stream.into_split();
    let (replies, queued) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(w, queued));

    while let Some(req) = read_frame::<_, Envelope<Request>>(&mut r).await? {
        let node = node.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let body = node.handle(req.body).await;
            // The connection may be gone by now.
            let _ = replies.send(Envelope { id: req.id, body });
        });
    }

    // Let replies still being computed go out before the write half closes.
    drop(replies);
    let _ = writer.await;
    Ok(())
}
