//! Point-to-point transport: multiplexed client links and the framed server.
//!
//! Every outbound request is assigned a fresh 64-bit identifier and a waiter
//! entry on its connection; incoming answers are dispatched to waiters by
//! identifier, and answers nobody waits for are dropped with a warning.
//! Connect errors propagate to every pending waiter; the link reconnects
//! lazily on next use.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecError;
use crate::wire::{Message, WireCodec};

type WaiterMap = Arc<DashMap<u64, mpsc::UnboundedSender<Result<Message, ExecError>>>>;

fn fail_all(waiters: &WaiterMap, err: &ExecError) {
    for entry in waiters.iter() {
        let _ = entry.value().send(Err(err.clone()));
    }
    waiters.clear();
}

struct LinkState {
    writer: FramedWrite<OwnedWriteHalf, WireCodec>,
    waiters: WaiterMap,
    reader: JoinHandle<()>,
}

impl LinkState {
    fn shutdown(self, err: &ExecError) {
        self.reader.abort();
        fail_all(&self.waiters, err);
    }
}

/// Stream of answers correlated to one request identifier.
///
/// A request normally yields a single terminal answer; constraint requests
/// with `repeat = true` keep the subscription open and may deliver several.
/// Dropping the stream releases the identifier.
pub struct Answers {
    id: u64,
    rx: mpsc::UnboundedReceiver<Result<Message, ExecError>>,
    waiters: WaiterMap,
}

impl Answers {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next answer for this request; a closed connection surfaces as a
    /// transport error.
    pub async fn recv(&mut self) -> Result<Message, ExecError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(ExecError::Transport("connection closed".to_string())),
        }
    }
}

impl Drop for Answers {
    fn drop(&mut self) {
        self.waiters.remove(&self.id);
    }
}

/// Outgoing connection to one peer, multiplexing requests by identifier.
pub struct PeerLink {
    peer: String,
    endpoints: Vec<SocketAddr>,
    next_id: AtomicU64,
    state: tokio::sync::Mutex<Option<LinkState>>,
}

impl PeerLink {
    pub fn new(peer: impl Into<String>, endpoints: Vec<SocketAddr>) -> Self {
        Self {
            peer: peer.into(),
            endpoints,
            next_id: AtomicU64::new(1),
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<LinkState, ExecError> {
        let mut last_err = ExecError::Transport(format!("no endpoints for {}", self.peer));
        for addr in &self.endpoints {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let (read_half, write_half) = stream.into_split();
                    let waiters: WaiterMap = Arc::new(DashMap::new());
                    let reader = tokio::spawn(read_loop(
                        FramedRead::new(read_half, WireCodec::new()),
                        waiters.clone(),
                    ));
                    return Ok(LinkState {
                        writer: FramedWrite::new(write_half, WireCodec::new()),
                        waiters,
                        reader,
                    });
                }
                Err(e) => last_err = ExecError::transport(format!("{addr}: {e}")),
            }
        }
        Err(last_err)
    }

    /// Sends a one-way frame (abort, ping, log, terminate).
    pub async fn send(&self, msg: Message) -> Result<(), ExecError> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let state = guard.as_mut().expect("link state just installed");
        if let Err(e) = state.writer.send(msg).await {
            let err = ExecError::transport(&e);
            if let Some(dead) = guard.take() {
                dead.shutdown(&err);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Allocates an identifier, registers a waiter and sends the request the
    /// builder produces for that identifier.
    pub async fn request(
        &self,
        build: impl FnOnce(u64) -> Message,
    ) -> Result<Answers, ExecError> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let state = guard.as_mut().expect("link state just installed");

        let id = self.allocate();
        let (tx, rx) = mpsc::unbounded_channel();
        state.waiters.insert(id, tx);
        let answers = Answers {
            id,
            rx,
            waiters: state.waiters.clone(),
        };

        if let Err(e) = state.writer.send(build(id)).await {
            let err = ExecError::transport(&e);
            if let Some(dead) = guard.take() {
                dead.shutdown(&err);
            }
            return Err(err);
        }
        Ok(answers)
    }

    /// Request expecting a single terminal answer; acks are skipped.
    pub async fn request_terminal(
        &self,
        build: impl FnOnce(u64) -> Message,
    ) -> Result<Message, ExecError> {
        let mut answers = self.request(build).await?;
        loop {
            let msg = answers.recv().await?;
            if matches!(msg, Message::RequestConstraintAck { .. }) {
                continue;
            }
            return Ok(msg);
        }
    }
}

async fn read_loop(mut framed: FramedRead<OwnedReadHalf, WireCodec>, waiters: WaiterMap) {
    while let Some(item) = framed.next().await {
        match item {
            Ok(msg) => match msg.answer_id() {
                Some(id) => {
                    let stale = match waiters.get(&id) {
                        Some(waiter) => waiter.send(Ok(msg)).is_err(),
                        None => {
                            warn!(id, "dropping answer for unknown request id");
                            false
                        }
                    };
                    if stale {
                        waiters.remove(&id);
                    }
                }
                None => warn!(kind = msg.kind(), "unexpected frame on client connection"),
            },
            Err(e) => {
                fail_all(&waiters, &ExecError::transport(&e));
                return;
            }
        }
    }
    fail_all(
        &waiters,
        &ExecError::Transport("connection closed by peer".to_string()),
    );
}

/// Write side of one accepted connection, handed to dispatchers so delayed
/// answers (constraint answers arrive after the ack) can be pushed later.
#[derive(Clone)]
pub struct ReplyHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ReplyHandle {
    /// Queues a frame; returns false once the connection is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Visitor for incoming frames on a server connection.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, msg: Message, reply: &ReplyHandle);
}

/// Framed TCP server dispatching frames to a visitor.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<dyn Dispatcher>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let accept = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let _ = stream.set_nodelay(true);
                            tokio::spawn(serve_connection(
                                stream,
                                dispatcher.clone(),
                                token.child_token(),
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            accept,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.accept.await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    dispatcher: Arc<dyn Dispatcher>,
    token: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, WireCodec::new());
    let mut writer = FramedWrite::new(write_half, WireCodec::new());

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if writer.send(msg).await.is_err() {
                break;
            }
        }
    });
    let reply = ReplyHandle { tx };

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = reader.next() => match frame {
                None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "connection read failed");
                    break;
                }
                Some(Ok(Message::Terminate { msg })) => {
                    debug!(reason = %msg, "peer terminated channel");
                    break;
                }
                Some(Ok(msg)) => dispatcher.dispatch(msg, &reply).await,
            }
        }
    }
    drop(reply);
    let _ = write_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::wire::ConstraintState;

    /// Answers variable reads with a canned value and constraints with an
    /// ack followed by a success answer.
    struct CannedDispatcher;

    #[async_trait]
    impl Dispatcher for CannedDispatcher {
        async fn dispatch(&self, msg: Message, reply: &ReplyHandle) {
            match msg {
                Message::RequestVariableValue { id, var, .. } => {
                    reply.send(Message::VariableValue {
                        id,
                        var,
                        value: Some(Value::Int(42)),
                    });
                }
                Message::RequestConstraint { id, .. } => {
                    reply.send(Message::RequestConstraintAck { id });
                    reply.send(Message::RequestConstraintAnswer {
                        id,
                        state: ConstraintState::Success,
                        payload: None,
                    });
                }
                _ => {}
            }
        }
    }

    async fn start_server() -> (Server, Vec<SocketAddr>) {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(CannedDispatcher))
            .await
            .unwrap();
        let addr = server.local_addr();
        (server, vec![addr])
    }

    #[tokio::test]
    async fn request_answer_roundtrip() {
        let (server, endpoints) = start_server().await;
        let link = PeerLink::new("peer", endpoints);

        let answer = link
            .request_terminal(|id| Message::RequestVariableValue {
                id,
                src: "test".to_string(),
                var: "x".to_string(),
            })
            .await
            .unwrap();
        match answer {
            Message::VariableValue { value, .. } => assert_eq!(value, Some(Value::Int(42))),
            other => panic!("unexpected answer {other:?}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn acks_are_skipped_before_terminal_answer() {
        let (server, endpoints) = start_server().await;
        let link = PeerLink::new("peer", endpoints);

        let answer = link
            .request_terminal(|id| Message::RequestConstraint {
                id,
                src: "test".to_string(),
                constraint: crate::expr::Expr::bool(true),
                repeat: false,
                unify: vec![],
            })
            .await
            .unwrap();
        assert!(matches!(
            answer,
            Message::RequestConstraintAnswer {
                state: ConstraintState::Success,
                ..
            }
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn requests_on_same_link_are_multiplexed() {
        let (server, endpoints) = start_server().await;
        let link = Arc::new(PeerLink::new("peer", endpoints));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let link = link.clone();
            tasks.push(tokio::spawn(async move {
                link.request_terminal(move |id| Message::RequestVariableValue {
                    id,
                    src: "test".to_string(),
                    var: format!("v{i}"),
                })
                .await
            }));
        }
        for task in tasks {
            let msg = task.await.unwrap().unwrap();
            assert!(matches!(msg, Message::VariableValue { .. }));
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn connect_failure_is_a_transport_error() {
        // Port 1 is essentially never listening.
        let link = PeerLink::new("ghost", vec!["127.0.0.1:1".parse().unwrap()]);
        let err = link
            .request_terminal(|id| Message::RequestVariableValue {
                id,
                src: "test".to_string(),
                var: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Transport(_)));
    }

    #[tokio::test]
    async fn pending_waiters_fail_when_server_goes_away() {
        let (server, endpoints) = start_server().await;
        let link = PeerLink::new("peer", endpoints);

        // Open the connection with one successful request.
        link.request_terminal(|id| Message::RequestVariableValue {
            id,
            src: "test".to_string(),
            var: "x".to_string(),
        })
        .await
        .unwrap();

        let mut pending = link
            .request(|id| Message::RequestConstraint {
                id,
                src: "test".to_string(),
                constraint: crate::expr::Expr::bool(true),
                repeat: true,
                unify: vec![],
            })
            .await
            .unwrap();
        // Drain the ack and the success answer, then kill the server.
        pending.recv().await.unwrap();
        pending.recv().await.unwrap();
        server.stop().await;

        let err = pending.recv().await.unwrap_err();
        assert!(matches!(err, ExecError::Transport(_)));
    }
}
