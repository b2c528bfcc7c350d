//! Central name registry: server component and client stub.
//!
//! One registry process serves the whole system. Registration is
//! last-writer-wins because agents restart; the registry never actively
//! reaps an entry, it relies on peers reporting a dead agent
//! (`InformDeathAgent`) after they observe resolve or connect failures.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::domain::AgentName;
use crate::error::ExecError;
use crate::transport::{Dispatcher, ReplyHandle, Server};
use crate::wire::{Message, WireCodec};

/// Name → endpoint list mapping. Concurrent readers are allowed; a
/// duplicate registration replaces the previous entry.
#[derive(Debug, Default)]
pub struct RegistryMap {
    entries: DashMap<String, Vec<SocketAddr>>,
}

impl RegistryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records endpoints for a name, replacing any previous entry.
    /// Returns true when an entry was replaced.
    pub fn register(&self, name: &str, endpoints: Vec<SocketAddr>) -> bool {
        self.entries.insert(name.to_string(), endpoints).is_some()
    }

    pub fn resolve(&self, name: &str) -> Option<Vec<SocketAddr>> {
        self.entries.get(name).map(|e| e.clone())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hands out server ports for agents registering without an endpoint.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU16,
}

impl PortAllocator {
    pub fn new(base_port: u16) -> Self {
        Self {
            next: AtomicU16::new(base_port),
        }
    }

    pub fn allocate(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

struct RegistryDispatcher {
    registry: Arc<RegistryMap>,
    ports: PortAllocator,
    host: IpAddr,
    last_seen: DashMap<String, Instant>,
}

#[async_trait]
impl Dispatcher for RegistryDispatcher {
    async fn dispatch(&self, msg: Message, reply: &ReplyHandle) {
        match msg {
            Message::RequestName { id, name } => {
                let endpoints = self.registry.resolve(&name);
                debug!(%name, found = endpoints.is_some(), "resolve");
                reply.send(Message::RequestNameAnswer {
                    id,
                    name,
                    success: endpoints.is_some(),
                    endpoints: endpoints.unwrap_or_default(),
                });
            }
            Message::RegisterName {
                id,
                name,
                endpoints,
            } => {
                let endpoints = if endpoints.is_empty() {
                    vec![SocketAddr::new(self.host, self.ports.allocate())]
                } else {
                    endpoints
                };
                let assigned = endpoints[0];
                let replaced = self.registry.register(&name, endpoints);
                info!(%name, %assigned, replaced, "registered");
                reply.send(Message::RegisterNameAnswer {
                    id,
                    name,
                    success: true,
                    assigned: Some(assigned),
                });
            }
            Message::Ping { name } => {
                self.last_seen.insert(name, Instant::now());
            }
            Message::InformDeathAgent { name } => {
                if self.registry.remove(&name) {
                    info!(%name, "removed dead agent");
                }
                self.last_seen.remove(&name);
            }
            other => {
                warn!(kind = other.kind(), "unexpected frame at name server");
            }
        }
    }
}

/// The registry process: a [`Server`] wired to the registry map.
pub struct NameServer {
    registry: Arc<RegistryMap>,
    server: Server,
}

impl NameServer {
    /// Binds the registry on `addr`. Ports for endpoint-less registrations
    /// are handed out starting right above the registry's own port.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let registry = Arc::new(RegistryMap::new());
        let probe_port = if addr.port() == 0 { 0 } else { addr.port() + 1 };
        let dispatcher = Arc::new(RegistryDispatcher {
            registry: registry.clone(),
            ports: PortAllocator::new(probe_port.max(1024)),
            host: addr.ip(),
            last_seen: DashMap::new(),
        });
        let server = Server::bind(addr, dispatcher).await?;
        Ok(Self { registry, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Arc<RegistryMap> {
        &self.registry
    }

    pub async fn stop(self) {
        self.server.stop().await;
    }
}

/// Client stub for the registry, held by every agent.
///
/// Requests are serialized: a second resolve issued while one is in flight
/// waits its turn instead of interleaving frames.
pub struct NameClient {
    addr: SocketAddr,
    next_id: AtomicU64,
    conn: tokio::sync::Mutex<Option<Framed<TcpStream, WireCodec>>>,
}

impl NameClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_id: AtomicU64::new(1),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn roundtrip(&self, build: impl FnOnce(u64) -> Message) -> Result<Message, ExecError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(self.addr)
                .await
                .map_err(ExecError::transport)?;
            *guard = Some(Framed::new(stream, WireCodec::new()));
        }
        let conn = guard.as_mut().expect("connection just installed");

        let result = Self::exchange(conn, build(id), id).await;
        if result.is_err() {
            // The stream is in an unknown state; reconnect on next use.
            *guard = None;
        }
        result
    }

    async fn exchange(
        conn: &mut Framed<TcpStream, WireCodec>,
        msg: Message,
        id: u64,
    ) -> Result<Message, ExecError> {
        conn.send(msg).await.map_err(ExecError::transport)?;
        loop {
            match conn.next().await {
                Some(Ok(answer)) if answer.answer_id() == Some(id) => return Ok(answer),
                Some(Ok(answer)) => {
                    warn!(kind = answer.kind(), "dropping unrelated name server frame");
                }
                Some(Err(e)) => return Err(ExecError::transport(e)),
                None => {
                    return Err(ExecError::Transport(
                        "name server closed the connection".to_string(),
                    ));
                }
            }
        }
    }

    /// Registers `name`; with an empty endpoint list the registry allocates
    /// a fresh server port and returns it.
    pub async fn register(
        &self,
        name: &AgentName,
        endpoints: Vec<SocketAddr>,
    ) -> Result<SocketAddr, ExecError> {
        let name_str = name.to_string();
        let answer = self
            .roundtrip(|id| Message::RegisterName {
                id,
                name: name_str.clone(),
                endpoints: endpoints.clone(),
            })
            .await?;
        match answer {
            Message::RegisterNameAnswer {
                success: true,
                assigned: Some(assigned),
                ..
            } => Ok(assigned),
            Message::RegisterNameAnswer { .. } => Err(ExecError::ExecutionFailed(format!(
                "registration of {name} refused"
            ))),
            other => Err(ExecError::transport(format!(
                "unexpected answer {}",
                other.kind()
            ))),
        }
    }

    pub async fn resolve(&self, name: &str) -> Result<Vec<SocketAddr>, ExecError> {
        let name_owned = name.to_string();
        let answer = self
            .roundtrip(|id| Message::RequestName {
                id,
                name: name_owned.clone(),
            })
            .await?;
        match answer {
            Message::RequestNameAnswer {
                success: true,
                endpoints,
                ..
            } => Ok(endpoints),
            Message::RequestNameAnswer { .. } => Err(ExecError::NotFound(name.to_string())),
            other => Err(ExecError::transport(format!(
                "unexpected answer {}",
                other.kind()
            ))),
        }
    }

    /// Reports a dead agent so the registry drops its entry.
    pub async fn remove(&self, name: &str) -> Result<(), ExecError> {
        self.send_oneway(Message::InformDeathAgent {
            name: name.to_string(),
        })
        .await
    }

    /// Liveness beacon; errors are reported but never fatal.
    pub async fn ping(&self, name: &str) -> Result<(), ExecError> {
        self.send_oneway(Message::Ping {
            name: name.to_string(),
        })
        .await
    }

    async fn send_oneway(&self, msg: Message) -> Result<(), ExecError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(self.addr)
                .await
                .map_err(ExecError::transport)?;
            *guard = Some(Framed::new(stream, WireCodec::new()));
        }
        let conn = guard.as_mut().expect("connection just installed");
        if let Err(e) = conn.send(msg).await {
            *guard = None;
            return Err(ExecError::transport(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start() -> (NameServer, NameClient) {
        let server = NameServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = NameClient::new(server.local_addr());
        (server, client)
    }

    #[tokio::test]
    async fn register_then_resolve_returns_registered_endpoints() {
        let (server, client) = start().await;
        let name = AgentName::literal("pos");
        let ep: SocketAddr = "127.0.0.1:9901".parse().unwrap();

        let assigned = client.register(&name, vec![ep]).await.unwrap();
        assert_eq!(assigned, ep);
        assert_eq!(client.resolve("pos").await.unwrap(), vec![ep]);
        server.stop().await;
    }

    #[tokio::test]
    async fn registering_without_endpoints_allocates_a_port() {
        let (server, client) = start().await;
        let a = client
            .register(&AgentName::literal("first"), vec![])
            .await
            .unwrap();
        let b = client
            .register(&AgentName::literal("second"), vec![])
            .await
            .unwrap();
        assert_ne!(a.port(), 0);
        assert_ne!(a.port(), b.port());
        server.stop().await;
    }

    #[tokio::test]
    async fn duplicate_registration_is_last_writer_wins() {
        let (server, client) = start().await;
        let name = AgentName::literal("pos");
        let first: SocketAddr = "127.0.0.1:9901".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:9902".parse().unwrap();

        client.register(&name, vec![first]).await.unwrap();
        client.register(&name, vec![second]).await.unwrap();
        assert_eq!(client.resolve("pos").await.unwrap(), vec![second]);
        server.stop().await;
    }

    #[tokio::test]
    async fn remove_then_resolve_reports_not_found() {
        let (server, client) = start().await;
        let name = AgentName::literal("pos");
        client
            .register(&name, vec!["127.0.0.1:9901".parse().unwrap()])
            .await
            .unwrap();

        client.remove("pos").await.unwrap();
        // The removal frame is one-way; poll until the registry catches up.
        let mut last = Ok(vec![]);
        for _ in 0..50 {
            last = client.resolve("pos").await;
            if last.is_err() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(last.unwrap_err(), ExecError::NotFound("pos".to_string()));
        server.stop().await;
    }

    #[tokio::test]
    async fn resolving_an_unknown_name_reports_not_found() {
        let (server, client) = start().await;
        let err = client.resolve("nobody").await.unwrap_err();
        assert_eq!(err, ExecError::NotFound("nobody".to_string()));
        server.stop().await;
    }
}
