use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use onionmesh_common::{limits, OnionMeshError, RelayDescriptor, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::codec::{read_packet, write_packet};
use crate::packet::Packet;

/// The directory's registry of live relays (spec.md §3, §4.1). Keyed by
/// `(ip, port)` so a re-registration from the same address replaces the
/// existing entry in place rather than appending a duplicate.
#[derive(Debug, Default)]
pub struct Registry {
    relays: RwLock<Vec<RelayDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert `descriptor`, returning the full registry afterward.
    pub async fn register(&self, descriptor: RelayDescriptor) -> Vec<RelayDescriptor> {
        let mut relays = self.relays.write().await;
        let key = descriptor.address_key();
        match relays.iter_mut().find(|d| d.address_key() == key) {
            Some(existing) => *existing = descriptor,
            None => relays.push(descriptor),
        }
        relays.clone()
    }

    pub async fn query(&self) -> Vec<RelayDescriptor> {
        self.relays.read().await.clone()
    }
}

/// The directory service: a TCP accept loop that reads one `dir` packet
/// per connection, dispatches it against the shared [`Registry`], and
/// closes (spec.md §4.1). Mirrors the teacher's per-connection task
/// shape — one spawned task per accepted socket, servicing exactly one
/// packet.
pub struct DirectoryService {
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
    timeout: Duration,
}

impl DirectoryService {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            running: Arc::new(AtomicBool::new(true)),
            timeout: limits::DEFAULT_TIMEOUT,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// A handle whose `stop()` flips the `running` flag the accept loop
    /// polls (spec.md §5's cancellation model).
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Bind `addr` and serve until `stop()` is called. Each accepted
    /// connection is handled in its own task; a malformed packet closes
    /// that connection silently without touching the registry (spec.md
    /// §4.1's failure semantics).
    pub async fn serve(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(OnionMeshError::Io)?;
        info!(%addr, "directory listening");
        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::time::timeout(self.timeout, listener.accept()).await;
            let (stream, peer) = match accept {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(error = %e, "directory accept failed");
                    continue;
                }
                Err(_) => continue,
            };
            let registry = self.registry.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, registry, timeout).await {
                    debug!(%peer, error = %e, "directory connection closed");
                }
            });
        }
        Ok(())
    }
}

impl Default for DirectoryService {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    registry: Arc<Registry>,
    timeout: Duration,
) -> Result<()> {
    let request = read_packet(&mut stream, timeout).await?;
    let nodes = match request {
        Packet::DirQuery => registry.query().await,
        Packet::DirUpdate(descriptor) => registry.register(descriptor).await,
        other => {
            return Err(OnionMeshError::protocol(format!(
                "directory received non-dir packet: {other:?}"
            )))
        }
    };
    let answer = Packet::DirAnswer {
        updated: nodes.len() as u64,
        nodes,
    };
    write_packet(&mut stream, &answer, timeout).await
}

/// Query a directory at `addr` for its current registry (the client side
/// of `dir_query`, spec.md §6).
pub async fn query_directory(addr: SocketAddr, timeout: Duration) -> Result<Vec<RelayDescriptor>> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| OnionMeshError::Timeout)??;
    write_packet(&mut stream, &Packet::DirQuery, timeout).await?;
    match read_packet(&mut stream, timeout).await? {
        Packet::DirAnswer { nodes, .. } => Ok(nodes),
        other => Err(OnionMeshError::protocol(format!(
            "expected dir_answer, got {other:?}"
        ))),
    }
}

/// Register `descriptor` with the directory at `addr` (a relay's boot-time
/// `dir_update`, spec.md §6).
pub async fn register_with_directory(
    addr: SocketAddr,
    descriptor: RelayDescriptor,
    timeout: Duration,
) -> Result<Vec<RelayDescriptor>> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| OnionMeshError::Timeout)??;
    write_packet(&mut stream, &Packet::DirUpdate(descriptor), timeout).await?;
    match read_packet(&mut stream, timeout).await? {
        Packet::DirAnswer { nodes, .. } => Ok(nodes),
        other => Err(OnionMeshError::protocol(format!(
            "expected dir_answer, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(port: u16) -> RelayDescriptor {
        RelayDescriptor::new("127.0.0.1", port, "65537".into(), port.to_string())
    }

    #[tokio::test]
    async fn register_is_idempotent_on_repeat() {
        let registry = Registry::new();
        let first = registry.register(descriptor(9001)).await;
        let second = registry.register(descriptor(9001)).await;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn register_upserts_by_address_not_append() {
        let registry = Registry::new();
        registry.register(descriptor(9001)).await;
        let updated = RelayDescriptor::new("127.0.0.1", 9001, "65537".into(), "999999".into());
        let after = registry.register(updated).await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].rsa_modulus, "999999");
    }

    #[tokio::test]
    async fn query_reflects_distinct_registrations() {
        let registry = Registry::new();
        registry.register(descriptor(9001)).await;
        registry.register(descriptor(9002)).await;
        assert_eq!(registry.query().await.len(), 2);
    }

    #[tokio::test]
    async fn end_to_end_register_and_query_over_tcp() {
        let service = DirectoryService::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let stop = service.stop_handle();
        let serve_addr = addr;
        let handle = tokio::spawn(async move { service.serve(serve_addr).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        register_with_directory(addr, descriptor(9001), Duration::from_secs(1))
            .await
            .unwrap();
        let nodes = query_directory(addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(nodes.len(), 1);

        stop.stop();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
