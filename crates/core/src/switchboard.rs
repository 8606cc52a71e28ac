use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use onionmesh_common::{limits, OnionMeshError, Result, Timestamp};
use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{read_packet, write_packet};
use crate::crypto::{decrypt_sym, encrypt_sym, LayerKey};
use crate::exit::ExitFetch;
use crate::packet::{ControlCommand, ControlPayload, Packet, RelayCommand, RelayPayload};
use crate::rsa_wrap::LongTermKeyPair;
use crate::tables::{CircuitTable, NodeKeyTable, NodeRelayTable};

type Writer = Arc<Mutex<OwnedWriteHalf>>;

/// A relay's three routing tables plus the live socket handles needed to
/// actually forward bytes, all under one lock (spec.md §3, §5). The
/// teacher keeps one `RwLock` per subsystem; these three tables are
/// small, always mutated together at circuit-build/teardown time, and
/// never held across I/O, so one lock is simpler without violating the
/// single-writer-or-multiple-readers policy §5 asks for.
#[derive(Default)]
struct Tables {
    circuit_table: CircuitTable,
    node_key_table: NodeKeyTable,
    node_relay_table: NodeRelayTable,
    /// Write half of the persistent connection to whichever peer issued
    /// the `create`/`extend` that produced this `circID_in`.
    inbound_writers: HashMap<u32, Writer>,
    /// Write half of the persistent connection toward the next hop this
    /// node opened while extending, keyed by the **inbound** `circID_in`
    /// the extend arrived on rather than the `circID_out` the downstream
    /// peer handed back. `circID_out` is drawn by that downstream peer
    /// against its own tables, with no coordination against this node's
    /// other outbound legs — two different downstream peers can return
    /// the same numeric value for unrelated circuits. `circID_in` is
    /// this node's own allocation (collision-checked in
    /// `allocate_circ_id` against everything it already has open), so
    /// keying on it instead can't alias two legs together.
    outbound_writers: HashMap<u32, Writer>,
    /// When this node accepted the `create` for a given `circID_in`, for
    /// the status endpoint's circuit-age reporting.
    created_at: HashMap<u32, Timestamp>,
}

/// A point-in-time snapshot of a relay's routing state, for the
/// read-only status endpoint (SPEC_FULL.md §1/§6's ambient status
/// surface). Cheap to produce; never includes keys or payload content.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SwitchboardStats {
    pub active_circuits: usize,
    pub forwarding_legs: usize,
    pub max_circuits: usize,
    pub oldest_circuit_age_secs: Option<u64>,
}

impl Tables {
    fn active_circuits(&self) -> usize {
        self.node_key_table.len()
    }

    fn circ_id_in_use(&self, id: u32) -> bool {
        self.circuit_table.contains_circ_id(id)
            || self.node_key_table.contains(id)
            || self.node_relay_table.contains_either(id)
    }
}

/// A relay node's switchboard: the shared routing state (spec.md §3) and
/// the dispatch logic that classifies and acts on each inbound packet
/// (spec.md §4.2). One instance is shared by every accepted connection,
/// always behind an `Arc` since backward-path forwarding spawns detached
/// tasks that outlive the connection that created them.
pub struct Switchboard {
    tables: RwLock<Tables>,
    keypair: Arc<LongTermKeyPair>,
    exit_fetch: Arc<dyn ExitFetch>,
    timeout: Duration,
    max_circuits: usize,
}

impl Switchboard {
    pub fn new(keypair: Arc<LongTermKeyPair>, exit_fetch: Arc<dyn ExitFetch>, timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            keypair,
            exit_fetch,
            timeout,
            max_circuits: limits::MAX_CIRCUITS,
        }
    }

    /// Draw a fresh circID uniformly from `[0, MAX_CIRC_ID]`, re-drawing
    /// on collision with any circID already in use by this node (spec.md
    /// §4.2's allocation rule). Returns `None` once `max_circuits` active
    /// circuits are already open.
    async fn allocate_circ_id(&self) -> Option<u32> {
        {
            let tables = self.tables.read().await;
            if tables.active_circuits() >= self.max_circuits {
                return None;
            }
        }
        for _ in 0..64 {
            let candidate = rand::thread_rng().gen_range(0..=limits::MAX_CIRC_ID);
            let tables = self.tables.read().await;
            if !tables.circ_id_in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Snapshot the routing tables for the status endpoint. Read lock
    /// only; never touches keys or payload bytes.
    pub async fn stats(&self) -> SwitchboardStats {
        let tables = self.tables.read().await;
        let oldest_circuit_age_secs = tables
            .created_at
            .values()
            .map(|ts| ts.elapsed().as_secs())
            .max();
        SwitchboardStats {
            active_circuits: tables.active_circuits(),
            forwarding_legs: tables.node_relay_table.len(),
            max_circuits: self.max_circuits,
            oldest_circuit_age_secs,
        }
    }

    async fn write_to(&self, writer: &Writer, packet: &Packet) -> Result<()> {
        let mut guard = writer.lock().await;
        write_packet(&mut *guard, packet, self.timeout).await
    }

    /// Handle one inbound accepted connection start to finish: the
    /// predecessor's entire persistent stream for one circuit leg
    /// (spec.md §4.3's Open-Question resolution — one TCP stream per
    /// circuit leg carries create/extend and all later relay traffic).
    pub async fn run_inbound(
        self: Arc<Self>,
        peer: std::net::SocketAddr,
        read: OwnedReadHalf,
        write: OwnedWriteHalf,
    ) {
        let writer: Writer = Arc::new(Mutex::new(write));
        let mut read = read;
        let mut circ_id_in: Option<u32> = None;

        loop {
            let packet = match read_packet(&mut read, self.timeout).await {
                Ok(p) => p,
                Err(OnionMeshError::ConnectionClosed) => break,
                Err(e) => {
                    debug!(error = %e, "inbound connection closed after protocol error");
                    break;
                }
            };

            match packet {
                Packet::Control {
                    circ_id: _,
                    command: ControlCommand::Create,
                    payload: ControlPayload::KeyExchange(exchange),
                } => match self.handle_create(peer, exchange, writer.clone()).await {
                    Ok(new_id) => circ_id_in = Some(new_id),
                    Err(e) => {
                        warn!(error = %e, "create rejected");
                        break;
                    }
                },
                Packet::Relay {
                    circ_id,
                    command: command @ (RelayCommand::Extend | RelayCommand::RelayData),
                    encrypted_data,
                } => {
                    // Every hop owns the correct key for its own outer
                    // layer, so a peel failure here is always the
                    // "intended recipient" case of spec.md §7 — corruption
                    // or tampering, never a routing miss — and the
                    // connection comes down (S6).
                    if let Err(e) = self
                        .clone()
                        .handle_forward(circ_id, command, encrypted_data, writer.clone())
                        .await
                    {
                        warn!(error = %e, "auth failure on inbound leg, closing connection");
                        break;
                    }
                }
                Packet::Control {
                    circ_id,
                    command: ControlCommand::Destroy,
                    ..
                } => {
                    self.handle_destroy(circ_id).await;
                    break;
                }
                other => {
                    warn!(?other, "protocol violation on inbound connection");
                    break;
                }
            }
        }

        if let Some(id) = circ_id_in {
            self.handle_destroy(id).await;
        }
    }

    /// `control/create`: allocate `circID_in`, unwrap the symmetric key,
    /// record both tables, and reply `created` with fixed-size opaque
    /// padding encrypted under the new key (spec.md §4.2, §9's
    /// second Open Question). `circuit_table` is keyed on `peer`, the
    /// actual accepted TCP socket address, rather than the `ip`/`port`
    /// the create payload advertises — the payload's fields are a
    /// placeholder the predecessor fills with its own identity (or
    /// nothing, if the predecessor is the client), so they collide
    /// across every leg this node accepts; `peer` is OS-guaranteed
    /// distinct per open connection and so actually witnesses spec.md
    /// §8 invariant #4's one-to-one circID/leg bijection.
    async fn handle_create(
        &self,
        peer: std::net::SocketAddr,
        exchange: RelayPayload,
        writer: Writer,
    ) -> Result<u32> {
        let key = self.keypair.unwrap_key(&exchange.data)?;
        let circ_id = self
            .allocate_circ_id()
            .await
            .ok_or(OnionMeshError::TooManyCircuits {
                max: self.max_circuits,
            })?;

        {
            let mut tables = self.tables.write().await;
            tables
                .circuit_table
                .insert((peer.ip().to_string(), peer.port()), circ_id);
            tables.node_key_table.insert(circ_id, key);
            tables.inbound_writers.insert(circ_id, writer.clone());
            tables.created_at.insert(circ_id, Timestamp::now());
        }

        let padding = random_padding();
        let sealed = encrypt_sym(&key, &padding)?;
        let response = Packet::Control {
            circ_id,
            command: ControlCommand::Created,
            payload: ControlPayload::Opaque(sealed),
        };
        self.write_to(&writer, &response).await?;
        info!(circ_id, "circuit leg created");
        Ok(circ_id)
    }

    /// `relay/extend` or `relay/relay_data` arriving on an established
    /// leg. This node's own key always peels the outer layer correctly —
    /// it was established specifically for that layer during this leg's
    /// `create` — so decrypt failure here means the bytes were corrupted
    /// in flight, not that they belong to someone else (spec.md §7's
    /// "intended recipient" auth-failure case, exercised by S6).
    ///
    /// What distinguishes "this node is the frontier of the telescope"
    /// from "this node already extended past itself, keep forwarding" is
    /// `node_relay_table`, exactly as spec.md §3 defines the exit: a
    /// circID with a `node_relay_table` entry is forwarded one layer
    /// further; one without is handled locally (§4.2's direction oracle).
    async fn handle_forward(
        self: Arc<Self>,
        circ_id_in: u32,
        command: RelayCommand,
        encrypted_data: Vec<u8>,
        inbound_writer: Writer,
    ) -> Result<()> {
        let (key, circ_id_out) = {
            let tables = self.tables.read().await;
            let key = *tables
                .node_key_table
                .get(circ_id_in)
                .ok_or(OnionMeshError::UnknownCircuit(circ_id_in))?;
            (key, tables.node_relay_table.dest_of(circ_id_in))
        };

        let peeled = decrypt_sym(&key, &encrypted_data)
            .map_err(|e| OnionMeshError::crypto(format!("layer auth failed: {e}")))?;

        match circ_id_out {
            Some(circ_id_out) => {
                // Already extended past this node: peeled is still
                // ciphertext for a further hop. Forward it on, unchanged
                // apart from circID (spec.md §4.2's bit-exact contract).
                let outbound_writer = {
                    let tables = self.tables.read().await;
                    tables.outbound_writers.get(&circ_id_in).cloned()
                }
                .ok_or_else(|| OnionMeshError::protocol("outbound writer missing for leg"))?;
                let forwarded = Packet::Relay {
                    circ_id: circ_id_out,
                    command,
                    encrypted_data: peeled,
                };
                self.write_to(&outbound_writer, &forwarded).await
            }
            None => {
                // This node is the current frontier: peeled is meaningful
                // plaintext addressed to it.
                let payload = RelayPayload::from_layer_bytes(&peeled)?;
                match command {
                    RelayCommand::Extend => {
                        self.handle_extend(circ_id_in, key, payload, inbound_writer)
                            .await
                    }
                    RelayCommand::RelayData => {
                        self.handle_exit(circ_id_in, key, payload, inbound_writer)
                            .await
                    }
                    _ => unreachable!("caller only dispatches Extend/RelayData here"),
                }
            }
        }
    }

    /// This node is the target of an `extend`: open a new persistent
    /// connection to the named hop, run the `create`/`created` handshake
    /// on it, and reply `extended` to the predecessor (spec.md §4.2).
    async fn handle_extend(
        self: Arc<Self>,
        circ_id_in: u32,
        key: LayerKey,
        target: RelayPayload,
        inbound_writer: Writer,
    ) -> Result<()> {
        {
            let tables = self.tables.read().await;
            if tables.active_circuits() >= self.max_circuits {
                return Err(OnionMeshError::TooManyCircuits {
                    max: self.max_circuits,
                });
            }
        }

        let addr = format!("{}:{}", target.ip, target.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| OnionMeshError::Timeout)??;
        let (out_read, out_write) = stream.into_split();
        let out_write: Writer = Arc::new(Mutex::new(out_write));
        let mut out_read = out_read;

        // The circID in this outgoing `create` is only a placeholder —
        // the next hop allocates the real one (collision-avoided against
        // its own tables) and hands it back in `created`. That returned
        // id, not this one, is what every further packet on this leg
        // must carry (same adoption rule as the client's entry-hop
        // create; see `client::build_circuit`).
        let our_addr = local_peer_addr();
        let create = Packet::Control {
            circ_id: 0,
            command: ControlCommand::Create,
            payload: ControlPayload::KeyExchange(RelayPayload::for_extend(
                our_addr.0,
                our_addr.1,
                target.data,
            )),
        };
        {
            let mut guard = out_write.lock().await;
            write_packet(&mut *guard, &create, self.timeout).await?;
        }
        let created = read_packet(&mut out_read, self.timeout).await?;
        let (circ_id_out, created_payload) = match created {
            Packet::Control {
                circ_id,
                command: ControlCommand::Created,
                payload: ControlPayload::Opaque(bytes),
            } => (circ_id, bytes),
            other => {
                return Err(OnionMeshError::protocol(format!(
                    "expected created, got {other:?}"
                )))
            }
        };

        {
            let mut tables = self.tables.write().await;
            tables.node_relay_table.insert(circ_id_in, circ_id_out);
            // Keyed by circ_id_in, not the downstream-chosen circ_id_out —
            // see the field comment on `Tables::outbound_writers`.
            tables.outbound_writers.insert(circ_id_in, out_write.clone());
        }

        let wrapped = encrypt_sym(&key, &created_payload)?;
        let extended = Packet::Relay {
            circ_id: circ_id_in,
            command: RelayCommand::Extended,
            encrypted_data: wrapped,
        };
        self.write_to(&inbound_writer, &extended).await?;

        let this = self.clone();
        tokio::spawn(async move {
            this.run_outbound(circ_id_in, circ_id_out, out_read).await;
        });
        Ok(())
    }

    /// This node is the exit: perform the external fetch and wrap the
    /// response (or, on failure, opaque padding of the same size) into
    /// `relay_ans` (spec.md §6, §7's "never reveal failure out-of-band").
    async fn handle_exit(
        &self,
        circ_id_in: u32,
        key: LayerKey,
        request: RelayPayload,
        inbound_writer: Writer,
    ) -> Result<()> {
        let url = String::from_utf8_lossy(&request.data).to_string();
        let response_bytes = match self.exit_fetch.fetch(&url).await {
            Some(bytes) => bytes,
            None => random_padding_sized(DEFAULT_RESPONSE_PADDING),
        };
        let response_payload = RelayPayload::for_relay_data(response_bytes).to_layer_bytes();
        let wrapped = encrypt_sym(&key, &response_payload)?;
        let answer = Packet::Relay {
            circ_id: circ_id_in,
            command: RelayCommand::RelayAns,
            encrypted_data: wrapped,
        };
        self.write_to(&inbound_writer, &answer).await
    }

    /// Reads backward-direction traffic (`extended`, `relay_ans`) off the
    /// persistent connection toward the next hop and re-encrypts it under
    /// this leg's key before handing it back to the predecessor (spec.md
    /// §4.2's "relay/extended or relay_ans" branch). `circ_id_in` and
    /// `circ_id_out` are fixed for the lifetime of this task — one task
    /// per outbound leg, so there is no need to recover `circ_id_in` by
    /// searching the shared tables for whichever mapping happens to
    /// carry a given `circ_id_out` (that reverse lookup is ambiguous the
    /// moment two downstream peers independently hand back the same
    /// numeric `circ_id_out` for unrelated circuits).
    async fn run_outbound(self: Arc<Self>, circ_id_in: u32, circ_id_out: u32, mut read: OwnedReadHalf) {
        loop {
            let packet = match read_packet(&mut read, self.timeout).await {
                Ok(p) => p,
                Err(_) => break,
            };
            let Packet::Relay {
                circ_id,
                command,
                encrypted_data,
            } = packet
            else {
                warn!("non-relay packet on outbound leg; dropping");
                continue;
            };
            if circ_id != circ_id_out {
                warn!(circ_id, circ_id_out, "circID mismatch on outbound leg");
                continue;
            }

            let (key, inbound_writer) = {
                let tables = self.tables.read().await;
                let key = match tables.node_key_table.get(circ_id_in) {
                    Some(k) => *k,
                    None => break,
                };
                let writer = tables.inbound_writers.get(&circ_id_in).cloned();
                (key, writer)
            };
            let Some(inbound_writer) = inbound_writer else {
                break;
            };

            let reencrypted = match encrypt_sym(&key, &encrypted_data) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "re-encryption failed on backward path");
                    continue;
                }
            };
            let forwarded = Packet::Relay {
                circ_id: circ_id_in,
                command,
                encrypted_data: reencrypted,
            };
            if self.write_to(&inbound_writer, &forwarded).await.is_err() {
                break;
            }
        }
    }

    async fn handle_destroy(&self, circ_id_in: u32) {
        let (circ_id_out, outbound_writer) = {
            let mut tables = self.tables.write().await;
            tables.node_key_table.remove(circ_id_in);
            let circ_id_out = tables.node_relay_table.dest_of(circ_id_in);
            tables.node_relay_table.remove_either(circ_id_in);
            tables.inbound_writers.remove(&circ_id_in);
            tables.created_at.remove(&circ_id_in);
            if let Some(addr) = tables.circuit_table.addr_for(circ_id_in) {
                tables.circuit_table.remove(&addr);
            }
            let outbound_writer = tables.outbound_writers.remove(&circ_id_in);
            (circ_id_out, outbound_writer)
        };

        if let (Some(circ_id_out), Some(writer)) = (circ_id_out, outbound_writer) {
            let destroy = Packet::Control {
                circ_id: circ_id_out,
                command: ControlCommand::Destroy,
                payload: ControlPayload::Empty,
            };
            let _ = self.write_to(&writer, &destroy).await;
        }
        debug!(circ_id_in, "circuit leg destroyed");
    }
}

const DEFAULT_RESPONSE_PADDING: usize = 256;

fn random_padding() -> Vec<u8> {
    random_padding_sized(limits::CONTROL_PADDING_LEN)
}

fn random_padding_sized(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill(buf.as_mut_slice());
    buf
}

/// The address this relay advertises to a further hop when it itself
/// issues a `create` on the target's behalf. The teacher's `node.py`
/// sends its own listening address here; a forwarder's outbound
/// `create` is made on behalf of the circuit, not as a future inbound
/// peer of the next hop, so a fixed placeholder is sufficient —
/// downstream nodes never dial it back.
fn local_peer_addr() -> (String, u16) {
    ("0.0.0.0".to_string(), 0)
}

/// A running relay: owns a [`Switchboard`] and the TCP accept loop that
/// feeds it (spec.md §4.2, §5).
pub struct RelayNode {
    switchboard: Arc<Switchboard>,
    running: Arc<AtomicBool>,
    timeout: Duration,
}

impl RelayNode {
    pub fn new(keypair: Arc<LongTermKeyPair>, exit_fetch: Arc<dyn ExitFetch>, timeout: Duration) -> Self {
        Self {
            switchboard: Arc::new(Switchboard::new(keypair, exit_fetch, timeout)),
            running: Arc::new(AtomicBool::new(true)),
            timeout,
        }
    }

    pub fn stop_handle(&self) -> RelayStopHandle {
        RelayStopHandle {
            running: self.running.clone(),
            switchboard: self.switchboard.clone(),
        }
    }

    /// Bind `addr` and accept connections until stopped, handing each
    /// one to the shared switchboard as its own task (spec.md §5).
    pub async fn serve(&self, addr: std::net::SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(OnionMeshError::Io)?;
        self.serve_listener(listener).await
    }

    /// Same as [`serve`](Self::serve), but against an already-bound
    /// listener — lets a caller resolve an OS-assigned port (`:0`)
    /// before registering it with the directory.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr(), "relay listening");
        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::time::timeout(self.timeout, listener.accept()).await;
            let (stream, peer) = match accept {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(error = %e, "relay accept failed");
                    continue;
                }
                Err(_) => continue,
            };
            let (read, write) = stream.into_split();
            let switchboard = self.switchboard.clone();
            tokio::spawn(async move {
                debug!(%peer, "relay accepted connection");
                switchboard.run_inbound(peer, read, write).await;
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RelayStopHandle {
    running: Arc<AtomicBool>,
    switchboard: Arc<Switchboard>,
}

impl RelayStopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Routing-table snapshot for this relay, for the status endpoint
    /// (SPEC_FULL.md §1/§6).
    pub async fn stats(&self) -> SwitchboardStats {
        self.switchboard.stats().await
    }
}
