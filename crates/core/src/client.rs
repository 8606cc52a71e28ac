use std::net::SocketAddr;
use std::time::Duration;

use onionmesh_common::{limits, OnionMeshError, RelayDescriptor, Result};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::codec::{read_packet, write_packet};
use crate::crypto::{decrypt_sym, encrypt_sym, generate_key, LayerKey};
use crate::packet::{ControlCommand, ControlPayload, Packet, RelayCommand, RelayPayload};
use crate::rsa_wrap::wrap_key;
use crate::tables::SenderKeyTable;

/// Send `request` and await the matching reply on `stream`, retrying the
/// whole send/receive round trip up to `limits::MAX_RETRIES` times on a
/// timeout before giving up (spec.md §7's "Network transient" handling:
/// "timeout on a per-hop send or receive → retry up to 3 times, then
/// abort the whole multi-hop operation and surface to the client"). Any
/// non-timeout error is not retried — it propagates immediately.
async fn round_trip(stream: &mut TcpStream, request: &Packet, timeout: Duration) -> Result<Packet> {
    let mut attempt = 0;
    loop {
        let outcome: Result<Packet> = async {
            write_packet(stream, request, timeout).await?;
            read_packet(stream, timeout).await
        }
        .await;
        match outcome {
            Ok(packet) => return Ok(packet),
            Err(OnionMeshError::Timeout) if attempt < limits::MAX_RETRIES => {
                attempt += 1;
                debug!(attempt, "per-hop round trip timed out, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// A successfully built circuit: the single persistent stream to the
/// entry relay, plus the per-hop keys needed to wrap and unwrap layers
/// (spec.md §4.3's `sender_key_table`). Ordering of `keys` is load-
/// bearing — index `i` is hop `i`, added last on the way out and peeled
/// first on the way in.
pub struct Circuit {
    stream: TcpStream,
    circ_id: u32,
    keys: Vec<LayerKey>,
    sender_key_table: SenderKeyTable,
}

impl Circuit {
    pub fn hop_count(&self) -> usize {
        self.keys.len()
    }

    /// The circID this circuit uses on its entry leg — callers need it
    /// to look up per-hop keys in `sender_key_table()`.
    pub fn circ_id(&self) -> u32 {
        self.circ_id
    }

    pub fn sender_key_table(&self) -> &SenderKeyTable {
        &self.sender_key_table
    }

    /// Tunnel `request` through the circuit and return the exit's
    /// response bytes, fully unwrapped (spec.md §4.3's data-tunneling
    /// pseudocode, invariant #2 of §8).
    pub async fn send_request(&mut self, request: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let mut payload = RelayPayload::for_relay_data(request).to_layer_bytes();
        for key in self.keys.iter().rev() {
            payload = encrypt_sym(key, &payload)?;
        }

        let request = Packet::Relay {
            circ_id: self.circ_id,
            command: RelayCommand::RelayData,
            encrypted_data: payload,
        };
        let response = round_trip(&mut self.stream, &request, timeout).await?;
        let mut ciphertext = match response {
            Packet::Relay {
                command: RelayCommand::RelayAns,
                encrypted_data,
                ..
            } => encrypted_data,
            other => {
                return Err(OnionMeshError::protocol(format!(
                    "expected relay_ans, got {other:?}"
                )))
            }
        };
        for key in &self.keys {
            ciphertext = decrypt_sym(key, &ciphertext)?;
        }
        Ok(RelayPayload::from_layer_bytes(&ciphertext)?.data)
    }

    /// Tear the circuit down: `destroy` on the entry leg causes every
    /// relay along the path to cascade the teardown (spec.md §4.2's
    /// destroy handling).
    pub async fn close(mut self, timeout: Duration) -> Result<()> {
        write_packet(
            &mut self.stream,
            &Packet::Control {
                circ_id: self.circ_id,
                command: ControlCommand::Destroy,
                payload: ControlPayload::Empty,
            },
            timeout,
        )
        .await
    }
}

/// Select `hop_count` relays from the directory's registry at random,
/// excluding nothing else (the directory never lists the client itself,
/// spec.md §4.3's "Entry-node selection"). Errors if the registry is
/// smaller than requested (scenario S5 of spec.md §8).
pub fn select_hops(
    registry: &[RelayDescriptor],
    hop_count: usize,
) -> Result<Vec<RelayDescriptor>> {
    if registry.len() < hop_count {
        return Err(OnionMeshError::NotEnoughRelays {
            needed: hop_count,
            available: registry.len(),
        });
    }
    use rand::seq::SliceRandom;
    let mut pool: Vec<RelayDescriptor> = registry.to_vec();
    pool.shuffle(&mut rand::thread_rng());
    pool.truncate(hop_count);
    Ok(pool)
}

/// Build a circuit through `hops` in order, telescoping one hop at a
/// time (spec.md §4.3). `hops[0]` is the entry relay; the client opens
/// exactly one TCP connection, to it, for the circuit's whole lifetime.
pub async fn build_circuit(hops: &[RelayDescriptor], timeout: Duration) -> Result<Circuit> {
    if hops.is_empty() {
        return Err(OnionMeshError::protocol("circuit needs at least one hop"));
    }

    let entry_addr: SocketAddr = format!("{}:{}", hops[0].ip, hops[0].port)
        .parse()
        .map_err(|e| OnionMeshError::protocol(format!("bad entry address: {e}")))?;
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(entry_addr))
        .await
        .map_err(|_| OnionMeshError::Timeout)??;

    // The client's own draw is only a placeholder in the wire packet —
    // the entry relay allocates the circID that actually governs this
    // link (collision-avoided against everything else it has open) and
    // returns it in `created`. From that point on, every packet on this
    // stream must carry the *relay's* id, not the client's initial
    // guess (spec.md §3: circIDs are link-local, drawn independently at
    // every hop — here, the hop that accepts the link is the one that
    // draws it).
    let mut keys: Vec<LayerKey> = Vec::with_capacity(hops.len());
    let mut sender_key_table = SenderKeyTable::new();

    // Hop 0: direct create/created with the entry relay.
    let k0 = generate_key();
    let wrapped0 = wrap_key(&hops[0].rsa_public_exp, &hops[0].rsa_modulus, &k0)?;
    let create = Packet::Control {
        circ_id: draw_circ_id(),
        command: ControlCommand::Create,
        payload: ControlPayload::KeyExchange(RelayPayload::for_extend("0", 0, wrapped0)),
    };
    let circ_id = match round_trip(&mut stream, &create, timeout).await? {
        Packet::Control {
            circ_id,
            command: ControlCommand::Created,
            ..
        } => circ_id,
        other => {
            return Err(OnionMeshError::protocol(format!(
                "expected created, got {other:?}"
            )))
        }
    };
    sender_key_table.insert(circ_id, 0, k0);
    keys.push(k0);
    debug!(hop = 0, %entry_addr, "circuit leg created");

    // Hops 1..N: telescoped extend, each wrapped under every prior key.
    for (i, hop) in hops.iter().enumerate().skip(1) {
        let k_i = generate_key();
        let wrapped_i = wrap_key(&hop.rsa_public_exp, &hop.rsa_modulus, &k_i)?;
        let inner = RelayPayload::for_extend(hop.ip.clone(), hop.port, wrapped_i).to_layer_bytes();
        let mut payload = inner;
        for key in keys.iter().rev() {
            payload = encrypt_sym(key, &payload)?;
        }

        let extend = Packet::Relay {
            circ_id,
            command: RelayCommand::Extend,
            encrypted_data: payload,
        };
        let response = round_trip(&mut stream, &extend, timeout).await?;
        let mut ciphertext = match response {
            Packet::Relay {
                command: RelayCommand::Extended,
                encrypted_data,
                ..
            } => encrypted_data,
            other => {
                return Err(OnionMeshError::protocol(format!(
                    "expected extended, got {other:?}"
                )))
            }
        };
        for key in &keys {
            ciphertext = decrypt_sym(key, &ciphertext)?;
        }
        // `ciphertext` is now hop i's `created` padding; its content is
        // discarded (the handshake's purpose was key agreement, already
        // complete once RSA-unwrap succeeded at the far end).

        sender_key_table.insert(circ_id, i, k_i);
        keys.push(k_i);
        debug!(hop = i, ip = %hop.ip, port = hop.port, "circuit leg extended");
    }

    info!(hops = hops.len(), "circuit built");
    Ok(Circuit {
        stream,
        circ_id,
        keys,
        sender_key_table,
    })
}

fn draw_circ_id() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen_range(0..=limits::MAX_CIRC_ID)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(port: u16) -> RelayDescriptor {
        RelayDescriptor::new("127.0.0.1", port, "65537".into(), "123".into())
    }

    #[test]
    fn select_hops_errors_when_registry_too_small() {
        let registry = vec![descriptor(9001), descriptor(9002)];
        let err = select_hops(&registry, 3).unwrap_err();
        assert!(matches!(err, OnionMeshError::NotEnoughRelays { needed: 3, available: 2 }));
    }

    #[test]
    fn select_hops_returns_exactly_the_requested_count() {
        let registry = vec![descriptor(9001), descriptor(9002), descriptor(9003)];
        let hops = select_hops(&registry, 2).unwrap();
        assert_eq!(hops.len(), 2);
    }

    #[tokio::test]
    async fn round_trip_retries_on_timeout_and_eventually_succeeds() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            // Ignore every request but the last allowed retry, forcing the
            // client through its full retry budget before it sees a reply.
            for _ in 0..limits::MAX_RETRIES {
                let _ = read_packet(&mut server, Duration::from_secs(5)).await;
            }
            let _ = read_packet(&mut server, Duration::from_secs(5)).await;
            let reply = Packet::Control {
                circ_id: 1,
                command: ControlCommand::Created,
                payload: ControlPayload::Empty,
            };
            write_packet(&mut server, &reply, Duration::from_secs(1))
                .await
                .unwrap();
        });

        let mut client_stream = TcpStream::connect(addr).await.unwrap();
        let request = Packet::Control {
            circ_id: 1,
            command: ControlCommand::Create,
            payload: ControlPayload::Empty,
        };
        let response = round_trip(&mut client_stream, &request, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(matches!(
            response,
            Packet::Control {
                command: ControlCommand::Created,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn round_trip_aborts_after_exhausting_retries() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept but never answer: every attempt the client makes times out.
            let _held = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client_stream = TcpStream::connect(addr).await.unwrap();
        let request = Packet::Control {
            circ_id: 1,
            command: ControlCommand::Create,
            payload: ControlPayload::Empty,
        };
        let result = round_trip(&mut client_stream, &request, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(OnionMeshError::Timeout)));
    }
}
