use data_encoding::BASE64URL_NOPAD;
use onionmesh_common::{OnionMeshError, RelayDescriptor, Result};
use serde_json::{json, Value};

/// The three control-channel operations a relay's switchboard understands
/// (spec.md §4.2, `node_switchboard.py`'s `control/*` branch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Create,
    Created,
    Destroy,
}

impl ControlCommand {
    fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Create => "create",
            ControlCommand::Created => "created",
            ControlCommand::Destroy => "destroy",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(ControlCommand::Create),
            "created" => Ok(ControlCommand::Created),
            "destroy" => Ok(ControlCommand::Destroy),
            other => Err(OnionMeshError::protocol(format!("unknown control command: {other}"))),
        }
    }
}

/// The four relay-channel operations (spec.md §4.2, `node_switchboard.py`'s
/// `relay/*` branch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    Extend,
    Extended,
    RelayData,
    RelayAns,
}

impl RelayCommand {
    fn as_str(self) -> &'static str {
        match self {
            RelayCommand::Extend => "extend",
            RelayCommand::Extended => "extended",
            RelayCommand::RelayData => "relay_data",
            RelayCommand::RelayAns => "relay_ans",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "extend" => Ok(RelayCommand::Extend),
            "extended" => Ok(RelayCommand::Extended),
            "relay_data" => Ok(RelayCommand::RelayData),
            "relay_ans" => Ok(RelayCommand::RelayAns),
            other => Err(OnionMeshError::protocol(format!("unknown relay command: {other}"))),
        }
    }
}

/// The `{ip, port, data}` shape carried inside a `create`/`extend` payload
/// (and, with `ip`/`port` both zeroed, inside a `relay_data`/`relay_ans`
/// payload) — spec.md §4.4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPayload {
    pub ip: String,
    pub port: u16,
    pub data: Vec<u8>,
}

impl RelayPayload {
    pub fn for_extend(ip: impl Into<String>, port: u16, wrapped_key: Vec<u8>) -> Self {
        Self {
            ip: ip.into(),
            port,
            data: wrapped_key,
        }
    }

    pub fn for_relay_data(request: Vec<u8>) -> Self {
        Self {
            ip: "0".to_string(),
            port: 0,
            data: request,
        }
    }

    /// Encode as the bytes carried *inside* one layer of symmetric
    /// encryption (spec.md §4.3's `{isDecrypted:true, ip, port, data}`
    /// shape). A successful `decrypt_sym` followed by a successful parse
    /// here is what a node uses to recognize "this layer was mine" —
    /// the AEAD auth tag already proved that; this just recovers the
    /// structured payload.
    pub fn to_layer_bytes(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }

    pub fn from_layer_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| OnionMeshError::protocol(format!("layer payload not utf8: {e}")))?;
        let value: Value = serde_json::from_str(text)
            .map_err(|e| OnionMeshError::serialization(e.to_string()))?;
        Self::from_value(&value)
    }

    /// spec.md §6 calls for base64url encoding of the binary `data`
    /// specifically (exit response bytes are the motivating case); the
    /// rest of the envelope uses plain hex (see `Packet::to_value`)
    /// since §4.4 leaves the general encoding to sender/receiver
    /// agreement and only singles out this one field.
    pub(crate) fn to_value(&self) -> Value {
        json!({
            "ip": self.ip,
            "port": self.port,
            "data": BASE64URL_NOPAD.encode(&self.data),
        })
    }

    fn from_value(v: &Value) -> Result<Self> {
        let ip = v
            .get("ip")
            .and_then(Value::as_str)
            .ok_or_else(|| OnionMeshError::protocol("relay payload missing ip"))?
            .to_string();
        let port = v
            .get("port")
            .and_then(Value::as_u64)
            .ok_or_else(|| OnionMeshError::protocol("relay payload missing port"))? as u16;
        let data_b64 = v
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| OnionMeshError::protocol("relay payload missing data"))?;
        let data = BASE64URL_NOPAD
            .decode(data_b64.as_bytes())
            .map_err(|e| OnionMeshError::protocol(format!("relay payload data not base64url: {e}")))?;
        Ok(Self { ip, port, data })
    }
}

/// The payload of a `control` packet: either the `{ip, port, data}` shape
/// (a `create`) or opaque padding (a `created` reply). `destroy` carries
/// none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPayload {
    KeyExchange(RelayPayload),
    Opaque(Vec<u8>),
    Empty,
}

/// One packet as read from or written to the wire (spec.md §4.4). A single
/// persistent TCP stream per circuit leg carries these length-prefixed and
/// JSON-encoded (see `codec`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Control {
        circ_id: u32,
        command: ControlCommand,
        payload: ControlPayload,
    },
    Relay {
        circ_id: u32,
        command: RelayCommand,
        encrypted_data: Vec<u8>,
    },
    DirQuery,
    DirUpdate(RelayDescriptor),
    DirAnswer {
        updated: u64,
        nodes: Vec<RelayDescriptor>,
    },
}

impl Packet {
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(&self.to_value())
            .map_err(|e| OnionMeshError::serialization(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| OnionMeshError::serialization(e.to_string()))?;
        Self::from_value(&value)
    }

    fn to_value(&self) -> Value {
        match self {
            Packet::Control {
                circ_id,
                command,
                payload,
            } => {
                let payload_value = match payload {
                    ControlPayload::KeyExchange(p) => p.to_value(),
                    ControlPayload::Opaque(bytes) => Value::String(hex::encode(bytes)),
                    ControlPayload::Empty => Value::Null,
                };
                json!({
                    "type": "control",
                    "circID": circ_id,
                    "command": command.as_str(),
                    "payload": payload_value,
                })
            }
            Packet::Relay {
                circ_id,
                command,
                encrypted_data,
            } => json!({
                "type": "relay",
                "circID": circ_id,
                "command": command.as_str(),
                "encrypted_data": hex::encode(encrypted_data),
            }),
            Packet::DirQuery => json!({
                "type": "dir",
                "command": "dir_query",
            }),
            Packet::DirUpdate(descriptor) => json!({
                "type": "dir",
                "command": "dir_update",
                "ip": descriptor.ip,
                "port": descriptor.port,
                "public_exp": descriptor.rsa_public_exp,
                "modulus": descriptor.rsa_modulus,
            }),
            Packet::DirAnswer { updated, nodes } => json!({
                "type": "dir",
                "command": "dir_answer",
                "updated": updated,
                "table": {
                    "nodes in network": nodes,
                },
            }),
        }
    }

    fn from_value(v: &Value) -> Result<Self> {
        let kind = v
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| OnionMeshError::protocol("packet missing type"))?;
        match kind {
            "control" => {
                let circ_id = read_circ_id(v)?;
                let command = ControlCommand::parse(read_str(v, "command")?)?;
                let payload_value = v.get("payload").unwrap_or(&Value::Null);
                let payload = match (command, payload_value) {
                    (_, Value::Null) => ControlPayload::Empty,
                    (ControlCommand::Create, value) => {
                        ControlPayload::KeyExchange(RelayPayload::from_value(value)?)
                    }
                    (_, Value::String(hex_str)) => ControlPayload::Opaque(
                        hex::decode(hex_str)
                            .map_err(|e| OnionMeshError::protocol(format!("bad hex payload: {e}")))?,
                    ),
                    (_, value) => ControlPayload::KeyExchange(RelayPayload::from_value(value)?),
                };
                Ok(Packet::Control {
                    circ_id,
                    command,
                    payload,
                })
            }
            "relay" => {
                let circ_id = read_circ_id(v)?;
                let command = RelayCommand::parse(read_str(v, "command")?)?;
                let encrypted_data = hex::decode(read_str(v, "encrypted_data")?)
                    .map_err(|e| OnionMeshError::protocol(format!("bad hex relay data: {e}")))?;
                Ok(Packet::Relay {
                    circ_id,
                    command,
                    encrypted_data,
                })
            }
            "dir" => {
                let command = read_str(v, "command")?;
                match command {
                    "dir_query" => Ok(Packet::DirQuery),
                    "dir_update" => Ok(Packet::DirUpdate(RelayDescriptor::new(
                        read_str(v, "ip")?.to_string(),
                        v.get("port")
                            .and_then(Value::as_u64)
                            .ok_or_else(|| OnionMeshError::protocol("dir_update missing port"))?
                            as u16,
                        read_str(v, "public_exp")?.to_string(),
                        read_str(v, "modulus")?.to_string(),
                    ))),
                    "dir_answer" => {
                        let updated = v
                            .get("updated")
                            .and_then(Value::as_u64)
                            .ok_or_else(|| OnionMeshError::protocol("dir_answer missing updated"))?;
                        let nodes_value = v
                            .get("table")
                            .and_then(|t| t.get("nodes in network"))
                            .ok_or_else(|| OnionMeshError::protocol("dir_answer missing table"))?;
                        let nodes: Vec<RelayDescriptor> = serde_json::from_value(nodes_value.clone())
                            .map_err(|e| OnionMeshError::serialization(e.to_string()))?;
                        Ok(Packet::DirAnswer { updated, nodes })
                    }
                    other => Err(OnionMeshError::protocol(format!("unknown dir command: {other}"))),
                }
            }
            other => Err(OnionMeshError::protocol(format!("unknown packet type: {other}"))),
        }
    }
}

fn read_str<'a>(v: &'a Value, field: &str) -> Result<&'a str> {
    v.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| OnionMeshError::protocol(format!("packet missing field: {field}")))
}

fn read_circ_id(v: &Value) -> Result<u32> {
    v.get("circID")
        .and_then(Value::as_u64)
        .ok_or_else(|| OnionMeshError::protocol("packet missing circID"))
        .map(|n| n as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_create_round_trips() {
        let packet = Packet::Control {
            circ_id: 42,
            command: ControlCommand::Create,
            payload: ControlPayload::KeyExchange(RelayPayload::for_extend(
                "10.0.0.2",
                9001,
                vec![1, 2, 3],
            )),
        };
        let json = packet.to_json_string().unwrap();
        let parsed = Packet::from_json_str(&json).unwrap();
        assert_eq!(packet, parsed);
    }

    #[test]
    fn relay_extend_round_trips() {
        let packet = Packet::Relay {
            circ_id: 7,
            command: RelayCommand::Extend,
            encrypted_data: vec![9, 9, 9, 0],
        };
        let json = packet.to_json_string().unwrap();
        assert_eq!(packet, Packet::from_json_str(&json).unwrap());
    }

    #[test]
    fn dir_update_round_trips() {
        let descriptor = RelayDescriptor::new("127.0.0.1", 9001, "65537".into(), "123456".into());
        let packet = Packet::DirUpdate(descriptor);
        let json = packet.to_json_string().unwrap();
        assert_eq!(packet, Packet::from_json_str(&json).unwrap());
    }

    #[test]
    fn dir_answer_round_trips_nested_table() {
        let packet = Packet::DirAnswer {
            updated: 3,
            nodes: vec![RelayDescriptor::new(
                "127.0.0.1",
                9001,
                "65537".into(),
                "999".into(),
            )],
        };
        let json = packet.to_json_string().unwrap();
        assert!(json.contains("nodes in network"));
        assert_eq!(packet, Packet::from_json_str(&json).unwrap());
    }

    #[test]
    fn destroy_carries_no_payload() {
        let packet = Packet::Control {
            circ_id: 1,
            command: ControlCommand::Destroy,
            payload: ControlPayload::Empty,
        };
        let json = packet.to_json_string().unwrap();
        assert_eq!(packet, Packet::from_json_str(&json).unwrap());
    }
}
