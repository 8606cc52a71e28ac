use crate::packet::Packet;
use onionmesh_common::{OnionMeshError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Packets are capped well above anything a relay legitimately sends, so a
/// corrupt or hostile length prefix can't make us allocate unbounded
/// memory before the timeout even has a chance to fire.
const MAX_PACKET_BYTES: usize = 1 << 20;

/// Write one length-prefixed JSON packet and flush it. The 4-byte
/// big-endian length prefix replaces the balanced-brace scanning the
/// original network used to find message boundaries on its persistent
/// sockets (spec.md §9, Open Questions).
pub async fn write_packet<W>(writer: &mut W, packet: &Packet, timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = packet.to_json_string()?.into_bytes();
    let len = u32::try_from(body.len())
        .map_err(|_| OnionMeshError::protocol("packet too large to frame"))?;

    tokio::time::timeout(timeout, async {
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| OnionMeshError::Timeout)??;
    Ok(())
}

/// Read one length-prefixed JSON packet. An orderly EOF before any bytes
/// arrive is reported as `ConnectionClosed`; an EOF mid-frame is a
/// protocol violation.
pub async fn read_packet<R>(reader: &mut R, timeout: Duration) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let read_result = tokio::time::timeout(timeout, reader.read_exact(&mut len_buf)).await;
    match read_result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(OnionMeshError::ConnectionClosed);
        }
        Ok(Err(e)) => return Err(OnionMeshError::Io(e)),
        Err(_) => return Err(OnionMeshError::Timeout),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PACKET_BYTES {
        return Err(OnionMeshError::protocol(format!(
            "packet length {len} exceeds max {MAX_PACKET_BYTES}"
        )));
    }

    let mut body = vec![0u8; len];
    tokio::time::timeout(timeout, reader.read_exact(&mut body))
        .await
        .map_err(|_| OnionMeshError::Timeout)??;

    let text = String::from_utf8(body)
        .map_err(|e| OnionMeshError::protocol(format!("packet body not utf8: {e}")))?;
    Packet::from_json_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ControlCommand, ControlPayload, RelayPayload};
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn writes_and_reads_back_a_packet() {
        let (mut a, mut b) = duplex(4096);
        let packet = Packet::Control {
            circ_id: 5,
            command: ControlCommand::Create,
            payload: ControlPayload::KeyExchange(RelayPayload::for_extend(
                "127.0.0.1",
                9001,
                vec![1, 2, 3, 4],
            )),
        };
        write_packet(&mut a, &packet, Duration::from_secs(1))
            .await
            .unwrap();
        let received = read_packet(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(packet, received);
    }

    #[tokio::test]
    async fn read_times_out_on_silence() {
        let (_a, mut b) = duplex(4096);
        let result = read_packet(&mut b, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(OnionMeshError::Timeout)));
    }

    #[tokio::test]
    async fn closed_stream_reports_connection_closed() {
        let (a, mut b) = duplex(4096);
        drop(a);
        let result = read_packet(&mut b, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(OnionMeshError::ConnectionClosed)));
    }
}
