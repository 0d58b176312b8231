use lib_common::ingest::SectionStatus;
use lib_common::{IngestError, IngestOutcome, Ingestor};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8 * 1024;

/// Limits applied while receiving one message.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub read_timeout: Duration,
    pub max_message_bytes: usize,
}

/// Site id for a peer: first three IPv4 octets without their last digit.
/// Agents of one site sit in neighbouring /24 blocks that share this prefix.
pub fn client_id_from_addr(addr: &SocketAddr) -> String {
    let ip = match addr.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        ip => ip,
    };
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            let mut id = format!("{a}.{b}.{c}");
            id.pop();
            id
        }
        IpAddr::V6(v6) => v6.to_string(),
    }
}

/// Reads until the peer closes its write side.
pub async fn read_message<R>(reader: &mut R, settings: &ConnectionSettings) -> Result<Vec<u8>, IngestError>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match tokio::time::timeout(settings.read_timeout, reader.read(&mut chunk)).await {
            Err(_) => {
                return Err(IngestError::TransportFailure(format!(
                    "no data for {}s",
                    settings.read_timeout.as_secs()
                )));
            }
            Ok(Err(e)) => return Err(IngestError::TransportFailure(e.to_string())),
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            break;
        }
        if message.len() + n > settings.max_message_bytes {
            return Err(IngestError::TransportFailure(format!(
                "message exceeds {} bytes",
                settings.max_message_bytes
            )));
        }
        message.extend_from_slice(&chunk[..n]);
    }

    Ok(message)
}

/// Receives one message from `stream`, runs it through the ingestor and
/// closes the connection. No acknowledgment is sent.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    ingestor: &Ingestor,
    settings: &ConnectionSettings,
) -> Result<IngestOutcome, IngestError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_id = client_id_from_addr(&peer);
    log::debug!("Connection from {} (client {})", peer, client_id);

    let result = match read_message(&mut stream, settings).await {
        Ok(raw) => ingestor.process(&client_id, &raw).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(outcome) => {
            log::info!("{}", outcome);
            for report in &outcome.sections {
                if let SectionStatus::Failed(e) = &report.status {
                    log::warn!("{}: section {} failed: {}", outcome.key, report.section, e);
                }
            }
        }
        Err(e) => log::error!("Message from {} rejected: {}", peer, e),
    }

    if let Err(e) = stream.shutdown().await {
        log::debug!("Closing connection from {}: {}", peer, e);
    }
    result
}
