use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use syspulse_proto::Snapshot;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{Message, protocol::CloseFrame},
};
use tokio_util::sync::CancellationToken;

pub type PushChannel = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn subscribe(server_addr: &str) -> anyhow::Result<PushChannel> {
    let url = format!("ws://{server_addr}/ws");
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    info!("subscribed to {url}");
    Ok(socket)
}

/// Log every snapshot until the server closes the channel (`Err`) or
/// `shutdown` fires (`Ok`).
pub async fn follow(socket: PushChannel, shutdown: &CancellationToken) -> anyhow::Result<()> {
    let (mut write, mut read) = socket.split();

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => {
                write.send(Message::Close(None)).await.ok();
                write.close().await.ok();
                return Ok(());
            }
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                let snapshot: Snapshot = serde_json::from_str(text.as_str())?;
                info!("{}", summarize(&snapshot));
            }
            Some(Ok(Message::Close(frame))) => {
                if let Some(CloseFrame { code, reason }) = frame {
                    warn!("push channel closed by server: code={code:?}, reason={reason}");
                }
                anyhow::bail!("push channel closed");
            }
            Some(Ok(other)) => debug!("ignoring frame: {other:?}"),
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("push channel ended"),
        }
    }
}

/// One-line digest of a snapshot.
pub fn summarize(snapshot: &Snapshot) -> String {
    let busy = if snapshot.cpu.is_empty() {
        0.0
    } else {
        snapshot
            .cpu
            .iter()
            .map(|core| 100.0 - core.utilization.idle)
            .sum::<f64>()
            / snapshot.cpu.len() as f64
    };
    let address = snapshot
        .network
        .private_address
        .map_or_else(|| "no address".to_owned(), |a| a.to_string());

    format!(
        "{host} | cpu {busy:.1}% ({cores} cores) | mem {mem_pct:.2}% of {mem} | disk {disk_pct:.2}% of {disk} | up {uptime} | {address}",
        host = snapshot.os.hostname,
        cores = snapshot.cpu.len(),
        mem_pct = snapshot.memory.used_percent,
        mem = snapshot.memory.total,
        disk_pct = snapshot.disk.used_percent,
        disk = snapshot.disk.total,
        uptime = snapshot.uptime_formatted,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    const SNAPSHOT: &str = r#"{
        "sampledAt": "2024-05-01T10:00:00Z",
        "os": {"platform": "linux", "kernelType": "Linux", "releaseVersion": "6.1.0",
               "architecture": "x86_64", "hostname": "pi"},
        "cpu": [
            {"coreIndex": 1, "model": "ARM", "clockSpeedMhz": 1500,
             "utilization": {"user": 20.0, "system": 10.0, "idle": 70.0, "other": 0.0},
             "times": {"user": 200, "nice": 0, "system": 100, "idle": 700,
                       "iowait": 0, "irq": 0, "softirq": 0, "steal": 0}},
            {"coreIndex": 2, "model": "ARM", "clockSpeedMhz": 1500,
             "utilization": {"user": 5.0, "system": 5.0, "idle": 90.0, "other": 0.0},
             "times": {"user": 50, "nice": 0, "system": 50, "idle": 900,
                       "iowait": 0, "irq": 0, "softirq": 0, "steal": 0}}
        ],
        "memory": {"total": "4.00 GB", "free": "1.00 GB", "used": "3.00 GB",
                   "totalBytes": 4294967296, "freeBytes": 1073741824, "usedBytes": 3221225472,
                   "usedPercent": 75.0, "freePercent": 25.0},
        "disk": {"total": "N/A", "free": "N/A", "used": "N/A",
                 "totalBytes": 0, "freeBytes": 0, "usedBytes": 0,
                 "usedPercent": 0.0, "freePercent": 0.0},
        "network": {"privateAddress": "192.168.1.20", "hostname": "pi", "interfaceTable": []},
        "uptimeSeconds": 90061,
        "uptimeFormatted": "1d 1h 1m 1s"
    }"#;

    #[test]
    fn test_summarize() {
        let snapshot: Snapshot = serde_json::from_str(SNAPSHOT).expect("valid snapshot");
        assert_eq!(
            summarize(&snapshot),
            "pi | cpu 20.0% (2 cores) | mem 75.00% of 4.00 GB | disk 0.00% of N/A | up 1d 1h 1m 1s | 192.168.1.20"
        );
    }

    #[test]
    fn test_summarize_without_cpu_or_address() {
        let mut snapshot: Snapshot = serde_json::from_str(SNAPSHOT).expect("valid snapshot");
        snapshot.cpu.clear();
        snapshot.network.private_address = None;

        let line = summarize(&snapshot);
        assert!(line.contains("cpu 0.0% (0 cores)"), "{line}");
        assert!(line.ends_with("no address"), "{line}");
    }
}
