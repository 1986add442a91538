//! Clients for the guest's TCP monitors.
//!
//! The HMP monitor is only used to ask QEMU to quit. The QMP monitor speaks line-delimited
//! JSON: a greeting, a `qmp_capabilities` handshake, then one response per command with
//! asynchronous events interleaved.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};
use tracing::debug;

/// Upper bound on every connect and read.
pub const MONITOR_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("failed to connect to monitor at {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("monitor at {addr} timed out")]
    Timeout { addr: SocketAddr },

    #[error("monitor i/o failed at {addr}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("monitor at {addr} closed the connection")]
    Closed { addr: SocketAddr },

    #[error("invalid monitor message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("monitor command {command} failed: {class}: {desc}")]
    Command {
        command: String,
        class: String,
        desc: String,
    },

    #[error("unexpected monitor message: {0}")]
    Unexpected(String),
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn connect(addr: SocketAddr) -> Result<TcpStream, MonitorError> {
    timeout(MONITOR_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| MonitorError::Timeout { addr })?
        .map_err(|source| MonitorError::Connect { addr, source })
}

/// Sends `quit` over the human monitor on `127.0.0.1:{port}`.
pub async fn hmp_quit(port: u16) -> Result<(), MonitorError> {
    let addr = local_addr(port);
    let mut stream = connect(addr).await?;
    timeout(MONITOR_TIMEOUT, stream.write_all(b"quit\n"))
        .await
        .map_err(|_| MonitorError::Timeout { addr })?
        .map_err(|source| MonitorError::Io { addr, source })?;
    debug!(%addr, "sent quit to hmp monitor");
    Ok(())
}

/// `query-status` result.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmStatus {
    pub running: bool,
    pub status: String,
}

/// One entry of `query-memory-devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDeviceInfo {
    #[serde(rename = "type")]
    pub dev_type: String,
    pub data: MemoryDeviceData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDeviceData {
    #[serde(default)]
    pub id: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// QOM path of the backend, e.g. `/objects/mem0`.
    pub memdev: String,
    #[serde(default)]
    pub slot: Option<u32>,
}

impl MemoryDeviceData {
    /// Backend object id, the last element of the QOM path.
    pub fn memdev_id(&self) -> &str {
        self.memdev.rsplit('/').next().unwrap_or(&self.memdev)
    }
}

#[derive(Debug, Deserialize)]
struct QmpErrorBody {
    class: String,
    desc: String,
}

pub struct QmpClient {
    addr: SocketAddr,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connects to the QMP monitor on `127.0.0.1:{port}` and completes the handshake.
    pub async fn connect(port: u16) -> Result<Self, MonitorError> {
        Self::connect_addr(local_addr(port)).await
    }

    pub async fn connect_addr(addr: SocketAddr) -> Result<Self, MonitorError> {
        let (reader, writer) = connect(addr).await?.into_split();
        let mut client = Self {
            addr,
            lines: BufReader::new(reader).lines(),
            writer,
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(MonitorError::Unexpected(greeting.to_string()));
        }
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    async fn read_message(&mut self) -> Result<Value, MonitorError> {
        let addr = self.addr;
        loop {
            let line = timeout(MONITOR_TIMEOUT, self.lines.next_line())
                .await
                .map_err(|_| MonitorError::Timeout { addr })?
                .map_err(|source| MonitorError::Io { addr, source })?
                .ok_or(MonitorError::Closed { addr })?;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(&line)?);
        }
    }

    /// Runs one command and returns its `return` value, skipping events.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, MonitorError> {
        let mut request = json!({ "execute": command });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let addr = self.addr;
        timeout(MONITOR_TIMEOUT, self.writer.write_all(&line))
            .await
            .map_err(|_| MonitorError::Timeout { addr })?
            .map_err(|source| MonitorError::Io { addr, source })?;
        debug!(%addr, %command, "qmp command sent");

        loop {
            let mut message = self.read_message().await?;
            if message.get("event").is_some() {
                continue;
            }
            if let Some(ret) = message.get_mut("return") {
                return Ok(ret.take());
            }
            if let Some(error) = message.get_mut("error") {
                let error: QmpErrorBody = serde_json::from_value(error.take())?;
                return Err(MonitorError::Command {
                    command: command.to_owned(),
                    class: error.class,
                    desc: error.desc,
                });
            }
            return Err(MonitorError::Unexpected(message.to_string()));
        }
    }

    async fn query<T: DeserializeOwned>(&mut self, command: &str) -> Result<T, MonitorError> {
        let value = self.execute(command, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn query_status(&mut self) -> Result<VmStatus, MonitorError> {
        self.query("query-status").await
    }

    pub async fn query_memory_devices(&mut self) -> Result<Vec<MemoryDeviceInfo>, MonitorError> {
        self.query("query-memory-devices").await
    }

    /// Points incoming migration at the named TLS credentials object.
    pub async fn migrate_set_tls_creds(&mut self, creds_id: &str) -> Result<(), MonitorError> {
        self.execute(
            "migrate-set-parameters",
            Some(json!({ "tls-creds": creds_id })),
        )
        .await
        .map(|_| ())
    }

    /// Starts listening for a deferred incoming migration.
    pub async fn migrate_incoming(&mut self, uri: &str) -> Result<(), MonitorError> {
        self.execute("migrate-incoming", Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// QEMU may drop the connection before answering.
    pub async fn quit(&mut self) -> Result<(), MonitorError> {
        match self.execute("quit", None).await {
            Ok(_) | Err(MonitorError::Closed { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    /// Answers each request line with the next canned reply.
    async fn fake_qmp(replies: Vec<&'static str>) -> (SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            writer
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\r\n")
                .await
                .unwrap();
            let mut requests = Vec::new();
            for reply in replies {
                let Some(line) = lines.next_line().await.unwrap() else {
                    break;
                };
                requests.push(line);
                writer.write_all(reply.as_bytes()).await.unwrap();
                writer.write_all(b"\r\n").await.unwrap();
            }
            requests
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn query_status_skips_events() {
        let (addr, server) = fake_qmp(vec![
            r#"{"return": {}}"#,
            "{\"event\": \"RESUME\", \"timestamp\": {}}\r\n{\"return\": {\"running\": true, \"status\": \"running\"}}",
        ])
        .await;
        let mut client = QmpClient::connect_addr(addr).await.unwrap();
        let status = client.query_status().await.unwrap();
        assert_eq!(
            status,
            VmStatus {
                running: true,
                status: "running".to_owned()
            }
        );
        let requests = server.await.unwrap();
        assert_eq!(requests[0], r#"{"execute":"qmp_capabilities"}"#);
        assert_eq!(requests[1], r#"{"execute":"query-status"}"#);
    }

    #[tokio::test]
    async fn command_error_is_reported() {
        let (addr, _server) = fake_qmp(vec![
            r#"{"return": {}}"#,
            r#"{"error": {"class": "GenericError", "desc": "no tls creds"}}"#,
        ])
        .await;
        let mut client = QmpClient::connect_addr(addr).await.unwrap();
        let err = client.migrate_set_tls_creds("tls0").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "monitor command migrate-set-parameters failed: GenericError: no tls creds"
        );
    }

    #[tokio::test]
    async fn memory_devices() {
        let (addr, _server) = fake_qmp(vec![
            r#"{"return": {}}"#,
            r#"{"return": [{"type": "dimm", "data": {"id": "dimm0", "size": 1073741824, "memdev": "/objects/mem0", "slot": 0, "addr": 4294967296, "node": 0, "hotplugged": true, "hotpluggable": true}}]}"#,
        ])
        .await;
        let mut client = QmpClient::connect_addr(addr).await.unwrap();
        let devices = client.query_memory_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].dev_type, "dimm");
        assert_eq!(devices[0].data.size, 1 << 30);
        assert_eq!(devices[0].data.memdev_id(), "mem0");
    }

    #[tokio::test]
    async fn hmp_quit_sends_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap()
        });
        hmp_quit(port).await.unwrap();
        assert_eq!(server.await.unwrap().as_deref(), Some("quit"));
    }

    #[tokio::test]
    async fn unreachable_monitor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(matches!(
            hmp_quit(port).await,
            Err(MonitorError::Connect { .. })
        ));
    }
}
