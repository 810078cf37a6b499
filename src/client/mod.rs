//! Prodigy protocol client: transport and request broker
//!
//! One TCP connection, newline framing, one request in flight. The broker
//! allocates 4-hex request IDs from a wrapping counter, writes the request,
//! and reads reply lines until the ID matches; a stale reply (left over from
//! a timed-out request) is discarded with a warning instead of failing the
//! exchange.
//!
//! The server accepts a single client at a time, so the driver never opens a
//! second connection; after a transport failure the connection is marked
//! broken and an explicit reconnect is required.

pub mod data;
pub mod parameters;

use crate::common::ServerIdentity;
use crate::config::DriverConfig;
use crate::protocol::{self, ProtocolError, ReplyBody, Request, Value};
use parameters::{ParameterMirror, ValueType};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot reach Prodigy server at {address}: {source}")]
    Unavailable {
        address: String,
        source: std::io::Error,
    },

    #[error("not connected")]
    NotConnected,

    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("connection lost during {command}")]
    ConnectionLost { command: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("unsupported protocol version {major}.{minor} (driver requires major 1)")]
    VersionMismatch { major: u32, minor: u32 },

    #[error("reply missing field {0:?}")]
    MissingField(String),

    #[error("field {field:?} has unparsable value {value:?}")]
    BadValue { field: String, value: String },

    #[error("unknown analyzer parameter {0:?}")]
    UnknownParameter(String),

    #[error("analyzer parameter {name:?} is {expected:?}, not {requested:?}")]
    TypeMismatch {
        name: String,
        expected: ValueType,
        requested: ValueType,
    },
}

/// Exchange counters, shared with the status surface
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Completed request-reply exchanges
    pub exchanges: AtomicU64,
    /// Stale replies discarded on ID mismatch
    pub stale_replies: AtomicU64,
}

/// Outcome fields of a successful exchange
#[derive(Debug, Clone)]
pub struct Outcome {
    fields: Vec<(String, String)>,
}

impl Outcome {
    /// Look up a field by exact key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Field that must be present
    pub fn require(&self, key: &str) -> Result<&str, ClientError> {
        self.get(key)
            .ok_or_else(|| ClientError::MissingField(key.to_string()))
    }

    /// Parse a required field
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<T, ClientError> {
        let raw = self.require(key)?;
        raw.parse().map_err(|_| ClientError::BadValue {
            field: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// Parse an optional field, with a default when absent
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ClientError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ClientError::BadValue {
                field: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }
}

/// The single connection to the Prodigy server
#[derive(Debug)]
pub struct ProdigyClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    next_id: u16,
    connected: bool,
    metrics: Arc<ClientMetrics>,
    identity: ServerIdentity,
    pub(crate) mirror: ParameterMirror,
}

impl ProdigyClient {
    /// Open the TCP connection and perform the `Connect` handshake
    ///
    /// Stores the server name and protocol version from the reply and
    /// refuses to operate when the protocol major version is not 1. The
    /// analyzer visible name is read best-effort (older servers do not
    /// implement the command).
    pub async fn connect(config: &DriverConfig) -> Result<Self, ClientError> {
        let address = config.address();
        let stream =
            TcpStream::connect(&address)
                .await
                .map_err(|source| ClientError::Unavailable {
                    address: address.clone(),
                    source,
                })?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout: config.timeout(),
            next_id: 1,
            connected: true,
            metrics: Arc::new(ClientMetrics::default()),
            identity: ServerIdentity::default(),
            mirror: ParameterMirror::default(),
        };

        let outcome = client.exchange("Connect", &[]).await?;
        let server_name = outcome.get("ServerName").unwrap_or_default().to_string();
        let version_raw = outcome.require("ProtocolVersion")?.to_string();
        let (major, minor) = parse_protocol_version(&version_raw).ok_or(ClientError::BadValue {
            field: "ProtocolVersion".to_string(),
            value: version_raw,
        })?;
        if major != 1 {
            return Err(ClientError::VersionMismatch { major, minor });
        }

        let visible_name = match client.exchange("GetAnalyzerVisibleName", &[]).await {
            Ok(outcome) => outcome.get("VisibleName").unwrap_or_default().to_string(),
            Err(ClientError::Protocol(e)) => {
                warn!(error = %e, "GetAnalyzerVisibleName not available");
                String::new()
            }
            Err(e) => return Err(e),
        };

        client.identity = ServerIdentity {
            server_name,
            protocol_major: major,
            protocol_minor: minor,
            visible_name,
        };

        info!(
            address = %address,
            server = %client.identity.server_name,
            version = format!("{}.{}", major, minor),
            "Connected to Prodigy server"
        );
        Ok(client)
    }

    /// Send `Disconnect` and drop the connection
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if self.connected {
            // best effort: the peer may already be gone
            if let Err(e) = self.exchange("Disconnect", &[]).await {
                warn!(error = %e, "Disconnect command failed");
            }
            self.connected = false;
            let _ = self.writer.shutdown().await;
        }
        Ok(())
    }

    /// Server identity captured during the handshake
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Exchange counters
    pub fn metrics(&self) -> Arc<ClientMetrics> {
        Arc::clone(&self.metrics)
    }

    /// True while the transport is believed usable
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Perform one request-reply exchange
    ///
    /// Holds the connection for the whole exchange: write the request line,
    /// then read reply lines until one carries the allocated ID. A reply
    /// with a different ID is stale and is discarded. A server `Error` reply
    /// surfaces as [`ProtocolError::Server`] with its code and message; the
    /// broker never retries.
    pub async fn exchange(
        &mut self,
        command: &str,
        args: &[(&str, Value)],
    ) -> Result<Outcome, ClientError> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let mut request = Request::new(id, command);
        for (key, value) in args {
            request = request.arg(*key, value.clone());
        }
        let line = request.format();
        debug!(tx = %line, "Request");

        let result = tokio::time::timeout(self.timeout, self.write_then_read(&line, id)).await;

        let reply = match result {
            Err(_) => {
                return Err(ClientError::Timeout {
                    command: command.to_string(),
                    timeout: self.timeout,
                })
            }
            Ok(Err(e)) => {
                self.connected = false;
                return Err(match e {
                    ClientError::ConnectionLost { .. } => ClientError::ConnectionLost {
                        command: command.to_string(),
                    },
                    other => other,
                });
            }
            Ok(Ok(reply)) => reply,
        };

        self.metrics.exchanges.fetch_add(1, Ordering::Relaxed);

        match reply.body {
            ReplyBody::Ok(fields) => Ok(Outcome { fields }),
            ReplyBody::Error { code, message } => {
                Err(ClientError::Protocol(ProtocolError::Server { code, message }))
            }
        }
    }

    async fn write_then_read(
        &mut self,
        line: &str,
        id: u16,
    ) -> Result<protocol::Reply, ClientError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut buffer = String::new();
        loop {
            buffer.clear();
            let n = self.reader.read_line(&mut buffer).await?;
            if n == 0 {
                return Err(ClientError::ConnectionLost {
                    command: String::new(),
                });
            }
            let raw = buffer.trim_end_matches(['\n', '\r']);
            debug!(rx = %raw, "Reply");

            let reply = match protocol::parse_reply(raw) {
                Ok(reply) => reply,
                Err(e) => {
                    // the line stream cannot be trusted after a framing error
                    self.connected = false;
                    return Err(e.into());
                }
            };

            if reply.id != id {
                self.metrics.stale_replies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    expected = format!("{:04X}", id),
                    got = format!("{:04X}", reply.id),
                    "Discarding stale reply"
                );
                continue;
            }
            return Ok(reply);
        }
    }
}

/// Parse `ProtocolVersion:<major>.<minor>`
fn parse_protocol_version(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    /// Serve scripted reply lines: for each accepted request line, pop the
    /// next canned replies (several lines may answer one request, to test
    /// stale-reply discarding).
    async fn scripted_server(replies: Vec<Vec<String>>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = tokio::io::BufReader::new(read_half).lines();
            let mut replies = replies.into_iter();
            while let Ok(Some(_line)) = lines.next_line().await {
                match replies.next() {
                    Some(batch) => {
                        for reply in batch {
                            write_half
                                .write_all(format!("{}\n", reply).as_bytes())
                                .await
                                .unwrap();
                        }
                    }
                    None => break,
                }
            }
        });
        addr
    }

    fn config_for(addr: std::net::SocketAddr) -> DriverConfig {
        DriverConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            timeout_s: 1.0,
            ..DriverConfig::default()
        }
    }

    #[tokio::test]
    async fn handshake_records_identity() {
        let addr = scripted_server(vec![
            vec![r#"!0001 OK: ServerName:"Prodigy Test" ProtocolVersion:1.22"#.to_string()],
            vec![r#"!0002 OK: VisibleName:"KREIOS 150""#.to_string()],
        ])
        .await;

        let client = ProdigyClient::connect(&config_for(addr)).await.unwrap();
        assert_eq!(client.identity().server_name, "Prodigy Test");
        assert_eq!(client.identity().protocol_major, 1);
        assert_eq!(client.identity().protocol_minor, 22);
        assert_eq!(client.identity().visible_name, "KREIOS 150");
    }

    #[tokio::test]
    async fn handshake_refuses_wrong_major() {
        let addr = scripted_server(vec![vec![
            r#"!0001 OK: ServerName:"X" ProtocolVersion:2.0"#.to_string(),
        ]])
        .await;

        let err = ProdigyClient::connect(&config_for(addr)).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::VersionMismatch { major: 2, minor: 0 }
        ));
    }

    #[tokio::test]
    async fn stale_reply_is_discarded() {
        let addr = scripted_server(vec![
            vec![r#"!0001 OK: ServerName:"X" ProtocolVersion:1.2"#.to_string()],
            vec!["!0002 OK".to_string()],
            // request 0003 first receives a stale reply for 00FF
            vec![
                "!00FF OK: Leftover:1".to_string(),
                "!0003 OK: Fresh:1".to_string(),
            ],
        ])
        .await;

        let mut client = ProdigyClient::connect(&config_for(addr)).await.unwrap();
        let outcome = client.exchange("ClearSpectrum", &[]).await.unwrap();
        assert_eq!(outcome.get("Fresh"), Some("1"));
        assert_eq!(
            client.metrics().stale_replies.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn server_error_carries_code_and_message() {
        let addr = scripted_server(vec![
            vec![r#"!0001 OK: ServerName:"X" ProtocolVersion:1.2"#.to_string()],
            vec!["!0002 OK".to_string()],
            vec![r#"!0003 Error: 203 "Spectrum not validated.""#.to_string()],
        ])
        .await;

        let mut client = ProdigyClient::connect(&config_for(addr)).await.unwrap();
        let err = client.exchange("Start", &[]).await.unwrap_err();
        match err {
            ClientError::Protocol(ProtocolError::Server { code, message }) => {
                assert_eq!(code, 203);
                assert_eq!(message, "Spectrum not validated.");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_when_server_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // hold the socket open, never reply
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = config_for(addr);
        config.timeout_s = 0.2;
        let err = ProdigyClient::connect(&config).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
    }

    #[tokio::test]
    async fn peer_close_reports_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let err = ProdigyClient::connect(&config_for(addr)).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::ConnectionLost { .. } | ClientError::Io(_)
        ));
    }

    #[test]
    fn protocol_version_parsing() {
        assert_eq!(parse_protocol_version("1.22"), Some((1, 22)));
        assert_eq!(parse_protocol_version("1.2"), Some((1, 2)));
        assert_eq!(parse_protocol_version("2.0"), Some((2, 0)));
        assert_eq!(parse_protocol_version("nope"), None);
    }
}
