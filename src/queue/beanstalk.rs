//! beanstalkd client over the text protocol
//!
//! Reservations in beanstalkd belong to the connection that made them, so
//! `reserve`, `delete`, `release`, `bury` and `touch` share one consumer
//! connection. `put`, `stats-tube` and pings go over a separate producer
//! connection and never wait behind a blocking `reserve-with-timeout`.
//! A broken connection is dropped and re-dialed on the next command; any
//! reservations it held are redelivered by the server after their TTR.

use crate::queue::{Broker, BrokerError, BrokerResult, Reserved, TubeStats};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Extra time allowed on top of a server-side reserve timeout
const RESERVE_SLACK: Duration = Duration::from_secs(5);

/// Timeout for every non-blocking command round trip
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

struct Connection {
    stream: BufReader<TcpStream>,
    using: String,
    watching: String,
}

impl Connection {
    async fn open(addr: &str) -> BrokerResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: BufReader::new(stream),
            using: "default".to_string(),
            watching: "default".to_string(),
        })
    }

    async fn send(&mut self, command: &str, body: Option<&[u8]>) -> BrokerResult<()> {
        let writer = self.stream.get_mut();
        writer.write_all(command.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        if let Some(body) = body {
            writer.write_all(body).await?;
            writer.write_all(b"\r\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> BrokerResult<String> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(BrokerError::Unavailable("connection closed".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Reads a `<bytes>`-long payload followed by CRLF
    async fn read_body(&mut self, len: usize) -> BrokerResult<Vec<u8>> {
        let mut body = vec![0u8; len + 2];
        self.stream.read_exact(&mut body).await?;
        if !body.ends_with(b"\r\n") {
            return Err(BrokerError::Protocol("payload not terminated by CRLF".to_string()));
        }
        body.truncate(len);
        Ok(body)
    }

    async fn command(&mut self, command: &str, body: Option<&[u8]>) -> BrokerResult<String> {
        self.send(command, body).await?;
        self.read_line().await
    }

    async fn use_tube(&mut self, tube: &str) -> BrokerResult<()> {
        if self.using == tube {
            return Ok(());
        }
        let response = self.command(&format!("use {}", tube), None).await?;
        expect_prefix(&response, "USING", "use")?;
        self.using = tube.to_string();
        Ok(())
    }

    async fn watch_only(&mut self, tube: &str) -> BrokerResult<()> {
        if self.watching == tube {
            return Ok(());
        }
        let response = self.command(&format!("watch {}", tube), None).await?;
        expect_prefix(&response, "WATCHING", "watch")?;

        let previous = std::mem::replace(&mut self.watching, tube.to_string());
        let response = self.command(&format!("ignore {}", previous), None).await?;
        expect_prefix(&response, "WATCHING", "ignore")?;
        Ok(())
    }
}

fn expect_prefix(response: &str, prefix: &str, command: &str) -> BrokerResult<()> {
    if response.starts_with(prefix) {
        Ok(())
    } else {
        Err(rejected(command, response))
    }
}

fn rejected(command: &str, response: &str) -> BrokerError {
    BrokerError::Rejected {
        command: command.to_string(),
        response: response.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<&str>, response: &str) -> BrokerResult<T> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| BrokerError::Protocol(format!("malformed response '{}'", response)))
}

/// Extracts one counter from a `stats-tube` YAML document
fn yaml_counter(yaml: &str, key: &str) -> u64 {
    yaml.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim() == key)
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Which connection a command travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    /// Commands that never touch a reservation
    Producer,
    /// `reserve` and the commands acting on its reservations
    Consumer,
}

/// beanstalkd-backed [`Broker`]
pub struct BeanstalkBroker {
    addr: String,
    producer: Mutex<Option<Connection>>,
    consumer: Mutex<Option<Connection>>,
}

impl BeanstalkBroker {
    /// Creates a client for `host:port`; connections are dialed lazily
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            producer: Mutex::new(None),
            consumer: Mutex::new(None),
        }
    }

    /// Runs `op` on the live connection, dropping the connection when the
    /// operation fails at the transport level
    async fn with_connection<T, F>(&self, lane: Lane, deadline: Duration, op: F) -> BrokerResult<T>
    where
        F: for<'c> FnOnce(
            &'c mut Connection,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = BrokerResult<T>> + Send + 'c>,
        >,
    {
        let slot = match lane {
            Lane::Producer => &self.producer,
            Lane::Consumer => &self.consumer,
        };
        let mut guard = slot.lock().await;
        if guard.is_none() {
            debug!(addr = %self.addr, ?lane, "Connecting to beanstalkd");
            let connection = tokio::time::timeout(COMMAND_TIMEOUT, Connection::open(&self.addr))
                .await
                .map_err(|_| BrokerError::Unavailable(format!("connect to {} timed out", self.addr)))??;
            *guard = Some(connection);
        }

        let Some(connection) = guard.as_mut() else {
            return Err(BrokerError::Unavailable("no connection".to_string()));
        };

        let result = match tokio::time::timeout(deadline, op(connection)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Unavailable("command timed out".to_string())),
        };

        if matches!(
            result,
            Err(BrokerError::Io(_)) | Err(BrokerError::Unavailable(_)) | Err(BrokerError::Protocol(_))
        ) {
            warn!(addr = %self.addr, ?lane, "Dropping beanstalkd connection after transport error");
            *guard = None;
        }

        result
    }
}

#[async_trait]
impl Broker for BeanstalkBroker {
    async fn ping(&self) -> BrokerResult<()> {
        self.with_connection(Lane::Producer, COMMAND_TIMEOUT, |conn| {
            Box::pin(async move {
                let response = conn.command("list-tubes", None).await?;
                let len: usize = match response.strip_prefix("OK ") {
                    Some(len) => parse_number(Some(len), &response)?,
                    None => return Err(rejected("list-tubes", &response)),
                };
                conn.read_body(len).await?;
                Ok(())
            })
        })
        .await
    }

    async fn put(
        &self,
        tube: &str,
        body: &[u8],
        priority: u32,
        ttr: Duration,
    ) -> BrokerResult<u64> {
        let tube = tube.to_string();
        let body = body.to_vec();
        let ttr = ttr.as_secs().max(1);

        self.with_connection(Lane::Producer, COMMAND_TIMEOUT, move |conn| {
            Box::pin(async move {
                conn.use_tube(&tube).await?;
                let command = format!("put {} 0 {} {}", priority, ttr, body.len());
                let response = conn.command(&command, Some(&body)).await?;
                let mut parts = response.split_whitespace();
                match parts.next() {
                    Some("INSERTED") => parse_number(parts.next(), &response),
                    _ => Err(rejected("put", &response)),
                }
            })
        })
        .await
    }

    async fn reserve(&self, tube: &str, timeout: Duration) -> BrokerResult<Option<Reserved>> {
        let tube = tube.to_string();
        let secs = timeout.as_secs();

        self.with_connection(Lane::Consumer, timeout + RESERVE_SLACK, move |conn| {
            Box::pin(async move {
                conn.watch_only(&tube).await?;
                let response = conn
                    .command(&format!("reserve-with-timeout {}", secs), None)
                    .await?;
                let mut parts = response.split_whitespace();
                match parts.next() {
                    Some("RESERVED") => {
                        let id: u64 = parse_number(parts.next(), &response)?;
                        let len: usize = parse_number(parts.next(), &response)?;
                        let body = conn.read_body(len).await?;
                        Ok(Some(Reserved { id, body }))
                    }
                    // DEADLINE_SOON: one of our reservations is about to expire
                    Some("TIMED_OUT") | Some("DEADLINE_SOON") => Ok(None),
                    _ => Err(rejected("reserve", &response)),
                }
            })
        })
        .await
    }

    async fn delete(&self, id: u64) -> BrokerResult<()> {
        self.with_connection(Lane::Consumer, COMMAND_TIMEOUT, move |conn| {
            Box::pin(async move {
                let response = conn.command(&format!("delete {}", id), None).await?;
                match response.as_str() {
                    "DELETED" => Ok(()),
                    "NOT_FOUND" => Err(BrokerError::NotFound(id)),
                    other => Err(rejected("delete", other)),
                }
            })
        })
        .await
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> BrokerResult<()> {
        let delay = delay.as_secs();
        self.with_connection(Lane::Consumer, COMMAND_TIMEOUT, move |conn| {
            Box::pin(async move {
                let response = conn
                    .command(&format!("release {} {} {}", id, priority, delay), None)
                    .await?;
                match response.as_str() {
                    "RELEASED" | "BURIED" => Ok(()),
                    "NOT_FOUND" => Err(BrokerError::NotFound(id)),
                    other => Err(rejected("release", other)),
                }
            })
        })
        .await
    }

    async fn bury(&self, id: u64) -> BrokerResult<()> {
        self.with_connection(Lane::Consumer, COMMAND_TIMEOUT, move |conn| {
            Box::pin(async move {
                let command = format!("bury {} {}", id, super::DEFAULT_PRIORITY);
                let response = conn.command(&command, None).await?;
                match response.as_str() {
                    "BURIED" => Ok(()),
                    "NOT_FOUND" => Err(BrokerError::NotFound(id)),
                    other => Err(rejected("bury", other)),
                }
            })
        })
        .await
    }

    async fn touch(&self, id: u64) -> BrokerResult<()> {
        self.with_connection(Lane::Consumer, COMMAND_TIMEOUT, move |conn| {
            Box::pin(async move {
                let response = conn.command(&format!("touch {}", id), None).await?;
                match response.as_str() {
                    "TOUCHED" => Ok(()),
                    "NOT_FOUND" => Err(BrokerError::NotFound(id)),
                    other => Err(rejected("touch", other)),
                }
            })
        })
        .await
    }

    async fn stats_tube(&self, tube: &str) -> BrokerResult<TubeStats> {
        let tube = tube.to_string();
        self.with_connection(Lane::Producer, COMMAND_TIMEOUT, move |conn| {
            Box::pin(async move {
                let response = conn.command(&format!("stats-tube {}", tube), None).await?;
                if response == "NOT_FOUND" {
                    // a tube exists only while something uses or watches it
                    return Ok(TubeStats {
                        name: tube,
                        ..TubeStats::default()
                    });
                }
                let len: usize = match response.strip_prefix("OK ") {
                    Some(len) => parse_number(Some(len), &response)?,
                    None => return Err(rejected("stats-tube", &response)),
                };
                let body = conn.read_body(len).await?;
                let yaml = String::from_utf8_lossy(&body);
                Ok(TubeStats {
                    name: tube,
                    ready: yaml_counter(&yaml, "current-jobs-ready"),
                    reserved: yaml_counter(&yaml, "current-jobs-reserved"),
                    delayed: yaml_counter(&yaml, "current-jobs-delayed"),
                    buried: yaml_counter(&yaml, "current-jobs-buried"),
                })
            })
        })
        .await
    }
}
