//! Redis pub/sub upstream.
//!
//! Each subscription gets its own connection, so dropping a feed closes the
//! socket and Redis forgets the subscription.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use tribecast_core::{Upstream, UpstreamError, UpstreamFeed};

use crate::config::UpstreamConfig;
use crate::resp::{self, RespValue};

/// An [`Upstream`] that subscribes to Redis channels.
#[derive(Debug, Clone)]
pub struct RedisUpstream {
    address: String,
    password: Option<String>,
    db: u32,
}

impl RedisUpstream {
    /// Create a Redis upstream from configuration. No connection is made
    /// until the first subscription.
    #[must_use]
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            address: config.address.clone(),
            password: config.password.clone(),
            db: config.db,
        }
    }

    async fn connect(&self) -> Result<Connection, UpstreamError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let mut conn = Connection {
            stream,
            buffer: BytesMut::with_capacity(4096),
        };

        if let Some(password) = &self.password {
            conn.command(&[b"AUTH".as_slice(), password.as_bytes()])
                .await
                .and_then(expect_ok)?;
        }
        if self.db != 0 {
            let db = self.db.to_string();
            conn.command(&[b"SELECT".as_slice(), db.as_bytes()])
                .await
                .and_then(expect_ok)?;
        }
        Ok(conn)
    }
}

#[async_trait]
impl Upstream for RedisUpstream {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn UpstreamFeed>, UpstreamError> {
        let mut conn = self.connect().await?;
        let reply = conn
            .command(&[b"SUBSCRIBE".as_slice(), topic.as_bytes()])
            .await?;

        match push_kind(&reply) {
            Some((b"subscribe", _)) => {
                debug!(address = %self.address, topic, "Redis subscribed");
                Ok(Box::new(RedisFeed {
                    conn,
                    topic: topic.to_string(),
                }))
            }
            _ => Err(unexpected(&reply)),
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    async fn command(&mut self, args: &[&[u8]]) -> Result<RespValue, UpstreamError> {
        let request = resp::encode_command(args);
        self.stream.write_all(&request).await?;
        self.read_value().await
    }

    async fn read_value(&mut self) -> Result<RespValue, UpstreamError> {
        loop {
            if let Some(value) = resp::decode_from(&mut self.buffer)
                .map_err(|e| UpstreamError::Protocol(e.to_string()))?
            {
                return Ok(value);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(UpstreamError::Disconnected);
            }
        }
    }
}

struct RedisFeed {
    conn: Connection,
    topic: String,
}

#[async_trait]
impl UpstreamFeed for RedisFeed {
    async fn next_message(&mut self) -> Result<Option<Bytes>, UpstreamError> {
        loop {
            let value = self.conn.read_value().await?;
            match value {
                RespValue::Array(Some(mut items))
                    if items.len() == 3 && items[0].as_bytes() == Some(b"message".as_slice()) =>
                {
                    match items.pop() {
                        Some(RespValue::Bulk(Some(payload))) => return Ok(Some(payload)),
                        _ => return Err(UpstreamError::Protocol("message without payload".into())),
                    }
                }
                RespValue::Error(message) => return Err(UpstreamError::Protocol(message)),
                other => trace!(topic = %self.topic, reply = ?other, "Ignoring Redis push"),
            }
        }
    }
}

/// Kind and channel of a pub/sub push such as `subscribe` or `message`.
fn push_kind(value: &RespValue) -> Option<(&[u8], &[u8])> {
    match value {
        RespValue::Array(Some(items)) if items.len() >= 2 => {
            Some((items[0].as_bytes()?, items[1].as_bytes()?))
        }
        _ => None,
    }
}

fn expect_ok(value: RespValue) -> Result<(), UpstreamError> {
    match value {
        RespValue::Simple(ref s) if s == "OK" => Ok(()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(value: &RespValue) -> UpstreamError {
    match value {
        RespValue::Error(message) => UpstreamError::Protocol(message.clone()),
        other => UpstreamError::Protocol(format!("unexpected reply: {other:?}")),
    }
}
