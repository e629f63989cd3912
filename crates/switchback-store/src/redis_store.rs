//! Redis-backed coordination store.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::sentinel::{Sentinel, SentinelNodeConnectionInfo};
use redis::streams::StreamReadReply;
use redis::{AsyncConnectionConfig, Client, RedisConnectionInfo, Script};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use switchback_core::{CoordinationStore, Result, StreamEntry};
use tracing::{debug, info};

use crate::{StoreError, StoreResult};

/// Idle blocking connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 8;

/// Redis scripts for atomic operations
mod scripts {
    use redis::Script;

    /// Pop the lowest-scored member if its score is at most ARGV[1].
    pub fn pop_min_at_most() -> Script {
        Script::new(
            r#"
            local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
            if #head == 0 then
                return false
            end
            if ARGV[1] ~= '+inf' and tonumber(head[2]) > tonumber(ARGV[1]) then
                return false
            end
            redis.call('ZREM', KEYS[1], head[1])
            return {head[1], head[2]}
            "#,
        )
    }

    /// Set hash fields while ARGV[1] holds one of the expected values.
    ///
    /// ARGV[2] is the number of expected values that follow (-1 accepts
    /// anything); the remaining arguments are field/value pairs. Returns the
    /// value held before, or nil when the field is missing.
    pub fn hash_set_if() -> Script {
        Script::new(
            r#"
            local current = redis.call('HGET', KEYS[1], ARGV[1])
            if not current then
                return false
            end
            local count = tonumber(ARGV[2])
            local accepted = count < 0
            local first = 3 + math.max(count, 0)
            for i = 3, first - 1 do
                if ARGV[i] == current then
                    accepted = true
                    break
                end
            end
            if accepted and first <= #ARGV then
                redis.call('HSET', KEYS[1], unpack(ARGV, first))
            end
            return current
            "#,
        )
    }
}

/// Where a [`RedisStore`] finds its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisTarget {
    /// A single server at a `redis://` URL.
    Standalone(String),
    /// The current master of a Sentinel-monitored group.
    Sentinel {
        master_name: String,
        /// Sentinel nodes, `host:port` or `redis://host:port`.
        addrs: Vec<String>,
        /// Password of the master, if it requires one.
        password: Option<String>,
    },
}

/// Coordination store backed by a Redis server.
///
/// Ordinary commands share one auto-reconnecting [`ConnectionManager`].
/// Blocking reads (`BLPOP`, `XREAD BLOCK`) run on dedicated connections
/// without a client-side response timeout, so they wait as long as the
/// server-side block asks for. Those connections are returned to a small idle
/// list after each successful read and dropped after a failed or abandoned
/// one.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    pop_min: Script,
    set_if: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .field("idle_blocking", &self.idle().len())
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        info!(url = %redact(url), "Connecting to Redis (standalone mode)");
        Self::from_client(Client::open(url)?).await
    }

    /// Resolve the current master through Sentinel and connect to it.
    ///
    /// The master address is looked up once; after a failover the store has
    /// to be connected again.
    pub async fn connect_sentinel(
        master_name: &str,
        addrs: &[String],
        password: Option<&str>,
    ) -> StoreResult<Self> {
        info!(
            sentinel_addrs = ?addrs,
            master_name,
            "Connecting to Redis via Sentinel (HA mode)"
        );

        let nodes: Vec<String> = addrs.iter().map(|a| sentinel_url(a)).collect();
        let mut sentinel = Sentinel::build(nodes)?;

        let mut redis_info = RedisConnectionInfo::default();
        if let Some(password) = password {
            redis_info = redis_info.set_password(password);
        }
        let node_info = SentinelNodeConnectionInfo::default().set_redis_connection_info(redis_info);

        let client = sentinel.async_master_for(master_name, Some(&node_info)).await?;
        Self::from_client(client).await
    }

    pub async fn connect_target(target: &RedisTarget) -> StoreResult<Self> {
        match target {
            RedisTarget::Standalone(url) => Self::connect(url).await,
            RedisTarget::Sentinel {
                master_name,
                addrs,
                password,
            } => Self::connect_sentinel(master_name, addrs, password.as_deref()).await,
        }
    }

    async fn from_client(client: Client) -> StoreResult<Self> {
        let mut conn = ConnectionManager::new(client.clone()).await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StoreError::UnexpectedReply(format!("PING answered {pong:?}")));
        }

        info!("Connected to Redis");

        Ok(Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(Vec::new())),
            pop_min: scripts::pop_min_at_most(),
            set_if: scripts::hash_set_if(),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn idle(&self) -> MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.blocking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An idle blocking connection, or a fresh one.
    async fn checkout(&self) -> StoreResult<MultiplexedConnection> {
        if let Some(conn) = self.idle().pop() {
            return Ok(conn);
        }

        debug!("Opening blocking Redis connection");
        let config = AsyncConnectionConfig::new().set_response_timeout(None);
        Ok(self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?)
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle();
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    /// Run a blocking command on a dedicated connection.
    async fn query_blocking<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.checkout().await?;
        let reply = cmd.query_async(&mut conn).await.map_err(StoreError::from)?;
        self.checkin(conn);
        Ok(reply)
    }
}

fn sentinel_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    }
}

/// Hide the password part of a redis URL.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let _: i64 = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(fields)
    }

    async fn hash_set_if(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[&str]>,
        fields: &[(&str, String)],
    ) -> Result<Option<String>> {
        let mut invocation = self.set_if.key(key);
        invocation.arg(field);
        match expected {
            Some(values) => {
                invocation.arg(values.len());
                for value in values {
                    invocation.arg(*value);
                }
            }
            None => {
                invocation.arg(-1);
            }
        }
        for (name, value) in fields {
            invocation.arg(*name).arg(value);
        }

        let previous: Option<String> = invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(previous)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn atomic_pop_min(
        &self,
        key: &str,
        max_score: Option<f64>,
    ) -> Result<Option<(String, f64)>> {
        let bound = match max_score {
            Some(max) => max.to_string(),
            None => "+inf".to_string(),
        };
        let popped: Option<(String, String)> = self
            .pop_min
            .key(key)
            .arg(bound)
            .invoke_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;

        match popped {
            None => Ok(None),
            Some((member, score)) => {
                let score = score.parse::<f64>().map_err(|_| {
                    StoreError::UnexpectedReply(format!("non-numeric score {score:?}"))
                })?;
                Ok(Some((member, score)))
            }
        }
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(removed > 0)
    }

    async fn sorted_len(&self, key: &str) -> Result<u64> {
        let len: u64 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(len)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn list_blocking_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        // BLPOP treats a zero timeout as "wait forever".
        if timeout.is_zero() {
            let value: Option<String> = redis::cmd("LPOP")
                .arg(key)
                .query_async(&mut self.conn())
                .await
                .map_err(StoreError::from)?;
            return Ok(value);
        }

        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(key).arg(timeout.as_secs_f64());
        let popped: Option<(String, String)> = self.query_blocking(&cmd).await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let len: u64 = redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(len)
    }

    async fn stream_append(&self, key: &str, fields: &[(&str, String)]) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let id: String = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(id)
    }

    async fn stream_read(
        &self,
        key: &str,
        after: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(count);

        let reply: Option<StreamReadReply> = if block.is_zero() {
            cmd.arg("STREAMS").arg(key).arg(after);
            cmd.query_async(&mut self.conn())
                .await
                .map_err(StoreError::from)?
        } else {
            // Never send BLOCK 0, which waits forever.
            cmd.arg("BLOCK")
                .arg(millis(block).max(1))
                .arg("STREAMS")
                .arg(key)
                .arg(after);
            self.query_blocking(&cmd).await?
        };

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let entries: Vec<StreamEntry> = reply
            .keys
            .into_iter()
            .flat_map(|stream| stream.ids)
            .map(|entry| {
                let fields = entry
                    .map
                    .keys()
                    .filter_map(|name| entry.get::<String>(name).map(|v| (name.clone(), v)))
                    .collect();
                StreamEntry {
                    id: entry.id,
                    fields,
                }
            })
            .collect();

        debug!(key, count = entries.len(), "Read stream entries");
        Ok(entries)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(StoreError::from)?;
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};

    /// Serves just enough RESP for a client: PING, slow blocking reads that
    /// time out with nil, and `+OK` for everything else.
    async fn spawn_resp_server(block: Duration) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, block));
            }
        });

        (format!("redis://{addr}"), accepted)
    }

    async fn serve(socket: TcpStream, block: Duration) {
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);

        while let Some(args) = read_command(&mut reader).await {
            let name = args.first().map(|a| a.to_ascii_uppercase()).unwrap_or_default();
            let reply: &[u8] = match name.as_str() {
                "PING" => b"+PONG\r\n",
                "BLPOP" | "XREAD" => {
                    tokio::time::sleep(block).await;
                    b"*-1\r\n"
                }
                _ => b"+OK\r\n",
            };
            if write.write_all(reply).await.is_err() {
                break;
            }
        }
    }

    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(String::from_utf8(buf).ok()?);
        }
        Some(args)
    }

    #[test]
    fn test_redact_hides_password() {
        assert_eq!(
            redact("redis://:hunter2@cache.internal:6379/0"),
            "redis://***@cache.internal:6379/0"
        );
        assert_eq!(redact("redis://127.0.0.1:6379"), "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_sentinel_addresses_get_a_scheme() {
        assert_eq!(sentinel_url("redis-0:26379"), "redis://redis-0:26379");
        assert_eq!(sentinel_url("redis://redis-1:26379"), "redis://redis-1:26379");
    }

    #[tokio::test]
    async fn test_blocking_reads_wait_out_the_server_block() {
        let (url, accepted) = spawn_resp_server(Duration::from_millis(1500)).await;
        let store = RedisStore::connect(&url).await.unwrap();

        let popped = store
            .list_blocking_pop("q", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(popped, None);
        let opened = accepted.load(Ordering::SeqCst);

        let entries = store
            .stream_read("s", "0", 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(entries.is_empty());

        // The second blocking read reuses the first one's connection.
        assert_eq!(accepted.load(Ordering::SeqCst), opened);
    }
}
