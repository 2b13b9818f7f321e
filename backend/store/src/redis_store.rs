//! Redis-backed store: hashes map to Redis hashes, streams to Redis streams.

use std::collections::HashMap;

use async_trait::async_trait;
use keystone_core::{BackingStore, StoreError, StoreResult, StreamCursor, StreamRecord};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_REDIS_ADDRESS: &str = "localhost";
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Connection target parsed from `redis://[password@]host[:port][/db]`.
///
/// The user-info part of the URL is taken as the password, which is how
/// existing deployments spell it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisTarget {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl RedisTarget {
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let url = Url::parse(raw).map_err(|e| StoreError::new("connect", raw, e))?;
        if url.scheme() != "redis" {
            return Err(StoreError::new(
                "connect",
                raw,
                format!("unsupported scheme {}", url.scheme()),
            ));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_REDIS_ADDRESS)
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_REDIS_PORT);
        let db_part = url.path().trim_matches('/');
        let db = if db_part.is_empty() {
            0
        } else {
            db_part
                .parse()
                .map_err(|_| StoreError::new("connect", raw, format!("invalid database id {db_part}")))?
        };
        let password = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        Ok(Self {
            host,
            port,
            db,
            password,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

pub struct RedisStore {
    conn: MultiplexedConnection,
    target: RedisTarget,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let target = RedisTarget::parse(url)?;
        let client = redis::Client::open(target.connection_info())
            .map_err(|e| StoreError::new("connect", target.address(), e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::new("connect", target.address(), e))?;
        info!(address = %target.address(), db = target.db, "Connected to Redis");
        Ok(Self { conn, target })
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    fn database(&self) -> String {
        self.target.address()
    }

    async fn hash_get(&self, hash: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.hget(hash, key)
            .await
            .map_err(|e| StoreError::new("hget", hash, e))
    }

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.hgetall(hash)
            .await
            .map_err(|e| StoreError::new("hgetall", hash, e))
    }

    async fn hash_set(&self, hash: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(hash, key, value)
            .await
            .map_err(|e| StoreError::new("hset", hash, e))?;
        debug!(hash, key, "stored hash field");
        Ok(())
    }

    async fn hash_delete(&self, hash: &str, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        conn.hdel(hash, key)
            .await
            .map_err(|e| StoreError::new("hdel", hash, e))
    }

    async fn key_delete(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        conn.del(key)
            .await
            .map_err(|e| StoreError::new("del", key, e))
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &[u8])],
        approx_cap: usize,
    ) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<String> = if approx_cap > 0 {
            conn.xadd_maxlen(stream, StreamMaxlen::Approx(approx_cap), "*", fields)
                .await
        } else {
            conn.xadd(stream, "*", fields).await
        };
        result.map_err(|e| StoreError::new("xadd", stream, e))
    }

    async fn stream_read(
        &self,
        stream: &str,
        cursor: &StreamCursor,
        count: usize,
    ) -> StoreResult<Vec<StreamRecord>> {
        let mut conn = self.conn.clone();
        let start = match cursor {
            StreamCursor::Start => "-".to_string(),
            StreamCursor::After(id) => format!("({id}"),
        };
        let reply: StreamRangeReply = conn
            .xrange_count(stream, start, "+", count)
            .await
            .map_err(|e| StoreError::new("xrange", stream, e))?;

        reply
            .ids
            .into_iter()
            .map(|entry| {
                let fields = entry
                    .map
                    .iter()
                    .map(|(k, v)| {
                        redis::from_redis_value::<Vec<u8>>(v)
                            .map(|bytes| (k.clone(), bytes))
                            .map_err(|e| StoreError::new("xrange", stream, e))
                    })
                    .collect::<StoreResult<HashMap<_, _>>>()?;
                Ok(StreamRecord {
                    id: entry.id,
                    fields,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_url() {
        let t = RedisTarget::parse("redis://s3cret@cache.internal:6380/2").unwrap();
        assert_eq!(t.host, "cache.internal");
        assert_eq!(t.port, 6380);
        assert_eq!(t.db, 2);
        assert_eq!(t.password.as_deref(), Some("s3cret"));
        assert_eq!(t.address(), "cache.internal:6380");
    }

    #[test]
    fn fills_defaults() {
        let t = RedisTarget::parse("redis://localhost").unwrap();
        assert_eq!(t.port, DEFAULT_REDIS_PORT);
        assert_eq!(t.db, 0);
        assert!(t.password.is_none());
    }

    #[test]
    fn rejects_other_schemes_and_bad_db() {
        assert!(RedisTarget::parse("http://localhost").is_err());
        assert!(RedisTarget::parse("redis://localhost/notanumber").is_err());
    }
}
