//! Remote key/value tile cache speaking the memcached text protocol.
//!
//! Tiles are stored under their flat key with the modification time packed
//! into eight trailing bytes, since the protocol carries no metadata of its
//! own. Connections come from a bounded [`Pool`]; any protocol or I/O error
//! invalidates the connection so the next request starts fresh.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{flat_key, BoxFuture, CacheBackend, CacheError, CachedTile, Pool, PoolGuard, ResourceFactory, TileData};
use crate::tileset::Tile;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bytes appended to each value to carry the modification time.
const MTIME_SUFFIX_LEN: usize = 8;

/// Configuration for [`RemoteCache`].
#[derive(Debug, Clone)]
pub struct RemoteCacheConfig {
    /// `host:port` of the memcached server.
    pub addr: String,
    /// Upper bound on simultaneously open connections.
    pub max_connections: usize,
    pub connect_timeout: Duration,
    /// Server-side expiry in seconds; 0 keeps entries until evicted.
    pub expires: u32,
}

impl RemoteCacheConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_connections: 4,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            expires: 0,
        }
    }
}

struct ConnectionFactory {
    addr: String,
    connect_timeout: Duration,
}

impl ResourceFactory for ConnectionFactory {
    type Resource = BufReader<TcpStream>;

    fn create(&self) -> BoxFuture<'_, Result<Self::Resource, CacheError>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(
                self.connect_timeout,
                TcpStream::connect(&self.addr),
            )
            .await
            .map_err(|_| CacheError::ConnectTimeout {
                addr: self.addr.clone(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })??;
            debug!(addr = %self.addr, "opened cache connection");
            Ok(BufReader::new(stream))
        })
    }

    fn validate<'a>(&'a self, conn: &'a mut Self::Resource) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            // an idle connection has nothing buffered and nothing readable;
            // a server-side close reads EOF immediately, and stray bytes
            // mean a half-consumed response either way
            if !conn.buffer().is_empty() {
                return false;
            }
            let mut peek = [0u8; 1];
            match conn.get_ref().try_read(&mut peek) {
                Ok(_) => false,
                Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
            }
        })
    }
}

/// Tile cache on a remote memcached-compatible server.
pub struct RemoteCache {
    pool: Pool<ConnectionFactory>,
    expires: u32,
}

impl RemoteCache {
    pub fn new(config: RemoteCacheConfig) -> Self {
        let factory = ConnectionFactory {
            addr: config.addr,
            connect_timeout: config.connect_timeout,
        };
        Self {
            pool: Pool::new(factory, config.max_connections),
            expires: config.expires,
        }
    }

    /// Fetch the raw value stored under `key`, or `None` on a miss.
    async fn fetch(
        conn: &mut PoolGuard<'_, ConnectionFactory>,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        conn.get_mut()
            .write_all(format!("get {key}\r\n").as_bytes())
            .await?;
        let mut header = String::new();
        conn.read_line(&mut header).await?;
        let header = header.trim_end();
        if header == "END" {
            return Ok(None);
        }
        // VALUE <key> <flags> <bytes>
        let length: usize = header
            .strip_prefix("VALUE ")
            .and_then(|rest| rest.split_whitespace().nth(2))
            .and_then(|len| len.parse().ok())
            .ok_or_else(|| {
                CacheError::Backend(format!("malformed cache response: {header:?}"))
            })?;
        let mut value = vec![0u8; length];
        conn.read_exact(&mut value).await?;
        let mut trailer = [0u8; 7]; // \r\nEND\r\n
        conn.read_exact(&mut trailer).await?;
        if &trailer != b"\r\nEND\r\n" {
            return Err(CacheError::Backend(
                "malformed cache response trailer".to_string(),
            ));
        }
        Ok(Some(value))
    }

    async fn store(
        &self,
        conn: &mut PoolGuard<'_, ConnectionFactory>,
        key: &str,
        value: &[u8],
    ) -> Result<(), CacheError> {
        let header = format!("set {key} 0 {} {}\r\n", self.expires, value.len());
        conn.get_mut().write_all(header.as_bytes()).await?;
        conn.get_mut().write_all(value).await?;
        conn.get_mut().write_all(b"\r\n").await?;
        let mut reply = String::new();
        conn.read_line(&mut reply).await?;
        if reply.trim_end() != "STORED" {
            return Err(CacheError::Backend(format!(
                "cache server refused store: {}",
                reply.trim_end()
            )));
        }
        Ok(())
    }

    fn pack(data: &[u8], mtime: SystemTime) -> Vec<u8> {
        let secs = mtime
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let mut value = Vec::with_capacity(data.len() + MTIME_SUFFIX_LEN);
        value.extend_from_slice(data);
        value.extend_from_slice(&secs.to_le_bytes());
        value
    }

    fn unpack(mut value: Vec<u8>) -> Result<CachedTile, CacheError> {
        if value.len() < MTIME_SUFFIX_LEN {
            return Err(CacheError::Backend(
                "cached value shorter than its timestamp suffix".to_string(),
            ));
        }
        let suffix = value.split_off(value.len() - MTIME_SUFFIX_LEN);
        let secs = u64::from_le_bytes(suffix.try_into().expect("suffix is 8 bytes"));
        Ok(CachedTile {
            data: Bytes::from(value),
            mtime: UNIX_EPOCH + Duration::from_secs(secs),
        })
    }
}

impl CacheBackend for RemoteCache {
    fn exists<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move { Ok(self.get(tile).await?.is_some()) })
    }

    fn get<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<Option<CachedTile>, CacheError>> {
        Box::pin(async move {
            let key = flat_key(tile);
            let mut conn = self.pool.acquire().await?;
            let value = match Self::fetch(&mut conn, &key).await {
                Ok(value) => value,
                Err(err) => {
                    conn.invalidate();
                    return Err(err);
                }
            };
            match value {
                Some(value) => {
                    trace!(key, "remote cache hit");
                    Ok(Some(Self::unpack(value)?))
                }
                None => Ok(None),
            }
        })
    }

    fn set<'a>(
        &'a self,
        tile: &'a Tile,
        data: &'a TileData,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let key = flat_key(tile);
            let encoded = data.to_encoded(tile.tileset().format())?;
            let value = Self::pack(&encoded, SystemTime::now());
            let mut conn = self.pool.acquire().await?;
            if let Err(err) = self.store(&mut conn, &key, &value).await {
                conn.invalidate();
                return Err(err);
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let key = flat_key(tile);
            let mut conn = self.pool.acquire().await?;
            let outcome: Result<(), CacheError> = async {
                conn.get_mut()
                    .write_all(format!("delete {key}\r\n").as_bytes())
                    .await?;
                let mut reply = String::new();
                conn.read_line(&mut reply).await?;
                match reply.trim_end() {
                    // an absent tile is a successful delete
                    "DELETED" | "NOT_FOUND" => Ok(()),
                    other => Err(CacheError::Backend(format!(
                        "cache server refused delete: {other}"
                    ))),
                }
            }
            .await;
            if outcome.is_err() {
                conn.invalidate();
            }
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tileset::test_support::test_tileset;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// Minimal in-process memcached speaking just enough of the text
    /// protocol for the backend under test.
    async fn spawn_fake_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut conn = BufReader::new(socket);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        if conn.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let parts: Vec<String> =
                            line.trim_end().split(' ').map(str::to_string).collect();
                        match parts[0].as_str() {
                            "get" => {
                                let value = store.lock().await.get(&parts[1]).cloned();
                                let reply = match value {
                                    Some(value) => {
                                        let mut reply = format!(
                                            "VALUE {} 0 {}\r\n",
                                            parts[1],
                                            value.len()
                                        )
                                        .into_bytes();
                                        reply.extend_from_slice(&value);
                                        reply.extend_from_slice(b"\r\nEND\r\n");
                                        reply
                                    }
                                    None => b"END\r\n".to_vec(),
                                };
                                conn.get_mut().write_all(&reply).await.unwrap();
                            }
                            "set" => {
                                let length: usize = parts[4].parse().unwrap();
                                let mut value = vec![0u8; length + 2];
                                conn.read_exact(&mut value).await.unwrap();
                                value.truncate(length);
                                store.lock().await.insert(parts[1].clone(), value);
                                conn.get_mut().write_all(b"STORED\r\n").await.unwrap();
                            }
                            "delete" => {
                                let removed = store.lock().await.remove(&parts[1]).is_some();
                                let reply: &[u8] = if removed {
                                    b"DELETED\r\n"
                                } else {
                                    b"NOT_FOUND\r\n"
                                };
                                conn.get_mut().write_all(reply).await.unwrap();
                            }
                            _ => {
                                conn.get_mut().write_all(b"ERROR\r\n").await.unwrap();
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Like [`spawn_fake_server`], but drops every connection after one
    /// command, the way an idle-timeout or restart kills parked
    /// connections server-side.
    async fn spawn_one_shot_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut conn = BufReader::new(socket);
                    let mut line = String::new();
                    if conn.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let parts: Vec<String> =
                        line.trim_end().split(' ').map(str::to_string).collect();
                    match parts[0].as_str() {
                        "get" => {
                            let value = store.lock().await.get(&parts[1]).cloned();
                            let reply = match value {
                                Some(value) => {
                                    let mut reply =
                                        format!("VALUE {} 0 {}\r\n", parts[1], value.len())
                                            .into_bytes();
                                    reply.extend_from_slice(&value);
                                    reply.extend_from_slice(b"\r\nEND\r\n");
                                    reply
                                }
                                None => b"END\r\n".to_vec(),
                            };
                            conn.get_mut().write_all(&reply).await.unwrap();
                        }
                        "set" => {
                            let length: usize = parts[4].parse().unwrap();
                            let mut value = vec![0u8; length + 2];
                            conn.read_exact(&mut value).await.unwrap();
                            value.truncate(length);
                            store.lock().await.insert(parts[1].clone(), value);
                            conn.get_mut().write_all(b"STORED\r\n").await.unwrap();
                        }
                        _ => {
                            conn.get_mut().write_all(b"ERROR\r\n").await.unwrap();
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_get_miss_returns_none() {
        let addr = spawn_fake_server().await;
        let cache = RemoteCache::new(RemoteCacheConfig::new(addr));
        let (tileset, link) = test_tileset(1);
        let tile = tileset.tile(link, 0, 0, 0);
        assert!(cache.get(&tile).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_preserves_data_and_mtime() {
        let addr = spawn_fake_server().await;
        let cache = RemoteCache::new(RemoteCacheConfig::new(addr));
        let (tileset, link) = test_tileset(1);
        let tile = tileset.tile(link, 1, 2, 1);

        let before = SystemTime::now() - Duration::from_secs(1);
        cache
            .set(&tile, &TileData::Encoded(Bytes::from_static(b"tile bytes")))
            .await
            .unwrap();
        let hit = cache.get(&tile).await.unwrap().unwrap();
        assert_eq!(hit.data.as_ref(), b"tile bytes");
        assert!(hit.mtime >= before);
        assert!(hit.mtime <= SystemTime::now() + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_reconnects_when_parked_connection_closed() {
        let addr = spawn_one_shot_server().await;
        let cache = RemoteCache::new(RemoteCacheConfig::new(addr));
        let (tileset, link) = test_tileset(1);
        let tile = tileset.tile(link, 0, 0, 0);

        cache
            .set(&tile, &TileData::Encoded(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        // let the server-side close reach the parked connection
        tokio::time::sleep(Duration::from_millis(100)).await;
        let hit = cache.get(&tile).await.unwrap().unwrap();
        assert_eq!(hit.data.as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let addr = spawn_fake_server().await;
        let cache = RemoteCache::new(RemoteCacheConfig::new(addr));
        let (tileset, link) = test_tileset(1);
        let tile = tileset.tile(link, 0, 0, 0);
        cache.delete(&tile).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let addr = spawn_fake_server().await;
        let cache = RemoteCache::new(RemoteCacheConfig::new(addr));
        let (tileset, link) = test_tileset(1);
        let tile = tileset.tile(link, 0, 0, 0);
        cache
            .set(&tile, &TileData::Encoded(Bytes::from_static(b"x")))
            .await
            .unwrap();
        cache.delete(&tile).await.unwrap();
        assert!(cache.get(&tile).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_timeout_reported() {
        // RFC 5737 TEST-NET address, guaranteed unroutable
        let mut config = RemoteCacheConfig::new("192.0.2.1:11211");
        config.connect_timeout = Duration::from_millis(50);
        let cache = RemoteCache::new(config);
        let (tileset, link) = test_tileset(1);
        let tile = tileset.tile(link, 0, 0, 0);
        let err = cache.get(&tile).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::ConnectTimeout { .. } | CacheError::Io(_)
        ));
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let mtime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let value = RemoteCache::pack(b"payload", mtime);
        let tile = RemoteCache::unpack(value).unwrap();
        assert_eq!(tile.data.as_ref(), b"payload");
        assert_eq!(tile.mtime, mtime);
    }

    #[test]
    fn test_unpack_rejects_truncated_value() {
        assert!(RemoteCache::unpack(vec![1, 2, 3]).is_err());
    }
}
