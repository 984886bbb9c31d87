//! Minimal RESP2 client for a real Redis-protocol COLD store.
//!
//! Implements exactly the command surface spec §6.2 names — GET, SET,
//! MGET, DEL, EXISTS, TTL, EXPIRE, SCAN — over a small pooled set of
//! plain `TcpStream`s. This is intentionally not a general Redis client:
//! no pub/sub, no scripting, no cluster redirection. The wire codec is a
//! thin collaborator (spec §1), not part of the specified consistency
//! model.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use featurehub_core::FeatureError;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::KvBackend;

/// A bounded pool of RESP connections to a single address. Connections
/// are created lazily and recycled on release; a connection that errors
/// is dropped rather than returned to the pool.
pub struct RespBackend {
    address: String,
    pool: Mutex<Vec<TcpStream>>,
    max_size: usize,
    acquire_timeout: Duration,
}

impl RespBackend {
    #[must_use]
    pub fn new(address: impl Into<String>, max_size: usize, acquire_timeout: Duration) -> Self {
        Self { address: address.into(), pool: Mutex::new(Vec::new()), max_size, acquire_timeout }
    }

    async fn acquire(&self) -> Result<TcpStream, FeatureError> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(conn) = pool.pop() {
                return Ok(conn);
            }
        }
        tokio::time::timeout(self.acquire_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| FeatureError::Timeout { timeout_ms: self.acquire_timeout.as_millis() as u64 })?
            .map_err(|e| FeatureError::backend_unavailable(e.to_string()))
    }

    async fn release(&self, conn: TcpStream) {
        let mut pool = self.pool.lock().await;
        if pool.len() < self.max_size {
            pool.push(conn);
        }
    }

    async fn roundtrip(&self, command: Vec<RespArg<'_>>) -> Result<RespValue, FeatureError> {
        let mut conn = self.acquire().await?;
        let encoded = encode_command(&command);
        let result = async {
            conn.write_all(&encoded).await.map_err(|e| FeatureError::backend_unavailable(e.to_string()))?;
            let mut reader = BufReader::new(&mut conn);
            read_reply(&mut reader).await
        }
        .await;

        match result {
            Ok(value) => {
                self.release(conn).await;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}

enum RespArg<'a> {
    Str(&'a str),
    Bytes(&'a [u8]),
    Owned(String),
}

fn encode_command(args: &[RespArg<'_>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let bytes: &[u8] = match arg {
            RespArg::Str(s) => s.as_bytes(),
            RespArg::Bytes(b) => b,
            RespArg::Owned(s) => s.as_bytes(),
        };
        buf.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
        buf.extend_from_slice(bytes);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

#[derive(Debug, Clone)]
enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Vec<RespValue>),
}

async fn read_line(reader: &mut (impl tokio::io::AsyncBufRead + Unpin)) -> Result<String, FeatureError> {
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| FeatureError::backend_unavailable(e.to_string()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[async_recursion::async_recursion]
async fn read_reply(reader: &mut (impl tokio::io::AsyncBufRead + Unpin + Send)) -> Result<RespValue, FeatureError> {
    let line = read_line(reader).await?;
    if line.is_empty() {
        return Err(FeatureError::backend_unavailable("empty RESP reply"));
    }
    let (marker, rest) = line.split_at(1);
    match marker {
        "+" => Ok(RespValue::Simple(rest.to_string())),
        "-" => Ok(RespValue::Error(rest.to_string())),
        ":" => rest
            .parse::<i64>()
            .map(RespValue::Integer)
            .map_err(|e| FeatureError::backend_unavailable(e.to_string())),
        "$" => {
            let len: i64 = rest.parse().map_err(|e: std::num::ParseIntError| FeatureError::backend_unavailable(e.to_string()))?;
            if len < 0 {
                return Ok(RespValue::Bulk(None));
            }
            let mut buf = vec![0u8; len as usize + 2];
            reader
                .read_exact(&mut buf)
                .await
                .map_err(|e| FeatureError::backend_unavailable(e.to_string()))?;
            buf.truncate(len as usize);
            Ok(RespValue::Bulk(Some(buf)))
        }
        "*" => {
            let len: i64 = rest.parse().map_err(|e: std::num::ParseIntError| FeatureError::backend_unavailable(e.to_string()))?;
            if len < 0 {
                return Ok(RespValue::Array(Vec::new()));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_reply(reader).await?);
            }
            Ok(RespValue::Array(items))
        }
        _ => Err(FeatureError::backend_unavailable(format!("unknown RESP marker: {marker}"))),
    }
}

#[async_trait]
impl KvBackend for RespBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FeatureError> {
        match self.roundtrip(vec![RespArg::Str("GET"), RespArg::Str(key)]).await? {
            RespValue::Bulk(value) => Ok(value),
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: Option<u64>) -> Result<(), FeatureError> {
        let mut cmd = vec![RespArg::Str("SET"), RespArg::Str(key), RespArg::Bytes(&value)];
        let ttl_str;
        if let Some(ttl) = ttl_secs {
            ttl_str = ttl.to_string();
            cmd.push(RespArg::Str("EX"));
            cmd.push(RespArg::Owned(ttl_str));
        }
        match self.roundtrip(cmd).await? {
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok(()),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, FeatureError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut cmd = vec![RespArg::Str("MGET")];
        cmd.extend(keys.iter().map(|k| RespArg::Str(k.as_str())));
        match self.roundtrip(cmd).await? {
            RespValue::Array(items) => {
                let mut out = HashMap::new();
                for (key, item) in keys.iter().zip(items) {
                    if let RespValue::Bulk(Some(value)) = item {
                        out.insert(key.clone(), value);
                    }
                }
                Ok(out)
            }
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok(HashMap::new()),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, FeatureError> {
        match self.roundtrip(vec![RespArg::Str("DEL"), RespArg::Str(key)]).await? {
            RespValue::Integer(n) => Ok(n > 0),
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok(false),
        }
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, FeatureError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = vec![RespArg::Str("DEL")];
        cmd.extend(keys.iter().map(|k| RespArg::Str(k.as_str())));
        match self.roundtrip(cmd).await? {
            RespValue::Integer(n) => Ok(n.max(0) as u64),
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok(0),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, FeatureError> {
        match self.roundtrip(vec![RespArg::Str("EXISTS"), RespArg::Str(key)]).await? {
            RespValue::Integer(n) => Ok(n > 0),
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, FeatureError> {
        match self.roundtrip(vec![RespArg::Str("TTL"), RespArg::Str(key)]).await? {
            RespValue::Integer(n) if n >= 0 => Ok(Some(n)),
            RespValue::Integer(_) => Ok(None),
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok(None),
        }
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<bool, FeatureError> {
        match self
            .roundtrip(vec![RespArg::Str("EXPIRE"), RespArg::Str(key), RespArg::Owned(secs.to_string())])
            .await?
        {
            RespValue::Integer(n) => Ok(n > 0),
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok(false),
        }
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), FeatureError> {
        let match_pattern = format!("{prefix}*");
        let cmd = vec![
            RespArg::Str("SCAN"),
            RespArg::Owned(cursor.to_string()),
            RespArg::Str("MATCH"),
            RespArg::Str(match_pattern.as_str()),
            RespArg::Str("COUNT"),
            RespArg::Owned(count.to_string()),
        ];
        match self.roundtrip(cmd).await? {
            RespValue::Array(mut items) if items.len() == 2 => {
                let keys_value = items.pop().unwrap();
                let cursor_value = items.pop().unwrap();
                let next_cursor = match cursor_value {
                    RespValue::Bulk(Some(bytes)) => {
                        String::from_utf8_lossy(&bytes).parse::<u64>().unwrap_or(0)
                    }
                    _ => 0,
                };
                let keys = match keys_value {
                    RespValue::Array(items) => items
                        .into_iter()
                        .filter_map(|v| match v {
                            RespValue::Bulk(Some(bytes)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                            _ => None,
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                Ok((next_cursor, keys))
            }
            RespValue::Error(e) => Err(FeatureError::backend_unavailable(e)),
            _ => Ok((0, Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_get_command() {
        let encoded = encode_command(&[RespArg::Str("GET"), RespArg::Str("k")]);
        assert_eq!(encoded, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec());
    }

    #[tokio::test]
    async fn read_reply_parses_bulk_string() {
        let data = b"$5\r\nhello\r\n".to_vec();
        let mut reader = std::io::Cursor::new(data);
        let value = read_reply(&mut reader).await.unwrap();
        match value {
            RespValue::Bulk(Some(bytes)) => assert_eq!(bytes, b"hello".to_vec()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_reply_parses_null_bulk() {
        let data = b"$-1\r\n".to_vec();
        let mut reader = std::io::Cursor::new(data);
        let value = read_reply(&mut reader).await.unwrap();
        assert!(matches!(value, RespValue::Bulk(None)));
    }

    #[tokio::test]
    async fn read_reply_parses_integer() {
        let data = b":42\r\n".to_vec();
        let mut reader = std::io::Cursor::new(data);
        let value = read_reply(&mut reader).await.unwrap();
        assert!(matches!(value, RespValue::Integer(42)));
    }

    #[tokio::test]
    async fn read_reply_parses_array() {
        let data = b"*2\r\n$1\r\na\r\n$1\r\nb\r\n".to_vec();
        let mut reader = std::io::Cursor::new(data);
        let value = read_reply(&mut reader).await.unwrap();
        match value {
            RespValue::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
