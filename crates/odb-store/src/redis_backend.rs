//! Redis-backed [`KvBackend`]

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use redis::{Connection, ErrorKind, RedisError, RedisResult};

use odb_core::{OdbError, OdbResult};

use crate::{KvBackend, KvBatch};

/// Attempts made while the server is still loading its dataset
const LOADING_RETRIES: u32 = 50;
const LOADING_BACKOFF: Duration = Duration::from_millis(100);

fn store_err(e: RedisError) -> OdbError {
    OdbError::Store(e.to_string())
}

/// Synchronous Redis connection. Batches run as MULTI/EXEC pipelines.
pub struct RedisBackend {
    conn: Mutex<Connection>,
}

impl RedisBackend {
    /// Connect to `redis://host:port/db`
    pub fn connect(url: &str) -> OdbResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = client.get_connection().map_err(store_err)?;
        tracing::info!("connected to redis at {}", url);
        Ok(RedisBackend {
            conn: Mutex::new(conn),
        })
    }

    fn run<T>(&self, mut op: impl FnMut(&mut Connection) -> RedisResult<T>) -> OdbResult<T> {
        let mut conn = self.conn.lock();
        let mut attempt = 0;
        loop {
            match op(&mut *conn) {
                Ok(value) => return Ok(value),
                Err(e) if e.kind() == ErrorKind::BusyLoadingError && attempt < LOADING_RETRIES => {
                    attempt += 1;
                    tracing::debug!("redis still loading, retry {}", attempt);
                    thread::sleep(LOADING_BACKOFF);
                }
                Err(e) => return Err(store_err(e)),
            }
        }
    }
}

impl KvBackend for RedisBackend {
    fn get(&self, key: &str) -> OdbResult<Option<Bytes>> {
        let raw: Option<Vec<u8>> =
            self.run(|conn| redis::cmd("GET").arg(key).query(conn))?;
        Ok(raw.map(Bytes::from))
    }

    fn mget(&self, keys: &[String]) -> OdbResult<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<Vec<u8>>> =
            self.run(|conn| redis::cmd("MGET").arg(keys).query(conn))?;
        Ok(raw.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    fn set_members(&self, key: &str) -> OdbResult<Vec<Bytes>> {
        let raw: Vec<Vec<u8>> = self.run(|conn| redis::cmd("SMEMBERS").arg(key).query(conn))?;
        Ok(raw.into_iter().map(Bytes::from).collect())
    }

    fn apply(&self, batch: KvBatch) -> OdbResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for (key, value) in &batch.sets {
            match value {
                Some(v) => {
                    pipe.cmd("SET").arg(key).arg(&v[..]).ignore();
                }
                None => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }
        for (key, members) in &batch.set_adds {
            let members: Vec<Vec<u8>> = members.iter().map(|m| m.to_vec()).collect();
            pipe.cmd("SADD").arg(key).arg(members).ignore();
        }
        for (key, members) in &batch.set_removes {
            let members: Vec<Vec<u8>> = members.iter().map(|m| m.to_vec()).collect();
            pipe.cmd("SREM").arg(key).arg(members).ignore();
        }

        self.run(|conn| pipe.query::<()>(conn))
    }
}
