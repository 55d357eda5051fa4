//! SQLite backend: a single `kv(k BLOB PRIMARY KEY, v BLOB)` table in WAL
//! mode behind an r2d2 connection pool. All key structure lives in the key
//! encoding; the backend itself is schema-blind.

use crate::context::OpContext;
use crate::error::ProtoKvError;
use crate::kv::{algebra, Index, Kv, KvOps, PoolSettings, Tx};
use crate::schema::keys::prefix_successor;
use parking_lot::Mutex;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

pub struct SqliteKv {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteKv {
    /// Opens (creating if needed) the database file named by
    /// `connection_string`.
    pub fn open(connection_string: &str, settings: &PoolSettings) -> Result<Self, ProtoKvError> {
        let manager = SqliteConnectionManager::file(connection_string).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "wal")?;
            conn.pragma_update(None, "synchronous", "full")?;
            conn.busy_timeout(BUSY_TIMEOUT)
        });
        let mut builder = Pool::builder().max_lifetime(settings.conn_max_lifetime);
        if let Some(max_open) = settings.max_open_conns {
            builder = builder.max_size(max_open);
        }
        if let Some(max_idle) = settings.max_idle_conns {
            builder = builder.min_idle(Some(max_idle));
        }
        let pool = builder.build(manager)?;
        initialize_schema(&*pool.get()?)?;
        debug!(path = connection_string, "opened sqlite kv backend");
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, ProtoKvError> {
        Ok(self.pool.get()?)
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), ProtoKvError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            k BLOB NOT NULL PRIMARY KEY,
            v BLOB NOT NULL
        ) WITHOUT ROWID;",
    )?;
    Ok(())
}

fn get_on(conn: &Connection, key: &[u8]) -> Result<Option<Vec<u8>>, ProtoKvError> {
    let value = conn
        .query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .optional()?;
    Ok(value)
}

fn put_on(conn: &Connection, key: &[u8], value: &[u8]) -> Result<(), ProtoKvError> {
    conn.execute(
        "INSERT INTO kv (k, v) VALUES (?1, ?2)
         ON CONFLICT(k) DO UPDATE SET v = excluded.v",
        params![key, value],
    )?;
    Ok(())
}

fn delete_on(conn: &Connection, key: &[u8]) -> Result<bool, ProtoKvError> {
    let changed = conn.execute("DELETE FROM kv WHERE k = ?1", params![key])?;
    Ok(changed > 0)
}

fn page_on(
    conn: &Connection,
    prefix: &[u8],
    token: &[u8],
    limit: usize,
) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
    let upper = prefix_successor(prefix);
    let bound = if limit == 0 { -1 } else { limit as i64 };
    let mut stmt = conn.prepare_cached(
        "SELECT k, v FROM kv
         WHERE k >= ?1 AND (?2 IS NULL OR k < ?2) AND k > ?3
         ORDER BY k ASC LIMIT ?4",
    )?;
    let rows = stmt.query_map(params![prefix, upper, token, bound], |row| {
        Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut values = Vec::new();
    let mut last_key = Vec::new();
    for row in rows {
        let (key, value) = row?;
        values.push(value);
        last_key = key;
    }
    let next_token = if limit != 0 && values.len() == limit {
        last_key
    } else {
        Vec::new()
    };
    Ok((values, next_token))
}

fn scan_keys_on(conn: &Connection, prefix: &[u8]) -> Result<Vec<Vec<u8>>, ProtoKvError> {
    let upper = prefix_successor(prefix);
    let mut stmt = conn.prepare_cached(
        "SELECT k FROM kv WHERE k >= ?1 AND (?2 IS NULL OR k < ?2) ORDER BY k ASC",
    )?;
    let rows = stmt.query_map(params![prefix, upper], |row| row.get::<_, Vec<u8>>(0))?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

fn page_index_on(
    conn: &Connection,
    indices: &[Index],
    token: &[u8],
    limit: usize,
) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
    algebra::page_index_scan(
        |prefix| scan_keys_on(conn, prefix),
        |key| get_on(conn, key),
        indices,
        token,
        limit,
    )
}

impl KvOps for SqliteKv {
    fn get(&self, ctx: &OpContext, key: &[u8]) -> Result<Option<Vec<u8>>, ProtoKvError> {
        ctx.check()?;
        get_on(&*self.conn()?, key)
    }

    fn put(&self, ctx: &OpContext, key: &[u8], value: &[u8]) -> Result<(), ProtoKvError> {
        ctx.check()?;
        put_on(&*self.conn()?, key, value)
    }

    fn delete(&self, ctx: &OpContext, key: &[u8]) -> Result<bool, ProtoKvError> {
        ctx.check()?;
        delete_on(&*self.conn()?, key)
    }

    fn page(
        &self,
        ctx: &OpContext,
        prefix: &[u8],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        ctx.check()?;
        page_on(&*self.conn()?, prefix, token, limit)
    }

    fn page_index(
        &self,
        ctx: &OpContext,
        indices: &[Index],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        ctx.check()?;
        page_index_on(&*self.conn()?, indices, token, limit)
    }
}

impl Kv for SqliteKv {
    fn begin<'a>(&'a self, ctx: &OpContext) -> Result<Box<dyn Tx + 'a>, ProtoKvError> {
        ctx.check()?;
        let conn = self.conn()?;
        // IMMEDIATE takes the write lock up front so conflicting writers
        // surface as busy at begin rather than at commit.
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTx {
            conn: Mutex::new(conn),
            finished: false,
        }))
    }
}

struct SqliteTx {
    conn: Mutex<PooledConnection<SqliteConnectionManager>>,
    finished: bool,
}

impl KvOps for SqliteTx {
    fn get(&self, ctx: &OpContext, key: &[u8]) -> Result<Option<Vec<u8>>, ProtoKvError> {
        ctx.check()?;
        get_on(&self.conn.lock(), key)
    }

    fn put(&self, ctx: &OpContext, key: &[u8], value: &[u8]) -> Result<(), ProtoKvError> {
        ctx.check()?;
        put_on(&self.conn.lock(), key, value)
    }

    fn delete(&self, ctx: &OpContext, key: &[u8]) -> Result<bool, ProtoKvError> {
        ctx.check()?;
        delete_on(&self.conn.lock(), key)
    }

    fn page(
        &self,
        ctx: &OpContext,
        prefix: &[u8],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        ctx.check()?;
        page_on(&self.conn.lock(), prefix, token, limit)
    }

    fn page_index(
        &self,
        ctx: &OpContext,
        indices: &[Index],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        ctx.check()?;
        page_index_on(&self.conn.lock(), indices, token, limit)
    }
}

impl Tx for SqliteTx {
    fn commit(mut self: Box<Self>) -> Result<(), ProtoKvError> {
        self.conn.lock().execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), ProtoKvError> {
        self.conn.lock().execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.get_mut().execute_batch("ROLLBACK");
        }
    }
}
