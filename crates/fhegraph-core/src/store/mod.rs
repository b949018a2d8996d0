//! Persistent store for events, DFGs, dependency records, and rollups.
//!
//! Backed by SQLite via `rusqlite`. The scheduling model is single-writer,
//! many-reader: exactly one process opens the database read-write (and
//! creates the schema); analyzers may open it read-only and rely on
//! snapshot reads. All multi-row mutations happen inside explicit
//! transactions so no reader ever observes a partial state.

mod dfg;
mod events;
mod rollups;

use std::path::Path;

use alloy::primitives::{Address, B256};
use rusqlite::{Connection, OpenFlags};

use crate::error::CoreError;
use crate::types::{ChainId, Checkpoint};

// ==============================================================================
// Checkpoint Subsystems
// ==============================================================================

pub const CKPT_INGEST: &str = "ingest";
pub const CKPT_DFG_BUILD: &str = "dfg_build";
pub const CKPT_ROLLUP_OP_MIX: &str = "rollup_op_mix";
pub const CKPT_ROLLUP_DEPS: &str = "rollup_deps";
pub const CKPT_ROLLUP_OP_BUCKETS: &str = "rollup_op_buckets";

// ==============================================================================
// Schema
// ==============================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id                    INTEGER PRIMARY KEY,
    chain_id              INTEGER NOT NULL,
    block_number          INTEGER NOT NULL,
    block_hash            TEXT NOT NULL,
    tx_hash               TEXT NOT NULL,
    log_index             INTEGER NOT NULL,
    address               TEXT NOT NULL,
    event_name            TEXT NOT NULL,
    topic0                TEXT NOT NULL,
    data                  TEXT NOT NULL,
    args                  TEXT,
    lhs_type              INTEGER,
    rhs_type              INTEGER,
    result_type           INTEGER,
    control_type          INTEGER,
    if_true_type          INTEGER,
    if_false_type         INTEGER,
    input_type            INTEGER,
    cast_to_type          INTEGER,
    rand_type             INTEGER,
    scalar_flag           INTEGER,
    result_handle_version INTEGER,
    created_at            TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (chain_id, tx_hash, log_index)
);
CREATE INDEX IF NOT EXISTS idx_events_chain_block ON events (chain_id, block_number);
CREATE INDEX IF NOT EXISTS idx_events_chain_name ON events (chain_id, event_name);

CREATE TABLE IF NOT EXISTS dfg_txs (
    chain_id       INTEGER NOT NULL,
    tx_hash        TEXT NOT NULL,
    block_number   INTEGER NOT NULL,
    node_count     INTEGER NOT NULL,
    edge_count     INTEGER NOT NULL,
    depth          INTEGER NOT NULL,
    signature_hash TEXT NOT NULL,
    stats          TEXT NOT NULL,
    PRIMARY KEY (chain_id, tx_hash)
);
CREATE INDEX IF NOT EXISTS idx_dfg_txs_chain_block ON dfg_txs (chain_id, block_number);
CREATE INDEX IF NOT EXISTS idx_dfg_txs_signature ON dfg_txs (chain_id, signature_hash);

CREATE TABLE IF NOT EXISTS dfg_nodes (
    chain_id      INTEGER NOT NULL,
    tx_hash       TEXT NOT NULL,
    node_id       INTEGER NOT NULL,
    op            TEXT NOT NULL,
    output_handle TEXT,
    input_count   INTEGER NOT NULL,
    scalar_flag   INTEGER NOT NULL,
    type_info     TEXT NOT NULL,
    PRIMARY KEY (chain_id, tx_hash, node_id)
);

CREATE TABLE IF NOT EXISTS dfg_edges (
    chain_id     INTEGER NOT NULL,
    tx_hash      TEXT NOT NULL,
    from_node_id INTEGER NOT NULL,
    to_node_id   INTEGER NOT NULL,
    input_handle TEXT NOT NULL,
    PRIMARY KEY (chain_id, tx_hash, from_node_id, to_node_id, input_handle)
);

CREATE TABLE IF NOT EXISTS dfg_inputs (
    chain_id INTEGER NOT NULL,
    tx_hash  TEXT NOT NULL,
    handle   TEXT NOT NULL,
    kind     TEXT NOT NULL,
    PRIMARY KEY (chain_id, tx_hash, handle)
);

CREATE TABLE IF NOT EXISTS dfg_handle_producers (
    chain_id     INTEGER NOT NULL,
    handle       TEXT NOT NULL,
    tx_hash      TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    is_trivial   INTEGER NOT NULL,
    updated_at   TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (chain_id, handle)
);
CREATE INDEX IF NOT EXISTS idx_handle_producers_block
    ON dfg_handle_producers (chain_id, block_number);

CREATE TABLE IF NOT EXISTS dfg_tx_deps (
    chain_id     INTEGER NOT NULL,
    tx_hash      TEXT NOT NULL,
    block_number INTEGER NOT NULL,
    upstream_txs TEXT NOT NULL,
    handle_links INTEGER NOT NULL,
    chain_depth  INTEGER NOT NULL,
    total_depth  INTEGER NOT NULL,
    PRIMARY KEY (chain_id, tx_hash)
);
CREATE INDEX IF NOT EXISTS idx_dfg_tx_deps_chain_block ON dfg_tx_deps (chain_id, block_number);

CREATE TABLE IF NOT EXISTS rollup_op_mix (
    chain_id     INTEGER PRIMARY KEY,
    dfg_tx_count INTEGER NOT NULL,
    stats        TEXT NOT NULL,
    updated_at   TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS rollup_deps (
    chain_id         INTEGER PRIMARY KEY,
    total_txs        INTEGER NOT NULL,
    dependent_txs    INTEGER NOT NULL,
    sum_upstream_txs INTEGER NOT NULL,
    sum_handle_links INTEGER NOT NULL,
    max_chain_depth  INTEGER NOT NULL,
    max_total_depth  INTEGER NOT NULL,
    chain_depth_hist TEXT NOT NULL,
    total_depth_hist TEXT NOT NULL,
    updated_at       TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS rollup_op_buckets (
    chain_id       INTEGER NOT NULL,
    bucket_start   INTEGER NOT NULL,
    bucket_seconds INTEGER NOT NULL,
    event_name     TEXT NOT NULL,
    event_count    INTEGER NOT NULL,
    PRIMARY KEY (chain_id, bucket_start, bucket_seconds, event_name)
);

CREATE TABLE IF NOT EXISTS rollup_chain_stats (
    chain_id            INTEGER PRIMARY KEY,
    dfg_tx_count        INTEGER NOT NULL,
    avg_node_count      REAL NOT NULL,
    min_node_count      INTEGER NOT NULL,
    max_node_count      INTEGER NOT NULL,
    avg_edge_count      REAL NOT NULL,
    max_edge_count      INTEGER NOT NULL,
    max_depth           INTEGER NOT NULL,
    distinct_signatures INTEGER NOT NULL,
    event_count         INTEGER NOT NULL,
    event_tx_count      INTEGER NOT NULL,
    updated_at          TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS checkpoints (
    chain_id     INTEGER NOT NULL,
    subsystem    TEXT NOT NULL,
    last_block   INTEGER NOT NULL,
    last_tx_hash TEXT,
    PRIMARY KEY (chain_id, subsystem)
);
";

// ==============================================================================
// Store
// ==============================================================================

/// Handle to the SQLite database. Reads take `&self`; anything that writes
/// takes `&mut self` and runs inside a transaction.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database read-write and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open an existing database read-only (for analyzers and the query
    /// layer; the schema must already exist).
    pub fn open_read_only(path: &Path) -> Result<Self, CoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// In-memory database with the full schema. Used by tests.
    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn configure(conn: &Connection) -> Result<(), CoreError> {
        // journal_mode returns a row, so query it instead of pragma_update.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    // ==========================================================================
    // Checkpoints
    // ==========================================================================

    pub fn checkpoint(
        &self,
        chain_id: ChainId,
        subsystem: &str,
    ) -> Result<Option<Checkpoint>, CoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT last_block, last_tx_hash FROM checkpoints
             WHERE chain_id = ?1 AND subsystem = ?2",
        )?;
        let row = stmt
            .query_map(rusqlite::params![chain_id.0 as i64, subsystem], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .next()
            .transpose()?;

        match row {
            None => Ok(None),
            Some((last_block, last_tx_hash)) => Ok(Some(Checkpoint {
                last_block: last_block as u64,
                last_tx_hash: last_tx_hash.as_deref().map(parse_b256).transpose()?,
            })),
        }
    }

    pub fn set_checkpoint(
        &mut self,
        chain_id: ChainId,
        subsystem: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), CoreError> {
        upsert_checkpoint(&self.conn, chain_id, subsystem, checkpoint)?;
        Ok(())
    }

    pub fn clear_checkpoint(&mut self, chain_id: ChainId, subsystem: &str) -> Result<(), CoreError> {
        self.conn.execute(
            "DELETE FROM checkpoints WHERE chain_id = ?1 AND subsystem = ?2",
            rusqlite::params![chain_id.0 as i64, subsystem],
        )?;
        Ok(())
    }
}

/// Checkpoint upsert usable both standalone and inside a transaction
/// (a `Transaction` derefs to `Connection`).
pub(crate) fn upsert_checkpoint(
    conn: &Connection,
    chain_id: ChainId,
    subsystem: &str,
    checkpoint: &Checkpoint,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO checkpoints (chain_id, subsystem, last_block, last_tx_hash)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (chain_id, subsystem) DO UPDATE SET
             last_block = excluded.last_block,
             last_tx_hash = excluded.last_tx_hash",
        rusqlite::params![
            chain_id.0 as i64,
            subsystem,
            checkpoint.last_block as i64,
            checkpoint
                .last_tx_hash
                .map(|h| crate::types::to_hex(h.as_slice())),
        ],
    )?;
    Ok(())
}

// ==============================================================================
// Column Conversion Helpers
// ==============================================================================

pub(crate) fn parse_b256(raw: &str) -> Result<B256, CoreError> {
    raw.parse()
        .map_err(|e| CoreError::InvalidEventData(format!("invalid 32-byte hex `{raw}`: {e}")))
}

pub(crate) fn parse_address(raw: &str) -> Result<Address, CoreError> {
    raw.parse()
        .map_err(|e| CoreError::InvalidEventData(format!("invalid address `{raw}`: {e}")))
}

pub(crate) fn opt_u8(value: Option<i64>) -> Option<u8> {
    value.and_then(|v| u8::try_from(v).ok())
}

/// Block numbers come in as u64 but live in signed SQLite columns; open
/// upper bounds (`u64::MAX`) must clamp instead of wrapping negative.
pub(crate) fn block_i64(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}
