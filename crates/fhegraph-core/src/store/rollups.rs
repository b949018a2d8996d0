//! Rollup persistence: per-chain aggregate rows and their checkpoints.
//!
//! Writes pair the aggregate row with its checkpoint in one transaction so
//! a checkpoint never points past state that failed to land. Full rebuilds
//! replace the row (and, for buckets, the whole key range) atomically.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension};

use crate::error::CoreError;
use crate::types::{ChainId, ChainStatsRollup, Checkpoint, DepRollup, OpMixRollup};

use super::{upsert_checkpoint, Store, CKPT_ROLLUP_DEPS, CKPT_ROLLUP_OP_BUCKETS, CKPT_ROLLUP_OP_MIX};

impl Store {
    // ==========================================================================
    // Op-Mix Rollup
    // ==========================================================================

    pub fn op_mix_rollup(&self, chain_id: ChainId) -> Result<Option<OpMixRollup>, CoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT dfg_tx_count, stats FROM rollup_op_mix WHERE chain_id = ?1",
                params![chain_id.0 as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((count, stats)) => Ok(Some(OpMixRollup {
                dfg_tx_count: count as u64,
                stats: serde_json::from_str(&stats).map_err(|e| {
                    CoreError::InvalidEventData(format!("stored op-mix stats are invalid: {e}"))
                })?,
            })),
        }
    }

    /// Replace the op-mix row and advance its checkpoint atomically.
    pub fn put_op_mix_rollup(
        &mut self,
        chain_id: ChainId,
        rollup: &OpMixRollup,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<(), CoreError> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO rollup_op_mix (chain_id, dfg_tx_count, stats, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT (chain_id) DO UPDATE SET
                 dfg_tx_count = excluded.dfg_tx_count,
                 stats = excluded.stats,
                 updated_at = excluded.updated_at",
            params![
                chain_id.0 as i64,
                rollup.dfg_tx_count as i64,
                serde_json::to_string(&rollup.stats).expect("stats serialize"),
            ],
        )?;
        if let Some(checkpoint) = checkpoint {
            upsert_checkpoint(&tx, chain_id, CKPT_ROLLUP_OP_MIX, checkpoint)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ==========================================================================
    // Dependency Rollup
    // ==========================================================================

    pub fn dep_rollup(&self, chain_id: ChainId) -> Result<Option<DepRollup>, CoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT total_txs, dependent_txs, sum_upstream_txs, sum_handle_links,
                        max_chain_depth, max_total_depth, chain_depth_hist, total_depth_hist
                 FROM rollup_deps WHERE chain_id = ?1",
                params![chain_id.0 as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((total, dependent, sum_up, sum_links, max_chain, max_total, chain_hist, total_hist)) => {
                let parse_hist = |raw: &str| -> Result<BTreeMap<u32, u64>, CoreError> {
                    serde_json::from_str(raw).map_err(|e| {
                        CoreError::InvalidEventData(format!("stored depth histogram is invalid: {e}"))
                    })
                };
                Ok(Some(DepRollup {
                    total_txs: total as u64,
                    dependent_txs: dependent as u64,
                    sum_upstream_txs: sum_up as u64,
                    sum_handle_links: sum_links as u64,
                    max_chain_depth: max_chain as u32,
                    max_total_depth: max_total as u32,
                    chain_depth_hist: parse_hist(&chain_hist)?,
                    total_depth_hist: parse_hist(&total_hist)?,
                }))
            }
        }
    }

    /// Replace the dependency rollup row and advance its checkpoint.
    pub fn put_dep_rollup(
        &mut self,
        chain_id: ChainId,
        rollup: &DepRollup,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<(), CoreError> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO rollup_deps
                 (chain_id, total_txs, dependent_txs, sum_upstream_txs, sum_handle_links,
                  max_chain_depth, max_total_depth, chain_depth_hist, total_depth_hist,
                  updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
             ON CONFLICT (chain_id) DO UPDATE SET
                 total_txs = excluded.total_txs,
                 dependent_txs = excluded.dependent_txs,
                 sum_upstream_txs = excluded.sum_upstream_txs,
                 sum_handle_links = excluded.sum_handle_links,
                 max_chain_depth = excluded.max_chain_depth,
                 max_total_depth = excluded.max_total_depth,
                 chain_depth_hist = excluded.chain_depth_hist,
                 total_depth_hist = excluded.total_depth_hist,
                 updated_at = excluded.updated_at",
            params![
                chain_id.0 as i64,
                rollup.total_txs as i64,
                rollup.dependent_txs as i64,
                rollup.sum_upstream_txs as i64,
                rollup.sum_handle_links as i64,
                rollup.max_chain_depth as i64,
                rollup.max_total_depth as i64,
                serde_json::to_string(&rollup.chain_depth_hist).expect("histogram serializes"),
                serde_json::to_string(&rollup.total_depth_hist).expect("histogram serializes"),
            ],
        )?;
        if let Some(checkpoint) = checkpoint {
            upsert_checkpoint(&tx, chain_id, CKPT_ROLLUP_DEPS, checkpoint)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Full-rebuild aggregation straight from the dependency table with
    /// COUNT/SUM/MAX aggregates plus GROUP BY histograms.
    pub fn dep_rollup_full(&self, chain_id: ChainId) -> Result<DepRollup, CoreError> {
        let (total, dependent, sum_up, sum_links, max_chain, max_total) =
            self.conn().query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN handle_links > 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN handle_links > 0
                                          THEN json_array_length(upstream_txs) ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN handle_links > 0 THEN handle_links ELSE 0 END), 0),
                        COALESCE(MAX(chain_depth), 0),
                        COALESCE(MAX(total_depth), 0)
                 FROM dfg_tx_deps WHERE chain_id = ?1",
                params![chain_id.0 as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )?;

        let mut rollup = DepRollup {
            total_txs: total as u64,
            dependent_txs: dependent as u64,
            sum_upstream_txs: sum_up as u64,
            sum_handle_links: sum_links as u64,
            max_chain_depth: max_chain as u32,
            max_total_depth: max_total as u32,
            chain_depth_hist: BTreeMap::new(),
            total_depth_hist: BTreeMap::new(),
        };

        for (column, hist) in [
            ("chain_depth", &mut rollup.chain_depth_hist),
            ("total_depth", &mut rollup.total_depth_hist),
        ] {
            let mut stmt = self.conn().prepare(&format!(
                "SELECT {column}, COUNT(*) FROM dfg_tx_deps
                 WHERE chain_id = ?1 GROUP BY {column}"
            ))?;
            let rows = stmt.query_map(params![chain_id.0 as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (depth, count) = row?;
                hist.insert(depth as u32, count as u64);
            }
        }
        Ok(rollup)
    }

    /// Latest `(block_number, tx_hash)` position in the dependency table,
    /// used as the checkpoint after a full rebuild.
    pub fn last_dep_position(
        &self,
        chain_id: ChainId,
    ) -> Result<Option<(u64, alloy::primitives::B256)>, CoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT block_number, tx_hash FROM dfg_tx_deps
                 WHERE chain_id = ?1 ORDER BY block_number DESC, tx_hash DESC LIMIT 1",
                params![chain_id.0 as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((block, tx)) => Ok(Some((block as u64, super::parse_b256(&tx)?))),
        }
    }

    // ==========================================================================
    // Op-Bucket Rollup
    // ==========================================================================

    /// Apply bucket deltas additively (same bucket key sums) and advance
    /// the bucket checkpoint, all in one transaction. With `reset`, the
    /// chain's buckets are cleared first (full rebuild).
    pub fn apply_op_buckets(
        &mut self,
        chain_id: ChainId,
        bucket_seconds: u64,
        counts: &BTreeMap<(u64, String), u64>,
        last_block: Option<u64>,
        reset: bool,
    ) -> Result<(), CoreError> {
        let tx = self.conn_mut().transaction()?;
        if reset {
            tx.execute(
                "DELETE FROM rollup_op_buckets WHERE chain_id = ?1",
                params![chain_id.0 as i64],
            )?;
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO rollup_op_buckets
                     (chain_id, bucket_start, bucket_seconds, event_name, event_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (chain_id, bucket_start, bucket_seconds, event_name)
                 DO UPDATE SET event_count = event_count + excluded.event_count",
            )?;
            for ((bucket_start, event_name), count) in counts {
                stmt.execute(params![
                    chain_id.0 as i64,
                    *bucket_start as i64,
                    bucket_seconds as i64,
                    event_name,
                    *count as i64,
                ])?;
            }
        }
        if let Some(last_block) = last_block {
            upsert_checkpoint(
                &tx,
                chain_id,
                CKPT_ROLLUP_OP_BUCKETS,
                &Checkpoint {
                    last_block,
                    last_tx_hash: None,
                },
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All bucket rows for a chain, ordered by `(bucket_start, event_name)`.
    pub fn op_buckets(
        &self,
        chain_id: ChainId,
    ) -> Result<Vec<(u64, u64, String, u64)>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT bucket_start, bucket_seconds, event_name, event_count
             FROM rollup_op_buckets WHERE chain_id = ?1
             ORDER BY bucket_start ASC, bucket_seconds ASC, event_name ASC",
        )?;
        let rows = stmt.query_map(params![chain_id.0 as i64], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? as u64,
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    // ==========================================================================
    // Chain Stats Rollup
    // ==========================================================================

    /// COUNT/AVG/MIN/MAX/DISTINCT aggregates over the DFG summaries, plus
    /// raw event-log cross-reference counters.
    pub fn compute_chain_stats(&self, chain_id: ChainId) -> Result<ChainStatsRollup, CoreError> {
        let (count, avg_nodes, min_nodes, max_nodes, avg_edges, max_edges, max_depth, distinct) =
            self.conn().query_row(
                "SELECT COUNT(*),
                        COALESCE(AVG(node_count), 0.0),
                        COALESCE(MIN(node_count), 0),
                        COALESCE(MAX(node_count), 0),
                        COALESCE(AVG(edge_count), 0.0),
                        COALESCE(MAX(edge_count), 0),
                        COALESCE(MAX(depth), 0),
                        COUNT(DISTINCT signature_hash)
                 FROM dfg_txs WHERE chain_id = ?1",
                params![chain_id.0 as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )?;

        Ok(ChainStatsRollup {
            dfg_tx_count: count as u64,
            avg_node_count: avg_nodes,
            min_node_count: min_nodes as u64,
            max_node_count: max_nodes as u64,
            avg_edge_count: avg_edges,
            max_edge_count: max_edges as u64,
            max_depth: max_depth as u32,
            distinct_signatures: distinct as u64,
            event_count: self.event_count(chain_id)?,
            event_tx_count: self.event_tx_count(chain_id)?,
        })
    }

    pub fn put_chain_stats(
        &mut self,
        chain_id: ChainId,
        stats: &ChainStatsRollup,
    ) -> Result<(), CoreError> {
        self.conn_mut().execute(
            "INSERT INTO rollup_chain_stats
                 (chain_id, dfg_tx_count, avg_node_count, min_node_count, max_node_count,
                  avg_edge_count, max_edge_count, max_depth, distinct_signatures,
                  event_count, event_tx_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'))
             ON CONFLICT (chain_id) DO UPDATE SET
                 dfg_tx_count = excluded.dfg_tx_count,
                 avg_node_count = excluded.avg_node_count,
                 min_node_count = excluded.min_node_count,
                 max_node_count = excluded.max_node_count,
                 avg_edge_count = excluded.avg_edge_count,
                 max_edge_count = excluded.max_edge_count,
                 max_depth = excluded.max_depth,
                 distinct_signatures = excluded.distinct_signatures,
                 event_count = excluded.event_count,
                 event_tx_count = excluded.event_tx_count,
                 updated_at = excluded.updated_at",
            params![
                chain_id.0 as i64,
                stats.dfg_tx_count as i64,
                stats.avg_node_count,
                stats.min_node_count as i64,
                stats.max_node_count as i64,
                stats.avg_edge_count,
                stats.max_edge_count as i64,
                stats.max_depth as i64,
                stats.distinct_signatures as i64,
                stats.event_count as i64,
                stats.event_tx_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn chain_stats(&self, chain_id: ChainId) -> Result<Option<ChainStatsRollup>, CoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT dfg_tx_count, avg_node_count, min_node_count, max_node_count,
                        avg_edge_count, max_edge_count, max_depth, distinct_signatures,
                        event_count, event_tx_count
                 FROM rollup_chain_stats WHERE chain_id = ?1",
                params![chain_id.0 as i64],
                |row| {
                    Ok(ChainStatsRollup {
                        dfg_tx_count: row.get::<_, i64>(0)? as u64,
                        avg_node_count: row.get(1)?,
                        min_node_count: row.get::<_, i64>(2)? as u64,
                        max_node_count: row.get::<_, i64>(3)? as u64,
                        avg_edge_count: row.get(4)?,
                        max_edge_count: row.get::<_, i64>(5)? as u64,
                        max_depth: row.get::<_, i64>(6)? as u32,
                        distinct_signatures: row.get::<_, i64>(7)? as u64,
                        event_count: row.get::<_, i64>(8)? as u64,
                        event_tx_count: row.get::<_, i64>(9)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}
