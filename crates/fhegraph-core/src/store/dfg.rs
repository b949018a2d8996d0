//! DFG persistence: per-tx graph rows, the handle-producer registry, and
//! cross-tx dependency records.
//!
//! Each built transaction lands in exactly one SQLite transaction:
//! delete-then-insert for every table keyed by `(chain_id, tx_hash)`, the
//! registry upserts, the dependency record, and the build checkpoint. A
//! failure rolls the whole unit back.

use std::collections::HashMap;

use alloy::primitives::B256;
use rusqlite::{params, OptionalExtension};

use crate::error::CoreError;
use crate::types::{
    to_hex, ChainId, Checkpoint, DfgEdge, DfgNode, EventName, HandleProducer, InputKind,
    NodeInput, TxDependency, TxDfg, TxDfgSummary,
};

use super::{parse_b256, upsert_checkpoint, Store, CKPT_DFG_BUILD};

fn parse_stats(raw: &str) -> Result<crate::types::DfgStats, CoreError> {
    serde_json::from_str(raw)
        .map_err(|e| CoreError::InvalidEventData(format!("stored stats are not valid JSON: {e}")))
}

fn parse_type_info(raw: &str) -> Result<Vec<NodeInput>, CoreError> {
    serde_json::from_str(raw).map_err(|e| {
        CoreError::InvalidEventData(format!("stored type_info is not valid JSON: {e}"))
    })
}

fn parse_input_kind(raw: &str) -> Result<InputKind, CoreError> {
    match raw {
        "ciphertext" => Ok(InputKind::Ciphertext),
        "trivial" => Ok(InputKind::Trivial),
        "external" => Ok(InputKind::External),
        "scalar" => Ok(InputKind::Scalar),
        other => Err(CoreError::InvalidEventData(format!(
            "unknown input kind `{other}`"
        ))),
    }
}

impl Store {
    /// Persist one built tx atomically: DFG rows, registry upserts, the
    /// dependency record, and the `dfg_build` checkpoint.
    pub fn commit_tx_build(
        &mut self,
        dfg: &TxDfg,
        dep: &TxDependency,
    ) -> Result<(), CoreError> {
        let chain = dfg.chain_id.0 as i64;
        let tx_hex = to_hex(dfg.tx_hash.as_slice());

        let tx = self.conn_mut().transaction()?;

        for table in ["dfg_nodes", "dfg_edges", "dfg_inputs", "dfg_txs", "dfg_tx_deps"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE chain_id = ?1 AND tx_hash = ?2"),
                params![chain, tx_hex],
            )?;
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO dfg_nodes
                     (chain_id, tx_hash, node_id, op, output_handle, input_count,
                      scalar_flag, type_info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for node in &dfg.nodes {
                stmt.execute(params![
                    chain,
                    tx_hex,
                    node.node_id as i64,
                    node.op.as_str(),
                    node.output_handle.map(|h| to_hex(h.as_slice())),
                    node.input_count as i64,
                    node.scalar_flag as i64,
                    serde_json::to_string(&node.inputs).expect("type_info serializes"),
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO dfg_edges
                     (chain_id, tx_hash, from_node_id, to_node_id, input_handle)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for edge in &dfg.edges {
                stmt.execute(params![
                    chain,
                    tx_hex,
                    edge.from_node_id as i64,
                    edge.to_node_id as i64,
                    to_hex(edge.input_handle.as_slice()),
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO dfg_inputs (chain_id, tx_hash, handle, kind)
                 VALUES (?1, ?2, ?3, 'external')",
            )?;
            for handle in &dfg.external_inputs {
                stmt.execute(params![chain, tx_hex, to_hex(handle.as_slice())])?;
            }
        }

        tx.execute(
            "INSERT INTO dfg_txs
                 (chain_id, tx_hash, block_number, node_count, edge_count, depth,
                  signature_hash, stats)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chain,
                tx_hex,
                dfg.block_number as i64,
                dfg.nodes.len() as i64,
                dfg.edges.len() as i64,
                dfg.depth as i64,
                dfg.signature,
                serde_json::to_string(&dfg.stats).expect("stats serialize"),
            ],
        )?;

        // Registry: latest block wins; equal blocks resolve to the row
        // written last (build order), per I7.
        {
            let mut stmt = tx.prepare(
                "INSERT INTO dfg_handle_producers
                     (chain_id, handle, tx_hash, block_number, is_trivial, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
                 ON CONFLICT (chain_id, handle) DO UPDATE SET
                     tx_hash = excluded.tx_hash,
                     block_number = excluded.block_number,
                     is_trivial = excluded.is_trivial,
                     updated_at = excluded.updated_at
                 WHERE excluded.block_number >= dfg_handle_producers.block_number",
            )?;
            for node in &dfg.nodes {
                let Some(handle) = node.output_handle else {
                    continue;
                };
                let is_trivial = node.op == EventName::TrivialEncrypt;
                stmt.execute(params![
                    chain,
                    to_hex(handle.as_slice()),
                    tx_hex,
                    dfg.block_number as i64,
                    is_trivial as i64,
                ])?;
            }
        }

        tx.execute(
            "INSERT INTO dfg_tx_deps
                 (chain_id, tx_hash, block_number, upstream_txs, handle_links,
                  chain_depth, total_depth)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chain,
                tx_hex,
                dep.block_number as i64,
                serde_json::to_string(&dep.upstream_txs).expect("upstream list serializes"),
                dep.handle_links as i64,
                dep.chain_depth as i64,
                dep.total_depth as i64,
            ],
        )?;

        upsert_checkpoint(
            &tx,
            dfg.chain_id,
            CKPT_DFG_BUILD,
            &Checkpoint {
                last_block: dfg.block_number,
                last_tx_hash: Some(dfg.tx_hash),
            },
        )?;

        tx.commit()?;
        Ok(())
    }

    // ==========================================================================
    // Per-Tx Reads
    // ==========================================================================

    pub fn dfg_summary(
        &self,
        chain_id: ChainId,
        tx_hash: B256,
    ) -> Result<Option<TxDfgSummary>, CoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT block_number, node_count, edge_count, depth, signature_hash, stats
                 FROM dfg_txs WHERE chain_id = ?1 AND tx_hash = ?2",
                params![chain_id.0 as i64, to_hex(tx_hash.as_slice())],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((block, nodes, edges, depth, signature, stats)) => Ok(Some(TxDfgSummary {
                chain_id,
                tx_hash,
                block_number: block as u64,
                node_count: nodes as u64,
                edge_count: edges as u64,
                depth: depth as u32,
                signature,
                stats: parse_stats(&stats)?,
            })),
        }
    }

    pub fn dfg_nodes_for_tx(
        &self,
        chain_id: ChainId,
        tx_hash: B256,
    ) -> Result<Vec<DfgNode>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT node_id, op, output_handle, input_count, scalar_flag, type_info
             FROM dfg_nodes WHERE chain_id = ?1 AND tx_hash = ?2
             ORDER BY node_id ASC",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, to_hex(tx_hash.as_slice())],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;
        let mut nodes = Vec::new();
        for row in rows {
            let (node_id, op, output, input_count, scalar_flag, type_info) = row?;
            nodes.push(DfgNode {
                node_id: node_id as u64,
                op: EventName::from_name(&op),
                output_handle: output.as_deref().map(parse_b256).transpose()?,
                input_count: input_count as u32,
                scalar_flag: scalar_flag as u8,
                inputs: parse_type_info(&type_info)?,
            });
        }
        Ok(nodes)
    }

    pub fn dfg_edges_for_tx(
        &self,
        chain_id: ChainId,
        tx_hash: B256,
    ) -> Result<Vec<DfgEdge>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT from_node_id, to_node_id, input_handle
             FROM dfg_edges WHERE chain_id = ?1 AND tx_hash = ?2
             ORDER BY from_node_id ASC, to_node_id ASC, input_handle ASC",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, to_hex(tx_hash.as_slice())],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;
        let mut edges = Vec::new();
        for row in rows {
            let (from, to, handle) = row?;
            edges.push(DfgEdge {
                from_node_id: from as u64,
                to_node_id: to as u64,
                input_handle: parse_b256(&handle)?,
            });
        }
        Ok(edges)
    }

    pub fn dfg_inputs_for_tx(
        &self,
        chain_id: ChainId,
        tx_hash: B256,
    ) -> Result<Vec<(B256, InputKind)>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT handle, kind FROM dfg_inputs
             WHERE chain_id = ?1 AND tx_hash = ?2 ORDER BY handle ASC",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, to_hex(tx_hash.as_slice())],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut inputs = Vec::new();
        for row in rows {
            let (handle, kind) = row?;
            inputs.push((parse_b256(&handle)?, parse_input_kind(&kind)?));
        }
        Ok(inputs)
    }

    /// Intra-tx depth of a built tx, if its DFG summary exists.
    pub fn tx_depth(&self, chain_id: ChainId, tx_hash: B256) -> Result<Option<u32>, CoreError> {
        let depth: Option<i64> = self
            .conn()
            .query_row(
                "SELECT depth FROM dfg_txs WHERE chain_id = ?1 AND tx_hash = ?2",
                params![chain_id.0 as i64, to_hex(tx_hash.as_slice())],
                |row| row.get(0),
            )
            .optional()?;
        Ok(depth.map(|d| d as u32))
    }

    /// Block number of a built tx, if its DFG summary exists.
    pub fn tx_block(&self, chain_id: ChainId, tx_hash: B256) -> Result<Option<u64>, CoreError> {
        let block: Option<i64> = self
            .conn()
            .query_row(
                "SELECT block_number FROM dfg_txs WHERE chain_id = ?1 AND tx_hash = ?2",
                params![chain_id.0 as i64, to_hex(tx_hash.as_slice())],
                |row| row.get(0),
            )
            .optional()?;
        Ok(block.map(|b| b as u64))
    }

    // ==========================================================================
    // Handle-Producer Registry
    // ==========================================================================

    /// Producer of a handle among blocks `<= max_block`, if any. The
    /// registry keeps only the latest producer; a later-block producer
    /// hides earlier ones even for windowed lookups.
    pub fn handle_producer(
        &self,
        chain_id: ChainId,
        handle: B256,
        max_block: u64,
    ) -> Result<Option<HandleProducer>, CoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT tx_hash, block_number, is_trivial FROM dfg_handle_producers
                 WHERE chain_id = ?1 AND handle = ?2 AND block_number <= ?3",
                params![
                    chain_id.0 as i64,
                    to_hex(handle.as_slice()),
                    super::block_i64(max_block)
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((tx_hash, block, is_trivial)) => Ok(Some(HandleProducer {
                tx_hash: parse_b256(&tx_hash)?,
                block_number: block as u64,
                is_trivial: is_trivial != 0,
            })),
        }
    }

    // ==========================================================================
    // Dependency Records
    // ==========================================================================

    pub fn tx_dependency(
        &self,
        chain_id: ChainId,
        tx_hash: B256,
    ) -> Result<Option<TxDependency>, CoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT block_number, upstream_txs, handle_links, chain_depth, total_depth
                 FROM dfg_tx_deps WHERE chain_id = ?1 AND tx_hash = ?2",
                params![chain_id.0 as i64, to_hex(tx_hash.as_slice())],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((block, upstream, links, chain_depth, total_depth)) => {
                let upstream_txs: Vec<B256> = serde_json::from_str(&upstream).map_err(|e| {
                    CoreError::InvalidEventData(format!("stored upstream list is invalid: {e}"))
                })?;
                Ok(Some(TxDependency {
                    chain_id,
                    tx_hash,
                    block_number: block as u64,
                    upstream_txs,
                    handle_links: links as u64,
                    chain_depth: chain_depth as u32,
                    total_depth: total_depth as u32,
                }))
            }
        }
    }

    // ==========================================================================
    // Rollup Scans
    // ==========================================================================

    /// DFG summaries strictly after the given `(block, tx)` position, in
    /// `(block_number, tx_hash)` ascending order.
    pub fn dfg_summaries_after(
        &self,
        chain_id: ChainId,
        after: Option<(u64, B256)>,
    ) -> Result<Vec<TxDfgSummary>, CoreError> {
        let (after_block, after_tx) = match after {
            Some((block, tx)) => (block as i64, to_hex(tx.as_slice())),
            None => (-1, String::new()),
        };
        let mut stmt = self.conn().prepare(
            "SELECT tx_hash, block_number, node_count, edge_count, depth, signature_hash, stats
             FROM dfg_txs
             WHERE chain_id = ?1
               AND (block_number > ?2 OR (block_number = ?2 AND tx_hash > ?3))
             ORDER BY block_number ASC, tx_hash ASC",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, after_block, after_tx],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?;
        let mut summaries = Vec::new();
        for row in rows {
            let (tx_hash, block, nodes, edges, depth, signature, stats) = row?;
            summaries.push(TxDfgSummary {
                chain_id,
                tx_hash: parse_b256(&tx_hash)?,
                block_number: block as u64,
                node_count: nodes as u64,
                edge_count: edges as u64,
                depth: depth as u32,
                signature,
                stats: parse_stats(&stats)?,
            });
        }
        Ok(summaries)
    }

    /// Dependency records strictly after the given position, ordered.
    pub fn deps_after(
        &self,
        chain_id: ChainId,
        after: Option<(u64, B256)>,
    ) -> Result<Vec<TxDependency>, CoreError> {
        let (after_block, after_tx) = match after {
            Some((block, tx)) => (block as i64, to_hex(tx.as_slice())),
            None => (-1, String::new()),
        };
        let mut stmt = self.conn().prepare(
            "SELECT tx_hash, block_number, upstream_txs, handle_links, chain_depth, total_depth
             FROM dfg_tx_deps
             WHERE chain_id = ?1
               AND (block_number > ?2 OR (block_number = ?2 AND tx_hash > ?3))
             ORDER BY block_number ASC, tx_hash ASC",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, after_block, after_tx],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )?;
        let mut deps = Vec::new();
        for row in rows {
            let (tx_hash, block, upstream, links, chain_depth, total_depth) = row?;
            let upstream_txs: Vec<B256> = serde_json::from_str(&upstream).map_err(|e| {
                CoreError::InvalidEventData(format!("stored upstream list is invalid: {e}"))
            })?;
            deps.push(TxDependency {
                chain_id,
                tx_hash: parse_b256(&tx_hash)?,
                block_number: block as u64,
                upstream_txs,
                handle_links: links as u64,
                chain_depth: chain_depth as u32,
                total_depth: total_depth as u32,
            });
        }
        Ok(deps)
    }

    // ==========================================================================
    // Intra-Block Views (cycle detector)
    // ==========================================================================

    /// Built txs of one block, sorted by tx hash (build order).
    pub fn dfg_txs_in_block(
        &self,
        chain_id: ChainId,
        block_number: u64,
    ) -> Result<Vec<B256>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT tx_hash FROM dfg_txs
             WHERE chain_id = ?1 AND block_number = ?2 ORDER BY tx_hash ASC",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, block_number as i64],
            |row| row.get::<_, String>(0),
        )?;
        let mut txs = Vec::new();
        for row in rows {
            txs.push(parse_b256(&row?)?);
        }
        Ok(txs)
    }

    /// `(producing tx, output handle)` pairs of one block, in build order
    /// (tx hash, then node id) so later producers win map insertion.
    pub fn block_output_handles(
        &self,
        chain_id: ChainId,
        block_number: u64,
    ) -> Result<Vec<(B256, B256)>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT n.tx_hash, n.output_handle
             FROM dfg_nodes n
             JOIN dfg_txs t ON t.chain_id = n.chain_id AND t.tx_hash = n.tx_hash
             WHERE n.chain_id = ?1 AND t.block_number = ?2 AND n.output_handle IS NOT NULL
             ORDER BY n.tx_hash ASC, n.node_id ASC",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, block_number as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut pairs = Vec::new();
        for row in rows {
            let (tx, handle) = row?;
            pairs.push((parse_b256(&tx)?, parse_b256(&handle)?));
        }
        Ok(pairs)
    }

    /// `(consuming tx, external handle)` pairs of one block.
    pub fn block_external_inputs(
        &self,
        chain_id: ChainId,
        block_number: u64,
    ) -> Result<Vec<(B256, B256)>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT i.tx_hash, i.handle
             FROM dfg_inputs i
             JOIN dfg_txs t ON t.chain_id = i.chain_id AND t.tx_hash = i.tx_hash
             WHERE i.chain_id = ?1 AND t.block_number = ?2
             ORDER BY i.tx_hash ASC, i.handle ASC",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, block_number as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut pairs = Vec::new();
        for row in rows {
            let (tx, handle) = row?;
            pairs.push((parse_b256(&tx)?, parse_b256(&handle)?));
        }
        Ok(pairs)
    }

    /// First (minimum) node id per built tx in a block, for the
    /// forward-edge diagnostic.
    pub fn block_first_node_ids(
        &self,
        chain_id: ChainId,
        block_number: u64,
    ) -> Result<HashMap<B256, u64>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT n.tx_hash, MIN(n.node_id)
             FROM dfg_nodes n
             JOIN dfg_txs t ON t.chain_id = n.chain_id AND t.tx_hash = n.tx_hash
             WHERE n.chain_id = ?1 AND t.block_number = ?2
             GROUP BY n.tx_hash",
        )?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, block_number as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        let mut first = HashMap::new();
        for row in rows {
            let (tx, node_id) = row?;
            first.insert(parse_b256(&tx)?, node_id as u64);
        }
        Ok(first)
    }

    /// Distinct block numbers with built DFGs in `[from, to]`, ascending.
    pub fn blocks_with_dfgs(
        &self,
        chain_id: ChainId,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<u64>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT block_number FROM dfg_txs
             WHERE chain_id = ?1 AND block_number >= ?2 AND block_number <= ?3
             ORDER BY block_number ASC",
        )?;
        let rows = stmt.query_map(
            params![
                chain_id.0 as i64,
                super::block_i64(from_block),
                super::block_i64(to_block)
            ],
            |row| row.get::<_, i64>(0),
        )?;
        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row? as u64);
        }
        Ok(blocks)
    }
}
