//! Event-log persistence: append-only inserts, per-tx ordered reads, and
//! the scans the builders and rollups run over the log.

use alloy::primitives::B256;
use rusqlite::{params, Connection, Row};

use crate::error::CoreError;
use crate::types::{to_hex, ChainId, Checkpoint, DerivedFields, EventName, EventRecord};

use super::{opt_u8, parse_address, parse_b256, upsert_checkpoint, Store, CKPT_INGEST};

const EVENT_COLUMNS: &str = "chain_id, block_number, block_hash, tx_hash, log_index, address, \
     event_name, topic0, data, args, lhs_type, rhs_type, result_type, control_type, \
     if_true_type, if_false_type, input_type, cast_to_type, rand_type, scalar_flag, \
     result_handle_version";

/// Raw row image; hex/JSON parsing happens after the rusqlite layer so
/// conversion failures surface as `CoreError`, not mapped row errors.
struct RawEvent {
    chain_id: i64,
    block_number: i64,
    block_hash: String,
    tx_hash: String,
    log_index: i64,
    address: String,
    event_name: String,
    topic0: String,
    data: String,
    args: Option<String>,
    derived: [Option<i64>; 11],
}

fn read_raw_event(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        chain_id: row.get(0)?,
        block_number: row.get(1)?,
        block_hash: row.get(2)?,
        tx_hash: row.get(3)?,
        log_index: row.get(4)?,
        address: row.get(5)?,
        event_name: row.get(6)?,
        topic0: row.get(7)?,
        data: row.get(8)?,
        args: row.get(9)?,
        derived: [
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
            row.get(14)?,
            row.get(15)?,
            row.get(16)?,
            row.get(17)?,
            row.get(18)?,
            row.get(19)?,
            row.get(20)?,
        ],
    })
}

impl RawEvent {
    fn into_event(self) -> Result<EventRecord, CoreError> {
        let args = match self.args {
            None => None,
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                CoreError::InvalidEventData(format!("stored args are not valid JSON: {e}"))
            })?),
        };
        let [lhs, rhs, result, control, if_true, if_false, input, cast_to, rand, scalar, version] =
            self.derived;
        Ok(EventRecord {
            chain_id: ChainId(self.chain_id as u64),
            block_number: self.block_number as u64,
            block_hash: parse_b256(&self.block_hash)?,
            tx_hash: parse_b256(&self.tx_hash)?,
            log_index: self.log_index as u64,
            address: parse_address(&self.address)?,
            event_name: EventName::from_name(&self.event_name),
            topic0: parse_b256(&self.topic0)?,
            data: self.data,
            args,
            derived: DerivedFields {
                lhs_type: opt_u8(lhs),
                rhs_type: opt_u8(rhs),
                result_type: opt_u8(result),
                control_type: opt_u8(control),
                if_true_type: opt_u8(if_true),
                if_false_type: opt_u8(if_false),
                input_type: opt_u8(input),
                cast_to_type: opt_u8(cast_to),
                rand_type: opt_u8(rand),
                scalar_flag: opt_u8(scalar),
                result_handle_version: opt_u8(version),
            },
        })
    }
}

fn insert_events_in(conn: &Connection, rows: &[EventRecord]) -> Result<u64, CoreError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO events (
             chain_id, block_number, block_hash, tx_hash, log_index, address,
             event_name, topic0, data, args,
             lhs_type, rhs_type, result_type, control_type, if_true_type,
             if_false_type, input_type, cast_to_type, rand_type, scalar_flag,
             result_handle_version
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                   ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
    )?;

    let mut inserted = 0u64;
    for event in rows {
        let args = event
            .args
            .as_ref()
            .map(|value| serde_json::to_string(value).expect("args value serializes"));
        let d = &event.derived;
        inserted += stmt.execute(params![
            event.chain_id.0 as i64,
            event.block_number as i64,
            to_hex(event.block_hash.as_slice()),
            to_hex(event.tx_hash.as_slice()),
            event.log_index as i64,
            to_hex(event.address.as_slice()),
            event.event_name.as_str(),
            to_hex(event.topic0.as_slice()),
            event.data,
            args,
            d.lhs_type.map(i64::from),
            d.rhs_type.map(i64::from),
            d.result_type.map(i64::from),
            d.control_type.map(i64::from),
            d.if_true_type.map(i64::from),
            d.if_false_type.map(i64::from),
            d.input_type.map(i64::from),
            d.cast_to_type.map(i64::from),
            d.rand_type.map(i64::from),
            d.scalar_flag.map(i64::from),
            d.result_handle_version.map(i64::from),
        ])? as u64;
    }
    Ok(inserted)
}

impl Store {
    /// Insert events with duplicate-safe semantics (ignore on conflict with
    /// the `(chain_id, tx_hash, log_index)` unique key). Returns the number
    /// of rows actually inserted.
    pub fn insert_events(&mut self, rows: &[EventRecord]) -> Result<u64, CoreError> {
        let tx = self.conn_mut().transaction()?;
        let inserted = insert_events_in(&tx, rows)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Land one ingest batch atomically: insert its events and advance the
    /// ingest checkpoint to `batch_end`. A failure rolls the whole batch
    /// back, leaving the checkpoint untouched.
    pub fn commit_ingest_batch(
        &mut self,
        chain_id: ChainId,
        rows: &[EventRecord],
        batch_end: u64,
    ) -> Result<u64, CoreError> {
        let tx = self.conn_mut().transaction()?;
        let inserted = insert_events_in(&tx, rows)?;
        upsert_checkpoint(
            &tx,
            chain_id,
            CKPT_INGEST,
            &Checkpoint {
                last_block: batch_end,
                last_tx_hash: None,
            },
        )?;
        tx.commit()?;
        Ok(inserted)
    }

    /// All events of one transaction in ascending `log_index` order.
    pub fn events_for_tx(
        &self,
        chain_id: ChainId,
        tx_hash: B256,
    ) -> Result<Vec<EventRecord>, CoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE chain_id = ?1 AND tx_hash = ?2
             ORDER BY log_index ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![chain_id.0 as i64, to_hex(tx_hash.as_slice())],
            read_raw_event,
        )?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    }

    /// Distinct `(block_number, tx_hash)` pairs strictly after the given
    /// position, in `(block_number, tx_hash)` ascending order. This is the
    /// DFG build work list; the lexicographic resume point makes the build
    /// checkpoint exact.
    pub fn tx_refs_after(
        &self,
        chain_id: ChainId,
        after: Option<(u64, B256)>,
        from_block: Option<u64>,
        to_block: Option<u64>,
    ) -> Result<Vec<(u64, B256)>, CoreError> {
        let (after_block, after_tx) = match after {
            Some((block, tx)) => (block as i64, to_hex(tx.as_slice())),
            // Hex tx hashes sort after the empty string, so this admits all.
            None => (-1, String::new()),
        };
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT block_number, tx_hash FROM events
             WHERE chain_id = ?1
               AND (block_number > ?2 OR (block_number = ?2 AND tx_hash > ?3))
               AND block_number >= ?4
               AND block_number <= ?5
             ORDER BY block_number ASC, tx_hash ASC",
        )?;
        let rows = stmt.query_map(
            params![
                chain_id.0 as i64,
                after_block,
                after_tx,
                from_block.map(super::block_i64).unwrap_or(0),
                to_block.map(super::block_i64).unwrap_or(i64::MAX),
            ],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut refs = Vec::new();
        for row in rows {
            let (block, tx) = row?;
            refs.push((block as u64, parse_b256(&tx)?));
        }
        Ok(refs)
    }

    /// Per-(block, event name) counts strictly after `after_block`, in
    /// block order. Input to the op-bucket rollup.
    pub fn event_block_counts(
        &self,
        chain_id: ChainId,
        after_block: Option<u64>,
    ) -> Result<Vec<(u64, String, u64)>, CoreError> {
        let mut stmt = self.conn().prepare(
            "SELECT block_number, event_name, COUNT(*) FROM events
             WHERE chain_id = ?1 AND block_number > ?2
             GROUP BY block_number, event_name
             ORDER BY block_number ASC, event_name ASC",
        )?;
        let rows = stmt.query_map(
            params![
                chain_id.0 as i64,
                after_block.map(|b| b as i64).unwrap_or(-1)
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    /// Events with a known name and a decoded argument map — the input to
    /// the derived-field backfill pass.
    pub fn decodable_events(&self, chain_id: ChainId) -> Result<Vec<EventRecord>, CoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE chain_id = ?1 AND event_name != 'Unknown' AND args IS NOT NULL
             ORDER BY block_number ASC, tx_hash ASC, log_index ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![chain_id.0 as i64], read_raw_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    }

    /// Overwrite the derived fields of specific events (backfill pass).
    pub fn update_derived_fields(
        &mut self,
        chain_id: ChainId,
        updates: &[(B256, u64, DerivedFields)],
    ) -> Result<u64, CoreError> {
        let tx = self.conn_mut().transaction()?;
        let mut updated = 0u64;
        {
            let mut stmt = tx.prepare(
                "UPDATE events SET
                     lhs_type = ?1, rhs_type = ?2, result_type = ?3, control_type = ?4,
                     if_true_type = ?5, if_false_type = ?6, input_type = ?7,
                     cast_to_type = ?8, rand_type = ?9, scalar_flag = ?10,
                     result_handle_version = ?11
                 WHERE chain_id = ?12 AND tx_hash = ?13 AND log_index = ?14",
            )?;
            for (tx_hash, log_index, d) in updates {
                updated += stmt.execute(params![
                    d.lhs_type.map(i64::from),
                    d.rhs_type.map(i64::from),
                    d.result_type.map(i64::from),
                    d.control_type.map(i64::from),
                    d.if_true_type.map(i64::from),
                    d.if_false_type.map(i64::from),
                    d.input_type.map(i64::from),
                    d.cast_to_type.map(i64::from),
                    d.rand_type.map(i64::from),
                    d.scalar_flag.map(i64::from),
                    d.result_handle_version.map(i64::from),
                    chain_id.0 as i64,
                    to_hex(tx_hash.as_slice()),
                    *log_index as i64,
                ])? as u64;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    pub fn event_count(&self, chain_id: ChainId) -> Result<u64, CoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM events WHERE chain_id = ?1",
            params![chain_id.0 as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn event_tx_count(&self, chain_id: ChainId) -> Result<u64, CoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(DISTINCT tx_hash) FROM events WHERE chain_id = ?1",
            params![chain_id.0 as i64],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use crate::types::Checkpoint;

    const CHAIN: ChainId = ChainId(1);

    #[test]
    fn insert_and_read_back_preserves_fields() {
        let mut store = Store::in_memory().expect("open store");
        let tx = tx_hash(1);
        let event = binary_event(
            CHAIN,
            tx,
            100,
            0,
            EventName::FheAdd,
            handle(2, 1),
            handle(2, 2),
            0x00,
            handle(2, 3),
        );

        assert_eq!(store.insert_events(&[event.clone()]).expect("insert"), 1);

        let loaded = store.events_for_tx(CHAIN, tx).expect("read");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].event_name, EventName::FheAdd);
        assert_eq!(loaded[0].block_number, 100);
        assert_eq!(loaded[0].log_index, 0);
        assert_eq!(loaded[0].args, event.args);
        assert_eq!(loaded[0].derived, event.derived);
    }

    #[test]
    fn duplicate_inserts_are_ignored() {
        let mut store = Store::in_memory().expect("open store");
        let event = trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle(3, 1));

        assert_eq!(store.insert_events(&[event.clone()]).expect("first"), 1);
        assert_eq!(store.insert_events(&[event]).expect("second"), 0);
        assert_eq!(store.event_count(CHAIN).expect("count"), 1);
    }

    #[test]
    fn events_for_tx_ordered_by_log_index() {
        let mut store = Store::in_memory().expect("open store");
        let tx = tx_hash(1);
        let later = trivial_event(CHAIN, tx, 100, 5, 3, handle(3, 2));
        let earlier = trivial_event(CHAIN, tx, 100, 2, 3, handle(3, 1));
        store.insert_events(&[later, earlier]).expect("insert");

        let loaded = store.events_for_tx(CHAIN, tx).expect("read");
        assert_eq!(loaded[0].log_index, 2);
        assert_eq!(loaded[1].log_index, 5);
    }

    #[test]
    fn commit_ingest_batch_advances_checkpoint_atomically() {
        let mut store = Store::in_memory().expect("open store");
        let event = trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle(3, 1));
        store
            .commit_ingest_batch(CHAIN, &[event], 120)
            .expect("commit batch");

        assert_eq!(
            store.checkpoint(CHAIN, CKPT_INGEST).expect("read"),
            Some(Checkpoint {
                last_block: 120,
                last_tx_hash: None
            })
        );
    }

    #[test]
    fn tx_refs_after_orders_and_resumes_lexicographically() {
        let mut store = Store::in_memory().expect("open store");
        // Two txs in block 100, one in block 101.
        store
            .insert_events(&[
                trivial_event(CHAIN, tx_hash(2), 100, 0, 3, handle(3, 1)),
                trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle(3, 2)),
                trivial_event(CHAIN, tx_hash(3), 101, 0, 3, handle(3, 3)),
            ])
            .expect("insert");

        let all = store
            .tx_refs_after(CHAIN, None, None, None)
            .expect("refs");
        assert_eq!(
            all,
            vec![(100, tx_hash(1)), (100, tx_hash(2)), (101, tx_hash(3))]
        );

        let resumed = store
            .tx_refs_after(CHAIN, Some((100, tx_hash(1))), None, None)
            .expect("refs");
        assert_eq!(resumed, vec![(100, tx_hash(2)), (101, tx_hash(3))]);

        let bounded = store
            .tx_refs_after(CHAIN, None, Some(101), Some(101))
            .expect("refs");
        assert_eq!(bounded, vec![(101, tx_hash(3))]);
    }

    #[test]
    fn event_block_counts_group_by_block_and_name() {
        let mut store = Store::in_memory().expect("open store");
        store
            .insert_events(&[
                trivial_event(CHAIN, tx_hash(1), 100, 0, 3, handle(3, 1)),
                trivial_event(CHAIN, tx_hash(1), 100, 1, 3, handle(3, 2)),
                binary_event(
                    CHAIN,
                    tx_hash(2),
                    101,
                    0,
                    EventName::FheAdd,
                    handle(2, 1),
                    handle(2, 2),
                    0x00,
                    handle(2, 3),
                ),
            ])
            .expect("insert");

        let counts = store.event_block_counts(CHAIN, None).expect("counts");
        assert_eq!(
            counts,
            vec![
                (100, "TrivialEncrypt".to_owned(), 2),
                (101, "FheAdd".to_owned(), 1),
            ]
        );

        let after = store.event_block_counts(CHAIN, Some(100)).expect("counts");
        assert_eq!(after, vec![(101, "FheAdd".to_owned(), 1)]);
    }

    #[test]
    fn update_derived_fields_overwrites_row() {
        let mut store = Store::in_memory().expect("open store");
        let tx = tx_hash(1);
        let mut event = trivial_event(CHAIN, tx, 100, 0, 3, handle(3, 1));
        event.derived = DerivedFields::default(); // simulate a pre-backfill row
        store.insert_events(&[event]).expect("insert");

        let fresh = DerivedFields {
            cast_to_type: Some(3),
            result_type: Some(3),
            result_handle_version: Some(1),
            ..DerivedFields::default()
        };
        let updated = store
            .update_derived_fields(CHAIN, &[(tx, 0, fresh.clone())])
            .expect("update");
        assert_eq!(updated, 1);

        let loaded = store.events_for_tx(CHAIN, tx).expect("read");
        assert_eq!(loaded[0].derived, fresh);
    }
}
