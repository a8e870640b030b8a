use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};

use pulse_core::StorageLimits;

use crate::database::Database;
use crate::error::StoreError;

/// Number of custom-dimension slots in the info record.
pub const CUSTOM_DIMENSIONS: usize = 4;

/// The durable event store: unstaged/staged events, sequenced upload
/// headers, and the singleton info record. All mutations are serialized
/// through the underlying connection mutex; multi-step operations run
/// inside named savepoint transactions.
pub struct EventStore {
    db: Database,
    limits: StorageLimits,
}

/// Handle to the store inside a transaction (or a plain read). Borrowed
/// from [`EventStore::transaction`] / the read path; never outlives the
/// connection lock, so no other writer can interleave.
pub struct StoreTxn<'a> {
    conn: &'a Connection,
}

impl EventStore {
    pub fn new(db: Database, limits: StorageLimits) -> Self {
        Self { db, limits }
    }

    pub fn limits(&self) -> StorageLimits {
        self.limits
    }

    /// Run `f` inside a named savepoint. Commits (releases) on `Ok`,
    /// rolls back on `Err`; the savepoint is balanced on every exit
    /// path. Savepoints nest via [`StoreTxn::nested`].
    #[instrument(skip(self, f), fields(txn = name))]
    pub fn transaction<T>(
        &self,
        name: &str,
        f: impl FnOnce(&StoreTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.db
            .with_conn(|conn| with_savepoint(conn, name, |conn| f(&StoreTxn { conn })))
    }

    fn read<T>(&self, f: impl FnOnce(&StoreTxn<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        self.db.with_conn(|conn| f(&StoreTxn { conn }))
    }

    // Events ------------------------------------------------------------

    /// Insert an unstaged event blob, returning its row id.
    pub fn append_event(&self, blob: &str) -> Result<i64, StoreError> {
        self.read(|txn| txn.append_event(blob))
    }

    /// Insert an event and record it as the retractable close event.
    pub fn append_close_event(&self, blob: &str) -> Result<i64, StoreError> {
        self.read(|txn| txn.append_close_event(blob))
    }

    /// Insert an event and record it as the retractable flow event.
    pub fn append_flow_event(&self, blob: &str) -> Result<i64, StoreError> {
        self.read(|txn| txn.append_flow_event(blob))
    }

    /// Hold one pending close blob outside the permanent log.
    pub fn queue_close_event(&self, blob: &str) -> Result<(), StoreError> {
        self.read(|txn| txn.queue_close_event(blob))
    }

    /// Return and clear the queued close blob; empty string if none.
    pub fn dequeue_close_event(&self) -> Result<String, StoreError> {
        self.read(|txn| txn.dequeue_close_event())
    }

    /// Delete the last close/flow events if recorded; quiet no-op otherwise.
    pub fn remove_last_close_and_flow_events(&self) -> Result<(), StoreError> {
        self.read(|txn| txn.remove_last_close_and_flow_events())
    }

    /// Associate every currently-unstaged event with the given header.
    pub fn stage_unstaged_events(&self, header_id: i64) -> Result<(), StoreError> {
        self.read(|txn| txn.stage_unstaged_events(header_id))
    }

    pub fn add_header(&self, sequence_number: i64, blob: &str) -> Result<i64, StoreError> {
        self.read(|txn| txn.add_header(sequence_number, blob))
    }

    pub fn event_count(&self) -> Result<i64, StoreError> {
        self.read(|txn| txn.event_count())
    }

    pub fn unstaged_event_count(&self) -> Result<i64, StoreError> {
        self.read(|txn| txn.unstaged_event_count())
    }

    pub fn staged_event_count(&self) -> Result<i64, StoreError> {
        self.read(|txn| {
            txn.query_i64("SELECT COUNT(*) FROM events WHERE upload_header IS NOT NULL")
        })
    }

    pub fn header_count(&self) -> Result<i64, StoreError> {
        self.read(|txn| txn.query_i64("SELECT COUNT(*) FROM upload_headers"))
    }

    /// Concatenate every header blob followed by its staged child events,
    /// in ascending sequence order. Read-only and safe while unstaged
    /// writes continue: staged rows are immutable until purge.
    pub fn snapshot_upload_blob(&self) -> Result<String, StoreError> {
        self.read(|txn| {
            let mut stmt = txn.conn.prepare(
                "SELECT blob FROM (
                     SELECT h.blob_string AS blob, h.sequence_number AS seq, 0 AS ord
                     FROM upload_headers h
                     UNION ALL
                     SELECT e.blob_string AS blob, e.upload_header AS seq, 1 AS ord
                     FROM events e WHERE e.upload_header IS NOT NULL
                 ) ORDER BY seq, ord",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = String::new();
            while let Some(row) = rows.next()? {
                let blob: String = row.get(0)?;
                out.push_str(&blob);
            }
            Ok(out)
        })
    }

    /// Delete all staged events and all headers. Unstaged events (added
    /// concurrently with an in-flight upload) are never touched.
    #[instrument(skip(self))]
    pub fn purge_uploaded_data(&self) -> Result<(), StoreError> {
        self.transaction("delete_upload_data", |txn| {
            txn.conn
                .execute("DELETE FROM events WHERE upload_header IS NOT NULL", [])?;
            txn.conn.execute("DELETE FROM upload_headers", [])?;
            Ok(())
        })
    }

    /// Delete all events/headers and zero the counters, timestamps,
    /// dimensions, customer id, and queued close blob. Schema version,
    /// opt-out flag, and app key are preserved.
    #[instrument(skip(self))]
    pub fn reset_analytics_data(&self) -> Result<(), StoreError> {
        self.transaction("reset_analytics_data", |txn| {
            txn.conn.execute("DELETE FROM events", [])?;
            txn.conn.execute("DELETE FROM upload_headers", [])?;
            txn.conn.execute(
                "UPDATE pulse_info SET
                     last_session_number = 0, last_upload_number = 0,
                     last_close_event = NULL, last_flow_event = NULL,
                     last_session_start = NULL,
                     custom_d0 = NULL, custom_d1 = NULL, custom_d2 = NULL, custom_d3 = NULL,
                     customer_id = NULL, queued_close_event_blob = NULL",
                [],
            )?;
            Ok(())
        })
    }

    /// Reclaim space once the database exceeds the configured fraction of
    /// the size cap. Only effective after deletes.
    pub fn vacuum_if_oversized(&self) -> Result<(), StoreError> {
        let size = self.database_size()?;
        if size > self.limits.vacuum_trigger_bytes() {
            debug!(size, "vacuuming event store");
            self.db.with_conn(|conn| {
                conn.execute_batch("VACUUM")?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Current database size in bytes (page_count x page_size; covers
    /// in-memory databases too, unlike file metadata).
    pub fn database_size(&self) -> Result<u64, StoreError> {
        self.read(|txn| {
            let pages = txn.query_i64("PRAGMA page_count")?;
            let page_size = txn.query_i64("PRAGMA page_size")?;
            Ok((pages * page_size) as u64)
        })
    }

    // Counters ----------------------------------------------------------

    /// Transactional read-modify-write returning the new value.
    pub fn increment_upload_number(&self) -> Result<i64, StoreError> {
        self.read(|txn| txn.increment_upload_number())
    }

    pub fn increment_session_number(&self) -> Result<i64, StoreError> {
        self.read(|txn| txn.increment_session_number())
    }

    // Info record -------------------------------------------------------

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        self.read(|txn| txn.query_i64("SELECT schema_version FROM pulse_info"))
    }

    /// Unix time at which the persistent store was created.
    pub fn db_created_at(&self) -> Result<i64, StoreError> {
        self.read(|txn| txn.query_i64("SELECT db_created_at FROM pulse_info"))
    }

    pub fn app_key(&self) -> Result<String, StoreError> {
        self.read(|txn| txn.info_string("app_key"))
    }

    pub fn set_app_key(&self, app_key: &str) -> Result<(), StoreError> {
        self.read(|txn| txn.set_app_key(app_key))
    }

    pub fn customer_id(&self) -> Result<String, StoreError> {
        self.read(|txn| txn.info_string("customer_id"))
    }

    pub fn set_customer_id(&self, customer_id: &str) -> Result<(), StoreError> {
        self.read(|txn| txn.set_customer_id(customer_id))
    }

    pub fn is_opted_out(&self) -> Result<bool, StoreError> {
        self.read(|txn| txn.is_opted_out())
    }

    pub fn set_opted_out(&self, opted_out: bool) -> Result<(), StoreError> {
        self.read(|txn| txn.set_opted_out(opted_out))
    }

    /// Custom dimension slot, validated to 0..4; out-of-range reads
    /// return an empty string rather than failing.
    pub fn custom_dimension(&self, index: usize) -> Result<String, StoreError> {
        if index >= CUSTOM_DIMENSIONS {
            return Ok(String::new());
        }
        self.read(|txn| txn.info_string(&format!("custom_d{index}")))
    }

    /// Out-of-range writes are rejected.
    pub fn set_custom_dimension(&self, index: usize, value: &str) -> Result<(), StoreError> {
        self.read(|txn| txn.set_custom_dimension(index, value))
    }

    /// All four dimension slots in order; empty string for unset slots.
    pub fn custom_dimensions(&self) -> Result<[String; CUSTOM_DIMENSIONS], StoreError> {
        self.read(|txn| {
            let mut dims: [String; CUSTOM_DIMENSIONS] = Default::default();
            for (i, dim) in dims.iter_mut().enumerate() {
                *dim = txn.info_string(&format!("custom_d{i}"))?;
            }
            Ok(dims)
        })
    }

    pub fn last_session_start(&self) -> Result<Option<i64>, StoreError> {
        self.read(|txn| txn.last_session_start())
    }

    pub fn set_last_session_start(&self, unix_secs: i64) -> Result<(), StoreError> {
        self.read(|txn| txn.set_last_session_start(unix_secs))
    }
}

impl<'a> StoreTxn<'a> {
    /// Run `f` in a nested savepoint; rollback undoes only work since
    /// the matching begin.
    pub fn nested<T>(
        &self,
        name: &str,
        f: impl FnOnce(&StoreTxn<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        with_savepoint(self.conn, name, |conn| f(&StoreTxn { conn }))
    }

    pub fn append_event(&self, blob: &str) -> Result<i64, StoreError> {
        self.conn
            .execute("INSERT INTO events (blob_string) VALUES (?1)", [blob])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn append_close_event(&self, blob: &str) -> Result<i64, StoreError> {
        self.nested("add_close_event", |txn| {
            let id = txn.append_event(blob)?;
            // Remember the row so it can be retracted if the session resumes.
            txn.conn
                .execute("UPDATE pulse_info SET last_close_event = ?1", [id])?;
            Ok(id)
        })
    }

    pub fn append_flow_event(&self, blob: &str) -> Result<i64, StoreError> {
        self.nested("add_flow_event", |txn| {
            let id = txn.append_event(blob)?;
            txn.conn
                .execute("UPDATE pulse_info SET last_flow_event = ?1", [id])?;
            Ok(id)
        })
    }

    pub fn queue_close_event(&self, blob: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE pulse_info SET queued_close_event_blob = ?1",
            [blob],
        )?;
        Ok(())
    }

    pub fn dequeue_close_event(&self) -> Result<String, StoreError> {
        self.nested("dequeue_close_event", |txn| {
            let blob: Option<String> = txn
                .conn
                .query_row("SELECT queued_close_event_blob FROM pulse_info", [], |row| {
                    row.get(0)
                })
                .optional()?
                .flatten();
            txn.conn
                .execute("UPDATE pulse_info SET queued_close_event_blob = NULL", [])?;
            Ok(blob.unwrap_or_default())
        })
    }

    pub fn remove_last_close_and_flow_events(&self) -> Result<(), StoreError> {
        // Fail quietly if none was saved or it was previously removed.
        self.conn.execute(
            "DELETE FROM events
             WHERE event_id = (SELECT last_close_event FROM pulse_info)
                OR event_id = (SELECT last_flow_event FROM pulse_info)",
            [],
        )?;
        Ok(())
    }

    /// Events inserted after this call keep a NULL header and are
    /// unaffected; once staged, a row is never re-associated.
    pub fn stage_unstaged_events(&self, header_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE events SET upload_header = ?1 WHERE upload_header IS NULL",
            [header_id],
        )?;
        Ok(())
    }

    pub fn add_header(&self, sequence_number: i64, blob: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO upload_headers (sequence_number, blob_string) VALUES (?1, ?2)",
            rusqlite::params![sequence_number, blob],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn event_count(&self) -> Result<i64, StoreError> {
        self.query_i64("SELECT COUNT(event_id) FROM events")
    }

    pub fn unstaged_event_count(&self) -> Result<i64, StoreError> {
        self.query_i64("SELECT COUNT(*) FROM events WHERE upload_header IS NULL")
    }

    pub fn increment_upload_number(&self) -> Result<i64, StoreError> {
        self.nested("increment_upload_number", |txn| {
            txn.conn.execute(
                "UPDATE pulse_info SET last_upload_number = last_upload_number + 1",
                [],
            )?;
            txn.query_i64("SELECT last_upload_number FROM pulse_info")
        })
    }

    pub fn increment_session_number(&self) -> Result<i64, StoreError> {
        self.nested("increment_session_number", |txn| {
            txn.conn.execute(
                "UPDATE pulse_info SET last_session_number = last_session_number + 1",
                [],
            )?;
            txn.query_i64("SELECT last_session_number FROM pulse_info")
        })
    }

    pub fn last_session_start(&self) -> Result<Option<i64>, StoreError> {
        let value: Option<i64> = self
            .conn
            .query_row("SELECT last_session_start FROM pulse_info", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        Ok(value)
    }

    pub fn set_last_session_start(&self, unix_secs: i64) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE pulse_info SET last_session_start = ?1", [unix_secs])?;
        Ok(())
    }

    pub fn set_app_key(&self, app_key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE pulse_info SET app_key = ?1", [app_key])?;
        Ok(())
    }

    pub fn set_customer_id(&self, customer_id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE pulse_info SET customer_id = ?1", [customer_id])?;
        Ok(())
    }

    pub fn is_opted_out(&self) -> Result<bool, StoreError> {
        Ok(self.query_i64("SELECT opt_out FROM pulse_info")? != 0)
    }

    pub fn set_opted_out(&self, opted_out: bool) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE pulse_info SET opt_out = ?1", [opted_out as i64])?;
        Ok(())
    }

    pub fn set_custom_dimension(&self, index: usize, value: &str) -> Result<(), StoreError> {
        if index >= CUSTOM_DIMENSIONS {
            return Err(StoreError::DimensionOutOfRange(index));
        }
        // Column name is derived from the validated index, not the caller.
        self.conn.execute(
            &format!("UPDATE pulse_info SET custom_d{index} = ?1"),
            [value],
        )?;
        Ok(())
    }

    fn info_string(&self, column: &str) -> Result<String, StoreError> {
        let value: Option<String> = self
            .conn
            .query_row(&format!("SELECT {column} FROM pulse_info"), [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        Ok(value.unwrap_or_default())
    }

    fn query_i64(&self, sql: &str) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }
}

fn with_savepoint<T>(
    conn: &Connection,
    name: &str,
    f: impl FnOnce(&Connection) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidTransactionName(name.to_string()));
    }
    conn.execute_batch(&format!("SAVEPOINT {name}"))?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE SAVEPOINT {name}"))?;
            Ok(value)
        }
        Err(e) => {
            // Roll back, then release so the savepoint stack stays balanced.
            let _ = conn.execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}"));
            let _ = conn.execute_batch(&format!("RELEASE SAVEPOINT {name}"));
            Err(e)
        }
    }
}
