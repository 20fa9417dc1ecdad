//! SQLite-backed event store and retention engine.
//!
//! Every persisted event carries a `seq` assigned from an auto-increment
//! rowid, so sequence numbers grow strictly and are never reused even
//! after deletes. Tag index rows exist only for single-letter ASCII tag
//! names and are removed with their event through a foreign-key cascade.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use tracing::debug;

use crate::event::{Event, Tag};
use crate::filter::Filter;
use crate::kind::KindClass;

const EVENT_COLS: &str = "id, pubkey, created_at, kind, tags, content, sig";

/// Outcome of running one event through the retention pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Newly persisted under the returned sequence number.
    Stored { seq: i64 },
    /// An event with the same id already exists at `seq`.
    Duplicate { seq: i64 },
    /// An existing replaceable/addressable event won the tuple comparison.
    Superseded { class: KindClass },
    /// Accepted for broadcast only; ephemeral events are never persisted.
    Ephemeral,
}

/// One persisted change: sequence number plus the event it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub seq: i64,
    pub event: Event,
}

/// Options for scanning the change feed.
#[derive(Debug, Clone, Default)]
pub struct ChangeScan {
    pub limit: Option<u64>,
    pub kinds: Option<Vec<u32>>,
    pub authors: Option<Vec<String>>,
}

/// Persistent, indexed event repository.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and initialize) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating database directory")?;
            }
        }
        let conn = Connection::open(path).context("opening database")?;
        init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store, used by tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    /// Run a validated, classified event through the retention pipeline.
    ///
    /// All checks and writes happen in one transaction, so the id
    /// uniqueness, replaceable/addressable singleton, and seq-assignment
    /// invariants hold under concurrent ingests.
    pub fn ingest(&self, ev: &Event, class: KindClass) -> Result<IngestOutcome> {
        if class == KindClass::Ephemeral {
            return Ok(IngestOutcome::Ephemeral);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("starting ingest transaction")?;

        if let Some(seq) = existing_seq(&tx, &ev.id)? {
            return Ok(IngestOutcome::Duplicate { seq });
        }

        match class {
            KindClass::Purge => {
                let doc = ev
                    .tag_value("d")
                    .context("purge event missing d tag")?
                    .to_string();
                let target: u32 = ev
                    .tag_value("k")
                    .and_then(|v| v.parse().ok())
                    .context("purge event missing parsable k tag")?;
                let removed = purge_tx(&tx, &ev.pubkey, target, &doc)?;
                debug!(removed, doc = %doc, kind = target, "purged document revisions");
            }
            KindClass::Replaceable | KindClass::Addressable => {
                let doc = (class == KindClass::Addressable).then(|| ev.d_tag());
                if let Some(existing) = find_keyed(&tx, &ev.pubkey, ev.kind, doc)? {
                    if !supersedes(ev, &existing) {
                        return Ok(IngestOutcome::Superseded { class });
                    }
                    delete_tx(&tx, &existing.id)?;
                }
            }
            KindClass::Regular | KindClass::Syncable | KindClass::Ephemeral => {}
        }

        let seq = insert_tx(&tx, ev)?;
        tx.commit().context("committing ingest")?;
        debug!(seq, id = %ev.id, kind = ev.kind, "stored event");
        Ok(IngestOutcome::Stored { seq })
    }

    /// Insert an event unconditionally, returning its assigned seq.
    pub fn insert(&self, ev: &Event) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let seq = insert_tx(&tx, ev)?;
        tx.commit()?;
        Ok(seq)
    }

    /// Fetch an event by id.
    pub fn get(&self, id: &str) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let ev = conn
            .query_row(
                &format!("SELECT {EVENT_COLS} FROM events WHERE id = ?1"),
                params![id],
                row_to_event,
            )
            .optional()
            .context("fetching event")?;
        Ok(ev)
    }

    /// Delete an event; tag index entries cascade with it.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        delete_tx(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    /// Execute a set of filters, unioned by id and sorted newest-first.
    pub fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut seen = HashSet::new();
        let mut events: Vec<Event> = vec![];
        for filter in filters {
            let (sql, args) = filter_sql(filter);
            let mut stmt = conn.prepare(&sql).context("preparing filter query")?;
            let rows = stmt.query_map(params_from_iter(args), row_to_event)?;
            for row in rows {
                let ev = row?;
                if seen.insert(ev.id.clone()) {
                    events.push(ev);
                }
            }
        }
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(events)
    }

    /// Scan the change feed for events with seq greater than `since`.
    ///
    /// Returns the matches in ascending seq order together with the
    /// cursor the client should resume from: the highest returned seq,
    /// or the global last seq when nothing matched so callers do not
    /// re-scan the same range forever.
    pub fn query_changes(&self, since: i64, scan: &ChangeScan) -> Result<(Vec<Change>, i64)> {
        let conn = self.conn()?;
        let mut clauses = vec!["seq > ?".to_string()];
        let mut args = vec![SqlValue::Integer(since)];
        if let Some(kinds) = &scan.kinds {
            if !kinds.is_empty() {
                clauses.push(format!("kind IN ({})", placeholders(kinds.len())));
                args.extend(kinds.iter().map(|k| SqlValue::Integer(i64::from(*k))));
            }
        }
        if let Some(authors) = &scan.authors {
            if !authors.is_empty() {
                clauses.push(format!("pubkey IN ({})", placeholders(authors.len())));
                args.extend(authors.iter().map(|a| SqlValue::Text(a.clone())));
            }
        }
        let mut sql = format!(
            "SELECT seq, {EVENT_COLS} FROM events WHERE {} ORDER BY seq ASC",
            clauses.join(" AND ")
        );
        if let Some(limit) = scan.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&sql).context("preparing change scan")?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(Change {
                seq: row.get("seq")?,
                event: row_to_event(row)?,
            })
        })?;
        let changes: Vec<Change> = rows.collect::<rusqlite::Result<_>>()?;
        let last = match changes.last() {
            Some(change) => change.seq,
            None => last_assigned_seq(&conn)?,
        };
        Ok((changes, last))
    }

    /// Highest seq ever assigned, or 0 when no event was stored yet.
    pub fn last_seq(&self) -> Result<i64> {
        let conn = self.conn()?;
        last_assigned_seq(&conn)
    }

    /// Delete every revision of a document, returning how many went.
    pub fn purge_document(&self, pubkey: &str, kind: u32, doc: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = purge_tx(&tx, pubkey, kind, doc)?;
        tx.commit()?;
        Ok(removed)
    }

    #[cfg(test)]
    fn tag_entries(&self, id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT tag_name, tag_value FROM event_tags WHERE event_id = ?1")?;
        let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

/// Apply pragmas and create the schema on a fresh connection.
fn init_connection(conn: &Connection) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])
        .context("enabling foreign keys")?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))
        .context("enabling write-ahead journaling")?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            pubkey TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            kind INTEGER NOT NULL,
            tags TEXT NOT NULL,
            content TEXT NOT NULL,
            sig TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey);
        CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
        CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
        CREATE INDEX IF NOT EXISTS idx_events_kind_pubkey ON events(kind, pubkey);
        CREATE INDEX IF NOT EXISTS idx_events_kind_pubkey_created
            ON events(kind, pubkey, created_at DESC);

        CREATE TABLE IF NOT EXISTS event_tags (
            event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            tag_name TEXT NOT NULL,
            tag_value TEXT NOT NULL,
            PRIMARY KEY (event_id, tag_name, tag_value)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_event_tags_name_value
            ON event_tags(tag_name, tag_value);
        "#,
    )
    .context("creating schema")?;
    Ok(())
}

fn existing_seq(tx: &Transaction, id: &str) -> Result<Option<i64>> {
    let seq = tx
        .query_row("SELECT seq FROM events WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(seq)
}

/// Insert an event row plus its single-letter tag index entries.
fn insert_tx(tx: &Transaction, ev: &Event) -> Result<i64> {
    let tags_json = serde_json::to_string(&ev.tags).context("serializing tags")?;
    tx.execute(
        "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            ev.id,
            ev.pubkey,
            ev.created_at as i64,
            ev.kind,
            tags_json,
            ev.content,
            ev.sig
        ],
    )
    .context("inserting event")?;
    let seq = tx.last_insert_rowid();
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO event_tags (event_id, tag_name, tag_value) VALUES (?1, ?2, ?3)",
    )?;
    for Tag(fields) in &ev.tags {
        if let [name, value, ..] = fields.as_slice() {
            if name.len() == 1 && name.chars().all(|c| c.is_ascii_alphabetic()) {
                stmt.execute(params![ev.id, name, value])?;
            }
        }
    }
    Ok(seq)
}

fn delete_tx(tx: &Transaction, id: &str) -> Result<()> {
    tx.execute("DELETE FROM events WHERE id = ?1", params![id])
        .context("deleting event")?;
    Ok(())
}

/// Delete all revisions of `(pubkey, kind, doc)`, cascading tag entries.
fn purge_tx(tx: &Transaction, pubkey: &str, kind: u32, doc: &str) -> Result<usize> {
    let removed = tx.execute(
        "DELETE FROM events WHERE id IN (
             SELECT e.id FROM events e
             JOIN event_tags t ON t.event_id = e.id
             WHERE e.pubkey = ?1 AND e.kind = ?2
               AND t.tag_name = 'd' AND t.tag_value = ?3)",
        params![pubkey, kind, doc],
    )?;
    Ok(removed)
}

/// Locate the current holder of a replaceable/addressable key, if any.
fn find_keyed(
    tx: &Transaction,
    pubkey: &str,
    kind: u32,
    doc: Option<&str>,
) -> Result<Option<Event>> {
    let mut stmt = tx.prepare_cached(&format!(
        "SELECT {EVENT_COLS} FROM events WHERE pubkey = ?1 AND kind = ?2"
    ))?;
    let rows = stmt.query_map(params![pubkey, kind], row_to_event)?;
    for row in rows {
        let ev = row?;
        match doc {
            // replaceable: one row per (pubkey, kind)
            None => return Ok(Some(ev)),
            Some(want) => {
                if ev.d_tag() == want {
                    return Ok(Some(ev));
                }
            }
        }
    }
    Ok(None)
}

/// Whether the incoming event wins the `(created_at desc, id asc)` order.
fn supersedes(incoming: &Event, existing: &Event) -> bool {
    incoming.created_at > existing.created_at
        || (incoming.created_at == existing.created_at && incoming.id < existing.id)
}

fn last_assigned_seq(conn: &Connection) -> Result<i64> {
    // sqlite_sequence tracks the auto-increment high-water mark, so the
    // answer survives deletion of the newest rows.
    let seq = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'events'",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("reading last assigned seq")?;
    Ok(seq.unwrap_or(0))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Translate one filter into a SELECT with bound parameters.
fn filter_sql(f: &Filter) -> (String, Vec<SqlValue>) {
    let mut clauses: Vec<String> = vec![];
    let mut args: Vec<SqlValue> = vec![];
    if let Some(ids) = &f.ids {
        if !ids.is_empty() {
            clauses.push(format!("id IN ({})", placeholders(ids.len())));
            args.extend(ids.iter().map(|s| SqlValue::Text(s.clone())));
        }
    }
    if let Some(authors) = &f.authors {
        if !authors.is_empty() {
            clauses.push(format!("pubkey IN ({})", placeholders(authors.len())));
            args.extend(authors.iter().map(|s| SqlValue::Text(s.clone())));
        }
    }
    if let Some(kinds) = &f.kinds {
        if !kinds.is_empty() {
            clauses.push(format!("kind IN ({})", placeholders(kinds.len())));
            args.extend(kinds.iter().map(|k| SqlValue::Integer(i64::from(*k))));
        }
    }
    if let Some(since) = f.since {
        clauses.push("created_at >= ?".into());
        args.push(SqlValue::Integer(since as i64));
    }
    if let Some(until) = f.until {
        clauses.push("created_at <= ?".into());
        args.push(SqlValue::Integer(until as i64));
    }
    for (letter, values) in &f.tags {
        if values.is_empty() {
            continue;
        }
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM event_tags WHERE event_id = events.id \
             AND tag_name = ? AND tag_value IN ({}))",
            placeholders(values.len())
        ));
        args.push(SqlValue::Text(letter.to_string()));
        args.extend(values.iter().map(|s| SqlValue::Text(s.clone())));
    }
    let mut sql = format!("SELECT {EVENT_COLS} FROM events");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id ASC");
    if let Some(limit) = f.limit {
        sql.push_str(" LIMIT ?");
        args.push(SqlValue::Integer(limit as i64));
    }
    (sql, args)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get("tags")?;
    let tags = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Event {
        id: row.get("id")?,
        pubkey: row.get("pubkey")?,
        created_at: row.get::<_, i64>("created_at")? as u64,
        kind: row.get("kind")?,
        tags,
        content: row.get("content")?,
        sig: row.get("sig")?,
    })
}
