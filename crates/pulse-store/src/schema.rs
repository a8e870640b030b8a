/// SQL DDL for the pulse event store.
/// WAL mode + busy timeout applied at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_header INTEGER,
    blob_string TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS upload_headers (
    sequence_number INTEGER PRIMARY KEY,
    blob_string TEXT
);

CREATE TABLE IF NOT EXISTS pulse_info (
    schema_version INTEGER NOT NULL,
    last_upload_number INTEGER NOT NULL DEFAULT 0,
    last_session_number INTEGER NOT NULL DEFAULT 0,
    opt_out INTEGER NOT NULL DEFAULT 0,
    last_close_event INTEGER,
    last_flow_event INTEGER,
    last_session_start INTEGER,
    app_key TEXT,
    customer_id TEXT,
    custom_d0 TEXT,
    custom_d1 TEXT,
    custom_d2 TEXT,
    custom_d3 TEXT,
    queued_close_event_blob TEXT,
    db_created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_header ON events(upload_header);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
