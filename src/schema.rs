//! # Store Schemas and Connections
//!
//! chaindex persists into four SQLite files, each owning one concern:
//!
//! ```text
//! ┌────────────────────┐  ┌────────────────────────┐
//! │ core               │  │ bundles                │
//! │  new_blocks        │  │  new_data_items        │
//! │  stable_blocks     │◄─┤  stable_data_items     │
//! │  new_transactions  │─►│  new_data_item_tags    │
//! │  stable_transactions│ │  stable_data_item_tags │
//! │  *_transaction_tags │ │  bundles / filters     │
//! │  wallets, tags     │  │  wallets, tags         │
//! └────────────────────┘  └────────────────────────┘
//!        ATTACHed to each other for cross-store joins
//!
//! ┌────────────────────┐  ┌────────────────────────┐
//! │ data               │  │ moderation             │
//! │  data_hashes       │  │  blocked_ids           │
//! │  data_ids/roots    │  │  blocked_hashes        │
//! │  nested_*          │  │  block_sources         │
//! └────────────────────┘  └────────────────────────┘
//! ```
//!
//! ## Staging Model
//!
//! `core` and `bundles` each keep two table families: `new_*` holds recent,
//! possibly forked content (heights may be NULL until the owning block is
//! seen); `stable_*` holds content promoted once it sits at least
//! `max_fork_depth` below the tip. Promotion is an idempotent copy;
//! `reset_to_height` only ever rewinds `new_*`.
//!
//! ## Connection Discipline
//!
//! Every connection runs WAL journaling with a 4 KiB page size and a
//! 30-second busy timeout. Core-opened connections ATTACH the bundles file as
//! schema `bundles` (the planner joins `bundles.stable_data_items` and
//! `bundles.wallets` from core queries, and block ingestion propagates heights
//! onto `bundles.new_data_items`); the bundles writer attaches core the other
//! way around to resolve root-transaction heights. Readers open with
//! `SQLITE_OPEN_READ_ONLY | SQLITE_OPEN_NO_MUTEX` and inherit read-only access
//! on the attached schema.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::{Error, Result};

// =============================================================================
// Schema Versions
// =============================================================================

/// Current schema version, one counter shared by all four stores.
///
/// Stored in each file's `chaindex_metadata` table. No migrations yet: a
/// mismatch is an error.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// Core Store DDL
// =============================================================================

/// Chain index: blocks, transactions, block↔tx links, tag occurrences,
/// wallets, and the missing-transaction backlog — in `new_*` (fork-prone tip)
/// and `stable_*` (promoted prefix) families.
///
/// Key shapes:
/// - `new_blocks` keys on `indep_hash` with a unique `height` index; at most
///   one new block per height exists because `reset_to_height` truncates
///   above the fork point before re-ingestion.
/// - `stable_blocks` keys on `height`: a gap-free prefix once promoted.
/// - Tag occurrences key on `(name_hash, value_hash, owner position)`; the
///   `*_transaction_id_idx` indexes are the explicit hint targets for the
///   planner's chained tag joins.
/// - `quantity`, `reward`, and `reward_pool` are TEXT: decimal strings beyond
///   the signed 64-bit range.
const CORE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS chaindex_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS new_blocks (
    indep_hash                        BLOB PRIMARY KEY,
    height                            INTEGER NOT NULL,
    previous_block                    BLOB,
    nonce                             BLOB NOT NULL,
    hash                              BLOB NOT NULL,
    block_timestamp                   INTEGER NOT NULL,
    diff                              TEXT,
    cumulative_diff                   TEXT,
    last_retarget                     INTEGER,
    reward_addr                       BLOB,
    reward_pool                       TEXT,
    block_size                        INTEGER,
    weave_size                        INTEGER,
    usd_to_ar_rate_dividend           TEXT,
    usd_to_ar_rate_divisor            TEXT,
    scheduled_usd_to_ar_rate_dividend TEXT,
    scheduled_usd_to_ar_rate_divisor  TEXT,
    hash_list_merkle                  BLOB,
    wallet_list                       BLOB,
    tx_root                           BLOB,
    tx_count                          INTEGER NOT NULL,
    missing_tx_count                  INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS new_blocks_height_idx ON new_blocks (height);

CREATE TABLE IF NOT EXISTS stable_blocks (
    height                            INTEGER PRIMARY KEY,
    indep_hash                        BLOB NOT NULL UNIQUE,
    previous_block                    BLOB,
    nonce                             BLOB NOT NULL,
    hash                              BLOB NOT NULL,
    block_timestamp                   INTEGER NOT NULL,
    diff                              TEXT,
    cumulative_diff                   TEXT,
    last_retarget                     INTEGER,
    reward_addr                       BLOB,
    reward_pool                       TEXT,
    block_size                        INTEGER,
    weave_size                        INTEGER,
    usd_to_ar_rate_dividend           TEXT,
    usd_to_ar_rate_divisor            TEXT,
    scheduled_usd_to_ar_rate_dividend TEXT,
    scheduled_usd_to_ar_rate_divisor  TEXT,
    hash_list_merkle                  BLOB,
    wallet_list                       BLOB,
    tx_root                           BLOB,
    tx_count                          INTEGER NOT NULL,
    missing_tx_count                  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS new_block_transactions (
    block_indep_hash        BLOB NOT NULL,
    transaction_id          BLOB NOT NULL,
    block_transaction_index INTEGER NOT NULL,
    height                  INTEGER NOT NULL,
    PRIMARY KEY (block_indep_hash, transaction_id)
);
CREATE INDEX IF NOT EXISTS new_block_transactions_transaction_id_idx
    ON new_block_transactions (transaction_id);
CREATE INDEX IF NOT EXISTS new_block_transactions_height_idx
    ON new_block_transactions (height);

CREATE TABLE IF NOT EXISTS stable_block_transactions (
    block_indep_hash        BLOB NOT NULL,
    transaction_id          BLOB NOT NULL,
    block_transaction_index INTEGER NOT NULL,
    height                  INTEGER NOT NULL,
    PRIMARY KEY (block_indep_hash, transaction_id)
);
CREATE INDEX IF NOT EXISTS stable_block_transactions_transaction_id_idx
    ON stable_block_transactions (transaction_id);

CREATE TABLE IF NOT EXISTS missing_transactions (
    block_indep_hash BLOB NOT NULL,
    transaction_id   BLOB NOT NULL,
    height           INTEGER NOT NULL,
    PRIMARY KEY (block_indep_hash, transaction_id)
);
CREATE INDEX IF NOT EXISTS missing_transactions_height_idx
    ON missing_transactions (height);

CREATE TABLE IF NOT EXISTS new_transactions (
    id             BLOB PRIMARY KEY,
    signature      BLOB,
    format         INTEGER,
    last_tx        BLOB,
    owner_address  BLOB,
    target         BLOB,
    quantity       TEXT,
    reward         TEXT,
    data_size      INTEGER,
    data_root      BLOB,
    content_type   TEXT,
    tag_count      INTEGER NOT NULL,
    indexed_at     INTEGER NOT NULL,
    height         INTEGER,
    offset         INTEGER
);
CREATE INDEX IF NOT EXISTS new_transactions_height_idx
    ON new_transactions (height);
CREATE INDEX IF NOT EXISTS new_transactions_target_idx
    ON new_transactions (target);
CREATE INDEX IF NOT EXISTS new_transactions_owner_address_idx
    ON new_transactions (owner_address);

CREATE TABLE IF NOT EXISTS stable_transactions (
    id                      BLOB PRIMARY KEY,
    height                  INTEGER NOT NULL,
    block_transaction_index INTEGER NOT NULL,
    signature               BLOB,
    format                  INTEGER,
    last_tx                 BLOB,
    owner_address           BLOB,
    target                  BLOB,
    quantity                TEXT,
    reward                  TEXT,
    data_size               INTEGER,
    data_root               BLOB,
    content_type            TEXT,
    tag_count               INTEGER NOT NULL,
    indexed_at              INTEGER NOT NULL,
    offset                  INTEGER
);
CREATE INDEX IF NOT EXISTS stable_transactions_height_idx
    ON stable_transactions (height, block_transaction_index);
CREATE INDEX IF NOT EXISTS stable_transactions_target_idx
    ON stable_transactions (target);
CREATE INDEX IF NOT EXISTS stable_transactions_owner_address_idx
    ON stable_transactions (owner_address);

CREATE TABLE IF NOT EXISTS tag_names (
    hash BLOB PRIMARY KEY,
    name BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS tag_values (
    hash  BLOB PRIMARY KEY,
    value BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS new_transaction_tags (
    tag_name_hash         BLOB NOT NULL,
    tag_value_hash        BLOB NOT NULL,
    transaction_id        BLOB NOT NULL,
    transaction_tag_index INTEGER NOT NULL,
    indexed_at            INTEGER NOT NULL,
    height                INTEGER,
    PRIMARY KEY (tag_name_hash, tag_value_hash, transaction_id, transaction_tag_index)
);
CREATE INDEX IF NOT EXISTS new_transaction_tags_transaction_id_idx
    ON new_transaction_tags (transaction_id);

CREATE TABLE IF NOT EXISTS stable_transaction_tags (
    tag_name_hash           BLOB NOT NULL,
    tag_value_hash          BLOB NOT NULL,
    height                  INTEGER NOT NULL,
    block_transaction_index INTEGER NOT NULL,
    transaction_tag_index   INTEGER NOT NULL,
    transaction_id          BLOB NOT NULL,
    PRIMARY KEY (tag_name_hash, tag_value_hash, height, block_transaction_index, transaction_tag_index)
);
CREATE INDEX IF NOT EXISTS stable_transaction_tags_transaction_id_idx
    ON stable_transaction_tags (transaction_id);

CREATE TABLE IF NOT EXISTS wallets (
    address        BLOB PRIMARY KEY,
    public_modulus BLOB
);
"#;

// =============================================================================
// Bundles Store DDL
// =============================================================================

/// Bundle index: data items in `new_*`/`stable_*` families mirroring the core
/// staging model, their tag occurrences, the bundle lifecycle table, and the
/// normalized `filters` / `bundle_formats` dimensions.
///
/// The store carries its own `tag_names` / `tag_values` / `wallets` copies so
/// item queries never need the core file for dimension lookups.
const BUNDLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS chaindex_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS new_data_items (
    id                  BLOB PRIMARY KEY,
    parent_id           BLOB,
    root_transaction_id BLOB NOT NULL,
    height              INTEGER,
    signature           BLOB,
    anchor              BLOB,
    owner_address       BLOB,
    target              BLOB,
    data_offset         INTEGER,
    data_size           INTEGER,
    content_type        TEXT,
    tag_count           INTEGER NOT NULL,
    indexed_at          INTEGER NOT NULL,
    filter_id           INTEGER
);
CREATE INDEX IF NOT EXISTS new_data_items_height_idx
    ON new_data_items (height);
CREATE INDEX IF NOT EXISTS new_data_items_parent_id_idx
    ON new_data_items (parent_id);
CREATE INDEX IF NOT EXISTS new_data_items_root_transaction_id_idx
    ON new_data_items (root_transaction_id);
CREATE INDEX IF NOT EXISTS new_data_items_target_idx
    ON new_data_items (target);
CREATE INDEX IF NOT EXISTS new_data_items_owner_address_idx
    ON new_data_items (owner_address);

CREATE TABLE IF NOT EXISTS stable_data_items (
    id                      BLOB PRIMARY KEY,
    parent_id               BLOB,
    root_transaction_id     BLOB NOT NULL,
    height                  INTEGER NOT NULL,
    block_transaction_index INTEGER NOT NULL,
    signature               BLOB,
    anchor                  BLOB,
    owner_address           BLOB,
    target                  BLOB,
    data_offset             INTEGER,
    data_size               INTEGER,
    content_type            TEXT,
    tag_count               INTEGER NOT NULL,
    indexed_at              INTEGER NOT NULL,
    filter_id               INTEGER
);
CREATE INDEX IF NOT EXISTS stable_data_items_height_idx
    ON stable_data_items (height, block_transaction_index);
CREATE INDEX IF NOT EXISTS stable_data_items_parent_id_idx
    ON stable_data_items (parent_id);
CREATE INDEX IF NOT EXISTS stable_data_items_target_idx
    ON stable_data_items (target);
CREATE INDEX IF NOT EXISTS stable_data_items_owner_address_idx
    ON stable_data_items (owner_address);

CREATE TABLE IF NOT EXISTS tag_names (
    hash BLOB PRIMARY KEY,
    name BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS tag_values (
    hash  BLOB PRIMARY KEY,
    value BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS new_data_item_tags (
    tag_name_hash      BLOB NOT NULL,
    tag_value_hash     BLOB NOT NULL,
    data_item_id       BLOB NOT NULL,
    data_item_tag_index INTEGER NOT NULL,
    indexed_at         INTEGER NOT NULL,
    height             INTEGER,
    PRIMARY KEY (tag_name_hash, tag_value_hash, data_item_id, data_item_tag_index)
);
CREATE INDEX IF NOT EXISTS new_data_item_tags_data_item_id_idx
    ON new_data_item_tags (data_item_id);

CREATE TABLE IF NOT EXISTS stable_data_item_tags (
    tag_name_hash           BLOB NOT NULL,
    tag_value_hash          BLOB NOT NULL,
    height                  INTEGER NOT NULL,
    block_transaction_index INTEGER NOT NULL,
    data_item_id            BLOB NOT NULL,
    data_item_tag_index     INTEGER NOT NULL,
    PRIMARY KEY (tag_name_hash, tag_value_hash, height, block_transaction_index, data_item_id, data_item_tag_index)
);
CREATE INDEX IF NOT EXISTS stable_data_item_tags_data_item_id_idx
    ON stable_data_item_tags (data_item_id);

CREATE TABLE IF NOT EXISTS wallets (
    address        BLOB PRIMARY KEY,
    public_modulus BLOB
);

CREATE TABLE IF NOT EXISTS bundle_formats (
    id     INTEGER PRIMARY KEY,
    format TEXT NOT NULL UNIQUE
);
INSERT OR IGNORE INTO bundle_formats (id, format) VALUES (0, 'binary');
INSERT OR IGNORE INTO bundle_formats (id, format) VALUES (1, 'json');

CREATE TABLE IF NOT EXISTS filters (
    id     INTEGER PRIMARY KEY AUTOINCREMENT,
    filter TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS bundles (
    id                      BLOB PRIMARY KEY,
    root_transaction_id     BLOB NOT NULL,
    format_id               INTEGER,
    unbundle_filter_id      INTEGER,
    index_filter_id         INTEGER,
    data_item_count         INTEGER,
    matched_data_item_count INTEGER,
    queued_at               INTEGER,
    skipped_at              INTEGER,
    unbundled_at            INTEGER,
    fully_indexed_at        INTEGER
);
CREATE INDEX IF NOT EXISTS bundles_unbundled_at_idx
    ON bundles (unbundled_at);
CREATE INDEX IF NOT EXISTS bundles_fully_indexed_at_idx
    ON bundles (fully_indexed_at);
"#;

// =============================================================================
// Data Store DDL
// =============================================================================

/// Content-data index. A transaction or data item id resolves through
/// `data_ids` to a canonical content hash; `data_hashes` holds the verifiable
/// attributes; `data_roots` maps merkle data roots to the same hashes; the
/// `nested_*` tables describe sub-ranges within a parent's payload.
const DATA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS chaindex_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_hashes (
    hash                         BLOB PRIMARY KEY,
    data_size                    INTEGER NOT NULL,
    original_source_content_type TEXT,
    indexed_at                   INTEGER NOT NULL,
    cached_at                    INTEGER
);

CREATE TABLE IF NOT EXISTS data_ids (
    id                   BLOB PRIMARY KEY,
    contiguous_data_hash BLOB NOT NULL,
    indexed_at           INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS data_ids_contiguous_data_hash_idx
    ON data_ids (contiguous_data_hash);

CREATE TABLE IF NOT EXISTS data_roots (
    data_root            BLOB PRIMARY KEY,
    contiguous_data_hash BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS nested_data_ids (
    id          BLOB NOT NULL,
    parent_id   BLOB NOT NULL,
    data_offset INTEGER NOT NULL,
    data_size   INTEGER NOT NULL,
    indexed_at  INTEGER NOT NULL,
    PRIMARY KEY (id, parent_id)
);
CREATE INDEX IF NOT EXISTS nested_data_ids_parent_id_idx
    ON nested_data_ids (parent_id);

CREATE TABLE IF NOT EXISTS nested_data_hashes (
    hash        BLOB NOT NULL,
    parent_id   BLOB NOT NULL,
    data_offset INTEGER NOT NULL,
    indexed_at  INTEGER NOT NULL,
    PRIMARY KEY (hash, parent_id)
);
"#;

// =============================================================================
// Moderation Store DDL
// =============================================================================

/// Blocklists: ids and content hashes barred from serving, each optionally
/// attributed to a named `block_sources` row for audit.
const MODERATION_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS chaindex_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS block_sources (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL UNIQUE,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS blocked_ids (
    id              BLOB PRIMARY KEY,
    block_source_id INTEGER,
    notes           TEXT,
    blocked_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blocked_hashes (
    hash            BLOB PRIMARY KEY,
    block_source_id INTEGER,
    notes           TEXT,
    blocked_at      INTEGER NOT NULL
);
"#;

// =============================================================================
// Store Paths
// =============================================================================

/// Filesystem locations of the four store files.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub core: PathBuf,
    pub data: PathBuf,
    pub moderation: PathBuf,
    pub bundles: PathBuf,
}

impl StorePaths {
    /// Conventional layout: the four store files inside one directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            core: dir.join("core.db"),
            data: dir.join("data.db"),
            moderation: dir.join("moderation.db"),
            bundles: dir.join("bundles.db"),
        }
    }
}

// =============================================================================
// Initialization and Connections
// =============================================================================

/// Creates all four store files, applies PRAGMAs, DDL, and version rows.
///
/// Idempotent: safe to call on existing stores; a version mismatch is
/// `Error::Schema`.
pub fn init_all(paths: &StorePaths) -> Result<()> {
    init_store(&paths.core, CORE_DDL)?;
    init_store(&paths.bundles, BUNDLES_DDL)?;
    init_store(&paths.data, DATA_DDL)?;
    init_store(&paths.moderation, MODERATION_DDL)?;
    Ok(())
}

fn init_store(path: &Path, ddl: &str) -> Result<()> {
    let conn = Connection::open(path)?;
    // page_size only takes effect before the first table is written.
    conn.execute_batch("PRAGMA page_size = 4096")?;
    apply_pragmas(&conn)?;
    conn.execute_batch(ddl)?;
    verify_or_set_version(&conn)?;
    Ok(())
}

/// Applies the connection PRAGMAs shared by every open.
fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.busy_timeout(Duration::from_secs(30))?;
    Ok(())
}

fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<i32> = conn
        .query_row(
            "SELECT value FROM chaindex_metadata WHERE key = 'schema_version'",
            [],
            |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            },
        )
        .ok();

    match existing {
        None => {
            conn.execute(
                "INSERT INTO chaindex_metadata (key, value) VALUES ('schema_version', ?)",
                [SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(v) => Err(Error::Schema(format!(
            "schema version mismatch: store has version {v}, this build requires {SCHEMA_VERSION}"
        ))),
    }
}

/// Opens a read-write core connection with the bundles file attached as
/// schema `bundles`.
pub fn open_core_rw(paths: &StorePaths) -> Result<Connection> {
    let conn = Connection::open(&paths.core)?;
    apply_pragmas(&conn)?;
    attach(&conn, &paths.bundles, "bundles")?;
    Ok(conn)
}

/// Opens a read-only core connection with the bundles file attached as
/// schema `bundles`. Used by the core readers and the entire gql pool.
pub fn open_core_ro(paths: &StorePaths) -> Result<Connection> {
    let conn = open_ro(&paths.core)?;
    attach(&conn, &paths.bundles, "bundles")?;
    Ok(conn)
}

/// Opens a read-write bundles connection with the core file attached as
/// schema `core` (root-transaction height resolution at item ingestion).
pub fn open_bundles_rw(paths: &StorePaths) -> Result<Connection> {
    let conn = Connection::open(&paths.bundles)?;
    apply_pragmas(&conn)?;
    attach(&conn, &paths.core, "core")?;
    Ok(conn)
}

/// Opens a read-only bundles connection with core attached.
pub fn open_bundles_ro(paths: &StorePaths) -> Result<Connection> {
    let conn = open_ro(&paths.bundles)?;
    attach(&conn, &paths.core, "core")?;
    Ok(conn)
}

/// Opens a read-write connection to a standalone store (data, moderation).
pub fn open_standalone_rw(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

/// Opens a read-only connection to a standalone store.
pub fn open_standalone_ro(path: &Path) -> Result<Connection> {
    open_ro(path)
}

fn open_ro(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(30))?;
    Ok(conn)
}

fn attach(conn: &Connection, path: &Path, name: &str) -> Result<()> {
    let path = path
        .to_str()
        .ok_or_else(|| Error::Schema(format!("non-UTF-8 store path: {path:?}")))?;
    conn.execute_batch(&format!("ATTACH DATABASE '{path}' AS {name}"))?;
    Ok(())
}

// =============================================================================
// Statement Cache
// =============================================================================

/// Prepares every named statement once at worker boot.
///
/// Sizing the rusqlite prepared-statement cache above the statement count
/// keeps all of them resident, so steady-state execution never re-parses SQL.
/// A broken statement fails the worker here rather than on first use.
pub fn warm_statements(conn: &Connection, statements: &[(&str, &str)]) -> Result<()> {
    conn.set_prepared_statement_cache_capacity(statements.len() + 16);
    for (name, sql) in statements {
        conn.prepare_cached(sql)
            .map_err(|e| Error::Schema(format!("statement {name}: {e}")))?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
