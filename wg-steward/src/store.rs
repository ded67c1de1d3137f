// Persistent peer store

//! SQLite persistence for peers
//!
//! Every configuration owns four tables named after it:
//!
//! * `"<name>"`: active peers
//! * `"<name>_restrict_access"`: restricted peers
//! * `"<name>_transfer"`: transfer history snapshots
//! * `"<name>_deleted"`: copies of hard-deleted peers
//!
//! Configuration names are validated with [`validate_configuration_name`]
//! before they ever reach this module, so interpolating them as quoted
//! identifiers is safe and no name can alias another configuration's side
//! table. All values are bound.
//!
//! Shared tables (`peer_jobs`, `peer_job_log`, `peer_share_links`) are
//! created by [`Store::init`] and used by [`crate::jobs`] and [`crate::share`].

use crate::error::{Error, Result};
use crate::peer::{Peer, ResetKind};
use crate::types::PeerStatus;
use crate::wg_controller::validate_interface_name;
use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

const PEER_COLUMNS: &str = "id, private_key, dns, endpoint_allowed_ip, name, \
    total_receive, total_sent, total_data, endpoint, status, latest_handshake, allowed_ip, \
    cumu_receive, cumu_sent, cumu_data, mtu, keepalive, remote_endpoint, preshared_key";

const TRANSFER_COLUMNS: &str =
    "id, total_receive, total_sent, total_data, cumu_receive, cumu_sent, cumu_data, time";

const SNAPSHOT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Which peer table of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTable {
    Active,
    Restricted,
    Deleted,
}

const RESTRICTED_SUFFIX: &str = "_restrict_access";
const TRANSFER_SUFFIX: &str = "_transfer";
const DELETED_SUFFIX: &str = "_deleted";

impl PeerTable {
    fn name(self, configuration: &str) -> String {
        match self {
            PeerTable::Active => configuration.to_string(),
            PeerTable::Restricted => format!("{}{}", configuration, RESTRICTED_SUFFIX),
            PeerTable::Deleted => format!("{}{}", configuration, DELETED_SUFFIX),
        }
    }
}

fn transfer_table(configuration: &str) -> String {
    format!("{}{}", configuration, TRANSFER_SUFFIX)
}

/// Check a configuration name before it becomes a set of table names
///
/// On top of the interface name rules, a name may not end in one of the
/// side-table suffixes: `wg0_deleted` would otherwise read and write the
/// deleted-peer table of `wg0`.
pub fn validate_configuration_name(name: &str) -> Result<()> {
    validate_interface_name(name)?;
    if let Some(suffix) = [RESTRICTED_SUFFIX, TRANSFER_SUFFIX, DELETED_SUFFIX]
        .into_iter()
        .find(|suffix| name.ends_with(suffix))
    {
        return Err(Error::validation(format!(
            "Configuration name {} cannot end with {}",
            name, suffix
        )));
    }
    Ok(())
}

/// Every table a configuration owns, in dump order
fn owned_tables(configuration: &str) -> [String; 4] {
    [
        PeerTable::Active.name(configuration),
        PeerTable::Restricted.name(configuration),
        transfer_table(configuration),
        PeerTable::Deleted.name(configuration),
    ]
}

/// Session and cumulative byte counters of one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub total_receive: i64,
    pub total_sent: i64,
    pub cumu_receive: i64,
    pub cumu_sent: i64,
}

impl Counters {
    pub fn total_data(&self) -> i64 {
        self.total_receive.saturating_add(self.total_sent)
    }

    pub fn cumu_data(&self) -> i64 {
        self.cumu_receive.saturating_add(self.cumu_sent)
    }
}

/// One row of a configuration's transfer history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TransferSnapshot {
    pub id: String,
    pub total_receive: i64,
    pub total_sent: i64,
    pub total_data: i64,
    pub cumu_receive: i64,
    pub cumu_sent: i64,
    pub cumu_data: i64,
    pub time: NaiveDateTime,
}

/// Quote a text value as an SQL literal
///
/// Control characters are spliced in with `char()` so a statement always
/// fits on one dump line.
fn literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\'' => quoted.push_str("''"),
            c if c.is_control() => {
                quoted.push_str(&format!("' || char({}) || '", u32::from(c)))
            }
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

fn peer_insert_statement(table: &str, peer: &Peer) -> String {
    let values = [
        literal(&peer.id),
        literal(&peer.private_key),
        literal(&peer.dns),
        literal(&peer.endpoint_allowed_ip),
        literal(&peer.name),
        peer.total_receive.to_string(),
        peer.total_sent.to_string(),
        peer.total_data.to_string(),
        literal(&peer.endpoint),
        literal(peer.status.as_str()),
        literal(&peer.latest_handshake),
        literal(&peer.allowed_ip),
        peer.cumu_receive.to_string(),
        peer.cumu_sent.to_string(),
        peer.cumu_data.to_string(),
        peer.mtu.to_string(),
        peer.keepalive.to_string(),
        literal(&peer.remote_endpoint),
        literal(&peer.preshared_key),
    ];
    format!(
        r#"INSERT INTO "{}" ({}) VALUES ({});"#,
        table,
        PEER_COLUMNS,
        values.join(", ")
    )
}

fn snapshot_insert_statement(table: &str, s: &TransferSnapshot) -> String {
    format!(
        r#"INSERT INTO "{}" ({}) VALUES ({}, {}, {}, {}, {}, {}, {}, {});"#,
        table,
        TRANSFER_COLUMNS,
        literal(&s.id),
        s.total_receive,
        s.total_sent,
        s.total_data,
        s.cumu_receive,
        s.cumu_sent,
        s.cumu_data,
        literal(&s.time.format(SNAPSHOT_TIME_FORMAT).to_string()),
    )
}

/// Handle on the SQLite database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file and the shared tables
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        log::info!("Opened peer store at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, one connection kept for its whole life
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the tables shared by all configurations
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS peer_jobs (
                job_id TEXT NOT NULL PRIMARY KEY,
                configuration TEXT NOT NULL,
                peer TEXT NOT NULL,
                field TEXT NOT NULL,
                operator TEXT NOT NULL,
                value TEXT NOT NULL,
                creation_date TEXT NOT NULL,
                expire_date TEXT,
                action TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS peer_job_log (
                log_id TEXT NOT NULL PRIMARY KEY,
                job_id TEXT NOT NULL,
                log_date TEXT NOT NULL,
                status INTEGER NOT NULL,
                message TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS peer_share_links (
                share_id TEXT NOT NULL PRIMARY KEY,
                configuration TEXT NOT NULL,
                peer TEXT NOT NULL,
                expire_date TEXT,
                share_date TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -- Table lifecycle ------------------------------------------------------

    /// Create a configuration's four tables if missing
    pub async fn create_tables(&self, configuration: &str) -> Result<()> {
        for table in [
            PeerTable::Active,
            PeerTable::Restricted,
            PeerTable::Deleted,
        ] {
            let sql = format!(
                r#"CREATE TABLE IF NOT EXISTS "{}" (
                    id TEXT NOT NULL PRIMARY KEY,
                    private_key TEXT NOT NULL DEFAULT '',
                    dns TEXT NOT NULL DEFAULT '',
                    endpoint_allowed_ip TEXT NOT NULL DEFAULT '',
                    name TEXT NOT NULL DEFAULT '',
                    total_receive INTEGER NOT NULL DEFAULT 0,
                    total_sent INTEGER NOT NULL DEFAULT 0,
                    total_data INTEGER NOT NULL DEFAULT 0,
                    endpoint TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'stopped',
                    latest_handshake TEXT NOT NULL DEFAULT '',
                    allowed_ip TEXT NOT NULL DEFAULT '',
                    cumu_receive INTEGER NOT NULL DEFAULT 0,
                    cumu_sent INTEGER NOT NULL DEFAULT 0,
                    cumu_data INTEGER NOT NULL DEFAULT 0,
                    mtu INTEGER NOT NULL DEFAULT 0,
                    keepalive INTEGER NOT NULL DEFAULT 0,
                    remote_endpoint TEXT NOT NULL DEFAULT '',
                    preshared_key TEXT NOT NULL DEFAULT ''
                )"#,
                table.name(configuration)
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                id TEXT NOT NULL,
                total_receive INTEGER NOT NULL DEFAULT 0,
                total_sent INTEGER NOT NULL DEFAULT 0,
                total_data INTEGER NOT NULL DEFAULT 0,
                cumu_receive INTEGER NOT NULL DEFAULT 0,
                cumu_sent INTEGER NOT NULL DEFAULT 0,
                cumu_data INTEGER NOT NULL DEFAULT 0,
                time TEXT NOT NULL
            )"#,
            transfer_table(configuration)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Drop a configuration's four tables
    pub async fn drop_tables(&self, configuration: &str) -> Result<()> {
        for table in owned_tables(configuration) {
            sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, table))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Copy every row of `from`'s tables into freshly created tables for `to`
    pub async fn copy_tables(&self, from: &str, to: &str) -> Result<()> {
        self.create_tables(to).await?;
        let mut tx = self.pool.begin().await?;
        for (src, dst) in owned_tables(from).iter().zip(owned_tables(to).iter()) {
            sqlx::query(&format!(r#"INSERT INTO "{}" SELECT * FROM "{}""#, dst, src))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // -- Peer rows --------------------------------------------------------------

    /// All peers of one table in insertion order
    pub async fn peers(&self, configuration: &str, table: PeerTable) -> Result<Vec<Peer>> {
        let sql = format!(
            r#"SELECT {} FROM "{}" ORDER BY rowid"#,
            PEER_COLUMNS,
            table.name(configuration)
        );
        Ok(sqlx::query_as::<_, Peer>(&sql).fetch_all(&self.pool).await?)
    }

    /// One peer by public key
    pub async fn peer(&self, configuration: &str, table: PeerTable, id: &str) -> Result<Option<Peer>> {
        let sql = format!(
            r#"SELECT {} FROM "{}" WHERE id = ?"#,
            PEER_COLUMNS,
            table.name(configuration)
        );
        Ok(sqlx::query_as::<_, Peer>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Whether the peer is active, restricted, or unknown
    pub async fn locate(&self, configuration: &str, id: &str) -> Result<Option<PeerTable>> {
        for table in [PeerTable::Active, PeerTable::Restricted] {
            let sql = format!(r#"SELECT 1 FROM "{}" WHERE id = ?"#, table.name(configuration));
            let found: Option<i64> = sqlx::query_scalar(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if found.is_some() {
                return Ok(Some(table));
            }
        }
        Ok(None)
    }

    pub async fn insert_peer(&self, configuration: &str, table: PeerTable, peer: &Peer) -> Result<()> {
        let sql = format!(
            r#"INSERT INTO "{}" ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            table.name(configuration),
            PEER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&peer.id)
            .bind(&peer.private_key)
            .bind(&peer.dns)
            .bind(&peer.endpoint_allowed_ip)
            .bind(&peer.name)
            .bind(peer.total_receive)
            .bind(peer.total_sent)
            .bind(peer.total_data)
            .bind(&peer.endpoint)
            .bind(peer.status)
            .bind(&peer.latest_handshake)
            .bind(&peer.allowed_ip)
            .bind(peer.cumu_receive)
            .bind(peer.cumu_sent)
            .bind(peer.cumu_data)
            .bind(peer.mtu)
            .bind(peer.keepalive)
            .bind(&peer.remote_endpoint)
            .bind(&peer.preshared_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Refresh the one field the configuration file is authoritative for
    pub async fn update_allowed_ip(&self, configuration: &str, id: &str, allowed_ip: &str) -> Result<()> {
        let sql = format!(
            r#"UPDATE "{}" SET allowed_ip = ? WHERE id = ?"#,
            PeerTable::Active.name(configuration)
        );
        sqlx::query(&sql)
            .bind(allowed_ip)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the operator-editable settings of an active peer
    pub async fn update_settings(&self, configuration: &str, peer: &Peer) -> Result<()> {
        let sql = format!(
            r#"UPDATE "{}" SET name = ?, private_key = ?, dns = ?, endpoint_allowed_ip = ?,
                allowed_ip = ?, mtu = ?, keepalive = ?, preshared_key = ? WHERE id = ?"#,
            PeerTable::Active.name(configuration)
        );
        let result = sqlx::query(&sql)
            .bind(&peer.name)
            .bind(&peer.private_key)
            .bind(&peer.dns)
            .bind(&peer.endpoint_allowed_ip)
            .bind(&peer.allowed_ip)
            .bind(peer.mtu)
            .bind(peer.keepalive)
            .bind(&peer.preshared_key)
            .bind(&peer.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(crate::error::Missing::Peer, &peer.id));
        }
        Ok(())
    }

    /// Move a peer between the active and restricted tables in one transaction
    ///
    /// Returns `false` when the peer was not in `from`.
    pub async fn move_peer(
        &self,
        configuration: &str,
        id: &str,
        from: PeerTable,
        to: PeerTable,
    ) -> Result<bool> {
        let src = from.name(configuration);
        let dst = to.name(configuration);
        let mut tx = self.pool.begin().await?;
        let copied = sqlx::query(&format!(
            r#"INSERT INTO "{}" SELECT * FROM "{}" WHERE id = ?"#,
            dst, src
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if copied.rows_affected() == 0 {
            return Ok(false);
        }
        if to == PeerTable::Restricted {
            sqlx::query(&format!(r#"UPDATE "{}" SET status = ? WHERE id = ?"#, dst))
                .bind(PeerStatus::Stopped)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&format!(r#"DELETE FROM "{}" WHERE id = ?"#, src))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Copy a peer into the deleted table, then remove it from `from`
    ///
    /// Returns `false` when the peer was not in `from`.
    pub async fn delete_peer(&self, configuration: &str, id: &str, from: PeerTable) -> Result<bool> {
        let src = from.name(configuration);
        let deleted = PeerTable::Deleted.name(configuration);
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"INSERT OR REPLACE INTO "{}" SELECT * FROM "{}" WHERE id = ?"#,
            deleted, src
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query(&format!(r#"DELETE FROM "{}" WHERE id = ?"#, src))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed.rows_affected() > 0)
    }

    // -- Live metrics -----------------------------------------------------------

    pub async fn update_counters(&self, configuration: &str, id: &str, c: &Counters) -> Result<()> {
        let sql = format!(
            r#"UPDATE "{}" SET total_receive = ?, total_sent = ?, total_data = ?,
                cumu_receive = ?, cumu_sent = ?, cumu_data = ? WHERE id = ?"#,
            PeerTable::Active.name(configuration)
        );
        sqlx::query(&sql)
            .bind(c.total_receive)
            .bind(c.total_sent)
            .bind(c.total_data())
            .bind(c.cumu_receive)
            .bind(c.cumu_sent)
            .bind(c.cumu_data())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_handshake(
        &self,
        configuration: &str,
        id: &str,
        latest_handshake: &str,
        status: PeerStatus,
    ) -> Result<()> {
        let sql = format!(
            r#"UPDATE "{}" SET latest_handshake = ?, status = ? WHERE id = ?"#,
            PeerTable::Active.name(configuration)
        );
        sqlx::query(&sql)
            .bind(latest_handshake)
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_endpoint(&self, configuration: &str, id: &str, endpoint: &str) -> Result<()> {
        let sql = format!(
            r#"UPDATE "{}" SET endpoint = ? WHERE id = ?"#,
            PeerTable::Active.name(configuration)
        );
        sqlx::query(&sql)
            .bind(endpoint)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Zero the selected session and cumulative counters of an active peer
    pub async fn reset_usage(&self, configuration: &str, id: &str, kind: ResetKind) -> Result<()> {
        let assignments = match kind {
            ResetKind::Total => {
                "total_receive = 0, total_sent = 0, total_data = 0, \
                 cumu_receive = 0, cumu_sent = 0, cumu_data = 0"
            }
            ResetKind::Receive => {
                "total_receive = 0, cumu_receive = 0, \
                 total_data = total_sent, cumu_data = cumu_sent"
            }
            ResetKind::Sent => {
                "total_sent = 0, cumu_sent = 0, \
                 total_data = total_receive, cumu_data = cumu_receive"
            }
        };
        let sql = format!(
            r#"UPDATE "{}" SET {} WHERE id = ?"#,
            PeerTable::Active.name(configuration),
            assignments
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(crate::error::Missing::Peer, id));
        }
        Ok(())
    }

    pub async fn insert_snapshot(&self, configuration: &str, snapshot: &TransferSnapshot) -> Result<()> {
        let sql = format!(
            r#"INSERT INTO "{}" ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            transfer_table(configuration),
            TRANSFER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&snapshot.id)
            .bind(snapshot.total_receive)
            .bind(snapshot.total_sent)
            .bind(snapshot.total_data)
            .bind(snapshot.cumu_receive)
            .bind(snapshot.cumu_sent)
            .bind(snapshot.cumu_data)
            .bind(snapshot.time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transfer history, oldest first; all peers when `id` is `None`
    pub async fn snapshots(&self, configuration: &str, id: Option<&str>) -> Result<Vec<TransferSnapshot>> {
        let table = transfer_table(configuration);
        let rows = match id {
            Some(id) => {
                let sql = format!(
                    r#"SELECT {} FROM "{}" WHERE id = ? ORDER BY rowid"#,
                    TRANSFER_COLUMNS, table
                );
                sqlx::query_as::<_, TransferSnapshot>(&sql)
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(r#"SELECT {} FROM "{}" ORDER BY rowid"#, TRANSFER_COLUMNS, table);
                sqlx::query_as::<_, TransferSnapshot>(&sql)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    // -- Dump / replay ------------------------------------------------------------

    /// Render every row of a configuration's tables as replayable INSERT statements
    pub async fn dump(&self, configuration: &str) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for table in [PeerTable::Active, PeerTable::Restricted] {
            let name = table.name(configuration);
            for peer in self.peers(configuration, table).await? {
                lines.push(peer_insert_statement(&name, &peer));
            }
        }
        let transfer = transfer_table(configuration);
        for snapshot in self.snapshots(configuration, None).await? {
            lines.push(snapshot_insert_statement(&transfer, &snapshot));
        }
        let deleted = PeerTable::Deleted.name(configuration);
        for peer in self.peers(configuration, PeerTable::Deleted).await? {
            lines.push(peer_insert_statement(&deleted, &peer));
        }
        Ok(lines)
    }

    /// Recreate a configuration's tables from a dump
    ///
    /// Every line must be an INSERT into one of this configuration's tables;
    /// the dump is checked before anything is dropped.
    pub async fn replay(&self, configuration: &str, dump: &str) -> Result<()> {
        let prefixes: Vec<String> = owned_tables(configuration)
            .iter()
            .map(|t| format!(r#"INSERT INTO "{}" "#, t))
            .collect();
        let statements: Vec<&str> = dump
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if let Some(bad) = statements
            .iter()
            .find(|l| !prefixes.iter().any(|p| l.starts_with(p.as_str())))
        {
            return Err(Error::validation(format!(
                "Dump line does not belong to configuration {}: {}",
                configuration, bad
            )));
        }

        self.drop_tables(configuration).await?;
        self.create_tables(configuration).await?;

        let mut tx = self.pool.begin().await?;
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        log::debug!(
            "Replayed {} statements into configuration {}",
            statements.len(),
            configuration
        );
        Ok(())
    }
}
