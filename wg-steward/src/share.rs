// Peer share links

//! Share links
//!
//! A share link hands a peer's client configuration to someone outside the
//! dashboard. Each peer has at most one live link: adding a new one expires
//! the previous links of that peer. A link is live while its expiry is
//! unset or in the future.

use crate::error::{Error, Missing, Result};
use crate::store::Store;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ShareLink {
    pub share_id: String,
    pub configuration: String,
    pub peer: String,
    pub expire_date: Option<NaiveDateTime>,
    pub share_date: NaiveDateTime,
}

/// Share-link table accessor
#[derive(Debug, Clone)]
pub struct ShareLinks {
    store: Store,
}

impl ShareLinks {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a link for a peer, expiring its earlier links; returns the new id
    pub async fn add(
        &self,
        configuration: &str,
        peer: &str,
        expire_date: Option<NaiveDateTime>,
    ) -> Result<String> {
        let now = Local::now().naive_local();
        let share_id = uuid::Uuid::new_v4().to_string();

        let mut tx = self.store.pool().begin().await?;
        sqlx::query(
            "UPDATE peer_share_links SET expire_date = ?
             WHERE configuration = ? AND peer = ? AND (expire_date IS NULL OR expire_date > ?)",
        )
        .bind(now)
        .bind(configuration)
        .bind(peer)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO peer_share_links (share_id, configuration, peer, expire_date, share_date)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&share_id)
        .bind(configuration)
        .bind(peer)
        .bind(expire_date)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        log::info!(target: "activity", "Share link {} created for peer {} of {}", share_id, peer, configuration);
        Ok(share_id)
    }

    /// Live links of one peer
    pub async fn links_for(&self, configuration: &str, peer: &str) -> Result<Vec<ShareLink>> {
        let now = Local::now().naive_local();
        Ok(sqlx::query_as::<_, ShareLink>(
            "SELECT share_id, configuration, peer, expire_date, share_date FROM peer_share_links
             WHERE configuration = ? AND peer = ? AND (expire_date IS NULL OR expire_date > ?)
             ORDER BY share_date",
        )
        .bind(configuration)
        .bind(peer)
        .bind(now)
        .fetch_all(self.store.pool())
        .await?)
    }

    /// A live link by id
    pub async fn get(&self, share_id: &str) -> Result<ShareLink> {
        let now = Local::now().naive_local();
        sqlx::query_as::<_, ShareLink>(
            "SELECT share_id, configuration, peer, expire_date, share_date FROM peer_share_links
             WHERE share_id = ? AND (expire_date IS NULL OR expire_date > ?)",
        )
        .bind(share_id)
        .bind(now)
        .fetch_optional(self.store.pool())
        .await?
        .ok_or_else(|| Error::not_found(Missing::ShareLink, share_id))
    }

    /// Change (or clear) a link's expiry
    pub async fn update_expiry(&self, share_id: &str, expire_date: Option<NaiveDateTime>) -> Result<()> {
        let result = sqlx::query("UPDATE peer_share_links SET expire_date = ? WHERE share_id = ?")
            .bind(expire_date)
            .bind(share_id)
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(Missing::ShareLink, share_id));
        }
        Ok(())
    }

    /// Re-point links after a configuration rename
    pub async fn rename_configuration(&self, from: &str, to: &str) -> Result<()> {
        sqlx::query("UPDATE peer_share_links SET configuration = ? WHERE configuration = ?")
            .bind(to)
            .bind(from)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }
}
