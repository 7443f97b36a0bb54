//! SQLite Campaign Store Implementation
//!
//! Backs the `CampaignStore` trait with hand-written SQL. The dispatch lock
//! is a compare-and-set on the campaign row's `lock_owner`/`lock_expires_at`
//! columns; `rows_affected` is the CAS signal. Timestamps are stored as
//! millisecond integers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};

use zc_common::{
    Campaign, CampaignProgress, CampaignRecipient, CampaignStatus, DispatchMode, RecipientStatus,
};

use crate::{CampaignStore, MessageContentStore, Result, StoreError};

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_millis)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// SQLite implementation of `CampaignStore`
pub struct SqliteCampaignStore {
    pool: SqlitePool,
}

impl SqliteCampaignStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn init_schema(&self) -> Result<()> {
        let schema = r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                message_ref TEXT NOT NULL,
                interval_seconds INTEGER NOT NULL DEFAULT 0,
                dispatch_mode TEXT NOT NULL DEFAULT 'immediate',
                scheduled_at INTEGER,
                status TEXT NOT NULL DEFAULT 'draft',
                total_recipients INTEGER NOT NULL DEFAULT 0,
                processed_recipients INTEGER NOT NULL DEFAULT 0,
                lock_owner TEXT,
                lock_expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER,
                started_at INTEGER,
                completed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);
            CREATE INDEX IF NOT EXISTS idx_campaigns_scheduled_at ON campaigns(scheduled_at);

            CREATE TABLE IF NOT EXISTS campaign_recipients (
                campaign_id TEXT NOT NULL,
                group_handle TEXT NOT NULL,
                position INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                sent_at INTEGER,
                PRIMARY KEY (campaign_id, group_handle)
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_campaign_position
                ON campaign_recipients(campaign_id, position);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#;

        sqlx::query(schema).execute(&self.pool).await?;

        info!("Initialized SQLite campaign schema");
        Ok(())
    }

    fn parse_campaign(row: &sqlx::sqlite::SqliteRow) -> Campaign {
        Campaign {
            id: row.get("id"),
            name: row.get("name"),
            message_ref: row.get("message_ref"),
            interval_seconds: row.get::<i64, _>("interval_seconds") as u32,
            dispatch_mode: DispatchMode::from_str_lossy(row.get("dispatch_mode")),
            scheduled_at: row.get::<Option<i64>, _>("scheduled_at").map(from_millis),
            status: CampaignStatus::from_str_lossy(row.get("status")),
            total_recipients: row.get::<i64, _>("total_recipients") as u32,
            processed_recipients: row.get::<i64, _>("processed_recipients") as u32,
            lock_owner: row.get("lock_owner"),
            lock_expires_at: row.get::<Option<i64>, _>("lock_expires_at").map(from_millis),
            created_at: from_millis(row.get("created_at")),
            updated_at: row.get::<Option<i64>, _>("updated_at").map(from_millis),
            started_at: row.get::<Option<i64>, _>("started_at").map(from_millis),
            completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
        }
    }

    fn parse_recipient(row: &sqlx::sqlite::SqliteRow) -> CampaignRecipient {
        CampaignRecipient {
            campaign_id: row.get("campaign_id"),
            group_handle: row.get("group_handle"),
            position: row.get::<i64, _>("position") as u32,
            status: RecipientStatus::from_str_lossy(row.get("status")),
            attempts: row.get::<i64, _>("attempts") as u32,
            last_error: row.get("last_error"),
            sent_at: row.get::<Option<i64>, _>("sent_at").map(from_millis),
        }
    }

    async fn fetch_campaign(&self, id: &str) -> Result<Campaign> {
        self.get_campaign(id)
            .await?
            .ok_or_else(|| StoreError::CampaignNotFound(id.to_string()))
    }

    /// Refresh the campaign's processed count from recipient truth
    async fn refresh_processed_count<'a, E>(executor: E, campaign_id: &str) -> Result<()>
    where
        E: sqlx::Executor<'a, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "UPDATE campaigns SET processed_recipients = \
                 (SELECT COUNT(*) FROM campaign_recipients \
                  WHERE campaign_id = ? AND status IN ('sent', 'failed')), \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(campaign_id)
        .bind(to_millis(Utc::now()))
        .bind(campaign_id)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for SqliteCampaignStore {
    async fn create_campaign(
        &self,
        campaign: &Campaign,
        recipients: &[CampaignRecipient],
    ) -> Result<()> {
        if campaign.dispatch_mode == DispatchMode::Scheduled {
            match campaign.scheduled_at {
                None => {
                    return Err(StoreError::InvalidCampaign(
                        "scheduled campaign requires scheduled_at".to_string(),
                    ))
                }
                Some(at) if at <= Utc::now() => {
                    return Err(StoreError::InvalidCampaign(
                        "scheduled_at must be in the future".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO campaigns \
                 (id, name, message_ref, interval_seconds, dispatch_mode, scheduled_at, \
                  status, total_recipients, processed_recipients, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&campaign.id)
        .bind(&campaign.name)
        .bind(&campaign.message_ref)
        .bind(campaign.interval_seconds as i64)
        .bind(campaign.dispatch_mode.as_str())
        .bind(opt_millis(campaign.scheduled_at))
        .bind(campaign.status.as_str())
        .bind(recipients.len() as i64)
        .bind(to_millis(campaign.created_at))
        .execute(&mut *tx)
        .await?;

        for recipient in recipients {
            sqlx::query(
                "INSERT INTO campaign_recipients \
                     (campaign_id, group_handle, position, status, attempts) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&campaign.id)
            .bind(&recipient.group_handle)
            .bind(recipient.position as i64)
            .bind(recipient.status.as_str())
            .bind(recipient.attempts as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            campaign_id = %campaign.id,
            recipients = recipients.len(),
            "Created campaign"
        );
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::parse_campaign))
    }

    async fn list_eligible(
        &self,
        status: CampaignStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Campaign>> {
        let before_ms = to_millis(before);

        let rows = match status {
            CampaignStatus::Scheduled => {
                sqlx::query(
                    "SELECT * FROM campaigns \
                     WHERE status = 'scheduled' \
                       AND (scheduled_at IS NULL OR scheduled_at <= ?) \
                     ORDER BY created_at ASC LIMIT ?",
                )
                .bind(before_ms)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            CampaignStatus::Running => {
                sqlx::query(
                    "SELECT * FROM campaigns \
                     WHERE status = 'running' \
                       AND (lock_owner IS NULL OR lock_expires_at <= ?) \
                     ORDER BY created_at ASC LIMIT ?",
                )
                .bind(before_ms)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            other => {
                sqlx::query(
                    "SELECT * FROM campaigns WHERE status = ? ORDER BY created_at ASC LIMIT ?",
                )
                .bind(other.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(Self::parse_campaign).collect())
    }

    async fn try_acquire_lock(
        &self,
        campaign_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let expiry = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));

        let result = sqlx::query(
            "UPDATE campaigns \
             SET lock_owner = ?, lock_expires_at = ?, updated_at = ? \
             WHERE id = ? \
               AND status NOT IN ('completed', 'cancelled') \
               AND (lock_owner IS NULL OR lock_expires_at <= ?)",
        )
        .bind(owner)
        .bind(to_millis(expiry))
        .bind(to_millis(now))
        .bind(campaign_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(campaign_id = %campaign_id, owner = %owner, acquired, "Lock acquisition attempt");
        Ok(acquired)
    }

    async fn renew_lock(&self, campaign_id: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let expiry = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));

        let result = sqlx::query(
            "UPDATE campaigns SET lock_expires_at = ? \
             WHERE id = ? AND lock_owner = ? AND lock_expires_at > ?",
        )
        .bind(to_millis(expiry))
        .bind(campaign_id)
        .bind(owner)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, campaign_id: &str, owner: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaigns \
             SET lock_owner = NULL, lock_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND lock_owner = ?",
        )
        .bind(to_millis(Utc::now()))
        .bind(campaign_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(campaign_id = %campaign_id, owner = %owner, "Released dispatch lock");
        }
        Ok(())
    }

    async fn update_campaign_status(
        &self,
        campaign_id: &str,
        status: CampaignStatus,
    ) -> Result<Campaign> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
            .bind(campaign_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::CampaignNotFound(campaign_id.to_string()))?;
        let campaign = Self::parse_campaign(&row);

        if campaign.status == status {
            tx.rollback().await?;
            return Ok(campaign);
        }
        if !campaign.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: campaign.status,
                to: status,
            });
        }
        if campaign.status == CampaignStatus::Draft && campaign.total_recipients == 0 {
            return Err(StoreError::NoRecipients(campaign_id.to_string()));
        }

        let now = Utc::now();
        let started_at = match (campaign.started_at, status) {
            (None, CampaignStatus::Running) => Some(now),
            (existing, _) => existing,
        };
        let completed_at = match status {
            CampaignStatus::Completed => Some(now),
            _ => campaign.completed_at,
        };

        sqlx::query(
            "UPDATE campaigns \
             SET status = ?, started_at = ?, completed_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(opt_millis(started_at))
        .bind(opt_millis(completed_at))
        .bind(to_millis(now))
        .bind(campaign_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(campaign_id = %campaign_id, from = %campaign.status, to = %status, "Campaign status updated");

        self.fetch_campaign(campaign_id).await
    }

    async fn list_recipients(&self, campaign_id: &str) -> Result<Vec<CampaignRecipient>> {
        let rows = sqlx::query(
            "SELECT * FROM campaign_recipients WHERE campaign_id = ? ORDER BY position ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::parse_recipient).collect())
    }

    async fn update_recipient(&self, recipient: &CampaignRecipient, owner: &str) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE campaign_recipients \
             SET status = ?, attempts = ?, last_error = ?, sent_at = ? \
             WHERE campaign_id = ? AND group_handle = ? \
               AND EXISTS (SELECT 1 FROM campaigns \
                           WHERE id = ? AND lock_owner = ? AND lock_expires_at > ?)",
        )
        .bind(recipient.status.as_str())
        .bind(recipient.attempts as i64)
        .bind(&recipient.last_error)
        .bind(opt_millis(recipient.sent_at))
        .bind(&recipient.campaign_id)
        .bind(&recipient.group_handle)
        .bind(&recipient.campaign_id)
        .bind(owner)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing recipient from an expired lease
            let exists = sqlx::query(
                "SELECT 1 FROM campaign_recipients WHERE campaign_id = ? AND group_handle = ?",
            )
            .bind(&recipient.campaign_id)
            .bind(&recipient.group_handle)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

            return if exists {
                Err(StoreError::LockLost(recipient.campaign_id.clone()))
            } else {
                Err(StoreError::RecipientNotFound {
                    campaign_id: recipient.campaign_id.clone(),
                    group_handle: recipient.group_handle.clone(),
                })
            };
        }

        Self::refresh_processed_count(&mut *tx, &recipient.campaign_id).await?;
        tx.commit().await?;

        debug!(
            campaign_id = %recipient.campaign_id,
            group_handle = %recipient.group_handle,
            status = %recipient.status,
            attempts = recipient.attempts,
            "Recipient updated"
        );
        Ok(())
    }

    async fn reset_stranded_recipients(&self, campaign_id: &str) -> Result<u32> {
        let result = sqlx::query(
            "UPDATE campaign_recipients SET status = 'pending' \
             WHERE campaign_id = ? AND status = 'sending'",
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected() as u32;
        if count > 0 {
            info!(campaign_id = %campaign_id, count, "Reset stranded sending recipients to pending");
        }
        Ok(count)
    }

    async fn get_progress(&self, campaign_id: &str) -> Result<CampaignProgress> {
        // Validates existence as a side effect
        self.fetch_campaign(campaign_id).await?;

        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM campaign_recipients \
             WHERE campaign_id = ? GROUP BY status",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        let mut progress = CampaignProgress::default();
        for row in &rows {
            let count = row.get::<i64, _>("n") as u32;
            match RecipientStatus::from_str_lossy(row.get("status")) {
                RecipientStatus::Pending => progress.pending = count,
                RecipientStatus::Sending => progress.sending = count,
                RecipientStatus::Sent => progress.sent = count,
                RecipientStatus::Failed => progress.failed = count,
            }
            progress.total += count;
        }
        Ok(progress)
    }

    async fn delete_campaign(&self, campaign_id: &str) -> Result<()> {
        let campaign = self.fetch_campaign(campaign_id).await?;
        if campaign.status == CampaignStatus::Running {
            return Err(StoreError::CampaignRunning(campaign_id.to_string()));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM campaign_recipients WHERE campaign_id = ?")
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM campaigns WHERE id = ?")
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(campaign_id = %campaign_id, "Deleted campaign");
        Ok(())
    }
}

/// SQLite implementation of the message-content read path
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a message (used by seeding and tests)
    pub async fn put_message(&self, id: &str, title: &str, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO messages (id, title, body, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(title)
        .bind(body)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageContentStore for SqliteMessageStore {
    async fn get_message_text(&self, message_ref: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT body FROM messages WHERE id = ?")
            .bind(message_ref)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("body")))
    }
}
