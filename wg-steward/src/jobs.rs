// Conditional peer jobs

//! Peer job scheduler
//!
//! A job watches one peer and, once its condition holds, restricts or
//! deletes it. Conditions compare a usage counter (bytes, session plus
//! cumulative) against a threshold, or the current local time against a
//! `%Y-%m-%d %H:%M:%S` timestamp.
//!
//! A job is live while its expiry is unset. It is expired when its action
//! succeeds, when an operator deletes it, or when its configuration or peer
//! has been missing for a number of consecutive runs. Every outcome is
//! appended to the job log.

use crate::configuration::BatchOutcome;
use crate::error::{Error, Missing, Result};
use crate::peer::Peer;
use crate::registry::Registry;
use crate::wg_controller::validate_interface_name;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Format of `date` job thresholds
pub const JOB_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Value a job condition looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobField {
    TotalReceive,
    TotalSent,
    TotalData,
    Date,
}

/// Comparison of a job condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobOperator {
    /// Equal
    Eq,
    /// Not equal
    Neq,
    /// Greater than
    Lgt,
    /// Less than
    Lst,
}

impl JobOperator {
    fn compare<T: PartialOrd>(self, x: T, y: T) -> bool {
        match self {
            JobOperator::Eq => x == y,
            JobOperator::Neq => x != y,
            JobOperator::Lgt => x > y,
            JobOperator::Lst => x < y,
        }
    }
}

/// What a job does once its condition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobAction {
    Restrict,
    Delete,
}

impl fmt::Display for JobField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobField::TotalReceive => "total_receive",
            JobField::TotalSent => "total_sent",
            JobField::TotalData => "total_data",
            JobField::Date => "date",
        };
        f.write_str(s)
    }
}

impl fmt::Display for JobOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobOperator::Eq => "eq",
            JobOperator::Neq => "neq",
            JobOperator::Lgt => "lgt",
            JobOperator::Lst => "lst",
        };
        f.write_str(s)
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobAction::Restrict => "restrict",
            JobAction::Delete => "delete",
        })
    }
}

/// Stored job
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PeerJob {
    pub job_id: String,
    pub configuration: String,
    pub peer: String,
    pub field: JobField,
    pub operator: JobOperator,
    pub value: String,
    pub creation_date: NaiveDateTime,
    pub expire_date: Option<NaiveDateTime>,
    pub action: JobAction,
}

impl PeerJob {
    pub fn is_live(&self) -> bool {
        self.expire_date.is_none()
    }

    /// Evaluate the condition against a peer at `now`
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when the stored threshold does not parse for the field.
    pub fn should_run(&self, peer: &Peer, now: NaiveDateTime) -> Result<bool> {
        match self.field {
            JobField::Date => {
                let threshold = parse_date_threshold(&self.value)?;
                Ok(self.operator.compare(now, threshold))
            }
            field => {
                let threshold = parse_byte_threshold(&self.value)?;
                let usage = match field {
                    JobField::TotalReceive => peer.total_receive.saturating_add(peer.cumu_receive),
                    JobField::TotalSent => peer.total_sent.saturating_add(peer.cumu_sent),
                    _ => peer.total_data.saturating_add(peer.cumu_data),
                };
                Ok(self.operator.compare(usage as f64, threshold))
            }
        }
    }

    fn describe(&self) -> String {
        format!(
            "if {} {} {} then {}",
            self.field, self.operator, self.value, self.action
        )
    }
}

fn parse_byte_threshold(value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::validation(format!("Job threshold is not a number: {}", value)))
}

fn parse_date_threshold(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), JOB_DATE_FORMAT).map_err(|_| {
        Error::validation(format!(
            "Job date must look like 2024-12-31 23:59:59, got {}",
            value
        ))
    })
}

/// Job to create or update
#[derive(Debug, Clone, Deserialize)]
pub struct JobDraft {
    /// Existing id to update; a new id is generated when unset
    pub job_id: Option<String>,
    pub configuration: String,
    pub peer: String,
    pub field: JobField,
    pub operator: JobOperator,
    pub value: String,
    pub action: JobAction,
}

/// One job log record
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct JobLogEntry {
    pub log_id: String,
    pub job_id: String,
    pub log_date: NaiveDateTime,
    pub status: bool,
    pub message: String,
}

const JOB_COLUMNS: &str =
    "job_id, configuration, peer, field, operator, value, creation_date, expire_date, action";

/// Job and job-log table accessor
#[derive(Debug, Clone)]
pub struct JobStore {
    store: crate::store::Store,
}

impl JobStore {
    pub fn new(store: crate::store::Store) -> Self {
        Self { store }
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.store.pool()
    }

    /// Append a job log record
    pub async fn log(&self, job_id: &str, status: bool, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO peer_job_log (log_id, job_id, log_date, status, message) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(job_id)
        .bind(Local::now().naive_local())
        .bind(status)
        .bind(message)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Insert a new job, or update field/operator/value/action of an existing live one
    pub async fn save_job(&self, draft: JobDraft) -> Result<PeerJob> {
        validate_interface_name(&draft.configuration)?;
        match draft.field {
            JobField::Date => {
                parse_date_threshold(&draft.value)?;
            }
            _ => {
                parse_byte_threshold(&draft.value)?;
            }
        }

        let existing = match &draft.job_id {
            Some(id) => self.job(id).await?.filter(PeerJob::is_live),
            None => None,
        };

        match existing {
            Some(current) => {
                sqlx::query(
                    "UPDATE peer_jobs SET field = ?, operator = ?, value = ?, action = ? WHERE job_id = ?",
                )
                .bind(draft.field)
                .bind(draft.operator)
                .bind(&draft.value)
                .bind(draft.action)
                .bind(&current.job_id)
                .execute(self.pool())
                .await?;
                let updated = self
                    .job(&current.job_id)
                    .await?
                    .ok_or_else(|| Error::not_found(Missing::Job, &current.job_id))?;
                self.log(
                    &updated.job_id,
                    true,
                    &format!(
                        "Job is updated from {}; to {}",
                        current.describe(),
                        updated.describe()
                    ),
                )
                .await?;
                Ok(updated)
            }
            None => {
                let job = PeerJob {
                    job_id: draft
                        .job_id
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    configuration: draft.configuration,
                    peer: draft.peer,
                    field: draft.field,
                    operator: draft.operator,
                    value: draft.value,
                    creation_date: Local::now().naive_local(),
                    expire_date: None,
                    action: draft.action,
                };
                sqlx::query(&format!(
                    "INSERT INTO peer_jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?)",
                    JOB_COLUMNS
                ))
                .bind(&job.job_id)
                .bind(&job.configuration)
                .bind(&job.peer)
                .bind(job.field)
                .bind(job.operator)
                .bind(&job.value)
                .bind(job.creation_date)
                .bind(job.action)
                .execute(self.pool())
                .await?;
                self.log(&job.job_id, true, &format!("Job is created {}", job.describe()))
                    .await?;
                Ok(job)
            }
        }
    }

    async fn expire(&self, job_id: &str, message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE peer_jobs SET expire_date = ? WHERE job_id = ? AND expire_date IS NULL",
        )
        .bind(Local::now().naive_local())
        .bind(job_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(Missing::Job, job_id));
        }
        self.log(job_id, true, message).await
    }

    /// Expire a live job
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.expire(job_id, "Job is removed due to being deleted or finished.")
            .await
    }

    /// A job by id, live or not
    pub async fn job(&self, job_id: &str) -> Result<Option<PeerJob>> {
        Ok(sqlx::query_as::<_, PeerJob>(&format!(
            "SELECT {} FROM peer_jobs WHERE job_id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?)
    }

    /// Every live job, oldest first
    pub async fn live_jobs(&self) -> Result<Vec<PeerJob>> {
        Ok(sqlx::query_as::<_, PeerJob>(&format!(
            "SELECT {} FROM peer_jobs WHERE expire_date IS NULL ORDER BY creation_date",
            JOB_COLUMNS
        ))
        .fetch_all(self.pool())
        .await?)
    }

    /// Live jobs of one peer
    pub async fn jobs_for_peer(&self, configuration: &str, peer: &str) -> Result<Vec<PeerJob>> {
        Ok(sqlx::query_as::<_, PeerJob>(&format!(
            "SELECT {} FROM peer_jobs WHERE configuration = ? AND peer = ? AND expire_date IS NULL
             ORDER BY creation_date",
            JOB_COLUMNS
        ))
        .bind(configuration)
        .bind(peer)
        .fetch_all(self.pool())
        .await?)
    }

    /// All jobs of a configuration, expired ones included
    pub async fn jobs_for_configuration(&self, configuration: &str) -> Result<Vec<PeerJob>> {
        Ok(sqlx::query_as::<_, PeerJob>(&format!(
            "SELECT {} FROM peer_jobs WHERE configuration = ? ORDER BY creation_date",
            JOB_COLUMNS
        ))
        .bind(configuration)
        .fetch_all(self.pool())
        .await?)
    }

    /// Log records of every job of a configuration, newest first
    pub async fn job_logs(&self, configuration: &str) -> Result<Vec<JobLogEntry>> {
        Ok(sqlx::query_as::<_, JobLogEntry>(
            "SELECT l.log_id, l.job_id, l.log_date, l.status, l.message
             FROM peer_job_log l JOIN peer_jobs j ON j.job_id = l.job_id
             WHERE j.configuration = ?
             ORDER BY l.log_date DESC, l.rowid DESC",
        )
        .bind(configuration)
        .fetch_all(self.pool())
        .await?)
    }

    /// Re-point jobs after a configuration rename
    pub async fn rename_configuration(&self, from: &str, to: &str) -> Result<()> {
        sqlx::query("UPDATE peer_jobs SET configuration = ? WHERE configuration = ?")
            .bind(to)
            .bind(from)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

/// Counts from one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub evaluated: usize,
    pub fired: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub orphaned: usize,
    pub expired_orphans: usize,
    /// Jobs whose peer is restricted; they wait without counting a miss
    pub waiting: usize,
}

/// Periodic job evaluator
pub struct JobScheduler {
    registry: Arc<Registry>,
    jobs: JobStore,
    interval: Duration,
    max_misses: u32,
    misses: HashMap<String, u32>,
}

impl JobScheduler {
    pub fn new(registry: Arc<Registry>, jobs: JobStore, interval_secs: u64, max_misses: u32) -> Self {
        Self {
            registry,
            jobs,
            interval: Duration::from_secs(interval_secs),
            max_misses,
            misses: HashMap::new(),
        }
    }

    /// Record a failed lookup; expires the job once it has missed too often
    async fn orphan(&mut self, job: &PeerJob, reason: &str, report: &mut RunReport) -> Result<()> {
        report.orphaned += 1;
        let count = self.misses.entry(job.job_id.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        log::warn!("Job {}: {} ({}/{})", job.job_id, reason, count, self.max_misses);
        self.jobs
            .log(
                &job.job_id,
                false,
                &format!("{}; lookup failed {} of {} times", reason, count, self.max_misses),
            )
            .await?;

        if count >= self.max_misses {
            self.misses.remove(&job.job_id);
            self.jobs
                .expire(
                    &job.job_id,
                    &format!("Job expired after {} failed lookups", count),
                )
                .await?;
            report.expired_orphans += 1;
        }
        Ok(())
    }

    /// Evaluate every live job once
    pub async fn run_once(&mut self) -> Result<RunReport> {
        let mut report = RunReport::default();
        let jobs = self.jobs.live_jobs().await?;

        let live: HashSet<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        self.misses.retain(|id, _| live.contains(id.as_str()));

        for job in &jobs {
            let Some(handle) = self.registry.get(&job.configuration).await else {
                let reason = format!("Configuration {} not found", job.configuration);
                self.orphan(job, &reason, &mut report).await?;
                continue;
            };
            let mut config = handle.lock().await;
            if let Err(e) = config.reconcile().await {
                log::warn!("Failed to refresh {} before job run: {}", config.name(), e);
            }

            if config.restricted_peer(&job.peer).is_some() {
                log::debug!("Job {}: peer {} is restricted, waiting", job.job_id, job.peer);
                self.misses.remove(&job.job_id);
                report.waiting += 1;
                continue;
            }
            let Some(peer) = config.peer(&job.peer).cloned() else {
                let reason = format!(
                    "Cannot find peer {} in configuration {}",
                    job.peer, job.configuration
                );
                drop(config);
                self.orphan(job, &reason, &mut report).await?;
                continue;
            };
            self.misses.remove(&job.job_id);
            report.evaluated += 1;

            let now = Local::now().naive_local();
            match job.should_run(&peer, now) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    log::warn!("Job {} cannot be evaluated: {}", job.job_id, e);
                    self.jobs.log(&job.job_id, false, &e.to_string()).await?;
                    continue;
                }
            }

            report.fired += 1;
            let ids = vec![peer.id.clone()];
            let result = match job.action {
                JobAction::Restrict => config.restrict_peers(&ids).await,
                JobAction::Delete => config.delete_peers(&ids).await,
            };
            let name = config.name().to_string();
            drop(config);

            match result {
                Ok(outcome) if outcome.is_success() => {
                    report.succeeded += 1;
                    log::info!(
                        "Job {}: peer {} of {} {}",
                        job.job_id,
                        peer.id,
                        name,
                        past_tense(job.action)
                    );
                    self.jobs
                        .log(
                            &job.job_id,
                            true,
                            &format!(
                                "Peer {} from {} is successfully {}.",
                                peer.id,
                                name,
                                past_tense(job.action)
                            ),
                        )
                        .await?;
                    self.jobs.delete_job(&job.job_id).await?;
                }
                other => {
                    report.failed += 1;
                    let detail = match other {
                        Ok(outcome) => failure_detail(&outcome),
                        Err(e) => e.to_string(),
                    };
                    log::error!("Job {} failed to {} peer {}: {}", job.job_id, job.action, peer.id, detail);
                    self.jobs
                        .log(
                            &job.job_id,
                            false,
                            &format!("Peer {} from {} failed to {}: {}", peer.id, name, job.action, detail),
                        )
                        .await?;
                }
            }
        }

        Ok(report)
    }

    /// Run until cancelled
    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        log::info!("Job scheduler started ({}s interval)", self.interval.as_secs());
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Job scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) => log::debug!("Job run: {:?}", report),
                        Err(e) => log::error!("Job run failed: {}", e),
                    }
                }
            }
        }
    }
}

fn past_tense(action: JobAction) -> &'static str {
    match action {
        JobAction::Restrict => "restricted",
        JobAction::Delete => "deleted",
    }
}

fn failure_detail(outcome: &BatchOutcome) -> String {
    outcome
        .save_error
        .clone()
        .or_else(|| outcome.items.iter().find_map(|i| i.error.clone()))
        .unwrap_or_else(|| "unknown failure".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PeerTable, Store};
    use crate::testing::{Fixture, FakeControl};

    fn usage_peer(total: i64, cumu: i64) -> Peer {
        Peer {
            id: "P1=".to_string(),
            total_data: total,
            cumu_data: cumu,
            total_receive: total,
            cumu_receive: cumu,
            ..Default::default()
        }
    }

    fn job(field: JobField, operator: JobOperator, value: &str, action: JobAction) -> PeerJob {
        PeerJob {
            job_id: "job-1".to_string(),
            configuration: "wg0".to_string(),
            peer: "P1=".to_string(),
            field,
            operator,
            value: value.to_string(),
            creation_date: Local::now().naive_local(),
            expire_date: None,
            action,
        }
    }

    fn draft(peer: &str, field: JobField, operator: JobOperator, value: &str, action: JobAction) -> JobDraft {
        JobDraft {
            job_id: None,
            configuration: "wg0".to_string(),
            peer: peer.to_string(),
            field,
            operator,
            value: value.to_string(),
            action,
        }
    }

    #[test]
    fn test_byte_conditions() {
        let now = Local::now().naive_local();
        let peer = usage_peer(60, 40);

        let lgt = job(JobField::TotalData, JobOperator::Lgt, "50", JobAction::Restrict);
        assert!(lgt.should_run(&peer, now).unwrap());

        let lst = job(JobField::TotalData, JobOperator::Lst, "200", JobAction::Restrict);
        assert!(lst.should_run(&peer, now).unwrap());

        let eq = job(JobField::TotalData, JobOperator::Eq, "100", JobAction::Restrict);
        assert!(eq.should_run(&peer, now).unwrap());

        let neq = job(JobField::TotalReceive, JobOperator::Neq, "100", JobAction::Restrict);
        assert!(!neq.should_run(&peer, now).unwrap());

        let sent = job(JobField::TotalSent, JobOperator::Lgt, "0", JobAction::Restrict);
        assert!(!sent.should_run(&peer, now).unwrap());
    }

    #[test]
    fn test_byte_usage_saturates() {
        let now = Local::now().naive_local();
        let peer = usage_peer(i64::MAX, i64::MAX);
        let lgt = job(JobField::TotalData, JobOperator::Lgt, "1000", JobAction::Restrict);
        assert!(lgt.should_run(&peer, now).unwrap());
    }

    #[test]
    fn test_date_conditions() {
        let now = NaiveDateTime::parse_from_str("2024-06-01 12:00:00", JOB_DATE_FORMAT).unwrap();
        let peer = Peer::default();

        let after = job(JobField::Date, JobOperator::Lgt, "2024-05-31 23:59:59", JobAction::Delete);
        assert!(after.should_run(&peer, now).unwrap());

        let before = job(JobField::Date, JobOperator::Lst, "2024-05-31 23:59:59", JobAction::Delete);
        assert!(!before.should_run(&peer, now).unwrap());

        let bad = job(JobField::Date, JobOperator::Lgt, "tomorrow", JobAction::Delete);
        assert!(bad.should_run(&peer, now).is_err());
    }

    #[tokio::test]
    async fn test_job_crud_and_log() {
        let jobs = JobStore::new(Store::in_memory().await.unwrap());
        let created = jobs
            .save_job(draft("P1=", JobField::TotalData, JobOperator::Lgt, "1000", JobAction::Delete))
            .await
            .unwrap();
        assert!(created.is_live());
        assert_eq!(jobs.jobs_for_peer("wg0", "P1=").await.unwrap().len(), 1);

        let mut update = draft("P1=", JobField::TotalSent, JobOperator::Lst, "5", JobAction::Restrict);
        update.job_id = Some(created.job_id.clone());
        let updated = jobs.save_job(update).await.unwrap();
        assert_eq!(updated.job_id, created.job_id);
        assert_eq!(updated.field, JobField::TotalSent);
        assert_eq!(updated.action, JobAction::Restrict);

        jobs.delete_job(&created.job_id).await.unwrap();
        assert!(jobs.jobs_for_peer("wg0", "P1=").await.unwrap().is_empty());
        assert_eq!(jobs.jobs_for_configuration("wg0").await.unwrap().len(), 1);
        assert!(jobs.delete_job(&created.job_id).await.unwrap_err().is_not_found());

        let logs = jobs.job_logs("wg0").await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|l| l.job_id == created.job_id));
        assert!(logs[2].message.starts_with("Job is created"));
    }

    #[tokio::test]
    async fn test_save_job_rejects_bad_threshold() {
        let jobs = JobStore::new(Store::in_memory().await.unwrap());
        let err = jobs
            .save_job(draft("P1=", JobField::Date, JobOperator::Lgt, "soon", JobAction::Delete))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = jobs
            .save_job(draft("P1=", JobField::TotalData, JobOperator::Lgt, "lots", JobAction::Delete))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_job_fires_and_expires() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        fx.set_usage("wg0", "P1=", 1000, 500).await;
        let job = fx
            .jobs
            .save_job(draft("P1=", JobField::TotalData, JobOperator::Lgt, "1000", JobAction::Delete))
            .await
            .unwrap();

        let mut scheduler = JobScheduler::new(fx.registry.clone(), fx.jobs.clone(), 180, 5);
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(report.succeeded, 1);

        assert_eq!(fx.store.locate("wg0", "P1=").await.unwrap(), None);
        assert_eq!(fx.store.peers("wg0", PeerTable::Deleted).await.unwrap().len(), 1);
        let stored = fx.jobs.job(&job.job_id).await.unwrap().unwrap();
        assert!(stored.expire_date.is_some());

        // Not evaluated again
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report, RunReport::default());
    }

    #[tokio::test]
    async fn test_failed_action_keeps_job_live() {
        let control = FakeControl::up(&["wg0"]);
        control.fail_remove("P1=");
        let fx = Fixture::new(control).await;
        fx.set_usage("wg0", "P1=", 10, 0).await;
        let job = fx
            .jobs
            .save_job(draft("P1=", JobField::TotalData, JobOperator::Lgt, "1", JobAction::Restrict))
            .await
            .unwrap();

        let mut scheduler = JobScheduler::new(fx.registry.clone(), fx.jobs.clone(), 180, 5);
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(fx.store.locate("wg0", "P1=").await.unwrap(), Some(PeerTable::Active));
        assert!(fx.jobs.job(&job.job_id).await.unwrap().unwrap().is_live());

        let logs = fx.jobs.job_logs("wg0").await.unwrap();
        assert!(!logs[0].status);
    }

    #[tokio::test]
    async fn test_condition_false_leaves_job_alone() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        fx.set_usage("wg0", "P1=", 10, 0).await;
        fx.jobs
            .save_job(draft("P1=", JobField::TotalData, JobOperator::Lgt, "1000", JobAction::Restrict))
            .await
            .unwrap();

        let mut scheduler = JobScheduler::new(fx.registry.clone(), fx.jobs.clone(), 180, 5);
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.fired, 0);
        assert_eq!(fx.store.locate("wg0", "P1=").await.unwrap(), Some(PeerTable::Active));
    }

    #[tokio::test]
    async fn test_orphaned_job_expires_after_misses() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        let job = fx
            .jobs
            .save_job(draft("ghost=", JobField::TotalData, JobOperator::Lgt, "1", JobAction::Delete))
            .await
            .unwrap();

        let mut scheduler = JobScheduler::new(fx.registry.clone(), fx.jobs.clone(), 180, 3);
        for _ in 0..2 {
            let report = scheduler.run_once().await.unwrap();
            assert_eq!(report.orphaned, 1);
            assert_eq!(report.expired_orphans, 0);
        }
        assert!(fx.jobs.job(&job.job_id).await.unwrap().unwrap().is_live());

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.expired_orphans, 1);
        assert!(!fx.jobs.job(&job.job_id).await.unwrap().unwrap().is_live());
    }

    #[tokio::test]
    async fn test_job_on_restricted_peer_waits() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        {
            let handle = fx.registry.get("wg0").await.unwrap();
            let mut config = handle.lock().await;
            config.restrict_peers(&["P2=".to_string()]).await.unwrap();
        }
        let job = fx
            .jobs
            .save_job(draft(
                "P2=",
                JobField::Date,
                JobOperator::Lgt,
                "2000-01-01 00:00:00",
                JobAction::Delete,
            ))
            .await
            .unwrap();

        let mut scheduler = JobScheduler::new(fx.registry.clone(), fx.jobs.clone(), 180, 2);
        for _ in 0..3 {
            let report = scheduler.run_once().await.unwrap();
            assert_eq!(report.waiting, 1);
            assert_eq!(report.orphaned, 0);
            assert_eq!(report.fired, 0);
        }
        assert!(fx.jobs.job(&job.job_id).await.unwrap().unwrap().is_live());
        assert_eq!(fx.store.locate("wg0", "P2=").await.unwrap(), Some(PeerTable::Restricted));

        // Fires once the peer is allowed again
        {
            let handle = fx.registry.get("wg0").await.unwrap();
            let mut config = handle.lock().await;
            config.allow_access_peers(&["P2=".to_string()]).await.unwrap();
        }
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(fx.store.locate("wg0", "P2=").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_job_on_missing_configuration_is_orphaned() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        let mut d = draft("P1=", JobField::TotalData, JobOperator::Lgt, "1", JobAction::Delete);
        d.configuration = "gone".to_string();
        fx.jobs.save_job(d).await.unwrap();

        let mut scheduler = JobScheduler::new(fx.registry.clone(), fx.jobs.clone(), 180, 5);
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.evaluated, 0);
    }
}
