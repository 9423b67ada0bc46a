//! Recurring backups
//!
//! The [`Scheduler`] runs a configuration on a fixed cadence. Each schedule is
//! one tokio task driving a monotonic interval timer; the backup itself runs
//! on the blocking pool so the timer task never does file I/O.
//!
//! On every tick the task tries to take the configuration's run lock without
//! waiting. If a previous run (scheduled or manual) still holds it, the tick is
//! skipped with a warning. Ticks missed while the process was busy are not
//! caught up: after a gap the schedule fires once and continues on its
//! cadence.
//!
//! Cancelling a schedule stops future fires. A run already in progress is left
//! to finish.
//!
//! ## Example
//!
//! ```rust,no_run
//! use archivist::{BackupConfiguration, BackupManager, Scheduler};
//! use std::sync::Arc;
//!
//! # async fn example(config: BackupConfiguration) -> archivist::Result<()> {
//! let manager = Arc::new(BackupManager::for_config(&config)?);
//! let scheduler = Scheduler::new(manager);
//! let handle = scheduler.schedule_automatic_backup(config, "every 6h")?;
//!
//! // Later
//! handle.cancel();
//! handle.stopped().await;
//! # Ok(())
//! # }
//! ```

use crate::config::BackupConfiguration;
use crate::error::{ArchivistError, Result};
use crate::manager::BackupManager;
use crate::types::BackupOptions;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HOUR: Duration = Duration::from_secs(60 * 60);

/// How often a schedule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    period: Duration,
}

impl Cadence {
    /// Fire every `period`
    ///
    /// # Errors
    ///
    /// Returns [`ArchivistError::Scheduler`] for a zero period.
    pub fn every(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(ArchivistError::Scheduler(
                "cadence must be longer than zero".to_string(),
            ));
        }
        Ok(Self { period })
    }

    /// Time between fires
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl FromStr for Cadence {
    type Err = ArchivistError;

    /// Parse `hourly`, `daily`, `weekly` or a duration such as `15m`, `6h`
    /// or `every 2h 30m`
    fn from_str(s: &str) -> Result<Self> {
        let expr = s.trim().to_ascii_lowercase();
        let period = match expr.as_str() {
            "hourly" => HOUR,
            "daily" => HOUR * 24,
            "weekly" => HOUR * 24 * 7,
            other => {
                let duration = other.strip_prefix("every").unwrap_or(other).trim();
                humantime::parse_duration(duration).map_err(|e| {
                    ArchivistError::Scheduler(format!("invalid cadence {:?}: {}", s, e))
                })?
            }
        };
        Self::every(period)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every {}", humantime::format_duration(self.period))
    }
}

/// Observable state of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    /// Not waiting for a fire (not started yet, or cancelled)
    Idle,
    /// Waiting for the next fire
    Waiting {
        /// When the timer fires next
        next_fire: DateTime<Utc>,
    },
    /// A backup started by this schedule is running
    Firing,
}

/// Counters of one schedule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStats {
    /// Timer fires
    pub fires: u64,
    /// Fires that started a backup
    pub started: u64,
    /// Fires skipped because the run lock was held
    pub skipped: u64,
    /// Started backups that completed
    pub completed: u64,
    /// Started backups that failed
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fires: AtomicU64,
    started: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// State shared between a handle and its timer task
#[derive(Debug, Default)]
struct Shared {
    next_fire: RwLock<Option<DateTime<Utc>>>,
    running: AtomicBool,
    last_backup_id: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
    counters: Counters,
}

/// Handle to a running schedule
#[derive(Debug)]
pub struct ScheduleHandle {
    id: Uuid,
    cadence: Cadence,
    fingerprint: String,
    token: CancellationToken,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    /// Unique id of this schedule
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cadence the schedule fires at
    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Fingerprint of the scheduled configuration
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Current state
    pub fn state(&self) -> SchedulerState {
        if self.shared.running.load(Ordering::SeqCst) {
            return SchedulerState::Firing;
        }
        match *self.shared.next_fire.read() {
            Some(next_fire) if !self.token.is_cancelled() => SchedulerState::Waiting { next_fire },
            _ => SchedulerState::Idle,
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ScheduleStats {
        let c = &self.shared.counters;
        ScheduleStats {
            fires: c.fires.load(Ordering::SeqCst),
            started: c.started.load(Ordering::SeqCst),
            skipped: c.skipped.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
        }
    }

    /// Id of the last backup this schedule completed
    pub fn last_backup_id(&self) -> Option<String> {
        self.shared.last_backup_id.read().clone()
    }

    /// Error of the last failed run
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.read().clone()
    }

    /// Stop future fires
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the timer task has exited
    ///
    /// Returns once the schedule is cancelled; an in-flight backup may still
    /// be finishing on the blocking pool.
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            warn!("Schedule {} task ended abnormally: {}", self.id, e);
        }
    }
}

/// Runs configurations on recurring timers
#[derive(Debug)]
pub struct Scheduler {
    manager: Arc<BackupManager>,
    root: CancellationToken,
    schedules: DashMap<Uuid, CancellationToken>,
}

impl Scheduler {
    /// Create a scheduler that runs backups through `manager`
    pub fn new(manager: Arc<BackupManager>) -> Self {
        Self {
            manager,
            root: CancellationToken::new(),
            schedules: DashMap::new(),
        }
    }

    /// Start backing up `config` every `cadence`
    ///
    /// Must be called from within a tokio runtime. The first fire happens one
    /// period from now.
    ///
    /// # Errors
    ///
    /// - [`ArchivistError::Configuration`] for an invalid configuration or
    ///   one that targets another backup location
    /// - [`ArchivistError::Scheduler`] for an invalid cadence or when no
    ///   runtime is available
    pub fn schedule_automatic_backup(
        &self,
        config: BackupConfiguration,
        cadence: &str,
    ) -> Result<ScheduleHandle> {
        let cadence: Cadence = cadence.parse()?;
        self.schedule(config, cadence)
    }

    /// Like [`schedule_automatic_backup`](Self::schedule_automatic_backup)
    /// with an already parsed cadence
    pub fn schedule(&self, config: BackupConfiguration, cadence: Cadence) -> Result<ScheduleHandle> {
        self.manager.check_config(&config)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ArchivistError::Scheduler(format!("no tokio runtime: {}", e)))?;

        let id = Uuid::new_v4();
        let fingerprint = config.fingerprint();
        let token = self.root.child_token();
        let shared = Arc::new(Shared::default());
        *shared.next_fire.write() = Some(Utc::now() + chrono_duration(cadence.period()));

        let task = runtime.spawn(run_schedule(
            id,
            Arc::clone(&self.manager),
            config,
            cadence,
            token.clone(),
            Arc::clone(&shared),
        ));
        self.schedules.insert(id, token.clone());

        info!("Scheduled backups of {} {} (schedule {})", fingerprint, cadence, id);
        Ok(ScheduleHandle {
            id,
            cadence,
            fingerprint,
            token,
            shared,
            task,
        })
    }

    /// Cancel one schedule by id
    ///
    /// Returns `false` if no such schedule exists.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.schedules.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of schedules that have not been cancelled
    pub fn active_schedules(&self) -> usize {
        self.schedules.retain(|_, token| !token.is_cancelled());
        self.schedules.len()
    }

    /// Cancel every schedule
    pub fn shutdown(&self) {
        info!("Stopping {} schedules", self.schedules.len());
        self.root.cancel();
        self.schedules.clear();
    }
}

async fn run_schedule(
    id: Uuid,
    manager: Arc<BackupManager>,
    config: BackupConfiguration,
    cadence: Cadence,
    token: CancellationToken,
    shared: Arc<Shared>,
) {
    let config = Arc::new(config);
    let fingerprint = config.fingerprint();
    let period = cadence.period();

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            fired_at = ticker.tick() => {
                let next = fired_at + period;
                let until_next = next.saturating_duration_since(Instant::now());
                *shared.next_fire.write() = Some(Utc::now() + chrono_duration(until_next));
                fire(id, &manager, &config, &fingerprint, &shared);
            }
        }
    }

    *shared.next_fire.write() = None;
    debug!("Schedule {} stopped", id);
}

fn fire(
    id: Uuid,
    manager: &Arc<BackupManager>,
    config: &Arc<BackupConfiguration>,
    fingerprint: &str,
    shared: &Arc<Shared>,
) {
    shared.counters.fires.fetch_add(1, Ordering::SeqCst);

    let Some(guard) = manager.run_locks().try_acquire(fingerprint) else {
        warn!(
            "Schedule {}: previous backup of {} still running, skipping this fire",
            id, fingerprint
        );
        shared.counters.skipped.fetch_add(1, Ordering::SeqCst);
        return;
    };

    shared.counters.started.fetch_add(1, Ordering::SeqCst);
    shared.running.store(true, Ordering::SeqCst);
    debug!("Schedule {} firing", id);

    let manager = Arc::clone(manager);
    let config = Arc::clone(config);
    let run = tokio::task::spawn_blocking(move || {
        manager.run_locked(guard, &config, BackupOptions::default())
    });

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ArchivistError::internal(format!("backup worker panicked: {}", e))),
        };
        match outcome {
            Ok(record) => {
                info!("Schedule {}: backup {} completed", id, record.backup_id);
                shared.counters.completed.fetch_add(1, Ordering::SeqCst);
                *shared.last_backup_id.write() = Some(record.backup_id);
            }
            Err(e) => {
                warn!("Schedule {}: backup failed: {}", id, e);
                shared.counters.failed.fetch_add(1, Ordering::SeqCst);
                *shared.last_error.write() = Some(e.to_string());
            }
        }
        shared.running.store(false, Ordering::SeqCst);
    });
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
