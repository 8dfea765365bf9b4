//! Background submission runs. A run takes the cluster lock for its kind, then
//! works through every tenant: watchdog, circuit breaker, selection, in-flight
//! marking and one pipeline pass per record.

use crate::config::{CompanySubmissionConfig, SchedulePolicy};
use crate::error::{VerifactuError, VerifactuResult};
use crate::host::HostServices;
use crate::pipeline::{Disposition, Pacer, RecordPipeline, RecordReport};
use crate::policy::{breaker_open, is_due};
use crate::record::{FiscalRecord, RecordOperation, RecordStatus};
use crate::store::{RecordUpdate, SelectionOrder};
use chrono::{DateTime, NaiveTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const PERIODIC_LOCK_KEY: &str = "verifactu.scheduler.periodic";
pub const DAILY_LOCK_KEY: &str = "verifactu.scheduler.daily";
pub(crate) const RUN_LEASE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Periodic,
    Daily,
}

impl ScheduleKind {
    pub fn lock_key(&self) -> &'static str {
        match self {
            ScheduleKind::Periodic => PERIODIC_LOCK_KEY,
            ScheduleKind::Daily => DAILY_LOCK_KEY,
        }
    }
    pub fn label(&self) -> &'static str {
        match self {
            ScheduleKind::Periodic => "periodic",
            ScheduleKind::Daily => "daily",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantSkip {
    Disabled,
    NotDue,
    /// another worker is processing this tenant
    Busy,
    CircuitOpen { failures: usize },
    Configuration(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantReport {
    pub tenant: String,
    /// records the watchdog took out of `in_flight`
    pub released: Vec<String>,
    pub skipped: Option<TenantSkip>,
    pub records: Vec<RecordReport>,
}

impl TenantReport {
    fn new(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            released: vec![],
            skipped: None,
            records: vec![],
        }
    }
    fn skip(mut self, reason: TenantSkip) -> Self {
        self.skipped = Some(reason);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub kind: ScheduleKind,
    /// `false` when another process held the run lock
    pub ran: bool,
    pub tenants: Vec<TenantReport>,
}

impl RunReport {
    pub fn tenant(&self, tenant: &str) -> Option<&TenantReport> {
        self.tenants.iter().find(|t| t.tenant == tenant)
    }

    pub fn records(&self) -> impl Iterator<Item = &RecordReport> {
        self.tenants.iter().flat_map(|t| t.records.iter())
    }
}

pub struct SubmissionScheduler {
    host: HostServices,
}

impl SubmissionScheduler {
    pub fn new(host: HostServices) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &HostServices {
        &self.host
    }

    pub fn run(&self, kind: ScheduleKind) -> VerifactuResult<RunReport> {
        let now = self.host.clock.now();
        if !self
            .host
            .lock
            .try_acquire(kind.lock_key(), &self.host.holder, RUN_LEASE, now)?
        {
            info!(kind = kind.label(), "run lock held elsewhere, skipping");
            return Ok(RunReport {
                kind,
                ran: false,
                tenants: vec![],
            });
        }

        let result = self.run_tenants(kind);
        if let Err(err) = self.host.lock.release(kind.lock_key(), &self.host.holder) {
            error!(kind = kind.label(), %err, "could not release run lock");
        }
        result
    }

    fn run_tenants(&self, kind: ScheduleKind) -> VerifactuResult<RunReport> {
        let mut tenants = vec![];
        for config in self.host.tenants.tenants()? {
            let report = match self.run_tenant(kind, &config) {
                Ok(report) => report,
                // a broken tenant never stops the others
                Err(err) => {
                    error!(tenant = %config.tenant, %err, "tenant run failed");
                    TenantReport::new(&config.tenant).skip(TenantSkip::Failed(err.to_string()))
                }
            };
            tenants.push(report);
        }
        Ok(RunReport {
            kind,
            ran: true,
            tenants,
        })
    }

    fn run_tenant(&self, kind: ScheduleKind, config: &CompanySubmissionConfig) -> VerifactuResult<TenantReport> {
        let report = TenantReport::new(&config.tenant);
        if let Err(err) = config.validate() {
            error!(tenant = %config.tenant, %err, "tenant misconfigured");
            return Ok(report.skip(TenantSkip::Configuration(err.to_string())));
        }
        let now = self.host.clock.now();
        let policy = match kind {
            ScheduleKind::Periodic if !config.periodic.enabled => {
                return Ok(report.skip(TenantSkip::Disabled));
            }
            ScheduleKind::Daily if !config.daily.enabled => {
                return Ok(report.skip(TenantSkip::Disabled));
            }
            ScheduleKind::Periodic => &config.periodic,
            ScheduleKind::Daily => {
                if !self.daily_run_due(config, now)? {
                    return Ok(report.skip(TenantSkip::NotDue));
                }
                config.daily_policy()
            }
        };

        let tenant_key = tenant_lock_key(&config.tenant);
        if !self
            .host
            .lock
            .try_acquire(&tenant_key, &self.host.holder, RUN_LEASE, now)?
        {
            debug!(tenant = %config.tenant, "tenant busy");
            return Ok(report.skip(TenantSkip::Busy));
        }
        let result = self.process_tenant(kind, config, policy, report);
        if let Err(err) = self.host.lock.release(&tenant_key, &self.host.holder) {
            error!(tenant = %config.tenant, %err, "could not release tenant lock");
        }
        // a skipped tenant gets another daily attempt on the next tick
        if kind == ScheduleKind::Daily && matches!(&result, Ok(report) if report.skipped.is_none()) {
            self.host
                .markers
                .set_marker(&daily_marker(&config.tenant), now)?;
        }
        result
    }

    fn process_tenant(
        &self,
        kind: ScheduleKind,
        config: &CompanySubmissionConfig,
        policy: &SchedulePolicy,
        mut report: TenantReport,
    ) -> VerifactuResult<TenantReport> {
        let now = self.host.clock.now();
        report.released = self.release_stuck(config, now)?;

        let failures = self.recent_failures(config, now)?;
        if breaker_open(failures, &config.circuit_breaker) {
            warn!(tenant = %config.tenant, failures, "circuit open, skipping tenant");
            return Ok(report.skip(TenantSkip::CircuitOpen { failures }));
        }

        let pipeline = match RecordPipeline::for_tenant(&self.host, config) {
            Ok(pipeline) => pipeline,
            Err(err @ VerifactuError::Configuration(_)) | Err(err @ VerifactuError::Validation(_)) => {
                error!(tenant = %config.tenant, %err, "tenant misconfigured");
                return Ok(report.skip(TenantSkip::Configuration(err.to_string())));
            }
            Err(err) => return Err(err),
        };

        let batch = self.select_batch(config, policy, now)?;
        if batch.is_empty() {
            debug!(tenant = %config.tenant, kind = kind.label(), "nothing to send");
            return Ok(report);
        }
        let ids: Vec<String> = batch.iter().map(|r| r.record_id.clone()).collect();
        self.host.records.update(&ids, &RecordUpdate::in_flight(now))?;
        info!(tenant = %config.tenant, kind = kind.label(), count = ids.len(), "batch in flight");

        let pacer = Pacer::new(
            &self.host,
            pace_key(kind, &config.tenant),
            policy.min_interval(),
        );
        for (position, id) in ids.iter().enumerate() {
            let Some(record) = self.host.records.get(id)? else {
                continue;
            };
            if record.status != RecordStatus::InFlight {
                continue;
            }
            let record_report = match pipeline.process(record, Some(&pacer)) {
                Ok(record_report) => record_report,
                Err(err) => {
                    // left in flight, the watchdog settles it
                    error!(tenant = %config.tenant, record = %id, %err, "record commit failed");
                    continue;
                }
            };
            let failed = matches!(record_report.disposition, Disposition::Failed { .. });
            report.records.push(record_report);

            if failed {
                let failures = self.recent_failures(config, self.host.clock.now())?;
                if breaker_open(failures, &config.circuit_breaker) {
                    warn!(tenant = %config.tenant, failures, "circuit opened mid-run");
                    self.return_unsent(&ids[position + 1..])?;
                    break;
                }
            }
        }
        Ok(report)
    }

    fn recent_failures(&self, config: &CompanySubmissionConfig, now: DateTime<Utc>) -> VerifactuResult<usize> {
        self.host
            .ledger
            .failures_since(&config.tenant, now - config.breaker_window())
    }

    fn return_unsent(&self, ids: &[String]) -> VerifactuResult<()> {
        for id in ids {
            if let Some(record) = self.host.records.get(id)? {
                if record.status == RecordStatus::InFlight {
                    let prior = record.status_before_flight.unwrap_or(RecordStatus::Pending);
                    self.host
                        .records
                        .update(std::slice::from_ref(id), &RecordUpdate::status(prior))?;
                }
            }
        }
        Ok(())
    }

    /// Pending records first, oldest issued, then errored records whose
    /// backoff has elapsed. Original registrations dated after the earliest
    /// unsettled failure wait for it, so a retry is never starved by newer work.
    pub fn select_batch(
        &self,
        config: &CompanySubmissionConfig,
        policy: &SchedulePolicy,
        now: DateTime<Utc>,
    ) -> VerifactuResult<Vec<FiscalRecord>> {
        let barrier = self
            .host
            .records
            .list_for_tenant(&config.tenant)?
            .into_iter()
            .filter(|r| {
                is_original(r)
                    && r.superseded_by.is_none()
                    && matches!(r.status, RecordStatus::Error | RecordStatus::InFlight)
            })
            .map(|r| r.issue_date)
            .min();

        let mut batch: Vec<FiscalRecord> = self
            .host
            .records
            .find_eligible(&config.tenant, RecordStatus::Pending, usize::MAX, SelectionOrder::OldestIssued)?
            .into_iter()
            .filter(|r| !is_original(r) || barrier.is_none_or(|b| r.issue_date <= b))
            .take(policy.batch_size)
            .collect();

        let room = policy.batch_size.saturating_sub(batch.len());
        if room > 0 {
            let due = self
                .host
                .records
                .find_eligible(&config.tenant, RecordStatus::Error, usize::MAX, SelectionOrder::OldestAttempted)?
                .into_iter()
                .filter(|r| is_due(r, policy, self.host.jitter.jitter(policy.jitter_max_secs), now))
                .take(room);
            batch.extend(due);
        }

        batch.sort_by_key(|r| (r.issue_date, r.sequence));
        Ok(batch)
    }

    /// Takes records out of `in_flight` once their attempt is older than the
    /// tenant's TTL. A record whose outcome already reached the ledger gets
    /// that outcome, anything else goes back to where it was.
    pub fn release_stuck(&self, config: &CompanySubmissionConfig, now: DateTime<Utc>) -> VerifactuResult<Vec<String>> {
        let cutoff = now - config.watchdog_ttl();
        let mut released = vec![];
        for record in self.host.records.list_for_tenant(&config.tenant)? {
            if record.status != RecordStatus::InFlight {
                continue;
            }
            let attempted = record.last_attempt_at.as_ref().map(|t| t.to_datetime_utc());
            if attempted.is_some_and(|at| at > cutoff) {
                continue;
            }

            let settled = self
                .host
                .ledger
                .last_entry(&record.record_id)?
                .filter(|entry| {
                    attempted.is_some_and(|at| entry.date.to_datetime_utc() >= at)
                        && entry.digest_at_time == record.current_digest
                });
            let update = match settled {
                Some(entry) => match entry.status {
                    RecordStatus::Error => RecordUpdate {
                        increment_retry: true,
                        last_error_code: Some(entry.remote_error_code),
                        ..RecordUpdate::status(RecordStatus::Error)
                    },
                    RecordStatus::Held => RecordUpdate {
                        hold_reason: Some(Some(entry.summary)),
                        ..RecordUpdate::status(RecordStatus::Held)
                    },
                    RecordStatus::Rejected => RecordUpdate {
                        last_error_code: Some(entry.remote_error_code),
                        ..RecordUpdate::status(RecordStatus::Rejected)
                    },
                    status => RecordUpdate {
                        retry_count: Some(0),
                        last_error_code: Some(entry.remote_error_code),
                        ..RecordUpdate::status(status)
                    },
                },
                None => RecordUpdate::status(record.status_before_flight.unwrap_or(RecordStatus::Pending)),
            };
            warn!(
                tenant = %config.tenant,
                record = %record.record_id,
                restored = ?update.status,
                "watchdog released in-flight record"
            );
            self.host
                .records
                .update(std::slice::from_ref(&record.record_id), &update)?;
            released.push(record.record_id);
        }
        Ok(released)
    }

    fn daily_run_due(&self, config: &CompanySubmissionConfig, now: DateTime<Utc>) -> VerifactuResult<bool> {
        let zone = config.zone();
        let local_now = now.with_timezone(&zone).naive_local();
        let Some(at) = NaiveTime::from_hms_opt(config.daily.hour, config.daily.minute, 0) else {
            return Err(VerifactuError::Configuration(format!(
                "tenant {} daily time is out of range",
                config.tenant
            )));
        };
        let scheduled = local_now.date().and_time(at);
        if local_now < scheduled {
            return Ok(false);
        }
        let last_run = self.host.markers.get_marker(&daily_marker(&config.tenant))?;
        Ok(last_run.is_none_or(|last| last.with_timezone(&zone).naive_local() < scheduled))
    }
}

fn is_original(record: &FiscalRecord) -> bool {
    record.operation == RecordOperation::Registration && record.supersedes.is_none()
}

/// Held while a tenant's records are being sent, by a run of either kind or
/// by `submit_now`. A daily run that finds it taken reports `Busy`.
pub fn tenant_lock_key(tenant: &str) -> String {
    format!("verifactu.tenant.{tenant}")
}

/// Marker with the time of the tenant's last request for one kind of run.
/// The two schedules pace themselves independently.
pub fn pace_key(kind: ScheduleKind, tenant: &str) -> String {
    format!("pace.{}.{tenant}", kind.label())
}

fn daily_marker(tenant: &str) -> String {
    format!("daily.{tenant}")
}
