//! Capabilities the pipeline consumes from its host: persistence, credentials,
//! cluster locking and tenant configuration.

use crate::config::CompanySubmissionConfig;
use crate::error::VerifactuResult;
use crate::ledger::StatusLedgerEntry;
use crate::record::{FiscalRecord, RecordStatus};
use crate::signature::CredentialMaterial;
use crate::timestamp::TimeStamp;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionOrder {
    /// issue date, then insertion order
    OldestIssued,
    /// never attempted first, then by last attempt
    OldestAttempted,
}

/// Field changes applied to every record named in one `update` call. `None`
/// leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub status: Option<RecordStatus>,
    /// copy each record's current status into `status_before_flight` first
    pub remember_status: bool,
    pub clear_status_before_flight: bool,
    pub retry_count: Option<u32>,
    pub increment_retry: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub hold_reason: Option<Option<String>>,
    pub last_error_code: Option<Option<u32>>,
    pub superseded_by: Option<String>,
}

/// Cap on the stored retry counter, the backoff exponent stops growing here.
pub const MAX_RETRY_COUNT: u32 = 20;

impl RecordUpdate {
    pub fn in_flight(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RecordStatus::InFlight),
            remember_status: true,
            last_attempt_at: Some(at),
            ..Self::default()
        }
    }

    pub fn status(status: RecordStatus) -> Self {
        Self {
            status: Some(status),
            clear_status_before_flight: true,
            ..Self::default()
        }
    }

    pub fn apply(&self, record: &mut FiscalRecord) {
        if self.remember_status {
            record.status_before_flight = Some(record.status);
        }
        if self.clear_status_before_flight {
            record.status_before_flight = None;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(count) = self.retry_count {
            record.retry_count = count.min(MAX_RETRY_COUNT);
        }
        if self.increment_retry {
            record.retry_count = (record.retry_count + 1).min(MAX_RETRY_COUNT);
        }
        if let Some(at) = self.last_attempt_at {
            record.last_attempt_at = Some(TimeStamp(at));
        }
        if let Some(reason) = &self.hold_reason {
            record.hold_reason = reason.clone();
        }
        if let Some(code) = self.last_error_code {
            record.last_error_code = code;
        }
        if let Some(successor) = &self.superseded_by {
            record.superseded_by = Some(successor.clone());
        }
    }
}

pub trait FiscalRecordStore: Send + Sync {
    /// Monotonic, used as the record's insertion order.
    fn next_sequence(&self) -> VerifactuResult<u64>;
    fn insert(&self, record: &FiscalRecord) -> VerifactuResult<()>;
    fn get(&self, record_id: &str) -> VerifactuResult<Option<FiscalRecord>>;
    /// Full overwrite, used when a record is sealed or linked to a successor.
    fn save(&self, record: &FiscalRecord) -> VerifactuResult<()>;
    /// Records of `tenant` in `status` that have no successor, in `order`.
    fn find_eligible(
        &self,
        tenant: &str,
        status: RecordStatus,
        limit: usize,
        order: SelectionOrder,
    ) -> VerifactuResult<Vec<FiscalRecord>>;
    /// Applies `update` to all `ids` as one atomic write.
    fn update(&self, ids: &[String], update: &RecordUpdate) -> VerifactuResult<()>;
    fn list_for_tenant(&self, tenant: &str) -> VerifactuResult<Vec<FiscalRecord>>;
}

pub trait StatusLedgerStore: Send + Sync {
    /// Stores the entry and returns it with its sequence assigned.
    fn append(&self, entry: StatusLedgerEntry) -> VerifactuResult<StatusLedgerEntry>;
    fn last_entry(&self, record_id: &str) -> VerifactuResult<Option<StatusLedgerEntry>>;
    /// Oldest first.
    fn entries_for(&self, record_id: &str) -> VerifactuResult<Vec<StatusLedgerEntry>>;
    /// Oldest first.
    fn entries_for_tenant(&self, tenant: &str) -> VerifactuResult<Vec<StatusLedgerEntry>>;
}

pub trait CredentialStore: Send + Sync {
    /// A missing credential is a configuration error.
    fn load(&self, credential_ref: &str) -> VerifactuResult<CredentialMaterial>;
}

/// Advisory lock shared by every process running a scheduler.
pub trait ClusterLock: Send + Sync {
    /// `true` when `holder` now owns `key`. Expired leases can be taken over.
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> VerifactuResult<bool>;
    fn release(&self, key: &str, holder: &str) -> VerifactuResult<()>;
}

/// Small persisted timestamps: last send per tenant, last daily run.
pub trait MarkerStore: Send + Sync {
    fn get_marker(&self, key: &str) -> VerifactuResult<Option<DateTime<Utc>>>;
    fn set_marker(&self, key: &str, at: DateTime<Utc>) -> VerifactuResult<()>;
}

pub trait TenantDirectory: Send + Sync {
    fn tenants(&self) -> VerifactuResult<Vec<CompanySubmissionConfig>>;
    fn tenant(&self, tenant: &str) -> VerifactuResult<Option<CompanySubmissionConfig>>;
}

pub trait LicenseGate: Send + Sync {
    fn is_licensed(&self, tenant: &str) -> bool;
}

pub struct AlwaysLicensed;

impl LicenseGate for AlwaysLicensed {
    fn is_licensed(&self, _tenant: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::CalendarDate;
    use chrono::TimeZone;

    #[test]
    fn in_flight_update_remembers_prior_status() {
        let mut record =
            FiscalRecord::new("t", "j", "A-1", CalendarDate::from_ymd(2025, 1, 2).unwrap());
        record.status = RecordStatus::Error;
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap();
        RecordUpdate::in_flight(at).apply(&mut record);

        assert_eq!(record.status, RecordStatus::InFlight);
        assert_eq!(record.status_before_flight, Some(RecordStatus::Error));
        assert_eq!(record.last_attempt_at, Some(TimeStamp(at)));

        RecordUpdate::status(RecordStatus::Sent).apply(&mut record);
        assert_eq!(record.status, RecordStatus::Sent);
        assert_eq!(record.status_before_flight, None);
    }

    #[test]
    fn retry_counter_is_clamped() {
        let mut record =
            FiscalRecord::new("t", "j", "A-1", CalendarDate::from_ymd(2025, 1, 2).unwrap());
        record.retry_count = MAX_RETRY_COUNT;
        RecordUpdate {
            increment_retry: true,
            ..RecordUpdate::default()
        }
        .apply(&mut record);
        assert_eq!(record.retry_count, MAX_RETRY_COUNT);
    }
}
