//! Service layer API for the record lifecycle, on-demand submission and audits
use crate::config::CompanySubmissionConfig;
use crate::error::{ValidationError, VerifactuError, VerifactuResult};
use crate::fingerprint::FingerprintEngine;
use crate::host::HostServices;
use crate::ledger::StatusLedgerEntry;
use crate::pipeline::{Disposition, Pacer, RecordPipeline, RecordReport};
use crate::qr;
use crate::record::{FiscalRecord, RecordOperation, RecordStatus};
use crate::scheduler::{RUN_LEASE, RunReport, ScheduleKind, SubmissionScheduler, pace_key, tenant_lock_key};
use crate::store::RecordUpdate;
use crate::utils::new_uuid_to_bech32;
use crate::verify::{
    Anomaly, ChainReport, ChainVerifier, HashCheck, HashVerifier, IntegrityReport, IntegrityVerifier,
};
use tracing::{info, warn};

/// Records per journal checked by `verify_chain` when the caller has no preference.
pub const DEFAULT_CHAIN_DEPTH: usize = 50;

pub struct SubmissionService {
    scheduler: SubmissionScheduler,
}

impl SubmissionService {
    pub fn new(host: HostServices) -> Self {
        Self {
            scheduler: SubmissionScheduler::new(host),
        }
    }

    pub fn host(&self) -> &HostServices {
        self.scheduler.host()
    }

    fn tenant_config(&self, tenant: &str) -> VerifactuResult<CompanySubmissionConfig> {
        self.host()
            .tenants
            .tenant(tenant)?
            .ok_or_else(|| VerifactuError::Configuration(format!("unknown tenant {tenant}")))
    }

    fn load_record(&self, record_id: &str) -> VerifactuResult<FiscalRecord> {
        self.host()
            .records
            .get(record_id)?
            .ok_or_else(|| VerifactuError::NotFound(record_id.to_string()))
    }

    pub fn record(&self, record_id: &str) -> VerifactuResult<Option<FiscalRecord>> {
        self.host().records.get(record_id)
    }

    /// Stores a new pending registration. The issuer falls back to the tenant's.
    pub fn register(&self, record: FiscalRecord) -> VerifactuResult<FiscalRecord> {
        let config = self.tenant_config(&record.tenant)?;
        let mut record = record;
        if record.issuer_tax_id.is_empty() {
            record = record.set_issuer(&config.issuer_tax_id, &config.company_name);
        }
        if record.document_number.trim().is_empty() {
            return Err(ValidationError::MissingDocumentNumber.into());
        }

        // an original document number lives once per tenant unless it was replaced
        if record.supersedes.is_none() {
            let duplicate = self
                .host()
                .records
                .list_for_tenant(&record.tenant)?
                .into_iter()
                .any(|r| {
                    r.operation == RecordOperation::Registration
                        && r.superseded_by.is_none()
                        && r.issuer_tax_id == record.issuer_tax_id
                        && r.document_number == record.document_number
                });
            if duplicate {
                return Err(ValidationError::DuplicateDocument(record.document_number).into());
            }
        }
        self.store_new(record)
    }

    fn store_new(&self, mut record: FiscalRecord) -> VerifactuResult<FiscalRecord> {
        record.record_id = new_uuid_to_bech32("rec")?;
        record.sequence = self.host().records.next_sequence()?;
        record.status = RecordStatus::Pending;
        record.status_before_flight = None;
        record.retry_count = 0;
        record.last_attempt_at = None;
        record.hold_reason = None;
        record.last_error_code = None;
        record.superseded_by = None;
        self.host().records.insert(&record)?;
        info!(
            tenant = %record.tenant,
            record = %record.record_id,
            number = %record.document_number,
            operation = ?record.operation,
            "record registered"
        );
        Ok(record)
    }

    // Links the original to its successor. The new record is stored first so a
    // crash in between leaves an unreferenced pending record, never a dangling link.
    fn supersede(&self, original: &FiscalRecord, successor: FiscalRecord) -> VerifactuResult<FiscalRecord> {
        let successor = self.store_new(successor)?;
        self.host().records.update(
            std::slice::from_ref(&original.record_id),
            &RecordUpdate {
                superseded_by: Some(successor.record_id.clone()),
                ..RecordUpdate::default()
            },
        )?;
        Ok(successor)
    }

    fn replaceable(&self, record_id: &str) -> VerifactuResult<FiscalRecord> {
        let original = self.load_record(record_id)?;
        if original.superseded_by.is_some() || original.status == RecordStatus::InFlight {
            return Err(ValidationError::InvalidState(original.status).into());
        }
        Ok(original)
    }

    /// Replaces `original_id` with `corrected`, which enters the queue as a new pending record.
    pub fn issue_correction(&self, original_id: &str, corrected: FiscalRecord) -> VerifactuResult<FiscalRecord> {
        let original = self.replaceable(original_id)?;
        if original.operation != RecordOperation::Registration {
            return Err(ValidationError::InvalidState(original.status).into());
        }
        let correction = FiscalRecord::correction_of(&original, corrected);
        if correction.document_number.trim().is_empty() {
            return Err(ValidationError::MissingDocumentNumber.into());
        }
        self.supersede(&original, correction)
    }

    /// Queues the cancellation of a registration the authority already answered.
    pub fn request_cancellation(&self, original_id: &str) -> VerifactuResult<FiscalRecord> {
        let original = self.replaceable(original_id)?;
        let cancellable = matches!(
            original.status,
            RecordStatus::Sent | RecordStatus::AcceptedWithErrors | RecordStatus::Rejected
        );
        if !cancellable || original.operation != RecordOperation::Registration {
            return Err(ValidationError::InvalidState(original.status).into());
        }
        self.supersede(&original, FiscalRecord::cancellation_of(&original))
    }

    /// Operator release of a held record, it goes back to `pending`.
    pub fn release_hold(&self, record_id: &str) -> VerifactuResult<FiscalRecord> {
        let record = self.load_record(record_id)?;
        if record.status != RecordStatus::Held {
            return Err(ValidationError::InvalidState(record.status).into());
        }
        let now = self.host().clock.now();
        let reason = record.hold_reason.clone().unwrap_or_default();
        let entry = StatusLedgerEntry::for_record(
            &record,
            RecordStatus::Pending,
            now,
            format!("hold released by operator: {reason}"),
        );
        self.host().ledger.append(entry)?;
        self.host().records.update(
            std::slice::from_ref(&record.record_id),
            &RecordUpdate {
                retry_count: Some(0),
                hold_reason: Some(None),
                ..RecordUpdate::status(RecordStatus::Pending)
            },
        )?;
        info!(record = %record.record_id, "hold released");
        self.load_record(record_id)
    }

    /// Sends one record outside the schedule. A record the authority already
    /// holds is not sent again while its digest is unchanged.
    pub fn submit_now(&self, record_id: &str) -> VerifactuResult<RecordReport> {
        let record = self.load_record(record_id)?;
        let config = self.tenant_config(&record.tenant)?;

        if record.status.is_submitted() {
            return self.resubmission(&record);
        }
        if record.superseded_by.is_some() || !matches!(record.status, RecordStatus::Pending | RecordStatus::Error) {
            return Err(ValidationError::InvalidState(record.status).into());
        }

        let host = self.host();
        let now = host.clock.now();
        let lock_key = tenant_lock_key(&config.tenant);
        if !host.lock.try_acquire(&lock_key, &host.holder, RUN_LEASE, now)? {
            info!(tenant = %config.tenant, "tenant busy, submit_now skipped");
            return Ok(RecordReport {
                record_id: record.record_id.clone(),
                document_number: record.document_number.clone(),
                digest: record.current_digest.clone(),
                disposition: Disposition::Aborted(format!("tenant {} is being processed", config.tenant)),
            });
        }
        let result = self.submit_locked(&config, &record);
        if let Err(err) = host.lock.release(&lock_key, &host.holder) {
            warn!(tenant = %config.tenant, %err, "could not release tenant lock");
        }
        result
    }

    fn submit_locked(&self, config: &CompanySubmissionConfig, record: &FiscalRecord) -> VerifactuResult<RecordReport> {
        let host = self.host();
        let pipeline = RecordPipeline::for_tenant(host, config)?;
        host.records.update(
            std::slice::from_ref(&record.record_id),
            &RecordUpdate::in_flight(host.clock.now()),
        )?;
        let in_flight = self.load_record(&record.record_id)?;
        // on-demand sends follow the periodic spacing
        let pacer = Pacer::new(
            host,
            pace_key(ScheduleKind::Periodic, &config.tenant),
            config.periodic.min_interval(),
        );
        pipeline.process(in_flight, Some(&pacer))
    }

    fn resubmission(&self, record: &FiscalRecord) -> VerifactuResult<RecordReport> {
        let submitted = self
            .host()
            .ledger
            .last_submitted(&record.record_id)?
            .and_then(|e| e.digest_at_time);
        let recomputed = FingerprintEngine::new().digest_for_record(record).ok();
        match submitted {
            Some(digest) if recomputed.as_ref() == Some(&digest) => {
                info!(record = %record.record_id, "already submitted with this digest");
                Ok(RecordReport {
                    record_id: record.record_id.clone(),
                    document_number: record.document_number.clone(),
                    digest: Some(digest),
                    disposition: Disposition::AlreadySubmitted,
                })
            }
            _ => {
                warn!(record = %record.record_id, "submitted record changed, a correction is required");
                Err(VerifactuError::Integrity(format!(
                    "record {} changed after submission, issue a correction instead",
                    record.document_number
                )))
            }
        }
    }

    pub fn cron_tick(&self) -> VerifactuResult<RunReport> {
        self.scheduler.run(ScheduleKind::Periodic)
    }

    pub fn daily_tick(&self) -> VerifactuResult<RunReport> {
        self.scheduler.run(ScheduleKind::Daily)
    }

    pub fn verify_chain(&self, tenant: &str, depth: usize) -> VerifactuResult<Vec<ChainReport>> {
        ChainVerifier::new(self.host()).verify(tenant, depth)
    }

    pub fn verify_hash(&self, record_id: &str) -> VerifactuResult<HashCheck> {
        HashVerifier::new(self.host()).verify(record_id)
    }

    pub fn verify_integrity(&self, record_id: &str) -> VerifactuResult<IntegrityReport> {
        IntegrityVerifier::new(self.host()).verify(record_id)
    }

    pub fn detect_anomalies(&self, tenant: &str) -> VerifactuResult<Vec<Anomaly>> {
        let config = self.tenant_config(tenant)?;
        crate::verify::detect_anomalies(self.host(), &config, self.host().clock.now())
    }

    pub fn qr_url(&self, record_id: &str) -> VerifactuResult<String> {
        let record = self.load_record(record_id)?;
        let config = self.tenant_config(&record.tenant)?;
        qr::verification_url(&config, &record)
    }

    /// Ledger entries of one record, most recent first.
    pub fn history(&self, record_id: &str) -> VerifactuResult<Vec<StatusLedgerEntry>> {
        self.host().ledger.history(record_id)
    }
}
