//! One record through Seal → Build → Sign → Wrap → Send → commit. Each call is
//! its own unit of work: the ledger entry is written first, then the record.

use crate::builder::DocumentBuilder;
use crate::client::{ErrorClass, OutcomeStatus, SubmissionOutcome};
use crate::config::CompanySubmissionConfig;
use crate::envelope::{Envelope, TransportEnvelope};
use crate::error::{ValidationError, VerifactuError, VerifactuResult};
use crate::host::HostServices;
use crate::ledger::StatusLedgerEntry;
use crate::profile::DocumentProfile;
use crate::record::{FiscalRecord, RecordOperation, RecordStatus};
use crate::signature::{SignatureService, SigningCredential};
use crate::store::RecordUpdate;
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// the authority holds the record
    Submitted {
        status: RecordStatus,
        inferred_cancellation: bool,
    },
    Rejected {
        code: Option<u32>,
    },
    /// back to `error`, retried after backoff
    Failed {
        error_class: Option<ErrorClass>,
        code: Option<u32>,
    },
    /// ordering or validation violation, waits for an operator
    Held(String),
    /// an earlier record must go first, returned to its previous state
    Deferred,
    /// local failure before anything was sent, returned to its previous state
    Aborted(String),
    /// digest already accepted, nothing sent
    AlreadySubmitted,
}

impl Disposition {
    /// Whether a request reached the network.
    pub fn was_sent(&self) -> bool {
        matches!(
            self,
            Disposition::Submitted { .. } | Disposition::Rejected { .. } | Disposition::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordReport {
    pub record_id: String,
    pub document_number: String,
    pub digest: Option<String>,
    pub disposition: Disposition,
}

impl RecordReport {
    fn new(record: &FiscalRecord, disposition: Disposition) -> Self {
        Self {
            record_id: record.record_id.clone(),
            document_number: record.document_number.clone(),
            digest: record.current_digest.clone(),
            disposition,
        }
    }
}

/// Keeps consecutive sends of one tenant at least `interval` apart, across
/// runs, using a persisted marker.
pub struct Pacer<'a> {
    host: &'a HostServices,
    key: String,
    interval: chrono::Duration,
}

impl<'a> Pacer<'a> {
    pub fn new(host: &'a HostServices, key: String, interval: chrono::Duration) -> Self {
        Self {
            host,
            key,
            interval,
        }
    }

    pub fn wait(&self) -> VerifactuResult<()> {
        let Some(last) = self.host.markers.get_marker(&self.key)? else {
            return Ok(());
        };
        let ready_at = last + self.interval;
        let now = self.host.clock.now();
        if ready_at > now {
            if let Ok(pause) = (ready_at - now).to_std() {
                debug!(key = %self.key, ?pause, "spacing requests");
                self.host.clock.sleep(pause);
            }
        }
        Ok(())
    }

    pub fn mark_sent(&self) -> VerifactuResult<()> {
        self.host.markers.set_marker(&self.key, self.host.clock.now())
    }
}

enum OrderingCheck {
    Defer { earlier: String },
    Hold(ValidationError),
}

pub struct RecordPipeline<'a> {
    host: &'a HostServices,
    config: &'a CompanySubmissionConfig,
    profile: Box<dyn DocumentProfile>,
    credential: SigningCredential,
    signer: SignatureService,
    zone: Tz,
}

impl<'a> RecordPipeline<'a> {
    /// Checks the license and loads the tenant's signing credential.
    pub fn for_tenant(host: &'a HostServices, config: &'a CompanySubmissionConfig) -> VerifactuResult<Self> {
        if !host.license.is_licensed(&config.tenant) {
            return Err(VerifactuError::Configuration(format!(
                "tenant {} has no valid license",
                config.tenant
            )));
        }
        config.validate()?;
        let material = host.credentials.load(&config.credential_ref)?;
        let credential = SigningCredential::from_material(&material)?;
        Ok(Self {
            host,
            config,
            profile: config.profile(),
            credential,
            signer: SignatureService::new(),
            zone: config.zone(),
        })
    }

    /// `record` must already be marked in flight.
    pub fn process(&self, record: FiscalRecord, pacer: Option<&Pacer>) -> VerifactuResult<RecordReport> {
        match self.check_ordering(&record)? {
            Some(OrderingCheck::Defer { earlier }) => {
                info!(record = %record.record_id, earlier = %earlier, "deferred behind an earlier record");
                self.restore(&record)?;
                return Ok(RecordReport::new(&record, Disposition::Deferred));
            }
            Some(OrderingCheck::Hold(violation)) => return self.hold(&record, violation.to_string()),
            None => {}
        }

        let mut record = record;
        let builder = DocumentBuilder::new(self.profile.as_ref());
        let tip = self.host.ledger.chain_tip(&record.tenant, &record.journal)?;
        match builder.seal(&mut record, tip.as_ref(), self.host.clock.now(), self.zone) {
            Ok(true) => self.host.records.save(&record)?,
            Ok(false) => debug!(record = %record.record_id, "seal still current"),
            Err(violation) => return self.hold(&record, violation.to_string()),
        }

        let document = match builder.build(&record, self.config.mode) {
            Ok(document) => document,
            Err(VerifactuError::Validation(violation)) => {
                return self.hold(&record, violation.to_string());
            }
            Err(err @ VerifactuError::Integrity(_)) => {
                warn!(record = %record.record_id, %err, "integrity alert");
                return self.hold(&record, err.to_string());
            }
            Err(err) => return self.abort(&record, err),
        };
        let envelope = match self
            .signer
            .sign(&document, &self.credential)
            .and_then(|signed| TransportEnvelope::new(self.profile.as_ref()).wrap(&signed, &self.config.sender()))
        {
            Ok(envelope) => envelope,
            Err(err) => return self.abort(&record, err),
        };

        if let Some(pacer) = pacer {
            pacer.wait()?;
        }
        let result = self
            .host
            .client
            .send(&self.config.endpoint(), &envelope, record.operation);
        if let Some(pacer) = pacer {
            pacer.mark_sent()?;
        }

        match result {
            Ok(outcome) => self.commit_outcome(&record, &envelope, outcome),
            Err(err) if err.is_retryable() => self.commit_transport_failure(&record, &envelope, err),
            Err(err) => self.abort(&record, err),
        }
    }

    // Ordering rules only bind original registrations. Corrections and
    // cancellations follow their original wherever it sits in the sequence.
    fn check_ordering(&self, record: &FiscalRecord) -> VerifactuResult<Option<OrderingCheck>> {
        if record.operation != RecordOperation::Registration || record.supersedes.is_some() {
            return Ok(None);
        }
        let peers = self.host.records.list_for_tenant(&record.tenant)?;
        let registrations = || {
            peers
                .iter()
                .filter(|p| p.record_id != record.record_id && p.operation == RecordOperation::Registration)
        };

        if let Some(later) = registrations().find(|p| {
            p.issue_date > record.issue_date
                && matches!(p.status, RecordStatus::Sent | RecordStatus::AcceptedWithErrors)
        }) {
            return Ok(Some(OrderingCheck::Hold(ValidationError::ChronologyViolation {
                record: record.document_number.clone(),
                later: later.document_number.clone(),
            })));
        }

        let earlier_originals = || {
            registrations().filter(|p| {
                p.supersedes.is_none() && p.superseded_by.is_none() && p.issue_date < record.issue_date
            })
        };
        if let Some(broken) = earlier_originals().find(|p| {
            p.journal == record.journal && matches!(p.status, RecordStatus::Rejected | RecordStatus::Held)
        }) {
            return Ok(Some(OrderingCheck::Hold(ValidationError::ChainContinuityViolation {
                record: record.document_number.clone(),
                earlier: broken.document_number.clone(),
                status: broken.status,
            })));
        }
        if let Some(pending) = earlier_originals().find(|p| p.status.is_unsettled()) {
            return Ok(Some(OrderingCheck::Defer {
                earlier: pending.document_number.clone(),
            }));
        }
        Ok(None)
    }

    fn prior_status(record: &FiscalRecord) -> RecordStatus {
        match record.status {
            RecordStatus::InFlight => record.status_before_flight.unwrap_or(RecordStatus::Pending),
            other => other,
        }
    }

    fn restore(&self, record: &FiscalRecord) -> VerifactuResult<()> {
        self.host.records.update(
            std::slice::from_ref(&record.record_id),
            &RecordUpdate::status(Self::prior_status(record)),
        )
    }

    fn abort(&self, record: &FiscalRecord, err: VerifactuError) -> VerifactuResult<RecordReport> {
        error!(record = %record.record_id, %err, "record not submitted");
        self.restore(record)?;
        Ok(RecordReport::new(record, Disposition::Aborted(err.to_string())))
    }

    fn hold(&self, record: &FiscalRecord, reason: String) -> VerifactuResult<RecordReport> {
        warn!(tenant = %record.tenant, record = %record.record_id, %reason, "record held");
        let entry = StatusLedgerEntry::for_record(record, RecordStatus::Held, self.host.clock.now(), reason.clone());
        self.host.ledger.append(entry)?;
        self.host.records.update(
            std::slice::from_ref(&record.record_id),
            &RecordUpdate {
                hold_reason: Some(Some(reason.clone())),
                ..RecordUpdate::status(RecordStatus::Held)
            },
        )?;
        Ok(RecordReport::new(record, Disposition::Held(reason)))
    }

    fn commit_outcome(
        &self,
        record: &FiscalRecord,
        envelope: &Envelope,
        outcome: SubmissionOutcome,
    ) -> VerifactuResult<RecordReport> {
        let (status, disposition) = match outcome.status {
            OutcomeStatus::Sent => (RecordStatus::Sent, None),
            OutcomeStatus::AcceptedWithErrors => (RecordStatus::AcceptedWithErrors, None),
            OutcomeStatus::Canceled => (RecordStatus::Canceled, None),
            OutcomeStatus::Error if outcome.is_rejection() => (
                RecordStatus::Rejected,
                Some(Disposition::Rejected {
                    code: outcome.remote_code,
                }),
            ),
            OutcomeStatus::Error => (
                RecordStatus::Error,
                Some(Disposition::Failed {
                    error_class: outcome.error_class,
                    code: outcome.remote_code,
                }),
            ),
        };

        let rejection = outcome.rejection();
        let mut summary = match &rejection {
            Some(rejection) => rejection.to_string(),
            None => outcome.summary.clone(),
        };
        if outcome.inferred_cancellation {
            warn!(record = %record.record_id, "cancellation accepted without an explicit state");
            summary.push_str(" (cancellation inferred from the operation type)");
        }
        let entry = StatusLedgerEntry::for_record(record, status, self.host.clock.now(), summary)
            .with_remote_code(outcome.remote_code)
            .with_envelope(envelope.as_text())
            .with_response(outcome.raw_payload.clone());
        self.host.ledger.append(entry)?;

        let update = match status {
            RecordStatus::Error => RecordUpdate {
                increment_retry: true,
                last_error_code: Some(outcome.remote_code),
                ..RecordUpdate::status(RecordStatus::Error)
            },
            RecordStatus::Rejected => RecordUpdate {
                last_error_code: Some(outcome.remote_code),
                ..RecordUpdate::status(RecordStatus::Rejected)
            },
            accepted => RecordUpdate {
                retry_count: Some(0),
                hold_reason: Some(None),
                last_error_code: Some(outcome.remote_code),
                ..RecordUpdate::status(accepted)
            },
        };
        self.host
            .records
            .update(std::slice::from_ref(&record.record_id), &update)?;

        match status {
            RecordStatus::Rejected => {
                if let Some(rejection) = &rejection {
                    warn!(record = %record.record_id, %rejection, "rejected")
                }
            }
            RecordStatus::Error => {
                info!(record = %record.record_id, code = ?outcome.remote_code, summary = %outcome.summary, "submission failed")
            }
            _ => info!(record = %record.record_id, %status, "submitted"),
        }

        let disposition = disposition.unwrap_or(Disposition::Submitted {
            status,
            inferred_cancellation: outcome.inferred_cancellation,
        });
        Ok(RecordReport::new(record, disposition))
    }

    fn commit_transport_failure(
        &self,
        record: &FiscalRecord,
        envelope: &Envelope,
        err: VerifactuError,
    ) -> VerifactuResult<RecordReport> {
        warn!(record = %record.record_id, %err, "transport failure");
        let entry = StatusLedgerEntry::for_record(record, RecordStatus::Error, self.host.clock.now(), err.to_string())
            .with_envelope(envelope.as_text());
        self.host.ledger.append(entry)?;
        self.host.records.update(
            std::slice::from_ref(&record.record_id),
            &RecordUpdate {
                increment_retry: true,
                last_error_code: Some(None),
                ..RecordUpdate::status(RecordStatus::Error)
            },
        )?;
        Ok(RecordReport::new(
            record,
            Disposition::Failed {
                error_class: None,
                code: None,
            },
        ))
    }
}
