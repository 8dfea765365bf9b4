//! Append-only status history. Every terminal change of a record leaves one
//! entry carrying the digest that was in force at the time.

use crate::builder::ChainTip;
use crate::error::VerifactuResult;
use crate::record::{DocumentReference, FiscalRecord, RecordOperation, RecordStatus};
use crate::store::StatusLedgerStore;
use crate::timestamp::TimeStamp;
use chrono::{DateTime, Utc};
use minicbor::{Decode, Encode};
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq, Encode, Decode, Clone)]
pub struct StatusLedgerEntry {
    #[n(0)]
    pub sequence: u64, // assigned on append
    #[n(1)]
    pub record_id: String,
    #[n(2)]
    pub tenant: String,
    #[n(3)]
    pub journal: String,
    #[n(4)]
    pub operation: RecordOperation,
    #[n(5)]
    pub document: DocumentReference,
    #[n(6)]
    pub status: RecordStatus,
    #[n(7)]
    pub date: TimeStamp<Utc>,
    #[n(8)]
    pub digest_at_time: Option<String>,
    #[n(9)]
    pub previous_digest_at_time: Option<String>,
    #[n(10)]
    pub remote_error_code: Option<u32>,
    #[n(11)]
    pub summary: String,
    #[n(12)]
    pub submitted_envelope: Option<String>,
    #[n(13)]
    pub raw_response: Option<String>,
}

impl StatusLedgerEntry {
    pub fn for_record(
        record: &FiscalRecord,
        status: RecordStatus,
        date: DateTime<Utc>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            record_id: record.record_id.clone(),
            tenant: record.tenant.clone(),
            journal: record.journal.clone(),
            operation: record.operation,
            document: DocumentReference {
                issuer_tax_id: record.issuer_tax_id.clone(),
                number: record.document_number.clone(),
                issue_date: record.issue_date,
            },
            status,
            date: TimeStamp(date),
            digest_at_time: record.current_digest.clone(),
            previous_digest_at_time: record.previous_digest.clone(),
            remote_error_code: None,
            summary: summary.into(),
            submitted_envelope: None,
            raw_response: None,
        }
    }
    pub fn with_remote_code(mut self, code: Option<u32>) -> Self {
        self.remote_error_code = code;
        self
    }
    pub fn with_envelope(mut self, envelope: String) -> Self {
        self.submitted_envelope = Some(envelope);
        self
    }
    pub fn with_response(mut self, raw: String) -> Self {
        self.raw_response = Some(raw);
        self
    }
    pub fn is_submission(&self) -> bool {
        self.status.is_submitted()
    }
}

/// Read side of the ledger plus `append`, over any `StatusLedgerStore`.
#[derive(Clone)]
pub struct StatusLedger {
    store: Arc<dyn StatusLedgerStore>,
}

impl StatusLedger {
    pub fn new(store: Arc<dyn StatusLedgerStore>) -> Self {
        Self { store }
    }

    pub fn append(&self, entry: StatusLedgerEntry) -> VerifactuResult<StatusLedgerEntry> {
        tracing::debug!(
            record = %entry.record_id,
            status = %entry.status,
            code = ?entry.remote_error_code,
            "ledger entry"
        );
        self.store.append(entry)
    }

    pub fn last_entry(&self, record_id: &str) -> VerifactuResult<Option<StatusLedgerEntry>> {
        self.store.last_entry(record_id)
    }

    /// Most recent first.
    pub fn history(&self, record_id: &str) -> VerifactuResult<Vec<StatusLedgerEntry>> {
        let mut entries = self.store.entries_for(record_id)?;
        entries.reverse();
        Ok(entries)
    }

    /// Every entry of `tenant`, oldest first.
    pub fn tenant_entries(&self, tenant: &str) -> VerifactuResult<Vec<StatusLedgerEntry>> {
        self.store.entries_for_tenant(tenant)
    }

    /// Latest entry in which the authority held this record.
    pub fn last_submitted(&self, record_id: &str) -> VerifactuResult<Option<StatusLedgerEntry>> {
        Ok(self
            .history(record_id)?
            .into_iter()
            .find(StatusLedgerEntry::is_submission))
    }

    /// Digest and identity of the last record submitted in a journal.
    pub fn chain_tip(&self, tenant: &str, journal: &str) -> VerifactuResult<Option<ChainTip>> {
        Ok(self
            .store
            .entries_for_tenant(tenant)?
            .into_iter()
            .rev()
            .filter(|e| e.journal == journal && e.is_submission())
            .find_map(|e| {
                e.digest_at_time.map(|digest| ChainTip {
                    digest,
                    document: e.document,
                })
            }))
    }

    /// Transport-level failures recorded for `tenant` at or after `since`.
    pub fn failures_since(&self, tenant: &str, since: DateTime<Utc>) -> VerifactuResult<usize> {
        Ok(self
            .store
            .entries_for_tenant(tenant)?
            .iter()
            .filter(|e| e.status == RecordStatus::Error && e.date.to_datetime_utc() >= since)
            .count())
    }

    /// Whether `digest` was ever accepted for any record of `tenant`.
    pub fn is_submitted_digest(&self, tenant: &str, digest: &str) -> VerifactuResult<bool> {
        Ok(self
            .store
            .entries_for_tenant(tenant)?
            .iter()
            .any(|e| e.is_submission() && e.digest_at_time.as_deref() == Some(digest)))
    }
}
