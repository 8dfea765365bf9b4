//! Read-only auditors. They report divergence and never repair it.

use crate::builder::DocumentBuilder;
use crate::config::CompanySubmissionConfig;
use crate::error::{VerifactuError, VerifactuResult};
use crate::fingerprint::FingerprintEngine;
use crate::host::HostServices;
use crate::ledger::StatusLedgerEntry;
use crate::record::{FiscalRecord, RecordOperation, RecordStatus};
use crate::xml::XmlNode;
use chrono::{DateTime, Days, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub record_id: String,
    pub document_number: String,
    /// digest the predecessor was submitted with, `None` for a chain start
    pub expected: Option<String>,
    pub found: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub journal: String,
    pub checked: usize,
    pub breaks: Vec<ChainBreak>,
}

impl ChainReport {
    pub fn is_clean(&self) -> bool {
        self.breaks.is_empty()
    }
}

/// Walks submitted records per journal in submission order and checks every
/// record names its predecessor's submitted digest.
pub struct ChainVerifier<'a> {
    host: &'a HostServices,
}

impl<'a> ChainVerifier<'a> {
    pub fn new(host: &'a HostServices) -> Self {
        Self { host }
    }

    /// Checks the `depth` most recent submitted records of each journal.
    pub fn verify(&self, tenant: &str, depth: usize) -> VerifactuResult<Vec<ChainReport>> {
        let records: HashMap<String, FiscalRecord> = self
            .host
            .records
            .list_for_tenant(tenant)?
            .into_iter()
            .map(|r| (r.record_id.clone(), r))
            .collect();

        // first submission of each record, in ledger order, per journal
        let mut chains: BTreeMap<String, Vec<StatusLedgerEntry>> = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for entry in self.host.ledger.tenant_entries(tenant)? {
            if entry.is_submission() && seen.insert(entry.record_id.clone()) {
                chains.entry(entry.journal.clone()).or_default().push(entry);
            }
        }

        let mut reports = vec![];
        for (journal, chain) in chains {
            let start = chain.len().saturating_sub(depth);
            let mut breaks = vec![];
            for position in start..chain.len() {
                let entry = &chain[position];
                let expected = match position {
                    0 => None,
                    _ => self.submitted_digest(&chain[position - 1])?,
                };
                let found = records
                    .get(&entry.record_id)
                    .and_then(|r| r.previous_digest.clone());
                if found != expected {
                    warn!(tenant, journal = %journal, record = %entry.record_id, "chain break");
                    breaks.push(ChainBreak {
                        record_id: entry.record_id.clone(),
                        document_number: entry.document.number.clone(),
                        expected,
                        found,
                    });
                }
            }
            reports.push(ChainReport {
                journal,
                checked: chain.len() - start,
                breaks,
            });
        }
        Ok(reports)
    }

    fn submitted_digest(&self, entry: &StatusLedgerEntry) -> VerifactuResult<Option<String>> {
        Ok(self
            .host
            .ledger
            .last_submitted(&entry.record_id)?
            .and_then(|e| e.digest_at_time))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashStatus {
    Match,
    /// the record no longer produces the digest it was submitted with
    Mismatch,
    NotSubmitted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCheck {
    pub record_id: String,
    pub status: HashStatus,
    pub submitted: Option<String>,
    pub recomputed: Option<String>,
}

pub struct HashVerifier<'a> {
    host: &'a HostServices,
    engine: FingerprintEngine,
}

impl<'a> HashVerifier<'a> {
    pub fn new(host: &'a HostServices) -> Self {
        Self {
            host,
            engine: FingerprintEngine::new(),
        }
    }

    pub fn verify(&self, record_id: &str) -> VerifactuResult<HashCheck> {
        let record = self
            .host
            .records
            .get(record_id)?
            .ok_or_else(|| VerifactuError::NotFound(record_id.to_string()))?;
        self.verify_record(&record)
    }

    pub fn verify_record(&self, record: &FiscalRecord) -> VerifactuResult<HashCheck> {
        let submitted = self
            .host
            .ledger
            .last_submitted(&record.record_id)?
            .and_then(|e| e.digest_at_time);
        // a record that can no longer be digested at all counts as changed
        let recomputed = self.engine.digest_for_record(record).ok();
        let status = match &submitted {
            None => HashStatus::NotSubmitted,
            Some(digest) if recomputed.as_ref() == Some(digest) => HashStatus::Match,
            Some(_) => {
                warn!(record = %record.record_id, "digest differs from the submitted one");
                HashStatus::Mismatch
            }
        };
        Ok(HashCheck {
            record_id: record.record_id.clone(),
            status,
            submitted,
            recomputed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDifference {
    pub path: String,
    pub submitted: Option<String>,
    pub rebuilt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub record_id: String,
    pub differences: Vec<FieldDifference>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.differences.is_empty()
    }
}

/// Rebuilds the document from the record as it stands today and compares it
/// leaf by leaf with what was actually submitted.
pub struct IntegrityVerifier<'a> {
    host: &'a HostServices,
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(host: &'a HostServices) -> Self {
        Self { host }
    }

    pub fn verify(&self, record_id: &str) -> VerifactuResult<IntegrityReport> {
        let record = self
            .host
            .records
            .get(record_id)?
            .ok_or_else(|| VerifactuError::NotFound(record_id.to_string()))?;
        let config = self.host.tenants.tenant(&record.tenant)?.ok_or_else(|| {
            VerifactuError::Configuration(format!("no configuration for tenant {}", record.tenant))
        })?;
        let envelope = self
            .host
            .ledger
            .last_submitted(record_id)?
            .and_then(|e| e.submitted_envelope)
            .ok_or_else(|| {
                VerifactuError::NotFound(format!("no submitted document for {record_id}"))
            })?;

        // re-digest so the builder accepts a record edited after submission
        let mut current = record.clone();
        current.current_digest = Some(FingerprintEngine::new().digest_for_record(&current)?);
        let profile = config.profile();
        let rebuilt = DocumentBuilder::new(profile.as_ref()).build(&current, config.mode)?;

        let rebuilt_tree = XmlNode::parse(&rebuilt.bytes)?;
        let submitted_tree = XmlNode::parse(envelope.as_bytes())?;
        let submitted_record = submitted_tree.find(rebuilt.root).ok_or_else(|| {
            VerifactuError::MalformedDocument(format!(
                "submitted envelope for {record_id} has no {}",
                rebuilt.root
            ))
        })?;

        let differences = diff_leaves(
            &indexed_leaves(submitted_record),
            &indexed_leaves(&rebuilt_tree),
        );
        if !differences.is_empty() {
            warn!(record = %record_id, fields = differences.len(), "submitted document differs from record");
        }
        Ok(IntegrityReport {
            record_id: record_id.to_string(),
            differences,
        })
    }
}

// repeated paths are told apart by occurrence
fn indexed_leaves(node: &XmlNode) -> BTreeMap<(String, usize), String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    node.leaf_paths(&["Signature"])
        .into_iter()
        .map(|(path, value)| {
            let n = counts.entry(path.clone()).or_default();
            *n += 1;
            ((path, *n), value)
        })
        .collect()
}

fn diff_leaves(
    submitted: &BTreeMap<(String, usize), String>,
    rebuilt: &BTreeMap<(String, usize), String>,
) -> Vec<FieldDifference> {
    let keys: BTreeSet<&(String, usize)> = submitted.keys().chain(rebuilt.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let left = submitted.get(key);
            let right = rebuilt.get(key);
            (left != right).then(|| FieldDifference {
                path: key.0.clone(),
                submitted: left.cloned(),
                rebuilt: right.cloned(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// submitted digest no longer matches the record
    Tampered,
    /// pending while a later-dated record was already accepted
    OutOfOrder,
    /// pending for longer than the tenant allows
    StalePending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub record_id: String,
    pub document_number: String,
    pub kind: AnomalyKind,
    pub message: String,
}

/// Sweeps one tenant for tampering, ordering problems and stuck records.
pub fn detect_anomalies(
    host: &HostServices,
    config: &CompanySubmissionConfig,
    now: DateTime<Utc>,
) -> VerifactuResult<Vec<Anomaly>> {
    let records = host.records.list_for_tenant(&config.tenant)?;
    let hashes = HashVerifier::new(host);
    let today = now.with_timezone(&config.zone()).date_naive();
    let stale_before = (config.anomaly_stale_days > 0)
        .then(|| today.checked_sub_days(Days::new(config.anomaly_stale_days.into())))
        .flatten();

    let mut anomalies = vec![];
    for record in &records {
        if record.status.is_submitted() {
            let check = hashes.verify_record(record)?;
            if check.status == HashStatus::Mismatch {
                anomalies.push(Anomaly {
                    record_id: record.record_id.clone(),
                    document_number: record.document_number.clone(),
                    kind: AnomalyKind::Tampered,
                    message: format!(
                        "submitted digest {} no longer matches the record",
                        check.submitted.unwrap_or_default()
                    ),
                });
            }
            continue;
        }
        if record.status != RecordStatus::Pending {
            continue;
        }
        let later_sent = records.iter().find(|other| {
            other.operation == RecordOperation::Registration
                && other.issue_date > record.issue_date
                && matches!(other.status, RecordStatus::Sent | RecordStatus::AcceptedWithErrors)
        });
        if let Some(later) = later_sent.filter(|_| record.supersedes.is_none()) {
            anomalies.push(Anomaly {
                record_id: record.record_id.clone(),
                document_number: record.document_number.clone(),
                kind: AnomalyKind::OutOfOrder,
                message: format!(
                    "{} ({}) was already accepted with a later date",
                    later.document_number,
                    later.issue_date.to_wire()
                ),
            });
        }
        if stale_before.is_some_and(|limit| record.issue_date.0 <= limit) {
            anomalies.push(Anomaly {
                record_id: record.record_id.clone(),
                document_number: record.document_number.clone(),
                kind: AnomalyKind::StalePending,
                message: format!(
                    "pending for more than {} days (issued {})",
                    config.anomaly_stale_days,
                    record.issue_date.to_wire()
                ),
            });
        }
    }
    Ok(anomalies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::XmlNode;

    #[test]
    fn repeated_leaves_are_compared_by_occurrence() {
        let submitted = XmlNode::parse(b"<R><D><B>1</B></D><D><B>2</B></D><H>X</H></R>").unwrap();
        let rebuilt = XmlNode::parse(b"<R><D><B>1</B></D><D><B>3</B></D><H>X</H><Signature><V>s</V></Signature></R>").unwrap();
        let diff = diff_leaves(&indexed_leaves(&submitted), &indexed_leaves(&rebuilt));
        assert_eq!(
            diff,
            vec![FieldDifference {
                path: "R/D/B".into(),
                submitted: Some("2".into()),
                rebuilt: Some("3".into()),
            }]
        );
    }

    #[test]
    fn missing_leaves_show_on_one_side() {
        let submitted = XmlNode::parse(b"<R><A>1</A><B>2</B></R>").unwrap();
        let rebuilt = XmlNode::parse(b"<R><A>1</A></R>").unwrap();
        let diff = diff_leaves(&indexed_leaves(&submitted), &indexed_leaves(&rebuilt));
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "R/B");
        assert_eq!(diff[0].rebuilt, None);
    }
}
