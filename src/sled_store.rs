//! Embedded persistence for every store capability, one sled tree per concern.
//! Values are CBOR, ids are bech32 uuid7 strings.

use crate::error::{VerifactuError, VerifactuResult};
use crate::ledger::StatusLedgerEntry;
use crate::record::{FiscalRecord, RecordStatus};
use crate::signature::CredentialMaterial;
use crate::store::{
    ClusterLock, CredentialStore, FiscalRecordStore, MarkerStore, RecordUpdate, SelectionOrder,
    StatusLedgerStore,
};
use crate::timestamp::TimeStamp;
use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;
use std::time::Duration;

const RECORDS_TREE: &str = "records";
const LEDGER_TREE: &str = "ledger";
const LEDGER_BY_RECORD_TREE: &str = "ledger_by_record";
const LEDGER_BY_TENANT_TREE: &str = "ledger_by_tenant";
const LOCKS_TREE: &str = "locks";
const MARKERS_TREE: &str = "markers";
const CREDENTIALS_TREE: &str = "credentials";

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
struct Lease {
    #[n(0)]
    holder: String,
    #[n(1)]
    expires_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
    records: sled::Tree,
    ledger: sled::Tree,
    ledger_by_record: sled::Tree,
    ledger_by_tenant: sled::Tree,
    locks: sled::Tree,
    markers: sled::Tree,
    credentials: sled::Tree,
}

// `{prefix}\0{sequence as big endian}` keeps index scans in append order
fn index_key(prefix: &str, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 9);
    key.extend_from_slice(prefix.as_bytes());
    key.push(0);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn index_prefix(prefix: &str) -> Vec<u8> {
    let mut key = prefix.as_bytes().to_vec();
    key.push(0);
    key
}

fn decode_record(bytes: &[u8]) -> anyhow::Result<FiscalRecord> {
    minicbor::decode(bytes).map_err(|e| anyhow!("decoding fiscal record: {e}"))
}

fn decode_entry(bytes: &[u8]) -> anyhow::Result<StatusLedgerEntry> {
    minicbor::decode(bytes).map_err(|e| anyhow!("decoding ledger entry: {e}"))
}

fn transaction_failed(err: TransactionError<String>) -> VerifactuError {
    match err {
        TransactionError::Abort(reason) => VerifactuError::Storage(reason),
        TransactionError::Storage(e) => e.into(),
    }
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> VerifactuResult<Self> {
        let db = sled::open(path.as_ref())
            .with_context(|| format!("opening sled db at {}", path.as_ref().display()))?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> VerifactuResult<Self> {
        Ok(Self {
            records: db.open_tree(RECORDS_TREE)?,
            ledger: db.open_tree(LEDGER_TREE)?,
            ledger_by_record: db.open_tree(LEDGER_BY_RECORD_TREE)?,
            ledger_by_tenant: db.open_tree(LEDGER_BY_TENANT_TREE)?,
            locks: db.open_tree(LOCKS_TREE)?,
            markers: db.open_tree(MARKERS_TREE)?,
            credentials: db.open_tree(CREDENTIALS_TREE)?,
            db,
        })
    }

    pub fn flush(&self) -> VerifactuResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn put_credential(
        &self,
        credential_ref: &str,
        material: &CredentialMaterial,
    ) -> VerifactuResult<()> {
        let bytes = minicbor::to_vec(material).context("encoding credential")?;
        self.credentials.insert(credential_ref.as_bytes(), bytes)?;
        Ok(())
    }

    fn scan_records(&self, tenant: &str) -> anyhow::Result<Vec<FiscalRecord>> {
        let mut found = vec![];
        for item in self.records.iter() {
            let (_, value) = item?;
            let record = decode_record(&value)?;
            if record.tenant == tenant {
                found.push(record);
            }
        }
        Ok(found)
    }

    fn entries_in(&self, index: &sled::Tree, prefix: &str) -> anyhow::Result<Vec<StatusLedgerEntry>> {
        let mut entries = vec![];
        for item in index.scan_prefix(index_prefix(prefix)) {
            let (_, sequence_key) = item?;
            let bytes = self
                .ledger
                .get(&sequence_key)?
                .ok_or_else(|| anyhow!("ledger index points at a missing entry"))?;
            entries.push(decode_entry(&bytes)?);
        }
        Ok(entries)
    }
}

impl FiscalRecordStore for SledStore {
    fn next_sequence(&self) -> VerifactuResult<u64> {
        Ok(self.db.generate_id()?)
    }

    fn insert(&self, record: &FiscalRecord) -> VerifactuResult<()> {
        if record.record_id.is_empty() {
            return Err(VerifactuError::Storage("record has no id".into()));
        }
        let bytes = minicbor::to_vec(record).context("encoding fiscal record")?;
        self.records
            .compare_and_swap(record.record_id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| {
                VerifactuError::Storage(format!("record {} already exists", record.record_id))
            })
    }

    fn get(&self, record_id: &str) -> VerifactuResult<Option<FiscalRecord>> {
        match self.records.get(record_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, record: &FiscalRecord) -> VerifactuResult<()> {
        let bytes = minicbor::to_vec(record).context("encoding fiscal record")?;
        self.records.insert(record.record_id.as_bytes(), bytes)?;
        Ok(())
    }

    fn find_eligible(
        &self,
        tenant: &str,
        status: RecordStatus,
        limit: usize,
        order: SelectionOrder,
    ) -> VerifactuResult<Vec<FiscalRecord>> {
        let mut eligible: Vec<FiscalRecord> = self
            .scan_records(tenant)?
            .into_iter()
            .filter(|r| r.status == status && r.superseded_by.is_none())
            .collect();
        match order {
            SelectionOrder::OldestIssued => {
                eligible.sort_by(|a, b| (a.issue_date, a.sequence).cmp(&(b.issue_date, b.sequence)))
            }
            // `None` sorts first
            SelectionOrder::OldestAttempted => eligible.sort_by_key(|r| {
                (
                    r.last_attempt_at.as_ref().map(TimeStamp::to_datetime_utc),
                    r.issue_date,
                    r.sequence,
                )
            }),
        }
        eligible.truncate(limit);
        Ok(eligible)
    }

    fn update(&self, ids: &[String], update: &RecordUpdate) -> VerifactuResult<()> {
        self.records
            .transaction(|records| {
                for id in ids {
                    let bytes = records.get(id.as_bytes())?.ok_or_else(|| {
                        ConflictableTransactionError::Abort(format!("record {id} not found"))
                    })?;
                    let mut record = decode_record(&bytes)
                        .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
                    update.apply(&mut record);
                    let encoded = minicbor::to_vec(&record)
                        .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
                    records.insert(id.as_bytes(), encoded)?;
                }
                Ok(())
            })
            .map_err(transaction_failed)
    }

    fn list_for_tenant(&self, tenant: &str) -> VerifactuResult<Vec<FiscalRecord>> {
        let mut records = self.scan_records(tenant)?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }
}

impl StatusLedgerStore for SledStore {
    fn append(&self, mut entry: StatusLedgerEntry) -> VerifactuResult<StatusLedgerEntry> {
        entry.sequence = self.db.generate_id()?;
        let sequence_key = entry.sequence.to_be_bytes();
        let bytes = minicbor::to_vec(&entry).context("encoding ledger entry")?;
        let by_record = index_key(&entry.record_id, entry.sequence);
        let by_tenant = index_key(&entry.tenant, entry.sequence);

        (&self.ledger, &self.ledger_by_record, &self.ledger_by_tenant)
            .transaction(|(ledger, record_index, tenant_index)| {
                ledger.insert(&sequence_key[..], bytes.as_slice())?;
                record_index.insert(by_record.as_slice(), &sequence_key[..])?;
                tenant_index.insert(by_tenant.as_slice(), &sequence_key[..])?;
                Ok::<(), ConflictableTransactionError<String>>(())
            })
            .map_err(transaction_failed)?;
        Ok(entry)
    }

    fn last_entry(&self, record_id: &str) -> VerifactuResult<Option<StatusLedgerEntry>> {
        let Some(item) = self
            .ledger_by_record
            .scan_prefix(index_prefix(record_id))
            .next_back()
        else {
            return Ok(None);
        };
        let (_, sequence_key) = item?;
        match self.ledger.get(&sequence_key)? {
            Some(bytes) => Ok(Some(decode_entry(&bytes)?)),
            None => Err(VerifactuError::Storage(format!(
                "ledger index for {record_id} points at a missing entry"
            ))),
        }
    }

    fn entries_for(&self, record_id: &str) -> VerifactuResult<Vec<StatusLedgerEntry>> {
        Ok(self.entries_in(&self.ledger_by_record, record_id)?)
    }

    fn entries_for_tenant(&self, tenant: &str) -> VerifactuResult<Vec<StatusLedgerEntry>> {
        Ok(self.entries_in(&self.ledger_by_tenant, tenant)?)
    }
}

impl CredentialStore for SledStore {
    fn load(&self, credential_ref: &str) -> VerifactuResult<CredentialMaterial> {
        let bytes = self.credentials.get(credential_ref.as_bytes())?.ok_or_else(|| {
            VerifactuError::Configuration(format!("no signing credential named {credential_ref}"))
        })?;
        minicbor::decode(&bytes).map_err(|e| {
            VerifactuError::Configuration(format!("credential {credential_ref} is unreadable: {e}"))
        })
    }
}

impl ClusterLock for SledStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> VerifactuResult<bool> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| VerifactuError::Configuration(format!("lock lease: {e}")))?;
        let claim = Lease {
            holder: holder.to_string(),
            expires_at: TimeStamp(now + lease),
        };
        let claim = minicbor::to_vec(&claim).context("encoding lease")?;

        loop {
            let current = self.locks.get(key.as_bytes())?;
            if let Some(bytes) = &current {
                let held: Lease =
                    minicbor::decode(bytes).map_err(|e| anyhow!("decoding lease: {e}"))?;
                if held.holder != holder && held.expires_at.to_datetime_utc() > now {
                    return Ok(false);
                }
            }
            // lost a race with another holder, look again
            if self
                .locks
                .compare_and_swap(key.as_bytes(), current, Some(claim.as_slice()))?
                .is_ok()
            {
                return Ok(true);
            }
        }
    }

    fn release(&self, key: &str, holder: &str) -> VerifactuResult<()> {
        let Some(bytes) = self.locks.get(key.as_bytes())? else {
            return Ok(());
        };
        let held: Lease = minicbor::decode(&bytes).map_err(|e| anyhow!("decoding lease: {e}"))?;
        if held.holder == holder {
            // a failed swap means someone else took over an expired lease
            let _ = self
                .locks
                .compare_and_swap(key.as_bytes(), Some(bytes), None as Option<&[u8]>)?;
        }
        Ok(())
    }
}

impl MarkerStore for SledStore {
    fn get_marker(&self, key: &str) -> VerifactuResult<Option<DateTime<Utc>>> {
        match self.markers.get(key.as_bytes())? {
            Some(bytes) => {
                let at: TimeStamp<Utc> =
                    minicbor::decode(&bytes).map_err(|e| anyhow!("decoding marker {key}: {e}"))?;
                Ok(Some(at.to_datetime_utc()))
            }
            None => Ok(None),
        }
    }

    fn set_marker(&self, key: &str, at: DateTime<Utc>) -> VerifactuResult<()> {
        let bytes = minicbor::to_vec(TimeStamp(at)).context("encoding marker")?;
        self.markers.insert(key.as_bytes(), bytes)?;
        Ok(())
    }
}
