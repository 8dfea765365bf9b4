//! Fiscal record model: one invoice, correction or cancellation event and its
//! submission lifecycle.

use crate::error::ValidationError;
use crate::timestamp::{CalendarDate, TimeStamp};
use crate::utils::{clean_tax_id, is_eu_country, is_spanish_tax_id};
use chrono::{FixedOffset, Utc};
use minicbor::{Decode, Encode};
use std::fmt;

/// Money in cents.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Encode, Decode)]
pub struct Amount(#[n(0)] pub i64);

impl Amount {
    pub fn from_cents(cents: i64) -> Self {
        Amount(cents)
    }
    pub fn cents(&self) -> i64 {
        self.0
    }
    /// Two decimals, dot separator, leading minus for negatives.
    pub fn to_wire(&self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{sign}{}.{:02}", abs / 100, abs % 100)
    }
    /// Tax quota for a rate in basis points, rounded half away from zero.
    pub fn apply_rate(&self, rate_bp: u32) -> Amount {
        let product = self.0 as i128 * rate_bp as i128;
        let quotient = product / 10_000;
        let remainder = product % 10_000;
        let rounded = if remainder.abs() * 2 >= 10_000 {
            quotient + product.signum()
        } else {
            quotient
        };
        Amount(i64::try_from(rounded).unwrap_or(if rounded < 0 { i64::MIN } else { i64::MAX }))
    }
}

// saturates at the i64 bounds
impl std::ops::Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Rate in basis points rendered with two decimals, `2100` is `21.00`.
pub fn rate_to_wire(rate_bp: u32) -> String {
    format!("{}.{:02}", rate_bp / 100, rate_bp % 100)
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Encode, Decode)]
pub enum DocumentKind {
    #[n(0)]
    Normal,
    #[n(1)]
    Simplified,
    #[n(2)]
    CorrectiveSubstitution,
    #[n(3)]
    CorrectiveDifference,
    #[n(4)]
    Received,
}

/// Legal ground of a corrective document.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Hash, Encode, Decode)]
pub enum CorrectiveCause {
    #[default]
    #[n(0)]
    R1,
    #[n(1)]
    R2,
    #[n(2)]
    R3,
    #[n(3)]
    R4,
    #[n(4)]
    R5, // corrects a simplified document
}

impl CorrectiveCause {
    pub fn code(&self) -> &'static str {
        match self {
            CorrectiveCause::R1 => "R1",
            CorrectiveCause::R2 => "R2",
            CorrectiveCause::R3 => "R3",
            CorrectiveCause::R4 => "R4",
            CorrectiveCause::R5 => "R5",
        }
    }
}

impl DocumentKind {
    pub fn is_corrective(&self) -> bool {
        matches!(
            self,
            DocumentKind::CorrectiveSubstitution | DocumentKind::CorrectiveDifference
        )
    }
    /// `S` substitution, `I` differences.
    pub fn rectification_method(&self) -> Option<&'static str> {
        match self {
            DocumentKind::CorrectiveSubstitution => Some("S"),
            DocumentKind::CorrectiveDifference => Some("I"),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Encode, Decode)]
pub enum Qualification {
    #[n(0)]
    S1, // subject, not exempt
    #[n(1)]
    S2, // subject, reverse charge
    #[n(2)]
    N1, // not subject, article 7 and 14
    #[n(3)]
    N2, // not subject, location rules
    #[n(4)]
    E1, // exempt, article 20
}

impl Qualification {
    pub fn code(&self) -> &'static str {
        match self {
            Qualification::S1 => "S1",
            Qualification::S2 => "S2",
            Qualification::N1 => "N1",
            Qualification::N2 => "N2",
            Qualification::E1 => "E1",
        }
    }
    pub fn carries_quota(&self) -> bool {
        matches!(self, Qualification::S1 | Qualification::S2)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Encode, Decode)]
pub struct TaxLine {
    #[n(0)]
    pub base: Amount,
    #[n(1)]
    pub rate_bp: u32,
    #[n(2)]
    pub qualification: Qualification,
    #[n(3)]
    pub regime_key: String, // "01" general regime
}

impl TaxLine {
    pub fn new(base: Amount, rate_bp: u32, qualification: Qualification) -> Self {
        Self {
            base,
            rate_bp,
            qualification,
            regime_key: "01".to_string(),
        }
    }
    pub fn with_regime_key(mut self, key: &str) -> Self {
        self.regime_key = key.to_string();
        self
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Encode, Decode)]
pub enum RecipientId {
    #[n(0)]
    TaxId(#[n(0)] String),
    #[n(1)]
    Foreign {
        #[n(0)]
        country: String,
        #[n(1)]
        id_type: String, // 02 EU VAT, 04 foreign official document, 06 other
        #[n(2)]
        id: String,
    },
}

impl RecipientId {
    /// Chooses between a domestic tax id and a foreign identification from a
    /// raw VAT number and an ISO country code.
    pub fn resolve(vat: &str, country: Option<&str>) -> Result<RecipientId, ValidationError> {
        let raw = vat.trim();
        if raw.is_empty() {
            return Err(ValidationError::IncompleteRecipient(
                "identification number is empty".into(),
            ));
        }
        let prefix_country = raw
            .get(..2)
            .filter(|p| p.chars().all(|c| c.is_ascii_alphabetic()))
            .map(str::to_ascii_uppercase);
        let country = country
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .or(prefix_country.filter(|p| is_eu_country(p)))
            .ok_or_else(|| {
                ValidationError::IncompleteRecipient(format!("no country for {raw}"))
            })?;

        let cleaned = clean_tax_id(raw);
        if country == "ES" {
            if is_spanish_tax_id(&cleaned) {
                return Ok(RecipientId::TaxId(cleaned));
            }
            return Ok(RecipientId::Foreign {
                country,
                id_type: "06".into(),
                id: cleaned,
            });
        }
        let id_type = if is_eu_country(&country) { "02" } else { "04" };
        Ok(RecipientId::Foreign {
            country,
            id_type: id_type.into(),
            id: raw.to_string(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Encode, Decode)]
pub struct Recipient {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub id: RecipientId,
}

/// Identification of another document, used by corrective documents.
#[derive(Debug, PartialEq, Eq, Clone, Encode, Decode)]
pub struct DocumentReference {
    #[n(0)]
    pub issuer_tax_id: String,
    #[n(1)]
    pub number: String,
    #[n(2)]
    pub issue_date: CalendarDate,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Encode, Decode)]
pub struct RectifiedAmounts {
    #[n(0)]
    pub base: Amount,
    #[n(1)]
    pub quota: Amount,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Encode, Decode)]
pub enum RecordStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    InFlight,
    #[n(2)]
    Sent,
    #[n(3)]
    AcceptedWithErrors,
    #[n(4)]
    Canceled,
    #[n(5)]
    Rejected,
    #[n(6)]
    Error,
    #[n(7)]
    Held, // waits for an operator after an ordering violation
}

impl RecordStatus {
    /// The authority holds this record, its digest is part of the chain.
    pub fn is_submitted(&self) -> bool {
        matches!(
            self,
            RecordStatus::Sent | RecordStatus::AcceptedWithErrors | RecordStatus::Canceled
        )
    }
    /// Still on its way to the authority without operator action.
    pub fn is_unsettled(&self) -> bool {
        matches!(
            self,
            RecordStatus::Pending | RecordStatus::InFlight | RecordStatus::Error
        )
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::InFlight => "in_flight",
            RecordStatus::Sent => "sent",
            RecordStatus::AcceptedWithErrors => "accepted_with_errors",
            RecordStatus::Canceled => "canceled",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Error => "error",
            RecordStatus::Held => "held",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Encode, Decode)]
pub enum RecordOperation {
    #[n(0)]
    Registration,
    #[n(1)]
    Cancellation,
}

/// Link from a correction or cancellation to the record it replaces, with the
/// replaced record's status at the time.
#[derive(Debug, PartialEq, Eq, Clone, Encode, Decode)]
pub struct Supersession {
    #[n(0)]
    pub record_id: String,
    #[n(1)]
    pub status: RecordStatus,
}

#[derive(Debug, PartialEq, Eq, Clone, Encode, Decode)]
pub struct FiscalRecord {
    #[n(0)]
    pub record_id: String, // uuid7, bech32 encoded
    #[n(1)]
    pub tenant: String,
    #[n(2)]
    pub journal: String,
    #[n(3)]
    pub sequence: u64, // insertion order assigned by the store
    #[n(4)]
    pub operation: RecordOperation,
    #[n(5)]
    pub issuer_tax_id: String,
    #[n(6)]
    pub issuer_name: String,
    #[n(7)]
    pub document_number: String,
    #[n(8)]
    pub issue_date: CalendarDate,
    #[n(9)]
    pub kind: DocumentKind,
    #[n(10)]
    pub corrective_cause: Option<CorrectiveCause>,
    #[n(11)]
    pub corrected_reference: Option<DocumentReference>,
    #[n(12)]
    pub rectified_amounts: Option<RectifiedAmounts>,
    #[n(13)]
    pub total: Amount,
    #[n(14)]
    pub tax_total: Amount,
    #[n(15)]
    pub tax_lines: Vec<TaxLine>,
    #[n(16)]
    pub operation_date: Option<CalendarDate>,
    #[n(17)]
    pub recipient: Option<Recipient>,
    #[n(18)]
    pub description: String,
    #[n(19)]
    pub remission_reference: Option<String>, // on-request mode only
    #[n(20)]
    pub supersedes: Option<Supersession>,
    #[n(21)]
    pub superseded_by: Option<String>,
    #[n(22)]
    pub status: RecordStatus,
    #[n(23)]
    pub status_before_flight: Option<RecordStatus>,
    #[n(24)]
    pub retry_count: u32,
    #[n(25)]
    pub last_attempt_at: Option<TimeStamp<Utc>>,
    #[n(26)]
    pub current_digest: Option<String>,
    #[n(27)]
    pub previous_digest: Option<String>,
    #[n(28)]
    pub digest_computed_at: Option<TimeStamp<FixedOffset>>,
    #[n(29)]
    pub hold_reason: Option<String>,
    #[n(30)]
    pub last_error_code: Option<u32>,
    #[n(31)]
    pub previous_document: Option<DocumentReference>, // predecessor named in the chain link
}

impl FiscalRecord {
    /// Construct a pending registration, the basis for a draft
    pub fn new(tenant: &str, journal: &str, document_number: &str, issue_date: CalendarDate) -> Self {
        Self {
            record_id: String::new(),
            tenant: tenant.to_string(),
            journal: journal.to_string(),
            sequence: 0,
            operation: RecordOperation::Registration,
            issuer_tax_id: String::new(),
            issuer_name: String::new(),
            document_number: document_number.to_string(),
            issue_date,
            kind: DocumentKind::Normal,
            corrective_cause: None,
            corrected_reference: None,
            rectified_amounts: None,
            total: Amount::default(),
            tax_total: Amount::default(),
            tax_lines: vec![],
            operation_date: None,
            recipient: None,
            description: String::new(),
            remission_reference: None,
            supersedes: None,
            superseded_by: None,
            status: RecordStatus::Pending,
            status_before_flight: None,
            retry_count: 0,
            last_attempt_at: None,
            current_digest: None,
            previous_digest: None,
            digest_computed_at: None,
            hold_reason: None,
            last_error_code: None,
            previous_document: None,
        }
    }
    pub fn set_issuer(mut self, tax_id: &str, name: &str) -> Self {
        self.issuer_tax_id = clean_tax_id(tax_id);
        self.issuer_name = name.trim().to_string();
        self
    }
    pub fn set_kind(mut self, kind: DocumentKind) -> Self {
        self.kind = kind;
        self
    }
    pub fn set_corrective(
        mut self,
        kind: DocumentKind,
        cause: CorrectiveCause,
        corrected: DocumentReference,
    ) -> Self {
        self.kind = kind;
        self.corrective_cause = Some(cause);
        self.corrected_reference = Some(corrected);
        self
    }
    pub fn set_rectified_amounts(mut self, base: Amount, quota: Amount) -> Self {
        self.rectified_amounts = Some(RectifiedAmounts { base, quota });
        self
    }
    /// Adds a line and keeps both totals in step with the breakdown.
    pub fn add_tax_line(mut self, line: TaxLine) -> Self {
        let quota = if line.qualification.carries_quota() {
            line.base.apply_rate(line.rate_bp)
        } else {
            Amount::default()
        };
        self.tax_total = self.tax_total + quota;
        self.total = self.total + line.base + quota;
        self.tax_lines.push(line);
        self
    }
    pub fn set_totals(mut self, total: Amount, tax_total: Amount) -> Self {
        self.total = total;
        self.tax_total = tax_total;
        self
    }
    pub fn set_recipient(mut self, name: &str, id: RecipientId) -> Self {
        self.recipient = Some(Recipient {
            name: name.trim().to_string(),
            id,
        });
        self
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
    pub fn set_operation_date(mut self, date: CalendarDate) -> Self {
        self.operation_date = Some(date);
        self
    }
    pub fn set_remission_reference(mut self, reference: &str) -> Self {
        self.remission_reference = Some(reference.to_string());
        self
    }

    /// `F1`, `F2`, `R1`..`R5` or `F5`.
    pub fn kind_code(&self) -> &'static str {
        match self.kind {
            DocumentKind::Normal => "F1",
            DocumentKind::Simplified => "F2",
            DocumentKind::Received => "F5",
            DocumentKind::CorrectiveSubstitution | DocumentKind::CorrectiveDifference => {
                self.corrective_cause.unwrap_or_default().code()
            }
        }
    }
    pub fn is_simplified(&self) -> bool {
        self.kind == DocumentKind::Simplified
            || (self.kind.is_corrective() && self.corrective_cause == Some(CorrectiveCause::R5))
    }
    pub fn is_sealed(&self) -> bool {
        self.current_digest.is_some() && self.digest_computed_at.is_some()
    }

    /// A cancellation of `original`, identifying the cancelled document.
    pub fn cancellation_of(original: &FiscalRecord) -> Self {
        let mut cancel = FiscalRecord::new(
            &original.tenant,
            &original.journal,
            &original.document_number,
            original.issue_date,
        );
        cancel.operation = RecordOperation::Cancellation;
        cancel.issuer_tax_id = original.issuer_tax_id.clone();
        cancel.issuer_name = original.issuer_name.clone();
        cancel.kind = original.kind;
        cancel.corrective_cause = original.corrective_cause;
        cancel.remission_reference = original.remission_reference.clone();
        cancel.supersedes = Some(Supersession {
            record_id: original.record_id.clone(),
            status: original.status,
        });
        cancel
    }

    /// Turns `corrected` into the replacement of `original`.
    pub fn correction_of(original: &FiscalRecord, mut corrected: FiscalRecord) -> Self {
        corrected.tenant = original.tenant.clone();
        corrected.journal = original.journal.clone();
        corrected.operation = RecordOperation::Registration;
        corrected.status = RecordStatus::Pending;
        corrected.retry_count = 0;
        corrected.current_digest = None;
        corrected.previous_digest = None;
        corrected.digest_computed_at = None;
        corrected.previous_document = None;
        corrected.supersedes = Some(Supersession {
            record_id: original.record_id.clone(),
            status: original.status,
        });
        corrected
    }
}
