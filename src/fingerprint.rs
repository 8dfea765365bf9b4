//! Chained record digest ("Huella").
//!
//! The digest input is a fixed, ordered `Label=value` list joined with `&`.
//! Field order and formatting are part of the chain contract: changing either
//! invalidates every digest already accepted by the authority.

use crate::error::ValidationError;
use crate::record::{Amount, FiscalRecord, RecordOperation};
use crate::timestamp::{CalendarDate, format_generation_timestamp};
use chrono::{DateTime, FixedOffset};

/// `TipoHuella` code for SHA-256.
pub const DIGEST_TYPE_SHA256: &str = "01";

/// Fields hashed for a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationDigestInput<'a> {
    pub issuer_tax_id: &'a str,
    pub document_number: &'a str,
    pub issue_date: CalendarDate,
    pub kind_code: &'a str,
    pub tax_total: Amount,
    pub total: Amount,
}

/// Fields hashed for a cancellation, identifying the cancelled document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationDigestInput<'a> {
    pub issuer_tax_id: &'a str,
    pub document_number: &'a str,
    pub issue_date: CalendarDate,
}

impl<'a> RegistrationDigestInput<'a> {
    pub fn from_record(record: &'a FiscalRecord) -> Self {
        Self {
            issuer_tax_id: &record.issuer_tax_id,
            document_number: &record.document_number,
            issue_date: record.issue_date,
            kind_code: record.kind_code(),
            tax_total: record.tax_total,
            total: record.total,
        }
    }
}

impl<'a> CancellationDigestInput<'a> {
    pub fn from_record(record: &'a FiscalRecord) -> Self {
        Self {
            issuer_tax_id: &record.issuer_tax_id,
            document_number: &record.document_number,
            issue_date: record.issue_date,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintEngine;

impl FingerprintEngine {
    pub fn new() -> Self {
        FingerprintEngine
    }

    pub fn registration_input(
        &self,
        input: &RegistrationDigestInput<'_>,
        previous_digest: Option<&str>,
        timestamp: &DateTime<FixedOffset>,
    ) -> Result<String, ValidationError> {
        require_identity(input.issuer_tax_id, input.document_number)?;
        let previous = normalize_previous(previous_digest)?;

        Ok(join_fields(&[
            ("IDEmisorFactura", input.issuer_tax_id.trim()),
            ("NumSerieFactura", input.document_number.trim()),
            ("FechaExpedicionFactura", &input.issue_date.to_wire()),
            ("TipoFactura", input.kind_code),
            ("CuotaTotal", &input.tax_total.to_wire()),
            ("ImporteTotal", &input.total.to_wire()),
            ("Huella", previous),
            (
                "FechaHoraHusoGenRegistro",
                &format_generation_timestamp(timestamp),
            ),
        ]))
    }

    pub fn cancellation_input(
        &self,
        input: &CancellationDigestInput<'_>,
        previous_digest: Option<&str>,
        timestamp: &DateTime<FixedOffset>,
    ) -> Result<String, ValidationError> {
        require_identity(input.issuer_tax_id, input.document_number)?;
        let previous = normalize_previous(previous_digest)?;

        Ok(join_fields(&[
            ("IDEmisorFacturaAnulada", input.issuer_tax_id.trim()),
            ("NumSerieFacturaAnulada", input.document_number.trim()),
            ("FechaExpedicionFacturaAnulada", &input.issue_date.to_wire()),
            ("Huella", previous),
            (
                "FechaHoraHusoGenRegistro",
                &format_generation_timestamp(timestamp),
            ),
        ]))
    }

    /// Upper-case hex SHA-256 of the registration input string.
    pub fn compute_digest(
        &self,
        input: &RegistrationDigestInput<'_>,
        previous_digest: Option<&str>,
        timestamp: &DateTime<FixedOffset>,
    ) -> Result<String, ValidationError> {
        let text = self.registration_input(input, previous_digest, timestamp)?;
        Ok(hash_text(&text))
    }

    pub fn compute_cancellation_digest(
        &self,
        input: &CancellationDigestInput<'_>,
        previous_digest: Option<&str>,
        timestamp: &DateTime<FixedOffset>,
    ) -> Result<String, ValidationError> {
        let text = self.cancellation_input(input, previous_digest, timestamp)?;
        Ok(hash_text(&text))
    }

    /// Digest of a record as it stands, using its stored chain link and
    /// generation timestamp.
    pub fn digest_for_record(&self, record: &FiscalRecord) -> Result<String, ValidationError> {
        let timestamp = record
            .digest_computed_at
            .as_ref()
            .ok_or(ValidationError::MissingDigest)?
            .to_datetime();
        let previous = record.previous_digest.as_deref();

        match record.operation {
            RecordOperation::Registration => self.compute_digest(
                &RegistrationDigestInput::from_record(record),
                previous,
                &timestamp,
            ),
            RecordOperation::Cancellation => self.compute_cancellation_digest(
                &CancellationDigestInput::from_record(record),
                previous,
                &timestamp,
            ),
        }
    }
}

pub fn is_valid_digest(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn require_identity(issuer_tax_id: &str, document_number: &str) -> Result<(), ValidationError> {
    if issuer_tax_id.trim().is_empty() {
        return Err(ValidationError::MissingIssuerTaxId);
    }
    if document_number.trim().is_empty() {
        return Err(ValidationError::MissingDocumentNumber);
    }
    Ok(())
}

// an absent or blank predecessor is the empty token of a first record
fn normalize_previous(previous: Option<&str>) -> Result<&str, ValidationError> {
    match previous.map(str::trim).filter(|p| !p.is_empty()) {
        None => Ok(""),
        Some(p) if is_valid_digest(p) => Ok(p),
        Some(p) => Err(ValidationError::MalformedDigest(p.to_string())),
    }
}

fn join_fields(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(label, value)| format!("{label}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn hash_text(text: &str) -> String {
    sha256::digest(text).to_uppercase()
}
