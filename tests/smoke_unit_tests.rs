//! Smoke screen tests for the document path
//!
//! These tests span several modules without the scheduler or a store: a record
//! is sealed, built, signed and wrapped, and each product is checked the way a
//! receiving party would check it. They cover the happy path and the most
//! common refusals.

use chrono::{TimeZone, Utc};
use verifactu_pipeline::{
    builder::{ChainTip, DocumentBuilder},
    config::{CompanySubmissionConfig, TenantRegistry},
    envelope::{SenderIdentity, TransportEnvelope},
    error::{ValidationError, VerifactuError},
    fingerprint::{FingerprintEngine, is_valid_digest},
    profile::{RegulatoryMode, SchemaVersion, SystemInfo, profile_for},
    record::{Amount, DocumentKind, FiscalRecord, Qualification, RecipientId, TaxLine},
    signature::{CredentialMaterial, SignatureService, SigningCredential},
    store::TenantDirectory,
    timestamp::{CalendarDate, DEFAULT_ZONE, local_timestamp},
    xml::XmlNode,
};

fn invoice(number: &str) -> FiscalRecord {
    FiscalRecord::new("acme", "sales", number, CalendarDate::from_ymd(2025, 7, 1).unwrap())
        .set_issuer("B12345678", "Acme SL")
        .set_description("Consulting services")
        .set_recipient("Cliente SA", RecipientId::resolve("A58818501", Some("ES")).unwrap())
        .add_tax_line(TaxLine::new(Amount::from_cents(10_000), 2100, Qualification::S1))
}

fn credential() -> SigningCredential {
    SigningCredential::from_material(&CredentialMaterial {
        subject: "Acme SL".into(),
        secret_key: vec![42u8; 32],
        certificate: b"acme test certificate".to_vec(),
    })
    .unwrap()
}

// TIMESTAMP AND FINGERPRINT
#[cfg(test)]
mod fingerprint_tests {
    use super::*;

    /// The generation timestamp is written in the tenant's local offset
    #[test]
    fn generation_time_uses_local_offset() {
        let at = Utc.with_ymd_and_hms(2025, 7, 10, 8, 0, 0).unwrap();
        assert_eq!(local_timestamp(at, DEFAULT_ZONE).to_wire(), "2025-07-10T10:00:00+02:00");

        let winter = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        assert_eq!(local_timestamp(winter, DEFAULT_ZONE).to_wire(), "2025-01-10T09:00:00+01:00");
    }

    /// Sealing twice against the same tip keeps the first digest
    #[test]
    fn reseal_is_a_no_op_when_current() {
        let profile = profile_for(SchemaVersion::default(), SystemInfo::default());
        let builder = DocumentBuilder::new(profile.as_ref());
        let at = Utc.with_ymd_and_hms(2025, 7, 10, 8, 0, 0).unwrap();

        let mut record = invoice("FA-1");
        assert!(builder.seal(&mut record, None, at, DEFAULT_ZONE).unwrap());
        let digest = record.current_digest.clone().unwrap();
        assert!(is_valid_digest(&digest));
        assert_eq!(digest, digest.to_uppercase());

        let later = at + chrono::Duration::hours(1);
        assert!(!builder.seal(&mut record, None, later, DEFAULT_ZONE).unwrap());
        assert_eq!(record.current_digest.as_deref(), Some(digest.as_str()));

        // a new tip forces a new link and a new digest
        let tip = ChainTip {
            digest: "A".repeat(64),
            document: verifactu_pipeline::record::DocumentReference {
                issuer_tax_id: "B12345678".into(),
                number: "FA-0".into(),
                issue_date: CalendarDate::from_ymd(2025, 6, 30).unwrap(),
            },
        };
        assert!(builder.seal(&mut record, Some(&tip), later, DEFAULT_ZONE).unwrap());
        assert_eq!(record.previous_digest, Some("A".repeat(64)));
        assert_ne!(record.current_digest.as_deref(), Some(digest.as_str()));
        assert_eq!(
            FingerprintEngine::new().digest_for_record(&record).ok(),
            record.current_digest
        );
    }

    /// An unsealed record has nothing to digest
    #[test]
    fn unsealed_record_has_no_digest() {
        assert_eq!(
            FingerprintEngine::new().digest_for_record(&invoice("FA-1")),
            Err(ValidationError::MissingDigest)
        );
    }
}

// SIGNATURE AND ENVELOPE
#[cfg(test)]
mod document_tests {
    use super::*;

    /// A built document can be signed, wrapped and verified with the public key
    #[test]
    fn build_sign_and_wrap() {
        let profile = profile_for(SchemaVersion::default(), SystemInfo::default());
        let builder = DocumentBuilder::new(profile.as_ref());
        let mut record = invoice("FA-1");
        record.record_id = "rec1test".into();
        builder
            .seal(&mut record, None, Utc.with_ymd_and_hms(2025, 7, 10, 8, 0, 0).unwrap(), DEFAULT_ZONE)
            .unwrap();
        let document = builder.build(&record, RegulatoryMode::Direct).unwrap();
        assert_eq!(document.root, "RegistroAlta");
        assert_eq!(Some(&document.digest), record.current_digest.as_ref());

        let credential = credential();
        let service = SignatureService::new();
        let signed = service.sign(&document, &credential).unwrap();
        service.verify(&signed.bytes, &credential.verifying_key()).unwrap();

        // flipping the total after signing breaks the reference digest
        let tampered = String::from_utf8(signed.bytes.clone())
            .unwrap()
            .replace("121.00", "122.00");
        assert!(matches!(
            service.verify(tampered.as_bytes(), &credential.verifying_key()),
            Err(VerifactuError::Integrity(_))
        ));

        let sender = SenderIdentity {
            name: "Acme SL".into(),
            tax_id: "B12345678".into(),
        };
        let envelope = TransportEnvelope::new(profile.as_ref()).wrap(&signed, &sender).unwrap();
        let tree = XmlNode::parse(&envelope.bytes).unwrap();
        assert_eq!(tree.name, "Envelope");
        assert!(tree.find("Cabecera").is_some());
        assert_eq!(tree.find_text("Huella"), record.current_digest.as_deref());
        assert!(tree.find("Signature").is_some());
    }

    /// Invoices that are not simplified need a recipient
    #[test]
    fn normal_invoice_requires_recipient() {
        let profile = profile_for(SchemaVersion::default(), SystemInfo::default());
        let builder = DocumentBuilder::new(profile.as_ref());
        let mut record = invoice("FA-1");
        record.recipient = None;
        builder
            .seal(&mut record, None, Utc.with_ymd_and_hms(2025, 7, 10, 8, 0, 0).unwrap(), DEFAULT_ZONE)
            .unwrap();
        assert!(matches!(
            builder.build(&record, RegulatoryMode::Direct),
            Err(VerifactuError::Validation(ValidationError::MissingRecipient))
        ));

        let mut simplified = record.set_kind(DocumentKind::Simplified);
        builder
            .seal(&mut simplified, None, Utc.with_ymd_and_hms(2025, 7, 10, 8, 0, 0).unwrap(), DEFAULT_ZONE)
            .unwrap();
        assert!(builder.build(&simplified, RegulatoryMode::Direct).is_ok());
    }

    /// Keys other than 32 bytes are refused up front
    #[test]
    fn short_key_is_a_configuration_error() {
        let result = SigningCredential::from_material(&CredentialMaterial {
            subject: "Acme SL".into(),
            secret_key: vec![1u8; 16],
            certificate: b"cert".to_vec(),
        });
        assert!(matches!(result, Err(VerifactuError::Configuration(_))));
    }
}

// CONFIGURATION
#[cfg(test)]
mod config_tests {
    use super::*;

    /// A registry file with defaults filled in for everything left out
    #[test]
    fn registry_from_toml() {
        let registry = TenantRegistry::from_toml_str(
            r#"
[[tenant]]
tenant = "acme"
company_name = "Acme SL"
issuer_tax_id = "B12345678"
credential_ref = "acme-cert"
"#,
        )
        .unwrap();
        let acme = registry.tenant("acme").unwrap().unwrap();
        assert_eq!(acme, CompanySubmissionConfig::new("acme", "Acme SL", "B12345678", "acme-cert"));
        assert_eq!(acme.periodic.batch_size, 5);
        assert_eq!(acme.circuit_breaker.threshold, 5);
        assert!(registry.tenant("beta").unwrap().is_none());
    }

    /// A tenant without a credential reference never loads
    #[test]
    fn registry_refuses_invalid_tenants() {
        let result = TenantRegistry::from_toml_str(
            r#"
[[tenant]]
tenant = "acme"
company_name = "Acme SL"
issuer_tax_id = "B12345678"
credential_ref = ""
"#,
        );
        assert!(matches!(result, Err(VerifactuError::Configuration(_))));
    }
}
