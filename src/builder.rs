//! Canonical record documents.
//!
//! `seal` is the one place a record's chain link and digest are written;
//! `build` turns a sealed record into the exact bytes that get signed.

use crate::error::{ValidationError, VerifactuError, VerifactuResult};
use crate::fingerprint::{DIGEST_TYPE_SHA256, FingerprintEngine, is_valid_digest};
use crate::profile::{DocumentProfile, RegulatoryMode, Variant, VariantLayout, yes_no};
use crate::record::{
    Amount, DocumentReference, FiscalRecord, Qualification, RecipientId, RecordOperation,
    RecordStatus, TaxLine, rate_to_wire,
};
use crate::timestamp::local_timestamp;
use crate::xml::XmlOut;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;

/// Last digest accepted by the authority for a journal, and whose it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub digest: String,
    pub document: DocumentReference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalDocument {
    pub record_id: String,
    pub variant: Variant,
    pub root: &'static str,
    pub bytes: Vec<u8>,
    pub digest: String,
    pub generated_at: String,
    pub remission_reference: Option<String>,
}

/// Per (rate, qualification) totals of a tax breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakdownGroup {
    pub rate_bp: u32,
    pub qualification: Qualification,
    pub regime_key: String,
    pub base: Amount,
    pub quota: Amount,
}

pub fn group_breakdown(lines: &[TaxLine]) -> Result<Vec<BreakdownGroup>, ValidationError> {
    if lines.is_empty() {
        return Err(ValidationError::EmptyTaxBreakdown);
    }
    let mut groups: BTreeMap<(u32, Qualification), BreakdownGroup> = BTreeMap::new();
    for line in lines {
        let key = (line.rate_bp, line.qualification);
        let group = groups.entry(key).or_insert_with(|| BreakdownGroup {
            rate_bp: line.rate_bp,
            qualification: line.qualification,
            regime_key: line.regime_key.clone(),
            base: Amount::default(),
            quota: Amount::default(),
        });
        if group.regime_key != line.regime_key {
            return Err(ValidationError::InconsistentRegimeKey {
                rate_bp: line.rate_bp,
                qualification: line.qualification.code().to_string(),
            });
        }
        group.base = group.base + line.base;
    }

    // quota per group, computed on the grouped base
    Ok(groups
        .into_values()
        .map(|mut group| {
            if group.qualification.carries_quota() {
                group.quota = group.base.apply_rate(group.rate_bp);
            }
            group
        })
        .collect())
}

pub struct DocumentBuilder<'p> {
    engine: FingerprintEngine,
    profile: &'p dyn DocumentProfile,
}

impl<'p> DocumentBuilder<'p> {
    pub fn new(profile: &'p dyn DocumentProfile) -> Self {
        Self {
            engine: FingerprintEngine::new(),
            profile,
        }
    }

    pub fn profile(&self) -> &dyn DocumentProfile {
        self.profile
    }

    /// Stored digest still matches the record, its timestamp and the given tip.
    pub fn is_current(&self, record: &FiscalRecord, tip: Option<&ChainTip>) -> bool {
        if !record.is_sealed() {
            return false;
        }
        let same_tip = record.previous_digest.as_deref() == tip.map(|t| t.digest.as_str());
        same_tip
            && self
                .engine
                .digest_for_record(record)
                .is_ok_and(|digest| Some(&digest) == record.current_digest.as_ref())
    }

    /// Links the record to `tip` and stamps a fresh digest. Returns `false` and
    /// leaves the record untouched when the existing seal is still current.
    pub fn seal(
        &self,
        record: &mut FiscalRecord,
        tip: Option<&ChainTip>,
        now: DateTime<Utc>,
        zone: Tz,
    ) -> Result<bool, ValidationError> {
        if self.is_current(record, tip) {
            return Ok(false);
        }

        let mut sealed = record.clone();
        sealed.previous_digest = tip.map(|t| t.digest.clone());
        sealed.previous_document = tip.map(|t| t.document.clone());
        sealed.digest_computed_at = Some(local_timestamp(now, zone));
        let digest = self.engine.digest_for_record(&sealed)?;
        if sealed.previous_digest.as_deref() == Some(digest.as_str()) {
            return Err(ValidationError::SelfReferencingDigest);
        }
        sealed.current_digest = Some(digest);

        *record = sealed;
        Ok(true)
    }

    /// Deterministic: the same sealed record always yields the same bytes.
    pub fn build(
        &self,
        record: &FiscalRecord,
        mode: RegulatoryMode,
    ) -> VerifactuResult<CanonicalDocument> {
        let variant = self.profile.variant_for(record, mode);
        let layout = self.profile.layout(variant);
        self.check_record(record, &layout)?;

        let digest = record
            .current_digest
            .clone()
            .ok_or(ValidationError::MissingDigest)?;
        let recomputed = self.engine.digest_for_record(record)?;
        if recomputed != digest {
            return Err(VerifactuError::Integrity(format!(
                "record {} changed after its digest was computed",
                record.record_id
            )));
        }
        let generated_at = record
            .digest_computed_at
            .as_ref()
            .ok_or(ValidationError::MissingDigest)?
            .to_wire();

        let mut out = XmlOut::new();
        let root = self.profile.records_tag(layout.wrapper);
        let xmlns = format!("xmlns:{}", self.profile.namespaces().records_prefix);
        out.open_with(&root, &[(xmlns.as_str(), self.profile.namespaces().records)])?;
        out.leaf(&self.tag("IDVersion"), self.version_text())?;

        if variant.is_cancellation() {
            self.write_cancellation_body(&mut out, record)?;
        } else {
            self.write_registration_body(&mut out, record, &layout)?;
        }

        self.write_chain_link(&mut out, record)?;
        self.write_system_info(&mut out, record)?;
        out.leaf(&self.tag("FechaHoraHusoGenRegistro"), &generated_at)?
            .leaf(&self.tag("TipoHuella"), DIGEST_TYPE_SHA256)?
            .leaf(&self.tag("Huella"), &digest)?
            .close(&root)?;

        Ok(CanonicalDocument {
            record_id: record.record_id.clone(),
            variant,
            root: layout.wrapper,
            bytes: out.into_bytes(),
            digest,
            generated_at,
            remission_reference: record.remission_reference.clone(),
        })
    }

    fn tag(&self, local: &str) -> String {
        self.profile.records_tag(local)
    }

    fn version_text(&self) -> &'static str {
        match self.profile.schema_version() {
            crate::profile::SchemaVersion::V1_0 => "1.0",
        }
    }

    fn check_record(&self, record: &FiscalRecord, layout: &VariantLayout) -> VerifactuResult<()> {
        if record.issuer_tax_id.trim().is_empty() {
            return Err(ValidationError::MissingIssuerTaxId.into());
        }
        if record.document_number.trim().is_empty() {
            return Err(ValidationError::MissingDocumentNumber.into());
        }
        if layout.remission_reference_required
            && record
                .remission_reference
                .as_deref()
                .is_none_or(|r| r.trim().is_empty())
        {
            return Err(ValidationError::MissingRemissionReference.into());
        }
        if record.operation == RecordOperation::Cancellation {
            return Ok(());
        }

        if record.issuer_name.trim().is_empty() {
            return Err(ValidationError::MissingIssuerName.into());
        }
        group_breakdown(&record.tax_lines)?;
        match &record.recipient {
            None if !record.is_simplified() => {
                return Err(ValidationError::MissingRecipient.into());
            }
            Some(recipient) => {
                if recipient.name.trim().is_empty() {
                    return Err(ValidationError::IncompleteRecipient("name is empty".into()).into());
                }
                check_recipient_id(&recipient.id)?;
            }
            None => {}
        }
        if record.kind.is_corrective() {
            if record.corrected_reference.is_none() {
                return Err(ValidationError::MissingCorrectedReference.into());
            }
            if record.kind.rectification_method() == Some("S") && record.rectified_amounts.is_none()
            {
                return Err(ValidationError::MissingRectifiedAmounts.into());
            }
        }
        Ok(())
    }

    fn write_registration_body(
        &self,
        out: &mut XmlOut,
        record: &FiscalRecord,
        layout: &VariantLayout,
    ) -> VerifactuResult<()> {
        out.open(&self.tag("IDFactura"))?
            .leaf(&self.tag("IDEmisorFactura"), record.issuer_tax_id.trim())?
            .leaf(&self.tag("NumSerieFactura"), record.document_number.trim())?
            .leaf(&self.tag("FechaExpedicionFactura"), &record.issue_date.to_wire())?
            .close(&self.tag("IDFactura"))?;
        out.leaf(&self.tag("NombreRazonEmisor"), &record.issuer_name)?;
        if layout.correction_flag {
            out.leaf(&self.tag("Subsanacion"), yes_no(true))?;
        }
        if layout.prior_rejection_flag {
            out.leaf(&self.tag("RechazoPrevio"), yes_no(true))?;
        }
        out.leaf(&self.tag("TipoFactura"), record.kind_code())?;
        out.leaf_opt(
            &self.tag("TipoRectificativa"),
            record.kind.rectification_method(),
        )?;

        if let Some(corrected) = &record.corrected_reference {
            out.open(&self.tag("FacturasRectificadas"))?
                .open(&self.tag("IDFacturaRectificada"))?
                .leaf(&self.tag("IDEmisorFactura"), &corrected.issuer_tax_id)?
                .leaf(&self.tag("NumSerieFactura"), &corrected.number)?
                .leaf(&self.tag("FechaExpedicionFactura"), &corrected.issue_date.to_wire())?
                .close(&self.tag("IDFacturaRectificada"))?
                .close(&self.tag("FacturasRectificadas"))?;
        }
        if let Some(amounts) = record.rectified_amounts.filter(|_| record.kind.is_corrective()) {
            out.open(&self.tag("ImporteRectificacion"))?
                .leaf(&self.tag("BaseRectificada"), &amounts.base.to_wire())?
                .leaf(&self.tag("CuotaRectificada"), &amounts.quota.to_wire())?
                .close(&self.tag("ImporteRectificacion"))?;
        }
        if let Some(date) = record.operation_date {
            out.leaf(&self.tag("FechaOperacion"), &date.to_wire())?;
        }
        let description = match record.description.trim() {
            "" => record.document_number.trim(),
            text => text,
        };
        out.leaf(&self.tag("DescripcionOperacion"), description)?;

        match &record.recipient {
            None => {
                out.leaf(&self.tag("FacturaSinIdentifDestinatarioArt61d"), yes_no(true))?;
            }
            Some(recipient) => {
                out.open(&self.tag("Destinatarios"))?
                    .open(&self.tag("IDDestinatario"))?
                    .leaf(&self.tag("NombreRazon"), &recipient.name)?;
                self.write_recipient_id(out, &recipient.id)?;
                out.close(&self.tag("IDDestinatario"))?
                    .close(&self.tag("Destinatarios"))?;
            }
        }

        self.write_breakdown(out, &record.tax_lines)?;
        out.leaf(&self.tag("CuotaTotal"), &record.tax_total.to_wire())?
            .leaf(&self.tag("ImporteTotal"), &record.total.to_wire())?;
        Ok(())
    }

    fn write_cancellation_body(&self, out: &mut XmlOut, record: &FiscalRecord) -> VerifactuResult<()> {
        out.open(&self.tag("IDFactura"))?
            .leaf(&self.tag("IDEmisorFacturaAnulada"), record.issuer_tax_id.trim())?
            .leaf(&self.tag("NumSerieFacturaAnulada"), record.document_number.trim())?
            .leaf(
                &self.tag("FechaExpedicionFacturaAnulada"),
                &record.issue_date.to_wire(),
            )?
            .close(&self.tag("IDFactura"))?;

        match record.supersedes.as_ref().map(|s| s.status) {
            None => {
                out.leaf(&self.tag("SinRegistroPrevio"), yes_no(true))?;
            }
            Some(RecordStatus::Rejected) => {
                out.leaf(&self.tag("RechazoPrevio"), yes_no(true))?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn write_recipient_id(&self, out: &mut XmlOut, id: &RecipientId) -> VerifactuResult<()> {
        match id {
            RecipientId::TaxId(tax_id) => {
                out.leaf(&self.tag("NIF"), tax_id)?;
            }
            RecipientId::Foreign {
                country,
                id_type,
                id,
            } => {
                out.open(&self.tag("IDOtro"))?
                    .leaf(&self.tag("CodigoPais"), country)?
                    .leaf(&self.tag("IDType"), id_type)?
                    .leaf(&self.tag("ID"), id)?
                    .close(&self.tag("IDOtro"))?;
            }
        }
        Ok(())
    }

    fn write_breakdown(&self, out: &mut XmlOut, lines: &[TaxLine]) -> VerifactuResult<()> {
        out.open(&self.tag("Desglose"))?;
        for group in group_breakdown(lines)? {
            out.open(&self.tag("DetalleDesglose"))?
                .leaf(&self.tag("ClaveRegimen"), &group.regime_key)?;
            match group.qualification {
                Qualification::E1 => {
                    out.leaf(&self.tag("OperacionExenta"), group.qualification.code())?;
                }
                q => {
                    out.leaf(&self.tag("CalificacionOperacion"), q.code())?;
                }
            }
            if group.qualification.carries_quota() {
                out.leaf(&self.tag("TipoImpositivo"), &rate_to_wire(group.rate_bp))?;
            }
            out.leaf(
                &self.tag("BaseImponibleOimporteNoSujeto"),
                &group.base.to_wire(),
            )?;
            if group.qualification.carries_quota() {
                out.leaf(&self.tag("CuotaRepercutida"), &group.quota.to_wire())?;
            }
            out.close(&self.tag("DetalleDesglose"))?;
        }
        out.close(&self.tag("Desglose"))?;
        Ok(())
    }

    fn write_chain_link(&self, out: &mut XmlOut, record: &FiscalRecord) -> VerifactuResult<()> {
        out.open(&self.tag("Encadenamiento"))?;
        match record.previous_digest.as_deref().filter(|d| !d.is_empty()) {
            None => {
                out.leaf(&self.tag("PrimerRegistro"), yes_no(true))?;
            }
            Some(previous) => {
                if !is_valid_digest(previous) {
                    return Err(ValidationError::MalformedDigest(previous.to_string()).into());
                }
                let document = record
                    .previous_document
                    .as_ref()
                    .ok_or(ValidationError::IncompleteChainLink)?;
                out.open(&self.tag("RegistroAnterior"))?
                    .leaf(&self.tag("IDEmisorFactura"), &document.issuer_tax_id)?
                    .leaf(&self.tag("NumSerieFactura"), &document.number)?
                    .leaf(&self.tag("FechaExpedicionFactura"), &document.issue_date.to_wire())?
                    .leaf(&self.tag("Huella"), previous)?
                    .close(&self.tag("RegistroAnterior"))?;
            }
        }
        out.close(&self.tag("Encadenamiento"))?;
        Ok(())
    }

    fn write_system_info(&self, out: &mut XmlOut, record: &FiscalRecord) -> VerifactuResult<()> {
        let system = self.profile.system_info();
        // vendor identity defaults to the issuer when the software is self-developed
        let vendor_name = match system.vendor_name.trim() {
            "" => record.issuer_name.as_str(),
            name => name,
        };
        let vendor_tax_id = match system.vendor_tax_id.trim() {
            "" => record.issuer_tax_id.as_str(),
            id => id,
        };
        out.open(&self.tag("SistemaInformatico"))?
            .leaf(&self.tag("NombreRazon"), vendor_name)?
            .leaf(&self.tag("NIF"), vendor_tax_id)?
            .leaf(&self.tag("NombreSistemaInformatico"), &system.system_name)?
            .leaf(&self.tag("IdSistemaInformatico"), &system.sanitized_id())?
            .leaf(&self.tag("Version"), &system.version)?
            .leaf(&self.tag("NumeroInstalacion"), &system.installation_number)?
            .leaf(
                &self.tag("TipoUsoPosibleSoloVerifactu"),
                yes_no(system.only_verifactu),
            )?
            .leaf(&self.tag("TipoUsoPosibleMultiOT"), yes_no(system.multi_taxpayer))?
            .leaf(
                &self.tag("IndicadorMultiplesOT"),
                yes_no(system.multiple_taxpayers_indicator),
            )?
            .close(&self.tag("SistemaInformatico"))?;
        Ok(())
    }
}

fn check_recipient_id(id: &RecipientId) -> Result<(), ValidationError> {
    match id {
        RecipientId::TaxId(tax_id) if tax_id.trim().is_empty() => Err(
            ValidationError::IncompleteRecipient("tax id is empty".into()),
        ),
        RecipientId::Foreign {
            country,
            id_type,
            id,
        } if country.trim().is_empty() || id_type.trim().is_empty() || id.trim().is_empty() => {
            Err(ValidationError::IncompleteRecipient(
                "foreign identification needs country, type and number".into(),
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{SystemInfo, VerifactuV1Profile};
    use crate::record::{CorrectiveCause, DocumentKind, Supersession};
    use crate::timestamp::{CalendarDate, DEFAULT_ZONE};
    use crate::xml::XmlNode;
    use chrono::TimeZone;

    fn profile() -> VerifactuV1Profile {
        VerifactuV1Profile::new(SystemInfo::default())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 15, 0).unwrap()
    }

    fn invoice(number: &str) -> FiscalRecord {
        let mut record =
            FiscalRecord::new("acme", "sales", number, CalendarDate::from_ymd(2025, 3, 10).unwrap())
                .set_issuer("B12345678", "Acme SL")
                .set_recipient("Client SA", RecipientId::TaxId("A87654321".into()))
                .add_tax_line(TaxLine::new(Amount(10_000), 2100, Qualification::S1))
                .add_tax_line(TaxLine::new(Amount(2_000), 2100, Qualification::S1))
                .add_tax_line(TaxLine::new(Amount(500), 0, Qualification::N1));
        record.record_id = format!("rec-{number}");
        record
    }

    fn tip() -> ChainTip {
        ChainTip {
            digest: "A".repeat(64),
            document: DocumentReference {
                issuer_tax_id: "B12345678".into(),
                number: "F-0".into(),
                issue_date: CalendarDate::from_ymd(2025, 3, 9).unwrap(),
            },
        }
    }

    #[test]
    fn first_record_has_marker_and_no_link() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("F-1");
        assert!(builder.seal(&mut record, None, now(), DEFAULT_ZONE).unwrap());
        let doc = builder.build(&record, RegulatoryMode::Direct).unwrap();
        let tree = XmlNode::parse(&doc.bytes).unwrap();

        assert_eq!(tree.name, "RegistroAlta");
        assert_eq!(tree.find_text("PrimerRegistro"), Some("S"));
        assert!(tree.find("RegistroAnterior").is_none());
        assert_eq!(tree.find_text("Huella"), Some(doc.digest.as_str()));
        assert_eq!(
            tree.find_text("FechaHoraHusoGenRegistro"),
            Some("2025-03-10T10:15:00+01:00")
        );
        assert!(record.previous_digest.is_none());
    }

    #[test]
    fn chained_record_names_its_predecessor() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("F-1");
        builder.seal(&mut record, Some(&tip()), now(), DEFAULT_ZONE).unwrap();
        let doc = builder.build(&record, RegulatoryMode::Direct).unwrap();
        let tree = XmlNode::parse(&doc.bytes).unwrap();

        let link = tree.find("RegistroAnterior").unwrap();
        assert_eq!(link.find_text("NumSerieFactura"), Some("F-0"));
        assert_eq!(link.find_text("FechaExpedicionFactura"), Some("09-03-2025"));
        assert_eq!(link.find_text("Huella"), Some("A".repeat(64).as_str()));
        assert!(tree.find("PrimerRegistro").is_none());
    }

    #[test]
    fn breakdown_groups_by_rate_and_qualification() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("F-1");
        builder.seal(&mut record, None, now(), DEFAULT_ZONE).unwrap();
        let doc = builder.build(&record, RegulatoryMode::Direct).unwrap();
        let tree = XmlNode::parse(&doc.bytes).unwrap();

        let mut details = vec![];
        tree.find_all("DetalleDesglose", &mut details);
        assert_eq!(details.len(), 2);
        let subject = details
            .iter()
            .find(|d| d.find_text("CalificacionOperacion") == Some("S1"))
            .unwrap();
        assert_eq!(subject.find_text("BaseImponibleOimporteNoSujeto"), Some("120.00"));
        assert_eq!(subject.find_text("CuotaRepercutida"), Some("25.20"));
        assert_eq!(subject.find_text("TipoImpositivo"), Some("21.00"));
        let not_subject = details
            .iter()
            .find(|d| d.find_text("CalificacionOperacion") == Some("N1"))
            .unwrap();
        assert!(not_subject.find("CuotaRepercutida").is_none());
        assert!(not_subject.find("TipoImpositivo").is_none());
        assert_eq!(tree.find_text("CuotaTotal"), Some("25.20"));
        assert_eq!(tree.find_text("ImporteTotal"), Some("150.20"));
    }

    #[test]
    fn correction_variants_carry_flags() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("F-1");
        record.supersedes = Some(Supersession {
            record_id: "rec-old".into(),
            status: RecordStatus::Rejected,
        });
        builder.seal(&mut record, None, now(), DEFAULT_ZONE).unwrap();
        let doc = builder.build(&record, RegulatoryMode::Direct).unwrap();
        assert_eq!(doc.variant, Variant::CorrectionWithPriorRejection);
        let tree = XmlNode::parse(&doc.bytes).unwrap();
        assert_eq!(tree.find_text("Subsanacion"), Some("S"));
        assert_eq!(tree.find_text("RechazoPrevio"), Some("S"));
    }

    #[test]
    fn on_request_mode_requires_reference() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("F-1");
        builder.seal(&mut record, None, now(), DEFAULT_ZONE).unwrap();
        let err = builder.build(&record, RegulatoryMode::OnRequest).unwrap_err();
        assert!(matches!(
            err,
            VerifactuError::Validation(ValidationError::MissingRemissionReference)
        ));

        let record = record.set_remission_reference("REQ-77");
        let doc = builder.build(&record, RegulatoryMode::OnRequest).unwrap();
        assert_eq!(doc.variant, Variant::NewRecordOnRequest);
        assert_eq!(doc.remission_reference.as_deref(), Some("REQ-77"));
    }

    #[test]
    fn simplified_without_recipient_uses_marker() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("T-1").set_kind(DocumentKind::Simplified);
        record.recipient = None;
        builder.seal(&mut record, None, now(), DEFAULT_ZONE).unwrap();
        let tree = XmlNode::parse(&builder.build(&record, RegulatoryMode::Direct).unwrap().bytes)
            .unwrap();
        assert_eq!(tree.find_text("FacturaSinIdentifDestinatarioArt61d"), Some("S"));
        assert!(tree.find("Destinatarios").is_none());
        assert_eq!(tree.find_text("TipoFactura"), Some("F2"));
    }

    #[test]
    fn incomplete_records_are_rejected() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);

        let mut no_recipient = invoice("F-1");
        no_recipient.recipient = None;
        builder.seal(&mut no_recipient, None, now(), DEFAULT_ZONE).unwrap();
        assert!(matches!(
            builder.build(&no_recipient, RegulatoryMode::Direct),
            Err(VerifactuError::Validation(ValidationError::MissingRecipient))
        ));

        let mut foreign = invoice("F-2").set_recipient(
            "Client Inc",
            RecipientId::Foreign {
                country: "US".into(),
                id_type: "".into(),
                id: "123".into(),
            },
        );
        builder.seal(&mut foreign, None, now(), DEFAULT_ZONE).unwrap();
        assert!(matches!(
            builder.build(&foreign, RegulatoryMode::Direct),
            Err(VerifactuError::Validation(ValidationError::IncompleteRecipient(_)))
        ));

        let mut corrective = invoice("R-1").set_kind(DocumentKind::CorrectiveDifference);
        corrective.corrective_cause = Some(CorrectiveCause::R1);
        builder.seal(&mut corrective, None, now(), DEFAULT_ZONE).unwrap();
        assert!(matches!(
            builder.build(&corrective, RegulatoryMode::Direct),
            Err(VerifactuError::Validation(ValidationError::MissingCorrectedReference))
        ));

        let mut unsealed = invoice("F-3");
        assert!(matches!(
            builder.build(&unsealed, RegulatoryMode::Direct),
            Err(VerifactuError::Validation(ValidationError::MissingDigest))
        ));
        unsealed.tax_lines.clear();
        assert_eq!(
            builder.seal(&mut unsealed, None, now(), DEFAULT_ZONE).map(|_| ()),
            Ok(())
        );
        assert!(matches!(
            builder.build(&unsealed, RegulatoryMode::Direct),
            Err(VerifactuError::Validation(ValidationError::EmptyTaxBreakdown))
        ));
    }

    #[test]
    fn seal_is_stable_until_inputs_change() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("F-1");
        assert!(builder.seal(&mut record, None, now(), DEFAULT_ZONE).unwrap());
        let digest = record.current_digest.clone();

        let later = now() + chrono::Duration::hours(1);
        assert!(!builder.seal(&mut record, None, later, DEFAULT_ZONE).unwrap());
        assert_eq!(record.current_digest, digest);

        // new tip re-chains
        assert!(builder.seal(&mut record, Some(&tip()), later, DEFAULT_ZONE).unwrap());
        assert_ne!(record.current_digest, digest);

        // edited amounts re-seal
        let before = record.current_digest.clone();
        record.total = Amount(1);
        assert!(builder.seal(&mut record, Some(&tip()), later, DEFAULT_ZONE).unwrap());
        assert_ne!(record.current_digest, before);
    }

    #[test]
    fn tampered_record_does_not_build() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("F-1");
        builder.seal(&mut record, None, now(), DEFAULT_ZONE).unwrap();
        record.tax_total = Amount(999);
        assert!(matches!(
            builder.build(&record, RegulatoryMode::Direct),
            Err(VerifactuError::Integrity(_))
        ));
    }

    #[test]
    fn cancellation_document() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut original = invoice("F-1");
        original.status = RecordStatus::Sent;
        let mut cancel = FiscalRecord::cancellation_of(&original);
        cancel.record_id = "rec-cancel".into();
        builder.seal(&mut cancel, Some(&tip()), now(), DEFAULT_ZONE).unwrap();
        let doc = builder.build(&cancel, RegulatoryMode::Direct).unwrap();
        assert_eq!(doc.root, "RegistroAnulacion");
        let tree = XmlNode::parse(&doc.bytes).unwrap();
        assert_eq!(tree.find_text("NumSerieFacturaAnulada"), Some("F-1"));
        assert!(tree.find("RechazoPrevio").is_none());
        assert!(tree.find("Desglose").is_none());
        assert!(tree.find("RegistroAnterior").is_some());
    }

    #[test]
    fn build_is_deterministic() {
        let profile = profile();
        let builder = DocumentBuilder::new(&profile);
        let mut record = invoice("F-1");
        builder.seal(&mut record, None, now(), DEFAULT_ZONE).unwrap();
        let a = builder.build(&record, RegulatoryMode::Direct).unwrap();
        let b = builder.build(&record, RegulatoryMode::Direct).unwrap();
        assert_eq!(a, b);
    }
}
