//! Document profiles: which structural variant a record becomes and the schema
//! vocabulary it is written with. One profile per target schema version.

use crate::record::{FiscalRecord, RecordOperation, RecordStatus};
use crate::utils::sanitize_system_id;
use serde::{Deserialize, Serialize};

pub const NS_SOAP: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const NS_SUM: &str = "https://www2.agenciatributaria.gob.es/static_files/common/internet/dep/aplicaciones/es/aeat/tike/cont/ws/SuministroLR.xsd";
pub const NS_SUM1: &str = "https://www2.agenciatributaria.gob.es/static_files/common/internet/dep/aplicaciones/es/aeat/tike/cont/ws/SuministroInformacion.xsd";
pub const NS_DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";

/// Direct (VeriFactu) reporting or records kept and sent on the authority's request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegulatoryMode {
    #[default]
    Direct,
    OnRequest,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[default]
    #[serde(rename = "1.0")]
    V1_0,
}

/// What the record is relative to anything already sent for the same document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantBasis {
    New,
    AfterAcceptance,
    AfterRejection,
    CancellationRequested,
}

impl VariantBasis {
    pub fn of(record: &FiscalRecord) -> Self {
        if record.operation == RecordOperation::Cancellation {
            return VariantBasis::CancellationRequested;
        }
        match record.supersedes.as_ref().map(|s| s.status) {
            None => VariantBasis::New,
            Some(RecordStatus::Sent | RecordStatus::AcceptedWithErrors) => {
                VariantBasis::AfterAcceptance
            }
            Some(RecordStatus::Rejected | RecordStatus::Canceled) => VariantBasis::AfterRejection,
            // never accepted remotely, the replacement goes out as a first registration
            Some(_) => VariantBasis::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    NewRecord,
    NewRecordOnRequest,
    Correction,
    CorrectionOnRequest,
    CorrectionWithPriorRejection,
    CorrectionOnRequestWithPriorRejection,
    Cancellation,
    CancellationOnRequest,
}

impl Variant {
    pub fn select(basis: VariantBasis, mode: RegulatoryMode) -> Variant {
        use RegulatoryMode::*;
        use VariantBasis::*;
        match (basis, mode) {
            (New, Direct) => Variant::NewRecord,
            (New, OnRequest) => Variant::NewRecordOnRequest,
            (AfterAcceptance, Direct) => Variant::Correction,
            (AfterAcceptance, OnRequest) => Variant::CorrectionOnRequest,
            (AfterRejection, Direct) => Variant::CorrectionWithPriorRejection,
            (AfterRejection, OnRequest) => Variant::CorrectionOnRequestWithPriorRejection,
            (CancellationRequested, Direct) => Variant::Cancellation,
            (CancellationRequested, OnRequest) => Variant::CancellationOnRequest,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Variant::Cancellation | Variant::CancellationOnRequest)
    }

    pub fn is_on_request(&self) -> bool {
        matches!(
            self,
            Variant::NewRecordOnRequest
                | Variant::CorrectionOnRequest
                | Variant::CorrectionOnRequestWithPriorRejection
                | Variant::CancellationOnRequest
        )
    }
}

/// The structural knobs that distinguish variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantLayout {
    pub wrapper: &'static str,
    pub correction_flag: bool,
    pub prior_rejection_flag: bool,
    pub remission_reference_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
    pub envelope: &'static str,
    pub payload: &'static str,
    pub records: &'static str,
    pub payload_prefix: &'static str,
    pub records_prefix: &'static str,
}

/// Identification of the invoicing software, reported inside every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub vendor_name: String,
    pub vendor_tax_id: String,
    pub system_name: String,
    pub system_id: String,
    pub version: String,
    pub installation_number: String,
    pub only_verifactu: bool,
    pub multi_taxpayer: bool,
    pub multiple_taxpayers_indicator: bool,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            vendor_name: String::new(),
            vendor_tax_id: String::new(),
            system_name: "VF-PIPELINE".to_string(),
            system_id: "89".to_string(),
            version: "2.0.6".to_string(),
            installation_number: "1".to_string(),
            only_verifactu: false,
            multi_taxpayer: true,
            multiple_taxpayers_indicator: true,
        }
    }
}

impl SystemInfo {
    pub fn sanitized_id(&self) -> String {
        sanitize_system_id(&self.system_id)
    }
}

pub fn yes_no(flag: bool) -> &'static str {
    if flag { "S" } else { "N" }
}

pub trait DocumentProfile: Send + Sync {
    fn schema_version(&self) -> SchemaVersion;
    fn namespaces(&self) -> &Namespaces;
    fn layout(&self, variant: Variant) -> VariantLayout;
    /// Local names accepted as the root of a signed record.
    fn signed_roots(&self) -> &[&'static str];
    /// Element wrapping one record inside the business payload.
    fn record_container(&self) -> &'static str;
    fn payload_root(&self) -> &'static str;
    fn system_info(&self) -> &SystemInfo;

    fn variant_for(&self, record: &FiscalRecord, mode: RegulatoryMode) -> Variant {
        Variant::select(VariantBasis::of(record), mode)
    }

    fn records_tag(&self, local: &str) -> String {
        format!("{}:{local}", self.namespaces().records_prefix)
    }

    fn payload_tag(&self, local: &str) -> String {
        format!("{}:{local}", self.namespaces().payload_prefix)
    }
}

/// Profile for the 1.0 record schema (`SuministroLR` / `SuministroInformacion`).
#[derive(Debug, Clone)]
pub struct VerifactuV1Profile {
    namespaces: Namespaces,
    system: SystemInfo,
}

impl VerifactuV1Profile {
    pub fn new(system: SystemInfo) -> Self {
        Self {
            namespaces: Namespaces {
                envelope: NS_SOAP,
                payload: NS_SUM,
                records: NS_SUM1,
                payload_prefix: "sum",
                records_prefix: "sum1",
            },
            system,
        }
    }
}

const V1_SIGNED_ROOTS: [&str; 4] = [
    "RegistroAlta",
    "RegistroAnulacion",
    "RegistroResumen",
    "RegistroFactura",
];

impl DocumentProfile for VerifactuV1Profile {
    fn schema_version(&self) -> SchemaVersion {
        SchemaVersion::V1_0
    }
    fn namespaces(&self) -> &Namespaces {
        &self.namespaces
    }
    fn layout(&self, variant: Variant) -> VariantLayout {
        let wrapper = if variant.is_cancellation() {
            "RegistroAnulacion"
        } else {
            "RegistroAlta"
        };
        let correction_flag = matches!(
            variant,
            Variant::Correction
                | Variant::CorrectionOnRequest
                | Variant::CorrectionWithPriorRejection
                | Variant::CorrectionOnRequestWithPriorRejection
        );
        let prior_rejection_flag = matches!(
            variant,
            Variant::CorrectionWithPriorRejection | Variant::CorrectionOnRequestWithPriorRejection
        );
        VariantLayout {
            wrapper,
            correction_flag,
            prior_rejection_flag,
            remission_reference_required: variant.is_on_request(),
        }
    }
    fn signed_roots(&self) -> &[&'static str] {
        &V1_SIGNED_ROOTS
    }
    fn record_container(&self) -> &'static str {
        "RegistroFactura"
    }
    fn payload_root(&self) -> &'static str {
        "RegFactuSistemaFacturacion"
    }
    fn system_info(&self) -> &SystemInfo {
        &self.system
    }
}

/// Profile selection happens once, when a tenant's configuration is loaded.
pub fn profile_for(version: SchemaVersion, system: SystemInfo) -> Box<dyn DocumentProfile> {
    match version {
        SchemaVersion::V1_0 => Box::new(VerifactuV1Profile::new(system)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Supersession;
    use crate::timestamp::CalendarDate;

    fn record_superseding(status: Option<RecordStatus>) -> FiscalRecord {
        let mut record =
            FiscalRecord::new("t", "j", "N-1", CalendarDate::from_ymd(2025, 1, 1).unwrap());
        record.supersedes = status.map(|status| Supersession {
            record_id: "rec1x".into(),
            status,
        });
        record
    }

    #[test]
    fn variant_table() {
        let cases = [
            (None, RegulatoryMode::Direct, Variant::NewRecord),
            (None, RegulatoryMode::OnRequest, Variant::NewRecordOnRequest),
            (Some(RecordStatus::Sent), RegulatoryMode::Direct, Variant::Correction),
            (
                Some(RecordStatus::AcceptedWithErrors),
                RegulatoryMode::OnRequest,
                Variant::CorrectionOnRequest,
            ),
            (
                Some(RecordStatus::Rejected),
                RegulatoryMode::Direct,
                Variant::CorrectionWithPriorRejection,
            ),
            (
                Some(RecordStatus::Canceled),
                RegulatoryMode::OnRequest,
                Variant::CorrectionOnRequestWithPriorRejection,
            ),
            (Some(RecordStatus::Error), RegulatoryMode::Direct, Variant::NewRecord),
        ];
        let profile = VerifactuV1Profile::new(SystemInfo::default());
        for (status, mode, expected) in cases {
            assert_eq!(
                profile.variant_for(&record_superseding(status), mode),
                expected,
                "status {status:?} mode {mode:?}"
            );
        }

        let original = record_superseding(None);
        let cancel = FiscalRecord::cancellation_of(&original);
        assert_eq!(
            profile.variant_for(&cancel, RegulatoryMode::Direct),
            Variant::Cancellation
        );
        assert_eq!(
            profile.variant_for(&cancel, RegulatoryMode::OnRequest),
            Variant::CancellationOnRequest
        );
    }

    #[test]
    fn layouts_differ_only_in_flags() {
        let profile = VerifactuV1Profile::new(SystemInfo::default());
        let new = profile.layout(Variant::NewRecord);
        assert_eq!(new.wrapper, "RegistroAlta");
        assert!(!new.correction_flag && !new.prior_rejection_flag);
        assert!(!new.remission_reference_required);

        let rejected = profile.layout(Variant::CorrectionOnRequestWithPriorRejection);
        assert!(rejected.correction_flag && rejected.prior_rejection_flag);
        assert!(rejected.remission_reference_required);

        let cancel = profile.layout(Variant::Cancellation);
        assert_eq!(cancel.wrapper, "RegistroAnulacion");
        assert!(!cancel.correction_flag);
    }

    #[test]
    fn tags_use_profile_prefixes() {
        let profile = profile_for(SchemaVersion::V1_0, SystemInfo::default());
        assert_eq!(profile.records_tag("Huella"), "sum1:Huella");
        assert_eq!(profile.payload_tag("Cabecera"), "sum:Cabecera");
        assert!(profile.signed_roots().contains(&"RegistroAnulacion"));
    }
}
