//! Verification URL printed as a QR code on the invoice. Rendering the image
//! is left to the host.

use crate::config::CompanySubmissionConfig;
use crate::error::{VerifactuError, VerifactuResult};
use crate::profile::RegulatoryMode;
use crate::record::FiscalRecord;
use crate::utils::clean_tax_id;
use reqwest::Url;

const PRODUCTION_BASE: &str = "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/";
const TEST_BASE: &str = "https://prewww2.aeat.es/wlpl/TIKE-CONT/";

/// The test service is chosen whenever the tenant submits to a `prewww` host.
pub fn is_test_endpoint(endpoint_url: &str) -> bool {
    Url::parse(endpoint_url)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.contains("prewww")))
        .unwrap_or(false)
}

pub fn verification_url(config: &CompanySubmissionConfig, record: &FiscalRecord) -> VerifactuResult<String> {
    let issuer = match clean_tax_id(&record.issuer_tax_id) {
        id if id.is_empty() => clean_tax_id(&config.issuer_tax_id),
        id => id,
    };
    if issuer.is_empty() {
        return Err(VerifactuError::Configuration(format!(
            "tenant {} has no issuer tax id for the QR code",
            config.tenant
        )));
    }
    let number = record.document_number.trim();
    if number.is_empty() {
        return Err(crate::error::ValidationError::MissingDocumentNumber.into());
    }

    let base = if is_test_endpoint(&config.endpoint_url) {
        TEST_BASE
    } else {
        PRODUCTION_BASE
    };
    let service = match config.mode {
        RegulatoryMode::Direct => "ValidarQR",
        RegulatoryMode::OnRequest => "ValidarQRNoVerifactu",
    };
    let url = Url::parse_with_params(
        &format!("{base}{service}"),
        &[
            ("nif", issuer.as_str()),
            ("numserie", number),
            ("fecha", record.issue_date.to_wire().as_str()),
            ("importe", record.total.to_wire().as_str()),
        ],
    )
    .map_err(|e| VerifactuError::Configuration(format!("qr url: {e}")))?;
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PRODUCTION_ENDPOINT;
    use crate::record::{Amount, Qualification, TaxLine};
    use crate::timestamp::CalendarDate;

    fn invoice() -> FiscalRecord {
        FiscalRecord::new("acme", "main", "FA 2025/7", CalendarDate::from_ymd(2025, 7, 3).unwrap())
            .set_issuer("B12345678", "Acme SL")
            .add_tax_line(TaxLine::new(Amount::from_cents(10000), 2100, Qualification::S1))
    }

    #[test]
    fn test_endpoint_gives_test_url() {
        let config = CompanySubmissionConfig::new("acme", "Acme SL", "B12345678", "cert");
        let url = verification_url(&config, &invoice()).unwrap();
        assert_eq!(
            url,
            "https://prewww2.aeat.es/wlpl/TIKE-CONT/ValidarQR?nif=B12345678&numserie=FA+2025%2F7&fecha=03-07-2025&importe=121.00"
        );
    }

    #[test]
    fn on_request_production_url() {
        let mut config = CompanySubmissionConfig::new("acme", "Acme SL", "B12345678", "cert");
        config.endpoint_url = PRODUCTION_ENDPOINT.to_string();
        config.mode = RegulatoryMode::OnRequest;
        let url = verification_url(&config, &invoice()).unwrap();
        assert!(url.starts_with(
            "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/ValidarQRNoVerifactu?nif="
        ));
    }
}
