//! SOAP transport envelope around a signed record.

use crate::error::{VerifactuError, VerifactuResult};
use crate::profile::DocumentProfile;
use crate::signature::SignedDocument;
use crate::xml::{XmlOut, root_name};

/// Who the submission is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub name: String,
    pub tax_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub record_id: String,
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl Envelope {
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

pub struct TransportEnvelope<'p> {
    profile: &'p dyn DocumentProfile,
}

impl<'p> TransportEnvelope<'p> {
    pub fn new(profile: &'p dyn DocumentProfile) -> Self {
        Self { profile }
    }

    pub fn wrap(&self, signed: &SignedDocument, sender: &SenderIdentity) -> VerifactuResult<Envelope> {
        let root = root_name(&signed.bytes)?;
        if !self.profile.signed_roots().contains(&root.as_str()) {
            return Err(VerifactuError::MalformedDocument(format!(
                "{root} cannot be submitted as a record"
            )));
        }
        if sender.tax_id.trim().is_empty() || sender.name.trim().is_empty() {
            return Err(VerifactuError::Configuration(
                "sender identity needs a name and a tax id".into(),
            ));
        }

        let ns = self.profile.namespaces();
        let rec = |local: &str| self.profile.records_tag(local);
        let pay = |local: &str| self.profile.payload_tag(local);
        let xmlns_payload = format!("xmlns:{}", ns.payload_prefix);
        let xmlns_records = format!("xmlns:{}", ns.records_prefix);

        let mut out = XmlOut::new();
        out.open_with(
            "soapenv:Envelope",
            &[
                ("xmlns:soapenv", ns.envelope),
                (xmlns_payload.as_str(), ns.payload),
                (xmlns_records.as_str(), ns.records),
            ],
        )?
        .empty_with("soapenv:Header", &[])?
        .open("soapenv:Body")?
        .open(&pay(self.profile.payload_root()))?
        .open(&pay("Cabecera"))?
        .open(&rec("ObligadoEmision"))?
        .leaf(&rec("NombreRazon"), sender.name.trim())?
        .leaf(&rec("NIF"), sender.tax_id.trim())?
        .close(&rec("ObligadoEmision"))?;
        if let Some(reference) = signed.remission_reference.as_deref() {
            out.open(&rec("RemisionRequerimiento"))?
                .leaf(&rec("RefRequerimiento"), reference)?
                .close(&rec("RemisionRequerimiento"))?;
        }
        out.close(&pay("Cabecera"))?;

        // the signed bytes go in untouched
        if root == self.profile.record_container() {
            out.raw(&signed.bytes);
        } else {
            let container = pay(self.profile.record_container());
            out.open(&container)?;
            out.raw(&signed.bytes);
            out.close(&container)?;
        }

        out.close(&pay(self.profile.payload_root()))?
            .close("soapenv:Body")?
            .close("soapenv:Envelope")?;

        Ok(Envelope {
            record_id: signed.record_id.clone(),
            digest: signed.digest.clone(),
            bytes: out.into_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{NS_SUM1, SystemInfo, VerifactuV1Profile};
    use crate::xml::XmlNode;

    fn signed(bytes: &str, reference: Option<&str>) -> SignedDocument {
        SignedDocument {
            record_id: "rec1".into(),
            root: "RegistroAlta".into(),
            bytes: bytes.as_bytes().to_vec(),
            digest: "AB".into(),
            remission_reference: reference.map(str::to_string),
        }
    }

    fn sender() -> SenderIdentity {
        SenderIdentity {
            name: "Acme SL".into(),
            tax_id: "B12345678".into(),
        }
    }

    #[test]
    fn wraps_record_under_payload_root() {
        let profile = VerifactuV1Profile::new(SystemInfo::default());
        let doc = format!(
            r#"<sum1:RegistroAlta xmlns:sum1="{NS_SUM1}"><sum1:Huella>AB</sum1:Huella></sum1:RegistroAlta>"#
        );
        let envelope = TransportEnvelope::new(&profile)
            .wrap(&signed(&doc, None), &sender())
            .unwrap();
        let text = envelope.as_text();
        assert!(text.contains(&doc), "signed bytes must be embedded verbatim");

        let tree = XmlNode::parse(&envelope.bytes).unwrap();
        assert_eq!(tree.name, "Envelope");
        let payload = tree.find("RegFactuSistemaFacturacion").unwrap();
        assert_eq!(payload.find_text("NIF"), Some("B12345678"));
        assert!(payload.find("RemisionRequerimiento").is_none());
        let container = payload.child("RegistroFactura").unwrap();
        assert!(container.child("RegistroAlta").is_some());
    }

    #[test]
    fn remission_reference_goes_in_header() {
        let profile = VerifactuV1Profile::new(SystemInfo::default());
        let doc = r#"<sum1:RegistroAnulacion xmlns:sum1="urn:x"><sum1:Huella>AB</sum1:Huella></sum1:RegistroAnulacion>"#;
        let envelope = TransportEnvelope::new(&profile)
            .wrap(&signed(doc, Some("REQ-1")), &sender())
            .unwrap();
        let tree = XmlNode::parse(&envelope.bytes).unwrap();
        let header = tree.find("Cabecera").unwrap();
        assert_eq!(header.find_text("RefRequerimiento"), Some("REQ-1"));
    }

    #[test]
    fn already_wrapped_records_are_not_wrapped_twice() {
        let profile = VerifactuV1Profile::new(SystemInfo::default());
        let doc = r#"<sum:RegistroFactura xmlns:sum="urn:y"><sum1:RegistroAlta xmlns:sum1="urn:x"/></sum:RegistroFactura>"#;
        let envelope = TransportEnvelope::new(&profile)
            .wrap(&signed(doc, None), &sender())
            .unwrap();
        let tree = XmlNode::parse(&envelope.bytes).unwrap();
        let mut containers = vec![];
        tree.find_all("RegistroFactura", &mut containers);
        assert_eq!(containers.len(), 1);
    }

    #[test]
    fn unknown_roots_are_refused() {
        let profile = VerifactuV1Profile::new(SystemInfo::default());
        let result = TransportEnvelope::new(&profile).wrap(&signed("<Invoice/>", None), &sender());
        assert!(matches!(result, Err(VerifactuError::MalformedDocument(_))));
    }
}
