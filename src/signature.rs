//! Enveloped signatures over canonical record documents.
//!
//! The reference digest covers the exact bytes handed to `sign`; the signature
//! element is spliced in before the root's closing tag, so removing it restores
//! the signed input byte for byte.

use crate::builder::CanonicalDocument;
use crate::error::{VerifactuError, VerifactuResult};
use crate::profile::NS_DSIG;
use crate::xml::{XmlNode, XmlOut, root_name};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use minicbor::{Decode, Encode};

const C14N_EXCLUSIVE: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const SIGNATURE_ED25519: &str = "http://www.w3.org/2021/04/xmldsig-more#eddsa-ed25519";
const TRANSFORM_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// Credential as kept by a `CredentialStore`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CredentialMaterial {
    #[n(0)]
    pub subject: String,
    #[n(1)]
    pub secret_key: Vec<u8>, // 32 byte ed25519 seed
    #[n(2)]
    pub certificate: Vec<u8>, // DER, reported in KeyInfo
}

pub struct SigningCredential {
    subject: String,
    key: SigningKey,
    certificate: Vec<u8>,
}

impl SigningCredential {
    pub fn from_material(material: &CredentialMaterial) -> VerifactuResult<Self> {
        let seed: [u8; 32] = material.secret_key.as_slice().try_into().map_err(|_| {
            VerifactuError::Configuration(format!(
                "signing key for {} must be 32 bytes, got {}",
                material.subject,
                material.secret_key.len()
            ))
        })?;
        if material.certificate.is_empty() {
            return Err(VerifactuError::Configuration(format!(
                "credential {} has no certificate",
                material.subject
            )));
        }
        Ok(Self {
            subject: material.subject.clone(),
            key: SigningKey::from_bytes(&seed),
            certificate: material.certificate.clone(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    pub record_id: String,
    pub root: String,
    pub bytes: Vec<u8>,
    pub digest: String,
    pub remission_reference: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureService;

impl SignatureService {
    pub fn new() -> Self {
        SignatureService
    }

    pub fn sign(
        &self,
        document: &CanonicalDocument,
        credential: &SigningCredential,
    ) -> VerifactuResult<SignedDocument> {
        let bytes = self.sign_bytes(&document.bytes, credential)?;
        Ok(SignedDocument {
            record_id: document.record_id.clone(),
            root: document.root.to_string(),
            bytes,
            digest: document.digest.clone(),
            remission_reference: document.remission_reference.clone(),
        })
    }

    pub fn sign_bytes(&self, input: &[u8], credential: &SigningCredential) -> VerifactuResult<Vec<u8>> {
        let tree = XmlNode::parse(input)?;
        if tree.find("Signature").is_some() {
            return Err(VerifactuError::MalformedDocument(
                "document is already signed".into(),
            ));
        }
        let insert_at = closing_tag_offset(input, &tree.name)?;

        let reference_digest = STANDARD.encode(sha256_bytes(input)?);
        let signed_info = signed_info(&reference_digest)?;
        let signature_value = STANDARD.encode(credential.key.sign(&signed_info).to_bytes());

        let mut out = XmlOut::new();
        out.open_with("ds:Signature", &[("xmlns:ds", NS_DSIG)])?;
        out.raw(&signed_info);
        out.leaf("ds:SignatureValue", &signature_value)?
            .open("ds:KeyInfo")?
            .open("ds:X509Data")?
            .leaf("ds:X509SubjectName", &credential.subject)?
            .leaf("ds:X509Certificate", &STANDARD.encode(&credential.certificate))?
            .close("ds:X509Data")?
            .close("ds:KeyInfo")?
            .close("ds:Signature")?;
        let signature = out.into_bytes();

        let mut signed = Vec::with_capacity(input.len() + signature.len());
        signed.extend_from_slice(&input[..insert_at]);
        signed.extend_from_slice(&signature);
        signed.extend_from_slice(&input[insert_at..]);
        tracing::debug!(root = %tree.name, subject = %credential.subject, "document signed");
        Ok(signed)
    }

    /// Checks the reference digest against the document without its signature
    /// element and the signature value against `SignedInfo`.
    pub fn verify(&self, signed: &[u8], key: &VerifyingKey) -> VerifactuResult<()> {
        let start = find(signed, b"<ds:Signature")
            .ok_or_else(|| VerifactuError::Integrity("document carries no signature".into()))?;
        let end_tag = b"</ds:Signature>";
        let end = find(&signed[start..], end_tag)
            .map(|offset| start + offset + end_tag.len())
            .ok_or_else(|| VerifactuError::MalformedDocument("unterminated signature".into()))?;

        let mut original = signed[..start].to_vec();
        original.extend_from_slice(&signed[end..]);

        let signature_xml = &signed[start..end];
        let node = XmlNode::parse(signature_xml)?;
        let expected_digest = node
            .find_text("DigestValue")
            .ok_or_else(|| VerifactuError::MalformedDocument("signature has no digest".into()))?;
        if STANDARD.encode(sha256_bytes(&original)?) != expected_digest {
            return Err(VerifactuError::Integrity(
                "signed content does not match its reference digest".into(),
            ));
        }

        let info_start = find(signature_xml, b"<ds:SignedInfo")
            .ok_or_else(|| VerifactuError::MalformedDocument("signature has no SignedInfo".into()))?;
        let info_end_tag = b"</ds:SignedInfo>";
        let info_end = find(signature_xml, info_end_tag)
            .map(|offset| offset + info_end_tag.len())
            .ok_or_else(|| VerifactuError::MalformedDocument("unterminated SignedInfo".into()))?;

        let value = node
            .find_text("SignatureValue")
            .ok_or_else(|| VerifactuError::MalformedDocument("signature has no value".into()))?;
        let raw: [u8; 64] = STANDARD
            .decode(value)
            .map_err(|e| VerifactuError::MalformedDocument(e.to_string()))?
            .try_into()
            .map_err(|_| VerifactuError::MalformedDocument("signature must be 64 bytes".into()))?;

        key.verify(
            &signature_xml[info_start..info_end],
            &Signature::from_bytes(&raw),
        )
        .map_err(|e| VerifactuError::Integrity(format!("signature check failed: {e}")))
    }
}

fn signed_info(reference_digest: &str) -> VerifactuResult<Vec<u8>> {
    let mut out = XmlOut::new();
    out.open_with("ds:SignedInfo", &[("xmlns:ds", NS_DSIG)])?
        .empty_with("ds:CanonicalizationMethod", &[("Algorithm", C14N_EXCLUSIVE)])?
        .empty_with("ds:SignatureMethod", &[("Algorithm", SIGNATURE_ED25519)])?
        .open_with("ds:Reference", &[("URI", "")])?
        .open("ds:Transforms")?
        .empty_with("ds:Transform", &[("Algorithm", TRANSFORM_ENVELOPED)])?
        .close("ds:Transforms")?
        .empty_with("ds:DigestMethod", &[("Algorithm", DIGEST_SHA256)])?
        .leaf("ds:DigestValue", reference_digest)?
        .close("ds:Reference")?
        .close("ds:SignedInfo")?;
    Ok(out.into_bytes())
}

fn sha256_bytes(input: &[u8]) -> VerifactuResult<Vec<u8>> {
    hex::decode(sha256::digest(input)).map_err(|e| VerifactuError::MalformedDocument(e.to_string()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// offset of the root's closing tag, which must be the last markup in the input
fn closing_tag_offset(input: &[u8], root: &str) -> VerifactuResult<usize> {
    let end = input
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    let start = input[..end]
        .windows(2)
        .rposition(|w| w == b"</")
        .ok_or_else(|| VerifactuError::MalformedDocument("root element is not closed".into()))?;
    let tag = std::str::from_utf8(&input[start + 2..end.saturating_sub(1)])
        .map_err(|e| VerifactuError::MalformedDocument(e.to_string()))?;
    let local = tag.rsplit(':').next().unwrap_or(tag).trim();
    if local != root || root_name(input)? != root {
        return Err(VerifactuError::MalformedDocument(format!(
            "expected closing tag for {root}, found {tag}"
        )));
    }
    Ok(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> SigningCredential {
        SigningCredential::from_material(&CredentialMaterial {
            subject: "CN=ACME SL".into(),
            secret_key: vec![7u8; 32],
            certificate: b"certificate-der".to_vec(),
        })
        .unwrap()
    }

    const DOC: &[u8] =
        br#"<sum1:RegistroAlta xmlns:sum1="urn:x"><sum1:Huella>AB</sum1:Huella></sum1:RegistroAlta>"#;

    #[test]
    fn signature_is_enveloped_before_closing_tag() {
        let signed = SignatureService::new().sign_bytes(DOC, &credential()).unwrap();
        let text = String::from_utf8(signed).unwrap();
        assert!(text.starts_with(r#"<sum1:RegistroAlta xmlns:sum1="urn:x"><sum1:Huella>AB</sum1:Huella><ds:Signature"#));
        assert!(text.ends_with("</ds:Signature></sum1:RegistroAlta>"));
    }

    #[test]
    fn verify_round_trip_and_tamper_detection() {
        let service = SignatureService::new();
        let credential = credential();
        let signed = service.sign_bytes(DOC, &credential).unwrap();
        service.verify(&signed, &credential.verifying_key()).unwrap();

        let tampered = String::from_utf8(signed.clone())
            .unwrap()
            .replace(">AB<", ">AC<");
        assert!(matches!(
            service.verify(tampered.as_bytes(), &credential.verifying_key()),
            Err(VerifactuError::Integrity(_))
        ));

        let other = SigningCredential::from_material(&CredentialMaterial {
            subject: "CN=OTHER".into(),
            secret_key: vec![9u8; 32],
            certificate: b"x".to_vec(),
        })
        .unwrap();
        assert!(service.verify(&signed, &other.verifying_key()).is_err());
    }

    #[test]
    fn invalid_credentials_are_configuration_errors() {
        let short = CredentialMaterial {
            subject: "CN=ACME".into(),
            secret_key: vec![1u8; 16],
            certificate: b"der".to_vec(),
        };
        assert!(matches!(
            SigningCredential::from_material(&short),
            Err(VerifactuError::Configuration(_))
        ));
        let no_cert = CredentialMaterial {
            certificate: vec![],
            secret_key: vec![1u8; 32],
            ..short
        };
        assert!(matches!(
            SigningCredential::from_material(&no_cert),
            Err(VerifactuError::Configuration(_))
        ));
    }

    #[test]
    fn malformed_input_is_refused() {
        let service = SignatureService::new();
        assert!(matches!(
            service.sign_bytes(b"<a><b></a>", &credential()),
            Err(VerifactuError::MalformedDocument(_))
        ));
        let signed = service.sign_bytes(DOC, &credential()).unwrap();
        assert!(matches!(
            service.sign_bytes(&signed, &credential()),
            Err(VerifactuError::MalformedDocument(_))
        ));
    }
}
