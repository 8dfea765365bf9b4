//! Identifier helpers: record ids and tax-id normalisation

use bech32::Bech32m;
use uuid7::uuid7;

const EU_PREFIXES: [&str; 27] = [
    "AT", "BE", "BG", "CY", "CZ", "DE", "DK", "EE", "EL", "ES", "FI", "FR", "HR", "HU", "IE", "IT",
    "LT", "LU", "LV", "MT", "NL", "PL", "PT", "RO", "SE", "SI", "SK",
];

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Uppercases a tax id, drops separators and a leading EU country prefix.
pub fn clean_tax_id(raw: &str) -> String {
    let compact: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    match compact.get(..2) {
        Some(prefix) if compact.len() > 2 && EU_PREFIXES.contains(&prefix) => {
            compact[2..].to_string()
        }
        _ => compact,
    }
}

pub fn is_eu_country(code: &str) -> bool {
    let code = code.to_ascii_uppercase();
    // Greece reports as EL in VAT numbers but GR in ISO codes
    code == "GR" || EU_PREFIXES.contains(&code.as_str())
}

/// Structural check of a Spanish tax id (DNI, NIE or entity code). The control
/// character is not validated, the authority does that on receipt.
pub fn is_spanish_tax_id(cleaned: &str) -> bool {
    let bytes = cleaned.as_bytes();
    if bytes.len() != 9 {
        return false;
    }
    let body_digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    let last = bytes[8];

    match bytes[0] {
        b'0'..=b'9' => body_digits(0..8) && last.is_ascii_uppercase(),
        b'X' | b'Y' | b'Z' => body_digits(1..8) && last.is_ascii_uppercase(),
        b'A'..=b'W' => body_digits(1..8) && last.is_ascii_alphanumeric(),
        _ => false,
    }
}

/// Keeps `A-Z`, `0-9` and `-`, at most 50 characters.
pub fn sanitize_system_id(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '-')
        .take(50)
        .collect()
}
