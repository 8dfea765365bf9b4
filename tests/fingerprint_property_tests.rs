//! Property-based tests for digests, amounts and retry timing
//!
//! The digest feeds the hash chain the authority keeps, so it has to be a pure
//! function of the record's identifying fields, its link and its timestamp.
//! Amount formatting and quota rounding end up inside that digest too, and the
//! backoff window decides when a failed record goes out again.

use chrono::{FixedOffset, TimeZone};
use proptest::prelude::*;
use verifactu_pipeline::{
    fingerprint::{FingerprintEngine, RegistrationDigestInput, is_valid_digest},
    policy::backoff_window,
    record::Amount,
    timestamp::CalendarDate,
};

// PROPERTY TEST STRATEGIES

fn digest_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[0-9A-F]{64}")
}

fn date_strategy() -> impl Strategy<Value = CalendarDate> {
    (2024i32..=2030, 1u32..=12, 1u32..=28)
        .prop_map(|(y, m, d)| CalendarDate::from_ymd(y, m, d).unwrap())
}

fn timestamp_strategy() -> impl Strategy<Value = chrono::DateTime<FixedOffset>> {
    (0i64..200_000_000, prop_oneof![Just(3600), Just(7200), Just(0)]).prop_map(|(secs, offset)| {
        FixedOffset::east_opt(offset)
            .unwrap()
            .timestamp_opt(1_700_000_000 + secs, 0)
            .unwrap()
    })
}

proptest! {
    /// Same inputs, same digest: 64 upper-case hex characters
    #[test]
    fn digest_is_deterministic(
        number in "[A-Z]{1,3}-[0-9]{1,6}",
        date in date_strategy(),
        total in 0i64..100_000_000,
        tax in 0i64..10_000_000,
        previous in digest_strategy(),
        at in timestamp_strategy(),
    ) {
        let engine = FingerprintEngine::new();
        let input = RegistrationDigestInput {
            issuer_tax_id: "B12345678",
            document_number: &number,
            issue_date: date,
            kind_code: "F1",
            tax_total: Amount::from_cents(tax),
            total: Amount::from_cents(total),
        };
        let first = engine.compute_digest(&input, previous.as_deref(), &at).unwrap();
        let second = engine.compute_digest(&input, previous.as_deref(), &at).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(is_valid_digest(&first));
        prop_assert_eq!(first.to_uppercase(), first.clone());

        // any change of the total moves the digest
        let changed = RegistrationDigestInput { total: Amount::from_cents(total + 1), ..input.clone() };
        prop_assert_ne!(engine.compute_digest(&changed, previous.as_deref(), &at).unwrap(), first);
    }

    /// The chain link takes part in the digest
    #[test]
    fn previous_digest_changes_the_digest(previous in "[0-9A-F]{64}", at in timestamp_strategy()) {
        let engine = FingerprintEngine::new();
        let input = RegistrationDigestInput {
            issuer_tax_id: "B12345678",
            document_number: "FA-1",
            issue_date: CalendarDate::from_ymd(2025, 7, 1).unwrap(),
            kind_code: "F2",
            tax_total: Amount::from_cents(2_100),
            total: Amount::from_cents(12_100),
        };
        let first = engine.compute_digest(&input, None, &at).unwrap();
        let linked = engine.compute_digest(&input, Some(&previous), &at).unwrap();
        prop_assert_ne!(first, linked);
    }

    /// Two decimals that read back to the same number of cents
    #[test]
    fn amounts_render_exactly(cents in -1_000_000_000i64..1_000_000_000) {
        let text = Amount::from_cents(cents).to_wire();
        let (_, decimals) = text.split_once('.').unwrap();
        prop_assert_eq!(decimals.len(), 2);
        prop_assert_eq!(text.replace('.', "").parse::<i64>().unwrap(), cents);
    }

    /// Quota rounding is off by at most half a cent
    #[test]
    fn quota_is_within_half_a_cent(cents in -100_000_000i64..100_000_000, rate in 0u32..=2_100) {
        let quota = Amount::from_cents(cents).apply_rate(rate).cents() as i128;
        let exact = cents as i128 * rate as i128;
        prop_assert!((quota * 10_000 - exact).abs() <= 5_000);
        // symmetric around zero
        prop_assert_eq!(Amount::from_cents(-cents).apply_rate(rate).cents() as i128, -quota);
    }

    /// The window grows with the retry count and never passes the cap
    #[test]
    fn backoff_is_bounded_and_monotone(
        retry in 0u32..40,
        base in 1u64..3_600,
        extra in 0u64..86_400,
    ) {
        let cap = base + extra;
        let window = backoff_window(retry, base, cap).num_seconds() as u64;
        let next = backoff_window(retry + 1, base, cap).num_seconds() as u64;
        prop_assert!(window >= base);
        prop_assert!(window <= cap);
        prop_assert!(next >= window);
    }
}

#[test]
fn three_retries_wait_the_full_hour() {
    assert_eq!(backoff_window(3, 600, 3_600).num_minutes(), 60);
    assert_eq!(backoff_window(0, 600, 3_600).num_minutes(), 10);
}
