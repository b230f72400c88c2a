//! Property-based tests using proptest.
//!
//! These verify invariants that should hold for all inputs: etag total
//! ordering and wire-form roundtrips, the back-off skip policy, and
//! storage-key escaping.

use outbound_replication::destination::escape_destination_url;
use outbound_replication::etag::Etag;
use outbound_replication::failure::should_skip_destination;
use proptest::prelude::*;

// =============================================================================
// Etag Ordering Properties
// =============================================================================

proptest! {
    /// Comparison is reflexive: a == a.
    #[test]
    fn etag_comparison_reflexive(restarts in any::<u64>(), changes in any::<u64>()) {
        let etag = Etag::new(restarts, changes);
        prop_assert_eq!(etag.cmp(&etag), std::cmp::Ordering::Equal);
    }

    /// Comparison is antisymmetric: if a < b then b > a.
    #[test]
    fn etag_comparison_antisymmetric(
        r1 in any::<u64>(), c1 in any::<u64>(),
        r2 in any::<u64>(), c2 in any::<u64>(),
    ) {
        let a = Etag::new(r1, c1);
        let b = Etag::new(r2, c2);
        prop_assert_eq!(a.cmp(&b).reverse(), b.cmp(&a));
    }

    /// The generation counter dominates the change counter.
    #[test]
    fn etag_restarts_dominate(
        r1 in any::<u64>(), c1 in any::<u64>(),
        r2 in any::<u64>(), c2 in any::<u64>(),
    ) {
        prop_assume!(r1 != r2);
        let a = Etag::new(r1, c1);
        let b = Etag::new(r2, c2);
        if r1 < r2 {
            prop_assert!(a < b);
        } else {
            prop_assert!(a > b);
        }
    }

    /// The 16-byte wire form roundtrips.
    #[test]
    fn etag_bytes_roundtrip(restarts in any::<u64>(), changes in any::<u64>()) {
        let etag = Etag::new(restarts, changes);
        prop_assert_eq!(Etag::from_bytes(etag.to_bytes()), etag);
    }

    /// Byte-wise comparison of the wire form agrees with etag order,
    /// so a peer can compare raw 16-byte values directly.
    #[test]
    fn etag_byte_order_matches(
        r1 in any::<u64>(), c1 in any::<u64>(),
        r2 in any::<u64>(), c2 in any::<u64>(),
    ) {
        let a = Etag::new(r1, c1);
        let b = Etag::new(r2, c2);
        prop_assert_eq!(a.cmp(&b), a.to_bytes().cmp(&b.to_bytes()));
    }

    /// The hex string form roundtrips through parsing.
    #[test]
    fn etag_string_roundtrip(restarts in any::<u64>(), changes in any::<u64>()) {
        let etag = Etag::new(restarts, changes);
        let parsed: Etag = etag.to_string().parse().unwrap();
        prop_assert_eq!(parsed, etag);
    }

    /// `next()` is strictly increasing within a generation.
    #[test]
    fn etag_next_increases(restarts in any::<u64>(), changes in 0u64..u64::MAX) {
        let etag = Etag::new(restarts, changes);
        prop_assert!(etag.next() > etag);
    }
}

// =============================================================================
// Back-off Policy Properties
// =============================================================================

/// The modulus the policy applies for a given failure count.
fn expected_modulus(failures: u64) -> u64 {
    match failures {
        0..=10 => 1,
        11..=100 => 2,
        101..=1000 => 5,
        _ => 10,
    }
}

proptest! {
    /// Healthy destinations are never skipped.
    #[test]
    fn healthy_destination_never_skipped(failures in 0u64..=10, attempt in any::<u64>()) {
        prop_assert!(!should_skip_destination(failures, attempt));
    }

    /// The policy is exactly "replicate when attempt % k == 0".
    #[test]
    fn skip_policy_is_modular(failures in any::<u64>(), attempt in any::<u64>()) {
        let k = expected_modulus(failures);
        prop_assert_eq!(
            should_skip_destination(failures, attempt),
            attempt % k != 0
        );
    }

    /// Over any window of T consecutive data-driven cycles, the number
    /// of replication attempts is ⌈T/k⌉ or ⌊T/k⌋ depending on phase.
    #[test]
    fn attempts_over_window_match_ratio(
        failures in any::<u64>(),
        first_attempt in 1u64..10_000,
        window in 1u64..200,
    ) {
        let k = expected_modulus(failures);
        let attempts = (first_attempt..first_attempt + window)
            .filter(|attempt| !should_skip_destination(failures, *attempt))
            .count() as u64;
        prop_assert!(attempts >= window / k);
        prop_assert!(attempts <= window / k + 1);
    }

    /// More failures never means more attempts.
    #[test]
    fn backoff_is_monotone(f1 in any::<u64>(), f2 in any::<u64>(), window in 1u64..100) {
        let (low, high) = if f1 <= f2 { (f1, f2) } else { (f2, f1) };
        let count = |failures: u64| {
            (1..=window)
                .filter(|attempt| !should_skip_destination(failures, *attempt))
                .count()
        };
        prop_assert!(count(low) >= count(high));
    }
}

// =============================================================================
// Storage-Key Escaping Properties
// =============================================================================

proptest! {
    /// Escaped URLs never contain key-hostile characters.
    #[test]
    fn escaped_url_has_no_separators(url in ".{0,100}") {
        let escaped = escape_destination_url(&url);
        prop_assert!(!escaped.contains('/'));
        prop_assert!(!escaped.contains(':'));
        prop_assert!(!escaped.contains(' '));
    }

    /// Escaping is deterministic.
    #[test]
    fn escaping_is_deterministic(url in ".{0,100}") {
        prop_assert_eq!(escape_destination_url(&url), escape_destination_url(&url));
    }

    /// Escaped output is plain ASCII.
    #[test]
    fn escaped_url_is_ascii(url in ".{0,100}") {
        prop_assert!(escape_destination_url(&url).is_ascii());
    }
}
