//! Property tests for wrap-aware operation-number ordering.

use ocpp_client::rpc::store::{precedes, MAX_OPNR};
use proptest::prelude::*;

proptest! {
    /// Numbers assigned earlier always precede numbers assigned later,
    /// wherever the window sits on the modular number line.
    #[test]
    fn assignment_order_matches_wrap_aware_order(
        start in 0u32..MAX_OPNR,
        count in 2u32..1000,
    ) {
        let numbers: Vec<u32> = (0..count).map(|i| (start + i) % MAX_OPNR).collect();
        let end = (start + count) % MAX_OPNR;
        for pair in numbers.windows(2) {
            prop_assert!(precedes(pair[0], pair[1], end));
            prop_assert!(!precedes(pair[1], pair[0], end));
        }
    }

    /// Ordering is total over distinct numbers for any end cursor.
    #[test]
    fn ordering_is_antisymmetric(
        a in 0u32..MAX_OPNR,
        b in 0u32..MAX_OPNR,
        end in 0u32..MAX_OPNR,
    ) {
        if a != b {
            prop_assert_ne!(precedes(a, b, end), precedes(b, a, end));
        } else {
            prop_assert!(!precedes(a, b, end));
        }
    }
}
