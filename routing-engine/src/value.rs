//! Value model: exact integer arithmetic for routing
//!
//! Every function here is pure. Amounts never go negative and no division
//! remainder is dropped: [`split`] hands the remainder to the last share.

use ledger_client::Amount;
use rust_decimal::Decimal;

/// Split `amount` into `parts` shares; the remainder goes to the last share.
///
/// `parts == 0` yields no shares.
pub fn split(amount: Amount, parts: u32) -> Vec<Amount> {
    if parts == 0 {
        return Vec::new();
    }

    let divisor = Amount::from(parts);
    let share = amount / divisor;
    let remainder = amount % divisor;

    let mut shares = vec![share; parts as usize];
    if let Some(last) = shares.last_mut() {
        *last += remainder;
    }
    shares
}

/// `max(0, amount - fee_l1 - fee_l2)`
///
/// A zero result means the edge cannot be sent.
pub fn deduct_fees(amount: Amount, fee_l1: Amount, fee_l2: Amount) -> Amount {
    amount.saturating_sub(fee_l1).saturating_sub(fee_l2)
}

/// `min(amount, available)`
pub fn clamp(amount: Amount, available: Amount) -> Amount {
    amount.min(available)
}

/// Render base units with `decimals` places, for display only
pub fn format_units(amount: Amount, decimals: u32) -> Decimal {
    i128::try_from(amount)
        .ok()
        .and_then(|mantissa| Decimal::try_from_i128_with_scale(mantissa, decimals).ok())
        .map(|value| value.normalize())
        .unwrap_or(Decimal::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_assigns_remainder_to_last_share() {
        assert_eq!(split(10, 3), vec![3, 3, 4]);
        assert_eq!(split(1_000_000_000, 2), vec![500_000_000, 500_000_000]);
        assert_eq!(split(2, 3), vec![0, 0, 2]);
        assert_eq!(split(0, 4), vec![0, 0, 0, 0]);
        assert!(split(99, 0).is_empty());
    }

    #[test]
    fn test_deduct_fees() {
        assert_eq!(deduct_fees(500_000_000, 180, 34), 499_999_786);
        assert_eq!(deduct_fees(214, 180, 34), 0);
        assert_eq!(deduct_fees(100, 180, 34), 0);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(500, 1_000), 500);
        assert_eq!(clamp(1_500, 1_000), 1_000);
        assert_eq!(clamp(7, 0), 0);
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(1_500_000_000_000_000_000, 18).to_string(), "1.5");
        assert_eq!(format_units(42, 0).to_string(), "42");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Property: shares always sum back to the original amount
        #[test]
        fn prop_split_is_exact(amount in any::<u64>(), parts in 1u32..64) {
            let shares = split(Amount::from(amount), parts);
            prop_assert_eq!(shares.len(), parts as usize);
            prop_assert_eq!(shares.iter().sum::<Amount>(), Amount::from(amount));
        }

        /// Property: only the last share differs, and by less than `parts`
        #[test]
        fn prop_split_is_even(amount in any::<u64>(), parts in 1u32..64) {
            let shares = split(Amount::from(amount), parts);
            let first = shares[0];
            prop_assert!(shares[..shares.len() - 1].iter().all(|s| *s == first));
            prop_assert!(shares[shares.len() - 1] - first < Amount::from(parts));
        }

        /// Property: clamp never exceeds the balance and keeps affordable amounts
        #[test]
        fn prop_clamp_is_bounded(amount in any::<u64>(), balance in any::<u64>()) {
            let clamped = clamp(Amount::from(amount), Amount::from(balance));
            prop_assert!(clamped <= Amount::from(balance));
            if amount <= balance {
                prop_assert_eq!(clamped, Amount::from(amount));
            }
        }

        /// Property: fee deduction never underflows and never adds value
        #[test]
        fn prop_deduct_fees_is_saturating(amount in any::<u64>(), l1 in 0u64..1_000_000, l2 in 0u64..1_000_000) {
            let net = deduct_fees(Amount::from(amount), Amount::from(l1), Amount::from(l2));
            prop_assert!(net <= Amount::from(amount));
            if Amount::from(amount) > Amount::from(l1) + Amount::from(l2) {
                prop_assert_eq!(net + Amount::from(l1) + Amount::from(l2), Amount::from(amount));
            } else {
                prop_assert_eq!(net, 0);
            }
        }
    }
}
