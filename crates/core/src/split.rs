//! Split-share math and participant validation.
//!
//! All share arithmetic is integer-only in smallest currency units. The
//! only place rounding can occur is the equal-split division, and the last
//! participant absorbs the remainder so shares always sum to the total.

use crate::{Amount, LedgerError, ParticipantInput, Result, SplitMode};

/// Equal shares of `total` across `count` participants, remainder assigned
/// to the last share so the sum is exactly `total`.
pub fn equal_shares(total: Amount, count: usize) -> Vec<Amount> {
    if count == 0 {
        return Vec::new();
    }
    let n = count as Amount;
    let base = total / n;
    let mut shares = vec![base; count];
    // base * n can be short of total by up to n-1 units
    shares[count - 1] = total - base * (n - 1);
    shares
}

/// Per-participant obligation for a wallet of the given mode.
///
/// Fair/spend: equal split with remainder-to-last. Degen: everyone owes
/// the full bill (each participant locks `total`, the loser pays it).
pub fn participant_shares(mode: SplitMode, total: Amount, count: usize) -> Vec<Amount> {
    match mode {
        SplitMode::Fair | SplitMode::Spend => equal_shares(total, count),
        SplitMode::Degen => vec![total; count],
    }
}

/// Validate a caller-supplied participant list for create/repartition.
///
/// Rejects empty lists, duplicate user ids, and all-zero addresses (a
/// zeroed pubkey is never a real on-chain account).
pub fn validate_participants(participants: &[ParticipantInput]) -> Result<()> {
    if participants.is_empty() {
        return Err(LedgerError::Validation("participant list is empty".into()));
    }
    for (i, p) in participants.iter().enumerate() {
        if p.user_id.is_empty() {
            return Err(LedgerError::Validation(format!("participant {} has empty user id", i)));
        }
        if p.wallet_address == [0u8; 32] {
            return Err(LedgerError::Validation(format!(
                "participant {} has a zero wallet address",
                p.user_id
            )));
        }
        if participants[..i].iter().any(|q| q.user_id == p.user_id) {
            return Err(LedgerError::Validation(format!("duplicate participant {}", p.user_id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(user_id: &str, byte: u8) -> ParticipantInput {
        ParticipantInput { user_id: user_id.into(), wallet_address: [byte; 32] }
    }

    // ==================== Share Math Tests ====================

    #[test]
    fn test_equal_shares_divides_evenly() {
        assert_eq!(equal_shares(30, 3), vec![10, 10, 10]);
        assert_eq!(equal_shares(100, 4), vec![25, 25, 25, 25]);
    }

    #[test]
    fn test_equal_shares_remainder_goes_to_last() {
        assert_eq!(equal_shares(10, 3), vec![3, 3, 4]);
        assert_eq!(equal_shares(7, 2), vec![3, 4]);
        assert_eq!(equal_shares(1, 3), vec![0, 0, 1]);
    }

    #[test]
    fn test_equal_shares_always_sum_to_total() {
        for total in [0u64, 1, 7, 10, 99, 1_000_003] {
            for count in 1..=7 {
                let shares = equal_shares(total, count);
                assert_eq!(shares.iter().sum::<u64>(), total, "total={} count={}", total, count);
            }
        }
    }

    #[test]
    fn test_equal_shares_zero_count() {
        assert!(equal_shares(10, 0).is_empty());
    }

    #[test]
    fn test_degen_everyone_owes_full_amount() {
        assert_eq!(participant_shares(SplitMode::Degen, 20, 2), vec![20, 20]);
    }

    #[test]
    fn test_fair_and_spend_split_equally() {
        assert_eq!(participant_shares(SplitMode::Fair, 30, 3), vec![10, 10, 10]);
        assert_eq!(participant_shares(SplitMode::Spend, 30, 3), vec![10, 10, 10]);
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_empty_list_rejected() {
        assert!(matches!(validate_participants(&[]), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_zero_address_rejected() {
        let list = [ParticipantInput { user_id: "a".into(), wallet_address: [0u8; 32] }];
        assert!(matches!(validate_participants(&list), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let list = [input("a", 1), input("b", 2), input("a", 3)];
        let err = validate_participants(&list).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_valid_list_accepted() {
        let list = [input("a", 1), input("b", 2), input("c", 3)];
        assert!(validate_participants(&list).is_ok());
    }
}
