use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A currency this node can account in. Owns a ledger liquidity account
/// (created on insert) and, optionally, sending/receiving fees.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: Uuid,
    pub code: String,
    pub scale: u8,
    /// When set, wallet-address withdrawal events only fire once the
    /// accumulated delta reaches this threshold
    pub withdrawal_threshold: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(code: impl Into<String>, scale: u8) -> Self {
        Asset {
            id: Uuid::new_v4(),
            code: code.into(),
            scale,
            withdrawal_threshold: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeType {
    Sending,
    Receiving,
}

/// A fee schedule: a flat amount plus basis points of the charged amount,
/// rounded up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fee {
    pub fixed: u64,
    pub basis_points: u32,
}

impl Fee {
    /// The fee charged on `amount`.
    pub fn charge(&self, amount: u64) -> u64 {
        let variable = (u128::from(amount) * u128::from(self.basis_points) + 9_999) / 10_000;
        self.fixed + variable as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basis_points_round_up() {
        let fee = Fee {
            fixed: 150,
            basis_points: 200,
        };
        // 2% of 3364 is 67.28, rounded up to 68
        assert_eq!(fee.charge(3364), 218);
        assert_eq!(fee.charge(0), 150);
    }

    #[test]
    fn zero_fee_charges_nothing() {
        let fee = Fee {
            fixed: 0,
            basis_points: 0,
        };
        assert_eq!(fee.charge(1_000_000), 0);
    }
}
