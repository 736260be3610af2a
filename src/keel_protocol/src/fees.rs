//! Base-rate fee controller shared by borrowing and redemption.
//!
//! Redemptions raise the base rate in proportion to the share of supply they
//! redeem, borrowing raises it in proportion to the share it issues, and the
//! rate decays by `minute_decay_factor` for every whole minute since the last
//! fee operation.

use crate::logs::DEBUG;
use crate::numeric::{dec_pow, Ratio, KUSD};
use crate::state::{Mode, State};
use crate::{ValidationError, SECONDS_IN_ONE_MINUTE};
use ic_canister_log::log;

impl State {
    pub fn minutes_passed_since_last_fee_op(&self, now_seconds: u64) -> u64 {
        now_seconds.saturating_sub(self.last_fee_operation_time) / SECONDS_IN_ONE_MINUTE
    }

    pub fn decayed_base_rate(&self, now_seconds: u64) -> Ratio {
        let minutes = self.minutes_passed_since_last_fee_op(now_seconds);
        let decay_factor = dec_pow(self.config.minute_decay_factor.raw(), minutes);
        self.base_rate * Ratio::new(decay_factor)
    }

    /// Decayed base rate clamped to `[borrowing_fee_floor, max_borrowing_fee]`.
    pub fn borrowing_rate(&self, now_seconds: u64) -> Ratio {
        self.decayed_base_rate(now_seconds)
            .max(self.config.borrowing_fee_floor)
            .min(self.config.max_borrowing_fee)
    }

    /// Fee charged on issuing `debt`. Borrowing is free in Recovery Mode.
    pub fn borrowing_fee(&self, mode: Mode, debt: KUSD, now_seconds: u64) -> KUSD {
        match mode {
            Mode::Recovery => KUSD::ZERO,
            Mode::Normal => debt * self.borrowing_rate(now_seconds),
        }
    }

    pub fn redemption_rate_with(&self, base_rate: Ratio) -> Ratio {
        (self.config.redemption_fee_floor + base_rate).min(Ratio::ONE)
    }

    /// Redemption rate at the current decayed base rate, before any new
    /// redemption raises it.
    pub fn redemption_rate(&self, now_seconds: u64) -> Ratio {
        self.redemption_rate_with(self.decayed_base_rate(now_seconds))
    }

    /// Base rate after issuing `issued` out of `total_debt` system debt.
    pub fn base_rate_after_borrowing(&self, issued: KUSD, total_debt: KUSD, now_seconds: u64) -> Ratio {
        let decayed = self.decayed_base_rate(now_seconds);
        if total_debt.is_zero() {
            return decayed;
        }
        (decayed + issued / total_debt).min(Ratio::ONE)
    }

    /// Base rate after redeeming `redeemed` out of `total_debt` system debt.
    pub fn base_rate_after_redemption(&self, redeemed: KUSD, total_debt: KUSD, now_seconds: u64) -> Ratio {
        let decayed = self.decayed_base_rate(now_seconds);
        if total_debt.is_zero() {
            return decayed;
        }
        let fraction = redeemed / total_debt;
        let increase = Ratio::new(fraction.raw() / self.config.redemption_beta);
        (decayed + increase).min(Ratio::ONE)
    }

    pub(crate) fn set_base_rate(&mut self, base_rate: Ratio, now_seconds: u64) {
        assert!(base_rate <= Ratio::ONE, "bug: base rate {} above one", base_rate);
        self.base_rate = base_rate;
        self.update_last_fee_op_time(now_seconds);
        log!(DEBUG, "[fees] base rate set to {}", base_rate);
    }

    // Only whole minutes count, so frequent operations cannot stall the
    // decay.
    fn update_last_fee_op_time(&mut self, now_seconds: u64) {
        if now_seconds.saturating_sub(self.last_fee_operation_time) >= SECONDS_IN_ONE_MINUTE {
            self.last_fee_operation_time = now_seconds;
        }
    }
}

/// The caller's fee cap must lie in `[floor, 1]`; in Recovery Mode any cap up
/// to 1 is accepted since no fee is charged.
pub fn validate_max_fee_percentage(
    mode: Mode,
    max_fee: Ratio,
    floor: Ratio,
) -> Result<(), ValidationError> {
    let floor = match mode {
        Mode::Recovery => Ratio::ZERO,
        Mode::Normal => floor,
    };
    if max_fee < floor || max_fee > Ratio::ONE {
        return Err(ValidationError::MaxFeeOutOfRange { max_fee, floor });
    }
    Ok(())
}

/// Rejects the operation when the charged `fee_percentage` exceeds the
/// caller's cap.
pub fn require_user_accepts_fee(fee_percentage: Ratio, max_fee: Ratio) -> Result<(), ValidationError> {
    if fee_percentage > max_fee {
        return Err(ValidationError::FeeExceedsMaximum {
            fee_percentage,
            max_fee,
        });
    }
    Ok(())
}
