//! Stability Pool compounding engine.
//!
//! Deposits are never iterated. A running product `P` tracks the surviving
//! fraction of every deposit, and a sum `S` per `(epoch, scale)` tracks the
//! collateral gained per unit deposited. A depositor's current values are
//! derived from the `(P, S, scale, epoch)` snapshot taken at their last touch.
//!
//! `P` never drops below [`SCALE_FACTOR`]: when a liquidation would push it
//! lower, `P` is multiplied by `SCALE_FACTOR` and `scale` is incremented. A
//! liquidation that empties the pool starts a new `epoch` instead.

use crate::logs::DEBUG;
use crate::numeric::{narrow, COLL, DECIMAL_PRECISION, KUSD};
use candid::Principal;
use ethnum::U256;
use ic_canister_log::log;
use std::collections::BTreeMap;

pub const SCALE_FACTOR: u128 = 1_000_000_000;

// Rounding slack tolerated per deposit when comparing derived deposit
// values against the pool totals.
const DUST_PER_DEPOSIT: u128 = 1_000_000_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositSnapshot {
    pub p: u128,
    pub s: U256,
    pub scale: u64,
    pub epoch: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deposit {
    pub initial_value: KUSD,
    pub snapshot: DepositSnapshot,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StabilityPool {
    deposits: BTreeMap<Principal, Deposit>,
    total_deposits: KUSD,
    coll: COLL,
    p: u128,
    current_scale: u64,
    current_epoch: u64,
    epoch_to_scale_to_sum: BTreeMap<(u64, u64), U256>,
    last_coll_error_offset: u128,
    last_kusd_loss_error_offset: u128,
}

impl Default for StabilityPool {
    fn default() -> Self {
        Self {
            deposits: BTreeMap::new(),
            total_deposits: KUSD::ZERO,
            coll: COLL::ZERO,
            p: DECIMAL_PRECISION,
            current_scale: 0,
            current_epoch: 0,
            epoch_to_scale_to_sum: BTreeMap::new(),
            last_coll_error_offset: 0,
            last_kusd_loss_error_offset: 0,
        }
    }
}

impl StabilityPool {
    pub fn total_deposits(&self) -> KUSD {
        self.total_deposits
    }

    /// Collateral held by the pool, not yet withdrawn by depositors.
    pub fn coll_balance(&self) -> COLL {
        self.coll
    }

    pub fn p(&self) -> u128 {
        self.p
    }

    pub fn current_scale(&self) -> u64 {
        self.current_scale
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn sum_at(&self, epoch: u64, scale: u64) -> U256 {
        self.epoch_to_scale_to_sum
            .get(&(epoch, scale))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    pub fn deposit(&self, depositor: &Principal) -> Option<&Deposit> {
        self.deposits.get(depositor)
    }

    pub fn depositors(&self) -> impl Iterator<Item = &Principal> {
        self.deposits.keys()
    }

    pub fn compounded_deposit(&self, depositor: &Principal) -> KUSD {
        match self.deposits.get(depositor) {
            Some(deposit) => self.compounded_from_snapshot(deposit.initial_value, &deposit.snapshot),
            None => KUSD::ZERO,
        }
    }

    /// Compounded deposit capped at what the pool still holds.
    pub fn withdrawable_deposit(&self, depositor: &Principal) -> KUSD {
        self.settle(depositor).0
    }

    /// Collateral gain capped at what the pool still holds.
    pub fn withdrawable_coll_gain(&self, depositor: &Principal) -> COLL {
        self.settle(depositor).1
    }

    pub fn depositor_coll_gain(&self, depositor: &Principal) -> COLL {
        match self.deposits.get(depositor) {
            Some(deposit) => self.coll_gain_from_snapshot(deposit.initial_value, &deposit.snapshot),
            None => COLL::ZERO,
        }
    }

    /// Value left of `initial` after every liquidation since `snapshot`.
    ///
    /// A deposit made in an earlier epoch was wiped out when the pool was
    /// emptied. A deposit whose snapshot is more than two scale changes old
    /// is below the precision `P` can carry and counts as zero.
    fn compounded_from_snapshot(&self, initial: KUSD, snapshot: &DepositSnapshot) -> KUSD {
        if initial.is_zero() || snapshot.epoch < self.current_epoch {
            return KUSD::ZERO;
        }
        let numerator = U256::from(initial.raw()) * U256::from(self.p) / U256::from(snapshot.p);
        let scale_factor = U256::from(SCALE_FACTOR);
        let compounded = match self.current_scale - snapshot.scale {
            0 => numerator,
            1 => numerator / scale_factor,
            2 => numerator / scale_factor / scale_factor,
            _ => U256::ZERO,
        };
        KUSD::new(narrow(compounded))
    }

    /// Collateral earned since `snapshot`. Sums recorded more than one scale
    /// after the snapshot are negligible and ignored.
    fn coll_gain_from_snapshot(&self, initial: KUSD, snapshot: &DepositSnapshot) -> COLL {
        if initial.is_zero() {
            return COLL::ZERO;
        }
        let first_portion = self.sum_at(snapshot.epoch, snapshot.scale) - snapshot.s;
        let second_portion =
            self.sum_at(snapshot.epoch, snapshot.scale + 1) / U256::from(SCALE_FACTOR);
        let gain = U256::from(initial.raw()) * (first_portion + second_portion)
            / U256::from(snapshot.p)
            / U256::from(DECIMAL_PRECISION);
        COLL::new(narrow(gain))
    }

    /// Cancels `debt_to_offset` against the pool's deposits and hands the
    /// depositors `coll_to_add` pro rata.
    pub(crate) fn offset(&mut self, debt_to_offset: KUSD, coll_to_add: COLL) {
        let total = self.total_deposits;
        if total.is_zero() || debt_to_offset.is_zero() {
            return;
        }
        assert!(
            debt_to_offset <= total,
            "bug: offsetting {} KUSD against a pool of {} KUSD",
            debt_to_offset,
            total
        );

        let (coll_gain_per_unit, kusd_loss_per_unit) =
            self.compute_rewards_per_unit_staked(coll_to_add, debt_to_offset, total);
        self.update_reward_sum_and_product(coll_gain_per_unit, kusd_loss_per_unit);

        self.total_deposits -= debt_to_offset;
        self.coll += coll_to_add;
    }

    // Rounds the loss up and the gain down, carrying the rounding errors
    // into the next offset.
    fn compute_rewards_per_unit_staked(
        &mut self,
        coll_to_add: COLL,
        debt_to_offset: KUSD,
        total: KUSD,
    ) -> (U256, u128) {
        let precision = U256::from(DECIMAL_PRECISION);
        let total_wide = U256::from(total.raw());

        let coll_numerator =
            U256::from(coll_to_add.raw()) * precision + U256::from(self.last_coll_error_offset);

        let kusd_loss_per_unit = if debt_to_offset == total {
            self.last_kusd_loss_error_offset = 0;
            DECIMAL_PRECISION
        } else {
            let loss_numerator = (U256::from(debt_to_offset.raw()) * precision)
                .saturating_sub(U256::from(self.last_kusd_loss_error_offset));
            let loss_per_unit = loss_numerator / total_wide + U256::ONE;
            self.last_kusd_loss_error_offset = narrow(loss_per_unit * total_wide - loss_numerator);
            narrow(loss_per_unit)
        };

        let coll_gain_per_unit = coll_numerator / total_wide;
        self.last_coll_error_offset = narrow(coll_numerator - coll_gain_per_unit * total_wide);

        (coll_gain_per_unit, kusd_loss_per_unit)
    }

    pub(crate) fn update_reward_sum_and_product(
        &mut self,
        coll_gain_per_unit: U256,
        kusd_loss_per_unit: u128,
    ) {
        assert!(
            kusd_loss_per_unit <= DECIMAL_PRECISION,
            "bug: loss per unit {} exceeds one",
            kusd_loss_per_unit
        );
        let current_p = self.p;
        let new_product_factor = DECIMAL_PRECISION - kusd_loss_per_unit;

        let marginal_coll_gain = coll_gain_per_unit * U256::from(current_p);
        *self
            .epoch_to_scale_to_sum
            .entry((self.current_epoch, self.current_scale))
            .or_insert(U256::ZERO) += marginal_coll_gain;

        if new_product_factor == 0 {
            self.current_epoch += 1;
            self.current_scale = 0;
            self.p = DECIMAL_PRECISION;
            log!(
                DEBUG,
                "[stability_pool] pool emptied, starting epoch {}",
                self.current_epoch
            );
            return;
        }

        let mut product = U256::from(current_p) * U256::from(new_product_factor);
        let mut new_p = narrow(product / U256::from(DECIMAL_PRECISION));
        // P >= SCALE_FACTOR and the factor is at least 1, so two steps suffice.
        while new_p < SCALE_FACTOR {
            product *= U256::from(SCALE_FACTOR);
            new_p = narrow(product / U256::from(DECIMAL_PRECISION));
            self.current_scale += 1;
            log!(
                DEBUG,
                "[stability_pool] P rescaled to {} at scale {}",
                new_p,
                self.current_scale
            );
        }
        assert!(new_p > 0, "bug: P collapsed to zero");
        self.p = new_p;
    }

    /// Adds `amount` to the depositor's compounded deposit and pays out the
    /// pending collateral gain. Returns the gain.
    pub(crate) fn provide(&mut self, depositor: Principal, amount: KUSD) -> COLL {
        let (compounded, gain) = self.settle(&depositor);
        self.update_deposit_and_snapshot(depositor, compounded + amount);
        self.total_deposits += amount;
        self.coll -= gain;
        gain
    }

    /// Takes `amount` out of the depositor's compounded deposit and pays out
    /// the pending collateral gain. Returns the gain.
    pub(crate) fn withdraw(&mut self, depositor: Principal, amount: KUSD) -> COLL {
        let (compounded, gain) = self.settle(&depositor);
        assert!(
            amount <= compounded,
            "bug: withdrawing {} KUSD from a deposit of {} KUSD",
            amount,
            compounded
        );
        self.update_deposit_and_snapshot(depositor, compounded - amount);
        self.total_deposits -= amount;
        self.coll -= gain;
        gain
    }

    // The loss error carried over from a larger pool can report a deposit a
    // few wei above what the pool still holds.
    fn settle(&self, depositor: &Principal) -> (KUSD, COLL) {
        (
            self.compounded_deposit(depositor).min(self.total_deposits),
            self.depositor_coll_gain(depositor).min(self.coll),
        )
    }

    fn update_deposit_and_snapshot(&mut self, depositor: Principal, new_value: KUSD) {
        if new_value.is_zero() {
            self.deposits.remove(&depositor);
            return;
        }
        let snapshot = DepositSnapshot {
            p: self.p,
            s: self.sum_at(self.current_epoch, self.current_scale),
            scale: self.current_scale,
            epoch: self.current_epoch,
        };
        self.deposits.insert(
            depositor,
            Deposit {
                initial_value: new_value,
                snapshot,
            },
        );
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.p < SCALE_FACTOR || self.p > DECIMAL_PRECISION {
            return Err(format!("P = {} is out of range", self.p));
        }
        let compounded: KUSD = self
            .deposits
            .keys()
            .map(|depositor| self.compounded_deposit(depositor))
            .sum();
        let dust = KUSD::new(DUST_PER_DEPOSIT * self.deposits.len() as u128);
        if compounded > self.total_deposits + dust {
            return Err(format!(
                "compounded deposits {} exceed total deposits {}",
                compounded, self.total_deposits
            ));
        }
        let gains: COLL = self
            .deposits
            .keys()
            .map(|depositor| self.depositor_coll_gain(depositor))
            .sum();
        if gains > self.coll + COLL::new(DUST_PER_DEPOSIT * self.deposits.len() as u128) {
            return Err(format!(
                "collateral gains {} exceed pool collateral {}",
                gains, self.coll
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const E18: u128 = DECIMAL_PRECISION;

    fn depositor(n: u8) -> Principal {
        Principal::from_slice(&[n; 29])
    }

    fn assert_close(actual: u128, expected: u128, tolerance: u128) {
        assert!(
            actual.abs_diff(expected) <= tolerance,
            "{} is not within {} of {}",
            actual,
            tolerance,
            expected
        );
    }

    #[test]
    fn should_return_deposit_without_liquidations() {
        let mut pool = StabilityPool::default();
        let gain = pool.provide(depositor(1), KUSD::from_units(5_000));
        assert_eq!(gain, COLL::ZERO);
        assert_eq!(pool.compounded_deposit(&depositor(1)), KUSD::from_units(5_000));
        let gain = pool.withdraw(depositor(1), KUSD::from_units(5_000));
        assert_eq!(gain, COLL::ZERO);
        assert!(pool.deposit(&depositor(1)).is_none());
        assert_eq!(pool.total_deposits(), KUSD::ZERO);
    }

    #[test]
    fn should_split_offset_between_three_depositors() {
        let mut pool = StabilityPool::default();
        for n in 1..=3 {
            pool.provide(depositor(n), KUSD::from_units(10_000));
        }
        pool.offset(KUSD::from_units(20_000), COLL::from_units(200));

        for n in 1..=3 {
            // remaining / 30000 * 10000 and seized / 30000 * 10000.
            assert_close(
                pool.compounded_deposit(&depositor(n)).raw(),
                3_333_333_333_333_333_333_333,
                E18 / 1_000_000,
            );
            assert_close(
                pool.depositor_coll_gain(&depositor(n)).raw(),
                66_666_666_666_666_666_666,
                E18 / 1_000_000,
            );
        }
        pool.check_invariants().unwrap();
    }

    #[test]
    fn should_leave_two_thirds_after_offsetting_one_third() {
        let mut pool = StabilityPool::default();
        for n in 1..=3 {
            pool.provide(depositor(n), KUSD::from_units(10_000));
        }
        pool.offset(KUSD::from_units(10_000), COLL::from_units(200));
        for n in 1..=3 {
            assert_close(
                pool.compounded_deposit(&depositor(n)).raw(),
                6_666_666_666_666_666_666_666,
                E18 / 1_000_000,
            );
        }
    }

    #[test]
    fn should_start_new_epoch_when_pool_is_emptied() {
        let mut pool = StabilityPool::default();
        pool.provide(depositor(1), KUSD::from_units(1_000));
        pool.provide(depositor(2), KUSD::from_units(3_000));
        pool.offset(KUSD::from_units(4_000), COLL::from_units(40));

        assert_eq!(pool.p(), E18);
        assert_eq!(pool.current_epoch(), 1);
        assert_eq!(pool.current_scale(), 0);
        assert_eq!(pool.compounded_deposit(&depositor(1)), KUSD::ZERO);
        assert_eq!(pool.compounded_deposit(&depositor(2)), KUSD::ZERO);
        // Gains from the emptying liquidation stay claimable.
        assert_close(pool.depositor_coll_gain(&depositor(1)).raw(), 10 * E18, 1_000);
        assert_close(pool.depositor_coll_gain(&depositor(2)).raw(), 30 * E18, 1_000);

        // A fresh deposit is unaffected by the old epoch.
        pool.provide(depositor(3), KUSD::from_units(500));
        assert_eq!(pool.compounded_deposit(&depositor(3)), KUSD::from_units(500));
        assert_eq!(pool.depositor_coll_gain(&depositor(3)), COLL::ZERO);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn should_rescale_p_instead_of_collapsing() {
        let mut pool = StabilityPool::default();
        pool.provide(depositor(1), KUSD::new(1_000_000_000_000 * E18));

        // Leaves 1e-10 of the pool: P would drop to ~1e8.
        pool.update_reward_sum_and_product(U256::ZERO, E18 - 100_000_000);
        assert_eq!(pool.current_scale(), 1);
        assert_eq!(pool.p(), 100_000_000 * SCALE_FACTOR);
        assert_eq!(
            pool.compounded_deposit(&depositor(1)).raw(),
            100 * E18 // 1e12 KUSD * 1e-10
        );

        pool.update_reward_sum_and_product(U256::ZERO, E18 - 100_000_000);
        assert_eq!(pool.current_scale(), 2);
        assert_eq!(pool.compounded_deposit(&depositor(1)).raw(), 10_000_000_000);
    }

    #[test]
    fn should_treat_deposit_as_zero_after_three_scale_changes() {
        let mut pool = StabilityPool::default();
        pool.provide(depositor(1), KUSD::new(1_000_000_000_000 * E18));
        for _ in 0..3 {
            pool.update_reward_sum_and_product(U256::ZERO, E18 - 100_000_000);
        }
        assert_eq!(pool.current_scale(), 3);
        assert_eq!(pool.current_epoch(), 0);
        assert_eq!(pool.compounded_deposit(&depositor(1)), KUSD::ZERO);
    }

    #[test]
    fn should_cross_two_boundaries_in_one_liquidation() {
        let mut pool = StabilityPool::default();
        pool.update_reward_sum_and_product(U256::ZERO, E18 - 100_000_000);
        assert_eq!(pool.current_scale(), 1);
        let p = pool.p();
        // A factor of 1e-18 takes P below SCALE_FACTOR even after one rescale.
        pool.update_reward_sum_and_product(U256::ZERO, E18 - 1);
        assert_eq!(pool.current_scale(), 3);
        assert_eq!(pool.p(), p);
    }

    #[test]
    fn should_pay_gains_across_one_scale_boundary() {
        let mut pool = StabilityPool::default();
        pool.provide(depositor(1), KUSD::from_units(1_000_000));
        // Absorb all but 1e-10 of the pool, seizing 1000 COLL.
        let total = pool.total_deposits();
        let remaining = KUSD::new(total.raw() / 10_000_000_000);
        pool.offset(total - remaining, COLL::from_units(1_000));
        assert_eq!(pool.current_scale(), 1);
        assert_close(
            pool.depositor_coll_gain(&depositor(1)).raw(),
            1_000 * E18,
            E18 / 1_000_000,
        );

        // A second liquidation at the new scale still reaches the old depositor.
        let before = pool.depositor_coll_gain(&depositor(1));
        pool.offset(KUSD::new(pool.total_deposits().raw() / 2), COLL::from_units(1));
        assert!(pool.depositor_coll_gain(&depositor(1)) > before);
        pool.check_invariants().unwrap();
    }
}
