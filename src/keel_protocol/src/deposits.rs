//! Stability Pool deposits: provide, withdraw, and move the collateral gain
//! into the depositor's trove.

use crate::event::{
    record_provide_to_stability_pool, record_withdraw_coll_gain_to_trove,
    record_withdraw_from_stability_pool,
};
use crate::logs::INFO;
use crate::management::{
    self, deposit_to_stability_pool, require_kusd_balance, CollateralAccount, CollateralPool,
    Host, LedgerAccount,
};
use crate::numeric::{compute_collateral_ratio, compute_nominal_cr, UsdColl, COLL, KUSD};
use crate::sorted_troves::InsertPosition;
use crate::state::State;
use crate::{InvariantViolation, Protocol, ProtocolError, StateError, ValidationError};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalSuccess {
    pub kusd_withdrawn: KUSD,
    pub coll_gain: COLL,
}

impl State {
    /// Whether the lowest trove in the list is below MCR at `price`.
    pub fn has_undercollateralized_troves(&self, price: UsdColl) -> bool {
        match self.sorted_troves.last() {
            Some(last) => self.current_icr(&last, price) < self.config.minimum_collateral_ratio,
            None => false,
        }
    }

    /// Returns the gain moved and the pending rewards applied to the trove.
    pub(crate) fn apply_withdraw_coll_gain_to_trove(
        &mut self,
        depositor: Principal,
        position: InsertPosition,
    ) -> (COLL, COLL, KUSD) {
        let gain = self.stability_pool.withdraw(depositor, KUSD::ZERO);
        let (pending_coll, pending_debt) = self.apply_pending_rewards(&depositor);
        let (coll, debt) = match self.trove(&depositor) {
            Some(trove) => (trove.coll, trove.debt),
            None => panic!("bug: no trove for depositor {}", depositor),
        };
        self.set_trove_amounts(&depositor, coll + gain, debt, position);
        (gain, pending_coll, pending_debt)
    }
}

impl Protocol {
    /// Adds `amount` to the caller's deposit. Returns the collateral gain
    /// paid out on the way.
    pub fn provide_to_stability_pool<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        amount: KUSD,
    ) -> Result<COLL, ProtocolError> {
        if amount.is_zero() {
            return Err(ValidationError::ZeroAmount.into());
        }
        require_kusd_balance(host, caller, amount)?;
        deposit_to_stability_pool(host, caller, amount)?;

        let gain = record_provide_to_stability_pool(&self.events, &mut self.state, caller, amount);
        management::move_collateral(
            host,
            CollateralAccount::Pool(CollateralPool::StabilityPool),
            CollateralAccount::User(caller),
            gain,
        );

        log!(
            INFO,
            "[provide_to_stability_pool] {} deposited {} KUSD, now {} KUSD (gain paid {})",
            caller,
            amount,
            self.state.stability_pool.compounded_deposit(&caller),
            gain
        );
        self.self_check();
        Ok(gain)
    }

    /// Withdraws `amount` of the caller's compounded deposit and the whole
    /// collateral gain. A zero amount only claims the gain.
    pub fn withdraw_from_stability_pool<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        amount: KUSD,
    ) -> Result<WithdrawalSuccess, ProtocolError> {
        let pool = &self.state.stability_pool;
        if pool.deposit(&caller).is_none() {
            return Err(StateError::NoDeposit.into());
        }
        if !amount.is_zero() {
            let price = host.current_price();
            if self.state.has_undercollateralized_troves(price) {
                return Err(InvariantViolation::UnderCollateralizedTroves.into());
            }
        }
        let available = pool.withdrawable_deposit(&caller);
        if amount > available {
            return Err(ValidationError::AmountExceedsDeposit {
                requested: amount,
                available,
            }
            .into());
        }

        let gain = record_withdraw_from_stability_pool(&self.events, &mut self.state, caller, amount);
        management::transfer(
            host,
            LedgerAccount::StabilityPool,
            LedgerAccount::User(caller),
            amount,
        );
        management::move_collateral(
            host,
            CollateralAccount::Pool(CollateralPool::StabilityPool),
            CollateralAccount::User(caller),
            gain,
        );

        log!(
            INFO,
            "[withdraw_from_stability_pool] {} withdrew {} KUSD and {} collateral",
            caller,
            amount,
            gain
        );
        self.self_check();
        Ok(WithdrawalSuccess {
            kusd_withdrawn: amount,
            coll_gain: gain,
        })
    }

    /// Moves the caller's whole collateral gain into their trove.
    pub fn withdraw_coll_gain_to_trove<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        upper_hint: Option<Principal>,
        lower_hint: Option<Principal>,
    ) -> Result<COLL, ProtocolError> {
        let price = host.current_price();
        let s = &self.state;
        if s.stability_pool.deposit(&caller).is_none() {
            return Err(StateError::NoDeposit.into());
        }
        let entire = s
            .entire_debt_and_coll(&caller)
            .ok_or(StateError::TroveNotActive)?;
        let gain = s.stability_pool.withdrawable_coll_gain(&caller);
        if gain.is_zero() {
            return Err(StateError::NoCollateralGain.into());
        }
        let new_coll = entire.coll + gain;
        let position = s.sorted_troves.find_insert_position_excluding(
            compute_nominal_cr(new_coll, entire.debt),
            upper_hint,
            lower_hint,
            &s.ledger_view(),
            &BTreeSet::from([caller]),
        )?;

        let (gain, pending_coll, pending_debt) =
            record_withdraw_coll_gain_to_trove(&self.events, &mut self.state, caller, position);
        management::apply_pending_rewards(host, pending_coll, pending_debt);
        management::move_pool_collateral(host, CollateralPool::StabilityPool, CollateralPool::Active, gain);

        log!(
            INFO,
            "[withdraw_coll_gain_to_trove] {} moved {} collateral into its trove (ICR {})",
            caller,
            gain,
            compute_collateral_ratio(new_coll, entire.debt, price)
        );
        self.self_check();
        Ok(gain)
    }
}
