//! Redemption of KUSD for collateral at face value, starting from the
//! lowest-ratio trove that is at or above the minimum collateral ratio.

use crate::event::record_redeem;
use crate::fees::require_user_accepts_fee;
use crate::logs::{DEBUG, INFO};
use crate::management::{
    self, burn_from_user, require_kusd_balance, CollateralAccount, CollateralPool, DebtChange,
    Host, LedgerAccount,
};
use crate::numeric::{compute_collateral_ratio, compute_nominal_cr, Nicr, Ratio, UsdColl, COLL, KUSD};
use crate::sorted_troves::InsertPosition;
use crate::state::{State, TroveStatus};
use crate::{InvariantViolation, Protocol, ProtocolError, StateError, ValidationError};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemArg {
    pub kusd_amount: KUSD,
    pub first_redemption_hint: Option<Principal>,
    pub upper_partial_redemption_hint: Option<Principal>,
    pub lower_partial_redemption_hint: Option<Principal>,
    /// NICR the partially redeemed trove is expected to end at. A mismatch
    /// cancels the partial redemption.
    pub partial_redemption_hint_nicr: Nicr,
    /// Zero means no limit.
    pub max_iterations: u32,
    pub max_fee_percentage: Ratio,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemedTrove {
    pub owner: Principal,
    pub pending_coll: COLL,
    pub pending_debt: KUSD,
    pub kusd_lot: KUSD,
    pub coll_lot: COLL,
    pub new_coll: COLL,
    pub new_debt: KUSD,
    /// Only the gas compensation was left; the trove is closed and its
    /// remaining collateral becomes a claimable surplus.
    pub closed: bool,
    pub position: InsertPosition,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionPlan {
    pub price: UsdColl,
    pub redeemed: Vec<RedeemedTrove>,
    pub total_kusd: KUSD,
    /// Collateral drawn, fee included.
    pub total_coll: COLL,
    pub coll_fee: COLL,
    pub base_rate: Ratio,
}

impl RedemptionPlan {
    pub fn closed_troves(&self) -> impl Iterator<Item = &RedeemedTrove> {
        self.redeemed.iter().filter(|trove| trove.closed)
    }
}

impl State {
    /// A first hint is usable when it is at or above MCR and the trove below
    /// it is not.
    pub fn is_valid_first_redemption_hint(&self, hint: Option<Principal>, price: UsdColl) -> bool {
        let hint = match hint {
            Some(hint) if self.is_active(&hint) => hint,
            _ => return false,
        };
        if self.current_icr(&hint, price) < self.config.minimum_collateral_ratio {
            return false;
        }
        match self.sorted_troves.next(&hint) {
            Some(next) => self.current_icr(&next, price) < self.config.minimum_collateral_ratio,
            None => true,
        }
    }

    /// The lowest trove at or above MCR, looking at no more than
    /// `max_hint_walk` troves from the tail. Past that bound the caller must
    /// supply a valid first redemption hint.
    pub fn first_redemption_candidate(
        &self,
        price: UsdColl,
    ) -> Result<Option<Principal>, ValidationError> {
        for (walked, owner) in self.sorted_troves.iter_from_tail().enumerate() {
            if walked as u64 >= self.config.max_hint_walk as u64 {
                return Err(ValidationError::HintOutOfRange);
            }
            if self.current_icr(&owner, price) >= self.config.minimum_collateral_ratio {
                return Ok(Some(owner));
            }
        }
        Ok(None)
    }

    pub fn plan_redemption(
        &self,
        arg: &RedeemArg,
        price: UsdColl,
        now_seconds: u64,
    ) -> Result<RedemptionPlan, ProtocolError> {
        let config = &self.config;
        if arg.kusd_amount.is_zero() {
            return Err(ValidationError::ZeroAmount.into());
        }
        if arg.max_fee_percentage < config.redemption_fee_floor || arg.max_fee_percentage > Ratio::ONE {
            return Err(ValidationError::MaxFeeOutOfRange {
                max_fee: arg.max_fee_percentage,
                floor: config.redemption_fee_floor,
            }
            .into());
        }
        let tcr = self.total_collateral_ratio(price);
        if tcr < config.minimum_collateral_ratio {
            return Err(InvariantViolation::TcrBelowMcr { tcr }.into());
        }

        let mut current = if self.is_valid_first_redemption_hint(arg.first_redemption_hint, price) {
            arg.first_redemption_hint
        } else {
            self.first_redemption_candidate(price)?
        };

        let mut remaining = arg.kusd_amount;
        let mut redeemed: Vec<RedeemedTrove> = vec![];
        let mut closed = BTreeSet::new();
        let mut active_troves = self.trove_owners_count();
        let view = self.ledger_view();

        while let Some(owner) = current {
            if remaining.is_zero()
                || (arg.max_iterations != 0 && redeemed.len() as u64 >= arg.max_iterations as u64)
            {
                break;
            }
            let next = self.sorted_troves.prev(&owner);
            let entire = match self.entire_debt_and_coll(&owner) {
                Some(entire) => entire,
                None => panic!("bug: listed trove {} is not active", owner),
            };

            let kusd_lot = remaining.min(entire.debt - config.gas_compensation);
            let coll_lot = (kusd_lot / price).min(entire.coll);
            let new_debt = entire.debt - kusd_lot;
            let new_coll = entire.coll - coll_lot;

            let mut step = RedeemedTrove {
                owner,
                pending_coll: entire.pending_coll,
                pending_debt: entire.pending_debt,
                kusd_lot,
                coll_lot,
                new_coll,
                new_debt,
                closed: false,
                position: InsertPosition::default(),
            };

            if new_debt == config.gas_compensation {
                if active_troves <= 1 {
                    log!(DEBUG, "[redeem] stopping before closing the last trove {}", owner);
                    break;
                }
                step.closed = true;
                closed.insert(owner);
                active_troves -= 1;
            } else {
                let new_nicr = compute_nominal_cr(new_coll, new_debt);
                if new_nicr != arg.partial_redemption_hint_nicr
                    || new_debt - config.gas_compensation < config.min_net_debt
                {
                    log!(
                        DEBUG,
                        "[redeem] partial redemption of {} cancelled (NICR {} vs hint {})",
                        owner,
                        new_nicr,
                        arg.partial_redemption_hint_nicr
                    );
                    break;
                }
                let mut excluded = closed.clone();
                excluded.insert(owner);
                step.position = self.sorted_troves.find_insert_position_excluding(
                    new_nicr,
                    arg.upper_partial_redemption_hint,
                    arg.lower_partial_redemption_hint,
                    &view,
                    &excluded,
                )?;
            }

            remaining -= kusd_lot;
            redeemed.push(step);
            current = next;
        }

        let total_kusd: KUSD = redeemed.iter().map(|step| step.kusd_lot).sum();
        let total_coll: COLL = redeemed.iter().map(|step| step.coll_lot).sum();
        if total_kusd.is_zero() {
            return Err(StateError::UnableToRedeem.into());
        }

        let base_rate = self.base_rate_after_redemption(total_kusd, self.entire_system_debt(), now_seconds);
        let coll_fee = total_coll * self.redemption_rate_with(base_rate);
        if !total_coll.is_zero() {
            require_user_accepts_fee(coll_fee / total_coll, arg.max_fee_percentage)?;
        }

        Ok(RedemptionPlan {
            price,
            redeemed,
            total_kusd,
            total_coll,
            coll_fee,
            base_rate,
        })
    }

    pub(crate) fn apply_redemption_plan(&mut self, plan: &RedemptionPlan, now_seconds: u64) {
        for step in &plan.redeemed {
            self.apply_pending_rewards(&step.owner);
            if step.closed {
                self.active_pool.coll -= step.coll_lot + step.new_coll;
                self.active_pool.debt -= step.new_debt + step.kusd_lot;
                self.gas_pool -= self.config.gas_compensation;
                self.close_trove(&step.owner, TroveStatus::ClosedByRedemption);
                self.add_coll_surplus(step.owner, step.new_coll);
            } else {
                self.set_trove_amounts(&step.owner, step.new_coll, step.new_debt, step.position);
            }
        }
        self.set_base_rate(plan.base_rate, now_seconds);
    }
}

impl Protocol {
    pub fn redeem_collateral<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        arg: RedeemArg,
    ) -> Result<RedemptionPlan, ProtocolError> {
        let price = host.current_price();
        let now = host.now_seconds();
        require_kusd_balance(host, caller, arg.kusd_amount)?;
        let plan = self.state.plan_redemption(&arg, price, now)?;

        burn_from_user(host, caller, plan.total_kusd)?;
        record_redeem(&self.events, &mut self.state, caller, price, now, arg, &plan);

        let gas_compensation = self.state.config.gas_compensation;
        let mut surplus = COLL::ZERO;
        let mut burnt_gas = KUSD::ZERO;
        for step in &plan.redeemed {
            management::apply_pending_rewards(host, step.pending_coll, step.pending_debt);
            if step.closed {
                surplus += step.new_coll;
                burnt_gas += gas_compensation;
            }
        }
        management::burn(host, LedgerAccount::GasPool, burnt_gas);
        management::record_debt(
            host,
            CollateralPool::Active,
            DebtChange::Decrease(plan.total_kusd + burnt_gas),
        );
        management::move_pool_collateral(host, CollateralPool::Active, CollateralPool::CollSurplus, surplus);
        management::pay_coll_fee(host, CollateralPool::Active, plan.coll_fee);
        management::move_collateral(
            host,
            CollateralAccount::Pool(CollateralPool::Active),
            CollateralAccount::User(caller),
            plan.total_coll - plan.coll_fee,
        );

        log!(
            INFO,
            "[redeem] {} redeemed {} KUSD from {} trove(s) for {} collateral (fee {}), TCR {}",
            caller,
            plan.total_kusd,
            plan.redeemed.len(),
            plan.total_coll - plan.coll_fee,
            plan.coll_fee,
            compute_collateral_ratio(
                self.state.entire_system_coll(),
                self.state.entire_system_debt(),
                price
            )
        );
        self.self_check();
        Ok(plan)
    }
}
