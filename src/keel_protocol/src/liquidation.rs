//! Liquidation of troves below the minimum collateral ratio, and in
//! Recovery Mode of troves below the critical ratio.
//!
//! A liquidation is planned against the current state without mutating it:
//! every candidate is judged under the mode the system would be in after the
//! liquidations planned before it. The plan is then committed in one step:
//! one Stability Pool offset, one redistribution, one snapshot update.

use crate::event::record_liquidate;
use crate::logs::{DEBUG, INFO};
use crate::management::{
    self, CollateralAccount, CollateralPool, DebtChange, Host, LedgerAccount,
};
use crate::numeric::{compute_collateral_ratio, Ratio, UsdColl, COLL, KUSD};
use crate::state::{EntireTrove, Mode, State, TroveStatus};
use crate::{Protocol, ProtocolError, StateError, ValidationError};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which troves a liquidation considers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiquidationCandidates<'a> {
    /// Up to `n` troves from the bottom of the list, stopping at the first
    /// one that cannot be liquidated.
    Sequence(u64),
    /// The given troves in order; ineligible ones are skipped.
    Batch(&'a [Principal]),
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationKind {
    /// ICR below MCR: offset against the Stability Pool, rest redistributed.
    Normal,
    /// Recovery Mode, ICR between MCR and CCR: the Stability Pool absorbs
    /// the whole debt for collateral worth `capped_liquidation_ratio` of it
    /// and the owner keeps the rest as a claimable surplus.
    Capped,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleLiquidation {
    pub owner: Principal,
    pub kind: LiquidationKind,
    pub mode: Mode,
    pub icr: Ratio,
    /// Collateral including pending rewards.
    pub entire_coll: COLL,
    /// Debt including pending rewards and the gas compensation.
    pub entire_debt: KUSD,
    pub pending_coll: COLL,
    pub pending_debt: KUSD,
    pub coll_gas_compensation: COLL,
    pub kusd_gas_compensation: KUSD,
    pub debt_to_offset: KUSD,
    pub coll_to_send_to_sp: COLL,
    pub debt_to_redistribute: KUSD,
    pub coll_to_redistribute: COLL,
    pub coll_surplus: COLL,
}

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationTotals {
    pub coll_in_sequence: COLL,
    pub debt_in_sequence: KUSD,
    pub coll_gas_compensation: COLL,
    pub kusd_gas_compensation: KUSD,
    pub debt_to_offset: KUSD,
    pub coll_to_send_to_sp: COLL,
    pub debt_to_redistribute: KUSD,
    pub coll_to_redistribute: COLL,
    pub coll_surplus: COLL,
}

impl LiquidationTotals {
    fn add(&mut self, single: &SingleLiquidation) {
        self.coll_in_sequence += single.entire_coll;
        self.debt_in_sequence += single.entire_debt;
        self.coll_gas_compensation += single.coll_gas_compensation;
        self.kusd_gas_compensation += single.kusd_gas_compensation;
        self.debt_to_offset += single.debt_to_offset;
        self.coll_to_send_to_sp += single.coll_to_send_to_sp;
        self.debt_to_redistribute += single.debt_to_redistribute;
        self.coll_to_redistribute += single.coll_to_redistribute;
        self.coll_surplus += single.coll_surplus;
    }
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationPlan {
    pub price: UsdColl,
    pub liquidations: Vec<SingleLiquidation>,
    pub totals: LiquidationTotals,
}

impl LiquidationPlan {
    pub fn is_empty(&self) -> bool {
        self.liquidations.is_empty()
    }

    pub fn liquidated_owners(&self) -> Vec<Principal> {
        self.liquidations.iter().map(|single| single.owner).collect()
    }
}

// System totals and Stability Pool deposits as they would be after the
// liquidations planned so far.
struct RunningTotals {
    system_coll: COLL,
    system_debt: KUSD,
    sp_deposits: KUSD,
    active_troves: u64,
}

impl RunningTotals {
    fn mode(&self, price: UsdColl, critical_ratio: Ratio) -> Mode {
        if compute_collateral_ratio(self.system_coll, self.system_debt, price) < critical_ratio {
            Mode::Recovery
        } else {
            Mode::Normal
        }
    }

    // Redistributed amounts stay in the system.
    fn remove(&mut self, single: &SingleLiquidation) {
        self.system_coll -= single.coll_to_send_to_sp + single.coll_gas_compensation + single.coll_surplus;
        self.system_debt -= single.debt_to_offset;
        self.sp_deposits -= single.debt_to_offset;
        self.active_troves -= 1;
    }
}

impl State {
    /// Plans the liquidation of `candidates` at `price`.
    pub fn plan_liquidation(&self, candidates: LiquidationCandidates<'_>, price: UsdColl) -> LiquidationPlan {
        let mut running = RunningTotals {
            system_coll: self.entire_system_coll(),
            system_debt: self.entire_system_debt(),
            sp_deposits: self.stability_pool.total_deposits(),
            active_troves: self.trove_owners_count(),
        };
        let mut plan = LiquidationPlan {
            price,
            liquidations: vec![],
            totals: LiquidationTotals::default(),
        };

        let (ids, stop_at_first_ineligible): (Vec<Principal>, bool) = match candidates {
            LiquidationCandidates::Sequence(n) => (
                self.sorted_troves
                    .iter_from_tail()
                    .take(n.min(usize::MAX as u64) as usize)
                    .collect(),
                true,
            ),
            LiquidationCandidates::Batch(ids) => (ids.to_vec(), false),
        };

        let mut seen = BTreeSet::new();
        for owner in ids {
            if running.active_troves <= 1 {
                log!(DEBUG, "[liquidate] stopping: the last trove is never liquidated");
                break;
            }
            let entire = match self.entire_debt_and_coll(&owner) {
                Some(entire) if seen.insert(owner) => entire,
                _ => {
                    log!(DEBUG, "[liquidate] skipping {}: not an active trove", owner);
                    continue;
                }
            };
            let mode = running.mode(price, self.config.critical_collateral_ratio);
            match self.plan_single_liquidation(owner, entire, mode, price, running.sp_deposits) {
                Some(single) => {
                    running.remove(&single);
                    plan.totals.add(&single);
                    plan.liquidations.push(single);
                }
                None if stop_at_first_ineligible => break,
                None => (),
            }
        }
        plan
    }

    fn plan_single_liquidation(
        &self,
        owner: Principal,
        entire: EntireTrove,
        mode: Mode,
        price: UsdColl,
        sp_deposits: KUSD,
    ) -> Option<SingleLiquidation> {
        let config = &self.config;
        let icr = compute_collateral_ratio(entire.coll, entire.debt, price);

        let mut single = SingleLiquidation {
            owner,
            kind: LiquidationKind::Normal,
            mode,
            icr,
            entire_coll: entire.coll,
            entire_debt: entire.debt,
            pending_coll: entire.pending_coll,
            pending_debt: entire.pending_debt,
            coll_gas_compensation: COLL::ZERO,
            kusd_gas_compensation: config.gas_compensation,
            debt_to_offset: KUSD::ZERO,
            coll_to_send_to_sp: COLL::ZERO,
            debt_to_redistribute: KUSD::ZERO,
            coll_to_redistribute: COLL::ZERO,
            coll_surplus: COLL::ZERO,
        };

        if icr < config.minimum_collateral_ratio {
            single.coll_gas_compensation = COLL::new(entire.coll.raw() / config.percent_divisor);
            let coll_to_liquidate = entire.coll - single.coll_gas_compensation;
            single.debt_to_offset = entire.debt.min(sp_deposits);
            single.coll_to_send_to_sp =
                coll_to_liquidate.mul_div(single.debt_to_offset.raw(), entire.debt.raw());
            single.debt_to_redistribute = entire.debt - single.debt_to_offset;
            single.coll_to_redistribute = coll_to_liquidate - single.coll_to_send_to_sp;
            return Some(single);
        }

        if mode == Mode::Recovery
            && icr < config.critical_collateral_ratio
            && entire.debt <= sp_deposits
        {
            let capped = (entire.debt * config.capped_liquidation_ratio) / price;
            let seized = capped.min(entire.coll);
            single.kind = LiquidationKind::Capped;
            single.coll_gas_compensation = COLL::new(seized.raw() / config.percent_divisor);
            single.debt_to_offset = entire.debt;
            single.coll_to_send_to_sp = seized - single.coll_gas_compensation;
            single.coll_surplus = entire.coll - seized;
            return Some(single);
        }

        log!(
            DEBUG,
            "[liquidate] {} is not liquidatable in {} Mode (ICR {})",
            owner,
            mode,
            icr
        );
        None
    }

    pub(crate) fn apply_liquidation_plan(&mut self, plan: &LiquidationPlan) {
        for single in &plan.liquidations {
            self.apply_pending_rewards(&single.owner);
            // Redistributed amounts leave the active pool in the
            // redistribution below, the gas compensation after the snapshot.
            self.active_pool.coll -= single.coll_to_send_to_sp + single.coll_surplus;
            self.active_pool.debt -= single.debt_to_offset;
            self.gas_pool -= single.kusd_gas_compensation;
            self.close_trove(&single.owner, TroveStatus::ClosedByLiquidation);
            self.add_coll_surplus(single.owner, single.coll_surplus);
        }

        let totals = &plan.totals;
        self.stability_pool
            .offset(totals.debt_to_offset, totals.coll_to_send_to_sp);
        self.redistribute_debt_and_coll(totals.debt_to_redistribute, totals.coll_to_redistribute);
        self.update_system_snapshots_excluding_coll_remainder(totals.coll_gas_compensation);
        self.active_pool.coll -= totals.coll_gas_compensation;
    }
}

impl Protocol {
    pub fn liquidate<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        borrower: Principal,
    ) -> Result<LiquidationPlan, ProtocolError> {
        if !self.state.is_active(&borrower) {
            return Err(StateError::TroveNotActive.into());
        }
        self.execute_liquidation(host, caller, LiquidationCandidates::Batch(&[borrower]))
    }

    /// Liquidates up to `n` of the lowest-ratio troves.
    pub fn liquidate_troves<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        n: u64,
    ) -> Result<LiquidationPlan, ProtocolError> {
        self.execute_liquidation(host, caller, LiquidationCandidates::Sequence(n))
    }

    pub fn batch_liquidate_troves<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        troves: &[Principal],
    ) -> Result<LiquidationPlan, ProtocolError> {
        if troves.is_empty() {
            return Err(ValidationError::EmptyTroveList.into());
        }
        self.execute_liquidation(host, caller, LiquidationCandidates::Batch(troves))
    }

    fn execute_liquidation<H: Host>(
        &mut self,
        host: &mut H,
        liquidator: Principal,
        candidates: LiquidationCandidates<'_>,
    ) -> Result<LiquidationPlan, ProtocolError> {
        let price = host.current_price();
        let mode_before = self.state.mode(price);
        let plan = self.state.plan_liquidation(candidates, price);
        if plan.is_empty() {
            return Err(StateError::NothingToLiquidate.into());
        }

        record_liquidate(&self.events, &mut self.state, liquidator, price, &plan);

        for single in &plan.liquidations {
            management::apply_pending_rewards(host, single.pending_coll, single.pending_debt);
        }
        let totals = &plan.totals;
        management::record_debt(
            host,
            CollateralPool::Active,
            DebtChange::Decrease(totals.debt_to_offset),
        );
        management::burn(host, LedgerAccount::StabilityPool, totals.debt_to_offset);
        management::move_pool_collateral(
            host,
            CollateralPool::Active,
            CollateralPool::StabilityPool,
            totals.coll_to_send_to_sp,
        );
        management::move_pool_collateral(
            host,
            CollateralPool::Active,
            CollateralPool::Default,
            totals.coll_to_redistribute,
        );
        management::shift_debt(
            host,
            CollateralPool::Active,
            CollateralPool::Default,
            totals.debt_to_redistribute,
        );
        management::move_pool_collateral(
            host,
            CollateralPool::Active,
            CollateralPool::CollSurplus,
            totals.coll_surplus,
        );
        management::transfer(
            host,
            LedgerAccount::GasPool,
            LedgerAccount::User(liquidator),
            totals.kusd_gas_compensation,
        );
        management::move_collateral(
            host,
            CollateralAccount::Pool(CollateralPool::Active),
            CollateralAccount::User(liquidator),
            totals.coll_gas_compensation,
        );

        let mode_after = self.state.mode(price);
        if mode_after != mode_before {
            log!(DEBUG, "[liquidate] system moved from {} to {} Mode", mode_before, mode_after);
        }
        log!(
            INFO,
            "[liquidate] {} liquidated {} trove(s) at price {}: offset {} KUSD, redistributed {} KUSD, surplus {} collateral",
            liquidator,
            plan.liquidations.len(),
            price,
            totals.debt_to_offset,
            totals.debt_to_redistribute,
            totals.coll_surplus
        );
        self.self_check();
        Ok(plan)
    }
}
