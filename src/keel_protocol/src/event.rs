use crate::config::ProtocolConfig;
use crate::gate::Delta;
use crate::liquidation::{LiquidationCandidates, LiquidationPlan};
use crate::numeric::{Ratio, UsdColl, COLL, KUSD};
use crate::redemption::{RedeemArg, RedemptionPlan};
use crate::sorted_troves::InsertPosition;
use crate::state::State;
use crate::storage::EventLog;
use crate::InitArg;
use candid::Principal;
use serde::{Deserialize, Serialize};

/// A committed operation with every input it resolved against the host
/// (price, time, list position), so that replay never needs one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "init")]
    Init(InitArg),

    #[serde(rename = "open_trove")]
    OpenTrove {
        owner: Principal,
        coll: COLL,
        /// Composite debt: drawn amount, fee and gas compensation.
        debt: KUSD,
        /// New base rate; absent when no fee was charged.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_rate: Option<Ratio>,
        timestamp: u64,
        position: InsertPosition,
    },

    #[serde(rename = "adjust_trove")]
    AdjustTrove {
        owner: Principal,
        coll_change: Delta<COLL>,
        /// Includes the fee on a debt increase.
        debt_change: Delta<KUSD>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_rate: Option<Ratio>,
        timestamp: u64,
        position: InsertPosition,
    },

    #[serde(rename = "close_trove")]
    CloseTrove { owner: Principal },

    #[serde(rename = "claim_collateral")]
    ClaimCollateral { owner: Principal },

    #[serde(rename = "liquidate")]
    Liquidate {
        liquidator: Principal,
        price: UsdColl,
        /// The troves actually liquidated, in order.
        troves: Vec<Principal>,
    },

    #[serde(rename = "redeem")]
    Redeem {
        redeemer: Principal,
        price: UsdColl,
        timestamp: u64,
        arg: RedeemArg,
    },

    #[serde(rename = "provide_to_stability_pool")]
    ProvideToStabilityPool { depositor: Principal, amount: KUSD },

    #[serde(rename = "withdraw_from_stability_pool")]
    WithdrawFromStabilityPool { depositor: Principal, amount: KUSD },

    #[serde(rename = "withdraw_coll_gain_to_trove")]
    WithdrawCollGainToTrove {
        depositor: Principal,
        position: InsertPosition,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReplayLogError {
    /// There are no events in the event log.
    EmptyLog,
    /// The event log is inconsistent.
    InconsistentLog(String),
}

pub fn replay(mut events: impl Iterator<Item = Event>) -> Result<State, ReplayLogError> {
    let mut state = match events.next() {
        Some(Event::Init(arg)) => {
            let config = ProtocolConfig::try_from(arg).map_err(|err| {
                ReplayLogError::InconsistentLog(format!("invalid init arguments: {}", err))
            })?;
            State::new(config)
        }
        Some(evt) => {
            return Err(ReplayLogError::InconsistentLog(format!(
                "The first event is not Init: {:?}",
                evt
            )))
        }
        None => return Err(ReplayLogError::EmptyLog),
    };
    for event in events {
        match event {
            Event::Init(_) => {
                return Err(ReplayLogError::InconsistentLog(
                    "Init recorded twice".to_string(),
                ))
            }
            Event::OpenTrove {
                owner,
                coll,
                debt,
                base_rate,
                timestamp,
                position,
            } => state.apply_open_trove(owner, coll, debt, base_rate, timestamp, position),
            Event::AdjustTrove {
                owner,
                coll_change,
                debt_change,
                base_rate,
                timestamp,
                position,
            } => state.apply_adjust_trove(owner, coll_change, debt_change, base_rate, timestamp, position),
            Event::CloseTrove { owner } => {
                state.apply_close_trove(owner);
            }
            Event::ClaimCollateral { owner } => {
                state.take_coll_surplus(&owner);
            }
            Event::Liquidate {
                liquidator: _,
                price,
                troves,
            } => {
                let plan = state.plan_liquidation(LiquidationCandidates::Batch(&troves), price);
                if plan.liquidated_owners() != troves {
                    return Err(ReplayLogError::InconsistentLog(format!(
                        "liquidation of {:?} at {} replays as {:?}",
                        troves,
                        price,
                        plan.liquidated_owners()
                    )));
                }
                state.apply_liquidation_plan(&plan);
            }
            Event::Redeem {
                redeemer,
                price,
                timestamp,
                arg,
            } => {
                let plan = state.plan_redemption(&arg, price, timestamp).map_err(|err| {
                    ReplayLogError::InconsistentLog(format!(
                        "redemption by {} no longer plans: {}",
                        redeemer, err
                    ))
                })?;
                state.apply_redemption_plan(&plan, timestamp);
            }
            Event::ProvideToStabilityPool { depositor, amount } => {
                state.stability_pool.provide(depositor, amount);
            }
            Event::WithdrawFromStabilityPool { depositor, amount } => {
                state.stability_pool.withdraw(depositor, amount);
            }
            Event::WithdrawCollGainToTrove {
                depositor,
                position,
            } => {
                state.apply_withdraw_coll_gain_to_trove(depositor, position);
            }
        }
    }
    Ok(state)
}

pub fn record_init(events: &EventLog, arg: InitArg) {
    events.record(&Event::Init(arg));
}

pub fn record_open_trove(
    events: &EventLog,
    state: &mut State,
    owner: Principal,
    coll: COLL,
    debt: KUSD,
    base_rate: Option<Ratio>,
    timestamp: u64,
    position: InsertPosition,
) {
    events.record(&Event::OpenTrove {
        owner,
        coll,
        debt,
        base_rate,
        timestamp,
        position,
    });
    state.apply_open_trove(owner, coll, debt, base_rate, timestamp, position);
}

pub fn record_adjust_trove(
    events: &EventLog,
    state: &mut State,
    owner: Principal,
    coll_change: Delta<COLL>,
    debt_change: Delta<KUSD>,
    base_rate: Option<Ratio>,
    timestamp: u64,
    position: InsertPosition,
) {
    events.record(&Event::AdjustTrove {
        owner,
        coll_change,
        debt_change,
        base_rate,
        timestamp,
        position,
    });
    state.apply_adjust_trove(owner, coll_change, debt_change, base_rate, timestamp, position);
}

pub fn record_close_trove(events: &EventLog, state: &mut State, owner: Principal) -> (COLL, KUSD) {
    events.record(&Event::CloseTrove { owner });
    state.apply_close_trove(owner)
}

pub fn record_claim_collateral(events: &EventLog, state: &mut State, owner: Principal) -> COLL {
    events.record(&Event::ClaimCollateral { owner });
    state.take_coll_surplus(&owner)
}

pub fn record_liquidate(
    events: &EventLog,
    state: &mut State,
    liquidator: Principal,
    price: UsdColl,
    plan: &LiquidationPlan,
) {
    events.record(&Event::Liquidate {
        liquidator,
        price,
        troves: plan.liquidated_owners(),
    });
    state.apply_liquidation_plan(plan);
}

pub fn record_redeem(
    events: &EventLog,
    state: &mut State,
    redeemer: Principal,
    price: UsdColl,
    timestamp: u64,
    arg: RedeemArg,
    plan: &RedemptionPlan,
) {
    events.record(&Event::Redeem {
        redeemer,
        price,
        timestamp,
        arg,
    });
    state.apply_redemption_plan(plan, timestamp);
}

pub fn record_provide_to_stability_pool(
    events: &EventLog,
    state: &mut State,
    depositor: Principal,
    amount: KUSD,
) -> COLL {
    events.record(&Event::ProvideToStabilityPool { depositor, amount });
    state.stability_pool.provide(depositor, amount)
}

pub fn record_withdraw_from_stability_pool(
    events: &EventLog,
    state: &mut State,
    depositor: Principal,
    amount: KUSD,
) -> COLL {
    events.record(&Event::WithdrawFromStabilityPool { depositor, amount });
    state.stability_pool.withdraw(depositor, amount)
}

pub fn record_withdraw_coll_gain_to_trove(
    events: &EventLog,
    state: &mut State,
    depositor: Principal,
    position: InsertPosition,
) -> (COLL, COLL, KUSD) {
    events.record(&Event::WithdrawCollGainToTrove {
        depositor,
        position,
    });
    state.apply_withdraw_coll_gain_to_trove(depositor, position)
}
