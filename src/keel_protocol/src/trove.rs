//! Borrower operations: open, adjust and close a trove, and claim the
//! collateral surplus a liquidation or redemption left behind.

use crate::event::{
    record_adjust_trove, record_claim_collateral, record_close_trove, record_open_trove,
};
use crate::fees::{require_user_accepts_fee, validate_max_fee_percentage};
use crate::gate::{check_adjustment, check_close_trove, check_open_trove, new_tcr_from_trove_change, Adjustment, Delta};
use crate::logs::INFO;
use crate::management::{
    self, burn_from_user, pull_collateral, require_collateral_balance, require_kusd_balance,
    CollateralAccount, CollateralPool, DebtChange, Host, LedgerAccount,
};
use crate::numeric::{compute_collateral_ratio, compute_nominal_cr, Ratio, COLL, KUSD};
use crate::sorted_troves::InsertPosition;
use crate::state::{Mode, State, TroveStatus};
use crate::{Protocol, ProtocolError, StateError, ValidationError};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTroveArg {
    pub max_fee_percentage: Ratio,
    pub coll: COLL,
    /// Amount drawn; the fee and the gas compensation come on top.
    pub kusd_amount: KUSD,
    /// Expected neighbour with a higher NICR.
    pub upper_hint: Option<Principal>,
    /// Expected neighbour with a lower NICR.
    pub lower_hint: Option<Principal>,
}

#[derive(CandidType, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustTroveArg {
    pub max_fee_percentage: Ratio,
    pub coll_deposit: COLL,
    pub coll_withdrawal: COLL,
    pub kusd_change: KUSD,
    pub is_debt_increase: bool,
    pub upper_hint: Option<Principal>,
    pub lower_hint: Option<Principal>,
}

/// Amounts of a trove after a borrower operation.
#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroveUpdate {
    pub coll: COLL,
    pub debt: KUSD,
    pub fee: KUSD,
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseTroveSuccess {
    pub coll_returned: COLL,
    pub debt_repaid: KUSD,
}

impl State {
    fn recorded_amounts(&self, owner: &Principal) -> (COLL, KUSD) {
        match self.trove(owner) {
            Some(trove) => (trove.coll, trove.debt),
            None => panic!("bug: no trove for {}", owner),
        }
    }

    pub(crate) fn apply_open_trove(
        &mut self,
        owner: Principal,
        coll: COLL,
        debt: KUSD,
        base_rate: Option<Ratio>,
        timestamp: u64,
        position: InsertPosition,
    ) {
        if let Some(base_rate) = base_rate {
            self.set_base_rate(base_rate, timestamp);
        }
        self.insert_trove(owner, coll, debt, position);
    }

    pub(crate) fn apply_adjust_trove(
        &mut self,
        owner: Principal,
        coll_change: Delta<COLL>,
        debt_change: Delta<KUSD>,
        base_rate: Option<Ratio>,
        timestamp: u64,
        position: InsertPosition,
    ) {
        if let Some(base_rate) = base_rate {
            self.set_base_rate(base_rate, timestamp);
        }
        self.apply_pending_rewards(&owner);
        let (coll, debt) = self.recorded_amounts(&owner);
        self.set_trove_amounts(
            &owner,
            coll_change.apply_to(coll),
            debt_change.apply_to(debt),
            position,
        );
    }

    /// Returns the collateral and composite debt the trove held.
    pub(crate) fn apply_close_trove(&mut self, owner: Principal) -> (COLL, KUSD) {
        self.apply_pending_rewards(&owner);
        let (coll, debt) = self.recorded_amounts(&owner);
        self.active_pool.coll -= coll;
        self.active_pool.debt -= debt;
        self.gas_pool -= self.config.gas_compensation;
        self.close_trove(&owner, TroveStatus::ClosedByOwner);
        (coll, debt)
    }
}

impl Protocol {
    pub fn open_trove<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        arg: OpenTroveArg,
    ) -> Result<TroveUpdate, ProtocolError> {
        let price = host.current_price();
        let now = host.now_seconds();
        let s = &self.state;
        let mode = s.mode(price);

        validate_max_fee_percentage(mode, arg.max_fee_percentage, s.config.borrowing_fee_floor)?;
        if s.is_active(&caller) {
            return Err(StateError::TroveAlreadyActive.into());
        }
        if arg.coll.is_zero() {
            return Err(ValidationError::ZeroAmount.into());
        }
        if s.sorted_troves.is_full() {
            return Err(ValidationError::ListFull.into());
        }

        let fee = s.borrowing_fee(mode, arg.kusd_amount, now);
        if !fee.is_zero() {
            require_user_accepts_fee(fee / arg.kusd_amount, arg.max_fee_percentage)?;
        }
        let net_debt = arg.kusd_amount + fee;
        if net_debt < s.config.min_net_debt {
            return Err(ValidationError::NetDebtBelowMinimum {
                net_debt,
                minimum: s.config.min_net_debt,
            }
            .into());
        }
        let composite_debt = net_debt + s.config.gas_compensation;

        let icr = compute_collateral_ratio(arg.coll, composite_debt, price);
        let new_tcr = new_tcr_from_trove_change(
            s,
            Delta::Increase(arg.coll),
            Delta::Increase(composite_debt),
            price,
        );
        check_open_trove(mode, icr, new_tcr, &s.config)?;
        require_collateral_balance(host, caller, arg.coll)?;

        let nicr = compute_nominal_cr(arg.coll, composite_debt);
        let position = s.sorted_troves.find_insert_position(
            nicr,
            arg.upper_hint,
            arg.lower_hint,
            &s.ledger_view(),
        )?;
        let base_rate = match mode {
            Mode::Normal => Some(s.base_rate_after_borrowing(
                arg.kusd_amount,
                s.entire_system_debt() + composite_debt,
                now,
            )),
            Mode::Recovery => None,
        };

        pull_collateral(host, caller, CollateralPool::Active, arg.coll)?;

        record_open_trove(
            &self.events,
            &mut self.state,
            caller,
            arg.coll,
            composite_debt,
            base_rate,
            now,
            position,
        );

        management::record_debt(host, CollateralPool::Active, DebtChange::Increase(composite_debt));
        management::mint(host, LedgerAccount::User(caller), arg.kusd_amount);
        management::mint(host, LedgerAccount::GasPool, self.state.config.gas_compensation);
        management::pay_kusd_fee(host, fee);

        log!(
            INFO,
            "[open_trove] {} opened a trove with {} collateral and {} KUSD debt (fee {} KUSD, ICR {})",
            caller,
            arg.coll,
            composite_debt,
            fee,
            icr
        );
        self.self_check();
        Ok(TroveUpdate {
            coll: arg.coll,
            debt: composite_debt,
            fee,
        })
    }

    pub fn adjust_trove<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        arg: AdjustTroveArg,
    ) -> Result<TroveUpdate, ProtocolError> {
        let price = host.current_price();
        let now = host.now_seconds();
        let s = &self.state;
        let mode = s.mode(price);

        if !arg.coll_deposit.is_zero() && !arg.coll_withdrawal.is_zero() {
            return Err(ValidationError::SingularCollateralChange.into());
        }
        if arg.coll_deposit.is_zero() && arg.coll_withdrawal.is_zero() && arg.kusd_change.is_zero() {
            return Err(ValidationError::NoAdjustment.into());
        }
        let entire = s
            .entire_debt_and_coll(&caller)
            .ok_or(StateError::TroveNotActive)?;

        let coll_change = if arg.coll_deposit.is_zero() {
            Delta::Decrease(arg.coll_withdrawal)
        } else {
            Delta::Increase(arg.coll_deposit)
        };
        if arg.coll_withdrawal > entire.coll {
            return Err(ValidationError::WithdrawalExceedsCollateral {
                withdrawal: arg.coll_withdrawal,
                collateral: entire.coll,
            }
            .into());
        }

        let debt_increase = arg.is_debt_increase && !arg.kusd_change.is_zero();
        let (debt_change, fee) = if debt_increase {
            validate_max_fee_percentage(mode, arg.max_fee_percentage, s.config.borrowing_fee_floor)?;
            let fee = s.borrowing_fee(mode, arg.kusd_change, now);
            if !fee.is_zero() {
                require_user_accepts_fee(fee / arg.kusd_change, arg.max_fee_percentage)?;
            }
            (Delta::Increase(arg.kusd_change + fee), fee)
        } else {
            let repayable = entire.debt - s.config.gas_compensation;
            if arg.kusd_change > repayable {
                return Err(ValidationError::RepaymentExceedsDebt {
                    repayment: arg.kusd_change,
                    repayable,
                }
                .into());
            }
            (Delta::Decrease(arg.kusd_change), KUSD::ZERO)
        };

        let new_coll = coll_change.apply_to(entire.coll);
        let new_debt = debt_change.apply_to(entire.debt);
        if debt_change.is_decrease() {
            let net_debt = new_debt - s.config.gas_compensation;
            if net_debt < s.config.min_net_debt {
                return Err(ValidationError::NetDebtBelowMinimum {
                    net_debt,
                    minimum: s.config.min_net_debt,
                }
                .into());
            }
        }

        let old_icr = compute_collateral_ratio(entire.coll, entire.debt, price);
        let new_icr = compute_collateral_ratio(new_coll, new_debt, price);
        let new_tcr = new_tcr_from_trove_change(s, coll_change, debt_change, price);
        check_adjustment(
            mode,
            Adjustment {
                coll_withdrawal: coll_change.is_decrease(),
                debt_increase: debt_change.is_increase(),
            },
            old_icr,
            new_icr,
            new_tcr,
            &s.config,
        )?;
        if debt_change.is_decrease() {
            require_kusd_balance(host, caller, arg.kusd_change)?;
        }
        if coll_change.is_increase() {
            require_collateral_balance(host, caller, arg.coll_deposit)?;
        }

        let position = s.sorted_troves.find_insert_position_excluding(
            compute_nominal_cr(new_coll, new_debt),
            arg.upper_hint,
            arg.lower_hint,
            &s.ledger_view(),
            &BTreeSet::from([caller]),
        )?;
        let base_rate = match (mode, debt_increase) {
            (Mode::Normal, true) => Some(s.base_rate_after_borrowing(
                arg.kusd_change,
                s.entire_system_debt() + debt_change.amount(),
                now,
            )),
            _ => None,
        };

        pull_collateral(host, caller, CollateralPool::Active, arg.coll_deposit)?;
        if debt_change.is_decrease() {
            if let Err(err) = burn_from_user(host, caller, arg.kusd_change) {
                management::move_collateral(
                    host,
                    CollateralAccount::Pool(CollateralPool::Active),
                    CollateralAccount::User(caller),
                    arg.coll_deposit,
                );
                return Err(err);
            }
        }

        record_adjust_trove(
            &self.events,
            &mut self.state,
            caller,
            coll_change,
            debt_change,
            base_rate,
            now,
            position,
        );

        management::apply_pending_rewards(host, entire.pending_coll, entire.pending_debt);
        if coll_change.is_decrease() {
            management::move_collateral(
                host,
                CollateralAccount::Pool(CollateralPool::Active),
                CollateralAccount::User(caller),
                arg.coll_withdrawal,
            );
        }
        match debt_change {
            Delta::Increase(amount) => {
                management::record_debt(host, CollateralPool::Active, DebtChange::Increase(amount));
                management::mint(host, LedgerAccount::User(caller), arg.kusd_change);
                management::pay_kusd_fee(host, fee);
            }
            Delta::Decrease(amount) => {
                management::record_debt(host, CollateralPool::Active, DebtChange::Decrease(amount));
            }
        }

        log!(
            INFO,
            "[adjust_trove] {} adjusted its trove to {} collateral and {} KUSD debt (fee {} KUSD, ICR {} -> {})",
            caller,
            new_coll,
            new_debt,
            fee,
            old_icr,
            new_icr
        );
        self.self_check();
        Ok(TroveUpdate {
            coll: new_coll,
            debt: new_debt,
            fee,
        })
    }

    pub fn add_coll<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        amount: COLL,
        upper_hint: Option<Principal>,
        lower_hint: Option<Principal>,
    ) -> Result<TroveUpdate, ProtocolError> {
        self.adjust_trove(
            host,
            caller,
            AdjustTroveArg {
                coll_deposit: amount,
                upper_hint,
                lower_hint,
                ..Default::default()
            },
        )
    }

    pub fn withdraw_coll<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        amount: COLL,
        upper_hint: Option<Principal>,
        lower_hint: Option<Principal>,
    ) -> Result<TroveUpdate, ProtocolError> {
        self.adjust_trove(
            host,
            caller,
            AdjustTroveArg {
                coll_withdrawal: amount,
                upper_hint,
                lower_hint,
                ..Default::default()
            },
        )
    }

    /// Draws more debt against the trove.
    pub fn withdraw_kusd<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        max_fee_percentage: Ratio,
        amount: KUSD,
        upper_hint: Option<Principal>,
        lower_hint: Option<Principal>,
    ) -> Result<TroveUpdate, ProtocolError> {
        self.adjust_trove(
            host,
            caller,
            AdjustTroveArg {
                max_fee_percentage,
                kusd_change: amount,
                is_debt_increase: true,
                upper_hint,
                lower_hint,
                ..Default::default()
            },
        )
    }

    pub fn repay_kusd<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
        amount: KUSD,
        upper_hint: Option<Principal>,
        lower_hint: Option<Principal>,
    ) -> Result<TroveUpdate, ProtocolError> {
        self.adjust_trove(
            host,
            caller,
            AdjustTroveArg {
                kusd_change: amount,
                upper_hint,
                lower_hint,
                ..Default::default()
            },
        )
    }

    pub fn close_trove<H: Host>(
        &mut self,
        host: &mut H,
        caller: Principal,
    ) -> Result<CloseTroveSuccess, ProtocolError> {
        let price = host.current_price();
        let s = &self.state;
        let entire = s
            .entire_debt_and_coll(&caller)
            .ok_or(StateError::TroveNotActive)?;
        let new_tcr = new_tcr_from_trove_change(
            s,
            Delta::Decrease(entire.coll),
            Delta::Decrease(entire.debt),
            price,
        );
        check_close_trove(s.mode(price), s.trove_owners_count(), new_tcr, &s.config)?;

        let gas_compensation = s.config.gas_compensation;
        let repayment = entire.debt - gas_compensation;
        require_kusd_balance(host, caller, repayment)?;
        burn_from_user(host, caller, repayment)?;

        let (coll, debt) = record_close_trove(&self.events, &mut self.state, caller);

        management::apply_pending_rewards(host, entire.pending_coll, entire.pending_debt);
        management::burn(host, LedgerAccount::GasPool, gas_compensation);
        management::record_debt(host, CollateralPool::Active, DebtChange::Decrease(debt));
        management::move_collateral(
            host,
            CollateralAccount::Pool(CollateralPool::Active),
            CollateralAccount::User(caller),
            coll,
        );

        log!(
            INFO,
            "[close_trove] {} closed its trove, repaid {} KUSD and got back {} collateral",
            caller,
            repayment,
            coll
        );
        self.self_check();
        Ok(CloseTroveSuccess {
            coll_returned: coll,
            debt_repaid: repayment,
        })
    }

    /// Pays out the collateral a capped liquidation or a redemption left
    /// for the caller.
    pub fn claim_collateral<H: Host>(&mut self, host: &mut H, caller: Principal) -> Result<COLL, ProtocolError> {
        if self.state.coll_surplus_of(&caller).is_zero() {
            return Err(StateError::NothingToClaim.into());
        }
        let amount = record_claim_collateral(&self.events, &mut self.state, caller);
        management::move_collateral(
            host,
            CollateralAccount::Pool(CollateralPool::CollSurplus),
            CollateralAccount::User(caller),
            amount,
        );
        log!(INFO, "[claim_collateral] {} claimed {} collateral", caller, amount);
        self.self_check();
        Ok(amount)
    }
}
