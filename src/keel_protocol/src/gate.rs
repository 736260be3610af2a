//! Collateralization rules every trove operation must pass, by mode.

use crate::config::ProtocolConfig;
use crate::numeric::{compute_collateral_ratio, Ratio, UsdColl, COLL, KUSD};
use crate::state::{Mode, State};
use crate::{InvariantViolation, ProtocolError, StateError};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// A signed change to an amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta<T> {
    Increase(T),
    Decrease(T),
}

impl<T> Delta<T>
where
    T: Add<Output = T> + Sub<Output = T> + Copy + Default + PartialEq,
{
    pub fn none() -> Self {
        Delta::Increase(T::default())
    }

    pub fn amount(self) -> T {
        match self {
            Delta::Increase(amount) | Delta::Decrease(amount) => amount,
        }
    }

    pub fn is_zero(self) -> bool {
        self.amount() == T::default()
    }

    pub fn is_decrease(self) -> bool {
        matches!(self, Delta::Decrease(amount) if amount != T::default())
    }

    pub fn is_increase(self) -> bool {
        matches!(self, Delta::Increase(amount) if amount != T::default())
    }

    /// Panics on underflow; callers validate decreases first.
    pub fn apply_to(self, value: T) -> T {
        match self {
            Delta::Increase(amount) => value + amount,
            Delta::Decrease(amount) => value - amount,
        }
    }
}

/// The kind of trove change being checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Adjustment {
    pub coll_withdrawal: bool,
    pub debt_increase: bool,
}

/// TCR the system would have after a trove changes by the given amounts.
pub fn new_tcr_from_trove_change(
    state: &State,
    coll_change: Delta<COLL>,
    debt_change: Delta<KUSD>,
    price: UsdColl,
) -> Ratio {
    let coll = coll_change.apply_to(state.entire_system_coll());
    let debt = debt_change.apply_to(state.entire_system_debt());
    compute_collateral_ratio(coll, debt, price)
}

pub fn require_icr_at_least_mcr(icr: Ratio, config: &ProtocolConfig) -> Result<(), InvariantViolation> {
    if icr < config.minimum_collateral_ratio {
        return Err(InvariantViolation::IcrBelowMcr { icr });
    }
    Ok(())
}

pub fn require_icr_at_least_ccr(icr: Ratio, config: &ProtocolConfig) -> Result<(), InvariantViolation> {
    if icr < config.critical_collateral_ratio {
        return Err(InvariantViolation::IcrBelowCcr { icr });
    }
    Ok(())
}

pub fn require_new_icr_at_least_old(old_icr: Ratio, new_icr: Ratio) -> Result<(), InvariantViolation> {
    if new_icr < old_icr {
        return Err(InvariantViolation::IcrDecreasedInRecovery { old_icr, new_icr });
    }
    Ok(())
}

pub fn require_new_tcr_at_least_ccr(tcr: Ratio, config: &ProtocolConfig) -> Result<(), InvariantViolation> {
    if tcr < config.critical_collateral_ratio {
        return Err(InvariantViolation::TcrBelowCcr { tcr });
    }
    Ok(())
}

/// Opening needs ICR >= CCR in Recovery Mode. In Normal Mode it needs
/// ICR >= MCR and must not push the system into Recovery Mode.
pub fn check_open_trove(
    mode: Mode,
    icr: Ratio,
    new_tcr: Ratio,
    config: &ProtocolConfig,
) -> Result<(), InvariantViolation> {
    match mode {
        Mode::Recovery => require_icr_at_least_ccr(icr, config),
        Mode::Normal => {
            require_icr_at_least_mcr(icr, config)?;
            require_new_tcr_at_least_ccr(new_tcr, config)
        }
    }
}

/// In Recovery Mode collateral may not leave, and an adjustment that adds
/// debt must end at or above CCR. Any other adjustment must not lower the
/// ICR. In Normal Mode the trove must stay at or above MCR and the system
/// at or above CCR.
pub fn check_adjustment(
    mode: Mode,
    adjustment: Adjustment,
    old_icr: Ratio,
    new_icr: Ratio,
    new_tcr: Ratio,
    config: &ProtocolConfig,
) -> Result<(), InvariantViolation> {
    match mode {
        Mode::Recovery => {
            if adjustment.coll_withdrawal {
                return Err(InvariantViolation::CollateralWithdrawalInRecovery);
            }
            if adjustment.debt_increase {
                require_icr_at_least_ccr(new_icr, config)?;
                require_new_icr_at_least_old(old_icr, new_icr)
            } else {
                require_new_icr_at_least_old(old_icr, new_icr)
            }
        }
        Mode::Normal => {
            require_icr_at_least_mcr(new_icr, config)?;
            require_new_tcr_at_least_ccr(new_tcr, config)
        }
    }
}

/// Closing is forbidden in Recovery Mode, for the last trove, and when it
/// would push the system into Recovery Mode.
pub fn check_close_trove(
    mode: Mode,
    trove_owners_count: u64,
    new_tcr: Ratio,
    config: &ProtocolConfig,
) -> Result<(), ProtocolError> {
    if trove_owners_count <= 1 {
        return Err(StateError::OnlyOneTroveInSystem.into());
    }
    if mode == Mode::Recovery {
        return Err(InvariantViolation::OperationForbiddenInRecovery.into());
    }
    require_new_tcr_at_least_ccr(new_tcr, config)?;
    Ok(())
}
