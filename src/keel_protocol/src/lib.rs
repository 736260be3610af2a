use crate::config::ProtocolConfig;
use crate::management::HostError;
use crate::numeric::{Ratio, UsdColl, COLL, KUSD};
use crate::state::{Mode, State};
use crate::storage::EventLog;
use candid::{CandidType, Deserialize};
use ic_canister_log::log;
use serde::Serialize;
use std::fmt;

pub mod config;
pub mod deposits;
pub mod event;
pub mod fees;
pub mod gate;
pub mod hints;
pub mod liquidation;
pub mod logs;
pub mod management;
pub mod numeric;
pub mod redemption;
pub mod sorted_troves;
pub mod stability_pool;
pub mod state;
pub mod storage;
pub mod trove;

#[cfg(any(test, feature = "test_endpoints"))]
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub use crate::logs::{DEBUG, INFO};

pub const SECONDS_IN_ONE_MINUTE: u64 = 60;

pub const MINIMUM_COLLATERAL_RATIO: Ratio = Ratio::new(1_100_000_000_000_000_000); // 110%
pub const CRITICAL_COLLATERAL_RATIO: Ratio = Ratio::new(1_500_000_000_000_000_000); // 150%

/// Reserved from every trove's debt to pay whoever liquidates it.
pub const GAS_COMPENSATION: KUSD = KUSD::from_units(200);
pub const MIN_NET_DEBT: KUSD = KUSD::from_units(1_800);
/// The liquidator also receives `coll / PERCENT_DIVISOR` (0.5%) of the seized collateral.
pub const PERCENT_DIVISOR: u128 = 200;

pub const BORROWING_FEE_FLOOR: Ratio = Ratio::new(5_000_000_000_000_000); // 0.5%
pub const MAX_BORROWING_FEE: Ratio = Ratio::new(50_000_000_000_000_000); // 5%
pub const REDEMPTION_FEE_FLOOR: Ratio = Ratio::new(5_000_000_000_000_000); // 0.5%
/// Half-life of twelve hours: `MINUTE_DECAY_FACTOR ^ 720 = 0.5`.
pub const MINUTE_DECAY_FACTOR: Ratio = Ratio::new(999_037_758_833_783_000);
/// Divides the redeemed fraction before it is added to the base rate.
pub const REDEMPTION_BETA: u128 = 2;

pub const MAX_HINT_WALK: u32 = 64;
pub const MAX_LIST_SIZE: u64 = u64::MAX;

#[derive(CandidType, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitArg {
    /// Decimal string, e.g. "1.1" for 110%.
    pub minimum_collateral_ratio: Option<String>,
    pub critical_collateral_ratio: Option<String>,
    /// Seized collateral per unit of debt in a Recovery Mode capped liquidation.
    pub capped_liquidation_ratio: Option<String>,
    /// Whole KUSD.
    pub gas_compensation: Option<u64>,
    /// Whole KUSD.
    pub min_net_debt: Option<u64>,
    pub borrowing_fee_floor: Option<String>,
    pub max_borrowing_fee: Option<String>,
    pub redemption_fee_floor: Option<String>,
    pub minute_decay_factor: Option<String>,
    pub max_hint_walk: Option<u32>,
    pub max_list_size: Option<u64>,
}

#[derive(CandidType, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtocolStatus {
    pub price: f64,
    pub mode: Mode,
    pub total_collateral_ratio: f64,
    pub total_collateral: f64,
    pub total_debt: f64,
    pub active_troves: u64,
    pub total_stakes: f64,
    pub base_rate: f64,
    pub stability_pool_deposits: f64,
    pub stability_pool_collateral: f64,
    pub stability_pool_scale: u64,
    pub stability_pool_epoch: u64,
    pub total_coll_surplus: f64,
}

/// Caller-supplied input that is out of range or malformed.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    ZeroAmount,
    MaxFeeOutOfRange { max_fee: Ratio, floor: Ratio },
    FeeExceedsMaximum { fee_percentage: Ratio, max_fee: Ratio },
    NetDebtBelowMinimum { net_debt: KUSD, minimum: KUSD },
    SingularCollateralChange,
    NoAdjustment,
    RepaymentExceedsDebt { repayment: KUSD, repayable: KUSD },
    WithdrawalExceedsCollateral { withdrawal: COLL, collateral: COLL },
    AmountExceedsDeposit { requested: KUSD, available: KUSD },
    HintOutOfRange,
    EmptyTroveList,
    ListFull,
    InvalidConfig(String),
}

/// The operation would leave the system outside its collateral bounds.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvariantViolation {
    IcrBelowMcr { icr: Ratio },
    IcrBelowCcr { icr: Ratio },
    IcrDecreasedInRecovery { old_icr: Ratio, new_icr: Ratio },
    TcrBelowCcr { tcr: Ratio },
    TcrBelowMcr { tcr: Ratio },
    CollateralWithdrawalInRecovery,
    OperationForbiddenInRecovery,
    UnderCollateralizedTroves,
}

/// The operation does not apply to the current state.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateError {
    TroveNotActive,
    TroveAlreadyActive,
    OnlyOneTroveInSystem,
    InsufficientKusdBalance { required: KUSD, available: KUSD },
    InsufficientCollateralBalance { required: COLL, available: COLL },
    NoDeposit,
    NothingToLiquidate,
    NothingToClaim,
    NoCollateralGain,
    UnableToRedeem,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    Validation(ValidationError),
    InvariantViolation(InvariantViolation),
    State(StateError),
    Host(HostError),
}

impl From<ValidationError> for ProtocolError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<InvariantViolation> for ProtocolError {
    fn from(err: InvariantViolation) -> Self {
        Self::InvariantViolation(err)
    }
}

impl From<StateError> for ProtocolError {
    fn from(err: StateError) -> Self {
        Self::State(err)
    }
}

impl From<HostError> for ProtocolError {
    fn from(err: HostError) -> Self {
        Self::Host(err)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroAmount => write!(f, "amount must be greater than zero"),
            Self::MaxFeeOutOfRange { max_fee, floor } => write!(
                f,
                "max fee percentage {} must be between {} and 1",
                max_fee, floor
            ),
            Self::FeeExceedsMaximum {
                fee_percentage,
                max_fee,
            } => write!(
                f,
                "fee percentage {} exceeds the accepted maximum {}",
                fee_percentage, max_fee
            ),
            Self::NetDebtBelowMinimum { net_debt, minimum } => write!(
                f,
                "net debt {} KUSD is below the minimum of {} KUSD",
                net_debt, minimum
            ),
            Self::SingularCollateralChange => {
                write!(f, "cannot deposit and withdraw collateral at once")
            }
            Self::NoAdjustment => write!(f, "adjustment changes neither collateral nor debt"),
            Self::RepaymentExceedsDebt {
                repayment,
                repayable,
            } => write!(
                f,
                "repayment of {} KUSD exceeds the repayable debt of {} KUSD",
                repayment, repayable
            ),
            Self::WithdrawalExceedsCollateral {
                withdrawal,
                collateral,
            } => write!(
                f,
                "withdrawal of {} exceeds the trove collateral of {}",
                withdrawal, collateral
            ),
            Self::AmountExceedsDeposit {
                requested,
                available,
            } => write!(
                f,
                "requested {} KUSD but the compounded deposit is {} KUSD",
                requested, available
            ),
            Self::HintOutOfRange => write!(
                f,
                "insert position is too far from the hints, resubmit with better hints"
            ),
            Self::EmptyTroveList => write!(f, "there are no troves"),
            Self::ListFull => write!(f, "trove list is full"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IcrBelowMcr { icr } => {
                write!(f, "collateral ratio {} would fall below the minimum", icr)
            }
            Self::IcrBelowCcr { icr } => write!(
                f,
                "collateral ratio {} must reach the critical ratio in Recovery Mode",
                icr
            ),
            Self::IcrDecreasedInRecovery { old_icr, new_icr } => write!(
                f,
                "collateral ratio may not decrease in Recovery Mode ({} -> {})",
                old_icr, new_icr
            ),
            Self::TcrBelowCcr { tcr } => write!(
                f,
                "total collateral ratio {} would fall below the critical ratio",
                tcr
            ),
            Self::TcrBelowMcr { tcr } => write!(
                f,
                "total collateral ratio {} is below the minimum",
                tcr
            ),
            Self::CollateralWithdrawalInRecovery => {
                write!(f, "collateral withdrawal is not allowed in Recovery Mode")
            }
            Self::OperationForbiddenInRecovery => {
                write!(f, "operation is not allowed in Recovery Mode")
            }
            Self::UnderCollateralizedTroves => write!(
                f,
                "cannot withdraw while there are troves below the minimum collateral ratio"
            ),
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TroveNotActive => write!(f, "trove does not exist or is closed"),
            Self::TroveAlreadyActive => write!(f, "trove is already active"),
            Self::OnlyOneTroveInSystem => write!(f, "the last trove in the system cannot be closed"),
            Self::InsufficientKusdBalance {
                required,
                available,
            } => write!(
                f,
                "insufficient KUSD balance: required {}, available {}",
                required, available
            ),
            Self::InsufficientCollateralBalance {
                required,
                available,
            } => write!(
                f,
                "insufficient collateral balance: required {}, available {}",
                required, available
            ),
            Self::NoDeposit => write!(f, "no stability pool deposit"),
            Self::NothingToLiquidate => write!(f, "nothing to liquidate"),
            Self::NothingToClaim => write!(f, "no collateral available to claim"),
            Self::NoCollateralGain => write!(f, "no collateral gain to withdraw"),
            Self::UnableToRedeem => write!(f, "unable to redeem any amount"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "validation error: {}", err),
            Self::InvariantViolation(err) => write!(f, "invariant violation: {}", err),
            Self::State(err) => write!(f, "state error: {}", err),
            Self::Host(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The engine: the ledger state and the log of events that produced it.
///
/// Every operation takes `&mut self` and runs to completion, so the borrow
/// checker enforces a single writer. Operations validate against the current
/// state first and only then record an event and commit.
#[derive(Debug)]
pub struct Protocol {
    state: State,
    events: EventLog,
}

impl Protocol {
    pub fn init(arg: InitArg) -> Result<Self, ProtocolError> {
        let config = ProtocolConfig::try_from(arg.clone())?;
        let events = EventLog::default();
        event::record_init(&events, arg);
        log!(
            INFO,
            "[init] MCR {}, CCR {}, gas compensation {} KUSD, min net debt {} KUSD",
            config.minimum_collateral_ratio,
            config.critical_collateral_ratio,
            config.gas_compensation,
            config.min_net_debt
        );
        Ok(Self {
            state: State::new(config),
            events,
        })
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn status(&self, price: UsdColl) -> ProtocolStatus {
        let s = &self.state;
        ProtocolStatus {
            price: price.to_f64(),
            mode: s.mode(price),
            total_collateral_ratio: s.total_collateral_ratio(price).to_f64(),
            total_collateral: s.entire_system_coll().to_f64(),
            total_debt: s.entire_system_debt().to_f64(),
            active_troves: s.trove_owners_count(),
            total_stakes: s.total_stakes.to_f64(),
            base_rate: s.base_rate.to_f64(),
            stability_pool_deposits: s.stability_pool.total_deposits().to_f64(),
            stability_pool_collateral: s.stability_pool.coll_balance().to_f64(),
            stability_pool_scale: s.stability_pool.current_scale(),
            stability_pool_epoch: s.stability_pool.current_epoch(),
            total_coll_surplus: s.total_coll_surplus.to_f64(),
        }
    }

    /// Rebuilds the state from the event log and compares it with the live
    /// state.
    pub fn check_replay(&self) -> Result<(), String> {
        let replayed = event::replay(self.events.iter()).map_err(|err| format!("{:?}", err))?;
        replayed.check_semantically_eq(&self.state)?;
        replayed.check_invariants()
    }

    #[cfg(feature = "self_check")]
    fn self_check(&self) {
        if let Err(msg) = self.check_replay() {
            panic!("self check failed: {}", msg);
        }
    }

    #[cfg(not(feature = "self_check"))]
    fn self_check(&self) {}
}
