use crate::numeric::{Ratio, DECIMAL_PRECISION, KUSD};
use crate::{
    InitArg, ProtocolError, ValidationError, BORROWING_FEE_FLOOR, CRITICAL_COLLATERAL_RATIO,
    GAS_COMPENSATION, MAX_BORROWING_FEE, MAX_HINT_WALK, MAX_LIST_SIZE, MINIMUM_COLLATERAL_RATIO,
    MINUTE_DECAY_FACTOR, MIN_NET_DEBT, PERCENT_DIVISOR, REDEMPTION_BETA, REDEMPTION_FEE_FLOOR,
};
use num_traits::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;

// Ratios above this are certainly a typo (e.g. "150" for 150%).
const MAX_RATIO_INPUT: Decimal = dec!(100);

/// Protocol parameters, fixed at initialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub minimum_collateral_ratio: Ratio,
    pub critical_collateral_ratio: Ratio,
    pub capped_liquidation_ratio: Ratio,
    pub gas_compensation: KUSD,
    pub min_net_debt: KUSD,
    pub percent_divisor: u128,
    pub borrowing_fee_floor: Ratio,
    pub max_borrowing_fee: Ratio,
    pub redemption_fee_floor: Ratio,
    pub minute_decay_factor: Ratio,
    pub redemption_beta: u128,
    pub max_hint_walk: u32,
    pub max_list_size: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            minimum_collateral_ratio: MINIMUM_COLLATERAL_RATIO,
            critical_collateral_ratio: CRITICAL_COLLATERAL_RATIO,
            capped_liquidation_ratio: CRITICAL_COLLATERAL_RATIO,
            gas_compensation: GAS_COMPENSATION,
            min_net_debt: MIN_NET_DEBT,
            percent_divisor: PERCENT_DIVISOR,
            borrowing_fee_floor: BORROWING_FEE_FLOOR,
            max_borrowing_fee: MAX_BORROWING_FEE,
            redemption_fee_floor: REDEMPTION_FEE_FLOOR,
            minute_decay_factor: MINUTE_DECAY_FACTOR,
            redemption_beta: REDEMPTION_BETA,
            max_hint_walk: MAX_HINT_WALK,
            max_list_size: MAX_LIST_SIZE,
        }
    }
}

impl TryFrom<InitArg> for ProtocolConfig {
    type Error = ProtocolError;

    fn try_from(arg: InitArg) -> Result<Self, Self::Error> {
        let defaults = Self::default();
        let critical_collateral_ratio = parse_ratio_or(
            "critical_collateral_ratio",
            arg.critical_collateral_ratio.as_deref(),
            defaults.critical_collateral_ratio,
        )?;
        let config = Self {
            minimum_collateral_ratio: parse_ratio_or(
                "minimum_collateral_ratio",
                arg.minimum_collateral_ratio.as_deref(),
                defaults.minimum_collateral_ratio,
            )?,
            critical_collateral_ratio,
            // Follows the critical ratio unless set explicitly.
            capped_liquidation_ratio: parse_ratio_or(
                "capped_liquidation_ratio",
                arg.capped_liquidation_ratio.as_deref(),
                critical_collateral_ratio,
            )?,
            gas_compensation: arg
                .gas_compensation
                .map(|units| KUSD::from_units(units as u128))
                .unwrap_or(defaults.gas_compensation),
            min_net_debt: arg
                .min_net_debt
                .map(|units| KUSD::from_units(units as u128))
                .unwrap_or(defaults.min_net_debt),
            percent_divisor: defaults.percent_divisor,
            borrowing_fee_floor: parse_ratio_or(
                "borrowing_fee_floor",
                arg.borrowing_fee_floor.as_deref(),
                defaults.borrowing_fee_floor,
            )?,
            max_borrowing_fee: parse_ratio_or(
                "max_borrowing_fee",
                arg.max_borrowing_fee.as_deref(),
                defaults.max_borrowing_fee,
            )?,
            redemption_fee_floor: parse_ratio_or(
                "redemption_fee_floor",
                arg.redemption_fee_floor.as_deref(),
                defaults.redemption_fee_floor,
            )?,
            minute_decay_factor: parse_ratio_or(
                "minute_decay_factor",
                arg.minute_decay_factor.as_deref(),
                defaults.minute_decay_factor,
            )?,
            redemption_beta: defaults.redemption_beta,
            max_hint_walk: arg.max_hint_walk.unwrap_or(defaults.max_hint_walk),
            max_list_size: arg.max_list_size.unwrap_or(defaults.max_list_size),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let check = |ok: bool, msg: &str| -> Result<(), ProtocolError> {
            if ok {
                Ok(())
            } else {
                Err(ValidationError::InvalidConfig(msg.to_string()).into())
            }
        };
        check(
            self.minimum_collateral_ratio > Ratio::ONE,
            "minimum collateral ratio must exceed 100%",
        )?;
        check(
            self.critical_collateral_ratio > self.minimum_collateral_ratio,
            "critical collateral ratio must exceed the minimum collateral ratio",
        )?;
        check(
            self.capped_liquidation_ratio >= self.minimum_collateral_ratio
                && self.capped_liquidation_ratio <= self.critical_collateral_ratio,
            "capped liquidation ratio must lie between the minimum and critical ratios",
        )?;
        check(!self.min_net_debt.is_zero(), "minimum net debt must be positive")?;
        check(
            self.borrowing_fee_floor <= self.max_borrowing_fee && self.max_borrowing_fee <= Ratio::ONE,
            "borrowing fee floor must not exceed the maximum borrowing fee, which must not exceed 100%",
        )?;
        check(
            self.redemption_fee_floor <= Ratio::ONE,
            "redemption fee floor must not exceed 100%",
        )?;
        check(
            !self.minute_decay_factor.is_zero() && self.minute_decay_factor < Ratio::ONE,
            "minute decay factor must lie strictly between 0 and 1",
        )?;
        check(self.max_hint_walk > 0, "hint walk bound must be positive")?;
        check(self.max_list_size > 1, "trove list must hold at least two troves")?;
        Ok(())
    }
}

fn parse_ratio_or(field: &str, value: Option<&str>, default: Ratio) -> Result<Ratio, ProtocolError> {
    match value {
        Some(value) => parse_ratio(field, value),
        None => Ok(default),
    }
}

/// Parses a decimal string such as "1.1" into an 18-decimal ratio,
/// truncating digits beyond the 18th.
pub fn parse_ratio(field: &str, value: &str) -> Result<Ratio, ProtocolError> {
    let invalid = |reason: String| -> ProtocolError {
        ValidationError::InvalidConfig(format!("{} = {:?}: {}", field, value, reason)).into()
    };
    let decimal = Decimal::from_str(value).map_err(|err| invalid(err.to_string()))?;
    if decimal.is_sign_negative() {
        return Err(invalid("must not be negative".to_string()));
    }
    if decimal > MAX_RATIO_INPUT {
        return Err(invalid(format!("must not exceed {}", MAX_RATIO_INPUT)));
    }
    let precision = Decimal::from(DECIMAL_PRECISION as u64);
    decimal
        .checked_mul(precision)
        .and_then(|scaled| scaled.trunc().to_u128())
        .map(Ratio::new)
        .ok_or_else(|| invalid("out of range".to_string()))
}
