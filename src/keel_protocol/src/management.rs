//! Collaborators the engine drives but does not implement: the debt token
//! ledger, the collateral custody pools, the price feed, the fee recipient
//! and the clock.
//!
//! Calls that take funds from a user run before the engine commits and may
//! fail. Calls that move funds the protocol already controls run after the
//! commit and must succeed.

use crate::logs::DEBUG;
use crate::numeric::{UsdColl, COLL, KUSD};
use crate::{ProtocolError, StateError};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Holder of debt tokens.
#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LedgerAccount {
    User(Principal),
    /// Holds the gas compensation reserved for every active trove.
    GasPool,
    /// Holds the Stability Pool deposits.
    StabilityPool,
    FeeRecipient,
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollateralPool {
    /// Collateral of active troves.
    Active,
    /// Redistributed collateral not yet applied to troves.
    Default,
    StabilityPool,
    /// Collateral owed back to borrowers after capped liquidations and
    /// redemptions.
    CollSurplus,
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollateralAccount {
    User(Principal),
    Pool(CollateralPool),
    FeeRecipient,
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebtChange {
    Increase(KUSD),
    Decrease(KUSD),
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeAmount {
    Kusd(KUSD),
    Coll(COLL),
}

/// Represents a failed call to a collaborator.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostError {
    pub method: String,
    pub reason: String,
}

impl HostError {
    pub fn new(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "host call '{}' failed: {}", self.method, self.reason)
    }
}

pub trait DebtToken {
    fn balance_of(&self, account: LedgerAccount) -> KUSD;
    fn mint(&mut self, to: LedgerAccount, amount: KUSD) -> Result<(), HostError>;
    fn burn(&mut self, from: LedgerAccount, amount: KUSD) -> Result<(), HostError>;
    fn transfer(&mut self, from: LedgerAccount, to: LedgerAccount, amount: KUSD) -> Result<(), HostError>;
}

pub trait CollateralCustody {
    fn collateral_balance(&self, account: CollateralAccount) -> COLL;
    fn move_collateral(
        &mut self,
        from: CollateralAccount,
        to: CollateralAccount,
        amount: COLL,
    ) -> Result<(), HostError>;
    /// Debt bookkeeping of the active and default pools.
    fn record_debt(&mut self, pool: CollateralPool, change: DebtChange);
}

pub trait PriceFeed {
    /// Read once per operation.
    fn current_price(&mut self) -> UsdColl;
}

pub trait FeeRecipient {
    fn receive_fee(&mut self, fee: FeeAmount);
}

pub trait Clock {
    fn now_seconds(&self) -> u64;
}

/// Everything an operation needs from its environment.
pub trait Host: DebtToken + CollateralCustody + PriceFeed + FeeRecipient + Clock {}

impl<T> Host for T where T: DebtToken + CollateralCustody + PriceFeed + FeeRecipient + Clock {}

fn settle(result: Result<(), HostError>) {
    if let Err(err) = result {
        panic!("bug: protocol-side transfer failed after commit: {}", err);
    }
}

pub fn require_kusd_balance<H: DebtToken>(host: &H, owner: Principal, required: KUSD) -> Result<(), ProtocolError> {
    let available = host.balance_of(LedgerAccount::User(owner));
    if available < required {
        return Err(StateError::InsufficientKusdBalance { required, available }.into());
    }
    Ok(())
}

pub fn require_collateral_balance<H: CollateralCustody>(
    host: &H,
    owner: Principal,
    required: COLL,
) -> Result<(), ProtocolError> {
    let available = host.collateral_balance(CollateralAccount::User(owner));
    if available < required {
        return Err(StateError::InsufficientCollateralBalance { required, available }.into());
    }
    Ok(())
}

/// Takes collateral from `owner` into `pool`. Runs before commit.
pub fn pull_collateral<H: CollateralCustody>(
    host: &mut H,
    owner: Principal,
    pool: CollateralPool,
    amount: COLL,
) -> Result<(), ProtocolError> {
    if amount.is_zero() {
        return Ok(());
    }
    host.move_collateral(CollateralAccount::User(owner), CollateralAccount::Pool(pool), amount)?;
    Ok(())
}

/// Burns KUSD held by `owner`. Runs before commit.
pub fn burn_from_user<H: DebtToken>(host: &mut H, owner: Principal, amount: KUSD) -> Result<(), ProtocolError> {
    if amount.is_zero() {
        return Ok(());
    }
    host.burn(LedgerAccount::User(owner), amount)?;
    Ok(())
}

/// Moves KUSD from `owner` to the Stability Pool. Runs before commit.
pub fn deposit_to_stability_pool<H: DebtToken>(
    host: &mut H,
    owner: Principal,
    amount: KUSD,
) -> Result<(), ProtocolError> {
    host.transfer(LedgerAccount::User(owner), LedgerAccount::StabilityPool, amount)?;
    Ok(())
}

pub fn move_collateral<H: CollateralCustody>(
    host: &mut H,
    from: CollateralAccount,
    to: CollateralAccount,
    amount: COLL,
) {
    if amount.is_zero() {
        return;
    }
    settle(host.move_collateral(from, to, amount));
}

pub fn move_pool_collateral<H: CollateralCustody>(
    host: &mut H,
    from: CollateralPool,
    to: CollateralPool,
    amount: COLL,
) {
    move_collateral(host, CollateralAccount::Pool(from), CollateralAccount::Pool(to), amount);
}

pub fn record_debt<H: CollateralCustody>(host: &mut H, pool: CollateralPool, change: DebtChange) {
    match change {
        DebtChange::Increase(amount) | DebtChange::Decrease(amount) if amount.is_zero() => (),
        _ => host.record_debt(pool, change),
    }
}

/// Moves debt bookkeeping between the active and default pools.
pub fn shift_debt<H: CollateralCustody>(host: &mut H, from: CollateralPool, to: CollateralPool, amount: KUSD) {
    record_debt(host, from, DebtChange::Decrease(amount));
    record_debt(host, to, DebtChange::Increase(amount));
}

/// Mirrors applying a trove's pending rewards: the amounts leave the default
/// pool for the active pool.
pub fn apply_pending_rewards<H: CollateralCustody>(host: &mut H, coll: COLL, debt: KUSD) {
    move_pool_collateral(host, CollateralPool::Default, CollateralPool::Active, coll);
    shift_debt(host, CollateralPool::Default, CollateralPool::Active, debt);
}

pub fn mint<H: DebtToken>(host: &mut H, to: LedgerAccount, amount: KUSD) {
    if amount.is_zero() {
        return;
    }
    settle(host.mint(to, amount));
}

pub fn burn<H: DebtToken>(host: &mut H, from: LedgerAccount, amount: KUSD) {
    if amount.is_zero() {
        return;
    }
    settle(host.burn(from, amount));
}

pub fn transfer<H: DebtToken>(host: &mut H, from: LedgerAccount, to: LedgerAccount, amount: KUSD) {
    if amount.is_zero() {
        return;
    }
    settle(host.transfer(from, to, amount));
}

/// Mints a KUSD fee to the fee recipient and notifies it.
pub fn pay_kusd_fee<H: DebtToken + FeeRecipient>(host: &mut H, fee: KUSD) {
    if fee.is_zero() {
        return;
    }
    mint(host, LedgerAccount::FeeRecipient, fee);
    host.receive_fee(FeeAmount::Kusd(fee));
    log!(DEBUG, "[fees] paid {} KUSD borrowing fee", fee);
}

/// Sends a collateral fee out of `pool` to the fee recipient and notifies it.
pub fn pay_coll_fee<H: CollateralCustody + FeeRecipient>(host: &mut H, pool: CollateralPool, fee: COLL) {
    if fee.is_zero() {
        return;
    }
    move_collateral(host, CollateralAccount::Pool(pool), CollateralAccount::FeeRecipient, fee);
    host.receive_fee(FeeAmount::Coll(fee));
    log!(DEBUG, "[fees] paid {} collateral redemption fee", fee);
}
