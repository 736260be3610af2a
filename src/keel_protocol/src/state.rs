use crate::config::ProtocolConfig;
use crate::logs::DEBUG;
use crate::numeric::{
    compute_collateral_ratio, compute_nominal_cr, mul_div, narrow, Nicr, Ratio, UsdColl, COLL,
    DECIMAL_PRECISION, KUSD,
};
use crate::sorted_troves::{InsertPosition, NominalRatioSource, SortedTroves};
use crate::stability_pool::StabilityPool;
use candid::{CandidType, Principal};
use ethnum::U256;
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const NICR_ORDER_TOLERANCE: u128 = 1_000_000_000;

// Redistribution truncates once per applied reward and carries a remainder
// below one wei per unit of stake.
const REWARD_DUST_PER_TROVE: u128 = 1_000_000;

// Return early from a checker when the two sides differ.
macro_rules! ensure_eq {
    ($left:expr, $right:expr, $($reason:tt)+) => {
        match (&$left, &$right) {
            (left, right) => {
                if left != right {
                    return Err(format!(
                        "{}: {} is {:?} but {} is {:?}",
                        format!($($reason)+),
                        stringify!($left),
                        left,
                        stringify!($right),
                        right
                    ));
                }
            }
        }
    };
}

macro_rules! ensure {
    ($cond:expr, $($reason:tt)+) => {
        if !$cond {
            return Err(format!($($reason)+));
        }
    };
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// TCR at or above the critical ratio.
    Normal,
    /// TCR below the critical ratio: stricter operation rules and liquidation
    /// of troves up to the critical ratio.
    Recovery,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => write!(f, "Normal"),
            Mode::Recovery => write!(f, "Recovery"),
        }
    }
}

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TroveStatus {
    NonExistent,
    Active,
    ClosedByOwner,
    ClosedByLiquidation,
    ClosedByRedemption,
}

impl Default for TroveStatus {
    fn default() -> Self {
        Self::NonExistent
    }
}

/// Values of the redistribution accumulators when the trove's rewards were
/// last applied.
#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSnapshot {
    pub l_coll: u128,
    pub l_debt: u128,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trove {
    pub owner: Principal,
    pub coll: COLL,
    /// Includes the gas compensation reserve.
    pub debt: KUSD,
    pub stake: COLL,
    pub status: TroveStatus,
    pub reward_snapshot: RewardSnapshot,
    /// Position in `State::trove_owners`.
    pub array_index: u64,
}

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBalance {
    pub coll: COLL,
    pub debt: KUSD,
}

/// A trove's recorded amounts with its pending redistribution rewards
/// folded in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntireTrove {
    pub coll: COLL,
    pub debt: KUSD,
    pub pending_coll: COLL,
    pub pending_debt: KUSD,
}

fn pending_rewards(trove: &Trove, l_coll: u128, l_debt: u128) -> (COLL, KUSD) {
    if trove.status != TroveStatus::Active {
        return (COLL::ZERO, KUSD::ZERO);
    }
    let stake = trove.stake.raw();
    (
        COLL::new(mul_div(
            stake,
            l_coll - trove.reward_snapshot.l_coll,
            DECIMAL_PRECISION,
        )),
        KUSD::new(mul_div(
            stake,
            l_debt - trove.reward_snapshot.l_debt,
            DECIMAL_PRECISION,
        )),
    )
}

/// Read-only view of the ledger that orders the trove list by live NICR.
pub struct LedgerView<'a> {
    troves: &'a BTreeMap<Principal, Trove>,
    l_coll: u128,
    l_debt: u128,
}

impl NominalRatioSource for LedgerView<'_> {
    fn nominal_icr(&self, id: &Principal) -> Nicr {
        match self.troves.get(id) {
            Some(trove) => {
                let (coll, debt) = pending_rewards(trove, self.l_coll, self.l_debt);
                compute_nominal_cr(trove.coll + coll, trove.debt + debt)
            }
            None => 0,
        }
    }
}

/// The position ledger: troves, pools, redistribution accumulators, the
/// Stability Pool and the fee state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct State {
    pub config: ProtocolConfig,

    pub troves: BTreeMap<Principal, Trove>,
    /// Owners of active troves, in no particular order.
    pub trove_owners: Vec<Principal>,
    pub sorted_troves: SortedTroves,

    pub total_stakes: COLL,
    /// `total_stakes` right after the last liquidation.
    pub total_stakes_snapshot: COLL,
    /// System collateral right after the last liquidation, excluding the
    /// liquidator's collateral compensation.
    pub total_collateral_snapshot: COLL,

    /// Redistributed collateral per unit of stake, scaled by 1e18.
    pub l_coll: u128,
    /// Redistributed debt per unit of stake, scaled by 1e18.
    pub l_debt: u128,
    pub last_coll_error_redistribution: u128,
    pub last_debt_error_redistribution: u128,

    pub active_pool: PoolBalance,
    /// Redistributed amounts not yet applied to their troves.
    pub default_pool: PoolBalance,
    pub coll_surplus: BTreeMap<Principal, COLL>,
    pub total_coll_surplus: COLL,
    /// KUSD reserved for liquidators, one gas compensation per active trove.
    pub gas_pool: KUSD,

    pub stability_pool: StabilityPool,

    pub base_rate: Ratio,
    /// Seconds; only advanced in whole minutes.
    pub last_fee_operation_time: u64,
}

impl State {
    pub fn new(config: ProtocolConfig) -> Self {
        let sorted_troves = SortedTroves::new(config.max_list_size, config.max_hint_walk);
        Self {
            config,
            troves: BTreeMap::new(),
            trove_owners: vec![],
            sorted_troves,
            total_stakes: COLL::ZERO,
            total_stakes_snapshot: COLL::ZERO,
            total_collateral_snapshot: COLL::ZERO,
            l_coll: 0,
            l_debt: 0,
            last_coll_error_redistribution: 0,
            last_debt_error_redistribution: 0,
            active_pool: PoolBalance::default(),
            default_pool: PoolBalance::default(),
            coll_surplus: BTreeMap::new(),
            total_coll_surplus: COLL::ZERO,
            gas_pool: KUSD::ZERO,
            stability_pool: StabilityPool::default(),
            base_rate: Ratio::ZERO,
            last_fee_operation_time: 0,
        }
    }

    pub fn trove(&self, owner: &Principal) -> Option<&Trove> {
        self.troves.get(owner)
    }

    pub fn trove_status(&self, owner: &Principal) -> TroveStatus {
        self.troves
            .get(owner)
            .map(|trove| trove.status)
            .unwrap_or_default()
    }

    pub fn is_active(&self, owner: &Principal) -> bool {
        self.trove_status(owner) == TroveStatus::Active
    }

    pub fn trove_owners_count(&self) -> u64 {
        self.trove_owners.len() as u64
    }

    pub fn ledger_view(&self) -> LedgerView<'_> {
        LedgerView {
            troves: &self.troves,
            l_coll: self.l_coll,
            l_debt: self.l_debt,
        }
    }

    pub fn pending_rewards(&self, owner: &Principal) -> (COLL, KUSD) {
        match self.troves.get(owner) {
            Some(trove) => pending_rewards(trove, self.l_coll, self.l_debt),
            None => (COLL::ZERO, KUSD::ZERO),
        }
    }

    /// `None` unless the trove is active.
    pub fn entire_debt_and_coll(&self, owner: &Principal) -> Option<EntireTrove> {
        let trove = self.troves.get(owner)?;
        if trove.status != TroveStatus::Active {
            return None;
        }
        let (pending_coll, pending_debt) = pending_rewards(trove, self.l_coll, self.l_debt);
        Some(EntireTrove {
            coll: trove.coll + pending_coll,
            debt: trove.debt + pending_debt,
            pending_coll,
            pending_debt,
        })
    }

    pub fn nominal_icr(&self, owner: &Principal) -> Nicr {
        self.ledger_view().nominal_icr(owner)
    }

    /// Collateral ratio at `price`, including pending rewards.
    pub fn current_icr(&self, owner: &Principal, price: UsdColl) -> Ratio {
        match self.entire_debt_and_coll(owner) {
            Some(entire) => compute_collateral_ratio(entire.coll, entire.debt, price),
            None => Ratio::ZERO,
        }
    }

    pub fn entire_system_coll(&self) -> COLL {
        self.active_pool.coll + self.default_pool.coll
    }

    pub fn entire_system_debt(&self) -> KUSD {
        self.active_pool.debt + self.default_pool.debt
    }

    pub fn total_collateral_ratio(&self, price: UsdColl) -> Ratio {
        compute_collateral_ratio(self.entire_system_coll(), self.entire_system_debt(), price)
    }

    pub fn mode(&self, price: UsdColl) -> Mode {
        if self.total_collateral_ratio(price) < self.config.critical_collateral_ratio {
            Mode::Recovery
        } else {
            Mode::Normal
        }
    }

    /// Stake for a trove holding `coll`. Scaling by the liquidation snapshots
    /// keeps new troves from claiming rewards redistributed before they
    /// existed.
    pub fn compute_new_stake(&self, coll: COLL) -> COLL {
        if self.total_collateral_snapshot.is_zero() {
            coll
        } else {
            coll.mul_div(
                self.total_stakes_snapshot.raw(),
                self.total_collateral_snapshot.raw(),
            )
        }
    }

    pub fn coll_surplus_of(&self, owner: &Principal) -> COLL {
        self.coll_surplus.get(owner).copied().unwrap_or_default()
    }

    pub fn current_reward_snapshot(&self) -> RewardSnapshot {
        RewardSnapshot {
            l_coll: self.l_coll,
            l_debt: self.l_debt,
        }
    }

    fn trove_mut(&mut self, owner: &Principal) -> &mut Trove {
        match self.troves.get_mut(owner) {
            Some(trove) => trove,
            None => panic!("bug: no trove for {}", owner),
        }
    }

    /// Folds the trove's pending redistribution rewards into its recorded
    /// amounts and moves them from the default pool to the active pool.
    pub(crate) fn apply_pending_rewards(&mut self, owner: &Principal) -> (COLL, KUSD) {
        let (coll, debt) = self.pending_rewards(owner);
        let snapshot = self.current_reward_snapshot();
        let trove = self.trove_mut(owner);
        trove.coll += coll;
        trove.debt += debt;
        trove.reward_snapshot = snapshot;
        self.move_pending_trove_rewards_to_active_pool(coll, debt);
        (coll, debt)
    }

    fn move_pending_trove_rewards_to_active_pool(&mut self, coll: COLL, debt: KUSD) {
        self.default_pool.debt -= debt;
        self.active_pool.debt += debt;
        self.default_pool.coll -= coll;
        self.active_pool.coll += coll;
    }

    pub(crate) fn update_stake_and_total_stakes(&mut self, owner: &Principal) -> COLL {
        let (old_stake, coll) = {
            let trove = self.trove_mut(owner);
            (trove.stake, trove.coll)
        };
        let new_stake = self.compute_new_stake(coll);
        self.trove_mut(owner).stake = new_stake;
        self.total_stakes = self.total_stakes - old_stake + new_stake;
        new_stake
    }

    pub(crate) fn remove_stake(&mut self, owner: &Principal) {
        let trove = self.trove_mut(owner);
        let stake = trove.stake;
        trove.stake = COLL::ZERO;
        self.total_stakes -= stake;
    }

    /// Creates an active trove linked at `position` and reserves its gas
    /// compensation.
    pub(crate) fn insert_trove(
        &mut self,
        owner: Principal,
        coll: COLL,
        debt: KUSD,
        position: InsertPosition,
    ) {
        let trove = Trove {
            owner,
            coll,
            debt,
            stake: COLL::ZERO,
            status: TroveStatus::Active,
            reward_snapshot: self.current_reward_snapshot(),
            array_index: self.trove_owners.len() as u64,
        };
        self.troves.insert(owner, trove);
        self.update_stake_and_total_stakes(&owner);
        self.sorted_troves.link(owner, position);
        self.trove_owners.push(owner);
        self.active_pool.coll += coll;
        self.active_pool.debt += debt;
        self.gas_pool += self.config.gas_compensation;
    }

    /// Sets the trove's recorded amounts, keeping the active pool and the
    /// stakes in step, and moves the trove to `position`. Pending rewards
    /// must already be applied.
    pub(crate) fn set_trove_amounts(
        &mut self,
        owner: &Principal,
        coll: COLL,
        debt: KUSD,
        position: InsertPosition,
    ) {
        let trove = self.trove_mut(owner);
        let (old_coll, old_debt) = (trove.coll, trove.debt);
        trove.coll = coll;
        trove.debt = debt;
        self.active_pool.coll = self.active_pool.coll - old_coll + coll;
        self.active_pool.debt = self.active_pool.debt - old_debt + debt;
        self.update_stake_and_total_stakes(owner);
        self.relink(owner, position);
    }

    pub(crate) fn relink(&mut self, owner: &Principal, position: InsertPosition) {
        if let Err(err) = self.sorted_troves.remove(owner) {
            panic!("bug: failed to unlink {}: {:?}", owner, err);
        }
        self.sorted_troves.link(*owner, position);
    }

    /// Marks the trove closed and drops it from the owner array and the list.
    /// The caller moves its remaining amounts out of the pools.
    pub(crate) fn close_trove(&mut self, owner: &Principal, status: TroveStatus) {
        assert!(
            status != TroveStatus::Active && status != TroveStatus::NonExistent,
            "bug: closing {} with status {:?}",
            owner,
            status
        );
        assert!(
            self.trove_owners.len() > 1,
            "bug: closing the last trove in the system"
        );
        self.remove_stake(owner);
        let trove = self.trove_mut(owner);
        trove.status = status;
        trove.coll = COLL::ZERO;
        trove.debt = KUSD::ZERO;
        trove.reward_snapshot = RewardSnapshot::default();
        self.remove_trove_owner(owner);
        if let Err(err) = self.sorted_troves.remove(owner) {
            panic!("bug: closed trove {} was not listed: {:?}", owner, err);
        }
        log!(DEBUG, "[close_trove] {} closed: {:?}", owner, status);
    }

    // Swap-removes the owner, fixing the index of the moved entry.
    fn remove_trove_owner(&mut self, owner: &Principal) {
        let index = self.trove_mut(owner).array_index as usize;
        let last = match self.trove_owners.pop() {
            Some(last) => last,
            None => panic!("bug: empty trove owner array"),
        };
        if index < self.trove_owners.len() {
            self.trove_owners[index] = last;
            self.trove_mut(&last).array_index = index as u64;
        }
    }

    /// Spreads `debt` and `coll` over all active troves in proportion to
    /// their stakes. Truncation remainders are carried into the next
    /// redistribution.
    pub(crate) fn redistribute_debt_and_coll(&mut self, debt: KUSD, coll: COLL) {
        if debt.is_zero() {
            return;
        }
        assert!(
            !self.total_stakes.is_zero(),
            "bug: redistributing {} KUSD with no stakes",
            debt
        );
        let precision = U256::from(DECIMAL_PRECISION);
        let total_stakes = U256::from(self.total_stakes.raw());

        let coll_numerator =
            U256::from(coll.raw()) * precision + U256::from(self.last_coll_error_redistribution);
        let debt_numerator =
            U256::from(debt.raw()) * precision + U256::from(self.last_debt_error_redistribution);

        let coll_per_unit_staked = coll_numerator / total_stakes;
        let debt_per_unit_staked = debt_numerator / total_stakes;

        self.last_coll_error_redistribution =
            narrow(coll_numerator - coll_per_unit_staked * total_stakes);
        self.last_debt_error_redistribution =
            narrow(debt_numerator - debt_per_unit_staked * total_stakes);

        self.l_coll += narrow(coll_per_unit_staked);
        self.l_debt += narrow(debt_per_unit_staked);

        self.active_pool.debt -= debt;
        self.default_pool.debt += debt;
        self.active_pool.coll -= coll;
        self.default_pool.coll += coll;
        log!(
            DEBUG,
            "[redistribute] {} KUSD and {} collateral over {} stake",
            debt,
            coll,
            self.total_stakes
        );
    }

    pub(crate) fn update_system_snapshots_excluding_coll_remainder(&mut self, coll_remainder: COLL) {
        self.total_stakes_snapshot = self.total_stakes;
        self.total_collateral_snapshot = self.entire_system_coll() - coll_remainder;
    }

    pub(crate) fn add_coll_surplus(&mut self, owner: Principal, amount: COLL) {
        if amount.is_zero() {
            return;
        }
        *self.coll_surplus.entry(owner).or_default() += amount;
        self.total_coll_surplus += amount;
    }

    pub(crate) fn take_coll_surplus(&mut self, owner: &Principal) -> COLL {
        let amount = self.coll_surplus.remove(owner).unwrap_or_default();
        self.total_coll_surplus -= amount;
        amount
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        let active: Vec<&Trove> = self
            .troves
            .values()
            .filter(|trove| trove.status == TroveStatus::Active)
            .collect();

        ensure_eq!(
            active.len(),
            self.trove_owners.len(),
            "active troves and owner array disagree"
        );
        ensure_eq!(
            self.sorted_troves.len(),
            self.trove_owners.len() as u64,
            "trove list and owner array disagree"
        );
        for (index, owner) in self.trove_owners.iter().enumerate() {
            let trove = match self.troves.get(owner) {
                Some(trove) => trove,
                None => return Err(format!("owner {} has no trove", owner)),
            };
            ensure_eq!(
                trove.array_index,
                index as u64,
                "wrong array index for {}",
                owner
            );
            ensure!(
                self.sorted_troves.contains(owner),
                "active trove {} is not listed",
                owner
            );
            ensure!(!trove.debt.is_zero(), "active trove {} has no debt", owner);
        }

        let stakes: COLL = active.iter().map(|trove| trove.stake).sum();
        ensure_eq!(stakes, self.total_stakes, "total stakes mismatch");

        let view = self.ledger_view();
        let nicrs: Vec<Nicr> = self
            .sorted_troves
            .iter()
            .map(|id| view.nominal_icr(&id))
            .collect();
        // Redistribution rounding can perturb neighbours by a few wei.
        ensure!(
            nicrs
                .windows(2)
                .all(|pair| pair[0].saturating_add(pair[1] / NICR_ORDER_TOLERANCE) >= pair[1]),
            "trove list is out of order: {:?}",
            nicrs
        );

        let recorded_coll: COLL = active.iter().map(|trove| trove.coll).sum();
        let recorded_debt: KUSD = active.iter().map(|trove| trove.debt).sum();
        ensure_eq!(
            recorded_coll,
            self.active_pool.coll,
            "active pool collateral mismatch"
        );
        ensure_eq!(
            recorded_debt,
            self.active_pool.debt,
            "active pool debt mismatch"
        );

        let pending: (COLL, KUSD) = active
            .iter()
            .map(|trove| pending_rewards(trove, self.l_coll, self.l_debt))
            .fold((COLL::ZERO, KUSD::ZERO), |(c, d), (pc, pd)| (c + pc, d + pd));
        ensure!(
            pending.0 <= self.default_pool.coll && pending.1 <= self.default_pool.debt,
            "pending rewards {:?} exceed the default pool {:?}",
            pending,
            self.default_pool
        );
        let dust = REWARD_DUST_PER_TROVE * (active.len() as u128 + 1)
            + self.total_stakes.raw() / DECIMAL_PRECISION;
        ensure!(
            (self.default_pool.coll - pending.0).raw() <= dust
                && (self.default_pool.debt - pending.1).raw() <= dust,
            "default pool {:?} holds more than the pending rewards {:?}",
            self.default_pool,
            pending
        );

        let surplus: COLL = self.coll_surplus.values().copied().sum();
        ensure_eq!(
            surplus,
            self.total_coll_surplus,
            "collateral surplus mismatch"
        );
        ensure_eq!(
            self.gas_pool,
            KUSD::new(self.config.gas_compensation.raw() * self.trove_owners.len() as u128),
            "gas pool does not hold one compensation per trove"
        );

        self.stability_pool.check_invariants()
    }

    pub fn check_semantically_eq(&self, other: &Self) -> Result<(), String> {
        ensure_eq!(self.config, other.config, "config does not match");
        ensure_eq!(self.troves, other.troves, "troves do not match");
        ensure_eq!(
            self.trove_owners,
            other.trove_owners,
            "trove_owners does not match"
        );
        ensure_eq!(
            self.sorted_troves.iter().collect::<Vec<_>>(),
            other.sorted_troves.iter().collect::<Vec<_>>(),
            "trove list order does not match"
        );
        ensure_eq!(
            (self.total_stakes, self.total_stakes_snapshot, self.total_collateral_snapshot),
            (other.total_stakes, other.total_stakes_snapshot, other.total_collateral_snapshot),
            "stakes do not match"
        );
        ensure_eq!(
            (self.l_coll, self.l_debt),
            (other.l_coll, other.l_debt),
            "redistribution accumulators do not match"
        );
        ensure_eq!(
            (self.last_coll_error_redistribution, self.last_debt_error_redistribution),
            (other.last_coll_error_redistribution, other.last_debt_error_redistribution),
            "redistribution errors do not match"
        );
        ensure_eq!(self.active_pool, other.active_pool, "active pool does not match");
        ensure_eq!(self.default_pool, other.default_pool, "default pool does not match");
        ensure_eq!(self.coll_surplus, other.coll_surplus, "coll surplus does not match");
        ensure_eq!(self.gas_pool, other.gas_pool, "gas pool does not match");
        ensure_eq!(
            self.stability_pool,
            other.stability_pool,
            "stability pool does not match"
        );
        ensure_eq!(
            (self.base_rate, self.last_fee_operation_time),
            (other.base_rate, other.last_fee_operation_time),
            "fee state does not match"
        );
        Ok(())
    }
}
