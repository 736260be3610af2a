//! In-memory collaborators for tests.

use crate::management::{
    CollateralAccount, CollateralCustody, CollateralPool, Clock, DebtChange, DebtToken, FeeAmount,
    FeeRecipient, HostError, LedgerAccount, PriceFeed,
};
use crate::numeric::{UsdColl, COLL, KUSD};
use crate::state::State;
use candid::Principal;
use std::collections::BTreeMap;

/// Token balances, custody pools and debt bookkeeping kept in maps.
#[derive(Clone, Debug, Default)]
pub struct MockHost {
    pub kusd: BTreeMap<LedgerAccount, KUSD>,
    pub collateral: BTreeMap<CollateralAccount, COLL>,
    pub debt: BTreeMap<CollateralPool, KUSD>,
    pub price: UsdColl,
    pub now: u64,
    pub fees: Vec<FeeAmount>,
}

impl MockHost {
    pub fn new(price: UsdColl) -> Self {
        Self {
            price,
            ..Default::default()
        }
    }

    pub fn fund_collateral(&mut self, owner: Principal, amount: COLL) {
        *self
            .collateral
            .entry(CollateralAccount::User(owner))
            .or_default() += amount;
    }

    pub fn fund_kusd(&mut self, owner: Principal, amount: KUSD) {
        *self.kusd.entry(LedgerAccount::User(owner)).or_default() += amount;
    }

    pub fn kusd_of(&self, owner: Principal) -> KUSD {
        self.balance_of(LedgerAccount::User(owner))
    }

    pub fn collateral_of(&self, owner: Principal) -> COLL {
        self.collateral_balance(CollateralAccount::User(owner))
    }

    pub fn pool_collateral(&self, pool: CollateralPool) -> COLL {
        self.collateral_balance(CollateralAccount::Pool(pool))
    }

    pub fn pool_debt(&self, pool: CollateralPool) -> KUSD {
        self.debt.get(&pool).copied().unwrap_or_default()
    }

    pub fn total_kusd_supply(&self) -> KUSD {
        self.kusd.values().copied().sum()
    }

    pub fn set_price(&mut self, price: UsdColl) {
        self.price = price;
    }

    pub fn advance_time(&mut self, seconds: u64) {
        self.now += seconds;
    }

    /// Checks that the balances held here agree with the engine's books.
    pub fn check_matches(&self, state: &State) -> Result<(), String> {
        let checks = [
            (
                "active pool collateral",
                self.pool_collateral(CollateralPool::Active).raw(),
                state.active_pool.coll.raw(),
            ),
            (
                "active pool debt",
                self.pool_debt(CollateralPool::Active).raw(),
                state.active_pool.debt.raw(),
            ),
            (
                "default pool collateral",
                self.pool_collateral(CollateralPool::Default).raw(),
                state.default_pool.coll.raw(),
            ),
            (
                "default pool debt",
                self.pool_debt(CollateralPool::Default).raw(),
                state.default_pool.debt.raw(),
            ),
            (
                "stability pool collateral",
                self.pool_collateral(CollateralPool::StabilityPool).raw(),
                state.stability_pool.coll_balance().raw(),
            ),
            (
                "stability pool deposits",
                self.balance_of(LedgerAccount::StabilityPool).raw(),
                state.stability_pool.total_deposits().raw(),
            ),
            (
                "collateral surplus",
                self.pool_collateral(CollateralPool::CollSurplus).raw(),
                state.total_coll_surplus.raw(),
            ),
            (
                "gas pool",
                self.balance_of(LedgerAccount::GasPool).raw(),
                state.gas_pool.raw(),
            ),
            (
                "KUSD supply",
                self.total_kusd_supply().raw(),
                state.entire_system_debt().raw(),
            ),
        ];
        for (name, host, engine) in checks {
            if host != engine {
                return Err(format!("{}: host has {}, engine has {}", name, host, engine));
            }
        }
        Ok(())
    }

    fn debit_kusd(&mut self, account: LedgerAccount, amount: KUSD, method: &str) -> Result<(), HostError> {
        let balance = self.kusd.entry(account).or_default();
        match balance.checked_sub(amount) {
            Some(rest) => {
                *balance = rest;
                Ok(())
            }
            None => Err(HostError::new(
                method,
                format!("{:?} holds {} KUSD, needs {}", account, balance, amount),
            )),
        }
    }
}

impl DebtToken for MockHost {
    fn balance_of(&self, account: LedgerAccount) -> KUSD {
        self.kusd.get(&account).copied().unwrap_or_default()
    }

    fn mint(&mut self, to: LedgerAccount, amount: KUSD) -> Result<(), HostError> {
        *self.kusd.entry(to).or_default() += amount;
        Ok(())
    }

    fn burn(&mut self, from: LedgerAccount, amount: KUSD) -> Result<(), HostError> {
        self.debit_kusd(from, amount, "burn")
    }

    fn transfer(&mut self, from: LedgerAccount, to: LedgerAccount, amount: KUSD) -> Result<(), HostError> {
        self.debit_kusd(from, amount, "transfer")?;
        *self.kusd.entry(to).or_default() += amount;
        Ok(())
    }
}

impl CollateralCustody for MockHost {
    fn collateral_balance(&self, account: CollateralAccount) -> COLL {
        self.collateral.get(&account).copied().unwrap_or_default()
    }

    fn move_collateral(
        &mut self,
        from: CollateralAccount,
        to: CollateralAccount,
        amount: COLL,
    ) -> Result<(), HostError> {
        let balance = self.collateral.entry(from).or_default();
        match balance.checked_sub(amount) {
            Some(rest) => *balance = rest,
            None => {
                return Err(HostError::new(
                    "move_collateral",
                    format!("{:?} holds {}, needs {}", from, balance, amount),
                ))
            }
        }
        *self.collateral.entry(to).or_default() += amount;
        Ok(())
    }

    fn record_debt(&mut self, pool: CollateralPool, change: DebtChange) {
        let debt = self.debt.entry(pool).or_default();
        match change {
            DebtChange::Increase(amount) => *debt += amount,
            DebtChange::Decrease(amount) => *debt -= amount,
        }
    }
}

impl PriceFeed for MockHost {
    fn current_price(&mut self) -> UsdColl {
        self.price
    }
}

impl FeeRecipient for MockHost {
    fn receive_fee(&mut self, fee: FeeAmount) {
        self.fees.push(fee);
    }
}

impl Clock for MockHost {
    fn now_seconds(&self) -> u64 {
        self.now
    }
}
