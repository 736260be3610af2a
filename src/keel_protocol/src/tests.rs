use crate::liquidation::LiquidationKind;
use crate::management::{DebtToken, FeeAmount, LedgerAccount};
use crate::numeric::{compute_nominal_cr, Nicr, Ratio, UsdColl, COLL, DECIMAL_PRECISION, KUSD};
use crate::redemption::RedeemArg;
use crate::state::{Mode, TroveStatus};
use crate::test_helpers::MockHost;
use crate::trove::{AdjustTroveArg, OpenTroveArg, TroveUpdate};
use crate::{InitArg, InvariantViolation, Protocol, ProtocolError, StateError, ValidationError};
use assert_matches::assert_matches;
use candid::Principal;
use proptest::collection::vec as pvec;
use proptest::prelude::*;

const E18: u128 = DECIMAL_PRECISION;
const LIQUIDATOR: u8 = 9;
const THIRTY_DAYS: u64 = 30 * 24 * 3600;

fn user(n: u8) -> Principal {
    Principal::from_slice(&[n; 29])
}

fn setup(price: u128) -> (Protocol, MockHost) {
    setup_with(InitArg::default(), price)
}

fn setup_with(arg: InitArg, price: u128) -> (Protocol, MockHost) {
    let protocol = Protocol::init(arg).expect("failed to init protocol");
    (protocol, MockHost::new(UsdColl::from_units(price)))
}

fn open_arg(coll: u128, kusd: u128) -> OpenTroveArg {
    OpenTroveArg {
        max_fee_percentage: Ratio::ONE,
        coll: COLL::from_units(coll),
        kusd_amount: KUSD::from_units(kusd),
        upper_hint: None,
        lower_hint: None,
    }
}

fn open(protocol: &mut Protocol, host: &mut MockHost, owner: u8, coll: u128, kusd: u128) -> TroveUpdate {
    host.fund_collateral(user(owner), COLL::from_units(coll));
    protocol
        .open_trove(host, user(owner), open_arg(coll, kusd))
        .expect("failed to open trove")
}

fn check(protocol: &Protocol, host: &MockHost) {
    protocol.check_replay().unwrap();
    protocol.state().check_invariants().unwrap();
    host.check_matches(protocol.state()).unwrap();
}

fn assert_close(actual: u128, expected: u128, tolerance: u128) {
    assert!(
        actual.abs_diff(expected) <= tolerance,
        "expected {} within {} of {}",
        actual,
        tolerance,
        expected
    );
}

fn redeem_arg(protocol: &Protocol, host: &MockHost, kusd: u128) -> RedeemArg {
    let hints = protocol
        .state()
        .get_redemption_hints(KUSD::from_units(kusd), host.price, 0)
        .unwrap();
    RedeemArg {
        kusd_amount: KUSD::from_units(kusd),
        first_redemption_hint: hints.first_redemption_hint,
        upper_partial_redemption_hint: None,
        lower_partial_redemption_hint: None,
        partial_redemption_hint_nicr: hints.partial_redemption_hint_nicr,
        max_iterations: 0,
        max_fee_percentage: Ratio::ONE,
    }
}

#[test]
fn should_charge_floor_fee_then_raise_base_rate() {
    let (mut protocol, mut host) = setup(100);
    let first = open(&mut protocol, &mut host, 1, 200, 2_000);
    // 0.5% of 2000 plus the 200 KUSD gas compensation.
    assert_eq!(first.fee, KUSD::from_units(10));
    assert_eq!(first.debt, KUSD::from_units(2_210));
    assert!(protocol.state().base_rate > Ratio::ZERO);

    let second = open(&mut protocol, &mut host, 2, 200, 2_000);
    assert_eq!(second.fee, KUSD::from_units(100));
    assert_eq!(host.kusd_of(user(2)), KUSD::from_units(2_000));
    assert_eq!(host.balance_of(LedgerAccount::GasPool), KUSD::from_units(400));
    assert_eq!(
        host.fees,
        vec![FeeAmount::Kusd(first.fee), FeeAmount::Kusd(second.fee)]
    );
    check(&protocol, &host);
}

#[test]
fn should_reject_invalid_open_trove() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 200, 2_000);

    assert_matches!(
        protocol.open_trove(&mut host, user(1), open_arg(10, 2_000)),
        Err(ProtocolError::State(StateError::TroveAlreadyActive))
    );
    assert_matches!(
        protocol.open_trove(&mut host, user(2), open_arg(0, 2_000)),
        Err(ProtocolError::Validation(ValidationError::ZeroAmount))
    );
    assert_matches!(
        protocol.open_trove(&mut host, user(2), open_arg(100, 1_000)),
        Err(ProtocolError::Validation(ValidationError::NetDebtBelowMinimum { .. }))
    );
    assert_matches!(
        protocol.open_trove(&mut host, user(2), open_arg(20, 2_000)),
        Err(ProtocolError::InvariantViolation(InvariantViolation::IcrBelowMcr { .. }))
    );
    assert_matches!(
        protocol.open_trove(
            &mut host,
            user(2),
            OpenTroveArg {
                max_fee_percentage: Ratio::new(E18 / 1_000),
                ..open_arg(100, 2_000)
            }
        ),
        Err(ProtocolError::Validation(ValidationError::MaxFeeOutOfRange { .. }))
    );
    // The base rate is high after the first borrow, so 1% is not enough.
    assert_matches!(
        protocol.open_trove(
            &mut host,
            user(2),
            OpenTroveArg {
                max_fee_percentage: Ratio::new(E18 / 100),
                ..open_arg(100, 2_000)
            }
        ),
        Err(ProtocolError::Validation(ValidationError::FeeExceedsMaximum { .. }))
    );
    assert_matches!(
        protocol.open_trove(&mut host, user(2), open_arg(100, 2_000)),
        Err(ProtocolError::State(StateError::InsufficientCollateralBalance { .. }))
    );

    assert_eq!(protocol.state().trove_owners_count(), 1);
    assert_eq!(protocol.events().len(), 2);
    check(&protocol, &host);
}

#[test]
fn should_adjust_trove_both_ways() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 200, 2_000);
    let opened = open(&mut protocol, &mut host, 2, 50, 2_000);

    host.fund_collateral(user(2), COLL::from_units(10));
    let update = protocol
        .add_coll(&mut host, user(2), COLL::from_units(10), None, None)
        .unwrap();
    assert_eq!(update.coll, COLL::from_units(60));
    assert_eq!(update.debt, opened.debt);

    let update = protocol
        .withdraw_coll(&mut host, user(2), COLL::from_units(5), None, None)
        .unwrap();
    assert_eq!(update.coll, COLL::from_units(55));
    assert_eq!(host.collateral_of(user(2)), COLL::from_units(5));

    let update = protocol
        .withdraw_kusd(&mut host, user(2), Ratio::ONE, KUSD::from_units(100), None, None)
        .unwrap();
    assert_eq!(update.debt, opened.debt + KUSD::from_units(100) + update.fee);
    assert_eq!(host.kusd_of(user(2)), KUSD::from_units(2_100));

    let update = protocol
        .repay_kusd(&mut host, user(2), KUSD::from_units(300), None, None)
        .unwrap();
    assert_eq!(host.kusd_of(user(2)), KUSD::from_units(1_800));
    assert_eq!(protocol.state().trove(&user(2)).unwrap().debt, update.debt);

    assert_matches!(
        protocol.adjust_trove(
            &mut host,
            user(2),
            AdjustTroveArg {
                coll_deposit: COLL::from_units(1),
                coll_withdrawal: COLL::from_units(1),
                ..Default::default()
            }
        ),
        Err(ProtocolError::Validation(ValidationError::SingularCollateralChange))
    );
    assert_matches!(
        protocol.adjust_trove(&mut host, user(2), AdjustTroveArg::default()),
        Err(ProtocolError::Validation(ValidationError::NoAdjustment))
    );
    assert_matches!(
        protocol.repay_kusd(&mut host, user(2), KUSD::from_units(1_000), None, None),
        Err(ProtocolError::Validation(ValidationError::NetDebtBelowMinimum { .. }))
    );
    assert_matches!(
        protocol.withdraw_coll(&mut host, user(2), COLL::from_units(1_000), None, None),
        Err(ProtocolError::Validation(ValidationError::WithdrawalExceedsCollateral { .. }))
    );
    assert_matches!(
        protocol.add_coll(&mut host, user(3), COLL::from_units(1), None, None),
        Err(ProtocolError::State(StateError::TroveNotActive))
    );
    check(&protocol, &host);
}

#[test]
fn should_close_trove_and_keep_the_last_one() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 100, 5_000);
    let opened = open(&mut protocol, &mut host, 2, 30, 2_000);

    // The fee was added to the debt but never minted to the borrower.
    assert_matches!(
        protocol.close_trove(&mut host, user(2)),
        Err(ProtocolError::State(StateError::InsufficientKusdBalance { .. }))
    );
    host.transfer(
        LedgerAccount::User(user(1)),
        LedgerAccount::User(user(2)),
        opened.fee,
    )
    .unwrap();

    let closed = protocol.close_trove(&mut host, user(2)).unwrap();
    assert_eq!(closed.coll_returned, COLL::from_units(30));
    assert_eq!(closed.debt_repaid, opened.debt - KUSD::from_units(200));
    assert_eq!(host.collateral_of(user(2)), COLL::from_units(30));
    assert_eq!(host.kusd_of(user(2)), KUSD::ZERO);
    assert_eq!(protocol.state().trove_status(&user(2)), TroveStatus::ClosedByOwner);

    assert_matches!(
        protocol.close_trove(&mut host, user(2)),
        Err(ProtocolError::State(StateError::TroveNotActive))
    );
    assert_matches!(
        protocol.close_trove(&mut host, user(1)),
        Err(ProtocolError::State(StateError::OnlyOneTroveInSystem))
    );
    check(&protocol, &host);

    // A closed trove can be opened again.
    open(&mut protocol, &mut host, 2, 30, 2_000);
    check(&protocol, &host);
}

#[test]
fn should_liquidate_trove_whose_ratio_halves() {
    let (mut protocol, mut host) = setup(100);
    let rich = open(&mut protocol, &mut host, 1, 200, 2_000);
    let risky = open(&mut protocol, &mut host, 2, 46, 2_000);
    assert_eq!(risky.debt, KUSD::from_units(2_300));
    assert_eq!(
        protocol.state().current_icr(&user(2), host.price),
        Ratio::new(2 * E18)
    );
    assert_matches!(
        protocol.liquidate(&mut host, user(LIQUIDATOR), user(2)),
        Err(ProtocolError::State(StateError::NothingToLiquidate))
    );

    host.set_price(UsdColl::from_units(50));
    assert_eq!(protocol.state().current_icr(&user(2), host.price), Ratio::ONE);
    let plan = protocol
        .liquidate(&mut host, user(LIQUIDATOR), user(2))
        .unwrap();
    assert_eq!(plan.liquidated_owners(), vec![user(2)]);
    let single = &plan.liquidations[0];
    assert_eq!(single.kind, LiquidationKind::Normal);
    assert_eq!(single.debt_to_offset, KUSD::ZERO);
    assert_eq!(single.debt_to_redistribute, risky.debt);
    assert_eq!(single.coll_gas_compensation, COLL::new(46 * E18 / 200));
    assert_eq!(host.kusd_of(user(LIQUIDATOR)), KUSD::from_units(200));
    assert_eq!(host.collateral_of(user(LIQUIDATOR)), single.coll_gas_compensation);
    assert_eq!(
        protocol.state().trove_status(&user(2)),
        TroveStatus::ClosedByLiquidation
    );

    // The only other trove absorbs everything.
    let entire = protocol.state().entire_debt_and_coll(&user(1)).unwrap();
    assert_close(entire.debt.raw(), (rich.debt + risky.debt).raw(), 1_000);
    assert_close(
        entire.coll.raw(),
        (rich.coll + single.coll_to_redistribute).raw(),
        1_000,
    );
    check(&protocol, &host);

    host.fund_collateral(user(1), COLL::from_units(1));
    protocol
        .add_coll(&mut host, user(1), COLL::from_units(1), None, None)
        .unwrap();
    let trove = protocol.state().trove(&user(1)).unwrap();
    assert_eq!(trove.debt, entire.debt);
    assert_eq!(trove.coll, entire.coll + COLL::from_units(1));
    check(&protocol, &host);
}

#[test]
fn should_gate_adjustments_in_recovery_mode() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 60, 2_000);
    open(&mut protocol, &mut host, 2, 60, 2_000);

    // 120 collateral against 4510 KUSD at 45.1 is a TCR of exactly 120%.
    host.set_price(UsdColl::new(45_100_000_000_000_000_000));
    let state = protocol.state();
    assert_eq!(
        state.total_collateral_ratio(host.price),
        Ratio::new(1_200_000_000_000_000_000)
    );
    assert_eq!(state.mode(host.price), Mode::Recovery);

    assert_matches!(
        protocol.withdraw_coll(&mut host, user(2), COLL::from_units(1), None, None),
        Err(ProtocolError::InvariantViolation(
            InvariantViolation::CollateralWithdrawalInRecovery
        ))
    );
    assert_matches!(
        protocol.withdraw_kusd(&mut host, user(1), Ratio::ONE, KUSD::from_units(100), None, None),
        Err(ProtocolError::InvariantViolation(InvariantViolation::IcrBelowCcr { .. }))
    );
    assert_matches!(
        protocol.close_trove(&mut host, user(1)),
        Err(ProtocolError::InvariantViolation(
            InvariantViolation::OperationForbiddenInRecovery
        ))
    );
    host.fund_collateral(user(3), COLL::from_units(60));
    assert_matches!(
        protocol.open_trove(&mut host, user(3), open_arg(60, 2_000)),
        Err(ProtocolError::InvariantViolation(InvariantViolation::IcrBelowCcr { .. }))
    );

    let icr_before = protocol.state().current_icr(&user(2), host.price);
    host.fund_collateral(user(2), COLL::from_units(10));
    protocol
        .add_coll(&mut host, user(2), COLL::from_units(10), None, None)
        .unwrap();
    let icr_after = protocol.state().current_icr(&user(2), host.price);
    assert!(icr_after > icr_before);
    assert!(icr_after < protocol.state().config.critical_collateral_ratio);

    protocol
        .repay_kusd(&mut host, user(1), KUSD::from_units(100), None, None)
        .unwrap();

    // Borrowing is allowed once the trove ends above CCR, and is free.
    host.fund_collateral(user(2), COLL::from_units(30));
    let update = protocol
        .adjust_trove(
            &mut host,
            user(2),
            AdjustTroveArg {
                max_fee_percentage: Ratio::ONE,
                coll_deposit: COLL::from_units(30),
                kusd_change: KUSD::from_units(100),
                is_debt_increase: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(update.fee, KUSD::ZERO);
    assert!(protocol.state().current_icr(&user(2), host.price) >= protocol.state().config.critical_collateral_ratio);
    check(&protocol, &host);
}

#[test]
fn should_cap_liquidation_between_mcr_and_ccr() {
    let arg = InitArg {
        capped_liquidation_ratio: Some("1.1".to_string()),
        ..Default::default()
    };
    let (mut protocol, mut host) = setup_with(arg, 100);
    open(&mut protocol, &mut host, 1, 205, 10_000);
    let second = open(&mut protocol, &mut host, 2, 40, 2_000);
    open(&mut protocol, &mut host, 3, 40, 2_000);
    assert_eq!(second.debt, KUSD::from_units(2_300));
    protocol
        .provide_to_stability_pool(&mut host, user(1), KUSD::from_units(10_000))
        .unwrap();

    host.set_price(UsdColl::from_units(75));
    assert_eq!(protocol.state().mode(host.price), Mode::Recovery);
    // Exactly at CCR: not eligible.
    assert_eq!(
        protocol.state().current_icr(&user(1), host.price),
        protocol.state().config.critical_collateral_ratio
    );
    assert_matches!(
        protocol.liquidate(&mut host, user(LIQUIDATOR), user(1)),
        Err(ProtocolError::State(StateError::NothingToLiquidate))
    );

    let plan = protocol
        .liquidate(&mut host, user(LIQUIDATOR), user(2))
        .unwrap();
    let single = &plan.liquidations[0];
    assert_eq!(single.kind, LiquidationKind::Capped);
    assert_eq!(single.debt_to_offset, second.debt);
    assert_eq!(single.debt_to_redistribute, KUSD::ZERO);
    let seized = KUSD::from_units(2_530) / UsdColl::from_units(75);
    let surplus = COLL::from_units(40) - seized;
    assert_eq!(single.coll_surplus, surplus);
    assert_eq!(single.coll_gas_compensation, COLL::new(seized.raw() / 200));
    assert_eq!(protocol.state().coll_surplus_of(&user(2)), surplus);
    check(&protocol, &host);

    // Still in Recovery Mode: the sequence takes the other capped trove and
    // stops at the last one.
    assert_eq!(protocol.state().mode(host.price), Mode::Recovery);
    let plan = protocol
        .liquidate_troves(&mut host, user(LIQUIDATOR), 10)
        .unwrap();
    assert_eq!(plan.liquidated_owners(), vec![user(3)]);
    assert_eq!(protocol.state().mode(host.price), Mode::Normal);
    assert_close(
        protocol.state().stability_pool.compounded_deposit(&user(1)).raw(),
        KUSD::from_units(5_400).raw(),
        E18 / 1_000_000,
    );

    assert_eq!(
        protocol.claim_collateral(&mut host, user(2)).unwrap(),
        surplus
    );
    assert_eq!(host.collateral_of(user(2)), surplus);
    assert_matches!(
        protocol.claim_collateral(&mut host, user(2)),
        Err(ProtocolError::State(StateError::NothingToClaim))
    );
    check(&protocol, &host);
}

#[test]
fn should_seize_everything_with_default_capped_ratio() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 205, 10_000);
    open(&mut protocol, &mut host, 2, 40, 2_000);
    open(&mut protocol, &mut host, 3, 40, 2_000);
    protocol
        .provide_to_stability_pool(&mut host, user(1), KUSD::from_units(10_000))
        .unwrap();
    host.set_price(UsdColl::from_units(75));

    let plan = protocol
        .liquidate(&mut host, user(LIQUIDATOR), user(2))
        .unwrap();
    assert_eq!(plan.liquidations[0].kind, LiquidationKind::Capped);
    assert_eq!(plan.liquidations[0].coll_surplus, COLL::ZERO);
    assert_eq!(protocol.state().coll_surplus_of(&user(2)), COLL::ZERO);
    check(&protocol, &host);
}

#[test]
fn should_split_liquidation_between_three_depositors() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 1_000, 40_000);
    let risky = open(&mut protocol, &mut host, 5, 250, 18_000);
    for depositor in [2, 3] {
        host.transfer(
            LedgerAccount::User(user(1)),
            LedgerAccount::User(user(depositor)),
            KUSD::from_units(10_000),
        )
        .unwrap();
    }
    for depositor in [1, 2, 3] {
        let gain = protocol
            .provide_to_stability_pool(&mut host, user(depositor), KUSD::from_units(10_000))
            .unwrap();
        assert_eq!(gain, COLL::ZERO);
    }

    host.set_price(UsdColl::from_units(80));
    let plan = protocol
        .liquidate_troves(&mut host, user(LIQUIDATOR), 1)
        .unwrap();
    assert_eq!(plan.liquidated_owners(), vec![user(5)]);
    assert_eq!(plan.totals.debt_to_offset, risky.debt);
    assert_eq!(plan.totals.debt_to_redistribute, KUSD::ZERO);

    let remaining = (KUSD::from_units(30_000) - risky.debt).raw() / 3;
    let gain = plan.totals.coll_to_send_to_sp.raw() / 3;
    let pool = &protocol.state().stability_pool;
    for depositor in [1, 2, 3] {
        assert_close(pool.compounded_deposit(&user(depositor)).raw(), remaining, E18 / 1_000_000);
        assert_close(pool.depositor_coll_gain(&user(depositor)).raw(), gain, E18 / 1_000_000);
    }
    check(&protocol, &host);

    let trove_coll = protocol.state().trove(&user(1)).unwrap().coll;
    let moved = protocol
        .withdraw_coll_gain_to_trove(&mut host, user(1), None, None)
        .unwrap();
    assert_close(moved.raw(), gain, E18 / 1_000_000);
    assert_eq!(protocol.state().trove(&user(1)).unwrap().coll, trove_coll + moved);
    assert_matches!(
        protocol.withdraw_coll_gain_to_trove(&mut host, user(1), None, None),
        Err(ProtocolError::State(StateError::NoCollateralGain))
    );
    assert_matches!(
        protocol.withdraw_coll_gain_to_trove(&mut host, user(2), None, None),
        Err(ProtocolError::State(StateError::TroveNotActive))
    );

    assert_matches!(
        protocol.withdraw_from_stability_pool(&mut host, user(2), KUSD::from_units(5_000)),
        Err(ProtocolError::Validation(ValidationError::AmountExceedsDeposit { .. }))
    );
    let available = protocol.state().stability_pool.withdrawable_deposit(&user(3));
    let withdrawn = protocol
        .withdraw_from_stability_pool(&mut host, user(3), available)
        .unwrap();
    assert_eq!(withdrawn.kusd_withdrawn, available);
    assert_eq!(host.kusd_of(user(3)), available);
    assert_close(withdrawn.coll_gain.raw(), gain, E18 / 1_000_000);
    assert_eq!(host.collateral_of(user(3)), withdrawn.coll_gain);
    assert_matches!(
        protocol.withdraw_from_stability_pool(&mut host, user(4), KUSD::ZERO),
        Err(ProtocolError::State(StateError::NoDeposit))
    );
    check(&protocol, &host);
}

#[test]
fn should_refuse_deposit_withdrawal_while_troves_are_undercollateralized() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 1_000, 10_000);
    open(&mut protocol, &mut host, 2, 30, 2_000);
    protocol
        .provide_to_stability_pool(&mut host, user(1), KUSD::from_units(5_000))
        .unwrap();

    host.set_price(UsdColl::from_units(80));
    assert!(protocol.state().has_undercollateralized_troves(host.price));
    assert_matches!(
        protocol.withdraw_from_stability_pool(&mut host, user(1), KUSD::from_units(1)),
        Err(ProtocolError::InvariantViolation(
            InvariantViolation::UnderCollateralizedTroves
        ))
    );
    // Claiming the gain alone is still allowed.
    protocol
        .withdraw_from_stability_pool(&mut host, user(1), KUSD::ZERO)
        .unwrap();
    assert_matches!(
        protocol.provide_to_stability_pool(&mut host, user(1), KUSD::ZERO),
        Err(ProtocolError::Validation(ValidationError::ZeroAmount))
    );
    check(&protocol, &host);
}

fn sequence_setup() -> (Protocol, MockHost) {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 100, 2_000);
    open(&mut protocol, &mut host, 2, 30, 2_000);
    open(&mut protocol, &mut host, 3, 28, 2_000);
    host.set_price(UsdColl::from_units(85));
    (protocol, host)
}

#[test]
fn should_stop_sequence_at_first_healthy_trove() {
    let (mut protocol, mut host) = sequence_setup();
    assert!(protocol.state().current_icr(&user(2), host.price) >= protocol.state().config.minimum_collateral_ratio);
    let plan = protocol
        .liquidate_troves(&mut host, user(LIQUIDATOR), 10)
        .unwrap();
    assert_eq!(plan.liquidated_owners(), vec![user(3)]);
    check(&protocol, &host);
}

#[test]
fn should_skip_ineligible_troves_in_batch() {
    let (mut protocol, mut host) = sequence_setup();
    assert_matches!(
        protocol.batch_liquidate_troves(&mut host, user(LIQUIDATOR), &[]),
        Err(ProtocolError::Validation(ValidationError::EmptyTroveList))
    );
    assert_matches!(
        protocol.batch_liquidate_troves(&mut host, user(LIQUIDATOR), &[user(2), user(1)]),
        Err(ProtocolError::State(StateError::NothingToLiquidate))
    );
    assert_matches!(
        protocol.liquidate(&mut host, user(LIQUIDATOR), user(7)),
        Err(ProtocolError::State(StateError::TroveNotActive))
    );
    let events = protocol.events().len();

    let plan = protocol
        .batch_liquidate_troves(&mut host, user(LIQUIDATOR), &[user(1), user(3), user(3), user(7)])
        .unwrap();
    assert_eq!(plan.liquidated_owners(), vec![user(3)]);
    assert_eq!(protocol.events().len(), events + 1);
    check(&protocol, &host);
}

#[test]
fn should_never_liquidate_the_last_trove() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 40, 2_000);
    open(&mut protocol, &mut host, 2, 40, 2_000);
    host.set_price(UsdColl::from_units(50));

    let plan = protocol
        .liquidate_troves(&mut host, user(LIQUIDATOR), 10)
        .unwrap();
    assert_eq!(plan.liquidations.len(), 1);
    assert_eq!(protocol.state().trove_owners_count(), 1);
    assert_matches!(
        protocol.liquidate_troves(&mut host, user(LIQUIDATOR), 10),
        Err(ProtocolError::State(StateError::NothingToLiquidate))
    );
    check(&protocol, &host);
}

fn redemption_setup() -> (Protocol, MockHost) {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 100, 5_000);
    open(&mut protocol, &mut host, 2, 30, 2_000);
    open(&mut protocol, &mut host, 3, 200, 2_000);
    // Let the base rate decay from its cap.
    host.advance_time(THIRTY_DAYS);
    (protocol, host)
}

#[test]
fn should_close_trove_fully_redeemed() {
    let (mut protocol, mut host) = redemption_setup();
    let arg = redeem_arg(&protocol, &host, 2_100);
    assert_eq!(arg.first_redemption_hint, Some(user(2)));
    assert_eq!(arg.partial_redemption_hint_nicr, 0);

    let plan = protocol
        .redeem_collateral(&mut host, user(1), arg)
        .unwrap();
    assert_eq!(plan.total_kusd, KUSD::from_units(2_100));
    assert_eq!(plan.total_coll, COLL::from_units(21));
    assert_eq!(plan.closed_troves().count(), 1);
    assert!(plan.coll_fee > COLL::ZERO);
    assert_eq!(host.fees.last(), Some(&FeeAmount::Coll(plan.coll_fee)));
    assert_eq!(host.collateral_of(user(1)), plan.total_coll - plan.coll_fee);
    assert_eq!(host.kusd_of(user(1)), KUSD::from_units(2_900));

    let state = protocol.state();
    assert_eq!(state.trove_status(&user(2)), TroveStatus::ClosedByRedemption);
    assert_eq!(state.coll_surplus_of(&user(2)), COLL::from_units(9));
    assert_eq!(state.base_rate, plan.base_rate);
    check(&protocol, &host);

    assert_eq!(
        protocol.claim_collateral(&mut host, user(2)).unwrap(),
        COLL::from_units(9)
    );
    check(&protocol, &host);
}

#[test]
fn should_redeem_partially_with_matching_hint() {
    let (mut protocol, mut host) = redemption_setup();
    let arg = redeem_arg(&protocol, &host, 2_600);
    assert_eq!(
        arg.partial_redemption_hint_nicr,
        compute_nominal_cr(COLL::from_units(95), KUSD::from_units(4_725))
    );

    let plan = protocol
        .redeem_collateral(&mut host, user(1), arg)
        .unwrap();
    assert_eq!(plan.redeemed.len(), 2);
    assert_eq!(plan.total_kusd, KUSD::from_units(2_600));
    let trove = protocol.state().trove(&user(1)).unwrap();
    assert_eq!(trove.coll, COLL::from_units(95));
    assert_eq!(trove.debt, KUSD::from_units(4_725));
    check(&protocol, &host);
}

#[test]
fn should_cancel_partial_redemption_on_stale_hint() {
    let (mut protocol, mut host) = redemption_setup();
    let arg = RedeemArg {
        partial_redemption_hint_nicr: 1,
        ..redeem_arg(&protocol, &host, 2_600)
    };
    let plan = protocol
        .redeem_collateral(&mut host, user(1), arg)
        .unwrap();
    assert_eq!(plan.total_kusd, KUSD::from_units(2_100));
    assert_eq!(host.kusd_of(user(1)), KUSD::from_units(2_900));
    check(&protocol, &host);
}

#[test]
fn should_reject_invalid_redemptions() {
    let (mut protocol, mut host) = redemption_setup();
    let arg = redeem_arg(&protocol, &host, 3_000);
    assert_matches!(
        protocol.redeem_collateral(&mut host, user(2), arg),
        Err(ProtocolError::State(StateError::InsufficientKusdBalance { .. }))
    );
    let arg = RedeemArg {
        kusd_amount: KUSD::ZERO,
        ..redeem_arg(&protocol, &host, 100)
    };
    assert_matches!(
        protocol.redeem_collateral(&mut host, user(1), arg),
        Err(ProtocolError::Validation(ValidationError::ZeroAmount))
    );
    let arg = RedeemArg {
        max_fee_percentage: Ratio::ZERO,
        ..redeem_arg(&protocol, &host, 100)
    };
    assert_matches!(
        protocol.redeem_collateral(&mut host, user(1), arg),
        Err(ProtocolError::Validation(ValidationError::MaxFeeOutOfRange { .. }))
    );
    // A stale hint cancels the partial redemption of the first trove.
    let arg = RedeemArg {
        partial_redemption_hint_nicr: 1,
        ..redeem_arg(&protocol, &host, 100)
    };
    assert_matches!(
        protocol.redeem_collateral(&mut host, user(1), arg),
        Err(ProtocolError::State(StateError::UnableToRedeem))
    );
    assert_eq!(protocol.events().len(), 4);
    check(&protocol, &host);
}

#[test]
fn should_truncate_redemption_hints_before_the_last_trove() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 100, 5_000);
    open(&mut protocol, &mut host, 2, 30, 2_000);
    host.advance_time(THIRTY_DAYS);

    let hints = protocol
        .state()
        .get_redemption_hints(KUSD::from_units(20_000), host.price, 0)
        .unwrap();
    assert_eq!(hints.first_redemption_hint, Some(user(2)));
    assert_eq!(hints.partial_redemption_hint_nicr, 0);
    assert_eq!(hints.truncated_kusd_amount, KUSD::from_units(2_100));

    let arg = RedeemArg {
        kusd_amount: hints.truncated_kusd_amount,
        ..redeem_arg(&protocol, &host, 20_000)
    };
    let plan = protocol
        .redeem_collateral(&mut host, user(1), arg)
        .unwrap();
    assert_eq!(plan.total_kusd, hints.truncated_kusd_amount);
    assert_eq!(
        protocol.state().trove_status(&user(2)),
        TroveStatus::ClosedByRedemption
    );
    assert!(protocol.state().is_active(&user(1)));
    check(&protocol, &host);
}

#[test]
fn should_bound_search_for_first_redemption_candidate() {
    let arg = InitArg {
        max_hint_walk: Some(2),
        ..Default::default()
    };
    let (mut protocol, mut host) = setup_with(arg, 100);
    let first = open(&mut protocol, &mut host, 1, 400, 10_000);
    for (n, kusd) in [(2, 2_000), (3, 2_010), (4, 2_020)] {
        open(&mut protocol, &mut host, n, 26, kusd);
    }
    host.advance_time(THIRTY_DAYS);
    host.set_price(UsdColl::from_units(95));
    let mcr = protocol.state().config.minimum_collateral_ratio;
    for n in 2..=4 {
        assert!(protocol.state().current_icr(&user(n), host.price) < mcr);
    }

    // Three troves below MCR sit under the only redeemable one.
    assert_matches!(
        protocol
            .state()
            .get_redemption_hints(KUSD::from_units(1_000), host.price, 0),
        Err(ValidationError::HintOutOfRange)
    );
    let lot = KUSD::from_units(1_000);
    let arg = RedeemArg {
        kusd_amount: lot,
        first_redemption_hint: None,
        upper_partial_redemption_hint: None,
        lower_partial_redemption_hint: None,
        partial_redemption_hint_nicr: compute_nominal_cr(
            COLL::from_units(400) - lot / host.price,
            first.debt - lot,
        ),
        max_iterations: 0,
        max_fee_percentage: Ratio::ONE,
    };
    assert_matches!(
        protocol.redeem_collateral(&mut host, user(2), arg.clone()),
        Err(ProtocolError::Validation(ValidationError::HintOutOfRange))
    );
    assert_eq!(protocol.events().len(), 5);

    let arg = RedeemArg {
        first_redemption_hint: Some(user(1)),
        ..arg
    };
    let plan = protocol
        .redeem_collateral(&mut host, user(2), arg)
        .unwrap();
    assert_eq!(plan.total_kusd, lot);
    assert_eq!(plan.redeemed.len(), 1);
    assert_eq!(plan.redeemed[0].owner, user(1));
    check(&protocol, &host);
}

fn assert_troves_add_up(protocol: &Protocol, owners: &[Principal]) {
    let state = protocol.state();
    let (coll, debt) = owners.iter().fold((0u128, 0u128), |(coll, debt), owner| {
        let entire = state.entire_debt_and_coll(owner).unwrap();
        (coll + entire.coll.raw(), debt + entire.debt.raw())
    });
    let system_coll = (state.active_pool.coll + state.default_pool.coll).raw();
    let system_debt = state.entire_system_debt().raw();
    assert!(coll <= system_coll && debt <= system_debt);
    assert_close(coll, system_coll, 10_000);
    assert_close(debt, system_debt, 10_000);
}

#[test]
fn should_redistribute_across_restaked_troves() {
    let (mut protocol, mut host) = setup(100);
    open(&mut protocol, &mut host, 1, 400, 10_000);
    open(&mut protocol, &mut host, 2, 32, 2_000);
    open(&mut protocol, &mut host, 3, 100, 3_000);
    let fourth = open(&mut protocol, &mut host, 4, 27, 2_000);

    host.set_price(UsdColl::from_units(84));
    protocol
        .liquidate(&mut host, user(LIQUIDATOR), user(4))
        .unwrap();
    // Stakes still equal collateral: the first trove takes 400/532.
    let redistributed_coll = 27 * E18 - 27 * E18 / 200;
    let (pending_coll, pending_debt) = protocol.state().pending_rewards(&user(1));
    assert_close(pending_coll.raw(), redistributed_coll * 400 / 532, 1_000);
    assert_close(pending_debt.raw(), fourth.debt.raw() * 400 / 532, 1_000);
    assert_troves_add_up(&protocol, &[user(1), user(2), user(3)]);

    host.fund_collateral(user(3), COLL::from_units(50));
    protocol
        .add_coll(&mut host, user(3), COLL::from_units(50), None, None)
        .unwrap();
    let restaked = protocol.state().trove(&user(3)).unwrap();
    assert!(restaked.stake < restaked.coll);
    assert_troves_add_up(&protocol, &[user(1), user(2), user(3)]);

    host.set_price(UsdColl::from_units(75));
    protocol
        .liquidate(&mut host, user(LIQUIDATOR), user(2))
        .unwrap();
    assert_troves_add_up(&protocol, &[user(1), user(3)]);
    check(&protocol, &host);
}

#[test]
fn should_sample_approximate_hints() {
    let (mut protocol, mut host) = setup(100);
    assert_matches!(
        protocol.state().get_approx_hint(E18, 10, 1),
        Err(ValidationError::EmptyTroveList)
    );
    for (n, coll) in [(1, 100), (2, 60), (3, 200), (4, 45)] {
        open(&mut protocol, &mut host, n, coll, 2_000);
    }
    let state = protocol.state();
    let target: Nicr = state.nominal_icr(&user(2));
    let hint = state.get_approx_hint(target, 20, 42).unwrap();
    assert!(state.is_active(&hint.hint));
    assert_eq!(hint.diff, state.nominal_icr(&hint.hint).abs_diff(target));
    assert_eq!(state.get_approx_hint(target, 20, 42).unwrap(), hint);

    host.fund_collateral(user(5), COLL::from_units(61));
    protocol
        .open_trove(
            &mut host,
            user(5),
            OpenTroveArg {
                upper_hint: Some(hint.hint),
                lower_hint: Some(hint.hint),
                ..open_arg(61, 2_000)
            },
        )
        .unwrap();
    check(&protocol, &host);
}

#[test]
fn should_rebuild_state_from_events() {
    let (mut protocol, mut host) = redemption_setup();
    protocol
        .provide_to_stability_pool(&mut host, user(1), KUSD::from_units(3_000))
        .unwrap();
    host.set_price(UsdColl::from_units(70));
    protocol
        .liquidate_troves(&mut host, user(LIQUIDATOR), 5)
        .unwrap();
    host.set_price(UsdColl::from_units(100));
    let arg = redeem_arg(&protocol, &host, 500);
    protocol.redeem_collateral(&mut host, user(3), arg).unwrap();
    protocol
        .withdraw_from_stability_pool(&mut host, user(1), KUSD::ZERO)
        .unwrap();

    // Init, three opens, then one event per operation above.
    assert_eq!(protocol.events().len(), 8);
    let replayed = crate::event::replay(protocol.events().iter()).unwrap();
    replayed.check_semantically_eq(protocol.state()).unwrap();
    check(&protocol, &host);
}

#[derive(Clone, Debug)]
enum Op {
    Open { owner: u8, coll: u128, kusd: u128 },
    AddColl { owner: u8, coll: u128 },
    WithdrawColl { owner: u8, coll: u128 },
    Borrow { owner: u8, kusd: u128 },
    Repay { owner: u8, kusd: u128 },
    Close { owner: u8 },
    Provide { owner: u8, kusd: u128 },
    Withdraw { owner: u8, kusd: u128 },
    Redeem { owner: u8, kusd: u128 },
    Liquidate { n: u64 },
    SetPrice { price: u128 },
    Wait { minutes: u64 },
}

fn arb_owner() -> impl Strategy<Value = u8> {
    1..=5u8
}

fn arb_trove_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (arb_owner(), 20..400u128, 1_800..6_000u128)
            .prop_map(|(owner, coll, kusd)| Op::Open { owner, coll, kusd }),
        1 => (arb_owner(), 1..50u128).prop_map(|(owner, coll)| Op::AddColl { owner, coll }),
        1 => (arb_owner(), 1..50u128).prop_map(|(owner, coll)| Op::WithdrawColl { owner, coll }),
        1 => (arb_owner(), 1..2_000u128).prop_map(|(owner, kusd)| Op::Borrow { owner, kusd }),
        1 => (arb_owner(), 1..2_000u128).prop_map(|(owner, kusd)| Op::Repay { owner, kusd }),
        1 => arb_owner().prop_map(|owner| Op::Close { owner }),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => arb_trove_op(),
        1 => (arb_owner(), 1..3_000u128).prop_map(|(owner, kusd)| Op::Provide { owner, kusd }),
        1 => (arb_owner(), 0..3_000u128).prop_map(|(owner, kusd)| Op::Withdraw { owner, kusd }),
        1 => (arb_owner(), 1..3_000u128).prop_map(|(owner, kusd)| Op::Redeem { owner, kusd }),
        1 => (1..4u64).prop_map(|n| Op::Liquidate { n }),
        1 => (40..200u128).prop_map(|price| Op::SetPrice { price }),
        1 => (0..2_000u64).prop_map(|minutes| Op::Wait { minutes }),
    ]
}

fn apply(protocol: &mut Protocol, host: &mut MockHost, op: &Op) -> Result<(), ProtocolError> {
    match *op {
        Op::Open { owner, coll, kusd } => {
            host.fund_collateral(user(owner), COLL::from_units(coll));
            protocol
                .open_trove(host, user(owner), open_arg(coll, kusd))
                .map(|_| ())
        }
        Op::AddColl { owner, coll } => {
            host.fund_collateral(user(owner), COLL::from_units(coll));
            protocol
                .add_coll(host, user(owner), COLL::from_units(coll), None, None)
                .map(|_| ())
        }
        Op::WithdrawColl { owner, coll } => protocol
            .withdraw_coll(host, user(owner), COLL::from_units(coll), None, None)
            .map(|_| ()),
        Op::Borrow { owner, kusd } => protocol
            .withdraw_kusd(host, user(owner), Ratio::ONE, KUSD::from_units(kusd), None, None)
            .map(|_| ()),
        Op::Repay { owner, kusd } => protocol
            .repay_kusd(host, user(owner), KUSD::from_units(kusd), None, None)
            .map(|_| ()),
        Op::Close { owner } => protocol.close_trove(host, user(owner)).map(|_| ()),
        Op::Provide { owner, kusd } => protocol
            .provide_to_stability_pool(host, user(owner), KUSD::from_units(kusd))
            .map(|_| ()),
        Op::Withdraw { owner, kusd } => protocol
            .withdraw_from_stability_pool(host, user(owner), KUSD::from_units(kusd))
            .map(|_| ()),
        Op::Redeem { owner, kusd } => {
            let arg = redeem_arg(protocol, host, kusd);
            protocol.redeem_collateral(host, user(owner), arg).map(|_| ())
        }
        Op::Liquidate { n } => protocol
            .liquidate_troves(host, user(LIQUIDATOR), n)
            .map(|_| ()),
        Op::SetPrice { price } => {
            host.set_price(UsdColl::from_units(price));
            Ok(())
        }
        Op::Wait { minutes } => {
            host.advance_time(minutes * 60);
            Ok(())
        }
    }
}

proptest! {
    #[test]
    fn should_conserve_stakes_and_books(ops in pvec(arb_op(), 1..40)) {
        let (mut protocol, mut host) = setup(100);
        for op in &ops {
            let before = protocol.state().clone();
            let events = protocol.events().len();
            if apply(&mut protocol, &mut host, op).is_err() {
                prop_assert_eq!(protocol.state(), &before, "failed {:?} changed the state", op);
                prop_assert_eq!(protocol.events().len(), events);
            }
            let state = protocol.state();
            let stakes: COLL = state
                .troves
                .values()
                .filter(|trove| trove.status == TroveStatus::Active)
                .map(|trove| trove.stake)
                .sum();
            prop_assert_eq!(stakes, state.total_stakes);
            prop_assert_eq!(state.check_invariants(), Ok(()));
            prop_assert_eq!(host.check_matches(state), Ok(()));
        }
        prop_assert_eq!(protocol.check_replay(), Ok(()));
    }

    #[test]
    fn should_keep_list_ordered_without_liquidations(ops in pvec(arb_trove_op(), 1..40)) {
        let (mut protocol, mut host) = setup(100);
        for op in &ops {
            let _ = apply(&mut protocol, &mut host, op);
            let state = protocol.state();
            let nicrs: Vec<Nicr> = state
                .sorted_troves
                .iter()
                .map(|owner| state.nominal_icr(&owner))
                .collect();
            prop_assert!(
                nicrs.windows(2).all(|pair| pair[0] >= pair[1]),
                "list out of order after {:?}: {:?}",
                op,
                nicrs
            );
        }
        prop_assert_eq!(protocol.check_replay(), Ok(()));
    }
}
