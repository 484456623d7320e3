//! Integration tests for the trove protocol.
//!
//! These tests drive the assembled system through complete lifecycles:
//! opening and closing troves, stability pool deposits, liquidations in both
//! modes, redemptions and the failure paths that must leave no trace.

use trove_protocol::prelude::*;

const E18: u128 = DECIMAL_PRECISION;
const MAX_FEE: u128 = E18 / 20;

// ═══════════════════════════════════════════════════════════════════════════════
// TEST HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn system_at(price: u128) -> System {
    trove_protocol::utils::logging::init_test_tracing();
    System::with_price(ProtocolParams::default(), price * E18).unwrap()
}

/// Fund `name` with `coll` and open a trove drawing `debt`
fn open(sys: &mut System, name: &str, coll: u128, debt: u128) -> Address {
    let borrower = Address::derive(name);
    sys.fund(borrower, coll).unwrap();
    sys.open_trove(borrower, MAX_FEE, debt, PositionHint::NONE, coll)
        .unwrap();
    borrower
}

fn assert_close(actual: u128, expected: u128, tolerance: u128) {
    let diff = actual.abs_diff(expected);
    assert!(
        diff <= tolerance,
        "{} differs from {} by {}",
        actual,
        expected,
        diff
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// TROVE LIFECYCLE TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_open_trove_system_totals() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);

    // Principal, 0.5% fee and the 200 gas reserve
    assert_eq!(sys.get_entire_system_coll()?, 10 * E18);
    assert_eq!(sys.get_entire_system_debt()?, 5_225 * E18);
    assert_eq!(sys.get_trove(alice).map(|t| t.status), Some(TroveStatus::Active));
    assert_eq!(sys.sorted_troves().get_first(), Some(alice));
    assert_eq!(sys.events().filter_by_type("TroveUpdated").len(), 1);
    assert_eq!(sys.events().filter_by_type("BorrowingFeePaid").len(), 1);
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_open_close_round_trip() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let bob = open(&mut sys, "bob", 20 * E18, 5_000 * E18);
    let coll_before = sys.get_entire_system_coll()?;
    let debt_before = sys.get_entire_system_debt()?;

    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    // The fee went to the fee recipient; top up the repayment
    sys.transfer(bob, alice, 25 * E18)?;
    sys.close_trove(alice)?;

    assert_eq!(sys.get_entire_system_coll()?, coll_before);
    assert_eq!(sys.get_entire_system_debt()?, debt_before);
    assert_eq!(sys.accounts().balance_of(alice), 10 * E18);
    assert_eq!(sys.token().balance_of(alice), 0);
    assert_eq!(sys.get_trove(alice).map(|t| t.status), Some(TroveStatus::ClosedByOwner));
    assert!(!sys.sorted_troves().contains(alice));
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_last_trove_cannot_close() {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);

    // The fee is missing from the repayment
    let err = sys.close_trove(alice).unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));

    let fee_recipient = sys.addresses().fee_recipient;
    sys.transfer(fee_recipient, alice, 25 * E18).unwrap();
    let err = sys.close_trove(alice).unwrap_err();
    assert_eq!(err, Error::OnlyOneTroveLeft);
    assert_eq!(sys.get_trove(alice).map(|t| t.status), Some(TroveStatus::Active));
}

#[test]
fn test_adjust_trove_moves_collateral_and_debt() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    open(&mut sys, "bob", 20 * E18, 5_000 * E18);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);

    sys.withdraw_coll(alice, 2 * E18, PositionHint::NONE)?;
    assert_eq!(sys.accounts().balance_of(alice), 2 * E18);
    assert_eq!(sys.get_trove(alice).map(|t| t.coll), Some(8 * E18));

    sys.repay_debt(alice, 1_000 * E18, PositionHint::NONE)?;
    assert_eq!(sys.get_trove(alice).map(|t| t.debt), Some(4_225 * E18));
    assert_eq!(sys.token().balance_of(alice), 4_000 * E18);

    sys.add_coll(alice, E18, PositionHint::NONE)?;
    assert_eq!(sys.get_trove(alice).map(|t| t.coll), Some(9 * E18));
    assert_eq!(sys.accounts().balance_of(alice), E18);

    sys.withdraw_debt(alice, MAX_FEE, 1_000 * E18, PositionHint::NONE)?;
    // 1000 plus the 0.5% floor fee
    assert_eq!(sys.get_trove(alice).map(|t| t.debt), Some(5_230 * E18));
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_net_debt_minimum_enforced() {
    let mut sys = system_at(2_000);
    let alice = Address::derive("alice");
    sys.fund(alice, 10 * E18).unwrap();
    let err = sys
        .open_trove(alice, MAX_FEE, 1_000 * E18, PositionHint::NONE, 10 * E18)
        .unwrap_err();
    assert!(matches!(err, Error::NetDebtBelowMinimum { .. }));
    assert_eq!(sys.accounts().balance_of(alice), 10 * E18);
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_deposit_without_frontend_has_no_gain() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);

    sys.provide_to_sp(alice, E18, Address::ZERO)?;
    assert_eq!(sys.stability_pool().get_depositor_coll_gain(alice)?, 0);
    assert_eq!(sys.stability_pool().get_total_debt_deposits(), E18);
    assert_eq!(
        sys.stability_pool().get_deposit(alice).and_then(|d| d.frontend_tag),
        None
    );
    Ok(())
}

#[test]
fn test_frontend_recorded_on_deposit() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    let frontend = Address::derive("frontend");

    sys.register_frontend(frontend, E18 / 10)?;
    sys.provide_to_sp(alice, E18, frontend)?;

    assert_eq!(
        sys.stability_pool().get_deposit(alice).and_then(|d| d.frontend_tag),
        Some(frontend)
    );
    assert_eq!(
        sys.stability_pool().get_frontend(frontend).map(|f| f.kickback_rate),
        Some(E18 / 10)
    );
    assert!(sys.register_frontend(frontend, E18 / 10).is_err());
    assert!(sys.register_frontend(alice, E18 / 10).is_err());
    Ok(())
}

#[test]
fn test_offset_and_gain_moved_to_trove() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let bob = open(&mut sys, "bob", 100 * E18, 50_000 * E18);
    let charlie = open(&mut sys, "charlie", 3 * E18, 4_000 * E18);
    let liquidator = Address::derive("liquidator");
    sys.provide_to_sp(bob, 10_000 * E18, Address::ZERO)?;

    // charlie: 3 * 1500 / 4220, below MCR
    sys.set_price(1_500 * E18);
    let err = sys.withdraw_from_sp(bob, E18).unwrap_err();
    assert_eq!(err, Error::UndercollateralizedTroves);

    let outcome = sys.liquidate(liquidator, charlie)?;
    assert_eq!(outcome.liquidated, vec![charlie]);
    assert_eq!(outcome.totals.debt_to_offset, 4_220 * E18);
    assert_eq!(outcome.totals.debt_to_redistribute, 0);
    assert_eq!(sys.token().balance_of(liquidator), 200 * E18);
    assert_eq!(sys.accounts().balance_of(liquidator), 3 * E18 / 200);

    let sp = sys.stability_pool();
    assert_eq!(sp.get_total_debt_deposits(), 5_780 * E18);
    assert_close(sp.get_compounded_debt_deposit(bob)?, 5_780 * E18, 1_000_000);
    assert_close(sp.get_depositor_coll_gain(bob)?, 2_985 * E18 / 1_000, 1_000_000);

    let gain = sys.withdraw_coll_gain_to_trove(bob, PositionHint::NONE)?.coll_gain;
    assert_eq!(sys.get_trove(bob).map(|t| t.coll), Some(100 * E18 + gain));
    assert_eq!(sys.stability_pool().get_depositor_coll_gain(bob)?, 0);
    sys.verify_invariants()?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_price_drop_liquidates_only_unhealthy_trove() -> anyhow::Result<()> {
    let mut sys = system_at(2_900);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    // 3 * 2900 / 7637 is above MCR, 3 * 2800 / 7637 is not
    let charlie = open(&mut sys, "charlie", 3 * E18, 7_400 * E18);
    let liquidator = Address::derive("liquidator");

    let err = sys.liquidate(liquidator, charlie).unwrap_err();
    assert_eq!(err, Error::NothingToLiquidate);

    sys.set_price(2_800 * E18);
    let err = sys.liquidate(liquidator, alice).unwrap_err();
    assert_eq!(err, Error::NothingToLiquidate);

    let outcome = sys.batch_liquidate_troves(liquidator, &[alice, charlie])?;
    assert_eq!(outcome.liquidated, vec![charlie]);
    assert_eq!(
        sys.get_trove(charlie).map(|t| t.status),
        Some(TroveStatus::ClosedByLiquidation)
    );
    assert_eq!(
        sys.get_trove(alice).map(|t| t.status),
        Some(TroveStatus::Active)
    );

    // Empty pool: everything is redistributed to alice
    let entire = sys.trove_manager().get_entire_debt_and_coll(alice)?;
    assert_eq!(entire.debt, 5_225 * E18 + 7_637 * E18);
    assert_eq!(entire.coll, 10 * E18 + 3 * E18 - 3 * E18 / 200);
    assert_eq!(sys.default_pool().get_debt(), 7_637 * E18);
    assert_eq!(sys.events().filter_by_type("Liquidation").len(), 1);

    // The survivor is the last trove
    sys.set_price(1_000 * E18);
    let err = sys.liquidate(liquidator, alice).unwrap_err();
    assert_eq!(err, Error::OnlyOneTroveLeft);
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_failed_liquidation_leaves_no_trace() {
    let mut sys = system_at(2_000);
    open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    open(&mut sys, "bob", 10 * E18, 5_000 * E18);
    let hash = sys.state_hash().unwrap();
    let events = sys.events().len();

    let err = sys.liquidate_troves(Address::derive("liquidator"), 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(sys.state_hash().unwrap(), hash);
    assert_eq!(sys.events().len(), events);
}

#[test]
fn test_batch_failing_at_payout_rolls_back_every_trove() -> anyhow::Result<()> {
    let mut sys = system_at(2_900);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    let charlie = open(&mut sys, "charlie", 3 * E18, 7_400 * E18);
    let dave = open(&mut sys, "dave", 3 * E18, 7_400 * E18);
    sys.set_price(2_800 * E18);
    let hash = sys.state_hash()?;
    let events = sys.events().len();

    // Both troves are liquidated before the gas compensation is refused
    let err = sys
        .batch_liquidate_troves(Address::ZERO, &[charlie, dave])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter { .. }));
    assert_eq!(sys.state_hash()?, hash);
    assert_eq!(sys.events().len(), events);
    for borrower in [alice, charlie, dave] {
        assert_eq!(
            sys.get_trove(borrower).map(|t| t.status),
            Some(TroveStatus::Active)
        );
    }
    assert_eq!(sys.default_pool().get_debt(), 0);
    assert_eq!(sys.trove_manager().get_trove_owners_count(), 3);
    sys.verify_invariants()?;

    let outcome = sys.batch_liquidate_troves(Address::derive("liquidator"), &[charlie, dave])?;
    assert!(outcome.liquidated.contains(&charlie));
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_recovery_mode_capped_liquidation() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 10_000 * E18);
    let bob = open(&mut sys, "bob", 10 * E18, 10_000 * E18);
    let carol = open(&mut sys, "carol", 10 * E18, 12_000 * E18);
    sys.provide_to_sp(bob, 10_000 * E18, Address::ZERO)?;
    sys.provide_to_sp(alice, 5_000 * E18, Address::ZERO)?;

    // TCR 30 * 1400 / 32760 is below CCR; carol sits between MCR and TCR
    sys.set_price(1_400 * E18);
    let outcome = sys.liquidate_troves(Address::derive("liquidator"), 10)?;
    assert_eq!(outcome.liquidated, vec![carol]);
    assert!(sys.check_recovery_mode()?);
    assert_eq!(sys.events().filter_by_type("RecoveryModeEntered").len(), 1);

    // Collateral is capped at MCR of the debt, the rest is claimable
    let capped = 12_260 * E18 * 11 / (10 * 1_400);
    let surplus = 10 * E18 - capped;
    assert_eq!(outcome.totals.coll_surplus, surplus);
    assert_eq!(sys.coll_surplus_pool().get_collateral(carol), surplus);
    assert_eq!(sys.stability_pool().get_total_debt_deposits(), 2_740 * E18);

    assert_eq!(sys.claim_collateral(carol)?, surplus);
    assert_eq!(sys.accounts().balance_of(carol), surplus);
    assert!(sys.claim_collateral(carol).is_err());
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_recovery_mode_blocks_risky_actions() {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 10_000 * E18);
    open(&mut sys, "bob", 10 * E18, 10_000 * E18);

    sys.set_price(1_400 * E18);
    let err = sys.withdraw_coll(alice, E18, PositionHint::NONE).unwrap_err();
    assert!(matches!(err, Error::RecoveryMode(_)));

    sys.transfer(Address::derive("bob"), alice, 250 * E18).unwrap();
    let err = sys.close_trove(alice).unwrap_err();
    assert!(matches!(err, Error::RecoveryMode(_)));
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDEMPTION TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_partial_redemption() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    open(&mut sys, "bob", 20 * E18, 5_000 * E18);
    let charlie = open(&mut sys, "charlie", 30 * E18, 10_000 * E18);

    let outcome = sys.redeem_collateral(
        charlie,
        1_000 * E18,
        RedemptionHints::default(),
        0,
        E18,
    )?;
    assert_eq!(outcome.debt_redeemed, 1_000 * E18);
    assert_eq!(outcome.coll_drawn, E18 / 2);
    assert_eq!(outcome.coll_fee + outcome.coll_sent, outcome.coll_drawn);
    assert!(outcome.coll_fee > E18 / 2 / 200);

    // The riskiest trove paid
    let trove = sys.get_trove(alice).cloned().unwrap();
    assert_eq!(trove.debt, 4_225 * E18);
    assert_eq!(trove.coll, 95 * E18 / 10);
    assert_eq!(sys.token().balance_of(charlie), 9_000 * E18);
    assert_eq!(sys.accounts().balance_of(charlie), outcome.coll_sent);
    assert!(sys.trove_manager().base_rate() > 0);
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_full_redemption_closes_trove() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    open(&mut sys, "bob", 20 * E18, 5_000 * E18);
    let charlie = open(&mut sys, "charlie", 30 * E18, 10_000 * E18);

    let outcome = sys.redeem_collateral(
        charlie,
        5_025 * E18,
        RedemptionHints::default(),
        0,
        E18,
    )?;
    assert_eq!(outcome.troves, 1);
    assert_eq!(outcome.coll_drawn, 25_125 * E18 / 10_000);
    assert_eq!(
        sys.get_trove(alice).map(|t| t.status),
        Some(TroveStatus::ClosedByRedemption)
    );
    assert!(!sys.sorted_troves().contains(alice));

    let surplus = 10 * E18 - outcome.coll_drawn;
    assert_eq!(sys.claim_collateral(alice)?, surplus);
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_redemption_fee_limit_rolls_back() {
    let mut sys = system_at(2_000);
    open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    let charlie = open(&mut sys, "charlie", 30 * E18, 10_000 * E18);
    let hash = sys.state_hash().unwrap();

    let err = sys
        .redeem_collateral(charlie, 1_000 * E18, RedemptionHints::default(), 0, E18 / 200)
        .unwrap_err();
    assert!(matches!(err, Error::FeeExceedsMaximum { .. }));
    assert_eq!(sys.state_hash().unwrap(), hash);
}

// ═══════════════════════════════════════════════════════════════════════════════
// HINTS AND AUTHORIZATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_stale_hint_requires_fresh_hint() -> anyhow::Result<()> {
    let params = ProtocolParams::default().with_max_hint_traversal(1);
    let mut sys = System::with_price(params, 2_000 * E18)?;
    for (name, coll) in [("t1", 40), ("t2", 30), ("t3", 20)] {
        open(&mut sys, name, coll * E18, 5_000 * E18);
    }

    let dave = Address::derive("dave");
    sys.fund(dave, 10 * E18)?;
    let err = sys
        .open_trove(dave, MAX_FEE, 5_000 * E18, PositionHint::NONE, 10 * E18)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StaleHint);
    assert!(sys.get_trove(dave).is_none());

    let hint = sys.hint_for(10 * E18, 5_225 * E18)?;
    sys.open_trove(dave, MAX_FEE, 5_000 * E18, hint, 10 * E18)?;
    assert_eq!(sys.sorted_troves().get_last(), Some(dave));
    sys.verify_invariants()?;
    Ok(())
}

#[test]
fn test_components_reject_unknown_callers() {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);

    let mut token = sys.token().clone();
    let err = token.mint(alice, alice, E18).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let mut pool = sys.active_pool().clone();
    assert_eq!(
        pool.increase_debt(alice, E18).unwrap_err().kind(),
        ErrorKind::Authorization
    );

    // Borrower Operations may insert but never remove
    let mut sorted = sys.sorted_troves().clone();
    let bo = sys.addresses().borrower_operations;
    assert_eq!(
        sorted.remove(bo, alice).unwrap_err().kind(),
        ErrorKind::Authorization
    );
}

#[test]
fn test_snapshot_restores_identical_state() -> anyhow::Result<()> {
    let mut sys = system_at(2_000);
    let alice = open(&mut sys, "alice", 10 * E18, 5_000 * E18);
    sys.provide_to_sp(alice, 1_000 * E18, Address::ZERO)?;

    let bytes = sys.to_bytes()?;
    let restored = System::from_bytes(&bytes, ManualPriceFeed::new(2_000 * E18), NoIssuance)?;
    assert_eq!(restored.state_hash()?, sys.state_hash()?);
    assert_eq!(
        restored.stability_pool().get_total_debt_deposits(),
        1_000 * E18
    );
    Ok(())
}
