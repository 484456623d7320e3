//! Property tests for the accounting that never iterates troves or depositors.

use proptest::prelude::*;
use trove_protocol::prelude::*;
use trove_protocol::utils::math::mul_div;

const E18: u128 = DECIMAL_PRECISION;
const MAX_FEE: u128 = E18 / 20;
const TOLERANCE: u128 = 1_000_000_000;

/// A trove whose rewards are applied immediately on every liquidation
#[derive(Debug, Clone)]
struct EagerTrove {
    id: Address,
    coll: u128,
    debt: u128,
    stake: u128,
}

fn open(sys: &mut System, id: Address, coll: u128, debt: u128) {
    sys.fund(id, coll).unwrap();
    sys.open_trove(id, MAX_FEE, debt, PositionHint::NONE, coll)
        .unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn lazy_redistribution_matches_eager_model(
        specs in prop::collection::vec((5u128..50, 2_000u128..8_000), 3..7)
    ) {
        let mut sys = System::with_price(ProtocolParams::default(), 4_000 * E18).unwrap();
        let mut eager = Vec::new();
        for (i, (coll, debt)) in specs.iter().enumerate() {
            let id = Address::derive(&format!("borrower-{}", i));
            open(&mut sys, id, coll * E18, debt * E18);
            let trove = sys.get_trove(id).unwrap();
            eager.push(EagerTrove { id, coll: trove.coll, debt: trove.debt, stake: trove.stake });
        }
        let liquidator = Address::derive("liquidator");

        while eager.len() > 1 {
            let tail = sys.sorted_troves().get_last().unwrap();
            let entire = sys.trove_manager().get_entire_debt_and_coll(tail).unwrap();
            // Puts the tail at 105%
            let price = mul_div(entire.debt, 105 * E18 / 100, entire.coll).unwrap();
            sys.set_price(price);
            sys.liquidate(liquidator, tail).unwrap();

            let index = eager.iter().position(|t| t.id == tail).unwrap();
            let gone = eager.remove(index);
            let coll_to_redistribute = gone.coll - gone.coll / 200;
            let total_stakes: u128 = eager.iter().map(|t| t.stake).sum();
            for t in eager.iter_mut() {
                t.coll += mul_div(coll_to_redistribute, t.stake, total_stakes).unwrap();
                t.debt += mul_div(gone.debt, t.stake, total_stakes).unwrap();
            }

            let mut lazy_debt_sum = 0u128;
            for t in &eager {
                let lazy = sys.trove_manager().get_entire_debt_and_coll(t.id).unwrap();
                prop_assert!(lazy.debt.abs_diff(t.debt) <= TOLERANCE, "debt {} vs {}", lazy.debt, t.debt);
                prop_assert!(lazy.coll.abs_diff(t.coll) <= TOLERANCE, "coll {} vs {}", lazy.coll, t.coll);
                lazy_debt_sum += lazy.debt;
            }
            let system_debt = sys.get_entire_system_debt().unwrap();
            prop_assert!(lazy_debt_sum <= system_debt);
            prop_assert!(system_debt - lazy_debt_sum <= TOLERANCE);
        }
    }

    #[test]
    fn partial_offsets_mixed_with_redistribution_match_eager_model(
        specs in prop::collection::vec((5u128..50, 2_000u128..8_000), 3..7),
        top_ups in prop::collection::vec(0u128..400, 6),
    ) {
        let mut sys = System::with_price(ProtocolParams::default(), 4_000 * E18).unwrap();
        let mut eager = Vec::new();
        for (i, (coll, debt)) in specs.iter().enumerate() {
            let id = Address::derive(&format!("borrower-{}", i));
            open(&mut sys, id, coll * E18, debt * E18);
            let trove = sys.get_trove(id).unwrap();
            eager.push(EagerTrove { id, coll: trove.coll, debt: trove.debt, stake: trove.stake });
        }
        // Deposits always fall short of a trove's debt, so every offset is partial
        let depositor = eager[0].id;
        let liquidator = Address::derive("liquidator");
        let mut expected_sp_coll = 0u128;

        for top_up in top_ups.iter().take(eager.len() - 1) {
            if *top_up > 0 {
                sys.provide_to_sp(depositor, top_up * E18, Address::ZERO).unwrap();
            }
            let deposits = sys.stability_pool().get_total_debt_deposits();

            let tail = sys.sorted_troves().get_last().unwrap();
            let entire = sys.trove_manager().get_entire_debt_and_coll(tail).unwrap();
            let price = mul_div(entire.debt, 105 * E18 / 100, entire.coll).unwrap();
            sys.set_price(price);
            let outcome = sys.liquidate(liquidator, tail).unwrap();
            prop_assert_eq!(outcome.totals.debt_to_offset, deposits.min(entire.debt));

            let index = eager.iter().position(|t| t.id == tail).unwrap();
            let gone = eager.remove(index);
            let coll_to_liquidate = gone.coll - gone.coll / 200;
            let debt_to_offset = deposits.min(gone.debt);
            let coll_to_sp = mul_div(coll_to_liquidate, debt_to_offset, gone.debt).unwrap();
            let coll_to_redistribute = coll_to_liquidate - coll_to_sp;
            let debt_to_redistribute = gone.debt - debt_to_offset;
            expected_sp_coll += coll_to_sp;

            let total_stakes: u128 = eager.iter().map(|t| t.stake).sum();
            for t in eager.iter_mut() {
                t.coll += mul_div(coll_to_redistribute, t.stake, total_stakes).unwrap();
                t.debt += mul_div(debt_to_redistribute, t.stake, total_stakes).unwrap();
            }

            for t in &eager {
                let lazy = sys.trove_manager().get_entire_debt_and_coll(t.id).unwrap();
                prop_assert!(lazy.debt.abs_diff(t.debt) <= TOLERANCE, "debt {} vs {}", lazy.debt, t.debt);
                prop_assert!(lazy.coll.abs_diff(t.coll) <= TOLERANCE, "coll {} vs {}", lazy.coll, t.coll);
            }
            prop_assert_eq!(sys.stability_pool().get_total_debt_deposits(), 0);

            let paid = sys.accounts().balance_of(depositor)
                + sys.stability_pool().get_depositor_coll_gain(depositor).unwrap();
            prop_assert!(paid <= sys.accounts().balance_of(depositor) + sys.stability_pool().get_coll());
            prop_assert!(paid.abs_diff(expected_sp_coll) <= TOLERANCE, "gain {} vs {}", paid, expected_sp_coll);
            prop_assert!(sys.verify_invariants().is_ok());
        }
    }

    #[test]
    fn sorted_troves_stay_ordered_with_arbitrary_hints(
        specs in prop::collection::vec((5u128..60, 2_000u128..9_000, any::<prop::sample::Index>()), 1..12)
    ) {
        let mut sys = System::with_price(ProtocolParams::default(), 3_000 * E18).unwrap();
        let mut ids: Vec<Address> = Vec::new();
        for (i, (coll, debt, pick)) in specs.iter().enumerate() {
            let id = Address::derive(&format!("trove-{}", i));
            sys.fund(id, coll * E18).unwrap();
            // Any existing trove is an acceptable, possibly wrong, hint
            let hint = if ids.is_empty() {
                PositionHint::NONE
            } else {
                let anchor = ids[pick.index(ids.len())];
                PositionHint::new(Some(anchor), sys.sorted_troves().get_next(anchor))
            };
            sys.open_trove(id, MAX_FEE, debt * E18, hint, coll * E18).unwrap();
            ids.push(id);
        }
        prop_assert_eq!(sys.sorted_troves().get_size(), ids.len());
        prop_assert!(sys.verify_invariants().is_ok());
    }

    #[test]
    fn stability_pool_never_over_credits(
        deposits in prop::collection::vec(100u128..5_000, 1..5),
        victims in prop::collection::vec(2_000u128..4_000, 1..5),
    ) {
        let mut sys = System::with_price(ProtocolParams::default(), 4_000 * E18).unwrap();
        let whale = Address::derive("whale");
        open(&mut sys, whale, 1_000 * E18, 100_000 * E18);
        for (i, debt) in victims.iter().enumerate() {
            open(&mut sys, Address::derive(&format!("victim-{}", i)), 3 * E18, debt * E18);
        }

        let mut depositors = Vec::new();
        for (i, amount) in deposits.iter().enumerate() {
            let depositor = Address::derive(&format!("depositor-{}", i));
            sys.transfer(whale, depositor, amount * E18).unwrap();
            sys.provide_to_sp(depositor, amount * E18, Address::ZERO).unwrap();
            depositors.push(depositor);
        }

        // Every victim falls under 100%, the whale stays far above
        sys.set_price(700 * E18);
        let outcome = sys.liquidate_troves(Address::derive("liquidator"), victims.len()).unwrap();
        prop_assert_eq!(outcome.liquidated.len(), victims.len());

        let sp = sys.stability_pool();
        let mut compounded = 0u128;
        let mut gains = 0u128;
        for depositor in &depositors {
            compounded += sp.get_compounded_debt_deposit(*depositor).unwrap();
            gains += sp.get_depositor_coll_gain(*depositor).unwrap();
        }
        prop_assert!(compounded <= sp.get_total_debt_deposits());
        prop_assert!(gains <= sp.get_coll());
        prop_assert!(sys.verify_invariants().is_ok());
    }
}
