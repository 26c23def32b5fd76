//! Property tests for the ledger: arbitrary interleavings of debits,
//! purchase credits (with replays), and operator adjustments keep the
//! balance equation and never drive a balance below zero.

#![allow(clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use banana_gateway::domain::{
    Account, AccountId, BillingPeriod, PurchaseEvent, PurchaseEventId, PurchaseTarget,
};
use banana_gateway::error::GatewayError;
use banana_gateway::persistence::memory::MemoryLedger;
use banana_gateway::persistence::{CreditOutcome, LedgerStore};
use banana_gateway::service::LedgerService;

#[derive(Debug, Clone)]
enum Op {
    Debit(i64),
    Purchase { event: u8, amount: i64 },
    Adjust(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1_i64..=5).prop_map(Op::Debit),
        2 => (0_u8..4, 1_i64..=50).prop_map(|(event, amount)| Op::Purchase { event, amount }),
        1 => (-20_i64..=20)
            .prop_filter("zero delta is rejected", |d| *d != 0)
            .prop_map(Op::Adjust),
    ]
}

/// Amounts are keyed by event id so a replay carries the same amount as
/// the original delivery.
fn event_amount(event: u8, first_amount: i64, seen: &mut Vec<(u8, i64)>) -> i64 {
    if let Some((_, amount)) = seen.iter().find(|(e, _)| *e == event) {
        return *amount;
    }
    seen.push((event, first_amount));
    first_amount
}

fn purchase(account: &AccountId, event: u8, amount: i64) -> PurchaseEvent {
    PurchaseEvent::received(
        PurchaseEventId::new(format!("evt_{event}")),
        "checkout.completed",
        PurchaseTarget {
            account_id: Some(account.clone()),
            email: None,
        },
        "basic",
        BillingPeriod::Monthly,
        amount,
    )
}

#[derive(Debug)]
enum Effect {
    Debited(i64),
    Credited(u8, i64),
    Replayed,
    Adjusted(i64),
    Refused,
}

async fn apply(ledger: Arc<LedgerService>, account: AccountId, op: Op, amount: i64) -> Effect {
    match op {
        Op::Debit(cost) => match ledger.debit(&account, cost).await {
            Ok(_) => Effect::Debited(cost),
            Err(GatewayError::InsufficientCredits { .. }) => Effect::Refused,
            Err(e) => panic!("unexpected debit failure: {e}"),
        },
        Op::Purchase { event, .. } => {
            match ledger.credit(&account, &purchase(&account, event, amount)).await {
                Ok(CreditOutcome::Applied { .. }) => Effect::Credited(event, amount),
                Ok(CreditOutcome::AlreadyApplied) => Effect::Replayed,
                Ok(CreditOutcome::Pending) => panic!("account exists, nothing should park"),
                Err(e) => panic!("unexpected credit failure: {e}"),
            }
        }
        Op::Adjust(delta) => match ledger.adjust(&account, delta, None).await {
            Ok(_) => Effect::Adjusted(delta),
            Err(GatewayError::InsufficientCredits { .. }) => Effect::Refused,
            Err(e) => panic!("unexpected adjustment failure: {e}"),
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn balance_equation_holds_under_interleaving(
        initial in 0_i64..=30,
        ops in prop::collection::vec(op(), 1..40),
    ) {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryLedger::new());
            let account = AccountId::new("prop");
            store.insert_account(Account::new(account.clone(), None, initial)).await;
            let ledger = Arc::new(LedgerService::new(Arc::<MemoryLedger>::clone(&store), 0));

            let mut amounts = Vec::new();
            let handles: Vec<_> = ops
                .into_iter()
                .map(|op| {
                    let amount = match &op {
                        Op::Purchase { event, amount } => event_amount(*event, *amount, &mut amounts),
                        _ => 0,
                    };
                    tokio::spawn(apply(Arc::clone(&ledger), account.clone(), op, amount))
                })
                .collect();

            let mut expected = initial;
            let mut credited = HashSet::new();
            for result in futures_util::future::join_all(handles).await {
                let Ok(effect) = result else {
                    panic!("ledger task panicked");
                };
                match effect {
                    Effect::Debited(cost) => expected -= cost,
                    Effect::Credited(event, amount) => {
                        assert!(credited.insert(event), "event {event} credited twice");
                        expected += amount;
                    }
                    Effect::Adjusted(delta) => expected += delta,
                    Effect::Replayed | Effect::Refused => {}
                }
            }

            let Ok(balance) = store.get_balance(&account).await else {
                panic!("account should exist");
            };
            assert!(balance >= 0, "balance went negative: {balance}");
            assert_eq!(balance, expected);
        });
    }

    #[test]
    fn debits_never_overdraw(initial in 0_i64..=20, costs in prop::collection::vec(1_i64..=7, 1..30)) {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryLedger::new());
            let account = AccountId::new("prop");
            store.insert_account(Account::new(account.clone(), None, initial)).await;
            let ledger = LedgerService::new(Arc::<MemoryLedger>::clone(&store), 0);

            let mut spent = 0;
            for cost in costs {
                match ledger.debit(&account, cost).await {
                    Ok(remaining) => {
                        spent += cost;
                        assert_eq!(remaining, initial - spent);
                    }
                    Err(GatewayError::InsufficientCredits { .. }) => {
                        assert!(initial - spent < cost);
                    }
                    Err(e) => panic!("unexpected debit failure: {e}"),
                }
            }
            assert!(spent <= initial);
        });
    }
}
