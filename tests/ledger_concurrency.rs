use std::time::Duration;

use simplebank::db::{Account, AddAccountBalanceParams, Page};
use simplebank::{
    BankError, BankService, CreateUserRequest, MemoryBackend, Store, TransferRequest,
    TxContext,
};

/// Helper: service over a fresh in-process store with two funded USD accounts
async fn funded_pair(opening: i64) -> (MemoryBackend, BankService<MemoryBackend>, Account, Account) {
    let backend = MemoryBackend::with_lock_timeout(Some(Duration::from_secs(2)));
    let service = BankService::new(Store::new(backend.clone()));
    let ctx = TxContext::background();

    let mut accounts = Vec::new();
    for name in ["alice", "bob"] {
        service
            .create_user(
                &ctx,
                CreateUserRequest {
                    username: name.to_string(),
                    hashed_password: "hash".to_string(),
                    full_name: "Ledger Test".to_string(),
                    email: format!("{}@example.com", name),
                },
                |_| async { Ok(()) },
            )
            .await
            .unwrap();
        let account = service.create_account(&ctx, name, "USD").await.unwrap();
        let id = account.id;
        service
            .store()
            .exec_tx(&ctx, move |q| {
                Box::pin(async move {
                    q.add_account_balance(AddAccountBalanceParams { id, amount: opening })
                        .await
                        .map_err(BankError::from)
                })
            })
            .await
            .unwrap();
        accounts.push(service.get_account(&ctx, id).await.unwrap());
    }

    let b = accounts.pop().unwrap();
    let a = accounts.pop().unwrap();
    (backend, service, a, b)
}

fn usd(from: i64, to: i64, amount: i64) -> TransferRequest {
    TransferRequest {
        from_account_id: from,
        to_account_id: to,
        amount,
        currency: "USD".to_string(),
    }
}

#[tokio::test]
async fn scenario_single_transfer() {
    let (_backend, service, a, b) = funded_pair(0).await;
    let ctx = TxContext::background();
    // Re-fund to 100 / 50.
    let (a_id, b_id) = (a.id, b.id);
    service
        .store()
        .exec_tx(&ctx, move |q| {
            Box::pin(async move {
                q.add_account_balance(AddAccountBalanceParams { id: a_id, amount: 100 })
                    .await?;
                q.add_account_balance(AddAccountBalanceParams { id: b_id, amount: 50 })
                    .await?;
                Ok::<_, BankError>(())
            })
        })
        .await
        .unwrap();

    let result = service.transfer_money(&ctx, usd(a.id, b.id, 30)).await.unwrap();

    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 80);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.amount, 30);
    assert_eq!(
        result.from_entry.amount + result.to_entry.amount,
        0,
        "debit and credit must cancel out"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn opposite_direction_transfers_complete_without_deadlock() {
    let opening = 1_000;
    let n = 25;
    let (backend, service, a, b) = funded_pair(opening).await;

    let mut handles = Vec::new();
    for i in 0..2 * n {
        let service = service.clone();
        let req = if i % 2 == 0 {
            usd(a.id, b.id, 7)
        } else {
            usd(b.id, a.id, 7)
        };
        handles.push(tokio::spawn(async move {
            service.transfer_money(&TxContext::background(), req).await
        }));
    }

    // Every transfer must finish well inside the lock timeout.
    let all = async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("transfers stalled");

    let ctx = TxContext::background();
    let a_after = service.get_account(&ctx, a.id).await.unwrap();
    let b_after = service.get_account(&ctx, b.id).await.unwrap();
    assert_eq!(a_after.balance, opening);
    assert_eq!(b_after.balance, opening);
    assert_eq!(a_after.balance + b_after.balance, 2 * opening);

    let counts = backend.counts();
    assert_eq!(counts.transfers, 2 * n);
    assert_eq!(counts.entries, 4 * n);
    assert_eq!(backend.entry_total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn balances_always_equal_entry_sums() {
    let opening = 40;
    let (backend, service, a, b) = funded_pair(opening).await;

    // Mixed sizes; some may fail for lack of funds.
    let amounts = [15, 15, 15, 15, 3, 3, 30, 1];
    let mut handles = Vec::new();
    for (i, amount) in amounts.into_iter().enumerate() {
        let service = service.clone();
        let req = if i % 3 == 0 {
            usd(b.id, a.id, amount)
        } else {
            usd(a.id, b.id, amount)
        };
        handles.push(tokio::spawn(async move {
            service.transfer_money(&TxContext::background(), req).await
        }));
    }

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert!(result.from_account.balance >= 0);
                committed += 1;
            }
            Err(BankError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let ctx = TxContext::background();
    let page = Page::new(1, Page::MAX_LIMIT);
    for account in [&a, &b] {
        let current = service.get_account(&ctx, account.id).await.unwrap();
        let entries = service.list_entries(&ctx, account.id, page).await.unwrap();
        let delta: i64 = entries.iter().map(|e| e.amount).sum();
        assert!(current.balance >= 0);
        assert_eq!(current.balance, opening + delta);
    }

    assert_eq!(backend.counts().transfers, committed);
    assert_eq!(backend.entry_total(), 0);
}

#[tokio::test]
async fn expired_request_leaves_no_partial_transfer() {
    let (backend, service, a, b) = funded_pair(100).await;
    let before = backend.counts();

    // Hold the lower-id row so the transfer waits on its first lock.
    let ctx = TxContext::background();
    let (a_id, held_for) = (a.id, Duration::from_millis(300));
    let holder = {
        let store = service.store().clone();
        tokio::spawn(async move {
            store
                .exec_tx(&ctx, move |q| {
                    Box::pin(async move {
                        q.get_account_for_update(a_id).await?;
                        tokio::time::sleep(held_for).await;
                        Ok::<_, BankError>(())
                    })
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = service
        .transfer_money(
            &TxContext::with_timeout(Duration::from_millis(100)),
            usd(a.id, b.id, 10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BankError::DeadlineExceeded));

    holder.await.unwrap().unwrap();
    assert_eq!(backend.counts(), before);

    let ctx = TxContext::background();
    assert_eq!(service.get_account(&ctx, a.id).await.unwrap().balance, 100);
    assert_eq!(service.get_account(&ctx, b.id).await.unwrap().balance, 100);
}
