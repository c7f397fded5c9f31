use chrono::NaiveDate;
use ledgerkeeper::config::ReconcileSettings;
use ledgerkeeper::db::init_db;
use ledgerkeeper::domain::{
    AccountId, AuditOperation, AuditQuery, Balance, CausalSource, Cents, Currency,
    DiscrepancyKind, NewLedgerEntry, Timestamp,
};
use ledgerkeeper::notify::RecordingSink;
use ledgerkeeper::processor::{MockProcessorClient, ProcessorClient, ProcessorError};
use ledgerkeeper::reconcile::{CorrectionMode, CorrectionStatus, ReconciliationService};
use ledgerkeeper::Repository;
use std::sync::Arc;
use tempfile::TempDir;

struct TestEnv {
    repo: Repository,
    service: Arc<ReconciliationService>,
    notes: Arc<RecordingSink>,
    _temp: TempDir,
}

async fn setup(processor: Option<Arc<dyn ProcessorClient>>) -> TestEnv {
    setup_with(
        ReconcileSettings {
            operator_account_id: AccountId::new(42),
            auto_correct_enabled: true,
            ..ReconcileSettings::default()
        },
        processor,
    )
    .await
}

async fn setup_with(
    settings: ReconcileSettings,
    processor: Option<Arc<dyn ProcessorClient>>,
) -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Repository::new(pool);
    let notes = Arc::new(RecordingSink::new());
    let service = Arc::new(ReconciliationService::new(
        repo.clone(),
        settings,
        processor,
        notes.clone(),
    ));
    TestEnv {
        repo,
        service,
        notes,
        _temp: temp_dir,
    }
}

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

async fn account(repo: &Repository, merchant: Option<&str>) -> (AccountId, Balance) {
    let (account, balance) = repo
        .create_account(merchant, &Currency::usd(), Timestamp::from_micros(0))
        .await
        .unwrap();
    (account.id, balance)
}

async fn balance_of(repo: &Repository, account_id: AccountId) -> Balance {
    repo.get_balance_for_account(account_id)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_consistent_account_is_clean() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    env.repo
        .insert_ledger_entry(NewLedgerEntry::new(
            account_id,
            Some(CausalSource::purchase(1)),
            Cents(1000),
            Cents(250),
        ))
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(1000), Cents(250))
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert!(run.is_clean());
    assert_eq!(run.accounts_scanned, 1);
    assert_eq!(run.accounts_with_discrepancies, 0);
}

#[tokio::test]
async fn test_calculation_mismatch_is_corrected_once() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    env.repo
        .insert_ledger_entry(NewLedgerEntry::new(
            account_id,
            Some(CausalSource::purchase(1)),
            Cents(500),
            Cents(0),
        ))
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(1000), Cents(0))
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert_eq!(run.discrepancies.len(), 1);
    assert_eq!(
        run.discrepancies[0].kind(),
        DiscrepancyKind::BalanceCalculationMismatch
    );

    let outcomes = env
        .service
        .auto_correct(&run, CorrectionMode::Apply)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_applied());
    assert_eq!(balance_of(&env.repo, account_id).await.amount, Cents(500));

    let audit = env
        .repo
        .query_audit_logs(&AuditQuery::ByBalance(balance.id), 10)
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].operation, AuditOperation::Reconciliation);
    assert_eq!(audit[0].amount_before, Some(Cents(1000)));
    assert_eq!(audit[0].amount_after, Some(Cents(500)));
    assert_eq!(audit[0].actor, "operator:42");
    assert_eq!(audit[0].metadata["delta"], -500);
    assert_eq!(audit[0].metadata["run_id"], run.run_id.to_string());

    // Replaying the same run changes nothing.
    let replay = env
        .service
        .auto_correct(&run, CorrectionMode::Apply)
        .await
        .unwrap();
    assert_eq!(replay[0].status, CorrectionStatus::AlreadyResolved);
    assert_eq!(
        env.repo
            .query_audit_logs(&AuditQuery::ByBalance(balance.id), 10)
            .await
            .unwrap()
            .len(),
        1
    );

    let rerun = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert!(rerun.is_clean());
}

#[tokio::test]
async fn test_holding_mismatch_is_its_own_discrepancy() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    env.repo
        .insert_ledger_entry(NewLedgerEntry::new(
            account_id,
            Some(CausalSource::credit(3)),
            Cents(200),
            Cents(200),
        ))
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(200), Cents(0))
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert_eq!(run.discrepancies.len(), 1);
    assert_eq!(
        run.discrepancies[0].kind(),
        DiscrepancyKind::HoldingBalanceCalculationMismatch
    );

    env.service
        .auto_correct(&run, CorrectionMode::Apply)
        .await
        .unwrap();
    let after = balance_of(&env.repo, account_id).await;
    assert_eq!(after.amount, Cents(200));
    assert_eq!(after.holding_amount, Cents(200));
}

#[tokio::test]
async fn test_duplicate_increment_keeps_earliest_entry() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    let source = CausalSource::purchase(7);
    let first = env
        .repo
        .insert_ledger_entry(
            NewLedgerEntry::new(account_id, Some(source), Cents(1000), Cents(1000))
                .with_created_at(Timestamp::from_micros(1_000)),
        )
        .await
        .unwrap();
    let second = env
        .repo
        .insert_ledger_entry(
            NewLedgerEntry::new(account_id, Some(source), Cents(1000), Cents(1000))
                .with_created_at(Timestamp::from_micros(2_000)),
        )
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(2000), Cents(2000))
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert_eq!(run.discrepancies.len(), 1);
    assert_eq!(
        run.discrepancies[0].kind(),
        DiscrepancyKind::DuplicateBalanceIncrement
    );

    let outcomes = env
        .service
        .auto_correct(&run, CorrectionMode::Apply)
        .await
        .unwrap();
    assert_eq!(outcomes.iter().filter(|o| o.is_applied()).count(), 1);

    let after = balance_of(&env.repo, account_id).await;
    assert_eq!(after.amount, Cents(1000));
    assert_eq!(after.holding_amount, Cents(1000));

    let kept = env.repo.get_ledger_entry(first.id).await.unwrap().unwrap();
    let removed = env.repo.get_ledger_entry(second.id).await.unwrap().unwrap();
    assert!(!kept.is_deleted());
    assert!(removed.is_deleted());

    let audit = env
        .repo
        .query_audit_logs(&AuditQuery::ByBalance(balance.id), 10)
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].operation, AuditOperation::Reconciliation);
    assert_eq!(audit[0].amount_before, Some(Cents(2000)));
    assert_eq!(audit[0].amount_after, Some(Cents(1000)));
    assert_eq!(audit[0].holding_before, Some(Cents(2000)));
    assert_eq!(audit[0].holding_after, Some(Cents(1000)));

    assert!(env
        .service
        .reconcile(account_id, as_of())
        .await
        .unwrap()
        .is_clean());
}

#[tokio::test]
async fn test_orphan_is_reported_and_never_mutated() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    let orphan = env
        .repo
        .insert_ledger_entry(NewLedgerEntry::new(account_id, None, Cents(300), Cents(0)))
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(300), Cents(0))
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert_eq!(run.discrepancies.len(), 1);
    assert_eq!(
        run.discrepancies[0].kind(),
        DiscrepancyKind::OrphanedBalanceTransaction
    );

    let outcomes = env
        .service
        .auto_correct(&run, CorrectionMode::Apply)
        .await
        .unwrap();
    assert_eq!(outcomes[0].status, CorrectionStatus::NotCorrectable);

    let entry = env.repo.get_ledger_entry(orphan.id).await.unwrap().unwrap();
    assert_eq!(entry, orphan);
    assert_eq!(balance_of(&env.repo, account_id).await.amount, Cents(300));
    assert!(env
        .repo
        .query_audit_logs(&AuditQuery::ByBalance(balance.id), 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(env.notes.notes().len(), 1);
    assert_eq!(env.notes.notes()[0].account_id, account_id);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    env.repo
        .set_balance_amounts(balance.id, Cents(900), Cents(0))
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    let outcomes = env
        .service
        .auto_correct(&run, CorrectionMode::DryRun)
        .await
        .unwrap();
    assert_eq!(outcomes[0].status, CorrectionStatus::Planned);
    assert_eq!(balance_of(&env.repo, account_id).await.amount, Cents(900));
    assert!(env
        .repo
        .query_audit_logs(&AuditQuery::ByBalance(balance.id), 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_paid_out_entries_leave_the_aggregate() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    env.repo
        .insert_ledger_entry(NewLedgerEntry::new(
            account_id,
            Some(CausalSource::purchase(11)),
            Cents(700),
            Cents(100),
        ))
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(700), Cents(100))
        .await
        .unwrap();

    let swept = env
        .repo
        .record_payout(account_id, 1, "payouts")
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let after = balance_of(&env.repo, account_id).await;
    assert_eq!(after.amount, Cents::ZERO);
    assert_eq!(after.holding_amount, Cents::ZERO);
    assert!(env
        .service
        .reconcile(account_id, as_of())
        .await
        .unwrap()
        .is_clean());
}

#[tokio::test]
async fn test_duplicate_after_payout_is_removed() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    let source = CausalSource::purchase(21);
    let first = env
        .repo
        .insert_ledger_entry(
            NewLedgerEntry::new(account_id, Some(source), Cents(800), Cents(800))
                .with_created_at(Timestamp::from_micros(1_000)),
        )
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(800), Cents(800))
        .await
        .unwrap();
    env.repo
        .record_payout(account_id, 5, "payouts")
        .await
        .unwrap();

    let second = env
        .repo
        .insert_ledger_entry(
            NewLedgerEntry::new(account_id, Some(source), Cents(800), Cents(800))
                .with_created_at(Timestamp::from_micros(2_000)),
        )
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(800), Cents(800))
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert_eq!(run.discrepancies.len(), 1);
    assert_eq!(
        run.discrepancies[0].kind(),
        DiscrepancyKind::DuplicateBalanceIncrement
    );

    let outcomes = env
        .service
        .auto_correct(&run, CorrectionMode::Apply)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_applied());

    let after = balance_of(&env.repo, account_id).await;
    assert_eq!(after.amount, Cents::ZERO);
    assert_eq!(after.holding_amount, Cents::ZERO);
    let kept = env.repo.get_ledger_entry(first.id).await.unwrap().unwrap();
    assert!(!kept.is_deleted());
    assert_eq!(kept.payout_id, Some(5));
    assert!(env
        .repo
        .get_ledger_entry(second.id)
        .await
        .unwrap()
        .unwrap()
        .is_deleted());

    assert!(env
        .service
        .reconcile(account_id, as_of())
        .await
        .unwrap()
        .is_clean());
}

#[tokio::test]
async fn test_paid_duplicate_goes_to_manual_review() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    let source = CausalSource::purchase(22);
    for created_at in [1_000, 2_000] {
        env.repo
            .insert_ledger_entry(
                NewLedgerEntry::new(account_id, Some(source), Cents(300), Cents(0))
                    .with_created_at(Timestamp::from_micros(created_at)),
            )
            .await
            .unwrap();
    }
    env.repo
        .set_balance_amounts(balance.id, Cents(600), Cents(0))
        .await
        .unwrap();
    env.repo
        .record_payout(account_id, 6, "payouts")
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert_eq!(run.discrepancies.len(), 1);

    let outcomes = env
        .service
        .auto_correct(&run, CorrectionMode::Apply)
        .await
        .unwrap();
    assert!(matches!(
        outcomes[0].status,
        CorrectionStatus::ManualReview { .. }
    ));
    assert_eq!(balance_of(&env.repo, account_id).await.amount, Cents::ZERO);
    assert_eq!(env.notes.notes().len(), 1);
}

#[tokio::test]
async fn test_reconcile_all_pages_through_every_account() {
    let settings = ReconcileSettings {
        operator_account_id: AccountId::new(42),
        batch_size: 2,
        ..ReconcileSettings::default()
    };
    let env = setup_with(settings, None).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let (account_id, balance) = account(&env.repo, None).await;
        env.repo
            .insert_ledger_entry(NewLedgerEntry::new(
                account_id,
                Some(CausalSource::purchase(100 + i)),
                Cents(100),
                Cents(0),
            ))
            .await
            .unwrap();
        let cached = if i == 0 { Cents(175) } else { Cents(100) };
        env.repo
            .set_balance_amounts(balance.id, cached, Cents(0))
            .await
            .unwrap();
        ids.push(account_id);
    }

    let mut conn = env.repo.pool().acquire().await.unwrap();
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await
        .unwrap();
    sqlx::query("DELETE FROM balances WHERE account_id = ?")
        .bind(ids[3].as_i64())
        .execute(&mut *conn)
        .await
        .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await
        .unwrap();
    drop(conn);

    let run = env.service.reconcile_all(as_of()).await.unwrap();
    assert_eq!(run.accounts_scanned, 5);
    assert_eq!(run.failed_accounts.len(), 1);
    assert_eq!(run.failed_accounts[0].account_id, ids[3]);
    assert_eq!(run.accounts_with_discrepancies, 1);
    assert_eq!(run.discrepancies.len(), 1);
    assert_eq!(run.discrepancies[0].account_id, ids[0]);
    assert_eq!(
        run.discrepancies[0].kind(),
        DiscrepancyKind::BalanceCalculationMismatch
    );
}

#[tokio::test]
async fn test_external_mismatch_is_reported_only() {
    let processor = MockProcessorClient::new().with_balance("acct_1", Currency::usd(), Cents(400));
    let env = setup(Some(Arc::new(processor))).await;
    let (account_id, balance) = account(&env.repo, Some("acct_1")).await;
    env.repo
        .insert_ledger_entry(
            NewLedgerEntry::new(
                account_id,
                Some(CausalSource::purchase(5)),
                Cents(0),
                Cents(500),
            )
            .with_merchant_account("acct_1"),
        )
        .await
        .unwrap();
    env.repo
        .set_balance_amounts(balance.id, Cents(0), Cents(500))
        .await
        .unwrap();

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert_eq!(run.discrepancies.len(), 1);
    assert_eq!(
        run.discrepancies[0].kind(),
        DiscrepancyKind::ExternalBalanceMismatch
    );

    let outcomes = env
        .service
        .auto_correct(&run, CorrectionMode::Apply)
        .await
        .unwrap();
    assert_eq!(outcomes[0].status, CorrectionStatus::NotCorrectable);
    assert_eq!(
        balance_of(&env.repo, account_id).await.holding_amount,
        Cents(500)
    );
}

#[tokio::test]
async fn test_processor_failure_skips_external_check() {
    let processor = MockProcessorClient::new()
        .with_failure("acct_1", ProcessorError::NetworkError("timeout".to_string()));
    let env = setup(Some(Arc::new(processor.clone()))).await;
    let (account_id, _) = account(&env.repo, Some("acct_1")).await;

    let run = env.service.reconcile(account_id, as_of()).await.unwrap();
    assert!(run.is_clean());
    assert_eq!(run.skipped_checks.len(), 1);
    assert_eq!(
        run.skipped_checks[0].check,
        DiscrepancyKind::ExternalBalanceMismatch
    );
    assert_eq!(processor.call_count(), 1);
}

#[tokio::test]
async fn test_concurrent_corrections_apply_once() {
    let env = setup(None).await;
    let (account_id, balance) = account(&env.repo, None).await;
    env.repo
        .set_balance_amounts(balance.id, Cents(1234), Cents(0))
        .await
        .unwrap();
    let run = env.service.reconcile(account_id, as_of()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = env.service.clone();
        let run = run.clone();
        handles.push(tokio::spawn(async move {
            service.auto_correct(&run, CorrectionMode::Apply).await
        }));
    }
    let mut applied = 0;
    for handle in handles {
        let outcomes = handle.await.unwrap().unwrap();
        applied += outcomes.iter().filter(|o| o.is_applied()).count();
    }

    assert_eq!(applied, 1);
    assert_eq!(balance_of(&env.repo, account_id).await.amount, Cents::ZERO);
    assert_eq!(
        env.repo
            .query_audit_logs(&AuditQuery::ByBalance(balance.id), 10)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_reconcile_unknown_account_fails() {
    let env = setup(None).await;
    assert!(env
        .service
        .reconcile(AccountId::new(999), as_of())
        .await
        .is_err());
}
