//! Persistence across process restarts: the SQLite repository and the
//! filesystem gateway driving a full apply/rollback cycle.

use std::collections::BTreeMap;
use std::path::Path;

use autopatch::self_modify::repository::StatusUpdate;
use autopatch::self_modify::rollback::{OriginalState, RollbackPointBuilder};
use autopatch::*;

fn meta(declared: RiskLevel) -> ProposalMetadata {
    ProposalMetadata {
        target: "persisted".into(),
        kind: ModificationKind::Bugfix,
        declared_risk: declared,
        trigger: TriggerType::UserFix,
        requires_manual_approval: false,
        motivation: Some("keep state across restarts".into()),
    }
}

fn open(db: &Path, root: &Path) -> ModificationLedger<FsGateway, SqliteRepository> {
    ModificationLedger::new(
        FsGateway::new(root),
        SqliteRepository::open(db).unwrap(),
        &PipelineConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_apply_survives_reopen_and_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("autopatch.db");
    let root = dir.path().join("tree");
    std::fs::create_dir_all(root.join("components")).unwrap();
    std::fs::write(root.join("components/Badge.tsx"), "export const v = 1;\n").unwrap();

    let (id, point_id) = {
        let ledger = open(&db, &root);
        let cs = ChangeSet::new()
            .with_write("components/Badge.tsx", "export const v = 2;\n")
            .unwrap()
            .with_write("components/nested/New.tsx", "new\n")
            .unwrap();
        let out = ledger.propose(cs, meta(RiskLevel::Low)).await.unwrap();
        let id = out.proposal.id.clone();
        if out.action() == DecisionAction::Escalate {
            ledger.approve_pending(&id, "ops").unwrap();
        }
        let report = ledger.apply(&id).await.unwrap();
        assert_eq!(report.files_written, 2);
        (id, report.rollback_point_id)
    };

    assert_eq!(
        std::fs::read_to_string(root.join("components/Badge.tsx")).unwrap(),
        "export const v = 2;\n"
    );
    assert!(root.join("components/nested/New.tsx").exists());

    let ledger = open(&db, &root);
    let stored = ledger.get(&id).unwrap();
    assert_eq!(stored.status, ProposalStatus::Applied);
    assert_eq!(stored.rollback_point_id.as_deref(), Some(point_id.as_str()));
    assert!(stored.timestamps.applied_at_ms.is_some());
    assert_eq!(stored.metadata.motivation.as_deref(), Some("keep state across restarts"));

    let point = ledger.rollback_point(&point_id).unwrap();
    assert!(point.complete);
    assert_eq!(point.proposal_id, id);

    ledger.rollback(&id, &point_id).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(root.join("components/Badge.tsx")).unwrap(),
        "export const v = 1;\n"
    );
    assert!(!root.join("components/nested/New.tsx").exists());

    let reopened = open(&db, &root);
    assert_eq!(reopened.get(&id).unwrap().status, ProposalStatus::RolledBack);
    assert!(reopened.rollback(&id, &point_id).await.unwrap().already_rolled_back);
}

#[tokio::test]
async fn test_outcome_history_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("autopatch.db");
    let root = dir.path().join("tree");
    std::fs::create_dir_all(root.join("components")).unwrap();
    std::fs::write(root.join("components/Badge.tsx"), "v0").unwrap();

    let before = {
        let ledger = open(&db, &root);
        assert_eq!(ledger.history().success_rate(ModificationKind::Bugfix), None);
        for round in 1..=3 {
            let cs = ChangeSet::new()
                .with_write("components/Badge.tsx", &format!("patched {}", round))
                .unwrap();
            let out = ledger.propose(cs, meta(RiskLevel::Low)).await.unwrap();
            let id = out.proposal.id.clone();
            if out.action() == DecisionAction::Escalate {
                ledger.approve_pending(&id, "ops").unwrap();
            }
            // Someone edits the file between proposal and apply.
            std::fs::write(root.join("components/Badge.tsx"), format!("drifted {}", round)).unwrap();
            assert!(matches!(ledger.apply(&id).await, Err(PipelineError::Conflict { .. })));
            assert_eq!(ledger.get(&id).unwrap().status, ProposalStatus::Failed);
        }
        ledger.history().success_rate(ModificationKind::Bugfix).unwrap()
    };
    assert!(before < 0.5);

    let reopened = open(&db, &root);
    let after = reopened.history().success_rate(ModificationKind::Bugfix).unwrap();
    assert!((after - before).abs() < 1e-9, "before {} after {}", before, after);
    assert_eq!(reopened.history().success_rate(ModificationKind::Enhancement), None);

    // The replayed history feeds scoring the same way the live one did.
    let cs = ChangeSet::new().with_write("components/Other.tsx", "x").unwrap();
    let live = open(&db, &root).evaluate(&cs, &meta(RiskLevel::Low));
    assert!((live.confidence.factors.historical_success_rate - before).abs() < 1e-9);
}

#[tokio::test]
async fn test_pending_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("autopatch.db");
    let root = dir.path().join("tree");

    let id = {
        let ledger = open(&db, &root);
        let cs = ChangeSet::new().with_write("src/lib/db.ts", "pool()").unwrap();
        let out = ledger.propose(cs, meta(RiskLevel::High)).await.unwrap();
        assert_eq!(out.action(), DecisionAction::Escalate);
        out.proposal.id
    };

    let ledger = open(&db, &root);
    let pending = ledger.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].required_risk, RiskLevel::High);
    assert_eq!(pending[0].decision.action, DecisionAction::Escalate);

    ledger.reject_pending(&id, "ops", "out of scope").unwrap();
    assert!(open(&db, &root).list_pending().unwrap().is_empty());
}

#[test]
fn test_repository_cas_and_listing_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let root = dir.path().join("tree");

    let rt = tokio::runtime::Runtime::new().unwrap();
    let ids: Vec<String> = rt.block_on(async {
        let ledger = open(&db, &root);
        let mut ids = Vec::new();
        for name in ["One", "Two", "Three"] {
            let cs = ChangeSet::new()
                .with_write(&format!("components/{}.tsx", name), name)
                .unwrap();
            let mut m = meta(RiskLevel::Low);
            m.requires_manual_approval = true;
            ids.push(ledger.propose(cs, m).await.unwrap().proposal.id);
        }
        ids
    });

    let repo = SqliteRepository::open(&db).unwrap();
    let listed: Vec<String> = repo.list_pending().unwrap().into_iter().map(|p| p.id).collect();
    let mut expected = ids.clone();
    expected.sort_by_key(|id| {
        let p = repo.get(id).unwrap().unwrap();
        (p.timestamps.proposed_at_ms, p.id)
    });
    assert_eq!(listed, expected);

    let now = 1_700_000_000_000;
    repo.update_status(&ids[0], &StatusUpdate::new(ProposalStatus::Pending, ProposalStatus::Approved, now))
        .unwrap();
    let stale = repo
        .update_status(&ids[0], &StatusUpdate::new(ProposalStatus::Pending, ProposalStatus::Rejected, now))
        .unwrap_err();
    assert!(matches!(stale, StoreError::StaleStatus { actual: ProposalStatus::Approved, .. }));
    let illegal = repo
        .update_status(&ids[1], &StatusUpdate::new(ProposalStatus::Pending, ProposalStatus::Applied, now))
        .unwrap_err();
    assert!(matches!(illegal, StoreError::IllegalTransition { .. }));

    let reopened = SqliteRepository::open(&db).unwrap();
    assert_eq!(reopened.list(Some(ProposalStatus::Approved)).unwrap().len(), 1);
    assert_eq!(reopened.list_pending().unwrap().len(), 2);
    assert_eq!(reopened.list(None).unwrap().len(), 3);
}

#[test]
fn test_rollback_point_and_revisions_persist() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let repo = SqliteRepository::open(&db).unwrap();

    let mut builder = RollbackPointBuilder::new("p-1");
    builder.capture(
        "components/A.tsx",
        OriginalState::Content {
            content: "old".into(),
            revision: RevisionToken::of_content("old"),
        },
    );
    builder.mark_written("components/A.tsx", Some(RevisionToken::of_content("new")));
    builder.capture("components/B.tsx", OriginalState::Tombstone);
    let point = builder.partial();
    repo.save_rollback_point(&point).unwrap();
    // Upsert replaces rather than duplicating.
    repo.save_rollback_point(&point).unwrap();
    drop(repo);

    let repo = SqliteRepository::open(&db).unwrap();
    let loaded = repo.get_rollback_point(&point.id).unwrap().unwrap();
    assert_eq!(loaded, point);
    assert_eq!(loaded.written_count(), 1);
    assert!(!loaded.complete);
    assert!(repo.get_rollback_point("missing").unwrap().is_none());
}

#[test]
fn test_refresh_revisions_on_missing_proposal() {
    let repo = SqliteRepository::open_in_memory().unwrap();
    let err = repo.refresh_base_revisions("nope", BTreeMap::new()).unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}
