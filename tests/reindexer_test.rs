mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use komplex_store::{
    check_dense, InMemoryOrderBackend, NewGrade, OrderedTable, Placement, Reindexer, StoreError,
    TransactionAware, GRADES,
};
use postgres_unit_of_work::{TransactionError, TransactionResult};
use proptest::prelude::*;
use uuid::Uuid;

use common::{ids, indices, lesson, lessons_under, seeded_lessons, Letters};

#[tokio::test]
async fn test_insert_before_shifts_target_and_followers() {
    let (reindexer, _, scope, seeded) = seeded_lessons(3).await;
    let mut letters = Letters::new(&seeded);

    let id = reindexer
        .insert(&scope, &lesson("new"), Placement::before_index(1))
        .await
        .unwrap();
    letters.name(id, "new");

    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(letters.render(&rows), vec!["A(0)", "new(1)", "B(2)", "C(3)"]);
}

#[tokio::test]
async fn test_insert_after_shifts_followers_only() {
    let (reindexer, _, scope, seeded) = seeded_lessons(3).await;
    let mut letters = Letters::new(&seeded);

    let id = reindexer
        .insert(&scope, &lesson("new"), Placement::after_index(1))
        .await
        .unwrap();
    letters.name(id, "new");

    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(letters.render(&rows), vec!["A(0)", "B(1)", "new(2)", "C(3)"]);
}

#[tokio::test]
async fn test_insert_relative_to_entity() {
    let (reindexer, _, scope, seeded) = seeded_lessons(3).await;
    let mut letters = Letters::new(&seeded);

    let first = reindexer
        .insert(&scope, &lesson("x"), Placement::after(seeded[2]))
        .await
        .unwrap();
    let second = reindexer
        .insert(&scope, &lesson("y"), Placement::before(seeded[0]))
        .await
        .unwrap();
    letters.name(first, "x");
    letters.name(second, "y");

    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(
        letters.render(&rows),
        vec!["y(0)", "A(1)", "B(2)", "C(3)", "x(4)"]
    );
}

#[tokio::test]
async fn test_append_to_empty_and_populated_scope() {
    let backend = InMemoryOrderBackend::new();
    let reindexer = Reindexer::new(backend);
    let scope = lessons_under();

    let first = reindexer.insert(&scope, &lesson("a"), Placement::Append).await.unwrap();
    let second = reindexer.insert(&scope, &lesson("b"), Placement::Append).await.unwrap();

    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(ids(&rows), vec![first, second]);
    assert_eq!(indices(&rows), vec![0, 1]);
}

#[tokio::test]
async fn test_one_based_table_starts_at_one() {
    const CHAPTERS: OrderedTable = OrderedTable::new("chapters").one_based();
    let reindexer = Reindexer::new(InMemoryOrderBackend::new());
    let scope = CHAPTERS.scope(None);

    for name in ["intro", "body", "outro"] {
        reindexer.insert(&scope, &lesson(name), Placement::Append).await.unwrap();
    }
    let middle = reindexer.list(&scope).await.unwrap()[1].id;
    reindexer.delete(&scope, middle).await.unwrap();

    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(indices(&rows), vec![1, 2]);
    reindexer.verify(&scope).await.unwrap();
}

#[tokio::test]
async fn test_delete_closes_gap() {
    let (reindexer, _, scope, seeded) = seeded_lessons(4).await;
    let letters = Letters::new(&seeded);

    reindexer.delete(&scope, seeded[1]).await.unwrap();

    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(letters.render(&rows), vec!["A(0)", "C(1)", "D(2)"]);
}

#[tokio::test]
async fn test_move_forward_and_backward() {
    let (reindexer, _, scope, seeded) = seeded_lessons(5).await;
    let letters = Letters::new(&seeded);

    // B after D
    let index = reindexer
        .move_to(&scope, seeded[1], Some(Placement::after_index(3)))
        .await
        .unwrap();
    assert_eq!(index, 3);
    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(
        letters.render(&rows),
        vec!["A(0)", "C(1)", "D(2)", "B(3)", "E(4)"]
    );

    // E before A
    let index = reindexer
        .move_to(&scope, seeded[4], Some(Placement::before(seeded[0])))
        .await
        .unwrap();
    assert_eq!(index, 0);
    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(
        letters.render(&rows),
        vec!["E(0)", "A(1)", "C(2)", "D(3)", "B(4)"]
    );
}

#[tokio::test]
async fn test_move_and_back_restores_ordering() {
    let (reindexer, _, scope, seeded) = seeded_lessons(5).await;
    let original = reindexer.list(&scope).await.unwrap();

    reindexer
        .move_to(&scope, seeded[1], Some(Placement::after_index(3)))
        .await
        .unwrap();
    assert_ne!(reindexer.list(&scope).await.unwrap(), original);

    reindexer
        .move_to(&scope, seeded[1], Some(Placement::before_index(1)))
        .await
        .unwrap();
    assert_eq!(reindexer.list(&scope).await.unwrap(), original);
}

#[tokio::test]
async fn test_move_relative_to_itself_is_a_no_op() {
    let (reindexer, _, scope, seeded) = seeded_lessons(3).await;
    let original = reindexer.list(&scope).await.unwrap();

    for placement in [Placement::before(seeded[1]), Placement::after(seeded[1])] {
        let index = reindexer.move_to(&scope, seeded[1], Some(placement)).await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(reindexer.list(&scope).await.unwrap(), original);
    }
}

#[tokio::test]
async fn test_move_without_placement_only_checks_presence() {
    let (reindexer, _, scope, seeded) = seeded_lessons(3).await;
    let original = reindexer.list(&scope).await.unwrap();

    assert_eq!(reindexer.move_to(&scope, seeded[2], None).await.unwrap(), 2);
    assert_eq!(reindexer.list(&scope).await.unwrap(), original);

    let err = reindexer.move_to(&scope, Uuid::new_v4(), None).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_missing_target_leaves_scope_unchanged() {
    let (reindexer, backend, scope, seeded) = seeded_lessons(3).await;
    let original = backend.snapshot(&scope).await;

    let err = reindexer
        .insert(&scope, &lesson("new"), Placement::before_index(999))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    let err = reindexer
        .move_to(&scope, seeded[0], Some(Placement::after(Uuid::new_v4())))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = reindexer.delete(&scope, Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_not_found());

    assert_eq!(backend.snapshot(&scope).await, original);
}

#[tokio::test]
async fn test_scopes_are_independent() {
    let backend = InMemoryOrderBackend::new();
    let reindexer = Reindexer::new(backend.clone());
    let first = lessons_under();
    let second = lessons_under();
    let first_ids = backend.seed(&first, 3).await;
    backend.seed(&second, 2).await;

    reindexer.delete(&first, first_ids[0]).await.unwrap();
    // An id from another scope is not a sibling
    let err = reindexer.delete(&second, first_ids[1]).await.unwrap_err();
    assert!(err.is_not_found());

    assert_eq!(indices(&reindexer.list(&first).await.unwrap()), vec![0, 1]);
    assert_eq!(indices(&reindexer.list(&second).await.unwrap()), vec![0, 1]);
}

fn grade(name: &str) -> NewGrade {
    NewGrade {
        name: name.to_string(),
    }
}

#[tokio::test]
async fn test_unscoped_table_orders_globally() {
    let reindexer = Reindexer::new(InMemoryOrderBackend::new());
    let a = reindexer
        .insert(&GRADES.scope(None), &grade("Grade 1"), Placement::Append)
        .await
        .unwrap();
    // The parent is ignored for tables without a parent column
    let b = reindexer
        .insert(&GRADES.scope(Some(Uuid::new_v4())), &grade("Grade 0"), Placement::before(a))
        .await
        .unwrap();

    let rows = reindexer.list(&GRADES.scope(None)).await.unwrap();
    assert_eq!(ids(&rows), vec![b, a]);
}

#[tokio::test]
async fn test_verify_and_renumber_repair_raw_writes() {
    let (reindexer, backend, scope, seeded) = seeded_lessons(3).await;
    reindexer.verify(&scope).await.unwrap();

    // Simulate writes made outside the reindexer: a gap and a duplicate
    backend.put_raw(&scope, seeded[1], 5).await;
    let stray = Uuid::new_v4();
    backend.put_raw(&scope, stray, 0).await;

    let err = reindexer.verify(&scope).await.unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation { .. }));

    let changed = reindexer.renumber(&scope).await.unwrap();
    assert!(changed > 0);
    reindexer.verify(&scope).await.unwrap();

    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(rows.len(), 4);
    // Relative order is kept: the moved row stays last
    assert_eq!(rows.last().map(|row| row.id), Some(seeded[1]));
    assert_eq!(reindexer.renumber(&scope).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_stay_dense() {
    const WRITERS: usize = 32;
    let reindexer = Arc::new(Reindexer::new(InMemoryOrderBackend::new()));
    let scope = lessons_under();

    let handles: Vec<_> = (0..WRITERS)
        .map(|n| {
            let reindexer = reindexer.clone();
            tokio::spawn(async move {
                reindexer
                    .insert(&scope, &lesson(&format!("lesson {n}")), Placement::Append)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let rows = reindexer.list(&scope).await.unwrap();
    assert_eq!(rows.len(), WRITERS);
    assert_eq!(indices(&rows), (0..WRITERS as i32).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mixed_writes_stay_dense() {
    let (reindexer, _, scope, seeded) = seeded_lessons(16).await;
    let reindexer = Arc::new(reindexer);

    let mut handles = Vec::new();
    for (n, id) in seeded.iter().copied().enumerate() {
        let reindexer = reindexer.clone();
        handles.push(tokio::spawn(async move {
            match n % 3 {
                0 => reindexer.delete(&scope, id).await.map(|_| ()),
                1 => reindexer
                    .move_to(&scope, id, Some(Placement::before_index(0)))
                    .await
                    .map(|_| ()),
                _ => reindexer
                    .insert(&scope, &lesson("extra"), Placement::after(id))
                    .await
                    .map(|_| ()),
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    reindexer.verify(&scope).await.unwrap();
}

#[derive(Default)]
struct Recorder {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

#[async_trait]
impl TransactionAware for Recorder {
    async fn on_commit(&self) -> TransactionResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_rollback(&self) -> TransactionResult<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_participant_follows_transaction_outcome() {
    let (reindexer, backend, scope, seeded) = seeded_lessons(2).await;
    let recorder = Recorder::default();

    reindexer
        .insert_tracked(&scope, &lesson("ok"), Placement::Append, Some(&recorder))
        .await
        .unwrap();
    assert_eq!(recorder.commits.load(Ordering::SeqCst), 1);

    reindexer
        .delete_tracked(&scope, Uuid::new_v4(), Some(&recorder))
        .await
        .unwrap_err();
    assert_eq!(recorder.rollbacks.load(Ordering::SeqCst), 1);

    backend.fail_commits(true);
    let err = reindexer
        .move_to_tracked(&scope, seeded[0], Some(Placement::Append), Some(&recorder))
        .await
        .unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(recorder.commits.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.rollbacks.load(Ordering::SeqCst), 2);

    backend.fail_commits(false);
    // The rejected move left nothing behind
    assert_eq!(ids(&reindexer.list(&scope).await.unwrap())[..2], seeded[..]);
}

struct FailingOnCommit;

#[async_trait]
impl TransactionAware for FailingOnCommit {
    async fn on_commit(&self) -> TransactionResult<()> {
        Err(TransactionError::CommitFailed("cache unreachable".to_string()))
    }

    async fn on_rollback(&self) -> TransactionResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_participant_failure_after_commit_keeps_result() {
    let (reindexer, _backend, scope, seeded) = seeded_lessons(1).await;

    let inserted = reindexer
        .insert_tracked(&scope, &lesson("kept"), Placement::Append, Some(&FailingOnCommit))
        .await
        .unwrap();

    // Committed exactly once
    let listed = ids(&reindexer.list(&scope).await.unwrap());
    assert_eq!(listed, vec![seeded[0], inserted.value]);
    reindexer.verify(&scope).await.unwrap();
}

#[tokio::test]
async fn test_tracked_writes_report_shifted_siblings() {
    let (reindexer, _backend, scope, seeded) = seeded_lessons(3).await;
    let (a, b, c) = (seeded[0], seeded[1], seeded[2]);

    // [A, B, C] -> [X, A, B, C]
    let inserted = reindexer
        .insert_tracked(&scope, &lesson("x"), Placement::before(a), None)
        .await
        .unwrap();
    let mut shifted = inserted.shifted.clone();
    shifted.sort();
    let mut expected = vec![a, b, c];
    expected.sort();
    assert_eq!(shifted, expected);

    // [X, A, B, C] -> [X, A, C, B]; A and X keep their index
    let moved = reindexer
        .move_to_tracked(&scope, b, Some(Placement::Append), None)
        .await
        .unwrap();
    assert_eq!(moved.value, 3);
    assert_eq!(moved.shifted, vec![c]);

    // Appending moves nobody
    let appended = reindexer
        .insert_tracked(&scope, &lesson("y"), Placement::Append, None)
        .await
        .unwrap();
    assert!(appended.shifted.is_empty());

    let deleted = reindexer
        .delete_tracked(&scope, inserted.value, None)
        .await
        .unwrap();
    assert_eq!(deleted.shifted.len(), 4);
    assert!(!deleted.shifted.contains(&inserted.value));
}

#[derive(Debug, Clone)]
enum Op {
    Insert { placement: u8, target: usize },
    Move { who: usize, placement: u8, target: usize },
    Delete { who: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3, 0usize..32).prop_map(|(placement, target)| Op::Insert { placement, target }),
        (0usize..32, 0u8..3, 0usize..32)
            .prop_map(|(who, placement, target)| Op::Move { who, placement, target }),
        (0usize..32).prop_map(|who| Op::Delete { who }),
    ]
}

fn placement(kind: u8, target: i32) -> Placement {
    match kind {
        0 => Placement::before_index(target),
        1 => Placement::after_index(target),
        _ => Placement::Append,
    }
}

/// Applies `placement` to `model`, where `model` no longer contains the row
/// being placed and `anchor` is the anchor's id, if any.
fn place(model: &mut Vec<Uuid>, id: Uuid, kind: u8, anchor: Option<Uuid>) {
    let position = anchor.and_then(|anchor| model.iter().position(|row| *row == anchor));
    match (kind, position) {
        (0, Some(position)) => model.insert(position, id),
        (1, Some(position)) => model.insert(position + 1, id),
        _ => model.push(id),
    }
}

async fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let (reindexer, _, scope, seeded) = seeded_lessons(4).await;
    let mut model = seeded;

    for op in ops {
        match op {
            Op::Insert { placement: kind, target } => {
                let (kind, target) = if model.is_empty() { (2, 0) } else { (kind, target % model.len()) };
                let anchor = model.get(target).copied();
                let id = reindexer
                    .insert(&scope, &lesson("p"), placement(kind, target as i32))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                place(&mut model, id, kind, anchor);
            }
            Op::Move { who, placement: kind, target } => {
                if model.is_empty() {
                    continue;
                }
                let id = model[who % model.len()];
                let target = target % model.len();
                let anchor = model[target];
                let index = reindexer
                    .move_to(&scope, id, Some(placement(kind, target as i32)))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                if anchor != id || kind == 2 {
                    model.retain(|row| *row != id);
                    place(&mut model, id, kind, Some(anchor));
                }
                let expected = model.iter().position(|row| *row == id);
                prop_assert_eq!(Some(index as usize), expected);
            }
            Op::Delete { who } => {
                if model.is_empty() {
                    continue;
                }
                let id = model.remove(who % model.len());
                reindexer
                    .delete(&scope, id)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
        }

        let rows = reindexer.list(&scope).await.map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(check_dense(0, &rows).is_ok(), "not dense: {:?}", indices(&rows));
        prop_assert_eq!(ids(&rows), model.clone());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_operations_keep_ordering_dense(ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops))?;
    }
}
