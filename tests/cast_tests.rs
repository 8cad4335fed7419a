// tests/cast_tests.rs
//
// Operator casts between triage states, mirrored against a bundle seeded
// with pages in every state.

mod common;

use common::{first_page_with_status, make_bundle, make_page, side_row_count, test_state};
use scanstage::error::StagingError;
use scanstage::models::page::PageStatus;
use scanstage::services::cast::ScanCastService;
use scanstage::services::papers::PaperRegistry;
use scanstage::state::AppState;

/// A bundle holding two pages of every castable state.
async fn seeded_bundle(state: &AppState) -> i64 {
    let bundle_id = make_bundle(state, "testbundle").await;
    for status in [
        PageStatus::Unknown,
        PageStatus::Unknown,
        PageStatus::Known,
        PageStatus::Known,
        PageStatus::Extra,
        PageStatus::Extra,
        PageStatus::Discard,
        PageStatus::Discard,
        PageStatus::Error,
        PageStatus::Error,
    ] {
        make_page(state, bundle_id, status).await;
    }
    bundle_id
}

#[tokio::test]
async fn cast_to_discard_from_each_state() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    let cast = ScanCastService::new(state.clone());

    for (status, side_table, reason) in [
        (
            PageStatus::Error,
            Some("error_pages"),
            "Error page discarded by user0",
        ),
        (
            PageStatus::Extra,
            Some("extra_pages"),
            "Extra page discarded by user0",
        ),
        (
            PageStatus::Known,
            Some("known_pages"),
            "Known page discarded by user0",
        ),
        (PageStatus::Unknown, None, "Unknown page discarded by user0"),
    ] {
        let order = first_page_with_status(&state, bundle_id, status).await;
        let page_id: i64 =
            sqlx::query_scalar("SELECT id FROM pages WHERE bundle_id = ? AND bundle_order = ?")
                .bind(bundle_id)
                .bind(order)
                .fetch_one(&state.pool)
                .await
                .unwrap();

        cast.discard_page("user0", bundle_id, order).await.unwrap();

        let new_status: PageStatus =
            sqlx::query_scalar("SELECT status FROM pages WHERE id = ?")
                .bind(page_id)
                .fetch_one(&state.pool)
                .await
                .unwrap();
        assert_eq!(new_status, PageStatus::Discard);

        // old side row gone, discard row present with the expected reason
        if let Some(table) = side_table {
            assert_eq!(side_row_count(&state, table, page_id).await, 0);
        }
        let recorded: String =
            sqlx::query_scalar("SELECT discard_reason FROM discard_pages WHERE page_id = ?")
                .bind(page_id)
                .fetch_one(&state.pool)
                .await
                .unwrap();
        assert_eq!(recorded, reason);
    }
}

#[tokio::test]
async fn cast_to_unknown_from_each_state() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    let cast = ScanCastService::new(state.clone());

    for (status, side_table) in [
        (PageStatus::Error, "error_pages"),
        (PageStatus::Extra, "extra_pages"),
        (PageStatus::Known, "known_pages"),
        (PageStatus::Discard, "discard_pages"),
    ] {
        let order = first_page_with_status(&state, bundle_id, status).await;
        let page_id: i64 =
            sqlx::query_scalar("SELECT id FROM pages WHERE bundle_id = ? AND bundle_order = ?")
                .bind(bundle_id)
                .bind(order)
                .fetch_one(&state.pool)
                .await
                .unwrap();

        cast.unknowify_page("user0", bundle_id, order).await.unwrap();

        let new_status: PageStatus =
            sqlx::query_scalar("SELECT status FROM pages WHERE id = ?")
                .bind(page_id)
                .fetch_one(&state.pool)
                .await
                .unwrap();
        assert_eq!(new_status, PageStatus::Unknown);
        assert_eq!(side_row_count(&state, side_table, page_id).await, 0);
    }
}

#[tokio::test]
async fn discarding_a_discard_is_refused() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    let cast = ScanCastService::new(state.clone());

    let order = first_page_with_status(&state, bundle_id, PageStatus::Discard).await;
    let err = cast.discard_page("user0", bundle_id, order).await.unwrap_err();
    assert!(matches!(err, StagingError::Validation(_)));
}

#[tokio::test]
async fn unknowifying_an_unknown_is_refused() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    let cast = ScanCastService::new(state.clone());

    let order = first_page_with_status(&state, bundle_id, PageStatus::Unknown).await;
    let err = cast
        .unknowify_page("user0", bundle_id, order)
        .await
        .unwrap_err();
    assert!(matches!(err, StagingError::Validation(_)));
}

#[tokio::test]
async fn pushed_bundles_refuse_casts() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    sqlx::query("UPDATE bundles SET pushed = 1 WHERE id = ?")
        .bind(bundle_id)
        .execute(&state.pool)
        .await
        .unwrap();
    let cast = ScanCastService::new(state.clone());

    let order = first_page_with_status(&state, bundle_id, PageStatus::Error).await;
    let err = cast.discard_page("user0", bundle_id, order).await.unwrap_err();
    assert!(matches!(err, StagingError::PushBlockedImmutable(_)));
    let err = cast
        .unknowify_page("user0", bundle_id, order)
        .await
        .unwrap_err();
    assert!(matches!(err, StagingError::PushBlockedImmutable(_)));
}

#[tokio::test]
async fn knowify_claims_a_free_slot() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    PaperRegistry::new(state.clone())
        .register_paper(61, &[1, 1, 1, 1, 1, 1])
        .await
        .unwrap();
    let cast = ScanCastService::new(state.clone());

    let order = first_page_with_status(&state, bundle_id, PageStatus::Unknown).await;
    cast.knowify_page("user0", bundle_id, order, 61, 2, 1)
        .await
        .unwrap();

    let (paper, page): (i64, i64) = sqlx::query_as(
        "SELECT k.paper_number, k.page_number FROM known_pages k
         JOIN pages p ON p.id = k.page_id
         WHERE p.bundle_id = ? AND p.bundle_order = ?",
    )
    .bind(bundle_id)
    .bind(order)
    .fetch_one(&state.pool)
    .await
    .unwrap();
    assert_eq!((paper, page), (61, 2));
}

#[tokio::test]
async fn knowify_into_claimed_slot_fails_and_leaves_page_alone() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    PaperRegistry::new(state.clone())
        .register_paper(61, &[1, 1, 1, 1, 1, 1])
        .await
        .unwrap();
    let cast = ScanCastService::new(state.clone());

    let first = first_page_with_status(&state, bundle_id, PageStatus::Unknown).await;
    cast.knowify_page("user0", bundle_id, first, 61, 2, 1)
        .await
        .unwrap();

    let second = first_page_with_status(&state, bundle_id, PageStatus::Unknown).await;
    let err = cast
        .knowify_page("user0", bundle_id, second, 61, 2, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StagingError::SlotCollision {
            paper_number: 61,
            page_number: 2
        }
    ));

    // the losing page must be untouched
    let status: PageStatus =
        sqlx::query_scalar("SELECT status FROM pages WHERE bundle_id = ? AND bundle_order = ?")
            .bind(bundle_id)
            .bind(second)
            .fetch_one(&state.pool)
            .await
            .unwrap();
    assert_eq!(status, PageStatus::Unknown);
}

#[tokio::test]
async fn knowify_unregistered_slot_is_refused() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    let cast = ScanCastService::new(state.clone());

    let order = first_page_with_status(&state, bundle_id, PageStatus::Unknown).await;
    let err = cast
        .knowify_page("user0", bundle_id, order, 999, 1, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StagingError::Validation(_)));
}

#[tokio::test]
async fn discarded_known_page_can_become_complete_extra() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    PaperRegistry::new(state.clone())
        .register_paper(61, &[1, 1, 1, 1, 1, 1])
        .await
        .unwrap();
    let cast = ScanCastService::new(state.clone());

    let order = first_page_with_status(&state, bundle_id, PageStatus::Known).await;
    cast.discard_page("user0", bundle_id, order).await.unwrap();
    cast.extralise_page("user0", bundle_id, order).await.unwrap();

    // no data yet: the page is an incomplete extra
    let (paper, questions): (Option<i64>, Option<String>) = sqlx::query_as(
        "SELECT e.paper_number, e.question_list FROM extra_pages e
         JOIN pages p ON p.id = e.page_id
         WHERE p.bundle_id = ? AND p.bundle_order = ?",
    )
    .bind(bundle_id)
    .bind(order)
    .fetch_one(&state.pool)
    .await
    .unwrap();
    assert_eq!(paper, None);
    assert_eq!(questions, None);

    cast.set_extra_page_data(bundle_id, order, 61, &[3, 2])
        .await
        .unwrap();

    let (paper, questions): (Option<i64>, Option<String>) = sqlx::query_as(
        "SELECT e.paper_number, e.question_list FROM extra_pages e
         JOIN pages p ON p.id = e.page_id
         WHERE p.bundle_id = ? AND p.bundle_order = ?",
    )
    .bind(bundle_id)
    .bind(order)
    .fetch_one(&state.pool)
    .await
    .unwrap();
    assert_eq!(paper, Some(61));
    // canonicalized: sorted and deduped
    assert_eq!(questions.as_deref(), Some("[2,3]"));
}

#[tokio::test]
async fn extra_data_validation() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    PaperRegistry::new(state.clone())
        .register_paper(61, &[1, 1, 1, 1, 1, 1])
        .await
        .unwrap();
    let cast = ScanCastService::new(state.clone());

    let order = first_page_with_status(&state, bundle_id, PageStatus::Extra).await;

    // unregistered paper
    let err = cast
        .set_extra_page_data(bundle_id, order, 62, &[1])
        .await
        .unwrap_err();
    assert!(matches!(err, StagingError::InvalidExtraData(_)));

    // question index out of range (assessment has 4 questions)
    let err = cast
        .set_extra_page_data(bundle_id, order, 61, &[5])
        .await
        .unwrap_err();
    assert!(matches!(err, StagingError::InvalidExtraData(_)));

    // empty question list
    let err = cast
        .set_extra_page_data(bundle_id, order, 61, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, StagingError::InvalidExtraData(_)));

    // good data sticks, then clears
    cast.set_extra_page_data(bundle_id, order, 61, &[1, 4])
        .await
        .unwrap();
    cast.clear_extra_page_data(bundle_id, order).await.unwrap();
    let (paper, questions): (Option<i64>, Option<String>) = sqlx::query_as(
        "SELECT e.paper_number, e.question_list FROM extra_pages e
         JOIN pages p ON p.id = e.page_id
         WHERE p.bundle_id = ? AND p.bundle_order = ?",
    )
    .bind(bundle_id)
    .bind(order)
    .fetch_one(&state.pool)
    .await
    .unwrap();
    assert_eq!((paper, questions), (None, None));
}

#[tokio::test]
async fn extralise_is_only_for_unknown_and_discard() {
    let state = test_state().await;
    let bundle_id = seeded_bundle(&state).await;
    let cast = ScanCastService::new(state.clone());

    let order = first_page_with_status(&state, bundle_id, PageStatus::Known).await;
    let err = cast
        .extralise_page("user0", bundle_id, order)
        .await
        .unwrap_err();
    assert!(matches!(err, StagingError::Validation(_)));

    let order = first_page_with_status(&state, bundle_id, PageStatus::Error).await;
    let err = cast
        .extralise_page("user0", bundle_id, order)
        .await
        .unwrap_err();
    assert!(matches!(err, StagingError::Validation(_)));
}
