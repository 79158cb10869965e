use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use helm_core::config::SearchConfig;
use helm_core::events::ResumeDecision;
use helm_core::search::{
    FailureFilter, SearchIndex, SearchService, SessionFilter, SessionSort, SessionSortField,
    SortOrder,
};
use helm_core::session::{
    InMemoryStore, RunStatus, SessionAttributes, SessionStatus, SessionStore, SqliteStore,
    StoreError,
};
use helm_core::test_utils::{
    ScriptedModelClient, TestEngine, order_catalog_with, order_definition,
};
use helm_core::types::SessionId;
use helm_tools::ResultCode;
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
}

struct Stores {
    sessions: Arc<dyn SessionStore>,
    index: Arc<dyn SearchIndex>,
    _dir: Option<TempDir>,
}

async fn stores(backend: Backend) -> Stores {
    match backend {
        Backend::Memory => {
            let store = Arc::new(InMemoryStore::new());
            Stores {
                sessions: store.clone(),
                index: store,
                _dir: None,
            }
        }
        Backend::Sqlite => {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(
                SqliteStore::open(&dir.path().join("helm.db"), Duration::from_secs(5))
                    .await
                    .unwrap(),
            );
            Stores {
                sessions: store.clone(),
                index: store,
                _dir: Some(dir),
            }
        }
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn create_session_is_idempotent_until_ended(#[case] backend: Backend) {
    let stores = stores(backend).await;
    let store = stores.sessions;
    let id = SessionId::from("s");

    let first = store
        .create_session(&id, at(100), SessionAttributes::default())
        .await
        .unwrap();
    assert_eq!(first.status, SessionStatus::Active);
    assert_eq!(first.created_at, at(100));

    let second = store
        .create_session(&id, at(200), SessionAttributes::default())
        .await
        .unwrap();
    assert_eq!(second.status, SessionStatus::Active);
    assert_eq!(second.created_at, at(100));

    let ended = store.end_session(&id, at(300)).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);
    assert_eq!(ended.ended_at, Some(at(300)));

    let again = store.end_session(&id, at(350)).await.unwrap();
    assert_eq!(again.ended_at, Some(at(300)));

    let error = store
        .create_session(&id, at(400), SessionAttributes::default())
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::SessionEnded { .. }));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn session_search_pages_by_keyset(#[case] backend: Backend) {
    let stores = stores(backend).await;
    for secs in [10, 20, 30] {
        stores
            .sessions
            .create_session(
                &SessionId::new(format!("id{secs}")),
                at(secs),
                SessionAttributes::default(),
            )
            .await
            .unwrap();
    }
    let search = SearchService::new(stores.index.clone(), SearchConfig::default());
    let sort = SessionSort::new(SessionSortField::CreatedAt, SortOrder::Desc);
    let filter = SessionFilter::default();

    let first = search
        .search_sessions(&filter, sort, None, Some(2))
        .await
        .unwrap();
    let ids: Vec<&str> = first.sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["id30", "id20"]);
    let cursor = first.next_cursor.expect("a second page");

    let second = search
        .search_sessions(&filter, sort, Some(&cursor), Some(2))
        .await
        .unwrap();
    let ids: Vec<&str> = second.sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["id10"]);
    assert!(second.next_cursor.is_none());

    // A cursor only resumes the query shape it came from.
    let other = SessionSort::new(SessionSortField::LastEventAt, SortOrder::Desc);
    assert!(
        search
            .search_sessions(&filter, other, Some(&cursor), Some(2))
            .await
            .is_err()
    );
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn deleted_sessions_are_hidden_unless_requested(#[case] backend: Backend) {
    let stores = stores(backend).await;
    let attributes = SessionAttributes {
        org_id: Some("acme".into()),
        ..SessionAttributes::default()
    };
    for id in ["kept", "gone"] {
        stores
            .sessions
            .create_session(&SessionId::from(id), at(10), attributes.clone())
            .await
            .unwrap();
    }
    stores
        .sessions
        .delete_session(&SessionId::from("gone"), at(20))
        .await
        .unwrap();

    let search = SearchService::new(stores.index.clone(), SearchConfig::default());
    let mut filter = SessionFilter {
        org_ids: vec!["acme".into()],
        ..SessionFilter::default()
    };
    let page = search
        .search_sessions(&filter, SessionSort::default(), None, None)
        .await
        .unwrap();
    assert_eq!(page.sessions.len(), 1);
    assert_eq!(page.sessions[0].id.as_str(), "kept");

    filter.include_deleted = true;
    let page = search
        .search_sessions(&filter, SessionSort::default(), None, None)
        .await
        .unwrap();
    assert_eq!(page.sessions.len(), 2);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn runs_list_by_session_and_status(#[case] backend: Backend) {
    use helm_core::session::RunMeta;
    use helm_core::types::{AgentId, RunId};

    let stores = stores(backend).await;
    let store = stores.sessions;
    let session = SessionId::from("s1");
    store
        .create_session(&session, at(1), SessionAttributes::default())
        .await
        .unwrap();

    for (run, secs, status) in [
        ("r1", 10, RunStatus::Completed),
        ("r2", 20, RunStatus::Running),
    ] {
        let meta = RunMeta::new(RunId::from(run), AgentId::from("a"), session.clone(), at(secs))
            .with_status(status, at(secs));
        store.upsert_run(&meta).await.unwrap();
    }

    let all = store.list_runs_by_session(&session, None).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|run| run.run_id.as_str()).collect();
    assert_eq!(ids, vec!["r1", "r2"]);

    let running = store
        .list_runs_by_status(&[RunStatus::Running])
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].run_id.as_str(), "r2");

    let error = store
        .upsert_run(
            &RunMeta::new(RunId::from("r1"), AgentId::from("a"), session.clone(), at(30))
                .with_status(RunStatus::Running, at(30)),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::RunTerminal { .. }));
}

#[tokio::test]
async fn denied_tool_results_are_searchable_failures() {
    let harness = TestEngine::new(
        order_catalog_with(order_definition("User declined")),
        ScriptedModelClient::default()
            .with_tool_call("c1", "orders.cancel", json!({"orderId": "o1"}))
            .with_text(["Understood"]),
    );
    let run_id = harness.submit("s1", "cancel o1").await.unwrap();
    let mut status = harness.engine.status(&run_id).await.unwrap();
    for _ in 0..500 {
        if status == RunStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = harness.engine.status(&run_id).await.unwrap();
    }
    assert_eq!(status, RunStatus::Paused);
    harness
        .engine
        .resume(&run_id, ResumeDecision::Deny)
        .await
        .unwrap();
    harness.engine.wait(&run_id).await.unwrap();

    let search = SearchService::new(harness.store.clone(), SearchConfig::default());
    let filter = FailureFilter {
        tool_names: vec!["orders.cancel".into()],
        ..FailureFilter::default()
    };
    let page = search.search_failures(&filter, None, None).await.unwrap();
    assert_eq!(page.failures.len(), 1);
    let failure = &page.failures[0];
    assert_eq!(failure.run_id, run_id);
    assert_eq!(failure.result_code, ResultCode::Denied);
    assert_eq!(failure.session_id.as_str(), "s1");
    assert_eq!(failure.result, json!("User declined"));

    let filter = FailureFilter {
        result_codes: vec![ResultCode::BackendError],
        ..FailureFilter::default()
    };
    let page = search.search_failures(&filter, None, None).await.unwrap();
    assert!(page.failures.is_empty());
}
