//! Dispatcher routing against the in-memory store.

use std::sync::Arc;

use docctx_core::{
    attach_client, collection, create, delete, doc, document_refs, documents, get,
    run_transaction, set, update, Context, Error, Precondition, SetOptions, Update,
};
use docctx_memory::{Call, MemoryClient, Mode, Op};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn setup() -> (Context, MemoryClient) {
    init_tracing();
    let client = MemoryClient::new();
    let ctx = attach_client(&Context::background(), Arc::new(client.clone()));
    (ctx, client)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    owner: String,
    balance: i64,
}

#[tokio::test]
async fn get_transaction_set_scenario() {
    let (root, client) = setup();
    let doc_ref = doc(&root, "accounts/acme").unwrap();
    let data = json!({ "owner": "acme", "balance": 100 });

    set(&root, &doc_ref, &data, SetOptions::Overwrite).await.unwrap();
    client.journal().take();

    // Outside a transaction: direct read, result returned unchanged.
    let snap = get(&root, &doc_ref).await.unwrap();
    assert_eq!(snap.data_to::<Account>().unwrap().balance, 100);
    assert_eq!(
        client.journal().take(),
        vec![Call::new(Mode::Direct, Op::Get, "accounts/acme")]
    );

    // Inside: the write is staged on the transaction and committed once.
    let updated = json!({ "owner": "acme", "balance": 250 });
    let out = run_transaction(&root, |tx_ctx| {
        let doc_ref = doc_ref.clone();
        let updated = updated.clone();
        async move { set(&tx_ctx, &doc_ref, &updated, SetOptions::Overwrite).await }
    })
    .await;
    assert_eq!(out, Ok(()));
    assert_eq!(
        client.journal().take(),
        vec![
            Call::new(Mode::Transaction(1), Op::Set, "accounts/acme").with_data(updated.clone()),
            Call::new(Mode::Transaction(1), Op::Commit, ""),
        ]
    );
    assert_eq!(client.contents("accounts/acme").unwrap()["balance"], json!(250));

    // The root context never saw the transaction.
    set(&root, &doc_ref, &data, SetOptions::Overwrite).await.unwrap();
    let calls = client.journal().take();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].mode, Mode::Direct);
    assert_eq!(calls[0].op, Op::Set);
}

#[tokio::test]
async fn staged_writes_are_invisible_until_commit() {
    let (root, client) = setup();
    let alice = doc(&root, "users/alice").unwrap();

    let observer = client.clone();
    run_transaction(&root, |tx_ctx| {
        let alice = alice.clone();
        let observer = observer.clone();
        async move {
            create(&tx_ctx, &alice, &json!({ "name": "Alice" })).await?;
            assert!(observer.contents("users/alice").is_none());
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(
        client.contents("users/alice").unwrap()["name"],
        json!("Alice")
    );
}

#[tokio::test]
async fn failed_work_rolls_back_and_returns_its_error() {
    let (root, client) = setup();
    let alice = doc(&root, "users/alice").unwrap();

    let out = run_transaction(&root, |tx_ctx| {
        let alice = alice.clone();
        async move {
            set(&tx_ctx, &alice, &json!({ "name": "Alice" }), SetOptions::Overwrite).await?;
            Err(Error::permission_denied("not allowed"))
        }
    })
    .await;

    assert_eq!(out, Err(Error::permission_denied("not allowed")));
    assert!(client.contents("users/alice").is_none());
    let ops: Vec<_> = client.journal().calls().into_iter().map(|c| c.op).collect();
    assert_eq!(ops, vec![Op::Set, Op::Rollback]);
}

#[tokio::test]
async fn not_found_passes_through_both_paths() {
    let (root, _client) = setup();
    let ghost = doc(&root, "users/ghost").unwrap();

    assert_eq!(
        get(&root, &ghost).await.unwrap_err(),
        Error::not_found("users/ghost")
    );

    let out = run_transaction(&root, |tx_ctx| {
        let ghost = ghost.clone();
        async move { get(&tx_ctx, &ghost).await.map(drop) }
    })
    .await;
    assert_eq!(out, Err(Error::not_found("users/ghost")));
}

#[tokio::test]
async fn create_conflict_surfaces_directly_and_at_commit() {
    let (root, _client) = setup();
    let alice = doc(&root, "users/alice").unwrap();
    create(&root, &alice, &json!({ "v": 1 })).await.unwrap();

    assert_eq!(
        create(&root, &alice, &json!({ "v": 2 })).await,
        Err(Error::already_exists("users/alice"))
    );

    let out = run_transaction(&root, |tx_ctx| {
        let alice = alice.clone();
        async move { create(&tx_ctx, &alice, &json!({ "v": 3 })).await }
    })
    .await;
    assert_eq!(out, Err(Error::already_exists("users/alice")));
}

#[tokio::test]
async fn listing_routes_by_context() {
    let (root, client) = setup();
    let users = collection(&root, "users").unwrap();
    for id in ["alice", "bob", "carol"] {
        let user = users.doc(id).unwrap();
        set(&root, &user, &json!({ "id": id }), SetOptions::Overwrite)
            .await
            .unwrap();
    }
    let nested = doc(&root, "users/dave/posts/p1").unwrap();
    set(&root, &nested, &json!({}), SetOptions::Overwrite)
        .await
        .unwrap();
    client.journal().take();

    let direct: Vec<_> = documents(&root, &users.limit(2))
        .map(|r| r.unwrap().reference.id().to_owned())
        .collect()
        .await;
    assert_eq!(direct, vec!["alice", "bob"]);

    let refs: Vec<_> = document_refs(&root, &users)
        .map(|r| r.unwrap().id().to_owned())
        .collect()
        .await;
    assert_eq!(refs, vec!["alice", "bob", "carol", "dave"]);

    let users_in_tx = users.clone();
    run_transaction(&root, move |tx_ctx| {
        let users = users_in_tx.clone();
        async move {
            let all: Vec<_> = documents(&tx_ctx, &users.query()).collect().await;
            assert_eq!(all.len(), 3);
            let refs: Vec<_> = document_refs(&tx_ctx, &users).collect().await;
            assert_eq!(refs.len(), 4);
            Ok(())
        }
    })
    .await
    .unwrap();

    let modes: Vec<_> = client
        .journal()
        .take()
        .into_iter()
        .map(|c| (c.mode, c.op))
        .collect();
    assert_eq!(
        modes,
        vec![
            (Mode::Direct, Op::Documents),
            (Mode::Direct, Op::DocumentRefs),
            (Mode::Transaction(1), Op::Documents),
            (Mode::Transaction(1), Op::DocumentRefs),
            (Mode::Transaction(1), Op::Commit),
        ]
    );
}

#[tokio::test]
async fn update_preconditions_and_field_paths() {
    let (root, client) = setup();
    let alice = doc(&root, "users/alice").unwrap();

    assert_eq!(
        update(&root, &alice, vec![Update::set("age", 30)], &[]).await,
        Err(Error::not_found("users/alice"))
    );

    set(&root, &alice, &json!({ "name": "Alice", "nick": "al" }), SetOptions::Overwrite)
        .await
        .unwrap();
    let written = get(&root, &alice).await.unwrap().update_time;

    update(
        &root,
        &alice,
        vec![Update::set("address.city", "Lisbon"), Update::delete("nick")],
        &[Precondition::UpdateTime(written)],
    )
    .await
    .unwrap();
    assert_eq!(
        client.contents("users/alice").unwrap(),
        json!({ "name": "Alice", "address": { "city": "Lisbon" } })
            .as_object()
            .unwrap()
            .clone()
    );

    let stale = written - chrono::Duration::seconds(1);
    let out = update(
        &root,
        &alice,
        vec![Update::set("age", 31)],
        &[Precondition::UpdateTime(stale)],
    )
    .await;
    assert!(matches!(out, Err(Error::FailedPrecondition { .. })));
}

#[tokio::test]
async fn set_merge_options() {
    let (root, client) = setup();
    let alice = doc(&root, "users/alice").unwrap();
    set(
        &root,
        &alice,
        &json!({ "name": "Alice", "prefs": { "theme": "dark", "lang": "en" } }),
        SetOptions::Overwrite,
    )
    .await
    .unwrap();

    set(
        &root,
        &alice,
        &json!({ "prefs": { "lang": "pt" } }),
        SetOptions::MergeAll,
    )
    .await
    .unwrap();
    set(
        &root,
        &alice,
        &json!({ "name": "Al", "prefs": { "theme": "light" } }),
        SetOptions::Merge(vec!["prefs.theme".into()]),
    )
    .await
    .unwrap();

    assert_eq!(
        serde_json::Value::Object(client.contents("users/alice").unwrap()),
        json!({ "name": "Alice", "prefs": { "theme": "light", "lang": "pt" } })
    );
}

#[tokio::test]
async fn non_map_payload_is_rejected_by_the_client() {
    let (root, client) = setup();
    let alice = doc(&root, "users/alice").unwrap();

    let out = set(&root, &alice, &json!([1, 2, 3]), SetOptions::Overwrite).await;

    assert!(matches!(out, Err(Error::InvalidArgument { .. })));
    assert!(client.is_empty());
}

#[tokio::test]
async fn transactional_writes_keep_options_and_preconditions() {
    let (root, client) = setup();
    let alice = doc(&root, "users/alice").unwrap();
    let bob = doc(&root, "users/bob").unwrap();
    set(
        &root,
        &alice,
        &json!({ "name": "Alice", "nick": "al", "prefs": { "theme": "dark", "lang": "en" } }),
        SetOptions::Overwrite,
    )
    .await
    .unwrap();
    create(&root, &bob, &json!({ "name": "Bob" })).await.unwrap();
    let alice_written = get(&root, &alice).await.unwrap().update_time;
    let bob_written = get(&root, &bob).await.unwrap().update_time;

    run_transaction(&root, |tx_ctx| {
        let (alice, bob) = (alice.clone(), bob.clone());
        async move {
            update(
                &tx_ctx,
                &alice,
                vec![Update::delete("nick")],
                &[Precondition::UpdateTime(alice_written)],
            )
            .await?;
            set(&tx_ctx, &alice, &json!({ "prefs": { "lang": "pt" } }), SetOptions::MergeAll)
                .await?;
            set(
                &tx_ctx,
                &alice,
                &json!({ "name": "Al", "prefs": { "theme": "light" } }),
                SetOptions::Merge(vec!["prefs.theme".into()]),
            )
            .await?;
            delete(&tx_ctx, &bob, &[Precondition::UpdateTime(bob_written)]).await
        }
    })
    .await
    .unwrap();

    assert_eq!(
        serde_json::Value::Object(client.contents("users/alice").unwrap()),
        json!({ "name": "Alice", "prefs": { "theme": "light", "lang": "pt" } })
    );
    assert!(client.contents("users/bob").is_none());

    // A stale precondition on a staged delete fails the whole commit.
    create(&root, &bob, &json!({ "name": "Bob" })).await.unwrap();
    let stale = bob_written - chrono::Duration::seconds(1);
    let out = run_transaction(&root, |tx_ctx| {
        let (alice, bob) = (alice.clone(), bob.clone());
        async move {
            set(&tx_ctx, &alice, &json!({ "gone": true }), SetOptions::Overwrite).await?;
            delete(&tx_ctx, &bob, &[Precondition::UpdateTime(stale)]).await
        }
    })
    .await;

    assert!(matches!(out, Err(Error::FailedPrecondition { .. })));
    assert!(client.contents("users/bob").is_some());
    assert_eq!(client.contents("users/alice").unwrap()["name"], json!("Alice"));
}
