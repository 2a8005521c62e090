//! Engine lifecycle and modify-path integration tests

mod common;

use provis_core::config::Config;
use provis_core::directory::{MemoryStore, Modification, StaticSchema};
use provis_core::error::AppError;
use provis_core::service::account::CreateAccountInput;
use provis_core::service::domain::CreateDomainInput;
use provis_core::service::Provisioning;
use std::sync::Arc;

#[tokio::test]
async fn test_double_construction_is_an_error() {
    let store = Arc::new(MemoryStore::new());
    let external = Arc::new(common::FakeExternal(store.clone()));
    let schema = Arc::new(StaticSchema::new());

    let first = Provisioning::init(
        Config::default(),
        store.clone(),
        external.clone(),
        schema.clone(),
        common::BASE_DN,
    );
    assert!(first.is_ok());
    assert!(Provisioning::global().is_some());

    // a second process-wide construction is a startup error, not a halt
    let second = Provisioning::init(Config::default(), store, external, schema, common::BASE_DN);
    assert!(matches!(second, Err(AppError::Internal(_))));
}

#[tokio::test]
async fn test_modify_rejects_immutable_attributes() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("example.com"))
        .await
        .unwrap();
    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();

    let err = env
        .engine
        .modify_attrs(
            &account,
            vec![Modification::Replace(
                provis_core::domain::names::A_PROVIS_ID.to_string(),
                vec!["00000000-0000-0000-0000-000000000000".to_string()],
            )],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn test_modify_replaces_cached_entity() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("example.com"))
        .await
        .unwrap();
    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();

    let updated = env
        .engine
        .modify_attrs(
            &account,
            vec![Modification::Replace(
                "displayName".to_string(),
                vec!["Jane Roe".to_string()],
            )],
        )
        .await
        .unwrap();
    assert_eq!(updated.attrs.get("displayName"), Some("Jane Roe"));

    // the cache serves the replaced copy, not the stale one
    let resolved = env
        .engine
        .get_account(
            provis_core::domain::AccountKey::Id(account.id),
            false,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.attrs.get("displayName"), Some("Jane Roe"));
}

#[tokio::test]
async fn test_cache_stats_observe_hits_and_misses() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("example.com"))
        .await
        .unwrap();
    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();

    env.engine
        .get_account(provis_core::domain::AccountKey::Id(account.id), false)
        .await
        .unwrap();

    let stats = env.engine.cache_stats();
    assert!(stats.accounts.size >= 1);
    assert!(stats.accounts.hits >= 1);
    assert!(stats.accounts.hit_rate() > 0.0);
}

#[tokio::test]
async fn test_search_directory_scopes_and_filters() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("one.com"))
        .await
        .unwrap();
    env.engine
        .create_domain(CreateDomainInput::new("two.com"))
        .await
        .unwrap();
    env.engine
        .create_account(CreateAccountInput::new("a@one.com"))
        .await
        .unwrap();
    env.engine
        .create_account(CreateAccountInput::new("b@two.com"))
        .await
        .unwrap();

    let all = env
        .engine
        .search_directory(provis_core::service::SearchDirectoryOptions::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let scoped = env
        .engine
        .search_directory(provis_core::service::SearchDirectoryOptions {
            domain: Some("one.com".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].name, "a@one.com");
}
