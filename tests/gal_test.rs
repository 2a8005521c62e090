//! GAL federation integration tests

mod common;

use provis_core::directory::DirectoryStore;
use provis_core::domain::{names, AttrMap};
use provis_core::service::account::CreateAccountInput;
use provis_core::service::domain::CreateDomainInput;
use provis_core::service::{GalMode, GalSearchParams, GalType};

async fn env_with_domain(domain_attrs: &[(&str, &str)]) -> common::TestEnv {
    let env = common::test_env().await;
    let mut input = CreateDomainInput::new("example.com");
    for (attr, value) in domain_attrs {
        input.attrs.set(attr, value.to_string());
    }
    env.engine.create_domain(input).await.unwrap();
    env
}

/// Stamp a change time on an internal entry, the way the directory would
async fn stamp(env: &common::TestEnv, dn: &str, when: &str) {
    env.store
        .inner()
        .modify(
            dn,
            vec![provis_core::directory::Modification::Replace(
                names::A_MODIFIED_TIMESTAMP.to_string(),
                vec![when.to_string()],
            )],
        )
        .await
        .unwrap();
}

async fn seed_external_contact(env: &common::TestEnv, cn: &str, mail: &str, stamp: &str) {
    let mut attrs = AttrMap::new();
    attrs.set(names::A_OBJECT_CLASS, "provisAccount");
    attrs.set("cn", cn);
    attrs.set(names::A_MAIL, mail);
    attrs.set(names::A_MODIFIED_TIMESTAMP, stamp);
    env.external
        .add(&format!("cn={cn},ou=gal"), attrs)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_internal_query_matches_name_fields() {
    let env = env_with_domain(&[]).await;
    env.engine
        .create_account(CreateAccountInput::new("jane.roe@example.com"))
        .await
        .unwrap();
    env.engine
        .create_account(CreateAccountInput::new("john.doe@example.com"))
        .await
        .unwrap();

    let result = env
        .engine
        .search_gal(GalSearchParams::new("example.com", "jane"))
        .await
        .unwrap();
    assert_eq!(result.matches.len(), 1);
    assert_eq!(
        result.matches[0].attrs.get(names::A_MAIL),
        Some("jane.roe@example.com")
    );
    assert!(result.next_sync_token.is_none());
}

#[tokio::test]
async fn test_type_all_unions_resources_within_budget() {
    let env = env_with_domain(&[]).await;
    env.engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();
    let mut resource = CreateAccountInput::new("room1@example.com");
    resource.calendar_resource = true;
    env.engine.create_account(resource).await.unwrap();

    let mut params = GalSearchParams::new("example.com", "");
    params.gal_type = GalType::All;
    let result = env.engine.search_gal(params.clone()).await.unwrap();
    assert_eq!(result.matches.len(), 2);

    // resources only
    params.gal_type = GalType::Resource;
    let result = env.engine.search_gal(params).await.unwrap();
    assert_eq!(result.matches.len(), 1);
    assert_eq!(
        result.matches[0].attrs.get(names::A_MAIL),
        Some("room1@example.com")
    );
}

#[tokio::test]
async fn test_sync_token_advances_past_observed_changes() {
    let env = env_with_domain(&[]).await;
    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();
    stamp(&env, &account.dn, "20240115103000Z").await;

    let mut params = GalSearchParams::new("example.com", "");
    params.sync_token = Some(String::new()); // start from the epoch
    let result = env.engine.search_gal(params.clone()).await.unwrap();
    assert_eq!(result.matches.len(), 1);
    // greater-or-equal comparison: the token moves one second past the
    // newest observed change
    assert_eq!(result.next_sync_token.as_deref(), Some("20240115103001Z"));

    // nothing changed since: same token comes back, no matches re-fetched
    params.sync_token = result.next_sync_token.clone();
    let result = env.engine.search_gal(params).await.unwrap();
    assert!(result.matches.is_empty());
    assert_eq!(result.next_sync_token.as_deref(), Some("20240115103001Z"));
}

#[tokio::test]
async fn test_both_mode_splits_budget_and_takes_later_token() {
    let env = env_with_domain(&[
        (names::A_GAL_MODE, "both"),
        ("provisGalLdapURL", "ldap://gal.example.com"),
        ("provisGalLdapSearchBase", "ou=gal"),
    ])
    .await;

    for i in 0..8 {
        let account = env
            .engine
            .create_account(CreateAccountInput::new(format!("user{i}@example.com")))
            .await
            .unwrap();
        stamp(&env, &account.dn, "20240110000000Z").await;
    }
    for i in 0..8 {
        seed_external_contact(
            &env,
            &format!("contact{i}"),
            &format!("contact{i}@partner.com"),
            "20240120000000Z",
        )
        .await;
    }

    let mut params = GalSearchParams::new("example.com", "");
    params.sync_token = Some(String::new());
    params.limit = 10;
    let result = env.engine.search_gal(params).await.unwrap();

    // budget honored across both sources
    assert!(result.matches.len() <= 10);
    // the merged token is the later of the two sources' tokens
    assert_eq!(result.next_sync_token.as_deref(), Some("20240120000001Z"));
}

#[tokio::test]
async fn test_external_only_mode() {
    let env = env_with_domain(&[
        (names::A_GAL_MODE, "external"),
        ("provisGalLdapURL", "ldap://gal.example.com"),
        ("provisGalLdapSearchBase", "ou=gal"),
    ])
    .await;
    env.engine
        .create_account(CreateAccountInput::new("internal@example.com"))
        .await
        .unwrap();
    seed_external_contact(&env, "partner", "partner@partner.com", "20240120000000Z").await;

    let result = env
        .engine
        .search_gal(GalSearchParams::new("example.com", "partner"))
        .await
        .unwrap();
    assert_eq!(result.matches.len(), 1);
    assert_eq!(
        result.matches[0].attrs.get(names::A_MAIL),
        Some("partner@partner.com")
    );
}

#[tokio::test]
async fn test_mode_override_beats_domain_configuration() {
    let env = env_with_domain(&[(names::A_GAL_MODE, "external")]).await;
    env.engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();

    // forcing internal mode sidesteps the (unconfigured) external source
    let mut params = GalSearchParams::new("example.com", "jane");
    params.mode = Some(GalMode::Internal);
    let result = env.engine.search_gal(params).await.unwrap();
    assert_eq!(result.matches.len(), 1);
}

#[tokio::test]
async fn test_truncation_is_reported() {
    let env = env_with_domain(&[]).await;
    for i in 0..5 {
        env.engine
            .create_account(CreateAccountInput::new(format!("user{i}@example.com")))
            .await
            .unwrap();
    }

    let mut params = GalSearchParams::new("example.com", "user");
    params.limit = 3;
    let result = env.engine.search_gal(params).await.unwrap();
    assert_eq!(result.matches.len(), 3);
    assert!(result.truncated);
}
