//! Rename orchestration integration tests

mod common;

use provis_core::directory::{DirectoryStore, Modification};
use provis_core::domain::{names, AccountKey, DomainKey, GroupKey};
use provis_core::error::AppError;
use provis_core::service::account::CreateAccountInput;
use provis_core::service::dlist::CreateDistributionListInput;
use provis_core::service::domain::CreateDomainInput;

#[tokio::test]
async fn test_account_rename_rewrites_aliases_and_group_references() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("old.com"))
        .await
        .unwrap();
    env.engine
        .create_domain(CreateDomainInput::new("new.com"))
        .await
        .unwrap();

    let account = env
        .engine
        .create_account(CreateAccountInput::new("a@old.com"))
        .await
        .unwrap();
    let account = env.engine.add_alias(&account, "alias@old.com").await.unwrap();

    let list = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("team@old.com"))
        .await
        .unwrap();
    env.engine
        .add_group_members(&list, &["a@old.com", "alias@old.com"])
        .await
        .unwrap();

    let renamed = env.engine.rename_account(account.id, "a@new.com").await.unwrap();

    // identifier unchanged, primary and same-domain alias rewritten
    assert_eq!(renamed.id, account.id);
    assert_eq!(renamed.name, "a@new.com");
    assert_eq!(
        renamed.attrs.get_all(names::A_MAIL_ALIAS),
        ["alias@new.com"]
    );

    // the old identity resolves to nothing, the new one works
    assert!(env
        .engine
        .get_account(AccountKey::Name("a@old.com".to_string()), false)
        .await
        .unwrap()
        .is_none());
    assert!(env
        .engine
        .get_account(AccountKey::Name("alias@new.com".to_string()), false)
        .await
        .unwrap()
        .is_some());

    // every group reference follows the rename
    let list = env
        .engine
        .get_group(GroupKey::Id(list.id), false)
        .await
        .unwrap()
        .unwrap();
    let members = list.attrs.get_all(names::A_LIST_MEMBER);
    assert!(members.contains(&"a@new.com".to_string()));
    assert!(members.contains(&"alias@new.com".to_string()));
    assert!(!members.contains(&"a@old.com".to_string()));
    assert!(!members.contains(&"alias@old.com".to_string()));
}

#[tokio::test]
async fn test_foreign_domain_alias_is_left_alone() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("old.com"))
        .await
        .unwrap();
    env.engine
        .create_domain(CreateDomainInput::new("new.com"))
        .await
        .unwrap();
    env.engine
        .create_domain(CreateDomainInput::new("elsewhere.com"))
        .await
        .unwrap();

    let account = env
        .engine
        .create_account(CreateAccountInput::new("a@old.com"))
        .await
        .unwrap();
    let account = env
        .engine
        .add_alias(&account, "a@elsewhere.com")
        .await
        .unwrap();

    let renamed = env.engine.rename_account(account.id, "a@new.com").await.unwrap();
    // the alias in a third domain does not follow the rename
    assert_eq!(
        renamed.attrs.get_all(names::A_MAIL_ALIAS),
        ["a@elsewhere.com"]
    );
}

#[tokio::test]
async fn test_rename_collision_is_rejected_and_old_entry_survives() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("example.com"))
        .await
        .unwrap();
    let jane = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();
    env.engine
        .create_account(CreateAccountInput::new("taken@example.com"))
        .await
        .unwrap();

    let err = env
        .engine
        .rename_account(jane.id, "taken@example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)));

    // the old entry is still authoritative
    let still_there = env
        .engine
        .get_account(AccountKey::Name("jane@example.com".to_string()), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_there.id, jane.id);
}

#[tokio::test]
async fn test_distribution_list_rename_updates_address_set() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("old.com"))
        .await
        .unwrap();
    env.engine
        .create_domain(CreateDomainInput::new("new.com"))
        .await
        .unwrap();
    let list = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("team@old.com"))
        .await
        .unwrap();
    assert!(env
        .engine
        .is_distribution_list_address("team@old.com")
        .await
        .unwrap());

    let renamed = env
        .engine
        .rename_distribution_list(list.id, "team@new.com")
        .await
        .unwrap();
    assert_eq!(renamed.id, list.id);
    assert!(env
        .engine
        .is_distribution_list_address("team@new.com")
        .await
        .unwrap());
    assert!(!env
        .engine
        .is_distribution_list_address("team@old.com")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_domain_rename_migrates_everything() {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("old.com"))
        .await
        .unwrap();
    env.engine
        .create_domain(CreateDomainInput::new("other.com"))
        .await
        .unwrap();

    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@old.com"))
        .await
        .unwrap();
    let account = env.engine.add_alias(&account, "jdoe@old.com").await.unwrap();
    env.engine
        .create_distribution_list(CreateDistributionListInput::new("team@old.com"))
        .await
        .unwrap();

    // a list in another domain referencing the migrating addresses
    let foreign = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("watchers@other.com"))
        .await
        .unwrap();
    env.engine
        .add_group_members(&foreign, &["jane@old.com"])
        .await
        .unwrap();

    common::seed_xmpp_component(env.store.inner(), "conference", "old.com").await;

    let old_domain = env
        .engine
        .get_domain(DomainKey::Name("old.com".to_string()), false)
        .await
        .unwrap()
        .unwrap();
    let renamed = env
        .engine
        .rename_domain(old_domain.id, "renamed.com")
        .await
        .unwrap();

    // the domain keeps its identifier
    assert_eq!(renamed.id, old_domain.id);
    assert_eq!(renamed.name, "renamed.com");
    assert!(env
        .engine
        .get_domain(DomainKey::Name("old.com".to_string()), false)
        .await
        .unwrap()
        .is_none());

    // hosted entries moved with their aliases rewritten
    let migrated = env
        .engine
        .get_account(AccountKey::Name("jane@renamed.com".to_string()), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(migrated.id, account.id);
    assert_eq!(
        migrated.attrs.get_all(names::A_MAIL_ALIAS),
        ["jdoe@renamed.com"]
    );
    assert!(env
        .engine
        .get_group(GroupKey::Name("team@renamed.com".to_string()), false)
        .await
        .unwrap()
        .is_some());

    // foreign references rewritten: list members and the component registry
    let foreign = env
        .engine
        .get_group(GroupKey::Id(foreign.id), false)
        .await
        .unwrap()
        .unwrap();
    assert!(foreign
        .attrs
        .contains_value(names::A_LIST_MEMBER, "jane@renamed.com"));

    let component = env
        .store
        .inner()
        .get_by_dn(&format!("cn=conference,cn=xmppcomponents,{}", common::BASE_DN))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        component.attrs.get(names::A_COMPONENT_DOMAIN),
        Some("renamed.com")
    );
}

#[tokio::test]
async fn test_domain_rename_resumes_at_recorded_phase() {
    let env = common::test_env().await;
    let old = env
        .engine
        .create_domain(CreateDomainInput::new("old.com"))
        .await
        .unwrap();
    env.engine
        .create_domain(CreateDomainInput::new("other.com"))
        .await
        .unwrap();

    // a previous attempt got as far as creating the destination and
    // migrating the hosted entries, then died before fixing foreign
    // references
    env.engine
        .create_domain(CreateDomainInput::new("renamed.com"))
        .await
        .unwrap();
    env.store
        .inner()
        .modify(
            &old.dn,
            vec![Modification::Replace(
                "provisDomainRenameInfo".to_string(),
                vec![r#"{"destination":"renamed.com","phase":"FixForeignDlMembers"}"#.to_string()],
            )],
        )
        .await
        .unwrap();
    // the marker was written behind the cache's back
    env.engine.flush_cache(provis_core::service::CacheKind::Domain);

    let foreign = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("watchers@other.com"))
        .await
        .unwrap();
    env.engine
        .add_group_members(&foreign, &["gone@old.com"])
        .await
        .unwrap();

    let renamed = env
        .engine
        .rename_domain(old.id, "renamed.com")
        .await
        .unwrap();

    // the rename completed from the recorded phase: foreign members were
    // rewritten, the source entry is gone, the id transferred
    assert_eq!(renamed.id, old.id);
    let foreign = env
        .engine
        .get_group(GroupKey::Id(foreign.id), false)
        .await
        .unwrap()
        .unwrap();
    assert!(foreign
        .attrs
        .contains_value(names::A_LIST_MEMBER, "gone@renamed.com"));
    assert!(env
        .engine
        .get_domain(DomainKey::Name("old.com".to_string()), false)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_domain_rename_to_existing_domain_is_rejected() {
    let env = common::test_env().await;
    let old = env
        .engine
        .create_domain(CreateDomainInput::new("old.com"))
        .await
        .unwrap();
    env.engine
        .create_domain(CreateDomainInput::new("taken.com"))
        .await
        .unwrap();

    let err = env
        .engine
        .rename_domain(old.id, "taken.com")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)));
}
