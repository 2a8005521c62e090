//! Group membership engine integration tests

mod common;

use pretty_assertions::assert_eq;
use provis_core::directory::DirectoryStore;
use provis_core::domain::GroupKey;
use provis_core::service::account::CreateAccountInput;
use provis_core::service::dlist::CreateDistributionListInput;
use provis_core::service::domain::CreateDomainInput;

async fn env_with_domain() -> common::TestEnv {
    let env = common::test_env().await;
    env.engine
        .create_domain(CreateDomainInput::new("example.com"))
        .await
        .unwrap();
    env
}

#[tokio::test]
async fn test_direct_and_transitive_membership_with_via() {
    let env = env_with_domain().await;
    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();
    let staff = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("staff@example.com"))
        .await
        .unwrap();
    let everyone = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("everyone@example.com"))
        .await
        .unwrap();

    env.engine
        .add_group_members(&staff, &["jane@example.com"])
        .await
        .unwrap();
    env.engine
        .add_group_members(&everyone, &["staff@example.com"])
        .await
        .unwrap();

    let direct = env.engine.direct_groups(&account).await.unwrap();
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].id, staff.id);

    let (all, via) = env.engine.all_groups(&account, false).await.unwrap();
    let ids: Vec<_> = all.iter().map(|g| g.id).collect();
    assert_eq!(ids, vec![staff.id, everyone.id]);
    // everyone was discovered through staff
    assert_eq!(via.get(&everyone.id), Some(&staff.id));

    let (direct_only, _) = env.engine.all_groups(&account, true).await.unwrap();
    assert_eq!(direct_only.len(), 1);
}

#[tokio::test]
async fn test_cyclic_membership_terminates() {
    let env = env_with_domain().await;
    let a = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("a@example.com"))
        .await
        .unwrap();
    let b = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("b@example.com"))
        .await
        .unwrap();

    let a = env.engine.add_group_members(&a, &["b@example.com"]).await.unwrap();
    let b = env.engine.add_group_members(&b, &["a@example.com"]).await.unwrap();

    // a ∈ b and b ∈ a: the closure is exactly {a, b} from either start
    for (start, expected) in [(&a, [b.id, a.id]), (&b, [a.id, b.id])] {
        let (all, _via) = env.engine.all_groups(start, false).await.unwrap();
        let mut ids: Vec<_> = all.iter().map(|g| g.id).collect();
        ids.sort();
        let mut want = expected.to_vec();
        want.sort();
        assert_eq!(ids, want);
    }
}

#[tokio::test]
async fn test_membership_snapshot_is_cached_and_invalidated() {
    let env = env_with_domain().await;
    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();
    let staff = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("staff@example.com"))
        .await
        .unwrap();
    env.engine
        .add_group_members(&staff, &["jane@example.com"])
        .await
        .unwrap();

    let membership = env.engine.group_membership(&account, false).await.unwrap();
    assert!(membership.in_group(staff.id));

    // membership write invalidates the member's snapshot
    env.engine
        .remove_group_members(&staff, &["jane@example.com"])
        .await
        .unwrap();
    let refreshed = env.engine.group_membership(&account, false).await.unwrap();
    assert!(refreshed.is_empty());
}

#[tokio::test]
async fn test_admin_only_membership() {
    let env = env_with_domain().await;
    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();

    let mut admin_input = CreateDistributionListInput::new("admins@example.com");
    admin_input
        .attrs
        .set(provis_core::domain::names::A_IS_ADMIN_GROUP, "TRUE");
    let admins = env
        .engine
        .create_distribution_list(admin_input)
        .await
        .unwrap();
    let staff = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("staff@example.com"))
        .await
        .unwrap();

    env.engine
        .add_group_members(&admins, &["jane@example.com"])
        .await
        .unwrap();
    env.engine
        .add_group_members(&staff, &["jane@example.com"])
        .await
        .unwrap();

    let admin_membership = env.engine.group_membership(&account, true).await.unwrap();
    assert_eq!(admin_membership.len(), 1);
    assert!(admin_membership.in_group(admins.id));
}

#[tokio::test]
async fn test_cached_direct_ids_verified_lazily() {
    // a short-lived group cache forces the id list to be re-verified
    // against the directory
    let mut config = provis_core::config::Config::default();
    config.cache.group_max_age = std::time::Duration::from_millis(5);
    let env = common::test_env_with_config(config).await;
    env.engine
        .create_domain(CreateDomainInput::new("example.com"))
        .await
        .unwrap();

    let account = env
        .engine
        .create_account(CreateAccountInput::new("jane@example.com"))
        .await
        .unwrap();
    let staff = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("staff@example.com"))
        .await
        .unwrap();
    env.engine
        .add_group_members(&staff, &["jane@example.com"])
        .await
        .unwrap();

    assert_eq!(env.engine.direct_groups(&account).await.unwrap().len(), 1);

    // the group vanishes behind the engine's back; once the cached copy
    // ages out, the id list verification drops the dead id and rewrites
    // the cached list
    env.store.inner().delete(&staff.dn).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let direct = env.engine.direct_groups(&account).await.unwrap();
    assert!(direct.is_empty());
}

#[tokio::test]
async fn test_acl_group_cache_trims_members() {
    let env = env_with_domain().await;
    let staff = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("staff@example.com"))
        .await
        .unwrap();
    let parent = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("all@example.com"))
        .await
        .unwrap();
    env.engine
        .add_group_members(&staff, &["jane@example.com"])
        .await
        .unwrap();
    env.engine
        .add_group_members(&parent, &["staff@example.com"])
        .await
        .unwrap();

    let entry = env.engine.acl_group(staff.id).await.unwrap().unwrap();
    // the member list is trimmed off the cached copy
    assert!(entry
        .group
        .attrs
        .get_all(provis_core::domain::names::A_LIST_MEMBER)
        .is_empty());
    // but its upward membership was computed first
    assert!(entry.membership.in_group(parent.id));

    // a membership-affecting write clears the whole access-control cache
    let stats_before = env.engine.cache_stats().acl_groups;
    assert!(stats_before.size > 0);
    env.engine
        .add_group_members(&parent, &["other@example.com"])
        .await
        .unwrap();
    assert_eq!(env.engine.cache_stats().acl_groups.size, 0);
}

#[tokio::test]
async fn test_dl_address_set_tracks_lifecycle() {
    let env = env_with_domain().await;
    assert!(!env
        .engine
        .is_distribution_list_address("staff@example.com")
        .await
        .unwrap());

    let staff = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("staff@example.com"))
        .await
        .unwrap();
    assert!(env
        .engine
        .is_distribution_list_address("staff@example.com")
        .await
        .unwrap());

    let staff = env.engine.add_alias(&staff, "crew@example.com").await.unwrap();
    assert!(env
        .engine
        .is_distribution_list_address("crew@example.com")
        .await
        .unwrap());

    env.engine
        .delete_distribution_list(staff.id)
        .await
        .unwrap();
    assert!(!env
        .engine
        .is_distribution_list_address("staff@example.com")
        .await
        .unwrap());
    assert!(!env
        .engine
        .is_distribution_list_address("crew@example.com")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_group_resolution_by_name_and_id() {
    let env = env_with_domain().await;
    let staff = env
        .engine
        .create_distribution_list(CreateDistributionListInput::new("staff@example.com"))
        .await
        .unwrap();

    let by_name = env
        .engine
        .get_group(GroupKey::Name("STAFF@example.com".to_string()), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_name.id, staff.id);

    let by_id = env
        .engine
        .get_group(GroupKey::Id(staff.id), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_id.name, "staff@example.com");
}
