//! Sign-in, sign-out and token propagation across tabs.

#![allow(clippy::unwrap_used)]

use std::num::NonZeroU32;

use geekwear_core::Email;
use geekwear_integration_tests::{TEST_PASSWORD, TestOrigin, heartbeat_all, product, settle};
use geekwear_sync::SyncConfig;
use geekwear_sync::auth::{AuthError, AuthPhase, OAuthProvider, ProviderError};

// ============================================================================
// Sign-in
// ============================================================================

#[tokio::test]
async fn test_follower_sign_in_is_established_by_leader() {
    let origin = TestOrigin::new();
    origin.account("link@hyrule.example", "Link", None);
    let tabs = origin.boot_tabs(3).await.unwrap();
    assert_eq!(tabs[0].auth().phase(), AuthPhase::Anonymous);
    assert_eq!(tabs[2].auth().phase(), AuthPhase::Idle);

    tabs[2]
        .auth()
        .sign_in_with_password("link@hyrule.example", TEST_PASSWORD)
        .await
        .unwrap();

    // Followers drop provider events; nothing happens until the leader acts.
    tabs[2].process_pending().await;
    assert!(tabs[2].auth().user().is_none());

    tabs[0].process_pending().await;
    let token = tabs[0].auth().token().unwrap();
    assert_eq!(tabs[0].auth().phase(), AuthPhase::Authenticated);

    settle(&tabs).await;
    for tab in &tabs {
        assert_eq!(tab.auth().token().as_deref(), Some(token.as_str()));
        assert_eq!(tab.auth().user().unwrap().greeting_name(), "Link");
    }
    assert_eq!(tabs[1].resync_count(), 1);
    assert_eq!(tabs[0].resync_count(), 0);
}

#[tokio::test]
async fn test_new_tab_restores_session_from_cookie() {
    let origin = TestOrigin::new();
    origin.account("zelda@hyrule.example", "Zelda", None);
    let tabs = origin.boot_tabs(1).await.unwrap();
    tabs[0]
        .auth()
        .sign_in_with_password("zelda@hyrule.example", TEST_PASSWORD)
        .await
        .unwrap();
    settle(&tabs).await;

    let late = origin.open();
    late.boot().await.unwrap();

    assert!(!late.is_leader());
    assert_eq!(late.auth().phase(), AuthPhase::Authenticated);
    assert_eq!(late.auth().token(), tabs[0].auth().token());
}

#[tokio::test]
async fn test_oauth_sign_in_propagates() {
    let origin = TestOrigin::new();
    let tabs = origin.boot_tabs(2).await.unwrap();

    let redirect = tabs[1].auth().sign_in_with_oauth(OAuthProvider::Discord).await.unwrap();
    assert_eq!(redirect.provider, OAuthProvider::Discord);

    origin
        .provider
        .complete_oauth_sign_in(
            OAuthProvider::Discord,
            &Email::parse("midna@twilight.example").unwrap(),
            Some("Midna"),
        )
        .unwrap();
    settle(&tabs).await;

    assert!(tabs.iter().all(|tab| tab.auth().state().is_authenticated()));

    let err = tabs[1].auth().sign_in_with_oauth(OAuthProvider::Github).await.unwrap_err();
    assert!(matches!(
        err,
        AuthError::Provider(ProviderError::OAuthUnsupported(OAuthProvider::Github))
    ));
}

#[tokio::test]
async fn test_privileged_email_is_admin_everywhere() {
    let mut config = SyncConfig::ephemeral();
    config.privileged_emails = vec!["Ganon@Gerudo.example".to_string()];
    let origin = TestOrigin::with_config(config);
    origin.account("ganon@gerudo.example", "Ganon", None);
    origin.account("impa@hyrule.example", "Impa", Some("ADMIN"));
    origin.account("epona@hyrule.example", "Epona", None);
    let tabs = origin.boot_tabs(2).await.unwrap();

    for (email, admin) in [
        ("ganon@gerudo.example", true),
        ("impa@hyrule.example", true),
        ("epona@hyrule.example", false),
    ] {
        tabs[1].auth().sign_in_with_password(email, TEST_PASSWORD).await.unwrap();
        settle(&tabs).await;
        assert_eq!(tabs[1].auth().is_admin(), admin, "{email}");
        assert_eq!(tabs[0].auth().is_admin(), admin, "{email}");
    }
}

#[tokio::test]
async fn test_sign_in_throttled_per_email() {
    let mut config = SyncConfig::ephemeral();
    config.sign_in_per_minute = NonZeroU32::new(2).unwrap();
    let origin = TestOrigin::with_config(config);
    origin.account("link@hyrule.example", "Link", None);
    let tabs = origin.boot_tabs(1).await.unwrap();
    let auth = tabs[0].auth();

    for _ in 0..2 {
        let err = auth
            .sign_in_with_password("link@hyrule.example", "wrong-password")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Provider(ProviderError::InvalidCredentials)));
    }
    let err = auth
        .sign_in_with_password("link@hyrule.example", TEST_PASSWORD)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Throttled { retry_after_secs } if retry_after_secs >= 1));
}

#[tokio::test]
async fn test_sign_up_rejects_short_password() {
    let origin = TestOrigin::new();
    let tabs = origin.boot_tabs(1).await.unwrap();

    let err = tabs[0]
        .auth()
        .sign_up("navi@forest.example", "hey", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::WeakPassword(_)));

    tabs[0]
        .auth()
        .sign_up("navi@forest.example", "hey-listen!", Some("Navi".to_string()))
        .await
        .unwrap();
    settle(&tabs).await;
    assert_eq!(tabs[0].auth().user().unwrap().greeting_name(), "Navi");
}

// ============================================================================
// Sign-out
// ============================================================================

#[tokio::test]
async fn test_sign_out_from_follower_clears_every_tab() {
    let origin = TestOrigin::new();
    origin.account("link@hyrule.example", "Link", None);
    let tabs = origin.boot_tabs(3).await.unwrap();
    tabs[0].cart().add_item(product("Pixel Hoodie", 45), 1, None).unwrap();
    tabs[1]
        .auth()
        .sign_in_with_password("link@hyrule.example", TEST_PASSWORD)
        .await
        .unwrap();
    settle(&tabs).await;
    assert!(tabs.iter().all(|tab| tab.auth().state().is_authenticated()));
    assert_eq!(tabs[2].cart().item_count(), 1);

    tabs[2].sign_out().await.unwrap();
    settle(&tabs).await;

    for tab in &tabs {
        assert_eq!(tab.auth().phase(), AuthPhase::Anonymous);
        assert!(tab.auth().token().is_none());
        assert!(tab.cart().snapshot().is_empty());
    }
}

#[tokio::test]
async fn test_sign_out_fails_cleanly_when_provider_offline() {
    let origin = TestOrigin::new();
    origin.account("link@hyrule.example", "Link", None);
    let tabs = origin.boot_tabs(1).await.unwrap();
    tabs[0]
        .auth()
        .sign_in_with_password("link@hyrule.example", TEST_PASSWORD)
        .await
        .unwrap();
    settle(&tabs).await;

    origin.provider.set_offline(true);
    let err = tabs[0].sign_out().await.unwrap_err();

    assert!(matches!(err, AuthError::Provider(ProviderError::Unavailable(_))));
    assert!(tabs[0].auth().state().is_authenticated());
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_session_survives_leader_crash() {
    let origin = TestOrigin::new();
    origin.account("link@hyrule.example", "Link", None);
    let mut tabs = origin.boot_tabs(3).await.unwrap();
    tabs[1]
        .auth()
        .sign_in_with_password("link@hyrule.example", TEST_PASSWORD)
        .await
        .unwrap();
    settle(&tabs).await;
    let user = tabs[1].auth().user().unwrap();

    drop(tabs.remove(0));
    origin.age_leader_lock();
    heartbeat_all(&tabs).await.unwrap();
    settle(&tabs).await;

    assert!(tabs[0].is_leader());
    for tab in &tabs {
        assert_eq!(tab.auth().phase(), AuthPhase::Authenticated);
        assert_eq!(tab.auth().user().unwrap().id, user.id);
    }
}
