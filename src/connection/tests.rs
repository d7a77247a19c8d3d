use super::*;
use crate::egress::DEFAULT_TIMEOUT;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mockito::{Matcher, Server, ServerGuard};
use url::Url;

const TOKEN_PATH: &str = "/oauth2/v1/tokens/bearer";
const REVOKE_PATH: &str = "/v2/oauth2/tokens/revoke";

struct Harness {
    service: ConnectionService,
    store: Arc<ConnectionStore>,
    directory: Arc<CompanyDirectory>,
    gateway: Arc<EgressGateway>,
    codec: SecretCodec,
}

fn encryption_key() -> String {
    BASE64.encode([9u8; 32])
}

fn config(server: &ServerGuard) -> IntegrationConfig {
    config_for(&server.url())
}

fn config_for(base: &str) -> IntegrationConfig {
    let mut config = IntegrationConfig::default();
    config.oauth.client_id = Some("client-id".to_string());
    config.oauth.client_secret = Some("client-secret".to_string());
    config.oauth.redirect_uri = "http://localhost:3000/callback".to_string();
    config.security.encryption_key = Some(encryption_key());
    config.security.state_signing_secret = Some("state-secret".to_string());
    config.platform.token_url = Some(format!("{}{}", base, TOKEN_PATH));
    config.platform.revocation_url = Some(format!("{}{}", base, REVOKE_PATH));
    config.platform.api_base_url = Some(base.to_string());
    config
}

fn harness_with(server: &ServerGuard, config: IntegrationConfig) -> Harness {
    let store = Arc::new(ConnectionStore::new(":memory:").unwrap());
    let directory = Arc::new(CompanyDirectory::new(":memory:").unwrap());
    let gateway =
        Arc::new(EgressGateway::new(&server.url(), ["127.0.0.1"], DEFAULT_TIMEOUT).unwrap());
    let service = ConnectionService::from_config(
        &config,
        Arc::clone(&store),
        Arc::clone(&directory),
        Arc::clone(&gateway),
    )
    .unwrap();

    Harness {
        service,
        store,
        directory,
        gateway,
        codec: SecretCodec::from_key(Some(&encryption_key())).unwrap(),
    }
}

fn harness(server: &ServerGuard) -> Harness {
    harness_with(server, config(server))
}

fn state_from(url: &str) -> String {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

fn seed(h: &Harness, tenant_id: i64, expires_at: DateTime<Utc>) {
    h.store
        .upsert(&TenantConnection {
            tenant_id,
            realm_id: h.codec.encrypt("realm-1").unwrap(),
            access_token: h.codec.encrypt("access-1").unwrap(),
            refresh_token: h.codec.encrypt("refresh-1").unwrap(),
            expires_at,
        })
        .unwrap();
}

async fn mock_exchange(server: &mut ServerGuard, hits: usize) -> mockito::Mock {
    server
        .mock("POST", TOKEN_PATH)
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "auth-code".into()),
            Matcher::UrlEncoded("redirect_uri".into(), "http://localhost:3000/callback".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"access_token":"access-1","refresh_token":"refresh-1","expires_in":3600}"#,
        )
        .expect(hits)
        .create_async()
        .await
}

fn callback_params(state: String) -> CallbackParams {
    CallbackParams {
        code: Some("auth-code".to_string()),
        realm_id: Some("realm-1".to_string()),
        state: Some(state),
        error: None,
    }
}

#[test]
fn test_missing_encryption_key_is_fatal() {
    let mut config = config_for("http://127.0.0.1:9");
    config.security.encryption_key = None;

    let store = Arc::new(ConnectionStore::new(":memory:").unwrap());
    let directory = Arc::new(CompanyDirectory::new(":memory:").unwrap());
    let gateway =
        Arc::new(EgressGateway::new("http://127.0.0.1:9", ["127.0.0.1"], DEFAULT_TIMEOUT).unwrap());

    let result = ConnectionService::from_config(&config, store, directory, gateway);
    assert!(matches!(result, Err(IntegrationError::MissingKey)));
}

#[tokio::test]
async fn test_authorize_builds_signed_provider_url() {
    let server = Server::new_async().await;
    let h = harness(&server);

    let url = h.service.authorize(&CompanyRef::Inferred(12)).unwrap();
    let parsed = Url::parse(&url).unwrap();
    let query: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();

    assert_eq!(parsed.host_str(), Some("appcenter.intuit.com"));
    assert_eq!(query["client_id"], "client-id");
    assert_eq!(query["response_type"], "code");
    assert_eq!(query["scope"], "com.intuit.quickbooks.accounting");
    assert_eq!(query["redirect_uri"], "http://localhost:3000/callback");

    let payload = StateCodec::new(b"state-secret", 600)
        .decode(&query["state"])
        .unwrap();
    assert_eq!(payload.tenant_id, 12);
}

#[tokio::test]
async fn test_authorize_without_company_fails() {
    let server = Server::new_async().await;
    let h = harness(&server);

    assert!(matches!(
        h.service.authorize(&CompanyRef::Missing),
        Err(IntegrationError::TenantResolution(_))
    ));
}

#[tokio::test]
async fn test_authorize_uses_canonical_tenant() {
    let server = Server::new_async().await;
    let h = harness(&server);
    h.directory.set_alias(5, 50).unwrap();

    let url = h.service.authorize(&CompanyRef::Inferred(5)).unwrap();
    let payload = StateCodec::new(b"state-secret", 600)
        .decode(&state_from(&url))
        .unwrap();
    assert_eq!(payload.tenant_id, 50);
}

#[tokio::test]
async fn test_callback_stores_encrypted_connection() {
    let mut server = Server::new_async().await;
    let mock = mock_exchange(&mut server, 1).await;
    let h = harness(&server);

    let url = h.service.authorize(&CompanyRef::Inferred(12)).unwrap();
    let tenant_id = h
        .service
        .callback(callback_params(state_from(&url)))
        .await
        .unwrap();
    assert_eq!(tenant_id, 12);

    let row = h.store.get(12).unwrap().unwrap();
    assert_ne!(row.realm_id, "realm-1");
    assert_ne!(row.refresh_token, "refresh-1");
    assert_eq!(h.codec.decrypt(&row.realm_id).unwrap().as_str(), "realm-1");
    assert_eq!(h.codec.decrypt(&row.access_token).unwrap().as_str(), "access-1");
    assert!(row.expires_at > Utc::now() + Duration::minutes(59));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_replayed_state_rejected() {
    let mut server = Server::new_async().await;
    let mock = mock_exchange(&mut server, 1).await;
    let h = harness(&server);

    let url = h.service.authorize(&CompanyRef::Inferred(12)).unwrap();
    let state = state_from(&url);

    h.service
        .callback(callback_params(state.clone()))
        .await
        .unwrap();
    let replay = h.service.callback(callback_params(state)).await;

    assert!(matches!(replay, Err(IntegrationError::StateReplayed)));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_forged_state_rejected_before_exchange() {
    let mut server = Server::new_async().await;
    let mock = mock_exchange(&mut server, 0).await;
    let h = harness(&server);

    let forged = StateCodec::new(b"attacker-secret", 600)
        .encode(&OAuthStatePayload::new(12))
        .unwrap();
    let result = h.service.callback(callback_params(forged)).await;

    assert!(matches!(result, Err(IntegrationError::StateVerification)));
    assert!(h.store.get(12).unwrap().is_none());
    assert_eq!(h.gateway.dispatched(), 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_provider_error_and_missing_parameters() {
    let server = Server::new_async().await;
    let h = harness(&server);

    let denied = h
        .service
        .callback(CallbackParams {
            error: Some("access_denied".to_string()),
            ..Default::default()
        })
        .await;
    assert!(matches!(denied, Err(IntegrationError::AuthorizationDenied(_))));

    let missing = h
        .service
        .callback(CallbackParams {
            code: Some("auth-code".to_string()),
            state: Some("x.y".to_string()),
            ..Default::default()
        })
        .await;
    assert!(matches!(
        missing,
        Err(IntegrationError::MissingCallbackParameter("realmId"))
    ));
    assert_eq!(h.gateway.dispatched(), 0);
}

#[tokio::test]
async fn test_failed_exchange_stores_nothing() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", TOKEN_PATH)
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;
    let h = harness(&server);

    let url = h.service.authorize(&CompanyRef::Inferred(12)).unwrap();
    let result = h.service.callback(callback_params(state_from(&url))).await;

    match result {
        Err(IntegrationError::ExchangeFailed(reason)) => assert_eq!(reason, "invalid_grant"),
        other => panic!("expected ExchangeFailed, got {:?}", other),
    }
    assert!(h.store.get(12).unwrap().is_none());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let mut server = Server::new_async().await;
    let revoke = server
        .mock("POST", REVOKE_PATH)
        .match_body(Matcher::Json(serde_json::json!({ "token": "refresh-1" })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let h = harness(&server);
    seed(&h, 3, Utc::now() + Duration::hours(1));

    let first = h.service.disconnect(&CompanyRef::Inferred(3)).await.unwrap();
    assert_eq!(
        first,
        DisconnectOutcome {
            tenant_id: 3,
            removed: true,
            revoked: true
        }
    );
    assert!(h.store.get(3).unwrap().is_none());

    let second = h.service.disconnect(&CompanyRef::Inferred(3)).await.unwrap();
    assert!(!second.removed);
    assert!(!second.revoked);
    revoke.assert_async().await;
}

#[tokio::test]
async fn test_disconnect_survives_revocation_failure() {
    let mut server = Server::new_async().await;
    let revoke = server
        .mock("POST", REVOKE_PATH)
        .with_status(503)
        .expect(1)
        .create_async()
        .await;
    let h = harness(&server);
    seed(&h, 4, Utc::now() + Duration::hours(1));

    let outcome = h.service.disconnect(&CompanyRef::Explicit(4)).await.unwrap();
    assert!(outcome.removed);
    assert!(!outcome.revoked);
    assert!(h.store.get(4).unwrap().is_none());
    revoke.assert_async().await;
}

#[tokio::test]
async fn test_status_reports_connection() {
    let server = Server::new_async().await;
    let h = harness(&server);

    let none = h.service.status(&CompanyRef::Inferred(6)).await.unwrap();
    assert_eq!(none, ConnectionStatus::disconnected());

    let expires_at = Utc::now() + Duration::hours(1);
    seed(&h, 6, expires_at);
    let status = h.service.status(&CompanyRef::Inferred(6)).await.unwrap();
    assert!(status.connected);
    assert_eq!(status.is_expired, Some(false));
    assert_eq!(status.expires_at, Some(expires_at));
    assert_eq!(h.gateway.dispatched(), 0);
}

#[tokio::test]
async fn test_status_surfaces_refresh_failure() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", TOKEN_PATH)
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;
    let h = harness(&server);
    seed(&h, 7, Utc::now() - Duration::minutes(5));

    let result = h.service.status(&CompanyRef::Inferred(7)).await;
    assert!(matches!(result, Err(IntegrationError::RefreshFailed { .. })));
    assert!(h.store.get(7).unwrap().is_some());
}

#[tokio::test]
async fn test_access_requires_connection() {
    let server = Server::new_async().await;
    let h = harness(&server);

    assert!(matches!(
        h.service.access(&CompanyRef::Inferred(8)).await,
        Err(IntegrationError::NotConnected(8))
    ));
}

#[tokio::test]
async fn test_platform_get_uses_bearer_and_minor_version() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v3/company/realm-1/companyinfo/realm-1")
        .match_query(Matcher::UrlEncoded("minorversion".into(), "75".into()))
        .match_header("authorization", "Bearer access-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"CompanyInfo":{"CompanyName":"Acme"}}"#)
        .expect(1)
        .create_async()
        .await;
    let h = harness(&server);
    seed(&h, 9, Utc::now() + Duration::hours(1));

    let body = h
        .service
        .platform_get(&CompanyRef::Inferred(9), "/companyinfo/realm-1")
        .await
        .unwrap();
    assert_eq!(body["CompanyInfo"]["CompanyName"], "Acme");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_platform_get_maps_error_status() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/v3/company/realm-1/preferences")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;
    let h = harness(&server);
    seed(&h, 9, Utc::now() + Duration::hours(1));

    let result = h
        .service
        .platform_get(&CompanyRef::Inferred(9), "preferences")
        .await;
    assert!(matches!(result, Err(IntegrationError::Platform { status: 500 })));
}
