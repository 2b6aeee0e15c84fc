//! End-to-end authorization tests
//!
//! Tokens are signed with the RSA key in `tests/fixtures` and verified
//! against an in-memory JWKS, both directly through the auth gate and
//! through a dispatcher in front of the built-in services.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use toolgate::auth::{AuthGate, AuthPolicy, JwksCache, JwksRefresh, KeySource};
use toolgate::config::Config;
use toolgate::error::rpc_codes;
use toolgate::gateway::{CallContext, Catalog, Dispatcher, Gateway};
use toolgate::mount::{MountTable, MountTarget};
use toolgate::protocol::{JsonRpcMessage, JsonRpcRequest, methods};
use toolgate::services::{DELETE_SCOPE, ServiceKind};
use toolgate::{Error, Result};

const DOMAIN: &str = "tenant.example.com";
const AUDIENCE: &str = "http://localhost:8000/mcp";
const KID: &str = "test-key";

struct StaticKeys {
    fetches: AtomicUsize,
}

#[async_trait]
impl KeySource for StaticKeys {
    async fn fetch(&self, _jwks_uri: &str) -> Result<JwkSet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let n = include_str!("fixtures/test_rsa.n").trim();
        Ok(serde_json::from_value(json!({
            "keys": [{"kty": "RSA", "kid": KID, "use": "sig", "alg": "RS256", "n": n, "e": "AQAB"}]
        }))?)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn sign_with(kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(include_bytes!("fixtures/test_rsa.pem")).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

fn token(scope: &str) -> String {
    sign_with(
        KID,
        &json!({
            "iss": format!("https://{DOMAIN}/"),
            "aud": AUDIENCE,
            "sub": "client@clients",
            "exp": now() + 600,
            "scope": scope,
        }),
    )
}

fn keys() -> Arc<StaticKeys> {
    Arc::new(StaticKeys {
        fetches: AtomicUsize::new(0),
    })
}

fn gate() -> (AuthGate, Arc<StaticKeys>) {
    let keys = keys();
    let cache = JwksCache::new(Arc::clone(&keys) as Arc<dyn KeySource>, JwksRefresh::default());
    (AuthGate::new(Arc::new(cache)), keys)
}

fn policy() -> AuthPolicy {
    AuthPolicy::for_domain(DOMAIN, AUDIENCE)
}

fn bearer(token: &str) -> Option<String> {
    Some(format!("Bearer {token}"))
}

#[tokio::test]
async fn valid_token_yields_principal() {
    let (gate, keys) = gate();
    let principal = gate
        .authorize(
            bearer(&token("read:add admin:delete")).as_deref(),
            &policy().require("read:add"),
            &BTreeSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(principal.subject.as_deref(), Some("client@clients"));
    assert!(principal.has_scope(DELETE_SCOPE));

    // Keys are cached after the first verification
    gate.authorize(bearer(&token("read:add")).as_deref(), &policy(), &BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(keys.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_scopes_are_listed() {
    let (gate, _) = gate();
    let extra = BTreeSet::from([DELETE_SCOPE.to_string()]);
    let err = gate
        .authorize(
            bearer(&token("read:add")).as_deref(),
            &policy().require("write:add"),
            &extra,
        )
        .await
        .unwrap_err();
    match err {
        Error::InsufficientScope { missing } => {
            assert_eq!(missing, vec![DELETE_SCOPE.to_string(), "write:add".to_string()]);
        }
        other => panic!("expected insufficient scope, got {other:?}"),
    }
}

#[tokio::test]
async fn rejects_bad_tokens() {
    let (gate, _) = gate();
    let none = BTreeSet::new();

    let wrong_audience = sign_with(
        KID,
        &json!({"iss": format!("https://{DOMAIN}/"), "aud": "someone-else",
                "exp": now() + 600, "scope": "read:add"}),
    );
    let expired = sign_with(
        KID,
        &json!({"iss": format!("https://{DOMAIN}/"), "aud": AUDIENCE,
                "exp": now() - 3600, "scope": "read:add"}),
    );
    let wrong_issuer = sign_with(
        KID,
        &json!({"iss": "https://elsewhere.example.com/", "aud": AUDIENCE,
                "exp": now() + 600, "scope": "read:add"}),
    );

    for (label, credential) in [
        ("no header", None),
        ("not bearer", Some("Basic abc".to_string())),
        ("garbage", bearer("not-a-jwt")),
        ("no scopes", bearer(&token(""))),
        ("wrong audience", bearer(&wrong_audience)),
        ("expired", bearer(&expired)),
        ("wrong issuer", bearer(&wrong_issuer)),
    ] {
        let err = gate
            .authorize(credential.as_deref(), &policy(), &none)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)), "{label}: {err:?}");
    }
}

#[tokio::test]
async fn unknown_key_id_refetches_at_most_once() {
    let (gate, keys) = gate();
    let claims = json!({"iss": format!("https://{DOMAIN}/"), "aud": AUDIENCE,
                        "exp": now() + 600, "scope": "read:add"});
    let rotated = sign_with("rotated-key", &claims);

    for _ in 0..3 {
        let err = gate
            .authorize(bearer(&rotated).as_deref(), &policy(), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));
    }
    // First lookup fetches; the cooldown suppresses further refetches
    assert_eq!(keys.fetches.load(Ordering::SeqCst), 1);
}

async fn call(dispatcher: &Dispatcher, credential: Option<String>, name: &str, args: Value) -> Value {
    let request = JsonRpcRequest::new(
        1_i64,
        methods::TOOLS_CALL,
        Some(json!({"name": name, "arguments": args})),
    );
    let ctx = CallContext {
        credential,
        ..Default::default()
    };
    let response = dispatcher
        .handle(JsonRpcMessage::Request(request), ctx)
        .await
        .unwrap();
    serde_json::to_value(response).unwrap()
}

/// `auth` section for the test tenant, followed by `rest`
fn config_with_auth(rest: &str) -> Config {
    Config::from_yaml(&format!(
        "auth:\n  enabled: true\n  domain: {DOMAIN}\n  audience: \"{AUDIENCE}\"\n{rest}"
    ))
    .unwrap()
}

/// `add` needs `read:add`, `deleter` any valid token (plus `admin:delete`
/// for `delete_item`), `subtract` nothing
async fn protected_gateway() -> Gateway {
    let config = config_with_auth(
        "services:\n  add:\n    required_scopes: [\"read:add\"]\n  deleter: {}\n  subtract:\n    auth: false\n",
    );
    Gateway::with_key_source(config, keys()).await.unwrap()
}

#[tokio::test]
async fn per_service_policies_apply_at_call_time() {
    let gateway = protected_gateway().await;
    let d = gateway.dispatcher();
    let add_only = bearer(&token("read:add"));
    let delete_only = bearer(&token(DELETE_SCOPE));
    let both = bearer(&token(&format!("read:add {DELETE_SCOPE}")));

    // Open service: no credential needed
    let r = call(d, None, "subtract_subtract", json!({"a": 5, "b": 3})).await;
    assert_eq!(r["result"]["content"][0]["text"], "2");

    // Protected service: no credential
    let r = call(d, None, "add_add", json!({"a": 1, "b": 2})).await;
    assert_eq!(r["error"]["code"], rpc_codes::INVALID_TOKEN);
    assert_eq!(r["error"]["data"]["kind"], "invalid_token");

    let r = call(d, add_only.clone(), "add_add", json!({"a": 1, "b": 2})).await;
    assert_eq!(r["result"]["content"][0]["text"], "3");

    // A deleter token does not open `add`
    let r = call(d, delete_only.clone(), "add_add", json!({"a": 1, "b": 2})).await;
    assert_eq!(r["error"]["code"], rpc_codes::INSUFFICIENT_SCOPE);
    assert_eq!(r["error"]["data"]["missing"], json!(["read:add"]));

    // ...and an add token does not open `delete_item`
    let r = call(d, add_only, "deleter_delete_item", json!({"item_id": "9"})).await;
    assert_eq!(r["error"]["code"], rpc_codes::INSUFFICIENT_SCOPE);
    assert_eq!(r["error"]["data"]["missing"], json!([DELETE_SCOPE]));

    let r = call(d, delete_only, "deleter_delete_item", json!({"item_id": "9"})).await;
    assert_eq!(r["result"]["content"][0]["text"], "Item 9 deleted");

    let r = call(d, both.clone(), "add_add", json!({"a": 4, "b": 4})).await;
    assert_eq!(r["result"]["content"][0]["text"], "8");
    let r = call(d, both, "deleter_delete_item", json!({"item_id": "10"})).await;
    assert_eq!(r["result"]["content"][0]["text"], "Item 10 deleted");
}

#[tokio::test]
async fn standalone_deleter_accepts_an_admin_token() {
    let gateway =
        Gateway::standalone_with_key_source(ServiceKind::Deleter, &config_with_auth(""), keys())
            .unwrap();
    let d = gateway.dispatcher();

    let r = call(d, bearer(&token(DELETE_SCOPE)), "delete_item", json!({"item_id": "3"})).await;
    assert_eq!(r["result"]["content"][0]["text"], "Item 3 deleted");

    let r = call(d, None, "delete_item", json!({"item_id": "3"})).await;
    assert_eq!(r["error"]["code"], rpc_codes::INVALID_TOKEN);

    let r = call(d, bearer(&token("read:add")), "delete_item", json!({"item_id": "3"})).await;
    assert_eq!(r["error"]["code"], rpc_codes::INSUFFICIENT_SCOPE);
}

#[tokio::test]
async fn standalone_service_takes_its_scopes_from_config() {
    let config = config_with_auth("services:\n  add:\n    required_scopes: [\"read:add\"]\n");
    let gateway = Gateway::standalone_with_key_source(ServiceKind::Add, &config, keys()).unwrap();
    let d = gateway.dispatcher();

    let r = call(d, bearer(&token(DELETE_SCOPE)), "add", json!({"a": 1, "b": 1})).await;
    assert_eq!(r["error"]["data"]["missing"], json!(["read:add"]));
    let r = call(d, bearer(&token("read:add")), "add", json!({"a": 1, "b": 1})).await;
    assert_eq!(r["result"]["content"][0]["text"], "2");
}

#[tokio::test]
async fn policy_changes_take_effect_without_remounting() {
    let table = MountTable::new("_");
    let add = ServiceKind::Add.build().unwrap();
    table.mount("add", MountTarget::Local(Arc::clone(&add))).unwrap();
    let (gate, _) = gate();
    let d = Dispatcher::new(Catalog::Mounted(Arc::new(table))).with_auth(gate);

    let r = call(&d, None, "add_add", json!({"a": 1, "b": 1})).await;
    assert!(r.get("error").is_none());

    add.set_policy(Some(policy().require("read:add")));
    let r = call(&d, None, "add_add", json!({"a": 1, "b": 1})).await;
    assert_eq!(r["error"]["data"]["kind"], "invalid_token");
    let r = call(&d, bearer(&token("read:add")), "add_add", json!({"a": 1, "b": 1})).await;
    assert_eq!(r["result"]["content"][0]["text"], "2");
}
