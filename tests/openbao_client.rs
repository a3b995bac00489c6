use connector_manager::openbao::OpenBaoClient;
use connector_manager::secrets::{self, OpenBaoSecretStore, SecretStore};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn write_kv_uses_v2_path() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/secret/data/connector-manager/dfsp-jws"))
        .and(header("X-Vault-Token", "root-token"))
        .and(body_json(json!({ "data": { "value": "secret" } })))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    let mut client = OpenBaoClient::new(&server.uri()).expect("client init should succeed");
    client.set_token("root-token".to_string());

    client
        .write_kv(
            "secret",
            "connector-manager/dfsp-jws",
            json!({ "value": "secret" }),
        )
        .await
        .expect("write_kv should succeed");
}

#[tokio::test]
async fn read_kv_returns_none_for_missing_secret() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/secret/data/connector-manager/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut client = OpenBaoClient::new(&server.uri()).expect("client init should succeed");
    client.set_token("root-token".to_string());

    let value = client
        .read_kv("secret", "connector-manager/missing")
        .await
        .expect("read_kv should succeed");
    assert!(value.is_none());
}

#[tokio::test]
async fn secret_store_logs_in_and_reads_under_prefix() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .and(body_json(json!({ "role_id": "role", "secret_id": "secret" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "auth": { "client_token": "approle-token", "lease_duration": 3600 }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/connector-manager/orchestrator-state"))
        .and(header("X-Vault-Token", "approle-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "data": { "version": 3 } }
        })))
        .mount(&server)
        .await;

    let client = OpenBaoClient::new(&server.uri()).expect("client init should succeed");
    let store = OpenBaoSecretStore::new(client, "secret", "/connector-manager/");
    store
        .login("role", "secret")
        .await
        .expect("login should succeed");

    let value = store
        .get_secret("orchestrator-state")
        .await
        .expect("read should succeed");
    assert_eq!(value, Some(json!({ "version": 3 })));
}

#[tokio::test]
async fn secret_store_delete_removes_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/secret/metadata/connector-manager/dfsp-client-key"))
        .and(header("X-Vault-Token", "root-token"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut client = OpenBaoClient::new(&server.uri()).expect("client init should succeed");
    client.set_token("root-token".to_string());
    let store = OpenBaoSecretStore::new(client, "secret", "connector-manager");

    store
        .delete_secret(secrets::DFSP_CLIENT_KEY)
        .await
        .expect("delete should succeed");
}

#[tokio::test]
async fn health_check_accepts_sealed_server() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = OpenBaoClient::new(&server.uri()).expect("client init should succeed");
    client
        .health_check()
        .await
        .expect("sealed server is reachable");
}
