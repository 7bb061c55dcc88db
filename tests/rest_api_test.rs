// ABOUTME: Integration tests for the REST client against a mock HTTP server
// ABOUTME: Checks request shape and the mapping of HTTP failures to store errors

use seafarm_store::row::row_from_value;
use seafarm_store::{Query, Row, StoreError};
use seafarm_sync::supabase::RestClient;
use serde_json::json;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn row(value: serde_json::Value) -> Row {
    row_from_value(value).unwrap()
}

fn client(server: &MockServer) -> RestClient {
    let url = Url::parse(&server.uri()).unwrap();
    RestClient::new(&url, "anon-key", "public", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn select_sends_filters_order_and_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/modules"))
        .and(query_param("select", "*"))
        .and(query_param("site_id", "eq.s1"))
        .and(query_param("order", "name.asc"))
        .and(query_param("limit", "10"))
        .and(header("apikey", "anon-key"))
        .and(header("Authorization", "Bearer anon-key"))
        .and(header("Accept-Profile", "public"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "m1", "site_id": "s1", "name": "A"},
            {"id": "m2", "site_id": "s1", "name": "B"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let query = Query::all().eq("site_id", "s1").order_by("name", true).limit(10);
    let rows = client(&server).select("modules", &query).await.unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!("m1"));
}

#[tokio::test]
async fn insert_returns_stored_representation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/sites"))
        .and(header("Prefer", "return=representation"))
        .and(body_json(json!({"id": "s1", "name": "X"})))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!([{"id": "s1", "name": "X", "created_at": "2026-01-01"}])),
        )
        .mount(&server)
        .await;

    let stored = client(&server)
        .insert("sites", row(json!({"id": "s1", "name": "X"})))
        .await
        .unwrap();

    assert_eq!(stored["created_at"], json!("2026-01-01"));
}

#[tokio::test]
async fn duplicate_key_maps_to_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/sites"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .insert("sites", row(json!({"id": "s1"})))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        StoreError::Conflict {
            table: "sites".into(),
            id: "s1".into()
        }
    );
}

#[tokio::test]
async fn rejected_key_maps_to_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"message": "Invalid API key"})),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .select("sites", &Query::all())
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Unauthorized(ref m) if m.contains("Invalid API key")));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn update_matching_no_rows_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/sites"))
        .and(query_param("id", "eq.missing"))
        .and(header("Content-Profile", "public"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let err = client(&server)
        .update("sites", "missing", row(json!({"name": "Y"})))
        .await
        .unwrap_err();

    assert!(err.is_not_found());
}

#[tokio::test]
async fn delete_of_missing_row_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/rest/v1/sites"))
        .and(query_param("id", "eq.nonexistent"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    client(&server).delete("sites", "nonexistent").await.unwrap();
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .mount(&server)
        .await;

    let err = client(&server).delete("sites", "s1").await.unwrap_err();

    assert_eq!(
        err,
        StoreError::Remote {
            status: 503,
            message: "Service Unavailable".into()
        }
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn bad_request_maps_to_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "message": "column sites.nope does not exist"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .select("sites", &Query::all().eq("nope", 1))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Malformed(ref m) if m.contains("does not exist")));
}

#[tokio::test]
async fn refused_connection_is_connectivity() {
    let url = Url::parse("http://127.0.0.1:1").unwrap();
    let client = RestClient::new(&url, "anon-key", "public", Duration::from_secs(5)).unwrap();

    let err = client.select("sites", &Query::all()).await.unwrap_err();

    assert!(matches!(err, StoreError::Connectivity(_)));
    assert!(!err.is_ambiguous());
}
