#![allow(clippy::unwrap_used)]
// RouterOS REST client against a wiremock router.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hotspot_routeros::{
    AddressEntrySpec, Change, RestConfig, RestRouter, RestTransport, RouterApi, RouterError,
    UserSpec,
};

async fn setup() -> (MockServer, RestRouter) {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uptime": "1d"})))
        .mount(&server)
        .await;

    let transport = RestTransport::new(&RestConfig {
        base_url: server.uri(),
        username: "api".into(),
        password: "secret".into(),
        pool_size: 2,
        command_timeout: Duration::from_secs(2),
        accept_invalid_certs: false,
    })
    .unwrap();
    (server, RestRouter::new(transport))
}

fn user_spec() -> UserSpec {
    UserSpec {
        name: "081234567890".into(),
        password: "123456".into(),
        profile: "active".into(),
        server: None,
        comment: "user=081234567890|uid=u1|role=USER|state=ACTIVE".into(),
        limit_bytes_total: Some(1_073_741_824),
        session_timeout_secs: None,
        force_profile: false,
        replaceable_profiles: vec!["active".into()],
    }
}

#[tokio::test]
async fn snapshot_hosts_parses_router_output() {
    let (server, router) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/ip/hotspot/host"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                ".id": "*A",
                "mac-address": "AA:BB:CC:DD:EE:FF",
                "address": "10.5.50.10",
                "authorized": "true",
                "bypassed": "false",
                "uptime": "5m10s",
                "bytes-in": "100",
                "bytes-out": "50"
            },
            { ".id": "*B", "mac-address": "not-a-mac" }
        ])))
        .mount(&server)
        .await;

    let hosts = router.snapshot_hosts().await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].uptime_secs, 310);
    assert_eq!(hosts[0].bytes_total(), 150);
    assert!(hosts[0].authorized);
}

#[tokio::test]
async fn upsert_user_creates_when_missing() {
    let (server, router) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/ip/hotspot/user"))
        .and(query_param("name", "081234567890"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/rest/ip/hotspot/user"))
        .and(body_partial_json(json!({
            "name": "081234567890",
            "profile": "active",
            "limit-bytes-total": "1073741824"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({".id": "*1"})))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(router.upsert_user(&user_spec()).await.unwrap(), Change::Created);
}

#[tokio::test]
async fn upsert_user_patches_only_the_difference() {
    let (server, router) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/ip/hotspot/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            ".id": "*7",
            "name": "081234567890",
            "password": "123456",
            "profile": "habis",
            "comment": "user=081234567890|uid=u1|role=USER|state=ACTIVE",
            "limit-bytes-total": "1073741824"
        }])))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/ip/hotspot/user/*7"))
        .and(body_partial_json(json!({"profile": "active"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut spec = user_spec();
    spec.replaceable_profiles.push("habis".into());
    assert_eq!(router.upsert_user(&spec).await.unwrap(), Change::Updated);
}

#[tokio::test]
async fn remove_entry_absent_when_list_has_no_match() {
    let (server, router) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/ip/firewall/address-list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    assert_eq!(
        router.remove_entry("10.5.50.10", "blocked").await.unwrap(),
        Change::Absent
    );
}

#[tokio::test]
async fn router_error_body_is_surfaced() {
    let (server, router) = setup().await;

    Mock::given(method("GET"))
        .and(path("/rest/ip/firewall/address-list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/rest/ip/firewall/address-list"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": 400,
            "message": "Bad Request",
            "detail": "invalid value for argument address"
        })))
        .mount(&server)
        .await;

    let err = router
        .upsert_entry(&AddressEntrySpec {
            list: "active".into(),
            address: "bogus".into(),
            comment: String::new(),
            timeout: None,
        })
        .await
        .unwrap_err();

    match err {
        RouterError::Command { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("invalid value"));
        }
        other => panic!("expected Command error, got {other:?}"),
    }
}

#[tokio::test]
async fn failing_health_check_means_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/system/resource"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let router = RestRouter::new(
        RestTransport::new(&RestConfig {
            base_url: server.uri(),
            username: "api".into(),
            password: "secret".into(),
            pool_size: 1,
            command_timeout: Duration::from_secs(2),
            accept_invalid_certs: false,
        })
        .unwrap(),
    );

    let err = router.snapshot_leases().await.unwrap_err();
    assert!(err.is_unreachable(), "got {err:?}");
}
