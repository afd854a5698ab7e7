use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mjf_adapters::{
    extract_build_token, parse_offer_list, ManfredClient, ManfredEndpoints, OfferSource, UpstreamError,
};
use mjf_core::{BuildToken, EndpointKind, FetchOutcome, SkillCategory};
use mjf_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, Store};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(name: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/manfred")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn landing_with(token: &str) -> String {
    fixture("landing.html").replace("Q7yN_2kVbHf0", token)
}

async fn client_for(server: &MockServer, seed: Option<&str>) -> (ManfredClient, Store) {
    let store = Store::in_memory().await.unwrap();
    if let Some(seed) = seed {
        store.save_token(&BuildToken::new(seed, Utc::now())).await.unwrap();
    }

    let http = Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
            ..Default::default()
        })
        .unwrap(),
    );

    let endpoints = ManfredEndpoints {
        list_url: format!("{}/api/v2/public/offers", server.uri()),
        detail_pattern: format!(
            "{}/_next/data/{{build_id}}/es/job-offers/{{offer_id}}/{{offer_slug}}.json",
            server.uri()
        ),
        landing_url: format!("{}/es/job-offers", server.uri()),
    };

    let client = ManfredClient::connect(http, store.clone(), endpoints).await.unwrap();
    (client, store)
}

async fn mount_landing(server: &MockServer, token: &str, expected_hits: u64) {
    Mock::given(method("GET"))
        .and(path("/es/job-offers"))
        .respond_with(ResponseTemplate::new(200).set_body_string(landing_with(token)))
        .expect(expected_hits)
        .mount(server)
        .await;
}

const DETAIL_PATH_T0: &str = "/_next/data/T0/es/job-offers/24187/senior-backend-engineer-rust.json";
const DETAIL_PATH_T1: &str = "/_next/data/T1/es/job-offers/24187/senior-backend-engineer-rust.json";

#[test]
fn fixtures_parse_into_domain_types() {
    let offers = parse_offer_list(fixture("offers.json").as_bytes()).unwrap();
    assert_eq!(offers.len(), 3);
    assert_eq!(offers[0].location.as_deref(), Some("Madrid, Barcelona"));
    assert_eq!(offers[2].slug, "job-24203");

    assert_eq!(extract_build_token(&fixture("landing.html")).as_deref(), Some("Q7yN_2kVbHf0"));

    let offer = mjf_adapters::detail_offer(fixture("detail.json").as_bytes()).unwrap();
    let detail = mjf_adapters::parse_offer_detail(&offer);
    assert_eq!(detail.skills_in(SkillCategory::Must).count(), 2);
    assert_eq!(detail.skills_in(SkillCategory::Extra).count(), 1);
    assert_eq!(detail.languages.len(), 2);
}

#[tokio::test]
async fn list_fetch_is_logged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/public/offers"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture("offers.json")))
        .mount(&server)
        .await;

    let (client, store) = client_for(&server, Some("T0")).await;
    assert_eq!(client.list_offers().await.unwrap().len(), 3);

    let log = store.recent_fetch_log(5).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].endpoint_kind, EndpointKind::List);
    assert_eq!(log[0].outcome, FetchOutcome::Success);
}

#[tokio::test]
async fn list_that_is_not_an_array_is_a_shape_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/public/offers"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"error":"maintenance"}"#))
        .mount(&server)
        .await;

    let (client, _store) = client_for(&server, Some("T0")).await;
    assert!(matches!(client.list_offers().await, Err(UpstreamError::Shape { .. })));
}

#[tokio::test]
async fn not_found_then_refresh_makes_exactly_two_detail_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH_T0))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH_T1))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture("detail.json")))
        .expect(1)
        .mount(&server)
        .await;
    mount_landing(&server, "T1", 1).await;

    let (client, store) = client_for(&server, Some("T0")).await;
    let detail = client
        .fetch_detail("24187", "senior-backend-engineer-rust")
        .await
        .unwrap();

    assert_eq!(detail.skills.len(), 4);
    assert_eq!(client.tokens().current().value, "T1");
    assert_eq!(store.load_token().await.unwrap().value, "T1");

    let outcomes: Vec<_> = store
        .recent_fetch_log(10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.endpoint_kind, e.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (EndpointKind::Detail, FetchOutcome::Success),
            (EndpointKind::Landing, FetchOutcome::Success),
            (EndpointKind::Detail, FetchOutcome::TokenStale),
        ]
    );
}

#[tokio::test]
async fn shape_mismatch_is_a_stale_signal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH_T0))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"notFound":true}"#))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH_T1))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture("detail.json")))
        .expect(1)
        .mount(&server)
        .await;
    mount_landing(&server, "T1", 1).await;

    let (client, _store) = client_for(&server, Some("T0")).await;
    assert!(client.fetch_detail("24187", "senior-backend-engineer-rust").await.is_ok());
}

#[tokio::test]
async fn second_stale_signal_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/_next/data/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;
    mount_landing(&server, "T1", 1).await;

    let (client, _store) = client_for(&server, Some("T0")).await;
    let err = client
        .fetch_detail("24187", "senior-backend-engineer-rust")
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::StaleAfterRefresh { ref offer_id } if offer_id == "24187"));
}

#[tokio::test]
async fn refresh_yielding_same_token_does_not_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH_T0))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    mount_landing(&server, "T0", 1).await;

    let (client, _store) = client_for(&server, Some("T0")).await;
    assert!(matches!(
        client.fetch_detail("24187", "senior-backend-engineer-rust").await,
        Err(UpstreamError::StaleAfterRefresh { .. })
    ));
}

#[tokio::test]
async fn empty_token_refreshes_before_first_use() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH_T1))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture("detail.json")))
        .expect(1)
        .mount(&server)
        .await;
    mount_landing(&server, "T1", 1).await;

    let (client, store) = client_for(&server, None).await;
    assert!(client.tokens().current().is_empty());

    client
        .fetch_detail("24187", "senior-backend-engineer-rust")
        .await
        .unwrap();
    assert_eq!(store.load_token().await.unwrap().value, "T1");
}

#[tokio::test]
async fn empty_token_refresh_counts_as_the_only_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH_T1))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    mount_landing(&server, "T1", 1).await;

    let (client, _store) = client_for(&server, None).await;
    assert!(matches!(
        client.fetch_detail("24187", "senior-backend-engineer-rust").await,
        Err(UpstreamError::StaleAfterRefresh { .. })
    ));
}

#[tokio::test]
async fn concurrent_stale_details_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/_next/data/T0/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/_next/data/T1/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture("detail.json")))
        .expect(6)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/es/job-offers"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(landing_with("T1"))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (client, _store) = client_for(&server, Some("T0")).await;
    let client = Arc::new(client);

    let handles = (0..6).map(|i| {
        let client = client.clone();
        tokio::spawn(async move { client.fetch_detail(&format!("{}", 30000 + i), "some-offer").await })
    });
    for result in futures::future::join_all(handles).await {
        assert!(result.unwrap().is_ok());
    }
    assert_eq!(client.tokens().refresh_count(), 1);
}

#[tokio::test]
async fn transport_failures_do_not_refresh_the_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH_T0))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;
    mount_landing(&server, "T1", 0).await;

    let (client, store) = client_for(&server, Some("T0")).await;
    assert!(matches!(
        client.fetch_detail("24187", "senior-backend-engineer-rust").await,
        Err(UpstreamError::Fetch(_))
    ));

    let log = store.recent_fetch_log(1).await.unwrap();
    assert_eq!(log[0].outcome, FetchOutcome::Exhausted);
    assert_eq!(log[0].attempts, 2);
    assert_eq!(log[0].status_code, Some(502));
}
