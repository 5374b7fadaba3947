//! POST/DELETE churn behaviour against a mock API server.

use reqwest::Url;
use tokio::sync::watch;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kubeload::client::ApiClient;
use kubeload::config::{LoadProfileSpec, PostDelSpec, RequestEntry};
use kubeload::scheduler::schedule;

fn churn_spec(total: usize, delete_ratio: f64, client: usize) -> LoadProfileSpec {
    LoadProfileSpec {
        rate: 0.0,
        total,
        conns: 1,
        client,
        content_type: Default::default(),
        disable_http2: false,
        max_retries: 0,
        requests: vec![RequestEntry {
            shares: 1,
            post_del: Some(PostDelSpec {
                version: "v1".to_string(),
                resource: "configmaps".to_string(),
                namespace: "bench".to_string(),
                delete_ratio,
                ..PostDelSpec::default()
            }),
            ..RequestEntry::default()
        }],
    }
}

#[tokio::test]
async fn test_churn_deletes_only_created_names() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/api/v1/namespaces/bench/configmaps$"))
        .respond_with(ResponseTemplate::new(201).set_body_bytes(b"{}".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/api/v1/namespaces/bench/configmaps/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{}".to_vec()))
        .mount(&server)
        .await;

    // One worker: concurrent workers may legitimately race to DELETE the
    // same cache head, which would confuse the strict replay below.
    let spec = churn_spec(200, 0.5, 1);
    let conn = ApiClient::new(Url::parse(&server.uri()).unwrap(), reqwest::Client::new());
    let (_tx, cancel) = watch::channel(false);
    let result = schedule(&spec, vec![conn], cancel).await.unwrap();

    assert!(result.stats.errors.is_empty());

    // Replay the request log: every DELETE must target a name created by an
    // earlier POST, and each name is deleted at most once.
    let mut live: Vec<String> = Vec::new();
    let mut posts = 0usize;
    let mut deletes = 0usize;
    for request in server.received_requests().await.unwrap() {
        match request.method.as_str() {
            "POST" => {
                let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
                let name = body["metadata"]["name"].as_str().unwrap().to_string();
                assert!(name.starts_with("bench-"), "unexpected name {}", name);
                live.push(name);
                posts += 1;
            }
            "DELETE" => {
                let name = request
                    .url
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .unwrap()
                    .to_string();
                let idx = live
                    .iter()
                    .position(|n| n == &name)
                    .unwrap_or_else(|| panic!("DELETE of never-created or re-deleted {}", name));
                live.remove(idx);
                deletes += 1;
            }
            other => panic!("unexpected method {}", other),
        }
    }

    assert_eq!(posts + deletes, 200);
    assert_eq!(live.len(), posts - deletes);

    // At ratio 0.5 the two sides stay roughly balanced; the cache-empty
    // fallback converts some early DELETE draws into POSTs, so allow drift.
    assert!(
        deletes >= 40 && deletes <= 120,
        "deletes {} drifted far from the configured ratio",
        deletes
    );
}

#[tokio::test]
async fn test_churn_ratio_zero_never_deletes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_bytes(b"{}".to_vec()))
        .mount(&server)
        .await;

    let spec = churn_spec(50, 0.0, 2);
    let conn = ApiClient::new(Url::parse(&server.uri()).unwrap(), reqwest::Client::new());
    let (_tx, cancel) = watch::channel(false);
    let result = schedule(&spec, vec![conn], cancel).await.unwrap();

    assert!(result.stats.errors.is_empty());
    for request in server.received_requests().await.unwrap() {
        assert_eq!(request.method.as_str(), "POST");
    }

    // All POSTs share one latency bucket.
    assert_eq!(result.stats.latencies_by_url.len(), 1);
    let key = result.stats.latencies_by_url.keys().next().unwrap();
    assert!(key.starts_with("POST "), "unexpected key {}", key);
}

#[tokio::test]
async fn test_churn_failed_deletes_keep_cache_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_bytes(b"{}".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let spec = churn_spec(60, 0.3, 2);
    let conn = ApiClient::new(Url::parse(&server.uri()).unwrap(), reqwest::Client::new());
    let (_tx, cancel) = watch::channel(false);
    let result = schedule(&spec, vec![conn], cancel).await.unwrap();

    // Every DELETE failed and was recorded; the same head name may be
    // retried, so failures collapse onto the normalised {name} key.
    let stats = kubeload::report::build_error_stats(&result.stats.errors);
    let delete_failures = stats.get("http/500").copied().unwrap_or(0);
    assert_eq!(delete_failures as usize, result.stats.errors.len());
    for err in &result.stats.errors {
        assert!(err.url.starts_with("DELETE "));
        assert!(err.url.contains("/configmaps/{name}"), "url {}", err.url);
    }
}
