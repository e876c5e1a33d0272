//! Prediction client against a mock Gradio endpoint.

use autotagger::client::{RequestEvent, RequestObserver, TaggerClient};
use autotagger::config::{normalize_endpoint, Config};
use autotagger::connection::{ConnectionStatus, ConnectionTracker};
use autotagger::Error;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<&'static str>>,
}

impl Recorder {
    fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| **e == name).count()
    }
}

impl RequestObserver for Recorder {
    fn on_event(&self, event: &RequestEvent<'_>) {
        let name = match event {
            RequestEvent::Started { .. } => "started",
            RequestEvent::Retrying { .. } => "retrying",
            RequestEvent::Succeeded { .. } => "succeeded",
            RequestEvent::Failed { .. } => "failed",
        };
        self.events.lock().unwrap().push(name);
    }
}

fn config_for(endpoint: &str) -> Config {
    Config {
        local_endpoint: normalize_endpoint(endpoint),
        request_timeout_ms: 1_000,
        ..Config::default()
    }
}

fn client_with(recorder: &Arc<Recorder>) -> TaggerClient {
    TaggerClient::new(Arc::new(ConnectionTracker::default()))
        .with_observer(recorder.clone())
        .with_retry_delay(Duration::from_millis(10))
}

/// An address nothing is listening on
fn closed_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_predict_returns_tags_and_connects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .and(body_partial_json(json!({ "fn_index": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": ["smile, blue eyes", { "smile": 0.92 }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    let prediction = client
        .predict("data:image/png;base64,AAAA", &config_for(&server.uri()))
        .await
        .unwrap();

    assert_eq!(prediction.tags, "smile, blue eyes");
    assert_eq!(prediction.attempts, 1);
    assert_eq!(client.tracker().status(), ConnectionStatus::Connected);
    assert_eq!(recorder.count("succeeded"), 1);
}

#[tokio::test]
async fn test_malformed_response_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "queue full" })))
        .expect(1)
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    let err = client
        .predict("data:image/png;base64,AAAA", &config_for(&server.uri()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
    assert_eq!(recorder.count("retrying"), 0);
}

#[tokio::test]
async fn test_server_errors_retried_up_to_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
        .expect(3)
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    let config = Config {
        max_retries: 2,
        ..config_for(&server.uri())
    };
    let err = client.predict("data:image/png;base64,AAAA", &config).await.unwrap_err();

    assert!(matches!(err, Error::Status { status: 503, .. }), "got {:?}", err);
    assert_eq!(recorder.count("started"), 3);
    assert_eq!(recorder.count("retrying"), 2);
    assert_eq!(recorder.count("failed"), 1);
}

#[tokio::test]
async fn test_client_errors_fail_fast() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let err = client_with(&recorder)
        .predict("data:image/png;base64,AAAA", &config_for(&server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_connection_refused_retried_then_disconnected() {
    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    let config = Config {
        max_retries: 2,
        ..config_for(&closed_endpoint())
    };

    let err = client.predict("data:image/png;base64,AAAA", &config).await.unwrap_err();

    assert!(matches!(err, Error::Transport(_)), "got {:?}", err);
    assert_eq!(recorder.count("started"), 3);
    assert_eq!(client.tracker().status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": ["fur"] })))
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let prediction = client_with(&recorder)
        .predict("data:image/png;base64,AAAA", &config_for(&server.uri()))
        .await
        .unwrap();

    assert_eq!(prediction.tags, "fur");
    assert_eq!(prediction.attempts, 2);
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": ["fur"] }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let config = Config {
        request_timeout_ms: 100,
        max_retries: 0,
        ..config_for(&server.uri())
    };
    let err = client_with(&recorder)
        .predict("data:image/png;base64,AAAA", &config)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(100)), "got {:?}", err);
}

#[tokio::test]
async fn test_failure_inside_grace_window_keeps_connection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": ["fur"] })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    let config = Config {
        max_retries: 0,
        ..config_for(&server.uri())
    };

    client.predict("data:image/png;base64,AAAA", &config).await.unwrap();
    assert!(client.predict("data:image/png;base64,AAAA", &config).await.is_err());
    assert_eq!(client.tracker().status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_probe_updates_tracker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [""] })))
        .expect(1)
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    assert!(client.probe(&config_for(&server.uri())).await);
    assert_eq!(client.tracker().status(), ConnectionStatus::Connected);
    assert_eq!(client.tracker().label(), "Generate Tags");
}

#[tokio::test]
async fn test_json_error_bodies_count_as_reachable() {
    for (status, body) in [
        (400, json!({ "detail": "Invalid image data" })),
        (500, json!({ "error": null })),
    ] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/predict"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;

        let recorder = Arc::new(Recorder::default());
        let client = client_with(&recorder);
        assert!(client.probe(&config_for(&server.uri())).await, "status {}", status);
        assert_eq!(client.tracker().status(), ConnectionStatus::Connected);
    }
}

#[tokio::test]
async fn test_non_json_body_is_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>Bad Gateway</html>"))
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    assert!(!client.probe(&config_for(&server.uri())).await);
    assert_eq!(client.tracker().status(), ConnectionStatus::Disconnected);

    let err = client
        .check_endpoint(&server.uri(), &Config::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_failed_check_respects_grace_window() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [""] })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let tracker = Arc::new(ConnectionTracker::new(Duration::from_millis(300)));
    let client = TaggerClient::new(tracker.clone());
    let config = config_for(&server.uri());

    assert!(client.probe(&config).await);
    assert!(!client.probe(&config).await);
    assert_eq!(tracker.status(), ConnectionStatus::Connected);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!client.probe(&config).await);
    assert_eq!(tracker.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_probe_failure_is_not_retried() {
    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    assert!(!client.probe(&config_for(&closed_endpoint())).await);
    assert_eq!(client.tracker().status(), ConnectionStatus::Disconnected);
    assert_eq!(recorder.count("started"), 0);
}

#[tokio::test]
async fn test_check_endpoint_leaves_tracker_alone() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [""] })))
        .expect(1)
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let client = client_with(&recorder);
    client
        .check_endpoint(&server.uri(), &Config::default())
        .await
        .unwrap();
    assert_eq!(client.tracker().status(), ConnectionStatus::Disconnected);
}
