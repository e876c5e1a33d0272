//! Client for the tagging model's Gradio prediction endpoint.
//!
//! Both requests post `{"data": [image, confidence], "fn_index": 0}`. A probe
//! sends an empty image and only checks that JSON comes back: servers reject
//! the empty image with a JSON error body, which still proves they are up.

use crate::config::{normalize_endpoint, Config};
use crate::connection::ConnectionTracker;
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fixed delay between predict attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct PredictRequest<'a> {
    data: (&'a str, f64),
    fn_index: u32,
}

impl<'a> PredictRequest<'a> {
    fn new(image: &'a str, confidence: f64) -> Self {
        Self {
            data: (image, confidence),
            fn_index: 0,
        }
    }
}

/// Raw tags returned by a successful predict call
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Comma-separated tags as produced by the model
    pub tags: String,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Lifecycle of one predict call, for hosts that show progress
#[derive(Debug)]
pub enum RequestEvent<'a> {
    Started { attempt: u32 },
    Retrying { attempt: u32, max_retries: u32, error: &'a Error },
    Succeeded { attempts: u32 },
    Failed { attempts: u32, error: &'a Error },
}

pub trait RequestObserver: Send + Sync {
    fn on_event(&self, event: &RequestEvent<'_>);
}

/// Observer that ignores every event
pub struct NoopObserver;

impl RequestObserver for NoopObserver {
    fn on_event(&self, _event: &RequestEvent<'_>) {}
}

pub struct TaggerClient {
    http: reqwest::Client,
    tracker: Arc<ConnectionTracker>,
    observer: Arc<dyn RequestObserver>,
    retry_delay: Duration,
}

impl TaggerClient {
    pub fn new(tracker: Arc<ConnectionTracker>) -> Self {
        Self {
            http: reqwest::Client::new(),
            tracker,
            observer: Arc::new(NoopObserver),
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Check reachability of the configured endpoint and update the tracker.
    ///
    /// Never retried: the periodic probe loop is its own retry.
    pub async fn probe(&self, config: &Config) -> bool {
        match self.check_endpoint(&config.local_endpoint, config).await {
            Ok(()) => {
                self.tracker.record_success();
                true
            }
            Err(e) => {
                let status = self.tracker.record_failure();
                debug!(error = %e, ?status, "Probe failed");
                false
            }
        }
    }

    /// Probe an arbitrary endpoint without touching connection state.
    ///
    /// Any JSON body counts as reachable, whatever the HTTP status.
    pub async fn check_endpoint(&self, endpoint: &str, config: &Config) -> Result<()> {
        let endpoint = normalize_endpoint(endpoint);
        let timeout = config.request_timeout();
        let (status, body) = self
            .send(&endpoint, &PredictRequest::new("", config.confidence), timeout)
            .await?;

        serde_json::from_str::<serde_json::Value>(&body)
            .map(|_| debug!(status = status.as_u16(), "Endpoint answered with JSON"))
            .map_err(|e| {
                Error::Protocol(format!(
                    "endpoint answered {} without JSON: {}",
                    status.as_u16(),
                    e
                ))
            })
    }

    /// Request tags for an image data URL.
    ///
    /// Transport faults are retried up to `config.max_retries` times with a
    /// fixed delay. A response with the wrong shape fails on the spot.
    pub async fn predict(&self, image: &str, config: &Config) -> Result<Prediction> {
        let request = PredictRequest::new(image, config.confidence);
        let timeout = config.request_timeout();
        let mut attempt = 0;

        loop {
            self.observer.on_event(&RequestEvent::Started { attempt });
            let started = Instant::now();

            let outcome = match self.post(&config.local_endpoint, &request, timeout).await {
                Ok(body) => parse_prediction(&body),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(tags) => {
                    let attempts = attempt + 1;
                    info!(
                        attempts,
                        duration_ms = started.elapsed().as_millis() as u64,
                        tag_count = tags.split(',').filter(|t| !t.trim().is_empty()).count(),
                        "Prediction received"
                    );
                    self.tracker.record_success();
                    self.observer.on_event(&RequestEvent::Succeeded { attempts });
                    return Ok(Prediction { tags, attempts });
                }
                Err(e) if e.is_retryable() && attempt < config.max_retries => {
                    attempt += 1;
                    warn!(
                        error = %e,
                        "AI request failed, retrying ({}/{})",
                        attempt,
                        config.max_retries
                    );
                    self.observer.on_event(&RequestEvent::Retrying {
                        attempt,
                        max_retries: config.max_retries,
                        error: &e,
                    });
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.tracker.record_failure();
                    }
                    self.observer.on_event(&RequestEvent::Failed {
                        attempts: attempt + 1,
                        error: &e,
                    });
                    return Err(e);
                }
            }
        }
    }

    async fn post(&self, endpoint: &str, request: &PredictRequest<'_>, timeout: Duration) -> Result<String> {
        let (status, body) = self.send(endpoint, request, timeout).await?;

        if !status.is_success() {
            let err = Error::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            };
            // 4xx means the request itself is wrong for this server
            return Err(if err.is_retryable() {
                err
            } else {
                Error::Protocol(err.to_string())
            });
        }

        Ok(body)
    }

    /// Status and body of one POST; only transport faults are errors here
    async fn send(
        &self,
        endpoint: &str,
        request: &PredictRequest<'_>,
        timeout: Duration,
    ) -> Result<(reqwest::StatusCode, String)> {
        debug!(endpoint, image_len = request.data.0.len(), "Posting to prediction endpoint");

        let response = self
            .http
            .post(endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::from_request(e, timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::from_request(e, timeout))?;

        Ok((status, body))
    }
}

/// Extract `data[0]` as the tag string
fn parse_prediction(body: &str) -> Result<String> {
    let json: serde_json::Value =
        serde_json::from_str(body).map_err(|e| Error::Protocol(format!("response is not JSON: {}", e)))?;

    match json.get("data").and_then(|data| data.get(0)) {
        Some(serde_json::Value::String(tags)) => Ok(tags.clone()),
        Some(other) => Err(Error::Protocol(format!(
            "expected a tag string in data[0], got {}",
            json_kind(other)
        ))),
        None => Err(Error::Protocol("response has no data[0]".to_string())),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_request_serialization() {
        let request = PredictRequest::new("data:image/png;base64,AAAA", 0.35);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "data": ["data:image/png;base64,AAAA", 0.35], "fn_index": 0 })
        );
    }

    #[test]
    fn test_probe_request_has_empty_image() {
        let json = serde_json::to_value(PredictRequest::new("", 0.25)).unwrap();
        assert_eq!(json["data"][0], "");
        assert_eq!(json["data"][1], 0.25);
    }

    #[test]
    fn test_parse_prediction() {
        let body = r#"{"data": ["smile, blue eyes", {"smile": 0.9}], "duration": 0.4}"#;
        assert_eq!(parse_prediction(body).unwrap(), "smile, blue eyes");
    }

    #[test]
    fn test_parse_prediction_accepts_empty_tag_string() {
        assert_eq!(parse_prediction(r#"{"data": [""]}"#).unwrap(), "");
    }

    #[test]
    fn test_parse_prediction_rejects_bad_shapes() {
        for body in [
            "not json",
            r#"{"error": "queue full"}"#,
            r#"{"data": []}"#,
            r#"{"data": [42]}"#,
            r#"{"data": "smile"}"#,
            r#"["smile"]"#,
        ] {
            let err = parse_prediction(body).unwrap_err();
            assert!(matches!(err, Error::Protocol(_)), "{} gave {:?}", body, err);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("ééé", 2), "éé...");
    }
}
