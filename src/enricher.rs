use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::config::DetectSettings;
use crate::error::DetectionError;
use crate::model::Detection;

/// Error code the detection API uses for an exhausted plan.
const QUOTA_EXCEEDED_CODE: i64 = 104;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[async_trait]
pub trait LanguageDetector: Send + Sync {
    async fn detect(&self, text: &str) -> Result<Detection, DetectionError>;
}

/// Trim, reject texts below `min_chars`, and cut to `max_chars` characters.
pub fn validate_input(text: &str, min_chars: usize, max_chars: usize) -> Result<String, DetectionError> {
    let trimmed = text.trim();
    let chars = trimmed.chars().count();
    if chars == 0 || chars < min_chars {
        return Err(DetectionError::InputInvalid { chars });
    }
    Ok(trimmed.chars().take(max_chars).collect())
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    results: Vec<ApiResult>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    language_code: Option<String>,
    language_name: Option<String>,
    #[serde(default)]
    percentage: f32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    #[serde(default)]
    info: String,
}

/// Map one HTTP exchange onto a detection or the error taxonomy.
fn interpret_response(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Result<Detection, DetectionError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(DetectionError::QuotaExceeded {
            info: format!("HTTP {}", status.as_u16()),
            retry_after,
        });
    }
    if !status.is_success() {
        return Err(DetectionError::ServiceError(format!("HTTP {}", status.as_u16())));
    }

    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| DetectionError::ServiceError(format!("malformed response: {}", e)))?;

    if let Some(err) = response.error {
        if err.code == QUOTA_EXCEEDED_CODE {
            return Err(DetectionError::QuotaExceeded {
                info: err.info,
                retry_after,
            });
        }
        return Err(DetectionError::ServiceError(format!("code {}: {}", err.code, err.info)));
    }
    if !response.success {
        return Err(DetectionError::ServiceError("request not successful".to_string()));
    }

    let first = response
        .results
        .into_iter()
        .next()
        .ok_or_else(|| DetectionError::ServiceError("no language detected".to_string()))?;
    let language_code = first
        .language_code
        .or(first.language_name)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| DetectionError::ServiceError("result without a language".to_string()))?;

    Ok(Detection {
        language_code,
        confidence: first.percentage,
    })
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let secs: u64 = value?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

/// Client for a languagelayer-style `detect` endpoint, one text per call.
pub struct DetectLanguageClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: DirectRateLimiter,
    min_chars: usize,
    max_chars: usize,
    calls: AtomicU64,
}

impl DetectLanguageClient {
    pub fn new(settings: &DetectSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("detection API key missing (set CRAWLER_DETECT__API_KEY)"))?;
        let rpm = NonZeroU32::new(settings.requests_per_minute)
            .ok_or_else(|| anyhow!("detect.requests_per_minute must be > 0"))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            api_key,
            limiter: RateLimiter::direct(Quota::per_minute(rpm)),
            min_chars: settings.min_chars,
            max_chars: settings.max_chars,
            calls: AtomicU64::new(0),
        })
    }

    /// Remote calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LanguageDetector for DetectLanguageClient {
    async fn detect(&self, text: &str) -> Result<Detection, DetectionError> {
        let query = validate_input(text, self.min_chars, self.max_chars)?;

        self.limiter.until_ready().await;
        self.calls.fetch_add(1, Ordering::Relaxed);

        let response = self
            .http
            .get(&self.base_url)
            .query(&[("access_key", self.api_key.as_str()), ("query", query.as_str())])
            .send()
            .await
            .map_err(|e| DetectionError::ServiceError(e.to_string()))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let body = response
            .text()
            .await
            .map_err(|e| DetectionError::ServiceError(e.to_string()))?;
        debug!(status = status.as_u16(), chars = query.chars().count(), "Detection response");

        interpret_response(status, retry_after, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_validation() {
        assert!(matches!(
            validate_input("   ", 1, 100),
            Err(DetectionError::InputInvalid { chars: 0 })
        ));
        assert!(matches!(
            validate_input(" ok ", 3, 100),
            Err(DetectionError::InputInvalid { chars: 2 })
        ));
        assert_eq!(validate_input(" hello ", 3, 100).unwrap(), "hello");

        let long = "é".repeat(150);
        assert_eq!(validate_input(&long, 3, 100).unwrap().chars().count(), 100);
    }

    #[test]
    fn successful_detection() {
        let body = r#"{"success":true,"results":[
            {"language_code":"es","language_name":"Spanish","probability":80.1,"percentage":97.5,"reliable_result":true},
            {"language_code":"pt","language_name":"Portuguese","percentage":2.5}]}"#;
        let d = interpret_response(StatusCode::OK, None, body).unwrap();
        assert_eq!(d.language_code, "es");
        assert_eq!(d.confidence, 97.5);
    }

    #[test]
    fn name_when_code_absent() {
        let body = r#"{"success":true,"results":[{"language_name":"German","percentage":88}]}"#;
        assert_eq!(interpret_response(StatusCode::OK, None, body).unwrap().language_code, "German");
    }

    #[test]
    fn quota_from_payload_code() {
        let body = r#"{"success":false,"error":{"code":104,"type":"usage_limit_reached","info":"Your monthly usage limit has been reached."}}"#;
        match interpret_response(StatusCode::OK, None, body) {
            Err(DetectionError::QuotaExceeded { info, retry_after }) => {
                assert!(info.contains("monthly usage limit"));
                assert_eq!(retry_after, None);
            }
            other => panic!("expected quota error, got {:?}", other),
        }
    }

    #[test]
    fn quota_from_http_429_keeps_retry_after() {
        let err = interpret_response(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), "").unwrap_err();
        assert!(matches!(
            err,
            DetectionError::QuotaExceeded { retry_after: Some(d), .. } if d == Duration::from_secs(7)
        ));
    }

    #[test]
    fn other_failures_are_service_errors() {
        let cases = [
            (StatusCode::INTERNAL_SERVER_ERROR, "oops"),
            (StatusCode::OK, "not json"),
            (StatusCode::OK, r#"{"success":true,"results":[]}"#),
            (StatusCode::OK, r#"{"success":false,"error":{"code":101,"info":"invalid access key"}}"#),
        ];
        for (status, body) in cases {
            assert!(
                matches!(interpret_response(status, None, body), Err(DetectionError::ServiceError(_))),
                "{} {}",
                status,
                body
            );
        }
    }

    #[test]
    fn retry_after_header() {
        let v = reqwest::header::HeaderValue::from_static("12");
        assert_eq!(parse_retry_after(Some(&v)), Some(Duration::from_secs(12)));
        let v = reqwest::header::HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&v)), None);
    }

    #[tokio::test]
    async fn short_text_never_reaches_the_network() {
        let settings = DetectSettings {
            api_key: Some("k".into()),
            base_url: "http://127.0.0.1:9/detect".into(),
            ..Default::default()
        };
        let client = DetectLanguageClient::new(&settings).unwrap();
        let err = client.detect("  ").await.unwrap_err();
        assert!(matches!(err, DetectionError::InputInvalid { .. }));
        assert_eq!(client.calls(), 0);
    }
}
