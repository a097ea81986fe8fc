//! FCM HTTP v1 推送渠道
//!
//! 每个令牌一次 `messages:send` 请求，有界并发发出。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::fcm_auth::{
    AccessTokenSource, ServiceAccountKey, ServiceAccountTokenSource, StaticAccessToken,
};
use crate::domain::error::DeliveryError;
use crate::domain::model::TokenOutcome;
use crate::domain::repository::PushProvider;

const DEFAULT_ENDPOINT: &str = "https://fcm.googleapis.com";
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const MAX_IN_FLIGHT: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct FcmSettings {
    /// 为空时取凭据文件中的 project_id
    pub project_id: Option<String>,
    /// 服务账号凭据文件（推荐，令牌自动刷新）
    pub credentials_file: Option<String>,
    /// 静态访问令牌
    pub access_token: Option<String>,
    pub endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub struct FcmPushProvider {
    client: Client,
    send_url: String,
    tokens: Arc<dyn AccessTokenSource>,
}

/// 单次请求的原始结果
enum SendAttempt {
    Response { status: u16, body: String },
    Transport(String),
}

/// 单个响应的判定
#[derive(Debug, Clone, PartialEq, Eq)]
enum ResponseClass {
    Token(TokenOutcome),
    /// 凭据被拒：整个调用都无法发出
    Unauthorized(String),
    /// 项目配额耗尽
    Throttled(String),
}

/// 整个调用失败的原因
#[derive(Debug, Clone, PartialEq, Eq)]
enum CallFailure {
    Unauthorized(String),
    Unreachable(String),
}

#[derive(Debug, Deserialize)]
struct FcmErrorEnvelope {
    error: FcmErrorBody,
}

#[derive(Debug, Deserialize)]
struct FcmErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<FcmErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct FcmErrorDetail {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

impl FcmPushProvider {
    pub fn new(settings: FcmSettings) -> Result<Self> {
        let timeout = Duration::from_millis(settings.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));

        let (tokens, key_project): (Arc<dyn AccessTokenSource>, Option<String>) =
            match (&settings.credentials_file, &settings.access_token) {
                (Some(path), _) => {
                    let key = ServiceAccountKey::from_file(Path::new(path))?;
                    let project = key.project_id.clone();
                    (Arc::new(ServiceAccountTokenSource::new(key, timeout)?), project)
                }
                (None, Some(token)) if !token.trim().is_empty() => {
                    warn!("fcm uses a static access token, it will not be refreshed");
                    (Arc::new(StaticAccessToken::new(token.clone())), None)
                }
                _ => bail!("fcm requires credentials_file or access_token"),
            };

        let project_id = settings
            .project_id
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or(key_project)
            .context("fcm project_id is required")?;

        Self::with_token_source(
            &project_id,
            settings.endpoint.as_deref(),
            timeout,
            tokens,
        )
    }

    pub fn with_token_source(
        project_id: &str,
        endpoint: Option<&str>,
        timeout: Duration,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build fcm http client")?;

        let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
        let send_url = format!("{endpoint}/v1/projects/{project_id}/messages:send");

        Ok(Self {
            client,
            send_url,
            tokens,
        })
    }

    async fn send_one(&self, bearer: &str, message: &str, token: &str) -> SendAttempt {
        let body = json!({
            "message": {
                "token": token,
                "data": { "notification": message },
            }
        });

        let response = match self
            .client
            .post(&self.send_url)
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return SendAttempt::Transport(e.to_string()),
        };
        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => SendAttempt::Response { status, body },
            Err(e) => SendAttempt::Transport(e.to_string()),
        }
    }
}

/// 根据 HTTP 状态与错误体判定单个响应
fn classify_response(status: u16, body: &str) -> ResponseClass {
    if (200..300).contains(&status) {
        return ResponseClass::Token(TokenOutcome::Delivered);
    }

    let parsed = serde_json::from_str::<FcmErrorEnvelope>(body).ok();
    let error_code = parsed
        .as_ref()
        .and_then(|e| e.error.details.iter().find_map(|d| d.error_code.clone()));
    let error_status = parsed.as_ref().and_then(|e| e.error.status.clone());
    let reason = error_code
        .clone()
        .or_else(|| error_status.clone())
        .or_else(|| parsed.as_ref().and_then(|e| e.error.message.clone()))
        .unwrap_or_else(|| format!("HTTP {status}"));

    let code = error_code.as_deref().or(error_status.as_deref());
    match (status, code) {
        // 令牌属于其他发送方，同样是 403，但只影响这一个设备
        (_, Some("UNREGISTERED" | "SENDER_ID_MISMATCH")) | (404, _) => {
            ResponseClass::Token(TokenOutcome::InvalidToken { reason })
        }
        (401 | 403, _)
        | (_, Some("UNAUTHENTICATED" | "PERMISSION_DENIED" | "THIRD_PARTY_AUTH_ERROR")) => {
            ResponseClass::Unauthorized(reason)
        }
        (429, _) | (_, Some("QUOTA_EXCEEDED" | "RESOURCE_EXHAUSTED")) => {
            ResponseClass::Throttled(reason)
        }
        _ => ResponseClass::Token(TokenOutcome::Failed { reason }),
    }
}

/// 汇总整批结果
///
/// 凭据被拒或没有任何令牌得到明确答复（全部网络失败或限流）时，整个调用视为不可用。
fn settle_attempts(
    attempts: Vec<(String, SendAttempt)>,
) -> Result<HashMap<String, TokenOutcome>, CallFailure> {
    let classified: Vec<(String, Result<ResponseClass, String>)> = attempts
        .into_iter()
        .map(|(token, attempt)| {
            let class = match attempt {
                SendAttempt::Response { status, body } => Ok(classify_response(status, &body)),
                SendAttempt::Transport(reason) => Err(reason),
            };
            (token, class)
        })
        .collect();

    if let Some(reason) = classified.iter().find_map(|(_, class)| match class {
        Ok(ResponseClass::Unauthorized(reason)) => Some(reason.clone()),
        _ => None,
    }) {
        return Err(CallFailure::Unauthorized(reason));
    }

    let answered = classified
        .iter()
        .any(|(_, class)| matches!(class, Ok(ResponseClass::Token(_))));
    if !classified.is_empty() && !answered {
        let reason = classified
            .iter()
            .find_map(|(_, class)| match class {
                Err(reason) | Ok(ResponseClass::Throttled(reason)) => Some(reason.clone()),
                _ => None,
            })
            .unwrap_or_default();
        return Err(CallFailure::Unreachable(reason));
    }

    Ok(classified
        .into_iter()
        .map(|(token, class)| {
            let outcome = match class {
                Ok(ResponseClass::Token(outcome)) => outcome,
                Ok(ResponseClass::Throttled(reason) | ResponseClass::Unauthorized(reason))
                | Err(reason) => TokenOutcome::Failed { reason },
            };
            if !outcome.is_delivered() {
                debug!(token = %token, outcome = ?outcome, "fcm token not delivered");
            }
            (token, outcome)
        })
        .collect())
}

#[async_trait]
impl PushProvider for FcmPushProvider {
    fn name(&self) -> &'static str {
        "fcm"
    }

    async fn send_multicast(
        &self,
        message: &str,
        tokens: &[String],
    ) -> Result<HashMap<String, TokenOutcome>, DeliveryError> {
        let bearer = self.tokens.access_token().await?;

        let attempts: Vec<(String, SendAttempt)> = stream::iter(tokens.iter().cloned())
            .map(|token| {
                let bearer = bearer.as_str();
                async move {
                    let attempt = self.send_one(bearer, message, &token).await;
                    (token, attempt)
                }
            })
            .buffer_unordered(MAX_IN_FLIGHT)
            .collect()
            .await;

        match settle_attempts(attempts) {
            Ok(outcomes) => Ok(outcomes),
            Err(CallFailure::Unauthorized(reason)) => {
                warn!(tokens = tokens.len() as u64, error = %reason, "fcm rejected credentials");
                self.tokens.invalidate().await;
                Err(DeliveryError::Unavailable(format!(
                    "fcm rejected credentials: {reason}"
                )))
            }
            Err(CallFailure::Unreachable(reason)) => {
                warn!(tokens = tokens.len() as u64, error = %reason, "fcm unreachable");
                Err(DeliveryError::Unavailable(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn response(status: u16, body: &str) -> SendAttempt {
        SendAttempt::Response {
            status,
            body: body.to_string(),
        }
    }

    #[derive(Default)]
    struct CountingTokens {
        invalidated: AtomicUsize,
    }

    #[async_trait]
    impl AccessTokenSource for CountingTokens {
        async fn access_token(&self) -> Result<String, DeliveryError> {
            Ok("expired-token".to_string())
        }

        async fn invalidate(&self) {
            self.invalidated.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 本地 HTTP 服务：对每个请求返回固定的状态与响应体
    async fn serve_fixed(status: u16, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 4096];
                    // 读完请求头与 JSON 请求体
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        request.extend_from_slice(&buf[..n]);
                        let text = String::from_utf8_lossy(&request);
                        if let Some(head_end) = text.find("\r\n\r\n") {
                            let length = text[..head_end]
                                .lines()
                                .find_map(|l| {
                                    l.to_ascii_lowercase()
                                        .strip_prefix("content-length:")
                                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                                })
                                .unwrap_or(0);
                            if request.len() >= head_end + 4 + length {
                                break;
                            }
                        }
                    }
                    let reply = format!(
                        "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_success_status_is_delivered() {
        let body = r#"{"name":"projects/p/messages/0:123"}"#;
        assert_eq!(
            classify_response(200, body),
            ResponseClass::Token(TokenOutcome::Delivered)
        );
    }

    #[test]
    fn test_unregistered_token_is_invalid() {
        let body = r#"{
            "error": {
                "code": 404,
                "message": "Requested entity was not found.",
                "status": "NOT_FOUND",
                "details": [{
                    "@type": "type.googleapis.com/google.firebase.fcm.v1.FcmError",
                    "errorCode": "UNREGISTERED"
                }]
            }
        }"#;
        assert_eq!(
            classify_response(404, body),
            ResponseClass::Token(TokenOutcome::InvalidToken {
                reason: "UNREGISTERED".to_string()
            })
        );
    }

    #[test]
    fn test_sender_mismatch_only_affects_one_token() {
        let body = r#"{"error":{"code":403,"status":"PERMISSION_DENIED",
            "details":[{"errorCode":"SENDER_ID_MISMATCH"}]}}"#;
        assert_eq!(
            classify_response(403, body),
            ResponseClass::Token(TokenOutcome::InvalidToken {
                reason: "SENDER_ID_MISMATCH".to_string()
            })
        );
    }

    #[test]
    fn test_credential_errors_are_unauthorized() {
        let body = r#"{"error":{"code":401,"status":"UNAUTHENTICATED"}}"#;
        assert_eq!(
            classify_response(401, body),
            ResponseClass::Unauthorized("UNAUTHENTICATED".to_string())
        );
        let body = r#"{"error":{"code":401,"details":[{"errorCode":"THIRD_PARTY_AUTH_ERROR"}]}}"#;
        assert!(matches!(
            classify_response(401, body),
            ResponseClass::Unauthorized(_)
        ));
        assert!(matches!(
            classify_response(403, "forbidden"),
            ResponseClass::Unauthorized(_)
        ));
    }

    #[test]
    fn test_server_error_is_failed_with_status() {
        let body = r#"{"error":{"code":503,"status":"UNAVAILABLE"}}"#;
        assert_eq!(
            classify_response(503, body),
            ResponseClass::Token(TokenOutcome::Failed {
                reason: "UNAVAILABLE".to_string()
            })
        );
        assert_eq!(
            classify_response(502, "<html>bad gateway</html>"),
            ResponseClass::Token(TokenOutcome::Failed {
                reason: "HTTP 502".to_string()
            })
        );
    }

    #[test]
    fn test_any_unauthorized_response_fails_whole_call() {
        let result = settle_attempts(vec![
            ("t1".into(), response(200, "{}")),
            (
                "t2".into(),
                response(401, r#"{"error":{"status":"UNAUTHENTICATED"}}"#),
            ),
        ]);
        assert_eq!(
            result.unwrap_err(),
            CallFailure::Unauthorized("UNAUTHENTICATED".to_string())
        );
    }

    #[test]
    fn test_all_throttled_fails_whole_call() {
        let quota = r#"{"error":{"code":429,"details":[{"errorCode":"QUOTA_EXCEEDED"}]}}"#;
        let result = settle_attempts(vec![
            ("t1".into(), response(429, quota)),
            ("t2".into(), SendAttempt::Transport("timed out".into())),
        ]);
        assert_eq!(
            result.unwrap_err(),
            CallFailure::Unreachable("QUOTA_EXCEEDED".to_string())
        );
    }

    #[test]
    fn test_partial_throttling_is_per_token_failure() {
        let quota = r#"{"error":{"code":429,"details":[{"errorCode":"QUOTA_EXCEEDED"}]}}"#;
        let outcomes = settle_attempts(vec![
            ("t1".into(), response(200, "{}")),
            ("t2".into(), response(429, quota)),
        ])
        .unwrap();
        assert_eq!(outcomes["t1"], TokenOutcome::Delivered);
        assert_eq!(
            outcomes["t2"],
            TokenOutcome::Failed {
                reason: "QUOTA_EXCEEDED".to_string()
            }
        );
    }

    #[test]
    fn test_settings_are_validated() {
        assert!(FcmPushProvider::new(FcmSettings::default()).is_err());

        let missing_project = FcmPushProvider::new(FcmSettings {
            access_token: Some("token".into()),
            ..Default::default()
        });
        assert!(missing_project.is_err());

        let provider = FcmPushProvider::new(FcmSettings {
            project_id: Some("demo".into()),
            access_token: Some("token".into()),
            endpoint: Some("http://localhost:9000/".into()),
            timeout_ms: Some(500),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            provider.send_url,
            "http://localhost:9000/v1/projects/demo/messages:send"
        );
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_whole_call_and_drop_token() {
        let endpoint = serve_fixed(
            401,
            r#"{"error":{"code":401,"message":"Request had invalid authentication credentials.","status":"UNAUTHENTICATED"}}"#,
        )
        .await;
        let tokens = Arc::new(CountingTokens::default());
        let provider = FcmPushProvider::with_token_source(
            "demo",
            Some(&endpoint),
            Duration::from_secs(5),
            tokens.clone(),
        )
        .unwrap();

        let err = provider
            .send_multicast("hi", &["t1".into(), "t2".into(), "t3".into()])
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Unavailable(ref reason) if reason.contains("UNAUTHENTICATED")));
        assert_eq!(tokens.invalidated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_whole_call() {
        let provider = FcmPushProvider::new(FcmSettings {
            project_id: Some("demo".into()),
            access_token: Some("token".into()),
            // 端口 9 (discard) 在测试环境中不会有 HTTP 服务
            endpoint: Some("http://127.0.0.1:9".into()),
            timeout_ms: Some(500),
            ..Default::default()
        })
        .unwrap();

        let err = provider
            .send_multicast("hi", &["t1".to_string(), "t2".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Unavailable(_)));
    }
}
