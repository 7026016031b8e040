//! Outbound request authentication, selected from the provider's declared
//! auth type.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::{GatewayError, GatewayResult};
use crate::types::{AuthType, ServiceProvider, FLAVOR_TENCENT, SERVICE_CHAT, SERVICE_EMBED};

type HmacSha256 = Hmac<Sha256>;

/// An outbound call under construction.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Per-environment endpoint used by the credential exchange authenticator.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CredentialEndpoint {
    pub url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub chat_path: String,
    #[serde(default)]
    pub embed_path: String,
}

pub type CredentialEndpoints = HashMap<String, CredentialEndpoint>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authenticator {
    None,
    ApiKey,
    SignedHeader,
    CredentialExchange,
}

#[derive(Deserialize)]
struct ApiKeyInfo {
    api_key: String,
}

#[derive(Deserialize)]
struct SignInfo {
    secret_id: String,
    secret_key: String,
}

#[derive(Debug, Default, Deserialize)]
struct SignCommonParams {
    #[serde(default)]
    version: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    region: String,
}

#[derive(Deserialize)]
struct CredentialInfo {
    env_type: String,
    provider: String,
    model_key: String,
    #[serde(default)]
    credentials: Value,
}

fn auth_err(msg: impl std::fmt::Display) -> GatewayError {
    GatewayError::Auth(msg.to_string())
}

fn header_value(value: &str) -> GatewayResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(auth_err)
}

impl Authenticator {
    /// Pure selection from the provider declaration. Signed-header auth only
    /// exists for the tencent family.
    pub fn select(provider: &ServiceProvider) -> GatewayResult<Self> {
        match provider.auth_type {
            AuthType::None => Ok(Authenticator::None),
            AuthType::ApiKey => Ok(Authenticator::ApiKey),
            AuthType::Credentials => Ok(Authenticator::CredentialExchange),
            AuthType::Token if provider.flavor == FLAVOR_TENCENT => Ok(Authenticator::SignedHeader),
            AuthType::Token => Err(auth_err(format!(
                "token auth is not supported for flavor {}",
                provider.flavor
            ))),
        }
    }

    pub fn authenticate(
        &self,
        request: &mut OutboundRequest,
        provider: &ServiceProvider,
        endpoints: &CredentialEndpoints,
    ) -> GatewayResult<()> {
        match self {
            Authenticator::None => Ok(()),
            Authenticator::ApiKey => api_key(request, provider),
            Authenticator::SignedHeader => {
                let timestamp = chrono::Utc::now().timestamp();
                signed_header(request, provider, timestamp)
            }
            Authenticator::CredentialExchange => credential_exchange(request, provider, endpoints),
        }
    }
}

fn api_key(request: &mut OutboundRequest, provider: &ServiceProvider) -> GatewayResult<()> {
    let info: ApiKeyInfo = serde_json::from_str(&provider.auth_key).map_err(auth_err)?;
    request.headers.insert(
        axum::http::header::AUTHORIZATION,
        header_value(&format!("Bearer {}", info.api_key))?,
    );
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &str) -> GatewayResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(auth_err)?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// TC3-HMAC-SHA256 over method, `/`, empty query, content-type and host.
fn signed_header(
    request: &mut OutboundRequest,
    provider: &ServiceProvider,
    timestamp: i64,
) -> GatewayResult<()> {
    let info: SignInfo = serde_json::from_str(&provider.auth_key).map_err(auth_err)?;
    let common: SignCommonParams = if provider.extra_headers.trim().is_empty() {
        SignCommonParams::default()
    } else {
        serde_json::from_str(&provider.extra_headers).map_err(auth_err)?
    };

    let url = reqwest::Url::parse(&provider.url).map_err(auth_err)?;
    let host = url.host_str().unwrap_or_default().to_string();
    let service = host.split('.').next().unwrap_or_default().to_string();
    let algorithm = "TC3-HMAC-SHA256";

    let mut canonical_headers = String::new();
    let mut signed_headers = String::new();
    if let Some(ct) = request.headers.get(axum::http::header::CONTENT_TYPE) {
        let ct = ct.to_str().map_err(auth_err)?.to_lowercase();
        canonical_headers.push_str(&format!("content-type:{}\n", ct));
        signed_headers.push_str("content-type;");
    }
    canonical_headers.push_str(&format!("host:{}\n", host));
    signed_headers.push_str("host");

    let canonical_request = format!(
        "{}\n/\n\n{}\n{}\n{}",
        request.method.as_str(),
        canonical_headers,
        signed_headers,
        sha256_hex(&request.body)
    );

    let date = chrono::DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| auth_err("invalid signing timestamp"))?
        .format("%Y-%m-%d")
        .to_string();
    let scope = format!("{}/{}/tc3_request", date, service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        algorithm,
        timestamp,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let secret_date = hmac_sha256(format!("TC3{}", info.secret_key).as_bytes(), &date)?;
    let secret_service = hmac_sha256(&secret_date, &service)?;
    let secret_signing = hmac_sha256(&secret_service, "tc3_request")?;
    let signature = hex::encode(&hmac_sha256(&secret_signing, &string_to_sign)?);

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        algorithm, info.secret_id, scope, signed_headers, signature
    );

    let headers = &mut request.headers;
    headers.insert(axum::http::header::AUTHORIZATION, header_value(&authorization)?);
    headers.insert(HeaderName::from_static("x-tc-timestamp"), header_value(&timestamp.to_string())?);
    headers.insert(HeaderName::from_static("x-tc-version"), header_value(&common.version)?);
    headers.insert(HeaderName::from_static("x-tc-region"), header_value(&common.region)?);
    headers.insert(HeaderName::from_static("x-tc-action"), header_value(&common.action)?);
    Ok(())
}

/// Rewrites the outbound URL and body for the credential-bundle family.
fn credential_exchange(
    request: &mut OutboundRequest,
    provider: &ServiceProvider,
    endpoints: &CredentialEndpoints,
) -> GatewayResult<()> {
    let mut body: Map<String, Value> = serde_json::from_slice(&request.body).map_err(auth_err)?;
    let bundles: HashMap<String, CredentialInfo> =
        serde_json::from_str(&provider.auth_key).map_err(auth_err)?;

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| auth_err("credentials auth needs a model in the request"))?
        .to_string();
    let info = bundles
        .get(&model)
        .ok_or_else(|| auth_err(format!("no credentials for model {}", model)))?;
    let endpoint = endpoints
        .get(&info.env_type)
        .ok_or_else(|| auth_err(format!("no credential endpoint for env {}", info.env_type)))?;

    request.headers.insert(
        axum::http::header::AUTHORIZATION,
        header_value(&format!("Bearer {}", endpoint.access_token))?,
    );

    match provider.service_name.as_str() {
        SERVICE_CHAT => {
            request.url = format!("{}{}", endpoint.url, endpoint.chat_path);
            body.insert(
                "model_config".into(),
                json!({
                    "provider": info.provider,
                    "name": model,
                    "model_key": info.model_key,
                    "credentials": info.credentials,
                }),
            );
            let has_prompt = body.get("prompt_messages").map(Value::is_array).unwrap_or(false);
            if !has_prompt {
                if let Some(messages) = body.get("messages").filter(|m| m.is_array()).cloned() {
                    body.insert("prompt_messages".into(), messages);
                }
            }
        }
        SERVICE_EMBED => {
            request.url = format!("{}{}", endpoint.url, endpoint.embed_path);
            body.insert("credentials".into(), info.credentials.clone());
        }
        _ => {}
    }

    request.body = Bytes::from(serde_json::to_vec(&body).map_err(auth_err)?);
    request.headers.remove(axum::http::header::CONTENT_LENGTH);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;

    fn provider(auth_type: AuthType, flavor: &str, auth_key: &str) -> ServiceProvider {
        ServiceProvider {
            id: 1,
            provider_name: "p".into(),
            service_name: SERVICE_CHAT.into(),
            service_source: Location::Remote,
            desc: String::new(),
            method: "POST".into(),
            url: "https://hunyuan.tencentcloudapi.com".into(),
            auth_type,
            auth_key: auth_key.into(),
            flavor: flavor.into(),
            extra_headers: r#"{"version":"2023-09-01","action":"ChatCompletions","region":"ap-guangzhou"}"#.into(),
            extra_json_body: "{}".into(),
            properties: "{}".into(),
            status: 1,
        }
    }

    fn request(body: &str) -> OutboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        OutboundRequest {
            method: Method::POST,
            url: "https://example.invalid/v1".into(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    // ===== Selection =====

    #[test]
    fn test_selection_is_pure_function_of_declaration() {
        assert_eq!(Authenticator::select(&provider(AuthType::None, "openai", "")).unwrap(), Authenticator::None);
        assert_eq!(Authenticator::select(&provider(AuthType::ApiKey, "openai", "")).unwrap(), Authenticator::ApiKey);
        assert_eq!(
            Authenticator::select(&provider(AuthType::Token, "tencent", "")).unwrap(),
            Authenticator::SignedHeader
        );
        assert_eq!(
            Authenticator::select(&provider(AuthType::Credentials, "smartvision", "")).unwrap(),
            Authenticator::CredentialExchange
        );
        assert!(Authenticator::select(&provider(AuthType::Token, "openai", "")).is_err());
    }

    // ===== ApiKey =====

    #[test]
    fn test_api_key_sets_bearer() {
        let sp = provider(AuthType::ApiKey, "openai", r#"{"api_key":"sk-123"}"#);
        let mut req = request("{}");
        Authenticator::ApiKey
            .authenticate(&mut req, &sp, &CredentialEndpoints::new())
            .unwrap();
        assert_eq!(req.headers.get("authorization").unwrap(), "Bearer sk-123");
    }

    #[test]
    fn test_api_key_malformed_key() {
        let sp = provider(AuthType::ApiKey, "openai", "sk-raw");
        let mut req = request("{}");
        let err = Authenticator::ApiKey
            .authenticate(&mut req, &sp, &CredentialEndpoints::new())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    // ===== SignedHeader =====

    #[test]
    fn test_signed_header_is_deterministic_for_timestamp() {
        let sp = provider(AuthType::Token, "tencent", r#"{"secret_id":"AKID","secret_key":"KEY"}"#);
        let mut a = request(r#"{"Model":"hunyuan-lite"}"#);
        let mut b = a.clone();
        signed_header(&mut a, &sp, 1_700_000_000).unwrap();
        signed_header(&mut b, &sp, 1_700_000_000).unwrap();

        let auth = a.headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with(
            "TC3-HMAC-SHA256 Credential=AKID/2023-11-14/hunyuan/tc3_request, SignedHeaders=content-type;host, Signature="
        ));
        assert_eq!(a.headers.get("authorization"), b.headers.get("authorization"));
        assert_eq!(a.headers.get("x-tc-timestamp").unwrap(), "1700000000");
        assert_eq!(a.headers.get("x-tc-action").unwrap(), "ChatCompletions");
        assert_eq!(a.headers.get("x-tc-region").unwrap(), "ap-guangzhou");
    }

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2
        let mac = hmac_sha256(b"Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(&mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    // ===== CredentialExchange =====

    fn endpoints() -> CredentialEndpoints {
        let mut e = CredentialEndpoints::new();
        e.insert(
            "prod".into(),
            CredentialEndpoint {
                url: "https://sv.example".into(),
                access_token: "tok".into(),
                chat_path: "/chat".into(),
                embed_path: "/embed".into(),
            },
        );
        e
    }

    const BUNDLE: &str = r#"{"m1":{"env_type":"prod","provider":"azure","model_key":"k1","credentials":{"key":"v"}}}"#;

    #[test]
    fn test_credential_exchange_rewrites_chat() {
        let sp = provider(AuthType::Credentials, "smartvision", BUNDLE);
        let mut req = request(r#"{"model":"m1","messages":[{"role":"user","content":"hi"}]}"#);
        Authenticator::CredentialExchange
            .authenticate(&mut req, &sp, &endpoints())
            .unwrap();
        assert_eq!(req.url, "https://sv.example/chat");
        assert_eq!(req.headers.get("authorization").unwrap(), "Bearer tok");
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["model_config"]["model_key"], "k1");
        assert_eq!(body["prompt_messages"], body["messages"]);
    }

    #[test]
    fn test_credential_exchange_embed_and_missing_model() {
        let mut sp = provider(AuthType::Credentials, "smartvision", BUNDLE);
        sp.service_name = SERVICE_EMBED.into();
        let mut req = request(r#"{"model":"m1","input":["x"]}"#);
        Authenticator::CredentialExchange
            .authenticate(&mut req, &sp, &endpoints())
            .unwrap();
        assert_eq!(req.url, "https://sv.example/embed");
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["credentials"]["key"], "v");

        let mut req = request(r#"{"model":"unknown"}"#);
        assert!(Authenticator::CredentialExchange
            .authenticate(&mut req, &sp, &endpoints())
            .is_err());
    }
}
