use crate::config::{AuthConfig, Config};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

const GRANT_TYPE_JWT_BEARER: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SIGNED_TOKEN_LIFETIME_MINUTES: i64 = 59;
const REFRESH_MARGIN_MINUTES: i64 = 5;
const DEFAULT_SCOPED_LIFETIME_SECONDS: i64 = 3600;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("token refresh failed twice in a row: {0}")]
    Exhausted(String),
}

impl AuthError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuthError::Exhausted(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignedTokenClaims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct ScopedTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    expires_at: DateTime<Utc>,
}

/// Returns a currently-valid bearer credential. Static tokens never expire
/// client-side; key-pair mode mints a short-lived signed token and exchanges
/// it for a scoped session token, refreshed inside a safety margin of expiry.
/// Safe for concurrent callers; concurrent refreshes collapse into one.
pub enum TokenSource {
    Static(String),
    KeyPair(Box<KeyPairSource>),
}

pub struct KeyPairSource {
    http: reqwest::Client,
    oauth_url: String,
    scope: String,
    issuer: String,
    subject: String,
    encoding_key: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
    refresh_failures: AtomicU32,
}

impl TokenSource {
    pub fn from_config(config: &Config, http: reqwest::Client) -> Result<Self> {
        match &config.auth {
            AuthConfig::StaticBearer(pat) => Ok(Self::Static(pat.clone())),
            AuthConfig::KeyPair {
                private_key_file,
            } => {
                let pem = std::fs::read_to_string(private_key_file).with_context(|| {
                    format!("failed to read private key {}", private_key_file.display())
                })?;
                let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
                    .context("private key is not a valid RSA PEM")?;
                let fingerprint = public_key_fingerprint(&pem)?;

                let account = config.account.to_uppercase();
                let user = config.user.to_uppercase();
                let subject = format!("{account}.{user}");
                let issuer = format!("{subject}.{fingerprint}");
                let scope = format!(
                    "SESSION:ROLE-ANY:{} {}.snowflakecomputing.com",
                    config.role.to_uppercase(),
                    config.account.to_lowercase()
                );
                tracing::info!(subject = %subject, "key-pair auth initialized");

                Ok(Self::KeyPair(Box::new(KeyPairSource {
                    http,
                    oauth_url: format!("{}/oauth/token", config.url),
                    scope,
                    issuer,
                    subject,
                    encoding_key,
                    cached: Mutex::new(None),
                    refresh_failures: AtomicU32::new(0),
                })))
            }
        }
    }

    pub async fn get(&self) -> Result<String, AuthError> {
        match self {
            Self::Static(pat) => Ok(pat.clone()),
            Self::KeyPair(source) => source.get().await,
        }
    }

    /// Drops any cached scoped token so the next `get()` mints a fresh one.
    /// Called after the server rejects a bearer with 401.
    pub async fn force_refresh(&self) {
        if let Self::KeyPair(source) = self {
            source.cached.lock().await.take();
        }
    }
}

impl KeyPairSource {
    async fn get(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        let margin = ChronoDuration::minutes(REFRESH_MARGIN_MINUTES);
        if let Some(token) = cached.as_ref() {
            if token.expires_at - Utc::now() > margin {
                return Ok(token.bearer.clone());
            }
        }

        match self.exchange().await {
            Ok(token) => {
                self.refresh_failures.store(0, Ordering::Relaxed);
                let bearer = token.bearer.clone();
                *cached = Some(token);
                Ok(bearer)
            }
            Err(reason) => {
                let failures = self.refresh_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(failures, error = %reason, "scoped token refresh failed");
                if failures >= 2 {
                    Err(AuthError::Exhausted(reason))
                } else {
                    Err(AuthError::Refresh(reason))
                }
            }
        }
    }

    async fn exchange(&self) -> std::result::Result<CachedToken, String> {
        let assertion = self.mint_signed_token().map_err(|err| err.to_string())?;

        let response = self
            .http
            .post(&self.oauth_url)
            .form(&[
                ("grant_type", GRANT_TYPE_JWT_BEARER),
                ("scope", self.scope.as_str()),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|err| format!("oauth request failed: {err}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("oauth endpoint returned {status}: {body}"));
        }

        let parsed: ScopedTokenResponse = response
            .json()
            .await
            .map_err(|err| format!("invalid oauth response: {err}"))?;
        let lifetime = parsed.expires_in.unwrap_or(DEFAULT_SCOPED_LIFETIME_SECONDS);

        tracing::debug!(expires_in = lifetime, "scoped token obtained");
        Ok(CachedToken {
            bearer: parsed.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(lifetime),
        })
    }

    fn mint_signed_token(&self) -> Result<String> {
        let now = Utc::now();
        let claims = SignedTokenClaims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            iat: now.timestamp(),
            exp: (now + ChronoDuration::minutes(SIGNED_TOKEN_LIFETIME_MINUTES)).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .context("failed to sign token")
    }
}

/// `SHA256:` + base64 of the SHA-256 digest of the public key's DER-encoded
/// SubjectPublicKeyInfo. This is the form the server registers for the user.
pub fn public_key_fingerprint(private_key_pem: &str) -> Result<String> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .context("private key is not PKCS#8 PEM")?;
    let spki = private_key
        .to_public_key()
        .to_public_key_der()
        .context("failed to encode public key")?;
    let digest = Sha256::digest(spki.as_bytes());
    Ok(format!("SHA256:{}", BASE64.encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use std::sync::atomic::AtomicU64;
    use std::sync::{Arc, OnceLock};

    struct TestKey {
        private_pem: String,
        public_pem: String,
    }

    fn test_key() -> &'static TestKey {
        static KEY: OnceLock<TestKey> = OnceLock::new();
        KEY.get_or_init(|| {
            let mut rng = rand::rngs::OsRng;
            let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
            TestKey {
                private_pem: key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
                public_pem: key
                    .to_public_key()
                    .to_public_key_pem(LineEnding::LF)
                    .unwrap(),
            }
        })
    }

    fn key_pair_config(url: &str, key_path: &std::path::Path) -> Config {
        let document = serde_json::json!({
            "user": "pi_agent",
            "account": "myorg-account1",
            "url": url,
            "role": "ingest_role",
            "database": "sensors",
            "schema": "raw",
            "pipe": "thermal_pipe",
            "channel_name": "pi_channel_1",
            "private_key_file": key_path,
        });
        let path = key_path.parent().unwrap().join("config.json");
        std::fs::write(&path, document.to_string()).unwrap();
        Config::load(&path, Overrides::default()).unwrap()
    }

    #[derive(Clone)]
    struct OauthState {
        mints: Arc<AtomicU64>,
        expires_in: i64,
        fail_times: Arc<AtomicU64>,
    }

    #[derive(serde::Deserialize)]
    struct TokenForm {
        grant_type: String,
        scope: String,
        assertion: String,
    }

    async fn oauth_token(
        State(state): State<OauthState>,
        Form(form): Form<TokenForm>,
    ) -> Result<Json<serde_json::Value>, axum::http::StatusCode> {
        if state.fail_times.load(Ordering::SeqCst) > 0 {
            state.fail_times.fetch_sub(1, Ordering::SeqCst);
            return Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(form.grant_type, GRANT_TYPE_JWT_BEARER);
        assert!(form.scope.starts_with("SESSION:ROLE-ANY:INGEST_ROLE "));
        assert!(!form.assertion.is_empty());
        let minted = state.mints.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Json(serde_json::json!({
            "access_token": format!("scoped-{minted}"),
            "token_type": "Bearer",
            "expires_in": state.expires_in,
        })))
    }

    async fn spawn_oauth_server(state: OauthState) -> String {
        let app = Router::new()
            .route("/oauth/token", post(oauth_token))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn write_test_key(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("rsa_key.p8");
        std::fs::write(&path, &test_key().private_pem).unwrap();
        path
    }

    #[test]
    fn fingerprint_has_expected_shape() {
        let fingerprint = public_key_fingerprint(&test_key().private_pem).unwrap();
        assert!(fingerprint.starts_with("SHA256:"));
        // 32 digest bytes -> 44 base64 chars with padding.
        assert_eq!(fingerprint.len(), "SHA256:".len() + 44);
        // Deterministic for the same key.
        assert_eq!(
            fingerprint,
            public_key_fingerprint(&test_key().private_pem).unwrap()
        );
    }

    #[tokio::test]
    async fn signed_token_claims_verify_against_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = write_test_key(&dir);
        let config = key_pair_config("https://example.invalid", &key_path);
        let source = TokenSource::from_config(&config, reqwest::Client::new()).unwrap();

        let TokenSource::KeyPair(inner) = &source else {
            panic!("expected key-pair mode");
        };
        let token = inner.mint_signed_token().unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);
        let decoded = decode::<SignedTokenClaims>(
            &token,
            &DecodingKey::from_rsa_pem(test_key().public_pem.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.sub, "MYORG-ACCOUNT1.PI_AGENT");
        let fingerprint = public_key_fingerprint(&test_key().private_pem).unwrap();
        assert_eq!(
            decoded.claims.iss,
            format!("MYORG-ACCOUNT1.PI_AGENT.{fingerprint}")
        );
        assert_eq!(
            decoded.claims.exp - decoded.claims.iat,
            SIGNED_TOKEN_LIFETIME_MINUTES * 60
        );
    }

    #[tokio::test]
    async fn scoped_token_is_cached_until_margin() {
        let mints = Arc::new(AtomicU64::new(0));
        let base = spawn_oauth_server(OauthState {
            mints: mints.clone(),
            expires_in: 3600,
            fail_times: Arc::new(AtomicU64::new(0)),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let key_path = write_test_key(&dir);
        let config = key_pair_config(&base, &key_path);
        let source = TokenSource::from_config(&config, reqwest::Client::new()).unwrap();

        let first = source.get().await.unwrap();
        let second = source.get().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mints.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_inside_margin_is_reminted() {
        let mints = Arc::new(AtomicU64::new(0));
        // 100 s lifetime is inside the 5 min refresh margin, so every call
        // must mint a fresh scoped token.
        let base = spawn_oauth_server(OauthState {
            mints: mints.clone(),
            expires_in: 100,
            fail_times: Arc::new(AtomicU64::new(0)),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let key_path = write_test_key(&dir);
        let config = key_pair_config(&base, &key_path);
        let source = TokenSource::from_config(&config, reqwest::Client::new()).unwrap();

        let first = source.get().await.unwrap();
        let second = source.get().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(mints.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_refresh_drops_cached_token() {
        let mints = Arc::new(AtomicU64::new(0));
        let base = spawn_oauth_server(OauthState {
            mints: mints.clone(),
            expires_in: 3600,
            fail_times: Arc::new(AtomicU64::new(0)),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let key_path = write_test_key(&dir);
        let config = key_pair_config(&base, &key_path);
        let source = TokenSource::from_config(&config, reqwest::Client::new()).unwrap();

        let first = source.get().await.unwrap();
        source.force_refresh().await;
        let second = source.get().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(mints.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_consecutive_refresh_failure_is_fatal() {
        let base = spawn_oauth_server(OauthState {
            mints: Arc::new(AtomicU64::new(0)),
            expires_in: 3600,
            fail_times: Arc::new(AtomicU64::new(10)),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let key_path = write_test_key(&dir);
        let config = key_pair_config(&base, &key_path);
        let source = TokenSource::from_config(&config, reqwest::Client::new()).unwrap();

        let first = source.get().await.unwrap_err();
        assert!(!first.is_fatal());
        let second = source.get().await.unwrap_err();
        assert!(second.is_fatal());
    }

    #[test]
    fn static_bearer_never_refreshes() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let source = TokenSource::Static("my-pat".to_string());
        runtime.block_on(async {
            assert_eq!(source.get().await.unwrap(), "my-pat");
            source.force_refresh().await;
            assert_eq!(source.get().await.unwrap(), "my-pat");
        });
    }
}
