use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use podtrack_contracts::{Actor, Role};
use serde_json::Value;
use tokio::sync::RwLock;

pub const ACTOR_ID_HEADER: &str = "x-podtrack-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-podtrack-actor-role";
pub const LOCAL_AUTH_SECRET_HEADER: &str = "x-podtrack-local-auth-secret";

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: Option<String>,
    pub jwks_url: Option<String>,
    pub jwks_json: Option<String>,
    pub jwks_timeout: Duration,
    pub jwks_refresh_ttl: Duration,
    pub clock_skew: Duration,
    pub actor_id_claim: String,
    pub role_claim: String,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            code: "ERR_UNAUTHORIZED",
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.code == "ERR_AUTH_UNAVAILABLE"
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Trusted-header identification for local and test deployments. When a
/// shared secret is configured every request must present it.
pub fn authenticate_local(
    headers: &HeaderMap,
    shared_secret: Option<&str>,
) -> Result<Actor, AuthError> {
    if let Some(expected) = shared_secret {
        let provided = header_str(headers, LOCAL_AUTH_SECRET_HEADER)
            .ok_or_else(|| AuthError::unauthorized("missing local auth secret"))?;
        if provided != expected {
            return Err(AuthError::unauthorized("invalid local auth secret"));
        }
    }

    let actor_id = header_str(headers, ACTOR_ID_HEADER)
        .ok_or_else(|| AuthError::unauthorized(format!("missing {} header", ACTOR_ID_HEADER)))?;
    let raw_role = header_str(headers, ACTOR_ROLE_HEADER)
        .ok_or_else(|| AuthError::unauthorized(format!("missing {} header", ACTOR_ROLE_HEADER)))?;
    let role = Role::parse(raw_role)
        .ok_or_else(|| AuthError::unauthorized(format!("unknown role `{}`", raw_role)))?;

    Ok(Actor {
        actor_id: actor_id.to_string(),
        role,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct OidcAuthenticator {
    config: OidcConfig,
    http: reqwest::Client,
    jwks: Arc<RwLock<JwksCache>>,
}

#[derive(Debug)]
struct JwksCache {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

impl OidcAuthenticator {
    pub async fn new(config: OidcConfig) -> Result<Self, AuthError> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc issuer must be non-empty".to_string(),
            });
        }

        if config.actor_id_claim.trim().is_empty() || config.role_claim.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc actor_id_claim and role_claim must be non-empty".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.jwks_timeout)
            .build()
            .map_err(|_| AuthError {
                code: "ERR_INTERNAL",
                message: "failed to initialize oidc http client".to_string(),
            })?;

        let mut cache = JwksCache {
            jwks: None,
            fetched_at: None,
        };
        cache.refresh(&http, &config).await?;

        Ok(Self {
            config,
            http,
            jwks: Arc::new(RwLock::new(cache)),
        })
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Actor, AuthError> {
        let token = bearer_token(headers)?;

        let header =
            decode_header(&token).map_err(|_| AuthError::unauthorized("invalid JWT header"))?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError::unauthorized(
                "unsupported JWT alg (expected RS256)",
            ));
        }

        let kid = header
            .kid
            .ok_or_else(|| AuthError::unauthorized("JWT header missing kid"))?;

        let decoding_key = self.decoding_key_for_kid(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(std::slice::from_ref(&self.config.issuer));
        if let Some(audience) = self.config.audience.as_ref() {
            validation.set_audience(std::slice::from_ref(audience));
        }
        validation.leeway = self.config.clock_skew.as_secs();

        let decoded = decode::<Value>(&token, &decoding_key, &validation)
            .map_err(|_| AuthError::unauthorized("JWT validation failed"))?;

        let claims = decoded.claims;
        let actor_id = claim_string(&claims, &self.config.actor_id_claim)?;
        let role = claim_role(&claims, &self.config.role_claim)?;

        Ok(Actor { actor_id, role })
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.jwks.read().await;
            if let Some(jwk) = cache.jwk_for_kid(kid) {
                return DecodingKey::from_jwk(jwk)
                    .map_err(|_| AuthError::unauthorized("failed to parse JWK decoding key"));
            }
        }

        {
            let mut cache = self.jwks.write().await;
            let refresh_needed = cache
                .fetched_at
                .is_none_or(|t| t.elapsed() > self.config.jwks_refresh_ttl);
            if refresh_needed {
                cache.refresh(&self.http, &self.config).await?;
            }

            if let Some(jwk) = cache.jwk_for_kid(kid) {
                return DecodingKey::from_jwk(jwk)
                    .map_err(|_| AuthError::unauthorized("failed to parse JWK decoding key"));
            }
        }

        Err(AuthError::unauthorized("JWT kid not found in JWKS"))
    }
}

impl JwksCache {
    fn jwk_for_kid(&self, kid: &str) -> Option<&jsonwebtoken::jwk::Jwk> {
        self.jwks.as_ref()?.find(kid)
    }

    async fn refresh(
        &mut self,
        http: &reqwest::Client,
        config: &OidcConfig,
    ) -> Result<(), AuthError> {
        let jwks = if let Some(jwks_json) = config.jwks_json.as_ref() {
            serde_json::from_str::<JwkSet>(jwks_json).map_err(|_| AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "PODTRACK_OIDC_JWKS_JSON is not valid JWKS JSON".to_string(),
            })?
        } else if let Some(url) = config.jwks_url.as_ref() {
            http.get(url)
                .send()
                .await
                .map_err(|_| AuthError {
                    code: "ERR_AUTH_UNAVAILABLE",
                    message: "failed to fetch JWKS".to_string(),
                })?
                .error_for_status()
                .map_err(|_| AuthError {
                    code: "ERR_AUTH_UNAVAILABLE",
                    message: "JWKS endpoint returned non-success status".to_string(),
                })?
                .json::<JwkSet>()
                .await
                .map_err(|_| AuthError {
                    code: "ERR_AUTH_UNAVAILABLE",
                    message: "failed to parse JWKS JSON".to_string(),
                })?
        } else {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc requires jwks_url or jwks_json".to_string(),
            });
        };

        self.jwks = Some(jwks);
        self.fetched_at = Some(Instant::now());
        Ok(())
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::unauthorized("missing Authorization header"))?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| AuthError::unauthorized("Authorization must be a Bearer token"))?;

    if token.trim().is_empty() {
        return Err(AuthError::unauthorized("Bearer token is empty"));
    }

    Ok(token.to_string())
}

fn claim_string(claims: &Value, claim: &str) -> Result<String, AuthError> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            AuthError::unauthorized(format!(
                "required claim `{}` is missing or not a string",
                claim
            ))
        })
}

/// The role claim may be a string or an array of strings. Unrecognised
/// entries are ignored; exactly one distinct known role must remain.
fn claim_role(claims: &Value, claim: &str) -> Result<Role, AuthError> {
    let raw = match claims.get(claim) {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str()).collect(),
        _ => {
            return Err(AuthError::unauthorized(format!(
                "claim `{}` must be a string or a string array",
                claim
            )));
        }
    };

    let mut roles = raw.into_iter().filter_map(Role::parse).collect::<Vec<_>>();
    roles.sort_by_key(|r| r.as_str());
    roles.dedup();

    match roles.as_slice() {
        [role] => Ok(*role),
        [] => Err(AuthError::unauthorized(format!(
            "claim `{}` carries no known role",
            claim
        ))),
        _ => Err(AuthError::unauthorized(format!(
            "claim `{}` carries more than one role",
            claim
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in pairs {
            out.insert(*name, value.parse().expect("header value must parse"));
        }
        out
    }

    #[test]
    fn bearer_token_rejects_missing_header() {
        let headers = HeaderMap::new();
        let err = bearer_token(&headers).unwrap_err();
        assert_eq!(err.code, "ERR_UNAUTHORIZED");
    }

    #[test]
    fn local_auth_reads_actor_headers() {
        let actor = authenticate_local(
            &headers(&[(ACTOR_ID_HEADER, " u1 "), (ACTOR_ROLE_HEADER, "priority")]),
            None,
        )
        .expect("local auth should succeed");
        assert_eq!(actor.actor_id, "u1");
        assert_eq!(actor.role, Role::Priority);
    }

    #[test]
    fn local_auth_requires_identity_and_known_role() {
        let err = authenticate_local(&headers(&[(ACTOR_ROLE_HEADER, "ADMIN")]), None).unwrap_err();
        assert_eq!(err.code, "ERR_UNAUTHORIZED");

        let err = authenticate_local(&headers(&[(ACTOR_ID_HEADER, "u1")]), None).unwrap_err();
        assert_eq!(err.code, "ERR_UNAUTHORIZED");

        let err = authenticate_local(
            &headers(&[(ACTOR_ID_HEADER, "u1"), (ACTOR_ROLE_HEADER, "OWNER")]),
            None,
        )
        .unwrap_err();
        assert!(err.message.contains("OWNER"));
    }

    #[test]
    fn local_auth_enforces_shared_secret_when_configured() {
        let base = [(ACTOR_ID_HEADER, "u1"), (ACTOR_ROLE_HEADER, "ADMIN")];
        assert!(authenticate_local(&headers(&base), Some("s3cret")).is_err());

        let wrong = [base[0], base[1], (LOCAL_AUTH_SECRET_HEADER, "nope")];
        assert!(authenticate_local(&headers(&wrong), Some("s3cret")).is_err());

        let right = [base[0], base[1], (LOCAL_AUTH_SECRET_HEADER, "s3cret")];
        assert!(authenticate_local(&headers(&right), Some("s3cret")).is_ok());
    }

    #[test]
    fn claim_role_accepts_string_and_array() {
        let claims = serde_json::json!({
            "role": "super_admin",
            "groups": ["support", "ADMIN", "admin"],
            "mixed": ["ADMIN", "REGULAR"],
            "none": ["support"],
            "number": 3,
        });

        assert_eq!(claim_role(&claims, "role").unwrap(), Role::SuperAdmin);
        assert_eq!(claim_role(&claims, "groups").unwrap(), Role::Admin);
        assert!(claim_role(&claims, "mixed").is_err());
        assert!(claim_role(&claims, "none").is_err());
        assert!(claim_role(&claims, "number").is_err());
        assert!(claim_role(&claims, "missing").is_err());
    }
}
