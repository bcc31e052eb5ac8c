use crate::config::AuthConfig;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Authenticated caller attached to the request. `user_id` keys the
/// rate-limit and concurrency gates; `token_hash` keys usage records.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub user_id: String,
    pub token_hash: String,
}

impl ClientIdentity {
    fn from_token(user_id: String, token: &str) -> Self {
        Self {
            user_id,
            token_hash: hex::encode(Sha256::digest(token.as_bytes())),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            token_hash: "anonymous".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)] // exp is enforced by jsonwebtoken's validation
    exp: usize,
    #[serde(default)]
    jti: Option<String>,
}

/// Validates client bearer JWTs (HS256) and static API keys. With
/// neither configured the proxy runs open and every caller is
/// anonymous.
pub struct TokenVerifier {
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    api_keys: HashSet<String>,
    revoked: HashSet<String>,
}

impl TokenVerifier {
    pub fn new(cfg: AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            decoding_key: cfg
                .jwt_secret
                .as_deref()
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            validation,
            api_keys: cfg.api_keys.into_iter().collect(),
            revoked: cfg.revoked_token_ids.into_iter().collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.decoding_key.is_none() && self.api_keys.is_empty()
    }

    pub fn verify(&self, token: &str) -> Option<ClientIdentity> {
        if let Some(key) = &self.decoding_key {
            if let Ok(data) = jsonwebtoken::decode::<Claims>(token, key, &self.validation) {
                if let Some(jti) = &data.claims.jti {
                    if self.revoked.contains(jti) {
                        warn!(jti = %jti, "Rejected revoked token");
                        return None;
                    }
                }
                return Some(ClientIdentity::from_token(data.claims.sub, token));
            }
        }

        if self.api_keys.contains(token) {
            let hash = hex::encode(Sha256::digest(token.as_bytes()));
            return Some(ClientIdentity {
                user_id: format!("key:{}", &hash[..16]),
                token_hash: hash,
            });
        }

        None
    }
}

pub async fn auth_middleware(
    State(verifier): State<Arc<TokenVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if verifier.is_open() {
        request.extensions_mut().insert(ClientIdentity::anonymous());
        return Ok(next.run(request).await);
    }

    let token = {
        let auth_header = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        match auth_header {
            Some(h) if h.starts_with("Bearer ") => h.strip_prefix("Bearer ").unwrap().to_string(),
            _ => {
                if let Some(key) = request
                    .headers()
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                {
                    key.to_string()
                } else {
                    warn!("Missing credentials in request");
                    return Err(StatusCode::UNAUTHORIZED);
                }
            }
        }
    };

    match verifier.verify(&token) {
        Some(identity) => {
            request.extensions_mut().insert(identity);
            Ok(next.run(request).await)
        }
        None => {
            warn!(token = %mask_token(&token), "Rejected client token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        jti: Option<String>,
    }

    fn make_jwt(secret: &str, sub: &str, exp_offset_secs: i64, jti: Option<&str>) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset_secs) as usize;
        encode(
            &Header::default(),
            &TestClaims {
                sub: sub.to_string(),
                exp,
                jti: jti.map(String::from),
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn verifier(secret: Option<&str>, api_keys: &[&str], revoked: &[&str]) -> TokenVerifier {
        TokenVerifier::new(AuthConfig {
            jwt_secret: secret.map(String::from),
            api_keys: api_keys.iter().map(|k| k.to_string()).collect(),
            revoked_token_ids: revoked.iter().map(|j| j.to_string()).collect(),
        })
    }

    #[test]
    fn valid_jwt_yields_the_subject() {
        let v = verifier(Some("secret"), &[], &[]);
        let token = make_jwt("secret", "user-42", 3600, None);

        let identity = v.verify(&token).unwrap();
        assert_eq!(identity.user_id, "user-42");
        assert_eq!(identity.token_hash.len(), 64);
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let v = verifier(Some("secret"), &[], &[]);
        let token = make_jwt("secret", "user-42", -3600, None);
        assert!(v.verify(&token).is_none());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let v = verifier(Some("secret"), &[], &[]);
        let token = make_jwt("other-secret", "user-42", 3600, None);
        assert!(v.verify(&token).is_none());
    }

    #[test]
    fn revoked_jti_is_rejected() {
        let v = verifier(Some("secret"), &[], &["revoked-1"]);

        let live = make_jwt("secret", "user-42", 3600, Some("live-1"));
        assert!(v.verify(&live).is_some());

        let revoked = make_jwt("secret", "user-42", 3600, Some("revoked-1"));
        assert!(v.verify(&revoked).is_none());
    }

    #[test]
    fn static_api_key_is_accepted() {
        let v = verifier(None, &["sk-client-1"], &[]);

        let identity = v.verify("sk-client-1").unwrap();
        assert!(identity.user_id.starts_with("key:"));
        assert!(v.verify("sk-unknown").is_none());
    }

    #[test]
    fn same_key_maps_to_stable_user_id() {
        let v = verifier(None, &["sk-client-1"], &[]);
        let a = v.verify("sk-client-1").unwrap();
        let b = v.verify("sk-client-1").unwrap();
        assert_eq!(a.user_id, b.user_id);
        assert_eq!(a.token_hash, b.token_hash);
    }

    #[test]
    fn open_mode_without_credentials() {
        let v = verifier(None, &[], &[]);
        assert!(v.is_open());

        let v = verifier(Some("s"), &[], &[]);
        assert!(!v.is_open());
    }

    #[test]
    fn mask_token_hides_the_middle() {
        assert_eq!(mask_token("12345678"), "***");
        assert_eq!(mask_token("sk-ant-api-key-xxxxx"), "sk-a...xxxx");
    }
}
