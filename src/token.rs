//! Upload-token lifecycle: issue, verify, revoke.
//!
//! Tokens are a signed claims blob, not a vendored JWT implementation —
//! `base64url(claims json) + "." + base64url(hmac_sha256(claims json))`,
//! the same shape `tinyzkp_api`'s session tokens use (sign-then-compare,
//! no external JWT crate). The bearer value handed to the client is hashed
//! with `argon2id` before it touches the store, exactly like that binary's
//! password hashing — we just hash a token instead of a password.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::clock::Clock;
use crate::store::{Store, StoreError, UploadToken};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token not found")]
    NotFound,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("origin does not match token's allowed origin")]
    OriginMismatch,
    #[error("token's privacy budget is exhausted")]
    BudgetExceeded,
    #[error("hashing error: {0}")]
    Hash(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize, Deserialize)]
struct Claims {
    tid: i64,
    site_id: String,
    allowed_origin: String,
    jti: String,
    iat: i64,
    exp: i64,
}

fn sign(secret: &[u8], payload_b64: &str) -> Result<String, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| TokenError::Hash(e.to_string()))?;
    mac.update(payload_b64.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

fn new_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Mints a token for `site_id`, persists the placeholder row, then the
/// argon2id hash of the returned bearer value. Returns the bearer token the
/// caller must hand to the client — it is never recoverable from the store.
pub async fn issue_token<S: Store>(
    store: &S,
    clock: &dyn Clock,
    secret: &[u8],
    site_id: &str,
    allowed_origin: &str,
    sampling_rate: f64,
    epsilon_budget: Option<f64>,
    ttl_seconds: i64,
) -> Result<(String, i64), TokenError> {
    let now = clock.now();
    let jti = new_jti();
    let expires_at = now + chrono::Duration::seconds(ttl_seconds);

    let id = store
        .insert_placeholder_token(
            site_id,
            &jti,
            allowed_origin,
            sampling_rate,
            epsilon_budget,
            now,
            expires_at,
        )
        .await?;

    let claims = Claims {
        tid: id,
        site_id: site_id.to_string(),
        allowed_origin: allowed_origin.to_string(),
        jti: jti.clone(),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };
    let payload_json = serde_json::to_vec(&claims).map_err(|e| TokenError::Hash(e.to_string()))?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);
    let sig_b64 = sign(secret, &payload_b64)?;
    let token = format!("{payload_b64}.{sig_b64}");

    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let hash = Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| TokenError::Hash(e.to_string()))?
        .to_string();
    store.set_token_hash(id, &hash).await?;

    Ok((token, id))
}

/// Verifies a bearer token against its signature, expiry, revocation status,
/// requesting origin, and (if enabled) remaining privacy budget.
pub async fn verify_token<S: Store>(
    store: &S,
    clock: &dyn Clock,
    secret: &[u8],
    enforce_budget: bool,
    token: &str,
    request_origin: &str,
) -> Result<UploadToken, TokenError> {
    let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;

    let expected_sig = sign(secret, payload_b64)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| TokenError::Hash(e.to_string()))?;
    mac.update(payload_b64.as_bytes());
    let provided = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenError::Malformed)?;
    mac.verify_slice(&provided).map_err(|_| TokenError::BadSignature)?;
    let _ = expected_sig;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let claims: Claims = serde_json::from_slice(&payload_json).map_err(|_| TokenError::Malformed)?;

    let row = match store.find_token_by_jti(&claims.jti).await? {
        Some(row) => row,
        None => find_by_legacy_hash_scan(store, token).await?,
    };

    let now = clock.now();
    if row.is_revoked() {
        return Err(TokenError::Revoked);
    }
    if row.is_expired(now) {
        return Err(TokenError::Expired);
    }
    if !origin_matches(&row.allowed_origin, request_origin) {
        return Err(TokenError::OriginMismatch);
    }
    if enforce_budget && row.budget_exhausted() {
        return Err(TokenError::BudgetExceeded);
    }

    Ok(row)
}

/// Tokens minted before `jti` indexing existed have no fast path; fall back
/// to a linear argon2 comparison over active tokens. Rare and slow by
/// design — it exists purely so old tokens keep working until they expire.
async fn find_by_legacy_hash_scan<S: Store>(
    store: &S,
    token: &str,
) -> Result<UploadToken, TokenError> {
    let candidates = store.list_active_tokens().await?;
    for candidate in candidates {
        if candidate.token_hash.is_empty() {
            continue;
        }
        let Ok(parsed) = PasswordHash::new(&candidate.token_hash) else {
            continue;
        };
        if Argon2::default()
            .verify_password(token.as_bytes(), &parsed)
            .is_ok()
        {
            return Ok(candidate);
        }
    }
    Err(TokenError::NotFound)
}

/// `*` is the only wildcard, matching at most one contiguous gap — enough
/// for `https://*.example.com` style allow-listing without pulling in a
/// glob crate for one operator.
fn origin_matches(allowed: &str, actual: &str) -> bool {
    match allowed.split_once('*') {
        None => allowed == actual,
        Some((prefix, suffix)) => {
            actual.len() >= prefix.len() + suffix.len()
                && actual.starts_with(prefix)
                && actual.ends_with(suffix)
        }
    }
}

pub async fn revoke_token<S: Store>(
    store: &S,
    clock: &dyn Clock,
    token_id: i64,
) -> Result<(), TokenError> {
    store.revoke_token(token_id, clock.now()).await?;
    Ok(())
}

pub async fn revoke_tokens_for_site<S: Store>(
    store: &S,
    clock: &dyn Clock,
    site_id: &str,
) -> Result<u64, TokenError> {
    Ok(store.revoke_tokens_for_site(site_id, clock.now()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MockStore;

    const SECRET: &[u8] = b"test-secret-key-at-least-32-bytes";

    #[tokio::test]
    async fn issue_then_verify_round_trips() {
        let store = MockStore::new();
        let clock = SystemClock;
        let (token, _id) = issue_token(
            &store,
            &clock,
            SECRET,
            "site-a",
            "https://example.com",
            1.0,
            Some(5.0),
            900,
        )
        .await
        .unwrap();

        let row = verify_token(&store, &clock, SECRET, true, &token, "https://example.com")
            .await
            .unwrap();
        assert_eq!(row.site_id, "site-a");
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let store = MockStore::new();
        let clock = SystemClock;
        let (token, _id) = issue_token(
            &store,
            &clock,
            SECRET,
            "site-a",
            "https://example.com",
            1.0,
            None,
            900,
        )
        .await
        .unwrap();
        let mut tampered = token.clone();
        tampered.push('x');

        let err = verify_token(&store, &clock, SECRET, true, &tampered, "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::BadSignature | TokenError::Malformed));
    }

    #[tokio::test]
    async fn revoked_token_is_rejected() {
        let store = MockStore::new();
        let clock = SystemClock;
        let (token, id) = issue_token(
            &store,
            &clock,
            SECRET,
            "site-a",
            "https://example.com",
            1.0,
            None,
            900,
        )
        .await
        .unwrap();
        revoke_token(&store, &clock, id).await.unwrap();

        let err = verify_token(&store, &clock, SECRET, true, &token, "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Revoked));
    }

    #[tokio::test]
    async fn origin_mismatch_is_rejected() {
        let store = MockStore::new();
        let clock = SystemClock;
        let (token, _id) = issue_token(
            &store,
            &clock,
            SECRET,
            "site-a",
            "https://example.com",
            1.0,
            None,
            900,
        )
        .await
        .unwrap();

        let err = verify_token(&store, &clock, SECRET, true, &token, "https://evil.example")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::OriginMismatch));
    }

    #[tokio::test]
    async fn exhausted_budget_is_rejected_when_enforced() {
        let store = MockStore::new();
        let clock = SystemClock;
        let (token, _id) = issue_token(
            &store,
            &clock,
            SECRET,
            "site-a",
            "https://example.com",
            1.0,
            Some(1.0),
            900,
        )
        .await
        .unwrap();
        // Drain the budget directly via the store, as the collector would
        // after processing a batch that used up the token's allowance.
        let row = store.find_token_by_jti(&extract_jti(&token)).await.unwrap().unwrap();
        store
            .record_token_epsilon_consumed(&row.jti, 1.0)
            .await
            .unwrap();

        let err = verify_token(&store, &clock, SECRET, true, &token, "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::BudgetExceeded));
    }

    fn extract_jti(token: &str) -> String {
        let (payload_b64, _) = token.split_once('.').unwrap();
        let json = URL_SAFE_NO_PAD.decode(payload_b64).unwrap();
        let claims: Claims = serde_json::from_slice(&json).unwrap();
        claims.jti
    }

    #[test]
    fn origin_matches_exact_and_wildcard() {
        assert!(origin_matches("https://example.com", "https://example.com"));
        assert!(!origin_matches("https://example.com", "https://evil.com"));
        assert!(origin_matches("https://*.example.com", "https://app.example.com"));
        assert!(!origin_matches("https://*.example.com", "https://example.com"));
    }
}
