//! Session bearer tokens: thin wrappers around `vault_core::token::TokenMint`
//! bound to each user's own token key, with revocation via
//! `User.valid_tokens` (spec.md §4.6).

use std::sync::Arc;
use vault_core::metadata::{MetadataEngine, UserId};
use vault_core::token::{Token, TokenMint};
use vault_core::VaultError;

const SESSION_SCOPE: &str = "session";
const SESSION_TTL_MS: i64 = 2 * 60 * 60 * 1000;

/// Mints a session token for `user`, recording its hash in
/// `valid_tokens` so it can be revoked by logout without waiting for
/// natural expiry.
pub fn mint_session(metadata: &MetadataEngine, user: UserId, now_ms: i64) -> vault_core::VaultResult<String> {
    let u = metadata.user_by_id(user)?;
    let key = metadata.user_token_key(&u)?;
    let wire = TokenMint::mint(&key, Token::new(user, SESSION_SCOPE), now_ms, SESSION_TTL_MS)?;
    let hash = TokenMint::hash(&wire);
    metadata.update_user(user, |u| {
        u.valid_tokens.insert(hash.clone());
        Ok(())
    })?;
    Ok(base64_url(&wire))
}

/// Validates a bearer token: opens it under the named subject's token
/// key, checks the expiry window, and confirms it hasn't been revoked.
pub fn validate_session(metadata: &MetadataEngine, token: &str, now_ms: i64) -> vault_core::VaultResult<UserId> {
    let wire = unbase64_url(token).ok_or(VaultError::ValidationFailed)?;
    let subject = TokenMint::subject(&wire)?;
    let user = metadata.user_by_id(subject)?;
    let key = metadata.user_token_key(&user)?;
    let opened = TokenMint::decrypt(&key, &wire, now_ms)?;
    if opened.scope != SESSION_SCOPE {
        return Err(VaultError::ValidationFailed);
    }
    if !user.valid_tokens.contains(&TokenMint::hash(&wire)) {
        return Err(VaultError::ValidationFailed);
    }
    Ok(subject)
}

/// Revokes a single bearer token (logout).
pub fn revoke_session(metadata: &MetadataEngine, token: &str) -> vault_core::VaultResult<()> {
    let wire = unbase64_url(token).ok_or(VaultError::ValidationFailed)?;
    let subject = TokenMint::subject(&wire)?;
    let hash = TokenMint::hash(&wire);
    metadata.update_user(subject, |u| {
        u.valid_tokens.remove(&hash);
        Ok(())
    })?;
    Ok(())
}

fn base64_url(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD.encode(bytes)
}

fn unbase64_url(s: &str) -> Option<Vec<u8>> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD.decode(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vault_core::keyvault::MasterKey;
    use vault_core::storage::SecureStorage;

    fn engine() -> (tempfile::TempDir, MetadataEngine) {
        let dir = tempfile::tempdir().unwrap();
        let mk = MasterKey::generate();
        let storage = Arc::new(SecureStorage::open(dir.path(), Some(mk)).unwrap());
        (dir, MetadataEngine::new(storage))
    }

    #[test]
    fn mint_validate_and_revoke_round_trip() {
        let (_dir, meta) = engine();
        let user = meta
            .add_user("a@example.com", vec![], vec![], vec![], vec![], false, 0)
            .unwrap();

        let token = mint_session(&meta, user, 1_000).unwrap();
        assert_eq!(validate_session(&meta, &token, 1_500).unwrap(), user);

        revoke_session(&meta, &token).unwrap();
        assert!(validate_session(&meta, &token, 1_500).is_err());
    }
}
