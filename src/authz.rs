//! Gatekeeping for destructive operations.
//!
//! Anonymous comments are removable only with the delete token minted at
//! creation. Protocol pointers are removed by `(page, author_id, record_key)`
//! with no identity proof: the caller is trusted to control `author_id`, and
//! any ownership check (e.g. verifying a signed request from the author's
//! data server) belongs to the transport in front of this service. That is a
//! trust boundary, not something this module tries to close.

use rand::RngCore;

use crate::error::ApiError;
use crate::models::Id;
use crate::repo::Repo;

const TOKEN_BYTES: usize = 32;

/// Fresh unguessable delete token (256 bits, hex encoded).
pub fn new_delete_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Compare tokens without short-circuiting on the first differing byte.
pub fn tokens_match(stored: &str, supplied: &str) -> bool {
    let (a, b) = (stored.as_bytes(), supplied.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerKey {
    pub page: String,
    pub author_id: String,
    pub record_key: String,
}

/// Remove an anonymous comment. "No such id" and "wrong token" both come back
/// as [`ApiError::Unauthorized`].
pub async fn delete_anonymous(repo: &dyn Repo, id: Option<Id>, token: Option<&str>) -> Result<(), ApiError> {
    let (id, token) = match (id, token.filter(|t| !t.is_empty())) {
        (Some(id), Some(token)) => (id, token),
        (id, token) => {
            let mut missing = Vec::new();
            if id.is_none() { missing.push("id"); }
            if token.is_none() { missing.push("token"); }
            return Err(ApiError::MissingFields(missing));
        }
    };
    if repo.delete_anonymous(id, token).await? {
        tracing::info!(id, "anonymous comment deleted");
        Ok(())
    } else {
        tracing::debug!(id, "anonymous delete refused");
        Err(ApiError::Unauthorized)
    }
}

/// Pure lookup-and-remove; see the module docs for the trust model.
pub async fn delete_pointer(repo: &dyn Repo, key: &PointerKey) -> Result<u64, ApiError> {
    let removed = repo.delete_pointer(&key.page, &key.author_id, &key.record_key).await?;
    tracing::info!(page = %key.page, author = %key.author_id, removed, "pointer delete");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_hex() {
        let a = new_delete_token();
        let b = new_delete_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_comparison() {
        assert!(tokens_match("abcd", "abcd"));
        assert!(!tokens_match("abcd", "abce"));
        assert!(!tokens_match("abcd", "abc"));
        assert!(!tokens_match("", "a"));
    }
}
