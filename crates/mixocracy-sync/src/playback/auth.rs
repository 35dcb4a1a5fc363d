// Streaming-service token set: held in memory, persisted to the kv table so
// refreshes survive restarts.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CredentialsConfig;
use crate::db::Database;

const TOKENS_KEY: &str = "spotify_tokens";

/// Refresh this long before the service-side expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    pub fn new(access_token: String, refresh_token: Option<String>, expires_in_secs: i64) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

/// Body of a successful `grant_type=refresh_token` response.
#[derive(Debug, Deserialize)]
pub(crate) struct RefreshResponse {
    pub access_token: String,
    pub expires_in: i64,
    /// Rotated refresh token; absent means keep the old one.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

pub struct TokenStore {
    current: Mutex<Option<TokenSet>>,
    db: Option<Arc<Database>>,
}

impl TokenStore {
    /// In-memory store, for tests.
    pub fn in_memory(initial: Option<TokenSet>) -> Self {
        Self {
            current: Mutex::new(initial),
            db: None,
        }
    }

    /// Load persisted tokens, falling back to `credentials.toml` seeds.
    pub fn load(db: Arc<Database>, seed: &CredentialsConfig) -> Self {
        let persisted = match db.load_state(TOKENS_KEY) {
            Ok(Some(value)) => match serde_json::from_value::<TokenSet>(value) {
                Ok(tokens) => Some(tokens),
                Err(e) => {
                    warn!("Discarding unreadable stored tokens: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read stored tokens: {}", e);
                None
            }
        };

        let initial = persisted.or_else(|| {
            seed.spotify_refresh_token.as_ref().map(|refresh| {
                info!("Seeding streaming tokens from credentials.toml");
                // Seeded access tokens have unknown age; expire them so the
                // first call refreshes.
                TokenSet {
                    access_token: seed.spotify_access_token.clone().unwrap_or_default(),
                    refresh_token: Some(refresh.clone()),
                    expires_at: Utc::now(),
                }
            })
        });

        Self {
            current: Mutex::new(initial),
            db: Some(db),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TokenSet>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> Option<TokenSet> {
        self.lock().clone()
    }

    /// Current access token if present and not about to expire.
    pub fn fresh_access_token(&self) -> Option<String> {
        self.lock()
            .as_ref()
            .filter(|t| !t.is_expired_at(Utc::now()) && !t.access_token.is_empty())
            .map(|t| t.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.lock().as_ref().and_then(|t| t.refresh_token.clone())
    }

    /// Replace the token set and persist it.
    pub fn set(&self, tokens: TokenSet) {
        if let Some(db) = &self.db {
            match serde_json::to_value(&tokens) {
                Ok(value) => {
                    if let Err(e) = db.save_state(TOKENS_KEY, &value) {
                        warn!("Failed to persist tokens: {}", e);
                    }
                }
                Err(e) => warn!("Failed to serialize tokens: {}", e),
            }
        }
        *self.lock() = Some(tokens);
    }

    /// Apply a refresh response, keeping the old refresh token when the
    /// service did not rotate it.
    pub(crate) fn apply_refresh(&self, response: RefreshResponse) -> TokenSet {
        let refresh_token = response.refresh_token.or_else(|| self.refresh_token());
        let tokens = TokenSet::new(response.access_token, refresh_token, response.expires_in);
        self.set(tokens.clone());
        tokens
    }

    /// Forget all tokens (re-authentication required).
    pub fn clear(&self) {
        if let Some(db) = &self.db {
            if let Err(e) = db.delete_state(TOKENS_KEY) {
                warn!("Failed to delete stored tokens: {}", e);
            }
        }
        *self.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_includes_margin() {
        let t = TokenSet::new("a".into(), None, 3600);
        assert!(!t.is_expired_at(Utc::now()));
        assert!(t.is_expired_at(Utc::now() + Duration::seconds(3600 - 30)));
    }

    #[test]
    fn seeded_tokens_need_refresh() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let seed = CredentialsConfig {
            spotify_access_token: Some("stale".into()),
            spotify_refresh_token: Some("r1".into()),
        };
        let store = TokenStore::load(db, &seed);
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
        assert!(store.fresh_access_token().is_none());
    }

    #[test]
    fn persisted_tokens_win_over_seed() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let first = TokenStore::load(db.clone(), &CredentialsConfig::default());
        first.set(TokenSet::new("live".into(), Some("r2".into()), 3600));

        let seed = CredentialsConfig {
            spotify_access_token: None,
            spotify_refresh_token: Some("r1".into()),
        };
        let second = TokenStore::load(db, &seed);
        assert_eq!(second.fresh_access_token().as_deref(), Some("live"));
        assert_eq!(second.refresh_token().as_deref(), Some("r2"));
    }

    #[test]
    fn refresh_keeps_unrotated_refresh_token() {
        let store = TokenStore::in_memory(Some(TokenSet::new("old".into(), Some("r".into()), 0)));
        let tokens = store.apply_refresh(RefreshResponse {
            access_token: "new".into(),
            expires_in: 3600,
            refresh_token: None,
        });
        assert_eq!(tokens.refresh_token.as_deref(), Some("r"));
        assert_eq!(store.fresh_access_token().as_deref(), Some("new"));
    }

    #[test]
    fn clear_removes_persisted_tokens() {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let store = TokenStore::load(db.clone(), &CredentialsConfig::default());
        store.set(TokenSet::new("a".into(), None, 3600));
        store.clear();
        assert!(store.get().is_none());
        assert!(db.load_state(TOKENS_KEY).unwrap().is_none());
    }
}
