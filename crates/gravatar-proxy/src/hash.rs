//! Identifier to content hash resolution

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const HASH_LEN: usize = 32;

/// MD5 hex digest of a normalized email address; the cache key.
///
/// Collisions are not handled: two emails with the same digest share an
/// avatar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a hash supplied by a client. Accepts either case; anything that
    /// is not 32 hex digits is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == HASH_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Hash an email after lowercasing and trimming it.
    /// Returns `None` if nothing is left after normalization.
    pub fn from_email(email: &str) -> Option<Self> {
        let normalized = email.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }
        Some(Self(hex::encode(Md5::digest(normalized.as_bytes()))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid content hash: {value}"))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// A user record as handed over by the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecord {
    pub id: u64,
    pub email: Option<String>,
}

/// Anything the host may ask for an avatar by
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// Numeric account reference, resolved through the [`UserDirectory`]
    Account(u64),
    /// A user record carrying its own email
    User(UserRecord),
    /// A raw email address
    Email(String),
}

impl From<&str> for Identifier {
    /// Purely numeric strings are account references, everything else is an email
    fn from(s: &str) -> Self {
        match s.trim().parse::<u64>() {
            Ok(id) => Identifier::Account(id),
            Err(_) => Identifier::Email(s.to_string()),
        }
    }
}

impl From<UserRecord> for Identifier {
    fn from(user: UserRecord) -> Self {
        Identifier::User(user)
    }
}

/// Host collaborator mapping account references to email addresses
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn email_for(&self, account_id: u64) -> Option<String>;
}

/// A [`UserDirectory`] backed by a fixed map
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserDirectory {
    emails: HashMap<u64, String>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, account_id: u64, email: impl Into<String>) -> Self {
        self.emails.insert(account_id, email.into());
        self
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn email_for(&self, account_id: u64) -> Option<String> {
        self.emails.get(&account_id).cloned()
    }
}

/// Derives content hashes from identifiers
#[derive(Clone)]
pub struct HashResolver {
    directory: Arc<dyn UserDirectory>,
}

impl HashResolver {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    /// Resolve an identifier to its content hash, or `None` if no usable
    /// email can be found for it.
    pub async fn resolve(&self, identifier: &Identifier) -> Option<ContentHash> {
        let email = match identifier {
            Identifier::Account(id) => {
                let email = self.directory.email_for(*id).await;
                if email.is_none() {
                    debug!(account_id = id, "No email on file for account");
                }
                email?
            }
            Identifier::User(user) => user.email.clone()?,
            Identifier::Email(email) => email.clone(),
        };

        ContentHash::from_email(&email)
    }
}

impl fmt::Debug for HashResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashResolver").finish_non_exhaustive()
    }
}
