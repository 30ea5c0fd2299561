use base64::{Engine, engine::general_purpose::STANDARD};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use crate::registry::{Entity, Identity, IdentityRegistry, Record};
use crate::views::{Persistent, SerializationProfile};

/// AuthLevel
///
/// The ordered privilege ranks gating route access: `None < User < Moderator < Admin`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthLevel {
    /// Anonymous. Creating an account only needs this.
    #[default]
    None,
    /// A signed-in account.
    User,
    /// May edit user data, but not admin data.
    Moderator,
    /// Super-user.
    Admin,
}

impl AuthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthLevel::None => "NONE",
            AuthLevel::User => "USER",
            AuthLevel::Moderator => "MODERATOR",
            AuthLevel::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(AuthLevel::None),
            "USER" => Ok(AuthLevel::User),
            "MODERATOR" => Ok(AuthLevel::Moderator),
            "ADMIN" => Ok(AuthLevel::Admin),
            other => Err(format!("unknown authentication level `{other}`")),
        }
    }
}

/// Credential
///
/// The login data of one account: email, bcrypt hash of the password and the level it grants.
/// The hash is persisted in snapshots only and never rendered by an API view.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    id: Identity,
    email: String,
    secret: Option<String>,
    level: AuthLevel,
}

impl Credential {
    /// Creates a `User`-level credential, hashing `password` with the given bcrypt cost.
    pub fn new(email: &str, password: &str, cost: u32) -> Result<Self, bcrypt::BcryptError> {
        let mut credential = Self {
            id: 0,
            email: email.to_string(),
            secret: None,
            level: AuthLevel::User,
        };
        credential.change_password(password, cost)?;
        Ok(credential)
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn level(&self) -> AuthLevel {
        self.level
    }

    pub fn set_level(&mut self, level: AuthLevel) {
        self.level = level;
    }

    /// Re-hashes with a fresh salt.
    pub fn change_password(&mut self, password: &str, cost: u32) -> Result<(), bcrypt::BcryptError> {
        self.secret = Some(bcrypt::hash(password, cost)?);
        Ok(())
    }

    /// True when `email` matches exactly and `password` verifies against the stored hash.
    pub fn authenticate(&self, email: &str, password: &str) -> bool {
        match &self.secret {
            Some(hash) => self.email == email && bcrypt::verify(password, hash).unwrap_or(false),
            None => false,
        }
    }
}

impl Entity for Credential {
    fn identity(&self) -> Identity {
        self.id
    }

    fn set_identity(&mut self, id: Identity) {
        self.id = id;
    }
}

/// View used by account-management endpoints; exposes email and level.
pub const ADMIN_VIEW: &str = "admin";

/// View reserved for the hashed secret; no endpoint renders it.
pub const SECRET_VIEW: &str = "secret";

impl Persistent for Credential {
    const NAME: &'static str = "credential";

    fn profile() -> &'static SerializationProfile<Self> {
        static PROFILE: OnceLock<SerializationProfile<Credential>> = OnceLock::new();
        PROFILE.get_or_init(|| {
            SerializationProfile::<Self>::builder(Self::NAME)
                .field("id", |c| &c.id, |c| &mut c.id)
                .field_in("email", &[ADMIN_VIEW], |c| &c.email, |c| &mut c.email)
                .field_in("level", &[ADMIN_VIEW], |c| &c.level, |c| &mut c.level)
                .field_in("secret", &[SECRET_VIEW], |c| &c.secret, |c| &mut c.secret)
                .build()
        })
    }
}

/// CredentialState
///
/// The registry of every account credential, shared across the application state.
pub type CredentialState = Arc<IdentityRegistry<Credential>>;

/// authenticate
///
/// Scans the credential registry for an account accepting `email`/`password` and returns its
/// identity with the level it grants. Credentials at `AuthLevel::None` never match.
pub fn authenticate(
    credentials: &IdentityRegistry<Credential>,
    email: &str,
    password: &str,
) -> Option<(Identity, AuthLevel)> {
    credentials
        .find(|c| c.level > AuthLevel::None && c.authenticate(email, password))
        .map(|record| {
            let credential = record.read();
            (credential.id, credential.level)
        })
}

/// First credential registered under `email`, regardless of level.
pub fn find_by_email(credentials: &IdentityRegistry<Credential>, email: &str) -> Option<Record<Credential>> {
    credentials.find(|c| c.email == email)
}

/// BasicCredentials
///
/// The decoded payload of an `Authorization: Basic <base64(email:password)>` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub email: String,
    pub password: String,
}

impl BasicCredentials {
    /// parse
    ///
    /// Returns `None` for anything that is not a well-formed Basic header: another scheme,
    /// invalid base64, non UTF-8 payload, or a payload that does not split into exactly
    /// `email:password`. Such headers are treated as anonymous by the dispatcher.
    pub fn parse(header: &str) -> Option<Self> {
        let encoded = header.trim().strip_prefix("Basic ")?.trim();
        if encoded.is_empty() {
            return None;
        }
        let decoded = STANDARD.decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let mut parts = decoded.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(email), Some(password), None) => Some(Self {
                email: email.to_string(),
                password: password.to_string(),
            }),
            _ => None,
        }
    }

    pub fn to_header(&self) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", self.email, self.password)))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionState {
    level: AuthLevel,
    account: Option<Identity>,
}

/// Session
///
/// The strongly typed per-connection session: the highest level proven so far, and the account
/// that proved it. `upgrade` never lowers the level.
#[derive(Debug, Default)]
pub struct Session {
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(level: AuthLevel) -> Self {
        Self {
            state: Mutex::new(SessionState {
                level,
                account: None,
            }),
        }
    }

    pub fn level(&self) -> AuthLevel {
        self.state.lock().level
    }

    /// The credential identity behind the current level, if one was proven by a header.
    pub fn account(&self) -> Option<Identity> {
        self.state.lock().account
    }

    /// Raises the session to `level` if it is higher. Returns whether the level changed.
    pub fn upgrade(&self, level: AuthLevel) -> bool {
        let mut state = self.state.lock();
        if level > state.level {
            state.level = level;
            true
        } else {
            false
        }
    }

    /// Like `upgrade`, also recording `account` as the session owner when the level rises.
    /// A session without an owner adopts `account` at an equal level too.
    pub fn upgrade_account(&self, level: AuthLevel, account: Identity) -> bool {
        let mut state = self.state.lock();
        if level > state.level {
            state.level = level;
            state.account = Some(account);
            true
        } else {
            if level == state.level && state.account.is_none() {
                state.account = Some(account);
            }
            false
        }
    }

    pub fn authenticated(&self, required: AuthLevel) -> bool {
        self.level() >= required
    }
}

/// SessionStore
///
/// Transport-owned map from session id to session. Ids are random v4 UUIDs handed to clients
/// in a cookie. Only sessions that proved a level are stored.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Existing session for `id`, or a fresh anonymous one that is not stored yet.
    pub fn resolve(&self, id: Option<Uuid>) -> (Option<Uuid>, Arc<Session>) {
        if let Some(id) = id {
            if let Some(session) = self.get(id) {
                return (Some(id), session);
            }
        }
        (None, Arc::new(Session::new()))
    }

    /// retain
    ///
    /// Stores a session handed out by `resolve` under a new id once it has proven a level.
    /// Anonymous sessions carry nothing worth remembering and are never stored.
    pub fn retain(&self, session: &Arc<Session>) -> Option<Uuid> {
        if session.level() == AuthLevel::None {
            return None;
        }
        let id = Uuid::new_v4();
        self.sessions.write().insert(id, Arc::clone(session));
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::{WILDCARD_VIEW, decode, encode};

    const COST: u32 = 4;

    #[test]
    fn levels_are_ordered() {
        assert!(AuthLevel::None < AuthLevel::User);
        assert!(AuthLevel::User < AuthLevel::Moderator);
        assert!(AuthLevel::Moderator < AuthLevel::Admin);
        assert_eq!("moderator".parse::<AuthLevel>(), Ok(AuthLevel::Moderator));
        assert!("root".parse::<AuthLevel>().is_err());
    }

    #[test]
    fn credential_verifies_only_matching_email_and_password() {
        let credential = Credential::new("ada@example.com", "hunter2", COST).unwrap();
        assert_eq!(credential.level(), AuthLevel::User);
        assert!(credential.authenticate("ada@example.com", "hunter2"));
        assert!(!credential.authenticate("ada@example.com", "wrong"));
        assert!(!credential.authenticate("bob@example.com", "hunter2"));
    }

    #[test]
    fn change_password_invalidates_old_secret() {
        let mut credential = Credential::new("ada@example.com", "old", COST).unwrap();
        credential.change_password("new", COST).unwrap();
        assert!(!credential.authenticate("ada@example.com", "old"));
        assert!(credential.authenticate("ada@example.com", "new"));
    }

    #[test]
    fn credential_without_secret_never_authenticates() {
        let credential = Credential {
            email: "ada@example.com".into(),
            ..Credential::default()
        };
        assert!(!credential.authenticate("ada@example.com", ""));
    }

    #[test]
    fn secret_survives_wildcard_round_trip_but_not_admin_view() {
        let credential = Credential::new("ada@example.com", "pw", COST).unwrap();

        let admin = encode(&credential, ADMIN_VIEW).unwrap();
        assert!(admin.get("secret").is_none());
        assert_eq!(admin["email"], "ada@example.com");
        assert_eq!(admin["level"], "USER");

        let public = encode(&credential, "public").unwrap();
        assert!(public.get("email").is_none());

        let restored: Credential = decode(encode(&credential, WILDCARD_VIEW).unwrap(), WILDCARD_VIEW).unwrap();
        assert!(restored.authenticate("ada@example.com", "pw"));
    }

    #[test]
    fn registry_scan_returns_granted_level_and_skips_none() {
        let credentials = IdentityRegistry::new();
        let mut admin = Credential::new("root@example.com", "pw", COST).unwrap();
        admin.set_level(AuthLevel::Admin);
        credentials.insert(admin).unwrap();
        let mut disabled = Credential::new("gone@example.com", "pw", COST).unwrap();
        disabled.set_level(AuthLevel::None);
        credentials.insert(disabled).unwrap();

        let (id, level) = authenticate(&credentials, "root@example.com", "pw").unwrap();
        assert_eq!(level, AuthLevel::Admin);
        assert_eq!(credentials.lookup(id).unwrap().read().email(), "root@example.com");
        assert_eq!(authenticate(&credentials, "gone@example.com", "pw"), None);
        assert_eq!(authenticate(&credentials, "root@example.com", "nope"), None);
        assert!(find_by_email(&credentials, "gone@example.com").is_some());
    }

    #[test]
    fn basic_header_parsing() {
        let creds = BasicCredentials {
            email: "ada@example.com".into(),
            password: "pw".into(),
        };
        assert_eq!(BasicCredentials::parse(&creds.to_header()), Some(creds));

        assert_eq!(BasicCredentials::parse("Bearer abc"), None);
        assert_eq!(BasicCredentials::parse("Basic !!!not-base64"), None);
        assert_eq!(BasicCredentials::parse("Basic "), None);
        let no_colon = format!("Basic {}", STANDARD.encode("justone"));
        assert_eq!(BasicCredentials::parse(&no_colon), None);
        let two_colons = format!("Basic {}", STANDARD.encode("a:b:c"));
        assert_eq!(BasicCredentials::parse(&two_colons), None);
    }

    #[test]
    fn session_upgrade_is_monotonic() {
        let session = Session::with_level(AuthLevel::Moderator);
        assert!(!session.upgrade(AuthLevel::User));
        assert_eq!(session.level(), AuthLevel::Moderator);
        assert!(session.upgrade(AuthLevel::Admin));
        assert_eq!(session.level(), AuthLevel::Admin);
        assert!(session.authenticated(AuthLevel::Moderator));
    }

    #[test]
    fn session_account_follows_the_highest_level() {
        let session = Session::new();
        assert!(session.upgrade_account(AuthLevel::User, 4));
        assert_eq!(session.account(), Some(4));
        assert!(!session.upgrade_account(AuthLevel::User, 9));
        assert_eq!(session.account(), Some(4));
        assert!(session.upgrade_account(AuthLevel::Admin, 1));
        assert_eq!(session.account(), Some(1));
        assert_eq!(session.level(), AuthLevel::Admin);
    }

    #[test]
    fn session_store_reuses_known_ids() {
        let store = SessionStore::new();
        let (_, first) = store.resolve(None);
        first.upgrade(AuthLevel::User);
        let id = store.retain(&first).unwrap();

        let (same_id, again) = store.resolve(Some(id));
        assert_eq!(same_id, Some(id));
        assert_eq!(again.level(), AuthLevel::User);

        let (other, fresh) = store.resolve(Some(Uuid::new_v4()));
        assert_eq!(other, None);
        assert_eq!(fresh.level(), AuthLevel::None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn session_store_keeps_only_upgraded_sessions() {
        let store = SessionStore::new();

        let (id, anonymous) = store.resolve(None);
        assert!(id.is_none());
        assert!(store.retain(&anonymous).is_none());
        assert!(store.is_empty());

        let (_, session) = store.resolve(Some(Uuid::new_v4()));
        session.upgrade_account(AuthLevel::User, 3);
        let id = store.retain(&session).unwrap();
        assert_eq!(store.len(), 1);

        let (known, resolved) = store.resolve(Some(id));
        assert_eq!(known, Some(id));
        assert!(Arc::ptr_eq(&resolved, &session));
    }
}
