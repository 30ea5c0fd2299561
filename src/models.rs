use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::auth::{ADMIN_VIEW, AuthLevel};
use crate::error::{ServiceError, ServiceResult};
use crate::registry::{Entity, Identity};
use crate::views::{Persistent, SerializationProfile};

/// The view rendered to anonymous and regular clients.
pub const PUBLIC_VIEW: &str = "public";

// --- Core Application Entities (Persisted in Snapshots) ---

/// Project
///
/// A showcase project submitted by an account. Owned by the credential identity in `owner`.
///
/// *Note*: `moderation_note` is restricted to the admin view; the public view never carries it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Project {
    pub id: Identity,
    // Identity of the submitting credential.
    pub owner: Identity,
    pub title: String,
    pub summary: String,
    pub year: i32,
    pub created_at: DateTime<Utc>,
    pub moderation_note: Option<String>,
}

impl Project {
    pub fn new(owner: Identity, request: CreateProjectRequest) -> Self {
        Self {
            id: 0,
            owner,
            title: request.title.trim().to_string(),
            summary: request.summary,
            year: request.year,
            created_at: Utc::now(),
            moderation_note: None,
        }
    }
}

impl Entity for Project {
    fn identity(&self) -> Identity {
        self.id
    }

    fn set_identity(&mut self, id: Identity) {
        self.id = id;
    }
}

impl Persistent for Project {
    const NAME: &'static str = "project";

    fn profile() -> &'static SerializationProfile<Self> {
        static PROFILE: OnceLock<SerializationProfile<Project>> = OnceLock::new();
        PROFILE.get_or_init(|| {
            SerializationProfile::<Self>::builder(Self::NAME)
                .field("id", |p| &p.id, |p| &mut p.id)
                .field("owner", |p| &p.owner, |p| &mut p.owner)
                .field("title", |p| &p.title, |p| &mut p.title)
                .field("summary", |p| &p.summary, |p| &mut p.summary)
                .field("year", |p| &p.year, |p| &mut p.year)
                .field("created_at", |p| &p.created_at, |p| &mut p.created_at)
                .field_in(
                    "moderation_note",
                    &[ADMIN_VIEW],
                    |p| &p.moderation_note,
                    |p| &mut p.moderation_note,
                )
                .build()
        })
    }
}

// --- Request Payloads (Input Schemas) ---

/// CreateProjectRequest
///
/// JSON body of `POST /projects`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateProjectRequest {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub year: i32,
}

impl CreateProjectRequest {
    /// Rejects blank titles and years outside `2000..=2100`.
    pub fn validate(&self) -> ServiceResult {
        if self.title.trim().is_empty() {
            return Err(ServiceError::bad_request("title must not be blank"));
        }
        if !(2000..=2100).contains(&self.year) {
            return Err(ServiceError::bad_request(format!(
                "year {} is out of range",
                self.year
            )));
        }
        Ok(())
    }
}

// --- Response Shapes ---

/// UserProfile
///
/// Response of `GET /me`: who the session belongs to, as far as the dispatcher proved it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub level: AuthLevel,
    // Credential identity that authenticated the session; absent if none did.
    pub account: Option<Identity>,
}
