use axum::http::StatusCode;

use crate::{
    AppState,
    auth::{self, ADMIN_VIEW, AuthLevel, Credential},
    context::RequestContext,
    error::{ServiceError, ServiceResult},
    models::{CreateProjectRequest, PUBLIC_VIEW, Project, UserProfile},
    registry::{Identity, Record, RegistryError},
};

// --- Helpers ---

/// Every project matching `filter`, ordered by identity for stable listings.
fn projects_where(state: &AppState, filter: impl Fn(&Project) -> bool) -> Vec<Project> {
    let mut projects: Vec<Project> = state
        .projects
        .records()
        .iter()
        .map(|record| record.read().clone())
        .filter(|project| filter(project))
        .collect();
    projects.sort_by_key(|project| project.id);
    projects
}

/// The project addressed by the first excess segment (`projects/<id>`).
fn addressed_project(state: &AppState, ctx: &RequestContext) -> ServiceResult<Record<Project>> {
    let id: Identity = ctx
        .excess_id()?
        .ok_or_else(|| ServiceError::bad_request("a project id is required in the path"))?;
    state.projects.lookup(id).ok_or(ServiceError::NotFound)
}

// --- Public Handlers ---

/// register_user
///
/// [Public Route] Creates a `USER`-level credential from the `email` and `password` parameters.
/// The password is hashed with the configured bcrypt cost and never echoed back.
///
/// *Note*: The lookup before hashing is only a shortcut; uniqueness is enforced by
/// `insert_unique`, which checks and inserts under one registry lock.
pub fn register_user(state: &AppState, ctx: &mut RequestContext) -> ServiceResult {
    let email = ctx.parse_param::<String>("email")?.trim().to_lowercase();
    let password = ctx.parse_param::<String>("password")?;

    if !email.contains('@') {
        return Err(ServiceError::bad_request("email address is malformed"));
    }
    if password.len() < 8 {
        return Err(ServiceError::bad_request("password must be at least 8 characters"));
    }
    if auth::find_by_email(&state.credentials, &email).is_some() {
        ctx.error(StatusCode::CONFLICT, "email is already registered");
        return Ok(());
    }

    let credential = Credential::new(&email, &password, state.config.bcrypt_cost)?;
    let record = match state
        .credentials
        .insert_unique(credential, |existing, new| existing.email() == new.email())
    {
        Ok(record) => record,
        Err(RegistryError::Conflict) => {
            ctx.error(StatusCode::CONFLICT, "email is already registered");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    tracing::info!(id = record.id(), %email, "account registered");

    ctx.set_status(StatusCode::CREATED);
    ctx.send_entity(&*record.read(), ADMIN_VIEW)
}

/// list_projects
///
/// [Public Route] Lists every project at the public view, optionally filtered by `year`.
/// With an excess path (`projects/<id>`) it renders that single project instead.
pub fn list_projects(state: &AppState, ctx: &mut RequestContext) -> ServiceResult {
    if !ctx.excess_path().is_empty() {
        let record = addressed_project(state, ctx)?;
        return ctx.send_entity(&*record.read(), PUBLIC_VIEW);
    }

    let year: Option<i32> = ctx.parse_optional("year")?;
    let projects = projects_where(state, |project| year.is_none_or(|year| project.year == year));
    ctx.send_entities(&projects, PUBLIC_VIEW)
}

// --- Authenticated Handlers ---

/// get_me
///
/// [Authenticated Route] The level this session has proven and the account that proved it.
pub fn get_me(_state: &AppState, ctx: &mut RequestContext) -> ServiceResult {
    let profile = UserProfile {
        level: ctx.session_level(),
        account: ctx.account(),
    };
    ctx.send_json(&profile)
}

/// create_project
///
/// [Authenticated Route] Submits a project from a JSON body `{title, summary, year}`.
/// The owner is the account behind the session.
pub fn create_project(state: &AppState, ctx: &mut RequestContext) -> ServiceResult {
    let owner = ctx.account().ok_or(ServiceError::Unauthenticated)?;
    let request: CreateProjectRequest = ctx.json_body()?;
    request.validate()?;

    let record = state.projects.insert(Project::new(owner, request))?;
    tracing::info!(id = record.id(), owner, "project created");

    ctx.set_status(StatusCode::CREATED);
    ctx.send_entity(&*record.read(), PUBLIC_VIEW)
}

/// delete_project
///
/// [Authenticated Route] Removes `projects/<id>`.
///
/// *Ownership*: only the owner may delete; moderators and admins may delete any project.
pub fn delete_project(state: &AppState, ctx: &mut RequestContext) -> ServiceResult {
    let record = addressed_project(state, ctx)?;
    let owner = record.read().owner;
    if ctx.account() != Some(owner) && !ctx.authenticated(AuthLevel::Moderator) {
        return Err(ServiceError::Forbidden);
    }

    if state.projects.remove_record(&record) {
        tracing::info!(id = record.id(), "project deleted");
    }
    ctx.set_status(StatusCode::NO_CONTENT);
    Ok(())
}

// --- Admin Handlers ---

/// get_admin_projects
///
/// [Moderator Route] Every project at the admin view, including moderation notes.
pub fn get_admin_projects(state: &AppState, ctx: &mut RequestContext) -> ServiceResult {
    let projects = projects_where(state, |_| true);
    ctx.send_entities(&projects, ADMIN_VIEW)
}

/// moderate_project
///
/// [Moderator Route] Sets the moderation note of `admin/projects/<id>` from parameter `note`.
/// An empty note clears it.
pub fn moderate_project(state: &AppState, ctx: &mut RequestContext) -> ServiceResult {
    let record = addressed_project(state, ctx)?;
    let note = ctx.parse_param::<String>("note")?;
    {
        let mut project = record.write();
        project.moderation_note = (!note.trim().is_empty()).then_some(note);
    }
    tracing::info!(id = record.id(), "project moderated");
    ctx.send_entity(&*record.read(), ADMIN_VIEW)
}

/// set_account_level
///
/// [Admin Route] Changes the level of the account registered under `email`. Level `NONE`
/// disables the account: it can no longer authenticate.
pub fn set_account_level(state: &AppState, ctx: &mut RequestContext) -> ServiceResult {
    let email = ctx.parse_param::<String>("email")?.trim().to_lowercase();
    let level: AuthLevel = ctx.parse_param("level")?;

    let record = auth::find_by_email(&state.credentials, &email).ok_or(ServiceError::NotFound)?;
    record.write().set_level(level);
    tracing::info!(%email, %level, "account level changed");

    ctx.send_entity(&*record.read(), ADMIN_VIEW)
}
