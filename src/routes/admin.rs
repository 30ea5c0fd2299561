use crate::{AppState, auth::AuthLevel, handlers, routing::Route};

/// Admin Route Module
///
/// Moderation and account management. Moderators review projects; only admins change account
/// levels.
pub fn admin_routes() -> Vec<Route<AppState>> {
    vec![
        // GET /admin/projects
        // Every project at the admin view, moderation notes included.
        Route::get("admin/projects", "Moderation Queue", handlers::get_admin_projects)
            .requires(AuthLevel::Moderator),
        // PUT /admin/projects/<id>?note=...
        Route::put("admin/projects", "Moderate Project", handlers::moderate_project)
            .describe("Sets the moderation note of `/admin/projects/<id>`; an empty note clears it.")
            .param("note")
            .requires(AuthLevel::Moderator),
        // PUT /admin/accounts?email=...&level=...
        Route::put("admin/accounts", "Set Account Level", handlers::set_account_level)
            .describe("Changes the level of the account registered under `email`.")
            .param("email")
            .param("level")
            .requires(AuthLevel::Admin),
    ]
}
