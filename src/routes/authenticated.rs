use crate::{AppState, auth::AuthLevel, handlers, routing::Route};

/// Authenticated Route Module
///
/// Endpoints for any signed-in account. Every route declares `AuthLevel::User`; ownership checks
/// beyond that happen inside the handlers.
pub fn authenticated_routes() -> Vec<Route<AppState>> {
    vec![
        // GET /me
        // The session's proven level differs per caller, so the result is marked as varying.
        Route::get("me", "Me", handlers::get_me)
            .describe("The level and account of the current session.")
            .requires(AuthLevel::User)
            .varies(),
        // POST /projects
        // JSON body `{title, summary, year}`; the session's account becomes the owner.
        Route::post("projects", "Create Project", handlers::create_project)
            .describe("Submits a project.")
            .requires(AuthLevel::User),
        // DELETE /projects/<id>
        Route::delete("projects", "Delete Project", handlers::delete_project)
            .describe("Deletes one of your projects.")
            .requires(AuthLevel::User),
    ]
}
