use crate::{
    AppState, handlers,
    models::{PUBLIC_VIEW, Project},
    registry::IdentityRegistry,
    routing::{Route, view_route},
};

fn projects(state: &AppState) -> &IdentityRegistry<Project> {
    &state.projects
}

/// Public Route Module
///
/// Endpoints open to any client. Everything rendered here uses the public view, so moderation
/// notes never leak to anonymous callers.
pub fn public_routes() -> Vec<Route<AppState>> {
    vec![
        // POST /register
        // Creates a USER-level account. Credentials are then sent with Basic auth.
        Route::post("register", "Register", handlers::register_user)
            .describe("Creates an account from `email` and `password`.")
            .param("email")
            .param("password"),
        // GET /projects[/<id>]
        // The whole collection, or one project when an id follows in the path.
        Route::get("projects", "Projects", handlers::list_projects)
            .describe("Lists projects, optionally filtered by `year`; `/projects/<id>` selects one.")
            .optional("year", None),
        // GET /project?id=<id>
        view_route("project", "Project", PUBLIC_VIEW, projects)
            .describe("A single project by `id`."),
    ]
}
