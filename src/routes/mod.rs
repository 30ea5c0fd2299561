//! Route Module Index
//!
//! Organizes the application's routes into access tiers. Each module returns a plain list of
//! route descriptors; `all_routes` concatenates them into the table the dispatcher freezes at
//! startup. The tier a route lives in documents intent; the level each route declares is what
//! the dispatcher enforces.
use crate::{AppState, routing::Route};

/// Routes accessible to every client, including anonymous ones.
pub mod public;

/// Routes requiring at least a `USER` session.
pub mod authenticated;

/// Routes restricted to moderators and admins.
pub mod admin;

/// Every route of the application, in registration order.
pub fn all_routes() -> Vec<Route<AppState>> {
    let mut routes = public::public_routes();
    routes.extend(authenticated::authenticated_routes());
    routes.extend(admin::admin_routes());
    routes
}
