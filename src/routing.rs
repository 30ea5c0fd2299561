use axum::http::Method;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::auth::AuthLevel;
use crate::context::RequestContext;
use crate::error::{ServiceError, ServiceResult};
use crate::registry::{Entity, Identity, IdentityRegistry};
use crate::views::Persistent;

/// Handler
///
/// The business logic behind a route. Receives the shared application state and the
/// request-scoped context; runs to completion on a worker thread.
pub type Handler<S> = Arc<dyn Fn(&S, &mut RequestContext) -> ServiceResult + Send + Sync>;

/// Strips leading and trailing separators: `/items/42/` becomes `items/42`.
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Route
///
/// A declarative route descriptor: where it listens, what it needs, who may call it.
pub struct Route<S> {
    method: Method,
    path: String,
    name: String,
    description: Option<String>,
    required: BTreeSet<String>,
    optional: BTreeMap<String, Option<String>>,
    level: AuthLevel,
    varies: bool,
    handler: Handler<S>,
}

impl<S> Route<S> {
    pub fn new<F>(method: Method, path: &str, name: &str, handler: F) -> Self
    where
        F: Fn(&S, &mut RequestContext) -> ServiceResult + Send + Sync + 'static,
    {
        Self {
            method,
            path: normalize_path(path).to_string(),
            name: name.to_string(),
            description: None,
            required: BTreeSet::new(),
            optional: BTreeMap::new(),
            level: AuthLevel::None,
            varies: false,
            handler: Arc::new(handler),
        }
    }

    pub fn get<F>(path: &str, name: &str, handler: F) -> Self
    where
        F: Fn(&S, &mut RequestContext) -> ServiceResult + Send + Sync + 'static,
    {
        Self::new(Method::GET, path, name, handler)
    }

    pub fn post<F>(path: &str, name: &str, handler: F) -> Self
    where
        F: Fn(&S, &mut RequestContext) -> ServiceResult + Send + Sync + 'static,
    {
        Self::new(Method::POST, path, name, handler)
    }

    pub fn put<F>(path: &str, name: &str, handler: F) -> Self
    where
        F: Fn(&S, &mut RequestContext) -> ServiceResult + Send + Sync + 'static,
    {
        Self::new(Method::PUT, path, name, handler)
    }

    pub fn delete<F>(path: &str, name: &str, handler: F) -> Self
    where
        F: Fn(&S, &mut RequestContext) -> ServiceResult + Send + Sync + 'static,
    {
        Self::new(Method::DELETE, path, name, handler)
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Declares a required parameter; requests without it fail before the handler runs.
    pub fn param(mut self, key: &str) -> Self {
        self.required.insert(key.to_string());
        self
    }

    /// Declares an optional parameter with its default (`None` for "absent").
    pub fn optional(mut self, key: &str, default: Option<&str>) -> Self {
        self.optional
            .insert(key.to_string(), default.map(str::to_string));
        self
    }

    /// Minimum session level needed to run the handler.
    pub fn requires(mut self, level: AuthLevel) -> Self {
        self.level = level;
        self
    }

    /// Marks the result as differing between identical calls (`Cache-Control: private`).
    pub fn varies(mut self) -> Self {
        self.varies = true;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> AuthLevel {
        self.level
    }

    pub fn result_varies(&self) -> bool {
        self.varies
    }

    pub fn required_parameters(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn optional_parameters(&self) -> &BTreeMap<String, Option<String>> {
        &self.optional
    }

    pub fn invoke(&self, state: &S, context: &mut RequestContext) -> ServiceResult {
        (self.handler)(state, context)
    }

    /// The discovery entry for this route.
    pub fn documentation(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("name".into(), json!(self.name));
        if let Some(description) = &self.description {
            doc.insert("description".into(), json!(description));
        }
        doc.insert("required_parameters".into(), json!(self.required));
        doc.insert("optional_parameters".into(), json!(self.optional));
        doc.insert("authentication".into(), json!(self.level));
        Value::Object(doc)
    }
}

/// RouteTable
///
/// Maps `(method, path)` to a route and keeps, per path, the methods registered there.
/// Filled once at startup and read-only afterwards.
pub struct RouteTable<S> {
    paths: HashMap<String, HashMap<Method, Route<S>>>,
}

impl<S> Default for RouteTable<S> {
    fn default() -> Self {
        Self {
            paths: HashMap::new(),
        }
    }
}

impl<S> RouteTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from a route list. Later entries win over earlier ones on the same
    /// `(method, path)`.
    pub fn from_routes(routes: impl IntoIterator<Item = Route<S>>) -> Self {
        let mut table = Self::new();
        for route in routes {
            table.register(route);
        }
        table
    }

    /// Registers `route`, silently replacing any route already on the same `(method, path)`.
    pub fn register(&mut self, route: Route<S>) {
        tracing::debug!(method = %route.method, path = %route.path, name = %route.name, "route registered");
        self.paths
            .entry(route.path.clone())
            .or_default()
            .insert(route.method.clone(), route);
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    /// Methods answerable on `path`, sorted by name. Every known path also answers the
    /// discovery method `OPTIONS`. Empty for unknown paths.
    pub fn methods_for(&self, path: &str) -> Vec<Method> {
        let Some(routes) = self.paths.get(path) else {
            return Vec::new();
        };
        let mut methods: Vec<Method> = routes.keys().cloned().collect();
        if !routes.contains_key(&Method::OPTIONS) {
            methods.push(Method::OPTIONS);
        }
        methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        methods
    }

    pub fn handler_for(&self, method: &Method, path: &str) -> Option<&Route<S>> {
        self.paths.get(path)?.get(method)
    }

    /// The generated discovery document for `path`, keyed by method name.
    pub fn discovery(&self, path: &str) -> Option<Value> {
        let routes = self.paths.get(path)?;
        let mut doc = Map::new();
        for (method, route) in routes {
            doc.insert(method.as_str().to_string(), route.documentation());
        }
        Some(Value::Object(doc))
    }

    /// resolve
    ///
    /// Finds the longest registered prefix of `path`, trimming one segment at a time from the
    /// end. Returns the matched path and the unmatched remainder (the excess path, starting with
    /// a separator, or empty on an exact match).
    pub fn resolve<'p>(&self, path: &'p str) -> Option<(&'p str, String)> {
        let mut current = normalize_path(path);
        let mut excess = String::new();
        loop {
            if self.contains_path(current) {
                return Some((current, excess));
            }
            if current.is_empty() {
                return None;
            }
            let cut = current.rfind('/').filter(|&pos| pos > 0)?;
            excess.insert_str(0, &current[cut..]);
            current = &current[..cut];
        }
    }

    pub fn len(&self) -> usize {
        self.paths.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// view_route
///
/// A GET route that renders one registry entry: requires parameter `id`, answers `NOT_FOUND`
/// for unknown identities and encodes the entity at `view`.
pub fn view_route<S, E>(
    path: &str,
    name: &str,
    view: &'static str,
    registry: fn(&S) -> &IdentityRegistry<E>,
) -> Route<S>
where
    S: 'static,
    E: Persistent + Entity,
{
    Route::get(path, name, move |state: &S, ctx: &mut RequestContext| {
        let id: Identity = ctx.parse_param("id")?;
        let record = registry(state).lookup(id).ok_or(ServiceError::NotFound)?;
        let entity = record.read();
        ctx.send_entity(&*entity, view)
    })
    .param("id")
}
