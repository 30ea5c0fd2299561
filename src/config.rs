use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// ConfigError
///
/// A required variable is missing or a present one does not parse. `main` treats every variant
/// as fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set in production")]
    Missing(&'static str),
    #[error("{name} is invalid: `{value}`")]
    Invalid { name: &'static str, value: String },
}

/// AppConfig
///
/// Holds the application's configuration state. Immutable once loaded and pulled into handlers
/// through the shared `AppState`.
#[derive(Clone, Debug)]
pub struct AppConfig {
    // Runtime environment marker. Selects log format and which variables are mandatory.
    pub env: Env,
    // Directory holding one `<entity>.json.gz` snapshot per registry.
    pub data_dir: PathBuf,
    // Socket the HTTP listener binds to.
    pub bind_addr: SocketAddr,
    // bcrypt work factor for newly hashed passwords.
    pub bcrypt_cost: u32,
    // Bootstrap admin account, seeded only into an empty credential registry.
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
}

/// Env
///
/// Defines the runtime context: pretty logs and relaxed defaults locally, JSON logs and explicit
/// settings in production.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Env {
    Local,
    Production,
}

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_DATA_DIR: &str = "./data";

impl Default for AppConfig {
    /// default
    ///
    /// Safe values for test setup: local mode, the cheapest bcrypt cost, no bootstrap admin.
    fn default() -> Self {
        Self {
            env: Env::Local,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            bcrypt_cost: 4,
            admin_email: None,
            admin_password: None,
        }
    }
}

impl AppConfig {
    /// load
    ///
    /// Reads the configuration from environment variables (call `dotenv` first to pick up a
    /// `.env` file).
    ///
    /// # Errors
    /// In production `DATA_DIR`, `ADMIN_EMAIL` and `ADMIN_PASSWORD` are mandatory. In any
    /// environment a present `BIND_ADDR` or `BCRYPT_COST` that does not parse is rejected rather
    /// than silently replaced by the default.
    pub fn load() -> Result<Self, ConfigError> {
        let env = match env::var("APP_ENV").as_deref() {
            Ok("production") => Env::Production,
            _ => Env::Local,
        };

        let data_dir = match (env, var("DATA_DIR")) {
            (_, Some(dir)) => PathBuf::from(dir),
            (Env::Production, None) => return Err(ConfigError::Missing("DATA_DIR")),
            (Env::Local, None) => PathBuf::from(DEFAULT_DATA_DIR),
        };

        let bind_addr = parse("BIND_ADDR", var("BIND_ADDR").as_deref().unwrap_or(DEFAULT_BIND_ADDR))?;

        let bcrypt_cost = match var("BCRYPT_COST") {
            Some(raw) => parse::<u32>("BCRYPT_COST", &raw)
                .and_then(|cost| match cost {
                    4..=31 => Ok(cost),
                    _ => Err(ConfigError::Invalid {
                        name: "BCRYPT_COST",
                        value: raw.clone(),
                    }),
                })?,
            None => bcrypt::DEFAULT_COST,
        };

        let admin_email = var("ADMIN_EMAIL");
        let admin_password = var("ADMIN_PASSWORD");
        if env == Env::Production {
            if admin_email.is_none() {
                return Err(ConfigError::Missing("ADMIN_EMAIL"));
            }
            if admin_password.is_none() {
                return Err(ConfigError::Missing("ADMIN_PASSWORD"));
            }
        }

        Ok(Self {
            env,
            data_dir,
            bind_addr,
            bcrypt_cost,
            admin_email,
            admin_password,
        })
    }

    /// The bootstrap admin credentials, when both halves are configured.
    pub fn bootstrap_admin(&self) -> Option<(&str, &str)> {
        match (&self.admin_email, &self.admin_password) {
            (Some(email), Some(password)) => Some((email, password)),
            _ => None,
        }
    }
}

/// Non-empty value of `name`.
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: raw.to_string(),
    })
}
