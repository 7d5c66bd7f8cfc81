/// Engine configuration.
///
/// All environment reads funnel through `EngineConfig`, constructed once at
/// facade creation and passed down; nothing in the engine consults the
/// environment after that point.
use crate::errors::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable naming the database location.
pub const ENV_DATABASE_URI: &str = "DATABASE_URI";

/// Environment variable enabling verbose engine logging.
pub const ENV_DB_VERBOSE: &str = "DB_VERBOSE";

/// Environment variable for the application-level encryption hook.
pub const ENV_DB_ENCRYPTED: &str = "DB_ENCRYPTED";

/// Parsed database location.
///
/// Only the SQLite-backed variants (`sqlite://`, bare paths, `memory://`,
/// `:memory:`) are served by this engine build; the grammar is parsed in
/// full so embedders get a precise error instead of a path mangling one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum DatabaseUrl {
    /// File-backed SQLite database; the advisory file lock applies.
    Sqlite(PathBuf),

    /// Embedded PostgreSQL-compatible engine on a directory; file lock
    /// applies.
    PgliteDir(PathBuf),

    /// In-process ephemeral database; no lock.
    Memory(String),

    /// Browser IndexedDB backend; no filesystem lock.
    IndexedDb(String),

    /// Browser OPFS access-handle-pool backend; no filesystem lock.
    OpfsAhp(String),

    /// External PostgreSQL server; relies on the server's own transactions.
    Postgres(String),
}

impl DatabaseUrl {
    /// True when the backend lives in local files and the advisory lock
    /// protocol applies.
    pub fn is_file_backed(&self) -> bool {
        matches!(self, DatabaseUrl::Sqlite(_) | DatabaseUrl::PgliteDir(_))
    }

    /// Path the advisory lock sentinel is derived from, if any.
    pub fn lock_target(&self) -> Option<&Path> {
        match self {
            DatabaseUrl::Sqlite(path) | DatabaseUrl::PgliteDir(path) => Some(path),
            _ => None,
        }
    }
}

impl std::fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseUrl::Sqlite(path) => write!(f, "sqlite://{}", path.display()),
            DatabaseUrl::PgliteDir(path) => write!(f, "pglite-file://{}", path.display()),
            DatabaseUrl::Memory(label) => write!(f, "memory://{label}"),
            DatabaseUrl::IndexedDb(label) => write!(f, "idb://{label}"),
            DatabaseUrl::OpfsAhp(label) => write!(f, "opfs-ahp://{label}"),
            DatabaseUrl::Postgres(url) => write!(f, "{url}"),
        }
    }
}

impl std::str::FromStr for DatabaseUrl {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TaskError::Validation("empty database url".to_string()));
        }
        if s == ":memory:" {
            return Ok(DatabaseUrl::Memory("memory".to_string()));
        }
        if let Some(path) = s.strip_prefix("sqlite://") {
            return Ok(DatabaseUrl::Sqlite(PathBuf::from(path)));
        }
        if let Some(path) = s.strip_prefix("pglite-file://") {
            return Ok(DatabaseUrl::PgliteDir(PathBuf::from(path)));
        }
        if let Some(label) = s.strip_prefix("memory://") {
            let label = if label.is_empty() { "memory" } else { label };
            return Ok(DatabaseUrl::Memory(label.to_string()));
        }
        if let Some(label) = s.strip_prefix("idb://") {
            return Ok(DatabaseUrl::IndexedDb(label.to_string()));
        }
        if let Some(label) = s.strip_prefix("opfs-ahp://") {
            return Ok(DatabaseUrl::OpfsAhp(label.to_string()));
        }
        if s.starts_with("postgresql://") || s.starts_with("postgres://") {
            return Ok(DatabaseUrl::Postgres(s.to_string()));
        }
        if s.contains("://") {
            return Err(TaskError::Validation(format!(
                "unrecognised database url scheme: {s:?}"
            )));
        }
        // Bare filesystem path.
        Ok(DatabaseUrl::Sqlite(PathBuf::from(s)))
    }
}

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: DatabaseUrl,

    /// Verbose engine logging (`DB_VERBOSE`).
    pub verbose: bool,

    /// Application-level encryption hook (`DB_ENCRYPTED`). Parsed and
    /// logged; the embedded engine does not implement encryption itself.
    pub encrypted: bool,

    /// Process name recorded in the advisory lock file.
    pub process_label: String,
}

impl EngineConfig {
    pub fn new(database_url: DatabaseUrl) -> Self {
        EngineConfig {
            database_url,
            verbose: false,
            encrypted: false,
            process_label: default_process_label(),
        }
    }

    pub fn with_process_label(mut self, label: impl Into<String>) -> Self {
        self.process_label = label.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Build configuration from the process environment. This is the only
    /// place the engine reads environment variables.
    pub fn from_env() -> TaskResult<Self> {
        let database_url = match std::env::var(ENV_DATABASE_URI) {
            Ok(raw) => raw.parse()?,
            Err(_) => DatabaseUrl::Sqlite(default_database_path()),
        };
        let verbose = env_flag(ENV_DB_VERBOSE);
        let encrypted = env_flag(ENV_DB_ENCRYPTED);
        if encrypted {
            warn!("{ENV_DB_ENCRYPTED} is set but application-level encryption is not configured; flag is inert");
        }

        Ok(EngineConfig {
            database_url,
            verbose,
            encrypted,
            process_label: default_process_label(),
        })
    }
}

/// Default database location under the platform data directory.
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("astrotask")
        .join("astrotask.db")
}

fn default_process_label() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "astrotask".to_string())
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_flag(&value),
        Err(_) => false,
    }
}

/// Parse a boolean-ish environment value.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Install the global tracing subscriber, honouring `RUST_LOG` when set.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sqlite_urls() {
        let url: DatabaseUrl = "sqlite:///tmp/tasks.db".parse().unwrap();
        assert_eq!(url, DatabaseUrl::Sqlite(PathBuf::from("/tmp/tasks.db")));
        assert!(url.is_file_backed());

        let bare: DatabaseUrl = "/tmp/tasks.db".parse().unwrap();
        assert_eq!(bare, DatabaseUrl::Sqlite(PathBuf::from("/tmp/tasks.db")));

        let relative: DatabaseUrl = "tasks.db".parse().unwrap();
        assert_eq!(relative, DatabaseUrl::Sqlite(PathBuf::from("tasks.db")));
    }

    #[test]
    fn test_parse_memory_urls() {
        assert_eq!(
            ":memory:".parse::<DatabaseUrl>().unwrap(),
            DatabaseUrl::Memory("memory".to_string())
        );
        assert_eq!(
            "memory://scratch".parse::<DatabaseUrl>().unwrap(),
            DatabaseUrl::Memory("scratch".to_string())
        );
        assert!(!"memory://x".parse::<DatabaseUrl>().unwrap().is_file_backed());
    }

    #[test]
    fn test_parse_other_backends() {
        assert_eq!(
            "pglite-file:///var/db".parse::<DatabaseUrl>().unwrap(),
            DatabaseUrl::PgliteDir(PathBuf::from("/var/db"))
        );
        assert!(matches!(
            "idb://app".parse::<DatabaseUrl>().unwrap(),
            DatabaseUrl::IndexedDb(_)
        ));
        assert!(matches!(
            "opfs-ahp://app".parse::<DatabaseUrl>().unwrap(),
            DatabaseUrl::OpfsAhp(_)
        ));
        assert!(matches!(
            "postgresql://host/db".parse::<DatabaseUrl>().unwrap(),
            DatabaseUrl::Postgres(_)
        ));
        assert!(!"postgresql://host/db"
            .parse::<DatabaseUrl>()
            .unwrap()
            .is_file_backed());
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!("redis://x".parse::<DatabaseUrl>().is_err());
        assert!("".parse::<DatabaseUrl>().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("true"));
        assert!(parse_flag("YES"));
        assert!(parse_flag(" on "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_lock_target() {
        let url: DatabaseUrl = "sqlite:///tmp/a.db".parse().unwrap();
        assert_eq!(url.lock_target(), Some(Path::new("/tmp/a.db")));
        assert_eq!(
            "memory://x".parse::<DatabaseUrl>().unwrap().lock_target(),
            None
        );
    }
}
