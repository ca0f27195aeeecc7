//! Configuration for the migration coordinator
//!
//! Configuration is an explicit struct injected into every component. It is
//! loaded from environment variables, falling back to a `.env` file in the
//! working directory.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::paths;

/// Default lock TTL: a run older than this is considered abandoned.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// Default maximum length of a failure detail written to the audit log.
pub const DEFAULT_DETAIL_MAX_BYTES: usize = 512;

/// Main configuration struct for the migration coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    // Units
    /// Canonical directory scanned for migration units (non-recursive).
    pub units_dir: PathBuf,
    /// Required unit file extension, without the leading dot.
    pub unit_extension: String,
    /// Unit names excluded from discovery and selection.
    pub ignored_units: Vec<String>,

    // Lock
    pub lock_path: PathBuf,
    pub lock_ttl: Duration,
    /// Also reclaim same-host lock records whose holder pid is gone.
    pub reclaim_dead_holders: bool,

    // Audit
    pub log_path: PathBuf,
    pub applied_path: PathBuf,
    pub detail_max_bytes: usize,

    // Execution
    /// Program (plus leading args) used to invoke a unit file.
    pub runner_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            units_dir: paths::units_dir(),
            unit_extension: "sh".to_string(),
            ignored_units: Vec::new(),
            lock_path: paths::lock_path(),
            lock_ttl: DEFAULT_LOCK_TTL,
            reclaim_dead_holders: true,
            log_path: paths::log_path(),
            applied_path: paths::applied_path(),
            detail_max_bytes: DEFAULT_DETAIL_MAX_BYTES,
            runner_command: vec!["sh".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Units
        if let Some(v) = env_path("MIGRATE_UNITS_DIR") {
            config.units_dir = v;
        }
        if let Some(v) = env_value("MIGRATE_UNIT_EXTENSION") {
            let ext = v.trim().trim_start_matches('.');
            if !ext.is_empty() {
                config.unit_extension = ext.to_string();
            }
        }
        if let Some(v) = env_value("MIGRATE_IGNORED_UNITS") {
            config.ignored_units = parse_csv(&v);
        }

        // Lock
        if let Some(v) = env_path("MIGRATE_LOCK_PATH") {
            config.lock_path = v;
        }
        config.lock_ttl = Duration::from_secs(env_u64(
            "MIGRATE_LOCK_TTL_SECONDS",
            config.lock_ttl.as_secs(),
        ));
        config.reclaim_dead_holders =
            env_bool("MIGRATE_RECLAIM_DEAD_HOLDERS", config.reclaim_dead_holders);

        // Audit
        if let Some(v) = env_path("MIGRATE_LOG_PATH") {
            config.log_path = v;
        }
        if let Some(v) = env_path("MIGRATE_APPLIED_PATH") {
            config.applied_path = v;
        }
        config.detail_max_bytes = env_usize("MIGRATE_DETAIL_MAX_BYTES", config.detail_max_bytes);

        // Execution
        if let Some(v) = env_value("MIGRATE_RUNNER") {
            match shlex::split(&v) {
                Some(words) if !words.is_empty() => config.runner_command = words,
                _ => tracing::warn!(value = %v, "ignoring unparseable MIGRATE_RUNNER"),
            }
        }

        config
    }

    /// Convenience constructor rooting every path under one directory.
    ///
    /// Units live in `<root>/migrations`, state files directly under `<root>`.
    #[must_use]
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            units_dir: root.join("migrations"),
            lock_path: root.join("migration.lock"),
            log_path: root.join("logs").join("migrations.log"),
            applied_path: root.join("applied.json"),
            ..Self::default()
        }
    }

    /// The unit extension with its leading dot (e.g. `.sh`).
    #[must_use]
    pub fn unit_suffix(&self) -> String {
        format!(".{}", self.unit_extension)
    }
}

static DOTENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<HashMap<String, String>> =
        std::cell::RefCell::new(HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|cell| cell.borrow().get(key).cloned())
}

fn dotenv_values() -> &'static HashMap<String, String> {
    DOTENV_VALUES.get_or_init(|| load_dotenv_file(Path::new(".env")))
}

/// Read a value from the real environment first, falling back to .env.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    #[cfg(test)]
    if let Some(v) = test_env_override_value(key) {
        return Some(v);
    }
    env::var(key)
        .ok()
        .or_else(|| dotenv_values().get(key).cloned())
}

fn load_dotenv_file(path: &Path) -> HashMap<String, String> {
    let Ok(contents) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    parse_dotenv_contents(&contents)
}

/// Parse `KEY=value` lines. Blank lines, `#` comments and an optional
/// `export ` prefix are handled; matching surrounding quotes are stripped.
#[must_use]
pub fn parse_dotenv_contents(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, raw)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), parse_dotenv_value(raw));
    }
    out
}

fn parse_dotenv_value(raw: &str) -> String {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    strip_inline_comment(trimmed).to_string()
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return value[..i].trim_end();
        }
    }
    value
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env_value(key).map_or(default, |v| parse_bool(&v, default))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    let v = env_value(key)?;
    let trimmed = v.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(shellexpand::tilde(trimmed).into_owned()))
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
