//! Configuration loading: an ordered list of Entity specifications under a
//! named Runtime, with `[meta] base = "..."` layered-TOML inheritance and an
//! optional confidential-values store.
//!
//! The layered-merge machinery (`merge_toml`/`load_raw_merged`, cycle
//! detection via canonicalized paths already visited) is carried over
//! unchanged in shape from the bot's config loader; only the schema being
//! parsed is new.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::RaceError;

/// One Entity's declaration within the Runtime's ordered list.
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub name: String,
    pub implementation: String,
    pub remote_uri: Option<String>,
    pub write_to: Vec<String>,
    pub read_from: Vec<String>,
    /// Arbitrary nested options the Entity's constructor interprets;
    /// unknown keys are accepted and passed through untouched.
    pub options: toml::Value,
}

/// A fully resolved Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub runtime_name: String,
    pub listen: Option<String>,
    pub log_level: String,
    pub entities: Vec<EntitySpec>,
}

impl Config {
    pub fn entity(&self, name: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    runtime: RawRuntime,
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    secrets: toml::value::Table,
}

#[derive(Debug, Deserialize)]
struct RawRuntime {
    #[serde(default = "default_runtime_name")]
    name: String,
    listen: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
}

impl Default for RawRuntime {
    fn default() -> Self {
        RawRuntime {
            name: default_runtime_name(),
            listen: None,
            log_level: default_log_level(),
        }
    }
}

fn default_runtime_name() -> String {
    "race".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    implementation: String,
    #[serde(default)]
    remote: Option<String>,
    #[serde(default)]
    write_to: StringOrList,
    #[serde(default)]
    read_from: StringOrList,
    #[serde(flatten)]
    options: toml::value::Table,
}

/// Accepts either a single string or a list of strings for `write_to`/
/// `read_from` ("string or list of strings").
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    #[default]
    Empty,
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::Empty => Vec::new(),
            StringOrList::One(s) => vec![s],
            StringOrList::Many(v) => v,
        }
    }
}

/// Deep-merge two TOML values. Tables are merged recursively — an overlay
/// only needs to specify keys that differ from the base. Every other type
/// (string, integer, array, …) is replaced wholesale by the overlay.
fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, ov_val) in overlay_tbl {
                let merged = match base_tbl.remove(&key) {
                    Some(base_val) => merge_toml(base_val, ov_val),
                    None => ov_val,
                };
                base_tbl.insert(key, merged);
            }
            toml::Value::Table(base_tbl)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file, follow any `[meta] base = "..."` chain, and return
/// the fully merged `toml::Value`. `visited` carries canonicalized paths
/// already seen in this chain so circular references are caught early.
fn load_raw_merged(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<toml::Value, RaceError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical) {
        return Err(RaceError::config(format!(
            "circular base reference detected at: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path).map_err(|e| RaceError::config(format!("cannot read {}: {e}", path.display())))?;
    let overlay_val: toml::Value = toml::from_str(&raw).map_err(|e| RaceError::config(format!("parse error in {}: {e}", path.display())))?;

    if let Some(base_str) = overlay_val.get("meta").and_then(|m| m.get("base")).and_then(|b| b.as_str()) {
        let base_path = if Path::new(base_str).is_absolute() {
            PathBuf::from(base_str)
        } else {
            path.parent().unwrap_or(Path::new(".")).join(base_str)
        };
        let base_val = load_raw_merged(&base_path, visited)?;
        Ok(merge_toml(base_val, overlay_val))
    } else {
        Ok(overlay_val)
    }
}

/// Load and resolve a Runtime configuration from a TOML file, following any
/// `[meta] base = "..."` chain.
pub fn load_from(path: &Path) -> Result<Config, RaceError> {
    let mut visited = HashSet::new();
    let merged = load_raw_merged(path, &mut visited)?;
    let raw: RawConfig = merged
        .try_into()
        .map_err(|e| RaceError::config(format!("schema error in {}: {e}", path.display())))?;

    let mut seen_names = HashSet::new();
    let mut entities = Vec::with_capacity(raw.entities.len());
    for e in raw.entities {
        if !seen_names.insert(e.name.clone()) {
            return Err(RaceError::config(format!("duplicate entity name: {}", e.name)));
        }
        entities.push(EntitySpec {
            name: e.name,
            implementation: e.implementation,
            remote_uri: e.remote,
            write_to: e.write_to.into_vec(),
            read_from: e.read_from.into_vec(),
            options: toml::Value::Table(e.options),
        });
    }

    let secrets = SecretsTable::from_toml(raw.secrets);

    Ok(resolve_secrets(
        Config {
            runtime_name: raw.runtime.name,
            listen: raw.runtime.listen,
            log_level: raw.runtime.log_level,
            entities,
        },
        &secrets,
    ))
}

/// Flattened `[secrets]` table from the config file itself — a fallback
/// path for plain (non-`??`) values; real confidential values are expected
/// to go through [`crate::config::secrets::SecretsStore`] instead.
struct SecretsTable(toml::value::Table);

impl SecretsTable {
    fn from_toml(table: toml::value::Table) -> Self {
        SecretsTable(table)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
    }
}

/// Walk every Entity's options table, resolving `??name` string values
/// against the file-local secrets table. The `??` prefix scheme itself
/// (consulted again, against [`secrets::SecretsStore`], by Entity
/// constructors at `Initialize` time) is out of scope here; this pass only
/// handles values the config loader itself can resolve inline.
fn resolve_secrets(mut config: Config, secrets: &SecretsTable) -> Config {
    for entity in &mut config.entities {
        resolve_value(&mut entity.options, secrets);
    }
    config
}

fn resolve_value(value: &mut toml::Value, secrets: &SecretsTable) {
    match value {
        toml::Value::String(s) => {
            if let Some(name) = s.strip_prefix("??") {
                if let Some(resolved) = secrets.get(name) {
                    *s = resolved;
                }
            }
        }
        toml::Value::Table(tbl) => {
            for v in tbl.values_mut() {
                resolve_value(v, secrets);
            }
        }
        toml::Value::Array(arr) => {
            for v in arr.iter_mut() {
                resolve_value(v, secrets);
            }
        }
        _ => {}
    }
}

pub mod secrets {
    //! The `??name` confidential-value lookup interface. The core's
    //! responsibility stops at this trait — cipher and key management are
    //! out of scope.

    use std::collections::HashMap;
    use std::env;

    /// Looked up by Entity constructors when a config string begins with
    /// `??`. `RACE_SECRETS_STORE` names which store implementation a
    /// `Runtime` wires up; absent or unrecognized falls back to
    /// [`NullSecretsStore`].
    pub trait SecretsStore: Send + Sync {
        fn resolve(&self, name: &str) -> Option<String>;
    }

    /// Resolves nothing — every `??name` lookup fails. The default when no
    /// store is configured.
    pub struct NullSecretsStore;

    impl SecretsStore for NullSecretsStore {
        fn resolve(&self, _name: &str) -> Option<String> {
            None
        }
    }

    /// Resolves `??name` against the `RACE_SECRET_<NAME>` environment
    /// variable (uppercased).
    pub struct EnvSecretsStore;

    impl SecretsStore for EnvSecretsStore {
        fn resolve(&self, name: &str) -> Option<String> {
            env::var(format!("RACE_SECRET_{}", name.to_uppercase())).ok()
        }
    }

    /// An in-memory store, mainly for tests.
    #[derive(Default)]
    pub struct MapSecretsStore(HashMap<String, String>);

    impl MapSecretsStore {
        pub fn new() -> Self {
            MapSecretsStore::default()
        }

        pub fn insert(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.0.insert(name.into(), value.into());
            self
        }
    }

    impl SecretsStore for MapSecretsStore {
        fn resolve(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    /// Select a store implementation from the `RACE_SECRETS_STORE`
    /// environment variable ("a single variable names the
    /// location of an optional secrets store").
    pub fn from_env() -> Box<dyn SecretsStore> {
        match env::var("RACE_SECRETS_STORE").as_deref() {
            Ok("env") => Box::new(EnvSecretsStore),
            _ => Box::new(NullSecretsStore),
        }
    }
}

/// Expand a leading `~` to the user's home directory. Absolute or relative
/// paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_named(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    const BASIC: &str = r#"
[runtime]
name = "demo"
listen = "127.0.0.1:9000"

[[entities]]
name = "radar"
implementation = "demo::Radar"
write_to = "/flights/positions"

[[entities]]
name = "tracker"
implementation = "demo::Tracker"
read_from = ["/flights/*"]
"#;

    #[test]
    fn parses_ordered_entities_and_write_read_lists() {
        let dir = TempDir::new().unwrap();
        let path = write_named(&dir, "basic.toml", BASIC);
        let cfg = load_from(&path).unwrap();

        assert_eq!(cfg.runtime_name, "demo");
        assert_eq!(cfg.entities.len(), 2);
        assert_eq!(cfg.entities[0].name, "radar");
        assert_eq!(cfg.entities[0].write_to, vec!["/flights/positions"]);
        assert_eq!(cfg.entities[1].read_from, vec!["/flights/*"]);
    }

    #[test]
    fn duplicate_entity_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let dup = r#"
[[entities]]
name = "a"
implementation = "demo::A"

[[entities]]
name = "a"
implementation = "demo::B"
"#;
        let path = write_named(&dir, "dup.toml", dup);
        let err = load_from(&path).unwrap_err();
        assert!(matches!(err, RaceError::Config(_)));
    }

    #[test]
    fn base_layering_merges_and_overlay_wins_scalars() {
        let dir = TempDir::new().unwrap();
        write_named(&dir, "base.toml", BASIC);
        let overlay = r#"
[meta]
base = "base.toml"

[runtime]
name = "demo-overlay"
"#;
        let path = write_named(&dir, "overlay.toml", overlay);
        let cfg = load_from(&path).unwrap();

        assert_eq!(cfg.runtime_name, "demo-overlay");
        assert_eq!(cfg.entities.len(), 2, "entities list inherited from base");
    }

    #[test]
    fn cycle_in_base_chain_is_detected() {
        let dir = TempDir::new().unwrap();
        let a_path = dir.path().join("a.toml");
        let b_path = dir.path().join("b.toml");
        fs::write(&a_path, "[meta]\nbase = \"b.toml\"\n").unwrap();
        fs::write(&b_path, "[meta]\nbase = \"a.toml\"\n").unwrap();

        let err = load_from(&a_path).unwrap_err();
        assert!(matches!(err, RaceError::Config(_)));
    }

    #[test]
    fn secret_placeholder_resolves_inline_from_secrets_table() {
        let dir = TempDir::new().unwrap();
        let content = r#"
[secrets]
api_key = "shh"

[[entities]]
name = "svc"
implementation = "demo::Svc"
token = "??api_key"
"#;
        let path = write_named(&dir, "secret.toml", content);
        let cfg = load_from(&path).unwrap();
        let token = cfg.entities[0].options.get("token").and_then(|v| v.as_str()).unwrap();
        assert_eq!(token, "shh");
    }

    #[test]
    fn unresolvable_secret_placeholder_is_left_untouched() {
        let dir = TempDir::new().unwrap();
        let content = r#"
[[entities]]
name = "svc"
implementation = "demo::Svc"
token = "??missing"
"#;
        let path = write_named(&dir, "secret.toml", content);
        let cfg = load_from(&path).unwrap();
        let token = cfg.entities[0].options.get("token").and_then(|v| v.as_str()).unwrap();
        assert_eq!(token, "??missing");
    }

    #[test]
    fn env_secrets_store_reads_prefixed_variable() {
        use secrets::SecretsStore;
        std::env::set_var("RACE_SECRET_DB_PASSWORD", "hunter2");
        let store = secrets::EnvSecretsStore;
        assert_eq!(store.resolve("db_password"), Some("hunter2".to_string()));
        std::env::remove_var("RACE_SECRET_DB_PASSWORD");
    }
}
