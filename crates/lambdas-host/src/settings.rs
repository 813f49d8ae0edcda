//! Settings resolution for app configurations.
//!
//! Each declared setting is resolved once per registration through a
//! [`SettingsResolver`]. The stock resolver reads persisted values from
//! sqlite and falls back to asking the operator.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use lambdas_types::{Configuration, FieldType, Permission, Settings, coerce_raw_setting};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;

use crate::config::HostConfig;
use crate::error::{HostError, LoadError};

const PROMPT_ATTEMPTS: usize = 3;

#[async_trait]
pub trait SettingsResolver: Send + Sync {
    async fn resolve(&self, app: &str, field: &str, field_type: FieldType) -> Result<Value, HostError>;

    /// Remember an operator-supplied value so later loads resolve to it.
    /// Resolvers without storage keep nothing.
    async fn persist(
        &self,
        _app: &str,
        _field: &str,
        _field_type: FieldType,
        _value: &Value,
    ) -> Result<(), HostError> {
        Ok(())
    }
}

/// Everything an app's configurations resolve to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppConfig {
    pub description: Option<String>,
    pub settings: Settings,
    pub permissions: Vec<Permission>,
}

/// Resolve `configurations` for `app`. Duplicate setting names are rejected
/// before anything is resolved. The last non-empty description wins.
pub async fn load_configurations(
    resolver: &dyn SettingsResolver,
    app: &str,
    configurations: &[Configuration],
) -> Result<AppConfig, LoadError> {
    let mut seen = BTreeSet::new();
    for c in configurations {
        if let Configuration::Setting { field_name, .. } = c {
            if !seen.insert(field_name.as_str()) {
                return Err(LoadError::DuplicateSetting(field_name.clone()));
            }
        }
    }

    let mut config = AppConfig::default();
    for c in configurations {
        match c {
            Configuration::Setting {
                field_name,
                field_type,
            } => {
                let value = resolver.resolve(app, field_name, *field_type).await?;
                config.settings.insert(field_name.clone(), value);
            }
            Configuration::Info {
                description: Some(d),
            } if !d.trim().is_empty() => config.description = Some(d.trim().to_string()),
            Configuration::Info { .. } => {}
            Configuration::Permission { permission } => {
                if !config.permissions.contains(permission) {
                    config.permissions.push(*permission);
                }
            }
        }
    }
    Ok(config)
}

/// Fixed values, keyed by app and field.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    values: HashMap<(String, String), Value>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, app: &str, field: &str, value: Value) -> Self {
        self.values.insert((app.to_string(), field.to_string()), value);
        self
    }
}

#[async_trait]
impl SettingsResolver for StaticSettings {
    async fn resolve(&self, app: &str, field: &str, _field_type: FieldType) -> Result<Value, HostError> {
        self.values
            .get(&(app.to_string(), field.to_string()))
            .cloned()
            .ok_or_else(|| HostError::MissingSetting {
                app: app.to_string(),
                field: field.to_string(),
            })
    }
}

/// Persisted setting values, one row per `(app, field_name)`.
pub struct SqliteSettingsStore {
    conn: Mutex<Connection>,
}

impl SqliteSettingsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HostError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, HostError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HostError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                app TEXT NOT NULL,
                field_name TEXT NOT NULL,
                field_type TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (app, field_name)
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored value for `field`, if one was saved with the same type.
    pub fn get(&self, app: &str, field: &str, field_type: FieldType) -> Result<Option<Value>, HostError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE app = ?1 AND field_name = ?2 AND field_type = ?3",
                params![app, field, field_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub fn put(&self, app: &str, field: &str, field_type: FieldType, value: &Value) -> Result<(), HostError> {
        let encoded = serde_json::to_string(value)?;
        self.conn().execute(
            "INSERT INTO settings (app, field_name, field_type, value) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(app, field_name) DO UPDATE SET field_type = excluded.field_type, value = excluded.value",
            params![app, field, field_type.as_str(), encoded],
        )?;
        Ok(())
    }

    /// All stored values for `app`.
    pub fn app_settings(&self, app: &str) -> Result<Settings, HostError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT field_name, value FROM settings WHERE app = ?1")?;
        let mut rows = stmt.query(params![app])?;
        let mut out = Settings::new();
        while let Some(row) = rows.next()? {
            let field: String = row.get(0)?;
            let raw: String = row.get(1)?;
            out.insert(field, serde_json::from_str(&raw)?);
        }
        Ok(out)
    }
}

/// Asks the operator for a raw setting value.
#[async_trait]
pub trait Prompt: Send + Sync {
    async fn ask(&self, app: &str, field: &str, field_type: FieldType) -> Result<String, HostError>;
}

/// Prompts on stderr and reads one line from stdin.
pub struct StdinPrompt;

#[async_trait]
impl Prompt for StdinPrompt {
    async fn ask(&self, app: &str, field: &str, field_type: FieldType) -> Result<String, HostError> {
        let question = format!("[{app}] {field} ({field_type}): ");
        let line = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr();
            stderr.write_all(question.as_bytes())?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| HostError::Io(std::io::Error::other(e)))??;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Stored values first; otherwise prompt, coerce, persist.
///
/// One question is open at a time: concurrent loads queue on `prompting`
/// for the whole ask/coerce/persist step, so an answer is always read for
/// the field it was asked for.
pub struct StoredSettingsResolver {
    store: Arc<SqliteSettingsStore>,
    prompt: Arc<dyn Prompt>,
    prompting: tokio::sync::Mutex<()>,
}

impl StoredSettingsResolver {
    pub fn new(store: Arc<SqliteSettingsStore>, prompt: Arc<dyn Prompt>) -> Self {
        Self {
            store,
            prompt,
            prompting: tokio::sync::Mutex::new(()),
        }
    }

    /// Store at `settings_db` (or in memory) with a stdin prompt.
    pub fn from_config(config: &HostConfig) -> Result<Self, HostError> {
        let store = match &config.settings_db {
            Some(path) => SqliteSettingsStore::open(path)?,
            None => SqliteSettingsStore::in_memory()?,
        };
        Ok(Self::new(Arc::new(store), Arc::new(StdinPrompt)))
    }

    pub fn store(&self) -> &Arc<SqliteSettingsStore> {
        &self.store
    }
}

#[async_trait]
impl SettingsResolver for StoredSettingsResolver {
    async fn resolve(&self, app: &str, field: &str, field_type: FieldType) -> Result<Value, HostError> {
        if let Some(value) = self.store.get(app, field, field_type)? {
            return Ok(value);
        }
        let _prompting = self.prompting.lock().await;
        // Another load may have asked for this field while we waited.
        if let Some(value) = self.store.get(app, field, field_type)? {
            return Ok(value);
        }
        let mut attempt = 1;
        let value = loop {
            let raw = self.prompt.ask(app, field, field_type).await?;
            match coerce_raw_setting(&raw, field_type) {
                Ok(value) => break value,
                Err(e) if attempt < PROMPT_ATTEMPTS => {
                    tracing::warn!(%app, %field, error = %e, "invalid setting value, asking again");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.store.put(app, field, field_type, &value)?;
        Ok(value)
    }

    async fn persist(
        &self,
        app: &str,
        field: &str,
        field_type: FieldType,
        value: &Value,
    ) -> Result<(), HostError> {
        self.store.put(app, field, field_type, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replays canned answers and counts how often it was asked.
    struct Scripted {
        answers: Mutex<VecDeque<String>>,
        asked: Mutex<usize>,
    }

    impl Scripted {
        fn new(answers: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
                asked: Mutex::new(0),
            })
        }

        fn asked(&self) -> usize {
            *self.asked.lock().unwrap()
        }
    }

    #[async_trait]
    impl Prompt for Scripted {
        async fn ask(&self, _app: &str, _field: &str, _ty: FieldType) -> Result<String, HostError> {
            *self.asked.lock().unwrap() += 1;
            Ok(self.answers.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn prompts_once_then_reads_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("settings.db");
        let prompt = Scripted::new(&["Yes"]);
        let resolver = StoredSettingsResolver::new(
            Arc::new(SqliteSettingsStore::open(&db).unwrap()),
            prompt.clone(),
        );

        let first = resolver.resolve("alerts", "notify", FieldType::Boolean).await.unwrap();
        let second = resolver.resolve("alerts", "notify", FieldType::Boolean).await.unwrap();
        assert_eq!(first, json!(true));
        assert_eq!(second, json!(true));
        assert_eq!(prompt.asked(), 1);

        // Survives reopening the file.
        let reopened = SqliteSettingsStore::open(&db).unwrap();
        assert_eq!(
            reopened.get("alerts", "notify", FieldType::Boolean).unwrap(),
            Some(json!(true))
        );
    }

    #[tokio::test]
    async fn invalid_numbers_are_asked_again() {
        let prompt = Scripted::new(&["lots", "1000"]);
        let resolver = StoredSettingsResolver::new(
            Arc::new(SqliteSettingsStore::in_memory().unwrap()),
            prompt.clone(),
        );
        let value = resolver.resolve("whales", "threshold", FieldType::Number).await.unwrap();
        assert_eq!(value, json!(1000));
        assert_eq!(prompt.asked(), 2);
    }

    /// Answers after a short delay and records the most questions it ever
    /// had open at once.
    struct Overlapping {
        open: AtomicUsize,
        max_open: AtomicUsize,
    }

    #[async_trait]
    impl Prompt for Overlapping {
        async fn ask(&self, app: &str, field: &str, _ty: FieldType) -> Result<String, HostError> {
            let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open.fetch_max(open, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.open.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("{app}/{field}"))
        }
    }

    #[tokio::test]
    async fn concurrent_loads_ask_one_question_at_a_time() {
        let prompt = Arc::new(Overlapping {
            open: AtomicUsize::new(0),
            max_open: AtomicUsize::new(0),
        });
        let resolver = StoredSettingsResolver::new(
            Arc::new(SqliteSettingsStore::in_memory().unwrap()),
            prompt.clone(),
        );

        let (email, token) = tokio::join!(
            resolver.resolve("app-a", "email", FieldType::String),
            resolver.resolve("app-b", "token", FieldType::Secret),
        );
        assert_eq!(prompt.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(email.unwrap(), json!("app-a/email"));
        assert_eq!(token.unwrap(), json!("app-b/token"));
        assert_eq!(
            resolver.store().get("app-b", "token", FieldType::Secret).unwrap(),
            Some(json!("app-b/token"))
        );
    }

    #[tokio::test]
    async fn queued_load_reuses_the_answer_for_the_same_field() {
        let prompt = Scripted::new(&["alice@example.com"]);
        let resolver = StoredSettingsResolver::new(
            Arc::new(SqliteSettingsStore::in_memory().unwrap()),
            prompt.clone(),
        );
        let (first, second) = tokio::join!(
            resolver.resolve("alerts", "email", FieldType::String),
            resolver.resolve("alerts", "email", FieldType::String),
        );
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(prompt.asked(), 1);
    }

    #[test]
    fn put_overwrites_and_retypes() {
        let store = SqliteSettingsStore::in_memory().unwrap();
        store.put("a", "limit", FieldType::String, &json!("10")).unwrap();
        store.put("a", "limit", FieldType::Number, &json!(10)).unwrap();
        assert_eq!(store.get("a", "limit", FieldType::String).unwrap(), None);
        assert_eq!(store.get("a", "limit", FieldType::Number).unwrap(), Some(json!(10)));
        assert_eq!(store.app_settings("a").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn configurations_resolve_in_declaration_order() {
        let resolver = StaticSettings::new()
            .with("whales", "threshold", json!(1000))
            .with("whales", "email", json!("ops@example.com"));
        let configs = vec![
            Configuration::setting("threshold", FieldType::Number),
            Configuration::description("  first  "),
            Configuration::permission(Permission::Transact),
            Configuration::setting("email", FieldType::String),
            Configuration::description("watches large transfers"),
            Configuration::permission(Permission::Transact),
        ];
        let config = load_configurations(&resolver, "whales", &configs).await.unwrap();
        assert_eq!(config.description.as_deref(), Some("watches large transfers"));
        assert_eq!(config.settings["threshold"], json!(1000));
        assert_eq!(config.permissions, vec![Permission::Transact]);
    }

    #[tokio::test]
    async fn duplicate_settings_fail_the_load() {
        let configs = vec![
            Configuration::setting("threshold", FieldType::Number),
            Configuration::setting("threshold", FieldType::String),
        ];
        let err = load_configurations(&StaticSettings::new(), "whales", &configs)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::DuplicateSetting(f) if f == "threshold"));
    }

    #[tokio::test]
    async fn missing_static_value_is_an_error() {
        let configs = vec![Configuration::setting("threshold", FieldType::Number)];
        let err = load_configurations(&StaticSettings::new(), "whales", &configs)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Host(HostError::MissingSetting { .. })));
    }
}
