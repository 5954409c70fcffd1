//! Configuration types and builders for parish-sync.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;
use validator::Validate;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SyncConfig {
    /// Cloud store (source of truth for pulls, target of pushes)
    pub primary: StoreConfig,

    /// Offline replica
    pub replica: StoreConfig,

    /// Sync behavior configuration
    #[validate(nested)]
    #[serde(default)]
    pub sync: SyncBehaviorConfig,

    /// Tables to reconcile, parents before children
    #[validate(nested)]
    #[serde(default = "default_tables")]
    pub tables: Vec<TableSpec>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SyncConfig {
    /// Create a new configuration builder.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let primary_url = std::env::var("PRIMARY_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| Error::config("PRIMARY_DATABASE_URL or DATABASE_URL not set"))?;

        let mut builder = Self::builder().primary_url(primary_url);

        if let Ok(url) = std::env::var("REPLICA_DATABASE_URL") {
            builder = builder.replica_url(url);
        } else if let Ok(path) = std::env::var("REPLICA_DUCKDB_PATH") {
            builder = builder.replica_duckdb(path);
        } else {
            return Err(Error::config(
                "REPLICA_DATABASE_URL or REPLICA_DUCKDB_PATH not set",
            ));
        }

        if let Ok(size) = std::env::var("SYNC_BATCH_SIZE") {
            let size = size
                .parse()
                .map_err(|e| Error::config_with_source("Invalid SYNC_BATCH_SIZE", e))?;
            builder = builder.batch_size(size);
        }

        if let Ok(timeout) = std::env::var("SYNC_STATEMENT_TIMEOUT") {
            builder = builder.statement_timeout(timeout);
        }

        if let Ok(n) = std::env::var("SYNC_PARALLEL_TABLES") {
            let n = n
                .parse()
                .map_err(|e| Error::config_with_source("Invalid SYNC_PARALLEL_TABLES", e))?;
            builder = builder.parallel_tables(n);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            builder = builder.log_level(level);
        }

        for table in tables_from_env()? {
            builder = builder.table(table);
        }

        builder.build()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read {}: {}", path, e)))?;

        Self::from_toml(&content)
            .map_err(|e| Error::config(format!("Failed to load {}: {}", path, e)))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::config_with_source("Invalid TOML", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)?;
        self.primary.validate_store()?;
        self.replica.validate_store()?;
        self.sync.statement_timeout()?;
        validate_tables(&self.tables)
    }
}

/// Connection settings for one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// PostgreSQL server
    Postgres(PostgresConfig),
    /// Embedded DuckDB file
    DuckDb(DuckDbConfig),
}

impl StoreConfig {
    /// PostgreSQL store from a URL with default settings.
    pub fn postgres(url: impl Into<String>) -> Self {
        StoreConfig::Postgres(PostgresConfig {
            url: url.into(),
            ..Default::default()
        })
    }

    /// DuckDB store from a path (or `:memory:`).
    pub fn duckdb(path: impl Into<String>) -> Self {
        StoreConfig::DuckDb(DuckDbConfig { path: path.into() })
    }

    fn validate_store(&self) -> Result<()> {
        match self {
            StoreConfig::Postgres(c) => {
                Validate::validate(c)?;
                Url::parse(&c.url)
                    .map_err(|e| Error::config(format!("Invalid PostgreSQL URL: {}", e)))?;
                Ok(())
            }
            StoreConfig::DuckDb(c) => Ok(Validate::validate(c)?),
        }
    }
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PostgresConfig {
    /// Connection URL
    #[validate(length(min = 1))]
    pub url: String,

    /// Connection timeout in seconds
    #[validate(range(min = 1, max = 600))]
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// SSL mode
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Accept self-signed server certificates (hosted poolers)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_secs: default_timeout_secs(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
        }
    }
}

impl PostgresConfig {
    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// SSL mode for PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Disable SSL
    Disable,
    /// Prefer SSL (default)
    #[default]
    Prefer,
    /// Require SSL
    Require,
}

/// DuckDB replica configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DuckDbConfig {
    /// Database file path, or `:memory:`
    #[validate(length(min = 1))]
    pub path: String,
}

/// Sync behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SyncBehaviorConfig {
    /// Rows (or ids) per write statement
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timeout applied to every store call, e.g. "30s"
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout: String,

    /// Independent table groups reconciled concurrently
    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_parallel_tables")]
    pub parallel_tables: usize,
}

impl Default for SyncBehaviorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            statement_timeout: default_statement_timeout(),
            parallel_tables: default_parallel_tables(),
        }
    }
}

impl SyncBehaviorConfig {
    /// Parsed statement timeout.
    pub fn statement_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.statement_timeout).map_err(|e| {
            Error::config_with_source(
                format!("Invalid statement_timeout '{}'", self.statement_timeout),
                e,
            )
        })
    }
}

/// One table to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TableSpec {
    /// Table name
    #[validate(length(min = 1, max = 63))]
    pub name: String,

    /// Column rows are matched by
    #[validate(length(min = 1, max = 63))]
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Expected column set (empty = take the source's columns)
    #[serde(default)]
    pub columns: Vec<String>,

    /// Tables this one references; must appear earlier in the list
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TableSpec {
    /// Table keyed by `id` with no column contract.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_column: default_key_column(),
            columns: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    /// Set the key column.
    pub fn key_column(mut self, col: impl Into<String>) -> Self {
        self.key_column = col.into();
        self
    }

    /// Set the expected column set.
    pub fn columns(mut self, cols: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = cols.into_iter().map(|c| c.into()).collect();
        self
    }

    /// Set the tables this one references.
    pub fn depends_on(mut self, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = tables.into_iter().map(|t| t.into()).collect();
        self
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (default)
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Builder for SyncConfig.
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    primary: Option<StoreConfig>,
    replica: Option<StoreConfig>,
    batch_size: Option<usize>,
    statement_timeout: Option<String>,
    parallel_tables: Option<usize>,
    tables: Vec<TableSpec>,
    log_level: Option<String>,
}

impl SyncConfigBuilder {
    /// Set the primary store to a PostgreSQL URL.
    pub fn primary_url(mut self, url: impl Into<String>) -> Self {
        self.primary = Some(StoreConfig::postgres(url));
        self
    }

    /// Set the primary store.
    pub fn primary(mut self, store: StoreConfig) -> Self {
        self.primary = Some(store);
        self
    }

    /// Set the replica store to a PostgreSQL URL.
    pub fn replica_url(mut self, url: impl Into<String>) -> Self {
        self.replica = Some(StoreConfig::postgres(url));
        self
    }

    /// Set the replica store to a DuckDB file.
    pub fn replica_duckdb(mut self, path: impl Into<String>) -> Self {
        self.replica = Some(StoreConfig::duckdb(path));
        self
    }

    /// Set the replica store.
    pub fn replica(mut self, store: StoreConfig) -> Self {
        self.replica = Some(store);
        self
    }

    /// Set rows per write statement.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set the per-call timeout ("30s", "2m").
    pub fn statement_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.statement_timeout = Some(timeout.into());
        self
    }

    /// Set how many independent table groups run at once.
    pub fn parallel_tables(mut self, n: usize) -> Self {
        self.parallel_tables = Some(n);
        self
    }

    /// Add a table (in upsert order).
    pub fn table(mut self, table: TableSpec) -> Self {
        self.tables.push(table);
        self
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Build the SyncConfig.
    pub fn build(self) -> Result<SyncConfig> {
        let primary = self
            .primary
            .ok_or_else(|| Error::config("primary store required"))?;
        let replica = self
            .replica
            .ok_or_else(|| Error::config("replica store required"))?;

        let config = SyncConfig {
            primary,
            replica,
            sync: SyncBehaviorConfig {
                batch_size: self.batch_size.unwrap_or_else(default_batch_size),
                statement_timeout: self
                    .statement_timeout
                    .unwrap_or_else(default_statement_timeout),
                parallel_tables: self
                    .parallel_tables
                    .unwrap_or_else(default_parallel_tables),
            },
            tables: if self.tables.is_empty() {
                default_tables()
            } else {
                self.tables
            },
            logging: LoggingConfig {
                level: self.log_level.unwrap_or_else(default_log_level),
                ..Default::default()
            },
        };

        config.validate()?;
        Ok(config)
    }
}

/// Cross-table checks: non-empty, unique safe names, dependencies declared
/// earlier in the list.
pub fn validate_tables(tables: &[TableSpec]) -> Result<()> {
    if tables.is_empty() {
        return Err(Error::validation("at least one table is required"));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for table in tables {
        for ident in std::iter::once(&table.name)
            .chain(std::iter::once(&table.key_column))
            .chain(table.columns.iter())
        {
            if !is_identifier(ident) {
                return Err(Error::validation(format!(
                    "'{}' is not a valid identifier (table {})",
                    ident, table.name
                )));
            }
        }

        if !table.columns.is_empty() && !table.columns.contains(&table.key_column) {
            return Err(Error::validation(format!(
                "columns of table {} must include key column {}",
                table.name, table.key_column
            )));
        }

        for dep in &table.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(Error::validation(format!(
                    "table {} depends on {}, which must be listed before it",
                    table.name, dep
                )));
            }
        }

        if !seen.insert(table.name.as_str()) {
            return Err(Error::validation(format!(
                "table {} listed more than once",
                table.name
            )));
        }
    }

    Ok(())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Defaults
fn default_timeout_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    500
}
fn default_statement_timeout() -> String {
    "30s".into()
}
fn default_parallel_tables() -> usize {
    1
}
fn default_key_column() -> String {
    "id".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Tables of the membership schema, parents first.
pub const DEFAULT_TABLES: [&str; 4] = ["users", "families", "members", "anbiyam"];

fn default_tables() -> Vec<TableSpec> {
    DEFAULT_TABLES.iter().map(|t| TableSpec::new(*t)).collect()
}

/// Table list entry: a bare name or a full spec.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TableEntry {
    Name(String),
    Spec(TableSpec),
}

impl From<TableEntry> for TableSpec {
    fn from(entry: TableEntry) -> Self {
        match entry {
            TableEntry::Name(name) => TableSpec::new(name),
            TableEntry::Spec(spec) => spec,
        }
    }
}

/// Wrapper struct for object format: `{"tables": [...]}`
#[derive(Debug, Deserialize)]
struct TablesWrapper {
    tables: Vec<TableEntry>,
}

/// Parse a JSON table list.
///
/// Accepts `[...]` or `{"tables": [...]}`, where each entry is a table name or
/// an object with `name`, `key_column`, `columns`, `depends_on`.
pub fn parse_tables_json(json: &str) -> Result<Vec<TableSpec>> {
    if let Ok(entries) = serde_json::from_str::<Vec<TableEntry>>(json) {
        return Ok(entries.into_iter().map(TableSpec::from).collect());
    }

    match serde_json::from_str::<TablesWrapper>(json) {
        Ok(wrapper) => Ok(wrapper.tables.into_iter().map(TableSpec::from).collect()),
        Err(e) => Err(Error::config_with_source(
            "Failed to parse table config JSON: expected array [...] or object {\"tables\": [...]}",
            e,
        )),
    }
}

/// Decode a base64-encoded JSON table list.
pub fn parse_tables_base64(encoded: &str) -> Result<Vec<TableSpec>> {
    use base64::{Engine, engine::general_purpose::STANDARD};

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::config_with_source("Failed to decode table config base64", e))?;
    let json = String::from_utf8(decoded)
        .map_err(|e| Error::config_with_source("Table config is not valid UTF-8", e))?;
    parse_tables_json(&json)
}

/// Load the table list from the environment.
///
/// Checks `SYNC_TABLES_CONFIG` (base64 JSON), then `SYNC_TABLES_JSON`, then
/// `SYNC_TABLES` (comma-separated names). Returns an empty list when none is
/// set.
pub fn tables_from_env() -> Result<Vec<TableSpec>> {
    if let Ok(encoded) = std::env::var("SYNC_TABLES_CONFIG") {
        let tables = parse_tables_base64(&encoded)?;
        tracing::debug!("Loaded {} tables from SYNC_TABLES_CONFIG", tables.len());
        return Ok(tables);
    }

    if let Ok(json) = std::env::var("SYNC_TABLES_JSON") {
        return parse_tables_json(&json);
    }

    if let Ok(list) = std::env::var("SYNC_TABLES") {
        return Ok(list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(TableSpec::new)
            .collect());
    }

    Ok(vec![])
}
