//! PostgreSQL store for parish-sync.

use crate::config::{PostgresConfig, SslMode};
use crate::error::{Error, Result, WriteOp};
use crate::row::{Row, RowId, TableSnapshot};
use crate::store::{Store, column_list, on_conflict_clause, quote_ident};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, NoTls, Socket};
use tracing::{debug, info, instrument};

#[cfg(feature = "tls-native")]
use native_tls::TlsConnector;
#[cfg(feature = "tls-native")]
use postgres_native_tls::MakeTlsConnector;

/// Store backed by a PostgreSQL connection.
pub struct PostgresStore {
    name: String,
    client: Client,
}

impl PostgresStore {
    /// Connect to PostgreSQL.
    #[instrument(skip(config), fields(url = %mask_url(&config.url)))]
    pub async fn connect(name: &str, config: &PostgresConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL...");

        let mut pg: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection(name, "Invalid connection string", e))?;
        pg.connect_timeout(config.connect_timeout());
        pg.ssl_mode(match config.ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require => tokio_postgres::config::SslMode::Require,
        });

        let client = if config.ssl_mode == SslMode::Disable {
            open(name, &pg, NoTls).await?
        } else {
            open_tls(name, &pg, config).await?
        };

        info!("Connected to PostgreSQL ({})", name);
        Ok(Self {
            name: name.to_string(),
            client,
        })
    }

    /// Underlying client, for callers that need ad-hoc queries.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

async fn open<T>(store: &str, pg: &tokio_postgres::Config, tls: T) -> Result<Client>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = pg
        .connect(tls)
        .await
        .map_err(|e| Error::connection(store, "Failed to connect", e))?;

    // Spawn connection handler
    let label = store.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error on {}: {}", label, e);
        }
    });

    Ok(client)
}

#[cfg(feature = "tls-native")]
async fn open_tls(
    store: &str,
    pg: &tokio_postgres::Config,
    config: &PostgresConfig,
) -> Result<Client> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()
        .map_err(|e| Error::connection(store, "TLS setup failed", e))?;
    open(store, pg, MakeTlsConnector::new(connector)).await
}

#[cfg(all(feature = "tls-rustls", not(feature = "tls-native")))]
async fn open_tls(
    store: &str,
    pg: &tokio_postgres::Config,
    config: &PostgresConfig,
) -> Result<Client> {
    if config.accept_invalid_certs {
        tracing::warn!("accept_invalid_certs is ignored with the rustls backend");
    }
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    open(store, pg, tokio_postgres_rustls::MakeRustlsConnect::new(tls)).await
}

#[cfg(not(any(feature = "tls-native", feature = "tls-rustls")))]
async fn open_tls(
    store: &str,
    pg: &tokio_postgres::Config,
    config: &PostgresConfig,
) -> Result<Client> {
    if config.ssl_mode == SslMode::Require {
        return Err(Error::config(format!(
            "ssl_mode = require for {} but no TLS backend was compiled in",
            store
        )));
    }
    open(store, pg, NoTls).await
}

#[async_trait]
impl Store for PostgresStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| Error::read(&self.name, "", "Ping failed", e))?;
        Ok(())
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>> {
        let query = r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
        "#;

        let rows = self
            .client
            .query(query, &[&table])
            .await
            .map_err(|e| Error::read(&self.name, table, "Column introspection failed", e))?;

        if rows.is_empty() {
            return Err(Error::read_msg(
                &self.name,
                table,
                "table does not exist or has no columns",
            ));
        }

        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn snapshot(&self, table: &str, key_column: &str) -> Result<TableSnapshot> {
        let columns = self.columns(table).await?;

        // row_to_json keeps numbers and booleans typed; dates arrive as ISO text
        let query = format!("SELECT row_to_json(t) FROM {} t", quote_ident(table));
        debug!("Executing query: {}", query);

        let rows = self
            .client
            .query(&query, &[])
            .await
            .map_err(|e| Error::read(&self.name, table, "Snapshot query failed", e))?;

        let mut parsed = Vec::with_capacity(rows.len());
        for row in &rows {
            let value: JsonValue = row
                .try_get(0)
                .map_err(|e| Error::read(&self.name, table, "Undecodable row", e))?;
            let row = Row::from_json(value)
                .ok_or_else(|| Error::read_msg(&self.name, table, "row is not a JSON object"))?;
            parsed.push(row);
        }

        debug!("Fetched {} rows from {}", parsed.len(), table);
        TableSnapshot::from_rows(table, &self.name, columns, key_column, parsed)
            .map_err(|e| Error::read_msg(&self.name, table, e.to_string()))
    }

    #[instrument(skip(self, columns, rows), fields(store = %self.name, count = rows.len()))]
    async fn upsert(
        &self,
        table: &str,
        key_column: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        // The server converts each JSON field to the column's own type.
        let cols = column_list(columns);
        let query = format!(
            "INSERT INTO {table} ({cols}) SELECT {cols} FROM json_populate_recordset(NULL::{table}, $1::json) {conflict}",
            table = quote_ident(table),
            cols = cols,
            conflict = on_conflict_clause(key_column, columns),
        );
        debug!("Executing upsert: {}", query);

        let payload = JsonValue::Array(rows.iter().cloned().map(Row::into_json).collect());
        let affected = self
            .client
            .execute(&query, &[&payload])
            .await
            .map_err(|e| Error::write(&self.name, table, WriteOp::Upsert, "Upsert failed", e))?;

        debug!("Upserted {} rows into {}", affected, table);
        Ok(affected)
    }

    #[instrument(skip(self, ids), fields(store = %self.name, count = ids.len()))]
    async fn delete(&self, table: &str, key_column: &str, ids: &[RowId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let (query, keys) = delete_query(table, key_column, ids);
        debug!("Executing delete: {}", query);

        let result = match &keys {
            DeleteKeys::Int(keys) => self.client.execute(&query, &[keys]).await,
            DeleteKeys::Text(keys) => self.client.execute(&query, &[keys]).await,
        };
        let affected = result
            .map_err(|e| Error::write(&self.name, table, WriteOp::Delete, "Delete failed", e))?;

        debug!("Deleted {} rows from {}", affected, table);
        Ok(affected)
    }

    async fn count(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let row = self
            .client
            .query_one(&query, &[])
            .await
            .map_err(|e| Error::read(&self.name, table, "Count failed", e))?;

        Ok(row.get(0))
    }
}

/// Key array bound to a delete statement.
#[derive(Debug, PartialEq)]
enum DeleteKeys {
    Int(Vec<i64>),
    Text(Vec<String>),
}

/// Delete-by-key statement for one batch.
///
/// An all-integer batch is bound as `bigint[]` so the primary key index is
/// used; anything else falls back to comparing the key as text, which also
/// covers uuid keys.
fn delete_query(table: &str, key_column: &str, ids: &[RowId]) -> (String, DeleteKeys) {
    let ints: Option<Vec<i64>> = ids
        .iter()
        .map(|id| match id {
            RowId::Int(i) => Some(*i),
            RowId::Text(_) => None,
        })
        .collect();

    match ints {
        Some(ints) => (
            format!(
                "DELETE FROM {} WHERE {} = ANY($1::bigint[])",
                quote_ident(table),
                quote_ident(key_column)
            ),
            DeleteKeys::Int(ints),
        ),
        None => (
            format!(
                "DELETE FROM {} WHERE {}::text = ANY($1::text[])",
                quote_ident(table),
                quote_ident(key_column)
            ),
            DeleteKeys::Text(ids.iter().map(RowId::to_string).collect()),
        ),
    }
}

/// Mask sensitive parts of URL for logging.
pub fn mask_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        "[invalid url]".to_string()
    }
}
