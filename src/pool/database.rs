//! Database instantiation of the connection pool.
//!
//! The actual driver is an external collaborator behind [`DatabaseDriver`];
//! this module owns the configuration shape, per-driver defaults and the DSN
//! formats.

use crate::core::ConfigDocument;
use crate::error::{BoxError, ConnectionError, Result};
use crate::pool::{ConnectionPool, Connector};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// MySQL / MariaDB
    Mysql,
    /// PostgreSQL
    #[serde(alias = "pgsql", alias = "postgresql")]
    Postgres,
    /// SQLite; `host` is the database file
    Sqlite,
}

/// Connection-pool bounds handed to the driver when it opens a connection.
///
/// Applied once at dial time, never re-applied on later acquires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum idle connections
    pub max_idle: u32,
    /// Maximum open connections
    pub max_open: u32,
    /// Maximum lifetime of one physical connection
    pub max_lifetime: Duration,
}

/// Database options read from a configuration document.
///
/// Any key missing from the document falls back to the driver default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseOptions {
    /// Driver
    pub driver: DatabaseKind,
    /// Host name (file path for SQLite)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// Database name
    pub database: String,
    /// Schema search path (PostgreSQL)
    pub schema: String,
    /// Character set (MySQL)
    pub charset: String,
    /// Trailing driver options, `key=value&key=value`
    pub query: String,
    /// See [`PoolSettings::max_idle`]
    pub max_idle_conns: u32,
    /// See [`PoolSettings::max_open`]
    pub max_conns: u32,
    /// See [`PoolSettings::max_lifetime`]
    pub conn_max_lifetime: Duration,
    /// Dial timeout
    pub connect_timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawDatabaseOptions {
    driver: Option<DatabaseKind>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    database: Option<String>,
    schema: Option<String>,
    charset: Option<String>,
    query: Option<String>,
    #[serde(alias = "max_idle_conns")]
    max_idle_conns: Option<u32>,
    #[serde(alias = "max_conns")]
    max_conns: Option<u32>,
    #[serde(alias = "conn_max_lifetime_secs")]
    conn_max_lifetime_secs: Option<u64>,
    #[serde(alias = "connect_timeout_ms")]
    connect_timeout_ms: Option<u64>,
}

impl DatabaseOptions {
    /// Driver defaults.
    pub fn defaults(driver: DatabaseKind) -> Self {
        let common = Self {
            driver,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            schema: String::new(),
            charset: String::new(),
            query: String::new(),
            max_idle_conns: 10,
            max_conns: 100,
            conn_max_lifetime: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(3),
        };

        match driver {
            DatabaseKind::Mysql => Self {
                host: "127.0.0.1".into(),
                port: 3306,
                username: "root".into(),
                password: "root".into(),
                database: "mysql".into(),
                charset: "utf8mb4".into(),
                query: "parseTime=True&loc=Local&timeout=3000ms".into(),
                ..common
            },
            DatabaseKind::Postgres => Self {
                host: "localhost".into(),
                port: 5432,
                username: "postgres".into(),
                password: "postgres".into(),
                database: "postgres".into(),
                schema: "public".into(),
                ..common
            },
            DatabaseKind::Sqlite => Self {
                host: "app.db".into(),
                database: "main".into(),
                ..common
            },
        }
    }

    /// Read options from a whole document, filling gaps with driver defaults.
    ///
    /// The driver defaults to MySQL when the document does not name one.
    pub fn from_document(document: &ConfigDocument) -> Result<Self> {
        let raw: RawDatabaseOptions = document.deserialize()?;
        let defaults = Self::defaults(raw.driver.unwrap_or(DatabaseKind::Mysql));

        Ok(Self {
            driver: defaults.driver,
            host: raw.host.unwrap_or(defaults.host),
            port: raw.port.unwrap_or(defaults.port),
            username: raw.username.unwrap_or(defaults.username),
            password: raw.password.unwrap_or(defaults.password),
            database: raw.database.unwrap_or(defaults.database),
            schema: raw.schema.unwrap_or(defaults.schema),
            charset: raw.charset.unwrap_or(defaults.charset),
            query: raw.query.unwrap_or(defaults.query),
            max_idle_conns: raw.max_idle_conns.unwrap_or(defaults.max_idle_conns),
            max_conns: raw.max_conns.unwrap_or(defaults.max_conns),
            conn_max_lifetime: raw
                .conn_max_lifetime_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.conn_max_lifetime),
            connect_timeout: raw
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
        })
    }

    /// The driver-specific connection string.
    ///
    /// - MySQL: `user:pass@tcp(host:port)/db?charset=CHARSET&QUERY`
    /// - PostgreSQL: `host=H port=P user=U password=W dbname=D search_path=S sslmode=disable`
    /// - SQLite: the host field, i.e. the database file
    pub fn dsn(&self) -> String {
        match self.driver {
            DatabaseKind::Mysql => {
                let mut dsn = format!(
                    "{}:{}@tcp({}:{})/{}?charset={}",
                    self.username, self.password, self.host, self.port, self.database, self.charset
                );
                if !self.query.is_empty() {
                    dsn.push('&');
                    dsn.push_str(&self.query);
                }
                dsn
            }
            DatabaseKind::Postgres => {
                let mut dsn = format!(
                    "host={} port={} user={} password={} dbname={}",
                    self.host, self.port, self.username, self.password, self.database
                );
                if !self.schema.is_empty() {
                    dsn.push_str(&format!(" search_path={}", self.schema));
                }
                dsn.push_str(" sslmode=disable");
                if !self.query.is_empty() {
                    for option in self.query.split('&').filter(|o| !o.is_empty()) {
                        dsn.push(' ');
                        dsn.push_str(option);
                    }
                }
                dsn
            }
            DatabaseKind::Sqlite => self.host.clone(),
        }
    }

    /// Pool bounds to hand to the driver.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_idle: self.max_idle_conns,
            max_open: self.max_conns,
            max_lifetime: self.conn_max_lifetime,
        }
    }
}

/// Opens database connections for one driver family.
#[async_trait]
pub trait DatabaseDriver: Send + Sync + 'static {
    /// Driver connection (usually itself a physical pool).
    type Connection: Send + Sync + 'static;

    /// Open a connection, applying `settings`.
    async fn open(
        &self,
        kind: DatabaseKind,
        dsn: &str,
        settings: PoolSettings,
    ) -> std::result::Result<Self::Connection, BoxError>;

    /// Whether the driver has closed `connection`.
    fn is_closed(&self, _connection: &Self::Connection) -> bool {
        false
    }
}

/// [`Connector`] for databases.
pub struct DatabaseConnector<D> {
    driver: D,
}

impl<D: DatabaseDriver> DatabaseConnector<D> {
    /// Wrap a driver.
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

#[async_trait]
impl<D: DatabaseDriver> Connector for DatabaseConnector<D> {
    type Connection = D::Connection;
    type Options = DatabaseOptions;

    fn kind(&self) -> &'static str {
        "database"
    }

    fn options(&self, document: &ConfigDocument) -> Result<DatabaseOptions> {
        DatabaseOptions::from_document(document)
    }

    fn dsn(&self, options: &DatabaseOptions) -> String {
        options.dsn()
    }

    fn dial_timeout(&self, options: &DatabaseOptions) -> Duration {
        options.connect_timeout
    }

    async fn dial(
        &self,
        dsn: &str,
        options: &DatabaseOptions,
    ) -> std::result::Result<D::Connection, ConnectionError> {
        self.driver
            .open(options.driver, dsn, options.pool_settings())
            .await
            .map_err(|e| ConnectionError::dial("database", dsn, e))
    }

    fn is_closed(&self, connection: &D::Connection) -> bool {
        self.driver.is_closed(connection)
    }
}

/// A pool of database connections.
pub type DatabasePool<D> = ConnectionPool<DatabaseConnector<D>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConfigStore;
    use crate::notify::ChangeNotifier;
    use parking_lot::Mutex;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn document(dir: &Path, content: &str) -> ConfigDocument {
        let path = dir.join("db.yaml");
        fs::write(&path, content).unwrap();
        ConfigDocument::load("db", &path).unwrap()
    }

    #[test]
    fn test_mysql_dsn_shape() {
        let temp_dir = TempDir::new().unwrap();
        let doc = document(
            temp_dir.path(),
            r#"
driver: mysql
host: 10.0.0.5
port: 3307
username: app
password: secret
database: shop
charset: utf8mb4
query: parseTime=True&loc=Local
"#,
        );

        let options = DatabaseOptions::from_document(&doc).unwrap();
        assert_eq!(
            options.dsn(),
            "app:secret@tcp(10.0.0.5:3307)/shop?charset=utf8mb4&parseTime=True&loc=Local"
        );
    }

    #[test]
    fn test_mysql_defaults_fill_gaps() {
        let temp_dir = TempDir::new().unwrap();
        let doc = document(temp_dir.path(), "host: db.internal\n");

        let options = DatabaseOptions::from_document(&doc).unwrap();
        assert_eq!(options.driver, DatabaseKind::Mysql);
        assert_eq!(options.port, 3306);
        assert_eq!(options.max_idle_conns, 10);
        assert_eq!(options.max_conns, 100);
        assert_eq!(options.conn_max_lifetime, Duration::from_secs(3600));
        assert_eq!(
            options.dsn(),
            "root:root@tcp(db.internal:3306)/mysql?charset=utf8mb4&parseTime=True&loc=Local&timeout=3000ms"
        );
    }

    #[test]
    fn test_postgres_dsn_shape() {
        let temp_dir = TempDir::new().unwrap();
        let doc = document(
            temp_dir.path(),
            "driver: pgsql\nhost: pg\nusername: u\npassword: p\ndatabase: app\n",
        );

        let options = DatabaseOptions::from_document(&doc).unwrap();
        assert_eq!(options.driver, DatabaseKind::Postgres);
        assert_eq!(
            options.dsn(),
            "host=pg port=5432 user=u password=p dbname=app search_path=public sslmode=disable"
        );
    }

    #[test]
    fn test_sqlite_dsn_is_file() {
        let temp_dir = TempDir::new().unwrap();
        let doc = document(temp_dir.path(), "driver: sqlite\nhost: /var/lib/app.db\n");

        let options = DatabaseOptions::from_document(&doc).unwrap();
        assert_eq!(options.dsn(), "/var/lib/app.db");
    }

    #[test]
    fn test_pool_settings_from_kebab_keys() {
        let temp_dir = TempDir::new().unwrap();
        let doc = document(
            temp_dir.path(),
            "max-idle-conns: 4\nmax-conns: 16\nconn-max-lifetime-secs: 60\nconnect-timeout-ms: 500\n",
        );

        let options = DatabaseOptions::from_document(&doc).unwrap();
        assert_eq!(
            options.pool_settings(),
            PoolSettings {
                max_idle: 4,
                max_open: 16,
                max_lifetime: Duration::from_secs(60),
            }
        );
        assert_eq!(options.connect_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_unknown_driver_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let doc = document(temp_dir.path(), "driver: oracle\n");
        assert!(DatabaseOptions::from_document(&doc).is_err());
    }

    #[derive(Default)]
    struct RecordingDriver {
        opened: Mutex<Vec<(DatabaseKind, String, PoolSettings)>>,
    }

    #[async_trait]
    impl DatabaseDriver for RecordingDriver {
        type Connection = String;

        async fn open(
            &self,
            kind: DatabaseKind,
            dsn: &str,
            settings: PoolSettings,
        ) -> std::result::Result<String, BoxError> {
            if dsn.contains("unreachable") {
                return Err("connection refused".into());
            }
            self.opened.lock().push((kind, dsn.to_string(), settings));
            Ok(dsn.to_string())
        }
    }

    #[tokio::test]
    async fn test_pool_applies_settings_once() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("db.yaml"),
            "driver: sqlite\nhost: test.db\nmax-conns: 7\n",
        )
        .unwrap();
        let store = ConfigStore::open(temp_dir.path(), ChangeNotifier::new()).unwrap();
        let pool: DatabasePool<RecordingDriver> =
            ConnectionPool::new(DatabaseConnector::new(RecordingDriver::default()), store);

        let first = pool.acquire("db").await.unwrap();
        let second = pool.acquire("db").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let opened = pool.connector().driver().opened.lock().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0, DatabaseKind::Sqlite);
        assert_eq!(opened[0].1, "test.db");
        assert_eq!(opened[0].2.max_open, 7);
    }

    #[tokio::test]
    async fn test_pool_surfaces_driver_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("db.yaml"),
            "driver: sqlite\nhost: unreachable.db\n",
        )
        .unwrap();
        let store = ConfigStore::open(temp_dir.path(), ChangeNotifier::new()).unwrap();
        let pool = ConnectionPool::new(DatabaseConnector::new(RecordingDriver::default()), store);

        let err = pool.acquire("db").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Dial { kind: "database", .. }));
        assert!(err.to_string().contains("connection refused"));
    }
}
