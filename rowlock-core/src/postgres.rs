use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use native_tls::TlsConnector;
use postgres::error::SqlState;
use postgres::{CancelToken, Client, NoTls};
use postgres_native_tls::MakeTlsConnector;
use siphasher::sip::SipHasher13;
use tracing::{debug, warn};

use crate::config::{LockConfig, SslMode};
use crate::error::{DriverError, LockError};
use crate::sql::{set_lock_timeout, Statements};
use crate::store::{Canceller, Connector, LockConnection, LockWait};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS negotiation chosen by `sslMode`.
enum Transport {
    Plain,
    /// Try TLS first and fall back to plaintext.
    Opportunistic(MakeTlsConnector),
    Tls(MakeTlsConnector),
}

impl Transport {
    fn for_mode(mode: SslMode) -> Result<Self, native_tls::Error> {
        let mut builder = TlsConnector::builder();
        match mode {
            SslMode::Disable => return Ok(Transport::Plain),
            SslMode::Prefer | SslMode::Require => {
                builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
            }
            SslMode::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
            SslMode::VerifyFull => {}
        }
        let connector = MakeTlsConnector::new(builder.build()?);
        Ok(match mode {
            SslMode::Prefer => Transport::Opportunistic(connector),
            _ => Transport::Tls(connector),
        })
    }

    fn describe(&self) -> &'static str {
        match self {
            Transport::Plain => "plain",
            Transport::Opportunistic(_) => "tls-or-plain",
            Transport::Tls(_) => "tls",
        }
    }
}

/// Accepts libpq key/value strings, `postgresql://` URLs and the
/// `jdbc:postgresql://` form older deployments carry over.
fn build_pg_config(config: &LockConfig) -> Result<postgres::Config, LockError> {
    let endpoint = config
        .endpoint()
        .strip_prefix("jdbc:")
        .unwrap_or(config.endpoint());
    let mut pg = postgres::Config::from_str(endpoint)
        .map_err(|e| LockError::Configuration(format!("invalid endpoint: {e}")))?;
    if let Some(user) = config.username() {
        pg.user(user);
    }
    if let Some(password) = config.password() {
        pg.password(password);
    }
    pg.application_name(config.application_name());
    pg.connect_timeout(CONNECT_TIMEOUT);
    Ok(pg)
}

/// Advisory lock key serializing bootstrap of one table across processes.
fn bootstrap_lock_key(table: &str) -> i64 {
    let mut hasher = SipHasher13::new_with_key(&[0u8; 16]);
    table.hash(&mut hasher);
    hasher.finish() as i64
}

fn classify(err: postgres::Error, table: &str) -> DriverError {
    match err.code() {
        Some(code) if *code == SqlState::LOCK_NOT_AVAILABLE => DriverError::LockTimeout,
        Some(code) if *code == SqlState::UNDEFINED_TABLE => {
            DriverError::UndefinedTable(table.to_string())
        }
        Some(code) if *code == SqlState::QUERY_CANCELED => DriverError::Cancelled,
        _ if err.is_closed() => DriverError::Closed,
        _ => DriverError::Postgres(err),
    }
}

/// Opens PostgreSQL sessions for one lock table.
pub struct PostgresConnector {
    pg: postgres::Config,
    transport: Transport,
    statements: Statements,
}

impl std::fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnector")
            .field("user", &self.pg.get_user())
            .field("dbname", &self.pg.get_dbname())
            .field("transport", &self.transport.describe())
            .field("table", &self.statements.table())
            .finish()
    }
}

impl PostgresConnector {
    pub fn new(config: &LockConfig) -> Result<Self, LockError> {
        let transport = Transport::for_mode(config.ssl_mode()).map_err(|e| {
            LockError::Configuration(format!(
                "cannot build TLS connector for sslMode {:?}: {e}",
                config.ssl_mode()
            ))
        })?;
        Ok(Self {
            pg: build_pg_config(config)?,
            transport,
            statements: Statements::new(config.table_name()),
        })
    }

    fn open(&self) -> Result<(Client, Option<MakeTlsConnector>), DriverError> {
        debug!(
            transport = self.transport.describe(),
            "connecting to PostgreSQL"
        );
        match &self.transport {
            Transport::Plain => Ok((self.pg.connect(NoTls)?, None)),
            Transport::Opportunistic(connector) => match self.pg.connect(connector.clone()) {
                Ok(client) => Ok((client, Some(connector.clone()))),
                Err(err) => {
                    warn!(
                        error = %err,
                        "TLS connection failed in sslMode=prefer, retrying without TLS"
                    );
                    Ok((self.pg.connect(NoTls)?, None))
                }
            },
            Transport::Tls(connector) => {
                Ok((self.pg.connect(connector.clone())?, Some(connector.clone())))
            }
        }
    }
}

impl Connector for PostgresConnector {
    fn connect(&self) -> Result<Box<dyn LockConnection>, DriverError> {
        let (client, tls) = self.open()?;
        Ok(Box::new(PostgresConnection {
            client,
            tls,
            statements: self.statements.clone(),
        }))
    }
}

struct PostgresConnection {
    client: Client,
    tls: Option<MakeTlsConnector>,
    statements: Statements,
}

impl PostgresConnection {
    fn batch(&mut self, sql: &str) -> Result<(), DriverError> {
        self.client
            .batch_execute(sql)
            .map_err(|e| classify(e, self.statements.table()))
    }
}

impl LockConnection for PostgresConnection {
    fn begin(&mut self) -> Result<(), DriverError> {
        self.batch("BEGIN")
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.batch("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.batch("ROLLBACK")
    }

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        self.client.close()?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn guard_schema(&mut self) -> Result<(), DriverError> {
        let key = bootstrap_lock_key(self.statements.table());
        self.client
            .execute("SELECT pg_advisory_xact_lock($1)", &[&key])
            .map_err(|e| classify(e, self.statements.table()))?;
        Ok(())
    }

    fn create_table(&mut self) -> Result<(), DriverError> {
        let sql = self.statements.create_table();
        self.batch(&sql)
    }

    fn read_markers(&mut self, cluster_id: &str) -> Result<Vec<i64>, DriverError> {
        let rows = self
            .client
            .query(self.statements.select_markers().as_str(), &[&cluster_id])
            .map_err(|e| classify(e, self.statements.table()))?;
        rows.iter()
            .map(|row| row.try_get::<_, i64>(0).map_err(DriverError::from))
            .collect()
    }

    fn insert_row(&mut self, cluster_id: &str, marker: i64) -> Result<(), DriverError> {
        self.client
            .execute(self.statements.insert_row().as_str(), &[&marker, &cluster_id])
            .map_err(|e| classify(e, self.statements.table()))?;
        Ok(())
    }

    fn lock_rows(&mut self, cluster_id: &str, wait: LockWait) -> Result<usize, DriverError> {
        let sql = match wait {
            LockWait::NoWait => self.statements.lock_rows(true),
            LockWait::Bounded(budget) => {
                self.batch(&set_lock_timeout(budget))?;
                self.statements.lock_rows(false)
            }
        };
        let rows = self
            .client
            .query(sql.as_str(), &[&cluster_id])
            .map_err(|e| classify(e, self.statements.table()))?;
        Ok(rows.len())
    }

    fn touch(&mut self, cluster_id: &str, marker: i64) -> Result<u64, DriverError> {
        self.client
            .execute(self.statements.touch().as_str(), &[&marker, &cluster_id])
            .map_err(|e| classify(e, self.statements.table()))
    }

    fn holds_transaction(&mut self) -> Result<bool, DriverError> {
        let row = self
            .client
            .query_one("SELECT txid_current_if_assigned()", &[])
            .map_err(|e| classify(e, self.statements.table()))?;
        Ok(row.try_get::<_, Option<i64>>(0)?.is_some())
    }

    fn canceller(&self) -> Option<Box<dyn Canceller>> {
        Some(Box::new(PgCanceller {
            token: self.client.cancel_token(),
            tls: self.tls.clone(),
        }))
    }
}

struct PgCanceller {
    token: CancelToken,
    tls: Option<MakeTlsConnector>,
}

impl Canceller for PgCanceller {
    fn cancel(&self) -> Result<(), DriverError> {
        match &self.tls {
            Some(connector) => self.token.cancel_query(connector.clone())?,
            None => self.token.cancel_query(NoTls)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lock_config(endpoint: &str, extra: &[(&str, &str)]) -> LockConfig {
        let mut map: HashMap<String, String> = [
            ("endpoint", endpoint),
            ("driverIdentity", "postgres"),
            ("tableName", "node_lock"),
            ("clusterId", "c1"),
            ("contentionTimeoutSeconds", "1"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            map.insert(k.to_string(), v.to_string());
        }
        LockConfig::from_map(&map).expect("valid config")
    }

    #[test]
    fn ssl_mode_selects_transport() -> anyhow::Result<()> {
        let cases = [
            ("disable", "plain"),
            ("prefer", "tls-or-plain"),
            ("require", "tls"),
            ("verify-ca", "tls"),
            ("verify-full", "tls"),
        ];
        for (mode, expected) in cases {
            let cfg = lock_config("host=localhost", &[("sslMode", mode)]);
            let connector = PostgresConnector::new(&cfg)?;
            assert_eq!(connector.transport.describe(), expected, "sslMode={mode}");
        }
        let default = PostgresConnector::new(&lock_config("host=localhost", &[]))?;
        assert!(matches!(default.transport, Transport::Plain));
        Ok(())
    }

    #[test]
    fn connector_debug_hides_password() -> anyhow::Result<()> {
        let cfg = lock_config(
            "postgresql://app@localhost/app",
            &[("password", "hunter2"), ("sslMode", "require")],
        );
        let rendered = format!("{:?}", PostgresConnector::new(&cfg)?);
        assert!(!rendered.contains("hunter2"), "{rendered}");
        assert!(rendered.contains("\"tls\""), "{rendered}");
        Ok(())
    }

    #[test]
    fn prefer_falls_back_and_still_reports_connect_failure() -> anyhow::Result<()> {
        // Nothing listens on port 1: the TLS attempt and the plaintext retry
        // both fail, and the caller sees a driver error rather than a panic.
        let cfg = lock_config(
            "host=127.0.0.1 port=1 user=postgres connect_timeout=1",
            &[("sslMode", "prefer")],
        );
        let connector = PostgresConnector::new(&cfg)?;
        assert!(matches!(connector.connect(), Err(DriverError::Postgres(_))));
        Ok(())
    }

    #[test]
    fn credentials_override_endpoint_user() -> anyhow::Result<()> {
        let cfg = lock_config(
            "postgresql://fallback@localhost:5432/app",
            &[("username", "scheduler"), ("password", "pw")],
        );
        let pg = build_pg_config(&cfg)?;
        assert_eq!(pg.get_user(), Some("scheduler"));
        assert_eq!(pg.get_password(), Some(&b"pw"[..]));
        assert_eq!(pg.get_application_name(), Some("rowlock"));
        assert_eq!(pg.get_dbname(), Some("app"));
        Ok(())
    }

    #[test]
    fn accepts_jdbc_and_key_value_endpoints() -> anyhow::Result<()> {
        let jdbc = build_pg_config(&lock_config("jdbc:postgresql://db:5433/scheduler", &[]))?;
        assert_eq!(jdbc.get_ports(), &[5433]);
        assert_eq!(jdbc.get_dbname(), Some("scheduler"));

        let kv = build_pg_config(&lock_config("host=localhost user=postgres dbname=app", &[]))?;
        assert_eq!(kv.get_user(), Some("postgres"));
        Ok(())
    }

    #[test]
    fn rejects_unparseable_endpoint() {
        let cfg = lock_config("postgresql://localhost:notaport/app", &[]);
        assert!(matches!(
            PostgresConnector::new(&cfg),
            Err(LockError::Configuration(_))
        ));
    }

    #[test]
    fn bootstrap_lock_key_is_stable_per_table() {
        assert_eq!(bootstrap_lock_key("node_lock"), bootstrap_lock_key("node_lock"));
        assert_ne!(bootstrap_lock_key("node_lock"), bootstrap_lock_key("other_lock"));
    }
}
