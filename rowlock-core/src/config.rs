use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::LockError;

/// Width of the `cluster_id` column.
pub const CLUSTER_ID_MAX_LEN: usize = 20;
/// PostgreSQL truncates identifiers longer than this.
const TABLE_NAME_MAX_LEN: usize = 63;
/// `lock_timeout` is an `int` of milliseconds on the server.
pub const CONTENTION_TIMEOUT_MAX_SECS: u64 = i32::MAX as u64 / 1000;
const DEFAULT_APPLICATION_NAME: &str = "rowlock";
const ENV_PREFIX: &str = "ROWLOCK";

/// Backend named by the `driverIdentity` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Postgres,
    /// In-process driver, see [`crate::memory`].
    Memory,
}

impl DriverKind {
    fn parse(value: &str) -> Result<Self, LockError> {
        match value.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(LockError::Configuration(format!(
                "unsupported driverIdentity `{other}`"
            ))),
        }
    }
}

/// TLS negotiation mode for the PostgreSQL driver, using libpq's names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(value: &str) -> Result<Self, LockError> {
        match value.trim().to_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(LockError::Configuration(format!(
                "unsupported sslMode `{other}`"
            ))),
        }
    }
}

/// Raw, unvalidated options as they arrive from a map or the environment.
#[derive(Debug, Default, Deserialize)]
struct LockOptions {
    endpoint: Option<String>,
    driver_identity: Option<String>,
    username: Option<String>,
    password: Option<String>,
    table_name: Option<String>,
    cluster_id: Option<String>,
    contention_timeout_seconds: Option<String>,
    ssl_mode: Option<String>,
    application_name: Option<String>,
}

impl LockOptions {
    fn from_map(map: &HashMap<String, String>) -> Self {
        let get = |camel: &str, snake: &str| {
            map.get(camel)
                .or_else(|| map.get(snake))
                .map(|value| value.to_string())
        };
        Self {
            endpoint: get("endpoint", "endpoint"),
            driver_identity: get("driverIdentity", "driver_identity"),
            username: get("username", "username"),
            password: get("password", "password"),
            table_name: get("tableName", "table_name"),
            cluster_id: get("clusterId", "cluster_id"),
            contention_timeout_seconds: get(
                "contentionTimeoutSeconds",
                "contention_timeout_seconds",
            ),
            ssl_mode: get("sslMode", "ssl_mode"),
            application_name: get("applicationName", "application_name"),
        }
    }
}

fn required(value: Option<String>, key: &str) -> Result<String, LockError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(LockError::Configuration(format!(
            "missing required option `{key}`"
        ))),
    }
}

/// A table name is either `table` or `schema.table`; each part is one
/// identifier.
fn validate_table_name(table_name: &str) -> Result<(), LockError> {
    let parts: Vec<&str> = table_name.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(LockError::Configuration(format!(
            "tableName `{table_name}` must be `table` or `schema.table`"
        )));
    }
    if let Some(part) = parts.iter().find(|part| part.len() > TABLE_NAME_MAX_LEN) {
        return Err(LockError::Configuration(format!(
            "tableName part `{part}` exceeds {TABLE_NAME_MAX_LEN} bytes"
        )));
    }
    Ok(())
}

/// Immutable lock configuration.
#[derive(Clone)]
pub struct LockConfig {
    endpoint: String,
    driver: DriverKind,
    username: Option<String>,
    password: Option<String>,
    table_name: String,
    cluster_id: String,
    contention_timeout: Duration,
    ssl_mode: SslMode,
    application_name: String,
}

impl fmt::Debug for LockConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockConfig")
            .field("endpoint", &self.endpoint)
            .field("driver", &self.driver)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("table_name", &self.table_name)
            .field("cluster_id", &self.cluster_id)
            .field("contention_timeout", &self.contention_timeout)
            .field("ssl_mode", &self.ssl_mode)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl LockConfig {
    /// Build from a flat key/value mapping. Unknown keys are ignored.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, LockError> {
        Self::from_options(LockOptions::from_map(map))
    }

    /// Load from `ROWLOCK_*` environment variables, e.g. `ROWLOCK_CLUSTER_ID`.
    pub fn load() -> Result<Self, LockError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .map_err(|e| LockError::Configuration(format!("failed to load configuration: {e}")))?;
        let options: LockOptions = settings.try_deserialize().map_err(|e| {
            LockError::Configuration(format!("failed to deserialize configuration: {e}"))
        })?;
        Self::from_options(options)
    }

    fn from_options(options: LockOptions) -> Result<Self, LockError> {
        let endpoint = required(options.endpoint, "endpoint")?;
        let driver = DriverKind::parse(&required(options.driver_identity, "driverIdentity")?)?;
        let table_name = required(options.table_name, "tableName")?;
        let cluster_id = required(options.cluster_id, "clusterId")?;
        let raw_timeout = required(options.contention_timeout_seconds, "contentionTimeoutSeconds")?;

        validate_table_name(&table_name)?;
        if cluster_id.chars().count() > CLUSTER_ID_MAX_LEN {
            return Err(LockError::Configuration(format!(
                "clusterId `{cluster_id}` exceeds {CLUSTER_ID_MAX_LEN} characters"
            )));
        }
        let seconds: u64 = raw_timeout.parse().map_err(|_| {
            LockError::Configuration(format!(
                "contentionTimeoutSeconds must be a non-negative integer, got `{raw_timeout}`"
            ))
        })?;
        if seconds > CONTENTION_TIMEOUT_MAX_SECS {
            return Err(LockError::Configuration(format!(
                "contentionTimeoutSeconds {seconds} exceeds {CONTENTION_TIMEOUT_MAX_SECS}"
            )));
        }
        let ssl_mode = match options.ssl_mode.as_deref() {
            Some(value) if !value.trim().is_empty() => SslMode::parse(value)?,
            _ => SslMode::default(),
        };

        Ok(Self {
            endpoint,
            driver,
            username: options.username.filter(|u| !u.is_empty()),
            password: options.password.filter(|p| !p.is_empty()),
            table_name,
            cluster_id,
            contention_timeout: Duration::from_secs(seconds),
            ssl_mode,
            application_name: options
                .application_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Upper bound on how long `acquire()` waits for a contended row.
    pub fn contention_timeout(&self) -> Duration {
        self.contention_timeout
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full() -> HashMap<String, String> {
        options(&[
            ("endpoint", "postgresql://db.internal:5432/app"),
            ("driverIdentity", "postgres"),
            ("username", "scheduler"),
            ("password", "s3cret"),
            ("tableName", "node_lock"),
            ("clusterId", "c1"),
            ("contentionTimeoutSeconds", "5"),
        ])
    }

    #[test]
    fn parses_recognized_options() {
        let cfg = LockConfig::from_map(&full()).expect("valid config");
        assert_eq!(cfg.endpoint(), "postgresql://db.internal:5432/app");
        assert_eq!(cfg.driver(), DriverKind::Postgres);
        assert_eq!(cfg.username(), Some("scheduler"));
        assert_eq!(cfg.password(), Some("s3cret"));
        assert_eq!(cfg.table_name(), "node_lock");
        assert_eq!(cfg.cluster_id(), "c1");
        assert_eq!(cfg.contention_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.ssl_mode(), SslMode::Disable);
        assert_eq!(cfg.application_name(), "rowlock");
    }

    #[test]
    fn credentials_are_optional_and_unknown_keys_ignored() {
        let mut map = full();
        map.remove("username");
        map.remove("password");
        map.insert("lock.level".to_string(), "50".to_string());

        let cfg = LockConfig::from_map(&map).expect("valid config");
        assert_eq!(cfg.username(), None);
        assert_eq!(cfg.password(), None);
    }

    #[test]
    fn snake_case_aliases_are_accepted() {
        let map = options(&[
            ("endpoint", "host=localhost"),
            ("driver_identity", "postgresql"),
            ("table_name", "node_lock"),
            ("cluster_id", "c2"),
            ("contention_timeout_seconds", "0"),
            ("ssl_mode", "verify-full"),
        ]);
        let cfg = LockConfig::from_map(&map).expect("valid config");
        assert_eq!(cfg.cluster_id(), "c2");
        assert_eq!(cfg.contention_timeout(), Duration::ZERO);
        assert_eq!(cfg.ssl_mode(), SslMode::VerifyFull);
    }

    #[test]
    fn missing_required_option_fails() {
        for key in [
            "endpoint",
            "driverIdentity",
            "tableName",
            "clusterId",
            "contentionTimeoutSeconds",
        ] {
            let mut map = full();
            map.remove(key);
            match LockConfig::from_map(&map) {
                Err(LockError::Configuration(msg)) => assert!(msg.contains(key), "{msg}"),
                other => panic!("expected configuration error for {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn blank_required_option_counts_as_missing() {
        let mut map = full();
        map.insert("clusterId".to_string(), "   ".to_string());
        assert!(matches!(
            LockConfig::from_map(&map),
            Err(LockError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_malformed_values() {
        let cases = [
            ("contentionTimeoutSeconds", "-1"),
            ("contentionTimeoutSeconds", "soon"),
            ("driverIdentity", "oracle"),
            ("sslMode", "sometimes"),
            ("clusterId", "a-cluster-name-that-is-too-long"),
            ("contentionTimeoutSeconds", "2147484"),
            ("contentionTimeoutSeconds", "18446744073709551615"),
            ("tableName", "a.b.c"),
            ("tableName", "ops."),
            ("tableName", ".node_lock"),
        ];
        for (key, value) in cases {
            let mut map = full();
            map.insert(key.to_string(), value.to_string());
            assert!(
                matches!(LockConfig::from_map(&map), Err(LockError::Configuration(_))),
                "{key}={value} should be rejected"
            );
        }

        let mut map = full();
        map.insert("tableName".to_string(), "t".repeat(64));
        assert!(matches!(
            LockConfig::from_map(&map),
            Err(LockError::Configuration(_))
        ));
    }

    #[test]
    fn accepts_largest_server_lock_timeout() {
        let mut map = full();
        map.insert("contentionTimeoutSeconds".to_string(), "2147483".to_string());
        let cfg = LockConfig::from_map(&map).expect("valid config");
        assert_eq!(
            cfg.contention_timeout(),
            Duration::from_secs(CONTENTION_TIMEOUT_MAX_SECS)
        );
    }

    #[test]
    fn accepts_schema_qualified_table() {
        let mut map = full();
        map.insert("tableName".to_string(), "ops.node_lock".to_string());
        let cfg = LockConfig::from_map(&map).expect("valid config");
        assert_eq!(cfg.table_name(), "ops.node_lock");
    }

    #[test]
    fn ssl_mode_parser_handles_supported_values() {
        assert_eq!(SslMode::parse("disable").ok(), Some(SslMode::Disable));
        assert_eq!(SslMode::parse("prefer").ok(), Some(SslMode::Prefer));
        assert_eq!(SslMode::parse("require").ok(), Some(SslMode::Require));
        assert_eq!(SslMode::parse("verify-ca").ok(), Some(SslMode::VerifyCa));
        assert_eq!(SslMode::parse("verify-full").ok(), Some(SslMode::VerifyFull));
        assert_eq!(SslMode::parse("DiSaBlE").ok(), Some(SslMode::Disable));
        assert!(SslMode::parse("unknown-value").is_err());
    }

    #[test]
    fn debug_output_redacts_password() {
        let cfg = LockConfig::from_map(&full()).expect("valid config");
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }
}
