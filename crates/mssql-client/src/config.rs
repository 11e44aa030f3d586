//! Client configuration.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use mssql_auth::Credentials;

use crate::error::Error;

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Connect timeout used when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Server error numbers treated as transient by default.
///
/// Covers database unavailable (4060), resource governance limits (10928,
/// 10929), failover and reconfiguration in progress (40197, 40020, 40143,
/// 40166, 40540, 40613) and throttling (40501).
pub const DEFAULT_TRANSIENT_ERRORS: [i32; 10] = [
    4060, 10928, 10929, 40197, 40020, 40143, 40166, 40540, 40501, 40613,
];

/// The set of server error numbers worth retrying a connection open for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientErrors {
    numbers: HashSet<i32>,
}

impl TransientErrors {
    /// Create a set from explicit error numbers.
    pub fn new(numbers: impl IntoIterator<Item = i32>) -> Self {
        Self {
            numbers: numbers.into_iter().collect(),
        }
    }

    /// An empty set: nothing is retried.
    #[must_use]
    pub fn none() -> Self {
        Self::new([])
    }

    /// Add an error number.
    #[must_use]
    pub fn with(mut self, number: i32) -> Self {
        self.numbers.insert(number);
        self
    }

    /// Whether `number` is transient.
    #[must_use]
    pub fn contains(&self, number: i32) -> bool {
        self.numbers.contains(&number)
    }
}

impl Default for TransientErrors {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_ERRORS)
    }
}

/// Timing of the login retry loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoginBackoff {
    /// First sleep between failed attempts.
    pub initial: Duration,
    /// Sleeps double while below this value.
    pub doubling_limit: Duration,
    /// Sleep used once the doubling limit is reached.
    pub ceiling: Duration,
    /// Fraction of the connect timeout given to one failover attempt.
    pub failover_step: f64,
    /// Fraction of the connect timeout given to one parallel-resolution attempt.
    pub tnir_step: f64,
    /// Smallest slice granted to the first parallel-resolution attempt.
    pub tnir_first_attempt_floor: Duration,
    /// Timeout the slices are computed from when the connect timeout is infinite.
    pub infinite_timeout_base: Duration,
}

impl Default for LoginBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            doubling_limit: Duration::from_millis(500),
            ceiling: Duration::from_millis(1000),
            failover_step: 0.08,
            tnir_step: 0.125,
            tnir_first_attempt_floor: Duration::from_millis(500),
            infinite_timeout_base: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl LoginBackoff {
    /// The sleep that follows `current`.
    #[must_use]
    pub fn next_sleep(&self, current: Duration) -> Duration {
        if current < self.doubling_limit {
            current * 2
        } else {
            self.ceiling
        }
    }

    /// Unit slice for failover racing.
    #[must_use]
    pub fn failover_unit(&self, timeout: Option<Duration>) -> Duration {
        scale(timeout.unwrap_or(self.infinite_timeout_base), self.failover_step)
    }

    /// Unit slice for parallel resolution.
    #[must_use]
    pub fn parallel_unit(&self, timeout: Option<Duration>, tnir: bool) -> Duration {
        let step = if tnir { self.tnir_step } else { self.failover_step };
        scale(timeout.unwrap_or(self.infinite_timeout_base), step)
    }
}

fn scale(timeout: Duration, step: f64) -> Duration {
    Duration::from_millis((timeout.as_millis() as f64 * step).round() as u64)
}

/// How a command's text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// A SQL batch, parameterized or not.
    #[default]
    Text,
    /// The name of a stored procedure.
    StoredProcedure,
}

/// Column encryption behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnEncryptionSetting {
    /// Follow the connection's setting.
    #[default]
    UseConnectionSetting,
    /// Resolve parameter encryption and decrypt results.
    Enabled,
    /// Decrypt results only; parameters are never described.
    ResultSetOnly,
    /// No column encryption.
    Disabled,
}

impl ColumnEncryptionSetting {
    /// Whether parameters must be described, given the connection's setting.
    #[must_use]
    pub fn describes_parameters(self, connection_enabled: bool) -> bool {
        match self {
            Self::UseConnectionSetting => connection_enabled,
            Self::Enabled => true,
            Self::ResultSetOnly | Self::Disabled => false,
        }
    }
}

/// Configuration for a logical connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server hostname or alias.
    pub host: String,

    /// Server port.
    pub port: u16,

    /// Named instance.
    pub instance: Option<String>,

    /// Network protocol prefix, e.g. `tcp`.
    pub protocol: Option<String>,

    /// Failover partner for database mirroring.
    pub failover_partner: Option<String>,

    /// Initial database.
    pub database: Option<String>,

    /// Initial session language.
    pub language: Option<String>,

    /// Login credentials.
    pub credentials: Credentials,

    /// Application name reported at login.
    pub application_name: String,

    /// Race every address of a multi-subnet listener.
    pub multi_subnet_failover: bool,

    /// Transparent network IP resolution; `None` when not explicitly set.
    pub transparent_network_ip_resolution: Option<bool>,

    /// Connect timeout; `None` waits forever.
    pub connect_timeout: Option<Duration>,

    /// Default command timeout; `None` waits forever.
    pub command_timeout: Option<Duration>,

    /// Reconnection attempts for a broken session; `0` disables recovery.
    pub connect_retry_count: u32,

    /// Pause between reconnection attempts.
    pub connect_retry_interval: Duration,

    /// Whether parameters are transparently encrypted.
    pub column_encryption: bool,

    /// Server errors that justify retrying a connection open.
    pub transient_errors: TransientErrors,

    /// Host alias table, alias to `[protocol:]host[,port]`.
    pub aliases: HashMap<String, String>,

    /// Network packet size.
    pub packet_size: u16,

    /// Request an encrypted transport.
    pub encrypt: bool,

    /// Trust the server certificate without validation.
    pub trust_server_certificate: bool,

    /// Enlist in ambient distributed transactions.
    pub enlist: bool,

    /// Whether the connection participates in pooling.
    pub pooling: bool,

    /// Login retry timing.
    pub backoff: LoginBackoff,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            instance: None,
            protocol: None,
            failover_partner: None,
            database: None,
            language: None,
            credentials: Credentials::sql_server("sa", ""),
            application_name: "mssql-client".to_string(),
            multi_subnet_failover: false,
            transparent_network_ip_resolution: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            command_timeout: Some(Duration::from_secs(30)),
            connect_retry_count: 1,
            connect_retry_interval: Duration::from_secs(10),
            column_encryption: false,
            transient_errors: TransientErrors::default(),
            aliases: HashMap::new(),
            packet_size: 4096,
            encrypt: true,
            trust_server_certificate: false,
            enlist: true,
            pooling: true,
            backoff: LoginBackoff::default(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") || value == "0"
    {
        Ok(false)
    } else {
        Err(Error::Config(format!("invalid value for {key}: {value}")))
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value}")))
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a connection string into configuration.
    ///
    /// Connection strings have the format:
    /// `Server=host,port;Database=db;User Id=user;Password=pass;ConnectRetryCount=2`
    ///
    /// A zero `Connect Timeout` or `Command Timeout` means wait forever.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, Error> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "server" | "data source" | "address" | "addr" => {
                    let (protocol, rest) = match value.split_once(':') {
                        Some((p, rest)) if !p.is_empty() && !p.contains('\\') => {
                            (Some(p.to_lowercase()), rest)
                        }
                        _ => (None, value),
                    };
                    config.protocol = protocol;
                    let (host_part, port) = match rest.split_once(',') {
                        Some((h, p)) => (
                            h,
                            Some(p.trim().parse::<u16>().map_err(|_| {
                                Error::Config(format!("invalid port: {p}"))
                            })?),
                        ),
                        None => (rest, None),
                    };
                    if let Some((host, instance)) = host_part.split_once('\\') {
                        config.host = host.to_string();
                        config.instance = Some(instance.to_string());
                    } else {
                        config.host = host_part.to_string();
                    }
                    if let Some(port) = port {
                        config.port = port;
                    }
                }
                "failover partner" => {
                    config.failover_partner = (!value.is_empty()).then(|| value.to_string());
                }
                "database" | "initial catalog" => {
                    config.database = Some(value.to_string());
                }
                "current language" | "language" => {
                    config.language = Some(value.to_string());
                }
                "user id" | "uid" | "user" => {
                    if let Credentials::SqlServer { password, .. } = &config.credentials {
                        config.credentials = Credentials::sql_server(value.to_string(), password.clone());
                    }
                }
                "password" | "pwd" => {
                    if let Credentials::SqlServer { username, .. } = &config.credentials {
                        config.credentials = Credentials::sql_server(username.clone(), value.to_string());
                    }
                }
                "application name" | "app" => {
                    config.application_name = value.to_string();
                }
                "connect timeout" | "connection timeout" | "timeout" => {
                    let secs = parse_secs(&key, value)?;
                    config.connect_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "command timeout" => {
                    let secs = parse_secs(&key, value)?;
                    config.command_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "connectretrycount" | "connect retry count" => {
                    let count = parse_secs(&key, value)?;
                    if count > 255 {
                        return Err(Error::Config(format!("invalid value for {key}: {value}")));
                    }
                    config.connect_retry_count = count as u32;
                }
                "connectretryinterval" | "connect retry interval" => {
                    let secs = parse_secs(&key, value)?;
                    if !(1..=60).contains(&secs) {
                        return Err(Error::Config(format!("invalid value for {key}: {value}")));
                    }
                    config.connect_retry_interval = Duration::from_secs(secs);
                }
                "multisubnetfailover" | "multi subnet failover" => {
                    config.multi_subnet_failover = parse_bool(&key, value)?;
                }
                "transparentnetworkipresolution" | "transparent network ip resolution" => {
                    config.transparent_network_ip_resolution = Some(parse_bool(&key, value)?);
                }
                "column encryption setting" => {
                    config.column_encryption = if value.eq_ignore_ascii_case("enabled") {
                        true
                    } else if value.eq_ignore_ascii_case("disabled") {
                        false
                    } else {
                        return Err(Error::Config(format!("invalid value for {key}: {value}")));
                    };
                }
                "encrypt" => {
                    config.encrypt = parse_bool(&key, value)?;
                }
                "trustservercertificate" | "trust server certificate" => {
                    config.trust_server_certificate = parse_bool(&key, value)?;
                }
                "packet size" => {
                    config.packet_size = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid packet size: {value}")))?;
                }
                "pooling" => {
                    config.pooling = parse_bool(&key, value)?;
                }
                "enlist" => {
                    config.enlist = parse_bool(&key, value)?;
                }
                _ => {
                    tracing::debug!(key = key, "ignoring unknown connection string key");
                }
            }
        }

        if config.multi_subnet_failover && config.failover_partner.is_some() {
            return Err(Error::MultiSubnetFailoverWithPartner);
        }

        Ok(config)
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the named instance.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the failover partner.
    #[must_use]
    pub fn failover_partner(mut self, partner: impl Into<String>) -> Self {
        self.failover_partner = Some(partner.into());
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the initial language.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Enable or disable multi-subnet failover.
    #[must_use]
    pub fn multi_subnet_failover(mut self, enabled: bool) -> Self {
        self.multi_subnet_failover = enabled;
        self
    }

    /// Explicitly enable or disable transparent network IP resolution.
    #[must_use]
    pub fn transparent_network_ip_resolution(mut self, enabled: bool) -> Self {
        self.transparent_network_ip_resolution = Some(enabled);
        self
    }

    /// Set the connect timeout; `None` waits forever.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default command timeout; `None` waits forever.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the number of reconnection attempts.
    #[must_use]
    pub fn connect_retry_count(mut self, count: u32) -> Self {
        self.connect_retry_count = count;
        self
    }

    /// Set the pause between reconnection attempts.
    #[must_use]
    pub fn connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = interval;
        self
    }

    /// Enable or disable transparent parameter encryption.
    #[must_use]
    pub fn column_encryption(mut self, enabled: bool) -> Self {
        self.column_encryption = enabled;
        self
    }

    /// Replace the transient error set.
    #[must_use]
    pub fn transient_errors(mut self, errors: TransientErrors) -> Self {
        self.transient_errors = errors;
        self
    }

    /// Add a host alias.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases.insert(alias.into().to_lowercase(), target.into());
        self
    }

    /// Enable or disable transport encryption.
    #[must_use]
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Trust the server certificate.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Set the login retry timing.
    #[must_use]
    pub fn backoff(mut self, backoff: LoginBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether logins race addresses with growing timeout slices.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.multi_subnet_failover || self.effective_tnir()
    }

    /// Transparent network IP resolution as it applies to this configuration.
    ///
    /// On by default, but never together with multi-subnet failover.
    #[must_use]
    pub fn effective_tnir(&self) -> bool {
        !self.multi_subnet_failover && self.transparent_network_ip_resolution.unwrap_or(true)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.multi_subnet_failover && self.failover_partner.is_some() {
            return Err(Error::MultiSubnetFailoverWithPartner);
        }
        if self.connect_retry_count > 0 && self.connect_retry_interval.is_zero() {
            return Err(Error::Config(
                "connect retry interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_parsing() {
        let config = Config::from_connection_string(
            "Server=tcp:db.local\\SQLEXPRESS,1444;Database=orders;User Id=app;Password=pw;\
             ConnectRetryCount=3;ConnectRetryInterval=2;Connect Timeout=0",
        )
        .unwrap();
        assert_eq!(config.host, "db.local");
        assert_eq!(config.instance.as_deref(), Some("SQLEXPRESS"));
        assert_eq!(config.port, 1444);
        assert_eq!(config.protocol.as_deref(), Some("tcp"));
        assert_eq!(config.database.as_deref(), Some("orders"));
        assert_eq!(config.credentials, Credentials::sql_server("app", "pw"));
        assert_eq!(config.connect_retry_count, 3);
        assert_eq!(config.connect_retry_interval, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, None);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = Config::from_connection_string("Server=a;Workstation ID=box").unwrap();
        assert_eq!(config.host, "a");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_connection_string("Server").is_err());
        assert!(Config::from_connection_string("Server=a,notaport").is_err());
        assert!(Config::from_connection_string("ConnectRetryInterval=0").is_err());
        assert!(Config::from_connection_string("Encrypt=maybe").is_err());
    }

    #[test]
    fn test_multi_subnet_with_partner_rejected() {
        let err = Config::from_connection_string(
            "Server=a;Failover Partner=b;MultiSubnetFailover=true",
        )
        .unwrap_err();
        assert!(matches!(err, Error::MultiSubnetFailoverWithPartner));
    }

    #[test]
    fn test_tnir_defaults_on_but_yields_to_multi_subnet() {
        let config = Config::new();
        assert!(config.effective_tnir());
        assert!(config.is_parallel());

        let config = Config::new().multi_subnet_failover(true);
        assert!(!config.effective_tnir());
        assert!(config.is_parallel());

        let config = Config::new().transparent_network_ip_resolution(false);
        assert!(!config.is_parallel());
    }

    #[test]
    fn test_backoff_sequence() {
        let backoff = LoginBackoff::default();
        let mut sleep = backoff.initial;
        let mut seen = vec![sleep];
        for _ in 0..5 {
            sleep = backoff.next_sleep(sleep);
            seen.push(sleep);
        }
        let ms: Vec<u128> = seen.iter().map(Duration::as_millis).collect();
        assert_eq!(ms, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_backoff_units() {
        let backoff = LoginBackoff::default();
        assert_eq!(backoff.failover_unit(None), Duration::from_millis(1200));
        assert_eq!(
            backoff.parallel_unit(Some(Duration::from_secs(8)), true),
            Duration::from_secs(1)
        );
    }

    proptest::proptest! {
        #[test]
        fn backoff_never_shrinks_and_stays_capped(steps in 1usize..40) {
            let backoff = LoginBackoff::default();
            let mut sleep = backoff.initial;
            for _ in 0..steps {
                let next = backoff.next_sleep(sleep);
                proptest::prop_assert!(next >= sleep);
                proptest::prop_assert!(next <= backoff.ceiling);
                sleep = next;
            }
        }

        #[test]
        fn failover_unit_scales_with_timeout(secs in 1u64..600) {
            let backoff = LoginBackoff::default();
            let short = backoff.failover_unit(Some(Duration::from_secs(secs)));
            let long = backoff.failover_unit(Some(Duration::from_secs(secs + 1)));
            proptest::prop_assert!(long > short);
        }
    }

    #[test]
    fn test_column_encryption_setting() {
        assert!(ColumnEncryptionSetting::UseConnectionSetting.describes_parameters(true));
        assert!(!ColumnEncryptionSetting::UseConnectionSetting.describes_parameters(false));
        assert!(ColumnEncryptionSetting::Enabled.describes_parameters(false));
        assert!(!ColumnEncryptionSetting::ResultSetOnly.describes_parameters(true));
    }
}
