//! Connection string parsing edge cases.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use mssql_client::{Config, Credentials, Error};

// ============================================================================
// Basic Parsing Tests
// ============================================================================

#[test]
fn test_empty_connection_string() {
    let config = Config::from_connection_string("").unwrap();
    assert_eq!(config.host, "localhost");
    assert_eq!(config.port, 1433);
    assert_eq!(config.connect_retry_count, 1);
    assert_eq!(config.connect_retry_interval, Duration::from_secs(10));
}

#[test]
fn test_separators_only() {
    assert!(Config::from_connection_string(";;;").is_ok());
    assert!(Config::from_connection_string("   \t  ").is_ok());
}

// ============================================================================
// Key-Value Edge Cases
// ============================================================================

#[test]
fn test_key_without_value() {
    let config = Config::from_connection_string("Server=").unwrap();
    assert_eq!(config.host, "");
    // Parsing accepts it; opening a connection does not.
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_equals_sign() {
    assert!(Config::from_connection_string("Serverlocalhost;").is_err());
}

#[test]
fn test_equals_in_value() {
    let config = Config::from_connection_string("User Id=app;Password=a=b=c").unwrap();
    assert_eq!(config.credentials, Credentials::sql_server("app", "a=b=c"));
}

#[test]
fn test_case_insensitive_keys() {
    let config = Config::from_connection_string("SERVER=db;INITIAL CATALOG=orders").unwrap();
    assert_eq!(config.host, "db");
    assert_eq!(config.database.as_deref(), Some("orders"));
}

#[test]
fn test_alternative_key_names() {
    let config =
        Config::from_connection_string("Data Source=db;uid=app;pwd=pw;Connection Timeout=7")
            .unwrap();
    assert_eq!(config.host, "db");
    assert_eq!(config.credentials, Credentials::sql_server("app", "pw"));
    assert_eq!(config.connect_timeout, Some(Duration::from_secs(7)));
}

// ============================================================================
// Server Address Formats
// ============================================================================

#[test]
fn test_server_with_port_and_instance() {
    let config = Config::from_connection_string("Server=db\\REPORTING,1500").unwrap();
    assert_eq!(config.host, "db");
    assert_eq!(config.instance.as_deref(), Some("REPORTING"));
    assert_eq!(config.port, 1500);
    assert_eq!(config.protocol, None);
}

#[test]
fn test_server_with_protocol_prefix() {
    let config = Config::from_connection_string("Server=TCP:10.0.0.5,1433").unwrap();
    assert_eq!(config.protocol.as_deref(), Some("tcp"));
    assert_eq!(config.host, "10.0.0.5");
}

#[test]
fn test_invalid_port_number() {
    assert!(Config::from_connection_string("Server=db,abc").is_err());
    assert!(Config::from_connection_string("Server=db,70000").is_err());
}

// ============================================================================
// Failover and Recovery Settings
// ============================================================================

#[test]
fn test_failover_partner() {
    let config = Config::from_connection_string("Server=a;Failover Partner=b").unwrap();
    assert_eq!(config.failover_partner.as_deref(), Some("b"));

    let config = Config::from_connection_string("Server=a;Failover Partner=").unwrap();
    assert_eq!(config.failover_partner, None);
}

#[test]
fn test_retry_count_bounds() {
    let config = Config::from_connection_string("ConnectRetryCount=0").unwrap();
    assert_eq!(config.connect_retry_count, 0);
    assert!(Config::from_connection_string("ConnectRetryCount=256").is_err());
    assert!(Config::from_connection_string("ConnectRetryCount=-1").is_err());
}

#[test]
fn test_retry_interval_bounds() {
    let config = Config::from_connection_string("Connect Retry Interval=60").unwrap();
    assert_eq!(config.connect_retry_interval, Duration::from_secs(60));
    assert!(Config::from_connection_string("ConnectRetryInterval=61").is_err());
}

#[test]
fn test_network_resolution_flags() {
    let config = Config::from_connection_string("TransparentNetworkIPResolution=no").unwrap();
    assert_eq!(config.transparent_network_ip_resolution, Some(false));
    assert!(!config.is_parallel());

    let config = Config::from_connection_string("MultiSubnetFailover=yes").unwrap();
    assert!(config.multi_subnet_failover);
    assert!(config.is_parallel());
}

#[test]
fn test_multi_subnet_failover_with_partner() {
    let err =
        Config::from_connection_string("Server=a;MultiSubnetFailover=1;Failover Partner=b")
            .unwrap_err();
    assert!(matches!(err, Error::MultiSubnetFailoverWithPartner));
}

// ============================================================================
// Boolean and Numeric Values
// ============================================================================

#[test]
fn test_boolean_spellings() {
    for value in ["true", "True", "yes", "1"] {
        let config =
            Config::from_connection_string(&format!("TrustServerCertificate={value}")).unwrap();
        assert!(config.trust_server_certificate, "{value}");
    }
    for value in ["false", "NO", "0"] {
        let config = Config::from_connection_string(&format!("Encrypt={value}")).unwrap();
        assert!(!config.encrypt, "{value}");
    }
    assert!(Config::from_connection_string("Pooling=sometimes").is_err());
}

#[test]
fn test_zero_timeouts_mean_infinite() {
    let config = Config::from_connection_string("Connect Timeout=0;Command Timeout=0").unwrap();
    assert_eq!(config.connect_timeout, None);
    assert_eq!(config.command_timeout, None);
}

#[test]
fn test_invalid_timeout_value() {
    assert!(Config::from_connection_string("Connect Timeout=soon").is_err());
    assert!(Config::from_connection_string("Command Timeout=-5").is_err());
}

#[test]
fn test_packet_size() {
    let config = Config::from_connection_string("Packet Size=8192").unwrap();
    assert_eq!(config.packet_size, 8192);
    assert!(Config::from_connection_string("Packet Size=big").is_err());
}

#[test]
fn test_column_encryption_setting() {
    let config = Config::from_connection_string("Column Encryption Setting=Enabled").unwrap();
    assert!(config.column_encryption);
    let config = Config::from_connection_string("Column Encryption Setting=disabled").unwrap();
    assert!(!config.column_encryption);
    assert!(Config::from_connection_string("Column Encryption Setting=auto").is_err());
}

// ============================================================================
// Complex Connection Strings
// ============================================================================

#[test]
fn test_unknown_keys_ignored() {
    let config = Config::from_connection_string("Server=a;MultipleActiveResultSets=true;Foo=bar")
        .unwrap();
    assert_eq!(config.host, "a");
}

#[test]
fn test_whitespace_around_pairs() {
    let config = Config::from_connection_string("  Server = db ;  Database = orders  ").unwrap();
    assert_eq!(config.host, "db");
    assert_eq!(config.database.as_deref(), Some("orders"));
}

#[test]
fn test_repeated_keys_last_wins() {
    let config = Config::from_connection_string("Server=first;Server=second").unwrap();
    assert_eq!(config.host, "second");
}

#[test]
fn test_full_mirrored_connection_string() {
    let config = Config::from_connection_string(
        "Server=tcp:primary,1433;Failover Partner=mirror;Initial Catalog=orders;\
         User Id=app;Password=secret;Application Name=billing;Current Language=us_english;\
         Connect Timeout=15;Command Timeout=60;ConnectRetryCount=2;ConnectRetryInterval=5;\
         Encrypt=true;TrustServerCertificate=false",
    )
    .unwrap();

    assert_eq!(config.host, "primary");
    assert_eq!(config.failover_partner.as_deref(), Some("mirror"));
    assert_eq!(config.database.as_deref(), Some("orders"));
    assert_eq!(config.application_name, "billing");
    assert_eq!(config.language.as_deref(), Some("us_english"));
    assert_eq!(config.connect_timeout, Some(Duration::from_secs(15)));
    assert_eq!(config.command_timeout, Some(Duration::from_secs(60)));
    assert_eq!(config.connect_retry_count, 2);
    assert_eq!(config.connect_retry_interval, Duration::from_secs(5));
    assert!(config.validate().is_ok());
}
