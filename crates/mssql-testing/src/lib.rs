//! # mssql-testing
//!
//! Test infrastructure for the SQL Server command pipeline.
//!
//! The crate provides an in-memory mock server that implements the client's
//! transport traits, so tests run the real login, failover, recovery and
//! command code without a network or a SQL Server instance.
//!
//! ## Features
//!
//! - Scripted login behavior per host: accept, refuse, hang, reject, route
//! - Canned statement and procedure responses with output parameters
//! - Prepared handle bookkeeping per physical connection
//! - Request, login and attention recording for assertions
//! - Fixtures for parameter encryption
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_client::{Command, Connection};
//! use mssql_testing::{fixtures, MockLogin, MockResponse, MockTdsServer};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockTdsServer::builder()
//!         .with_host("primary", MockLogin::Accept)
//!         .with_response("DELETE FROM t", MockResponse::affected(2))
//!         .build();
//!     let conn = Connection::open(fixtures::config("primary"), server.connector())
//!         .await
//!         .unwrap();
//!     let result = Command::new("DELETE FROM t").execute_non_query(&conn).await.unwrap();
//!     assert_eq!(result.rows_affected, 2);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_server;

pub use mock_server::{
    MockLogin, MockResponse, MockServerBuilder, MockServerConfig, MockTdsServer, RecordedCall,
    RecordedLogin, RecordedRequest,
};

