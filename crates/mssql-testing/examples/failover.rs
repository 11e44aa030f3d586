//! Failover and session recovery against the in-memory server.
//!
//! The primary refuses connections, so the login fails over to the mirror.
//! The link is then broken under the connection and the next command
//! reconnects transparently, replaying the current database.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=mssql_client=debug cargo run -p mssql-testing --example failover
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use mssql_client::{Command, Connection, EnvChange, ResponseItem};
use mssql_testing::{MockLogin, MockResponse, MockTdsServer, fixtures};
use tds_rpc::{Parameter, SqlDbType};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = MockTdsServer::builder()
        .with_host("primary", MockLogin::Unreachable)
        .with_host("mirror", MockLogin::Accept)
        .with_failover_partner("primary")
        .with_response(
            "USE orders",
            MockResponse::empty().with_item(ResponseItem::EnvChange(EnvChange::Database(
                "orders".into(),
            ))),
        )
        .with_response("UPDATE orders SET shipped = 1 WHERE id = @id", MockResponse::affected(1))
        .build();

    let config = fixtures::config("primary").failover_partner("mirror");
    let conn = Connection::open(config, server.connector()).await?;
    println!("connected to {}", conn.data_source());

    Command::new("USE orders").execute_non_query(&conn).await?;

    let ship = Command::new("UPDATE orders SET shipped = 1 WHERE id = @id")
        .with_param(Parameter::input("@id", SqlDbType::Int, 42));
    ship.prepare(&conn)?;
    let result = ship.execute_non_query(&conn).await?;
    println!("shipped {} order(s)", result.rows_affected);

    server.break_connections();
    let result = ship.execute_non_query(&conn).await?;
    println!(
        "after reconnect #{}: shipped {} order(s) in {:?}",
        conn.reconnect_count(),
        result.rows_affected,
        conn.database()
    );

    for call in server.calls() {
        println!("  {} {:?}", call.name, call.handle);
    }
    Ok(())
}
