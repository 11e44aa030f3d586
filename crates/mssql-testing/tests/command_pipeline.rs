//! Command pipeline tests against the in-memory mock server.
//!
//! Covers the execution strategies, the prepared statement lifecycle, output
//! parameters and batches.
//!
//! ```bash
//! cargo test -p mssql-testing --test command_pipeline
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use mssql_client::{
    ColumnEncryptionSetting, Command, CommandKind, Connection, Error, PrepareState, ResultSet,
};
use mssql_testing::mock_server::{BATCH, UNKNOWN_HANDLE};
use mssql_testing::{MockLogin, MockResponse, MockTdsServer, fixtures};
use proptest::prelude::*;
use tds_rpc::{ParamValue, Parameter, ParameterCollection, ParameterDirection, RpcOptionFlags, SqlDbType};

const QUERY: &str = "SELECT name FROM customers WHERE id = @id";

fn server() -> MockTdsServer {
    MockTdsServer::builder()
        .with_host("primary", MockLogin::Accept)
        .with_response(
            QUERY,
            MockResponse::rows(
                ResultSet::new(["name"]).with_row(vec![ParamValue::Text("Ada".into())]),
            ),
        )
        .build()
}

async fn connect(server: &MockTdsServer) -> Connection {
    Connection::open(fixtures::config("primary"), server.connector())
        .await
        .expect("connection should open")
}

fn query() -> Command {
    Command::new(QUERY).with_param(Parameter::input("@id", SqlDbType::Int, 7))
}

// =============================================================================
// Execution strategies
// =============================================================================

#[tokio::test]
async fn test_text_without_params_is_sent_as_batch() {
    let server = server();
    server.set_response("DELETE FROM audit", MockResponse::affected(4));
    let conn = connect(&server).await;

    let result = Command::new("DELETE FROM audit")
        .execute_non_query(&conn)
        .await
        .expect("delete should succeed");

    assert_eq!(result.rows_affected, 4);
    let calls = server.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, BATCH);
    assert_eq!(calls[0].statement.as_deref(), Some("DELETE FROM audit"));
}

#[tokio::test]
async fn test_rows_affected_unset_without_count() {
    let server = server();
    let conn = connect(&server).await;

    let result = Command::new("SET NOCOUNT ON")
        .execute_non_query(&conn)
        .await
        .unwrap();
    assert_eq!(result.rows_affected, -1);
}

#[tokio::test]
async fn test_parameterized_text_uses_executesql() {
    let server = server();
    let conn = connect(&server).await;

    let mut rows = query().execute_query(&conn).await.unwrap();
    let row = rows.next_row().expect("one row");
    assert_eq!(row.get_str(0), Some("Ada"));
    assert!(rows.next_row().is_none());

    let calls = server.calls();
    assert_eq!(calls[0].name, "sp_executesql");
    assert_eq!(calls[0].statement.as_deref(), Some(QUERY));
    assert_eq!(calls[0].params.len(), 1);
    assert!(calls[0].params[0].matches_name("id"));
}

#[tokio::test]
async fn test_stored_procedure_outputs_and_return_status() {
    let server = server();
    server.set_response(
        "usp_order_total",
        MockResponse::affected(2)
            .with_output("@total", 42)
            .with_return_status(5),
    );
    let conn = connect(&server).await;

    let cmd = Command::procedure("usp_order_total")
        .with_param(Parameter::input("@order", SqlDbType::Int, 10))
        .with_param(
            Parameter::new("@total", SqlDbType::Int).with_direction(ParameterDirection::Output),
        )
        .with_param(Parameter::return_value("@rv"));
    let result = cmd.execute_non_query(&conn).await.unwrap();

    assert_eq!(result.rows_affected, 2);
    assert_eq!(result.return_status, Some(5));
    assert_eq!(
        result.get_output("total").map(|p| p.value.clone()),
        Some(ParamValue::Int(42))
    );
    assert_eq!(
        cmd.param("@total").and_then(|p| p.value),
        Some(ParamValue::Int(42))
    );
    assert_eq!(cmd.param("@rv").and_then(|p| p.value), Some(ParamValue::Int(5)));
    assert_eq!(server.call_names(), vec!["usp_order_total"]);
}

#[tokio::test]
async fn test_server_error_fails_the_execute() {
    let server = server();
    server.set_response(
        "UPDATE locked SET a = 1",
        MockResponse::error(1205, 13, "deadlock victim").with_info(5701, "context changed"),
    );
    let conn = connect(&server).await;

    let err = Command::new("UPDATE locked SET a = 1")
        .execute_non_query(&conn)
        .await
        .unwrap_err();
    assert!(err.is_server_error(1205));
    assert_eq!(err.messages().len(), 2);
    assert!(conn.is_usable());
}

#[tokio::test]
async fn test_loopback_executor_bypasses_sessions() {
    let server = server();
    let conn = Connection::builder(fixtures::config("primary"), server.connector())
        .loopback(server.loopback())
        .open()
        .await
        .unwrap();

    let mut rows = query().execute_query(&conn).await.unwrap();
    assert_eq!(rows.collect_rows().len(), 1);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].connection, 0);
    assert_eq!(server.sessions_opened(), 0);
}

#[tokio::test]
async fn test_empty_command_text_rejected() {
    let server = server();
    let conn = connect(&server).await;

    let err = Command::new("  ").execute_non_query(&conn).await.unwrap_err();
    assert!(matches!(err, Error::NoCommandText));
    assert!(server.calls().is_empty());
}

// =============================================================================
// Prepared statements
// =============================================================================

#[tokio::test]
async fn test_prepare_cycle() {
    let server = server();
    let conn = connect(&server).await;
    let cmd = query();

    cmd.prepare(&conn).unwrap();
    assert_eq!(cmd.prepare_state(), PrepareState::PreparePending);
    assert!(server.calls().is_empty(), "prepare sends nothing");

    cmd.execute_query(&conn).await.unwrap();
    assert_eq!(cmd.prepare_state(), PrepareState::Prepared);
    let handle = cmd.prepared_handle().expect("handle after prep-exec");

    cmd.execute_non_query(&conn).await.unwrap();
    cmd.execute_query(&conn).await.unwrap();

    let calls = server.calls();
    assert_eq!(calls[0].name, "sp_prepexec");
    assert_eq!(calls[0].handle, None);
    assert_eq!(calls[1].name, "sp_execute");
    assert_eq!(calls[1].handle, Some(handle));
    assert!(calls[1].options.contains(RpcOptionFlags::NO_METADATA));
    assert_eq!(calls[2].name, "sp_execute");
    assert!(!calls[2].options.contains(RpcOptionFlags::NO_METADATA));
}

#[tokio::test]
async fn test_prepare_without_params_stays_unprepared() {
    let server = server();
    let conn = connect(&server).await;
    let cmd = Command::new("SELECT 1");

    cmd.prepare(&conn).unwrap();
    assert_eq!(cmd.prepare_state(), PrepareState::Unprepared);
    cmd.execute_query(&conn).await.unwrap();
    assert_eq!(server.call_names(), vec![BATCH]);
}

#[tokio::test]
async fn test_changed_text_reprepares_with_previous_handle() {
    let server = server();
    let conn = connect(&server).await;
    let cmd = query();
    cmd.prepare(&conn).unwrap();
    cmd.execute_query(&conn).await.unwrap();
    let first = cmd.prepared_handle().unwrap();

    cmd.set_text("SELECT email FROM customers WHERE id = @id");
    assert!(cmd.is_dirty(&conn));
    cmd.execute_query(&conn).await.unwrap();

    let calls = server.calls();
    assert_eq!(calls[1].name, "sp_prepexec");
    assert_eq!(calls[1].handle, Some(first));
    assert_ne!(cmd.prepared_handle(), Some(first));
    assert!(!cmd.is_dirty(&conn));
}

#[tokio::test]
async fn test_changed_param_shape_marks_dirty() {
    let server = server();
    let conn = connect(&server).await;
    let cmd = query();
    cmd.prepare(&conn).unwrap();
    cmd.execute_query(&conn).await.unwrap();
    assert!(!cmd.is_dirty(&conn));

    cmd.update_params(|params| {
        if let Some(p) = params.get_mut("@id") {
            p.db_type = SqlDbType::BigInt;
        }
    });
    assert!(cmd.is_dirty(&conn));
}

#[tokio::test]
async fn test_unprepare_is_idempotent() {
    let server = server();
    let conn = connect(&server).await;
    let cmd = query();
    cmd.prepare(&conn).unwrap();
    cmd.execute_query(&conn).await.unwrap();
    let handle = cmd.prepared_handle().unwrap();
    assert_eq!(server.prepared_handles(), 1);

    cmd.unprepare(&conn).await.unwrap();
    cmd.unprepare(&conn).await.unwrap();

    let unprepares: Vec<_> = server
        .calls()
        .into_iter()
        .filter(|c| c.name == "sp_unprepare")
        .collect();
    assert_eq!(unprepares.len(), 1);
    assert_eq!(unprepares[0].handle, Some(handle));
    assert_eq!(cmd.prepare_state(), PrepareState::Unprepared);
    assert_eq!(server.prepared_handles(), 0);

    // Back to one-shot execution.
    cmd.execute_query(&conn).await.unwrap();
    assert_eq!(server.call_names().last().map(String::as_str), Some("sp_executesql"));
}

#[tokio::test]
async fn test_prepared_command_moves_to_another_connection() {
    let server = server();
    let first = connect(&server).await;
    let second = connect(&server).await;
    let cmd = query();
    cmd.prepare(&first).unwrap();
    cmd.execute_query(&first).await.unwrap();
    let handle = cmd.prepared_handle().unwrap();

    server.clear_log();
    cmd.execute_query(&second).await.unwrap();

    let calls = server.calls();
    assert_eq!(calls[0].name, "sp_unprepare");
    assert_eq!(calls[0].handle, Some(handle));
    assert_eq!(calls[1].name, "sp_executesql");
    assert_eq!(cmd.prepare_state(), PrepareState::Unprepared);
}

#[tokio::test]
async fn test_unknown_handle_error_surfaces() {
    let server = server();
    let conn = connect(&server).await;
    let cmd = query();
    cmd.prepare(&conn).unwrap();
    cmd.execute_query(&conn).await.unwrap();

    server.forget_prepared_handles();
    let err = cmd.execute_query(&conn).await.unwrap_err();
    assert!(err.is_server_error(UNKNOWN_HANDLE));
    assert!(conn.is_usable());

    // Unpreparing clears the stale handle; the next execute is one-shot.
    cmd.unprepare(&conn).await.unwrap();
    cmd.execute_query(&conn).await.unwrap();
    assert_eq!(server.call_names().last().map(String::as_str), Some("sp_executesql"));
}

// =============================================================================
// Batches
// =============================================================================

#[tokio::test]
async fn test_batch_reports_per_item_results() {
    let server = server();
    server.set_response("INSERT INTO a VALUES (@v)", MockResponse::affected(1));
    server.set_response("UPDATE b SET x = @v", MockResponse::error(547, 16, "constraint"));
    server.set_response("usp_archive", MockResponse::affected(3).with_info(0, "archived"));
    let conn = connect(&server).await;

    let cmd = Command::new("");
    let params = |v: i64| ParameterCollection::new().with(Parameter::input("@v", SqlDbType::BigInt, v));
    cmd.add_batch("INSERT INTO a VALUES (@v)", params(1)).unwrap();
    cmd.add_batch("UPDATE b SET x = @v", params(2)).unwrap();
    cmd.add_batch_call(
        "usp_archive",
        CommandKind::StoredProcedure,
        ParameterCollection::new(),
        ColumnEncryptionSetting::UseConnectionSetting,
    )
    .unwrap();

    let results = cmd.execute_batch(&conn).await.expect("batch errors are not fatal");
    assert_eq!(results.len(), 3);
    assert_eq!(results.records_affected(0), Some(1));
    assert_eq!(results.records_affected(1), Some(0));
    assert_eq!(results.records_affected(2), Some(3));
    assert_eq!(results.item(2).unwrap().cumulative_records_affected, 4);
    assert!(results.errors(0).is_empty());
    assert_eq!(results.errors(1).len(), 1);
    assert_eq!(results.errors(1)[0].number, 547);
    assert_eq!(results.warnings(2).len(), 1);
    assert!(results.has_errors());

    assert_eq!(
        server.call_names(),
        vec!["sp_executesql", "sp_executesql", "usp_archive"]
    );
    assert_eq!(server.requests().len(), 1, "one request for the whole batch");
}

#[tokio::test]
async fn test_empty_batch_rejected() {
    let server = server();
    let conn = connect(&server).await;
    let err = Command::new("").execute_batch(&conn).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
}

#[tokio::test]
async fn test_batch_encryption_setting_must_match() {
    let cmd = Command::new("").with_column_encryption(ColumnEncryptionSetting::Enabled);
    let err = cmd
        .add_batch_call(
            "usp_x",
            CommandKind::StoredProcedure,
            ParameterCollection::new(),
            ColumnEncryptionSetting::Disabled,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
    assert_eq!(cmd.batch_len(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_batch_slices_partition_messages(
        outcomes in prop::collection::vec((0u64..5, any::<bool>(), 0usize..3), 1..8)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let server = server();
            let cmd = Command::new("");
            for (i, (rows, fails, infos)) in outcomes.iter().enumerate() {
                let text = format!("EXEC step_{i}");
                let mut response = MockResponse::affected(*rows);
                if *fails {
                    response = response.with_error(50000 + i as i32, 16, "step failed");
                }
                for n in 0..*infos {
                    response = response.with_info(n as i32, "note");
                }
                server.set_response(&text, response);
                cmd.add_batch(text, ParameterCollection::new()).unwrap();
            }
            let conn = connect(&server).await;
            let results = cmd.execute_batch(&conn).await.unwrap();

            assert_eq!(results.len(), outcomes.len());
            let mut error_total = 0;
            let mut rows_total = 0i64;
            for (i, (rows, fails, infos)) in outcomes.iter().enumerate() {
                let item = results.item(i).unwrap();
                assert_eq!(item.errors.start, error_total);
                error_total += usize::from(*fails);
                assert_eq!(item.errors.end, error_total);
                assert_eq!(results.warnings(i).len(), *infos);
                assert_eq!(item.records_affected, *rows as i64);
                rows_total += *rows as i64;
                assert_eq!(item.cumulative_records_affected, rows_total);
            }
            assert_eq!(results.all_errors().len(), error_total);
        });
    }
}
