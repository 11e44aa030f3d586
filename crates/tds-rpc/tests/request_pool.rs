//! Property tests for request reuse and declaration rendering.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use tds_rpc::{
    Parameter, ParameterDirection, RpcOptionFlags, RpcRequestPool, SqlDbType, build_param_list,
    required_slots, RpcTarget, ProcId,
};

fn int_params(n: usize) -> Vec<Parameter> {
    (0..n)
        .map(|i| Parameter::input(format!("@p{i}"), SqlDbType::Int, i as i64))
        .collect()
}

proptest! {
    #[test]
    fn reused_requests_are_always_reset(n in 0usize..12, handle in any::<i32>(), rows in any::<i64>()) {
        let pool = RpcRequestPool::default();
        let params = int_params(n);
        let slots = required_slots(&RpcTarget::Id(ProcId::PrepExec), &params);

        let mut rpc = pool.acquire(slots);
        rpc.build_prep_exec(Some(handle), "SELECT 1", &params).unwrap();
        rpc.set_options(RpcOptionFlags::NO_METADATA);
        rpc.records_affected = Some(rows);
        rpc.cumulative_records_affected = rows;
        rpc.errors = 0..n;
        rpc.needs_fetch_param_encryption_metadata = true;
        pool.release(rpc);

        let reused = pool.acquire(slots);
        prop_assert!(reused.is_reset());
        prop_assert_eq!(reused.capacity(), slots);
    }

    #[test]
    fn smaller_call_leaves_trailing_slots_empty(big in 1usize..10, small in 0usize..10) {
        let pool = RpcRequestPool::default();
        let slots = 1 + big.max(small);
        let mut rpc = pool.acquire(slots);
        rpc.build_execute(1, &int_params(big)).unwrap();
        rpc.build_execute(2, &int_params(small)).unwrap();

        prop_assert_eq!(rpc.param_count(), 1 + small);
        for i in rpc.param_count()..rpc.capacity() {
            prop_assert!(rpc.param(i).is_none());
        }
    }

    #[test]
    fn zero_size_wide_types_declare_4000(name in "[a-z]{1,8}") {
        let params = vec![Parameter::new(name.clone(), SqlDbType::NVarChar)];
        let list = build_param_list(&params, false).unwrap();
        prop_assert_eq!(list, format!("@{name} nvarchar(4000)"));
    }

    #[test]
    fn ansi_declared_size_covers_value(len in 1usize..8000, size in 1i32..100) {
        let value = "a".repeat(len);
        let params = vec![Parameter::input("@a", SqlDbType::VarChar, value.as_str()).with_size(size)];
        let list = build_param_list(&params, false).unwrap();
        let expected = (len as i32).max(size);
        prop_assert_eq!(list, format!("@a varchar({expected})"));
    }

    #[test]
    fn output_marker_follows_direction(out in any::<bool>()) {
        let direction = if out { ParameterDirection::InputOutput } else { ParameterDirection::Input };
        let params = vec![Parameter::input("@n", SqlDbType::Int, 1).with_direction(direction)];
        let list = build_param_list(&params, false).unwrap();
        prop_assert_eq!(list.ends_with(" output"), out);
    }
}
