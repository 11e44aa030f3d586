//! Pool groups shared across threads.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mssql_auth::AccessToken;
use mssql_driver_pool::{AuthContextKey, PoolGroup};

#[test]
fn concurrent_merges_keep_longest_lived_token() {
    let group = Arc::new(PoolGroup::new());
    let key = AuthContextKey::new("https://sts.example", "https://db.example");

    let handles: Vec<_> = (1..=8u64)
        .map(|i| {
            let group = Arc::clone(&group);
            let key = key.clone();
            thread::spawn(move || {
                let token = AccessToken::valid_for(format!("t{i}"), Duration::from_secs(60 * i));
                group.auth_contexts().merge(key, token);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(group.auth_contexts().get(&key).unwrap().token, "t8");
    assert_eq!(group.auth_contexts().len(), 1);
}

#[test]
fn failover_side_is_visible_to_every_connection() {
    let group = Arc::new(PoolGroup::new());
    let writer = Arc::clone(&group);
    thread::spawn(move || {
        writer.set_failover_partner(Some("mirror-host".into()));
        writer.failover_check(true);
    })
    .join()
    .unwrap();

    let info = group.info();
    assert!(info.use_failover_partner);
    assert_eq!(info.failover_partner.as_deref(), Some("mirror-host"));
}
