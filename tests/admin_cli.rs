#![cfg(all(feature = "store-sqlite", feature = "cache-redis"))]

use std::process::Command;

use quota_relay::{ConsumeLog, QuotaStore, SqliteStore, UserRecord};

fn admin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_quota-relay-admin"))
}

#[tokio::test]
async fn logs_command_exports_json_lines_for_one_user() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("relay.sqlite");
    let store = SqliteStore::new(&db);
    store.init().await.expect("init");
    for (user_id, quota) in [(1, 120), (2, 999), (1, 80)] {
        store
            .record_consume_log(&ConsumeLog {
                user_id,
                quota,
                model_name: "gpt-4o".into(),
                ..ConsumeLog::default()
            })
            .await
            .expect("log");
    }

    let output = admin()
        .args(["logs", "--sqlite"])
        .arg(&db)
        .args(["--user", "1"])
        .output()
        .expect("run admin");
    assert!(output.status.success(), "{output:?}");

    let stdout = String::from_utf8(output.stdout).expect("utf8");
    let logs = stdout
        .lines()
        .map(|line| serde_json::from_str::<ConsumeLog>(line).expect("json line"))
        .collect::<Vec<_>>();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|log| log.user_id == 1));
    let mut quotas = logs.iter().map(|log| log.quota).collect::<Vec<_>>();
    quotas.sort();
    assert_eq!(quotas, vec![80, 120]);
}

#[tokio::test]
async fn topup_credits_the_durable_balance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("relay.sqlite");
    let store = SqliteStore::new(&db);
    store.init().await.expect("init");
    store
        .insert_user(&UserRecord::new(7, "bob", 100))
        .await
        .expect("user");

    let output = admin()
        .args(["topup", "--sqlite"])
        .arg(&db)
        .args(["--user", "7", "--amount", "-40"])
        .output()
        .expect("run admin");
    assert!(output.status.success(), "{output:?}");
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "60");
    assert_eq!(store.get_user(7).await.expect("user").quota, 60);
}
