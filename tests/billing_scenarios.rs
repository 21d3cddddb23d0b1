use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quota_relay::{
    ApiType, BillingState, ChannelMeta, ChannelRecord, ErrorKind, MemoryStore, Notifier, Notify,
    NotifyError, NotifyQueue, NotifyTarget, QuotaEngine, QuotaLedger, QuotaStore, RelayInfo,
    RelayMode, RelaySettings, SettingsHandle, TokenRecord, Usage, UserRecord,
};
use tokio::sync::Mutex;

const USER: i64 = 1;
const TOKEN: i64 = 10;
const CHANNEL: i64 = 100;

fn settings() -> RelaySettings {
    let mut settings = RelaySettings::default();
    settings.model_ratio.insert("gpt-4o".into(), 2.0);
    settings.model_price.insert("dall-e-3".into(), 0.04);
    settings
}

async fn seeded_store(user_quota: i64, token_quota: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_user(&UserRecord::new(USER, "alice", user_quota))
        .await
        .expect("insert user");
    store
        .insert_token(&TokenRecord::new(TOKEN, USER, token_quota))
        .await
        .expect("insert token");
    store
        .insert_channel(&ChannelRecord {
            id: CHANNEL,
            name: "primary".into(),
            used_quota: 0,
        })
        .await
        .expect("insert channel");
    store
}

fn engine_for(store: Arc<MemoryStore>) -> Arc<QuotaEngine> {
    Arc::new(QuotaEngine::new(
        QuotaLedger::new(store),
        SettingsHandle::new(settings()),
    ))
}

fn request_info(model: &str) -> RelayInfo {
    let mut info = RelayInfo::new(
        RelayMode::ChatCompletions,
        USER,
        TOKEN,
        ChannelMeta::new(CHANNEL, ApiType::OpenAi, "http://upstream.invalid"),
    );
    info.set_model(model);
    info
}

async fn wait_for_logs(store: &MemoryStore, count: usize) -> Vec<quota_relay::ConsumeLog> {
    for _ in 0..100 {
        let logs = store
            .list_consume_logs(Some(USER), 100)
            .await
            .expect("list logs");
        if logs.len() >= count {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} consume logs");
}

#[tokio::test]
async fn reserve_then_settle_applies_only_the_delta() {
    let store = seeded_store(1000, 1000).await;
    let engine = engine_for(store.clone());
    let mut info = request_info("gpt-4o");

    let price = engine.resolve_price(&mut info).expect("price");
    let estimate = engine.estimate(&price, 50);
    assert_eq!(estimate, 100);

    let reservation = engine.pre_consume(&mut info, estimate).await.expect("admit");
    assert_eq!(info.billing_state, BillingState::PreConsumed);
    assert_eq!(info.user_quota, 1000);
    assert_eq!(store.get_user(USER).await.expect("user").quota, 900);
    assert_eq!(store.get_token(TOKEN).await.expect("token").remain_quota, 900);

    let outcome = reservation.settle(&Usage::from_counts(80, 0)).await;
    assert_eq!(outcome.state, BillingState::Settled);
    assert_eq!(outcome.quota, 160);
    assert_eq!(outcome.delta, 60);

    let user = store.get_user(USER).await.expect("user");
    assert_eq!(user.quota, 840);
    assert_eq!(user.used_quota, 160);
    assert_eq!(user.request_count, 1);
    let token = store.get_token(TOKEN).await.expect("token");
    assert_eq!(token.remain_quota, 840);
    assert_eq!(token.used_quota, 160);
    assert_eq!(
        store.get_channel(CHANNEL).await.expect("channel").used_quota,
        160
    );

    let logs = store.list_consume_logs(Some(USER), 10).await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(Some(logs[0].id), outcome.log_id);
    assert_eq!(logs[0].quota, 160);
    assert_eq!(logs[0].prompt_tokens, 80);
    assert_eq!(logs[0].username, "alice");
    assert_eq!(logs[0].model_name, "gpt-4o");
    assert!(logs[0].content.starts_with("model ratio 2.00"));
    assert_eq!(logs[0].other["pre_consumed_quota"], 100);
}

#[tokio::test]
async fn insufficient_balance_is_rejected_without_side_effects() {
    let store = seeded_store(10, 1000).await;
    let engine = engine_for(store.clone());
    let mut info = request_info("gpt-4o");

    let err = engine.pre_consume(&mut info, 100).await.expect_err("reject");
    assert_eq!(err.kind(), ErrorKind::InsufficientQuota);
    assert_eq!(err.status_code().as_u16(), 400);
    assert_eq!(info.billing_state, BillingState::Rejected);

    assert_eq!(store.get_user(USER).await.expect("user").quota, 10);
    assert_eq!(store.get_token(TOKEN).await.expect("token").remain_quota, 1000);
    assert!(
        store
            .list_consume_logs(None, 10)
            .await
            .expect("logs")
            .is_empty()
    );
}

#[tokio::test]
async fn unlimited_users_are_never_rejected_or_charged() {
    let store = seeded_store(10, 10).await;
    store.set_user_unlimited(USER, true).await.expect("unlimited");
    let engine = engine_for(store.clone());
    let mut info = request_info("gpt-4o");

    let reservation = engine
        .pre_consume(&mut info, 10_000)
        .await
        .expect("unlimited admit");
    assert!(reservation.is_unlimited());
    assert_eq!(reservation.amount(), 0);

    let outcome = reservation.settle(&Usage::from_counts(5_000, 5_000)).await;
    assert_eq!(outcome.quota, 0);
    assert_eq!(store.get_user(USER).await.expect("user").quota, 10);

    let logs = store.list_consume_logs(Some(USER), 10).await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].content.contains("(unlimited quota)"));
}

#[tokio::test]
async fn user_turned_unlimited_mid_request_gets_the_reservation_back() {
    let store = seeded_store(1000, 1000).await;
    let engine = engine_for(store.clone());
    let mut info = request_info("gpt-4o");

    let reservation = engine.pre_consume(&mut info, 100).await.expect("admit");
    engine
        .ledger()
        .set_user_unlimited(USER, true)
        .await
        .expect("flip unlimited");

    let outcome = reservation.settle(&Usage::from_counts(80, 0)).await;
    assert_eq!(outcome.quota, 0);
    assert_eq!(outcome.delta, -100);
    let user = store.get_user(USER).await.expect("user");
    assert_eq!(user.quota, 1000);
    assert_eq!(user.used_quota, 0);
    assert_eq!(user.request_count, 1);
    assert_eq!(store.get_token(TOKEN).await.expect("token").remain_quota, 1000);
}

#[tokio::test]
async fn zero_usage_charges_nothing_and_keeps_the_reservation() {
    let store = seeded_store(1000, 1000).await;
    let engine = engine_for(store.clone());
    let mut info = request_info("gpt-4o");

    let reservation = engine.pre_consume(&mut info, 100).await.expect("admit");
    let outcome = reservation.settle(&Usage::default()).await;
    assert_eq!(outcome.state, BillingState::SettledZero);
    assert_eq!(outcome.quota, 0);
    assert_eq!(outcome.delta, 0);

    let user = store.get_user(USER).await.expect("user");
    assert_eq!(user.quota, 900);
    assert_eq!(user.request_count, 0);

    let logs = store.list_consume_logs(Some(USER), 10).await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].quota, 0);
    assert!(logs[0].content.contains("possibly upstream timeout"));
}

#[tokio::test]
async fn fixed_price_ignores_token_counts() {
    let store = seeded_store(100_000, 100_000).await;
    let engine = engine_for(store.clone());
    let mut info = request_info("dall-e-3");

    let price = engine.resolve_price(&mut info).expect("price");
    assert!(price.uses_price());
    let estimate = engine.estimate(&price, 9_999);
    assert_eq!(estimate, 20_000);

    let reservation = engine.pre_consume(&mut info, estimate).await.expect("admit");
    let outcome = reservation.settle(&Usage::from_counts(1, 1)).await;
    assert_eq!(outcome.quota, 20_000);
    assert_eq!(outcome.delta, 0);
    assert_eq!(store.get_user(USER).await.expect("user").quota, 80_000);
}

#[tokio::test]
async fn refund_returns_the_reservation_and_logs_once() {
    let store = seeded_store(1000, 1000).await;
    let engine = engine_for(store.clone());
    let mut info = request_info("gpt-4o");

    let reservation = engine.pre_consume(&mut info, 100).await.expect("admit");
    let outcome = reservation.refund("connection reset").await;
    assert_eq!(outcome.state, BillingState::Refunded);
    assert_eq!(outcome.delta, -100);
    assert_eq!(store.get_user(USER).await.expect("user").quota, 1000);
    assert_eq!(store.get_token(TOKEN).await.expect("token").remain_quota, 1000);

    let logs = store.list_consume_logs(Some(USER), 10).await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].content.contains("connection reset"));
}

#[tokio::test]
async fn settlement_writes_exactly_one_log_per_request() {
    let store = seeded_store(10_000, 10_000).await;
    let engine = engine_for(store.clone());

    for _ in 0..3 {
        let mut info = request_info("gpt-4o");
        let reservation = engine.pre_consume(&mut info, 100).await.expect("admit");
        reservation.settle(&Usage::from_counts(10, 10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let logs = store.list_consume_logs(Some(USER), 100).await.expect("logs");
    assert_eq!(logs.len(), 3);
    let mut request_ids: Vec<_> = logs
        .iter()
        .map(|log| log.other["request_id"].as_str().unwrap_or_default().to_string())
        .collect();
    request_ids.sort();
    request_ids.dedup();
    assert_eq!(request_ids.len(), 3);
}

#[tokio::test]
async fn abandoned_reservation_is_settled_in_the_background() {
    let store = seeded_store(1000, 1000).await;
    let engine = engine_for(store.clone());
    let mut info = request_info("gpt-4o");

    let reservation = engine.pre_consume(&mut info, 100).await.expect("admit");
    drop(reservation);

    let logs = wait_for_logs(&store, 1).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].quota, 0);
    assert!(logs[0].content.contains("request aborted"));
    assert_eq!(store.get_user(USER).await.expect("user").quota, 900);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admission_never_overdraws() {
    const N: i64 = 16;
    const ESTIMATE: i64 = 100;
    let store = seeded_store(N * ESTIMATE, N * ESTIMATE).await;
    let engine = engine_for(store.clone());

    let mut tasks = Vec::new();
    for _ in 0..N * 2 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let mut info = request_info("gpt-4o");
            engine.pre_consume(&mut info, ESTIMATE).await
        }));
    }

    let mut admitted = Vec::new();
    let mut rejected = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(reservation) => admitted.push(reservation),
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::InsufficientQuota);
                rejected += 1;
            }
        }
    }
    assert_eq!(admitted.len() as i64, N);
    assert_eq!(rejected, N);
    assert_eq!(store.get_user(USER).await.expect("user").quota, 0);
    assert_eq!(store.get_token(TOKEN).await.expect("token").remain_quota, 0);

    for reservation in admitted {
        reservation.settle(&Usage::from_counts(50, 0)).await;
    }
    assert_eq!(store.get_user(USER).await.expect("user").quota, 0);
}

#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<(i64, Notify)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, target: &NotifyTarget, message: &Notify) -> Result<(), NotifyError> {
        self.seen.lock().await.push((target.user_id, message.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn crossing_the_threshold_sends_one_warning() {
    let store = seeded_store(1500, 1500).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Arc::new(
        QuotaEngine::new(QuotaLedger::new(store.clone()), SettingsHandle::new(settings()))
            .with_notifier(NotifyQueue::spawn(notifier.clone(), 8)),
    );

    let mut info = request_info("gpt-4o");
    let reservation = engine.pre_consume(&mut info, 100).await.expect("admit");
    let outcome = reservation.settle(&Usage::from_counts(250, 0)).await;
    assert_eq!(outcome.quota, 500);

    let mut delivered = Vec::new();
    for _ in 0..100 {
        delivered = notifier.seen.lock().await.clone();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, USER);
    assert!(delivered[0].1.render().contains("/topup"));
}

#[tokio::test]
async fn balances_well_above_threshold_send_nothing() {
    let store = seeded_store(100_000, 100_000).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Arc::new(
        QuotaEngine::new(QuotaLedger::new(store.clone()), SettingsHandle::new(settings()))
            .with_notifier(NotifyQueue::spawn(notifier.clone(), 8)),
    );

    let mut info = request_info("gpt-4o");
    let reservation = engine.pre_consume(&mut info, 100).await.expect("admit");
    reservation.settle(&Usage::from_counts(250, 0)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(notifier.seen.lock().await.is_empty());
}

#[tokio::test]
async fn users_already_below_threshold_keep_getting_warned() {
    let store = seeded_store(900, 900).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Arc::new(
        QuotaEngine::new(QuotaLedger::new(store.clone()), SettingsHandle::new(settings()))
            .with_notifier(NotifyQueue::spawn(notifier.clone(), 8)),
    );

    let mut info = request_info("gpt-4o");
    let reservation = engine.pre_consume(&mut info, 100).await.expect("admit");
    let outcome = reservation.settle(&Usage::from_counts(100, 0)).await;
    assert_eq!(outcome.quota, 200);
    assert_eq!(store.get_user(USER).await.expect("user").quota, 700);

    let mut delivered = Vec::new();
    for _ in 0..100 {
        delivered = notifier.seen.lock().await.clone();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, USER);
}
