mod common;

use common::{ALICE, RecordingObserver, ScriptedBalanceSource, client, eventually, quiet_config};
use paychan::application::PaymentClient;
use paychan::config::ClientConfig;
use paychan::domain::ports::{BalanceSourceRef, Observer, ObserverId};
use paychan::error::{BalanceQueryError, Operation, PaymentError};
use paychan::infrastructure::in_memory::InMemoryNetwork;
use paychan::infrastructure::wallet::WalletBalanceSource;
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn wallet_body(quantity: i64) -> serde_json::Value {
    serde_json::json!({
        "balance": {
            "available": { "quantity": quantity, "unit": "lovelace" }
        }
    })
}

fn wallet_source(server: &MockServer, config: &ClientConfig) -> BalanceSourceRef {
    Arc::new(WalletBalanceSource::new(server.uri(), config.balance_timeout()).unwrap())
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        poll_interval_ms: 20,
        ..quiet_config()
    }
}

#[tokio::test]
async fn test_wallet_balance_is_cached_and_rendered() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wallets/alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(wallet_body(420133769)))
        .mount(&server)
        .await;
    let config = quiet_config();
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, config.clone(), wallet_source(&server, &config));
    let observer = RecordingObserver::new();
    alice.register(&observer.as_observer());

    assert!(eventually(|| alice.balance() == 420133769).await);
    assert_eq!(observer.balances().last().map(String::as_str), Some("420.133769"));
}

#[tokio::test]
async fn test_server_error_leaves_cache_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("wallet backend down"))
        .mount(&server)
        .await;
    let config = quiet_config();
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, config.clone(), wallet_source(&server, &config));

    let result = alice.refresh_balance().await;

    assert!(matches!(
        result,
        Err(PaymentError::BalanceQuery(BalanceQueryError::Status { status: 500, .. }))
    ));
    assert_eq!(alice.balance(), 0);
}

#[tokio::test]
async fn test_malformed_body_leaves_cache_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;
    let config = quiet_config();
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, config.clone(), wallet_source(&server, &config));

    let result = alice.refresh_balance().await;

    assert!(matches!(
        result,
        Err(PaymentError::BalanceQuery(BalanceQueryError::Decode(_)))
    ));
    assert_eq!(alice.balance(), 0);
}

#[tokio::test]
async fn test_slow_wallet_is_bounded_by_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(wallet_body(1))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    let config = ClientConfig {
        balance_timeout_secs: 1,
        ..quiet_config()
    };
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, config.clone(), wallet_source(&server, &config));

    let started = tokio::time::Instant::now();
    let result = alice.refresh_balance().await;

    assert!(matches!(
        result,
        Err(PaymentError::Timeout {
            operation: Operation::QueryBalance,
            ..
        })
    ));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(alice.balance(), 0);
}

#[tokio::test]
async fn test_unchanged_balance_is_not_broadcast_again() {
    let source = ScriptedBalanceSource::new(7);
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, quiet_config(), source.clone());
    assert!(eventually(|| alice.balance() == 7).await);

    let observer = RecordingObserver::new();
    alice.register(&observer.as_observer());
    assert_eq!(observer.balances(), vec!["0.000007".to_string()]);

    assert!(!alice.refresh_balance().await.unwrap());
    assert!(!alice.refresh_balance().await.unwrap());
    assert_eq!(observer.balances().len(), 1);

    source.set(8);
    assert!(alice.refresh_balance().await.unwrap());
    assert_eq!(observer.balances(), vec!["0.000007".to_string(), "0.000008".to_string()]);
}

#[tokio::test]
async fn test_failed_query_keeps_previous_balance() {
    let source = ScriptedBalanceSource::new(5);
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, quiet_config(), source.clone());
    assert!(eventually(|| alice.balance() == 5).await);

    source.fail(true);
    source.set(6);
    assert!(alice.refresh_balance().await.is_err());
    assert_eq!(alice.balance(), 5);
}

#[tokio::test]
async fn test_poller_survives_failures() {
    let source = ScriptedBalanceSource::new(3);
    source.fail(true);
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, fast_config(), source.clone());

    assert!(eventually(|| source.queries() >= 3).await);
    assert_eq!(alice.balance(), 0);

    source.fail(false);
    source.set(9);
    assert!(eventually(|| alice.balance() == 9).await);
}

#[tokio::test]
async fn test_no_queries_after_shutdown() {
    let source = ScriptedBalanceSource::new(1);
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, fast_config(), source.clone());
    assert!(eventually(|| source.queries() >= 2).await);

    alice.shutdown().await.unwrap();
    let queries = source.queries();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(source.queries(), queries);
}

#[tokio::test]
async fn test_older_query_never_overwrites_newer_balance() {
    let source = ScriptedBalanceSource::new(0);
    source.queue(Duration::ZERO, 1);
    let network = InMemoryNetwork::new();
    let alice = client(&network, "Alice", ALICE, quiet_config(), source.clone());
    assert!(eventually(|| alice.balance() == 1).await);
    let observer = RecordingObserver::new();
    alice.register(&observer.as_observer());

    source.queue(Duration::from_millis(200), 100);
    source.queue(Duration::ZERO, 200);
    let (slow, fast) = tokio::join!(alice.refresh_balance(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        alice.refresh_balance().await
    });

    assert!(slow.unwrap());
    assert!(fast.unwrap());
    assert_eq!(alice.balance(), 200);
    assert_eq!(observer.balances(), vec!["0.000001", "0.000100", "0.000200"]);
}

/// Observer that reads the client's cached balance from its callback.
#[derive(Default)]
struct BalanceReader {
    id: ObserverId,
    client: OnceLock<Arc<PaymentClient>>,
    seen: Mutex<Vec<i64>>,
}

impl Observer for BalanceReader {
    fn id(&self) -> ObserverId {
        self.id
    }

    fn update_state(&self, _state: &str) {}

    fn update_balance(&self, _balance: &str) {
        if let Some(client) = self.client.get() {
            self.seen.lock().unwrap().push(client.balance());
        }
    }
}

#[tokio::test]
async fn test_observer_can_read_balance_from_its_callback() {
    let source = ScriptedBalanceSource::new(7);
    let network = InMemoryNetwork::new();
    let alice = Arc::new(client(&network, "Alice", ALICE, quiet_config(), source.clone()));
    assert!(eventually(|| alice.balance() == 7).await);

    let reader = Arc::new(BalanceReader::default());
    assert!(reader.client.set(alice.clone()).is_ok());
    let observer: Arc<dyn Observer> = reader.clone();

    // A deadlocked register would never answer.
    let (done_tx, done_rx) = mpsc::channel();
    let registering = alice.clone();
    std::thread::spawn(move || {
        let _ = done_tx.send(registering.register(&observer));
    });
    let registered = tokio::task::spawn_blocking(move || done_rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(registered, Ok(true));

    source.set(8);
    assert!(alice.refresh_balance().await.unwrap());
    assert_eq!(*reader.seen.lock().unwrap(), vec![7, 8]);
}
