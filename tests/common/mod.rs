#![allow(dead_code)]

use async_trait::async_trait;
use paychan::application::PaymentClient;
use paychan::config::ClientConfig;
use paychan::domain::account::{ADDRESS_LEN, Account, Address};
use paychan::domain::ports::{BalanceSource, BalanceSourceRef, Observer, ObserverId};
use paychan::error::{BalanceQueryError, Result};
use paychan::infrastructure::in_memory::InMemoryNetwork;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ALICE: Address = Address::new([0xa1; ADDRESS_LEN]);
pub const BOB: Address = Address::new([0xb0; ADDRESS_LEN]);

/// Observer that records everything it receives.
#[derive(Default)]
pub struct RecordingObserver {
    id: ObserverId,
    states: Mutex<Vec<String>>,
    balances: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn as_observer(self: &Arc<Self>) -> Arc<dyn Observer> {
        self.clone()
    }

    pub fn states(&self) -> Vec<String> {
        self.states.lock().unwrap().clone()
    }

    pub fn balances(&self) -> Vec<String> {
        self.balances.lock().unwrap().clone()
    }

    pub fn last_state(&self) -> Option<String> {
        self.states.lock().unwrap().last().cloned()
    }
}

impl Observer for RecordingObserver {
    fn id(&self) -> ObserverId {
        self.id
    }

    fn update_state(&self, state: &str) {
        self.states.lock().unwrap().push(state.to_string());
    }

    fn update_balance(&self, balance: &str) {
        self.balances.lock().unwrap().push(balance.to_string());
    }
}

/// Balance source whose answer is set by the test.
///
/// Queued answers are consumed first, one per query, each after its delay.
#[derive(Default)]
pub struct ScriptedBalanceSource {
    amount: AtomicI64,
    failing: AtomicBool,
    queries: AtomicUsize,
    queued: Mutex<VecDeque<(Duration, i64)>>,
}

impl ScriptedBalanceSource {
    pub fn new(amount: i64) -> Arc<Self> {
        let source = Self::default();
        source.amount.store(amount, Ordering::SeqCst);
        Arc::new(source)
    }

    pub fn set(&self, amount: i64) {
        self.amount.store(amount, Ordering::SeqCst);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn queue(&self, delay: Duration, amount: i64) {
        self.queued.lock().unwrap().push_back((delay, amount));
    }
}

#[async_trait]
impl BalanceSource for ScriptedBalanceSource {
    async fn query_balance(&self, _account: &Account) -> Result<i64> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(BalanceQueryError::Status {
                status: 503,
                body: "scripted failure".to_string(),
            }
            .into());
        }
        let next = self.queued.lock().unwrap().pop_front();
        match next {
            Some((delay, amount)) => {
                tokio::time::sleep(delay).await;
                Ok(amount)
            }
            None => Ok(self.amount.load(Ordering::SeqCst)),
        }
    }
}

/// Configuration whose poller effectively never ticks on its own after the
/// first query.
pub fn quiet_config() -> ClientConfig {
    ClientConfig {
        poll_interval_ms: 3_600_000,
        engine_timeout_secs: 5,
        ..ClientConfig::default()
    }
}

pub fn client(
    network: &InMemoryNetwork,
    name: &str,
    address: Address,
    config: ClientConfig,
    balance_source: BalanceSourceRef,
) -> PaymentClient {
    let account = Account::new(address, name.to_lowercase()).unwrap();
    PaymentClient::new(name, account, config, network.engine(address), balance_source).unwrap()
}

/// Alice and Bob, both funded with 100 ADA and reachable on `network`.
pub async fn two_parties(network: &InMemoryNetwork) -> (PaymentClient, PaymentClient) {
    network.fund(ALICE, 100_000000);
    network.fund(BOB, 100_000000);
    let ledger: BalanceSourceRef = Arc::new(network.clone());
    let alice = client(network, "Alice", ALICE, quiet_config(), ledger.clone());
    let bob = client(network, "Bob", BOB, quiet_config(), ledger);
    network.wait_for_endpoint(ALICE).await;
    network.wait_for_endpoint(BOB).await;
    (alice, bob)
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
