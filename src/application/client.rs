use crate::application::channel::ChannelHandle;
use crate::application::registry::ObserverRegistry;
use crate::config::ClientConfig;
use crate::domain::account::{Account, Address};
use crate::domain::channel::{
    AdjudicatorEvent, Allocation, Asset, ChannelProposal, ChannelState, Participant,
};
use crate::domain::currency::CurrencyConverter;
use crate::domain::ports::{
    AdjudicatorEventHandler, BalanceSourceRef, ChannelEngineRef, ChannelRef, Observer, ObserverId,
    ProposalHandler, UpdateHandler,
};
use crate::error::{Operation, PaymentError, Result};
use crate::interfaces::render::render_balance;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once the shutdown flag is raised or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

enum ChannelSlot {
    Empty,
    /// Reserved by an outgoing proposal or an accepted incoming one.
    Pending,
    Active(Arc<ChannelHandle>),
}

struct ClientInner {
    name: String,
    account: Account,
    config: ClientConfig,
    asset: Asset,
    converter: CurrencyConverter,
    engine: ChannelEngineRef,
    balance_source: BalanceSourceRef,
    channel: Mutex<ChannelSlot>,
    balance: Mutex<i64>,
    /// Held across a balance query and its cache update.
    refreshing: tokio::sync::Mutex<()>,
    registry: ObserverRegistry,
    accepted_tx: mpsc::Sender<Arc<ChannelHandle>>,
    accepted_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<ChannelHandle>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Client-side orchestrator for a two-party payment channel.
///
/// Owns the account, at most one active channel, the cached on-chain
/// balance and the observer registry. A background task keeps the balance
/// fresh; engine callbacks publish every accepted channel state.
///
/// Lock order is registry, then channel slot or balance cache, then engine
/// state. Observers are called with the registry lock held but never with
/// the slot or balance lock held.
pub struct PaymentClient {
    inner: Arc<ClientInner>,
}

impl PaymentClient {
    /// Creates a client and starts its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        account: Account,
        config: ClientConfig,
        engine: ChannelEngineRef,
        balance_source: BalanceSourceRef,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PaymentError::ConfigError(format!("no async runtime available: {e}")))?;

        let (accepted_tx, accepted_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            name: name.into(),
            account,
            config,
            asset: Asset::native(),
            converter: CurrencyConverter::ADA,
            engine,
            balance_source,
            channel: Mutex::new(ChannelSlot::Empty),
            balance: Mutex::new(0),
            refreshing: tokio::sync::Mutex::new(()),
            registry: ObserverRegistry::new(),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let poller = runtime.spawn(poll_balances(
            Arc::downgrade(&inner),
            inner.shutdown.subscribe(),
            inner.config.poll_interval(),
        ));
        inner.track(poller);

        let requests = Arc::new(IncomingRequests {
            inner: Arc::downgrade(&inner),
        });
        let engine = inner.engine.clone();
        let mut shutdown = inner.shutdown.subscribe();
        let server = runtime.spawn(async move {
            tokio::select! {
                result = engine.handle(requests.clone(), requests) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Engine stopped serving requests");
                    }
                }
                _ = stopped(&mut shutdown) => {}
            }
        });
        inner.track(server);

        info!(client = %inner.name, address = %inner.account.address(), "Payment client started");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    pub fn address(&self) -> Address {
        self.inner.account.address()
    }

    /// Hex encoding of the address, as shown to users and peers.
    pub fn display_address(&self) -> String {
        self.inner.account.address().to_hex()
    }

    pub fn wallet_id(&self) -> &str {
        self.inner.account.wallet_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn converter(&self) -> &CurrencyConverter {
        &self.inner.converter
    }

    /// Last balance seen by the poller, in smallest units. Never queries.
    pub fn balance(&self) -> i64 {
        *lock(&self.inner.balance)
    }

    /// The current channel handle, including a settled one.
    pub fn channel(&self) -> Option<Arc<ChannelHandle>> {
        self.inner.active_handle()
    }

    pub fn has_open_channel(&self) -> bool {
        self.channel().is_some_and(|handle| handle.is_open())
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Opens a channel with `peer`, both sides depositing `deposit`.
    pub async fn open_channel(&self, peer: Address, deposit: Decimal) -> Result<Arc<ChannelHandle>> {
        self.open_channel_with(peer, deposit, deposit).await
    }

    /// Opens a channel with `peer` using separate deposits for each side.
    ///
    /// Fails without retrying when a proposal is already in flight, a channel
    /// is active, or the engine rejects the proposal. On failure no channel
    /// state is left behind.
    pub async fn open_channel_with(
        &self,
        peer: Address,
        own_deposit: Decimal,
        peer_deposit: Decimal,
    ) -> Result<Arc<ChannelHandle>> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let own = inner.account.address();
        if peer == own {
            return Err(PaymentError::ValidationError(
                "cannot open a channel with yourself".to_string(),
            ));
        }
        let balances = [inner.deposit_units(own_deposit)?, inner.deposit_units(peer_deposit)?];

        let previous = inner.reserve_slot()?;
        let proposal = ChannelProposal {
            participants: [own, peer],
            initial_allocation: Allocation::new(inner.asset.clone(), balances),
            challenge_duration: inner.config.challenge_duration(),
        };
        info!(client = %inner.name, %peer, ?balances, "Proposing channel");

        let timeout = inner.config.engine_timeout();
        let proposed = match tokio::time::timeout(timeout, inner.engine.propose_channel(proposal)).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(source)) => Err(PaymentError::Engine {
                operation: Operation::ProposeChannel,
                channel: None,
                source,
            }),
            Err(_) => Err(PaymentError::Timeout {
                operation: Operation::ProposeChannel,
                timeout,
            }),
        };
        match proposed {
            Ok(channel) => Ok(inner.install(channel)),
            Err(e) => {
                *lock(&inner.channel) = previous;
                warn!(client = %inner.name, %peer, error = %e, "Channel proposal failed");
                Err(e)
            }
        }
    }

    /// Waits for the handle of the next channel accepted from a peer.
    ///
    /// Accepted channels are installed as soon as the engine delivers them,
    /// whether or not anyone calls this, so an undrained handoff never keeps
    /// the slot reserved. Handles are returned in acceptance order.
    pub async fn accepted_channel(&self) -> Result<Arc<ChannelHandle>> {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.subscribe();
        let mut accepted = inner.accepted_rx.lock().await;
        tokio::select! {
            handle = accepted.recv() => handle.ok_or(PaymentError::ShutDown),
            _ = stopped(&mut shutdown) => Err(PaymentError::ShutDown),
        }
    }

    /// Pays `amount` to the peer. Does nothing without a channel.
    pub async fn send_payment_to_peer(&self, amount: Decimal) -> Result<()> {
        match self.inner.active_handle() {
            Some(handle) => handle.send_payment(amount).await,
            None => {
                debug!(client = %self.inner.name, "No channel; payment skipped");
                Ok(())
            }
        }
    }

    /// Settles the channel. Does nothing without a channel.
    pub async fn settle(&self) -> Result<()> {
        match self.inner.active_handle() {
            Some(handle) => handle.settle().await,
            None => {
                debug!(client = %self.inner.name, "No channel; settlement skipped");
                Ok(())
            }
        }
    }

    /// Registers `observer` and sends it the current state and balance.
    pub fn register(&self, observer: &Arc<dyn Observer>) -> bool {
        let inner = &self.inner;
        inner.registry.register_with(observer, |observer| {
            if let Some(handle) = inner.active_handle() {
                observer.update_state(&handle.render(&handle.state()));
            }
            let cached = *lock(&inner.balance);
            observer.update_balance(&render_balance(cached, &inner.converter));
        })
    }

    pub fn deregister(&self, id: ObserverId) -> bool {
        self.inner.registry.deregister(id)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Runs one balance poll. Returns whether the cached balance changed.
    pub async fn refresh_balance(&self) -> Result<bool> {
        self.inner.ensure_running()?;
        self.inner.refresh_balance().await
    }

    /// Stops background tasks, closes the engine and waits for the tasks.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.send_replace(true) {
            return Ok(());
        }
        info!(client = %inner.name, "Shutting down payment client");

        let timeout = inner.config.engine_timeout();
        let closed = match tokio::time::timeout(timeout, inner.engine.close()).await {
            Ok(result) => result.map_err(|source| PaymentError::Engine {
                operation: Operation::Shutdown,
                channel: None,
                source,
            }),
            Err(_) => Err(PaymentError::Timeout {
                operation: Operation::Shutdown,
                timeout,
            }),
        };

        let tasks = std::mem::take(&mut *lock(&inner.tasks));
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                warn!(client = %inner.name, error = %e, "Background task panicked");
            }
        }
        closed
    }
}

impl Drop for PaymentClient {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

impl ClientInner {
    fn ensure_running(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(PaymentError::ShutDown);
        }
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn active_handle(&self) -> Option<Arc<ChannelHandle>> {
        match &*lock(&self.channel) {
            ChannelSlot::Active(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    fn deposit_units(&self, deposit: Decimal) -> Result<i64> {
        if deposit.is_sign_negative() {
            return Err(PaymentError::ValidationError(format!(
                "deposit {deposit} must not be negative"
            )));
        }
        self.converter.to_smallest_unit(deposit)
    }

    /// Marks the slot as pending. Returns what it held before.
    fn reserve_slot(&self) -> Result<ChannelSlot> {
        let mut slot = lock(&self.channel);
        match &*slot {
            ChannelSlot::Pending => Err(PaymentError::ProposalInFlight),
            ChannelSlot::Active(handle) if !handle.is_closed() => {
                Err(PaymentError::ChannelAlreadyActive)
            }
            _ => Ok(std::mem::replace(&mut *slot, ChannelSlot::Pending)),
        }
    }

    /// Makes `channel` the active channel, subscribes to its updates,
    /// publishes its initial state and starts its dispute watcher.
    fn install(self: &Arc<Self>, channel: ChannelRef) -> Arc<ChannelHandle> {
        let handle = Arc::new(ChannelHandle::new(
            channel.clone(),
            self.asset.clone(),
            self.converter,
            self.config.engine_timeout(),
        ));

        // Subscribing before reading the initial state means no update is
        // missed; one racing the install may be published twice.
        self.registry.broadcast_state_with(|| {
            *lock(&self.channel) = ChannelSlot::Active(handle.clone());
            let client = Arc::downgrade(self);
            let subscribed = Arc::downgrade(&handle);
            channel.on_update(Arc::new(
                move |previous: Option<&ChannelState>, next: &ChannelState| {
                    if let (Some(client), Some(handle)) = (client.upgrade(), subscribed.upgrade()) {
                        client.on_channel_state_changed(&handle, previous, next);
                    }
                },
            ));
            Some(handle.render(&handle.state()))
        });
        info!(client = %self.name, channel = %handle.id(), "Channel installed");

        let events = Arc::new(DisputeLog {
            client: self.name.clone(),
        });
        let mut shutdown = self.shutdown.subscribe();
        let id = handle.id();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                result = channel.watch(events) => match result {
                    Ok(()) => debug!(channel = %id, "Dispute watcher finished"),
                    Err(e) => warn!(channel = %id, error = %e, "Dispute watcher failed"),
                },
                _ = stopped(&mut shutdown) => {}
            }
        });
        self.track(watcher);
        handle
    }

    fn on_channel_state_changed(
        &self,
        handle: &ChannelHandle,
        previous: Option<&ChannelState>,
        next: &ChannelState,
    ) {
        debug!(
            client = %self.name,
            channel = %next.id,
            from = ?previous.map(|state| state.version),
            to = next.version,
            "Channel state changed"
        );
        self.registry.broadcast_state(&handle.render(next));
    }

    async fn refresh_balance(&self) -> Result<bool> {
        // A query started later must never be overwritten by an older one.
        let _refreshing = self.refreshing.lock().await;
        let timeout = self.config.balance_timeout();
        let amount = tokio::time::timeout(timeout, self.balance_source.query_balance(&self.account))
            .await
            .map_err(|_| PaymentError::Timeout {
                operation: Operation::QueryBalance,
                timeout,
            })??;

        let changed = self.registry.broadcast_balance_with(|| {
            let mut cached = lock(&self.balance);
            if *cached == amount {
                return None;
            }
            *cached = amount;
            Some(render_balance(amount, &self.converter))
        });
        if changed {
            debug!(client = %self.name, amount, "Balance changed");
        }
        Ok(changed)
    }
}

async fn poll_balances(
    client: Weak<ClientInner>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let Some(inner) = client.upgrade() else {
            break;
        };
        if let Err(e) = inner.refresh_balance().await {
            warn!(client = %inner.name, error = %e, "Balance poll failed");
        }
        drop(inner);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Balance poller stopped");
}

/// Answers the engine on behalf of the client.
struct IncomingRequests {
    inner: Weak<ClientInner>,
}

impl IncomingRequests {
    fn client(&self) -> std::result::Result<Arc<ClientInner>, String> {
        self.inner
            .upgrade()
            .ok_or_else(|| "client is shut down".to_string())
    }
}

#[async_trait]
impl ProposalHandler for IncomingRequests {
    async fn handle_proposal(&self, proposal: &ChannelProposal) -> std::result::Result<(), String> {
        let inner = self.client()?;
        inner.ensure_running().map_err(|e| e.to_string())?;
        let own = inner.account.address();
        let [proposer, responder] = proposal.participants;
        if responder != own || proposer == own {
            return Err("proposal does not address us as responder".to_string());
        }
        let assets: Vec<&Asset> = proposal.initial_allocation.assets().collect();
        if assets != [&inner.asset] {
            return Err(format!("proposal must use only {}", inner.asset));
        }
        if proposal.initial_allocation.find_negative().is_some() {
            return Err("proposal contains a negative balance".to_string());
        }
        inner.reserve_slot().map_err(|e| e.to_string())?;
        info!(client = %inner.name, %proposer, "Accepted channel proposal");
        Ok(())
    }

    async fn channel_accepted(&self, channel: ChannelRef) {
        let Ok(inner) = self.client() else {
            return;
        };
        let handle = inner.install(channel);
        let id = handle.id();
        // Waits for room in the handoff; the channel is already usable.
        if inner.accepted_tx.send(handle).await.is_err() {
            warn!(client = %inner.name, channel = %id, "Dropped accepted channel handoff");
        }
    }
}

impl UpdateHandler for IncomingRequests {
    fn handle_update(
        &self,
        current: &ChannelState,
        proposed: &ChannelState,
        own: Participant,
    ) -> std::result::Result<(), String> {
        let inner = self.client()?;
        if current.is_final {
            return Err("channel is already final".to_string());
        }
        let before = current.allocation.balance(own, &inner.asset);
        let after = proposed.allocation.balance(own, &inner.asset);
        if after < before {
            return Err(format!("update would lower our balance from {before} to {after}"));
        }
        Ok(())
    }
}

/// Logs on-chain events for a channel.
struct DisputeLog {
    client: String,
}

impl AdjudicatorEventHandler for DisputeLog {
    fn handle_adjudicator_event(&self, event: AdjudicatorEvent) {
        let channel = event.channel();
        let version = event.version();
        match event {
            AdjudicatorEvent::Registered { .. } => {
                warn!(client = %self.client, %channel, version, "Channel state registered on-chain")
            }
            AdjudicatorEvent::Progressed { .. } => {
                warn!(client = %self.client, %channel, version, "Channel state progressed on-chain")
            }
            AdjudicatorEvent::Concluded { .. } => {
                info!(client = %self.client, %channel, version, "Channel concluded on-chain")
            }
        }
    }
}
