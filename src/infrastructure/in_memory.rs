use crate::domain::account::{Account, Address};
use crate::domain::channel::{
    AdjudicatorEvent, ChannelId, ChannelProposal, ChannelState, PARTICIPANTS, Participant,
};
use crate::domain::ports::{
    AdjudicatorEventHandler, BalanceSource, Channel, ChannelEngine, ChannelRef, ProposalHandler,
    StateMutator, UpdateCallback, UpdateHandler,
};
use crate::error::{BalanceQueryError, EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct Endpoint {
    proposals: Arc<dyn ProposalHandler>,
    updates: Arc<dyn UpdateHandler>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<Address, Endpoint>>,
    ledger: Mutex<HashMap<Address, i64>>,
    channels: AtomicU64,
    registered: Notify,
}

/// An in-process network of channel engines sharing a simulated ledger.
///
/// Parties become reachable once their engine is serving requests through
/// [`ChannelEngine::handle`]. Channel deposits are taken from the ledger and
/// withdrawals are credited back to it.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits `amount` smallest units to `address` on the ledger.
    pub fn fund(&self, address: Address, amount: i64) {
        let mut ledger = lock(&self.inner.ledger);
        let balance = ledger.entry(address).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    pub fn ledger_balance(&self, address: &Address) -> i64 {
        lock(&self.inner.ledger).get(address).copied().unwrap_or(0)
    }

    /// Creates an engine acting for `address`.
    pub fn engine(&self, address: Address) -> Arc<InMemoryChannelEngine> {
        let (closed, _) = watch::channel(false);
        Arc::new(InMemoryChannelEngine {
            network: self.clone(),
            address,
            closed,
        })
    }

    pub fn is_reachable(&self, address: &Address) -> bool {
        lock(&self.inner.endpoints).contains_key(address)
    }

    /// Waits until `address` serves incoming requests.
    pub async fn wait_for_endpoint(&self, address: Address) {
        loop {
            let registered = self.inner.registered.notified();
            if self.is_reachable(&address) {
                return;
            }
            registered.await;
        }
    }

    fn endpoint(&self, address: &Address) -> Option<Endpoint> {
        lock(&self.inner.endpoints).get(address).cloned()
    }

    /// Debits both deposits at once, or nothing.
    fn debit(&self, deposits: [(Address, i64); PARTICIPANTS]) -> std::result::Result<(), EngineError> {
        let mut ledger = lock(&self.inner.ledger);
        for (address, amount) in deposits {
            let available = ledger.get(&address).copied().unwrap_or(0);
            if available < amount {
                return Err(EngineError::Rejected(format!(
                    "insufficient funds: {address} holds {available}, needs {amount}"
                )));
            }
        }
        for (address, amount) in deposits {
            if let Some(balance) = ledger.get_mut(&address) {
                *balance -= amount;
            }
        }
        Ok(())
    }

    fn credit(&self, deposits: [(Address, i64); PARTICIPANTS]) {
        for (address, amount) in deposits {
            self.fund(address, amount);
        }
    }
}

#[async_trait]
impl BalanceSource for InMemoryNetwork {
    async fn query_balance(&self, account: &Account) -> Result<i64> {
        let address = account.address();
        lock(&self.inner.ledger)
            .get(&address)
            .copied()
            .ok_or_else(|| BalanceQueryError::UnknownAccount(address.to_hex()).into())
    }
}

/// Channel engine of a single party on an [`InMemoryNetwork`].
pub struct InMemoryChannelEngine {
    network: InMemoryNetwork,
    address: Address,
    closed: watch::Sender<bool>,
}

impl InMemoryChannelEngine {
    pub fn address(&self) -> Address {
        self.address
    }

    fn ensure_open(&self) -> std::result::Result<(), EngineError> {
        if *self.closed.borrow() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelEngine for InMemoryChannelEngine {
    async fn propose_channel(
        &self,
        proposal: ChannelProposal,
    ) -> std::result::Result<ChannelRef, EngineError> {
        self.ensure_open()?;
        let [proposer, responder] = proposal.participants;
        if proposer != self.address {
            return Err(EngineError::Rejected(
                "the proposer must be the first participant".to_string(),
            ));
        }
        if proposer == responder {
            return Err(EngineError::Rejected(
                "a channel needs two distinct participants".to_string(),
            ));
        }
        let peer = self
            .network
            .endpoint(&responder)
            .ok_or_else(|| EngineError::Unreachable(responder.to_string()))?;
        if let Some((asset, participant)) = proposal.initial_allocation.find_negative() {
            return Err(EngineError::Rejected(format!(
                "negative deposit of {asset} for participant {}",
                participant.index()
            )));
        }

        let allocation = &proposal.initial_allocation;
        let deposits = [
            (proposer, allocation.holdings(Participant::Proposer)),
            (responder, allocation.holdings(Participant::Responder)),
        ];
        self.network.debit(deposits)?;
        if let Err(reason) = peer.proposals.handle_proposal(&proposal).await {
            self.network.credit(deposits);
            debug!(peer = %responder, %reason, "Proposal rejected by peer");
            return Err(EngineError::Rejected(reason));
        }

        let id = ChannelId::from_counter(self.network.inner.channels.fetch_add(1, Ordering::SeqCst) + 1);
        let shared = Arc::new(SharedChannel::new(
            id,
            proposal.participants,
            ChannelState::initial(id, proposal.initial_allocation),
            self.network.clone(),
        ));
        info!(channel = %id, %proposer, %responder, "Channel funded");

        let accepted: ChannelRef = Arc::new(InMemoryChannel {
            shared: shared.clone(),
            idx: Participant::Responder,
        });
        tokio::spawn(async move { peer.proposals.channel_accepted(accepted).await });

        Ok(Arc::new(InMemoryChannel {
            shared,
            idx: Participant::Proposer,
        }))
    }

    async fn handle(
        &self,
        proposals: Arc<dyn ProposalHandler>,
        updates: Arc<dyn UpdateHandler>,
    ) -> std::result::Result<(), EngineError> {
        self.ensure_open()?;
        let mut closed = self.closed.subscribe();
        lock(&self.network.inner.endpoints).insert(self.address, Endpoint { proposals, updates });
        self.network.inner.registered.notify_waiters();
        debug!(address = %self.address, "Serving incoming requests");

        let _ = closed.wait_for(|closed| *closed).await;

        lock(&self.network.inner.endpoints).remove(&self.address);
        debug!(address = %self.address, "Stopped serving requests");
        Ok(())
    }

    async fn close(&self) -> std::result::Result<(), EngineError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

#[derive(Default)]
struct Status {
    withdrawn: [bool; PARTICIPANTS],
    closed: [bool; PARTICIPANTS],
    concluded: Option<u64>,
}

/// State shared by both parties' views of a channel.
struct SharedChannel {
    id: ChannelId,
    participants: [Address; PARTICIPANTS],
    network: InMemoryNetwork,
    state: Mutex<ChannelState>,
    // Held for the whole update, so versions and callbacks stay ordered.
    updating: tokio::sync::Mutex<()>,
    callbacks: Mutex<[Vec<UpdateCallback>; PARTICIPANTS]>,
    status: Mutex<Status>,
    events: broadcast::Sender<AdjudicatorEvent>,
}

impl SharedChannel {
    fn new(
        id: ChannelId,
        participants: [Address; PARTICIPANTS],
        state: ChannelState,
        network: InMemoryNetwork,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            id,
            participants,
            network,
            state: Mutex::new(state),
            updating: tokio::sync::Mutex::new(()),
            callbacks: Mutex::new([Vec::new(), Vec::new()]),
            status: Mutex::new(Status::default()),
            events,
        }
    }

    async fn update(
        &self,
        actor: Participant,
        mutator: StateMutator,
    ) -> std::result::Result<(), EngineError> {
        let _updating = self.updating.lock().await;
        if lock(&self.status).closed[actor.index()] {
            return Err(EngineError::Closed);
        }
        let current = lock(&self.state).clone();
        if current.is_final {
            return Err(EngineError::Rejected("channel state is final".to_string()));
        }

        let mut next = current.clone();
        mutator(&mut next);
        next.id = current.id;
        next.version = current.version + 1;
        current
            .allocation
            .check_successor(&next.allocation)
            .map_err(EngineError::Rejected)?;

        let peer = actor.other();
        let peer_address = self.participants[peer.index()];
        let endpoint = self
            .network
            .endpoint(&peer_address)
            .ok_or_else(|| EngineError::Unreachable(peer_address.to_string()))?;
        endpoint
            .updates
            .handle_update(&current, &next, peer)
            .map_err(EngineError::Rejected)?;

        *lock(&self.state) = next.clone();
        debug!(channel = %self.id, version = next.version, "State update accepted");

        let callbacks: Vec<UpdateCallback> = lock(&self.callbacks).iter().flatten().cloned().collect();
        for callback in callbacks {
            callback(Some(&current), &next);
        }
        Ok(())
    }

    fn settle(&self, actor: Participant, force: bool) -> std::result::Result<(), EngineError> {
        let state = lock(&self.state).clone();
        let events = {
            let mut status = lock(&self.status);
            if status.closed[actor.index()] {
                return Err(EngineError::Closed);
            }
            if status.withdrawn[actor.index()] {
                return Err(EngineError::Rejected("funds already withdrawn".to_string()));
            }
            if !state.is_final && !force {
                return Err(EngineError::Rejected(
                    "cannot settle a non-final state without force".to_string(),
                ));
            }
            let mut events = Vec::new();
            if status.concluded.is_none() {
                if !state.is_final {
                    events.push(AdjudicatorEvent::Registered {
                        channel: self.id,
                        version: state.version,
                    });
                }
                events.push(AdjudicatorEvent::Concluded {
                    channel: self.id,
                    version: state.version,
                });
                status.concluded = Some(state.version);
            }
            status.withdrawn[actor.index()] = true;
            events
        };

        let address = self.participants[actor.index()];
        let amount = state.allocation.holdings(actor);
        self.network.fund(address, amount);
        info!(channel = %self.id, %address, amount, "Funds withdrawn");

        for event in events {
            // No watcher is subscribed when send fails.
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn watch(
        &self,
        handler: Arc<dyn AdjudicatorEventHandler>,
    ) -> std::result::Result<(), EngineError> {
        let mut events = self.events.subscribe();
        if let Some(version) = lock(&self.status).concluded {
            handler.handle_adjudicator_event(AdjudicatorEvent::Concluded {
                channel: self.id,
                version,
            });
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(event) => {
                    let concluded = matches!(event, AdjudicatorEvent::Concluded { .. });
                    handler.handle_adjudicator_event(event);
                    if concluded {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// One party's view of a [`SharedChannel`].
struct InMemoryChannel {
    shared: Arc<SharedChannel>,
    idx: Participant,
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn id(&self) -> ChannelId {
        self.shared.id
    }

    fn idx(&self) -> Participant {
        self.idx
    }

    fn participants(&self) -> [Address; PARTICIPANTS] {
        self.shared.participants
    }

    fn state(&self) -> ChannelState {
        lock(&self.shared.state).clone()
    }

    async fn update(&self, mutator: StateMutator) -> std::result::Result<(), EngineError> {
        self.shared.update(self.idx, mutator).await
    }

    async fn settle(&self, force: bool) -> std::result::Result<(), EngineError> {
        self.shared.settle(self.idx, force)
    }

    async fn close(&self) -> std::result::Result<(), EngineError> {
        lock(&self.shared.status).closed[self.idx.index()] = true;
        Ok(())
    }

    fn on_update(&self, callback: UpdateCallback) {
        lock(&self.shared.callbacks)[self.idx.index()].push(callback);
    }

    async fn watch(
        &self,
        handler: Arc<dyn AdjudicatorEventHandler>,
    ) -> std::result::Result<(), EngineError> {
        self.shared.watch(handler).await
    }
}
