use super::account::{Account, Address};
use super::channel::{AdjudicatorEvent, ChannelId, ChannelProposal, ChannelState, Participant};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Mutation applied to a copy of the current state during an update.
pub type StateMutator = Box<dyn FnOnce(&mut ChannelState) + Send>;

/// Invoked with `(previous, next)` after every accepted state update.
pub type UpdateCallback = Arc<dyn Fn(Option<&ChannelState>, &ChannelState) + Send + Sync>;

pub type ChannelRef = Arc<dyn Channel>;
pub type ChannelEngineRef = Arc<dyn ChannelEngine>;
pub type BalanceSourceRef = Arc<dyn BalanceSource>;

/// A live channel as exposed by the channel engine.
///
/// Engines must invoke update callbacks in version order and without holding
/// any lock that `state()` needs.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    /// Position of the local party.
    fn idx(&self) -> Participant;
    fn participants(&self) -> [Address; 2];
    /// Snapshot of the latest accepted state.
    fn state(&self) -> ChannelState;
    /// Proposes a new state built by `mutator`; the engine bumps the version.
    async fn update(&self, mutator: StateMutator) -> std::result::Result<(), EngineError>;
    /// Concludes the channel on-chain and withdraws the local party's funds.
    async fn settle(&self, force: bool) -> std::result::Result<(), EngineError>;
    /// Releases channel-local resources.
    async fn close(&self) -> std::result::Result<(), EngineError>;
    fn on_update(&self, callback: UpdateCallback);
    /// Watches the chain for disputes until the channel is concluded.
    async fn watch(
        &self,
        handler: Arc<dyn AdjudicatorEventHandler>,
    ) -> std::result::Result<(), EngineError>;
}

/// Decides on channel proposals sent by peers.
#[async_trait]
pub trait ProposalHandler: Send + Sync {
    async fn handle_proposal(&self, proposal: &ChannelProposal) -> std::result::Result<(), String>;
    /// Receives the channel built from an accepted proposal.
    async fn channel_accepted(&self, channel: ChannelRef);
}

/// Decides on state updates proposed by the peer.
pub trait UpdateHandler: Send + Sync {
    fn handle_update(
        &self,
        current: &ChannelState,
        proposed: &ChannelState,
        own: Participant,
    ) -> std::result::Result<(), String>;
}

pub trait AdjudicatorEventHandler: Send + Sync {
    fn handle_adjudicator_event(&self, event: AdjudicatorEvent);
}

/// Channel protocol engine: negotiation, signing, funding and adjudication.
#[async_trait]
pub trait ChannelEngine: Send + Sync {
    async fn propose_channel(
        &self,
        proposal: ChannelProposal,
    ) -> std::result::Result<ChannelRef, EngineError>;
    /// Serves incoming requests until the engine is closed.
    async fn handle(
        &self,
        proposals: Arc<dyn ProposalHandler>,
        updates: Arc<dyn UpdateHandler>,
    ) -> std::result::Result<(), EngineError>;
    async fn close(&self) -> std::result::Result<(), EngineError>;
}

/// Reports the available on-chain balance of an account in smallest units.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn query_balance(&self, account: &Account) -> Result<i64>;
}

/// Stable identity of an observer, used for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Subscriber for rendered channel state and balance updates.
///
/// Callbacks run inside the registry's broadcast section and must not
/// register or deregister observers.
pub trait Observer: Send + Sync {
    fn id(&self) -> ObserverId;
    fn update_state(&self, state: &str);
    fn update_balance(&self, balance: &str);
}
