use crate::domain::account::Address;
use crate::domain::channel::{Asset, ChannelId, ChannelState, PARTICIPANTS};
use crate::domain::currency::{Amount, CurrencyConverter};
use crate::domain::ports::ChannelRef;
use crate::error::{EngineError, Operation, PaymentError, Result};
use crate::interfaces::render::render_state;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of a channel handle. No transition leads back to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePhase {
    Open,
    Finalizing,
    Settled,
    Closed,
}

/// Wraps one active channel and the asset payments are made in.
///
/// Operations on a handle are serialized: a payment never overlaps a
/// settlement on the same channel.
pub struct ChannelHandle {
    channel: ChannelRef,
    asset: Asset,
    converter: CurrencyConverter,
    timeout: Duration,
    phase: Mutex<HandlePhase>,
    ops: tokio::sync::Mutex<()>,
}

impl ChannelHandle {
    pub fn new(
        channel: ChannelRef,
        asset: Asset,
        converter: CurrencyConverter,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            asset,
            converter,
            timeout,
            phase: Mutex::new(HandlePhase::Open),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn participants(&self) -> [Address; PARTICIPANTS] {
        self.channel.participants()
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn phase(&self) -> HandlePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.phase() == HandlePhase::Open
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == HandlePhase::Closed
    }

    fn set_phase(&self, phase: HandlePhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        debug!(channel = %self.id(), ?phase, "Channel phase changed");
    }

    /// Renders `state` with this channel's participants and asset.
    pub fn render(&self, state: &ChannelState) -> String {
        render_state(&self.participants(), state, &self.asset, &self.converter)
    }

    /// Transfers `amount` display units from the local party to the peer.
    ///
    /// Rejected updates are returned to the caller and never retried.
    pub async fn send_payment(&self, amount: Decimal) -> Result<()> {
        let _op = self.ops.lock().await;
        if self.phase() != HandlePhase::Open {
            return Err(PaymentError::ChannelNotOpen(self.id()));
        }
        let amount = Amount::new(amount)?;
        let units = self.converter.to_smallest_unit(amount.value())?;
        if units == 0 {
            return Err(PaymentError::ValidationError(format!(
                "amount {} is below the smallest unit",
                amount.value()
            )));
        }
        if self.channel.state().is_final {
            return Err(PaymentError::ChannelFinal(self.id()));
        }

        let actor = self.channel.idx();
        let peer = actor.other();
        let asset = self.asset.clone();
        debug!(channel = %self.id(), units, "Sending payment");
        self.engine_call(
            Operation::SendPayment,
            self.channel.update(Box::new(move |state| {
                state.allocation.transfer(actor, peer, &asset, units);
            })),
        )
        .await?;
        info!(channel = %self.id(), amount = %amount.value(), "Payment sent");
        Ok(())
    }

    /// Finalizes the channel if needed, settles it and releases its resources.
    ///
    /// Steps run strictly in that order. A failing step leaves the handle in
    /// its current phase; calling `settle` again resumes from there. Once the
    /// handle is closed, further calls fail with `ChannelClosed`.
    pub async fn settle(&self) -> Result<()> {
        let _op = self.ops.lock().await;
        loop {
            match self.phase() {
                HandlePhase::Closed => return Err(PaymentError::ChannelClosed(self.id())),
                HandlePhase::Open => self.set_phase(HandlePhase::Finalizing),
                HandlePhase::Finalizing => {
                    if !self.channel.state().is_final {
                        debug!(channel = %self.id(), "Finalizing channel");
                        self.engine_call(
                            Operation::Finalize,
                            self.channel.update(Box::new(|state| state.is_final = true)),
                        )
                        .await
                        .inspect_err(|e| {
                            warn!(channel = %self.id(), error = %e, "Finalization failed")
                        })?;
                    }
                    self.engine_call(Operation::Settle, self.channel.settle(false))
                        .await
                        .inspect_err(|e| {
                            warn!(channel = %self.id(), error = %e, "Settlement failed")
                        })?;
                    self.set_phase(HandlePhase::Settled);
                }
                HandlePhase::Settled => {
                    self.engine_call(Operation::Close, self.channel.close())
                        .await?;
                    self.set_phase(HandlePhase::Closed);
                    info!(channel = %self.id(), "Channel settled and closed");
                    return Ok(());
                }
            }
        }
    }

    async fn engine_call(
        &self,
        operation: Operation,
        call: impl Future<Output = std::result::Result<(), EngineError>>,
    ) -> Result<()> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(|source| PaymentError::Engine {
                operation,
                channel: Some(self.id()),
                source,
            }),
            Err(_) => Err(PaymentError::Timeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::ADDRESS_LEN;
    use crate::domain::channel::{Allocation, ChannelProposal, Participant};
    use crate::domain::ports::{
        AdjudicatorEventHandler, Channel, ChannelEngine, ProposalHandler, StateMutator,
        UpdateCallback, UpdateHandler,
    };
    use crate::infrastructure::in_memory::InMemoryNetwork;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const ALICE: Address = Address::new([0xa1; ADDRESS_LEN]);
    const BOB: Address = Address::new([0xb0; ADDRESS_LEN]);

    /// Peer that accepts everything and drops the delivered channel.
    struct AcceptAll;

    #[async_trait]
    impl ProposalHandler for AcceptAll {
        async fn handle_proposal(&self, _: &ChannelProposal) -> std::result::Result<(), String> {
            Ok(())
        }

        async fn channel_accepted(&self, _: ChannelRef) {}
    }

    impl UpdateHandler for AcceptAll {
        fn handle_update(
            &self,
            _: &ChannelState,
            _: &ChannelState,
            _: Participant,
        ) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    async fn open_handle(network: &InMemoryNetwork) -> ChannelHandle {
        network.fund(ALICE, 100_000000);
        network.fund(BOB, 100_000000);
        let bob = network.engine(BOB);
        let peer = Arc::new(AcceptAll);
        tokio::spawn(async move { bob.handle(peer.clone(), peer).await });
        network.wait_for_endpoint(BOB).await;

        let proposal = ChannelProposal {
            participants: [ALICE, BOB],
            initial_allocation: Allocation::new(Asset::native(), [10_000000, 10_000000]),
            challenge_duration: Duration::from_secs(10),
        };
        let channel = network.engine(ALICE).propose_channel(proposal).await.unwrap();
        ChannelHandle::new(
            channel,
            Asset::native(),
            CurrencyConverter::ADA,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_send_payment_moves_funds_to_peer() {
        let network = InMemoryNetwork::new();
        let handle = open_handle(&network).await;

        handle.send_payment(dec!(3)).await.unwrap();

        let state = handle.state();
        assert_eq!(state.version, 1);
        assert_eq!(state.allocation.balance(Participant::Proposer, handle.asset()), 7_000000);
        assert_eq!(state.allocation.balance(Participant::Responder, handle.asset()), 13_000000);
    }

    #[tokio::test]
    async fn test_rejected_payment_is_surfaced() {
        let network = InMemoryNetwork::new();
        let handle = open_handle(&network).await;

        let result = handle.send_payment(dec!(11)).await;
        assert!(matches!(
            result,
            Err(PaymentError::Engine {
                operation: Operation::SendPayment,
                source: EngineError::Rejected(_),
                ..
            })
        ));
        assert_eq!(handle.state().version, 0);
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn test_non_positive_amount_is_rejected() {
        let network = InMemoryNetwork::new();
        let handle = open_handle(&network).await;

        assert!(matches!(
            handle.send_payment(dec!(-1)).await,
            Err(PaymentError::ValidationError(_))
        ));
        assert!(matches!(
            handle.send_payment(dec!(0.0000001)).await,
            Err(PaymentError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_settle_walks_every_phase() {
        let network = InMemoryNetwork::new();
        let handle = open_handle(&network).await;
        handle.send_payment(dec!(2)).await.unwrap();

        handle.settle().await.unwrap();

        assert_eq!(handle.phase(), HandlePhase::Closed);
        let state = handle.state();
        assert!(state.is_final);
        assert_eq!(state.version, 2);
        assert_eq!(network.ledger_balance(&ALICE), 98_000000);
    }

    #[tokio::test]
    async fn test_second_settle_reports_closed_without_side_effects() {
        let network = InMemoryNetwork::new();
        let handle = open_handle(&network).await;
        handle.settle().await.unwrap();
        let version = handle.state().version;
        let ledger = network.ledger_balance(&ALICE);

        let second = handle.settle().await;

        assert!(matches!(second, Err(PaymentError::ChannelClosed(_))));
        assert_eq!(handle.state().version, version);
        assert_eq!(network.ledger_balance(&ALICE), ledger);
    }

    /// Channel whose updates never complete.
    struct StalledUpdates(ChannelRef);

    #[async_trait]
    impl Channel for StalledUpdates {
        fn id(&self) -> ChannelId {
            self.0.id()
        }

        fn idx(&self) -> Participant {
            self.0.idx()
        }

        fn participants(&self) -> [Address; PARTICIPANTS] {
            self.0.participants()
        }

        fn state(&self) -> ChannelState {
            self.0.state()
        }

        async fn update(&self, _mutator: StateMutator) -> std::result::Result<(), EngineError> {
            std::future::pending().await
        }

        async fn settle(&self, force: bool) -> std::result::Result<(), EngineError> {
            self.0.settle(force).await
        }

        async fn close(&self) -> std::result::Result<(), EngineError> {
            self.0.close().await
        }

        fn on_update(&self, callback: UpdateCallback) {
            self.0.on_update(callback)
        }

        async fn watch(
            &self,
            handler: Arc<dyn AdjudicatorEventHandler>,
        ) -> std::result::Result<(), EngineError> {
            self.0.watch(handler).await
        }
    }

    #[tokio::test]
    async fn test_stalled_engine_calls_time_out_without_changes() {
        let network = InMemoryNetwork::new();
        let open = open_handle(&network).await;
        let timeout = Duration::from_millis(50);
        let handle = ChannelHandle::new(
            Arc::new(StalledUpdates(open.channel.clone())),
            Asset::native(),
            CurrencyConverter::ADA,
            timeout,
        );

        let result = handle.send_payment(dec!(1)).await;
        assert!(matches!(
            result,
            Err(PaymentError::Timeout { operation: Operation::SendPayment, timeout: t }) if t == timeout
        ));
        assert_eq!(handle.state().version, 0);
        assert!(handle.is_open());

        for _ in 0..2 {
            let result = handle.settle().await;
            assert!(matches!(
                result,
                Err(PaymentError::Timeout { operation: Operation::Finalize, .. })
            ));
            assert_eq!(handle.phase(), HandlePhase::Finalizing);
            assert!(!handle.state().is_final);
        }
        assert_eq!(network.ledger_balance(&ALICE), 90_000000);
    }

    #[tokio::test]
    async fn test_payment_after_settle_fails() {
        let network = InMemoryNetwork::new();
        let handle = open_handle(&network).await;
        handle.settle().await.unwrap();

        let result = handle.send_payment(dec!(1)).await;
        assert!(matches!(result, Err(PaymentError::ChannelNotOpen(_))));
    }
}
