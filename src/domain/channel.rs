use crate::domain::account::Address;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Number of participants in a payment channel.
pub const PARTICIPANTS: usize = 2;

/// Unique identifier of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId([u8; 32]);

impl ChannelId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Builds an id whose trailing bytes encode `counter`.
    pub fn from_counter(counter: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", hex::encode(self.0))
    }
}

/// Identifier of the asset a channel settles in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Asset(String);

impl Asset {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The native ledger asset.
    pub fn native() -> Self {
        Self::new("lovelace")
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a party inside a channel. The proposer is always index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Participant {
    Proposer,
    Responder,
}

impl Participant {
    pub fn index(self) -> usize {
        match self {
            Participant::Proposer => 0,
            Participant::Responder => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Participant::Proposer => Participant::Responder,
            Participant::Responder => Participant::Proposer,
        }
    }

    pub fn all() -> [Participant; PARTICIPANTS] {
        [Participant::Proposer, Participant::Responder]
    }
}

/// Per-participant balances of a channel, keyed by asset, in smallest units.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Allocation {
    balances: BTreeMap<Asset, [i64; PARTICIPANTS]>,
}

impl Allocation {
    pub fn new(asset: Asset, balances: [i64; PARTICIPANTS]) -> Self {
        let mut allocation = Self::default();
        allocation.set_balances(asset, balances);
        allocation
    }

    pub fn set_balances(&mut self, asset: Asset, balances: [i64; PARTICIPANTS]) {
        self.balances.insert(asset, balances);
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.balances.keys()
    }

    pub fn balance(&self, participant: Participant, asset: &Asset) -> i64 {
        self.balances
            .get(asset)
            .map(|b| b[participant.index()])
            .unwrap_or(0)
    }

    /// Sum of every asset held by `participant`.
    pub fn holdings(&self, participant: Participant) -> i64 {
        self.balances
            .values()
            .map(|b| b[participant.index()])
            .fold(0i64, i64::saturating_add)
    }

    /// Moves `amount` of `asset` from one participant to the other.
    ///
    /// No validation happens here; the engine checks the resulting state.
    pub fn transfer(&mut self, from: Participant, to: Participant, asset: &Asset, amount: i64) {
        let entry = self.balances.entry(asset.clone()).or_insert([0; PARTICIPANTS]);
        entry[from.index()] = entry[from.index()].saturating_sub(amount);
        entry[to.index()] = entry[to.index()].saturating_add(amount);
    }

    /// Returns the first negative balance, if any.
    pub fn find_negative(&self) -> Option<(&Asset, Participant)> {
        self.balances.iter().find_map(|(asset, balances)| {
            Participant::all()
                .into_iter()
                .find(|p| balances[p.index()] < 0)
                .map(|p| (asset, p))
        })
    }

    /// Checks that `next` is a valid successor: same assets, same totals,
    /// and no negative balances.
    pub fn check_successor(&self, next: &Allocation) -> Result<(), String> {
        if !self.balances.keys().eq(next.balances.keys()) {
            return Err("allocation assets changed".to_string());
        }
        for (asset, current) in &self.balances {
            let proposed = next.balances[asset];
            let before = i128::from(current[0]) + i128::from(current[1]);
            let after = i128::from(proposed[0]) + i128::from(proposed[1]);
            if before != after {
                return Err(format!("total of {asset} changed from {before} to {after}"));
            }
        }
        if let Some((asset, participant)) = next.find_negative() {
            return Err(format!(
                "insufficient balance: participant {} would hold a negative amount of {asset}",
                participant.index()
            ));
        }
        Ok(())
    }
}

/// Off-chain state of a channel as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    pub id: ChannelId,
    pub version: u64,
    pub allocation: Allocation,
    pub is_final: bool,
}

impl ChannelState {
    pub fn initial(id: ChannelId, allocation: Allocation) -> Self {
        Self {
            id,
            version: 0,
            allocation,
            is_final: false,
        }
    }
}

/// Proposal for a new two-party ledger channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProposal {
    pub participants: [Address; PARTICIPANTS],
    pub initial_allocation: Allocation,
    pub challenge_duration: Duration,
}

/// On-chain events reported to a dispute watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjudicatorEvent {
    /// A state was registered on-chain, opening a challenge window.
    Registered { channel: ChannelId, version: u64 },
    /// A registered state was progressed on-chain.
    Progressed { channel: ChannelId, version: u64 },
    /// The channel was concluded on-chain; funds can be withdrawn.
    Concluded { channel: ChannelId, version: u64 },
}

impl AdjudicatorEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            AdjudicatorEvent::Registered { channel, .. }
            | AdjudicatorEvent::Progressed { channel, .. }
            | AdjudicatorEvent::Concluded { channel, .. } => *channel,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            AdjudicatorEvent::Registered { version, .. }
            | AdjudicatorEvent::Progressed { version, .. }
            | AdjudicatorEvent::Concluded { version, .. } => *version,
        }
    }
}
