use crate::domain::channel::ChannelId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Operations the client performs against external collaborators.
///
/// Used to tag errors so callers can tell which step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ProposeChannel,
    SendPayment,
    Finalize,
    Settle,
    Close,
    QueryBalance,
    Shutdown,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::ProposeChannel => "channel proposal",
            Operation::SendPayment => "payment",
            Operation::Finalize => "finalization",
            Operation::Settle => "settlement",
            Operation::Close => "channel close",
            Operation::QueryBalance => "balance query",
            Operation::Shutdown => "engine shutdown",
        };
        f.write_str(name)
    }
}

/// Failure reported by a channel engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("peer {0} is unreachable")]
    Unreachable(String),
    #[error("engine is closed")]
    Closed,
}

/// Failure of a single balance query.
#[derive(Error, Debug)]
pub enum BalanceQueryError {
    #[error("transport failure: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("wallet server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response body: {0}")]
    Decode(String),
    #[error("no balance known for {0}")]
    UnknownAccount(String),
}

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("balance query failed: {0}")]
    BalanceQuery(#[from] BalanceQueryError),
    #[error("{operation} failed on {}: {source}", describe_channel(.channel))]
    Engine {
        operation: Operation,
        channel: Option<ChannelId>,
        #[source]
        source: EngineError,
    },
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: Operation,
        timeout: Duration,
    },
    #[error("a channel is already active")]
    ChannelAlreadyActive,
    #[error("a channel proposal is already in flight")]
    ProposalInFlight,
    #[error("channel {0} is not open")]
    ChannelNotOpen(ChannelId),
    #[error("channel {0} is already closed")]
    ChannelClosed(ChannelId),
    #[error("channel {0} is already final")]
    ChannelFinal(ChannelId),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("client has been shut down")]
    ShutDown,
}

fn describe_channel(channel: &Option<ChannelId>) -> String {
    match channel {
        Some(id) => format!("channel {id}"),
        None => "new channel".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
