use crate::domain::account::Address;
use crate::domain::channel::{Asset, ChannelState, PARTICIPANTS, Participant};
use crate::domain::currency::{BALANCE_PRECISION, CurrencyConverter, STATE_PRECISION};
use std::fmt::Write;

/// Renders a channel state as a human-readable summary.
///
/// Shows the channel id, each participant's balance of `asset`, the
/// finality flag and the version. Pure, so it can be tested without an engine.
pub fn render_state(
    participants: &[Address; PARTICIPANTS],
    state: &ChannelState,
    asset: &Asset,
    converter: &CurrencyConverter,
) -> String {
    let mut out = format!("Channel ID: {}\nBalances:\n", state.id);
    for participant in Participant::all() {
        let balance = state.allocation.balance(participant, asset);
        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "    {}: {} {}",
            participants[participant.index()],
            converter.format(balance, STATE_PRECISION),
            converter.symbol()
        );
    }
    let _ = write!(out, "Final: {}\nVersion: {}", state.is_final, state.version);
    out
}

/// Renders an on-chain balance in display units.
pub fn render_balance(amount: i64, converter: &CurrencyConverter) -> String {
    converter.format(amount, BALANCE_PRECISION)
}
