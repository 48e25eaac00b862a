use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Number of decimals used when rendering channel balances.
pub const STATE_PRECISION: usize = 4;
/// Number of decimals used when rendering the on-chain balance.
pub const BALANCE_PRECISION: usize = 6;

/// Largest exponent whose power of ten still fits in an `i64`.
const MAX_DECIMALS: u32 = 18;

/// Converts between a ledger's smallest indivisible unit and its display unit.
///
/// The smallest unit is `10^decimals` times smaller than the display unit.
/// All conversions are pure and exact for whole display units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrencyConverter {
    decimals: u32,
    symbol: &'static str,
}

impl CurrencyConverter {
    /// Ada, with Lovelace as the smallest unit.
    pub const ADA: Self = Self {
        decimals: 6,
        symbol: "ADA",
    };

    pub fn new(decimals: u32, symbol: &'static str) -> Result<Self> {
        if decimals > MAX_DECIMALS {
            return Err(PaymentError::ConfigError(format!(
                "currency exponent {decimals} exceeds {MAX_DECIMALS}"
            )));
        }
        Ok(Self { decimals, symbol })
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    /// Converts a display amount to the smallest unit, truncating toward zero.
    pub fn to_smallest_unit(&self, display_amount: Decimal) -> Result<i64> {
        let divisor = Decimal::from(10i64.pow(self.decimals));
        display_amount
            .checked_mul(divisor)
            .and_then(|scaled| scaled.trunc().to_i64())
            .ok_or_else(|| {
                PaymentError::ValidationError(format!(
                    "amount {display_amount} {} is out of range",
                    self.symbol
                ))
            })
    }

    /// Converts a smallest-unit amount to the display unit.
    pub fn to_display_unit(&self, smallest_unit_amount: i64) -> Decimal {
        Decimal::new(smallest_unit_amount, self.decimals)
    }

    /// Renders a smallest-unit amount in display units with fixed precision.
    pub fn format(&self, smallest_unit_amount: i64, precision: usize) -> String {
        format!(
            "{:.*}",
            precision,
            self.to_display_unit(smallest_unit_amount)
        )
    }
}

impl Default for CurrencyConverter {
    fn default() -> Self {
        Self::ADA
    }
}

/// A strictly positive amount in display units, used for payments.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}
