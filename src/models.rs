// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use sqlx::FromRow;
use std::fmt;

/// Reserved ticker recorded for cash deposits.
pub const DEPOSIT_SYMBOL: &str = "DEPOSIT";

pub type UserId = i64;

/// Whole hundredths of a dollar. Every balance and price is stored this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Cents(pub i64);

impl Cents {
    pub const ZERO: Cents = Cents(0);

    /// Rounds to the nearest cent, half away from zero.
    pub fn from_decimal(amount: Decimal) -> Option<Cents> {
        amount
            .checked_mul(Decimal::ONE_HUNDRED)?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .map(Cents)
    }

    pub fn checked_mul(self, shares: i64) -> Option<Cents> {
        self.0.checked_mul(shares).map(Cents)
    }

    pub fn checked_add(self, other: Cents) -> Option<Cents> {
        self.0.checked_add(other.0).map(Cents)
    }
}

impl fmt::Display for Cents {
    /// Formats as US dollars, e.g. `$10,300.00`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let dollars = (abs / 100).to_string();
        let mut grouped = String::with_capacity(dollars.len() + dollars.len() / 3);
        for (i, digit) in dollars.chars().enumerate() {
            if i > 0 && (dollars.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(digit);
        }
        write!(f, "{}${}.{:02}", sign, grouped, abs % 100)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub hash: String,
    pub cash: i64,
    pub starting_cash: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Buy,
    Sell,
    Deposit,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransactionKind::Buy => "Bought",
            TransactionKind::Sell => "Sold",
            TransactionKind::Deposit => "Deposit",
        };
        f.write_str(label)
    }
}

/// One row of the append-only transaction log.
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub symbol: String,
    pub shares: i64,
    pub price: i64,
    pub timestamp: DateTime<Utc>,
}

/// Net positive position in one symbol.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Holding {
    pub symbol: String,
    pub shares: i64,
    pub last_price: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub name: String,
    pub price: Cents,
}

#[derive(Debug, Clone)]
pub struct PortfolioRow {
    pub symbol: String,
    pub name: String,
    pub shares: i64,
    pub price: Cents,
    pub total: Cents,
}

#[derive(Debug, Clone)]
pub struct Portfolio {
    pub rows: Vec<PortfolioRow>,
    pub cash: Cents,
    pub holdings_value: Cents,
    pub grand_total: Cents,
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialsForm {
    pub username: Option<String>,
    pub password: Option<String>,
    pub confirmation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TradeForm {
    pub symbol: Option<String>,
    pub shares: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SymbolForm {
    pub symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DepositForm {
    pub amount: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangePasswordForm {
    pub current: Option<String>,
    pub new: Option<String>,
    pub confirmation: Option<String>,
}
