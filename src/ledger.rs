// src/ledger.rs
//! Holdings, valuations and cash movements derived from the transaction log.
//!
//! Every write appends to `transactions` and adjusts `users.cash` inside one
//! SQLite transaction. The stored cash is a projection of the log and
//! [`reconcile`] recomputes it by replaying the log.

use crate::models::{
    Cents, Holding, Portfolio, PortfolioRow, Quote, TransactionKind, TransactionRecord, UserId,
    DEPOSIT_SYMBOL,
};
use crate::quote::QuoteSource;
use chrono::Utc;
use log::{error, info};
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::Error as SqlxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient cash: need {needed}, have {available}")]
    InsufficientFunds { needed: Cents, available: Cents },
    #[error("insufficient shares: requested {requested}, held {held}")]
    InsufficientShares { requested: i64, held: i64 },
    #[error("amount out of range")]
    Overflow,
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error(transparent)]
    Database(#[from] SqlxError),
}

/// Stored cash next to the cash obtained by replaying the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub stored: Cents,
    pub replayed: Cents,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.replayed
    }
}

/// Symbols with a strictly positive net share count, deposits excluded.
pub async fn holdings(pool: &SqlitePool, user_id: UserId) -> Result<Vec<Holding>, SqlxError> {
    sqlx::query_as::<_, Holding>(
        "SELECT t.symbol AS symbol,
                SUM(t.shares) AS shares,
                (SELECT p.price FROM transactions p
                  WHERE p.user_id = t.user_id AND p.symbol = t.symbol
                  ORDER BY p.id DESC LIMIT 1) AS last_price
         FROM transactions t
         WHERE t.user_id = ? AND t.kind != 'DEPOSIT'
         GROUP BY t.symbol
         HAVING SUM(t.shares) > 0
         ORDER BY t.symbol",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Net shares of one symbol, zero when none are held.
pub async fn shares_held<'e, E>(executor: E, user_id: UserId, symbol: &str) -> Result<i64, SqlxError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(shares), 0) FROM transactions
         WHERE user_id = ? AND symbol = ? AND kind != 'DEPOSIT'",
    )
    .bind(user_id)
    .bind(symbol)
    .fetch_one(executor)
    .await
}

/// The full log for one user, newest first, deposits included.
pub async fn history(
    pool: &SqlitePool,
    user_id: UserId,
) -> Result<Vec<TransactionRecord>, SqlxError> {
    sqlx::query_as::<_, TransactionRecord>(
        "SELECT id, user_id, kind, symbol, shares, price, timestamp
         FROM transactions
         WHERE user_id = ?
         ORDER BY timestamp DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

pub async fn cash(pool: &SqlitePool, user_id: UserId) -> Result<Cents, LedgerError> {
    sqlx::query_scalar::<_, i64>("SELECT cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .map(Cents)
        .ok_or(LedgerError::UnknownUser(user_id))
}

/// Starting cash plus deposits, minus buy costs, plus sell proceeds.
pub async fn replay_cash(pool: &SqlitePool, user_id: UserId) -> Result<Cents, LedgerError> {
    sqlx::query_scalar::<_, i64>(
        "SELECT u.starting_cash + COALESCE(SUM(
                    CASE t.kind WHEN 'DEPOSIT' THEN t.price ELSE -(t.shares * t.price) END
                ), 0)
         FROM users u
         LEFT JOIN transactions t ON t.user_id = u.id
         WHERE u.id = ?
         GROUP BY u.id",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .map(Cents)
    .ok_or(LedgerError::UnknownUser(user_id))
}

pub async fn reconcile(pool: &SqlitePool, user_id: UserId) -> Result<Reconciliation, LedgerError> {
    let reconciliation = Reconciliation {
        stored: cash(pool, user_id).await?,
        replayed: replay_cash(pool, user_id).await?,
    };
    if !reconciliation.is_consistent() {
        error!(
            "Cash for user {} is {} but the log replays to {}",
            user_id, reconciliation.stored, reconciliation.replayed
        );
    }
    Ok(reconciliation)
}

/// Reconciles every account and returns the ones whose stored cash disagrees
/// with the log. An account that cannot be read is logged and skipped.
pub async fn audit(pool: &SqlitePool) -> Result<Vec<(UserId, Reconciliation)>, LedgerError> {
    let user_ids: Vec<UserId> = sqlx::query_scalar("SELECT id FROM users ORDER BY id")
        .fetch_all(pool)
        .await?;

    let mut drifted = Vec::new();
    for user_id in user_ids {
        match reconcile(pool, user_id).await {
            Ok(reconciliation) if !reconciliation.is_consistent() => {
                drifted.push((user_id, reconciliation));
            }
            Ok(_) => {}
            Err(e) => error!("Could not reconcile user {}: {}", user_id, e),
        }
    }
    Ok(drifted)
}

/// Debits the cost of `shares` at the quoted price and records the purchase.
/// Returns the remaining cash.
pub async fn buy(
    pool: &SqlitePool,
    user_id: UserId,
    quote: &Quote,
    shares: i64,
) -> Result<Cents, LedgerError> {
    let cost = quote
        .price
        .checked_mul(shares)
        .ok_or(LedgerError::Overflow)?;

    let mut tx = pool.begin().await?;

    // Conditional debit: the write lock is taken before anything is read.
    let debited = sqlx::query("UPDATE users SET cash = cash - ? WHERE id = ? AND cash >= ?")
        .bind(cost.0)
        .bind(user_id)
        .bind(cost.0)
        .execute(&mut *tx)
        .await?;
    if debited.rows_affected() == 0 {
        let available: Option<i64> = sqlx::query_scalar("SELECT cash FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        return Err(match available {
            Some(available) => LedgerError::InsufficientFunds {
                needed: cost,
                available: Cents(available),
            },
            None => LedgerError::UnknownUser(user_id),
        });
    }

    append(&mut tx, user_id, TransactionKind::Buy, &quote.symbol, shares, quote.price).await?;
    let remaining: i64 = sqlx::query_scalar("SELECT cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(
        "User {} bought {} {} at {} for {}",
        user_id, shares, quote.symbol, quote.price, cost
    );
    Ok(Cents(remaining))
}

/// Records the sale of `shares` of `symbol` at the quoted price and credits
/// the proceeds. Returns the new cash balance.
pub async fn sell(
    pool: &SqlitePool,
    user_id: UserId,
    symbol: &str,
    quote: &Quote,
    shares: i64,
) -> Result<Cents, LedgerError> {
    let proceeds = quote
        .price
        .checked_mul(shares)
        .ok_or(LedgerError::Overflow)?;

    let mut tx = pool.begin().await?;

    // Append first so the check below runs under the write lock.
    append(&mut tx, user_id, TransactionKind::Sell, symbol, -shares, quote.price).await?;
    let remaining = shares_held(&mut *tx, user_id, symbol).await?;
    if remaining < 0 {
        tx.rollback().await?;
        return Err(LedgerError::InsufficientShares {
            requested: shares,
            held: remaining + shares,
        });
    }

    let balance = credit(&mut tx, user_id, proceeds).await?;
    tx.commit().await?;

    info!(
        "User {} sold {} {} at {} for {}",
        user_id, shares, symbol, quote.price, proceeds
    );
    Ok(balance)
}

/// Credits `amount` and records it under the deposit pseudo-symbol.
pub async fn deposit(pool: &SqlitePool, user_id: UserId, amount: Cents) -> Result<Cents, LedgerError> {
    let mut tx = pool.begin().await?;

    let balance = credit(&mut tx, user_id, amount).await?;
    append(&mut tx, user_id, TransactionKind::Deposit, DEPOSIT_SYMBOL, 1, amount).await?;
    tx.commit().await?;

    info!("User {} deposited {}", user_id, amount);
    Ok(balance)
}

/// Adds `amount` to the stored cash unless the balance would leave the `i64`
/// range. Returns the new balance.
async fn credit(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    user_id: UserId,
    amount: Cents,
) -> Result<Cents, LedgerError> {
    let ceiling = i64::MAX.checked_sub(amount.0).ok_or(LedgerError::Overflow)?;

    let credited = sqlx::query("UPDATE users SET cash = cash + ? WHERE id = ? AND cash <= ?")
        .bind(amount.0)
        .bind(user_id)
        .bind(ceiling)
        .execute(&mut **tx)
        .await?;
    let balance: Option<i64> = sqlx::query_scalar("SELECT cash FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;
    match balance {
        None => Err(LedgerError::UnknownUser(user_id)),
        Some(_) if credited.rows_affected() == 0 => Err(LedgerError::Overflow),
        Some(balance) => Ok(Cents(balance)),
    }
}

async fn append(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    user_id: UserId,
    kind: TransactionKind,
    symbol: &str,
    shares: i64,
    price: Cents,
) -> Result<(), SqlxError> {
    sqlx::query(
        "INSERT INTO transactions (user_id, kind, symbol, shares, price, timestamp)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(kind)
    .bind(symbol)
    .bind(shares)
    .bind(price.0)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Prices every holding. A holding whose quote cannot be fetched is valued at
/// its last recorded trade price. Totals that leave the `i64` range are an
/// [`LedgerError::Overflow`].
pub async fn valuate(
    holdings: Vec<Holding>,
    cash: Cents,
    quotes: &dyn QuoteSource,
) -> Result<Portfolio, LedgerError> {
    let mut rows = Vec::with_capacity(holdings.len());
    let mut holdings_value = Cents::ZERO;

    for holding in holdings {
        let (name, price) = match quotes.lookup(&holding.symbol).await {
            Some(quote) => (quote.name, quote.price),
            None => (holding.symbol.clone(), Cents(holding.last_price)),
        };
        let total = price
            .checked_mul(holding.shares)
            .ok_or(LedgerError::Overflow)?;
        holdings_value = holdings_value
            .checked_add(total)
            .ok_or(LedgerError::Overflow)?;
        rows.push(PortfolioRow {
            symbol: holding.symbol,
            name,
            shares: holding.shares,
            price,
            total,
        });
    }

    let grand_total = cash
        .checked_add(holdings_value)
        .ok_or(LedgerError::Overflow)?;
    Ok(Portfolio {
        rows,
        cash,
        holdings_value,
        grand_total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::quote::StaticQuotes;

    fn quote(symbol: &str, price: i64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            name: format!("{} Corp", symbol),
            price: Cents(price),
        }
    }

    async fn setup() -> (SqlitePool, UserId) {
        let pool = db::test_pool().await;
        let user = db::create_user(&pool, "trader", "hash", 1_000_000)
            .await
            .unwrap()
            .unwrap();
        (pool, user)
    }

    /// A file-backed pool, so that concurrent transactions use separate
    /// connections and contend for the SQLite write lock.
    async fn file_pool(name: &str) -> (SqlitePool, std::path::PathBuf) {
        let path = std::env::temp_dir()
            .join(format!("paper_trader_{}_{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let pool = db::init(&format!("sqlite://{}?mode=rwc", path.display()))
            .await
            .unwrap();
        (pool, path)
    }

    async fn remove_file_pool(pool: SqlitePool, path: std::path::PathBuf) {
        pool.close().await;
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    #[tokio::test]
    async fn deposit_buy_sell_scenario() {
        let (pool, user) = setup().await;

        assert_eq!(deposit(&pool, user, Cents(50_000)).await.unwrap(), Cents(1_050_000));
        assert_eq!(buy(&pool, user, &quote("ACME", 5_000), 10).await.unwrap(), Cents(1_000_000));
        assert_eq!(shares_held(&pool, user, "ACME").await.unwrap(), 10);

        let balance = sell(&pool, user, "ACME", &quote("ACME", 6_000), 5).await.unwrap();
        assert_eq!(balance, Cents(1_030_000));
        assert_eq!(
            holdings(&pool, user).await.unwrap(),
            vec![Holding {
                symbol: "ACME".to_string(),
                shares: 5,
                last_price: 6_000,
            }]
        );

        let check = reconcile(&pool, user).await.unwrap();
        assert!(check.is_consistent());
        assert_eq!(check.replayed, Cents(1_030_000));
    }

    #[tokio::test]
    async fn insufficient_cash_leaves_state_untouched() {
        let (pool, user) = setup().await;

        let err = buy(&pool, user, &quote("ACME", 100_001), 10).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { needed: Cents(1_000_010), available: Cents(1_000_000) }
        ));
        assert_eq!(cash(&pool, user).await.unwrap(), Cents(1_000_000));
        assert!(history(&pool, user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overselling_is_rolled_back() {
        let (pool, user) = setup().await;
        buy(&pool, user, &quote("ACME", 1_000), 3).await.unwrap();

        let err = sell(&pool, user, "ACME", &quote("ACME", 1_000), 4).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientShares { requested: 4, held: 3 }));
        assert_eq!(cash(&pool, user).await.unwrap(), Cents(997_000));
        assert_eq!(history(&pool, user).await.unwrap().len(), 1);
        assert_eq!(shares_held(&pool, user, "ACME").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn net_zero_symbols_are_not_holdings() {
        let (pool, user) = setup().await;
        buy(&pool, user, &quote("ACME", 1_000), 2).await.unwrap();
        buy(&pool, user, &quote("INIT", 2_000), 1).await.unwrap();
        sell(&pool, user, "ACME", &quote("ACME", 1_500), 2).await.unwrap();
        deposit(&pool, user, Cents(100)).await.unwrap();

        let held = holdings(&pool, user).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].symbol, "INIT");
        assert_eq!(shares_held(&pool, user, "ACME").await.unwrap(), 0);
        assert_eq!(shares_held(&pool, user, DEPOSIT_SYMBOL).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_includes_deposits() {
        let (pool, user) = setup().await;
        deposit(&pool, user, Cents(2_500)).await.unwrap();
        buy(&pool, user, &quote("ACME", 1_000), 1).await.unwrap();

        let log = history(&pool, user).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind, TransactionKind::Buy);
        assert_eq!(log[1].kind, TransactionKind::Deposit);
        assert_eq!(log[1].symbol, DEPOSIT_SYMBOL);
        assert_eq!(log[1].shares, 1);
        assert_eq!(log[1].price, 2_500);
    }

    #[tokio::test]
    async fn reconcile_detects_a_drifted_balance() {
        let (pool, user) = setup().await;
        deposit(&pool, user, Cents(1_000)).await.unwrap();
        sqlx::query("UPDATE users SET cash = cash + 1 WHERE id = ?")
            .bind(user)
            .execute(&pool)
            .await
            .unwrap();

        let check = reconcile(&pool, user).await.unwrap();
        assert!(!check.is_consistent());
        assert_eq!(check.stored, Cents(1_001_001));
        assert_eq!(check.replayed, Cents(1_001_000));
    }

    #[tokio::test]
    async fn audit_lists_only_drifted_accounts() {
        let (pool, user) = setup().await;
        let other = db::create_user(&pool, "other", "hash", 500).await.unwrap().unwrap();
        buy(&pool, user, &quote("ACME", 1_000), 1).await.unwrap();
        deposit(&pool, other, Cents(100)).await.unwrap();
        assert!(audit(&pool).await.unwrap().is_empty());

        sqlx::query("UPDATE users SET cash = 0 WHERE id = ?")
            .bind(other)
            .execute(&pool)
            .await
            .unwrap();
        let drifted = audit(&pool).await.unwrap();
        assert_eq!(
            drifted,
            vec![(other, Reconciliation { stored: Cents(0), replayed: Cents(600) })]
        );
    }

    #[tokio::test]
    async fn unknown_users_are_reported() {
        let (pool, _) = setup().await;
        assert!(matches!(
            deposit(&pool, 999, Cents(100)).await,
            Err(LedgerError::UnknownUser(999))
        ));
        assert!(matches!(
            buy(&pool, 999, &quote("ACME", 100), 1).await,
            Err(LedgerError::UnknownUser(999))
        ));
    }

    #[tokio::test]
    async fn valuation_falls_back_to_last_trade_price() {
        let quotes = StaticQuotes::new().with("ACME", "Acme Corp", Cents(2_000));
        let held = vec![
            Holding { symbol: "ACME".to_string(), shares: 3, last_price: 1_000 },
            Holding { symbol: "GONE".to_string(), shares: 2, last_price: 500 },
        ];

        let portfolio = valuate(held, Cents(10_000), &quotes).await.unwrap();
        assert_eq!(portfolio.rows[0].name, "Acme Corp");
        assert_eq!(portfolio.rows[0].total, Cents(6_000));
        assert_eq!(portfolio.rows[1].price, Cents(500));
        assert_eq!(portfolio.holdings_value, Cents(7_000));
        assert_eq!(portfolio.grand_total, Cents(17_000));
    }

    #[tokio::test]
    async fn deposits_that_overflow_the_balance_are_refused() {
        let (pool, user) = setup().await;

        let err = deposit(&pool, user, Cents(i64::MAX - 10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Overflow));
        assert_eq!(cash(&pool, user).await.unwrap(), Cents(1_000_000));
        assert!(history(&pool, user).await.unwrap().is_empty());

        // The largest deposit that still fits is accepted.
        let balance = deposit(&pool, user, Cents(i64::MAX - 1_000_000)).await.unwrap();
        assert_eq!(balance, Cents(i64::MAX));
        assert!(reconcile(&pool, user).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn sale_proceeds_that_overflow_are_rolled_back() {
        let (pool, user) = setup().await;
        deposit(&pool, user, Cents(i64::MAX - 1_000_100)).await.unwrap();
        buy(&pool, user, &quote("ACME", 50), 1).await.unwrap();
        assert_eq!(cash(&pool, user).await.unwrap(), Cents(i64::MAX - 150));

        let err = sell(&pool, user, "ACME", &quote("ACME", 1_000), 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::Overflow));
        assert_eq!(cash(&pool, user).await.unwrap(), Cents(i64::MAX - 150));
        assert_eq!(shares_held(&pool, user, "ACME").await.unwrap(), 1);
        assert_eq!(history(&pool, user).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn valuation_overflow_is_an_error() {
        let quotes = StaticQuotes::new().with("ACME", "Acme Corp", Cents(i64::MAX / 2));
        let held = vec![Holding { symbol: "ACME".to_string(), shares: 3, last_price: 1 }];
        assert!(matches!(
            valuate(held, Cents(0), &quotes).await,
            Err(LedgerError::Overflow)
        ));

        let held = vec![Holding { symbol: "ACME".to_string(), shares: 1, last_price: 1 }];
        assert!(matches!(
            valuate(held, Cents(i64::MAX / 2 + 2), &quotes).await,
            Err(LedgerError::Overflow)
        ));
    }

    #[tokio::test]
    async fn audit_skips_unreadable_accounts() {
        let (pool, user) = setup().await;
        let other = db::create_user(&pool, "other", "hash", 500).await.unwrap().unwrap();

        // A REAL in the cash column cannot be decoded as cents.
        sqlx::query("UPDATE users SET cash = 1.5 WHERE id = ?")
            .bind(user)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE users SET cash = 0 WHERE id = ?")
            .bind(other)
            .execute(&pool)
            .await
            .unwrap();
        assert!(reconcile(&pool, user).await.is_err());

        let drifted = audit(&pool).await.unwrap();
        assert_eq!(
            drifted,
            vec![(other, Reconciliation { stored: Cents(0), replayed: Cents(500) })]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_sells_cannot_oversell() {
        let (pool, path) = file_pool("concurrent_sells").await;
        let user = db::create_user(&pool, "trader", "hash", 1_000_000)
            .await
            .unwrap()
            .unwrap();
        buy(&pool, user, &quote("ACME", 1_000), 3).await.unwrap();

        let acme = quote("ACME", 1_000);
        let (first, second) = tokio::join!(
            sell(&pool, user, "ACME", &acme, 2),
            sell(&pool, user, "ACME", &acme, 2)
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(LedgerError::InsufficientShares { requested: 2, held: 1 })))
                .count(),
            1
        );
        assert_eq!(shares_held(&pool, user, "ACME").await.unwrap(), 1);
        assert_eq!(cash(&pool, user).await.unwrap(), Cents(999_000));
        assert!(reconcile(&pool, user).await.unwrap().is_consistent());

        remove_file_pool(pool, path).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_buys_cannot_overspend() {
        let (pool, path) = file_pool("concurrent_buys").await;
        let user = db::create_user(&pool, "trader", "hash", 10_000)
            .await
            .unwrap()
            .unwrap();

        let acme = quote("ACME", 6_000);
        let (first, second) = tokio::join!(buy(&pool, user, &acme, 1), buy(&pool, user, &acme, 1));

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
                .count(),
            1
        );
        assert_eq!(cash(&pool, user).await.unwrap(), Cents(4_000));
        assert_eq!(shares_held(&pool, user, "ACME").await.unwrap(), 1);
        assert!(reconcile(&pool, user).await.unwrap().is_consistent());

        remove_file_pool(pool, path).await;
    }
}
