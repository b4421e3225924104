// src/error.rs
use crate::ledger::LedgerError;
use log::warn;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;

#[derive(Debug, Error)]
pub enum AppError {
    /// A user-facing failure rendered as an apology page.
    #[error("{message}")]
    Apology { message: String, status: StatusCode },
    #[error("login required")]
    LoginRequired,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("session token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Apology { status, .. } => *status,
            AppError::LoginRequired => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Reject for AppError {}

/// Bad input, reported with status 400.
pub fn apology(message: impl Into<String>) -> AppError {
    AppError::Apology {
        message: message.into(),
        status: StatusCode::BAD_REQUEST,
    }
}

/// Authentication failure, reported with status 403.
pub fn forbidden(message: impl Into<String>) -> AppError {
    AppError::Apology {
        message: message.into(),
        status: StatusCode::FORBIDDEN,
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { needed, available } => apology(format!(
                "can't afford: that costs {} and you have {}",
                needed, available
            )),
            LedgerError::InsufficientShares { .. } => apology("too many shares"),
            LedgerError::Overflow => apology("amount too large"),
            LedgerError::UnknownUser(user_id) => {
                warn!("Session refers to unknown user {}", user_id);
                AppError::LoginRequired
            }
            LedgerError::Database(e) => AppError::Database(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cents;

    #[test]
    fn app_errors_survive_a_rejection() {
        let rejection = warp::reject::custom(apology("missing symbol"));
        let err = rejection.find::<AppError>().unwrap();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "missing symbol");
    }

    #[test]
    fn ledger_failures_become_apologies() {
        let err = AppError::from(LedgerError::Overflow);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "amount too large");

        let err = AppError::from(LedgerError::InsufficientFunds {
            needed: Cents(50_000),
            available: Cents(1_000),
        });
        assert_eq!(err.to_string(), "can't afford: that costs $500.00 and you have $10.00");

        let err = AppError::from(LedgerError::UnknownUser(7));
        assert!(matches!(err, AppError::LoginRequired));
    }
}
