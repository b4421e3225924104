// src/api.rs
use crate::auth::{self, with_user};
use crate::config::Config;
use crate::db;
use crate::error::{apology, forbidden, AppError};
use crate::ledger::{self, LedgerError};
use crate::models::{
    Cents, ChangePasswordForm, CredentialsForm, DepositForm, SymbolForm, TradeForm, UserId,
    DEPOSIT_SYMBOL,
};
use crate::quote::QuoteSource;
use crate::views;
use log::{error, info};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use warp::http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, EXPIRES, PRAGMA, SET_COOKIE};
use warp::http::{StatusCode, Uri};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_FORM_BYTES: u64 = 16 * 1024;

/// Everything a request handler needs: the store, the price source and settings.
#[derive(Clone)]
pub struct AppContext {
    pub pool: SqlitePool,
    pub quotes: Arc<dyn QuoteSource>,
    pub config: Arc<Config>,
}

type HandlerResult = Result<Response, AppError>;

pub fn routes(ctx: AppContext) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let user = with_user(Arc::new(ctx.config.session_secret.clone()));

    let index = warp::path::end()
        .and(warp::get())
        .and(user.clone())
        .and(with_context(ctx.clone()))
        .and(warp::cookie::optional::<String>(auth::FLASH_COOKIE))
        .and_then(|user: UserId, ctx: AppContext, flash: Option<String>| {
            respond(index_handler(user, ctx, flash))
        });

    let buy_page = warp::path!("buy")
        .and(warp::get())
        .and(user.clone())
        .map(|_: UserId| html(views::buy_form()));
    let buy = warp::path!("buy")
        .and(warp::post())
        .and(user.clone())
        .and(with_context(ctx.clone()))
        .and(form::<TradeForm>())
        .and_then(|user: UserId, ctx: AppContext, form: TradeForm| {
            respond(buy_handler(user, ctx, form))
        });

    let sell_page = warp::path!("sell")
        .and(warp::get())
        .and(user.clone())
        .and(with_context(ctx.clone()))
        .and_then(|user: UserId, ctx: AppContext| respond(sell_page_handler(user, ctx)));
    let sell = warp::path!("sell")
        .and(warp::post())
        .and(user.clone())
        .and(with_context(ctx.clone()))
        .and(form::<TradeForm>())
        .and_then(|user: UserId, ctx: AppContext, form: TradeForm| {
            respond(sell_handler(user, ctx, form))
        });

    let deposit_page = warp::path!("deposit")
        .and(warp::get())
        .and(user.clone())
        .map(|_: UserId| html(views::deposit_form()));
    let deposit = warp::path!("deposit")
        .and(warp::post())
        .and(user.clone())
        .and(with_context(ctx.clone()))
        .and(form::<DepositForm>())
        .and_then(|user: UserId, ctx: AppContext, form: DepositForm| {
            respond(deposit_handler(user, ctx, form))
        });

    let history = warp::path!("history")
        .and(warp::get())
        .and(user.clone())
        .and(with_context(ctx.clone()))
        .and_then(|user: UserId, ctx: AppContext| respond(history_handler(user, ctx)));

    let quote_page = warp::path!("quote")
        .and(warp::get())
        .and(user.clone())
        .map(|_: UserId| html(views::quote_form()));
    let quote = warp::path!("quote")
        .and(warp::post())
        .and(user.clone())
        .and(with_context(ctx.clone()))
        .and(form::<SymbolForm>())
        .and_then(|user: UserId, ctx: AppContext, form: SymbolForm| {
            respond(quote_handler(user, ctx, form))
        });

    let register_page = warp::path!("register")
        .and(warp::get())
        .map(|| logged_out(html(views::register_form())));
    let register = warp::path!("register")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and(form::<CredentialsForm>())
        .and_then(|ctx: AppContext, form: CredentialsForm| {
            respond(register_handler(ctx, form))
        });

    let login_page = warp::path!("login")
        .and(warp::get())
        .map(|| logged_out(html(views::login_form())));
    let login = warp::path!("login")
        .and(warp::post())
        .and(with_context(ctx.clone()))
        .and(form::<CredentialsForm>())
        .and_then(|ctx: AppContext, form: CredentialsForm| {
            respond(login_handler(ctx, form))
        });

    let logout = warp::path!("logout")
        .and(warp::get())
        .map(|| logged_out(see_other("/")));

    let change_password_page = warp::path!("change-password")
        .and(warp::get())
        .and(user.clone())
        .map(|_: UserId| html(views::change_password_form()));
    let change_password = warp::path!("change-password")
        .and(warp::post())
        .and(user)
        .and(with_context(ctx))
        .and(form::<ChangePasswordForm>())
        .and_then(|user: UserId, ctx: AppContext, form: ChangePasswordForm| {
            respond(change_password_handler(user, ctx, form))
        });

    let mut no_cache = HeaderMap::new();
    no_cache.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    no_cache.insert(EXPIRES, HeaderValue::from_static("0"));
    no_cache.insert(PRAGMA, HeaderValue::from_static("no-cache"));

    index
        .or(buy_page)
        .or(buy)
        .or(sell_page)
        .or(sell)
        .or(deposit_page)
        .or(deposit)
        .or(history)
        .or(quote_page)
        .or(quote)
        .or(register_page)
        .or(register)
        .or(login_page)
        .or(login)
        .or(logout)
        .or(change_password_page)
        .or(change_password)
        .recover(handle_rejection)
        .with(warp::reply::with::headers(no_cache))
        .with(warp::log("paper_trader"))
}

fn with_context(
    ctx: AppContext,
) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn form<T: DeserializeOwned + Send + 'static>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_FORM_BYTES).and(warp::body::form())
}

async fn respond(handler: impl Future<Output = HandlerResult>) -> Result<Response, Rejection> {
    handler.await.map_err(warp::reject::custom)
}

fn html(body: String) -> Response {
    warp::reply::html(body).into_response()
}

fn see_other(location: &'static str) -> Response {
    warp::redirect::see_other(Uri::from_static(location)).into_response()
}

fn with_cookie(mut response: Response, cookie: String) -> Response {
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}

fn logged_out(response: Response) -> Response {
    with_cookie(response, auth::clear_session_cookie())
}

fn logged_in(ctx: &AppContext, user_id: UserId) -> HandlerResult {
    let token = auth::create_token(user_id, &ctx.config.session_secret, ctx.config.session_ttl)?;
    Ok(with_cookie(
        see_other("/"),
        auth::session_cookie(&token, ctx.config.session_ttl),
    ))
}

/// Redirects home with a one-shot confirmation for the portfolio page.
fn confirmed(ctx: &AppContext, message: String) -> HandlerResult {
    let token = auth::create_flash(&message, &ctx.config.session_secret)?;
    Ok(with_cookie(see_other("/"), auth::flash_cookie(&token)))
}

/// Returns the field when present and non-empty.
fn required(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}

/// Share counts are positive whole numbers written with ASCII digits only.
fn parse_shares(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i64>().ok().filter(|shares| *shares > 0)
}

/// Positive amounts, rounded to the cent.
fn parse_amount(raw: Option<&str>) -> Option<Cents> {
    raw?.trim()
        .parse::<Decimal>()
        .ok()
        .and_then(Cents::from_decimal)
        .filter(|amount| *amount > Cents::ZERO)
}

async fn hash_password(ctx: &AppContext, password: String) -> Result<String, AppError> {
    let cost = ctx.config.bcrypt_cost;
    Ok(tokio::task::spawn_blocking(move || auth::hash_password(&password, cost)).await??)
}

async fn verify_password(password: String, hash: String) -> Result<bool, AppError> {
    Ok(tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash)).await?)
}

async fn index_handler(user: UserId, ctx: AppContext, flash: Option<String>) -> HandlerResult {
    let holdings = ledger::holdings(&ctx.pool, user).await?;
    let cash = ledger::cash(&ctx.pool, user).await?;
    let portfolio = ledger::valuate(holdings, cash, ctx.quotes.as_ref()).await?;

    let message = flash
        .as_deref()
        .and_then(|token| auth::read_flash(token, &ctx.config.session_secret));
    let page = html(views::index(&portfolio, message.as_deref()));
    Ok(match flash {
        Some(_) => with_cookie(page, auth::clear_flash_cookie()),
        None => page,
    })
}

async fn buy_handler(user: UserId, ctx: AppContext, form: TradeForm) -> HandlerResult {
    let symbol = required(form.symbol.map(|s| s.trim().to_string()))
        .ok_or_else(|| apology("must provide symbol"))?;
    if symbol.eq_ignore_ascii_case(DEPOSIT_SYMBOL) {
        return Err(apology("must provide valid symbol"));
    }
    let quote = ctx
        .quotes
        .lookup(&symbol)
        .await
        .ok_or_else(|| apology("must provide valid symbol"))?;
    let shares = parse_shares(form.shares.as_deref())
        .ok_or_else(|| apology("must provide valid number of shares to buy"))?;

    let cost = quote
        .price
        .checked_mul(shares)
        .ok_or(LedgerError::Overflow)?;
    let cash = ledger::buy(&ctx.pool, user, &quote, shares).await?;
    info!(
        "Bought {} share(s) of {} at {} for user {}; cash now {}",
        shares, quote.symbol, quote.price, user, cash
    );
    confirmed(
        &ctx,
        format!(
            "Bought {} shares of {} at {} each, total: {}",
            shares, quote.symbol, quote.price, cost
        ),
    )
}

async fn sell_page_handler(user: UserId, ctx: AppContext) -> HandlerResult {
    let holdings = ledger::holdings(&ctx.pool, user).await?;
    let symbols: Vec<(String, i64)> = holdings
        .into_iter()
        .map(|holding| (holding.symbol, holding.shares))
        .collect();
    Ok(html(views::sell_form(&symbols)))
}

async fn sell_handler(user: UserId, ctx: AppContext, form: TradeForm) -> HandlerResult {
    let symbol = required(form.symbol).ok_or_else(|| apology("missing symbol"))?;
    if symbol.eq_ignore_ascii_case(DEPOSIT_SYMBOL) {
        return Err(apology("can't sell deposits"));
    }
    let shares =
        parse_shares(form.shares.as_deref()).ok_or_else(|| apology("invalid number of shares"))?;

    let owned = ledger::holdings(&ctx.pool, user)
        .await?
        .into_iter()
        .find(|holding| holding.symbol == symbol)
        .map_or(0, |holding| holding.shares);
    if shares > owned {
        return Err(apology("too many shares"));
    }

    let quote = ctx
        .quotes
        .lookup(&symbol)
        .await
        .ok_or_else(|| apology("could not look up the current price"))?;

    let proceeds = quote
        .price
        .checked_mul(shares)
        .ok_or(LedgerError::Overflow)?;
    let cash = ledger::sell(&ctx.pool, user, &symbol, &quote, shares).await?;
    info!(
        "Sold {} share(s) of {} at {} for user {}; cash now {}",
        shares, symbol, quote.price, user, cash
    );
    confirmed(
        &ctx,
        format!(
            "Sold {} shares of {} at {} each, total: +{}",
            shares, symbol, quote.price, proceeds
        ),
    )
}

async fn deposit_handler(user: UserId, ctx: AppContext, form: DepositForm) -> HandlerResult {
    let amount = parse_amount(form.amount.as_deref()).ok_or_else(|| apology("invalid amount"))?;
    let cash = ledger::deposit(&ctx.pool, user, amount).await?;
    info!("Deposited {} for user {}; cash now {}", amount, user, cash);
    confirmed(&ctx, format!("Deposited {} to your account.", amount))
}

async fn history_handler(user: UserId, ctx: AppContext) -> HandlerResult {
    let transactions = ledger::history(&ctx.pool, user).await?;
    Ok(html(views::history(&transactions)))
}

async fn quote_handler(user: UserId, ctx: AppContext, form: SymbolForm) -> HandlerResult {
    let symbol = required(form.symbol.map(|s| s.trim().to_string()))
        .ok_or_else(|| apology("invalid symbol"))?;
    let quote = ctx
        .quotes
        .lookup(&symbol)
        .await
        .ok_or_else(|| apology("invalid symbol"))?;
    let owned = ledger::shares_held(&ctx.pool, user, &quote.symbol).await?;
    Ok(html(views::quoted(&quote, owned)))
}

async fn register_handler(ctx: AppContext, form: CredentialsForm) -> HandlerResult {
    let username = required(form.username.map(|s| s.trim().to_string()))
        .ok_or_else(|| apology("must provide username"))?;
    let password = required(form.password).ok_or_else(|| apology("must provide password"))?;
    let confirmation = required(form.confirmation)
        .ok_or_else(|| apology("must provide password confirmation"))?;
    if password != confirmation {
        return Err(apology("password and confirmation must match"));
    }

    let hash = hash_password(&ctx, password).await?;
    let user_id = db::create_user(&ctx.pool, &username, &hash, ctx.config.starting_cash.0)
        .await?
        .ok_or_else(|| apology("username already taken"))?;

    info!("Registered user {} as {}", username, user_id);
    logged_in(&ctx, user_id)
}

async fn login_handler(ctx: AppContext, form: CredentialsForm) -> HandlerResult {
    let username = required(form.username).ok_or_else(|| forbidden("must provide username"))?;
    let password = required(form.password).ok_or_else(|| forbidden("must provide password"))?;

    let user = db::find_user_by_name(&ctx.pool, &username).await?;
    let verified = match &user {
        Some(user) => verify_password(password, user.hash.clone()).await?,
        None => false,
    };
    let user = match user {
        Some(user) if verified => user,
        _ => {
            info!("Failed login for {}", username);
            return Err(forbidden("invalid username and/or password"));
        }
    };

    info!("User {} logged in as {}", user.username, user.id);
    logged_in(&ctx, user.id)
}

async fn change_password_handler(
    user: UserId,
    ctx: AppContext,
    form: ChangePasswordForm,
) -> HandlerResult {
    let (current, new, confirmation) = match (
        required(form.current),
        required(form.new),
        required(form.confirmation),
    ) {
        (Some(current), Some(new), Some(confirmation)) => (current, new, confirmation),
        _ => return Err(apology("all fields required")),
    };
    if new != confirmation {
        return Err(apology("passwords do not match"));
    }

    let stored = db::find_user(&ctx.pool, user)
        .await?
        .ok_or(AppError::LoginRequired)?;
    if !verify_password(current, stored.hash).await? {
        return Err(apology("invalid current password"));
    }

    let hash = hash_password(&ctx, new).await?;
    db::update_password_hash(&ctx.pool, user, &hash).await?;
    info!("User {} changed their password", user);
    confirmed(&ctx, "Password changed successfully.".to_string())
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (message, status) = if let Some(app_err) = err.find::<AppError>() {
        match app_err {
            AppError::LoginRequired => return Ok(logged_out(see_other("/login"))),
            AppError::Apology { message, status } => (message.clone(), *status),
            other => {
                error!("Request failed: {}", other);
                ("internal server error".to_string(), other.status())
            }
        }
    } else if err.is_not_found() {
        ("not found".to_string(), StatusCode::NOT_FOUND)
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        ("method not allowed".to_string(), StatusCode::METHOD_NOT_ALLOWED)
    } else if err.find::<warp::body::BodyDeserializeError>().is_some()
        || err.find::<warp::reject::UnsupportedMediaType>().is_some()
        || err.find::<warp::reject::PayloadTooLarge>().is_some()
        || err.find::<warp::reject::LengthRequired>().is_some()
    {
        ("malformed form submission".to_string(), StatusCode::BAD_REQUEST)
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            "internal server error".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    };

    let page = views::apology(&message, status.as_u16(), status != StatusCode::FORBIDDEN);
    Ok(warp::reply::with_status(warp::reply::html(page), status).into_response())
}
