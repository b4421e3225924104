// src/views.rs
//! Server-rendered HTML pages.

use crate::models::{Cents, Portfolio, Quote, TransactionKind, TransactionRecord};
use std::fmt::Write;

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wraps `main` in the page chrome. A flash message is shown above the content.
fn layout(title: &str, logged_in: bool, flash: Option<&str>, main: &str) -> String {
    let nav = if logged_in {
        r#"<a href="/quote">Quote</a> <a href="/buy">Buy</a> <a href="/sell">Sell</a>
<a href="/deposit">Deposit</a> <a href="/history">History</a>
<a href="/change-password">Change password</a> <a href="/logout">Log out</a>"#
    } else {
        r#"<a href="/register">Register</a> <a href="/login">Log in</a>"#
    };
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Paper Trader: {title}</title></head>
<body>
<nav><a href="/">Paper Trader</a> {nav}</nav>
{flash}<main>
{main}
</main>
</body>
</html>"#,
        title = escape(title),
        nav = nav,
        flash = flash
            .map(|message| format!("<div class=\"flash\">{}</div>\n", escape(message)))
            .unwrap_or_default(),
        main = main,
    )
}

pub fn apology(message: &str, code: u16, logged_in: bool) -> String {
    layout(
        "Apology",
        logged_in,
        None,
        &format!(
            r#"<h1 class="apology">{}</h1><p>{}</p>"#,
            code,
            escape(message)
        ),
    )
}

pub fn index(portfolio: &Portfolio, flash: Option<&str>) -> String {
    let mut rows = String::new();
    for row in &portfolio.rows {
        let _ = writeln!(
            rows,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&row.symbol),
            escape(&row.name),
            row.shares,
            row.price,
            row.total
        );
    }
    layout(
        "Portfolio",
        true,
        flash,
        &format!(
            r#"<table>
<thead><tr><th>Symbol</th><th>Name</th><th>Shares</th><th>Price</th><th>TOTAL</th></tr></thead>
<tbody>
{rows}</tbody>
<tfoot>
<tr><td colspan="4">Cash</td><td id="cash">{cash}</td></tr>
<tr><td colspan="4">Stocks</td><td id="holdings">{holdings}</td></tr>
<tr><td colspan="4">TOTAL</td><td id="total">{total}</td></tr>
</tfoot>
</table>"#,
            rows = rows,
            cash = portfolio.cash,
            holdings = portfolio.holdings_value,
            total = portfolio.grand_total,
        ),
    )
}

fn form(action: &str, fields: &str, button: &str) -> String {
    format!(
        r#"<form action="{}" method="post">
{}
<button type="submit">{}</button>
</form>"#,
        action, fields, button
    )
}

pub fn buy_form() -> String {
    layout(
        "Buy",
        true,
        None,
        &form(
            "/buy",
            r#"<input autocomplete="off" autofocus name="symbol" placeholder="Symbol" type="text">
<input min="1" name="shares" placeholder="Shares" type="number">"#,
            "Buy",
        ),
    )
}

/// Sell form offering only the symbols currently held.
pub fn sell_form(symbols: &[(String, i64)]) -> String {
    let mut options = String::from(r#"<option disabled selected value="">Symbol</option>"#);
    for (symbol, shares) in symbols {
        let _ = write!(
            options,
            r#"<option value="{0}">{0} ({1})</option>"#,
            escape(symbol),
            shares
        );
    }
    layout(
        "Sell",
        true,
        None,
        &form(
            "/sell",
            &format!(
                r#"<select name="symbol">{}</select>
<input min="1" name="shares" placeholder="Shares" type="number">"#,
                options
            ),
            "Sell",
        ),
    )
}

pub fn deposit_form() -> String {
    layout(
        "Deposit",
        true,
        None,
        &form(
            "/deposit",
            r#"<input autofocus min="0.01" name="amount" placeholder="Amount" step="0.01" type="number">"#,
            "Deposit",
        ),
    )
}

pub fn quote_form() -> String {
    layout(
        "Quote",
        true,
        None,
        &form(
            "/quote",
            r#"<input autocomplete="off" autofocus name="symbol" placeholder="Symbol" type="text">"#,
            "Quote",
        ),
    )
}

pub fn quoted(quote: &Quote, shares_owned: i64) -> String {
    layout(
        "Quoted",
        true,
        None,
        &format!(
            r#"<p>A share of {} ({}) costs <span id="price">{}</span>.</p>
<p>You own <span id="owned">{}</span> shares.</p>"#,
            escape(&quote.name),
            escape(&quote.symbol),
            quote.price,
            shares_owned
        ),
    )
}

pub fn history(transactions: &[TransactionRecord]) -> String {
    let mut rows = String::new();
    for t in transactions {
        let _ = writeln!(
            rows,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            t.kind,
            escape(&t.symbol),
            if t.kind == TransactionKind::Deposit { String::new() } else { t.shares.to_string() },
            Cents(t.price),
            t.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    layout(
        "History",
        true,
        None,
        &format!(
            r#"<table>
<thead><tr><th>Type</th><th>Symbol</th><th>Shares</th><th>Price</th><th>Transacted</th></tr></thead>
<tbody>
{}</tbody>
</table>"#,
            rows
        ),
    )
}

pub fn login_form() -> String {
    layout(
        "Log In",
        false,
        None,
        &form(
            "/login",
            r#"<input autocomplete="off" autofocus name="username" placeholder="Username" type="text">
<input name="password" placeholder="Password" type="password">"#,
            "Log In",
        ),
    )
}

pub fn register_form() -> String {
    layout(
        "Register",
        false,
        None,
        &form(
            "/register",
            r#"<input autocomplete="off" autofocus name="username" placeholder="Username" type="text">
<input name="password" placeholder="Password" type="password">
<input name="confirmation" placeholder="Confirm password" type="password">"#,
            "Register",
        ),
    )
}

pub fn change_password_form() -> String {
    layout(
        "Change Password",
        true,
        None,
        &form(
            "/change-password",
            r#"<input name="current" placeholder="Current password" type="password">
<input name="new" placeholder="New password" type="password">
<input name="confirmation" placeholder="Confirm new password" type="password">"#,
            "Change password",
        ),
    )
}
