//! small helpers for reading configuration out of the environment

use anyhow::Context;

use std::{env, str};

/// Read `name` from the environment, falling back to `default`, and parse
/// the result into the target type.
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
}

/// Like [`parse_var`], with the variable name attached to any parse error.
///
/// [`parse_var`]: crate::env::parse_var
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString + Send,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}
