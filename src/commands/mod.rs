pub mod command;
pub mod config;
pub mod device;
pub mod process;
pub mod start;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use fleetlink::config::Config;

/// Base URL of the locally running server's REST API.
pub(crate) fn api_base(config: &Config) -> String {
    format!("http://{}", config.server_addr())
}

/// Render a successful JSON response for the terminal.
pub(crate) fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Turn a non-2xx API response into a readable CLI error.
pub(crate) async fn api_error(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<Value>().await {
        Ok(body) => {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            anyhow!("{message} (HTTP {status})")
        }
        Err(_) => anyhow!("request failed with HTTP {status}"),
    }
}

pub(crate) async fn fetch_json(url: &str) -> Result<Value> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("failed to reach FleetLink server at {url}"))?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    response.json().await.context("invalid JSON response")
}
