//! Claims commands - inspect stored installations

use console::style;

use super::Context;
use crate::error::{CliError, Result};

/// List installation names with the outcome of their last action
pub async fn list(ctx: &Context) -> Result<()> {
    let store = ctx.store().await?;
    let mut names = store.list().await?;
    names.sort();

    if names.is_empty() {
        println!("No claims found");
        return Ok(());
    }

    println!(
        "{:<30} {:<12} {:<12} {}",
        style("NAME").bold(),
        style("ACTION").bold(),
        style("STATUS").bold(),
        style("MODIFIED").bold()
    );
    for name in names {
        let claim = store.read(&name).await?;
        let status = claim.result.status.to_string();
        let status = match status.as_str() {
            "success" => style(status).green(),
            "failure" => style(status).red(),
            _ => style(status).dim(),
        };
        println!(
            "{:<30} {:<12} {:<12} {}",
            claim.name,
            claim.result.action,
            status,
            claim.modified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Print one claim as JSON
pub async fn show(ctx: &Context, name: &str) -> Result<()> {
    let store = ctx.store().await?;
    let claim = store.read(name).await?;
    let json = serde_json::to_string_pretty(&claim).map_err(|e| CliError::Other {
        message: e.to_string(),
    })?;
    println!("{json}");
    Ok(())
}
