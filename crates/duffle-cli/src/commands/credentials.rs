//! Credentials commands

use console::style;
use duffle_core::CredentialSet;

use super::Context;
use crate::error::Result;

/// List the credential sets stored in the duffle home
pub fn list(ctx: &Context) -> Result<()> {
    let dir = ctx.home.credentials();
    if !dir.is_dir() {
        println!("No credential sets found in {}", dir.display());
        return Ok(());
    }

    let mut paths: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "yaml" || e == "yml"))
        .collect();
    paths.sort();

    for path in paths {
        match CredentialSet::load(&path) {
            Ok(set) => println!(
                "{} ({} credential(s))",
                style(&set.name).cyan(),
                set.credentials.len()
            ),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable credential set");
            }
        }
    }
    Ok(())
}
