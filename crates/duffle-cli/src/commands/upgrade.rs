//! Upgrade command - run the upgrade action against an existing claim

use console::style;
use std::path::Path;

use super::{ActionArgs, Context, prepare, success};
use crate::error::Result;

/// Run the upgrade command
pub async fn run(ctx: &Context, name: &str, bundle_file: Option<&Path>, args: &ActionArgs) -> Result<()> {
    let (lifecycle, request) = prepare(ctx, name, bundle_file, args).await?;
    let claim = lifecycle.upgrade(request).await?;

    success(format!(
        "Upgraded {} (revision {})",
        style(&claim.name).cyan(),
        style(&claim.revision).yellow()
    ));
    Ok(())
}
