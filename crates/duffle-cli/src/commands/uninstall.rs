//! Uninstall command - run the uninstall action and remove the claim

use console::style;
use std::path::Path;

use super::{ActionArgs, Context, prepare, success};
use crate::error::Result;

/// Run the uninstall command
pub async fn run(ctx: &Context, name: &str, bundle_file: Option<&Path>, args: &ActionArgs) -> Result<()> {
    let (lifecycle, request) = prepare(ctx, name, bundle_file, args).await?;
    lifecycle.uninstall(request).await?;

    success(format!("Uninstalled {}", style(name).cyan()));
    Ok(())
}
