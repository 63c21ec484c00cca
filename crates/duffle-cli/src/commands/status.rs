//! Status command - ask the invocation image for live status

use super::{ActionArgs, Context, prepare};
use crate::error::Result;

/// Run the status command
///
/// The claim is never updated; whatever the invocation image prints is the
/// status report.
pub async fn run(ctx: &Context, name: &str, args: &ActionArgs) -> Result<()> {
    let (lifecycle, request) = prepare(ctx, name, None, args).await?;
    lifecycle.status(request).await?;
    Ok(())
}
