//! Run command - execute a custom action declared by the bundle

use console::style;
use duffle_action::ActionError;
use duffle_core::claim::RESERVED_ACTIONS;
use std::path::Path;

use super::{ActionArgs, Context, prepare, success};
use crate::error::Result;

/// Run a custom action against `claim`
pub async fn run(
    ctx: &Context,
    action: &str,
    claim: &str,
    bundle_file: Option<&Path>,
    args: &ActionArgs,
) -> Result<()> {
    // Refused before any credential source runs or the store is opened
    if RESERVED_ACTIONS.contains(&action) {
        return Err(ActionError::ReservedAction {
            action: action.to_string(),
        }
        .into());
    }

    let (lifecycle, request) = prepare(ctx, claim, bundle_file, args).await?;
    let updated = lifecycle.run_custom(action, request).await?;

    success(format!(
        "Ran {} on {} (revision {})",
        style(action).cyan(),
        style(&updated.name).cyan(),
        style(&updated.revision).yellow()
    ));
    Ok(())
}
