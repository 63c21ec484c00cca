//! Install command - run a bundle's install action under a new claim

use console::style;
use std::path::Path;

use super::{ActionArgs, Context, build_request, lifecycle, load_bundle, prepare_driver, success};
use crate::error::{CliError, Result};

/// Run the install command
pub async fn run(ctx: &Context, name: &str, bundle_file: &Path, args: &ActionArgs) -> Result<()> {
    let driver = prepare_driver(&args.driver)?;
    let bundle = load_bundle(bundle_file)?;
    println!(
        "{} Installing bundle {} version {} as {}",
        style("→").blue().bold(),
        style(&bundle.name).cyan(),
        style(&bundle.version).yellow(),
        style(name).cyan()
    );

    let lifecycle = lifecycle(ctx, driver).await?;
    match lifecycle.store().read(name).await {
        Ok(existing) if existing.is_failed_install() => {
            tracing::debug!(claim = name, "previous install failed, installing again");
        }
        Ok(_) => {
            return Err(CliError::AlreadyExists {
                name: name.to_string(),
            });
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let request = build_request(ctx, lifecycle.store(), name, Some(bundle), args).await?;
    let claim = lifecycle.install(request).await?;

    success(format!(
        "Installed {} (revision {})",
        style(&claim.name).cyan(),
        style(&claim.revision).yellow()
    ));
    Ok(())
}
