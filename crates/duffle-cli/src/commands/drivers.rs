//! Drivers command - list built-in drivers and the settings they read

use console::style;
use duffle_driver::DriverRegistry;

use crate::error::Result;

/// Print each built-in driver with its environment settings
pub fn run() -> Result<()> {
    let registry = DriverRegistry::new();
    for name in registry.names() {
        println!("{}", style(name).cyan().bold());
        let driver = registry.lookup(name)?;
        if let Some(configurable) = driver.as_configurable() {
            for (key, description) in configurable.config() {
                println!("  {:<28} {}", key, style(description).dim());
            }
        }
    }
    println!(
        "\nOther names resolve to a {} executable on PATH.",
        style("duffle-<name>").yellow()
    );
    Ok(())
}
