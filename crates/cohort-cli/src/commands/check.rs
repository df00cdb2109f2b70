//! check command - validate and print the effective configuration

use anyhow::Result;
use cohort_core::CohortConfig;

pub fn execute(config: &CohortConfig) -> Result<()> {
    println!("# configuration is valid");
    println!(
        "# {} members, {} transport",
        config.cluster.members.len(),
        config.cluster.transport
    );
    print!("{}", config.to_toml()?);
    Ok(())
}
