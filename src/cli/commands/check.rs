//! Store connectivity CLI command

use std::path::PathBuf;

use crate::cli::commands::{block_on, load_config};
use crate::cli::error::CliError;
use crate::store::StoreRole;

/// Check command arguments
#[derive(Debug, Clone)]
pub struct CheckArgs {
    pub config: Option<PathBuf>,
}

/// Open each configured store and run its health check
pub fn handle_check(args: &CheckArgs) -> Result<(), CliError> {
    let config = load_config(args.config.as_deref())?;

    block_on(async {
        for role in [StoreRole::Source, StoreRole::Staging, StoreRole::Warehouse] {
            let section = config.store(role);
            let store = section.open(role).await?;
            if !store.health_check().await.map_err(crate::error::EtlError::from)? {
                return Err(CliError::Unhealthy(role.to_string()));
            }
            println!("{:<10} ok  {}", role, section);
        }
        Ok(())
    })?
}
