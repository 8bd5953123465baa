use anyhow::{Context, Result};

use berth::config::BerthConfig;
use berth::output;

use crate::cli::context::Core;

pub async fn run(core: &Core, config: &BerthConfig, authorized_key_paths: &[std::path::PathBuf]) -> Result<()> {
    let conn = config.admin_connection_config()?;

    let mut authorized_keys = Vec::with_capacity(authorized_key_paths.len());
    for path in authorized_key_paths {
        let key = std::fs::read_to_string(path).with_context(|| format!("failed to read public key at {}", path.display()))?;
        authorized_keys.push(key.trim().to_string());
    }

    let request = config.setup_request(authorized_keys);

    output::header(&format!("provisioning {} on {}", request.app_user, config.server.host));
    core.setup.run(conn, &request).await?;
    output::success("host provisioned");

    Ok(())
}
