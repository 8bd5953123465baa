use anyhow::Result;

use berth::config::BerthConfig;
use berth::output;

use crate::cli::context::Core;
use crate::cli::SecurityAction;

pub async fn run(core: &Core, config: &BerthConfig, action: &SecurityAction) -> Result<()> {
    let conn = config.admin_connection_config()?;
    let desired = config.security_config();

    match action {
        SecurityAction::Apply => {
            output::header("applying security configuration");
            core.security.apply(conn, &desired).await?;
            output::success("security configuration applied");
        }
        SecurityAction::Audit => {
            output::header("auditing security configuration");
            let report = core.security.audit(conn, &desired).await?;
            if report.matches_desired() {
                output::success("host matches the desired configuration");
            } else {
                output::warning("host differs from the desired configuration:");
                for diff in &report.differences {
                    output::info(diff);
                }
            }
        }
    }

    Ok(())
}
