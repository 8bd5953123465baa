use anyhow::Result;

use berth::config::BerthConfig;
use berth::output;
use berth::service::ServiceAction as RemoteAction;

use crate::cli::context::Core;
use crate::cli::ServiceAction;

pub async fn run(core: &Core, config: &BerthConfig, action: &ServiceAction) -> Result<()> {
    let conn = config.connection_config()?;
    let name = config.service_name();

    match action {
        ServiceAction::Status => {
            let status = core.service.get_service_status(conn, &name).await?;
            output::info(&format!("active={} sub={}", status.active, status.sub));
            if let Some(pid) = status.main_pid {
                output::info(&format!("main pid: {}", pid));
            }
            if let Some(mem) = status.memory_bytes {
                output::info(&format!("memory: {} bytes", mem));
            }
            if status.is_active() {
                output::success("service is active");
            } else {
                output::warning("service is not active");
            }
        }
        ServiceAction::Logs { lines } => {
            let logs = core.service.get_logs(conn, &name, *lines).await?;
            println!("{}", logs);
        }
        ServiceAction::Start => {
            core.service.manage_service(conn, RemoteAction::Start, &name).await?;
            output::success("service started");
        }
        ServiceAction::Stop => {
            core.service.manage_service(conn, RemoteAction::Stop, &name).await?;
            output::success("service stopped");
        }
        ServiceAction::Restart => {
            core.service.manage_service(conn, RemoteAction::Restart, &name).await?;
            output::success("service restarted");
        }
    }

    Ok(())
}
