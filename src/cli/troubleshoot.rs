use anyhow::Result;

use berth::troubleshoot::DiagnosticStatus;

use crate::cli::context::Core;
use berth::config::BerthConfig;
use berth::output;

pub async fn run(core: &Core, config: &BerthConfig) -> Result<()> {
    output::header(&format!("troubleshooting {}:{}", config.server.host, config.server.port));

    let conn = config.connection_config()?;
    let results = core.troubleshoot.run_all(&conn).await;

    let mut worst = DiagnosticStatus::Ok;
    for result in &results {
        output::diagnostic(result);
        if matches!(result.status, DiagnosticStatus::Failed) {
            worst = DiagnosticStatus::Failed;
        } else if matches!(result.status, DiagnosticStatus::Warning) && matches!(worst, DiagnosticStatus::Ok) {
            worst = DiagnosticStatus::Warning;
        }
    }

    match worst {
        DiagnosticStatus::Ok => output::success("all checks passed"),
        DiagnosticStatus::Warning => output::warning("checks passed with warnings"),
        DiagnosticStatus::Failed => {
            output::error("one or more checks failed");
            std::process::exit(1);
        }
    }

    Ok(())
}
