use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use berth::config::BerthConfig;
use berth::deploy::context::{DeployRequest, SuperuserBootstrap};
use berth::deploy::CancelToken;
use berth::model::Version;
use berth::output;

use crate::cli::context::Core;
use crate::cli::DeployAction;

fn version(app_id: berth::model::Id, version_number: &str, artifact: &str) -> Version {
    Version {
        id: Uuid::new_v4(),
        app_id,
        version_number: version_number.to_string(),
        artifact_ref: artifact.to_string(),
        created_at: Utc::now(),
        notes: None,
    }
}

fn request(config: &BerthConfig, bootstrap_email: Option<String>) -> Result<DeployRequest> {
    let bootstrap = match bootstrap_email {
        Some(email) => {
            let password = rpassword::prompt_password("superuser password: ")?;
            Some(SuperuserBootstrap { email, password })
        }
        None => None,
    };
    Ok(DeployRequest {
        bootstrap,
        health_gate_attempts: config.deploy.health_gate_attempts,
        health_gate_interval: Duration::from_secs(config.deploy.health_gate_interval_secs),
    })
}

pub async fn run(core: &Core, config: &BerthConfig, action: &DeployAction) -> Result<()> {
    let server = core.repository.server(core.server_id).expect("server was inserted at bootstrap");
    let app = core.repository.app(core.app_id).expect("app was inserted at bootstrap");

    match action {
        DeployAction::First { version: version_number, artifact, bootstrap_email } => {
            output::header(&format!("deploying {} {} (first deploy)", app.name, version_number));
            let req = request(config, bootstrap_email.clone())?;
            let v = version(app.id, version_number, artifact);
            core.deploy.first_deploy(server, app, v, req, CancelToken::new()).await?;
            output::success("deployed");
        }
        DeployAction::Update { version: version_number, artifact } => {
            output::header(&format!("updating {} to {}", app.name, version_number));
            let req = request(config, None)?;
            let v = version(app.id, version_number, artifact);
            core.deploy.update(server, app, v, req, CancelToken::new()).await?;
            output::success("updated");
        }
        DeployAction::Rollback { version: version_number, artifact } => {
            output::header(&format!("rolling {} back to {}", app.name, version_number));
            let req = request(config, None)?;
            let v = version(app.id, version_number, artifact);
            core.deploy.rollback(server, app, v, req, CancelToken::new()).await?;
            output::success("rolled back");
        }
    }

    Ok(())
}
