use anyhow::{bail, Result};

use super::{AuthConfig, BerthConfig};

pub fn validate(config: &BerthConfig) -> Result<()> {
    if config.server.host.trim().is_empty() {
        bail!("server.host cannot be empty");
    }
    if config.server.port == 0 {
        bail!("server.port must be between 1 and 65535");
    }
    if config.server.app_user.trim().is_empty() {
        bail!("server.app_user cannot be empty");
    }
    if let AuthConfig::Key { private_key_path, .. } = &config.server.auth {
        if private_key_path.trim().is_empty() {
            bail!("server.auth.private_key_path cannot be empty when auth kind is 'key'");
        }
    }
    if let AuthConfig::Password { password } = &config.server.auth {
        if password.is_empty() {
            bail!("server.auth.password cannot be empty when auth kind is 'password'");
        }
    }

    if config.app.name.trim().is_empty() {
        bail!("app.name cannot be empty");
    }
    if config.app.domain.trim().is_empty() {
        bail!("app.domain cannot be empty");
    }

    for rule in &config.security.firewall {
        if rule.port == 0 {
            bail!("security.firewall rule has an invalid port 0");
        }
        if !rule.protocol.eq_ignore_ascii_case("tcp") && !rule.protocol.eq_ignore_ascii_case("udp") {
            bail!("security.firewall rule has invalid protocol '{}'. Supported: tcp, udp", rule.protocol);
        }
    }

    if config.security.ssh.max_auth_tries == 0 {
        bail!("security.ssh.max_auth_tries must be at least 1");
    }

    if config.deploy.health_gate_attempts == 0 {
        bail!("deploy.health_gate_attempts must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, DeployToml, SecurityToml, ServerConfig};

    fn base_config() -> BerthConfig {
        BerthConfig {
            server: ServerConfig {
                host: "example.com".to_string(),
                port: 22,
                root_user: "root".to_string(),
                app_user: "deploy".to_string(),
                auth: AuthConfig::Agent,
                admin_ssh_port: None,
            },
            app: AppConfig {
                name: "notes".to_string(),
                domain: "notes.example.com".to_string(),
                remote_path: None,
                service_name: None,
                packages: Vec::new(),
                sudoers_whitelist: Vec::new(),
            },
            security: SecurityToml::default(),
            deploy: DeployToml::default(),
        }
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn rejects_empty_host() {
        let mut cfg = base_config();
        cfg.server.host = "  ".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_key_auth_without_a_key_path() {
        let mut cfg = base_config();
        cfg.server.auth = AuthConfig::Key { private_key_path: String::new(), passphrase: None };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_unsupported_firewall_protocol() {
        let mut cfg = base_config();
        cfg.security.firewall.push(crate::config::FirewallRuleToml { port: 443, protocol: "sctp".to_string(), from: Vec::new() });
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_health_gate_attempts() {
        let mut cfg = base_config();
        cfg.deploy.health_gate_attempts = 0;
        assert!(validate(&cfg).is_err());
    }
}
