//! C7 — firewall, fail2ban, SSH daemon hardening, unattended upgrades.
//!
//! Applied in a fixed order: firewall first (with a lockout guard), then
//! fail2ban, then sshd, then unattended upgrades last. Applying the same
//! [`SecurityConfig`] twice is a no-op the second time through; every step
//! checks current state before mutating.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::{Command, Executor};
use crate::model::{Id, ProgressEvent, ProgressStatus};
use crate::progress::ProgressBus;
use crate::ssh::ConnectionConfig;
use crate::tracer::{Field, SpanStatus, Tracer};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirewallRule {
    pub port: u16,
    pub protocol: Protocol,
    /// CIDRs allowed to reach `port`; empty means "anywhere".
    pub from: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SshHardening {
    pub disable_root_login: bool,
    pub disable_password_auth: bool,
    pub max_auth_tries: u8,
    pub client_alive_interval: u32,
    pub allow_users: Vec<String>,
    pub allow_groups: Vec<String>,
}

impl Default for SshHardening {
    fn default() -> Self {
        Self {
            disable_root_login: true,
            disable_password_auth: true,
            max_auth_tries: 3,
            client_alive_interval: 300,
            allow_users: Vec::new(),
            allow_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub firewall: Vec<FirewallRule>,
    pub ssh: SshHardening,
    pub fail2ban_enabled: bool,
    pub unattended_upgrades: bool,
    /// The port the current administering session is reaching the host on.
    /// Firewall application refuses to proceed if this port would end up
    /// unreachable.
    pub admin_ssh_port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityReport {
    pub firewall_active: bool,
    pub firewall_rules: Vec<String>,
    pub fail2ban_active: bool,
    pub sshd_hardened: bool,
    pub unattended_upgrades_active: bool,
    pub differences: Vec<String>,
}

impl SecurityReport {
    pub fn matches_desired(&self) -> bool {
        self.differences.is_empty()
    }
}

const STEP_NAMES: [&str; 4] = ["firewall", "fail2ban", "sshd-hardening", "unattended-upgrades"];

pub struct SecurityManager {
    executor: Executor,
    progress: ProgressBus,
    tracer: Tracer,
}

impl SecurityManager {
    pub fn new(executor: Executor, progress: ProgressBus, tracer: Tracer) -> Self {
        Self {
            executor,
            progress,
            tracer: tracer.scoped("security"),
        }
    }

    fn emit(&self, run_id: Id, step: &str, status: ProgressStatus, percent: u8, message: impl Into<String>) {
        self.progress.publish(ProgressEvent {
            deployment_id: run_id,
            step: step.to_string(),
            status,
            message: message.into(),
            percent,
            error: None,
            at: chrono::Utc::now(),
        });
    }

    fn emit_failed(&self, run_id: Id, step: &str, percent: u8, err: &Error) {
        self.progress.publish(ProgressEvent {
            deployment_id: run_id,
            step: step.to_string(),
            status: ProgressStatus::Failed,
            message: format!("{} failed", step),
            percent,
            error: Some(err.to_string()),
            at: chrono::Utc::now(),
        });
    }

    pub async fn apply(&self, config: ConnectionConfig, security: &SecurityConfig) -> Result<Id> {
        let run_id = Uuid::new_v4();
        let span = self.tracer.start("apply");
        let total = STEP_NAMES.len() as u8;
        let pct = |i: usize| ((i as u8 + 1) * 100 / total).min(100);

        if let Err(e) = self.apply_firewall(run_id, pct(0), &config, security).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }
        if security.fail2ban_enabled {
            if let Err(e) = self.apply_fail2ban(run_id, pct(1), &config).await {
                span.end(SpanStatus::Error);
                return Err(e);
            }
        } else {
            self.emit(run_id, STEP_NAMES[1], ProgressStatus::Ok, pct(1), "fail2ban not requested");
        }
        if let Err(e) = self.apply_sshd(run_id, pct(2), &config, &security.ssh).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }
        if let Err(e) = self.apply_unattended_upgrades(run_id, pct(3), &config, security.unattended_upgrades).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }

        span.end(SpanStatus::Ok);
        self.progress.retire(run_id);
        Ok(run_id)
    }

    /// Refuses to apply a default-deny firewall unless the administering
    /// session's port is explicitly allowed; this is the lockout guard.
    async fn apply_firewall(&self, run_id: Id, pct: u8, config: &ConnectionConfig, security: &SecurityConfig) -> Result<()> {
        let step = STEP_NAMES[0];
        self.emit(run_id, step, ProgressStatus::Running, pct, "applying firewall rules");

        let admin_port_allowed = security
            .firewall
            .iter()
            .any(|r| r.port == security.admin_ssh_port && r.protocol == Protocol::Tcp);
        if !admin_port_allowed {
            let e = Error::new(
                ErrorKind::WouldLockout,
                format!(
                    "firewall ruleset does not allow the administering session's port {} — refusing to apply",
                    security.admin_ssh_port
                ),
            );
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let install = Command::new("command -v ufw || (DEBIAN_FRONTEND=noninteractive apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq ufw)").sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &install).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let mut script = vec!["ufw --force reset".to_string(), "ufw default deny incoming".to_string(), "ufw default allow outgoing".to_string()];
        for rule in &security.firewall {
            if rule.from.is_empty() {
                script.push(format!("ufw allow {}/{}", rule.port, rule.protocol.as_str()));
            } else {
                for cidr in &rule.from {
                    script.push(format!("ufw allow from {} to any port {} proto {}", cidr, rule.port, rule.protocol.as_str()));
                }
            }
        }
        script.push("ufw --force enable".to_string());

        let cmd = Command::new(script.join(" && ")).sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &cmd).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        self.emit(run_id, step, ProgressStatus::Ok, pct, "firewall active");
        Ok(())
    }

    async fn apply_fail2ban(&self, run_id: Id, pct: u8, config: &ConnectionConfig) -> Result<()> {
        let step = STEP_NAMES[1];
        self.emit(run_id, step, ProgressStatus::Running, pct, "configuring fail2ban");

        let install = Command::new("command -v fail2ban-client || (DEBIAN_FRONTEND=noninteractive apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq fail2ban)").sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &install).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let jail_local = "[sshd]\nenabled = true\nbackend = systemd\n";
        let write = write_file_command("/etc/fail2ban/jail.d/sshd.local", jail_local, true);
        if let Err(e) = self.executor.run_command(config.clone(), &write).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let enable = Command::new("systemctl enable --now fail2ban && systemctl reload fail2ban").sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &enable).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let verify = Command::new("fail2ban-client status sshd").sudo().allow_failure();
        let result = self.executor.run_command(config.clone(), &verify).await?;
        if result.exit_code != 0 {
            let e = Error::new(ErrorKind::Remote, "fail2ban sshd jail not active after configuration");
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        self.emit(run_id, step, ProgressStatus::Ok, pct, "fail2ban active");
        Ok(())
    }

    /// Writes a new sshd_config atomically: backup original, write new,
    /// validate with `sshd -t`, restore on failure, reload (not restart)
    /// on success so the current session survives.
    async fn apply_sshd(&self, run_id: Id, pct: u8, config: &ConnectionConfig, ssh: &SshHardening) -> Result<()> {
        let step = STEP_NAMES[2];
        self.emit(run_id, step, ProgressStatus::Running, pct, "hardening sshd");

        let ts_cmd = Command::new("date +%s").allow_failure();
        let ts_result = self.executor.run_command(config.clone(), &ts_cmd).await?;
        let ts = ts_result.stdout.trim().to_string();
        let backup_path = format!("/etc/ssh/sshd_config.bak.{}", ts);

        let backup = Command::new(format!("cp /etc/ssh/sshd_config {}", backup_path)).sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &backup).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let mut directives = vec!["Include /etc/ssh/sshd_config.d/*.conf".to_string()];
        directives.push(format!("PermitRootLogin {}", if ssh.disable_root_login { "no" } else { "yes" }));
        directives.push(format!("PasswordAuthentication {}", if ssh.disable_password_auth { "no" } else { "yes" }));
        directives.push(format!("MaxAuthTries {}", ssh.max_auth_tries));
        directives.push(format!("ClientAliveInterval {}", ssh.client_alive_interval));
        if !ssh.allow_users.is_empty() {
            directives.push(format!("AllowUsers {}", ssh.allow_users.join(" ")));
        }
        if !ssh.allow_groups.is_empty() {
            directives.push(format!("AllowGroups {}", ssh.allow_groups.join(" ")));
        }
        let new_config = directives.join("\n");

        let write = write_file_command("/etc/ssh/sshd_config", &new_config, true);
        if let Err(e) = self.executor.run_command(config.clone(), &write).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let validate = Command::new("sshd -t").sudo().allow_failure();
        let check = self.executor.run_command(config.clone(), &validate).await?;
        if check.exit_code != 0 {
            let restore = Command::new(format!("cp {} /etc/ssh/sshd_config", backup_path)).sudo();
            let _ = self.executor.run_command(config.clone(), &restore).await;
            let e = Error::new(ErrorKind::InvalidConfig, format!("sshd -t rejected new config: {}", check.stderr));
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let reload = Command::new("systemctl reload sshd || systemctl reload ssh").sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &reload).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        self.emit(run_id, step, ProgressStatus::Ok, pct, "sshd hardened");
        Ok(())
    }

    async fn apply_unattended_upgrades(&self, run_id: Id, pct: u8, config: &ConnectionConfig, enabled: bool) -> Result<()> {
        let step = STEP_NAMES[3];
        if !enabled {
            self.emit(run_id, step, ProgressStatus::Ok, pct, "unattended-upgrades not requested");
            return Ok(());
        }
        self.emit(run_id, step, ProgressStatus::Running, pct, "enabling unattended upgrades");

        let install = Command::new("command -v unattended-upgrade || (DEBIAN_FRONTEND=noninteractive apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq unattended-upgrades)").sudo().with_env("LANG", "C");
        if let Err(e) = self.executor.run_command(config.clone(), &install).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let content = "APT::Periodic::Update-Package-Lists \"1\";\nAPT::Periodic::Unattended-Upgrade \"1\";\n";
        let write = write_file_command("/etc/apt/apt.conf.d/20auto-upgrades", content, true);
        if let Err(e) = self.executor.run_command(config.clone(), &write).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        self.emit(run_id, step, ProgressStatus::Ok, pct, "unattended upgrades enabled");
        Ok(())
    }

    /// Read-only comparison of realized state against `desired`. Never
    /// mutates the host.
    pub async fn audit(&self, config: ConnectionConfig, desired: &SecurityConfig) -> Result<SecurityReport> {
        let mut report = SecurityReport::default();

        let ufw_status = Command::new("ufw status verbose").sudo().allow_failure();
        let ufw = self.executor.run_command(config.clone(), &ufw_status).await?;
        report.firewall_active = ufw.stdout.contains("Status: active");
        report.firewall_rules = ufw.stdout.lines().map(str::to_string).collect();
        if !report.firewall_active {
            report.differences.push("firewall not active".to_string());
        } else {
            let desired_ports: BTreeSet<u16> = desired.firewall.iter().map(|r| r.port).collect();
            for port in desired_ports {
                if !ufw.stdout.contains(&port.to_string()) {
                    report.differences.push(format!("port {} not found in active firewall rules", port));
                }
            }
        }

        let f2b = Command::new("fail2ban-client status sshd").sudo().allow_failure();
        let f2b_result = self.executor.run_command(config.clone(), &f2b).await?;
        report.fail2ban_active = f2b_result.exit_code == 0;
        if desired.fail2ban_enabled && !report.fail2ban_active {
            report.differences.push("fail2ban sshd jail not active".to_string());
        }

        let sshd_check = Command::new("sshd -T").sudo().allow_failure();
        let sshd_result = self.executor.run_command(config.clone(), &sshd_check).await?;
        let lower = sshd_result.stdout.to_lowercase();
        let root_login_disabled = lower.contains("permitrootlogin no");
        let password_auth_disabled = lower.contains("passwordauthentication no");
        report.sshd_hardened = root_login_disabled == desired.ssh.disable_root_login
            && password_auth_disabled == desired.ssh.disable_password_auth;
        if !report.sshd_hardened {
            report.differences.push("sshd hardening settings do not match desired config".to_string());
        }

        let uu_check = Command::new("test -f /etc/apt/apt.conf.d/20auto-upgrades").allow_failure();
        let uu_result = self.executor.run_command(config.clone(), &uu_check).await?;
        report.unattended_upgrades_active = uu_result.exit_code == 0;
        if desired.unattended_upgrades && !report.unattended_upgrades_active {
            report.differences.push("unattended-upgrades not configured".to_string());
        }

        Ok(report)
    }
}

fn write_file_command(remote_path: &str, content: &str, sudo: bool) -> Command {
    let marker = "BERTH_WRITE_EOF";
    let script = format!("cat > {} << '{marker}'\n{}\n{marker}", shell_quote(remote_path), content);
    let mut cmd = Command::new(script);
    if sudo {
        cmd = cmd.sudo();
    }
    cmd.timeout = Duration::from_secs(30);
    cmd
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_with_no_differences_matches_desired() {
        let report = SecurityReport::default();
        assert!(report.matches_desired());
    }

    #[test]
    fn report_with_differences_does_not_match() {
        let mut report = SecurityReport::default();
        report.differences.push("firewall not active".to_string());
        assert!(!report.matches_desired());
    }
}
