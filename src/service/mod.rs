//! C8 — systemd unit generation, lifecycle actions, status, logs.
//!
//! Transient dbus errors (`systemctl`'s `org.freedesktop.DBus.Error.*`
//! surfaced via stderr) are retried once; permission errors are surfaced
//! immediately since a retry cannot fix them.

use std::time::Duration;

use minijinja::Environment;
use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::{Command, Executor};
use crate::ssh::ConnectionConfig;
use crate::tracer::{Field, SpanStatus, Tracer};

const UNIT_TEMPLATE: &str = r#"[Unit]
Description={{ description }}
After=network.target

[Service]
Type=simple
User={{ app_user }}
Group={{ app_user }}
WorkingDirectory={{ app_root }}
ExecStart={{ app_root }}/binary serve {{ domain }}
Restart=always
RestartSec=5s
LimitNOFILE=4096
StandardOutput=append:{{ app_root }}/logs/std.log
StandardError=append:{{ app_root }}/logs/std.log

[Install]
WantedBy=multi-user.target
"#;

#[derive(Debug, Clone, Serialize)]
pub struct UnitConfig {
    pub description: String,
    pub app_user: String,
    pub app_root: String,
    pub domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
}

impl ServiceAction {
    fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub active: String,
    pub sub: String,
    pub since: Option<String>,
    pub main_pid: Option<u32>,
    pub memory_bytes: Option<u64>,
}

impl ServiceStatus {
    pub fn is_active(&self) -> bool {
        self.active == "active"
    }

    fn parse(show_output: &str) -> Self {
        let mut active = String::new();
        let mut sub = String::new();
        let mut since = None;
        let mut main_pid = None;
        let mut memory_bytes = None;

        for line in show_output.lines() {
            let Some((key, value)) = line.split_once('=') else { continue };
            match key {
                "ActiveState" => active = value.to_string(),
                "SubState" => sub = value.to_string(),
                "ActiveEnterTimestamp" if !value.is_empty() => since = Some(value.to_string()),
                "MainPID" => main_pid = value.parse().ok().filter(|p| *p != 0),
                "MemoryCurrent" => memory_bytes = value.parse().ok().filter(|m| *m != u64::MAX),
                _ => {}
            }
        }

        Self { active, sub, since, main_pid, memory_bytes }
    }
}

pub struct ServiceManager {
    executor: Executor,
    tracer: Tracer,
}

impl ServiceManager {
    pub fn new(executor: Executor, tracer: Tracer) -> Self {
        Self {
            executor,
            tracer: tracer.scoped("service"),
        }
    }

    pub fn render_unit(&self, config: &UnitConfig) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("unit", UNIT_TEMPLATE)
            .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to load unit template", e))?;
        let tmpl = env.get_template("unit").expect("just added");
        tmpl.render(minijinja::context! {
            description => &config.description,
            app_user => &config.app_user,
            app_root => &config.app_root,
            domain => &config.domain,
        })
        .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to render unit template", e))
    }

    /// Writes `/etc/systemd/system/<name>.service` and runs `daemon-reload`.
    pub async fn create_service_file(&self, conn: ConnectionConfig, name: &str, config: &UnitConfig) -> Result<()> {
        let span = self.tracer.start("create_service_file");
        span.set("name", Field::Str(name.to_string()));

        let rendered = self.render_unit(config)?;
        let unit_path = format!("/etc/systemd/system/{}.service", name);
        let write = write_file_command(&unit_path, &rendered, true);
        let result = self.run_with_retry(conn.clone(), &write).await;
        if result.is_err() {
            span.end(SpanStatus::Error);
            return result.map(|_| ());
        }

        let reload = Command::new("systemctl daemon-reload").sudo();
        let result = self.run_with_retry(conn, &reload).await;
        span.end(if result.is_ok() { SpanStatus::Ok } else { SpanStatus::Error });
        result.map(|_| ())
    }

    /// Runs `action` on `name` and returns the resulting [`ServiceStatus`].
    pub async fn manage_service(&self, conn: ConnectionConfig, action: ServiceAction, name: &str) -> Result<ServiceStatus> {
        let span = self.tracer.start("manage_service");
        span.set("action", Field::Str(action.as_str().to_string()));
        span.set("name", Field::Str(name.to_string()));

        let cmd = Command::new(format!("systemctl {} {}", action.as_str(), name)).sudo();
        if let Err(e) = self.run_with_retry(conn.clone(), &cmd).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }

        let status = self.get_service_status(conn, name).await;
        span.end(if status.is_ok() { SpanStatus::Ok } else { SpanStatus::Error });
        status
    }

    pub async fn get_service_status(&self, conn: ConnectionConfig, name: &str) -> Result<ServiceStatus> {
        let cmd = Command::new(format!(
            "systemctl show {} --property=ActiveState,SubState,ActiveEnterTimestamp,MainPID,MemoryCurrent",
            name
        ));
        let result = self.executor.run_command(conn, &cmd).await?;
        Ok(ServiceStatus::parse(&result.stdout))
    }

    pub async fn get_logs(&self, conn: ConnectionConfig, name: &str, lines: u32) -> Result<String> {
        let cmd = Command::new(format!("journalctl -u {} -n {} --no-pager", name, lines)).sudo();
        let result = self.executor.run_command(conn, &cmd).await?;
        Ok(result.stdout)
    }

    /// Polls `GetServiceStatus` every 2 s until `active` matches `desired`
    /// or `timeout` elapses.
    pub async fn wait_for_service(&self, conn: ConnectionConfig, name: &str, desired: &str, timeout: Duration) -> Result<ServiceStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.get_service_status(conn.clone(), name).await?;
            if status.active == desired {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("service {} did not reach state '{}' within {:?}", name, desired, timeout),
                ));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn run_with_retry(&self, conn: ConnectionConfig, cmd: &Command) -> Result<crate::executor::CommandResult> {
        match self.executor.run_command(conn.clone(), cmd).await {
            Ok(r) => Ok(r),
            Err(e) if is_transient_dbus_error(&e) => self.executor.run_command(conn, cmd).await,
            Err(e) => Err(e),
        }
    }
}

fn is_transient_dbus_error(e: &Error) -> bool {
    let msg = e.to_string();
    msg.contains("org.freedesktop.DBus.Error.NoReply") || msg.contains("org.freedesktop.DBus.Error.Timeout")
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
    fn renders_unit_with_expected_fields() {
        let config = UnitConfig {
            description: "notes app".to_string(),
            app_user: "notes".to_string(),
            app_root: "/opt/pb/apps/notes".to_string(),
            domain: "notes.example.com".to_string(),
        };
        let mut env = Environment::new();
        env.add_template("unit", UNIT_TEMPLATE).unwrap();
        let rendered = env
            .get_template("unit")
            .unwrap()
            .render(minijinja::context! {
                description => &config.description,
                app_user => &config.app_user,
                app_root => &config.app_root,
                domain => &config.domain,
            })
            .unwrap();
        assert!(rendered.contains("User=notes"));
        assert!(rendered.contains("ExecStart=/opt/pb/apps/notes/binary serve notes.example.com"));
        assert!(rendered.contains("Restart=always"));
    }

    #[test]
    fn service_status_parses_systemctl_show_output() {
        let output = "ActiveState=active\nSubState=running\nActiveEnterTimestamp=Mon 2026-07-20 10:00:00 UTC\nMainPID=4821\nMemoryCurrent=10485760\n";
        let status = ServiceStatus::parse(output);
        assert!(status.is_active());
        assert_eq!(status.sub, "running");
        assert_eq!(status.main_pid, Some(4821));
        assert_eq!(status.memory_bytes, Some(10485760));
    }

    #[test]
    fn service_status_treats_max_memory_as_unset() {
        let output = "ActiveState=inactive\nSubState=dead\nMainPID=0\nMemoryCurrent=18446744073709551615\n";
        let status = ServiceStatus::parse(output);
        assert!(!status.is_active());
        assert_eq!(status.main_pid, None);
        assert_eq!(status.memory_bytes, None);
    }
}
