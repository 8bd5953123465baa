//! Package manager detection by probing for known binaries
//! (apt/yum/dnf/pacman/zypper) on the remote host.

use std::time::Duration;

use crate::error::Result;
use crate::executor::{Command, Executor};
use crate::ssh::ConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Yum,
    Dnf,
    Pacman,
    Zypper,
}

impl PackageManager {
    const CANDIDATES: &'static [(&'static str, PackageManager)] = &[
        ("apt-get", PackageManager::Apt),
        ("dnf", PackageManager::Dnf),
        ("yum", PackageManager::Yum),
        ("pacman", PackageManager::Pacman),
        ("zypper", PackageManager::Zypper),
    ];

    /// Probe the remote host for each candidate binary in order and return
    /// the first one found.
    pub async fn detect(executor: &Executor, config: &ConnectionConfig) -> Result<Self> {
        for (binary, pm) in Self::CANDIDATES {
            let cmd = Command::new(format!("command -v {}", binary)).allow_failure();
            let result = executor.run_command(config.clone(), &cmd).await?;
            if result.exit_code == 0 {
                return Ok(*pm);
            }
        }
        Err(crate::error::Error::new(
            crate::error::ErrorKind::InvalidConfig,
            "no supported package manager found (apt/yum/dnf/pacman/zypper)",
        ))
    }

    /// Non-interactive install command for `packages`. "Already installed"
    /// is success for every one of these invocations.
    pub fn install_cmd(&self, packages: &[String]) -> String {
        let list = packages.join(" ");
        match self {
            PackageManager::Apt => format!("DEBIAN_FRONTEND=noninteractive apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {list}"),
            PackageManager::Dnf => format!("dnf install -y -q {list}"),
            PackageManager::Yum => format!("yum install -y -q {list}"),
            PackageManager::Pacman => format!("pacman -Sy --noconfirm {list}"),
            PackageManager::Zypper => format!("zypper --non-interactive install {list}"),
        }
    }

    pub fn install(&self, packages: &[String]) -> Command {
        let mut cmd = Command::new(self.install_cmd(packages)).sudo().with_env("LANG", "C");
        cmd.timeout = Duration::from_secs(300);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apt_install_cmd_is_noninteractive() {
        let cmd = PackageManager::Apt.install_cmd(&["curl".to_string()]);
        assert!(cmd.contains("DEBIAN_FRONTEND=noninteractive"));
        assert!(cmd.contains("curl"));
    }

    #[test]
    fn pacman_install_cmd_skips_confirmation() {
        let cmd = PackageManager::Pacman.install_cmd(&["git".to_string()]);
        assert!(cmd.contains("--noconfirm"));
    }
}
