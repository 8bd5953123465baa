use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::model::{ProgressEvent, ProgressStatus};
use crate::troubleshoot::{DiagnosticResult, DiagnosticStatus};

pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn step(num: usize, total: usize, msg: &str) {
    println!(
        "{} {}",
        style(format!("[{}/{}]", num, total)).bold().cyan(),
        msg
    );
}

pub fn success(msg: &str) {
    println!("{} {}", style("✓").bold().green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").bold().red(), msg);
}

pub fn warning(msg: &str) {
    eprintln!("{} {}", style("!").bold().yellow(), msg);
}

pub fn info(msg: &str) {
    println!("{} {}", style("→").bold().blue(), msg);
}

pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// One line per event from a deployment/setup/security progress stream.
pub fn progress_event(event: &ProgressEvent) {
    match event.status {
        ProgressStatus::Running => println!("{} {} {}", style(format!("[{:>3}%]", event.percent)).dim(), style(&event.step).cyan(), event.message),
        ProgressStatus::Ok => println!("{} {} {}", style(format!("[{:>3}%]", event.percent)).dim(), style("✓").bold().green(), event.message),
        ProgressStatus::Warning => println!("{} {} {}", style(format!("[{:>3}%]", event.percent)).dim(), style("!").bold().yellow(), event.message),
        ProgressStatus::Failed => eprintln!(
            "{} {} {}{}",
            style(format!("[{:>3}%]", event.percent)).dim(),
            style("✗").bold().red(),
            event.message,
            event.error.as_ref().map(|e| format!(": {}", e)).unwrap_or_default()
        ),
    }
}

/// One line per [`DiagnosticResult`] from a troubleshoot run, with the
/// suggestion indented underneath when present.
pub fn diagnostic(result: &DiagnosticResult) {
    let (icon, line) = match result.status {
        DiagnosticStatus::Ok => (style("✓").bold().green(), format!("{}: {}", result.step, result.message)),
        DiagnosticStatus::Warning => (style("!").bold().yellow(), format!("{}: {}", result.step, result.message)),
        DiagnosticStatus::Failed => (style("✗").bold().red(), format!("{}: {}", result.step, result.message)),
    };
    println!("{} {} ({:?})", icon, line, result.duration);
    if let Some(suggestion) = &result.suggestion {
        println!("    {} {}", style("→").dim(), style(suggestion).dim());
    }
}
