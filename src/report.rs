//! Human-readable rendering of run results and status reports.
use std::fmt::Write;

use crate::{
    config::Context,
    health::HealthClass,
    orchestrator::{CompositeHealth, CompositeStatusReport, StartReport, StopReport},
    service::{ServiceReport, ServiceStatus},
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const MAGENTA_BOLD: &str = "\x1b[1;35m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

fn paint(text: &str, color: &str, enabled: bool) -> String {
    if enabled {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

fn status_color(status: ServiceStatus) -> &'static str {
    match status {
        ServiceStatus::Healthy => GREEN_BOLD,
        ServiceStatus::Running | ServiceStatus::Starting | ServiceStatus::Stopping => YELLOW_BOLD,
        ServiceStatus::Failed => RED_BOLD,
        ServiceStatus::NotRunning => MAGENTA_BOLD,
    }
}

fn summary_color(summary: CompositeHealth) -> &'static str {
    match summary {
        CompositeHealth::AllHealthy => GREEN_BOLD,
        CompositeHealth::Partial { .. } => YELLOW_BOLD,
        CompositeHealth::NoneRunning => RED_BOLD,
    }
}

fn service_line(member: &ServiceReport, color: bool) -> String {
    let mut line = format!(
        "{} {:<20} {}",
        paint("●", status_color(member.status), color),
        member.display_name,
        paint(member.status.as_ref(), status_color(member.status), color),
    );

    if let Some(pid) = member.pid {
        let _ = write!(line, "  pid {pid}");
    }
    if let Some(url) = &member.url {
        let _ = write!(line, "  {url}");
    }
    if let Some(http) = &member.http
        && http.classification != HealthClass::Ok
    {
        let _ = write!(line, "  [{}: {}]", http.classification, http.detail);
    }
    line
}

/// Status table for `devstack status`.
pub fn render_status(report: &CompositeStatusReport, color: bool) -> String {
    let mut out = format!(
        "{}: {}\n",
        report.target,
        paint(&report.summary.to_string(), summary_color(report.summary), color)
    );
    for member in &report.members {
        out.push_str(&service_line(member, color));
        out.push('\n');
    }
    out
}

/// Summary printed after a successful start.
pub fn render_start(target: &str, report: &StartReport) -> String {
    let mut out = format!("Started {target}: {}\n", report.order.join(" -> "));
    if !report.already_running.is_empty() {
        let _ = writeln!(out, "Already running: {}", report.already_running.join(", "));
    }
    for (service, url) in &report.urls {
        let _ = writeln!(out, "  {service:<20} {url}");
    }
    out
}

/// Summary printed after a stop.
pub fn render_stop(target: &str, report: &StopReport) -> String {
    let mut out = String::new();
    if report.stopped.is_empty() {
        let _ = writeln!(out, "Nothing to stop for {target}");
    } else {
        let _ = writeln!(out, "Stopped {target}: {}", report.stopped.join(", "));
    }
    for warning in &report.warnings {
        let _ = writeln!(out, "warning: {warning}");
    }
    out
}

/// Listing of every configured service and composite.
pub fn render_list(context: &Context) -> String {
    let mut out = String::from("Services:\n");
    for service in context.services() {
        let _ = write!(out, "  {:<20}", service.name);
        if let Some(port) = service.port {
            let _ = write!(out, " port {port}");
        }
        if !service.dependencies.is_empty() {
            let _ = write!(out, " needs {}", service.dependencies.join(", "));
        }
        out.push('\n');
    }

    if !context.composites().is_empty() {
        out.push_str("Composites:\n");
        for composite in context.composites() {
            let _ = writeln!(out, "  {:<20} {}", composite.name, composite.members.join(", "));
        }
    }
    out
}
