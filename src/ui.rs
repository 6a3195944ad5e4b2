//! Terminal output for the `ferryman` binary: a progress bar and colored summaries.
//!
//! [`WorkflowProgress`] follows one execution through progress callbacks and
//! bus events; the free functions print plans, reports and pipelines.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;

use crate::events::{Event, EventKind};
use crate::orchestrator::PipelineSummary;
use crate::pipeline::{JobStatus, Pipeline};
use crate::workflow::{ExecutionStatus, ProgressUpdate, Step, StepStatus, WorkflowExecution};

const BAR_TEMPLATE: &str = "{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}";

/// Progress bar for one workflow execution.
///
/// Cloning shares the underlying bar, so a clone can be moved into a
/// progress callback while the original prints the final summary.
#[derive(Clone)]
pub struct WorkflowProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl WorkflowProgress {
    pub fn start(workflow: &str) -> Self {
        let pb = ProgressBar::new(100);
        // the template is a constant; fall back to the default bar if it ever stops parsing
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .map(|s| s.progress_chars("=> "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message(format!("starting {workflow}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn update(&self, update: &ProgressUpdate) {
        self.pb.set_position((update.progress * 100.0).round() as u64);
        self.pb.set_message(format!(
            "{} ({}/{})",
            update.step,
            update.step_index + 1,
            update.total_steps
        ));
    }

    /// Prints the lines worth interrupting the bar for.
    pub fn event(&self, event: &Event) {
        let step = event.step.as_deref().unwrap_or("-");
        match event.kind {
            EventKind::StepRetry => self.pb.println(format!(
                "  {} {step}: {}",
                self.yellow.apply_to("↻"),
                event.message
            )),
            EventKind::StepFailed => self.pb.println(format!(
                "  {} {step}: {}",
                self.red.apply_to("✗"),
                event.message
            )),
            EventKind::StepSkipped => self.pb.println(format!(
                "  {} {step}: {}",
                self.dim.apply_to("–"),
                event.message
            )),
            EventKind::StepCompleted => self.pb.println(format!(
                "  {} {step}",
                self.green.apply_to("✓")
            )),
            _ => {}
        }
    }

    pub fn finish(&self, execution: &WorkflowExecution) {
        self.pb.finish_and_clear();
        let line = format!(
            "{} {} in {}",
            execution.workflow_name,
            execution.status,
            format_duration_ms(execution.duration_ms().unwrap_or(0).max(0) as u64)
        );
        match execution.status {
            ExecutionStatus::Completed => println!("{} {line}", self.green.apply_to("✓")),
            ExecutionStatus::Cancelled => println!("{} {line}", self.yellow.apply_to("■")),
            _ => println!("{} {line}", self.red.apply_to("✗")),
        }
        if let Some(error) = &execution.error {
            println!("  {}", self.red.apply_to(error));
        }
        for step in &execution.steps {
            println!("  {}", step_line(step));
        }
    }
}

fn status_style(status: StepStatus) -> Style {
    match status {
        StepStatus::Completed => Style::new().green(),
        StepStatus::Failed => Style::new().red(),
        StepStatus::Skipped => Style::new().dim(),
        StepStatus::Pending | StepStatus::Running => Style::new().yellow(),
    }
}

fn step_line(step: &Step) -> String {
    let mut line = format!(
        "{:<18} {:<10} {:>9}",
        step.name,
        status_style(step.status).apply_to(step.status),
        step.duration_ms().map(format_duration_ms).unwrap_or_default()
    );
    if step.retry_count > 0 {
        line.push_str(&format!("  retries={}", step.retry_count));
    }
    line
}

/// `1234` → `1.2s`, `61000` → `1m01s`.
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        let secs = ms / 1_000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// Prints the resolved step plan of a workflow.
pub fn print_plan(workflow: &str, steps: &[Step]) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to(workflow));
    for (i, step) in steps.iter().enumerate() {
        let deps = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!(" after {}", step.depends_on.join(", "))
        };
        let engine = step
            .engine
            .as_deref()
            .map(|e| format!(" [{e}]"))
            .unwrap_or_default();
        println!("  {:>2}. {} ({}){engine}{deps}", i + 1, step.name, step.kind);
    }
}

pub fn print_report(report: &Value) {
    let title = Style::new().cyan().bold();
    println!();
    println!("{}", title.apply_to("─── Report ───"));
    println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
}

pub fn print_pipeline(pipeline: &Pipeline) {
    let bold = Style::new().bold();
    println!(
        "{} {} ({})",
        bold.apply_to(&pipeline.name),
        pipeline.id,
        pipeline.status
    );
    for job in &pipeline.jobs {
        let style = match job.status {
            JobStatus::Completed => Style::new().green(),
            JobStatus::Failed => Style::new().red(),
            JobStatus::Skipped => Style::new().dim(),
            _ => Style::new().yellow(),
        };
        let deps = if job.depends_on.is_empty() {
            String::new()
        } else {
            let deps: Vec<&str> = job.depends_on.iter().map(String::as_str).collect();
            format!(" after {}", deps.join(", "))
        };
        println!(
            "  {:<20} {:<10} {}{deps}",
            job.id,
            job.job_type,
            style.apply_to(job.status)
        );
    }
}

pub fn print_pipeline_summary(summary: &PipelineSummary) {
    println!(
        "  {:<38} {:<20} {:<10} {} jobs",
        summary.id, summary.name, summary.status, summary.jobs
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_humanized() {
        assert_eq!(format_duration_ms(250), "250ms");
        assert_eq!(format_duration_ms(1_240), "1.2s");
        assert_eq!(format_duration_ms(61_000), "1m01s");
    }

    #[test]
    fn step_line_mentions_retries() {
        let mut step = Step::new("transfer", crate::workflow::StepKind::Transfer);
        step.retry_count = 2;
        assert!(step_line(&step).contains("retries=2"));
    }
}
