//! Job status display.
//!
//! One board per scheduler run. The mode decides how job activity is shown:
//! live per-job lines, flat log lines, or nothing but errors.

use crate::models::StatusMode;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

#[derive(Default)]
struct JobLine {
    bar: Option<ProgressBar>,
    stages: Vec<String>,
    cost_usd: f64,
}

impl JobLine {
    fn message(&self) -> String {
        let stages = if self.stages.is_empty() {
            "working".to_string()
        } else {
            self.stages.join(", ")
        };
        format!("{stages}  ${:.4}", self.cost_usd)
    }

    fn refresh(&self) {
        if let Some(bar) = &self.bar {
            bar.set_message(self.message());
        }
    }
}

/// Renders progress for all jobs of one run.
pub struct StatusBoard {
    mode: StatusMode,
    label: String,
    multi: Option<MultiProgress>,
    overall: Option<ProgressBar>,
    jobs: Mutex<HashMap<String, JobLine>>,
}

impl StatusBoard {
    /// Create a board for `total` jobs.
    pub fn new(label: impl Into<String>, mode: StatusMode, total: usize) -> Self {
        let label = label.into();
        let (multi, overall) = match mode {
            StatusMode::Interactive => {
                let multi = MultiProgress::new();
                let overall = multi.add(ProgressBar::new(total as u64));
                let template = concat!(
                    "[{elapsed_precise}] {prefix} {bar:40.cyan/blue} ",
                    "{pos}/{len} ({percent}%) {msg}"
                );
                if let Ok(style) = ProgressStyle::default_bar().template(template) {
                    overall.set_style(style.progress_chars("##-"));
                }
                overall.set_prefix(label.clone());
                (Some(multi), Some(overall))
            }
            StatusMode::Plain | StatusMode::Off => (None, None),
        };

        Self {
            mode,
            label,
            multi,
            overall,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> StatusMode {
        self.mode
    }

    pub fn job_started(&self, job_id: &str) {
        let mut line = JobLine::default();

        match (&self.multi, self.mode) {
            (Some(multi), _) => {
                let bar = multi.add(ProgressBar::new_spinner());
                let template = ProgressStyle::default_spinner()
                    .template("{spinner} {prefix:.bold} {wide_msg}");
                if let Ok(style) = template {
                    bar.set_style(style);
                }
                bar.set_prefix(job_id.to_string());
                bar.enable_steady_tick(Duration::from_millis(120));
                line.bar = Some(bar);
                line.refresh();
            }
            (None, StatusMode::Plain) => info!(run = %self.label, job = job_id, "Job started"),
            _ => {}
        }

        self.jobs.lock().insert(job_id.to_string(), line);
    }

    pub fn job_log(&self, job_id: &str, message: &str) {
        match (&self.multi, self.mode) {
            (Some(multi), _) => {
                let _ = multi.println(format!("[{job_id}] {message}"));
            }
            (None, StatusMode::Plain) => info!(job = job_id, "{message}"),
            _ => {}
        }
    }

    pub fn job_stages(&self, job_id: &str, stages: &[String]) {
        let mut jobs = self.jobs.lock();
        let line = jobs.entry(job_id.to_string()).or_default();
        line.stages = stages.to_vec();
        line.refresh();
    }

    pub fn job_cost(&self, job_id: &str, cost_usd: f64) {
        let mut jobs = self.jobs.lock();
        let line = jobs.entry(job_id.to_string()).or_default();
        line.cost_usd += cost_usd;
        line.refresh();
    }

    pub fn job_finished(&self, job_id: &str) {
        let line = self.jobs.lock().remove(job_id);
        if let Some(bar) = line.as_ref().and_then(|l| l.bar.as_ref()) {
            bar.finish_and_clear();
        }
        if let Some(overall) = &self.overall {
            overall.inc(1);
        }
        if self.mode == StatusMode::Plain {
            let cost = line.map_or(0.0, |l| l.cost_usd);
            info!(job = job_id, cost = format!("${cost:.4}"), "Job finished");
        }
    }

    /// Report a failed job. Shown in every mode.
    pub fn job_failed(&self, job_id: &str, reason: &str) {
        let line = self.jobs.lock().remove(job_id);
        if let Some(bar) = line.as_ref().and_then(|l| l.bar.as_ref()) {
            bar.abandon_with_message(format!("failed: {reason}"));
        }

        match &self.multi {
            Some(multi) => multi.suspend(|| error!(job = job_id, error = reason, "Job failed")),
            None => error!(job = job_id, error = reason, "Job failed"),
        }
    }

    /// Tear down the live view.
    pub fn finish(&self, message: &str) {
        if let Some(overall) = &self.overall {
            overall.finish_with_message(message.to_string());
        }
        if self.mode == StatusMode::Plain {
            info!(run = %self.label, "{message}");
        }
    }

    /// Names of jobs currently shown as running.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self.jobs.lock().keys().cloned().collect();
        jobs.sort();
        jobs
    }
}
