use chrono::{Local, TimeZone};
use kris_core::api::{JobClass, JobStatus};
use owo_colors::OwoColorize;
use supports_color::Stream;

/// Styled terminal output; styling is dropped when stdout has no color support.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    color: bool,
}

impl Printer {
    pub fn detect() -> Self {
        Self {
            color: supports_color::on(Stream::Stdout).is_some(),
        }
    }

    pub fn heading(&self, text: &str) {
        println!("{}", self.bold(text));
    }

    pub fn success(&self, text: &str) {
        if self.color {
            println!("{}", text.green().bold());
        } else {
            println!("{text}");
        }
    }

    pub fn failure(&self, text: &str) {
        if self.color {
            eprintln!("{}", text.red().bold());
        } else {
            eprintln!("{text}");
        }
    }

    pub fn field(&self, label: &str, value: &str) {
        println!("{} {}", self.label(&format!("{label:10}")), self.bold(value));
    }

    pub fn jobs(&self, jobs: &[JobStatus], class: JobClass) {
        if jobs.is_empty() {
            self.heading("No jobs");
            return;
        }
        for line in job_table(jobs, class) {
            println!("{}", self.label(&line));
        }
    }

    pub fn status(&self, status: &JobStatus, class: JobClass) {
        if !status.error_message.is_empty() {
            self.failure(&format!("Error: {}", status.error_message));
            return;
        }
        self.field("ID:", &status.job_name);
        match class {
            JobClass::Service => self.field("Status:", &status.status),
            JobClass::User => {
                for (stage, at) in status.stages() {
                    self.field(&format!("{stage}:"), &human_time(at));
                }
            }
        }
    }

    fn bold(&self, text: &str) -> String {
        if self.color {
            text.bold().to_string()
        } else {
            text.to_string()
        }
    }

    fn label(&self, text: &str) -> String {
        if self.color {
            text.yellow().bold().to_string()
        } else {
            text.to_string()
        }
    }
}

/// Job listing rows, oldest first.
pub fn job_table(jobs: &[JobStatus], class: JobClass) -> Vec<String> {
    let mut sorted: Vec<&JobStatus> = jobs.iter().collect();
    sorted.sort_by_key(|job| job.created_at);

    let mut lines = vec![
        "started              status\tname".to_string(),
        "-".repeat(79),
    ];
    for job in sorted {
        let started = match class {
            JobClass::User => human_time(job.created_at),
            JobClass::Service => "?".repeat(19),
        };
        lines.push(format!("{started}  {}\t{}", job.status, job.job_name));
    }
    lines
}

/// Local `YYYY-MM-DD HH:MM:SS` for a unix timestamp.
pub fn human_time(timestamp: i64) -> String {
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
