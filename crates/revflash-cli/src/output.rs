//! Output formatting for revflash (table or json)

use clap::ValueEnum;
use colored::Colorize;
use revflash_core::FlashStatus;
use revflash_flash::FlashEvent;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable tables and lines (default)
    #[default]
    Table,
    /// One JSON document per item
    Json,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet && !self.is_json() {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet && !self.is_json() {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => print_json(&data),
        }
    }

    /// Print key-value pairs
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                print_json(&map);
            }
        }
    }

    /// Print a job event as a single line
    pub fn event(&self, event: &FlashEvent) {
        if self.is_json() {
            print_json_line(event);
            return;
        }
        if self.quiet {
            return;
        }
        match event {
            FlashEvent::StatusChanged { status, progress, .. } => {
                println!("{:>3}% {}", progress, status_label(*status));
            }
            FlashEvent::Log { line, .. } => println!("     {}", line.dimmed()),
            FlashEvent::Finished { .. } => {}
        }
    }
}

fn status_label(status: FlashStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        FlashStatus::Completed | FlashStatus::Recovered => label.green().bold(),
        FlashStatus::Failed => label.red().bold(),
        FlashStatus::RecoveryInProgress => label.yellow().bold(),
        _ if status.is_destructive() => label.yellow(),
        _ => label.cyan(),
    }
}

fn print_json<T: Serialize + ?Sized>(data: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(data).unwrap_or_else(|_| "null".to_string())
    );
}

fn print_json_line<T: Serialize + ?Sized>(data: &T) {
    println!(
        "{}",
        serde_json::to_string(data).unwrap_or_else(|_| "null".to_string())
    );
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// Backup display for the backups command
#[derive(Debug, Tabled, Serialize)]
pub struct BackupRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Captured")]
    pub captured_at: String,
    #[tabled(rename = "Checksum")]
    pub checksum: String,
    #[tabled(rename = "Replaced by")]
    pub source_tune: String,
}
