//! Progress bar fed by the download's status callback

use crate::output::format_code;
use console::style;
use dosdk_core::{DoError, DownloadState, DownloadStatus, PropertyValue};
use indicatif::{ProgressBar, ProgressStyle};

pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new(0);
        let bar_style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ");
        bar.set_style(bar_style);
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Status callback driving this bar
    pub fn callback(&self) -> PropertyValue {
        let bar = self.bar.clone();
        PropertyValue::callback(move |_, status| update(&bar, status))
    }

    pub fn finish(&self, result: &Result<(), DoError>) {
        match result {
            Ok(()) => self.bar.finish_with_message(format!(
                "{} Download complete",
                style("✓").green().bold()
            )),
            Err(DoError::Cancelled) => self
                .bar
                .abandon_with_message(format!("{} Cancelled", style("○").dim())),
            Err(e) => self.bar.abandon_with_message(format!(
                "{} Failed: {}",
                style("✗").red().bold(),
                e
            )),
        }
    }
}

fn update(bar: &ProgressBar, status: &DownloadStatus) {
    if status.bytes_total > 0 {
        bar.set_length(status.bytes_total);
    }
    bar.set_position(status.bytes_transferred);

    match status.state {
        DownloadState::Paused if status.is_error() => {
            bar.set_message(format!(
                "{} {}",
                style("!").red(),
                format_code(status.error_code)
            ));
        }
        DownloadState::Paused => {
            bar.set_message(format!("{} Paused", style("⏸").yellow()));
        }
        DownloadState::Transferring if status.is_error() => {
            bar.set_message(format!("{} Retrying", style("↻").yellow()));
        }
        _ => {}
    }
}
