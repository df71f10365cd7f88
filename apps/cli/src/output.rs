//! Output formatting utilities

use crate::OutputFormat;
use console::style;
use dosdk_core::{errc, DownloadStatus};
use serde_json::json;

/// Print a status snapshot in the specified format
pub fn print_status(id: &str, status: &DownloadStatus, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let value = json!({ "id": id, "status": status });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Table => {
            println!("{}\t{}", id, status);
        }
        OutputFormat::Human => {
            println!("Download {}", style(id).cyan());
            println!("  State: {}", status.state);
            println!(
                "  Progress: {} / {} ({:.1}%)",
                format_bytes(status.bytes_transferred),
                format_bytes(status.bytes_total),
                status.progress()
            );
            if status.is_error() {
                let kind = if status.is_transient_error() {
                    style("transient").yellow()
                } else {
                    style("error").red()
                };
                println!(
                    "  {}: {} (extended 0x{:08x})",
                    kind,
                    format_code(status.error_code),
                    status.extended_error_code
                );
            }
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Symbolic name and hex value of an error code
pub fn format_code(code: i32) -> String {
    match errc::name(code) {
        Some(name) => format!("{} (0x{:08x})", name, code),
        None => format!("0x{:08x}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_code() {
        assert_eq!(
            format_code(errc::DO_E_HTTP_STATUS),
            "DO_E_HTTP_STATUS (0x80d05002)"
        );
        assert_eq!(format_code(0x1234), "0x00001234");
    }
}
