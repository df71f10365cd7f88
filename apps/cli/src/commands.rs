//! CLI command implementations

use crate::output::{format_bytes, format_code, print_status};
use crate::progress::TransferProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, Context, Result};
use console::style;
use dosdk_core::{
    AgentService, DeliveryService, DoClient, DownloadId, DownloadProperty, ServiceKind, Settings,
    SettingsStore, WireValue,
};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Download Commands
// ============================================================================

/// Arguments of `dosdk get`
pub struct GetRequest {
    pub url: String,
    pub output: PathBuf,
    pub caller_name: Option<String>,
    pub foreground: bool,
    pub headers: Vec<String>,
    pub correlation_vector: Option<String>,
    pub integrity_info: Option<String>,
    pub timeout: Option<u64>,
}

pub async fn get(
    settings: Settings,
    kind: ServiceKind,
    request: GetRequest,
    format: OutputFormat,
) -> Result<()> {
    let client = DoClient::connect(kind, settings).await?;
    let tolerated = client.tolerated_errors();
    let download = client.download(&request.url, &request.output).await?;

    if let Some(name) = request.caller_name {
        download.set_property(DownloadProperty::CallerName, name).await?;
    }
    if request.foreground {
        download
            .set_property(DownloadProperty::UseForegroundPriority, true)
            .await?;
    }
    if !request.headers.is_empty() {
        download
            .set_property(DownloadProperty::HttpCustomHeaders, request.headers.join("\n"))
            .await
            .context("invalid --header")?;
    }

    // Older services may not know these; the compat settings decide
    if let Some(cv) = request.correlation_vector {
        download
            .set_property_tolerant(DownloadProperty::CorrelationVector, cv, &tolerated)
            .await?;
    }
    if let Some(info) = request.integrity_info {
        download
            .set_property_tolerant(DownloadProperty::IntegrityCheckInfo, info, &tolerated)
            .await
            .context("invalid --integrity-info")?;
    }

    let progress = match format {
        OutputFormat::Human => Some(TransferProgress::new(&request.url)),
        OutputFormat::Json | OutputFormat::Table => None,
    };
    if let Some(progress) = &progress {
        download
            .set_property(DownloadProperty::CallbackInterface, progress.callback())
            .await?;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let timeout = request
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(download.options().completion_timeout);
    let result = download
        .start_and_wait_until_completion_with(&cancel, timeout)
        .await;

    if let Some(progress) = &progress {
        progress.finish(&result);
    }
    result.with_context(|| format!("download of {} failed", request.url))?;

    let status = download.get_status().await?;
    match format {
        OutputFormat::Json => {
            let value = json!({
                "id": download.id(),
                "path": request.output,
                "status": status,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Downloaded {} to {}",
                style("✓").green().bold(),
                format_bytes(status.bytes_transferred),
                style(request.output.display()).cyan()
            );
        }
    }

    Ok(())
}

// ============================================================================
// Agent Commands
// ============================================================================

async fn agent(settings: &Settings) -> Result<AgentService> {
    AgentService::from_settings(&settings.agent)
        .await
        .context("cannot reach the delivery-optimization agent")
}

pub async fn show_status(settings: &Settings, id: &str, format: OutputFormat) -> Result<()> {
    let agent = agent(settings).await?;
    let status = agent.get_status(&DownloadId(id.to_string())).await?;
    print_status(id, &status, format)
}

pub async fn pause_download(settings: &Settings, id: &str) -> Result<()> {
    agent(settings).await?.pause(&DownloadId(id.to_string())).await?;
    println!("{} Pause requested", style("⏸").yellow());
    Ok(())
}

pub async fn resume_download(settings: &Settings, id: &str) -> Result<()> {
    agent(settings).await?.start(&DownloadId(id.to_string())).await?;
    println!("{} Download resumed", style("▶").green());
    Ok(())
}

pub async fn abort_download(settings: &Settings, id: &str) -> Result<()> {
    agent(settings).await?.abort(&DownloadId(id.to_string())).await?;
    println!("{} Download aborted", style("○").dim());
    Ok(())
}

pub async fn show_property(
    settings: &Settings,
    id: &str,
    name: &str,
    format: OutputFormat,
) -> Result<()> {
    let property: DownloadProperty = name.parse().map_err(|e: String| anyhow!(e))?;
    let result = agent(settings)
        .await?
        .get_property(&DownloadId(id.to_string()), property)
        .await;

    let value = match result {
        Ok(value) => value,
        Err(e) => return Err(anyhow!("{} ({})", e, format_code(e.code()))),
    };

    match format {
        OutputFormat::Json => {
            let value = json!({ "property": property.as_str(), "value": value });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Human | OutputFormat::Table => match value {
            WireValue::String(s) => println!("{}", s),
            other => println!("{}", other.to_query_value()),
        },
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

const CONFIG_KEYS: [&str; 11] = [
    "agent.port",
    "agent.port_file_dir",
    "agent.request_timeout_secs",
    "local.max_bandwidth_bps",
    "local.background_limit_bps",
    "local.contended_background_limit_bps",
    "local.no_progress_timeout_secs",
    "local.retry_delay_ms",
    "wait_poll_interval_ms",
    "callback_poll_interval_ms",
    "completion_timeout_secs",
];

fn config_value(settings: &Settings, key: &str) -> Result<String> {
    let value = match key {
        "agent.port" => settings
            .agent
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "auto".to_string()),
        "agent.port_file_dir" => settings.agent.port_file_dir.display().to_string(),
        "agent.request_timeout_secs" => settings.agent.request_timeout_secs.to_string(),
        "local.max_bandwidth_bps" => settings.local.max_bandwidth_bps.to_string(),
        "local.background_limit_bps" => settings.local.background_limit_bps.to_string(),
        "local.contended_background_limit_bps" => {
            settings.local.contended_background_limit_bps.to_string()
        }
        "local.no_progress_timeout_secs" => settings.local.no_progress_timeout_secs.to_string(),
        "local.retry_delay_ms" => settings.local.retry_delay_ms.to_string(),
        "wait_poll_interval_ms" => settings.wait_poll_interval_ms.to_string(),
        "callback_poll_interval_ms" => settings.callback_poll_interval_ms.to_string(),
        "completion_timeout_secs" => settings.completion_timeout_secs.to_string(),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    };
    Ok(value)
}

fn set_config_value(settings: &mut Settings, key: &str, value: &str) -> Result<()> {
    match key {
        "agent.port" => {
            settings.agent.port = match value {
                "auto" | "" => None,
                port => Some(port.parse()?),
            }
        }
        "agent.port_file_dir" => settings.agent.port_file_dir = PathBuf::from(value),
        "agent.request_timeout_secs" => settings.agent.request_timeout_secs = value.parse()?,
        "local.max_bandwidth_bps" => settings.local.max_bandwidth_bps = value.parse()?,
        "local.background_limit_bps" => settings.local.background_limit_bps = value.parse()?,
        "local.contended_background_limit_bps" => {
            settings.local.contended_background_limit_bps = value.parse()?
        }
        "local.no_progress_timeout_secs" => {
            settings.local.no_progress_timeout_secs = value.parse()?
        }
        "local.retry_delay_ms" => settings.local.retry_delay_ms = value.parse()?,
        "wait_poll_interval_ms" => settings.wait_poll_interval_ms = value.parse()?,
        "callback_poll_interval_ms" => settings.callback_poll_interval_ms = value.parse()?,
        "completion_timeout_secs" => settings.completion_timeout_secs = value.parse()?,
        _ => return Err(anyhow!("Unknown or read-only config key: {}", key)),
    }
    Ok(())
}

pub async fn config_action(
    store: &SettingsStore,
    effective: Settings,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&effective)?);
            }
            OutputFormat::Table => {
                use tabled::{Table, Tabled};

                #[derive(Tabled)]
                struct ConfigRow {
                    key: String,
                    value: String,
                }

                let rows = CONFIG_KEYS
                    .iter()
                    .map(|key| {
                        Ok(ConfigRow {
                            key: key.to_string(),
                            value: config_value(&effective, key)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                println!("{}", Table::new(rows));
            }
            OutputFormat::Human => {
                println!("DOSDK Configuration ({}):", store.settings_path().display());
                println!();
                for key in CONFIG_KEYS {
                    println!("  {}: {}", key, config_value(&effective, key)?);
                }
                let tolerated: Vec<_> = effective.compat.tolerated.keys().map(|p| p.as_str()).collect();
                println!("  compat.tolerated: {}", tolerated.join(", "));
            }
        },

        Some(ConfigAction::Get { key }) => {
            println!("{}", config_value(&effective, &key)?);
        }

        Some(ConfigAction::Set { key, value }) => {
            // Start from the file so env overrides are not persisted
            let mut settings = store.load_settings().await?;
            set_config_value(&mut settings, &key, &value)
                .with_context(|| format!("invalid value for {}: {}", key, value))?;
            store.save_settings(&settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            let confirmed = yes || {
                use dialoguer::Confirm;

                Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?
            };

            if confirmed {
                store.reset_settings().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_config_key_reads_and_writes() {
        let mut settings = Settings::default();
        for key in CONFIG_KEYS {
            let current = config_value(&settings, key).unwrap();
            set_config_value(&mut settings, key, &current).unwrap();
        }
        assert!(config_value(&settings, "nope").is_err());
    }

    #[test]
    fn test_set_config_value_parses() {
        let mut settings = Settings::default();
        set_config_value(&mut settings, "agent.port", "50000").unwrap();
        assert_eq!(settings.agent.port, Some(50000));
        set_config_value(&mut settings, "agent.port", "auto").unwrap();
        assert_eq!(settings.agent.port, None);
        assert!(set_config_value(&mut settings, "local.retry_delay_ms", "soon").is_err());
    }
}
