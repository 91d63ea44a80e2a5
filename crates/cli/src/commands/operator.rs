//! Operator health and CLI configuration commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::config::Config;
use crate::output::{color_status, print_json, print_success, print_table, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Show the operator's component health
pub async fn health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!("Operator: {}", color_status(&health.status).bold());
            println!();
            let rows = health
                .components
                .iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&c.status),
                    message: c.message.clone().unwrap_or_default(),
                })
                .collect();
            print_table(rows);
        }
    }
    Ok(())
}

/// Persist CLI defaults
pub fn set_config(
    api_url: Option<String>,
    namespace: Option<String>,
    format: Option<String>,
) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(url) = api_url {
        url::Url::parse(&url)?;
        config.api_url = Some(url);
    }
    if let Some(ns) = namespace {
        config.default_namespace = Some(ns);
    }
    if let Some(format) = format {
        // Reject unknown formats before saving
        config.default_format = Some(format);
        config.format(None)?;
    }
    let path = config.save()?;
    print_success(&format!("Configuration saved to {}", path.display()));
    Ok(())
}
