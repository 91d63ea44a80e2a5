//! VNF lifecycle CLI commands

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use tabled::Tabled;

use crate::client::{ApiClient, VnfDetail, VnfListItem, VnfRef};
use crate::output::{
    color_phase, color_status, format_timestamp, print_info, print_json, print_success,
    print_table, print_warning, truncate, OutputFormat,
};

/// Row for the VNF listing
#[derive(Tabled)]
struct VnfRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Gen")]
    generation: i64,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Health")]
    health: String,
    #[tabled(rename = "Retries")]
    retries: String,
    #[tabled(rename = "Deployment")]
    deployment: String,
}

impl From<&VnfListItem> for VnfRow {
    fn from(item: &VnfListItem) -> Self {
        let retries = if item.permanent_failure {
            format!("{} (exhausted)", item.retry_count)
        } else {
            item.retry_count.to_string()
        };
        Self {
            namespace: item.namespace.clone(),
            name: item.name.clone(),
            generation: item.generation,
            phase: color_phase(&item.phase),
            health: color_status(&item.health),
            retries,
            deployment: if item.remote_deployment_id.is_empty() {
                "-".to_string()
            } else {
                truncate(&item.remote_deployment_id, 32)
            },
        }
    }
}

/// Row for the event listing
#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "Time")]
    timestamp: String,
    #[tabled(rename = "Type")]
    event_type: String,
    #[tabled(rename = "Description")]
    description: String,
}

/// List VNFs, optionally restricted to one namespace
pub async fn list(client: &ApiClient, namespace: Option<String>, format: OutputFormat) -> Result<()> {
    let items: Vec<VnfListItem> = client
        .list_vnfs()
        .await?
        .into_iter()
        .filter(|i| namespace.as_ref().map(|ns| &i.namespace == ns).unwrap_or(true))
        .collect();

    match format {
        OutputFormat::Json => print_json(&items)?,
        OutputFormat::Table => {
            print_table(items.iter().map(VnfRow::from).collect());
            if !items.is_empty() {
                println!("\nTotal: {} VNFs", items.len());
            }
        }
    }
    Ok(())
}

/// Show one VNF's intent and lifecycle state
pub async fn get(client: &ApiClient, vnf: &VnfRef, format: OutputFormat) -> Result<()> {
    let detail = client.get_vnf(vnf).await?;

    match format {
        OutputFormat::Json => print_json(&detail)?,
        OutputFormat::Table => print_detail(vnf, &detail),
    }
    Ok(())
}

fn print_detail(vnf: &VnfRef, detail: &VnfDetail) {
    let intent = &detail.intent;
    let status = &intent.status;

    println!("{}", "VNF".bold());
    println!("{}", "=".repeat(60));
    println!("Name:        {}", vnf.to_string().cyan());
    if let Some(t) = intent.spec.get("type").and_then(|t| t.as_str()) {
        println!("Type:        {}", t);
    }
    println!(
        "Generation:  {} (observed {})",
        intent.metadata.generation, status.observed_generation
    );
    if intent.metadata.deletion_requested {
        println!("Deletion:    {}", "requested".yellow());
    }

    let Some(state) = &detail.state else {
        println!();
        print_info("Not reconciled yet");
        return;
    };

    println!();
    println!("{}", "Lifecycle".bold());
    println!("{}", "-".repeat(60));
    println!("Phase:       {}", color_phase(&state.phase));
    println!("Health:      {}", color_status(&state.health.overall));
    if let Some(checked) = &state.health.last_check {
        println!("Checked:     {}", format_timestamp(checked));
    }
    if !state.remote_deployment_id.is_empty() {
        println!("Deployment:  {}", state.remote_deployment_id);
    }
    if let Some(rev) = &state.gitops_revision {
        println!("Revision:    {}", rev);
    }
    println!("Retries:     {}", state.retry_count);
    if let Some(at) = &state.next_retry_at {
        println!("Next retry:  {}", format_timestamp(at));
    }
    if let Some(message) = &status.message {
        println!("Message:     {}", message);
    }
    if state.permanently_failed {
        print_warning("Retries exhausted; change the spec to restart the lifecycle");
    }

    if !state.health.per_component.is_empty() {
        println!();
        println!("{}", "Components".bold());
        println!("{}", "-".repeat(60));
        for (component, health) in &state.health.per_component {
            println!("{:<12} {}", component, color_status(health));
        }
    }

    if let Some(last) = state.error_history.last() {
        println!();
        println!("{}", "Last error".bold());
        println!("{}", "-".repeat(60));
        println!(
            "{} [{}] in {}: {}",
            format_timestamp(&last.timestamp),
            last.code,
            last.phase,
            last.message.red()
        );
    }
}

/// Show the recorded lifecycle events of one VNF, newest last
pub async fn events(
    client: &ApiClient,
    vnf: &VnfRef,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let detail = client.get_vnf(vnf).await?;
    let events = detail.state.map(|s| s.events).unwrap_or_default();
    let skip = events.len().saturating_sub(limit);
    let events = &events[skip..];

    match format {
        OutputFormat::Json => print_json(events)?,
        OutputFormat::Table => {
            let rows = events
                .iter()
                .map(|e| EventRow {
                    timestamp: format_timestamp(&e.timestamp),
                    event_type: e.event_type.clone(),
                    description: truncate(&e.description, 80),
                })
                .collect();
            print_table(rows);
        }
    }
    Ok(())
}

/// Create or update a VNF from a JSON spec file
pub async fn apply(
    client: &ApiClient,
    vnf: &VnfRef,
    file: &Path,
    format: OutputFormat,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let spec: serde_json::Value =
        serde_json::from_str(&content).context("Spec file is not valid JSON")?;
    if !spec.is_object() {
        anyhow::bail!("Spec file must contain a JSON object");
    }

    let intent = client.apply_vnf(vnf, &spec).await?;

    match format {
        OutputFormat::Json => print_json(&intent)?,
        OutputFormat::Table => print_success(&format!(
            "VNF {} applied (generation {})",
            vnf, intent.metadata.generation
        )),
    }
    Ok(())
}

/// Request deletion of a VNF
pub async fn delete(client: &ApiClient, vnf: &VnfRef) -> Result<()> {
    client.delete_vnf(vnf).await?;
    print_success(&format!("Deletion of VNF {} requested", vnf));
    Ok(())
}
