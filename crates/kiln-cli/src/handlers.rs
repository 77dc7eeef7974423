//! Command handlers.

use crate::client::{ApiClient, ForceResponse, ListBuilders, ListBuilds, ListRequests, ListWorkers};
use crate::config::{CliConfig, OutputFormat};
use console::style;
use futures::StreamExt;
use kiln_core::events::Event;
use tokio_tungstenite::tungstenite::Message;

/// List configured builders.
pub async fn builders(config: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(config);
    if config.output_format == OutputFormat::Json {
        let value = client.get_value("/api/v1/builders").await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let list: ListBuilders = client.get("/api/v1/builders").await?;
    println!("{} builders", list.total);
    for builder in &list.builders {
        println!(
            "  {:<24} {:<8} {:<5} {} steps",
            builder.name,
            builder.platform,
            builder.arch,
            builder.steps.len()
        );
    }
    Ok(())
}

/// List recent builds for a builder.
pub async fn builds(
    config: &CliConfig,
    builder: &str,
    limit: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(config);
    let path = format!("/api/v1/builders/{}/builds?limit={}", builder, limit);
    if config.output_format == OutputFormat::Json {
        let value = client.get_value(&path).await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let list: ListBuilds = client.get(&path).await?;
    if list.builds.is_empty() {
        println!("{} No builds recorded for {}", style("i").blue(), builder);
        return Ok(());
    }
    println!("Recent builds of {}:", style(builder).bold());
    for build in &list.builds {
        println!(
            "  #{:<5} {:<26} {:<22} {}",
            build.number,
            build.completed_at,
            build.worker.as_deref().unwrap_or("-"),
            outcome_style(&build.outcome),
        );
    }
    Ok(())
}

/// Show one build in detail.
pub async fn show(
    config: &CliConfig,
    builder: &str,
    number: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(config);
    let path = format!("/api/v1/builders/{}/builds/{}", builder, number);
    if config.output_format == OutputFormat::Json {
        let value = client.get_value(&path).await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let build: crate::client::BuildSummary = client.get(&path).await?;
    println!(
        "Build #{} on {}: {}",
        build.number,
        style(&build.builder).bold(),
        outcome_style(&build.outcome)
    );
    println!("  request: {}", build.request_id);
    if let Some(worker) = &build.worker {
        println!("  worker: {}", worker);
    }
    if let Some(started) = &build.started_at {
        println!("  started: {}", started);
    }
    println!("  completed: {}", build.completed_at);
    if let Some(note) = &build.logs_ref {
        println!("  note: {}", note);
    }
    if !build.steps.is_empty() {
        println!("  steps:");
        for step in &build.steps {
            let code = step
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<16} {:<10} exit {:<4} {} ms",
                step.name, step.status, code, step.duration_ms
            );
        }
    }
    Ok(())
}

/// Force a build of a builder.
pub async fn force(config: &CliConfig, builder: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(config);
    println!(
        "{} Forcing build of {}",
        style("▶").cyan(),
        style(builder).bold()
    );
    let response: ForceResponse = client
        .post(&format!("/api/v1/builders/{}/force", builder))
        .await?;
    println!(
        "{} Request {} queued",
        style("✓").green(),
        response.request_id
    );
    Ok(())
}

/// Cancel a queued or running request.
pub async fn cancel(config: &CliConfig, request_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(config);
    client
        .post_no_content(&format!("/api/v1/requests/{}/cancel", request_id))
        .await?;
    println!(
        "{} Cancellation requested for {}",
        style("✓").green(),
        request_id
    );
    Ok(())
}

/// List live build requests.
pub async fn requests(config: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(config);
    if config.output_format == OutputFormat::Json {
        let value = client.get_value("/api/v1/requests").await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let list: ListRequests = client.get("/api/v1/requests").await?;
    if list.requests.is_empty() {
        println!("{} No live requests", style("i").blue());
        return Ok(());
    }
    println!("{} live requests", list.total);
    for entry in &list.requests {
        println!(
            "  {:<38} {:<24} {:<10} attempt {} {}",
            entry.request.id,
            entry.request.builder,
            entry.phase,
            entry.request.attempts,
            entry.worker.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// List connected workers.
pub async fn workers(config: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(config);
    if config.output_format == OutputFormat::Json {
        let value = client.get_value("/api/v1/workers").await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let list: ListWorkers = client.get("/api/v1/workers").await?;
    if list.workers.is_empty() {
        println!("{} No workers connected", style("i").blue());
        return Ok(());
    }
    println!("{} workers", list.total);
    for worker in &list.workers {
        println!(
            "  {:<24} {:<8} {:<5} {:<12} {}",
            worker.name,
            worker.platform,
            worker.arch,
            worker.status,
            worker.current_request_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Stream master events.
pub async fn watch(config: &CliConfig, pattern: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = events_url(&config.api_url, pattern);
    println!(
        "Streaming events matching {} (Ctrl+C to stop)...",
        style(pattern).bold()
    );

    let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
    let (_, mut stream) = ws.split();
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => print_event(&text),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

fn print_event(text: &str) {
    match serde_json::from_str::<Event>(text) {
        Ok(event) => println!("{} {}", style(event.subject()).cyan(), text),
        Err(_) => println!("{}", text),
    }
}

fn events_url(api_url: &str, pattern: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{}/ws/events?pattern={}", ws_base, encode_pattern(pattern))
}

fn encode_pattern(pattern: &str) -> String {
    pattern
        .replace('%', "%25")
        .replace('>', "%3E")
        .replace('#', "%23")
        .replace(' ', "%20")
}

/// Store operator credentials.
pub async fn login() -> Result<(), Box<dyn std::error::Error>> {
    use dialoguer::{Input, Password};

    let username: String = Input::new()
        .with_prompt("Operator username")
        .interact_text()?;
    let password = Password::new().with_prompt("Operator password").interact()?;

    let mut config = CliConfig::load().unwrap_or_default();
    config.username = Some(username);
    config.password = Some(password);
    config.save()?;

    println!("{} Credentials saved", style("✓").green());
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("Current configuration:");
    println!("  api_url: {}", config.api_url);
    println!(
        "  username: {}",
        config.username.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  password: {}",
        if config.password.is_some() {
            "***"
        } else {
            "(not set)"
        }
    );
    println!("  output_format: {:?}", config.output_format);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

fn outcome_style(outcome: &str) -> console::StyledObject<&str> {
    match outcome {
        "succeeded" => style(outcome).green(),
        "failed" => style(outcome).red(),
        "exception" => style(outcome).yellow(),
        _ => style(outcome).dim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_url_swaps_scheme() {
        assert_eq!(
            events_url("http://ci.example:8010/", ">"),
            "ws://ci.example:8010/ws/events?pattern=%3E"
        );
        assert_eq!(
            events_url("https://ci.example", "build.*"),
            "wss://ci.example/ws/events?pattern=build.*"
        );
    }
}
