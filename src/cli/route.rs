//! `route` command: push messages through the tiers with a demo responder.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use zeptocache::{CacheService, Config, ResponseCompute};

/// Simulated model latency for the demo responder.
const DEMO_LATENCY: Duration = Duration::from_millis(120);

/// Stand-in for a model call: waits, then echoes the message.
struct DemoResponder;

#[async_trait]
impl ResponseCompute for DemoResponder {
    async fn compute(&self, message: &str, context: &Map<String, Value>) -> anyhow::Result<Value> {
        tokio::time::sleep(DEMO_LATENCY).await;
        let level = context
            .get("cache_level")
            .and_then(Value::as_str)
            .unwrap_or("computed");
        Ok(json!({
            "response": format!(
                "Thanks for your message: \"{}\". An advisor will follow up shortly.",
                message
            ),
            "generated_by": format!("demo ({})", level),
        }))
    }
}

pub(crate) fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--context must be a JSON object, got {}", other),
    }
}

/// Route a message `repeat` times and print where each reply came from.
pub(crate) async fn cmd_route(
    config: &Config,
    message: &str,
    context: Option<&str>,
    repeat: usize,
    warmup: Option<&Path>,
) -> Result<()> {
    let context = parse_context(context)?;
    let service = CacheService::from_config(config).await?;
    if let Some(path) = warmup {
        let report = service.warmup_from_file(path).await?;
        println!(
            "Warmed {} decisions and {} instant replies",
            report.decisions, report.instant
        );
    }

    let responder = DemoResponder;
    let mut last = None;
    for attempt in 1..=repeat.max(1) {
        let routed = service.route_request(message, &context, &responder).await;
        let m = &routed.metrics;
        println!(
            "#{} [{}] {:.2}ms (target {}ms{}) {}",
            attempt,
            m.cache_level,
            m.response_time_ms,
            m.target_time_ms,
            if m.within_target { "" } else { ", MISSED" },
            routed.text().unwrap_or("<no text>")
        );
        last = Some(routed);
    }

    if let Some(routed) = last {
        println!();
        println!("{}", serde_json::to_string_pretty(&routed)?);
    }

    let stats = service.router().stats();
    println!();
    println!(
        "Requests: {}  Efficiency: {:.1}%  Avg: {:.2}ms",
        stats.total_requests, stats.cache_efficiency, stats.avg_response_ms
    );
    for rec in &stats.recommendations {
        println!("  - {}", rec);
    }
    Ok(())
}
