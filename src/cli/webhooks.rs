use anyhow::{Result, bail};
use console::style;

use super::parse_client_args;
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};
use crate::core::webhook::DeliveryStatus;

pub async fn run_webhook_command(args: &[String]) -> Result<()> {
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    let parsed = parse_client_args(args, 3);

    match sub_cmd {
        "add" | "create" => {
            let Some(url) = parsed.positional.first() else {
                bail!("usage: autopilot webhook add <url> --events task.completed,task.failed");
            };
            let events: Vec<String> = parsed
                .option("--events")
                .unwrap_or("task.completed,task.failed")
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
            let rate_limit = parsed
                .option("--rate-limit")
                .map(|raw| {
                    raw.parse::<u32>()
                        .map_err(|_| anyhow::anyhow!("--rate-limit must be a number, got '{}'", raw))
                })
                .transpose()?;
            let webhook = parsed
                .client()?
                .create_webhook(url, &events, parsed.option("--secret"), rate_limit)
                .await?
                .data;

            print_success(&format!("Webhook {} registered.", webhook.id));
            GuideSection::new("Signing secret")
                .text(style(&webhook.secret).yellow().bold().to_string())
                .text("Verify X-Webhook-Signature (sha256=<hex HMAC of the body>) with it.")
                .print();
            print_warn("The secret is not shown again.");
            Ok(())
        }
        "list" | "ls" => {
            let webhooks = parsed.client()?.list_webhooks().await?.data;
            if webhooks.is_empty() {
                print_info("No webhooks registered.");
                return Ok(());
            }
            let mut section = GuideSection::new("Webhooks");
            for wh in &webhooks {
                let status = if wh.active {
                    style("ACTIVE").green().bold().to_string()
                } else {
                    style("INACTIVE").dim().to_string()
                };
                let events = wh
                    .events
                    .iter()
                    .map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                section = section.bullet(&format!(
                    "{} [{}] {} {}",
                    style(&wh.id).white().bold(),
                    status,
                    style(&wh.url).underlined().cyan(),
                    style(format!("({}, {}/min)", events, wh.rate_limit)).dim()
                ));
            }
            section.print();
            Ok(())
        }
        "remove" | "rm" | "delete" => {
            let Some(id) = parsed.positional.first() else {
                bail!("usage: autopilot webhook remove <id>");
            };
            parsed.client()?.delete_webhook(id).await?;
            print_success(&format!("Webhook {} removed.", id));
            Ok(())
        }
        "stats" => {
            let stats = parsed.client()?.webhook_stats().await?.data;
            GuideSection::new("Webhook deliveries")
                .bullet(&format!(
                    "Webhooks: {} ({} active)",
                    stats.total_webhooks, stats.active_webhooks
                ))
                .bullet(&format!(
                    "Delivered: {}",
                    style(stats.deliveries.success).green().bold()
                ))
                .bullet(&format!("Failed: {}", style(stats.deliveries.failed).red().bold()))
                .bullet(&format!(
                    "Rate limited: {}",
                    style(stats.deliveries.rate_limited).yellow()
                ))
                .print();
            Ok(())
        }
        "deliveries" | "log" => {
            let Some(id) = parsed.positional.first() else {
                bail!("usage: autopilot webhook deliveries <id> [--limit N]");
            };
            let limit = parsed
                .option("--limit")
                .map(|raw| {
                    raw.parse::<usize>()
                        .map_err(|_| anyhow::anyhow!("--limit must be a number, got '{}'", raw))
                })
                .transpose()?;
            let deliveries = parsed.client()?.webhook_deliveries(id, limit).await?.data;
            if deliveries.is_empty() {
                print_info("No deliveries recorded.");
                return Ok(());
            }
            let mut section = GuideSection::new("Deliveries");
            for d in &deliveries {
                let status = match d.status {
                    DeliveryStatus::Success => style(d.status.as_str()).green().to_string(),
                    DeliveryStatus::Failed => style(d.status.as_str()).red().to_string(),
                    DeliveryStatus::RateLimited => style(d.status.as_str()).yellow().to_string(),
                };
                let code = d
                    .status_code
                    .map(|c| format!(" HTTP {}", c))
                    .unwrap_or_default();
                section = section.bullet(&format!(
                    "{} {} [{}]{} attempts={} {}",
                    d.created_at.format("%Y-%m-%d %H:%M:%S"),
                    d.event.as_str(),
                    status,
                    code,
                    d.attempts,
                    style(d.error.as_deref().unwrap_or("")).dim()
                ));
            }
            section.print();
            Ok(())
        }
        _ => {
            GuideSection::new("autopilot webhook")
                .command("add <url> --events <list>", "Subscribe to task.completed / task.failed")
                .command("list", "List subscriptions")
                .command("remove <id>", "Delete a subscription")
                .command("stats", "Delivery counts across all webhooks")
                .command("deliveries <id>", "Recent deliveries for one webhook")
                .blank()
                .text("add options: --secret <secret>  (generated when omitted)")
                .text("             --rate-limit <n>  (deliveries per minute, default 100)")
                .print();
            Ok(())
        }
    }
}
