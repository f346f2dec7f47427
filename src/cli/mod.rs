mod agents;
mod serve;
mod tasks;
mod webhooks;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::client::{ControlClient, DEFAULT_API_URL};
use crate::core::terminal::{self, GuideSection, print_error};

pub const API_URL_ENV: &str = "AUTOPILOT_API_URL";
pub const TOKEN_ENV: &str = "AUTOPILOT_TOKEN";

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Daemon")
        .command("serve [--config <path>]", "Run agents, orchestrator and API")
        .print();

    GuideSection::new("Inspect")
        .command("status", "Agents, queue settings and task counts")
        .command("health", "Liveness of the control API")
        .command("agents [name]", "List agents or show one")
        .print();

    GuideSection::new("Tasks")
        .command("task submit <type> [options]", "Queue a task")
        .command("task get <id>", "Show one task")
        .command("task list [--status s] [--type t]", "List tasks in dispatch order")
        .command("task cancel <id>", "Cancel a queued or running task")
        .print();

    GuideSection::new("Webhooks")
        .command("webhook add <url> --events <list>", "Subscribe to task events")
        .command("webhook list", "List subscriptions")
        .command("webhook remove <id>", "Delete a subscription")
        .print();

    GuideSection::new("Client options")
        .text(format!(
            "--api-url <url>   Control API (default {}, env {})",
            DEFAULT_API_URL, API_URL_ENV
        ))
        .text(format!("--token <token>   Bearer token (env {})", TOKEN_ENV))
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("autopilot").green()
    );
}

/// Connection flags shared by every client command, plus the remaining
/// positional arguments and unrecognised `--key value` options in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientArgs {
    pub api_url: String,
    pub token: Option<String>,
    pub positional: Vec<String>,
    pub options: Vec<(String, Option<String>)>,
}

impl ClientArgs {
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn options_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.options
            .iter()
            .filter(move |(k, _)| k == name)
            .filter_map(|(_, v)| v.as_deref())
    }

    pub fn flag(&self, name: &str) -> bool {
        self.options.iter().any(|(k, _)| k == name)
    }

    pub fn client(&self) -> Result<ControlClient> {
        Ok(ControlClient::new(&self.api_url)?.with_token(self.token.clone()))
    }
}

/// Flags that never take a value.
const SWITCHES: &[&str] = &["--serial", "--json"];

pub(crate) fn parse_client_args(args: &[String], start: usize) -> ClientArgs {
    let mut api_url = std::env::var(API_URL_ENV).unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    let mut token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
    let mut positional = Vec::new();
    let mut options = Vec::new();

    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--api-url" => {
                if i + 1 < args.len() {
                    api_url = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--token" => {
                if i + 1 < args.len() {
                    token = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ if arg.starts_with("--") && SWITCHES.contains(&arg) => {
                options.push((arg.to_string(), None));
                i += 1;
            }
            _ if arg.starts_with("--") => {
                if i + 1 < args.len() {
                    options.push((arg.to_string(), Some(args[i + 1].clone())));
                    i += 2;
                } else {
                    options.push((arg.to_string(), None));
                    i += 1;
                }
            }
            _ => {
                positional.push(arg.to_string());
                i += 1;
            }
        }
    }
    ClientArgs {
        api_url,
        token,
        positional,
        options,
    }
}

pub(crate) fn parse_config_flag(args: &[String], start: usize) -> Option<PathBuf> {
    let mut i = start;
    while i < args.len() {
        if args[i] == "--config" || args[i] == "-c" {
            return args.get(i + 1).map(PathBuf::from);
        }
        i += 1;
    }
    None
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "serve" | "daemon" => serve::run_serve(parse_config_flag(&args, 2)).await,
        "status" => agents::run_status(&parse_client_args(&args, 2)).await,
        "health" => agents::run_health(&parse_client_args(&args, 2)).await,
        "agents" | "agent" | "controllers" => {
            agents::run_agents(&parse_client_args(&args, 2)).await
        }
        "task" | "tasks" => tasks::run_task_command(&args).await,
        "webhook" | "webhooks" => webhooks::run_webhook_command(&args).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "--version" | "-V" | "version" => {
            println!("autopilot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        cmd => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
