use anyhow::Result;
use chrono::Utc;
use console::style;

use super::ClientArgs;
use crate::core::status::{AgentState, AgentStatus};
use crate::core::terminal::{GuideSection, print_info, print_success, print_table};

fn styled_state(state: AgentState) -> String {
    let label = state.as_str().to_uppercase();
    match state {
        AgentState::Active => style(label).green().bold().to_string(),
        AgentState::Idle => style(label).dim().to_string(),
        AgentState::Degraded => style(label).yellow().bold().to_string(),
        AgentState::Failed | AgentState::Stale => style(label).red().bold().to_string(),
    }
}

fn since(agent: &AgentStatus) -> String {
    let secs = (Utc::now() - agent.last_heartbeat).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    }
}

fn agent_rows(agents: &[AgentStatus]) -> Vec<Vec<String>> {
    agents
        .iter()
        .map(|a| {
            vec![
                a.name.clone(),
                styled_state(a.state),
                format!("{}s", a.current_interval),
                a.tasks_completed.to_string(),
                a.consecutive_failures.to_string(),
                since(a),
            ]
        })
        .collect()
}

const AGENT_HEADERS: &[&str] = &["NAME", "STATE", "INTERVAL", "DONE", "FAILS", "LAST SEEN"];

pub async fn run_status(args: &ClientArgs) -> Result<()> {
    let reply = args.client()?.status().await?;
    let report = reply.data;

    GuideSection::new("Queue")
        .status(
            "Mode",
            if report.queue.parallel_mode {
                "parallel"
            } else {
                "serial"
            },
        )
        .status(
            "Running",
            &format!("{} / {}", report.queue.in_flight, report.queue.concurrency_limit),
        )
        .status(
            "Tasks",
            &report
                .tasks
                .iter()
                .map(|(status, n)| format!("{} {}", n, status))
                .collect::<Vec<_>>()
                .join(", "),
        )
        .print();

    if report.agents.is_empty() {
        print_info("No agents have reported yet.");
    } else {
        println!("{}", style("Agents").bold().underlined());
        print_table(AGENT_HEADERS, &agent_rows(&report.agents));
    }
    println!(
        "\n{}",
        style(format!("({}ms server time)", reply.response_time)).dim()
    );
    Ok(())
}

pub async fn run_health(args: &ClientArgs) -> Result<()> {
    let client = args.client()?;
    let reply = client.health().await?;
    print_success(&format!(
        "{} is up (v{}, uptime {}s)",
        client.base_url(),
        reply.data.version,
        reply.data.uptime_secs
    ));
    Ok(())
}

pub async fn run_agents(args: &ClientArgs) -> Result<()> {
    let client = args.client()?;
    match args.positional.first() {
        Some(name) => {
            let agent = client.controller(name).await?.data;
            GuideSection::new(format!("Agent · {}", agent.name))
                .status("State", &styled_state(agent.state))
                .status("Interval", &format!("{}s", agent.current_interval))
                .status("Tasks completed", &agent.tasks_completed.to_string())
                .status(
                    "Consecutive failures",
                    &agent.consecutive_failures.to_string(),
                )
                .status("Capabilities", &agent.capabilities.join(", "))
                .status("Last seen", &since(&agent))
                .print();
        }
        None => {
            let agents = client.controllers().await?.data;
            if agents.is_empty() {
                print_info("No agents have reported yet.");
            } else {
                print_table(AGENT_HEADERS, &agent_rows(&agents));
            }
        }
    }
    Ok(())
}
