use anyhow::{Result, bail};
use console::style;

use super::{ClientArgs, parse_client_args};
use crate::client::{SubmitTask, TaskQuery};
use crate::core::orchestrator::CancelOutcome;
use crate::core::tasks::{Parameters, Priority, Task, TaskStatus};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_table};

pub async fn run_task_command(args: &[String]) -> Result<()> {
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    let parsed = parse_client_args(args, 3);

    match sub_cmd {
        "submit" => submit(&parsed).await,
        "get" | "show" => {
            let Some(id) = parsed.positional.first() else {
                bail!("usage: autopilot task get <id>");
            };
            let task = parsed.client()?.get_task(id).await?.data;
            print_task(&task);
            Ok(())
        }
        "list" | "ls" => list(&parsed).await,
        "cancel" => {
            let Some(id) = parsed.positional.first() else {
                bail!("usage: autopilot task cancel <id>");
            };
            let reply = parsed.client()?.cancel_task(id).await?.data;
            match reply.outcome {
                CancelOutcome::Cancelled => print_success(&format!("Task {} cancelled.", reply.id)),
                CancelOutcome::CancellationRequested => print_info(&format!(
                    "Task {} is running; cancellation requested.",
                    reply.id
                )),
            }
            Ok(())
        }
        _ => {
            GuideSection::new("autopilot task")
                .command("submit <type>", "Queue a task")
                .command("get <id>", "Show one task")
                .command("list", "List tasks")
                .command("cancel <id>", "Cancel a task")
                .blank()
                .text("submit options: --target <subject>  --priority low|normal|high|critical")
                .text("                --param key=value (repeatable)  --params '<json object>'")
                .text("                --timeout <secs>  --serial")
                .text("list options:   --status <status>  --type <type>  --limit <n>")
                .print();
            Ok(())
        }
    }
}

/// `key=value`; the value is read as JSON when it parses, else as a string.
pub(crate) fn parse_param(raw: &str) -> Result<(String, serde_json::Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("invalid --param '{}' (expected key=value)", raw);
    };
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

pub(crate) fn build_submission(args: &ClientArgs) -> Result<SubmitTask> {
    let Some(task_type) = args.positional.first() else {
        bail!("usage: autopilot task submit <type> [options]");
    };
    let mut submission = SubmitTask::new(task_type.clone());
    submission.target = args.option("--target").map(str::to_string);

    if let Some(name) = args.option("--priority") {
        submission.priority = Some(
            Priority::from_name(name)
                .ok_or_else(|| anyhow::anyhow!("invalid priority '{}'", name))?,
        );
    }

    let mut params = match args.option("--params") {
        Some(raw) => Parameters::from_json_str(raw)?,
        None => Parameters::new(),
    };
    for raw in args.options_named("--param") {
        let (key, value) = parse_param(raw)?;
        params.insert(key, value)?;
    }
    if !params.is_empty() {
        submission.parameters = Some(params);
    }

    if let Some(timeout) = args.option("--timeout") {
        submission.timeout_secs = Some(timeout.parse()?);
    }
    if args.flag("--serial") {
        submission.parallel_enabled = Some(false);
    }
    Ok(submission)
}

async fn submit(args: &ClientArgs) -> Result<()> {
    let submission = build_submission(args)?;
    let reply = args.client()?.submit_task(&submission).await?;
    print_success(&format!(
        "Queued {} ({} priority)",
        reply.data.id,
        reply.data.priority.as_str()
    ));
    if reply.attempts > 1 {
        print_info(&format!("Accepted after {} attempts.", reply.attempts));
    }
    Ok(())
}

async fn list(args: &ClientArgs) -> Result<()> {
    let mut query = TaskQuery::default();
    if let Some(status) = args.option("--status") {
        match TaskStatus::from_status(status) {
            Some(s) => query.status = Some(s),
            None => {
                print_error(&format!("Unknown status '{}'", status));
                return Ok(());
            }
        }
    }
    query.task_type = args.option("--type").map(str::to_string);
    if let Some(limit) = args.option("--limit") {
        query.limit = Some(limit.parse()?);
    }

    let tasks = args.client()?.list_tasks(&query).await?.data;
    if tasks.is_empty() {
        print_info("No tasks.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = tasks
        .iter()
        .map(|t| {
            vec![
                t.id.clone(),
                t.task_type.clone(),
                t.priority.as_str().to_string(),
                styled_status(t.status),
                t.assigned_agent.clone().unwrap_or_else(|| "-".into()),
                t.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "TYPE", "PRIORITY", "STATUS", "AGENT", "CREATED"], &rows);
    Ok(())
}

fn styled_status(status: TaskStatus) -> String {
    let label = status.as_str();
    match status {
        TaskStatus::Queued => style(label).dim().to_string(),
        TaskStatus::Running => style(label).cyan().bold().to_string(),
        TaskStatus::Succeeded => style(label).green().to_string(),
        TaskStatus::Failed => style(label).red().bold().to_string(),
        TaskStatus::Cancelled => style(label).yellow().to_string(),
    }
}

fn print_task(task: &Task) {
    let mut section = GuideSection::new(format!("Task · {}", task.id))
        .status("Type", &task.task_type)
        .status("Status", &styled_status(task.status))
        .status("Priority", task.priority.as_str())
        .status("Parallel", if task.parallel_enabled { "yes" } else { "no" })
        .status("Created", &task.created_at.to_rfc3339());
    if let Some(target) = &task.target {
        section = section.status("Target", target);
    }
    if let Some(agent) = &task.assigned_agent {
        section = section.status("Agent", agent);
    }
    if let Some(secs) = task.timeout_override {
        section = section.status("Timeout", &format!("{}s", secs));
    }
    if let Some(started) = task.started_at {
        section = section.status("Started", &started.to_rfc3339());
    }
    if let Some(done) = task.completed_at {
        section = section.status("Completed", &done.to_rfc3339());
    }
    for (key, value) in task.parameters.as_env_pairs() {
        section = section.bullet(&format!("{} = {}", key, value));
    }
    if let Some(result) = &task.result {
        section = section.blank().text(result.clone());
    }
    if let Some(error) = &task.error {
        section = section.blank().text(style(error).red().to_string());
    }
    section.print();
}
