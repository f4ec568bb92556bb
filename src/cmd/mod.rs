//! CLI command implementations: inspection and gate resolution over an
//! existing workflow database.

use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};

use smithers::Store;
use smithers_common::HumanStatus;

const CONFIG_TEMPLATE: &str = "\
# Smithers workflow configuration.
#
# db_path = \".smithers/state.db\"
# execution_name = \"workflow\"
# iteration_timeout_ms = 0
";

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let data_dir = project_dir.join(".smithers");
    let config_path = project_dir.join("smithers.toml");
    let already = data_dir.exists() && config_path.exists();

    std::fs::create_dir_all(&data_dir).context("Failed to create .smithers directory")?;
    if !config_path.exists() {
        std::fs::write(&config_path, CONFIG_TEMPLATE).context("Failed to write smithers.toml")?;
    }

    if already {
        println!("Project already initialized.");
    } else {
        println!(
            "{} smithers project ({} and {})",
            style("Initialized").green(),
            data_dir.display(),
            config_path.display()
        );
    }
    Ok(())
}

fn open_store(db_path: &Path) -> Result<Store> {
    if !db_path.exists() {
        bail!(
            "No workflow database at {}. Run a workflow first or pass --db.",
            db_path.display()
        );
    }
    Store::open(db_path).context("Failed to open workflow database")
}

pub fn cmd_status(db_path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let Some(execution) = store.executions().latest()? else {
        println!("No executions recorded.");
        return Ok(());
    };

    println!();
    println!(
        "  {} {} ({})",
        style("Execution:").bold(),
        execution.name,
        &execution.id[..8.min(execution.id.len())]
    );
    let status_styled = match execution.status.as_str() {
        "running" => style(execution.status.clone()).yellow(),
        "completed" => style(execution.status.clone()).green(),
        _ => style(execution.status.clone()).red(),
    };
    println!("  {} {}", style("Status:").bold(), status_styled);
    println!("  {} {}", style("Started:").bold(), execution.started_at);
    if let Some(ended) = &execution.ended_at {
        println!("  {} {}", style("Ended:").bold(), ended);
    }
    if let Some(reason) = &execution.end_reason {
        println!("  {} {}", style("Reason:").bold(), reason);
    }
    if let Some(code) = execution.exit_code {
        println!("  {} {}", style("Exit code:").bold(), code);
    }

    let ralph: Option<u64> = store.state().get("ralphCount")?;
    if let Some(iteration) = ralph {
        println!("  {} {}", style("Iteration:").bold(), iteration);
    }

    let tasks = store.tasks().list(None)?;
    let running = tasks.iter().filter(|t| t.status == "running").count();
    println!(
        "  {} {} total, {} running",
        style("Tasks:").bold(),
        tasks.len(),
        running
    );
    let pending_gates = store.human().pending()?.len();
    if pending_gates > 0 {
        println!(
            "  {} {} pending (see `smithers gates`)",
            style("Gates:").bold(),
            style(pending_gates).yellow()
        );
    }
    println!();
    Ok(())
}

pub fn cmd_state_get(db_path: &Path, key: &str) -> Result<()> {
    let store = open_store(db_path)?;
    match store.state().get_raw(key)? {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("(unset)"),
    }
    Ok(())
}

pub fn cmd_state_history(db_path: &Path, key: &str, limit: u32) -> Result<()> {
    let store = open_store(db_path)?;
    let history = store.state().history(key, limit)?;
    if history.is_empty() {
        println!("No history for key '{}'", key);
        return Ok(());
    }
    for entry in history {
        let new_value = entry
            .new_value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string());
        println!(
            "{}  {}  {}",
            style(entry.ts).dim(),
            new_value,
            style(format!("({})", entry.reason)).dim()
        );
    }
    Ok(())
}

pub fn cmd_tasks(db_path: &Path, iteration: Option<u64>) -> Result<()> {
    let store = open_store(db_path)?;
    let tasks = store.tasks().list(iteration)?;
    if tasks.is_empty() {
        println!("No tasks recorded.");
        return Ok(());
    }
    for task in &tasks {
        let status = match task.status.as_str() {
            "running" => style(task.status.clone()).yellow(),
            "completed" => style(task.status.clone()).green(),
            _ => style(task.status.clone()).red(),
        };
        println!(
            "  [{}] {:<18} {:<28} iter={} {}",
            &task.id[..8.min(task.id.len())],
            task.component_type,
            task.component_name,
            task.iteration,
            status
        );
    }
    println!();
    println!("  {} task(s)", tasks.len());
    Ok(())
}

pub fn cmd_phases(db_path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let phases = store.phases().list()?;
    if phases.is_empty() {
        println!("No phase rows recorded.");
        return Ok(());
    }
    for phase in phases {
        let status = match phase.status.as_str() {
            "active" => style(phase.status.clone()).yellow(),
            "completed" => style(phase.status.clone()).green(),
            _ => style(phase.status.clone()).dim(),
        };
        println!(
            "  {:<20} iter={} {} ({})",
            phase.name, phase.iteration, status, phase.started_at
        );
    }
    Ok(())
}

pub fn cmd_steps(db_path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let steps = store.steps().list()?;
    if steps.is_empty() {
        println!("No step rows recorded.");
        return Ok(());
    }
    for step in steps {
        let status = match step.status.as_str() {
            "running" => style(step.status.clone()).yellow(),
            "completed" => style(step.status.clone()).green(),
            _ => style(step.status.clone()).red(),
        };
        let mut line = format!("  {:<20} {}", step.name, status);
        if let Some(commit) = &step.commit_created {
            line.push_str(&format!(" commit={}", &commit[..8.min(commit.len())]));
        }
        if let Some(error) = &step.error {
            line.push_str(&format!(" {}", style(error).red()));
        }
        println!("{}", line);
    }
    Ok(())
}

pub fn cmd_gates(db_path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let pending = store.human().pending()?;
    if pending.is_empty() {
        println!("No pending gates.");
        return Ok(());
    }
    for gate in pending {
        println!(
            "  [{}] {} ({})",
            style(&gate.id[..8.min(gate.id.len())]).cyan(),
            gate.prompt,
            style(&gate.created_at).dim()
        );
        println!("      resolve with: smithers resolve {} --approve", gate.id);
    }
    Ok(())
}

pub fn cmd_vcs(db_path: &Path) -> Result<()> {
    let store = open_store(db_path)?;
    let events = store.vcs().list()?;
    if events.is_empty() {
        println!("No VCS events recorded.");
        return Ok(());
    }
    for event in events {
        let id = event
            .commit_hash
            .or(event.change_id)
            .unwrap_or_else(|| "-".to_string());
        let short = &id[..8.min(id.len())];
        println!(
            "  {} {:<10} {} {}",
            style(short).cyan(),
            event.vcs_type,
            event.message,
            style(event.ts).dim()
        );
    }
    Ok(())
}

pub fn cmd_tickets(db_path: &Path, status: Option<&str>) -> Result<()> {
    let store = open_store(db_path)?;
    let filter = match status {
        Some(s) => Some(
            smithers_common::TicketStatus::parse(s)
                .ok_or_else(|| anyhow::anyhow!("Unknown ticket status '{}'", s))?,
        ),
        None => None,
    };
    let tickets = store.tickets().list(filter)?;
    if tickets.is_empty() {
        println!("No tickets.");
        return Ok(());
    }
    for ticket in tickets {
        let status = match ticket.status {
            smithers_common::TicketStatus::Done => style(ticket.status.as_str()).green(),
            smithers_common::TicketStatus::Blocked => style(ticket.status.as_str()).red(),
            smithers_common::TicketStatus::InProgress => {
                style(ticket.status.as_str()).yellow()
            }
            smithers_common::TicketStatus::Todo => style(ticket.status.as_str()).dim(),
        };
        println!(
            "  [{}] p{} {:<12} {}",
            &ticket.id[..8.min(ticket.id.len())],
            ticket.priority,
            status,
            ticket.title
        );
        for note in &ticket.progress_notes {
            println!("      - {}", style(note).dim());
        }
    }
    Ok(())
}

pub fn cmd_resolve(
    db_path: &Path,
    id: &str,
    approve: bool,
    reject: bool,
    response: Option<String>,
) -> Result<()> {
    let store = open_store(db_path)?;

    // Accept id prefixes, matching what `gates` prints.
    let pending = store.human().pending()?;
    let matches: Vec<_> = pending.iter().filter(|g| g.id.starts_with(id)).collect();
    let gate = match matches.as_slice() {
        [] => bail!("No pending interaction matches '{}'", id),
        [gate] => (*gate).clone(),
        _ => bail!("'{}' is ambiguous; use more of the id", id),
    };

    let status = if approve {
        HumanStatus::Approved
    } else if reject {
        HumanStatus::Rejected
    } else {
        let options = &["Approve", "Reject", "Cancel the interaction"];
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Resolve: {}", gate.prompt))
            .items(options)
            .default(0)
            .interact()?;
        match selection {
            0 => HumanStatus::Approved,
            1 => HumanStatus::Rejected,
            2 => HumanStatus::Cancelled,
            _ => unreachable!(),
        }
    };

    let payload = response.map(serde_json::Value::String);
    store
        .human()
        .resolve(&gate.id, status, payload.as_ref())
        .context("Failed to resolve interaction")?;
    println!(
        "  {} {} -> {}",
        style("Resolved").green(),
        &gate.id[..8.min(gate.id.len())],
        status.as_str()
    );
    Ok(())
}
