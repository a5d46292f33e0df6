use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::controller::AuditController;
use crate::audit::error::NextStep;
use crate::audit::poller::Notification;
use crate::audit::session::{CompletedAudit, SessionEvent, SessionOutcome, SessionSettings};
use crate::audit::task::{AuditTask, AuditType, TaskId};
use crate::backend::EdgeFunctionBackend;
use crate::cli::config::ClientConfig;

/// Build a controller for the configured backend
fn connect(config: &ClientConfig) -> Result<AuditController> {
    let backend = EdgeFunctionBackend::new(&config.backend)
        .context("Failed to create backend client")?;
    Ok(AuditController::new(Arc::new(backend), SessionSettings::from(&config.polling)))
}

/// One progress line for a task
fn describe_progress(task: &AuditTask) -> String {
    let info = task.stage.info();
    let mut line = format!(
        "[{}] {:>3}% {} - {} ({}/{} pages)",
        task.task_id,
        task.progress,
        info.title,
        info.description,
        task.pages_scanned,
        task.estimated_total_pages
    );
    if let Some(current) = &task.current_url {
        line.push_str(&format!(" {}", current));
    }
    line
}

/// Print session events until every session is gone
fn spawn_printer(mut events: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_line = String::new();
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Progress(task) => {
                    let line = describe_progress(&task);
                    if line != last_line {
                        println!("{}", line);
                        last_line = line;
                    }
                }
                SessionEvent::Partial(task_id, view) => {
                    println!(
                        "[{}] partial results: {}% complete, {} sections",
                        task_id,
                        view.completion_percentage,
                        view.data.len()
                    );
                }
                SessionEvent::TransientWarning { task_id, consecutive } => {
                    eprintln!("[{}] {} status checks failed in a row, still trying", task_id, consecutive);
                }
                SessionEvent::Notice(task_id, Notification::Success(message)) => {
                    println!("[{}] {}", task_id, message);
                }
                SessionEvent::Notice(task_id, Notification::Failure(message)) => {
                    eprintln!("[{}] {}", task_id, message);
                }
                SessionEvent::Finished(task_id, Ok(())) => {
                    debug!("Session for {} finished", task_id);
                }
                SessionEvent::Finished(task_id, Err(e)) => {
                    debug!("Session for {} ended with: {}", task_id, e);
                }
            }
        }
    })
}

/// Print a finished audit
fn print_completed(completed: &CompletedAudit) {
    let results = &completed.results;
    println!("Task ID: {}", completed.task.task_id);
    println!("URL: {}", results.url);
    println!("Pages Scanned: {}", completed.task.pages_scanned);
    if let Some(pages) = results.page_count() {
        println!("Pages Analyzed: {}", pages);
    }
    println!("Recommendations: {}", results.recommendations.as_array().map_or(0, Vec::len));
    println!("Previous Audits: {}", results.history.as_array().map_or(0, Vec::len));
    println!(
        "Status Checks: {} ({} failed, avg {} ms)",
        completed.metrics.attempts, completed.metrics.failures, completed.metrics.average_round_trip_ms
    );
}

/// Report an outcome; errors carry a hint about what to do next
fn report(outcome: SessionOutcome, task_id: Option<&TaskId>) -> Result<()> {
    match outcome {
        Ok(completed) => {
            print_completed(&completed);
            Ok(())
        }
        Err(e) => {
            match (e.next_step(), task_id) {
                (NextStep::RetryMaterialize, Some(task_id)) => {
                    eprintln!("Use `auditctl results {}` to fetch the results again", task_id);
                }
                (NextStep::Retry, _) => {
                    eprintln!("Use `auditctl audit --retries N` to submit again automatically");
                }
                _ => {}
            }
            Err(e.into())
        }
    }
}

/// Submit an audit and follow it to the end, resubmitting on timeout or
/// backend failure while retries remain
pub async fn audit(url: String, audit_type: Option<AuditType>, max_pages: Option<u32>, retries: u32) -> Result<()> {
    let config = ClientConfig::load_default()?;

    let mut options = config.audit.options();
    if let Some(t) = audit_type {
        options.audit_type = t;
    }
    if let Some(m) = max_pages {
        options.max_pages = m;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let controller = connect(&config)?.with_events(tx);
    let printer = spawn_printer(rx);

    let mut outcome = controller.run(&url, &options).await;
    let mut retries_left = retries;
    while let Err(e) = &outcome {
        if e.next_step() != NextStep::Retry || retries_left == 0 {
            break;
        }
        retries_left -= 1;
        warn!("{}; resubmitting ({} retries left)", e, retries_left);
        match controller.retry(None, &url, &options).await {
            Some(next) => outcome = next,
            None => break,
        }
    }

    controller.shutdown().await;
    drop(controller);
    printer.await.ok();

    report(outcome, None)
}

/// Show the status of a task once
pub async fn status(task_id: String) -> Result<()> {
    let config = ClientConfig::load_default()?;
    let controller = connect(&config)?;

    let task = controller.status(&TaskId::new(task_id)).await?;
    let info = task.stage.info();

    println!("Task ID: {}", task.task_id);
    println!("URL: {}", task.url);
    println!("Status: {}", task.status);
    println!("Stage: {} - {}", info.title, info.description);
    println!("Progress: {}%", task.progress);
    println!("Pages Scanned: {}/{}", task.pages_scanned, task.estimated_total_pages);
    if let Some(current) = &task.current_url {
        println!("Current URL: {}", current);
    }
    if let Some(message) = &task.error_message {
        println!("Error: {}", message);
    }

    Ok(())
}

/// Follow a task submitted earlier
pub async fn watch(task_id: String, url: String) -> Result<()> {
    let config = ClientConfig::load_default()?;

    let (tx, rx) = mpsc::unbounded_channel();
    let controller = connect(&config)?.with_events(tx);
    let printer = spawn_printer(rx);

    let task_id = TaskId::new(task_id);
    let mut session = controller.track(task_id.clone(), &url).await;
    let outcome = session.outcome().await;

    controller.shutdown().await;
    drop(controller);
    printer.await.ok();

    report(outcome, Some(&task_id))
}

/// Cancel a task on the backend
pub async fn cancel(task_id: String) -> Result<()> {
    let config = ClientConfig::load_default()?;
    let controller = connect(&config)?;

    let response = controller.cancel_remote(&TaskId::new(task_id.clone())).await?;
    if response.success {
        println!("Task {} cancelled", task_id);
    } else {
        println!(
            "Task {} was not cancelled: {}",
            task_id,
            response.message.as_deref().unwrap_or("no reason given")
        );
    }

    Ok(())
}

/// Fetch the results of a completed task
pub async fn results(task_id: String, output: Option<PathBuf>) -> Result<()> {
    let config = ClientConfig::load_default()?;
    let controller = connect(&config)?;

    let results = controller.rematerialize(&TaskId::new(task_id)).await?;
    let json = serde_json::to_string_pretty(&results).context("Failed to serialize results")?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .context(format!("Failed to write results to: {}", path.display()))?;
            info!("Results written to: {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = ClientConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config).context("Failed to serialize configuration")?);

    Ok(())
}

/// Make sure a configuration file exists and say where it is
pub async fn init_config() -> Result<()> {
    ClientConfig::load_default()?;
    println!("Configuration file: {}", ClientConfig::default_path().display());

    Ok(())
}
