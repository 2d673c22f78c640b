//! # The per-task supervisor loop.
//!
//! One worker per active task. Each iteration launches the command, pumps its
//! stdout and stderr into the per-task logger, waits for exit or an
//! asynchronous stop/refresh/shutdown event, updates the counters, and applies
//! the post-execution delay. The worker only takes the scheduler lock to
//! commit updated dynamic state at the end of an iteration.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::messages::{MessageLog, Severity};
use crate::scheduler::logger::{LogMessage, TaskLogger};
use crate::scheduler::task::{Dynamic, Task, TaskSignalReceivers};
use crate::scheduler::SchedulerContext;

/// What ended the wait on a running child.
enum Outcome {
    /// The daemon is shutting down.
    Cancelled,
    /// The child exited with this code.
    Exited(i32),
    /// The per-task logger reported a write failure.
    LoggingFailed,
    /// A stop signal arrived, carrying its reason.
    Stopped(String),
}

/// Starts the supervisor worker for a freshly scheduled task.
pub fn spawn_supervisor(ctx: SchedulerContext, task: Task, receivers: TaskSignalReceivers) {
    let lifecycle = ctx.lifecycle.clone();
    lifecycle.start_worker(run_supervisor(ctx, task, receivers));
}

async fn run_supervisor(ctx: SchedulerContext, task: Task, receivers: TaskSignalReceivers) {
    let label = task.computed.log_label.clone();

    let mut logger = match TaskLogger::spawn(
        &ctx.files,
        &ctx.lifecycle,
        task.computed.id,
        task.capture_stdout,
    )
    .await
    {
        Ok(logger) => logger,
        Err(_) => {
            // Without a logger the task cannot run; deactivate the record so
            // no active task is left behind without a worker.
            ctx.messages
                .add(Severity::Error, Some(&label), "failed to create per-task logger");
            let mut state = ctx.scheduler.lock().await;
            let mut dynamic = state
                .tasks()
                .iter()
                .find(|t| t.computed.id == task.computed.id)
                .map(|t| t.dynamic.clone())
                .unwrap_or_default();
            dynamic.is_deactivated = true;
            dynamic.deactivated_reason =
                "failed to create per-task logger. Deactivating.".to_string();
            state.commit_dynamic(task.computed.id, &dynamic);
            return;
        }
    };

    // The worker mutates a shadow copy and commits it to the record under the
    // scheduler lock once per iteration.
    let mut dynamic = {
        let state = ctx.scheduler.lock().await;
        state
            .tasks()
            .iter()
            .find(|t| t.computed.id == task.computed.id)
            .map(|t| t.dynamic.clone())
            .unwrap_or_else(|| task.dynamic.clone())
    };

    let mut stop_rx = receivers.stop;
    let mut refresh_rx = receivers.refresh;

    logger.diagnostic("Task information:").await;
    logger.diagnostic(format!("  Id: {}", task.computed.id)).await;
    logger
        .diagnostic(format!("  FriendlyName: {}", task.friendly_name))
        .await;
    logger.diagnostic(format!("  Cmdline: {:?}", task.cmdline)).await;
    logger.diagnostic(format!("  Cwd: {}", task.cwd)).await;
    logger
        .diagnostic(format!("  Display: {}", task.display.label_long()))
        .await;

    while !dynamic.is_deactivated {
        // Every execution gets its own cancellation scope; cancelling it
        // kills the child, which EOFs the pipes and unwinds the pumps.
        let exec_token = ctx.lifecycle.token().child_token();

        let mut cmd = Command::new(&task.cmdline[0]);
        cmd.args(&task.cmdline[1..])
            .env_clear()
            .envs(task.env.iter().filter_map(|e| e.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !task.cwd.is_empty() {
            cmd.current_dir(&task.cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(_) => {
                deactivate(
                    &logger,
                    &ctx.messages,
                    &label,
                    &mut dynamic,
                    Severity::Error,
                    "Failed to start the command.",
                )
                .await;
                break;
            }
        };
        let Some(stdout_pipe) = child.stdout.take() else {
            deactivate(
                &logger,
                &ctx.messages,
                &label,
                &mut dynamic,
                Severity::Error,
                "Failed to create stdout pipe.",
            )
            .await;
            break;
        };
        let Some(stderr_pipe) = child.stderr.take() else {
            deactivate(
                &logger,
                &ctx.messages,
                &label,
                &mut dynamic,
                Severity::Error,
                "Failed to create stderr pipe.",
            )
            .await;
            break;
        };
        logger.diagnostic("Command started.").await;

        let stdout_pump = ctx
            .lifecycle
            .start_worker(pump_output(stdout_pipe, logger.sender()));
        let stderr_pump = ctx
            .lifecycle
            .start_worker(pump_output(stderr_pipe, logger.sender()));

        // Reap the child in a separate worker once both pumps saw EOF;
        // reaping first would close the pipes under the pumps. Cancellation
        // kills the child instead of abandoning it.
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let wait_token = exec_token.clone();
        ctx.lifecycle.start_worker(async move {
            let pumps = futures::future::join(stdout_pump, stderr_pump);
            tokio::pin!(pumps);
            let mut kill_requested = false;
            loop {
                tokio::select! {
                    _ = &mut pumps => break,
                    _ = wait_token.cancelled(), if !kill_requested => {
                        let _ = child.start_kill();
                        kill_requested = true;
                    }
                }
            }
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = exit_tx.send(code).await;
        });

        let outcome = tokio::select! {
            _ = exec_token.cancelled() => Outcome::Cancelled,
            Some(code) = exit_rx.recv() => Outcome::Exited(code),
            _ = logger.write_failed() => Outcome::LoggingFailed,
            Some(reason) = stop_rx.fired() => Outcome::Stopped(reason),
        };

        let mut command_success = false;
        match outcome {
            Outcome::Cancelled => {
                deactivate(
                    &logger,
                    &ctx.messages,
                    &label,
                    &mut dynamic,
                    Severity::Info,
                    "Backend killed.",
                )
                .await;
            }
            Outcome::Exited(code) => {
                logger
                    .diagnostic(format!("Command ended with code {code}."))
                    .await;
                dynamic.last_exit_value = code;
                command_success = code == 0;
            }
            Outcome::LoggingFailed => {
                deactivate(
                    &logger,
                    &ctx.messages,
                    &label,
                    &mut dynamic,
                    Severity::Error,
                    "Failed logging.",
                )
                .await;
            }
            Outcome::Stopped(reason) => {
                deactivate(
                    &logger,
                    &ctx.messages,
                    &label,
                    &mut dynamic,
                    Severity::Info,
                    format!("Task killed ({reason})."),
                )
                .await;
            }
        }

        // Close out this execution in the logs; the logger reports the path
        // of the stdout file it just rotated away.
        let mut stdout_path = logger.end_execution().await;
        if !stdout_path.is_empty() && !Path::new(&stdout_path).exists() {
            ctx.messages.add(
                Severity::Error,
                Some(&label),
                format!("Incorrect stdout file path from per-task logger: {stdout_path}"),
            );
            stdout_path.clear();
        }
        dynamic.last_stdout_file_path = stdout_path;

        dynamic.run_count += 1;
        if command_success {
            dynamic.subsequent_failure_count = 0;
        } else {
            dynamic.failure_count += 1;
            dynamic.subsequent_failure_count += 1;
        }

        if task.max_subsequent_failures >= 0
            && dynamic.subsequent_failure_count >= task.max_subsequent_failures as u64
        {
            deactivate(
                &logger,
                &ctx.messages,
                &label,
                &mut dynamic,
                Severity::Info,
                format!(
                    "Task reached subsequent failure count limit of {}.",
                    task.max_subsequent_failures
                ),
            )
            .await;
        }

        {
            let mut state = ctx.scheduler.lock().await;
            state.commit_dynamic(task.computed.id, &dynamic);
        }

        // Make sure the child is gone before the re-run delay; on the stop
        // and logging-failure paths it may still be running.
        exec_token.cancel();

        if !dynamic.is_deactivated {
            let delay = if command_success {
                task.delay_after_success_ms
            } else {
                task.delay_after_failure_ms
            };
            let sleep = tokio::time::sleep(Duration::from_millis(delay));
            tokio::pin!(sleep);

            tokio::select! {
                _ = &mut sleep => {}
                Some(()) = refresh_rx.fired() => {}
                Some(reason) = stop_rx.fired() => {
                    deactivate(
                        &logger,
                        &ctx.messages,
                        &label,
                        &mut dynamic,
                        Severity::Info,
                        format!("Task killed ({reason})."),
                    )
                    .await;
                }
                _ = ctx.lifecycle.token().cancelled() => {
                    deactivate(
                        &logger,
                        &ctx.messages,
                        &label,
                        &mut dynamic,
                        Severity::Info,
                        "Backend killed.",
                    )
                    .await;
                }
            }
        }
    }

    // Commit whatever state the loop ended with.
    {
        let mut state = ctx.scheduler.lock().await;
        state.commit_dynamic(task.computed.id, &dynamic);
    }

    logger.close().await;
}

/// Forwards one pipe line-by-line into the per-task logger.
async fn pump_output<R>(pipe: R, tx: mpsc::Sender<LogMessage>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(LogMessage::Stdout(line)).await.is_err() {
            break;
        }
    }
}

/// Marks the task deactivated with the given reason and records it in both
/// the task log and the daemon message log.
async fn deactivate(
    logger: &TaskLogger,
    messages: &MessageLog,
    label: &str,
    dynamic: &mut Dynamic,
    severity: Severity,
    content: impl Into<String>,
) {
    let content = format!("{} Deactivating.", content.into());
    dynamic.is_deactivated = true;
    dynamic.deactivated_reason = content.clone();
    messages.add(severity, Some(label), content.as_str());
    logger.diagnostic(content).await;
}
