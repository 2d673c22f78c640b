//! # The daemon: connection dispatch and request handling.
//!
//! [`run_server`] assembles every component, binds the TCP listener, and runs
//! the accept loop until cancellation or a listener failure. Each connection
//! gets its own handler worker: an optional handshake check followed by a
//! frame-dispatch loop. A handler locks the scheduler once per request, so
//! every request is a single atomic transaction against the task set.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::Config;
use crate::display::{DisplayBackend, DisplayRegistry};
use crate::error::DaemonError;
use crate::fnv;
use crate::lifecycle::{wait_for_shutdown_signal, Lifecycle};
use crate::messages::{MessageLog, Severity};
use crate::paths::FilePathProvider;
use crate::protocol::types::{
    validate_schedule_request, ListRequest, ListResponseItem, RefreshRequest, RefreshResponse,
    RescheduleRequest, ScheduleRequest, ScheduleResponse, ScheduleStatus, StopRequest,
    StopResponse, StopStatus, TaskActivity,
};
use crate::protocol::{recv_frame, send_frame, Frame, ProtocolError, Tag};
use crate::scheduler::{ScheduleOutcome, Scheduler, SchedulerContext, Task};

/// Runs the daemon until a shutdown signal or a listener failure.
///
/// Returns `Ok(())` on graceful shutdown; the caller maps errors to a nonzero
/// exit code.
pub async fn run_server(
    config: Config,
    backend: Arc<dyn DisplayBackend>,
) -> Result<(), DaemonError> {
    // The daemon itself runs headless; supervised children get their own
    // display variables per task.
    std::env::remove_var("DISPLAY");
    std::env::remove_var("WAYLAND_DISPLAY");

    let files = Arc::new(FilePathProvider::new()?);
    let messages = Arc::new(
        MessageLog::new(files.message_log_file()).map_err(DaemonError::MessageLog)?,
    );

    let lifecycle = Lifecycle::new();
    {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let token = lifecycle.token().clone();
            tokio::select! {
                _ = wait_for_shutdown_signal() => lifecycle.cancel(),
                _ = token.cancelled() => {}
            }
        });
    }

    let handshake_value = match fnv::hash_current_exe() {
        Ok(value) => Some(value),
        Err(err) => {
            messages.add(
                Severity::Error,
                None,
                format!("Failed to hash own executable; handshake validation disabled: {err}"),
            );
            None
        }
    };

    let scheduler = Scheduler::new();
    let displays = DisplayRegistry::new(backend, config.display_kill_grace);
    let ctx = SchedulerContext {
        scheduler: scheduler.clone(),
        files: files.clone(),
        displays: displays.clone(),
        lifecycle: lifecycle.clone(),
        messages: messages.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .map_err(DaemonError::Bind)?;

    // The mirror file closes as soon as shutdown starts; the cache directory
    // only goes away once every worker has drained.
    {
        let messages = messages.clone();
        lifecycle.start_worker_after_cancel(async move {
            messages.cleanup();
        });
    }

    spawn_trimmer(&config, &ctx);

    let result = accept_loop(&config, &ctx, listener, handshake_value).await;

    lifecycle.cancel();
    lifecycle.join().await;
    let _ = files.cleanup();

    result
}

/// Periodic maintenance: age out messages, spill deactivated tasks, drop
/// deactivated displays.
fn spawn_trimmer(config: &Config, ctx: &SchedulerContext) {
    let interval = config.trim_interval();
    let message_max_age = config.message_max_age;
    let ctx = ctx.clone();
    ctx.lifecycle.clone().start_worker(async move {
        let token = ctx.lifecycle.token().clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => return,
            }

            ctx.messages.trim(message_max_age);
            {
                let mut state = ctx.scheduler.lock().await;
                state.trim(&ctx.files, &ctx.messages);
            }
            ctx.displays.trim().await;
        }
    });
}

async fn accept_loop(
    config: &Config,
    ctx: &SchedulerContext,
    listener: tokio::net::TcpListener,
    handshake_value: Option<u64>,
) -> Result<(), DaemonError> {
    let validate_handshake = config.validate_handshake && handshake_value.is_some();
    let handshake_value = handshake_value.unwrap_or_default();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = ctx.lifecycle.token().cancelled() => return Ok(()),
        };

        let (stream, addr) = match accepted {
            Ok(conn) => conn,
            Err(err) => return Err(DaemonError::Accept(err)),
        };

        if !config.allow_remote && !addr.ip().is_loopback() {
            ctx.messages
                .add(Severity::Error, None, "Rejecting remote connection");
            continue;
        }

        let ctx = ctx.clone();
        ctx.lifecycle.clone().start_worker(async move {
            handle_connection(ctx, stream, validate_handshake, handshake_value).await;
        });
    }
}

/// Serves one connection until the peer goes away, a frame fails to decode,
/// or the daemon shuts down.
async fn handle_connection(
    ctx: SchedulerContext,
    mut stream: TcpStream,
    validate_handshake: bool,
    handshake_value: u64,
) {
    let token = ctx.lifecycle.token().clone();

    if validate_handshake {
        let frame = tokio::select! {
            frame = recv_frame(&mut stream) => frame,
            _ = token.cancelled() => return,
        };
        let presented = frame.and_then(|f| f.decode::<u64>(Tag::Handshake));
        match presented {
            Ok(value) if value == handshake_value => {}
            _ => {
                ctx.messages.add(
                    Severity::Info,
                    None,
                    "Rejecting client request due to invalid handshake",
                );
                return;
            }
        }
    }

    loop {
        let frame = tokio::select! {
            frame = recv_frame(&mut stream) => frame,
            _ = token.cancelled() => return,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => return,
        };

        let handled = dispatch(&ctx, &mut stream, frame).await;
        if handled.is_err() {
            return;
        }
    }
}

async fn dispatch(
    ctx: &SchedulerContext,
    stream: &mut TcpStream,
    frame: Frame,
) -> Result<(), ProtocolError> {
    match frame.tag {
        Tag::Schedule => {
            let request = frame.decode::<ScheduleRequest>(Tag::Schedule)?;
            let response = cmd_schedule(ctx, request).await;
            send_frame(stream, &Frame::encode(Tag::ScheduleResponse, &response)?).await
        }
        Tag::List => {
            let request = frame.decode::<ListRequest>(Tag::List)?;
            let response = cmd_list(ctx, request).await;
            send_frame(stream, &Frame::encode(Tag::ListResponse, &response)?).await
        }
        Tag::Log => {
            frame.decode_void(Tag::Log)?;
            let response = ctx.messages.render_all();
            send_frame(stream, &Frame::encode(Tag::LogResponse, &response)?).await
        }
        Tag::QueryTaskActive => {
            let task_id = frame.decode::<i64>(Tag::QueryTaskActive)?;
            let response = cmd_query_task_active(ctx, task_id).await;
            send_frame(
                stream,
                &Frame::encode(Tag::QueryTaskActiveResponse, &response)?,
            )
            .await
        }
        Tag::Refresh => {
            let request = frame.decode::<RefreshRequest>(Tag::Refresh)?;
            let response = cmd_refresh(ctx, request).await;
            send_frame(stream, &Frame::encode(Tag::RefreshResponse, &response)?).await
        }
        Tag::Reschedule => {
            let request = frame.decode::<RescheduleRequest>(Tag::Reschedule)?;
            let response = cmd_reschedule(ctx, request).await;
            send_frame(stream, &Frame::encode(Tag::RescheduleResponse, &response)?).await
        }
        Tag::Stop => {
            let request = frame.decode::<StopRequest>(Tag::Stop)?;
            let response = cmd_stop(ctx, request).await;
            send_frame(stream, &Frame::encode(Tag::StopResponse, &response)?).await
        }
        other => {
            ctx.messages.add(
                Severity::Info,
                None,
                "Rejecting client request due to invalid packet",
            );
            Err(ProtocolError::UnexpectedTag {
                expected: Tag::Schedule,
                got: other,
            })
        }
    }
}

pub async fn cmd_schedule(ctx: &SchedulerContext, request: ScheduleRequest) -> ScheduleResponse {
    if let Err(reason) = validate_schedule_request(&request) {
        ctx.messages.add(
            Severity::Error,
            None,
            format!("Rejecting schedule request: {reason}"),
        );
        return ScheduleResponse {
            status: ScheduleStatus::Unknown,
            id: 0,
            log_file: String::new(),
        };
    }

    let task = Task::from(request);
    let mut state = ctx.scheduler.lock().await;
    let outcome = state.try_schedule(task, ctx).await;
    drop(state);

    report_schedule_outcome(ctx, "schedule", &outcome);
    ScheduleResponse {
        status: outcome.status,
        id: outcome.id,
        log_file: outcome.log_file,
    }
}

fn report_schedule_outcome(ctx: &SchedulerContext, verb: &str, outcome: &ScheduleOutcome) {
    let label = format!("task id={}", outcome.id);
    match outcome.status {
        ScheduleStatus::Success => {
            ctx.messages
                .add(Severity::Info, Some(&label), format!("Accepted {verb} request"));
        }
        ScheduleStatus::AlreadyRunning => {
            ctx.messages.add(
                Severity::Error,
                Some(&label),
                format!("Cannot {verb}: an identical task is already running"),
            );
        }
        ScheduleStatus::NameDisplayAlreadyRunning => {
            ctx.messages.add(
                Severity::Error,
                Some(&label),
                format!("Cannot {verb}: a task with this friendly name is already running on this display"),
            );
        }
        ScheduleStatus::InvalidDisplay => {
            ctx.messages.add(
                Severity::Error,
                Some(&label),
                format!("Cannot {verb}: invalid display"),
            );
        }
        ScheduleStatus::TaskNotFound => {
            ctx.messages.add(
                Severity::Error,
                Some(&label),
                format!("Cannot {verb}: task not found"),
            );
        }
        ScheduleStatus::TaskNotDeactivated => {
            ctx.messages.add(
                Severity::Error,
                Some(&label),
                format!("Cannot {verb}: task is not deactivated"),
            );
        }
        ScheduleStatus::Unknown => {
            ctx.messages.add(
                Severity::Error,
                Some(&label),
                format!("Cannot {verb}: unknown error"),
            );
        }
    }
}

pub async fn cmd_list(ctx: &SchedulerContext, request: ListRequest) -> Vec<ListResponseItem> {
    let state = ctx.scheduler.lock().await;

    let matches = |task: &Task| {
        request.filter.matches(
            task.computed.id,
            &task.friendly_name,
            &task.display,
            &task.tags,
        )
    };

    let mut tasks: Vec<Task> = state
        .tasks()
        .iter()
        .filter(|t| !t.dynamic.is_deactivated)
        .filter(|t| matches(t))
        .cloned()
        .collect();

    if request.include_deactivated_always || (request.include_deactivated && tasks.is_empty()) {
        tasks.extend(
            state
                .tasks()
                .iter()
                .filter(|t| t.dynamic.is_deactivated)
                .filter(|t| matches(t))
                .cloned(),
        );
        tasks.extend(
            state
                .read_trimmed(&ctx.files, &ctx.messages)
                .into_iter()
                .filter(matches),
        );
    }
    drop(state);

    if request.unique_names {
        tasks = keep_highest_id_per_name(tasks);
    }

    tasks.iter().map(list_item).collect()
}

/// For tasks sharing a non-empty friendly name, keeps only the one with the
/// highest id.
fn keep_highest_id_per_name(tasks: Vec<Task>) -> Vec<Task> {
    let mut best: HashMap<String, u32> = HashMap::new();
    for task in tasks.iter().filter(|t| !t.friendly_name.is_empty()) {
        best.entry(task.friendly_name.clone())
            .and_modify(|id| *id = (*id).max(task.computed.id))
            .or_insert(task.computed.id);
    }
    tasks
        .into_iter()
        .filter(|t| {
            t.friendly_name.is_empty() || best.get(&t.friendly_name) == Some(&t.computed.id)
        })
        .collect()
}

fn list_item(task: &Task) -> ListResponseItem {
    let (last_stdout, has_last_stdout) = match task.read_last_stdout() {
        Ok(stdout) => (stdout, true),
        Err(_) => (String::new(), false),
    };

    ListResponseItem {
        id: task.computed.id,
        cmdline: task.cmdline.clone(),
        cwd: task.cwd.clone(),
        friendly_name: task.friendly_name.clone(),
        tags: task.tags.clone(),
        display: task.display.clone(),
        out_file_path: task.computed.out_file_path.clone(),
        max_subsequent_failures: task.max_subsequent_failures,
        is_deactivated: task.dynamic.is_deactivated,
        deactivation_reason: task.dynamic.deactivated_reason.clone(),
        run_count: task.dynamic.run_count,
        failure_count: task.dynamic.failure_count,
        subsequent_failure_count: task.dynamic.subsequent_failure_count,
        last_exit_value: task.dynamic.last_exit_value,
        last_stdout,
        has_last_stdout,
    }
}

pub async fn cmd_query_task_active(ctx: &SchedulerContext, task_id: i64) -> TaskActivity {
    let state = ctx.scheduler.lock().await;

    let Ok(task_id) = u32::try_from(task_id) else {
        return TaskActivity::InvalidTask;
    };
    if !state.is_valid_id(task_id) {
        return TaskActivity::InvalidTask;
    }

    match state
        .tasks()
        .iter()
        .find(|t| t.computed.id == task_id)
    {
        Some(task) if !task.dynamic.is_deactivated => TaskActivity::Active,
        // Deactivated in memory, spilled, or an id burned by a rejected
        // schedule: not active either way.
        _ => TaskActivity::Inactive,
    }
}

pub async fn cmd_refresh(ctx: &SchedulerContext, request: RefreshRequest) -> RefreshResponse {
    let state = ctx.scheduler.lock().await;

    let mut refreshed = 0u64;
    let mut active = 0u64;
    for task in state.tasks().iter().filter(|t| !t.dynamic.is_deactivated) {
        active += 1;
        let matched = request.filter.matches(
            task.computed.id,
            &task.friendly_name,
            &task.display,
            &task.tags,
        );
        if matched {
            if let Some(signals) = &task.signals {
                signals.refresh.fire(());
            }
            refreshed += 1;
        }
    }

    RefreshResponse {
        refreshed_tasks_count: refreshed,
        active_tasks_count: active,
    }
}

pub async fn cmd_reschedule(
    ctx: &SchedulerContext,
    request: RescheduleRequest,
) -> ScheduleResponse {
    let mut state = ctx.scheduler.lock().await;

    let outcome = match state.extract_deactivated(request.task_id, &ctx.files, &ctx.messages) {
        Ok(task) => state.try_reschedule(task, ctx).await,
        Err(status) => ScheduleOutcome {
            status,
            id: request.task_id,
            log_file: String::new(),
        },
    };
    drop(state);

    report_schedule_outcome(ctx, "reschedule", &outcome);
    ScheduleResponse {
        status: outcome.status,
        id: outcome.id,
        log_file: outcome.log_file,
    }
}

pub async fn cmd_stop(ctx: &SchedulerContext, request: StopRequest) -> StopResponse {
    let state = ctx.scheduler.lock().await;

    let status = match state
        .tasks()
        .iter()
        .find(|t| t.computed.id == request.task_id)
    {
        Some(task) if !task.dynamic.is_deactivated => {
            if let Some(signals) = &task.signals {
                signals.stop.fire("stop requested".to_string());
            }
            StopStatus::Success
        }
        Some(_) => StopStatus::AlreadyStopped,
        // Not in memory: a valid id means the task was deactivated and
        // spilled; anything else never existed.
        None if state.is_valid_id(request.task_id) => StopStatus::AlreadyStopped,
        None => StopStatus::TaskNotFound,
    };
    drop(state);

    let label = format!("task id={}", request.task_id);
    match status {
        StopStatus::Success => {
            ctx.messages
                .add(Severity::Info, Some(&label), "Accepted stop request");
        }
        StopStatus::AlreadyStopped => {
            ctx.messages
                .add(Severity::Info, Some(&label), "Cannot stop: task is already stopped");
        }
        StopStatus::TaskNotFound => {
            ctx.messages
                .add(Severity::Error, Some(&label), "Cannot stop: task not found");
        }
        StopStatus::Unknown => {
            ctx.messages
                .add(Severity::Error, Some(&label), "Cannot stop: unknown error");
        }
    }

    StopResponse { status }
}
