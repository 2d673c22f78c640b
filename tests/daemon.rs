//! Request-handler semantics, driven through the same entry points the
//! connection dispatcher uses.

mod common;

use std::time::Duration;

use spieven::protocol::types::{
    ListRequest, RefreshRequest, RescheduleRequest, ScheduleStatus, StopRequest, StopStatus,
    TaskActivity, TaskFilter,
};
use spieven::server::{
    cmd_list, cmd_query_task_active, cmd_refresh, cmd_reschedule, cmd_schedule, cmd_stop,
};

use common::{request, Harness};

#[tokio::test]
async fn stop_is_idempotent_and_reports_unknown_ids() {
    let harness = Harness::new();
    let id = harness.schedule(request(&["/bin/sleep", "60"])).await.id;

    let response = cmd_stop(&harness.ctx, StopRequest { task_id: id }).await;
    assert_eq!(response.status, StopStatus::Success);

    harness
        .wait_for("stop lands", Duration::from_secs(2), |tasks| {
            tasks
                .iter()
                .any(|t| t.computed.id == id && t.dynamic.is_deactivated)
        })
        .await;

    let response = cmd_stop(&harness.ctx, StopRequest { task_id: id }).await;
    assert_eq!(response.status, StopStatus::AlreadyStopped);

    let response = cmd_stop(&harness.ctx, StopRequest { task_id: 999 }).await;
    assert_eq!(response.status, StopStatus::TaskNotFound);

    harness.shutdown().await;
}

#[tokio::test]
async fn stopping_a_spilled_task_reports_already_stopped() {
    let harness = Harness::new();
    let id = harness.schedule(request(&["/bin/sleep", "60"])).await.id;

    cmd_stop(&harness.ctx, StopRequest { task_id: id }).await;
    harness
        .wait_for("deactivation", Duration::from_secs(2), |tasks| {
            tasks.iter().any(|t| t.dynamic.is_deactivated)
        })
        .await;
    {
        let mut state = harness.ctx.scheduler.lock().await;
        state.trim(&harness.ctx.files, &harness.ctx.messages);
    }

    let response = cmd_stop(&harness.ctx, StopRequest { task_id: id }).await;
    assert_eq!(response.status, StopStatus::AlreadyStopped);

    harness.shutdown().await;
}

#[tokio::test]
async fn query_task_active_distinguishes_the_three_answers() {
    let harness = Harness::new();
    let id = harness.schedule(request(&["/bin/sleep", "60"])).await.id;

    assert_eq!(
        cmd_query_task_active(&harness.ctx, i64::from(id)).await,
        TaskActivity::Active
    );
    assert_eq!(
        cmd_query_task_active(&harness.ctx, 999).await,
        TaskActivity::InvalidTask
    );
    assert_eq!(
        cmd_query_task_active(&harness.ctx, -1).await,
        TaskActivity::InvalidTask
    );

    cmd_stop(&harness.ctx, StopRequest { task_id: id }).await;
    harness
        .wait_for("deactivation", Duration::from_secs(2), |tasks| {
            tasks.iter().any(|t| t.dynamic.is_deactivated)
        })
        .await;
    assert_eq!(
        cmd_query_task_active(&harness.ctx, i64::from(id)).await,
        TaskActivity::Inactive
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn list_filters_and_falls_back_to_deactivated_records() {
    let harness = Harness::new();

    let mut named = request(&["/bin/sleep", "60"]);
    named.friendly_name = "web".to_string();
    named.tags = vec!["prod".to_string()];
    let web_id = harness.schedule(named).await.id;

    let other = request(&["/bin/sleep", "61"]);
    harness.schedule(other).await;

    // Conjunctive filter by name.
    let by_name = ListRequest {
        filter: TaskFilter {
            any_name: vec!["web".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };
    let items = cmd_list(&harness.ctx, by_name.clone()).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, web_id);
    assert_eq!(items[0].tags, vec!["prod".to_string()]);

    // Stop and spill the named task; a plain list no longer shows it.
    cmd_stop(&harness.ctx, StopRequest { task_id: web_id }).await;
    harness
        .wait_for("deactivation", Duration::from_secs(2), |tasks| {
            tasks
                .iter()
                .any(|t| t.computed.id == web_id && t.dynamic.is_deactivated)
        })
        .await;
    {
        let mut state = harness.ctx.scheduler.lock().await;
        state.trim(&harness.ctx.files, &harness.ctx.messages);
    }
    assert!(cmd_list(&harness.ctx, by_name.clone()).await.is_empty());

    // With the fallback flag the spilled record comes back, marked
    // deactivated.
    let with_fallback = ListRequest {
        include_deactivated: true,
        ..by_name
    };
    let items = cmd_list(&harness.ctx, with_fallback).await;
    assert_eq!(items.len(), 1);
    assert!(items[0].is_deactivated);
    assert!(!items[0].deactivation_reason.is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn unique_names_keeps_the_highest_id() {
    let harness = Harness::new();

    // Two generations of "svc": the first deactivated, the second live.
    let mut first = request(&["/bin/sleep", "60"]);
    first.friendly_name = "svc".to_string();
    let first_id = harness.schedule(first).await.id;

    cmd_stop(&harness.ctx, StopRequest { task_id: first_id }).await;
    harness
        .wait_for("deactivation", Duration::from_secs(2), |tasks| {
            tasks
                .iter()
                .any(|t| t.computed.id == first_id && t.dynamic.is_deactivated)
        })
        .await;

    let mut second = request(&["/bin/sleep", "61"]);
    second.friendly_name = "svc".to_string();
    let second_id = harness.schedule(second).await.id;
    assert!(second_id > first_id);

    let items = cmd_list(
        &harness.ctx,
        ListRequest {
            include_deactivated_always: true,
            unique_names: true,
            ..Default::default()
        },
    )
    .await;
    let svc: Vec<_> = items.iter().filter(|i| i.friendly_name == "svc").collect();
    assert_eq!(svc.len(), 1);
    assert_eq!(svc[0].id, second_id);

    harness.shutdown().await;
}

#[tokio::test]
async fn list_inlines_captured_stdout() {
    let harness = Harness::new();

    let mut req = request(&["/bin/echo", "inline me"]);
    req.capture_stdout = true;
    req.delay_after_success_ms = 10_000;
    let id = harness.schedule(req).await.id;

    harness
        .wait_for("stdout captured", Duration::from_secs(2), |tasks| {
            tasks
                .iter()
                .any(|t| t.computed.id == id && !t.dynamic.last_stdout_file_path.is_empty())
        })
        .await;

    let items = cmd_list(&harness.ctx, ListRequest::default()).await;
    let item = items.iter().find(|i| i.id == id).unwrap();
    assert!(item.has_last_stdout);
    assert_eq!(item.last_stdout, "inline me\n");

    harness.shutdown().await;
}

#[tokio::test]
async fn refresh_counts_matching_and_active_tasks() {
    let harness = Harness::new();

    let mut tagged = request(&["/bin/sleep", "60"]);
    tagged.tags = vec!["batch".to_string()];
    harness.schedule(tagged).await;
    harness.schedule(request(&["/bin/sleep", "61"])).await;

    let response = cmd_refresh(
        &harness.ctx,
        RefreshRequest {
            filter: TaskFilter {
                all_tags: vec!["batch".to_string()],
                ..Default::default()
            },
        },
    )
    .await;
    assert_eq!(response.refreshed_tasks_count, 1);
    assert_eq!(response.active_tasks_count, 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn schedule_rejects_invalid_input_server_side() {
    let harness = Harness::new();

    let mut bad = request(&["/bin/true"]);
    bad.friendly_name = "not allowed!".to_string();
    let response = cmd_schedule(&harness.ctx, bad).await;
    assert_eq!(response.status, ScheduleStatus::Unknown);

    let mut newline = request(&["/bin/true"]);
    newline.env = vec!["X=a\nb".to_string()];
    let response = cmd_schedule(&harness.ctx, newline).await;
    assert_eq!(response.status, ScheduleStatus::Unknown);

    assert_eq!(harness.active_task_count().await, 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn reschedule_round_trips_through_the_spill_file() {
    let harness = Harness::new();

    let mut req = request(&["/bin/true"]);
    req.max_subsequent_failures = 3;
    let id = cmd_schedule(&harness.ctx, req).await.id;

    harness
        .wait_for("a run lands", Duration::from_secs(2), |tasks| {
            tasks
                .iter()
                .any(|t| t.computed.id == id && t.dynamic.run_count >= 1)
        })
        .await;
    cmd_stop(&harness.ctx, StopRequest { task_id: id }).await;
    harness
        .wait_for("deactivation", Duration::from_secs(2), |tasks| {
            tasks
                .iter()
                .any(|t| t.computed.id == id && t.dynamic.is_deactivated)
        })
        .await;
    {
        let mut state = harness.ctx.scheduler.lock().await;
        state.trim(&harness.ctx.files, &harness.ctx.messages);
    }

    let response = cmd_reschedule(&harness.ctx, RescheduleRequest { task_id: id }).await;
    assert_eq!(response.status, ScheduleStatus::Success);
    assert_eq!(response.id, id);

    // Rescheduling an id that never existed.
    let response = cmd_reschedule(&harness.ctx, RescheduleRequest { task_id: 999 }).await;
    assert_eq!(response.status, ScheduleStatus::TaskNotFound);

    harness.shutdown().await;
}
