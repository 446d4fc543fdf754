//! End-to-end command broker flows through the full application state.

mod support;

use std::time::Duration;

use hub_domain::command::{CommandKind, CommandStatus, SshContext};
use hub_domain::error::ErrorCode;
use hub_domain::task::TaskStatus;
use hub_gateway::runtime::broker::NewCommand;
use hub_gateway::runtime::engine::TaskDraft;
use hub_gateway::state::AppState;
use uuid::Uuid;

use support::{app_state, ScriptedLlm, ScriptedTransport};

fn draft(title: &str) -> TaskDraft {
    TaskDraft {
        title: title.into(),
        ..Default::default()
    }
}

fn command(task_id: Uuid, content: &str) -> NewCommand {
    NewCommand {
        task_id,
        kind: CommandKind::Prompt,
        content: content.into(),
        metadata: None,
        ssh_context_id: None,
        timeout_seconds: None,
    }
}

async fn wait_terminal(state: &AppState, command_id: Uuid) -> hub_domain::command::Command {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(cmd) = state.broker.status(command_id) {
                if cmd.is_terminal() {
                    return cmd;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("command did not reach a terminal state")
}

#[tokio::test(start_paused = true)]
async fn fifo_order_with_cancel_while_queued() {
    let transport = ScriptedTransport::new(false);
    let state = app_state(ScriptedLlm::replying("OK"), transport.clone(), |_| {});
    state.broker.spawn_dispatcher();

    let task = state.engine.create(draft("T")).await.unwrap();

    let c1 = state.broker.enqueue(command(task.id, "first")).unwrap();
    let c2 = state.broker.enqueue(command(task.id, "second")).unwrap();
    let c3 = state.broker.enqueue(command(task.id, "third")).unwrap();
    assert_eq!(c1.queue_position, 1);
    assert_eq!(c3.queue_position, 3);

    // Cancel the middle command while the connector is still down.
    assert!(state.broker.cancel(c2.command_id).unwrap());

    transport.set_connected(true);

    let done1 = wait_terminal(&state, c1.command_id).await;
    let done3 = wait_terminal(&state, c3.command_id).await;
    assert_eq!(done1.status, CommandStatus::Completed);
    assert_eq!(done3.status, CommandStatus::Completed);

    let done2 = state.broker.status(c2.command_id).unwrap();
    assert_eq!(done2.status, CommandStatus::Cancelled);

    // C2 never reached the connector; order was strictly FIFO.
    assert_eq!(transport.delivered_contents(), vec!["first", "third"]);
}

#[tokio::test(start_paused = true)]
async fn ssh_context_snapshot_at_enqueue() {
    let transport = ScriptedTransport::new(false);
    let state = app_state(ScriptedLlm::replying("OK"), transport.clone(), |_| {});
    state.broker.spawn_dispatcher();

    let task = state.engine.create(draft("T")).await.unwrap();
    state.ssh.upsert(SshContext::new("dev", "h1")).unwrap();

    let mut cmd = command(task.id, "remote edit");
    cmd.ssh_context_id = Some("dev".into());
    let receipt = state.broker.enqueue(cmd).unwrap();
    assert!(receipt.ssh_context_used);

    // Edit the context while the command is still queued.
    state.ssh.upsert(SshContext::new("dev", "h2")).unwrap();

    transport.set_connected(true);
    let done = wait_terminal(&state, receipt.command_id).await;
    assert_eq!(done.status, CommandStatus::Completed);

    // The connector received the snapshot captured at enqueue time.
    let delivered = transport.delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].ssh.as_ref().unwrap().host, "h1");
}

#[tokio::test]
async fn queue_capacity_boundary() {
    let state = app_state(ScriptedLlm::replying("OK"), ScriptedTransport::new(false), |c| {
        c.connector.queue_max_size = 2;
    });
    let task = state.engine.create(draft("T")).await.unwrap();

    let first = state.broker.enqueue(command(task.id, "one")).unwrap();
    state.broker.enqueue(command(task.id, "two")).unwrap();

    let err = state.broker.enqueue(command(task.id, "three")).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BusinessLogic);

    // Dropping one command admits the next.
    state.broker.cancel(first.command_id).unwrap();
    assert!(state.broker.enqueue(command(task.id, "three")).is_ok());
}

#[tokio::test]
async fn task_cancel_cascades_to_commands() {
    let transport = ScriptedTransport::new(false);
    let state = app_state(ScriptedLlm::replying("OK"), transport, |_| {});

    let task = state.engine.create(draft("T")).await.unwrap();
    state.engine.start(task.id).await.unwrap();

    let c1 = state.broker.enqueue(command(task.id, "a")).unwrap();
    let c2 = state.broker.enqueue(command(task.id, "b")).unwrap();

    let cancelled = state.cancel_task_cascade(task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    for id in [c1.command_id, c2.command_id] {
        assert_eq!(
            state.broker.status(id).unwrap().status,
            CommandStatus::Cancelled
        );
    }
    assert_eq!(state.broker.queue_size(), 0);
}

#[tokio::test]
async fn command_requires_valid_ssh_reference() {
    let state = app_state(ScriptedLlm::replying("OK"), ScriptedTransport::new(false), |_| {});
    let task = state.engine.create(draft("T")).await.unwrap();

    let mut cmd = command(task.id, "x");
    cmd.ssh_context_id = Some("missing".into());
    let err = state.broker.enqueue(cmd).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test(start_paused = true)]
async fn verify_ssh_context_through_transport() {
    let transport = ScriptedTransport::new(true);
    let state = app_state(ScriptedLlm::replying("OK"), transport, |_| {});
    state.ssh.upsert(SshContext::new("dev", "h1")).unwrap();

    assert!(state.broker.verify_ssh_context("dev").await.unwrap());
    assert!(state.ssh.get("dev").unwrap().last_verified.is_some());
}
