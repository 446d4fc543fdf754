pub mod auth;
pub mod cursor;
pub mod error;
pub mod gemini;
pub mod health;
pub mod tasks;
pub mod ws;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// The health probe and the connector agent socket are **public**; every
/// other route is gated behind the bearer-token middleware (a no-op when
/// no token is configured).
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        // Aggregate health probe (public, no auth)
        .route("/api/health", get(health::health))
        // Cursor Connector agent link (token-authenticated on its own)
        .route("/api/connector/ws", get(crate::connector::ws::connector_ws));

    let protected = Router::new()
        // Tasks
        .route("/api/tasks", post(tasks::create_task))
        .route("/api/tasks", get(tasks::list_tasks))
        .route("/api/tasks/:id", get(tasks::get_task))
        .route("/api/tasks/:id", put(tasks::update_task))
        .route("/api/tasks/:id", delete(tasks::delete_task))
        .route("/api/tasks/:id/messages", get(tasks::list_task_messages))
        .route("/api/tasks/:id/start", post(tasks::start_task))
        .route("/api/tasks/:id/complete", post(tasks::complete_task))
        .route("/api/tasks/:id/cancel", post(tasks::cancel_task))
        .route("/api/tasks/:id/retry", post(tasks::retry_task))
        // Conversation (Gemini)
        .route("/api/gemini/tasks/:id/message", post(gemini::send_message))
        .route("/api/gemini/tasks/:id/stream", post(gemini::stream_message))
        .route(
            "/api/gemini/tasks/:id/conversation",
            post(gemini::create_conversation),
        )
        .route(
            "/api/gemini/tasks/:id/conversation",
            get(gemini::conversation_summary),
        )
        .route(
            "/api/gemini/tasks/:id/conversation",
            delete(gemini::clear_conversation),
        )
        .route("/api/gemini/tasks/:id/ws", get(ws::gemini_task_ws))
        .route("/api/gemini/health", get(gemini::health))
        // Commands (Cursor Connector)
        .route("/api/cursor/tasks/:id/command", post(cursor::send_command))
        .route("/api/cursor/tasks/:id/ws", get(ws::cursor_task_ws))
        .route(
            "/api/cursor/commands/:id/status",
            get(cursor::command_status),
        )
        .route("/api/cursor/commands/:id", delete(cursor::cancel_command))
        // SSH contexts
        .route("/api/cursor/ssh-contexts", post(cursor::create_ssh_context))
        .route("/api/cursor/ssh-contexts", get(cursor::list_ssh_contexts))
        .route(
            "/api/cursor/ssh-contexts/:id",
            get(cursor::get_ssh_context),
        )
        .route(
            "/api/cursor/ssh-contexts/:id",
            delete(cursor::delete_ssh_context),
        )
        .route(
            "/api/cursor/ssh-contexts/:id/verify",
            post(cursor::verify_ssh_context),
        )
        // Connector status
        .route("/api/cursor/status", get(cursor::connector_status))
        .route("/api/cursor/health", get(cursor::connector_health))
        // Event firehose
        .route("/api/events/ws", get(ws::events_ws))
        // Apply API auth middleware to all protected routes.
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
