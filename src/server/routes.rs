//! HTTP route handlers for the Kira agent API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use futures::stream;
use serde::Serialize;
use tracing::{error, info};

use crate::checkpoint::{ChatMessage, ThreadId};

use super::protocol::{RunAgentInput, RunEvent, WireMessage, response_events};
use super::state::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

/// Create the API router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route(&state.agent_path, post(run_agent))
        .route("/threads/{thread_id}/state", get(thread_state))
        .with_state(state)
}

/// Service banner.
async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "message": "Kira Calendar Agent API is running",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

fn bad_request(message: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

/// Run one agent turn and stream the result as AG-UI events.
async fn run_agent(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RunAgentInput>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let messages = input
        .messages
        .into_iter()
        .map(WireMessage::into_chat_message)
        .collect::<Result<Vec<ChatMessage>, String>>()
        .map_err(|role| bad_request(format!("unknown message role: {role}")))?;

    let thread_id = input.thread_id.map_or_else(ThreadId::random, ThreadId::new);
    let run_id = input
        .run_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(thread_id = %thread_id, run_id = %run_id, tools = input.tools.len(), "Agent run started");

    let mut events = vec![RunEvent::RunStarted {
        thread_id: thread_id.to_string(),
        run_id: run_id.clone(),
    }];
    match state
        .graph
        .invoke(thread_id.clone(), messages, input.tools)
        .await
    {
        Ok(outcome) => {
            events.extend(response_events(&outcome.response));
            events.push(RunEvent::RunFinished {
                thread_id: thread_id.to_string(),
                run_id,
            });
        }
        Err(err) => {
            error!(thread_id = %thread_id, run_id = %run_id, error = %err, "Agent run failed");
            events.push(RunEvent::RunError {
                message: err.to_string(),
            });
        }
    }

    let frames: Vec<Result<Event, axum::Error>> = events
        .iter()
        .map(|event| Event::default().json_data(event))
        .collect();
    Ok(Sse::new(stream::iter(frames)))
}

/// Persisted state of a thread.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStateResponse {
    /// Thread id.
    pub thread_id: String,
    /// Message history.
    pub messages: Vec<WireMessage>,
}

/// Return the latest persisted messages of a thread.
async fn thread_state(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadStateResponse>, ApiError> {
    let conversation = state
        .graph
        .state(ThreadId::new(thread_id.as_str()))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("State error: {e}") })),
            )
        })?;

    Ok(Json(ThreadStateResponse {
        thread_id,
        messages: conversation.messages.iter().map(WireMessage::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::agent::executor::fakes::ScriptedModel;
    use crate::agent::{AgentError, AgentResult, ConversationGraph, TurnExecutor};
    use crate::checkpoint::{CheckpointerConfig, SyncedCheckpointer};

    async fn app(replies: Vec<AgentResult<ChatMessage>>) -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let checkpointer = Arc::new(
            SyncedCheckpointer::new(CheckpointerConfig::local(dir.path().join("cp.db")))
                .await
                .unwrap(),
        );
        let store = checkpointer.get_checkpointer().await.unwrap();
        let graph = ConversationGraph::new(store, TurnExecutor::new(ScriptedModel::replying(replies)));
        let state = AppState::new(graph, checkpointer, "/copilotkit");
        (dir, create_router(state))
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn run_request(body: serde_json::Value) -> Request<Body> {
        Request::post("/copilotkit")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let (_dir, router) = app(Vec::new()).await;

        let response = router
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let root: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(root["status"], "ok");
        assert_eq!(root["version"], env!("CARGO_PKG_VERSION"));

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(health, serde_json::json!({ "status": "healthy" }));
    }

    #[tokio::test]
    async fn test_run_streams_events_and_persists_thread() {
        let (_dir, router) = app(vec![Ok(ChatMessage::assistant("Added to your calendar."))]).await;

        let response = router
            .clone()
            .oneshot(run_request(serde_json::json!({
                "threadId": "thread-1",
                "runId": "run-1",
                "messages": [{ "id": "m1", "role": "user", "content": "Gym at 7" }],
                "tools": []
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        let started = text.find("RUN_STARTED").unwrap();
        let content = text.find("TEXT_MESSAGE_CONTENT").unwrap();
        let finished = text.find("RUN_FINISHED").unwrap();
        assert!(started < content && content < finished);
        assert!(text.contains("Added to your calendar."));

        let response = router
            .oneshot(
                Request::get("/threads/thread-1/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let state: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(state["threadId"], "thread-1");
        assert_eq!(state["messages"].as_array().unwrap().len(), 2);
        assert_eq!(state["messages"][0]["id"], "m1");
    }

    #[tokio::test]
    async fn test_model_failure_emits_run_error() {
        let (_dir, router) = app(vec![Err(AgentError::Timeout(Duration::from_secs(1)))]).await;

        let response = router
            .oneshot(run_request(serde_json::json!({
                "threadId": "thread-2",
                "messages": [{ "id": "m1", "role": "user", "content": "hello" }]
            })))
            .await
            .unwrap();
        let text = body_text(response).await;
        assert!(text.contains("RUN_ERROR"));
        assert!(!text.contains("RUN_FINISHED"));
    }

    #[tokio::test]
    async fn test_unknown_role_is_a_bad_request() {
        let (_dir, router) = app(Vec::new()).await;

        let response = router
            .oneshot(run_request(serde_json::json!({
                "messages": [{ "id": "m1", "role": "narrator", "content": "..." }]
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
