//! Consent flow through the full call path

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use toolgate_core::prelude::*;

fn workspace_server() -> MemoryServer {
    MemoryServer::new("workspace")
        .with_tool(McpTool::new("write_file", "Write a file"))
        .with_tool(McpTool::new("delete_file", "Delete a file"))
}

async fn started(consent_timeout: Duration, server: MemoryServer) -> Arc<Toolgate> {
    let connector = MemoryConnector::new();
    connector.add_server(server);
    let config = ConfigBuilder::new()
        .server("workspace", ServerConfig::memory().with_auto_connect(true))
        .security(SecurityConfig {
            consent_timeout,
            ..SecurityConfig::default()
        })
        .build();
    let toolgate = Toolgate::with_parts(
        config,
        Arc::new(connector),
        Arc::new(InMemoryToolRegistry::new()),
    );
    toolgate.start().await;
    Arc::new(toolgate)
}

fn spawn_execute(
    toolgate: &Arc<Toolgate>,
    function: &'static str,
    params: serde_json::Value,
) -> tokio::task::JoinHandle<Result<FunctionResult>> {
    let toolgate = toolgate.clone();
    tokio::spawn(async move { toolgate.executor().execute(function, params).await })
}

#[tokio::test]
async fn test_allowed_write_reaches_server() {
    let server = workspace_server();
    let toolgate = started(Duration::from_secs(30), server.clone()).await;
    let mut prompts = toolgate.policy().consent_requests();

    let call = spawn_execute(&toolgate, "mcp_workspace_write_file", json!({ "path": "/tmp/out.txt" }));
    let request = prompts.recv().await.unwrap();
    assert_eq!(request.tool_name, "write_file");
    assert_eq!(request.risk_level, RiskLevel::High);
    assert_eq!(server.call_count(), 0);

    toolgate
        .policy()
        .handle_consent_response(&request.request_id, ConsentChoice::Allow)
        .await
        .unwrap();

    let result = call.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(server.call_count(), 1);
}

#[tokio::test]
async fn test_always_deny_skips_the_prompt_next_time() {
    let server = workspace_server();
    let toolgate = started(Duration::from_secs(30), server.clone()).await;
    let mut prompts = toolgate.policy().consent_requests();
    let params = json!({ "path": "/tmp/build" });

    let call = spawn_execute(&toolgate, "mcp_workspace_delete_file", params.clone());
    let request = prompts.recv().await.unwrap();
    assert_eq!(request.risk_level, RiskLevel::Critical);
    toolgate
        .policy()
        .handle_consent_response(&request.request_id, ConsentChoice::AlwaysDeny)
        .await
        .unwrap();
    let first = call.await.unwrap().unwrap();
    assert!(!first.success);
    assert_eq!(first.error.as_deref(), Some("Permission denied: Denied by user"));

    let second = toolgate
        .executor()
        .execute("mcp_workspace_delete_file", params)
        .await
        .unwrap();
    assert!(!second.success);
    assert!(second.error.unwrap().contains("saved consent decision"));
    assert!(matches!(prompts.try_recv(), Err(TryRecvError::Empty)));
    assert!(toolgate.policy().pending_consent_requests().await.is_empty());
    assert_eq!(server.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_prompt_is_not_authorized() {
    let server = workspace_server();
    let toolgate = started(Duration::from_secs(5), server.clone()).await;

    let err = toolgate
        .adapter()
        .execute_tool("mcp_workspace_write_file", json!({ "path": "/tmp/a" }))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolgateError::ConsentTimeout));
    assert_eq!(err.to_string(), "Operation not authorized");

    let result = toolgate
        .executor()
        .execute("mcp_workspace_write_file", json!({ "path": "/tmp/a" }))
        .await
        .unwrap();
    assert_eq!(result.error.as_deref(), Some("Operation not authorized"));
    assert_eq!(server.call_count(), 0);
}

#[tokio::test]
async fn test_cancelled_prompt_rejects_the_call() {
    let server = workspace_server();
    let toolgate = started(Duration::from_secs(30), server.clone()).await;
    let mut prompts = toolgate.policy().consent_requests();

    let adapter = toolgate.adapter().clone();
    let call = tokio::spawn(async move {
        adapter
            .execute_tool("mcp_workspace_write_file", json!({ "path": "/tmp/a" }))
            .await
    });
    let request = prompts.recv().await.unwrap();
    toolgate
        .policy()
        .cancel_consent_request(&request.request_id)
        .await
        .unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ToolgateError::ConsentCancelled(_)));
    assert_eq!(server.call_count(), 0);

    let denied = toolgate
        .policy()
        .get_audit_log(&AuditFilter::new().tool("write_file"))
        .await;
    assert_eq!(denied.len(), 1);
}
