//! Tests for the security policy

use super::*;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;

fn policy_with(timeout: Duration) -> Arc<SecurityPolicy> {
    let config = SecurityConfig {
        consent_timeout: timeout,
        ..SecurityConfig::default()
    };
    Arc::new(SecurityPolicy::new(&config))
}

fn spawn_validation(
    policy: &Arc<SecurityPolicy>,
    server: &'static str,
    tool: &'static str,
    params: Value,
) -> tokio::task::JoinHandle<Result<ValidationResult>> {
    let policy = policy.clone();
    tokio::spawn(async move { policy.validate_operation(server, tool, &params).await })
}

#[tokio::test]
async fn test_global_forbidden_overrides_server_profile() {
    let policy = SecurityPolicy::default();
    policy
        .set_server_permissions(
            "filesystem",
            PermissionProfile::new()
                .allow_path("/data/")
                .require_consent(false),
        )
        .await;

    let verdict = policy
        .validate_operation("filesystem", "read_file", &json!({ "path": "/data/chainlesschain.db" }))
        .await
        .unwrap();
    assert!(!verdict.allowed);
    assert!(verdict.reason().contains("forbidden path"));

    let verdict = policy
        .validate_operation("filesystem", "read_file", &json!({ "path": "/home/u/.ssh/id_rsa" }))
        .await
        .unwrap();
    assert!(!verdict.allowed);
}

#[tokio::test]
async fn test_allowed_prefix_and_read() {
    let policy = SecurityPolicy::default();
    policy
        .set_server_permissions("filesystem", PermissionProfile::new().allow_path("notes/"))
        .await;

    let verdict = policy
        .validate_operation("filesystem", "read_file", &json!({ "path": "/data/notes/a.md" }))
        .await
        .unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.risk_level, RiskLevel::Low);
    assert_eq!(verdict.operation, OperationType::Read);

    let verdict = policy
        .validate_operation("filesystem", "read_file", &json!({ "path": "/data/other/a.md" }))
        .await
        .unwrap();
    assert!(!verdict.allowed);
    assert!(verdict.reason().contains("outside the allowed paths"));
}

#[tokio::test]
async fn test_traversal_cannot_escape_prefix() {
    let policy = SecurityPolicy::default();
    policy
        .set_server_permissions("filesystem", PermissionProfile::new().allow_path("/data/notes/"))
        .await;

    let verdict = policy
        .validate_operation(
            "filesystem",
            "read_file",
            &json!({ "path": "/data/notes/../private/plan.md" }),
        )
        .await
        .unwrap();
    assert!(!verdict.allowed);
}

#[tokio::test]
async fn test_relative_system_paths_are_forbidden() {
    let policy = SecurityPolicy::default();

    for path in ["../../etc/passwd", "etc/shadow", "notes/../../../etc/passwd"] {
        let verdict = policy
            .validate_operation("fs", "read_file", &json!({ "path": path }))
            .await
            .unwrap();
        assert!(!verdict.allowed, "{} was allowed", path);
        assert!(verdict.reason().contains("forbidden path"));
    }
}

#[tokio::test]
async fn test_relative_climb_leaves_allowed_prefix() {
    let policy = SecurityPolicy::default();
    policy
        .set_server_permissions("filesystem", PermissionProfile::new().allow_path("notes/"))
        .await;

    let verdict = policy
        .validate_operation("filesystem", "read_file", &json!({ "path": "../notes/a.md" }))
        .await
        .unwrap();
    assert!(!verdict.allowed);
    assert!(verdict.reason().contains("climbs outside"));
}

#[tokio::test]
async fn test_server_forbidden_prefix() {
    let policy = SecurityPolicy::default();
    policy
        .set_server_permissions("filesystem", PermissionProfile::new().forbid_path("archive/"))
        .await;

    let verdict = policy
        .validate_operation("filesystem", "list_directory", &json!({ "dir": "/data/archive/2023" }))
        .await
        .unwrap();
    assert!(!verdict.allowed);
    assert!(verdict.reason().contains("is forbidden for server"));
}

#[tokio::test]
async fn test_read_only_blocks_writes() {
    let policy = SecurityPolicy::default();
    policy
        .set_server_permissions("db", PermissionProfile::new().read_only(true))
        .await;

    let verdict = policy
        .validate_operation("db", "query", &json!({ "sql": "UPDATE notes SET x = 1" }))
        .await
        .unwrap();
    assert!(!verdict.allowed);
    assert!(verdict.reason().contains("read-only"));

    let verdict = policy
        .validate_operation("db", "query", &json!({ "sql": "SELECT 1" }))
        .await
        .unwrap();
    assert!(verdict.allowed);
}

#[tokio::test]
async fn test_consent_not_required_auto_allows_high_only() {
    let policy = policy_with(Duration::from_secs(30));
    policy
        .set_server_permissions("fs", PermissionProfile::new().require_consent(false))
        .await;
    let mut prompts = policy.consent_requests();

    let verdict = policy
        .validate_operation("fs", "write_file", &json!({ "path": "/tmp/a.txt" }))
        .await
        .unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.risk_level, RiskLevel::High);
    assert!(matches!(prompts.try_recv(), Err(TryRecvError::Empty)));

    // critical still needs a human
    let handle = spawn_validation(&policy, "fs", "delete_file", json!({ "path": "/tmp/a.txt" }));
    let request = prompts.recv().await.unwrap();
    assert_eq!(request.risk_level, RiskLevel::Critical);
    policy
        .handle_consent_response(&request.request_id, ConsentChoice::Deny)
        .await
        .unwrap();
    let verdict = handle.await.unwrap().unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason(), "Denied by user");
}

#[tokio::test]
async fn test_consent_allow_resolves_single_request() {
    let policy = policy_with(Duration::from_secs(30));
    let mut prompts = policy.consent_requests();

    let handle = spawn_validation(&policy, "fs", "write_file", json!({ "path": "/tmp/a.txt" }));
    let request = prompts.recv().await.unwrap();
    assert_eq!(request.server_name, "fs");
    assert_eq!(request.tool_name, "write_file");
    assert_eq!(policy.pending_consent_requests().await.len(), 1);

    policy
        .handle_consent_response(&request.request_id, ConsentChoice::Allow)
        .await
        .unwrap();
    assert!(handle.await.unwrap().unwrap().allowed);
    assert!(policy.pending_consent_requests().await.is_empty());

    // a plain allow is not remembered
    let handle = spawn_validation(&policy, "fs", "write_file", json!({ "path": "/tmp/a.txt" }));
    let again = prompts.recv().await.unwrap();
    assert_ne!(again.request_id, request.request_id);
    policy
        .handle_consent_response(&again.request_id, ConsentChoice::Allow)
        .await
        .unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_always_deny_is_cached() {
    let policy = policy_with(Duration::from_secs(30));
    let mut prompts = policy.consent_requests();
    let params = json!({ "path": "/tmp/report.txt", "content": "v1" });

    let handle = spawn_validation(&policy, "fs", "write_file", params.clone());
    let request = prompts.recv().await.unwrap();
    policy
        .handle_consent_response(&request.request_id, ConsentChoice::AlwaysDeny)
        .await
        .unwrap();
    assert!(!handle.await.unwrap().unwrap().allowed);

    let changed_content = json!({ "path": "/tmp/report.txt", "content": "v2" });
    let verdict = policy
        .validate_operation("fs", "write_file", &changed_content)
        .await
        .unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason(), "Denied by saved consent decision");
    assert!(matches!(prompts.try_recv(), Err(TryRecvError::Empty)));
    assert!(policy.pending_consent_requests().await.is_empty());

    policy.clear_consent_cache().await;
    let handle = spawn_validation(&policy, "fs", "write_file", params);
    let request = prompts.recv().await.unwrap();
    policy
        .handle_consent_response(&request.request_id, ConsentChoice::AlwaysAllow)
        .await
        .unwrap();
    assert!(handle.await.unwrap().unwrap().allowed);
    assert_eq!(policy.get_statistics().await.cached_decisions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_consent_times_out() {
    let policy = policy_with(Duration::from_secs(5));

    let verdict = policy
        .validate_operation("shell", "run_command", &json!({ "command": "make" }))
        .await
        .unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason(), NOT_AUTHORIZED);
    assert!(policy.pending_consent_requests().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_answer_taken_at_timeout_still_counts() {
    let policy = policy_with(Duration::from_secs(5));
    let mut prompts = policy.consent_requests();

    let handle = spawn_validation(&policy, "shell", "run_command", json!({ "command": "make" }));
    let request = prompts.recv().await.unwrap();

    // stall the answer between taking the request and delivering it
    let cache_guard = policy.consent_cache.write().await;
    let answer = {
        let policy = policy.clone();
        let request_id = request.request_id.clone();
        tokio::spawn(async move {
            policy
                .handle_consent_response(&request_id, ConsentChoice::AlwaysAllow)
                .await
        })
    };
    while !policy.pending.lock().await.is_empty() {
        tokio::task::yield_now().await;
    }

    tokio::time::advance(Duration::from_secs(6)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    drop(cache_guard);

    answer.await.unwrap().unwrap();
    let verdict = handle.await.unwrap().unwrap();
    assert!(verdict.allowed);
    assert_eq!(verdict.reason(), "Allowed by user");
    assert_eq!(policy.get_statistics().await.cached_decisions, 1);
}

#[tokio::test]
async fn test_cancel_rejects_waiting_call() {
    let policy = policy_with(Duration::from_secs(30));
    let mut prompts = policy.consent_requests();

    let handle = spawn_validation(&policy, "shell", "run_command", json!({ "command": "make" }));
    let request = prompts.recv().await.unwrap();
    policy.cancel_consent_request(&request.request_id).await.unwrap();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(ToolgateError::ConsentCancelled(id)) if id == request.request_id));
    assert!(policy.pending_consent_requests().await.is_empty());
}

#[tokio::test]
async fn test_unknown_consent_request() {
    let policy = SecurityPolicy::default();
    let err = policy
        .handle_consent_response("missing", ConsentChoice::Allow)
        .await
        .unwrap_err();
    assert!(matches!(err, ToolgateError::NotFound(_)));
    assert!(policy.cancel_consent_request("missing").await.is_err());
}

#[tokio::test]
async fn test_audit_log_and_statistics() {
    let policy = SecurityPolicy::default();
    policy
        .validate_operation("fs", "read_file", &json!({ "path": "/data/a.md" }))
        .await
        .unwrap();
    policy
        .validate_operation("fs", "read_file", &json!({ "path": "/data/.env" }))
        .await
        .unwrap();
    policy
        .validate_operation("git", "git_log", &json!({}))
        .await
        .unwrap();

    let denied = policy
        .get_audit_log(&AuditFilter::new().decision(AuditDecision::Denied))
        .await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].server_name, "fs");
    assert!(denied[0].params_summary.contains(".env"));

    let git = policy.get_audit_log(&AuditFilter::new().server("git")).await;
    assert_eq!(git.len(), 1);

    let stats = policy.get_statistics().await;
    assert_eq!(stats.audit.total, 3);
    assert_eq!(stats.audit.allowed, 2);
    assert_eq!(stats.audit.denied, 1);
    assert_eq!(stats.pending_requests, 0);
}

#[tokio::test]
async fn test_extra_forbidden_fragments_are_additive() {
    let config = SecurityConfig {
        extra_forbidden_paths: vec!["Vault/".to_string()],
        ..SecurityConfig::default()
    };
    let policy = SecurityPolicy::new(&config);
    assert!(policy.global_forbidden_paths().iter().any(|f| f == ".ssh"));
    assert!(policy.global_forbidden_paths().iter().any(|f| f == "vault/"));

    let verdict = policy
        .validate_operation("fs", "read_file", &json!({ "path": "/srv/vault/keys.txt" }))
        .await
        .unwrap();
    assert!(!verdict.allowed);
}
