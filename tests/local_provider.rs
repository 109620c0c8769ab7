//! End-to-end session lifecycle against the local provider.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tasklift::config::load_config_str;
use tasklift::provider::{
    ComputeProvider, ExecOptions, OutputLine, Provider, ProviderContext, SessionOptions,
    SessionStatus, TaskDefinition, TaskStatus,
};
use tasklift::{Credentials, EventSink, ProviderEvent};

fn provider(root: &Path) -> Provider {
    provider_with_events(root, EventSink::disabled())
}

fn provider_with_events(root: &Path, events: EventSink) -> Provider {
    let config = load_config_str(&format!(
        r#"
        [tasklift]
        command_timeout_secs = 30

        [provider]
        type = "local"
        workspace_root = "{}"

        [provider.env]
        GREETING = "hello"
        "#,
        root.display()
    ))
    .unwrap();
    let ctx = ProviderContext::new(Credentials::default()).with_events(events);
    Provider::from_config(&config, ctx).unwrap()
}

#[tokio::test]
async fn test_session_lifecycle() {
    let root = tempfile::tempdir().unwrap();
    let (events, mut rx) = EventSink::channel();
    let provider = provider_with_events(root.path(), events);
    provider.initialize().await.unwrap();

    let session = provider
        .create_session(&SessionOptions::new("task-1").user("alice"))
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);

    let result = provider
        .execute_command("task-1", "echo $GREETING from $TASKLIFT_SESSION_ID", &ExecOptions::default())
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output.trim(), "hello from task-1");
    assert_eq!(result.exit_code, Some(0));

    let failed = provider
        .execute_command("task-1", "echo oops >&2; exit 7", &ExecOptions::default())
        .await;
    assert!(!failed.success);
    assert_eq!(failed.exit_code, Some(7));
    assert!(failed.error.unwrap_or_default().contains("oops"));

    let listed = provider.list_sessions(Some("alice")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(provider.list_sessions(Some("bob")).await.unwrap().is_empty());

    provider.terminate_session("task-1").await.unwrap();
    provider.terminate_session("task-1").await.unwrap();
    let status = provider.get_session_status("task-1").await.unwrap();
    assert_eq!(status.status, SessionStatus::Terminated);
    assert!(!root.path().join("task-1").exists());

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e, ProviderEvent::SessionCreated { .. })));
    let terminated = seen
        .iter()
        .filter(|e| matches!(e, ProviderEvent::SessionTerminated { .. }))
        .count();
    assert_eq!(terminated, 1);
}

#[tokio::test]
async fn test_files_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let provider = provider(root.path());
    provider.create_session(&SessionOptions::new("files")).await.unwrap();

    let outside = tempfile::tempdir().unwrap();
    let absolute = outside.path().join("nested/abs.txt").to_string_lossy().into_owned();
    let mut files = BTreeMap::new();
    files.insert("input/data.txt".to_string(), b"relative".to_vec());
    files.insert(absolute.clone(), b"absolute".to_vec());
    provider.upload_files("files", &files).await.unwrap();

    let result = provider
        .execute_command("files", "cat input/data.txt > out.txt", &ExecOptions::default())
        .await;
    assert!(result.success);

    let downloaded = provider
        .download_results(
            "files",
            &["out.txt".to_string(), absolute.clone(), "missing.txt".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(downloaded.get("out.txt").map(Vec::as_slice), Some(&b"relative"[..]));
    assert_eq!(downloaded.get(&absolute).map(Vec::as_slice), Some(&b"absolute"[..]));
    assert!(!downloaded.contains_key("missing.txt"));

    provider.terminate_session("files").await.unwrap();
    assert!(provider.download_results("files", &["out.txt".to_string()]).await.is_err());
}

#[tokio::test]
async fn test_output_streams_while_running() {
    let root = tempfile::tempdir().unwrap();
    let provider = provider(root.path());
    provider.create_session(&SessionOptions::new("stream")).await.unwrap();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let opts = ExecOptions::default().on_output(Arc::new(move |line: &OutputLine| {
        if let OutputLine::Stdout(s) = line {
            sink.lock().unwrap().push(s.clone());
        }
    }));
    let result = provider
        .execute_command("stream", "for i in 1 2 3; do echo line$i; done", &opts)
        .await;
    assert!(result.success);
    assert_eq!(*lines.lock().unwrap(), vec!["line1", "line2", "line3"]);

    provider.terminate_session("stream").await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_process_group() {
    let root = tempfile::tempdir().unwrap();
    let provider = provider(root.path());
    provider.create_session(&SessionOptions::new("slow")).await.unwrap();

    let started = Instant::now();
    let opts = ExecOptions::default().timeout(Duration::from_secs(1));
    let result = provider
        .execute_command("slow", "sleep 60 & echo $! > child.pid; wait", &opts)
        .await;
    assert!(result.timed_out);
    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_secs(20));

    let pid = std::fs::read_to_string(root.path().join("slow/child.pid")).unwrap();
    let proc_stat = format!("/proc/{}/stat", pid.trim());
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let alive = match std::fs::read_to_string(&proc_stat) {
            Ok(stat) => !stat.contains(") Z"),
            Err(_) => false,
        };
        if !alive {
            break;
        }
        assert!(Instant::now() < deadline, "background child survived the timeout");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    provider.terminate_session("slow").await.unwrap();
}

#[tokio::test]
async fn test_run_task_stages_files() {
    let root = tempfile::tempdir().unwrap();
    let provider = provider(root.path());
    provider.create_session(&SessionOptions::new("task")).await.unwrap();

    let mut task = TaskDefinition {
        id: "t1".to_string(),
        command: "cat prompt.txt; echo $MODE".to_string(),
        ..Default::default()
    };
    task.files.insert("prompt.txt".to_string(), b"fix the bug\n".to_vec());
    task.environment.insert("MODE".to_string(), "fast".to_string());

    let execution = provider.run_task("task", &task).await;
    assert_eq!(execution.status, TaskStatus::Completed, "{:?}", execution.error);
    assert_eq!(execution.output, "fix the bug\nfast\n");

    provider.terminate_session("task").await.unwrap();
    let after = provider.run_task("task", &task).await;
    assert_eq!(after.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_unknown_session_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let provider = provider(root.path());

    let result = provider
        .execute_command("nope", "true", &ExecOptions::default())
        .await;
    assert!(!result.success);
    assert!(provider.get_session_status("nope").await.unwrap_err().is_not_found());
    provider.terminate_session("nope").await.unwrap();
}

#[tokio::test]
async fn test_reattach_from_new_provider() {
    let root = tempfile::tempdir().unwrap();
    provider(root.path())
        .create_session(&SessionOptions::new("long-lived").user("carol"))
        .await
        .unwrap();

    let fresh = provider(root.path());
    let result = fresh
        .execute_command("long-lived", "echo still here", &ExecOptions::default())
        .await;
    assert_eq!(result.output.trim(), "still here");
    let status = fresh.get_session_status("long-lived").await.unwrap();
    assert_eq!(status.user_id(), Some("carol"));
    fresh.terminate_session("long-lived").await.unwrap();
}
