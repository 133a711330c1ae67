//! Command task handlers and TOML-declared registries.
#![cfg(unix)]

use serde_json::json;
use snappea::command::{CommandHandler, TaskDeclaration, load_registry};
use snappea::error::Error;
use snappea::model::{Arguments, TaskId};
use snappea::registry::{HandlerError, TaskContext, TaskHandler};
use std::path::{Path, PathBuf};

fn ctx(task_type: &str, attempt: u32) -> TaskContext {
    TaskContext {
        task_id: TaskId(42),
        task_type: task_type.to_string(),
        attempt,
        max_attempts: 5,
    }
}

fn shell(script: &str, permanent_exit_codes: Vec<i32>) -> CommandHandler {
    CommandHandler::new(&TaskDeclaration {
        name: "t".to_string(),
        command: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        permanent_exit_codes,
    })
    .unwrap()
}

fn write_declaration(dir: &Path, file: &str, body: &str) {
    std::fs::write(dir.join(file), body).unwrap();
}

#[tokio::test]
async fn zero_exit_is_success() {
    let handler = shell("exit 0", vec![]);
    handler
        .run(ctx("t", 1), Arguments::empty())
        .await
        .unwrap();
}

#[tokio::test]
async fn arguments_and_identity_reach_the_command() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("seen");
    let script = format!(
        "cat > {out}.json && echo \"$SNAPPEA_TASK_ID $SNAPPEA_TASK_TYPE $SNAPPEA_ATTEMPT\" > {out}.env",
        out = out.display()
    );
    let handler = shell(&script, vec![]);
    let arguments = Arguments::try_from(json!({"user_id": 7})).unwrap();

    handler.run(ctx("send_digest", 2), arguments).await.unwrap();

    let stdin: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.with_extension("json")).unwrap())
            .unwrap();
    assert_eq!(stdin, json!({"user_id": 7}));
    let env = std::fs::read_to_string(out.with_extension("env")).unwrap();
    assert_eq!(env.trim(), "42 send_digest 2");
}

#[tokio::test]
async fn other_exit_codes_are_transient_with_stderr() {
    let handler = shell("echo 'smtp refused' >&2; exit 1", vec![64]);
    let err = handler
        .run(ctx("t", 1), Arguments::empty())
        .await
        .unwrap_err();
    assert!(!err.is_permanent());
    assert_eq!(err.message(), "exited with status 1: smtp refused");
}

#[tokio::test]
async fn listed_exit_codes_are_permanent() {
    let handler = shell("exit 64", vec![64, 65]);
    let err = handler
        .run(ctx("t", 1), Arguments::empty())
        .await
        .unwrap_err();
    assert_eq!(err, HandlerError::Permanent("exited with status 64".to_string()));
}

#[tokio::test]
async fn missing_executable_is_transient() {
    let handler = CommandHandler::new(&TaskDeclaration {
        name: "t".to_string(),
        command: PathBuf::from("/nonexistent/snappea-task"),
        args: vec![],
        permanent_exit_codes: vec![],
    })
    .unwrap();
    let err = handler
        .run(ctx("t", 1), Arguments::empty())
        .await
        .unwrap_err();
    assert!(!err.is_permanent());
    assert!(err.message().starts_with("cannot spawn"));
}

#[test]
fn registry_loads_every_declaration() {
    let dir = tempfile::tempdir().unwrap();
    write_declaration(
        dir.path(),
        "digest.toml",
        r#"
        [task]
        name = "send_digest"
        command = "/bin/true"
        permanent_exit_codes = [64]
        "#,
    );
    write_declaration(
        dir.path(),
        "cleanup.toml",
        r#"
        [task]
        name = "cleanup"
        command = "/bin/sh"
        args = ["-c", "exit 0"]
        "#,
    );
    write_declaration(dir.path(), "README.md", "not a declaration");

    let registry = load_registry(dir.path()).unwrap();
    assert_eq!(registry.task_types(), vec!["cleanup", "send_digest"]);
}

#[test]
fn duplicate_names_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"
        [task]
        name = "send_digest"
        command = "/bin/true"
    "#;
    write_declaration(dir.path(), "a.toml", body);
    write_declaration(dir.path(), "b.toml", body);

    let err = load_registry(dir.path()).unwrap_err();
    assert!(matches!(err, Error::DuplicateTaskType(t) if t == "send_digest"));
}

#[test]
fn malformed_declaration_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    write_declaration(dir.path(), "bad.toml", "[task]\nname = \"x\"\n");
    assert!(matches!(load_registry(dir.path()), Err(Error::Config(_))));
}

#[test]
fn missing_directory_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    assert!(matches!(load_registry(&missing), Err(Error::Config(_))));
}
