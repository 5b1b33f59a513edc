//! Integration tests for the runtime driver against a scripted command
//! runner: argument phrasing, log-file handling, JSON decoding, and event
//! forwarding, without a real runtime binary.

use arbor::bundle::Bundle;
use arbor::command::{ChildHandle, CommandRunner, CommandSpec, StdioConfig};
use arbor::error::{Error, Result};
use arbor::events::EventStore;
use arbor::mkdir::HostMkdirer;
use arbor::runtime::driver::{ContainerRuntime, RuntimeDriver, Status};
use arbor::runtime::{ExecPreparer, PasswdUserLookup, RuncBinary};
use arbor::spec::{ProcessIo, ProcessSpec};
use arbor::uid::UidGenerator;
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Output;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};

// =============================================================================
// Scripted Runner
// =============================================================================

fn output(code: i32, stdout: &[u8], stderr: &[u8]) -> Output {
    Output {
        status: ExitStatusExt::from_raw(code << 8),
        stdout: stdout.to_vec(),
        stderr: stderr.to_vec(),
    }
}

type RunHandler = Box<dyn Fn(&CommandSpec) -> Result<Output> + Send + Sync>;

struct ScriptedRunner {
    calls: Mutex<Vec<CommandSpec>>,
    on_run: RunHandler,
    spawn_stdout: Mutex<Option<Vec<u8>>>,
}

impl ScriptedRunner {
    fn new(on_run: RunHandler) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            on_run,
            spawn_stdout: Mutex::new(None),
        }
    }

    fn succeeding() -> Self {
        Self::new(Box::new(|_| Ok(output(0, b"", b""))))
    }

    fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

struct ScriptedChild {
    stdout: Option<Vec<u8>>,
}

#[async_trait]
impl ChildHandle for ScriptedChild {
    fn pid(&self) -> Option<u32> {
        Some(99)
    }

    fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        None
    }

    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout
            .take()
            .map(|data| Box::new(std::io::Cursor::new(data)) as _)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        None
    }

    async fn wait(&mut self) -> Result<i32> {
        Ok(0)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<Output> {
        self.calls.lock().unwrap().push(cmd.clone());
        (self.on_run)(cmd)
    }

    async fn spawn(&self, cmd: &CommandSpec, _stdio: StdioConfig) -> Result<Box<dyn ChildHandle>> {
        self.calls.lock().unwrap().push(cmd.clone());
        Ok(Box::new(ScriptedChild {
            stdout: self.spawn_stdout.lock().unwrap().take(),
        }))
    }
}

/// A handler that writes logfmt content to the path following `--log`
/// and then reports the given exit code.
fn log_writing_handler(log_content: &'static str, code: i32) -> RunHandler {
    Box::new(move |cmd| {
        if let Some(i) = cmd.args.iter().position(|a| a == "--log") {
            std::fs::write(&cmd.args[i + 1], log_content)?;
        }
        Ok(output(code, b"", b""))
    })
}

struct SequentialPids;

impl UidGenerator for SequentialPids {
    fn generate(&self) -> String {
        "p1".to_string()
    }
}

fn driver(runner: Arc<ScriptedRunner>) -> RuntimeDriver {
    RuntimeDriver::new(
        runner,
        RuncBinary::new("runc"),
        Arc::new(SequentialPids),
        ExecPreparer::new(Arc::new(PasswdUserLookup), Arc::new(HostMkdirer)),
    )
}

// =============================================================================
// Start / Kill
// =============================================================================

#[tokio::test]
async fn start_phrases_the_detached_verb_with_a_log_file() {
    let bundle = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::succeeding());
    driver(runner.clone())
        .start(bundle.path(), "banana")
        .await
        .unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, "runc");
    let log = bundle.path().join("start.log").display().to_string();
    assert_eq!(
        calls[0].args,
        vec![
            "--log".to_string(),
            log,
            "start".to_string(),
            "--detach".to_string(),
            bundle.path().display().to_string(),
            "banana".to_string(),
        ]
    );
}

#[tokio::test]
async fn failed_start_carries_the_last_runtime_log_message() {
    let bundle = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(log_writing_handler(
        "time=1 level=warning msg=\"early warning\"\n\
         time=2 level=error msg=\"container already exists\"\n",
        1,
    )));

    let err = driver(runner)
        .start(bundle.path(), "banana")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "runc start: exit status 1: container already exists"
    );
}

#[tokio::test]
async fn kill_uses_a_unique_log_file_per_invocation() {
    let bundle = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::succeeding());
    driver(runner.clone())
        .kill(bundle.path(), "banana", "KILL")
        .await
        .unwrap();

    let calls = runner.calls();
    assert!(calls[0].args[1].contains("kill-p1.log"));
    assert_eq!(calls[0].args[2..].to_vec(), vec!["kill", "banana", "KILL"]);
}

// =============================================================================
// Query Verbs
// =============================================================================

#[tokio::test]
async fn state_decodes_the_runtime_response() {
    let runner = Arc::new(ScriptedRunner::new(Box::new(|_| {
        Ok(output(0, br#"{"pid":4,"status":"running"}"#, b""))
    })));
    let state = driver(runner).state("banana").await.unwrap();
    assert_eq!(state.pid, 4);
    assert_eq!(state.status, Status::Running);
}

#[tokio::test]
async fn failed_state_is_a_typed_runtime_error() {
    let runner = Arc::new(ScriptedRunner::new(Box::new(|_| {
        Ok(output(1, b"", b"container does not exist"))
    })));
    let err = driver(runner).state("banana").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "runc state: exit status 1: container does not exist"
    );
}

#[tokio::test]
async fn delete_maps_nonzero_exit_to_a_runtime_error() {
    let runner = Arc::new(ScriptedRunner::new(Box::new(|_| {
        Ok(output(1, b"", b"busy"))
    })));
    let err = driver(runner.clone()).delete("banana").await.unwrap_err();
    assert!(matches!(err, Error::Runtime { .. }));
    assert_eq!(runner.calls()[0].args, vec!["delete", "banana"]);
}

#[tokio::test]
async fn stats_decode_cpu_and_memory_counters() {
    let runner = Arc::new(ScriptedRunner::new(Box::new(|_| {
        Ok(output(
            0,
            br#"{"type":"stats","data":{"CgroupStats":{
                "cpu_stats":{"cpu_usage":{"total_usage":300,"usage_in_kernelmode":100,"usage_in_usermode":200}},
                "memory_stats":{"stats":{"total_rss":1000,"total_cache":500,"total_inactive_file":200}}}}}"#,
            b"",
        ))
    })));
    let metrics = driver(runner.clone()).stats("banana").await.unwrap();
    assert_eq!(metrics.cpu.usage, 300);
    assert_eq!(metrics.memory.total_usage_toward_limit, 1300);
    assert_eq!(runner.calls()[0].args, vec!["events", "--stats", "banana"]);
}

// =============================================================================
// Event Watching
// =============================================================================

#[tokio::test]
async fn watch_events_forwards_only_oom_events() {
    let runner = Arc::new(ScriptedRunner::succeeding());
    *runner.spawn_stdout.lock().unwrap() = Some(
        b"{\"type\":\"stats\",\"data\":{}}\n{\"type\":\"oom\",\"data\":{}}\n".to_vec(),
    );
    let events = Arc::new(EventStore::new());

    driver(runner)
        .watch_events("banana", events.clone())
        .await
        .unwrap();

    assert_eq!(events.events("banana").unwrap(), vec!["Out of memory"]);
}

#[tokio::test]
async fn watch_events_fails_on_undecodable_output() {
    let runner = Arc::new(ScriptedRunner::succeeding());
    *runner.spawn_stdout.lock().unwrap() = Some(b"not json at all\n".to_vec());
    let events = Arc::new(EventStore::new());

    let err = driver(runner)
        .watch_events("banana", events.clone())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("decode event"));
    assert!(events.events("banana").unwrap().is_empty());
}

// =============================================================================
// Exec
// =============================================================================

#[tokio::test]
async fn exec_writes_the_process_spec_and_tracks_the_child() {
    let bundle = TempDir::new().unwrap();
    let rootfs = TempDir::new().unwrap();
    std::fs::write(
        bundle.path().join("config.json"),
        Bundle::default()
            .with_rootfs(rootfs.path())
            .to_json()
            .unwrap(),
    )
    .unwrap();

    let runner = Arc::new(ScriptedRunner::succeeding());
    let process = driver(runner.clone())
        .exec(
            bundle.path(),
            "banana",
            ProcessSpec {
                path: "/bin/ls".to_string(),
                args: vec!["-la".to_string()],
                ..Default::default()
            },
            ProcessIo::default(),
        )
        .await
        .unwrap();

    assert_eq!(process.id(), "p1");
    assert_eq!(process.wait().await.unwrap(), 0);

    let process_json = bundle.path().join("processes/p1.json");
    let raw = std::fs::read_to_string(&process_json).unwrap();
    let spec: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(spec["args"][0], "/bin/ls");
    assert_eq!(spec["args"][1], "-la");
    let env: Vec<String> = spec["env"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(env.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
    assert_eq!(env.iter().filter(|e| e.starts_with("USER=")).count(), 1);
    assert!(env.contains(&"USER=root".to_string()));

    let calls = runner.calls();
    let exec_call = &calls[0];
    assert!(exec_call.args.contains(&"exec".to_string()));
    assert!(exec_call
        .args
        .contains(&process_json.display().to_string()));
    let pid_file = bundle.path().join("processes/p1.pid").display().to_string();
    assert!(exec_call.args.contains(&pid_file));
    assert!(exec_call.args[1].contains("exec-p1.log"));
}
