//! Integration tests for the orchestrator: creation compensation,
//! destroy sequencing, listing, and bulk fan-out, all against scripted
//! subsystems.

use arbor::command::ChildHandle;
use arbor::error::{Error, Result};
use arbor::properties::PropertyManager;
use arbor::runtime::process::{ProcessTracker, TrackedProcess};
use arbor::spec::{
    ActualContainerSpec, ContainerMetrics, ContainerSpec, DesiredContainerSpec, HookCommand,
    NetworkHooks, ProcessIo, ProcessSpec, StreamInSpec, StreamOutSpec,
};
use arbor::supervisor::{Containerizer, Networker, RootfsProvider, Starter, Supervisor};
use arbor::net::NetOutRule;
use arbor::uid::UidGenerator;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};

// =============================================================================
// Shared Ledger
// =============================================================================

#[derive(Clone, Default)]
struct Ledger(Arc<Mutex<Vec<String>>>);

impl Ledger {
    fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn position(&self, entry: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == entry)
    }
}

// =============================================================================
// Fakes
// =============================================================================

struct FixedUidGenerator(&'static str);

impl UidGenerator for FixedUidGenerator {
    fn generate(&self) -> String {
        self.0.to_string()
    }
}

struct InstantChild;

#[async_trait]
impl ChildHandle for InstantChild {
    fn pid(&self) -> Option<u32> {
        None
    }
    fn take_stdin(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        None
    }
    fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        None
    }
    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        None
    }
    async fn wait(&mut self) -> Result<i32> {
        Ok(0)
    }
}

#[derive(Default)]
struct FakeContainerizer {
    ledger: Ledger,
    handles: Mutex<Vec<String>>,
    fail_create: bool,
    fail_destroy: bool,
    fail_metrics_for: Option<String>,
    specs: Mutex<Vec<DesiredContainerSpec>>,
}

#[async_trait]
impl Containerizer for FakeContainerizer {
    async fn create(&self, spec: DesiredContainerSpec) -> Result<()> {
        self.ledger
            .record(format!("containerizer.create:{}", spec.handle));
        if self.fail_create {
            return Err(Error::Internal("containerizer exploded".to_string()));
        }
        self.handles.lock().unwrap().push(spec.handle.clone());
        self.specs.lock().unwrap().push(spec);
        Ok(())
    }

    async fn run(
        &self,
        handle: &str,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<TrackedProcess> {
        self.ledger.record(format!("containerizer.run:{handle}:{}", spec.path));
        Ok(ProcessTracker::new().track("p1".to_string(), Box::new(InstantChild), io, None))
    }

    async fn stop(&self, handle: &str, kill: bool) -> Result<()> {
        self.ledger.record(format!("containerizer.stop:{handle}:{kill}"));
        Ok(())
    }

    async fn stream_in(
        &self,
        handle: &str,
        _spec: StreamInSpec,
        _source: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        self.ledger.record(format!("containerizer.stream-in:{handle}"));
        Ok(())
    }

    async fn stream_out(
        &self,
        handle: &str,
        _spec: StreamOutSpec,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        self.ledger.record(format!("containerizer.stream-out:{handle}"));
        Ok(Box::new(std::io::Cursor::new(Vec::new())))
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.ledger.record(format!("containerizer.destroy:{handle}"));
        if self.fail_destroy {
            return Err(Error::Internal("destroy exploded".to_string()));
        }
        self.handles.lock().unwrap().retain(|h| h != handle);
        Ok(())
    }

    async fn info(&self, handle: &str) -> Result<ActualContainerSpec> {
        Ok(ActualContainerSpec {
            bundle_path: PathBuf::from("/depot").join(handle),
            events: vec![],
            cpu_shares: 0,
        })
    }

    async fn metrics(&self, handle: &str) -> Result<ContainerMetrics> {
        if self.fail_metrics_for.as_deref() == Some(handle) {
            return Err(Error::HandleNotFound(handle.to_string()));
        }
        Ok(ContainerMetrics::default())
    }

    async fn handles(&self) -> Result<Vec<String>> {
        Ok(self.handles.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct FakeNetworker {
    ledger: Ledger,
    fail_network: bool,
}

#[async_trait]
impl Networker for FakeNetworker {
    async fn network(&self, handle: &str, network_spec: &str) -> Result<NetworkHooks> {
        self.ledger
            .record(format!("network.network:{handle}:{network_spec}"));
        if self.fail_network {
            return Err(Error::SubnetPoolExhausted);
        }
        Ok(NetworkHooks {
            prestart: HookCommand {
                path: PathBuf::from("/usr/bin/arbor-net"),
                args: vec!["--action=create".to_string(), format!("--handle={handle}")],
            },
            poststop: HookCommand {
                path: PathBuf::from("/usr/bin/arbor-net"),
                args: vec!["--action=destroy".to_string(), format!("--handle={handle}")],
            },
        })
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.ledger.record(format!("network.destroy:{handle}"));
        Ok(())
    }

    async fn net_in(
        &self,
        handle: &str,
        host_port: u16,
        container_port: u16,
    ) -> Result<(u16, u16)> {
        self.ledger
            .record(format!("network.net-in:{handle}:{host_port}:{container_port}"));
        Ok((host_port.max(60000), container_port.max(80)))
    }

    async fn net_out(&self, handle: &str, _rule: NetOutRule) -> Result<()> {
        self.ledger.record(format!("network.net-out:{handle}"));
        Ok(())
    }

    async fn restore(&self, handles: &[String]) -> Result<()> {
        self.ledger.record(format!("network.restore:{}", handles.join(",")));
        Ok(())
    }
}

#[derive(Default)]
struct FakeRootfsProvider {
    ledger: Ledger,
    fail_create: bool,
}

#[async_trait]
impl RootfsProvider for FakeRootfsProvider {
    async fn create(
        &self,
        handle: &str,
        rootfs: &str,
        _privileged: bool,
        _disk_quota_bytes: u64,
    ) -> Result<(PathBuf, Vec<String>)> {
        self.ledger.record(format!("rootfs.create:{handle}:{rootfs}"));
        if self.fail_create {
            return Err(Error::Validation(format!("rootfs {rootfs} does not exist")));
        }
        Ok((
            PathBuf::from("/provisioned").join(handle),
            vec!["ROOTFS_PROVIDED=yes".to_string()],
        ))
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.ledger.record(format!("rootfs.destroy:{handle}"));
        Ok(())
    }
}

struct RecordingStarter {
    ledger: Ledger,
    name: &'static str,
}

#[async_trait]
impl Starter for RecordingStarter {
    async fn start(&self) -> Result<()> {
        self.ledger.record(format!("starter:{}", self.name));
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    supervisor: Supervisor,
    ledger: Ledger,
    containerizer: Arc<FakeContainerizer>,
    properties: Arc<PropertyManager>,
}

fn harness_with(
    containerizer: FakeContainerizer,
    networker: FakeNetworker,
    rootfs: FakeRootfsProvider,
) -> Harness {
    let ledger = containerizer.ledger.clone();
    let containerizer = Arc::new(containerizer);
    let properties = Arc::new(PropertyManager::new());
    let supervisor = Supervisor::new(
        Arc::new(FixedUidGenerator("generated-handle")),
        vec![
            Box::new(RecordingStarter {
                ledger: ledger.clone(),
                name: "cgroups",
            }),
            Box::new(RecordingStarter {
                ledger: ledger.clone(),
                name: "iptables",
            }),
        ],
        Arc::new(rootfs),
        Arc::new(networker),
        containerizer.clone(),
        properties.clone(),
    );
    Harness {
        supervisor,
        ledger,
        containerizer,
        properties,
    }
}

fn harness() -> Harness {
    let ledger = Ledger::default();
    harness_with(
        FakeContainerizer {
            ledger: ledger.clone(),
            ..Default::default()
        },
        FakeNetworker {
            ledger: ledger.clone(),
            fail_network: false,
        },
        FakeRootfsProvider {
            ledger,
            fail_create: false,
        },
    )
}

fn spec(handle: Option<&str>) -> ContainerSpec {
    ContainerSpec {
        handle: handle.map(str::to_string),
        rootfs: "/images/busybox".to_string(),
        env: vec!["TERM=xterm".to_string()],
        network: "".to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn create_composes_the_desired_spec_from_all_steps() {
    let h = harness();
    let container = h.supervisor.create(spec(Some("banana"))).await.unwrap();
    assert_eq!(container.handle(), "banana");

    let specs = h.containerizer.specs.lock().unwrap().clone();
    assert_eq!(specs.len(), 1);
    let desired = &specs[0];
    assert_eq!(desired.rootfs_path, PathBuf::from("/provisioned/banana"));
    assert_eq!(
        desired.env,
        vec!["TERM=xterm".to_string(), "ROOTFS_PROVIDED=yes".to_string()]
    );
    let hooks = desired.network_hooks.as_ref().unwrap();
    assert!(hooks.prestart.args.contains(&"--handle=banana".to_string()));
}

#[tokio::test]
async fn create_without_a_handle_generates_one() {
    let h = harness();
    let container = h.supervisor.create(spec(None)).await.unwrap();
    assert_eq!(container.handle(), "generated-handle");
    assert_eq!(
        h.supervisor.containers(&HashMap::new()).await.unwrap(),
        vec!["generated-handle"]
    );
}

#[tokio::test]
async fn create_applies_caller_properties() {
    let h = harness();
    let mut wanted = spec(Some("banana"));
    wanted.properties =
        HashMap::from([("owner".to_string(), "tests".to_string())]);
    h.supervisor.create(wanted).await.unwrap();
    assert_eq!(
        h.properties.get("banana", "owner").unwrap().as_deref(),
        Some("tests")
    );
}

#[tokio::test]
async fn create_rejects_a_colliding_handle_before_any_step_runs() {
    let h = harness();
    h.supervisor.create(spec(Some("banana"))).await.unwrap();
    let before = h.ledger.calls().len();

    let err = h.supervisor.create(spec(Some("banana"))).await.unwrap_err();
    assert!(matches!(err, Error::HandleAlreadyExists(_)));
    assert_eq!(h.ledger.calls().len(), before);
}

#[tokio::test]
async fn failed_network_step_compensates_the_rootfs() {
    let ledger = Ledger::default();
    let h = harness_with(
        FakeContainerizer {
            ledger: ledger.clone(),
            ..Default::default()
        },
        FakeNetworker {
            ledger: ledger.clone(),
            fail_network: true,
        },
        FakeRootfsProvider {
            ledger,
            fail_create: false,
        },
    );

    let err = h.supervisor.create(spec(Some("banana"))).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CreateFailed { step: "network", .. }
    ));

    let calls = h.ledger.calls();
    assert_eq!(
        calls,
        vec![
            "rootfs.create:banana:/images/busybox",
            "network.network:banana:",
            "rootfs.destroy:banana",
        ]
    );
}

#[tokio::test]
async fn failed_containerize_step_compensates_network_then_rootfs() {
    let ledger = Ledger::default();
    let h = harness_with(
        FakeContainerizer {
            ledger: ledger.clone(),
            fail_create: true,
            ..Default::default()
        },
        FakeNetworker {
            ledger: ledger.clone(),
            fail_network: false,
        },
        FakeRootfsProvider {
            ledger,
            fail_create: false,
        },
    );

    let err = h.supervisor.create(spec(Some("banana"))).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CreateFailed {
            step: "containerize",
            ..
        }
    ));

    let network = h.ledger.position("network.destroy:banana").unwrap();
    let rootfs = h.ledger.position("rootfs.destroy:banana").unwrap();
    assert!(network < rootfs, "compensation must run in reverse order");
    assert!(h.supervisor.containers(&HashMap::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_rootfs_step_compensates_nothing() {
    let ledger = Ledger::default();
    let h = harness_with(
        FakeContainerizer {
            ledger: ledger.clone(),
            ..Default::default()
        },
        FakeNetworker {
            ledger: ledger.clone(),
            fail_network: false,
        },
        FakeRootfsProvider {
            ledger,
            fail_create: true,
        },
    );

    let err = h.supervisor.create(spec(Some("banana"))).await.unwrap_err();
    assert!(matches!(err, Error::CreateFailed { step: "rootfs", .. }));
    assert_eq!(h.ledger.calls(), vec!["rootfs.create:banana:/images/busybox"]);
}

// =============================================================================
// Destroy
// =============================================================================

#[tokio::test]
async fn destroy_runs_every_step_in_order() {
    let h = harness();
    h.supervisor.create(spec(Some("banana"))).await.unwrap();
    h.properties.set("banana", "k", "v").unwrap();

    h.supervisor.destroy("banana").await.unwrap();

    let calls = h.ledger.calls();
    let destroy_calls: Vec<&String> = calls
        .iter()
        .filter(|c| c.contains("destroy:banana"))
        .collect();
    assert_eq!(
        destroy_calls,
        vec![
            "containerizer.destroy:banana",
            "network.destroy:banana",
            "rootfs.destroy:banana",
        ]
    );
    assert!(h.properties.all("banana").unwrap().is_empty());
}

#[tokio::test]
async fn destroy_attempts_later_steps_after_an_early_failure() {
    let ledger = Ledger::default();
    let h = harness_with(
        FakeContainerizer {
            ledger: ledger.clone(),
            fail_destroy: true,
            ..Default::default()
        },
        FakeNetworker {
            ledger: ledger.clone(),
            fail_network: false,
        },
        FakeRootfsProvider {
            ledger,
            fail_create: false,
        },
    );
    h.supervisor.create(spec(Some("banana"))).await.unwrap();

    let err = h.supervisor.destroy("banana").await.unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    assert!(h.ledger.position("network.destroy:banana").is_some());
    assert!(h.ledger.position("rootfs.destroy:banana").is_some());
}

#[tokio::test]
async fn destroy_of_an_unknown_handle_is_not_found() {
    let h = harness();
    let err = h.supervisor.destroy("ghost").await.unwrap_err();
    assert!(matches!(err, Error::HandleNotFound(_)));
}

// =============================================================================
// Lookup / Listing
// =============================================================================

#[tokio::test]
async fn lookup_returns_a_proxy_for_live_handles_only() {
    let h = harness();
    h.supervisor.create(spec(Some("banana"))).await.unwrap();

    let container = h.supervisor.lookup("banana").await.unwrap();
    assert_eq!(container.handle(), "banana");
    assert!(matches!(
        h.supervisor.lookup("ghost").await,
        Err(Error::HandleNotFound(_))
    ));
}

#[tokio::test]
async fn containers_filters_by_property_superset() {
    let h = harness();
    let mut a = spec(Some("apple"));
    a.properties = HashMap::from([("color".to_string(), "red".to_string())]);
    h.supervisor.create(a).await.unwrap();

    let mut b = spec(Some("banana"));
    b.properties = HashMap::from([("color".to_string(), "yellow".to_string())]);
    h.supervisor.create(b).await.unwrap();

    let all = h.supervisor.containers(&HashMap::new()).await.unwrap();
    assert_eq!(all, vec!["apple", "banana"]);

    let filter = HashMap::from([("color".to_string(), "yellow".to_string())]);
    assert_eq!(
        h.supervisor.containers(&filter).await.unwrap(),
        vec!["banana"]
    );
}

// =============================================================================
// Bulk Operations
// =============================================================================

#[tokio::test]
async fn bulk_info_aggregates_per_handle() {
    let h = harness();
    h.supervisor.create(spec(Some("apple"))).await.unwrap();
    h.supervisor.create(spec(Some("banana"))).await.unwrap();

    let handles = vec!["apple".to_string(), "banana".to_string()];
    let infos = h.supervisor.bulk_info(&handles).await.unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(
        infos["apple"].as_ref().unwrap().bundle_path,
        PathBuf::from("/depot/apple")
    );
}

#[tokio::test]
async fn bulk_metrics_reports_per_handle_errors_alongside_data() {
    let ledger = Ledger::default();
    let h = harness_with(
        FakeContainerizer {
            ledger: ledger.clone(),
            fail_metrics_for: Some("banana".to_string()),
            ..Default::default()
        },
        FakeNetworker {
            ledger: ledger.clone(),
            fail_network: false,
        },
        FakeRootfsProvider {
            ledger,
            fail_create: false,
        },
    );
    h.supervisor.create(spec(Some("apple"))).await.unwrap();
    h.supervisor.create(spec(Some("banana"))).await.unwrap();

    let handles = vec!["apple".to_string(), "banana".to_string()];
    let metrics = h.supervisor.bulk_metrics(&handles).await.unwrap();
    assert!(metrics["apple"].is_ok());
    assert!(metrics["banana"].is_err());
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn start_runs_starters_in_sequence_then_restores_network_state() {
    let h = harness();
    h.supervisor.create(spec(Some("banana"))).await.unwrap();
    let before = h.ledger.calls().len();

    h.supervisor.start().await.unwrap();

    let calls = h.ledger.calls()[before..].to_vec();
    assert_eq!(
        calls,
        vec!["starter:cgroups", "starter:iptables", "network.restore:banana"]
    );
}

// =============================================================================
// Container Proxy
// =============================================================================

#[tokio::test]
async fn proxy_operations_delegate_by_handle() {
    let h = harness();
    let container = h.supervisor.create(spec(Some("banana"))).await.unwrap();

    let process = container
        .run(
            ProcessSpec {
                path: "/bin/true".to_string(),
                ..Default::default()
            },
            ProcessIo::default(),
        )
        .await
        .unwrap();
    assert_eq!(process.wait().await.unwrap(), 0);

    container.stop(true).await.unwrap();
    let (host, cont) = container.net_in(0, 0).await.unwrap();
    assert_eq!((host, cont), (60000, 80));
    container.net_out(NetOutRule::default()).await.unwrap();

    container.set_property("color", "yellow").unwrap();
    assert_eq!(
        container.property("color").unwrap().as_deref(),
        Some("yellow")
    );

    let calls = h.ledger.calls();
    assert!(calls.contains(&"containerizer.run:banana:/bin/true".to_string()));
    assert!(calls.contains(&"containerizer.stop:banana:true".to_string()));
    assert!(calls.contains(&"network.net-in:banana:0:0".to_string()));
    assert!(calls.contains(&"network.net-out:banana".to_string()));
}
