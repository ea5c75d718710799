//! Test doubles for the engine's collaborators, and a fixture wiring them
//! into engines that share one cluster's state.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    runtime::testing::TestRuntime,
    testing::TestVersionStore,
    types::{
        Binding,
        ClusterServiceId,
        DeviceId,
        RepositoryFamily,
        RepositoryId,
        SyncedRepository,
        TransportProtocol,
    },
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use url::Url;

use crate::{
    ClusterDirectory,
    ClusterSyncEngine,
    FetchExecutor,
    FetchRequest,
    PushLog,
};

pub struct TestDirectory {
    services: Mutex<HashMap<ClusterServiceId, Vec<Binding>>>,
}

impl TestDirectory {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_bindings(&self, service: impl Into<ClusterServiceId>, bindings: Vec<Binding>) {
        self.services.lock().insert(service.into(), bindings);
    }
}

#[async_trait]
impl ClusterDirectory for TestDirectory {
    async fn active_bindings(&self, service: &ClusterServiceId) -> anyhow::Result<Vec<Binding>> {
        self.services.lock().get(service).cloned().ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::config_error(
                "ClusterServiceUnresolved",
                format!("cluster service {service} cannot be resolved"),
            ))
        })
    }
}

pub struct TestPushLog {
    inner: Mutex<PushLogInner>,
}

struct PushLogInner {
    latest: HashMap<RepositoryId, i64>,
    next_event_id: i64,
}

impl TestPushLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PushLogInner {
                latest: HashMap::new(),
                next_event_id: 1,
            }),
        }
    }

    /// Record a push event (accepted or rejected alike) and return its id.
    pub fn record_push(&self, repository: RepositoryId) -> i64 {
        let mut inner = self.inner.lock();
        let event_id = inner.next_event_id;
        inner.next_event_id += 1;
        inner.latest.insert(repository, event_id);
        event_id
    }
}

#[async_trait]
impl PushLog for TestPushLog {
    async fn latest_event_id(&self, repository: RepositoryId) -> anyhow::Result<Option<i64>> {
        Ok(self.inner.lock().latest.get(&repository).copied())
    }
}

pub struct TestFetchExecutor {
    inner: Mutex<FetchState>,
}

struct FetchState {
    attempts: Vec<Url>,
    failing_hosts: HashSet<String>,
}

impl TestFetchExecutor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FetchState {
                attempts: Vec::new(),
                failing_hosts: HashSet::new(),
            }),
        }
    }

    /// Every fetch attempt against this host fails as if the peer were
    /// unreachable.
    pub fn fail_host(&self, host: &str) {
        self.inner.lock().failing_hosts.insert(host.to_owned());
    }

    /// Every source URI attempted, failures included, in order.
    pub fn attempted_sources(&self) -> Vec<Url> {
        self.inner.lock().attempts.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.inner.lock().attempts.len()
    }
}

#[async_trait]
impl FetchExecutor for TestFetchExecutor {
    async fn fetch(&self, request: FetchRequest<'_>) -> anyhow::Result<()> {
        let host = request.source.host_str().unwrap_or_default().to_owned();
        let mut inner = self.inner.lock();
        inner.attempts.push(request.source.clone());
        if inner.failing_hosts.contains(&host) {
            anyhow::bail!(ErrorMetadata::transient(
                "PeerUnreachable",
                format!("fetch from {host} failed: connection refused"),
            ));
        }
        Ok(())
    }
}

/// One simulated cluster: a shared store, directory, push log, and fetch
/// recorder, from which per-device engines are built.
pub struct SyncFixture {
    pub runtime: TestRuntime,
    pub store: Arc<TestVersionStore>,
    pub directory: Arc<TestDirectory>,
    pub push_log: Arc<TestPushLog>,
    pub fetcher: Arc<TestFetchExecutor>,
    pub repository: SyncedRepository,
    _working_copy: tempfile::TempDir,
}

pub const TEST_SERVICE: &str = "repo-cluster-001";

impl SyncFixture {
    pub fn new() -> Self {
        let working_copy = tempfile::TempDir::new().expect("failed to create working copy");
        let repository = SyncedRepository {
            id: RepositoryId(1),
            display_name: "Widgets".to_owned(),
            family: RepositoryFamily::Git,
            hosted: true,
            cluster_service: Some(ClusterServiceId::from(TEST_SERVICE)),
            working_copy: working_copy.path().to_path_buf(),
            remote_path: "source/widgets.git".to_owned(),
        };
        Self {
            runtime: TestRuntime::new(),
            store: Arc::new(TestVersionStore::new()),
            directory: Arc::new(TestDirectory::new()),
            push_log: Arc::new(TestPushLog::new()),
            fetcher: Arc::new(TestFetchExecutor::new()),
            repository,
            _working_copy: working_copy,
        }
    }

    pub fn ssh_binding(device: &str) -> Binding {
        Binding {
            device: DeviceId::from(device),
            protocol: TransportProtocol::Ssh,
            host: device.to_owned(),
        }
    }

    pub fn http_binding(device: &str) -> Binding {
        Binding {
            device: DeviceId::from(device),
            protocol: TransportProtocol::Http,
            host: device.to_owned(),
        }
    }

    /// Bind the named devices to the fixture's cluster service over ssh.
    pub fn bind_ssh(&self, devices: &[&str]) {
        self.directory.set_bindings(
            TEST_SERVICE,
            devices.iter().map(|d| Self::ssh_binding(d)).collect(),
        );
    }

    pub fn bind(&self, bindings: Vec<Binding>) {
        self.directory.set_bindings(TEST_SERVICE, bindings);
    }

    pub fn engine(&self, device: &str) -> ClusterSyncEngine<TestRuntime> {
        self.engine_for(self.repository.clone(), Some(DeviceId::from(device)))
    }

    pub fn engine_for(
        &self,
        repository: SyncedRepository,
        device: Option<DeviceId>,
    ) -> ClusterSyncEngine<TestRuntime> {
        ClusterSyncEngine::new(
            self.runtime.clone(),
            repository,
            self.store.clone(),
            self.directory.clone(),
            self.push_log.clone(),
            self.fetcher.clone(),
            device,
        )
    }
}
