use testfleet_common::{BuildId, ExecutableId, WorkerId};

/// Computes the namespaced key names for one build (spec §6).
///
/// With no `namespace` configured, keys are `build:{build_id}:<entity>`.
/// With `namespace` set, the prefix becomes `{namespace}:#{build_id}`.
#[derive(Clone, Debug)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(build_id: &BuildId, namespace: Option<&str>) -> Self {
        let prefix = match namespace {
            Some(ns) => format!("{}:#{}", ns, build_id.as_str()),
            None => format!("build:{}", build_id.as_str()),
        };
        Self { prefix }
    }

    fn key(&self, entity: &str) -> String {
        format!("{}:{}", self.prefix, entity)
    }

    /// The raw namespace prefix, usable as a map key by [`MemoryKv`](crate::kv::MemoryKv)
    /// to scope one build's state.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue(&self) -> String {
        self.key("queue")
    }
    pub fn running(&self) -> String {
        self.key("running")
    }
    pub fn processed(&self) -> String {
        self.key("processed")
    }
    pub fn owners(&self) -> String {
        self.key("owners")
    }
    pub fn heartbeats(&self) -> String {
        self.key("heartbeats")
    }
    pub fn worker_queue(&self, worker_id: &WorkerId) -> String {
        self.key(&format!("worker:{}:queue", worker_id.as_str()))
    }
    pub fn workers(&self) -> String {
        self.key("workers")
    }
    pub fn master_state(&self) -> String {
        self.key("master-status")
    }
    pub fn master_worker_id(&self) -> String {
        self.key("master-worker-id")
    }
    pub fn master_setup_heartbeat(&self) -> String {
        self.key("master-setup-heartbeat")
    }
    pub fn total(&self) -> String {
        self.key("total")
    }
    pub fn created_at(&self) -> String {
        self.key("created-at")
    }
    pub fn test_failed_count(&self) -> String {
        self.key("test_failed_count")
    }
    pub fn requeues_count(&self) -> String {
        self.key("requeues-count")
    }
    pub fn error_reports(&self) -> String {
        self.key("error-reports")
    }
    pub fn flaky_reports(&self) -> String {
        self.key("flaky-reports")
    }
    pub fn warnings(&self) -> String {
        self.key("warnings")
    }
    pub fn chunk(&self, id: &ExecutableId) -> String {
        self.key(&format!("chunk:{}", id.as_str()))
    }
    pub fn chunks(&self) -> String {
        self.key("chunks")
    }
    pub fn test_group_timeout(&self) -> String {
        self.key("test-group-timeout")
    }
}
