use common::{HttpWorkerClient, InstanceConnectionInfo, WorkerProtocol};
use std::sync::Arc;
use std::time::Duration;

/// Cómo llega el coordinador a un worker.
pub trait WorkerConnector: Send + Sync {
    fn connect(&self, instance: &InstanceConnectionInfo) -> Arc<dyn WorkerProtocol>;
}

/// HTTP contra el puerto RPC del worker.
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl WorkerConnector for HttpConnector {
    fn connect(&self, instance: &InstanceConnectionInfo) -> Arc<dyn WorkerProtocol> {
        Arc::new(HttpWorkerClient::with_timeout(instance.base_url(), self.timeout))
    }
}
