pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors possible to occur during reconciliation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },
    /// The managed ensemble could not be reached or refused a metadata operation
    #[error("ZooKeeper ensemble error: {0}")]
    ZooKeeperError(String),
    /// Error in user input or ZookeeperCluster resource definition
    #[error("Invalid ZookeeperCluster resource: {0}")]
    UserInputError(String),
    #[error("Invalid trace id")]
    InvalidTraceId,
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError { .. } => "kube_error",
            Error::ZooKeeperError(_) => "zookeeper_error",
            Error::UserInputError(_) => "user_input_error",
            Error::InvalidTraceId => "invalid_trace_id",
        }
        .to_string()
    }
}
