use thiserror::Error;

/// Configuration errors are fatal: the process exits before the tick loop
/// starts (see `main`). They are kept separate from runtime errors because
/// nothing downstream of `Config::load` is allowed to treat them as
/// recoverable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cfg.yaml not found at {path}: {source}")]
    NotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path} as YAML: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("managed_resources file {path} not found: {source}")]
    ManagedResourcesNotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{field}` is mandatory in {section}")]
    MissingField { section: String, field: String },

    #[error("at most one default framework may be configured, found: {0:?}")]
    MultipleDefaultFrameworks(Vec<String>),

    #[error("cluster.instance_name and cluster.etcd are mandatory when cluster.enable is true")]
    IncompleteClusterConfig,

    #[error("api_server.ip is mandatory when cluster.enable is true")]
    MissingApiServerIp,

    #[error("registered_frameworks references unknown framework `{0}` (no frameworks_config entry)")]
    UnknownFramework(String),
}
