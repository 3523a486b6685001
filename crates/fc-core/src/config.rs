use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::framework::FrameworkConfig;
use crate::resource::{FrameworkId, ResourceRegistry};

const DEFAULT_CFG_ENV: &str = "FC_SERVER_CFG_PATH";
const DEFAULT_CFG_FILENAME: &str = "cfg.yaml";

/// Raw shape of `managed_resources` before it's flattened into a
/// [`ResourceRegistry`]: either an inline nested map or the name of a file
/// holding the same shape, resolved relative to the config file's directory
/// unless it's absolute.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawManagedResources {
    Inline(HashMap<String, HashMap<String, Vec<String>>>),
    File(String),
}

#[derive(Debug, Deserialize)]
struct RawApiServer {
    port: Option<u16>,
    publish_port: Option<u16>,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    #[serde(default)]
    enable: bool,
    instance_name: Option<String>,
    etcd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    managed_resources: RawManagedResources,
    registered_frameworks: Vec<String>,
    frameworks_config: HashMap<String, RawFrameworkConfig>,
    #[serde(default)]
    priority_scheduler: bool,
    api_server: RawApiServer,
    cluster: Option<RawCluster>,
}

#[derive(Debug, Deserialize)]
struct RawFrameworkConfig {
    priority: i64,
    #[serde(rename = "seize", default = "raw_default_true")]
    seize_enabled: bool,
    #[serde(default = "raw_default_schedule_interval")]
    schedule_interval: u32,
    #[serde(default)]
    default: bool,
}

fn raw_default_true() -> bool {
    true
}

fn raw_default_schedule_interval() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub port: u16,
    pub publish_port: u16,
    pub ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub instance_name: String,
    pub etcd: String,
}

/// Fully validated, load-time-immutable configuration for one coordinator
/// process. Faithfully mirrors `fc_server/core/config.py`'s `Config.parse`:
/// every validation failure here is fatal (the caller should log and exit
/// before entering the tick loop, never treat these as recoverable).
#[derive(Debug, Clone)]
pub struct Config {
    pub resources: ResourceRegistry,
    pub registered_frameworks: Vec<FrameworkId>,
    pub frameworks: HashMap<FrameworkId, FrameworkConfig>,
    pub priority_scheduler: bool,
    pub api_server: ApiServerConfig,
    pub cluster: Option<ClusterConfig>,
    pub default_framework: Option<FrameworkId>,
}

impl Config {
    /// Load from `$FC_SERVER_CFG_PATH` if set, else `<fc_path>/config/cfg.yaml`.
    pub fn load(fc_path: &Path) -> Result<Self, ConfigError> {
        let cfg_path = std::env::var(DEFAULT_CFG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| fc_path.join("config").join(DEFAULT_CFG_FILENAME));

        Self::load_from(&cfg_path)
    }

    /// Load and validate from an explicit path. Split out from [`Self::load`]
    /// so tests can point at a `tempfile` fixture without touching the
    /// environment.
    pub fn load_from(cfg_path: &Path) -> Result<Self, ConfigError> {
        let raw_text = std::fs::read_to_string(cfg_path).map_err(|source| ConfigError::NotFound {
            path: cfg_path.display().to_string(),
            source,
        })?;

        let raw: RawConfig =
            serde_yaml::from_str(&raw_text).map_err(|source| ConfigError::Parse {
                path: cfg_path.display().to_string(),
                source,
            })?;

        let config_dir = cfg_path.parent().unwrap_or_else(|| Path::new("."));

        let resources = Self::load_managed_resources(raw.managed_resources, config_dir)?;

        let mut frameworks = HashMap::new();
        let mut defaults = Vec::new();
        for (name, raw_fw) in raw.frameworks_config {
            if raw_fw.default {
                defaults.push(name.clone());
            }
            frameworks.insert(
                name.clone(),
                FrameworkConfig {
                    name: name.clone(),
                    priority: raw_fw.priority,
                    seize_enabled: raw_fw.seize_enabled,
                    schedule_interval: raw_fw.schedule_interval,
                    is_default: raw_fw.default,
                },
            );
        }

        if defaults.len() > 1 {
            return Err(ConfigError::MultipleDefaultFrameworks(defaults));
        }
        let default_framework = defaults.into_iter().next();

        for name in &raw.registered_frameworks {
            if !frameworks.contains_key(name) {
                return Err(ConfigError::UnknownFramework(name.clone()));
            }
        }

        let cluster = match raw.cluster {
            Some(raw_cluster) if raw_cluster.enable => {
                let (Some(instance_name), Some(etcd)) =
                    (raw_cluster.instance_name, raw_cluster.etcd)
                else {
                    return Err(ConfigError::IncompleteClusterConfig);
                };
                Some(ClusterConfig { instance_name, etcd })
            }
            _ => None,
        };

        let port = raw.api_server.port.ok_or_else(|| ConfigError::MissingField {
            section: "api_server".to_string(),
            field: "port".to_string(),
        })?;
        let publish_port = raw.api_server.publish_port.unwrap_or(port);

        if cluster.is_some() && raw.api_server.ip.is_none() {
            return Err(ConfigError::MissingApiServerIp);
        }

        let api_server = ApiServerConfig {
            port,
            publish_port,
            ip: raw.api_server.ip,
        };

        Ok(Config {
            resources,
            registered_frameworks: raw.registered_frameworks,
            frameworks,
            priority_scheduler: raw.priority_scheduler,
            api_server,
            cluster,
            default_framework,
        })
    }

    fn load_managed_resources(
        raw: RawManagedResources,
        config_dir: &Path,
    ) -> Result<ResourceRegistry, ConfigError> {
        let nested = match raw {
            RawManagedResources::Inline(map) => map,
            RawManagedResources::File(filename) => {
                let path = Path::new(&filename);
                let resolved = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    config_dir.join(path)
                };
                let text =
                    std::fs::read_to_string(&resolved).map_err(|source| {
                        ConfigError::ManagedResourcesNotFound {
                            path: resolved.display().to_string(),
                            source,
                        }
                    })?;
                serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: resolved.display().to_string(),
                    source,
                })?
            }
        };

        let mut registry = ResourceRegistry::new();
        for (farm_type, by_device_type) in nested {
            for (device_type, ids) in by_device_type {
                for id in ids {
                    registry.insert(id, farm_type.clone(), device_type.clone());
                }
            }
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_cfg(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    const BASE: &str = r#"
managed_resources:
  lab-a:
    imx8mm-evk:
      - imx8mm-evk-sh11
      - imx8mm-evk-sh12
registered_frameworks:
  - lava
frameworks_config:
  lava:
    priority: 1
api_server:
  port: 8080
"#;

    #[test]
    fn loads_inline_managed_resources() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cfg(&dir, "cfg.yaml", BASE);
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.resources.len(), 2);
        assert!(cfg.resources.contains("imx8mm-evk-sh11"));
        assert_eq!(cfg.api_server.port, 8080);
        assert_eq!(cfg.api_server.publish_port, 8080);
        assert!(cfg.default_framework.is_none());
    }

    #[test]
    fn loads_managed_resources_from_external_file() {
        let dir = tempfile::tempdir().unwrap();
        write_cfg(
            &dir,
            "resources.yaml",
            "lab-a:\n  imx8mm-evk:\n    - imx8mm-evk-sh11\n",
        );
        let cfg_text = r#"
managed_resources: resources.yaml
registered_frameworks: []
frameworks_config: {}
api_server:
  port: 8080
"#;
        let path = write_cfg(&dir, "cfg.yaml", cfg_text);
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.resources.len(), 1);
    }

    #[test]
    fn missing_port_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_text = BASE.replace("  port: 8080\n", "");
        let path = write_cfg(&dir, "cfg.yaml", &cfg_text);
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn more_than_one_default_framework_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_text = r#"
managed_resources:
  lab-a:
    imx8mm-evk:
      - imx8mm-evk-sh11
registered_frameworks: []
frameworks_config:
  lava:
    priority: 1
    default: true
  labgrid:
    priority: 2
    default: true
api_server:
  port: 8080
"#;
        let path = write_cfg(&dir, "cfg.yaml", cfg_text);
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MultipleDefaultFrameworks(_)));
    }

    #[test]
    fn cluster_enabled_without_instance_name_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_text = format!("{BASE}\ncluster:\n  enable: true\n");
        let path = write_cfg(&dir, "cfg.yaml", &cfg_text);
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteClusterConfig));
    }

    #[test]
    fn cluster_enabled_requires_api_server_ip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_text = format!(
            "{BASE}\ncluster:\n  enable: true\n  instance_name: fc-1\n  etcd: http://localhost:2379\n"
        );
        let path = write_cfg(&dir, "cfg.yaml", &cfg_text);
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiServerIp));
    }

    #[test]
    fn registered_framework_must_have_config_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_text = BASE.replace("  - lava\n", "  - lava\n  - ghost\n");
        let path = write_cfg(&dir, "cfg.yaml", &cfg_text);
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFramework(name) if name == "ghost"));
    }

    #[test]
    fn missing_file_is_not_found_error() {
        let err = Config::load_from(Path::new("/nonexistent/cfg.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn seize_false_is_read_from_the_seize_yaml_key() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_text = BASE.replace("    priority: 1\n", "    priority: 1\n    seize: false\n");
        let path = write_cfg(&dir, "cfg.yaml", &cfg_text);
        let cfg = Config::load_from(&path).unwrap();
        assert!(!cfg.frameworks["lava"].seize_enabled);
    }

    #[test]
    fn seize_defaults_to_true_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cfg(&dir, "cfg.yaml", BASE);
        let cfg = Config::load_from(&path).unwrap();
        assert!(cfg.frameworks["lava"].seize_enabled);
    }
}
