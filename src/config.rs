//! Service options, loaded from an optional YAML file

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use flowmirror_common::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collector::{CollectorConfig, ScalingPolicy};
use crate::{FlowmirrorError, Result};

/// Largest UDP payload
const MAX_UDP_SIZE: usize = 65_535;
/// Smallest receive buffer that still holds a header and one set
const MIN_UDP_SIZE: usize = 64;

/// Queue backends understood by `mq-name`
pub const MQ_NAMES: &[&str] = &["none", "log"];

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|cpus| cpus.get())
        .unwrap_or(1)
        * 10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Options {
    pub verbose: bool,
    /// Address every collector binds to
    pub bind_addr: IpAddr,
    pub flow_forward_cfg: PathBuf,
    pub queue_forward_cfg: PathBuf,
    pub dynamic_workers: bool,
    /// Cap on decode workers across all protocols
    pub max_workers: usize,

    pub netflow9_enabled: bool,
    pub netflow9_port: u16,
    pub netflow9_udp_size: usize,
    pub netflow9_workers: usize,
    pub netflow9_queue_size: usize,
    pub netflow9_topic: String,
    pub netflow9_tpl_cache_file: Option<PathBuf>,

    pub ipfix_enabled: bool,
    pub ipfix_port: u16,
    pub ipfix_udp_size: usize,
    pub ipfix_workers: usize,
    pub ipfix_queue_size: usize,
    pub ipfix_topic: String,
    pub ipfix_tpl_cache_file: Option<PathBuf>,

    pub mirror_queue_size: usize,
    /// UDP source port of mirrored datagrams
    pub mirror_source_port: u16,

    pub mq_name: String,
    pub mq_queue_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verbose: false,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            flow_forward_cfg: PathBuf::from("/etc/vflow/flow-forward.conf"),
            queue_forward_cfg: PathBuf::from("/etc/vflow/queue-forward.conf"),
            dynamic_workers: true,
            max_workers: default_max_workers(),

            netflow9_enabled: true,
            netflow9_port: 4729,
            netflow9_udp_size: 1500,
            netflow9_workers: 200,
            netflow9_queue_size: 10_000,
            netflow9_topic: "vflow.netflow9".to_string(),
            netflow9_tpl_cache_file: Some(PathBuf::from("/tmp/netflowv9.templates")),

            ipfix_enabled: true,
            ipfix_port: 4739,
            ipfix_udp_size: 1500,
            ipfix_workers: 200,
            ipfix_queue_size: 10_000,
            ipfix_topic: "vflow.ipfix".to_string(),
            ipfix_tpl_cache_file: Some(PathBuf::from("/tmp/vflow.templates")),

            mirror_queue_size: 1_000,
            mirror_source_port: crate::mirror::DEFAULT_SOURCE_PORT,

            mq_name: "none".to_string(),
            mq_queue_size: crate::producer::DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Settings of one protocol's collector
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolOptions {
    pub version: Version,
    pub enabled: bool,
    pub port: u16,
    pub udp_size: usize,
    pub workers: usize,
    pub queue_size: usize,
    pub topic: String,
    pub template_file: Option<PathBuf>,
}

impl ProtocolOptions {
    pub fn collector_config(&self, bind_addr: IpAddr, dynamic_workers: bool) -> CollectorConfig {
        CollectorConfig {
            name: self.version.as_str().to_string(),
            bind: SocketAddr::new(bind_addr, self.port),
            workers: self.workers,
            queue_size: self.queue_size,
            udp_size: self.udp_size,
            scaling: dynamic_workers.then(ScalingPolicy::default),
        }
    }
}

impl Options {
    /// Defaults overlaid with `path`, when given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path).map_err(|e| {
            FlowmirrorError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let options = Self::from_yaml(&content)
            .map_err(|e| FlowmirrorError::ConfigError(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded options from {}", path.display());
        Ok(options)
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    pub fn protocol(&self, version: Version) -> ProtocolOptions {
        match version {
            Version::NetflowV9 => ProtocolOptions {
                version,
                enabled: self.netflow9_enabled,
                port: self.netflow9_port,
                udp_size: self.netflow9_udp_size,
                workers: self.netflow9_workers,
                queue_size: self.netflow9_queue_size,
                topic: self.netflow9_topic.clone(),
                template_file: self.netflow9_tpl_cache_file.clone(),
            },
            Version::Ipfix => ProtocolOptions {
                version,
                enabled: self.ipfix_enabled,
                port: self.ipfix_port,
                udp_size: self.ipfix_udp_size,
                workers: self.ipfix_workers,
                queue_size: self.ipfix_queue_size,
                topic: self.ipfix_topic.clone(),
                template_file: self.ipfix_tpl_cache_file.clone(),
            },
        }
    }

    /// Enabled protocols, NetFlow v9 first
    pub fn enabled_protocols(&self) -> Vec<ProtocolOptions> {
        [Version::NetflowV9, Version::Ipfix]
            .into_iter()
            .map(|version| self.protocol(version))
            .filter(|protocol| protocol.enabled)
            .collect()
    }

    pub fn mq_enabled(&self) -> bool {
        self.mq_name != "none"
    }

    pub fn validate(&self) -> Result<()> {
        let protocols = self.enabled_protocols();
        if protocols.is_empty() {
            return Err(invalid("no collector enabled"));
        }

        let mut baseline = 0usize;
        for protocol in &protocols {
            let name = protocol.version.as_str();
            if protocol.workers == 0 {
                return Err(invalid(format!("{}-workers must be at least 1", name)));
            }
            if protocol.queue_size == 0 {
                return Err(invalid(format!("{}-queue-size must be at least 1", name)));
            }
            if !(MIN_UDP_SIZE..=MAX_UDP_SIZE).contains(&protocol.udp_size) {
                return Err(invalid(format!(
                    "{}-udp-size must be between {} and {}",
                    name, MIN_UDP_SIZE, MAX_UDP_SIZE
                )));
            }
            if self.mq_enabled() && protocol.topic.trim().is_empty() {
                return Err(invalid(format!("{}-topic is empty", name)));
            }
            baseline += protocol.workers;
        }

        if protocols.len() == 2
            && protocols[0].port == protocols[1].port
            && protocols[0].port != 0
        {
            return Err(invalid(format!(
                "netflow9 and ipfix both use port {}",
                protocols[0].port
            )));
        }
        if baseline > self.max_workers {
            return Err(invalid(format!(
                "max-workers {} is below the {} baseline workers",
                self.max_workers, baseline
            )));
        }
        if self.mirror_queue_size == 0 || self.mq_queue_size == 0 {
            return Err(invalid("queue sizes must be at least 1"));
        }
        if !MQ_NAMES.contains(&self.mq_name.as_str()) {
            return Err(invalid(format!(
                "unknown mq-name {:?}, expected one of {:?}",
                self.mq_name, MQ_NAMES
            )));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> FlowmirrorError {
    FlowmirrorError::ConfigError(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let options = Options::default();
        options.validate().unwrap();
        assert!(!options.mq_enabled());
        assert_eq!(options.protocol(Version::NetflowV9).port, 4729);
        assert_eq!(options.protocol(Version::Ipfix).topic, "vflow.ipfix");
        assert_eq!(options.enabled_protocols().len(), 2);
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let options = Options::from_yaml(
            concat!(
                "ipfix-enabled: false\n",
                "netflow9-port: 2055\n",
                "mq-name: log\n",
                "flow-forward-cfg: /tmp/mirror.json\n",
            ),
        )
        .unwrap();
        assert!(!options.ipfix_enabled);
        assert_eq!(options.netflow9_port, 2055);
        assert_eq!(options.netflow9_workers, 200);
        assert!(options.mq_enabled());
        assert_eq!(options.flow_forward_cfg, PathBuf::from("/tmp/mirror.json"));

        let protocols = options.enabled_protocols();
        assert_eq!(protocols.len(), 1);
        assert_eq!(protocols[0].version, Version::NetflowV9);
    }

    #[test]
    fn test_collector_config() {
        let options = Options::default();
        let config = options
            .protocol(Version::Ipfix)
            .collector_config(options.bind_addr, true);
        assert_eq!(config.name, "ipfix");
        assert_eq!(config.bind.port(), 4739);
        assert!(config.scaling.is_some());
        assert!(options
            .protocol(Version::Ipfix)
            .collector_config(options.bind_addr, false)
            .scaling
            .is_none());
    }

    #[test]
    fn test_validation_errors() {
        let mut options = Options::default();
        options.ipfix_port = 4729;
        assert!(options.validate().is_err());

        let mut options = Options::default();
        options.netflow9_workers = 0;
        assert!(options.validate().is_err());

        let mut options = Options::default();
        options.max_workers = 10;
        assert!(options.validate().is_err());

        let mut options = Options::default();
        options.mq_name = "kafka".to_string();
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("kafka"));

        let mut options = Options::default();
        options.netflow9_enabled = false;
        options.ipfix_enabled = false;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_load_file() {
        assert_eq!(Options::load(None).unwrap(), Options::default());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dynamic-workers: false").unwrap();
        writeln!(file, "mirror-source-port: 7000").unwrap();
        let options = Options::load(Some(file.path())).unwrap();
        assert!(!options.dynamic_workers);
        assert_eq!(options.mirror_source_port, 7000);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "netflow9-port: [1, 2]").unwrap();
        assert!(matches!(
            Options::load(Some(bad.path())),
            Err(FlowmirrorError::ConfigError(_))
        ));
        assert!(Options::load(Some(Path::new("/nonexistent/vflow.conf"))).is_err());
    }
}
