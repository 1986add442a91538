use std::{
    env,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use hostman_guest::HostOptions;
use thiserror::Error;
use tokio::fs::read_to_string;
use tracing::debug;

pub const CONFIG_ENV: &str = "HOSTMAN_CONFIG";
pub const CONFIG_FILE: &str = "hostman.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub options: HostOptions,
}

impl Config {
    /// `--config`, then `$HOSTMAN_CONFIG`, then `./hostman.toml`.
    pub fn resolve_path(config_path: Option<&Path>) -> PathBuf {
        config_path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    /// Loads host options; a missing file means all defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = if path.is_dir() {
            path.join(CONFIG_FILE)
        } else {
            path.to_owned()
        };
        let options = match read_to_string(&path).await {
            Ok(string) => Self::parse(&path, &string)?,
            Err(source) if source.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                HostOptions::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Ok(Config { path, options })
    }

    fn parse(path: &Path, string: &str) -> Result<HostOptions, ConfigError> {
        toml::from_str(string).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use hostman_guest::options::{BridgeDev, BridgeDriver};

    use super::*;

    const SAMPLE: &str = r#"
servers_path = "/srv/guests"
default_qemu_version = "4.2.0"
set_vnc_password = true

[qemu_binaries]
"4.2.0" = "/usr/local/qemu-4.2.0/bin/qemu-system-x86_64"

[bridges.br0]
device = "br0"

[bridges.vpc]
device = "brvpc"
driver = "openvswitch"

[machine_cpu_max]
q35 = 240
"#;

    #[tokio::test]
    async fn parses_host_options() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), SAMPLE).unwrap();

        let config = Config::load(dir.path()).await.unwrap();
        let options = config.options;
        assert_eq!(config.path, dir.path().join(CONFIG_FILE));
        assert_eq!(options.servers_path, PathBuf::from("/srv/guests"));
        assert_eq!(options.hugepages_path, PathBuf::from("/dev/hugepages"));
        assert!(options.set_vnc_password);
        assert!(options.enable_vm_uuid);
        assert_eq!(options.ovn_encap_cost, 58);
        assert_eq!(
            options.bridges.get("vpc"),
            Some(&BridgeDev {
                device: "brvpc".to_owned(),
                driver: BridgeDriver::Openvswitch,
            })
        );
        assert_eq!(options.bridges["br0"].driver, BridgeDriver::Linux);
        assert_eq!(options.machine_cpu_max, BTreeMap::from([("q35".to_owned(), 240)]));
    }

    #[tokio::test]
    async fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.options, HostOptions::default());
    }

    #[tokio::test]
    async fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "servers_path = [").unwrap();
        assert!(matches!(
            Config::load(&path).await,
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn explicit_path_wins() {
        assert_eq!(
            Config::resolve_path(Some(Path::new("/etc/hostman.toml"))),
            PathBuf::from("/etc/hostman.toml")
        );
    }
}
