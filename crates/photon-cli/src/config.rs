//! Configuration Vault – reads/writes `~/.photon/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use photon_kernel::{InterlockConfig, WatchdogConfig};
use photon_runtime::EngineConfig;
use photon_types::PhotonError;
use serde::{Deserialize, Serialize};

/// Where the GPIO microcontroller is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioEndpoint {
    /// In-process simulated peer.
    Sim,
    /// TCP serial bridge at `host:port`.
    Tcp(String),
}

impl GpioEndpoint {
    pub fn parse(raw: &str) -> Result<Self, PhotonError> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("sim") {
            return Ok(Self::Sim);
        }
        match raw.strip_prefix("tcp://") {
            Some(addr) if addr.contains(':') => Ok(Self::Tcp(addr.to_string())),
            _ => Err(PhotonError::Config(format!(
                "unsupported GPIO endpoint {raw:?} (expected \"sim\" or \"tcp://host:port\")"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    /// `sim` or `tcp://host:port`.
    pub endpoint: String,
    pub response_timeout_ms: u64,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            endpoint: "sim".to_string(),
            response_timeout_ms: 1_000,
        }
    }
}

/// Persisted operator configuration stored in `~/.photon/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gpio: GpioConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub interlock: InterlockConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Relative `/run` and `/validate` paths are resolved against this
    /// directory when they do not exist as given.
    #[serde(default = "default_protocol_dir")]
    pub protocol_dir: PathBuf,

    /// Calibration bypass of the laser interlocks.  Never overrides an
    /// emergency stop.
    #[serde(default)]
    pub developer_mode: bool,
}

fn default_protocol_dir() -> PathBuf {
    PathBuf::from("protocols")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gpio: GpioConfig::default(),
            watchdog: WatchdogConfig::default(),
            interlock: InterlockConfig::default(),
            engine: EngineConfig::default(),
            protocol_dir: default_protocol_dir(),
            developer_mode: false,
        }
    }
}

impl Config {
    pub fn gpio_endpoint(&self) -> Result<GpioEndpoint, PhotonError> {
        GpioEndpoint::parse(&self.gpio.endpoint)
    }

    /// Check every component config before anything is wired up.
    pub fn validate(&self) -> Result<(), PhotonError> {
        self.gpio_endpoint()?;
        self.watchdog.validate()?;
        self.interlock.validate()?;
        self.engine.validate()?;
        Ok(())
    }

    /// Resolve a protocol path given on the command line.
    pub fn resolve_protocol(&self, arg: &str) -> PathBuf {
        let given = PathBuf::from(arg);
        if given.is_absolute() || given.exists() {
            given
        } else {
            self.protocol_dir.join(given)
        }
    }
}

/// Return the path to `~/.photon/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".photon").join("config.toml")
}

/// Load the config from disk with environment overrides applied.
/// Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, PhotonError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, PhotonError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| PhotonError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| PhotonError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `PHOTON_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PHOTON_GPIO_ENDPOINT` | `gpio.endpoint` |
/// | `PHOTON_HEARTBEAT_INTERVAL_MS` | `watchdog.heartbeat_interval_ms` |
/// | `PHOTON_DEVELOPER_MODE` | `developer_mode` (`1`/`true`/`yes`) |
/// | `PHOTON_PROTOCOL_DIR` | `protocol_dir` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("PHOTON_GPIO_ENDPOINT") {
        cfg.gpio.endpoint = v;
    }
    if let Some(v) = lookup("PHOTON_HEARTBEAT_INTERVAL_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.watchdog.heartbeat_interval_ms = ms;
    }
    if let Some(v) = lookup("PHOTON_DEVELOPER_MODE") {
        cfg.developer_mode = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
    if let Some(v) = lookup("PHOTON_PROTOCOL_DIR") {
        cfg.protocol_dir = PathBuf::from(v);
    }
}

/// Save the config to disk, creating `~/.photon/` if necessary.
pub fn save(cfg: &Config) -> Result<(), PhotonError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), PhotonError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PhotonError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                PhotonError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| PhotonError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| PhotonError::Config(format!("failed to write {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| PhotonError::Config(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(GpioEndpoint::parse("sim").unwrap(), GpioEndpoint::Sim);
        assert_eq!(
            GpioEndpoint::parse("tcp://10.0.0.5:4000").unwrap(),
            GpioEndpoint::Tcp("10.0.0.5:4000".into())
        );
        assert!(GpioEndpoint::parse("/dev/ttyUSB0").is_err());
        assert!(GpioEndpoint::parse("tcp://nohost").is_err());
    }

    #[test]
    fn defaults_carry_reference_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.watchdog.heartbeat_interval_ms, 500);
        assert_eq!(cfg.watchdog.hardware_timeout_ms, 1_000);
        assert_eq!(cfg.interlock.debounce_samples, 3);
        assert_eq!(cfg.engine.action_timeout_ms, 60_000);
        assert!(!cfg.developer_mode);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let mut cfg = Config::default();
        cfg.gpio.endpoint = "tcp://bench:7000".into();
        cfg.engine.max_attempts = 5;
        save_to(&cfg, &path).unwrap();
        let back = load_from(&path).unwrap().unwrap();
        assert_eq!(back.engine.max_attempts, 5);
        assert_eq!(back.gpio_endpoint().unwrap(), GpioEndpoint::Tcp("bench:7000".into()));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_from(&dir.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[watchdog]\nheartbeat_interval_ms = 250\n").unwrap();
        let cfg: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(cfg.watchdog.heartbeat_interval_ms, 250);
        assert_eq!(cfg.watchdog.max_consecutive_failures, 3);
        assert_eq!(cfg.gpio.endpoint, "sim");
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("PHOTON_GPIO_ENDPOINT", "tcp://lab:9000"),
            ("PHOTON_HEARTBEAT_INTERVAL_MS", "200"),
            ("PHOTON_DEVELOPER_MODE", "yes"),
            ("PHOTON_PROTOCOL_DIR", "/srv/protocols"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        apply_overrides_from(&mut cfg, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.gpio.endpoint, "tcp://lab:9000");
        assert_eq!(cfg.watchdog.heartbeat_interval_ms, 200);
        assert!(cfg.developer_mode);
        assert_eq!(cfg.protocol_dir, PathBuf::from("/srv/protocols"));
    }

    #[test]
    fn bad_heartbeat_override_is_ignored() {
        let mut cfg = Config::default();
        apply_overrides_from(&mut cfg, |k| {
            (k == "PHOTON_HEARTBEAT_INTERVAL_MS").then(|| "fast".to_string())
        });
        assert_eq!(cfg.watchdog.heartbeat_interval_ms, 500);
    }

    #[test]
    fn resolve_protocol_falls_back_to_protocol_dir() {
        let cfg = Config {
            protocol_dir: PathBuf::from("/srv/protocols"),
            ..Config::default()
        };
        assert_eq!(
            cfg.resolve_protocol("does-not-exist.json"),
            PathBuf::from("/srv/protocols/does-not-exist.json")
        );
        assert_eq!(cfg.resolve_protocol("/abs/p.json"), PathBuf::from("/abs/p.json"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).unwrap();

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
