use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "WSBRIDGE_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl ConfigPathSource {
    /// A file named by the operator must exist; discovered paths may not.
    pub fn is_explicit(self) -> bool {
        matches!(self, ConfigPathSource::Flag | ConfigPathSource::Env)
    }
}

impl fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["wsbridge.yaml", "wsbridge.yml", "wsbridge.toml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/wsbridge/config.yaml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("io", "wsbridge", "wsbridge")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("config.yaml"))
    }
}

/// Loads the resolved file (if any), applies `overrides` on top and validates the result.
pub fn load(resolved: &ResolvedConfigPath, overrides: &Overrides) -> anyhow::Result<Config> {
    let path = &resolved.path;
    let mut fc = match fs::metadata(path) {
        Ok(_) => read_file_config(path)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !resolved.source.is_explicit() => {
            FileConfig::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("config: stat {}", path.display()));
        }
    };
    overrides.apply(&mut fc);
    Config::from_file_config(fc)
}

fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    };
    Ok(fc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Handshake, then discard the opening payload, like the plaintext listener.
    #[default]
    Handshake,
    /// Relay straight after the handshake response.
    Stunnel,
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::Handshake => f.write_str("handshake"),
            TlsMode::Stunnel => f.write_str("stunnel"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub tls_address: String,
    pub dst_address: String,
    pub handshake_code: String,
    pub tls_enabled: bool,
    pub tls_private_key: PathBuf,
    pub tls_public_key: PathBuf,
    pub tls_mode: TlsMode,
    pub metrics_enabled: bool,
    pub metrics_port: String,
    /// Advisory only; accept loops never consult it.
    pub max_connections: usize,
    /// Backend dial timeout.
    pub timeout: Duration,
    pub payload_timeout: Duration,
    pub buffer_size: usize,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

/// Values set on the command line or through `WSBRIDGE_*` variables. `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub address: Option<String>,
    pub tls_address: Option<String>,
    pub dst_address: Option<String>,
    pub handshake_code: Option<String>,
    pub tls_enabled: Option<bool>,
    pub tls_private_key: Option<PathBuf>,
    pub tls_public_key: Option<PathBuf>,
    pub tls_mode: Option<TlsMode>,
    pub metrics_enabled: Option<bool>,
    pub metrics_port: Option<String>,
    pub max_connections: Option<i64>,
    pub timeout: Option<i64>,
    pub payload_timeout: Option<i64>,
    pub buffer_size: Option<i64>,
    pub keep_alive: Option<bool>,
    pub no_delay: Option<bool>,
    pub log_level: Option<String>,
}

impl Overrides {
    fn apply(&self, fc: &mut FileConfig) {
        fn set<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if let Some(v) = src {
                *dst = Some(v.clone());
            }
        }

        set(&mut fc.address, &self.address);
        set(&mut fc.tls_address, &self.tls_address);
        set(&mut fc.dst_address, &self.dst_address);
        set(&mut fc.handshake_code, &self.handshake_code);
        set(&mut fc.tls_enabled, &self.tls_enabled);
        set(
            &mut fc.tls_private_key,
            &self.tls_private_key.as_ref().map(|p| p.display().to_string()),
        );
        set(
            &mut fc.tls_public_key,
            &self.tls_public_key.as_ref().map(|p| p.display().to_string()),
        );
        set(&mut fc.tls_mode, &self.tls_mode);
        set(&mut fc.metrics_enabled, &self.metrics_enabled);
        set(&mut fc.metrics_port, &self.metrics_port);
        set(&mut fc.max_connections, &self.max_connections);
        set(&mut fc.timeout, &self.timeout);
        set(&mut fc.payload_timeout, &self.payload_timeout);
        set(&mut fc.buffer_size, &self.buffer_size);
        set(&mut fc.keep_alive, &self.keep_alive);
        set(&mut fc.no_delay, &self.no_delay);

        // The flag is the most specific level setting there is.
        if let Some(level) = &self.log_level {
            fc.log_level = Some(level.clone());
            if let Some(l) = fc.logging.as_mut() {
                l.level = None;
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    address: Option<String>,
    tls_address: Option<String>,
    dst_address: Option<String>,
    handshake_code: Option<String>,
    tls_enabled: Option<bool>,
    tls_private_key: Option<String>,
    tls_public_key: Option<String>,
    tls_mode: Option<TlsMode>,
    metrics_enabled: Option<bool>,
    metrics_port: Option<String>,
    max_connections: Option<i64>,
    timeout: Option<i64>,
    payload_timeout: Option<i64>,
    buffer_size: Option<i64>,
    keep_alive: Option<bool>,
    no_delay: Option<bool>,
    log_level: Option<String>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// `ENV=production` switches the default log format to JSON.
fn default_log_format(env: Option<&str>) -> &'static str {
    match env.map(str::trim) {
        Some("production") => "json",
        _ => "text",
    }
}

fn trimmed(v: Option<String>, default: &str) -> String {
    v.map(|s| s.trim().to_string())
        .unwrap_or_else(|| default.to_string())
}

fn positive(key: &str, v: Option<i64>, default: i64) -> anyhow::Result<u64> {
    let v = v.unwrap_or(default);
    if v <= 0 {
        anyhow::bail!("config: {key} must be positive (got {v})");
    }
    Ok(v as u64)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let env = std::env::var("ENV").ok();
        let mut logging = LoggingConfig {
            level: "info".into(),
            format: default_log_format(env.as_deref()).into(),
            output: "stdout".into(),
            add_source: false,
        };
        if let Some(level) = &fc.log_level {
            if !level.trim().is_empty() {
                logging.level = level.trim().to_ascii_lowercase();
            }
        }
        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    logging.level = level.trim().to_ascii_lowercase();
                }
            }
            if let Some(format) = &l.format {
                if !format.trim().is_empty() {
                    logging.format = format.trim().to_ascii_lowercase();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    logging.output = out.trim().to_string();
                }
            }
            logging.add_source = l.add_source;
        }

        let payload_timeout = fc.payload_timeout.unwrap_or(0);
        if payload_timeout < 0 {
            anyhow::bail!("config: payload_timeout must not be negative (got {payload_timeout})");
        }

        let cfg = Config {
            address: trimmed(fc.address, ":2086"),
            tls_address: trimmed(fc.tls_address, ":443"),
            dst_address: trimmed(fc.dst_address, "127.0.0.1:22"),
            handshake_code: fc.handshake_code.unwrap_or_default(),
            tls_enabled: fc.tls_enabled.unwrap_or(false),
            tls_private_key: PathBuf::from(trimmed(
                fc.tls_private_key,
                "/etc/wsbridge/tls/private.pem",
            )),
            tls_public_key: PathBuf::from(trimmed(
                fc.tls_public_key,
                "/etc/wsbridge/tls/public.pem",
            )),
            tls_mode: fc.tls_mode.unwrap_or_default(),
            metrics_enabled: fc.metrics_enabled.unwrap_or(false),
            metrics_port: trimmed(fc.metrics_port, ":9090"),
            max_connections: positive("max_connections", fc.max_connections, 1000)? as usize,
            timeout: Duration::from_secs(positive("timeout", fc.timeout, 30)?),
            payload_timeout: Duration::from_secs(payload_timeout as u64),
            buffer_size: positive("buffer_size", fc.buffer_size, 32 * 1024)? as usize,
            keep_alive: fc.keep_alive.unwrap_or(true),
            no_delay: fc.no_delay.unwrap_or(true),
            logging,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tls_enabled {
            if self.tls_private_key.as_os_str().is_empty() {
                anyhow::bail!("config: tls_private_key is required when TLS is enabled");
            }
            if self.tls_public_key.as_os_str().is_empty() {
                anyhow::bail!("config: tls_public_key is required when TLS is enabled");
            }
        }
        if self.dst_address.is_empty() {
            anyhow::bail!("config: dst_address must not be empty");
        }
        Ok(())
    }
}
