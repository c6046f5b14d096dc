//! Configuration file management for beast-feed.
//!
//! Reads/writes `~/.beast-feed/config.yaml`: the Beast sources to dial,
//! receiver position, broadcast cadence, decoder switches, and the output
//! consumers to start.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::decode::DecodeOptions;
use crate::store::EVICTION_AGE_SECS;
use crate::types::{BeastError, Result};

/// Default Beast TCP port.
pub const DEFAULT_BEAST_PORT: u16 = 30005;

/// One `host:port` feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = BeastError;

    /// `host:port`, or a bare host on the default Beast port.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| BeastError::Config(format!("invalid port in source '{s}'")))?;
                Ok(Endpoint::new(host, port))
            }
            None if !s.is_empty() => Ok(Endpoint::new(s, DEFAULT_BEAST_PORT)),
            _ => Err(BeastError::Config(format!("invalid source '{s}'"))),
        }
    }
}

/// Built-in snapshot consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Summary table through the log.
    Log,
    /// One JSON line per aircraft on stdout.
    Json,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Log => write!(f, "log"),
            OutputKind::Json => write!(f, "json"),
        }
    }
}

impl FromStr for OutputKind {
    type Err = BeastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(OutputKind::Log),
            "json" => Ok(OutputKind::Json),
            other => Err(BeastError::Config(format!("unknown output '{other}'"))),
        }
    }
}

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub sources: Vec<Endpoint>,
    pub receiver: ReceiverConfig,
    pub broadcast: BroadcastConfig,
    pub decoder: DecoderConfig,
    pub outputs: Vec<OutputKind>,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastConfig {
    pub interval_ms: u64,
    pub max_age_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    pub verify_crc: bool,
    pub fix_errors: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            sources: vec![Endpoint::new("localhost", DEFAULT_BEAST_PORT)],
            receiver: ReceiverConfig {
                lat: None,
                lon: None,
            },
            broadcast: BroadcastConfig {
                interval_ms: 1000,
                max_age_secs: EVICTION_AGE_SECS,
            },
            decoder: DecoderConfig {
                verify_crc: true,
                fix_errors: true,
            },
            outputs: vec![OutputKind::Log],
            debug: false,
        }
    }
}

impl FeedConfig {
    /// Receiver position when both coordinates are set.
    pub fn receiver_position(&self) -> Option<(f64, f64)> {
        self.receiver.lat.zip(self.receiver.lon)
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            verify_crc: self.decoder.verify_crc,
            fix_errors: self.decoder.fix_errors,
            receiver: self.receiver_position(),
        }
    }
}

/// Get the config directory path (`~/.beast-feed/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".beast-feed")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `path`.
///
/// A missing file yields the defaults; an unreadable or malformed one is an
/// error.
pub fn load_config(path: &Path) -> Result<FeedConfig> {
    if !path.exists() {
        return Ok(FeedConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Save config to `path`, creating parent directories.
pub fn save_config(config: &FeedConfig, path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| BeastError::Config(e.to_string()))?;
    }
    std::fs::write(path, serialize_config(config)).map_err(|e| BeastError::Config(e.to_string()))?;
    Ok(path.to_path_buf())
}

/// Parse simple YAML-like config text.
pub fn parse_config(text: &str) -> Result<FeedConfig> {
    let mut config = FeedConfig::default();
    let mut current_section: Option<String> = None;
    let mut sources: Option<Vec<Endpoint>> = None;
    let mut outputs: Option<Vec<OutputKind>> = None;

    for (lineno, line) in text.lines().enumerate() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        if let Some(item) = stripped.strip_prefix("- ") {
            let item = parse_string_value(item.trim()).unwrap_or_default();
            match current_section.as_deref() {
                Some("sources") => sources.get_or_insert_with(Vec::new).push(item.parse()?),
                Some("outputs") => outputs.get_or_insert_with(Vec::new).push(item.parse()?),
                _ => {
                    return Err(BeastError::Config(format!(
                        "line {}: list item outside a list",
                        lineno + 1
                    )))
                }
            }
            continue;
        }

        let Some((key, val)) = stripped.split_once(':') else {
            return Err(BeastError::Config(format!("line {}: expected 'key: value'", lineno + 1)));
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            if val.is_empty() {
                current_section = Some(key.to_string());
            } else {
                current_section = None;
                if key == "debug" {
                    config.debug = parse_bool_value(val).unwrap_or(false);
                }
            }
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };
        match (section, key) {
            ("receiver", "lat") => config.receiver.lat = parse_float_value(val),
            ("receiver", "lon") => config.receiver.lon = parse_float_value(val),
            ("broadcast", "interval_ms") => {
                if let Ok(v) = val.parse::<u64>() {
                    config.broadcast.interval_ms = v.max(1);
                }
            }
            ("broadcast", "max_age_secs") => {
                if let Some(v) = parse_float_value(val) {
                    config.broadcast.max_age_secs = v;
                }
            }
            ("decoder", "verify_crc") => {
                if let Some(v) = parse_bool_value(val) {
                    config.decoder.verify_crc = v;
                }
            }
            ("decoder", "fix_errors") => {
                if let Some(v) = parse_bool_value(val) {
                    config.decoder.fix_errors = v;
                }
            }
            _ => {}
        }
    }

    if let Some(s) = sources {
        config.sources = s;
    }
    if let Some(o) = outputs {
        config.outputs = o;
    }
    Ok(config)
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_float_value(val: &str) -> Option<f64> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    val.parse().ok()
}

fn parse_bool_value(val: &str) -> Option<bool> {
    match val {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &FeedConfig) -> String {
    let mut lines = vec!["# beast-feed configuration".to_string(), String::new()];

    lines.push("sources:".into());
    for src in &config.sources {
        lines.push(format!("  - {src}"));
    }
    lines.push(String::new());

    lines.push("receiver:".into());
    match config.receiver.lat {
        Some(v) => lines.push(format!("  lat: {v}")),
        None => lines.push("  lat: null".into()),
    }
    match config.receiver.lon {
        Some(v) => lines.push(format!("  lon: {v}")),
        None => lines.push("  lon: null".into()),
    }
    lines.push(String::new());

    lines.push("broadcast:".into());
    lines.push(format!("  interval_ms: {}", config.broadcast.interval_ms));
    lines.push(format!("  max_age_secs: {}", config.broadcast.max_age_secs));
    lines.push(String::new());

    lines.push("decoder:".into());
    lines.push(format!("  verify_crc: {}", config.decoder.verify_crc));
    lines.push(format!("  fix_errors: {}", config.decoder.fix_errors));
    lines.push(String::new());

    lines.push("outputs:".into());
    for out in &config.outputs {
        lines.push(format!("  - {out}"));
    }
    lines.push(String::new());

    lines.push(format!("debug: {}", config.debug));

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FeedConfig::default();
        assert_eq!(config.sources, vec![Endpoint::new("localhost", 30005)]);
        assert_eq!(config.broadcast.interval_ms, 1000);
        assert_eq!(config.broadcast.max_age_secs, 59.0);
        assert!(config.decoder.verify_crc);
        assert!(config.receiver_position().is_none());
    }

    #[test]
    fn test_parse_config() {
        let text = r#"
sources:
  - "feeder.local:30005"
  - 10.0.0.2:40005

receiver:
  lat: 35.5
  lon: -82.5

broadcast:
  interval_ms: 500
  max_age_secs: 30

decoder:
  verify_crc: true
  fix_errors: false

outputs:
  - json
  - log

debug: true
"#;
        let config = parse_config(text).unwrap();
        assert_eq!(
            config.sources,
            vec![
                Endpoint::new("feeder.local", 30005),
                Endpoint::new("10.0.0.2", 40005)
            ]
        );
        assert_eq!(config.receiver_position(), Some((35.5, -82.5)));
        assert_eq!(config.broadcast.interval_ms, 500);
        assert_eq!(config.broadcast.max_age_secs, 30.0);
        assert!(!config.decoder.fix_errors);
        assert_eq!(config.outputs, vec![OutputKind::Json, OutputKind::Log]);
        assert!(config.debug);

        let opts = config.decode_options();
        assert!(opts.verify_crc);
        assert!(!opts.fix_errors);
        assert_eq!(opts.receiver, Some((35.5, -82.5)));
    }

    #[test]
    fn test_parse_config_null_values() {
        let text = r#"
receiver:
  lat: null
  lon: ~
"#;
        let config = parse_config(text).unwrap();
        assert!(config.receiver.lat.is_none());
        assert!(config.receiver.lon.is_none());
        assert_eq!(config.sources, FeedConfig::default().sources);
    }

    #[test]
    fn test_parse_config_rejects_bad_source() {
        assert!(parse_config("sources:\n  - host:notaport\n").is_err());
        assert!(parse_config("  - stray\n").is_err());
        assert!(parse_config("outputs:\n  - html\n").is_err());
    }

    #[test]
    fn test_load_config_error_kinds() {
        let dir = tempfile::tempdir().unwrap();
        // A directory is not a readable file.
        assert!(matches!(load_config(dir.path()), Err(BeastError::Io(_))));

        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "outputs:\n  - html\n").unwrap();
        match load_config(&path) {
            Err(BeastError::Config(msg)) => assert!(msg.contains("html")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!("a.b:1".parse::<Endpoint>().unwrap(), Endpoint::new("a.b", 1));
        assert_eq!("radar".parse::<Endpoint>().unwrap(), Endpoint::new("radar", 30005));
        assert!(":30005".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
        assert_eq!(Endpoint::new("x", 2).to_string(), "x:2");
    }

    #[test]
    fn test_roundtrip() {
        let config = FeedConfig {
            sources: vec![Endpoint::new("a", 1), Endpoint::new("b", 2)],
            receiver: ReceiverConfig {
                lat: Some(35.5),
                lon: Some(-82.5),
            },
            broadcast: BroadcastConfig {
                interval_ms: 250,
                max_age_secs: 59.0,
            },
            decoder: DecoderConfig {
                verify_crc: false,
                fix_errors: false,
            },
            outputs: vec![OutputKind::Json],
            debug: true,
        };
        let parsed = parse_config(&serialize_config(&config)).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        assert_eq!(load_config(&path).unwrap(), FeedConfig::default());

        let mut config = FeedConfig::default();
        config.sources = vec![Endpoint::new("radar", 30005)];
        let written = save_config(&config, &path).unwrap();
        assert_eq!(written, path);
        assert_eq!(load_config(&path).unwrap(), config);
    }
}
