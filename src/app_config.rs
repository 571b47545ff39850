//! Config file defaults for the CLI.
//!
//! The file is a flat list of `key = value` lines. Strings are double-quoted
//! with `\"` and `\\` escapes, numbers are bare, and `#` starts a comment
//! outside of a string. `rate_limit` accepts unit suffixes (`512K`, `4MiB`).

use std::env;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use rangeload::units::parse_bytes;

const TIMEOUT_RANGE_SECS: RangeInclusive<u64> = 1..=3600;

/// Values read from the config file; `None` means "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    /// Bytes per second, `0` = unlimited.
    pub rate_limit: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Parses config text and validates the result.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut cfg = Self::default();
        for (index, line) in raw.lines().enumerate() {
            let number = index + 1;
            let Some((name, value)) = split_entry(line)
                .with_context(|| format!("Invalid config syntax on line {number}"))?
            else {
                continue;
            };
            let key = ConfigKey::lookup(name)
                .ok_or_else(|| anyhow!("Unknown configuration key '{name}' on line {number}"))?;
            cfg.apply(key, value)
                .with_context(|| format!("Invalid `{key}` value on line {number}"))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks that both timeouts, when set, are within 1..=3600 seconds.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            (ConfigKey::ConnectTimeoutSecs, self.connect_timeout_secs),
            (ConfigKey::ReadTimeoutSecs, self.read_timeout_secs),
        ] {
            if let Some(secs) = value
                && !TIMEOUT_RANGE_SECS.contains(&secs)
            {
                bail!(
                    "`{key}` must be within {}..={} seconds, got {secs}",
                    TIMEOUT_RANGE_SECS.start(),
                    TIMEOUT_RANGE_SECS.end()
                );
            }
        }
        Ok(())
    }

    fn apply(&mut self, key: ConfigKey, value: &str) -> Result<()> {
        match key {
            ConfigKey::OutputDir => self.output_dir = Some(PathBuf::from(unquote(value)?)),
            ConfigKey::RateLimit => self.rate_limit = Some(parse_bytes(value)?),
            ConfigKey::ConnectTimeoutSecs => self.connect_timeout_secs = Some(parse_seconds(value)?),
            ConfigKey::ReadTimeoutSecs => self.read_timeout_secs = Some(parse_seconds(value)?),
            ConfigKey::Verbosity => self.verbosity = Some(unquote(value)?.parse()?),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigKey {
    OutputDir,
    RateLimit,
    ConnectTimeoutSecs,
    ReadTimeoutSecs,
    Verbosity,
}

impl ConfigKey {
    const ALL: [Self; 5] = [
        Self::OutputDir,
        Self::RateLimit,
        Self::ConnectTimeoutSecs,
        Self::ReadTimeoutSecs,
        Self::Verbosity,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::OutputDir => "output_dir",
            Self::RateLimit => "rate_limit",
            Self::ConnectTimeoutSecs => "connect_timeout_secs",
            Self::ReadTimeoutSecs => "read_timeout_secs",
            Self::Verbosity => "verbosity",
        }
    }

    fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log level preset selectable from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Tracing filter directive for this mode.
    #[must_use]
    pub fn filter(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose | Self::Debug => "debug",
            Self::Quiet => "error",
        }
    }
}

impl FromStr for VerbositySetting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "verbose" => Ok(Self::Verbose),
            "quiet" => Ok(Self::Quiet),
            "debug" => Ok(Self::Debug),
            other => bail!("expected one of default, verbose, quiet, debug; got '{other}'"),
        }
    }
}

/// `$XDG_CONFIG_HOME/rangeload/config.toml`, else
/// `$HOME/.config/rangeload/config.toml`. Empty variables count as unset.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    let non_empty = |name: &str| env::var_os(name).filter(|value| !value.is_empty());
    non_empty("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| non_empty("HOME").map(|home| PathBuf::from(home).join(".config")))
        .map(|base| base.join("rangeload").join("config.toml"))
}

/// Loads the config file, or an empty config when there is none.
pub fn load_default_file_config() -> Result<FileConfig> {
    let Some(path) = config_path() else {
        return Ok(FileConfig::default());
    };
    match fs::read_to_string(&path) {
        Ok(raw) => FileConfig::parse(&raw)
            .with_context(|| format!("Failed to parse config file '{}'", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read config file '{}'", path.display()))
        }
    }
}

/// Splits a line into trimmed key and value; `None` for blank or comment lines.
fn split_entry(line: &str) -> Result<Option<(&str, &str)>> {
    let line = without_comment(line).trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| anyhow!("expected `key = value`"))?;
    Ok(Some((key.trim(), value.trim())))
}

fn without_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in line.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> Result<String> {
    let inner = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| anyhow!("expected a double-quoted string"))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(escaped @ ('"' | '\\')) => out.push(escaped),
                Some(other) => bail!("unsupported escape '\\{other}'"),
                None => bail!("dangling backslash"),
            },
            '"' => bail!("unescaped quote inside string"),
            _ => out.push(ch),
        }
    }
    Ok(out)
}

fn parse_seconds(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| anyhow!("expected a whole number of seconds, got '{value}'"))
}
