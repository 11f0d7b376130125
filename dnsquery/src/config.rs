use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::registry::DEFAULT_UPDATE_URL;

pub use duration::parse_duration;

/// Session wide defaults. Every field can be overridden per query through
/// [`QueryOptions`](crate::QueryOptions) except the registry settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Extra attempts after the first one; `-1` retries until success or abort.
    pub retries: i32,
    /// Inactivity timeout of one attempt.
    #[serde(with = "duration")]
    pub timeout: Duration,
    /// Download the resolver registry. When off, only the bundled list is used.
    pub update: bool,
    pub update_url: String,
    /// Keep the downloaded registry in a sqlite file across runs.
    pub persist: bool,
    pub persist_path: PathBuf,
    #[serde(with = "duration")]
    pub max_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            retries: 5,
            timeout: Duration::from_secs(30),
            update: true,
            update_url: DEFAULT_UPDATE_URL.to_string(),
            persist: false,
            persist_path: std::env::temp_dir().join("dnsquery.sqlite"),
            max_age: Duration::from_secs(300),
        }
    }
}

impl SessionConfig {
    pub fn from_config_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        SessionConfig::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> io::Result<Self> {
        let conf: SessionConfig = serde_yaml::from_reader(reader)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> io::Result<()> {
        if self.retries < -1 {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("retries must be -1 or more, got {}", self.retries),
            ));
        }
        if self.update && self.update_url.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "update_url can not be empty when update is enabled.",
            ));
        }
        Ok(())
    }
}

mod duration {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    /// Parses `300ms`, `10s` or `5m`.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let n: u64 = num
            .parse()
            .map_err(|_| format!("invalid value: {s}, expected 10s, 10ms or 10m"))?;
        match unit.trim() {
            "ms" => Ok(Duration::from_millis(n)),
            "s" => Ok(Duration::from_secs(n)),
            "m" => n
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("invalid value: {s}, expected 10s, 10ms or 10m")),
            _ => Err(format!("invalid value: {s}, expected 10s, 10ms or 10m")),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(|_| {
            Error::invalid_value(serde::de::Unexpected::Str(&s), &"10s, 10ms or 10m")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("8ms"), Ok(Duration::from_millis(8)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10h").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let yaml = r#"
retries: 2
timeout: 500ms
persist: true
persist_path: /tmp/registry.sqlite
"#;
        let conf = SessionConfig::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(conf.retries, 2);
        assert_eq!(conf.timeout, Duration::from_millis(500));
        assert!(conf.persist);
        assert_eq!(conf.persist_path, PathBuf::from("/tmp/registry.sqlite"));
        assert!(conf.update);
        assert_eq!(conf.update_url, DEFAULT_UPDATE_URL);
        assert_eq!(conf.max_age, Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_config() {
        let err = SessionConfig::from_reader("retries: -2".as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let err = SessionConfig::from_reader("timeout: soon".as_bytes()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
