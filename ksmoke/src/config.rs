//! Environment configuration for ksmoke
//!
//! Every run is driven by four environment variables. A variable that is set
//! wins even when it holds the empty string; only an unset variable falls back
//! to its default.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fmt;

/// Number of messages to send and acknowledgments to wait for
pub const TIMES: &str = "TIMES";
/// Destination topic
pub const TOPIC_NAME: &str = "TOPIC_NAME";
/// Bootstrap broker host
pub const KAFKA_BOOTSTRAP_HOST: &str = "KAFKA_BOOTSTRAP_HOST";
/// Bootstrap broker port
pub const KAFKA_BOOTSTRAP_PORT: &str = "KAFKA_BOOTSTRAP_PORT";

pub const DEFAULT_TIMES: i64 = 1;
pub const DEFAULT_TOPIC_NAME: &str = "myTopic";
pub const DEFAULT_BOOTSTRAP_HOST: &str = "localhost";
pub const DEFAULT_BOOTSTRAP_PORT: i64 = 9092;

/// Reads named settings through a lookup function
///
/// The lookup returns `None` for unset variables. Production code binds it to
/// the process environment; tests hand in a map.
pub struct Resolver<F>
where
    F: Fn(&str) -> Option<OsString>,
{
    lookup: F,
}

impl<F> Resolver<F>
where
    F: Fn(&str) -> Option<OsString>,
{
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }

    /// Returns the variable's value if set, else `fallback`
    pub fn env_string(&self, name: &str, fallback: &str) -> String {
        match (self.lookup)(name) {
            Some(value) => value.to_string_lossy().into_owned(),
            None => fallback.to_string(),
        }
    }

    /// Resolves like [`Resolver::env_string`], then parses base-10
    pub fn env_int(&self, name: &str, fallback: i64) -> Result<i64> {
        let value = self.env_string(name, &fallback.to_string());
        value.parse::<i64>().map_err(|source| Error::ConfigParse {
            name: name.to_string(),
            value,
            source,
        })
    }
}

/// Resolver bound to the process environment
pub fn process_env() -> Resolver<fn(&str) -> Option<OsString>> {
    let lookup: fn(&str) -> Option<OsString> = |name| std::env::var_os(name);
    Resolver::new(lookup)
}

/// Settings resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker_host: String,
    pub broker_port: i64,
    pub topic_name: String,
    pub message_count: i64,
}

impl Settings {
    /// Resolves all settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::resolve(&process_env())
    }

    /// Resolves all settings through `resolver`
    ///
    /// `TIMES` is resolved first so that a malformed count is reported before
    /// anything about the broker.
    pub fn resolve<F>(resolver: &Resolver<F>) -> Result<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let message_count = resolver.env_int(TIMES, DEFAULT_TIMES)?;
        let topic_name = resolver.env_string(TOPIC_NAME, DEFAULT_TOPIC_NAME);
        let broker_host = resolver.env_string(KAFKA_BOOTSTRAP_HOST, DEFAULT_BOOTSTRAP_HOST);
        let broker_port = resolver.env_int(KAFKA_BOOTSTRAP_PORT, DEFAULT_BOOTSTRAP_PORT)?;

        Ok(Self {
            broker_host,
            broker_port,
            topic_name,
            message_count,
        })
    }

    /// Validates host and port into a connectable address
    pub fn bootstrap_address(&self) -> Result<BootstrapAddress> {
        BootstrapAddress::new(&self.broker_host, self.broker_port)
    }
}

/// A validated `host:port` pair for the bootstrap broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapAddress {
    host: String,
    port: u16,
}

impl BootstrapAddress {
    pub fn new(host: &str, port: i64) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::ConnectionConfig(
                "bootstrap.servers: empty broker host".to_string(),
            ));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                Error::ConnectionConfig(format!(
                    "bootstrap.servers: port {} is outside 1-65535",
                    port
                ))
            })?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BootstrapAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver(vars: &[(&str, &str)]) -> Resolver<impl Fn(&str) -> Option<OsString>> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        Resolver::new(move |name: &str| map.get(name).cloned())
    }

    #[test]
    fn test_unset_returns_fallback() {
        let r = resolver(&[]);
        assert_eq!(r.env_string("TOPIC_NAME", "myTopic"), "myTopic");
        assert_eq!(r.env_int("TIMES", 1).unwrap(), 1);
        assert_eq!(r.env_int("KAFKA_BOOTSTRAP_PORT", 9092).unwrap(), 9092);
    }

    #[test]
    fn test_empty_string_counts_as_set() {
        let r = resolver(&[("TOPIC_NAME", "")]);
        assert_eq!(r.env_string("TOPIC_NAME", "myTopic"), "");

        let r = resolver(&[("TIMES", "")]);
        assert!(matches!(r.env_int("TIMES", 1), Err(Error::ConfigParse { .. })));
    }

    #[test]
    fn test_int_parsing_matches_native_parser() {
        for text in ["0", "3", "-7", "+12", "9223372036854775807", "-9223372036854775808"] {
            let r = resolver(&[("TIMES", text)]);
            assert_eq!(r.env_int("TIMES", 1).unwrap(), text.parse::<i64>().unwrap());
        }
    }

    #[test]
    fn test_invalid_int_is_parse_error() {
        for text in ["not-a-number", " 3", "3.0", "0x10", "99999999999999999999"] {
            let r = resolver(&[("TIMES", text)]);
            match r.env_int("TIMES", 1) {
                Err(Error::ConfigParse { name, value, .. }) => {
                    assert_eq!(name, "TIMES");
                    assert_eq!(value, text);
                }
                other => panic!("Expected ConfigParse for {:?}, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::resolve(&resolver(&[])).unwrap();
        assert_eq!(
            settings,
            Settings {
                broker_host: "localhost".to_string(),
                broker_port: 9092,
                topic_name: "myTopic".to_string(),
                message_count: 1,
            }
        );
        assert_eq!(settings.bootstrap_address().unwrap().to_string(), "localhost:9092");
    }

    #[test]
    fn test_settings_overrides() {
        let settings = Settings::resolve(&resolver(&[
            ("TIMES", "3"),
            ("TOPIC_NAME", "test"),
            ("KAFKA_BOOTSTRAP_HOST", "kafka.internal"),
            ("KAFKA_BOOTSTRAP_PORT", "19092"),
        ]))
        .unwrap();
        assert_eq!(settings.message_count, 3);
        assert_eq!(settings.topic_name, "test");
        assert_eq!(
            settings.bootstrap_address().unwrap().to_string(),
            "kafka.internal:19092"
        );
    }

    #[test]
    fn test_bad_times_fails_before_port() {
        let err = Settings::resolve(&resolver(&[
            ("TIMES", "not-a-number"),
            ("KAFKA_BOOTSTRAP_PORT", "also-bad"),
        ]))
        .unwrap_err();
        match err {
            Error::ConfigParse { name, .. } => assert_eq!(name, "TIMES"),
            other => panic!("Expected ConfigParse, got {:?}", other),
        }
    }

    #[test]
    fn test_bootstrap_address_rejects_bad_values() {
        assert!(matches!(
            BootstrapAddress::new("", 9092),
            Err(Error::ConnectionConfig(_))
        ));
        assert!(matches!(
            BootstrapAddress::new("localhost", 0),
            Err(Error::ConnectionConfig(_))
        ));
        assert!(matches!(
            BootstrapAddress::new("localhost", 70000),
            Err(Error::ConnectionConfig(_))
        ));
        assert!(matches!(
            BootstrapAddress::new("localhost", -1),
            Err(Error::ConnectionConfig(_))
        ));
        assert_eq!(BootstrapAddress::new("localhost", 65535).unwrap().port(), 65535);
    }
}
