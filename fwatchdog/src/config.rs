//! Watchdog configuration read from environment variables.
//!
//! [`Config::from_env`] is a pure function over a lookup closure, so tests
//! can build configurations without touching the process environment.

use std::time::Duration;

/// Default socket read/write timeout.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Default HTTP port for function traffic.
pub const DEFAULT_PORT: u16 = 8080;

/// Default HTTP port for the metrics listener.
pub const DEFAULT_METRICS_PORT: u16 = 8081;

/// Errors produced while reading the configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// `fprocess` is missing or blank.
    #[error("provide a valid process via the fprocess environment variable")]
    MissingProcess,

    /// A variable holds a value that cannot be parsed.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// Environment variable name.
        key: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Immutable watchdog configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Function command line, split on whitespace.
    pub process: Vec<String>,
    /// Bound on reading request headers and body.
    pub read_timeout: Duration,
    /// Bound on producing the response.
    pub write_timeout: Duration,
    /// Hard limit on child run time. `None` means unlimited.
    pub exec_timeout: Option<Duration>,
    /// Grace window for in-flight requests after a shutdown signal.
    pub shutdown_timeout: Duration,
    /// Function traffic port.
    pub port: u16,
    /// Metrics listener port.
    pub metrics_port: u16,
    /// Log child output and timing details.
    pub write_debug: bool,
    /// Merge stderr into the response body.
    pub combine_output: bool,
    /// Project request metadata into `Http_*` environment variables.
    pub cgi_headers: bool,
    /// Wrap the request in a JSON envelope before piping it to the child.
    pub marshal_request: bool,
    /// Skip writing the readiness lock file.
    pub suppress_lock: bool,
    /// Log inbound and outbound headers.
    pub debug_headers: bool,
    /// Keep one long-lived child and frame requests over its stdio.
    pub afterburn: bool,
    /// Forced response `Content-Type`.
    pub content_type: Option<String>,
    /// Maximum simultaneous requests; `0` disables the limiter.
    pub max_inflight: u64,
}

impl Config {
    /// Reads the configuration from the current process environment.
    pub fn from_process_env() -> Result<Self, ConfigError> {
        Self::from_env(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// Absent and empty variables fall back to their defaults.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let process: Vec<String> = get("fprocess")
            .map(|v| v.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        if process.is_empty() {
            return Err(ConfigError::MissingProcess);
        }

        let read_timeout =
            duration_var(get("read_timeout"), "read_timeout")?.unwrap_or(DEFAULT_IO_TIMEOUT);
        let write_timeout =
            duration_var(get("write_timeout"), "write_timeout")?.unwrap_or(DEFAULT_IO_TIMEOUT);
        let exec_timeout = duration_var(get("exec_timeout"), "exec_timeout")?;
        let shutdown_timeout =
            duration_var(get("shutdown_timeout"), "shutdown_timeout")?.unwrap_or(write_timeout);

        Ok(Self {
            process,
            read_timeout,
            write_timeout,
            exec_timeout,
            shutdown_timeout,
            port: port_var(get("port"), "port")?.unwrap_or(DEFAULT_PORT),
            metrics_port: port_var(get("metrics_port"), "metrics_port")?
                .unwrap_or(DEFAULT_METRICS_PORT),
            write_debug: get("write_debug").is_some_and(|v| parse_bool(&v)),
            combine_output: get("combine_output").is_some_and(|v| parse_bool(&v)),
            cgi_headers: get("cgi_headers").is_none_or(|v| parse_bool(&v)),
            marshal_request: get("marshal_request").is_some_and(|v| parse_bool(&v)),
            suppress_lock: get("suppress_lock").is_some_and(|v| parse_bool(&v)),
            debug_headers: get("debug_headers").is_some_and(|v| parse_bool(&v)),
            afterburn: get("afterburn").is_some_and(|v| parse_bool(&v)),
            content_type: get("content_type"),
            max_inflight: match get("max_inflight") {
                Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: "max_inflight",
                    value: v,
                })?,
                None => 0,
            },
        })
    }

    /// Builds a configuration for `process` with every other field at its
    /// default.
    pub fn for_process(process: &str) -> Result<Self, ConfigError> {
        let process = process.to_owned();
        Self::from_env(move |key| (key == "fprocess").then(|| process.clone()))
    }
}

/// Parses a boolean flag: `true`, `1`, `yes` and `on` are true.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Parses whole seconds or a unit-suffixed duration. Zero yields `None`.
fn duration_var(value: Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = parse_duration(value.trim()).ok_or(ConfigError::Invalid { key, value })?;
    Ok(Some(parsed).filter(|d| !d.is_zero()))
}

/// Parses a TCP port.
fn port_var(value: Option<String>, key: &'static str) -> Result<Option<u16>, ConfigError> {
    value
        .map(|v| v.trim().parse().map_err(|_| ConfigError::Invalid { key, value: v }))
        .transpose()
}

/// Parses `"30"` as seconds, or a sequence of `<decimal><unit>` terms such
/// as `"1m30s"` or `"1.5h"`. Units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut rest = s;
    let mut total = 0f64;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(Duration::from_nanos(total.round() as u64))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn read(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Config::from_env(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = read(&[("fprocess", "cat")]).unwrap();
        assert_eq!(cfg.process, vec!["cat"]);
        assert_eq!(cfg.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.write_timeout, Duration::from_secs(5));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(cfg.exec_timeout, None);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.metrics_port, 8081);
        assert!(cfg.cgi_headers);
        assert!(!cfg.write_debug);
        assert!(!cfg.combine_output);
        assert!(!cfg.marshal_request);
        assert!(!cfg.suppress_lock);
        assert!(!cfg.debug_headers);
        assert!(!cfg.afterburn);
        assert_eq!(cfg.content_type, None);
        assert_eq!(cfg.max_inflight, 0);
    }

    #[test]
    fn missing_or_blank_process_is_fatal() {
        assert!(matches!(read(&[]), Err(ConfigError::MissingProcess)));
        assert!(matches!(
            read(&[("fprocess", "   ")]),
            Err(ConfigError::MissingProcess)
        ));
    }

    #[test]
    fn process_is_split_on_whitespace() {
        let cfg = read(&[("fprocess", "  sleep\t 2 ")]).unwrap();
        assert_eq!(cfg.process, vec!["sleep", "2"]);
    }

    #[test]
    fn timeouts_accept_seconds_and_durations() {
        let cfg = read(&[
            ("fprocess", "cat"),
            ("read_timeout", "10"),
            ("write_timeout", "1m30s"),
            ("exec_timeout", "100ms"),
        ])
        .unwrap();
        assert_eq!(cfg.read_timeout, Duration::from_secs(10));
        assert_eq!(cfg.write_timeout, Duration::from_secs(90));
        assert_eq!(cfg.exec_timeout, Some(Duration::from_millis(100)));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(90));
    }

    #[test]
    fn zero_timeouts_mean_default() {
        let cfg = read(&[
            ("fprocess", "cat"),
            ("read_timeout", "0"),
            ("exec_timeout", "0s"),
        ])
        .unwrap();
        assert_eq!(cfg.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.exec_timeout, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            read(&[("fprocess", "cat"), ("exec_timeout", "soon")]),
            Err(ConfigError::Invalid { key: "exec_timeout", .. })
        ));
        assert!(matches!(
            read(&[("fprocess", "cat"), ("port", "70000")]),
            Err(ConfigError::Invalid { key: "port", .. })
        ));
        assert!(matches!(
            read(&[("fprocess", "cat"), ("max_inflight", "-1")]),
            Err(ConfigError::Invalid { key: "max_inflight", .. })
        ));
    }

    #[test]
    fn boolean_spellings() {
        for v in ["true", "1", "yes", "on", "TRUE", "On"] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["false", "0", "no", "off", "", "nope"] {
            assert!(!parse_bool(v), "{v}");
        }

        let cfg = read(&[
            ("fprocess", "cat"),
            ("cgi_headers", "false"),
            ("write_debug", "yes"),
            ("combine_output", "1"),
            ("marshal_request", "on"),
            ("suppress_lock", "true"),
            ("debug_headers", "true"),
        ])
        .unwrap();
        assert!(!cfg.cgi_headers);
        assert!(cfg.write_debug);
        assert!(cfg.combine_output);
        assert!(cfg.marshal_request);
        assert!(cfg.suppress_lock);
        assert!(cfg.debug_headers);
    }

    #[test]
    fn ports_content_type_and_inflight() {
        let cfg = read(&[
            ("fprocess", "cat"),
            ("port", "3000"),
            ("metrics_port", "3001"),
            ("content_type", "application/json"),
            ("max_inflight", "4"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.metrics_port, 3001);
        assert_eq!(cfg.content_type.as_deref(), Some("application/json"));
        assert_eq!(cfg.max_inflight, 4);
    }

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2m3s"), Some(Duration::from_secs(123)));
        assert_eq!(parse_duration("250us"), Some(Duration::from_micros(250)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("-1s"), None);
    }
}
