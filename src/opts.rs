//! Connection options.

use std::time::Duration;

use no_panic::no_panic;
use url::Url;

use crate::error::Error;

/// Default bound on a single readiness wait.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// SSL connection mode.
///
/// The driver has no TLS layer: a server that accepts the SSLRequest makes
/// the connection attempt fail with `Error::NotSupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't send an SSLRequest
    #[default]
    Disable,
    /// Send an SSLRequest and continue unencrypted if the server declines
    Prefer,
    /// Fail unless the server accepts SSL
    Require,
}

/// Connection options for PostgreSQL.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `"localhost"`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket path. Takes precedence over `host`/`port` when set.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name to use.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// SSL connection mode.
    ///
    /// Default: `SslMode::Disable`
    pub ssl_mode: SslMode,

    /// Additional startup parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,

    /// Upper bound for establishing the TCP connection.
    ///
    /// Default: `None`
    pub connect_timeout: Option<Duration>,

    /// Whether each statement commits on its own.
    ///
    /// Default: `false`
    pub autocommit: bool,

    /// Longest single readiness wait. Interruption is noticed at least this often.
    ///
    /// Default: `100ms`
    pub wait_interval: Duration,
}

impl Default for Opts {
    #[no_panic]
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            socket: None,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::Disable,
            params: Vec::new(),
            connect_timeout: None,
            autocommit: false,
            wait_interval: DEFAULT_WAIT_INTERVAL,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "True" | "1" | "yes" | "on" => Ok(true),
        "false" | "False" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidUsage(format!("Invalid {}: {}", key, value))),
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@]host[:port][/database][?param1=value1&..]`
    ///
    /// Supported query parameters:
    /// - `sslmode`: disable, prefer, require
    /// - `application_name`: application name
    /// - `connect_timeout`: seconds (0 means no timeout)
    /// - `autocommit`: true/True/1/yes/on or false/False/0/no/off
    /// - `host`: a path starting with `/` selects a Unix socket directory
    ///
    /// Other keys are sent as startup parameters.
    #[no_panic]
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "postgresql"].contains(&url.scheme()) {
            return Err(Error::InvalidUsage(format!(
                "Invalid scheme: expected 'postgres://' or 'postgresql://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            user: url.username().to_string(),
            password: url.password().map(|s| s.to_string()),
            database: url
                .path()
                .strip_prefix('/')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            ..Opts::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => {
                    opts.ssl_mode = match value.as_ref() {
                        "disable" => SslMode::Disable,
                        "prefer" => SslMode::Prefer,
                        "require" => SslMode::Require,
                        _ => {
                            return Err(Error::InvalidUsage(format!(
                                "Invalid sslmode: expected one of ['disable', 'prefer', 'require'], got {}",
                                value
                            )));
                        }
                    };
                }
                "application_name" => {
                    opts.application_name = Some(value.to_string());
                }
                "connect_timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid connect_timeout: {}", value))
                    })?;
                    opts.connect_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "autocommit" => {
                    opts.autocommit = parse_bool("autocommit", &value)?;
                }
                "host" if value.starts_with('/') => {
                    opts.socket = Some(format!("{}/.s.PGSQL.{}", value, opts.port));
                }
                _ => {
                    opts.params.push((key.to_string(), value.to_string()));
                }
            }
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    #[no_panic]
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Opts::default();
        assert_eq!(opts.port, 5432);
        assert!(!opts.autocommit);
        assert_eq!(opts.wait_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_parse_url() {
        let opts = Opts::try_from(
            "postgres://alice:pw@db.local:6543/app?sslmode=prefer&connect_timeout=3&autocommit=on&search_path=s1",
        )
        .unwrap();
        assert_eq!(opts.host, "db.local");
        assert_eq!(opts.port, 6543);
        assert_eq!(opts.user, "alice");
        assert_eq!(opts.password.as_deref(), Some("pw"));
        assert_eq!(opts.database.as_deref(), Some("app"));
        assert_eq!(opts.ssl_mode, SslMode::Prefer);
        assert_eq!(opts.connect_timeout, Some(Duration::from_secs(3)));
        assert!(opts.autocommit);
        assert_eq!(opts.params, vec![("search_path".into(), "s1".into())]);
    }

    #[test]
    fn test_socket_host() {
        let opts = Opts::try_from("postgres://u@localhost/db?host=/var/run/postgresql").unwrap();
        assert_eq!(opts.socket.as_deref(), Some("/var/run/postgresql/.s.PGSQL.5432"));
    }

    #[test]
    fn test_reject_bad_values() {
        assert!(Opts::try_from("mysql://u@h/db").is_err());
        assert!(Opts::try_from("postgres://u@h/db?sslmode=verify").is_err());
        assert!(Opts::try_from("postgres://u@h/db?autocommit=maybe").is_err());
        assert!(Opts::try_from("postgres://u@h/db?connect_timeout=-1").is_err());
    }
}
