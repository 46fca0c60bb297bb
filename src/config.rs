use std::fmt;
use std::time::Duration;

use crate::errors::{Error, Result};

pub(crate) const DEFAULT_PORT: u16 = 33_000;
pub(crate) const DEFAULT_RC_TIME_SECS: u64 = 600;
pub(crate) const DEFAULT_SLOW_QUERY_THRESHOLD_MILLIS: u64 = 60_000;
pub(crate) const ALTER_HOST_MAX_SIZE: usize = 4;

const DEFAULT_POOL_SIZE: usize = 10;
const DEFAULT_MAX_WAIT_MILLIS: u64 = 1_000;
const DEFAULT_MAX_OPEN_PREPARED_STATEMENT: usize = 1_000;

/// A broker address. All host bookkeeping (alternate hosts, reachability)
/// is keyed by this pair.
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

    fn parse(s: &str, default_port: u16) -> Result<Self> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Error::InvalidUrl(format!("invalid port in host {s:?}")))?,
            ),
            None => (s, default_port),
        };
        if host.is_empty() {
            return Err(Error::InvalidUrl(format!("empty host in {s:?}")));
        }
        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbmsKind {
    Cubrid,
    CubridOracle,
    CubridMysql,
}

impl DbmsKind {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cubrid" => Ok(DbmsKind::Cubrid),
            "cubrid-oracle" => Ok(DbmsKind::CubridOracle),
            "cubrid-mysql" => Ok(DbmsKind::CubridMysql),
            other => Err(Error::InvalidUrl(format!("unknown dbms kind {other:?}"))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            DbmsKind::Cubrid => "cubrid",
            DbmsKind::CubridOracle => "cubrid-oracle",
            DbmsKind::CubridMysql => "cubrid-mysql",
        }
    }
}

/// Server-session isolation levels, including the aliases older brokers
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRAN_READ_COMMITTED" | "TRAN_REP_CLASS_COMMIT_INSTANCE" => {
                Ok(IsolationLevel::ReadCommitted)
            }
            "TRAN_REPEATABLE_READ" | "TRAN_REP_CLASS_REP_INSTANCE" => {
                Ok(IsolationLevel::RepeatableRead)
            }
            "TRAN_SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(Error::InvalidPropertyValue {
                key: "default_isolation".into(),
                value: s.into(),
            }),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            IsolationLevel::ReadCommitted => 4,
            IsolationLevel::RepeatableRead => 5,
            IsolationLevel::Serializable => 6,
        }
    }

    pub fn from_wire(v: i32) -> Result<Self> {
        match v {
            4 => Ok(IsolationLevel::ReadCommitted),
            5 => Ok(IsolationLevel::RepeatableRead),
            6 => Ok(IsolationLevel::Serializable),
            _ => Err(Error::InvalidArgs("isolation level")),
        }
    }
}

/// A case-insensitive property bag, the programmatic twin of the URL
/// query string.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

pub(crate) fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let norm = normalize_key(&key);
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(k, _)| normalize_key(k) == norm)
        {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let norm = normalize_key(key);
        self.entries
            .iter()
            .find(|(k, _)| normalize_key(k) == norm)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn get_usize(&self, key: &str, default: usize, min: usize) -> Result<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.parse::<usize>() {
                Ok(n) if n >= min => Ok(n),
                _ => Err(Error::InvalidPropertyValue {
                    key: key.into(),
                    value: v.into(),
                }),
            },
        }
    }

    pub(crate) fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.parse::<u64>().map_err(|_| Error::InvalidPropertyValue {
                key: key.into(),
                value: v.into(),
            }),
        }
    }

    pub(crate) fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(Error::InvalidPropertyValue {
                    key: key.into(),
                    value: v.into(),
                }),
            },
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}

/// The options that come out of parsing a `cci:` URL.
///
/// `cci:<kind>:<host>:<port>:<db>:<user>:<password>:?<k>=<v>(&<k>=<v>)*`
#[derive(Debug, Clone)]
pub struct UrlConfig {
    pub kind: DbmsKind,
    pub endpoint: Endpoint,
    pub db: String,
    pub user: String,
    pub password: String,
    /// Alternate brokers to fail over to, capped at [`ALTER_HOST_MAX_SIZE`].
    pub alt_hosts: Vec<Endpoint>,
    /// Cooldown before a failed host is probed again for failback.
    pub rc_time: Duration,
    pub login_timeout: Option<Duration>,
    pub query_timeout: Option<Duration>,
    pub disconnect_on_query_timeout: bool,
    pub slow_query_threshold: Duration,
    canonical: String,
}

impl UrlConfig {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("cci:")
            .or_else(|| url.strip_prefix("CCI:"))
            .ok_or_else(|| Error::InvalidUrl(format!("missing cci: scheme in {url:?}")))?;

        let (body, query) = match rest.split_once('?') {
            Some((body, query)) => (body.trim_end_matches(':'), Some(query)),
            None => (rest.trim_end_matches(':'), None),
        };

        let mut parts = body.split(':');
        let kind = DbmsKind::parse(parts.next().unwrap_or_default())?;
        let host = parts.next().unwrap_or_default();
        if host.is_empty() {
            return Err(Error::InvalidUrl("missing host".into()));
        }
        let port = match parts.next() {
            None | Some("") => DEFAULT_PORT,
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::InvalidUrl(format!("invalid port {p:?}")))?,
        };
        let db = parts.next().unwrap_or_default().to_owned();
        if db.is_empty() {
            return Err(Error::InvalidUrl("missing database name".into()));
        }
        // null user/password normalize to the empty string
        let user = parts.next().unwrap_or_default().to_owned();
        let password = parts.next().unwrap_or_default().to_owned();

        let props: Properties = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let mut alt_hosts = Vec::new();
        if let Some(list) = props.get("altHosts") {
            for part in list.split(',').filter(|p| !p.is_empty()) {
                if alt_hosts.len() == ALTER_HOST_MAX_SIZE {
                    log::warn!(
                        "altHosts lists more than {ALTER_HOST_MAX_SIZE} hosts, ignoring the rest"
                    );
                    break;
                }
                alt_hosts.push(Endpoint::parse(part, DEFAULT_PORT)?);
            }
        }

        let rc_time = Duration::from_secs(props.get_u64("rcTime", DEFAULT_RC_TIME_SECS)?);
        let login_timeout = match props.get_u64("loginTimeout", 0)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let query_timeout = match props.get_u64("queryTimeout", 0)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let disconnect_on_query_timeout = props.get_bool("disconnectOnQueryTimeout", false)?;
        let slow_query_threshold = Duration::from_millis(props.get_u64(
            "slowQueryThresholdMillis",
            DEFAULT_SLOW_QUERY_THRESHOLD_MILLIS,
        )?);

        let canonical = {
            let masked = if password.is_empty() { "" } else { "********" };
            let mut s = format!(
                "cci:{}:{}:{}:{}:{}:{}:",
                kind.as_str(),
                host,
                port,
                db,
                user,
                masked
            );
            if let Some(q) = query {
                s.push('?');
                s.push_str(q);
            }
            s
        };

        Ok(UrlConfig {
            kind,
            endpoint: Endpoint::new(host, port),
            db,
            user,
            password,
            alt_hosts,
            rc_time,
            login_timeout,
            query_timeout,
            disconnect_on_query_timeout,
            slow_query_threshold,
            canonical,
        })
    }

    /// The URL with the password masked, fixed for the life of a connection.
    pub fn canonical_url(&self) -> &str {
        &self.canonical
    }

    /// The full host walk order: the main endpoint first, then the
    /// alternates.
    pub(crate) fn hosts(&self) -> Vec<Endpoint> {
        let mut hosts = Vec::with_capacity(1 + self.alt_hosts.len());
        hosts.push(self.endpoint.clone());
        hosts.extend(self.alt_hosts.iter().cloned());
        hosts
    }
}

/// Validated construction options for a [`crate::DataSource`].
#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub pool_size: usize,
    pub max_pool_size: usize,
    pub max_wait: Duration,
    pub pool_prepared_statement: bool,
    pub max_open_prepared_statement: usize,
    pub login_timeout: Option<Duration>,
    pub query_timeout: Option<Duration>,
    pub disconnect_on_query_timeout: bool,
    pub default_autocommit: bool,
    pub default_isolation: Option<IsolationLevel>,
    pub default_lock_timeout: Option<Duration>,
}

impl DataSourceConfig {
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let url = props
            .get("url")
            .ok_or(Error::InvalidDatasource("missing url property"))?
            .to_owned();
        let user = props.get("user").unwrap_or_default().to_owned();
        let password = props.get("password").unwrap_or_default().to_owned();

        let pool_size = props.get_usize("pool_size", DEFAULT_POOL_SIZE, 1)?;
        let max_pool_size = props.get_usize("max_pool_size", pool_size, 1)?;
        if max_pool_size < pool_size {
            return Err(Error::InvalidDatasource(
                "'max_pool_size' should be greater than 'pool_size'",
            ));
        }
        let max_wait = Duration::from_millis(props.get_u64("max_wait", DEFAULT_MAX_WAIT_MILLIS)?);
        let pool_prepared_statement = props.get_bool("pool_prepared_statement", false)?;
        let max_open_prepared_statement = props.get_usize(
            "max_open_prepared_statement",
            DEFAULT_MAX_OPEN_PREPARED_STATEMENT,
            1,
        )?;
        let login_timeout = match props.get_u64("login_timeout", 0)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let query_timeout = match props.get_u64("query_timeout", 0)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let disconnect_on_query_timeout = props.get_bool("disconnect_on_query_timeout", false)?;
        let default_autocommit = props.get_bool("default_autocommit", true)?;
        let default_isolation = props
            .get("default_isolation")
            .map(IsolationLevel::parse)
            .transpose()?;
        let default_lock_timeout = props
            .get("default_lock_timeout")
            .map(|v| {
                v.parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| Error::InvalidPropertyValue {
                        key: "default_lock_timeout".into(),
                        value: v.into(),
                    })
            })
            .transpose()?;

        Ok(DataSourceConfig {
            url,
            user,
            password,
            pool_size,
            max_pool_size,
            max_wait,
            pool_prepared_statement,
            max_open_prepared_statement,
            login_timeout,
            query_timeout,
            disconnect_on_query_timeout,
            default_autocommit,
            default_isolation,
            default_lock_timeout,
        })
    }

    /// Builds the URL pooled connections are opened with. Timeout options
    /// are folded into the query string so reconnects pick them up.
    pub(crate) fn augmented_url(&self) -> String {
        let mut url = self.url.clone();
        fn push(url: &mut String, key: &str, value: String) {
            let sep = if url.contains('?') { '&' } else { '?' };
            if !url.to_ascii_lowercase().contains(&key.to_ascii_lowercase()) {
                url.push(sep);
                url.push_str(key);
                url.push('=');
                url.push_str(&value);
            }
        }
        if !url.contains('?') && !url.ends_with(':') {
            url.push(':');
        }
        if let Some(t) = self.login_timeout {
            push(&mut url, "loginTimeout", t.as_millis().to_string());
        }
        if let Some(t) = self.query_timeout {
            push(&mut url, "queryTimeout", t.as_millis().to_string());
        }
        if self.disconnect_on_query_timeout {
            push(&mut url, "disconnectOnQueryTimeout", "true".to_string());
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_plain_url() {
        let cfg = UrlConfig::parse("cci:cubrid:127.0.0.1:33000:demodb:dba::").unwrap();
        assert_eq!(cfg.kind, DbmsKind::Cubrid);
        assert_eq!(cfg.endpoint, Endpoint::new("127.0.0.1", 33000));
        assert_eq!(cfg.db, "demodb");
        assert_eq!(cfg.user, "dba");
        assert_eq!(cfg.password, "");
        assert!(cfg.alt_hosts.is_empty());
        assert_eq!(cfg.rc_time, Duration::from_secs(600));
    }

    #[test]
    fn should_parse_url_with_properties() {
        let cfg = UrlConfig::parse(
            "cci:cubrid:main:33000:demodb:dba:secret:?altHosts=backup1:33001,backup2&rcTime=60&loginTimeout=5000&disconnectOnQueryTimeout=true",
        )
        .unwrap();
        assert_eq!(
            cfg.alt_hosts,
            vec![
                Endpoint::new("backup1", 33001),
                Endpoint::new("backup2", 33000)
            ]
        );
        assert_eq!(cfg.rc_time, Duration::from_secs(60));
        assert_eq!(cfg.login_timeout, Some(Duration::from_millis(5000)));
        assert!(cfg.disconnect_on_query_timeout);
        assert_eq!(
            cfg.hosts(),
            vec![
                Endpoint::new("main", 33000),
                Endpoint::new("backup1", 33001),
                Endpoint::new("backup2", 33000)
            ]
        );
    }

    #[test]
    fn should_mask_password_in_canonical_url() {
        let cfg = UrlConfig::parse("cci:cubrid:h:33000:demodb:dba:secret:?rcTime=60").unwrap();
        assert!(!cfg.canonical_url().contains("secret"));
        assert!(cfg.canonical_url().contains("********"));
    }

    #[test]
    fn should_reject_invalid_urls() {
        assert!(UrlConfig::parse("jdbc:cubrid:localhost:33000:demodb:::").is_err());
        assert!(UrlConfig::parse("cci:oracle:h:1:db:u:p:").is_err());
        assert!(UrlConfig::parse("cci:cubrid::33000:db:u:p:").is_err());
        assert!(UrlConfig::parse("cci:cubrid:h:notaport:db:u:p:").is_err());
        assert!(UrlConfig::parse("cci:cubrid:h:33000::u:p:").is_err());
    }

    #[test]
    fn property_lookup_is_case_insensitive() {
        let mut props = Properties::new();
        props.set("Login_Timeout", "3000");
        assert_eq!(props.get("loginTimeout"), Some("3000"));
        assert_eq!(props.get("LOGIN_TIMEOUT"), Some("3000"));

        props.set("logintimeout", "4000");
        assert_eq!(props.get("login_timeout"), Some("4000"));
    }

    #[test]
    fn isolation_level_aliases() {
        assert_eq!(
            IsolationLevel::parse("TRAN_REP_CLASS_COMMIT_INSTANCE").unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            IsolationLevel::parse("tran_repeatable_read").unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert!(IsolationLevel::parse("TRAN_NONE").is_err());
    }

    #[test]
    fn datasource_config_defaults() {
        let props: Properties = [("url", "cci:cubrid:h:33000:demodb:dba::")]
            .into_iter()
            .collect();
        let cfg = DataSourceConfig::from_properties(&props).unwrap();
        assert_eq!(cfg.pool_size, 10);
        assert_eq!(cfg.max_pool_size, 10);
        assert_eq!(cfg.max_wait, Duration::from_millis(1000));
        assert!(cfg.default_autocommit);
        assert!(!cfg.pool_prepared_statement);
        assert_eq!(cfg.max_open_prepared_statement, 1000);
    }

    #[test]
    fn datasource_config_rejects_shrunk_max() {
        let props: Properties = [
            ("url", "cci:cubrid:h:33000:demodb:dba::"),
            ("pool_size", "8"),
            ("max_pool_size", "4"),
        ]
        .into_iter()
        .collect();
        assert!(DataSourceConfig::from_properties(&props).is_err());
    }

    #[test]
    fn augmented_url_carries_timeouts() {
        let props: Properties = [
            ("url", "cci:cubrid:h:33000:demodb:dba::"),
            ("login_timeout", "2000"),
            ("query_timeout", "7000"),
            ("disconnect_on_query_timeout", "true"),
        ]
        .into_iter()
        .collect();
        let cfg = DataSourceConfig::from_properties(&props).unwrap();
        let url = cfg.augmented_url();
        let parsed = UrlConfig::parse(&url).unwrap();
        assert_eq!(parsed.login_timeout, Some(Duration::from_millis(2000)));
        assert_eq!(parsed.query_timeout, Some(Duration::from_millis(7000)));
        assert!(parsed.disconnect_on_query_timeout);
    }
}
