use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::Deserialize;
use url::Url;
use xmpp_parsers::jid::{BareJid, Jid};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings for one XMPP over BOSH connection.
#[derive(Debug, Clone, Deserialize)]
pub struct BoshConfiguration {
    pub endpoint: EndpointConfig,
    pub account: AccountConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub https: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// The XMPP service domain, e.g. `example.com` for `alice@example.com`.
    pub domain: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub authzid: Option<String>,
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Log raw request and response bodies at trace level.
    #[serde(default)]
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout_ms(),
            debug: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    username: Option<String>,
    password: Option<String>,
    host: Option<String>,
}

fn default_port() -> u16 {
    5280
}

fn default_path() -> String {
    "/http-bind/".to_string()
}

fn default_reply_timeout_ms() -> u64 {
    5000
}

impl BoshConfiguration {
    pub fn builder() -> BoshConfigurationBuilder {
        BoshConfigurationBuilder::default()
    }

    /// The connection manager URI, e.g. `http://example.com:5280/http-bind/`.
    pub fn uri(&self) -> Result<Url, ConfigError> {
        let scheme = if self.endpoint.https { "https" } else { "http" };
        let path = if self.endpoint.path.starts_with('/') {
            self.endpoint.path.clone()
        } else {
            format!("/{}", self.endpoint.path)
        };
        let raw = format!(
            "{scheme}://{}:{}{path}",
            self.endpoint.host, self.endpoint.port
        );
        Url::parse(&raw).map_err(|error| ConfigError::InvalidValue {
            field: "endpoint".to_string(),
            message: format!("'{raw}' is not a valid URI: {error}"),
        })
    }

    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn xmpp_service_domain(&self) -> &str {
        &self.account.domain
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.session.reply_timeout_ms)
    }

    pub fn is_proxy_enabled(&self) -> bool {
        self.proxy.is_some()
    }

    pub fn authzid(&self) -> Result<Option<BareJid>, ConfigError> {
        self.account
            .authzid
            .as_deref()
            .map(|raw| {
                raw.parse::<BareJid>()
                    .map_err(|error| ConfigError::InvalidValue {
                        field: "account.authzid".to_string(),
                        message: format!("'{raw}' is not a bare JID: {error}"),
                    })
            })
            .transpose()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.endpoint.host.is_empty() {
            missing.push("endpoint.host".to_string());
        }
        if self.account.domain.is_empty() {
            missing.push("account.domain".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingRequiredFields { fields: missing });
        }

        if let Err(error) = self.account.domain.parse::<Jid>() {
            return Err(ConfigError::InvalidValue {
                field: "account.domain".to_string(),
                message: error.to_string(),
            });
        }
        if self.session.reply_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.reply_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        self.authzid()?;
        self.uri()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BoshConfigurationBuilder {
    host: String,
    port: Option<u16>,
    path: Option<String>,
    https: bool,
    domain: String,
    username: String,
    password: String,
    authzid: Option<String>,
    resource: Option<String>,
    proxy: Option<ProxyConfig>,
    http: HttpConfig,
    session: SessionConfig,
}

impl BoshConfigurationBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn use_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    pub fn xmpp_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn username_and_password(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = Some(ProxyConfig {
            host: host.into(),
            port,
        });
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.http.compression = enabled;
        self
    }

    pub fn http_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http.headers.insert(name.into(), value.into());
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.session.reply_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.session.debug = enabled;
        self
    }

    pub fn build(self) -> Result<BoshConfiguration, ConfigError> {
        let config = BoshConfiguration {
            endpoint: EndpointConfig {
                host: self.host,
                port: self.port.unwrap_or_else(default_port),
                path: self.path.unwrap_or_else(default_path),
                https: self.https,
            },
            account: AccountConfig {
                domain: self.domain,
                username: self.username,
                password: self.password,
                authzid: self.authzid,
                resource: self.resource,
            },
            proxy: self.proxy,
            http: self.http,
            session: self.session,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Load configuration from a TOML file, merging environment overrides.
pub fn load_config_from(path: PathBuf) -> Result<BoshConfiguration, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound { path });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, config_overrides_from_env())
}

/// Parse configuration from a TOML string, merging environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<BoshConfiguration, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<BoshConfiguration, ConfigError> {
    let mut config: BoshConfiguration = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    config.validate()?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        username: std::env::var("WADDLE_BOSH_USERNAME").ok(),
        password: std::env::var("WADDLE_BOSH_PASSWORD").ok(),
        host: std::env::var("WADDLE_BOSH_HOST").ok(),
    }
}

fn apply_overrides(config: &mut BoshConfiguration, overrides: ConfigOverrides) {
    if let Some(username) = overrides.username {
        config.account.username = username;
    }
    if let Some(password) = overrides.password {
        config.account.password = password;
    }
    if let Some(host) = overrides.host {
        config.endpoint.host = host;
    }
}
