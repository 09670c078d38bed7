//! B2BUA configuration
//!
//! Loaded from TOML or assembled in code with the `with_*` setters.
//! Durations are written as seconds and may be fractional:
//!
//! ```toml
//! static_route = "sip-ua"
//! no_progress_time = 30
//! go_dead_timeout = 32.0
//! allowed_pts = [0, 8, 101]
//!
//! [rewrite_cld]
//! pattern = "^00"
//! replacement = "+"
//! ```

use infra_common::errors::ErrorExt;
use infra_common::LoggingConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::{B2buaError, Result};

/// Pattern substitution applied to a destination id
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "RawRewriteRule", into = "RawRewriteRule")]
pub struct RewriteRule {
    regex: Regex,
    replacement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRewriteRule {
    pattern: String,
    replacement: String,
}

impl TryFrom<RawRewriteRule> for RewriteRule {
    type Error = B2buaError;

    fn try_from(raw: RawRewriteRule) -> Result<Self> {
        RewriteRule::new(&raw.pattern, raw.replacement)
    }
}

impl From<RewriteRule> for RawRewriteRule {
    fn from(rule: RewriteRule) -> Self {
        Self {
            pattern: rule.regex.as_str().to_string(),
            replacement: rule.replacement,
        }
    }
}

impl RewriteRule {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| B2buaError::ConfigError(format!("bad rewrite pattern {:?}: {}", pattern, e)))?;
        Ok(Self {
            regex,
            replacement: replacement.into(),
        })
    }

    /// Replace every match; `$1`-style group references are expanded
    pub fn apply(&self, input: &str) -> String {
        self.regex.replace_all(input, self.replacement.as_str()).into_owned()
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

impl fmt::Debug for RewriteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteRule")
            .field("pattern", &self.regex.as_str())
            .field("replacement", &self.replacement)
            .finish()
    }
}

impl PartialEq for RewriteRule {
    fn eq(&self, other: &Self) -> bool {
        self.regex.as_str() == other.regex.as_str() && self.replacement == other.replacement
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&d.as_secs_f64()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            match Option::<f64>::deserialize(d)? {
                Some(secs) => Duration::try_from_secs_f64(secs)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Top-level B2BUA settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct B2buaConfig {
    /// Route template used for every call when no authorizer supplies routes
    pub static_route: Option<String>,

    /// Rewrite of the inbound destination id, applied before authorization
    pub rewrite_cld: Option<RewriteRule>,

    /// Rewrite of the destination id applied per egress attempt
    pub rewrite_egress_cld: Option<RewriteRule>,

    /// Media payload types allowed through; `None` allows everything
    pub allowed_pts: Option<Vec<u8>>,

    /// Source addresses allowed to place calls; `None` allows everyone
    pub accept_ips: Option<Vec<IpAddr>>,

    /// Replace the egress call-id with a hash of the ingress one
    pub hide_call_id: bool,

    /// Inbound header names copied onto the egress INVITE
    pub pass_headers: Vec<String>,

    /// Forward the caller's credential and relay 401/407 challenges back
    pub pass_auth: bool,

    #[serde(with = "secs::option")]
    pub max_credit_time: Option<Duration>,

    #[serde(with = "secs::option")]
    pub no_reply_time: Option<Duration>,

    #[serde(with = "secs::option")]
    pub no_progress_time: Option<Duration>,

    #[serde(with = "secs::option")]
    pub expire_time: Option<Duration>,

    /// Linger time of a finished leg before it is destroyed
    #[serde(with = "secs")]
    pub go_dead_timeout: Duration,

    /// Max-Forwards used when the inbound request carries none
    pub max_forwards: u32,

    /// Engage the media relay for every call
    pub media_relay: bool,

    pub log_level: String,
}

impl Default for B2buaConfig {
    fn default() -> Self {
        Self {
            static_route: None,
            rewrite_cld: None,
            rewrite_egress_cld: None,
            allowed_pts: None,
            accept_ips: None,
            hide_call_id: false,
            pass_headers: Vec::new(),
            pass_auth: false,
            max_credit_time: None,
            no_reply_time: None,
            no_progress_time: None,
            expire_time: None,
            go_dead_timeout: Duration::from_secs(32),
            max_forwards: 70,
            media_relay: false,
            log_level: "info".to_string(),
        }
    }
}

impl B2buaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| B2buaError::ConfigError(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            infra_common::Error::Config(format!("cannot read {}: {}", path.display(), e))
                .with_context("b2bua", "load_config")
        })?;
        Self::from_toml_str(&text)
    }

    /// Logging settings derived from `log_level`
    pub fn logging_config(&self) -> Result<LoggingConfig> {
        Ok(LoggingConfig::from_level_str(&self.log_level, "b2bua")?)
    }

    /// Install the global tracing subscriber at `log_level`
    pub fn init_logging(&self) -> Result<()> {
        Ok(infra_common::logging::setup_logging(self.logging_config()?)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| B2buaError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_forwards == 0 {
            return Err(B2buaError::ConfigError("max_forwards must be positive".into()));
        }
        if let Some(pts) = &self.allowed_pts {
            if pts.is_empty() {
                return Err(B2buaError::ConfigError("allowed_pts must not be empty".into()));
            }
        }
        if let Some(route) = &self.static_route {
            crate::route::RouteTemplate::parse(route)?;
        }
        infra_common::logging::parse_log_level(&self.log_level)?;
        Ok(())
    }

    pub fn with_static_route(mut self, route: impl Into<String>) -> Self {
        self.static_route = Some(route.into());
        self
    }

    pub fn with_rewrite_cld(mut self, rule: RewriteRule) -> Self {
        self.rewrite_cld = Some(rule);
        self
    }

    pub fn with_rewrite_egress_cld(mut self, rule: RewriteRule) -> Self {
        self.rewrite_egress_cld = Some(rule);
        self
    }

    pub fn with_allowed_pts(mut self, pts: Vec<u8>) -> Self {
        self.allowed_pts = Some(pts);
        self
    }

    pub fn with_accept_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.accept_ips = Some(ips);
        self
    }

    pub fn with_hide_call_id(mut self, hide: bool) -> Self {
        self.hide_call_id = hide;
        self
    }

    pub fn with_pass_headers(mut self, headers: Vec<String>) -> Self {
        self.pass_headers = headers;
        self
    }

    pub fn with_pass_auth(mut self, pass: bool) -> Self {
        self.pass_auth = pass;
        self
    }

    pub fn with_max_credit_time(mut self, limit: Duration) -> Self {
        self.max_credit_time = Some(limit);
        self
    }

    pub fn with_no_reply_time(mut self, t: Duration) -> Self {
        self.no_reply_time = Some(t);
        self
    }

    pub fn with_no_progress_time(mut self, t: Duration) -> Self {
        self.no_progress_time = Some(t);
        self
    }

    pub fn with_expire_time(mut self, t: Duration) -> Self {
        self.expire_time = Some(t);
        self
    }

    pub fn with_go_dead_timeout(mut self, t: Duration) -> Self {
        self.go_dead_timeout = t;
        self
    }

    pub fn with_max_forwards(mut self, n: u32) -> Self {
        self.max_forwards = n;
        self
    }

    pub fn with_media_relay(mut self, enabled: bool) -> Self {
        self.media_relay = enabled;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Whether the source address passes the ACL
    pub fn accepts(&self, ip: IpAddr) -> bool {
        match &self.accept_ips {
            Some(ips) => ips.contains(&ip),
            None => true,
        }
    }
}
