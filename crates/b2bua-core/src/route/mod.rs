//! Route descriptors
//!
//! A route names one candidate destination for the egress leg together with
//! the policy for that attempt. Routes come from text templates, either the
//! configured static route or `Routing:` attributes returned by the
//! authorizer:
//!
//! ```text
//! [cld@]host[:port][;param[=value]]*
//! ```
//!
//! Templates are resolved to socket addresses once, then customized per call
//! with a rank and the call's caller/callee ids.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use crate::common::{B2buaError, Result};
use crate::sip::SipHeader;

/// Host marker meaning "send the call back to where it came from"
pub const REFLECT_HOST: &str = "sip-ua";

const DEFAULT_SIP_PORT: u16 = 5060;

/// Group timeout: after `timeout`, stop hunting through routes ranked below
/// `cutoff_rank`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTimeout {
    pub timeout: Duration,
    pub cutoff_rank: u32,
}

/// Per-route policy parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    pub credit_time: Option<Duration>,
    pub expires: Option<Duration>,
    pub no_progress_expires: Option<Duration>,
    pub no_reply_expires: Option<Duration>,
    /// Relay the final failure of this route to the caller when it is the
    /// last one
    pub forward_on_fail: bool,
    pub auth: Option<(String, String)>,
    pub cli: Option<String>,
    pub caller_name: Option<String>,
    pub extra_headers: Vec<SipHeader>,
    pub media_relay: Option<bool>,
    pub group_timeout: Option<GroupTimeout>,
    pub huntstop_codes: Vec<u16>,
    pub outbound_proxy: Option<String>,
    /// Unrecognised parameters, e.g. billing overrides
    pub extra: BTreeMap<String, String>,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            credit_time: None,
            expires: None,
            no_progress_expires: None,
            no_reply_expires: None,
            forward_on_fail: true,
            auth: None,
            cli: None,
            caller_name: None,
            extra_headers: Vec::new(),
            media_relay: None,
            group_timeout: None,
            huntstop_codes: Vec::new(),
            outbound_proxy: None,
            extra: BTreeMap::new(),
        }
    }
}

/// An unresolved route as written in configuration or returned by the
/// authorizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTemplate {
    pub cld: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub policy: RoutePolicy,
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| B2buaError::RouteError(format!("bad escape in {:?}", input)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| B2buaError::RouteError(format!("non-UTF-8 value {:?}", input)))
}

fn parse_secs(name: &str, value: Option<&str>) -> Result<Duration> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| B2buaError::RouteError(format!("{} needs a number of seconds", name)))
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| B2buaError::RouteError(format!("{} needs a value", name)))
}

fn split_host_port(text: &str) -> Result<(String, Option<u16>)> {
    let bad = || B2buaError::RouteError(format!("bad host {:?}", text));
    if let Some(rest) = text.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        let host = &rest[..end];
        let port = match &rest[end + 1..] {
            "" => None,
            p => Some(p.strip_prefix(':').and_then(|p| p.parse().ok()).ok_or_else(bad)?),
        };
        return Ok((host.to_string(), port));
    }
    match text.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().map_err(|_| bad())?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((text.to_string(), None)),
    }
}

impl RouteTemplate {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.trim().split(';');
        let target = parts.next().unwrap_or_default();
        if target.is_empty() {
            return Err(B2buaError::RouteError("empty route".into()));
        }

        let (cld, hostport) = match target.split_once('@') {
            Some((cld, hostport)) => (Some(percent_decode(cld)?), hostport),
            None => (None, target),
        };
        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(B2buaError::RouteError(format!("missing host in {:?}", text)));
        }

        let mut policy = RoutePolicy::default();
        for param in parts.filter(|p| !p.is_empty()) {
            let (name, value) = match param.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim())),
                None => (param.trim(), None),
            };
            match name {
                "credit-time" => policy.credit_time = Some(parse_secs(name, value)?),
                "expires" => policy.expires = Some(parse_secs(name, value)?),
                "np_expires" => policy.no_progress_expires = Some(parse_secs(name, value)?),
                "nr_expires" => policy.no_reply_expires = Some(parse_secs(name, value)?),
                "forward_on_fail" => policy.forward_on_fail = value.map(|v| v != "0").unwrap_or(true),
                "auth" => {
                    let (user, pass) = required(name, value)?
                        .split_once(':')
                        .ok_or_else(|| B2buaError::RouteError("auth needs user:password".into()))?;
                    policy.auth = Some((percent_decode(user)?, percent_decode(pass)?));
                }
                "cli" => policy.cli = Some(percent_decode(required(name, value)?)?),
                "cnam" => policy.caller_name = Some(percent_decode(required(name, value)?)?),
                "ash" => {
                    let decoded = percent_decode(required(name, value)?)?;
                    let (hname, hvalue) = decoded
                        .split_once(':')
                        .ok_or_else(|| B2buaError::RouteError(format!("bad header {:?}", decoded)))?;
                    policy.extra_headers.push(SipHeader::new(hname.trim(), hvalue.trim()));
                }
                "rtpp" => policy.media_relay = Some(required(name, value)? != "0"),
                "gt" => {
                    let (timeout, rank) = required(name, value)?
                        .split_once(',')
                        .ok_or_else(|| B2buaError::RouteError("gt needs timeout,rank".into()))?;
                    let cutoff_rank = rank
                        .trim()
                        .parse()
                        .map_err(|_| B2buaError::RouteError(format!("bad gt rank {:?}", rank)))?;
                    policy.group_timeout = Some(GroupTimeout {
                        timeout: parse_secs(name, Some(timeout))?,
                        cutoff_rank,
                    });
                }
                "huntstop_scodes" => {
                    policy.huntstop_codes = required(name, value)?
                        .split(',')
                        .map(|c| {
                            c.trim()
                                .parse::<u16>()
                                .map_err(|_| B2buaError::RouteError(format!("bad status code {:?}", c)))
                        })
                        .collect::<Result<Vec<_>>>()?;
                }
                "po_proxy" => policy.outbound_proxy = Some(required(name, value)?.to_string()),
                _ => {
                    policy
                        .extra
                        .insert(name.to_string(), value.unwrap_or_default().to_string());
                }
            }
        }

        Ok(Self { cld, host, port, policy })
    }

    pub fn is_reflect(&self) -> bool {
        self.host == REFLECT_HOST
    }

    /// Resolve the host (and outbound proxy, if any) to socket addresses
    pub async fn resolve(&self) -> Result<Route> {
        let port = self.port.unwrap_or(DEFAULT_SIP_PORT);
        let addresses = if self.is_reflect() {
            Vec::new()
        } else {
            lookup(&self.host, port).await?
        };
        let outbound_proxy = match &self.policy.outbound_proxy {
            Some(proxy) => {
                let (host, pport) = split_host_port(proxy)?;
                lookup(&host, pport.unwrap_or(DEFAULT_SIP_PORT)).await?.first().copied()
            }
            None => None,
        };
        debug!(host = %self.host, resolved = addresses.len(), "route resolved");
        Ok(Route {
            rnum: 0,
            cld: self.cld.clone().unwrap_or_default(),
            cli: String::new(),
            caller_name: None,
            host: self.host.clone(),
            port,
            addresses,
            outbound_proxy,
            policy: self.policy.clone(),
        })
    }
}

async fn lookup(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| B2buaError::RouteError(format!("cannot resolve {}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(B2buaError::RouteError(format!("{} has no addresses", host)));
    }
    Ok(addrs)
}

/// Call-specific values a route inherits when it does not override them
#[derive(Debug, Clone, Default)]
pub struct RouteDefaults {
    pub cli: String,
    pub cld: String,
    pub caller_name: Option<String>,
    /// Credit granted by the authorizer
    pub credit_time: Option<Duration>,
    pub max_credit_time: Option<Duration>,
}

/// A resolved, call-specific route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Rank within the call's route list, starting at 1
    pub rnum: u32,
    pub cld: String,
    pub cli: String,
    pub caller_name: Option<String>,
    pub host: String,
    pub port: u16,
    pub addresses: Vec<SocketAddr>,
    pub outbound_proxy: Option<SocketAddr>,
    pub policy: RoutePolicy,
}

impl Route {
    /// Copy of this route ranked `rnum` with the call's defaults filled in
    pub fn customize(&self, rnum: u32, defaults: &RouteDefaults) -> Route {
        let mut route = self.clone();
        route.rnum = rnum;
        if route.cld.is_empty() {
            route.cld = defaults.cld.clone();
        }
        route.cli = route.policy.cli.clone().unwrap_or_else(|| defaults.cli.clone());
        route.caller_name = route
            .policy
            .caller_name
            .clone()
            .or_else(|| defaults.caller_name.clone());
        route.policy.credit_time = [route.policy.credit_time, defaults.credit_time, defaults.max_credit_time]
            .into_iter()
            .flatten()
            .min();
        route
    }

    pub fn is_reflect(&self) -> bool {
        self.host == REFLECT_HOST
    }

    /// Pick the address matching the family of `source`, else the first one
    pub fn select_address(&self, source: SocketAddr) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|a| a.is_ipv4() == source.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }

    pub fn is_huntstop(&self, code: u16) -> bool {
        self.policy.huntstop_codes.contains(&code)
    }
}
