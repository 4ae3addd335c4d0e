//! Rule-based routing policy

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

use crate::error::{Error, Result};

use super::{RoutingPolicy, Strategy};

/// Routing rule as written in configuration
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Match domain patterns
    pub domain: Vec<String>,
    /// Match IP patterns
    pub ip: Vec<String>,
    /// Strategy forced for matching hosts
    pub strategy: Strategy,
}

/// Compiled domain pattern
#[derive(Debug)]
enum DomainPattern {
    /// `domain:x` - x itself or any subdomain of x
    Domain(String),
    /// `full:x` - exactly x
    Full(String),
    /// `keyword:x` - contains x
    Keyword(String),
    /// `regexp:x`
    Regexp(Regex),
    /// bare `x` - ends with x
    Suffix(String),
}

impl DomainPattern {
    fn parse(pattern: &str) -> Result<Self> {
        if let Some(regex_str) = pattern.strip_prefix("regexp:") {
            let re = Regex::new(regex_str)
                .map_err(|e| Error::Config(format!("Invalid domain regexp {}: {}", regex_str, e)))?;
            return Ok(DomainPattern::Regexp(re));
        }

        let pattern = pattern.to_ascii_lowercase();
        let compiled = if let Some(target) = pattern.strip_prefix("domain:") {
            DomainPattern::Domain(target.to_string())
        } else if let Some(target) = pattern.strip_prefix("full:") {
            DomainPattern::Full(target.to_string())
        } else if let Some(keyword) = pattern.strip_prefix("keyword:") {
            DomainPattern::Keyword(keyword.to_string())
        } else {
            DomainPattern::Suffix(pattern)
        };
        Ok(compiled)
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainPattern::Domain(target) => {
                domain == target
                    || (domain.len() > target.len()
                        && domain.ends_with(target.as_str())
                        && domain.as_bytes()[domain.len() - target.len() - 1] == b'.')
            }
            DomainPattern::Full(target) => domain == target,
            DomainPattern::Keyword(keyword) => domain.contains(keyword.as_str()),
            DomainPattern::Regexp(re) => re.is_match(domain),
            DomainPattern::Suffix(suffix) => domain.ends_with(suffix.as_str()),
        }
    }
}

/// Compiled IP pattern
#[derive(Debug)]
enum IpPattern {
    Net(IpNet),
    Exact(IpAddr),
    /// Private/LAN addresses
    Private,
}

impl IpPattern {
    fn parse(pattern: &str) -> Result<Self> {
        if pattern.eq_ignore_ascii_case("private") {
            return Ok(IpPattern::Private);
        }
        if pattern.contains('/') {
            let net = pattern
                .parse::<IpNet>()
                .map_err(|e| Error::Config(format!("Invalid CIDR {}: {}", pattern, e)))?;
            return Ok(IpPattern::Net(net));
        }
        let ip = pattern
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid IP {}: {}", pattern, e)))?;
        Ok(IpPattern::Exact(ip))
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpPattern::Net(net) => net.contains(&ip),
            IpPattern::Exact(target) => *target == ip,
            IpPattern::Private => is_private_ip(ip),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    domain: Vec<DomainPattern>,
    ip: Vec<IpPattern>,
    strategy: Strategy,
}

impl CompiledRule {
    fn matches(&self, host: &str) -> bool {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => self.ip.iter().any(|p| p.matches(ip)),
            Err(_) => {
                let domain = host.trim_end_matches('.').to_ascii_lowercase();
                self.domain.iter().any(|p| p.matches(&domain))
            }
        }
    }
}

/// Rule-based policy. First matching rule wins; unmatched hosts are `AutoTry`.
#[derive(Debug, Default)]
pub struct RulePolicy {
    rules: Vec<CompiledRule>,
}

impl RulePolicy {
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                Ok(CompiledRule {
                    domain: rule
                        .domain
                        .iter()
                        .map(|p| DomainPattern::parse(p))
                        .collect::<Result<_>>()?,
                    ip: rule
                        .ip
                        .iter()
                        .map(|p| IpPattern::parse(p))
                        .collect::<Result<_>>()?,
                    strategy: rule.strategy,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { rules })
    }

    /// `.cn` domains and LAN addresses connect directly, everything else is learned
    pub fn china_direct() -> Self {
        Self {
            rules: vec![
                CompiledRule {
                    domain: vec![DomainPattern::Domain("cn".to_string())],
                    ip: vec![IpPattern::Private],
                    strategy: Strategy::AlwaysDirect,
                },
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl RoutingPolicy for RulePolicy {
    fn get_rule(&self, host: &str) -> Strategy {
        self.rules
            .iter()
            .find(|rule| rule.matches(host))
            .map(|rule| rule.strategy)
            .unwrap_or(Strategy::AutoTry)
    }
}

/// Check if IP is private/LAN address
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()           // 10.x, 172.16-31.x, 192.168.x
                || ipv4.is_loopback()   // 127.x
                || ipv4.is_link_local() // 169.254.x
                || ipv4.is_broadcast()  // 255.255.255.255
                || ipv4.octets()[0] == 0 // 0.x (current network)
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()          // ::1
                || ipv6.is_unspecified() // ::
                // Check for link-local (fe80::/10)
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
                // Check for unique local (fc00::/7)
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}
