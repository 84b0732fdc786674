//! SPF evaluation ([RFC 7208](https://www.rfc-editor.org/rfc/rfc7208)) over
//! the shared [`DnsResolver`].
//!
//! Every mechanism and modifier that queries DNS counts against the
//! request's `max_lookups`. Going over it ends the evaluation with
//! `permerror`, as do more than two lookups with an empty answer.

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    pin::Pin,
};

use tracing::debug;

use crate::{
    address_domain, verifier::dns_failure_result, AuthResult, DnsResolver, SpfRequest,
    SpfVerdict, SpfVerifier, VerifyFuture, VerifyResult,
};

const MAX_VOID_LOOKUPS: u32 = 2;
const MAX_MX_HOSTS: usize = 10;
const MAX_DOMAIN_LENGTH: usize = 253;

/// Result a matching directive yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn split(term: &str) -> (Self, &str) {
        match term.as_bytes().first() {
            Some(b'+') => (Qualifier::Pass, &term[1..]),
            Some(b'-') => (Qualifier::Fail, &term[1..]),
            Some(b'~') => (Qualifier::SoftFail, &term[1..]),
            Some(b'?') => (Qualifier::Neutral, &term[1..]),
            _ => (Qualifier::Pass, term),
        }
    }

    fn result(self) -> AuthResult {
        match self {
            Qualifier::Pass => AuthResult::Pass,
            Qualifier::Fail => AuthResult::Fail,
            Qualifier::SoftFail => AuthResult::SoftFail,
            Qualifier::Neutral => AuthResult::Neutral,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Include(String),
    A {
        domain: Option<String>,
        cidr4: u8,
        cidr6: u8,
    },
    Mx {
        domain: Option<String>,
        cidr4: u8,
        cidr6: u8,
    },
    Ptr(Option<String>),
    Ip4 {
        network: Ipv4Addr,
        prefix: u8,
    },
    Ip6 {
        network: Ipv6Addr,
        prefix: u8,
    },
    Exists(String),
}

impl Mechanism {
    fn parse(term: &str) -> Option<Self> {
        let split = term.find(|c: char| c == ':' || c == '/').unwrap_or(term.len());
        let (name, rest) = term.split_at(split);
        match name.to_ascii_lowercase().as_str() {
            "all" if rest.is_empty() => Some(Mechanism::All),
            "include" => Some(Mechanism::Include(domain_spec(rest)?.to_string())),
            "exists" => Some(Mechanism::Exists(domain_spec(rest)?.to_string())),
            "ptr" if rest.is_empty() => Some(Mechanism::Ptr(None)),
            "ptr" => Some(Mechanism::Ptr(Some(domain_spec(rest)?.to_string()))),
            "a" => {
                let (domain, cidr4, cidr6) = dual_cidr(rest)?;
                Some(Mechanism::A {
                    domain,
                    cidr4,
                    cidr6,
                })
            }
            "mx" => {
                let (domain, cidr4, cidr6) = dual_cidr(rest)?;
                Some(Mechanism::Mx {
                    domain,
                    cidr4,
                    cidr6,
                })
            }
            "ip4" => {
                let (address, prefix) = network(rest.strip_prefix(':')?, 32)?;
                Some(Mechanism::Ip4 {
                    network: address.parse().ok()?,
                    prefix,
                })
            }
            "ip6" => {
                let (address, prefix) = network(rest.strip_prefix(':')?, 128)?;
                Some(Mechanism::Ip6 {
                    network: address.parse().ok()?,
                    prefix,
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

/// A published `v=spf1` record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpfRecord {
    pub directives: Vec<Directive>,
    pub redirect: Option<String>,
}

impl SpfRecord {
    /// Parses a record, `None` on any syntax error. Unknown modifiers
    /// (`exp=` included) are ignored.
    pub fn parse(record: &str) -> Option<Self> {
        let mut terms = record.split_ascii_whitespace();
        if !terms.next()?.eq_ignore_ascii_case("v=spf1") {
            return None;
        }
        let mut parsed = SpfRecord::default();
        for term in terms {
            if let Some((name, value)) = modifier(term) {
                if name.eq_ignore_ascii_case("redirect") {
                    if parsed.redirect.is_some() || value.is_empty() {
                        return None;
                    }
                    parsed.redirect = Some(value.to_string());
                }
                continue;
            }
            let (qualifier, mechanism) = Qualifier::split(term);
            parsed.directives.push(Directive {
                qualifier,
                mechanism: Mechanism::parse(mechanism)?,
            });
        }
        Some(parsed)
    }
}

fn is_spf_record(record: &str) -> bool {
    let record = record.trim_start();
    record
        .get(..6)
        .is_some_and(|version| version.eq_ignore_ascii_case("v=spf1"))
        && record[6..].chars().next().map_or(true, |c| c == ' ')
}

fn modifier(term: &str) -> Option<(&str, &str)> {
    let (name, value) = term.split_once('=')?;
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    valid.then_some((name, value))
}

fn domain_spec(rest: &str) -> Option<&str> {
    rest.strip_prefix(':').filter(|spec| !spec.is_empty())
}

fn prefix(value: &str, max: u8) -> Option<u8> {
    value.parse::<u8>().ok().filter(|prefix| *prefix <= max)
}

fn network(value: &str, max: u8) -> Option<(&str, u8)> {
    match value.split_once('/') {
        Some((address, length)) => Some((address, prefix(length, max)?)),
        None => Some((value, max)),
    }
}

/// Index of the first `/` outside a `%{...}` macro.
fn cidr_start(spec: &str) -> usize {
    let mut in_macro = false;
    for (index, c) in spec.char_indices() {
        match c {
            '{' => in_macro = true,
            '}' => in_macro = false,
            '/' if !in_macro => return index,
            _ => {}
        }
    }
    spec.len()
}

/// Splits `[:domain-spec][/cidr4][//cidr6]`.
fn dual_cidr(rest: &str) -> Option<(Option<String>, u8, u8)> {
    let (domain, cidr) = match rest.strip_prefix(':') {
        Some(spec) => {
            let index = cidr_start(spec);
            (Some(&spec[..index]), &spec[index..])
        }
        None => (None, rest),
    };
    if domain == Some("") {
        return None;
    }
    let (cidr4, cidr6) = if let Some(v6) = cidr.strip_prefix("//") {
        (32, prefix(v6, 128)?)
    } else if let Some(v4) = cidr.strip_prefix('/') {
        match v4.split_once("//") {
            Some((v4, v6)) => (prefix(v4, 32)?, prefix(v6, 128)?),
            None => (prefix(v4, 32)?, 128),
        }
    } else if cidr.is_empty() {
        (32, 128)
    } else {
        return None;
    };
    Some((domain.map(str::to_string), cidr4, cidr6))
}

fn in_network(ip: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(network)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(ip) & mask == u32::from(network) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(network)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(ip) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= MAX_DOMAIN_LENGTH
        && domain.contains('.')
        && domain
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= 63)
}

/// Values the macro letters expand to.
struct Macros<'a> {
    sender: &'a str,
    local: &'a str,
    sender_domain: &'a str,
    domain: &'a str,
    client_ip: IpAddr,
    helo: &'a str,
}

impl Macros<'_> {
    /// Expands a domain-spec, `None` on a malformed macro.
    fn expand(&self, spec: &str) -> Option<String> {
        let mut expanded = String::with_capacity(spec.len());
        let mut chars = spec.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                expanded.push(c);
                continue;
            }
            match chars.next()? {
                '%' => expanded.push('%'),
                '_' => expanded.push(' '),
                '-' => expanded.push_str("%20"),
                '{' => {
                    let mut body = String::new();
                    loop {
                        match chars.next()? {
                            '}' => break,
                            c => body.push(c),
                        }
                    }
                    expanded.push_str(&self.letter(&body)?);
                }
                _ => return None,
            }
        }

        let mut domain = expanded.trim_end_matches('.');
        while domain.len() > MAX_DOMAIN_LENGTH {
            domain = domain.split_once('.')?.1;
        }
        Some(domain.to_string())
    }

    fn letter(&self, body: &str) -> Option<String> {
        let mut chars = body.chars();
        let value = match chars.next()?.to_ascii_lowercase() {
            's' => self.sender.to_string(),
            'l' => self.local.to_string(),
            'o' => self.sender_domain.to_string(),
            'd' => self.domain.to_string(),
            'i' => ip_macro(self.client_ip),
            'p' => "unknown".to_string(),
            'v' if self.client_ip.is_ipv4() => "in-addr".to_string(),
            'v' => "ip6".to_string(),
            'h' => self.helo.to_string(),
            _ => return None,
        };

        let rest = chars.as_str();
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let keep = match digits {
            0 => None,
            _ => Some(rest[..digits].parse::<usize>().ok().filter(|keep| *keep > 0)?),
        };
        let mut rest = &rest[digits..];
        let reverse = rest.starts_with(['r', 'R']);
        if reverse {
            rest = &rest[1..];
        }
        if !rest.chars().all(|c| ".-+,/_=".contains(c)) {
            return None;
        }
        let delimiters = if rest.is_empty() { "." } else { rest };

        let mut parts: Vec<&str> = value.split(|c: char| delimiters.contains(c)).collect();
        if reverse {
            parts.reverse();
        }
        if let Some(keep) = keep {
            if parts.len() > keep {
                parts.drain(..parts.len() - keep);
            }
        }
        Some(parts.join("."))
    }
}

fn ip_macro(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => ip
            .octets()
            .iter()
            .flat_map(|byte| [byte >> 4, byte & 0x0f])
            .map(|nibble| format!("{nibble:x}"))
            .collect::<Vec<_>>()
            .join("."),
    }
}

/// `Err` ends the evaluation with the carried result.
type Step<T> = Result<T, AuthResult>;

/// State of one `check_host()` run, shared by nested includes and redirects.
struct Evaluation<'a> {
    resolver: &'a dyn DnsResolver,
    client_ip: IpAddr,
    sender: &'a str,
    local: &'a str,
    sender_domain: &'a str,
    helo: &'a str,
    max_lookups: u32,
    lookups: u32,
    void_lookups: u32,
}

impl Evaluation<'_> {
    fn count_lookup(&mut self) -> Step<()> {
        self.lookups += 1;
        if self.lookups > self.max_lookups {
            debug!(max_lookups = self.max_lookups, "SPF lookup limit exceeded");
            return Err(AuthResult::PermError);
        }
        Ok(())
    }

    fn count_void(&mut self, empty: bool) -> Step<()> {
        if empty {
            self.void_lookups += 1;
            if self.void_lookups > MAX_VOID_LOOKUPS {
                debug!("SPF void lookup limit exceeded");
                return Err(AuthResult::PermError);
            }
        }
        Ok(())
    }

    fn target(&self, spec: Option<&str>, domain: &str) -> Step<String> {
        let Some(spec) = spec else {
            return Ok(domain.to_string());
        };
        Macros {
            sender: self.sender,
            local: self.local,
            sender_domain: self.sender_domain,
            domain,
            client_ip: self.client_ip,
            helo: self.helo,
        }
        .expand(spec)
        .ok_or(AuthResult::PermError)
    }

    fn check_host<'b>(
        &'b mut self,
        domain: String,
    ) -> Pin<Box<dyn Future<Output = AuthResult> + Send + 'b>> {
        Box::pin(async move {
            match self.evaluate(&domain).await {
                Ok(result) | Err(result) => result,
            }
        })
    }

    async fn evaluate(&mut self, domain: &str) -> Step<AuthResult> {
        if !valid_domain(domain) {
            return Ok(AuthResult::None);
        }
        let records: Vec<String> = self
            .resolver
            .txt_lookup(domain)
            .await
            .map_err(|error| dns_failure_result(&error))?
            .into_iter()
            .filter(|record| is_spf_record(record))
            .collect();
        let raw = match records.as_slice() {
            [] => return Ok(AuthResult::None),
            [raw] => raw,
            _ => return Err(AuthResult::PermError),
        };
        let record = SpfRecord::parse(raw).ok_or(AuthResult::PermError)?;

        for directive in &record.directives {
            if self.matches(&directive.mechanism, domain).await? {
                return Ok(directive.qualifier.result());
            }
        }

        let Some(spec) = record.redirect.as_deref() else {
            return Ok(AuthResult::Neutral);
        };
        self.count_lookup()?;
        let target = self.target(Some(spec), domain)?;
        match self.check_host(target).await {
            AuthResult::None => Err(AuthResult::PermError),
            result => Ok(result),
        }
    }

    async fn matches(&mut self, mechanism: &Mechanism, domain: &str) -> Step<bool> {
        match mechanism {
            Mechanism::All => Ok(true),
            Mechanism::Ip4 { network, prefix } => {
                Ok(in_network(self.client_ip, IpAddr::V4(*network), *prefix))
            }
            Mechanism::Ip6 { network, prefix } => {
                Ok(in_network(self.client_ip, IpAddr::V6(*network), *prefix))
            }
            Mechanism::Include(spec) => {
                self.count_lookup()?;
                let target = self.target(Some(spec), domain)?;
                match self.check_host(target).await {
                    AuthResult::Pass => Ok(true),
                    AuthResult::Fail | AuthResult::SoftFail | AuthResult::Neutral => Ok(false),
                    AuthResult::TempError => Err(AuthResult::TempError),
                    _ => Err(AuthResult::PermError),
                }
            }
            Mechanism::A {
                domain: spec,
                cidr4,
                cidr6,
            } => {
                self.count_lookup()?;
                let target = self.target(spec.as_deref(), domain)?;
                let addresses = self.addresses(&target).await?;
                Ok(self.any_within(&addresses, *cidr4, *cidr6))
            }
            Mechanism::Mx {
                domain: spec,
                cidr4,
                cidr6,
            } => {
                self.count_lookup()?;
                let target = self.target(spec.as_deref(), domain)?;
                let exchanges = self
                    .resolver
                    .mx_lookup(&target)
                    .await
                    .map_err(|error| dns_failure_result(&error))?;
                self.count_void(exchanges.is_empty())?;
                if exchanges.len() > MAX_MX_HOSTS {
                    return Err(AuthResult::PermError);
                }
                for exchange in &exchanges {
                    let addresses = self
                        .resolver
                        .ip_lookup(exchange)
                        .await
                        .map_err(|error| dns_failure_result(&error))?;
                    if self.any_within(&addresses, *cidr4, *cidr6) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Mechanism::Ptr(_) => {
                self.count_lookup()?;
                debug!(domain = %domain, "SPF ptr mechanism never matches");
                Ok(false)
            }
            Mechanism::Exists(spec) => {
                self.count_lookup()?;
                let target = self.target(Some(spec), domain)?;
                Ok(!self.addresses(&target).await?.is_empty())
            }
        }
    }

    async fn addresses(&mut self, name: &str) -> Step<Vec<IpAddr>> {
        let addresses = self
            .resolver
            .ip_lookup(name)
            .await
            .map_err(|error| dns_failure_result(&error))?;
        self.count_void(addresses.is_empty())?;
        Ok(addresses)
    }

    fn any_within(&self, addresses: &[IpAddr], cidr4: u8, cidr6: u8) -> bool {
        let prefix = if self.client_ip.is_ipv4() { cidr4 } else { cidr6 };
        addresses
            .iter()
            .any(|address| in_network(self.client_ip, *address, prefix))
    }
}

/// Evaluates the sender's SPF policy for the connecting client.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpfEvaluator;

impl SpfEvaluator {
    async fn check(&self, request: SpfRequest<'_>) -> VerifyResult<SpfVerdict> {
        let helo = if request.helo.is_empty() {
            "unknown"
        } else {
            request.helo
        };
        let identity = if request.sender.is_empty() {
            format!("postmaster@{helo}")
        } else if request.sender.contains('@') {
            request.sender.to_string()
        } else {
            format!("postmaster@{}", request.sender)
        };
        let (local, sender_domain) = identity.rsplit_once('@').unwrap_or(("postmaster", helo));
        let sender_domain = sender_domain.trim_end_matches('.').to_ascii_lowercase();
        let client_ip = match request.client_ip {
            IpAddr::V6(ip) => ip.to_ipv4_mapped().map_or(request.client_ip, IpAddr::V4),
            ip => ip,
        };

        let mut evaluation = Evaluation {
            resolver: request.resolver,
            client_ip,
            sender: &identity,
            local,
            sender_domain: &sender_domain,
            helo,
            max_lookups: request.max_lookups,
            lookups: 0,
            void_lookups: 0,
        };
        let result = evaluation.check_host(sender_domain.clone()).await;
        debug!(
            domain = %sender_domain,
            result = %result,
            lookups = evaluation.lookups,
            max_lookups = request.max_lookups,
            "SPF evaluated"
        );

        let comment = spf_comment(&result, &identity, request.client_ip);
        Ok(SpfVerdict {
            header: Some(format!(
                "Received-SPF: {result} ({}: {comment}) client-ip={}; envelope-from={identity}; helo={helo};",
                request.receiving_host, request.client_ip
            )),
            info: Some(format!("spf={result} smtp.mailfrom={identity}")),
            domain: address_domain(&identity),
            result,
        })
    }
}

impl SpfVerifier for SpfEvaluator {
    fn check_spf<'a>(&'a self, request: SpfRequest<'a>) -> VerifyFuture<'a, SpfVerdict> {
        Box::pin(self.check(request))
    }
}

fn spf_comment(result: &AuthResult, identity: &str, ip: IpAddr) -> String {
    match result {
        AuthResult::Pass => format!("domain of {identity} designates {ip} as permitted sender"),
        AuthResult::Fail => {
            format!("domain of {identity} does not designate {ip} as permitted sender")
        }
        AuthResult::SoftFail => format!(
            "transitioning domain of {identity} does not designate {ip} as permitted sender"
        ),
        AuthResult::Neutral => {
            format!("{ip} is neither permitted nor denied by domain of {identity}")
        }
        AuthResult::TempError => format!("error in processing during lookup of {identity}"),
        AuthResult::PermError => format!("permanent error in processing domain of {identity}"),
        _ => format!("domain of {identity} does not provide an SPF record"),
    }
}
