//! Scripted collaborators and a static resolver for tests.
//!
//! [`FakeBackend`] answers every stage with a passing verdict for one
//! domain unless a stage is scripted otherwise, and records the calls it
//! receives so tests can assert on what the pipeline handed over.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    parse_raw_headers, ArcRequest, ArcSet, ArcVerdict, ArcVerifier, AuthResult, BimiRequest,
    BimiVerdict, BimiVerifier, DkimRequest, DkimSignatureVerdict, DkimVerdict, DkimVerifier,
    DmarcPolicy, DmarcRequest, DmarcVerdict, DmarcVerifier, DnsResolver, SealChain, SpfRequest,
    SpfVerdict, SpfVerifier, Stage, Verifiers, VerifyError, VerifyFuture, VerifyResult,
};

/// Resolver answering from fixed tables of records.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    txt: HashMap<String, Vec<String>>,
    ips: HashMap<String, Vec<IpAddr>>,
    mx: HashMap<String, Vec<String>>,
    failures: HashSet<String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a TXT record for `name`.
    pub fn with_txt(mut self, name: &str, record: &str) -> Self {
        self.txt
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(record.to_string());
        self
    }

    /// Adds an address record for `name`.
    pub fn with_ip(mut self, name: &str, ip: IpAddr) -> Self {
        self.ips.entry(name.to_ascii_lowercase()).or_default().push(ip);
        self
    }

    /// Adds a mail exchanger for `name`, in preference order.
    pub fn with_mx(mut self, name: &str, exchange: &str) -> Self {
        self.mx
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(exchange.to_string());
        self
    }

    /// Makes every lookup of `name` fail at the transport level.
    pub fn with_failure(mut self, name: &str) -> Self {
        self.failures.insert(name.to_ascii_lowercase());
        self
    }

    fn answer<T: Clone>(&self, table: &HashMap<String, Vec<T>>, name: &str) -> VerifyResult<Vec<T>> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        if self.failures.contains(&name) {
            return Err(VerifyError::Dns(format!("SERVFAIL for {name}")));
        }
        Ok(table.get(&name).cloned().unwrap_or_default())
    }
}

impl DnsResolver for StaticResolver {
    fn txt_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<String>> {
        Box::pin(async move { self.answer(&self.txt, name) })
    }

    fn ip_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<IpAddr>> {
        Box::pin(async move { self.answer(&self.ips, name) })
    }

    fn mx_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<String>> {
        Box::pin(async move { self.answer(&self.mx, name) })
    }
}

/// What the SPF collaborator was called with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfCall {
    pub client_ip: IpAddr,
    pub helo: String,
    pub sender: String,
    pub receiving_host: String,
    pub max_lookups: u32,
}

/// What the DKIM collaborator was called with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimCall {
    pub message: Vec<u8>,
    pub sender: String,
    pub min_key_bits: u32,
}

/// What the DMARC collaborator was called with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcCall {
    pub header_from: String,
    pub spf_domain: Option<String>,
    pub dkim_domains: Vec<String>,
    pub arc_result: Option<AuthResult>,
}

#[derive(Default)]
struct Recorded {
    calls: Vec<Stage>,
    spf: Option<SpfCall>,
    dkim: Option<DkimCall>,
    dmarc: Option<DmarcCall>,
}

/// Collaborator double for all five stages.
#[derive(Default)]
pub struct FakeBackend {
    domain: String,
    spf: Option<VerifyResult<SpfVerdict>>,
    spf_lookups: Option<u32>,
    dkim: Option<VerifyResult<DkimVerdict>>,
    arc: Option<VerifyResult<ArcVerdict>>,
    dmarc: Option<VerifyResult<DmarcVerdict>>,
    dmarc_delay: Option<Duration>,
    bimi: Option<VerifyResult<BimiVerdict>>,
    recorded: Mutex<Recorded>,
}

impl FakeBackend {
    /// Every stage passes for `domain`.
    pub fn passing(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..Default::default()
        }
    }

    pub fn with_spf(mut self, result: VerifyResult<SpfVerdict>) -> Self {
        self.spf = Some(result);
        self
    }

    /// The sender's SPF policy needs `lookups` DNS queries; more than the
    /// request allows yields `permerror`.
    pub fn with_spf_lookups(mut self, lookups: u32) -> Self {
        self.spf_lookups = Some(lookups);
        self
    }

    pub fn with_dkim(mut self, result: VerifyResult<DkimVerdict>) -> Self {
        self.dkim = Some(result);
        self
    }

    pub fn with_arc(mut self, result: VerifyResult<ArcVerdict>) -> Self {
        self.arc = Some(result);
        self
    }

    pub fn with_dmarc_verdict(mut self, result: VerifyResult<DmarcVerdict>) -> Self {
        self.dmarc = Some(result);
        self
    }

    /// Delays the DMARC answer, for deadline tests.
    pub fn with_dmarc_delay(mut self, delay: Duration) -> Self {
        self.dmarc_delay = Some(delay);
        self
    }

    pub fn with_bimi(mut self, result: VerifyResult<BimiVerdict>) -> Self {
        self.bimi = Some(result);
        self
    }

    /// Stages called so far, in call order.
    pub fn calls(&self) -> Vec<Stage> {
        self.recorded().calls.clone()
    }

    pub fn last_spf_call(&self) -> Option<SpfCall> {
        self.recorded().spf.clone()
    }

    pub fn last_dkim_call(&self) -> Option<DkimCall> {
        self.recorded().dkim.clone()
    }

    pub fn last_dmarc_call(&self) -> Option<DmarcCall> {
        self.recorded().dmarc.clone()
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        match self.recorded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SpfVerifier for FakeBackend {
    fn check_spf<'a>(&'a self, request: SpfRequest<'a>) -> VerifyFuture<'a, SpfVerdict> {
        Box::pin(async move {
            {
                let mut recorded = self.recorded();
                recorded.calls.push(Stage::Spf);
                recorded.spf = Some(SpfCall {
                    client_ip: request.client_ip,
                    helo: request.helo.to_string(),
                    sender: request.sender.to_string(),
                    receiving_host: request.receiving_host.to_string(),
                    max_lookups: request.max_lookups,
                });
            }
            if let Some(result) = &self.spf {
                return result.clone();
            }
            let result = match self.spf_lookups {
                Some(lookups) if lookups > request.max_lookups => AuthResult::PermError,
                _ => AuthResult::Pass,
            };
            let comment = if result.is_pass() {
                format!(
                    "{}: domain of {} designates {} as permitted sender",
                    request.receiving_host, request.sender, request.client_ip
                )
            } else {
                format!("{}: too many DNS lookups", request.receiving_host)
            };
            Ok(SpfVerdict {
                header: Some(format!("Received-SPF: {result} ({comment})")),
                info: Some(format!("spf={result} smtp.mailfrom={}", request.sender)),
                domain: Some(self.domain.clone()),
                result,
            })
        })
    }
}

impl DkimVerifier for FakeBackend {
    fn verify_dkim<'a>(&'a self, request: DkimRequest<'a>) -> VerifyFuture<'a, DkimVerdict> {
        Box::pin(async move {
            {
                let mut recorded = self.recorded();
                recorded.calls.push(Stage::Dkim);
                recorded.dkim = Some(DkimCall {
                    message: request.message.to_vec(),
                    sender: request.sender.to_string(),
                    min_key_bits: request.min_key_bits,
                });
            }
            if let Some(result) = &self.dkim {
                return result.clone();
            }
            let mut verdict = dkim_verdict(Some(&self.domain), true);
            let text = String::from_utf8_lossy(request.message);
            verdict.headers = parse_raw_headers(&text).0;
            if let Some(chain) = verdict.seal_chain.as_mut() {
                chain.message = Arc::from(request.message);
            }
            Ok(verdict)
        })
    }
}

impl ArcVerifier for FakeBackend {
    fn evaluate_arc<'a>(&'a self, _request: ArcRequest<'a>) -> VerifyFuture<'a, ArcVerdict> {
        Box::pin(async move {
            self.recorded().calls.push(Stage::Arc);
            if let Some(result) = &self.arc {
                return result.clone();
            }
            Ok(ArcVerdict {
                result: AuthResult::Pass,
                signing_domain: Some(self.domain.clone()),
                info: Some("arc=pass".to_string()),
            })
        })
    }
}

impl DmarcVerifier for FakeBackend {
    fn evaluate_dmarc<'a>(&'a self, request: DmarcRequest<'a>) -> VerifyFuture<'a, DmarcVerdict> {
        Box::pin(async move {
            {
                let mut recorded = self.recorded();
                recorded.calls.push(Stage::Dmarc);
                recorded.dmarc = Some(DmarcCall {
                    header_from: request.header_from.to_string(),
                    spf_domain: request.spf_domain.map(str::to_string),
                    dkim_domains: request.dkim_domains.to_vec(),
                    arc_result: request.arc_result.map(|arc| arc.result.clone()),
                });
            }
            if let Some(delay) = self.dmarc_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(result) = &self.dmarc {
                return result.clone();
            }
            Ok(dmarc_verdict(AuthResult::Pass, request.header_from))
        })
    }
}

impl BimiVerifier for FakeBackend {
    fn evaluate_bimi<'a>(&'a self, request: BimiRequest<'a>) -> VerifyFuture<'a, BimiVerdict> {
        Box::pin(async move {
            self.recorded().calls.push(Stage::Bimi);
            if let Some(result) = &self.bimi {
                return result.clone();
            }
            let domain = request
                .dmarc
                .domain
                .clone()
                .unwrap_or_else(|| self.domain.clone());
            Ok(BimiVerdict {
                result: AuthResult::Pass,
                info: Some(format!("bimi=pass header.d={domain}")),
                selector: Some("default".to_string()),
                location: Some(format!("https://{domain}/logo.svg")),
                authority: None,
                domain: Some(domain),
            })
        })
    }
}

/// Bundles `backend` with an empty [`StaticResolver`].
pub fn verifiers(backend: Arc<FakeBackend>) -> Verifiers {
    Verifiers::from_backend(Arc::new(StaticResolver::new()), backend)
}

pub fn spf_verdict(result: AuthResult, domain: &str) -> SpfVerdict {
    SpfVerdict {
        info: Some(format!("spf={result} smtp.mailfrom={domain}")),
        header: Some(format!("Received-SPF: {result}")),
        domain: Some(domain.to_string()),
        result,
    }
}

/// One passing, aligned signature for `header_from` (or `example.com`),
/// plus a single-set seal chain when `sealed`.
pub fn dkim_verdict(header_from: Option<&str>, sealed: bool) -> DkimVerdict {
    let domain = header_from.unwrap_or("example.com").to_string();
    let seal_chain = sealed.then(|| SealChain {
        sets: vec![ArcSet {
            instance: 1,
            seal: Some(format!("i=1; a=rsa-sha256; cv=none; d={domain}; s=arc")),
            message_signature: Some(format!("i=1; a=rsa-sha256; d={domain}; s=arc")),
            authentication_results: Some(format!("i=1; {domain}; dkim=pass")),
        }],
        message: Arc::from(&b""[..]),
    });
    DkimVerdict {
        signatures: vec![DkimSignatureVerdict {
            signing_domain: Some(domain.clone()),
            result: AuthResult::Pass,
            aligned: header_from.map(str::to_string),
            info: Some(format!("dkim=pass header.d={domain}")),
        }],
        seal_chain,
        header_from: header_from.map(str::to_string),
        headers: Vec::new(),
    }
}

pub fn dmarc_verdict(result: AuthResult, domain: &str) -> DmarcVerdict {
    DmarcVerdict {
        info: Some(format!("dmarc={result} header.from={domain}")),
        domain: Some(domain.to_string()),
        policy: DmarcPolicy::None,
        result,
    }
}
