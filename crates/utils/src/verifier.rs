//! Call contracts for the external verification collaborators.
//!
//! The pipeline never verifies signatures or evaluates records itself, it
//! calls the five verifiers declared here. Each returns a boxed future so
//! implementations may suspend on DNS or cryptographic work, and each may
//! fail with a [`VerifyError`], which the pipeline records as a stage fault.
//! Concrete implementations live in the [`verifiers`](crate::verifiers)
//! module.

use std::{error::Error, fmt::Display, future::Future, net::IpAddr, pin::Pin, sync::Arc, time::Duration};

use crate::{ArcVerdict, AuthResult, BimiVerdict, DkimVerdict, DmarcVerdict, SealChain, SpfVerdict};

/// Result type for collaborator calls.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Boxed future type for collaborator calls, enabling object safety.
pub type VerifyFuture<'a, T> = Pin<Box<dyn Future<Output = VerifyResult<T>> + Send + 'a>>;

/// Faults raised by a collaborator itself.
///
/// Distinct from a `temperror`/`permerror` verdict: a fault means the
/// collaborator could not produce a verdict at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The input could not be parsed.
    Malformed(String),
    /// The DNS transport failed.
    Dns(String),
    /// The collaborator hit an internal defect.
    Internal(String),
    /// The call exceeded the configured stage deadline.
    Timeout(Duration),
}

impl Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::Malformed(msg) => write!(f, "Malformed input: {msg}"),
            VerifyError::Dns(msg) => write!(f, "DNS error: {msg}"),
            VerifyError::Internal(msg) => write!(f, "Internal error: {msg}"),
            VerifyError::Timeout(limit) => write!(f, "Timed out after {}ms", limit.as_millis()),
        }
    }
}

impl Error for VerifyError {}

/// Reentrant DNS resolver shared by every collaborator.
pub trait DnsResolver: Send + Sync {
    /// Looks up the TXT records of `name`, each record's character strings
    /// concatenated. A name without records yields an empty list.
    fn txt_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<String>>;

    /// Looks up the IPv4 and IPv6 addresses of `name`.
    fn ip_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<IpAddr>>;

    /// Looks up the mail exchangers of `name`, most preferred first.
    fn mx_lookup<'a>(&'a self, name: &'a str) -> VerifyFuture<'a, Vec<String>>;
}

pub struct SpfRequest<'a> {
    pub resolver: &'a dyn DnsResolver,
    pub client_ip: IpAddr,
    pub helo: &'a str,
    pub sender: &'a str,
    /// Host name of the receiving MTA.
    pub receiving_host: &'a str,
    pub max_lookups: u32,
}

pub struct DkimRequest<'a> {
    pub resolver: &'a dyn DnsResolver,
    /// Full message with CRLF line endings.
    pub message: &'a [u8],
    pub sender: &'a str,
    pub min_key_bits: u32,
}

pub struct ArcRequest<'a> {
    pub resolver: &'a dyn DnsResolver,
    pub chain: &'a SealChain,
    pub min_key_bits: u32,
}

pub struct DmarcRequest<'a> {
    pub resolver: &'a dyn DnsResolver,
    pub header_from: &'a str,
    /// SPF domain, present only when SPF passed.
    pub spf_domain: Option<&'a str>,
    /// Aligned, passing DKIM signing domains.
    pub dkim_domains: &'a [String],
    pub arc_result: Option<&'a ArcVerdict>,
}

pub struct BimiRequest<'a> {
    pub resolver: &'a dyn DnsResolver,
    pub dmarc: &'a DmarcVerdict,
    pub headers: &'a [(String, String)],
}

pub trait SpfVerifier: Send + Sync {
    fn check_spf<'a>(&'a self, request: SpfRequest<'a>) -> VerifyFuture<'a, SpfVerdict>;
}

pub trait DkimVerifier: Send + Sync {
    fn verify_dkim<'a>(&'a self, request: DkimRequest<'a>) -> VerifyFuture<'a, DkimVerdict>;
}

pub trait ArcVerifier: Send + Sync {
    fn evaluate_arc<'a>(&'a self, request: ArcRequest<'a>) -> VerifyFuture<'a, ArcVerdict>;
}

pub trait DmarcVerifier: Send + Sync {
    fn evaluate_dmarc<'a>(&'a self, request: DmarcRequest<'a>) -> VerifyFuture<'a, DmarcVerdict>;
}

pub trait BimiVerifier: Send + Sync {
    fn evaluate_bimi<'a>(&'a self, request: BimiRequest<'a>) -> VerifyFuture<'a, BimiVerdict>;
}

/// The resolver and the five collaborators, shared across connections.
#[derive(Clone)]
pub struct Verifiers {
    pub resolver: Arc<dyn DnsResolver>,
    pub spf: Arc<dyn SpfVerifier>,
    pub dkim: Arc<dyn DkimVerifier>,
    pub arc: Arc<dyn ArcVerifier>,
    pub dmarc: Arc<dyn DmarcVerifier>,
    pub bimi: Arc<dyn BimiVerifier>,
}

impl Verifiers {
    /// Uses one backend for every collaborator.
    pub fn from_backend<B>(resolver: Arc<dyn DnsResolver>, backend: Arc<B>) -> Self
    where
        B: SpfVerifier + DkimVerifier + ArcVerifier + DmarcVerifier + BimiVerifier + 'static,
    {
        Self {
            resolver,
            spf: backend.clone(),
            dkim: backend.clone(),
            arc: backend.clone(),
            dmarc: backend.clone(),
            bimi: backend,
        }
    }
}

impl std::fmt::Debug for Verifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifiers").finish_non_exhaustive()
    }
}

/// Maps a resolver failure to the verdict evaluators report for it.
pub(crate) fn dns_failure_result(error: &VerifyError) -> AuthResult {
    match error {
        VerifyError::Dns(_) | VerifyError::Timeout(_) => AuthResult::TempError,
        _ => AuthResult::PermError,
    }
}
