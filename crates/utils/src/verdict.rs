//! Typed verdicts produced by the verification collaborators.
//!
//! Each protocol has its own verdict type with a fixed field set. Values
//! coming from a verification library are converted into these types at the
//! collaborator boundary and nothing else travels through the pipeline.

use std::{fmt::Display, str::FromStr, sync::Arc};

/// Protocol-level outcome of an authentication check.
///
/// The exact subset in use varies per protocol. [`AuthResult::Skipped`] and
/// [`AuthResult::Other`] carry outcomes the classifier does not know, they
/// never produce a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    Policy,
    TempError,
    PermError,
    Skipped,
    Other(String),
}

impl AuthResult {
    pub fn as_str(&self) -> &str {
        match self {
            AuthResult::Pass => "pass",
            AuthResult::Fail => "fail",
            AuthResult::SoftFail => "softfail",
            AuthResult::Neutral => "neutral",
            AuthResult::None => "none",
            AuthResult::Policy => "policy",
            AuthResult::TempError => "temperror",
            AuthResult::PermError => "permerror",
            AuthResult::Skipped => "skipped",
            AuthResult::Other(value) => value,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, AuthResult::Pass)
    }
}

impl Display for AuthResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthResult {
    type Err = std::convert::Infallible;

    /// Parsing is total, unrecognized values become [`AuthResult::Other`].
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let result = match value.trim().to_ascii_lowercase().as_str() {
            "pass" => AuthResult::Pass,
            "fail" => AuthResult::Fail,
            "softfail" => AuthResult::SoftFail,
            "neutral" => AuthResult::Neutral,
            "none" => AuthResult::None,
            "policy" => AuthResult::Policy,
            "temperror" => AuthResult::TempError,
            "permerror" => AuthResult::PermError,
            "skipped" => AuthResult::Skipped,
            other => AuthResult::Other(other.to_string()),
        };
        Ok(result)
    }
}

/// SPF verdict for the envelope sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfVerdict {
    pub result: AuthResult,
    /// Domain the SPF policy was evaluated for (MAIL FROM or HELO domain).
    pub domain: Option<String>,
    /// Raw `Received-SPF:` header line, label included.
    pub header: Option<String>,
    /// Fragment for the Authentication-Results trailer.
    pub info: Option<String>,
}

/// Result for one `DKIM-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignatureVerdict {
    pub signing_domain: Option<String>,
    pub result: AuthResult,
    /// Header-From domain this signature aligns with, when aligned.
    pub aligned: Option<String>,
    pub info: Option<String>,
}

/// One ARC set (`i=` instance) as found in the message headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcSet {
    pub instance: u32,
    pub seal: Option<String>,
    pub message_signature: Option<String>,
    pub authentication_results: Option<String>,
}

/// ARC seal chain extracted while verifying DKIM.
///
/// Holds the canonical message bytes as well, the message signature of each
/// set covers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealChain {
    pub sets: Vec<ArcSet>,
    pub message: Arc<[u8]>,
}

impl SealChain {
    /// Returns the set with the highest instance number.
    pub fn latest(&self) -> Option<&ArcSet> {
        self.sets.iter().max_by_key(|set| set.instance)
    }
}

/// Output of DKIM verification, including data later stages depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimVerdict {
    pub signatures: Vec<DkimSignatureVerdict>,
    pub seal_chain: Option<SealChain>,
    /// Domain of the RFC 5322 `From` header, when it could be parsed.
    pub header_from: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl DkimVerdict {
    /// Signing domains of passing signatures aligned with the header-From
    /// domain, in signature order and without duplicates.
    pub fn aligned_pass_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for signature in &self.signatures {
            if !signature.result.is_pass() || signature.aligned.is_none() {
                continue;
            }
            if let Some(domain) = &signature.signing_domain {
                if !domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
                    domains.push(domain.clone());
                }
            }
        }
        domains
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcVerdict {
    pub result: AuthResult,
    pub signing_domain: Option<String>,
    pub info: Option<String>,
}

/// Requested DMARC disposition policy (`p=` / `sp=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
    Unspecified,
}

impl DmarcPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(DmarcPolicy::None),
            "quarantine" => Some(DmarcPolicy::Quarantine),
            "reject" => Some(DmarcPolicy::Reject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DmarcPolicy::None => "none",
            DmarcPolicy::Quarantine => "quarantine",
            DmarcPolicy::Reject => "reject",
            DmarcPolicy::Unspecified => "unspecified",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcVerdict {
    pub result: AuthResult,
    /// Header-From domain the policy outcome applies to.
    pub domain: Option<String>,
    pub policy: DmarcPolicy,
    pub info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BimiVerdict {
    pub result: AuthResult,
    /// Domain the indicator record was published for.
    pub domain: Option<String>,
    pub selector: Option<String>,
    pub location: Option<String>,
    pub authority: Option<String>,
    pub info: Option<String>,
}

/// Verdict view used when settling a stage into the ledger and trailer.
pub trait Classifiable {
    /// `(result, domain)` pairs to classify, one per evaluated identity.
    fn outcomes(&self) -> Vec<(&AuthResult, Option<&str>)>;

    /// Fragments for the Authentication-Results trailer.
    fn diagnostics(&self) -> Vec<&str>;
}

impl Classifiable for SpfVerdict {
    fn outcomes(&self) -> Vec<(&AuthResult, Option<&str>)> {
        vec![(&self.result, self.domain.as_deref())]
    }

    fn diagnostics(&self) -> Vec<&str> {
        self.info.as_deref().into_iter().collect()
    }
}

impl Classifiable for DkimVerdict {
    fn outcomes(&self) -> Vec<(&AuthResult, Option<&str>)> {
        self.signatures
            .iter()
            .map(|signature| (&signature.result, signature.signing_domain.as_deref()))
            .collect()
    }

    fn diagnostics(&self) -> Vec<&str> {
        self.signatures
            .iter()
            .filter_map(|signature| signature.info.as_deref())
            .collect()
    }
}

impl Classifiable for ArcVerdict {
    fn outcomes(&self) -> Vec<(&AuthResult, Option<&str>)> {
        vec![(&self.result, self.signing_domain.as_deref())]
    }

    fn diagnostics(&self) -> Vec<&str> {
        self.info.as_deref().into_iter().collect()
    }
}

impl Classifiable for DmarcVerdict {
    fn outcomes(&self) -> Vec<(&AuthResult, Option<&str>)> {
        vec![(&self.result, self.domain.as_deref())]
    }

    fn diagnostics(&self) -> Vec<&str> {
        self.info.as_deref().into_iter().collect()
    }
}

impl Classifiable for BimiVerdict {
    fn outcomes(&self) -> Vec<(&AuthResult, Option<&str>)> {
        vec![(&self.result, self.domain.as_deref())]
    }

    fn diagnostics(&self) -> Vec<&str> {
        self.info.as_deref().into_iter().collect()
    }
}
