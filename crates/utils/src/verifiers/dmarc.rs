//! DMARC policy evaluation over the shared [`DnsResolver`].

use tracing::debug;

use crate::{
    organizational_domain, parse_tag_list, tag_value, verifier::dns_failure_result, AuthResult,
    DmarcPolicy, DmarcRequest, DmarcVerdict, DmarcVerifier, DnsResolver, VerifyError,
    VerifyFuture, VerifyResult,
};

/// Identifier alignment mode (`adkim=` / `aspf=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Relaxed,
    Strict,
}

impl Alignment {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.eq_ignore_ascii_case("s") => Alignment::Strict,
            _ => Alignment::Relaxed,
        }
    }

    /// Whether `domain` aligns with the header-From domain `from`.
    pub fn aligns(&self, domain: &str, from: &str) -> bool {
        match self {
            Alignment::Strict => domain.eq_ignore_ascii_case(from),
            Alignment::Relaxed => organizational_domain(domain) == organizational_domain(from),
        }
    }
}

/// A published `v=DMARC1` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcRecord {
    pub policy: DmarcPolicy,
    pub subdomain_policy: Option<DmarcPolicy>,
    pub dkim_alignment: Alignment,
    pub spf_alignment: Alignment,
}

impl DmarcRecord {
    /// Parses a record, `None` when `p=` is missing or unknown.
    pub fn parse(record: &str) -> Option<Self> {
        let tags = parse_tag_list(record);
        let policy = DmarcPolicy::parse(tag_value(&tags, "p")?)?;
        Some(Self {
            policy,
            subdomain_policy: tag_value(&tags, "sp").and_then(DmarcPolicy::parse),
            dkim_alignment: Alignment::parse(tag_value(&tags, "adkim")),
            spf_alignment: Alignment::parse(tag_value(&tags, "aspf")),
        })
    }
}

fn is_dmarc_record(record: &str) -> bool {
    record
        .trim_start()
        .get(..8)
        .is_some_and(|version| version.eq_ignore_ascii_case("v=DMARC1"))
}

/// Looks up the DMARC record for `domain`, returning the first
/// `v=DMARC1` record.
async fn lookup_record(resolver: &dyn DnsResolver, domain: &str) -> VerifyResult<Option<String>> {
    let records = resolver.txt_lookup(&format!("_dmarc.{domain}")).await?;
    Ok(records.into_iter().find(|record| is_dmarc_record(record)))
}

/// Evaluates the header-From domain's DMARC policy against the SPF and
/// DKIM identifiers handed over by the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct DmarcEvaluator;

impl DmarcEvaluator {
    async fn evaluate(&self, request: DmarcRequest<'_>) -> VerifyResult<DmarcVerdict> {
        let from = request.header_from.trim().trim_end_matches('.').to_ascii_lowercase();
        if from.is_empty() {
            return Err(VerifyError::Malformed("empty header-From domain".to_string()));
        }

        let verdict = |result: AuthResult, policy: DmarcPolicy| DmarcVerdict {
            info: Some(format!("dmarc={result} (p={}) header.from={from}", policy.as_str())),
            domain: Some(from.clone()),
            policy,
            result,
        };

        let mut record = match lookup_record(request.resolver, &from).await {
            Ok(record) => record.map(|record| (record, false)),
            Err(error) => {
                return Ok(verdict(dns_failure_result(&error), DmarcPolicy::Unspecified));
            }
        };
        let organizational = organizational_domain(&from);
        if record.is_none() && organizational != from {
            record = match lookup_record(request.resolver, &organizational).await {
                Ok(record) => record.map(|record| (record, true)),
                Err(error) => {
                    return Ok(verdict(dns_failure_result(&error), DmarcPolicy::Unspecified));
                }
            };
        }

        let Some((raw, inherited)) = record else {
            return Ok(verdict(AuthResult::None, DmarcPolicy::Unspecified));
        };
        let Some(record) = DmarcRecord::parse(&raw) else {
            debug!(domain = %from, record = %raw, "DMARC record without usable policy");
            return Ok(verdict(AuthResult::PermError, DmarcPolicy::Unspecified));
        };
        let policy = match (inherited, record.subdomain_policy) {
            (true, Some(subdomain_policy)) => subdomain_policy,
            _ => record.policy,
        };

        let dkim_aligned = request
            .dkim_domains
            .iter()
            .any(|domain| record.dkim_alignment.aligns(domain, &from));
        let spf_aligned = request
            .spf_domain
            .is_some_and(|domain| record.spf_alignment.aligns(domain, &from));
        if let Some(arc) = request.arc_result {
            debug!(domain = %from, arc = %arc.result, "ARC result available to DMARC");
        }

        let result = if dkim_aligned || spf_aligned {
            AuthResult::Pass
        } else {
            AuthResult::Fail
        };
        Ok(verdict(result, policy))
    }
}

impl DmarcVerifier for DmarcEvaluator {
    fn evaluate_dmarc<'a>(&'a self, request: DmarcRequest<'a>) -> VerifyFuture<'a, DmarcVerdict> {
        Box::pin(self.evaluate(request))
    }
}
