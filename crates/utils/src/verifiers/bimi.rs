//! BIMI indicator lookup over the shared [`DnsResolver`].

use crate::{
    organizational_domain, parse_tag_list, tag_value, verifier::dns_failure_result, AuthResult,
    BimiRequest, BimiVerdict, BimiVerifier, DnsResolver, VerifyError, VerifyFuture, VerifyResult,
};

/// Selector used when the message carries no `BIMI-Selector` header.
pub const DEFAULT_SELECTOR: &str = "default";

/// A published `v=BIMI1` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BimiRecord {
    pub location: Option<String>,
    pub authority: Option<String>,
}

impl BimiRecord {
    pub fn parse(record: &str) -> Self {
        let tags = parse_tag_list(record);
        let non_empty = |tag: &str| {
            tag_value(&tags, tag)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Self {
            location: non_empty("l"),
            authority: non_empty("a"),
        }
    }

    /// A record with an empty `l=` declines to publish an indicator.
    pub fn is_declination(&self) -> bool {
        self.location.is_none()
    }
}

fn is_bimi_record(record: &str) -> bool {
    record
        .trim_start()
        .get(..7)
        .is_some_and(|version| version.eq_ignore_ascii_case("v=BIMI1"))
}

/// Reads the `s=` tag of the `BIMI-Selector` header.
pub fn selector(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("bimi-selector"))
        .and_then(|(_, value)| {
            let tags = parse_tag_list(value);
            tag_value(&tags, "s")
                .filter(|selector| !selector.is_empty())
                .map(str::to_ascii_lowercase)
        })
        .unwrap_or_else(|| DEFAULT_SELECTOR.to_string())
}

async fn lookup_record(
    resolver: &dyn DnsResolver,
    selector: &str,
    domain: &str,
) -> VerifyResult<Option<String>> {
    let records = resolver
        .txt_lookup(&format!("{selector}._bimi.{domain}"))
        .await?;
    Ok(records.into_iter().find(|record| is_bimi_record(record)))
}

/// Finds the brand indicator published for a DMARC-passing domain.
#[derive(Debug, Default, Clone, Copy)]
pub struct BimiEvaluator;

impl BimiEvaluator {
    async fn evaluate(&self, request: BimiRequest<'_>) -> VerifyResult<BimiVerdict> {
        let Some(domain) = request.dmarc.domain.as_deref() else {
            return Err(VerifyError::Malformed(
                "DMARC verdict carries no domain".to_string(),
            ));
        };
        let domain = domain.to_ascii_lowercase();
        let selector = selector(request.headers);

        let verdict = |result: AuthResult, record: Option<BimiRecord>| {
            let record = record.unwrap_or(BimiRecord {
                location: None,
                authority: None,
            });
            BimiVerdict {
                info: Some(format!(
                    "bimi={result} header.d={domain} header.selector={selector}"
                )),
                domain: Some(domain.clone()),
                selector: Some(selector.clone()),
                location: record.location,
                authority: record.authority,
                result,
            }
        };

        if !request.dmarc.result.is_pass() {
            return Ok(verdict(AuthResult::Skipped, None));
        }

        let mut record = match lookup_record(request.resolver, &selector, &domain).await {
            Ok(record) => record,
            Err(error) => return Ok(verdict(dns_failure_result(&error), None)),
        };
        let organizational = organizational_domain(&domain);
        if record.is_none() && organizational != domain {
            record = match lookup_record(request.resolver, &selector, &organizational).await {
                Ok(record) => record,
                Err(error) => return Ok(verdict(dns_failure_result(&error), None)),
            };
        }

        match record.map(|raw| BimiRecord::parse(&raw)) {
            Some(record) if !record.is_declination() => Ok(verdict(AuthResult::Pass, Some(record))),
            _ => Ok(verdict(AuthResult::None, None)),
        }
    }
}

impl BimiVerifier for BimiEvaluator {
    fn evaluate_bimi<'a>(&'a self, request: BimiRequest<'a>) -> VerifyFuture<'a, BimiVerdict> {
        Box::pin(self.evaluate(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::{self, StaticResolver}, DmarcVerdict};

    fn passing_dmarc(domain: &str) -> DmarcVerdict {
        testing::dmarc_verdict(AuthResult::Pass, domain)
    }

    #[test]
    fn test_selector_from_header() {
        let headers = vec![(
            "BIMI-Selector".to_string(),
            "v=BIMI1; s=Brand".to_string(),
        )];
        assert_eq!(selector(&headers), "brand");
        assert_eq!(selector(&[]), DEFAULT_SELECTOR);
    }

    #[test]
    fn test_parse_record() {
        let record = BimiRecord::parse("v=BIMI1; l=https://example.com/logo.svg; a=");
        assert_eq!(record.location.as_deref(), Some("https://example.com/logo.svg"));
        assert_eq!(record.authority, None);
        assert!(BimiRecord::parse("v=BIMI1; l=; a=").is_declination());
    }

    #[tokio::test]
    async fn test_pass_with_published_indicator() {
        let resolver = StaticResolver::new().with_txt(
            "default._bimi.example.com",
            "v=BIMI1; l=https://example.com/logo.svg; a=https://example.com/vmc.pem",
        );
        let dmarc = passing_dmarc("example.com");

        let verdict = BimiEvaluator
            .evaluate(BimiRequest {
                resolver: &resolver,
                dmarc: &dmarc,
                headers: &[],
            })
            .await
            .unwrap();

        assert_eq!(verdict.result, AuthResult::Pass);
        assert_eq!(verdict.domain.as_deref(), Some("example.com"));
        assert_eq!(verdict.selector.as_deref(), Some("default"));
        assert_eq!(verdict.location.as_deref(), Some("https://example.com/logo.svg"));
        assert_eq!(verdict.authority.as_deref(), Some("https://example.com/vmc.pem"));
    }

    #[tokio::test]
    async fn test_selector_and_organizational_fallback() {
        let resolver = StaticResolver::new()
            .with_txt("brand._bimi.example.com", "v=BIMI1; l=https://example.com/b.svg");
        let dmarc = passing_dmarc("news.example.com");
        let headers = vec![("BIMI-Selector".to_string(), "v=BIMI1; s=brand".to_string())];

        let verdict = BimiEvaluator
            .evaluate(BimiRequest {
                resolver: &resolver,
                dmarc: &dmarc,
                headers: &headers,
            })
            .await
            .unwrap();

        assert_eq!(verdict.result, AuthResult::Pass);
        assert_eq!(verdict.domain.as_deref(), Some("news.example.com"));
        assert_eq!(verdict.selector.as_deref(), Some("brand"));
    }

    #[tokio::test]
    async fn test_non_passing_dmarc_is_skipped() {
        let resolver = StaticResolver::new()
            .with_txt("default._bimi.example.com", "v=BIMI1; l=https://example.com/logo.svg");
        let dmarc = testing::dmarc_verdict(AuthResult::Fail, "example.com");

        let verdict = BimiEvaluator
            .evaluate(BimiRequest {
                resolver: &resolver,
                dmarc: &dmarc,
                headers: &[],
            })
            .await
            .unwrap();

        assert_eq!(verdict.result, AuthResult::Skipped);
        assert_eq!(verdict.location, None);
    }

    #[tokio::test]
    async fn test_declination_and_missing_record() {
        let resolver = StaticResolver::new().with_txt("default._bimi.example.com", "v=BIMI1; l=;");
        let dmarc = passing_dmarc("example.com");
        let verdict = BimiEvaluator
            .evaluate(BimiRequest {
                resolver: &resolver,
                dmarc: &dmarc,
                headers: &[],
            })
            .await
            .unwrap();
        assert_eq!(verdict.result, AuthResult::None);

        let dmarc = passing_dmarc("example.org");
        let verdict = BimiEvaluator
            .evaluate(BimiRequest {
                resolver: &resolver,
                dmarc: &dmarc,
                headers: &[],
            })
            .await
            .unwrap();
        assert_eq!(verdict.result, AuthResult::None);
    }

    #[tokio::test]
    async fn test_dns_failure_is_temperror() {
        let resolver = StaticResolver::new().with_failure("default._bimi.example.com");
        let dmarc = passing_dmarc("example.com");

        let verdict = BimiEvaluator
            .evaluate(BimiRequest {
                resolver: &resolver,
                dmarc: &dmarc,
                headers: &[],
            })
            .await
            .unwrap();

        assert_eq!(verdict.result, AuthResult::TempError);
    }

    #[tokio::test]
    async fn test_dmarc_without_domain_is_fault() {
        let resolver = StaticResolver::new();
        let mut dmarc = passing_dmarc("example.com");
        dmarc.domain = None;

        let error = BimiEvaluator
            .evaluate(BimiRequest {
                resolver: &resolver,
                dmarc: &dmarc,
                headers: &[],
            })
            .await
            .unwrap_err();

        assert!(matches!(error, VerifyError::Malformed(_)));
    }
}
