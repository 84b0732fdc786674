//! DKIM and ARC verification through `mail-auth`.
//!
//! mail-auth checks the signatures with its own resolver. The signing keys
//! of passing signatures are then measured through the shared
//! [`DnsResolver`], and one shorter than the request's `min_key_bits`
//! turns the result into `fail`.

use std::sync::Arc;

use mail_auth::{dkim::Signature, AuthenticatedMessage, DkimResult, MessageAuthenticator};
use tracing::{debug, warn};

use crate::{
    address_domain, organizational_domain, parse_raw_headers, parse_tag_list, tag_value,
    verifier::dns_failure_result,
    verifiers::key_size,
    ArcRequest, ArcSet, ArcVerdict, ArcVerifier, AuthResult, DkimRequest, DkimSignatureVerdict,
    DkimVerdict, DkimVerifier, DnsResolver, SealChain, VerifyError, VerifyFuture, VerifyResult,
};

/// Verifier for the two signature-level protocols.
pub struct MailAuthVerifier {
    authenticator: MessageAuthenticator,
}

impl MailAuthVerifier {
    /// Initializes a DNS resolver from the system configuration, falling
    /// back to Cloudflare DNS-over-TLS if system config is unavailable.
    pub fn from_system_conf() -> VerifyResult<Self> {
        let authenticator = match MessageAuthenticator::new_system_conf() {
            Ok(authenticator) => authenticator,
            Err(error) => {
                warn!(error = %error, "Failed to load system DNS config, falling back to Cloudflare TLS");
                MessageAuthenticator::new_cloudflare_tls()
                    .map_err(|error| VerifyError::Dns(error.to_string()))?
            }
        };
        Ok(Self { authenticator })
    }

    async fn verify(&self, request: DkimRequest<'_>) -> VerifyResult<DkimVerdict> {
        let checked: Vec<(AuthResult, Option<(String, String)>)> = {
            let message = AuthenticatedMessage::parse(request.message).ok_or_else(|| {
                VerifyError::Malformed("message could not be parsed for DKIM".to_string())
            })?;
            let outputs = self.authenticator.verify_dkim(&message).await;
            outputs
                .iter()
                .map(|output| (dkim_result(output.result()), signature_key(output.signature())))
                .collect()
        };

        let text = String::from_utf8_lossy(request.message);
        let (headers, _) = parse_raw_headers(&text);
        let header_from = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("from"))
            .and_then(|(_, value)| address_domain(value));

        let mut signatures = Vec::with_capacity(checked.len());
        for (result, key) in checked {
            let signing_domain = key.as_ref().map(|(_, domain)| domain.clone());
            let result = match &key {
                Some((selector, domain)) => {
                    key_floor(request.resolver, result, selector, domain, request.min_key_bits)
                        .await
                }
                None => result,
            };
            let aligned = match (&signing_domain, &header_from) {
                (Some(signing), Some(from))
                    if organizational_domain(signing) == organizational_domain(from) =>
                {
                    Some(from.clone())
                }
                _ => None,
            };
            let info = Some(match &signing_domain {
                Some(domain) => format!("dkim={result} header.d={domain}"),
                None => format!("dkim={result}"),
            });
            signatures.push(DkimSignatureVerdict {
                signing_domain,
                result,
                aligned,
                info,
            });
        }

        Ok(DkimVerdict {
            signatures,
            seal_chain: seal_chain(&headers, request.message),
            header_from,
            headers,
        })
    }

    async fn evaluate(&self, request: ArcRequest<'_>) -> VerifyResult<ArcVerdict> {
        let (mut result, mut keys) = {
            let message = AuthenticatedMessage::parse(&request.chain.message).ok_or_else(|| {
                VerifyError::Malformed("message could not be parsed for ARC".to_string())
            })?;
            let output = self.authenticator.verify_arc(&message).await;
            let keys: Vec<(String, String)> = output
                .sets()
                .iter()
                .flat_map(|set| {
                    [
                        (set.seal.header.s.clone(), set.seal.header.d.to_ascii_lowercase()),
                        (
                            set.signature.header.s.clone(),
                            set.signature.header.d.to_ascii_lowercase(),
                        ),
                    ]
                })
                .collect();
            (dkim_result(output.result()), keys)
        };
        keys.sort();
        keys.dedup();
        for (selector, domain) in &keys {
            if !result.is_pass() {
                break;
            }
            result = key_floor(request.resolver, result, selector, domain, request.min_key_bits)
                .await;
        }

        let signing_domain = request
            .chain
            .latest()
            .and_then(|set| set.seal.as_deref())
            .and_then(|seal| {
                let tags = parse_tag_list(seal);
                tag_value(&tags, "d").map(str::to_ascii_lowercase)
            });
        Ok(ArcVerdict {
            info: Some(format!("arc={result}")),
            result,
            signing_domain,
        })
    }
}

impl DkimVerifier for MailAuthVerifier {
    fn verify_dkim<'a>(&'a self, request: DkimRequest<'a>) -> VerifyFuture<'a, DkimVerdict> {
        Box::pin(self.verify(request))
    }
}

impl ArcVerifier for MailAuthVerifier {
    fn evaluate_arc<'a>(&'a self, request: ArcRequest<'a>) -> VerifyFuture<'a, ArcVerdict> {
        Box::pin(self.evaluate(request))
    }
}

/// Selector and lowercased signing domain of a parsed signature.
fn signature_key(signature: Option<&Signature>) -> Option<(String, String)> {
    signature.map(|signature| (signature.s.clone(), signature.d.to_ascii_lowercase()))
}

/// Demotes a passing `result` when the key of `selector` in `domain` is
/// shorter than `min_key_bits`. A lookup failure yields the matching error
/// result.
async fn key_floor(
    resolver: &dyn DnsResolver,
    result: AuthResult,
    selector: &str,
    domain: &str,
    min_key_bits: u32,
) -> AuthResult {
    if !result.is_pass() {
        return result;
    }
    match key_size(resolver, selector, domain).await {
        Ok(size) if size.below(min_key_bits) => {
            debug!(
                domain = %domain,
                selector = %selector,
                size = ?size,
                min_key_bits = min_key_bits,
                "Signing key below the configured floor"
            );
            AuthResult::Fail
        }
        Ok(_) => result,
        Err(error) => {
            warn!(domain = %domain, selector = %selector, error = %error, "Signing key lookup failed");
            dns_failure_result(&error)
        }
    }
}

/// Groups the ARC headers by instance, `None` when the message carries
/// no ARC set.
pub fn seal_chain(headers: &[(String, String)], message: &[u8]) -> Option<SealChain> {
    let mut sets: Vec<ArcSet> = Vec::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if !matches!(
            name.as_str(),
            "arc-seal" | "arc-message-signature" | "arc-authentication-results"
        ) {
            continue;
        }
        let tags = parse_tag_list(value);
        let Some(instance) = tag_value(&tags, "i").and_then(|i| i.parse::<u32>().ok()) else {
            continue;
        };
        let index = match sets.iter().position(|set| set.instance == instance) {
            Some(index) => index,
            None => {
                sets.push(ArcSet {
                    instance,
                    seal: None,
                    message_signature: None,
                    authentication_results: None,
                });
                sets.len() - 1
            }
        };
        let set = &mut sets[index];
        let slot = match name.as_str() {
            "arc-seal" => &mut set.seal,
            "arc-message-signature" => &mut set.message_signature,
            _ => &mut set.authentication_results,
        };
        *slot = Some(value.clone());
    }
    if sets.is_empty() {
        return None;
    }
    sets.sort_by_key(|set| set.instance);
    Some(SealChain {
        sets,
        message: Arc::from(message),
    })
}

fn dkim_result(result: &DkimResult) -> AuthResult {
    match result {
        DkimResult::Pass => AuthResult::Pass,
        DkimResult::Fail(_) => AuthResult::Fail,
        DkimResult::Neutral(_) => AuthResult::Neutral,
        DkimResult::None => AuthResult::None,
        DkimResult::TempError(_) => AuthResult::TempError,
        DkimResult::PermError(_) => AuthResult::PermError,
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose, Engine as _};

    use super::*;
    use crate::testing::StaticResolver;

    /// `v=DKIM1` record carrying a PKCS#1 key with a `bits` long modulus.
    fn key_record(bits: usize) -> String {
        let mut modulus = vec![0u8; bits / 8 + 1];
        modulus[1] = 0x80;
        let length = modulus.len();
        let mut integer = vec![0x02, 0x82, (length >> 8) as u8, length as u8];
        integer.extend_from_slice(&modulus);
        integer.extend_from_slice(&[0x02, 0x03, 0x01, 0x00, 0x01]);
        let length = integer.len();
        let mut key = vec![0x30, 0x82, (length >> 8) as u8, length as u8];
        key.extend_from_slice(&integer);
        format!("v=DKIM1; p={}", general_purpose::STANDARD.encode(key))
    }

    #[test]
    fn test_signature_key_from_parsed_signature() {
        let signature = Signature {
            d: "Mail.Example.COM".to_string(),
            s: "sel".to_string(),
            ..Default::default()
        };

        assert_eq!(
            signature_key(Some(&signature)),
            Some(("sel".to_string(), "mail.example.com".to_string()))
        );
        assert_eq!(signature_key(None), None);
    }

    #[tokio::test]
    async fn test_key_floor() {
        let resolver = StaticResolver::new()
            .with_txt("weak._domainkey.example.com", &key_record(512))
            .with_txt("strong._domainkey.example.com", &key_record(2048))
            .with_failure("down._domainkey.example.com");

        for (result, selector, expected) in [
            (AuthResult::Pass, "weak", AuthResult::Fail),
            (AuthResult::Pass, "strong", AuthResult::Pass),
            (AuthResult::Pass, "down", AuthResult::TempError),
            (AuthResult::Pass, "missing", AuthResult::Pass),
            (AuthResult::Neutral, "weak", AuthResult::Neutral),
        ] {
            assert_eq!(
                key_floor(&resolver, result, selector, "example.com", 1024).await,
                expected,
                "selector {selector}"
            );
        }
        assert_eq!(
            key_floor(&resolver, AuthResult::Pass, "weak", "example.com", 512).await,
            AuthResult::Pass
        );
    }

    #[test]
    fn test_dkim_result_mapping() {
        assert_eq!(dkim_result(&DkimResult::Pass), AuthResult::Pass);
        assert_eq!(
            dkim_result(&DkimResult::Fail(mail_auth::Error::FailedVerification)),
            AuthResult::Fail
        );
        assert_eq!(
            dkim_result(&DkimResult::Neutral(mail_auth::Error::RevokedPublicKey)),
            AuthResult::Neutral
        );
        assert_eq!(
            dkim_result(&DkimResult::TempError(mail_auth::Error::DnsError(
                "timeout".to_string()
            ))),
            AuthResult::TempError
        );
        assert_eq!(
            dkim_result(&DkimResult::PermError(mail_auth::Error::ParseError)),
            AuthResult::PermError
        );
    }

    #[test]
    fn test_seal_chain_groups_by_instance() {
        let headers = vec![
            ("ARC-Seal".to_string(), "i=2; a=rsa-sha256; d=relay2.example; s=arc".to_string()),
            ("ARC-Message-Signature".to_string(), "i=2; d=relay2.example".to_string()),
            ("ARC-Authentication-Results".to_string(), "i=1; relay1.example; dkim=pass".to_string()),
            ("ARC-Seal".to_string(), "i=1; a=rsa-sha256; d=relay1.example; s=arc".to_string()),
            ("Subject".to_string(), "Hi".to_string()),
        ];

        let chain = seal_chain(&headers, b"raw").unwrap();

        assert_eq!(chain.sets.len(), 2);
        assert_eq!(chain.sets[0].instance, 1);
        assert!(chain.sets[0].authentication_results.is_some());
        assert!(chain.sets[0].message_signature.is_none());
        assert_eq!(chain.latest().unwrap().instance, 2);
        assert_eq!(&*chain.message, b"raw");
    }

    #[test]
    fn test_seal_chain_absent() {
        let headers = vec![("Subject".to_string(), "Hi".to_string())];
        assert!(seal_chain(&headers, b"raw").is_none());
    }
}
