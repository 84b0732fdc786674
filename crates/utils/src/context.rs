use crate::{ArcVerdict, BimiVerdict, DkimVerdict, DmarcVerdict, SpfVerdict, StageOutcome};

/// Per-transaction record of what each authentication stage produced.
///
/// A field stays `None` when its stage never ran, either because the
/// transaction ended first or because a precursor was missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionAuthContext {
    sender: String,
    pub spf: Option<StageOutcome<SpfVerdict>>,
    pub dkim: Option<StageOutcome<DkimVerdict>>,
    pub arc: Option<StageOutcome<ArcVerdict>>,
    pub dmarc: Option<StageOutcome<DmarcVerdict>>,
    pub bimi: Option<StageOutcome<BimiVerdict>>,
}

impl TransactionAuthContext {
    pub fn new(sender: &str) -> Self {
        Self {
            sender: sender.to_string(),
            ..Default::default()
        }
    }

    /// Envelope-from address, fixed at creation.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn spf_verdict(&self) -> Option<&SpfVerdict> {
        self.spf.as_ref().and_then(StageOutcome::verdict)
    }

    pub fn dkim_verdict(&self) -> Option<&DkimVerdict> {
        self.dkim.as_ref().and_then(StageOutcome::verdict)
    }

    pub fn arc_verdict(&self) -> Option<&ArcVerdict> {
        self.arc.as_ref().and_then(StageOutcome::verdict)
    }

    pub fn dmarc_verdict(&self) -> Option<&DmarcVerdict> {
        self.dmarc.as_ref().and_then(StageOutcome::verdict)
    }

    pub fn bimi_verdict(&self) -> Option<&BimiVerdict> {
        self.bimi.as_ref().and_then(StageOutcome::verdict)
    }

    /// SPF domain handed to DMARC, only when SPF passed.
    pub fn spf_aligned_domain(&self) -> Option<&str> {
        self.spf_verdict()
            .filter(|verdict| verdict.result.is_pass())
            .and_then(|verdict| verdict.domain.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthResult, VerifyError};

    fn spf(result: AuthResult) -> SpfVerdict {
        SpfVerdict {
            result,
            domain: Some("example.com".to_string()),
            header: None,
            info: None,
        }
    }

    #[test]
    fn test_new_context_is_empty() {
        let context = TransactionAuthContext::new("alice@example.com");
        assert_eq!(context.sender(), "alice@example.com");
        assert!(context.spf.is_none());
        assert!(context.dkim.is_none());
        assert!(context.arc.is_none());
        assert!(context.dmarc.is_none());
        assert!(context.bimi.is_none());
    }

    #[test]
    fn test_spf_aligned_domain_requires_pass() {
        let mut context = TransactionAuthContext::new("alice@example.com");
        context.spf = Some(StageOutcome::Verdict(spf(AuthResult::SoftFail)));
        assert_eq!(context.spf_aligned_domain(), None);

        context.spf = Some(StageOutcome::Verdict(spf(AuthResult::Pass)));
        assert_eq!(context.spf_aligned_domain(), Some("example.com"));

        context.spf = Some(StageOutcome::Error(VerifyError::Dns("x".to_string())));
        assert_eq!(context.spf_aligned_domain(), None);
    }
}
