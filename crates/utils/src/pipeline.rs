//! Post-body authentication pipeline.
//!
//! Once the message is fully received, DKIM runs first and the remaining
//! stages follow only when the data they consume exists:
//!
//! | Stage | Runs when                                   |
//! |-------|---------------------------------------------|
//! | DKIM  | always                                      |
//! | ARC   | DKIM produced a seal chain                  |
//! | DMARC | DKIM produced a header-From domain          |
//! | BIMI  | DMARC produced a verdict (any result)       |
//!
//! A stage whose collaborator faults leaves an error record behind and the
//! next guard is evaluated as usual. The pipeline always reaches
//! [`PipelineState::Done`] and never returns an error.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    attempt, record_fault, record_verdict, strip_sender_bimi_headers, ArcRequest, BimiRequest,
    Classifiable, ConfigStore, DkimRequest, DmarcRequest, EmailMessage, Stage, StageOutcome,
    Transaction, TransactionAuthContext, Verifiers, VerifyResult, LEDGER_OWNER,
};

/// Position of the post-body pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    /// The given stage has been attempted (it succeeded or faulted).
    Attempted(Stage),
    Done,
}

impl PipelineState {
    /// Returns the next state: the first later stage whose guard holds, or
    /// [`PipelineState::Done`].
    pub fn advance(self, context: &TransactionAuthContext) -> PipelineState {
        let remaining: &[Stage] = match self {
            PipelineState::Init => &Stage::POST_BODY,
            PipelineState::Attempted(stage) => {
                match Stage::POST_BODY.iter().position(|s| *s == stage) {
                    Some(index) => &Stage::POST_BODY[index + 1..],
                    None => &Stage::POST_BODY,
                }
            }
            PipelineState::Done => return PipelineState::Done,
        };
        remaining
            .iter()
            .copied()
            .find(|stage| guard(*stage, context))
            .map_or(PipelineState::Done, PipelineState::Attempted)
    }
}

/// Whether the data `stage` consumes is present in `context`.
pub fn guard(stage: Stage, context: &TransactionAuthContext) -> bool {
    match stage {
        Stage::Spf => false,
        Stage::Dkim => true,
        Stage::Arc => context
            .dkim_verdict()
            .is_some_and(|verdict| verdict.seal_chain.is_some()),
        Stage::Dmarc => context
            .dkim_verdict()
            .is_some_and(|verdict| verdict.header_from.is_some()),
        Stage::Bimi => context.dmarc_verdict().is_some(),
    }
}

/// Summary of one post-body run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Stages that ran, in order.
    pub attempted: Vec<Stage>,
    /// How many of them faulted.
    pub faults: usize,
}

/// Runs the authentication stages against the collaborators.
#[derive(Debug, Clone)]
pub struct AuthPipeline {
    pub(crate) verifiers: Verifiers,
    pub(crate) config: Arc<ConfigStore>,
}

impl AuthPipeline {
    pub fn new(verifiers: Verifiers, config: Arc<ConfigStore>) -> Self {
        Self { verifiers, config }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Runs DKIM, ARC, DMARC and BIMI over the attached message.
    ///
    /// Resolves once every stage whose guard held has been attempted.
    /// Inbound BIMI headers are removed at the end regardless of outcome.
    pub async fn run_post_body(&self, transaction: &mut Transaction) -> PipelineReport {
        let mut context = transaction
            .auth
            .take()
            .unwrap_or_else(|| TransactionAuthContext::new(transaction.sender()));
        let message = transaction
            .message()
            .map(EmailMessage::canonical_bytes)
            .unwrap_or_default();

        let mut report = PipelineReport::default();
        let mut state = PipelineState::Init;
        loop {
            state = state.advance(&context);
            let PipelineState::Attempted(stage) = state else {
                break;
            };
            report.attempted.push(stage);
            if !self
                .run_stage(stage, &mut context, transaction, &message)
                .await
            {
                report.faults += 1;
            }
        }

        for stage in Stage::POST_BODY {
            if !report.attempted.contains(&stage) {
                debug!(transaction = %transaction.id, stage = %stage, "Stage skipped");
            }
        }

        let removed = strip_sender_bimi_headers(transaction);
        if removed > 0 {
            debug!(transaction = %transaction.id, removed = removed, "Removed inbound BIMI headers");
        }

        transaction.auth = Some(context);
        info!(
            transaction = %transaction.id,
            attempted = report.attempted.len(),
            faults = report.faults,
            "Authentication pipeline complete"
        );
        report
    }

    /// Runs one stage, returning `false` when its collaborator faulted.
    async fn run_stage(
        &self,
        stage: Stage,
        context: &mut TransactionAuthContext,
        transaction: &mut Transaction,
        message: &[u8],
    ) -> bool {
        let snapshot = self.config.snapshot();
        let auth = &snapshot.config.auth;
        let deadline = auth.stage_timeout();
        let resolver = &*self.verifiers.resolver;

        match stage {
            Stage::Spf => true,
            Stage::Dkim => {
                let result = attempt(
                    deadline,
                    self.verifiers.dkim.verify_dkim(DkimRequest {
                        resolver,
                        message,
                        sender: context.sender(),
                        min_key_bits: auth.min_bit_length,
                    }),
                )
                .await;
                let outcome = settle(transaction, Stage::Dkim, result);
                let ok = !outcome.is_error();
                context.dkim = Some(outcome);
                ok
            }
            Stage::Arc => {
                let Some(chain) = context
                    .dkim_verdict()
                    .and_then(|verdict| verdict.seal_chain.as_ref())
                else {
                    return true;
                };
                let result = attempt(
                    deadline,
                    self.verifiers.arc.evaluate_arc(ArcRequest {
                        resolver,
                        chain,
                        min_key_bits: auth.min_bit_length,
                    }),
                )
                .await;
                let outcome = settle(transaction, Stage::Arc, result);
                let ok = !outcome.is_error();
                context.arc = Some(outcome);
                ok
            }
            Stage::Dmarc => {
                let Some(dkim) = context.dkim_verdict() else {
                    return true;
                };
                let Some(header_from) = dkim.header_from.as_deref() else {
                    return true;
                };
                let dkim_domains = dkim.aligned_pass_domains();
                let result = attempt(
                    deadline,
                    self.verifiers.dmarc.evaluate_dmarc(DmarcRequest {
                        resolver,
                        header_from,
                        spf_domain: context.spf_aligned_domain(),
                        dkim_domains: &dkim_domains,
                        arc_result: context.arc_verdict(),
                    }),
                )
                .await;
                let outcome = settle(transaction, Stage::Dmarc, result);
                let ok = !outcome.is_error();
                context.dmarc = Some(outcome);
                ok
            }
            Stage::Bimi => {
                let Some(dmarc) = context.dmarc_verdict() else {
                    return true;
                };
                let headers = context
                    .dkim_verdict()
                    .map(|verdict| verdict.headers.as_slice())
                    .unwrap_or(&[]);
                let result = attempt(
                    deadline,
                    self.verifiers.bimi.evaluate_bimi(BimiRequest {
                        resolver,
                        dmarc,
                        headers,
                    }),
                )
                .await;
                let outcome = settle(transaction, Stage::Bimi, result);
                let ok = !outcome.is_error();
                context.bimi = Some(outcome);
                ok
            }
        }
    }
}

/// Folds a collaborator result into the transaction: classified ledger
/// entries and trailer fragments for a verdict, an `err` entry for a fault.
pub(crate) fn settle<V: Classifiable>(
    transaction: &mut Transaction,
    stage: Stage,
    result: VerifyResult<V>,
) -> StageOutcome<V> {
    match result {
        Ok(verdict) => {
            for (result, domain) in verdict.outcomes() {
                info!(
                    transaction = %transaction.id,
                    stage = %stage,
                    result = %result,
                    domain = domain.unwrap_or_default(),
                    "Verification verdict"
                );
                record_verdict(&mut transaction.results, LEDGER_OWNER, stage, result, domain);
            }
            for fragment in verdict.diagnostics() {
                transaction.auth_results.merge(Some(fragment));
            }
            StageOutcome::Verdict(verdict)
        }
        Err(error) => {
            warn!(
                transaction = %transaction.id,
                stage = %stage,
                error = %error,
                "Verification stage failed"
            );
            record_fault(&mut transaction.results, LEDGER_OWNER, stage);
            StageOutcome::Error(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        testing::{self, FakeBackend},
        AuthResult, Classification, Config, ConfigStore, DmarcPolicy, LedgerEntry, VerifyError,
    };

    const SIGNED: &str = "From: Alice <alice@example.com>\r\nDKIM-Signature: v=1; d=example.com; s=sel\r\nSubject: Hi\r\n\r\nBody\r\n";

    fn pipeline(backend: Arc<FakeBackend>) -> AuthPipeline {
        AuthPipeline::new(
            testing::verifiers(backend),
            Arc::new(ConfigStore::default()),
        )
    }

    fn transaction(raw: &str) -> Transaction {
        let mut transaction = Transaction::new("alice@example.com");
        transaction.attach_message(raw.to_string());
        transaction
    }

    #[test]
    fn test_advance_follows_guards() {
        let mut context = TransactionAuthContext::new("a@example.com");
        assert_eq!(
            PipelineState::Init.advance(&context),
            PipelineState::Attempted(Stage::Dkim)
        );
        assert_eq!(
            PipelineState::Attempted(Stage::Dkim).advance(&context),
            PipelineState::Done
        );

        context.dkim = Some(StageOutcome::Verdict(testing::dkim_verdict(
            Some("example.com"),
            true,
        )));
        assert_eq!(
            PipelineState::Attempted(Stage::Dkim).advance(&context),
            PipelineState::Attempted(Stage::Arc)
        );
        assert_eq!(
            PipelineState::Attempted(Stage::Arc).advance(&context),
            PipelineState::Attempted(Stage::Dmarc)
        );
        assert_eq!(
            PipelineState::Attempted(Stage::Dmarc).advance(&context),
            PipelineState::Done
        );

        context.dmarc = Some(StageOutcome::Verdict(testing::dmarc_verdict(
            AuthResult::Fail,
            "example.com",
        )));
        assert_eq!(
            PipelineState::Attempted(Stage::Dmarc).advance(&context),
            PipelineState::Attempted(Stage::Bimi)
        );
        assert_eq!(
            PipelineState::Attempted(Stage::Bimi).advance(&context),
            PipelineState::Done
        );
        assert_eq!(PipelineState::Done.advance(&context), PipelineState::Done);
    }

    #[test]
    fn test_bimi_guard_rejects_dmarc_fault() {
        let mut context = TransactionAuthContext::new("a@example.com");
        context.dmarc = Some(StageOutcome::Error(VerifyError::Internal("x".to_string())));
        assert!(!guard(Stage::Bimi, &context));
    }

    #[tokio::test]
    async fn test_full_chain_runs_in_order() {
        let backend = Arc::new(FakeBackend::passing("example.com"));
        let mut transaction = transaction(SIGNED);

        let report = pipeline(backend.clone()).run_post_body(&mut transaction).await;

        assert_eq!(
            report.attempted,
            vec![Stage::Dkim, Stage::Arc, Stage::Dmarc, Stage::Bimi]
        );
        assert_eq!(report.faults, 0);
        assert_eq!(
            backend.calls(),
            vec![Stage::Dkim, Stage::Arc, Stage::Dmarc, Stage::Bimi]
        );
        assert_eq!(
            transaction.results.labels(Classification::Pass),
            vec!["dkim[example.com]", "arc[example.com]", "dmarc[example.com]", "bimi[example.com]"]
        );
    }

    #[tokio::test]
    async fn test_unsealed_message_skips_only_arc() {
        let backend = Arc::new(
            FakeBackend::passing("example.com")
                .with_dkim(Ok(testing::dkim_verdict(Some("example.com"), false))),
        );
        let mut transaction = transaction(SIGNED);

        let report = pipeline(backend.clone()).run_post_body(&mut transaction).await;

        assert_eq!(report.attempted, vec![Stage::Dkim, Stage::Dmarc, Stage::Bimi]);
        assert!(!backend.calls().contains(&Stage::Arc));
        let context = transaction.auth.as_ref().unwrap();
        assert!(context.arc.is_none());
        assert_eq!(backend.last_dmarc_call().unwrap().arc_result, None);
        assert!(transaction.results.entries().iter().all(|(_, entry)| {
            !matches!(entry, LedgerEntry::Classified { label, .. } if label.starts_with("arc["))
        }));
        assert_eq!(
            transaction.results.labels(Classification::Pass),
            vec!["dkim[example.com]", "dmarc[example.com]", "bimi[example.com]"]
        );
    }

    #[tokio::test]
    async fn test_dkim_fault_skips_dependents() {
        let backend = Arc::new(
            FakeBackend::passing("example.com")
                .with_dkim(Err(VerifyError::Malformed("bad signature".to_string()))),
        );
        let mut transaction = transaction(SIGNED);

        let report = pipeline(backend.clone()).run_post_body(&mut transaction).await;

        assert_eq!(report.attempted, vec![Stage::Dkim]);
        assert_eq!(report.faults, 1);
        assert_eq!(backend.calls(), vec![Stage::Dkim]);
        assert_eq!(transaction.results.errors(), vec!["dkim"]);
        assert_eq!(transaction.results.len(), 1);

        let context = transaction.auth.as_ref().unwrap();
        assert!(context.dkim.as_ref().unwrap().is_error());
        assert!(context.arc.is_none());
        assert!(context.dmarc.is_none());
        assert!(context.bimi.is_none());
    }

    #[tokio::test]
    async fn test_all_stage_faults_still_complete() {
        let backend = Arc::new(
            FakeBackend::passing("example.com")
                .with_arc(Err(VerifyError::Dns("SERVFAIL".to_string())))
                .with_dmarc_verdict(Err(VerifyError::Internal("boom".to_string()))),
        );
        let mut transaction = transaction(SIGNED);

        let report = pipeline(backend.clone()).run_post_body(&mut transaction).await;

        // DMARC faulted, so BIMI has no verdict to consume
        assert_eq!(report.attempted, vec![Stage::Dkim, Stage::Arc, Stage::Dmarc]);
        assert_eq!(report.faults, 2);
        assert_eq!(transaction.results.errors(), vec!["arc", "dmarc"]);
        assert_eq!(transaction.results.labels(Classification::Pass), vec!["dkim[example.com]"]);
    }

    #[tokio::test]
    async fn test_missing_header_from_skips_dmarc_and_bimi() {
        let mut dkim = testing::dkim_verdict(None, false);
        dkim.signatures.clear();
        let backend = Arc::new(FakeBackend::passing("example.com").with_dkim(Ok(dkim)));
        let mut transaction = transaction("Subject: no from\r\n\r\nBody");

        let report = pipeline(backend.clone()).run_post_body(&mut transaction).await;

        assert_eq!(report.attempted, vec![Stage::Dkim]);
        assert!(transaction.results.is_empty());
    }

    #[tokio::test]
    async fn test_failing_dmarc_verdict_still_runs_bimi() {
        let backend = Arc::new(FakeBackend::passing("example.com").with_dmarc_verdict(Ok(
            testing::dmarc_verdict(AuthResult::Fail, "example.com"),
        )));
        let mut transaction = transaction(SIGNED);

        let report = pipeline(backend.clone()).run_post_body(&mut transaction).await;

        assert_eq!(report.attempted.last(), Some(&Stage::Bimi));
        assert_eq!(transaction.results.labels(Classification::Fail), vec!["dmarc[example.com]"]);
    }

    #[tokio::test]
    async fn test_dmarc_receives_threaded_inputs() {
        let backend = Arc::new(FakeBackend::passing("example.com"));
        let mut transaction = transaction(SIGNED);
        let mut context = TransactionAuthContext::new("alice@example.com");
        context.spf = Some(StageOutcome::Verdict(testing::spf_verdict(
            AuthResult::Pass,
            "example.com",
        )));
        transaction.auth = Some(context);

        pipeline(backend.clone()).run_post_body(&mut transaction).await;

        let call = backend.last_dmarc_call().unwrap();
        assert_eq!(call.header_from, "example.com");
        assert_eq!(call.spf_domain.as_deref(), Some("example.com"));
        assert_eq!(call.dkim_domains, vec!["example.com".to_string()]);
        assert_eq!(call.arc_result, Some(AuthResult::Pass));
    }

    #[tokio::test]
    async fn test_spf_softfail_not_passed_to_dmarc() {
        let backend = Arc::new(FakeBackend::passing("example.com"));
        let mut transaction = transaction(SIGNED);
        let mut context = TransactionAuthContext::new("alice@example.com");
        context.spf = Some(StageOutcome::Verdict(testing::spf_verdict(
            AuthResult::SoftFail,
            "example.com",
        )));
        transaction.auth = Some(context);

        pipeline(backend.clone()).run_post_body(&mut transaction).await;

        assert_eq!(backend.last_dmarc_call().unwrap().spf_domain, None);
    }

    #[tokio::test]
    async fn test_bimi_headers_removed_after_pipeline() {
        let raw = "From: alice@example.com\r\nBIMI-Location: v=BIMI1; l=https://spoof.example/a.svg\r\nBIMI-Indicator: PHN2Zz4=\r\n\r\nBody";

        for dkim in [
            Ok(testing::dkim_verdict(Some("example.com"), false)),
            Err(VerifyError::Malformed("bad".to_string())),
        ] {
            let backend = Arc::new(FakeBackend::passing("example.com").with_dkim(dkim));
            let mut transaction = transaction(raw);

            pipeline(backend).run_post_body(&mut transaction).await;

            let message = transaction.message().unwrap();
            assert!(!message.has_header("bimi-location"));
            assert!(!message.has_header("bimi-indicator"));
            assert!(message.has_header("from"));
        }
    }

    #[tokio::test]
    async fn test_bimi_fault_recorded_and_headers_removed() {
        let backend = Arc::new(
            FakeBackend::passing("example.com")
                .with_bimi(Err(VerifyError::Dns("timeout".to_string()))),
        );
        let mut transaction =
            transaction("From: alice@example.com\r\nBIMI-Location: spoof\r\n\r\nBody");

        let report = pipeline(backend).run_post_body(&mut transaction).await;

        assert_eq!(report.faults, 1);
        assert_eq!(transaction.results.errors(), vec!["bimi"]);
        assert!(!transaction.message().unwrap().has_header("bimi-location"));
    }

    #[tokio::test]
    async fn test_dkim_receives_crlf_message_and_policy() {
        let backend = Arc::new(FakeBackend::passing("example.com"));
        let mut transaction = transaction("From: alice@example.com\nSubject: x\n\nBody\n");
        let mut config = Config::default();
        config.auth.min_bit_length = 2048;
        let pipeline = AuthPipeline::new(
            testing::verifiers(backend.clone()),
            Arc::new(ConfigStore::new(config)),
        );

        pipeline.run_post_body(&mut transaction).await;

        let call = backend.last_dkim_call().unwrap();
        assert_eq!(call.message, b"From: alice@example.com\r\nSubject: x\r\n\r\nBody\r\n".to_vec());
        assert_eq!(call.sender, "alice@example.com");
        assert_eq!(call.min_key_bits, 2048);
    }

    #[tokio::test]
    async fn test_stage_timeout_recorded_as_fault() {
        let backend = Arc::new(
            FakeBackend::passing("example.com").with_dmarc_delay(Duration::from_secs(5)),
        );
        let mut config = Config::default();
        config.auth.stage_timeout_secs = Some(1);
        let pipeline = AuthPipeline::new(
            testing::verifiers(backend),
            Arc::new(ConfigStore::new(config)),
        );
        let mut transaction = transaction(SIGNED);

        let report = pipeline.run_post_body(&mut transaction).await;

        assert_eq!(report.faults, 1);
        let context = transaction.auth.as_ref().unwrap();
        assert_eq!(
            context.dmarc.as_ref().unwrap().error(),
            Some(&VerifyError::Timeout(Duration::from_secs(1)))
        );
        assert!(context.bimi.is_none());
        assert_eq!(transaction.results.errors(), vec!["dmarc"]);
    }

    #[tokio::test]
    async fn test_trailer_collects_fragments() {
        let backend = Arc::new(FakeBackend::passing("example.com"));
        let mut transaction = transaction(SIGNED);

        pipeline(backend).run_post_body(&mut transaction).await;

        assert_eq!(
            transaction.auth_results.fragments(),
            &[
                "dkim=pass header.d=example.com".to_string(),
                "arc=pass".to_string(),
                "dmarc=pass header.from=example.com".to_string(),
                "bimi=pass header.d=example.com".to_string(),
            ]
        );
        let context = transaction.auth.as_ref().unwrap();
        assert_eq!(context.dmarc_verdict().unwrap().policy, DmarcPolicy::None);
    }
}
