use std::{fmt::Display, future::Future, time::Duration};

use crate::{VerifyError, VerifyResult};

/// The authentication checks, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Spf,
    Dkim,
    Arc,
    Dmarc,
    Bimi,
}

impl Stage {
    /// Stages run by the post-body orchestrator, in order.
    pub const POST_BODY: [Stage; 4] = [Stage::Dkim, Stage::Arc, Stage::Dmarc, Stage::Bimi];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Spf => "spf",
            Stage::Dkim => "dkim",
            Stage::Arc => "arc",
            Stage::Dmarc => "dmarc",
            Stage::Bimi => "bimi",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a stage left behind once it ran: a verdict or the fault that
/// prevented one. A stage that did not run leaves nothing (`None` in the
/// context).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome<V> {
    Verdict(V),
    Error(VerifyError),
}

impl<V> StageOutcome<V> {
    pub fn verdict(&self) -> Option<&V> {
        match self {
            StageOutcome::Verdict(verdict) => Some(verdict),
            StageOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&VerifyError> {
        match self {
            StageOutcome::Verdict(_) => None,
            StageOutcome::Error(error) => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StageOutcome::Error(_))
    }
}

impl<V> From<VerifyResult<V>> for StageOutcome<V> {
    fn from(result: VerifyResult<V>) -> Self {
        match result {
            Ok(verdict) => StageOutcome::Verdict(verdict),
            Err(error) => StageOutcome::Error(error),
        }
    }
}

/// Awaits a collaborator call, bounded by `deadline` when one is set.
/// Expiry is reported as [`VerifyError::Timeout`].
pub async fn attempt<V, F>(deadline: Option<Duration>, call: F) -> VerifyResult<V>
where
    F: Future<Output = VerifyResult<V>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(VerifyError::Timeout(limit))),
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Spf.to_string(), "spf");
        assert_eq!(
            Stage::POST_BODY.map(|stage| stage.name()),
            ["dkim", "arc", "dmarc", "bimi"]
        );
    }

    #[test]
    fn test_stage_outcome_from_result() {
        let outcome: StageOutcome<u8> = Ok(7).into();
        assert_eq!(outcome.verdict(), Some(&7));
        assert!(!outcome.is_error());

        let outcome: StageOutcome<u8> = Err(VerifyError::Internal("x".to_string())).into();
        assert!(outcome.verdict().is_none());
        assert!(outcome.is_error());
    }

    #[tokio::test]
    async fn test_attempt_without_deadline() {
        let result = attempt(None, async { Ok::<_, VerifyError>(1) }).await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn test_attempt_times_out() {
        let limit = Duration::from_millis(50);
        let result: VerifyResult<u8> = attempt(Some(limit), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        })
        .await;
        assert_eq!(result, Err(VerifyError::Timeout(limit)));
    }
}
