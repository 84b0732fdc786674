use tracing::debug;

use crate::{
    attempt, insert_spf_header, pipeline::settle, AuthPipeline, ConnectionState, Stage,
    StageOutcome, SpfRequest, TransactionAuthContext,
};

impl AuthPipeline {
    /// Evaluates SPF for the transaction just opened by MAIL FROM.
    ///
    /// Creates the transaction's auth context, records the verdict (or
    /// fault) and adds the `Received-SPF` header when the verdict carries
    /// one. Does nothing when no transaction is open.
    pub async fn run_spf_stage(&self, connection: &mut ConnectionState) {
        let helo = connection.announced_hostname().unwrap_or_default().to_string();
        let client_ip = connection.remote_ip;
        let receiving_host = connection.local_host.clone();
        let Some(transaction) = connection.transaction.as_mut() else {
            debug!(connection = %connection.id, "No transaction open, SPF skipped");
            return;
        };

        let snapshot = self.config.snapshot();
        let auth = &snapshot.config.auth;
        let sender = transaction.sender().to_string();

        let result = attempt(
            auth.stage_timeout(),
            self.verifiers.spf.check_spf(SpfRequest {
                resolver: &*self.verifiers.resolver,
                client_ip,
                helo: &helo,
                sender: &sender,
                receiving_host: &receiving_host,
                max_lookups: auth.dns.max_lookups,
            }),
        )
        .await;

        let outcome = settle(transaction, Stage::Spf, result);
        if let StageOutcome::Verdict(verdict) = &outcome {
            if let Some(header) = verdict.header.as_deref() {
                insert_spf_header(transaction, header);
            }
        }

        let mut context = TransactionAuthContext::new(&sender);
        context.spf = Some(outcome);
        transaction.auth = Some(context);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Arc,
    };

    use crate::{
        testing::{self, FakeBackend},
        AuthResult, Classification, Config, ConfigStore, SpfVerdict, VerifyError,
    };

    use super::*;

    fn connection() -> ConnectionState {
        let mut connection =
            ConnectionState::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), "mx.local");
        connection.on_greeting("client.example");
        connection
    }

    #[tokio::test]
    async fn test_spf_pass_records_and_adds_header() {
        let backend = Arc::new(FakeBackend::passing("example.com"));
        let pipeline = AuthPipeline::new(
            testing::verifiers(backend.clone()),
            Arc::new(ConfigStore::default()),
        );
        let mut connection = connection();
        connection.begin_transaction("alice@example.com");

        pipeline.run_spf_stage(&mut connection).await;

        let transaction = connection.transaction.as_mut().unwrap();
        assert_eq!(
            transaction.results.labels(Classification::Pass),
            vec!["spf[example.com]"]
        );
        assert_eq!(
            transaction.leading_headers()[0],
            (
                "Received-SPF".to_string(),
                "pass (mx.local: domain of alice@example.com designates 192.0.2.1 as permitted sender)".to_string()
            )
        );
        assert_eq!(transaction.auth.as_ref().unwrap().sender(), "alice@example.com");
        assert!(transaction.auth.as_ref().unwrap().spf_verdict().is_some());

        let call = backend.last_spf_call().unwrap();
        assert_eq!(call.helo, "client.example");
        assert_eq!(call.client_ip, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(call.receiving_host, "mx.local");
        assert_eq!(call.max_lookups, 10);
    }

    #[tokio::test]
    async fn test_spf_without_transaction_is_noop() {
        let backend = Arc::new(FakeBackend::passing("example.com"));
        let pipeline = AuthPipeline::new(
            testing::verifiers(backend.clone()),
            Arc::new(ConfigStore::default()),
        );
        let mut connection = connection();

        pipeline.run_spf_stage(&mut connection).await;

        assert!(connection.transaction.is_none());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_spf_fault_recorded_without_header() {
        let backend = Arc::new(
            FakeBackend::passing("example.com")
                .with_spf(Err(VerifyError::Dns("SERVFAIL".to_string()))),
        );
        let pipeline = AuthPipeline::new(
            testing::verifiers(backend),
            Arc::new(ConfigStore::default()),
        );
        let mut connection = connection();
        connection.begin_transaction("alice@example.com");

        pipeline.run_spf_stage(&mut connection).await;

        let transaction = connection.transaction.as_ref().unwrap();
        assert_eq!(transaction.results.errors(), vec!["spf"]);
        assert!(transaction.leading_headers().is_empty());
        assert!(transaction.auth.as_ref().unwrap().spf.as_ref().unwrap().is_error());
    }

    #[tokio::test]
    async fn test_spf_softfail_adds_header_without_entry() {
        let backend = Arc::new(FakeBackend::passing("example.com").with_spf(Ok(SpfVerdict {
            result: AuthResult::SoftFail,
            domain: Some("example.com".to_string()),
            header: Some("Received-SPF: softfail (mx.local)".to_string()),
            info: Some("spf=softfail smtp.mailfrom=example.com".to_string()),
        })));
        let pipeline = AuthPipeline::new(
            testing::verifiers(backend),
            Arc::new(ConfigStore::default()),
        );
        let mut connection = connection();
        connection.begin_transaction("alice@example.com");

        pipeline.run_spf_stage(&mut connection).await;

        let transaction = connection.transaction.as_ref().unwrap();
        assert!(transaction.results.is_empty());
        assert_eq!(transaction.leading_headers()[0].1, "softfail (mx.local)");
        assert_eq!(
            transaction.auth_results.fragments(),
            &["spf=softfail smtp.mailfrom=example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_spf_uses_reloaded_lookup_limit() {
        let backend = Arc::new(FakeBackend::passing("example.com"));
        let store = Arc::new(ConfigStore::default());
        let pipeline = AuthPipeline::new(testing::verifiers(backend.clone()), store.clone());

        let mut config = Config::default();
        config.auth.dns.max_lookups = 2;
        store.replace(config);

        let mut connection = connection();
        connection.begin_transaction("alice@example.com");
        pipeline.run_spf_stage(&mut connection).await;

        assert_eq!(backend.last_spf_call().unwrap().max_lookups, 2);
    }
}
