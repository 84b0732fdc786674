//! Hook handler wiring the authentication stages into the SMTP host.

use tracing::debug;

use crate::{
    AuthPipeline, ConnectionState, Continuation, HookEvent, HookFuture, HookHandler, HookName,
    LEDGER_OWNER,
};

/// Registers for the greeting, sender and body hooks and runs the matching
/// stage, handing control back to the host when done.
pub struct OriginAuth {
    pipeline: AuthPipeline,
}

impl OriginAuth {
    const HOOKS: [HookName; 3] = [
        HookName::Greeting,
        HookName::SenderDeclared,
        HookName::BodyReceived,
    ];

    pub fn new(pipeline: AuthPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &AuthPipeline {
        &self.pipeline
    }

    async fn on_body(&self, connection: &mut ConnectionState) {
        let Some(transaction) = connection.transaction.as_mut() else {
            return;
        };
        if transaction.message().is_none() {
            debug!(transaction = %transaction.id, "No message attached, post-body stages skipped");
            return;
        }
        self.pipeline.run_post_body(transaction).await;
    }
}

impl HookHandler for OriginAuth {
    fn call<'a>(
        &'a self,
        next: Continuation,
        connection: &'a mut ConnectionState,
        event: &'a HookEvent,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            match event {
                HookEvent::Greeting { hostname } => connection.on_greeting(hostname),
                HookEvent::SenderDeclared { .. } => self.pipeline.run_spf_stage(connection).await,
                HookEvent::BodyReceived => self.on_body(connection).await,
            }
            next.resume();
        })
    }

    fn hooks(&self) -> &[HookName] {
        &Self::HOOKS
    }

    fn name(&self) -> &str {
        LEDGER_OWNER
    }
}
