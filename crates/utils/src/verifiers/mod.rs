//! Built-in verification collaborators.
//!
//! SPF, DMARC and BIMI are evaluated in-house over the shared
//! [`DnsResolver`](crate::DnsResolver), which also serves the key size
//! checks. DKIM and ARC signatures are verified by `mail-auth` and, like
//! the hickory-backed resolver, are feature-gated behind `email-auth`.

pub mod bimi;
pub mod dmarc;
#[cfg(feature = "email-auth")]
pub mod dns;
pub mod keys;
#[cfg(feature = "email-auth")]
pub mod signatures;
pub mod spf;

pub use bimi::*;
pub use dmarc::*;
#[cfg(feature = "email-auth")]
pub use dns::*;
pub use keys::*;
#[cfg(feature = "email-auth")]
pub use signatures::*;
pub use spf::*;

#[cfg(feature = "email-auth")]
impl crate::Verifiers {
    /// Production collaborators using the system DNS configuration.
    pub fn system() -> crate::VerifyResult<Self> {
        use std::sync::Arc;

        let signatures = Arc::new(MailAuthVerifier::from_system_conf()?);
        Ok(Self {
            resolver: Arc::new(HickoryResolver::from_system_conf()),
            spf: Arc::new(SpfEvaluator),
            dkim: signatures.clone(),
            arc: signatures,
            dmarc: Arc::new(DmarcEvaluator),
            bimi: Arc::new(BimiEvaluator),
        })
    }
}
