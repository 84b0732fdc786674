pub mod auth_results;
pub mod config;
pub mod connection;
pub mod context;
pub mod hooks;
pub mod ledger;
pub mod message;
pub mod mime;
pub mod pipeline;
pub mod plugin;
pub mod rewriter;
pub mod stage;
pub mod verdict;
pub mod verifier;
pub mod verifiers;

mod spf;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use auth_results::*;
pub use config::*;
pub use connection::*;
pub use context::*;
pub use hooks::*;
pub use ledger::*;
pub use message::*;
pub use mime::*;
pub use pipeline::*;
pub use plugin::*;
pub use rewriter::*;
pub use stage::*;
pub use verdict::*;
pub use verifier::*;
