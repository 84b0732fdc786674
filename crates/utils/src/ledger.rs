//! Transaction-scoped result ledger and the verdict classifier.
//!
//! Every stage outcome is folded into the ledger through [`record_verdict`]
//! or [`record_fault`]. Downstream disposition logic reads the ledger once
//! the pipeline completes, this module never acts on it.

use std::fmt::Display;

use crate::{AuthResult, Stage};

/// Owner under which the authentication stages record their entries.
pub const LEDGER_OWNER: &str = "origin_auth";

/// Normalized outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Pass,
    Fail,
    Skip,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Pass => "pass",
            Classification::Fail => "fail",
            Classification::Skip => "skip",
        }
    }
}

/// One ledger record, either a classified label such as `spf[example.com]`
/// or the name of a check whose collaborator faulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEntry {
    Classified {
        classification: Classification,
        label: String,
    },
    Err {
        check: String,
    },
}

impl Display for LedgerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerEntry::Classified {
                classification,
                label,
            } => write!(f, "{}: {label}", classification.as_str()),
            LedgerEntry::Err { check } => write!(f, "err: {check}"),
        }
    }
}

/// Append-only ledger keyed by the owning component.
#[derive(Debug, Clone, Default)]
pub struct ResultsLedger {
    entries: Vec<(String, LedgerEntry)>,
}

impl ResultsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, owner: &str, entry: LedgerEntry) {
        self.entries.push((owner.to_string(), entry));
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> &[(String, LedgerEntry)] {
        &self.entries
    }

    /// Entries recorded by `owner`, in insertion order.
    pub fn for_owner<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a LedgerEntry> + 'a {
        self.entries
            .iter()
            .filter(move |(o, _)| o == owner)
            .map(|(_, entry)| entry)
    }

    /// Labels recorded under `classification`.
    pub fn labels(&self, classification: Classification) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|(_, entry)| match entry {
                LedgerEntry::Classified {
                    classification: c,
                    label,
                } if *c == classification => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Names of the checks recorded under `err`.
    pub fn errors(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|(_, entry)| match entry {
                LedgerEntry::Err { check } => Some(check.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Maps a protocol verdict onto the ledger classification.
///
/// Total and pure: `none` and any value outside the mapping (including
/// `softfail`) yield no entry.
pub fn classify(result: &AuthResult) -> Option<Classification> {
    match result {
        AuthResult::Pass => Some(Classification::Pass),
        AuthResult::Fail | AuthResult::PermError | AuthResult::TempError => {
            Some(Classification::Fail)
        }
        AuthResult::Neutral | AuthResult::Policy => Some(Classification::Skip),
        _ => None,
    }
}

/// Builds the `<check>[<domain>]` label, the domain segment may be empty.
pub fn ledger_label(stage: Stage, domain: Option<&str>) -> String {
    format!("{}[{}]", stage.name(), domain.unwrap_or_default())
}

/// Classifies a verdict and records it, returning the entry when one was
/// added.
pub fn record_verdict(
    ledger: &mut ResultsLedger,
    owner: &str,
    stage: Stage,
    result: &AuthResult,
    domain: Option<&str>,
) -> Option<LedgerEntry> {
    let classification = classify(result)?;
    let entry = LedgerEntry::Classified {
        classification,
        label: ledger_label(stage, domain),
    };
    ledger.add(owner, entry.clone());
    Some(entry)
}

/// Records a collaborator fault for `stage` under the `err` bucket.
pub fn record_fault(ledger: &mut ResultsLedger, owner: &str, stage: Stage) {
    ledger.add(
        owner,
        LedgerEntry::Err {
            check: stage.name().to_string(),
        },
    );
}
