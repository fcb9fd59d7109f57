//! Per-session intelligence graph.
//!
//! The graph accumulates typed artifacts extracted from scammer messages.
//! It only ever grows: artifacts are merged by normalized value and never
//! removed, so snapshots taken at finalization are supersets of every
//! earlier snapshot.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::ExtractedIntelligence;

/// The artifact kinds tracked per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IntelKind {
    BankAccount,
    IfscCode,
    UpiId,
    PhoneNumber,
    Link,
    EmailAddress,
    SuspiciousKeyword,
}

impl IntelKind {
    /// Extraction priority ladder for reply targeting: account first,
    /// phone last.
    pub const LADDER: [IntelKind; 5] = [
        IntelKind::BankAccount,
        IntelKind::IfscCode,
        IntelKind::UpiId,
        IntelKind::Link,
        IntelKind::PhoneNumber,
    ];

    /// Human noun used in templates and reply validation.
    pub fn noun(self) -> &'static str {
        match self {
            IntelKind::BankAccount => "account",
            IntelKind::IfscCode => "IFSC",
            IntelKind::UpiId => "UPI",
            IntelKind::PhoneNumber => "number",
            IntelKind::Link => "link",
            IntelKind::EmailAddress => "email",
            IntelKind::SuspiciousKeyword => "keyword",
        }
    }

    /// Kinds that appear in the callback report (everything except the
    /// detector's lexicon hits).
    pub fn is_reportable(self) -> bool {
        !matches!(self, IntelKind::SuspiciousKeyword)
    }
}

/// One extracted value with provenance.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub value: String,
    pub first_seen_turn: u32,
    /// Extraction layers that produced this value ("pattern", "llm", "stitch").
    pub sources: Vec<String>,
    pub confidence: f32,
}

/// Ordered-unique collection of artifacts per kind.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IntelGraph {
    entries: BTreeMap<IntelKind, Vec<Artifact>>,
}

impl IntelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one extracted value. Returns true when the value was new for
    /// its kind; duplicates (case-insensitive on the normalized value) are
    /// folded into the existing artifact, keeping the max confidence.
    pub fn insert(
        &mut self,
        kind: IntelKind,
        value: &str,
        turn: u32,
        source: &str,
        confidence: f32,
    ) -> bool {
        let slot = self.entries.entry(kind).or_default();
        if let Some(existing) = slot
            .iter_mut()
            .find(|a| a.value.eq_ignore_ascii_case(value))
        {
            if existing.confidence < confidence {
                existing.confidence = confidence;
            }
            if !existing.sources.iter().any(|s| s == source) {
                existing.sources.push(source.to_string());
            }
            return false;
        }
        slot.push(Artifact {
            value: value.to_string(),
            first_seen_turn: turn,
            sources: vec![source.to_string()],
            confidence,
        });
        true
    }

    pub fn has(&self, kind: IntelKind) -> bool {
        self.entries.get(&kind).is_some_and(|v| !v.is_empty())
    }

    pub fn count(&self, kind: IntelKind) -> usize {
        self.entries.get(&kind).map_or(0, Vec::len)
    }

    pub fn values(&self, kind: IntelKind) -> Vec<&str> {
        self.entries
            .get(&kind)
            .map(|v| v.iter().map(|a| a.value.as_str()).collect())
            .unwrap_or_default()
    }

    /// First kind of the priority ladder with no hits yet.
    pub fn first_missing(&self) -> Option<IntelKind> {
        IntelKind::LADDER.into_iter().find(|k| !self.has(*k))
    }

    /// Number of reportable kinds with at least one hit (termination
    /// criterion A counts these, not keyword hits).
    pub fn reportable_kinds_with_hits(&self) -> usize {
        self.entries
            .iter()
            .filter(|(k, v)| k.is_reportable() && !v.is_empty())
            .count()
    }

    pub fn total_artifacts(&self) -> usize {
        self.entries
            .iter()
            .filter(|(k, _)| k.is_reportable())
            .map(|(_, v)| v.len())
            .sum()
    }

    /// Flatten into the callback report shape.
    pub fn to_report(&self) -> ExtractedIntelligence {
        let collect = |kind: IntelKind| -> Vec<String> {
            self.values(kind).into_iter().map(str::to_string).collect()
        };
        ExtractedIntelligence {
            phone_numbers: collect(IntelKind::PhoneNumber),
            bank_accounts: collect(IntelKind::BankAccount),
            upi_ids: collect(IntelKind::UpiId),
            ifsc_codes: collect(IntelKind::IfscCode),
            phishing_links: collect(IntelKind::Link),
            email_addresses: collect(IntelKind::EmailAddress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_new_vs_duplicate() {
        let mut graph = IntelGraph::new();
        assert!(graph.insert(IntelKind::UpiId, "pay@paytm", 1, "pattern", 1.0));
        assert!(!graph.insert(IntelKind::UpiId, "PAY@PAYTM", 2, "llm", 0.9));
        assert_eq!(graph.count(IntelKind::UpiId), 1);
    }

    #[test]
    fn duplicate_merge_keeps_max_confidence_and_first_turn() {
        let mut graph = IntelGraph::new();
        graph.insert(IntelKind::BankAccount, "123456789", 3, "llm", 0.9);
        graph.insert(IntelKind::BankAccount, "123456789", 5, "pattern", 1.0);
        let values = graph.values(IntelKind::BankAccount);
        assert_eq!(values, vec!["123456789"]);
        let artifact = &graph.entries[&IntelKind::BankAccount][0];
        assert_eq!(artifact.first_seen_turn, 3);
        assert!((artifact.confidence - 1.0).abs() < f32::EPSILON);
        assert_eq!(artifact.sources, vec!["llm", "pattern"]);
    }

    #[test]
    fn ladder_walks_account_first() {
        let mut graph = IntelGraph::new();
        assert_eq!(graph.first_missing(), Some(IntelKind::BankAccount));
        graph.insert(IntelKind::BankAccount, "123456789012", 1, "pattern", 1.0);
        assert_eq!(graph.first_missing(), Some(IntelKind::IfscCode));
        graph.insert(IntelKind::IfscCode, "SBIN0001234", 1, "pattern", 1.0);
        graph.insert(IntelKind::UpiId, "a@ybl", 1, "pattern", 1.0);
        graph.insert(IntelKind::Link, "https://x.tk", 1, "pattern", 1.0);
        graph.insert(IntelKind::PhoneNumber, "+919876543210", 1, "pattern", 1.0);
        assert_eq!(graph.first_missing(), None);
    }

    #[test]
    fn keyword_hits_do_not_count_toward_kind_totals() {
        let mut graph = IntelGraph::new();
        graph.insert(IntelKind::SuspiciousKeyword, "urgent", 1, "detector", 1.0);
        graph.insert(IntelKind::Link, "https://bit.ly/x", 1, "pattern", 1.0);
        assert_eq!(graph.reportable_kinds_with_hits(), 1);
        assert_eq!(graph.total_artifacts(), 1);
    }

    #[test]
    fn report_shape_covers_all_six_kinds() {
        let mut graph = IntelGraph::new();
        graph.insert(IntelKind::PhoneNumber, "+919876543210", 1, "pattern", 1.0);
        graph.insert(IntelKind::EmailAddress, "a@b.com", 2, "pattern", 1.0);
        let report = graph.to_report();
        assert_eq!(report.phone_numbers, vec!["+919876543210"]);
        assert_eq!(report.email_addresses, vec!["a@b.com"]);
        assert!(report.bank_accounts.is_empty());
    }
}
