//! Two-layer intelligence extraction.
//!
//! Layer 1 is deterministic: regex candidates plus contextual validators.
//! Layer 2 is an optional LLM pass, gated by the extractor circuit breaker
//! and only consulted when Layer 1 came up empty on a suspicious message;
//! its findings run through the same validators and are capped below
//! pattern confidence so Layer 1 always supersedes on conflict.
//!
//! Extraction never fails: malformed input simply yields nothing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::detector;
use crate::intel::IntelKind;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::safety::{LlmModule, SafetyFabric};
use crate::types::{Message, Sender};

/// How far (in bytes) context tokens are searched around a candidate.
const CONTEXT_WINDOW: usize = 30;

/// Confidence assigned to LLM-assisted findings; always below Layer 1.
const ASSISTED_CONFIDENCE: f32 = 0.9;

/// One extracted artifact before it is merged into a session's graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub kind: IntelKind,
    pub value: String,
    pub confidence: f32,
    pub source: &'static str,
}

impl Extraction {
    fn pattern(kind: IntelKind, value: String) -> Self {
        Self {
            kind,
            value,
            confidence: 1.0,
            source: "pattern",
        }
    }
}

static IFSC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{4}0[A-Z0-9]{6}\b").expect("ifsc regex"));

/// Maximal digit runs, allowing grouping spaces/dots/dashes between digits.
static DIGIT_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9](?:[ .\-]*[0-9])*").expect("digit run regex"));

static UPI_TOKEN: Lazy<Regex> = Lazy::new(|| {
    // Provider may not end in punctuation, so "me@paytm." keeps its handle.
    Regex::new(r"[A-Za-z0-9][A-Za-z0-9._\-]*@[A-Za-z](?:[A-Za-z0-9.\-]*[A-Za-z0-9])?")
        .expect("upi regex")
});

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email regex")
});

static FULL_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)https?://[^\s<>"']+"#).expect("full url regex"));

static WWW_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)www\.[a-z0-9\-]+(?:\.[a-z0-9\-]+)+(?:/\S*)?").expect("www regex"));

/// Shorteners are accepted with or without a scheme, no context needed.
static SHORTENER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:bit\.ly|tinyurl\.com|goo\.gl|t\.co|t\.me|wa\.me)/\S+")
        .expect("shortener regex")
});

/// Bare domains only count with a navigation verb in the message.
static BARE_DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)[a-z0-9][a-z0-9\-]*(?:\.[a-z0-9\-]+)*\.(?:com|net|org|in|co|info|biz|xyz|online|site|tk|ml|ga|cf|gq)(?:/\S*)?",
    )
    .expect("bare domain regex")
});

static NAV_VERB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:click|visit|go\s*to|open|browse)\b").expect("nav verb regex")
});

static ACCOUNT_CONTEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:account|acct\b|a/c)").expect("account context regex"));

static PHONE_CUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:phone|mobile|call|whatsapp|contact\s+(?:no|number))").expect("phone cue")
});

/// A prior turn ending in a labelled prefix like "Account Number:" makes the
/// next bare digit run a bank account (cross-turn stitching).
static STITCH_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:account|a/?c)\s*(?:number|no|num|#)?\s*(?:is)?\s*[:\-]\s*$")
        .expect("stitch label regex")
});

const UPI_PROVIDERS: &[&str] = &[
    "paytm",
    "phonepe",
    "gpay",
    "googlepay",
    "amazonpay",
    "bhim",
    "upi",
    "ybl",
    "ibl",
    "axl",
    "apl",
    "okaxis",
    "oksbi",
    "okhdfcbank",
    "okicici",
    "axisbank",
    "sbi",
    "hdfcbank",
    "icici",
    "pnb",
    "yesbank",
    "freecharge",
    "airtel",
];

#[derive(Debug, Default)]
pub struct IntelExtractor;

impl IntelExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Layer 1: deterministic extraction. `context` is the recent history
    /// window used only for cross-turn stitching.
    pub fn extract(&self, text: &str, context: &[Message]) -> Vec<Extraction> {
        let mut found = Vec::new();

        for m in IFSC.find_iter(text) {
            found.push(Extraction::pattern(IntelKind::IfscCode, m.as_str().to_string()));
        }

        self.extract_digit_runs(text, &mut found);
        self.extract_upi_and_email(text, &mut found);
        self.extract_links(text, &mut found);

        if let Some(stitched) = self.stitch_bank_account(text, context) {
            if !found
                .iter()
                .any(|e| e.kind == IntelKind::BankAccount && e.value == stitched)
            {
                found.push(Extraction {
                    kind: IntelKind::BankAccount,
                    value: stitched,
                    confidence: 1.0,
                    source: "stitch",
                });
            }
        }

        dedupe(&mut found);
        found
    }

    fn extract_digit_runs(&self, text: &str, found: &mut Vec<Extraction>) {
        let bytes = text.as_bytes();
        for m in DIGIT_RUN.find_iter(text) {
            // Reject runs glued to letters or digits (e.g. the tail of an
            // IFSC code) on either side.
            let before = text[..m.start()].chars().next_back();
            let after = text[m.end()..].chars().next();
            if before.is_some_and(|c| c.is_ascii_alphanumeric())
                || after.is_some_and(|c| c.is_ascii_alphanumeric())
            {
                continue;
            }

            let digits: String = m.as_str().chars().filter(char::is_ascii_digit).collect();
            let window = context_window(text, m.start(), m.end());

            // Dots group phone digits, not account digits; a dotted run is
            // never an account candidate.
            if !m.as_str().contains('.') {
                if let Some(account) = validate_bank_account(&digits, window) {
                    found.push(Extraction::pattern(IntelKind::BankAccount, account));
                }
            }

            let plus_prefixed = m.start() > 0 && bytes[m.start() - 1] == b'+';
            if let Some(phone) = validate_phone(&digits, window, plus_prefixed) {
                found.push(Extraction::pattern(IntelKind::PhoneNumber, phone));
            }
        }
    }

    fn extract_upi_and_email(&self, text: &str, found: &mut Vec<Extraction>) {
        let mut upi_spans: Vec<(usize, usize)> = Vec::new();

        for m in UPI_TOKEN.find_iter(text) {
            let token = m.as_str();
            let Some((handle, provider)) = token.split_once('@') else {
                continue;
            };
            if handle.is_empty() || provider.is_empty() {
                continue;
            }
            let provider_lower = provider.to_lowercase();
            let allowlisted = UPI_PROVIDERS.contains(&provider_lower.as_str());
            // A generic (non-allowlisted) provider only counts when a "upi"
            // cue precedes the token and the provider is not a dotted
            // mail-style domain.
            let cue = {
                let mut from = m.start().saturating_sub(40);
                while !text.is_char_boundary(from) {
                    from -= 1;
                }
                text[from..m.start()].to_lowercase().contains("upi")
            };
            if allowlisted || (cue && !provider_lower.contains('.')) {
                upi_spans.push((m.start(), m.end()));
                found.push(Extraction::pattern(
                    IntelKind::UpiId,
                    token.to_lowercase(),
                ));
            }
        }

        for m in EMAIL.find_iter(text) {
            let claimed = upi_spans
                .iter()
                .any(|&(s, e)| m.start() < e && m.end() > s);
            if claimed {
                continue;
            }
            let value = m.as_str().to_lowercase();
            let (local, domain) = value.split_once('@').unwrap_or(("", ""));
            if !local.is_empty() && !domain.is_empty() {
                found.push(Extraction::pattern(IntelKind::EmailAddress, value));
            }
        }
    }

    fn extract_links(&self, text: &str, found: &mut Vec<Extraction>) {
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut push_link = |value: &str, start: usize, end: usize, spans: &mut Vec<(usize, usize)>, found: &mut Vec<Extraction>| {
            if spans.iter().any(|&(s, e)| start < e && end > s) {
                return;
            }
            let trimmed = value.trim_end_matches(['.', ',', ';', ':', '!', '?', ')', '"', '\'']);
            if host_of(trimmed).is_empty() {
                return;
            }
            spans.push((start, end));
            found.push(Extraction::pattern(IntelKind::Link, trimmed.to_string()));
        };

        for m in FULL_URL.find_iter(text) {
            push_link(m.as_str(), m.start(), m.end(), &mut spans, found);
        }
        for m in WWW_URL.find_iter(text) {
            push_link(m.as_str(), m.start(), m.end(), &mut spans, found);
        }
        for m in SHORTENER.find_iter(text) {
            push_link(m.as_str(), m.start(), m.end(), &mut spans, found);
        }

        // Bare domains need a navigation verb somewhere in the message, and
        // must not be the tail of an email/UPI token or an already-found URL.
        if NAV_VERB.is_match(text) {
            for m in BARE_DOMAIN.find_iter(text) {
                let before = text[..m.start()].chars().next_back();
                if before.is_some_and(|c| c.is_ascii_alphanumeric() || c == '@' || c == '.') {
                    continue;
                }
                push_link(m.as_str(), m.start(), m.end(), &mut spans, found);
            }
        }
    }

    fn stitch_bank_account(&self, text: &str, context: &[Message]) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '.')) {
            return None;
        }
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
        if !(9..=18).contains(&digits.len()) {
            return None;
        }
        let labelled = context
            .iter()
            .filter(|m| m.sender == Sender::Scammer)
            .any(|m| STITCH_LABEL.is_match(m.text.trim()));
        if labelled {
            debug!("stitched bare digit run onto a labelled account prefix");
            Some(digits)
        } else {
            None
        }
    }

    /// Layer 2: LLM-assisted extraction through the safety fabric. The
    /// session manager only calls this when Layer 1 found nothing on a
    /// suspicious message.
    pub async fn extract_assisted(
        &self,
        text: &str,
        fabric: &SafetyFabric,
        llm: &dyn LanguageModel,
    ) -> Vec<Extraction> {
        let prompt = format!(
            "Extract payment identifiers from the message below. Reply with JSON only, \
             using empty arrays when nothing matches:\n\
             {{\"bankAccounts\":[],\"ifscCodes\":[],\"upiIds\":[],\"phoneNumbers\":[],\
             \"links\":[],\"emailAddresses\":[]}}\n\nMessage: {text}"
        );
        let raw = fabric
            .safe_call(LlmModule::Extractor, None, || async {
                llm.complete(CompletionRequest::new(prompt)).await.map(Some)
            })
            .await;
        let Some(raw) = raw else {
            return Vec::new();
        };
        let Ok(batch) = serde_json::from_str::<AssistedBatch>(detector::json_body(&raw)) else {
            debug!("assisted extraction output did not parse; ignoring");
            return Vec::new();
        };
        batch.validated(text)
    }
}

/// Shape Layer 2 must return; values are re-validated before use.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssistedBatch {
    #[serde(default)]
    bank_accounts: Vec<String>,
    #[serde(default)]
    ifsc_codes: Vec<String>,
    #[serde(default)]
    upi_ids: Vec<String>,
    #[serde(default)]
    phone_numbers: Vec<String>,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    email_addresses: Vec<String>,
}

impl AssistedBatch {
    fn validated(self, original: &str) -> Vec<Extraction> {
        let mut out = Vec::new();
        let mut push = |kind: IntelKind, value: Option<String>| {
            if let Some(value) = value {
                out.push(Extraction {
                    kind,
                    value,
                    confidence: ASSISTED_CONFIDENCE,
                    source: "llm",
                });
            }
        };

        for v in &self.bank_accounts {
            let digits: String = v.chars().filter(char::is_ascii_digit).collect();
            push(IntelKind::BankAccount, validate_bank_account(&digits, original));
        }
        for v in &self.ifsc_codes {
            let v = v.trim().to_uppercase();
            push(IntelKind::IfscCode, IFSC.is_match(&v).then_some(v));
        }
        for v in &self.upi_ids {
            let v = v.trim().to_lowercase();
            let valid = v.split_once('@').is_some_and(|(h, p)| {
                !h.is_empty()
                    && !p.is_empty()
                    && (UPI_PROVIDERS.contains(&p) || !p.contains('.'))
            });
            push(IntelKind::UpiId, valid.then_some(v));
        }
        for v in &self.phone_numbers {
            let digits: String = v.chars().filter(char::is_ascii_digit).collect();
            push(
                IntelKind::PhoneNumber,
                validate_phone(&digits, original, v.trim_start().starts_with('+')),
            );
        }
        for v in &self.links {
            let v = v.trim();
            push(IntelKind::Link, (!host_of(v).is_empty()).then(|| v.to_string()));
        }
        for v in &self.email_addresses {
            let v = v.trim().to_lowercase();
            push(IntelKind::EmailAddress, EMAIL.is_match(&v).then_some(v));
        }
        dedupe(&mut out);
        out
    }
}

/// Bytes around a candidate, widened to char boundaries.
fn context_window(text: &str, start: usize, end: usize) -> &str {
    let mut from = start.saturating_sub(CONTEXT_WINDOW);
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + CONTEXT_WINDOW).min(text.len());
    while !text.is_char_boundary(to) {
        to += 1;
    }
    &text[from..to]
}

/// 11–18 digits stand on their own; 9–10 digit runs additionally need an
/// account token nearby, since a bare 10-digit run is usually a phone.
fn validate_bank_account(digits: &str, window: &str) -> Option<String> {
    match digits.len() {
        11..=18 => Some(digits.to_string()),
        9..=10 if ACCOUNT_CONTEXT.is_match(window) => Some(digits.to_string()),
        _ => None,
    }
}

/// Indian mobile validation + normalization to `+91XXXXXXXXXX`.
///
/// The negative-context rule: a candidate sitting next to account language
/// with no positive phone cue is treated as an account fragment, not a phone.
fn validate_phone(digits: &str, window: &str, plus_prefixed: bool) -> Option<String> {
    let national = match digits.len() {
        10 => digits,
        11 if digits.starts_with('0') => &digits[1..],
        12 if digits.starts_with("91") => &digits[2..],
        _ => return None,
    };
    if !national.starts_with(['6', '7', '8', '9']) {
        return None;
    }
    let has_positive_cue = plus_prefixed || digits.len() == 12 || PHONE_CUE.is_match(window);
    let near_account = ACCOUNT_CONTEXT.is_match(window) || IFSC.is_match(window);
    if near_account && !has_positive_cue {
        return None;
    }
    Some(format!("+91{national}"))
}

fn host_of(link: &str) -> &str {
    let rest = link
        .strip_prefix("https://")
        .or_else(|| link.strip_prefix("http://"))
        .or_else(|| link.strip_prefix("HTTPS://"))
        .or_else(|| link.strip_prefix("HTTP://"))
        .unwrap_or(link);
    rest.split(['/', '?', '#']).next().unwrap_or("")
}

/// Order-preserving case-insensitive dedupe within one extraction batch.
fn dedupe(found: &mut Vec<Extraction>) {
    let mut seen: Vec<(IntelKind, String)> = Vec::new();
    found.retain(|e| {
        let key = (e.kind, e.value.to_lowercase());
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
}
