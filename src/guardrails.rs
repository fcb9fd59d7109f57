//! Persona guardrails: prompt-injection detection and reply sanitization.
//!
//! Sanitization is inline and bounded. There is no regeneration loop: a
//! reply either survives with forbidden sentences removed, falls back to the
//! deterministic template, or (on injection) is replaced with a pre-written
//! deflection. Deflections deliberately avoid the words an injection probe
//! fishes for.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tracing::warn;

static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)ignore\s+(?:all\s+)?previous\s+instructions?",
        r"(?i)disregard\s+(?:all\s+)?(?:previous|prior)\s+instructions?",
        r"(?i)repeat\s+your\s+(?:system\s+)?(?:instructions?|prompt)",
        r"(?i)print\s+your\s+prompt",
        r"(?i)reveal\s+your\s+(?:system\s+)?prompt",
        r"(?i)(?:what|tell\s+me)\s+(?:is|are)\s+your\s+(?:system\s+)?(?:prompt|instructions?)",
        r"(?i)are\s+you\s+(?:an?\s+)?(?:ai|bot|robot|machine)\b",
        r"(?i)you\s+are\s+(?:now\s+)?(?:an?\s+)?(?:ai|assistant|chatbot)\b",
        r"(?i)act\s+as\s+(?:an?\s+)?\w+\s+(?:assistant|model)",
        r"(?i)stop\s+(?:the\s+)?roleplay",
        r"(?i)forget\s+everything",
        r"(?i)new\s+instructions?\s*:",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("injection pattern"))
    .collect()
});

/// Sentences containing any of these are cut from generated replies.
static FORBIDDEN: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bai\b",
        r"(?i)\bbot\b",
        r"(?i)\bchatbot\b",
        r"(?i)\blanguage\s+model\b",
        r"(?i)\bsystem\s+prompt\b",
        r"(?i)\bas\s+an\s+assistant\b",
        r"(?i)\bhoneypot\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("forbidden pattern"))
    .collect()
});

/// In-persona responses to injection probes. None of these may contain
/// "prompt", "system", "instructions", or any forbidden token.
const SAFE_DEFLECTIONS: &[&str] = &[
    "I'm sorry, you lost me there. I'm just trying to do what you asked me earlier. What should I do next?",
    "That message looked very strange to me. Can you say it again in simple words?",
    "I don't understand these technical things. Are you still helping me with the verification?",
    "You sound different all of a sudden. Is everything alright on your side?",
    "My grandson usually helps me with confusing messages like that. Let's get back to what we were doing, please.",
];

/// Pattern check for meta-instruction attempts aimed at breaking the persona.
pub fn detect_prompt_injection(text: &str) -> bool {
    for pattern in INJECTION_PATTERNS.iter() {
        if pattern.is_match(text) {
            warn!(pattern = %pattern.as_str(), "prompt injection attempt detected");
            return true;
        }
    }
    false
}

/// Sanitize an outgoing reply.
///
/// On injection the reply is replaced wholesale with a deflection. Otherwise
/// sentences containing forbidden tokens are dropped; if nothing survives,
/// the deterministic `fallback` template is returned as-is (templates are
/// authored clean).
pub fn sanitize(response: &str, fallback: &str, is_injection: bool) -> String {
    if is_injection {
        let idx = rand::thread_rng().gen_range(0..SAFE_DEFLECTIONS.len());
        return SAFE_DEFLECTIONS[idx].to_string();
    }

    if !FORBIDDEN.iter().any(|p| p.is_match(response)) {
        return response.to_string();
    }

    let kept: Vec<&str> = response
        .split_inclusive(|c| matches!(c, '.' | '!' | '?'))
        .filter(|sentence| !FORBIDDEN.iter().any(|p| p.is_match(sentence)))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if kept.is_empty() {
        warn!("entire reply was forbidden; falling back to template");
        return fallback.to_string();
    }

    warn!(removed = response.len() - kept.iter().map(|s| s.len()).sum::<usize>(),
          "removed forbidden sentences from reply");
    kept.join(" ")
}

/// True when a reply is clean of every forbidden token.
pub fn is_clean(text: &str) -> bool {
    !FORBIDDEN.iter().any(|p| p.is_match(text))
}
