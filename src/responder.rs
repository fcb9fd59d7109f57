//! Reply generation: deterministic template, optional LLM naturalization,
//! validation, loop avoidance, and guardrail sanitization.
//!
//! The template is always computed first and is always a valid reply on its
//! own; the LLM only rewrites it into persona voice. Whatever happens
//! upstream (open breaker, timeout, junk output), the turn produces a
//! well-formed utterance.

use std::sync::Arc;

use tracing::debug;

use crate::detector::{ScamType, Signals};
use crate::guardrails;
use crate::intel::{IntelGraph, IntelKind};
use crate::llm::{CompletionRequest, LanguageModel};
use crate::safety::{LlmModule, SafetyFabric};
use crate::templates::{self, Category, TemplateChoice, TemplateStore};
use crate::types::{Message, Sender};

/// The fictional victim profile; stable for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Persona {
    Elderly,
    Eager,
    Cautious,
    TechNovice,
}

impl Persona {
    /// Persona choice keyed by the detected scam type.
    pub fn for_scam(scam_type: ScamType) -> Self {
        match scam_type {
            ScamType::Phishing | ScamType::Investment => Persona::Cautious,
            ScamType::Lottery | ScamType::Romance | ScamType::FakeJob => Persona::Eager,
            ScamType::TechSupport => Persona::TechNovice,
            ScamType::Impersonation => Persona::Elderly,
            ScamType::Generic => Persona::Cautious,
        }
    }

    pub fn style(self) -> &'static str {
        match self {
            Persona::Elderly => {
                "a polite, trusting retiree in their late 60s; confused but cooperative, \
                 asks for step-by-step help, mentions family"
            }
            Persona::Eager => {
                "an excitable person in their 30s who can't believe their luck and \
                 responds quickly with enthusiasm"
            }
            Persona::Cautious => {
                "a methodical middle-aged person who wants everything confirmed in \
                 writing before acting"
            }
            Persona::TechNovice => {
                "a patient older person who struggles with apps and needs every \
                 instruction repeated simply"
            }
        }
    }

    /// Fraction of replies eligible for a small deterministic typo.
    fn typo_rate(self) -> f32 {
        match self {
            Persona::Elderly => 0.075,
            Persona::Eager => 0.05,
            Persona::Cautious => 0.025,
            Persona::TechNovice => 0.10,
        }
    }
}

/// Narrow view of session state the generator needs for one reply.
pub struct ReplyContext<'a> {
    pub graph: &'a IntelGraph,
    pub message_count: u32,
    pub last_target: Option<IntelKind>,
    pub recent_template_ids: &'a [(Category, usize)],
    /// Tail of the session history (both senders), newest last.
    pub recent_history: &'a [Message],
    pub persona: Persona,
    pub is_injection: bool,
}

#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub text: String,
    pub template_id: (Category, usize),
    pub target: Option<IntelKind>,
}

pub struct ResponseGenerator {
    templates: TemplateStore,
    fabric: Arc<SafetyFabric>,
    llm: Option<Arc<dyn LanguageModel>>,
}

impl ResponseGenerator {
    pub fn new(fabric: Arc<SafetyFabric>, llm: Option<Arc<dyn LanguageModel>>) -> Self {
        Self {
            templates: TemplateStore::new(),
            fabric,
            llm,
        }
    }

    pub async fn generate(&self, ctx: &ReplyContext<'_>, inbound: &str, signals: &Signals) -> ReplyOutcome {
        let mut choice = self.templates.select(
            ctx.graph,
            inbound,
            ctx.message_count,
            ctx.last_target,
            signals,
        );

        let mut candidate = self.naturalize(ctx, inbound, &choice).await;

        let recent_replies: Vec<String> = ctx
            .recent_history
            .iter()
            .filter(|m| m.sender == Sender::Honeypot)
            .map(|m| m.text.clone())
            .collect();
        if templates::loop_detect(&candidate, &recent_replies) {
            debug!(category = ?choice.category, "loop detected, re-selecting sibling template");
            choice = self.templates.sibling(&choice, ctx.recent_template_ids);
            candidate = choice.text.to_string();
        }

        let sanitized = guardrails::sanitize(&candidate, choice.text, ctx.is_injection);
        let text = add_persona_touches(&sanitized, ctx.persona, ctx.message_count);

        ReplyOutcome {
            text,
            template_id: choice.id(),
            target: choice.target(),
        }
    }

    /// Template verbatim on the first turn or without an LLM; otherwise the
    /// generator rewrites it in persona voice, falling back to the template
    /// whenever the result drops the extraction ask.
    async fn naturalize(&self, ctx: &ReplyContext<'_>, inbound: &str, choice: &TemplateChoice) -> String {
        let template = choice.text.to_string();
        let Some(llm) = (ctx.message_count > 1).then_some(self.llm.as_ref()).flatten() else {
            return template;
        };

        let prompt = build_naturalization_prompt(ctx, inbound, choice);
        let candidate = self
            .fabric
            .safe_call(LlmModule::Generator, template.clone(), || async {
                llm.complete(CompletionRequest::new(prompt)).await
            })
            .await;

        if keeps_the_ask(&candidate, choice.target()) {
            candidate
        } else {
            debug!("naturalized reply dropped the ask, using template");
            template
        }
    }
}

fn build_naturalization_prompt(ctx: &ReplyContext<'_>, inbound: &str, choice: &TemplateChoice) -> String {
    let mut history = String::new();
    for m in ctx.recent_history.iter().rev().take(6).rev() {
        let who = match m.sender {
            Sender::Scammer => "Them",
            Sender::Honeypot => "You",
        };
        history.push_str(who);
        history.push_str(": ");
        history.push_str(&m.text);
        history.push('\n');
    }

    format!(
        "You are roleplaying {style}. Rewrite the draft below in that voice as one short \
         chat message. Keep the request it makes word-for-word in spirit: it must still \
         ask the other person for the same thing. No greetings, no quotes, reply text only.\n\n\
         Conversation so far:\n{history}Them: {inbound}\n\nDraft: {draft}",
        style = ctx.persona.style(),
        draft = choice.text,
    )
}

/// A naturalized reply must still carry the extraction ask: the target noun,
/// a direct "your", or at least a question.
fn keeps_the_ask(candidate: &str, target: Option<IntelKind>) -> bool {
    let lower = candidate.to_lowercase();
    if lower.trim().is_empty() {
        return false;
    }
    let noun_present = target.is_some_and(|k| lower.contains(&k.noun().to_lowercase()));
    noun_present || lower.contains("your") || candidate.contains('?')
}

/// Deterministic, turn-keyed imperfection: swap two adjacent letters in one
/// word on a fraction of turns, keyed by turn number so replies reproduce.
/// The per-10-turn trigger count truncates the rate; only personas at or
/// above a 10% rate ever produce a typo.
fn add_persona_touches(text: &str, persona: Persona, turn: u32) -> String {
    let threshold = (persona.typo_rate() * 10.0) as u32;
    if turn % 10 >= threshold {
        return text.to_string();
    }
    let mut words: Vec<String> = text.split(' ').map(str::to_string).collect();
    if words.len() <= 3 {
        return text.to_string();
    }
    let idx = (turn as usize % (words.len() - 1)) + 1;
    let word = &words[idx];
    if word.len() > 3 && word.chars().all(|c| c.is_ascii_alphabetic()) {
        let pos = turn as usize % (word.len() - 1);
        let mut bytes = word.clone().into_bytes();
        bytes.swap(pos, pos + 1);
        if let Ok(swapped) = String::from_utf8(bytes) {
            words[idx] = swapped;
        }
    }
    words.join(" ")
}
