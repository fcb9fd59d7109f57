//! Deterministic victim-persona reply templates.
//!
//! Category choice is rule-driven and deterministic; randomness exists only
//! inside the chosen category. Every seed keeps the extraction ask explicit
//! (a question plus the target noun), which is also what reply validation
//! checks after LLM naturalization.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::detector::{Signals, Tactic};
use crate::intel::{IntelGraph, IntelKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    MissingAccount,
    MissingIfsc,
    MissingUpi,
    MissingLink,
    MissingPhone,
    NeedBackup,
    VagueProbe,
    UrgencyEcho,
    CredentialFlip,
}

impl Category {
    pub fn seeds(self) -> &'static [&'static str] {
        match self {
            Category::MissingAccount => MISSING_ACCOUNT,
            Category::MissingIfsc => MISSING_IFSC,
            Category::MissingUpi => MISSING_UPI,
            Category::MissingLink => MISSING_LINK,
            Category::MissingPhone => MISSING_PHONE,
            Category::NeedBackup => NEED_BACKUP,
            Category::VagueProbe => VAGUE_PROBE,
            Category::UrgencyEcho => URGENCY_ECHO,
            Category::CredentialFlip => CREDENTIAL_FLIP,
        }
    }

    /// The artifact kind a reply from this category is fishing for.
    pub fn target(self) -> Option<IntelKind> {
        match self {
            Category::MissingAccount => Some(IntelKind::BankAccount),
            Category::MissingIfsc => Some(IntelKind::IfscCode),
            Category::MissingUpi => Some(IntelKind::UpiId),
            Category::MissingLink => Some(IntelKind::Link),
            Category::MissingPhone => Some(IntelKind::PhoneNumber),
            // Flips the credential ask into a request for their contact.
            Category::CredentialFlip => Some(IntelKind::PhoneNumber),
            Category::NeedBackup | Category::VagueProbe | Category::UrgencyEcho => None,
        }
    }

    fn for_kind(kind: IntelKind) -> Category {
        match kind {
            IntelKind::BankAccount => Category::MissingAccount,
            IntelKind::IfscCode => Category::MissingIfsc,
            IntelKind::UpiId => Category::MissingUpi,
            IntelKind::Link => Category::MissingLink,
            _ => Category::MissingPhone,
        }
    }
}

const MISSING_ACCOUNT: &[&str] = &[
    "My bank app is asking for your account number before it lets me add you. What is it?",
    "The transfer page wants the beneficiary account number. Can you type yours out for me?",
    "I wrote down everything else but I still need your account number to send the money.",
    "It failed again and the lady at the branch said I need the exact account number. Please send it once more, digit by digit.",
    "Which account number do I put in the 'send to' box? Can you give me yours?",
];

const MISSING_IFSC: &[&str] = &[
    "The form is asking for an IFSC code for your branch. What should I enter?",
    "I typed the account in but it wants an 11 character IFSC code too. What is yours?",
    "My passbook shows an IFSC for my branch, but I need yours to finish this transfer.",
    "It says 'invalid IFSC'. Can you check and send me the right IFSC code?",
];

const MISSING_UPI: &[&str] = &[
    "My nephew set up UPI on my phone. What UPI ID should I send the money to?",
    "Google Pay is asking for the receiver's UPI ID. Can you share yours?",
    "I can try UPI if that is faster. What is your UPI ID, like name@bank?",
    "The bank transfer keeps failing. Do you have a UPI ID I can pay instead?",
    "Where do I send it on UPI? Please type your UPI ID exactly.",
];

const MISSING_LINK: &[&str] = &[
    "I think I deleted your message with the link. Can you send the link again?",
    "The page would not open on my old phone. Is there another link I can try?",
    "My grandson says I should use the official page. Can you send me the exact link?",
    "I clicked but it said 'page not found'. Please send the link once more.",
];

const MISSING_PHONE: &[&str] = &[
    "My bank may call to confirm the transfer. What phone number can they reach you on?",
    "Typing is hard for me. Can I just call you? What is your number?",
    "The app wants the receiver's mobile number for SMS confirmation. What is your number?",
    "In case this chat disconnects, what number should I save for you?",
];

const NEED_BACKUP: &[&str] = &[
    "That first way did not work for me. Is there another account or UPI I can use instead?",
    "My daughter says sometimes payments bounce. Do you have a backup account just in case?",
    "If this one fails again, where else can I send it? Give me one more option.",
    "Is there a second number or account you use? I want to be sure the money reaches you.",
    "The app says 'try a different recipient'. Do you have another UPI or account?",
];

const VAGUE_PROBE: &[&str] = &[
    "Sorry, I am a little slow with these things. What exactly do you need from me?",
    "Alright. And what happens after that? Please explain it step by step.",
    "I see. Who am I speaking with, and what should I do first?",
    "Okay. Can you tell me a bit more about this before I do anything?",
];

const URGENCY_ECHO: &[&str] = &[
    "You keep saying it is urgent and now I am nervous. Tell me exactly which account of yours the money goes to so I do not make a mistake.",
    "Please do not rush me, my hands shake when I hurry. Give me your details again slowly, one at a time.",
    "If it is really that urgent, give me your number so we can finish this on a call.",
    "I understand it is urgent. I am at the payment screen now, just tell me your account number to put in.",
];

const CREDENTIAL_FLIP: &[&str] = &[
    "Why do you need my OTP? The bank told me their staff would give me a reference number first. What is your phone number so I can call and confirm?",
    "I never read those codes out. But I can pay you directly instead, just give me your account number.",
    "My grandson said the code is private. Let us do it another way. What is your UPI ID? I will send the money myself.",
    "Before I share anything like that, tell me your full name and your official contact number for my diary.",
    "The last time I gave a code my card was blocked for a week. Give me your number and I will call you back to finish this.",
];

static CREDENTIAL_CUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:otp|pin|cvv|password|passcode|one\s+time\s+password)\b")
        .expect("credential cue regex")
});

/// A selected seed; the id pair feeds loop-avoidance across turns.
#[derive(Debug, Clone)]
pub struct TemplateChoice {
    pub category: Category,
    pub index: usize,
    pub text: &'static str,
}

impl TemplateChoice {
    pub fn id(&self) -> (Category, usize) {
        (self.category, self.index)
    }

    pub fn target(&self) -> Option<IntelKind> {
        self.category.target()
    }
}

#[derive(Debug, Default)]
pub struct TemplateStore;

impl TemplateStore {
    pub fn new() -> Self {
        Self
    }

    /// Deterministic category selection; random seed within the category.
    ///
    /// `last_target` is the kind the previous reply asked for: when that ask
    /// has since been answered, a backup probe beats walking the ladder.
    pub fn select(
        &self,
        graph: &IntelGraph,
        inbound: &str,
        message_count: u32,
        last_target: Option<IntelKind>,
        signals: &Signals,
    ) -> TemplateChoice {
        let credential_cue = CREDENTIAL_CUE.is_match(inbound);
        let threatening = signals.has_urgency || signals.tactics.contains(&Tactic::Fear);
        let short_inbound = inbound.trim().chars().count() < 30;
        // "Nothing above UPI missing" = both account and IFSC captured.
        let high_ranks_captured =
            graph.has(IntelKind::BankAccount) && graph.has(IntelKind::IfscCode);

        let category = if credential_cue {
            // The vague probe may preempt the credential flip alone: short,
            // low-signal mention, and only once the asks ranking above UPI
            // (account, IFSC) are already answered. It never preempts the
            // backup probe or the ladder.
            if short_inbound && high_ranks_captured && !threatening {
                Category::VagueProbe
            } else {
                Category::CredentialFlip
            }
        } else if threatening && message_count >= 4 {
            Category::UrgencyEcho
        } else if last_target.is_some_and(|k| graph.has(k))
            && IntelKind::LADDER.iter().any(|k| graph.has(*k))
        {
            Category::NeedBackup
        } else if let Some(kind) = graph.first_missing() {
            Category::for_kind(kind)
        } else {
            Category::NeedBackup
        };

        self.pick(category)
    }

    fn pick(&self, category: Category) -> TemplateChoice {
        let seeds = category.seeds();
        let index = rand::thread_rng().gen_range(0..seeds.len());
        TemplateChoice {
            category,
            index,
            text: seeds[index],
        }
    }

    /// Pick a sibling seed in the same category, avoiding ids used in the
    /// last two turns.
    pub fn sibling(&self, current: &TemplateChoice, recent: &[(Category, usize)]) -> TemplateChoice {
        let seeds = current.category.seeds();
        for offset in 1..seeds.len() {
            let index = (current.index + offset) % seeds.len();
            if !recent.contains(&(current.category, index)) {
                return TemplateChoice {
                    category: current.category,
                    index,
                    text: seeds[index],
                };
            }
        }
        current.clone()
    }
}

/// True when a candidate reply would read as a repeat of a recent one: same
/// lowercased 25-char prefix as any of the last three honeypot replies, or
/// an exact match.
pub fn loop_detect(candidate: &str, recent_replies: &[String]) -> bool {
    let prefix = |s: &str| s.to_lowercase().chars().take(25).collect::<String>();
    let candidate_prefix = prefix(candidate);
    recent_replies
        .iter()
        .rev()
        .take(3)
        .any(|r| *r == candidate || prefix(r) == candidate_prefix)
}
