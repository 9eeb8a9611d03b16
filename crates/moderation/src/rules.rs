//! Rule-based prompt guardrail
//!
//! Keyword and regex heuristics, no network. Input checks target
//! prompt-injection and exfiltration phrasing; output checks catch
//! leaked system-prompt preambles and credential-looking strings.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::RegexSet;

use orbit_core::{Direction, Moderator, Result, Verdict};

static INPUT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions",
        r"(?i)disregard\s+(all\s+)?(previous|prior|your)\s+(instructions|rules|guidelines)",
        r"(?i)you\s+are\s+now\s+(dan|in\s+developer\s+mode)",
        r"(?i)reveal\s+(your\s+)?(system\s+prompt|hidden\s+instructions)",
        r"(?i)(dump|leak|print|show)\s+(the\s+)?(secrets?|credentials?|api\s*keys?|passwords?)",
        r"(?i)pretend\s+(you\s+have\s+)?no\s+(restrictions|rules|guidelines)",
        r"(?i)jailbreak",
    ])
    .expect("input guardrail patterns are valid")
});

static OUTPUT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        // System-prompt leak preambles
        r"(?i)my\s+system\s+prompt\s+(is|says)",
        r"(?i)here\s+(is|are)\s+my\s+(hidden\s+)?instructions",
        // Credential-looking material
        r"sk-[A-Za-z0-9]{20,}",
        r"(?i)-----BEGIN\s+(RSA|EC|OPENSSH)\s+PRIVATE\s+KEY-----",
    ])
    .expect("output guardrail patterns are valid")
});

/// Heuristic guardrail moderator.
pub struct RuleGuard;

impl RuleGuard {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RuleGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Moderator for RuleGuard {
    async fn check(&self, text: &str, direction: Direction) -> Result<Verdict> {
        let patterns = match direction {
            Direction::Input => &*INPUT_PATTERNS,
            Direction::Output => &*OUTPUT_PATTERNS,
        };

        if patterns.is_match(text) {
            let reason = match direction {
                Direction::Input => "prompt injection heuristics matched",
                Direction::Output => "output leak heuristics matched",
            };
            return Ok(Verdict::blocked(self.name(), reason).with_score(1.0));
        }
        Ok(Verdict::safe(self.name()))
    }

    fn name(&self) -> &str {
        "rules"
    }
}
