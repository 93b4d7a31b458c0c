//! Transcript-level wake phrase detection
//!
//! There is no acoustic model here: a finalized transcript is tokenized into
//! words and compared against a fixed, ordered list of phrase patterns built
//! from the configured wake words. Matching is always whole-word, so "larkspur"
//! never triggers "lark".

use chrono::{DateTime, Utc};

/// Boost applied whenever the wake token itself is present
const WAKE_TOKEN_BOOST: f32 = 0.2;
/// Extra boost for "hey <wake>" / "hi <wake>"
const GREETING_BOOST: f32 = 0.3;
/// Extra boost for patterns flagged as emergency ("backup <wake>")
const EMERGENCY_BOOST: f32 = 0.4;

const GREETINGS: [&str; 2] = ["hey", "hi"];
const EMERGENCY_PREFIX: &str = "backup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternForm {
    Greeting,
    Emergency,
    Bare,
}

impl PatternForm {
    fn boost(&self) -> f32 {
        match self {
            PatternForm::Greeting => GREETING_BOOST,
            PatternForm::Emergency => EMERGENCY_BOOST,
            PatternForm::Bare => 0.0,
        }
    }
}

/// One wake phrase, as a sequence of lowercase word tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeWordPattern {
    tokens: Vec<String>,
    form: PatternForm,
}

impl WakeWordPattern {
    pub fn form(&self) -> PatternForm {
        self.form
    }

    pub fn phrase(&self) -> String {
        self.tokens.join(" ")
    }
}

/// Result of scoring a transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeMatch {
    pub score: f32,
    pub phrase: String,
    pub emergency: bool,
    /// Text following the matched phrase, trimmed
    pub remainder: String,
}

#[derive(Debug, Clone)]
struct Token {
    word: String,
    end: usize,
}

/// Split `text` into lowercase alphanumeric runs, keeping end offsets into `text`.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        match (c.is_alphanumeric(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                tokens.push(Token {
                    word: text[s..i].to_lowercase(),
                    end: i,
                });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            word: text[s..].to_lowercase(),
            end: text.len(),
        });
    }
    tokens
}

fn words(text: &str) -> Vec<String> {
    tokenize(text).into_iter().map(|t| t.word).collect()
}

/// Index of the first token where `needle` occurs as a contiguous run.
fn find_sequence(tokens: &[Token], needle: &[String]) -> Option<usize> {
    if needle.is_empty() || needle.len() > tokens.len() {
        return None;
    }
    (0..=tokens.len() - needle.len()).find(|&i| {
        tokens[i..i + needle.len()]
            .iter()
            .zip(needle)
            .all(|(t, w)| t.word == *w)
    })
}

fn trim_remainder(text: &str) -> String {
    text.trim_start_matches(|c: char| !c.is_alphanumeric())
        .trim_end()
        .to_string()
}

/// True if `phrase` appears in `text` as whole words (case-insensitive).
pub fn contains_phrase(text: &str, phrase: &str) -> bool {
    let needle = words(phrase);
    find_sequence(&tokenize(text), &needle).is_some()
}

#[derive(Debug, Clone)]
pub struct WakeWordMatcher {
    patterns: Vec<WakeWordPattern>,
    sensitivity: f32,
    duplicate_window_ms: u64,
    last_accepted: Option<DateTime<Utc>>,
}

impl WakeWordMatcher {
    pub fn new(wake_words: &[String], sensitivity: f32, duplicate_window_ms: u64) -> Self {
        Self {
            patterns: build_patterns(wake_words),
            sensitivity: sensitivity.clamp(0.0, 1.0),
            duplicate_window_ms,
            last_accepted: None,
        }
    }

    /// Swap configuration while keeping the duplicate-suppression history.
    pub fn reconfigure(&mut self, wake_words: &[String], sensitivity: f32, duplicate_window_ms: u64) {
        self.patterns = build_patterns(wake_words);
        self.sensitivity = sensitivity.clamp(0.0, 1.0);
        self.duplicate_window_ms = duplicate_window_ms;
    }

    pub fn patterns(&self) -> &[WakeWordPattern] {
        &self.patterns
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    /// Best-scoring pattern in `text`, ignoring the threshold.
    ///
    /// Ties go to the pattern listed first.
    pub fn score(&self, text: &str, confidence: f32) -> Option<WakeMatch> {
        let tokens = tokenize(text);
        let mut best: Option<WakeMatch> = None;

        for pattern in &self.patterns {
            let Some(at) = find_sequence(&tokens, &pattern.tokens) else {
                continue;
            };
            let score = confidence + WAKE_TOKEN_BOOST + pattern.form.boost();
            if best.as_ref().map_or(true, |b| score > b.score) {
                let end = tokens[at + pattern.tokens.len() - 1].end;
                best = Some(WakeMatch {
                    score,
                    phrase: pattern.phrase(),
                    emergency: pattern.form == PatternForm::Emergency,
                    remainder: trim_remainder(&text[end..]),
                });
            }
        }
        best
    }

    /// True if any wake pattern appears in `text`, regardless of score.
    pub fn contains_wake_phrase(&self, text: &str) -> bool {
        let tokens = tokenize(text);
        self.patterns
            .iter()
            .any(|p| find_sequence(&tokens, &p.tokens).is_some())
    }

    /// Drop a wake phrase at the very start of `text`, returning what follows.
    ///
    /// Text that does not start with a wake phrase comes back trimmed.
    pub fn strip_wake_phrase(&self, text: &str) -> String {
        let tokens = tokenize(text);
        let leading = self
            .patterns
            .iter()
            .filter(|p| {
                p.tokens.len() <= tokens.len()
                    && tokens.iter().zip(&p.tokens).all(|(t, w)| t.word == *w)
            })
            .map(|p| p.tokens.len())
            .max();

        match leading {
            Some(n) => trim_remainder(&text[tokens[n - 1].end..]),
            None => text.trim().to_string(),
        }
    }

    /// Score a final transcript and accept it if it clears the threshold and
    /// is not a repeat within the duplicate window.
    pub fn detect(&mut self, text: &str, confidence: f32, at: DateTime<Utc>) -> Option<WakeMatch> {
        let found = self.score(text, confidence)?;
        if found.score < self.sensitivity {
            log::debug!(
                "Wake phrase '{}' scored {:.2} below sensitivity {:.2}",
                found.phrase,
                found.score,
                self.sensitivity
            );
            return None;
        }
        if self.is_duplicate(at) {
            log::debug!("Duplicate wake phrase '{}' suppressed", found.phrase);
            return None;
        }
        self.last_accepted = Some(at);
        Some(found)
    }

    /// Record a detection that bypassed scoring.
    pub fn mark_accepted(&mut self, at: DateTime<Utc>) {
        self.last_accepted = Some(at);
    }

    fn is_duplicate(&self, at: DateTime<Utc>) -> bool {
        match self.last_accepted {
            Some(last) => {
                at.signed_duration_since(last).num_milliseconds() < self.duplicate_window_ms as i64
            }
            None => false,
        }
    }
}

fn build_patterns(wake_words: &[String]) -> Vec<WakeWordPattern> {
    let mut patterns = Vec::with_capacity(wake_words.len() * 4);
    for wake in wake_words {
        let wake_tokens = words(wake);
        if wake_tokens.is_empty() {
            continue;
        }
        let prefixed = |prefix: &str, form| WakeWordPattern {
            tokens: std::iter::once(prefix.to_string())
                .chain(wake_tokens.iter().cloned())
                .collect(),
            form,
        };
        for greeting in GREETINGS {
            patterns.push(prefixed(greeting, PatternForm::Greeting));
        }
        patterns.push(prefixed(EMERGENCY_PREFIX, PatternForm::Emergency));
        patterns.push(WakeWordPattern {
            tokens: wake_tokens,
            form: PatternForm::Bare,
        });
    }
    patterns
}
