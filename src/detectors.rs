//! Conversational signal detectors.
//!
//! Pure functions over a slice of recent messages. Each detector tests every
//! message against an ordered list of case-insensitive regexes; a message
//! counts once even if several patterns match.
//!
//! Confidence is `min(matches / K, 1.0)` with a per-detector saturation `K`:
//!
//! | detector        | min matches | K   |
//! |-----------------|-------------|-----|
//! | decision        | 1           | 2.0 |
//! | commitment      | 1           | 2.0 |
//! | confusion       | 2           | 3.0 |
//! | problem         | 2           | 3.0 |
//! | urgency         | 1           | 1.5 |
//! | knowledge gap   | 2 (topic)   | 3.0 |
//!
//! The constants are tuning knobs; only monotonicity and the 1.0 cap matter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::model::ChatMessage;

/// "We made a call."
pub const DECISION_PATTERNS: &[&str] = &[
    r"\blet['’]?s go with\b",
    r"\bwe(?:['’]ve| have)? decided\b",
    r"\bdecided to\b",
    r"\bfinal decision\b",
    r"\bwe(?:['’]ll| will) go with\b",
    r"\bagreed (?:on|to)\b",
    r"\bsettled on\b",
];

/// "I'll do it."
pub const COMMITMENT_PATTERNS: &[&str] = &[
    r"\bI(?:['’]ll| will) (?:take care of|handle|do|send|write|fix|look into|follow up)\b",
    r"\bI can (?:take|handle|do) (?:it|that|this)\b",
    r"\bI(?:['’]m| am) on it\b",
    r"\bassign (?:it|that|this) to me\b",
    r"\bwill have it (?:done|ready)\b",
    r"\bby (?:tomorrow|monday|tuesday|wednesday|thursday|friday|end of (?:day|week))\b",
];

/// "Wait, what?"
pub const CONFUSION_PATTERNS: &[&str] = &[
    r"\bI(?:['’]m| am) (?:confused|lost|not sure what)\b",
    r"\bwhat do you mean\b",
    r"\bdon['’]?t (?:understand|get it)\b",
    r"\bcan (?:someone|you|anyone) (?:explain|clarify)\b",
    r"\bwait,? what\b",
    r"\bmakes no sense\b",
    r"\bunclear\b",
];

/// "I'm blocked."
pub const PROBLEM_PATTERNS: &[&str] = &[
    r"\bstuck on\b",
    r"\bnothing works\b",
    r"\bblocked (?:on|by)\b",
    r"\b(?:is|are|keeps?) (?:broken|failing|crashing)\b",
    r"\bcan['’]?t (?:figure out|get it to|make it)\b",
    r"\b(?:doesn|isn)['’]?t work(?:ing)?\b",
    r"\bnot working\b",
];

/// "Now!"
pub const URGENCY_PATTERNS: &[&str] = &[
    r"\burgent(?:ly)?\b",
    r"\basap\b",
    r"\bemergency\b",
    r"\bright (?:now|away)\b",
    r"\bimmediately\b",
    r"\b(?:prod|production|site|server) is down\b",
    r"\bdeadline is (?:today|tonight|tomorrow)\b",
];

/// "Does anyone know ...?" Each pattern captures the subject as `topic`.
pub const KNOWLEDGE_GAP_PATTERNS: &[&str] = &[
    r"\bdoes anyone know (?:how|what|where|why|about|if) (?:to |is |the |our |a )?(?P<topic>\w+)",
    r"\bhow (?:does|do) (?:the |our |we )?(?P<topic>\w+) work",
    r"\bwhere (?:is|are) (?:the |our )?(?P<topic>\w+) (?:docs|documentation|config)",
    r"\bwho (?:knows|owns) (?:about |the |our )?(?P<topic>\w+)",
    r"\bno idea (?:how|what|where) (?:the |our )?(?P<topic>\w+)",
];

const QUESTION_WINDOW: usize = 10;
const TOPIC_DRIFT_WINDOW: usize = 5;
pub const DEFAULT_SILENCE_MINUTES: i64 = 30;

static DECISION_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_static(DECISION_PATTERNS));
static COMMITMENT_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_static(COMMITMENT_PATTERNS));
static CONFUSION_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_static(CONFUSION_PATTERNS));
static PROBLEM_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_static(PROBLEM_PATTERNS));
static URGENCY_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_static(URGENCY_PATTERNS));
static KNOWLEDGE_GAP_RE: Lazy<Vec<Regex>> = Lazy::new(|| compile_static(KNOWLEDGE_GAP_PATTERNS));
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?u)\b\w+\b").expect("word regex"));

/// Result of one detector run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Detection {
    pub detected: bool,
    pub matching_message_ids: Vec<String>,
    pub confidence: f32,
    /// Only set by the knowledge-gap detector.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Raw output of [`scan`]: which messages hit, and how many hits were counted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    pub matching_message_ids: Vec<String>,
    pub match_count: usize,
}

impl ScanResult {
    pub fn contains(&self, message_id: &str) -> bool {
        self.matching_message_ids.iter().any(|id| id == message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SilenceDetection {
    pub detected: bool,
    pub minutes_silent: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicDrift {
    pub detected: bool,
    pub drift_score: f32,
}

/// Compile user-supplied patterns case-insensitively.
/// Invalid entries are logged and skipped; the rest still compile.
pub fn compile_patterns<S: AsRef<str>>(owner: &str, patterns: &[S]) -> Vec<Regex> {
    let mut out = Vec::with_capacity(patterns.len());
    for p in patterns {
        match RegexBuilder::new(p.as_ref()).case_insensitive(true).build() {
            Ok(re) => out.push(re),
            Err(e) => {
                tracing::warn!(
                    target: "chime",
                    rule_id = owner,
                    pattern = p.as_ref(),
                    error = %e,
                    "skipping invalid pattern"
                );
            }
        }
    }
    out
}

fn compile_static(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .expect("built-in detector regex")
        })
        .collect()
}

/// Combined regex + keyword scan. A message counts once no matter how many
/// patterns or keywords it hits. Keywords are case-insensitive substrings.
pub fn scan(messages: &[&ChatMessage], patterns: &[Regex], keywords: &[String]) -> ScanResult {
    let keywords: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();

    let mut res = ScanResult::default();
    for m in messages {
        let hit = patterns.iter().any(|re| re.is_match(&m.content)) || {
            let lower = m.content.to_lowercase();
            keywords.iter().any(|k| lower.contains(k.as_str()))
        };
        if hit {
            res.matching_message_ids.push(m.id.clone());
            res.match_count += 1;
        }
    }
    res
}

/// `min(count / saturation, 1.0)`; zero for a non-positive saturation.
pub fn saturating_confidence(count: usize, saturation: f32) -> f32 {
    if saturation <= 0.0 {
        return 0.0;
    }
    (count as f32 / saturation).min(1.0)
}

fn run_signal(
    messages: &[ChatMessage],
    patterns: &[Regex],
    min_matches: usize,
    saturation: f32,
) -> Detection {
    let refs: Vec<&ChatMessage> = messages.iter().collect();
    let scan = scan(&refs, patterns, &[]);
    Detection {
        detected: scan.match_count >= min_matches,
        confidence: saturating_confidence(scan.match_count, saturation),
        matching_message_ids: scan.matching_message_ids,
        topic: None,
    }
}

pub fn detect_decision(messages: &[ChatMessage]) -> Detection {
    run_signal(messages, &DECISION_RE, 1, 2.0)
}

pub fn detect_commitment(messages: &[ChatMessage]) -> Detection {
    run_signal(messages, &COMMITMENT_RE, 1, 2.0)
}

/// Needs two confused messages; one is just a question.
pub fn detect_confusion(messages: &[ChatMessage]) -> Detection {
    run_signal(messages, &CONFUSION_RE, 2, 3.0)
}

/// Needs two problem reports.
pub fn detect_problem(messages: &[ChatMessage]) -> Detection {
    run_signal(messages, &PROBLEM_RE, 2, 3.0)
}

pub fn detect_urgency(messages: &[ChatMessage]) -> Detection {
    run_signal(messages, &URGENCY_RE, 1, 1.5)
}

/// Detects only when the same topic is asked about at least twice.
pub fn detect_knowledge_gap(messages: &[ChatMessage]) -> Detection {
    let mut ids = Vec::new();
    // topic -> (count, first seen order)
    let mut topics: HashMap<String, (usize, usize)> = HashMap::new();

    for m in messages {
        for re in KNOWLEDGE_GAP_RE.iter() {
            if let Some(caps) = re.captures(&m.content) {
                ids.push(m.id.clone());
                if let Some(t) = caps.name("topic") {
                    let order = topics.len();
                    let entry = topics
                        .entry(t.as_str().to_lowercase())
                        .or_insert((0, order));
                    entry.0 += 1;
                }
                break;
            }
        }
    }

    let top = topics
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)));

    let (topic, recurrences) = match top {
        Some((t, (n, _))) => (Some(t), n),
        None => (None, 0),
    };

    Detection {
        detected: recurrences >= 2,
        confidence: saturating_confidence(ids.len(), 3.0),
        matching_message_ids: ids,
        topic,
    }
}

/// Looks at the last 10 messages: more than half questions, at least three of them.
pub fn detect_question_overload(messages: &[ChatMessage]) -> Detection {
    let start = messages.len().saturating_sub(QUESTION_WINDOW);
    let window = &messages[start..];
    if window.is_empty() {
        return Detection::default();
    }

    let ids: Vec<String> = window
        .iter()
        .filter(|m| m.content.trim_end().ends_with('?'))
        .map(|m| m.id.clone())
        .collect();
    let ratio = ids.len() as f32 / window.len() as f32;

    Detection {
        detected: ratio > 0.5 && ids.len() >= 3,
        confidence: ratio.min(1.0),
        matching_message_ids: ids,
        topic: None,
    }
}

/// Pure time delta: silent when at least `threshold_minutes` passed since the last message.
pub fn detect_silence(
    last_message_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold_minutes: i64,
) -> SilenceDetection {
    let minutes_silent = now.signed_duration_since(last_message_at).num_minutes();
    SilenceDetection {
        detected: minutes_silent >= threshold_minutes,
        minutes_silent,
    }
}

/// Mention rate of the topic's words across the last five messages.
/// `drift = 1 - min(rate * 10, 1)`; drifting when above 0.7.
pub fn detect_topic_drift(messages: &[ChatMessage], topic: &str) -> TopicDrift {
    let keywords: Vec<String> = WORD_RE
        .find_iter(topic)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    if messages.len() < TOPIC_DRIFT_WINDOW || keywords.is_empty() {
        return TopicDrift {
            detected: false,
            drift_score: 0.0,
        };
    }

    let recent = &messages[messages.len() - TOPIC_DRIFT_WINDOW..];
    let mut words = 0usize;
    let mut mentions = 0usize;
    for m in recent {
        for w in WORD_RE.find_iter(&m.content) {
            words += 1;
            let w = w.as_str().to_lowercase();
            if keywords.iter().any(|k| *k == w) {
                mentions += 1;
            }
        }
    }

    let rate = if words == 0 {
        0.0
    } else {
        mentions as f32 / words as f32
    };
    let drift_score = 1.0 - (rate * 10.0).min(1.0);
    TopicDrift {
        detected: drift_score > 0.7,
        drift_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap()
    }

    fn msgs(texts: &[&str]) -> Vec<ChatMessage> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                ChatMessage::new(
                    format!("m{}", i + 1),
                    "u1",
                    *t,
                    t0() + Duration::minutes(i as i64),
                )
            })
            .collect()
    }

    #[test]
    fn decision_single_match_is_mid_confidence() {
        let d = detect_decision(&msgs(&["Let's go with option A for the database"]));
        assert!(d.detected);
        assert_eq!(d.matching_message_ids, vec!["m1"]);
        assert!((d.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn message_counts_once_even_with_many_patterns() {
        let d = detect_decision(&msgs(&["We decided, final decision: let's go with Postgres"]));
        assert_eq!(d.matching_message_ids.len(), 1);
        assert!((d.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn confusion_needs_two_messages() {
        let one = detect_confusion(&msgs(&["I'm confused", "ok"]));
        assert!(!one.detected);
        let two = detect_confusion(&msgs(&["I'm confused", "what do you mean by that?"]));
        assert!(two.detected);
        assert!(two.confidence > one.confidence);
    }

    #[test]
    fn problem_needs_two_reports() {
        let d = detect_problem(&msgs(&["stuck on the migration", "lunch?", "nothing works"]));
        assert!(d.detected);
        assert_eq!(d.matching_message_ids, vec!["m1", "m3"]);
    }

    #[test]
    fn urgency_saturates_at_one() {
        let d = detect_urgency(&msgs(&["URGENT", "asap please", "prod is down", "right now"]));
        assert!(d.detected);
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn commitment_detected() {
        let d = detect_commitment(&msgs(&["I'll take care of the release notes"]));
        assert!(d.detected);
    }

    #[test]
    fn knowledge_gap_requires_recurring_topic() {
        let once = detect_knowledge_gap(&msgs(&["does anyone know how the deploy works"]));
        assert!(!once.detected);
        assert_eq!(once.topic.as_deref(), Some("deploy"));

        let twice = detect_knowledge_gap(&msgs(&[
            "does anyone know how the deploy works",
            "no idea",
            "how does the deploy work with staging?",
        ]));
        assert!(twice.detected);
        assert_eq!(twice.topic.as_deref(), Some("deploy"));
        assert_eq!(twice.matching_message_ids, vec!["m1", "m3"]);
    }

    #[test]
    fn question_overload_uses_trailing_window() {
        let d = detect_question_overload(&msgs(&["why?", "how?", "ok", "when?"]));
        assert!(d.detected);
        assert!((d.confidence - 0.75).abs() < 1e-6);

        let half = detect_question_overload(&msgs(&["a?", "b?", "c?", "d", "e", "f"]));
        assert!(!half.detected, "exactly 50% is not overload");

        let too_few = detect_question_overload(&msgs(&["a?", "b?"]));
        assert!(!too_few.detected);
    }

    #[test]
    fn silence_is_inclusive_at_threshold() {
        let s = detect_silence(t0(), t0() + Duration::minutes(30), DEFAULT_SILENCE_MINUTES);
        assert!(s.detected);
        let s = detect_silence(t0(), t0() + Duration::minutes(29), DEFAULT_SILENCE_MINUTES);
        assert!(!s.detected);
    }

    #[test]
    fn topic_drift() {
        let on_topic = msgs(&[
            "database",
            "database index",
            "database schema",
            "the database",
            "database again",
        ]);
        let d = detect_topic_drift(&on_topic, "database");
        assert!(!d.detected);
        assert_eq!(d.drift_score, 0.0);

        let off_topic = msgs(&[
            "lunch plans",
            "pizza or tacos",
            "tacos for sure",
            "who is driving",
            "me",
        ]);
        let d = detect_topic_drift(&off_topic, "database");
        assert!(d.detected);
        assert_eq!(d.drift_score, 1.0);

        let short = msgs(&["lunch"]);
        assert!(!detect_topic_drift(&short, "database").detected);
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let res = compile_patterns("r1", &["(unclosed", "ok"]);
        assert_eq!(res.len(), 1);
        assert!(res[0].is_match("OK"));
    }

    #[test]
    fn scan_keywords_case_insensitive() {
        let m = msgs(&["Need a HOTFIX", "nothing here"]);
        let refs: Vec<&ChatMessage> = m.iter().collect();
        let r = scan(&refs, &[], &["hotfix".to_string(), "  ".to_string()]);
        assert_eq!(r.matching_message_ids, vec!["m1"]);
        assert_eq!(r.match_count, 1);
        assert!(r.contains("m1"));
    }
}
