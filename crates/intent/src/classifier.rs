//! Intent Classifier
//!
//! Pure keyword classification: an ordered rule table of (verb, noun) regex
//! pairs, one rule per generation kind. No I/O, no model calls; total for any
//! input including the empty string.
//!
//! The rule order is a business decision, not an alphabetization: voice is
//! checked before video, before music, before slides, before image, before
//! code. A message mentioning both "video" and "soundtrack" is a video
//! request. Do not reorder.

use muse_shared::{Intent, IntentKind};
use regex::Regex;

/// Confidence for a verb + noun (keyword-exact) match, and for the chat
/// default.
pub const EXACT_CONFIDENCE: f64 = 1.0;

/// Confidence when only the medium noun appears without an action verb. Below
/// the routing confirmation threshold, so these phrasings prompt the user.
pub const AMBIGUOUS_CONFIDENCE: f64 = 0.6;

struct Rule {
    kind: IntentKind,
    verbs: Regex,
    nouns: Regex,
}

impl Rule {
    fn new(kind: IntentKind, verbs: &str, nouns: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            kind,
            verbs: Regex::new(&format!(r"(?i)\b(?:{verbs})\b"))?,
            nouns: Regex::new(&format!(r"(?i)\b(?:{nouns})\b"))?,
        })
    }
}

enum RuleMatch {
    Exact,
    NounOnly,
    None,
}

impl Rule {
    fn evaluate(&self, text: &str) -> RuleMatch {
        if !self.nouns.is_match(text) {
            return RuleMatch::None;
        }
        if self.verbs.is_match(text) {
            RuleMatch::Exact
        } else {
            RuleMatch::NounOnly
        }
    }
}

/// Keyword-rule classifier. Compile once (regex construction is the only
/// fallible step) and reuse; `classify` itself never fails.
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    pub fn new() -> Result<Self, regex::Error> {
        // Priority order is load-bearing, see module docs
        let rules = vec![
            Rule::new(
                IntentKind::Voice,
                "say|speak|read|narrate|pronounce|recite",
                "voice|speech|narration|voiceover|aloud|tts",
            )?,
            Rule::new(
                IntentKind::Video,
                "generate|create|make|produce|render|film|animate|shoot",
                "video|clip|animation|movie|film|reel",
            )?,
            Rule::new(
                IntentKind::Music,
                "generate|create|make|compose|produce|write|play",
                "music|song|soundtrack|melody|tune|beat|jingle",
            )?,
            Rule::new(
                IntentKind::Slides,
                "generate|create|make|build|prepare|draft|put together",
                "presentation|slides?|slideshow|deck|powerpoint|keynote",
            )?,
            Rule::new(
                IntentKind::Image,
                "generate|create|make|draw|paint|render|sketch|design|illustrate",
                "image|picture|illustration|artwork|photo|drawing|logo|icon|wallpaper",
            )?,
            Rule::new(
                IntentKind::Code,
                "write|generate|create|implement|build|fix|debug|refactor",
                "code|function|script|program|snippet|class|module|bug|app",
            )?,
        ];
        Ok(Self { rules })
    }

    /// Classify a raw user message.
    ///
    /// A keyword-exact (verb + noun) match anywhere in the priority order
    /// beats a noun-only match from an earlier rule; within the same match
    /// grade the earlier rule wins. Anything else is chat.
    pub fn classify(&self, text: &str) -> Intent {
        let mut noun_only: Option<IntentKind> = None;

        for rule in &self.rules {
            match rule.evaluate(text) {
                RuleMatch::Exact => {
                    return Intent {
                        kind: rule.kind,
                        confidence: EXACT_CONFIDENCE,
                        reasoning: format!("matched {} action and subject keywords", rule.kind),
                    };
                }
                RuleMatch::NounOnly => {
                    if noun_only.is_none() {
                        noun_only = Some(rule.kind);
                    }
                }
                RuleMatch::None => {}
            }
        }

        if let Some(kind) = noun_only {
            return Intent {
                kind,
                confidence: AMBIGUOUS_CONFIDENCE,
                reasoning: format!("mentioned {kind} without an action verb"),
            };
        }

        Intent {
            kind: IntentKind::Chat,
            confidence: EXACT_CONFIDENCE,
            reasoning: "no generation keywords; plain chat".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new().unwrap()
    }

    #[test]
    fn test_slides_from_presentation_request() {
        let intent = classifier().classify("Create a presentation about AI");
        assert_eq!(intent.kind, IntentKind::Slides);
        assert_eq!(intent.confidence, EXACT_CONFIDENCE);
    }

    #[test]
    fn test_voice_request() {
        let intent = classifier().classify("say hello in a calm voice");
        assert_eq!(intent.kind, IntentKind::Voice);
        assert_eq!(intent.confidence, EXACT_CONFIDENCE);
    }

    #[test]
    fn test_plain_question_is_chat() {
        let intent = classifier().classify("what's the capital of France");
        assert_eq!(intent.kind, IntentKind::Chat);
        assert_eq!(intent.confidence, EXACT_CONFIDENCE);
    }

    #[test]
    fn test_priority_video_beats_music() {
        // Matches both the video and music rules; the earlier rule wins
        let intent = classifier().classify("create a video with a custom soundtrack");
        assert_eq!(intent.kind, IntentKind::Video);
        assert_eq!(intent.confidence, EXACT_CONFIDENCE);
    }

    #[test]
    fn test_empty_input_is_chat() {
        let intent = classifier().classify("");
        assert_eq!(intent.kind, IntentKind::Chat);
    }

    #[test]
    fn test_noun_without_verb_is_ambiguous() {
        let intent = classifier().classify("a picture of a lighthouse at dusk");
        assert_eq!(intent.kind, IntentKind::Image);
        assert_eq!(intent.confidence, AMBIGUOUS_CONFIDENCE);
    }

    #[test]
    fn test_exact_match_beats_earlier_noun_only() {
        // "voice" alone would match the voice rule's nouns, but the image
        // rule matches verb + noun; the exact match wins despite lower
        // priority
        let intent = classifier().classify("draw an image of a voice recorder");
        assert_eq!(intent.kind, IntentKind::Image);
        assert_eq!(intent.confidence, EXACT_CONFIDENCE);
    }

    #[test]
    fn test_case_insensitive() {
        let intent = classifier().classify("MAKE ME A SONG ABOUT RUST");
        assert_eq!(intent.kind, IntentKind::Music);
        assert_eq!(intent.confidence, EXACT_CONFIDENCE);
    }

    #[test]
    fn test_keywords_respect_word_boundaries() {
        // "essay" contains "say" but must not trigger the voice rule
        let intent = classifier().classify("an essay on economics");
        assert_eq!(intent.kind, IntentKind::Chat);
    }

    #[test]
    fn test_code_request() {
        let intent = classifier().classify("write a function that reverses a list");
        assert_eq!(intent.kind, IntentKind::Code);
        assert_eq!(intent.confidence, EXACT_CONFIDENCE);
    }
}
