//! Keyword heuristics for the self-reflection path.
//!
//! Deliberately shallow: these produce structured tags for events, never
//! response text.  A response-generation collaborator decides what, if
//! anything, to say about them.

/// Coarse feeling estimate attached to reflection and turn events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feeling {
    Uplifted,
    Troubled,
    Curious,
    Neutral,
}

impl Feeling {
    pub fn label(self) -> &'static str {
        match self {
            Self::Uplifted => "uplifted",
            Self::Troubled => "troubled",
            Self::Curious => "curious",
            Self::Neutral => "neutral",
        }
    }
}

const UPLIFTED: &[&str] = &["happy", "joy", "grateful", "peace", "safe", "love"];
const TROUBLED: &[&str] = &["sad", "lonely", "hurt", "scared", "worry", "doubt", "lost"];
const CURIOUS: &[&str] = &["curious", "ponder", "wonder", "seek", "why", "explore"];

/// Estimate a feeling from free text.  First matching bucket wins, in the
/// order uplifted → troubled → curious.
pub fn estimate_feeling(text: &str) -> Feeling {
    let lower = text.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if any(UPLIFTED) {
        Feeling::Uplifted
    } else if any(TROUBLED) {
        Feeling::Troubled
    } else if any(CURIOUS) {
        Feeling::Curious
    } else {
        Feeling::Neutral
    }
}

/// Extract a rough topic: the first quoted phrase if present, else the last
/// word longer than three characters, else the first word, else
/// "conversation".
pub fn extract_topic(text: &str) -> String {
    if let Some(rest) = text.split_once('"').map(|(_, rest)| rest) {
        if let Some((quoted, _)) = rest.split_once('"') {
            if !quoted.is_empty() {
                return quoted.to_string();
            }
        }
    }
    let longish: Option<&str> = text
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .next_back();
    if let Some(word) = longish {
        return word.trim_end_matches(['.', '!', '?']).to_lowercase();
    }
    text.split_whitespace()
        .next()
        .map(|w| w.to_lowercase())
        .unwrap_or_else(|| "conversation".to_string())
}
