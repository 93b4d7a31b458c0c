//! Splits a finalized utterance into discrete commands

/// Separators in priority order. Earlier entries win ties.
pub const DEFAULT_SEPARATORS: [&str; 7] = [
    "and then",
    "then",
    "after that",
    "next",
    "followed by",
    ";",
    "and",
];

#[derive(Debug, Clone, PartialEq)]
pub struct CommandSegmenter {
    separators: Vec<String>,
}

impl Default for CommandSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect())
    }
}

impl CommandSegmenter {
    pub fn new(separators: Vec<String>) -> Self {
        let separators = separators
            .into_iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { separators }
    }

    /// Split `utterance` on whichever separator yields the most non-empty
    /// segments. With no applicable separator the utterance comes back as-is.
    pub fn segment(&self, utterance: &str) -> Vec<String> {
        let lowered = utterance.to_ascii_lowercase();
        let mut best: Vec<String> = Vec::new();

        for sep in &self.separators {
            let parts = split_on(utterance, &lowered, sep);
            if parts.len() > best.len() {
                best = parts;
            }
        }

        if best.len() > 1 {
            best
        } else {
            vec![utterance.to_string()]
        }
    }
}

fn is_word_separator(sep: &str) -> bool {
    sep.chars().next().is_some_and(|c| c.is_alphanumeric())
}

fn clean(segment: &str) -> &str {
    segment.trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | ';'))
}

/// `lowered` must be the ASCII-lowercased `original` so byte offsets line up.
fn split_on(original: &str, lowered: &str, sep: &str) -> Vec<String> {
    let word = is_word_separator(sep);
    let mut segments = Vec::new();
    let mut cursor = 0;

    for (at, matched) in lowered.match_indices(sep) {
        let end = at + matched.len();
        if word {
            let before = lowered[..at].chars().next_back();
            let after = lowered[end..].chars().next();
            if before.is_some_and(|c| c.is_alphanumeric()) || after.is_some_and(|c| c.is_alphanumeric()) {
                continue;
            }
        }
        segments.push(&original[cursor..at]);
        cursor = end;
    }
    segments.push(&original[cursor..]);

    segments
        .into_iter()
        .map(clean)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_and() {
        let seg = CommandSegmenter::default();
        assert_eq!(
            seg.segment("read miranda rights and request backup"),
            vec!["read miranda rights", "request backup"]
        );
    }

    #[test]
    fn single_command_is_unchanged() {
        let seg = CommandSegmenter::default();
        assert_eq!(seg.segment("Run plate ABC123"), vec!["Run plate ABC123"]);
    }

    #[test]
    fn separators_need_word_boundaries() {
        let seg = CommandSegmenter::default();
        // "and" inside "standby" and "then" inside "thence" are not separators
        assert_eq!(seg.segment("standby thence"), vec!["standby thence"]);
    }

    #[test]
    fn picks_separator_with_most_segments() {
        let seg = CommandSegmenter::default();
        assert_eq!(
            seg.segment("check id then run plate and call dispatch and log it"),
            vec!["check id then run plate", "call dispatch", "log it"]
        );
    }

    #[test]
    fn tie_goes_to_earlier_separator() {
        let seg = CommandSegmenter::default();
        assert_eq!(
            seg.segment("Open report, and then Save it"),
            vec!["Open report", "Save it"]
        );
    }

    #[test]
    fn semicolons_split() {
        let seg = CommandSegmenter::default();
        assert_eq!(
            seg.segment("lights on; siren off;"),
            vec!["lights on", "siren off"]
        );
    }

    #[test]
    fn empty_pieces_do_not_count() {
        let seg = CommandSegmenter::default();
        assert_eq!(seg.segment("and then"), vec!["and then"]);
    }
}
