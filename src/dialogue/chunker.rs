//! Sentence buffering for streamed replies
//!
//! Content deltas are accumulated into a buffer that is flushed as one
//! [`Utterance`] once it is longer than `min_chars` and the latest fragment
//! ends a sentence. Every fragment is kept verbatim, so joining the emitted
//! utterances reproduces the reply exactly.

/// Sentence terminators used when none are configured
pub const DEFAULT_TERMINATORS: &str = "。！？!?~～.;；…";

/// When to cut the reply into speakable pieces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Flush only once the buffer holds more than this many characters
    pub min_chars: usize,

    /// Characters that end a sentence
    pub terminators: Vec<char>,
}

impl ChunkPolicy {
    #[must_use]
    pub fn is_terminator(&self, c: char) -> bool {
        self.terminators.contains(&c)
    }
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_chars: 10,
            terminators: DEFAULT_TERMINATORS.chars().collect(),
        }
    }
}

/// A speakable piece of assistant text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Position within the reply, from 0
    pub index: usize,
    pub text: String,
}

impl Utterance {
    /// Whether there is anything to synthesize
    #[must_use]
    pub fn is_speakable(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Re-chunks a delta stream into utterances
#[derive(Debug)]
pub struct UtteranceChunker {
    policy: ChunkPolicy,
    buffer: String,
    emitted: usize,
}

impl UtteranceChunker {
    #[must_use]
    pub const fn new(policy: ChunkPolicy) -> Self {
        Self {
            policy,
            buffer: String::new(),
            emitted: 0,
        }
    }

    /// Append a fragment, returning an utterance if the buffer should flush
    pub fn push(&mut self, fragment: &str) -> Option<Utterance> {
        if fragment.is_empty() {
            return None;
        }
        self.buffer.push_str(fragment);

        let ends_sentence = fragment
            .trim_end()
            .chars()
            .next_back()
            .is_some_and(|c| self.policy.is_terminator(c));

        if ends_sentence && self.buffer.chars().count() > self.policy.min_chars {
            return Some(self.flush());
        }
        None
    }

    /// Flush whatever is left at end of stream
    pub fn finish(&mut self) -> Option<Utterance> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.flush())
    }

    /// Text accumulated but not yet emitted
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Number of utterances emitted so far
    #[must_use]
    pub const fn emitted(&self) -> usize {
        self.emitted
    }

    fn flush(&mut self) -> Utterance {
        let utterance = Utterance {
            index: self.emitted,
            text: std::mem::take(&mut self.buffer),
        };
        self.emitted += 1;
        utterance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(policy: ChunkPolicy, fragments: &[&str]) -> Vec<String> {
        let mut chunker = UtteranceChunker::new(policy);
        let mut out: Vec<String> = fragments
            .iter()
            .filter_map(|f| chunker.push(f))
            .map(|u| u.text)
            .collect();
        out.extend(chunker.finish().map(|u| u.text));
        out
    }

    #[test]
    fn test_short_sentence_waits_for_threshold() {
        let policy = ChunkPolicy {
            min_chars: 5,
            ..ChunkPolicy::default()
        };
        assert_eq!(
            chunk(policy, &["你好", "！", "很高兴", "认识你。"]),
            vec!["你好！很高兴认识你。"]
        );
    }

    #[test]
    fn test_flush_on_terminator_after_threshold() {
        let policy = ChunkPolicy {
            min_chars: 3,
            ..ChunkPolicy::default()
        };
        assert_eq!(
            chunk(policy, &["Hello there", ". ", "How are", " you?", " Bye"]),
            vec!["Hello there. ", "How are you?", " Bye"]
        );
    }

    #[test]
    fn test_terminator_must_end_latest_fragment() {
        let policy = ChunkPolicy {
            min_chars: 1,
            ..ChunkPolicy::default()
        };
        // The full stop is inside the fragment, not at its end
        assert_eq!(chunk(policy, &["a. b", "c"]), vec!["a. bc"]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let policy = ChunkPolicy {
            min_chars: 3,
            terminators: vec!['!'],
        };
        let mut chunker = UtteranceChunker::new(policy);
        assert!(chunker.push("ab!").is_none());
        assert_eq!(chunker.push("c!").unwrap().text, "ab!c!");
        assert!(chunker.finish().is_none());
    }

    #[test]
    fn test_indices_are_sequential() {
        let policy = ChunkPolicy {
            min_chars: 0,
            ..ChunkPolicy::default()
        };
        let mut chunker = UtteranceChunker::new(policy);
        assert_eq!(chunker.push("one.").unwrap().index, 0);
        assert_eq!(chunker.push("two.").unwrap().index, 1);
        assert_eq!(chunker.emitted(), 2);
    }

    #[test]
    fn test_whitespace_tail_is_not_speakable() {
        let mut chunker = UtteranceChunker::new(ChunkPolicy::default());
        chunker.push("  \n");
        let tail = chunker.finish().unwrap();
        assert_eq!(tail.text, "  \n");
        assert!(!tail.is_speakable());
    }
}
