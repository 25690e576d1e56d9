//! Transcript reconciliation
//!
//! The recognizer streams partial results that either replace the latest
//! partial (`rpl`) or append a new one (`apd`), followed by final results.
//! [`Transcript`] folds them into committed segments plus one pending group,
//! and [`StopPhrases`] scans the combined text for stop commands.

use smallvec::SmallVec;

/// Sentence punctuation the recognizer emits, full-width and ASCII.
const PUNCTUATION: &[char] = &['，', '。', '！', '？', '、', '；', '：', ',', '.', '!', '?', ';', ':'];

pub fn is_punctuation(c: char) -> bool {
    PUNCTUATION.contains(&c)
}

/// True when the text has at least one punctuation mark and nothing else but whitespace.
pub fn is_punctuation_only(text: &str) -> bool {
    let mut seen = false;
    for c in text.chars() {
        if is_punctuation(c) {
            seen = true;
        } else if !c.is_whitespace() {
            return false;
        }
    }
    seen
}

/// How a partial result relates to the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    New,
    Replace,
    Append,
}

impl FragmentKind {
    /// Map the recognizer's `pgs` field. Anything unknown behaves like append.
    pub fn from_pgs(pgs: Option<&str>) -> Self {
        match pgs {
            Some("rpl") => FragmentKind::Replace,
            Some("apd") => FragmentKind::Append,
            _ => FragmentKind::New,
        }
    }
}

/// One incremental recognition update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub is_final: bool,
    pub kind: FragmentKind,
}

impl Fragment {
    pub fn partial(text: &str, kind: FragmentKind) -> Self {
        Self {
            text: text.to_string(),
            is_final: false,
            kind,
        }
    }

    pub fn final_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            is_final: true,
            kind: FragmentKind::New,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedSegment {
    pub text: String,
    /// The segment closes with sentence punctuation
    pub sentence_ended: bool,
}

impl CommittedSegment {
    fn new(text: String) -> Self {
        let sentence_ended = text.trim_end().chars().last().is_some_and(is_punctuation);
        Self { text, sentence_ended }
    }
}

/// Committed segments plus the single pending group of partial slots.
///
/// Only the latest pending slot is shown in [`combined`](Self::combined);
/// earlier append slots are kept but never displayed or committed.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    committed: Vec<CommittedSegment>,
    pending: SmallVec<[String; 4]>,
    sealed: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment in. Returns whether the transcript changed.
    pub fn apply(&mut self, fragment: &Fragment) -> bool {
        if self.sealed || fragment.text.is_empty() {
            return false;
        }

        if fragment.is_final {
            self.apply_final(&fragment.text);
            return true;
        }

        match fragment.kind {
            FragmentKind::Replace => match self.pending.last_mut() {
                Some(slot) => *slot = fragment.text.clone(),
                None => self.pending.push(fragment.text.clone()),
            },
            FragmentKind::Append | FragmentKind::New => self.pending.push(fragment.text.clone()),
        }
        true
    }

    fn apply_final(&mut self, text: &str) {
        if is_punctuation_only(text) {
            let punct = text.trim();
            // Pending text is newer than any committed segment, so it takes the mark.
            if let Some(latest) = self.pending.pop() {
                self.pending.clear();
                self.committed.push(CommittedSegment::new(latest + punct));
                return;
            }
            if let Some(last) = self.committed.last_mut() {
                if !last.sentence_ended {
                    last.text.push_str(punct);
                    last.sentence_ended = true;
                    return;
                }
            }
        }

        self.pending.clear();
        self.committed.push(CommittedSegment::new(text.to_string()));
    }

    /// Committed text followed by the latest pending slot.
    pub fn combined(&self) -> String {
        let mut out: String = self.committed.iter().map(|s| s.text.as_str()).collect();
        if let Some(latest) = self.pending.last() {
            out.push_str(latest);
        }
        out
    }

    pub fn committed(&self) -> &[CommittedSegment] {
        &self.committed
    }

    pub fn pending_slots(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combined().trim().is_empty()
    }

    /// Close the utterance. Every later fragment is ignored.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Phrases that end the dialogue when they show up in the transcript.
#[derive(Debug, Clone, Default)]
pub struct StopPhrases {
    phrases: Vec<String>,
}

impl StopPhrases {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.trim().is_empty())
                .collect(),
        }
    }

    /// First configured phrase found anywhere in `text`.
    pub fn find(&self, text: &str) -> Option<&str> {
        self.phrases
            .iter()
            .find(|p| text.contains(p.as_str()))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}
