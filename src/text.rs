//! # Sentence Segmentation
//!
//! Language model output arrives a few characters at a time, but speech synthesis sounds
//! best (and starts sooner) when it is given whole sentences or clauses. `SentenceSplitter`
//! accumulates streamed text and releases a segment at every sentence or clause boundary.
//!
//! ## Boundaries:
//! ASCII `. ! ? ; : ,` and their CJK counterparts `。 ！ ？ ； ： ， 、`.

const BOUNDARIES: &[char] = &[
    '。', '！', '？', '.', '!', '?', '，', ',', '、', ';', '；', ':', '：',
];

#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a streamed chunk and return the segments it completed.
    ///
    /// Segments are trimmed; segments that are only whitespace or punctuation are skipped.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut segments = Vec::new();
        while let Some((idx, ch)) = self.buffer.char_indices().find(|(_, c)| BOUNDARIES.contains(c)) {
            let end = idx + ch.len_utf8();
            let segment: String = self.buffer.drain(..end).collect();
            if let Some(segment) = speakable(&segment) {
                segments.push(segment);
            }
        }
        segments
    }

    /// Return whatever text remains once the stream has ended.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        speakable(&rest)
    }
}

fn speakable(segment: &str) -> Option<String> {
    let trimmed = segment.trim();
    if trimmed.chars().all(|c| c.is_whitespace() || BOUNDARIES.contains(&c)) {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_across_chunks() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Hello").is_empty());
        assert_eq!(splitter.push(" there. How"), vec!["Hello there."]);
        assert_eq!(splitter.push(" are you? Fine"), vec!["How are you?"]);
        assert_eq!(splitter.flush().as_deref(), Some("Fine"));
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn test_cjk_boundaries() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(splitter.push("你好，世界。再见"), vec!["你好，", "世界。"]);
        assert_eq!(splitter.flush().as_deref(), Some("再见"));
    }

    #[test]
    fn test_punctuation_only_segments_skipped() {
        let mut splitter = SentenceSplitter::new();
        assert_eq!(splitter.push("Wait... what?!"), vec!["Wait.", "what?"]);
        assert_eq!(splitter.flush(), None);
    }
}
