//! Token-bounded text chunking.
//!
//! Text is split into atomic units (paragraphs or words) which are then packed
//! greedily, in order, into chunks whose token count stays within a budget.
//! Units are never split further, so one oversized unit becomes an oversized
//! chunk of its own. The budget is a target, not a hard cap.

use crate::tokenizer::{Result, Tokenizer};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

/// A newline, any run of whitespace (including further newlines), a newline.
static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid blank-line regex"));

/// The atomic unit text is split into before packing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Blank-line separated paragraphs, trimmed, empty ones dropped.
    #[default]
    Paragraph,
    /// Whitespace separated words.
    Word,
}

impl Granularity {
    /// String placed between units when they are joined into a chunk.
    pub fn separator(&self) -> &'static str {
        match self {
            Granularity::Paragraph => "\n\n",
            Granularity::Word => " ",
        }
    }

    /// Splits `text` into units, lazily and in document order.
    pub fn units<'a>(&self, text: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        match self {
            Granularity::Paragraph => Box::new(
                BLANK_LINE
                    .split(text)
                    .map(str::trim)
                    .filter(|para| !para.is_empty()),
            ),
            Granularity::Word => Box::new(text.split_whitespace()),
        }
    }

    pub fn split<'a>(&self, text: &'a str) -> Vec<&'a str> {
        self.units(text).collect()
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Paragraph => f.write_str("paragraph"),
            Granularity::Word => f.write_str("word"),
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paragraph" | "para" => Ok(Granularity::Paragraph),
            "word" => Ok(Granularity::Word),
            other => Err(format!(
                "unknown granularity '{other}' (expected 'paragraph' or 'word')"
            )),
        }
    }
}

/// Splits documents into chunks of at most `max_tokens` tokens.
///
/// # Example
///
/// ```
/// use dormouse_core::chunker::{Chunker, Granularity};
/// use dormouse_core::tokenizer::WhitespaceTokenizer;
/// use std::sync::Arc;
///
/// let chunker = Chunker::new(Arc::new(WhitespaceTokenizer), 3, Granularity::Word);
/// let chunks = chunker.chunk("one two three four five").unwrap();
/// assert_eq!(chunks, vec!["one two three", "four five"]);
/// ```
#[derive(Clone)]
pub struct Chunker {
    tokenizer: Arc<dyn Tokenizer>,
    max_tokens: usize,
    granularity: Granularity,
}

impl Chunker {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, max_tokens: usize, granularity: Granularity) -> Self {
        Self {
            tokenizer,
            max_tokens,
            granularity,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Lazily yields the chunks of `text`.
    ///
    /// A tokenizer error is yielded once and ends the sequence.
    pub fn chunks<'a>(&'a self, text: &'a str) -> Chunks<'a> {
        Chunks {
            units: self.granularity.units(text),
            tokenizer: self.tokenizer.as_ref(),
            max_tokens: self.max_tokens,
            separator: self.granularity.separator(),
            current: Vec::new(),
            current_tokens: 0,
            original: text,
            emitted: false,
            finished: false,
        }
    }

    /// Collects every chunk of `text`. Never returns an empty vector.
    pub fn chunk(&self, text: &str) -> Result<Vec<String>> {
        self.chunks(text).collect()
    }
}

/// Iterator returned by [`Chunker::chunks`].
pub struct Chunks<'a> {
    units: Box<dyn Iterator<Item = &'a str> + 'a>,
    tokenizer: &'a dyn Tokenizer,
    max_tokens: usize,
    separator: &'static str,
    current: Vec<&'a str>,
    current_tokens: usize,
    original: &'a str,
    emitted: bool,
    finished: bool,
}

impl Chunks<'_> {
    fn close_current(&mut self) -> String {
        self.emitted = true;
        let chunk = self.current.join(self.separator);
        self.current.clear();
        chunk
    }
}

impl Iterator for Chunks<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        for unit in self.units.by_ref() {
            let tokens = match self.tokenizer.count_tokens(unit) {
                Ok(tokens) => tokens,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };

            if self.current_tokens + tokens > self.max_tokens && !self.current.is_empty() {
                let chunk = self.close_current();
                self.current.push(unit);
                self.current_tokens = tokens;
                return Some(Ok(chunk));
            }

            self.current.push(unit);
            self.current_tokens += tokens;
        }

        self.finished = true;

        if !self.current.is_empty() {
            return Some(Ok(self.close_current()));
        }

        // Nothing survived splitting: hand back the text untouched rather than
        // silently dropping the document.
        if !self.emitted {
            self.emitted = true;
            return Some(Ok(self.original.to_string()));
        }

        None
    }
}
