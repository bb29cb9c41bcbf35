//! Detects moved code blocks in unified diffs using fuzzy line matching.
//!
//! `moved_blocks` looks at the removed and added lines of a diff and finds
//! contiguous runs of lines that were deleted in one place and re-appear
//! (possibly re-indented or slightly edited) somewhere else. Code-review
//! tooling can use this to visually separate genuinely new or deleted code
//! from code that merely moved.
//!
//! ## Getting Started
//!
//! The entry point is [`detect_moved_blocks`]: hand it the removed and added
//! line records of a diff together with a mapping function that turns each
//! record into a [`Line`], and it returns the detected [`MatchingBlock`]s.
//!
//! ```rust
//! use moved_blocks::{detect_moved_blocks, Line, LineRecordError};
//!
//! # fn main() -> Result<(), LineRecordError> {
//! // (file, line number, text) triples as they might come out of a diff parser.
//! let removed = vec![
//!     ("old/util.py", 40, "def greet(name):"),
//!     ("old/util.py", 41, "    message = f\"hello {name}\""),
//!     ("old/util.py", 42, "    return message"),
//! ];
//! let added = vec![
//!     ("new/greeting.py", 3, "def greet(name):"),
//!     ("new/greeting.py", 4, "    message = f\"hello {name}\""),
//!     ("new/greeting.py", 5, "    return message"),
//! ];
//!
//! let blocks = detect_moved_blocks(&removed, &added, |&(file, line_no, text)| {
//!     Ok::<_, LineRecordError>(Line::new(file, line_no, text))
//! })?;
//!
//! assert_eq!(blocks.len(), 1);
//! let block = &blocks[0];
//! assert_eq!(block.first_removed_line().line_no(), 40);
//! assert_eq!(block.last_removed_line().line_no(), 42);
//! assert_eq!(block.first_added_line().line_no(), 3);
//! assert_eq!(block.last_added_line().line_no(), 5);
//! assert_eq!(block.non_blank_line_count(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### The Detection Sweep
//!
//! Detection is a single synchronous in-memory pass:
//!
//! 1. Added lines are loaded into an [`ApproximateTextIndex`] keyed by their
//!    trimmed text, so each removed line can be looked up exactly or fuzzily.
//! 2. Removed lines are consumed strictly in ascending `(file, line_no)`
//!    order. Each candidate (removed, added) pair either extends an open
//!    [`MatchingBlock`] or seeds a new one. A block that is not extended
//!    during a round is closed and never reopened.
//! 3. Blank lines never carry information on their own: they pad open blocks
//!    on either side without fragmenting them and contribute nothing to a
//!    block's weight.
//! 4. Closed blocks are trimmed of trailing blank padding, gated by minimum
//!    size ([`MIN_WEIGHTED_LINE_COUNT`], [`MIN_CHAR_COUNT`]), and blocks
//!    fully nested inside larger, heavier blocks are suppressed.
//!
//! ### Indentation Shifts
//!
//! Moved code is frequently re-indented at its destination. When a block is
//! seeded, the whitespace delta between its first removed and added lines is
//! captured as an [`Indentation`]; every later line pair must reproduce the
//! same delta for the block to keep growing. A run whose indentation shift
//! changes halfway through splits into separate blocks at that point.
//!
//! ### Fuzzy Line Matching
//!
//! Lines are matched by trimmed text, not byte-for-byte. The default index
//! ([`NgramIndex`]) prunes candidates through a character n-gram inverted
//! map and scores them with a character-level similarity ratio; anything at
//! or above [`SIMILARITY_THRESHOLD`] is considered a possible counterpart,
//! and the match probability feeds the block's weighted line count. A custom
//! matcher can be injected through [`MovedBlockDetector::with_index`].
//!
//! The detector performs no I/O and is fully deterministic: identical inputs
//! always produce identical block lists.

use log::{debug, trace};
use similar::TextDiff;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use thiserror::Error;
use twox_hash::XxHash64;

/// Similarity a candidate added line must reach to be considered a
/// counterpart of a removed line.
pub const SIMILARITY_THRESHOLD: f64 = 0.5;

/// Minimum summed match probability over non-blank lines for a block to
/// survive filtering.
pub const MIN_WEIGHTED_LINE_COUNT: f64 = 2.0;

/// Minimum total character count (per line, the longer of the two trimmed
/// sides) for a block to survive filtering.
pub const MIN_CHAR_COUNT: usize = 30;

// --- Error Types ---

/// Represents errors produced when reconstructing a [`Line`] from pre-split
/// record parts.
///
/// These are caller contract violations: a record that fails here must be
/// rejected before detection, never coerced into something plausible.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineRecordError {
    /// The record carried no file identifier.
    #[error("line record has an empty file identifier")]
    EmptyFile,
    /// Line numbers are 1-based; zero is never a valid position.
    #[error("line number must be positive")]
    NonPositiveLineNumber,
    /// The `leading_whitespace` part contained a non-whitespace character.
    #[error("leading whitespace contains non-whitespace characters: {0:?}")]
    InvalidLeadingWhitespace(String),
    /// The `trim_text` part still started with whitespace.
    #[error("trimmed text starts with whitespace: {0:?}")]
    UntrimmedText(String),
}

// --- Data Structures ---

/// A single line of a diff, normalized for matching.
///
/// A `Line` is built once from a raw record and never mutated. Its text is
/// split into the leading whitespace and the trimmed remainder so that
/// indentation shifts can be tracked separately from content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    file: String,
    line_no: u32,
    trim_text: String,
    leading_whitespace: String,
    content_hash: u64,
}

impl Line {
    /// Creates a `Line` from raw text, splitting off the leading whitespace.
    ///
    /// A whitespace-only `raw_text` produces a *blank* line (empty
    /// [`trim_text`](Self::trim_text)).
    ///
    /// # Example
    ///
    /// ```
    /// # use moved_blocks::Line;
    /// let line = Line::new("src/app.py", 7, "    return total");
    /// assert_eq!(line.leading_whitespace(), "    ");
    /// assert_eq!(line.trim_text(), "return total");
    /// assert!(!line.is_blank());
    ///
    /// let blank = Line::new("src/app.py", 8, "   ");
    /// assert!(blank.is_blank());
    /// ```
    pub fn new(file: impl Into<String>, line_no: u32, raw_text: &str) -> Self {
        let trim_text = raw_text.trim_start();
        let leading_whitespace = &raw_text[..raw_text.len() - trim_text.len()];
        Self {
            file: file.into(),
            line_no,
            trim_text: trim_text.to_string(),
            leading_whitespace: leading_whitespace.to_string(),
            content_hash: hash_text(trim_text),
        }
    }

    /// Reconstructs a `Line` from already-split record parts, as shipped by a
    /// transport layer (`{file, line_no, leading_whitespace, trim_text}`).
    ///
    /// Unlike [`Line::new`], this validates the parts instead of trusting
    /// them: malformed records are rejected with a [`LineRecordError`].
    ///
    /// # Example
    ///
    /// ```
    /// # use moved_blocks::{Line, LineRecordError};
    /// let line = Line::from_parts("src/app.py", 7, "    ", "return total")?;
    /// assert_eq!(line.text(), "    return total");
    ///
    /// assert!(Line::from_parts("src/app.py", 0, "", "x").is_err());
    /// assert!(Line::from_parts("src/app.py", 7, "", "  padded").is_err());
    /// # Ok::<(), LineRecordError>(())
    /// ```
    pub fn from_parts(
        file: impl Into<String>,
        line_no: u32,
        leading_whitespace: &str,
        trim_text: &str,
    ) -> Result<Self, LineRecordError> {
        let file = file.into();
        if file.is_empty() {
            return Err(LineRecordError::EmptyFile);
        }
        if line_no == 0 {
            return Err(LineRecordError::NonPositiveLineNumber);
        }
        if !leading_whitespace.chars().all(char::is_whitespace) {
            return Err(LineRecordError::InvalidLeadingWhitespace(
                leading_whitespace.to_string(),
            ));
        }
        if trim_text.starts_with(char::is_whitespace) {
            return Err(LineRecordError::UntrimmedText(trim_text.to_string()));
        }
        Ok(Self {
            file,
            line_no,
            trim_text: trim_text.to_string(),
            leading_whitespace: leading_whitespace.to_string(),
            content_hash: hash_text(trim_text),
        })
    }

    /// The identifier of the file this line belongs to.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// The 1-based line number within [`file`](Self::file).
    pub fn line_no(&self) -> u32 {
        self.line_no
    }

    /// The line's text with leading whitespace stripped.
    pub fn trim_text(&self) -> &str {
        &self.trim_text
    }

    /// The whitespace prefix stripped from the raw text.
    pub fn leading_whitespace(&self) -> &str {
        &self.leading_whitespace
    }

    /// A hash of [`trim_text`](Self::trim_text), usable for cheap exact
    /// bucketing of identical line content.
    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }

    /// Whether the line holds no content beyond whitespace.
    pub fn is_blank(&self) -> bool {
        self.trim_text.is_empty()
    }

    /// The full line text, reassembled from its parts.
    pub fn text(&self) -> String {
        format!("{}{}", self.leading_whitespace, self.trim_text)
    }

    /// True iff `other` is the line directly below this one in the same file.
    pub fn is_immediately_before(&self, other: &Line) -> bool {
        self.file == other.file && self.line_no + 1 == other.line_no
    }

    /// Computes the indentation shift between this (removed) line and its
    /// added counterpart.
    ///
    /// # Example
    ///
    /// ```
    /// # use moved_blocks::{IndentationDirection, Line};
    /// let removed = Line::new("a.py", 3, "        value += 1");
    /// let added = Line::new("b.py", 9, "    value += 1");
    /// let indentation = removed.indentation_change(&added);
    /// assert_eq!(indentation.whitespace(), "    ");
    /// assert_eq!(indentation.direction(), IndentationDirection::Removed);
    /// ```
    pub fn indentation_change(&self, added: &Line) -> Indentation {
        let removed_len = self.leading_whitespace.chars().count();
        let added_len = added.leading_whitespace.chars().count();
        if removed_len > added_len {
            Indentation {
                whitespace: self
                    .leading_whitespace
                    .chars()
                    .take(removed_len - added_len)
                    .collect(),
                direction: IndentationDirection::Removed,
            }
        } else {
            Indentation {
                whitespace: added
                    .leading_whitespace
                    .chars()
                    .take(added_len - removed_len)
                    .collect(),
                direction: IndentationDirection::Added,
            }
        }
    }
}

/// Which side of the diff carries the extra leading whitespace of an
/// indentation shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndentationDirection {
    /// The added side is indented deeper than the removed side.
    Added,
    /// The removed side is indented deeper than the added side.
    Removed,
}

/// The whitespace delta between the removed and added side of a block.
///
/// Computed once from the block's first line pair and fixed for the block's
/// entire lifetime: every further pair must reproduce the same shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indentation {
    whitespace: String,
    direction: IndentationDirection,
}

impl Indentation {
    /// The extra whitespace present on the deeper-indented side.
    pub fn whitespace(&self) -> &str {
        &self.whitespace
    }

    /// Which side carries the extra whitespace.
    pub fn direction(&self) -> IndentationDirection {
        self.direction
    }

    /// Checks whether a (removed, added) pair reproduces this shift.
    ///
    /// Blank lines never break indentation continuity: if either side is
    /// blank the pair is always compatible.
    pub fn holds_for(&self, removed: &Line, added: &Line) -> bool {
        if removed.is_blank() || added.is_blank() {
            return true;
        }
        match self.direction {
            IndentationDirection::Removed => removed
                .leading_whitespace
                .strip_prefix(self.whitespace.as_str())
                .is_some_and(|rest| rest == added.leading_whitespace),
            IndentationDirection::Added => added
                .leading_whitespace
                .strip_prefix(self.whitespace.as_str())
                .is_some_and(|rest| rest == removed.leading_whitespace),
        }
    }
}

/// One row of a [`MatchingBlock`]: a removed line, its added counterpart, and
/// the similarity the pair was matched with.
///
/// One side is `None` only for the blank padding rows inserted when a blank
/// line exists on one side of the block but not the other.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchingLine {
    /// The removed-side line, absent for added-only blank padding.
    pub removed: Option<Line>,
    /// The added-side line, absent for removed-only blank padding.
    pub added: Option<Line>,
    /// Similarity of the pair in `[0, 1]`; `0` for blank padding.
    pub match_probability: f64,
}

/// A detected run of corresponding removed and added lines.
///
/// A block is grown one line pair at a time while the removed-line sweep
/// proceeds; once it fails to extend for a round it is closed and no longer
/// grows (apart from the final trailing-blank trim).
///
/// # Example
///
/// ```
/// # use moved_blocks::{Line, MatchingBlock};
/// let removed = Line::new("old.rs", 10, "fn total(items: &[u32]) -> u32 {");
/// let added = Line::new("new.rs", 4, "fn total(items: &[u32]) -> u32 {");
/// let mut block = MatchingBlock::new(removed, added, 1.0);
///
/// let next_removed = Line::new("old.rs", 11, "    items.iter().sum()");
/// let next_added = Line::new("new.rs", 5, "    items.iter().sum()");
/// assert!(block.try_extend(&next_removed, &next_added, 1.0));
/// assert_eq!(block.non_blank_line_count(), 2);
///
/// // The same pair cannot extend the block twice.
/// assert!(!block.try_extend(&next_removed, &next_added, 1.0));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MatchingBlock {
    lines: Vec<MatchingLine>,
    last_removed_line: Line,
    last_added_line: Line,
    indentation: Indentation,
    non_blank_line_count: usize,
    weighted_line_count: f64,
}

impl MatchingBlock {
    /// Seeds a new block from its first (removed, added) pair, capturing the
    /// pair's indentation shift as the block's invariant.
    pub fn new(removed: Line, added: Line, match_probability: f64) -> Self {
        let indentation = removed.indentation_change(&added);
        let blank = removed.is_blank();
        Self {
            lines: vec![MatchingLine {
                removed: Some(removed.clone()),
                added: Some(added.clone()),
                match_probability,
            }],
            last_removed_line: removed,
            last_added_line: added,
            indentation,
            non_blank_line_count: usize::from(!blank),
            weighted_line_count: if blank { 0.0 } else { match_probability },
        }
    }

    /// Attempts to grow the block with another (removed, added) pair.
    ///
    /// Succeeds iff the pair reproduces the block's indentation shift and
    /// both lines directly follow the block's current anchors. Returns
    /// whether the block was extended.
    pub fn try_extend(&mut self, removed: &Line, added: &Line, match_probability: f64) -> bool {
        if !self.indentation.holds_for(removed, added) {
            return false;
        }
        if !self.last_removed_line.is_immediately_before(removed)
            || !self.last_added_line.is_immediately_before(added)
        {
            return false;
        }
        if !removed.is_blank() {
            self.non_blank_line_count += 1;
            self.weighted_line_count += match_probability;
        }
        self.lines.push(MatchingLine {
            removed: Some(removed.clone()),
            added: Some(added.clone()),
            match_probability,
        });
        self.last_removed_line = removed.clone();
        self.last_added_line = added.clone();
        true
    }

    /// Pads the block with a blank line that exists only on the added side.
    fn extend_with_blank_added(&mut self, line: Line) {
        self.lines.push(MatchingLine {
            removed: None,
            added: Some(line.clone()),
            match_probability: 0.0,
        });
        self.last_added_line = line;
    }

    /// Pads the block with a blank line that exists only on the removed side.
    fn extend_with_blank_removed(&mut self, line: Line) {
        self.lines.push(MatchingLine {
            removed: Some(line.clone()),
            added: None,
            match_probability: 0.0,
        });
        self.last_removed_line = line;
    }

    /// Drops trailing rows that are blank or absent on both sides and
    /// re-derives the line anchors from the retained rows.
    fn trim_trailing_blank_lines(&mut self) {
        let mut trimmed = false;
        while let Some(last) = self.lines.last() {
            let removed_blank = last.removed.as_ref().map_or(true, Line::is_blank);
            let added_blank = last.added.as_ref().map_or(true, Line::is_blank);
            if removed_blank && added_blank {
                self.lines.pop();
                trimmed = true;
            } else {
                break;
            }
        }
        if trimmed {
            self.last_removed_line = self
                .lines
                .iter()
                .rev()
                .find_map(|l| l.removed.clone())
                .expect("a block always retains its seeding line pair");
            self.last_added_line = self
                .lines
                .iter()
                .rev()
                .find_map(|l| l.added.clone())
                .expect("a block always retains its seeding line pair");
        }
    }

    /// The block's rows in sweep order.
    pub fn lines(&self) -> &[MatchingLine] {
        &self.lines
    }

    /// The first removed line of the block.
    pub fn first_removed_line(&self) -> &Line {
        self.lines
            .iter()
            .find_map(|l| l.removed.as_ref())
            .expect("a block always holds at least one removed line")
    }

    /// The first added line of the block.
    pub fn first_added_line(&self) -> &Line {
        self.lines
            .iter()
            .find_map(|l| l.added.as_ref())
            .expect("a block always holds at least one added line")
    }

    /// The most recent removed-side anchor.
    pub fn last_removed_line(&self) -> &Line {
        &self.last_removed_line
    }

    /// The most recent added-side anchor.
    pub fn last_added_line(&self) -> &Line {
        &self.last_added_line
    }

    /// The file the block was removed from.
    pub fn removed_file(&self) -> &str {
        self.last_removed_line.file()
    }

    /// The file the block was added to.
    pub fn added_file(&self) -> &str {
        self.last_added_line.file()
    }

    /// The indentation shift captured from the block's first line pair.
    pub fn indentation(&self) -> &Indentation {
        &self.indentation
    }

    /// Number of rows whose removed side carries actual content.
    pub fn non_blank_line_count(&self) -> usize {
        self.non_blank_line_count
    }

    /// Sum of match probabilities over non-blank rows; the block's primary
    /// size signal.
    pub fn weighted_line_count(&self) -> f64 {
        self.weighted_line_count
    }

    /// Total character count of the block: per row, the longer of the two
    /// trimmed sides.
    pub fn char_count(&self) -> usize {
        self.lines
            .iter()
            .map(|l| {
                let removed_len = l.removed.as_ref().map_or(0, |r| r.trim_text.chars().count());
                let added_len = l.added.as_ref().map_or(0, |a| a.trim_text.chars().count());
                removed_len.max(added_len)
            })
            .sum()
    }
}

impl fmt::Display for MatchingBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block(removed {}:{}-{}, added {}:{}-{})",
            self.removed_file(),
            self.first_removed_line().line_no(),
            self.last_removed_line.line_no(),
            self.added_file(),
            self.first_added_line().line_no(),
            self.last_added_line.line_no(),
        )
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(text.as_bytes());
    hasher.finish()
}

// --- Approximate Text Index ---

/// A lookup structure over the added lines' trimmed texts.
///
/// This is the pluggable seam of the detector: any matcher that can answer
/// "which known texts resemble this one, and how closely" satisfies it.
pub trait ApproximateTextIndex {
    /// Registers a text with the index. Inserting the same text twice is a
    /// no-op.
    fn insert(&mut self, text: &str);

    /// Returns `(similarity, matched_text)` pairs for every indexed text
    /// whose similarity to `text` is at least `threshold`, ordered by
    /// descending similarity with ties in insertion order. An exact hit
    /// short-circuits to a single `(1.0, text)` entry. Returns an empty
    /// vector when nothing clears the threshold.
    fn query(&self, text: &str, threshold: f64) -> Vec<(f64, String)>;
}

const GRAM_SIZE_LOWER: usize = 2;
const GRAM_SIZE_UPPER: usize = 3;

/// The default [`ApproximateTextIndex`]: a character n-gram inverted index
/// with similarity-ratio scoring.
///
/// Texts are lowercased and padded with `-` sentinels before being cut into
/// n-grams (sizes 3 and 2). A query collects every indexed text sharing at
/// least one n-gram with it, larger grams tried first, and scores the
/// candidates with a character-level diff ratio.
///
/// # Example
///
/// ```
/// # use moved_blocks::{ApproximateTextIndex, NgramIndex, SIMILARITY_THRESHOLD};
/// let mut index = NgramIndex::new();
/// index.insert("let total = items.iter().sum();");
///
/// let hits = index.query("let total = items.iter().sum();", SIMILARITY_THRESHOLD);
/// assert_eq!(hits, vec![(1.0, "let total = items.iter().sum();".to_string())]);
///
/// let fuzzy = index.query("let total = items.iter().count();", SIMILARITY_THRESHOLD);
/// assert_eq!(fuzzy.len(), 1);
/// assert!(fuzzy[0].0 >= SIMILARITY_THRESHOLD && fuzzy[0].0 < 1.0);
/// ```
#[derive(Debug, Default)]
pub struct NgramIndex {
    /// Lowercased text -> id. Texts are deduplicated case-insensitively;
    /// the first spelling seen wins.
    exact: HashMap<String, usize>,
    /// id -> original text as first inserted.
    texts: Vec<String>,
    /// id -> lowercased text, kept for scoring.
    lowered: Vec<String>,
    /// n-gram -> ids of the texts containing it. Grams of different sizes
    /// cannot collide (the key length distinguishes them).
    grams: HashMap<String, Vec<usize>>,
}

impl NgramIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct texts in the index.
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    /// Whether the index holds no texts.
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

impl ApproximateTextIndex for NgramIndex {
    fn insert(&mut self, text: &str) {
        let lowered = text.to_lowercase();
        if self.exact.contains_key(&lowered) {
            return;
        }
        let id = self.texts.len();
        for size in GRAM_SIZE_LOWER..=GRAM_SIZE_UPPER {
            for gram in char_ngrams(&lowered, size) {
                let ids = self.grams.entry(gram).or_default();
                // A gram repeated within one text must not list the text twice.
                if ids.last() != Some(&id) {
                    ids.push(id);
                }
            }
        }
        self.texts.push(text.to_string());
        self.lowered.push(lowered.clone());
        self.exact.insert(lowered, id);
    }

    fn query(&self, text: &str, threshold: f64) -> Vec<(f64, String)> {
        let lowered = text.to_lowercase();
        if let Some(&id) = self.exact.get(&lowered) {
            return vec![(1.0, self.texts[id].clone())];
        }
        for size in (GRAM_SIZE_LOWER..=GRAM_SIZE_UPPER).rev() {
            let mut candidate_ids: Vec<usize> = char_ngrams(&lowered, size)
                .into_iter()
                .filter_map(|gram| self.grams.get(&gram))
                .flatten()
                .copied()
                .collect();
            candidate_ids.sort_unstable();
            candidate_ids.dedup();

            let mut results: Vec<(f64, usize)> = candidate_ids
                .into_iter()
                .map(|id| {
                    let ratio =
                        TextDiff::from_chars(self.lowered[id].as_str(), lowered.as_str()).ratio();
                    (f64::from(ratio), id)
                })
                .filter(|&(score, _)| score >= threshold)
                .collect();
            if !results.is_empty() {
                // Stable sort keeps equal-score candidates in insertion order.
                results.sort_by(|a, b| b.0.total_cmp(&a.0));
                return results
                    .into_iter()
                    .map(|(score, id)| (score, self.texts[id].clone()))
                    .collect();
            }
        }
        Vec::new()
    }
}

/// Cuts `text` into character n-grams of `size`, padded with `-` sentinels on
/// both ends.
fn char_ngrams(text: &str, size: usize) -> Vec<String> {
    let padded: Vec<char> = std::iter::once('-')
        .chain(text.chars())
        .chain(std::iter::once('-'))
        .collect();
    if padded.len() < size {
        return Vec::new();
    }
    padded.windows(size).map(|w| w.iter().collect()).collect()
}

// --- Core Logic ---

/// Detects moved blocks between the removed and added lines of a diff.
///
/// This is the one-shot convenience wrapper around [`MovedBlockDetector`]:
/// it maps every raw record to a [`Line`] with `to_line`, surfacing the first
/// mapping error, and runs detection with the default [`NgramIndex`].
///
/// `removed` must already be ordered by ascending `(file, line_no)`; this is
/// a precondition, the records are not re-sorted.
///
/// See the [crate docs](crate) for a complete example.
pub fn detect_moved_blocks<R, E, F>(
    removed: &[R],
    added: &[R],
    to_line: F,
) -> Result<Vec<MatchingBlock>, E>
where
    F: Fn(&R) -> Result<Line, E>,
{
    Ok(MovedBlockDetector::from_records(removed, added, to_line)?.detect_moved_blocks())
}

/// The moved-block detection state machine.
///
/// Holds the removed lines to sweep and the added-line lookup structures:
/// an exact bucket map from trimmed text to lines, a by-position map used to
/// pad blocks across blank added lines, and the approximate text index.
#[derive(Debug)]
pub struct MovedBlockDetector<I = NgramIndex> {
    removed_lines: Vec<Line>,
    added_lines_by_text: HashMap<String, Vec<Line>>,
    added_lines_by_position: HashMap<String, HashMap<u32, Line>>,
    index: I,
}

impl MovedBlockDetector<NgramIndex> {
    /// Creates a detector over pre-built lines with the default
    /// [`NgramIndex`].
    pub fn new(removed_lines: Vec<Line>, added_lines: Vec<Line>) -> Self {
        Self::with_index(removed_lines, added_lines, NgramIndex::new())
    }

    /// Creates a detector by mapping raw records to [`Line`]s, surfacing the
    /// first mapping error.
    pub fn from_records<R, E, F>(removed: &[R], added: &[R], to_line: F) -> Result<Self, E>
    where
        F: Fn(&R) -> Result<Line, E>,
    {
        let removed_lines = removed.iter().map(&to_line).collect::<Result<_, E>>()?;
        let added_lines = added.iter().map(&to_line).collect::<Result<_, E>>()?;
        Ok(Self::new(removed_lines, added_lines))
    }
}

impl<I: ApproximateTextIndex> MovedBlockDetector<I> {
    /// Creates a detector with a caller-supplied text index. The added lines'
    /// trimmed texts are inserted into `index` before detection.
    pub fn with_index(removed_lines: Vec<Line>, added_lines: Vec<Line>, mut index: I) -> Self {
        let mut added_lines_by_text: HashMap<String, Vec<Line>> = HashMap::new();
        let mut added_lines_by_position: HashMap<String, HashMap<u32, Line>> = HashMap::new();
        for line in added_lines {
            index.insert(line.trim_text());
            added_lines_by_position
                .entry(line.file.clone())
                .or_default()
                .insert(line.line_no, line.clone());
            added_lines_by_text
                .entry(line.trim_text.clone())
                .or_default()
                .push(line);
        }
        Self {
            removed_lines,
            added_lines_by_text,
            added_lines_by_position,
            index,
        }
    }

    /// Runs the detection sweep and returns the filtered blocks.
    ///
    /// Removed lines are consumed in input order (which must be ascending
    /// `(file, line_no)`). Every round each candidate (removed, added) pair
    /// extends at most one open block or seeds a new one; blocks not
    /// extended during a round are closed. Closed blocks then pass through
    /// the size gate and containment suppression.
    pub fn detect_moved_blocks(&self) -> Vec<MatchingBlock> {
        let mut closed: Vec<MatchingBlock> = Vec::new();
        let mut open: Vec<MatchingBlock> = Vec::new();

        for removed_line in &self.removed_lines {
            trace!(
                "Removed line {}:{} ({:?})",
                removed_line.file,
                removed_line.line_no,
                removed_line.trim_text
            );
            // Blocks extended this round; they become the next round's open set.
            let mut carried: Vec<MatchingBlock> = Vec::new();

            let candidates: Vec<(f64, String)> = if removed_line.is_blank() {
                // A blank removed line matches any blank added line outright.
                vec![(1.0, String::new())]
            } else {
                // Let blocks whose added side sits before a blank run catch up
                // so the adjacency check below can see past the gap.
                for block in open.iter_mut() {
                    self.extend_with_blank_added_lines(block);
                }
                self.index
                    .query(&removed_line.trim_text, SIMILARITY_THRESHOLD)
            };
            trace!("  {} candidate text(s)", candidates.len());

            for (probability, text) in &candidates {
                let Some(added_lines) = self.added_lines_by_text.get(text) else {
                    continue;
                };
                for added_line in added_lines {
                    let mut extended_any = false;
                    // Newest blocks first; an extended block leaves the open
                    // pool so it cannot be extended twice in one round.
                    let mut i = open.len();
                    while i > 0 {
                        i -= 1;
                        if open[i].try_extend(removed_line, added_line, *probability) {
                            trace!("  extended {}", open[i]);
                            carried.push(open.remove(i));
                            extended_any = true;
                        }
                    }
                    if !extended_any && !removed_line.is_blank() {
                        trace!(
                            "  new block at {}:{} / {}:{}",
                            removed_line.file,
                            removed_line.line_no,
                            added_line.file,
                            added_line.line_no
                        );
                        carried.push(MatchingBlock::new(
                            removed_line.clone(),
                            added_line.clone(),
                            *probability,
                        ));
                    }
                }
            }

            if removed_line.is_blank() {
                // A blank removed line with no added counterpart still keeps
                // directly adjacent blocks alive as one-sided padding.
                let mut i = open.len();
                while i > 0 {
                    i -= 1;
                    if open[i]
                        .last_removed_line
                        .is_immediately_before(removed_line)
                    {
                        let mut block = open.remove(i);
                        block.extend_with_blank_removed(removed_line.clone());
                        carried.push(block);
                    }
                }
            }

            // Whatever was not extended this round is done growing.
            closed.append(&mut open);
            open = carried;
        }
        closed.append(&mut open);

        filter_blocks(closed)
    }

    /// Appends every blank added line directly following the block's added
    /// anchor as one-sided padding.
    fn extend_with_blank_added_lines(&self, block: &mut MatchingBlock) {
        loop {
            let next = {
                let last = &block.last_added_line;
                self.added_lines_by_position
                    .get(&last.file)
                    .and_then(|by_no| by_no.get(&(last.line_no + 1)))
                    .cloned()
            };
            match next {
                Some(line) if line.is_blank() => block.extend_with_blank_added(line),
                _ => break,
            }
        }
    }
}

/// Trims and size-gates closed blocks, then suppresses contained ones.
fn filter_blocks(blocks: Vec<MatchingBlock>) -> Vec<MatchingBlock> {
    let detected = blocks.len();
    let mut kept = Vec::new();
    for mut block in blocks {
        block.trim_trailing_blank_lines();
        if block.weighted_line_count >= MIN_WEIGHTED_LINE_COUNT
            && block.char_count() >= MIN_CHAR_COUNT
        {
            kept.push(block);
        }
    }
    let result = suppress_contained_blocks(kept);
    debug!(
        "Detected {} moved block(s) ({} filtered out)",
        result.len(),
        detected - result.len()
    );
    result
}

/// A block plus its removed-side domination flag, carried between the two
/// containment passes.
struct ContainmentCandidate {
    block: MatchingBlock,
    dominated_on_removed_side: bool,
}

/// Drops blocks fully nested inside larger, heavier blocks.
///
/// Duplicated code produces stacks of fully overlapping candidates (one long
/// removed run matching several added copies, or vice versa), so containment
/// is checked in both coordinate spaces:
///
/// - Pass A sweeps removed-side ranges and *flags* any block nested inside
///   the current anchor with strictly lower weight.
/// - Pass B sweeps added-side ranges and *drops* a nested block iff it was
///   flagged in Pass A. Nested-but-unflagged blocks survive: they are
///   legitimate extra copies, such as one removed run added three times.
///
/// Survivors are returned in Pass B's sweep order.
fn suppress_contained_blocks(blocks: Vec<MatchingBlock>) -> Vec<MatchingBlock> {
    let mut candidates: Vec<ContainmentCandidate> = blocks
        .into_iter()
        .map(|block| ContainmentCandidate {
            block,
            dominated_on_removed_side: false,
        })
        .collect();

    // Pass A: removed-side coordinates.
    candidates.sort_by(|a, b| {
        a.block
            .removed_file()
            .cmp(b.block.removed_file())
            .then_with(|| {
                a.block
                    .first_removed_line()
                    .line_no
                    .cmp(&b.block.first_removed_line().line_no)
            })
            .then_with(|| {
                b.block
                    .last_removed_line
                    .line_no
                    .cmp(&a.block.last_removed_line.line_no)
            })
            .then_with(|| {
                b.block
                    .weighted_line_count
                    .total_cmp(&a.block.weighted_line_count)
            })
    });
    let mut anchor = 0;
    for i in 1..candidates.len() {
        let nested = {
            let anchor_block = &candidates[anchor].block;
            let block = &candidates[i].block;
            block.removed_file() == anchor_block.removed_file()
                && block.first_removed_line().line_no >= anchor_block.first_removed_line().line_no
                && block.last_removed_line.line_no <= anchor_block.last_removed_line.line_no
        };
        if nested {
            if candidates[i].block.weighted_line_count
                < candidates[anchor].block.weighted_line_count
            {
                candidates[i].dominated_on_removed_side = true;
            }
        } else {
            anchor = i;
        }
    }

    // Pass B: added-side coordinates.
    candidates.sort_by(|a, b| {
        a.block
            .added_file()
            .cmp(b.block.added_file())
            .then_with(|| {
                a.block
                    .first_added_line()
                    .line_no
                    .cmp(&b.block.first_added_line().line_no)
            })
            .then_with(|| {
                b.block
                    .last_added_line
                    .line_no
                    .cmp(&a.block.last_added_line.line_no)
            })
            .then_with(|| {
                b.block
                    .weighted_line_count
                    .total_cmp(&a.block.weighted_line_count)
            })
    });
    let mut keep = vec![true; candidates.len()];
    let mut anchor: Option<usize> = None;
    for i in 0..candidates.len() {
        let nested = anchor.is_some_and(|a| {
            let anchor_block = &candidates[a].block;
            let block = &candidates[i].block;
            block.added_file() == anchor_block.added_file()
                && block.first_added_line().line_no >= anchor_block.first_added_line().line_no
                && block.last_added_line.line_no <= anchor_block.last_added_line.line_no
        });
        if nested {
            if candidates[i].dominated_on_removed_side {
                trace!("  suppressed {}", candidates[i].block);
                keep[i] = false;
            }
        } else {
            anchor = Some(i);
        }
    }

    candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(candidate, keep)| keep.then_some(candidate.block))
        .collect()
}
