//! Size-bounded chunking over rune counts, respecting semantic boundaries.
//!
//! The default strategy packs blank-line paragraphs greedily, falling back to
//! quote-aware sentence splitting and finally forced rune splits for
//! oversized segments. The smart strategy additionally keeps fenced code
//! blocks and list runs intact. All arithmetic is over runes (chars), never
//! bytes, so boundaries are identical across platforms.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TranslateError};

static BLANK_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n+").unwrap());
static LIST_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d{1,3}[.)])\s+").unwrap());
static TABLE_SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\|?[\s:|-]+\|[\s:|-]*$").unwrap());

/// Chunker configuration in runes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,

    /// Runes of left context carried into the next chunk
    #[serde(default)]
    pub overlap: usize,
}

const DEFAULT_CHUNK_SIZE: usize = 1000;

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: 0,
        }
    }
}

impl ChunkConfig {
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(TranslateError::config("chunk size must be positive"));
        }
        if overlap >= size {
            return Err(TranslateError::config(format!(
                "overlap ({overlap}) must be less than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }
}

/// One bounded slice of input text with a stable 0-based index for reassembly
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

/// Pluggable chunking strategy
pub trait ChunkStrategy: Send + Sync {
    fn chunk(&self, text: &str) -> Vec<Chunk>;
    fn config(&self) -> &ChunkConfig;
}

pub fn rune_len(s: &str) -> usize {
    s.chars().count()
}

/// A packable piece of text plus the separator that precedes it when it is
/// appended to a non-empty chunk.
struct Segment {
    text: String,
    sep: &'static str,
}

/// Greedy packer shared by both strategies.
///
/// Segments are appended until the chunk reaches `size` runes; the chunk
/// closes after the segment that crosses the limit, so a chunk never exceeds
/// `size` plus its longest segment. When overlap is configured the next
/// chunk opens with the tail of the previous one, trimmed to a word
/// boundary.
fn pack_segments(segments: Vec<Segment>, config: &ChunkConfig) -> Vec<Chunk> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for seg in segments {
        let seg_len = rune_len(&seg.text);
        if seg_len == 0 {
            continue;
        }
        if current.is_empty() {
            current.push_str(&seg.text);
            current_len = seg_len;
        } else {
            current.push_str(seg.sep);
            current.push_str(&seg.text);
            current_len += rune_len(seg.sep) + seg_len;
        }
        if current_len >= config.size {
            let prefix = overlap_prefix(&current, config.overlap);
            chunks.push(std::mem::take(&mut current));
            current_len = rune_len(&prefix);
            current = prefix;
        }
    }

    // A trailing chunk holding only overlap context is dropped: its text is
    // already covered by the previous chunk.
    if !current.is_empty() {
        let is_pure_overlap = config.overlap > 0
            && chunks
                .last()
                .map(|prev| prev.ends_with(current.as_str()))
                .unwrap_or(false);
        if !is_pure_overlap {
            chunks.push(current);
        }
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk { index, text })
        .collect()
}

/// Last `overlap` runes of a chunk, trimmed forward to the nearest word
/// boundary so the next chunk never opens mid-word.
fn overlap_prefix(text: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= overlap {
        return text.to_string();
    }
    let cut = chars.len() - overlap;
    let mid_word = !chars[cut - 1].is_whitespace() && !chars[cut].is_whitespace();
    let tail: String = chars[cut..].iter().collect();
    if !mid_word {
        return tail.trim_start().to_string();
    }
    match tail.find(char::is_whitespace) {
        Some(ws) => tail[ws..].trim_start().to_string(),
        None => String::new(),
    }
}

/// Split a paragraph into sentences on `.!?` and CJK `。！？`, ignoring
/// enders that fall inside paired quotes.
fn split_sentences(paragraph: &str) -> Vec<String> {
    const ENDERS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut straight_quotes = 0usize;
    let mut paired_depth = 0usize;
    let mut chars = paragraph.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        match ch {
            '"' => straight_quotes += 1,
            '“' | '「' | '『' => paired_depth += 1,
            '”' | '」' | '』' => paired_depth = paired_depth.saturating_sub(1),
            _ => {}
        }
        let inside_quotes = straight_quotes % 2 == 1 || paired_depth > 0;
        if ENDERS.contains(&ch) && !inside_quotes {
            // Consume an ender run like "?!" plus a closing quote
            while let Some(&next) = chars.peek() {
                if ENDERS.contains(&next) || next == '”' || next == '」' || next == '』' {
                    if matches!(next, '”' | '」' | '』') {
                        paired_depth = paired_depth.saturating_sub(1);
                    }
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }

    let tail = current.trim().to_string();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Force-split an atomic run on rune boundaries
fn force_split(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// Break one paragraph into segments no larger than `size` runes.
/// The first segment carries the paragraph separator; followers within the
/// paragraph join with a space, and forced splits join with nothing.
fn paragraph_segments(paragraph: &str, size: usize, out: &mut Vec<Segment>) {
    if rune_len(paragraph) <= size {
        out.push(Segment {
            text: paragraph.to_string(),
            sep: "\n\n",
        });
        return;
    }
    let mut first_in_paragraph = true;
    for sentence in split_sentences(paragraph) {
        let sep = if first_in_paragraph { "\n\n" } else { " " };
        if rune_len(&sentence) <= size {
            out.push(Segment {
                text: sentence,
                sep,
            });
            first_in_paragraph = false;
        } else {
            let mut piece_sep = sep;
            for piece in force_split(&sentence, size) {
                out.push(Segment {
                    text: piece,
                    sep: piece_sep,
                });
                piece_sep = "";
            }
            first_in_paragraph = false;
        }
    }
}

fn default_segments(text: &str, size: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    for paragraph in BLANK_LINE_RE.split(text) {
        let paragraph = paragraph.trim_matches('\n');
        if paragraph.trim().is_empty() {
            continue;
        }
        paragraph_segments(paragraph, size, &mut segments);
    }
    segments
}

/// Hierarchical greedy packing: paragraphs, then sentences, then forced
/// rune splits.
pub struct DefaultChunker {
    config: ChunkConfig,
}

impl DefaultChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }
}

impl ChunkStrategy for DefaultChunker {
    fn chunk(&self, text: &str) -> Vec<Chunk> {
        pack_segments(default_segments(text, self.config.size), &self.config)
    }

    fn config(&self) -> &ChunkConfig {
        &self.config
    }
}

/// Line-level blocks recognized by the smart strategy
enum Block {
    Fence(String),
    List(String),
    Prose(String),
}

fn fence_delimiter(line: &str) -> Option<(char, usize)> {
    let trimmed = line.trim_start();
    for marker in ['`', '~'] {
        let count = trimmed.chars().take_while(|&c| c == marker).count();
        if count >= 3 {
            return Some((marker, count));
        }
    }
    None
}

fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut lines = text.lines().peekable();

    let flush_prose = |prose: &mut Vec<&str>, blocks: &mut Vec<Block>| {
        if !prose.is_empty() {
            blocks.push(Block::Prose(prose.join("\n")));
            prose.clear();
        }
    };

    while let Some(line) = lines.next() {
        if let Some((marker, width)) = fence_delimiter(line) {
            flush_prose(&mut prose, &mut blocks);
            let mut fence = vec![line];
            for inner in lines.by_ref() {
                fence.push(inner);
                if let Some((m, w)) = fence_delimiter(inner) {
                    if m == marker && w >= width {
                        break;
                    }
                }
            }
            blocks.push(Block::Fence(fence.join("\n")));
        } else if LIST_ITEM_RE.is_match(line) {
            flush_prose(&mut prose, &mut blocks);
            let mut list = vec![line];
            while let Some(&next) = lines.peek() {
                let continuation =
                    !next.trim().is_empty() && next.starts_with(char::is_whitespace);
                if LIST_ITEM_RE.is_match(next) || continuation {
                    list.push(next);
                    lines.next();
                } else {
                    break;
                }
            }
            blocks.push(Block::List(list.join("\n")));
        } else {
            prose.push(line);
        }
    }
    flush_prose(&mut prose, &mut blocks);
    blocks
}

/// Content-aware chunker: never splits across a fence, keeps a list run
/// together when it fits, and otherwise behaves like [`DefaultChunker`].
pub struct SmartChunker {
    config: ChunkConfig,
}

impl SmartChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }
}

impl ChunkStrategy for SmartChunker {
    fn chunk(&self, text: &str) -> Vec<Chunk> {
        let mut segments = Vec::new();
        for block in parse_blocks(text) {
            match block {
                // Fences are atomic even when oversized
                Block::Fence(body) => segments.push(Segment {
                    text: body,
                    sep: "\n\n",
                }),
                Block::List(body) => {
                    if rune_len(&body) <= self.config.size {
                        segments.push(Segment {
                            text: body,
                            sep: "\n\n",
                        });
                    } else {
                        segments.extend(default_segments(&body, self.config.size));
                    }
                }
                Block::Prose(body) => {
                    segments.extend(default_segments(&body, self.config.size));
                }
            }
        }
        pack_segments(segments, &self.config)
    }

    fn config(&self) -> &ChunkConfig {
        &self.config
    }
}

/// Coarse content classification for the oversized-node splitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Code,
    List,
    Table,
    Math,
    Plain,
}

pub fn detect_content_kind(text: &str) -> ContentKind {
    let trimmed = text.trim_start();
    if fence_delimiter(trimmed.lines().next().unwrap_or("")).is_some() {
        return ContentKind::Code;
    }
    if trimmed.starts_with("$$") || trimmed.starts_with(r"\[") {
        return ContentKind::Math;
    }
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() >= 2 && lines[0].contains('|') && TABLE_SEPARATOR_RE.is_match(lines[1]) {
        return ContentKind::Table;
    }
    if !lines.is_empty() {
        let list_lines = lines.iter().filter(|l| LIST_ITEM_RE.is_match(l)).count();
        if list_lines * 2 > lines.len() {
            return ContentKind::List;
        }
    }
    ContentKind::Plain
}

/// Optional pre-pass for single nodes that exceed a backend's request limit.
///
/// Plain text splits on paragraph and sentence boundaries with a
/// proportional overlap; tables repeat their header rows on every piece;
/// code is split only between fences; math nodes stay whole.
pub struct NodeSplitter {
    pub max_size: usize,
    pub overlap_ratio: f64,
}

impl NodeSplitter {
    pub fn new(max_size: usize, overlap_ratio: f64) -> Self {
        Self {
            max_size,
            overlap_ratio: overlap_ratio.clamp(0.0, 0.5),
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        if rune_len(text) <= self.max_size {
            return vec![text.to_string()];
        }
        match detect_content_kind(text) {
            ContentKind::Math => vec![text.to_string()],
            ContentKind::Code => self.split_code(text),
            ContentKind::Table => self.split_table(text),
            ContentKind::List => self.split_list(text),
            ContentKind::Plain => self.split_plain(text),
        }
    }

    fn split_plain(&self, text: &str) -> Vec<String> {
        let overlap = (self.max_size as f64 * self.overlap_ratio) as usize;
        let overlap = overlap.min(self.max_size.saturating_sub(1));
        let config = ChunkConfig {
            size: self.max_size,
            overlap,
        };
        // Smart strategy so an embedded fence inside prose stays whole
        SmartChunker::new(config)
            .chunk(text)
            .into_iter()
            .map(|c| c.text)
            .collect()
    }

    fn split_code(&self, text: &str) -> Vec<String> {
        let segments: Vec<Segment> = parse_blocks(text)
            .into_iter()
            .map(|block| match block {
                Block::Fence(body) | Block::List(body) | Block::Prose(body) => Segment {
                    text: body,
                    sep: "\n\n",
                },
            })
            .collect();
        let config = ChunkConfig {
            size: self.max_size,
            overlap: 0,
        };
        let chunks = pack_segments(segments, &config);
        if chunks.is_empty() {
            vec![text.to_string()]
        } else {
            chunks.into_iter().map(|c| c.text).collect()
        }
    }

    fn split_table(&self, text: &str) -> Vec<String> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() < 3 {
            return vec![text.to_string()];
        }
        let header = format!("{}\n{}", lines[0], lines[1]);
        let header_len = rune_len(&header);
        let mut pieces = Vec::new();
        let mut current = header.clone();
        let mut current_len = header_len;
        for row in &lines[2..] {
            let row_len = rune_len(row) + 1;
            if current_len + row_len > self.max_size && current_len > header_len {
                pieces.push(std::mem::replace(&mut current, header.clone()));
                current_len = header_len;
            }
            current.push('\n');
            current.push_str(row);
            current_len += row_len;
        }
        if current_len > header_len {
            pieces.push(current);
        }
        pieces
    }

    fn split_list(&self, text: &str) -> Vec<String> {
        let mut items: Vec<String> = Vec::new();
        for line in text.lines() {
            if LIST_ITEM_RE.is_match(line) || items.is_empty() {
                items.push(line.to_string());
            } else if let Some(last) = items.last_mut() {
                last.push('\n');
                last.push_str(line);
            }
        }
        let segments = items
            .into_iter()
            .map(|text| Segment { text, sep: "\n" })
            .collect();
        let config = ChunkConfig {
            size: self.max_size,
            overlap: 0,
        };
        pack_segments(segments, &config)
            .into_iter()
            .map(|c| c.text)
            .collect()
    }
}
