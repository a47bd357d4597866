use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tokens::CHARS_PER_TOKEN;

static HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,4}[ \t]+\S.*$").expect("header pattern"));

const SOFT_BREAK_FRACTION: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub chars_per_token: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8_000,
            overlap_tokens: 200,
            chars_per_token: CHARS_PER_TOKEN,
        }
    }
}

impl ChunkConfig {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens,
            overlap_tokens,
            ..Self::default()
        }
    }

    /// Budgets are measured in bytes, which never undercount characters.
    fn budget(&self) -> usize {
        self.max_tokens.max(1) * self.chars_per_token.max(1)
    }

    fn overlap(&self) -> usize {
        (self.overlap_tokens * self.chars_per_token.max(1)).min(self.budget() / 2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub header_path: Vec<String>,
    pub text: String,
}

impl Chunk {
    pub fn label(&self) -> String {
        format!("Part {} of {}", self.index + 1, self.total)
    }

    pub fn context_line(&self) -> Option<String> {
        if self.header_path.is_empty() {
            None
        } else {
            Some(self.header_path.join(" > "))
        }
    }
}

pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Splits `text` into budget-bounded chunks. Always returns at least one chunk.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let budget = self.config.budget();
        let overlap = self.config.overlap();
        let pieces = if text.len() <= budget {
            vec![(text.to_string(), Vec::new())]
        } else {
            let sections = split_sections(text);
            if sections.is_empty() {
                window_split(text, budget, overlap)
                    .into_iter()
                    .map(|window| (window, Vec::new()))
                    .collect()
            } else {
                pack_sections(text, &sections, budget, overlap)
            }
        };
        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, (text, header_path))| Chunk {
                index,
                total,
                header_path,
                text,
            })
            .collect()
    }
}

pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    Chunker::new(ChunkConfig::new(max_tokens, overlap_tokens))
        .chunk(text)
        .into_iter()
        .map(|chunk| chunk.text)
        .collect()
}

struct Section {
    start: usize,
    end: usize,
    header_path: Vec<String>,
}

fn split_sections(text: &str) -> Vec<Section> {
    let headers: Vec<_> = HEADER.find_iter(text).collect();
    let Some(first) = headers.first() else {
        return Vec::new();
    };
    let mut sections = Vec::with_capacity(headers.len() + 1);
    if first.start() > 0 {
        sections.push(Section {
            start: 0,
            end: first.start(),
            header_path: Vec::new(),
        });
    }
    let mut stack: Vec<(usize, String)> = Vec::new();
    for (idx, found) in headers.iter().enumerate() {
        let line = found.as_str().trim_end();
        let level = line.chars().take_while(|c| *c == '#').count();
        while stack.last().is_some_and(|(open, _)| *open >= level) {
            stack.pop();
        }
        stack.push((level, line.to_string()));
        let end = headers
            .get(idx + 1)
            .map(|next| next.start())
            .unwrap_or(text.len());
        sections.push(Section {
            start: found.start(),
            end,
            header_path: stack.iter().map(|(_, header)| header.clone()).collect(),
        });
    }
    sections
}

fn pack_sections(
    text: &str,
    sections: &[Section],
    budget: usize,
    overlap: usize,
) -> Vec<(String, Vec<String>)> {
    let mut out: Vec<(String, Vec<String>)> = Vec::new();
    let mut current = String::new();
    let mut current_path: Option<Vec<String>> = None;
    let mut has_new = false;
    for section in sections {
        let piece = &text[section.start..section.end];
        if piece.len() > budget {
            if has_new {
                out.push((
                    std::mem::take(&mut current),
                    current_path.take().unwrap_or_default(),
                ));
            }
            for window in window_split(piece, budget, overlap) {
                out.push((window, section.header_path.clone()));
            }
            current = out
                .last()
                .map(|(last, _)| tail(last, overlap).to_string())
                .unwrap_or_default();
            current_path = None;
            has_new = false;
            continue;
        }
        if current.len() + piece.len() > budget {
            if has_new {
                let closed = std::mem::take(&mut current);
                current.push_str(tail(&closed, overlap.min(budget - piece.len())));
                out.push((closed, current_path.take().unwrap_or_default()));
                has_new = false;
            } else {
                current = tail(&current, budget - piece.len()).to_string();
            }
        }
        if current_path.is_none() {
            current_path = Some(section.header_path.clone());
        }
        current.push_str(piece);
        has_new = true;
    }
    if has_new {
        out.push((current, current_path.unwrap_or_default()));
    }
    if out.is_empty() {
        out.push((String::new(), Vec::new()));
    }
    out
}

fn window_split(text: &str, budget: usize, overlap: usize) -> Vec<String> {
    let len = text.len();
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < len {
        let hard_end = floor_boundary(text, (start + budget).min(len));
        let mut end = if hard_end <= start {
            // a single character wider than the budget is emitted whole
            ceil_boundary(text, start + 1)
        } else {
            hard_end
        };
        if end < len {
            end = soft_break(text, start, end);
        }
        out.push(text[start..end].to_string());
        if end >= len {
            break;
        }
        let mut next = floor_boundary(text, end.saturating_sub(overlap));
        if next <= start {
            next = end;
        }
        start = next;
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

/// Moves `end` back to a paragraph, sentence or line break found in the
/// trailing fifth of the window, if there is one.
fn soft_break(text: &str, start: usize, end: usize) -> usize {
    let search_from = floor_boundary(text, end - (end - start) / SOFT_BREAK_FRACTION);
    let window = &text[search_from..end];
    let candidates = [
        window.rfind("\n\n").map(|pos| pos + 2),
        [". ", "! ", "? ", ".\n", "!\n", "?\n"]
            .iter()
            .filter_map(|marker| window.rfind(marker).map(|pos| pos + 1))
            .max(),
        window.rfind('\n').map(|pos| pos + 1),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(|offset| search_from + offset)
        .find(|cut| *cut > start)
        .unwrap_or(end)
}

fn tail(text: &str, max_len: usize) -> &str {
    if max_len == 0 {
        return "";
    }
    let start = ceil_boundary(text, text.len().saturating_sub(max_len));
    let slice = &text[start..];
    match slice.find(char::is_whitespace) {
        Some(pos) if pos + 1 < slice.len() && start > 0 => {
            let trimmed = ceil_boundary(slice, pos + 1);
            &slice[trimmed..]
        }
        _ => slice,
    }
}

fn floor_boundary(text: &str, idx: usize) -> usize {
    let mut idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, idx: usize) -> usize {
    let mut idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
