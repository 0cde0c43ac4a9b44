use crate::models::{BoundingBox, Chunk, PAGE_HEIGHT_POINTS, PAGE_WIDTH_POINTS};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Paragraphs shorter than this (after cleaning) are treated as layout noise.
pub const MIN_PARAGRAPH_CHARS: usize = 20;
/// Chunks longer than this are cut into fixed windows.
pub const MAX_CHUNK_CHARS: usize = 4_000;
const MAX_SECTION_CHARS: usize = 120;
const MIN_MEASUREMENTS_FOR_TABLE: usize = 3;

/// Response layouts the extraction service is known to produce, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `chunks: [{content, blocks: [{content, bbox, type}]}]`
    NestedBlocks,
    /// `blocks: [{content, bbox, type}]`
    FlatBlocks,
    /// `chunks: [{content | text, page?}]`
    FlatChunks,
    /// `markdown | text | content` as a single string.
    RawText,
}

impl ResponseShape {
    pub const PRIORITY: [ResponseShape; 4] = [
        ResponseShape::NestedBlocks,
        ResponseShape::FlatBlocks,
        ResponseShape::FlatChunks,
        ResponseShape::RawText,
    ];

    /// Claims the payload when this layout yields at least one chunk; defers otherwise.
    fn claim(self, response: &Value) -> Option<Vec<ChunkDraft>> {
        let drafts: Vec<ChunkDraft> = match self {
            Self::NestedBlocks => {
                let chunks = array_field(response, "chunks")?;
                if !chunks.iter().any(has_blocks) {
                    return None;
                }
                chunks.iter().filter_map(draft_from_nested_chunk).collect()
            }
            Self::FlatBlocks => array_field(response, "blocks")?
                .iter()
                .filter_map(draft_from_block)
                .collect(),
            Self::FlatChunks => array_field(response, "chunks")?
                .iter()
                .filter_map(draft_from_flat_chunk)
                .collect(),
            Self::RawText => ["markdown", "text", "content"]
                .iter()
                .find_map(|key| string_field(response, key))
                .map(drafts_from_raw_text)?,
        };

        let drafts = split_oversized(drafts);
        (!drafts.is_empty()).then_some(drafts)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ChunkDraft {
    text: String,
    page_number: u32,
    bounding_box: BoundingBox,
    section: Option<String>,
    table_detected: bool,
}

impl ChunkDraft {
    fn from_raw(raw: &str, page_number: u32, bounding_box: BoundingBox) -> Option<Self> {
        let text = clean_text(raw);
        if text.is_empty() {
            return None;
        }
        Some(Self {
            text,
            page_number,
            bounding_box,
            section: detect_section(raw),
            table_detected: detect_table(raw),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResponse {
    /// `None` when no layout matched.
    pub shape: Option<ResponseShape>,
    pub chunks: Vec<Chunk>,
}

/// Converts one extraction response into canonical chunks for a single document. Exactly one
/// layout is used: the first in [`ResponseShape::PRIORITY`] that produces chunks. An
/// unrecognized response yields zero chunks rather than an error.
pub fn normalize_response(
    response: &Value,
    file_number: &str,
    source_url: &str,
) -> NormalizedResponse {
    let claimed = ResponseShape::PRIORITY
        .iter()
        .find_map(|shape| shape.claim(response).map(|drafts| (*shape, drafts)));

    let Some((shape, drafts)) = claimed else {
        return NormalizedResponse {
            shape: None,
            chunks: Vec::new(),
        };
    };

    let chunks = drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| Chunk {
            text: draft.text,
            page_number: draft.page_number,
            bounding_box: draft.bounding_box,
            chunk_index: index as u32,
            file_number: file_number.to_string(),
            source_url: source_url.to_string(),
            section: draft.section,
            table_detected: draft.table_detected,
        })
        .collect();

    NormalizedResponse {
        shape: Some(shape),
        chunks,
    }
}

/// Strips "Page N of M" footers, collapses horizontal whitespace runs to one space, trims
/// every line, and collapses three or more newlines to a paragraph break.
pub fn clean_text(raw: &str) -> String {
    let without_footers = footer_regex().replace_all(raw, " ");
    let spaced = horizontal_space_regex().replace_all(&without_footers, " ");
    let lines = spaced.lines().map(str::trim).collect::<Vec<_>>().join("\n");
    blank_run_regex()
        .replace_all(&lines, "\n\n")
        .trim()
        .to_string()
}

/// Best-effort heading detection over the raw chunk text.
pub fn detect_section(raw: &str) -> Option<String> {
    section_regexes().iter().find_map(|pattern| {
        pattern
            .captures(raw)
            .and_then(|capture| capture.get(1))
            .map(|heading| {
                heading
                    .as_str()
                    .trim()
                    .chars()
                    .take(MAX_SECTION_CHARS)
                    .collect::<String>()
            })
            .filter(|heading| !heading.is_empty())
    })
}

/// Pipe-delimited rows, tab-delimited rows, or a run of numeric measurements.
pub fn detect_table(raw: &str) -> bool {
    let pipe_rows = raw
        .lines()
        .filter(|line| pipe_row_regex().is_match(line))
        .count();
    if pipe_rows >= 2 {
        return true;
    }

    let tab_rows = raw
        .lines()
        .filter(|line| line.trim().split('\t').filter(|cell| !cell.trim().is_empty()).count() >= 2)
        .count();
    if tab_rows >= 2 {
        return true;
    }

    measurement_regex().find_iter(raw).count() >= MIN_MEASUREMENTS_FOR_TABLE
}

fn drafts_from_raw_text(raw: &str) -> Vec<ChunkDraft> {
    raw.split('\u{000c}')
        .enumerate()
        .flat_map(|(page_index, page)| {
            paragraph_break_regex()
                .split(page)
                .filter_map(move |paragraph| {
                    ChunkDraft::from_raw(paragraph, page_index as u32 + 1, BoundingBox::FULL_PAGE)
                })
                .filter(|draft| draft.text.chars().count() >= MIN_PARAGRAPH_CHARS)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn draft_from_nested_chunk(chunk: &Value) -> Option<ChunkDraft> {
    let blocks = chunk
        .get("blocks")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let joined;
    let raw = match text_of(chunk) {
        Some(text) => text,
        None => {
            joined = blocks
                .iter()
                .filter_map(text_of)
                .collect::<Vec<_>>()
                .join("\n");
            joined.as_str()
        }
    };

    let page_number = blocks.iter().find_map(page_of).unwrap_or(1);
    let bounding_box = blocks
        .iter()
        .filter(|block| page_of(block).unwrap_or(1) == page_number)
        .filter_map(box_of)
        .reduce(|merged, next| merged.union(&next))
        .unwrap_or_default();

    let mut draft = ChunkDraft::from_raw(raw, page_number, bounding_box)?;
    draft.table_detected |= blocks.iter().any(is_table_block);
    if draft.section.is_none() {
        draft.section = blocks
            .iter()
            .filter(|block| is_heading_block(block))
            .find_map(text_of)
            .map(|heading| heading.trim().chars().take(MAX_SECTION_CHARS).collect())
            .filter(|heading: &String| !heading.is_empty());
    }
    Some(draft)
}

fn draft_from_block(block: &Value) -> Option<ChunkDraft> {
    let raw = text_of(block)?;
    let mut draft = ChunkDraft::from_raw(
        raw,
        page_of(block).unwrap_or(1),
        box_of(block).unwrap_or_default(),
    )?;
    draft.table_detected |= is_table_block(block);
    Some(draft)
}

fn draft_from_flat_chunk(chunk: &Value) -> Option<ChunkDraft> {
    let raw = text_of(chunk).or_else(|| chunk.get("embed").and_then(Value::as_str))?;
    ChunkDraft::from_raw(
        raw,
        page_of(chunk).unwrap_or(1),
        box_of(chunk).unwrap_or_default(),
    )
}

fn split_oversized(drafts: Vec<ChunkDraft>) -> Vec<ChunkDraft> {
    let mut result = Vec::with_capacity(drafts.len());
    for draft in drafts {
        if draft.text.chars().count() <= MAX_CHUNK_CHARS {
            result.push(draft);
            continue;
        }

        let chars: Vec<char> = draft.text.chars().collect();
        for window in chars.chunks(MAX_CHUNK_CHARS) {
            let piece = window.iter().collect::<String>().trim().to_string();
            if piece.is_empty() {
                continue;
            }
            result.push(ChunkDraft {
                text: piece,
                ..draft.clone()
            });
        }
    }
    result
}

fn array_field<'a>(response: &'a Value, key: &str) -> Option<&'a [Value]> {
    lookup(response, key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .filter(|items| !items.is_empty())
}

fn string_field<'a>(response: &'a Value, key: &str) -> Option<&'a str> {
    lookup(response, key)
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}

/// Services wrap their payload in `result` at times; the top level wins when both exist.
fn lookup<'a>(response: &'a Value, key: &str) -> Option<&'a Value> {
    response
        .get(key)
        .or_else(|| response.get("result").and_then(|result| result.get(key)))
}

fn has_blocks(chunk: &Value) -> bool {
    chunk
        .get("blocks")
        .and_then(Value::as_array)
        .is_some_and(|blocks| !blocks.is_empty())
}

fn text_of(item: &Value) -> Option<&str> {
    ["content", "text"]
        .iter()
        .find_map(|key| item.get(*key).and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
}

fn page_of(item: &Value) -> Option<u32> {
    let candidates = [
        item.get("bbox").and_then(|bbox| bbox.get("page")),
        item.get("page"),
        item.get("page_number"),
        item.get("pageNumber"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_u64)
        .filter(|page| *page > 0)
        .and_then(|page| u32::try_from(page).ok())
}

fn box_of(item: &Value) -> Option<BoundingBox> {
    let raw = ["bbox", "boundingBox", "bounding_box"]
        .iter()
        .find_map(|key| item.get(*key))?;
    let number = |key: &str| raw.get(key).and_then(Value::as_f64).map(|value| value as f32);
    let parsed = BoundingBox {
        left: number("left")?,
        top: number("top")?,
        width: number("width")?,
        height: number("height")?,
    };

    if parsed.width < 0.0 || parsed.height < 0.0 {
        return None;
    }

    let fractional = [parsed.left, parsed.top, parsed.width, parsed.height]
        .iter()
        .all(|value| (0.0..=1.0).contains(value));
    if fractional {
        return Some(BoundingBox {
            left: parsed.left * PAGE_WIDTH_POINTS,
            top: parsed.top * PAGE_HEIGHT_POINTS,
            width: parsed.width * PAGE_WIDTH_POINTS,
            height: parsed.height * PAGE_HEIGHT_POINTS,
        });
    }
    Some(parsed)
}

fn block_type(block: &Value) -> String {
    block
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase()
}

fn is_table_block(block: &Value) -> bool {
    block_type(block).contains("table")
}

fn is_heading_block(block: &Value) -> bool {
    let kind = block_type(block);
    kind.contains("header") || kind.contains("title") || kind.contains("heading")
}

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn footer_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    compiled(&CELL, r"(?i)\bpage\s+\d+\s+of\s+\d+\b")
}

fn horizontal_space_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    compiled(&CELL, r"[^\S\n]+")
}

fn blank_run_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    compiled(&CELL, r"\n{3,}")
}

fn paragraph_break_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    compiled(&CELL, r"\n[^\S\n]*\n")
}

fn pipe_row_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    compiled(&CELL, r"^\s*\|.*\|\s*$")
}

fn measurement_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    compiled(
        &CELL,
        r"(?i)\b\d+(?:[.,]\d+)?\s*(?:%|(?:sq\.?\s*ft|square\s+feet|ft|feet|foot|acres?|stories|units|inches|in\.))",
    )
}

fn section_regexes() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    CELL.get_or_init(|| {
        [
            r"(?im)^\s*#{1,6}\s+(.+)$",
            r"(?m)^\s*((?i:section|sec\.|article|chapter|division|part)\s+[0-9IVXLC]+(?:[.\-][0-9A-Za-z]+)*\b.*)$",
            r"(?m)^\s*(§+\s*\d+(?:[.\-]\d+)*.*)$",
            r"(?m)^\s*(\d+(?:\.\d+)+\s+[A-Z][^\n]{2,80})$",
            r"(?m)^\s*([A-Z][A-Z0-9 ,&\-]{4,80})\s*$",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static pattern compiles"))
        .collect()
    })
}
