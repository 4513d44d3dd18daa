//! Clause-aware chunking for insurance policy text.
//!
//! Documents are split along their legal structure: sections (`第一章`,
//! `壹、`), then clauses (`第N條`), then sub-clauses (`（一）`, `(1)`, `1.`)
//! when a clause is too long. Text with no usable structure falls back to
//! overlapping fixed-size windows. All offsets are character offsets into
//! the text passed to [`ClauseChunker::chunk`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ChunkError;
use crate::models::{Chunk, ChunkMetadata, ClauseType, RetrievalConfig};
use crate::utils::text::CharIndex;

static RE_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:第[一二三四五六七八九十百]+[章節部]|[壹貳參肆伍陸柒捌玖拾]+[ \t]*、)")
        .unwrap()
});
static RE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*第[ \t]*(\d+(?:\.\d+)*)[ \t]*條[ \t]*([^\n]*)").unwrap()
});
static RE_SUBCLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:（[一二三四五六七八九十]+）|\([一二三四五六七八九十\d]+\)|\d+[\.\)、])")
        .unwrap()
});

static RE_EXCLUSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"不[負承]?保[障險]|不在[^，。\n]{0,6}承保範圍|除外|免責|排除|例外|但[不非]包括|(?i:not\s+covered|exclusions?|excluded|except|does\s+not\s+apply)")
        .unwrap()
});
static RE_PROCEDURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"申請|理賠|通知|證明|文件|程序|手續|期限|時間|(?i:apply|application|claims?|notif(?:y|ication)|documents?|deadline|procedure)")
        .unwrap()
});
static RE_COVERAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"旅[程遊]延[誤遲]|[班航]機延誤|行李[遺損失毀延]|醫療費用|意外傷[害亡]|取消行程|行程取消|緊急救援|(?i:flight\s+delay|baggage\s+(?:loss|delay)|medical\s+expenses?|trip\s+cancell?ation|emergency\s+(?:rescue|assistance))")
        .unwrap()
});

/// Fragments at or under this many characters are treated as noise.
const MIN_FRAGMENT_CHARS: usize = 10;
const WHOLE_DOCUMENT_TITLE: &str = "全文";
const PREAMBLE_TITLE: &str = "前言";
const FIXED_SIZE_TITLE: &str = "固定大小分塊";

/// Label a chunk by the first keyword family it matches.
pub fn classify(content: &str) -> ClauseType {
    if RE_EXCLUSION.is_match(content) {
        ClauseType::Exclusion
    } else if RE_PROCEDURE.is_match(content) {
        ClauseType::Procedure
    } else if RE_COVERAGE.is_match(content) {
        ClauseType::Coverage
    } else {
        ClauseType::General
    }
}

/// Result of structure-aware chunking.
#[derive(Debug)]
pub enum ChunkingOutcome {
    Chunks(Vec<Chunk>),
    /// Structure detection broke down; the caller should cut fixed-size windows.
    FallbackNeeded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

/// Cleaned text as characters, with byte-to-char mapping for regex hits.
struct DocText<'a> {
    text: &'a str,
    chars: Vec<char>,
    index: CharIndex,
}

impl<'a> DocText<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.chars().collect(),
            index: CharIndex::new(text),
        }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn char_at(&self, byte: usize) -> usize {
        self.index.char_of(byte)
    }

    fn span_of_bytes(&self, start: usize, end: usize) -> Span {
        Span {
            start: self.char_at(start),
            end: self.char_at(end),
        }
    }

    fn byte_range(&self, span: Span) -> std::ops::Range<usize> {
        crate::utils::text::byte_offset(self.text, span.start)
            ..crate::utils::text::byte_offset(self.text, span.end)
    }

    fn slice(&self, span: Span) -> &'a str {
        &self.text[self.byte_range(span)]
    }

    /// Shrink `span` past surrounding whitespace. `None` if nothing is left.
    fn trim(&self, span: Span) -> Option<Span> {
        let mut start = span.start;
        let mut end = span.end.min(self.len());
        while start < end && self.chars[start].is_whitespace() {
            start += 1;
        }
        while end > start && self.chars[end - 1].is_whitespace() {
            end -= 1;
        }
        (start < end).then_some(Span { start, end })
    }

    fn content(&self, span: Span) -> String {
        self.chars[span.start..span.end].iter().collect()
    }
}

struct Section {
    title: String,
    span: Span,
}

/// Identity of the document being chunked.
struct SourceRef {
    file: String,
    path: String,
}

impl SourceRef {
    fn new(source_path: &str) -> Self {
        let file = Path::new(source_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source_path.to_string());
        Self {
            file,
            path: source_path.to_string(),
        }
    }
}

/// Labels shared by every chunk cut from one clause or section body.
struct ChunkLabels<'a> {
    section_title: &'a str,
    clause_title: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ClauseChunker {
    chunk_size: usize,
    overlap: usize,
}

impl ClauseChunker {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self::with_sizes(config.chunk_size, config.chunk_overlap)
    }

    /// `overlap` is clamped below `chunk_size` so windows always advance.
    pub fn with_sizes(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }

    /// Split cleaned `text` into ordered chunks tagged with `source_path`.
    pub fn chunk(&self, text: &str, source_path: &str, preserve_structure: bool) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let source = SourceRef::new(source_path);
        if !preserve_structure {
            return self.fixed_size_chunks(text, &source);
        }

        match self.structured_chunks(text, &source) {
            ChunkingOutcome::Chunks(chunks) if !chunks.is_empty() => {
                debug!(source = %source.path, chunks = chunks.len(), "clause-aware chunking done");
                chunks
            }
            ChunkingOutcome::Chunks(_) => {
                warn!(source = %source.path, "clause-aware chunking produced nothing, using fixed-size windows");
                self.fixed_size_chunks(text, &source)
            }
            ChunkingOutcome::FallbackNeeded(reason) => {
                warn!(source = %source.path, reason = %reason, "falling back to fixed-size chunking");
                self.fixed_size_chunks(text, &source)
            }
        }
    }

    fn structured_chunks(&self, text: &str, source: &SourceRef) -> ChunkingOutcome {
        let doc = DocText::new(text);
        let mut chunks = Vec::new();

        for section in self.sections(&doc) {
            match self.chunk_section(&doc, &section, source) {
                Ok(mut section_chunks) => chunks.append(&mut section_chunks),
                Err(reason) => return ChunkingOutcome::FallbackNeeded(reason),
            }
        }

        ChunkingOutcome::Chunks(chunks)
    }

    fn sections(&self, doc: &DocText<'_>) -> Vec<Section> {
        let headers: Vec<_> = RE_SECTION.find_iter(doc.text).collect();
        let whole = Span {
            start: 0,
            end: doc.len(),
        };
        if headers.is_empty() {
            return vec![Section {
                title: WHOLE_DOCUMENT_TITLE.to_string(),
                span: whole,
            }];
        }

        let mut sections = Vec::with_capacity(headers.len() + 1);
        // A title line alone is not worth a chunk.
        let preamble = Span {
            start: 0,
            end: doc.char_at(headers[0].start()),
        };
        if let Some(trimmed) = doc.trim(preamble)
            && trimmed.end - trimmed.start > MIN_FRAGMENT_CHARS
        {
            sections.push(Section {
                title: PREAMBLE_TITLE.to_string(),
                span: trimmed,
            });
        }

        for (i, header) in headers.iter().enumerate() {
            let end_byte = headers
                .get(i + 1)
                .map(|next| next.start())
                .unwrap_or(doc.text.len());
            let line_end = doc.text[header.start()..]
                .find('\n')
                .map(|n| header.start() + n)
                .unwrap_or(doc.text.len());
            sections.push(Section {
                title: doc.text[header.start()..line_end].trim().to_string(),
                span: doc.span_of_bytes(header.start(), end_byte),
            });
        }
        sections
    }

    fn chunk_section(
        &self,
        doc: &DocText<'_>,
        section: &Section,
        source: &SourceRef,
    ) -> Result<Vec<Chunk>, String> {
        let section_bytes = doc.byte_range(section.span);
        let section_text = &doc.text[section_bytes.clone()];
        let base = section_bytes.start;
        let clauses: Vec<_> = RE_CLAUSE.captures_iter(section_text).collect();

        let section_labels = ChunkLabels {
            section_title: &section.title,
            clause_title: None,
        };

        if clauses.is_empty() {
            return self
                .window_chunks(doc, section.span, &section_labels, source, |i| {
                    format!("chunk_{}", i)
                })
                .map_err(|e| e.to_string());
        }

        let mut chunks = Vec::new();

        // Text between the section header and its first clause.
        let first_clause = clauses[0].get(0).map_or(0, |m| m.start());
        let preamble = Span {
            start: section.span.start,
            end: doc.char_at(base + first_clause),
        };
        if let Some(trimmed) = doc.trim(preamble)
            && trimmed.end - trimmed.start > MIN_FRAGMENT_CHARS
        {
            chunks.extend(
                self.window_chunks(doc, trimmed, &section_labels, source, |i| {
                    format!("chunk_{}", i)
                })
                .map_err(|e| e.to_string())?,
            );
        }

        for (i, caps) in clauses.iter().enumerate() {
            let header = caps
                .get(0)
                .ok_or_else(|| "clause match without span".to_string())?;
            let number = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| format!("clause header without number at byte {}", header.start()))?;
            let title = caps
                .get(2)
                .map(|m| m.as_str().trim())
                .filter(|t| !t.is_empty());

            let end_byte = clauses
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map(|m| base + m.start())
                .unwrap_or(section_bytes.end);
            let Some(span) = doc.trim(doc.span_of_bytes(base + header.start(), end_byte)) else {
                continue;
            };

            let labels = ChunkLabels {
                section_title: &section.title,
                clause_title: title,
            };
            chunks.extend(
                self.chunk_clause(doc, span, &number, &labels, source)
                    .map_err(|e| e.to_string())?,
            );
        }

        Ok(chunks)
    }

    fn chunk_clause(
        &self,
        doc: &DocText<'_>,
        span: Span,
        number: &str,
        labels: &ChunkLabels<'_>,
        source: &SourceRef,
    ) -> Result<Vec<Chunk>, ChunkError> {
        if span.end - span.start <= self.chunk_size {
            return Ok(vec![self.make_chunk(doc, span, number.to_string(), labels, source)?]);
        }

        let clause_bytes = doc.byte_range(span);
        let markers: Vec<usize> = RE_SUBCLAUSE
            .find_iter(doc.slice(span))
            .map(|m| doc.char_at(clause_bytes.start + m.start()))
            .filter(|&pos| pos > span.start)
            .collect();

        if markers.len() >= 2 {
            let mut chunks = Vec::new();
            for (i, &marker) in markers.iter().enumerate() {
                // The first fragment keeps the clause header and any lead-in text.
                let start = if i == 0 { span.start } else { marker };
                let end = markers.get(i + 1).copied().unwrap_or(span.end);
                let Some(fragment) = doc.trim(Span { start, end }) else {
                    continue;
                };
                if fragment.end - fragment.start <= MIN_FRAGMENT_CHARS {
                    continue;
                }
                chunks.push(self.make_chunk(
                    doc,
                    fragment,
                    format!("{}.{}", number, i + 1),
                    labels,
                    source,
                )?);
            }
            return Ok(chunks);
        }

        self.window_chunks(doc, span, labels, source, |i| format!("{}_{}", number, i))
    }

    fn window_chunks(
        &self,
        doc: &DocText<'_>,
        span: Span,
        labels: &ChunkLabels<'_>,
        source: &SourceRef,
        numbering: impl Fn(usize) -> String,
    ) -> Result<Vec<Chunk>, ChunkError> {
        self.windows(doc, span)
            .into_iter()
            .enumerate()
            .map(|(i, window)| self.make_chunk(doc, window, numbering(i), labels, source))
            .collect()
    }

    /// Overlapping windows of `chunk_size` characters, trimmed, blanks skipped.
    fn windows(&self, doc: &DocText<'_>, span: Span) -> Vec<Span> {
        let mut windows = Vec::new();
        let mut pos = span.start;
        while pos < span.end {
            let end = (pos + self.chunk_size).min(span.end);
            if let Some(window) = doc.trim(Span { start: pos, end }) {
                windows.push(window);
            }
            if end == span.end {
                break;
            }
            pos += self.step();
        }
        windows
    }

    fn make_chunk(
        &self,
        doc: &DocText<'_>,
        span: Span,
        clause_number: String,
        labels: &ChunkLabels<'_>,
        source: &SourceRef,
    ) -> Result<Chunk, ChunkError> {
        let content = doc.content(span);
        let metadata = ChunkMetadata {
            source_file: source.file.clone(),
            source_path: source.path.clone(),
            section_title: labels.section_title.to_string(),
            chunk_id: Chunk::generate_id(&source.path, &clause_number, span.start, span.end),
            clause_number,
            clause_title: labels.clause_title.map(str::to_string),
            clause_type: classify(&content),
            char_start: span.start,
            char_end: span.end,
            chunk_length: span.end - span.start,
        };
        Chunk::new(content, metadata)
    }

    /// Structure-blind windows over the whole text.
    fn fixed_size_chunks(&self, text: &str, source: &SourceRef) -> Vec<Chunk> {
        let doc = DocText::new(text);
        let labels = ChunkLabels {
            section_title: FIXED_SIZE_TITLE,
            clause_title: None,
        };
        let whole = Span {
            start: 0,
            end: doc.len(),
        };
        self.windows(&doc, whole)
            .into_iter()
            .enumerate()
            .filter_map(|(i, window)| {
                self.make_chunk(&doc, window, format!("chunk_{}", i), &labels, source)
                    .ok()
            })
            .collect()
    }
}

/// Chunk counts per size bucket, in characters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeDistribution {
    #[serde(rename = "small (0-100)")]
    pub small: usize,
    #[serde(rename = "medium (101-300)")]
    pub medium: usize,
    #[serde(rename = "large (301-500)")]
    pub large: usize,
    #[serde(rename = "xlarge (500+)")]
    pub xlarge: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkingStats {
    pub total_chunks: usize,
    pub average_size: f64,
    pub min_size: usize,
    pub max_size: usize,
    pub size_distribution: SizeDistribution,
    pub clause_types: BTreeMap<ClauseType, usize>,
}

impl ChunkingStats {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        if chunks.is_empty() {
            return Self::default();
        }

        let sizes: Vec<usize> = chunks.iter().map(|c| c.metadata.chunk_length).collect();
        let mut distribution = SizeDistribution::default();
        for &size in &sizes {
            match size {
                0..=100 => distribution.small += 1,
                101..=300 => distribution.medium += 1,
                301..=500 => distribution.large += 1,
                _ => distribution.xlarge += 1,
            }
        }

        let mut clause_types = BTreeMap::new();
        for chunk in chunks {
            *clause_types.entry(chunk.metadata.clause_type).or_insert(0) += 1;
        }

        Self {
            total_chunks: chunks.len(),
            average_size: sizes.iter().sum::<usize>() as f64 / sizes.len() as f64,
            min_size: sizes.iter().copied().min().unwrap_or(0),
            max_size: sizes.iter().copied().max().unwrap_or(0),
            size_distribution: distribution,
            clause_types,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::text::{char_len, slice_chars};

    const POLICY: &str = "旅行不便保險條款
第一章 總則
第1條 保險契約的構成
本保險契約之構成部分包括保險單、要保書及批註。
第2條 名詞定義
本契約所稱被保險人係指要保書所載之人。
第二章 承保範圍
第3條 班機延誤保險
被保險人搭乘之定期航班延誤超過四小時者，本公司按每滿四小時給付定額保險金。
第4條 除外責任
因被保險人之故意行為所致之損失，本公司不負保險責任。
第5條 理賠申請
被保險人應於事故發生後三十日內檢具證明文件申請理賠。";

    fn chunker() -> ClauseChunker {
        ClauseChunker::with_sizes(256, 26)
    }

    fn assert_offsets(text: &str, chunks: &[Chunk]) {
        let len = char_len(text);
        for chunk in chunks {
            let m = &chunk.metadata;
            assert!(m.char_start < m.char_end, "{:?}", m);
            assert!(m.char_end <= len);
            assert_eq!(m.char_end - m.char_start, m.chunk_length);
            assert_eq!(char_len(chunk.content()), m.chunk_length);
            assert_eq!(slice_chars(text, m.char_start, m.char_end), chunk.content());
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(chunker().chunk("", "a.txt", true).is_empty());
        assert!(chunker().chunk(" \n\t", "a.txt", true).is_empty());
    }

    #[test]
    fn test_one_chunk_per_short_clause() {
        let chunks = chunker().chunk(POLICY, "/data/policy.txt", true);
        let numbers: Vec<_> = chunks
            .iter()
            .map(|c| c.metadata.clause_number.as_str())
            .collect();
        assert_eq!(numbers, vec!["1", "2", "3", "4", "5"]);

        let third = &chunks[2];
        assert_eq!(third.metadata.section_title, "第二章 承保範圍");
        assert_eq!(third.metadata.clause_title.as_deref(), Some("班機延誤保險"));
        assert_eq!(third.metadata.clause_type, ClauseType::Coverage);
        assert_eq!(third.metadata.source_file, "policy.txt");
        assert_eq!(chunks[3].metadata.clause_type, ClauseType::Exclusion);
        assert_eq!(chunks[4].metadata.clause_type, ClauseType::Procedure);
        assert_offsets(POLICY, &chunks);
    }

    #[test]
    fn test_every_clause_header_survives() {
        let chunks = chunker().chunk(POLICY, "policy.txt", true);
        let joined: String = chunks.iter().map(|c| c.content()).collect();
        for header in RE_CLAUSE.find_iter(POLICY) {
            let line = header.as_str().trim();
            assert!(joined.contains(line), "missing {}", line);
        }
    }

    #[test]
    fn test_rechunking_is_stable() {
        let first = chunker().chunk(POLICY, "policy.txt", true);
        let second = chunker().chunk(POLICY, "policy.txt", true);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.content(), b.content());
            assert_eq!(a.metadata.char_start, b.metadata.char_start);
            assert_eq!(a.metadata.char_end, b.metadata.char_end);
            assert_eq!(a.chunk_id, b.chunk_id);
        }
    }

    #[test]
    fn test_long_clause_splits_on_subclauses() {
        let text = format!(
            "第7條 醫療費用\n被保險人因意外傷害事故所生之下列費用：\n（一）住院期間之病房費用{}\n（二）手術費用{}\n（三）短",
            "甲".repeat(120),
            "乙".repeat(120)
        );
        let chunks = ClauseChunker::with_sizes(200, 20).chunk(&text, "p.txt", true);
        let numbers: Vec<_> = chunks
            .iter()
            .map(|c| c.metadata.clause_number.as_str())
            .collect();
        assert_eq!(numbers, vec!["7.1", "7.2"]);
        assert!(chunks[0].content().starts_with("第7條 醫療費用"));
        assert!(chunks[1].content().starts_with("（二）"));
        assert_offsets(&text, &chunks);
    }

    #[test]
    fn test_long_clause_without_subclauses_uses_windows() {
        let text = format!("第9條 一般約定\n{}", "本契約條款內容".repeat(60));
        let chunker = ClauseChunker::with_sizes(100, 10);
        let chunks = chunker.chunk(&text, "p.txt", true);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.clause_number, format!("9_{}", i));
            assert!(chunk.metadata.chunk_length <= 100);
        }
        assert_eq!(chunks[1].metadata.char_start, 90);
        assert_offsets(&text, &chunks);
    }

    #[test]
    fn test_section_without_clauses_uses_windows() {
        let text = "第一章 前言\n本保險為旅行不便保險，提供旅途中之各項保障。";
        let chunks = chunker().chunk(text, "p.txt", true);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.clause_number, "chunk_0");
        assert_eq!(chunks[0].metadata.section_title, "第一章 前言");
        assert_offsets(text, &chunks);
    }

    #[test]
    fn test_unstructured_text_is_one_whole_section() {
        let text = "這是一段沒有任何條款編號的說明文字。";
        let chunks = chunker().chunk(text, "p.txt", true);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.section_title, WHOLE_DOCUMENT_TITLE);
    }

    #[test]
    fn test_fixed_size_mode() {
        let text = "保".repeat(600);
        let chunks = chunker().chunk(&text, "p.txt", false);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].metadata.section_title, FIXED_SIZE_TITLE);
        assert_eq!(chunks[1].metadata.char_start, 230);
        assert_eq!(chunks[2].metadata.clause_number, "chunk_2");
        assert!(chunks[0].metadata.clause_title.is_none());
        assert_offsets(&text, &chunks);
    }

    #[test]
    fn test_classification_cascade() {
        assert_eq!(
            classify("班機延誤所致之損失，但不包括罷工所致者"),
            ClauseType::Exclusion
        );
        assert_eq!(classify("行李損失應於十日內通知本公司"), ClauseType::Procedure);
        assert_eq!(classify("行李遺失之賠償"), ClauseType::Coverage);
        assert_eq!(classify("本契約之構成"), ClauseType::General);
        assert_eq!(
            classify("Flight delay coverage does not apply when the delay is announced"),
            ClauseType::Exclusion
        );
        assert_eq!(classify("Medical expenses are reimbursed"), ClauseType::Coverage);
    }

    #[test]
    fn test_chunking_stats() {
        let chunks = chunker().chunk(POLICY, "policy.txt", true);
        let stats = ChunkingStats::from_chunks(&chunks);
        assert_eq!(stats.total_chunks, 5);
        assert_eq!(stats.size_distribution.small, 5);
        assert_eq!(stats.clause_types.get(&ClauseType::Coverage), Some(&1));
        assert_eq!(stats.clause_types.get(&ClauseType::General), Some(&2));
        assert!(stats.min_size <= stats.max_size);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["size_distribution"]["small (0-100)"], 5);
        assert_eq!(json["clause_types"]["coverage"], 1);
    }

    #[test]
    fn test_chunking_stats_empty() {
        let stats = ChunkingStats::from_chunks(&[]);
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.average_size, 0.0);
    }
}
