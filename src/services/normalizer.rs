//! Text cleanup for extracted policy documents.
//!
//! Removes formatting noise left behind by PDF/OCR extraction while keeping
//! every meaningful character. Cleaning is best effort: if a pass would lose
//! content, the input is returned untouched.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use crate::error::NormalizeError;
use crate::utils::text::char_len;

static RE_PAGE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s\-\d]*第?\s*[\d\-]+\s*頁?[\s\-]*$").unwrap());
static RE_SHORT_ARTIFACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d\s\-\.]+$").unwrap());
static RE_TABLE_GLYPHS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[|\u{2500}-\u{257F}]+").unwrap());
static RE_LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[•·▪▫◦‣⁃\-\*]+\s+").unwrap());
static RE_WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());
static RE_PUNCT_BEFORE_ALNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([，。；：！？])([A-Za-z0-9])").unwrap());
static RE_SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+([，。；：！？、])").unwrap());
static RE_CLAUSE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"第[ \t]*(\d+(?:[ \t]*\.[ \t]*\d+)*)[ \t]*條").unwrap());

const CJK_PUNCTUATION: [char; 6] = ['，', '。', '；', '：', '！', '？'];
const LIST_BULLET: &str = "• ";
const ARTIFACT_MAX_CHARS: usize = 10;

/// Before/after figures for one `clean` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningStats {
    pub original_length: usize,
    pub cleaned_length: usize,
    pub characters_removed: i64,
    pub original_lines: usize,
    pub cleaned_lines: usize,
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TextNormalizer;

impl TextNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Clean `text`. Returns the input unchanged if cleaning fails.
    pub fn clean(&self, text: &str) -> String {
        self.clean_with(text, run_passes)
    }

    /// Apply `passes` and keep the result only if every clause header survived.
    fn clean_with(&self, text: &str, passes: impl Fn(&str) -> String) -> String {
        if text.trim().is_empty() {
            return String::new();
        }

        match ensure_clauses_kept(text, passes(text)) {
            Ok(cleaned) => {
                debug!(
                    original = char_len(text),
                    cleaned = char_len(&cleaned),
                    "normalized document text"
                );
                cleaned
            }
            Err(e) => {
                warn!(error = %e, "text cleaning failed, keeping original text");
                text.to_string()
            }
        }
    }

    pub fn stats(&self, original: &str, cleaned: &str) -> CleaningStats {
        let original_length = char_len(original);
        let cleaned_length = char_len(cleaned);
        CleaningStats {
            original_length,
            cleaned_length,
            characters_removed: original_length as i64 - cleaned_length as i64,
            original_lines: original.lines().count(),
            cleaned_lines: cleaned.lines().count(),
            compression_ratio: if original_length == 0 {
                0.0
            } else {
                cleaned_length as f64 / original_length as f64
            },
        }
    }
}

fn run_passes(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let canonical = canonicalize_unicode(&unified);

    let lines: Vec<String> = canonical
        .lines()
        .map(str::trim)
        .filter(|line| !is_page_artifact(line))
        .map(strip_layout_glyphs)
        .map(|line| RE_WHITESPACE_RUN.replace_all(&line, " ").trim().to_string())
        .collect();

    let joined = join_paragraphs(&lines);
    let punctuated = normalize_punctuation(&joined);
    canonicalize_clause_numbers(&punctuated)
}

fn ensure_clauses_kept(original: &str, cleaned: String) -> Result<String, NormalizeError> {
    let before = RE_CLAUSE_NUMBER
        .find_iter(&canonicalize_unicode(original))
        .count();
    let after = RE_CLAUSE_NUMBER.find_iter(&cleaned).count();
    if after < before {
        return Err(NormalizeError::ContentLost { before, after });
    }
    Ok(cleaned)
}

/// Canonical decomposition then composition, plus full-width ASCII letters and digits folded to half-width.
fn canonicalize_unicode(text: &str) -> String {
    text.nfd()
        .nfc()
        .map(|c| match c {
            '０'..='９' | 'Ａ'..='Ｚ' | 'ａ'..='ｚ' => {
                char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
            }
            c => c,
        })
        .collect()
}

fn is_page_artifact(line: &str) -> bool {
    if line.is_empty() {
        return false;
    }
    char_len(line) < ARTIFACT_MAX_CHARS
        && (RE_PAGE_NUMBER.is_match(line) || RE_SHORT_ARTIFACT.is_match(line))
}

fn strip_layout_glyphs(line: &str) -> String {
    let line = RE_TABLE_GLYPHS.replace_all(line, " ");
    let trimmed = line.trim_start();
    RE_LIST_MARKER.replace(trimmed, LIST_BULLET).into_owned()
}

/// Join lines, keeping at most one blank line between paragraphs.
fn join_paragraphs(lines: &[String]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_empty() && out.last().is_none_or(|prev| prev.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|line| line.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

fn normalize_punctuation(text: &str) -> String {
    let mut collapsed = String::with_capacity(text.len());
    let mut previous: Option<char> = None;
    for c in text.chars() {
        if previous == Some(c) && CJK_PUNCTUATION.contains(&c) {
            continue;
        }
        collapsed.push(c);
        previous = Some(c);
    }

    let spaced = RE_PUNCT_BEFORE_ALNUM.replace_all(&collapsed, "$1 $2");
    RE_SPACE_BEFORE_PUNCT.replace_all(&spaced, "$1").into_owned()
}

fn canonicalize_clause_numbers(text: &str) -> String {
    RE_CLAUSE_NUMBER
        .replace_all(text, |caps: &regex::Captures| {
            let number: String = caps[1].chars().filter(|c| !c.is_whitespace()).collect();
            format!("第{}條", number)
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(text: &str) -> String {
        TextNormalizer::new().clean(text)
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(clean(""), "");
        assert_eq!(clean("  \n\t "), "");
    }

    #[test]
    fn test_fullwidth_folding() {
        assert_eq!(clean("ＡＢＣ１２３保險"), "ABC123保險");
    }

    #[test]
    fn test_removes_page_numbers() {
        let text = "第1條 總則\n本保險契約依約定給付。\n- 3 -\n12\n第 4 頁\n第2條 定義";
        let cleaned = clean(text);
        assert!(!cleaned.contains("- 3 -"));
        assert!(!cleaned.contains("第 4 頁"));
        assert!(!cleaned.lines().any(|l| l == "12"));
        assert!(cleaned.contains("第1條 總則"));
        assert!(cleaned.contains("第2條 定義"));
    }

    #[test]
    fn test_keeps_long_numeric_lines() {
        let text = "第1條 保險期間\n2024-01-01-2024-12-31\n本契約於上列期間有效。";
        let cleaned = clean(text);
        assert!(cleaned.lines().any(|l| l == "2024-01-01-2024-12-31"));
        assert!(!clean("第1條 總則\n- 12 -").contains("- 12 -"));
    }

    #[test]
    fn test_lost_clause_header_keeps_original() {
        let text = "第1條 總則\n本契約。。。\n第2條 定義\n本契約所稱旅程。";
        let normalizer = TextNormalizer::new();

        let kept = normalizer.clean_with(text, |t| run_passes(t).replace("第2條", ""));
        assert_eq!(kept, text);

        let cleaned = normalizer.clean_with(text, run_passes);
        assert_ne!(cleaned, text);
        assert_eq!(cleaned, normalizer.clean(text));
    }

    #[test]
    fn test_keeps_numeric_content() {
        let cleaned = clean("延誤達4小時以上者，每滿4小時給付新台幣1,000元。");
        assert_eq!(cleaned, "延誤達4小時以上者，每滿4小時給付新台幣1,000元。");
    }

    #[test]
    fn test_strips_table_glyphs_and_bullets() {
        let cleaned = clean("┌────┐\n│ 保險金額 │\n└────┘\n* 醫療費用\n▪ 行李損失");
        assert!(!cleaned.contains('│'));
        assert!(!cleaned.contains('─'));
        assert!(cleaned.contains("保險金額"));
        assert!(cleaned.contains("• 醫療費用"));
        assert!(cleaned.contains("• 行李損失"));
    }

    #[test]
    fn test_collapses_whitespace_and_blank_lines() {
        let cleaned = clean("\n\n第一段   內容\n\n\n\n第二段\t\t內容\n\n\n");
        assert_eq!(cleaned, "第一段 內容\n\n第二段 內容");
    }

    #[test]
    fn test_collapses_repeated_punctuation() {
        assert_eq!(clean("注意。。。請留意！！"), "注意。請留意！");
    }

    #[test]
    fn test_punctuation_spacing() {
        assert_eq!(clean("費用：USD 500"), "費用： USD 500");
        assert_eq!(clean("保險金 ，另計"), "保險金，另計");
    }

    #[test]
    fn test_canonicalizes_clause_numbers() {
        assert_eq!(clean("第 3 條 旅程延誤"), "第3條 旅程延誤");
        assert_eq!(clean("第３.１條 定義"), "第3.1條 定義");
        assert_eq!(clean("第 2 . 4 條"), "第2.4條");
    }

    #[test]
    fn test_clean_is_idempotent() {
        let once = clean("第 1 條  總則\n\n\n本契約。。。\n- 1 -\n");
        assert_eq!(clean(&once), once);
    }

    #[test]
    fn test_stats() {
        let normalizer = TextNormalizer::new();
        let original = "第 1 條   總則\n\n\n";
        let cleaned = normalizer.clean(original);
        let stats = normalizer.stats(original, &cleaned);
        assert_eq!(stats.cleaned_length, char_len(&cleaned));
        assert!(stats.characters_removed > 0);
        assert!(stats.compression_ratio < 1.0);
    }
}
