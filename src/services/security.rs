//! Input hardening for the ingestion path.
//!
//! Four independent checks run before any document text reaches the
//! chunker: path validation, size/type validation, content sanitization
//! with PII masking, and resource limits. Every check records an audit event.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::SecurityError;
use crate::models::SecurityConfig;
use crate::utils::file::{calculate_file_checksum, has_allowed_extension};

static RE_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script\s*>|<script[^>]*>|javascript:|vbscript:|\bon(?:load|error|click|mouseover|focus)\s*=")
        .unwrap()
});
static RE_SQL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)union\s+select|insert\s+into|delete\s+from|drop\s+table|exec\s*\(").unwrap()
});
static RE_BLANK_LINE_FLOOD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{10,}").unwrap());

/// PII patterns, checked in order. Generic shapes first, then Taiwan-specific ones.
static PII_PATTERNS: LazyLock<Vec<(PiiKind, Regex)>> = LazyLock::new(|| {
    [
        (PiiKind::CardNumber, r"\d{4}-\d{4}-\d{4}-\d{4}"),
        (PiiKind::LongDigitRun, r"\d{10,11}"),
        (PiiKind::IdLike, r"[A-Z]\d{9}"),
        (PiiKind::TaiwanId, r"[A-Z][12]\d{8}"),
        (PiiKind::CreditCard, r"\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}"),
        (PiiKind::MobilePhone, r"09\d{2}-?\d{3}-?\d{3}"),
        (PiiKind::Landline, r"0\d{1,2}-\d{6,8}"),
        (PiiKind::Passport, r"[A-Z]{2}\d{8}"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).unwrap()))
    .collect()
});

const MASK_CHAR: char = '*';
const DOMINANT_CHAR_RATIO: f64 = 0.8;
const PATTERN_SAMPLE_POSITIONS: usize = 100;
const PATTERN_REPEAT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    CardNumber,
    LongDigitRun,
    IdLike,
    TaiwanId,
    CreditCard,
    MobilePhone,
    Landline,
    Passport,
}

impl PiiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::CardNumber => "card_number",
            PiiKind::LongDigitRun => "long_digit_run",
            PiiKind::IdLike => "id_like",
            PiiKind::TaiwanId => "taiwan_id",
            PiiKind::CreditCard => "credit_card",
            PiiKind::MobilePhone => "mobile_phone",
            PiiKind::Landline => "landline",
            PiiKind::Passport => "passport",
        }
    }
}

impl std::fmt::Display for PiiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    PathValidation,
    FileValidation,
    ContentSanitized,
    PiiDetected,
    ResourceLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditEventKind,
    pub severity: Severity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Path, size, content and resource checks plus the append-only audit log.
#[derive(Debug)]
pub struct SecurityGate {
    config: SecurityConfig,
    audit_log: Vec<AuditEvent>,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config,
            audit_log: Vec::new(),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Resolve `path` and make sure it sits under `allowed_root` with an allowed extension.
    pub fn validate_path(
        &mut self,
        path: &Path,
        allowed_root: &Path,
    ) -> Result<PathBuf, SecurityError> {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            self.record(
                AuditEventKind::PathValidation,
                Severity::Critical,
                "path traversal attempt detected",
                Some(path),
            );
            return Err(SecurityError::PathTraversal(path.to_path_buf()));
        }

        let resolved = resolve(path);
        let root = resolve(allowed_root);
        if !resolved.starts_with(&root) {
            self.record(
                AuditEventKind::PathValidation,
                Severity::Error,
                format!("path outside allowed root {}", root.display()),
                Some(path),
            );
            return Err(SecurityError::OutsideAllowedRoot {
                path: resolved,
                root,
            });
        }

        if !has_allowed_extension(&resolved, &self.config.allowed_extensions) {
            self.record(
                AuditEventKind::PathValidation,
                Severity::Warning,
                format!(
                    "extension not in allow-list {:?}",
                    self.config.allowed_extensions
                ),
                Some(path),
            );
            return Err(SecurityError::UnsupportedExtension(resolved));
        }

        self.record(
            AuditEventKind::PathValidation,
            Severity::Info,
            "path validated",
            Some(&resolved),
        );
        Ok(resolved)
    }

    /// Reject missing, non-regular, empty and oversized files. Returns the size in bytes.
    pub fn validate_size_and_type(&mut self, path: &Path) -> Result<u64, SecurityError> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            _ => {
                self.record(
                    AuditEventKind::FileValidation,
                    Severity::Error,
                    "not a regular file",
                    Some(path),
                );
                return Err(SecurityError::NotAFile(path.to_path_buf()));
            }
        };

        let size = metadata.len();
        if size == 0 {
            self.record(
                AuditEventKind::FileValidation,
                Severity::Warning,
                "empty file",
                Some(path),
            );
            return Err(SecurityError::Empty(path.to_path_buf()));
        }
        if size > self.config.max_file_size {
            self.record(
                AuditEventKind::FileValidation,
                Severity::Error,
                format!(
                    "file size {} exceeds limit {}",
                    size, self.config.max_file_size
                ),
                Some(path),
            );
            return Err(SecurityError::FileTooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }

        self.record(
            AuditEventKind::FileValidation,
            Severity::Info,
            format!("file validated ({} bytes)", size),
            Some(path),
        );
        Ok(size)
    }

    /// Strip script and SQL injection fragments, null bytes and blank-line floods.
    pub fn sanitize(&mut self, content: &str) -> String {
        let original_len = content.len();

        let without_scripts = RE_SCRIPT.replace_all(content, "");
        let without_sql = RE_SQL.replace_all(&without_scripts, "");
        let unified = without_sql
            .replace('\0', "")
            .replace("\r\n", "\n")
            .replace('\r', "\n");
        let sanitized = RE_BLANK_LINE_FLOOD
            .replace_all(&unified, "\n\n\n")
            .into_owned();

        if sanitized.len() != original_len {
            self.record(
                AuditEventKind::ContentSanitized,
                Severity::Warning,
                format!(
                    "content sanitized: {} bytes removed",
                    original_len - sanitized.len().min(original_len)
                ),
                None,
            );
        }
        sanitized
    }

    /// Mask PII in place and report each distinct kind found, in pattern order.
    pub fn detect_and_mask_pii(&mut self, content: &str) -> (String, Vec<PiiKind>) {
        if !self.config.enable_pii_masking {
            return (content.to_string(), Vec::new());
        }

        let mut masked = content.to_string();
        let mut found = Vec::new();
        for (kind, pattern) in PII_PATTERNS.iter() {
            if !pattern.is_match(content) {
                continue;
            }
            found.push(*kind);
            masked = pattern
                .replace_all(&masked, |caps: &regex::Captures| mask(&caps[0]))
                .into_owned();
        }

        if !found.is_empty() {
            let kinds: Vec<&str> = found.iter().map(PiiKind::as_str).collect();
            self.record(
                AuditEventKind::PiiDetected,
                Severity::Warning,
                format!("PII detected and masked: {}", kinds.join(", ")),
                None,
            );
        }
        (masked, found)
    }

    /// Reject content whose processing cost or shape points to an attack.
    pub fn check_resource_limits(&mut self, content: &str) -> Result<(), SecurityError> {
        let estimated = content.len() as u64 * self.config.memory_multiplier;
        if estimated > self.config.max_memory_bytes {
            self.record(
                AuditEventKind::ResourceLimit,
                Severity::Error,
                format!(
                    "estimated memory {} exceeds limit {}",
                    estimated, self.config.max_memory_bytes
                ),
                None,
            );
            return Err(SecurityError::EstimatedMemoryExceeded {
                estimated,
                limit: self.config.max_memory_bytes,
            });
        }

        if let Some(reason) = detect_repeated_pattern(content) {
            self.record(
                AuditEventKind::ResourceLimit,
                Severity::Critical,
                format!("repeated pattern attack: {}", reason),
                None,
            );
            return Err(SecurityError::RepeatedPatternAttack(reason));
        }

        Ok(())
    }

    /// Audit events, optionally only those of one severity.
    pub fn audit_events(&self, severity: Option<Severity>) -> Vec<&AuditEvent> {
        self.audit_log
            .iter()
            .filter(|e| severity.is_none_or(|s| e.severity == s))
            .collect()
    }

    pub fn audit_event_count(&self) -> usize {
        self.audit_log.len()
    }

    fn record(
        &mut self,
        kind: AuditEventKind,
        severity: Severity,
        description: impl Into<String>,
        file_path: Option<&Path>,
    ) {
        let description = description.into();
        let file_hash = file_path
            .filter(|p| p.is_file())
            .and_then(|p| calculate_file_checksum(p).ok());
        let file_path = file_path.map(|p| p.display().to_string());

        match severity {
            Severity::Info => info!(?kind, path = ?file_path, "{}", description),
            Severity::Warning => warn!(?kind, path = ?file_path, "{}", description),
            Severity::Error | Severity::Critical => {
                error!(?kind, ?severity, path = ?file_path, "{}", description)
            }
        }

        self.audit_log.push(AuditEvent {
            kind,
            severity,
            description,
            file_path,
            file_hash,
            timestamp: Utc::now(),
        });
    }
}

/// Absolute, lexically normalized form of `path`; canonical when it exists.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

/// Keep the first and last character, mask the rest.
fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 2 {
        return MASK_CHAR.to_string().repeat(chars.len());
    }
    let mut masked = String::with_capacity(value.len());
    masked.push(chars[0]);
    masked.extend(std::iter::repeat_n(MASK_CHAR, chars.len() - 2));
    masked.push(chars[chars.len() - 1]);
    masked
}

fn detect_repeated_pattern(content: &str) -> Option<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return None;
    }

    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in &chars {
        *counts.entry(*c).or_insert(0) += 1;
    }
    if let Some((c, count)) = counts.into_iter().max_by_key(|(_, count)| *count)
        && count as f64 > chars.len() as f64 * DOMINANT_CHAR_RATIO
    {
        return Some(format!(
            "character {:?} makes up {} of {} characters",
            c,
            count,
            chars.len()
        ));
    }

    let mut checked = std::collections::HashSet::new();
    for len in 2..=5 {
        let positions = PATTERN_SAMPLE_POSITIONS.min(chars.len().saturating_sub(len));
        for start in 0..positions {
            let pattern: String = chars[start..start + len].iter().collect();
            if !checked.insert(pattern.clone()) {
                continue;
            }
            let repeats = content
                .matches(pattern.as_str())
                .take(PATTERN_REPEAT_LIMIT + 1)
                .count();
            if repeats > PATTERN_REPEAT_LIMIT {
                return Some(format!("{:?} repeats more than {} times", pattern, PATTERN_REPEAT_LIMIT));
            }
        }
    }
    None
}
