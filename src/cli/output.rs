use std::fmt::Write as FmtWrite;

use serde::Serialize;

use crate::models::{
    Chunk, ChatbotResponse, DocumentMatch, OutputFormat, ProcessingStats, SearchResults,
};
use crate::services::{CleaningStats, ChunkingStats, HealthReport, SystemStats};
use crate::utils::text::preview;

const PREVIEW_CHARS: usize = 200;

pub trait Formatter {
    fn format_search_results(&self, results: &SearchResults) -> String;
    fn format_answer(&self, response: &ChatbotResponse, show_sources: bool) -> String;
    fn format_ingestion(&self, stats: &ProcessingStats) -> String;
    fn format_status(&self, stats: &SystemStats, health: &HealthReport) -> String;
    fn format_chunk_preview(&self, preview: &ChunkPreview) -> String;
    fn format_message(&self, message: &str) -> String;
    fn format_error(&self, error: &str) -> String;
}

/// Offline chunking report for one document.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPreview {
    pub source: String,
    pub cleaning: CleaningStats,
    pub chunking: ChunkingStats,
    /// At most the requested number of chunks; `chunking` covers all of them.
    pub chunks: Vec<Chunk>,
}

fn clause_heading(m: &DocumentMatch) -> String {
    let meta = &m.document.metadata;
    match meta.clause_title.as_deref() {
        Some(title) if !title.is_empty() => format!("{} {}", meta.clause_number, title),
        _ => meta.clause_number.clone(),
    }
}

fn indent(output: &mut String, text: &str) {
    for line in text.lines() {
        writeln!(output, "   {}", line).unwrap();
    }
}

pub struct TextFormatter;

impl Formatter for TextFormatter {
    fn format_search_results(&self, results: &SearchResults) -> String {
        if results.is_empty() {
            return format!(
                "No clauses scored at least {:.2} for: {}\n",
                results.similarity_threshold, results.query
            );
        }

        let mut output = String::new();
        writeln!(output, "Search results for: \"{}\"", results.query).unwrap();
        writeln!(
            output,
            "Found {} clauses in {}ms\n",
            results.len(),
            results.duration_ms
        )
        .unwrap();

        for m in &results.matches {
            writeln!(output, "{}. [Score: {:.3}] {}", m.rank, m.score, clause_heading(m)).unwrap();
            writeln!(
                output,
                "   Source: {} ({})",
                m.document.metadata.source_file, m.document.metadata.clause_type
            )
            .unwrap();
            writeln!(output, "   ---").unwrap();
            indent(&mut output, &preview(m.document.content(), PREVIEW_CHARS));
            writeln!(output).unwrap();
        }

        output
    }

    fn format_answer(&self, response: &ChatbotResponse, show_sources: bool) -> String {
        let mut output = String::new();
        writeln!(output, "{}\n", response.answer.trim_end()).unwrap();
        writeln!(
            output,
            "Confidence: {:.2}  Model: {}  Time: {:.2}s",
            response.confidence(),
            response.model_used,
            response.response_time()
        )
        .unwrap();

        if show_sources && !response.sources.is_empty() {
            writeln!(output, "\nSources:").unwrap();
            for (i, source) in response.sources.iter().enumerate() {
                writeln!(
                    output,
                    "{}. {} ({}) [Score: {:.3}]",
                    i + 1,
                    source.clause_number,
                    source.source_file,
                    source.relevance_score
                )
                .unwrap();
                indent(&mut output, &source.content_snippet);
            }
        }

        output
    }

    fn format_ingestion(&self, stats: &ProcessingStats) -> String {
        let mut output = String::new();
        writeln!(output, "Ingestion Complete").unwrap();
        writeln!(output, "------------------").unwrap();
        writeln!(
            output,
            "Documents:     {}/{} processed ({} failed)",
            stats.processed_documents, stats.total_documents, stats.failed_documents
        )
        .unwrap();
        writeln!(output, "Chunks:        {}", stats.total_chunks).unwrap();
        writeln!(output, "Vectors:       {}", stats.vectors_written).unwrap();
        writeln!(output, "Avg chunk:     {:.1} chars", stats.average_chunk_size).unwrap();
        writeln!(output, "Success rate:  {:.1}%", stats.success_rate() * 100.0).unwrap();
        writeln!(output, "Duration:      {:.2}s", stats.processing_time).unwrap();

        if !stats.errors.is_empty() {
            writeln!(output, "\nErrors:").unwrap();
            for error in &stats.errors {
                writeln!(output, "  - {}", error).unwrap();
            }
        }

        output
    }

    fn format_status(&self, stats: &SystemStats, health: &HealthReport) -> String {
        let status = |healthy: bool| if healthy { "[OK]" } else { "[UNAVAILABLE]" };

        let mut output = String::new();
        writeln!(output, "Status").unwrap();
        writeln!(output, "------").unwrap();
        writeln!(output, "State:         {}", stats.state).unwrap();
        writeln!(output).unwrap();

        writeln!(output, "Embedding:     {}", status(health.embedding.healthy)).unwrap();
        writeln!(output, "  Model:       {}", stats.embedding_model).unwrap();
        writeln!(output, "  Dimension:   {}", stats.embedding_dimension).unwrap();
        if !health.embedding.healthy {
            writeln!(output, "  Error:       {}", health.embedding.detail).unwrap();
        }
        writeln!(output).unwrap();

        writeln!(output, "Vector Index:  {}", status(health.index.healthy)).unwrap();
        if let Some(ref index) = stats.index {
            writeln!(output, "  Backend:     {}", index.backend).unwrap();
            writeln!(output, "  Index:       {}", index.index_name).unwrap();
            writeln!(output, "  Namespace:   {}", index.namespace).unwrap();
            writeln!(
                output,
                "  Vectors:     {} ({} total)",
                index.namespace_vectors, index.total_vectors
            )
            .unwrap();
        }
        if let Some(ref error) = stats.index_error {
            writeln!(output, "  Error:       {}", error).unwrap();
        }
        writeln!(output).unwrap();

        writeln!(output, "Retrieval").unwrap();
        writeln!(output, "  Top k:       {}", stats.top_k).unwrap();
        writeln!(output, "  Threshold:   {:.2}", stats.similarity_threshold).unwrap();
        writeln!(
            output,
            "  Chunking:    {} chars, {} overlap",
            stats.chunk_size, stats.chunk_overlap
        )
        .unwrap();

        output
    }

    fn format_chunk_preview(&self, chunk_preview: &ChunkPreview) -> String {
        let cleaning = &chunk_preview.cleaning;
        let chunking = &chunk_preview.chunking;

        let mut output = String::new();
        writeln!(output, "Chunking: {}", chunk_preview.source).unwrap();
        writeln!(
            output,
            "Cleaned {} -> {} chars ({} lines -> {})",
            cleaning.original_length,
            cleaning.cleaned_length,
            cleaning.original_lines,
            cleaning.cleaned_lines
        )
        .unwrap();
        writeln!(
            output,
            "{} chunks, avg {:.1} chars (min {}, max {})",
            chunking.total_chunks, chunking.average_size, chunking.min_size, chunking.max_size
        )
        .unwrap();
        let types: Vec<String> = chunking
            .clause_types
            .iter()
            .map(|(t, n)| format!("{}={}", t, n))
            .collect();
        writeln!(output, "Clause types: {}\n", types.join(", ")).unwrap();

        for (i, chunk) in chunk_preview.chunks.iter().enumerate() {
            let meta = &chunk.metadata;
            writeln!(
                output,
                "{}. {} [{}] chars {}..{}",
                i + 1,
                meta.clause_number,
                meta.clause_type,
                meta.char_start,
                meta.char_end
            )
            .unwrap();
            indent(&mut output, &preview(chunk.content(), PREVIEW_CHARS));
            writeln!(output).unwrap();
        }

        output
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}", error)
    }
}

pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn render<T: Serialize + ?Sized>(&self, value: &T) -> String {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        rendered.unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
    }
}

impl Formatter for JsonFormatter {
    fn format_search_results(&self, results: &SearchResults) -> String {
        self.render(results)
    }

    fn format_answer(&self, response: &ChatbotResponse, show_sources: bool) -> String {
        if show_sources {
            return self.render(response);
        }
        let mut stripped = response.clone();
        stripped.sources.clear();
        self.render(&stripped)
    }

    fn format_ingestion(&self, stats: &ProcessingStats) -> String {
        let json = serde_json::json!({
            "stats": stats,
            "success_rate": stats.success_rate(),
        });
        self.render(&json)
    }

    fn format_status(&self, stats: &SystemStats, health: &HealthReport) -> String {
        let json = serde_json::json!({
            "stats": stats,
            "health": health,
        });
        self.render(&json)
    }

    fn format_chunk_preview(&self, chunk_preview: &ChunkPreview) -> String {
        self.render(chunk_preview)
    }

    fn format_message(&self, message: &str) -> String {
        self.render(&serde_json::json!({ "message": message }))
    }

    fn format_error(&self, error: &str) -> String {
        self.render(&serde_json::json!({ "error": error }))
    }
}

pub struct MarkdownFormatter;

impl Formatter for MarkdownFormatter {
    fn format_search_results(&self, results: &SearchResults) -> String {
        if results.is_empty() {
            return format!("## No results found\n\nQuery: `{}`\n", results.query);
        }

        let mut output = String::new();
        writeln!(output, "## Search Results\n").unwrap();
        writeln!(output, "**Query:** `{}`\n", results.query).unwrap();
        writeln!(
            output,
            "Found {} clauses in {}ms\n",
            results.len(),
            results.duration_ms
        )
        .unwrap();

        for m in &results.matches {
            writeln!(output, "### {}. {} (score {:.3})\n", m.rank, clause_heading(m), m.score)
                .unwrap();
            writeln!(output, "**Source:** `{}`\n", m.document.metadata.source_file).unwrap();
            writeln!(output, "```").unwrap();
            writeln!(output, "{}", m.document.content()).unwrap();
            writeln!(output, "```\n").unwrap();
        }

        output
    }

    fn format_answer(&self, response: &ChatbotResponse, show_sources: bool) -> String {
        let mut output = String::new();
        writeln!(output, "## Answer\n").unwrap();
        writeln!(output, "{}\n", response.answer.trim_end()).unwrap();
        writeln!(
            output,
            "*Confidence {:.2} · {} · {:.2}s*\n",
            response.confidence(),
            response.model_used,
            response.response_time()
        )
        .unwrap();

        if show_sources && !response.sources.is_empty() {
            writeln!(output, "### Sources\n").unwrap();
            writeln!(output, "| Clause | File | Score |").unwrap();
            writeln!(output, "|--------|------|-------|").unwrap();
            for source in &response.sources {
                writeln!(
                    output,
                    "| {} | `{}` | {:.3} |",
                    source.clause_number, source.source_file, source.relevance_score
                )
                .unwrap();
            }
        }

        output
    }

    fn format_ingestion(&self, stats: &ProcessingStats) -> String {
        let mut output = String::new();
        writeln!(output, "## Ingestion Complete\n").unwrap();
        writeln!(output, "| Metric | Value |").unwrap();
        writeln!(output, "|--------|-------|").unwrap();
        writeln!(output, "| Documents | {} |", stats.total_documents).unwrap();
        writeln!(output, "| Processed | {} |", stats.processed_documents).unwrap();
        writeln!(output, "| Failed | {} |", stats.failed_documents).unwrap();
        writeln!(output, "| Chunks | {} |", stats.total_chunks).unwrap();
        writeln!(output, "| Vectors | {} |", stats.vectors_written).unwrap();
        writeln!(output, "| Duration | {:.2}s |", stats.processing_time).unwrap();

        if !stats.errors.is_empty() {
            writeln!(output, "\n### Errors\n").unwrap();
            for error in &stats.errors {
                writeln!(output, "- {}", error).unwrap();
            }
        }
        output
    }

    fn format_status(&self, stats: &SystemStats, health: &HealthReport) -> String {
        let icon = |healthy: bool| if healthy { "✅" } else { "❌" };

        let mut output = String::new();
        writeln!(output, "## Status: `{}`\n", stats.state).unwrap();
        writeln!(output, "### Embedding {}\n", icon(health.embedding.healthy)).unwrap();
        writeln!(output, "- **Model:** {}", stats.embedding_model).unwrap();
        writeln!(output, "- **Detail:** {}\n", health.embedding.detail).unwrap();
        writeln!(output, "### Vector Index {}\n", icon(health.index.healthy)).unwrap();
        if let Some(ref index) = stats.index {
            writeln!(output, "- **Backend:** {}", index.backend).unwrap();
            writeln!(output, "- **Namespace:** `{}`", index.namespace).unwrap();
            writeln!(output, "- **Vectors:** {}", index.namespace_vectors).unwrap();
        } else {
            writeln!(output, "- **Detail:** {}", health.index.detail).unwrap();
        }
        output
    }

    fn format_chunk_preview(&self, chunk_preview: &ChunkPreview) -> String {
        let mut output = String::new();
        writeln!(output, "## Chunks: `{}`\n", chunk_preview.source).unwrap();
        writeln!(output, "| # | Clause | Type | Length |").unwrap();
        writeln!(output, "|---|--------|------|--------|").unwrap();
        for (i, chunk) in chunk_preview.chunks.iter().enumerate() {
            let meta = &chunk.metadata;
            writeln!(
                output,
                "| {} | {} | {} | {} |",
                i + 1,
                meta.clause_number,
                meta.clause_type,
                meta.chunk_length
            )
            .unwrap();
        }
        writeln!(
            output,
            "\n{} chunks in total, average {:.1} chars",
            chunk_preview.chunking.total_chunks, chunk_preview.chunking.average_size
        )
        .unwrap();
        output
    }

    fn format_message(&self, message: &str) -> String {
        format!("> {}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("> ⚠️ **Error:** {}\n", error)
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Text => Box::new(TextFormatter),
        OutputFormat::Json => Box::new(JsonFormatter::new(true)),
        OutputFormat::Markdown => Box::new(MarkdownFormatter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClauseType, SourceCitation, sample_metadata};

    fn results() -> SearchResults {
        let chunk = Chunk::new(
            "第3條 旅程延誤\n班機延誤超過四小時給付。",
            sample_metadata("3", ClauseType::Coverage),
        )
        .unwrap();
        SearchResults::new(
            "班機延誤".to_string(),
            vec![DocumentMatch::new(chunk, 0.91, 1)],
            0.8,
            12,
        )
    }

    #[test]
    fn test_text_search_results() {
        let text = TextFormatter.format_search_results(&results());
        assert!(text.contains("1. [Score: 0.910] 3 旅程延誤"));
        assert!(text.contains("Source: policy.txt (coverage)"));
    }

    #[test]
    fn test_text_empty_results_mention_threshold() {
        let empty = SearchResults::new("行李".to_string(), vec![], 0.8, 3);
        assert!(TextFormatter.format_search_results(&empty).contains("0.80"));
    }

    #[test]
    fn test_json_answer_can_hide_sources() {
        let response = ChatbotResponse::new(
            "班機延誤",
            "可以申請。",
            vec![SourceCitation {
                clause_number: "3".to_string(),
                source_file: "policy.txt".to_string(),
                content_snippet: "第3條".to_string(),
                relevance_score: 0.9,
                chunk_id: "id".to_string(),
            }],
            0.8,
            0.5,
            "m",
        )
        .unwrap();

        let formatter = JsonFormatter::new(false);
        let with: serde_json::Value =
            serde_json::from_str(&formatter.format_answer(&response, true)).unwrap();
        let without: serde_json::Value =
            serde_json::from_str(&formatter.format_answer(&response, false)).unwrap();
        assert_eq!(with["sources"].as_array().unwrap().len(), 1);
        assert!(without["sources"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_markdown_ingestion_lists_errors() {
        let mut stats = ProcessingStats {
            total_documents: 2,
            ..Default::default()
        };
        stats.record_success(&[120], 1);
        stats.record_failure("b.txt", "file is empty");
        let md = MarkdownFormatter.format_ingestion(&stats);
        assert!(md.contains("| Failed | 1 |"));
        assert!(md.contains("- b.txt: file is empty"));
    }
}
