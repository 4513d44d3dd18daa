use serde::{Deserialize, Serialize};

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_documents: usize,
    pub processed_documents: usize,
    pub failed_documents: usize,
    pub total_chunks: usize,
    pub vectors_written: usize,
    /// Wall-clock seconds.
    pub processing_time: f64,
    /// Mean chunk length in characters over the run.
    pub average_chunk_size: f64,
    pub errors: Vec<String>,
}

impl ProcessingStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_documents == 0 {
            0.0
        } else {
            self.processed_documents as f64 / self.total_documents as f64
        }
    }

    pub fn record_success(&mut self, chunk_lengths: &[usize], vectors_written: usize) {
        let previous_chars = self.average_chunk_size * self.total_chunks as f64;
        let added_chars: usize = chunk_lengths.iter().sum();

        self.processed_documents += 1;
        self.total_chunks += chunk_lengths.len();
        self.vectors_written += vectors_written;
        self.average_chunk_size = if self.total_chunks == 0 {
            0.0
        } else {
            (previous_chars + added_chars as f64) / self.total_chunks as f64
        };
    }

    pub fn record_failure(&mut self, source: &str, error: impl std::fmt::Display) {
        self.failed_documents += 1;
        self.errors.push(format!("{}: {}", source, error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_empty_run() {
        assert_eq!(ProcessingStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_record_success_and_failure() {
        let mut stats = ProcessingStats {
            total_documents: 2,
            ..Default::default()
        };
        stats.record_success(&[100, 200], 2);
        stats.record_failure("b.txt", "file is empty");

        assert_eq!(stats.processed_documents, 1);
        assert_eq!(stats.failed_documents, 1);
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.average_chunk_size, 150.0);
        assert_eq!(stats.success_rate(), 0.5);
        assert_eq!(stats.errors, vec!["b.txt: file is empty".to_string()]);
    }

    #[test]
    fn test_average_accumulates_across_documents() {
        let mut stats = ProcessingStats::default();
        stats.record_success(&[100], 1);
        stats.record_success(&[200, 300], 2);
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.average_chunk_size, 200.0);
        assert_eq!(stats.vectors_written, 3);
    }
}
