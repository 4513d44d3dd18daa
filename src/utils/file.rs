//! File utilities for document ingestion.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Calculate SHA-256 checksum of content.
pub fn calculate_checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Calculate SHA-256 checksum of a file's raw bytes.
pub fn calculate_file_checksum(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(calculate_checksum(&bytes))
}

/// Text decoded from a policy file, plus the encoding that worked.
#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    pub encoding: &'static str,
}

/// Read a document as UTF-8, falling back to Big5 for legacy Traditional-Chinese files.
pub fn read_document_text(path: &Path) -> std::io::Result<DecodedText> {
    let bytes = fs::read(path)?;
    decode_document_bytes(bytes)
}

pub fn decode_document_bytes(bytes: Vec<u8>) -> std::io::Result<DecodedText> {
    match String::from_utf8(bytes) {
        Ok(text) => Ok(DecodedText {
            text: text.trim_start_matches('\u{feff}').to_string(),
            encoding: "utf-8",
        }),
        Err(err) => {
            let bytes = err.into_bytes();
            let (text, _, had_errors) = encoding_rs::BIG5.decode(&bytes);
            if had_errors {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "content is neither valid UTF-8 nor Big5",
                ));
            }
            Ok(DecodedText {
                text: text.into_owned(),
                encoding: "big5",
            })
        }
    }
}

/// Whether `path` ends with one of `extensions` (each written with its leading dot).
pub fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = format!(".{}", ext.to_string_lossy().to_lowercase());
    extensions.iter().any(|allowed| allowed.to_lowercase() == ext)
}

/// Files directly inside `dir` with an allowed extension, sorted by path.
pub fn list_documents(dir: &Path, extensions: &[String]) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_file() && has_allowed_extension(entry.path(), extensions) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Sanitize a filename by replacing invalid characters.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
