use std::path::Path;
use thiserror::Error;

/// Longest file name accepted, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

/// Reduces a client-supplied name to a single safe path component so it can
/// be embedded in a storage key.
pub fn sanitize_file_name(file_name: &str) -> Result<String, ValidationError> {
    // Normalise Windows separators so only the last component survives
    let normalised = file_name.replace('\\', "/");
    let name = Path::new(&normalised)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .trim();

    if name.is_empty() {
        return Err(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        });
    }

    if file_name.contains("..") || file_name.contains('/') || file_name.contains('\\') {
        tracing::warn!("Path components stripped from upload filename: {}", file_name);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > MAX_FILE_NAME_LEN {
        let mut end = MAX_FILE_NAME_LEN;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if sanitized.starts_with('.') {
        return Err(ValidationError {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        });
    }

    Ok(sanitized)
}
