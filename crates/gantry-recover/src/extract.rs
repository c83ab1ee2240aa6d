//! Candidate extraction: locate the one structured record inside free text.

use crate::RecoveryError;

const FENCE_OPEN: &str = "```json";
const FENCE_CLOSE: &str = "```";

/// Find the first balanced `{ ... }` span starting at the first `{`.
///
/// Braces are counted without regard to string literals. Only the first span
/// whose depth returns to zero is considered, and it is rejected unless it
/// contains at least one `"` and one `:`.
pub fn extract_balanced(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..=start + offset];
                    if candidate.contains('"') && candidate.contains(':') {
                        return Some(candidate);
                    }
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

/// Find the last ```` ```json ```` fenced block whose trimmed body is an object.
pub fn extract_fenced(text: &str) -> Option<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(FENCE_OPEN) {
        let body_start = open + FENCE_OPEN.len();
        let Some(close) = rest[body_start..].find(FENCE_CLOSE) else {
            break;
        };
        blocks.push(&rest[body_start..body_start + close]);
        rest = &rest[body_start + close + FENCE_CLOSE.len()..];
    }

    blocks
        .into_iter()
        .rev()
        .map(str::trim)
        .find(|b| b.starts_with('{') && b.ends_with('}'))
}

/// Run the extraction strategies in order; the first hit wins.
pub fn extract_candidate(text: &str) -> Result<&str, RecoveryError> {
    let text = text.trim();
    if let Some(candidate) = extract_balanced(text) {
        return Ok(candidate);
    }
    if let Some(candidate) = extract_fenced(text) {
        tracing::debug!("Brace counting found nothing, using fenced block");
        return Ok(candidate);
    }
    Err(RecoveryError::NoStructuredDataFound)
}
