//! Message splitting shared by the platform adapters.

/// Split a message into chunks that fit within a platform's length limit.
/// Tries to split at newlines, then spaces, then hard-cuts.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let safe_max = {
            let mut i = max_len.min(remaining.len());
            while !remaining.is_char_boundary(i) {
                i -= 1;
            }
            i
        };

        let split_at = remaining[..safe_max]
            .rfind('\n')
            .or_else(|| remaining[..safe_max].rfind(' '))
            .unwrap_or(safe_max);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

/// Split, dropping chunks that end up empty after trimming.
pub fn split_message_non_empty(text: &str, max_len: usize) -> Vec<String> {
    split_message(text, max_len)
        .into_iter()
        .filter(|chunk| !chunk.trim().is_empty())
        .collect()
}
