//! Split outbound text to fit a backend's maximum message length.
//!
//! Lengths are counted in characters. Each cut is placed at the last paragraph break
//! inside the limit, else the last line break, else the last space, else a hard cut at
//! the limit. The break itself starts the next chunk, so joining the chunks gives back
//! the original text.

/// Split `text` into chunks of at most `max_len` characters. `max_len == 0` means no limit.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let window_end = match rest.char_indices().nth(max_len) {
            Some((i, _)) => i,
            None => {
                chunks.push(rest.to_string());
                break;
            }
        };
        let window = &rest[..window_end];
        let split_at = ["\n\n", "\n", " "]
            .iter()
            .find_map(|sep| window.rfind(sep).filter(|&i| i > 0))
            .unwrap_or(window_end);
        let (head, tail) = rest.split_at(split_at);
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}
