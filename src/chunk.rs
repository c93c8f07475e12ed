//! Outbound message chunking.
//!
//! Chat platforms cap message length (Discord at 2000 chars); outbound
//! content is split at 1800 to stay safely below every platform cap.
//! Splitting respects line boundaries where possible and never leaves a
//! chunk ending inside an unclosed code fence: the fence is closed at the
//! chunk boundary and reopened (with the same info string) in the next
//! chunk.

/// Engine-side chunk limit, below the smallest platform cap.
pub const CHUNK_LIMIT: usize = 1800;

/// Returns the fence info string if the line opens or closes a fence.
fn fence_marker(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some(trimmed.trim_start_matches('`').trim())
    } else {
        None
    }
}

/// Split `text` into chunks of at most `limit` characters.
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // Info string of the currently open fence, if any. `Some("")` means a
    // bare ``` fence.
    let mut open_fence: Option<String> = None;

    // Close an open fence, push the chunk, and reopen the fence (same
    // info string, no trailing newline) in the fresh chunk so code
    // blocks render across the split.
    let flush = |chunks: &mut Vec<String>, current: &mut String, open_fence: &Option<String>| {
        if current.is_empty() {
            return;
        }
        if open_fence.is_some() {
            current.push_str("\n```");
        }
        chunks.push(std::mem::take(current));
        if let Some(info) = open_fence {
            current.push_str("```");
            current.push_str(info);
        }
    };

    for line in text.lines() {
        // Room kept to close the fence if this chunk ends mid-block. A
        // fence-marker line reserves too: it may open a block that has
        // to be closed at the very next boundary.
        let reserve = if open_fence.is_some() || fence_marker(line).is_some() {
            4
        } else {
            0
        };

        let needed = if current.is_empty() {
            line.len()
        } else {
            current.len() + 1 + line.len()
        };

        if needed + reserve > limit {
            flush(&mut chunks, &mut current, &open_fence);

            // A single line longer than the limit is hard-split.
            if current.len() + 1 + line.len() + reserve > limit {
                let mut remaining = line;
                loop {
                    let sep = if current.is_empty() { 0 } else { 1 };
                    let budget = limit.saturating_sub(current.len() + sep + reserve);
                    if remaining.len() <= budget {
                        break;
                    }
                    // Back off to a char boundary.
                    let mut cut = budget;
                    while cut > 0 && !remaining.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    if cut == 0 {
                        break;
                    }
                    if !current.is_empty() {
                        current.push('\n');
                    }
                    current.push_str(&remaining[..cut]);
                    remaining = &remaining[cut..];
                    flush(&mut chunks, &mut current, &open_fence);
                }
                if !remaining.is_empty() {
                    if !current.is_empty() {
                        current.push('\n');
                    }
                    current.push_str(remaining);
                }
                if let Some(info) = fence_marker(line) {
                    open_fence = match open_fence {
                        None => Some(info.to_string()),
                        Some(_) => None,
                    };
                }
                continue;
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        if let Some(info) = fence_marker(line) {
            open_fence = match open_fence {
                None => Some(info.to_string()),
                Some(_) => None,
            };
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_passthrough() {
        let chunks = chunk_message("hello", CHUNK_LIMIT);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn test_no_chunk_exceeds_limit() {
        let text = (0..200)
            .map(|i| format!("line number {} with some padding text", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_message(&text, 300);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 300, "chunk of {} chars", chunk.len());
        }
    }

    #[test]
    fn test_roundtrip_without_fences() {
        let text = (0..100)
            .map(|i| format!("row {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_message(&text, 120);
        // Joining with the newline removed between chunks restores input
        assert_eq!(chunks.join("\n"), text);
    }

    #[test]
    fn test_oversized_single_line_is_hard_split() {
        let text = "x".repeat(5000);
        let chunks = chunk_message(&text, 1000);
        for chunk in &chunks {
            assert!(chunk.len() <= 1000);
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_fence_closed_and_reopened_across_chunks() {
        let mut text = String::from("```rust\n");
        for i in 0..80 {
            text.push_str(&format!("let v{} = {};\n", i, i));
        }
        text.push_str("```");

        let chunks = chunk_message(&text, 400);
        assert!(chunks.len() > 1);

        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.len() <= 400);
            // Every chunk has balanced fences: an even number of markers
            let markers = chunk
                .lines()
                .filter(|l| l.trim_start().starts_with("```"))
                .count();
            assert_eq!(markers % 2, 0, "chunk {} has unbalanced fences", i);
        }

        // Continuation chunks reopen with the original info string
        for chunk in &chunks[1..] {
            assert!(chunk.starts_with("```rust\n"), "chunk missing reopen");
        }
    }

    #[test]
    fn test_text_after_closed_fence_not_wrapped() {
        let text = format!("```\ncode\n```\n{}", "tail line\n".repeat(40));
        let chunks = chunk_message(&text, 200);
        // The last chunk holds plain tail lines with no fence markers
        let last = chunks.last().unwrap();
        assert!(!last.contains("```"));
    }
}
