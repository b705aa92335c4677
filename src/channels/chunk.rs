//! Splits oversized replies into platform-legal segments.
//!
//! Lengths are counted in characters. Each cut prefers the last newline at or
//! before the limit, then the last whitespace, then a hard cut at the limit.
//! The remainder is left-trimmed before the next pass, so concatenating the
//! chunks reproduces the input up to whitespace at cut points.

use crate::util::char_byte_offset;

/// Discord rejects messages longer than this.
pub const DISCORD_MAX_MESSAGE_CHARS: usize = 2000;

/// Leaves headroom below the platform cap for a pagination marker.
pub const DEFAULT_CHUNK_LIMIT: usize = 1900;

/// Split `text` into chunks of at most `limit` characters.
///
/// Always returns at least one element; text that already fits is returned
/// unchanged as a single chunk. A `limit` of 0 is treated as 1.
pub fn chunk(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        let window_end = char_byte_offset(remaining, limit);
        if window_end == remaining.len() {
            if chunks.is_empty() || !remaining.is_empty() {
                chunks.push(remaining.to_string());
            }
            break;
        }

        let cut = cut_point(&remaining[..window_end]);
        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start();
    }

    chunks
}

/// Byte index to cut `window` at. Never 0, so every pass makes progress.
fn cut_point(window: &str) -> usize {
    window
        .rfind('\n')
        .filter(|&pos| pos > 0)
        .or_else(|| window.rfind(char::is_whitespace).filter(|&pos| pos > 0))
        .unwrap_or(window.len())
}
