//! Character-aware string helpers shared by chunking, reply rendering, and
//! error sanitising. Platform limits are counted in characters, never bytes.

/// Byte offset of the `chars`-th character of `s`, or `s.len()` if `s` is shorter.
pub fn char_byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(idx, _)| idx)
}

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// # Examples
/// ```
/// use duobot::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
/// assert_eq!(truncate_with_ellipsis("short", 10), "short");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    let end = char_byte_offset(s, max_chars);
    if end == s.len() {
        return s.to_string();
    }
    // Trim trailing whitespace for cleaner output
    format!("{}...", s[..end].trim_end())
}
