/// Shortens `text` to `max_chars` characters by cutting out the middle.
///
/// At least `min_head` leading characters survive (capped at `max_chars`);
/// the rest of the budget goes to the tail. The cut is marked with the number
/// of characters removed. Text that already fits is returned unchanged.
pub fn truncate_middle(text: &str, max_chars: usize, min_head: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let head = (max_chars / 2).max(min_head).min(max_chars);
    let tail = max_chars - head;
    let omitted = total - head - tail;

    let head_end = byte_offset(text, head);
    let tail_start = byte_offset(text, total - tail);

    format!(
        "{}\n\n[... {omitted} characters omitted ...]\n\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map_or(text.len(), |(offset, _)| offset)
}
