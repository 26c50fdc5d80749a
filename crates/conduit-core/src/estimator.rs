use crate::types::Message;

/// Fixed per-message overhead added on top of content-character estimation,
/// accounting for role/formatting tokens a real tokenizer would spend.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Deterministic character-based token estimator. No I/O, no network call
/// to a real tokenizer — every budget decision in this codebase (quota,
/// context shaping, checkpoint sizing) goes through this single function
/// so estimates are consistent and reproducible across runs.
pub fn estimate_text(s: &str) -> u64 {
    if s.is_empty() {
        return 0;
    }
    // ceil(chars / 4), counted in Unicode scalar values rather than bytes
    // so multi-byte UTF-8 doesn't inflate the estimate.
    let chars = s.chars().count() as u64;
    chars.div_ceil(4)
}

pub fn estimate_message(message: &Message) -> u64 {
    estimate_text(&message.content.render()) + MESSAGE_OVERHEAD_TOKENS
}

/// Sum of per-message estimates, plus an optional system prompt's own
/// estimate (not wrapped in a Message, so no per-message overhead).
pub fn estimate_messages(messages: &[Message], system_prompt: Option<&str>) -> u64 {
    let mut total: u64 = messages.iter().map(estimate_message).sum();
    if let Some(prompt) = system_prompt {
        total += estimate_text(prompt);
    }
    total
}

/// Result of `fit_recent`: the messages that fit within budget (in their
/// original relative order) and the indices (into the input slice) of the
/// messages that were omitted to make room.
pub struct FitResult {
    pub messages: Vec<Message>,
    pub omitted_indices: Vec<usize>,
    pub token_count: u64,
}

/// Walk `messages` newest-to-oldest, greedily keeping a message only if the
/// running token total stays within `budget`. The returned slice preserves
/// the original chronological order; omitted indices are returned so
/// callers can record marks (pruned/truncated) against the source entries.
pub fn fit_recent(messages: &[Message], budget: u64) -> FitResult {
    let mut kept_indices: Vec<usize> = Vec::new();
    let mut running_total: u64 = 0;

    for (idx, message) in messages.iter().enumerate().rev() {
        let cost = estimate_message(message);
        if running_total + cost > budget {
            continue;
        }
        running_total += cost;
        kept_indices.push(idx);
    }
    kept_indices.sort_unstable();

    let kept_set: std::collections::HashSet<usize> = kept_indices.iter().copied().collect();
    let omitted_indices: Vec<usize> = (0..messages.len())
        .filter(|i| !kept_set.contains(i))
        .collect();

    FitResult {
        messages: kept_indices.into_iter().map(|i| messages[i].clone()).collect(),
        omitted_indices,
        token_count: running_total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn empty_string_estimates_zero() {
        assert_eq!(estimate_text(""), 0);
    }

    #[test]
    fn estimate_text_matches_ceil_chars_over_4() {
        assert_eq!(estimate_text("a"), 1);
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
        assert_eq!(estimate_text("abcdefgh"), 2);
    }

    #[test]
    fn message_estimate_adds_fixed_overhead() {
        let msg = Message::user("abcd");
        assert_eq!(estimate_message(&msg), 1 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn fit_recent_preserves_order_and_drops_oldest_first() {
        let messages = vec![
            Message::new(Role::User, "a".repeat(400)),
            Message::new(Role::User, "b".repeat(400)),
            Message::new(Role::User, "c".repeat(400)),
        ];
        // Each message costs 100 + 4 = 104 tokens. Budget for two.
        let result = fit_recent(&messages, 210);
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.omitted_indices, vec![0]);
        // Order preserved: message[1] before message[2].
        assert_eq!(result.messages[0].content, messages[1].content);
        assert_eq!(result.messages[1].content, messages[2].content);
    }

    #[test]
    fn fit_recent_zero_budget_omits_everything() {
        let messages = vec![Message::user("hello")];
        let result = fit_recent(&messages, 0);
        assert!(result.messages.is_empty());
        assert_eq!(result.omitted_indices, vec![0]);
    }
}
