//! Context window utilities: token estimation and history truncation.
//!
//! These are opt-in helpers - nothing is automatic. The loop owner
//! decides when to measure and when to trim.
//!
//! Estimation is character-based (1 token ≈ 4 characters), which lands
//! within ~15-30% of real tokenizer counts across model families; keep a
//! safety margin when checking limits.

use crate::history::{ContentBlock, Message, MessageContent};

/// Estimate the token count for a message list.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;
    for message in messages {
        // Role formatting overhead, ~2 tokens.
        total_chars += 8;
        match &message.content {
            MessageContent::Text(text) => total_chars += text.len(),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => total_chars += text.len(),
                        // Image references count their URL; actual image
                        // token cost is provider-specific.
                        ContentBlock::ImageUrl { url } => total_chars += url.len(),
                    }
                }
            }
        }
        if let Some(id) = &message.tool_call_id {
            total_chars += id.len();
        }
    }
    // Conversation-level overhead.
    total_chars += 16;

    total_chars.div_ceil(4)
}

/// Whether the estimate is within `margin` tokens of the limit.
pub fn is_approaching_limit(messages: &[Message], limit: usize, margin: usize) -> bool {
    estimate_tokens(messages) + margin >= limit
}

/// Keep the most recent `keep_recent` messages, optionally preserving a
/// leading system prompt. This is simple truncation - it does not try to
/// keep tool-call/result pairs intact.
pub fn truncate_messages(
    messages: &[Message],
    keep_recent: usize,
    preserve_system: bool,
) -> Vec<Message> {
    if messages.len() <= keep_recent {
        return messages.to_vec();
    }

    let mut result = Vec::new();
    let mut rest = messages;

    if preserve_system {
        if let Some(first) = messages.first() {
            if first.role == crate::history::MessageRole::System {
                result.push(first.clone());
                rest = &messages[1..];
            }
        }
    }

    let start = rest.len().saturating_sub(keep_recent);
    result.extend_from_slice(&rest[start..]);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{Message, MessageRole};

    #[test]
    fn test_estimate_empty() {
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[test]
    fn test_estimate_scales_with_content() {
        let short = vec![Message::user("hi")];
        let long = vec![Message::user("a".repeat(4000))];
        assert!(estimate_tokens(&long) > estimate_tokens(&short));
        // 4000 chars ≈ 1000 tokens plus overhead.
        let estimate = estimate_tokens(&long);
        assert!((1000..1100).contains(&estimate), "estimate was {estimate}");
    }

    #[test]
    fn test_truncate_preserves_system_prompt() {
        let mut messages = vec![Message::system("be brief")];
        for i in 0..10 {
            messages.push(Message::user(format!("message {i}")));
        }

        let truncated = truncate_messages(&messages, 3, true);
        assert_eq!(truncated.len(), 4);
        assert_eq!(truncated[0].role, MessageRole::System);
        assert_eq!(truncated.last().unwrap().content.as_text(), "message 9");
    }

    #[test]
    fn test_truncate_noop_when_short() {
        let messages = vec![Message::user("one"), Message::user("two")];
        assert_eq!(truncate_messages(&messages, 5, true).len(), 2);
    }

    #[test]
    fn test_is_approaching_limit() {
        let messages = vec![Message::user("a".repeat(400))];
        assert!(is_approaching_limit(&messages, 110, 10));
        assert!(!is_approaching_limit(&messages, 10_000, 100));
    }
}
