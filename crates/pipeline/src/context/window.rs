//! Token-bounded history selection.
//!
//! Given a chronological batch of recent messages, keep the longest suffix
//! that fits the budget left after the system prompt. The newest message
//! is always kept; when it alone is too large it is cut down to fit.
//!
//! # Determinism
//!
//! Selection depends only on its inputs, so a replayed request yields the
//! same window.

use turnflow_core::message::Message;
use turnflow_core::token::TokenCounter;

// ── Types ─────────────────────────────────────────────────────────────────

/// Budget parameters for one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBudget {
    /// Ceiling for system prompt + messages.
    pub ceiling: u32,
    /// Token cost of the resolved system prompt.
    pub system_tokens: u32,
    /// Held back when hard-truncating the newest message.
    pub truncation_reserve: u32,
}

impl WindowBudget {
    /// Tokens available for messages. Zero when the system prompt alone
    /// reaches the ceiling.
    pub fn message_budget(&self) -> u32 {
        self.ceiling.saturating_sub(self.system_tokens)
    }
}

/// The selected window.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// Selected messages, chronological.
    pub messages: Vec<Message>,
    /// Sum of the selected messages' token counts.
    pub message_tokens: u32,
    /// Some eligible history was left out or cut.
    pub truncated: bool,
    /// The message whose content was hard-truncated, if any.
    pub truncated_message_id: Option<String>,
}

// ── Selection ─────────────────────────────────────────────────────────────

/// Fill in missing token counts. A count of zero means "not counted yet".
pub fn count_missing(messages: &mut [Message], counter: &dyn TokenCounter) {
    for message in messages.iter_mut().filter(|m| m.token_count == 0) {
        message.token_count = counter.count(&message.content);
    }
}

/// Select the window from `batch` (chronological, newest last).
///
/// `eligible` is the number of eligible history messages, of which `batch`
/// holds the most recent. When the batch fits but older eligible messages
/// exist outside it, the window is still marked truncated.
pub fn select_window(
    batch: Vec<Message>,
    eligible: usize,
    budget: WindowBudget,
    counter: &dyn TokenCounter,
) -> Window {
    let remaining = budget.message_budget();
    let batch_len = batch.len();

    let mut selected = Vec::with_capacity(batch_len);
    let mut used: u32 = 0;
    let mut truncated = false;
    let mut truncated_message_id = None;

    for (position, mut message) in batch.into_iter().rev().enumerate() {
        let cost = message.token_count;
        if used.saturating_add(cost) <= remaining {
            used += cost;
            selected.push(message);
            continue;
        }

        truncated = true;
        if position == 0 {
            // Newest message alone exceeds the budget: keep a prefix.
            let limit = remaining.saturating_sub(budget.truncation_reserve);
            message.content = counter.truncate(&message.content, limit);
            message.token_count = counter.count(&message.content).min(limit);
            used = message.token_count;
            truncated_message_id = Some(message.id.clone());
            selected.push(message);
        }
        break;
    }

    if !truncated && eligible > batch_len {
        truncated = true;
    }

    selected.reverse();
    Window {
        messages: selected,
        message_tokens: used,
        truncated,
        truncated_message_id,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use turnflow_core::message::ConversationId;
    use turnflow_core::token::CharHeuristic;

    fn msgs(costs: &[u32]) -> Vec<Message> {
        let conv = ConversationId::from("c1");
        costs
            .iter()
            .enumerate()
            .map(|(i, &c)| Message::user(&conv, format!("message {i}")).with_tokens(c))
            .collect()
    }

    fn budget(ceiling: u32, system_tokens: u32) -> WindowBudget {
        WindowBudget {
            ceiling,
            system_tokens,
            truncation_reserve: 10,
        }
    }

    #[test]
    fn everything_fits() {
        let batch = msgs(&[100, 150, 200]);
        let w = select_window(batch, 3, budget(4096, 50), &CharHeuristic);
        assert_eq!(w.messages.len(), 3);
        assert_eq!(w.message_tokens, 450);
        assert!(!w.truncated);
        assert_eq!(w.messages[0].content, "message 0");
        assert_eq!(w.messages[2].content, "message 2");
    }

    #[test]
    fn empty_history() {
        let w = select_window(Vec::new(), 0, budget(4096, 50), &CharHeuristic);
        assert!(w.messages.is_empty());
        assert_eq!(w.message_tokens, 0);
        assert!(!w.truncated);
    }

    #[test]
    fn oldest_dropped_first() {
        // Budget 300: newest 200 + 100 fit, the 150 before them does not
        let batch = msgs(&[50, 150, 100, 200]);
        let w = select_window(batch, 4, budget(350, 50), &CharHeuristic);
        let contents: Vec<_> = w.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 2", "message 3"]);
        assert_eq!(w.message_tokens, 300);
        assert!(w.truncated);
        assert!(w.truncated_message_id.is_none());
    }

    #[test]
    fn stops_at_first_message_that_does_not_fit() {
        // An older cheap message is not pulled in past a gap
        let batch = msgs(&[1, 500, 100]);
        let w = select_window(batch, 3, budget(250, 0), &CharHeuristic);
        assert_eq!(w.messages.len(), 1);
        assert!(w.truncated);
    }

    #[test]
    fn single_oversized_message_is_cut() {
        let conv = ConversationId::from("c1");
        let long = Message::user(&conv, "x".repeat(4000)).with_tokens(1000);
        let id = long.id.clone();

        let w = select_window(vec![long], 1, budget(200, 50), &CharHeuristic);
        assert_eq!(w.messages.len(), 1);
        assert!(w.truncated);
        assert_eq!(w.truncated_message_id, Some(id));
        // 150 remaining minus the 10-token reserve
        assert!(w.message_tokens <= 140);
        assert!(w.messages[0].content.len() <= 140 * 4);
        assert!(!w.messages[0].content.is_empty());
    }

    #[test]
    fn newest_oversized_drops_everything_older() {
        let conv = ConversationId::from("c1");
        let mut batch = msgs(&[10, 10]);
        batch.push(Message::user(&conv, "y".repeat(2000)).with_tokens(500));

        let w = select_window(batch, 3, budget(100, 0), &CharHeuristic);
        assert_eq!(w.messages.len(), 1);
        assert!(w.messages[0].content.starts_with('y'));
        assert!(w.truncated);
    }

    #[test]
    fn system_prompt_at_ceiling_leaves_nothing() {
        let batch = msgs(&[5]);
        let w = select_window(batch, 1, budget(100, 100), &CharHeuristic);
        assert_eq!(w.message_tokens, 0);
        assert!(w.truncated);
        assert_eq!(w.messages.len(), 1);
        assert!(w.messages[0].content.is_empty());
    }

    #[test]
    fn older_history_outside_batch_marks_truncated() {
        let batch = msgs(&[10, 10]);
        let w = select_window(batch, 40, budget(4096, 0), &CharHeuristic);
        assert_eq!(w.messages.len(), 2);
        assert!(w.truncated);
    }

    #[test]
    fn never_exceeds_ceiling() {
        let costs = [7u32, 300, 41, 999, 3, 120, 64, 2048, 1, 17];
        for ceiling in [0u32, 1, 50, 200, 512, 1000, 4096] {
            for system in [0u32, 10, 49, 199] {
                if system >= ceiling && ceiling != 0 {
                    continue;
                }
                for len in 0..=costs.len() {
                    let batch = msgs(&costs[..len]);
                    let b = budget(ceiling, system);
                    let w = select_window(batch, len, b, &CharHeuristic);
                    assert!(
                        system + w.message_tokens <= ceiling.max(system),
                        "ceiling {ceiling}, system {system}, len {len}"
                    );
                    let fits = costs[..len].iter().sum::<u32>() <= b.message_budget();
                    assert_eq!(w.truncated, !fits, "ceiling {ceiling}, system {system}, len {len}");
                }
            }
        }
    }

    #[test]
    fn missing_counts_are_filled() {
        let conv = ConversationId::from("c1");
        let mut batch = vec![
            Message::user(&conv, "12345678"),
            Message::user(&conv, "abc").with_tokens(9),
        ];
        count_missing(&mut batch, &CharHeuristic);
        assert_eq!(batch[0].token_count, 2);
        assert_eq!(batch[1].token_count, 9);
    }
}
