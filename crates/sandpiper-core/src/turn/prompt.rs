//! Prompt and title construction from conversation history.

use sandpiper_state::{MessageRecord, MessageRole};

const TITLE_MAX_CHARS: usize = 80;

/// Build the model prompt for `message` given earlier messages.
///
/// Without history the prompt is the message itself. A trailing history
/// entry equal to `message` (already recorded for this turn) is skipped.
pub fn build_prompt(history: &[MessageRecord], message: &str) -> String {
    let history = match history.split_last() {
        Some((last, rest)) if last.content == message => rest,
        _ => history,
    };
    if history.is_empty() {
        return message.to_string();
    }

    let mut parts: Vec<String> = history
        .iter()
        .map(|m| format!("{}: {}", role_label(m.role), m.content))
        .collect();
    parts.push(format!("User: {message}"));
    parts.join("\n\n")
}

/// Conversation title derived from the first user message.
pub fn derive_title(message: &str) -> String {
    let trimmed = message.trim();
    let head: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if head.chars().count() >= TITLE_MAX_CHARS {
        let cut: String = head.chars().take(TITLE_MAX_CHARS - 3).collect();
        format!("{cut}...")
    } else {
        head
    }
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "User",
        MessageRole::Assistant => "Assistant",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sandpiper_state::ConversationId;

    fn msg(role: MessageRole, content: &str) -> MessageRecord {
        MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: ConversationId("c".into()),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_without_history_is_message() {
        assert_eq!(build_prompt(&[], "how many rows?"), "how many rows?");
        let only_current = [msg(MessageRole::User, "how many rows?")];
        assert_eq!(build_prompt(&only_current, "how many rows?"), "how many rows?");
    }

    #[test]
    fn test_prompt_with_history() {
        let history = [
            msg(MessageRole::User, "list tables"),
            msg(MessageRole::Assistant, "titanic and pokemon"),
            msg(MessageRole::User, "count titanic"),
        ];
        assert_eq!(
            build_prompt(&history, "count titanic"),
            "User: list tables\n\nAssistant: titanic and pokemon\n\nUser: count titanic"
        );
    }

    #[test]
    fn test_derive_title() {
        assert_eq!(derive_title("  short question  "), "short question");
        let long = "x".repeat(100);
        let title = derive_title(&long);
        assert_eq!(title.len(), 80);
        assert!(title.ends_with("..."));
        assert_eq!(derive_title(&"y".repeat(79)), "y".repeat(79));
        assert_eq!(derive_title(&"z".repeat(80)).len(), 80);
    }
}
