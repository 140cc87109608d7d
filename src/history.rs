//! Conversation history: an append-only message log with multimodal
//! content.
//!
//! Messages never mutate once appended and causal order is preserved;
//! readers receive snapshots. Roles need not alternate - tool messages
//! interleave freely. Content is either a plain string or an ordered
//! list of typed blocks (text, image URLs the provider can consume).

use serde::{Deserialize, Serialize};

/// Who sent a message. Serializes to the lowercase strings the
/// OpenAI-compatible wire format expects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One typed block of multimodal content. Image blocks carry data-URLs
/// or references the LLM client resolves; the interpreter never touches
/// image bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { url: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        ContentBlock::ImageUrl { url: url.into() }
    }
}

/// Message content: a plain string or a block list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to plain text (image blocks are elided).
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<Vec<ContentBlock>> for MessageContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Blocks(blocks)
    }
}

/// A complete message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
    /// Correlates a tool message to the tool call it answers.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_call_id: Option<String>,
    /// Optional sender name (e.g. the tool's name on tool messages).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// A tool-result message: `{role: "tool", tool_call_id, content}`.
    /// The content is the full `str(result)` form - observation
    /// truncation does not apply here.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Append-only ordered message log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// Shallow copy as a provider-ready array.
    pub fn to_list(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_grows_by_exactly_one() {
        let mut history = ConversationHistory::new();
        let before = history.to_list().len();
        history.append(Message::user("hello"));
        let after = history.to_list();
        assert_eq!(after.len(), before + 1);
        assert_eq!(after.last().unwrap().content.as_text(), "hello");
    }

    #[test]
    fn test_roles_need_not_alternate() {
        let mut history = ConversationHistory::new();
        history.append(Message::assistant("calling a tool"));
        history.append(Message::tool("call_1", "result one"));
        history.append(Message::tool("call_2", "result two"));
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_multimodal_content_serialization() {
        let message = Message::user(vec![
            ContentBlock::text("What is in this image?"),
            ContentBlock::image_url("data:image/png;base64,AAAA"),
        ]);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(json["content"][1]["url"], "data:image/png;base64,AAAA");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_plain_text_round_trip() {
        let message = Message::system("You are concise.");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["content"], "You are concise.");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_tool_message_carries_call_id() {
        let message = Message::tool("call_42", "output").with_name("calculator");
        assert_eq!(message.tool_call_id.as_deref(), Some("call_42"));
        assert_eq!(message.name.as_deref(), Some("calculator"));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["tool_call_id"], "call_42");
    }

    #[test]
    fn test_as_text_elides_images() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::text("first"),
            ContentBlock::image_url("https://example.com/x.png"),
            ContentBlock::text("second"),
        ]);
        assert_eq!(content.as_text(), "first\nsecond");
    }
}
