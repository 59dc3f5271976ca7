//! Conversation state for one session.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    /// Aggregated execution results for one tool round.
    ToolFeedback,
}

impl Role {
    /// Role name sent to the chat completions endpoint.
    ///
    /// Tool feedback goes out as `user`, since the model has no native tool
    /// call to attach it to.
    pub fn wire_name(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User | Role::ToolFeedback => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Ordered message history.
///
/// Index 0 is always the system message, which may be replaced in place.
/// Every other entry is append-only.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::new(Role::System, system_prompt)],
        }
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

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn system_prompt(&self) -> &str {
        &self.messages[0].text
    }

    /// Replaces the system message. Returns true if the text changed.
    pub fn set_system_prompt(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if self.messages[0].text == text {
            return false;
        }
        self.messages[0].text = text;
        true
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message::new(Role::User, text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.messages.push(Message::new(Role::Assistant, text));
    }

    pub fn push_feedback(&mut self, text: impl Into<String>) {
        self.messages.push(Message::new(Role::ToolFeedback, text));
    }
}
