use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::util::truncate_chars;

/// Transport caps of the outbound channel. Interactive messages that exceed
/// them are truncated, never rejected: a flow author mistake must not stop a
/// conversation mid-turn.
pub const MAX_BUTTONS: usize = 3;
pub const MAX_BUTTON_ID_LEN: usize = 256;
pub const MAX_BUTTON_TITLE_LEN: usize = 20;
pub const MAX_LIST_SECTIONS: usize = 10;
pub const MAX_LIST_ROWS: usize = 10;
pub const MAX_ROW_TITLE_LEN: usize = 24;
pub const MAX_ROW_DESCRIPTION_LEN: usize = 72;

/// What a single outbound turn can look like on the channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum MessageContent {
    Text(String),
    Buttons(ButtonContent),
    List(ListContent),
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text(body.into())
    }

    /// The main body of the message, whatever its shape.
    pub fn body(&self) -> &str {
        match self {
            MessageContent::Text(body) => body,
            MessageContent::Buttons(c) => &c.body,
            MessageContent::List(c) => &c.body,
        }
    }

    /// Same content with `prefix` prepended to the body. Used for re-prompts
    /// that carry a validation error above the original question.
    pub fn with_body_prefix(&self, prefix: &str) -> MessageContent {
        let prefixed = |body: &str| format!("{}\n\n{}", prefix, body);
        match self {
            MessageContent::Text(body) => MessageContent::Text(prefixed(body)),
            MessageContent::Buttons(c) => MessageContent::Buttons(ButtonContent {
                body: prefixed(&c.body),
                ..c.clone()
            }),
            MessageContent::List(c) => MessageContent::List(ListContent {
                body: prefixed(&c.body),
                ..c.clone()
            }),
        }
    }
}

/// Reply button bar (up to [`MAX_BUTTONS`]).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ButtonContent {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    pub buttons: Vec<ButtonOption>,
}

impl ButtonContent {
    pub fn new(body: impl Into<String>, buttons: Vec<ButtonOption>) -> Self {
        let mut buttons = buttons;
        buttons.truncate(MAX_BUTTONS);
        Self {
            body: body.into(),
            header: None,
            footer: None,
            buttons,
        }
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn with_footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ButtonOption {
    pub id: String,
    pub title: String,
}

impl ButtonOption {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: truncate_chars(&id.into(), MAX_BUTTON_ID_LEN),
            title: truncate_chars(&title.into(), MAX_BUTTON_TITLE_LEN),
        }
    }
}

/// Sectioned picker list. The channel caps both the section count and the
/// *total* row count across all sections.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ListContent {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    /// Label on the button that opens the list.
    pub button_text: String,
    pub sections: Vec<ListSection>,
}

impl ListContent {
    pub fn new(
        body: impl Into<String>,
        button_text: impl Into<String>,
        sections: Vec<ListSection>,
    ) -> Self {
        Self {
            body: body.into(),
            header: None,
            footer: None,
            button_text: truncate_chars(&button_text.into(), MAX_BUTTON_TITLE_LEN),
            sections: cap_sections(sections),
        }
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn with_footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn row_count(&self) -> usize {
        self.sections.iter().map(|s| s.rows.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

impl ListSection {
    pub fn new(title: impl Into<String>, rows: Vec<ListRow>) -> Self {
        Self {
            title: truncate_chars(&title.into(), MAX_ROW_TITLE_LEN),
            rows,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ListRow {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: truncate_chars(&id.into(), MAX_BUTTON_ID_LEN),
            title: truncate_chars(&title.into(), MAX_ROW_TITLE_LEN),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(truncate_chars(&description.into(), MAX_ROW_DESCRIPTION_LEN));
        self
    }
}

/// Drop sections past the cap, then walk the remaining ones handing out the
/// shared row budget. Sections left without rows are dropped too.
fn cap_sections(sections: Vec<ListSection>) -> Vec<ListSection> {
    let mut budget = MAX_LIST_ROWS;
    let mut capped = Vec::new();
    for mut section in sections.into_iter().take(MAX_LIST_SECTIONS) {
        if budget == 0 {
            break;
        }
        section.rows.truncate(budget);
        budget -= section.rows.len();
        if !section.rows.is_empty() {
            capped.push(section);
        }
    }
    capped
}

/// One rendered outbound message, addressed and ready for the channel sender.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OutboundMessage {
    id: String,
    to: String,
    content: MessageContent,
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, content: MessageContent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            to: to.into(),
            content,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    pub fn into_content(self) -> MessageContent {
        self.content
    }

    /// Body text, for callers that only care about the words.
    pub fn text(&self) -> &str {
        self.content.body()
    }
}
