use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::models::ShoppingItem;

pub const LINE_BROADCAST_URL: &str = "https://api.line.me/v2/bot/message/broadcast";
pub const LINE_TOKEN_ENV: &str = "LINE_CHANNEL_ACCESS_TOKEN";

const HEADER: &str = "🛒 Shopping List";
const RULE: &str = "━━━━━━━━━━━━━━━";

/// One line of an outgoing list. Lists posted by a client may carry only a name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListLine {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_needed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl From<&ShoppingItem> for ListLine {
    fn from(item: &ShoppingItem) -> Self {
        Self {
            name: item.name.clone(),
            quantity_needed: Some(item.quantity_needed),
            unit: Some(item.unit.clone()).filter(|u| !u.is_empty()),
        }
    }
}

#[must_use]
pub fn render_shopping_list(lines: &[ListLine]) -> String {
    let mut text = format!("{HEADER}\n{RULE}\n");
    for line in lines {
        let _ = write!(text, "• {}", line.name.trim());
        if let Some(qty) = line.quantity_needed {
            let _ = write!(text, " ({}", format_quantity(qty));
            if let Some(unit) = line.unit.as_deref().filter(|u| !u.trim().is_empty()) {
                let _ = write!(text, " {}", unit.trim());
            }
            text.push(')');
        }
        text.push('\n');
    }
    text
}

/// Up to two decimals, trailing zeros dropped.
fn format_quantity(qty: f64) -> String {
    let s = format!("{qty:.2}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" { "0".to_string() } else { s.to_string() }
}

#[derive(Debug, Serialize)]
pub struct BroadcastRequest {
    pub messages: Vec<TextMessage>,
}

#[derive(Debug, Serialize)]
pub struct TextMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl BroadcastRequest {
    /// `None` when there is nothing to send.
    #[must_use]
    pub fn for_lines(lines: &[ListLine]) -> Option<Self> {
        if lines.is_empty() {
            return None;
        }
        Some(Self {
            messages: vec![TextMessage {
                kind: "text",
                text: render_shopping_list(lines),
            }],
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SendOutcome {
    pub status: SendStatus,
    pub message: String,
    pub items: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Sent,
    NoItems,
}

impl SendOutcome {
    #[must_use]
    pub fn sent(items: usize) -> Self {
        Self {
            status: SendStatus::Sent,
            message: "Shopping list sent to LINE!".to_string(),
            items,
        }
    }

    #[must_use]
    pub fn no_items() -> Self {
        Self {
            status: SendStatus::NoItems,
            message: "List is empty!".to_string(),
            items: 0,
        }
    }
}
