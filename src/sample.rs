use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ReservedKeys;

/// A single benchmark item as it flows through the pipeline: the dataset's own
/// fields plus the reserved prompt/response/status/history keys.
///
/// Samples are deliberately schemaless: datasets carry arbitrary metadata
/// (categories, needle strings, option lists) that must survive a round trip
/// through the durable log untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sample {
    fields: Map<String, Value>,
}

/// Lifecycle status of a sample. Absent status (a fresh sample, or a plain
/// single-round record) is represented as `None` at the accessor level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Processing,
    Resume,
    Completed,
    Error,
    MaxRounds,
}

impl Status {
    /// Terminal statuses are the only ones written to the final output log.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Error | Status::MaxRounds)
    }
}

/// A backend response: either plain text or a structured error produced when
/// the adapter exhausted its retry budget (or failed fatally).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Text(String),
    Error { error: String },
}

impl ResponsePayload {
    pub fn error(message: impl Into<String>) -> Self {
        ResponsePayload::Error {
            error: message.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponsePayload::Text(text) => Some(text),
            ResponsePayload::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResponsePayload::Error { .. })
    }
}

/// One prior round of a multi-round interaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub prompt: String,
    pub response: String,
}

/// Round-indexed history of a sample undergoing self-correction. BTreeMap
/// keeps rounds ordered both in memory and in the serialized record.
pub type History = BTreeMap<u32, HistoryTurn>;

/// A role-tagged message for chat-shaped backends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        ChatMessage {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Turns accumulated history plus the current prompt into an alternating
/// user/assistant conversation, oldest round first.
pub fn build_conversation(
    history: &History,
    prompt: &str,
    system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let mut conversation = Vec::with_capacity(history.len() * 2 + 2);
    if let Some(system) = system_prompt {
        conversation.push(ChatMessage::new("system", system));
    }
    for turn in history.values() {
        conversation.push(ChatMessage::new("user", turn.prompt.clone()));
        conversation.push(ChatMessage::new("assistant", turn.response.clone()));
    }
    conversation.push(ChatMessage::new("user", prompt));
    conversation
}

impl Sample {
    pub fn new(fields: Map<String, Value>) -> Self {
        Sample { fields }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// The stable identifier of this sample. Strings are used as-is; numbers
    /// are stringified so that `3` and `"3"` refer to the same item across
    /// datasets that disagree on the id type.
    pub fn id(&self, keys: &ReservedKeys) -> Result<String> {
        match self.fields.get(&keys.id) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(other) => Err(anyhow!(
                "sample id field '{}' has unsupported type: {other}",
                keys.id
            )),
            None => Err(anyhow!("sample is missing the id field '{}'", keys.id)),
        }
    }

    pub fn prompt(&self, keys: &ReservedKeys) -> Option<&str> {
        self.fields.get(&keys.prompt).and_then(Value::as_str)
    }

    pub fn set_prompt(&mut self, keys: &ReservedKeys, prompt: impl Into<String>) {
        self.fields
            .insert(keys.prompt.clone(), Value::String(prompt.into()));
    }

    pub fn response(&self, keys: &ReservedKeys) -> Option<ResponsePayload> {
        self.fields
            .get(&keys.response)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn raw_response(&self, keys: &ReservedKeys) -> Option<&Value> {
        self.fields.get(&keys.response)
    }

    pub fn set_response(&mut self, keys: &ReservedKeys, response: ResponsePayload) {
        // ResponsePayload serialization cannot fail: it is a string or a
        // single-field string map.
        let value = serde_json::to_value(response).unwrap_or(Value::Null);
        self.fields.insert(keys.response.clone(), value);
    }

    /// A response is usable if it is a string, or a structured payload that is
    /// not an error. Samples without a usable response were never answered.
    pub fn has_usable_response(&self, keys: &ReservedKeys) -> bool {
        match self.fields.get(&keys.response) {
            Some(Value::String(_)) => true,
            Some(Value::Object(map)) => !map.contains_key(&keys.error),
            _ => false,
        }
    }

    pub fn status(&self, keys: &ReservedKeys) -> Option<Status> {
        self.fields
            .get(&keys.status)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set_status(&mut self, keys: &ReservedKeys, status: Status) {
        let value = serde_json::to_value(status).unwrap_or(Value::Null);
        self.fields.insert(keys.status.clone(), value);
    }

    pub fn history(&self, keys: &ReservedKeys) -> History {
        self.fields
            .get(&keys.history)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_history(&mut self, keys: &ReservedKeys, history: &History) {
        let value = serde_json::to_value(history).unwrap_or(Value::Null);
        self.fields.insert(keys.history.clone(), value);
    }

    /// The option strings of a multiple-choice sample, if present.
    pub fn options(&self) -> Option<Vec<String>> {
        self.fields.get("options").and_then(|value| {
            value.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
        })
    }

    pub fn answer(&self) -> Option<&str> {
        self.fields.get("answer").and_then(Value::as_str)
    }
}
