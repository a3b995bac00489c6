use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verb {
    Read,
    Notify,
    Patch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Msg {
    Configuration,
    PeerJws,
    Error,
}

/// Wire errors; the display string is the code sent in `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("UNSUPPORTED_MESSAGE")]
    UnsupportedMessage,
    #[error("UNSUPPORTED_VERB")]
    UnsupportedVerb,
    #[error("JSON_PARSE_ERROR")]
    JsonParseError,
}

/// One control-channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub verb: Verb,
    pub msg: Msg,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    pub id: String,
}

/// A frame that could not be dispatched, with the request id when one could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub error: ProtocolError,
    pub id: Option<String>,
}

impl Message {
    /// Unsolicited frame with a fresh id.
    #[must_use]
    pub fn new(verb: Verb, msg: Msg, data: Value) -> Self {
        Self {
            verb,
            msg,
            data,
            id: random_phrase(),
        }
    }

    #[must_use]
    pub fn read(msg: Msg) -> Self {
        Self::new(Verb::Read, msg, Value::Null)
    }

    /// `NOTIFY` answering the request `id`.
    #[must_use]
    pub fn reply(msg: Msg, data: Value, id: String) -> Self {
        Self {
            verb: Verb::Notify,
            msg,
            data,
            id,
        }
    }

    /// Error frame; parse errors never echo an id.
    #[must_use]
    pub fn error(error: ProtocolError, id: Option<String>) -> Self {
        let id = match (error, id) {
            (ProtocolError::JsonParseError, _) | (_, None) => random_phrase(),
            (_, Some(id)) => id,
        };
        Self {
            verb: Verb::Notify,
            msg: Msg::Error,
            data: Value::String(error.to_string()),
            id,
        }
    }

    #[must_use]
    pub fn rejected(rejection: Rejection) -> Self {
        Self::error(rejection.error, rejection.id)
    }

    /// # Errors
    /// Returns an error if `data` cannot be serialized.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Decodes a frame, classifying what is wrong with it.
///
/// A frame whose `msg` is unknown is rejected before its verb is looked at.
///
/// # Errors
/// Returns a [`Rejection`] carrying the protocol error to report.
pub fn parse(text: &str) -> Result<Message, Rejection> {
    let raw: Value = serde_json::from_str(text).map_err(|_| Rejection {
        error: ProtocolError::JsonParseError,
        id: None,
    })?;
    let Value::Object(mut fields) = raw else {
        return Err(Rejection {
            error: ProtocolError::JsonParseError,
            id: None,
        });
    };

    let id = match fields.remove("id") {
        Some(Value::String(id)) => Some(id),
        _ => None,
    };
    let reject = |error| Rejection {
        error,
        id: id.clone(),
    };

    let msg = fields
        .remove("msg")
        .and_then(|msg| serde_json::from_value::<Msg>(msg).ok())
        .ok_or_else(|| reject(ProtocolError::UnsupportedMessage))?;
    let verb = fields
        .remove("verb")
        .and_then(|verb| serde_json::from_value::<Verb>(verb).ok())
        .ok_or_else(|| reject(ProtocolError::UnsupportedVerb))?;

    Ok(Message {
        verb,
        msg,
        data: fields.remove("data").unwrap_or(Value::Null),
        id: id.unwrap_or_else(random_phrase),
    })
}

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "eager", "fuzzy", "gentle", "happy", "icy", "jolly", "lucky",
    "mellow", "nimble", "proud", "quiet", "rapid", "shiny", "tidy", "vivid", "witty", "young",
];

const NOUNS: &[&str] = &[
    "badger", "comet", "delta", "falcon", "glacier", "harbor", "island", "jaguar", "lantern",
    "meadow", "nebula", "otter", "pepper", "quartz", "river", "summit", "tiger", "valley",
    "walrus", "zephyr",
];

/// Human-readable message id such as `brave-otter-42`.
#[must_use]
pub fn random_phrase() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("plain");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("message");
    format!("{adjective}-{noun}-{}", rng.gen_range(0..1000))
}
