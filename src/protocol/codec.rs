//! Request/response codec
//!
//! A request is `key=value` clauses joined by `|`; list values are
//! comma separated:
//!
//! ```text
//! agent=0|state=0.5,1,0|actions=3,7,9|rewards=-1,0,5|dialogues=12
//! ```
//!
//! The response is the chosen action followed by CRLF.

use std::str::FromStr;

use crate::error::ProtocolError;

/// Response line terminator
pub const RESPONSE_TERMINATOR: &str = "\r\n";

/// One decoded decision request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    /// State vector (`state`)
    pub features: Vec<f64>,
    /// Allowed-action mask (`actions`)
    pub actions: Vec<i64>,
    /// Rewards for the previous decision (`rewards`)
    pub rewards: Vec<f64>,
    /// Dialogues completed so far (`dialogues`)
    pub dialogues: Option<f64>,
    /// Addressed policy agent (`agent`)
    pub agent: i64,
}

/// Recognized request keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    State,
    Actions,
    Rewards,
    Dialogues,
    Agent,
}

impl FromStr for Field {
    type Err = ProtocolError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        match key {
            "state" => Ok(Self::State),
            "actions" => Ok(Self::Actions),
            "rewards" => Ok(Self::Rewards),
            "dialogues" => Ok(Self::Dialogues),
            "agent" => Ok(Self::Agent),
            other => Err(ProtocolError::UnknownField {
                key: other.to_string(),
            }),
        }
    }
}

/// Decode one complete message
pub fn decode(raw: &str) -> Result<Request, ProtocolError> {
    let message = raw.trim();
    let mut request = Request::default();
    let mut agent = None;

    for clause in message.split('|') {
        let (key, value) = clause
            .split_once('=')
            .ok_or_else(|| ProtocolError::MalformedClause {
                clause: clause.to_string(),
            })?;
        let key = key.trim();

        match key.parse::<Field>()? {
            Field::State => request.features = parse_list(key, value)?,
            Field::Actions => request.actions = parse_list(key, value)?,
            Field::Rewards => request.rewards = parse_list(key, value)?,
            Field::Dialogues => request.dialogues = Some(parse_scalar(key, value)?),
            Field::Agent => agent = Some(parse_scalar(key, value)?),
        }
    }

    request.agent = agent.ok_or(ProtocolError::MissingField("agent"))?;
    Ok(request)
}

/// Decode raw bytes, rejecting invalid UTF-8
pub fn decode_bytes(raw: &[u8]) -> Result<Request, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidEncoding)?;
    decode(text)
}

/// Render the chosen action as a response line
pub fn encode_action(action: usize) -> String {
    format!("{action}{RESPONSE_TERMINATOR}")
}

fn parse_scalar<T: FromStr>(key: &str, value: &str) -> Result<T, ProtocolError> {
    value.trim().parse::<T>().map_err(|_| ProtocolError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_list<T: FromStr>(key: &str, value: &str) -> Result<Vec<T>, ProtocolError> {
    if value.trim().is_empty() {
        return Ok(Vec::new());
    }
    value.split(',').map(|item| parse_scalar(key, item)).collect()
}
