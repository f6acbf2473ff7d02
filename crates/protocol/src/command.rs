//! Protocol commands.
//!
//! On the wire a command is a type code, an ordered list of string parameters
//! and an optional attached [`Message`]. [`Command`] is the decoded form: one
//! variant per command type, carrying only what that command needs. Decoding
//! validates parameter counts and numeric fields, so a malformed command is
//! rejected once, at the frame boundary.
//!
//! | Command | Params | Attached message |
//! |---|---|---|
//! | `SUBSCRIPTION` | flag `"0"`/`"1"` | header = subscription params |
//! | `SET_VISIBILITY` | flag `"0"`/`"1"` | - |
//! | `FORWARD_REQUEST` | ttl, receiver, [receiver service] | payload to forward |
//! | `SETTING` | digest threshold, compress threshold, digest fields... | - |
//! | `MESSAGE_RETRIEVE` | id | - |
//! | `REQUEST_ALL_CACHED` | - | body = NUL-terminated excluded ids |
//! | `DIGEST` | size, id, [sender, sender service] | header = digest fields |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::message::{Header, Message};

/// Number of leading `SETTING` params that are thresholds rather than fields.
const SETTING_THRESHOLD_PARAMS: usize = 2;

/// Command type codes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    Subscription = 1,
    SetVisibility = 2,
    ForwardRequest = 3,
    Setting = 4,
    MessageRetrieve = 5,
    RequestAllCached = 6,
    Digest = 7,
}

impl CommandType {
    /// Protocol name of the command type.
    pub fn name(self) -> &'static str {
        match self {
            CommandType::Subscription => "SUBSCRIPTION",
            CommandType::SetVisibility => "SET_VISIBILITY",
            CommandType::ForwardRequest => "FORWARD_REQUEST",
            CommandType::Setting => "SETTING",
            CommandType::MessageRetrieve => "MESSAGE_RETRIEVE",
            CommandType::RequestAllCached => "REQUEST_ALL_CACHED",
            CommandType::Digest => "DIGEST",
        }
    }
}

impl TryFrom<u8> for CommandType {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            1 => CommandType::Subscription,
            2 => CommandType::SetVisibility,
            3 => CommandType::ForwardRequest,
            4 => CommandType::Setting,
            5 => CommandType::MessageRetrieve,
            6 => CommandType::RequestAllCached,
            7 => CommandType::Digest,
            other => {
                return Err(ProtocolError::MalformedCommand(format!(
                    "unknown command type {}",
                    other
                )))
            }
        })
    }
}

/// Compact notification standing in for a message that was too large to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Digest {
    /// Id under which the full message can be retrieved.
    pub msg_id: String,
    /// Size of the full message.
    pub size: usize,
    /// Username of the original sender; empty when the server sent it.
    pub sender: String,
    /// Service of the original sender; empty when the server sent it.
    pub sender_service: String,
    /// Whitelisted header fields of the full message.
    pub info: Header,
}

/// A decoded protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe to (or unsubscribe from) a service-defined topic.
    ///
    /// `subscribe` is `None` when the peer sent an unrecognized flag.
    Subscription {
        subscribe: Option<bool>,
        params: Header,
    },
    /// Change the presence flag. `None` for an unrecognized value.
    SetVisibility { visible: Option<bool> },
    /// Ask the server to relay a message to another identity.
    ForwardRequest {
        ttl: Duration,
        receiver: String,
        receiver_service: Option<String>,
        message: Message,
    },
    /// Update per-connection thresholds and digest fields.
    ///
    /// `None` leaves the corresponding setting unchanged.
    Setting {
        digest_threshold: Option<i32>,
        compress_threshold: Option<i32>,
        digest_fields: Option<Vec<String>>,
    },
    /// Fetch a cached message by id.
    MessageRetrieve { id: String },
    /// Fetch every cached message except the listed ids.
    RequestAllCached { excludes: Vec<String> },
    /// Digest notification, server to client.
    Digest(Digest),
}

/// Wire representation of a command.
#[derive(Debug, Serialize, Deserialize)]
struct RawCommand {
    kind: u8,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    message: Option<Message>,
}

impl RawCommand {
    fn new(kind: CommandType, params: Vec<String>, message: Option<Message>) -> Self {
        Self {
            kind: kind as u8,
            params,
            message,
        }
    }
}

impl Command {
    /// Returns the wire type of this command.
    pub fn kind(&self) -> CommandType {
        match self {
            Command::Subscription { .. } => CommandType::Subscription,
            Command::SetVisibility { .. } => CommandType::SetVisibility,
            Command::ForwardRequest { .. } => CommandType::ForwardRequest,
            Command::Setting { .. } => CommandType::Setting,
            Command::MessageRetrieve { .. } => CommandType::MessageRetrieve,
            Command::RequestAllCached { .. } => CommandType::RequestAllCached,
            Command::Digest(_) => CommandType::Digest,
        }
    }

    /// Encodes the command as MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(&self.to_raw())?)
    }

    /// Decodes and validates a command.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: RawCommand = rmp_serde::from_slice(bytes)?;
        Self::from_raw(raw)
    }

    fn to_raw(&self) -> RawCommand {
        let kind = self.kind();
        match self {
            Command::Subscription { subscribe, params } => {
                let flag = match subscribe {
                    Some(true) => "1",
                    Some(false) => "0",
                    None => "",
                };
                RawCommand::new(
                    kind,
                    vec![flag.to_string()],
                    Some(Message::new(params.clone(), Vec::new())),
                )
            }
            Command::SetVisibility { visible } => {
                let flag = match visible {
                    Some(true) => "1",
                    Some(false) => "0",
                    None => "",
                };
                RawCommand::new(kind, vec![flag.to_string()], None)
            }
            Command::ForwardRequest {
                ttl,
                receiver,
                receiver_service,
                message,
            } => {
                let mut params = vec![ttl.as_secs().to_string(), receiver.clone()];
                if let Some(service) = receiver_service {
                    params.push(service.clone());
                }
                RawCommand::new(kind, params, Some(message.clone()))
            }
            Command::Setting {
                digest_threshold,
                compress_threshold,
                digest_fields,
            } => {
                let mut params = vec![
                    digest_threshold.map(|d| d.to_string()).unwrap_or_default(),
                    compress_threshold.map(|c| c.to_string()).unwrap_or_default(),
                ];
                if let Some(fields) = digest_fields {
                    params.extend(fields.iter().cloned());
                }
                RawCommand::new(kind, params, None)
            }
            Command::MessageRetrieve { id } => RawCommand::new(kind, vec![id.clone()], None),
            Command::RequestAllCached { excludes } => {
                let message = if excludes.is_empty() {
                    None
                } else {
                    Some(Message::with_body(encode_id_list(excludes)))
                };
                RawCommand::new(kind, Vec::new(), message)
            }
            Command::Digest(digest) => {
                let mut params = vec![digest.size.to_string(), digest.msg_id.clone()];
                if !digest.sender.is_empty() {
                    params.push(digest.sender.clone());
                    params.push(digest.sender_service.clone());
                }
                let message = if digest.info.is_empty() {
                    None
                } else {
                    Some(Message::new(digest.info.clone(), Vec::new()))
                };
                RawCommand::new(kind, params, message)
            }
        }
    }

    fn from_raw(raw: RawCommand) -> Result<Self> {
        let kind = CommandType::try_from(raw.kind)?;
        let RawCommand {
            params, message, ..
        } = raw;

        let command = match kind {
            CommandType::Subscription => {
                require_params(kind, &params, 1)?;
                let params_header = match message {
                    Some(msg) if !msg.header.is_empty() => msg.header,
                    _ => {
                        return Err(ProtocolError::MalformedCommand(
                            "SUBSCRIPTION requires a message with header".to_string(),
                        ))
                    }
                };
                Command::Subscription {
                    subscribe: parse_flag(&params[0]),
                    params: params_header,
                }
            }
            CommandType::SetVisibility => {
                require_params(kind, &params, 1)?;
                Command::SetVisibility {
                    visible: parse_flag(&params[0]),
                }
            }
            CommandType::ForwardRequest => {
                require_params(kind, &params, 2)?;
                let mut params = params.into_iter();
                let ttl = params.next().unwrap_or_default();
                let receiver = params.next().unwrap_or_default();
                let receiver_service = params.next();
                Command::ForwardRequest {
                    ttl: parse_ttl(&ttl),
                    receiver,
                    receiver_service,
                    message: message.unwrap_or_default(),
                }
            }
            CommandType::Setting => {
                require_params(kind, &params, SETTING_THRESHOLD_PARAMS)?;
                let digest_fields = (params.len() > SETTING_THRESHOLD_PARAMS)
                    .then(|| params[SETTING_THRESHOLD_PARAMS..].to_vec());
                Command::Setting {
                    digest_threshold: parse_threshold(&params[0])?,
                    compress_threshold: parse_threshold(&params[1])?,
                    digest_fields,
                }
            }
            CommandType::MessageRetrieve => {
                require_params(kind, &params, 1)?;
                Command::MessageRetrieve {
                    id: params.into_iter().next().unwrap_or_default(),
                }
            }
            CommandType::RequestAllCached => Command::RequestAllCached {
                excludes: message
                    .map(|msg| decode_id_list(&msg.body))
                    .unwrap_or_default(),
            },
            CommandType::Digest => {
                require_params(kind, &params, 2)?;
                let size = params[0].parse::<usize>().map_err(|_| {
                    ProtocolError::MalformedCommand(format!(
                        "DIGEST size is not a number: {:?}",
                        params[0]
                    ))
                })?;
                let mut params = params.into_iter().skip(1);
                Command::Digest(Digest {
                    size,
                    msg_id: params.next().unwrap_or_default(),
                    sender: params.next().unwrap_or_default(),
                    sender_service: params.next().unwrap_or_default(),
                    info: message.map(|msg| msg.header).unwrap_or_default(),
                })
            }
        };
        Ok(command)
    }
}

fn require_params(kind: CommandType, params: &[String], min: usize) -> Result<()> {
    if params.len() < min {
        return Err(ProtocolError::MalformedCommand(format!(
            "{} requires at least {} params, got {}",
            kind.name(),
            min,
            params.len()
        )));
    }
    Ok(())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

fn parse_threshold(value: &str) -> Result<Option<i32>> {
    if value.is_empty() {
        return Ok(None);
    }
    value.parse::<i32>().map(Some).map_err(|_| {
        ProtocolError::MalformedCommand(format!("threshold is not a number: {:?}", value))
    })
}

fn parse_ttl(value: &str) -> Duration {
    match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            tracing::debug!(ttl = value, "unparsable forward ttl, using no expiry");
            Duration::ZERO
        }
    }
}

/// Encodes ids as a sequence of NUL-terminated strings.
pub fn encode_id_list(ids: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.iter().map(|id| id.len() + 1).sum());
    for id in ids {
        out.extend_from_slice(id.as_bytes());
        out.push(0);
    }
    out
}

/// Decodes a sequence of NUL-terminated ids.
///
/// Parsing stops at the first entry that is not NUL-terminated or not valid
/// UTF-8; the ids decoded before it are kept.
pub fn decode_id_list(mut data: &[u8]) -> Vec<String> {
    let mut ids = Vec::new();
    while !data.is_empty() {
        let Some(end) = data.iter().position(|&b| b == 0) else {
            tracing::debug!(remaining = data.len(), "unterminated id in exclusion list");
            break;
        };
        match std::str::from_utf8(&data[..end]) {
            Ok(id) => ids.push(id.to_string()),
            Err(_) => break,
        }
        data = &data[end + 1..];
    }
    ids
}
