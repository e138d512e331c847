//! Control-message grammar
//!
//! ```text
//! R, <action>, <net>/<place>, <source_or_dest_topic>
//! A, <echoed request>
//! S, <echoed request>
//! F, <echoed request>[ - <reason>]
//! U, <update_nets|remove_nets>, <node_id>, <net1>&<net2>&...
//! ```

use std::fmt;
use std::str::FromStr;

use pnsim_core::{SimError, SimResult, Topic};

const FIELD_SEPARATOR: &str = ", ";
const REASON_SEPARATOR: &str = " - ";

/// Port direction requested from the target net
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortAction {
    SetInput,
    SetOutput,
}

impl PortAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PortAction::SetInput => "set_input",
            PortAction::SetOutput => "set_output",
        }
    }
}

impl FromStr for PortAction {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set_input" => Ok(PortAction::SetInput),
            "set_output" => Ok(PortAction::SetOutput),
            other => Err(SimError::MalformedControl(format!("unknown action {}", other))),
        }
    }
}

/// Directory broadcast action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirectoryAction {
    UpdateNets,
    RemoveNets,
}

impl DirectoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DirectoryAction::UpdateNets => "update_nets",
            DirectoryAction::RemoveNets => "remove_nets",
        }
    }
}

impl FromStr for DirectoryAction {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update_nets" => Ok(DirectoryAction::UpdateNets),
            "remove_nets" => Ok(DirectoryAction::RemoveNets),
            other => Err(SimError::MalformedControl(format!("unknown update {}", other))),
        }
    }
}

/// Source topic used by `set_input` requests, which need none
pub const NO_SOURCE: &str = "/";

/// Request to configure a place of another net
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortRequest {
    pub action: PortAction,
    pub target: Topic,
    /// Destination topic for `set_output`, `/` for `set_input`
    pub source: String,
}

impl PortRequest {
    /// Ask `target` to become an input port
    pub fn set_input(target: Topic) -> Self {
        PortRequest {
            action: PortAction::SetInput,
            target,
            source: NO_SOURCE.to_string(),
        }
    }

    /// Ask `target` to publish to `destination`
    pub fn set_output(target: Topic, destination: &Topic) -> Self {
        PortRequest {
            action: PortAction::SetOutput,
            target,
            source: destination.to_string(),
        }
    }

    /// Topic the target must publish to, for `set_output`
    pub fn destination(&self) -> Option<Topic> {
        Topic::parse(&self.source).ok()
    }

    fn parse_fields(content: &str) -> SimResult<Self> {
        let mut fields = content.splitn(3, FIELD_SEPARATOR);
        let (Some(action), Some(target), Some(source)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(SimError::MalformedControl(format!("R, {}", content)));
        };
        let target = Topic::parse(target)
            .map_err(|_| SimError::MalformedControl(format!("R, {}", content)))?;
        if source.is_empty() {
            return Err(SimError::MalformedControl(format!("R, {}", content)));
        }
        Ok(PortRequest {
            action: action.parse()?,
            target,
            source: source.to_string(),
        })
    }
}

impl fmt::Display for PortRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R, {}, {}, {}",
            self.action.as_str(),
            self.target,
            self.source
        )
    }
}

/// A message on the `control` topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    Request(PortRequest),
    /// Receipt of the echoed request
    Ack(String),
    /// The echoed request was applied
    Success(String),
    /// The echoed request could not be served
    Failure {
        request: String,
        reason: Option<String>,
    },
    /// Directory of nets hosted by a node
    Update {
        action: DirectoryAction,
        node: String,
        nets: Vec<String>,
    },
}

impl ControlMessage {
    pub fn kind(&self) -> char {
        match self {
            ControlMessage::Request(_) => 'R',
            ControlMessage::Ack(_) => 'A',
            ControlMessage::Success(_) => 'S',
            ControlMessage::Failure { .. } => 'F',
            ControlMessage::Update { .. } => 'U',
        }
    }

    pub fn ack(request: &PortRequest) -> Self {
        ControlMessage::Ack(request.to_string())
    }

    pub fn success(request: &PortRequest) -> Self {
        ControlMessage::Success(request.to_string())
    }

    pub fn failure(request: impl Into<String>, reason: impl Into<String>) -> Self {
        ControlMessage::Failure {
            request: request.into(),
            reason: Some(reason.into()),
        }
    }

    pub fn parse(payload: &str) -> SimResult<Self> {
        let malformed = || SimError::MalformedControl(payload.to_string());
        let (kind, content) = payload.split_once(FIELD_SEPARATOR).ok_or_else(malformed)?;
        if content.is_empty() {
            return Err(malformed());
        }
        match kind {
            "R" => PortRequest::parse_fields(content).map(ControlMessage::Request),
            "A" => Ok(ControlMessage::Ack(content.to_string())),
            "S" => Ok(ControlMessage::Success(content.to_string())),
            "F" => Ok(parse_failure(content)),
            "U" => {
                let mut fields = content.splitn(3, FIELD_SEPARATOR);
                let (Some(action), Some(node), Some(nets)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    return Err(malformed());
                };
                if node.is_empty() {
                    return Err(malformed());
                }
                Ok(ControlMessage::Update {
                    action: action.parse()?,
                    node: node.to_string(),
                    nets: nets
                        .split('&')
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                        .collect(),
                })
            }
            _ => Err(malformed()),
        }
    }
}

/// The reason follows the last ` - `, unless that would cut a request apart
fn parse_failure(content: &str) -> ControlMessage {
    if let Some((request, reason)) = content.rsplit_once(REASON_SEPARATOR) {
        let is_request = request
            .strip_prefix("R, ")
            .map(|fields| PortRequest::parse_fields(fields).is_ok())
            .unwrap_or(false);
        if is_request {
            return ControlMessage::Failure {
                request: request.to_string(),
                reason: Some(reason.to_string()),
            };
        }
    }
    ControlMessage::Failure {
        request: content.to_string(),
        reason: None,
    }
}

impl FromStr for ControlMessage {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlMessage::parse(s)
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Request(request) => write!(f, "{}", request),
            ControlMessage::Ack(request) => write!(f, "A, {}", request),
            ControlMessage::Success(request) => write!(f, "S, {}", request),
            ControlMessage::Failure { request, reason } => match reason {
                Some(reason) => write!(f, "F, {}{}{}", request, REASON_SEPARATOR, reason),
                None => write!(f, "F, {}", request),
            },
            ControlMessage::Update { action, node, nets } => {
                write!(f, "U, {}, {}, {}", action.as_str(), node, nets.join("&"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let raw = "R, set_output, boiler/Valve state, room/Valve";
        let msg = ControlMessage::parse(raw).unwrap();
        match &msg {
            ControlMessage::Request(r) => {
                assert_eq!(r.action, PortAction::SetOutput);
                assert_eq!(r.target, Topic::new("boiler", "Valve state"));
                assert_eq!(r.destination(), Some(Topic::new("room", "Valve")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(msg.to_string(), raw);

        let input = PortRequest::set_input(Topic::new("room", "Q gain"));
        assert_eq!(input.to_string(), "R, set_input, room/Q gain, /");
        assert_eq!(input.destination(), None);
    }

    #[test]
    fn test_ack_echoes_request() {
        let request = PortRequest::set_input(Topic::new("room", "Q gain"));
        let ack = ControlMessage::ack(&request).to_string();
        assert_eq!(ack, "A, R, set_input, room/Q gain, /");
        assert_eq!(
            ControlMessage::parse(&ack).unwrap(),
            ControlMessage::Ack(request.to_string())
        );
    }

    #[test]
    fn test_failure_reason() {
        let request = "R, set_input, room/No such place, /";
        let msg = ControlMessage::failure(request, "unknown place");
        let raw = msg.to_string();
        assert_eq!(raw, "F, R, set_input, room/No such place, / - unknown place");
        assert_eq!(ControlMessage::parse(&raw).unwrap(), msg);

        let bare = ControlMessage::parse("F, R, set_input, room/a - b, /").unwrap();
        assert_eq!(
            bare,
            ControlMessage::Failure {
                request: "R, set_input, room/a - b, /".into(),
                reason: None
            }
        );
    }

    #[test]
    fn test_update_roundtrip() {
        let raw = "U, update_nets, sim-1, room&heater";
        let msg = ControlMessage::parse(raw).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Update {
                action: DirectoryAction::UpdateNets,
                node: "sim-1".into(),
                nets: vec!["room".into(), "heater".into()],
            }
        );
        assert_eq!(msg.to_string(), raw);

        let empty = ControlMessage::parse("U, remove_nets, sim-2, ").unwrap();
        assert_eq!(
            empty,
            ControlMessage::Update {
                action: DirectoryAction::RemoveNets,
                node: "sim-2".into(),
                nets: Vec::new(),
            }
        );
    }

    #[test]
    fn test_malformed_messages() {
        for raw in [
            "R, set_input",
            "R, set_input, room/Q gain",
            "R, open_valve, room/Q gain, /",
            "R, set_input, roomQ, /",
            "X, whatever",
            "A",
            "A, ",
            "U, update_nets, sim-1",
            "U, rename_nets, sim-1, room",
            "",
        ] {
            assert!(
                matches!(ControlMessage::parse(raw), Err(SimError::MalformedControl(_))),
                "{raw:?}"
            );
        }
    }
}
