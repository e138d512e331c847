//! Topic addressing

use std::fmt;
use std::str::FromStr;

use crate::{SimError, SimResult};

/// Reserved topic shared by all control messages
pub const CONTROL_TOPIC: &str = "control";

/// Prefix of per-node directed topics
pub const PRIVATE_PREFIX: &str = "private";

/// Directed topic of a node
pub fn private_topic(node_id: &str) -> String {
    format!("{}/{}", PRIVATE_PREFIX, node_id)
}

/// `<net>/<place>` address of a place
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic {
    pub net: String,
    pub place: String,
}

impl Topic {
    pub fn new(net: impl Into<String>, place: impl Into<String>) -> Self {
        Topic {
            net: net.into(),
            place: place.into(),
        }
    }

    /// Split at the first `/`; place names may contain further slashes
    pub fn parse(s: &str) -> SimResult<Self> {
        match s.split_once('/') {
            Some((net, place)) if !net.is_empty() && !place.is_empty() => {
                Ok(Topic::new(net, place))
            }
            _ => Err(SimError::InvalidTopic(s.to_string())),
        }
    }

    /// Whether this addresses a reserved (non-data) topic
    pub fn is_reserved(&self) -> bool {
        self.net == PRIVATE_PREFIX || self.net == CONTROL_TOPIC
    }

    /// Subscription filter for every place of `net`
    pub fn net_filter(net: &str) -> String {
        format!("{}/#", net)
    }
}

impl FromStr for Topic {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net, self.place)
    }
}
