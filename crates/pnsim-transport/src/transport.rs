//! Transport seam

use std::sync::Arc;

use pnsim_core::SimResult;
use tokio::sync::mpsc;

/// Delivery reliability tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Qos {
    /// Fire and forget; may be lost
    AtMostOnce,
    /// Delivered once per subscriber
    #[default]
    ExactlyOnce,
}

impl Qos {
    /// Tier actually granted for a publish/subscription pair
    pub fn effective(self, subscription: Qos) -> Qos {
        self.min(subscription)
    }
}

/// Message handed to a subscriber
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: String,
    pub qos: Qos,
}

/// Inbound deliveries of one client, in broker order
pub type Inbox = mpsc::UnboundedReceiver<Delivery>;

/// Sending half of an inbox
pub type InboxSender = mpsc::UnboundedSender<Delivery>;

/// A connected publish/subscribe client
pub trait Transport: Send + Sync {
    fn client_id(&self) -> &str;

    fn subscribe(&self, filter: &str, qos: Qos) -> SimResult<()>;

    fn unsubscribe(&self, filter: &str) -> SimResult<()>;

    fn publish(&self, topic: &str, payload: &str, qos: Qos) -> SimResult<()>;

    /// Disconnect; the inbox ends once pending deliveries are drained
    fn close(&self) -> SimResult<()>;
}

/// Opens transport sessions
pub trait Connector: Send + Sync {
    fn connect(&self, client_id: &str) -> SimResult<(Arc<dyn Transport>, Inbox)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_qos_is_minimum() {
        assert_eq!(Qos::ExactlyOnce.effective(Qos::AtMostOnce), Qos::AtMostOnce);
        assert_eq!(Qos::AtMostOnce.effective(Qos::ExactlyOnce), Qos::AtMostOnce);
        assert_eq!(Qos::ExactlyOnce.effective(Qos::ExactlyOnce), Qos::ExactlyOnce);
    }
}
