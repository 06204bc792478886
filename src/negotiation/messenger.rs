//! Swap messages and the channels carrying them between maker and taker

use super::{SwapAcceptance, SwapProposal};
use crate::error::{SwapError, SwapResult};
use crate::htlc::HtlcTx;
use crate::swap::SwapRole;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Every message exchanged during a swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwapMessage {
    Proposal(SwapProposal),
    Accept(SwapAcceptance),
    Reject { reason: String },
    TakerFee { tx: HtlcTx },
    MakerPayment { tx: HtlcTx },
    TakerPayment { tx: HtlcTx },
}

impl SwapMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SwapMessage::Proposal(_) => "Proposal",
            SwapMessage::Accept(_) => "Accept",
            SwapMessage::Reject { .. } => "Reject",
            SwapMessage::TakerFee { .. } => "TakerFee",
            SwapMessage::MakerPayment { .. } => "MakerPayment",
            SwapMessage::TakerPayment { .. } => "TakerPayment",
        }
    }
}

/// One party's end of a swap conversation
#[async_trait]
pub trait SwapMessenger: Send + Sync {
    async fn send(&self, message: SwapMessage) -> SwapResult<()>;

    /// Wait for the next message from the counterparty
    async fn recv(&self) -> SwapResult<SwapMessage>;
}

/// Opens messengers for swaps
pub trait SwapTransport: Send + Sync {
    fn connect(&self, swap_id: Uuid, role: SwapRole) -> Arc<dyn SwapMessenger>;

    /// Drop the mailbox of a finished swap
    fn release(&self, _swap_id: Uuid, _role: SwapRole) {}
}

#[derive(Clone)]
struct Mailbox {
    sender: mpsc::UnboundedSender<SwapMessage>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<SwapMessage>>>,
}

impl Mailbox {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

/// In-process transport; mailboxes outlive their messengers so a resumed
/// swap reads whatever arrived while it was down
#[derive(Clone, Default)]
pub struct LocalTransport {
    mailboxes: Arc<DashMap<(Uuid, SwapRole), Mailbox>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self, swap_id: Uuid, role: SwapRole) -> Mailbox {
        self.mailboxes
            .entry((swap_id, role))
            .or_insert_with(Mailbox::new)
            .clone()
    }

    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }
}

impl SwapTransport for LocalTransport {
    fn connect(&self, swap_id: Uuid, role: SwapRole) -> Arc<dyn SwapMessenger> {
        let inbox = self.mailbox(swap_id, role);
        let outbox = self.mailbox(swap_id, role.counterparty());
        Arc::new(LocalMessenger {
            outbox: outbox.sender,
            inbox: inbox.receiver,
        })
    }

    fn release(&self, swap_id: Uuid, role: SwapRole) {
        self.mailboxes.remove(&(swap_id, role));
    }
}

/// Messenger over in-process mailboxes
pub struct LocalMessenger {
    outbox: mpsc::UnboundedSender<SwapMessage>,
    inbox: Arc<Mutex<mpsc::UnboundedReceiver<SwapMessage>>>,
}

#[async_trait]
impl SwapMessenger for LocalMessenger {
    async fn send(&self, message: SwapMessage) -> SwapResult<()> {
        self.outbox
            .send(message)
            .map_err(|_| SwapError::Messaging("counterparty mailbox closed".to_string()))
    }

    async fn recv(&self) -> SwapResult<SwapMessage> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SwapError::Messaging("mailbox closed".to_string()))
    }
}

/// Two connected messengers, maker end first
pub fn channel_pair() -> (LocalMessenger, LocalMessenger) {
    let maker = Mailbox::new();
    let taker = Mailbox::new();
    (
        LocalMessenger {
            outbox: taker.sender,
            inbox: maker.receiver,
        },
        LocalMessenger {
            outbox: maker.sender,
            inbox: taker.receiver,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mailbox_survives_reconnect() {
        let transport = LocalTransport::new();
        let swap_id = Uuid::new_v4();

        let taker = transport.connect(swap_id, SwapRole::Taker);
        taker
            .send(SwapMessage::Reject {
                reason: "first".into(),
            })
            .await
            .unwrap();
        drop(taker);

        // Maker connects only after the message was sent
        let maker = transport.connect(swap_id, SwapRole::Maker);
        assert_eq!(maker.recv().await.unwrap().name(), "Reject");
        assert_eq!(transport.mailbox_count(), 2);

        transport.release(swap_id, SwapRole::Maker);
        assert_eq!(transport.mailbox_count(), 1);
    }

    #[test]
    fn test_message_tagging() {
        let json = serde_json::to_string(&SwapMessage::Reject {
            reason: "amount mismatch".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"reject","reason":"amount mismatch"}"#);
    }
}
