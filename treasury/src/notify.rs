//! Outbound notifications to stakers and pool owners
//!
//! Delivery (chat, e-mail) is handled by whoever holds the receiver. A
//! closed receiver never fails the ledger operation that published.

use pool_core::{Stake, UserId};
use tokio::sync::mpsc;
use tracing::debug;

/// A stake that closed at maturity
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationStake {
    pub stake: Stake,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StakeClosed(NotificationStake),
    User { user_id: UserId, message: String },
}

impl Notification {
    pub fn recipient(&self) -> UserId {
        match self {
            Notification::StakeClosed(n) => n.stake.user_id,
            Notification::User { user_id, .. } => *user_id,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Notification::StakeClosed(n) => &n.message,
            Notification::User { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Notification>>,
}

impl Notifier {
    pub fn new(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, notification: Notification) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(notification).is_err() {
            debug!("Notification receiver gone, dropping notification");
        }
    }

    pub fn stake_closed(&self, stake: Stake, message: String) {
        self.publish(Notification::StakeClosed(NotificationStake { stake, message }));
    }

    pub fn user(&self, user_id: UserId, message: impl Into<String>) {
        self.publish(Notification::User {
            user_id,
            message: message.into(),
        });
    }
}
