//! Acknowledgement policy
//!
//! Given the ack mode, the transaction situation and the outcome of one
//! listener invocation, [`decide`] returns the channel operations to perform.
//! The function is pure; the consumer applies the returned [`AckAction`].

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Who acknowledges deliveries
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckMode {
    /// The broker considers a delivery acknowledged as soon as it is sent
    None,
    /// The container acks on success and nacks on failure
    #[default]
    Auto,
    /// The listener acknowledges through the channel it is handed
    Manual,
}

impl AckMode {
    /// Whether consumers register with the broker in auto-ack mode
    pub fn is_auto_ack(&self) -> bool {
        matches!(self, AckMode::None)
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, AckMode::Manual)
    }
}

/// Result of handing one delivery to the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOutcome {
    Success,
    Failure { requeue: bool, transport: bool },
    /// Received after stop was requested; never handed to the listener
    RejectedWhileStopping,
}

/// Inputs to the acknowledgement decision for one delivery
#[derive(Debug, Clone, Copy)]
pub struct AckContext {
    pub mode: AckMode,
    pub channel_transacted: bool,
    pub externally_transacted: bool,
    pub outcome: ListenerOutcome,
    /// Successful deliveries acknowledged lazily and not yet acked
    pub deferred: usize,
    pub batch_size: usize,
}

/// Channel operations for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Nothing,
    /// Count the delivery towards the current batch
    Defer,
    Ack { multiple: bool },
    AckAndCommit { multiple: bool },
    Commit,
    Rollback,
    /// Nack the delivery, acking earlier deferred successes first
    Nack { requeue: bool, ack_deferred: bool },
    /// Roll back, nack, then commit the nack
    RollbackAndNack { requeue: bool, multiple: bool },
    /// Ack once the external transaction commits
    RegisterWithTransaction,
    /// Roll the external transaction back; the delivery is nacked on completion
    RollbackTransaction { requeue: bool },
}

pub fn decide(ctx: &AckContext) -> AckAction {
    match ctx.mode {
        AckMode::None => AckAction::Nothing,
        AckMode::Manual => match ctx.outcome {
            ListenerOutcome::Success if ctx.channel_transacted => AckAction::Commit,
            ListenerOutcome::Success => AckAction::Nothing,
            ListenerOutcome::Failure {
                transport: true, ..
            }
            | ListenerOutcome::RejectedWhileStopping => reject_locally(ctx, true),
            ListenerOutcome::Failure { .. } if ctx.channel_transacted => AckAction::Rollback,
            ListenerOutcome::Failure { .. } => AckAction::Nothing,
        },
        AckMode::Auto => match ctx.outcome {
            ListenerOutcome::Success if ctx.externally_transacted => {
                AckAction::RegisterWithTransaction
            }
            ListenerOutcome::Success => {
                let pending = ctx.deferred + 1;
                if pending < ctx.batch_size.max(1) {
                    AckAction::Defer
                } else if ctx.channel_transacted {
                    AckAction::AckAndCommit {
                        multiple: pending > 1,
                    }
                } else {
                    AckAction::Ack {
                        multiple: pending > 1,
                    }
                }
            }
            ListenerOutcome::Failure { requeue, .. } if ctx.externally_transacted => {
                AckAction::RollbackTransaction { requeue }
            }
            ListenerOutcome::Failure { requeue, .. } => reject_locally(ctx, requeue),
            ListenerOutcome::RejectedWhileStopping => reject_locally(ctx, true),
        },
    }
}

fn reject_locally(ctx: &AckContext, requeue: bool) -> AckAction {
    if ctx.channel_transacted {
        AckAction::RollbackAndNack {
            requeue,
            multiple: ctx.deferred > 0,
        }
    } else {
        AckAction::Nack {
            requeue,
            ack_deferred: ctx.deferred > 0,
        }
    }
}
