//! Protocol events for state change notifications.
//!
//! Every action appends its events to the [`EventLog`] held in the system
//! state. The log is not snapshotted per action: it remembers its length when
//! an action begins and truncates back to it when the action rolls back.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::crypto::{Address, StateHash};
use crate::utils::journal::{Saved, Transactional};

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// All protocol event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolEvent {
    // Trove Events
    /// Trove collateral, debt or stake changed
    TroveUpdated(TroveUpdatedEvent),
    /// Trove was liquidated
    TroveLiquidated(TroveLiquidatedEvent),
    /// Borrowing fee charged on new debt
    BorrowingFeePaid(BorrowingFeePaidEvent),
    /// Surplus collateral claimed by a former borrower
    CollateralClaimed(CollateralClaimedEvent),

    // Liquidation Events
    /// Totals of one liquidation call
    Liquidation(LiquidationEvent),
    /// Redistribution scalars advanced
    Redistribution(RedistributionEvent),
    /// Total stakes / collateral snapshots refreshed
    SystemSnapshotsUpdated(SystemSnapshotsEvent),

    // Redemption Events
    /// Debt tokens redeemed for collateral
    Redemption(RedemptionEvent),
    /// Base rate changed
    BaseRateUpdated(BaseRateEvent),

    // Stability Pool Events
    /// Deposit changed
    StabilityDepositUpdated(StabilityDepositEvent),
    /// Collateral gain paid out or moved to a trove
    CollGainWithdrawn(CollGainWithdrawnEvent),
    /// Reward issuance paid to a depositor or frontend
    RewardPaid(RewardPaidEvent),
    /// Frontend registered
    FrontendRegistered(FrontendEvent),
    /// Frontend kickback rate changed
    KickbackRateChanged(FrontendEvent),

    // Protocol Events
    /// Recovery mode entered
    RecoveryModeEntered(RecoveryModeEvent),
    /// Recovery mode exited
    RecoveryModeExited(RecoveryModeEvent),
}

impl ProtocolEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TroveUpdated(_) => "TroveUpdated",
            Self::TroveLiquidated(_) => "TroveLiquidated",
            Self::BorrowingFeePaid(_) => "BorrowingFeePaid",
            Self::CollateralClaimed(_) => "CollateralClaimed",
            Self::Liquidation(_) => "Liquidation",
            Self::Redistribution(_) => "Redistribution",
            Self::SystemSnapshotsUpdated(_) => "SystemSnapshotsUpdated",
            Self::Redemption(_) => "Redemption",
            Self::BaseRateUpdated(_) => "BaseRateUpdated",
            Self::StabilityDepositUpdated(_) => "StabilityDepositUpdated",
            Self::CollGainWithdrawn(_) => "CollGainWithdrawn",
            Self::RewardPaid(_) => "RewardPaid",
            Self::FrontendRegistered(_) => "FrontendRegistered",
            Self::KickbackRateChanged(_) => "KickbackRateChanged",
            Self::RecoveryModeEntered(_) => "RecoveryModeEntered",
            Self::RecoveryModeExited(_) => "RecoveryModeExited",
        }
    }

    /// Get the timestamp of the event
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::TroveUpdated(e) => e.timestamp,
            Self::TroveLiquidated(e) => e.timestamp,
            Self::BorrowingFeePaid(e) => e.timestamp,
            Self::CollateralClaimed(e) => e.timestamp,
            Self::Liquidation(e) => e.timestamp,
            Self::Redistribution(e) => e.timestamp,
            Self::SystemSnapshotsUpdated(e) => e.timestamp,
            Self::Redemption(e) => e.timestamp,
            Self::BaseRateUpdated(e) => e.timestamp,
            Self::StabilityDepositUpdated(e) => e.timestamp,
            Self::CollGainWithdrawn(e) => e.timestamp,
            Self::RewardPaid(e) => e.timestamp,
            Self::FrontendRegistered(e) => e.timestamp,
            Self::KickbackRateChanged(e) => e.timestamp,
            Self::RecoveryModeEntered(e) => e.timestamp,
            Self::RecoveryModeExited(e) => e.timestamp,
        }
    }

    /// Compute event hash
    pub fn hash(&self) -> Result<StateHash> {
        let data = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(StateHash::sha256(&data))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TROVE EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// What changed a trove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TroveOperation {
    /// Borrower opened the trove
    Open,
    /// Borrower changed collateral or debt
    Adjust,
    /// Borrower closed the trove
    Close,
    /// Pending redistribution rewards were applied
    ApplyPendingRewards,
    /// Liquidated under normal-mode rules
    LiquidateInNormalMode,
    /// Liquidated under recovery-mode rules
    LiquidateInRecoveryMode,
    /// Debt redeemed against the trove
    Redeem,
}

/// Event emitted when a trove's recorded state changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroveUpdatedEvent {
    /// Trove owner
    pub borrower: Address,
    /// Collateral after the change
    pub coll: u128,
    /// Debt after the change
    pub debt: u128,
    /// Stake after the change
    pub stake: u128,
    /// Cause
    pub operation: TroveOperation,
    /// Timestamp
    pub timestamp: u64,
}

/// Liquidation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationMode {
    /// ICR below MCR
    Normal,
    /// Liquidated because the system was in recovery mode
    Recovery,
}

/// Event emitted when a trove is liquidated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroveLiquidatedEvent {
    /// Trove owner
    pub borrower: Address,
    /// Entire debt at liquidation
    pub debt: u128,
    /// Entire collateral at liquidation
    pub coll: u128,
    /// Debt cancelled against the stability pool
    pub debt_offset: u128,
    /// Debt redistributed to other troves
    pub debt_redistributed: u128,
    /// Collateral left for the owner to claim
    pub coll_surplus: u128,
    /// Mode
    pub mode: LiquidationMode,
    /// Timestamp
    pub timestamp: u64,
}

/// Event emitted when a borrowing fee is charged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowingFeePaidEvent {
    /// Trove owner
    pub borrower: Address,
    /// Fee in debt tokens
    pub fee: u128,
    /// Timestamp
    pub timestamp: u64,
}

/// Event emitted when surplus collateral is claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralClaimedEvent {
    /// Claimant
    pub account: Address,
    /// Collateral paid out
    pub amount: u128,
    /// Timestamp
    pub timestamp: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Event emitted once per liquidation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    /// Liquidator
    pub liquidator: Address,
    /// Troves liquidated
    pub troves: u32,
    /// Debt liquidated, gas reserve included
    pub liquidated_debt: u128,
    /// Collateral liquidated, gas compensation excluded
    pub liquidated_coll: u128,
    /// Collateral paid to the liquidator
    pub coll_gas_compensation: u128,
    /// Debt tokens paid to the liquidator
    pub token_gas_compensation: u128,
    /// Timestamp
    pub timestamp: u64,
}

/// Event emitted when redistribution scalars advance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistributionEvent {
    /// Collateral reward per unit staked
    pub l_coll: u128,
    /// Debt reward per unit staked
    pub l_debt: u128,
    /// Timestamp
    pub timestamp: u64,
}

/// Event emitted when the stake snapshots are refreshed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSnapshotsEvent {
    /// Total stakes after the liquidation
    pub total_stakes_snapshot: u128,
    /// Total collateral after the liquidation
    pub total_collateral_snapshot: u128,
    /// Timestamp
    pub timestamp: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDEMPTION EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Event emitted for a redemption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionEvent {
    /// Redeemer
    pub redeemer: Address,
    /// Amount the redeemer asked for
    pub attempted: u128,
    /// Amount actually redeemed
    pub actual: u128,
    /// Collateral sent to the redeemer
    pub coll_sent: u128,
    /// Collateral fee kept by the protocol
    pub coll_fee: u128,
    /// Timestamp
    pub timestamp: u64,
}

/// Event emitted when the base rate changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRateEvent {
    /// New base rate
    pub base_rate: u128,
    /// Timestamp
    pub timestamp: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Event emitted when a deposit changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityDepositEvent {
    /// Depositor
    pub depositor: Address,
    /// Deposit after the change
    pub deposit: u128,
    /// Timestamp
    pub timestamp: u64,
}

/// Event emitted when collateral gains leave the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollGainWithdrawnEvent {
    /// Depositor
    pub depositor: Address,
    /// Collateral gain
    pub coll: u128,
    /// Deposit lost to offsets
    pub debt_loss: u128,
    /// Timestamp
    pub timestamp: u64,
}

/// Event emitted when issuance rewards are paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPaidEvent {
    /// Depositor or frontend
    pub account: Address,
    /// Reward amount
    pub amount: u128,
    /// Timestamp
    pub timestamp: u64,
}

/// Event emitted for frontend registration or rate change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendEvent {
    /// Frontend
    pub frontend: Address,
    /// Kickback rate
    pub kickback_rate: u128,
    /// Timestamp
    pub timestamp: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROTOCOL EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Event emitted when recovery mode status changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryModeEvent {
    /// TCR at the transition
    pub tcr: u128,
    /// Timestamp
    pub timestamp: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT LOG
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered events emitted by the system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    events: Vec<ProtocolEvent>,
    #[serde(skip)]
    mark: Saved<usize>,
}

impl EventLog {
    /// Create a new empty event log
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the log
    pub fn push(&mut self, event: ProtocolEvent) {
        self.events.push(event);
    }

    /// Get all events
    pub fn events(&self) -> &[ProtocolEvent] {
        &self.events
    }

    /// Get events of a specific type
    pub fn filter_by_type(&self, event_type: &str) -> Vec<&ProtocolEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    /// Get the number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Remove and return all events
    pub fn drain(&mut self) -> Vec<ProtocolEvent> {
        std::mem::take(&mut self.events)
    }

    /// Hash chaining every event in order
    pub fn digest(&self) -> Result<StateHash> {
        let mut data = Vec::with_capacity(self.events.len() * 32);
        for event in &self.events {
            data.extend_from_slice(event.hash()?.as_bytes());
        }
        Ok(StateHash::sha256(&data))
    }
}

impl Transactional for EventLog {
    fn begin(&mut self) {
        self.mark.save(self.events.len());
    }

    fn commit(&mut self) {
        self.mark.clear();
    }

    fn rollback(&mut self) {
        if let Some(len) = self.mark.take() {
            self.events.truncate(len);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn trove_updated(borrower: &str, timestamp: u64) -> ProtocolEvent {
        ProtocolEvent::TroveUpdated(TroveUpdatedEvent {
            borrower: Address::derive(borrower),
            coll: 10,
            debt: 5,
            stake: 10,
            operation: TroveOperation::Open,
            timestamp,
        })
    }

    #[test]
    fn test_event_types() {
        let event = trove_updated("alice", 1234567890);
        assert_eq!(event.event_type(), "TroveUpdated");
        assert_eq!(event.timestamp(), 1234567890);
    }

    #[test]
    fn test_event_log() {
        let mut log = EventLog::new();
        assert!(log.is_empty());

        log.push(trove_updated("alice", 1));
        log.push(ProtocolEvent::BaseRateUpdated(BaseRateEvent {
            base_rate: 5,
            timestamp: 2,
        }));

        assert_eq!(log.len(), 2);
        assert_eq!(log.filter_by_type("TroveUpdated").len(), 1);
        assert_eq!(log.filter_by_type("BaseRateUpdated").len(), 1);

        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn test_event_hash() {
        let a = trove_updated("alice", 1);
        let b = trove_updated("bob", 1);
        assert_eq!(a.hash().unwrap(), a.hash().unwrap());
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn test_digest_depends_on_order() {
        let mut first = EventLog::new();
        first.push(trove_updated("alice", 1));
        first.push(trove_updated("bob", 1));

        let mut second = EventLog::new();
        second.push(trove_updated("bob", 1));
        second.push(trove_updated("alice", 1));

        assert_ne!(first.digest().unwrap(), second.digest().unwrap());
    }

    #[test]
    fn test_rollback_truncates_to_action_start() {
        let mut log = EventLog::new();
        log.push(trove_updated("alice", 1));

        log.begin();
        log.push(trove_updated("bob", 2));
        log.push(trove_updated("carol", 3));
        log.rollback();
        assert_eq!(log.len(), 1);
        assert_eq!(log.events()[0], trove_updated("alice", 1));

        log.begin();
        log.push(trove_updated("dave", 4));
        log.commit();
        log.rollback();
        assert_eq!(log.len(), 2);
    }
}
