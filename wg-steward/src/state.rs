// State machine for peer access

//! State machine for peer access management
//!
//! A peer is either active (present on the live interface and in the main
//! table) or restricted (removed from the interface, kept in the restricted
//! table). This module decides, for a restrict/allow/delete command, what
//! has to happen on the interface and in the store. Executing the plan is
//! left to [`crate::configuration`].

use crate::error::{Error, Missing, Result};

/// Where a peer currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAccess {
    /// On the interface, in the main table
    Active,
    /// Off the interface, in the restricted table
    Restricted,
}

/// Operator or job command on a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCommand {
    /// Cut the peer off but keep its record
    Restrict,
    /// Re-admit a restricted peer
    Allow,
    /// Remove the peer for good
    Delete,
}

/// What to do on the live interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceAction {
    /// `wg set <iface> peer <key> remove`
    RemovePeer,
    /// `wg set <iface> peer <key> allowed-ips ...`
    PushPeer,
    /// Interface does not know the peer
    None,
}

/// What to do in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    /// Main table to restricted table, status stopped
    MoveToRestricted,
    /// Restricted table back to the main table
    MoveToActive,
    /// Copy into the deleted table, then drop the row
    HardDelete,
}

/// Steps needed to carry out one command on one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPlan {
    pub interface: InterfaceAction,
    pub store: StoreAction,
    /// Access after the plan has been applied (`None` once deleted)
    pub next: Option<PeerAccess>,
}

/// Plan a transition for the peer `id`
///
/// `current` is `None` when the peer is unknown to this configuration.
///
/// # Errors
///
/// [`Error::NotFound`] for an unknown peer, [`Error::Validation`] when the
/// command does not apply to the peer's current access (restricting an
/// already restricted peer, allowing an active one).
pub fn plan(id: &str, current: Option<PeerAccess>, cmd: AccessCommand) -> Result<AccessPlan> {
    log::debug!("Peer {}: access {:?}, command {:?}", id, current, cmd);

    let Some(current) = current else {
        return Err(Error::not_found(Missing::Peer, id));
    };

    let plan = match (current, cmd) {
        (PeerAccess::Active, AccessCommand::Restrict) => AccessPlan {
            interface: InterfaceAction::RemovePeer,
            store: StoreAction::MoveToRestricted,
            next: Some(PeerAccess::Restricted),
        },

        (PeerAccess::Restricted, AccessCommand::Allow) => AccessPlan {
            interface: InterfaceAction::PushPeer,
            store: StoreAction::MoveToActive,
            next: Some(PeerAccess::Active),
        },

        (PeerAccess::Active, AccessCommand::Delete) => AccessPlan {
            interface: InterfaceAction::RemovePeer,
            store: StoreAction::HardDelete,
            next: None,
        },

        // Restricted peers are already off the interface
        (PeerAccess::Restricted, AccessCommand::Delete) => AccessPlan {
            interface: InterfaceAction::None,
            store: StoreAction::HardDelete,
            next: None,
        },

        (PeerAccess::Restricted, AccessCommand::Restrict) => {
            return Err(Error::validation(format!("Peer {} is already restricted", id)));
        }

        (PeerAccess::Active, AccessCommand::Allow) => {
            return Err(Error::validation(format!("Peer {} is not restricted", id)));
        }
    };

    Ok(plan)
}
