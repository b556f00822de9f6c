//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::southbound::{AddressMsg, InterfaceUpdateMsg};

// Useful type definition(s).
pub type IbusReceiver = UnboundedReceiver<IbusMsg>;
pub type IbusSender = UnboundedSender<IbusMsg>;

/// Ibus message for communication between the daemon's base components and
/// the protocol instance.
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub enum IbusMsg {
    /// Interface update notification.
    InterfaceUpd(InterfaceUpdateMsg),
    /// Interface delete notification.
    InterfaceDel(u32),
    /// Interface address addition notification.
    InterfaceAddressAdd(AddressMsg),
    /// Interface address delete notification.
    InterfaceAddressDel(AddressMsg),
    /// Request for a read-only snapshot of the instance's operational state.
    StateRequest(#[serde(skip)] Option<oneshot::Sender<serde_json::Value>>),
}
