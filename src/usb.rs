//! Composite device endpoint allocation.
//!
//! Interfaces are attached in configuration order, which is also descriptor
//! order. Each one either keeps the addresses its library assigned or, for
//! interfaces configured after others, is moved to the lowest endpoint
//! number whose OUT and IN addresses are both unused.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info};

use crate::error::AllocationError;

/// Direction bit of an endpoint address.
const DIRECTION_IN: u8 = 0x80;

/// Highest endpoint number on a USB device.
pub const MAX_ENDPOINT_NUMBER: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// A USB endpoint address (number in bits 0..4, direction in bit 7).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    pub const fn outbound(number: u8) -> Self {
        Self(number & 0x0f)
    }

    pub const fn inbound(number: u8) -> Self {
        Self(DIRECTION_IN | (number & 0x0f))
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn number(self) -> u8 {
        self.0 & 0x0f
    }

    pub const fn direction(self) -> Direction {
        if self.0 & DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterfaceRole {
    SmartCard,
    Network,
    SecurityToken,
}

impl fmt::Display for InterfaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InterfaceRole::SmartCard => "smart card (CCID)",
            InterfaceRole::Network => "network (ECM)",
            InterfaceRole::SecurityToken => "security token (U2F HID)",
        })
    }
}

/// Bulk or interrupt OUT/IN pair of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub out: EndpointAddress,
    pub inbound: EndpointAddress,
}

impl EndpointPair {
    pub const fn numbered(number: u8) -> Self {
        Self {
            out: EndpointAddress::outbound(number),
            inbound: EndpointAddress::inbound(number),
        }
    }
}

/// How the allocator treats the requested addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Keep the library-assigned addresses; a collision is an error.
    LibraryDefault,
    /// Overwrite the pair with the next free endpoint number.
    NextFreePair,
}

/// One interface as handed over by its protocol library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub role: InterfaceRole,
    pub pair: EndpointPair,
    pub interrupt: Option<EndpointAddress>,
    pub placement: Placement,
}

impl InterfaceRequest {
    /// CCID smart card: bulk 0x01/0x81, interrupt 0x82.
    pub fn smart_card() -> Self {
        Self {
            role: InterfaceRole::SmartCard,
            pair: EndpointPair::numbered(1),
            interrupt: Some(EndpointAddress::inbound(2)),
            placement: Placement::LibraryDefault,
        }
    }

    /// CDC-ECM data interface: bulk 0x03/0x83.
    pub fn network() -> Self {
        Self {
            role: InterfaceRole::Network,
            pair: EndpointPair::numbered(3),
            interrupt: None,
            placement: Placement::LibraryDefault,
        }
    }

    /// U2F HID: the library always asks for 0x01/0x81, so it is moved.
    pub fn security_token() -> Self {
        Self {
            role: InterfaceRole::SecurityToken,
            pair: EndpointPair::numbered(1),
            interrupt: None,
            placement: Placement::NextFreePair,
        }
    }

    fn addresses(&self) -> impl Iterator<Item = EndpointAddress> {
        [Some(self.pair.out), Some(self.pair.inbound), self.interrupt]
            .into_iter()
            .flatten()
    }
}

/// Endpoints finally assigned to one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedInterface {
    pub role: InterfaceRole,
    pub pair: EndpointPair,
    pub interrupt: Option<EndpointAddress>,
}

/// Builder for [`CompositeEndpointMap`].
#[derive(Debug, Default)]
pub struct CompositeAllocator {
    used: BTreeSet<EndpointAddress>,
    interfaces: Vec<AssignedInterface>,
}

impl CompositeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the next interface in descriptor order.
    pub fn attach(&mut self, request: InterfaceRequest) -> Result<AssignedInterface, AllocationError> {
        if self.interfaces.iter().any(|i| i.role == request.role) {
            return Err(AllocationError::DuplicateRole {
                role: request.role.to_string(),
            });
        }

        let pair = match request.placement {
            Placement::LibraryDefault => {
                if let Some(taken) = request.addresses().find(|a| self.used.contains(a)) {
                    return Err(AllocationError::Conflict {
                        address: taken.raw(),
                        role: request.role.to_string(),
                    });
                }
                request.pair
            }
            Placement::NextFreePair => {
                let pair = self.next_free_pair(request.interrupt).ok_or_else(|| {
                    AllocationError::Exhausted {
                        role: request.role.to_string(),
                    }
                })?;
                if pair != request.pair {
                    info!(
                        role = %request.role,
                        from_out = %request.pair.out,
                        from_in = %request.pair.inbound,
                        to_out = %pair.out,
                        to_in = %pair.inbound,
                        "reassigned endpoints to avoid collision"
                    );
                }
                pair
            }
        };

        if let Some(interrupt) = request.interrupt {
            if request.placement == Placement::NextFreePair && self.used.contains(&interrupt) {
                return Err(AllocationError::Conflict {
                    address: interrupt.raw(),
                    role: request.role.to_string(),
                });
            }
        }

        let assigned = AssignedInterface {
            role: request.role,
            pair,
            interrupt: request.interrupt,
        };
        self.used.insert(pair.out);
        self.used.insert(pair.inbound);
        if let Some(interrupt) = assigned.interrupt {
            self.used.insert(interrupt);
        }
        debug!(role = %assigned.role, out = %pair.out, inbound = %pair.inbound, "interface attached");

        self.interfaces.push(assigned);
        Ok(assigned)
    }

    fn next_free_pair(&self, interrupt: Option<EndpointAddress>) -> Option<EndpointPair> {
        (1..=MAX_ENDPOINT_NUMBER).map(EndpointPair::numbered).find(|pair| {
            !self.used.contains(&pair.out)
                && !self.used.contains(&pair.inbound)
                && Some(pair.inbound) != interrupt
        })
    }

    /// Freeze the assignment.
    pub fn build(self) -> CompositeEndpointMap {
        CompositeEndpointMap {
            interfaces: self.interfaces,
        }
    }
}

/// Immutable endpoint assignment of the composite device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeEndpointMap {
    interfaces: Vec<AssignedInterface>,
}

impl CompositeEndpointMap {
    pub fn get(&self, role: InterfaceRole) -> Option<&AssignedInterface> {
        self.interfaces.iter().find(|i| i.role == role)
    }

    /// Interfaces in descriptor order.
    pub fn iter(&self) -> impl Iterator<Item = &AssignedInterface> {
        self.interfaces.iter()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Every address in use, by interface role.
    pub fn addresses(&self) -> BTreeMap<EndpointAddress, InterfaceRole> {
        let mut out = BTreeMap::new();
        for interface in &self.interfaces {
            out.insert(interface.pair.out, interface.role);
            out.insert(interface.pair.inbound, interface.role);
            if let Some(interrupt) = interface.interrupt {
                out.insert(interrupt, interface.role);
            }
        }
        out
    }
}
