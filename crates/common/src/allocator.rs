// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// LocalForward - Address Allocator
// Picks the lowest free loopback address for a hostname

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hosts::HostEntry;
use crate::network::{block_octet, loopback_address};

/// Inclusive range of last-octet values addresses are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRange {
    pub first: u8,
    pub last: u8,
}

impl Default for AllocationRange {
    fn default() -> Self {
        Self { first: 2, last: 254 }
    }
}

impl AllocationRange {
    pub fn new(first: u8, last: u8) -> Result<Self> {
        let range = Self { first, last };
        range.validate()?;
        Ok(range)
    }

    /// .0 is the network address and .255 the broadcast address of the block
    pub fn validate(&self) -> Result<()> {
        if self.first == 0 || self.last == 255 {
            return Err(Error::Config(format!(
                "allocation range {}..={} must stay within 1..=254",
                self.first, self.last
            )));
        }
        if self.first > self.last {
            return Err(Error::Config(format!(
                "allocation range start {} is greater than end {}",
                self.first, self.last
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        usize::from(self.last - self.first) + 1
    }
}

/// Result of asking for an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// A fresh address the caller should append and bind
    Assigned(Ipv4Addr),
    /// The name already has this address; nothing to do
    AlreadyConfigured(Ipv4Addr),
}

impl Allocation {
    pub fn address(&self) -> Ipv4Addr {
        match self {
            Allocation::Assigned(addr) | Allocation::AlreadyConfigured(addr) => *addr,
        }
    }
}

/// Choose an address for `name` given the current managed entries
///
/// Always the lowest free octet, so allocation is deterministic and packed.
pub fn allocate(name: &str, entries: &[HostEntry], range: AllocationRange) -> Result<Allocation> {
    if let Some(existing) = entries.iter().find(|entry| entry.name == name) {
        debug!("{} already configured at {}", name, existing.address);
        return Ok(Allocation::AlreadyConfigured(existing.address));
    }

    let used: BTreeSet<u8> = entries
        .iter()
        .filter_map(|entry| block_octet(&entry.address))
        .collect();

    let octet = (range.first..=range.last)
        .find(|octet| !used.contains(octet))
        .ok_or(Error::ResourceExhausted {
            first: range.first,
            last: range.last,
        })?;

    let address = loopback_address(octet);
    debug!("Allocated {} for {} ({} in use)", address, name, used.len());
    Ok(Allocation::Assigned(address))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(octet: u8, name: &str) -> HostEntry {
        HostEntry {
            address: loopback_address(octet),
            name: name.to_string(),
            line_number: 0,
        }
    }

    #[test]
    fn test_empty_table_gets_first_octet() {
        let range = AllocationRange::new(2, 5).unwrap();
        let allocation = allocate("svc-a", &[], range).unwrap();
        assert_eq!(allocation, Allocation::Assigned(Ipv4Addr::new(127, 0, 0, 2)));
    }

    #[test]
    fn test_lowest_free_fills_gaps() {
        let range = AllocationRange::default();
        let entries = vec![entry(2, "a"), entry(4, "b"), entry(3, "c"), entry(6, "d")];
        let allocation = allocate("e", &entries, range).unwrap();
        assert_eq!(allocation, Allocation::Assigned(loopback_address(5)));
    }

    #[test]
    fn test_existing_name_short_circuits() {
        let range = AllocationRange::new(2, 5).unwrap();
        let entries = vec![entry(2, "svc-a"), entry(3, "svc-b")];
        let allocation = allocate("svc-a", &entries, range).unwrap();
        assert_eq!(allocation, Allocation::AlreadyConfigured(loopback_address(2)));
    }

    #[test]
    fn test_existing_name_wins_even_when_full() {
        let range = AllocationRange::new(2, 2).unwrap();
        let entries = vec![entry(2, "svc-a")];
        assert_eq!(
            allocate("svc-a", &entries, range).unwrap(),
            Allocation::AlreadyConfigured(loopback_address(2))
        );
    }

    #[test]
    fn test_exhausted_range() {
        let range = AllocationRange::new(2, 5).unwrap();
        let entries: Vec<HostEntry> = (2..=5).map(|o| entry(o, &format!("svc-{}", o))).collect();
        let result = allocate("one-more", &entries, range);
        assert!(matches!(
            result,
            Err(Error::ResourceExhausted { first: 2, last: 5 })
        ));
    }

    #[test]
    fn test_entries_outside_range_do_not_block() {
        let range = AllocationRange::new(10, 11).unwrap();
        let entries = vec![entry(2, "low"), entry(10, "ten")];
        assert_eq!(
            allocate("new", &entries, range).unwrap(),
            Allocation::Assigned(loopback_address(11))
        );
    }

    #[test]
    fn test_sequential_allocations_are_unique() {
        let range = AllocationRange::new(2, 40).unwrap();
        let mut entries = Vec::new();
        for i in 0..range.len() {
            let name = format!("host-{}", i);
            let address = allocate(&name, &entries, range).unwrap().address();
            assert_eq!(block_octet(&address), Some(2 + i as u8));
            entries.push(HostEntry {
                address,
                name,
                line_number: i + 1,
            });
        }
        assert!(allocate("overflow", &entries, range).is_err());
    }

    #[test]
    fn test_range_validation() {
        assert!(AllocationRange::new(2, 254).is_ok());
        assert!(AllocationRange::new(7, 7).is_ok());
        assert!(AllocationRange::new(0, 10).is_err());
        assert!(AllocationRange::new(2, 255).is_err());
        assert!(AllocationRange::new(9, 3).is_err());
        assert_eq!(AllocationRange::new(2, 5).unwrap().len(), 4);
    }
}
