// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 LocalForward Contributors

// Network utility functions for the managed loopback block

use std::net::Ipv4Addr;

/// First three octets of the block addresses are minted from
pub const LOOPBACK_BLOCK: [u8; 3] = [127, 0, 0];

/// Build the loopback address for a given last octet (127.0.0.N)
pub fn loopback_address(octet: u8) -> Ipv4Addr {
    let [a, b, c] = LOOPBACK_BLOCK;
    Ipv4Addr::new(a, b, c, octet)
}

/// Return the last octet if the address sits inside the managed /24 block
pub fn block_octet(address: &Ipv4Addr) -> Option<u8> {
    let [a, b, c, d] = address.octets();
    if [a, b, c] == LOOPBACK_BLOCK {
        Some(d)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_address() {
        assert_eq!(loopback_address(2), Ipv4Addr::new(127, 0, 0, 2));
        assert_eq!(loopback_address(254).to_string(), "127.0.0.254");
    }

    #[test]
    fn test_block_octet() {
        assert_eq!(block_octet(&Ipv4Addr::new(127, 0, 0, 7)), Some(7));
        assert_eq!(block_octet(&Ipv4Addr::new(127, 0, 1, 7)), None);
        assert_eq!(block_octet(&Ipv4Addr::new(10, 0, 0, 7)), None);
    }
}
