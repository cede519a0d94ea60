//! Known peer address tracking.
//!
//! Addresses arrive from the command line, the persisted store, and peer
//! gossip. The book deduplicates them, refuses the node's own advertised
//! address, and caps the total so a hostile peer cannot grow it without
//! bound.

use std::collections::BTreeSet;

/// Upper bound on tracked addresses.
pub const MAX_ADDRESSES: usize = 1000;

/// Longest accepted `host:port` string.
const MAX_ADDRESS_LEN: usize = 64;

pub struct AddressBook {
    addrs: BTreeSet<String>,
    self_addr: Option<String>,
}

impl AddressBook {
    pub fn new(initial: Vec<String>, self_addr: Option<String>) -> Self {
        let mut book = AddressBook {
            addrs: BTreeSet::new(),
            self_addr,
        };
        for addr in initial {
            book.insert(&addr);
        }
        book
    }

    /// Records an address. Returns true only when the address was valid
    /// and not already known.
    pub fn insert(&mut self, addr: &str) -> bool {
        if !is_plausible_address(addr) {
            return false;
        }
        if self.self_addr.as_deref() == Some(addr) {
            return false;
        }
        if self.addrs.len() >= MAX_ADDRESSES && !self.addrs.contains(addr) {
            return false;
        }
        self.addrs.insert(addr.to_string())
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.contains(addr)
    }

    /// All known addresses, sorted.
    pub fn list(&self) -> Vec<String> {
        self.addrs.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Cheap shape check for a `host:port` string. Name resolution is left to
/// the dialer; this only rejects obvious garbage from gossip.
fn is_plausible_address(addr: &str) -> bool {
    if addr.is_empty() || addr.len() > MAX_ADDRESS_LEN {
        return false;
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_deduplicates() {
        let mut book = AddressBook::new(Vec::new(), None);
        assert!(book.insert("10.0.0.1:6001"));
        assert!(!book.insert("10.0.0.1:6001"));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn own_address_is_rejected() {
        let mut book = AddressBook::new(Vec::new(), Some("1.2.3.4:6001".to_string()));
        assert!(!book.insert("1.2.3.4:6001"));
        assert!(book.insert("1.2.3.5:6001"));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        let mut book = AddressBook::new(Vec::new(), None);
        assert!(!book.insert(""));
        assert!(!book.insert("no-port"));
        assert!(!book.insert("host:notaport"));
        assert!(!book.insert("host:99999"));
        assert!(!book.insert(&format!("{}:6001", "x".repeat(80))));
        assert!(book.is_empty());
    }

    #[test]
    fn book_is_capped() {
        let mut book = AddressBook::new(Vec::new(), None);
        for i in 0..MAX_ADDRESSES {
            assert!(book.insert(&format!("10.0.{}.{}:6001", i / 256, i % 256)));
        }
        assert!(!book.insert("172.16.0.1:6001"));
        assert_eq!(book.len(), MAX_ADDRESSES);
    }

    #[test]
    fn initial_list_is_filtered() {
        let book = AddressBook::new(
            vec![
                "10.0.0.1:6001".to_string(),
                "bogus".to_string(),
                "10.0.0.1:6001".to_string(),
            ],
            None,
        );
        assert_eq!(book.list(), vec!["10.0.0.1:6001".to_string()]);
    }
}
