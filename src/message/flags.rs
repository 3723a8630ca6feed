//! Message flags
//!
//! `Flags` travel on the wire. `TransientFlags` are local to the sending
//! member and are never encoded.

use std::fmt;

/// Wire flags carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u16);

impl Flags {
    /// Deliver outside the per-sender order as soon as received.
    pub const OOB: Flags = Flags(0x0001);
    /// Send immediately instead of queuing in the bundler.
    pub const DONT_BUNDLE: Flags = Flags(0x0002);
    /// Bypass flow control.
    pub const NO_FC: Flags = Flags(0x0004);
    /// Bypass the reliable multicast/unicast protocols.
    pub const NO_RELIABILITY: Flags = Flags(0x0008);
    /// Stack-internal control message, never shown to the application.
    pub const INTERNAL: Flags = Flags(0x0010);

    /// No flags set.
    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Raw bits.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Build from raw bits.
    pub const fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }

    /// Whether all bits in `other` are set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits in `other`.
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    /// Clear the bits in `other`.
    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Flags::OOB, "OOB"),
            (Flags::DONT_BUNDLE, "DONT_BUNDLE"),
            (Flags::NO_FC, "NO_FC"),
            (Flags::NO_RELIABILITY, "NO_RELIABILITY"),
            (Flags::INTERNAL, "INTERNAL"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

/// Flags that only affect the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransientFlags(u8);

impl TransientFlags {
    /// Suppress delivery of a multicast to the sender itself.
    pub const DONT_LOOPBACK: TransientFlags = TransientFlags(0x01);

    /// No flags set.
    pub const fn empty() -> Self {
        TransientFlags(0)
    }

    /// Whether all bits in `other` are set.
    pub const fn contains(self, other: TransientFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits in `other`.
    pub fn insert(&mut self, other: TransientFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits in `other`.
    pub fn remove(&mut self, other: TransientFlags) {
        self.0 &= !other.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut flags = Flags::empty();
        flags.insert(Flags::OOB | Flags::NO_FC);
        assert!(flags.contains(Flags::OOB));
        assert!(flags.contains(Flags::NO_FC));
        assert!(!flags.contains(Flags::DONT_BUNDLE));

        flags.remove(Flags::OOB);
        assert!(!flags.contains(Flags::OOB));
        assert_eq!(Flags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_display() {
        assert_eq!((Flags::OOB | Flags::INTERNAL).to_string(), "OOB|INTERNAL");
        assert_eq!(Flags::empty().to_string(), "");
    }

    #[test]
    fn test_transient() {
        let mut t = TransientFlags::empty();
        assert!(!t.contains(TransientFlags::DONT_LOOPBACK));
        t.insert(TransientFlags::DONT_LOOPBACK);
        assert!(t.contains(TransientFlags::DONT_LOOPBACK));
    }
}
