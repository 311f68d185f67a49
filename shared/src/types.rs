use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Numeric identifier of a discovery service. `0` is never assigned.
pub type ServiceId = u32;

/// Sentinel for "not yet assigned" or "operation failed".
pub const INVALID_SERVICE_ID: ServiceId = 0;

/// Kind of discovery endpoint. The discriminant is the persisted tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ServiceKind {
    /// Banned or unknown service, never queried
    Null = 0,
    /// GWebCache reachable over HTTP
    Gwc = 1,
    /// UDP host cache
    Uhc = 2,
    /// Plain HTTP host list
    Bootstrap = 3,
}

impl ServiceKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Null),
            1 => Some(Self::Gwc),
            2 => Some(Self::Uhc),
            3 => Some(Self::Bootstrap),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Gwc => "gwc",
            Self::Uhc => "uhc",
            Self::Bootstrap => "bootstrap",
        };
        f.write_str(name)
    }
}

/// A single P2P network a service can bootstrap into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Gnutella,
    G2,
    Ares,
    EDonkey,
    Kademlia,
    BitTorrent,
}

impl Network {
    pub const ALL: [Network; 6] = [
        Network::Gnutella,
        Network::G2,
        Network::Ares,
        Network::EDonkey,
        Network::Kademlia,
        Network::BitTorrent,
    ];

    fn bit(self) -> u16 {
        match self {
            Self::Gnutella => 1 << 0,
            Self::G2 => 1 << 1,
            Self::Ares => 1 << 2,
            Self::EDonkey => 1 << 3,
            Self::Kademlia => 1 << 4,
            Self::BitTorrent => 1 << 5,
        }
    }

    /// Name used in GWebCache `net=` parameters.
    pub fn gwc_name(self) -> &'static str {
        match self {
            Self::Gnutella => "gnutella",
            Self::G2 => "gnutella2",
            Self::Ares => "ares",
            Self::EDonkey => "edonkey",
            Self::Kademlia => "kad",
            Self::BitTorrent => "bittorrent",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gnutella" | "g1" => Some(Self::Gnutella),
            "g2" | "gnutella2" => Some(Self::G2),
            "ares" => Some(Self::Ares),
            "edonkey" | "ed2k" => Some(Self::EDonkey),
            "kademlia" | "kad" => Some(Self::Kademlia),
            "bittorrent" | "bt" => Some(Self::BitTorrent),
            _ => None,
        }
    }
}

/// Bitmask of networks a service applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkType(u16);

impl NetworkType {
    pub const NULL: NetworkType = NetworkType(0);

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True if at least one network is shared with `other`.
    pub fn is_network(self, other: NetworkType) -> bool {
        self.0 & other.0 != 0
    }

    /// Adds all networks of `other` to this mask.
    pub fn set_network(&mut self, other: NetworkType) {
        self.0 |= other.0;
    }

    pub fn networks(self) -> impl Iterator<Item = Network> {
        Network::ALL.into_iter().filter(move |n| self.0 & n.bit() != 0)
    }
}

impl From<Network> for NetworkType {
    fn from(network: Network) -> Self {
        Self(network.bit())
    }
}

impl FromIterator<Network> for NetworkType {
    fn from_iter<I: IntoIterator<Item = Network>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NULL, |acc, n| acc | n.into())
    }
}

impl BitOr for NetworkType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for NetworkType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.networks().map(Network::gwc_name).collect();
        f.write_str(&names.join("|"))
    }
}

/// A registered discovery service as seen by observers.
/// This is the view handed out by the manager's events and the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub id: ServiceId,

    /// Normalized service URL
    pub url: String,

    pub kind: ServiceKind,

    pub networks: NetworkType,

    /// Selection weight; 0 means dormant until revived
    pub rating: u8,

    pub banned: bool,

    /// Whether an update or query is in flight
    pub running: bool,

    /// Last time the service was contacted
    pub last_queried: Option<DateTime<Utc>>,

    /// Last time the service answered successfully
    pub last_success: Option<DateTime<Utc>>,

    /// Consecutive failed requests
    pub failures: u32,

    /// How often the service was revived from a zero rating
    pub zero_revivals: u8,
}
