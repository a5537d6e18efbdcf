//! Device model: discovered targets, transport protocols, and credentials.
//!
//! # Lifecycle of a target
//!
//! ```text
//! scan()  ──►  DeviceTarget (no credentials)
//!                  │
//!                  ├─ pairing produces a CredentialSet
//!                  │
//! connect ──►  DeviceTarget::with_credentials(set)  ──►  provider.connect()
//! ```
//!
//! A [`DeviceTarget`] is never modified in place once discovery hands it
//! out.  Applying credentials returns a configured copy, so the entry in the
//! gateway's scan index and the copy the session connects with can never
//! drift apart silently.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Substring of the model string that marks a device as a TV-class box.
///
/// Discovery also finds speakers and computers; the gateway only offers
/// devices whose model string contains this marker when filtering is on.
pub const TV_MODEL_MARKER: &str = "TV";

// ── Protocol ──────────────────────────────────────────────────────────────────

/// A transport protocol that needs its own pairing handshake.
///
/// Pairing always runs AirPlay first and Companion second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    AirPlay,
    Companion,
}

impl Protocol {
    /// Both protocols in pairing order.
    pub const ALL: [Protocol; 2] = [Protocol::AirPlay, Protocol::Companion];

    /// Stable name used in logs and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::AirPlay => "AirPlay",
            Protocol::Companion => "Companion",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── CredentialSet ─────────────────────────────────────────────────────────────

/// Opaque credential strings keyed by protocol.
///
/// Built one protocol at a time during pairing and handed back by the client
/// on `connect`.  The gateway never looks inside a credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    entries: BTreeMap<Protocol, String>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the credential for `protocol`, replacing any previous value.
    pub fn insert(&mut self, protocol: Protocol, credential: impl Into<String>) {
        self.entries.insert(protocol, credential.into());
    }

    pub fn get(&self, protocol: Protocol) -> Option<&str> {
        self.entries.get(&protocol).map(String::as_str)
    }

    pub fn contains(&self, protocol: Protocol) -> bool {
        self.entries.contains_key(&protocol)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates credentials in pairing order (AirPlay before Companion).
    pub fn iter(&self) -> impl Iterator<Item = (Protocol, &str)> {
        self.entries.iter().map(|(p, c)| (*p, c.as_str()))
    }

    /// Copies every entry of `other` into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: &CredentialSet) {
        for (protocol, credential) in other.iter() {
            self.insert(protocol, credential);
        }
    }

    /// Lists the protocols present, for log lines that must not print secrets.
    pub fn protocols(&self) -> Vec<Protocol> {
        self.entries.keys().copied().collect()
    }
}

// ── DeviceTarget ──────────────────────────────────────────────────────────────

/// A device as reported by discovery.
///
/// The `identifier` is the stable key: it survives address changes and is
/// what the gateway uses to re-resolve a device before connecting and when
/// reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    name: String,
    address: IpAddr,
    identifier: String,
    model: String,
    #[serde(default)]
    credentials: CredentialSet,
}

impl DeviceTarget {
    /// Creates a target with empty credential slots.
    pub fn new(
        name: impl Into<String>,
        address: IpAddr,
        identifier: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            identifier: identifier.into(),
            model: model.into(),
            credentials: CredentialSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    /// Human-readable label used as the scan index key: `"name (address)"`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.address)
    }

    /// `true` when the model string carries the TV marker.
    ///
    /// This is a plain substring test on the provider's model string.
    pub fn is_tv(&self) -> bool {
        self.model.contains(TV_MODEL_MARKER)
    }

    /// Returns a copy of this target with `credentials` applied on top of
    /// whatever slots it already had.
    pub fn with_credentials(&self, credentials: &CredentialSet) -> DeviceTarget {
        let mut configured = self.clone();
        configured.credentials.merge(credentials);
        configured
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
