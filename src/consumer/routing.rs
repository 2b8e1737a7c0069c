//! Contract address routing.

use std::collections::HashMap;

use super::DispatchConfig;
use crate::bus::format::is_hex_of_len;

/// Which handler a chain log goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerId {
    StakeTrade,
    NamespaceFactory,
    LaunchpadTrade,
    /// Anything not configured.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("Address {address} is configured for both {first:?} and {second:?}")]
    Conflict {
        address: String,
        first: HandlerId,
        second: HandlerId,
    },

    #[error("Invalid contract address: {0}")]
    InvalidAddress(String),
}

/// Lower-cased contract address -> handler, with an explicit default.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, HandlerId>,
    default: HandlerId,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            default: HandlerId::Fallback,
        }
    }
}

impl RoutingTable {
    pub fn from_config(config: &DispatchConfig) -> Result<Self, RoutingError> {
        let mut table = Self::default();
        for (addresses, id) in [
            (&config.stake_contracts, HandlerId::StakeTrade),
            (&config.factory_contracts, HandlerId::NamespaceFactory),
            (&config.launchpad_contracts, HandlerId::LaunchpadTrade),
        ] {
            for address in addresses {
                table.insert(address, id)?;
            }
        }
        Ok(table)
    }

    /// Route `address` to `id`. Repeating the same pair is fine; giving an
    /// address a second handler is not.
    pub fn insert(&mut self, address: &str, id: HandlerId) -> Result<(), RoutingError> {
        let address = address.trim().to_lowercase();
        if !is_hex_of_len(&address, 20) {
            return Err(RoutingError::InvalidAddress(address));
        }
        match self.routes.get(&address) {
            Some(&existing) if existing != id => Err(RoutingError::Conflict {
                address,
                first: existing,
                second: id,
            }),
            _ => {
                self.routes.insert(address, id);
                Ok(())
            }
        }
    }

    pub fn route(&self, address: &str) -> HandlerId {
        self.routes
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(self.default)
    }

    /// Number of configured addresses.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAKE: &str = "0xAbC0000000000000000000000000000000000001";
    const FACTORY: &str = "0xabc0000000000000000000000000000000000002";

    #[test]
    fn test_routes_case_insensitively_with_default() {
        let config = DispatchConfig {
            stake_contracts: vec![STAKE.to_string()],
            factory_contracts: vec![FACTORY.to_string()],
            launchpad_contracts: vec![],
        };
        let table = RoutingTable::from_config(&config).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.route(&STAKE.to_lowercase()), HandlerId::StakeTrade);
        assert_eq!(table.route(&FACTORY.to_uppercase().replace("0X", "0x")), HandlerId::NamespaceFactory);
        assert_eq!(
            table.route("0x0000000000000000000000000000000000000000"),
            HandlerId::Fallback
        );
    }

    #[test]
    fn test_address_with_two_handlers_is_rejected() {
        let config = DispatchConfig {
            stake_contracts: vec![STAKE.to_string()],
            factory_contracts: vec![],
            launchpad_contracts: vec![STAKE.to_lowercase()],
        };
        let err = RoutingTable::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            RoutingError::Conflict {
                first: HandlerId::StakeTrade,
                second: HandlerId::LaunchpadTrade,
                ..
            }
        ));
    }

    #[test]
    fn test_repeated_address_same_handler_is_fine() {
        let mut table = RoutingTable::default();
        table.insert(STAKE, HandlerId::StakeTrade).unwrap();
        table.insert(&STAKE.to_lowercase(), HandlerId::StakeTrade).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_malformed_address_is_rejected() {
        let mut table = RoutingTable::default();
        assert!(matches!(
            table.insert("0x1234", HandlerId::StakeTrade),
            Err(RoutingError::InvalidAddress(_))
        ));
        assert!(table.is_empty());
    }
}
