//! Addresses a bridge peer may reach
//!
//! Inbound rules gate SEND and PUBLISH frames; outbound rules gate REGISTER.
//! An empty rule list permits nothing.

use crate::config::{AddressRuleConfig, BridgeConfig, ConfigResult, ConfigurationError};
use regex::Regex;

#[derive(Debug, Clone)]
enum AddressRule {
    Exact(String),
    Pattern(Regex),
}

impl AddressRule {
    fn from_config(rule: &AddressRuleConfig, field: &str) -> ConfigResult<Self> {
        match (&rule.address, &rule.address_regex) {
            (Some(address), None) => Ok(Self::Exact(address.clone())),
            (None, Some(pattern)) => Regex::new(&format!("^(?:{pattern})$"))
                .map(Self::Pattern)
                .map_err(|e| ConfigurationError::InvalidPattern {
                    pattern: pattern.clone(),
                    error: e.to_string(),
                }),
            _ => Err(ConfigurationError::invalid_value(
                field,
                format!("{rule:?}"),
                "each rule needs exactly one of address or address_regex",
            )),
        }
    }

    fn matches(&self, address: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == address,
            Self::Pattern(regex) => regex.is_match(address),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllowList {
    inbound: Vec<AddressRule>,
    outbound: Vec<AddressRule>,
}

impl AllowList {
    pub fn from_config(config: &BridgeConfig) -> ConfigResult<Self> {
        let inbound = config
            .inbound_permitted
            .iter()
            .map(|rule| AddressRule::from_config(rule, "bridge.inbound_permitted"))
            .collect::<ConfigResult<Vec<_>>>()?;
        let outbound = config
            .outbound_permitted
            .iter()
            .map(|rule| AddressRule::from_config(rule, "bridge.outbound_permitted"))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(Self { inbound, outbound })
    }

    /// Whether a peer may SEND or PUBLISH to `address`
    pub fn permits_inbound(&self, address: &str) -> bool {
        self.inbound.iter().any(|rule| rule.matches(address))
    }

    /// Whether a peer may REGISTER against `address`
    pub fn permits_outbound(&self, address: &str) -> bool {
        self.outbound.iter().any(|rule| rule.matches(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(inbound: Vec<AddressRuleConfig>, outbound: Vec<AddressRuleConfig>) -> BridgeConfig {
        BridgeConfig {
            inbound_permitted: inbound,
            outbound_permitted: outbound,
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_and_pattern_rules() {
        let allow = AllowList::from_config(&config(
            vec![
                AddressRuleConfig::exact("todo.get"),
                AddressRuleConfig::regex(r"todo\.(create|update)"),
            ],
            vec![AddressRuleConfig::regex(r"todo\.changed\..+")],
        ))
        .unwrap();

        assert!(allow.permits_inbound("todo.get"));
        assert!(allow.permits_inbound("todo.update"));
        assert!(!allow.permits_inbound("todo.delete"));
        // patterns are anchored
        assert!(!allow.permits_inbound("admin.todo.create"));

        assert!(allow.permits_outbound("todo.changed.42"));
        assert!(!allow.permits_outbound("todo.get"));
    }

    #[test]
    fn test_empty_list_permits_nothing() {
        let allow = AllowList::default();
        assert!(!allow.permits_inbound("todo.get"));
        assert!(!allow.permits_outbound("todo.get"));
    }

    #[test]
    fn test_rule_with_both_fields_rejected() {
        let rule = AddressRuleConfig {
            address: Some("a".into()),
            address_regex: Some("b".into()),
        };
        let err = AllowList::from_config(&config(vec![rule], vec![])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_bad_regex_rejected() {
        let err = AllowList::from_config(&config(vec![], vec![AddressRuleConfig::regex("todo.(")]))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidPattern { .. }));
    }
}
