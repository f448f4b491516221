//! Address-alias resolution for tenant-multiplexed backends
//!
//! Multiplexed deployments route many logical tenants through one shared
//! broker. Connections declare their addresses with alias tokens; the
//! resolver rewrites a recognized alias to `<alias>/<tenant-id>` so every
//! tenant lands in its own address space. Addresses that are not recognized
//! aliases pass through unchanged.

use super::connection::{Source, Target};

/// Address-space aliases of the multiplexed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressAlias {
    Telemetry,
    Event,
    Command,
    CommandResponse,
}

impl AddressAlias {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "telemetry" => Some(Self::Telemetry),
            "event" => Some(Self::Event),
            "command" => Some(Self::Command),
            "command_response" => Some(Self::CommandResponse),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Event => "event",
            Self::Command => "command",
            Self::CommandResponse => "command_response",
        }
    }
}

/// Resolve one address: recognized aliases become `<alias>/<tenant_id>`,
/// anything else is returned as declared.
pub fn resolve_address(address: &str, tenant_id: &str) -> String {
    match AddressAlias::from_name(address) {
        Some(alias) => format!("{}/{}", alias.as_str(), tenant_id),
        None => address.to_string(),
    }
}

/// Rewrite every address of a source, and its reply-target, into the
/// tenant's address space.
pub fn resolve_source_aliases(source: &Source, tenant_id: &str) -> Source {
    let mut resolved = source.clone();
    resolved.addresses = source
        .addresses
        .iter()
        .map(|address| resolve_address(address, tenant_id))
        .collect();
    resolved.reply_target = source
        .reply_target
        .as_deref()
        .map(|reply| resolve_address(reply, tenant_id));
    resolved
}

/// Single-address equivalent of [`resolve_source_aliases`] for targets.
pub fn resolve_target_alias(target: &Target, tenant_id: &str) -> Target {
    let mut resolved = target.clone();
    resolved.address = resolve_address(&target.address, tenant_id);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QualityOfService;

    #[test]
    fn recognized_aliases_get_tenant_suffix() {
        assert_eq!(resolve_address("telemetry", "tenant-a"), "telemetry/tenant-a");
        assert_eq!(resolve_address("event", "tenant-a"), "event/tenant-a");
        assert_eq!(resolve_address("command", "tenant-a"), "command/tenant-a");
        assert_eq!(
            resolve_address("command_response", "tenant-a"),
            "command_response/tenant-a"
        );
    }

    #[test]
    fn unrecognized_addresses_pass_through_unchanged() {
        assert_eq!(resolve_address("my/own/topic", "tenant-a"), "my/own/topic");
        assert_eq!(resolve_address("Telemetry", "tenant-a"), "Telemetry");
    }

    #[test]
    fn source_addresses_and_reply_target_are_rewritten() {
        let source = Source::new(["telemetry", "event", "plain-topic"], QualityOfService::AtLeastOnce)
            .with_reply_target("command_response");

        let resolved = resolve_source_aliases(&source, "t1");

        assert_eq!(
            resolved.addresses,
            vec!["telemetry/t1", "event/t1", "plain-topic"]
        );
        assert_eq!(resolved.reply_target.as_deref(), Some("command_response/t1"));
        // the rest of the binding is untouched
        assert_eq!(resolved.qos, source.qos);
    }

    #[test]
    fn target_address_is_rewritten() {
        let target = Target::new("command").with_topics(["twin/commands"]);
        let resolved = resolve_target_alias(&target, "t1");
        assert_eq!(resolved.address, "command/t1");
        assert_eq!(resolved.topics, target.topics);
    }

    #[test]
    fn resolution_is_pure_and_repeatable() {
        let source = Source::new(["telemetry"], QualityOfService::AtMostOnce);
        let first = resolve_source_aliases(&source, "t1");
        let second = resolve_source_aliases(&source, "t1");
        assert_eq!(first, second);
    }
}
