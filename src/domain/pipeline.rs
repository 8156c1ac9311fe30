//! Resolution of binding keys from the pipeline configuration

use crate::library::helpers::split_comma_list;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Routing states assigned to components and component groups
///
/// The configuration is a flat mapping from a component or group name to a
/// comma separated list of routing states. An entry for the concrete
/// component takes precedence over an entry for the group it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineConfig(BTreeMap<String, String>);

impl PipelineConfig {
    /// Assigns routing states to a component or group
    pub fn insert(&mut self, component: impl Into<String>, states: impl Into<String>) {
        self.0.insert(component.into(), states.into());
    }

    /// Whether no component has any states configured
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Routing states configured for the given component, falling back to
    /// the states of its group
    pub fn states_for(&self, component: &str, group: &str) -> Option<Vec<String>> {
        self.0
            .get(component)
            .or_else(|| self.0.get(group))
            .map(|raw| split_comma_list(raw))
            .filter(|states| !states.is_empty())
    }

    /// Determines the binding keys a component consumes with
    ///
    /// Configured routing states win over manually declared keys. When
    /// neither yields anything the component ends up unbound, which is only
    /// expected for components that opted into optional input.
    pub fn resolve_binding_keys(
        &self,
        component: &str,
        group: &str,
        accepted_event_types: &[String],
        manual_keys: &[String],
        optional: bool,
    ) -> Vec<String> {
        if let Some(states) = self.states_for(component, group) {
            return binding_keys_for(accepted_event_types, &states);
        }

        if !manual_keys.is_empty() {
            return manual_keys.to_vec();
        }

        if !optional {
            warn!(
                "No routing states configured for '{}' (group '{}'), its input queue stays unbound",
                component, group
            );
        }

        Vec::new()
    }
}

/// Expands event types and routing states into concrete binding keys
///
/// Keys are emitted in state-major order, one `{type}.{state}.*.*` key per
/// combination. An empty type list accepts every type.
pub fn binding_keys_for(accepted_event_types: &[String], states: &[String]) -> Vec<String> {
    let wildcard = ["*".to_string()];
    let types: &[String] = if accepted_event_types.is_empty() {
        &wildcard
    } else {
        accepted_event_types
    };

    let mut keys = Vec::with_capacity(types.len() * states.len());

    for state in states {
        for event_type in types {
            keys.push(format!("{}.{}.*.*", event_type, state));
        }
    }

    keys
}
