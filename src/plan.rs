//! Plan computation.
//!
//! Given the prior state (if the resource exists) and the proposed new state
//! Terraform derived from configuration, [`plan`] decides what the state will
//! look like after apply and which attribute changes force replacement.
//!
//! Rules, per attribute:
//!
//! - A computed-only attribute is always filled in by the provider, whatever
//!   the proposed state holds: Terraform copies prior values into it, and
//!   configuration may mark it unknown. It is unknown on create and keeps its
//!   prior value on update.
//! - An optional+computed attribute that configuration leaves null is treated
//!   the same way.
//! - Every other attribute takes the proposed value as-is.
//! - A replacement-forcing attribute whose planned value differs from the prior
//!   value is reported in `requires_replace`. When anything requires
//!   replacement, computed attributes not set by configuration become unknown,
//!   since the replacement will compute them again.

use std::collections::BTreeSet;

use crate::error::PlanError;
use crate::schema::ResourceSchema;
use crate::types::PlanResult;
use crate::validation::missing_required;
use crate::value::{AttributeValue, ResourceState};

/// Plan a create (`prior` is `None`) or an update.
pub fn plan(
    schema: &ResourceSchema,
    prior: Option<&ResourceState>,
    proposed: &ResourceState,
) -> Result<PlanResult, PlanError> {
    let diagnostics = missing_required(schema, proposed, false);
    if !diagnostics.is_empty() {
        return Err(PlanError::Validation(diagnostics));
    }

    let mut planned = ResourceState::new();
    let mut filled_by_provider = Vec::new();

    for attr in schema.attributes() {
        let proposed_value = proposed.get_or_null(&attr.name);
        let filled = attr.attribute.flags.is_computed_only() || (attr.is_computed() && proposed_value.is_null());
        let value = if filled {
            filled_by_provider.push(attr.name.as_str());
            match prior {
                Some(prior) => prior.get_or_null(&attr.name).clone(),
                None => AttributeValue::Unknown,
            }
        } else {
            proposed_value.clone()
        };
        planned.set(attr.name.clone(), value);
    }

    let mut requires_replace = BTreeSet::new();
    if let Some(prior) = prior {
        for attr in schema.attributes().iter().filter(|a| a.forces_replacement()) {
            if prior.get_or_null(&attr.name) != planned.get_or_null(&attr.name) {
                requires_replace.insert(attr.name.clone());
            }
        }
    }

    if !requires_replace.is_empty() {
        if !schema.replaceable {
            return Err(PlanError::ReplacementConflict {
                attributes: requires_replace.into_iter().collect(),
            });
        }
        for name in filled_by_provider {
            planned.set(name, AttributeValue::Unknown);
        }
    }

    Ok(PlanResult {
        planned_state: planned,
        requires_replace,
    })
}

/// Names of attributes whose value differs between two states.
pub fn changed_attributes(schema: &ResourceSchema, prior: &ResourceState, planned: &ResourceState) -> Vec<String> {
    schema
        .attributes()
        .iter()
        .filter(|attr| prior.get_or_null(&attr.name) != planned.get_or_null(&attr.name))
        .map(|attr| attr.name.clone())
        .collect()
}
