//! Convenience types and protocol constants.

use std::collections::BTreeSet;

use crate::schema::Diagnostic;
use crate::value::ResourceState;

/// The result of planning a create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanResult {
    /// The state Terraform should expect after apply.
    pub planned_state: ResourceState,
    /// Attributes whose change forces the resource to be replaced.
    pub requires_replace: BTreeSet<String>,
}

impl PlanResult {
    /// A plan that updates in place.
    pub fn in_place(planned_state: ResourceState) -> Self {
        Self {
            planned_state,
            requires_replace: BTreeSet::new(),
        }
    }

    /// Whether applying this plan destroys and recreates the resource.
    pub fn requires_replacement(&self) -> bool {
        !self.requires_replace.is_empty()
    }
}

/// The outcome of applying a change.
///
/// Failures after the resource changed still carry the resulting state, so
/// `new_state` is meaningful even when `diagnostics` holds errors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyResult {
    /// The resource after apply, or `None` if it no longer exists.
    pub new_state: Option<ResourceState>,
    /// Diagnostics produced during apply.
    pub diagnostics: Vec<Diagnostic>,
}

impl ApplyResult {
    /// A successful apply.
    pub fn success(new_state: Option<ResourceState>) -> Self {
        Self {
            new_state,
            diagnostics: Vec::new(),
        }
    }

    /// Whether any diagnostic is an error.
    pub fn has_errors(&self) -> bool {
        crate::schema::has_errors(&self.diagnostics)
    }
}

/// Server capability flags advertised with the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerCapabilities {
    /// Whether the provider wants PlanResourceChange calls for destroys.
    pub plan_destroy: bool,
}

/// go-plugin core protocol version.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Terraform plugin protocol version implemented by this SDK.
pub const PROTOCOL_VERSION: u32 = 5;

/// Network type advertised in the handshake.
pub const NETWORK_TYPE: &str = "tcp";

/// Wire protocol advertised in the handshake.
pub const HANDSHAKE_PROTOCOL: &str = "grpc";

/// Environment variable Terraform sets to prove it launched the plugin.
pub const MAGIC_COOKIE_KEY: &str = "TF_PLUGIN_MAGIC_COOKIE";

/// Expected value of [`MAGIC_COOKIE_KEY`].
pub const MAGIC_COOKIE_VALUE: &str =
    "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";
