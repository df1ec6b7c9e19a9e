use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The sandbox-wide network environment handed to the guest when the sandbox starts.
#[derive(Debug, Default, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SandboxConfig {
    /// The guest hostname.
    #[serde(default)]
    #[builder(default, setter(into))]
    hostname: String,

    /// Name servers written to the guest resolver configuration.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    dns: Vec<String>,

    /// Resolver search domains.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    dns_search: Vec<String>,

    /// Resolver options.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    dns_options: Vec<String>,

    /// Networks allowed to use port mappings.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    port_whitelist: Option<PortWhitelist>,
}

/// Networks from which mapped ports may be reached.
#[derive(Debug, Default, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PortWhitelist {
    /// Networks inside the sandbox network.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    internal_networks: Vec<String>,

    /// Networks outside the sandbox network.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    #[builder(default)]
    external_networks: Vec<String>,
}
