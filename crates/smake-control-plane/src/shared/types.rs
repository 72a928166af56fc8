pub use smake_core::{
    Instance, InstanceFilter, InstanceSpec, InstanceState, PoolRequirement, SecurityGroupChoice,
    SecurityOptions,
};
pub use smake_providers::{ProviderInstance, ProviderInstanceState, Tag};
