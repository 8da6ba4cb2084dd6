//! Data model shared between the AdIT console bridge engine and its hosts.

pub mod cache;
pub mod definitions;
pub mod instance;
pub mod options;
pub mod status;
pub mod utils;

pub use cache::{CacheRecord, CACHE_VERSION};
pub use definitions::{
    fingerprint, ChannelDescriptor, DefinitionSet, InstanceDescriptor, RuleDescriptor,
    VariableDescriptor,
};
pub use instance::{ConnState, InstanceRecord, InstanceStatus};
pub use options::Options;
pub use status::{BridgeStatus, Issue, StatusLevel};
