//! # Capability Models
//!
//! Lifecycle of the heavyweight, language-pair-specific models the
//! translation stage depends on:
//!
//! - **registry**: single-flight loading, reference counting, eviction
//! - **phrasebook**: the built-in translation model format and its provisioner

pub mod phrasebook;
pub mod registry;

pub use phrasebook::{Phrasebook, PhrasebookProvisioner, PhrasebookTranslator};
pub use registry::{
    Capability, LoadedModel, ModelEntry, ModelHandle, ModelKey, ModelProvisioner, ModelRegistry,
    ModelStatus, ProvisionError, RegistryConfig, RegistryError, RegistrySummary,
};
