pub mod certificate;
pub mod common;
pub mod inheritance;
pub mod instance;
pub mod pdb;
pub mod pvc;
pub mod quantity;
pub mod service;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
pub use inheritance::{InheritancePolicy, InheritanceRules, InheritedMetadata};
