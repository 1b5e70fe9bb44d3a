//! Profile model, persistence, and validation.

pub mod persistence;
pub mod types;
pub mod validation;

pub use persistence::{
    delete_profile, list_profiles, load_from_dir, profile_path, rename_profile, save_to_dir,
};
pub use types::{CurvePoint, MixFunction, Profile, Rule, Source, SourceSettings, PROFILE_SCHEMA_VERSION};
pub use validation::{validate_against_inventory, validate_structure, ValidationReport};
