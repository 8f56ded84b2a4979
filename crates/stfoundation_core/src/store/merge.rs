//! Store-trump merge policy.
//!
//! When a context saves a record that another writer changed since this
//! context read it, each property changed in the store keeps the store
//! value; every other property takes the in-memory value.

use crate::model::entity::Attributes;
use std::collections::BTreeSet;

/// Merges `local` edits made against `base` with the current `stored` state.
pub fn merge_store_trump(base: &Attributes, local: &Attributes, stored: &Attributes) -> Attributes {
    let keys: BTreeSet<&String> = base.keys().chain(local.keys()).chain(stored.keys()).collect();
    let mut merged = Attributes::new();

    for key in keys {
        let stored_value = stored.get(key);
        let winner = if stored_value != base.get(key) {
            stored_value
        } else {
            local.get(key)
        };
        if let Some(value) = winner {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
