//! Driver descriptor normalisation.
//!
//! The brain delivers driver descriptors as nested categories →
//! capabilities → commands → codes. Devices want flat lookups by stable
//! reference id, so `normalize` flattens each category into a catalog of
//! state records and command records: one command record per code, dynamic
//! parameters pointing at the states the code references, static parameters
//! carrying the declared type and constraints.

use crate::types::{normalize_value, Command, CommandParam, State, StateKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ── Descriptor as delivered ──────────────────────────────────────────

/// A driver descriptor as fetched from `device-drivers/{id}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverDescriptor {
    #[serde(default)]
    pub categories: Vec<DriverCategory>,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverCategory {
    #[serde(default)]
    pub name: String,
    pub reference_id: String,
    #[serde(default)]
    pub capabilities: Vec<DriverCapability>,
    #[serde(default)]
    pub states: Vec<DriverState>,
    #[serde(default)]
    pub macros: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverCapability {
    #[serde(default)]
    pub name: String,
    pub reference_id: String,
    #[serde(default)]
    pub commands: Vec<DriverCommand>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverCommand {
    pub name: String,
    #[serde(default)]
    pub codes: Vec<DriverCode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverCode {
    pub reference_id: String,
    #[serde(default)]
    pub state_references: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<DriverParameter>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub constraints: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverState {
    pub reference_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: StateKind,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub is_custom_state: bool,
    #[serde(default)]
    pub custom_data: Option<Value>,
}

// ── Normalised output ────────────────────────────────────────────────

/// Flat catalog for one driver category.
#[derive(Debug, Clone, Default)]
pub struct CategoryCatalog {
    pub name: String,
    pub ref_id: String,
    /// States keyed by reference id; duplicate ids overwrite, last wins
    pub states: BTreeMap<String, State>,
    /// One record per code, in descriptor order
    pub commands: Vec<Command>,
}

/// Flat view of a whole driver, categories in descriptor order.
#[derive(Debug, Clone, Default)]
pub struct NormalizedDriver {
    pub categories: Vec<CategoryCatalog>,
}

impl NormalizedDriver {
    /// Look up a category catalog by reference id.
    pub fn category(&self, ref_id: &str) -> Option<&CategoryCatalog> {
        // Last write wins on duplicate reference ids
        self.categories.iter().rev().find(|c| c.ref_id == ref_id)
    }
}

/// Flatten a descriptor into per-category catalogs.
pub fn normalize(descriptor: &DriverDescriptor) -> NormalizedDriver {
    let mut categories = Vec::with_capacity(descriptor.categories.len());

    for category in &descriptor.categories {
        let mut states = BTreeMap::new();
        for ds in &category.states {
            states.insert(ds.reference_id.clone(), state_record(ds, &category.reference_id));
        }

        let mut commands = Vec::new();
        for capability in &category.capabilities {
            for command in &capability.commands {
                for code in &command.codes {
                    commands.push(command_record(
                        command,
                        code,
                        &category.reference_id,
                        &capability.reference_id,
                        &states,
                    ));
                }
            }
        }

        categories.push(CategoryCatalog {
            name: category.name.clone(),
            ref_id: category.reference_id.clone(),
            states,
            commands,
        });
    }

    NormalizedDriver { categories }
}

fn state_record(ds: &DriverState, category_ref: &str) -> State {
    State {
        id: ds.reference_id.clone(),
        name: ds.name.clone(),
        kind: ds.kind,
        value: ds.value.clone(),
        normalized_value: normalize_value(ds.kind, &ds.value),
        category: category_ref.to_string(),
        is_custom_state: ds.is_custom_state,
        custom_data: ds.custom_data.clone(),
    }
}

fn command_record(
    command: &DriverCommand,
    code: &DriverCode,
    category_ref: &str,
    capability_ref: &str,
    category_states: &BTreeMap<String, State>,
) -> Command {
    let mut params = BTreeMap::new();
    let mut states = BTreeMap::new();

    for state_ref in &code.state_references {
        match category_states.get(state_ref) {
            Some(state) => {
                params.insert(
                    state.name.clone(),
                    CommandParam {
                        state: Some(state.id.clone()),
                        kind: None,
                        constraints: None,
                    },
                );
                states.insert(state.id.clone(), state.clone());
            }
            None => {
                tracing::warn!(
                    command = %command.name,
                    state_ref = %state_ref,
                    "code references a state missing from its category"
                );
            }
        }
    }

    for param in &code.parameters {
        params.insert(
            param.name.clone(),
            CommandParam {
                state: None,
                kind: param.kind.clone(),
                constraints: param.constraints.clone(),
            },
        );
    }

    Command {
        id: code.reference_id.clone(),
        name: command.name.clone(),
        category: category_ref.to_string(),
        capability: capability_ref.to_string(),
        params,
        states,
    }
}
