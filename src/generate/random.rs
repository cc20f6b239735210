//! Type-driven random generation.
//!
//! Every draw is bounded (integer ranges, string and array length caps) so
//! generation always terminates. Custom per-field generators override the
//! type-driven default. Uniqueness and validity constraints are enforced by
//! regenerate-on-collision with a bounded retry budget; exhausting the
//! budget is `UnsatisfiableConstraint`, never an infinite loop.

use serde_json::Value;

use crate::error::HarnessResult;
use crate::registry::{Action, FieldKind, FieldSpec};
use crate::rng::DetRng;
use crate::state::LocalState;

use super::{GenConfig, retry_exhausted};

/// Generate one local state for the action, honoring custom generators,
/// uniqueness flags, and the validity predicate.
pub fn generate(
    action: &Action,
    config: &GenConfig,
    rng: &mut DetRng,
) -> HarnessResult<LocalState> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(state) = generate_once(action, config, rng)? {
            if config.validity.as_ref().is_none_or(|pred| pred(&state)) {
                return Ok(state);
            }
        }
        if attempts >= config.max_retries.max(1) {
            return Err(retry_exhausted(action, attempts));
        }
    }
}

/// One generation attempt. `None` means an in-field constraint (unique
/// array) could not be satisfied this round.
fn generate_once(
    action: &Action,
    config: &GenConfig,
    rng: &mut DetRng,
) -> HarnessResult<Option<LocalState>> {
    let mut state = LocalState::empty();
    for field in &action.input_schema {
        let Some(value) = field_value(field, config, rng) else {
            return Ok(None);
        };
        state.insert_scoped(&action.touched_state_keys, field.name.clone(), value)?;
    }
    Ok(Some(state))
}

fn field_value(field: &FieldSpec, config: &GenConfig, rng: &mut DetRng) -> Option<Value> {
    if let Some(custom) = &field.generator {
        return Some(custom(rng));
    }
    kind_value(&field.kind, config, rng)
}

fn kind_value(kind: &FieldKind, config: &GenConfig, rng: &mut DetRng) -> Option<Value> {
    match kind {
        FieldKind::Bool => Some(Value::Bool(rng.next_bool())),
        FieldKind::Int { min, max } => Some(Value::from(rng.next_in_range(*min, *max))),
        FieldKind::Text { max_len } => Some(Value::from(text_value(*max_len, rng))),
        FieldKind::OneOf(values) => {
            if values.is_empty() {
                return None;
            }
            let index = rng.next_below(values.len() as u64) as usize;
            Some(values[index].clone())
        }
        FieldKind::Array {
            elem,
            max_len,
            unique,
        } => array_value(elem, *max_len, *unique, config, rng),
    }
}

fn text_value(max_len: usize, rng: &mut DetRng) -> String {
    let len = rng.next_below(max_len.saturating_add(1) as u64) as usize;
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        let offset = rng.next_below(26) as u8;
        out.push(char::from(b'a' + offset));
    }
    out
}

fn array_value(
    elem: &FieldKind,
    max_len: usize,
    unique: bool,
    config: &GenConfig,
    rng: &mut DetRng,
) -> Option<Value> {
    let len = rng.next_below(max_len.saturating_add(1) as u64) as usize;
    let mut items: Vec<Value> = Vec::with_capacity(len);
    for _ in 0..len {
        if unique {
            let mut found = false;
            for _ in 0..config.max_retries.max(1) {
                let candidate = kind_value(elem, config, rng)?;
                if !items.contains(&candidate) {
                    items.push(candidate);
                    found = true;
                    break;
                }
            }
            if !found {
                // Element domain too small for the requested length;
                // reject the whole state and let the outer retry loop run.
                return None;
            }
        } else {
            items.push(kind_value(elem, config, rng)?);
        }
    }
    Some(Value::Array(items))
}
