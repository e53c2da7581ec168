//! Folding a descriptor's layers into one resolved layer.
//!
//! Required layers are ordered before optional ones (stable otherwise), then
//! folded left to right:
//!
//! - **text**: the first required content wins and any later required content
//!   must be byte-identical; optional content is only used while no required
//!   content has been chosen.
//! - **trees**: a key-wise union. Keys absent from the accumulator are
//!   inserted, nested trees recurse, and for scalars a required value beats
//!   an optional one while two required values must agree. Arrays cannot be
//!   merged.
//!
//! Keys are visited in lexicographic order, so the key named by a conflict
//! does not depend on how the input was written.
use serde_json::map::Entry;
use serde_json::{Map, Value};

use super::prototype::{KeyOption, KeyOptions, Layer, LayerContent};
use crate::error::MergeError;

/// Merge `layers` into a single layer.
///
/// An empty slice yields a content-less layer. Error indices refer to the
/// original insertion order.
///
/// # Errors
///
/// Returns a [`MergeError`] when required layers or keys disagree, when an
/// array would have to be merged, or when text and trees are mixed.
pub fn merge_layers(layers: &[Layer]) -> Result<Layer, MergeError> {
    let mut ordered: Vec<(usize, &Layer)> = layers
        .iter()
        .enumerate()
        .filter(|(_, l)| l.content.is_some())
        .collect();
    ordered.sort_by_key(|(_, l)| l.is_optional);

    let Some((_, first)) = ordered.first() else {
        return Ok(Layer {
            content: None,
            key_options: None,
            is_optional: true,
        });
    };

    match first.content {
        Some(LayerContent::Tree(_)) => merge_trees(&ordered),
        _ => merge_text(&ordered),
    }
}

fn merge_text(ordered: &[(usize, &Layer)]) -> Result<Layer, MergeError> {
    let mut chosen: Option<&[u8]> = None;
    let mut chosen_required = false;

    for &(index, layer) in ordered {
        let bytes = match &layer.content {
            Some(LayerContent::Text(bytes)) => bytes.as_slice(),
            Some(LayerContent::Tree(_)) => return Err(MergeError::MixedContent),
            None => continue,
        };
        if layer.is_optional {
            if !chosen_required {
                chosen = Some(bytes);
            }
        } else if chosen_required {
            if chosen != Some(bytes) {
                return Err(MergeError::LayerConflict { layer: index });
            }
        } else {
            chosen = Some(bytes);
            chosen_required = true;
        }
    }

    Ok(Layer {
        content: chosen.map(|b| LayerContent::Text(b.to_vec())),
        key_options: None,
        is_optional: !chosen_required,
    })
}

fn merge_trees(ordered: &[(usize, &Layer)]) -> Result<Layer, MergeError> {
    let mut acc = Map::new();
    let mut acc_options = KeyOptions::new();

    for &(index, layer) in ordered {
        let map = match &layer.content {
            Some(LayerContent::Tree(Value::Object(map))) => map,
            Some(LayerContent::Tree(_)) => return Err(MergeError::NonTreeRoot { layer: index }),
            Some(LayerContent::Text(_)) => return Err(MergeError::MixedContent),
            None => continue,
        };
        let incoming_options =
            resolve_options(map, layer.key_options.as_ref(), layer.is_optional);
        merge_maps(&mut acc, &mut acc_options, map.clone(), &incoming_options, "")?;
    }

    let is_optional = acc_options.all_optional();
    Ok(Layer {
        content: Some(LayerContent::Tree(Value::Object(acc))),
        key_options: Some(acc_options),
        is_optional,
    })
}

/// Expand a layer's sparse key options into one entry per key of `map`.
fn resolve_options(map: &Map<String, Value>, spec: Option<&KeyOptions>, default: bool) -> KeyOptions {
    map.iter()
        .map(|(key, value)| {
            let declared = spec.and_then(|s| s.get(key));
            let option = match value {
                Value::Object(child) => {
                    let (child_spec, child_default) = match declared {
                        Some(KeyOption::Nested(nested)) => (Some(nested), default),
                        Some(KeyOption::Flag(flag)) => (None, *flag),
                        None => (None, default),
                    };
                    KeyOption::Nested(resolve_options(child, child_spec, child_default))
                }
                _ => KeyOption::Flag(match declared {
                    Some(KeyOption::Flag(flag)) => *flag,
                    Some(KeyOption::Nested(_)) | None => default,
                }),
            };
            (key.clone(), option)
        })
        .collect()
}

fn dotted(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn merge_maps(
    acc: &mut Map<String, Value>,
    acc_options: &mut KeyOptions,
    incoming: Map<String, Value>,
    incoming_options: &KeyOptions,
    prefix: &str,
) -> Result<(), MergeError> {
    for (key, value) in incoming {
        let path = dotted(prefix, &key);
        let incoming_option = incoming_options
            .get(&key)
            .cloned()
            .unwrap_or(KeyOption::Flag(false));

        match acc.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(value);
                acc_options.insert(key, incoming_option);
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), value) {
                (Value::Object(existing), Value::Object(child)) => {
                    let mut nested = acc_options.take_nested(&key);
                    let child_options = match &incoming_option {
                        KeyOption::Nested(n) => n.clone(),
                        KeyOption::Flag(_) => KeyOptions::new(),
                    };
                    merge_maps(existing, &mut nested, child, &child_options, &path)?;
                    acc_options.insert(key, KeyOption::Nested(nested));
                }
                (Value::Array(_), _) | (_, Value::Array(_)) => {
                    return Err(MergeError::UnsupportedArray { key: path });
                }
                (existing, value) => {
                    let existing_optional = acc_options.get(&key).is_none_or(KeyOption::is_optional);
                    if existing_optional {
                        *existing = value;
                        acc_options.insert(key, incoming_option);
                    } else if !incoming_option.is_optional() && *existing != value {
                        return Err(MergeError::KeyConflict { key: path });
                    }
                }
            },
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_of(layer: &Layer) -> &[u8] {
        match &layer.content {
            Some(LayerContent::Text(b)) => b,
            other => panic!("expected text content, got {other:?}"),
        }
    }

    fn tree_of(layer: &Layer) -> &Value {
        match &layer.content {
            Some(LayerContent::Tree(v)) => v,
            other => panic!("expected tree content, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Text
    // -----------------------------------------------------------------------

    #[test]
    fn single_required_layer_is_idempotent() {
        let layers = vec![Layer::text("hello")];
        let first = merge_layers(&layers).unwrap();
        let second = merge_layers(&layers).unwrap();
        assert_eq!(first, second);
        assert_eq!(text_of(&first), b"hello");
    }

    #[test]
    fn required_beats_optional_in_either_order() {
        let a_then_b = vec![Layer::text("A").optional(), Layer::text("B")];
        let b_then_a = vec![Layer::text("B"), Layer::text("A").optional()];
        assert_eq!(text_of(&merge_layers(&a_then_b).unwrap()), b"B");
        assert_eq!(text_of(&merge_layers(&b_then_a).unwrap()), b"B");
    }

    #[test]
    fn differing_required_text_conflicts_naming_layer() {
        let layers = vec![Layer::text("A").optional(), Layer::text("B"), Layer::text("C")];
        let err = merge_layers(&layers).unwrap_err();
        assert_eq!(err, MergeError::LayerConflict { layer: 2 });
    }

    #[test]
    fn identical_required_text_does_not_conflict() {
        let layers = vec![Layer::text("same"), Layer::text("same")];
        assert_eq!(text_of(&merge_layers(&layers).unwrap()), b"same");
    }

    #[test]
    fn only_optional_layers_yield_optional_result() {
        let merged = merge_layers(&[Layer::text("A").optional()]).unwrap();
        assert!(merged.is_optional);
        assert_eq!(text_of(&merged), b"A");
    }

    #[test]
    fn empty_input_has_no_content() {
        assert!(merge_layers(&[]).unwrap().content.is_none());
    }

    #[test]
    fn text_and_tree_cannot_mix() {
        let layers = vec![Layer::text("x"), Layer::tree(json!({"a": 1}))];
        assert_eq!(merge_layers(&layers).unwrap_err(), MergeError::MixedContent);
    }

    // -----------------------------------------------------------------------
    // Trees
    // -----------------------------------------------------------------------

    #[test]
    fn optional_then_required_scalar_takes_required() {
        let layers = vec![
            Layer::tree(json!({"a": 1})).optional(),
            Layer::tree(json!({"a": 2})),
        ];
        let merged = merge_layers(&layers).unwrap();
        assert_eq!(tree_of(&merged), &json!({"a": 2}));
        let opts = merged.key_options.unwrap();
        assert_eq!(opts.get("a"), Some(&KeyOption::Flag(false)));
        assert!(!merged.is_optional);
    }

    #[test]
    fn required_then_optional_scalar_keeps_required() {
        let layers = vec![
            Layer::tree(json!({"a": 1})),
            Layer::tree(json!({"a": 2})).optional(),
        ];
        assert_eq!(tree_of(&merge_layers(&layers).unwrap()), &json!({"a": 1}));
    }

    #[test]
    fn two_required_differing_scalars_conflict() {
        let layers = vec![Layer::tree(json!({"a": 1})), Layer::tree(json!({"a": 2}))];
        assert_eq!(
            merge_layers(&layers).unwrap_err(),
            MergeError::KeyConflict { key: "a".into() }
        );
    }

    #[test]
    fn two_required_equal_scalars_merge() {
        let layers = vec![Layer::tree(json!({"a": 1})), Layer::tree(json!({"a": 1, "b": 2}))];
        assert_eq!(tree_of(&merge_layers(&layers).unwrap()), &json!({"a": 1, "b": 2}));
    }

    #[test]
    fn nested_trees_union_and_name_dotted_key() {
        let layers = vec![
            Layer::tree(json!({"server": {"host": "a", "port": 1}})),
            Layer::tree(json!({"server": {"tls": true}})),
        ];
        assert_eq!(
            tree_of(&merge_layers(&layers).unwrap()),
            &json!({"server": {"host": "a", "port": 1, "tls": true}})
        );

        let conflicting = vec![
            Layer::tree(json!({"server": {"port": 1}})),
            Layer::tree(json!({"server": {"port": 2}})),
        ];
        assert_eq!(
            merge_layers(&conflicting).unwrap_err(),
            MergeError::KeyConflict {
                key: "server.port".into()
            }
        );
    }

    #[test]
    fn arrays_are_rejected() {
        let layers = vec![
            Layer::tree(json!({"list": [1]})).optional(),
            Layer::tree(json!({"list": [2]})),
        ];
        assert_eq!(
            merge_layers(&layers).unwrap_err(),
            MergeError::UnsupportedArray { key: "list".into() }
        );
    }

    #[test]
    fn per_key_options_override_layer_flag() {
        let layers = vec![
            Layer::tree(json!({"a": 1, "b": 1}))
                .with_key_options(KeyOptions::new().with("a", KeyOption::Flag(true))),
            Layer::tree(json!({"a": 2})),
        ];
        assert_eq!(tree_of(&merge_layers(&layers).unwrap()), &json!({"a": 2, "b": 1}));
    }

    #[test]
    fn nested_flag_applies_to_subtree() {
        let layers = vec![
            Layer::tree(json!({"s": {"x": 1, "y": 1}}))
                .with_key_options(KeyOptions::new().with("s", KeyOption::Flag(true))),
            Layer::tree(json!({"s": {"x": 2}})),
        ];
        assert_eq!(tree_of(&merge_layers(&layers).unwrap()), &json!({"s": {"x": 2, "y": 1}}));
    }

    #[test]
    fn conflict_reports_lexicographically_first_key() {
        let layers = vec![
            Layer::tree(json!({"zeta": 1, "alpha": 1})),
            Layer::tree(json!({"zeta": 2, "alpha": 2})),
        ];
        assert_eq!(
            merge_layers(&layers).unwrap_err(),
            MergeError::KeyConflict {
                key: "alpha".into()
            }
        );
    }

    #[test]
    fn scalar_root_is_rejected() {
        let layers = vec![Layer::tree(json!(5))];
        assert_eq!(
            merge_layers(&layers).unwrap_err(),
            MergeError::NonTreeRoot { layer: 0 }
        );
    }
}
