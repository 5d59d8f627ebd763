// Study structure to concrete frame list: randomizer expansion, then id assignment.
// Randomizers write the condition they chose into the session; nothing else here writes to it.
// See DESIGN.md: Sequence/Randomizer Resolver

use std::collections::BTreeMap;

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::counterbalance::{self, CounterbalanceParams};
use crate::error::PlayerError;
use crate::types::{JsonMap, SessionRecord};

/// Randomizers nested deeper than this are treated as a cycle.
const MAX_DEPTH: usize = 16;

/// Researcher-authored study: named frame definitions and the order to show them in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyStructure {
    pub frames: BTreeMap<String, JsonMap>,
    pub sequence: Vec<String>,
}

/// One concrete frame after expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInstanceConfig {
    pub id: String,
    pub kind: String,
    pub index: usize,
    pub config: JsonMap,
}

/// Expand every randomizer and assign ids `"<label>-<index>"`.
pub fn resolve_sequence<R: Rng>(
    structure: &StudyStructure,
    session: &mut SessionRecord,
    rng: &mut R,
) -> Result<Vec<FrameInstanceConfig>, PlayerError> {
    let mut expanded = Vec::new();
    for (position, name) in structure.sequence.iter().enumerate() {
        let entry = structure.frames.get(name).ok_or_else(|| {
            PlayerError::InvalidSequence(format!("sequence refers to unknown frame {}", name))
        })?;
        let mut expander = Expander {
            structure,
            session: &mut *session,
            rng: &mut *rng,
            position,
        };
        expander.expand(name, entry.clone(), 0, &mut expanded)?;
    }

    expanded
        .into_iter()
        .enumerate()
        .map(|(index, (label, mut config))| {
            let kind = frame_kind(&config)?.to_string();
            let id = format!("{}-{}", label, index);
            config.insert("id".into(), Value::from(id.as_str()));
            Ok(FrameInstanceConfig {
                id,
                kind,
                index,
                config,
            })
        })
        .collect()
}

fn frame_kind(config: &JsonMap) -> Result<&str, PlayerError> {
    config
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| PlayerError::InvalidSequence("frame is missing a kind".to_string()))
}

struct Expander<'a, R: Rng> {
    structure: &'a StudyStructure,
    session: &'a mut SessionRecord,
    rng: &'a mut R,
    position: usize,
}

impl<'a, R: Rng> Expander<'a, R> {
    fn expand(
        &mut self,
        label: &str,
        entry: JsonMap,
        depth: usize,
        out: &mut Vec<(String, JsonMap)>,
    ) -> Result<(), PlayerError> {
        if depth > MAX_DEPTH {
            return Err(PlayerError::InvalidSequence(format!(
                "randomizers nested too deeply at {}",
                label
            )));
        }
        let kind = frame_kind(&entry)?;
        if kind == "group" {
            for item in self.frame_list(label, &entry)? {
                self.expand_item(item, depth, out)?;
            }
            return Ok(());
        }
        if kind != "choice" {
            out.push((label.to_string(), entry));
            return Ok(());
        }

        let sampler = entry.get("sampler").and_then(Value::as_str).unwrap_or("");
        match sampler {
            "permute" => {
                let mut items = self.frame_list(label, &entry)?;
                items.shuffle(&mut *self.rng);
                for item in items {
                    self.expand_item(item, depth, out)?;
                }
                Ok(())
            }
            "select" => {
                let items = self.frame_list(label, &entry)?;
                for which in which_frames(label, &entry)? {
                    let item = items.get(which).cloned().ok_or_else(|| {
                        PlayerError::InvalidSequence(format!("{}: whichFrames index {} out of range", label, which))
                    })?;
                    self.expand_item(item, depth, out)?;
                }
                Ok(())
            }
            "random-parameter-set" => self.expand_parameter_set(label, &entry, depth, out),
            "counterbalance" => {
                let params: CounterbalanceParams = serde_json::from_value(Value::Object(entry.clone()))
                    .map_err(|e| PlayerError::InvalidSequence(format!("{}: {}", label, e)))?;
                let expansion =
                    counterbalance::expand(label, &params, &self.session.past_sessions, &mut *self.rng)?;
                self.write_condition(label, serde_json::to_value(&expansion.condition)?);
                for frame in expansion.frames {
                    self.expand_item(frame, depth, out)?;
                }
                Ok(())
            }
            other => Err(PlayerError::InvalidSequence(format!(
                "{}: unknown sampler {:?}",
                label, other
            ))),
        }
    }

    fn expand_item(&mut self, item: JsonMap, depth: usize, out: &mut Vec<(String, JsonMap)>) -> Result<(), PlayerError> {
        let label = match item.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => frame_kind(&item)?.to_string(),
        };
        self.expand(&label, item, depth + 1, out)
    }

    /// `frameList` items merged over `commonFrameProperties`. String items name frames.
    fn frame_list(&self, label: &str, entry: &JsonMap) -> Result<Vec<JsonMap>, PlayerError> {
        let list = entry
            .get("frameList")
            .and_then(Value::as_array)
            .ok_or_else(|| PlayerError::InvalidSequence(format!("{}: frameList must be an array", label)))?;
        let common = match entry.get("commonFrameProperties") {
            Some(Value::Object(map)) => map.clone(),
            _ => JsonMap::new(),
        };

        list.iter()
            .map(|item| {
                let item = match item {
                    Value::Object(map) => map.clone(),
                    Value::String(name) => {
                        let mut named = self.structure.frames.get(name).cloned().ok_or_else(|| {
                            PlayerError::InvalidSequence(format!("{}: unknown frame {}", label, name))
                        })?;
                        named.entry("id").or_insert_with(|| Value::from(name.as_str()));
                        named
                    }
                    _ => {
                        return Err(PlayerError::InvalidSequence(format!(
                            "{}: frameList entries must be objects or frame names",
                            label
                        )))
                    }
                };
                let mut merged = common.clone();
                merged.extend(item);
                Ok(merged)
            })
            .collect()
    }

    fn expand_parameter_set(
        &mut self,
        label: &str,
        entry: &JsonMap,
        depth: usize,
        out: &mut Vec<(String, JsonMap)>,
    ) -> Result<(), PlayerError> {
        let sets = entry
            .get("parameterSets")
            .and_then(Value::as_array)
            .filter(|sets| !sets.is_empty())
            .ok_or_else(|| PlayerError::InvalidSequence(format!("{}: parameterSets must be a non-empty array", label)))?;

        let chosen = match entry.get("parameterSetWeights").and_then(Value::as_array) {
            Some(weights) => {
                let weights: Vec<f64> = weights.iter().map(|w| w.as_f64().unwrap_or(0.0)).collect();
                if weights.len() != sets.len() {
                    return Err(PlayerError::InvalidSequence(format!(
                        "{}: {} weights for {} parameter sets",
                        label,
                        weights.len(),
                        sets.len()
                    )));
                }
                WeightedIndex::new(&weights)
                    .map_err(|e| PlayerError::InvalidSequence(format!("{}: {}", label, e)))?
                    .sample(&mut *self.rng)
            }
            None => self.rng.gen_range(0..sets.len()),
        };
        let parameters = match &sets[chosen] {
            Value::Object(map) => map.clone(),
            _ => {
                return Err(PlayerError::InvalidSequence(format!(
                    "{}: parameter set {} is not an object",
                    label, chosen
                )))
            }
        };

        let mut condition = JsonMap::new();
        condition.insert("set".into(), Value::from(chosen));
        condition.insert("parameterSet".into(), Value::Object(parameters.clone()));
        self.write_condition(label, Value::Object(condition));

        for item in self.frame_list(label, entry)? {
            let substituted = match substitute(&Value::Object(item), &parameters) {
                Value::Object(map) => map,
                _ => JsonMap::new(),
            };
            self.expand_item(substituted, depth, out)?;
        }
        Ok(())
    }

    fn write_condition(&mut self, label: &str, condition: Value) {
        let key = format!("{}-{}", self.position, label);
        tracing::debug!(key = %key, "randomizer condition recorded");
        self.session.conditions.insert(key, condition);
    }
}

fn which_frames(label: &str, entry: &JsonMap) -> Result<Vec<usize>, PlayerError> {
    let invalid = || PlayerError::InvalidSequence(format!("{}: whichFrames must be an index or list of indices", label));
    match entry.get("whichFrames") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| frame_index(v).ok_or_else(invalid))
            .collect(),
        Some(v) => frame_index(v).map(|n| vec![n]).ok_or_else(invalid),
        None => Err(invalid()),
    }
}

fn frame_index(value: &Value) -> Option<usize> {
    value.as_u64().and_then(|n| usize::try_from(n).ok())
}

/// Replace string values that name a parameter with the parameter's value, recursively.
pub fn substitute(value: &Value, parameters: &JsonMap) -> Value {
    match value {
        Value::String(s) => parameters.get(s).cloned().unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, parameters)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, parameters)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn structure(value: Value) -> StudyStructure {
        serde_json::from_value(value).unwrap()
    }

    fn ids(frames: &[FrameInstanceConfig]) -> Vec<&str> {
        frames.iter().map(|f| f.id.as_str()).collect()
    }

    #[test]
    fn plain_frames_get_label_index_ids() {
        let s = structure(json!({
            "frames": {
                "intro": { "kind": "exp-lookit-text" },
                "consent": { "kind": "exp-video-consent" }
            },
            "sequence": ["intro", "consent"]
        }));
        let mut session = SessionRecord::default();
        let frames = resolve_sequence(&s, &mut session, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(ids(&frames), vec!["intro-0", "consent-1"]);
        assert_eq!(frames[1].kind, "exp-video-consent");
        assert_eq!(frames[1].config["id"], "consent-1");
        assert!(session.conditions.is_empty());
    }

    #[test]
    fn unknown_frame_is_an_error() {
        let s = structure(json!({ "frames": {}, "sequence": ["missing"] }));
        let err = resolve_sequence(&s, &mut SessionRecord::default(), &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(matches!(err, PlayerError::InvalidSequence(_)));
    }

    #[test]
    fn permute_keeps_every_frame_with_common_properties() {
        let s = structure(json!({
            "frames": {
                "trials": {
                    "kind": "choice",
                    "sampler": "permute",
                    "commonFrameProperties": { "kind": "exp-lookit-video", "testCount": 2 },
                    "frameList": [ { "id": "a" }, { "id": "b" }, { "id": "c" } ]
                }
            },
            "sequence": ["trials"]
        }));
        let frames = resolve_sequence(&s, &mut SessionRecord::default(), &mut StdRng::seed_from_u64(9)).unwrap();
        let mut labels: Vec<String> = frames.iter().map(|f| f.id[..1].to_string()).collect();
        labels.sort();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert!(frames.iter().all(|f| f.config["testCount"] == 2));
        assert_eq!(frames.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn select_picks_requested_frames() {
        let s = structure(json!({
            "frames": {
                "pick": {
                    "kind": "choice",
                    "sampler": "select",
                    "whichFrames": [2, 0],
                    "frameList": [
                        { "kind": "exp-lookit-text", "id": "zero" },
                        { "kind": "exp-lookit-text", "id": "one" },
                        { "kind": "exp-lookit-text", "id": "two" }
                    ]
                }
            },
            "sequence": ["pick"]
        }));
        let frames = resolve_sequence(&s, &mut SessionRecord::default(), &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(ids(&frames), vec!["two-0", "zero-1"]);
    }

    #[test]
    fn select_rejects_indices_past_the_frame_list() {
        // 2^32 would wrap to 0 if narrowed to a 32-bit index.
        let s = structure(json!({
            "frames": {
                "pick": {
                    "kind": "choice",
                    "sampler": "select",
                    "whichFrames": 4294967296u64,
                    "frameList": [ { "kind": "exp-lookit-text", "id": "zero" } ]
                }
            },
            "sequence": ["pick"]
        }));
        let err = resolve_sequence(&s, &mut SessionRecord::default(), &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(matches!(err, PlayerError::InvalidSequence(_)));
    }

    #[test]
    fn parameter_set_substitutes_and_records_condition() {
        let s = structure(json!({
            "frames": {
                "intro": { "kind": "exp-lookit-text" },
                "stimuli": {
                    "kind": "choice",
                    "sampler": "random-parameter-set",
                    "parameterSets": [
                        { "VIDEO": "left.mp4", "SIDE": "left" },
                        { "VIDEO": "right.mp4", "SIDE": "right" }
                    ],
                    "parameterSetWeights": [0, 1],
                    "frameList": [
                        { "kind": "exp-lookit-video", "video": { "source": "VIDEO", "tags": ["SIDE", "fixed"] } }
                    ]
                }
            },
            "sequence": ["intro", "stimuli"]
        }));
        let mut session = SessionRecord::default();
        let frames = resolve_sequence(&s, &mut session, &mut StdRng::seed_from_u64(4)).unwrap();

        assert_eq!(frames[1].config["video"], json!({ "source": "right.mp4", "tags": ["right", "fixed"] }));
        assert_eq!(session.conditions["1-stimuli"]["set"], 1);
    }

    #[test]
    fn mismatched_weights_are_rejected() {
        let s = structure(json!({
            "frames": {
                "stimuli": {
                    "kind": "choice",
                    "sampler": "random-parameter-set",
                    "parameterSets": [ {}, {} ],
                    "parameterSetWeights": [1],
                    "frameList": []
                }
            },
            "sequence": ["stimuli"]
        }));
        assert!(resolve_sequence(&s, &mut SessionRecord::default(), &mut StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn nested_groups_flatten_in_order() {
        let s = structure(json!({
            "frames": {
                "block": {
                    "kind": "group",
                    "frameList": [
                        "warmup",
                        { "kind": "group", "id": "inner", "frameList": [ { "kind": "exp-lookit-text", "id": "x" } ] }
                    ]
                },
                "warmup": { "kind": "exp-lookit-text" }
            },
            "sequence": ["block"]
        }));
        let frames = resolve_sequence(&s, &mut SessionRecord::default(), &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(ids(&frames), vec!["warmup-0", "x-1"]);
    }

    #[test]
    fn counterbalance_sampler_persists_condition_for_next_session() {
        let s = structure(json!({
            "frames": {
                "physics": {
                    "kind": "choice",
                    "sampler": "counterbalance",
                    "markerKind": "exp-physics-test",
                    "categories": ["gravity", "support"],
                    "objects": ["ball"],
                    "frameTemplate": { "kind": "exp-physics-test" }
                }
            },
            "sequence": ["physics"]
        }));

        let mut first = SessionRecord::default();
        let frames = resolve_sequence(&s, &mut first, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(ids(&frames), vec!["exp-physics-test-0", "exp-physics-test-1"]);
        let first_category = first.conditions["0-physics"]["indices"]["categoryOrder"].as_u64().unwrap();

        // The first session recorded trial data, so the next one steps the index.
        first.exp_data.insert(
            "0-exp-physics-test-0".into(),
            serde_json::from_value(json!({ "eventTimings": [] })).unwrap(),
        );
        let mut second = SessionRecord {
            past_sessions: vec![SessionRecord::default(), first.clone()],
            ..SessionRecord::default()
        };
        resolve_sequence(&s, &mut second, &mut StdRng::seed_from_u64(99)).unwrap();
        let second_category = second.conditions["0-physics"]["indices"]["categoryOrder"].as_u64().unwrap();
        assert_eq!(second_category, (first_category + 1) % 2);
    }

    #[test]
    fn substitute_leaves_unmatched_values() {
        let mut params = JsonMap::new();
        params.insert("X".into(), json!(5));
        assert_eq!(substitute(&json!(["X", "Y", 1, null]), &params), json!([5, "Y", 1, null]));
    }
}
