// History-driven counterbalancing. A participant's first session draws table indices at random;
// every later session steps each index by one (mod table length), so repeated sessions walk
// through the combinations instead of re-drawing them.
// See DESIGN.md: Sequence/Randomizer Resolver

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlayerError;
use crate::types::{JsonMap, SessionRecord};

/// Beyond this many items a table holds rotations instead of every permutation.
const MAX_FULL_PERMUTATION: usize = 6;

/// A fixed table of orderings for one counterbalancing dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub table: Vec<Vec<usize>>,
}

impl Dimension {
    /// Every ordering of `0..n` for small `n`, rotations for larger ones.
    pub fn for_items(name: &str, n: usize) -> Self {
        let table = if n <= MAX_FULL_PERMUTATION {
            permutations(n)
        } else {
            (0..n).map(|shift| (0..n).map(|i| (i + shift) % n).collect()).collect()
        };
        Dimension {
            name: name.to_string(),
            table,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Lexicographic permutations of `0..n`.
fn permutations(n: usize) -> Vec<Vec<usize>> {
    let mut current: Vec<usize> = (0..n).collect();
    let mut out = vec![current.clone()];
    loop {
        let Some(i) = (1..current.len()).rev().find(|&i| current[i - 1] < current[i]) else {
            return out;
        };
        let pivot = i - 1;
        let Some(j) = (i..current.len()).rev().find(|&j| current[j] > current[pivot]) else {
            return out;
        };
        current.swap(pivot, j);
        current[i..].reverse();
        out.push(current.clone());
    }
}

/// Indices chosen into each dimension's table. Persisted in `conditions` between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Condition {
    pub indices: BTreeMap<String, usize>,
}

impl Condition {
    fn seed(&self) -> u64 {
        self.indices
            .values()
            .fold(0xcbf2_9ce4_8422_2325u64, |acc, &i| {
                (acc ^ i as u64).wrapping_mul(0x0100_0000_01b3)
            })
    }
}

/// The most recent session in which the marker frame kind actually recorded data.
pub fn last_exposure<'a>(past_sessions: &'a [SessionRecord], marker_kind: &str) -> Option<&'a SessionRecord> {
    past_sessions.iter().find(|session| {
        session
            .exp_data
            .iter()
            .any(|(key, payload)| key.contains(marker_kind) && !payload.is_empty())
    })
}

/// Condition stored for this randomizer. Keys are `"<position>-<label>"`; the position
/// shifts when the sequence is renumbered, so only the label part has to match.
pub fn prior_condition(session: &SessionRecord, randomizer_label: &str) -> Option<Condition> {
    let (key, value) = session
        .conditions
        .iter()
        .find(|(key, _)| condition_key_matches(key, randomizer_label))?;
    match serde_json::from_value::<Condition>(value.clone()) {
        Ok(condition) => Some(condition),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "ignoring unreadable counterbalancing condition");
            None
        }
    }
}

fn condition_key_matches(key: &str, randomizer_label: &str) -> bool {
    match key.split_once('-') {
        Some((position, label)) => label == randomizer_label && position.parse::<usize>().is_ok(),
        None => false,
    }
}

/// Step every prior index by one with wraparound, or draw fresh ones.
pub fn next_condition<R: Rng>(
    dimensions: &[Dimension],
    prior: Option<&Condition>,
    rng: &mut R,
) -> Result<Condition, PlayerError> {
    let mut indices = BTreeMap::new();
    for dim in dimensions {
        if dim.is_empty() {
            return Err(PlayerError::InvalidSequence(format!(
                "counterbalancing table {} is empty",
                dim.name
            )));
        }
        let index = match prior.and_then(|c| c.indices.get(&dim.name)) {
            Some(&previous) => (previous % dim.len() + 1) % dim.len(),
            None => rng.gen_range(0..dim.len()),
        };
        indices.insert(dim.name.clone(), index);
    }
    Ok(Condition { indices })
}

/// Declarative parameters of a counterbalancing randomizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterbalanceParams {
    /// Frame kind whose recorded data marks a completed exposure.
    pub marker_kind: String,
    pub categories: Vec<String>,
    #[serde(default)]
    pub objects: Vec<Value>,
    #[serde(default)]
    pub cameras: Vec<Value>,
    #[serde(default = "default_trials_per_category")]
    pub trials_per_category: usize,
    /// Properties every generated trial frame starts from (must include `kind`).
    pub frame_template: JsonMap,
    /// Optional fixed tables; generated from item counts when absent.
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Vec<usize>>>,
}

fn default_trials_per_category() -> usize {
    1
}

pub const CATEGORY_ORDER: &str = "categoryOrder";
pub const OBJECT_ORDER: &str = "objectOrder";
pub const CAMERA_ORDER: &str = "cameraOrder";

impl CounterbalanceParams {
    pub fn dimensions(&self) -> Vec<Dimension> {
        [
            (CATEGORY_ORDER, self.categories.len()),
            (OBJECT_ORDER, self.objects.len()),
            (CAMERA_ORDER, self.cameras.len()),
        ]
        .into_iter()
        .filter(|&(_, n)| n > 0)
        .map(|(name, n)| match self.tables.get(name) {
            Some(table) => Dimension {
                name: name.to_string(),
                table: table.clone(),
            },
            None => Dimension::for_items(name, n),
        })
        .collect()
    }
}

/// Concrete trial frames plus the condition to persist for the next session.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub frames: Vec<JsonMap>,
    pub condition: Condition,
}

/// Resolve a counterbalancing randomizer against the participant's history.
pub fn expand<R: Rng>(
    randomizer_label: &str,
    params: &CounterbalanceParams,
    past_sessions: &[SessionRecord],
    rng: &mut R,
) -> Result<Expansion, PlayerError> {
    let dimensions = params.dimensions();
    let prior = last_exposure(past_sessions, &params.marker_kind)
        .and_then(|session| prior_condition(session, randomizer_label));
    let condition = next_condition(&dimensions, prior.as_ref(), rng)?;
    tracing::debug!(
        randomizer = randomizer_label,
        continued = prior.is_some(),
        ?condition,
        "counterbalancing condition chosen"
    );
    let frames = build_trials(params, &dimensions, &condition)?;
    Ok(Expansion { frames, condition })
}

fn ordering<'a>(
    dimensions: &'a [Dimension],
    condition: &Condition,
    name: &str,
) -> Result<Option<&'a [usize]>, PlayerError> {
    let Some(dim) = dimensions.iter().find(|d| d.name == name) else {
        return Ok(None);
    };
    let index = condition.indices.get(name).copied().unwrap_or(0);
    dim.table
        .get(index)
        .map(|row| Some(row.as_slice()))
        .ok_or_else(|| PlayerError::InvalidSequence(format!("{} index {} out of range", name, index)))
}

fn pick<'a>(items: &'a [Value], order: Option<&[usize]>, slot: usize) -> Result<Option<&'a Value>, PlayerError> {
    match order {
        Some(row) if !row.is_empty() => {
            let i = row[slot % row.len()];
            items
                .get(i)
                .map(Some)
                .ok_or_else(|| PlayerError::InvalidSequence(format!("table refers to missing item {}", i)))
        }
        _ => Ok(None),
    }
}

fn build_trials(
    params: &CounterbalanceParams,
    dimensions: &[Dimension],
    condition: &Condition,
) -> Result<Vec<JsonMap>, PlayerError> {
    let category_order = ordering(dimensions, condition, CATEGORY_ORDER)?.unwrap_or(&[]);
    let object_order = ordering(dimensions, condition, OBJECT_ORDER)?;
    let camera_order = ordering(dimensions, condition, CAMERA_ORDER)?;

    // Object/camera pairings for each trial slot, shuffled the same way for the same condition.
    let total = category_order.len() * params.trials_per_category;
    let mut slots: Vec<usize> = (0..total).collect();
    slots.shuffle(&mut StdRng::seed_from_u64(condition.seed()));

    let mut frames = Vec::with_capacity(total);
    for (position, &category_index) in category_order.iter().enumerate() {
        let category = params.categories.get(category_index).ok_or_else(|| {
            PlayerError::InvalidSequence(format!("table refers to missing category {}", category_index))
        })?;
        for rep in 0..params.trials_per_category {
            let trial = position * params.trials_per_category + rep;
            let slot = slots[trial];
            let mut frame = params.frame_template.clone();
            frame.insert("category".into(), Value::from(category.as_str()));
            if let Some(object) = pick(&params.objects, object_order, slot)? {
                frame.insert("object".into(), object.clone());
            }
            if let Some(camera) = pick(&params.cameras, camera_order, slot)? {
                frame.insert("camera".into(), camera.clone());
            }
            frame.insert("trialNumber".into(), Value::from(trial));
            frames.push(frame);
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn dims(lens: &[usize]) -> Vec<Dimension> {
        lens.iter()
            .enumerate()
            .map(|(i, &n)| Dimension {
                name: format!("d{}", i),
                table: (0..n).map(|k| vec![k]).collect(),
            })
            .collect()
    }

    fn params() -> CounterbalanceParams {
        serde_json::from_value(json!({
            "markerKind": "exp-physics-test",
            "categories": ["gravity", "support", "stay"],
            "objects": ["ball", "box"],
            "cameras": [1, 2, 3],
            "trialsPerCategory": 2,
            "frameTemplate": { "kind": "exp-physics-test" }
        }))
        .unwrap()
    }

    fn session_with(condition: &Condition, recorded: bool) -> SessionRecord {
        let mut session = SessionRecord::default();
        session
            .conditions
            .insert("2-physics".into(), serde_json::to_value(condition).unwrap());
        let payload = if recorded {
            serde_json::from_value(json!({ "eventTimings": [] })).unwrap()
        } else {
            JsonMap::new()
        };
        session.exp_data.insert("5-exp-physics-test-5".into(), payload);
        session
    }

    mod property_tests {
        use super::*;

        proptest! {
            #[test]
            fn chain_of_sessions_never_repeats_previous_combination(
                lens in prop::collection::vec(1usize..8, 1..4),
                sessions in 1usize..40,
                seed in any::<u64>(),
            ) {
                let dimensions = dims(&lens);
                let mut rng = StdRng::seed_from_u64(seed);
                let mut condition = next_condition(&dimensions, None, &mut rng).unwrap();
                for _ in 0..sessions {
                    let next = next_condition(&dimensions, Some(&condition), &mut rng).unwrap();
                    for dim in &dimensions {
                        prop_assert!(next.indices[&dim.name] < dim.len());
                    }
                    if lens.iter().any(|&n| n > 1) {
                        prop_assert_ne!(&next, &condition);
                    }
                    condition = next;
                }
            }
        }
    }

    #[test]
    fn increment_wraps_at_table_end() {
        let dimensions = dims(&[6]);
        let mut rng = StdRng::seed_from_u64(1);
        let mut condition = Condition {
            indices: BTreeMap::from([("d0".to_string(), 5)]),
        };
        condition = next_condition(&dimensions, Some(&condition), &mut rng).unwrap();
        assert_eq!(condition.indices["d0"], 0);

        for _ in 0..7 {
            condition = next_condition(&dimensions, Some(&condition), &mut rng).unwrap();
        }
        assert_eq!(condition.indices["d0"], 1);
    }

    #[test]
    fn permutation_tables() {
        assert_eq!(permutations(3).len(), 6);
        assert_eq!(permutations(3)[5], vec![2, 1, 0]);
        assert_eq!(permutations(0), vec![Vec::<usize>::new()]);
        let big = Dimension::for_items("x", 9);
        assert_eq!(big.len(), 9);
        assert_eq!(big.table[1][8], 0);
    }

    #[test]
    fn first_session_draws_then_later_sessions_step() {
        let p = params();
        let mut rng = StdRng::seed_from_u64(7);
        let first = expand("physics", &p, &[], &mut rng).unwrap();
        assert_eq!(first.frames.len(), 6);
        assert_eq!(first.frames[0]["kind"], "exp-physics-test");

        let history = vec![SessionRecord::default(), session_with(&first.condition, true)];
        let second = expand("physics", &p, &history, &mut rng).unwrap();
        for dim in p.dimensions() {
            let before = first.condition.indices[&dim.name];
            assert_eq!(second.condition.indices[&dim.name], (before + 1) % dim.len());
        }
    }

    #[test]
    fn sessions_without_marker_data_are_skipped() {
        let p = params();
        let older = Condition {
            indices: BTreeMap::from([
                (CATEGORY_ORDER.to_string(), 2),
                (OBJECT_ORDER.to_string(), 0),
                (CAMERA_ORDER.to_string(), 4),
            ]),
        };
        let abandoned = Condition {
            indices: BTreeMap::from([
                (CATEGORY_ORDER.to_string(), 0),
                (OBJECT_ORDER.to_string(), 1),
                (CAMERA_ORDER.to_string(), 0),
            ]),
        };
        let history = vec![session_with(&abandoned, false), session_with(&older, true)];
        let mut rng = StdRng::seed_from_u64(3);
        let expansion = expand("physics", &p, &history, &mut rng).unwrap();
        assert_eq!(expansion.condition.indices[CATEGORY_ORDER], 3);
        assert_eq!(expansion.condition.indices[OBJECT_ORDER], 1);
        assert_eq!(expansion.condition.indices[CAMERA_ORDER], 5);
    }

    #[test]
    fn same_condition_gives_same_trials() {
        let p = params();
        let condition = Condition {
            indices: BTreeMap::from([
                (CATEGORY_ORDER.to_string(), 4),
                (OBJECT_ORDER.to_string(), 1),
                (CAMERA_ORDER.to_string(), 2),
            ]),
        };
        let dimensions = p.dimensions();
        let a = build_trials(&p, &dimensions, &condition).unwrap();
        let b = build_trials(&p, &dimensions, &condition).unwrap();
        assert_eq!(a, b);
        // permutations(3)[4] == [2, 0, 1]
        let categories: Vec<&str> = a.iter().map(|f| f["category"].as_str().unwrap()).collect();
        assert_eq!(categories, vec!["stay", "stay", "gravity", "gravity", "support", "support"]);
        assert!(a.iter().all(|f| f.contains_key("object") && f.contains_key("camera")));
    }

    #[test]
    fn unreadable_condition_starts_fresh() {
        let mut session = SessionRecord::default();
        session.conditions.insert("1-physics".into(), json!("garbage"));
        assert_eq!(prior_condition(&session, "physics"), None);
    }

    #[test]
    fn condition_lookup_ignores_labels_that_merely_contain_the_name() {
        let mut session = SessionRecord::default();
        let condition = |category: usize| {
            serde_json::to_value(Condition {
                indices: BTreeMap::from([(CATEGORY_ORDER.to_string(), category)]),
            })
            .unwrap()
        };
        session.conditions.insert("0-metaphysics".into(), condition(5));
        session.conditions.insert("0-meta-physics".into(), condition(4));
        session.conditions.insert("3-physics".into(), condition(1));

        let found = prior_condition(&session, "physics").expect("stored condition");
        assert_eq!(found.indices[CATEGORY_ORDER], 1);
        assert_eq!(prior_condition(&session, "meta-physics").unwrap().indices[CATEGORY_ORDER], 4);
        assert_eq!(prior_condition(&session, "phys"), None);
    }

    #[test]
    fn empty_table_is_an_error() {
        let dimensions = vec![Dimension {
            name: "empty".into(),
            table: Vec::new(),
        }];
        let mut rng = StdRng::seed_from_u64(0);
        assert!(next_condition(&dimensions, None, &mut rng).is_err());
    }
}
