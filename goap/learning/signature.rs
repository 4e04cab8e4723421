use goap_world::{Goal, StateValue, WorldState};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Width of each signature segment.
pub const SEGMENT: usize = 16;
/// Total signature width: state, goal and action segments.
pub const DIMENSIONS: usize = SEGMENT * 3;
/// Width compared when matching a request against stored plans.
pub const CONTEXT_DIMENSIONS: usize = SEGMENT * 2;

const SQUASH_SCALE: f64 = 100.0;

/// Fixed-width feature vector describing a plan.
///
/// Layout: `[0, 16)` hashed projection of the initial state, `[16, 32)`
/// hashed encoding of the goal conditions, `[32, 48)` hashed histogram of
/// the action sequence. Numeric goal targets weigh `1 + squash(target)` so a
/// zero target still registers. Each feature lands in a bucket chosen by SHA-256 of
/// its name with a hash-derived sign, so the encoding is stable across runs
/// and processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct PlanSignature {
    values: [f64; DIMENSIONS],
}

impl PlanSignature {
    /// Signature of a stored plan.
    #[must_use]
    pub fn of_plan<S: AsRef<str>>(initial: &WorldState, goal: &Goal, action_ids: &[S]) -> Self {
        let mut values = [0.0; DIMENSIONS];
        encode_state(&mut values[..SEGMENT], initial);
        encode_goal(&mut values[SEGMENT..CONTEXT_DIMENSIONS], goal);
        encode_actions(&mut values[CONTEXT_DIMENSIONS..], action_ids);
        Self { values }
    }

    /// Signature of a planning request; the action segment is zero.
    #[must_use]
    pub fn of_request(initial: &WorldState, goal: &Goal) -> Self {
        Self::of_plan::<&str>(initial, goal, &[])
    }

    /// Raw values.
    #[must_use]
    pub const fn values(&self) -> &[f64; DIMENSIONS] {
        &self.values
    }

    /// State and goal segments.
    #[must_use]
    pub fn context(&self) -> &[f64] {
        &self.values[..CONTEXT_DIMENSIONS]
    }

    /// Cosine similarity over the full vector.
    #[must_use]
    pub fn similarity(&self, other: &Self) -> f64 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Cosine similarity over the state and goal segments only, used to
    /// match a request (which has no actions yet) against stored plans.
    #[must_use]
    pub fn context_similarity(&self, other: &Self) -> f64 {
        cosine_similarity(self.context(), other.context())
    }
}

impl TryFrom<Vec<f64>> for PlanSignature {
    type Error = String;

    fn try_from(raw: Vec<f64>) -> Result<Self, Self::Error> {
        let values: [f64; DIMENSIONS] = raw
            .try_into()
            .map_err(|raw: Vec<f64>| format!("expected {DIMENSIONS} values, got {}", raw.len()))?;
        if values.iter().any(|value| !value.is_finite()) {
            return Err("signature holds a non-finite value".into());
        }
        Ok(Self { values })
    }
}

impl From<PlanSignature> for Vec<f64> {
    fn from(signature: PlanSignature) -> Self {
        signature.values.to_vec()
    }
}

/// Cosine similarity of two equal-length vectors; `0.0` when either is zero.
#[must_use]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0, 0.0, 0.0), |(dot, na, nb), (x, y)| {
            (x.mul_add(*y, dot), x.mul_add(*x, na), y.mul_add(*y, nb))
        });
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

fn squash(value: f64) -> f64 {
    value / (value.abs() + SQUASH_SCALE)
}

fn bucket(namespace: &str, feature: &str) -> (usize, f64) {
    let digest = Sha256::new()
        .chain_update(namespace.as_bytes())
        .chain_update([0_u8])
        .chain_update(feature.as_bytes())
        .finalize();
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    let index = u64::from_be_bytes(head) % SEGMENT as u64;
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    #[allow(clippy::cast_possible_truncation)]
    let index = index as usize;
    (index, sign)
}

fn add(segment: &mut [f64], namespace: &str, feature: &str, weight: f64) {
    let (index, sign) = bucket(namespace, feature);
    segment[index] += sign * weight;
}

fn value_weight(value: &StateValue) -> (Option<String>, f64) {
    match value {
        StateValue::Number(number) => (None, squash(*number)),
        StateValue::Bool(flag) => (None, if *flag { 1.0 } else { -1.0 }),
        StateValue::Text(text) => (Some(text.clone()), 1.0),
        StateValue::List(items) => {
            #[allow(clippy::cast_precision_loss)]
            let len = items.len() as f64;
            (None, squash(len))
        }
    }
}

fn encode_state(segment: &mut [f64], state: &WorldState) {
    for (key, value) in state.iter() {
        match value_weight(value) {
            (Some(text), weight) => add(segment, "state", &format!("{key}={text}"), weight),
            (None, weight) => add(segment, "state", key, weight),
        }
    }
}

fn encode_goal(segment: &mut [f64], goal: &Goal) {
    for condition in goal.conditions() {
        let feature = format!("{}:{}", condition.key, condition.op);
        match condition.value.as_ref() {
            Some(StateValue::Number(target)) => add(segment, "goal", &feature, 1.0 + squash(*target)),
            Some(value) => match value_weight(value) {
                (Some(text), weight) => add(segment, "goal", &format!("{feature}={text}"), weight),
                (None, weight) => add(segment, "goal", &feature, weight),
            },
            None => add(segment, "goal", &feature, 1.0),
        }
    }
}

fn encode_actions<S: AsRef<str>>(segment: &mut [f64], action_ids: &[S]) {
    if action_ids.is_empty() {
        return;
    }
    #[allow(clippy::cast_precision_loss)]
    let share = 1.0 / action_ids.len() as f64;
    for id in action_ids {
        add(segment, "action", id.as_ref(), share);
    }
}
