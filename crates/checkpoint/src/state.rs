//! In-memory state dict values
//!
//! A state dict is an ordered string-keyed tree. Leaves are scalars, dense
//! tensors, or shard descriptors: lazy descriptions of one rank's slice of a
//! globally shaped value, filled in when a sharded checkpoint is read.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String-keyed state tree
pub type StateDict = BTreeMap<String, StateValue>;

/// Dense row-major f32 tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// One rank's slice of a globally shaped value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Globally unique name of the full value
    pub key: String,

    /// Shape of the shard grid (tensors: the full tensor shape)
    pub global_shape: Vec<usize>,

    /// Position of this slice in the grid
    pub global_offset: Vec<usize>,

    /// Zero for the replica that writes the slice; identical slices held by
    /// other ranks carry a non-zero id and are never written
    pub replica_id: usize,

    /// Slice content; `None` in a load template until the slice is read
    pub data: Option<Box<StateValue>>,
}

impl ShardDescriptor {
    /// Tensor slice at `global_offset` of a tensor with `global_shape`
    pub fn tensor(
        key: impl Into<String>,
        global_shape: Vec<usize>,
        global_offset: Vec<usize>,
        replica_id: usize,
        data: Tensor,
    ) -> Self {
        Self {
            key: key.into(),
            global_shape,
            global_offset,
            replica_id,
            data: Some(Box::new(StateValue::Tensor(data))),
        }
    }

    /// Arbitrary value occupying one cell of a `global_shape` grid
    pub fn object(
        key: impl Into<String>,
        global_shape: Vec<usize>,
        global_offset: Vec<usize>,
        replica_id: usize,
        data: StateValue,
    ) -> Self {
        Self {
            key: key.into(),
            global_shape,
            global_offset,
            replica_id,
            data: Some(Box::new(data)),
        }
    }

    /// Same descriptor without its content, as a load template
    pub fn template(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }

    pub fn is_main_replica(&self) -> bool {
        self.replica_id == 0
    }

    /// Storage path of the slice relative to the checkpoint directory.
    ///
    /// Distinct offsets of one key never share a path, which keeps concurrent
    /// writers apart.
    pub fn storage_name(&self) -> String {
        let offset = self
            .global_offset
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join("_");
        format!("{}/shard_{}.bin", self.key, offset)
    }
}

/// A node of a state dict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Tensor(Tensor),
    List(Vec<StateValue>),
    Map(StateDict),
    Sharded(ShardDescriptor),
}

impl StateValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer or float as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            StateValue::Float(v) => Some(*v),
            StateValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StateValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StateValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            StateValue::Tensor(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&StateDict> {
        match self {
            StateValue::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_sharded(&self) -> Option<&ShardDescriptor> {
        match self {
            StateValue::Sharded(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<StateDict> {
        match self {
            StateValue::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<StateValue>> {
        match self {
            StateValue::List(v) => Some(v),
            _ => None,
        }
    }

    /// True if this value or anything below it is a shard descriptor
    pub fn contains_shards(&self) -> bool {
        match self {
            StateValue::Sharded(_) => true,
            StateValue::Map(map) => map.values().any(StateValue::contains_shards),
            _ => false,
        }
    }
}

impl From<Tensor> for StateValue {
    fn from(t: Tensor) -> Self {
        StateValue::Tensor(t)
    }
}

impl From<StateDict> for StateValue {
    fn from(m: StateDict) -> Self {
        StateValue::Map(m)
    }
}

impl From<ShardDescriptor> for StateValue {
    fn from(s: ShardDescriptor) -> Self {
        StateValue::Sharded(s)
    }
}

/// Location of a shard descriptor inside a state dict
pub type StatePath = Vec<String>;

/// Split a state dict into its non-sharded part and its shard descriptors.
///
/// Maps that only held shards remain as empty maps so the tree shape survives.
/// Shard descriptors are only recognised inside maps, not inside lists.
pub fn split_shards(dict: &StateDict) -> (StateDict, Vec<(StatePath, ShardDescriptor)>) {
    let mut shards = Vec::new();
    let common = split_map(dict, &mut Vec::new(), &mut shards);
    (common, shards)
}

fn split_map(
    dict: &StateDict,
    prefix: &mut StatePath,
    shards: &mut Vec<(StatePath, ShardDescriptor)>,
) -> StateDict {
    let mut common = StateDict::new();
    for (key, value) in dict {
        prefix.push(key.clone());
        match value {
            StateValue::Sharded(shard) => shards.push((prefix.clone(), shard.clone())),
            StateValue::Map(inner) => {
                let inner = split_map(inner, prefix, shards);
                common.insert(key.clone(), StateValue::Map(inner));
            }
            other => {
                common.insert(key.clone(), other.clone());
            }
        }
        prefix.pop();
    }
    common
}

/// Insert `value` at `path`, creating intermediate maps.
///
/// Returns false if a non-map value is in the way.
pub fn insert_at(dict: &mut StateDict, path: &[String], value: StateValue) -> bool {
    match path {
        [] => false,
        [last] => {
            dict.insert(last.clone(), value);
            true
        }
        [head, rest @ ..] => {
            let entry = dict
                .entry(head.clone())
                .or_insert_with(|| StateValue::Map(StateDict::new()));
            match entry {
                StateValue::Map(inner) => insert_at(inner, rest, value),
                _ => false,
            }
        }
    }
}
