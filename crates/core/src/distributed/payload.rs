//! Structured payloads: scalars, dense arrays and nested collections.
//!
//! A [`Payload`] describes parameters, optimizer state or gradients. Leaves
//! are visited depth-first; map entries in sorted key order and list items in
//! index order, which makes the traversal identical on every rank that holds
//! a structurally identical payload.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use super::error::Result;

/// Numeric scalar leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F64(f64),
    I64(i64),
}

/// Recursively structured numeric value.
#[derive(Debug, Clone)]
pub enum Payload {
    Scalar(Scalar),
    /// Dense array. Collectives replace the tensor with the result.
    Tensor(Tensor),
    /// Trainable parameter. Collectives write through [`Var::set`], so every
    /// clone of the `Var` observes the new value.
    Var(Var),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    /// Named collection from `(name, value)` pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Payload>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Ordered collection.
    pub fn list<V, I>(items: I) -> Self
    where
        V: Into<Payload>,
        I: IntoIterator<Item = V>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// All parameters of a [`VarMap`], keyed by name.
    pub fn from_var_map(var_map: &VarMap) -> Self {
        let data = var_map.data().lock().unwrap_or_else(|e| e.into_inner());
        Self::map(data.iter().map(|(name, var)| (name.clone(), var.clone())))
    }

    /// Parameters in the given order.
    pub fn from_vars(vars: &[Var]) -> Self {
        Self::list(vars.iter().cloned())
    }

    /// An empty collection, used as a placeholder for a missing value.
    pub fn empty() -> Self {
        Self::List(Vec::new())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Scalar(_) | Self::Tensor(_) | Self::Var(_))
    }

    /// Number of scalar/array leaves.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Scalar(_) | Self::Tensor(_) | Self::Var(_) => 1,
            Self::List(items) => items.iter().map(Payload::leaf_count).sum(),
            Self::Map(entries) => entries.values().map(Payload::leaf_count).sum(),
        }
    }

    /// Current value of a leaf as a tensor; `None` for collections.
    ///
    /// Scalars become rank-0 host tensors.
    pub fn leaf_tensor(&self) -> Result<Option<Tensor>> {
        let device = candle_core::Device::Cpu;
        Ok(match self {
            Self::Scalar(Scalar::F64(v)) => Some(Tensor::new(*v, &device)?),
            Self::Scalar(Scalar::I64(v)) => Some(Tensor::new(*v, &device)?),
            Self::Tensor(t) => Some(t.clone()),
            Self::Var(v) => Some(v.as_tensor().clone()),
            Self::List(_) | Self::Map(_) => None,
        })
    }

    /// Overwrite a leaf with `value`, keeping the leaf's kind.
    ///
    /// Collections are left untouched. A `Var` handed back its own storage
    /// (the root of a broadcast) already holds the value and is not written.
    pub fn set_leaf(&mut self, value: Tensor) -> Result<()> {
        match self {
            Self::Scalar(Scalar::F64(v)) => *v = value.to_scalar::<f64>()?,
            Self::Scalar(Scalar::I64(v)) => *v = value.to_scalar::<i64>()?,
            Self::Tensor(t) => *t = value,
            Self::Var(v) if same_storage(v.as_tensor(), &value) => {}
            Self::Var(v) => v.set(&value)?,
            Self::List(_) | Self::Map(_) => {}
        }
        Ok(())
    }

    /// Visit every leaf depth-first with its dotted path.
    pub fn for_each_leaf<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &Payload) -> Result<()>,
    {
        fn walk<F>(node: &Payload, path: &mut String, f: &mut F) -> Result<()>
        where
            F: FnMut(&str, &Payload) -> Result<()>,
        {
            match node {
                Payload::List(items) => {
                    for (i, item) in items.iter().enumerate() {
                        let len = push_segment(path, &i.to_string());
                        walk(item, path, f)?;
                        path.truncate(len);
                    }
                    Ok(())
                }
                Payload::Map(entries) => {
                    for (key, item) in entries {
                        let len = push_segment(path, key);
                        walk(item, path, f)?;
                        path.truncate(len);
                    }
                    Ok(())
                }
                leaf => f(path.as_str(), leaf),
            }
        }
        walk(self, &mut String::new(), &mut f)
    }

    /// Mutable counterpart of [`Payload::for_each_leaf`], same order.
    pub fn for_each_leaf_mut<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &mut Payload) -> Result<()>,
    {
        fn walk<F>(node: &mut Payload, path: &mut String, f: &mut F) -> Result<()>
        where
            F: FnMut(&str, &mut Payload) -> Result<()>,
        {
            match node {
                Payload::List(items) => {
                    for (i, item) in items.iter_mut().enumerate() {
                        let len = push_segment(path, &i.to_string());
                        walk(item, path, f)?;
                        path.truncate(len);
                    }
                    Ok(())
                }
                Payload::Map(entries) => {
                    for (key, item) in entries.iter_mut() {
                        let len = push_segment(path, key);
                        walk(item, path, f)?;
                        path.truncate(len);
                    }
                    Ok(())
                }
                leaf => f(path.as_str(), leaf),
            }
        }
        walk(self, &mut String::new(), &mut f)
    }

    /// Look up a node by dotted path (`"layers.0.weight"`).
    pub fn get(&self, path: &str) -> Option<&Payload> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |node, segment| match node {
            Payload::Map(entries) => entries.get(segment),
            Payload::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Hash of the payload's structure: keys, list lengths, leaf kinds,
    /// dtypes and shapes. Values do not contribute.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash_structure(&mut hasher);
        hasher.finish()
    }

    fn hash_structure<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Scalar(Scalar::F64(_)) => 0u8.hash(state),
            Self::Scalar(Scalar::I64(_)) => 1u8.hash(state),
            Self::Tensor(t) => {
                2u8.hash(state);
                t.dtype().as_str().hash(state);
                t.dims().hash(state);
            }
            Self::Var(v) => {
                2u8.hash(state);
                v.dtype().as_str().hash(state);
                v.dims().hash(state);
            }
            Self::List(items) => {
                3u8.hash(state);
                items.len().hash(state);
                for item in items {
                    item.hash_structure(state);
                }
            }
            Self::Map(entries) => {
                4u8.hash(state);
                entries.len().hash(state);
                for (key, item) in entries {
                    key.hash(state);
                    item.hash_structure(state);
                }
            }
        }
    }
}

fn push_segment(path: &mut String, segment: &str) -> usize {
    let len = path.len();
    if !path.is_empty() {
        path.push('.');
    }
    path.push_str(segment);
    len
}

impl From<Tensor> for Payload {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<Var> for Payload {
    fn from(v: Var) -> Self {
        Self::Var(v)
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Self::Scalar(Scalar::F64(v))
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Self::Scalar(Scalar::I64(v))
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(items: Vec<Payload>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Payload>> for Payload {
    fn from(entries: BTreeMap<String, Payload>) -> Self {
        Self::Map(entries)
    }
}

/// Whether two tensors share one storage allocation.
///
/// Public-API equivalent of candle's `pub(crate) Tensor::same_storage`.
fn same_storage(lhs: &Tensor, rhs: &Tensor) -> bool {
    let lhs_ptr: *const candle_core::Storage = &*lhs.storage_and_layout().0;
    let rhs_ptr: *const candle_core::Storage = &*rhs.storage_and_layout().0;
    std::ptr::eq(lhs_ptr, rhs_ptr)
}
