//! In-memory weight snapshots of a [`VarMap`].

use candle::{Result, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Deep copy of every variable held by a [`VarMap`], keyed by variable name.
#[derive(Clone, Debug)]
pub struct WeightSnapshot {
    tensors: HashMap<String, Tensor>,
}

impl WeightSnapshot {
    /// Copy the current value of each variable. The copies do not track later updates.
    pub fn capture(varmap: &VarMap) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle::Error::Msg("varmap lock poisoned".to_string()))?;
        let mut tensors = HashMap::with_capacity(data.len());
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(Self { tensors })
    }

    /// Write the snapshot back into the live variables of `varmap`.
    ///
    /// Every snapshotted name must still exist with the same shape.
    pub fn restore(&self, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle::Error::Msg("varmap lock poisoned".to_string()))?;
        for (name, tensor) in self.tensors.iter() {
            match data.get(name) {
                Some(var) => var.set(tensor)?,
                None => candle::bail!("cannot restore weights: variable {name} is missing"),
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

pub(crate) fn lock(varmap: &Arc<Mutex<VarMap>>) -> Result<MutexGuard<'_, VarMap>> {
    varmap
        .lock()
        .map_err(|_| candle::Error::Msg("varmap lock poisoned".to_string()))
}

/// Serialize the current variables of `varmap` to `path` (safetensors).
pub fn save_weights(varmap: &Arc<Mutex<VarMap>>, path: impl AsRef<Path>) -> Result<()> {
    lock(varmap)?.save(path)
}
