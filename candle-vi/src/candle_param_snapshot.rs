use candle_core::Tensor;
use candle_nn::VarMap;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

///
/// A deep copy of every variable in a `VarMap`. Tensors are copied
/// into fresh storage at capture time, so later optimizer steps on
/// the live variables never show up here, and restoring copies the
/// values back without sharing storage either.
///
#[derive(Debug, Clone)]
pub struct ParameterSnapshot {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterSnapshot {
    pub fn capture(variable_map: &VarMap) -> anyhow::Result<Self> {
        let data = variable_map
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("failed to lock the variable map: {}", e))?;

        let mut tensors = BTreeMap::new();
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), var.as_tensor().copy()?.detach());
        }
        Ok(Self { tensors })
    }

    /// Write the captured values back into the live variables.
    /// Every variable in the map must have a captured value.
    pub fn restore(&self, variable_map: &VarMap) -> anyhow::Result<()> {
        let data = variable_map
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("failed to lock the variable map: {}", e))?;

        for (name, var) in data.iter() {
            let value = self
                .tensors
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("snapshot has no value for `{}`", name))?;
            var.set(value)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Save in `safetensors` format
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .tensors
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }
}
