use std::collections::HashMap;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use loadbench_core::{Dataset, Label, Shape, Tensor};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Deterministic in-memory image dataset.
///
/// Pixel values are a fixed function of the index; labels cycle through
/// `classes`. Samples must be loaded before they can be read, as with a
/// query sample library.
pub struct SyntheticDataset {
    count: usize,
    sample_shape: Shape,
    classes: usize,
    resident: RwLock<HashMap<usize, Tensor>>,
    last_loaded: Mutex<Option<Instant>>,
}

impl SyntheticDataset {
    pub fn new(count: usize, sample_shape: Shape, classes: usize) -> Self {
        Self {
            count,
            sample_shape,
            classes: classes.max(1),
            resident: RwLock::new(HashMap::new()),
            last_loaded: Mutex::new(None),
        }
    }

    pub fn label(&self, index: usize) -> Label {
        (index % self.classes) as Label
    }

    #[cfg(test)]
    fn resident_count(&self) -> usize {
        self.resident.read().len()
    }

    fn render(&self, index: usize) -> Tensor {
        let numel = self.sample_shape.numel();
        let data: Vec<f32> = (0..numel)
            .map(|j| ((index * 31 + j) % 255) as f32 / 255.0)
            .collect();
        Tensor::from_f32(self.sample_shape.clone(), &data)
    }
}

impl Dataset for SyntheticDataset {
    fn get_samples(&self, indices: &[usize]) -> Result<(Tensor, Option<Vec<Label>>)> {
        let resident = self.resident.read();
        let samples = indices
            .iter()
            .map(|i| {
                resident
                    .get(i)
                    .cloned()
                    .with_context(|| format!("sample {i} is not loaded"))
            })
            .collect::<Result<Vec<_>>>()?;
        let labels = indices.iter().map(|i| self.label(*i)).collect();
        Ok((Tensor::stack(&samples)?, Some(labels)))
    }

    fn item_count(&self) -> usize {
        self.count
    }

    fn item_loc(&self, index: usize) -> String {
        format!("synthetic/{index:06}.bin")
    }

    fn load_query_samples(&self, indices: &[usize]) -> Result<()> {
        for &i in indices {
            ensure!(i < self.count, "sample {i} out of range {}", self.count);
        }
        let mut resident = self.resident.write();
        for &i in indices {
            if !resident.contains_key(&i) {
                let t = self.render(i);
                resident.insert(i, t);
            }
        }
        debug!(loaded = indices.len(), resident = resident.len(), "query samples loaded");
        *self.last_loaded.lock() = Some(Instant::now());
        Ok(())
    }

    fn unload_query_samples(&self, indices: Option<&[usize]>) -> Result<()> {
        let mut resident = self.resident.write();
        match indices {
            Some(indices) => {
                for i in indices {
                    resident.remove(i);
                }
            }
            None => resident.clear(),
        }
        Ok(())
    }

    fn last_loaded(&self) -> Option<Instant> {
        *self.last_loaded.lock()
    }
}
