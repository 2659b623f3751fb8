//! Serialized models.
//!
//! [`ModelArtifacts`] is the usual topology / weight-spec / weight-buffer
//! triple: the buffer holds every kernel (row-major) followed by its bias,
//! layer by layer, as little-endian `f32`.  [`ModelBundle`] wraps that with
//! the class list and, optionally, the dataset so a loaded model can be
//! retrained.

use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use hand_pose::{ClassId, Dataset};

use crate::network::{Activation, Dense, Network};
use crate::{ClassMapping, ModelError, TrainedModel};

// ════════════════════════════════════════════════════════════════════════════
// Topology / WeightSpec / ModelArtifacts
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub units:      usize,
    pub activation: Activation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub input_dim: usize,
    pub layers:    Vec<LayerSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightSpec {
    pub name:  String,
    pub shape: Vec<usize>,
}

impl WeightSpec {
    fn len(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelArtifacts {
    pub model_topology: Topology,
    pub weight_specs:   Vec<WeightSpec>,
    pub weight_data:    Vec<u8>,
}

impl ModelArtifacts {
    pub fn from_network(net: &Network) -> Self {
        let mut specs = Vec::with_capacity(net.layers.len() * 2);
        let mut data = Vec::new();
        let mut fan_in = net.input_dim;
        for (i, layer) in net.layers.iter().enumerate() {
            specs.push(WeightSpec { name: format!("dense_{}/kernel", i), shape: vec![fan_in, layer.units()] });
            specs.push(WeightSpec { name: format!("dense_{}/bias", i),   shape: vec![layer.units()] });
            for v in layer.kernel.iter().chain(layer.bias.iter()) {
                data.extend_from_slice(&v.to_le_bytes());
            }
            fan_in = layer.units();
        }
        let layers = net.layers.iter()
            .map(|l| LayerSpec { units: l.units(), activation: l.activation })
            .collect();
        ModelArtifacts {
            model_topology: Topology { input_dim: net.input_dim, layers },
            weight_specs:   specs,
            weight_data:    data,
        }
    }

    /// Rebuild the network, checking every shape against the topology.
    pub fn to_network(&self) -> Result<Network, ModelError> {
        let topo = &self.model_topology;
        if self.weight_specs.len() != topo.layers.len() * 2 {
            return Err(invalid(format!(
                "{} weight specs for {} layers",
                self.weight_specs.len(),
                topo.layers.len()
            )));
        }
        let expected_bytes: usize = self.weight_specs.iter().map(|s| s.len() * 4).sum();
        if expected_bytes != self.weight_data.len() {
            return Err(invalid(format!(
                "weight buffer is {} bytes, specs need {}",
                self.weight_data.len(),
                expected_bytes
            )));
        }

        let mut floats = self.weight_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]));

        let mut layers = Vec::with_capacity(topo.layers.len());
        let mut fan_in = topo.input_dim;
        for (i, spec) in topo.layers.iter().enumerate() {
            let k = &self.weight_specs[i * 2];
            let b = &self.weight_specs[i * 2 + 1];
            if k.shape != [fan_in, spec.units] || b.shape != [spec.units] {
                return Err(invalid(format!("layer {} shape does not match topology", i)));
            }
            let kernel: Vec<f32> = floats.by_ref().take(k.len()).collect();
            let bias:   Vec<f32> = floats.by_ref().take(b.len()).collect();
            let kernel = Array2::from_shape_vec((fan_in, spec.units), kernel)
                .map_err(|e| invalid(e.to_string()))?;
            layers.push(Dense { kernel, bias: Array1::from_vec(bias), activation: spec.activation });
            fan_in = spec.units;
        }

        match layers.last() {
            Some(last) if last.activation == Activation::Softmax => {}
            _ => return Err(invalid("last layer must be softmax".to_string())),
        }
        Ok(Network { input_dim: topo.input_dim, layers })
    }
}

fn invalid(msg: String) -> ModelError {
    ModelError::InvalidArtifacts(msg)
}

// ════════════════════════════════════════════════════════════════════════════
// ModelBundle
// ════════════════════════════════════════════════════════════════════════════

/// A saved model with its class list and optional training data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub name:        String,
    #[serde(default)]
    pub description: Option<String>,
    pub class_names: Vec<String>,
    pub class_ids:   Vec<ClassId>,
    pub model_data:  ModelArtifacts,
    #[serde(default)]
    pub dataset:     Option<Dataset>,
}

impl ModelBundle {
    pub fn new(name: &str, model: &TrainedModel, class_names: Vec<String>) -> Self {
        ModelBundle {
            name:        name.to_string(),
            description: None,
            class_names,
            class_ids:   model.mapping().ids().to_vec(),
            model_data:  ModelArtifacts::from_network(model.network()),
            dataset:     None,
        }
    }

    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        self.dataset = Some(dataset);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Restore the classifier.  The ids are reserved so newly created
    /// classes never collide with the restored mapping.
    pub fn to_model(&self) -> Result<TrainedModel, ModelError> {
        if self.class_names.len() != self.class_ids.len() {
            return Err(invalid(format!(
                "{} class names for {} class ids",
                self.class_names.len(),
                self.class_ids.len()
            )));
        }
        for id in &self.class_ids {
            id.reserve();
        }
        let network = self.model_data.to_network()?;
        TrainedModel::new(network, ClassMapping::new(self.class_ids.clone()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{train, TrainConfig};
    use hand_pose::{Hand, LandmarkFrame, SampleStore, extract_features};

    fn small_model() -> (TrainedModel, SampleStore) {
        let mut s = SampleStore::new();
        let a = s.add_class("a").unwrap();
        let b = s.add_class("b").unwrap();
        for _ in 0..3 {
            s.collect(a, &LandmarkFrame::single(Hand::flat(0.7))).unwrap();
            s.collect(b, &LandmarkFrame::single(Hand::flat(0.3))).unwrap();
        }
        let cfg = TrainConfig { epochs: 2, hidden_units: vec![8, 4], ..TrainConfig::default() };
        (train(&s.dataset(), &cfg, |_| {}).unwrap(), s)
    }

    #[test]
    fn specs_describe_every_tensor() {
        let (model, _) = small_model();
        let art = ModelArtifacts::from_network(model.network());
        let names: Vec<&str> = art.weight_specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, [
            "dense_0/kernel", "dense_0/bias",
            "dense_1/kernel", "dense_1/bias",
            "dense_2/kernel", "dense_2/bias",
        ]);
        assert_eq!(art.weight_specs[0].shape, vec![63, 8]);
        // (63*8 + 8) + (8*4 + 4) + (4*2 + 2) floats
        assert_eq!(art.weight_data.len(), (512 + 36 + 10) * 4);
    }

    #[test]
    fn restored_network_predicts_identically() {
        let (model, store) = small_model();
        let bundle = ModelBundle::new("demo", &model, store.class_names())
            .with_dataset(store.dataset());
        let restored = bundle.to_model().unwrap();

        let f = extract_features(&LandmarkFrame::single(Hand::flat(0.55))).unwrap();
        assert_eq!(model.predict(&f).unwrap(), restored.predict(&f).unwrap());
        assert_eq!(restored.mapping().ids(), store.class_ids().as_slice());
    }

    #[test]
    fn bundle_file_round_trip() {
        let (model, store) = small_model();
        let path = std::env::temp_dir().join(format!("pose_model_bundle_{}.json", std::process::id()));
        let bundle = ModelBundle::new("file", &model, store.class_names())
            .with_description("two flat hands");
        bundle.save(&path).unwrap();
        let loaded = ModelBundle::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, bundle);
    }

    #[test]
    fn truncated_buffer_rejected() {
        let (model, _) = small_model();
        let mut art = ModelArtifacts::from_network(model.network());
        art.weight_data.truncate(art.weight_data.len() - 4);
        assert!(matches!(art.to_network(), Err(ModelError::InvalidArtifacts(_))));
    }

    #[test]
    fn name_count_must_match_ids() {
        let (model, _) = small_model();
        let mut bundle = ModelBundle::new("x", &model, vec!["only one".into()]);
        bundle.class_names.truncate(1);
        assert!(bundle.to_model().is_err());
    }
}
