//! End-to-end checkpoint lifecycle over real on-disk datasets

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde_json::json;
use tempfile::TempDir;

use clipcap::engine::{LocalEngine, Precision, RunSettings, TrainingEngine};
use clipcap::lm::Gpt2Backend;
use clipcap::model::{CaptionModelConfig, MappingType, ModelFactory, ModelKind};
use clipcap::{
    CaptionModel, CheckpointSaver, CompositeDataset, Dataset, DeviceSelection, PrefixDataset,
    PrefixLoader, TrainingSnapshot,
};
use clipcap::data::{PrefixDatasetOptions, PrefixLoaderConfig};

fn write_dataset_dir(dir: &Path, name: &str, num_samples: usize) {
    std::fs::create_dir_all(dir).unwrap();
    let mut entries = Vec::new();
    for i in 0..num_samples {
        let file = format!("{i:04}.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "prefix".to_string(),
            Tensor::ones((3, 6), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "tokens".to_string(),
            Tensor::new(&[1u32, 2, 3, 4], &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.join(&file)).unwrap();
        entries.push(json!({ "id": format!("{name}_{i}"), "file": file }));
    }

    let manifest = json!({
        "name": name,
        "prefix_size": 6,
        "samples": entries,
    });
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

fn tiny_model() -> CaptionModel {
    let device = Device::Cpu;
    let backend_vars = VarMap::new();
    let vb = VarBuilder::from_varmap(&backend_vars, DType::F32, &device);
    let backend = Gpt2Backend::with_dims("gpt2", 8, 16, vb).unwrap();

    let config = CaptionModelConfig {
        kind: ModelKind::PrefixOnly,
        model_type: "gpt2".to_string(),
        variant: "gpt2".to_string(),
        mapping_type: MappingType::Mlp,
        clip_prefix_length: 3,
        prefix_size: 6,
        prefix_length: 5,
        num_layers: 2,
        num_attention_heads: 2,
    };
    ModelFactory::with_backend(&config, 8, Box::new(backend), backend_vars, &device).unwrap()
}

/// Full merged-run lifecycle: two source directories, three epochs at an
/// every-epoch cadence with step saves disabled, then a final save.
#[test]
fn test_merged_run_checkpoint_lifecycle() {
    let dir = TempDir::new().unwrap();
    let device = Device::Cpu;
    write_dataset_dir(&dir.path().join("a"), "a", 100);
    write_dataset_dir(&dir.path().join("b"), "b", 50);

    let options = PrefixDatasetOptions::default();
    let members: Vec<Box<dyn Dataset>> = vec![
        Box::new(
            PrefixDataset::load(dir.path().join("a"), device.clone(), options.clone()).unwrap(),
        ),
        Box::new(PrefixDataset::load(dir.path().join("b"), device.clone(), options).unwrap()),
    ];
    let dataset = CompositeDataset::merge(members).unwrap();
    assert_eq!(dataset.len(), 150);
    // Cross-member ordering is member construction order.
    assert_eq!(dataset.get(120).unwrap().id, "b_20");

    let epochs = 3;
    let run_steps = dataset.len() * epochs;
    let output_dir = dir.path().join("models");
    let saver = CheckpointSaver::new(&output_dir, "demo_model", 1, None).unwrap();
    let model = tiny_model();
    let mut loader = PrefixLoader::new(
        Box::new(dataset),
        PrefixLoaderConfig {
            batch_size: 50,
            drop_last: false,
        },
    );
    let settings = RunSettings {
        max_epochs: epochs,
        devices: DeviceSelection::Devices(vec![0]),
        precision: Precision::Full,
        strategy: None,
        total_steps: run_steps,
        warmup_steps: 2,
    };

    let report = LocalEngine::new()
        .fit(&model, &mut loader, &[&saver], &settings)
        .unwrap();
    saver
        .save_final(epochs - 1, report.global_steps, &model)
        .unwrap();

    assert_eq!(report.global_steps, 9);

    // Exactly one epoch artifact per epoch, one final, no rolling latest.
    for epoch in 0..epochs {
        assert!(saver.epoch_path(epoch).exists());
    }
    assert!(saver.final_path().exists());
    assert!(!saver.latest_path().exists());
    assert_eq!(std::fs::read_dir(&output_dir).unwrap().count(), 4);

    let final_bytes = std::fs::read(saver.final_path()).unwrap();
    let snapshot = TrainingSnapshot::from_bytes(&final_bytes).unwrap();
    assert_eq!(snapshot.epoch, 2);
    assert_eq!(snapshot.global_step, 9);

    // Epoch artifacts carry the step count accumulated so far: three
    // 50-sample batches per epoch, so six after epoch 1.
    let epoch_bytes = std::fs::read(saver.epoch_path(1)).unwrap();
    let epoch_snapshot = TrainingSnapshot::from_bytes(&epoch_bytes).unwrap();
    assert_eq!(epoch_snapshot.epoch, 1);
    assert_eq!(epoch_snapshot.global_step, 6);
}

/// Step-cadence run: the rolling latest artifact reflects the last
/// qualifying step and nothing else accumulates from step saves.
#[test]
fn test_step_cadence_produces_rolling_latest() {
    let dir = TempDir::new().unwrap();
    let device = Device::Cpu;
    write_dataset_dir(&dir.path().join("a"), "a", 4);

    let dataset =
        PrefixDataset::load(dir.path().join("a"), device, PrefixDatasetOptions::default())
            .unwrap();

    let output_dir = dir.path().join("models");
    let saver = CheckpointSaver::new(&output_dir, "demo_model", 1, Some(2)).unwrap();
    let model = tiny_model();
    let mut loader = PrefixLoader::new(
        Box::new(dataset),
        PrefixLoaderConfig {
            batch_size: 2,
            drop_last: false,
        },
    );
    let settings = RunSettings {
        max_epochs: 2,
        devices: DeviceSelection::Devices(vec![0]),
        precision: Precision::Half,
        strategy: None,
        total_steps: 8,
        warmup_steps: 0,
    };

    let report = LocalEngine::new()
        .fit(&model, &mut loader, &[&saver], &settings)
        .unwrap();
    assert_eq!(report.global_steps, 4);

    assert!(saver.latest_path().exists());
    let snapshot =
        TrainingSnapshot::from_bytes(&std::fs::read(saver.latest_path()).unwrap()).unwrap();
    assert_eq!(snapshot.global_step, 4);
    // Step 4 is the last batch of epoch 1 and the latest artifact says so.
    assert_eq!(snapshot.epoch, 1);

    // Two epoch artifacts plus the rolling latest.
    assert_eq!(std::fs::read_dir(&output_dir).unwrap().count(), 3);

    let model_state = safetensors::SafeTensors::deserialize(&snapshot.model_state).unwrap();
    assert!(model_state
        .names()
        .iter()
        .any(|n| n.starts_with("mapping.")));
}
