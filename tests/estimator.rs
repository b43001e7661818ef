use std::fs;

use candle_core::{DType, Device, Tensor};
use finetune::{
    config::{FineTuneConfig, ScheduleSettings, ScheduleStrategy},
    encoder::{EmbeddingEncoder, EmbeddingEncoderConfig},
    estimator::{EstimatorSpec, FeatureBatch, Mode, SequenceClassifier},
};

const POSITIVE_TOKEN: i64 = 3;
const NEGATIVE_TOKEN: i64 = 9;
const SEQ_LEN: usize = 4;

fn test_config(num_train_steps: usize) -> FineTuneConfig {
    let mut config = FineTuneConfig {
        model: Default::default(),
        optimizer: Default::default(),
        schedule: ScheduleSettings {
            num_train_steps,
            num_warmup_steps: num_train_steps / 10,
            strategy: ScheduleStrategy::LinearDecay,
        },
        runtime: Default::default(),
    };
    config.model.dropout_prob = 0.0;
    config.optimizer.learning_rate = 0.05;
    config.runtime.logging.enable_stdout = false;
    config
}

fn build_classifier(config: FineTuneConfig, device: &Device) -> SequenceClassifier {
    let encoder = EmbeddingEncoder::new(
        EmbeddingEncoderConfig {
            vocab_size: 16,
            hidden_size: 16,
        },
        device,
    )
    .expect("encoder construction");
    SequenceClassifier::new(config, Box::new(encoder), device).expect("classifier construction")
}

/// Batch of `n` positive then `n` negative examples, trivially separable by
/// token identity.
fn separable_batch(n: usize, with_labels: bool, device: &Device) -> FeatureBatch {
    let mut tokens = Vec::with_capacity(2 * n * SEQ_LEN);
    let mut labels = Vec::with_capacity(2 * n);
    for _ in 0..n {
        tokens.extend(std::iter::repeat(POSITIVE_TOKEN).take(SEQ_LEN));
        labels.push(1u32);
    }
    for _ in 0..n {
        tokens.extend(std::iter::repeat(NEGATIVE_TOKEN).take(SEQ_LEN));
        labels.push(0u32);
    }

    let batch = 2 * n;
    FeatureBatch {
        input_ids: Tensor::from_vec(tokens, (batch, SEQ_LEN), device).unwrap(),
        input_mask: Tensor::ones((batch, SEQ_LEN), DType::F32, device).unwrap(),
        segment_ids: Tensor::zeros((batch, SEQ_LEN), DType::I64, device).unwrap(),
        label_ids: with_labels
            .then(|| Tensor::from_vec(labels, (batch,), device).unwrap()),
    }
}

#[test]
fn training_loss_falls_on_separable_data() {
    let device = Device::Cpu;
    let mut classifier = build_classifier(test_config(60), &device);
    let batch = separable_batch(4, true, &device);

    let mut first_loss = None;
    let mut last_loss = f32::MAX;
    for _ in 0..60 {
        match classifier.run(Mode::Train, &batch).unwrap() {
            EstimatorSpec::Train { loss, .. } => {
                first_loss.get_or_insert(loss);
                last_loss = loss;
            }
            other => panic!("expected a train result, got {other:?}"),
        }
    }

    let first_loss = first_loss.unwrap();
    assert!(
        last_loss < first_loss,
        "loss did not improve: {first_loss} -> {last_loss}"
    );
    assert!(last_loss < 0.3, "final loss too high: {last_loss}");

    classifier.reset_metrics();
    match classifier.run(Mode::Eval, &batch).unwrap() {
        EstimatorSpec::Eval { metrics, .. } => {
            assert!(
                metrics.accuracy > 0.8,
                "post-training accuracy too low: {}",
                metrics.accuracy
            );
            assert!(metrics.auc > 0.8, "post-training auc too low: {}", metrics.auc);
        }
        other => panic!("expected an eval result, got {other:?}"),
    }
}

#[test]
fn learning_rate_warms_up_then_decays() {
    let device = Device::Cpu;
    let mut classifier = build_classifier(test_config(20), &device);
    let batch = separable_batch(2, true, &device);

    let mut rates = Vec::new();
    for _ in 0..20 {
        match classifier.run(Mode::Train, &batch).unwrap() {
            EstimatorSpec::Train { learning_rate, .. } => rates.push(learning_rate),
            other => panic!("expected a train result, got {other:?}"),
        }
    }

    // Two warmup steps, then a strictly decaying tail that ends at zero.
    assert!(rates[0] < rates[1]);
    let peak = rates[1];
    assert!((peak - 0.05).abs() < 1e-12);
    for window in rates[1..].windows(2) {
        assert!(window[1] < window[0]);
    }
    assert_eq!(*rates.last().unwrap(), 0.0);
}

#[test]
fn prediction_reports_a_proper_distribution() {
    let device = Device::Cpu;
    let mut classifier = build_classifier(test_config(10), &device);
    let batch = separable_batch(3, false, &device);

    let spec = classifier.run(Mode::Predict, &batch).unwrap();
    let (predicted_labels, log_probs) = match spec {
        EstimatorSpec::Predict {
            predicted_labels,
            log_probs,
        } => (predicted_labels, log_probs),
        other => panic!("expected a prediction, got {other:?}"),
    };

    assert_eq!(predicted_labels.dims(), [6]);
    assert_eq!(log_probs.dims(), [6, 2]);

    let row_sums = log_probs
        .exp()
        .unwrap()
        .sum(1)
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    for sum in row_sums {
        assert!((sum - 1.0).abs() < 1e-5, "probabilities sum to {sum}");
    }

    let probs = log_probs.exp().unwrap().to_vec2::<f32>().unwrap();
    let labels = predicted_labels.to_vec1::<u32>().unwrap();
    for (row, &label) in probs.iter().zip(&labels) {
        let argmax = if row[1] > row[0] { 1 } else { 0 };
        assert_eq!(label, argmax);
    }
}

#[test]
fn training_without_labels_fails() {
    let device = Device::Cpu;
    let mut classifier = build_classifier(test_config(10), &device);
    let batch = separable_batch(2, false, &device);
    assert!(classifier.run(Mode::Train, &batch).is_err());
    assert!(classifier.run(Mode::Eval, &batch).is_err());
}

#[test]
fn config_round_trips_through_a_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("finetune.toml");
    let config = test_config(100);
    fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

    let loaded = FineTuneConfig::load(&path).unwrap();
    assert_eq!(loaded.schedule.num_train_steps, 100);
    assert_eq!(loaded.schedule.num_warmup_steps, 10);
    assert_eq!(loaded.optimizer.learning_rate, 0.05);
    assert!(!loaded.runtime.logging.enable_stdout);

    let device = Device::Cpu;
    let mut classifier = build_classifier(loaded, &device);
    let batch = separable_batch(2, true, &device);
    assert!(classifier.run(Mode::Eval, &batch).is_ok());
}
