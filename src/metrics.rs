//! Streaming evaluation metrics for binary classification.
//!
//! Every metric accumulates across repeated `update` calls within one
//! evaluation pass and is reported on demand, so an evaluation loop can feed
//! batch after batch and read a single cumulative bundle at the end.

use crate::config::FineTuneError;

const DEFAULT_NUM_THRESHOLDS: usize = 200;
const THRESHOLD_EPSILON: f64 = 1e-7;

/// The fixed metric bundle produced for an evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsReport {
    pub accuracy: f64,
    pub f1_score: f64,
    pub auc: f64,
    pub precision: f64,
    pub recall: f64,
    pub true_positives: u64,
    pub true_negatives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
}

/// Cumulative confusion counts plus a threshold-bucketed AUC accumulator.
///
/// Label 1 is the positive class. Predictions are label ids, matching how
/// the evaluation branch feeds argmax output straight into the aggregator.
#[derive(Debug, Clone)]
pub struct EvalMetrics {
    true_positives: u64,
    true_negatives: u64,
    false_positives: u64,
    false_negatives: u64,
    correct: u64,
    total: u64,
    auc: StreamingAuc,
}

impl Default for EvalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalMetrics {
    pub fn new() -> Self {
        Self::with_num_thresholds(DEFAULT_NUM_THRESHOLDS)
    }

    pub fn with_num_thresholds(num_thresholds: usize) -> Self {
        Self {
            true_positives: 0,
            true_negatives: 0,
            false_positives: 0,
            false_negatives: 0,
            correct: 0,
            total: 0,
            auc: StreamingAuc::new(num_thresholds),
        }
    }

    /// Accumulates one batch of ground-truth label ids and predicted labels.
    pub fn update(&mut self, label_ids: &[u32], predicted: &[u32]) -> Result<(), FineTuneError> {
        if label_ids.len() != predicted.len() {
            return Err(FineTuneError::runtime(format!(
                "metric update requires matching lengths, got {} labels and {} predictions",
                label_ids.len(),
                predicted.len()
            )));
        }

        for (&label, &prediction) in label_ids.iter().zip(predicted) {
            let truth = label == 1;
            let guess = prediction == 1;
            match (truth, guess) {
                (true, true) => self.true_positives += 1,
                (false, false) => self.true_negatives += 1,
                (false, true) => self.false_positives += 1,
                (true, false) => self.false_negatives += 1,
            }
            if label == prediction {
                self.correct += 1;
            }
            self.total += 1;
            self.auc.update(truth, f64::from(prediction.min(1)));
        }

        Ok(())
    }

    pub fn examples_seen(&self) -> u64 {
        self.total
    }

    /// Drops all accumulated state, starting a fresh evaluation pass.
    pub fn reset(&mut self) {
        let num_thresholds = self.auc.num_thresholds();
        *self = Self::with_num_thresholds(num_thresholds);
    }

    pub fn report(&self) -> MetricsReport {
        let accuracy = ratio(self.correct, self.total);
        let precision = ratio(
            self.true_positives,
            self.true_positives + self.false_positives,
        );
        let recall = ratio(
            self.true_positives,
            self.true_positives + self.false_negatives,
        );
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        MetricsReport {
            accuracy,
            f1_score,
            auc: self.auc.value(),
            precision,
            recall,
            true_positives: self.true_positives,
            true_negatives: self.true_negatives,
            false_positives: self.false_positives,
            false_negatives: self.false_negatives,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Streaming ROC-AUC over a fixed grid of thresholds.
///
/// Confusion counts are kept per threshold and the curve is integrated with
/// the trapezoid rule. The outermost thresholds sit just outside `[0, 1]` so
/// every score lands strictly between the ends of the grid.
#[derive(Debug, Clone)]
struct StreamingAuc {
    thresholds: Vec<f64>,
    true_positives: Vec<u64>,
    false_positives: Vec<u64>,
    true_negatives: Vec<u64>,
    false_negatives: Vec<u64>,
}

impl StreamingAuc {
    fn new(num_thresholds: usize) -> Self {
        let buckets = num_thresholds.max(2);
        let mut thresholds = Vec::with_capacity(buckets);
        thresholds.push(-THRESHOLD_EPSILON);
        for i in 1..buckets - 1 {
            thresholds.push(i as f64 / (buckets - 1) as f64);
        }
        thresholds.push(1.0 + THRESHOLD_EPSILON);

        Self {
            true_positives: vec![0; thresholds.len()],
            false_positives: vec![0; thresholds.len()],
            true_negatives: vec![0; thresholds.len()],
            false_negatives: vec![0; thresholds.len()],
            thresholds,
        }
    }

    fn num_thresholds(&self) -> usize {
        self.thresholds.len()
    }

    fn update(&mut self, positive: bool, score: f64) {
        for (idx, &threshold) in self.thresholds.iter().enumerate() {
            let predicted_positive = score > threshold;
            match (positive, predicted_positive) {
                (true, true) => self.true_positives[idx] += 1,
                (true, false) => self.false_negatives[idx] += 1,
                (false, true) => self.false_positives[idx] += 1,
                (false, false) => self.true_negatives[idx] += 1,
            }
        }
    }

    fn value(&self) -> f64 {
        let mut auc = 0.0;
        for idx in 0..self.thresholds.len() - 1 {
            let (x0, y0) = self.roc_point(idx);
            let (x1, y1) = self.roc_point(idx + 1);
            // Thresholds ascend, so the false-positive rate descends.
            auc += (x0 - x1) * (y0 + y1) / 2.0;
        }
        auc
    }

    fn roc_point(&self, idx: usize) -> (f64, f64) {
        let tpr = ratio(
            self.true_positives[idx],
            self.true_positives[idx] + self.false_negatives[idx],
        );
        let fpr = ratio(
            self.false_positives[idx],
            self.false_positives[idx] + self.true_negatives[idx],
        );
        (fpr, tpr)
    }
}
