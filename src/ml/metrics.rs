//! 多クラス分類の評価指標

use serde::Serialize;

use crate::dataset::LabelMap;

/// 確率を log に渡す前の下限
const PROBABILITY_EPSILON: f64 = 1e-15;

/// 最大値のインデックス（同値の場合は先頭、NaNは無視）
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

/// 評価結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MulticlassMetrics {
    /// 全サンプルでの正解率
    pub micro_accuracy: f64,
    /// クラスごとの正解率の平均（テストに現れたクラスのみ）
    pub macro_accuracy: f64,
    /// 平均対数損失
    pub log_loss: f64,
    /// 事前分布に対する対数損失の改善率
    pub log_loss_reduction: f64,
    /// クラスごとの平均対数損失（サンプルのないクラスは0）
    pub per_class_log_loss: Vec<f64>,
    /// 混同行列 [正解][予測]
    pub confusion_matrix: Vec<Vec<usize>>,
    pub num_samples: usize,
}

impl MulticlassMetrics {
    /// スコアベクトルと正解キーから評価指標を計算
    pub fn compute(scores: &[Vec<f32>], truths: &[usize], num_classes: usize) -> Self {
        let n = scores.len().min(truths.len());
        let mut confusion = vec![vec![0usize; num_classes]; num_classes];
        let mut class_loss = vec![0.0f64; num_classes];
        let mut support = vec![0usize; num_classes];
        let mut correct = 0usize;
        let mut total_loss = 0.0f64;

        for (row, &truth) in scores.iter().zip(truths).take(n) {
            let predicted = argmax(row).unwrap_or(0);
            if predicted == truth {
                correct += 1;
            }
            if truth < num_classes && predicted < num_classes {
                confusion[truth][predicted] += 1;
            }

            let p = row.get(truth).copied().unwrap_or(0.0) as f64;
            let loss = -p.clamp(PROBABILITY_EPSILON, 1.0).ln();
            total_loss += loss;
            if truth < num_classes {
                class_loss[truth] += loss;
                support[truth] += 1;
            }
        }

        if n == 0 {
            return Self {
                micro_accuracy: 0.0,
                macro_accuracy: 0.0,
                log_loss: 0.0,
                log_loss_reduction: 0.0,
                per_class_log_loss: vec![0.0; num_classes],
                confusion_matrix: confusion,
                num_samples: 0,
            };
        }

        let log_loss = total_loss / n as f64;

        let prior_log_loss: f64 = support
            .iter()
            .filter(|&&s| s > 0)
            .map(|&s| {
                let p = s as f64 / n as f64;
                -p * p.ln()
            })
            .sum();
        let log_loss_reduction = if prior_log_loss > 0.0 {
            (prior_log_loss - log_loss) / prior_log_loss
        } else {
            0.0
        };

        let present: Vec<usize> = (0..num_classes).filter(|&c| support[c] > 0).collect();
        let macro_accuracy = if present.is_empty() {
            0.0
        } else {
            present
                .iter()
                .map(|&c| confusion[c][c] as f64 / support[c] as f64)
                .sum::<f64>()
                / present.len() as f64
        };

        let per_class_log_loss = class_loss
            .iter()
            .zip(&support)
            .map(|(&loss, &s)| if s > 0 { loss / s as f64 } else { 0.0 })
            .collect();

        Self {
            micro_accuracy: correct as f64 / n as f64,
            macro_accuracy,
            log_loss,
            log_loss_reduction,
            per_class_log_loss,
            confusion_matrix: confusion,
            num_samples: n,
        }
    }

    /// 評価指標をコンソールに表示
    pub fn print(&self, model_name: &str, labels: &LabelMap) {
        println!("\n************************************************************");
        println!("*    {} の評価指標 (多クラス分類)", model_name);
        println!("*-----------------------------------------------------------");
        println!("    サンプル数       = {}", self.num_samples);
        println!("    MacroAccuracy    = {:.4} (1に近いほど良い)", self.macro_accuracy);
        println!("    MicroAccuracy    = {:.4} (1に近いほど良い)", self.micro_accuracy);
        println!("    LogLoss          = {:.4} (0に近いほど良い)", self.log_loss);
        println!("    LogLossReduction = {:.4}", self.log_loss_reduction);
        for (key, loss) in self.per_class_log_loss.iter().enumerate() {
            let name = labels.label_of(key).unwrap_or("?");
            println!("    LogLoss [{}] = {:.4}", name, loss);
        }
        println!("    混同行列 (行: 正解, 列: 予測)");
        for (key, row) in self.confusion_matrix.iter().enumerate() {
            let name = labels.label_of(key).unwrap_or("?");
            let cells: Vec<String> = row.iter().map(|c| format!("{:>4}", c)).collect();
            println!("    {:>12} |{}", name, cells.join(""));
        }
        println!("************************************************************");
    }
}
