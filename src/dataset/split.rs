//! ラベルのキー割り当てと学習/テスト分割

use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// ラベル文字列 <-> キー（クラスID）の対応
///
/// キーは値の昇順で割り当てる。この並びはモデルファイルに保存され、
/// 推論時のスコアベクトルの解釈にもそのまま使われる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap {
    labels: Vec<String>,
}

impl LabelMap {
    /// 出現したラベルから作成（重複除去・昇順）
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = labels
            .into_iter()
            .map(|l| l.as_ref().to_string())
            .collect();
        Self {
            labels: set.into_iter().collect(),
        }
    }

    /// 保存済みの並びをそのまま使う
    pub fn from_ordered(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn key_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn label_of(&self, key: usize) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// 学習用・テスト用に分割されたデータ
#[derive(Debug, Clone)]
pub struct TrainTestSplit<T> {
    pub train: Vec<T>,
    pub test: Vec<T>,
}

/// 固定シードで分割する
///
/// テスト件数は `round(len * test_fraction)`。両者は互いに素で、合わせると入力全体になる。
pub fn train_test_split<T>(items: Vec<T>, test_fraction: f64, seed: u64) -> TrainTestSplit<T> {
    let total = items.len();
    let test_len = ((total as f64 * test_fraction).round() as usize).min(total);

    let mut indices: Vec<usize> = (0..total).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut test = Vec::with_capacity(test_len);
    let mut train = Vec::with_capacity(total - test_len);

    for (position, idx) in indices.into_iter().enumerate() {
        if let Some(item) = slots[idx].take() {
            if position < test_len {
                test.push(item);
            } else {
                train.push(item);
            }
        }
    }

    TrainTestSplit { train, test }
}
