//! Sweeps over sorted scores shared by metrics and thresholds.

fn is_positive(target: f32) -> bool {
    target >= 0.5
}

/// `(score, positive)` pairs sorted by descending score.
fn sorted_desc(preds: &[f32], targets: &[f32]) -> Vec<(f32, bool)> {
    let mut pairs: Vec<(f32, bool)> =
        preds.iter().zip(targets).map(|(&p, &t)| (p, is_positive(t))).collect();
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
    pairs
}

/// Cumulative `(threshold, tp, fp)` at every distinct score, highest first.
fn operating_points(preds: &[f32], targets: &[f32]) -> (Vec<(f32, usize, usize)>, usize) {
    let pairs = sorted_desc(preds, targets);
    let positives = pairs.iter().filter(|(_, pos)| *pos).count();
    let mut points = Vec::new();
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut i = 0;
    while i < pairs.len() {
        let score = pairs[i].0;
        while i < pairs.len() && pairs[i].0 == score {
            if pairs[i].1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        points.push((score, tp, fp));
    }
    (points, positives)
}

pub(crate) fn f1(tp: usize, fp: usize, fn_: usize) -> f64 {
    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        return 0.0;
    }
    (2 * tp) as f64 / denom as f64
}

/// Threshold with the highest F1 (predict positive when `score >= threshold`).
pub(crate) fn best_f1_threshold(preds: &[f32], targets: &[f32]) -> Option<(f32, f64)> {
    let (points, positives) = operating_points(preds, targets);
    if positives == 0 {
        return None;
    }
    points
        .into_iter()
        .map(|(t, tp, fp)| (t, f1(tp, fp, positives - tp)))
        .fold(None, |best: Option<(f32, f64)>, cur| match best {
            Some(b) if b.1 >= cur.1 => Some(b),
            _ => Some(cur),
        })
}

/// Area under the ROC curve via the rank statistic; ties get averaged ranks.
pub(crate) fn auroc(preds: &[f32], targets: &[f32]) -> f64 {
    let mut pairs = sorted_desc(preds, targets);
    pairs.reverse();
    let positives = pairs.iter().filter(|(_, pos)| *pos).count();
    let negatives = pairs.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.0;
    }

    let mut rank_sum = 0.0f64;
    let mut i = 0;
    while i < pairs.len() {
        let mut j = i;
        while j < pairs.len() && pairs[j].0 == pairs[i].0 {
            j += 1;
        }
        // Ranks are 1-based: entries i..j share the mean of ranks i+1..=j.
        let avg_rank = (i + 1 + j) as f64 / 2.0;
        let tied_pos = pairs[i..j].iter().filter(|(_, pos)| *pos).count();
        rank_sum += avg_rank * tied_pos as f64;
        i = j;
    }

    let p = positives as f64;
    (rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

/// Average precision: precision weighted by recall increments.
pub(crate) fn average_precision(preds: &[f32], targets: &[f32]) -> f64 {
    let (points, positives) = operating_points(preds, targets);
    if positives == 0 {
        return 0.0;
    }
    let mut ap = 0.0;
    let mut prev_recall = 0.0;
    for (_, tp, fp) in points {
        let recall = tp as f64 / positives as f64;
        let precision = tp as f64 / (tp + fp) as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    ap
}
