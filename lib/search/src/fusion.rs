// Average-rank fusion of positive and negative rankings.
use contentdb_core::{Error, Locator, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusedEntry {
    pub locator: Locator,
    /// Mean of the 0-based positions in the positive list and the reversed
    /// negative list. Lower is better.
    pub combined_rank: f64,
}

fn positions(ranked: &[Locator]) -> Vec<FusedEntry> {
    ranked
        .iter()
        .enumerate()
        .map(|(i, locator)| FusedEntry {
            locator: *locator,
            combined_rank: i as f64,
        })
        .collect()
}

/// Merge best-first rankings of the same candidate pool into one order.
///
/// With only a positive ranking it is returned as is; with only a negative
/// ranking, reversed. Both lists must rank exactly the same candidates.
pub fn fuse(positive: Option<&[Locator]>, negative: Option<&[Locator]>) -> Result<Vec<FusedEntry>> {
    let (positive, negative) = match (positive, negative) {
        (None, None) => {
            return Err(Error::InvalidRequest(
                "at least one positive or negative example is required".to_string(),
            ))
        }
        (Some(positive), None) => return Ok(positions(positive)),
        (None, Some(negative)) => {
            let reversed: Vec<Locator> = negative.iter().rev().copied().collect();
            return Ok(positions(&reversed));
        }
        (Some(positive), Some(negative)) => (positive, negative),
    };

    if positive.len() != negative.len() {
        return Err(Error::InvariantViolation(format!(
            "positive ranking has {} candidates, negative ranking has {}",
            positive.len(),
            negative.len()
        )));
    }

    let mut pos = positions(positive);
    let reversed: Vec<Locator> = negative.iter().rev().copied().collect();
    let mut neg = positions(&reversed);
    pos.sort_by(|a, b| a.locator.cmp(&b.locator));
    neg.sort_by(|a, b| a.locator.cmp(&b.locator));

    let mut fused = Vec::with_capacity(pos.len());
    for (p, n) in pos.iter().zip(&neg) {
        if p.locator != n.locator {
            return Err(Error::InvariantViolation(format!(
                "rankings disagree on candidates: {} vs {}",
                p.locator, n.locator
            )));
        }
        fused.push(FusedEntry {
            locator: p.locator,
            combined_rank: (p.combined_rank + n.combined_rank) / 2.0,
        });
    }

    // stable: equal ranks stay in locator order, which compares fields
    // numerically (2.0.0.0.0 before 10.0.0.0.0), not as dotted strings
    fused.sort_by(|a, b| a.combined_rank.total_cmp(&b.combined_rank));
    Ok(fused)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Locator = Locator { image_id: 1, pixels_id: 0, channel: 0, z: 0, t: 0 };
    const B: Locator = Locator { image_id: 2, pixels_id: 0, channel: 0, z: 0, t: 0 };
    const C: Locator = Locator { image_id: 3, pixels_id: 0, channel: 0, z: 0, t: 0 };

    fn locators(fused: &[FusedEntry]) -> Vec<Locator> {
        fused.iter().map(|e| e.locator).collect()
    }

    #[test]
    fn test_agreeing_rankings() {
        let fused = fuse(Some(&[A, B, C]), Some(&[C, B, A])).unwrap();
        assert_eq!(locators(&fused), vec![A, B, C]);
    }

    #[test]
    fn test_disagreeing_rankings() {
        let fused = fuse(Some(&[A, B, C]), Some(&[A, C, B])).unwrap();
        assert_eq!(locators(&fused), vec![B, A, C]);
        let ranks: Vec<f64> = fused.iter().map(|e| e.combined_rank).collect();
        assert_eq!(ranks, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_single_polarity() {
        assert_eq!(locators(&fuse(Some(&[C, A, B]), None).unwrap()), vec![C, A, B]);
        assert_eq!(locators(&fuse(None, Some(&[C, A, B])).unwrap()), vec![B, A, C]);
        assert!(matches!(fuse(None, None), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_ties_keep_locator_order() {
        // C and A both average to 1.0
        let fused = fuse(Some(&[C, B, A]), Some(&[C, B, A])).unwrap();
        assert!(fused.iter().all(|e| e.combined_rank == 1.0));
        assert_eq!(locators(&fused), vec![A, B, C]);
    }

    #[test]
    fn test_ties_use_numeric_locator_order() {
        let two = Locator::image(2);
        let ten = Locator::image(10);
        let fused = fuse(Some(&[two, ten]), Some(&[two, ten])).unwrap();
        assert_eq!(locators(&fused), vec![two, ten]);
        assert_eq!(fused[0].combined_rank, 0.5);
        assert_eq!(fused[1].combined_rank, 0.5);
    }

    #[test]
    fn test_divergent_sets_rejected() {
        assert!(matches!(
            fuse(Some(&[A, B]), Some(&[A, B, C])),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            fuse(Some(&[A, B]), Some(&[A, C])),
            Err(Error::InvariantViolation(_))
        ));
    }
}
