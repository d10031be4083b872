//! Weight distribution across stacks.

use std::collections::{BTreeMap, BTreeSet};

use stackshift_core::{DeployError, DeployResult, Stack};

/// Full weight of every stack when `stacks` stacks share the traffic.
///
/// Each stack gets `100 / stacks`; the remainder goes to stack 1 so the
/// weights always sum to exactly 100.
pub fn weight_distribution(stacks: u32) -> DeployResult<BTreeMap<Stack, u32>> {
    if stacks == 0 {
        return Err(DeployError::InvalidConfig(
            "weight distribution needs at least one stack".to_string(),
        ));
    }
    let share = 100 / stacks;
    let remainder = 100 % stacks;
    Ok(Stack::all(stacks)
        .map(|stack| {
            let weight = if stack == Stack::FIRST { share + remainder } else { share };
            (stack, weight)
        })
        .collect())
}

/// The non-zero weights a record may legitimately carry.
pub(crate) fn valid_weights(distribution: &BTreeMap<Stack, u32>) -> BTreeSet<u32> {
    distribution.values().copied().filter(|w| *w > 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(n: u32) -> Stack {
        Stack::new(n).unwrap()
    }

    #[test]
    fn single_stack_takes_everything() {
        let dist = weight_distribution(1).unwrap();
        assert_eq!(dist, BTreeMap::from([(stack(1), 100)]));
    }

    #[test]
    fn remainder_lands_on_first_stack() {
        let dist = weight_distribution(7).unwrap();
        let expected: BTreeMap<Stack, u32> = [16, 14, 14, 14, 14, 14, 14]
            .into_iter()
            .enumerate()
            .map(|(i, w)| (stack(i as u32 + 1), w))
            .collect();
        assert_eq!(dist, expected);
    }

    #[test]
    fn every_distribution_sums_to_one_hundred() {
        for n in 1..=100 {
            let dist = weight_distribution(n).unwrap();
            assert_eq!(dist.len(), n as usize);
            assert_eq!(dist.values().sum::<u32>(), 100, "n = {n}");
            let max = dist.values().copied().max().unwrap();
            assert_eq!(dist[&Stack::FIRST], max, "n = {n}");
            assert!(dist.iter().skip(1).all(|(_, w)| *w == 100 / n), "n = {n}");
        }
    }

    #[test]
    fn zero_stacks_is_a_config_error() {
        assert!(matches!(
            weight_distribution(0),
            Err(DeployError::InvalidConfig(_))
        ));
    }

    #[test]
    fn valid_weights_exclude_zero() {
        let dist = weight_distribution(3).unwrap();
        assert_eq!(valid_weights(&dist), BTreeSet::from([34, 33]));
    }
}
