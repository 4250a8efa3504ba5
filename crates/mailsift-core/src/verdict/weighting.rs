//! Module group weighting

use crate::modules::MessageCheckResult;
use mailsift_common::config::ModuleGroupConfig;
use mailsift_common::Action;
use std::collections::HashSet;
use tracing::debug;

/// Rescale grouped results so each group contributes at most its weight.
///
/// Within a group, each non-error member gets
/// `score * member_weight * (group_weight / non_error_weight)`, where
/// `non_error_weight` sums the weights of members that returned a result
/// other than Error. Members that abstained do not count. A group whose
/// members all errored, or whose non-error weight is zero, keeps raw
/// scores. A module listed in several groups is weighted by the first.
///
/// Only the set of results matters, not their order.
pub fn apply_groups(results: &mut [MessageCheckResult], groups: &[ModuleGroupConfig]) {
    let mut weighted: HashSet<String> = HashSet::new();

    for group in groups {
        let members: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| group.members.contains_key(&r.module) && !weighted.contains(&r.module))
            .map(|(i, _)| i)
            .collect();

        if members.is_empty() {
            continue;
        }

        let non_error_weight: f64 = members
            .iter()
            .filter(|&&i| results[i].action != Action::Error)
            .map(|&i| group.members[&results[i].module])
            .sum();

        if non_error_weight <= 0.0 {
            debug!(group = %group.name, "No weighted non-error members, keeping raw scores");
            continue;
        }

        let scale = group.weight / non_error_weight;
        for &i in &members {
            let result = &mut results[i];
            weighted.insert(result.module.clone());
            if result.action == Action::Error {
                continue;
            }
            result.weighted_score = result.score * group.members[&result.module] * scale;
        }
    }
}
