use crate::contracts::{DecisionOutcome, DecisionStrategy};
use crate::types::{DecisionKey, DecisionMap, Location};

/// Policy strategy that always takes the first reachable position.
/// Useful for fully-automatic runs and as the default in tests.
#[derive(Debug, Default)]
pub struct AutoDecisionStrategy;

impl DecisionStrategy for AutoDecisionStrategy {
    fn resolve(
        &self,
        _key: &DecisionKey,
        options: &[Location],
        _outstanding: &DecisionMap,
    ) -> DecisionOutcome {
        match options.first() {
            Some(location) => DecisionOutcome::Chosen(location.clone()),
            None => DecisionOutcome::Defer,
        }
    }
}

/// Strategy that defers every ambiguous choice, unless an answer for the key
/// is already present in the outstanding set (e.g. supplied out-of-band by a
/// human and re-observed on the next loop iteration).
#[derive(Debug, Default)]
pub struct DeferAllStrategy;

impl DecisionStrategy for DeferAllStrategy {
    fn resolve(
        &self,
        key: &DecisionKey,
        options: &[Location],
        outstanding: &DecisionMap,
    ) -> DecisionOutcome {
        // A resolved decision carries exactly one remaining option.
        if let Some(resolved) = outstanding.get(key) {
            if resolved.options.len() == 1 {
                return DecisionOutcome::Chosen(resolved.options[0].clone());
            }
        }
        if options.len() == 1 {
            return DecisionOutcome::Chosen(options[0].clone());
        }
        DecisionOutcome::Defer
    }
}
