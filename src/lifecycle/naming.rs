//! Instance naming for bulk operations.

use std::collections::BTreeMap;

use crate::model::Instance;

/// Names for a batch of `count` instances based on `base`.
///
/// A single instance keeps the base name; larger batches are numbered
/// `base-1` through `base-N`.
#[must_use]
pub fn instance_names(base: &str, count: usize) -> Vec<String> {
    if count == 1 {
        return vec![base.to_owned()];
    }
    (1..=count).map(|index| format!("{base}-{index}")).collect()
}

/// Instances addressed by `name`: the exact match when one exists,
/// otherwise every numbered member of the `name-<n>` batch.
#[must_use]
pub fn removal_candidates<'a>(
    instances: &'a BTreeMap<String, Instance>,
    name: &str,
) -> Vec<&'a Instance> {
    if let Some(exact) = instances.get(name) {
        return vec![exact];
    }
    instances
        .values()
        .filter(|instance| is_batch_member(&instance.name, name))
        .collect()
}

fn is_batch_member(candidate: &str, base: &str) -> bool {
    candidate
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|suffix| !suffix.is_empty() && suffix.chars().all(|ch| ch.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::model::Network;

    fn tracked(names: &[&str]) -> BTreeMap<String, Instance> {
        names
            .iter()
            .map(|name| {
                let instance = Instance {
                    name: (*name).to_owned(),
                    machine_type: "n1-standard-1".to_owned(),
                    zone: "us-central1-a".to_owned(),
                    driver: "main".to_owned(),
                    status: "RUNNING".to_owned(),
                    os: "debian-12".to_owned(),
                    network: Network::default(),
                };
                ((*name).to_owned(), instance)
            })
            .collect()
    }

    fn names_of(instances: &[&Instance]) -> Vec<String> {
        instances.iter().map(|instance| instance.name.clone()).collect()
    }

    #[rstest]
    #[case(1, &["web"])]
    #[case(3, &["web-1", "web-2", "web-3"])]
    fn batch_names_are_numbered_from_one(#[case] count: usize, #[case] expected: &[&str]) {
        assert_eq!(instance_names("web", count), expected);
    }

    #[test]
    fn exact_match_wins_over_batch_members() {
        let instances = tracked(&["web", "web-1", "web-2"]);
        assert_eq!(names_of(&removal_candidates(&instances, "web")), vec!["web"]);
    }

    #[test]
    fn batch_members_need_a_numeric_suffix() {
        let instances = tracked(&["web-1", "web-2", "web-x", "web-1a", "web-", "webby-3", "db-1"]);
        assert_eq!(
            names_of(&removal_candidates(&instances, "web")),
            vec!["web-1", "web-2"]
        );
    }

    #[test]
    fn unknown_names_resolve_to_nothing() {
        let instances = tracked(&["db-1"]);
        assert!(removal_candidates(&instances, "web").is_empty());
    }
}
