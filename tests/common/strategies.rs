//! Proptest strategies for membership changes.

use proptest::prelude::*;
use std::collections::BTreeSet;

/// Distinct hosts in `10.0.0.0/24`, in arbitrary order
pub fn host_set_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(1u8..=254, 1..8)
        .prop_map(|octets| {
            octets
                .into_iter()
                .map(|o| format!("10.0.0.{o}"))
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

/// A first membership and a second one that still contains the first's
/// leading host, with members dropped, added and reordered
pub fn retained_primary_strategy() -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
    (host_set_strategy(), host_set_strategy()).prop_flat_map(|(first, extra)| {
        let primary = first[0].clone();
        let others: Vec<String> = first
            .iter()
            .skip(1)
            .chain(extra.iter())
            .filter(|h| **h != primary)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let len = others.len();

        (Just(first), prop::sample::subsequence(others, 0..=len)).prop_flat_map(
            move |(first, kept)| {
                let mut second = kept;
                second.push(primary.clone());
                (Just(first), Just(second).prop_shuffle())
            },
        )
    })
}

/// A first membership and a second one without the first's leading host
pub fn replaced_primary_strategy() -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
    (host_set_strategy(), host_set_strategy()).prop_filter_map(
        "second membership must not contain the first primary",
        |(first, second)| {
            let second: Vec<String> = second.into_iter().filter(|h| *h != first[0]).collect();
            (!second.is_empty()).then_some((first, second))
        },
    )
}
