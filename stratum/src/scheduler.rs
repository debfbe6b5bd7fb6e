//! Decides which migrations an operation touches.
//!
//! The schedule keeps migration order: ascending for migrate, descending for rollback and
//! refresh. A plan's version list filters but never reorders.

use crate::core::{Migration, Version};
use crate::plan::Plan;
use std::collections::HashSet;

fn applied_keys(applied: &[Version]) -> HashSet<u64> {
    applied.iter().map(|v| v.key).collect()
}

fn select<'m>(
    candidates: impl Iterator<Item = &'m Migration>,
    applied: &[Version],
    plan: &Plan,
    want_applied: bool,
) -> Vec<&'m Migration> {
    let applied = applied_keys(applied);
    let mut scheduled = Vec::new();
    for migration in candidates {
        if plan.is_full(scheduled.len()) {
            break;
        }
        if applied.contains(&migration.key()) == want_applied && plan.allows(migration.key()) {
            scheduled.push(migration);
        }
    }
    scheduled
}

/// Pending migrations, ascending, filtered and capped by `plan`.
pub fn schedule_for_migration<'m>(
    migrations: &'m [Migration],
    applied: &[Version],
    plan: &Plan,
) -> Vec<&'m Migration> {
    select(migrations.iter(), applied, plan, false)
}

/// Applied migrations, descending, filtered and capped by `plan`.
pub fn schedule_for_rollback<'m>(
    migrations: &'m [Migration],
    applied: &[Version],
    plan: &Plan,
) -> Vec<&'m Migration> {
    select(migrations.iter().rev(), applied, plan, true)
}

/// Same selection as [schedule_for_rollback]; the caller re-applies the result in reverse.
pub fn schedule_for_refresh<'m>(
    migrations: &'m [Migration],
    applied: &[Version],
    plan: &Plan,
) -> Vec<&'m Migration> {
    schedule_for_rollback(migrations, applied, plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FOO: u64 = 1596897167;
    const BAR: u64 = 1596897188;
    const BAZ: u64 = 1597897177;

    fn migrations() -> Vec<Migration> {
        vec![
            Migration::new(FOO, "create foo table"),
            Migration::new(BAR, "create bar table"),
            Migration::new(BAZ, "create baz table"),
        ]
    }

    fn applied(keys: &[u64]) -> Vec<Version> {
        keys.iter().map(|k| Version::new(*k, "x")).collect()
    }

    fn keys(schedule: &[&Migration]) -> Vec<u64> {
        schedule.iter().map(|m| m.key()).collect()
    }

    #[test]
    fn migration_selects_everything_pending() {
        let all = migrations();
        assert_eq!(
            keys(&schedule_for_migration(&all, &[], &Plan::all())),
            vec![FOO, BAR, BAZ]
        );
        assert_eq!(
            keys(&schedule_for_migration(&all, &applied(&[FOO, BAR]), &Plan::all())),
            vec![BAZ]
        );
        assert!(schedule_for_migration(&all, &applied(&[FOO, BAR, BAZ]), &Plan::all()).is_empty());
    }

    #[test]
    fn migration_selects_exactly_the_unapplied() {
        let all = migrations();
        for mask in 0..8u8 {
            let applied_keys: Vec<u64> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, m)| m.key())
                .collect();
            let scheduled = keys(&schedule_for_migration(&all, &applied(&applied_keys), &Plan::all()));
            let expected: Vec<u64> = all
                .iter()
                .map(|m| m.key())
                .filter(|k| !applied_keys.contains(k))
                .collect();
            assert_eq!(scheduled, expected, "mask {mask:#05b}");
        }
    }

    #[test]
    fn migration_respects_steps() {
        let all = migrations();
        assert_eq!(
            keys(&schedule_for_migration(&all, &[], &Plan::steps(1))),
            vec![FOO]
        );
        assert_eq!(
            keys(&schedule_for_migration(&all, &applied(&[FOO]), &Plan::steps(2))),
            vec![BAR, BAZ]
        );
        assert_eq!(
            keys(&schedule_for_migration(&all, &[], &Plan::steps(10))),
            vec![FOO, BAR, BAZ]
        );
    }

    #[test]
    fn migration_filters_by_versions_without_reordering() {
        let all = migrations();
        assert_eq!(
            keys(&schedule_for_migration(&all, &[], &Plan::versions([BAR]))),
            vec![BAR]
        );
        assert_eq!(
            keys(&schedule_for_migration(&all, &[], &Plan::versions([BAZ, FOO]))),
            vec![FOO, BAZ]
        );
        assert!(schedule_for_migration(&all, &[], &Plan::versions([42])).is_empty());
        assert_eq!(
            keys(&schedule_for_migration(
                &all,
                &[],
                &Plan::versions([BAZ, BAR]).with_steps(1)
            )),
            vec![BAR]
        );
    }

    #[test]
    fn rollback_is_reverse_order_restricted_to_applied() {
        let all = migrations();
        assert_eq!(
            keys(&schedule_for_rollback(&all, &applied(&[FOO, BAR, BAZ]), &Plan::all())),
            vec![BAZ, BAR, FOO]
        );
        assert_eq!(
            keys(&schedule_for_rollback(&all, &applied(&[FOO, BAZ]), &Plan::all())),
            vec![BAZ, FOO]
        );
        assert!(schedule_for_rollback(&all, &[], &Plan::all()).is_empty());
    }

    #[test]
    fn rollback_respects_steps_and_versions() {
        let all = migrations();
        let everything = applied(&[FOO, BAR, BAZ]);
        assert_eq!(
            keys(&schedule_for_rollback(&all, &everything, &Plan::steps(2))),
            vec![BAZ, BAR]
        );
        assert_eq!(
            keys(&schedule_for_rollback(&all, &everything, &Plan::versions([FOO]))),
            vec![FOO]
        );
    }

    #[test]
    fn refresh_matches_rollback() {
        let all = migrations();
        let everything = applied(&[FOO, BAR, BAZ]);
        for plan in [Plan::all(), Plan::steps(1), Plan::versions([BAR, FOO])] {
            assert_eq!(
                keys(&schedule_for_refresh(&all, &everything, &plan)),
                keys(&schedule_for_rollback(&all, &everything, &plan))
            );
        }
    }
}
