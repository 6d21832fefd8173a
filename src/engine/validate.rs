use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::error::{ValidationErrors, ViolationKind};

/// Period types a booking or block must not overlap.
pub const CHECK_TYPES: &[ItemType] = &[ItemType::BookingBlock, ItemType::BookingRoom];

/// A period under validation, with its position in the submitted list.
pub type Candidate<'a> = (usize, &'a CalendarPeriod);

/// Every candidate needs both ends, and `from < to`. Never stops at the first failure.
pub fn check_existence(candidates: &[Candidate<'_>], field: &'static str, report: &mut ValidationErrors) {
    for &(position, period) in candidates {
        match (period.from, period.to) {
            (Some(from), Some(to)) if from >= to => {
                report.add(field, Some(position), ViolationKind::InvalidRange);
            }
            (Some(_), Some(_)) => {}
            _ => report.add(field, Some(position), ViolationKind::MissingPeriod),
        }
    }
}

/// No candidate may overlap a stored period of a checked type on the same item, nor an
/// earlier candidate in the same submission.
///
/// `excluded` holds stored period ids that are about to be replaced; a candidate is
/// never compared with itself.
pub fn check_conflicts<'a>(
    calendar_of: impl Fn(&Ulid) -> Option<&'a ItemCalendar>,
    candidates: &[Candidate<'_>],
    check_types: &[ItemType],
    excluded: &HashSet<Ulid>,
    field: &'static str,
    report: &mut ValidationErrors,
) {
    for (i, &(position, candidate)) in candidates.iter().enumerate() {
        let Some(span) = candidate.span() else {
            continue;
        };

        let stored = calendar_of(&candidate.item_id).and_then(|calendar| {
            calendar.overlapping(&span).find(|p| {
                check_types.contains(&p.item_type) && p.id != candidate.id && !excluded.contains(&p.id)
            })
        });
        if let Some(existing) = stored {
            report.add(field, Some(position), ViolationKind::PeriodConflict { with: existing.id });
            continue;
        }

        let sibling = candidates[..i].iter().find(|(_, other)| {
            other.item_id == candidate.item_id
                && other.id != candidate.id
                && check_types.contains(&other.item_type)
                && other.overlaps(candidate)
        });
        if let Some((_, other)) = sibling {
            report.add(field, Some(position), ViolationKind::PeriodConflict { with: other.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn period(item_id: Ulid, from: Option<Day>, to: Option<Day>) -> CalendarPeriod {
        CalendarPeriod {
            id: Ulid::new(),
            from,
            to,
            item_type: ItemType::BookingRoom,
            item_id,
            item_root_id: None,
            season_id: None,
        }
    }

    fn stored(periods: Vec<CalendarPeriod>) -> HashMap<Ulid, ItemCalendar> {
        let mut map: HashMap<Ulid, ItemCalendar> = HashMap::new();
        for p in periods {
            map.entry(p.item_id)
                .or_insert_with(|| ItemCalendar::new(p.item_id))
                .insert(p);
        }
        map
    }

    fn conflicts(store: &HashMap<Ulid, ItemCalendar>, candidates: &[&CalendarPeriod]) -> ValidationErrors {
        let list: Vec<Candidate<'_>> = candidates.iter().copied().enumerate().collect();
        let mut report = ValidationErrors::new();
        check_conflicts(|id| store.get(id), &list, CHECK_TYPES, &HashSet::new(), "periods", &mut report);
        report
    }

    #[test]
    fn existence_collects_every_failure() {
        let room = Ulid::new();
        let missing_from = period(room, None, Some(3));
        let inverted = period(room, Some(5), Some(5));
        let fine = period(room, Some(1), Some(2));
        let missing_both = period(room, None, None);
        let list = [(0, &missing_from), (1, &inverted), (2, &fine), (3, &missing_both)];

        let mut report = ValidationErrors::new();
        check_existence(&list, "periods", &mut report);
        let kinds: Vec<_> = report
            .field("periods")
            .iter()
            .map(|v| (v.position, v.kind.clone()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (Some(0), ViolationKind::MissingPeriod),
                (Some(1), ViolationKind::InvalidRange),
                (Some(3), ViolationKind::MissingPeriod),
            ]
        );
    }

    #[test]
    fn from_after_to_is_rejected() {
        for (from, to) in [(3, 2), (0, 0), (10, -10)] {
            let p = period(Ulid::new(), Some(from), Some(to));
            let mut report = ValidationErrors::new();
            check_existence(&[(0, &p)], "periods", &mut report);
            assert_eq!(report.len(), 1, "{from}..{to}");
        }
    }

    #[test]
    fn adjacent_periods_do_not_conflict() {
        let room = Ulid::new();
        let store = stored(vec![period(room, Some(0), Some(10))]);
        let next = period(room, Some(10), Some(20));
        assert!(conflicts(&store, &[&next]).is_empty());
    }

    #[test]
    fn overlapping_periods_conflict() {
        let room = Ulid::new();
        let existing = period(room, Some(0), Some(10));
        let store = stored(vec![existing.clone()]);
        let cand = period(room, Some(5), Some(15));
        let report = conflicts(&store, &[&cand]);
        assert_eq!(
            report.field("periods")[0].kind,
            ViolationKind::PeriodConflict { with: existing.id }
        );
    }

    #[test]
    fn other_rooms_do_not_conflict() {
        let store = stored(vec![period(Ulid::new(), Some(0), Some(10))]);
        let cand = period(Ulid::new(), Some(0), Some(10));
        assert!(conflicts(&store, &[&cand]).is_empty());
    }

    #[test]
    fn candidate_never_conflicts_with_itself() {
        let room = Ulid::new();
        let existing = period(room, Some(0), Some(10));
        let store = stored(vec![existing.clone()]);
        assert!(conflicts(&store, &[&existing]).is_empty());
    }

    #[test]
    fn excluded_periods_are_ignored() {
        let room = Ulid::new();
        let existing = period(room, Some(0), Some(10));
        let store = stored(vec![existing.clone()]);
        let cand = period(room, Some(2), Some(4));
        let list = [(0, &cand)];
        let mut report = ValidationErrors::new();
        let excluded = HashSet::from([existing.id]);
        check_conflicts(|id| store.get(id), &list, CHECK_TYPES, &excluded, "periods", &mut report);
        assert!(report.is_empty());
    }

    #[test]
    fn unchecked_types_are_ignored() {
        let room = Ulid::new();
        let mut block = period(room, Some(0), Some(10));
        block.item_type = ItemType::BookingBlock;
        let store = stored(vec![block]);
        let cand = period(room, Some(0), Some(10));
        let list = [(0, &cand)];
        let mut report = ValidationErrors::new();
        check_conflicts(
            |id| store.get(id),
            &list,
            &[ItemType::BookingRoom],
            &HashSet::new(),
            "periods",
            &mut report,
        );
        assert!(report.is_empty());
    }

    #[test]
    fn blocks_are_checked_by_default() {
        let room = Ulid::new();
        let mut block = period(room, Some(0), Some(10));
        block.item_type = ItemType::BookingBlock;
        let store = stored(vec![block]);
        let cand = period(room, Some(9), Some(12));
        assert_eq!(conflicts(&store, &[&cand]).len(), 1);
    }

    #[test]
    fn overlapping_siblings_conflict() {
        let room = Ulid::new();
        let store = stored(Vec::new());
        let first = period(room, Some(0), Some(5));
        let second = period(room, Some(4), Some(8));
        let report = conflicts(&store, &[&first, &second]);
        assert_eq!(report.len(), 1);
        assert_eq!(report.field("periods")[0].position, Some(1));
    }

    #[test]
    fn malformed_candidates_skip_conflict_check() {
        let room = Ulid::new();
        let store = stored(vec![period(room, Some(0), Some(10))]);
        let cand = period(room, None, Some(4));
        assert!(conflicts(&store, &[&cand]).is_empty());
    }
}
