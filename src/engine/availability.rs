use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::calendar::{Schedule, TimeBlock};
use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────
//
// Recomputed from request records on every call. There is deliberately no
// stored availability to invalidate.

/// Blocks on `date` currently held by pending or confirmed requests.
pub fn held_blocks<'a>(
    date: NaiveDate,
    requests: impl IntoIterator<Item = &'a DiagnosticRequest>,
) -> HashSet<TimeBlock> {
    requests
        .into_iter()
        .filter_map(|r| r.held_slot())
        .filter(|(d, _)| *d == date)
        .map(|(_, block)| block)
        .collect()
}

/// Schedule blocks for `date` minus the blocks held by active requests, in
/// schedule order.
pub fn available_blocks<'a>(
    schedule: &Schedule,
    date: NaiveDate,
    requests: impl IntoIterator<Item = &'a DiagnosticRequest>,
) -> Vec<TimeBlock> {
    let held = held_blocks(date, requests);
    schedule
        .blocks_for(date)
        .iter()
        .filter(|b| !held.contains(b))
        .copied()
        .collect()
}

/// Dates in the horizon starting at `today` with at least one free block.
///
/// A held block only counts against a date if it is part of that date's
/// current template, so a schedule change never makes a date look fuller
/// than it is.
pub fn available_dates<'a>(
    schedule: &Schedule,
    today: NaiveDate,
    requests: impl IntoIterator<Item = &'a DiagnosticRequest>,
) -> Vec<NaiveDate> {
    let mut held: HashMap<NaiveDate, HashSet<TimeBlock>> = HashMap::new();
    for (date, block) in requests.into_iter().filter_map(|r| r.held_slot()) {
        held.entry(date).or_default().insert(block);
    }

    schedule
        .horizon_dates(today)
        .filter(|date| {
            let template = schedule.blocks_for(*date);
            let taken = held
                .get(date)
                .map_or(0, |h| template.iter().filter(|b| h.contains(b)).count());
            taken < template.len()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    // 2026-10-20 is a Tuesday, 2026-10-24 a Saturday, 2026-10-25 a Sunday.
    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn request(on: NaiveDate, block: TimeBlock) -> DiagnosticRequest {
        DiagnosticRequest::submitted(
            NewRequest {
                id: Ulid::new(),
                vehicle_id: Ulid::new(),
                requester_id: Ulid::new(),
                date: on,
                block,
                category: "engine".into(),
                priority: Priority::Normal,
                notes: None,
                attachments: vec![],
            },
            0,
        )
    }

    #[test]
    fn free_day_offers_whole_template() {
        let s = Schedule::default();
        let blocks = available_blocks(&s, date(20), &[]);
        assert_eq!(blocks, s.blocks_for(date(20)));
    }

    #[test]
    fn held_blocks_are_removed_in_order() {
        let s = Schedule::default();
        let template = s.blocks_for(date(20)).to_vec();
        let reqs = vec![request(date(20), template[1]), request(date(21), template[0])];
        let blocks = available_blocks(&s, date(20), &reqs);
        assert_eq!(blocks, vec![template[0], template[2], template[3]]);
    }

    #[test]
    fn rejected_requests_free_their_block() {
        let s = Schedule::default();
        let block = s.blocks_for(date(20))[0];
        let mut req = request(date(20), block);
        req.status = RequestStatus::Rejected;
        assert!(available_blocks(&s, date(20), [&req]).contains(&block));
    }

    #[test]
    fn confirmed_request_holds_its_confirmed_block() {
        let s = Schedule::default();
        let template = s.blocks_for(date(20)).to_vec();
        let mut req = request(date(20), template[0]);
        req.status = RequestStatus::Confirmed;
        req.confirmed_date = Some(date(20));
        req.confirmed_block = Some(template[2]);
        let blocks = available_blocks(&s, date(20), [&req]);
        assert!(blocks.contains(&template[0]));
        assert!(!blocks.contains(&template[2]));
    }

    #[test]
    fn full_tuesday_drops_out_of_available_dates() {
        let s = Schedule::default();
        let today = date(19);
        let reqs: Vec<_> = s
            .blocks_for(date(20))
            .iter()
            .map(|b| request(date(20), *b))
            .collect();
        assert!(available_blocks(&s, date(20), &reqs).is_empty());
        let dates = available_dates(&s, today, &reqs);
        assert!(!dates.contains(&date(20)));
        assert!(dates.contains(&date(21)));
    }

    #[test]
    fn closed_sunday_never_available() {
        let s = Schedule::default();
        let dates = available_dates(&s, date(19), &[]);
        assert!(!dates.contains(&date(25)));
        assert!(dates.contains(&date(24)));
    }

    #[test]
    fn off_template_hold_does_not_fill_a_date() {
        let s = Schedule::default();
        let saturday = date(24);
        // Saturday template has two blocks; an afternoon hold is not one of them.
        let reqs = vec![
            request(saturday, s.blocks_for(saturday)[0]),
            request(saturday, TimeBlock::new(14 * 60, 16 * 60)),
        ];
        assert!(available_dates(&s, date(19), &reqs).contains(&saturday));
    }
}
