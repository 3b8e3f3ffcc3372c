use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{ConflictRef, EngineError};

pub(crate) fn validate_instant(at: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// A window must end strictly after it starts; an open end is allowed only
/// where the caller passes `None`.
pub(crate) fn validate_window(end_field: &'static str, start: Ms, end: Option<Ms>) -> Result<Window, EngineError> {
    validate_instant(start)?;
    if let Some(end) = end {
        validate_instant(end)?;
        if end <= start {
            return Err(EngineError::validation(
                end_field,
                format!("{} is not after start {}", fmt_ms(end), fmt_ms(start)),
            ));
        }
    }
    Ok(Window::new(start, end))
}

pub(crate) fn validate_text(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::validation(field, format!("longer than {max} bytes")));
    }
    Ok(())
}

/// Live assignments and blocks of the vehicle overlapping `window`.
pub(crate) fn allocation_conflicts(
    tl: &VehicleTimeline,
    window: &Window,
    exclude: Option<Ulid>,
) -> Vec<ConflictRef> {
    let mut conflicts = Vec::new();
    for a in &tl.assignments {
        if Some(a.id) == exclude || !a.status.is_live() {
            continue;
        }
        if a.window().overlaps(window) {
            conflicts.push(ConflictRef {
                id: a.id,
                kind: "assignment",
                start: a.start_at,
                end: a.end_at,
            });
        }
    }
    for b in &tl.blocks {
        if Some(b.id) == exclude || !b.status.is_live() {
            continue;
        }
        if b.window().overlaps(window) {
            conflicts.push(ConflictRef {
                id: b.id,
                kind: "block",
                start: b.start_at,
                end: b.end_at,
            });
        }
    }
    conflicts
}

/// Calendar-blocking rentals of the vehicle overlapping `window`.
pub(crate) fn rental_conflicts(tl: &VehicleTimeline, window: &Window, exclude: Option<Ulid>) -> Vec<ConflictRef> {
    tl.rentals
        .iter()
        .filter(|r| Some(r.id) != exclude && r.status.blocks_calendar())
        .filter(|r| r.window().overlaps(window))
        .map(|r| ConflictRef {
            id: r.id,
            kind: "rental",
            start: r.planned_pickup_at,
            end: Some(r.planned_return_at),
        })
        .collect()
}

pub(crate) fn ensure_no_conflicts(conflicts: Vec<ConflictRef>) -> Result<(), EngineError> {
    if conflicts.is_empty() {
        Ok(())
    } else {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        Err(EngineError::Conflict { conflicts })
    }
}
