use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

use crate::domain::{VehicleId, VehicleRecord};

/// Result of a focus update or rotation tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    /// Focus stays where it was (possibly redrawn)
    Kept(VehicleId),
    Moved {
        from: Option<VehicleId>,
        to: VehicleId,
    },
    /// Nothing to show
    Cleared,
    /// The charger reports cars charging that no known vehicle accounts for
    RefreshNeeded,
}

/// Which vehicle the car tile shows, rotating among the vehicles of interest
#[derive(Debug, Clone, Default, Serialize)]
pub struct VehicleFocus {
    display: Vec<VehicleId>,
    focused: Option<VehicleId>,
    num_charging: u32,
}

impl VehicleFocus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn focused(&self) -> Option<VehicleId> {
        self.focused
    }

    pub fn displayed(&self) -> &[VehicleId] {
        &self.display
    }

    pub fn num_charging(&self) -> u32 {
        self.num_charging
    }

    /// Apply a new candidate set. Returns `None` when neither the set nor
    /// the charging count changed.
    pub fn update(&mut self, candidates: Vec<VehicleId>, num_charging: u32) -> Option<FocusChange> {
        if candidates == self.display && num_charging == self.num_charging {
            return None;
        }
        self.display = candidates;
        self.num_charging = num_charging;

        match self.focused {
            Some(id) if self.display.contains(&id) => Some(FocusChange::Kept(id)),
            _ => Some(self.advance()),
        }
    }

    /// Periodic rotation to the next displayed vehicle
    pub fn tick(&mut self) -> FocusChange {
        self.advance()
    }

    /// Focus something if nothing is focused yet
    pub fn ensure_focus(&mut self) -> Option<FocusChange> {
        if self.focused.is_some() && !self.display.is_empty() {
            return None;
        }
        Some(self.advance())
    }

    fn advance(&mut self) -> FocusChange {
        if self.display.is_empty() {
            // The tile keeps its vehicle until the refresh identifies the charging ones
            if self.num_charging > 0 {
                debug!(num_charging = self.num_charging, "charging vehicles not identified");
                return FocusChange::RefreshNeeded;
            }
            self.focused = None;
            return FocusChange::Cleared;
        }
        let next = match self.focused.and_then(|id| self.display.iter().position(|v| *v == id)) {
            Some(i) => (i + 1) % self.display.len(),
            None => 0,
        };
        let to = self.display[next];
        let from = self.focused.replace(to);
        if from == Some(to) {
            FocusChange::Kept(to)
        } else {
            FocusChange::Moved { from, to }
        }
    }
}

/// Vehicles worth showing while the charger reports `vins` charging.
///
/// VIN-matched vehicles come first ordered by ascending state of charge;
/// if no VIN is recognised, every vehicle whose last charge state is
/// "Charging" is used instead.
pub fn charging_candidates(vehicles: &[VehicleRecord], vins: &[String]) -> Vec<VehicleId> {
    let mut matched: Vec<&VehicleRecord> = vins
        .iter()
        .filter_map(|vin| vehicles.iter().find(|v| &v.identity.vin == vin))
        .collect();

    if matched.is_empty() {
        return vehicles.iter().filter(|v| v.is_charging()).map(|v| v.id()).collect();
    }

    // Known SOC first, then charge data without SOC, then no charge data
    let rank = |v: &VehicleRecord| match (v.soc(), v.charge.is_some()) {
        (Some(_), _) => 0,
        (None, true) => 1,
        (None, false) => 2,
    };
    matched.sort_by(|a, b| {
        rank(*a).cmp(&rank(*b)).then_with(|| match (a.soc(), b.soc()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => Ordering::Equal,
        })
    });
    matched.into_iter().map(|v| v.id()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChargeState, ChargingState, VehicleIdentity};

    const A: VehicleId = 1;
    const B: VehicleId = 2;
    const C: VehicleId = 3;

    fn record(id: VehicleId, state: Option<ChargingState>, soc: Option<f64>) -> VehicleRecord {
        let mut record = VehicleRecord::new(VehicleIdentity {
            id,
            vin: format!("VIN{id}"),
            display_name: format!("Car {id}"),
        });
        if state.is_some() || soc.is_some() {
            record.charge = Some(ChargeState {
                state,
                soc,
                ..Default::default()
            });
        }
        record
    }

    #[test]
    fn test_rotation_cycles_in_order() {
        let mut focus = VehicleFocus::new();
        assert_eq!(
            focus.update(vec![A, B, C], 0),
            Some(FocusChange::Moved { from: None, to: A })
        );
        let mut seen = vec![focus.focused().unwrap()];
        for _ in 0..6 {
            focus.tick();
            seen.push(focus.focused().unwrap());
        }
        assert_eq!(seen, vec![A, B, C, A, B, C, A]);
    }

    #[test]
    fn test_unchanged_set_is_ignored() {
        let mut focus = VehicleFocus::new();
        focus.update(vec![A, B], 1);
        assert_eq!(focus.update(vec![A, B], 1), None);
        assert_eq!(focus.focused(), Some(A));
    }

    #[test]
    fn test_focus_kept_when_still_present() {
        let mut focus = VehicleFocus::new();
        focus.update(vec![A, B], 0);
        focus.tick();
        assert_eq!(focus.focused(), Some(B));
        assert_eq!(focus.update(vec![B, C], 1), Some(FocusChange::Kept(B)));
    }

    #[test]
    fn test_focus_moves_when_vehicle_leaves() {
        let mut focus = VehicleFocus::new();
        focus.update(vec![A, B], 0);
        assert_eq!(
            focus.update(vec![C], 1),
            Some(FocusChange::Moved { from: Some(A), to: C })
        );
    }

    #[test]
    fn test_single_vehicle_tick_keeps_focus() {
        let mut focus = VehicleFocus::new();
        focus.update(vec![A], 1);
        assert_eq!(focus.tick(), FocusChange::Kept(A));
    }

    #[test]
    fn test_unidentified_charging_requests_refresh() {
        let mut focus = VehicleFocus::new();
        focus.update(vec![A], 0);
        assert_eq!(focus.update(vec![], 1), Some(FocusChange::RefreshNeeded));
        assert_eq!(focus.focused(), Some(A));
        assert_eq!(focus.tick(), FocusChange::RefreshNeeded);
        assert_eq!(focus.focused(), Some(A));

        // Once the charging vehicle is identified the focus moves on
        assert_eq!(
            focus.update(vec![B], 1),
            Some(FocusChange::Moved { from: Some(A), to: B })
        );
    }

    #[test]
    fn test_empty_without_charging_clears() {
        let mut focus = VehicleFocus::new();
        assert_eq!(focus.ensure_focus(), Some(FocusChange::Cleared));
        focus.update(vec![A], 0);
        assert_eq!(focus.ensure_focus(), None);
    }

    #[test]
    fn test_candidates_by_vin_sorted_by_soc() {
        let vehicles = vec![
            record(A, Some(ChargingState::Charging), Some(80.0)),
            record(B, None, None),
            record(C, Some(ChargingState::Charging), Some(40.0)),
        ];
        let vins = vec!["VIN1".to_string(), "VIN2".to_string(), "VIN3".to_string(), "UNKNOWN".to_string()];
        assert_eq!(charging_candidates(&vehicles, &vins), vec![C, A, B]);
    }

    #[test]
    fn test_candidates_fall_back_to_charging_state() {
        let vehicles = vec![
            record(A, Some(ChargingState::Complete), Some(80.0)),
            record(B, Some(ChargingState::Charging), Some(20.0)),
        ];
        assert_eq!(charging_candidates(&vehicles, &["OTHER".to_string()]), vec![B]);
        assert_eq!(charging_candidates(&vehicles, &[]), vec![B]);
    }
}
