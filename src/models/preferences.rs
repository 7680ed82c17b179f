use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::models::AppointmentSlot;

/// Which slots the user wants to hear about. All bounds are inclusive; a missing bound is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePreferences {
    pub date_range_start: Option<NaiveDate>,
    pub date_range_end: Option<NaiveDate>,
    pub time_window_start: Option<NaiveTime>,
    pub time_window_end: Option<NaiveTime>,
}

impl TimePreferences {
    pub fn matches(&self, slot: &AppointmentSlot) -> bool {
        self.date_in_range(slot.date) && self.time_in_window(slot.time)
    }

    pub fn date_in_range(&self, date: NaiveDate) -> bool {
        self.date_range_start.is_none_or(|start| date >= start)
            && self.date_range_end.is_none_or(|end| date <= end)
    }

    pub fn time_in_window(&self, time: NaiveTime) -> bool {
        self.time_window_start.is_none_or(|start| time >= start)
            && self.time_window_end.is_none_or(|end| time <= end)
    }
}
