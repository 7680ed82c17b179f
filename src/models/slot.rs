use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%A, %B %d, %Y"];
const TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M%p", "%I:%M:%S %p"];

/// A bookable appointment time at one location.
///
/// Two slots are the same slot iff their `raw_key`s are equal. The key is derived once at
/// construction from fixed-width date/time formatting, so distinct (location, date, time)
/// tuples never share a key. A serialized key is ignored on the way back in.
#[derive(Debug, Clone, Serialize, Deserialize, Eq)]
#[serde(from = "SlotFields")]
pub struct AppointmentSlot {
    pub location_id: u32,
    pub date: NaiveDate,
    pub time: NaiveTime,
    raw_key: String,
}

impl AppointmentSlot {
    pub fn new(location_id: u32, date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            location_id,
            date,
            time,
            raw_key: Self::key_for(location_id, date, time),
        }
    }

    pub fn key_for(location_id: u32, date: NaiveDate, time: NaiveTime) -> String {
        format!(
            "{}|{}|{}",
            location_id,
            date.format("%Y-%m-%d"),
            time.format("%H:%M:%S")
        )
    }

    pub fn raw_key(&self) -> &str {
        &self.raw_key
    }

    /// Human-readable summary, e.g. `2024-06-10 10:00`.
    pub fn display_time(&self) -> String {
        format!("{} {}", self.date.format("%Y-%m-%d"), self.time.format("%H:%M"))
    }
}

#[derive(Deserialize)]
struct SlotFields {
    location_id: u32,
    date: NaiveDate,
    time: NaiveTime,
}

impl From<SlotFields> for AppointmentSlot {
    fn from(fields: SlotFields) -> Self {
        AppointmentSlot::new(fields.location_id, fields.date, fields.time)
    }
}

impl PartialEq for AppointmentSlot {
    fn eq(&self, other: &Self) -> bool {
        self.raw_key == other.raw_key
    }
}

impl Hash for AppointmentSlot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw_key.hash(state);
    }
}

pub fn parse_slot_date(input: &str) -> Option<NaiveDate> {
    let trimmed = input.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

pub fn parse_slot_time(input: &str) -> Option<NaiveTime> {
    let normalized = input.trim().to_uppercase();
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(&normalized, format).ok())
}

/// One availability entry as the site reports it, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSlotEntry {
    #[serde(alias = "Date", alias = "appointmentDate", alias = "day")]
    pub date: String,
    #[serde(alias = "Time", alias = "startTime", alias = "start")]
    pub time: String,
}

/// Normalized slots plus a count of entries that could not be understood.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub slots: Vec<AppointmentSlot>,
    pub skipped: usize,
}

impl Extraction {
    /// Normalize `(date, time)` text pairs; unparseable pairs are counted, duplicates collapsed.
    pub fn from_pairs<I, D, T>(location_id: u32, pairs: I) -> Self
    where
        I: IntoIterator<Item = (Option<D>, Option<T>)>,
        D: AsRef<str>,
        T: AsRef<str>,
    {
        let mut extraction = Extraction::default();
        let mut seen = HashSet::new();

        for (date, time) in pairs {
            let date = date.as_ref().and_then(|d| parse_slot_date(d.as_ref()));
            let time = time.as_ref().and_then(|t| parse_slot_time(t.as_ref()));
            match (date, time) {
                (Some(date), Some(time)) => {
                    let slot = AppointmentSlot::new(location_id, date, time);
                    if seen.insert(slot.raw_key().to_string()) {
                        extraction.slots.push(slot);
                    }
                }
                _ => extraction.skipped += 1,
            }
        }

        extraction
    }

    /// Normalize loosely-typed JSON entries, skipping any that do not carry a date and time.
    pub fn from_json_entries(location_id: u32, entries: &[serde_json::Value]) -> Self {
        Self::from_pairs(
            location_id,
            entries.iter().map(|entry| {
                match serde_json::from_value::<RawSlotEntry>(entry.clone()) {
                    Ok(raw) => (Some(raw.date), Some(raw.time)),
                    Err(_) => (None, None),
                }
            }),
        )
    }
}
