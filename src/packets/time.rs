//! The time-of-day packet. The NABU requests image 0x7FFFFF, segment 0, to
//! learn the wall-clock time; the reply is a 9-byte record wrapped in a
//! synthetic raw image.

use chrono::{DateTime, Datelike, Local, Timelike};

use super::IMAGE_TIME;
use crate::image::Image;

/// Length of the time record.
pub const TIME_SIZE: usize = 9;

/// Builds the synthetic "TimeImage" for the given instant.
///
/// The year byte is always 84: NABU software expects to live in 1984, and
/// only the calendar fields that repeat (weekday, month, day, time of day)
/// carry current values.
pub fn time_image(now: DateTime<Local>) -> Image {
    let record = [
        0x02,
        0x02,
        now.weekday().num_days_from_sunday() as u8 + 1,
        84,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ];
    Image::synthetic("TimeImage", IMAGE_TIME, record.to_vec())
}
