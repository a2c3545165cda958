//! Cached construction of the human-readable timestamp prefix.
//!
//! Building `2015-07-15T14:53:51.979+0200` from scratch means a calendar
//! conversion on every message. The calendar only changes once a day, so the
//! cache keeps the date string, the timezone string and the unix second of
//! local midnight; each message then needs only integer splits of
//! seconds-since-midnight. The rebuild path goes through `chrono`; the hot
//! path never does.
//!
//! The timezone offset is sampled at rebuild time, which means a DST change
//! mid-day is picked up at the next midnight. That matches the archive
//! design: human prefixes are local and approximate, archive names are UTC
//! and totally ordered.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, Timelike};

/// Length of the rendered timestamp: `YYYY-MM-DDTHH:MM:SS.mmm±HHMM`.
pub(crate) const TIMESTAMP_LEN: usize = 28;

const SECS_PER_DAY: i64 = 86_400;

pub(crate) struct TimeKeeper {
    cache: Mutex<DayCache>,
}

struct DayCache {
    /// Unix seconds, shifted into the local zone, of the cached day's start.
    day_start: i64,
    date: [u8; 10],
    tz: [u8; 5],
    utc_offset_secs: i64,
}

impl TimeKeeper {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(DayCache {
                day_start: 0,
                date: *b"0000-00-00",
                tz: *b"+0000",
                utc_offset_secs: 0,
            }),
        }
    }

    /// Writes the 28-byte timestamp for "now" into the front of `buf`.
    pub fn format_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= TIMESTAMP_LEN);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let unix_secs = now.as_secs() as i64;
        let millis = now.subsec_millis();

        let mut cache = self.cache.lock().unwrap();
        let mut local_secs = unix_secs + cache.utc_offset_secs;
        if local_secs < cache.day_start || local_secs - cache.day_start >= SECS_PER_DAY {
            cache.rebuild();
            local_secs = unix_secs + cache.utc_offset_secs;
        }
        let of_day = (local_secs - cache.day_start).clamp(0, SECS_PER_DAY - 1) as u32;

        buf[..10].copy_from_slice(&cache.date);
        buf[10] = b'T';
        format_uint_decimal(&mut buf[11..13], of_day / 3600);
        buf[13] = b':';
        format_uint_decimal(&mut buf[14..16], (of_day / 60) % 60);
        buf[16] = b':';
        format_uint_decimal(&mut buf[17..19], of_day % 60);
        buf[19] = b'.';
        format_uint_decimal(&mut buf[20..23], millis);
        buf[23..TIMESTAMP_LEN].copy_from_slice(&cache.tz);
    }
}

impl DayCache {
    fn rebuild(&mut self) {
        let now = Local::now();
        let offset = i64::from(now.offset().local_minus_utc());
        self.utc_offset_secs = offset;
        self.day_start = now.timestamp() + offset - i64::from(now.num_seconds_from_midnight());
        self.date
            .copy_from_slice(now.format("%Y-%m-%d").to_string().as_bytes());
        let (sign, abs) = if offset < 0 { (b'-', -offset) } else { (b'+', offset) };
        let minutes = (abs / 60) as u32;
        self.tz[0] = sign;
        format_uint_decimal(&mut self.tz[1..3], minutes / 60);
        format_uint_decimal(&mut self.tz[3..5], minutes % 60);
    }
}

/// Fixed-width zero-padded decimal, most significant digit first.
pub(crate) fn format_uint_decimal(buf: &mut [u8], mut v: u32) {
    for slot in buf.iter_mut().rev() {
        *slot = b'0' + (v % 10) as u8;
        v /= 10;
    }
}

/// Fixed-width lowercase hex, most significant digit first.
pub(crate) fn format_uint_hex(buf: &mut [u8], mut v: u32) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    for slot in buf.iter_mut().rev() {
        *slot = DIGITS[(v & 0xf) as usize];
        v >>= 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_padding() {
        let mut buf = [0u8; 3];
        format_uint_decimal(&mut buf, 7);
        assert_eq!(&buf, b"007");
        format_uint_decimal(&mut buf, 979);
        assert_eq!(&buf, b"979");
        let mut two = [0u8; 2];
        format_uint_decimal(&mut two, 53);
        assert_eq!(&two, b"53");
    }

    #[test]
    fn hex_padding() {
        let mut buf = [0u8; 8];
        format_uint_hex(&mut buf, 0x1fdc);
        assert_eq!(&buf, b"00001fdc");
        format_uint_hex(&mut buf, u32::MAX);
        assert_eq!(&buf, b"ffffffff");
    }

    #[test]
    fn timestamp_shape() {
        let tk = TimeKeeper::new();
        let mut buf = [0u8; TIMESTAMP_LEN];
        tk.format_into(&mut buf);

        assert_eq!(buf[4], b'-');
        assert_eq!(buf[7], b'-');
        assert_eq!(buf[10], b'T');
        assert_eq!(buf[13], b':');
        assert_eq!(buf[16], b':');
        assert_eq!(buf[19], b'.');
        assert!(buf[23] == b'+' || buf[23] == b'-');
        for &i in &[0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15, 17, 18, 20, 21, 22, 24, 25, 26, 27] {
            assert!(buf[i].is_ascii_digit(), "byte {i} is {:?}", buf[i] as char);
        }
        // Sanity: the cached date matches what chrono reports right now.
        let today = Local::now().format("%Y-%m-%d").to_string();
        assert_eq!(&buf[..10], today.as_bytes());
    }

    #[test]
    fn consecutive_formats_share_the_cached_day() {
        let tk = TimeKeeper::new();
        let mut a = [0u8; TIMESTAMP_LEN];
        let mut b = [0u8; TIMESTAMP_LEN];
        tk.format_into(&mut a);
        tk.format_into(&mut b);
        assert_eq!(&a[..10], &b[..10], "date is cached");
        assert_eq!(&a[23..], &b[23..], "timezone is cached");
    }
}
