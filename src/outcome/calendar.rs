use serde::{Deserialize, Serialize};

const DEFAULT_DURATION_MINUTES: u32 = 90;

/// Structured booking extracted from a call transcript.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingDetails {
    pub confirmed: bool,
    #[serde(default)]
    pub restaurant: Option<String>,
    /// YYYY-MM-DD
    #[serde(default)]
    pub date: Option<String>,
    /// HH:MM
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub guest_count: Option<u32>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Google Calendar TEMPLATE URL for a confirmed booking.
///
/// Times are treated as wall-clock Europe/Moscow components; the end time is
/// computed with integer minute arithmetic (carrying day overflow), never
/// through the host time zone.
pub fn calendar_url(booking: &BookingDetails) -> Option<String> {
    if !booking.confirmed {
        return None;
    }

    let (year, month, day) = parse_date(booking.date.as_deref()?)?;
    let (hour, minute) = parse_time(booking.time.as_deref()?)?;

    let duration = booking.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES);
    let start = format!("{year:04}{month:02}{day:02}T{hour:02}{minute:02}00");
    let (ey, emo, ed, eh, emi) = add_minutes(year, month, day, hour, minute, duration);
    let end = format!("{ey:04}{emo:02}{ed:02}T{eh:02}{emi:02}00");

    let title = booking_title(booking);
    let location = booking
        .address
        .as_deref()
        .or(booking.restaurant.as_deref())
        .unwrap_or("");

    let mut url = String::from("https://calendar.google.com/calendar/render?action=TEMPLATE");
    url.push_str(&format!("&text={}", urlencoded(&title)));
    url.push_str(&format!("&dates={start}/{end}"));
    url.push_str("&ctz=Europe/Moscow");
    if !location.is_empty() {
        url.push_str(&format!("&location={}", urlencoded(location)));
    }
    if let Some(ref notes) = booking.notes {
        if !notes.is_empty() {
            url.push_str(&format!("&details={}", urlencoded(notes)));
        }
    }

    Some(url)
}

/// `"Бронь: "` plus the comma-joined nonempty parts, or the generic title.
fn booking_title(booking: &BookingDetails) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(ref restaurant) = booking.restaurant {
        if !restaurant.is_empty() {
            parts.push(restaurant.clone());
        }
    }
    if let Some(ref name) = booking.guest_name {
        if !name.is_empty() {
            parts.push(format!("на имя {name}"));
        }
    }
    if let Some(count) = booking.guest_count {
        parts.push(format!("{count} чел."));
    }

    if parts.is_empty() {
        "Бронирование столика".to_string()
    } else {
        format!("Бронь: {}", parts.join(", "))
    }
}

fn parse_date(date: &str) -> Option<(u32, u32, u32)> {
    let mut parts = date.split('-');
    let year: u32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    if !(1..=12).contains(&month) || day < 1 || day > days_in_month(year, month) || year < 1000 {
        return None;
    }
    Some((year, month, day))
}

fn parse_time(time: &str) -> Option<(u32, u32)> {
    let (h, m) = time.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Pure wall-clock minute addition with day/month/year carry.
fn add_minutes(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    add: u32,
) -> (u32, u32, u32, u32, u32) {
    let total = hour * 60 + minute + add;
    let (mut year, mut month, mut day) = (year, month, day);
    let mut day_carry = total / (24 * 60);
    let rem = total % (24 * 60);

    while day_carry > 0 {
        day += 1;
        if day > days_in_month(year, month) {
            day = 1;
            month += 1;
            if month > 12 {
                month = 1;
                year += 1;
            }
        }
        day_carry -= 1;
    }

    (year, month, day, rem / 60, rem % 60)
}

fn days_in_month(year: u32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => 0,
    }
}

/// Percent-encode every byte outside the unreserved set, Cyrillic included.
fn urlencoded(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                String::from(b as char)
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_booking() -> BookingDetails {
        BookingDetails {
            confirmed: true,
            restaurant: Some("Белуга".into()),
            date: Some("2025-02-25".into()),
            time: Some("23:00".into()),
            duration_minutes: Some(120),
            guest_name: Some("Елена".into()),
            guest_count: Some(4),
            address: Some("ул. Пушкина, д. 10".into()),
            notes: None,
        }
    }

    fn percent_decode(s: &str) -> String {
        let bytes = s.as_bytes();
        let mut out = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' && i + 2 < bytes.len() {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
                out.push(u8::from_str_radix(hex, 16).unwrap());
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn late_booking_carries_into_next_day() {
        let url = calendar_url(&full_booking()).unwrap();
        assert!(url.contains("dates=20250225T230000/20250226T010000"));
        assert!(url.contains("ctz=Europe/Moscow"));
        assert!(url.contains("action=TEMPLATE"));
    }

    #[test]
    fn title_joins_nonempty_parts() {
        let url = calendar_url(&full_booking()).unwrap();
        let text = url
            .split("&text=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        assert_eq!(percent_decode(text), "Бронь: Белуга, на имя Елена, 4 чел.");
    }

    #[test]
    fn location_prefers_address() {
        let url = calendar_url(&full_booking()).unwrap();
        let location = url
            .split("&location=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        assert_eq!(percent_decode(location), "ул. Пушкина, д. 10");

        let mut booking = full_booking();
        booking.address = None;
        let url = calendar_url(&booking).unwrap();
        let location = url
            .split("&location=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        assert_eq!(percent_decode(location), "Белуга");
    }

    #[test]
    fn no_raw_non_ascii_in_url() {
        let url = calendar_url(&full_booking()).unwrap();
        assert!(url.is_ascii(), "URL must be fully percent-encoded: {url}");
    }

    #[test]
    fn duration_defaults_to_90_minutes() {
        let mut booking = full_booking();
        booking.duration_minutes = None;
        booking.time = Some("20:00".into());
        let url = calendar_url(&booking).unwrap();
        assert!(url.contains("dates=20250225T200000/20250225T213000"));
    }

    #[test]
    fn month_and_year_carry() {
        let mut booking = full_booking();
        booking.date = Some("2024-12-31".into());
        booking.time = Some("23:30".into());
        booking.duration_minutes = Some(60);
        let url = calendar_url(&booking).unwrap();
        assert!(url.contains("dates=20241231T233000/20250101T003000"));
    }

    #[test]
    fn leap_february_carry() {
        let mut booking = full_booking();
        booking.date = Some("2024-02-28".into());
        booking.time = Some("23:00".into());
        booking.duration_minutes = Some(120);
        let url = calendar_url(&booking).unwrap();
        // 2024 is a leap year: Feb 29 exists.
        assert!(url.contains("dates=20240228T230000/20240229T010000"));

        booking.date = Some("2025-02-28".into());
        let url = calendar_url(&booking).unwrap();
        assert!(url.contains("dates=20250228T230000/20250301T010000"));
    }

    #[test]
    fn unconfirmed_or_malformed_booking_yields_no_url() {
        let mut booking = full_booking();
        booking.confirmed = false;
        assert!(calendar_url(&booking).is_none());

        let mut booking = full_booking();
        booking.date = Some("25.02.2025".into());
        assert!(calendar_url(&booking).is_none());

        let mut booking = full_booking();
        booking.time = Some("8pm".into());
        assert!(calendar_url(&booking).is_none());

        let mut booking = full_booking();
        booking.date = None;
        assert!(calendar_url(&booking).is_none());

        let mut booking = full_booking();
        booking.time = Some("25:00".into());
        assert!(calendar_url(&booking).is_none());

        let mut booking = full_booking();
        booking.date = Some("2025-02-30".into());
        assert!(calendar_url(&booking).is_none());
    }

    #[test]
    fn generic_title_when_no_parts() {
        let booking = BookingDetails {
            confirmed: true,
            date: Some("2025-03-01".into()),
            time: Some("12:00".into()),
            ..Default::default()
        };
        let url = calendar_url(&booking).unwrap();
        let text = url
            .split("&text=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        assert_eq!(percent_decode(text), "Бронирование столика");
    }

    #[test]
    fn parsed_interval_matches_duration() {
        for duration in [30u32, 90, 120, 240] {
            let mut booking = full_booking();
            booking.duration_minutes = Some(duration);
            booking.time = Some("10:15".into());
            let url = calendar_url(&booking).unwrap();

            let dates = url
                .split("&dates=")
                .nth(1)
                .unwrap()
                .split('&')
                .next()
                .unwrap();
            let (start, end) = dates.split_once('/').unwrap();

            let minutes = |stamp: &str| -> u32 {
                let h: u32 = stamp[9..11].parse().unwrap();
                let m: u32 = stamp[11..13].parse().unwrap();
                let d: u32 = stamp[6..8].parse().unwrap();
                d * 24 * 60 + h * 60 + m
            };
            assert_eq!(minutes(end) - minutes(start), duration);
        }
    }
}
