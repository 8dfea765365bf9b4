//! Timestamp and calendar-date wrappers with their cbor encodings and the
//! fixed textual formats used on the wire.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

pub const DEFAULT_ZONE: Tz = chrono_tz::Europe::Madrid;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimeStamp<T: TimeZone>(pub DateTime<T>)
where
    T::Offset: Copy;

impl TimeStamp<Utc> {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl TimeStamp<FixedOffset> {
    pub fn to_datetime(&self) -> DateTime<FixedOffset> {
        self.0
    }
    /// `YYYY-MM-DDTHH:MM:SS+HH:MM`, the offset is always numeric.
    pub fn to_wire(&self) -> String {
        format_generation_timestamp(&self.0)
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T>
where
    T::Offset: Copy,
{
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}
impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

// offset-carrying timestamps keep the offset they were sealed with
impl<C> minicbor::Encode<C> for TimeStamp<FixedOffset> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let Some(nsec) = self.0.timestamp_nanos_opt() else {
            return Err(minicbor::encode::Error::message(
                "failed to encode timestamp. timestamp_nanos_opt returned None",
            ));
        };
        e.array(2)?
            .i64(nsec)?
            .i32(self.0.offset().local_minus_utc())?
            .ok()
    }
}
impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<FixedOffset> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        d.array()?;
        let nsecs = d.i64()?;
        let offset = FixedOffset::east_opt(d.i32()?)
            .ok_or_else(|| minicbor::decode::Error::message("utc offset out of range"))?;

        Ok(TimeStamp(
            DateTime::from_timestamp_nanos(nsecs).with_timezone(&offset),
        ))
    }
}

/// Issue dates carry no time of day.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct CalendarDate(pub NaiveDate);

impl CalendarDate {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(CalendarDate)
    }
    /// `DD-MM-YYYY`
    pub fn to_wire(&self) -> String {
        format_issue_date(self.0)
    }
}

impl<C> minicbor::Encode<C> for CalendarDate {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i32(self.0.num_days_from_ce())?.ok()
    }
}
impl<'b, C> minicbor::Decode<'b, C> for CalendarDate {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let days = d.i32()?;
        NaiveDate::from_num_days_from_ce_opt(days)
            .map(CalendarDate)
            .ok_or_else(|| minicbor::decode::Error::message("calendar date out of range"))
    }
}

pub fn format_issue_date(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

pub fn format_generation_timestamp(at: &DateTime<FixedOffset>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

/// Resolves a tenant zone name, falling back to Europe/Madrid when the name is
/// absent or unknown.
pub fn resolve_zone(name: Option<&str>) -> Tz {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => match name.parse::<Tz>() {
            Ok(zone) => zone,
            Err(_) => {
                tracing::warn!(zone = name, "unknown time zone, using {}", DEFAULT_ZONE);
                DEFAULT_ZONE
            }
        },
        None => DEFAULT_ZONE,
    }
}

/// Projects an instant into the tenant zone, keeping the resulting numeric offset.
pub fn local_timestamp(at: DateTime<Utc>, zone: Tz) -> TimeStamp<FixedOffset> {
    TimeStamp(at.with_timezone(&zone).fixed_offset())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::now();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn offset_timestamp_keeps_its_offset() {
        let at = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap();
        let local = local_timestamp(at, DEFAULT_ZONE);
        let encoding = minicbor::to_vec(local).unwrap();
        let decode: TimeStamp<FixedOffset> = minicbor::decode(&encoding).unwrap();

        assert_eq!(decode.to_wire(), "2025-07-01T12:00:00+02:00");
        assert_eq!(decode.to_wire(), local.to_wire());
    }

    #[test]
    fn winter_offset_and_utc_are_numeric() {
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 23, 30, 5).unwrap();
        assert_eq!(
            local_timestamp(at, DEFAULT_ZONE).to_wire(),
            "2025-01-16T00:30:05+01:00"
        );
        assert_eq!(
            local_timestamp(at, chrono_tz::UTC).to_wire(),
            "2025-01-15T23:30:05+00:00"
        );
    }

    #[test]
    fn zone_fallback() {
        assert_eq!(resolve_zone(None), DEFAULT_ZONE);
        assert_eq!(resolve_zone(Some("Mars/Olympus")), DEFAULT_ZONE);
        assert_eq!(resolve_zone(Some("Atlantic/Canary")), chrono_tz::Atlantic::Canary);
    }

    #[test]
    fn calendar_date_format_and_encoding() {
        let date = CalendarDate::from_ymd(2025, 3, 9).unwrap();
        assert_eq!(date.to_wire(), "09-03-2025");
        let decoded: CalendarDate = minicbor::decode(&minicbor::to_vec(date).unwrap()).unwrap();
        assert_eq!(decoded, date);
    }
}
