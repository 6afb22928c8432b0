//! Shared value types: day amounts, instants, and civil dates
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

const CENTI_PER_DAY: i64 = 100;

/// Signed quantity of leave days, held as hundredths of a day so that
/// ledger sums stay exact. Positive = credit, negative = debit.
#[derive(Debug, Default, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub struct DayAmount(i64);

impl DayAmount {
    pub const ZERO: DayAmount = DayAmount(0);

    pub fn days(whole: i64) -> Self {
        Self(whole * CENTI_PER_DAY)
    }
    pub fn centidays(centi: i64) -> Self {
        Self(centi)
    }
    pub fn as_centidays(&self) -> i64 {
        self.0
    }
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }
    /// Round to a whole number of days. Arithmetic rounds half away from
    /// zero, ceil rounds toward positive infinity, floor toward negative.
    pub fn round_to_whole(self, method: RoundingMethod) -> Self {
        let c = self.0;
        let rounded = match method {
            RoundingMethod::None => c,
            RoundingMethod::Arithmetic => {
                let half = CENTI_PER_DAY / 2;
                if c >= 0 {
                    ((c + half) / CENTI_PER_DAY) * CENTI_PER_DAY
                } else {
                    ((c - half) / CENTI_PER_DAY) * CENTI_PER_DAY
                }
            }
            RoundingMethod::Ceil => {
                if c >= 0 {
                    ((c + CENTI_PER_DAY - 1) / CENTI_PER_DAY) * CENTI_PER_DAY
                } else {
                    (c / CENTI_PER_DAY) * CENTI_PER_DAY
                }
            }
            RoundingMethod::Floor => {
                if c >= 0 {
                    (c / CENTI_PER_DAY) * CENTI_PER_DAY
                } else {
                    ((c - CENTI_PER_DAY + 1) / CENTI_PER_DAY) * CENTI_PER_DAY
                }
            }
        };
        Self(rounded)
    }
}

impl Add for DayAmount {
    type Output = DayAmount;
    fn add(self, rhs: DayAmount) -> DayAmount {
        DayAmount(self.0 + rhs.0)
    }
}
impl AddAssign for DayAmount {
    fn add_assign(&mut self, rhs: DayAmount) {
        self.0 += rhs.0;
    }
}
impl Sub for DayAmount {
    type Output = DayAmount;
    fn sub(self, rhs: DayAmount) -> DayAmount {
        DayAmount(self.0 - rhs.0)
    }
}
impl SubAssign for DayAmount {
    fn sub_assign(&mut self, rhs: DayAmount) {
        self.0 -= rhs.0;
    }
}
impl Neg for DayAmount {
    type Output = DayAmount;
    fn neg(self) -> DayAmount {
        DayAmount(-self.0)
    }
}
impl Sum for DayAmount {
    fn sum<I: Iterator<Item = DayAmount>>(iter: I) -> DayAmount {
        iter.fold(DayAmount::ZERO, Add::add)
    }
}

impl fmt::Display for DayAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let whole = self.0.abs() / CENTI_PER_DAY;
        let frac = self.0.abs() % CENTI_PER_DAY;
        if frac == 0 {
            write!(f, "{sign}{whole}")
        } else {
            write!(f, "{sign}{whole}.{frac:02}")
        }
    }
}

impl<C> minicbor::Encode<C> for DayAmount {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(self.0)?.ok()
    }
}
impl<'b, C> minicbor::Decode<'b, C> for DayAmount {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(DayAmount(d.i64()?))
    }
}

/// How a fractional accrual amount lands on whole days.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum RoundingMethod {
    #[n(0)]
    None,
    #[n(1)]
    Arithmetic,
    #[n(2)]
    Ceil,
    #[n(3)]
    Floor,
}

/// UTC instant. Callers pass these explicitly so that time-dependent
/// behavior stays deterministic under test.
#[derive(Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn date(&self) -> CalendarDate {
        CalendarDate(self.0.date_naive())
    }
    pub fn plus(&self, delta: chrono::Duration) -> Self {
        Self(self.0 + delta)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Timestamp(value)
    }
}

impl<C> minicbor::Encode<C> for Timestamp {
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
impl<'b, C> minicbor::Decode<'b, C> for Timestamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(Timestamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Civil date without a time zone, for leave ranges and rule windows.
#[derive(Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub struct CalendarDate(NaiveDate);

impl CalendarDate {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        Self(NaiveDate::from_ymd_opt(year, month, day).unwrap())
    }
    pub fn naive(&self) -> NaiveDate {
        self.0
    }
    pub fn year(&self) -> i32 {
        self.0.year()
    }
    pub fn month(&self) -> u32 {
        self.0.month()
    }
    /// Calendar days in the inclusive range ending at `end`. Negative when
    /// `end` precedes `self`.
    pub fn inclusive_days_until(&self, end: CalendarDate) -> i64 {
        end.0.signed_duration_since(self.0).num_days() + 1
    }
}

impl From<NaiveDate> for CalendarDate {
    fn from(value: NaiveDate) -> Self {
        CalendarDate(value)
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
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
            .ok_or_else(|| minicbor::decode::Error::message("day count out of range for a date"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_rounding_goes_half_away_from_zero() {
        assert_eq!(
            DayAmount::centidays(150).round_to_whole(RoundingMethod::Arithmetic),
            DayAmount::days(2)
        );
        assert_eq!(
            DayAmount::centidays(149).round_to_whole(RoundingMethod::Arithmetic),
            DayAmount::days(1)
        );
        assert_eq!(
            DayAmount::centidays(-150).round_to_whole(RoundingMethod::Arithmetic),
            DayAmount::days(-2)
        );
    }

    #[test]
    fn ceil_and_floor_rounding() {
        assert_eq!(
            DayAmount::centidays(101).round_to_whole(RoundingMethod::Ceil),
            DayAmount::days(2)
        );
        assert_eq!(
            DayAmount::centidays(199).round_to_whole(RoundingMethod::Floor),
            DayAmount::days(1)
        );
        assert_eq!(
            DayAmount::centidays(-101).round_to_whole(RoundingMethod::Ceil),
            DayAmount::days(-1)
        );
        assert_eq!(
            DayAmount::centidays(-101).round_to_whole(RoundingMethod::Floor),
            DayAmount::days(-2)
        );
    }

    #[test]
    fn day_amount_display() {
        assert_eq!(DayAmount::days(3).to_string(), "3");
        assert_eq!(DayAmount::centidays(325).to_string(), "3.25");
        assert_eq!(DayAmount::centidays(-50).to_string(), "-0.50");
    }

    #[test]
    fn timestamp_encoding() {
        let original = Timestamp::now();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: Timestamp = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn calendar_date_encoding() {
        let original = CalendarDate::new(2025, 3, 14);

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: CalendarDate = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn inclusive_day_count() {
        let start = CalendarDate::new(2025, 1, 6);
        let end = CalendarDate::new(2025, 1, 10);
        assert_eq!(start.inclusive_days_until(end), 5);
        assert_eq!(start.inclusive_days_until(start), 1);
    }
}
