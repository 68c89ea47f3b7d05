//! Real-time clock codec.
//!
//! Ground time is seconds and nanoseconds since J2000
//! (2000-01-01 11:58:55.816 UTC). The hardware calendar only ticks whole
//! seconds, so the codec works against an epoch of 2000-01-01 11:58:56 and
//! reports a fixed 184 ms sub-second bias on every read.
//!
//! Calendar conversion uses the Fliegel & Van Flandern integer Julian day
//! algorithm (CACM 11(10), 1968).

/// Sub-second offset between J2000 and the codec epoch
pub const NS_BIAS: u32 = 184_000_000;

pub const NS_PER_SEC: u32 = 1_000_000_000;

pub const SECS_PER_DAY: u32 = 86_400;

/// Seconds from midnight to the codec epoch (11:58:56)
pub const EPOCH_SECS_OF_DAY: u32 = 43_136;

/// Julian day number of 2000-01-01
pub const J2000_JD: i32 = 2_451_545;

const MIN_YEAR: i32 = 2000;
const MAX_YEAR: i32 = 2099;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum RtcError {
    #[cfg_attr(feature = "std", error("time precedes the clock epoch"))]
    Underflow,
    #[cfg_attr(feature = "std", error("clock has not been set"))]
    Unset,
    #[cfg_attr(feature = "std", error("date outside the 2000-2099 calendar range"))]
    OutOfRange,
    #[cfg_attr(feature = "std", error("calendar registers hold an invalid date or time"))]
    Register,
    #[cfg_attr(feature = "std", error("clock driver failure"))]
    Driver,
}

/// Julian day number of a proleptic Gregorian date
pub fn julian_day(year: i32, month: i32, day: i32) -> i32 {
    let a = (month - 14) / 12;
    day - 32075 + 1461 * (year + 4800 + a) / 4 + 367 * (month - 2 - a * 12) / 12
        - 3 * ((year + 4900 + a) / 100) / 4
}

/// Gregorian `(year, month, day)` of a Julian day number
pub fn civil_date(jd: i32) -> (i32, i32, i32) {
    let mut l = jd + 68569;
    let n = 4 * l / 146097;
    l -= (146097 * n + 3) / 4;
    let mut i = 4000 * (l + 1) / 1461001;
    l = l - 1461 * i / 4 + 31;
    let mut j = 80 * l / 2447;
    let k = l - 2447 * j / 80;
    l = j / 11;
    j = j + 2 - 12 * l;
    i = 100 * (n - 49) + i + l;

    (i, j, k)
}

/// One calendar reading, with the year counted from 2000
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RtcSample {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl RtcSample {
    /// Calendar time for whole seconds since the codec epoch
    pub fn from_epoch_seconds(seconds: u32) -> Result<Self, RtcError> {
        let since_midnight = seconds as u64 + EPOCH_SECS_OF_DAY as u64;
        let days = (since_midnight / SECS_PER_DAY as u64) as i32;
        let rem = (since_midnight % SECS_PER_DAY as u64) as u32;

        let (year, month, day) = civil_date(J2000_JD + days);
        if year < MIN_YEAR || year > MAX_YEAR {
            return Err(RtcError::OutOfRange);
        }

        Ok(Self {
            year: (year - MIN_YEAR) as u8,
            month: month as u8,
            day: day as u8,
            hour: (rem / 3600) as u8,
            minute: (rem % 3600 / 60) as u8,
            second: (rem % 60) as u8,
        })
    }

    /// Whole seconds since the codec epoch
    pub fn to_epoch_seconds(&self) -> Result<u32, RtcError> {
        let days = (self.julian_day() - J2000_JD) as i64;
        let secs = days * SECS_PER_DAY as i64
            + self.hour as i64 * 3600
            + self.minute as i64 * 60
            + self.second as i64
            - EPOCH_SECS_OF_DAY as i64;

        if secs < 0 {
            return Err(RtcError::Underflow);
        }
        if secs > u32::MAX as i64 {
            return Err(RtcError::OutOfRange);
        }

        Ok(secs as u32)
    }

    pub fn julian_day(&self) -> i32 {
        julian_day(
            self.year as i32 + MIN_YEAR,
            self.month as i32,
            self.day as i32,
        )
    }

    /// ISO weekday, Monday is 1
    pub fn weekday(&self) -> u8 {
        (self.julian_day().rem_euclid(7) + 1) as u8
    }

    pub fn is_valid(&self) -> bool {
        self.year <= 99
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.hour <= 23
            && self.minute <= 59
            && self.second <= 59
    }

    /// Pack into the BCD `(RTC_DR, RTC_TR)` register pair, 24 hour format
    pub fn to_registers(&self) -> (u32, u32) {
        let bcd = |v: u8| ((v / 10) as u32, (v % 10) as u32);

        let (yt, yu) = bcd(self.year);
        let (mt, mu) = bcd(self.month);
        let (dt, du) = bcd(self.day);
        let (ht, hu) = bcd(self.hour);
        let (mnt, mnu) = bcd(self.minute);
        let (st, su) = bcd(self.second);

        let date = yt << 20
            | yu << 16
            | (self.weekday() as u32) << 13
            | mt << 12
            | mu << 8
            | dt << 4
            | du;
        let time = ht << 20 | hu << 16 | mnt << 12 | mnu << 8 | st << 4 | su;

        (date, time)
    }

    /// Unpack a BCD `(RTC_DR, RTC_TR)` register pair
    pub fn from_registers(date: u32, time: u32) -> Result<Self, RtcError> {
        let digit = |reg: u32, shift: u32, mask: u32| -> Result<u8, RtcError> {
            let v = (reg >> shift) & mask;
            if v > 9 {
                return Err(RtcError::Register);
            }
            Ok(v as u8)
        };

        let s = Self {
            year: digit(date, 20, 0xf)? * 10 + digit(date, 16, 0xf)?,
            month: digit(date, 12, 0x1)? * 10 + digit(date, 8, 0xf)?,
            day: digit(date, 4, 0x3)? * 10 + digit(date, 0, 0xf)?,
            hour: digit(time, 20, 0x3)? * 10 + digit(time, 16, 0xf)?,
            minute: digit(time, 12, 0x7)? * 10 + digit(time, 8, 0xf)?,
            second: digit(time, 4, 0x7)? * 10 + digit(time, 0, 0xf)?,
        };

        if !s.is_valid() {
            return Err(RtcError::Register);
        }

        Ok(s)
    }
}

/// Raw access to the calendar date and time registers
pub trait RtcDriver {
    /// Program the `(RTC_DR, RTC_TR)` pair
    fn write_calendar(&mut self, date: u32, time: u32) -> Result<(), RtcError>;

    /// Read the `(RTC_DR, RTC_TR)` pair
    fn read_calendar(&mut self) -> Result<(u32, u32), RtcError>;
}

/// Linear time access used by the command dispatcher
pub trait Clock {
    fn set_time(&mut self, seconds: u32, nanoseconds: u32) -> Result<(), RtcError>;

    fn get_time(&mut self) -> Result<(u32, u32), RtcError>;
}

/// Converts between J2000 seconds/nanoseconds and the hardware calendar
pub struct RtcCodec<R> {
    driver: R,
    set: bool,
}

impl<R: RtcDriver> RtcCodec<R> {
    pub fn new(driver: R) -> Self {
        Self { driver, set: false }
    }

    /// Whether `set` has succeeded since start-up
    pub fn is_set(&self) -> bool {
        self.set
    }

    /// Program the clock from seconds and nanoseconds since J2000.
    ///
    /// Nanoseconds below the 184 ms bias borrow a second; that borrow is
    /// refused at `seconds == 0`.
    pub fn set(&mut self, seconds: u32, nanoseconds: u32) -> Result<(), RtcError> {
        let seconds = if nanoseconds >= NS_BIAS {
            seconds
        } else {
            seconds.checked_sub(1).ok_or(RtcError::Underflow)?
        };

        let sample = RtcSample::from_epoch_seconds(seconds)?;
        let (date, time) = sample.to_registers();

        self.driver.write_calendar(date, time)?;
        self.set = true;

        info!("Clock set to 20{:02}-{:02}-{:02} {:02}:{:02}:{:02}",
            sample.year, sample.month, sample.day, sample.hour, sample.minute, sample.second);

        Ok(())
    }

    /// Read the clock as seconds and nanoseconds since J2000.
    ///
    /// Nanoseconds are always the fixed bias, the calendar has one second
    /// resolution.
    pub fn get(&mut self) -> Result<(u32, u32), RtcError> {
        if !self.set {
            return Err(RtcError::Unset);
        }

        let (date, time) = self.driver.read_calendar()?;
        let seconds = RtcSample::from_registers(date, time)?.to_epoch_seconds()?;

        Ok((seconds, NS_BIAS))
    }

    pub fn driver(&self) -> &R {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut R {
        &mut self.driver
    }
}

impl<R: RtcDriver> Clock for RtcCodec<R> {
    fn set_time(&mut self, seconds: u32, nanoseconds: u32) -> Result<(), RtcError> {
        self.set(seconds, nanoseconds)
    }

    fn get_time(&mut self) -> Result<(u32, u32), RtcError> {
        self.get()
    }
}

/// In-memory calendar register pair
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SoftRtc {
    date: u32,
    time: u32,
}

impl SoftRtc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registers(&self) -> (u32, u32) {
        (self.date, self.time)
    }

    /// Advance the calendar by whole seconds, as the hardware would while running
    pub fn advance(&mut self, seconds: u32) -> Result<(), RtcError> {
        let now = RtcSample::from_registers(self.date, self.time)?.to_epoch_seconds()?;
        let later = now.checked_add(seconds).ok_or(RtcError::OutOfRange)?;
        let (date, time) = RtcSample::from_epoch_seconds(later)?.to_registers();

        self.date = date;
        self.time = time;
        Ok(())
    }
}

impl RtcDriver for SoftRtc {
    fn write_calendar(&mut self, date: u32, time: u32) -> Result<(), RtcError> {
        self.date = date;
        self.time = time;
        Ok(())
    }

    fn read_calendar(&mut self) -> Result<(u32, u32), RtcError> {
        Ok((self.date, self.time))
    }
}

/// Unix time of J2000
#[cfg(feature = "std")]
pub const J2000_UNIX: std::time::Duration = std::time::Duration::new(946_727_935, 816_000_000);

/// Seconds and nanoseconds since J2000 of a system time
#[cfg(feature = "std")]
pub fn j2000_from_system_time(t: std::time::SystemTime) -> Result<(u32, u32), RtcError> {
    let since_unix = t
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| RtcError::Underflow)?;
    let since_j2000 = since_unix.checked_sub(J2000_UNIX).ok_or(RtcError::Underflow)?;

    if since_j2000.as_secs() > u32::MAX as u64 {
        return Err(RtcError::OutOfRange);
    }

    Ok((since_j2000.as_secs() as u32, since_j2000.subsec_nanos()))
}

#[cfg(feature = "std")]
pub fn system_time_from_j2000(seconds: u32, nanoseconds: u32) -> std::time::SystemTime {
    std::time::UNIX_EPOCH + J2000_UNIX + std::time::Duration::new(seconds as u64, nanoseconds)
}
