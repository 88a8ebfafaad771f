/// Wall-clock timestamp attached to durable records.
///
/// Internally i64 microseconds from unix epoch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct a new timestamp of "now".
    pub fn now() -> Self {
        std::time::SystemTime::now().into()
    }

    /// Construct a timestamp from i64 microseconds since unix epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Get the i64 microseconds since unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// True if this timestamp lies further in the past than `age`.
    pub fn is_older_than(&self, age: std::time::Duration) -> bool {
        match Self::now() - age {
            Ok(cutoff) => *self < cutoff,
            Err(_) => false,
        }
    }
}

impl std::ops::Add<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0 + rhs.as_micros() as i64)
    }
}

impl std::ops::Sub<std::time::Duration> for Timestamp {
    type Output = Result<Timestamp, ()>;

    fn sub(self, rhs: std::time::Duration) -> Self::Output {
        if self.0 < rhs.as_micros() as i64 {
            Err(())
        } else {
            Ok(Timestamp(self.0 - rhs.as_micros() as i64))
        }
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(t: std::time::SystemTime) -> Self {
        Self(
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_micros() as i64)
                .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn older_than() {
        let old = (Timestamp::now() - Duration::from_secs(3600)).unwrap();
        assert!(old.is_older_than(Duration::from_secs(60)));
        assert!(!old.is_older_than(Duration::from_secs(7200)));
        assert!(!Timestamp::now().is_older_than(Duration::from_secs(1)));
    }
}
