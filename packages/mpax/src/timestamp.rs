//! Contains the [`Timestamp`] value type carried by the built-in MessagePack
//! timestamp extension.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::MpaxError;

const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// An instant on the UTC timeline, with nanosecond precision, as carried by
/// the MessagePack timestamp extension (extension type `-1`).
///
/// A timestamp is a pair of a signed second count since the Unix epoch and a
/// nanosecond adjustment in `0..=999_999_999`. Instants before the epoch are
/// represented with a negative second count and a non-negative nanosecond
/// component, so `-0.5` seconds is `(-1, 500_000_000)`.
///
/// On the wire, the writer picks the smallest of the three encoded forms
/// (4, 8 or 12 payload bytes) that can represent the instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
	seconds: i64,
	nanos: u32
}

impl Timestamp {
	/// The Unix epoch, 1970-01-01T00:00:00Z.
	pub const EPOCH: Self = Self { seconds: 0, nanos: 0 };

	/// Creates a timestamp from a second count since the Unix epoch and a
	/// nanosecond adjustment.
	///
	/// Fails with [`InvalidTimestampNanos`](MpaxError::InvalidTimestampNanos)
	/// if `nanos` is not below one second.
	pub const fn new(seconds: i64, nanos: u32) -> Result<Self, MpaxError> {
		if nanos >= NANOS_PER_SECOND {
			return Err(MpaxError::InvalidTimestampNanos(nanos));
		}

		Ok(Self { seconds, nanos })
	}

	/// Returns the number of whole seconds since the Unix epoch. Negative for
	/// instants before the epoch.
	pub const fn seconds(&self) -> i64 {
		self.seconds
	}

	/// Returns the nanosecond adjustment within the second, always in
	/// `0..=999_999_999`.
	pub const fn nanos(&self) -> u32 {
		self.nanos
	}
}

impl TryFrom<SystemTime> for Timestamp {
	type Error = MpaxError;

	fn try_from(time: SystemTime) -> Result<Self, Self::Error> {
		match time.duration_since(UNIX_EPOCH) {
			Ok(since_epoch) => {
				let seconds = i64::try_from(since_epoch.as_secs()).map_err(|_| {
					MpaxError::IntegerOverflow {
						value: since_epoch.as_secs() as i128,
						requested: "i64"
					}
				})?;

				Self::new(seconds, since_epoch.subsec_nanos())
			}
			Err(before_epoch) => {
				let until_epoch = before_epoch.duration();
				let mut seconds = -(until_epoch.as_secs() as i64);
				let mut nanos = until_epoch.subsec_nanos();

				// Move a partial second below the epoch into a non-negative
				// nanosecond adjustment of the previous whole second
				if nanos > 0 {
					seconds -= 1;
					nanos = NANOS_PER_SECOND - nanos;
				}

				Self::new(seconds, nanos)
			}
		}
	}
}

impl TryFrom<Timestamp> for SystemTime {
	type Error = MpaxError;

	fn try_from(timestamp: Timestamp) -> Result<Self, Self::Error> {
		let out_of_range = || MpaxError::IntegerOverflow {
			value: timestamp.seconds as i128,
			requested: "SystemTime"
		};

		if timestamp.seconds >= 0 {
			UNIX_EPOCH
				.checked_add(Duration::new(timestamp.seconds as u64, timestamp.nanos))
				.ok_or_else(out_of_range)
		} else {
			// (-1, 999_999_999) is one nanosecond before the epoch
			let until_epoch = Duration::new(
				(timestamp.seconds.unsigned_abs()) - u64::from(timestamp.nanos > 0),
				match timestamp.nanos {
					0 => 0,
					nanos => NANOS_PER_SECOND - nanos
				}
			);

			UNIX_EPOCH.checked_sub(until_epoch).ok_or_else(out_of_range)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nanosecond_validation_works() {
		assert!(Timestamp::new(0, 999_999_999).is_ok());
		assert!(matches!(
			Timestamp::new(0, NANOS_PER_SECOND),
			Err(MpaxError::InvalidTimestampNanos(_))
		));
	}

	#[test]
	fn system_time_round_trip_works() {
		for (seconds, nanos) in [(0, 0), (1_500_000_000, 123_456_789), (-1, 500_000_000), (-86_400, 0)] {
			let timestamp = Timestamp::new(seconds, nanos).expect("Valid timestamp expected");
			let time = SystemTime::try_from(timestamp).expect("In-range conversion expected");

			assert_eq!(
				Timestamp::try_from(time).expect("In-range conversion expected"),
				timestamp,
				"Round trip through SystemTime changed ({seconds}, {nanos})"
			);
		}
	}

	#[test]
	fn epoch_maps_to_unix_epoch() {
		assert_eq!(SystemTime::try_from(Timestamp::EPOCH).unwrap(), UNIX_EPOCH);
		assert_eq!(Timestamp::try_from(UNIX_EPOCH).unwrap(), Timestamp::EPOCH);
	}
}
