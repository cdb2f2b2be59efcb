//! Contains the [`MessageReader`], which decodes MessagePack values from a
//! buffered source.

use std::io::Write;
use std::sync::Arc;

use log::debug;

use crate::buffer::{BufferAllocator, UnpooledAllocator};
use crate::error::MpaxError;
use crate::format::{self, MessageType};
use crate::source::{MessageSource, SourceProvider};
use crate::strings::{IdentifierDecoder, MessageDecoder, StringDecoder};
use crate::timestamp::Timestamp;

/// Settings that customize how a [`MessageReader`] buffers and decodes its
/// input.
#[derive(Clone)]
#[non_exhaustive]
pub struct ReaderSettings {
	/// The allocator the reader leases its read buffer, and the string
	/// decoder its scratch space, from. Allocators may be shared between any
	/// number of readers and writers.
	///
	/// **Default value**: a fresh [`UnpooledAllocator`].
	pub allocator: Arc<dyn BufferAllocator>,
	/// The capacity of the read buffer, in bytes. Must be at least
	/// [`MIN_BUFFER_CAPACITY`](crate::buffer::MIN_BUFFER_CAPACITY).
	///
	/// **Default value**: 8 KiB.
	pub read_buffer_capacity: usize
}

impl Default for ReaderSettings {
	fn default() -> Self {
		Self {
			allocator: Arc::new(UnpooledAllocator::new()),
			read_buffer_capacity: 8 * 1024
		}
	}
}

/// The header of an extension value: its application-defined type byte and
/// its payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionHeader {
	/// The extension type. Non-negative values are application-defined;
	/// negative values are reserved by the MessagePack specification.
	pub ext_type: i8,
	/// The payload length in bytes, not counting the type byte.
	pub length: u32
}

fn type_mismatch(format: u8, requested: MessageType) -> MpaxError {
	MpaxError::TypeMismatch { format, requested }
}

/// Decodes MessagePack values from a [`SourceProvider`], buffering its input
/// and selecting the decoding path from each value's format byte.
///
/// A reader is a single-threaded object: one value is decoded at a time, on
/// the caller's stack. Typed reads consume the value they decode; after a
/// decoding error the position within the wire stream is unspecified and the
/// reader should be discarded.
pub struct MessageReader<P: SourceProvider, SD = StringDecoder, ID = IdentifierDecoder> {
	source: MessageSource<P>,
	string_decoder: SD,
	identifier_decoder: ID
}

impl<P: SourceProvider> MessageReader<P> {
	/// Creates a reader over the specified provider with default settings
	/// and codecs.
	pub fn new(provider: P) -> Result<Self, MpaxError> {
		Self::with_settings(provider, ReaderSettings::default())
	}

	/// Creates a reader over the specified provider with the specified
	/// settings and the default codecs.
	pub fn with_settings(provider: P, settings: ReaderSettings) -> Result<Self, MpaxError> {
		Self::with_decoders(
			provider,
			settings,
			StringDecoder::default(),
			IdentifierDecoder::default()
		)
	}
}

impl<P, SD, ID> MessageReader<P, SD, ID>
where
	P: SourceProvider,
	SD: MessageDecoder<String>,
	ID: MessageDecoder<Arc<str>>
{
	/// Creates a reader over the specified provider with the specified
	/// settings, string decoder and identifier decoder. Sharing one
	/// identifier decoder between several readers shares its cache.
	pub fn with_decoders(
		provider: P,
		settings: ReaderSettings,
		string_decoder: SD,
		identifier_decoder: ID
	) -> Result<Self, MpaxError> {
		debug!(
			"creating message reader with a {} byte read buffer",
			settings.read_buffer_capacity
		);

		Ok(Self {
			source: MessageSource::new(provider, settings.allocator, settings.read_buffer_capacity)?,
			string_decoder,
			identifier_decoder
		})
	}

	/// Classifies the next value on the stream from its format byte, without
	/// consuming anything.
	pub fn next_type(&mut self) -> Result<MessageType, MpaxError> {
		MessageType::from_format(self.source.next_byte()?)
	}

	/// Reads a `nil` value.
	pub fn read_nil(&mut self) -> Result<(), MpaxError> {
		match self.source.read_u8()? {
			format::NIL => Ok(()),
			format => Err(type_mismatch(format, MessageType::Nil))
		}
	}

	/// Reads a boolean value.
	pub fn read_bool(&mut self) -> Result<bool, MpaxError> {
		match self.source.read_u8()? {
			format::FALSE => Ok(false),
			format::TRUE => Ok(true),
			format => Err(type_mismatch(format, MessageType::Boolean))
		}
	}

	/// Reads any integer encoding into the widest intermediate. Narrowing to
	/// the requested width happens at the typed wrappers.
	fn read_integer_value(&mut self) -> Result<i128, MpaxError> {
		let format = self.source.read_u8()?;

		Ok(match format {
			format if format::is_positive_fixint(format) => i128::from(format),
			format if format::is_negative_fixint(format) => i128::from(format as i8),
			format::UINT8 => i128::from(self.source.read_u8()?),
			format::UINT16 => i128::from(self.source.read_u16()?),
			format::UINT32 => i128::from(self.source.read_u32()?),
			format::UINT64 => i128::from(self.source.read_u64()?),
			format::INT8 => i128::from(self.source.read_i8()?),
			format::INT16 => i128::from(self.source.read_i16()?),
			format::INT32 => i128::from(self.source.read_i32()?),
			format::INT64 => i128::from(self.source.read_i64()?),
			format => return Err(type_mismatch(format, MessageType::Integer))
		})
	}

	/// Reads an integer value that fits a signed byte.
	///
	/// Any integer encoding is accepted as long as the value fits the
	/// requested width; otherwise
	/// [`IntegerOverflow`](MpaxError::IntegerOverflow) is raised and the
	/// value is consumed.
	pub fn read_i8(&mut self) -> Result<i8, MpaxError> {
		let value = self.read_integer_value()?;

		i8::try_from(value).map_err(|_| MpaxError::IntegerOverflow {
			value,
			requested: "i8"
		})
	}

	/// Reads an integer value that fits a signed 16-bit integer.
	pub fn read_i16(&mut self) -> Result<i16, MpaxError> {
		let value = self.read_integer_value()?;

		i16::try_from(value).map_err(|_| MpaxError::IntegerOverflow {
			value,
			requested: "i16"
		})
	}

	/// Reads an integer value that fits a signed 32-bit integer.
	pub fn read_i32(&mut self) -> Result<i32, MpaxError> {
		let value = self.read_integer_value()?;

		i32::try_from(value).map_err(|_| MpaxError::IntegerOverflow {
			value,
			requested: "i32"
		})
	}

	/// Reads an integer value that fits a signed 64-bit integer.
	pub fn read_i64(&mut self) -> Result<i64, MpaxError> {
		let value = self.read_integer_value()?;

		i64::try_from(value).map_err(|_| MpaxError::IntegerOverflow {
			value,
			requested: "i64"
		})
	}

	/// Reads an integer value that fits an unsigned byte.
	pub fn read_u8(&mut self) -> Result<u8, MpaxError> {
		let value = self.read_integer_value()?;

		u8::try_from(value).map_err(|_| MpaxError::IntegerOverflow {
			value,
			requested: "u8"
		})
	}

	/// Reads an integer value that fits an unsigned 16-bit integer.
	pub fn read_u16(&mut self) -> Result<u16, MpaxError> {
		let value = self.read_integer_value()?;

		u16::try_from(value).map_err(|_| MpaxError::IntegerOverflow {
			value,
			requested: "u16"
		})
	}

	/// Reads an integer value that fits an unsigned 32-bit integer.
	pub fn read_u32(&mut self) -> Result<u32, MpaxError> {
		let value = self.read_integer_value()?;

		u32::try_from(value).map_err(|_| MpaxError::IntegerOverflow {
			value,
			requested: "u32"
		})
	}

	/// Reads an integer value that fits an unsigned 64-bit integer.
	pub fn read_u64(&mut self) -> Result<u64, MpaxError> {
		let value = self.read_integer_value()?;

		u64::try_from(value).map_err(|_| MpaxError::IntegerOverflow {
			value,
			requested: "u64"
		})
	}

	/// Reads a single precision float. Only the `float 32` encoding is
	/// accepted: integers and doubles are not promoted or demoted.
	pub fn read_f32(&mut self) -> Result<f32, MpaxError> {
		match self.source.read_u8()? {
			format::FLOAT32 => self.source.read_f32(),
			format => Err(type_mismatch(format, MessageType::Float))
		}
	}

	/// Reads a double precision float. Only the `float 64` encoding is
	/// accepted: integers and singles are not promoted.
	pub fn read_f64(&mut self) -> Result<f64, MpaxError> {
		match self.source.read_u8()? {
			format::FLOAT64 => self.source.read_f64(),
			format => Err(type_mismatch(format, MessageType::Float))
		}
	}

	/// Reads a string value through the configured string decoder.
	pub fn read_str(&mut self) -> Result<String, MpaxError> {
		let length = self.read_str_header()? as usize;

		self.string_decoder.decode(&mut self.source, length)
	}

	/// Reads a string value through the configured identifier decoder,
	/// reusing its cached instance when the same identifier was seen before.
	pub fn read_identifier(&mut self) -> Result<Arc<str>, MpaxError> {
		let length = self.read_str_header()? as usize;

		self.identifier_decoder.decode(&mut self.source, length)
	}

	/// Reads a string header and returns the payload byte length that
	/// follows. The caller is responsible for consuming exactly that many
	/// payload bytes before the next value.
	pub fn read_str_header(&mut self) -> Result<u32, MpaxError> {
		match self.source.read_u8()? {
			format if format::is_fixstr(format) => Ok(u32::from(format::fixstr_length(format))),
			format::STR8 => self.source.read_length8(),
			format::STR16 => self.source.read_length16(),
			format::STR32 => self.source.read_length32(),
			format => Err(type_mismatch(format, MessageType::String))
		}
	}

	/// Reads a binary header and returns the payload byte length that
	/// follows.
	pub fn read_bin_header(&mut self) -> Result<u32, MpaxError> {
		match self.source.read_u8()? {
			format::BIN8 => self.source.read_length8(),
			format::BIN16 => self.source.read_length16(),
			format::BIN32 => self.source.read_length32(),
			format => Err(type_mismatch(format, MessageType::Binary))
		}
	}

	/// Reads an array header and returns the number of element values that
	/// follow.
	pub fn read_array_header(&mut self) -> Result<u32, MpaxError> {
		match self.source.read_u8()? {
			format if format::is_fixarray(format) => Ok(u32::from(format::fixarray_length(format))),
			format::ARRAY16 => self.source.read_length16(),
			format::ARRAY32 => self.source.read_length32(),
			format => Err(type_mismatch(format, MessageType::Array))
		}
	}

	/// Reads a map header and returns the number of entries that follow;
	/// each entry is a key value followed by a value value.
	pub fn read_map_header(&mut self) -> Result<u32, MpaxError> {
		match self.source.read_u8()? {
			format if format::is_fixmap(format) => Ok(u32::from(format::fixmap_length(format))),
			format::MAP16 => self.source.read_length16(),
			format::MAP32 => self.source.read_length32(),
			format => Err(type_mismatch(format, MessageType::Map))
		}
	}

	/// Reads an extension header and returns its type byte and payload
	/// length.
	pub fn read_ext_header(&mut self) -> Result<ExtensionHeader, MpaxError> {
		let length = match self.source.read_u8()? {
			format::FIXEXT1 => 1,
			format::FIXEXT2 => 2,
			format::FIXEXT4 => 4,
			format::FIXEXT8 => 8,
			format::FIXEXT16 => 16,
			format::EXT8 => self.source.read_length8()?,
			format::EXT16 => self.source.read_length16()?,
			format::EXT32 => self.source.read_length32()?,
			format => return Err(type_mismatch(format, MessageType::Extension))
		};
		let ext_type = self.source.read_i8()?;

		Ok(ExtensionHeader { ext_type, length })
	}

	/// Reads a timestamp extension value.
	///
	/// Fails with [`TimestampTypeMismatch`](MpaxError::TimestampTypeMismatch)
	/// if the extension on the stream is of another type, and with
	/// [`InvalidTimestampLength`](MpaxError::InvalidTimestampLength) if its
	/// payload is not one of the three defined shapes.
	pub fn read_timestamp(&mut self) -> Result<Timestamp, MpaxError> {
		let header = self.read_ext_header()?;
		if header.ext_type != format::TIMESTAMP_EXTENSION {
			return Err(MpaxError::TimestampTypeMismatch(header.ext_type));
		}

		match header.length {
			4 => Timestamp::new(i64::from(self.source.read_u32()?), 0),
			8 => {
				let word = self.source.read_u64()?;
				let nanos = (word >> 34) as u32;
				let seconds = (word & ((1 << 34) - 1)) as i64;

				Timestamp::new(seconds, nanos)
			}
			12 => {
				let nanos = self.source.read_u32()?;
				let seconds = self.source.read_i64()?;

				Timestamp::new(seconds, nanos)
			}
			length => Err(MpaxError::InvalidTimestampLength(length))
		}
	}

	/// Reads a binary value in one go: its header, then its payload into a
	/// freshly allocated vector.
	pub fn read_bin(&mut self) -> Result<Vec<u8>, MpaxError> {
		let length = self.read_bin_header()? as usize;
		let mut payload = vec![0; length];
		self.read_payload(&mut payload)?;

		Ok(payload)
	}

	/// Fills `dest` with payload bytes, draining the readahead first and
	/// then reading directly from the provider.
	pub fn read_payload(&mut self, dest: &mut [u8]) -> Result<(), MpaxError> {
		self.source.read_payload(dest)
	}

	/// Routes up to `length` payload bytes into `dest` and returns how many
	/// were transferred, falling short only when the input ends first.
	pub fn read_payload_to<W: Write>(
		&mut self,
		dest: &mut W,
		length: u64
	) -> Result<u64, MpaxError> {
		self.source.transfer_to(dest, length)
	}

	/// Skips the next value, however deeply nested.
	pub fn skip_value(&mut self) -> Result<(), MpaxError> {
		self.skip_values(1)
	}

	/// Skips the next `count` values structurally, without constructing
	/// them: containers enlist their children in the pending count instead
	/// of being recursed into, and sized payloads are skipped byte-wise.
	pub fn skip_values(&mut self, count: usize) -> Result<(), MpaxError> {
		let mut pending = count as u64;

		while pending > 0 {
			pending -= 1;

			let format = self.source.read_u8()?;
			match format {
				format if format::is_positive_fixint(format) => {}
				format if format::is_negative_fixint(format) => {}
				format::NIL | format::FALSE | format::TRUE => {}
				format if format::is_fixstr(format) => {
					self.source.skip(format::fixstr_length(format) as usize)?;
				}
				format if format::is_fixarray(format) => {
					pending += u64::from(format::fixarray_length(format));
				}
				format if format::is_fixmap(format) => {
					pending += 2 * u64::from(format::fixmap_length(format));
				}
				format::UINT8 | format::INT8 => self.source.skip(1)?,
				format::UINT16 | format::INT16 => self.source.skip(2)?,
				format::UINT32 | format::INT32 | format::FLOAT32 => self.source.skip(4)?,
				format::UINT64 | format::INT64 | format::FLOAT64 => self.source.skip(8)?,
				format::STR8 | format::BIN8 => {
					let length = self.source.read_length8()?;
					self.source.skip(length as usize)?;
				}
				format::STR16 | format::BIN16 => {
					let length = self.source.read_length16()?;
					self.source.skip(length as usize)?;
				}
				format::STR32 | format::BIN32 => {
					let length = self.source.read_length32()?;
					self.source.skip(length as usize)?;
				}
				format::FIXEXT1 => self.source.skip(2)?,
				format::FIXEXT2 => self.source.skip(3)?,
				format::FIXEXT4 => self.source.skip(5)?,
				format::FIXEXT8 => self.source.skip(9)?,
				format::FIXEXT16 => self.source.skip(17)?,
				format::EXT8 => {
					let length = self.source.read_length8()?;
					self.source.skip(1 + length as usize)?;
				}
				format::EXT16 => {
					let length = self.source.read_length16()?;
					self.source.skip(1 + length as usize)?;
				}
				format::EXT32 => {
					let length = self.source.read_length32()?;
					self.source.skip(1 + length as usize)?;
				}
				format::ARRAY16 => pending += u64::from(self.source.read_length16()?),
				format::ARRAY32 => pending += u64::from(self.source.read_length32()?),
				format::MAP16 => pending += 2 * u64::from(self.source.read_length16()?),
				format::MAP32 => pending += 2 * u64::from(self.source.read_length32()?),
				format => return Err(MpaxError::InvalidFormat { format })
			}
		}

		Ok(())
	}

	/// Closes the provider and releases the read buffer.
	pub fn close(self) -> Result<(), MpaxError> {
		self.source.close()
	}
}
