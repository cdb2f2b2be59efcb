//! Contains the [`MessageWriter`], which encodes MessagePack values onto a
//! buffered sink.

use std::io::Read;
use std::sync::Arc;

use log::debug;

use crate::buffer::{BufferAllocator, UnpooledAllocator};
use crate::error::MpaxError;
use crate::format;
use crate::sink::{MessageSink, SinkProvider};
use crate::strings::{IdentifierEncoder, MessageEncoder, StringEncoder};
use crate::timestamp::Timestamp;

/// Settings that customize how a [`MessageWriter`] buffers and encodes its
/// output.
#[derive(Clone)]
#[non_exhaustive]
pub struct WriterSettings {
	/// The allocator the writer leases its write buffer from. Allocators may
	/// be shared between any number of readers and writers.
	///
	/// **Default value**: a fresh [`UnpooledAllocator`].
	pub allocator: Arc<dyn BufferAllocator>,
	/// The capacity of the write buffer, in bytes. Must be at least
	/// [`MIN_BUFFER_CAPACITY`](crate::buffer::MIN_BUFFER_CAPACITY).
	///
	/// **Default value**: 8 KiB.
	pub write_buffer_capacity: usize
}

impl Default for WriterSettings {
	fn default() -> Self {
		Self {
			allocator: Arc::new(UnpooledAllocator::new()),
			write_buffer_capacity: 8 * 1024
		}
	}
}

/// Encodes MessagePack values onto a [`SinkProvider`], always selecting the
/// smallest encoding that represents each value exactly.
///
/// A writer is a single-threaded object: one value is encoded at a time, on
/// the caller's stack, and within one writer the emitted bytes appear on the
/// endpoint in call order. After writing a header, the caller must write
/// exactly the announced number of child values or payload bytes before the
/// next value.
///
/// Encoded bytes accumulate in the write buffer until it fills up or
/// [`flush`](Self::flush) is called. A dropped writer drains whatever the
/// buffer still holds to the provider on a best-effort basis, discarding any
/// error; [`close`](Self::close) and [`into_provider`](Self::into_provider)
/// report such errors instead.
pub struct MessageWriter<P: SinkProvider, SE = StringEncoder, IE = IdentifierEncoder> {
	sink: MessageSink<P>,
	string_encoder: SE,
	identifier_encoder: IE
}

impl<P: SinkProvider> MessageWriter<P> {
	/// Creates a writer over the specified provider with default settings
	/// and codecs.
	pub fn new(provider: P) -> Result<Self, MpaxError> {
		Self::with_settings(provider, WriterSettings::default())
	}

	/// Creates a writer over the specified provider with the specified
	/// settings and the default codecs.
	pub fn with_settings(provider: P, settings: WriterSettings) -> Result<Self, MpaxError> {
		Self::with_encoders(
			provider,
			settings,
			StringEncoder,
			IdentifierEncoder::default()
		)
	}
}

impl<P, SE, IE> MessageWriter<P, SE, IE>
where
	P: SinkProvider,
	SE: MessageEncoder<str>,
	IE: MessageEncoder<str>
{
	/// Creates a writer over the specified provider with the specified
	/// settings, string encoder and identifier encoder. Sharing one
	/// identifier encoder between several writers shares its cache.
	pub fn with_encoders(
		provider: P,
		settings: WriterSettings,
		string_encoder: SE,
		identifier_encoder: IE
	) -> Result<Self, MpaxError> {
		debug!(
			"creating message writer with a {} byte write buffer",
			settings.write_buffer_capacity
		);

		Ok(Self {
			sink: MessageSink::new(provider, settings.allocator, settings.write_buffer_capacity)?,
			string_encoder,
			identifier_encoder
		})
	}

	/// Writes a `nil` value.
	pub fn write_nil(&mut self) -> Result<(), MpaxError> {
		self.sink.write_u8(format::NIL)
	}

	/// Writes a boolean value.
	pub fn write_bool(&mut self, value: bool) -> Result<(), MpaxError> {
		self.sink.write_u8(if value { format::TRUE } else { format::FALSE })
	}

	/// Writes a signed byte in its smallest encoding.
	pub fn write_i8(&mut self, value: i8) -> Result<(), MpaxError> {
		self.write_i64(i64::from(value))
	}

	/// Writes a signed 16-bit integer in its smallest encoding.
	pub fn write_i16(&mut self, value: i16) -> Result<(), MpaxError> {
		self.write_i64(i64::from(value))
	}

	/// Writes a signed 32-bit integer in its smallest encoding.
	pub fn write_i32(&mut self, value: i32) -> Result<(), MpaxError> {
		self.write_i64(i64::from(value))
	}

	/// Writes a signed 64-bit integer in its smallest encoding: a fixint
	/// when it fits one, otherwise the narrowest signed encoding for
	/// negative values, or the narrowest unsigned encoding for non-negative
	/// ones.
	pub fn write_i64(&mut self, value: i64) -> Result<(), MpaxError> {
		// Surprisingly, a straight-line range test ladder beats a lookup table here
		if value < -(1 << 5) {
			if value >= -(1 << 7) {
				self.sink.write_u8_i8(format::INT8, value as i8)
			} else if value >= -(1 << 15) {
				self.sink.write_u8_i16(format::INT16, value as i16)
			} else if value >= -(1i64 << 31) {
				self.sink.write_u8_i32(format::INT32, value as i32)
			} else {
				self.sink.write_u8_i64(format::INT64, value)
			}
		} else if value < 1 << 7 {
			self.sink.write_u8(value as u8)
		} else if value < 1 << 8 {
			self.sink.write_u8_u8(format::UINT8, value as u8)
		} else if value < 1 << 16 {
			self.sink.write_u8_u16(format::UINT16, value as u16)
		} else if value < 1i64 << 32 {
			self.sink.write_u8_u32(format::UINT32, value as u32)
		} else {
			self.sink.write_u8_u64(format::UINT64, value as u64)
		}
	}

	/// Writes an unsigned byte in its smallest encoding.
	pub fn write_u8(&mut self, value: u8) -> Result<(), MpaxError> {
		self.write_u64(u64::from(value))
	}

	/// Writes an unsigned 16-bit integer in its smallest encoding.
	pub fn write_u16(&mut self, value: u16) -> Result<(), MpaxError> {
		self.write_u64(u64::from(value))
	}

	/// Writes an unsigned 32-bit integer in its smallest encoding.
	pub fn write_u32(&mut self, value: u32) -> Result<(), MpaxError> {
		self.write_u64(u64::from(value))
	}

	/// Writes an unsigned 64-bit integer in its smallest encoding.
	pub fn write_u64(&mut self, value: u64) -> Result<(), MpaxError> {
		if value < 1 << 7 {
			self.sink.write_u8(value as u8)
		} else if value < 1 << 8 {
			self.sink.write_u8_u8(format::UINT8, value as u8)
		} else if value < 1 << 16 {
			self.sink.write_u8_u16(format::UINT16, value as u16)
		} else if value < 1 << 32 {
			self.sink.write_u8_u32(format::UINT32, value as u32)
		} else {
			self.sink.write_u8_u64(format::UINT64, value)
		}
	}

	/// Writes a single precision float, always as `float 32`.
	pub fn write_f32(&mut self, value: f32) -> Result<(), MpaxError> {
		self.sink.write_u8_f32(format::FLOAT32, value)
	}

	/// Writes a double precision float, always as `float 64`.
	pub fn write_f64(&mut self, value: f64) -> Result<(), MpaxError> {
		self.sink.write_u8_f64(format::FLOAT64, value)
	}

	/// Writes a string value through the configured string encoder.
	pub fn write_str(&mut self, value: &str) -> Result<(), MpaxError> {
		self.string_encoder.encode(value, &mut self.sink)
	}

	/// Writes a string value through the configured identifier encoder,
	/// caching its wire form for later occurrences.
	pub fn write_identifier(&mut self, value: &str) -> Result<(), MpaxError> {
		self.identifier_encoder.encode(value, &mut self.sink)
	}

	/// Writes a string header announcing `length` payload bytes. The caller
	/// must follow with exactly that many bytes of UTF-8 through
	/// [`write_payload`](Self::write_payload) or its gather variant.
	pub fn write_str_header(&mut self, length: u32) -> Result<(), MpaxError> {
		if length > i32::MAX as u32 {
			return Err(MpaxError::SizeLimitExceeded {
				size: u64::from(length),
				limit: i32::MAX as u64
			});
		}

		self.sink.write_slice(&format::str_header(length))
	}

	/// Writes a binary header announcing `length` payload bytes.
	pub fn write_bin_header(&mut self, length: u32) -> Result<(), MpaxError> {
		if length < 1 << 8 {
			self.sink.write_u8_u8(format::BIN8, length as u8)
		} else if length < 1 << 16 {
			self.sink.write_u8_u16(format::BIN16, length as u16)
		} else if length <= i32::MAX as u32 {
			self.sink.write_u8_u32(format::BIN32, length)
		} else {
			Err(MpaxError::SizeLimitExceeded {
				size: u64::from(length),
				limit: i32::MAX as u64
			})
		}
	}

	/// Writes an array header announcing `length` element values.
	pub fn write_array_header(&mut self, length: u32) -> Result<(), MpaxError> {
		if length < 16 {
			self.sink.write_u8(format::FIXARRAY | length as u8)
		} else if length < 1 << 16 {
			self.sink.write_u8_u16(format::ARRAY16, length as u16)
		} else if length <= i32::MAX as u32 {
			self.sink.write_u8_u32(format::ARRAY32, length)
		} else {
			Err(MpaxError::SizeLimitExceeded {
				size: u64::from(length),
				limit: i32::MAX as u64
			})
		}
	}

	/// Writes a map header announcing `length` entries, each a key value
	/// followed by a value value.
	pub fn write_map_header(&mut self, length: u32) -> Result<(), MpaxError> {
		if length < 16 {
			self.sink.write_u8(format::FIXMAP | length as u8)
		} else if length < 1 << 16 {
			self.sink.write_u8_u16(format::MAP16, length as u16)
		} else if length <= i32::MAX as u32 {
			self.sink.write_u8_u32(format::MAP32, length)
		} else {
			Err(MpaxError::SizeLimitExceeded {
				size: u64::from(length),
				limit: i32::MAX as u64
			})
		}
	}

	/// Writes an extension header announcing `length` payload bytes of the
	/// specified extension type. Lengths with a `fixext` form use it.
	pub fn write_ext_header(&mut self, ext_type: i8, length: u32) -> Result<(), MpaxError> {
		match length {
			1 => return self.sink.write_u8_i8(format::FIXEXT1, ext_type),
			2 => return self.sink.write_u8_i8(format::FIXEXT2, ext_type),
			4 => return self.sink.write_u8_i8(format::FIXEXT4, ext_type),
			8 => return self.sink.write_u8_i8(format::FIXEXT8, ext_type),
			16 => return self.sink.write_u8_i8(format::FIXEXT16, ext_type),
			_ => {}
		}

		if length < 1 << 8 {
			self.sink.write_u8_u8(format::EXT8, length as u8)?;
		} else if length < 1 << 16 {
			self.sink.write_u8_u16(format::EXT16, length as u16)?;
		} else if length <= i32::MAX as u32 {
			self.sink.write_u8_u32(format::EXT32, length)?;
		} else {
			return Err(MpaxError::SizeLimitExceeded {
				size: u64::from(length),
				limit: i32::MAX as u64
			});
		}

		self.sink.write_i8(ext_type)
	}

	/// Writes a timestamp extension value in the smallest of its three wire
	/// shapes that represents the instant exactly.
	pub fn write_timestamp(&mut self, timestamp: Timestamp) -> Result<(), MpaxError> {
		let seconds = timestamp.seconds();
		let nanos = timestamp.nanos();

		if nanos == 0 && (0..1 << 32).contains(&seconds) {
			self.write_ext_header(format::TIMESTAMP_EXTENSION, 4)?;
			self.sink.write_u32(seconds as u32)
		} else if (0..1 << 34).contains(&seconds) {
			self.write_ext_header(format::TIMESTAMP_EXTENSION, 8)?;
			self.sink.write_u64((u64::from(nanos) << 34) | seconds as u64)
		} else {
			self.write_ext_header(format::TIMESTAMP_EXTENSION, 12)?;
			self.sink.write_u32(nanos)?;
			self.sink.write_i64(seconds)
		}
	}

	/// Writes a binary value in one go: its header, then its payload.
	pub fn write_bin(&mut self, payload: &[u8]) -> Result<(), MpaxError> {
		if payload.len() > i32::MAX as usize {
			return Err(MpaxError::SizeLimitExceeded {
				size: payload.len() as u64,
				limit: i32::MAX as u64
			});
		}

		self.write_bin_header(payload.len() as u32)?;
		if payload.len() > self.sink.buffer_capacity() {
			self.sink.write_payload(payload)
		} else {
			self.sink.write_slice(payload)
		}
	}

	/// Writes payload bytes following a header, passing them through to the
	/// provider so they land immediately after the bytes already written.
	pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), MpaxError> {
		self.sink.write_payload(payload)
	}

	/// Writes several payload slices as an in-order gather. A gathering
	/// provider turns the pending buffer and all slices into a single system
	/// call.
	pub fn write_payloads(&mut self, payloads: &[&[u8]]) -> Result<(), MpaxError> {
		self.sink.write_payloads(payloads)
	}

	/// Routes up to `length` payload bytes from `source` to the provider and
	/// returns how many were transferred, falling short only when `source`
	/// ends first.
	pub fn write_payload_from<R: Read>(
		&mut self,
		source: &mut R,
		length: u64
	) -> Result<u64, MpaxError> {
		self.sink.transfer_from(source, length)
	}

	/// Pushes every byte written so far towards its destination: drains the
	/// write buffer and flushes the provider.
	pub fn flush(&mut self) -> Result<(), MpaxError> {
		self.sink.flush()
	}

	/// Drains the write buffer and tears down this writer, returning the
	/// provider.
	pub fn into_provider(self) -> Result<P, MpaxError> {
		self.sink.into_provider()
	}

	/// Drains the write buffer and closes the provider.
	pub fn close(self) -> Result<(), MpaxError> {
		self.sink.close()
	}
}
