//! Buffered message sources and the providers that feed them bytes.
//!
//! A [`MessageSource`] owns a read buffer leased from a [`BufferAllocator`]
//! and pulls bytes into it from a [`SourceProvider`]: a blocking byte stream
//! ([`StreamSource`]), a pre-filled in-memory slice ([`SliceSource`]), or
//! nothing at all ([`EmptySource`]). The [`MessageReader`](crate::reader)
//! decodes values out of the readahead this module maintains.

use std::cmp;
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::sync::Arc;

use crate::buffer::{BufferAllocator, ByteBuffer, LeasedBytes, MIN_BUFFER_CAPACITY};
use crate::error::MpaxError;

/// Reads from a blocking endpoint, retrying interrupted reads and mapping a
/// would-block condition to the dedicated error kind.
pub(crate) fn blocking_read<R: Read + ?Sized>(
	reader: &mut R,
	dest: &mut [u8]
) -> Result<usize, MpaxError> {
	loop {
		match reader.read(dest) {
			Ok(read) => return Ok(read),
			Err(error) if error.kind() == ErrorKind::Interrupted => continue,
			Err(error) if error.kind() == ErrorKind::WouldBlock => {
				return Err(MpaxError::NonBlockingEndpointDetected);
			}
			Err(error) => return Err(error.into())
		}
	}
}

/// Defines the contract for the byte suppliers behind a [`MessageSource`].
///
/// Providers block until at least one byte is available or the input ends;
/// endpoints in non-blocking mode are rejected with
/// [`NonBlockingEndpointDetected`](MpaxError::NonBlockingEndpointDetected).
pub trait SourceProvider {
	/// Reads up to `dest.len()` bytes directly into `dest`, returning how
	/// many were read. Returns zero only when the input has ended.
	fn read_into(&mut self, dest: &mut [u8]) -> Result<usize, MpaxError>;

	/// Reads bytes into the unfilled region of `buffer`, advancing its
	/// position, and returns how many were read. Returns zero only when the
	/// input has ended.
	///
	/// `min_bytes` is a hint: the caller needs at least that many bytes
	/// before it can make progress, so providers with a choice should not
	/// return with fewer when cheaper partial reads are possible. Providers
	/// may ignore it.
	fn read(&mut self, buffer: &mut ByteBuffer, min_bytes: usize) -> Result<usize, MpaxError> {
		let _ = min_bytes;
		let read = self.read_into(buffer.unfilled())?;
		buffer.advance(read);

		Ok(read)
	}

	/// Seeks past `length` bytes. The readahead already in `buffer` counts
	/// toward the skip; the rest is read into the buffer and discarded, which
	/// seekable providers may override with something cheaper.
	///
	/// The buffer is left with no readahead if the skip went past it.
	fn skip(&mut self, length: usize, buffer: &mut ByteBuffer) -> Result<(), MpaxError> {
		let from_buffer = cmp::min(length, buffer.remaining());
		buffer.advance(from_buffer);

		let mut left = length - from_buffer;
		while left > 0 {
			buffer.clear();
			let want = cmp::min(left, buffer.capacity());
			buffer.set_limit(want);

			let read = self.read(buffer, want)?;
			if read == 0 {
				return Err(MpaxError::UnexpectedEof { needed: left });
			}
			left -= read;
		}

		if length > from_buffer {
			buffer.clear();
			buffer.flip();
		}

		Ok(())
	}

	/// Routes up to `length` bytes into `dest`, draining the readahead in
	/// `buffer` first and then reading through it, and returns how many bytes
	/// were transferred. The transfer falls short of `length` only when the
	/// input ends first.
	fn transfer_to(
		&mut self,
		dest: &mut dyn Write,
		length: u64,
		buffer: &mut ByteBuffer
	) -> Result<u64, MpaxError> {
		let from_buffer = cmp::min(length, buffer.remaining() as u64) as usize;
		dest.write_all(&buffer.readable()[..from_buffer])?;
		buffer.advance(from_buffer);

		let mut transferred = from_buffer as u64;
		let mut drained = false;
		while transferred < length {
			drained = true;
			buffer.clear();
			let want = cmp::min(length - transferred, buffer.capacity() as u64) as usize;
			buffer.set_limit(want);

			let read = self.read(buffer, want)?;
			if read == 0 {
				break;
			}

			buffer.flip();
			dest.write_all(buffer.readable())?;
			buffer.advance(read);
			transferred += read as u64;
		}

		if drained {
			buffer.clear();
			buffer.flip();
		}

		Ok(transferred)
	}

	/// Closes the underlying endpoint. The default does nothing, which suits
	/// endpoints that release their resources on drop.
	fn close(&mut self) -> Result<(), MpaxError> {
		Ok(())
	}
}

/// A [`SourceProvider`] over any blocking [`Read`] endpoint: files, pipes,
/// sockets, or another reader.
#[derive(Debug)]
pub struct StreamSource<R: Read> {
	inner: R
}

impl<R: Read> StreamSource<R> {
	/// Wraps a blocking reader as a source provider.
	pub fn new(inner: R) -> Self {
		Self { inner }
	}

	/// Gets a reference to the underlying reader.
	pub fn get_ref(&self) -> &R {
		&self.inner
	}

	/// Gets a mutable reference to the underlying reader.
	pub fn get_mut(&mut self) -> &mut R {
		&mut self.inner
	}

	/// Tears down this provider, returning the underlying reader.
	pub fn into_inner(self) -> R {
		self.inner
	}
}

impl<R: Read> SourceProvider for StreamSource<R> {
	fn read_into(&mut self, dest: &mut [u8]) -> Result<usize, MpaxError> {
		blocking_read(&mut self.inner, dest)
	}
}

/// A [`SourceProvider`] over a pre-filled in-memory byte slice.
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
	data: &'a [u8]
}

impl<'a> SliceSource<'a> {
	/// Wraps a byte slice as a source provider. Reading past its end signals
	/// end of input.
	pub fn new(data: &'a [u8]) -> Self {
		Self { data }
	}

	/// Returns the bytes that have not been consumed yet.
	pub fn remaining(&self) -> &'a [u8] {
		self.data
	}
}

impl SourceProvider for SliceSource<'_> {
	fn read_into(&mut self, dest: &mut [u8]) -> Result<usize, MpaxError> {
		let read = cmp::min(dest.len(), self.data.len());
		dest[..read].copy_from_slice(&self.data[..read]);
		self.data = &self.data[read..];

		Ok(read)
	}

	fn skip(&mut self, length: usize, buffer: &mut ByteBuffer) -> Result<(), MpaxError> {
		let from_buffer = cmp::min(length, buffer.remaining());
		buffer.advance(from_buffer);

		let left = length - from_buffer;
		if left > self.data.len() {
			let needed = left - self.data.len();
			self.data = &[];

			return Err(MpaxError::UnexpectedEof { needed });
		}
		self.data = &self.data[left..];

		Ok(())
	}

	fn transfer_to(
		&mut self,
		dest: &mut dyn Write,
		length: u64,
		buffer: &mut ByteBuffer
	) -> Result<u64, MpaxError> {
		let from_buffer = cmp::min(length, buffer.remaining() as u64) as usize;
		dest.write_all(&buffer.readable()[..from_buffer])?;
		buffer.advance(from_buffer);

		// The rest goes to the destination straight from the slice
		let direct = cmp::min(length - from_buffer as u64, self.data.len() as u64) as usize;
		dest.write_all(&self.data[..direct])?;
		self.data = &self.data[direct..];

		Ok((from_buffer + direct) as u64)
	}
}

/// A [`SourceProvider`] with no bytes at all: every read signals end of
/// input.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySource;

impl SourceProvider for EmptySource {
	fn read_into(&mut self, _dest: &mut [u8]) -> Result<usize, MpaxError> {
		Ok(0)
	}
}

/// A buffered byte source: owns a leased read buffer, pulls bytes into it
/// from a [`SourceProvider`], and exposes the primitive big-endian reads the
/// [`MessageReader`](crate::reader::MessageReader) decodes values with.
///
/// The bytes between the buffer's position and limit are the readahead:
/// fetched from the provider, not yet consumed. Every primitive read advances
/// the position by exactly the consumed byte count.
pub struct MessageSource<P: SourceProvider> {
	provider: P,
	allocator: Arc<dyn BufferAllocator>,
	buffer: LeasedBytes
}

impl<P: SourceProvider> MessageSource<P> {
	/// Creates a message source that reads through a buffer of
	/// `buffer_capacity` bytes leased from `allocator`.
	///
	/// Fails with [`BufferTooSmall`](MpaxError::BufferTooSmall) if the
	/// capacity cannot hold a format byte plus an 8-byte primitive.
	pub fn new(
		provider: P,
		allocator: Arc<dyn BufferAllocator>,
		buffer_capacity: usize
	) -> Result<Self, MpaxError> {
		if buffer_capacity < MIN_BUFFER_CAPACITY {
			return Err(MpaxError::BufferTooSmall {
				capacity: buffer_capacity,
				minimum: MIN_BUFFER_CAPACITY
			});
		}

		let mut buffer = allocator.byte_buffer(buffer_capacity)?;
		buffer.flip(); // Start with an empty readahead

		Ok(Self {
			provider,
			allocator,
			buffer
		})
	}

	/// Returns the allocator this source leases its buffers from.
	pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
		&self.allocator
	}

	/// Returns the readahead: bytes already fetched from the provider but not
	/// yet consumed.
	pub fn readahead(&self) -> &[u8] {
		self.buffer.readable()
	}

	/// Consumes `count` bytes of the readahead. `count` must not exceed the
	/// readahead length.
	pub fn consume(&mut self, count: usize) {
		self.buffer.advance(count);
	}

	/// Ensures that at least `required` readahead bytes are available,
	/// compacting the buffer and reading from the provider as needed. The
	/// buffer is grown through the allocator when the requirement exceeds its
	/// capacity.
	///
	/// Fails with [`UnexpectedEof`](MpaxError::UnexpectedEof) if the input
	/// ends first.
	pub fn ensure_remaining(&mut self, required: usize) -> Result<(), MpaxError> {
		let mut readahead = self.buffer.remaining();
		if readahead >= required {
			return Ok(());
		}

		self.buffer.compact();
		if self.buffer.capacity() < required {
			let buffer = mem::replace(&mut self.buffer, LeasedBytes::empty());
			let extra = required - buffer.position();
			self.buffer = self.allocator.ensure_remaining(buffer, extra)?;
		}

		while readahead < required {
			let read = self.provider.read(&mut self.buffer, required - readahead)?;
			if read == 0 {
				return Err(MpaxError::UnexpectedEof {
					needed: required - readahead
				});
			}
			readahead += read;
		}
		self.buffer.flip();

		Ok(())
	}

	/// Returns the next byte without consuming it.
	pub fn next_byte(&mut self) -> Result<u8, MpaxError> {
		self.ensure_remaining(1)?;

		Ok(self.buffer.peek_u8())
	}

	/// Reads one byte.
	pub fn read_u8(&mut self) -> Result<u8, MpaxError> {
		self.ensure_remaining(1)?;

		Ok(self.buffer.get_u8())
	}

	/// Reads one byte as a signed integer.
	pub fn read_i8(&mut self) -> Result<i8, MpaxError> {
		self.ensure_remaining(1)?;

		Ok(self.buffer.get_i8())
	}

	/// Reads a big-endian unsigned 16-bit integer.
	pub fn read_u16(&mut self) -> Result<u16, MpaxError> {
		self.ensure_remaining(2)?;

		Ok(self.buffer.get_u16())
	}

	/// Reads a big-endian signed 16-bit integer.
	pub fn read_i16(&mut self) -> Result<i16, MpaxError> {
		self.ensure_remaining(2)?;

		Ok(self.buffer.get_i16())
	}

	/// Reads a big-endian unsigned 32-bit integer.
	pub fn read_u32(&mut self) -> Result<u32, MpaxError> {
		self.ensure_remaining(4)?;

		Ok(self.buffer.get_u32())
	}

	/// Reads a big-endian signed 32-bit integer.
	pub fn read_i32(&mut self) -> Result<i32, MpaxError> {
		self.ensure_remaining(4)?;

		Ok(self.buffer.get_i32())
	}

	/// Reads a big-endian unsigned 64-bit integer.
	pub fn read_u64(&mut self) -> Result<u64, MpaxError> {
		self.ensure_remaining(8)?;

		Ok(self.buffer.get_u64())
	}

	/// Reads a big-endian signed 64-bit integer.
	pub fn read_i64(&mut self) -> Result<i64, MpaxError> {
		self.ensure_remaining(8)?;

		Ok(self.buffer.get_i64())
	}

	/// Reads a big-endian IEEE 754 single precision float.
	pub fn read_f32(&mut self) -> Result<f32, MpaxError> {
		self.ensure_remaining(4)?;

		Ok(self.buffer.get_f32())
	}

	/// Reads a big-endian IEEE 754 double precision float.
	pub fn read_f64(&mut self) -> Result<f64, MpaxError> {
		self.ensure_remaining(8)?;

		Ok(self.buffer.get_f64())
	}

	/// Reads a 1-byte unsigned length.
	pub fn read_length8(&mut self) -> Result<u32, MpaxError> {
		Ok(u32::from(self.read_u8()?))
	}

	/// Reads a 2-byte unsigned big-endian length.
	pub fn read_length16(&mut self) -> Result<u32, MpaxError> {
		Ok(u32::from(self.read_u16()?))
	}

	/// Reads a 4-byte unsigned big-endian length, rejecting values above the
	/// wire format's positive 32-bit integer maximum.
	pub fn read_length32(&mut self) -> Result<u32, MpaxError> {
		let length = self.read_u32()?;
		if length > i32::MAX as u32 {
			return Err(MpaxError::SizeLimitExceeded {
				size: u64::from(length),
				limit: i32::MAX as u64
			});
		}

		Ok(length)
	}

	/// Seeks past `length` bytes without interpreting them.
	pub fn skip(&mut self, length: usize) -> Result<(), MpaxError> {
		self.provider.skip(length, &mut self.buffer)
	}

	/// Routes up to `length` bytes into `dest` and returns how many were
	/// transferred, falling short only when the input ends first.
	pub fn transfer_to<W: Write>(&mut self, dest: &mut W, length: u64) -> Result<u64, MpaxError> {
		self.provider.transfer_to(dest, length, &mut self.buffer)
	}

	/// Fills `dest` completely, draining the readahead first and then reading
	/// directly from the provider.
	pub fn read_payload(&mut self, dest: &mut [u8]) -> Result<(), MpaxError> {
		let from_buffer = cmp::min(dest.len(), self.buffer.remaining());
		self.buffer.get_slice(&mut dest[..from_buffer]);

		let mut filled = from_buffer;
		while filled < dest.len() {
			let read = self.provider.read_into(&mut dest[filled..])?;
			if read == 0 {
				return Err(MpaxError::UnexpectedEof {
					needed: dest.len() - filled
				});
			}
			filled += read;
		}

		Ok(())
	}

	/// Closes the provider and releases the read buffer.
	pub fn close(mut self) -> Result<(), MpaxError> {
		self.provider.close()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::buffer::UnpooledAllocator;

	/// A reader that hands out its data at most `chunk` bytes at a time,
	/// exercising the refill loops.
	struct TricklingReader {
		data: Vec<u8>,
		offset: usize,
		chunk: usize
	}

	impl Read for TricklingReader {
		fn read(&mut self, dest: &mut [u8]) -> std::io::Result<usize> {
			let read = cmp::min(cmp::min(self.chunk, dest.len()), self.data.len() - self.offset);
			dest[..read].copy_from_slice(&self.data[self.offset..self.offset + read]);
			self.offset += read;

			Ok(read)
		}
	}

	fn trickling_source(data: &[u8], chunk: usize) -> MessageSource<StreamSource<TricklingReader>> {
		MessageSource::new(
			StreamSource::new(TricklingReader {
				data: data.to_vec(),
				offset: 0,
				chunk
			}),
			Arc::new(UnpooledAllocator::new()),
			MIN_BUFFER_CAPACITY
		)
		.expect("Source creation expected to succeed")
	}

	#[test]
	fn primitive_reads_span_trickled_refills() {
		let mut data = vec![0x01];
		data.extend_from_slice(&0x0203u16.to_be_bytes());
		data.extend_from_slice(&0x0405060708090a0bu64.to_be_bytes());
		data.extend_from_slice(&(-1234i32).to_be_bytes());

		let mut source = trickling_source(&data, 1);

		assert_eq!(source.next_byte().unwrap(), 0x01);
		assert_eq!(source.read_u8().unwrap(), 0x01);
		assert_eq!(source.read_u16().unwrap(), 0x0203);
		assert_eq!(source.read_u64().unwrap(), 0x0405060708090a0b);
		assert_eq!(source.read_i32().unwrap(), -1234);
	}

	#[test]
	fn end_of_input_is_detected() {
		let mut source = trickling_source(&[0x01, 0x02], 2);

		assert_eq!(source.read_u8().unwrap(), 0x01);
		assert!(matches!(
			source.read_u32(),
			Err(MpaxError::UnexpectedEof { needed: 3 })
		));
	}

	#[test]
	fn empty_source_reports_end_of_input() {
		let mut source = MessageSource::new(
			EmptySource,
			Arc::new(UnpooledAllocator::new()),
			MIN_BUFFER_CAPACITY
		)
		.expect("Source creation expected to succeed");

		assert!(matches!(
			source.read_u8(),
			Err(MpaxError::UnexpectedEof { needed: 1 })
		));
	}

	#[test]
	fn non_blocking_endpoints_are_rejected() {
		struct WouldBlockReader;

		impl Read for WouldBlockReader {
			fn read(&mut self, _dest: &mut [u8]) -> std::io::Result<usize> {
				Err(std::io::Error::from(ErrorKind::WouldBlock))
			}
		}

		let mut source = MessageSource::new(
			StreamSource::new(WouldBlockReader),
			Arc::new(UnpooledAllocator::new()),
			MIN_BUFFER_CAPACITY
		)
		.expect("Source creation expected to succeed");

		assert!(matches!(
			source.read_u8(),
			Err(MpaxError::NonBlockingEndpointDetected)
		));
	}

	#[test]
	fn too_small_buffers_are_rejected() {
		assert!(matches!(
			MessageSource::new(EmptySource, Arc::new(UnpooledAllocator::new()), 8),
			Err(MpaxError::BufferTooSmall {
				capacity: 8,
				minimum: MIN_BUFFER_CAPACITY
			})
		));
	}

	#[test]
	fn skip_crosses_buffer_boundaries() {
		let data: Vec<u8> = (0..=255).collect();
		let mut source = trickling_source(&data, 3);

		assert_eq!(source.read_u8().unwrap(), 0);
		source.skip(254).expect("Skip expected to succeed");
		assert_eq!(source.read_u8().unwrap(), 255);
		assert!(source.read_u8().is_err());
	}

	#[test]
	fn slice_source_skip_is_direct() {
		let data: Vec<u8> = (0..=255).collect();
		let mut source = MessageSource::new(
			SliceSource::new(&data),
			Arc::new(UnpooledAllocator::new()),
			MIN_BUFFER_CAPACITY
		)
		.expect("Source creation expected to succeed");

		source.skip(200).expect("Skip expected to succeed");
		assert_eq!(source.read_u8().unwrap(), 200);

		assert!(matches!(
			source.skip(100),
			Err(MpaxError::UnexpectedEof { .. })
		));
	}

	#[test]
	fn transfer_to_drains_readahead_then_provider() {
		let data: Vec<u8> = (0..100).collect();
		let mut source = trickling_source(&data, 7);

		// Force some readahead first
		assert_eq!(source.next_byte().unwrap(), 0);

		let mut dest = Vec::new();
		let transferred = source
			.transfer_to(&mut dest, 60)
			.expect("Transfer expected to succeed");

		assert_eq!(transferred, 60);
		assert_eq!(dest, (0..60).collect::<Vec<u8>>());
		assert_eq!(source.read_u8().unwrap(), 60);
	}

	#[test]
	fn transfer_to_reports_short_transfers_at_eof() {
		let data: Vec<u8> = (0..10).collect();
		let mut source = trickling_source(&data, 4);

		let mut dest = Vec::new();
		let transferred = source
			.transfer_to(&mut dest, 100)
			.expect("Transfer expected to succeed");

		assert_eq!(transferred, 10);
		assert_eq!(dest, data);
	}

	#[test]
	fn read_payload_drains_readahead_then_reads_directly() {
		let data: Vec<u8> = (0..50).collect();
		let mut source = trickling_source(&data, 9);

		assert_eq!(source.next_byte().unwrap(), 0);

		let mut payload = vec![0; 40];
		source
			.read_payload(&mut payload)
			.expect("Payload read expected to succeed");

		assert_eq!(payload, (0..40).collect::<Vec<u8>>());
		assert_eq!(source.read_u8().unwrap(), 40);
	}

	#[test]
	fn ensure_remaining_grows_the_buffer_past_its_capacity() {
		let data: Vec<u8> = (0..64).collect();
		let mut source = trickling_source(&data, 64);

		source
			.ensure_remaining(32)
			.expect("Readahead growth expected to succeed");
		assert_eq!(source.readahead().len(), 32);
		assert_eq!(source.readahead()[0], 0);

		source.consume(32);
		assert_eq!(source.read_u8().unwrap(), 32);
	}
}
