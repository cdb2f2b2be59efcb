//! Buffered message sinks and the providers that drain them.
//!
//! A [`MessageSink`] owns a write buffer leased from a [`BufferAllocator`]
//! and accumulates encoded bytes into it; when the buffer fills up, or when a
//! payload is passed through, the bytes are pushed to a [`SinkProvider`]: a
//! blocking byte stream ([`StreamSink`]), a growable in-memory buffer
//! ([`BufferSink`]), or a counting bit bucket ([`DiscardSink`]). The
//! [`MessageWriter`](crate::writer) encodes values into this module.

use std::cmp;
use std::io::{self, ErrorKind, IoSlice, Read, Write};
use std::mem;
use std::sync::Arc;

use tinyvec::TinyVec;

use crate::buffer::{BufferAllocator, ByteBuffer, LeasedBytes, MIN_BUFFER_CAPACITY};
use crate::error::MpaxError;
use crate::source::blocking_read;

/// Defines the contract for the byte consumers behind a [`MessageSink`].
///
/// Within one provider, bytes appear on the endpoint in the order they were
/// written. Providers block until the endpoint accepts the bytes; endpoints
/// in non-blocking mode are rejected with
/// [`NonBlockingEndpointDetected`](MpaxError::NonBlockingEndpointDetected).
pub trait SinkProvider {
	/// Writes every byte of `bytes` to the endpoint.
	fn write(&mut self, bytes: &[u8]) -> Result<(), MpaxError>;

	/// Writes every slice, in order. Gathering endpoints may collapse the
	/// whole sequence into fewer system calls; the default simply loops.
	fn write_many(&mut self, slices: &[&[u8]]) -> Result<(), MpaxError> {
		for slice in slices {
			self.write(slice)?;
		}

		Ok(())
	}

	/// Flushes the endpoint, pushing any bytes it buffers on its own towards
	/// their destination.
	fn flush(&mut self) -> Result<(), MpaxError>;

	/// Routes up to `length` bytes from `source` to the endpoint, using
	/// `buffer` as scratch space, and returns how many bytes were
	/// transferred. The transfer falls short of `length` only when `source`
	/// ends first.
	///
	/// The buffer must hold no pending bytes when this is called; it is left
	/// empty, in fill mode.
	fn transfer_from(
		&mut self,
		source: &mut dyn Read,
		length: u64,
		buffer: &mut ByteBuffer
	) -> Result<u64, MpaxError> {
		let mut transferred = 0u64;
		while transferred < length {
			buffer.clear();
			let want = cmp::min(length - transferred, buffer.capacity() as u64) as usize;
			buffer.set_limit(want);

			let read = blocking_read(source, buffer.unfilled())?;
			if read == 0 {
				break;
			}
			buffer.advance(read);
			buffer.flip();

			self.write(buffer.readable())?;
			transferred += read as u64;
		}
		buffer.clear();

		Ok(transferred)
	}

	/// Closes the underlying endpoint. The default flushes it and leaves the
	/// rest to drop.
	fn close(&mut self) -> Result<(), MpaxError> {
		self.flush()
	}
}

/// Writes to a blocking endpoint, retrying interrupted writes and mapping a
/// would-block condition to the dedicated error kind.
fn blocking_write_all<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), MpaxError> {
	let mut bytes = bytes;
	while !bytes.is_empty() {
		match writer.write(bytes) {
			Ok(0) => {
				return Err(MpaxError::Io(io::Error::new(
					ErrorKind::WriteZero,
					"endpoint accepted no bytes"
				)));
			}
			Ok(written) => bytes = &bytes[written..],
			Err(error) if error.kind() == ErrorKind::Interrupted => continue,
			Err(error) if error.kind() == ErrorKind::WouldBlock => {
				return Err(MpaxError::NonBlockingEndpointDetected);
			}
			Err(error) => return Err(error.into())
		}
	}

	Ok(())
}

/// A [`SinkProvider`] over any blocking [`Write`] endpoint: files, pipes,
/// sockets, or another writer. Gather writes use a single vectored write
/// where the endpoint accepts one.
#[derive(Debug)]
pub struct StreamSink<W: Write> {
	inner: W
}

impl<W: Write> StreamSink<W> {
	/// Wraps a blocking writer as a sink provider.
	pub fn new(inner: W) -> Self {
		Self { inner }
	}

	/// Gets a reference to the underlying writer.
	pub fn get_ref(&self) -> &W {
		&self.inner
	}

	/// Gets a mutable reference to the underlying writer.
	pub fn get_mut(&mut self) -> &mut W {
		&mut self.inner
	}

	/// Tears down this provider, returning the underlying writer. Bytes the
	/// provider was asked to write have already been handed to the writer.
	pub fn into_inner(self) -> W {
		self.inner
	}
}

impl<W: Write> SinkProvider for StreamSink<W> {
	fn write(&mut self, bytes: &[u8]) -> Result<(), MpaxError> {
		blocking_write_all(&mut self.inner, bytes)
	}

	fn write_many(&mut self, slices: &[&[u8]]) -> Result<(), MpaxError> {
		let mut total: usize = slices.iter().map(|slice| slice.len()).sum();
		let mut io_slices: Vec<IoSlice<'_>> =
			slices.iter().map(|slice| IoSlice::new(slice)).collect();
		let mut io_slices = &mut io_slices[..];

		while total > 0 {
			match self.inner.write_vectored(io_slices) {
				Ok(0) => {
					return Err(MpaxError::Io(io::Error::new(
						ErrorKind::WriteZero,
						"endpoint accepted no bytes"
					)));
				}
				Ok(written) => {
					IoSlice::advance_slices(&mut io_slices, written);
					total -= written;
				}
				Err(error) if error.kind() == ErrorKind::Interrupted => continue,
				Err(error) if error.kind() == ErrorKind::WouldBlock => {
					return Err(MpaxError::NonBlockingEndpointDetected);
				}
				Err(error) => return Err(error.into())
			}
		}

		Ok(())
	}

	fn flush(&mut self) -> Result<(), MpaxError> {
		self.inner.flush().map_err(MpaxError::from)
	}
}

/// A [`SinkProvider`] that collects everything written to it in a growable
/// in-memory buffer.
#[derive(Debug, Default)]
pub struct BufferSink {
	data: Vec<u8>
}

impl BufferSink {
	/// Creates an empty in-memory sink.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the bytes written so far.
	pub fn as_slice(&self) -> &[u8] {
		&self.data
	}

	/// Tears down this sink, returning the collected bytes.
	pub fn into_vec(self) -> Vec<u8> {
		self.data
	}
}

impl SinkProvider for BufferSink {
	fn write(&mut self, bytes: &[u8]) -> Result<(), MpaxError> {
		self.data.extend_from_slice(bytes);

		Ok(())
	}

	fn flush(&mut self) -> Result<(), MpaxError> {
		Ok(())
	}
}

/// A [`SinkProvider`] that accepts and discards every byte, keeping only a
/// count. Useful for measuring encoded sizes.
#[derive(Debug, Default)]
pub struct DiscardSink {
	accepted: u64
}

impl DiscardSink {
	/// Creates a discarding sink.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns how many bytes have been discarded so far.
	pub fn bytes_discarded(&self) -> u64 {
		self.accepted
	}
}

impl SinkProvider for DiscardSink {
	fn write(&mut self, bytes: &[u8]) -> Result<(), MpaxError> {
		self.accepted += bytes.len() as u64;

		Ok(())
	}

	fn flush(&mut self) -> Result<(), MpaxError> {
		Ok(())
	}
}

/// A buffered byte sink: owns a leased write buffer, accumulates encoded
/// bytes into it, and drains them to a [`SinkProvider`] when the buffer fills
/// up or a flush is requested.
///
/// The bytes below the buffer's position are written but not yet flushed.
/// When a sink is dropped, those pending bytes are drained to the provider
/// on a best-effort basis, discarding any error; the provider itself is not
/// flushed. Use [`flush`](Self::flush), [`close`](Self::close) or
/// [`into_provider`](Self::into_provider) to observe write errors.
pub struct MessageSink<P: SinkProvider> {
	// The provider is only ever `None` after `close` or `into_provider`
	// tore the sink down out from under the `Drop` impl
	provider: Option<P>,
	allocator: Arc<dyn BufferAllocator>,
	buffer: LeasedBytes
}

/// Implements the combined format-byte-plus-payload writes, which land in the
/// buffer as a unit.
macro_rules! combined_write_impl {
	($($name:ident, $put:ident, $type:ty);+ $(;)?) => {
		$(
			#[doc = concat!(
				"Writes a format byte immediately followed by a big-endian `",
				stringify!($type),
				"` value."
			)]
			pub fn $name(&mut self, format: u8, value: $type) -> Result<(), MpaxError> {
				self.ensure_remaining(1 + size_of::<$type>())?;
				self.buffer.put_u8(format);
				self.buffer.$put(value);

				Ok(())
			}
		)+
	};
}

impl<P: SinkProvider> MessageSink<P> {
	/// Creates a message sink that writes through a buffer of
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

		Ok(Self {
			provider: Some(provider),
			buffer: allocator.byte_buffer(buffer_capacity)?,
			allocator
		})
	}

	/// Returns the capacity of the write buffer.
	pub fn buffer_capacity(&self) -> usize {
		self.buffer.capacity()
	}

	/// Ensures the write buffer has room for `required` more bytes, flushing
	/// it if it does not. The buffer is grown through the allocator when the
	/// requirement exceeds its capacity.
	pub fn ensure_remaining(&mut self, required: usize) -> Result<(), MpaxError> {
		if self.buffer.remaining() >= required {
			return Ok(());
		}

		self.flush_buffer()?;
		if self.buffer.remaining() < required {
			let buffer = mem::replace(&mut self.buffer, LeasedBytes::empty());
			self.buffer = self.allocator.ensure_remaining(buffer, required)?;
		}

		Ok(())
	}

	/// Drains the pending bytes of the write buffer to the provider, leaving
	/// the buffer empty. Does not flush the provider itself.
	pub fn flush_buffer(&mut self) -> Result<(), MpaxError> {
		if self.buffer.position() > 0 {
			if let Some(provider) = &mut self.provider {
				provider.write(self.buffer.filled())?;
			}
			self.buffer.clear();
		}

		Ok(())
	}

	/// Drains the write buffer and flushes the provider, pushing every byte
	/// written so far towards its destination.
	pub fn flush(&mut self) -> Result<(), MpaxError> {
		self.flush_buffer()?;
		if let Some(provider) = &mut self.provider {
			provider.flush()?;
		}

		Ok(())
	}

	/// Writes a single byte.
	pub fn write_u8(&mut self, value: u8) -> Result<(), MpaxError> {
		self.ensure_remaining(1)?;
		self.buffer.put_u8(value);

		Ok(())
	}

	/// Writes a single signed byte.
	pub fn write_i8(&mut self, value: i8) -> Result<(), MpaxError> {
		self.ensure_remaining(1)?;
		self.buffer.put_i8(value);

		Ok(())
	}

	/// Writes a big-endian unsigned 32-bit integer.
	pub fn write_u32(&mut self, value: u32) -> Result<(), MpaxError> {
		self.ensure_remaining(4)?;
		self.buffer.put_u32(value);

		Ok(())
	}

	/// Writes a big-endian unsigned 64-bit integer.
	pub fn write_u64(&mut self, value: u64) -> Result<(), MpaxError> {
		self.ensure_remaining(8)?;
		self.buffer.put_u64(value);

		Ok(())
	}

	/// Writes a big-endian signed 64-bit integer.
	pub fn write_i64(&mut self, value: i64) -> Result<(), MpaxError> {
		self.ensure_remaining(8)?;
		self.buffer.put_i64(value);

		Ok(())
	}

	combined_write_impl! {
		write_u8_u8, put_u8, u8;
		write_u8_u16, put_u16, u16;
		write_u8_u32, put_u32, u32;
		write_u8_u64, put_u64, u64;
		write_u8_i8, put_i8, i8;
		write_u8_i16, put_i16, i16;
		write_u8_i32, put_i32, i32;
		write_u8_i64, put_i64, i64;
		write_u8_f32, put_f32, f32;
		write_u8_f64, put_f64, f64;
	}

	/// Copies `bytes` through the write buffer, flushing as often as needed.
	/// Suited to headers and short payloads; long payloads are better passed
	/// through with [`write_payload`](Self::write_payload).
	pub fn write_slice(&mut self, bytes: &[u8]) -> Result<(), MpaxError> {
		let mut bytes = bytes;
		while !bytes.is_empty() {
			if !self.buffer.has_remaining() {
				self.flush_buffer()?;
			}

			let chunk = cmp::min(bytes.len(), self.buffer.remaining());
			self.buffer.put_slice(&bytes[..chunk]);
			bytes = &bytes[chunk..];
		}

		Ok(())
	}

	/// Passes `bytes` through to the provider, draining the write buffer
	/// first so the payload lands immediately after the bytes already
	/// written.
	pub fn write_payload(&mut self, bytes: &[u8]) -> Result<(), MpaxError> {
		self.flush_buffer()?;
		if let Some(provider) = &mut self.provider {
			provider.write(bytes)?;
		}

		Ok(())
	}

	/// Passes several payload slices through to the provider as an in-order
	/// gather, together with the pending write buffer content. A gathering
	/// provider turns the whole sequence into a single system call.
	pub fn write_payloads(&mut self, slices: &[&[u8]]) -> Result<(), MpaxError> {
		let mut gathered: TinyVec<[&[u8]; 8]> = TinyVec::new();
		if self.buffer.position() > 0 {
			gathered.push(self.buffer.filled());
		}
		for slice in slices {
			gathered.push(*slice);
		}

		if let Some(provider) = &mut self.provider {
			provider.write_many(&gathered)?;
		}
		self.buffer.clear();

		Ok(())
	}

	/// Routes up to `length` bytes from `source` to the provider, draining
	/// the write buffer first, and returns how many bytes were transferred.
	/// The transfer falls short of `length` only when `source` ends first.
	pub fn transfer_from<R: Read>(
		&mut self,
		source: &mut R,
		length: u64
	) -> Result<u64, MpaxError> {
		self.flush_buffer()?;
		match &mut self.provider {
			Some(provider) => provider.transfer_from(source, length, &mut self.buffer),
			None => Ok(0)
		}
	}

	/// Drains the write buffer and tears down this sink, returning the
	/// provider.
	pub fn into_provider(mut self) -> Result<P, MpaxError> {
		self.flush_buffer()?;

		// Teardown is the only thing that takes the provider, and it consumes
		// the sink, so the provider is still present here
		Ok(self.provider.take().expect("sink provider already taken"))
	}

	/// Drains the write buffer and closes the provider.
	pub fn close(mut self) -> Result<(), MpaxError> {
		self.flush_buffer()?;
		match self.provider.take() {
			Some(mut provider) => provider.close(),
			None => Ok(())
		}
	}
}

impl<P: SinkProvider> Drop for MessageSink<P> {
	fn drop(&mut self) {
		// Pending bytes are drained on a best effort basis; the provider
		// itself is not flushed, and errors have nowhere to go here
		self.flush_buffer().ok();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::buffer::UnpooledAllocator;

	fn buffer_sink(capacity: usize) -> MessageSink<BufferSink> {
		MessageSink::new(BufferSink::new(), Arc::new(UnpooledAllocator::new()), capacity)
			.expect("Sink creation expected to succeed")
	}

	#[test]
	fn small_writes_accumulate_until_flushed() {
		let mut sink = buffer_sink(64);
		sink.write_u8(0x01).unwrap();
		sink.write_u8_u16(0xcd, 0x0203).unwrap();

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.as_slice(), &[0x01, 0xcd, 0x02, 0x03]);
	}

	#[test]
	fn full_buffers_flush_on_their_own() {
		let mut sink = buffer_sink(MIN_BUFFER_CAPACITY);
		for byte in 0..20u8 {
			sink.write_u8(byte).unwrap();
		}

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.as_slice(), (0..20).collect::<Vec<u8>>().as_slice());
	}

	#[test]
	fn write_slice_chunks_through_a_tiny_buffer() {
		let data: Vec<u8> = (0..100).collect();

		let mut sink = buffer_sink(MIN_BUFFER_CAPACITY);
		sink.write_slice(&data).unwrap();

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.as_slice(), data.as_slice());
	}

	#[test]
	fn payloads_land_after_pending_bytes() {
		let mut sink = buffer_sink(64);
		sink.write_u8(0xc4).unwrap();
		sink.write_u8(3).unwrap();
		sink.write_payload(b"abc").unwrap();

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.as_slice(), &[0xc4, 3, b'a', b'b', b'c']);
	}

	#[test]
	fn gathered_payloads_preserve_order() {
		let mut sink = buffer_sink(64);
		sink.write_u8(0x93).unwrap();
		sink.write_payloads(&[b"first", b"second", b"third"]).unwrap();

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.as_slice(), b"\x93firstsecondthird");
	}

	#[test]
	fn vectored_gather_writes_preserve_order() {
		let mut sink = MessageSink::new(
			StreamSink::new(Vec::new()),
			Arc::new(UnpooledAllocator::new()),
			64
		)
		.expect("Sink creation expected to succeed");

		sink.write_u8(0x92).unwrap();
		sink.write_payloads(&[b"alpha", b"beta"]).unwrap();

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.into_inner(), b"\x92alphabeta");
	}

	#[test]
	fn transfer_from_routes_and_reports_short_reads() {
		let data: Vec<u8> = (0..100).collect();

		let mut sink = buffer_sink(MIN_BUFFER_CAPACITY);
		sink.write_u8(0xff).unwrap();

		let transferred = sink
			.transfer_from(&mut &data[..], 1000)
			.expect("Transfer expected to succeed");
		assert_eq!(transferred, 100, "The transfer ends when the source does");

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.as_slice()[0], 0xff);
		assert_eq!(&provider.as_slice()[1..], data.as_slice());
	}

	#[test]
	fn discard_sink_counts_bytes() {
		let mut sink = MessageSink::new(
			DiscardSink::new(),
			Arc::new(UnpooledAllocator::new()),
			MIN_BUFFER_CAPACITY
		)
		.expect("Sink creation expected to succeed");

		sink.write_slice(&[0; 123]).unwrap();
		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.bytes_discarded(), 123);
	}

	#[test]
	fn dropped_sinks_drain_their_pending_bytes() {
		let mut out = Vec::new();

		{
			let mut sink = MessageSink::new(
				StreamSink::new(&mut out),
				Arc::new(UnpooledAllocator::new()),
				64
			)
			.expect("Sink creation expected to succeed");
			sink.write_u8(0x2a).unwrap();
			// No close: the pending byte is drained when the sink drops
		}

		assert_eq!(out, [0x2a]);
	}

	#[test]
	fn too_small_buffers_are_rejected() {
		assert!(matches!(
			MessageSink::new(BufferSink::new(), Arc::new(UnpooledAllocator::new()), 4),
			Err(MpaxError::BufferTooSmall {
				capacity: 4,
				minimum: MIN_BUFFER_CAPACITY
			})
		));
	}
}
