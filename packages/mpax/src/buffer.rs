//! Byte buffer management: the [`ByteBuffer`] primitive, the leases handed
//! out by allocators, and the [`BufferAllocator`] implementations.
//!
//! Buffers move through two conventions, mirrored from how the sources and
//! sinks use them:
//!
//! - **Fill mode**: bytes below `position` are meaningful, the region between
//!   `position` and `limit` is free space to write into. Freshly allocated
//!   buffers, sink buffers, and source buffers in the middle of a refill are
//!   in fill mode.
//! - **Read mode**: the bytes between `position` and `limit` are meaningful
//!   and not yet consumed. [`flip`](ByteBuffer::flip) switches a filled
//!   buffer into read mode; [`compact`](ByteBuffer::compact) moves the
//!   unconsumed bytes to the front and switches back to fill mode.

use std::cmp;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::MpaxError;

mod pooled;

pub use pooled::{PooledAllocator, PooledAllocatorSettings};

/// The smallest read or write buffer capacity the codec accepts: one format
/// byte plus an 8-byte primitive, so every primitive encoding fits in the
/// buffer as a unit.
pub const MIN_BUFFER_CAPACITY: usize = 9;

/// A fixed-capacity byte buffer with `position` and `limit` cursors, used as
/// the readahead of a message source, the accumulation area of a message
/// sink, and the scratch space of payload transfers.
///
/// Multi-byte accessors are big-endian, as everything in the MessagePack wire
/// format is.
#[derive(Debug, Default)]
pub struct ByteBuffer {
	data: Box<[u8]>,
	position: usize,
	limit: usize
}

/// Implements big-endian primitive accessors over the buffer cursor.
macro_rules! primitive_accessor_impl {
	($($get:ident, $put:ident, $type:ty);+ $(;)?) => {
		$(
			pub(crate) fn $get(&mut self) -> $type {
				let size = size_of::<$type>();
				let bytes = self.data[self.position..self.position + size]
					.try_into()
					.unwrap();
				self.position += size;

				<$type>::from_be_bytes(bytes)
			}

			pub(crate) fn $put(&mut self, value: $type) {
				let bytes = value.to_be_bytes();
				self.data[self.position..self.position + bytes.len()].copy_from_slice(&bytes);
				self.position += bytes.len();
			}
		)+
	};
}

impl ByteBuffer {
	/// Creates a buffer of exactly the specified capacity, in fill mode.
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			data: vec![0; capacity].into_boxed_slice(),
			position: 0,
			limit: capacity
		}
	}

	/// Returns the total capacity of this buffer.
	pub fn capacity(&self) -> usize {
		self.data.len()
	}

	/// Returns the current position cursor.
	pub fn position(&self) -> usize {
		self.position
	}

	/// Returns the current limit cursor.
	pub fn limit(&self) -> usize {
		self.limit
	}

	/// Returns the number of bytes between the position and the limit: the
	/// unconsumed bytes in read mode, or the free space in fill mode.
	pub fn remaining(&self) -> usize {
		self.limit - self.position
	}

	/// Returns whether any bytes remain between the position and the limit.
	pub fn has_remaining(&self) -> bool {
		self.position < self.limit
	}

	/// Resets the buffer to an empty fill mode state.
	pub fn clear(&mut self) {
		self.position = 0;
		self.limit = self.data.len();
	}

	/// Switches a filled buffer to read mode: the bytes written so far become
	/// the readable region.
	pub fn flip(&mut self) {
		self.limit = self.position;
		self.position = 0;
	}

	/// Moves the unconsumed bytes of a buffer in read mode to the front and
	/// switches to fill mode, so more bytes can be appended after them.
	pub fn compact(&mut self) {
		let unconsumed = self.remaining();
		self.data.copy_within(self.position..self.limit, 0);
		self.position = unconsumed;
		self.limit = self.data.len();
	}

	/// Moves the position forward by `count` bytes, consuming them in read
	/// mode or committing them in fill mode. `count` must not exceed
	/// [`remaining`](Self::remaining).
	pub fn advance(&mut self, count: usize) {
		debug_assert!(count <= self.remaining());
		self.position += count;
	}

	/// Caps the limit, restricting how far the buffer may be filled. The new
	/// limit must not exceed the capacity.
	pub fn set_limit(&mut self, limit: usize) {
		debug_assert!(limit <= self.data.len());
		self.limit = limit;
	}

	/// Returns the bytes between the position and the limit, without
	/// consuming them.
	pub fn readable(&self) -> &[u8] {
		&self.data[self.position..self.limit]
	}

	/// Returns the free region of a buffer in fill mode. Providers read bytes
	/// into this region and then [`advance`](Self::advance) the position.
	pub fn unfilled(&mut self) -> &mut [u8] {
		&mut self.data[self.position..self.limit]
	}

	/// Returns the bytes below the position: the written prefix of a buffer
	/// in fill mode.
	pub fn filled(&self) -> &[u8] {
		&self.data[..self.position]
	}

	pub(crate) fn peek_u8(&self) -> u8 {
		self.data[self.position]
	}

	pub(crate) fn get_u8(&mut self) -> u8 {
		let value = self.data[self.position];
		self.position += 1;

		value
	}

	pub(crate) fn put_u8(&mut self, value: u8) {
		self.data[self.position] = value;
		self.position += 1;
	}

	pub(crate) fn get_slice(&mut self, dest: &mut [u8]) {
		dest.copy_from_slice(&self.data[self.position..self.position + dest.len()]);
		self.position += dest.len();
	}

	pub(crate) fn put_slice(&mut self, source: &[u8]) {
		self.data[self.position..self.position + source.len()].copy_from_slice(source);
		self.position += source.len();
	}

	primitive_accessor_impl! {
		get_u16, put_u16, u16;
		get_u32, put_u32, u32;
		get_u64, put_u64, u64;
		get_i8, put_i8, i8;
		get_i16, put_i16, i16;
		get_i32, put_i32, i32;
		get_i64, put_i64, i64;
		get_f32, put_f32, f32;
		get_f64, put_f64, f64;
	}
}

/// A byte buffer leased from a [`BufferAllocator`]. Dropping the lease
/// returns the buffer to the pool it came from, if any; otherwise the memory
/// is simply freed.
#[derive(Debug)]
pub struct LeasedBytes {
	buffer: ByteBuffer,
	pool: Option<Arc<pooled::PoolShared>>
}

impl LeasedBytes {
	/// Wraps a buffer that belongs to no pool. Dropping the lease frees it.
	pub fn detached(buffer: ByteBuffer) -> Self {
		Self { buffer, pool: None }
	}

	/// A detached lease of a zero-capacity buffer, used as a placeholder when
	/// swapping buffers in place.
	pub(crate) fn empty() -> Self {
		Self::detached(ByteBuffer::default())
	}

	pub(crate) fn pooled(buffer: ByteBuffer, pool: Arc<pooled::PoolShared>) -> Self {
		Self {
			buffer,
			pool: Some(pool)
		}
	}
}

impl Deref for LeasedBytes {
	type Target = ByteBuffer;

	fn deref(&self) -> &ByteBuffer {
		&self.buffer
	}
}

impl DerefMut for LeasedBytes {
	fn deref_mut(&mut self) -> &mut ByteBuffer {
		&mut self.buffer
	}
}

impl Drop for LeasedBytes {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.take() {
			pool.release_bytes(mem::take(&mut self.buffer));
		}
	}
}

/// A string leased from a [`BufferAllocator`], used as decode scratch by the
/// streaming string decoder. Dropping the lease clears the string and returns
/// its allocation to the pool it came from, if any.
#[derive(Debug)]
pub struct LeasedString {
	string: String,
	pool: Option<Arc<pooled::PoolShared>>
}

impl LeasedString {
	/// Wraps a string that belongs to no pool. Dropping the lease frees it.
	pub fn detached(string: String) -> Self {
		Self { string, pool: None }
	}

	pub(crate) fn pooled(string: String, pool: Arc<pooled::PoolShared>) -> Self {
		Self {
			string,
			pool: Some(pool)
		}
	}
}

impl Deref for LeasedString {
	type Target = String;

	fn deref(&self) -> &String {
		&self.string
	}
}

impl DerefMut for LeasedString {
	fn deref_mut(&mut self) -> &mut String {
		&mut self.string
	}
}

impl Drop for LeasedString {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.take() {
			pool.release_string(mem::take(&mut self.string));
		}
	}
}

/// Defines the contract for allocators that lease the buffers backing message
/// sources, sinks and codecs.
///
/// Allocators are shared between readers and writers through
/// `Arc<dyn BufferAllocator>` and must therefore be safe to call from
/// multiple threads at once.
pub trait BufferAllocator: Send + Sync {
	/// Leases a byte buffer whose capacity is at least `min_capacity`, in
	/// fill mode.
	///
	/// Fails with [`SizeLimitExceeded`](MpaxError::SizeLimitExceeded) if the
	/// request exceeds the allocator's configured maximum capacity.
	fn byte_buffer(&self, min_capacity: usize) -> Result<LeasedBytes, MpaxError>;

	/// Leases an empty string whose capacity is at least `min_capacity`
	/// bytes, for use as streaming decode scratch.
	///
	/// Fails with [`SizeLimitExceeded`](MpaxError::SizeLimitExceeded) if the
	/// request exceeds the allocator's configured maximum capacity.
	fn string_buffer(&self, min_capacity: usize) -> Result<LeasedString, MpaxError>;

	/// Returns the largest byte buffer capacity this allocator will lease.
	fn max_byte_buffer_capacity(&self) -> usize;

	/// Ensures that a buffer in fill mode has at least `extra` bytes of free
	/// space, leasing a larger buffer and copying the written prefix over if
	/// it does not.
	///
	/// The replacement buffer's capacity is the larger of what the request
	/// needs and twice the old capacity, capped to
	/// [`max_byte_buffer_capacity`](Self::max_byte_buffer_capacity); requests
	/// that do not fit even then fail with
	/// [`SizeLimitExceeded`](MpaxError::SizeLimitExceeded). The old lease is
	/// released.
	fn ensure_remaining(&self, buffer: LeasedBytes, extra: usize) -> Result<LeasedBytes, MpaxError> {
		if buffer.remaining() >= extra {
			return Ok(buffer);
		}

		let needed = buffer.position().saturating_add(extra);
		let target = cmp::max(
			needed,
			cmp::min(
				buffer.capacity().saturating_mul(2),
				self.max_byte_buffer_capacity()
			)
		);

		let mut grown = self.byte_buffer(target)?;
		grown.put_slice(buffer.filled());

		Ok(grown)
	}
}

/// Settings that bound what an [`UnpooledAllocator`] will hand out.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct UnpooledAllocatorSettings {
	/// The largest byte buffer capacity the allocator will lease. Requests
	/// above it fail with [`SizeLimitExceeded`](MpaxError::SizeLimitExceeded).
	///
	/// **Default value**: unbounded.
	pub max_byte_buffer_capacity: usize,
	/// The largest string scratch capacity the allocator will lease, in
	/// bytes.
	///
	/// **Default value**: unbounded.
	pub max_string_buffer_capacity: usize
}

impl Default for UnpooledAllocatorSettings {
	fn default() -> Self {
		Self {
			max_byte_buffer_capacity: usize::MAX,
			max_string_buffer_capacity: usize::MAX
		}
	}
}

/// A stateless [`BufferAllocator`] that allocates every lease fresh and frees
/// it when the lease is dropped.
#[derive(Debug, Default)]
pub struct UnpooledAllocator {
	settings: UnpooledAllocatorSettings
}

impl UnpooledAllocator {
	/// Creates an unpooled allocator with default settings.
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates an unpooled allocator with the specified settings.
	pub fn with_settings(settings: UnpooledAllocatorSettings) -> Self {
		Self { settings }
	}
}

impl BufferAllocator for UnpooledAllocator {
	fn byte_buffer(&self, min_capacity: usize) -> Result<LeasedBytes, MpaxError> {
		if min_capacity > self.settings.max_byte_buffer_capacity {
			return Err(MpaxError::SizeLimitExceeded {
				size: min_capacity as u64,
				limit: self.settings.max_byte_buffer_capacity as u64
			});
		}

		Ok(LeasedBytes::detached(ByteBuffer::with_capacity(min_capacity)))
	}

	fn string_buffer(&self, min_capacity: usize) -> Result<LeasedString, MpaxError> {
		if min_capacity > self.settings.max_string_buffer_capacity {
			return Err(MpaxError::SizeLimitExceeded {
				size: min_capacity as u64,
				limit: self.settings.max_string_buffer_capacity as u64
			});
		}

		Ok(LeasedString::detached(String::with_capacity(min_capacity)))
	}

	fn max_byte_buffer_capacity(&self) -> usize {
		self.settings.max_byte_buffer_capacity
	}
}
