//! Contains the [`PooledAllocator`], which recycles buffers across leases.

use std::array;
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use super::{BufferAllocator, ByteBuffer, LeasedBytes, LeasedString};
use crate::error::MpaxError;

/// One bucket per power of two up to `1 << 31`. Larger requests are served
/// unpooled.
const BUCKET_COUNT: usize = 32;

/// Settings that customize how a [`PooledAllocator`] leases and recycles
/// buffers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PooledAllocatorSettings {
	/// The largest byte buffer capacity the allocator will lease. Requests
	/// above it fail with [`SizeLimitExceeded`](MpaxError::SizeLimitExceeded).
	///
	/// **Default value**: unbounded.
	pub max_byte_buffer_capacity: usize,
	/// The largest string scratch capacity the allocator will lease, in
	/// bytes.
	///
	/// **Default value**: unbounded.
	pub max_string_buffer_capacity: usize,
	/// Byte buffers larger than this are leased and freed without touching
	/// the pool.
	///
	/// **Default value**: 1 MiB.
	pub max_pooled_byte_buffer_capacity: usize,
	/// String scratch buffers larger than this are leased and freed without
	/// touching the pool.
	///
	/// **Default value**: 1 MiB.
	pub max_pooled_string_buffer_capacity: usize,
	/// The aggregate capacity, in bytes, the byte buffer pool may retain.
	/// Releases that would exceed it free the buffer instead. The cap is
	/// advisory: concurrent releases may transiently exceed it.
	///
	/// **Default value**: 32 MiB.
	pub max_byte_buffer_pool_capacity: usize,
	/// The aggregate capacity, in bytes, the string scratch pool may retain.
	///
	/// **Default value**: 32 MiB.
	pub max_string_buffer_pool_capacity: usize
}

impl Default for PooledAllocatorSettings {
	fn default() -> Self {
		Self {
			max_byte_buffer_capacity: usize::MAX,
			max_string_buffer_capacity: usize::MAX,
			max_pooled_byte_buffer_capacity: 1024 * 1024,
			max_pooled_string_buffer_capacity: 1024 * 1024,
			max_byte_buffer_pool_capacity: 32 * 1024 * 1024,
			max_string_buffer_pool_capacity: 32 * 1024 * 1024
		}
	}
}

/// A [`BufferAllocator`] that retains released buffers in power-of-two
/// buckets and hands them out again on later leases, trading memory for fewer
/// allocations on busy readers and writers.
///
/// Cloning the allocator produces another handle to the same pool, so one
/// pool can back any number of readers and writers across threads. Dropped
/// leases find their way back to the pool on their own; closing the pool with
/// leases still outstanding is safe, and merely makes those leases free their
/// memory instead of recycling it.
#[derive(Debug, Clone)]
pub struct PooledAllocator {
	shared: Arc<PoolShared>
}

#[derive(Debug)]
pub(crate) struct PoolShared {
	settings: PooledAllocatorSettings,
	byte_buckets: [Mutex<Vec<ByteBuffer>>; BUCKET_COUNT],
	string_buckets: [Mutex<Vec<String>>; BUCKET_COUNT],
	pooled_byte_capacity: AtomicUsize,
	pooled_string_capacity: AtomicUsize,
	closed: AtomicBool
}

/// Recovers the guard from a poisoned bucket: a panic while holding it can
/// only have left behind a list of reusable buffers, which remains coherent.
fn lock<T>(bucket: &Mutex<T>) -> MutexGuard<'_, T> {
	bucket.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the index of the smallest power-of-two bucket whose buffers can
/// satisfy a request of `capacity` bytes.
fn request_bucket(capacity: usize) -> usize {
	let capacity = cmp::max(capacity, 1);

	(usize::BITS - (capacity - 1).leading_zeros()) as usize
}

/// Returns the bucket a buffer of `capacity` bytes belongs to on release.
/// Pooled buffers always have power-of-two capacities, so this is the exact
/// inverse of [`request_bucket`].
fn release_bucket(capacity: usize) -> usize {
	(usize::BITS - 1 - capacity.leading_zeros()) as usize
}

impl PooledAllocator {
	/// Creates a pooled allocator with default settings.
	pub fn new() -> Self {
		Self::with_settings(PooledAllocatorSettings::default())
	}

	/// Creates a pooled allocator with the specified settings.
	pub fn with_settings(settings: PooledAllocatorSettings) -> Self {
		Self {
			shared: Arc::new(PoolShared {
				settings,
				byte_buckets: array::from_fn(|_| Mutex::new(Vec::new())),
				string_buckets: array::from_fn(|_| Mutex::new(Vec::new())),
				pooled_byte_capacity: AtomicUsize::new(0),
				pooled_string_capacity: AtomicUsize::new(0),
				closed: AtomicBool::new(false)
			})
		}
	}

	/// Closes the pool, freeing every buffer it retains. Further lease
	/// requests fail with
	/// [`PooledBufferAlreadyClosed`](MpaxError::PooledBufferAlreadyClosed);
	/// leases still outstanding free their buffers when dropped. Closing an
	/// already closed pool does nothing.
	pub fn close(&self) {
		if self.shared.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		for bucket in &self.shared.byte_buckets {
			lock(bucket).clear();
		}
		for bucket in &self.shared.string_buckets {
			lock(bucket).clear();
		}

		self.shared.pooled_byte_capacity.store(0, Ordering::Relaxed);
		self.shared.pooled_string_capacity.store(0, Ordering::Relaxed);

		trace!("closed pooled buffer allocator");
	}

	#[cfg(test)]
	fn pooled_byte_capacity(&self) -> usize {
		self.shared.pooled_byte_capacity.load(Ordering::Relaxed)
	}
}

impl Default for PooledAllocator {
	fn default() -> Self {
		Self::new()
	}
}

impl BufferAllocator for PooledAllocator {
	fn byte_buffer(&self, min_capacity: usize) -> Result<LeasedBytes, MpaxError> {
		let shared = &self.shared;
		if shared.closed.load(Ordering::Acquire) {
			return Err(MpaxError::PooledBufferAlreadyClosed);
		}

		let settings = &shared.settings;
		if min_capacity > settings.max_byte_buffer_capacity {
			return Err(MpaxError::SizeLimitExceeded {
				size: min_capacity as u64,
				limit: settings.max_byte_buffer_capacity as u64
			});
		}

		let index = request_bucket(min_capacity);
		if min_capacity > settings.max_pooled_byte_buffer_capacity || index >= BUCKET_COUNT {
			return Ok(LeasedBytes::detached(ByteBuffer::with_capacity(min_capacity)));
		}

		let buffer = match lock(&shared.byte_buckets[index]).pop() {
			Some(mut buffer) => {
				shared
					.pooled_byte_capacity
					.fetch_sub(buffer.capacity(), Ordering::Relaxed);
				trace!("reusing pooled byte buffer of {} bytes", buffer.capacity());
				buffer.clear();

				buffer
			}
			None => ByteBuffer::with_capacity(1 << index)
		};

		Ok(LeasedBytes::pooled(buffer, Arc::clone(shared)))
	}

	fn string_buffer(&self, min_capacity: usize) -> Result<LeasedString, MpaxError> {
		let shared = &self.shared;
		if shared.closed.load(Ordering::Acquire) {
			return Err(MpaxError::PooledBufferAlreadyClosed);
		}

		let settings = &shared.settings;
		if min_capacity > settings.max_string_buffer_capacity {
			return Err(MpaxError::SizeLimitExceeded {
				size: min_capacity as u64,
				limit: settings.max_string_buffer_capacity as u64
			});
		}

		let index = request_bucket(min_capacity);
		if min_capacity > settings.max_pooled_string_buffer_capacity || index >= BUCKET_COUNT {
			return Ok(LeasedString::detached(String::with_capacity(min_capacity)));
		}

		let string = match lock(&shared.string_buckets[index]).pop() {
			Some(string) => {
				shared
					.pooled_string_capacity
					.fetch_sub(string.capacity(), Ordering::Relaxed);
				trace!("reusing pooled string buffer of {} bytes", string.capacity());

				string
			}
			None => String::with_capacity(1 << index)
		};

		Ok(LeasedString::pooled(string, Arc::clone(shared)))
	}

	fn max_byte_buffer_capacity(&self) -> usize {
		self.shared.settings.max_byte_buffer_capacity
	}
}

impl PoolShared {
	pub(crate) fn release_bytes(&self, buffer: ByteBuffer) {
		let capacity = buffer.capacity();
		if capacity == 0
			|| self.closed.load(Ordering::Acquire)
			|| capacity > self.settings.max_pooled_byte_buffer_capacity
		{
			return;
		}

		let pooled = self.pooled_byte_capacity.load(Ordering::Relaxed);
		if pooled.saturating_add(capacity) > self.settings.max_byte_buffer_pool_capacity {
			trace!("byte buffer pool is full, freeing a {capacity} byte buffer");
			return;
		}

		self.pooled_byte_capacity.fetch_add(capacity, Ordering::Relaxed);
		lock(&self.byte_buckets[release_bucket(capacity)]).push(buffer);
	}

	pub(crate) fn release_string(&self, mut string: String) {
		let capacity = string.capacity();
		if capacity == 0
			|| self.closed.load(Ordering::Acquire)
			|| capacity > self.settings.max_pooled_string_buffer_capacity
		{
			return;
		}

		let pooled = self.pooled_string_capacity.load(Ordering::Relaxed);
		if pooled.saturating_add(capacity) > self.settings.max_string_buffer_pool_capacity {
			trace!("string buffer pool is full, freeing a {capacity} byte buffer");
			return;
		}

		string.clear();
		self.pooled_string_capacity.fetch_add(capacity, Ordering::Relaxed);
		lock(&self.string_buckets[release_bucket(capacity)]).push(string);
	}
}
