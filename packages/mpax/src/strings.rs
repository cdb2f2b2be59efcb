//! Streaming string codecs and deduplicating identifier codecs.
//!
//! The [`MessageEncoder`] and [`MessageDecoder`] traits are the seams through
//! which [`MessageWriter`](crate::writer::MessageWriter) and
//! [`MessageReader`](crate::reader::MessageReader) convert between Rust
//! strings and MessagePack string values. The default implementations are
//! [`StringEncoder`] and [`StringDecoder`], which stream payloads through the
//! write and read buffers without ever materializing them twice, and
//! [`IdentifierEncoder`] and [`IdentifierDecoder`], which additionally keep a
//! bounded, shareable cache of frequently repeated short strings such as map
//! keys.

use std::cmp;
use std::str;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use log::debug;

use crate::error::MpaxError;
use crate::format;
use crate::sink::{MessageSink, SinkProvider};
use crate::source::{MessageSource, SourceProvider};

/// The default bound, in bytes, on the memory retained by an identifier
/// cache.
const DEFAULT_MAX_CACHE_SIZE: usize = 1024 * 1024;

/// Defines the contract for encoding a value of type `T` onto a message
/// sink.
pub trait MessageEncoder<T: ?Sized> {
	/// Encodes `value`, including its header, onto `sink`.
	fn encode<P: SinkProvider>(
		&mut self,
		value: &T,
		sink: &mut MessageSink<P>
	) -> Result<(), MpaxError>;
}

/// Defines the contract for decoding a value of type `T` from `length`
/// payload bytes at a message source's current position.
pub trait MessageDecoder<T> {
	/// Decodes a value from exactly `length` payload bytes. The header has
	/// already been consumed by the caller.
	fn decode<P: SourceProvider>(
		&mut self,
		source: &mut MessageSource<P>,
		length: usize
	) -> Result<T, MpaxError>;
}

/// The default string encoder: writes the narrowest exact header, then the
/// UTF-8 payload.
///
/// Rust strings know their UTF-8 byte length up front, so no worst-case
/// header sizing or post-encode patching is ever needed. Payloads larger than
/// the write buffer are passed through to the provider instead of being
/// copied through the buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringEncoder;

impl MessageEncoder<str> for StringEncoder {
	fn encode<P: SinkProvider>(
		&mut self,
		value: &str,
		sink: &mut MessageSink<P>
	) -> Result<(), MpaxError> {
		let length = value.len();
		if length > i32::MAX as usize {
			return Err(MpaxError::SizeLimitExceeded {
				size: length as u64,
				limit: i32::MAX as u64
			});
		}

		sink.write_slice(&format::str_header(length as u32))?;
		if length > sink.buffer_capacity() {
			sink.write_payload(value.as_bytes())
		} else {
			sink.write_slice(value.as_bytes())
		}
	}
}

/// The default string decoder: streams the payload through the read buffer,
/// validating it as UTF-8 chunk by chunk, into a scratch string leased from
/// the source's allocator.
///
/// A code point may straddle a buffer refill boundary; the decoder detects
/// the incomplete suffix, pulls in more bytes, and resumes. Payloads that end
/// in the middle of a code point, and payloads with malformed sequences, fail
/// with [`StringDecoding`](MpaxError::StringDecoding).
#[derive(Debug, Clone)]
pub struct StringDecoder {
	max_length: usize
}

impl StringDecoder {
	/// Creates a string decoder that rejects payloads longer than
	/// `max_length` bytes with
	/// [`SizeLimitExceeded`](MpaxError::SizeLimitExceeded).
	pub fn new(max_length: usize) -> Self {
		Self { max_length }
	}
}

impl Default for StringDecoder {
	/// The default decoder accepts any length the wire format can declare.
	fn default() -> Self {
		Self::new(i32::MAX as usize)
	}
}

impl MessageDecoder<String> for StringDecoder {
	fn decode<P: SourceProvider>(
		&mut self,
		source: &mut MessageSource<P>,
		length: usize
	) -> Result<String, MpaxError> {
		if length > self.max_length {
			return Err(MpaxError::SizeLimitExceeded {
				size: length as u64,
				limit: self.max_length as u64
			});
		}
		if length == 0 {
			return Ok(String::new());
		}

		let mut scratch = source.allocator().string_buffer(length)?;

		let mut pending = length;
		while pending > 0 {
			source.ensure_remaining(1)?;

			let readahead = source.readahead();
			let chunk_length = cmp::min(pending, readahead.len());
			let (text, partial) = match str::from_utf8(&readahead[..chunk_length]) {
				Ok(text) => (text, 0),
				Err(error) if error.error_len().is_some() => {
					return Err(MpaxError::StringDecoding(error));
				}
				// The payload itself ends in the middle of a code point
				Err(error) if chunk_length == pending => {
					return Err(MpaxError::StringDecoding(error));
				}
				// A code point straddles the readahead boundary; decode up to
				// it and pull the rest in below. This prefix revalidation
				// cannot fail
				Err(error) => (
					str::from_utf8(&readahead[..error.valid_up_to()])
						.map_err(MpaxError::StringDecoding)?,
					chunk_length - error.valid_up_to()
				)
			};

			scratch.push_str(text);
			let consumed = text.len();
			source.consume(consumed);
			pending -= consumed;

			if partial > 0 {
				source.ensure_remaining(partial + 1)?;
			}
		}

		Ok(String::from(scratch.as_str()))
	}
}

/// Recovers the guard from a poisoned cache: a panic while holding it can
/// only have left behind cached entries, which remain coherent.
fn lock<T>(cache: &Mutex<T>) -> MutexGuard<'_, T> {
	cache.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct EncoderCache {
	entries: IndexMap<Box<str>, Box<[u8]>>,
	size: usize
}

/// An encoder for identifiers: short strings that recur many times in a
/// stream, such as the keys of schema-like maps.
///
/// The first encounter of an identifier encodes its complete wire form
/// (header plus payload) and caches it; later encounters write the cached
/// bytes directly. The cache is bounded: when inserting an entry would push
/// the retained memory past the configured maximum, the whole cache is
/// cleared and filled anew. This codec does not optimize for overflowing
/// workloads, but it does not fail on them either.
///
/// Cloning the encoder produces another handle to the same cache, which is
/// safe to share across writers and threads.
#[derive(Debug, Clone)]
pub struct IdentifierEncoder {
	cache: Arc<Mutex<EncoderCache>>,
	max_cache_size: usize
}

impl IdentifierEncoder {
	/// Creates an identifier encoder whose cache retains at most
	/// `max_cache_size` bytes.
	pub fn new(max_cache_size: usize) -> Self {
		Self {
			cache: Arc::new(Mutex::new(EncoderCache::default())),
			max_cache_size
		}
	}
}

impl Default for IdentifierEncoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_CACHE_SIZE)
	}
}

impl MessageEncoder<str> for IdentifierEncoder {
	fn encode<P: SinkProvider>(
		&mut self,
		value: &str,
		sink: &mut MessageSink<P>
	) -> Result<(), MpaxError> {
		if value.len() > sink.buffer_capacity() {
			return Err(MpaxError::IdentifierTooLarge {
				size: value.len(),
				capacity: sink.buffer_capacity()
			});
		}

		let mut cache = lock(&self.cache);
		if let Some(encoded) = cache.entries.get(value) {
			return sink.write_slice(encoded);
		}

		let mut encoded = Vec::with_capacity(5 + value.len());
		encoded.extend_from_slice(&format::str_header(value.len() as u32));
		encoded.extend_from_slice(value.as_bytes());
		let encoded = encoded.into_boxed_slice();

		// Both the key and the wire form are retained
		let entry_size = value.len() + encoded.len();
		if cache.size + entry_size > self.max_cache_size {
			debug!(
				"identifier encoder cache exceeded {} bytes, clearing it",
				self.max_cache_size
			);
			cache.entries.clear();
			cache.size = 0;
		}

		sink.write_slice(&encoded)?;
		cache.size += entry_size;
		cache.entries.insert(Box::from(value), encoded);

		Ok(())
	}
}

#[derive(Debug, Default)]
struct DecoderCache {
	entries: IndexMap<Box<[u8]>, Arc<str>>,
	size: usize
}

/// A decoder for identifiers, the read-side counterpart of
/// [`IdentifierEncoder`].
///
/// The first encounter of an identifier's byte sequence decodes and caches
/// it; later encounters reuse the cached string without allocating. The
/// cache bound and clearing behavior match the encoder's.
///
/// Cloning the decoder produces another handle to the same cache, which is
/// safe to share across readers and threads.
#[derive(Debug, Clone)]
pub struct IdentifierDecoder {
	cache: Arc<Mutex<DecoderCache>>,
	max_cache_size: usize
}

impl IdentifierDecoder {
	/// Creates an identifier decoder whose cache retains at most
	/// `max_cache_size` bytes.
	pub fn new(max_cache_size: usize) -> Self {
		Self {
			cache: Arc::new(Mutex::new(DecoderCache::default())),
			max_cache_size
		}
	}
}

impl Default for IdentifierDecoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_CACHE_SIZE)
	}
}

impl MessageDecoder<Arc<str>> for IdentifierDecoder {
	fn decode<P: SourceProvider>(
		&mut self,
		source: &mut MessageSource<P>,
		length: usize
	) -> Result<Arc<str>, MpaxError> {
		// Identifiers are short; pull the whole payload into the readahead
		source.ensure_remaining(length)?;

		let mut cache = lock(&self.cache);
		if let Some(value) = cache.entries.get(&source.readahead()[..length]) {
			let value = Arc::clone(value);
			source.consume(length);

			return Ok(value);
		}

		let text =
			str::from_utf8(&source.readahead()[..length]).map_err(MpaxError::StringDecoding)?;
		let value: Arc<str> = Arc::from(text);
		let key: Box<[u8]> = Box::from(&source.readahead()[..length]);
		source.consume(length);

		let entry_size = length * 2;
		if cache.size + entry_size > self.max_cache_size {
			debug!(
				"identifier decoder cache exceeded {} bytes, clearing it",
				self.max_cache_size
			);
			cache.entries.clear();
			cache.size = 0;
		}

		cache.size += entry_size;
		cache.entries.insert(key, Arc::clone(&value));

		Ok(value)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::buffer::{UnpooledAllocator, MIN_BUFFER_CAPACITY};
	use crate::sink::BufferSink;
	use crate::source::SliceSource;

	fn sink(capacity: usize) -> MessageSink<BufferSink> {
		MessageSink::new(BufferSink::new(), Arc::new(UnpooledAllocator::new()), capacity)
			.expect("Sink creation expected to succeed")
	}

	fn source(data: &[u8]) -> MessageSource<SliceSource<'_>> {
		MessageSource::new(
			SliceSource::new(data),
			Arc::new(UnpooledAllocator::new()),
			MIN_BUFFER_CAPACITY
		)
		.expect("Source creation expected to succeed")
	}

	#[test]
	fn encoding_hello_produces_the_expected_bytes() {
		let mut sink = sink(64);
		StringEncoder.encode("hello", &mut sink).unwrap();

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(provider.as_slice(), &[0xa5, 0x68, 0x65, 0x6c, 0x6c, 0x6f]);
	}

	#[test]
	fn long_strings_pass_through_the_buffer() {
		let long = "x".repeat(100);

		let mut sink = sink(MIN_BUFFER_CAPACITY);
		StringEncoder.encode(long.as_str(), &mut sink).unwrap();

		let provider = sink.into_provider().expect("Teardown expected to succeed");
		assert_eq!(&provider.as_slice()[..2], &[0xd9, 100]);
		assert_eq!(&provider.as_slice()[2..], long.as_bytes());
	}

	#[test]
	fn multibyte_code_points_survive_refill_boundaries() {
		// Three- and four-byte code points, decoded through a 9-byte buffer,
		// are guaranteed to straddle refills somewhere
		let text = "καλημέρα κόσμε 🌍🌍🌍";
		let payload = text.as_bytes();

		let decoded = StringDecoder::default()
			.decode(&mut source(payload), payload.len())
			.expect("Decoding expected to succeed");

		assert_eq!(decoded, text);
	}

	#[test]
	fn malformed_utf8_is_rejected() {
		let payload = [b'a', 0xff, b'b'];

		assert!(matches!(
			StringDecoder::default().decode(&mut source(&payload), payload.len()),
			Err(MpaxError::StringDecoding(_))
		));
	}

	#[test]
	fn payloads_truncating_a_code_point_are_rejected() {
		// The first two bytes of a three-byte code point
		let payload = &"€".as_bytes()[..2];

		assert!(matches!(
			StringDecoder::default().decode(&mut source(payload), payload.len()),
			Err(MpaxError::StringDecoding(_))
		));
	}

	#[test]
	fn input_ending_mid_string_is_detected() {
		let payload = b"abc";

		assert!(matches!(
			StringDecoder::default().decode(&mut source(payload), 10),
			Err(MpaxError::UnexpectedEof { .. })
		));
	}

	#[test]
	fn string_length_limit_is_enforced() {
		assert!(matches!(
			StringDecoder::new(5).decode(&mut source(b"too long"), 8),
			Err(MpaxError::SizeLimitExceeded { size: 8, limit: 5 })
		));
	}

	#[test]
	fn identifier_encoder_reuses_cached_wire_forms() {
		let mut encoder = IdentifierEncoder::default();

		let mut first = sink(64);
		encoder.encode("name", &mut first).unwrap();
		let first = first.into_provider().expect("Teardown expected to succeed");

		// A shared clone hits the same cache
		let mut second = sink(64);
		encoder.clone().encode("name", &mut second).unwrap();
		let second = second.into_provider().expect("Teardown expected to succeed");

		assert_eq!(first.as_slice(), &[0xa4, b'n', b'a', b'm', b'e']);
		assert_eq!(first.as_slice(), second.as_slice());
	}

	#[test]
	fn identifier_cache_clears_wholesale_on_overflow() {
		// Each entry retains 2 * 4 bytes of content plus the header byte
		let mut encoder = IdentifierEncoder::new(20);

		let mut out = sink(64);
		encoder.encode("aaaa", &mut out).unwrap();
		encoder.encode("bbbb", &mut out).unwrap();
		// This insert overflows the bound and clears the cache first
		encoder.encode("cccc", &mut out).unwrap();

		let cache = lock(&encoder.cache);
		assert_eq!(cache.entries.len(), 1, "Overflow should clear, then refill");
		assert!(cache.entries.contains_key("cccc"));
	}

	#[test]
	fn oversized_identifiers_are_rejected() {
		let mut out = sink(MIN_BUFFER_CAPACITY);

		assert!(matches!(
			IdentifierEncoder::default().encode("an identifier longer than the buffer", &mut out),
			Err(MpaxError::IdentifierTooLarge { .. })
		));
	}

	#[test]
	fn identifier_decoder_returns_the_cached_instance() {
		let mut decoder = IdentifierDecoder::default();

		let first = decoder
			.decode(&mut source(b"name"), 4)
			.expect("Decoding expected to succeed");
		let second = decoder
			.decode(&mut source(b"name"), 4)
			.expect("Decoding expected to succeed");

		assert_eq!(&*first, "name");
		assert!(
			Arc::ptr_eq(&first, &second),
			"The cache hit should reuse the same allocation"
		);
	}

	#[test]
	fn identifier_decoder_rejects_malformed_utf8() {
		assert!(matches!(
			IdentifierDecoder::default().decode(&mut source(&[0xff, 0xfe]), 2),
			Err(MpaxError::StringDecoding(_))
		));
	}
}
