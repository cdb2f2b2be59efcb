//! Contains the error type shared by every fallible operation in this crate.

use std::io;
use std::str::Utf8Error;

use thiserror::Error;

use crate::format::MessageType;

/// Represents an error that may occur while encoding or decoding a MessagePack
/// stream, or while managing the buffers that back it.
///
/// The codec never recovers from errors on its own: after a decoding or
/// encoding error, the position of the underlying byte stream is unspecified,
/// and callers are expected to close and discard both sides of the stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MpaxError {
	/// The underlying endpoint reported an I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
	/// More bytes were needed, but the endpoint signaled end of input.
	#[error("Unexpected end of input: needed {needed} more byte(s)")]
	UnexpectedEof {
		/// How many bytes were still needed when the input ended.
		needed: usize
	},
	/// A format byte that the MessagePack specification never assigns (`0xc1`),
	/// or a format byte that may not appear in the current position, was read.
	#[error("Invalid format byte: 0x{format:02x}")]
	InvalidFormat {
		/// The offending format byte.
		format: u8
	},
	/// A value of one logical type was requested, but the next value on the
	/// stream is of another.
	#[error("Type mismatch: format byte 0x{format:02x} does not encode a {requested} value")]
	TypeMismatch {
		/// The format byte that was actually read.
		format: u8,
		/// The logical type the caller requested.
		requested: MessageType
	},
	/// An integer value was read successfully, but does not fit the width the
	/// caller requested. The encoded bytes are consumed regardless.
	#[error("Integer value {value} does not fit the requested {requested}")]
	IntegerOverflow {
		/// The decoded integer value.
		value: i128,
		/// The name of the requested integer type.
		requested: &'static str
	},
	/// A length or capacity exceeds a configured or wire-format limit.
	#[error("Size {size} exceeds the limit of {limit}")]
	SizeLimitExceeded {
		/// The requested or decoded size.
		size: u64,
		/// The limit that was exceeded.
		limit: u64
	},
	/// A timestamp extension value has a payload length other than 4, 8 or
	/// 12 bytes.
	#[error("Invalid timestamp extension payload length: {0} (expected 4, 8 or 12)")]
	InvalidTimestampLength(u32),
	/// A timestamp was requested, but the extension value on the stream is of
	/// another extension type.
	#[error("Extension type {0} is not a timestamp (expected -1)")]
	TimestampTypeMismatch(i8),
	/// A timestamp carries a nanosecond component outside `0..=999_999_999`.
	#[error("Timestamp nanoseconds {0} are out of range")]
	InvalidTimestampNanos(u32),
	/// A string payload is not well-formed UTF-8, or ends in the middle of a
	/// code point.
	#[error("String payload is not valid UTF-8: {0}")]
	StringDecoding(Utf8Error),
	/// An identifier is too large to pass through the write buffer.
	#[error("Identifier of {size} bytes exceeds the write buffer capacity of {capacity} bytes")]
	IdentifierTooLarge {
		/// The identifier's UTF-8 length.
		size: usize,
		/// The write buffer capacity it would have to fit in.
		capacity: usize
	},
	/// The underlying endpoint is in non-blocking mode. Only blocking
	/// endpoints are supported by this codec.
	#[error("The endpoint would block; only blocking endpoints are supported")]
	NonBlockingEndpointDetected,
	/// A buffer was requested from a pooled allocator that was already closed.
	#[error("The buffer pool was already closed")]
	PooledBufferAlreadyClosed,
	/// A read or write buffer was configured below the minimum capacity
	/// required to hold a format byte plus an 8-byte primitive.
	#[error("Buffer capacity {capacity} is below the required minimum of {minimum}")]
	BufferTooSmall {
		/// The configured capacity.
		capacity: usize,
		/// The smallest capacity the codec accepts.
		minimum: usize
	}
}
