//! mpax is a buffered, streaming codec for the [MessagePack] binary
//! serialization format. It reads and writes MessagePack values against
//! arbitrary byte-oriented endpoints, one value at a time, without ever
//! materializing a document tree.
//!
//! # Readers and writers
//!
//! The entry points are [`MessageWriter`], which encodes values onto a
//! [`SinkProvider`](sink::SinkProvider), and [`MessageReader`], which decodes
//! values from a [`SourceProvider`](source::SourceProvider). Providers adapt
//! the codec to concrete endpoints: blocking [`Read`](std::io::Read) and
//! [`Write`](std::io::Write) streams ([`StreamSource`](source::StreamSource),
//! [`StreamSink`](sink::StreamSink)), in-memory buffers
//! ([`SliceSource`](source::SliceSource), [`BufferSink`](sink::BufferSink)),
//! and degenerate endpoints for testing and size measurement
//! ([`EmptySource`](source::EmptySource), [`DiscardSink`](sink::DiscardSink)).
//!
//! Writers always select the smallest encoding that represents a value
//! exactly, so equal values produce identical bytes no matter which typed
//! write emitted them. Readers accept any integer encoding whose value fits
//! the requested width and classify everything else through
//! [`next_type`](MessageReader::next_type).
//!
//! Values are framed, not delimited: after writing an array, map, string,
//! binary or extension header, the caller must supply exactly the announced
//! number of child values or payload bytes before the next value. The same
//! holds symmetrically for readers, where [`skip_value`](MessageReader::skip_value)
//! can structurally discard any complete value.
//!
//! # Buffering
//!
//! Each reader and writer owns one buffer leased from a
//! [`BufferAllocator`](buffer::BufferAllocator). The default
//! [`UnpooledAllocator`](buffer::UnpooledAllocator) allocates fresh buffers;
//! a [`PooledAllocator`](buffer::PooledAllocator) may be shared across any
//! number of readers, writers and threads to recycle buffers instead.
//! Payloads larger than the buffer are passed through to the endpoint
//! directly rather than copied through it.
//!
//! # Logging
//!
//! This crate uses the [`log`](https://crates.io/crates/log) crate for
//! diagnostic messages about buffer pooling and cache behavior. Executables
//! can customize the verbosity of this logging, and even compile it out, as
//! explained in the `log` crate documentation.
//!
//! # Example
//!
//! ```
//! # fn main() -> Result<(), mpax::MpaxError> {
//! use mpax::{MessageReader, MessageWriter};
//! use mpax::sink::BufferSink;
//! use mpax::source::SliceSource;
//!
//! let mut writer = MessageWriter::new(BufferSink::new())?;
//! writer.write_array_header(3)?;
//! writer.write_str("temperature")?;
//! writer.write_i32(-7)?;
//! writer.write_bool(true)?;
//! let encoded = writer.into_provider()?.into_vec();
//!
//! let mut reader = MessageReader::new(SliceSource::new(&encoded))?;
//! assert_eq!(reader.read_array_header()?, 3);
//! assert_eq!(reader.read_str()?, "temperature");
//! assert_eq!(reader.read_i32()?, -7);
//! assert!(reader.read_bool()?);
//! # Ok(())
//! # }
//! ```
//!
//! [MessagePack]: https://github.com/msgpack/msgpack/blob/master/spec.md

#![forbid(unsafe_code)]
#![forbid(unsafe_op_in_unsafe_fn)]
#![forbid(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]
#![deny(non_ascii_idents)]
#![deny(clippy::print_stdout)]
#![deny(clippy::unimplemented)]
#![warn(explicit_outlives_requirements)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(unused_import_braces)]
#![warn(unused_qualifications)]
#![warn(variant_size_differences)]
#![warn(clippy::empty_enum)]
#![warn(clippy::enum_glob_use)]
#![warn(clippy::float_cmp_const)]
#![warn(clippy::invalid_upcast_comparisons)]
#![warn(clippy::multiple_inherent_impl)]
#![warn(clippy::use_self)]
#![warn(clippy::used_underscore_binding)]
#![warn(clippy::redundant_feature_names)]

pub use error::MpaxError;
pub use format::MessageType;
#[doc(inline)]
pub use reader::{ExtensionHeader, MessageReader, ReaderSettings};
pub use timestamp::Timestamp;
#[doc(inline)]
pub use writer::{MessageWriter, WriterSettings};

pub mod buffer;
mod error;
pub mod format;
pub mod reader;
pub mod sink;
pub mod source;
pub mod strings;
mod timestamp;
pub mod writer;
