use mpax::source::SliceSource;
use mpax::MessageReader;

fn main() {
	afl::fuzz!(|data: &[u8]| {
		// Each fuzz run has to be pretty fast. Just check that no crashes
		// happen while decoding arbitrary bytes
		let Ok(mut reader) = MessageReader::new(SliceSource::new(data)) else {
			return;
		};

		while reader.skip_value().is_ok() {}
	})
}
