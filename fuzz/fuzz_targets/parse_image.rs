#![no_main]
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use machview::{ContextAddress, FileMap, Image, MemoryMap, Slide};

fuzz_target!(|data: &[u8]| {
    let map = Arc::new(MemoryMap::from(FileMap::from_bytes(data.to_vec())));
    if let Ok(image) = Image::new("fuzz", Slide(0), 0, ContextAddress(0), map) {
        for command in image.load_commands() {
            let _ = command.string();
        }
        for segment in image.segments() {
            let _ = segment.read_at(0, segment.range().size.min(64));
            for section in segment.sections() {
                let _ = section.cstrings();
                let _ = section.entry_count(image.data_model());
            }
        }
        if let Some(symbols) = image.symbol_table() {
            for symbol in symbols.iter() {
                let _ = symbols.name_of(&symbol);
            }
        }
        if let Some(indirect) = image.indirect_symbol_table() {
            for _ in indirect.iter() {}
        }
    }
});
