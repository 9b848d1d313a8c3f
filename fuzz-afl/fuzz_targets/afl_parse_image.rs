#[macro_use]
extern crate afl;

use std::sync::Arc;

use machview::{ContextAddress, FileMap, Image, MemoryMap, Slide};

fn main() {
    fuzz!(|data: &[u8]| {
        let map = Arc::new(MemoryMap::from(FileMap::from_bytes(data.to_vec())));
        if let Ok(image) = Image::new("fuzz", Slide(0), 0, ContextAddress(0), map) {
            for segment in image.segments() {
                for section in segment.sections() {
                    let _ = section.cstrings();
                }
            }
            if let Some(symbols) = image.symbol_table() {
                for symbol in symbols.iter() {
                    let _ = symbols.name_of(&symbol);
                }
            }
        }
    });
}
