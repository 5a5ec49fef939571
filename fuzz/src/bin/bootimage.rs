// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use bootpack::{
        format::{args::ArgumentMap, image::BootImage},
        stream::FromReader,
    };
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let reader = Cursor::new(data);
                if let Ok(image) = BootImage::from_reader(reader) {
                    let _ = ArgumentMap::capture(&image.header);
                    let _ = image.certificates();
                    let _ = image.to_bytes();
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
