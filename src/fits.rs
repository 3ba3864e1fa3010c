//! Single-HDU FITS images, 32-bit float only.
//!
//! - 80-character header cards
//! - header and data both padded to 2880-byte blocks
//! - big-endian pixels, NAXIS1 (columns) varying fastest

use crate::DreError;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const BLOCK: usize = 2880;
const CARD: usize = 80;

fn card(key: &str, value: &str) -> String {
    let text = if key == "END" {
        "END".to_string()
    } else if value.starts_with('\'') {
        format!("{:<8}= {}", key, value)
    } else {
        format!("{:<8}= {:>20}", key, value)
    };
    format!("{:<width$.width$}", text, width = CARD)
}

fn string_value(s: &str) -> String {
    // Quote doubling per the standard; fixed-format strings are at least 8 wide.
    format!("'{:<8}'", s.replace('\'', "''"))
}

pub fn write_fits_image(
    path: &Path,
    image: &Array2<f32>,
    keywords: &[(&str, &str)],
) -> Result<(), DreError> {
    let (ny, nx) = image.dim();
    let mut header = String::new();
    header.push_str(&card("SIMPLE", "T"));
    header.push_str(&card("BITPIX", "-32"));
    header.push_str(&card("NAXIS", "2"));
    header.push_str(&card("NAXIS1", &nx.to_string()));
    header.push_str(&card("NAXIS2", &ny.to_string()));
    for (key, value) in keywords {
        header.push_str(&card(&key.to_uppercase(), &string_value(value)));
    }
    header.push_str(&card("END", ""));
    let padding = (BLOCK - header.len() % BLOCK) % BLOCK;
    header.push_str(&" ".repeat(padding));

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(header.as_bytes())?;
    for v in image.iter() {
        writer.write_all(&v.to_be_bytes())?;
    }
    let data_len = image.len() * 4;
    let padding = (BLOCK - data_len % BLOCK) % BLOCK;
    writer.write_all(&vec![0u8; padding])?;
    writer.flush()?;
    Ok(())
}
