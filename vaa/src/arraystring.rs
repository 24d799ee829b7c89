//! Fixed-width 32 byte strings, right padded with zeroes on the wire.

use std::io::{self, Read, Write};

use bstr::BString;

pub fn read<R: Read>(r: &mut R) -> io::Result<BString> {
    let mut buf = [0u8; 32];
    r.read_exact(&mut buf)?;

    let end = buf.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    Ok(BString::from(&buf[..end]))
}

pub fn write<W: Write>(w: &mut W, value: &[u8]) -> io::Result<()> {
    let l = value.len();
    if l > 32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("value is too large ({l} bytes); max 32"),
        ));
    }

    w.write_all(value)?;
    w.write_all(&[0u8; 32][..32 - l])
}
