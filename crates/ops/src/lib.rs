use serde::Serialize;
use std::io::Write;

pub mod tracing;

/// Append one canonical JSON serialization of `value` to `writer`,
/// newline-terminated. This is the framing of the broker's message log and
/// of every line on the wire.
pub fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: Write,
    T: Serialize + ?Sized,
{
    let mut buf = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    buf.push(b'\n');
    writer.write_all(&buf)
}
