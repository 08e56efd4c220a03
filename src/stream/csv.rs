//! Minimal CSV encoding with QUOTE_NONNUMERIC semantics: numeric values are
//! written bare, everything else (including the header and NULLs) is
//! double-quoted, with embedded quotes doubled. Lines end with `\n`.

/// One CSV output value, classified by the column's Postgres type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Null,
    Number(String),
    Text(String),
}

pub fn write_header(out: &mut Vec<u8>, names: &[String]) {
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        write_quoted(out, name);
    }
    out.push(b'\n');
}

pub fn write_row(out: &mut Vec<u8>, fields: &[Field]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        match field {
            Field::Null => out.extend_from_slice(b"\"\""),
            Field::Number(value) => out.extend_from_slice(value.as_bytes()),
            Field::Text(value) => write_quoted(out, value),
        }
    }
    out.push(b'\n');
}

fn write_quoted(out: &mut Vec<u8>, value: &str) {
    out.push(b'"');
    for byte in value.bytes() {
        if byte == b'"' {
            out.push(b'"');
        }
        out.push(byte);
    }
    out.push(b'"');
}
