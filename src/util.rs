/// Copy `value` into a NUL-padded fixed-width field, truncating if it is too long
pub fn to_fixed_field<const N: usize>(value: &str) -> [u8; N] {
    let mut field = [0u8; N];
    let bytes = value.as_bytes();
    let len = bytes.len().min(N);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Read a NUL-padded fixed-width field; a field filled to its width has no terminator
pub fn from_fixed_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
#[path = "../tests/common/mod.rs"]
pub(crate) mod tests;
