use rand::Rng;

const HEX_CHARACTERS: &[u8; 16] = b"0123456789ABCDEF";

/// Random upper-case hex groups of four digits joined by `.`,
/// e.g. `hex_quads(2)` yields `"09AF.771C"`.
pub fn hex_quads(count: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut buf = String::with_capacity(count * 5);
    for i in 0..count {
        if i > 0 {
            buf.push('.');
        }
        for _ in 0..4 {
            let idx = rng.gen_range(0..HEX_CHARACTERS.len());
            buf.push(HEX_CHARACTERS[idx] as char);
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_quads_shape() {
        let v = hex_quads(2);
        assert_eq!(v.len(), 9);
        assert_eq!(&v[4..5], ".");
        assert!(v
            .chars()
            .filter(|c| *c != '.')
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(hex_quads(0), "");
    }
}
