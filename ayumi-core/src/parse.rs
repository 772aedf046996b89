//! パース関連のユーティリティ関数

use crate::Result;
use ayumi_target::AddressRange;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use ayumi_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e)),
        None => s
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e)),
    }
}

/// `開始..終了` 形式のアドレス範囲をパース
///
/// # Examples
/// ```
/// use ayumi_core::parse::parse_range;
///
/// let range = parse_range("0x10..0x20").unwrap();
/// assert!(range.contains(0x18));
/// ```
pub fn parse_range(s: &str) -> Result<AddressRange> {
    let (start, end) = s
        .split_once("..")
        .ok_or_else(|| anyhow::anyhow!("Invalid range '{}': expected START..END", s))?;
    let start = parse_address(start)?;
    let end = parse_address(end)?;
    if start >= end {
        anyhow::bail!("Invalid range '{}': start must be below end", s);
    }
    Ok(AddressRange::new(start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_hex() {
        assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
        assert_eq!(parse_address("0XABCD").unwrap(), 0xabcd);
    }

    #[test]
    fn test_parse_address_dec() {
        assert_eq!(parse_address("1234").unwrap(), 1234);
    }

    #[test]
    fn test_parse_address_invalid() {
        assert!(parse_address("xyz").is_err());
        assert!(parse_address("0xghij").is_err());
    }

    #[test]
    fn test_parse_range() {
        let range = parse_range("0x400000..0x400010").unwrap();
        assert_eq!(range, AddressRange::new(0x40_0000, 0x40_0010));
        assert!(parse_range("0x10").is_err());
        assert!(parse_range("0x20..0x10").is_err());
    }
}
